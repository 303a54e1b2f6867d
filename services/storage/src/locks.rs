//! Per-dataset run slots.
//!
//! Each dataset has at most one pipeline run at a time. A slot pairs the
//! run lock with the cancellation token of the current run so that
//! deactivation and deletion can stop an in-flight run and then wait for
//! it to release the slot. Datasets never contend with each other.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct Slot {
    run: Arc<AsyncMutex<()>>,
    control: Mutex<Control>,
}

#[derive(Debug, Default)]
struct Control {
    token: CancellationToken,
    /// Interrupts waiting for the run lock; new runs are refused meanwhile
    interrupting: usize,
}

/// Exclusive hold on a dataset slot; released on drop
#[derive(Debug)]
pub struct SlotGuard {
    token: CancellationToken,
    _guard: OwnedMutexGuard<()>,
}

impl SlotGuard {
    /// Token cancelled when another caller interrupts this run
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Keyed run slots
#[derive(Debug, Default)]
pub struct DatasetSlots {
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl DatasetSlots {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, dataset_id: &str) -> Arc<Slot> {
        self.slots
            .lock()
            .entry(dataset_id.to_string())
            .or_default()
            .clone()
    }

    /// Take the slot for a new run without waiting; `None` if a run is
    /// active or an interrupt is pending
    pub fn try_acquire(&self, dataset_id: &str) -> Option<SlotGuard> {
        let slot = self.slot(dataset_id);
        let guard = slot.run.clone().try_lock_owned().ok()?;
        let mut control = slot.control.lock();
        if control.interrupting > 0 {
            return None;
        }
        let token = CancellationToken::new();
        control.token = token.clone();
        Some(SlotGuard {
            token,
            _guard: guard,
        })
    }

    /// Cancel any active run and wait until the slot is free
    pub async fn interrupt(&self, dataset_id: &str) -> SlotGuard {
        let slot = self.slot(dataset_id);
        {
            let mut control = slot.control.lock();
            control.interrupting += 1;
            control.token.cancel();
        }

        let guard = slot.run.clone().lock_owned().await;
        let token = CancellationToken::new();
        {
            let mut control = slot.control.lock();
            control.interrupting -= 1;
            control.token = token.clone();
        }
        SlotGuard {
            token,
            _guard: guard,
        }
    }

    /// Whether a run currently holds the slot
    pub fn is_busy(&self, dataset_id: &str) -> bool {
        self.slots
            .lock()
            .get(dataset_id)
            .map(|slot| slot.run.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Drop the slot entry when nobody holds it
    pub fn release(&self, dataset_id: &str) {
        let mut slots = self.slots.lock();
        let idle = slots
            .get(dataset_id)
            .map(|slot| Arc::strong_count(slot) == 1 && slot.run.try_lock().is_ok())
            .unwrap_or(false);
        if idle {
            slots.remove(dataset_id);
        }
    }
}
