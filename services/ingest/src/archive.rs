//! Structural and security validation of uploaded shapefile archives.
//!
//! Validation happens in two passes over the zip central directory. The
//! first pass inspects every member name and size without decompressing
//! anything; only when every member is known to stay inside the extraction
//! root is the second pass allowed to write to disk.

use crate::config::IngestConfig;
use crate::error::IngestError;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Cursor, Read};
use std::path::{Component, Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, instrument};

const SHP: &str = "shp";
const SHX: &str = "shx";
const DBF: &str = "dbf";
const PRJ: &str = "prj";

/// Unix file type bits for symbolic links
const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// An uploaded archive, held in memory for the duration of a run
#[derive(Debug, Clone)]
pub struct SourceArchive {
    /// Dataset owning the archive
    pub dataset_id: String,
    /// Raw zip bytes
    pub bytes: Bytes,
    /// Size announced by the uploader
    pub declared_size: u64,
}

impl SourceArchive {
    pub fn new(dataset_id: impl Into<String>, bytes: Bytes) -> Self {
        let declared_size = bytes.len() as u64;
        Self {
            dataset_id: dataset_id.into(),
            bytes,
            declared_size,
        }
    }

    /// Override the declared size, e.g. from a `Content-Length` header.
    /// The larger of the declared and actual size is kept.
    pub fn with_declared_size(mut self, declared: u64) -> Self {
        self.declared_size = declared.max(self.bytes.len() as u64);
        self
    }
}

/// A single member of the archive listing
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveMember {
    /// Name as stored in the archive
    pub name: String,
    /// Normalized path relative to the extraction root
    pub path: PathBuf,
    /// Declared uncompressed size
    pub size: u64,
    pub is_dir: bool,
}

/// Paths of the four shapefile components sharing a base name
#[derive(Debug, Clone, PartialEq)]
pub struct ShapefileComponents {
    pub shp: PathBuf,
    pub shx: PathBuf,
    pub dbf: PathBuf,
    pub prj: PathBuf,
}

impl ShapefileComponents {
    fn under(&self, root: &Path) -> Self {
        Self {
            shp: root.join(&self.shp),
            shx: root.join(&self.shx),
            dbf: root.join(&self.dbf),
            prj: root.join(&self.prj),
        }
    }
}

/// Result of inspecting the archive listing
#[derive(Debug, Clone)]
pub struct ArchiveManifest {
    pub members: Vec<ArchiveMember>,
    /// Sum of declared uncompressed sizes
    pub total_uncompressed: u64,
    pub has_geometry: bool,
    pub has_index: bool,
    pub has_attributes: bool,
    pub has_projection: bool,
    /// Relative component paths when all four are present
    pub components: Option<ShapefileComponents>,
}

impl ArchiveManifest {
    pub fn is_complete(&self) -> bool {
        self.components.is_some()
    }
}

/// A validated archive extracted into a private temporary directory.
///
/// The directory and everything in it is removed when this value is
/// dropped, whichever way the owning run ends.
#[derive(Debug)]
pub struct ExtractedShapefile {
    dir: TempDir,
    manifest: ArchiveManifest,
    components: ShapefileComponents,
}

impl ExtractedShapefile {
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn manifest(&self) -> &ArchiveManifest {
        &self.manifest
    }

    /// Absolute paths of the extracted components
    pub fn components(&self) -> &ShapefileComponents {
        &self.components
    }

    /// Read the projection definition, tolerating invalid UTF-8
    pub fn read_projection(&self) -> io::Result<String> {
        let raw = fs::read(&self.components.prj)?;
        let text = String::from_utf8_lossy(&raw);
        Ok(text.trim_start_matches('\u{feff}').to_string())
    }
}

/// Validates and extracts shapefile archives
#[derive(Debug, Clone)]
pub struct ArchiveValidator {
    max_size_bytes: u64,
    max_uncompressed_bytes: u64,
    work_dir: Option<PathBuf>,
}

impl ArchiveValidator {
    pub fn new(config: &IngestConfig) -> Self {
        Self {
            max_size_bytes: config.max_size_bytes(),
            max_uncompressed_bytes: config.max_uncompressed_bytes(),
            work_dir: config.work_dir.clone(),
        }
    }

    pub fn with_limits(max_size_bytes: u64, max_uncompressed_bytes: u64) -> Self {
        Self {
            max_size_bytes,
            max_uncompressed_bytes,
            work_dir: None,
        }
    }

    /// Create temporary directories under `dir` instead of the system default
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    /// Reject archives above the size limit before touching their content
    pub fn check_size(&self, archive: &SourceArchive) -> Result<(), IngestError> {
        let actual = archive.declared_size.max(archive.bytes.len() as u64);
        if actual > self.max_size_bytes {
            return Err(IngestError::TooLarge {
                actual,
                limit: self.max_size_bytes,
            });
        }
        Ok(())
    }

    /// Inspect the archive listing without writing anything to disk
    pub fn inspect(&self, archive: &SourceArchive) -> Result<ArchiveManifest, IngestError> {
        self.check_size(archive)?;

        let mut zip = open_zip(&archive.bytes)?;
        let mut members = Vec::with_capacity(zip.len());
        let mut total_uncompressed: u64 = 0;

        for index in 0..zip.len() {
            let entry = zip
                .by_index_raw(index)
                .map_err(|e| IngestError::InvalidArchive(e.to_string()))?;

            let name = entry.name().to_string();
            let path = normalize_member_path(&name)?;

            if entry
                .unix_mode()
                .map(|mode| mode & S_IFMT == S_IFLNK)
                .unwrap_or(false)
            {
                return Err(IngestError::PathTraversal(name));
            }

            total_uncompressed = total_uncompressed.saturating_add(entry.size());
            members.push(ArchiveMember {
                name,
                path,
                size: entry.size(),
                is_dir: entry.is_dir(),
            });
        }

        if total_uncompressed > self.max_uncompressed_bytes {
            return Err(IngestError::TooLarge {
                actual: total_uncompressed,
                limit: self.max_uncompressed_bytes,
            });
        }

        Ok(build_manifest(members, total_uncompressed))
    }

    /// Validate the archive and extract it into a fresh temporary directory
    #[instrument(skip(self, archive), fields(dataset_id = %archive.dataset_id, size = archive.bytes.len()))]
    pub fn validate(&self, archive: &SourceArchive) -> Result<ExtractedShapefile, IngestError> {
        let manifest = self.inspect(archive)?;
        let relative = manifest
            .components
            .clone()
            .ok_or(IngestError::IncompleteShapefile)?;

        let mut builder = tempfile::Builder::new();
        builder.prefix("vector_ingest_");
        let dir = match &self.work_dir {
            Some(root) => {
                fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };

        extract(&archive.bytes, &manifest, dir.path())?;

        debug!(
            root = %dir.path().display(),
            members = manifest.members.len(),
            total_uncompressed = manifest.total_uncompressed,
            "Archive extracted"
        );

        let components = relative.under(dir.path());
        Ok(ExtractedShapefile {
            dir,
            manifest,
            components,
        })
    }
}

fn open_zip(bytes: &Bytes) -> Result<zip::ZipArchive<Cursor<Bytes>>, IngestError> {
    zip::ZipArchive::new(Cursor::new(bytes.clone()))
        .map_err(|e| IngestError::InvalidArchive(e.to_string()))
}

/// Write every member below `root`. Only called after `inspect` accepted
/// all member paths.
fn extract(bytes: &Bytes, manifest: &ArchiveManifest, root: &Path) -> Result<(), IngestError> {
    let mut zip = open_zip(bytes)?;

    for (index, member) in manifest.members.iter().enumerate() {
        let target = root.join(&member.path);

        if member.is_dir || member.path.as_os_str().is_empty() {
            fs::create_dir_all(&target)?;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut entry = zip
            .by_index(index)
            .map_err(|e| IngestError::InvalidArchive(e.to_string()))?;
        let mut output = fs::File::create(&target)?;

        // The declared size is untrusted; never write more than it claims.
        let written = io::copy(&mut entry.by_ref().take(member.size + 1), &mut output)?;
        if written > member.size {
            return Err(IngestError::InvalidArchive(format!(
                "member {} is larger than declared",
                member.name
            )));
        }
    }

    Ok(())
}

/// Resolve a member name against the extraction root, rejecting absolute
/// paths and any `..` that would climb above the root.
pub fn normalize_member_path(name: &str) -> Result<PathBuf, IngestError> {
    let unified = name.replace('\\', "/");
    let bytes = unified.as_bytes();
    let has_drive = bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':';

    if unified.starts_with('/') || has_drive || unified.contains('\0') {
        return Err(IngestError::PathTraversal(name.to_string()));
    }

    let mut parts: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                if parts.pop().is_none() {
                    return Err(IngestError::PathTraversal(name.to_string()));
                }
            }
            other => parts.push(other),
        }
    }

    let path: PathBuf = parts.iter().collect();
    debug_assert!(path.components().all(|c| matches!(c, Component::Normal(_))));
    Ok(path)
}

fn build_manifest(members: Vec<ArchiveMember>, total_uncompressed: u64) -> ArchiveManifest {
    // (directory, lowercase stem) -> lowercase extension -> relative path
    let mut groups: BTreeMap<(PathBuf, String), BTreeMap<String, PathBuf>> = BTreeMap::new();

    for member in members.iter().filter(|m| !m.is_dir) {
        let (Some(stem), Some(ext)) = (member.path.file_stem(), member.path.extension()) else {
            continue;
        };
        let dir = member.path.parent().map(Path::to_path_buf).unwrap_or_default();
        groups
            .entry((dir, stem.to_string_lossy().to_lowercase()))
            .or_default()
            .insert(ext.to_string_lossy().to_lowercase(), member.path.clone());
    }

    let shapefile_groups: Vec<&BTreeMap<String, PathBuf>> =
        groups.values().filter(|g| g.contains_key(SHP)).collect();

    let complete = shapefile_groups
        .iter()
        .find(|g| [SHX, DBF, PRJ].iter().all(|ext| g.contains_key(*ext)));

    let components = complete.map(|g| ShapefileComponents {
        shp: g[SHP].clone(),
        shx: g[SHX].clone(),
        dbf: g[DBF].clone(),
        prj: g[PRJ].clone(),
    });

    // Report the most complete candidate when none has every component
    let best = complete.copied().or_else(|| {
        shapefile_groups
            .iter()
            .max_by_key(|g| [SHX, DBF, PRJ].iter().filter(|e| g.contains_key(**e)).count())
            .copied()
    });
    let has = |ext: &str| best.map(|g| g.contains_key(ext)).unwrap_or(false);

    ArchiveManifest {
        has_geometry: best.is_some(),
        has_index: has(SHX),
        has_attributes: has(DBF),
        has_projection: has(PRJ),
        members,
        total_uncompressed,
        components,
    }
}
