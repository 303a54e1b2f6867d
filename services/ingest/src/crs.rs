//! Coordinate reference system resolution from `.prj` content.
//!
//! Resolution tries, in order: a bare EPSG code or URN, the authority
//! declared on the root node of a WKT1/WKT2 definition, and finally a
//! table of well-known definition names. Anything else is unresolved.
//! Only the root node's authority counts: a projected CRS nests the EPSG
//! code of its base geographic CRS, which must never be mistaken for the
//! projected code.

use serde::Serialize;
use tracing::debug;

/// Root keywords that define a complete CRS
const CRS_KEYWORDS: &[&str] = &[
    "GEOGCS",
    "PROJCS",
    "GEOCCS",
    "COMPD_CS",
    "GEOGCRS",
    "GEODCRS",
    "GEODETICCRS",
    "GEOGRAPHICCRS",
    "PROJCRS",
    "PROJECTEDCRS",
    "COMPOUNDCRS",
];

/// Resolved coordinate reference system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CrsDescriptor {
    /// EPSG code when resolved
    pub epsg: Option<u32>,
    pub resolved: bool,
}

impl CrsDescriptor {
    pub fn epsg(code: u32) -> Self {
        Self {
            epsg: Some(code),
            resolved: true,
        }
    }

    pub fn unknown() -> Self {
        Self {
            epsg: None,
            resolved: false,
        }
    }

    /// Human readable code, `unknown` when unresolved
    pub fn code(&self) -> String {
        match self.epsg {
            Some(code) => format!("EPSG:{}", code),
            None => "unknown".to_string(),
        }
    }
}

/// Resolves `.prj` content to an EPSG code
#[derive(Debug, Clone, Default)]
pub struct CrsResolver;

impl CrsResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn resolve(&self, prj_text: &str) -> CrsDescriptor {
        let text = prj_text.trim();
        if text.is_empty() {
            return CrsDescriptor::unknown();
        }

        if let Some(code) = parse_epsg_reference(text) {
            return CrsDescriptor::epsg(code);
        }

        let Some(root) = WktParser::new(text).parse() else {
            debug!("Projection definition is not parseable WKT");
            return CrsDescriptor::unknown();
        };

        if !CRS_KEYWORDS.contains(&root.keyword.as_str()) {
            return CrsDescriptor::unknown();
        }

        if let Some(code) = root.authority_code() {
            return CrsDescriptor::epsg(code);
        }

        match well_known(&root) {
            Some(code) => CrsDescriptor::epsg(code),
            None => {
                debug!(
                    name = root.name().unwrap_or_default(),
                    "Projection definition not recognized"
                );
                CrsDescriptor::unknown()
            }
        }
    }
}

/// `EPSG:4326`, `urn:ogc:def:crs:EPSG::4326` and similar single references
fn parse_epsg_reference(text: &str) -> Option<u32> {
    let lower = text.to_ascii_lowercase();
    let rest = lower
        .strip_prefix("epsg:")
        .or_else(|| lower.strip_prefix("urn:ogc:def:crs:epsg:"))?;
    let code = rest.trim_start_matches(|c: char| c == ':' || c.is_ascii_alphabetic() || c == '.');
    let code = code.rsplit(':').next()?;
    code.parse().ok().filter(|c| *c > 0)
}

#[derive(Debug, Clone, PartialEq)]
enum WktValue {
    Text(String),
    Token(String),
    Node(WktNode),
}

#[derive(Debug, Clone, PartialEq)]
struct WktNode {
    keyword: String,
    args: Vec<WktValue>,
}

impl WktNode {
    /// First quoted argument, the object name for every CRS keyword
    fn name(&self) -> Option<&str> {
        self.args.iter().find_map(|a| match a {
            WktValue::Text(t) => Some(t.as_str()),
            _ => None,
        })
    }

    fn child(&self, keyword: &str) -> Option<&WktNode> {
        self.args.iter().find_map(|a| match a {
            WktValue::Node(n) if n.keyword == keyword => Some(n),
            _ => None,
        })
    }

    /// EPSG code from a direct `AUTHORITY` (WKT1) or `ID` (WKT2) child
    fn authority_code(&self) -> Option<u32> {
        let authority = self.child("AUTHORITY").or_else(|| self.child("ID"))?;
        let mut values = authority.args.iter().map(|a| match a {
            WktValue::Text(t) | WktValue::Token(t) => Some(t.as_str()),
            WktValue::Node(_) => None,
        });

        let body = values.next()??;
        if !body.eq_ignore_ascii_case("EPSG") {
            return None;
        }
        values.next()??.trim().parse().ok()
    }
}

struct WktParser<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
}

impl<'a> WktParser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            chars: text.chars().peekable(),
        }
    }

    /// Parse a single root node that must span the whole input
    fn parse(mut self) -> Option<WktNode> {
        self.skip_ws();
        let keyword = self.token()?;
        let node = self.node(keyword)?;
        self.skip_ws();
        match self.chars.peek() {
            None => Some(node),
            Some(_) => None,
        }
    }

    fn node(&mut self, keyword: String) -> Option<WktNode> {
        self.skip_ws();
        let close = match self.chars.next()? {
            '[' => ']',
            '(' => ')',
            _ => return None,
        };

        let mut args = Vec::new();
        loop {
            self.skip_ws();
            match self.chars.peek()? {
                c if *c == close => {
                    self.chars.next();
                    break;
                }
                '"' => {
                    self.chars.next();
                    args.push(WktValue::Text(self.quoted()?));
                }
                _ => {
                    let token = self.token()?;
                    self.skip_ws();
                    if matches!(self.chars.peek(), Some('[') | Some('(')) {
                        args.push(WktValue::Node(self.node(token.to_ascii_uppercase())?));
                    } else {
                        args.push(WktValue::Token(token));
                    }
                }
            }

            self.skip_ws();
            match self.chars.peek()? {
                ',' => {
                    self.chars.next();
                }
                c if *c == close => {}
                _ => return None,
            }
        }

        Some(WktNode {
            keyword: keyword.to_ascii_uppercase(),
            args,
        })
    }

    /// Quoted string body; `""` is an escaped quote
    fn quoted(&mut self) -> Option<String> {
        let mut out = String::new();
        loop {
            match self.chars.next()? {
                '"' if self.chars.peek() == Some(&'"') => {
                    self.chars.next();
                    out.push('"');
                }
                '"' => return Some(out),
                c => out.push(c),
            }
        }
    }

    fn token(&mut self) -> Option<String> {
        let mut out = String::new();
        while let Some(c) = self.chars.peek() {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '+') {
                out.push(*c);
                self.chars.next();
            } else {
                break;
            }
        }
        (!out.is_empty()).then_some(out)
    }

    fn skip_ws(&mut self) {
        while self.chars.next_if(|c| c.is_whitespace()).is_some() {}
    }
}

/// Lowercase, with every run of non-alphanumerics collapsed to `_`
fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

/// Well-known definitions by normalized name
const KNOWN_NAMES: &[(&str, u32)] = &[
    ("wgs_84", 4326),
    ("wgs84", 4326),
    ("gcs_wgs_1984", 4326),
    ("wgs_84_pseudo_mercator", 3857),
    ("wgs_1984_web_mercator_auxiliary_sphere", 3857),
    ("wgs_1984_web_mercator", 3857),
    ("nad83", 4269),
    ("gcs_north_american_1983", 4269),
    ("nad27", 4267),
    ("gcs_north_american_1927", 4267),
    ("etrs89", 4258),
    ("gcs_etrs_1989", 4258),
    ("gda94", 4283),
    ("gcs_gda_1994", 4283),
    ("gda2020", 7844),
    ("gcs_gda2020", 7844),
    ("osgb_1936_british_national_grid", 27700),
    ("osgb36_british_national_grid", 27700),
    ("british_national_grid", 27700),
    ("rgf93_lambert_93", 2154),
    ("rgf93_v1_lambert_93", 2154),
    ("rgf_1993_lambert_93", 2154),
];

/// Geographic datums by normalized name, used for unnamed GEOGCS roots
const KNOWN_DATUMS: &[(&str, u32)] = &[
    ("wgs_1984", 4326),
    ("d_wgs_1984", 4326),
    ("north_american_datum_1983", 4269),
    ("d_north_american_1983", 4269),
    ("north_american_datum_1927", 4267),
    ("d_north_american_1927", 4267),
    ("european_terrestrial_reference_system_1989", 4258),
    ("d_etrs_1989", 4258),
    ("geocentric_datum_of_australia_1994", 4283),
    ("d_gda_1994", 4283),
    ("geocentric_datum_of_australia_2020", 7844),
    ("d_gda2020", 7844),
];

/// Zoned projections: (normalized prefix, zone range, code base, hemisphere)
const ZONED: &[(&str, u32, u32, u32, Option<char>)] = &[
    ("wgs_1984_utm_zone_", 1, 60, 32600, Some('n')),
    ("wgs_84_utm_zone_", 1, 60, 32600, Some('n')),
    ("wgs_1984_utm_zone_", 1, 60, 32700, Some('s')),
    ("wgs_84_utm_zone_", 1, 60, 32700, Some('s')),
    ("nad_1983_utm_zone_", 1, 23, 26900, Some('n')),
    ("nad83_utm_zone_", 1, 23, 26900, Some('n')),
    ("etrs_1989_utm_zone_", 28, 38, 25800, Some('n')),
    ("etrs89_utm_zone_", 28, 38, 25800, Some('n')),
    ("gda_1994_mga_zone_", 48, 58, 28300, None),
    ("gda94_mga_zone_", 48, 58, 28300, None),
    ("gda2020_mga_zone_", 46, 59, 7800, None),
];

fn well_known(root: &WktNode) -> Option<u32> {
    let name = normalize_name(root.name()?);

    if let Some((_, code)) = KNOWN_NAMES.iter().find(|(known, _)| *known == name) {
        return Some(*code);
    }

    if let Some(code) = zoned_code(&name) {
        return Some(code);
    }

    if root.keyword == "GEOGCS" || root.keyword == "GEOGCRS" {
        let datum = root
            .child("DATUM")
            .and_then(WktNode::name)
            .map(normalize_name)?;
        return KNOWN_DATUMS
            .iter()
            .find(|(known, _)| *known == datum)
            .map(|(_, code)| *code);
    }

    None
}

fn zoned_code(name: &str) -> Option<u32> {
    ZONED.iter().find_map(|(prefix, min, max, base, hemisphere)| {
        let rest = name.strip_prefix(prefix)?;
        let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
        let suffix = &rest[digits.len()..];
        let zone: u32 = digits.parse().ok()?;

        let suffix_ok = match hemisphere {
            Some(h) => suffix.len() == 1 && suffix.starts_with(*h),
            None => suffix.is_empty(),
        };

        (suffix_ok && (*min..=*max).contains(&zone)).then(|| base + zone)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const WGS84_OGC: &str = r#"GEOGCS["WGS 84",DATUM["WGS_1984",SPHEROID["WGS 84",6378137,298.257223563,AUTHORITY["EPSG","7030"]],AUTHORITY["EPSG","6326"]],PRIMEM["Greenwich",0,AUTHORITY["EPSG","8901"]],UNIT["degree",0.0174532925199433,AUTHORITY["EPSG","9122"]],AUTHORITY["EPSG","4326"]]"#;

    const WGS84_ESRI: &str = r#"GEOGCS["GCS_WGS_1984",DATUM["D_WGS_1984",SPHEROID["WGS_1984",6378137.0,298.257223563]],PRIMEM["Greenwich",0.0],UNIT["Degree",0.0174532925199433]]"#;

    const UTM33N_OGC: &str = r#"PROJCS["WGS 84 / UTM zone 33N",GEOGCS["WGS 84",DATUM["WGS_1984",SPHEROID["WGS 84",6378137,298.257223563,AUTHORITY["EPSG","7030"]],AUTHORITY["EPSG","6326"]],PRIMEM["Greenwich",0],UNIT["degree",0.0174532925199433],AUTHORITY["EPSG","4326"]],PROJECTION["Transverse_Mercator"],PARAMETER["latitude_of_origin",0],PARAMETER["central_meridian",15],PARAMETER["scale_factor",0.9996],PARAMETER["false_easting",500000],PARAMETER["false_northing",0],UNIT["metre",1],AXIS["Easting",EAST],AXIS["Northing",NORTH],AUTHORITY["EPSG","32633"]]"#;

    const MGA55_ESRI: &str = r#"PROJCS["GDA_1994_MGA_Zone_55",GEOGCS["GCS_GDA_1994",DATUM["D_GDA_1994",SPHEROID["GRS_1980",6378137.0,298.257222101]],PRIMEM["Greenwich",0.0],UNIT["Degree",0.0174532925199433]],PROJECTION["Transverse_Mercator"],PARAMETER["False_Easting",500000.0],PARAMETER["False_Northing",10000000.0],PARAMETER["Central_Meridian",147.0],PARAMETER["Scale_Factor",0.9996],PARAMETER["Latitude_Of_Origin",0.0],UNIT["Meter",1.0]]"#;

    const WKT2: &str = r#"GEOGCRS["WGS 84",
        DATUM["World Geodetic System 1984",ELLIPSOID["WGS 84",6378137,298.257223563]],
        CS[ellipsoidal,2],
        AXIS["latitude",north],AXIS["longitude",east],
        ANGLEUNIT["degree",0.0174532925199433],
        ID["EPSG",4326]]"#;

    fn resolve(text: &str) -> CrsDescriptor {
        CrsResolver::new().resolve(text)
    }

    #[test]
    fn test_root_authority() {
        assert_eq!(resolve(WGS84_OGC), CrsDescriptor::epsg(4326));
    }

    #[test]
    fn test_projected_uses_root_not_nested_authority() {
        assert_eq!(resolve(UTM33N_OGC).epsg, Some(32633));
    }

    #[test]
    fn test_wkt2_id() {
        assert_eq!(resolve(WKT2).epsg, Some(4326));
    }

    #[test]
    fn test_esri_names() {
        assert_eq!(resolve(WGS84_ESRI).epsg, Some(4326));
        assert_eq!(resolve(MGA55_ESRI).epsg, Some(28355));
    }

    #[test]
    fn test_zoned_names() {
        assert_eq!(zoned_code("wgs_84_utm_zone_33n"), Some(32633));
        assert_eq!(zoned_code("wgs_1984_utm_zone_56s"), Some(32756));
        assert_eq!(zoned_code("nad83_utm_zone_10n"), Some(26910));
        assert_eq!(zoned_code("etrs89_utm_zone_32n"), Some(25832));
        assert_eq!(zoned_code("gda2020_mga_zone_55"), Some(7855));
        assert_eq!(zoned_code("wgs_84_utm_zone_61n"), None);
        assert_eq!(zoned_code("wgs_84_utm_zone_33x"), None);
    }

    #[test]
    fn test_unnamed_geogcs_matched_by_datum() {
        let wkt = r#"GEOGCS["Custom",DATUM["D_North_American_1983",SPHEROID["GRS_1980",6378137.0,298.257222101]],PRIMEM["Greenwich",0.0],UNIT["Degree",0.0174532925199433]]"#;
        assert_eq!(resolve(wkt).epsg, Some(4269));
    }

    #[test]
    fn test_epsg_references() {
        assert_eq!(resolve("EPSG:3857").epsg, Some(3857));
        assert_eq!(resolve("urn:ogc:def:crs:EPSG::28355").epsg, Some(28355));
        assert!(!resolve("EPSG:abc").resolved);
    }

    #[test]
    fn test_empty_is_unresolved() {
        assert_eq!(resolve(""), CrsDescriptor::unknown());
        assert_eq!(resolve("   \n"), CrsDescriptor::unknown());
    }

    #[test]
    fn test_garbage_is_unresolved() {
        assert!(!resolve("this is not a projection").resolved);
        assert!(!resolve("GEOGCS[\"WGS 84\"").resolved);
        assert!(!resolve(&format!("{WGS84_OGC} trailing")).resolved);
    }

    #[test]
    fn test_recognized_but_non_standard_is_unresolved() {
        let wkt = r#"PROJCS["Local_Mine_Grid",GEOGCS["GCS_WGS_1984",DATUM["D_WGS_1984",SPHEROID["WGS_1984",6378137.0,298.257223563]],PRIMEM["Greenwich",0.0],UNIT["Degree",0.0174532925199433]],PROJECTION["Transverse_Mercator"],PARAMETER["Central_Meridian",117.3],UNIT["Meter",1.0]]"#;
        let crs = resolve(wkt);
        assert!(!crs.resolved);
        assert_eq!(crs.code(), "unknown");
    }

    #[test]
    fn test_non_crs_root_is_unresolved() {
        assert!(!resolve(r#"SPHEROID["WGS 84",6378137,298.257223563,AUTHORITY["EPSG","7030"]]"#).resolved);
    }

    #[test]
    fn test_escaped_quotes_in_names() {
        let wkt = r#"GEOGCS["Odd ""quoted"" name",DATUM["x",SPHEROID["y",1,2]],AUTHORITY["EPSG","4283"]]"#;
        assert_eq!(resolve(wkt).epsg, Some(4283));
    }
}
