//! Track and region taxonomy.
//!
//! Everything here is a pure lookup: raw track text in, canonical attributes
//! out. Unknown input resolves to documented defaults instead of failing, so
//! the partition helpers at the bottom of the module can be called on any
//! participation.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub const HOME_REGION: &str = "AU";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VenueCategory {
    Metro,
    Provincial,
    Country,
}

impl VenueCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Metro => "Metro",
            Self::Provincial => "Provincial",
            Self::Country => "Country",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Surface {
    Turf,
    Dirt,
    Synthetic,
}

impl Surface {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Turf => "Turf",
            Self::Dirt => "Dirt",
            Self::Synthetic => "Synthetic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Clockwise,
    Anticlockwise,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Clockwise => "Clockwise",
            Self::Anticlockwise => "Anticlockwise",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackProfile {
    pub region: String,
    pub category: VenueCategory,
    pub surface: Surface,
    pub direction: Direction,
}

/// Reference-table entry layered over the built-in track table. Missing
/// fields keep whatever the built-in table (or the defaults) said.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackOverride {
    pub track: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub category: Option<VenueCategory>,
    #[serde(default)]
    pub surface: Option<Surface>,
    #[serde(default)]
    pub direction: Option<Direction>,
}

const HK_TRACKS: &[&str] = &["Sha Tin", "Happy Valley"];
const UK_TRACKS: &[&str] = &[
    "Royal Ascot",
    "Newmarket",
    "Epsom Downs",
    "York",
    "Goodwood",
    "Cheltenham",
    "Aintree",
    "Newbury",
    "Sandown Park",
    "Doncaster",
    "Haydock",
    "Kempton",
    "Wolverhampton",
    "Southwell",
    "Lingfield",
    "Chester",
    "Hamilton",
    "Musselburgh",
    "Nottingham",
    "Pontefract",
    "Sedgefield",
    "Plumpton",
    "Yarmouth",
    "Down Royal",
];
const IE_TRACKS: &[&str] = &[
    "Curragh",
    "Leopardstown",
    "Punchestown",
    "Fairyhouse",
    "Naas",
    "Gowran Park",
    "Galway",
    "Cork",
    "Killarney",
    "Dundalk",
    "Navan",
    "Thurles",
];
const FR_TRACKS: &[&str] = &[
    "ParisLongchamp",
    "Chantilly",
    "Deauville",
    "Saint-Cloud",
    "Compiegne",
    "Fontainebleau",
    "Lyon-Parilly",
    "Vichy",
];
const JP_TRACKS: &[&str] = &[
    "Tokyo",
    "Kyoto",
    "Hanshin",
    "Nakayama",
    "Chukyo",
    "Niigata",
    "Fukushima",
    "Kokura",
    "Sapporo",
];
const AE_TRACKS: &[&str] = &["Meydan"];

const METRO_TRACKS: &[&str] = &[
    "Flemington",
    "Caulfield",
    "Moonee Valley",
    "Randwick",
    "Rosehill",
    "Eagle Farm",
    "Doomben",
    "Morphettville",
    "Sha Tin",
    "Happy Valley",
];
const PROVINCIAL_TRACKS: &[&str] = &[
    "Sandown Lakeside",
    "Sandown Hillside",
    "Cranbourne",
    "Canterbury Park",
    "Warwick Farm",
    "Newcastle",
    "Kembla Grange",
    "Sunshine Coast",
    "Gold Coast",
    "Ipswich",
];
const CLOCKWISE_TRACKS: &[&str] = &[
    "Flemington",
    "Caulfield",
    "Moonee Valley",
    "Sandown Lakeside",
    "Ballarat",
    "Bendigo",
    "Geelong",
    "Mornington",
    "Pakenham Synthetic",
    "Randwick",
    "Rosehill",
    "Canterbury Park",
    "Warwick Farm",
    "Newcastle",
    "Eagle Farm",
    "Doomben",
    "Sunshine Coast",
    "Gold Coast",
    "Sha Tin",
    "Happy Valley",
];
const SYNTHETIC_TRACKS: &[&str] = &["Wolverhampton", "Southwell", "Dundalk"];

const LOCALE_ALIASES: &[(&str, &str)] = &[
    ("au", "AU"),
    ("aus", "AU"),
    ("australia", "AU"),
    ("hk", "HK"),
    ("hong kong", "HK"),
    ("uk", "UK"),
    ("gb", "UK"),
    ("gbr", "UK"),
    ("great britain", "UK"),
    ("united kingdom", "UK"),
    ("england", "UK"),
    ("ie", "IE"),
    ("ire", "IE"),
    ("ireland", "IE"),
    ("fr", "FR"),
    ("fra", "FR"),
    ("france", "FR"),
    ("jp", "JP"),
    ("jpn", "JP"),
    ("japan", "JP"),
    ("ae", "AE"),
    ("uae", "AE"),
    ("dubai", "AE"),
    ("nz", "NZ"),
    ("new zealand", "NZ"),
    ("sg", "SG"),
    ("singapore", "SG"),
];

#[derive(Debug, Clone)]
pub struct TaxonomyResolver {
    tracks: HashMap<String, TrackProfile>,
    locales: HashMap<String, String>,
}

impl TaxonomyResolver {
    pub fn builtin() -> Self {
        let mut tracks = HashMap::new();
        let regional = [
            (HK_TRACKS, "HK"),
            (UK_TRACKS, "UK"),
            (IE_TRACKS, "IE"),
            (FR_TRACKS, "FR"),
            (JP_TRACKS, "JP"),
            (AE_TRACKS, "AE"),
            (METRO_TRACKS, HOME_REGION),
            (PROVINCIAL_TRACKS, HOME_REGION),
            (CLOCKWISE_TRACKS, HOME_REGION),
        ];
        for (names, region) in regional {
            for name in names {
                tracks
                    .entry(normalize_track_name(name))
                    .or_insert_with(|| default_profile(name, region));
            }
        }

        for name in METRO_TRACKS {
            if let Some(profile) = tracks.get_mut(&normalize_track_name(name)) {
                profile.category = VenueCategory::Metro;
            }
        }
        for name in PROVINCIAL_TRACKS {
            if let Some(profile) = tracks.get_mut(&normalize_track_name(name)) {
                profile.category = VenueCategory::Provincial;
            }
        }
        for name in CLOCKWISE_TRACKS {
            if let Some(profile) = tracks.get_mut(&normalize_track_name(name)) {
                profile.direction = Direction::Clockwise;
            }
        }
        for name in SYNTHETIC_TRACKS {
            if let Some(profile) = tracks.get_mut(&normalize_track_name(name)) {
                profile.surface = Surface::Synthetic;
            }
        }

        let locales = LOCALE_ALIASES
            .iter()
            .map(|(alias, region)| ((*alias).to_string(), (*region).to_string()))
            .collect();

        Self { tracks, locales }
    }

    pub fn with_overrides(overrides: &[TrackOverride]) -> Self {
        let mut resolver = Self::builtin();
        for entry in overrides {
            let key = normalize_track_name(&entry.track);
            let profile = resolver
                .tracks
                .entry(key)
                .or_insert_with(|| default_profile(&entry.track, HOME_REGION));
            if let Some(region) = entry.region.as_deref() {
                profile.region = region.trim().to_ascii_uppercase();
            }
            if let Some(category) = entry.category {
                profile.category = category;
            }
            if let Some(surface) = entry.surface {
                profile.surface = surface;
            }
            if let Some(direction) = entry.direction {
                profile.direction = direction;
            }
        }
        resolver
    }

    /// Resolves a raw track name. The locale hint only matters when the name
    /// is not in the table.
    pub fn resolve(&self, track_name: &str, locale_hint: Option<&str>) -> TrackProfile {
        if let Some(profile) = self.tracks.get(&normalize_track_name(track_name)) {
            return profile.clone();
        }

        let region = locale_hint
            .and_then(|hint| self.locales.get(&normalize_track_name(hint)))
            .map(String::as_str)
            .unwrap_or(HOME_REGION);
        default_profile(track_name, region)
    }

    pub fn known_tracks(&self) -> usize {
        self.tracks.len()
    }
}

impl Default for TaxonomyResolver {
    fn default() -> Self {
        Self::builtin()
    }
}

fn default_profile(track_name: &str, region: &str) -> TrackProfile {
    let surface = if track_name.to_ascii_lowercase().contains("synthetic") {
        Surface::Synthetic
    } else {
        Surface::Turf
    };
    TrackProfile {
        region: region.to_string(),
        category: VenueCategory::Country,
        surface,
        direction: Direction::Anticlockwise,
    }
}

/// Case-folds and collapses every run of non-alphanumeric characters into a
/// single space.
pub fn normalize_track_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_space = false;
    for ch in raw.chars() {
        if ch.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.extend(ch.to_lowercase());
        } else {
            pending_space = true;
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DistanceBucket {
    Sprint,
    Speed,
    Mile,
    Middle,
    Staying,
}

impl DistanceBucket {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sprint => "Sprint",
            Self::Speed => "Speed",
            Self::Mile => "Mile",
            Self::Middle => "Middle",
            Self::Staying => "Staying",
        }
    }
}

pub fn distance_bucket(distance_m: u32) -> DistanceBucket {
    match distance_m {
        0..=999 => DistanceBucket::Sprint,
        1000..=1399 => DistanceBucket::Speed,
        1400..=1799 => DistanceBucket::Mile,
        1800..=2199 => DistanceBucket::Middle,
        _ => DistanceBucket::Staying,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BarrierGroup {
    Inner,
    Middle,
    Outer,
    Unknown,
}

impl BarrierGroup {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inner => "Inner",
            Self::Middle => "Middle",
            Self::Outer => "Outer",
            Self::Unknown => "Unknown",
        }
    }
}

pub fn barrier_group(barrier: Option<u32>, field_size: u32) -> BarrierGroup {
    let Some(barrier) = barrier.filter(|b| *b > 0) else {
        return BarrierGroup::Unknown;
    };
    if field_size == 0 {
        return BarrierGroup::Unknown;
    }
    let share = f64::from(barrier) / f64::from(field_size);
    if share <= 0.33 {
        BarrierGroup::Inner
    } else if share <= 0.66 {
        BarrierGroup::Middle
    } else {
        BarrierGroup::Outer
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionGroup {
    Firm,
    Good,
    Soft,
    Heavy,
    Synthetic,
    Unknown,
}

impl ConditionGroup {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Firm => "Firm",
            Self::Good => "Good",
            Self::Soft => "Soft",
            Self::Heavy => "Heavy",
            Self::Synthetic => "Synthetic",
            Self::Unknown => "Unknown",
        }
    }
}

/// Groups free-text going descriptions ("Good 4", "Soft (7)", "HVY10").
pub fn condition_group(raw: Option<&str>) -> ConditionGroup {
    let Some(raw) = raw else {
        return ConditionGroup::Unknown;
    };
    let text = raw.trim().to_ascii_lowercase();
    if text.is_empty() {
        return ConditionGroup::Unknown;
    }
    if text.contains("synth") || text.contains("all weather") || text.contains("polytrack") {
        ConditionGroup::Synthetic
    } else if text.contains("heavy") || text.starts_with("hvy") {
        ConditionGroup::Heavy
    } else if text.contains("soft") || text.contains("yielding") || text.starts_with("sft") {
        ConditionGroup::Soft
    } else if text.contains("good") || text.starts_with("gd") {
        ConditionGroup::Good
    } else if text.contains("firm") || text.contains("fast") || text.starts_with("frm") {
        ConditionGroup::Firm
    } else {
        ConditionGroup::Unknown
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RailPosition {
    pub is_true: bool,
    pub out_metres: Option<f64>,
}

fn rail_out_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(?:\bout|\+)\s*(\d+(?:\.\d+)?)").expect("rail pattern should compile")
    })
}

/// Parses rail placement text such as "RAIL - True", "Out 3m" or "+4.5m".
pub fn parse_rail(raw: Option<&str>) -> RailPosition {
    let Some(raw) = raw else {
        return RailPosition::default();
    };
    let upper = raw.to_ascii_uppercase();
    let is_true = upper.contains("TRUE");
    let out_metres = rail_out_pattern()
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok());
    RailPosition {
        is_true,
        out_metres: if is_true { Some(0.0) } else { out_metres },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_builtin_tracks_with_punctuation_and_case_noise() {
        let resolver = TaxonomyResolver::builtin();

        let sha_tin = resolver.resolve("  SHA-TIN ", None);
        assert_eq!(sha_tin.region, "HK");
        assert_eq!(sha_tin.category, VenueCategory::Metro);
        assert_eq!(sha_tin.direction, Direction::Clockwise);

        let curragh = resolver.resolve("curragh", Some("AU"));
        assert_eq!(curragh.region, "IE");
        assert_eq!(curragh.category, VenueCategory::Country);

        let cranbourne = resolver.resolve("Cranbourne", None);
        assert_eq!(cranbourne.region, "AU");
        assert_eq!(cranbourne.category, VenueCategory::Provincial);
        assert_eq!(cranbourne.direction, Direction::Anticlockwise);
    }

    #[test]
    fn unmapped_track_uses_hint_then_home_defaults() {
        let resolver = TaxonomyResolver::builtin();

        let hinted = resolver.resolve("Ellerslie", Some("New Zealand"));
        assert_eq!(hinted.region, "NZ");
        assert_eq!(hinted.category, VenueCategory::Country);

        let unknown = resolver.resolve("Nowhere Downs", Some("Atlantis"));
        assert_eq!(
            unknown,
            TrackProfile {
                region: HOME_REGION.to_string(),
                category: VenueCategory::Country,
                surface: Surface::Turf,
                direction: Direction::Anticlockwise,
            }
        );

        let synthetic = resolver.resolve("Geelong Synthetic", None);
        assert_eq!(synthetic.surface, Surface::Synthetic);
        assert_eq!(resolver.resolve("Pakenham Synthetic", None).surface, Surface::Synthetic);
    }

    #[test]
    fn overrides_layer_on_top_of_builtin_table() {
        let resolver = TaxonomyResolver::with_overrides(&[
            TrackOverride {
                track: "Meydan".to_string(),
                region: None,
                category: Some(VenueCategory::Metro),
                surface: Some(Surface::Dirt),
                direction: None,
            },
            TrackOverride {
                track: "Kranji".to_string(),
                region: Some("sg".to_string()),
                category: Some(VenueCategory::Metro),
                surface: None,
                direction: Some(Direction::Clockwise),
            },
        ]);

        let meydan = resolver.resolve("Meydan", None);
        assert_eq!(meydan.region, "AE");
        assert_eq!(meydan.surface, Surface::Dirt);
        assert_eq!(meydan.category, VenueCategory::Metro);

        let kranji = resolver.resolve("KRANJI", None);
        assert_eq!(kranji.region, "SG");
        assert_eq!(kranji.direction, Direction::Clockwise);
    }

    #[test]
    fn distance_and_barrier_and_condition_groups() {
        assert_eq!(distance_bucket(999), DistanceBucket::Sprint);
        assert_eq!(distance_bucket(1000), DistanceBucket::Speed);
        assert_eq!(distance_bucket(1600), DistanceBucket::Mile);
        assert_eq!(distance_bucket(2000), DistanceBucket::Middle);
        assert_eq!(distance_bucket(3200), DistanceBucket::Staying);

        assert_eq!(barrier_group(Some(3), 12), BarrierGroup::Inner);
        assert_eq!(barrier_group(Some(7), 12), BarrierGroup::Middle);
        assert_eq!(barrier_group(Some(12), 12), BarrierGroup::Outer);
        assert_eq!(barrier_group(None, 12), BarrierGroup::Unknown);
        assert_eq!(barrier_group(Some(0), 12), BarrierGroup::Unknown);

        assert_eq!(condition_group(Some("Good 4")), ConditionGroup::Good);
        assert_eq!(condition_group(Some("Soft (7)")), ConditionGroup::Soft);
        assert_eq!(condition_group(Some("HVY10")), ConditionGroup::Heavy);
        assert_eq!(condition_group(Some("Synthetic")), ConditionGroup::Synthetic);
        assert_eq!(condition_group(Some("Firm 1")), ConditionGroup::Firm);
        assert_eq!(condition_group(Some("")), ConditionGroup::Unknown);
        assert_eq!(condition_group(None), ConditionGroup::Unknown);
    }

    #[test]
    fn parses_rail_text() {
        assert_eq!(
            parse_rail(Some("RAIL - True")),
            RailPosition {
                is_true: true,
                out_metres: Some(0.0)
            }
        );
        assert_eq!(parse_rail(Some("Out 3m")).out_metres, Some(3.0));
        assert_eq!(parse_rail(Some("Rail +4.5m entire circuit")).out_metres, Some(4.5));
        assert_eq!(parse_rail(Some("Rail is at its normal position")).out_metres, None);
        assert_eq!(parse_rail(None), RailPosition::default());
    }
}
