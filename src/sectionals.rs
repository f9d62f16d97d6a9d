//! Sectional checkpoint reconciliation.
//!
//! Timing providers report running positions at gates on one of two grids.
//! Home-region data labels gates by metres run from the start on a dense
//! grid; overseas data labels them by metres remaining on a coarse grid. The
//! checkpoint map turns both into the two canonical fields every
//! participation carries: position with 800 m to run and with 400 m to run.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::participation::SectionalReading;

pub const DISTANCE_BUCKET_M: u32 = 100;
pub const REMAINING_800_M: u32 = 800;
pub const REMAINING_400_M: u32 = 400;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SectionalError {
    #[error("gate interval for region {region} must be positive")]
    ZeroInterval { region: String },
    #[error("distance range for region {region} is empty: {min_m}..={max_m}")]
    EmptyDistanceRange { region: String, min_m: u32, max_m: u32 },
    #[error("region {0} has more than one gate grid")]
    DuplicateRegion(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GateConvention {
    /// Labels are metres run since the start.
    FromStart { interval_m: u32 },
    /// Labels are metres still to run.
    ToFinish { interval_m: u32 },
}

impl GateConvention {
    pub fn interval_m(self) -> u32 {
        match self {
            Self::FromStart { interval_m } | Self::ToFinish { interval_m } => interval_m,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateGrid {
    pub region: String,
    pub convention: GateConvention,
    pub min_distance_m: u32,
    pub max_distance_m: u32,
}

pub fn default_gate_grids() -> Vec<GateGrid> {
    vec![
        GateGrid {
            region: "AU".to_string(),
            convention: GateConvention::FromStart { interval_m: 200 },
            min_distance_m: 800,
            max_distance_m: 3600,
        },
        GateGrid {
            region: "HK".to_string(),
            convention: GateConvention::ToFinish { interval_m: 400 },
            min_distance_m: 1000,
            max_distance_m: 2400,
        },
    ]
}

/// Rounds a race distance to the nearest 100 m bucket.
pub fn distance_bucket_m(distance_m: u32) -> u32 {
    distance_m.saturating_add(DISTANCE_BUCKET_M / 2) / DISTANCE_BUCKET_M * DISTANCE_BUCKET_M
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointChoice {
    pub gate_800m: Option<u32>,
    pub gate_400m: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionalCheckpointMap {
    choices: BTreeMap<(String, u32), CheckpointChoice>,
}

impl SectionalCheckpointMap {
    pub fn build(grids: &[GateGrid]) -> Result<Self, SectionalError> {
        let mut seen = BTreeMap::new();
        for grid in grids {
            if grid.convention.interval_m() == 0 {
                return Err(SectionalError::ZeroInterval {
                    region: grid.region.clone(),
                });
            }
            if grid.min_distance_m > grid.max_distance_m {
                return Err(SectionalError::EmptyDistanceRange {
                    region: grid.region.clone(),
                    min_m: grid.min_distance_m,
                    max_m: grid.max_distance_m,
                });
            }
            if seen.insert(grid.region.clone(), grid).is_some() {
                return Err(SectionalError::DuplicateRegion(grid.region.clone()));
            }
        }

        let mut choices = BTreeMap::new();
        for (region, grid) in seen {
            let first = distance_bucket_m(grid.min_distance_m).max(DISTANCE_BUCKET_M);
            let last = distance_bucket_m(grid.max_distance_m);
            let mut bucket = first;
            while bucket <= last {
                choices.insert(
                    (region.clone(), bucket),
                    CheckpointChoice {
                        gate_800m: nearest_gate(grid.convention, bucket, REMAINING_800_M),
                        gate_400m: nearest_gate(grid.convention, bucket, REMAINING_400_M),
                    },
                );
                bucket += DISTANCE_BUCKET_M;
            }
        }

        Ok(Self { choices })
    }

    pub fn choice(&self, region: &str, distance_m: u32) -> Option<CheckpointChoice> {
        self.choices
            .get(&(region.to_string(), distance_bucket_m(distance_m)))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.choices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.choices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(String, u32), &CheckpointChoice)> {
        self.choices.iter()
    }
}

/// Picks the grid label closest to the point `remaining_m` before the finish
/// of a `bucket_m` race. A label further than half an interval away is no
/// answer. Ties go to the label nearer the finish.
fn nearest_gate(convention: GateConvention, bucket_m: u32, remaining_m: u32) -> Option<u32> {
    if remaining_m >= bucket_m {
        return None;
    }
    let interval = convention.interval_m();
    let ideal = match convention {
        GateConvention::FromStart { .. } => bucket_m - remaining_m,
        GateConvention::ToFinish { .. } => remaining_m,
    };
    let lower = ideal / interval * interval;
    let upper = lower + interval;

    [lower, upper]
        .into_iter()
        .filter(|label| *label >= interval && *label < bucket_m)
        .filter(|label| 2 * label.abs_diff(ideal) <= interval)
        .min_by_key(|label| {
            let nearer_finish_rank = match convention {
                GateConvention::FromStart { .. } => u32::MAX - *label,
                GateConvention::ToFinish { .. } => *label,
            };
            (label.abs_diff(ideal), nearer_finish_rank)
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchKind {
    Name,
    Number,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalSectionals {
    pub pos_800m: Option<u32>,
    pub pos_400m: Option<u32>,
    pub matched_by: Option<MatchKind>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionalCoverage {
    pub participations: u64,
    pub mapped: u64,
    pub unmapped: u64,
    pub matched_by_name: u64,
    pub matched_by_number: u64,
    pub unmatched: u64,
    pub filled_800m: u64,
    pub filled_400m: u64,
}

/// What the reconciler needs to know about one participation.
#[derive(Debug, Clone, Copy)]
pub struct SectionalTarget<'a> {
    pub race_id: &'a str,
    pub horse_name: &'a str,
    pub horse_number: Option<u32>,
    pub region: &'a str,
    pub distance_m: u32,
}

pub fn normalize_competitor_name(raw: &str) -> String {
    let without_suffix = raw.split('(').next().unwrap_or(raw);
    without_suffix
        .chars()
        .filter(|ch| ch.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

pub fn reconcile_sectionals(
    targets: &[SectionalTarget<'_>],
    readings: &[SectionalReading],
    map: &SectionalCheckpointMap,
) -> (Vec<CanonicalSectionals>, SectionalCoverage) {
    let mut by_name: HashMap<(&str, String), Vec<&SectionalReading>> = HashMap::new();
    let mut by_number: HashMap<(&str, u32), Vec<&SectionalReading>> = HashMap::new();
    for reading in readings {
        by_name
            .entry((
                reading.race_id.as_str(),
                normalize_competitor_name(&reading.competitor_name),
            ))
            .or_default()
            .push(reading);
        if let Some(number) = reading.competitor_number {
            by_number
                .entry((reading.race_id.as_str(), number))
                .or_default()
                .push(reading);
        }
    }

    let mut coverage = SectionalCoverage::default();
    let canonical = targets
        .iter()
        .map(|target| {
            coverage.participations += 1;
            let Some(choice) = map.choice(target.region, target.distance_m) else {
                coverage.unmapped += 1;
                return CanonicalSectionals::default();
            };
            coverage.mapped += 1;

            let name_key = (target.race_id, normalize_competitor_name(target.horse_name));
            let (matched, kind) = if let Some(found) = by_name.get(&name_key) {
                (found, MatchKind::Name)
            } else if let Some(found) = target
                .horse_number
                .and_then(|number| by_number.get(&(target.race_id, number)))
            {
                (found, MatchKind::Number)
            } else {
                coverage.unmatched += 1;
                return CanonicalSectionals::default();
            };
            match kind {
                MatchKind::Name => coverage.matched_by_name += 1,
                MatchKind::Number => coverage.matched_by_number += 1,
            }

            let position_at = |gate: Option<u32>| {
                gate.and_then(|gate| {
                    matched
                        .iter()
                        .find(|reading| reading.gate_m == gate && reading.position > 0)
                        .map(|reading| reading.position)
                })
            };
            let result = CanonicalSectionals {
                pos_800m: position_at(choice.gate_800m),
                pos_400m: position_at(choice.gate_400m),
                matched_by: Some(kind),
            };
            if result.pos_800m.is_some() {
                coverage.filled_800m += 1;
            }
            if result.pos_400m.is_some() {
                coverage.filled_400m += 1;
            }
            result
        })
        .collect();

    (canonical, coverage)
}
