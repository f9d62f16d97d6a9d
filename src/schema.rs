//! Snapshot schema and row flattening.
//!
//! The layout is a list of column specs, each pairing a column with the
//! function that extracts its value. Schema order and value order therefore
//! come from the same list and cannot drift apart.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::aggregator::{AggregateRecord, PartitionKind, PartitionStats};
use crate::composer::ComposedFeatures;
use crate::config::AggregatorConfig;
use crate::pipeline::BaseRecord;
use crate::rating::RatingRecord;

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureDType {
    Int,
    Real,
    Bool,
    Text,
}

impl FeatureDType {
    pub fn sql_type(self) -> &'static str {
        match self {
            Self::Int | Self::Bool => "INTEGER",
            Self::Real => "REAL",
            Self::Text => "TEXT",
        }
    }

    fn tag(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Real => "real",
            Self::Bool => "bool",
            Self::Text => "text",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub dtype: FeatureDType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<FeatureColumn>,
}

impl FeatureSchema {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FeatureValue {
    Null,
    Int(i64),
    Real(f64),
    Bool(bool),
    Text(String),
}

impl FeatureValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub values: Vec<FeatureValue>,
}

/// Everything known about one participation once all stages have run.
#[derive(Debug, Clone, Copy)]
pub struct FeatureRecord<'a> {
    pub base: &'a BaseRecord,
    pub aggregate: &'a AggregateRecord,
    pub rating: &'a RatingRecord,
    pub composed: &'a ComposedFeatures,
}

type Extractor = Box<dyn Fn(&FeatureRecord<'_>) -> FeatureValue + Send + Sync>;

struct ColumnSpec {
    column: FeatureColumn,
    extract: Extractor,
}

pub struct FeatureLayout {
    schema: FeatureSchema,
    specs: Vec<ColumnSpec>,
}

impl fmt::Debug for FeatureLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureLayout")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct LayoutBuilder {
    specs: Vec<ColumnSpec>,
}

impl LayoutBuilder {
    fn push<F>(&mut self, name: impl Into<String>, dtype: FeatureDType, extract: F)
    where
        F: Fn(&FeatureRecord<'_>) -> FeatureValue + Send + Sync + 'static,
    {
        self.specs.push(ColumnSpec {
            column: FeatureColumn {
                name: name.into(),
                dtype,
            },
            extract: Box::new(extract),
        });
    }

    fn int<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&FeatureRecord<'_>) -> Option<i64> + Send + Sync + 'static,
    {
        self.push(name, FeatureDType::Int, move |r| {
            f(r).map_or(FeatureValue::Null, FeatureValue::Int)
        });
    }

    fn real<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&FeatureRecord<'_>) -> Option<f64> + Send + Sync + 'static,
    {
        self.push(name, FeatureDType::Real, move |r| match f(r) {
            Some(v) if v.is_finite() => FeatureValue::Real(v),
            _ => FeatureValue::Null,
        });
    }

    fn flag<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&FeatureRecord<'_>) -> Option<bool> + Send + Sync + 'static,
    {
        self.push(name, FeatureDType::Bool, move |r| {
            f(r).map_or(FeatureValue::Null, FeatureValue::Bool)
        });
    }

    fn text<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&FeatureRecord<'_>) -> Option<String> + Send + Sync + 'static,
    {
        self.push(name, FeatureDType::Text, move |r| {
            f(r).map_or(FeatureValue::Null, FeatureValue::Text)
        });
    }

    /// Prefix columns shared by every partition kind.
    fn prefix_columns(&mut self, prefix: &str, kind: PartitionKind, runs_label: &str) {
        let stats = move |r: &FeatureRecord<'_>| r.aggregate.partition(kind).map(|s| s.prefix);
        self.int(format!("{prefix}_{runs_label}"), move |r| {
            stats(r).map(|p| i64::from(p.runs))
        });
        self.real(format!("{prefix}_win_rate"), move |r| stats(r).map(|p| p.win_rate));
        self.real(format!("{prefix}_place_rate"), move |r| {
            stats(r).map(|p| p.place_rate)
        });
    }

    fn window_columns(&mut self, prefix: &str, kind: PartitionKind, sizes: &[usize]) {
        for (slot, size) in sizes.iter().enumerate() {
            let window = move |r: &FeatureRecord<'_>| {
                r.aggregate
                    .partition(kind)
                    .and_then(|s: &PartitionStats| s.windows.get(slot).copied())
            };
            let name = format!("{prefix}_last_{size}");
            self.int(format!("{name}_runs"), move |r| {
                window(r).map(|w| i64::from(w.count))
            });
            self.real(format!("{name}_avg_position"), move |r| {
                window(r).and_then(|w| w.avg_position)
            });
            self.real(format!("{name}_std_position"), move |r| {
                window(r).and_then(|w| w.std_position)
            });
            self.real(format!("{name}_win_rate"), move |r| window(r).map(|w| w.win_rate));
            self.real(format!("{name}_place_rate"), move |r| {
                window(r).map(|w| w.place_rate)
            });
        }
    }
}

impl FeatureLayout {
    pub fn new(cfg: &AggregatorConfig) -> Self {
        let mut b = LayoutBuilder::default();

        // identity
        b.text("race_id", |r| Some(r.base.participation.race_id.clone()));
        b.text("race_date", |r| Some(r.base.key.race_date.to_string()));
        b.int("race_number", |r| Some(i64::from(r.base.participation.race_number)));
        b.text("horse_id", |r| Some(r.base.participation.horse_id.clone()));
        b.text("horse_name", |r| Some(r.base.participation.horse_name.clone()));
        b.int("horse_number", |r| r.base.participation.horse_number.map(i64::from));
        b.text("jockey_id", |r| r.base.participation.jockey_id.clone());
        b.text("trainer_id", |r| r.base.participation.trainer_id.clone());

        // race context
        b.text("track_name", |r| Some(r.base.participation.track_name.clone()));
        b.text("region", |r| Some(r.base.profile.region.clone()));
        b.text("venue_category", |r| Some(r.base.profile.category.as_str().to_string()));
        b.text("surface", |r| Some(r.base.profile.surface.as_str().to_string()));
        b.text("track_direction", |r| Some(r.base.profile.direction.as_str().to_string()));
        b.int("distance_m", |r| Some(i64::from(r.base.participation.distance_m)));
        b.text("distance_range", |r| Some(r.base.distance_bucket.as_str().to_string()));
        b.text("track_condition_group", |r| {
            Some(r.base.condition_group.as_str().to_string())
        });
        b.text("class_text", |r| Some(r.base.participation.class_text.clone()));
        b.int("class_tier", |r| Some(i64::from(r.base.class.tier)));
        b.text("race_grade", |r| r.base.class.grade.map(|g| g.as_str().to_string()));
        b.flag("is_maiden", |r| Some(r.base.is_maiden));
        b.flag("is_handicap", |r| Some(r.base.is_handicap));
        b.int("field_size", |r| Some(i64::from(r.base.field_size)));
        b.int("barrier", |r| r.base.participation.barrier.map(i64::from));
        b.text("barrier_group", |r| Some(r.base.barrier_group.as_str().to_string()));
        b.real("weight_carried", |r| r.base.participation.weight_carried);
        b.real("win_odds", |r| r.base.participation.win_odds);
        b.flag("is_rail_true", |r| Some(r.base.rail.is_true));
        b.real("rail_out_metres", |r| r.base.rail.out_metres);

        // horse career in region
        let horse = |r: &FeatureRecord<'_>| {
            r.aggregate
                .partition(PartitionKind::HorseRegion)
                .map(|s| s.prefix)
        };
        b.int("horse_total_races", move |r| horse(r).map(|p| i64::from(p.runs)));
        b.int("horse_wins", move |r| horse(r).map(|p| i64::from(p.wins)));
        b.int("horse_places", move |r| horse(r).map(|p| i64::from(p.places)));
        b.real("horse_win_rate", move |r| horse(r).map(|p| p.win_rate));
        b.real("horse_place_rate", move |r| horse(r).map(|p| p.place_rate));
        b.int("days_since_last_race", move |r| horse(r).and_then(|p| p.days_since_last));
        b.int("horse_last_position", move |r| {
            horse(r).and_then(|p| p.last_position).map(i64::from)
        });
        b.flag("is_first_timer", move |r| horse(r).map(|p| p.runs == 0));
        b.flag("never_placed_flag", move |r| {
            horse(r).map(|p| p.runs > 0 && p.places == 0)
        });
        b.window_columns("horse", PartitionKind::HorseRegion, &cfg.horse_windows);

        // horse sectional and class history
        b.real("horse_avg_pos_800m_recent", |r| r.aggregate.sectional.avg_pos_800m);
        b.real("horse_early_speed_share", |r| r.aggregate.sectional.early_speed_share);
        b.real("horse_avg_late_improvement", |r| {
            r.aggregate.sectional.avg_late_improvement
        });
        b.text("horse_last_running_style", |r| {
            r.aggregate
                .sectional
                .last_running_style
                .map(|s| s.as_str().to_string())
        });
        b.int("horse_prev_class_tier", |r| {
            r.aggregate.class_history.prev_class_tier.map(i64::from)
        });
        b.real("horse_avg_class_tier_recent", |r| r.aggregate.class_history.avg_class_tier);
        b.int("horse_prior_runs_other_regions", |r| {
            Some(i64::from(r.aggregate.prior_runs_other_regions))
        });
        b.flag("is_cross_region_horse", |r| {
            Some(r.aggregate.prior_runs_other_regions > 0)
        });

        // connections
        b.prefix_columns("jockey", PartitionKind::JockeyRegion, "total_rides");
        b.window_columns("jockey", PartitionKind::JockeyRegion, &cfg.connection_windows);
        b.prefix_columns("trainer", PartitionKind::TrainerRegion, "total_runners");
        b.window_columns("trainer", PartitionKind::TrainerRegion, &cfg.connection_windows);

        // specialisation
        b.prefix_columns("horse_track", PartitionKind::HorseTrack, "runs");
        b.prefix_columns("horse_distance", PartitionKind::HorseDistance, "runs");
        b.prefix_columns("horse_barrier_group", PartitionKind::HorseBarrier, "runs");
        b.prefix_columns("horse_condition", PartitionKind::HorseCondition, "runs");
        b.prefix_columns("jockey_track", PartitionKind::JockeyTrack, "rides");
        b.prefix_columns("jockey_horse", PartitionKind::JockeyHorse, "rides");
        b.prefix_columns("jockey_trainer", PartitionKind::JockeyTrainer, "rides");

        // same-race field
        b.int("odds_rank_in_race", |r| r.aggregate.field.odds_rank.map(i64::from));
        b.real("odds_percentile_in_race", |r| r.aggregate.field.odds_percentile);
        b.flag("is_favorite", |r| Some(r.aggregate.field.is_favorite));
        b.real("horse_win_rate_percentile_in_race", |r| {
            r.aggregate.field.win_rate_percentile
        });
        b.real("weight_vs_field_mean", |r| r.aggregate.field.weight_vs_field_mean);

        // rating
        b.real("rating_before", |r| Some(r.rating.rating_before));
        b.int("rating_prior_races", |r| Some(i64::from(r.rating.prior_rated_races)));
        b.flag("is_rating_default", |r| Some(r.rating.is_rating_default));

        // interactions
        b.real("odds_implied_probability", |r| r.composed.odds_implied_probability);
        b.flag("is_longshot", |r| Some(r.composed.is_longshot));
        b.real("form_recency_score", |r| Some(r.composed.form_recency_score));
        b.real("form_momentum", |r| Some(r.composed.form_momentum));
        b.real("composite_form_score", |r| Some(r.composed.composite_form_score));
        b.real("rating_percentile_in_race", |r| r.composed.rating_percentile_in_race);
        b.real("rating_gap_to_top", |r| r.composed.rating_gap_to_top);
        b.real("rating_vs_field_mean", |r| r.composed.rating_vs_field_mean);
        b.int("odds_vs_rating_rank_gap", |r| r.composed.odds_vs_rating_rank_gap);
        b.real("jockey_trainer_win_product", |r| r.composed.jockey_trainer_win_product);
        b.int("class_change", |r| r.composed.class_change);
        b.real("rail_out_x_barrier", |r| r.composed.rail_out_x_barrier);
        b.real("feature_maturity_score", |r| Some(r.composed.feature_maturity_score));

        // post-race values, training targets only
        b.int("target_finish_position", |r| Some(i64::from(r.base.finish_position)));
        b.flag("target_won", |r| Some(r.base.finish_position == 1));
        b.real("rating_after", |r| Some(r.rating.rating_after));

        let columns: Vec<FeatureColumn> = b.specs.iter().map(|s| s.column.clone()).collect();
        let fingerprint = schema_fingerprint(cfg, &columns);

        info!(
            component = "schema",
            event = "schema.built",
            version = FEATURE_SCHEMA_VERSION,
            column_count = columns.len(),
            fingerprint = %fingerprint
        );

        Self {
            schema: FeatureSchema {
                version: FEATURE_SCHEMA_VERSION,
                fingerprint,
                columns,
            },
            specs: b.specs,
        }
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    pub fn flatten(&self, record: &FeatureRecord<'_>) -> FeatureRow {
        FeatureRow {
            values: self.specs.iter().map(|spec| (spec.extract)(record)).collect(),
        }
    }
}

pub fn build_feature_schema(cfg: &AggregatorConfig) -> FeatureSchema {
    FeatureLayout::new(cfg).schema
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), SchemaError> {
    if expected_version != actual.version {
        return Err(SchemaError::SchemaVersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(SchemaError::SchemaFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

fn schema_fingerprint(cfg: &AggregatorConfig, columns: &[FeatureColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{FEATURE_SCHEMA_VERSION};"));
    hasher.update("horse_windows:");
    for window in &cfg.horse_windows {
        hasher.update(format!("{window},"));
    }
    hasher.update(";connection_windows:");
    for window in &cfg.connection_windows {
        hasher.update(format!("{window},"));
    }
    hasher.update(";columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(format!(":{};", column.dtype.tag()));
    }
    hex::encode(hasher.finalize())
}

/// Content hash of a whole snapshot. Reals hash by bit pattern, so two
/// digests match only when every value is bit-identical.
pub fn snapshot_digest(schema: &FeatureSchema, rows: &[FeatureRow]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(schema.fingerprint.as_bytes());
    for row in rows {
        hasher.update(b"\n");
        for value in &row.values {
            match value {
                FeatureValue::Null => hasher.update(b"n;"),
                FeatureValue::Int(v) => hasher.update(format!("i{v};")),
                FeatureValue::Real(v) => hasher.update(format!("r{:016x};", v.to_bits())),
                FeatureValue::Bool(v) => hasher.update(if *v { "b1;" } else { "b0;" }),
                FeatureValue::Text(v) => hasher.update(format!("t{}:{v};", v.len())),
            }
        }
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::aggregate;
    use crate::composer::compose;
    use crate::pipeline::tests::base_record;
    use crate::pipeline::CancelFlag;
    use crate::rating::RatingRecord;

    #[test]
    fn schema_order_is_stable_and_windows_expand() {
        let schema = build_feature_schema(&AggregatorConfig::default());
        let names: Vec<&str> = schema.columns.iter().map(|c| c.name.as_str()).collect();

        assert_eq!(&names[..4], &["race_id", "race_date", "race_number", "horse_id"]);
        assert_eq!(names.last(), Some(&"rating_after"));
        assert!(names.contains(&"horse_last_5_avg_position"));
        assert!(names.contains(&"horse_last_20_std_position"));
        assert!(names.contains(&"jockey_last_100_win_rate"));
        assert!(names.contains(&"trainer_total_runners"));
        assert!(names.contains(&"jockey_trainer_rides"));
        assert!(!names.contains(&"horse_last_50_avg_position"));

        let mut unique = names.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), names.len());

        let again = build_feature_schema(&AggregatorConfig::default());
        assert_eq!(schema, again);
    }

    #[test]
    fn in_race_values_only_appear_as_targets() {
        let schema = build_feature_schema(&AggregatorConfig::default());
        for column in &schema.columns {
            let name = column.name.as_str();
            assert!(!name.contains("margin"), "{name}");
            assert!(!name.contains("pos_800m") || name.contains("recent"), "{name}");
            if name.contains("finish_position") {
                assert_eq!(name, "target_finish_position");
            }
        }
    }

    #[test]
    fn fingerprint_changes_with_windows() {
        let a = build_feature_schema(&AggregatorConfig::default());
        let b = build_feature_schema(&AggregatorConfig {
            horse_windows: vec![5, 50],
            connection_windows: vec![20, 50, 100],
        });
        assert_ne!(a.fingerprint, b.fingerprint);
        assert!(assert_schema_compatible(FEATURE_SCHEMA_VERSION, &a.fingerprint, &a).is_ok());
        assert!(matches!(
            assert_schema_compatible(FEATURE_SCHEMA_VERSION, &a.fingerprint, &b),
            Err(SchemaError::SchemaFingerprintMismatch { .. })
        ));
        assert!(matches!(
            assert_schema_compatible(FEATURE_SCHEMA_VERSION + 1, &a.fingerprint, &a),
            Err(SchemaError::SchemaVersionMismatch { .. })
        ));
    }

    #[test]
    fn flattened_row_lines_up_with_schema() {
        let cfg = AggregatorConfig::default();
        let base = vec![base_record("r1", 1, "h1", "j1", 2, 0)];
        let aggregates = aggregate(&base, &cfg, &CancelFlag::default()).expect("sorted");
        let ratings = vec![RatingRecord {
            rating_before: 1200.0,
            rating_after: 1212.8,
            prior_rated_races: 0,
            is_rating_default: true,
        }];
        let composed = compose(&base, &aggregates, &ratings, &cfg);
        let layout = FeatureLayout::new(&cfg);
        let row = layout.flatten(&FeatureRecord {
            base: &base[0],
            aggregate: &aggregates[0],
            rating: &ratings[0],
            composed: &composed[0],
        });

        let schema = layout.schema();
        assert_eq!(row.values.len(), schema.columns.len());
        let value = |name: &str| &row.values[schema.column_index(name).expect("column exists")];
        assert_eq!(value("race_id"), &FeatureValue::Text("r1".to_string()));
        assert_eq!(value("horse_total_races"), &FeatureValue::Int(0));
        assert_eq!(value("is_first_timer"), &FeatureValue::Bool(true));
        assert_eq!(value("horse_last_5_avg_position"), &FeatureValue::Null);
        assert_eq!(value("days_since_last_race"), &FeatureValue::Null);
        assert_eq!(value("target_finish_position"), &FeatureValue::Int(2));
        assert_eq!(value("rating_before"), &FeatureValue::Real(1200.0));

        for (column, value) in schema.columns.iter().zip(&row.values) {
            let ok = match value {
                FeatureValue::Null => true,
                FeatureValue::Int(_) => column.dtype == FeatureDType::Int,
                FeatureValue::Real(_) => column.dtype == FeatureDType::Real,
                FeatureValue::Bool(_) => column.dtype == FeatureDType::Bool,
                FeatureValue::Text(_) => column.dtype == FeatureDType::Text,
            };
            assert!(ok, "{} holds a value of the wrong type", column.name);
        }
    }

    #[test]
    fn digest_distinguishes_nearly_equal_reals() {
        let schema = build_feature_schema(&AggregatorConfig::default());
        let a = vec![FeatureRow {
            values: vec![FeatureValue::Real(0.1 + 0.2)],
        }];
        let b = vec![FeatureRow {
            values: vec![FeatureValue::Real(0.3)],
        }];
        assert_ne!(snapshot_digest(&schema, &a), snapshot_digest(&schema, &b));
        assert_eq!(snapshot_digest(&schema, &a), snapshot_digest(&schema, &a.clone()));
    }
}
