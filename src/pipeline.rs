//! Stage composition.
//!
//! `SourceData -> BaseStage -> aggregates -> ratings -> composed -> rows`.
//! Every stage is a pure function of the stages before it; the coordinator
//! checkpoints their outputs and this module only wires them together.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::aggregator::{aggregate, AggregateError, AggregateRecord};
use crate::class_tier::{is_handicap, is_maiden, ClassAssignment};
use crate::composer::{compose, ComposedFeatures};
use crate::config::{AggregatorConfig, RebuildConfig};
use crate::participation::{RaceParticipation, SourceData};
use crate::rating::{rate_participations, RatingEntry, RatingError, RatingParams, RatingRecord};
use crate::reference::CompiledReference;
use crate::rolling::RunOutcome;
use crate::schema::{FeatureLayout, FeatureRecord, FeatureRow, FeatureSchema};
use crate::sectionals::{reconcile_sectionals, CanonicalSectionals, SectionalCoverage, SectionalTarget};
use crate::taxonomy::{
    barrier_group, condition_group, distance_bucket, normalize_track_name, parse_rail,
    BarrierGroup, ConditionGroup, DistanceBucket, RailPosition, TrackProfile,
};
use crate::timeline::SortKey;

/// Finishing positions at or above this mark non-finishers in the source.
pub const NON_FINISHER_POSITION: u32 = 50;

pub fn is_finishing_position(position: u32) -> bool {
    position != 0 && position < NON_FINISHER_POSITION
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
    #[error(transparent)]
    Rating(#[from] RatingError),
    #[error("stage {stage} produced {actual} records for {expected} base records")]
    LengthMismatch {
        stage: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Cooperative cancellation shared between the coordinator and its stages.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseRecord {
    pub key: SortKey,
    pub participation: RaceParticipation,
    pub profile: TrackProfile,
    pub track_key: String,
    /// Declared runners in the race, non-finishers included.
    pub field_size: u32,
    pub finish_position: u32,
    /// False for fallers and other non-finishers. They take part in the
    /// same-race comparisons but never feed history or emit a row.
    pub finished: bool,
    pub distance_bucket: DistanceBucket,
    pub barrier_group: BarrierGroup,
    pub condition_group: ConditionGroup,
    pub class: ClassAssignment,
    pub is_maiden: bool,
    pub is_handicap: bool,
    pub rail: RailPosition,
    pub sectionals: CanonicalSectionals,
}

impl BaseRecord {
    pub fn outcome(&self) -> RunOutcome {
        RunOutcome {
            race_date: self.key.race_date,
            finish_position: self.finish_position,
            field_size: self.field_size,
            pos_800m: self.sectionals.pos_800m,
            class_tier: self.class.tier,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionCounts {
    pub missing_position: u64,
    pub non_finisher: u64,
    pub missing_horse: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseStage {
    /// Every declared runner, sorted by [`SortKey`].
    pub records: Vec<BaseRecord>,
    pub coverage: SectionalCoverage,
    pub excluded: ExclusionCounts,
}

pub fn build_base_stage(source: &SourceData, reference: &CompiledReference) -> BaseStage {
    let mut excluded = ExclusionCounts::default();
    // Declared runners: everything except scratchings and rows without a
    // horse. Non-finishers stay in the field but never emit a row.
    let declared: Vec<(u64, &RaceParticipation, u32)> = source
        .participations
        .iter()
        .enumerate()
        .filter_map(|(ordinal, p)| {
            if p.horse_id.trim().is_empty() {
                excluded.missing_horse += 1;
                return None;
            }
            match p.finish_position {
                None => {
                    excluded.missing_position += 1;
                    None
                }
                Some(pos) => {
                    if !is_finishing_position(pos) {
                        excluded.non_finisher += 1;
                    }
                    Some((ordinal as u64, p, pos))
                }
            }
        })
        .collect();

    let mut field_sizes: HashMap<&str, u32> = HashMap::new();
    for (_, p, _) in &declared {
        *field_sizes.entry(p.race_id.as_str()).or_insert(0) += 1;
    }

    let mut records: Vec<BaseRecord> = declared
        .iter()
        .map(|(ordinal, p, position)| {
            let profile = reference
                .taxonomy
                .resolve(&p.track_name, p.locale_hint.as_deref());
            let field_size = field_sizes.get(p.race_id.as_str()).copied().unwrap_or(1);
            let class = reference.class_rules.classify(&p.class_text, profile.category);
            BaseRecord {
                key: SortKey::for_participation(p, *ordinal),
                track_key: normalize_track_name(&p.track_name),
                field_size,
                finish_position: *position,
                finished: is_finishing_position(*position),
                distance_bucket: distance_bucket(p.distance_m),
                barrier_group: barrier_group(p.barrier, field_size),
                condition_group: condition_group(p.track_condition.as_deref()),
                class,
                is_maiden: is_maiden(&p.class_text),
                is_handicap: is_handicap(&p.class_text),
                rail: parse_rail(p.rail_text.as_deref()),
                sectionals: CanonicalSectionals::default(),
                profile,
                participation: (*p).clone(),
            }
        })
        .collect();
    records.sort_by(|a, b| a.key.cmp(&b.key));

    let targets: Vec<SectionalTarget<'_>> = records
        .iter()
        .map(|r| SectionalTarget {
            race_id: &r.participation.race_id,
            horse_name: &r.participation.horse_name,
            horse_number: r.participation.horse_number,
            region: &r.profile.region,
            distance_m: r.participation.distance_m,
        })
        .collect();
    let (canonical, coverage) =
        reconcile_sectionals(&targets, &source.readings, &reference.checkpoints);
    drop(targets);
    for (record, sectionals) in records.iter_mut().zip(canonical) {
        record.sectionals = sectionals;
    }

    info!(
        component = "pipeline",
        event = "pipeline.base.built",
        input_rows = source.participations.len(),
        records = records.len(),
        finishers = records.iter().filter(|r| r.finished).count(),
        races = field_sizes.len(),
        excluded_missing_position = excluded.missing_position,
        excluded_non_finisher = excluded.non_finisher,
        excluded_missing_horse = excluded.missing_horse
    );
    info!(
        component = "sectionals",
        event = "sectionals.coverage",
        participations = coverage.participations,
        mapped = coverage.mapped,
        unmapped = coverage.unmapped,
        matched_by_name = coverage.matched_by_name,
        matched_by_number = coverage.matched_by_number,
        unmatched = coverage.unmatched,
        filled_800m = coverage.filled_800m,
        filled_400m = coverage.filled_400m
    );

    BaseStage {
        records,
        coverage,
        excluded,
    }
}

pub fn build_aggregate_stage(
    base: &BaseStage,
    cfg: &AggregatorConfig,
    cancel: &CancelFlag,
) -> Result<Vec<AggregateRecord>, PipelineError> {
    let aggregates = aggregate(&base.records, cfg, cancel)?;
    check_len("aggregate", base.records.len(), aggregates.len())?;
    Ok(aggregates)
}

pub fn build_rating_stage(
    base: &BaseStage,
    params: &RatingParams,
) -> Result<Vec<RatingRecord>, PipelineError> {
    let entries: Vec<RatingEntry<'_>> = base
        .records
        .iter()
        .map(|r| RatingEntry {
            race_id: &r.participation.race_id,
            race_date: r.key.race_date,
            horse_id: &r.participation.horse_id,
            finish_position: r.finish_position,
            field_size: r.field_size,
            grade: r.class.grade,
            finished: r.finished,
        })
        .collect();
    let ratings = rate_participations(&entries, params)?;
    check_len("rating", base.records.len(), ratings.len())?;
    Ok(ratings)
}

pub fn build_composed_stage(
    base: &BaseStage,
    aggregates: &[AggregateRecord],
    ratings: &[RatingRecord],
    cfg: &AggregatorConfig,
) -> Result<Vec<ComposedFeatures>, PipelineError> {
    check_len("aggregate", base.records.len(), aggregates.len())?;
    check_len("rating", base.records.len(), ratings.len())?;
    Ok(compose(&base.records, aggregates, ratings, cfg))
}

pub fn assemble_rows(
    layout: &FeatureLayout,
    base: &BaseStage,
    aggregates: &[AggregateRecord],
    ratings: &[RatingRecord],
    composed: &[ComposedFeatures],
) -> Result<Vec<FeatureRow>, PipelineError> {
    let n = base.records.len();
    check_len("aggregate", n, aggregates.len())?;
    check_len("rating", n, ratings.len())?;
    check_len("compose", n, composed.len())?;

    Ok((0..n)
        .into_par_iter()
        .filter(|idx| base.records[*idx].finished)
        .map(|idx| {
            layout.flatten(&FeatureRecord {
                base: &base.records[idx],
                aggregate: &aggregates[idx],
                rating: &ratings[idx],
                composed: &composed[idx],
            })
        })
        .collect())
}

fn check_len(stage: &'static str, expected: usize, actual: usize) -> Result<(), PipelineError> {
    if expected == actual {
        Ok(())
    } else {
        Err(PipelineError::LengthMismatch {
            stage,
            expected,
            actual,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    pub schema: FeatureSchema,
    pub rows: Vec<FeatureRow>,
    pub coverage: SectionalCoverage,
    pub excluded: ExclusionCounts,
}

/// Runs every stage in memory. The coordinator runs the same stages one at a
/// time so it can checkpoint between them.
pub fn build_feature_table(
    source: &SourceData,
    reference: &CompiledReference,
    cfg: &RebuildConfig,
    cancel: &CancelFlag,
) -> Result<FeatureTable, PipelineError> {
    let base = build_base_stage(source, reference);
    let aggregates = build_aggregate_stage(&base, &cfg.aggregator, cancel)?;
    let ratings = build_rating_stage(&base, &cfg.rating)?;
    let composed = build_composed_stage(&base, &aggregates, &ratings, &cfg.aggregator)?;
    let layout = FeatureLayout::new(&cfg.aggregator);
    let rows = assemble_rows(&layout, &base, &aggregates, &ratings, &composed)?;
    Ok(FeatureTable {
        schema: layout.schema().clone(),
        rows,
        coverage: base.coverage,
        excluded: base.excluded,
    })
}
