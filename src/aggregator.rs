//! Point-in-time windowed aggregation.
//!
//! Every statistic for a participation is produced by [`fold_timeline`],
//! which hands it the partition state from before the participation's race
//! group. Partitions share nothing, so each partition kind fans its timelines
//! out over rayon and scatters the results back by record index.

use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::AggregatorConfig;
use crate::field::{field_mean, ordinal_ranks, percent_ranks, RankOrder};
use crate::pipeline::{BaseRecord, CancelFlag};
use crate::rolling::{
    ClassHistory, ClassSummary, PrefixStats, PrefixTotals, SectionalHistory, SectionalSummary,
    WindowAccumulator, WindowStats,
};
use crate::timeline::{build_timelines, fold_timeline, race_group_spans, verify_sorted};

const KEY_SEPARATOR: &str = "\u{1f}";

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("aggregation cancelled")]
    Cancelled,
    #[error("base records out of order at index {index}")]
    Unsorted { index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PartitionKind {
    HorseRegion,
    JockeyRegion,
    TrainerRegion,
    HorseTrack,
    HorseDistance,
    HorseBarrier,
    HorseCondition,
    JockeyTrack,
    JockeyHorse,
    JockeyTrainer,
}

impl PartitionKind {
    pub const ALL: [PartitionKind; 10] = [
        Self::HorseRegion,
        Self::JockeyRegion,
        Self::TrainerRegion,
        Self::HorseTrack,
        Self::HorseDistance,
        Self::HorseBarrier,
        Self::HorseCondition,
        Self::JockeyTrack,
        Self::JockeyHorse,
        Self::JockeyTrainer,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::HorseRegion => "horse_region",
            Self::JockeyRegion => "jockey_region",
            Self::TrainerRegion => "trainer_region",
            Self::HorseTrack => "horse_track",
            Self::HorseDistance => "horse_distance",
            Self::HorseBarrier => "horse_barrier",
            Self::HorseCondition => "horse_condition",
            Self::JockeyTrack => "jockey_track",
            Self::JockeyHorse => "jockey_horse",
            Self::JockeyTrainer => "jockey_trainer",
        }
    }

    /// Partition key for a record, or `None` when a component is unknown.
    /// Every key is scoped to the record's region.
    pub fn key_for(self, record: &BaseRecord) -> Option<String> {
        let p = &record.participation;
        let horse = p.horse_id.as_str();
        let region = record.profile.region.as_str();
        let track = record.track_key.as_str();
        let parts: [&str; 3] = match self {
            Self::HorseRegion => [horse, region, ""],
            Self::JockeyRegion => [p.jockey_id.as_deref()?, region, ""],
            Self::TrainerRegion => [p.trainer_id.as_deref()?, region, ""],
            Self::HorseTrack => [horse, region, track],
            Self::HorseDistance => [horse, region, record.distance_bucket.as_str()],
            Self::HorseBarrier => [horse, region, record.barrier_group.as_str()],
            Self::HorseCondition => [horse, region, record.condition_group.as_str()],
            Self::JockeyTrack => [p.jockey_id.as_deref()?, region, track],
            Self::JockeyHorse => [p.jockey_id.as_deref()?, region, horse],
            Self::JockeyTrainer => [p.jockey_id.as_deref()?, p.trainer_id.as_deref()?, region],
        };
        Some(parts.join(KEY_SEPARATOR))
    }

    fn windows(self, cfg: &AggregatorConfig) -> &[usize] {
        match self {
            Self::HorseRegion => &cfg.horse_windows,
            Self::JockeyRegion | Self::TrainerRegion => &cfg.connection_windows,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionStats {
    pub prefix: PrefixStats,
    /// One entry per configured window, in configuration order.
    pub windows: Vec<WindowStats>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldComparison {
    pub odds_rank: Option<u32>,
    pub odds_percentile: Option<f64>,
    pub is_favorite: bool,
    pub win_rate_percentile: Option<f64>,
    pub weight_vs_field_mean: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    /// Indexed by [`PartitionKind::index`].
    pub partitions: Vec<Option<PartitionStats>>,
    pub sectional: SectionalSummary,
    pub class_history: ClassSummary,
    pub prior_runs_other_regions: u32,
    pub field: FieldComparison,
}

impl AggregateRecord {
    pub fn partition(&self, kind: PartitionKind) -> Option<&PartitionStats> {
        self.partitions.get(kind.index()).and_then(Option::as_ref)
    }
}

struct PartitionState {
    totals: PrefixTotals,
    windows: Vec<WindowAccumulator>,
}

impl PartitionState {
    fn new(sizes: &[usize]) -> Self {
        Self {
            totals: PrefixTotals::default(),
            windows: sizes.iter().map(|size| WindowAccumulator::new(*size)).collect(),
        }
    }

    fn read(&self, record: &BaseRecord) -> PartitionStats {
        PartitionStats {
            prefix: self.totals.stats_at(record.key.race_date),
            windows: self.windows.iter().map(WindowAccumulator::stats).collect(),
        }
    }

    fn commit(&mut self, record: &BaseRecord) {
        let outcome = record.outcome();
        self.totals.push(&outcome);
        for window in &mut self.windows {
            window.push(outcome.finish_position);
        }
    }
}

#[derive(Default)]
struct HorseHistoryState {
    sectional: SectionalHistory,
    class: ClassHistory,
}

pub fn aggregate(
    records: &[BaseRecord],
    cfg: &AggregatorConfig,
    cancel: &CancelFlag,
) -> Result<Vec<AggregateRecord>, AggregateError> {
    verify_sorted(records).map_err(|v| AggregateError::Unsorted { index: v.index })?;

    let mut partitions: Vec<Vec<Option<PartitionStats>>> =
        Vec::with_capacity(PartitionKind::ALL.len());
    for kind in PartitionKind::ALL {
        if cancel.is_cancelled() {
            return Err(AggregateError::Cancelled);
        }
        partitions.push(compute_partition(records, kind, kind.windows(cfg)));
    }

    if cancel.is_cancelled() {
        return Err(AggregateError::Cancelled);
    }
    let (sectional, class_history) = compute_horse_history(records);
    let cross_region = compute_cross_region(records);
    let horse_win_rates: Vec<Option<f64>> = partitions[PartitionKind::HorseRegion.index()]
        .iter()
        .map(|stats| stats.as_ref().map(|s| s.prefix.win_rate))
        .collect();
    let field = compute_field_comparisons(records, &horse_win_rates);

    let mut per_kind: Vec<std::vec::IntoIter<Option<PartitionStats>>> =
        partitions.into_iter().map(Vec::into_iter).collect();
    let mut out = Vec::with_capacity(records.len());
    for idx in 0..records.len() {
        let partitions = per_kind
            .iter_mut()
            .map(|column| column.next().flatten())
            .collect();
        out.push(AggregateRecord {
            partitions,
            sectional: sectional[idx],
            class_history: class_history[idx],
            prior_runs_other_regions: cross_region[idx],
            field: field[idx],
        });
    }

    info!(
        component = "aggregator",
        event = "aggregator.finish",
        records = out.len(),
        partition_kinds = PartitionKind::ALL.len(),
        horse_windows = ?cfg.horse_windows,
        connection_windows = ?cfg.connection_windows
    );
    Ok(out)
}

fn compute_partition(
    records: &[BaseRecord],
    kind: PartitionKind,
    window_sizes: &[usize],
) -> Vec<Option<PartitionStats>> {
    let timelines = build_timelines(records, |record| kind.key_for(record));
    let folded: Vec<Vec<(usize, PartitionStats)>> = timelines
        .par_iter()
        .map(|timeline| {
            let mut state = PartitionState::new(window_sizes);
            fold_timeline(
                records,
                &timeline.entries,
                &mut state,
                PartitionState::read,
                PartitionState::commit,
            )
        })
        .collect();

    let mut out = vec![None; records.len()];
    for (idx, stats) in folded.into_iter().flatten() {
        out[idx] = Some(stats);
    }
    debug!(
        component = "aggregator",
        event = "aggregator.partition.done",
        kind = kind.name(),
        timelines = timelines.len(),
        covered = out.iter().filter(|s| s.is_some()).count()
    );
    out
}

fn compute_horse_history(records: &[BaseRecord]) -> (Vec<SectionalSummary>, Vec<ClassSummary>) {
    let timelines = build_timelines(records, |record| PartitionKind::HorseRegion.key_for(record));
    let folded: Vec<Vec<(usize, (SectionalSummary, ClassSummary))>> = timelines
        .par_iter()
        .map(|timeline| {
            let mut state = HorseHistoryState::default();
            fold_timeline(
                records,
                &timeline.entries,
                &mut state,
                |s, _| (s.sectional.summary(), s.class.summary()),
                |s, record| {
                    let outcome = record.outcome();
                    s.sectional.push(&outcome);
                    s.class.push(&outcome);
                },
            )
        })
        .collect();

    let mut sectional = vec![SectionalSummary::default(); records.len()];
    let mut class = vec![ClassSummary::default(); records.len()];
    for (idx, (s, c)) in folded.into_iter().flatten() {
        sectional[idx] = s;
        class[idx] = c;
    }
    (sectional, class)
}

/// Prior runs outside the participation's own region, from the horse's
/// global (region-free) timeline.
fn compute_cross_region(records: &[BaseRecord]) -> Vec<u32> {
    let timelines = build_timelines(records, |record| Some(record.participation.horse_id.clone()));
    let folded: Vec<Vec<(usize, u32)>> = timelines
        .par_iter()
        .map(|timeline| {
            let mut runs_by_region: BTreeMap<String, u32> = BTreeMap::new();
            fold_timeline(
                records,
                &timeline.entries,
                &mut runs_by_region,
                |runs, record| {
                    runs.iter()
                        .filter(|(region, _)| **region != record.profile.region)
                        .map(|(_, count)| *count)
                        .sum::<u32>()
                },
                |runs, record| *runs.entry(record.profile.region.clone()).or_insert(0) += 1,
            )
        })
        .collect();

    let mut out = vec![0; records.len()];
    for (idx, count) in folded.into_iter().flatten() {
        out[idx] = count;
    }
    out
}

fn compute_field_comparisons(
    records: &[BaseRecord],
    horse_win_rates: &[Option<f64>],
) -> Vec<FieldComparison> {
    let all: Vec<usize> = (0..records.len()).collect();
    let mut out = vec![FieldComparison::default(); records.len()];

    for span in race_group_spans(records, &all) {
        let members = &all[span];
        let odds: Vec<Option<f64>> = members
            .iter()
            .map(|idx| records[*idx].participation.win_odds.filter(|o| *o > 0.0))
            .collect();
        let win_rates: Vec<Option<f64>> = members.iter().map(|idx| horse_win_rates[*idx]).collect();
        let weights: Vec<Option<f64>> = members
            .iter()
            .map(|idx| records[*idx].participation.weight_carried)
            .collect();

        let odds_ranks = ordinal_ranks(&odds, RankOrder::Ascending);
        let odds_pct = percent_ranks(&odds, RankOrder::Ascending);
        let win_pct = percent_ranks(&win_rates, RankOrder::Descending);
        let mean_weight = field_mean(&weights);

        for (slot, idx) in members.iter().enumerate() {
            out[*idx] = FieldComparison {
                odds_rank: odds_ranks[slot],
                odds_percentile: odds_pct[slot],
                is_favorite: odds_ranks[slot] == Some(1),
                win_rate_percentile: win_pct[slot],
                weight_vs_field_mean: weights[slot].zip(mean_weight).map(|(w, m)| w - m),
            };
        }
    }
    out
}
