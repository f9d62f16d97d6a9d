//! Feature interactions built from already point-in-time inputs.
//!
//! Nothing here looks at history directly; every input comes from the base
//! record, the aggregate record or the pre-race rating of the same
//! participation (plus the same-race field for the in-race comparisons).

use serde::{Deserialize, Serialize};

use crate::aggregator::{AggregateRecord, PartitionKind};
use crate::config::AggregatorConfig;
use crate::field::{field_max, field_mean, ordinal_ranks, percent_ranks, RankOrder};
use crate::pipeline::BaseRecord;
use crate::rating::RatingRecord;
use crate::timeline::race_group_spans;

pub const LONGSHOT_ODDS: f64 = 20.0;
pub const MATURITY_RUNS: u32 = 10;
const COMPOSITE_MIN: f64 = 1200.0;
const COMPOSITE_MAX: f64 = 2000.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ComposedFeatures {
    pub odds_implied_probability: Option<f64>,
    pub is_longshot: bool,
    pub form_recency_score: f64,
    pub form_momentum: f64,
    pub composite_form_score: f64,
    pub rating_percentile_in_race: Option<f64>,
    pub rating_gap_to_top: Option<f64>,
    pub rating_vs_field_mean: Option<f64>,
    /// Market rank minus rating rank; positive when the market rates the
    /// horse lower than the rating does.
    pub odds_vs_rating_rank_gap: Option<i64>,
    pub jockey_trainer_win_product: Option<f64>,
    pub class_change: Option<i64>,
    pub rail_out_x_barrier: Option<f64>,
    pub feature_maturity_score: f64,
}

pub fn form_recency_score(days_since_last: Option<i64>) -> f64 {
    match days_since_last {
        None => 0.5,
        Some(days) if days <= 14 => 1.0,
        Some(days) if days <= 28 => 0.9,
        Some(days) if days <= 60 => 0.6,
        Some(_) => 0.3,
    }
}

pub fn form_momentum(recent_avg_position: Option<f64>) -> f64 {
    match recent_avg_position {
        None => 0.0,
        Some(avg) if avg <= 2.0 => 1.0,
        Some(avg) if avg <= 4.0 => 0.7,
        Some(avg) if avg <= 6.0 => 0.4,
        Some(_) => 0.1,
    }
}

/// Non-sequential legacy score from career strike rate and experience.
pub fn composite_form_score(win_rate: f64, runs: u32) -> f64 {
    let score = 1500.0 + win_rate * 100.0 * 5.0 + f64::from(runs.min(50)) * 2.0;
    score.clamp(COMPOSITE_MIN, COMPOSITE_MAX)
}

pub fn compose(
    base: &[BaseRecord],
    aggregates: &[AggregateRecord],
    ratings: &[RatingRecord],
    cfg: &AggregatorConfig,
) -> Vec<ComposedFeatures> {
    let short_window = cfg
        .horse_windows
        .iter()
        .enumerate()
        .min_by_key(|(_, size)| **size)
        .map(|(idx, _)| idx);

    let mut out: Vec<ComposedFeatures> = base
        .iter()
        .zip(aggregates)
        .map(|(record, agg)| compose_one(record, agg, short_window))
        .collect();

    let all: Vec<usize> = (0..base.len()).collect();
    for span in race_group_spans(base, &all) {
        let members = &all[span];
        let field_ratings: Vec<Option<f64>> = members
            .iter()
            .map(|idx| Some(ratings[*idx].rating_before))
            .collect();
        let rating_pct = percent_ranks(&field_ratings, RankOrder::Descending);
        let rating_ranks = ordinal_ranks(&field_ratings, RankOrder::Descending);
        let top = field_max(&field_ratings);
        let mean = field_mean(&field_ratings);

        for (slot, idx) in members.iter().enumerate() {
            let own = ratings[*idx].rating_before;
            let composed = &mut out[*idx];
            composed.rating_percentile_in_race = rating_pct[slot];
            composed.rating_gap_to_top = top.filter(|t| *t > 0.0).map(|t| (t - own) / t);
            composed.rating_vs_field_mean = mean.map(|m| own - m);
            composed.odds_vs_rating_rank_gap = aggregates[*idx]
                .field
                .odds_rank
                .zip(rating_ranks[slot])
                .map(|(market, rating)| i64::from(market) - i64::from(rating));
        }
    }
    out
}

fn compose_one(
    record: &BaseRecord,
    agg: &AggregateRecord,
    short_window: Option<usize>,
) -> ComposedFeatures {
    let odds = record.participation.win_odds.filter(|o| *o > 0.0);
    let horse = agg.partition(PartitionKind::HorseRegion);
    let runs = horse.map(|h| h.prefix.runs).unwrap_or(0);
    let win_rate = horse.map(|h| h.prefix.win_rate).unwrap_or(0.0);
    let recent_avg = horse
        .zip(short_window)
        .and_then(|(h, idx)| h.windows.get(idx))
        .and_then(|w| w.avg_position);

    let jockey_rate = agg
        .partition(PartitionKind::JockeyRegion)
        .map(|j| j.prefix.win_rate);
    let trainer_rate = agg
        .partition(PartitionKind::TrainerRegion)
        .map(|t| t.prefix.win_rate);

    ComposedFeatures {
        odds_implied_probability: odds.map(|o| 1.0 / o),
        is_longshot: odds.is_some_and(|o| o > LONGSHOT_ODDS),
        form_recency_score: form_recency_score(horse.and_then(|h| h.prefix.days_since_last)),
        form_momentum: form_momentum(recent_avg),
        composite_form_score: composite_form_score(win_rate, runs),
        jockey_trainer_win_product: jockey_rate.zip(trainer_rate).map(|(j, t)| j * t),
        class_change: agg
            .class_history
            .prev_class_tier
            .map(|prev| i64::from(record.class.tier) - i64::from(prev)),
        rail_out_x_barrier: record
            .rail
            .out_metres
            .zip(record.participation.barrier)
            .map(|(out, barrier)| out * f64::from(barrier)),
        feature_maturity_score: f64::from(runs.min(MATURITY_RUNS)) / f64::from(MATURITY_RUNS),
        ..ComposedFeatures::default()
    }
}
