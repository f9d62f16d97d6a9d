//! Sequential horse rating.
//!
//! One strict pass over races in `(race_date, race_id)` order. Each race is a
//! barrier: entrants read the ratings left by earlier races, the deltas for
//! the whole field are computed against those, and only then are the new
//! ratings written back. Large fields compute their deltas in parallel.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::class_tier::RaceGrade;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RatingError {
    #[error("horse {horse_id} appears more than once in race {race_id}")]
    DuplicateHorseInRace { race_id: String, horse_id: String },
    #[error("race {race_id} carries two dates: {first} and {second}")]
    InconsistentRaceDate {
        race_id: String,
        first: NaiveDate,
        second: NaiveDate,
    },
    #[error("rating input out of chronological order at index {index}")]
    OutOfOrder { index: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeFactors {
    pub win: f64,
    pub second: f64,
    pub third: f64,
    /// Unplaced but in the front half of the field.
    pub midfield: f64,
    pub back: f64,
}

impl Default for OutcomeFactors {
    fn default() -> Self {
        Self {
            win: 0.8,
            second: 0.4,
            third: 0.2,
            midfield: -0.1,
            back: -0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityMultipliers {
    pub group1: f64,
    pub group2: f64,
    pub group3: f64,
    pub listed: f64,
    pub other: f64,
}

impl Default for QualityMultipliers {
    fn default() -> Self {
        Self {
            group1: 1.5,
            group2: 1.35,
            group3: 1.2,
            listed: 1.1,
            other: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingParams {
    pub k_factor: f64,
    pub base_rating: f64,
    pub min_rating: f64,
    pub max_rating: f64,
    pub outcome: OutcomeFactors,
    pub quality: QualityMultipliers,
    pub small_field_max: u32,
    pub small_field_multiplier: f64,
    pub large_field_min: u32,
    pub large_field_multiplier: f64,
    /// Fields at least this large compute their deltas on the rayon pool.
    pub parallel_field_threshold: usize,
}

impl Default for RatingParams {
    fn default() -> Self {
        Self {
            k_factor: 32.0,
            base_rating: 1200.0,
            min_rating: 600.0,
            max_rating: 2200.0,
            outcome: OutcomeFactors::default(),
            quality: QualityMultipliers::default(),
            small_field_max: 7,
            small_field_multiplier: 0.8,
            large_field_min: 14,
            large_field_multiplier: 1.2,
            parallel_field_threshold: 16,
        }
    }
}

impl RatingParams {
    pub fn outcome_factor(&self, finish_position: u32, field_size: u32) -> f64 {
        match finish_position {
            1 => self.outcome.win,
            2 => self.outcome.second,
            3 => self.outcome.third,
            p if f64::from(p) <= f64::from(field_size) / 2.0 => self.outcome.midfield,
            _ => self.outcome.back,
        }
    }

    pub fn quality_multiplier(&self, grade: Option<RaceGrade>) -> f64 {
        match grade {
            Some(RaceGrade::Group1) => self.quality.group1,
            Some(RaceGrade::Group2) => self.quality.group2,
            Some(RaceGrade::Group3) => self.quality.group3,
            Some(RaceGrade::Listed) => self.quality.listed,
            None => self.quality.other,
        }
    }

    pub fn field_multiplier(&self, field_size: u32) -> f64 {
        if field_size <= self.small_field_max {
            self.small_field_multiplier
        } else if field_size >= self.large_field_min {
            self.large_field_multiplier
        } else {
            1.0
        }
    }

    pub fn delta(&self, entry: &RatingEntry<'_>) -> f64 {
        self.k_factor
            * self.outcome_factor(entry.finish_position, entry.field_size)
            * self.quality_multiplier(entry.grade)
            * self.field_multiplier(entry.field_size)
    }

    fn clamp(&self, rating: f64) -> f64 {
        rating.clamp(self.min_rating, self.max_rating)
    }
}

/// One participation as the rating pass sees it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RatingEntry<'a> {
    pub race_id: &'a str,
    pub race_date: NaiveDate,
    pub horse_id: &'a str,
    pub finish_position: u32,
    pub field_size: u32,
    pub grade: Option<RaceGrade>,
    /// Non-finishers keep their rating and do not count as a rated race.
    pub finished: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatingRecord {
    pub rating_before: f64,
    pub rating_after: f64,
    /// Rated races before this one.
    pub prior_rated_races: u32,
    pub is_rating_default: bool,
}

#[derive(Debug, Clone, Copy)]
struct HorseRating {
    rating: f64,
    races: u32,
}

/// Rates every entry. The output is aligned with `entries`, which must be
/// sorted by `(race_date, race_id)`.
pub fn rate_participations(
    entries: &[RatingEntry<'_>],
    params: &RatingParams,
) -> Result<Vec<RatingRecord>, RatingError> {
    let mut ratings: HashMap<&str, HorseRating> = HashMap::new();
    let mut race_dates: HashMap<&str, NaiveDate> = HashMap::new();
    let mut out = Vec::with_capacity(entries.len());
    let mut parallel_races = 0usize;
    let mut races = 0usize;

    let mut start = 0;
    while start < entries.len() {
        let head = &entries[start];
        if start > 0 {
            let prev = &entries[start - 1];
            if (prev.race_date, prev.race_id) > (head.race_date, head.race_id) {
                return Err(RatingError::OutOfOrder { index: start });
            }
        }
        let mut end = start + 1;
        while end < entries.len()
            && entries[end].race_id == head.race_id
            && entries[end].race_date == head.race_date
        {
            end += 1;
        }
        let group = &entries[start..end];

        if let Some(first) = race_dates.insert(head.race_id, head.race_date) {
            if first != head.race_date {
                return Err(RatingError::InconsistentRaceDate {
                    race_id: head.race_id.to_string(),
                    first,
                    second: head.race_date,
                });
            }
            return Err(RatingError::OutOfOrder { index: start });
        }
        let mut seen = HashSet::with_capacity(group.len());
        for entry in group {
            if !seen.insert(entry.horse_id) {
                return Err(RatingError::DuplicateHorseInRace {
                    race_id: entry.race_id.to_string(),
                    horse_id: entry.horse_id.to_string(),
                });
            }
        }

        let rate = |entry: &RatingEntry<'_>| {
            let prior = ratings.get(entry.horse_id).copied();
            let rating_before = prior.map(|p| p.rating).unwrap_or(params.base_rating);
            let prior_rated_races = prior.map(|p| p.races).unwrap_or(0);
            let rating_after = if entry.finished {
                params.clamp(rating_before + params.delta(entry))
            } else {
                rating_before
            };
            RatingRecord {
                rating_before,
                rating_after,
                prior_rated_races,
                is_rating_default: prior_rated_races == 0,
            }
        };
        let results: Vec<RatingRecord> = if group.len() >= params.parallel_field_threshold {
            parallel_races += 1;
            group.par_iter().map(rate).collect()
        } else {
            group.iter().map(rate).collect()
        };

        for (entry, record) in group.iter().zip(&results).filter(|(e, _)| e.finished) {
            ratings.insert(
                entry.horse_id,
                HorseRating {
                    rating: record.rating_after,
                    races: record.prior_rated_races + 1,
                },
            );
        }
        out.extend(results);
        races += 1;
        start = end;
    }

    info!(
        component = "rating",
        event = "rating.finish",
        participations = out.len(),
        races,
        parallel_races,
        horses = ratings.len(),
        k_factor = params.k_factor
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, day).expect("valid date")
    }

    fn entry<'a>(
        race: &'a str,
        day: u32,
        horse: &'a str,
        position: u32,
        field: u32,
    ) -> RatingEntry<'a> {
        RatingEntry {
            race_id: race,
            race_date: date(day),
            horse_id: horse,
            finish_position: position,
            field_size: field,
            grade: None,
            finished: true,
        }
    }

    #[test]
    fn winner_of_ungraded_ten_runner_race_gains_k_times_point_eight() {
        let entries = [entry("r1", 1, "h1", 1, 10)];
        let out = rate_participations(&entries, &RatingParams::default()).expect("valid input");
        assert_eq!(out[0].rating_before, 1200.0);
        assert!((out[0].rating_after - 1225.6).abs() < 1e-9);
        assert!(out[0].is_rating_default);
    }

    #[test]
    fn non_finisher_keeps_its_rating_and_prior_race_count() {
        let mut fell = entry("r1", 1, "h2", 99, 10);
        fell.finished = false;
        let entries = [entry("r1", 1, "h1", 1, 10), fell, entry("r2", 2, "h2", 1, 10)];
        let out = rate_participations(&entries, &RatingParams::default()).expect("valid input");

        assert_eq!(out[1].rating_before, 1200.0);
        assert_eq!(out[1].rating_after, 1200.0);
        assert_eq!(out[2].rating_before, 1200.0);
        assert_eq!(out[2].prior_rated_races, 0);
        assert!(out[2].is_rating_default);
    }

    #[test]
    fn factors_follow_position_grade_and_field_size() {
        let params = RatingParams::default();
        assert_eq!(params.outcome_factor(2, 10), 0.4);
        assert_eq!(params.outcome_factor(3, 10), 0.2);
        assert_eq!(params.outcome_factor(5, 10), -0.1);
        assert_eq!(params.outcome_factor(6, 10), -0.3);
        assert_eq!(params.quality_multiplier(Some(RaceGrade::Group1)), 1.5);
        assert_eq!(params.quality_multiplier(Some(RaceGrade::Listed)), 1.1);
        assert_eq!(params.field_multiplier(7), 0.8);
        assert_eq!(params.field_multiplier(8), 1.0);
        assert_eq!(params.field_multiplier(14), 1.2);

        let mut g1 = entry("r1", 1, "h1", 1, 16);
        g1.grade = Some(RaceGrade::Group1);
        assert!((params.delta(&g1) - 32.0 * 0.8 * 1.5 * 1.2).abs() < 1e-12);
    }

    #[test]
    fn ratings_chain_between_races_and_stay_bounded() {
        let races: Vec<String> = (0..200).map(|i| format!("r{i:03}")).collect();
        let mut entries = Vec::new();
        for (i, race) in races.iter().enumerate() {
            entries.push(RatingEntry {
                race_id: race,
                race_date: date(1) + chrono::Duration::days(i as i64),
                horse_id: "winner",
                finish_position: 1,
                field_size: 16,
                grade: Some(RaceGrade::Group1),
                finished: true,
            });
            entries.push(RatingEntry {
                race_id: race,
                race_date: date(1) + chrono::Duration::days(i as i64),
                horse_id: "loser",
                finish_position: 16,
                field_size: 16,
                grade: Some(RaceGrade::Group1),
                finished: true,
            });
        }
        let params = RatingParams::default();
        let out = rate_participations(&entries, &params).expect("valid input");

        for record in &out {
            assert!(record.rating_after >= params.min_rating);
            assert!(record.rating_after <= params.max_rating);
        }
        assert_eq!(out[out.len() - 2].rating_after, 2200.0);
        assert_eq!(out[out.len() - 1].rating_after, 600.0);

        for pair in out.chunks(2).collect::<Vec<_>>().windows(2) {
            assert_eq!(pair[1][0].rating_before, pair[0][0].rating_after);
            assert_eq!(pair[1][1].rating_before, pair[0][1].rating_after);
        }
        assert_eq!(out[4].prior_rated_races, 2);
    }

    #[test]
    fn runners_in_one_race_read_pre_race_ratings() {
        let entries = [
            entry("r1", 1, "a", 1, 10),
            entry("r2", 2, "a", 1, 10),
            entry("r2", 2, "b", 2, 10),
        ];
        let out = rate_participations(&entries, &RatingParams::default()).expect("valid input");
        assert!((out[1].rating_before - 1225.6).abs() < 1e-9);
        assert_eq!(out[2].rating_before, 1200.0);
        assert!(out[2].is_rating_default);
    }

    #[test]
    fn parallel_and_sequential_paths_agree() {
        let horses: Vec<String> = (0..20).map(|i| format!("h{i:02}")).collect();
        let mut entries = Vec::new();
        for (race_idx, race) in ["r1", "r2", "r3"].iter().enumerate() {
            for (slot, horse) in horses.iter().enumerate() {
                let position = ((slot + race_idx * 7) % horses.len()) as u32 + 1;
                entries.push(entry(race, race_idx as u32 + 1, horse, position, 20));
            }
        }

        let mut sequential = RatingParams::default();
        sequential.parallel_field_threshold = usize::MAX;
        let mut parallel = RatingParams::default();
        parallel.parallel_field_threshold = 1;

        let a = rate_participations(&entries, &sequential).expect("valid input");
        let b = rate_participations(&entries, &parallel).expect("valid input");
        assert_eq!(a, b);
    }

    #[test]
    fn duplicate_horse_in_race_fails_fast() {
        let entries = [entry("r1", 1, "a", 1, 10), entry("r1", 1, "a", 2, 10)];
        assert_eq!(
            rate_participations(&entries, &RatingParams::default()),
            Err(RatingError::DuplicateHorseInRace {
                race_id: "r1".to_string(),
                horse_id: "a".to_string()
            })
        );
    }

    #[test]
    fn race_with_two_dates_fails_fast() {
        let entries = [
            entry("r1", 1, "a", 1, 10),
            entry("r2", 2, "b", 1, 10),
            entry("r1", 3, "c", 1, 10),
        ];
        assert_eq!(
            rate_participations(&entries, &RatingParams::default()),
            Err(RatingError::InconsistentRaceDate {
                race_id: "r1".to_string(),
                first: date(1),
                second: date(3),
            })
        );
    }

    #[test]
    fn out_of_order_input_is_rejected() {
        let entries = [entry("r2", 2, "a", 1, 10), entry("r1", 1, "b", 1, 10)];
        assert_eq!(
            rate_participations(&entries, &RatingParams::default()),
            Err(RatingError::OutOfOrder { index: 1 })
        );
    }
}
