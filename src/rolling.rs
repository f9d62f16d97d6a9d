//! Per-partition accumulators.
//!
//! Each accumulator is fed completed runs in timeline order and answers
//! questions about everything it has been fed so far. Callers decide when to
//! feed; the accumulators themselves have no notion of race groups.

use std::collections::VecDeque;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Finishing positions up to and including this one count as a place.
pub const PLACE_CUTOFF: u32 = 3;
pub const SECTIONAL_WINDOW: usize = 5;
pub const CLASS_WINDOW: usize = 5;

/// The facts about a completed run that any accumulator may consume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunOutcome {
    pub race_date: NaiveDate,
    pub finish_position: u32,
    pub field_size: u32,
    pub pos_800m: Option<u32>,
    pub class_tier: u32,
}

impl RunOutcome {
    pub fn won(&self) -> bool {
        self.finish_position == 1
    }

    pub fn placed(&self) -> bool {
        self.finish_position <= PLACE_CUTOFF
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PrefixStats {
    pub runs: u32,
    pub wins: u32,
    pub places: u32,
    /// Fraction in [0, 1]; 0 before the first run.
    pub win_rate: f64,
    pub place_rate: f64,
    pub days_since_last: Option<i64>,
    pub last_position: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct PrefixTotals {
    runs: u32,
    wins: u32,
    places: u32,
    last_date: Option<NaiveDate>,
    last_position: Option<u32>,
}

impl PrefixTotals {
    pub fn push(&mut self, run: &RunOutcome) {
        self.runs += 1;
        if run.won() {
            self.wins += 1;
        }
        if run.placed() {
            self.places += 1;
        }
        self.last_date = Some(run.race_date);
        self.last_position = Some(run.finish_position);
    }

    pub fn runs(&self) -> u32 {
        self.runs
    }

    pub fn stats_at(&self, as_of: NaiveDate) -> PrefixStats {
        PrefixStats {
            runs: self.runs,
            wins: self.wins,
            places: self.places,
            win_rate: ratio(self.wins, self.runs),
            place_rate: ratio(self.places, self.runs),
            days_since_last: self.last_date.map(|d| (as_of - d).num_days()),
            last_position: self.last_position,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    pub size: usize,
    pub count: u32,
    pub avg_position: Option<f64>,
    /// Population standard deviation; needs at least two runs.
    pub std_position: Option<f64>,
    pub win_rate: f64,
    pub place_rate: f64,
}

/// Sliding window over the last `capacity` runs with running sums, so both
/// push and read are O(1).
#[derive(Debug, Clone)]
pub struct WindowAccumulator {
    capacity: usize,
    positions: VecDeque<u32>,
    sum: u64,
    sum_sq: u64,
    wins: u32,
    places: u32,
}

impl WindowAccumulator {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            positions: VecDeque::with_capacity(capacity + 1),
            sum: 0,
            sum_sq: 0,
            wins: 0,
            places: 0,
        }
    }

    pub fn push(&mut self, finish_position: u32) {
        self.positions.push_back(finish_position);
        self.add(finish_position);
        while self.positions.len() > self.capacity {
            if let Some(evicted) = self.positions.pop_front() {
                self.remove(evicted);
            }
        }
    }

    fn add(&mut self, position: u32) {
        let p = u64::from(position);
        self.sum += p;
        self.sum_sq += p * p;
        if position == 1 {
            self.wins += 1;
        }
        if position <= PLACE_CUTOFF {
            self.places += 1;
        }
    }

    fn remove(&mut self, position: u32) {
        let p = u64::from(position);
        self.sum -= p;
        self.sum_sq -= p * p;
        if position == 1 {
            self.wins -= 1;
        }
        if position <= PLACE_CUTOFF {
            self.places -= 1;
        }
    }

    pub fn stats(&self) -> WindowStats {
        let count = self.positions.len() as u32;
        let (avg_position, std_position) = if count == 0 {
            (None, None)
        } else {
            let n = f64::from(count);
            let mean = self.sum as f64 / n;
            let std = if count < 2 {
                None
            } else {
                let variance = (self.sum_sq as f64 / n - mean * mean).max(0.0);
                Some(variance.sqrt())
            };
            (Some(mean), std)
        };
        WindowStats {
            size: self.capacity,
            count,
            avg_position,
            std_position,
            win_rate: ratio(self.wins, count),
            place_rate: ratio(self.places, count),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunningStyle {
    Leader,
    Stalker,
    Midfield,
    Closer,
}

impl RunningStyle {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Leader => "leader",
            Self::Stalker => "stalker",
            Self::Midfield => "midfield",
            Self::Closer => "closer",
        }
    }

    pub fn from_position(pos_800m: u32, field_size: u32) -> Self {
        if pos_800m <= 2 {
            Self::Leader
        } else if pos_800m <= 4 {
            Self::Stalker
        } else if f64::from(pos_800m) <= f64::from(field_size) * 0.6 {
            Self::Midfield
        } else {
            Self::Closer
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SectionalSummary {
    pub avg_pos_800m: Option<f64>,
    /// Share of runs with a known 800 m position that were in the first two.
    pub early_speed_share: Option<f64>,
    /// Average of (800 m position - finishing position); positive means the
    /// horse gains ground late.
    pub avg_late_improvement: Option<f64>,
    pub last_running_style: Option<RunningStyle>,
}

#[derive(Debug, Clone, Default)]
pub struct SectionalHistory {
    recent_800m: VecDeque<u32>,
    known_runs: u32,
    early_runs: u32,
    improvement_sum: i64,
    last_style: Option<RunningStyle>,
}

impl SectionalHistory {
    pub fn push(&mut self, run: &RunOutcome) {
        let Some(pos) = run.pos_800m else {
            return;
        };
        self.recent_800m.push_back(pos);
        while self.recent_800m.len() > SECTIONAL_WINDOW {
            self.recent_800m.pop_front();
        }
        self.known_runs += 1;
        if pos <= 2 {
            self.early_runs += 1;
        }
        self.improvement_sum += i64::from(pos) - i64::from(run.finish_position);
        self.last_style = Some(RunningStyle::from_position(pos, run.field_size));
    }

    pub fn summary(&self) -> SectionalSummary {
        let avg_pos_800m = (!self.recent_800m.is_empty()).then(|| {
            self.recent_800m.iter().map(|p| f64::from(*p)).sum::<f64>()
                / self.recent_800m.len() as f64
        });
        let known = f64::from(self.known_runs);
        SectionalSummary {
            avg_pos_800m,
            early_speed_share: (self.known_runs > 0).then(|| f64::from(self.early_runs) / known),
            avg_late_improvement: (self.known_runs > 0)
                .then(|| self.improvement_sum as f64 / known),
            last_running_style: self.last_style,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassSummary {
    pub prev_class_tier: Option<u32>,
    pub avg_class_tier: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct ClassHistory {
    recent: VecDeque<u32>,
}

impl ClassHistory {
    pub fn push(&mut self, run: &RunOutcome) {
        self.recent.push_back(run.class_tier);
        while self.recent.len() > CLASS_WINDOW {
            self.recent.pop_front();
        }
    }

    pub fn summary(&self) -> ClassSummary {
        ClassSummary {
            prev_class_tier: self.recent.back().copied(),
            avg_class_tier: (!self.recent.is_empty()).then(|| {
                self.recent.iter().map(|t| f64::from(*t)).sum::<f64>() / self.recent.len() as f64
            }),
        }
    }
}

fn ratio(numerator: u32, denominator: u32) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        f64::from(numerator) / f64::from(denominator)
    }
}
