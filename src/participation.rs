//! Raw records delivered by extraction.
//!
//! A [`RaceParticipation`] is one horse's run in one race exactly as the
//! operational store recorded it. Nothing downstream mutates these records;
//! derived values (track profile, class tier, reconciled sectionals) live on
//! the base stage record that wraps them.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceParticipation {
    pub race_id: String,
    pub race_date: NaiveDate,
    pub race_number: u32,
    pub track_name: String,
    pub locale_hint: Option<String>,
    pub distance_m: u32,
    pub class_text: String,
    pub track_condition: Option<String>,
    pub rail_text: Option<String>,
    pub horse_id: String,
    pub horse_name: String,
    pub horse_number: Option<u32>,
    pub jockey_id: Option<String>,
    pub trainer_id: Option<String>,
    pub barrier: Option<u32>,
    pub weight_carried: Option<f64>,
    pub win_odds: Option<f64>,
    /// `None` for scratchings and rows the source never resulted.
    pub finish_position: Option<u32>,
    pub margin: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionalReading {
    pub race_id: String,
    pub competitor_name: String,
    pub competitor_number: Option<u32>,
    /// Raw gate label in metres, interpreted per the region's gate convention.
    pub gate_m: u32,
    pub position: u32,
}

/// Everything one extraction pass produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceData {
    pub participations: Vec<RaceParticipation>,
    pub readings: Vec<SectionalReading>,
}

impl SourceData {
    pub fn new(participations: Vec<RaceParticipation>, readings: Vec<SectionalReading>) -> Self {
        Self {
            participations,
            readings,
        }
    }
}
