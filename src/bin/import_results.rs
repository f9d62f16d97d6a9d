use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use racealpha::{
    init_logging, log_app_start, logging_config_from_env, rebuild_config_from_env,
    RaceParticipation, SectionalReading, SqliteSource,
};
use serde::Deserialize;
use tracing::info;

/// One row of a results export. Empty cells become `None`.
#[derive(Debug, Deserialize)]
struct ResultRow {
    race_id: String,
    race_date: NaiveDate,
    race_number: u32,
    track_name: String,
    location: Option<String>,
    race_distance: u32,
    race_class: Option<String>,
    track_condition: Option<String>,
    track_info: Option<String>,
    horse_slug: Option<String>,
    horse_name: String,
    horse_number: Option<u32>,
    jockey_slug: Option<String>,
    trainer_slug: Option<String>,
    barrier: Option<u32>,
    weight_carried: Option<f64>,
    win_odds: Option<f64>,
    position: Option<u32>,
    margin: Option<f64>,
}

impl From<ResultRow> for RaceParticipation {
    fn from(row: ResultRow) -> Self {
        Self {
            race_id: row.race_id,
            race_date: row.race_date,
            race_number: row.race_number,
            track_name: row.track_name,
            locale_hint: row.location,
            distance_m: row.race_distance,
            class_text: row.race_class.unwrap_or_default(),
            track_condition: row.track_condition,
            rail_text: row.track_info,
            horse_id: row.horse_slug.unwrap_or_default(),
            horse_name: row.horse_name,
            horse_number: row.horse_number,
            jockey_id: row.jockey_slug,
            trainer_id: row.trainer_slug,
            barrier: row.barrier,
            weight_carried: row.weight_carried,
            win_odds: row.win_odds,
            finish_position: row.position,
            margin: row.margin,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SectionalRow {
    race_id: String,
    horse_name: String,
    horse_number: Option<u32>,
    distance: u32,
    position: u32,
}

impl From<SectionalRow> for SectionalReading {
    fn from(row: SectionalRow) -> Self {
        Self {
            race_id: row.race_id,
            competitor_name: row.horse_name,
            competitor_number: row.horse_number,
            gate_m: row.distance,
            position: row.position,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging = logging_config_from_env();
    init_logging(&logging)?;
    log_app_start("import_results", &logging);

    let mut args = std::env::args().skip(1);
    let results_path = args
        .next()
        .map(PathBuf::from)
        .ok_or("usage: import_results RESULTS_CSV [SECTIONALS_CSV]")?;
    let sectionals_path = args.next().map(PathBuf::from);

    let config = rebuild_config_from_env();
    let batch_size = config.insert_batch_size.max(1);
    let mut store = SqliteSource::open(&config.store_path)?;

    let results = import_csv::<ResultRow, RaceParticipation>(&results_path, batch_size, |batch| {
        store.write_participations(batch)
    })?;
    let readings = match &sectionals_path {
        Some(path) => import_csv::<SectionalRow, SectionalReading>(path, batch_size, |batch| {
            store.write_sectional_readings(batch)
        })?,
        None => 0,
    };

    let counts = store.counts()?;
    info!(
        component = "import",
        event = "import.finish",
        results,
        readings,
        races = counts.races,
        stored_results = counts.results,
        stored_readings = counts.sectional_readings
    );
    println!(
        "Imported {results} results and {readings} sectional readings into {}",
        config.store_path.display()
    );
    Ok(())
}

fn import_csv<R, T>(
    path: &Path,
    batch_size: usize,
    mut write: impl FnMut(&[T]) -> Result<usize, racealpha::StoreError>,
) -> Result<usize, Box<dyn std::error::Error>>
where
    R: for<'de> Deserialize<'de>,
    T: From<R>,
{
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;
    let mut batch = Vec::with_capacity(batch_size);
    let mut total = 0;
    for (line, record) in reader.deserialize::<R>().enumerate() {
        let row = record.map_err(|err| format!("{}: row {}: {err}", path.display(), line + 2))?;
        batch.push(T::from(row));
        if batch.len() == batch_size {
            total += write(&batch)?;
            batch.clear();
        }
    }
    if !batch.is_empty() {
        total += write(&batch)?;
    }
    Ok(total)
}
