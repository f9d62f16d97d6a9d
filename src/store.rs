//! SQLite source tables and the `ParticipationSource` seam.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::info;

use crate::participation::{RaceParticipation, SectionalReading, SourceData};

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to prepare store directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("race {race_id} has unparseable date {value:?}")]
    InvalidDate { race_id: String, value: String },
}

/// Opens a connection with the pragmas every component of the rebuild uses.
/// WAL lets production readers proceed while a rebuild writes staging.
pub fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let conn = Connection::open(path)?;
    conn.busy_timeout(std::time::Duration::from_secs(30))?;
    conn.execute_batch(
        "
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA temp_store=MEMORY;
        PRAGMA foreign_keys=ON;
        ",
    )?;
    Ok(conn)
}

pub(crate) fn table_exists(conn: &Connection, table: &str) -> Result<bool, rusqlite::Error> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1 LIMIT 1",
            params![table],
            |row| row.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    Ok(exists)
}

pub(crate) fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>, rusqlite::Error> {
    let pragma = format!("PRAGMA table_info(\"{table}\")");
    let mut stmt = conn.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        columns.push(row.get::<_, String>(1)?);
    }
    Ok(columns)
}

fn ensure_source_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS races (
            race_id TEXT PRIMARY KEY,
            race_date TEXT NOT NULL,
            race_number INTEGER NOT NULL,
            track_name TEXT NOT NULL,
            location TEXT,
            race_distance INTEGER NOT NULL,
            race_class TEXT NOT NULL DEFAULT '',
            track_condition TEXT,
            track_info TEXT
        );

        CREATE TABLE IF NOT EXISTS race_results (
            race_id TEXT NOT NULL REFERENCES races(race_id),
            horse_slug TEXT,
            horse_name TEXT NOT NULL,
            horse_number INTEGER,
            jockey_slug TEXT,
            trainer_slug TEXT,
            barrier INTEGER,
            weight_carried REAL,
            win_odds REAL,
            position INTEGER,
            margin REAL,
            UNIQUE (race_id, horse_name)
        );

        CREATE INDEX IF NOT EXISTS idx_race_results_race ON race_results(race_id);

        CREATE TABLE IF NOT EXISTS race_results_sectional_times (
            race_id TEXT NOT NULL,
            horse_name TEXT NOT NULL,
            horse_number INTEGER,
            distance INTEGER NOT NULL,
            position INTEGER NOT NULL,
            PRIMARY KEY (race_id, horse_name, distance)
        );
        ",
    )?;
    Ok(())
}

/// Anything the rebuild can extract participations from.
pub trait ParticipationSource {
    fn load(&self) -> Result<SourceData, StoreError>;
}

impl ParticipationSource for SourceData {
    fn load(&self) -> Result<SourceData, StoreError> {
        Ok(self.clone())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceCounts {
    pub races: u64,
    pub results: u64,
    pub sectional_readings: u64,
}

pub struct SqliteSource {
    conn: Connection,
}

impl SqliteSource {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = open_connection(path)?;
        ensure_source_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Upserts the race rows and result rows behind each participation.
    /// Race-level fields come from the last participation seen per race.
    pub fn write_participations(
        &mut self,
        participations: &[RaceParticipation],
    ) -> Result<usize, StoreError> {
        if participations.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.transaction()?;
        {
            let mut race_stmt = tx.prepare(
                "
                INSERT INTO races (
                    race_id,
                    race_date,
                    race_number,
                    track_name,
                    location,
                    race_distance,
                    race_class,
                    track_condition,
                    track_info
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(race_id) DO UPDATE SET
                    race_date = excluded.race_date,
                    race_number = excluded.race_number,
                    track_name = excluded.track_name,
                    location = excluded.location,
                    race_distance = excluded.race_distance,
                    race_class = excluded.race_class,
                    track_condition = excluded.track_condition,
                    track_info = excluded.track_info
                ",
            )?;
            let mut result_stmt = tx.prepare(
                "
                INSERT INTO race_results (
                    race_id,
                    horse_slug,
                    horse_name,
                    horse_number,
                    jockey_slug,
                    trainer_slug,
                    barrier,
                    weight_carried,
                    win_odds,
                    position,
                    margin
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                ON CONFLICT(race_id, horse_name) DO UPDATE SET
                    horse_slug = excluded.horse_slug,
                    horse_number = excluded.horse_number,
                    jockey_slug = excluded.jockey_slug,
                    trainer_slug = excluded.trainer_slug,
                    barrier = excluded.barrier,
                    weight_carried = excluded.weight_carried,
                    win_odds = excluded.win_odds,
                    position = excluded.position,
                    margin = excluded.margin
                ",
            )?;

            for p in participations {
                race_stmt.execute(params![
                    p.race_id,
                    p.race_date.format(DATE_FORMAT).to_string(),
                    p.race_number,
                    p.track_name,
                    p.locale_hint,
                    p.distance_m,
                    p.class_text,
                    p.track_condition,
                    p.rail_text,
                ])?;
                let horse_slug = (!p.horse_id.is_empty()).then_some(p.horse_id.as_str());
                result_stmt.execute(params![
                    p.race_id,
                    horse_slug,
                    p.horse_name,
                    p.horse_number,
                    p.jockey_id,
                    p.trainer_id,
                    p.barrier,
                    p.weight_carried,
                    p.win_odds,
                    p.finish_position,
                    p.margin,
                ])?;
            }
        }
        tx.commit()?;
        Ok(participations.len())
    }

    pub fn write_sectional_readings(
        &mut self,
        readings: &[SectionalReading],
    ) -> Result<usize, StoreError> {
        if readings.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO race_results_sectional_times (
                    race_id,
                    horse_name,
                    horse_number,
                    distance,
                    position
                ) VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(race_id, horse_name, distance) DO UPDATE SET
                    horse_number = excluded.horse_number,
                    position = excluded.position
                ",
            )?;
            for r in readings {
                stmt.execute(params![
                    r.race_id,
                    r.competitor_name,
                    r.competitor_number,
                    r.gate_m,
                    r.position,
                ])?;
            }
        }
        tx.commit()?;
        Ok(readings.len())
    }

    pub fn counts(&self) -> Result<SourceCounts, StoreError> {
        let count = |table: &str| -> Result<u64, rusqlite::Error> {
            let sql = format!("SELECT COUNT(*) FROM {table}");
            let n: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
            Ok(n as u64)
        };
        Ok(SourceCounts {
            races: count("races")?,
            results: count("race_results")?,
            sectional_readings: count("race_results_sectional_times")?,
        })
    }

    fn load_participations(&self) -> Result<Vec<RaceParticipation>, StoreError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT
                rr.race_id,
                r.race_date,
                r.race_number,
                r.track_name,
                r.location,
                r.race_distance,
                r.race_class,
                r.track_condition,
                r.track_info,
                COALESCE(rr.horse_slug, ''),
                rr.horse_name,
                rr.horse_number,
                rr.jockey_slug,
                rr.trainer_slug,
                rr.barrier,
                rr.weight_carried,
                rr.win_odds,
                rr.position,
                rr.margin
            FROM race_results rr
            JOIN races r ON rr.race_id = r.race_id
            ORDER BY r.race_date, rr.race_id, rr.rowid
            ",
        )?;
        let raw = stmt
            .query_map([], |row| Ok((row.get::<_, String>(1)?, participation_row(row)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(date_text, mut p)| {
                p.race_date = NaiveDate::parse_from_str(&date_text, DATE_FORMAT).map_err(|_| {
                    StoreError::InvalidDate {
                        race_id: p.race_id.clone(),
                        value: date_text.clone(),
                    }
                })?;
                Ok(p)
            })
            .collect()
    }

    fn load_readings(&self) -> Result<Vec<SectionalReading>, StoreError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT race_id, horse_name, horse_number, distance, position
            FROM race_results_sectional_times
            ORDER BY race_id, horse_name, distance
            ",
        )?;
        let readings = stmt
            .query_map([], |row| {
                Ok(SectionalReading {
                    race_id: row.get(0)?,
                    competitor_name: row.get(1)?,
                    competitor_number: row.get(2)?,
                    gate_m: row.get(3)?,
                    position: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(readings)
    }
}

/// The date column is parsed after the row callback so a bad value surfaces
/// as [`StoreError::InvalidDate`] rather than a generic conversion error.
fn participation_row(row: &Row<'_>) -> Result<RaceParticipation, rusqlite::Error> {
    Ok(RaceParticipation {
        race_id: row.get(0)?,
        race_date: NaiveDate::MIN,
        race_number: row.get(2)?,
        track_name: row.get(3)?,
        locale_hint: row.get(4)?,
        distance_m: row.get(5)?,
        class_text: row.get(6)?,
        track_condition: row.get(7)?,
        rail_text: row.get(8)?,
        horse_id: row.get(9)?,
        horse_name: row.get(10)?,
        horse_number: row.get(11)?,
        jockey_id: row.get(12)?,
        trainer_id: row.get(13)?,
        barrier: row.get(14)?,
        weight_carried: row.get(15)?,
        win_odds: row.get(16)?,
        finish_position: row.get(17)?,
        margin: row.get(18)?,
    })
}

impl ParticipationSource for SqliteSource {
    fn load(&self) -> Result<SourceData, StoreError> {
        let participations = self.load_participations()?;
        let readings = self.load_readings()?;
        info!(
            component = "store",
            event = "source.loaded",
            participations = participations.len(),
            sectional_readings = readings.len()
        );
        Ok(SourceData::new(participations, readings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::participation;
    use tempfile::NamedTempFile;

    #[test]
    fn round_trips_participations_in_chronological_order() {
        let file = NamedTempFile::new().expect("temp file");
        let mut store = SqliteSource::open(file.path()).expect("open store");

        let mut late = participation("r2", 9, "h1", "j1", 1);
        late.horse_number = Some(3);
        late.rail_text = Some("Out 3m".to_string());
        let early = participation("r1", 2, "h1", "j1", 4);
        store
            .write_participations(&[late.clone(), early.clone()])
            .expect("write");
        store
            .write_sectional_readings(&[SectionalReading {
                race_id: "r2".to_string(),
                competitor_name: "H1".to_string(),
                competitor_number: Some(3),
                gate_m: 400,
                position: 2,
            }])
            .expect("write readings");

        let loaded = store.load().expect("load");
        assert_eq!(loaded.participations, vec![early, late]);
        assert_eq!(loaded.readings.len(), 1);
        assert_eq!(
            store.counts().expect("counts"),
            SourceCounts {
                races: 2,
                results: 2,
                sectional_readings: 1,
            }
        );
    }

    #[test]
    fn rewriting_a_result_updates_in_place() {
        let file = NamedTempFile::new().expect("temp file");
        let mut store = SqliteSource::open(file.path()).expect("open store");
        let mut p = participation("r1", 2, "h1", "j1", 4);
        store.write_participations(&[p.clone()]).expect("write");
        p.finish_position = Some(1);
        store.write_participations(&[p]).expect("rewrite");

        let loaded = store.load().expect("load");
        assert_eq!(loaded.participations.len(), 1);
        assert_eq!(loaded.participations[0].finish_position, Some(1));
    }

    #[test]
    fn bad_dates_are_reported_with_the_race() {
        let file = NamedTempFile::new().expect("temp file");
        let mut store = SqliteSource::open(file.path()).expect("open store");
        store
            .write_participations(&[participation("r1", 2, "h1", "j1", 4)])
            .expect("write");
        store
            .conn
            .execute("UPDATE races SET race_date = '02/01/2024'", [])
            .expect("corrupt date");

        let err = store.load().expect_err("date is invalid");
        assert!(matches!(err, StoreError::InvalidDate { ref race_id, .. } if race_id == "r1"));
    }
}
