//! Latest-state form rollups derived from the production snapshot.

use std::path::Path;
use std::time::Instant;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::catalog::{CatalogError, SnapshotCatalog};
use crate::coordinator::{ErrorClass, RunKind, RunResult, RunStatus};
use crate::observability::{log_run_finish, log_run_start};
use crate::rolling::PLACE_CUTOFF;
use crate::store::{open_connection, StoreError};

#[derive(Debug, Error)]
pub enum RollupError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Horse,
    Jockey,
    Trainer,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [Self::Horse, Self::Jockey, Self::Trainer];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Horse => "horse",
            Self::Jockey => "jockey",
            Self::Trainer => "trainer",
        }
    }

    fn id_column(self) -> &'static str {
        match self {
            Self::Horse => "horse_id",
            Self::Jockey => "jockey_id",
            Self::Trainer => "trainer_id",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityForm {
    pub kind: EntityKind,
    pub entity_id: String,
    pub region: String,
    pub runs: u64,
    pub wins: u64,
    pub places: u64,
    pub win_rate: f64,
    pub place_rate: f64,
    pub last_race_date: String,
    /// Horses only: `rating_after` of the latest production row.
    pub current_rating: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionForm {
    pub jockey_id: String,
    pub trainer_id: String,
    pub region: String,
    pub rides: u64,
    pub wins: u64,
    pub win_rate: f64,
    pub last_race_date: String,
}

pub struct RollupStore {
    conn: Connection,
}

impl RollupStore {
    pub fn open(path: &Path) -> Result<Self, RollupError> {
        let conn = open_connection(path)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS rollup_entity_form (
                entity_kind TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                region TEXT NOT NULL,
                runs INTEGER NOT NULL,
                wins INTEGER NOT NULL,
                places INTEGER NOT NULL,
                win_rate REAL NOT NULL,
                place_rate REAL NOT NULL,
                last_race_date TEXT NOT NULL,
                current_rating REAL,
                snapshot_id TEXT NOT NULL,
                refreshed_at TEXT NOT NULL,
                PRIMARY KEY (entity_kind, entity_id, region)
            );

            CREATE TABLE IF NOT EXISTS rollup_connection_form (
                jockey_id TEXT NOT NULL,
                trainer_id TEXT NOT NULL,
                region TEXT NOT NULL,
                rides INTEGER NOT NULL,
                wins INTEGER NOT NULL,
                win_rate REAL NOT NULL,
                last_race_date TEXT NOT NULL,
                snapshot_id TEXT NOT NULL,
                refreshed_at TEXT NOT NULL,
                PRIMARY KEY (jockey_id, trainer_id, region)
            );
            ",
        )?;
        Ok(Self { conn })
    }

    /// Rewrites both rollup tables from the current production snapshot.
    /// Returns `None` when nothing is in production.
    pub fn refresh<C: SnapshotCatalog + ?Sized>(
        &mut self,
        catalog: &C,
    ) -> Result<Option<u64>, RollupError> {
        let Some(production) = catalog.production()? else {
            return Ok(None);
        };
        let table = production.table_name();
        let snapshot_id = production.id.to_string();
        let refreshed_at = Utc::now().to_rfc3339();

        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM rollup_entity_form", [])?;
        tx.execute("DELETE FROM rollup_connection_form", [])?;

        let mut written = 0_u64;
        for kind in EntityKind::ALL {
            let column = kind.id_column();
            let sql = format!(
                "
                INSERT INTO rollup_entity_form (
                    entity_kind, entity_id, region, runs, wins, places, win_rate,
                    place_rate, last_race_date, snapshot_id, refreshed_at
                )
                SELECT
                    ?1,
                    {column},
                    region,
                    COUNT(*),
                    SUM(target_won),
                    SUM(CASE WHEN target_finish_position <= {PLACE_CUTOFF} THEN 1 ELSE 0 END),
                    AVG(target_won),
                    AVG(CASE WHEN target_finish_position <= {PLACE_CUTOFF} THEN 1.0 ELSE 0.0 END),
                    MAX(race_date),
                    ?2,
                    ?3
                FROM \"{table}\"
                WHERE {column} IS NOT NULL
                GROUP BY {column}, region
                "
            );
            written += tx.execute(&sql, params![kind.as_str(), snapshot_id, refreshed_at])? as u64;
        }

        tx.execute(
            &format!(
                "
                UPDATE rollup_entity_form SET current_rating = (
                    SELECT t.rating_after FROM \"{table}\" t
                    WHERE t.horse_id = rollup_entity_form.entity_id
                    ORDER BY t.race_date DESC, t.row_idx DESC
                    LIMIT 1
                )
                WHERE entity_kind = 'horse'
                "
            ),
            [],
        )?;

        written += tx.execute(
            &format!(
                "
                INSERT INTO rollup_connection_form (
                    jockey_id, trainer_id, region, rides, wins, win_rate, last_race_date,
                    snapshot_id, refreshed_at
                )
                SELECT
                    jockey_id,
                    trainer_id,
                    region,
                    COUNT(*),
                    SUM(target_won),
                    AVG(target_won),
                    MAX(race_date),
                    ?1,
                    ?2
                FROM \"{table}\"
                WHERE jockey_id IS NOT NULL AND trainer_id IS NOT NULL
                GROUP BY jockey_id, trainer_id, region
                "
            ),
            params![snapshot_id, refreshed_at],
        )? as u64;
        tx.commit()?;

        info!(
            component = "rollups",
            event = "rollups.refresh",
            snapshot_id = %snapshot_id,
            rows = written
        );
        Ok(Some(written))
    }

    pub fn entity_form(
        &self,
        kind: EntityKind,
        entity_id: &str,
        region: &str,
    ) -> Result<Option<EntityForm>, RollupError> {
        let form = self
            .conn
            .query_row(
                "
                SELECT runs, wins, places, win_rate, place_rate, last_race_date, current_rating
                FROM rollup_entity_form
                WHERE entity_kind = ?1 AND entity_id = ?2 AND region = ?3
                ",
                params![kind.as_str(), entity_id, region],
                |row| {
                    Ok(EntityForm {
                        kind,
                        entity_id: entity_id.to_string(),
                        region: region.to_string(),
                        runs: row.get::<_, i64>(0)?.max(0) as u64,
                        wins: row.get::<_, i64>(1)?.max(0) as u64,
                        places: row.get::<_, i64>(2)?.max(0) as u64,
                        win_rate: row.get(3)?,
                        place_rate: row.get(4)?,
                        last_race_date: row.get(5)?,
                        current_rating: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(form)
    }

    pub fn connection_form(
        &self,
        jockey_id: &str,
        trainer_id: &str,
        region: &str,
    ) -> Result<Option<ConnectionForm>, RollupError> {
        let form = self
            .conn
            .query_row(
                "
                SELECT rides, wins, win_rate, last_race_date
                FROM rollup_connection_form
                WHERE jockey_id = ?1 AND trainer_id = ?2 AND region = ?3
                ",
                params![jockey_id, trainer_id, region],
                |row| {
                    Ok(ConnectionForm {
                        jockey_id: jockey_id.to_string(),
                        trainer_id: trainer_id.to_string(),
                        region: region.to_string(),
                        rides: row.get::<_, i64>(0)?.max(0) as u64,
                        wins: row.get::<_, i64>(1)?.max(0) as u64,
                        win_rate: row.get(2)?,
                        last_race_date: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(form)
    }
}

/// Entry point for the rollup refresh job.
pub fn refresh_rollups<C: SnapshotCatalog + ?Sized>(
    store: &mut RollupStore,
    catalog: &C,
) -> Result<RunResult, RollupError> {
    let run_id = uuid::Uuid::new_v4().to_string();
    let started = Instant::now();
    log_run_start(RunKind::RefreshRollups, &run_id, false);

    let written = store.refresh(catalog)?;
    let (status, error_class, error_message) = match written {
        Some(_) => (RunStatus::Succeeded, None, None),
        None => (
            RunStatus::Failed,
            Some(ErrorClass::BuildFailed),
            Some("no production snapshot to roll up".to_string()),
        ),
    };
    let result = RunResult {
        run_id,
        kind: RunKind::RefreshRollups,
        status,
        final_state: None,
        record_count: written.unwrap_or(0),
        duration_ms: started.elapsed().as_millis() as u64,
        error_class,
        error_message,
        snapshot_id: catalog.production()?.map(|e| e.id),
        coverage: None,
        validation: None,
    };
    log_run_finish(&result);
    Ok(result)
}
