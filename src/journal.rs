//! Durable rebuild progress, kept outside any snapshot table.

use std::path::Path;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::SnapshotId;
use crate::coordinator::{ErrorClass, RunKind, RunResult, RunStatus};
use crate::state::{RebuildPhase, RebuildState};
use crate::store::{open_connection, StoreError};

#[derive(Debug, Error)]
pub enum JournalError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("checkpoint payload for phase {phase} is unreadable: {source}")]
    Checkpoint {
        phase: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("run {0} is not in the journal")]
    UnknownRun(String),
    #[error("run {run_id}: illegal transition {from} -> {to}")]
    IllegalTransition {
        run_id: String,
        from: &'static str,
        to: &'static str,
    },
    #[error("journal row has unknown value {0:?}")]
    Corrupt(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Running,
    Completed,
    Failed,
}

impl PhaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Fingerprints a resumed run must still match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInputs {
    pub config_fingerprint: String,
    pub reference_fingerprint: String,
    pub schema_fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub kind: RunKind,
    pub state: RebuildState,
    pub status: Option<RunStatus>,
    pub inputs: RunInputs,
    pub staging_id: Option<SnapshotId>,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub record_count: u64,
    pub duration_ms: Option<u64>,
    pub error_class: Option<ErrorClass>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub run_id: String,
    pub phase: RebuildPhase,
    pub phase_number: u32,
    pub total_phases: u32,
    pub status: PhaseStatus,
    pub error: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: Option<RebuildState>,
    pub to: RebuildState,
    pub detail: Option<String>,
    pub at: String,
}

pub struct RebuildJournal {
    conn: Connection,
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

fn corrupt(raw: &str) -> JournalError {
    JournalError::Corrupt(raw.to_string())
}

impl RebuildJournal {
    pub fn open(path: &Path) -> Result<Self, JournalError> {
        let conn = open_connection(path)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS rebuild_runs (
                run_id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                state TEXT NOT NULL,
                status TEXT,
                config_fingerprint TEXT NOT NULL,
                reference_fingerprint TEXT NOT NULL,
                schema_fingerprint TEXT NOT NULL,
                staging_id TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                record_count INTEGER NOT NULL DEFAULT 0,
                duration_ms INTEGER,
                error_class TEXT,
                error_message TEXT
            );

            CREATE TABLE IF NOT EXISTS rebuild_progress (
                run_id TEXT PRIMARY KEY REFERENCES rebuild_runs(run_id),
                phase_name TEXT NOT NULL,
                phase_number INTEGER NOT NULL,
                total_phases INTEGER NOT NULL,
                status TEXT NOT NULL,
                error TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS rebuild_phase_log (
                run_id TEXT NOT NULL REFERENCES rebuild_runs(run_id),
                phase_number INTEGER NOT NULL,
                phase_name TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                records INTEGER,
                error TEXT,
                PRIMARY KEY (run_id, phase_number)
            );

            CREATE TABLE IF NOT EXISTS rebuild_transitions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL REFERENCES rebuild_runs(run_id),
                from_state TEXT,
                to_state TEXT NOT NULL,
                detail TEXT,
                at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS rebuild_checkpoints (
                run_id TEXT NOT NULL REFERENCES rebuild_runs(run_id),
                phase_number INTEGER NOT NULL,
                payload TEXT NOT NULL,
                saved_at TEXT NOT NULL,
                PRIMARY KEY (run_id, phase_number)
            );
            ",
        )?;
        Ok(Self { conn })
    }

    /// Registers a run in `Building` and logs its first transition.
    pub fn start_run(
        &mut self,
        run_id: &str,
        kind: RunKind,
        inputs: &RunInputs,
    ) -> Result<(), JournalError> {
        let now = now_rfc3339();
        let tx = self.conn.transaction()?;
        tx.execute(
            "
            INSERT INTO rebuild_runs (
                run_id, kind, state, config_fingerprint, reference_fingerprint,
                schema_fingerprint, started_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            params![
                run_id,
                kind.as_str(),
                RebuildState::Building.as_str(),
                inputs.config_fingerprint,
                inputs.reference_fingerprint,
                inputs.schema_fingerprint,
                now,
            ],
        )?;
        tx.execute(
            "INSERT INTO rebuild_transitions (run_id, from_state, to_state, at)
             VALUES (?1, NULL, ?2, ?3)",
            params![run_id, RebuildState::Building.as_str(), now],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Appends a state change, rejecting edges the state machine forbids.
    pub fn transition(
        &mut self,
        run_id: &str,
        to: RebuildState,
        detail: Option<&str>,
    ) -> Result<(), JournalError> {
        let from = self
            .run(run_id)?
            .ok_or_else(|| JournalError::UnknownRun(run_id.to_string()))?
            .state;
        if !from.can_transition_to(to) {
            return Err(JournalError::IllegalTransition {
                run_id: run_id.to_string(),
                from: from.as_str(),
                to: to.as_str(),
            });
        }

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO rebuild_transitions (run_id, from_state, to_state, detail, at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![run_id, from.as_str(), to.as_str(), detail, now_rfc3339()],
        )?;
        tx.execute(
            "UPDATE rebuild_runs SET state = ?1 WHERE run_id = ?2",
            params![to.as_str(), run_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn set_staging(&mut self, run_id: &str, staging: &SnapshotId) -> Result<(), JournalError> {
        self.conn.execute(
            "UPDATE rebuild_runs SET staging_id = ?1 WHERE run_id = ?2",
            params![staging.as_str(), run_id],
        )?;
        Ok(())
    }

    pub fn phase_started(&mut self, run_id: &str, phase: RebuildPhase) -> Result<(), JournalError> {
        let now = now_rfc3339();
        let tx = self.conn.transaction()?;
        tx.execute(
            "
            INSERT INTO rebuild_phase_log (run_id, phase_number, phase_name, status, started_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(run_id, phase_number) DO UPDATE SET
                status = excluded.status,
                started_at = excluded.started_at,
                finished_at = NULL,
                records = NULL,
                error = NULL
            ",
            params![
                run_id,
                phase.number(),
                phase.name(),
                PhaseStatus::Running.as_str(),
                now,
            ],
        )?;
        upsert_progress(&tx, run_id, phase, PhaseStatus::Running, None, &now)?;
        tx.commit()?;
        Ok(())
    }

    pub fn phase_completed(
        &mut self,
        run_id: &str,
        phase: RebuildPhase,
        records: u64,
    ) -> Result<(), JournalError> {
        let now = now_rfc3339();
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE rebuild_phase_log SET status = ?1, finished_at = ?2, records = ?3
             WHERE run_id = ?4 AND phase_number = ?5",
            params![
                PhaseStatus::Completed.as_str(),
                now,
                records as i64,
                run_id,
                phase.number(),
            ],
        )?;
        upsert_progress(&tx, run_id, phase, PhaseStatus::Completed, None, &now)?;
        tx.commit()?;
        Ok(())
    }

    pub fn phase_failed(
        &mut self,
        run_id: &str,
        phase: RebuildPhase,
        error: &str,
    ) -> Result<(), JournalError> {
        let now = now_rfc3339();
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE rebuild_phase_log SET status = ?1, finished_at = ?2, error = ?3
             WHERE run_id = ?4 AND phase_number = ?5",
            params![
                PhaseStatus::Failed.as_str(),
                now,
                error,
                run_id,
                phase.number(),
            ],
        )?;
        upsert_progress(&tx, run_id, phase, PhaseStatus::Failed, Some(error), &now)?;
        tx.commit()?;
        Ok(())
    }

    pub fn completed_phases(&self, run_id: &str) -> Result<Vec<RebuildPhase>, JournalError> {
        let mut stmt = self.conn.prepare(
            "SELECT phase_number FROM rebuild_phase_log
             WHERE run_id = ?1 AND status = 'completed'
             ORDER BY phase_number",
        )?;
        let numbers = stmt
            .query_map(params![run_id], |row| row.get::<_, u32>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        numbers
            .into_iter()
            .map(|n| RebuildPhase::from_number(n).ok_or_else(|| corrupt(&n.to_string())))
            .collect()
    }

    pub fn save_checkpoint<T: Serialize>(
        &mut self,
        run_id: &str,
        phase: RebuildPhase,
        payload: &T,
    ) -> Result<(), JournalError> {
        let encoded = serde_json::to_string(payload).map_err(|source| JournalError::Checkpoint {
            phase: phase.name(),
            source,
        })?;
        self.conn.execute(
            "
            INSERT INTO rebuild_checkpoints (run_id, phase_number, payload, saved_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(run_id, phase_number) DO UPDATE SET
                payload = excluded.payload,
                saved_at = excluded.saved_at
            ",
            params![run_id, phase.number(), encoded, now_rfc3339()],
        )?;
        Ok(())
    }

    pub fn load_checkpoint<T: DeserializeOwned>(
        &self,
        run_id: &str,
        phase: RebuildPhase,
    ) -> Result<Option<T>, JournalError> {
        let payload: Option<String> = self
            .conn
            .query_row(
                "SELECT payload FROM rebuild_checkpoints WHERE run_id = ?1 AND phase_number = ?2",
                params![run_id, phase.number()],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|raw| {
                serde_json::from_str(&raw).map_err(|source| JournalError::Checkpoint {
                    phase: phase.name(),
                    source,
                })
            })
            .transpose()
    }

    /// Checkpoints are only useful until the run reaches a terminal state.
    pub fn clear_checkpoints(&mut self, run_id: &str) -> Result<usize, JournalError> {
        Ok(self.conn.execute(
            "DELETE FROM rebuild_checkpoints WHERE run_id = ?1",
            params![run_id],
        )?)
    }

    pub fn finish_run(&mut self, result: &RunResult) -> Result<(), JournalError> {
        self.conn.execute(
            "
            UPDATE rebuild_runs SET
                status = ?1,
                finished_at = ?2,
                record_count = ?3,
                duration_ms = ?4,
                error_class = ?5,
                error_message = ?6
            WHERE run_id = ?7
            ",
            params![
                result.status.as_str(),
                now_rfc3339(),
                result.record_count as i64,
                result.duration_ms as i64,
                result.error_class.map(ErrorClass::as_str),
                result.error_message,
                result.run_id,
            ],
        )?;
        Ok(())
    }

    pub fn run(&self, run_id: &str) -> Result<Option<RunRecord>, JournalError> {
        let sql = format!("{SELECT_RUN} WHERE run_id = ?1");
        let raw = self
            .conn
            .query_row(&sql, params![run_id], raw_run)
            .optional()?;
        raw.map(RawRun::into_record).transpose()
    }

    pub fn latest_run(&self) -> Result<Option<RunRecord>, JournalError> {
        let sql = format!("{SELECT_RUN} ORDER BY started_at DESC, rowid DESC LIMIT 1");
        let raw = self.conn.query_row(&sql, [], raw_run).optional()?;
        raw.map(RawRun::into_record).transpose()
    }

    pub fn progress(&self, run_id: &str) -> Result<Option<ProgressRecord>, JournalError> {
        let raw = self
            .conn
            .query_row(
                "SELECT phase_number, total_phases, status, error, updated_at
                 FROM rebuild_progress WHERE run_id = ?1",
                params![run_id],
                |row| {
                    Ok((
                        row.get::<_, u32>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        raw.map(|(number, total, status, error, updated_at)| {
            Ok(ProgressRecord {
                run_id: run_id.to_string(),
                phase: RebuildPhase::from_number(number).ok_or_else(|| corrupt(&number.to_string()))?,
                phase_number: number,
                total_phases: total,
                status: PhaseStatus::parse(&status).ok_or_else(|| corrupt(&status))?,
                error,
                updated_at,
            })
        })
        .transpose()
    }

    pub fn transitions(&self, run_id: &str) -> Result<Vec<TransitionRecord>, JournalError> {
        let mut stmt = self.conn.prepare(
            "SELECT from_state, to_state, detail, at FROM rebuild_transitions
             WHERE run_id = ?1 ORDER BY id",
        )?;
        let raw = stmt
            .query_map(params![run_id], |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(|(from, to, detail, at)| {
                Ok(TransitionRecord {
                    from: from
                        .map(|f| RebuildState::parse(&f).ok_or_else(|| corrupt(&f)))
                        .transpose()?,
                    to: RebuildState::parse(&to).ok_or_else(|| corrupt(&to))?,
                    detail,
                    at,
                })
            })
            .collect()
    }
}

fn upsert_progress(
    conn: &Connection,
    run_id: &str,
    phase: RebuildPhase,
    status: PhaseStatus,
    error: Option<&str>,
    now: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "
        INSERT INTO rebuild_progress (
            run_id, phase_name, phase_number, total_phases, status, error, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(run_id) DO UPDATE SET
            phase_name = excluded.phase_name,
            phase_number = excluded.phase_number,
            total_phases = excluded.total_phases,
            status = excluded.status,
            error = excluded.error,
            updated_at = excluded.updated_at
        ",
        params![
            run_id,
            phase.name(),
            phase.number(),
            RebuildPhase::total(),
            status.as_str(),
            error,
            now,
        ],
    )?;
    Ok(())
}

const SELECT_RUN: &str = "
    SELECT run_id, kind, state, status, config_fingerprint, reference_fingerprint,
           schema_fingerprint, staging_id, started_at, finished_at, record_count,
           duration_ms, error_class, error_message
    FROM rebuild_runs";

struct RawRun {
    run_id: String,
    kind: String,
    state: String,
    status: Option<String>,
    inputs: RunInputs,
    staging_id: Option<String>,
    started_at: String,
    finished_at: Option<String>,
    record_count: i64,
    duration_ms: Option<i64>,
    error_class: Option<String>,
    error_message: Option<String>,
}

fn raw_run(row: &rusqlite::Row<'_>) -> Result<RawRun, rusqlite::Error> {
    Ok(RawRun {
        run_id: row.get(0)?,
        kind: row.get(1)?,
        state: row.get(2)?,
        status: row.get(3)?,
        inputs: RunInputs {
            config_fingerprint: row.get(4)?,
            reference_fingerprint: row.get(5)?,
            schema_fingerprint: row.get(6)?,
        },
        staging_id: row.get(7)?,
        started_at: row.get(8)?,
        finished_at: row.get(9)?,
        record_count: row.get(10)?,
        duration_ms: row.get(11)?,
        error_class: row.get(12)?,
        error_message: row.get(13)?,
    })
}

impl RawRun {
    fn into_record(self) -> Result<RunRecord, JournalError> {
        Ok(RunRecord {
            kind: RunKind::parse(&self.kind).ok_or_else(|| corrupt(&self.kind))?,
            state: RebuildState::parse(&self.state).ok_or_else(|| corrupt(&self.state))?,
            status: self
                .status
                .as_deref()
                .map(|s| RunStatus::parse(s).ok_or_else(|| corrupt(s)))
                .transpose()?,
            staging_id: self
                .staging_id
                .as_deref()
                .map(|s| SnapshotId::parse(s).ok_or_else(|| corrupt(s)))
                .transpose()?,
            error_class: self
                .error_class
                .as_deref()
                .map(|s| ErrorClass::parse(s).ok_or_else(|| corrupt(s)))
                .transpose()?,
            run_id: self.run_id,
            inputs: self.inputs,
            started_at: self.started_at,
            finished_at: self.finished_at,
            record_count: self.record_count.max(0) as u64,
            duration_ms: self.duration_ms.map(|d| d.max(0) as u64),
            error_message: self.error_message,
        })
    }
}
