//! Snapshot catalog: which physical feature table plays which role.
//!
//! Consumers resolve the production table through the catalog on every read.
//! Promotion rewrites three catalog rows in one transaction, so a reader
//! sees either the old production or the new one and never zero or two.
//! A partial unique index on `role` enforces at most one production and one
//! retained snapshot.

use std::fmt;
use std::path::Path;

use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::schema::{FeatureRow, FeatureSchema, FeatureValue};
use crate::store::{open_connection, table_columns, table_exists, StoreError};

const ROW_INDEX_COLUMN: &str = "row_idx";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("snapshot {0} is not in the catalog")]
    UnknownSnapshot(SnapshotId),
    #[error("snapshot {id} is {actual}, expected {expected}")]
    WrongRole {
        id: SnapshotId,
        expected: SnapshotRole,
        actual: SnapshotRole,
    },
    #[error("snapshot {id} has no column {column}")]
    UnknownColumn { id: SnapshotId, column: String },
    #[error("row has {actual} values, schema has {expected} columns")]
    RowWidth { expected: usize, actual: usize },
    #[error("no retained snapshot to roll back to")]
    NothingRetained,
    #[error("catalog row has unknown role {0:?}")]
    CorruptRole(String),
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotId(String);

impl SnapshotId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Accepts only ids this catalog could have generated, since the id is
    /// spliced into table names.
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= 64
            && raw.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
        valid.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn table_name(&self) -> String {
        format!("feature_snapshot_{}", self.0)
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotRole {
    Staging,
    Production,
    Retained,
    Superseded,
    Discarded,
    Purged,
}

impl SnapshotRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Staging => "staging",
            Self::Production => "production",
            Self::Retained => "retained",
            Self::Superseded => "superseded",
            Self::Discarded => "discarded",
            Self::Purged => "purged",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "staging" => Some(Self::Staging),
            "production" => Some(Self::Production),
            "retained" => Some(Self::Retained),
            "superseded" => Some(Self::Superseded),
            "discarded" => Some(Self::Discarded),
            "purged" => Some(Self::Purged),
            _ => None,
        }
    }
}

impl fmt::Display for SnapshotRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: SnapshotId,
    pub role: SnapshotRole,
    pub run_id: String,
    pub schema_version: u32,
    pub schema_fingerprint: String,
    pub row_count: u64,
    pub digest: Option<String>,
    pub created_at: String,
    pub promoted_at: Option<String>,
}

impl CatalogEntry {
    pub fn table_name(&self) -> String {
        self.id.table_name()
    }
}

/// Production and retained ids at one instant. Captured before an exchange
/// so a failed one can be reverted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub production: Option<SnapshotId>,
    pub retained: Option<SnapshotId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeOutcome {
    pub promoted: SnapshotId,
    pub retained: Option<SnapshotId>,
    pub superseded: Option<SnapshotId>,
}

pub trait SnapshotCatalog {
    fn entry(&self, id: &SnapshotId) -> Result<Option<CatalogEntry>, CatalogError>;
    fn production(&self) -> Result<Option<CatalogEntry>, CatalogError>;
    fn retained(&self) -> Result<Option<CatalogEntry>, CatalogError>;
    fn entries(&self) -> Result<Vec<CatalogEntry>, CatalogError>;

    fn create_staging(
        &mut self,
        run_id: &str,
        schema: &FeatureSchema,
    ) -> Result<SnapshotId, CatalogError>;
    fn append_rows(
        &mut self,
        id: &SnapshotId,
        schema: &FeatureSchema,
        rows: &[FeatureRow],
    ) -> Result<u64, CatalogError>;
    fn row_count(&self, id: &SnapshotId) -> Result<u64, CatalogError>;
    fn non_null_count(&self, id: &SnapshotId, column: &str) -> Result<u64, CatalogError>;
    fn column_names(&self, id: &SnapshotId) -> Result<Vec<String>, CatalogError>;
    fn record_digest(
        &mut self,
        id: &SnapshotId,
        digest: &str,
        row_count: u64,
    ) -> Result<(), CatalogError>;

    /// Promotes `staging` to production in one indivisible update.
    fn exchange(&mut self, staging: &SnapshotId) -> Result<ExchangeOutcome, CatalogError>;
    /// Puts `before` back in place and marks `failed` discarded.
    fn restore_roles(
        &mut self,
        before: &RoleAssignment,
        failed: &SnapshotId,
    ) -> Result<(), CatalogError>;
    fn rollback_to_retained(&mut self) -> Result<ExchangeOutcome, CatalogError>;
    /// Drops the staging table. Production is untouched.
    fn discard(&mut self, id: &SnapshotId) -> Result<(), CatalogError>;
    /// Drops every superseded or discarded table.
    fn purge(&mut self) -> Result<Vec<SnapshotId>, CatalogError>;

    fn roles(&self) -> Result<RoleAssignment, CatalogError> {
        Ok(RoleAssignment {
            production: self.production()?.map(|e| e.id),
            retained: self.retained()?.map(|e| e.id),
        })
    }

    /// Table name a consumer should read right now.
    fn resolve_production(&self) -> Result<Option<String>, CatalogError> {
        Ok(self.production()?.map(|e| e.table_name()))
    }
}

pub struct SqliteCatalog {
    conn: Connection,
}

impl SqliteCatalog {
    pub fn open(path: &Path) -> Result<Self, CatalogError> {
        let conn = open_connection(path)?;
        ensure_catalog_schema(&conn)?;
        Ok(Self { conn })
    }

    fn require_role(&self, id: &SnapshotId, expected: SnapshotRole) -> Result<(), CatalogError> {
        let entry = self
            .entry(id)?
            .ok_or_else(|| CatalogError::UnknownSnapshot(id.clone()))?;
        if entry.role == expected {
            Ok(())
        } else {
            Err(CatalogError::WrongRole {
                id: id.clone(),
                expected,
                actual: entry.role,
            })
        }
    }

    fn entry_by_role(&self, role: SnapshotRole) -> Result<Option<CatalogEntry>, CatalogError> {
        let sql = format!("{SELECT_ENTRY} WHERE role = ?1");
        let raw = self
            .conn
            .query_row(&sql, params![role.as_str()], raw_entry)
            .optional()?;
        raw.map(RawEntry::into_entry).transpose()
    }
}

fn role_holder(conn: &Connection, role: SnapshotRole) -> Result<Option<SnapshotId>, CatalogError> {
    let id: Option<String> = conn
        .query_row(
            "SELECT id FROM snapshot_catalog WHERE role = ?1",
            params![role.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id.map(SnapshotId))
}

const SELECT_ENTRY: &str = "
    SELECT id, role, run_id, schema_version, schema_fingerprint, row_count, digest,
           created_at, promoted_at
    FROM snapshot_catalog";

fn ensure_catalog_schema(conn: &Connection) -> Result<(), CatalogError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS snapshot_catalog (
            id TEXT PRIMARY KEY,
            role TEXT NOT NULL,
            run_id TEXT NOT NULL,
            schema_version INTEGER NOT NULL,
            schema_fingerprint TEXT NOT NULL,
            row_count INTEGER NOT NULL DEFAULT 0,
            digest TEXT,
            created_at TEXT NOT NULL,
            promoted_at TEXT
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_snapshot_catalog_single_role
            ON snapshot_catalog(role)
            WHERE role IN ('production', 'retained');
        ",
    )?;
    Ok(())
}

struct RawEntry {
    id: String,
    role: String,
    run_id: String,
    schema_version: u32,
    schema_fingerprint: String,
    row_count: i64,
    digest: Option<String>,
    created_at: String,
    promoted_at: Option<String>,
}

impl RawEntry {
    fn into_entry(self) -> Result<CatalogEntry, CatalogError> {
        let role = SnapshotRole::parse(&self.role).ok_or(CatalogError::CorruptRole(self.role))?;
        Ok(CatalogEntry {
            id: SnapshotId(self.id),
            role,
            run_id: self.run_id,
            schema_version: self.schema_version,
            schema_fingerprint: self.schema_fingerprint,
            row_count: self.row_count.max(0) as u64,
            digest: self.digest,
            created_at: self.created_at,
            promoted_at: self.promoted_at,
        })
    }
}

fn raw_entry(row: &rusqlite::Row<'_>) -> Result<RawEntry, rusqlite::Error> {
    Ok(RawEntry {
        id: row.get(0)?,
        role: row.get(1)?,
        run_id: row.get(2)?,
        schema_version: row.get(3)?,
        schema_fingerprint: row.get(4)?,
        row_count: row.get(5)?,
        digest: row.get(6)?,
        created_at: row.get(7)?,
        promoted_at: row.get(8)?,
    })
}

fn sql_value(value: &FeatureValue) -> Value {
    match value {
        FeatureValue::Null => Value::Null,
        FeatureValue::Int(v) => Value::Integer(*v),
        FeatureValue::Real(v) if v.is_finite() => Value::Real(*v),
        FeatureValue::Real(_) => Value::Null,
        FeatureValue::Bool(v) => Value::Integer(i64::from(*v)),
        FeatureValue::Text(v) => Value::Text(v.clone()),
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

impl SnapshotCatalog for SqliteCatalog {
    fn entry(&self, id: &SnapshotId) -> Result<Option<CatalogEntry>, CatalogError> {
        let sql = format!("{SELECT_ENTRY} WHERE id = ?1");
        let raw = self
            .conn
            .query_row(&sql, params![id.as_str()], raw_entry)
            .optional()?;
        raw.map(RawEntry::into_entry).transpose()
    }

    fn production(&self) -> Result<Option<CatalogEntry>, CatalogError> {
        self.entry_by_role(SnapshotRole::Production)
    }

    fn retained(&self) -> Result<Option<CatalogEntry>, CatalogError> {
        self.entry_by_role(SnapshotRole::Retained)
    }

    fn entries(&self) -> Result<Vec<CatalogEntry>, CatalogError> {
        let sql = format!("{SELECT_ENTRY} ORDER BY created_at, id");
        let mut stmt = self.conn.prepare(&sql)?;
        let raw = stmt
            .query_map([], raw_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(RawEntry::into_entry).collect()
    }

    fn create_staging(
        &mut self,
        run_id: &str,
        schema: &FeatureSchema,
    ) -> Result<SnapshotId, CatalogError> {
        let id = SnapshotId::generate();
        let columns = schema
            .columns
            .iter()
            .map(|c| format!("\"{}\" {}", c.name, c.dtype.sql_type()))
            .collect::<Vec<_>>()
            .join(",\n    ");
        let ddl = format!(
            "CREATE TABLE \"{}\" (\n    {ROW_INDEX_COLUMN} INTEGER PRIMARY KEY,\n    {columns}\n)",
            id.table_name()
        );

        let tx = self.conn.transaction()?;
        tx.execute(&ddl, [])?;
        tx.execute(
            "
            INSERT INTO snapshot_catalog (
                id, role, run_id, schema_version, schema_fingerprint, row_count, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)
            ",
            params![
                id.as_str(),
                SnapshotRole::Staging.as_str(),
                run_id,
                schema.version,
                schema.fingerprint,
                now_rfc3339(),
            ],
        )?;
        tx.commit()?;

        info!(
            component = "catalog",
            event = "catalog.staging.created",
            snapshot_id = %id,
            run_id = run_id,
            columns = schema.columns.len()
        );
        Ok(id)
    }

    fn append_rows(
        &mut self,
        id: &SnapshotId,
        schema: &FeatureSchema,
        rows: &[FeatureRow],
    ) -> Result<u64, CatalogError> {
        self.require_role(id, SnapshotRole::Staging)?;
        if rows.is_empty() {
            return Ok(0);
        }

        let start = self.row_count(id)?;
        let column_list = schema
            .columns
            .iter()
            .map(|c| format!("\"{}\"", c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=schema.columns.len() + 1)
            .map(|n| format!("?{n}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO \"{}\" ({ROW_INDEX_COLUMN}, {column_list}) VALUES ({placeholders})",
            id.table_name()
        );

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(&sql)?;
            for (offset, row) in rows.iter().enumerate() {
                if row.values.len() != schema.columns.len() {
                    return Err(CatalogError::RowWidth {
                        expected: schema.columns.len(),
                        actual: row.values.len(),
                    });
                }
                let row_idx = Value::Integer((start + offset as u64) as i64);
                let values = std::iter::once(row_idx).chain(row.values.iter().map(sql_value));
                stmt.execute(params_from_iter(values))?;
            }
        }
        tx.commit()?;
        Ok(rows.len() as u64)
    }

    fn row_count(&self, id: &SnapshotId) -> Result<u64, CatalogError> {
        if !table_exists(&self.conn, &id.table_name())? {
            return Err(CatalogError::UnknownSnapshot(id.clone()));
        }
        let sql = format!("SELECT COUNT(*) FROM \"{}\"", id.table_name());
        let n: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(n as u64)
    }

    fn non_null_count(&self, id: &SnapshotId, column: &str) -> Result<u64, CatalogError> {
        if !self.column_names(id)?.iter().any(|c| c == column) {
            return Err(CatalogError::UnknownColumn {
                id: id.clone(),
                column: column.to_string(),
            });
        }
        let sql = format!("SELECT COUNT(\"{column}\") FROM \"{}\"", id.table_name());
        let n: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(n as u64)
    }

    fn column_names(&self, id: &SnapshotId) -> Result<Vec<String>, CatalogError> {
        let columns = table_columns(&self.conn, &id.table_name())?;
        if columns.is_empty() {
            return Err(CatalogError::UnknownSnapshot(id.clone()));
        }
        Ok(columns
            .into_iter()
            .filter(|c| c != ROW_INDEX_COLUMN)
            .collect())
    }

    fn record_digest(
        &mut self,
        id: &SnapshotId,
        digest: &str,
        row_count: u64,
    ) -> Result<(), CatalogError> {
        let updated = self.conn.execute(
            "UPDATE snapshot_catalog SET digest = ?1, row_count = ?2 WHERE id = ?3",
            params![digest, row_count as i64, id.as_str()],
        )?;
        if updated == 0 {
            return Err(CatalogError::UnknownSnapshot(id.clone()));
        }
        Ok(())
    }

    fn exchange(&mut self, staging: &SnapshotId) -> Result<ExchangeOutcome, CatalogError> {
        self.require_role(staging, SnapshotRole::Staging)?;

        // Immediate: the prior roles are read under the same write lock as
        // the rotation, so the outcome names what was actually replaced.
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let before = RoleAssignment {
            production: role_holder(&tx, SnapshotRole::Production)?,
            retained: role_holder(&tx, SnapshotRole::Retained)?,
        };
        tx.execute(
            "UPDATE snapshot_catalog SET role = 'superseded' WHERE role = 'retained'",
            [],
        )?;
        tx.execute(
            "UPDATE snapshot_catalog SET role = 'retained' WHERE role = 'production'",
            [],
        )?;
        let promoted = tx.execute(
            "UPDATE snapshot_catalog SET role = 'production', promoted_at = ?1
             WHERE id = ?2 AND role = 'staging'",
            params![now_rfc3339(), staging.as_str()],
        )?;
        if promoted != 1 {
            return Err(CatalogError::UnknownSnapshot(staging.clone()));
        }
        tx.commit()?;

        let outcome = ExchangeOutcome {
            promoted: staging.clone(),
            retained: before.production,
            superseded: before.retained,
        };
        info!(
            component = "catalog",
            event = "catalog.exchange.commit",
            promoted = %outcome.promoted,
            retained = outcome.retained.as_ref().map(SnapshotId::as_str),
            superseded = outcome.superseded.as_ref().map(SnapshotId::as_str)
        );
        Ok(outcome)
    }

    fn restore_roles(
        &mut self,
        before: &RoleAssignment,
        failed: &SnapshotId,
    ) -> Result<(), CatalogError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE snapshot_catalog SET role = 'discarded' WHERE id = ?1",
            params![failed.as_str()],
        )?;
        tx.execute(
            "UPDATE snapshot_catalog SET role = 'superseded'
             WHERE role IN ('production', 'retained')",
            [],
        )?;
        if let Some(id) = &before.production {
            tx.execute(
                "UPDATE snapshot_catalog SET role = 'production' WHERE id = ?1",
                params![id.as_str()],
            )?;
        }
        if let Some(id) = &before.retained {
            tx.execute(
                "UPDATE snapshot_catalog SET role = 'retained' WHERE id = ?1",
                params![id.as_str()],
            )?;
        }
        tx.commit()?;

        info!(
            component = "catalog",
            event = "catalog.exchange.restored",
            failed = %failed,
            production = before.production.as_ref().map(SnapshotId::as_str)
        );
        Ok(())
    }

    fn rollback_to_retained(&mut self) -> Result<ExchangeOutcome, CatalogError> {
        let before = self.roles()?;
        let retained = before.retained.clone().ok_or(CatalogError::NothingRetained)?;

        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE snapshot_catalog SET role = 'superseded' WHERE role = 'production'",
            [],
        )?;
        tx.execute(
            "UPDATE snapshot_catalog SET role = 'production', promoted_at = ?1 WHERE id = ?2",
            params![now_rfc3339(), retained.as_str()],
        )?;
        tx.commit()?;

        let outcome = ExchangeOutcome {
            promoted: retained,
            retained: None,
            superseded: before.production,
        };
        info!(
            component = "catalog",
            event = "catalog.rollback.commit",
            promoted = %outcome.promoted,
            superseded = outcome.superseded.as_ref().map(SnapshotId::as_str)
        );
        Ok(outcome)
    }

    fn discard(&mut self, id: &SnapshotId) -> Result<(), CatalogError> {
        self.require_role(id, SnapshotRole::Staging)?;
        let tx = self.conn.transaction()?;
        tx.execute(&format!("DROP TABLE IF EXISTS \"{}\"", id.table_name()), [])?;
        tx.execute(
            "UPDATE snapshot_catalog SET role = 'discarded' WHERE id = ?1",
            params![id.as_str()],
        )?;
        tx.commit()?;
        info!(
            component = "catalog",
            event = "catalog.staging.discarded",
            snapshot_id = %id
        );
        Ok(())
    }

    fn purge(&mut self) -> Result<Vec<SnapshotId>, CatalogError> {
        let ids: Vec<SnapshotId> = {
            let mut stmt = self.conn.prepare(
                "SELECT id FROM snapshot_catalog
                 WHERE role IN ('superseded', 'discarded')
                 ORDER BY created_at, id",
            )?;
            let raw = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            raw.into_iter().map(SnapshotId).collect()
        };

        let tx = self.conn.transaction()?;
        for id in &ids {
            tx.execute(&format!("DROP TABLE IF EXISTS \"{}\"", id.table_name()), [])?;
            tx.execute(
                "UPDATE snapshot_catalog SET role = 'purged' WHERE id = ?1",
                params![id.as_str()],
            )?;
        }
        tx.commit()?;

        info!(
            component = "catalog",
            event = "catalog.purge",
            purged = ids.len()
        );
        Ok(ids)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotComparison {
    pub left: SnapshotId,
    pub right: SnapshotId,
    pub left_rows: u64,
    pub right_rows: u64,
    pub left_columns: usize,
    pub right_columns: usize,
    pub added_columns: Vec<String>,
    pub removed_columns: Vec<String>,
    pub schema_match: bool,
    pub digest_match: Option<bool>,
}

/// Row and column comparison between two snapshots, typically staging
/// against production before a manual promotion.
pub fn compare_snapshots<C: SnapshotCatalog + ?Sized>(
    catalog: &C,
    left: &SnapshotId,
    right: &SnapshotId,
) -> Result<SnapshotComparison, CatalogError> {
    let left_entry = catalog
        .entry(left)?
        .ok_or_else(|| CatalogError::UnknownSnapshot(left.clone()))?;
    let right_entry = catalog
        .entry(right)?
        .ok_or_else(|| CatalogError::UnknownSnapshot(right.clone()))?;
    let left_columns = catalog.column_names(left)?;
    let right_columns = catalog.column_names(right)?;

    let added_columns = right_columns
        .iter()
        .filter(|c| !left_columns.contains(c))
        .cloned()
        .collect();
    let removed_columns = left_columns
        .iter()
        .filter(|c| !right_columns.contains(c))
        .cloned()
        .collect();
    let digest_match = left_entry
        .digest
        .as_ref()
        .zip(right_entry.digest.as_ref())
        .map(|(l, r)| l == r);

    Ok(SnapshotComparison {
        left: left.clone(),
        right: right.clone(),
        left_rows: catalog.row_count(left)?,
        right_rows: catalog.row_count(right)?,
        left_columns: left_columns.len(),
        right_columns: right_columns.len(),
        added_columns,
        removed_columns,
        schema_match: left_entry.schema_fingerprint == right_entry.schema_fingerprint,
        digest_match,
    })
}
