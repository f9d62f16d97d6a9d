use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use chrono::NaiveDate;
use racealpha::{
    CatalogEntry, CatalogError, CompiledReference, CoordinatorError, ErrorClass,
    ExchangeOutcome, FeatureRow, FeatureSchema, RaceParticipation, RebuildConfig,
    RebuildCoordinator, RebuildJournal, RebuildPhase, RebuildState, RoleAssignment, RunResult,
    RunStatus, SnapshotCatalog, SnapshotId, SnapshotRole, SqliteCatalog, SqliteSource,
};
use tempfile::{tempdir, TempDir};

const RACES: u32 = 6;
const FIELD: u32 = 8;

fn participation(race: u32, slot: u32) -> RaceParticipation {
    RaceParticipation {
        race_id: format!("race-{race:02}"),
        race_date: NaiveDate::from_ymd_opt(2024, 5, race).expect("valid date"),
        race_number: 1,
        track_name: "Caulfield".to_string(),
        locale_hint: None,
        distance_m: 1400,
        class_text: "BM70".to_string(),
        track_condition: Some("Soft 5".to_string()),
        rail_text: Some("True".to_string()),
        horse_id: format!("horse-{slot}"),
        horse_name: format!("Horse {slot}"),
        horse_number: Some(slot),
        jockey_id: Some(format!("jockey-{}", slot % 3)),
        trainer_id: Some(format!("trainer-{}", slot % 2)),
        barrier: Some(slot),
        weight_carried: Some(54.0 + f64::from(slot % 4)),
        win_odds: Some(2.0 + f64::from(slot)),
        // rotate finishing order so every horse wins somewhere
        finish_position: Some((slot + race) % FIELD + 1),
        margin: None,
    }
}

fn seed_store(path: &Path) -> usize {
    let rows: Vec<RaceParticipation> = (1..=RACES)
        .flat_map(|race| (1..=FIELD).map(move |slot| participation(race, slot)))
        .collect();
    let mut source = SqliteSource::open(path).expect("open source");
    source.write_participations(&rows).expect("seed rows")
}

fn config(path: &Path) -> RebuildConfig {
    let mut config = RebuildConfig::default();
    config.store_path = path.to_path_buf();
    config.validation.min_rows = 10;
    config.insert_batch_size = 7;
    config
}

fn coordinator_with<C: SnapshotCatalog>(
    path: &Path,
    catalog: C,
    config: RebuildConfig,
) -> RebuildCoordinator<SqliteSource, C> {
    RebuildCoordinator::new(
        SqliteSource::open(path).expect("open source"),
        catalog,
        RebuildJournal::open(path).expect("open journal"),
        CompiledReference::builtin().expect("builtin reference"),
        config,
    )
    .expect("coordinator")
}

fn coordinator(
    path: &Path,
    config: RebuildConfig,
) -> RebuildCoordinator<SqliteSource, SqliteCatalog> {
    coordinator_with(path, SqliteCatalog::open(path).expect("open catalog"), config)
}

fn production_id(path: &Path) -> Option<SnapshotId> {
    SqliteCatalog::open(path)
        .expect("open catalog")
        .production()
        .expect("production")
        .map(|entry| entry.id)
}

#[test]
fn full_rebuild_promotes_staging_and_retains_the_previous_build() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("racing.sqlite");
    let seeded = seed_store(&path);

    let first = coordinator(&path, config(&path))
        .run_full_rebuild()
        .expect("first run");
    assert_eq!(first.status, RunStatus::Succeeded);
    assert_eq!(first.final_state, Some(RebuildState::Committed));
    assert_eq!(first.record_count, seeded as u64);
    let first_id = first.snapshot_id.clone().expect("first snapshot");

    let mut second_coord = coordinator(&path, config(&path));
    let second = second_coord.run_full_rebuild().expect("second run");
    assert_eq!(second.status, RunStatus::Succeeded);
    let second_id = second.snapshot_id.clone().expect("second snapshot");
    assert_ne!(first_id, second_id);

    let roles = second_coord.catalog().roles().expect("roles");
    assert_eq!(roles.production, Some(second_id.clone()));
    assert_eq!(roles.retained, Some(first_id));
    assert_eq!(
        second_coord.catalog().resolve_production().expect("resolve"),
        Some(second_id.table_name())
    );
    assert_eq!(
        second_coord.catalog().row_count(&second_id).expect("rows"),
        seeded as u64
    );

    let states: Vec<RebuildState> = second_coord
        .journal()
        .transitions(&second.run_id)
        .expect("transitions")
        .into_iter()
        .map(|t| t.to)
        .collect();
    assert_eq!(
        states,
        vec![
            RebuildState::Building,
            RebuildState::Validating,
            RebuildState::Swapping,
            RebuildState::Committed,
        ]
    );
    let run = second_coord
        .journal()
        .run(&second.run_id)
        .expect("run lookup")
        .expect("run recorded");
    assert_eq!(run.status, Some(RunStatus::Succeeded));
    assert_eq!(run.record_count, seeded as u64);
}

#[test]
fn identical_inputs_produce_identical_digests() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("racing.sqlite");
    seed_store(&path);

    let mut coord = coordinator(&path, config(&path));
    let a = coord.run_full_rebuild().expect("first");
    let b = coord.run_full_rebuild().expect("second");

    let digest = |id: &SnapshotId| -> Option<String> {
        coord
            .catalog()
            .entry(id)
            .expect("entry")
            .and_then(|e: CatalogEntry| e.digest)
    };
    let left = digest(a.snapshot_id.as_ref().expect("a"));
    assert!(left.is_some());
    assert_eq!(left, digest(b.snapshot_id.as_ref().expect("b")));
}

#[test]
fn row_floor_failure_leaves_production_untouched() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("racing.sqlite");
    seed_store(&path);

    let committed = coordinator(&path, config(&path))
        .run_full_rebuild()
        .expect("baseline run");
    let production = committed.snapshot_id.expect("baseline snapshot");

    let mut strict = config(&path);
    strict.validation.min_rows = 100_000;
    let mut coord = coordinator(&path, strict);
    let failed = coord.run_full_rebuild().expect("strict run");

    assert_eq!(failed.status, RunStatus::Failed);
    assert_eq!(failed.error_class, Some(ErrorClass::ValidationFailed));
    assert_eq!(failed.final_state, Some(RebuildState::Aborted));
    let report = failed.validation.as_ref().expect("validation report");
    assert!(!report.passed());
    assert!(failed
        .error_message
        .as_deref()
        .is_some_and(|m| m.contains("below floor 100000")));

    assert_eq!(production_id(&path), Some(production));
    let staging = failed.snapshot_id.expect("staging id");
    let entry = coord
        .catalog()
        .entry(&staging)
        .expect("entry")
        .expect("staging recorded");
    assert_eq!(entry.role, SnapshotRole::Discarded);
}

#[test]
fn readers_always_see_exactly_one_production_during_swaps() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("racing.sqlite");
    seed_store(&path);
    let mut coord = coordinator(&path, config(&path));
    coord.run_full_rebuild().expect("initial run");

    let stop = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..2)
        .map(|_| {
            let stop = Arc::clone(&stop);
            let path = path.clone();
            thread::spawn(move || {
                let catalog = SqliteCatalog::open(&path).expect("reader catalog");
                let mut observations = 0u32;
                let mut violations = Vec::new();
                while !stop.load(Ordering::SeqCst) || observations == 0 {
                    let entries = catalog.entries().expect("entries");
                    let live = entries
                        .iter()
                        .filter(|e| e.role == SnapshotRole::Production)
                        .count();
                    if live != 1 {
                        violations.push(live);
                    }
                    if catalog.resolve_production().expect("resolve").is_none() {
                        violations.push(0);
                    }
                    observations += 1;
                }
                (observations, violations)
            })
        })
        .collect();

    for _ in 0..3 {
        let result = coord.run_full_rebuild().expect("swap run");
        assert_eq!(result.status, RunStatus::Succeeded);
    }
    stop.store(true, Ordering::SeqCst);

    for reader in readers {
        let (observations, violations) = reader.join().expect("reader thread");
        assert!(observations > 0);
        assert!(violations.is_empty(), "readers saw {violations:?}");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExchangeFault {
    /// Fails before touching the catalog.
    Refuse,
    /// Applies the exchange, then reports failure.
    FailAfterCommit,
    /// Like `FailAfterCommit`, and the restore fails too.
    FailAndBlockRestore,
    /// The retained role cannot be read, so the swap cannot start.
    UnreadableRoles,
}

struct FaultyCatalog {
    inner: SqliteCatalog,
    fault: ExchangeFault,
}

impl SnapshotCatalog for FaultyCatalog {
    fn entry(&self, id: &SnapshotId) -> Result<Option<CatalogEntry>, CatalogError> {
        self.inner.entry(id)
    }

    fn production(&self) -> Result<Option<CatalogEntry>, CatalogError> {
        self.inner.production()
    }

    fn retained(&self) -> Result<Option<CatalogEntry>, CatalogError> {
        if self.fault == ExchangeFault::UnreadableRoles {
            return Err(CatalogError::Unavailable("injected read fault".to_string()));
        }
        self.inner.retained()
    }

    fn entries(&self) -> Result<Vec<CatalogEntry>, CatalogError> {
        self.inner.entries()
    }

    fn create_staging(
        &mut self,
        run_id: &str,
        schema: &FeatureSchema,
    ) -> Result<SnapshotId, CatalogError> {
        self.inner.create_staging(run_id, schema)
    }

    fn append_rows(
        &mut self,
        id: &SnapshotId,
        schema: &FeatureSchema,
        rows: &[FeatureRow],
    ) -> Result<u64, CatalogError> {
        self.inner.append_rows(id, schema, rows)
    }

    fn row_count(&self, id: &SnapshotId) -> Result<u64, CatalogError> {
        self.inner.row_count(id)
    }

    fn non_null_count(&self, id: &SnapshotId, column: &str) -> Result<u64, CatalogError> {
        self.inner.non_null_count(id, column)
    }

    fn column_names(&self, id: &SnapshotId) -> Result<Vec<String>, CatalogError> {
        self.inner.column_names(id)
    }

    fn record_digest(
        &mut self,
        id: &SnapshotId,
        digest: &str,
        row_count: u64,
    ) -> Result<(), CatalogError> {
        self.inner.record_digest(id, digest, row_count)
    }

    fn exchange(&mut self, staging: &SnapshotId) -> Result<ExchangeOutcome, CatalogError> {
        if self.fault != ExchangeFault::Refuse {
            self.inner.exchange(staging)?;
        }
        Err(CatalogError::Unavailable("injected exchange fault".to_string()))
    }

    fn restore_roles(
        &mut self,
        before: &RoleAssignment,
        failed: &SnapshotId,
    ) -> Result<(), CatalogError> {
        if self.fault == ExchangeFault::FailAndBlockRestore {
            return Err(CatalogError::Unavailable("injected restore fault".to_string()));
        }
        self.inner.restore_roles(before, failed)
    }

    fn rollback_to_retained(&mut self) -> Result<ExchangeOutcome, CatalogError> {
        self.inner.rollback_to_retained()
    }

    fn discard(&mut self, id: &SnapshotId) -> Result<(), CatalogError> {
        self.inner.discard(id)
    }

    fn purge(&mut self) -> Result<Vec<SnapshotId>, CatalogError> {
        self.inner.purge()
    }
}

fn run_with_fault(fault: ExchangeFault) -> (RunResult, SnapshotId, PathBuf, TempDir) {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("racing.sqlite");
    seed_store(&path);
    let baseline = coordinator(&path, config(&path))
        .run_full_rebuild()
        .expect("baseline run")
        .snapshot_id
        .expect("baseline snapshot");

    let catalog = FaultyCatalog {
        inner: SqliteCatalog::open(&path).expect("open catalog"),
        fault,
    };
    let result = coordinator_with(&path, catalog, config(&path))
        .run_full_rebuild()
        .expect("faulty run");
    (result, baseline, path, dir)
}

#[test]
fn refused_exchange_rolls_back_and_discards_staging() {
    let (result, baseline, path, _dir) = run_with_fault(ExchangeFault::Refuse);

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.error_class, Some(ErrorClass::SwapRolledBack));
    assert_eq!(result.final_state, Some(RebuildState::RolledBack));
    assert_eq!(production_id(&path), Some(baseline));

    let staging = result.snapshot_id.expect("staging id");
    let entry = SqliteCatalog::open(&path)
        .expect("open catalog")
        .entry(&staging)
        .expect("entry")
        .expect("staging recorded");
    assert_eq!(entry.role, SnapshotRole::Discarded);
}

#[test]
fn half_applied_exchange_is_reverted() {
    let (result, baseline, path, _dir) = run_with_fault(ExchangeFault::FailAfterCommit);

    assert_eq!(result.error_class, Some(ErrorClass::SwapRolledBack));
    assert_eq!(result.final_state, Some(RebuildState::RolledBack));
    let catalog = SqliteCatalog::open(&path).expect("open catalog");
    let roles = catalog.roles().expect("roles");
    assert_eq!(roles.production, Some(baseline));
    assert_eq!(roles.retained, None);
}

#[test]
fn unconfirmed_restore_reports_unknown_state() {
    let (result, _baseline, path, _dir) = run_with_fault(ExchangeFault::FailAndBlockRestore);

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.error_class, Some(ErrorClass::SwapUnknownState));
    assert_eq!(result.final_state, Some(RebuildState::UnknownState));
    assert!(result
        .error_message
        .as_deref()
        .is_some_and(|m| m.contains("restore failed")));

    let journal = RebuildJournal::open(&path).expect("open journal");
    let run = journal
        .run(&result.run_id)
        .expect("run lookup")
        .expect("run recorded");
    assert_eq!(run.state, RebuildState::UnknownState);
    assert_eq!(run.error_class, Some(ErrorClass::SwapUnknownState));
}

#[test]
fn unreadable_roles_fail_the_swap_before_any_exchange() {
    let (result, baseline, path, _dir) = run_with_fault(ExchangeFault::UnreadableRoles);

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.error_class, Some(ErrorClass::SwapFailed));
    assert_eq!(result.final_state, Some(RebuildState::Aborted));
    assert_eq!(production_id(&path), Some(baseline));

    let staging = result.snapshot_id.expect("staging id");
    let entry = SqliteCatalog::open(&path)
        .expect("open catalog")
        .entry(&staging)
        .expect("entry")
        .expect("staging recorded");
    assert_eq!(entry.role, SnapshotRole::Discarded);
}

fn pause_after(path: &Path, phase: RebuildPhase) -> RunResult {
    let mut pausing = config(path);
    pausing.stop_after = Some(phase);
    let paused = coordinator(path, pausing)
        .run_full_rebuild()
        .expect("paused run");
    assert_eq!(paused.status, RunStatus::Paused);
    paused
}

fn set_journal_column(path: &Path, run_id: &str, column: &str, value: &str) {
    let conn = rusqlite::Connection::open(path).expect("open store");
    let updated = conn
        .execute(
            &format!("UPDATE rebuild_runs SET {column} = ?1 WHERE run_id = ?2"),
            rusqlite::params![value, run_id],
        )
        .expect("update run");
    assert_eq!(updated, 1);
}

#[test]
fn paused_run_resumes_from_its_checkpoint() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("racing.sqlite");
    let seeded = seed_store(&path);

    let mut pausing = config(&path);
    pausing.stop_after = Some(RebuildPhase::Rating);
    let paused = coordinator(&path, pausing)
        .run_full_rebuild()
        .expect("paused run");
    assert_eq!(paused.status, RunStatus::Paused);
    assert_eq!(paused.final_state, Some(RebuildState::Building));
    assert_eq!(production_id(&path), None);

    let journal = RebuildJournal::open(&path).expect("open journal");
    let progress = journal
        .progress(&paused.run_id)
        .expect("progress")
        .expect("progress recorded");
    assert_eq!(progress.phase, RebuildPhase::Rating);
    let completed = journal.completed_phases(&paused.run_id).expect("completed");
    assert_eq!(
        completed,
        vec![
            RebuildPhase::Extract,
            RebuildPhase::Base,
            RebuildPhase::Aggregate,
            RebuildPhase::Rating,
        ]
    );

    let mut resumed_coord = coordinator(&path, config(&path));
    let resumed = resumed_coord.resume(&paused.run_id).expect("resume");
    assert_eq!(resumed.run_id, paused.run_id);
    assert_eq!(resumed.status, RunStatus::Succeeded);
    assert_eq!(resumed.record_count, seeded as u64);
    assert_eq!(production_id(&path), resumed.snapshot_id);

    let again = resumed_coord.resume(&paused.run_id);
    assert!(matches!(
        again,
        Err(CoordinatorError::NotResumable {
            state: RebuildState::Committed,
            ..
        })
    ));
}

#[test]
fn resume_after_staging_promotes_the_same_snapshot() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("racing.sqlite");
    seed_store(&path);

    let mut pausing = config(&path);
    pausing.stop_after = Some(RebuildPhase::Stage);
    let paused = coordinator(&path, pausing)
        .run_full_rebuild()
        .expect("paused run");
    let staged = paused.snapshot_id.clone().expect("staged snapshot");

    let resumed = coordinator(&path, config(&path))
        .resume(&paused.run_id)
        .expect("resume");
    assert_eq!(resumed.status, RunStatus::Succeeded);
    assert_eq!(resumed.snapshot_id, Some(staged.clone()));
    assert_eq!(production_id(&path), Some(staged));
}

#[test]
fn resume_rejects_changed_configuration() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("racing.sqlite");
    seed_store(&path);

    let mut pausing = config(&path);
    pausing.stop_after = Some(RebuildPhase::Base);
    let paused = coordinator(&path, pausing)
        .run_full_rebuild()
        .expect("paused run");

    let mut changed = config(&path);
    changed.rating.k_factor = 24.0;
    let err = coordinator(&path, changed)
        .resume(&paused.run_id)
        .expect_err("config changed");
    assert!(matches!(err, CoordinatorError::InputsChanged { .. }));
}

#[test]
fn resume_rejects_a_staging_table_built_for_another_layout() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("racing.sqlite");
    seed_store(&path);
    let paused = pause_after(&path, RebuildPhase::Validate);
    set_journal_column(&path, &paused.run_id, "schema_fingerprint", "older-layout");

    let err = coordinator(&path, config(&path))
        .resume(&paused.run_id)
        .expect_err("schema changed");

    assert!(matches!(err, CoordinatorError::InputsChanged { what: "schema", .. }));
    assert_eq!(production_id(&path), None);
}

#[test]
fn cancelled_resume_before_swapping_aborts_cleanly() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("racing.sqlite");
    seed_store(&path);
    let paused = pause_after(&path, RebuildPhase::Validate);
    assert_eq!(paused.final_state, Some(RebuildState::Validating));

    let mut coord = coordinator(&path, config(&path));
    coord.cancel_flag().cancel();
    let result = coord.resume(&paused.run_id).expect("cancelled resume");

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.error_class, Some(ErrorClass::Cancelled));
    assert_eq!(result.final_state, Some(RebuildState::Aborted));
    assert_eq!(production_id(&path), None);
    let staging = paused.snapshot_id.expect("staged snapshot");
    let entry = coord
        .catalog()
        .entry(&staging)
        .expect("entry")
        .expect("staging recorded");
    assert_eq!(entry.role, SnapshotRole::Discarded);
}

#[test]
fn cancel_does_not_interrupt_a_run_already_swapping() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("racing.sqlite");
    seed_store(&path);
    let paused = pause_after(&path, RebuildPhase::Validate);
    let staged = paused.snapshot_id.clone().expect("staged snapshot");
    set_journal_column(&path, &paused.run_id, "state", "swapping");

    let mut coord = coordinator(&path, config(&path));
    coord.cancel_flag().cancel();
    let result = coord.resume(&paused.run_id).expect("resumed swap");

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.final_state, Some(RebuildState::Committed));
    assert_eq!(production_id(&path), Some(staged));
}

#[test]
fn cancelled_run_aborts_without_touching_production() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("racing.sqlite");
    seed_store(&path);
    let baseline = coordinator(&path, config(&path))
        .run_full_rebuild()
        .expect("baseline run")
        .snapshot_id;

    let mut coord = coordinator(&path, config(&path));
    coord.cancel_flag().cancel();
    let result = coord.run_full_rebuild().expect("cancelled run");

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.error_class, Some(ErrorClass::Cancelled));
    assert_eq!(result.final_state, Some(RebuildState::Aborted));
    assert_eq!(result.snapshot_id, None);
    assert_eq!(production_id(&path), baseline);
}

#[test]
fn rollback_and_purge_after_two_builds() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("racing.sqlite");
    seed_store(&path);
    let mut coord = coordinator(&path, config(&path));
    let first = coord.run_full_rebuild().expect("first").snapshot_id.expect("first id");
    let second = coord.run_full_rebuild().expect("second").snapshot_id.expect("second id");

    let outcome = coord.catalog_mut().rollback_to_retained().expect("rollback");
    assert_eq!(outcome.promoted, first);
    assert_eq!(outcome.superseded, Some(second.clone()));
    assert_eq!(production_id(&path), Some(first));

    let purged = coord.catalog_mut().purge().expect("purge");
    assert_eq!(purged, vec![second.clone()]);
    let entry = coord
        .catalog()
        .entry(&second)
        .expect("entry")
        .expect("still catalogued");
    assert_eq!(entry.role, SnapshotRole::Purged);
    assert!(matches!(
        coord.catalog_mut().rollback_to_retained(),
        Err(CatalogError::NothingRetained)
    ));
}
