//! Shadow build and atomic swap.
//!
//! A run walks [`RebuildPhase::ALL`] in order. Pure phases checkpoint their
//! output to the journal so an interrupted run resumes at the first
//! incomplete phase. Everything is written to a staging snapshot; production
//! only changes at the single catalog exchange in the swap phase.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::aggregator::{AggregateError, AggregateRecord};
use crate::catalog::{CatalogError, RoleAssignment, SnapshotCatalog, SnapshotId, SnapshotRole};
use crate::composer::ComposedFeatures;
use crate::config::{ConfigError, RebuildConfig, ValidationThresholds};
use crate::journal::{JournalError, RebuildJournal, RunInputs};
use crate::observability::{log_run_finish, log_run_start};
use crate::participation::SourceData;
use crate::pipeline::{
    assemble_rows, build_aggregate_stage, build_base_stage, build_composed_stage,
    build_rating_stage, BaseStage, CancelFlag, PipelineError,
};
use crate::rating::RatingRecord;
use crate::reference::CompiledReference;
use crate::schema::{snapshot_digest, FeatureLayout};
use crate::sectionals::SectionalCoverage;
use crate::state::{RebuildPhase, RebuildState};
use crate::store::ParticipationSource;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("run {0} is not in the journal")]
    UnknownRun(String),
    #[error("run {run_id} already finished in state {}", .state.as_str())]
    NotResumable { run_id: String, state: RebuildState },
    #[error("run {run_id} was started with different {what}; start a new run instead")]
    InputsChanged { run_id: String, what: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    FullRebuild,
    RefreshRollups,
}

impl RunKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FullRebuild => "full_rebuild",
            Self::RefreshRollups => "refresh_rollups",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "full_rebuild" => Some(Self::FullRebuild),
            "refresh_rollups" => Some(Self::RefreshRollups),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    /// Stopped after a configured phase; `resume` continues it.
    Paused,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Paused => "paused",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "paused" => Some(Self::Paused),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    BuildFailed,
    ValidationFailed,
    /// The swap phase failed before any exchange was attempted.
    SwapFailed,
    /// The exchange failed and the previous production is confirmed back.
    SwapRolledBack,
    /// The exchange failed and the catalog could not be confirmed.
    SwapUnknownState,
    Cancelled,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BuildFailed => "build_failed",
            Self::ValidationFailed => "validation_failed",
            Self::SwapFailed => "swap_failed",
            Self::SwapRolledBack => "swap_rolled_back",
            Self::SwapUnknownState => "swap_unknown_state",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "build_failed" => Some(Self::BuildFailed),
            "validation_failed" => Some(Self::ValidationFailed),
            "swap_failed" => Some(Self::SwapFailed),
            "swap_rolled_back" => Some(Self::SwapRolledBack),
            "swap_unknown_state" => Some(Self::SwapUnknownState),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    fn terminal_state(self) -> RebuildState {
        match self {
            Self::BuildFailed | Self::ValidationFailed | Self::SwapFailed | Self::Cancelled => {
                RebuildState::Aborted
            }
            Self::SwapRolledBack => RebuildState::RolledBack,
            Self::SwapUnknownState => RebuildState::UnknownState,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub kind: RunKind,
    pub status: RunStatus,
    pub final_state: Option<RebuildState>,
    pub record_count: u64,
    pub duration_ms: u64,
    pub error_class: Option<ErrorClass>,
    pub error_message: Option<String>,
    pub snapshot_id: Option<SnapshotId>,
    pub coverage: Option<SectionalCoverage>,
    pub validation: Option<ValidationReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnPopulation {
    pub column: String,
    /// `None` when the snapshot has no such column.
    pub non_null: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationFailure {
    RowCountBelowFloor { actual: u64, min: u64 },
    MissingColumn { column: String },
    PopulationBelowFloor { column: String, fraction: f64, min: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub row_count: u64,
    pub failures: Vec<ValidationFailure>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    fn summary(&self) -> String {
        self.failures
            .iter()
            .map(|f| match f {
                ValidationFailure::RowCountBelowFloor { actual, min } => {
                    format!("row count {actual} below floor {min}")
                }
                ValidationFailure::MissingColumn { column } => {
                    format!("required column {column} missing")
                }
                ValidationFailure::PopulationBelowFloor {
                    column,
                    fraction,
                    min,
                } => format!("column {column} populated {fraction:.4} below floor {min:.4}"),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

pub fn evaluate_validation(
    thresholds: &ValidationThresholds,
    row_count: u64,
    populations: &[ColumnPopulation],
) -> ValidationReport {
    let mut failures = Vec::new();
    if row_count < thresholds.min_rows {
        failures.push(ValidationFailure::RowCountBelowFloor {
            actual: row_count,
            min: thresholds.min_rows,
        });
    }
    for population in populations {
        match population.non_null {
            None => failures.push(ValidationFailure::MissingColumn {
                column: population.column.clone(),
            }),
            Some(non_null) => {
                let fraction = if row_count == 0 {
                    0.0
                } else {
                    non_null as f64 / row_count as f64
                };
                if fraction < thresholds.min_population {
                    failures.push(ValidationFailure::PopulationBelowFloor {
                        column: population.column.clone(),
                        fraction,
                        min: thresholds.min_population,
                    });
                }
            }
        }
    }
    ValidationReport {
        row_count,
        failures,
    }
}

enum PhaseError {
    Failed { class: ErrorClass, message: String },
    Journal(JournalError),
}

impl From<JournalError> for PhaseError {
    fn from(value: JournalError) -> Self {
        Self::Journal(value)
    }
}

fn failed(class: ErrorClass, message: impl ToString) -> PhaseError {
    PhaseError::Failed {
        class,
        message: message.to_string(),
    }
}

fn missing(input: &str) -> PhaseError {
    failed(ErrorClass::BuildFailed, format!("{input} output is not available"))
}

fn pipeline_failure(err: PipelineError) -> PhaseError {
    match err {
        PipelineError::Aggregate(AggregateError::Cancelled) => {
            failed(ErrorClass::Cancelled, "cancelled during aggregation")
        }
        other => failed(ErrorClass::BuildFailed, other),
    }
}

/// In-memory stage outputs of one run.
struct RunContext {
    run_id: String,
    kind: RunKind,
    state: RebuildState,
    staging: Option<SnapshotId>,
    started: Instant,
    source: Option<SourceData>,
    base: Option<BaseStage>,
    aggregates: Option<Vec<AggregateRecord>>,
    ratings: Option<Vec<RatingRecord>>,
    composed: Option<Vec<ComposedFeatures>>,
    record_count: u64,
    validation: Option<ValidationReport>,
}

impl RunContext {
    fn new(run_id: String, kind: RunKind, state: RebuildState) -> Self {
        Self {
            run_id,
            kind,
            state,
            staging: None,
            started: Instant::now(),
            source: None,
            base: None,
            aggregates: None,
            ratings: None,
            composed: None,
            record_count: 0,
            validation: None,
        }
    }

    fn result(&self, status: RunStatus, error: Option<(ErrorClass, String)>) -> RunResult {
        let (error_class, error_message) = match error {
            Some((class, message)) => (Some(class), Some(message)),
            None => (None, None),
        };
        RunResult {
            run_id: self.run_id.clone(),
            kind: self.kind,
            status,
            final_state: Some(self.state),
            record_count: self.record_count,
            duration_ms: self.started.elapsed().as_millis() as u64,
            error_class,
            error_message,
            snapshot_id: self.staging.clone(),
            coverage: self.base.as_ref().map(|b| b.coverage),
            validation: self.validation.clone(),
        }
    }
}

pub struct RebuildCoordinator<S, C> {
    source: S,
    catalog: C,
    journal: RebuildJournal,
    reference: CompiledReference,
    config: RebuildConfig,
    layout: FeatureLayout,
    cancel: CancelFlag,
}

impl<S: ParticipationSource, C: SnapshotCatalog> RebuildCoordinator<S, C> {
    pub fn new(
        source: S,
        catalog: C,
        journal: RebuildJournal,
        reference: CompiledReference,
        config: RebuildConfig,
    ) -> Result<Self, CoordinatorError> {
        config.validate()?;
        let layout = FeatureLayout::new(&config.aggregator);
        Ok(Self {
            source,
            catalog,
            journal,
            reference,
            config,
            layout,
            cancel: CancelFlag::default(),
        })
    }

    /// Setting the returned flag stops the run at the next phase boundary
    /// (or inside aggregation) and discards staging.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    pub fn catalog_mut(&mut self) -> &mut C {
        &mut self.catalog
    }

    pub fn journal(&self) -> &RebuildJournal {
        &self.journal
    }

    fn inputs(&self) -> Result<RunInputs, ConfigError> {
        Ok(RunInputs {
            config_fingerprint: self.config.fingerprint()?,
            reference_fingerprint: self.reference.fingerprint.clone(),
            schema_fingerprint: self.layout.schema().fingerprint.clone(),
        })
    }

    pub fn run_full_rebuild(&mut self) -> Result<RunResult, CoordinatorError> {
        let run_id = Uuid::new_v4().to_string();
        let inputs = self.inputs()?;
        self.journal.start_run(&run_id, RunKind::FullRebuild, &inputs)?;
        log_run_start(RunKind::FullRebuild, &run_id, false);

        let mut ctx = RunContext::new(run_id, RunKind::FullRebuild, RebuildState::Building);
        self.execute(&mut ctx, RebuildPhase::Extract)
    }

    /// Continues a paused or interrupted run from its first incomplete phase.
    pub fn resume(&mut self, run_id: &str) -> Result<RunResult, CoordinatorError> {
        let record = self
            .journal
            .run(run_id)?
            .ok_or_else(|| CoordinatorError::UnknownRun(run_id.to_string()))?;
        if record.state.is_terminal() {
            return Err(CoordinatorError::NotResumable {
                run_id: run_id.to_string(),
                state: record.state,
            });
        }
        let inputs = self.inputs()?;
        if record.inputs.config_fingerprint != inputs.config_fingerprint {
            return Err(CoordinatorError::InputsChanged {
                run_id: run_id.to_string(),
                what: "configuration",
            });
        }
        if record.inputs.reference_fingerprint != inputs.reference_fingerprint {
            return Err(CoordinatorError::InputsChanged {
                run_id: run_id.to_string(),
                what: "reference tables",
            });
        }
        if record.inputs.schema_fingerprint != inputs.schema_fingerprint {
            return Err(CoordinatorError::InputsChanged {
                run_id: run_id.to_string(),
                what: "schema",
            });
        }
        log_run_start(record.kind, run_id, true);

        let mut ctx = RunContext::new(run_id.to_string(), record.kind, record.state);
        ctx.staging = record.staging_id;
        let start = self.restore_checkpoints(&mut ctx)?;
        self.execute(&mut ctx, start)
    }

    /// Loads the outputs the remaining phases need and returns the phase to
    /// start from. A missing checkpoint moves the start back to that phase.
    fn restore_checkpoints(&mut self, ctx: &mut RunContext) -> Result<RebuildPhase, CoordinatorError> {
        let completed = self.journal.completed_phases(&ctx.run_id)?;
        let Some(first_incomplete) = RebuildPhase::ALL
            .into_iter()
            .find(|phase| !completed.contains(phase))
        else {
            return Ok(RebuildPhase::Swap);
        };
        if first_incomplete > RebuildPhase::Stage {
            return Ok(first_incomplete);
        }

        for phase in RebuildPhase::ALL
            .into_iter()
            .filter(|p| *p < first_incomplete && p.is_checkpointed())
        {
            let loaded = match phase {
                RebuildPhase::Extract => self
                    .journal
                    .load_checkpoint(&ctx.run_id, phase)?
                    .map(|v| ctx.source = Some(v)),
                RebuildPhase::Base => self
                    .journal
                    .load_checkpoint(&ctx.run_id, phase)?
                    .map(|v| ctx.base = Some(v)),
                RebuildPhase::Aggregate => self
                    .journal
                    .load_checkpoint(&ctx.run_id, phase)?
                    .map(|v| ctx.aggregates = Some(v)),
                RebuildPhase::Rating => self
                    .journal
                    .load_checkpoint(&ctx.run_id, phase)?
                    .map(|v| ctx.ratings = Some(v)),
                RebuildPhase::Compose => self
                    .journal
                    .load_checkpoint(&ctx.run_id, phase)?
                    .map(|v| ctx.composed = Some(v)),
                _ => Some(()),
            };
            if loaded.is_none() {
                return Ok(phase);
            }
        }
        Ok(first_incomplete)
    }

    fn execute(
        &mut self,
        ctx: &mut RunContext,
        start: RebuildPhase,
    ) -> Result<RunResult, CoordinatorError> {
        for phase in RebuildPhase::ALL.into_iter().filter(|p| *p >= start) {
            // Once swapping, the run has to reach a committed or recovered
            // catalog; a cancel no longer applies.
            if self.cancel.is_cancelled() && ctx.state != RebuildState::Swapping {
                return self.abort(ctx, phase, ErrorClass::Cancelled, "cancelled".to_string());
            }
            match phase {
                RebuildPhase::Validate => self.enter_state(ctx, RebuildState::Validating)?,
                RebuildPhase::Swap => self.enter_state(ctx, RebuildState::Swapping)?,
                _ => {}
            }

            self.journal.phase_started(&ctx.run_id, phase)?;
            info!(
                component = "coordinator",
                event = "rebuild.phase.start",
                run_id = %ctx.run_id,
                phase = phase.name(),
                phase_number = phase.number(),
                total_phases = RebuildPhase::total()
            );
            let phase_started = Instant::now();

            let records = match self.run_phase(phase, ctx) {
                Ok(records) => records,
                Err(PhaseError::Journal(err)) => return Err(err.into()),
                Err(PhaseError::Failed { class, message }) => {
                    return self.abort(ctx, phase, class, message);
                }
            };

            if self.config.checkpoint_phases && phase.is_checkpointed() {
                self.save_checkpoint(ctx, phase)?;
            }
            self.journal.phase_completed(&ctx.run_id, phase, records)?;
            info!(
                component = "coordinator",
                event = "rebuild.phase.finish",
                run_id = %ctx.run_id,
                phase = phase.name(),
                phase_number = phase.number(),
                records,
                duration_ms = phase_started.elapsed().as_millis() as u64
            );

            if self.config.stop_after == Some(phase) && phase != RebuildPhase::Swap {
                let result = ctx.result(RunStatus::Paused, None);
                log_run_finish(&result);
                return Ok(result);
            }
        }

        self.enter_state(ctx, RebuildState::Committed)?;
        self.journal.clear_checkpoints(&ctx.run_id)?;
        let result = ctx.result(RunStatus::Succeeded, None);
        self.journal.finish_run(&result)?;
        log_run_finish(&result);
        Ok(result)
    }

    fn enter_state(&mut self, ctx: &mut RunContext, next: RebuildState) -> Result<(), JournalError> {
        if ctx.state == next {
            return Ok(());
        }
        self.journal.transition(&ctx.run_id, next, None)?;
        info!(
            component = "coordinator",
            event = "rebuild.state",
            run_id = %ctx.run_id,
            from = ctx.state.as_str(),
            to = next.as_str()
        );
        ctx.state = next;
        Ok(())
    }

    fn save_checkpoint(&mut self, ctx: &RunContext, phase: RebuildPhase) -> Result<(), JournalError> {
        let run_id = &ctx.run_id;
        match phase {
            RebuildPhase::Extract => match &ctx.source {
                Some(v) => self.journal.save_checkpoint(run_id, phase, v),
                None => Ok(()),
            },
            RebuildPhase::Base => match &ctx.base {
                Some(v) => self.journal.save_checkpoint(run_id, phase, v),
                None => Ok(()),
            },
            RebuildPhase::Aggregate => match &ctx.aggregates {
                Some(v) => self.journal.save_checkpoint(run_id, phase, v),
                None => Ok(()),
            },
            RebuildPhase::Rating => match &ctx.ratings {
                Some(v) => self.journal.save_checkpoint(run_id, phase, v),
                None => Ok(()),
            },
            RebuildPhase::Compose => match &ctx.composed {
                Some(v) => self.journal.save_checkpoint(run_id, phase, v),
                None => Ok(()),
            },
            _ => Ok(()),
        }
    }

    fn run_phase(&mut self, phase: RebuildPhase, ctx: &mut RunContext) -> Result<u64, PhaseError> {
        match phase {
            RebuildPhase::Extract => {
                let source = self
                    .source
                    .load()
                    .map_err(|err| failed(ErrorClass::BuildFailed, err))?;
                let n = source.participations.len() as u64;
                ctx.source = Some(source);
                Ok(n)
            }
            RebuildPhase::Base => {
                let source = ctx.source.as_ref().ok_or_else(|| missing("extract"))?;
                let base = build_base_stage(source, &self.reference);
                let n = base.records.len() as u64;
                ctx.base = Some(base);
                Ok(n)
            }
            RebuildPhase::Aggregate => {
                let base = ctx.base.as_ref().ok_or_else(|| missing("base"))?;
                let aggregates = build_aggregate_stage(base, &self.config.aggregator, &self.cancel)
                    .map_err(pipeline_failure)?;
                let n = aggregates.len() as u64;
                ctx.aggregates = Some(aggregates);
                Ok(n)
            }
            RebuildPhase::Rating => {
                let base = ctx.base.as_ref().ok_or_else(|| missing("base"))?;
                let ratings =
                    build_rating_stage(base, &self.config.rating).map_err(pipeline_failure)?;
                let n = ratings.len() as u64;
                ctx.ratings = Some(ratings);
                Ok(n)
            }
            RebuildPhase::Compose => {
                let base = ctx.base.as_ref().ok_or_else(|| missing("base"))?;
                let aggregates = ctx.aggregates.as_ref().ok_or_else(|| missing("aggregate"))?;
                let ratings = ctx.ratings.as_ref().ok_or_else(|| missing("rating"))?;
                let composed =
                    build_composed_stage(base, aggregates, ratings, &self.config.aggregator)
                        .map_err(pipeline_failure)?;
                let n = composed.len() as u64;
                ctx.composed = Some(composed);
                Ok(n)
            }
            RebuildPhase::Stage => self.stage(ctx),
            RebuildPhase::Validate => self.validate(ctx),
            RebuildPhase::Swap => self.swap(ctx),
        }
    }

    fn stage(&mut self, ctx: &mut RunContext) -> Result<u64, PhaseError> {
        let base = ctx.base.as_ref().ok_or_else(|| missing("base"))?;
        let aggregates = ctx.aggregates.as_ref().ok_or_else(|| missing("aggregate"))?;
        let ratings = ctx.ratings.as_ref().ok_or_else(|| missing("rating"))?;
        let composed = ctx.composed.as_ref().ok_or_else(|| missing("compose"))?;
        let build = |err: CatalogError| failed(ErrorClass::BuildFailed, err);

        // A staging table left by an interrupted attempt is partial.
        if let Some(previous) = ctx.staging.take() {
            let entry = self.catalog.entry(&previous).map_err(build)?;
            if entry.is_some_and(|e| e.role == SnapshotRole::Staging) {
                self.catalog.discard(&previous).map_err(build)?;
            }
        }

        let rows = assemble_rows(&self.layout, base, aggregates, ratings, composed)
            .map_err(pipeline_failure)?;
        let schema = self.layout.schema();
        let staging = self
            .catalog
            .create_staging(&ctx.run_id, schema)
            .map_err(build)?;
        ctx.staging = Some(staging.clone());
        self.journal.set_staging(&ctx.run_id, &staging)?;

        for chunk in rows.chunks(self.config.insert_batch_size.max(1)) {
            if self.cancel.is_cancelled() {
                return Err(failed(ErrorClass::Cancelled, "cancelled while staging"));
            }
            self.catalog
                .append_rows(&staging, schema, chunk)
                .map_err(build)?;
        }

        let digest = snapshot_digest(schema, &rows);
        self.catalog
            .record_digest(&staging, &digest, rows.len() as u64)
            .map_err(build)?;
        info!(
            component = "coordinator",
            event = "rebuild.staged",
            run_id = %ctx.run_id,
            snapshot_id = %staging,
            rows = rows.len(),
            digest = %digest
        );
        ctx.record_count = rows.len() as u64;
        Ok(rows.len() as u64)
    }

    fn validate(&mut self, ctx: &mut RunContext) -> Result<u64, PhaseError> {
        let staging = ctx.staging.clone().ok_or_else(|| missing("stage"))?;
        let invalid = |err: CatalogError| failed(ErrorClass::ValidationFailed, err);

        let row_count = self.catalog.row_count(&staging).map_err(invalid)?;
        let columns = self.catalog.column_names(&staging).map_err(invalid)?;
        let mut populations = Vec::new();
        for column in &self.config.validation.required_columns {
            let non_null = if columns.contains(column) {
                Some(
                    self.catalog
                        .non_null_count(&staging, column)
                        .map_err(invalid)?,
                )
            } else {
                None
            };
            populations.push(ColumnPopulation {
                column: column.clone(),
                non_null,
            });
        }

        let report = evaluate_validation(&self.config.validation, row_count, &populations);
        ctx.record_count = row_count;
        let passed = report.passed();
        let summary = report.summary();
        ctx.validation = Some(report);
        info!(
            component = "coordinator",
            event = "rebuild.validation",
            run_id = %ctx.run_id,
            row_count,
            passed
        );
        if passed {
            Ok(row_count)
        } else {
            Err(failed(ErrorClass::ValidationFailed, summary))
        }
    }

    fn swap(&mut self, ctx: &mut RunContext) -> Result<u64, PhaseError> {
        let staging = ctx
            .staging
            .clone()
            .ok_or_else(|| failed(ErrorClass::SwapFailed, "no staging snapshot to promote"))?;

        // Resumed after the exchange already landed.
        if let Ok(Some(production)) = self.catalog.production() {
            if production.id == staging {
                ctx.record_count = production.row_count;
                return Ok(production.row_count);
            }
        }

        let before = self
            .catalog
            .roles()
            .map_err(|err| failed(ErrorClass::SwapFailed, err))?;
        let error = match self.catalog.exchange(&staging) {
            Ok(_) => match self.catalog.production() {
                Ok(Some(production)) if production.id == staging => {
                    ctx.record_count = production.row_count;
                    return Ok(production.row_count);
                }
                Ok(other) => format!(
                    "production after exchange is {:?}, expected {staging}",
                    other.map(|e| e.id.to_string())
                ),
                Err(err) => err.to_string(),
            },
            Err(err) => err.to_string(),
        };
        Err(self.recover_swap(&before, &staging, error))
    }

    fn recover_swap(
        &mut self,
        before: &RoleAssignment,
        staging: &SnapshotId,
        error: String,
    ) -> PhaseError {
        warn!(
            component = "coordinator",
            event = "catalog.exchange.failed",
            snapshot_id = %staging,
            error = %error
        );
        if matches!(self.catalog.roles(), Ok(ref now) if now == before) {
            return failed(
                ErrorClass::SwapRolledBack,
                format!("exchange failed, production unchanged: {error}"),
            );
        }

        let restored = self
            .catalog
            .restore_roles(before, staging)
            .and_then(|()| self.catalog.roles());
        match restored {
            Ok(now) if &now == before => failed(
                ErrorClass::SwapRolledBack,
                format!("exchange failed and was reverted: {error}"),
            ),
            Ok(now) => failed(
                ErrorClass::SwapUnknownState,
                format!("exchange failed; catalog now {now:?}, expected {before:?}: {error}"),
            ),
            Err(restore_err) => failed(
                ErrorClass::SwapUnknownState,
                format!("exchange failed: {error}; restore failed: {restore_err}"),
            ),
        }
    }

    fn abort(
        &mut self,
        ctx: &mut RunContext,
        phase: RebuildPhase,
        class: ErrorClass,
        message: String,
    ) -> Result<RunResult, CoordinatorError> {
        self.journal.phase_failed(&ctx.run_id, phase, &message)?;

        if class != ErrorClass::SwapUnknownState {
            if let Some(staging) = &ctx.staging {
                let still_staging = self
                    .catalog
                    .entry(staging)
                    .ok()
                    .flatten()
                    .is_some_and(|e| e.role == SnapshotRole::Staging);
                if still_staging {
                    if let Err(err) = self.catalog.discard(staging) {
                        warn!(
                            component = "coordinator",
                            event = "catalog.staging.discard_failed",
                            snapshot_id = %staging,
                            error = %err
                        );
                    }
                }
            }
        }

        self.enter_state(ctx, class.terminal_state())?;
        self.journal.clear_checkpoints(&ctx.run_id)?;
        let result = ctx.result(RunStatus::Failed, Some((class, message)));
        self.journal.finish_run(&result)?;
        log_run_finish(&result);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> ValidationThresholds {
        ValidationThresholds {
            min_rows: 100_000,
            min_population: 0.95,
            required_columns: vec!["race_id".to_string(), "rating_before".to_string()],
        }
    }

    fn populated(column: &str, non_null: u64) -> ColumnPopulation {
        ColumnPopulation {
            column: column.to_string(),
            non_null: Some(non_null),
        }
    }

    #[test]
    fn row_floor_rejects_a_short_snapshot() {
        let report = evaluate_validation(
            &thresholds(),
            99_000,
            &[populated("race_id", 99_000), populated("rating_before", 99_000)],
        );
        assert!(!report.passed());
        assert_eq!(
            report.failures,
            vec![ValidationFailure::RowCountBelowFloor {
                actual: 99_000,
                min: 100_000,
            }]
        );
    }

    #[test]
    fn population_floor_and_missing_columns() {
        let report = evaluate_validation(
            &thresholds(),
            100_000,
            &[
                populated("race_id", 100_000),
                populated("rating_before", 94_999),
                ColumnPopulation {
                    column: "gone".to_string(),
                    non_null: None,
                },
            ],
        );
        assert_eq!(report.failures.len(), 2);
        assert!(matches!(
            &report.failures[0],
            ValidationFailure::PopulationBelowFloor { column, .. } if column == "rating_before"
        ));
        assert!(matches!(
            &report.failures[1],
            ValidationFailure::MissingColumn { column } if column == "gone"
        ));
    }

    #[test]
    fn exact_floors_pass() {
        let report = evaluate_validation(
            &thresholds(),
            100_000,
            &[populated("race_id", 100_000), populated("rating_before", 95_000)],
        );
        assert!(report.passed());
    }

    #[test]
    fn labels_round_trip() {
        for class in [
            ErrorClass::BuildFailed,
            ErrorClass::ValidationFailed,
            ErrorClass::SwapFailed,
            ErrorClass::SwapRolledBack,
            ErrorClass::SwapUnknownState,
            ErrorClass::Cancelled,
        ] {
            assert_eq!(ErrorClass::parse(class.as_str()), Some(class));
        }
        for status in [RunStatus::Succeeded, RunStatus::Failed, RunStatus::Paused] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ErrorClass::SwapRolledBack.terminal_state(), RebuildState::RolledBack);
        assert_eq!(ErrorClass::Cancelled.terminal_state(), RebuildState::Aborted);
        assert_eq!(ErrorClass::SwapFailed.terminal_state(), RebuildState::Aborted);
    }
}
