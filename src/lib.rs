//! Point-in-time feature rebuild for historical race participations.
//!
//! Implemented scope:
//! - track taxonomy, class tiers and sectional checkpoint reconciliation
//! - leakage-free rolling aggregates over partitioned timelines
//! - sequential rating engine
//! - feature composition and the fixed-width snapshot schema
//! - shadow build, validation and atomic swap of the served snapshot
//! - latest-state form rollups

mod aggregator;
mod catalog;
mod class_tier;
mod composer;
mod config;
mod coordinator;
mod field;
mod journal;
mod observability;
mod participation;
mod pipeline;
mod rating;
mod reference;
mod rollups;
mod rolling;
mod schema;
mod sectionals;
mod state;
mod store;
mod taxonomy;
mod timeline;

pub use aggregator::{
    aggregate, AggregateError, AggregateRecord, FieldComparison, PartitionKind, PartitionStats,
};
pub use catalog::{
    compare_snapshots, CatalogEntry, CatalogError, ExchangeOutcome, RoleAssignment,
    SnapshotCatalog, SnapshotComparison, SnapshotId, SnapshotRole, SqliteCatalog,
};
pub use class_tier::{
    default_class_rules, is_handicap, is_maiden, CategoryFallback, ClassAssignment, ClassRule,
    ClassTierRules, RaceGrade,
};
pub use composer::{
    compose, composite_form_score, form_momentum, form_recency_score, ComposedFeatures,
    LONGSHOT_ODDS, MATURITY_RUNS,
};
pub use config::{
    rebuild_config_from_env, AggregatorConfig, ConfigError, RebuildConfig, ValidationThresholds,
};
pub use coordinator::{
    evaluate_validation, ColumnPopulation, CoordinatorError, ErrorClass, RebuildCoordinator,
    RunKind, RunResult, RunStatus, ValidationFailure, ValidationReport,
};
pub use field::{field_max, field_mean, ordinal_ranks, percent_ranks, RankOrder};
pub use journal::{
    JournalError, PhaseStatus, ProgressRecord, RebuildJournal, RunInputs, RunRecord,
    TransitionRecord,
};
pub use observability::{
    init_logging, log_app_start, log_run_finish, log_run_start, logging_config_from_env,
    LogFormat, LoggingConfig, LoggingInitError,
};
pub use participation::{RaceParticipation, SectionalReading, SourceData};
pub use pipeline::{
    assemble_rows, build_aggregate_stage, build_base_stage, build_composed_stage,
    build_feature_table, build_rating_stage, is_finishing_position, BaseRecord, BaseStage,
    CancelFlag, ExclusionCounts, FeatureTable, PipelineError, NON_FINISHER_POSITION,
};
pub use rating::{
    rate_participations, OutcomeFactors, QualityMultipliers, RatingEntry, RatingError,
    RatingParams, RatingRecord,
};
pub use reference::{
    load_reference_tables, resolve_reference, CompiledReference, ReferenceError, ReferenceTables,
};
pub use rollups::{
    refresh_rollups, ConnectionForm, EntityForm, EntityKind, RollupError, RollupStore,
};
pub use rolling::{
    PrefixStats, RunOutcome, RunningStyle, SectionalSummary, WindowStats, CLASS_WINDOW,
    PLACE_CUTOFF, SECTIONAL_WINDOW,
};
pub use schema::{
    assert_schema_compatible, build_feature_schema, snapshot_digest, FeatureColumn, FeatureDType,
    FeatureLayout, FeatureRecord, FeatureRow, FeatureSchema, FeatureValue, SchemaError,
    FEATURE_SCHEMA_VERSION,
};
pub use sectionals::{
    default_gate_grids, normalize_competitor_name, reconcile_sectionals, CanonicalSectionals,
    CheckpointChoice, GateConvention, GateGrid, MatchKind, SectionalCheckpointMap,
    SectionalCoverage, SectionalError, SectionalTarget,
};
pub use state::{RebuildPhase, RebuildState};
pub use store::{open_connection, ParticipationSource, SourceCounts, SqliteSource, StoreError};
pub use taxonomy::{
    barrier_group, condition_group, distance_bucket, normalize_track_name, parse_rail,
    BarrierGroup, ConditionGroup, DistanceBucket, Direction, RailPosition, Surface,
    TaxonomyResolver, TrackOverride, TrackProfile, VenueCategory, HOME_REGION,
};
pub use timeline::{build_timelines, verify_sorted, EntityTimeline, OrderViolation, SortKey};
