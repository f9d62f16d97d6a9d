use std::io;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use racealpha::{
    build_base_stage, log_app_start, CompiledReference, LogFormat, LoggingConfig,
    RaceParticipation, RebuildConfig, RebuildCoordinator, RebuildJournal, SectionalReading,
    SourceData, SqliteCatalog, SqliteSource,
};
use tempfile::tempdir;
use tracing::dispatcher::with_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs(max_level: Level, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(max_level)
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer.output_string()
}

fn runner(race_id: &str, day: u32, slot: u32, position: u32) -> RaceParticipation {
    RaceParticipation {
        race_id: race_id.to_string(),
        race_date: NaiveDate::from_ymd_opt(2024, 6, day).expect("valid date"),
        race_number: 3,
        track_name: "Randwick".to_string(),
        locale_hint: None,
        distance_m: 1200,
        class_text: "Maiden".to_string(),
        track_condition: Some("Good 3".to_string()),
        rail_text: Some("Out 3m".to_string()),
        horse_id: format!("h{slot}"),
        horse_name: format!("Runner {slot}"),
        horse_number: Some(slot),
        jockey_id: Some(format!("j{slot}")),
        trainer_id: Some("t1".to_string()),
        barrier: Some(slot),
        weight_carried: Some(57.0),
        win_odds: Some(f64::from(slot) * 2.0),
        finish_position: Some(position),
        margin: None,
    }
}

fn seed(path: &Path) {
    let rows: Vec<RaceParticipation> = (1..=3)
        .flat_map(|day| {
            (1..=6).map(move |slot| runner(&format!("r{day}"), day, slot, (slot + day) % 6 + 1))
        })
        .collect();
    SqliteSource::open(path)
        .expect("open source")
        .write_participations(&rows)
        .expect("seed rows");
}

fn coordinator(path: &Path, min_rows: u64) -> RebuildCoordinator<SqliteSource, SqliteCatalog> {
    let mut config = RebuildConfig::default();
    config.store_path = path.to_path_buf();
    config.validation.min_rows = min_rows;
    RebuildCoordinator::new(
        SqliteSource::open(path).expect("open source"),
        SqliteCatalog::open(path).expect("open catalog"),
        RebuildJournal::open(path).expect("open journal"),
        CompiledReference::builtin().expect("builtin reference"),
        config,
    )
    .expect("coordinator")
}

#[test]
fn app_start_logs_binary_and_format() {
    let config = LoggingConfig {
        level: "debug".to_string(),
        format: LogFormat::Json,
        include_target: false,
    };
    let logs = capture_logs(Level::INFO, || log_app_start("rebuild", &config));

    assert!(logs.contains("\"event\":\"app.start\""));
    assert!(logs.contains("\"binary\":\"rebuild\""));
    assert!(logs.contains("\"log_level\":\"debug\""));
}

#[test]
fn committed_rebuild_logs_phases_and_exchange() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("racing.sqlite");
    seed(&path);

    let logs = capture_logs(Level::INFO, || {
        let result = coordinator(&path, 1)
            .run_full_rebuild()
            .expect("rebuild run");
        assert_eq!(result.record_count, 18);
    });

    assert!(logs.contains("\"event\":\"run.start\""));
    assert!(logs.contains("\"event\":\"source.loaded\""));
    assert!(logs.contains("\"event\":\"rebuild.phase.start\""));
    assert!(logs.contains("\"event\":\"rebuild.phase.finish\""));
    assert!(logs.contains("\"event\":\"rebuild.staged\""));
    assert!(logs.contains("\"event\":\"catalog.exchange.commit\""));
    assert!(logs.contains("\"event\":\"run.finish\""));
    assert!(logs.contains("\"status\":\"succeeded\""));
}

#[test]
fn failed_validation_logs_error_class() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("racing.sqlite");
    seed(&path);

    let logs = capture_logs(Level::INFO, || {
        coordinator(&path, 100_000)
            .run_full_rebuild()
            .expect("rebuild run");
    });

    assert!(logs.contains("\"event\":\"rebuild.validation\""));
    assert!(logs.contains("\"passed\":false"));
    assert!(logs.contains("\"event\":\"catalog.staging.discarded\""));
    assert!(logs.contains("\"error_class\":\"validation_failed\""));
    assert!(!logs.contains("\"event\":\"catalog.exchange.commit\""));
}

#[test]
fn base_stage_logs_sectional_coverage() {
    let source = SourceData::new(
        vec![runner("r1", 1, 1, 1), runner("r1", 1, 2, 2)],
        vec![SectionalReading {
            race_id: "r1".to_string(),
            competitor_name: "runner 1".to_string(),
            competitor_number: None,
            gate_m: 400,
            position: 1,
        }],
    );
    let reference = CompiledReference::builtin().expect("builtin reference");

    let logs = capture_logs(Level::INFO, || {
        let base = build_base_stage(&source, &reference);
        assert_eq!(base.coverage.matched_by_name, 1);
    });

    assert!(logs.contains("\"event\":\"pipeline.base.built\""));
    assert!(logs.contains("\"event\":\"sectionals.coverage\""));
    assert!(logs.contains("\"matched_by_name\":1"));
}
