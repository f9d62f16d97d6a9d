use std::process::ExitCode;

use racealpha::{
    compare_snapshots, init_logging, log_app_start, logging_config_from_env,
    rebuild_config_from_env, refresh_rollups, resolve_reference, RebuildConfig,
    RebuildCoordinator, RebuildJournal, RollupStore, RunResult, RunStatus, SnapshotCatalog,
    SnapshotId, SqliteCatalog, SqliteSource,
};
use serde::Serialize;
use serde_json::json;

const USAGE: &str = "usage: rebuild <full | resume RUN_ID | refresh-rollups | status [RUN_ID] | rollback | purge | compare LEFT RIGHT>";

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let logging = logging_config_from_env();
    init_logging(&logging)?;
    log_app_start("rebuild", &logging);

    let config = rebuild_config_from_env();
    config.validate()?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("full");

    match command {
        "full" => {
            let mut coordinator = coordinator(&config)?;
            let result = coordinator.run_full_rebuild()?;
            finish(&result)
        }
        "resume" => {
            let run_id = args.get(1).ok_or(USAGE)?;
            let mut coordinator = coordinator(&config)?;
            let result = coordinator.resume(run_id)?;
            finish(&result)
        }
        "refresh-rollups" => {
            let catalog = SqliteCatalog::open(&config.store_path)?;
            let mut store = RollupStore::open(&config.store_path)?;
            let result = refresh_rollups(&mut store, &catalog)?;
            finish(&result)
        }
        "status" => {
            let journal = RebuildJournal::open(&config.store_path)?;
            let catalog = SqliteCatalog::open(&config.store_path)?;
            let run = match args.get(1) {
                Some(run_id) => journal.run(run_id)?,
                None => journal.latest_run()?,
            };
            let (progress, transitions) = match &run {
                Some(run) => (
                    journal.progress(&run.run_id)?,
                    journal.transitions(&run.run_id)?,
                ),
                None => (None, Vec::new()),
            };
            print_json(&json!({
                "run": run,
                "progress": progress,
                "transitions": transitions,
                "snapshots": catalog.entries()?,
            }))?;
            Ok(ExitCode::SUCCESS)
        }
        "rollback" => {
            let mut catalog = SqliteCatalog::open(&config.store_path)?;
            print_json(&catalog.rollback_to_retained()?)?;
            Ok(ExitCode::SUCCESS)
        }
        "purge" => {
            let mut catalog = SqliteCatalog::open(&config.store_path)?;
            print_json(&json!({ "purged": catalog.purge()? }))?;
            Ok(ExitCode::SUCCESS)
        }
        "compare" => {
            let (Some(left), Some(right)) = (args.get(1), args.get(2)) else {
                return Err(USAGE.into());
            };
            let left = SnapshotId::parse(left).ok_or_else(|| format!("invalid snapshot id {left}"))?;
            let right =
                SnapshotId::parse(right).ok_or_else(|| format!("invalid snapshot id {right}"))?;
            let catalog = SqliteCatalog::open(&config.store_path)?;
            print_json(&compare_snapshots(&catalog, &left, &right)?)?;
            Ok(ExitCode::SUCCESS)
        }
        other => Err(format!("unknown command {other:?}\n{USAGE}").into()),
    }
}

fn coordinator(
    config: &RebuildConfig,
) -> Result<RebuildCoordinator<SqliteSource, SqliteCatalog>, Box<dyn std::error::Error>> {
    let reference = resolve_reference(config.reference_path.as_deref())?;
    let source = SqliteSource::open(&config.store_path)?;
    let catalog = SqliteCatalog::open(&config.store_path)?;
    let journal = RebuildJournal::open(&config.store_path)?;
    Ok(RebuildCoordinator::new(
        source,
        catalog,
        journal,
        reference,
        config.clone(),
    )?)
}

fn finish(result: &RunResult) -> Result<ExitCode, Box<dyn std::error::Error>> {
    print_json(result)?;
    Ok(match result.status {
        RunStatus::Succeeded | RunStatus::Paused => ExitCode::SUCCESS,
        RunStatus::Failed => ExitCode::FAILURE,
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
