mod launcher;
mod parser;
mod pipelines;
mod scheduler;
mod schema;

use std::{path::Path, sync::Arc};

use chrono::{NaiveDate, Utc};
use clap::{Arg, ArgMatches, Command};
use launcher::{ExecutionManagerRegistry, Launcher, PipelineExecutionGraph};
use pipelines::{RetailPipelineSettings, retail_etl_pipeline};
use retail_etl_common::{
    error::Error,
    pipeline::{PipelineDefinition, PipelineRun, PipelineRunStatus},
    resource_manager::{ExecutionContext, LocalProcessExecutionManager},
};
use retail_etl_warehouse::{
    ProcedureName, StoredProcedureExecutionManager, WarehouseConfig, WarehouseDb,
    config::procedure_from_env,
};
use scheduler::PipelineScheduler;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("retail-etl")
        .about("Runs the daily retail ETL pipeline")
        .version("0.1.0")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("pipeline_config")
                .short('p')
                .long("pipeline-config")
                .alias("pipeline_config")
                .help("Path to a pipeline YAML file, replaces the built-in pipeline")
                .global(true)
                .action(clap::ArgAction::Set),
        )
        .subcommand(
            Command::new("run")
                .about("Executes one pipeline run now")
                .arg(
                    Arg::new("date")
                        .short('d')
                        .long("date")
                        .help("Logical date of the run (YYYY-MM-DD), defaults to today")
                        .action(clap::ArgAction::Set),
                ),
        )
        .subcommand(Command::new("serve").about("Runs the pipeline on its schedule until Ctrl-C"))
        .subcommand(Command::new("show").about("Prints the task graph in execution order"))
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_level(true)
        .with_target(true)
        .init();

    let matches = cli().get_matches();

    match matches.subcommand() {
        Some(("show", _)) => show(&load_pipeline_definition(&matches, &procedure_from_env()?)?),
        Some(("run", sub_matches)) => {
            let logical_date = match sub_matches.get_one::<String>("date") {
                Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|e| {
                    Error::InvalidInput(format!("Invalid --date '{raw}': {e}"))
                })?,
                None => Utc::now().date_naive(),
            };

            let warehouse_config = WarehouseConfig::from_env()?;
            let pipeline_def = load_pipeline_definition(&matches, &warehouse_config.procedure)?;
            let launcher = build_launcher(warehouse_config, spawn_shutdown_listener());
            let run = launcher.execute_pipeline(&pipeline_def, logical_date).await?;
            print_run(&run)?;

            if run.status != PipelineRunStatus::Succeeded {
                return Err(Error::TaskExecution(format!(
                    "Pipeline run {} finished with status {}",
                    run.id, run.status
                )));
            }

            Ok(())
        }
        Some(("serve", _)) => {
            let warehouse_config = WarehouseConfig::from_env()?;
            let pipeline_def = Arc::new(load_pipeline_definition(
                &matches,
                &warehouse_config.procedure,
            )?);
            let shutdown_rx = spawn_shutdown_listener();
            let launcher = Arc::new(build_launcher(warehouse_config, shutdown_rx.clone()));

            info!(
                "Serving {} on {:?} schedule",
                pipeline_def.info.name, pipeline_def.info.schedule.interval
            );

            let mut scheduler = PipelineScheduler::new(launcher, pipeline_def, shutdown_rx);
            scheduler
                .run_loop(|run| {
                    if let Err(e) = print_run(run) {
                        warn!("Failed to print run summary: {}", e);
                    }
                })
                .await
        }
        _ => Err(Error::InvalidInput("Invalid subcommand".to_string())),
    }
}

/// The YAML file when one is given, otherwise the built-in pipeline loading
/// through `procedure`.
fn load_pipeline_definition(
    matches: &ArgMatches,
    procedure: &ProcedureName,
) -> Result<PipelineDefinition, Error> {
    match matches.get_one::<String>("pipeline_config") {
        Some(path) => parser::load_pipeline(Path::new(path)),
        None => Ok(retail_etl_pipeline(
            &RetailPipelineSettings::from_env(),
            procedure.as_str(),
        )),
    }
}

fn build_launcher(warehouse_config: WarehouseConfig, shutdown_rx: watch::Receiver<bool>) -> Launcher {
    info!("Warehouse target: {}", warehouse_config.target());

    let mut exec_mgr_registry = ExecutionManagerRegistry::new();
    exec_mgr_registry.register_manager(Arc::new(LocalProcessExecutionManager::new()));
    exec_mgr_registry.register_manager(Arc::new(StoredProcedureExecutionManager::new(Arc::new(
        WarehouseDb::new(warehouse_config),
    ))));

    Launcher::new(Arc::new(exec_mgr_registry), shutdown_rx)
}

/// First Ctrl-C requests a graceful stop of the current run.
fn spawn_shutdown_listener() -> watch::Receiver<bool> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C, shutting down");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => warn!("Error listening for Ctrl-C: {}", e),
        }
        // Keep the sender alive so receivers do not observe a closed channel.
        std::future::pending::<()>().await;
    });

    shutdown_rx
}

fn print_run(run: &PipelineRun) -> Result<(), Error> {
    println!("{}", serde_json::to_string_pretty(run)?);
    Ok(())
}

fn show(pipeline_def: &PipelineDefinition) -> Result<(), Error> {
    let graph = PipelineExecutionGraph::new(pipeline_def)?;

    println!(
        "{} ({:?} from {}, owner {}, retries {})",
        pipeline_def.info.name,
        pipeline_def.info.schedule.interval,
        pipeline_def.info.schedule.start_date,
        pipeline_def.info.owner,
        pipeline_def.info.retries
    );
    if let Some(description) = &pipeline_def.info.description {
        println!("  {description}");
    }

    for (position, task_id) in graph.execution_order().iter().enumerate() {
        let Some(task_def) = graph.get_task_definition(*task_id) else {
            continue;
        };

        let target = match &task_def.execution_context {
            ExecutionContext::LocalProcess(ctx) => ctx.command_line(),
            ExecutionContext::StoredProcedure(ctx) => format!("CALL {}()", ctx.procedure),
        };
        let upstream: Vec<&str> = task_def
            .depends_on
            .iter()
            .filter_map(|id| graph.get_task_definition(*id))
            .map(|t| t.name.as_str())
            .collect();

        println!(
            "{}. {} [{}] {}",
            position + 1,
            task_def.name,
            task_def.execution_context.kind(),
            target
        );
        if !upstream.is_empty() {
            println!("   after: {}", upstream.join(", "));
        }
    }

    Ok(())
}
