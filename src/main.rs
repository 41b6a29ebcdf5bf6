use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use testforge::agents::standard_gateway;
use testforge::config::Config;
use testforge::core::{AuthKind, Language, ProjectConfig, StageRegistry};
use testforge::orchestration::{Scheduler, SchedulerEvent};
use testforge::report::{self, codes};
use testforge::store::{ProjectTransition, SqliteStore, StateStore};
use testforge::util::{blocking_with_timeout, format_duration};
use testforge::{Error, Result};

const STORE_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// testforge - API test framework generator with a durable stage pipeline
#[derive(Parser, Debug)]
#[command(name = "testforge")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    TESTFORGE_DEBUG=1           Enable debug logging (alternative to --debug)\n    TESTFORGE_DB_PATH           Override the state database location\n    TESTFORGE_MAX_CONCURRENT    Override scheduler.max_concurrent_dispatches\n    TESTFORGE_AI_ENABLED=1      Enable the reasoning command during parsing")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.testforge/testforge.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (default: ~/.testforge/testforge.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Register a new project and its pipeline tasks
    Create {
        /// Project name
        name: String,

        /// OpenAPI, Swagger, Postman or YAML API description
        #[arg(long)]
        spec: PathBuf,

        /// Target language for the generated framework
        #[arg(long, default_value = "java")]
        language: Language,

        /// Environments to generate configuration for (repeatable)
        #[arg(long = "env")]
        environments: Vec<String>,

        /// Authentication scheme of the API under test
        #[arg(long, default_value = "none")]
        auth: AuthKind,

        /// Output directory (default from config)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Drive the project to completion before returning
        #[arg(long)]
        run: bool,
    },

    /// Drive every unfinished project until idle
    Run {
        /// Keep polling for new projects until Ctrl-C
        #[arg(long)]
        watch: bool,
    },

    /// Show one project's lifecycle summary
    Status {
        /// Project id or unique prefix
        id: String,

        #[arg(long)]
        json: bool,
    },

    /// List all projects, newest first
    List {
        #[arg(long)]
        json: bool,
    },

    /// Cancel a project; running stages finish but their results are discarded
    Cancel {
        /// Project id or unique prefix
        id: String,
    },

    /// Delete a finished project and its history
    Delete {
        /// Project id or unique prefix
        id: String,
    },

    /// Show row counts by status
    Stats,

    /// Delete finished projects older than the given age
    Purge {
        #[arg(long)]
        days: u32,
    },

    /// Print the validated stage pipeline in execution order
    Stages,

    /// Print the effective configuration
    Config {
        /// Also write it to ~/.testforge/testforge.toml
        #[arg(long)]
        write: bool,
    },

    /// Print the version
    Version,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { codes::USAGE } else { codes::SUCCESS };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    if let Err(e) = testforge::log::init_with_debug(cli.debug) {
        eprintln!("warning: logging disabled: {}", e);
    }

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            if testforge::log::is_debug() {
                eprintln!("error: {:?}", e);
            } else {
                eprintln!("error: {}", e);
            }
            report::error_exit_code(&e)
        }
    };
    std::process::exit(code);
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

fn run(cli: Cli) -> Result<i32> {
    if cli.command == Command::Version {
        println!("testforge {}", env!("CARGO_PKG_VERSION"));
        return Ok(codes::SUCCESS);
    }

    let config = load_config(cli.config.as_ref())?;
    let registry = config.registry()?;
    let rt = tokio::runtime::Runtime::new()?;

    match cli.command {
        Command::Stages => {
            print_stages(&registry);
            return Ok(codes::SUCCESS);
        }
        Command::Config { write } => {
            print!("{}", toml::to_string_pretty(&config)?);
            if write {
                config.save()?;
                println!("# written to {}", Config::config_path()?.display());
            }
            return Ok(codes::SUCCESS);
        }
        _ => {}
    }

    let db_path = config.db_path()?;
    let store: Arc<dyn StateStore> = Arc::new(
        rt.block_on(blocking_with_timeout("open state store", STORE_OPEN_TIMEOUT, move || {
            SqliteStore::open_at(db_path)
        }))?,
    );

    match cli.command {
        Command::Create {
            name,
            spec,
            language,
            environments,
            auth,
            output,
            run,
        } => {
            let spec_path = std::fs::canonicalize(&spec).map_err(|e| {
                Error::Validation(format!("cannot read API description {}: {}", spec.display(), e))
            })?;
            let mut project_config = ProjectConfig::new(spec_path).with_language(language);
            project_config.auth = auth;
            if !environments.is_empty() {
                project_config.environments = environments;
            }
            if let Some(output) = output {
                project_config.output_dir = Some(output);
            }

            let project = store.create_project(&name, &project_config, &registry)?;
            info!(project = %project.id, name = %project.name, "project created");
            println!("{}", project.id);
            if !run {
                return Ok(codes::SUCCESS);
            }
            rt.block_on(drive(&config, &registry, Arc::clone(&store), false))?;
            let summary = report::summarize(store.as_ref(), &project.id)?;
            println!("\n{}", summary);
            Ok(summary.exit_code())
        }
        Command::Run { watch } => {
            rt.block_on(drive(&config, &registry, store, watch))?;
            Ok(codes::SUCCESS)
        }
        Command::Status { id, json } => {
            let summary = report::summarize_prefix(store.as_ref(), &id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print!("{}", summary);
            }
            Ok(summary.exit_code())
        }
        Command::List { json } => {
            let projects = report::overview(store.as_ref())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&projects)?);
            } else if projects.is_empty() {
                println!("No projects.");
            } else {
                for project in &projects {
                    println!("{}", project);
                }
            }
            Ok(codes::SUCCESS)
        }
        Command::Cancel { id } => cancel(store.as_ref(), &id),
        Command::Delete { id } => {
            let project = store.find_project(&id)?;
            if !project.status.is_terminal() {
                return Err(Error::Validation(format!(
                    "project {} is {}; cancel it before deleting",
                    project.id.short(),
                    project.status
                )));
            }
            store.delete_project(&project.id)?;
            println!("Deleted {} ({})", project.name, project.id.short());
            Ok(codes::SUCCESS)
        }
        Command::Stats => {
            let stats = report::statistics(store.as_ref())?;
            println!("Projects: {}", stats.total_projects());
            for (status, count) in &stats.projects {
                println!("  {:<10} {}", status, count);
            }
            println!("Tasks:    {}", stats.total_tasks());
            for (status, count) in &stats.tasks {
                println!("  {:<10} {}", status, count);
            }
            println!("Artifacts: {}", stats.artifacts);
            Ok(codes::SUCCESS)
        }
        Command::Purge { days } => {
            let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
            let removed = store.purge_finished(cutoff)?;
            println!("Purged {} project(s) finished before {}", removed, cutoff.format("%Y-%m-%d"));
            Ok(codes::SUCCESS)
        }
        Command::Stages | Command::Config { .. } | Command::Version => Ok(codes::SUCCESS),
    }
}

/// Recover, then schedule until idle (or until Ctrl-C with `watch`).
async fn drive(config: &Config, registry: &StageRegistry, store: Arc<dyn StateStore>, watch: bool) -> Result<()> {
    let gateway = standard_gateway(config)?;
    let missing = gateway.missing_capabilities(registry);
    if !missing.is_empty() {
        let names: Vec<_> = missing.iter().map(|c| c.as_str()).collect();
        return Err(Error::Validation(format!(
            "no provider registered for: {}",
            names.join(", ")
        )));
    }

    let (event_tx, event_rx) = mpsc::channel(256);
    let mut scheduler = Scheduler::from_config(store, Arc::new(gateway), config).with_events(event_tx);
    scheduler.recover().await?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight stages");
            signal_token.cancel();
        }
    });
    let printer = tokio::spawn(print_events(event_rx));

    let result = scheduler.run(shutdown, !watch).await;
    // Dropping the scheduler closes the event channel so the printer exits.
    drop(scheduler);
    let _ = printer.await;
    result
}

async fn print_events(mut rx: mpsc::Receiver<SchedulerEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            SchedulerEvent::TaskStarted {
                project_id,
                stage_id,
                attempt,
            } => println!("[{}] {} started (attempt {})", project_id.short(), stage_id, attempt),
            SchedulerEvent::TaskSucceeded {
                project_id,
                stage_id,
                ..
            } => println!("[{}] {} succeeded", project_id.short(), stage_id),
            SchedulerEvent::TaskRetrying {
                project_id,
                stage_id,
                delay,
                failure,
                ..
            } => println!(
                "[{}] {} will retry in {}: {}",
                project_id.short(),
                stage_id,
                format_duration(delay),
                failure.message
            ),
            SchedulerEvent::TaskFailed {
                project_id,
                stage_id,
                failure,
                ..
            } => println!(
                "[{}] {} failed ({}): {}",
                project_id.short(),
                stage_id,
                failure.class,
                failure.message
            ),
            SchedulerEvent::ResultDiscarded {
                project_id,
                stage_id,
            } => println!("[{}] {} result discarded", project_id.short(), stage_id),
            SchedulerEvent::ProjectFinished { project_id, status } => {
                println!("[{}] project {}", project_id.short(), status)
            }
        }
    }
}

fn cancel(store: &dyn StateStore, id: &str) -> Result<i32> {
    // A running scheduler may advance the project between read and write.
    for _ in 0..3 {
        let project = store.find_project(id)?;
        if project.status.is_terminal() {
            println!("Project {} is already {}", project.id.short(), project.status);
            return Ok(codes::SUCCESS);
        }
        let transition = ProjectTransition::Cancel {
            reason: "cancelled by operator".to_string(),
        };
        match store.update_project(&project.id, project.status, transition) {
            Ok(cancelled) => {
                info!(project = %cancelled.id, "project cancelled");
                println!("Cancelled {} ({})", cancelled.name, cancelled.id.short());
                return Ok(codes::SUCCESS);
            }
            Err(e) if e.is_stale() => continue,
            Err(e) => return Err(e),
        }
    }
    Err(Error::Validation(format!(
        "project {} kept changing; try again",
        id
    )))
}

fn print_stages(registry: &StageRegistry) {
    for (index, stage) in registry.stages().iter().enumerate() {
        let deps = if stage.depends_on.is_empty() {
            String::from("-")
        } else {
            stage
                .depends_on
                .iter()
                .map(|d| d.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };
        println!(
            "{}. {:<24} {:<22} after: {}{}",
            index + 1,
            stage.id.as_str(),
            stage.capability.as_str(),
            deps,
            if stage.fatal { "" } else { "  (soft-fail)" }
        );
    }
}
