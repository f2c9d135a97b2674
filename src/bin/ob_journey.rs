//! Journey Command Line Interface
//!
//! Inspect workflow definitions and drive client journeys stored on disk.
//!
//! # Usage
//!
//! ```bash
//! # Check every definition under config/workflows
//! ob_journey validate
//!
//! # Show the machine a corporate LU client would get
//! ob_journey compile kyc_onboarding --client-type corporate --jurisdiction LU
//!
//! # Start a client, submit inputs, inspect progress
//! ob_journey start acme kyc_onboarding --client-type corporate --jurisdiction LU
//! ob_journey submit acme --set email=ops@acme.lu --set employees=40
//! ob_journey status acme
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::Level;

use ob_journey::{
    ClientProfile, ClientStateStore, FieldValue, FileStateStore, Inputs, JourneyConfig,
    JourneyEngine, JourneyStatus, RuntimeMachine, SubmitOutcome, WorkflowLoader,
};

#[derive(Parser)]
#[command(name = "ob_journey")]
#[command(version)]
#[command(about = "Onboarding journey CLI: validate workflows and drive client state")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Client state directory
    #[arg(long, global = true, env = "OB_JOURNEY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Workflow definition file or directory
    #[arg(long, global = true, env = "OB_JOURNEY_DEFINITIONS")]
    definitions: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', global = true, default_value = "pretty", value_enum)]
    format: OutputFormat,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Pretty,
}

#[derive(clap::Args)]
struct ProfileArgs {
    /// Client type, e.g. corporate, individual, fund
    #[arg(long)]
    client_type: Option<String>,

    /// Jurisdiction (ISO 2-letter code)
    #[arg(long)]
    jurisdiction: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and validate workflow definitions
    Validate {
        /// Single definition file (defaults to the configured definitions)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Compile a workflow for a client profile and print the machine
    Compile {
        workflow: String,
        #[command(flatten)]
        profile: ProfileArgs,
    },

    /// List stored client ids
    Clients,

    /// Print a client's stored record
    Show { client_id: String },

    /// Find or create a client's journey
    Start {
        client_id: String,
        workflow: String,
        #[command(flatten)]
        profile: ProfileArgs,
        /// Profile payload as a JSON object
        #[arg(long)]
        data: Option<String>,
    },

    /// Current step, missing fields and progress
    Status {
        client_id: String,
        #[command(flatten)]
        profile: ProfileArgs,
    },

    /// Submit inputs for the current step
    Submit {
        client_id: String,
        /// Input as key=value; values that parse as JSON keep their type
        #[arg(long = "set", value_name = "KEY=VALUE")]
        inputs: Vec<String>,
        #[command(flatten)]
        profile: ProfileArgs,
    },

    /// Go back one step, or to a specific completed step
    Back {
        client_id: String,
        #[arg(long)]
        to: Option<String>,
        #[command(flatten)]
        profile: ProfileArgs,
    },

    /// Delete a client's record
    Delete { client_id: String },

    /// Import legacy client records that have no native record yet
    Migrate {
        /// Legacy JSON file (defaults to OB_JOURNEY_LEGACY_FILE)
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

// =============================================================================
// MAIN
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let format = cli.format;

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if format == OutputFormat::Json {
                println!("{}", serde_json::json!({ "error": format!("{:#}", e) }));
            } else {
                eprintln!("{}: {:#}", "error".red().bold(), e);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = JourneyConfig::from_env()?;
    if let Some(dir) = cli.data_dir {
        config = config.data_dir(dir);
    }
    if let Some(path) = cli.definitions {
        config = config.definitions_path(path);
    }
    let format = cli.format;

    match cli.command {
        Commands::Validate { file } => cmd_validate(&config, file, format),
        Commands::Compile { workflow, profile } => {
            let engine = engine(&config).await?;
            let profile = profile_from_args(&profile)?;
            let machine = engine.machine_for(&workflow, &profile)?;
            cmd_compile(&machine, format)
        }
        Commands::Clients => {
            let ids = config.open_store().await?.list().await?;
            emit(format, &ids, || {
                if ids.is_empty() {
                    println!("{}", "No clients".dimmed());
                }
                for id in &ids {
                    println!("{}", id);
                }
            })
        }
        Commands::Show { client_id } => {
            let state = config.open_store().await?.get(&client_id).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(())
        }
        Commands::Start {
            client_id,
            workflow,
            profile,
            data,
        } => {
            let engine = engine(&config).await?;
            let profile = profile_from_args(&profile)?;
            let machine = engine.machine_for(&workflow, &profile)?;

            let mut data = match data {
                Some(raw) => serde_json::from_str(&raw).context("--data must be a JSON object")?,
                None => serde_json::json!({}),
            };
            if let Some(obj) = data.as_object_mut() {
                obj.entry("client_type")
                    .or_insert_with(|| profile.client_type.clone().into());
                obj.entry("jurisdiction")
                    .or_insert_with(|| profile.jurisdiction.clone().into());
            }

            let state = engine.start(&client_id, &machine, Some(data)).await?;
            emit(format, &state, || {
                println!(
                    "{} {} at step {}",
                    "OK".green().bold(),
                    state.client_id,
                    state.current_step_id.cyan()
                );
            })
        }
        Commands::Status { client_id, profile } => {
            let engine = engine(&config).await?;
            let machine = machine_for_client(&engine, &client_id, &profile).await?;
            let status = engine.status(&client_id, &machine).await?;
            emit(format, &status, || print_status(&status))
        }
        Commands::Submit {
            client_id,
            inputs,
            profile,
        } => {
            let engine = engine(&config).await?;
            let machine = machine_for_client(&engine, &client_id, &profile).await?;
            let inputs = parse_inputs(&inputs)?;
            let outcome = engine.submit(&client_id, &machine, inputs).await?;
            emit(format, &outcome, || match &outcome {
                SubmitOutcome::Advanced { from, to, .. } => {
                    println!("{} {} -> {}", "ADVANCED".green().bold(), from, to.cyan())
                }
                SubmitOutcome::Blocked { reason, .. } => {
                    println!("{} {}", "BLOCKED".yellow().bold(), reason)
                }
                SubmitOutcome::Finished => println!("{}", "Journey already complete".dimmed()),
            })
        }
        Commands::Back {
            client_id,
            to,
            profile,
        } => {
            let engine = engine(&config).await?;
            let machine = machine_for_client(&engine, &client_id, &profile).await?;
            let state = match to {
                Some(step) => engine.rewind_to(&client_id, &machine, &step).await?,
                None => engine.go_back(&client_id, &machine).await?,
            };
            emit(format, &state, || {
                println!("{} now at {}", state.client_id, state.current_step_id.cyan())
            })
        }
        Commands::Delete { client_id } => {
            config.open_store().await?.delete(&client_id).await?;
            emit(format, &serde_json::json!({ "deleted": client_id }), || {
                println!("{} deleted {}", "OK".green().bold(), client_id)
            })
        }
        Commands::Migrate { file } => {
            if let Some(file) = file {
                config = config.legacy_file(file);
            }
            if config.legacy_file.is_none() {
                return Err(anyhow!("No legacy file given (--file or OB_JOURNEY_LEGACY_FILE)"));
            }
            let migrated = config.open_store().await?.migrate_legacy_data().await?;
            emit(format, &serde_json::json!({ "migrated": migrated }), || {
                println!("{} migrated {} client(s)", "OK".green().bold(), migrated)
            })
        }
    }
}

// =============================================================================
// COMMAND IMPLEMENTATIONS
// =============================================================================

fn cmd_validate(config: &JourneyConfig, file: Option<PathBuf>, format: OutputFormat) -> Result<()> {
    let definitions = match file {
        Some(path) => {
            let def = WorkflowLoader::load_from_file(&path)?;
            std::collections::BTreeMap::from([(def.workflow.clone(), def)])
        }
        None => config.load_definitions()?,
    };

    let summary: Vec<_> = definitions
        .values()
        .map(|d| {
            serde_json::json!({
                "workflow": d.workflow,
                "version": d.version,
                "variants": d.variants.iter().map(|v| &v.id).collect::<Vec<_>>(),
            })
        })
        .collect();

    emit(format, &summary, || {
        for def in definitions.values() {
            println!(
                "{} {} v{} ({} variant(s))",
                "OK".green().bold(),
                def.workflow,
                def.version,
                def.variants.len()
            );
        }
    })
}

fn cmd_compile(machine: &RuntimeMachine, format: OutputFormat) -> Result<()> {
    emit(format, machine, || {
        println!(
            "{} {} / {} ({} steps)",
            "Machine".cyan().bold(),
            machine.workflow_id,
            machine.variant_id,
            machine.steps.len()
        );
        for step in &machine.steps {
            let stage = step.stage.as_deref().unwrap_or("-");
            println!("  [{}] {} ({})", step.position, step.id.bold(), stage);
            if !step.required_fields.is_empty() {
                println!("      requires: {}", step.required_fields.join(", "));
            }
            for condition in &step.next.conditions {
                println!(
                    "      if {} {} {} -> {}",
                    condition.field, condition.op, condition.value, condition.target
                );
            }
            println!("      default -> {}", step.next.default);
        }
    })
}

fn print_status(status: &JourneyStatus) {
    println!(
        "{} {} ({} / {})",
        "Client".cyan().bold(),
        status.client_id,
        status.workflow_id,
        status.variant_id
    );
    if status.is_end {
        println!("  step: {}", "END".green().bold());
    } else {
        println!(
            "  step: {} (stage {})",
            status.current_step_id.bold(),
            status.current_stage.as_deref().unwrap_or("-")
        );
    }
    match &status.check.reason {
        Some(reason) if !status.is_end => println!("  {} {}", "blocked:".yellow(), reason),
        _ => {}
    }
    println!(
        "  progress: {}/{} ({}%)",
        status.progress.completed, status.progress.total, status.progress.percentage
    );
    for stage in &status.stages {
        println!(
            "    {:<24} {}/{} ({}%)",
            stage.stage_name, stage.completed, stage.total, stage.percentage
        );
    }
}

// =============================================================================
// HELPERS
// =============================================================================

async fn engine(config: &JourneyConfig) -> Result<JourneyEngine<FileStateStore>> {
    let definitions = config.load_definitions().with_context(|| {
        format!(
            "loading definitions from {}",
            config.definitions_path.display()
        )
    })?;
    let store = config.open_store().await?;
    Ok(JourneyEngine::new(store, definitions))
}

fn profile_from_args(args: &ProfileArgs) -> Result<ClientProfile> {
    match (&args.client_type, &args.jurisdiction) {
        (Some(client_type), Some(jurisdiction)) => {
            Ok(ClientProfile::new(client_type, jurisdiction))
        }
        _ => Err(anyhow!("--client-type and --jurisdiction are required")),
    }
}

/// Machine for a stored client: its own workflow, compiled for the
/// profile given on the command line or recorded in its data.
async fn machine_for_client(
    engine: &JourneyEngine<FileStateStore>,
    client_id: &str,
    args: &ProfileArgs,
) -> Result<RuntimeMachine> {
    let state = engine.store().get(client_id).await?;
    let profile = match profile_from_args(args) {
        Ok(profile) => profile,
        Err(_) => ClientProfile::from_data(&state.data).ok_or_else(|| {
            anyhow!(
                "client '{}' has no stored profile; pass --client-type and --jurisdiction",
                client_id
            )
        })?,
    };
    Ok(engine.machine_for(&state.workflow_id, &profile)?)
}

fn parse_inputs(pairs: &[String]) -> Result<Inputs> {
    pairs
        .iter()
        .map(|pair| {
            let (key, raw) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("expected KEY=VALUE, got '{}'", pair))?;
            let value = serde_json::from_str::<serde_json::Value>(raw)
                .map(FieldValue::from)
                .unwrap_or_else(|_| FieldValue::from(raw));
            Ok((key.trim().to_string(), value))
        })
        .collect()
}

fn emit<T: Serialize + ?Sized>(format: OutputFormat, value: &T, pretty: impl FnOnce()) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Pretty => pretty(),
    }
    Ok(())
}
