use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqchain::engine::{Engine, ExecutionStatus, RunInput, StepStatus};
use reqchain::schema::CollectionFile;
use reqchain::server::{run_server, AppState};
use reqchain::store::WorkflowStore;
use reqchain::template::TemplateEngine;
use reqchain::transport::HttpExecutor;
use reqchain::variables::Variables;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the collection YAML file
    #[arg(short, long, value_name = "FILE", global = true, default_value = "collection.yaml")]
    file: PathBuf,

    /// Extra environment variables (KEY=VALUE), applied over the collection's
    #[arg(short, long = "env", value_name = "KEY=VALUE", global = true, value_parser = parse_key_value)]
    env: Vec<(String, String)>,

    /// Load environment variables from a dotenv file
    #[arg(long, value_name = "FILE", global = true)]
    env_file: Option<PathBuf>,

    /// Request timeout in milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// Proxy URL for all requests
    #[arg(long, global = true)]
    proxy: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one workflow and print the outcome
    Run {
        /// Workflow id or name
        #[arg(short, long)]
        workflow: String,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Serve the workflow API
    Serve {
        #[arg(short, long, default_value_t = 3000)]
        port: u16,
    },
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected KEY=VALUE, got `{}`", s))
}

fn load_env_file(path: &Path) -> Result<Variables> {
    let mut vars = Variables::new();
    let iter = dotenv::from_path_iter(path)
        .with_context(|| format!("Could not read env file `{:?}`", path))?;
    for item in iter {
        let (key, value) = item.with_context(|| format!("Invalid line in env file `{:?}`", path))?;
        vars.insert(key, value);
    }
    Ok(vars)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenv::dotenv().ok();

    env_logger::init();
    let cli = Cli::parse();

    let collection = CollectionFile::load(&cli.file)?;

    // collection < env file < --env
    let mut env_vars = collection.environment.clone();
    if let Some(path) = &cli.env_file {
        env_vars.extend(load_env_file(path)?);
    }
    env_vars.extend(cli.env.iter().cloned());

    let mut settings = collection.settings.clone();
    if let Some(timeout_ms) = cli.timeout_ms {
        settings.timeout_ms = timeout_ms;
    }
    if cli.proxy.is_some() {
        settings.proxy = cli.proxy.clone();
    }

    let store = WorkflowStore::from_collection(&collection);
    let engine = Engine::new(Arc::new(HttpExecutor));

    match cli.command {
        Command::Serve { port } => {
            run_server(AppState::new(store, engine, env_vars, settings), port).await?;
        }
        Command::Run { workflow, json } => {
            let workflow = store
                .find_workflow(&workflow)
                .with_context(|| format!("Workflow '{}' not found in {:?}", workflow, cli.file))?;

            println!("🚀 Running workflow: {} ({} steps)", workflow.name, workflow.steps.len());

            let token = CancellationToken::new();
            let ctrl_c = token.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::warn!("Interrupted; stopping after the current step");
                    ctrl_c.cancel();
                }
            });

            let input = RunInput::new(&workflow, &store, &TemplateEngine)
                .env_vars(env_vars)
                .settings(settings)
                .cancel(token);
            let result = engine.execute(input).await;

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                for (index, step) in result.steps.iter().enumerate() {
                    let icon = match step.status {
                        StepStatus::Success => "✅",
                        StepStatus::Failed => "❌",
                    };
                    let name = if step.step_name.is_empty() { &step.request_id } else { &step.step_name };
                    match &step.error {
                        Some(error) => println!("{} {}. {} ({}ms): {}", icon, index + 1, name, step.duration_ms, error),
                        None => println!("{} {}. {} ({}ms)", icon, index + 1, name, step.duration_ms),
                    }
                    for (key, value) in &step.extracted_variables {
                        println!("     {} = {}", key, value);
                    }
                }
                println!();
                println!("✨ Workflow finished: {:?}", result.status);
            }

            if result.status == ExecutionStatus::Failed {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
