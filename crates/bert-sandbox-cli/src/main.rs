//! BERT Studio code sandbox CLI
//!
//! The `bert-sandbox` command validates and runs custom inference code.
//!
//! ## Commands
//!
//! - `validate`: Static check of a code file, nothing runs
//! - `run`: Run `custom_function` on one input
//! - `run-batch`: Run `custom_function` once per input
//! - `task`: Run a saved task record
//!
//! A code file is a JSON object with `tokenizer_code`, `model_code` and
//! `function_code`. Responses are printed as `{"status": ..., "body": ...}`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, Level};

use bert_sandbox_core::{
    ApiResponse, CacheDirResolver, CodeSubmission, CustomTask, ModelResolver, ResolveError,
    ResolvedModel, SandboxService, SandboxSettings, SourceFragments, StaticResolver,
    SubmissionInput, ValidationResult,
};

#[derive(Parser)]
#[command(name = "bert-sandbox")]
#[command(author = "BERT Studio")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Validate and run custom inference code in a sandbox", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Settings file (TOML)
    #[arg(long, global = true, env = "BERT_SANDBOX_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a code file against the validator policy
    Validate {
        /// JSON file with the three code fragments
        file: PathBuf,
    },

    /// Run custom_function on a single input
    Run {
        /// JSON file with the three code fragments
        file: PathBuf,

        /// Model the code runs against
        #[arg(short, long)]
        model_id: String,

        /// Input text
        #[arg(short, long)]
        input: String,
    },

    /// Run custom_function once per input
    RunBatch {
        /// JSON file with the three code fragments
        file: PathBuf,

        /// Model the code runs against
        #[arg(short, long)]
        model_id: String,

        /// Input text (repeatable)
        #[arg(short, long = "input", required = true)]
        inputs: Vec<String>,
    },

    /// Run a saved task record
    Task {
        /// JSON task record
        task: PathBuf,

        /// Input text (repeat for a batch)
        #[arg(short, long = "input", required = true)]
        inputs: Vec<String>,
    },
}

/// Resolver picked from the settings.
///
/// With a model cache directory only downloaded models resolve. Without
/// one the requested id is taken at its word.
enum CliResolver {
    Cache(CacheDirResolver),
    Trusting(StaticResolver),
}

#[async_trait]
impl ModelResolver for CliResolver {
    async fn resolve(&self, model_id: &str) -> Result<ResolvedModel, ResolveError> {
        match self {
            CliResolver::Cache(resolver) => resolver.resolve(model_id).await,
            CliResolver::Trusting(resolver) => resolver.resolve(model_id).await,
        }
    }
}

fn resolver_for(settings: &SandboxSettings, model_id: &str) -> CliResolver {
    match &settings.model_cache_dir {
        Some(dir) => CliResolver::Cache(CacheDirResolver::new(dir)),
        None => CliResolver::Trusting(StaticResolver::new([model_id])),
    }
}

#[derive(Serialize)]
struct Printed<'a> {
    status: u16,
    body: &'a serde_json::Value,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    bert_sandbox_core::init_tracing(cli.json, level);

    let settings =
        SandboxSettings::load(cli.config.as_deref()).context("Failed to load sandbox settings")?;

    let ok = match cli.command {
        Commands::Validate { file } => cmd_validate(&settings, &file)?,
        Commands::Run {
            file,
            model_id,
            input,
        } => cmd_run(&settings, &file, &model_id, SubmissionInput::Single(input)).await?,
        Commands::RunBatch {
            file,
            model_id,
            inputs,
        } => cmd_run(&settings, &file, &model_id, SubmissionInput::Batch(inputs)).await?,
        Commands::Task { task, inputs } => cmd_task(&settings, &task, inputs).await?,
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

/// Validate a code file; `false` when rejected.
fn cmd_validate(settings: &SandboxSettings, file: &Path) -> Result<bool> {
    let code: SourceFragments = read_json_file(file)?;
    let result = bert_sandbox_core::Validator::new(settings.policy.clone()).validate(&code);
    println!("{}", serde_json::to_string_pretty(&result)?);
    if let ValidationResult::Rejected { reasons } = &result {
        info!(reasons = reasons.len(), "submission rejected");
    }
    Ok(result.is_accepted())
}

/// Run a code file; `false` unless the response is a 2xx.
async fn cmd_run(
    settings: &SandboxSettings,
    file: &Path,
    model_id: &str,
    input: SubmissionInput,
) -> Result<bool> {
    let code: SourceFragments = read_json_file(file)?;
    let submission = CodeSubmission::new(code, input, model_id);
    let response = run_submission(settings, &submission).await;
    print_response(&response)?;
    Ok(response.is_success())
}

/// Run a saved task; several inputs run as a batch.
async fn cmd_task(settings: &SandboxSettings, path: &Path, mut inputs: Vec<String>) -> Result<bool> {
    let task: CustomTask = read_json_file(path)?;
    task.validate()
        .with_context(|| format!("Invalid task record in {:?}", path))?;
    info!(task = %task.name, model_id = %task.model_id, "running saved task");

    let batch = task.batch_mode.unwrap_or(false) || inputs.len() > 1;
    let input = if batch {
        SubmissionInput::Batch(inputs)
    } else {
        SubmissionInput::Single(inputs.pop().unwrap_or_default())
    };
    let submission = task.into_submission(input);
    let response = run_submission(settings, &submission).await;
    print_response(&response)?;
    Ok(response.is_success())
}

async fn run_submission(settings: &SandboxSettings, submission: &CodeSubmission) -> ApiResponse {
    let resolver = resolver_for(settings, &submission.model_id);
    SandboxService::from_settings(settings, resolver)
        .handle(submission)
        .await
}

fn print_response(response: &ApiResponse) -> Result<()> {
    let printed = Printed {
        status: response.status,
        body: &response.body,
    };
    println!("{}", serde_json::to_string_pretty(&printed)?);
    Ok(())
}

fn read_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read JSON file: {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {:?}", path))
}
