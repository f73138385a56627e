//! stockade CLI - run untrusted Python snippets in the sandbox

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use stockade_core::{
    config, ExecutionRequest, ExecutionResult, ExecutionStatus, Isolation, Sandbox, SandboxConfig,
};

#[derive(Parser)]
#[command(name = "stockade")]
#[command(author, version, about = "Sandboxed execution of untrusted Python snippets")]
struct Cli {
    /// JSON sandbox config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute one snippet, streaming its output
    Run {
        /// Code to execute (or - for stdin)
        code: Option<String>,

        /// Read the code from a file
        #[arg(short, long, conflicts_with = "code")]
        file: Option<PathBuf>,

        #[command(flatten)]
        request: RequestArgs,

        /// Print the full result as JSON instead of streaming
        #[arg(long)]
        json: bool,
    },

    /// Execute several script files concurrently, one JSON result per file
    Batch {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[command(flatten)]
        request: RequestArgs,
    },

    /// Report what a backend can enforce on this host
    Probe {
        /// Probe the container backend instead of the local one
        #[arg(long)]
        container: bool,
    },
}

#[derive(Args, Clone)]
struct RequestArgs {
    /// Timeout in seconds (defaults to the config's)
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Module the code may import (repeatable)
    #[arg(short, long = "allow", value_name = "MODULE")]
    allow: Vec<String>,

    /// Address space limit in MB
    #[arg(long)]
    memory_mb: Option<u64>,

    /// CPU time limit in seconds
    #[arg(long)]
    cpu_secs: Option<u64>,

    /// Largest file the code may write, in MB
    #[arg(long)]
    fsize_mb: Option<u64>,

    /// Extra environment variable (repeatable)
    #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
    env: Vec<(String, String)>,

    /// Working directory (a fresh scratch directory if unset)
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Run inside a disposable container
    #[arg(long)]
    container: bool,
}

impl RequestArgs {
    fn build(&self, sandbox: &Sandbox, code: String) -> ExecutionRequest {
        let mut builder = sandbox.request(code);
        if let Some(secs) = self.timeout {
            builder = builder.timeout_secs(secs);
        }
        for module in &self.allow {
            builder = builder.allow(module.clone());
        }
        if let Some(mb) = self.memory_mb {
            builder = builder.memory_limit_mb(mb);
        }
        if let Some(secs) = self.cpu_secs {
            builder = builder.cpu_limit_secs(secs);
        }
        if let Some(mb) = self.fsize_mb {
            builder = builder.file_size_limit(mb.saturating_mul(1024 * 1024));
        }
        for (key, value) in &self.env {
            builder = builder.env(key.clone(), value.clone());
        }
        if let Some(dir) = &self.cwd {
            builder = builder.working_directory(dir.clone());
        }
        if self.container {
            builder = builder.isolation(Isolation::Container);
        }
        builder.build()
    }
}

fn parse_env(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("stockade=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let sandbox_config = match &cli.config {
        Some(path) => SandboxConfig::from_file(path)?,
        None => SandboxConfig::default(),
    };
    config::install(sandbox_config)?;
    let sandbox = Sandbox::new(config::global().clone());

    match cli.command {
        Commands::Run {
            code,
            file,
            request,
            json,
        } => run(&sandbox, read_code(code, file)?, &request, json).await,
        Commands::Batch { files, request } => batch(&sandbox, files, &request).await,
        Commands::Probe { container } => {
            let isolation = if container {
                Isolation::Container
            } else {
                Isolation::Process
            };
            let capabilities = sandbox.probe(isolation);
            let report = serde_json::json!({
                "backend": isolation,
                "capabilities": capabilities,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(if capabilities.available {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

fn read_code(code: Option<String>, file: Option<PathBuf>) -> anyhow::Result<String> {
    if let Some(path) = file {
        return std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()));
    }
    match code {
        Some(code) if code == "-" => {
            let mut code = String::new();
            std::io::stdin()
                .read_to_string(&mut code)
                .context("failed to read code from stdin")?;
            Ok(code)
        }
        Some(code) => Ok(code),
        None => bail!("no code given: pass CODE, - for stdin, or --file"),
    }
}

async fn run(
    sandbox: &Sandbox,
    code: String,
    args: &RequestArgs,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let mut request = args.build(sandbox, code);
    if !json {
        request.stream_consumer = Some(std::sync::Arc::new(|line: &str, is_stderr: bool| {
            if is_stderr {
                eprintln!("[stderr] {line}");
            } else {
                println!("{line}");
            }
        }));
    }

    let sandbox = sandbox.clone();
    let result = tokio::task::spawn_blocking(move || sandbox.execute(&request))
        .await
        .context("execution task panicked")??;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_summary(&result)?;
    }
    Ok(ExitCode::from(exit_status(result.status)))
}

async fn batch(
    sandbox: &Sandbox,
    files: Vec<PathBuf>,
    args: &RequestArgs,
) -> anyhow::Result<ExitCode> {
    let mut tasks = Vec::with_capacity(files.len());
    for path in files {
        let code = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let request = args.build(sandbox, code);
        let sandbox = sandbox.clone();
        tracing::debug!(file = %path.display(), "queued");
        tasks.push((path, tokio::task::spawn_blocking(move || sandbox.execute(&request))));
    }

    let mut all_succeeded = true;
    for (path, task) in tasks {
        let result = task
            .await
            .with_context(|| format!("execution of {} panicked", path.display()))??;
        all_succeeded &= result.is_success();
        let line = serde_json::json!({
            "file": path.display().to_string(),
            "result": result,
        });
        println!("{}", serde_json::to_string(&line)?);
    }

    Ok(if all_succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_summary(result: &ExecutionResult) -> anyhow::Result<()> {
    let mut err = std::io::stderr().lock();
    for warning in &result.warnings {
        writeln!(err, "warning: {warning}")?;
    }
    if let Some(violation) = &result.blocked {
        writeln!(err, "blocked: {violation}")?;
    }
    if let Some(diagnostic) = &result.diagnostic {
        writeln!(err, "{diagnostic}")?;
    }
    let code = result
        .exit_code
        .map_or_else(|| "-".to_string(), |c| c.to_string());
    writeln!(
        err,
        "status: {} (exit code {code}, {:.2}s, {:?} backend)",
        result.status,
        result.duration.as_secs_f64(),
        result.backend,
    )?;
    Ok(())
}

const fn exit_status(status: ExecutionStatus) -> u8 {
    match status {
        ExecutionStatus::Success => 0,
        ExecutionStatus::ScriptException => 1,
        ExecutionStatus::Timeout => 2,
        ExecutionStatus::SupervisorError => 3,
    }
}
