//! `archflow` — run, validate and serve workflows.
//!
//! Exit codes: 0 success, 1 generic failure, 2 invalid workflow, 3 timeout.

mod config;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use archflow_engine::{EngineConfig, EngineError, FlowEngine, InMemoryStateStore};
use archflow_execution::{ExecutionTracker, FlowStatus};
use archflow_mcp::{McpBroker, StdioTransport};
use archflow_metrics::FlowMetricsCollector;
use archflow_streaming::StreamingRegistry;
use archflow_tool::builtin::{
    CacheInterceptor, LoggingInterceptor, MeterInterceptor, ValidationInterceptor,
};
use archflow_tool::{InterceptorChain, ToolInvoker, ToolRegistry};
use archflow_workflow::{FlowGraph, Workflow};

use crate::config::ArchflowConfig;

const EXIT_FAILURE: u8 = 1;
const EXIT_INVALID_WORKFLOW: u8 = 2;
const EXIT_TIMEOUT: u8 = 3;

#[derive(Parser)]
#[command(name = "archflow", version, about = "Workflow orchestration engine for AI pipelines")]
struct Cli {
    /// Configuration file (defaults to ./archflow.toml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a workflow definition to completion.
    Run {
        /// Path to the workflow JSON definition.
        workflow: PathBuf,
        /// Run input as inline JSON.
        #[arg(long, default_value = "null")]
        input: String,
    },
    /// Validate a workflow definition without running it.
    Validate {
        /// Path to the workflow JSON definition.
        workflow: PathBuf,
    },
    /// Serve registered workflows over MCP on stdio.
    ServeMcp,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match ArchflowConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("error: {error:#}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    match run_command(cli.command, config).await {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn run_command(command: Command, config: ArchflowConfig) -> anyhow::Result<ExitCode> {
    match command {
        Command::Validate { workflow } => {
            let workflow = load_workflow(&workflow)?;
            match FlowGraph::build(&workflow) {
                Ok(_) => {
                    println!("workflow {:?} is valid", workflow.id);
                    Ok(ExitCode::SUCCESS)
                }
                Err(error) => {
                    eprintln!("invalid workflow: {error}");
                    Ok(ExitCode::from(EXIT_INVALID_WORKFLOW))
                }
            }
        }
        Command::Run { workflow, input } => {
            let workflow = load_workflow(&workflow)?;
            let input: serde_json::Value =
                serde_json::from_str(&input).context("--input is not valid JSON")?;

            let engine = build_engine(&config);
            register_plugin_workflows(&engine, config.agent.plugins_path.as_deref());

            let outcome = engine.run(&workflow, input).await;
            engine.collector().close().await;
            engine.streaming().shutdown().await;

            match outcome {
                Ok(result) => {
                    println!("{}", serde_json::to_string_pretty(&result)?);
                    Ok(ExitCode::from(exit_code_for(&result)))
                }
                Err(error @ (EngineError::Workflow(_) | EngineError::UnknownStepType(_))) => {
                    eprintln!("invalid workflow: {error}");
                    Ok(ExitCode::from(EXIT_INVALID_WORKFLOW))
                }
                Err(error) => Err(error.into()),
            }
        }
        Command::ServeMcp => {
            let engine = build_engine(&config);
            register_plugin_workflows(&engine, config.agent.plugins_path.as_deref());

            let broker = Arc::new(McpBroker::new(
                Arc::clone(&engine),
                config.agent.id.clone(),
                env!("CARGO_PKG_VERSION"),
            ));
            tracing::info!(agent = %config.agent.id, "serving MCP on stdio");
            broker.serve(StdioTransport::new()).await?;
            engine.collector().close().await;
            engine.streaming().shutdown().await;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn build_engine(config: &ArchflowConfig) -> Arc<FlowEngine> {
    let tracker = Arc::new(ExecutionTracker::new());
    let tools = ToolRegistry::new();
    let collector = Arc::new(FlowMetricsCollector::new(config.metrics.clone()));

    let mut chain = InterceptorChain::new();
    chain.register(Arc::new(ValidationInterceptor::new(tools.clone())));
    chain.register(Arc::new(LoggingInterceptor));
    chain.register(Arc::new(CacheInterceptor::new()));
    chain.register(Arc::new(MeterInterceptor::new(collector.registry().clone())));

    let invoker = Arc::new(ToolInvoker::new(Arc::clone(&tracker), tools, chain));
    let streaming = Arc::new(StreamingRegistry::new(config.streaming.clone()));
    streaming.spawn_reaper();
    collector.start();

    let engine_config = EngineConfig {
        max_concurrent: config.resources.parallelism,
        default_flow_timeout_ms: config.flow.default_timeout_ms,
        retry: config.retry.clone(),
        ..EngineConfig::default()
    };

    Arc::new(FlowEngine::new(
        engine_config,
        tracker,
        invoker,
        streaming,
        collector,
        Arc::new(InMemoryStateStore::new()),
    ))
}

fn load_workflow(path: &Path) -> anyhow::Result<Workflow> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading workflow {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing workflow {}", path.display()))
}

/// Register every `*.json` workflow found under the plugins directory.
fn register_plugin_workflows(engine: &Arc<FlowEngine>, dir: Option<&Path>) {
    let Some(dir) = dir else { return };
    let Ok(entries) = std::fs::read_dir(dir) else {
        tracing::warn!(dir = %dir.display(), "plugins path is not readable");
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_none_or(|e| e != "json") {
            continue;
        }
        match load_workflow(&path) {
            Ok(workflow) => {
                tracing::info!(id = %workflow.id, file = %path.display(), "registered workflow");
                engine.register_workflow(workflow);
            }
            Err(error) => {
                tracing::warn!(file = %path.display(), %error, "skipping unparseable workflow");
            }
        }
    }
}

fn exit_code_for(result: &archflow_execution::FlowResult) -> u8 {
    match result.status {
        FlowStatus::Completed | FlowStatus::Suspended => 0,
        FlowStatus::Failed => {
            if result.errors.iter().any(|e| e.kind == "StepTimeout") {
                EXIT_TIMEOUT
            } else {
                EXIT_FAILURE
            }
        }
        FlowStatus::Stopped | FlowStatus::Running => EXIT_FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use archflow_execution::{ExecutionMetrics, FlowResult};

    fn result(status: FlowStatus, error_kind: Option<&str>) -> FlowResult {
        FlowResult {
            run_id: "r".into(),
            status,
            output: None,
            metrics: ExecutionMetrics::default(),
            errors: error_kind
                .map(|kind| vec![archflow_execution::ExecutionError::new(None, kind, "x")])
                .unwrap_or_default(),
            resume_token: None,
        }
    }

    #[test]
    fn exit_codes_follow_the_contract() {
        assert_eq!(exit_code_for(&result(FlowStatus::Completed, None)), 0);
        assert_eq!(
            exit_code_for(&result(FlowStatus::Failed, Some("RetryExhausted"))),
            EXIT_FAILURE
        );
        assert_eq!(
            exit_code_for(&result(FlowStatus::Failed, Some("StepTimeout"))),
            EXIT_TIMEOUT
        );
        assert_eq!(exit_code_for(&result(FlowStatus::Stopped, None)), EXIT_FAILURE);
    }
}
