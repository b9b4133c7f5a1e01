//! Main entry point for the harness binary
//!
//! Brings the backend stack up, runs the test case batch against the
//! gateway, writes the results, and tears the stack down. Ctrl-C at any
//! point cancels cleanly: startup rolls back, an in-flight batch returns
//! its partial results.

use clap::Parser;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio_util::sync::CancellationToken;

use harness::core::judge::{AcceptAllJudge, ManualReviewJudge, SubstringJudge};
use harness::services::{
    FastChatLauncher, JsonCaseSource, JsonResultsSink, MockStackLauncher, StackSupervisor,
    TestExecutor,
};
use harness::traits::{JudgementStrategy, ResultsSink, RoleLauncher, TestCaseSource};
use harness::{ExecutorConfig, HarnessError, HarnessResult, StackConfig};
use shared::{logging, process_info, process_warn, ProcessId, RunMetadata, StackPorts};

/// Black-box test harness for a controller/worker/gateway inference stack
#[derive(Parser)]
#[command(name = "harness")]
#[command(about = "Supervises an inference backend stack and runs a test case batch against it")]
pub struct Args {
    /// Path to the JSON test case file
    #[arg(long)]
    pub cases: String,

    /// Path for the JSON results document
    #[arg(long, default_value = "results.json")]
    pub out: String,

    /// Model identifier served by the worker
    #[arg(long, default_value = "lmsys/vicuna-7b-v1.5")]
    pub model: String,

    /// Host the stack binds to
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Preferred controller port
    #[arg(long, default_value = "21001")]
    pub controller_port: u16,

    /// Preferred worker port
    #[arg(long, default_value = "21002")]
    pub worker_port: u16,

    /// Preferred gateway port
    #[arg(long, default_value = "8000")]
    pub gateway_port: u16,

    /// Scan forward for a free port when a preferred port is held by an
    /// unrelated process (default: fail instead of rebinding silently)
    #[arg(long)]
    pub scan_on_conflict: bool,

    /// Seconds to wait for each role to become ready
    #[arg(long, default_value = "30")]
    pub readiness_timeout_secs: u64,

    /// Maximum request attempts per test case
    #[arg(long, default_value = "3")]
    pub max_attempts: u32,

    /// Per-attempt request timeout in seconds
    #[arg(long, default_value = "60")]
    pub request_timeout_secs: u64,

    /// Use the in-tree mock backend instead of a real FastChat stack
    #[arg(long)]
    pub mock: bool,

    /// Outcome judgement strategy (accept-all, substring, manual-review)
    #[arg(long, default_value = "accept-all")]
    pub judge: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

fn judge_for(name: &str) -> HarnessResult<Arc<dyn JudgementStrategy>> {
    match name {
        "accept-all" => Ok(Arc::new(AcceptAllJudge)),
        "substring" => Ok(Arc::new(SubstringJudge)),
        "manual-review" => Ok(Arc::new(ManualReviewJudge)),
        other => Err(HarnessError::Config {
            field: format!("unknown judgement strategy: {other}"),
        }),
    }
}

#[tokio::main]
async fn main() -> HarnessResult<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    ProcessId::init_harness();
    logging::init_tracing_with_level(Some(&args.log_level));
    logging::log_startup(ProcessId::current(), "inference stack test harness");

    let stack_config = StackConfig {
        host: args.host.clone(),
        ..StackConfig::default()
    }
    .with_ports(StackPorts {
        controller: args.controller_port,
        worker: args.worker_port,
        gateway: args.gateway_port,
    })
    .with_model(&args.model)
    .with_scan_on_conflict(args.scan_on_conflict)
    .with_readiness(
        Duration::from_millis(500),
        Duration::from_secs(args.readiness_timeout_secs),
    );

    let executor_config = ExecutorConfig::default()
        .with_attempts(args.max_attempts)
        .with_request_timeout(Duration::from_secs(args.request_timeout_secs));

    let launcher: Arc<dyn RoleLauncher> = if args.mock {
        process_info!(ProcessId::current(), "🎭 Using mock backend stack");
        Arc::new(MockStackLauncher::new(&args.host, &args.model))
    } else {
        Arc::new(
            FastChatLauncher::new(&args.host, &args.model)
                .with_env_passthrough(stack_config.env_passthrough.clone()),
        )
    };

    let judge = judge_for(&args.judge)?;
    let supervisor = StackSupervisor::new(stack_config, launcher);
    let executor = TestExecutor::new(executor_config, judge);
    let source = JsonCaseSource::new(&args.cases);
    let sink = JsonResultsSink::new(&args.out);

    // Ctrl-C flips the token; startup rolls back, a running batch returns
    // its partial results, and teardown still happens below
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            process_warn!(ProcessId::current(), "🛑 Interrupt received, cancelling");
            signal_cancel.cancel();
        }
    });

    let cases = source.load().await?;

    let started_at = chrono::Utc::now();
    let run_started = Instant::now();

    let endpoint = match supervisor.start(&cancel).await {
        Ok(endpoint) => endpoint,
        Err(e) => {
            logging::log_shutdown(ProcessId::current(), "stack startup failed");
            return Err(e);
        }
    };
    process_info!(ProcessId::current(), "🚀 Gateway at {}", endpoint.base_url);

    let results = executor.run(&endpoint, &cases, &cancel).await;

    let ports = supervisor.ports().await.ok_or_else(|| HarnessError::Config {
        field: "stack ports unavailable after start".to_string(),
    })?;
    let metadata = RunMetadata {
        started_at,
        total_duration_ms: run_started.elapsed().as_millis() as u64,
        model_id: args.model.clone(),
        ports,
    };
    sink.write(&metadata, &results).await?;

    supervisor.stop().await?;
    logging::log_shutdown(ProcessId::current(), "run complete");
    Ok(())
}
