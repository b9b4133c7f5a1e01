//! Mock backend stack: one binary, three roles
//!
//! Stands in for the real controller/worker/gateway chain in integration
//! tests. Speaks just enough of each role's HTTP surface for the
//! supervisor's readiness probes and the executor's chat requests, with
//! knobs for fault injection (delayed worker registration, a gateway that
//! fails its first N completion calls).

use anyhow::{anyhow, Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shared::{logging, process_info, process_warn, ProcessId, Role};

#[derive(Parser)]
#[command(name = "mockstack")]
#[command(about = "Mock controller/worker/gateway backend for harness tests")]
struct Args {
    /// Role to assume (controller, worker, gateway)
    #[arg(long)]
    role: String,

    /// Host to bind
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind
    #[arg(long)]
    port: u16,

    /// Model identifier this mock pretends to serve
    #[arg(long, default_value = "mock-model")]
    model: String,

    /// Controller port (worker and gateway only)
    #[arg(long)]
    controller_port: Option<u16>,

    /// Milliseconds to wait before the worker registers with the controller
    #[arg(long, default_value = "0")]
    register_delay_ms: u64,

    /// Gateway: number of initial completion requests to fail with 500
    #[arg(long, default_value = "0")]
    flaky: u32,
}

#[derive(Clone)]
struct ControllerState {
    registered: Arc<Mutex<Vec<String>>>,
}

#[derive(Clone)]
struct GatewayState {
    model: String,
    controller_url: String,
    http: reqwest::Client,
    remaining_failures: Arc<AtomicU32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let role: Role = args
        .role
        .parse()
        .map_err(|e: String| anyhow!(e))?;

    ProcessId::init_mock(role);
    logging::init_tracing_with_level(Some("info"));
    logging::log_startup(ProcessId::current(), &format!("mock {role} on port {}", args.port));

    let app = match role {
        Role::Controller => controller_app(),
        Role::Worker => {
            let controller_port = args
                .controller_port
                .context("worker requires --controller-port")?;
            spawn_registration(
                args.host.clone(),
                args.port,
                controller_port,
                args.model.clone(),
                args.register_delay_ms,
            );
            worker_app(args.model.clone())
        }
        Role::Gateway => {
            let controller_port = args
                .controller_port
                .context("gateway requires --controller-port")?;
            gateway_app(GatewayState {
                model: args.model.clone(),
                controller_url: format!("http://{}:{}", args.host, controller_port),
                http: reqwest::Client::new(),
                remaining_failures: Arc::new(AtomicU32::new(args.flaky)),
            })
        }
    };

    let listener = tokio::net::TcpListener::bind((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("binding {}:{}", args.host, args.port))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    logging::log_shutdown(ProcessId::current(), "mock role terminating");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(_) => return std::future::pending().await,
        };
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn controller_app() -> Router {
    let state = ControllerState {
        registered: Arc::new(Mutex::new(Vec::new())),
    };

    async fn register_worker(
        State(state): State<ControllerState>,
        Json(body): Json<Value>,
    ) -> StatusCode {
        let model = body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        process_info!(ProcessId::current(), "📝 Worker registered for {}", model);
        if let Ok(mut registered) = state.registered.lock() {
            if !registered.contains(&model) {
                registered.push(model);
            }
        }
        StatusCode::OK
    }

    async fn list_models(State(state): State<ControllerState>) -> Json<Value> {
        let models = state
            .registered
            .lock()
            .map(|registered| registered.clone())
            .unwrap_or_default();
        Json(json!({ "models": models }))
    }

    Router::new()
        .route("/register_worker", post(register_worker))
        .route("/list_models", post(list_models))
        .with_state(state)
}

fn worker_app(model: String) -> Router {
    async fn status(State(model): State<String>) -> Json<Value> {
        Json(json!({ "model_names": [model], "speed": 1, "queue_length": 0 }))
    }

    Router::new()
        .route("/worker_get_status", post(status))
        .with_state(model)
}

/// Registers the worker with the controller after the configured delay,
/// retrying until the controller answers
fn spawn_registration(host: String, port: u16, controller_port: u16, model: String, delay_ms: u64) {
    tokio::spawn(async move {
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        let client = reqwest::Client::new();
        let url = format!("http://{host}:{controller_port}/register_worker");
        let body = json!({
            "worker_name": format!("http://{host}:{port}"),
            "model": model,
        });
        loop {
            match client.post(&url).json(&body).send().await {
                Ok(response) if response.status().is_success() => {
                    process_info!(ProcessId::current(), "🔗 Registered with controller");
                    break;
                }
                _ => {
                    process_warn!(
                        ProcessId::current(),
                        "⏳ Controller not accepting registrations yet, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(300)).await;
                }
            }
        }
    });
}

fn gateway_app(state: GatewayState) -> Router {
    async fn models(State(state): State<GatewayState>) -> (StatusCode, Json<Value>) {
        let url = format!("{}/list_models", state.controller_url);
        match state.http.post(&url).send().await {
            Ok(response) if response.status().is_success() => {
                let models = response
                    .json::<Value>()
                    .await
                    .ok()
                    .and_then(|body| body.get("models").cloned())
                    .and_then(|m| m.as_array().cloned())
                    .unwrap_or_default();
                let data: Vec<Value> = models
                    .iter()
                    .map(|m| json!({ "id": m, "object": "model" }))
                    .collect();
                (StatusCode::OK, Json(json!({ "object": "list", "data": data })))
            }
            _ => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "controller unreachable" })),
            ),
        }
    }

    async fn chat_completions(
        State(state): State<GatewayState>,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        // Fault injection: fail the first N calls, then behave
        let remaining = state.remaining_failures.load(Ordering::SeqCst);
        if remaining > 0
            && state
                .remaining_failures
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            process_warn!(ProcessId::current(), "💥 Injected completion failure");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "injected failure" })),
            );
        }

        let prompt = body
            .get("messages")
            .and_then(Value::as_array)
            .and_then(|messages| {
                messages
                    .iter()
                    .rev()
                    .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))
            })
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .unwrap_or("");

        let text = format!("[mock {}] {}", state.model, prompt);
        let reply = json!({
            "id": "chatcmpl-mock",
            "object": "chat.completion",
            "model": state.model,
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": text },
                "finish_reason": "stop",
            }],
            "usage": {
                "prompt_tokens": prompt.len() / 4,
                "completion_tokens": text.len() / 4,
                "total_tokens": (prompt.len() + text.len()) / 4,
            },
        });
        (StatusCode::OK, Json(reply))
    }

    Router::new()
        .route("/v1/models", get(models))
        .route("/v1/chat/completions", post(chat_completions))
        .with_state(state)
}
