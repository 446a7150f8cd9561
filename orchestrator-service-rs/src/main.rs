// Diagnostic consensus orchestrator service.
//
// Reads one JSON request per line on stdin and writes one JSON response per
// line on stdout. A line is either a diagnostic request or a command:
//
//   {"tenant_id":"acme","issue":"DNS lookups failing","priority":"high"}
//   {"command":"health"}
//   {"command":"metrics"}
//
// Responses carry the request id, since requests are served concurrently and
// may complete out of order.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use config_rs::OrchestratorConfig;
use error_handling::{init_logging, CircuitState, Error, ErrorKind, RetryPolicy};
use metrics_exporter_prometheus::PrometheusBuilder;
use orchestrator_service::{
    AgentPool, AnalysisAgent, Collaborators, DiagnoseOptions, HealthMonitor, HeuristicAgent, Notification,
    Orchestrator, OrchestratorContext,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared_types::{ConsensusResult, DiagnosticRequest, FlagSeverity};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const CONFIG_ENV: &str = "DIAG_CONFIG";
const ALERT_DESTINATION: &str = "operations";

#[derive(Debug, Deserialize)]
struct InboundRequest {
    #[serde(flatten)]
    request: DiagnosticRequest,
    #[serde(default)]
    deadline_ms: Option<u64>,
    #[serde(default)]
    client_ip: Option<IpAddr>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Command {
    Health,
    Metrics,
}

#[derive(Debug, Deserialize)]
struct CommandLine {
    command: Command,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum Response {
    Ok {
        request_id: Uuid,
        result: Box<ConsensusResult>,
    },
    Error {
        request_id: Option<Uuid>,
        kind: ErrorKind,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        fingerprint: Option<String>,
    },
    Report {
        command: &'static str,
        report: Value,
    },
}

impl Response {
    fn error(request_id: Option<Uuid>, err: &Error) -> Self {
        Response::Error {
            request_id,
            kind: err.kind(),
            message: err.to_string(),
            retry_after_ms: err.retry_after().map(|d| d.as_millis() as u64),
            fingerprint: err.fingerprint().map(str::to_string),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok())
        .map(PathBuf::from);
    let config = OrchestratorConfig::load(config_path.as_deref()).context("failed to load configuration")?;

    let _log_guard = init_logging(&config.logging).context("failed to initialize logging")?;

    if let Some(addr) = config.metrics.listen_addr()? {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus exporter")?;
        info!(%addr, "Prometheus exporter listening");
    }

    let ctx = OrchestratorContext::initialize(config, Collaborators::default())
        .await
        .context("failed to initialize orchestrator context")?;

    let mut pool = AgentPool::new(Arc::clone(&ctx.breaker), ctx.config.agents.call_timeout());
    for agent in HeuristicAgent::builtin() {
        let weight = ctx.config.agents.weight_for(agent.capability());
        pool.register(Arc::new(agent), weight)?;
    }
    let pool = Arc::new(pool);

    let monitor = HealthMonitor::new(Arc::clone(&ctx), HealthMonitor::standard_probes(&ctx, &pool));
    let health_task = monitor.spawn();
    let alert_task = tokio::spawn(forward_breaker_alerts(Arc::clone(&ctx)));

    let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&ctx), pool));
    let retry = Arc::new(RetryPolicy::new("diagnose", Some(ctx.config.retry.to_retry_config())));

    info!(
        instance_id = %ctx.instance_id,
        agents = orchestrator.pool().len(),
        degraded_cache = ctx.cache.is_degraded(),
        "Orchestrator service ready"
    );

    serve(orchestrator, retry).await?;

    ctx.shutdown();
    if let Err(err) = health_task.await {
        warn!(error = %err, "Health monitor task ended abnormally");
    }
    alert_task.abort();
    info!("Orchestrator service stopped");
    Ok(())
}

async fn serve(orchestrator: Arc<Orchestrator>, retry: Arc<RetryPolicy>) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel::<Response>(256);

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(response) = rx.recv().await {
            let mut line = match serde_json::to_vec(&response) {
                Ok(line) => line,
                Err(err) => {
                    error!(error = %err, "Failed to serialize response");
                    continue;
                }
            };
            line.push(b'\n');
            if let Err(err) = stdout.write_all(&line).await {
                error!(error = %err, "Failed to write response");
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tasks = Vec::new();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, draining in-flight requests");
                None
            }
        };
        let Some(line) = line else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(err) => {
                let _ = tx.send(Response::error(None, &Error::from(err))).await;
                continue;
            }
        };

        if value.get("command").is_some() {
            let response = match serde_json::from_value::<CommandLine>(value) {
                Ok(CommandLine { command }) => report(&orchestrator, command),
                Err(err) => Response::error(None, &Error::invalid_request(err.to_string())),
            };
            let _ = tx.send(response).await;
            continue;
        }

        let inbound = match serde_json::from_value::<InboundRequest>(value) {
            Ok(inbound) => inbound,
            Err(err) => {
                let _ = tx.send(Response::error(None, &Error::invalid_request(err.to_string()))).await;
                continue;
            }
        };

        let orchestrator = Arc::clone(&orchestrator);
        let retry = Arc::clone(&retry);
        let tx = tx.clone();
        tasks.push(tokio::spawn(async move {
            let response = handle(&orchestrator, &retry, inbound).await;
            let _ = tx.send(response).await;
        }));
    }

    for task in tasks {
        let _ = task.await;
    }
    drop(tx);
    let _ = writer.await;
    Ok(())
}

async fn handle(orchestrator: &Orchestrator, retry: &RetryPolicy, inbound: InboundRequest) -> Response {
    let request_id = inbound.request.request_id;
    let mut options = DiagnoseOptions {
        client_ip: inbound.client_ip,
        ..Default::default()
    };
    if let Some(ms) = inbound.deadline_ms {
        options = options.with_deadline(Duration::from_millis(ms));
    }

    debug!(%request_id, tenant = %inbound.request.tenant_id, "Request received");
    match orchestrator
        .diagnose_with_retry(inbound.request, options, retry)
        .await
    {
        Ok(result) => Response::Ok {
            request_id,
            result: Box::new(result),
        },
        Err(err) => Response::error(Some(request_id), &err),
    }
}

fn report(orchestrator: &Orchestrator, command: Command) -> Response {
    let (name, report) = match command {
        Command::Health => ("health", serde_json::to_value(orchestrator.health())),
        Command::Metrics => ("metrics", serde_json::to_value(orchestrator.metrics())),
    };
    match report {
        Ok(report) => Response::Report { command: name, report },
        Err(err) => Response::error(None, &Error::from(err)),
    }
}

/// Alerts operations whenever a dependency's breaker opens
async fn forward_breaker_alerts(ctx: Arc<OrchestratorContext>) {
    let mut transitions = ctx.breaker.subscribe();
    loop {
        match transitions.recv().await {
            Ok(transition) if transition.to == CircuitState::Open => {
                let notification = Notification {
                    severity: FlagSeverity::High,
                    message: format!(
                        "Circuit for dependency '{}' opened (was {})",
                        transition.dependency, transition.from
                    ),
                    destination: ALERT_DESTINATION.to_string(),
                };
                ctx.collaborators.notify(notification, Duration::from_secs(5)).await;
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Breaker alert forwarder lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
