mod backoff;
mod config;
mod ipc;
mod llm;
mod observe;
mod queue;
mod runtime;
mod sandbox;
mod security;
#[cfg(test)]
mod test_support;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::backoff::Backoff;
use crate::config::Config;
use crate::ipc::dispatcher::Dispatcher;
use crate::observe::{EventSink, FanoutSink, JsonlSink, TracingSink};
use crate::queue::{GroupQueue, QueueSettings};
use crate::runtime::Runtime;
use crate::sandbox::process::SandboxLauncher;
use crate::sandbox::{Credentials, SessionContext};
use crate::security::{
    ApprovalBroker, KeywordClassifier, LlmRiskClassifier, RiskClassifier, SecurityGate, TaintRules,
};

fn print_help() {
    println!(
        "\
sandhost v{}

Runs LLM agents in sandbox processes and mediates what they may do.

USAGE:
    sandhost [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: config/sandhost.toml]

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

INPUT:
    Each line on stdin is either a JSON job
        {{\"workspace\": \"main\", \"payload\": \"...\", \"priority\": 0}}
    or an operator command (/approve, /deny, /pending, /status, /help).

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG              Log level filter for tracing
                          (e.g. debug, sandhost=debug,warn)
    ANTHROPIC_API_KEY     API key for the command classifier, when
                          [security.classifier] uses provider \"anthropic\"

EXAMPLES:
    sandhost                              # uses config/sandhost.toml
    sandhost /etc/sandhost/host.toml      # custom config path
    RUST_LOG=debug sandhost               # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

/// Returns once no job is running or waiting.
async fn wait_until_drained(queue: &GroupQueue) {
    let mut tick = tokio::time::interval(Duration::from_millis(500));
    loop {
        tick.tick().await;
        match queue.status().await {
            Ok(status) if status.running > 0 || status.queued.values().any(|n| *n > 0) => {}
            _ => return,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("sandhost v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sandhost=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/sandhost.toml".to_string());

    info!("Loading configuration from {config_path}");
    let config = Config::load(&config_path)?;
    let workspaces = config.resolve_workspaces();

    info!("Sandbox launcher: {}", config.sandbox.program);
    info!("Max concurrent sessions: {}", config.host.max_concurrent);
    info!(
        "Workspaces: {}",
        workspaces
            .iter()
            .map(|w| if w.admin { format!("{} (admin)", w.id) } else { w.id.clone() })
            .collect::<Vec<_>>()
            .join(", ")
    );

    // Observability
    let mut sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(TracingSink)];
    if let Some(path) = &config.host.audit_log {
        sinks.push(Arc::new(JsonlSink::open(path)?));
    }
    let sink: Arc<dyn EventSink> = Arc::new(FanoutSink::new(sinks));

    // Security gate
    let classifier: Arc<dyn RiskClassifier> = match &config.security.classifier {
        Some(classifier) => Arc::new(LlmRiskClassifier::new(llm::build_client(classifier)?)),
        None => Arc::new(KeywordClassifier),
    };
    info!("Classifier: {}", classifier.name());
    let (approval_tx, approval_rx) = mpsc::unbounded_channel();
    let approvals = Arc::new(
        ApprovalBroker::new(Duration::from_secs(config.security.approval_timeout_secs))
            .with_notifier(approval_tx),
    );
    let gate = Arc::new(SecurityGate::new(classifier, approvals.clone(), sink.clone()));
    let classifier_name = gate.classifier_name();

    // IPC handlers
    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
    let mut dispatcher = Dispatcher::new();
    let ids: HashSet<String> = workspaces.iter().map(|w| w.id.clone()).collect();
    ipc::handlers::register_builtin(&mut dispatcher, gate, ids, outbox_tx);
    info!("IPC handlers: {} registered", dispatcher.len());
    let handlers = dispatcher.handler_summaries();

    let ctx = SessionContext {
        launcher: Arc::new(SandboxLauncher::new(config.sandbox.clone())),
        dispatcher: Arc::new(dispatcher),
        sink,
        taint_rules: Arc::new(TaintRules::new(
            &config.security.untrusted_tools,
            &config.security.sensitive_tools,
        )),
        data_dir: config.host.data_dir.clone(),
        grace_period: config.host.grace_period(),
        ipc_poll_interval: config.host.ipc_poll_interval(),
    };
    let settings = QueueSettings {
        max_concurrent: config.host.max_concurrent,
        backoff: Backoff::new(
            Duration::from_secs(config.host.retry_initial_delay_secs),
            Duration::from_secs(config.host.retry_max_delay_secs),
            2,
            config.host.max_attempts,
        ),
    };
    let queue = GroupQueue::start(
        workspaces,
        Credentials::new(config.credentials.clone()),
        ctx,
        settings,
    );

    let runtime = Runtime::new(queue.clone(), approvals, classifier_name, handlers);
    let stdin = BufReader::new(tokio::io::stdin());

    let console = async {
        match runtime.run(stdin, tokio::io::stdout(), approval_rx, outbox_rx).await {
            Ok(()) => {
                info!("Waiting for queued jobs to finish (Ctrl-C to stop now)");
                wait_until_drained(&queue).await;
            }
            Err(e) => error!("Control loop error: {e}"),
        }
    };

    tokio::select! {
        _ = console => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    info!("Stopping sessions...");
    queue.shutdown().await;
    Ok(())
}
