use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use clap::Parser;
use conductor_core::Config;
use conductor_core::Router;
use conductor_core::exec;
use conductor_mcp_server::message_processor::MessageProcessor;
use conductor_mcp_server::message_processor::OutgoingMessage;
use conductor_mcp_server::tools::ToolRegistry;
use conductor_mcp_server::transport::FrameDecoder;
use conductor_mcp_server::transport::FramingMode;
use conductor_mcp_server::transport::encode_frame;
use conductor_protocol::JsonRpcMessage;
use conductor_protocol::JsonRpcNotification;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Stdio MCP server that delegates tasks to agent personas.
#[derive(Debug, Parser)]
#[command(name = "conductor-mcp-server", version)]
struct Cli {
    /// Directory holding agent definition files.
    #[arg(long, value_name = "DIR")]
    agents_dir: Option<PathBuf>,

    /// Executable invoked for each task.
    #[arg(long, value_name = "PROGRAM")]
    exec: Option<String>,

    /// Hard timeout for a single task execution, in seconds.
    #[arg(long, value_name = "SECONDS")]
    timeout_secs: Option<u64>,

    /// Mirror every file, including entries normally excluded as sensitive.
    #[arg(long)]
    mirror_all: bool,

    /// Emit diagnostic notifications and pretty-printed tool output.
    #[arg(long)]
    debug: bool,
}

fn build_config(cli: &Cli) -> Config {
    let base_cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let mut config = Config::from_env(base_cwd);
    if let Some(dir) = &cli.agents_dir {
        config.agents_dir = Some(dir.clone());
    }
    if let Some(exec) = &cli.exec {
        config.task_exec = exec.clone();
    }
    if let Some(secs) = cli.timeout_secs {
        config.exec_timeout = std::time::Duration::from_secs(secs);
    }
    config.mirror_everything |= cli.mirror_all;
    config.debug = cli.debug;
    config
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Stdout carries the protocol; every diagnostic goes to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = build_config(&cli);
    if !exec::task_exec_available(&config.task_exec) {
        warn!(
            exec = %config.task_exec,
            "task executable not found on PATH; delegations will fail until it is installed"
        );
    }

    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<OutgoingMessage>(128);

    // Output framing mirrors whatever the client spoke first.
    let framing = Arc::new(Mutex::new(FramingMode::LengthPrefixed));

    let debug_mode = config.debug;
    let router = if debug_mode {
        let notify_tx = outgoing_tx.clone();
        let notifier: Arc<conductor_core::audit::Notifier> =
            Arc::new(move |method: &str, params: serde_json::Value| {
                let notification = JsonRpcNotification::new(method, Some(params));
                if notify_tx
                    .try_send(OutgoingMessage::Notification(notification))
                    .is_err()
                {
                    debug!("outgoing channel full; dropping notification");
                }
            });
        Router::new(config).with_notifier(notifier)
    } else {
        Router::new(config)
    };

    let registry = ToolRegistry::new()?;
    let processor = Arc::new(MessageProcessor::new(
        Arc::new(router),
        registry,
        outgoing_tx.clone(),
        debug_mode,
    ));

    let writer_framing = Arc::clone(&framing);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = outgoing_rx.recv().await {
            let body = match &message {
                OutgoingMessage::Response(response) => serde_json::to_string(response),
                OutgoingMessage::Notification(notification) => {
                    serde_json::to_string(notification)
                }
            };
            let body = match body {
                Ok(body) => body,
                Err(e) => {
                    error!(error = %e, "failed to serialize outgoing message");
                    continue;
                }
            };
            let mode = *writer_framing.lock().unwrap_or_else(|e| e.into_inner());
            let frame = encode_frame(mode, &body);
            if stdout.write_all(&frame).await.is_err() {
                break;
            }
            if stdout.flush().await.is_err() {
                break;
            }
        }
    });

    info!("conductor mcp server listening on stdio");

    let mut stdin = tokio::io::stdin();
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; 8192];
    loop {
        let read = match stdin.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                error!(error = %e, "stdin read failed");
                break;
            }
        };
        for value in decoder.feed(&chunk[..read]) {
            if let Some(mode) = decoder.mode() {
                *framing.lock().unwrap_or_else(|e| e.into_inner()) = mode;
            }
            let message: JsonRpcMessage = match serde_json::from_value(value) {
                Ok(message) => message,
                Err(e) => {
                    debug!(error = %e, "discarding non-request message");
                    continue;
                }
            };
            let processor = Arc::clone(&processor);
            tokio::spawn(async move {
                processor.process(message).await;
            });
        }
    }

    // Dropping our sender closes the channel once in-flight tasks finish.
    drop(outgoing_tx);
    drop(processor);
    let _ = writer.await;
    Ok(())
}
