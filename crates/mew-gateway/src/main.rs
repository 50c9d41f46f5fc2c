// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use anyhow::{Context, Result};
use clap::Parser;
use mew_config::SpaceConfig;
use mew_gateway::{AppState, GatewayConfig, build_app};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mew-gateway", version, about = "Multi-party message gateway")]
struct Args {
    /// Bind address.
    #[arg(long, default_value = "127.0.0.1:8700")]
    bind: String,

    /// Space descriptor TOML files; one space is created per file.
    #[arg(long = "space", required = true)]
    spaces: Vec<PathBuf>,

    /// Directory for per-space history and decision logs.
    #[arg(long, default_value = ".mew/data")]
    data_dir: PathBuf,

    /// Reject envelopes carrying unknown top-level fields.
    #[arg(long)]
    strict: bool,

    /// Deliver broadcasts back to their sender.
    #[arg(long)]
    echo_to_self: bool,

    /// Enable request/response debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("mew=debug,mew_gateway=debug")
    } else {
        EnvFilter::new("mew=info,mew_gateway=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tokio::fs::create_dir_all(&args.data_dir)
        .await
        .with_context(|| format!("create data dir {}", args.data_dir.display()))?;

    let state = Arc::new(AppState::new(GatewayConfig {
        strict_envelopes: args.strict,
        echo_to_self: args.echo_to_self,
        ..GatewayConfig::default()
    }));

    for path in &args.spaces {
        let descriptor = SpaceConfig::load(path)
            .with_context(|| format!("load space descriptor {}", path.display()))?;
        let warnings = descriptor
            .validate()
            .with_context(|| format!("validate space descriptor {}", path.display()))?;
        for warning in warnings {
            warn!(space = %descriptor.space.id, ?warning, "space descriptor warning");
        }
        state
            .spaces
            .create_space(descriptor, &args.data_dir)
            .await
            .context("create space")?;
    }

    let app = build_app(state.clone());

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    info!(
        bind = %args.bind,
        data_dir = %args.data_dir.display(),
        "mew-gateway listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await
        .context("serve")
}

/// Wait for ctrl-c, then give outbound queues a moment to drain and flush
/// the history logs before the listener stops.
async fn shutdown_signal(state: Arc<AppState>) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    info!("shutdown requested, draining");
    tokio::time::sleep(state.config.drain_grace.min(std::time::Duration::from_secs(5))).await;
    state.spaces.flush_all().await;
}
