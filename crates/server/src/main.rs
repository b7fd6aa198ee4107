// Copyright © 2026 Kirky.X
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use clap::Parser;
use std::time::Duration;
use stockpile_core::config::{Config, LoggingConfig};
use stockpile_server::{create_router, AppState};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "stockpile", version, about = "Two-tier warehouse cache service")]
struct Args {
    /// 配置文件路径，读取失败时回退到环境变量
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(filter)
        .with_file(logging.include_location)
        .with_line_number(logging.include_location);

    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let (config, file_error) = match Config::load_from_file(&args.config) {
        Ok(config) => (config, None),
        Err(e) => (
            Config::load_from_env().unwrap_or_else(|_| Config::default()),
            Some(e),
        ),
    };

    init_tracing(&config.logging);

    info!("Starting stockpile cache service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    if let Some(e) = file_error {
        warn!(
            "Could not load {}: {}, using environment/defaults",
            args.config, e
        );
    }

    let state = AppState::from_config(&config)?;

    let sweeper_cancel = CancellationToken::new();
    let sweeper = state.manager.l1().spawn_sweeper(
        Duration::from_secs(config.l1.sweep_interval_secs),
        sweeper_cancel.clone(),
    );

    if config.scheduler.enabled {
        state.scheduler.start();
    } else {
        info!("Scheduler disabled by configuration");
    }

    let addr = config.app.http_addr()?;
    let router = create_router(state.clone())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(RequestBodyLimitLayer::new(1024 * 1024))
        .layer(TraceLayer::new_for_http());

    info!("Starting HTTP server on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down cache service...");
    state.warmer.cancel();
    state.scheduler.stop().await;
    sweeper_cancel.cancel();
    if let Err(e) = sweeper.await {
        warn!("L1 sweeper ended abnormally: {}", e);
    }
    info!("Shutdown complete");

    Ok(())
}
