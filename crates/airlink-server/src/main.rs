//! Airlink host server entry point.
//!
//! Loads the TOML configuration, applies command-line overrides, builds the
//! selected transport and runs the session manager until Ctrl+C.
//!
//! # Usage
//!
//! ```text
//! airlink-server [OPTIONS]
//!
//! Options:
//!   --config     <PATH>             Config file [default: platform config dir]
//!   --transport  <direct|relay>     Transport to run
//!   --port       <PORT>             Direct transport listen port
//!   --password   <SECRET>           Shared secret clients must present
//!   --relay-url  <URL>              Relay endpoint
//! ```
//!
//! # Environment variable overrides
//!
//! | Variable             | Description                          |
//! |----------------------|--------------------------------------|
//! | `AIRLINK_CONFIG`     | Config file path                     |
//! | `AIRLINK_TRANSPORT`  | `direct` or `relay`                  |
//! | `AIRLINK_PORT`       | Direct transport listen port         |
//! | `AIRLINK_PASSWORD`   | Shared secret                        |
//! | `AIRLINK_RELAY_URL`  | Relay endpoint                       |
//! | `RUST_LOG`           | Log filter; wins over `log_level`    |
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ AppConfig            -- file + CLI overrides
//!  └─ Transport            -- DirectTransport or RelayTransport
//!  └─ UploadReassembler    -- stages uploaded files
//!  └─ SessionManager       -- handshake, keepalive, routing
//!       └─ LoggingHost     -- business logic stand-in
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use airlink_core::protocol::messages::SendResultCode;
use airlink_core::protocol::upload::Destination;
use airlink_core::{SessionId, StopReason};
use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use airlink_server::application::session_manager::{
    MessageHandler, SessionManager, StateReporter,
};
use airlink_server::application::transport::Transport;
use airlink_server::application::upload::{FileSender, UploadReassembler};
use airlink_server::infrastructure::network::direct::DirectTransport;
use airlink_server::infrastructure::network::relay::RelayTransport;
use airlink_server::infrastructure::storage::config::{
    self, AppConfig, TransportKind,
};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Airlink host server.
///
/// Every option overrides the matching key from the config file.
#[derive(Debug, Parser)]
#[command(
    name = "airlink-server",
    about = "Host server bridging remote clients to the local messaging system",
    version
)]
struct Cli {
    /// Path to the TOML config file.  Defaults to the platform config dir.
    #[arg(long, env = "AIRLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Transport to run: `direct` or `relay`.
    #[arg(long, env = "AIRLINK_TRANSPORT")]
    transport: Option<TransportKind>,

    /// TCP port for the direct transport.
    #[arg(long, env = "AIRLINK_PORT")]
    port: Option<u16>,

    /// Shared secret clients must present during the handshake.
    #[arg(long, env = "AIRLINK_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// WebSocket URL of the relay.
    #[arg(long, env = "AIRLINK_RELAY_URL")]
    relay_url: Option<String>,
}

impl Cli {
    /// Loads the config file and applies the command-line overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or parsed.
    fn into_app_config(self) -> anyhow::Result<AppConfig> {
        let mut cfg = match &self.config {
            Some(path) => config::load_config_from(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => config::load_config().context("failed to load config")?,
        };
        self.apply_overrides(&mut cfg);
        Ok(cfg)
    }

    fn apply_overrides(self, cfg: &mut AppConfig) {
        if let Some(transport) = self.transport {
            cfg.server.transport = transport;
        }
        if let Some(port) = self.port {
            cfg.direct.port = port;
        }
        if let Some(password) = self.password {
            cfg.security.password = Some(password);
        }
        if let Some(url) = self.relay_url {
            cfg.relay.url = Some(url);
        }
    }
}

// ── Host collaborators ────────────────────────────────────────────────────────

/// Business-logic stand-in that logs what it is given.
///
/// Completed uploads are left in place and reported as sent.
struct LoggingHost;

impl MessageHandler for LoggingHost {
    fn on_session_open(&self, session: SessionId) {
        info!("session {session}: ready");
    }

    fn on_session_close(&self, session: SessionId) {
        info!("session {session}: gone");
    }

    fn on_message(
        &self,
        session: SessionId,
        message_type: i32,
        payload: Vec<u8>,
        was_encrypted_in_transit: bool,
    ) {
        debug!(
            "session {session}: message type {message_type}, {} bytes (encrypted: {was_encrypted_in_transit})",
            payload.len()
        );
    }
}

impl StateReporter for LoggingHost {
    fn on_transport_started(&self) {
        info!("server is accepting connections");
    }

    fn on_transport_paused(&self, reason: &StopReason) {
        warn!("server paused, retrying: {reason}");
    }

    fn on_transport_stopped(&self, reason: &StopReason) {
        info!("server stopped: {reason}");
    }
}

#[async_trait]
impl FileSender for LoggingHost {
    async fn send_file(
        &self,
        destination: &Destination,
        path: &Path,
    ) -> (SendResultCode, Option<String>) {
        info!("file ready for {destination:?}: {}", path.display());
        (SendResultCode::Ok, None)
    }
}

fn build_transport(cfg: &AppConfig) -> anyhow::Result<Arc<dyn Transport>> {
    let transport: Arc<dyn Transport> = match cfg.server.transport {
        TransportKind::Direct => Arc::new(DirectTransport::new(
            cfg.direct_config().context("invalid [direct] section")?,
        )),
        TransportKind::Relay => Arc::new(RelayTransport::new(
            cfg.relay_config().context("invalid [relay] section")?,
        )),
    };
    Ok(transport)
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = cli.into_app_config()?;

    // `RUST_LOG` wins; otherwise the configured level applies.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&cfg.server.log_level)),
        )
        .init();

    info!("Airlink server starting ({} transport)", cfg.server.transport);

    let transport = build_transport(&cfg)?;
    let host = Arc::new(LoggingHost);

    let upload_config = cfg.upload_config();
    tokio::fs::create_dir_all(&upload_config.directory)
        .await
        .with_context(|| {
            format!(
                "failed to create upload directory {}",
                upload_config.directory.display()
            )
        })?;
    let (uploads, outcomes) = UploadReassembler::new(upload_config, host.clone());

    let manager = Arc::new(
        SessionManager::new(cfg.session_config(), transport, host.clone(), host)
            .with_uploads(Arc::new(uploads), outcomes),
    );

    let mut event_loop = manager
        .start()
        .await
        .context("failed to start transport")?;

    info!("Airlink server ready.  Press Ctrl-C to exit.");

    // The event loop also ends on its own when the transport stops for good.
    let finished = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                tracing::error!("failed to listen for Ctrl+C signal: {e}");
            }
            info!("shutdown signal received");
            manager.stop().await;
            event_loop.await
        }
        finished = &mut event_loop => finished,
    };
    if let Err(e) = finished {
        warn!("session manager task ended abnormally: {e}");
    }

    info!("Airlink server stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
