//! # enroll
//!
//! Server binary: loads settings, wires the CAS authenticator and portal
//! client into the control service, and serves the HTTP/WebSocket surface
//! until Ctrl-C or an allowed `POST /api/shutdown`.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use enroll_core::logging::{LogFormat, init_subscriber};
use enroll_portal::{CasAuthenticator, PortalHttpClient};
use enroll_runtime::EnrollService;
use enroll_server::{EnrollServer, ServerConfig};
use enroll_settings::{EnrollSettings, init_settings, load_settings_from_path, settings_path};
use tracing::{info, warn};

/// Course enrollment service.
#[derive(Parser, Debug)]
#[command(name = "enroll", about = "Course enrollment service", version)]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 to auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (defaults to `~/.enroll/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log filter when `RUST_LOG` is unset (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn settings_file(&self) -> PathBuf {
        self.settings.clone().unwrap_or_else(settings_path)
    }

    /// Fold command-line overrides into loaded settings.
    fn apply(&self, settings: &mut EnrollSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.json_logs {
            settings.logging.json = true;
        }
    }
}

fn load(cli: &Cli) -> Result<EnrollSettings> {
    let path = cli.settings_file();
    let mut settings = load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    cli.apply(&mut settings);
    settings.validate().context("Invalid settings")?;
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load(&cli)?;

    let format = if settings.logging.json {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };
    init_subscriber(&settings.logging.level, format);
    if init_settings(settings.clone()).is_err() {
        warn!("global settings were already initialized");
    }

    let metrics = enroll_server::metrics::install_recorder();

    let auth = Arc::new(CasAuthenticator::new(&settings.portal));
    let portal =
        Arc::new(PortalHttpClient::new(&settings.portal).context("Failed to build portal client")?);
    let service = Arc::new(EnrollService::new(auth, portal, &settings));

    let server = EnrollServer::new(
        ServerConfig::from(&settings.server),
        Arc::clone(&service),
        metrics,
    );
    let reaper = service.spawn_reaper(server.shutdown().token());
    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    info!(portal = %settings.portal.base_url, "enroll listening on http://{addr}");

    let remote = server.shutdown().token();
    tokio::select! {
        signal = tokio::signal::ctrl_c() => signal.context("Failed to listen for ctrl-c")?,
        () = remote.cancelled() => info!("Shutdown requested remotely"),
    }

    info!("Shutting down...");
    let destroyed = service.shutdown();
    server
        .shutdown()
        .graceful_shutdown(vec![handle, reaper], None)
        .await;
    info!(destroyed, "Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_flags_keeps_settings() {
        let cli = Cli::parse_from(["enroll"]);
        let mut settings = EnrollSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 8000);
        assert!(!settings.logging.json);
    }

    #[test]
    fn flags_override_settings() {
        let cli = Cli::parse_from([
            "enroll",
            "--host",
            "0.0.0.0",
            "--port",
            "9000",
            "--log-level",
            "debug",
            "--json-logs",
        ]);
        let mut settings = EnrollSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.logging.level, "debug");
        assert!(settings.logging.json);
    }

    #[test]
    fn settings_flag_selects_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server":{"port":7001},"retry":{"maxAttempts":5}}"#).unwrap();

        let cli = Cli::parse_from(["enroll", "--settings", path.to_str().unwrap()]);
        let settings = load(&cli).unwrap();
        assert_eq!(settings.server.port, 7001);
        assert_eq!(settings.retry.max_attempts, 5);
    }

    #[test]
    fn invalid_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();

        let cli = Cli::parse_from(["enroll", "--settings", path.to_str().unwrap()]);
        let err = load(&cli).unwrap_err();
        assert!(err.to_string().contains("Failed to load settings"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"retry":{"maxAttempts":0}}"#).unwrap();

        let cli = Cli::parse_from(["enroll", "--settings", path.to_str().unwrap()]);
        assert!(load(&cli).is_err());
    }
}
