//! Voicelink Binary - Service-Einstieg
//!
//! Lädt die Konfiguration aus der Umgebung, startet den Service und fährt
//! ihn bei SIGINT/SIGTERM geordnet herunter (erst Anruf-Ressourcen, dann
//! die Protokollverbindungen).

use std::sync::Arc;
use voicelink::config::ServiceConfig;
use voicelink::Service;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env ist optional; echte Umgebung gewinnt
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("voicelink=info".parse()?),
        )
        .init();

    tracing::info!("============================================================");
    tracing::info!("  VOICELINK: SIP Gateway + Voice-AI Bridge");
    tracing::info!("============================================================");

    let config = ServiceConfig::from_env();
    let service = Service::new(config);

    Arc::clone(&service).start().await?;

    // Auf SIGINT oder SIGTERM warten
    wait_for_shutdown_signal().await;

    service.shutdown().await;
    Ok(())
}

/// Blockiert bis SIGINT (Ctrl-C) oder SIGTERM eintrifft
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::warn!("Could not install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT"),
            _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Received Ctrl-C");
    }
}
