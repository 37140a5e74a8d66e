//! Binary entry point: loads configuration, constructs the `App`
//! object, starts its background loops, and blocks until shutdown.
//!
//! HTTP routing sits outside this core — the binary that
//! actually serves requests wires an HTTP framework's request/response
//! types into `limiter_service::middleware`'s `HeaderSink`/`Action`
//! seam and calls `App::decisioner.decide` per request. This `main`
//! only proves the application object starts, resolves one decision
//! end-to-end against a live Redis, and shuts down cleanly.

use std::time::Duration;

use limiter_core::{extract_identity, IdentitySources};
use limiter_service::app::App;
use limiter_service::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = std::env::var("RATE_LIMIT_CONFIG_FILE").ok();
    let config = AppConfig::load(config_path.as_deref())?;

    let app = App::connect(config).await?;
    app.start().await;

    tracing::info!("rate limiter core running; Ctrl-C to stop");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = demo_tick(&app) => {}
    }

    app.stop();
    Ok(())
}

/// Exercises one decision per second against the identity
/// `acme`/`alice`/`/api/demo` so an operator can watch the application
/// object work without standing up an HTTP front end. Not a substitute
/// for one — see the module doc.
async fn demo_tick(app: &App) {
    let sources = IdentitySources {
        tenant_header: Some("acme"),
        user_header: Some("alice"),
        raw_path: Some("/api/demo"),
        ..Default::default()
    };
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let Some(identity) = extract_identity(&sources) else {
            continue;
        };
        match app.decisioner.decide(&identity).await {
            Ok(outcome) => tracing::debug!(?outcome, "demo decision"),
            Err(e) => tracing::warn!(error = %e, "demo decision failed"),
        }
    }
}
