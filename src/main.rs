use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use session_core::{SessionConfig, SessionCore, SessionEvent};

/// Small probe that exercises a session against a live API.
///
/// Credentials come from `SESSION_USERNAME` / `SESSION_PASSWORD`; every
/// command line argument is fetched as a path relative to the base URL.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            // Default to info level if RUST_LOG is not set
            if cfg!(debug_assertions) {
                "session_core=debug,session_probe=debug,info".into()
            } else {
                "info".into()
            }
        }))
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    info!("Session probe starting");

    let config = SessionConfig::load_default()
        .await
        .context("Failed to load session configuration")?;
    let core = SessionCore::builder(config)
        .build()
        .context("Failed to build session core")?;

    let mut notifications = core.events().subscribe();
    tokio::spawn(async move {
        while let Ok(notification) = notifications.recv().await {
            match &notification.event {
                SessionEvent::SessionExpired { message } => warn!("{}", message),
                event => info!(event = event.event_type(), "Session notification"),
            }
        }
    });

    if core.initialize().await {
        info!(user = ?core.session().user_name(), "Restored persisted session");
    }

    if let (Ok(username), Ok(password)) = (
        std::env::var("SESSION_USERNAME"),
        std::env::var("SESSION_PASSWORD"),
    ) {
        match core.session().login(&username, &password).await {
            Ok(identity) => info!(user = %identity.user_name(), roles = ?identity.roles, "Signed in"),
            Err(e) => error!(error = %e, code = %e.code(), "Sign in failed"),
        }
    }

    for path in std::env::args().skip(1) {
        match core.client().get(&path).await {
            Ok(response) => {
                info!(path = %path, status = response.status(), "Fetched");
                println!("{}", response.text());
            }
            Err(e) => error!(path = %path, error = %e, "Request failed"),
        }
    }

    let state = core.session().state();
    println!("{}", serde_json::to_string_pretty(&state)?);

    Ok(())
}
