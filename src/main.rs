use std::env;
use std::time::Duration;

use tracing::{info, warn};

use cortex_parley::config::load_parley_config;
use cortex_parley::{api, AppState};

fn parse_port_from_args() -> Option<u16> {
    let mut args = env::args();
    while let Some(a) = args.next() {
        if a == "--port" {
            if let Some(v) = args.next() {
                if let Ok(p) = v.parse::<u16>() {
                    return Some(p);
                }
            }
        } else if let Some(rest) = a.strip_prefix("--port=") {
            if let Ok(p) = rest.parse::<u16>() {
                return Some(p);
            }
        }
    }
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tower_http=warn"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    info!("Starting cortex-parley control server");

    let config = load_parley_config();
    let port = parse_port_from_args().unwrap_or_else(|| config.resolve_port());
    let data_dir = config.resolve_data_dir();
    info!("Data directory: {}", data_dir.display());

    // Create HTTP client (Gemini calls go through this)
    let http_timeout = env::var("HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(60);
    let connect_timeout = env::var("HTTP_CONNECT_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(10);
    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(http_timeout))
        .connect_timeout(Duration::from_secs(connect_timeout))
        .build()?;

    let state = AppState::new(http_client, config);
    let ai = state.reply_gen.status();
    if ai.available {
        info!("AI replies enabled via {}", ai.model);
    } else {
        info!("No AI key configured — template replies active (set PARLEY_AI_API_KEY)");
    }

    let app = api::build_router(state.clone());

    let bind_addr = format!("0.0.0.0:{}", port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(l) => l,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Address already in use: {}. Stop the existing process or run with --port {} (or set PARLEY_PORT).",
                bind_addr,
                port + 1
            );
        }
        Err(e) => return Err(e.into()),
    };
    info!("Control server listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await?;

    Ok(())
}

async fn shutdown_signal(state: AppState) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).ok();
        let mut sigint = signal(SignalKind::interrupt()).ok();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                if let Some(ref mut s) = sigterm {
                    s.recv().await;
                } else {
                    futures::future::pending::<()>().await;
                }
            } => {},
            _ = async {
                if let Some(ref mut s) = sigint {
                    s.recv().await;
                } else {
                    futures::future::pending::<()>().await;
                }
            } => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    // Abort any active run and let its task close the browser before the
    // runtime goes away.
    let handle = {
        let mut slot = state.run_slot.lock().await;
        slot.active.take()
    };
    if let Some(h) = handle {
        let _ = h.abort.send(true);
        info!("Shutting down — waiting for the active run to wind down");
        if tokio::time::timeout(Duration::from_secs(15), h.task)
            .await
            .is_err()
        {
            warn!("Active run did not stop within 15s; exiting anyway");
        }
    }
}
