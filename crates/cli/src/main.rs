use anyhow::{Context, Result, bail};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use worker::{V8Engine, WorkerOptions};

const USAGE: &str = "usage: eventing-worker <app_name> <port>";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(app_name), Some(port)) = (args.next(), args.next()) else {
        bail!(USAGE);
    };
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid orchestrator port {:?}", port))?;
    // Loopback unless EVENTING_HOST says otherwise
    let host = std::env::var("EVENTING_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let addr = format!("{}:{}", host, port);

    let options = WorkerOptions::from_env();
    tracing::info!(
        "eventing worker for {} (queue {}, timer queue {}, batch {})",
        app_name,
        options.event_queue_capacity,
        options.timer_queue_capacity,
        options.batch_window
    );

    transport::connect_and_serve(&addr, options, V8Engine::new)
        .await
        .with_context(|| format!("serving orchestrator at {}", addr))?;

    tracing::info!("{} worker exiting", app_name);
    Ok(())
}
