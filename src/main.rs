use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use analytics_courier::host::{ManualLifecycleMonitor, ManualNetworkMonitor, TokioClock};
use analytics_courier::store::FileDataStore;
use analytics_courier::transport::ReqwestTransport;
use analytics_courier::types::Event;
use analytics_courier::{Courier, CourierConfig, HostCapabilities};
use tokio::runtime::Handle;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_STATE_DIR: &str = "./courier-state";

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "analytics_courier=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let Some(metric) = args.next() else {
        eprintln!("usage: analytics-courier <metric> [email]");
        return ExitCode::from(2);
    };
    let email = args.next();

    match run(metric, email).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Courier failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(metric: String, email: Option<String>) -> Result<(), Box<dyn Error>> {
    let config = CourierConfig::from_env()?;
    let state_dir = std::env::var("COURIER_STATE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_STATE_DIR));
    info!(state_dir = %state_dir.display(), base_url = %config.base_url, "Starting courier");

    let host = HostCapabilities {
        store: Arc::new(FileDataStore::open(state_dir)?),
        clock: Arc::new(TokioClock::new(Handle::current())),
        network: Arc::new(ManualNetworkMonitor::new(true)),
        lifecycle: Arc::new(ManualLifecycleMonitor::new()),
    };
    let transport = ReqwestTransport::new(&config)?;
    let courier = Courier::start(config, host, transport)?;

    if let Some(email) = email {
        courier.set_email(email);
    }
    let request = courier.track(Event::new(metric));
    info!(request_id = %request.id, "Event queued");
    courier.flush();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut poll = tokio::time::interval(Duration::from_millis(200));
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!(queued = courier.queue_len(), "Interrupted, leaving remaining requests for next run");
                break;
            }
            _ = poll.tick() => {
                if courier.queue_len() == 0 {
                    info!("Queue drained");
                    break;
                }
            }
        }
    }

    courier.shutdown().await;
    Ok(())
}
