use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use edgectl_config::{FileConfigSource, load_settings};
use edgectl_core::{ConfigStore, Controller, DeviceGateway, MemoryLink, SimulatedGateway};

use crate::cli::{GlobalOpts, RunArgs};
use crate::commands::{config_file, open_queue};
use crate::error::CliError;

pub async fn handle(args: &RunArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let path = config_file(global);
    let config = load_settings(&path)?.to_controller_config()?;
    let store = Arc::new(ConfigStore::load(Box::new(FileConfigSource::new(&path))));

    // Field bus drivers plug in behind `DeviceGateway`; the built-in one
    // serves `address.initial` values and records writes.
    let gateway: Arc<dyn DeviceGateway> =
        Arc::new(SimulatedGateway::from_devices(store.current().devices()));

    // Offline runs keep the event sender alive so the transport loop
    // stays up with no broker behind it.
    let (controller, _offline_events) = if args.offline {
        warn!("offline mode: outbound messages will only be queued");
        let queue = Arc::new(open_queue(&config.queue).await?);
        let (events_tx, events_rx) = mpsc::channel(1);
        let link = Arc::new(MemoryLink::new());
        let controller = Controller::new(config, store, gateway, link, events_rx, queue);
        (controller, Some(events_tx))
    } else {
        (Controller::connect(config, store, gateway).await?, None)
    };

    if let Err(e) = controller.start().await {
        controller.shutdown().await;
        return Err(e.into());
    }

    let outcome = tokio::select! {
        () = shutdown_signal() => {
            info!("shutdown requested");
            Ok(())
        }
        reason = controller.fatal() => Err(CliError::Fatal { reason }),
    };

    controller.shutdown().await;
    outcome
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "could not listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
