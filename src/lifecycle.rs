//! Process lifecycle: model loading and background polling at startup,
//! graceful drain at shutdown.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::ai::ModelManager;
use crate::error::Error;
use crate::messaging::{AlertHub, TelegramService};
use crate::streams::StreamRegistry;

/// Grace period for the shutdown drain.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

pub struct Lifecycle {
    models: Arc<ModelManager>,
    hub: Arc<AlertHub>,
    registry: Arc<StreamRegistry>,
    telegram: Option<Arc<TelegramService>>,
    shutdown_tx: watch::Sender<bool>,
    polling_task: Mutex<Option<JoinHandle<()>>>,
}

impl Lifecycle {
    pub fn new(
        models: Arc<ModelManager>,
        hub: Arc<AlertHub>,
        registry: Arc<StreamRegistry>,
        telegram: Option<Arc<TelegramService>>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            models,
            hub,
            registry,
            telegram,
            shutdown_tx,
            polling_task: Mutex::new(None),
        }
    }

    /// Load the models and start the optional bot polling loop. A model
    /// failure here is fatal to the process.
    pub fn startup(&self) -> Result<(), Error> {
        self.models.load()?;

        if let Some(telegram) = &self.telegram {
            let task = tokio::spawn(
                Arc::clone(telegram).run_polling(self.shutdown_tx.subscribe()),
            );
            *self.polling_task.lock().expect("polling lock poisoned") = Some(task);
        }

        Ok(())
    }

    /// Drain: stop polling, close alert channels, tear down every peer
    /// connection, then release the models. Bounded by the grace period.
    pub async fn shutdown(&self) {
        info!("shutting down");
        let _ = self.shutdown_tx.send(true);

        let drain = async {
            self.hub.close_all("server_shutdown").await;
            let torn_down = self.registry.teardown_all().await;
            info!("tore down {} active streams", torn_down);

            let task = self
                .polling_task
                .lock()
                .expect("polling lock poisoned")
                .take();
            if let Some(task) = task {
                // The poller exits at its next select point; don't wait for
                // a full long-poll cycle beyond the grace period.
                let abort = task.abort_handle();
                if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
                    warn!("polling task did not stop in time, aborting");
                    abort.abort();
                }
            }
        };

        if tokio::time::timeout(SHUTDOWN_DRAIN, drain).await.is_err() {
            warn!("shutdown drain deadline exceeded, cancelling remaining tasks");
        }

        self.models.cleanup();
        info!("shutdown complete");
    }
}
