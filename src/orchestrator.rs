// src/orchestrator.rs
use anyhow::{Context, Result};
use log::{error, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Settings;
use crate::connection::{
    ConnectionManager, ConnectionState, Connector, ManagerConfig, RECONNECT_FAILED_EVENT,
    Unsubscribe, WsConnector,
};
use crate::credentials::{CredentialProvider, FileCredentialStore, StaticCredential};
use crate::monitors::{JobStatusMonitor, PrintJobUpdate};

const JOB_CHANNEL_CAPACITY: usize = 100;

/// Wires the connection manager to the job-status monitor and keeps both
/// running until Ctrl+C.
pub struct Orchestrator {
    manager: Arc<ConnectionManager>,
    job_monitor: JobStatusMonitor,
    handles: Vec<JoinHandle<()>>,
    subscriptions: Vec<Unsubscribe>,
}

impl Orchestrator {
    pub fn new(manager: Arc<ConnectionManager>, job_monitor: JobStatusMonitor) -> Self {
        Self {
            manager,
            job_monitor,
            handles: Vec::new(),
            subscriptions: Vec::new(),
        }
    }

    /// Build the manager from settings using the WebSocket transport.
    /// `token` overrides the configured credential store.
    pub fn from_settings(settings: &Settings, token: Option<String>) -> Result<Self> {
        let config = ManagerConfig::try_from(&settings.realtime)
            .context("Invalid [realtime] settings")?;
        let credentials = credential_provider(settings, token);
        let connector: Arc<dyn Connector> = Arc::new(WsConnector);
        let manager = Arc::new(ConnectionManager::new(config, connector, credentials));

        Ok(Self::new(
            manager,
            JobStatusMonitor::new(settings.jobs.event.clone()),
        ))
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    fn handle_job_update(update: &PrintJobUpdate) {
        info!(
            "Print job {} on {}: {}{}",
            update.job_id,
            update.printer.as_deref().unwrap_or("unassigned printer"),
            update.status,
            update
                .message
                .as_deref()
                .map(|m| format!(" ({m})"))
                .unwrap_or_default()
        );
        if update.status.is_terminal() {
            info!("Print job {} finished", update.job_id);
        }
    }

    /// Subscribe the job monitor and connection watchers, then start the
    /// connection.
    pub fn setup(&mut self) -> Result<()> {
        info!("Setting up job status monitor...");

        let (job_tx, mut job_rx) = mpsc::channel::<PrintJobUpdate>(JOB_CHANNEL_CAPACITY);
        self.subscriptions
            .push(self.job_monitor.attach(&self.manager, job_tx));

        self.subscriptions.push(self.manager.subscribe(
            RECONNECT_FAILED_EVENT,
            |event| {
                error!(
                    "Realtime updates unavailable, reconnecting gave up: {}",
                    event.payload
                );
                Ok(())
            },
        ));

        let processor = tokio::spawn(async move {
            info!("Job update processor started");
            while let Some(update) = job_rx.recv().await {
                Self::handle_job_update(&update);
            }
            info!("Job update processor stopped");
        });
        self.handles.push(processor);

        let mut states = self.manager.watch_state();
        let watcher = tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = *states.borrow_and_update();
                match state {
                    ConnectionState::Authenticated => info!("Realtime: full functionality"),
                    ConnectionState::Connected | ConnectionState::Authenticating => {
                        info!("Realtime: partial functionality ({state})")
                    }
                    _ => warn!("Realtime: offline ({state})"),
                }
            }
        });
        self.handles.push(watcher);

        self.manager
            .start()
            .context("Failed to start realtime connection")?;
        Ok(())
    }

    pub async fn run(mut self) -> Result<()> {
        self.setup()?;
        info!("Realtime connection started. Press Ctrl+C to stop...");

        tokio::signal::ctrl_c().await?;
        info!("Shutdown signal received, closing realtime connection...");

        for subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
        self.manager.shutdown().await;

        // Unsubscribing released the job sender; the state watcher ends once
        // the manager is gone.
        drop(self.manager);

        let shutdown_timeout = tokio::time::Duration::from_secs(5);
        for handle in self.handles {
            if tokio::time::timeout(shutdown_timeout, handle).await.is_err() {
                error!("Timeout waiting for task to complete, forcing shutdown");
            }
        }

        info!("Realtime connection closed, shutting down gracefully");
        Ok(())
    }
}

fn credential_provider(settings: &Settings, token: Option<String>) -> Arc<dyn CredentialProvider> {
    if let Some(token) = token {
        return Arc::new(StaticCredential::new(token));
    }
    match settings.credentials.store_path.as_deref() {
        Some(path) => Arc::new(FileCredentialStore::with_key(
            path,
            settings.credentials.key.clone(),
        )),
        None => {
            info!("No credential store configured, connecting unauthenticated");
            Arc::new(StaticCredential::none())
        }
    }
}
