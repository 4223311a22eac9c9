// src/monitors/job_status.rs
use {
    anyhow::{Context, Result},
    chrono::{DateTime, Utc},
    log::{debug, info},
    serde::{Deserialize, Deserializer},
    serde_json::Value,
    std::fmt,
    tokio::sync::mpsc::{self, error::TrySendError},
};

use crate::connection::{ConnectionManager, InboundEvent, Unsubscribe};

/// Lifecycle of a print job as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum JobStatus {
    Queued,
    Printing,
    Completed,
    Failed,
    Cancelled,
    Other(String),
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl From<String> for JobStatus {
    fn from(raw: String) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "queued" | "pending" => Self::Queued,
            "printing" | "processing" => Self::Printing,
            "completed" | "done" => Self::Completed,
            "failed" | "error" => Self::Failed,
            "cancelled" | "canceled" => Self::Cancelled,
            _ => Self::Other(raw),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => f.write_str("queued"),
            Self::Printing => f.write_str("printing"),
            Self::Completed => f.write_str("completed"),
            Self::Failed => f.write_str("failed"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Other(raw) => f.write_str(raw),
        }
    }
}

// Job ids arrive as either numbers or strings
fn job_id_from_any<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(id) if !id.is_empty() => Ok(id),
        Value::Number(id) => Ok(id.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a job id, got {other}"
        ))),
    }
}

/// A status change pushed for one print job.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrintJobUpdate {
    #[serde(alias = "job_id", alias = "id", deserialize_with = "job_id_from_any")]
    pub job_id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub printer: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, alias = "updated_at")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Turns raw job-status events into [`PrintJobUpdate`]s.
#[derive(Debug, Clone)]
pub struct JobStatusMonitor {
    event: String,
}

impl JobStatusMonitor {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
        }
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    /// Subscribe to the job-status event and forward parsed updates.
    ///
    /// Updates are dropped (and reported as handler errors) when the
    /// receiver lags behind by more than the channel capacity.
    pub fn attach(
        &self,
        manager: &ConnectionManager,
        sender: mpsc::Sender<PrintJobUpdate>,
    ) -> Unsubscribe {
        let monitor = self.clone();
        info!("Watching '{}' for print job updates", self.event);
        manager.subscribe(&self.event, move |event| {
            let update = monitor.parse_update(event)?;
            debug!("Job {} is now {}", update.job_id, update.status);
            match sender.try_send(update) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(update)) => {
                    anyhow::bail!("job update channel full, dropped update for {}", update.job_id)
                }
                Err(TrySendError::Closed(_)) => anyhow::bail!("job update receiver closed"),
            }
        })
    }

    /// Parse the payload of a job-status event.
    pub fn parse_update(&self, event: &InboundEvent) -> Result<PrintJobUpdate> {
        if event.name != self.event {
            anyhow::bail!(
                "Expected '{}' event but got '{}'",
                self.event,
                event.name
            );
        }
        serde_json::from_value(event.payload.clone())
            .with_context(|| format!("Malformed '{}' payload: {}", self.event, event.payload))
    }
}
