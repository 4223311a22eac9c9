use anyhow::Result;
use print_realtime::connection::ConnectionState;
use print_realtime::monitors::{JobStatus, JobStatusMonitor};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;

mod helpers;
use helpers::{Outcome, next_peer, setup_manager, states_until};

#[tokio::test(start_paused = true)]
async fn test_job_updates_are_forwarded_in_order() -> Result<()> {
    let (manager, _connector, mut peers) = setup_manager(vec![Outcome::Accept], None);
    let monitor = JobStatusMonitor::new("job_status");
    let (tx, mut rx) = mpsc::channel(16);
    let subscription = monitor.attach(&manager, tx);
    let mut states = manager.state_changes();

    manager.start()?;
    states_until(&mut states, ConnectionState::Connected).await;
    let peer = next_peer(&mut peers).await;

    peer.push("job_status", json!({ "jobId": 7, "status": "queued" }));
    peer.push("job_status", json!({ "status": "printing" })); // no id, skipped
    peer.push(
        "job_status",
        json!({ "jobId": 7, "status": "completed", "printer": "Lab 2" }),
    );

    let first = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await?
        .expect("channel closed");
    let second = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await?
        .expect("channel closed");

    assert_eq!(first.job_id, "7");
    assert_eq!(first.status, JobStatus::Queued);
    assert_eq!(second.status, JobStatus::Completed);
    assert!(second.status.is_terminal());
    assert_eq!(second.printer.as_deref(), Some("Lab 2"));

    // Unsubscribing releases the sender, closing the channel.
    subscription.unsubscribe();
    assert!(rx.recv().await.is_none());
    Ok(())
}
