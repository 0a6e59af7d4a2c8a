//! Ordering and idempotence properties of the pause/queue machinery.

use std::sync::Arc;
use std::time::Duration;

use muxcrew::controller::profiles::AgentTunables;
use muxcrew::controller::{AgentController, ControllerState};
use muxcrew::utils::retry::RetryPolicy;
use mux_session::{ScriptedBackend, SentItem, SessionSpec};

fn stub_pair() -> (AgentController, Arc<ScriptedBackend>) {
    let backend = Arc::new(ScriptedBackend::running(SessionSpec::new(
        "stub", "stub", "/tmp",
    )));
    let controller = AgentController::new("stub", Box::new(backend.clone()), AgentTunables::stub())
        .with_send_retry(RetryPolicy::new(2, Duration::ZERO, Duration::ZERO, 2.0));
    (controller, backend)
}

/// Extract the delivered command texts, in order.
fn delivered_texts(backend: &ScriptedBackend) -> Vec<String> {
    backend
        .sent()
        .into_iter()
        .filter_map(|item| match item {
            SentItem::Text(text) => Some(text),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn submission_order_is_preserved_across_pause_resume() {
    let (mut controller, backend) = stub_pair();

    controller.send_command("one", true).await.unwrap();

    controller.pause_automation("manual");
    assert!(!controller.send_command("two", true).await.unwrap());
    assert!(!controller.send_command("three", true).await.unwrap());

    controller.resume_automation(true).await.unwrap();
    controller.send_command("four", true).await.unwrap();

    assert_eq!(delivered_texts(&backend), vec!["one", "two", "three", "four"]);
}

#[tokio::test]
async fn pause_resume_without_flush_is_a_noop_for_the_queue() {
    let (mut controller, backend) = stub_pair();

    controller.pause_automation("manual");
    controller.send_command("held", true).await.unwrap();

    controller.resume_automation(false).await.unwrap();
    assert_eq!(controller.pending_count(), 1);
    assert!(backend.sent().is_empty());

    // A later send drains the queue first, so order still holds.
    controller.send_command("fresh", true).await.unwrap();
    assert_eq!(delivered_texts(&backend), vec!["held", "fresh"]);
    assert_eq!(controller.pending_count(), 0);
}

#[tokio::test]
async fn queued_commands_survive_send_failures_at_queue_head() {
    let (mut controller, backend) = stub_pair();

    controller.pause_automation("manual");
    controller.send_command("fragile", true).await.unwrap();

    // Both retry attempts fail, so the drain stops and the command stays
    // at the head of the queue.
    backend.fail_next_sends(2);
    let result = controller.resume_automation(true).await;
    assert!(result.is_err());
    assert_eq!(controller.pending_count(), 1);

    // The next drain succeeds and nothing was lost or duplicated.
    let flushed = controller.drain_pending().await.unwrap();
    assert_eq!(flushed, 1);
    assert_eq!(delivered_texts(&backend), vec!["fragile"]);
}

#[tokio::test]
async fn manual_attach_detach_cycle() {
    let (mut controller, backend) = stub_pair();

    backend.push_clients(vec!["/dev/pts/9".to_string()]);
    assert!(!controller.send_command("queued while attached", true).await.unwrap());
    assert_eq!(controller.state(), ControllerState::Paused);

    backend.push_clients(vec![]);
    controller.update_manual_control_state().await.unwrap();
    assert_eq!(controller.state(), ControllerState::Busy);
    assert_eq!(
        delivered_texts(&backend),
        vec!["queued while attached"]
    );

    // Re-attach pauses again without losing anything.
    backend.push_clients(vec!["/dev/pts/9".to_string()]);
    assert!(!controller.send_command("second visit", true).await.unwrap());
    assert_eq!(controller.pending_count(), 1);
}

#[tokio::test]
async fn repeated_health_failures_flip_health_state() {
    let (mut controller, backend) = stub_pair();
    backend.set_exists(false);

    for _ in 0..3 {
        controller
            .perform_health_check(muxcrew::health::HealthCheckKind::SessionAlive)
            .await;
    }
    assert!(!controller.health().is_healthy());

    backend.set_exists(true);
    controller
        .perform_health_check(muxcrew::health::HealthCheckKind::SessionAlive)
        .await;
    assert!(controller.health().is_healthy());
}
