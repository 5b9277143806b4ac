//! Shared transport behaviour against the in-process backend.

mod common;

use std::sync::Arc;

use leaseq::backend::MemoryTransport;
use leaseq::clock::ManualClock;

fn transport() -> (Arc<MemoryTransport>, ManualClock) {
    let clock = ManualClock::starting_now();
    let t = MemoryTransport::new("suite", common::suite_options())
        .unwrap()
        .with_clock(Arc::new(clock.clone()));
    (Arc::new(t), clock)
}

#[tokio::test]
async fn exclusive_delivery() {
    let (t, _) = transport();
    common::exclusive_delivery(t).await;
}

#[tokio::test]
async fn stale_lease_returns_to_pending() {
    let (t, clock) = transport();
    common::stale_lease_returns_to_pending(t, clock).await;
}

#[tokio::test]
async fn heartbeat_extends_lease() {
    let (t, clock) = transport();
    common::heartbeat_extends_lease(t, clock).await;
}

#[tokio::test]
async fn commit_then_remove_is_idempotent() {
    let (t, _) = transport();
    common::commit_then_remove_is_idempotent(t).await;
}

#[tokio::test]
async fn rollback_requeues() {
    let (t, _) = transport();
    common::rollback_requeues(t).await;
}

#[tokio::test]
async fn delayed_messages_wait_for_promotion() {
    let (t, clock) = transport();
    common::delayed_messages_wait_for_promotion(t, clock).await;
}

#[tokio::test]
async fn expired_messages_are_never_delivered() {
    let (t, clock) = transport();
    common::expired_messages_are_never_delivered(t, clock).await;
}

#[tokio::test]
async fn job_names_are_deduplicated() {
    let (t, clock) = transport();
    common::job_names_are_deduplicated(t, clock).await;
}

#[tokio::test]
async fn routes_are_isolated() {
    let (t, _) = transport();
    common::routes_are_isolated(t).await;
}

#[tokio::test]
async fn batch_send_keeps_order() {
    let (t, _) = transport();
    common::batch_send_keeps_order(t).await;
}

#[tokio::test]
async fn failures_reach_the_error_store() {
    let (t, clock) = transport();
    common::failures_reach_the_error_store(t, clock).await;
}

#[tokio::test]
async fn move_to_error_loses_to_the_sweep() {
    let (t, clock) = transport();
    common::move_to_error_loses_to_the_sweep(t, clock).await;
}

#[tokio::test]
async fn stale_handle_cannot_touch_a_new_lease() {
    let (t, clock) = transport();
    common::stale_handle_cannot_touch_a_new_lease(t, clock).await;
}

#[tokio::test]
async fn purge_expired_skips_working_messages() {
    let (t, clock) = transport();
    common::purge_expired_skips_working_messages(t, clock).await;
}

#[tokio::test]
async fn receive_by_id() {
    let (t, _) = transport();
    common::receive_by_id(t).await;
}

#[tokio::test]
async fn unreadable_headers_are_poison() {
    let t = MemoryTransport::new("poison", common::suite_options())
        .unwrap()
        .with_serializer(Arc::new(common::UnreadableHeaders));
    common::unreadable_headers_are_poison(Arc::new(t)).await;
}

#[tokio::test]
async fn subscription_wakes_on_send() {
    use leaseq::model::NewMessage;
    use leaseq::transport::{Subscription, Transport};
    use std::time::Duration;

    let (t, _) = transport();
    let mut subscription = t.subscribe().await.unwrap();
    assert!(!subscription.wait(Duration::from_millis(20)).await.unwrap());
    t.send(NewMessage::new("wake")).await.unwrap();
    assert!(subscription.wait(Duration::from_secs(1)).await.unwrap());
}
