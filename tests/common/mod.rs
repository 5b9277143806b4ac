//! Behaviour every transport must share, written once and run per backend.
//!
//! Each check takes a freshly installed transport whose clock is `clock`, so
//! lease windows, delays and expiration are driven without sleeping.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use leaseq::Error;
use leaseq::clock::{Clock, ManualClock};
use leaseq::config::QueueOptions;
use leaseq::model::{
    Failure, Headers, MessageId, MessageState, NewMessage, RemoveStatus, RequeueStatus,
};
use leaseq::serializer::HeaderSerializer;
use leaseq::transport::{Delivery, MessageHandle, ReceiveRequest, Received, Transport};
use uuid::Uuid;

pub const WINDOW: Duration = Duration::from_secs(60);

/// Options the shared checks assume: routes enabled, everything else default.
pub fn suite_options() -> QueueOptions {
    QueueOptions {
        enable_routes: true,
        ..Default::default()
    }
}

/// Queue name unique to one test run, for backends that outlive the test.
pub fn unique_queue(prefix: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{prefix}{}", &suffix[..12])
}

/// Serializer whose output cannot be read back, so every dequeue is poison.
pub struct UnreadableHeaders;

impl HeaderSerializer for UnreadableHeaders {
    fn serialize(&self, _headers: &Headers) -> leaseq::Result<Vec<u8>> {
        Ok(b"\x00not json".to_vec())
    }

    fn deserialize(&self, bytes: &[u8]) -> leaseq::Result<Headers> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

pub fn expect_message<H: std::fmt::Debug>(received: Received<H>) -> Delivery<H> {
    match received {
        Received::Message(delivery) => delivery,
        Received::Expired(id) => panic!("expected a message, got expired {id}"),
        Received::Poison { reason, .. } => panic!("expected a message, got poison: {reason}"),
        Received::Empty => panic!("expected a message, queue was empty"),
    }
}

pub async fn receive_untagged<T: Transport>(t: &T) -> Received<T::Handle> {
    t.receive(&ReceiveRequest::untagged()).await.unwrap()
}

pub async fn send_body<T: Transport>(t: &T, body: &str) -> MessageId {
    t.send(NewMessage::new(body)).await.unwrap().id
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

/// Concurrent receivers never get the same message twice.
pub async fn exclusive_delivery<T: Transport>(t: Arc<T>)
where
    T::Handle: std::fmt::Debug,
{
    let mut sent = HashSet::new();
    for i in 0..20 {
        sent.insert(send_body(&*t, &format!("m{i}")).await);
    }

    let mut workers = Vec::new();
    for _ in 0..4 {
        let t = Arc::clone(&t);
        workers.push(tokio::spawn(async move {
            let mut got = Vec::new();
            loop {
                match t.receive(&ReceiveRequest::untagged()).await.unwrap() {
                    Received::Message(delivery) => got.push(delivery.message.id),
                    Received::Empty => return got,
                    other => panic!("unexpected receive outcome: {}", describe(&other)),
                }
            }
        }));
    }

    let mut received = Vec::new();
    for worker in workers {
        received.extend(worker.await.unwrap());
    }
    let unique: HashSet<_> = received.iter().cloned().collect();
    assert_eq!(received.len(), unique.len(), "a message was delivered twice");
    assert_eq!(unique, sent);
    assert_eq!(t.counts().await.unwrap().working, 20);
}

fn describe<H>(received: &Received<H>) -> &'static str {
    match received {
        Received::Message(_) => "message",
        Received::Expired(_) => "expired",
        Received::Poison { .. } => "poison",
        Received::Empty => "empty",
    }
}

/// A leased message whose heartbeat goes stale returns to pending.
pub async fn stale_lease_returns_to_pending<T: Transport>(t: Arc<T>, clock: ManualClock)
where
    T::Handle: std::fmt::Debug,
{
    let id = send_body(&*t, "lease").await;
    let delivery = expect_message(receive_untagged(&*t).await);
    let lease = delivery.handle.lease().clone();
    assert_eq!(delivery.message.id, id);
    assert_eq!(t.state_of(&id).await.unwrap(), Some(MessageState::Working));

    assert_eq!(t.reset_heartbeats(WINDOW, 50).await.unwrap(), 0);
    clock.advance(WINDOW + Duration::from_secs(1));
    assert_eq!(t.reset_heartbeats(WINDOW, 50).await.unwrap(), 1);
    assert_eq!(t.state_of(&id).await.unwrap(), Some(MessageState::Pending));

    // The old holder has lost the lease.
    assert!(!t.heartbeat(&lease).await.unwrap());
    let again = expect_message(receive_untagged(&*t).await);
    assert_eq!(again.message.id, id);
}

/// Heartbeats keep a lease alive past the original window.
pub async fn heartbeat_extends_lease<T: Transport>(t: Arc<T>, clock: ManualClock)
where
    T::Handle: std::fmt::Debug,
{
    let id = send_body(&*t, "beat").await;
    let mut delivery = expect_message(receive_untagged(&*t).await);
    let lease = delivery.handle.lease().clone();

    clock.advance(WINDOW / 2);
    assert!(t.heartbeat(&lease).await.unwrap());
    clock.advance(WINDOW / 2 + Duration::from_secs(1));
    assert_eq!(t.reset_heartbeats(WINDOW, 50).await.unwrap(), 0);
    assert_eq!(t.state_of(&id).await.unwrap(), Some(MessageState::Working));

    assert_eq!(t.commit(&mut delivery.handle).await.unwrap(), RemoveStatus::Removed);
    assert!(!t.heartbeat(&lease).await.unwrap(), "heartbeat renewed a committed message");
}

/// Commit deletes the message; removing it again is a no-op.
pub async fn commit_then_remove_is_idempotent<T: Transport>(t: Arc<T>)
where
    T::Handle: std::fmt::Debug,
{
    let id = send_body(&*t, "done").await;
    let mut delivery = expect_message(receive_untagged(&*t).await);
    assert_eq!(t.commit(&mut delivery.handle).await.unwrap(), RemoveStatus::Removed);
    assert_eq!(t.commit(&mut delivery.handle).await.unwrap(), RemoveStatus::NotFound);
    assert_eq!(t.remove(&id).await.unwrap(), RemoveStatus::NotFound);
    assert_eq!(t.state_of(&id).await.unwrap(), None);
    assert!(receive_untagged(&*t).await.is_empty());
}

/// Immediate rollback makes the message visible again; a stale handle
/// cannot roll it back a second time.
pub async fn rollback_requeues<T: Transport>(t: Arc<T>)
where
    T::Handle: std::fmt::Debug,
{
    let id = send_body(&*t, "again").await;
    let mut delivery = expect_message(receive_untagged(&*t).await);
    assert_eq!(
        t.rollback(&mut delivery.handle, None).await.unwrap(),
        RequeueStatus::Requeued
    );
    assert_eq!(t.state_of(&id).await.unwrap(), Some(MessageState::Pending));

    let mut again = expect_message(receive_untagged(&*t).await);
    assert_eq!(again.message.id, id);
    assert_eq!(t.remove(&id).await.unwrap(), RemoveStatus::Removed);
    assert_eq!(
        t.rollback(&mut again.handle, None).await.unwrap(),
        RequeueStatus::NotFound
    );
}

/// Delayed sends and delayed rollbacks stay invisible until promoted.
pub async fn delayed_messages_wait_for_promotion<T: Transport>(t: Arc<T>, clock: ManualClock)
where
    T::Handle: std::fmt::Debug,
{
    let id = t
        .send(NewMessage::new("later").delay(Duration::from_secs(5)))
        .await
        .unwrap()
        .id;
    assert_eq!(t.state_of(&id).await.unwrap(), Some(MessageState::Delayed));
    assert!(receive_untagged(&*t).await.is_empty());
    assert_eq!(t.promote_delayed(50).await.unwrap(), 0);

    clock.advance(Duration::from_secs(6));
    assert_eq!(t.promote_delayed(50).await.unwrap(), 1);
    let mut delivery = expect_message(receive_untagged(&*t).await);
    assert_eq!(delivery.message.id, id);

    assert_eq!(
        t.rollback(&mut delivery.handle, Some(Duration::from_secs(10)))
            .await
            .unwrap(),
        RequeueStatus::Requeued
    );
    assert_eq!(t.state_of(&id).await.unwrap(), Some(MessageState::Delayed));
    assert!(receive_untagged(&*t).await.is_empty());

    clock.advance(Duration::from_secs(11));
    assert_eq!(t.promote_delayed(50).await.unwrap(), 1);
    assert_eq!(expect_message(receive_untagged(&*t).await).message.id, id);
}

/// Unclaimed expired messages are purged; a message that expires while
/// pending and is then dequeued is reported as expired.
pub async fn expired_messages_are_never_delivered<T: Transport>(t: Arc<T>, clock: ManualClock)
where
    T::Handle: std::fmt::Debug,
{
    let soon = clock.now() + TimeDelta::seconds(5);
    let purged = t.send(NewMessage::new("stale").expire_at(soon)).await.unwrap().id;
    let keep = send_body(&*t, "fresh").await;

    clock.advance(Duration::from_secs(6));
    assert_eq!(t.purge_expired(50).await.unwrap(), 1);
    assert_eq!(t.state_of(&purged).await.unwrap(), None);
    assert_eq!(t.state_of(&keep).await.unwrap(), Some(MessageState::Pending));
    assert_eq!(t.remove(&keep).await.unwrap(), RemoveStatus::Removed);

    let at = clock.now() + TimeDelta::seconds(5);
    let id = t.send(NewMessage::new("late").expire_at(at)).await.unwrap().id;
    clock.advance(Duration::from_secs(6));
    match receive_untagged(&*t).await {
        Received::Expired(expired) => assert_eq!(expired, id),
        other => panic!("expected expired, got {}", describe(&other)),
    }
    assert_eq!(t.remove(&id).await.unwrap(), RemoveStatus::Removed);
}

/// A job name is refused while active and for a repeated scheduled time.
pub async fn job_names_are_deduplicated<T: Transport>(t: Arc<T>, clock: ManualClock)
where
    T::Handle: std::fmt::Debug,
{
    let first_run = clock.now();
    t.send(NewMessage::new("run").job("nightly", first_run))
        .await
        .unwrap();

    let second_run = first_run + TimeDelta::hours(24);
    let err = t
        .send(NewMessage::new("run").job("nightly", second_run))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::JobAlreadyExists { ref job_name } if job_name == "nightly"));

    let mut delivery = expect_message(receive_untagged(&*t).await);
    assert_eq!(t.commit(&mut delivery.handle).await.unwrap(), RemoveStatus::Removed);

    let err = t
        .send(NewMessage::new("run").job("nightly", first_run))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::JobAlreadyExists { .. }));

    t.send(NewMessage::new("run").job("nightly", second_run))
        .await
        .unwrap();
}

/// Untagged receives see only untagged messages; routed receives see only
/// their routes.
pub async fn routes_are_isolated<T: Transport>(t: Arc<T>)
where
    T::Handle: std::fmt::Debug,
{
    let eu = t.send(NewMessage::new("eu").route("eu")).await.unwrap().id;
    let plain = send_body(&*t, "plain").await;

    let got = expect_message(receive_untagged(&*t).await);
    assert_eq!(got.message.id, plain);
    assert!(receive_untagged(&*t).await.is_empty());

    let us_only = ReceiveRequest::routes(vec!["us".into()]);
    assert!(t.receive(&us_only).await.unwrap().is_empty());

    let both = ReceiveRequest::routes(vec!["us".into(), "eu".into()]);
    let mut routed = expect_message(t.receive(&both).await.unwrap());
    assert_eq!(routed.message.id, eu);
    assert_eq!(routed.message.route.as_deref(), Some("eu"));

    // Rollback puts it back on its own route.
    t.rollback(&mut routed.handle, None).await.unwrap();
    assert!(receive_untagged(&*t).await.is_empty());
    assert_eq!(expect_message(t.receive(&both).await.unwrap()).message.id, eu);
}

/// Batches return one result per message, in input order.
pub async fn batch_send_keeps_order<T: Transport>(t: Arc<T>)
where
    T::Handle: std::fmt::Debug,
{
    let correlation: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
    let messages = vec![
        NewMessage::new("a").correlation_id(correlation[0]),
        NewMessage::new("b").route("eu").correlation_id(correlation[1]),
        NewMessage::new("c").correlation_id(correlation[2]),
    ];
    let results = t.send_batch(messages).await.unwrap();
    assert_eq!(results.len(), 3);
    for (result, expected) in results.iter().zip(correlation) {
        assert_eq!(result.as_ref().unwrap().correlation_id, expected);
    }
    let counts = t.counts().await.unwrap();
    assert_eq!(counts.pending, 3);

    let first = expect_message(receive_untagged(&*t).await);
    assert_eq!(first.message.body, b"a");
}

/// Retries are counted per exception type, and an errored message leaves
/// every active index.
pub async fn failures_reach_the_error_store<T: Transport>(t: Arc<T>, clock: ManualClock)
where
    T::Handle: std::fmt::Debug,
{
    let id = send_body(&*t, "bad").await;
    let mut delivery = expect_message(receive_untagged(&*t).await);

    assert_eq!(t.record_failure(&id, "Timeout").await.unwrap(), Some(1));
    assert_eq!(t.record_failure(&id, "Timeout").await.unwrap(), Some(2));
    assert_eq!(t.record_failure(&id, "Parse").await.unwrap(), Some(1));

    let failure = Failure::new("Timeout", "gave up");
    assert_eq!(
        t.move_to_error(&mut delivery.handle, &failure).await.unwrap(),
        RemoveStatus::Removed
    );
    assert_eq!(t.state_of(&id).await.unwrap(), Some(MessageState::Error));
    let counts = t.counts().await.unwrap();
    assert_eq!((counts.working, counts.error), (0, 1));
    assert!(receive_untagged(&*t).await.is_empty());

    // Errored messages are no longer active: they take no new failures and
    // only the error purge deletes them.
    assert_eq!(t.record_failure(&id, "Timeout").await.unwrap(), None);
    assert_eq!(t.remove(&id).await.unwrap(), RemoveStatus::NotFound);
    assert_eq!(t.state_of(&id).await.unwrap(), Some(MessageState::Error));
    assert_eq!(t.counts().await.unwrap().error, 1);

    clock.advance(Duration::from_secs(10));
    assert_eq!(t.purge_errors(Duration::from_secs(60), 50).await.unwrap(), 0);
    assert_eq!(t.purge_errors(Duration::from_secs(5), 50).await.unwrap(), 1);
    assert_eq!(t.state_of(&id).await.unwrap(), None);
    assert_eq!(t.record_failure(&id, "Timeout").await.unwrap(), None);
}

/// A message removed by the sweep cannot be moved to the error store by its
/// old holder.
pub async fn move_to_error_loses_to_the_sweep<T: Transport>(t: Arc<T>, clock: ManualClock)
where
    T::Handle: std::fmt::Debug,
{
    let id = send_body(&*t, "race").await;
    let mut delivery = expect_message(receive_untagged(&*t).await);
    clock.advance(WINDOW + Duration::from_secs(1));
    assert_eq!(t.reset_heartbeats(WINDOW, 50).await.unwrap(), 1);

    let failure = Failure::new("Timeout", "too slow");
    assert_eq!(
        t.move_to_error(&mut delivery.handle, &failure).await.unwrap(),
        RemoveStatus::NotFound
    );
    assert_eq!(t.state_of(&id).await.unwrap(), Some(MessageState::Pending));
}

/// Once the sweep has handed a message to a new consumer, nothing the old
/// handle does reaches it.
pub async fn stale_handle_cannot_touch_a_new_lease<T: Transport>(t: Arc<T>, clock: ManualClock)
where
    T::Handle: std::fmt::Debug,
{
    let id = send_body(&*t, "contested").await;
    let mut stale = expect_message(receive_untagged(&*t).await);
    clock.advance(WINDOW + Duration::from_secs(1));
    assert_eq!(t.reset_heartbeats(WINDOW, 50).await.unwrap(), 1);

    let mut current = expect_message(receive_untagged(&*t).await);
    assert_eq!(current.message.id, id);
    assert_ne!(stale.handle.lease(), current.handle.lease());

    assert!(!t.heartbeat(stale.handle.lease()).await.unwrap());
    assert_eq!(
        t.rollback(&mut stale.handle, None).await.unwrap(),
        RequeueStatus::NotFound
    );
    assert_eq!(
        t.rollback(&mut stale.handle, Some(Duration::from_secs(5)))
            .await
            .unwrap(),
        RequeueStatus::NotFound
    );
    let failure = Failure::new("Timeout", "finished late");
    assert_eq!(
        t.move_to_error(&mut stale.handle, &failure).await.unwrap(),
        RemoveStatus::NotFound
    );
    assert_eq!(t.commit(&mut stale.handle).await.unwrap(), RemoveStatus::NotFound);
    assert_eq!(t.state_of(&id).await.unwrap(), Some(MessageState::Working));
    assert_eq!(t.counts().await.unwrap().error, 0);

    assert!(t.heartbeat(current.handle.lease()).await.unwrap());
    assert_eq!(t.commit(&mut current.handle).await.unwrap(), RemoveStatus::Removed);
    assert_eq!(t.state_of(&id).await.unwrap(), None);
}

/// Working messages past their expiration do not use up the purge limit.
pub async fn purge_expired_skips_working_messages<T: Transport>(t: Arc<T>, clock: ManualClock)
where
    T::Handle: std::fmt::Debug,
{
    let soon = clock.now() + TimeDelta::seconds(5);
    let first = t.send(NewMessage::new("busy1").expire_at(soon)).await.unwrap().id;
    let second = t.send(NewMessage::new("busy2").expire_at(soon)).await.unwrap().id;
    let idle = t
        .send(NewMessage::new("idle").expire_at(soon + TimeDelta::seconds(1)))
        .await
        .unwrap()
        .id;

    let mut busy = Vec::new();
    for expected in [&first, &second] {
        let delivery = expect_message(receive_untagged(&*t).await);
        assert_eq!(&delivery.message.id, expected);
        busy.push(delivery);
    }
    clock.advance(Duration::from_secs(10));

    assert_eq!(t.purge_expired(1).await.unwrap(), 1);
    assert_eq!(t.state_of(&idle).await.unwrap(), None);
    assert_eq!(t.purge_expired(1).await.unwrap(), 0);
    for mut delivery in busy {
        let id = delivery.message.id.clone();
        assert_eq!(t.state_of(&id).await.unwrap(), Some(MessageState::Working));
        assert_eq!(t.commit(&mut delivery.handle).await.unwrap(), RemoveStatus::Removed);
    }
}

/// Receiving by id takes exactly that message.
pub async fn receive_by_id<T: Transport>(t: Arc<T>)
where
    T::Handle: std::fmt::Debug,
{
    let _first = send_body(&*t, "one").await;
    let second = send_body(&*t, "two").await;
    let got = expect_message(t.receive(&ReceiveRequest::message(second.clone())).await.unwrap());
    assert_eq!(got.handle.id(), &second);
    assert_eq!(got.message.body, b"two");
    assert!(
        t.receive(&ReceiveRequest::message(second))
            .await
            .unwrap()
            .is_empty()
    );
}

/// Unreadable headers surface as poison and can be routed to the error store.
pub async fn unreadable_headers_are_poison<T: Transport>(t: Arc<T>) {
    let id = send_body(&*t, "poison").await;
    let mut handle = match receive_untagged(&*t).await {
        Received::Poison { handle, .. } => handle,
        other => panic!("expected poison, got {}", describe(&other)),
    };
    assert_eq!(handle.id(), &id);
    let failure = Failure::poison("headers");
    assert_eq!(t.move_to_error(&mut handle, &failure).await.unwrap(), RemoveStatus::Removed);
    assert_eq!(t.state_of(&id).await.unwrap(), Some(MessageState::Error));
}
