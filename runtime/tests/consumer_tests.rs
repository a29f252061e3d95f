//! Consumer loop against the in-memory broker.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

mod common;

use common::{Harness, encode};
use engagement_core::environment::Clock;
use engagement_core::event::{
    CourseId, ENGAGEMENT_CONSUMER_GROUP, ENGAGEMENT_TOPIC, EngagementEvent, LessonCompleted,
    LessonId, LessonViewed, UserId,
};
use engagement_core::event_bus::{EventPublisher, TopicPartition};
use engagement_core::store::{Enrollment, EnrollmentStatus};
use engagement_runtime::{
    ConsumerError, ConsumerRuntime, ConsumerStats, EngagementProducer, shutdown_channel,
};
use engagement_testing::{InMemoryBroker, InMemoryConsumer};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const POLL: Duration = Duration::from_millis(20);

type RunHandle = JoinHandle<(ConsumerRuntime<InMemoryConsumer>, Result<ConsumerStats, ConsumerError>)>;

fn spawn(mut runtime: ConsumerRuntime<InMemoryConsumer>) -> RunHandle {
    tokio::spawn(async move {
        let result = runtime.run().await;
        (runtime, result)
    })
}

/// Poll `check` until it holds or a second passes.
async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(check(), "condition not reached in time");
}

#[tokio::test]
async fn end_to_end_view_completes_lesson_and_recomputes_enrollment() {
    let h = Harness::new();
    let user = UserId::new(1);
    let course = CourseId::new(5);
    h.store
        .add_course(course, &[LessonId::new(10), LessonId::new(11)]);
    h.store
        .put_enrollment(Enrollment::active(user, course, h.clock.now()));

    let broker = InMemoryBroker::new(3);
    let producer = EngagementProducer::new(Arc::new(broker.clone()), Arc::new(h.clock.clone()));
    assert!(
        producer
            .publish_lesson_view(LessonViewed {
                user_id: user,
                lesson_id: LessonId::new(10),
                course_id: Some(course),
                viewed_seconds: 540,
                lesson_duration: Some(600),
            })
            .await
    );

    let (source, rebalances) =
        broker.consumer(ENGAGEMENT_TOPIC, ENGAGEMENT_CONSUMER_GROUP, &[0, 1, 2]);
    let (trigger, shutdown) = shutdown_channel();
    let runtime = ConsumerRuntime::new(source, rebalances, h.dispatcher(), shutdown)
        .with_poll_timeout(POLL);
    let handle = spawn(runtime);

    let store = h.store.clone();
    eventually(|| store.progress(user, LessonId::new(10)).is_some()).await;
    trigger.trigger();
    let (runtime, result) = handle.await.unwrap();

    let progress = h.store.progress(user, LessonId::new(10)).unwrap();
    assert_eq!(progress.watched_seconds, 540);
    assert!(progress.is_completed);

    let enrollment = h.store.enrollment(user, course).unwrap();
    assert_eq!(enrollment.progress_percentage, 50);
    assert_eq!(enrollment.status, EnrollmentStatus::Active);

    let stats = result.unwrap();
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.rebalances, 1);
    assert_eq!(runtime.assigned_partitions().len(), 3);
}

#[tokio::test]
async fn bad_messages_do_not_stop_the_stream() {
    let h = Harness::new();
    let broker = InMemoryBroker::new(1);
    broker
        .publish(ENGAGEMENT_TOPIC, Some("user_1"), b"not json at all")
        .await
        .unwrap();
    broker
        .publish(
            ENGAGEMENT_TOPIC,
            Some("user_1"),
            br#"{"event_type":"lesson_viewed","lesson_id":10,"viewed_seconds":5}"#,
        )
        .await
        .unwrap();
    broker
        .publish(
            ENGAGEMENT_TOPIC,
            Some("user_1"),
            br#"{"event_type":"unknown_thing","user_id":1}"#,
        )
        .await
        .unwrap();
    let valid = encode(EngagementEvent::LessonCompleted(LessonCompleted {
        user_id: UserId::new(1),
        lesson_id: LessonId::new(10),
        course_id: None,
    }));
    broker
        .publish(ENGAGEMENT_TOPIC, Some("user_1"), &valid)
        .await
        .unwrap();

    let (source, rebalances) = broker.consumer(ENGAGEMENT_TOPIC, "group", &[0]);
    let (trigger, shutdown) = shutdown_channel();
    let handle = spawn(
        ConsumerRuntime::new(source, rebalances, h.dispatcher(), shutdown).with_poll_timeout(POLL),
    );

    let store = h.store.clone();
    eventually(|| store.progress(UserId::new(1), LessonId::new(10)).is_some()).await;
    trigger.trigger();
    let (_, result) = handle.await.unwrap();

    let stats = result.unwrap();
    assert_eq!(stats.dropped, 3);
    assert_eq!(stats.processed, 1);
    assert!(
        h.store
            .progress(UserId::new(1), LessonId::new(10))
            .unwrap()
            .is_completed
    );
}

#[tokio::test]
async fn replayed_completion_is_idempotent() {
    let h = Harness::new();
    let (user, course, lessons) = h.course_with_enrollment(2);
    let broker = InMemoryBroker::new(1);
    let payload = encode(EngagementEvent::LessonCompleted(LessonCompleted {
        user_id: user,
        lesson_id: lessons[0],
        course_id: Some(course),
    }));
    broker
        .publish(ENGAGEMENT_TOPIC, Some("user_1"), &payload)
        .await
        .unwrap();

    let (source, rebalances) = broker.consumer(ENGAGEMENT_TOPIC, "group", &[0]);
    let (trigger, shutdown) = shutdown_channel();
    let handle = spawn(
        ConsumerRuntime::new(source, rebalances, h.dispatcher(), shutdown).with_poll_timeout(POLL),
    );

    let store = h.store.clone();
    eventually(|| store.enrollment(user, course).is_some_and(|e| e.progress_percentage == 50)).await;
    let once = (
        h.store.progress(user, lessons[0]).unwrap(),
        h.store.enrollment(user, course).unwrap(),
    );

    // Simulate a crash before the offset commit: the message is read again
    broker.rewind("group", ENGAGEMENT_TOPIC, 0, 0);
    tokio::time::sleep(POLL * 5).await;
    trigger.trigger();
    let (_, result) = handle.await.unwrap();

    assert_eq!(result.unwrap().processed, 2);
    let twice = (
        h.store.progress(user, lessons[0]).unwrap(),
        h.store.enrollment(user, course).unwrap(),
    );
    assert_eq!(once, twice);
}

#[tokio::test]
async fn consumers_on_disjoint_partitions_lose_no_updates() {
    let h = Harness::new();
    let broker = InMemoryBroker::new(2);
    let users: Vec<UserId> = (1..=40).map(UserId::new).collect();
    let lessons: Vec<LessonId> = (100..105).map(LessonId::new).collect();

    for user in &users {
        for lesson in &lessons {
            let payload = encode(EngagementEvent::LessonCompleted(LessonCompleted {
                user_id: *user,
                lesson_id: *lesson,
                course_id: None,
            }));
            broker
                .publish(ENGAGEMENT_TOPIC, Some(&format!("user_{user}")), &payload)
                .await
                .unwrap();
        }
    }

    let mut handles = Vec::new();
    let mut triggers = Vec::new();
    for partition in [0, 1] {
        let (source, rebalances) =
            broker.consumer(ENGAGEMENT_TOPIC, ENGAGEMENT_CONSUMER_GROUP, &[partition]);
        let (trigger, shutdown) = shutdown_channel();
        triggers.push(trigger);
        handles.push(spawn(
            ConsumerRuntime::new(source, rebalances, h.dispatcher(), shutdown)
                .with_poll_timeout(POLL),
        ));
    }

    let store = h.store.clone();
    let expected: Vec<(UserId, LessonId)> = users
        .iter()
        .flat_map(|u| lessons.iter().map(move |l| (*u, *l)))
        .collect();
    eventually(|| {
        expected
            .iter()
            .all(|(u, l)| store.progress(*u, *l).is_some_and(|p| p.is_completed))
    })
    .await;

    for trigger in &triggers {
        trigger.trigger();
    }
    let mut total = 0;
    for handle in handles {
        let (runtime, result) = handle.await.unwrap();
        let stats = result.unwrap();
        assert!(stats.processed > 0, "both partitions should carry users");
        assert_eq!(runtime.assigned_partitions().len(), 1);
        total += stats.processed;
    }
    assert_eq!(total, (users.len() * lessons.len()) as u64);
}

#[tokio::test]
async fn transport_errors_are_logged_and_polling_continues() {
    let h = Harness::new();
    let broker = InMemoryBroker::new(1);
    broker.inject_transport_errors(2);
    let payload = encode(EngagementEvent::LessonCompleted(LessonCompleted {
        user_id: UserId::new(1),
        lesson_id: LessonId::new(10),
        course_id: None,
    }));
    broker
        .publish(ENGAGEMENT_TOPIC, Some("user_1"), &payload)
        .await
        .unwrap();

    let (source, rebalances) = broker.consumer(ENGAGEMENT_TOPIC, "group", &[0]);
    let (trigger, shutdown) = shutdown_channel();
    let handle = spawn(
        ConsumerRuntime::new(source, rebalances, h.dispatcher(), shutdown)
            .with_poll_timeout(POLL)
            .with_transport_backoff(Duration::from_millis(1)),
    );

    let store = h.store.clone();
    eventually(|| store.progress(UserId::new(1), LessonId::new(10)).is_some()).await;
    trigger.trigger();
    let (_, result) = handle.await.unwrap();

    let stats = result.unwrap();
    assert_eq!(stats.transport_errors, 2);
    assert_eq!(stats.processed, 1);
}

#[tokio::test]
async fn rebalance_updates_assigned_partitions() {
    let h = Harness::new();
    let broker = InMemoryBroker::new(3);
    let (source, rebalances) = broker.consumer(ENGAGEMENT_TOPIC, "group", &[0, 1, 2]);
    let assignment = source.assignment_handle();
    let (trigger, shutdown) = shutdown_channel();
    let handle = spawn(
        ConsumerRuntime::new(source, rebalances, h.dispatcher(), shutdown).with_poll_timeout(POLL),
    );

    tokio::time::sleep(POLL * 2).await;
    assignment.reassign(&[2]);
    tokio::time::sleep(POLL * 3).await;
    trigger.trigger();
    let (runtime, result) = handle.await.unwrap();

    assert_eq!(
        runtime.assigned_partitions(),
        vec![TopicPartition::new(ENGAGEMENT_TOPIC, 2)]
    );
    assert_eq!(result.unwrap().rebalances, 3);
}

#[tokio::test]
async fn shutdown_before_start_exits_cleanly() {
    let h = Harness::new();
    let broker = InMemoryBroker::new(1);
    let (source, rebalances) = broker.consumer(ENGAGEMENT_TOPIC, "group", &[0]);
    let (trigger, shutdown) = shutdown_channel();
    trigger.trigger();

    let mut runtime = ConsumerRuntime::new(source, rebalances, h.dispatcher(), shutdown);
    let stats = runtime.run().await.unwrap();

    assert_eq!(stats.processed, 0);
    assert_eq!(stats.rebalances, 1);
}

#[tokio::test]
async fn dropped_shutdown_sender_stops_the_loop() {
    let h = Harness::new();
    let broker = InMemoryBroker::new(1);
    let (source, rebalances) = broker.consumer(ENGAGEMENT_TOPIC, "group", &[0]);
    let (trigger, shutdown) = shutdown_channel();
    let handle = spawn(
        ConsumerRuntime::new(source, rebalances, h.dispatcher(), shutdown).with_poll_timeout(POLL),
    );

    drop(trigger);
    let (_, result) = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("loop should stop")
        .unwrap();
    assert!(result.is_ok());
}
