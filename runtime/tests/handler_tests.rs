//! Handler behaviour against the in-memory stores.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

mod common;

use chrono::{DateTime, TimeDelta, Utc};
use common::Harness;
use engagement_core::environment::Clock;
use engagement_core::event::{
    AiInteraction, CourseCompletion, CourseEnrollment, CourseId, EngagementEvent, LessonCompleted,
    LessonId, LessonViewed, UserId, UserLogin,
};
use engagement_core::store::{AuditKind, Enrollment, EnrollmentStatus};
use engagement_testing::test_clock;
use proptest::prelude::*;
use serde_json::json;

fn viewed(
    user: UserId,
    lesson: LessonId,
    course: Option<CourseId>,
    seconds: u32,
    duration: Option<u32>,
) -> EngagementEvent {
    EngagementEvent::LessonViewed(LessonViewed {
        user_id: user,
        lesson_id: lesson,
        course_id: course,
        viewed_seconds: seconds,
        lesson_duration: duration,
    })
}

fn completed(user: UserId, lesson: LessonId, course: Option<CourseId>) -> EngagementEvent {
    EngagementEvent::LessonCompleted(LessonCompleted {
        user_id: user,
        lesson_id: lesson,
        course_id: course,
    })
}

fn course_completion(user: UserId, course: CourseId) -> EngagementEvent {
    EngagementEvent::CourseCompletion(CourseCompletion {
        user_id: user,
        course_id: course,
        total_time_seconds: Some(7200),
        days_to_complete: Some(12),
    })
}

fn days_before(now: DateTime<Utc>, days: i64, hours: i64) -> DateTime<Utc> {
    now - TimeDelta::days(days) - TimeDelta::hours(hours)
}

#[tokio::test]
async fn view_below_threshold_records_progress_only() {
    let h = Harness::new();
    let (user, course, lessons) = h.course_with_enrollment(2);

    h.handlers
        .handle(&viewed(user, lessons[0], Some(course), 300, Some(600)))
        .await
        .unwrap();

    let progress = h.store.progress(user, lessons[0]).unwrap();
    assert_eq!(progress.watched_seconds, 300);
    assert!(!progress.is_completed);
    assert_eq!(progress.last_watched_at, Some(h.clock.now()));

    let enrollment = h.store.enrollment(user, course).unwrap();
    assert_eq!(enrollment.progress_percentage, 0);
    assert_eq!(enrollment.status, EnrollmentStatus::Active);
}

#[tokio::test]
async fn view_at_ninety_percent_completes_lesson_and_course() {
    let h = Harness::new();
    let (user, course, lessons) = h.course_with_enrollment(1);

    h.handlers
        .handle(&viewed(user, lessons[0], Some(course), 540, Some(600)))
        .await
        .unwrap();

    let progress = h.store.progress(user, lessons[0]).unwrap();
    assert!(progress.is_completed);
    assert_eq!(progress.completed_at, Some(h.clock.now()));

    let enrollment = h.store.enrollment(user, course).unwrap();
    assert_eq!(enrollment.progress_percentage, 100);
    assert_eq!(enrollment.status, EnrollmentStatus::Completed);
    assert_eq!(enrollment.completed_at, Some(h.clock.now()));
    assert_eq!(h.issuer.requests(), vec![(user, course)]);
}

#[tokio::test]
async fn later_shorter_view_keeps_max_and_completion() {
    let h = Harness::new();
    let (user, course, lessons) = h.course_with_enrollment(2);

    h.handlers
        .handle(&viewed(user, lessons[0], Some(course), 580, Some(600)))
        .await
        .unwrap();
    h.handlers
        .handle(&viewed(user, lessons[0], Some(course), 30, Some(600)))
        .await
        .unwrap();

    let progress = h.store.progress(user, lessons[0]).unwrap();
    assert_eq!(progress.watched_seconds, 580);
    assert!(progress.is_completed);
}

#[tokio::test]
async fn view_completion_uses_max_watched_across_views() {
    let h = Harness::new();
    let (user, course, lessons) = h.course_with_enrollment(2);

    // Duration arrives only on the second, shorter view
    h.handlers
        .handle(&viewed(user, lessons[0], Some(course), 550, None))
        .await
        .unwrap();
    assert!(!h.store.progress(user, lessons[0]).unwrap().is_completed);

    h.handlers
        .handle(&viewed(user, lessons[0], Some(course), 10, Some(600)))
        .await
        .unwrap();
    assert!(h.store.progress(user, lessons[0]).unwrap().is_completed);
}

#[tokio::test]
async fn view_without_course_skips_enrollment_recompute() {
    let h = Harness::new();
    let (user, course, lessons) = h.course_with_enrollment(1);

    h.handlers
        .handle(&viewed(user, lessons[0], None, 600, Some(600)))
        .await
        .unwrap();

    assert!(h.store.progress(user, lessons[0]).unwrap().is_completed);
    let enrollment = h.store.enrollment(user, course).unwrap();
    assert_eq!(enrollment.progress_percentage, 0);
    assert!(h.issuer.requests().is_empty());
}

#[tokio::test]
async fn duplicate_completion_keeps_first_timestamp() {
    let h = Harness::new();
    let (user, course, lessons) = h.course_with_enrollment(3);
    let event = completed(user, lessons[0], Some(course));

    h.handlers.handle(&event).await.unwrap();
    let first = h.store.progress(user, lessons[0]).unwrap();

    let completed_at = h.clock.now();
    h.clock.advance(TimeDelta::hours(2));
    h.handlers.handle(&event).await.unwrap();
    let second = h.store.progress(user, lessons[0]).unwrap();

    assert_eq!(first, second);
    assert_eq!(second.completed_at, Some(completed_at));
    assert_eq!(h.store.enrollment(user, course).unwrap().progress_percentage, 33);
}

#[tokio::test]
async fn missing_active_enrollment_is_not_an_error() {
    let h = Harness::new();
    let user = UserId::new(1);
    let course = CourseId::new(5);
    h.store.add_course(course, &[LessonId::new(10)]);

    h.handlers
        .handle(&completed(user, LessonId::new(10), Some(course)))
        .await
        .unwrap();

    assert!(h.store.enrollment(user, course).is_none());
    assert!(h.issuer.requests().is_empty());
}

#[tokio::test]
async fn canceled_enrollment_is_not_recomputed() {
    let h = Harness::new();
    let (user, course, lessons) = h.course_with_enrollment(1);
    let mut enrollment = h.store.enrollment(user, course).unwrap();
    enrollment.status = EnrollmentStatus::Canceled;
    h.store.put_enrollment(enrollment);

    h.handlers
        .handle(&completed(user, lessons[0], Some(course)))
        .await
        .unwrap();

    let enrollment = h.store.enrollment(user, course).unwrap();
    assert_eq!(enrollment.status, EnrollmentStatus::Canceled);
    assert_eq!(enrollment.progress_percentage, 0);
}

#[tokio::test]
async fn course_completion_audits_and_requests_certificate_once() {
    let h = Harness::new();
    let user = UserId::new(1);
    let course = CourseId::new(5);

    h.handlers
        .handle(&course_completion(user, course))
        .await
        .unwrap();
    h.handlers
        .handle(&course_completion(user, course))
        .await
        .unwrap();

    assert_eq!(h.issuer.requests(), vec![(user, course)]);
    let rows = h.store.audit_entries_of(AuditKind::Completion);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].course_id, Some(course));
    assert_eq!(
        rows[0].metadata,
        json!({"total_time_seconds": 7200, "days_to_complete": 12})
    );
}

#[tokio::test]
async fn existing_certificate_suppresses_trigger() {
    let h = Harness::new();
    let user = UserId::new(1);
    let course = CourseId::new(5);
    h.store.add_certificate(user, course);

    h.handlers
        .handle(&course_completion(user, course))
        .await
        .unwrap();

    assert!(h.issuer.requests().is_empty());
}

#[tokio::test]
async fn finishing_last_lesson_then_course_completion_triggers_once() {
    let h = Harness::new();
    let (user, course, lessons) = h.course_with_enrollment(1);

    h.handlers
        .handle(&completed(user, lessons[0], Some(course)))
        .await
        .unwrap();
    h.handlers
        .handle(&course_completion(user, course))
        .await
        .unwrap();

    assert_eq!(h.issuer.requests().len(), 1);
}

#[tokio::test]
async fn enrollment_audit_defaults_source_to_web() {
    let h = Harness::new();
    let user = UserId::new(2);
    let course = CourseId::new(9);

    h.handlers
        .handle(&EngagementEvent::CourseEnrollment(CourseEnrollment {
            user_id: user,
            course_id: course,
            payment_method: Some("card".to_string()),
            source: None,
            referrer: None,
        }))
        .await
        .unwrap();

    let rows = h.store.audit_entries_of(AuditKind::Enrollment);
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].metadata,
        json!({"payment_method": "card", "source": "web", "referrer": null})
    );
    assert!(h.store.progress(user, LessonId::new(1)).is_none());
}

#[tokio::test]
async fn login_touches_user_audits_and_reminds_stale_enrollments() {
    let h = Harness::new();
    let now = h.clock.now();
    let user = UserId::new(1);

    let mut stale = Enrollment::active(user, CourseId::new(1), days_before(now, 10, 0));
    stale.progress_percentage = 40;
    let recent = Enrollment::active(user, CourseId::new(2), days_before(now, 3, 0));
    // Same calendar day as the cutoff: not stale yet
    let boundary = Enrollment::active(user, CourseId::new(3), days_before(now, 6, 14));
    let day_before_boundary = Enrollment::active(user, CourseId::new(4), days_before(now, 7, 1));
    let mut finished = Enrollment::active(user, CourseId::new(5), days_before(now, 30, 0));
    finished.progress_percentage = 100;
    finished.status = EnrollmentStatus::Completed;
    let other_user = Enrollment::active(UserId::new(2), CourseId::new(6), days_before(now, 30, 0));

    for enrollment in [stale, recent, boundary, day_before_boundary, finished, other_user] {
        h.store.put_enrollment(enrollment);
    }

    h.handlers
        .handle(&EngagementEvent::UserLogin(UserLogin {
            user_id: user,
            ip: Some("203.0.113.9".to_string()),
            device: Some("desktop".to_string()),
            platform: None,
        }))
        .await
        .unwrap();

    assert_eq!(h.store.last_login(user), Some(now));
    let rows = h.store.audit_entries_of(AuditKind::Login);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].course_id, None);
    assert_eq!(
        rows[0].metadata,
        json!({"ip": "203.0.113.9", "device": "desktop", "platform": null})
    );
    assert_eq!(
        h.notifier.reminders(),
        vec![(user, CourseId::new(1)), (user, CourseId::new(4))]
    );
}

#[tokio::test]
async fn login_from_a_lagging_clock_keeps_latest_login() {
    let h = Harness::new();
    let user = UserId::new(1);
    let login = EngagementEvent::UserLogin(UserLogin {
        user_id: user,
        ip: None,
        device: None,
        platform: None,
    });
    let latest = h.clock.now();

    h.handlers.handle(&login).await.unwrap();
    h.clock.set(latest - TimeDelta::minutes(30));
    h.handlers.handle(&login).await.unwrap();

    assert_eq!(h.store.last_login(user), Some(latest));
    assert_eq!(h.store.audit_entries_of(AuditKind::Login).len(), 2);
}

#[tokio::test]
async fn ai_interaction_writes_audit_row() {
    let h = Harness::new();
    let user = UserId::new(4);

    h.handlers
        .handle(&EngagementEvent::AiInteraction(AiInteraction {
            user_id: user,
            lesson_id: Some(LessonId::new(10)),
            query: "what is a monad".to_string(),
            tokens_used: Some(321),
        }))
        .await
        .unwrap();

    let rows = h.store.audit_entries_of(AuditKind::AiInteraction);
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].metadata,
        json!({"lesson_id": 10, "tokens_used": 321, "query": "what is a monad"})
    );
}

#[tokio::test]
async fn transient_store_failure_surfaces_as_transient_error() {
    let h = Harness::new();
    let (user, course, lessons) = h.course_with_enrollment(1);
    h.store.fail_next(1);

    let err = h
        .handlers
        .handle(&viewed(user, lessons[0], Some(course), 10, Some(600)))
        .await
        .unwrap_err();

    assert!(err.is_transient());
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
        .block_on(future)
}

proptest! {
    #[test]
    fn watched_seconds_is_the_maximum_seen(
        views in engagement_testing::properties::arb_view_sequence(20),
    ) {
        let h = Harness::new();
        let (user, course, lessons) = h.course_with_enrollment(1);

        block_on(async {
            for seconds in &views {
                h.handlers
                    .handle(&viewed(user, lessons[0], Some(course), *seconds, Some(3_600)))
                    .await
                    .unwrap();
            }
        });

        let progress = h.store.progress(user, lessons[0]).unwrap();
        let max = views.iter().copied().max().unwrap_or(0);
        prop_assert_eq!(progress.watched_seconds, max);
        prop_assert_eq!(progress.is_completed, max * 10 >= 3_600 * 9);
    }

    #[test]
    fn completion_is_never_unset_by_views(
        views in engagement_testing::properties::arb_view_sequence(10),
    ) {
        let h = Harness::new();
        let (user, course, lessons) = h.course_with_enrollment(2);

        block_on(async {
            h.handlers.handle(&completed(user, lessons[0], Some(course))).await.unwrap();
            for seconds in &views {
                h.handlers
                    .handle(&viewed(user, lessons[0], Some(course), *seconds, Some(3_600)))
                    .await
                    .unwrap();
            }
        });

        prop_assert!(h.store.progress(user, lessons[0]).unwrap().is_completed);
    }

    #[test]
    fn enrollment_percent_is_rounded_ratio(total in 1i64..12, completed_count in 0i64..12) {
        let completed_count = completed_count.min(total);
        let h = Harness::at(test_clock());
        let (user, course, lessons) = h.course_with_enrollment(total);

        block_on(async {
            for lesson in lessons.iter().take(usize::try_from(completed_count).unwrap()) {
                h.handlers.handle(&completed(user, *lesson, Some(course))).await.unwrap();
            }
            // A view on an unfinished lesson still triggers a recompute
            h.handlers
                .handle(&viewed(user, lessons[0], Some(course), 0, None))
                .await
                .unwrap();
        });

        let enrollment = h.store.enrollment(user, course).unwrap();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let expected = ((completed_count * 100) as f64 / total as f64).round() as u8;
        if completed_count == total {
            prop_assert_eq!(enrollment.status, EnrollmentStatus::Completed);
            prop_assert_eq!(enrollment.progress_percentage, 100);
        } else {
            prop_assert_eq!(enrollment.status, EnrollmentStatus::Active);
            prop_assert_eq!(enrollment.progress_percentage, expected);
        }
    }
}
