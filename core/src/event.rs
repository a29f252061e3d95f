//! Event envelope and typed engagement events.
//!
//! Events are the unit of transport on the `student-engagement` topic. On the
//! wire each one is a flat JSON object:
//!
//! ```json
//! {
//!   "event_type": "lesson_viewed",
//!   "user_id": 1,
//!   "lesson_id": 10,
//!   "course_id": 5,
//!   "viewed_seconds": 540,
//!   "lesson_duration": 600,
//!   "timestamp": 1742515200
//! }
//! ```
//!
//! # Design
//!
//! Inside the process the payload is a strongly typed tagged union
//! ([`EngagementEvent`]) with one struct per variant. Decoding validates the
//! required fields of each variant explicitly, so a handler never sees a
//! half-populated event.
//!
//! Decoding is forward compatible:
//!
//! - Unknown fields are ignored
//! - Unknown `event_type` values are reported as [`DecodeError::UnknownEventType`]
//!   so consumers can drop them without treating them as corruption
//!
//! # Example
//!
//! ```
//! use engagement_core::event::{Envelope, EngagementEvent, LessonCompleted};
//! use engagement_core::event::{CourseId, LessonId, UserId};
//!
//! let envelope = Envelope::new(
//!     EngagementEvent::LessonCompleted(LessonCompleted {
//!         user_id: UserId::new(1),
//!         lesson_id: LessonId::new(10),
//!         course_id: Some(CourseId::new(5)),
//!     }),
//!     1_742_515_200,
//! );
//!
//! let bytes = envelope.to_json().unwrap();
//! let decoded = Envelope::from_slice(&bytes).unwrap();
//! assert_eq!(decoded, envelope);
//! assert_eq!(envelope.routing_key(), "user_1");
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Topic every engagement event is published to.
pub const ENGAGEMENT_TOPIC: &str = "student-engagement";

/// Consumer group used by the engagement worker.
pub const ENGAGEMENT_CONSUMER_GROUP: &str = "engagement-analyzer";

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// Wrap a raw identifier.
            #[must_use]
            pub const fn new(id: i64) -> Self {
                Self(id)
            }

            /// The raw identifier.
            #[must_use]
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Identifier of the acting student.
    UserId
);
id_type!(
    /// Identifier of a lesson.
    LessonId
);
id_type!(
    /// Identifier of a course.
    CourseId
);

/// Errors raised while encoding an envelope.
#[derive(Error, Debug)]
pub enum EventError {
    /// Failed to serialize the envelope to JSON.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),
}

/// Reasons a payload could not be turned into an [`Envelope`].
///
/// All variants are permanent for the message that produced them: retrying
/// the same bytes can never succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Payload is not valid JSON, or not a JSON object.
    #[error("Malformed payload: {0}")]
    Malformed(String),

    /// The object has no string `event_type` field.
    #[error("Payload has no event_type")]
    MissingEventType,

    /// The `event_type` is not one this consumer understands.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// A required field is missing or has the wrong type.
    #[error("Invalid {event_type} payload: {reason}")]
    InvalidPayload {
        /// The declared event type
        event_type: EventType,
        /// What was wrong
        reason: String,
    },
}

impl DecodeError {
    /// Short label used for log fields and metric labels.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::MissingEventType => "missing_event_type",
            Self::UnknownEventType(_) => "unknown_event_type",
            Self::InvalidPayload { .. } => "invalid_payload",
        }
    }
}

/// The kinds of engagement event carried on the stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A student watched part of a lesson.
    LessonViewed,
    /// A student explicitly completed a lesson.
    LessonCompleted,
    /// A student enrolled in a course.
    CourseEnrollment,
    /// A student completed a course.
    CourseCompletion,
    /// A student logged in.
    UserLogin,
    /// A student asked the AI assistant something.
    AiInteraction,
}

impl EventType {
    /// Every event type, in wire-name order.
    pub const ALL: [Self; 6] = [
        Self::LessonViewed,
        Self::LessonCompleted,
        Self::CourseEnrollment,
        Self::CourseCompletion,
        Self::UserLogin,
        Self::AiInteraction,
    ];

    /// Wire name of this event type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LessonViewed => "lesson_viewed",
            Self::LessonCompleted => "lesson_completed",
            Self::CourseEnrollment => "course_enrollment",
            Self::CourseCompletion => "course_completion",
            Self::UserLogin => "user_login",
            Self::AiInteraction => "ai_interaction",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DecodeError::UnknownEventType(s.to_string()))
    }
}

/// Payload of `lesson_viewed`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonViewed {
    /// Acting student
    pub user_id: UserId,
    /// Lesson being watched
    pub lesson_id: LessonId,
    /// Course owning the lesson; needed to recompute enrollment progress
    pub course_id: Option<CourseId>,
    /// Seconds watched so far in this session
    pub viewed_seconds: u32,
    /// Declared lesson duration in seconds, when known
    pub lesson_duration: Option<u32>,
}

/// Payload of `lesson_completed`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonCompleted {
    /// Acting student
    pub user_id: UserId,
    /// Completed lesson
    pub lesson_id: LessonId,
    /// Course owning the lesson
    pub course_id: Option<CourseId>,
}

/// Payload of `course_enrollment`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseEnrollment {
    /// Enrolling student
    pub user_id: UserId,
    /// Course enrolled in
    pub course_id: CourseId,
    /// Payment method used, if any
    pub payment_method: Option<String>,
    /// Channel the enrollment came from (defaults to `web` when audited)
    pub source: Option<String>,
    /// Referrer, if tracked
    pub referrer: Option<String>,
}

/// Payload of `course_completion`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseCompletion {
    /// Student who completed the course
    pub user_id: UserId,
    /// Completed course
    pub course_id: CourseId,
    /// Total time spent in the course
    pub total_time_seconds: Option<u64>,
    /// Days from enrollment to completion
    pub days_to_complete: Option<u32>,
}

/// Payload of `user_login`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLogin {
    /// Student who logged in
    pub user_id: UserId,
    /// Client IP address
    pub ip: Option<String>,
    /// Client device
    pub device: Option<String>,
    /// Client platform
    pub platform: Option<String>,
}

/// Payload of `ai_interaction`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiInteraction {
    /// Student who asked
    pub user_id: UserId,
    /// Lesson the question was asked from
    pub lesson_id: Option<LessonId>,
    /// The question
    pub query: String,
    /// Tokens consumed answering it
    pub tokens_used: Option<u32>,
}

/// A decoded engagement event.
///
/// Serialized as an internally tagged object: the variant name lives in the
/// `event_type` field next to the payload fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EngagementEvent {
    /// See [`LessonViewed`]
    LessonViewed(LessonViewed),
    /// See [`LessonCompleted`]
    LessonCompleted(LessonCompleted),
    /// See [`CourseEnrollment`]
    CourseEnrollment(CourseEnrollment),
    /// See [`CourseCompletion`]
    CourseCompletion(CourseCompletion),
    /// See [`UserLogin`]
    UserLogin(UserLogin),
    /// See [`AiInteraction`]
    AiInteraction(AiInteraction),
}

impl EngagementEvent {
    /// The type tag of this event.
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        match self {
            Self::LessonViewed(_) => EventType::LessonViewed,
            Self::LessonCompleted(_) => EventType::LessonCompleted,
            Self::CourseEnrollment(_) => EventType::CourseEnrollment,
            Self::CourseCompletion(_) => EventType::CourseCompletion,
            Self::UserLogin(_) => EventType::UserLogin,
            Self::AiInteraction(_) => EventType::AiInteraction,
        }
    }

    /// The acting student.
    #[must_use]
    pub const fn user_id(&self) -> UserId {
        match self {
            Self::LessonViewed(e) => e.user_id,
            Self::LessonCompleted(e) => e.user_id,
            Self::CourseEnrollment(e) => e.user_id,
            Self::CourseCompletion(e) => e.user_id,
            Self::UserLogin(e) => e.user_id,
            Self::AiInteraction(e) => e.user_id,
        }
    }
}

/// The serialized unit flowing through the stream.
///
/// `timestamp` is the producer's emission time in seconds since the epoch. It
/// is informational only; ordering comes from the partition log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// The typed event
    pub event: EngagementEvent,
    /// Producer-side emission time (seconds since epoch)
    pub timestamp: Option<i64>,
}

impl Envelope {
    /// Wrap an event with its emission time.
    #[must_use]
    pub const fn new(event: EngagementEvent, timestamp: i64) -> Self {
        Self {
            event,
            timestamp: Some(timestamp),
        }
    }

    /// Partitioning key: keeps every event of one student on one partition.
    #[must_use]
    pub fn routing_key(&self) -> String {
        format!("user_{}", self.event.user_id())
    }

    /// Encode as a flat JSON object.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if serde fails, which only
    /// happens for non-finite numbers or non-string map keys.
    pub fn to_json(&self) -> Result<Vec<u8>, EventError> {
        let mut value = serde_json::to_value(&self.event)
            .map_err(|e| EventError::SerializationError(e.to_string()))?;

        if let (Value::Object(map), Some(timestamp)) = (&mut value, self.timestamp) {
            map.insert("timestamp".to_string(), Value::from(timestamp));
        }

        serde_json::to_vec(&value).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Decode and validate a raw payload.
    ///
    /// # Errors
    ///
    /// - [`DecodeError::Malformed`] if the bytes are not a JSON object
    /// - [`DecodeError::MissingEventType`] if `event_type` is absent or not a string
    /// - [`DecodeError::UnknownEventType`] for event types this build does not know
    /// - [`DecodeError::InvalidPayload`] if a required field is missing or ill-typed
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DecodeError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;

        let Value::Object(map) = &value else {
            return Err(DecodeError::Malformed(
                "payload is not a JSON object".to_string(),
            ));
        };

        let event_type: EventType = match map.get("event_type") {
            Some(Value::String(name)) => name.parse()?,
            _ => return Err(DecodeError::MissingEventType),
        };
        let timestamp = map.get("timestamp").and_then(Value::as_i64);

        let event = EngagementEvent::deserialize(value).map_err(|e| {
            DecodeError::InvalidPayload {
                event_type,
                reason: e.to_string(),
            }
        })?;

        Ok(Self { event, timestamp })
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Envelope {{ type: {}, user: {} }}",
            self.event.event_type(),
            self.event.user_id()
        )
    }
}
