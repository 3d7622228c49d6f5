use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Name of the outbound event that carries a notification to a client.
pub const NOTIFICATION_EVENT: &str = "notification";

/// A user ID was empty or blank.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("user id must not be empty")]
pub struct InvalidUserId;

/// Opaque user identifier.
///
/// Whatever the identity provider issued (a UUID, a database object ID, a
/// handle). The relay only compares and hashes it. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(try_from = "String", into = "String")]
#[sqlx(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidUserId> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(InvalidUserId);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for UserId {
    type Error = InvalidUserId;

    fn try_from(id: String) -> Result<Self, Self::Error> {
        Self::new(id)
    }
}

impl FromStr for UserId {
    type Err = InvalidUserId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl From<UserId> for String {
    fn from(id: UserId) -> Self {
        id.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A notification as carried on the queue.
///
/// Producers assign `id` at creation and publish the envelope exactly once.
/// The relay forwards it untouched; `read` is owned by the producer side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEnvelope {
    /// Opaque identifier assigned by the producer (`_id` in legacy payloads)
    #[serde(alias = "_id")]
    pub id: String,
    /// Intended recipient
    pub user_id: UserId,
    /// Free-form payload
    pub message: serde_json::Value,
    #[serde(default)]
    pub read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl NotificationEnvelope {
    /// Build a fresh, unread envelope for `user_id`.
    pub fn new(user_id: UserId, message: impl Into<serde_json::Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            message: message.into(),
            read: false,
            created_at: Some(Utc::now()),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A server-to-client event pushed over an open connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushEvent {
    pub event: &'static str,
    pub data: NotificationEnvelope,
}

impl PushEvent {
    pub fn notification(envelope: NotificationEnvelope) -> Self {
        Self {
            event: NOTIFICATION_EVENT,
            data: envelope,
        }
    }
}

/// A user in the system, as far as the relay cares.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: UserId,
    pub username: String,
    /// Mirrors whether the user currently holds an open connection.
    /// Observability only; delivery never reads it.
    pub connected: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    #[test]
    fn test_user_id_is_opaque_but_not_blank() {
        assert_eq!(user("u1").as_str(), "u1");
        assert_eq!("65a1f0c2e4b0".parse::<UserId>().unwrap().to_string(), "65a1f0c2e4b0");
        assert_eq!(UserId::new(""), Err(InvalidUserId));
        assert_eq!(UserId::new("   "), Err(InvalidUserId));
    }

    #[test]
    fn test_envelope_wire_format_is_camel_case() {
        let envelope = NotificationEnvelope::new(user("u1"), "hello");
        let value: serde_json::Value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["userId"], "u1");
        assert_eq!(value["message"], "hello");
        assert_eq!(value["read"], false);
        assert!(value.get("createdAt").is_some());
        assert!(value.get("user_id").is_none());
    }

    #[test]
    fn test_legacy_payload_decodes() {
        let raw = r#"{"_id":"65a1f0","userId":"64f1c0ffee","message":"hi","read":false,"createdAt":"2024-01-15T10:00:00Z","__v":0}"#;
        let envelope = NotificationEnvelope::from_json(raw).unwrap();
        assert_eq!(envelope.id, "65a1f0");
        assert_eq!(envelope.user_id, user("64f1c0ffee"));
        assert_eq!(envelope.message, serde_json::json!("hi"));
        assert!(envelope.created_at.is_some());
    }

    #[test]
    fn test_minimal_payload_defaults() {
        let raw = r#"{"id":"n1","userId":"u1","message":"hi"}"#;
        let envelope = NotificationEnvelope::from_json(raw).unwrap();
        assert_eq!(envelope.user_id, user("u1"));
        assert!(!envelope.read);
        assert!(envelope.created_at.is_none());
    }

    #[test]
    fn test_empty_user_id_is_rejected() {
        let raw = r#"{"id":"n1","userId":"","message":"hi"}"#;
        assert!(NotificationEnvelope::from_json(raw).is_err());
        let raw = r#"{"id":"n1","message":"hi"}"#;
        assert!(NotificationEnvelope::from_json(raw).is_err());
    }

    #[test]
    fn test_push_event_shape() {
        let envelope = NotificationEnvelope::new(user("u1"), "hello");
        let event = PushEvent::notification(envelope.clone());
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "notification");
        assert_eq!(value["data"]["id"], envelope.id);
        assert_eq!(value["data"]["userId"], "u1");
    }
}
