//! Membership and signaling data types shared by every mesh node.
//!
//! These are the records that cross the document store: a [`MemberRecord`]
//! per admitted participant and a [`SignalEnvelope`] per negotiation message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable participant identifier.
///
/// Identifiers are opaque strings supplied by the identity service. Their
/// lexicographic order is the tie-break that decides which side of a pair
/// sends the offer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(String);

impl MemberId {
    /// Wrap an identifier supplied by the identity service.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Create a new random identifier.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemberId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for MemberId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A participant's membership and liveness record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberRecord {
    pub id: MemberId,
    pub name: String,
    pub online: bool,
    /// Refreshed by the member's own heartbeat.
    pub last_active: DateTime<Utc>,
    pub joined_at: DateTime<Utc>,
}

impl MemberRecord {
    /// Record for a freshly admitted member.
    #[must_use]
    pub fn admitted(id: MemberId, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: name.into(),
            online: true,
            last_active: now,
            joined_at: now,
        }
    }

    /// Copy of this record marked online with a new liveness timestamp.
    #[must_use]
    pub fn refreshed(&self, name: &str, now: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            online: true,
            last_active: now,
            ..self.clone()
        }
    }
}

/// The three per-recipient mailboxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl SignalKind {
    pub const ALL: [SignalKind; 3] = [SignalKind::Offer, SignalKind::Answer, SignalKind::Candidate];

    /// Bounded label for logs, metrics and store keys.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One negotiation message addressed to a single recipient.
///
/// Envelopes are created once by the sender and deleted once by the
/// recipient after their effect has been applied. They are never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    /// Unique envelope id, used to make re-delivery a no-op.
    pub id: String,
    pub kind: SignalKind,
    pub sender_id: MemberId,
    /// Present on offers so the answering side can label the stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// SDP for offers and answers, serialized candidate for candidates.
    pub payload: String,
    /// Store-assigned sequence number; orders a mailbox by creation.
    #[serde(default)]
    pub seq: u64,
    pub created_at: DateTime<Utc>,
}

impl SignalEnvelope {
    fn new(
        kind: SignalKind,
        sender_id: MemberId,
        sender_name: Option<String>,
        payload: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            sender_id,
            sender_name,
            payload,
            seq: 0,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn offer(sender_id: MemberId, sender_name: impl Into<String>, sdp: String) -> Self {
        Self::new(SignalKind::Offer, sender_id, Some(sender_name.into()), sdp)
    }

    #[must_use]
    pub fn answer(sender_id: MemberId, sdp: String) -> Self {
        Self::new(SignalKind::Answer, sender_id, None, sdp)
    }

    #[must_use]
    pub fn candidate(sender_id: MemberId, candidate: String) -> Self {
        Self::new(SignalKind::Candidate, sender_id, None, candidate)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_member_ids_order_lexicographically() {
        let a = MemberId::from("alice");
        let b = MemberId::from("bob");

        assert!(a < b);
        assert_eq!(a.to_string(), "alice");
    }

    #[test]
    fn test_member_id_serializes_as_plain_string() {
        let json = serde_json::to_string(&MemberId::from("alice")).unwrap();
        assert_eq!(json, "\"alice\"");
    }

    #[test]
    fn test_member_record_uses_camel_case_fields() {
        let now = Utc::now();
        let record = MemberRecord::admitted(MemberId::from("alice"), "Alice", now);

        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["id"], "alice");
        assert_eq!(json["online"], true);
        assert!(json.get("lastActive").is_some());
        assert!(json.get("joinedAt").is_some());
    }

    #[test]
    fn test_refreshed_keeps_join_time() {
        let joined = Utc::now();
        let record = MemberRecord::admitted(MemberId::from("alice"), "Alice", joined);
        let later = joined + chrono::Duration::seconds(5);

        let refreshed = record.refreshed("Alice B.", later);

        assert_eq!(refreshed.joined_at, joined);
        assert_eq!(refreshed.last_active, later);
        assert_eq!(refreshed.name, "Alice B.");
    }

    #[test]
    fn test_envelopes_get_unique_ids() {
        let a = SignalEnvelope::candidate(MemberId::from("alice"), "c1".to_string());
        let b = SignalEnvelope::candidate(MemberId::from("alice"), "c1".to_string());

        assert_ne!(a.id, b.id);
        assert_eq!(a.kind, SignalKind::Candidate);
    }

    #[test]
    fn test_only_offers_carry_sender_name() {
        let offer = SignalEnvelope::offer(MemberId::from("alice"), "Alice", "v=0".to_string());
        let answer = SignalEnvelope::answer(MemberId::from("bob"), "v=0".to_string());

        assert_eq!(offer.sender_name.as_deref(), Some("Alice"));
        assert!(answer.sender_name.is_none());

        let json = serde_json::to_value(&answer).unwrap();
        assert!(json.get("senderName").is_none());
        assert_eq!(json["kind"], "answer");
    }
}
