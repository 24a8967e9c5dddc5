//! Canonical chat message shape shared by every producer in the timeline.

use chrono::{DateTime, Local, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Returned by the remote chat service.
    Remote,
    /// Cosmetic crowd filler, regenerated every cycle.
    Synthetic,
    /// Authored by the current viewer in this session.
    LocalUser,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::Remote => write!(f, "remote"),
            Origin::Synthetic => write!(f, "synthetic"),
            Origin::LocalUser => write!(f, "local"),
        }
    }
}

/// Send time of a message.
///
/// Timestamps that fail to parse are kept rather than dropped. They render as
/// "unknown time" and order by the instant they were first observed, so the
/// sort key is always defined. Entries sent without any timestamp are
/// [`SentAt::Observed`]: stamped with the instant they were first seen and
/// rendered like a known time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SentAt {
    Known { at: DateTime<Utc> },
    Observed { at: DateTime<Utc> },
    Unknown { raw: String, observed_at: DateTime<Utc> },
}

/// Label rendered for messages whose timestamp could not be parsed.
pub const UNKNOWN_TIME_LABEL: &str = "unknown time";

impl SentAt {
    /// A known instant from epoch milliseconds.
    pub fn from_ms(ms: i64) -> Self {
        SentAt::Known { at: ms_to_datetime(ms) }
    }

    /// No timestamp on the wire; first seen at `ms`.
    pub fn observed(ms: i64) -> Self {
        SentAt::Observed { at: ms_to_datetime(ms) }
    }

    /// Parse a wire timestamp, falling back to [`SentAt::Unknown`] stamped at
    /// `observed_ms`.
    pub fn parse(raw: &str, observed_ms: i64) -> Self {
        match parse_timestamp(raw) {
            Some(at) => SentAt::Known { at },
            None => SentAt::Unknown {
                raw: raw.to_string(),
                observed_at: ms_to_datetime(observed_ms),
            },
        }
    }

    /// Milliseconds used for ordering.
    pub fn sort_key_ms(&self) -> i64 {
        match self {
            SentAt::Known { at } | SentAt::Observed { at } => at.timestamp_millis(),
            SentAt::Unknown { observed_at, .. } => observed_at.timestamp_millis(),
        }
    }

    /// `true` when the time renders as a clock, i.e. it is not unknown.
    pub fn is_known(&self) -> bool {
        !matches!(self, SentAt::Unknown { .. })
    }

    /// `true` when the sort key is an observation instant rather than a
    /// wire timestamp.
    pub fn is_observed(&self) -> bool {
        !matches!(self, SentAt::Known { .. })
    }

    /// Move an observation-stamped time to `ms`. Wire timestamps are kept.
    pub fn restamp(self, ms: i64) -> Self {
        match self {
            SentAt::Known { .. } => self,
            SentAt::Observed { .. } => SentAt::observed(ms),
            SentAt::Unknown { raw, .. } => SentAt::Unknown { raw, observed_at: ms_to_datetime(ms) },
        }
    }

    /// `HH:MM` in local time, or [`UNKNOWN_TIME_LABEL`].
    pub fn render_clock(&self) -> String {
        match self {
            SentAt::Known { at } | SentAt::Observed { at } => at.with_timezone(&Local).format("%H:%M").to_string(),
            SentAt::Unknown { .. } => UNKNOWN_TIME_LABEL.to_string(),
        }
    }
}

/// Convert epoch milliseconds to a UTC instant, clamping out-of-range values
/// to the epoch.
pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.fff]` (read as UTC) and bare
/// integer epoch milliseconds.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    s.parse::<i64>().ok().and_then(DateTime::from_timestamp_millis)
}

/// One entry in the chat timeline. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub author: String,
    pub body: String,
    pub sent_at: SentAt,
    pub origin: Origin,
    /// Host/moderator messages; rendered with a badge.
    #[serde(default)]
    pub is_privileged: bool,
}

impl ChatMessage {
    /// A message typed by the current viewer at `now_ms`.
    pub fn local(author: impl Into<String>, body: impl Into<String>, now_ms: i64) -> Self {
        Self {
            id: format!("local-{}", uuid::Uuid::new_v4()),
            author: author.into(),
            body: body.into(),
            sent_at: SentAt::from_ms(now_ms),
            origin: Origin::LocalUser,
            is_privileged: false,
        }
    }

    pub fn is_local(&self) -> bool {
        self.origin == Origin::LocalUser
    }

    pub fn sort_key_ms(&self) -> i64 {
        self.sent_at.sort_key_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rfc3339_is_known() {
        let at = SentAt::parse("2024-05-01T10:00:00Z", 0);
        assert!(at.is_known());
        assert_eq!(at.sort_key_ms(), 1_714_557_600_000);
    }

    #[test]
    fn parse_offset_timestamp_normalizes_to_utc() {
        let a = SentAt::parse("2024-05-01T13:30:00+03:30", 0);
        let b = SentAt::parse("2024-05-01T10:00:00Z", 0);
        assert_eq!(a.sort_key_ms(), b.sort_key_ms());
    }

    #[test]
    fn parse_naive_and_epoch_forms() {
        assert!(parse_timestamp("2024-05-01 10:00:00").is_some());
        assert!(parse_timestamp("2024-05-01T10:00:00.250").is_some());
        assert_eq!(
            parse_timestamp("1714557600000").map(|d| d.timestamp_millis()),
            Some(1_714_557_600_000)
        );
    }

    #[test]
    fn unparseable_timestamp_is_kept_as_unknown() {
        let at = SentAt::parse("yesterday-ish", 5_000);
        assert!(!at.is_known());
        assert_eq!(at.sort_key_ms(), 5_000);
        assert_eq!(at.render_clock(), UNKNOWN_TIME_LABEL);
    }

    #[test]
    fn restamp_moves_only_observation_times() {
        let wire = SentAt::from_ms(1_000);
        assert_eq!(wire.clone().restamp(9_000), wire);
        assert_eq!(SentAt::observed(5_000).restamp(2_000).sort_key_ms(), 2_000);
        let unknown = SentAt::parse("soon", 5_000).restamp(2_000);
        assert_eq!(unknown.sort_key_ms(), 2_000);
        assert!(!unknown.is_known());
        assert!(unknown.is_observed());
    }

    #[test]
    fn known_time_renders_as_hh_mm() {
        let s = SentAt::from_ms(1_714_557_600_000).render_clock();
        assert_eq!(s.len(), 5);
        assert_eq!(&s[2..3], ":");
    }

    #[test]
    fn local_messages_get_unique_ids() {
        let a = ChatMessage::local("me", "hi", 0);
        let b = ChatMessage::local("me", "hi", 0);
        assert_ne!(a.id, b.id);
        assert!(a.is_local());
    }

    #[test]
    fn persisted_form_uses_rfc3339() {
        let msg = ChatMessage::local("me", "hi", 1_714_557_600_000);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("2024-05-01T10:00:00Z"), "json: {json}");
        let back: ChatMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
