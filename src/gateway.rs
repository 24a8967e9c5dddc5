//! Remote chat gateway: HTTP client for the chat/session service plus the
//! normalization layer that maps its loosely-named JSON onto [`ChatMessage`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::clock::{SharedClock, SystemClock};
use crate::error::{LivecastError, Result};
use crate::message::{ChatMessage, Origin, SentAt};
use crate::schedule::WebinarSchedule;

/// Field-name aliases seen in chat service payloads, in lookup order.
const ID_KEYS: &[&str] = &["id", "ID", "Id"];
const AUTHOR_KEYS: &[&str] = &["author", "Author", "username", "Username", "user_name", "name"];
const BODY_KEYS: &[&str] = &["body", "Body", "message", "Message", "text", "Text"];
const TIME_KEYS: &[&str] = &["sentAt", "sent_at", "SentAt", "timestamp", "Timestamp", "created_at"];
const PRIVILEGED_KEYS: &[&str] = &["isPrivileged", "is_privileged", "IsAdmin", "is_admin", "isAdmin"];

/// The chat collaborator as seen by the sync engine.
#[async_trait]
pub trait ChatGateway: Send + Sync {
    /// Current remote messages. Malformed entries are already dropped.
    async fn fetch_messages(&self) -> Result<Vec<ChatMessage>>;

    /// Submit a message; returns the service's echo.
    async fn post_message(&self, author: &str, body: &str) -> Result<ChatMessage>;
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

fn pick<'a>(obj: &'a serde_json::Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| obj.get(*k)).filter(|v| !v.is_null())
}

fn scalar_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Stable id for entries the service sent without one.
fn fingerprint(author: &str, body: &str, raw_time: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(author.as_bytes());
    hasher.update([0u8]);
    hasher.update(body.as_bytes());
    hasher.update([0u8]);
    hasher.update(raw_time.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Map one payload entry to a [`ChatMessage`].
///
/// Returns `None` for entries that are not objects or carry no string body.
/// A missing author becomes `default_author`; a missing timestamp becomes
/// `now_ms`; an unparseable one is kept as unknown.
pub fn normalize_entry(entry: &Value, now_ms: i64, default_author: &str) -> Option<ChatMessage> {
    let obj = entry.as_object()?;
    let body = pick(obj, BODY_KEYS)?.as_str()?.to_string();
    let author = pick(obj, AUTHOR_KEYS)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_author)
        .to_string();
    let raw_time = pick(obj, TIME_KEYS).and_then(scalar_text);
    let sent_at = match &raw_time {
        Some(raw) => SentAt::parse(raw, now_ms),
        None => SentAt::observed(now_ms),
    };
    let is_privileged = pick(obj, PRIVILEGED_KEYS).and_then(Value::as_bool).unwrap_or(false);
    let id = match pick(obj, ID_KEYS).and_then(scalar_text) {
        Some(remote_id) => format!("remote-{remote_id}"),
        None => format!("remote-{}", fingerprint(&author, &body, raw_time.as_deref().unwrap_or(""))),
    };
    Some(ChatMessage { id, author, body, sent_at, origin: Origin::Remote, is_privileged })
}

/// Normalize a `GET chat` response.
///
/// Accepts `{ "messages": [...] }` or a bare array. Each malformed entry is
/// dropped individually; anything else is a decode error.
pub fn normalize_batch(payload: &Value, now_ms: i64, default_author: &str) -> Result<Vec<ChatMessage>> {
    let list = match payload {
        Value::Array(items) => items,
        Value::Object(obj) => match pick(obj, &["messages", "Messages"]) {
            Some(Value::Array(items)) => items,
            // `{"messages": null}` is how an empty table is serialized.
            None => return Ok(Vec::new()),
            Some(_) => {
                return Err(LivecastError::Json {
                    field: "messages".into(),
                    detail: "expected an array".into(),
                })
            }
        },
        _ => {
            return Err(LivecastError::Json {
                field: "body".into(),
                detail: "expected an object or array".into(),
            })
        }
    };
    let messages: Vec<ChatMessage> =
        list.iter().filter_map(|e| normalize_entry(e, now_ms, default_author)).collect();
    let dropped = list.len() - messages.len();
    if dropped > 0 {
        debug!(dropped, kept = messages.len(), "dropped malformed chat entries");
    }
    Ok(messages)
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// `reqwest`-backed gateway. Use [`HttpChatGateway::builder`].
pub struct HttpChatGateway {
    base_url: String,
    default_author: String,
    clock: SharedClock,
    client: reqwest::Client,
}

impl HttpChatGateway {
    pub fn builder(base_url: impl Into<String>) -> HttpChatGatewayBuilder {
        HttpChatGatewayBuilder::new(base_url)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        let resp = self.client.get(url).send().await.map_err(|e| LivecastError::Connect {
            url: url.to_string(),
            detail: e.to_string(),
        })?;
        Self::read_json(resp, url).await
    }

    async fn read_json(resp: reqwest::Response, url: &str) -> Result<Value> {
        if !resp.status().is_success() {
            return Err(LivecastError::Http { status: resp.status().as_u16(), url: url.to_string() });
        }
        let bytes = resp.bytes().await.map_err(|e| LivecastError::Json {
            field: "body".into(),
            detail: e.to_string(),
        })?;
        serde_json::from_slice(&bytes).map_err(|e| LivecastError::Json {
            field: "body".into(),
            detail: e.to_string(),
        })
    }

    /// `GET <base>/webinar`.
    pub async fn fetch_schedule(&self) -> Result<WebinarSchedule> {
        let url = self.url("webinar");
        let value = self.get_json(&url).await?;
        serde_json::from_value(value).map_err(|e| LivecastError::Json {
            field: "webinar".into(),
            detail: e.to_string(),
        })
    }
}

#[async_trait]
impl ChatGateway for HttpChatGateway {
    async fn fetch_messages(&self) -> Result<Vec<ChatMessage>> {
        let url = self.url("chat");
        let value = self.get_json(&url).await?;
        normalize_batch(&value, self.clock.now_ms(), &self.default_author)
    }

    async fn post_message(&self, author: &str, body: &str) -> Result<ChatMessage> {
        let url = self.url("chat");
        let resp = self
            .client
            .post(&url)
            .json(&json!({ "username": author, "message": body }))
            .send()
            .await
            .map_err(|e| LivecastError::Connect { url: url.clone(), detail: e.to_string() })?;
        let value = Self::read_json(resp, &url).await?;
        let entry = value
            .as_object()
            .and_then(|o| pick(o, &["message", "Message"]))
            .filter(|v| v.is_object())
            .unwrap_or(&value);
        normalize_entry(entry, self.clock.now_ms(), &self.default_author).ok_or_else(|| {
            LivecastError::Json { field: "message".into(), detail: "echo is not a chat message".into() }
        })
    }
}

/// Builder for [`HttpChatGateway`].
pub struct HttpChatGatewayBuilder {
    base_url: String,
    default_author: String,
    clock: SharedClock,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl HttpChatGatewayBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            default_author: "Viewer".to_string(),
            clock: Arc::new(SystemClock),
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(10),
        }
    }

    /// Author substituted for entries without one.
    pub fn default_author(mut self, name: impl Into<String>) -> Self {
        self.default_author = name.into();
        self
    }

    /// Clock used to stamp entries that arrive without a usable timestamp.
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn build(self) -> HttpChatGateway {
        // Client::builder() only fails in exotic TLS setups; fall back to the
        // default client rather than panicking.
        let client = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .timeout(self.request_timeout)
            .build()
            .unwrap_or_default();
        HttpChatGateway {
            base_url: self.base_url,
            default_author: self.default_author,
            clock: self.clock,
            client,
        }
    }
}
