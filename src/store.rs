//! # Stage: Persistent Session Store
//!
//! ## Responsibility
//! Typed key/value persistence for the state that has to survive a reload:
//! the video checkpoint (offset + wall-clock anchor) and the merged chat
//! timeline (blob + saved-at anchor).
//!
//! ## Guarantees
//! - Fail-soft: no method returns an error; backend failures are logged and the
//!   store degrades to an in-memory map for the rest of the process
//! - Logged once: the degradation warning is emitted a single time
//! - Whole-value overwrite: every write replaces a key's value entirely, so
//!   concurrent writers resolve as last-write-wins
//! - Corrupt values load as absent rather than failing the caller
//!
//! ## NOT Responsible For
//! - Deciding whether a snapshot is stale (playback controller / sync engine)
//! - Cross-process coordination

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{LivecastError, Result};
use crate::message::ChatMessage;

// ---------------------------------------------------------------------------
// Backend seam
// ---------------------------------------------------------------------------

/// Raw string key/value storage.
pub trait KvBackend: Send {
    fn get(&mut self, key: &str) -> Result<Option<String>>;
    fn set(&mut self, key: &str, value: &str) -> Result<()>;
    fn remove(&mut self, key: &str) -> Result<()>;
}

/// Process-local backend. Also used as the degraded fallback.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    map: HashMap<String, String>,
}

impl KvBackend for MemoryBackend {
    fn get(&mut self, key: &str) -> Result<Option<String>> {
        Ok(self.map.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.map.remove(key);
        Ok(())
    }
}

/// Durable backend: a single `kv` table in an SQLite file.
pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key           TEXT PRIMARY KEY,
                value         TEXT NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );",
        )?;
        Ok(Self { conn })
    }
}

impl KvBackend for SqliteBackend {
    fn get(&mut self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        self.conn.execute(
            "INSERT INTO kv (key, value, updated_at_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at_ms = excluded.updated_at_ms",
            params![key, value, now],
        )?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Keys and persisted shapes
// ---------------------------------------------------------------------------

/// Namespaced keys, each independently readable and clearable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub video_offset: String,
    pub video_anchor: String,
    pub chat_history: String,
    pub chat_saved_at: String,
}

impl SessionKeys {
    pub fn new(namespace: &str) -> Self {
        Self {
            video_offset: format!("{namespace}_video_time"),
            video_anchor: format!("{namespace}_start_time"),
            chat_history: format!("{namespace}_chat_history"),
            chat_saved_at: format!("{namespace}_chat_saved_at"),
        }
    }

    pub fn all(&self) -> [&str; 4] {
        [
            self.video_offset.as_str(),
            self.video_anchor.as_str(),
            self.chat_history.as_str(),
            self.chat_saved_at.as_str(),
        ]
    }
}

/// Saved playback position and when it was taken.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoCheckpoint {
    pub offset_secs: f64,
    pub captured_at_ms: i64,
}

/// Saved chat timeline and when it was written.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatHistory {
    pub messages: Vec<ChatMessage>,
    pub saved_at_ms: i64,
}

#[derive(Serialize, Deserialize)]
struct ChatBlob {
    messages: Vec<ChatMessage>,
}

/// Everything the store holds for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub video_offset_secs: f64,
    pub captured_at_ms: i64,
    pub chat_timeline: Vec<ChatMessage>,
    pub snapshot_at_ms: i64,
}

// ---------------------------------------------------------------------------
// SessionStore
// ---------------------------------------------------------------------------

/// Fail-soft typed wrapper over a [`KvBackend`].
pub struct SessionStore {
    keys: SessionKeys,
    backend: Mutex<Box<dyn KvBackend>>,
    fallback: Mutex<MemoryBackend>,
    degraded: AtomicBool,
}

impl SessionStore {
    pub fn new(backend: Box<dyn KvBackend>, namespace: &str) -> Self {
        Self {
            keys: SessionKeys::new(namespace),
            backend: Mutex::new(backend),
            fallback: Mutex::new(MemoryBackend::default()),
            degraded: AtomicBool::new(false),
        }
    }

    /// Memory-only store.
    pub fn in_memory(namespace: &str) -> Self {
        Self::new(Box::new(MemoryBackend::default()), namespace)
    }

    /// SQLite-backed store at `path`, or a memory-only store (logged) if the
    /// file cannot be opened.
    pub fn open_or_memory(path: Option<&Path>, namespace: &str) -> Self {
        match path {
            Some(p) => match SqliteBackend::open(p) {
                Ok(b) => Self::new(Box::new(b), namespace),
                Err(e) => {
                    warn!(error = %e, path = %p.display(), "session storage unavailable, state will not survive restart");
                    let store = Self::in_memory(namespace);
                    store.degraded.store(true, Ordering::SeqCst);
                    store
                }
            },
            None => Self::in_memory(namespace),
        }
    }

    pub fn keys(&self) -> &SessionKeys {
        &self.keys
    }

    /// `true` once the durable backend has failed and memory is serving.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn degrade(&self, op: &str, key: &str, err: &LivecastError) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            warn!(error = %err, op, key, "session storage failed, continuing in memory only");
        } else {
            debug!(error = %err, op, key, "session storage still unavailable");
        }
    }

    fn with_backend<T>(&self, op: &str, key: &str, f: impl Fn(&mut dyn KvBackend) -> Result<T>) -> Option<T> {
        if !self.is_degraded() {
            let outcome = match self.backend.lock() {
                Ok(mut guard) => f(&mut **guard),
                Err(_) => Err(LivecastError::Storage("backend lock poisoned".to_string())),
            };
            match outcome {
                Ok(v) => return Some(v),
                Err(e) => self.degrade(op, key, &e),
            }
        }
        let mut fallback = self.fallback.lock().ok()?;
        f(&mut *fallback).ok()
    }

    /// Best-effort write.
    pub fn save(&self, key: &str, value: &str) {
        self.with_backend("save", key, |b| b.set(key, value));
    }

    pub fn load(&self, key: &str) -> Option<String> {
        self.with_backend("load", key, |b| b.get(key)).flatten()
    }

    /// Remove every listed key; each failure is swallowed independently.
    pub fn clear(&self, keys: &[&str]) {
        for key in keys {
            self.with_backend("clear", key, |b| b.remove(key));
        }
    }

    // -- typed accessors ----------------------------------------------------

    pub fn save_video_checkpoint(&self, offset_secs: f64, now_ms: i64) {
        self.save(&self.keys.video_offset, &offset_secs.max(0.0).to_string());
        self.save(&self.keys.video_anchor, &now_ms.to_string());
    }

    /// Both halves must be present and parse; otherwise absent.
    pub fn load_video_checkpoint(&self) -> Option<VideoCheckpoint> {
        let offset = self.load(&self.keys.video_offset)?.trim().parse::<f64>().ok()?;
        let anchor = self.load(&self.keys.video_anchor)?.trim().parse::<i64>().ok()?;
        if !offset.is_finite() {
            return None;
        }
        Some(VideoCheckpoint { offset_secs: offset.max(0.0), captured_at_ms: anchor })
    }

    pub fn has_video_checkpoint(&self) -> bool {
        self.load_video_checkpoint().is_some()
    }

    pub fn clear_video_checkpoint(&self) {
        self.clear(&[self.keys.video_offset.as_str(), self.keys.video_anchor.as_str()]);
    }

    pub fn save_chat_history(&self, messages: &[ChatMessage], now_ms: i64) {
        let blob = ChatBlob { messages: messages.to_vec() };
        match serde_json::to_string(&blob) {
            Ok(json) => {
                self.save(&self.keys.chat_history, &json);
                self.save(&self.keys.chat_saved_at, &now_ms.to_string());
            }
            Err(e) => warn!(error = %e, "failed to encode chat history"),
        }
    }

    pub fn load_chat_history(&self) -> Option<ChatHistory> {
        let raw = self.load(&self.keys.chat_history)?;
        let saved_at_ms = self.load(&self.keys.chat_saved_at)?.trim().parse::<i64>().ok()?;
        match serde_json::from_str::<ChatBlob>(&raw) {
            Ok(blob) => Some(ChatHistory { messages: blob.messages, saved_at_ms }),
            Err(e) => {
                warn!(error = %e, "discarding unreadable chat history");
                None
            }
        }
    }

    pub fn clear_chat_history(&self) {
        self.clear(&[self.keys.chat_history.as_str(), self.keys.chat_saved_at.as_str()]);
    }

    /// Assemble both halves. `None` when neither half is present.
    pub fn load_snapshot(&self) -> Option<SessionSnapshot> {
        let video = self.load_video_checkpoint();
        let chat = self.load_chat_history();
        if video.is_none() && chat.is_none() {
            return None;
        }
        let (offset, captured) = video.map(|v| (v.offset_secs, v.captured_at_ms)).unwrap_or((0.0, 0));
        // captured_at <= snapshot_at holds even when the halves were written
        // out of order.
        let snapshot_at = chat.as_ref().map(|c| c.saved_at_ms).unwrap_or(captured).max(captured);
        Some(SessionSnapshot {
            video_offset_secs: offset,
            captured_at_ms: captured,
            chat_timeline: chat.map(|c| c.messages).unwrap_or_default(),
            snapshot_at_ms: snapshot_at,
        })
    }

    /// Remove every key of this session.
    pub fn clear_session(&self) {
        let keys = self.keys.clone();
        self.clear(&keys.all());
        debug!("cleared persisted session state");
    }
}
