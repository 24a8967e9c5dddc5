//! # livecast
//!
//! Session-continuity and chat-synchronization engine for simulated live
//! broadcasts.
//!
//! A mounted [`session::LiveSession`] polls a chat service, merges remote,
//! synthetic and locally-authored messages into one ordered timeline, and
//! resumes video playback after a reload as if the broadcast had kept going.
//!
//! ```rust,ignore
//! let cfg = LivecastConfig::default();
//! let clock: SharedClock = Arc::new(SystemClock);
//! let gateway = Arc::new(HttpChatGateway::builder(&cfg.gateway.base_url).build());
//! let store = Arc::new(SessionStore::open_or_memory(cfg.storage.path.as_deref(), "webinar"));
//! let media = SimulatedMedia::new(Arc::clone(&clock), Some(4_500.0));
//! let session = LiveSession::mount(&cfg, gateway, store, clock, media);
//! let mut rx = session.subscribe();
//! ```

pub mod cli;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod message;
pub mod playback;
pub mod schedule;
pub mod scroll;
pub mod session;
pub mod store;
pub mod synthetic;
pub mod timeline;

pub use config::LivecastConfig;
pub use engine::{ChatSyncEngine, SyncHandle, SyncState};
pub use error::{LivecastError, Result};
pub use gateway::{ChatGateway, HttpChatGateway};
pub use message::{ChatMessage, Origin, SentAt};
pub use playback::{MediaElement, PlaybackController, ResumeDecision, ResumeOutcome};
pub use session::LiveSession;
pub use store::SessionStore;
pub use timeline::Timeline;
