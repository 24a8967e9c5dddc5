use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::*;

use crate::config::LivecastConfig;
use crate::error::Result;
use crate::message::{ChatMessage, Origin};
use crate::playback::ResumeOutcome;
use crate::schedule::{format_hms, SlotStatus};
use crate::timeline::Timeline;

#[derive(Parser)]
#[command(name = "livecast")]
#[command(version)]
#[command(about = "Headless live-session client: synced chat, crowd activity and resumable playback")]
pub struct Args {
    /// TOML configuration file; missing file means defaults
    #[arg(long, short, default_value = "livecast.toml")]
    pub config: PathBuf,

    /// Chat service base URL (overrides config and LIVECAST_BASE_URL)
    #[arg(long)]
    pub base_url: Option<String>,

    /// SQLite session file (overrides config and LIVECAST_STORAGE_PATH)
    #[arg(long)]
    pub storage: Option<PathBuf>,

    /// Keep session state in memory only
    #[arg(long)]
    pub ephemeral: bool,

    /// Display name for messages you send
    #[arg(long)]
    pub viewer: Option<String>,

    /// Disable filler messages and crowd counters
    #[arg(long)]
    pub no_crowd: bool,

    /// Seed the crowd generator for reproducible output
    #[arg(long)]
    pub seed: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Mount a session and print the chat timeline every cycle
    Watch {
        /// Stop after this many published timelines
        #[arg(long)]
        cycles: Option<u64>,
    },
    /// Post one chat message
    Send {
        /// Message text
        message: String,
    },
    /// Show the persisted session and where playback would resume
    Status,
    /// Wipe persisted session state
    Clear,
    /// Show the webinar countdown and broadcast slot status
    Schedule,
}

impl Args {
    /// File, then environment, then flags; validated.
    pub fn resolve_config(&self) -> Result<LivecastConfig> {
        let mut cfg = LivecastConfig::load(&self.config)?;
        cfg.apply_env();
        self.apply_flags(&mut cfg);
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_flags(&self, cfg: &mut LivecastConfig) {
        if let Some(url) = &self.base_url {
            cfg.gateway.base_url = url.clone();
        }
        if let Some(path) = &self.storage {
            cfg.storage.path = Some(path.clone());
        }
        if self.ephemeral {
            cfg.storage.path = None;
        }
        if let Some(name) = &self.viewer {
            cfg.sync.viewer_name = name.clone();
        }
        if self.no_crowd {
            cfg.crowd.enabled = false;
        }
        if self.seed.is_some() {
            cfg.crowd.seed = self.seed;
        }
    }
}

// ---------------------------------------------------------------------------
// Terminal rendering
// ---------------------------------------------------------------------------

/// One colored chat line.
pub fn render_message(m: &ChatMessage) -> String {
    let time = format!("[{}]", m.sent_at.render_clock()).dimmed();
    let author = match (m.origin, m.is_privileged) {
        (_, true) => format!("{} ★", m.author).yellow().bold(),
        (Origin::LocalUser, _) => m.author.green().bold(),
        (Origin::Synthetic, _) => m.author.normal(),
        (Origin::Remote, _) => m.author.cyan(),
    };
    format!("{time} {author}: {}", m.body)
}

/// The visible window, newest first.
pub fn render_timeline(timeline: &Timeline, window: usize) -> Vec<String> {
    timeline.visible(window).into_iter().map(render_message).collect()
}

pub fn render_counters(counters: &[(String, u64)]) -> String {
    counters
        .iter()
        .map(|(name, v)| format!("{} {}", name.dimmed(), v.to_string().bold()))
        .collect::<Vec<_>>()
        .join("  ")
}

pub fn render_resume(outcome: &ResumeOutcome) -> String {
    match outcome {
        ResumeOutcome::Playing { offset_secs } => {
            format!("▶ playing from {}", format_hms(*offset_secs as i64)).green().to_string()
        }
        ResumeOutcome::NeedsGesture { offset_secs } => {
            format!("⏸ press start to resume at {}", format_hms(*offset_secs as i64)).yellow().to_string()
        }
        ResumeOutcome::Ended => "■ broadcast has ended".red().to_string(),
    }
}

pub fn render_slot(status: &SlotStatus<'_>) -> String {
    match status {
        SlotStatus::OnAir { seconds_left, notice, .. } => {
            let base = format!("ON AIR, {} left", format_hms(*seconds_left)).green().bold().to_string();
            match notice {
                Some(n) => format!("{base}\n{}", n.red().bold()),
                None => base,
            }
        }
        SlotStatus::OffAir { next_start: Some(t) } => {
            format!("off air, next broadcast at {}", t.format("%H:%M")).yellow().to_string()
        }
        SlotStatus::OffAir { next_start: None } => "off air".yellow().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SentAt;

    #[test]
    fn watch_with_cycles_parses() {
        let args = Args::parse_from(["livecast", "watch", "--cycles", "3"]);
        assert_eq!(args.command, Command::Watch { cycles: Some(3) });
        assert_eq!(args.config, PathBuf::from("livecast.toml"));
    }

    #[test]
    fn send_takes_positional_message() {
        let args = Args::parse_from(["livecast", "--viewer", "Sara", "send", "hello all"]);
        assert_eq!(args.command, Command::Send { message: "hello all".into() });
        assert_eq!(args.viewer.as_deref(), Some("Sara"));
    }

    #[test]
    fn flags_override_config() {
        let args = Args::parse_from([
            "livecast",
            "--base-url",
            "http://chat.local/api",
            "--ephemeral",
            "--no-crowd",
            "--seed",
            "7",
            "status",
        ]);
        let mut cfg = LivecastConfig::default();
        args.apply_flags(&mut cfg);
        assert_eq!(cfg.gateway.base_url, "http://chat.local/api");
        assert!(cfg.storage.path.is_none());
        assert!(!cfg.crowd.enabled);
        assert_eq!(cfg.crowd.seed, Some(7));
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Args::try_parse_from(["livecast"]).is_err());
    }

    #[test]
    fn render_message_contains_author_and_body() {
        colored::control::set_override(false);
        let m = ChatMessage {
            id: "x".into(),
            author: "Host".into(),
            body: "welcome".into(),
            sent_at: SentAt::parse("garbage", 0),
            origin: Origin::Remote,
            is_privileged: true,
        };
        assert_eq!(render_message(&m), "[unknown time] Host ★: welcome");
    }
}
