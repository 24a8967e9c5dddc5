use std::sync::Arc;

use chrono::{Local, Utc};
use clap::Parser;
use colored::*;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use livecast::cli::{render_counters, render_resume, render_slot, render_timeline, Args, Command};
use livecast::clock::{Clock, SharedClock, SystemClock};
use livecast::config::LivecastConfig;
use livecast::gateway::{ChatGateway, HttpChatGateway};
use livecast::playback::{resume_offset, SimulatedMedia};
use livecast::schedule::{format_hms, BroadcastCalendar, SessionPhase};
use livecast::session::LiveSession;
use livecast::store::SessionStore;
use livecast::LivecastError;

fn build_gateway(cfg: &LivecastConfig, clock: SharedClock) -> HttpChatGateway {
    HttpChatGateway::builder(cfg.gateway.base_url.clone())
        .default_author(cfg.sync.default_author.clone())
        .clock(clock)
        .connect_timeout(cfg.gateway.connect_timeout())
        .request_timeout(cfg.gateway.request_timeout())
        .build()
}

fn open_store(cfg: &LivecastConfig) -> Arc<SessionStore> {
    Arc::new(SessionStore::open_or_memory(cfg.storage.path.as_deref(), &cfg.storage.namespace))
}

async fn watch(cfg: LivecastConfig, cycles: Option<u64>) -> Result<(), Box<dyn std::error::Error>> {
    let clock: SharedClock = Arc::new(SystemClock);
    let gateway: Arc<dyn ChatGateway> = Arc::new(build_gateway(&cfg, Arc::clone(&clock)));
    let calendar = BroadcastCalendar::from_config(&cfg.schedule)?;
    let media = SimulatedMedia::new(Arc::clone(&clock), cfg.playback.simulated_duration_secs);

    let on_air = calendar.crowd_active(Local::now().time());
    let mut session = LiveSession::mount_with_slot(&cfg, gateway, open_store(&cfg), clock, media, on_air);
    println!("{}", render_resume(&session.resume_outcome()));
    if session.engine().history_restored() {
        println!("{}", "chat history restored".dimmed());
    }

    let mut rx = session.subscribe();
    let mut previous = rx.borrow().clone();
    let mut published = 0u64;
    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
        let timeline = rx.borrow_and_update().clone();
        let now = Local::now().time();
        session.set_on_air(calendar.crowd_active(now));
        let crowd_on = session.engine().crowd_enabled();
        session.on_published(&previous, &timeline);

        println!("\n{}", "─".repeat(60).dimmed());
        println!("{}", render_slot(&calendar.status(now)));
        if crowd_on {
            println!("{}", render_counters(&session.counters()));
        }
        if !timeline.remote_ok {
            println!("{}", "chat service unreachable, retrying".yellow());
        }
        for line in render_timeline(&timeline, cfg.sync.visible_window) {
            println!("{line}");
        }
        previous = timeline;

        published += 1;
        if cycles.is_some_and(|n| published >= n) {
            break;
        }
    }
    session.unmount();
    Ok(())
}

async fn send(cfg: LivecastConfig, message: &str) -> Result<(), Box<dyn std::error::Error>> {
    let body = message.trim();
    if body.is_empty() {
        return Err(LivecastError::EmptyMessage.into());
    }
    let gateway = build_gateway(&cfg, Arc::new(SystemClock));
    let echo = gateway.post_message(&cfg.sync.viewer_name, body).await?;
    println!("{} {}: {}", "sent".green().bold(), echo.author, echo.body);
    Ok(())
}

fn status(cfg: LivecastConfig) {
    let store = open_store(&cfg);
    let Some(snapshot) = store.load_snapshot() else {
        println!("{}", "no persisted session".dimmed());
        return;
    };
    let now = SystemClock.now_ms();
    let decision =
        resume_offset(cfg.playback.mode, store.load_video_checkpoint(), now, cfg.playback.staleness());
    println!("video offset   {}", format_hms(snapshot.video_offset_secs as i64));
    println!("captured       {}s ago", (now - snapshot.captured_at_ms).max(0) / 1_000);
    println!("chat messages  {}", snapshot.chat_timeline.len());
    println!("mode           {:?}", cfg.playback.mode);
    println!("resume         {} ({:?})", format_hms(decision.offset_secs() as i64), decision);
    if store.is_degraded() {
        println!("{}", "storage unavailable, showing in-memory state".yellow());
    }
}

fn clear(cfg: LivecastConfig) {
    open_store(&cfg).clear_session();
    println!("{}", "session state cleared".green());
}

async fn schedule(cfg: LivecastConfig) -> Result<(), Box<dyn std::error::Error>> {
    let gateway = build_gateway(&cfg, Arc::new(SystemClock));
    match gateway.fetch_schedule().await {
        Ok(s) => {
            println!("{}", s.title.bold());
            match s.phase(Utc::now()) {
                SessionPhase::Upcoming { starts_in_secs } => {
                    println!("starts in {}", format_hms(starts_in_secs).cyan())
                }
                SessionPhase::Live { remaining_secs } => {
                    println!("{} {} left", "LIVE".red().bold(), format_hms(remaining_secs))
                }
                SessionPhase::Ended => println!("{}", "ended".dimmed()),
            }
            if let Some(seats) = s.seats_left() {
                println!("seats left {seats}");
            }
        }
        Err(e) => warn!(error = %e, "could not fetch webinar schedule"),
    }
    let calendar = BroadcastCalendar::from_config(&cfg.schedule)?;
    println!("{}", render_slot(&calendar.status(Local::now().time())));
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("livecast=info")))
        .with_writer(std::io::stderr)
        .init();

    let cfg = args.resolve_config()?;

    match args.command {
        Command::Watch { cycles } => watch(cfg, cycles).await?,
        Command::Send { ref message } => send(cfg, message).await?,
        Command::Status => status(cfg),
        Command::Clear => clear(cfg),
        Command::Schedule => schedule(cfg).await?,
    }

    Ok(())
}
