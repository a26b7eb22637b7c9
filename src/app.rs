use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};

use crate::api;
use crate::auth;
use crate::config::{self, Config};
use crate::data::{self, IdentityProvider};
use crate::feed::{Feed, FeedEvent, LoadRequest, MutationOutcome};
use crate::models::{MediaKind, Notification, Post};
use crate::notifications::Inbox;
use crate::session;
use crate::storage;

const DEMO_VIEWER: &str = "demo-viewer";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login { email: String, password: String },
    Logout,
    /// Loads `pages` pages by scrolling, or the configured default.
    Feed { pages: Option<u32> },
    Notifications,
    Server { base_url: String },
    Demo,
}

pub fn run(command: Command) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    match command {
        Command::Demo => demo(&mut out),
        Command::Server { base_url } => {
            let path = config::save_base_url(None, &base_url)?;
            writeln!(out, "Saved api.base_url to {}", friendly_path(Some(&path)))?;
            Ok(())
        }
        command => {
            let cfg = config::load(config::LoadOptions::default()).context("load config")?;
            let runtime = Runtime::connect(cfg)?;
            match command {
                Command::Login { email, password } => runtime.login(&email, &password, &mut out),
                Command::Logout => runtime.logout(&mut out),
                Command::Feed { pages } => runtime.feed(pages, &mut out),
                Command::Notifications => runtime.notifications(&mut out),
                Command::Server { .. } | Command::Demo => Ok(()),
            }
        }
    }
}

/// Everything a networked command needs.
struct Runtime {
    cfg: Config,
    client: Arc<api::Client>,
    sessions: Arc<session::Manager>,
}

impl Runtime {
    fn connect(cfg: Config) -> Result<Self> {
        let store = Arc::new(
            storage::Store::open(storage::Options {
                path: Some(cfg.storage.resolved_path()?),
            })
            .context("open storage")?,
        );
        let anonymous = Arc::new(
            api::Client::new(Arc::new(api::Anonymous), cfg.api.client_config())
                .context("create api client")?,
        );
        let flow = Arc::new(auth::Flow::new(store.clone(), anonymous.clone()));
        let sessions = Arc::new(session::Manager::new(store, flow));
        sessions.load_existing().context("restore sessions")?;

        let client = Arc::new(anonymous.with_token_provider(sessions.clone()));
        Ok(Self {
            cfg,
            client,
            sessions,
        })
    }

    fn login(&self, email: &str, password: &str, out: &mut impl Write) -> Result<()> {
        let session = self.sessions.login(email, password)?;
        writeln!(
            out,
            "Signed in as {} (@{})",
            session.account.display_name, session.account.username
        )?;
        Ok(())
    }

    fn logout(&self, out: &mut impl Write) -> Result<()> {
        let account = self.sessions.logout()?;
        writeln!(out, "Signed out @{}", account.username)?;
        if let Some(active) = self.sessions.active() {
            writeln!(out, "Now using @{}", active.account.username)?;
        }
        Ok(())
    }

    fn feed(&self, pages: Option<u32>, out: &mut impl Write) -> Result<()> {
        self.require_viewer()?;
        let feed_service = Arc::new(data::ApiFeedService::new(self.client.clone()));
        let interactions = Arc::new(data::ApiInteractionService::new(self.client.clone()));
        let mut feed = Feed::new(feed_service, interactions, self.sessions.clone());

        let pages = pages.unwrap_or(self.cfg.feed.initial_pages).max(1);
        let timeout = self.cfg.feed.wait_timeout;
        feed.load_next_page();
        settle_pages(&mut feed, timeout)?;
        scroll(&mut feed, pages, timeout)?;

        let viewer = feed.viewer().map(str::to_string);
        let now = Utc::now();
        for post in feed.posts() {
            writeln!(out, "{}", render_post(&post, viewer.as_deref(), now))?;
        }
        let status = feed.status();
        writeln!(
            out,
            "{} posts, {} page(s){}",
            status.len,
            status.current_page,
            if status.has_more { ", more available" } else { "" }
        )?;
        feed.dispose();
        Ok(())
    }

    fn notifications(&self, out: &mut impl Write) -> Result<()> {
        self.require_viewer()?;
        let service = Arc::new(data::ApiNotificationService::new(self.client.clone()));
        let mut inbox = Inbox::new(service);
        inbox.load()?;
        print_inbox(&inbox, Utc::now(), out)
    }

    fn require_viewer(&self) -> Result<()> {
        if self.sessions.viewer_id().is_none() {
            bail!("not signed in; run `murmur --login <email> <password>` first");
        }
        Ok(())
    }
}

/// Waits for outstanding page fetches and turns a failure into an error.
fn settle_pages(feed: &mut Feed, timeout: Duration) -> Result<Vec<FeedEvent>> {
    let events = feed.wait(timeout);
    for event in &events {
        if let FeedEvent::PageFailed(err) = event {
            return Err(err.clone()).context("load feed page");
        }
    }
    if feed.status().is_loading {
        bail!("timed out after {} waiting for the feed", humantime::format_duration(timeout));
    }
    Ok(events)
}

/// Brings the sentinel into view until `pages` pages are loaded or the
/// feed runs out.
fn scroll(feed: &mut Feed, pages: u32, timeout: Duration) -> Result<Vec<FeedEvent>> {
    let mut events = Vec::new();
    loop {
        let status = feed.status();
        if !status.has_more || status.current_page >= pages {
            return Ok(events);
        }
        feed.on_sentinel_visibility(false);
        if feed.on_sentinel_visibility(true) == LoadRequest::Skipped {
            return Ok(events);
        }
        events.extend(settle_pages(feed, timeout)?);
    }
}

fn demo(out: &mut impl Write) -> Result<()> {
    let timeout = Duration::from_secs(5);
    let posts = data::sample_posts(12);
    let feed_service = Arc::new(data::MockFeedService::new(posts.clone(), 5));
    let interactions = Arc::new(data::MockInteractionService::new(DEMO_VIEWER, &posts));
    let identity = Arc::new(data::StaticIdentity::new(Some(DEMO_VIEWER)));
    let mut feed = Feed::new(feed_service, interactions.clone(), identity);

    feed.load_next_page();
    let mut events = settle_pages(&mut feed, timeout)?;
    events.extend(scroll(&mut feed, u32::MAX, timeout)?);
    for event in &events {
        if let FeedEvent::PageLoaded(page) = event {
            writeln!(
                out,
                "page {}: {} new, {} duplicate",
                page.page, page.added, page.duplicates
            )?;
        }
    }

    interactions.fail_post("p3");
    feed.like("p1")?;
    feed.like("p3")?;
    feed.delete("p2")?;
    for event in feed.wait(timeout) {
        if let FeedEvent::Mutation(outcome) = event {
            writeln!(out, "{}", describe_outcome(&outcome))?;
        }
    }

    let now = Utc::now();
    for post in feed.posts() {
        writeln!(out, "{}", render_post(&post, Some(DEMO_VIEWER), now))?;
    }
    let status = feed.status();
    writeln!(
        out,
        "{} posts, {} page(s), end of feed: {}",
        status.len, status.current_page, !status.has_more
    )?;
    feed.dispose();

    let mut inbox = Inbox::new(Arc::new(data::MockNotificationService::default()));
    inbox.load()?;
    inbox.mark_read("n1")?;
    print_inbox(&inbox, now, out)
}

fn describe_outcome(outcome: &MutationOutcome) -> String {
    let ticket = outcome.ticket();
    match outcome {
        MutationOutcome::Committed { reconciled, .. } => format!(
            "{} {} committed{}",
            ticket.kind,
            ticket.post_id,
            if *reconciled { " (server corrected)" } else { "" }
        ),
        MutationOutcome::RolledBack { error, .. } => {
            format!("{} {} rolled back: {}", ticket.kind, ticket.post_id, error)
        }
        MutationOutcome::Failed { error, .. } => {
            format!("{} {} failed: {}", ticket.kind, ticket.post_id, error)
        }
        MutationOutcome::Discarded { reason, .. } => {
            format!("{} {} discarded: {}", ticket.kind, ticket.post_id, reason)
        }
    }
}

fn print_inbox(inbox: &Inbox, now: DateTime<Utc>, out: &mut impl Write) -> Result<()> {
    writeln!(out, "{} unread notification(s)", inbox.unread_count())?;
    for item in inbox.items() {
        writeln!(out, "{}", render_notification(item, now))?;
    }
    Ok(())
}

fn render_post(post: &Post, viewer: Option<&str>, now: DateTime<Utc>) -> String {
    let liked = viewer.is_some_and(|id| post.is_liked_by(id));
    let mut line = format!(
        "[{}] {} · {} · {} like{}{} · {} comment{}",
        post.id,
        post.author.display_name(),
        relative_time(post.created_at, now),
        post.likes_count,
        if post.likes_count == 1 { "" } else { "s" },
        if liked { " (you)" } else { "" },
        post.comments_count,
        if post.comments_count == 1 { "" } else { "s" },
    );
    if let Some(content) = post.content.as_deref().map(str::trim) {
        if !content.is_empty() {
            line.push_str("\n    ");
            line.push_str(content);
        }
    }
    let (images, videos) = post
        .media_items()
        .fold((0, 0), |(images, videos), (kind, _)| match kind {
            MediaKind::Image => (images + 1, videos),
            MediaKind::Video => (images, videos + 1),
        });
    if images + videos > 0 {
        line.push_str(&format!("\n    [{images} image(s), {videos} video(s)]"));
    }
    line
}

fn render_notification(item: &Notification, now: DateTime<Utc>) -> String {
    format!(
        "{} {} {} · {}",
        if item.is_read { " " } else { "*" },
        item.sender.display_name(),
        item.message,
        relative_time(item.created_at, now)
    )
}

fn relative_time(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - at).num_seconds();
    if secs < 60 {
        return "just now".to_string();
    }
    let minutes = secs / 60;
    if minutes < 60 {
        return format!("{minutes}m ago");
    }
    let hours = minutes / 60;
    if hours < 24 {
        return format!("{hours}h ago");
    }
    let days = hours / 24;
    if days < 30 {
        return format!("{days}d ago");
    }
    at.format("%Y-%m-%d").to_string()
}

fn friendly_path(path: Option<&PathBuf>) -> String {
    if let Some(path) = path {
        if let Some(home) = dirs::home_dir() {
            if let Ok(stripped) = path.strip_prefix(&home) {
                let mut display = String::from("~");
                if !stripped.as_os_str().is_empty() {
                    display.push_str(&format!("/{}", stripped.display()));
                }
                return display;
            }
        }
        path.display().to_string()
    } else {
        "~/.config/murmur/config.yaml".to_string()
    }
}
