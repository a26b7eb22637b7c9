//! Client-side feed: paginated loading, infinite-scroll triggering and
//! optimistic interactions, all applied on the thread that owns the [`Feed`].

mod context;
mod mutation;
mod sentinel;
mod store;

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use tracing::{debug, info};

pub use context::{FeedContext, FeedState};
pub use mutation::{
    MutationCoordinator, MutationKind, MutationOutcome, MutationPhase, MutationTicket,
    PendingMutation, Snapshot,
};
pub use sentinel::{ScrollSentinel, SentinelState};
pub use store::{AppendOutcome, FeedStatus, FeedStore, LoadRequest, PageRequest};

use crate::data::{FeedService, IdentityProvider, InteractionService};
use crate::error::FeedError;
use crate::models::{FeedPage, LikeState, Post};

/// Network results travelling back from worker threads.
pub(crate) enum Completion {
    Page {
        request: PageRequest,
        result: Result<FeedPage, FeedError>,
    },
    Like {
        ticket: MutationTicket,
        result: Result<LikeState, FeedError>,
    },
    Delete {
        ticket: MutationTicket,
        result: Result<(), FeedError>,
    },
}

/// What changed during a `poll`, for the presentation layer to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    PageLoaded(AppendOutcome),
    PageFailed(FeedError),
    Mutation(MutationOutcome),
    /// The viewer changed and the feed started over.
    Reset,
}

pub struct Feed {
    ctx: FeedContext,
    store: FeedStore,
    mutations: MutationCoordinator,
    sentinel: ScrollSentinel,
    identity: Arc<dyn IdentityProvider>,
    viewer: Option<String>,
    completions: Receiver<Completion>,
}

impl Feed {
    pub fn new(
        feed_service: Arc<dyn FeedService>,
        interaction_service: Arc<dyn InteractionService>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        let ctx = FeedContext::create();
        let (tx, rx) = unbounded();
        let store = FeedStore::new(ctx.clone(), feed_service, tx.clone());
        let mutations =
            MutationCoordinator::new(ctx.clone(), interaction_service, identity.clone(), tx);
        let viewer = identity.viewer_id();
        Self {
            ctx,
            store,
            mutations,
            sentinel: ScrollSentinel::new(),
            identity,
            viewer,
            completions: rx,
        }
    }

    pub fn context(&self) -> &FeedContext {
        &self.ctx
    }

    pub fn store(&self) -> &FeedStore {
        &self.store
    }

    pub fn mutations(&self) -> &MutationCoordinator {
        &self.mutations
    }

    pub fn sentinel(&self) -> &ScrollSentinel {
        &self.sentinel
    }

    pub fn status(&self) -> FeedStatus {
        self.store.status()
    }

    pub fn posts(&self) -> Vec<Post> {
        self.store.posts()
    }

    pub fn viewer(&self) -> Option<&str> {
        self.viewer.as_deref()
    }

    pub fn load_next_page(&mut self) -> LoadRequest {
        self.store.load_next_page()
    }

    /// Starts over from page one, dropping whatever is still in flight.
    pub fn refresh(&mut self) -> LoadRequest {
        self.reset();
        self.store.load_next_page()
    }

    pub fn like(&mut self, post_id: &str) -> Result<MutationTicket, FeedError> {
        self.mutations.apply_like(post_id)
    }

    pub fn delete(&mut self, post_id: &str) -> Result<MutationTicket, FeedError> {
        let ticket = self.mutations.apply_delete(post_id)?;
        self.sync_sentinel();
        Ok(ticket)
    }

    /// Adds a post the viewer just published to the top of the feed.
    pub fn prepend(&mut self, post: Post) -> bool {
        let added = self.store.prepend(post);
        self.sync_sentinel();
        added
    }

    /// Reports whether the sentinel element is currently on screen. Returns
    /// the load request made because of it, if any.
    pub fn on_sentinel_visibility(&mut self, visible: bool) -> LoadRequest {
        self.sync_sentinel();
        let status = self.store.status();
        if !self
            .sentinel
            .observe(visible, status.has_more, status.is_loading)
        {
            return LoadRequest::Skipped;
        }
        let request = self.store.load_next_page();
        if request == LoadRequest::Skipped {
            let last = self.ctx.read().last_id().map(str::to_string);
            self.sentinel.fetch_completed(last.as_deref());
        }
        request
    }

    /// Applies every completion that has arrived, without blocking.
    pub fn poll(&mut self) -> Vec<FeedEvent> {
        let mut events = Vec::new();
        self.observe_identity(&mut events);
        while let Ok(completion) = self.completions.try_recv() {
            self.apply(completion, &mut events);
        }
        events
    }

    /// Blocks until nothing is in flight or `timeout` passes, applying
    /// completions as they arrive.
    pub fn wait(&mut self, timeout: Duration) -> Vec<FeedEvent> {
        let deadline = Instant::now() + timeout;
        let mut events = self.poll();
        while self.ctx.in_flight() > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.completions.recv_timeout(remaining) {
                Ok(completion) => self.apply(completion, &mut events),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        events
    }

    pub fn reset(&mut self) {
        self.store.reset();
        self.sentinel.detach();
    }

    /// Tears the feed down. Completions still in flight are dropped when they
    /// arrive.
    pub fn dispose(self) {
        drop(self);
    }

    fn observe_identity(&mut self, events: &mut Vec<FeedEvent>) {
        let current = self.identity.viewer_id();
        if current != self.viewer {
            info!(from = ?self.viewer, to = ?current, "viewer changed; resetting feed");
            self.viewer = current;
            self.reset();
            events.push(FeedEvent::Reset);
        }
    }

    fn apply(&mut self, completion: Completion, events: &mut Vec<FeedEvent>) {
        self.ctx.request_finished();
        match completion {
            Completion::Page { request, result } => {
                let current = self.ctx.is_current(request.generation);
                let outcome = self.store.complete_page(request, result);
                if current {
                    let last = self.ctx.read().last_id().map(str::to_string);
                    self.sentinel.fetch_completed(last.as_deref());
                }
                match outcome {
                    Ok(appended) => events.push(FeedEvent::PageLoaded(appended)),
                    Err(err) if err.is_stale() => {
                        debug!(error = %err, "dropping stale page");
                    }
                    Err(err) => events.push(FeedEvent::PageFailed(err)),
                }
            }
            Completion::Like { ticket, result } => {
                let outcome = self.mutations.complete_like(ticket, result);
                self.push_mutation(outcome, events);
            }
            Completion::Delete { ticket, result } => {
                let outcome = self.mutations.complete_delete(ticket, result);
                self.sync_sentinel();
                self.push_mutation(outcome, events);
            }
        }
    }

    fn push_mutation(&self, outcome: MutationOutcome, events: &mut Vec<FeedEvent>) {
        if let MutationOutcome::Discarded { ticket, reason } = &outcome {
            debug!(post_id = %ticket.post_id, %reason, "dropping stale mutation result");
            return;
        }
        events.push(FeedEvent::Mutation(outcome));
    }

    fn sync_sentinel(&mut self) {
        let last = self.ctx.read().last_id().map(str::to_string);
        self.sentinel.sync_anchor(last.as_deref());
    }
}

impl Drop for Feed {
    fn drop(&mut self) {
        self.ctx.dispose();
    }
}
