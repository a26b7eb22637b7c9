use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::Sender;
use tracing::{debug, warn};

use super::context::FeedContext;
use super::Completion;
use crate::data::{IdentityProvider, InteractionService};
use crate::error::{FeedError, StaleReason};
use crate::models::{LikeState, Post};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Like,
    Unlike,
    Delete,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MutationKind::Like => "like",
            MutationKind::Unlike => "unlike",
            MutationKind::Delete => "delete",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPhase {
    Pending,
    Committed,
    RolledBack,
}

/// What a failed mutation restores.
#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot {
    Likes(LikeState),
    Removed { index: usize, post: Post },
}

/// Identifies one issued mutation. Completions carry it back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationTicket {
    pub post_id: String,
    pub kind: MutationKind,
    pub sequence: u64,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingMutation {
    pub post_id: String,
    pub kind: MutationKind,
    pub sequence: u64,
    snapshot: Snapshot,
    phase: MutationPhase,
}

impl PendingMutation {
    fn new(post_id: &str, kind: MutationKind, sequence: u64, snapshot: Snapshot) -> Self {
        Self {
            post_id: post_id.to_string(),
            kind,
            sequence,
            snapshot,
            phase: MutationPhase::Pending,
        }
    }

    pub fn phase(&self) -> MutationPhase {
        self.phase
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    fn commit(&mut self) {
        debug_assert_eq!(self.phase, MutationPhase::Pending);
        self.phase = MutationPhase::Committed;
    }

    fn roll_back(&mut self) {
        debug_assert_eq!(self.phase, MutationPhase::Pending);
        self.phase = MutationPhase::RolledBack;
    }

    /// An older mutation on the same post settled, so this one now restores
    /// to a different base if it fails.
    fn rebase(&mut self, base: LikeState) {
        match &mut self.snapshot {
            Snapshot::Likes(current) => *current = base,
            Snapshot::Removed { post, .. } => post.set_like_state(base),
        }
    }
}

/// How a completed mutation was settled, for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    /// The server accepted it. `reconciled` is true when its answer differed
    /// from the local prediction and replaced it.
    Committed {
        ticket: MutationTicket,
        reconciled: bool,
    },
    /// The server refused or never answered; local state was restored.
    RolledBack {
        ticket: MutationTicket,
        error: FeedError,
    },
    /// Failed, but a newer mutation on the post already committed, so the
    /// visible state was left alone.
    Failed {
        ticket: MutationTicket,
        error: FeedError,
    },
    Discarded {
        ticket: MutationTicket,
        reason: StaleReason,
    },
}

impl MutationOutcome {
    pub fn ticket(&self) -> &MutationTicket {
        match self {
            MutationOutcome::Committed { ticket, .. }
            | MutationOutcome::RolledBack { ticket, .. }
            | MutationOutcome::Failed { ticket, .. }
            | MutationOutcome::Discarded { ticket, .. } => ticket,
        }
    }

    pub fn error(&self) -> Option<&FeedError> {
        match self {
            MutationOutcome::RolledBack { error, .. } | MutationOutcome::Failed { error, .. } => {
                Some(error)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct PostMutations {
    in_flight: BTreeMap<u64, PendingMutation>,
    last_committed: u64,
}

pub struct MutationCoordinator {
    ctx: FeedContext,
    service: Arc<dyn InteractionService>,
    identity: Arc<dyn IdentityProvider>,
    completions: Sender<Completion>,
    generation: u64,
    next_sequence: u64,
    posts: HashMap<String, PostMutations>,
}

impl MutationCoordinator {
    pub(crate) fn new(
        ctx: FeedContext,
        service: Arc<dyn InteractionService>,
        identity: Arc<dyn IdentityProvider>,
        completions: Sender<Completion>,
    ) -> Self {
        let generation = ctx.generation();
        Self {
            ctx,
            service,
            identity,
            completions,
            generation,
            next_sequence: 1,
            posts: HashMap::new(),
        }
    }

    /// Mutations issued and not yet settled, oldest first.
    pub fn pending(&self) -> Vec<&PendingMutation> {
        let mut pending: Vec<_> = self
            .posts
            .values()
            .flat_map(|entry| entry.in_flight.values())
            .collect();
        pending.sort_by_key(|mutation| mutation.sequence);
        pending
    }

    pub fn is_pending(&self, post_id: &str) -> bool {
        self.posts
            .get(post_id)
            .is_some_and(|entry| !entry.in_flight.is_empty())
    }

    /// Toggles the viewer's like on `post_id` right away and sends it.
    pub fn apply_like(&mut self, post_id: &str) -> Result<MutationTicket, FeedError> {
        self.ctx.assert_live("mutation coordinator");
        self.sync_generation();
        let viewer = self.identity.viewer_id().ok_or(FeedError::NotSignedIn)?;

        let (kind, before) = {
            let mut state = self.ctx.write();
            let post = state
                .get_mut(post_id)
                .ok_or_else(|| FeedError::UnknownPost {
                    id: post_id.to_string(),
                })?;
            let before = post.like_state();
            let liked = post.is_liked_by(&viewer);
            post.toggle_like(&viewer, !liked);
            let kind = if liked {
                MutationKind::Unlike
            } else {
                MutationKind::Like
            };
            (kind, before)
        };

        let ticket = self.record(post_id, kind, Snapshot::Likes(before));
        debug!(post_id, sequence = ticket.sequence, ?kind, "optimistic like applied");

        self.ctx.request_started();
        let service = Arc::clone(&self.service);
        let tx = self.completions.clone();
        let sent = ticket.clone();
        thread::spawn(move || {
            let result = match sent.kind {
                MutationKind::Unlike => service.send_unlike(&sent.post_id),
                _ => service.send_like(&sent.post_id),
            }
            .map_err(FeedError::from);
            let _ = tx.send(Completion::Like {
                ticket: sent,
                result,
            });
        });
        Ok(ticket)
    }

    /// Removes `post_id` from the feed right away and sends the delete.
    pub fn apply_delete(&mut self, post_id: &str) -> Result<MutationTicket, FeedError> {
        self.ctx.assert_live("mutation coordinator");
        self.sync_generation();

        let (index, post) =
            self.ctx
                .write()
                .remove(post_id)
                .ok_or_else(|| FeedError::UnknownPost {
                    id: post_id.to_string(),
                })?;

        let ticket = self.record(
            post_id,
            MutationKind::Delete,
            Snapshot::Removed { index, post },
        );
        debug!(post_id, sequence = ticket.sequence, index, "optimistic delete applied");

        self.ctx.request_started();
        let service = Arc::clone(&self.service);
        let tx = self.completions.clone();
        let sent = ticket.clone();
        thread::spawn(move || {
            let result = service
                .send_delete(&sent.post_id)
                .map_err(FeedError::from);
            let _ = tx.send(Completion::Delete {
                ticket: sent,
                result,
            });
        });
        Ok(ticket)
    }

    pub(crate) fn complete_like(
        &mut self,
        ticket: MutationTicket,
        result: Result<LikeState, FeedError>,
    ) -> MutationOutcome {
        let mut mutation = match self.take(&ticket) {
            Ok(mutation) => mutation,
            Err(reason) => return MutationOutcome::Discarded { ticket, reason },
        };
        let seq = ticket.sequence;

        match result {
            Ok(server) => {
                mutation.commit();
                let entry = self.posts.entry(ticket.post_id.clone()).or_default();
                entry.last_committed = entry.last_committed.max(seq);

                let newer = entry.in_flight.range_mut(seq + 1..).next();
                let reconciled = match newer {
                    Some((_, next)) => {
                        next.rebase(server);
                        false
                    }
                    None => {
                        let mut state = self.ctx.write();
                        match state.get_mut(&ticket.post_id) {
                            Some(post) if post.like_state() != server => {
                                post.set_like_state(server);
                                true
                            }
                            _ => false,
                        }
                    }
                };
                self.prune(&ticket.post_id);
                MutationOutcome::Committed { ticket, reconciled }
            }
            Err(error) => {
                let entry = self.posts.entry(ticket.post_id.clone()).or_default();
                if entry.last_committed > seq {
                    debug!(post_id = %ticket.post_id, sequence = seq, "newer like committed; skipping rollback");
                    self.prune(&ticket.post_id);
                    return MutationOutcome::Failed { ticket, error };
                }

                mutation.roll_back();
                if let Snapshot::Likes(before) = mutation.snapshot {
                    match entry.in_flight.range_mut(seq + 1..).next() {
                        Some((_, next)) => next.rebase(before),
                        None => {
                            if let Some(post) = self.ctx.write().get_mut(&ticket.post_id) {
                                post.set_like_state(before);
                            }
                        }
                    }
                }
                warn!(post_id = %ticket.post_id, error = %error, "like rolled back");
                self.prune(&ticket.post_id);
                MutationOutcome::RolledBack { ticket, error }
            }
        }
    }

    pub(crate) fn complete_delete(
        &mut self,
        ticket: MutationTicket,
        result: Result<(), FeedError>,
    ) -> MutationOutcome {
        let mut mutation = match self.take(&ticket) {
            Ok(mutation) => mutation,
            Err(reason) => return MutationOutcome::Discarded { ticket, reason },
        };
        let seq = ticket.sequence;
        let post_id = ticket.post_id.clone();

        let outcome = match result {
            Ok(()) => {
                mutation.commit();
                let entry = self.posts.entry(ticket.post_id.clone()).or_default();
                entry.last_committed = entry.last_committed.max(seq);
                MutationOutcome::Committed {
                    ticket,
                    reconciled: false,
                }
            }
            Err(error) => {
                let entry = self.posts.entry(ticket.post_id.clone()).or_default();
                if entry.last_committed > seq {
                    MutationOutcome::Failed { ticket, error }
                } else {
                    mutation.roll_back();
                    if let Snapshot::Removed { index, post } = mutation.snapshot {
                        if !self.ctx.write().insert(index, post) {
                            debug!(post_id = %ticket.post_id, "post came back before rollback");
                        }
                    }
                    warn!(post_id = %ticket.post_id, error = %error, "delete rolled back");
                    MutationOutcome::RolledBack { ticket, error }
                }
            }
        };
        self.prune(&post_id);
        outcome
    }

    fn record(&mut self, post_id: &str, kind: MutationKind, snapshot: Snapshot) -> MutationTicket {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.posts
            .entry(post_id.to_string())
            .or_default()
            .in_flight
            .insert(
                sequence,
                PendingMutation::new(post_id, kind, sequence, snapshot),
            );
        MutationTicket {
            post_id: post_id.to_string(),
            kind,
            sequence,
            generation: self.generation,
        }
    }

    /// Pulls the pending record for `ticket`, or explains why it cannot apply.
    fn take(&mut self, ticket: &MutationTicket) -> Result<PendingMutation, StaleReason> {
        if !self.ctx.is_current(ticket.generation) {
            debug!(post_id = %ticket.post_id, sequence = ticket.sequence, "discarding mutation from a previous feed");
            return Err(StaleReason::Superseded);
        }
        self.sync_generation();
        self.posts
            .get_mut(&ticket.post_id)
            .and_then(|entry| entry.in_flight.remove(&ticket.sequence))
            .ok_or_else(|| StaleReason::MutationSuperseded {
                post_id: ticket.post_id.clone(),
                sequence: ticket.sequence,
            })
    }

    fn prune(&mut self, post_id: &str) {
        if self
            .posts
            .get(post_id)
            .is_some_and(|entry| entry.in_flight.is_empty())
        {
            self.posts.remove(post_id);
        }
    }

    /// Drops bookkeeping that belongs to a feed generation that was reset.
    fn sync_generation(&mut self) {
        let current = self.ctx.generation();
        if current != self.generation {
            self.generation = current;
            self.posts.clear();
        }
    }
}
