use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::models::Post;

/// Everything a renderer needs to draw the feed.
#[derive(Debug, Clone)]
pub struct FeedState {
    posts: Vec<Post>,
    ids: HashSet<String>,
    pub current_page: u32,
    pub is_loading: bool,
    pub has_more: bool,
}

impl Default for FeedState {
    fn default() -> Self {
        Self {
            posts: Vec::new(),
            ids: HashSet::new(),
            current_page: 0,
            is_loading: false,
            has_more: true,
        }
    }
}

impl FeedState {
    pub fn posts(&self) -> &[Post] {
        &self.posts
    }

    pub fn len(&self) -> usize {
        self.posts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
    }

    pub fn contains(&self, post_id: &str) -> bool {
        self.ids.contains(post_id)
    }

    pub fn get(&self, post_id: &str) -> Option<&Post> {
        self.position(post_id).map(|index| &self.posts[index])
    }

    pub fn position(&self, post_id: &str) -> Option<usize> {
        if !self.ids.contains(post_id) {
            return None;
        }
        self.posts.iter().position(|post| post.id == post_id)
    }

    pub fn last_id(&self) -> Option<&str> {
        self.posts.last().map(|post| post.id.as_str())
    }

    pub fn ids(&self) -> Vec<&str> {
        self.posts.iter().map(|post| post.id.as_str()).collect()
    }

    pub(crate) fn get_mut(&mut self, post_id: &str) -> Option<&mut Post> {
        let index = self.position(post_id)?;
        self.posts.get_mut(index)
    }

    /// Appends unless the id is already present.
    pub(crate) fn push(&mut self, post: Post) -> bool {
        if !self.ids.insert(post.id.clone()) {
            return false;
        }
        self.posts.push(post);
        true
    }

    /// Inserts at `index` (clamped to the end) unless the id is already present.
    pub(crate) fn insert(&mut self, index: usize, post: Post) -> bool {
        if !self.ids.insert(post.id.clone()) {
            return false;
        }
        let index = index.min(self.posts.len());
        self.posts.insert(index, post);
        true
    }

    pub(crate) fn remove(&mut self, post_id: &str) -> Option<(usize, Post)> {
        let index = self.position(post_id)?;
        self.ids.remove(post_id);
        Some((index, self.posts.remove(index)))
    }
}

struct Shared {
    state: RwLock<FeedState>,
    generation: AtomicU64,
    disposed: AtomicBool,
    in_flight: AtomicUsize,
}

/// Handle to the state of one feed instance.
///
/// Clones share the same state. `reset` and `dispose` bump the generation so
/// work issued before them can recognise itself as stale.
#[derive(Clone)]
pub struct FeedContext {
    shared: Arc<Shared>,
}

impl FeedContext {
    pub fn create() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(FeedState::default()),
                generation: AtomicU64::new(1),
                disposed: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
            }),
        }
    }

    pub fn reset(&self) {
        let mut state = self.shared.state.write();
        *state = FeedState::default();
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn dispose(&self) {
        let mut state = self.shared.state.write();
        *state = FeedState::default();
        self.shared.disposed.store(true, Ordering::SeqCst);
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::SeqCst)
    }

    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    /// True when work tagged with `generation` may still write to this feed.
    pub fn is_current(&self, generation: u64) -> bool {
        !self.is_disposed() && self.generation() == generation
    }

    pub fn read(&self) -> RwLockReadGuard<'_, FeedState> {
        self.shared.state.read()
    }

    pub fn snapshot(&self) -> FeedState {
        self.shared.state.read().clone()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, FeedState> {
        self.shared.state.write()
    }

    /// Requests issued but whose completion has not been drained yet, across
    /// all generations.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn request_started(&self) {
        self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn request_finished(&self) {
        let _ = self
            .shared
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub(crate) fn assert_live(&self, what: &str) {
        assert!(
            !self.is_disposed(),
            "{} used after its feed context was disposed",
            what
        );
    }
}
