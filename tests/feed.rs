use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use murmur::api::{ApiError, ApiResult};
use murmur::data::{
    sample_post, FeedService, InteractionService, MockInteractionService, StaticIdentity,
};
use murmur::error::{FeedError, StaleReason};
use murmur::feed::{Feed, FeedEvent, LoadRequest, MutationOutcome, SentinelState};
use murmur::models::{FeedPage, LikeState, Post};

const VIEWER: &str = "me";
const WAIT: Duration = Duration::from_secs(5);

/// Serves fixed pages, counting requests and optionally holding each one
/// until the test releases it.
struct ScriptedFeed {
    pages: HashMap<u32, FeedPage>,
    calls: AtomicUsize,
    gate: Option<Receiver<()>>,
}

impl ScriptedFeed {
    fn new(pages: Vec<FeedPage>) -> Self {
        Self {
            pages: pages.into_iter().map(|p| (p.page, p)).collect(),
            calls: AtomicUsize::new(0),
            gate: None,
        }
    }

    fn gated(pages: Vec<FeedPage>) -> (Self, Sender<()>) {
        let (tx, rx) = unbounded();
        let mut feed = Self::new(pages);
        feed.gate = Some(rx);
        (feed, tx)
    }

    /// Answers requests for `requested` with `page` whatever its number.
    fn answer(mut self, requested: u32, page: FeedPage) -> Self {
        self.pages.insert(requested, page);
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FeedService for ScriptedFeed {
    fn fetch_feed_page(&self, page: u32) -> ApiResult<FeedPage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let _ = gate.recv_timeout(WAIT);
        }
        self.pages
            .get(&page)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("page {page}")))
    }
}

fn page(number: u32, ids: &[&str], has_more: bool) -> FeedPage {
    FeedPage {
        posts: ids.iter().map(|id| sample_post(id)).collect(),
        page: number,
        has_more,
    }
}

fn all_posts(pages: &[FeedPage]) -> Vec<Post> {
    pages.iter().flat_map(|p| p.posts.clone()).collect()
}

struct Fixture {
    feed: Feed,
    service: Arc<ScriptedFeed>,
    interactions: Arc<MockInteractionService>,
    identity: Arc<StaticIdentity>,
}

fn fixture(service: ScriptedFeed, known_posts: &[Post]) -> Fixture {
    let service = Arc::new(service);
    let interactions = Arc::new(MockInteractionService::new(VIEWER, known_posts));
    let identity = Arc::new(StaticIdentity::new(Some(VIEWER)));
    let feed = Feed::new(service.clone(), interactions.clone(), identity.clone());
    Fixture {
        feed,
        service,
        interactions,
        identity,
    }
}

fn loaded(pages: Vec<FeedPage>, count: u32) -> Fixture {
    let posts = all_posts(&pages);
    let mut fx = fixture(ScriptedFeed::new(pages), &posts);
    for _ in 0..count {
        assert!(matches!(fx.feed.load_next_page(), LoadRequest::Requested(_)));
        fx.feed.wait(WAIT);
    }
    fx
}

/// Polls until at least one event arrives.
fn next_events(feed: &mut Feed) -> Vec<FeedEvent> {
    let deadline = Instant::now() + WAIT;
    loop {
        let events = feed.poll();
        if !events.is_empty() || Instant::now() >= deadline {
            return events;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn ids(feed: &Feed) -> Vec<String> {
    feed.posts().into_iter().map(|p| p.id).collect()
}

fn post(feed: &Feed, id: &str) -> Post {
    feed.posts()
        .into_iter()
        .find(|p| p.id == id)
        .unwrap_or_else(|| panic!("post {id} missing"))
}

#[test]
fn contiguous_pages_concatenate_without_duplicates() {
    let fx = loaded(
        vec![
            page(1, &["a", "b", "c"], true),
            page(2, &["c", "d"], true),
            page(3, &["e", "a", "f"], false),
        ],
        3,
    );
    assert_eq!(ids(&fx.feed), vec!["a", "b", "c", "d", "e", "f"]);
    let status = fx.feed.status();
    assert_eq!(status.current_page, 3);
    assert!(!status.has_more);
}

#[test]
fn old_page_number_leaves_posts_untouched() {
    let fx = loaded(
        vec![page(1, &["a", "b"], true), page(2, &["c"], true)],
        2,
    );
    let before = fx.feed.posts();

    for stale in [page(1, &["x"], true), page(2, &["y"], false)] {
        let number = stale.page;
        let err = fx.feed.store().append_page(stale).unwrap_err();
        assert_eq!(
            err,
            FeedError::StaleResponse(StaleReason::PageOutOfOrder {
                expected: 3,
                received: number,
            })
        );
    }
    assert_eq!(fx.feed.posts(), before);
    assert!(fx.feed.status().has_more);
}

#[test]
fn only_one_fetch_in_flight() {
    let (service, release) = ScriptedFeed::gated(vec![page(1, &["a"], true)]);
    let mut fx = fixture(service, &[]);

    assert_eq!(fx.feed.load_next_page(), LoadRequest::Requested(1));
    for _ in 0..5 {
        assert_eq!(fx.feed.load_next_page(), LoadRequest::Skipped);
    }
    assert!(fx.feed.status().is_loading);

    release.send(()).unwrap();
    let events = fx.feed.wait(WAIT);
    assert!(matches!(events.as_slice(), [FeedEvent::PageLoaded(p)] if p.page == 1));
    assert_eq!(fx.service.calls(), 1);
    assert!(!fx.feed.status().is_loading);
}

#[test]
fn failed_like_restores_exact_state() {
    let mut liked_by_others = sample_post("b");
    liked_by_others.likes.insert("someone".into());
    liked_by_others.likes_count = 7;
    let first = FeedPage {
        posts: vec![sample_post("a"), liked_by_others, sample_post("c")],
        page: 1,
        has_more: true,
    };
    let mut fx = loaded(vec![first], 1);
    let before = post(&fx.feed, "b");

    fx.interactions.fail_post("b");
    fx.feed.like("b").unwrap();
    let optimistic = post(&fx.feed, "b");
    assert!(optimistic.is_liked_by(VIEWER));
    assert_eq!(optimistic.likes_count, 8);

    let events = fx.feed.wait(WAIT);
    match events.as_slice() {
        [FeedEvent::Mutation(MutationOutcome::RolledBack { ticket, error })] => {
            assert_eq!(ticket.post_id, "b");
            assert!(error.is_retriable());
        }
        other => panic!("unexpected events {other:?}"),
    }
    assert_eq!(post(&fx.feed, "b"), before);
    assert!(!fx.feed.mutations().is_pending("b"));
}

#[test]
fn failed_delete_reinserts_at_original_index() {
    let mut fx = loaded(
        vec![page(1, &["a", "b", "c"], true), page(2, &["d", "e"], false)],
        2,
    );
    let before = fx.feed.posts();

    fx.interactions.fail_post("c");
    fx.feed.delete("c").unwrap();
    assert_eq!(ids(&fx.feed), vec!["a", "b", "d", "e"]);

    let events = fx.feed.wait(WAIT);
    assert!(matches!(
        events.as_slice(),
        [FeedEvent::Mutation(MutationOutcome::RolledBack { .. })]
    ));
    assert_eq!(fx.feed.posts(), before);
}

#[test]
fn reset_empties_the_feed_and_drops_late_pages() {
    let (service, release) = ScriptedFeed::gated(vec![
        page(1, &["a", "b"], true),
        page(2, &["c"], true),
    ]);
    let mut fx = fixture(service, &[]);
    fx.feed.load_next_page();
    release.send(()).unwrap();
    fx.feed.wait(WAIT);
    assert_eq!(fx.feed.status().len, 2);

    fx.feed.load_next_page();
    fx.feed.reset();
    release.send(()).unwrap();
    let events = fx.feed.wait(WAIT);
    assert!(events.is_empty(), "late page surfaced: {events:?}");

    for _ in 0..3 {
        let status = fx.feed.status();
        assert_eq!(status.len, 0);
        assert_eq!(status.current_page, 0);
        assert!(status.has_more);
        assert!(!status.is_loading);
        assert!(fx.feed.posts().is_empty());
    }
    assert_eq!(fx.feed.sentinel().state(), SentinelState::Idle);
}

#[test]
fn last_page_ends_pagination() {
    let mut fx = loaded(
        vec![page(1, &["A", "B", "C"], true), page(2, &["D", "E"], false)],
        1,
    );
    assert_eq!(ids(&fx.feed), vec!["A", "B", "C"]);

    assert_eq!(fx.feed.load_next_page(), LoadRequest::Requested(2));
    fx.feed.wait(WAIT);
    assert_eq!(ids(&fx.feed), vec!["A", "B", "C", "D", "E"]);

    for _ in 0..3 {
        assert_eq!(fx.feed.load_next_page(), LoadRequest::Skipped);
        fx.feed.on_sentinel_visibility(false);
        assert_eq!(fx.feed.on_sentinel_visibility(true), LoadRequest::Skipped);
    }
    assert_eq!(fx.service.calls(), 2);
    assert_eq!(ids(&fx.feed), vec!["A", "B", "C", "D", "E"]);
}

#[test]
fn like_shows_immediately_and_reverts_on_failure() {
    let mut fx = loaded(vec![page(1, &["A", "B", "C"], true)], 1);
    let before = post(&fx.feed, "B");
    assert!(!before.is_liked_by(VIEWER));

    fx.interactions.fail_post("B");
    fx.feed.like("B").unwrap();
    let shown = post(&fx.feed, "B");
    assert!(shown.is_liked_by(VIEWER));
    assert_eq!(shown.likes_count, before.likes_count + 1);

    fx.feed.wait(WAIT);
    let settled = post(&fx.feed, "B");
    assert!(!settled.is_liked_by(VIEWER));
    assert_eq!(settled.likes_count, before.likes_count);
}

#[test]
fn successful_like_commits_server_state() {
    let mut fx = loaded(vec![page(1, &["a", "b"], true)], 1);
    fx.feed.like("a").unwrap();
    let events = fx.feed.wait(WAIT);
    assert!(matches!(
        events.as_slice(),
        [FeedEvent::Mutation(MutationOutcome::Committed { reconciled: false, .. })]
    ));
    let settled = post(&fx.feed, "a");
    assert!(settled.is_liked_by(VIEWER));
    assert_eq!(settled.likes_count, 1);
}

#[test]
fn sentinel_fetches_once_per_edge() {
    let (service, release) = ScriptedFeed::gated(vec![
        page(1, &["a", "b"], true),
        page(2, &["c", "d"], true),
        page(3, &["e"], false),
    ]);
    let mut fx = fixture(service, &[]);
    fx.feed.load_next_page();
    release.send(()).unwrap();
    fx.feed.wait(WAIT);
    assert_eq!(fx.feed.sentinel().anchor(), Some("b"));

    assert_eq!(fx.feed.on_sentinel_visibility(true), LoadRequest::Requested(2));
    assert_eq!(fx.feed.on_sentinel_visibility(true), LoadRequest::Skipped);
    assert_eq!(fx.feed.on_sentinel_visibility(false), LoadRequest::Skipped);
    assert_eq!(fx.feed.on_sentinel_visibility(true), LoadRequest::Skipped);
    release.send(()).unwrap();
    fx.feed.wait(WAIT);
    assert_eq!(fx.feed.sentinel().anchor(), Some("d"));

    // The new anchor is a fresh element, so seeing it counts as an edge.
    assert_eq!(fx.feed.on_sentinel_visibility(true), LoadRequest::Requested(3));
    release.send(()).unwrap();
    fx.feed.wait(WAIT);

    assert_eq!(fx.service.calls(), 3);
    assert_eq!(ids(&fx.feed), vec!["a", "b", "c", "d", "e"]);
}

#[test]
fn failed_page_can_be_retried() {
    let mut fx = fixture(ScriptedFeed::new(vec![page(2, &["x"], false)]), &[]);
    fx.feed.load_next_page();
    let events = fx.feed.wait(WAIT);
    match events.as_slice() {
        [FeedEvent::PageFailed(err)] => assert!(matches!(err, FeedError::Conflict(_))),
        other => panic!("unexpected events {other:?}"),
    }
    let status = fx.feed.status();
    assert!(!status.is_loading);
    assert_eq!(status.current_page, 0);
    assert_eq!(fx.feed.load_next_page(), LoadRequest::Requested(1));
    fx.feed.wait(WAIT);
}

#[test]
fn viewer_change_resets_the_feed() {
    let mut fx = loaded(vec![page(1, &["a", "b"], true)], 1);
    assert_eq!(fx.feed.viewer(), Some(VIEWER));

    fx.identity.set(Some("someone-else"));
    let events = fx.feed.poll();
    assert_eq!(events, vec![FeedEvent::Reset]);
    assert_eq!(fx.feed.viewer(), Some("someone-else"));
    assert!(fx.feed.posts().is_empty());

    fx.identity.set(None);
    fx.feed.poll();
    assert_eq!(
        fx.feed.like("a").unwrap_err(),
        FeedError::NotSignedIn
    );
}

#[test]
fn dispose_marks_the_context() {
    let fx = loaded(vec![page(1, &["a"], true)], 1);
    let ctx = fx.feed.context().clone();
    assert!(!ctx.is_disposed());
    fx.feed.dispose();
    assert!(ctx.is_disposed());
}

#[test]
fn mismatched_page_answer_releases_the_loading_flag() {
    let service = ScriptedFeed::new(vec![page(1, &["a", "b"], true)])
        .answer(2, page(1, &["x", "y"], true));
    let mut fx = fixture(service, &[]);
    fx.feed.load_next_page();
    fx.feed.wait(WAIT);
    let before = fx.feed.posts();

    assert_eq!(fx.feed.load_next_page(), LoadRequest::Requested(2));
    let events = fx.feed.wait(WAIT);
    assert!(events.is_empty(), "mismatched page surfaced: {events:?}");

    let status = fx.feed.status();
    assert!(!status.is_loading);
    assert_eq!(status.current_page, 1);
    assert_eq!(fx.feed.posts(), before);
    assert_eq!(fx.feed.load_next_page(), LoadRequest::Requested(2));
    fx.feed.wait(WAIT);
    assert_eq!(fx.service.calls(), 3);
}

/// Holds each post's like until the test releases it, then succeeds unless
/// the post is listed as failing.
struct GatedLikes {
    gates: HashMap<String, Receiver<()>>,
    failing: Vec<String>,
}

impl InteractionService for GatedLikes {
    fn send_like(&self, post_id: &str) -> ApiResult<LikeState> {
        if let Some(gate) = self.gates.get(post_id) {
            let _ = gate.recv_timeout(WAIT);
        }
        if self.failing.iter().any(|id| id == post_id) {
            return Err(ApiError::Status {
                status: 503,
                message: "unavailable".into(),
            });
        }
        let mut state = LikeState::default();
        state.likes.insert(VIEWER.into());
        state.likes_count = 3;
        Ok(state)
    }

    fn send_unlike(&self, post_id: &str) -> ApiResult<LikeState> {
        self.send_like(post_id)
    }

    fn send_delete(&self, _post_id: &str) -> ApiResult<()> {
        Ok(())
    }
}

#[test]
fn likes_on_different_posts_settle_independently() {
    let (release_a, gate_a) = unbounded();
    let (release_b, gate_b) = unbounded();
    let interactions = GatedLikes {
        gates: HashMap::from([("a".to_string(), gate_a), ("b".to_string(), gate_b)]),
        failing: vec!["a".into()],
    };
    let mut feed = Feed::new(
        Arc::new(ScriptedFeed::new(vec![page(1, &["a", "b", "c"], true)])),
        Arc::new(interactions),
        Arc::new(StaticIdentity::new(Some(VIEWER))),
    );
    feed.load_next_page();
    feed.wait(WAIT);

    feed.like("a").unwrap();
    feed.like("b").unwrap();
    assert!(post(&feed, "a").is_liked_by(VIEWER));
    assert!(post(&feed, "b").is_liked_by(VIEWER));

    release_b.send(()).unwrap();
    match next_events(&mut feed).as_slice() {
        [FeedEvent::Mutation(MutationOutcome::Committed { ticket, reconciled: true })] => {
            assert_eq!(ticket.post_id, "b");
        }
        other => panic!("unexpected events {other:?}"),
    }
    assert!(feed.mutations().is_pending("a"));
    assert!(post(&feed, "a").is_liked_by(VIEWER));

    release_a.send(()).unwrap();
    match feed.wait(WAIT).as_slice() {
        [FeedEvent::Mutation(MutationOutcome::RolledBack { ticket, .. })] => {
            assert_eq!(ticket.post_id, "a");
        }
        other => panic!("unexpected events {other:?}"),
    }

    let a = post(&feed, "a");
    assert!(!a.is_liked_by(VIEWER));
    assert_eq!(a.likes_count, 0);
    let b = post(&feed, "b");
    assert!(b.is_liked_by(VIEWER));
    assert_eq!(b.likes_count, 3);
    assert!(!post(&feed, "c").is_liked_by(VIEWER));
}

#[test]
fn prepended_post_leads_the_feed_once() {
    let mut fx = loaded(vec![page(1, &["a", "b"], true)], 1);
    let anchor = fx.feed.sentinel().anchor().map(str::to_string);

    assert!(fx.feed.prepend(sample_post("mine")));
    assert!(!fx.feed.prepend(sample_post("mine")));
    assert_eq!(ids(&fx.feed), vec!["mine", "a", "b"]);
    assert_eq!(fx.feed.sentinel().anchor().map(str::to_string), anchor);

    fx.feed.like("mine").unwrap();
    fx.feed.wait(WAIT);
    assert!(post(&fx.feed, "mine").is_liked_by(VIEWER));
}
