use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::Mutex;

use crate::api::{self, ApiError, ApiResult};
use crate::models::{Author, FeedPage, LikeState, Notification, NotificationList, Post};

pub trait FeedService: Send + Sync {
    fn fetch_feed_page(&self, page: u32) -> ApiResult<FeedPage>;
}

pub trait InteractionService: Send + Sync {
    fn send_like(&self, post_id: &str) -> ApiResult<LikeState>;
    fn send_unlike(&self, post_id: &str) -> ApiResult<LikeState>;
    fn send_delete(&self, post_id: &str) -> ApiResult<()>;
}

pub trait NotificationService: Send + Sync {
    fn list(&self) -> ApiResult<NotificationList>;
    fn mark_read(&self, notification_id: &str) -> ApiResult<()>;
    fn mark_all_read(&self) -> ApiResult<()>;
    fn delete(&self, notification_id: &str) -> ApiResult<()>;
}

/// Reports who is signed in; the feed resets whenever the answer changes.
pub trait IdentityProvider: Send + Sync {
    fn viewer_id(&self) -> Option<String>;
}

/// Fixed identity, for offline use and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    viewer: Arc<Mutex<Option<String>>>,
}

impl StaticIdentity {
    pub fn new(viewer: Option<&str>) -> Self {
        Self {
            viewer: Arc::new(Mutex::new(viewer.map(str::to_string))),
        }
    }

    pub fn set(&self, viewer: Option<&str>) {
        *self.viewer.lock() = viewer.map(str::to_string);
    }
}

impl IdentityProvider for StaticIdentity {
    fn viewer_id(&self) -> Option<String> {
        self.viewer.lock().clone()
    }
}

pub struct ApiFeedService {
    client: Arc<api::Client>,
}

impl ApiFeedService {
    pub fn new(client: Arc<api::Client>) -> Self {
        Self { client }
    }
}

impl FeedService for ApiFeedService {
    fn fetch_feed_page(&self, page: u32) -> ApiResult<FeedPage> {
        self.client.feed(page)
    }
}

/// The server exposes a single toggle endpoint, so like and unlike both hit it
/// and trust the liker set it answers with.
pub struct ApiInteractionService {
    client: Arc<api::Client>,
}

impl ApiInteractionService {
    pub fn new(client: Arc<api::Client>) -> Self {
        Self { client }
    }
}

impl InteractionService for ApiInteractionService {
    fn send_like(&self, post_id: &str) -> ApiResult<LikeState> {
        self.client.like_post(post_id)
    }

    fn send_unlike(&self, post_id: &str) -> ApiResult<LikeState> {
        self.client.like_post(post_id)
    }

    fn send_delete(&self, post_id: &str) -> ApiResult<()> {
        self.client.delete_post(post_id)
    }
}

pub struct ApiNotificationService {
    client: Arc<api::Client>,
}

impl ApiNotificationService {
    pub fn new(client: Arc<api::Client>) -> Self {
        Self { client }
    }
}

impl NotificationService for ApiNotificationService {
    fn list(&self) -> ApiResult<NotificationList> {
        self.client.notifications()
    }

    fn mark_read(&self, notification_id: &str) -> ApiResult<()> {
        self.client.mark_notification_read(notification_id)
    }

    fn mark_all_read(&self) -> ApiResult<()> {
        self.client.mark_all_notifications_read()
    }

    fn delete(&self, notification_id: &str) -> ApiResult<()> {
        self.client.delete_notification(notification_id)
    }
}

/// In-memory feed split into fixed-size pages.
pub struct MockFeedService {
    posts: Vec<Post>,
    page_size: usize,
    failing_pages: Mutex<HashSet<u32>>,
}

impl MockFeedService {
    pub fn new(posts: Vec<Post>, page_size: usize) -> Self {
        Self {
            posts,
            page_size: page_size.max(1),
            failing_pages: Mutex::new(HashSet::new()),
        }
    }

    /// Makes the next request for `page` fail with a transport-style error.
    pub fn fail_page_once(&self, page: u32) {
        self.failing_pages.lock().insert(page);
    }
}

impl Default for MockFeedService {
    fn default() -> Self {
        Self::new(sample_posts(12), 5)
    }
}

impl FeedService for MockFeedService {
    fn fetch_feed_page(&self, page: u32) -> ApiResult<FeedPage> {
        if self.failing_pages.lock().remove(&page) {
            return Err(ApiError::Status {
                status: 503,
                message: "service unavailable".into(),
            });
        }
        let start = (page.saturating_sub(1) as usize) * self.page_size;
        let end = (start + self.page_size).min(self.posts.len());
        let posts = if start < end {
            self.posts[start..end].to_vec()
        } else {
            Vec::new()
        };
        Ok(FeedPage {
            posts,
            page,
            has_more: end < self.posts.len(),
        })
    }
}

/// Keeps its own authoritative liker sets so it answers like a real server.
pub struct MockInteractionService {
    viewer_id: String,
    likes: Mutex<std::collections::HashMap<String, LikeState>>,
    failures: Mutex<HashSet<String>>,
    rejections: Mutex<HashSet<String>>,
}

impl MockInteractionService {
    pub fn new(viewer_id: &str, posts: &[Post]) -> Self {
        let likes = posts
            .iter()
            .map(|post| (post.id.clone(), post.like_state()))
            .collect();
        Self {
            viewer_id: viewer_id.to_string(),
            likes: Mutex::new(likes),
            failures: Mutex::new(HashSet::new()),
            rejections: Mutex::new(HashSet::new()),
        }
    }

    /// Every request touching `post_id` fails as if the network dropped.
    pub fn fail_post(&self, post_id: &str) {
        self.failures.lock().insert(post_id.to_string());
    }

    /// Every request touching `post_id` is refused by the server.
    pub fn reject_post(&self, post_id: &str) {
        self.rejections.lock().insert(post_id.to_string());
    }

    fn check(&self, post_id: &str) -> ApiResult<()> {
        if self.failures.lock().contains(post_id) {
            return Err(ApiError::Status {
                status: 502,
                message: "bad gateway".into(),
            });
        }
        if self.rejections.lock().contains(post_id) {
            return Err(ApiError::NotFound("Post not found".into()));
        }
        Ok(())
    }

    fn set_liked(&self, post_id: &str, liked: bool) -> ApiResult<LikeState> {
        self.check(post_id)?;
        let mut likes = self.likes.lock();
        let state = likes.entry(post_id.to_string()).or_default();
        let changed = if liked {
            state.likes.insert(self.viewer_id.clone())
        } else {
            state.likes.remove(&self.viewer_id)
        };
        if changed {
            state.likes_count = state.likes.len() as u64;
        }
        Ok(state.clone())
    }
}

impl InteractionService for MockInteractionService {
    fn send_like(&self, post_id: &str) -> ApiResult<LikeState> {
        self.set_liked(post_id, true)
    }

    fn send_unlike(&self, post_id: &str) -> ApiResult<LikeState> {
        self.set_liked(post_id, false)
    }

    fn send_delete(&self, post_id: &str) -> ApiResult<()> {
        self.check(post_id)?;
        self.likes.lock().remove(post_id);
        Ok(())
    }
}

pub struct MockNotificationService {
    items: Mutex<Vec<Notification>>,
    failing: Mutex<bool>,
}

impl MockNotificationService {
    pub fn new(items: Vec<Notification>) -> Self {
        Self {
            items: Mutex::new(items),
            failing: Mutex::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    fn check(&self) -> ApiResult<()> {
        if *self.failing.lock() {
            Err(ApiError::Status {
                status: 503,
                message: "service unavailable".into(),
            })
        } else {
            Ok(())
        }
    }
}

impl Default for MockNotificationService {
    fn default() -> Self {
        Self::new(sample_notifications())
    }
}

impl NotificationService for MockNotificationService {
    fn list(&self) -> ApiResult<NotificationList> {
        self.check()?;
        let items = self.items.lock().clone();
        let unread_count = items.iter().filter(|n| !n.is_read).count() as u64;
        Ok(NotificationList {
            notifications: items,
            unread_count,
        })
    }

    fn mark_read(&self, notification_id: &str) -> ApiResult<()> {
        self.check()?;
        let mut items = self.items.lock();
        let item = items
            .iter_mut()
            .find(|n| n.id == notification_id)
            .ok_or_else(|| ApiError::NotFound("Notification not found".into()))?;
        item.is_read = true;
        Ok(())
    }

    fn mark_all_read(&self) -> ApiResult<()> {
        self.check()?;
        for item in self.items.lock().iter_mut() {
            item.is_read = true;
        }
        Ok(())
    }

    fn delete(&self, notification_id: &str) -> ApiResult<()> {
        self.check()?;
        let mut items = self.items.lock();
        let before = items.len();
        items.retain(|n| n.id != notification_id);
        if items.len() == before {
            return Err(ApiError::NotFound("Notification not found".into()));
        }
        Ok(())
    }
}

pub fn sample_author(id: &str) -> Author {
    Author {
        id: id.to_string(),
        username: id.to_string(),
        first_name: String::new(),
        last_name: String::new(),
        avatar: None,
    }
}

pub fn sample_post(id: &str) -> Post {
    Post {
        id: id.to_string(),
        author: sample_author("murmur"),
        content: Some(format!("Post {}", id)),
        media: Vec::new(),
        likes: HashSet::new(),
        likes_count: 0,
        comments_count: 0,
        created_at: Utc
            .timestamp_opt(1_700_000_000, 0)
            .single()
            .unwrap_or_else(Utc::now),
    }
}

pub fn sample_posts(count: usize) -> Vec<Post> {
    (1..=count)
        .map(|n| {
            let mut post = sample_post(&format!("p{}", n));
            post.created_at = post.created_at - ChronoDuration::minutes(n as i64 * 7);
            post.comments_count = (n % 4) as u64;
            post
        })
        .collect()
}

pub fn sample_notifications() -> Vec<Notification> {
    let now = Utc::now();
    vec![
        Notification {
            id: "n1".into(),
            kind: "like".into(),
            sender: sample_author("grace"),
            message: "liked your post".into(),
            is_read: false,
            post: Some("p1".into()),
            created_at: now - ChronoDuration::minutes(3),
        },
        Notification {
            id: "n2".into(),
            kind: "comment".into(),
            sender: sample_author("linus"),
            message: "commented on your post".into(),
            is_read: false,
            post: Some("p2".into()),
            created_at: now - ChronoDuration::hours(2),
        },
        Notification {
            id: "n3".into(),
            kind: "follow".into(),
            sender: sample_author("barbara"),
            message: "started following you".into(),
            is_read: true,
            post: None,
            created_at: now - ChronoDuration::days(1),
        },
    ]
}
