use std::sync::Arc;
use std::thread;

use crossbeam_channel::Sender;
use tracing::{debug, warn};

use super::context::FeedContext;
use super::Completion;
use crate::data::FeedService;
use crate::error::{FeedError, StaleReason};
use crate::models::{FeedPage, Post};

/// A page fetch that has been handed to a worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadRequest {
    Requested(u32),
    /// A fetch is already running or the feed is exhausted.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    pub page: u32,
    pub added: usize,
    pub duplicates: usize,
    pub has_more: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedStatus {
    pub current_page: u32,
    pub is_loading: bool,
    pub has_more: bool,
    pub len: usize,
}

pub struct FeedStore {
    ctx: FeedContext,
    service: Arc<dyn FeedService>,
    completions: Sender<Completion>,
}

impl FeedStore {
    pub(crate) fn new(
        ctx: FeedContext,
        service: Arc<dyn FeedService>,
        completions: Sender<Completion>,
    ) -> Self {
        Self {
            ctx,
            service,
            completions,
        }
    }

    pub fn context(&self) -> &FeedContext {
        &self.ctx
    }

    pub fn status(&self) -> FeedStatus {
        let state = self.ctx.read();
        FeedStatus {
            current_page: state.current_page,
            is_loading: state.is_loading,
            has_more: state.has_more,
            len: state.len(),
        }
    }

    pub fn posts(&self) -> Vec<Post> {
        self.ctx.read().posts().to_vec()
    }

    /// Starts fetching the page after the last appended one.
    ///
    /// Returns `Skipped` without doing anything while a fetch is running or
    /// once the server reported there is nothing more.
    pub fn load_next_page(&self) -> LoadRequest {
        self.ctx.assert_live("feed store");
        let request = {
            let mut state = self.ctx.write();
            if state.is_loading || !state.has_more {
                return LoadRequest::Skipped;
            }
            state.is_loading = true;
            PageRequest {
                page: state.current_page + 1,
                generation: self.ctx.generation(),
            }
        };

        debug!(page = request.page, "requesting feed page");
        self.ctx.request_started();
        let service = Arc::clone(&self.service);
        let tx = self.completions.clone();
        thread::spawn(move || {
            let result = service
                .fetch_feed_page(request.page)
                .map_err(FeedError::from);
            let _ = tx.send(Completion::Page { request, result });
        });
        LoadRequest::Requested(request.page)
    }

    /// Applies the answer to a fetch started by `load_next_page`.
    pub(crate) fn complete_page(
        &self,
        request: PageRequest,
        result: Result<FeedPage, FeedError>,
    ) -> Result<AppendOutcome, FeedError> {
        if !self.ctx.is_current(request.generation) {
            debug!(page = request.page, "discarding page from a previous feed");
            return Err(FeedError::StaleResponse(StaleReason::Superseded));
        }

        match result {
            Ok(page) => {
                let outcome = self.append_page(page);
                if outcome.is_err() {
                    self.ctx.write().is_loading = false;
                }
                outcome
            }
            Err(err) => {
                warn!(page = request.page, error = %err, "feed page failed");
                self.ctx.write().is_loading = false;
                Err(err)
            }
        }
    }

    /// Merges `page` into the feed when it directly follows the last one.
    ///
    /// Posts already present are skipped so that overlapping pages never
    /// duplicate or reorder what is on screen.
    pub fn append_page(&self, page: FeedPage) -> Result<AppendOutcome, FeedError> {
        self.ctx.assert_live("feed store");
        let mut state = self.ctx.write();
        let expected = state.current_page + 1;
        if page.page != expected {
            warn!(
                expected,
                received = page.page,
                "rejecting out-of-order feed page"
            );
            return Err(FeedError::StaleResponse(StaleReason::PageOutOfOrder {
                expected,
                received: page.page,
            }));
        }

        let mut added = 0;
        let mut duplicates = 0;
        for post in page.posts {
            if state.push(post) {
                added += 1;
            } else {
                duplicates += 1;
            }
        }
        state.current_page = page.page;
        state.has_more = page.has_more;
        state.is_loading = false;

        Ok(AppendOutcome {
            page: page.page,
            added,
            duplicates,
            has_more: page.has_more,
        })
    }

    /// Puts a post the viewer just created at the top of the feed.
    pub fn prepend(&self, post: Post) -> bool {
        self.ctx.assert_live("feed store");
        self.ctx.write().insert(0, post)
    }

    pub fn reset(&self) {
        self.ctx.assert_live("feed store");
        self.ctx.reset();
    }
}
