#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentinelState {
    Idle,
    Armed,
    Triggered,
}

/// Decides when scrolling near the end of the feed should fetch more.
///
/// Fires on the rising edge of the anchor's visibility only, so an anchor
/// that stays on screen during a slow fetch does not request again.
#[derive(Debug, Clone)]
pub struct ScrollSentinel {
    state: SentinelState,
    anchor: Option<String>,
    was_visible: bool,
}

impl Default for ScrollSentinel {
    fn default() -> Self {
        Self::new()
    }
}

impl ScrollSentinel {
    pub fn new() -> Self {
        Self {
            state: SentinelState::Idle,
            anchor: None,
            was_visible: false,
        }
    }

    pub fn state(&self) -> SentinelState {
        self.state
    }

    pub fn anchor(&self) -> Option<&str> {
        self.anchor.as_deref()
    }

    /// Follows the last rendered item. While a fetch is in flight the anchor
    /// is left alone; `fetch_completed` moves it.
    pub fn sync_anchor(&mut self, last_item: Option<&str>) {
        match (self.state, last_item) {
            (SentinelState::Triggered, _) => {}
            (_, None) => self.detach(),
            (SentinelState::Idle, Some(id)) => self.attach(id),
            (SentinelState::Armed, Some(id)) => {
                if self.anchor.as_deref() != Some(id) {
                    self.attach(id);
                }
            }
        }
    }

    /// Feeds one visibility observation of the anchor. Returns true when the
    /// caller should load the next page.
    pub fn observe(&mut self, visible: bool, has_more: bool, is_loading: bool) -> bool {
        let rising = visible && !self.was_visible;
        self.was_visible = visible;
        if self.state != SentinelState::Armed || !rising {
            return false;
        }
        if !has_more || is_loading {
            return false;
        }
        self.state = SentinelState::Triggered;
        true
    }

    /// The fetch started by the last trigger finished, whatever its outcome.
    pub fn fetch_completed(&mut self, last_item: Option<&str>) {
        match last_item {
            Some(id) => self.attach(id),
            None => self.detach(),
        }
    }

    pub fn detach(&mut self) {
        self.state = SentinelState::Idle;
        self.anchor = None;
        self.was_visible = false;
    }

    fn attach(&mut self, id: &str) {
        self.state = SentinelState::Armed;
        self.anchor = Some(id.to_string());
        self.was_visible = false;
    }
}
