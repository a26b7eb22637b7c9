use std::sync::Arc;

use tracing::warn;

use crate::data::NotificationService;
use crate::error::FeedError;
use crate::models::Notification;

/// Notifications for the signed-in viewer with optimistic read/delete.
///
/// Calls block; the caller decides which thread that happens on.
pub struct Inbox {
    service: Arc<dyn NotificationService>,
    items: Vec<Notification>,
    unread_count: u64,
    loaded: bool,
}

impl Inbox {
    pub fn new(service: Arc<dyn NotificationService>) -> Self {
        Self {
            service,
            items: Vec::new(),
            unread_count: 0,
            loaded: false,
        }
    }

    pub fn items(&self) -> &[Notification] {
        &self.items
    }

    pub fn unread_count(&self) -> u64 {
        self.unread_count
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn load(&mut self) -> Result<(), FeedError> {
        let list = self.service.list()?;
        self.items = list.notifications;
        // Count what we hold so badge and list never disagree.
        self.unread_count = self.items.iter().filter(|n| !n.is_read).count() as u64;
        if self.unread_count != list.unread_count {
            warn!(
                reported = list.unread_count,
                counted = self.unread_count,
                "server unread count disagrees with loaded notifications"
            );
        }
        self.loaded = true;
        Ok(())
    }

    /// Marks one notification read. Already-read or unknown ids are a no-op.
    pub fn mark_read(&mut self, notification_id: &str) -> Result<(), FeedError> {
        let Some(item) = self
            .items
            .iter_mut()
            .find(|n| n.id == notification_id && !n.is_read)
        else {
            return Ok(());
        };
        item.is_read = true;
        self.unread_count = self.unread_count.saturating_sub(1);

        if let Err(err) = self.service.mark_read(notification_id) {
            if let Some(item) = self.items.iter_mut().find(|n| n.id == notification_id) {
                item.is_read = false;
                self.unread_count += 1;
            }
            return Err(err.into());
        }
        Ok(())
    }

    pub fn mark_all_read(&mut self) -> Result<(), FeedError> {
        let flipped: Vec<String> = self
            .items
            .iter_mut()
            .filter(|n| !n.is_read)
            .map(|n| {
                n.is_read = true;
                n.id.clone()
            })
            .collect();
        if flipped.is_empty() {
            return Ok(());
        }
        let previous = self.unread_count;
        self.unread_count = 0;

        if let Err(err) = self.service.mark_all_read() {
            for item in self.items.iter_mut().filter(|n| flipped.contains(&n.id)) {
                item.is_read = false;
            }
            self.unread_count = previous;
            return Err(err.into());
        }
        Ok(())
    }

    /// Deletes one notification. Unknown ids are a no-op.
    pub fn remove(&mut self, notification_id: &str) -> Result<(), FeedError> {
        let Some(index) = self.items.iter().position(|n| n.id == notification_id) else {
            return Ok(());
        };
        let removed = self.items.remove(index);
        if !removed.is_read {
            self.unread_count = self.unread_count.saturating_sub(1);
        }

        if let Err(err) = self.service.delete(notification_id) {
            if !removed.is_read {
                self.unread_count += 1;
            }
            let index = index.min(self.items.len());
            self.items.insert(index, removed);
            return Err(err.into());
        }
        Ok(())
    }
}
