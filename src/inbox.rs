//! In-memory notification list behind the badge.
//!
//! Items arrive from two places: socket pushes (`NotificationCenter::on_violation`)
//! and fallback poll fetches (`NotificationCenter::merge_violations`). Both
//! paths dedupe by id, so an overlapping poll window never doubles an entry.
//! Nothing here is persisted.

use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::alert::AlertSink;
use crate::api::Violation;
use crate::notify::{ViolationEvent, ViolationHandler};
use crate::Severity;

pub const DEFAULT_CAPACITY: usize = 20;

#[derive(Clone, Debug, PartialEq)]
pub struct NotificationItem {
    pub id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub read: bool,
    pub violation: Option<Violation>,
}

impl NotificationItem {
    /// Unread item titled `"<violation type> at <camera>"`. Violations without
    /// a parseable timestamp are stamped with the current time.
    pub fn from_violation(violation: Violation) -> Self {
        Self {
            id: violation.id.clone(),
            message: format!("{} at {}", violation.type_label(), violation.camera_label()),
            timestamp: violation.occurred_at().unwrap_or_else(Utc::now),
            severity: violation.severity,
            read: false,
            violation: Some(violation),
        }
    }
}

/// Newest-first list capped at `capacity` items.
#[derive(Clone, Debug)]
pub struct NotificationInbox {
    items: VecDeque<NotificationItem>,
    capacity: usize,
}

impl Default for NotificationInbox {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl NotificationInbox {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.iter().any(|item| item.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&NotificationItem> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NotificationItem> {
        self.items.iter()
    }

    pub fn items(&self) -> Vec<NotificationItem> {
        self.items.iter().cloned().collect()
    }

    /// Insert at the head. Returns false when an item with the same id is
    /// already listed.
    pub fn push(&mut self, item: NotificationItem) -> bool {
        if self.contains(&item.id) {
            return false;
        }
        self.items.push_front(item);
        self.items.truncate(self.capacity);
        true
    }

    /// Add every item whose id is not yet listed, then reorder newest first
    /// and cap. Existing items keep their read state. Returns how many of the
    /// new items are still listed after the cap.
    pub fn merge<I>(&mut self, items: I) -> usize
    where
        I: IntoIterator<Item = NotificationItem>,
    {
        let mut seen: HashSet<String> = self.items.iter().map(|item| item.id.clone()).collect();
        let mut added = HashSet::new();
        for item in items {
            if seen.insert(item.id.clone()) {
                added.insert(item.id.clone());
                self.items.push_back(item);
            }
        }
        if added.is_empty() {
            return 0;
        }
        self.items
            .make_contiguous()
            .sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        self.items.truncate(self.capacity);
        self.items
            .iter()
            .filter(|item| added.contains(&item.id))
            .count()
    }

    /// Badge count.
    pub fn unread_count(&self) -> usize {
        self.items.iter().filter(|item| !item.read).count()
    }

    pub fn mark_read(&mut self, id: &str) -> bool {
        match self.items.iter_mut().find(|item| item.id == id) {
            Some(item) => {
                item.read = true;
                true
            }
            None => false,
        }
    }

    pub fn mark_all_read(&mut self) {
        for item in self.items.iter_mut() {
            item.read = true;
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// Shared inbox plus the alert hook, handed to both the socket handler and
/// the fallback poller.
#[derive(Clone)]
pub struct NotificationCenter {
    inbox: Arc<Mutex<NotificationInbox>>,
    alerts: Arc<dyn AlertSink>,
}

impl NotificationCenter {
    pub fn new(capacity: usize, alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            inbox: Arc::new(Mutex::new(NotificationInbox::new(capacity))),
            alerts,
        }
    }

    fn inbox(&self) -> MutexGuard<'_, NotificationInbox> {
        self.inbox.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.inbox().capacity()
    }

    /// Socket push. Urgent items that were not already listed raise an alert.
    pub fn on_violation(&self, event: ViolationEvent) -> bool {
        let item = NotificationItem::from_violation(event.violation);
        let added = self.inbox().push(item.clone());
        if !added {
            log::debug!("notification {} already listed", item.id);
            return false;
        }
        log::info!("notification {}: {} [{}]", item.id, item.message, item.severity);
        if item.severity.is_urgent() {
            self.alerts.alert(&item);
        }
        true
    }

    /// Poll fetch. Never alerts.
    pub fn merge_violations(&self, violations: Vec<Violation>) -> usize {
        self.inbox()
            .merge(violations.into_iter().map(NotificationItem::from_violation))
    }

    /// Handler for `NotificationChannel::spawn`.
    pub fn violation_handler(&self) -> ViolationHandler {
        let center = self.clone();
        Box::new(move |event| {
            center.on_violation(event);
        })
    }

    pub fn unread_count(&self) -> usize {
        self.inbox().unread_count()
    }

    pub fn items(&self) -> Vec<NotificationItem> {
        self.inbox().items()
    }

    pub fn mark_read(&self, id: &str) -> bool {
        self.inbox().mark_read(id)
    }

    pub fn mark_all_read(&self) {
        self.inbox().mark_all_read()
    }

    pub fn clear(&self) {
        self.inbox().clear()
    }
}
