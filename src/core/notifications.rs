//! Desktop notification queue
//! Collects notifications announced on the desktop so the alert service can
//! relay them to connected devices.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::utils::truncate_utf8;

/// Field sizes including the terminator, so at most one byte less is kept
const APP_NAME_LENGTH: usize = 32;
const APP_ICON_LENGTH: usize = 32;
const SUMMARY_LENGTH: usize = 64;
const BODY_LENGTH: usize = 256;

/// A pending desktop notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    /// Id assigned by the notification server, -1 until it is known
    pub id: i64,
    pub app_name: String,
    pub app_icon: String,
    pub summary: String,
    pub body: String,
    pub actions: Vec<String>,
    pub hints: BTreeMap<String, String>,
    pub expiry_timeout: i32,
}

/// What the capture side observed on the desktop notification interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationEvent {
    /// A client asked for a notification to be shown
    Notify {
        app_name: String,
        app_icon: String,
        summary: String,
        body: String,
        actions: Vec<String>,
        hints: BTreeMap<String, String>,
        expiry_timeout: i32,
    },
    /// The server answered the latest Notify with its id
    NotifyReturn { id: u32 },
    /// The notification with this id was closed
    Closed { id: u32 },
}

#[derive(Default)]
struct Queue {
    /// Arrival number and notification, oldest first
    entries: Vec<(u64, Notification)>,
    next_seq: u64,
    /// Notifications numbered below this form the batch being relayed
    batch_end: Option<u64>,
}

/// Shared queue of pending notifications
#[derive(Clone, Default)]
pub struct NotificationSink {
    queue: Arc<Mutex<Queue>>,
}

impl NotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one observed event to the queue
    pub fn inspect(&self, event: NotificationEvent) {
        let mut queue = self.queue();
        match event {
            NotificationEvent::Notify {
                app_name,
                app_icon,
                summary,
                body,
                actions,
                hints,
                expiry_timeout,
            } => {
                let notification = Notification {
                    id: -1,
                    app_name: truncate_utf8(&app_name, APP_NAME_LENGTH - 1).to_string(),
                    app_icon: truncate_utf8(&app_icon, APP_ICON_LENGTH - 1).to_string(),
                    summary: truncate_utf8(&summary, SUMMARY_LENGTH - 1).to_string(),
                    body: truncate_utf8(&body, BODY_LENGTH - 1).to_string(),
                    actions,
                    hints,
                    expiry_timeout,
                };
                debug!("Got a notification from {}.", notification.app_name);
                let seq = queue.next_seq;
                queue.next_seq += 1;
                queue.entries.push((seq, notification));
            }
            NotificationEvent::NotifyReturn { id } => {
                if let Some((_, last)) = queue.entries.last_mut() {
                    last.id = i64::from(id);
                }
                debug!("Notification got id {}.", id);
            }
            NotificationEvent::Closed { id } => {
                let closed = i64::from(id);
                if let Some(index) = queue.entries.iter().position(|(_, n)| n.id == closed) {
                    queue.entries.remove(index);
                }
                debug!("Notification {} was closed.", id);
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.queue().entries.len()
    }

    pub fn pending_at(&self, index: usize) -> Option<Notification> {
        self.queue().entries.get(index).map(|(_, n)| n.clone())
    }

    /// Snapshot of the queue in arrival order
    pub fn pending(&self) -> Vec<Notification> {
        self.queue().entries.iter().map(|(_, n)| n.clone()).collect()
    }

    pub fn clear_queue(&self) {
        let mut queue = self.queue();
        queue.entries.clear();
        queue.batch_end = None;
    }

    /// Fixes the batch to relay as everything pending right now. Later
    /// arrivals wait for the next batch.
    pub fn begin_relay(&self) {
        let mut queue = self.queue();
        queue.batch_end = Some(queue.next_seq);
    }

    /// The notifications of the current batch, or the whole queue when no
    /// batch was started.
    pub fn relay_batch(&self) -> Vec<Notification> {
        let queue = self.queue();
        let end = queue.batch_end.unwrap_or(u64::MAX);
        queue
            .entries
            .iter()
            .filter(|(seq, _)| *seq < end)
            .map(|(_, n)| n.clone())
            .collect()
    }

    /// Closes the current batch. With `flush` its notifications are dropped
    /// from the queue, otherwise they stay for the next batch.
    pub fn end_relay(&self, flush: bool) {
        let mut queue = self.queue();
        if let Some(end) = queue.batch_end.take() {
            if flush {
                queue.entries.retain(|(seq, _)| *seq >= end);
            }
        }
    }

    /// Spawns a task applying every event sent on the returned channel.
    pub fn event_sender(&self) -> mpsc::UnboundedSender<NotificationEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(self.clone().run(rx));
        tx
    }

    /// Applies events until every sender is gone
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<NotificationEvent>) {
        info!("Listening for notification events...");
        while let Some(event) = events.recv().await {
            self.inspect(event);
        }
        info!("Notification event stream ended");
    }

    fn queue(&self) -> MutexGuard<'_, Queue> {
        // the queue stays consistent even if a holder panicked
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
