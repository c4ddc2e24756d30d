//! Push notification collaborator.

use std::sync::Mutex;
use tracing::info;

use crate::session::UserId;

/// What a push notification says about a new message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushSummary {
    pub topic: String,
    pub seq: u64,
    pub from: Option<UserId>,
    pub timestamp: u64,
    pub size: usize,
}

/// Fire-and-forget push delivery to offline members.
pub trait PushNotifier: Send + Sync + 'static {
    fn notify(&self, user: &UserId, summary: &PushSummary);
}

/// Drops every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPush;

impl PushNotifier for NoopPush {
    fn notify(&self, _user: &UserId, _summary: &PushSummary) {}
}

/// Logs every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPush;

impl PushNotifier for TracingPush {
    fn notify(&self, user: &UserId, summary: &PushSummary) {
        info!(
            user = %user,
            topic = %summary.topic,
            seq = summary.seq,
            size = summary.size,
            "Push notification"
        );
    }
}

/// Keeps every notification in memory.
#[derive(Debug, Default)]
pub struct MemoryPush {
    sent: Mutex<Vec<(UserId, PushSummary)>>,
}

impl MemoryPush {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications sent so far.
    #[must_use]
    pub fn sent(&self) -> Vec<(UserId, PushSummary)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl PushNotifier for MemoryPush {
    fn notify(&self, user: &UserId, summary: &PushSummary) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((user.clone(), summary.clone()));
        }
    }
}
