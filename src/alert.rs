//! Alerts for urgent notifications.

use std::io::Write;

use crate::inbox::NotificationItem;

/// Receives high and critical notifications as they arrive over the socket.
pub trait AlertSink: Send + Sync {
    fn alert(&self, item: &NotificationItem);
}

/// Logs each alert at `warn` and optionally rings the terminal bell.
#[derive(Clone, Debug, Default)]
pub struct LogAlertSink {
    bell: bool,
}

impl LogAlertSink {
    pub fn new(bell: bool) -> Self {
        Self { bell }
    }
}

impl AlertSink for LogAlertSink {
    fn alert(&self, item: &NotificationItem) {
        log::warn!("[{}] {} (id {})", item.severity, item.message, item.id);
        if self.bell {
            let mut stderr = std::io::stderr();
            let _ = stderr.write_all(b"\x07");
            let _ = stderr.flush();
        }
    }
}

/// Discards alerts.
#[derive(Clone, Copy, Debug, Default)]
pub struct SilentAlertSink;

impl AlertSink for SilentAlertSink {
    fn alert(&self, _item: &NotificationItem) {}
}
