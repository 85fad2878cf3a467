use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Close code for a deliberate client disconnect. A close with this code
/// never schedules a reconnect.
pub const INTENTIONAL_CLOSE_CODE: u16 = 1000;

/// Close code recorded when the connection dropped without a close frame or
/// could not be opened.
pub const ABNORMAL_CLOSE_CODE: u16 = 1006;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

/// Connection lifecycle with a fixed-interval reconnect policy.
///
/// `Disconnected -> Connecting -> Connected`, back to `Disconnected` on any
/// close or error. `on_close` decides whether another `Connecting` follows.
#[derive(Clone, Debug)]
pub struct ChannelStateMachine {
    state: ChannelState,
    auto_reconnect: bool,
    reconnect_interval: Duration,
    disposed: bool,
    attempts: u64,
}

impl ChannelStateMachine {
    pub fn new(auto_reconnect: bool, reconnect_interval: Duration) -> Self {
        Self {
            state: ChannelState::Disconnected,
            auto_reconnect,
            reconnect_interval,
            disposed: false,
            attempts: 0,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Connection attempts started so far.
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Returns false once disposed; no further attempts may start.
    pub fn begin_connect(&mut self) -> bool {
        if self.disposed {
            return false;
        }
        self.state = ChannelState::Connecting;
        self.attempts += 1;
        true
    }

    pub fn on_open(&mut self) {
        if !self.disposed {
            self.state = ChannelState::Connected;
        }
    }

    /// Record a close with `code`; returns the delay before the next attempt,
    /// or `None` when no reconnect should be scheduled.
    pub fn on_close(&mut self, code: u16) -> Option<Duration> {
        self.state = ChannelState::Disconnected;
        if self.disposed || !self.auto_reconnect || code == INTENTIONAL_CLOSE_CODE {
            return None;
        }
        Some(self.reconnect_interval)
    }

    /// Permanently stop; later closes never reconnect.
    pub fn dispose(&mut self) {
        self.disposed = true;
        self.state = ChannelState::Disconnected;
    }
}

/// `{ isConnected, connectionError }` as observed by consumers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub is_connected: bool,
    pub connection_error: Option<String>,
}

/// Shared, read-mostly view of the channel's connection status.
#[derive(Clone, Default)]
pub struct SharedStatus {
    inner: Arc<RwLock<ConnectionStatus>>,
}

impl SharedStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ConnectionStatus {
        self.inner
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn is_connected(&self) -> bool {
        self.snapshot().is_connected
    }

    pub fn set_connected(&self) {
        self.update(true, None);
    }

    pub fn set_disconnected(&self, error: Option<String>) {
        self.update(false, error);
    }

    fn update(&self, is_connected: bool, connection_error: Option<String>) {
        if let Ok(mut guard) = self.inner.write() {
            guard.is_connected = is_connected;
            guard.connection_error = connection_error;
        }
    }
}
