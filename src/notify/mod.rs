//! Realtime notification channel.
//!
//! One WebSocket connection per consumer, scoped by an optional domain
//! filter. Closes with any code other than `INTENTIONAL_CLOSE_CODE` schedule
//! a reconnect after a fixed interval; `ChannelHandle::close()` disposes the
//! channel so nothing reconnects afterwards.

pub mod channel;
pub mod filter;
pub mod message;
pub mod socket;
pub mod state;

pub use channel::{endpoint_url, ChannelConfig, ChannelHandle, NotificationChannel, ViolationHandler};
pub use filter::DomainFilter;
pub use message::{ChannelMessage, ViolationEvent};
pub use socket::{Connector, SocketEvent, SocketStream, TungsteniteConnector};
pub use state::{
    ChannelState, ChannelStateMachine, ConnectionStatus, SharedStatus, ABNORMAL_CLOSE_CODE,
    INTENTIONAL_CLOSE_CODE,
};
