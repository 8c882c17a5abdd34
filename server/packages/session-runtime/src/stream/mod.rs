//! Server-sent event fan-out to per-session subscribers.

mod event;
mod hub;

pub use event::SseEvent;
pub use hub::{
    CloseReason, ConnectHook, DisconnectHook, StreamHub, SubscriberHandle, SubscriberState,
    SubscriberStream,
};
