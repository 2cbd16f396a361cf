//! Notification delivery: from a committed mutation to envelopes on the
//! realtime transport.

pub mod consumer;
pub mod events;
pub mod fanout;
pub mod online;
pub mod personalize;
pub mod presence;
pub mod publisher;
pub mod transport;
