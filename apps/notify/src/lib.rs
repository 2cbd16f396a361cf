pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod models;
pub mod worker;

pub use gateway::events::{Envelope, NotificationEvent};
pub use gateway::fanout::{DeliveryReport, FanoutDispatcher, Mutation, Outbox};
