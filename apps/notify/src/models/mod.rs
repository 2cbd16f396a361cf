//! Chat-service entities as the notification core sees them.
//!
//! These are read-only snapshots handed over by the storage layer. They own
//! all of their nested data, and copies are made through [`DeepClone`] so a
//! personalized view can never share a nested list with another recipient's.

pub mod chat;
pub mod message;
pub mod participant;

pub use chat::{Chat, ChatRules};
pub use message::{Embed, EmbedKind, Message};
pub use participant::Participant;

/// Explicit, recursive copy of an entity and everything nested in it.
///
/// Implemented field by field rather than derived so that adding a shared
/// handle (an `Arc`, a `Cow`) to a model forces a decision here.
pub trait DeepClone {
    fn deep_clone(&self) -> Self;
}

impl<T: DeepClone> DeepClone for Option<T> {
    fn deep_clone(&self) -> Self {
        self.as_ref().map(DeepClone::deep_clone)
    }
}

impl<T: DeepClone> DeepClone for Vec<T> {
    fn deep_clone(&self) -> Self {
        self.iter().map(DeepClone::deep_clone).collect()
    }
}
