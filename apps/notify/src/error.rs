//! Error types for the notification pipeline.
//!
//! None of these ever reach the write path that triggered a notification:
//! callers log them and move on.

use thiserror::Error;

/// Failure talking to the realtime transport (publish or presence query).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("transport is reconnecting")]
    Reconnecting,
    #[error("transport call timed out")]
    Timeout,
}

impl From<redis::RedisError> for TransportError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error() {
            Self::Reconnecting
        } else {
            Self::Unavailable(err.to_string())
        }
    }
}

/// Failure publishing a single envelope. Fatal to that envelope only.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("transient transport error: {0}")]
    TransientTransport(#[from] TransportError),
    #[error("envelope serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure reading from Postgres or the shared counter store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] diesel_async::pooled_connection::deadpool::PoolError),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("{0}")]
    Unavailable(String),
}

/// Failure preparing a fan-out.
#[derive(Debug, Error)]
pub enum FanoutError {
    /// The batched context read failed. Aborts the whole fan-out.
    #[error("personalization context fetch failed for chat {chat_id}: {source}")]
    Context {
        chat_id: i64,
        #[source]
        source: StorageError,
    },
    /// A recipient has no entry in the fetched context. Skips that recipient.
    #[error("no personalization context for user {user_id} in chat {chat_id}")]
    MissingRecipientContext { user_id: i64, chat_id: i64 },
}

/// Failure talking to a work queue.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("malformed delivery on queue {queue}: {reason}")]
    Malformed { queue: String, reason: String },
}

impl From<redis::RedisError> for BrokerError {
    fn from(err: redis::RedisError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Failure handling one delivery pulled off a queue.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The delivery body could not be decoded. Never retried.
    #[error("undecodable delivery: {0}")]
    Decode(#[from] serde_json::Error),
    /// Worth another attempt (database hiccup, context read failure).
    #[error("retryable failure: {0}")]
    Retryable(String),
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

impl From<StorageError> for HandlerError {
    fn from(err: StorageError) -> Self {
        Self::Retryable(err.to_string())
    }
}

impl From<FanoutError> for HandlerError {
    fn from(err: FanoutError) -> Self {
        Self::Retryable(err.to_string())
    }
}

impl From<diesel::result::Error> for HandlerError {
    fn from(err: diesel::result::Error) -> Self {
        Self::Retryable(err.to_string())
    }
}
