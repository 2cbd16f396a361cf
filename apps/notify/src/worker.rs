//! Mutation queue handler: one committed mutation in, notifications out.

use async_trait::async_trait;
use scoped_futures::ScopedFutureExt;
use serde::Deserialize;

use crate::db::context::{ChatContextStore, PgChatContext};
use crate::db::pool::DbPool;
use crate::error::{FanoutError, HandlerError, StorageError};
use crate::gateway::consumer::{Delivery, DeliveryHandler};
use crate::gateway::fanout::{FanoutDispatcher, Mutation, Outbox};

/// What producers put on the mutation queue.
#[derive(Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRecord {
    pub mutation: Mutation,
    /// Explicit recipients. Absent means every participant of the chat.
    #[serde(default)]
    pub recipients: Option<Vec<i64>>,
}

/// Build the outbox for `record`, paging through the chat when it names no
/// recipients.
pub async fn prepare_record<S>(
    dispatcher: &FanoutDispatcher,
    store: &mut S,
    record: &MutationRecord,
) -> Result<Outbox, FanoutError>
where
    S: ChatContextStore + ?Sized,
{
    match &record.recipients {
        Some(recipients) => dispatcher.prepare(store, &record.mutation, recipients).await,
        None => dispatcher.prepare_chat(store, &record.mutation).await,
    }
}

pub struct MutationHandler {
    pool: DbPool,
    dispatcher: FanoutDispatcher,
}

impl MutationHandler {
    pub fn new(pool: DbPool, dispatcher: FanoutDispatcher) -> Self {
        Self { pool, dispatcher }
    }
}

#[async_trait]
impl DeliveryHandler for MutationHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let record: MutationRecord = serde_json::from_str(&delivery.body)?;
        let mut conn = self.pool.get().await.map_err(StorageError::from)?;

        let dispatcher = &self.dispatcher;
        let record_ref = &record;
        // All context reads share one snapshot.
        let outbox = conn
            .build_transaction()
            .read_only()
            .repeatable_read()
            .run::<_, HandlerError, _>(|conn| {
                async move {
                    let mut store = PgChatContext::new(conn);
                    Ok(prepare_record(dispatcher, &mut store, record_ref).await?)
                }
                .scope_boxed()
            })
            .await?;
        drop(conn);

        let envelopes = outbox.len();
        let report = outbox.flush(self.dispatcher.publisher()).await;
        tracing::info!(
            delivery_id = %delivery.id,
            kind = record.mutation.kind(),
            chat_id = ?record.mutation.chat_id(),
            envelopes,
            published = report.published,
            failed = report.failed,
            skipped = report.skipped,
            "mutation fanned out"
        );
        Ok(())
    }
}
