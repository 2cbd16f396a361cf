mod common;

use std::collections::HashMap;

use diesel::prelude::*;
use diesel_async::pooled_connection::deadpool::Object;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use scoped_futures::ScopedFutureExt;

use parley_notify::db::context::{ChatContextStore, ParticipantPages, PgChatContext};
use parley_notify::db::pool::DbPool;
use parley_notify::db::schema::{chat_participant, message, message_read};
use parley_notify::worker::{prepare_record, MutationRecord};

use common::*;

// Session-local tables shadow any real ones, so tests neither need migrations
// nor leave rows behind.
const TABLES: [&str; 3] = [
    "CREATE TEMP TABLE chat_participant (
        chat_id BIGINT NOT NULL,
        user_id BIGINT NOT NULL,
        admin BOOLEAN NOT NULL DEFAULT FALSE,
        pinned BOOLEAN NOT NULL DEFAULT FALSE,
        create_date_time TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (chat_id, user_id)
    )",
    "CREATE TEMP TABLE message (
        id BIGINT PRIMARY KEY,
        chat_id BIGINT NOT NULL,
        owner_id BIGINT NOT NULL
    )",
    "CREATE TEMP TABLE message_read (
        chat_id BIGINT NOT NULL,
        user_id BIGINT NOT NULL,
        last_message_id BIGINT NOT NULL,
        PRIMARY KEY (chat_id, user_id)
    )",
];

const OTHER_CHAT: i64 = CHAT_ID + 1;

/// Chat `CHAT_ID` with participants 1 (admin, pinned), 2 and 3.
///
/// Messages 10 and 12 by user 1, 11 by user 2, 13 by user 3; user 2 has read
/// up to 11. A message in another chat must never count.
async fn seeded(pool: &DbPool) -> Object<AsyncPgConnection> {
    let mut conn = pool.get().await.expect("pool");
    for ddl in TABLES {
        diesel::sql_query(ddl)
            .execute(&mut conn)
            .await
            .expect("create temp table");
    }

    diesel::insert_into(chat_participant::table)
        .values(vec![
            (
                chat_participant::chat_id.eq(CHAT_ID),
                chat_participant::user_id.eq(1),
                chat_participant::admin.eq(true),
                chat_participant::pinned.eq(true),
            ),
            (
                chat_participant::chat_id.eq(CHAT_ID),
                chat_participant::user_id.eq(2),
                chat_participant::admin.eq(false),
                chat_participant::pinned.eq(false),
            ),
            (
                chat_participant::chat_id.eq(CHAT_ID),
                chat_participant::user_id.eq(3),
                chat_participant::admin.eq(false),
                chat_participant::pinned.eq(false),
            ),
            (
                chat_participant::chat_id.eq(OTHER_CHAT),
                chat_participant::user_id.eq(4),
                chat_participant::admin.eq(true),
                chat_participant::pinned.eq(true),
            ),
        ])
        .execute(&mut conn)
        .await
        .expect("insert participants");

    diesel::insert_into(message::table)
        .values(vec![
            (message::id.eq(10), message::chat_id.eq(CHAT_ID), message::owner_id.eq(1)),
            (message::id.eq(11), message::chat_id.eq(CHAT_ID), message::owner_id.eq(2)),
            (message::id.eq(12), message::chat_id.eq(CHAT_ID), message::owner_id.eq(1)),
            (message::id.eq(13), message::chat_id.eq(CHAT_ID), message::owner_id.eq(3)),
            (message::id.eq(20), message::chat_id.eq(OTHER_CHAT), message::owner_id.eq(4)),
        ])
        .execute(&mut conn)
        .await
        .expect("insert messages");

    diesel::insert_into(message_read::table)
        .values((
            message_read::chat_id.eq(CHAT_ID),
            message_read::user_id.eq(2),
            message_read::last_message_id.eq(11),
        ))
        .execute(&mut conn)
        .await
        .expect("insert read marker");

    conn
}

#[tokio::test]
async fn unread_counts_skip_own_and_read_messages() {
    let Some(pool) = live_pg().await else {
        return;
    };
    let mut conn = seeded(&pool).await;
    let mut store = PgChatContext::new(&mut conn);

    let unread = store.unread_counts(&[1, 2, 3, 4, 99], CHAT_ID).await.unwrap();
    assert_eq!(
        unread,
        HashMap::from([
            // 11 and 13; 10 and 12 are their own
            (1, 2),
            // 12 and 13; read up to 11
            (2, 2),
            // 10, 11, 12
            (3, 3),
            // member of another chat only
            (4, 0),
            (99, 0),
        ])
    );
}

#[tokio::test]
async fn flag_batches_are_zero_filled() {
    let Some(pool) = live_pg().await else {
        return;
    };
    let mut conn = seeded(&pool).await;
    let mut store = PgChatContext::new(&mut conn);

    let admin = store.admin_flags(&[1, 2, 4, 99], CHAT_ID).await.unwrap();
    assert_eq!(
        admin,
        HashMap::from([(1, true), (2, false), (4, false), (99, false)])
    );

    let pinned = store.pinned_flags(&[1, 3, 99], CHAT_ID).await.unwrap();
    assert_eq!(pinned, HashMap::from([(1, true), (3, false), (99, false)]));

    assert!(store.admin_flags(&[], CHAT_ID).await.unwrap().is_empty());
    assert!(store.unread_counts(&[], CHAT_ID).await.unwrap().is_empty());
}

#[tokio::test]
async fn participants_page_by_keyset() {
    let Some(pool) = live_pg().await else {
        return;
    };
    let mut conn = seeded(&pool).await;
    let mut store = PgChatContext::new(&mut conn);

    assert_eq!(store.participant_ids(CHAT_ID).await.unwrap(), vec![1, 2, 3]);
    assert_eq!(
        store.participant_ids_page(CHAT_ID, 2, Some(1)).await.unwrap(),
        vec![2, 3]
    );

    let mut pages = ParticipantPages::new(CHAT_ID, 2);
    let mut seen = Vec::new();
    while let Some(page) = pages.next_page(&mut store).await.unwrap() {
        seen.push(page);
    }
    assert_eq!(seen, vec![vec![1, 2], vec![3]]);
}

#[tokio::test]
async fn whole_chat_record_fans_out_from_one_snapshot() {
    let Some(pool) = live_pg().await else {
        return;
    };
    let mut conn = seeded(&pool).await;
    let mut h = Harness::new(2).viewing(&[2]);

    let record = MutationRecord {
        mutation: message_created(14, 1, "fresh"),
        recipients: None,
    };
    let dispatcher = &h.dispatcher;
    let record_ref = &record;
    let outbox = conn
        .build_transaction()
        .read_only()
        .repeatable_read()
        .run::<_, diesel::result::Error, _>(|conn| {
            async move {
                let mut store = PgChatContext::new(conn);
                Ok(prepare_record(dispatcher, &mut store, record_ref).await)
            }
            .scope_boxed()
        })
        .await
        .unwrap()
        .unwrap();

    let report = outbox.flush(h.dispatcher.publisher()).await;
    assert_eq!(report.published, 2);

    let published = h.drain();
    assert!(on_channel(&published, "personal:1").is_empty());

    let viewer = on_channel(&published, "personal:2");
    assert_eq!(viewer.len(), 1);
    assert_eq!(viewer[0]["eventType"], "message_created");
    assert_eq!(viewer[0]["payload"]["text"], "fresh");

    let absent = on_channel(&published, "personal:3");
    assert_eq!(absent.len(), 1);
    assert_eq!(absent[0]["eventType"], "unread_messages_changed");
    assert_eq!(absent[0]["payload"]["unreadMessages"], 3);
}
