// The slice of the chat service schema the worker reads. Owned and migrated
// by the service that writes it.

diesel::table! {
    chat_participant (chat_id, user_id) {
        chat_id -> Int8,
        user_id -> Int8,
        admin -> Bool,
        pinned -> Bool,
        create_date_time -> Timestamptz,
    }
}

diesel::table! {
    message (id) {
        id -> Int8,
        chat_id -> Int8,
        owner_id -> Int8,
    }
}

diesel::table! {
    message_read (chat_id, user_id) {
        chat_id -> Int8,
        user_id -> Int8,
        last_message_id -> Int8,
    }
}

diesel::allow_tables_to_appear_in_same_query!(chat_participant, message, message_read,);
