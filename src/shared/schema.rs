diesel::table! {
    chat_agents (id) {
        id -> Int4,
        account_id -> Uuid,
        display_name -> Varchar,
        avatar_url -> Nullable<Text>,
        role -> SmallInt,
        status -> SmallInt,
        is_active -> Bool,
        max_concurrent_chats -> Int4,
        current_chat_count -> Int4,
        specialty_tags -> Array<Text>,
        manager_id -> Nullable<Int4>,
        last_online_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    chat_sessions (id) {
        id -> Int4,
        session_key -> Uuid,
        user_id -> Uuid,
        agent_id -> Nullable<Int4>,
        status -> SmallInt,
        channel -> SmallInt,
        priority -> Int4,
        metadata -> Jsonb,
        queued_at -> Timestamptz,
        assigned_at -> Nullable<Timestamptz>,
        started_at -> Nullable<Timestamptz>,
        closed_at -> Nullable<Timestamptz>,
        close_reason -> Nullable<SmallInt>,
        rating -> Nullable<Int4>,
        rating_comment -> Nullable<Text>,
        rating_tags -> Array<Text>,
        last_activity_at -> Timestamptz,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    chat_messages (id) {
        id -> Int8,
        session_id -> Int4,
        sender_type -> SmallInt,
        sender_id -> Varchar,
        content -> Text,
        message_type -> SmallInt,
        attachments -> Jsonb,
        metadata -> Jsonb,
        is_read -> Bool,
        read_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    chat_transfer_logs (id) {
        id -> Int4,
        session_id -> Int4,
        from_agent_id -> Int4,
        to_agent_id -> Int4,
        reason -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(chat_messages -> chat_sessions (session_id));
diesel::joinable!(chat_transfer_logs -> chat_sessions (session_id));

diesel::allow_tables_to_appear_in_same_query!(
    chat_agents,
    chat_sessions,
    chat_messages,
    chat_transfer_logs,
);
