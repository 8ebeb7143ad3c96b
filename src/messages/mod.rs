//! Append-only message log with read-state tracking, cursor pagination and
//! search. Appending also stamps the owning session's activity clock, which
//! is what keeps the timeout reaper away from live conversations.

use axum::{
    extract::{Path, Query, State},
    routing::{delete, get, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use diesel::dsl::sql;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Jsonb, Nullable, SmallInt};
use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::realtime::events::ServerEvent;
use crate::realtime::room;
use crate::sessions;
use crate::shared::enums::{MessageType, SenderType, SessionStatus};
use crate::shared::error::ChatError;
use crate::shared::models::{ChatMessage, NewChatMessage};
use crate::shared::schema::{chat_messages, chat_sessions};
use crate::shared::state::AppState;

pub const DELETED_PLACEHOLDER: &str = "[message deleted]";

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub sender_type: SenderType,
    pub sender_id: String,
    pub content: String,
    #[serde(default)]
    pub message_type: MessageType,
    pub attachments: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub limit: Option<i64>,
    pub before_message_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ReaderQuery {
    pub reader: SenderType,
}

#[derive(Debug, Deserialize)]
pub struct UnreadQuery {
    pub user_id: Option<Uuid>,
    pub agent_id: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub keyword: String,
    pub session_id: Option<i32>,
    pub sender_type: Option<SenderType>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    pub agent_id: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct MessagePage {
    pub messages: Vec<ChatMessage>,
    pub total: i64,
    pub has_more: bool,
}

#[derive(Debug, Serialize)]
pub struct UnreadResponse {
    pub unread: i64,
}

#[derive(Debug, Serialize)]
pub struct MarkedResponse {
    pub marked: usize,
}

#[derive(Debug, Serialize)]
pub struct SessionBoundary {
    pub first: Option<ChatMessage>,
    pub last: Option<ChatMessage>,
}

#[derive(Debug, Serialize, QueryableByName)]
pub struct QuickReplyUsage {
    #[diesel(sql_type = Nullable<BigInt>)]
    pub template_id: Option<i64>,
    #[diesel(sql_type = BigInt)]
    pub usage_count: i64,
}

/// Persist a message and touch the owning session's activity clock.
pub fn append_message(
    conn: &mut PgConnection,
    session_id: i32,
    req: SendMessageRequest,
) -> Result<ChatMessage, ChatError> {
    if req.content.trim().is_empty() {
        return Err(ChatError::Validation("message content is empty".to_string()));
    }
    sessions::session_by_id(conn, session_id)?;

    let message = NewChatMessage {
        session_id,
        sender_type: req.sender_type,
        sender_id: req.sender_id,
        content: req.content,
        message_type: req.message_type,
        attachments: req.attachments.unwrap_or_else(|| serde_json::json!([])),
        metadata: req.metadata.unwrap_or_else(|| serde_json::json!({})),
    };

    let message: ChatMessage = diesel::insert_into(chat_messages::table)
        .values(&message)
        .get_result(conn)?;

    sessions::touch_activity(conn, session_id)?;
    Ok(message)
}

pub fn message_by_id(conn: &mut PgConnection, message_id: i64) -> Result<ChatMessage, ChatError> {
    chat_messages::table
        .find(message_id)
        .first(conn)
        .optional()?
        .ok_or_else(|| ChatError::NotFound(format!("message {} does not exist", message_id)))
}

/// Backward page of a session's log, returned oldest-first.
///
/// Fetched newest-first below the cursor then reversed; new inserts land
/// above the cursor, so a window that was handed out never shifts.
pub fn page_messages(
    conn: &mut PgConnection,
    session_id: i32,
    limit: i64,
    before_message_id: Option<i64>,
) -> Result<MessagePage, ChatError> {
    let limit = limit.clamp(1, 200);

    let mut count_q = chat_messages::table
        .filter(chat_messages::session_id.eq(session_id))
        .into_boxed();
    let mut data_q = chat_messages::table
        .filter(chat_messages::session_id.eq(session_id))
        .into_boxed();

    if let Some(before) = before_message_id {
        count_q = count_q.filter(chat_messages::id.lt(before));
        data_q = data_q.filter(chat_messages::id.lt(before));
    }

    let total: i64 = count_q.count().get_result(conn)?;
    let mut messages: Vec<ChatMessage> = data_q
        .order(chat_messages::id.desc())
        .limit(limit)
        .load(conn)?;
    messages.reverse();

    Ok(MessagePage {
        messages,
        total,
        has_more: total > limit,
    })
}

/// Most recent messages in chronological order, for the initial view.
pub fn recent_messages(
    conn: &mut PgConnection,
    session_id: i32,
    limit: i64,
) -> Result<Vec<ChatMessage>, ChatError> {
    let mut messages: Vec<ChatMessage> = chat_messages::table
        .filter(chat_messages::session_id.eq(session_id))
        .order(chat_messages::id.desc())
        .limit(limit.clamp(1, 200))
        .load(conn)?;
    messages.reverse();
    Ok(messages)
}

/// Flip one message to read. Already-read messages are left untouched and
/// returned as-is.
pub fn mark_read(conn: &mut PgConnection, message_id: i64) -> Result<ChatMessage, ChatError> {
    let updated: Option<ChatMessage> = diesel::update(
        chat_messages::table
            .find(message_id)
            .filter(chat_messages::is_read.eq(false)),
    )
    .set((
        chat_messages::is_read.eq(true),
        chat_messages::read_at.eq(Utc::now()),
    ))
    .get_result(conn)
    .optional()?;

    match updated {
        Some(message) => Ok(message),
        None => message_by_id(conn, message_id),
    }
}

/// Senders whose messages the given reader can mark as read. System readers
/// have no counterpart and are rejected.
pub fn read_targets(reader: SenderType) -> Result<&'static [SenderType], ChatError> {
    let targets = reader.counterparties();
    if targets.is_empty() {
        return Err(ChatError::Validation(format!(
            "{} cannot mark messages as read",
            reader
        )));
    }
    Ok(targets)
}

/// Mark everything the other party wrote in this session as read. The
/// reader's own messages are never affected.
pub fn mark_session_read(
    conn: &mut PgConnection,
    session_id: i32,
    reader: SenderType,
) -> Result<usize, ChatError> {
    let targets = read_targets(reader)?;

    let marked = diesel::update(
        chat_messages::table
            .filter(chat_messages::session_id.eq(session_id))
            .filter(chat_messages::sender_type.eq_any(targets))
            .filter(chat_messages::is_read.eq(false)),
    )
    .set((
        chat_messages::is_read.eq(true),
        chat_messages::read_at.eq(Utc::now()),
    ))
    .execute(conn)?;

    Ok(marked)
}

pub fn unread_count(
    conn: &mut PgConnection,
    session_id: i32,
    reader: SenderType,
) -> Result<i64, ChatError> {
    let targets = read_targets(reader)?;

    let unread = chat_messages::table
        .filter(chat_messages::session_id.eq(session_id))
        .filter(chat_messages::sender_type.eq_any(targets))
        .filter(chat_messages::is_read.eq(false))
        .count()
        .get_result(conn)?;
    Ok(unread)
}

/// Unread user messages across all of an agent's active sessions, for the
/// badge count.
pub fn agent_unread_count(conn: &mut PgConnection, agent_id: i32) -> Result<i64, ChatError> {
    let unread = chat_messages::table
        .inner_join(chat_sessions::table)
        .filter(chat_sessions::agent_id.eq(agent_id))
        .filter(chat_sessions::status.eq(SessionStatus::Active))
        .filter(chat_messages::sender_type.eq(SenderType::User))
        .filter(chat_messages::is_read.eq(false))
        .count()
        .get_result(conn)?;
    Ok(unread)
}

/// Unread agent/system messages across all of a user's active sessions.
pub fn user_unread_count(conn: &mut PgConnection, user_id: Uuid) -> Result<i64, ChatError> {
    let unread = chat_messages::table
        .inner_join(chat_sessions::table)
        .filter(chat_sessions::user_id.eq(user_id))
        .filter(chat_sessions::status.eq(SessionStatus::Active))
        .filter(chat_messages::sender_type.eq_any([SenderType::Agent, SenderType::System]))
        .filter(chat_messages::is_read.eq(false))
        .count()
        .get_result(conn)?;
    Ok(unread)
}

/// Soft delete: the row stays for ordering and audit, the content is blanked
/// and a `deleted` marker lands in the metadata.
pub fn soft_delete(conn: &mut PgConnection, message_id: i64) -> Result<ChatMessage, ChatError> {
    diesel::update(chat_messages::table.find(message_id))
        .set((
            chat_messages::content.eq(DELETED_PLACEHOLDER),
            chat_messages::metadata.eq(sql::<Jsonb>(
                "jsonb_set(COALESCE(metadata, '{}'), '{deleted}', 'true')",
            )),
        ))
        .get_result(conn)
        .optional()?
        .ok_or_else(|| ChatError::NotFound(format!("message {} does not exist", message_id)))
}

/// Substring search over message content, newest first, bounded.
pub fn search_messages(
    conn: &mut PgConnection,
    query: &SearchQuery,
) -> Result<Vec<ChatMessage>, ChatError> {
    if query.keyword.trim().is_empty() {
        return Err(ChatError::Validation("search keyword is empty".to_string()));
    }

    let pattern = format!("%{}%", query.keyword);
    let mut q = chat_messages::table
        .filter(chat_messages::content.ilike(pattern))
        .into_boxed();

    if let Some(session_id) = query.session_id {
        q = q.filter(chat_messages::session_id.eq(session_id));
    }
    if let Some(sender) = query.sender_type {
        q = q.filter(chat_messages::sender_type.eq(sender));
    }
    if let Some(start) = query.start_date {
        q = q.filter(chat_messages::created_at.ge(start));
    }
    if let Some(end) = query.end_date {
        q = q.filter(chat_messages::created_at.le(end));
    }

    let messages = q
        .order(chat_messages::id.desc())
        .limit(query.limit.unwrap_or(100).clamp(1, 500))
        .load(conn)?;
    Ok(messages)
}

/// First and last message of a session.
pub fn session_boundary(
    conn: &mut PgConnection,
    session_id: i32,
) -> Result<SessionBoundary, ChatError> {
    let first = chat_messages::table
        .filter(chat_messages::session_id.eq(session_id))
        .order(chat_messages::id.asc())
        .first(conn)
        .optional()?;
    let last = chat_messages::table
        .filter(chat_messages::session_id.eq(session_id))
        .order(chat_messages::id.desc())
        .first(conn)
        .optional()?;
    Ok(SessionBoundary { first, last })
}

/// Quick-reply usage grouped by the template id carried in message metadata.
/// This is the read side of the downstream usage counters.
pub fn quick_reply_usage(
    conn: &mut PgConnection,
    agent_id: Option<i32>,
) -> Result<Vec<QuickReplyUsage>, ChatError> {
    let rows = if let Some(agent_id) = agent_id {
        diesel::sql_query(
            "SELECT (cm.metadata->>'template_id')::bigint AS template_id, \
                    COUNT(*) AS usage_count \
             FROM chat_messages cm \
             JOIN chat_sessions cs ON cm.session_id = cs.id \
             WHERE cm.message_type = $1 AND cs.agent_id = $2 \
             GROUP BY template_id \
             ORDER BY usage_count DESC",
        )
        .bind::<SmallInt, _>(MessageType::QuickReply as i16)
        .bind::<diesel::sql_types::Integer, _>(agent_id)
        .load(conn)?
    } else {
        diesel::sql_query(
            "SELECT (cm.metadata->>'template_id')::bigint AS template_id, \
                    COUNT(*) AS usage_count \
             FROM chat_messages cm \
             WHERE cm.message_type = $1 \
             GROUP BY template_id \
             ORDER BY usage_count DESC",
        )
        .bind::<SmallInt, _>(MessageType::QuickReply as i16)
        .load(conn)?
    };
    Ok(rows)
}

async fn send_message_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<i32>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<ChatMessage>, ChatError> {
    let message = {
        let mut conn = state.conn.get()?;
        append_message(&mut conn, session_id, req)?
    };

    if let Some(template_id) = message.quick_reply_template_id() {
        debug!(
            "quick reply template {} used in session {}",
            template_id, session_id
        );
    }

    state
        .router
        .broadcast(
            &room::session(session_id),
            ServerEvent::MessageNew {
                message: message.clone(),
            },
        )
        .await;

    Ok(Json(message))
}

async fn page_messages_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<i32>,
    Query(query): Query<PageQuery>,
) -> Result<Json<MessagePage>, ChatError> {
    let mut conn = state.conn.get()?;
    sessions::session_by_id(&mut conn, session_id)?;
    let page = page_messages(
        &mut conn,
        session_id,
        query.limit.unwrap_or(50),
        query.before_message_id,
    )?;
    Ok(Json(page))
}

async fn mark_read_handler(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<i64>,
) -> Result<Json<ChatMessage>, ChatError> {
    let message = {
        let mut conn = state.conn.get()?;
        mark_read(&mut conn, message_id)?
    };

    state
        .router
        .broadcast(
            &room::session(message.session_id),
            ServerEvent::MessageRead {
                session_id: message.session_id,
                message_id: message.id,
            },
        )
        .await;

    Ok(Json(message))
}

async fn mark_session_read_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<i32>,
    Json(req): Json<ReaderQuery>,
) -> Result<Json<MarkedResponse>, ChatError> {
    let mut conn = state.conn.get()?;
    sessions::session_by_id(&mut conn, session_id)?;
    let marked = mark_session_read(&mut conn, session_id, req.reader)?;
    Ok(Json(MarkedResponse { marked }))
}

async fn unread_count_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<i32>,
    Query(query): Query<ReaderQuery>,
) -> Result<Json<UnreadResponse>, ChatError> {
    let mut conn = state.conn.get()?;
    sessions::session_by_id(&mut conn, session_id)?;
    Ok(Json(UnreadResponse {
        unread: unread_count(&mut conn, session_id, query.reader)?,
    }))
}

async fn aggregate_unread_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UnreadQuery>,
) -> Result<Json<UnreadResponse>, ChatError> {
    let mut conn = state.conn.get()?;
    let unread = match (query.user_id, query.agent_id) {
        (Some(user_id), None) => user_unread_count(&mut conn, user_id)?,
        (None, Some(agent_id)) => agent_unread_count(&mut conn, agent_id)?,
        _ => {
            return Err(ChatError::Validation(
                "exactly one of user_id or agent_id is required".to_string(),
            ))
        }
    };
    Ok(Json(UnreadResponse { unread }))
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<ChatMessage>>, ChatError> {
    let mut conn = state.conn.get()?;
    Ok(Json(search_messages(&mut conn, &query)?))
}

async fn delete_message_handler(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<i64>,
) -> Result<Json<ChatMessage>, ChatError> {
    let mut conn = state.conn.get()?;
    Ok(Json(soft_delete(&mut conn, message_id)?))
}

async fn boundary_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<i32>,
) -> Result<Json<SessionBoundary>, ChatError> {
    let mut conn = state.conn.get()?;
    sessions::session_by_id(&mut conn, session_id)?;
    Ok(Json(session_boundary(&mut conn, session_id)?))
}

async fn quick_reply_usage_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UsageQuery>,
) -> Result<Json<Vec<QuickReplyUsage>>, ChatError> {
    let mut conn = state.conn.get()?;
    Ok(Json(quick_reply_usage(&mut conn, query.agent_id)?))
}

pub fn configure_message_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/api/chat/sessions/:id/messages",
            get(page_messages_handler).post(send_message_handler),
        )
        .route(
            "/api/chat/sessions/:id/read",
            put(mark_session_read_handler),
        )
        .route("/api/chat/sessions/:id/unread", get(unread_count_handler))
        .route("/api/chat/sessions/:id/boundary", get(boundary_handler))
        .route("/api/chat/messages/search", get(search_handler))
        .route(
            "/api/chat/messages/quick-reply-usage",
            get(quick_reply_usage_handler),
        )
        .route(
            "/api/chat/messages/:id/read",
            put(mark_read_handler),
        )
        .route("/api/chat/messages/:id", delete(delete_message_handler))
        .route("/api/chat/unread", get(aggregate_unread_handler))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_reader_is_rejected() {
        assert!(matches!(
            read_targets(SenderType::System),
            Err(ChatError::Validation(_))
        ));
    }

    #[test]
    fn read_targets_exclude_the_reader() {
        let targets = read_targets(SenderType::User).unwrap();
        assert!(!targets.contains(&SenderType::User));
        assert!(targets.contains(&SenderType::Agent));
        assert!(targets.contains(&SenderType::System));

        let targets = read_targets(SenderType::Agent).unwrap();
        assert_eq!(targets, &[SenderType::User]);
    }
}
