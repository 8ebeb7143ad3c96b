//! Session store: lifecycle, assignment, transfer, close, rating and the
//! projections over `chat_sessions`.
//!
//! Every transition runs through exactly one guarded function whose WHERE
//! clause re-checks the expected state. Zero affected rows means another task
//! got there first; the caller backs off without leaving capacity charged.

use axum::{
    extract::{Path, Query, State},
    routing::{get, put},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use diesel::dsl::sql;
use diesel::prelude::*;
use diesel::sql_types::{Double, Nullable};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::agents;
use crate::realtime::events::ServerEvent;
use crate::realtime::room;
use crate::shared::enums::{Channel, CloseReason, SessionStatus};
use crate::shared::error::ChatError;
use crate::shared::models::{ChatSession, NewChatSession, NewTransferLog, TransferLog};
use crate::shared::schema::{chat_sessions, chat_transfer_logs};
use crate::shared::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub user_id: Uuid,
    #[serde(default)]
    pub channel: Channel,
    pub priority: Option<i32>,
    pub metadata: Option<serde_json::Value>,
    pub specialty_tag: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub agent_id: i32,
}

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub from_agent_id: i32,
    pub to_agent_id: i32,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CloseRequest {
    pub reason: CloseReason,
}

#[derive(Debug, Deserialize)]
pub struct RateRequest {
    pub rating: i32,
    pub comment: Option<String>,
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct SessionListQuery {
    pub user_id: Option<Uuid>,
    pub agent_id: Option<i32>,
    pub status: Option<SessionStatus>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StatsQuery {
    pub agent_id: Option<i32>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<ChatSession>,
    pub total: i64,
}

#[derive(Debug, Serialize)]
pub struct QueueResponse {
    pub queued: i64,
}

#[derive(Debug, Serialize)]
pub struct SessionStatistics {
    pub total: i64,
    pub queued: i64,
    pub active: i64,
    pub closed: i64,
    pub avg_duration_secs: f64,
    pub avg_satisfaction: f64,
}

/// New sessions always start queued; an agent is attached later through the
/// guarded assignment path.
pub fn create_session(
    conn: &mut PgConnection,
    user_id: Uuid,
    channel: Channel,
    priority: i32,
    metadata: serde_json::Value,
) -> Result<ChatSession, ChatError> {
    let now = Utc::now();
    let session = NewChatSession {
        session_key: Uuid::new_v4(),
        user_id,
        status: SessionStatus::Queued,
        channel,
        priority,
        metadata,
        queued_at: now,
        last_activity_at: now,
    };

    let session = diesel::insert_into(chat_sessions::table)
        .values(&session)
        .get_result(conn)?;
    Ok(session)
}

pub fn session_by_id(conn: &mut PgConnection, session_id: i32) -> Result<ChatSession, ChatError> {
    chat_sessions::table
        .find(session_id)
        .first(conn)
        .optional()?
        .ok_or_else(|| ChatError::NotFound(format!("session {} does not exist", session_id)))
}

pub fn session_by_key(conn: &mut PgConnection, key: Uuid) -> Result<ChatSession, ChatError> {
    chat_sessions::table
        .filter(chat_sessions::session_key.eq(key))
        .first(conn)
        .optional()?
        .ok_or_else(|| ChatError::NotFound(format!("no session with key {}", key)))
}

pub fn list_sessions(
    conn: &mut PgConnection,
    query: &SessionListQuery,
) -> Result<(Vec<ChatSession>, i64), ChatError> {
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(20).clamp(1, 100);

    let mut count_q = chat_sessions::table.into_boxed();
    let mut data_q = chat_sessions::table.into_boxed();

    if let Some(user_id) = query.user_id {
        count_q = count_q.filter(chat_sessions::user_id.eq(user_id));
        data_q = data_q.filter(chat_sessions::user_id.eq(user_id));
    }
    if let Some(agent_id) = query.agent_id {
        count_q = count_q.filter(chat_sessions::agent_id.eq(agent_id));
        data_q = data_q.filter(chat_sessions::agent_id.eq(agent_id));
    }
    if let Some(status) = query.status {
        count_q = count_q.filter(chat_sessions::status.eq(status));
        data_q = data_q.filter(chat_sessions::status.eq(status));
    }

    let total: i64 = count_q.count().get_result(conn)?;
    let sessions = data_q
        .order(chat_sessions::created_at.desc())
        .limit(limit)
        .offset((page - 1) * limit)
        .load(conn)?;

    Ok((sessions, total))
}

/// The single choke point for `queued -> active`. The status filter makes the
/// transition conditional; `None` means the session was not queued anymore.
fn guarded_activate(
    conn: &mut PgConnection,
    session_id: i32,
    agent: i32,
) -> Result<Option<ChatSession>, ChatError> {
    let now = Utc::now();
    let updated = diesel::update(
        chat_sessions::table
            .find(session_id)
            .filter(chat_sessions::status.eq(SessionStatus::Queued)),
    )
    .set((
        chat_sessions::agent_id.eq(agent),
        chat_sessions::status.eq(SessionStatus::Active),
        chat_sessions::assigned_at.eq(now),
        chat_sessions::started_at.eq(now),
        chat_sessions::last_activity_at.eq(now),
        chat_sessions::updated_at.eq(now),
    ))
    .get_result(conn)
    .optional()?;
    Ok(updated)
}

/// Assign a specific agent to a queued session.
///
/// Capacity is reserved before the session flips; if the session guard then
/// fails the reservation is handed back, so a failed assignment never leaves
/// the agent charged.
pub fn assign_agent(
    conn: &mut PgConnection,
    session_id: i32,
    agent_id: i32,
) -> Result<ChatSession, ChatError> {
    let session = session_by_id(conn, session_id)?;
    if session.status != SessionStatus::Queued {
        return Err(ChatError::CannotProceed(format!(
            "session {} is {}, not queued",
            session_id, session.status
        )));
    }

    if !agents::try_reserve_slot(conn, agent_id)? {
        agents::agent_by_id(conn, agent_id)?;
        return Err(ChatError::CannotProceed(format!(
            "agent {} cannot accept a new chat",
            agent_id
        )));
    }

    match guarded_activate(conn, session_id, agent_id)? {
        Some(session) => Ok(session),
        None => {
            agents::release_slot(conn, agent_id)?;
            Err(ChatError::CannotProceed(format!(
                "session {} is no longer queued",
                session_id
            )))
        }
    }
}

/// Pick the least-loaded eligible agent and assign. No eligible agent is not
/// an error: the session simply stays queued and is reported back as such.
pub fn auto_assign(
    conn: &mut PgConnection,
    session_id: i32,
    specialty: Option<&str>,
) -> Result<ChatSession, ChatError> {
    let session = session_by_id(conn, session_id)?;
    if session.status != SessionStatus::Queued {
        return Err(ChatError::CannotProceed(format!(
            "session {} is {}, not queued",
            session_id, session.status
        )));
    }

    for candidate in agents::available_agents(conn, specialty)? {
        // A candidate can fill up between the listing and the reservation;
        // losing that race just moves us to the next one.
        if !agents::try_reserve_slot(conn, candidate.id)? {
            continue;
        }
        return match guarded_activate(conn, session_id, candidate.id)? {
            Some(session) => Ok(session),
            None => {
                agents::release_slot(conn, candidate.id)?;
                Err(ChatError::CannotProceed(format!(
                    "session {} is no longer queued",
                    session_id
                )))
            }
        };
    }

    Ok(session)
}

/// Move an active session from one agent to another, keeping it active.
///
/// Reserve on the target, flip the session, log the transfer, release the
/// source — one transaction, so a failure anywhere leaves both load counters
/// untouched and the total charged capacity conserved.
pub fn transfer_session(
    conn: &mut PgConnection,
    session_id: i32,
    from_agent: i32,
    to_agent: i32,
    reason: Option<String>,
) -> Result<ChatSession, ChatError> {
    let session = session_by_id(conn, session_id)?;
    if session.status != SessionStatus::Active || session.agent_id != Some(from_agent) {
        return Err(ChatError::CannotProceed(format!(
            "session {} is not active with agent {}",
            session_id, from_agent
        )));
    }

    conn.transaction::<ChatSession, ChatError, _>(|conn| {
        if !agents::try_reserve_slot(conn, to_agent)? {
            agents::agent_by_id(conn, to_agent)?;
            return Err(ChatError::CannotProceed(format!(
                "agent {} cannot accept a new chat",
                to_agent
            )));
        }

        let now = Utc::now();
        let updated: Option<ChatSession> = diesel::update(
            chat_sessions::table
                .find(session_id)
                .filter(chat_sessions::status.eq(SessionStatus::Active))
                .filter(chat_sessions::agent_id.eq(from_agent)),
        )
        .set((
            chat_sessions::agent_id.eq(to_agent),
            chat_sessions::last_activity_at.eq(now),
            chat_sessions::updated_at.eq(now),
        ))
        .get_result(conn)
        .optional()?;

        let Some(session) = updated else {
            return Err(ChatError::CannotProceed(format!(
                "session {} is no longer active with agent {}",
                session_id, from_agent
            )));
        };

        diesel::insert_into(chat_transfer_logs::table)
            .values(&NewTransferLog {
                session_id,
                from_agent_id: from_agent,
                to_agent_id: to_agent,
                reason,
            })
            .execute(conn)?;

        agents::release_slot(conn, from_agent)?;
        Ok(session)
    })
}

/// Close a session from any non-terminal state.
///
/// Idempotent: closing an already-closed session returns the existing record
/// and does not touch agent load again.
pub fn close_session(
    conn: &mut PgConnection,
    session_id: i32,
    reason: CloseReason,
) -> Result<ChatSession, ChatError> {
    let session = session_by_id(conn, session_id)?;
    if session.status.is_terminal() {
        return Ok(session);
    }

    let now = Utc::now();
    let updated: Option<ChatSession> = diesel::update(
        chat_sessions::table
            .find(session_id)
            .filter(chat_sessions::status.ne(SessionStatus::Closed)),
    )
    .set((
        chat_sessions::status.eq(SessionStatus::Closed),
        chat_sessions::closed_at.eq(now),
        chat_sessions::close_reason.eq(reason),
        chat_sessions::updated_at.eq(now),
    ))
    .get_result(conn)
    .optional()?;

    match updated {
        Some(closed) => {
            if let Some(agent_id) = closed.agent_id {
                agents::release_slot(conn, agent_id)?;
            }
            Ok(closed)
        }
        // Lost a close race; whoever won already released the slot.
        None => session_by_id(conn, session_id),
    }
}

pub fn validate_rating(rating: i32) -> Result<(), ChatError> {
    if !(1..=5).contains(&rating) {
        return Err(ChatError::Validation(format!(
            "rating must be between 1 and 5, got {}",
            rating
        )));
    }
    Ok(())
}

/// Record post-chat feedback. Usually arrives after close but a user rating a
/// still-open session is accepted too.
pub fn rate_session(
    conn: &mut PgConnection,
    session_id: i32,
    rating: i32,
    comment: Option<String>,
    tags: Vec<String>,
) -> Result<ChatSession, ChatError> {
    validate_rating(rating)?;

    diesel::update(chat_sessions::table.find(session_id))
        .set((
            chat_sessions::rating.eq(rating),
            chat_sessions::rating_comment.eq(comment),
            chat_sessions::rating_tags.eq(tags),
            chat_sessions::updated_at.eq(Utc::now()),
        ))
        .get_result(conn)
        .optional()?
        .ok_or_else(|| ChatError::NotFound(format!("session {} does not exist", session_id)))
}

pub fn queue_length(conn: &mut PgConnection) -> Result<i64, ChatError> {
    let queued = chat_sessions::table
        .filter(chat_sessions::status.eq(SessionStatus::Queued))
        .count()
        .get_result(conn)?;
    Ok(queued)
}

pub fn active_by_agent(
    conn: &mut PgConnection,
    agent_id: i32,
) -> Result<Vec<ChatSession>, ChatError> {
    let sessions = chat_sessions::table
        .filter(chat_sessions::agent_id.eq(agent_id))
        .filter(chat_sessions::status.eq(SessionStatus::Active))
        .order(chat_sessions::started_at.desc())
        .load(conn)?;
    Ok(sessions)
}

pub fn user_sessions(
    conn: &mut PgConnection,
    user_id: Uuid,
    limit: i64,
) -> Result<Vec<ChatSession>, ChatError> {
    let sessions = chat_sessions::table
        .filter(chat_sessions::user_id.eq(user_id))
        .order(chat_sessions::created_at.desc())
        .limit(limit)
        .load(conn)?;
    Ok(sessions)
}

/// Sessions active for the given user right now; the router fans "user left"
/// notices out to these.
pub fn active_by_user(
    conn: &mut PgConnection,
    user_id: Uuid,
) -> Result<Vec<ChatSession>, ChatError> {
    let sessions = chat_sessions::table
        .filter(chat_sessions::user_id.eq(user_id))
        .filter(chat_sessions::status.eq(SessionStatus::Active))
        .load(conn)?;
    Ok(sessions)
}

fn filtered_stats(query: &StatsQuery) -> chat_sessions::BoxedQuery<'static, diesel::pg::Pg> {
    let mut q = chat_sessions::table.into_boxed();
    if let Some(agent_id) = query.agent_id {
        q = q.filter(chat_sessions::agent_id.eq(agent_id));
    }
    if let Some(start) = query.start_date {
        q = q.filter(chat_sessions::created_at.ge(start));
    }
    if let Some(end) = query.end_date {
        q = q.filter(chat_sessions::created_at.le(end));
    }
    q
}

pub fn statistics(
    conn: &mut PgConnection,
    query: &StatsQuery,
) -> Result<SessionStatistics, ChatError> {
    let total: i64 = filtered_stats(query).count().get_result(conn)?;
    let queued: i64 = filtered_stats(query)
        .filter(chat_sessions::status.eq(SessionStatus::Queued))
        .count()
        .get_result(conn)?;
    let active: i64 = filtered_stats(query)
        .filter(chat_sessions::status.eq(SessionStatus::Active))
        .count()
        .get_result(conn)?;
    let closed: i64 = filtered_stats(query)
        .filter(chat_sessions::status.eq(SessionStatus::Closed))
        .count()
        .get_result(conn)?;

    let avg_duration: Option<f64> = filtered_stats(query)
        .filter(chat_sessions::closed_at.is_not_null())
        .filter(chat_sessions::started_at.is_not_null())
        .select(sql::<Nullable<Double>>(
            "AVG(EXTRACT(EPOCH FROM (closed_at - started_at)))::float8",
        ))
        .get_result(conn)?;

    let avg_satisfaction: Option<f64> = filtered_stats(query)
        .filter(chat_sessions::rating.is_not_null())
        .select(sql::<Nullable<Double>>("AVG(rating)::float8"))
        .get_result(conn)?;

    Ok(SessionStatistics {
        total,
        queued,
        active,
        closed,
        avg_duration_secs: avg_duration.unwrap_or(0.0),
        avg_satisfaction: avg_satisfaction.unwrap_or(0.0),
    })
}

/// Queued or active sessions whose last activity is older than the idle
/// threshold. Input for the timeout reaper.
pub fn stale_sessions(
    conn: &mut PgConnection,
    idle_threshold: Duration,
) -> Result<Vec<i32>, ChatError> {
    let cutoff = Utc::now() - idle_threshold;
    let ids = chat_sessions::table
        .filter(chat_sessions::status.eq_any([SessionStatus::Queued, SessionStatus::Active]))
        .filter(chat_sessions::last_activity_at.lt(cutoff))
        .select(chat_sessions::id)
        .load(conn)?;
    Ok(ids)
}

/// Stamp a session as recently active. Called on every message append.
pub fn touch_activity(conn: &mut PgConnection, session_id: i32) -> Result<(), ChatError> {
    let now = Utc::now();
    diesel::update(chat_sessions::table.find(session_id))
        .set((
            chat_sessions::last_activity_at.eq(now),
            chat_sessions::updated_at.eq(now),
        ))
        .execute(conn)?;
    Ok(())
}

pub fn transfer_history(
    conn: &mut PgConnection,
    session_id: i32,
) -> Result<Vec<TransferLog>, ChatError> {
    let logs = chat_transfer_logs::table
        .filter(chat_transfer_logs::session_id.eq(session_id))
        .order(chat_transfer_logs::created_at.asc())
        .load(conn)?;
    Ok(logs)
}

/// Corrective sweep: recompute every agent's load from the sessions actually
/// active for it. Run after a crash that might have torn a transfer apart.
pub fn reconcile_agent_loads(conn: &mut PgConnection) -> Result<usize, ChatError> {
    use crate::shared::schema::chat_agents;

    conn.transaction::<usize, ChatError, _>(|conn| {
        let counts: Vec<(Option<i32>, i64)> = chat_sessions::table
            .filter(chat_sessions::status.eq(SessionStatus::Active))
            .group_by(chat_sessions::agent_id)
            .select((chat_sessions::agent_id, diesel::dsl::count_star()))
            .load(conn)?;

        let mut touched = diesel::update(chat_agents::table)
            .set(chat_agents::current_chat_count.eq(0))
            .execute(conn)?;

        for (agent_id, active) in counts {
            if let Some(agent_id) = agent_id {
                touched += diesel::update(chat_agents::table.find(agent_id))
                    .set(chat_agents::current_chat_count.eq(active as i32))
                    .execute(conn)?;
            }
        }
        Ok(touched)
    })
}

async fn create_session_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<ChatSession>, ChatError> {
    let session = {
        let mut conn = state.conn.get()?;
        let session = create_session(
            &mut conn,
            req.user_id,
            req.channel,
            req.priority.unwrap_or(0),
            req.metadata.unwrap_or_else(|| serde_json::json!({})),
        )?;
        auto_assign(&mut conn, session.id, req.specialty_tag.as_deref())?
    };

    if let Some(agent_id) = session.agent_id {
        state
            .router
            .broadcast(
                &room::agent(agent_id),
                ServerEvent::SessionAssigned {
                    session: session.clone(),
                },
            )
            .await;
    }

    Ok(Json(session))
}

async fn list_sessions_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionListQuery>,
) -> Result<Json<SessionListResponse>, ChatError> {
    let mut conn = state.conn.get()?;
    let (sessions, total) = list_sessions(&mut conn, &query)?;
    Ok(Json(SessionListResponse { sessions, total }))
}

async fn get_session_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
) -> Result<Json<ChatSession>, ChatError> {
    let mut conn = state.conn.get()?;
    Ok(Json(session_by_id(&mut conn, id)?))
}

async fn get_session_by_key_handler(
    State(state): State<Arc<AppState>>,
    Path(key): Path<Uuid>,
) -> Result<Json<ChatSession>, ChatError> {
    let mut conn = state.conn.get()?;
    Ok(Json(session_by_key(&mut conn, key)?))
}

async fn assign_session_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
    Json(req): Json<AssignRequest>,
) -> Result<Json<ChatSession>, ChatError> {
    let session = {
        let mut conn = state.conn.get()?;
        assign_agent(&mut conn, id, req.agent_id)?
    };

    state
        .router
        .broadcast(
            &room::agent(req.agent_id),
            ServerEvent::SessionAssigned {
                session: session.clone(),
            },
        )
        .await;

    Ok(Json(session))
}

async fn transfer_session_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
    Json(req): Json<TransferRequest>,
) -> Result<Json<ChatSession>, ChatError> {
    let (session, new_agent) = {
        let mut conn = state.conn.get()?;
        let session =
            transfer_session(&mut conn, id, req.from_agent_id, req.to_agent_id, req.reason)?;
        let new_agent = agents::agent_by_id(&mut conn, req.to_agent_id)?;
        (session, new_agent)
    };

    state
        .router
        .broadcast(
            &room::session(id),
            ServerEvent::SessionTransferred {
                session: session.clone(),
                new_agent: new_agent.clone(),
            },
        )
        .await;
    state
        .router
        .broadcast(
            &room::agent(req.to_agent_id),
            ServerEvent::SessionAssigned {
                session: session.clone(),
            },
        )
        .await;

    Ok(Json(session))
}

async fn close_session_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
    Json(req): Json<CloseRequest>,
) -> Result<Json<ChatSession>, ChatError> {
    let session = {
        let mut conn = state.conn.get()?;
        close_session(&mut conn, id, req.reason)?
    };

    state
        .router
        .broadcast(
            &room::session(id),
            ServerEvent::SessionClosed {
                session: session.clone(),
            },
        )
        .await;

    Ok(Json(session))
}

async fn rate_session_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
    Json(req): Json<RateRequest>,
) -> Result<Json<ChatSession>, ChatError> {
    let mut conn = state.conn.get()?;
    let session = rate_session(
        &mut conn,
        id,
        req.rating,
        req.comment,
        req.tags.unwrap_or_default(),
    )?;
    Ok(Json(session))
}

async fn queue_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<QueueResponse>, ChatError> {
    let mut conn = state.conn.get()?;
    Ok(Json(QueueResponse {
        queued: queue_length(&mut conn)?,
    }))
}

async fn session_stats_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<SessionStatistics>, ChatError> {
    let mut conn = state.conn.get()?;
    Ok(Json(statistics(&mut conn, &query)?))
}

async fn transfer_history_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
) -> Result<Json<Vec<TransferLog>>, ChatError> {
    let mut conn = state.conn.get()?;
    session_by_id(&mut conn, id)?;
    Ok(Json(transfer_history(&mut conn, id)?))
}

pub fn configure_session_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/api/chat/sessions",
            get(list_sessions_handler).post(create_session_handler),
        )
        .route("/api/chat/sessions/stats", get(session_stats_handler))
        .route("/api/chat/sessions/key/:key", get(get_session_by_key_handler))
        .route("/api/chat/sessions/:id", get(get_session_handler))
        .route("/api/chat/sessions/:id/assign", put(assign_session_handler))
        .route(
            "/api/chat/sessions/:id/transfer",
            put(transfer_session_handler),
        )
        .route("/api/chat/sessions/:id/close", put(close_session_handler))
        .route("/api/chat/sessions/:id/rate", put(rate_session_handler))
        .route(
            "/api/chat/sessions/:id/transfers",
            get(transfer_history_handler),
        )
        .route("/api/chat/queue", get(queue_handler))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rating_must_be_in_range() {
        assert!(validate_rating(0).is_err());
        assert!(validate_rating(6).is_err());
        assert!(validate_rating(-3).is_err());
        for rating in 1..=5 {
            assert!(validate_rating(rating).is_ok());
        }
    }

    #[test]
    fn rating_rejection_is_a_validation_error() {
        match validate_rating(9) {
            Err(ChatError::Validation(msg)) => assert!(msg.contains('9')),
            other => panic!("expected validation error, got {:?}", other.err()),
        }
    }
}
