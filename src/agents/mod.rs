//! Agent registry: availability, capacity accounting and selection.
//!
//! Capacity is charged through `try_reserve_slot`, a single conditional
//! UPDATE whose affected-row count is the success signal. Two assignment
//! attempts racing for an agent's last open slot therefore cannot both win,
//! regardless of how many server tasks are in flight.

use axum::{
    extract::{Path, Query, State},
    routing::{get, put},
    Json, Router,
};
use chrono::Utc;
use diesel::dsl::sql;
use diesel::prelude::*;
use diesel::sql_types::{Double, Nullable};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::realtime::events::ServerEvent;
use crate::shared::enums::{AgentRole, AgentStatus};
use crate::shared::error::ChatError;
use crate::shared::models::{ChatAgent, NewChatAgent};
use crate::shared::schema::chat_agents;
use crate::shared::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateAgentRequest {
    pub account_id: Uuid,
    pub display_name: String,
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub role: AgentRole,
    pub manager_id: Option<i32>,
    pub max_concurrent_chats: Option<i32>,
    pub specialty_tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, AsChangeset)]
#[diesel(table_name = chat_agents)]
pub struct UpdateAgentRequest {
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub role: Option<AgentRole>,
    pub manager_id: Option<i32>,
    pub max_concurrent_chats: Option<i32>,
    pub specialty_tags: Option<Vec<String>>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct SetStatusRequest {
    pub status: AgentStatus,
}

#[derive(Debug, Deserialize)]
pub struct AgentListQuery {
    pub role: Option<AgentRole>,
    pub status: Option<AgentStatus>,
    pub manager_id: Option<i32>,
    pub is_active: Option<bool>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AvailableQuery {
    pub specialty: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AgentListResponse {
    pub agents: Vec<ChatAgent>,
    pub total: i64,
}

#[derive(Debug, Serialize)]
pub struct OnlineStatistics {
    pub total: i64,
    pub online: i64,
    pub busy: i64,
    pub offline: i64,
    pub avg_load: f64,
}

pub fn create_agent(
    conn: &mut PgConnection,
    req: CreateAgentRequest,
    default_max_chats: i32,
) -> Result<ChatAgent, ChatError> {
    let agent = NewChatAgent {
        account_id: req.account_id,
        display_name: req.display_name,
        avatar_url: req.avatar_url,
        role: req.role,
        status: AgentStatus::Offline,
        is_active: true,
        max_concurrent_chats: req.max_concurrent_chats.unwrap_or(default_max_chats),
        current_chat_count: 0,
        specialty_tags: req.specialty_tags.unwrap_or_default(),
        manager_id: req.manager_id,
    };

    if agent.max_concurrent_chats <= 0 {
        return Err(ChatError::Validation(
            "max_concurrent_chats must be positive".to_string(),
        ));
    }

    let agent = diesel::insert_into(chat_agents::table)
        .values(&agent)
        .get_result(conn)?;
    Ok(agent)
}

pub fn agent_by_id(conn: &mut PgConnection, agent_id: i32) -> Result<ChatAgent, ChatError> {
    chat_agents::table
        .find(agent_id)
        .first(conn)
        .optional()?
        .ok_or_else(|| ChatError::NotFound(format!("agent {} does not exist", agent_id)))
}

pub fn agent_by_account(conn: &mut PgConnection, account: Uuid) -> Result<ChatAgent, ChatError> {
    chat_agents::table
        .filter(chat_agents::account_id.eq(account))
        .first(conn)
        .optional()?
        .ok_or_else(|| ChatError::NotFound(format!("no agent for account {}", account)))
}

pub fn list_agents(
    conn: &mut PgConnection,
    query: &AgentListQuery,
) -> Result<(Vec<ChatAgent>, i64), ChatError> {
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(20).clamp(1, 100);

    let mut count_q = chat_agents::table.into_boxed();
    let mut data_q = chat_agents::table.into_boxed();

    if let Some(role) = query.role {
        count_q = count_q.filter(chat_agents::role.eq(role));
        data_q = data_q.filter(chat_agents::role.eq(role));
    }
    if let Some(status) = query.status {
        count_q = count_q.filter(chat_agents::status.eq(status));
        data_q = data_q.filter(chat_agents::status.eq(status));
    }
    if let Some(manager_id) = query.manager_id {
        count_q = count_q.filter(chat_agents::manager_id.eq(manager_id));
        data_q = data_q.filter(chat_agents::manager_id.eq(manager_id));
    }
    if let Some(is_active) = query.is_active {
        count_q = count_q.filter(chat_agents::is_active.eq(is_active));
        data_q = data_q.filter(chat_agents::is_active.eq(is_active));
    }

    let total: i64 = count_q.count().get_result(conn)?;
    let agents = data_q
        .order(chat_agents::created_at.desc())
        .limit(limit)
        .offset((page - 1) * limit)
        .load(conn)?;

    Ok((agents, total))
}

pub fn update_agent(
    conn: &mut PgConnection,
    agent_id: i32,
    changes: &UpdateAgentRequest,
) -> Result<ChatAgent, ChatError> {
    if let Some(max) = changes.max_concurrent_chats {
        if max <= 0 {
            return Err(ChatError::Validation(
                "max_concurrent_chats must be positive".to_string(),
            ));
        }
    }

    diesel::update(chat_agents::table.find(agent_id))
        .set((changes, chat_agents::updated_at.eq(Utc::now())))
        .get_result(conn)
        .optional()?
        .ok_or_else(|| ChatError::NotFound(format!("agent {} does not exist", agent_id)))
}

/// Soft delete. Sessions keep referencing the agent row; it just stops being
/// eligible for assignment.
pub fn deactivate_agent(conn: &mut PgConnection, agent_id: i32) -> Result<ChatAgent, ChatError> {
    diesel::update(chat_agents::table.find(agent_id))
        .set((
            chat_agents::is_active.eq(false),
            chat_agents::status.eq(AgentStatus::Offline),
            chat_agents::updated_at.eq(Utc::now()),
        ))
        .get_result(conn)
        .optional()?
        .ok_or_else(|| ChatError::NotFound(format!("agent {} does not exist", agent_id)))
}

/// Set availability. Going offline only stops new assignments; active
/// sessions stay with the agent until closed or transferred.
pub fn set_status(
    conn: &mut PgConnection,
    agent_id: i32,
    status: AgentStatus,
) -> Result<ChatAgent, ChatError> {
    let now = Utc::now();
    let updated = if status == AgentStatus::Online {
        diesel::update(chat_agents::table.find(agent_id))
            .set((
                chat_agents::status.eq(status),
                chat_agents::last_online_at.eq(now),
                chat_agents::updated_at.eq(now),
            ))
            .get_result(conn)
            .optional()?
    } else {
        diesel::update(chat_agents::table.find(agent_id))
            .set((
                chat_agents::status.eq(status),
                chat_agents::updated_at.eq(now),
            ))
            .get_result(conn)
            .optional()?
    };

    updated.ok_or_else(|| ChatError::NotFound(format!("agent {} does not exist", agent_id)))
}

/// Advisory capacity check. The authoritative decision is made by
/// `try_reserve_slot`; this exists for callers that want to pre-filter.
pub fn can_accept_new_chat(conn: &mut PgConnection, agent_id: i32) -> Result<bool, ChatError> {
    let agent = agent_by_id(conn, agent_id)?;
    Ok(agent.is_active
        && agent.status == AgentStatus::Online
        && agent.current_chat_count < agent.max_concurrent_chats)
}

/// Atomically charge one slot of the agent's capacity.
///
/// The WHERE clause carries the capacity guard, so the check and the
/// increment are one statement; returns false when the agent is offline,
/// inactive or already full.
pub fn try_reserve_slot(conn: &mut PgConnection, agent_id: i32) -> Result<bool, ChatError> {
    let updated = diesel::update(
        chat_agents::table
            .find(agent_id)
            .filter(chat_agents::is_active.eq(true))
            .filter(chat_agents::status.eq(AgentStatus::Online))
            .filter(chat_agents::current_chat_count.lt(chat_agents::max_concurrent_chats)),
    )
    .set((
        chat_agents::current_chat_count.eq(chat_agents::current_chat_count + 1),
        chat_agents::updated_at.eq(Utc::now()),
    ))
    .execute(conn)?;

    Ok(updated == 1)
}

/// Release one slot, flooring at zero so a double release can never drive the
/// counter negative.
pub fn release_slot(conn: &mut PgConnection, agent_id: i32) -> Result<(), ChatError> {
    diesel::update(
        chat_agents::table
            .find(agent_id)
            .filter(chat_agents::current_chat_count.gt(0)),
    )
    .set((
        chat_agents::current_chat_count.eq(chat_agents::current_chat_count - 1),
        chat_agents::updated_at.eq(Utc::now()),
    ))
    .execute(conn)?;
    Ok(())
}

/// Agents currently eligible for a new chat, least-loaded first.
pub fn available_agents(
    conn: &mut PgConnection,
    specialty: Option<&str>,
) -> Result<Vec<ChatAgent>, ChatError> {
    let mut q = chat_agents::table
        .filter(chat_agents::is_active.eq(true))
        .filter(chat_agents::status.eq(AgentStatus::Online))
        .filter(chat_agents::current_chat_count.lt(chat_agents::max_concurrent_chats))
        .into_boxed();

    if let Some(tag) = specialty {
        q = q.filter(chat_agents::specialty_tags.contains(vec![tag.to_string()]));
    }

    let mut agents: Vec<ChatAgent> = q.load(conn)?;
    agents.sort_by(compare_load);
    Ok(agents)
}

/// Pick the best assignment target among the given candidates, or none.
pub fn select_agent(
    conn: &mut PgConnection,
    specialty: Option<&str>,
) -> Result<Option<ChatAgent>, ChatError> {
    Ok(available_agents(conn, specialty)?.into_iter().next())
}

/// Load-balancing order: lowest chat count first, ties broken by the most
/// recently online agent so the same idle agent is not hammered forever.
pub fn compare_load(a: &ChatAgent, b: &ChatAgent) -> std::cmp::Ordering {
    a.current_chat_count
        .cmp(&b.current_chat_count)
        .then(b.last_online_at.cmp(&a.last_online_at))
}

pub fn team_members(
    conn: &mut PgConnection,
    manager: i32,
) -> Result<Vec<ChatAgent>, ChatError> {
    let members = chat_agents::table
        .filter(chat_agents::manager_id.eq(manager))
        .filter(chat_agents::is_active.eq(true))
        .order(chat_agents::display_name.asc())
        .load(conn)?;
    Ok(members)
}

pub fn online_statistics(conn: &mut PgConnection) -> Result<OnlineStatistics, ChatError> {
    let total: i64 = chat_agents::table
        .filter(chat_agents::is_active.eq(true))
        .count()
        .get_result(conn)?;
    let online: i64 = chat_agents::table
        .filter(chat_agents::is_active.eq(true))
        .filter(chat_agents::status.eq(AgentStatus::Online))
        .count()
        .get_result(conn)?;
    let busy: i64 = chat_agents::table
        .filter(chat_agents::is_active.eq(true))
        .filter(chat_agents::status.eq(AgentStatus::Busy))
        .count()
        .get_result(conn)?;
    let offline: i64 = chat_agents::table
        .filter(chat_agents::is_active.eq(true))
        .filter(chat_agents::status.eq(AgentStatus::Offline))
        .count()
        .get_result(conn)?;

    let avg_load: Option<f64> = chat_agents::table
        .filter(chat_agents::is_active.eq(true))
        .filter(chat_agents::status.eq_any([AgentStatus::Online, AgentStatus::Busy]))
        .select(sql::<Nullable<Double>>("AVG(current_chat_count)::float8"))
        .get_result(conn)?;

    Ok(OnlineStatistics {
        total,
        online,
        busy,
        offline,
        avg_load: avg_load.unwrap_or(0.0),
    })
}

/// Shutdown hook: nobody stays marked online across a restart.
pub fn set_all_offline(conn: &mut PgConnection) -> Result<usize, ChatError> {
    let updated = diesel::update(chat_agents::table)
        .set((
            chat_agents::status.eq(AgentStatus::Offline),
            chat_agents::updated_at.eq(Utc::now()),
        ))
        .execute(conn)?;
    Ok(updated)
}

async fn create_agent_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateAgentRequest>,
) -> Result<Json<ChatAgent>, ChatError> {
    let mut conn = state.conn.get()?;
    let agent = create_agent(
        &mut conn,
        req,
        state.config.chat.default_max_concurrent_chats,
    )?;
    Ok(Json(agent))
}

async fn list_agents_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AgentListQuery>,
) -> Result<Json<AgentListResponse>, ChatError> {
    let mut conn = state.conn.get()?;
    let (agents, total) = list_agents(&mut conn, &query)?;
    Ok(Json(AgentListResponse { agents, total }))
}

async fn get_agent_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
) -> Result<Json<ChatAgent>, ChatError> {
    let mut conn = state.conn.get()?;
    Ok(Json(agent_by_id(&mut conn, id)?))
}

async fn update_agent_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
    Json(req): Json<UpdateAgentRequest>,
) -> Result<Json<ChatAgent>, ChatError> {
    let mut conn = state.conn.get()?;
    Ok(Json(update_agent(&mut conn, id, &req)?))
}

async fn deactivate_agent_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
) -> Result<Json<ChatAgent>, ChatError> {
    let mut conn = state.conn.get()?;
    Ok(Json(deactivate_agent(&mut conn, id)?))
}

async fn set_status_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
    Json(req): Json<SetStatusRequest>,
) -> Result<Json<ChatAgent>, ChatError> {
    let agent = {
        let mut conn = state.conn.get()?;
        set_status(&mut conn, id, req.status)?
    };

    state
        .router
        .broadcast_all(ServerEvent::AgentStatusChanged {
            agent_id: agent.id,
            status: agent.status,
        })
        .await;

    Ok(Json(agent))
}

async fn available_agents_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AvailableQuery>,
) -> Result<Json<Vec<ChatAgent>>, ChatError> {
    let mut conn = state.conn.get()?;
    Ok(Json(available_agents(&mut conn, query.specialty.as_deref())?))
}

async fn team_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
) -> Result<Json<Vec<ChatAgent>>, ChatError> {
    let mut conn = state.conn.get()?;
    Ok(Json(team_members(&mut conn, id)?))
}

async fn agent_stats_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<OnlineStatistics>, ChatError> {
    let mut conn = state.conn.get()?;
    Ok(Json(online_statistics(&mut conn)?))
}

pub fn configure_agent_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/api/chat/agents",
            get(list_agents_handler).post(create_agent_handler),
        )
        .route("/api/chat/agents/stats", get(agent_stats_handler))
        .route("/api/chat/agents/available", get(available_agents_handler))
        .route(
            "/api/chat/agents/:id",
            get(get_agent_handler)
                .patch(update_agent_handler)
                .delete(deactivate_agent_handler),
        )
        .route("/api/chat/agents/:id/status", put(set_status_handler))
        .route("/api/chat/agents/:id/team", get(team_handler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn agent(id: i32, count: i32, online_secs_ago: i64) -> ChatAgent {
        let now = Utc::now();
        ChatAgent {
            id,
            account_id: Uuid::new_v4(),
            display_name: format!("agent-{}", id),
            avatar_url: None,
            role: AgentRole::Agent,
            status: AgentStatus::Online,
            is_active: true,
            max_concurrent_chats: 5,
            current_chat_count: count,
            specialty_tags: vec![],
            manager_id: None,
            last_online_at: Some(now - Duration::seconds(online_secs_ago)),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn selection_prefers_lowest_load() {
        let mut agents = vec![agent(1, 3, 10), agent(2, 0, 10), agent(3, 1, 10)];
        agents.sort_by(compare_load);
        assert_eq!(agents[0].id, 2);
        assert_eq!(agents[1].id, 3);
        assert_eq!(agents[2].id, 1);
    }

    #[test]
    fn selection_breaks_ties_by_freshest_online() {
        let mut agents = vec![agent(1, 2, 600), agent(2, 2, 5), agent(3, 2, 60)];
        agents.sort_by(compare_load);
        assert_eq!(agents[0].id, 2);
        assert_eq!(agents[1].id, 3);
        assert_eq!(agents[2].id, 1);
    }

    #[test]
    fn agents_never_online_rank_last_within_a_load_tier() {
        let mut never = agent(1, 0, 0);
        never.last_online_at = None;
        let mut agents = vec![never, agent(2, 0, 30)];
        agents.sort_by(compare_load);
        assert_eq!(agents[0].id, 2);
    }
}
