//! Connection membership and event fan-out.
//!
//! The router keeps an explicit map of logical rooms (`session:<id>`,
//! `agent:<id>`) to live connection handles and pushes `ServerEvent`s into
//! per-connection channels. It mirrors what the stores decide; it never makes
//! a business decision itself, and it only fans an event out after the
//! backing write has been acknowledged.

pub mod events;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::agents;
use crate::messages;
use crate::realtime::events::{ClientEvent, ServerEvent};
use crate::sessions;
use crate::shared::enums::AgentStatus;
use crate::shared::error::ChatError;
use crate::shared::state::AppState;

/// Room naming scheme shared by everything that fans events out.
pub mod room {
    pub fn session(id: i32) -> String {
        format!("session:{}", id)
    }

    pub fn agent(id: i32) -> String {
        format!("agent:{}", id)
    }
}

pub type ConnId = Uuid;
type EventSender = mpsc::UnboundedSender<ServerEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

/// Identity attached to a connection. Authentication happened upstream; this
/// is only the already-verified role plus the matching id.
#[derive(Debug, Clone)]
pub struct Principal {
    pub role: Role,
    pub user_id: Option<Uuid>,
    pub agent_id: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub role: Role,
    pub user_id: Option<Uuid>,
    pub agent_id: Option<i32>,
}

impl Principal {
    pub fn from_query(query: WsQuery) -> Result<Self, ChatError> {
        match query.role {
            Role::User => {
                let user_id = query.user_id.ok_or_else(|| {
                    ChatError::Validation("user_id is required for role user".to_string())
                })?;
                Ok(Self {
                    role: Role::User,
                    user_id: Some(user_id),
                    agent_id: None,
                })
            }
            Role::Agent => {
                let agent_id = query.agent_id.ok_or_else(|| {
                    ChatError::Validation("agent_id is required for role agent".to_string())
                })?;
                Ok(Self {
                    role: Role::Agent,
                    user_id: None,
                    agent_id: Some(agent_id),
                })
            }
        }
    }
}

/// Membership of one session room, split by role.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Participants {
    pub users: Vec<Uuid>,
    pub agents: Vec<i32>,
}

#[derive(Default)]
pub struct RoomRouter {
    rooms: RwLock<HashMap<String, HashMap<ConnId, EventSender>>>,
    conns: RwLock<HashMap<ConnId, (Principal, EventSender)>>,
}

impl RoomRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, conn: ConnId, principal: Principal, tx: EventSender) {
        self.conns.write().await.insert(conn, (principal, tx));
    }

    /// Drop the connection from every room and from the connection table.
    pub async fn unregister(&self, conn: ConnId) {
        {
            let mut rooms = self.rooms.write().await;
            rooms.retain(|_, members| {
                members.remove(&conn);
                !members.is_empty()
            });
        }
        self.conns.write().await.remove(&conn);
    }

    pub async fn join(&self, room: &str, conn: ConnId) {
        let tx = match self.conns.read().await.get(&conn) {
            Some((_, tx)) => tx.clone(),
            None => return,
        };
        self.rooms
            .write()
            .await
            .entry(room.to_string())
            .or_default()
            .insert(conn, tx);
    }

    pub async fn leave(&self, room: &str, conn: ConnId) {
        let mut rooms = self.rooms.write().await;
        if let Some(members) = rooms.get_mut(room) {
            members.remove(&conn);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
    }

    /// Deliver to every connection in the room, the sender included.
    pub async fn broadcast(&self, room: &str, event: ServerEvent) {
        let rooms = self.rooms.read().await;
        if let Some(members) = rooms.get(room) {
            for tx in members.values() {
                let _ = tx.send(event.clone());
            }
        }
    }

    /// Deliver to the room, skipping one connection. Used for typing and join
    /// notices where the sender does not need its own echo.
    pub async fn broadcast_except(&self, room: &str, except: ConnId, event: ServerEvent) {
        let rooms = self.rooms.read().await;
        if let Some(members) = rooms.get(room) {
            for (conn, tx) in members {
                if *conn != except {
                    let _ = tx.send(event.clone());
                }
            }
        }
    }

    /// Deliver to every live connection regardless of room membership.
    pub async fn broadcast_all(&self, event: ServerEvent) {
        let conns = self.conns.read().await;
        for (_, tx) in conns.values() {
            let _ = tx.send(event.clone());
        }
    }

    pub async fn send_to(&self, conn: ConnId, event: ServerEvent) {
        if let Some((_, tx)) = self.conns.read().await.get(&conn) {
            let _ = tx.send(event);
        }
    }

    pub async fn room_size(&self, room: &str) -> usize {
        self.rooms
            .read()
            .await
            .get(room)
            .map(|members| members.len())
            .unwrap_or(0)
    }

    /// Who is currently connected inside a session room.
    pub async fn session_participants(&self, session_id: i32) -> Participants {
        let room = room::session(session_id);
        let member_ids: Vec<ConnId> = match self.rooms.read().await.get(&room) {
            Some(members) => members.keys().copied().collect(),
            None => return Participants::default(),
        };

        let conns = self.conns.read().await;
        let mut participants = Participants::default();
        for conn in member_ids {
            if let Some((principal, _)) = conns.get(&conn) {
                match principal.role {
                    Role::User => {
                        if let Some(user_id) = principal.user_id {
                            if !participants.users.contains(&user_id) {
                                participants.users.push(user_id);
                            }
                        }
                    }
                    Role::Agent => {
                        if let Some(agent_id) = principal.agent_id {
                            if !participants.agents.contains(&agent_id) {
                                participants.agents.push(agent_id);
                            }
                        }
                    }
                }
            }
        }
        participants
    }

    /// Distinct agent ids with at least one live connection.
    pub async fn online_agents(&self) -> Vec<i32> {
        let conns = self.conns.read().await;
        let mut agents: Vec<i32> = conns
            .values()
            .filter_map(|(principal, _)| principal.agent_id)
            .collect();
        agents.sort_unstable();
        agents.dedup();
        agents
    }
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ChatError> {
    let principal = Principal::from_query(query)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, principal)))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, principal: Principal) {
    let (mut sink, mut stream) = socket.split();
    let conn_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

    state
        .router
        .register(conn_id, principal.clone(), tx.clone())
        .await;
    info!("client connected: {} as {:?}", conn_id, principal.role);

    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sink.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!("failed to serialize event: {}", e),
            }
        }
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => handle_event(&state, conn_id, &tx, event).await,
                Err(e) => {
                    warn!("unparseable client event from {}: {}", conn_id, e);
                    let _ = tx.send(ServerEvent::error(format!("invalid event: {}", e)));
                }
            },
            Ok(Message::Close(_)) => break,
            Err(e) => {
                warn!("websocket error on {}: {}", conn_id, e);
                break;
            }
            _ => {}
        }
    }

    handle_disconnect(&state, conn_id, &principal).await;
    send_task.abort();
    info!("client disconnected: {}", conn_id);
}

/// One inbound intent. Domain calls happen first and are awaited; the fan-out
/// only runs once the write is acknowledged. A domain failure goes back to
/// the originating connection as an error notification.
async fn handle_event(
    state: &Arc<AppState>,
    conn_id: ConnId,
    tx: &EventSender,
    event: ClientEvent,
) {
    let router = &state.router;

    match event {
        ClientEvent::AgentOnline { agent_id } => {
            match with_conn(state, |conn| agents::set_status(conn, agent_id, AgentStatus::Online))
            {
                Ok(agent) => {
                    router.join(&room::agent(agent_id), conn_id).await;
                    router
                        .broadcast_all(ServerEvent::AgentStatusChanged {
                            agent_id,
                            status: agent.status,
                        })
                        .await;
                }
                Err(e) => notify_error(tx, &e),
            }
        }
        ClientEvent::AgentOffline { agent_id } => {
            match with_conn(state, |conn| {
                agents::set_status(conn, agent_id, AgentStatus::Offline)
            }) {
                Ok(agent) => {
                    router.leave(&room::agent(agent_id), conn_id).await;
                    router
                        .broadcast_all(ServerEvent::AgentStatusChanged {
                            agent_id,
                            status: agent.status,
                        })
                        .await;
                }
                Err(e) => notify_error(tx, &e),
            }
        }
        ClientEvent::AgentBusy { agent_id } => {
            match with_conn(state, |conn| agents::set_status(conn, agent_id, AgentStatus::Busy)) {
                Ok(agent) => {
                    router
                        .broadcast_all(ServerEvent::AgentStatusChanged {
                            agent_id,
                            status: agent.status,
                        })
                        .await;
                }
                Err(e) => notify_error(tx, &e),
            }
        }
        ClientEvent::AgentJoinSession { session_id, .. } => {
            match with_conn(state, |conn| sessions::session_by_id(conn, session_id)) {
                Ok(_) => router.join(&room::session(session_id), conn_id).await,
                Err(e) => notify_error(tx, &e),
            }
        }
        ClientEvent::UserJoinSession {
            session_id,
            user_id,
        } => match with_conn(state, |conn| sessions::session_by_id(conn, session_id)) {
            Ok(_) => {
                router.join(&room::session(session_id), conn_id).await;
                router
                    .broadcast_except(
                        &room::session(session_id),
                        conn_id,
                        ServerEvent::UserJoined {
                            session_id,
                            user_id,
                        },
                    )
                    .await;
            }
            Err(e) => notify_error(tx, &e),
        },
        ClientEvent::AgentTyping {
            session_id,
            agent_id,
        } => {
            router
                .broadcast_except(
                    &room::session(session_id),
                    conn_id,
                    ServerEvent::AgentTyping {
                        session_id,
                        agent_id,
                    },
                )
                .await;
        }
        ClientEvent::UserTyping {
            session_id,
            user_id,
        } => {
            router
                .broadcast_except(
                    &room::session(session_id),
                    conn_id,
                    ServerEvent::UserTyping {
                        session_id,
                        user_id,
                    },
                )
                .await;
        }
        ClientEvent::MessageSend {
            session_id,
            sender_type,
            sender_id,
            content,
            message_type,
            attachments,
            metadata,
        } => {
            let request = messages::SendMessageRequest {
                sender_type,
                sender_id,
                content,
                message_type,
                attachments,
                metadata,
            };
            match with_conn(state, |conn| {
                messages::append_message(conn, session_id, request)
            }) {
                Ok(message) => {
                    if let Some(template_id) = message.quick_reply_template_id() {
                        info!(
                            "quick reply template {} used in session {}",
                            template_id, session_id
                        );
                    }
                    router
                        .broadcast(
                            &room::session(session_id),
                            ServerEvent::MessageNew { message },
                        )
                        .await;
                }
                Err(e) => notify_error(tx, &e),
            }
        }
        ClientEvent::MessageMarkRead {
            session_id,
            message_id,
        } => match with_conn(state, |conn| messages::mark_read(conn, message_id)) {
            Ok(_) => {
                router
                    .broadcast(
                        &room::session(session_id),
                        ServerEvent::MessageRead {
                            session_id,
                            message_id,
                        },
                    )
                    .await;
            }
            Err(e) => notify_error(tx, &e),
        },
        ClientEvent::SessionClose { session_id, reason } => {
            match with_conn(state, |conn| sessions::close_session(conn, session_id, reason)) {
                Ok(session) => {
                    router
                        .broadcast(
                            &room::session(session_id),
                            ServerEvent::SessionClosed { session },
                        )
                        .await;
                }
                Err(e) => notify_error(tx, &e),
            }
        }
        ClientEvent::SessionTransfer {
            session_id,
            from_agent_id,
            to_agent_id,
            reason,
        } => {
            let result = with_conn(state, |conn| {
                let session =
                    sessions::transfer_session(conn, session_id, from_agent_id, to_agent_id, reason)?;
                let new_agent = agents::agent_by_id(conn, to_agent_id)?;
                Ok((session, new_agent))
            });
            match result {
                Ok((session, new_agent)) => {
                    router
                        .broadcast(
                            &room::session(session_id),
                            ServerEvent::SessionTransferred {
                                session: session.clone(),
                                new_agent,
                            },
                        )
                        .await;
                    router
                        .broadcast(
                            &room::agent(to_agent_id),
                            ServerEvent::SessionAssigned { session },
                        )
                        .await;
                }
                Err(e) => notify_error(tx, &e),
            }
        }
    }
}

/// Disconnect side effects: an agent dropping goes offline and the change is
/// announced; a user dropping is announced to that user's active session
/// rooms as informational only, the sessions stay open.
async fn handle_disconnect(state: &Arc<AppState>, conn_id: ConnId, principal: &Principal) {
    let router = &state.router;

    match principal.role {
        Role::Agent => {
            if let Some(agent_id) = principal.agent_id {
                match with_conn(state, |conn| {
                    agents::set_status(conn, agent_id, AgentStatus::Offline)
                }) {
                    Ok(_) => {
                        router
                            .broadcast_all(ServerEvent::AgentStatusChanged {
                                agent_id,
                                status: AgentStatus::Offline,
                            })
                            .await;
                    }
                    Err(e) => error!("failed to set agent {} offline: {}", agent_id, e),
                }
            }
        }
        Role::User => {
            if let Some(user_id) = principal.user_id {
                match with_conn(state, |conn| sessions::active_by_user(conn, user_id)) {
                    Ok(active) => {
                        for session in active {
                            router
                                .broadcast_except(
                                    &room::session(session.id),
                                    conn_id,
                                    ServerEvent::UserLeft {
                                        session_id: session.id,
                                        user_id,
                                    },
                                )
                                .await;
                        }
                    }
                    Err(e) => error!("failed to load active sessions for {}: {}", user_id, e),
                }
            }
        }
    }

    router.unregister(conn_id).await;
}

fn with_conn<T>(
    state: &Arc<AppState>,
    f: impl FnOnce(&mut diesel::PgConnection) -> Result<T, ChatError>,
) -> Result<T, ChatError> {
    let mut conn = state.conn.get()?;
    f(&mut conn)
}

fn notify_error(tx: &EventSender, err: &ChatError) {
    warn!("realtime event failed: {}", err);
    let _ = tx.send(ServerEvent::error(err.to_string()));
}

pub fn configure_realtime_routes() -> Router<Arc<AppState>> {
    Router::new().route("/ws/chat", get(websocket_handler))
}
