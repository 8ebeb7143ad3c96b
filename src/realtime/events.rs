//! Wire protocol for the chat WebSocket: inbound intents and outbound
//! notifications, tagged with the event names clients already speak.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::shared::enums::{AgentStatus, CloseReason, MessageType, SenderType};
use crate::shared::models::{ChatAgent, ChatMessage, ChatSession};

/// Intents a connected client can send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "agent:online")]
    AgentOnline { agent_id: i32 },
    #[serde(rename = "agent:offline")]
    AgentOffline { agent_id: i32 },
    #[serde(rename = "agent:busy")]
    AgentBusy { agent_id: i32 },
    #[serde(rename = "agent:join_session")]
    AgentJoinSession { session_id: i32, agent_id: i32 },
    #[serde(rename = "agent:typing")]
    AgentTyping { session_id: i32, agent_id: i32 },
    #[serde(rename = "user:join_session")]
    UserJoinSession { session_id: i32, user_id: Uuid },
    #[serde(rename = "user:typing")]
    UserTyping { session_id: i32, user_id: Uuid },
    #[serde(rename = "message:send")]
    MessageSend {
        session_id: i32,
        sender_type: SenderType,
        sender_id: String,
        content: String,
        #[serde(default)]
        message_type: MessageType,
        attachments: Option<serde_json::Value>,
        metadata: Option<serde_json::Value>,
    },
    #[serde(rename = "message:mark_read")]
    MessageMarkRead { session_id: i32, message_id: i64 },
    #[serde(rename = "session:close")]
    SessionClose { session_id: i32, reason: CloseReason },
    #[serde(rename = "session:transfer")]
    SessionTransfer {
        session_id: i32,
        from_agent_id: i32,
        to_agent_id: i32,
        reason: Option<String>,
    },
}

/// Notifications fanned out to room members.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "message:new")]
    MessageNew { message: ChatMessage },
    #[serde(rename = "message:read")]
    MessageRead { session_id: i32, message_id: i64 },
    #[serde(rename = "session:assigned")]
    SessionAssigned { session: ChatSession },
    #[serde(rename = "session:closed")]
    SessionClosed { session: ChatSession },
    #[serde(rename = "session:transferred")]
    SessionTransferred {
        session: ChatSession,
        new_agent: ChatAgent,
    },
    #[serde(rename = "agent:status_changed")]
    AgentStatusChanged { agent_id: i32, status: AgentStatus },
    #[serde(rename = "user:joined")]
    UserJoined { session_id: i32, user_id: Uuid },
    #[serde(rename = "user:left")]
    UserLeft { session_id: i32, user_id: Uuid },
    #[serde(rename = "user:typing")]
    UserTyping { session_id: i32, user_id: Uuid },
    #[serde(rename = "agent:typing")]
    AgentTyping { session_id: i32, agent_id: i32 },
    /// Generic envelope, also the error channel back to a sender.
    #[serde(rename = "notification")]
    Notification {
        kind: String,
        message: String,
        data: Option<serde_json::Value>,
    },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Notification {
            kind: "error".to_string(),
            message: message.into(),
            data: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_event_names_match_the_wire_protocol() {
        let event: ClientEvent = serde_json::from_str(
            r#"{"type":"message:send","session_id":3,"sender_type":"user",
                "sender_id":"u-1","content":"hi"}"#,
        )
        .unwrap();
        match event {
            ClientEvent::MessageSend {
                session_id,
                message_type,
                ..
            } => {
                assert_eq!(session_id, 3);
                assert_eq!(message_type, MessageType::Text);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let event: ClientEvent =
            serde_json::from_str(r#"{"type":"agent:online","agent_id":7}"#).unwrap();
        assert!(matches!(event, ClientEvent::AgentOnline { agent_id: 7 }));

        let event: ClientEvent = serde_json::from_str(
            r#"{"type":"session:close","session_id":3,"reason":"resolved"}"#,
        )
        .unwrap();
        assert!(matches!(
            event,
            ClientEvent::SessionClose {
                reason: CloseReason::Resolved,
                ..
            }
        ));
    }

    #[test]
    fn server_event_names_match_the_wire_protocol() {
        let json = serde_json::to_value(ServerEvent::AgentStatusChanged {
            agent_id: 7,
            status: AgentStatus::Online,
        })
        .unwrap();
        assert_eq!(json["type"], "agent:status_changed");
        assert_eq!(json["status"], "online");

        let json = serde_json::to_value(ServerEvent::error("boom")).unwrap();
        assert_eq!(json["type"], "notification");
        assert_eq!(json["kind"], "error");
        assert_eq!(json["message"], "boom");
    }
}
