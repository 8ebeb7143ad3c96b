use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::shared::enums::{
    AgentRole, AgentStatus, Channel, CloseReason, MessageType, SenderType, SessionStatus,
};
use crate::shared::schema::{chat_agents, chat_messages, chat_sessions, chat_transfer_logs};

/// One human support worker.
///
/// `current_chat_count` is only ever mutated through the conditional updates
/// in the agents module, so `0 <= current_chat_count <= max_concurrent_chats`
/// holds at all times.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable)]
#[diesel(table_name = chat_agents)]
pub struct ChatAgent {
    pub id: i32,
    pub account_id: Uuid,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub role: AgentRole,
    pub status: AgentStatus,
    pub is_active: bool,
    pub max_concurrent_chats: i32,
    pub current_chat_count: i32,
    pub specialty_tags: Vec<String>,
    pub manager_id: Option<i32>,
    pub last_online_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = chat_agents)]
pub struct NewChatAgent {
    pub account_id: Uuid,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub role: AgentRole,
    pub status: AgentStatus,
    pub is_active: bool,
    pub max_concurrent_chats: i32,
    pub current_chat_count: i32,
    pub specialty_tags: Vec<String>,
    pub manager_id: Option<i32>,
}

/// One support conversation. `agent_id` is set exactly while the session is
/// active; a closed session keeps the last agent for reporting.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable)]
#[diesel(table_name = chat_sessions)]
pub struct ChatSession {
    pub id: i32,
    pub session_key: Uuid,
    pub user_id: Uuid,
    pub agent_id: Option<i32>,
    pub status: SessionStatus,
    pub channel: Channel,
    pub priority: i32,
    pub metadata: serde_json::Value,
    pub queued_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<CloseReason>,
    pub rating: Option<i32>,
    pub rating_comment: Option<String>,
    pub rating_tags: Vec<String>,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = chat_sessions)]
pub struct NewChatSession {
    pub session_key: Uuid,
    pub user_id: Uuid,
    pub status: SessionStatus,
    pub channel: Channel,
    pub priority: i32,
    pub metadata: serde_json::Value,
    pub queued_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// One unit of conversation content. Immutable after insert except the read
/// state and the soft-delete blanking.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable)]
#[diesel(table_name = chat_messages)]
pub struct ChatMessage {
    pub id: i64,
    pub session_id: i32,
    pub sender_type: SenderType,
    pub sender_id: String,
    pub content: String,
    pub message_type: MessageType,
    pub attachments: serde_json::Value,
    pub metadata: serde_json::Value,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Quick-reply template carried in message metadata, if any. Downstream
    /// usage counters key off this.
    pub fn quick_reply_template_id(&self) -> Option<i64> {
        if self.message_type != MessageType::QuickReply {
            return None;
        }
        self.metadata.get("template_id").and_then(|v| v.as_i64())
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = chat_messages)]
pub struct NewChatMessage {
    pub session_id: i32,
    pub sender_type: SenderType,
    pub sender_id: String,
    pub content: String,
    pub message_type: MessageType,
    pub attachments: serde_json::Value,
    pub metadata: serde_json::Value,
}

/// Audit trail entry written exactly once per transfer.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable)]
#[diesel(table_name = chat_transfer_logs)]
pub struct TransferLog {
    pub id: i32,
    pub session_id: i32,
    pub from_agent_id: i32,
    pub to_agent_id: i32,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = chat_transfer_logs)]
pub struct NewTransferLog {
    pub session_id: i32,
    pub from_agent_id: i32,
    pub to_agent_id: i32,
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(message_type: MessageType, metadata: serde_json::Value) -> ChatMessage {
        ChatMessage {
            id: 1,
            session_id: 1,
            sender_type: SenderType::Agent,
            sender_id: "7".to_string(),
            content: "hello".to_string(),
            message_type,
            attachments: serde_json::json!([]),
            metadata,
            is_read: false,
            read_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn quick_reply_template_id_requires_quick_reply_type() {
        let msg = message(MessageType::QuickReply, serde_json::json!({"template_id": 42}));
        assert_eq!(msg.quick_reply_template_id(), Some(42));

        let msg = message(MessageType::Text, serde_json::json!({"template_id": 42}));
        assert_eq!(msg.quick_reply_template_id(), None);

        let msg = message(MessageType::QuickReply, serde_json::json!({}));
        assert_eq!(msg.quick_reply_template_id(), None);
    }
}
