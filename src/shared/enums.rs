//! Database enum types for the chat schema.
//!
//! Every status/kind column is a Rust enum stored as a SmallInt. Using enums
//! instead of TEXT columns provides:
//! - Type safety at compile time
//! - Efficient storage and indexing
//! - Automatic validation on the way in and out of the database
//!
//! All enums derive the traits needed for Diesel ORM integration.

use diesel::deserialize::{self, FromSql};
use diesel::pg::{Pg, PgValue};
use diesel::serialize::{self, Output, ToSql};
use diesel::sql_types::SmallInt;
use diesel::{AsExpression, FromSqlRow};
use serde::{Deserialize, Serialize};
use std::io::Write;

// ============================================================================
// AGENT ROLE
// ============================================================================

/// Role of a support worker inside the chat team
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = SmallInt)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum AgentRole {
    Agent = 0,
    Manager = 1,
}

impl Default for AgentRole {
    fn default() -> Self {
        Self::Agent
    }
}

impl ToSql<SmallInt, Pg> for AgentRole {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        let v = *self as i16;
        out.write_all(&v.to_be_bytes())?;
        Ok(serialize::IsNull::No)
    }
}

impl FromSql<SmallInt, Pg> for AgentRole {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        let value = i16::from_sql(bytes)?;
        match value {
            0 => Ok(Self::Agent),
            1 => Ok(Self::Manager),
            _ => Err(format!("Unknown AgentRole: {}", value).into()),
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Agent => write!(f, "agent"),
            Self::Manager => write!(f, "manager"),
        }
    }
}

impl std::str::FromStr for AgentRole {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "agent" => Ok(Self::Agent),
            "manager" => Ok(Self::Manager),
            _ => Err(format!("Unknown agent role: {}", s)),
        }
    }
}

// ============================================================================
// AGENT STATUS
// ============================================================================

/// Availability of an agent for new assignments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = SmallInt)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum AgentStatus {
    Offline = 0,
    Online = 1,
    Busy = 2,
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self::Offline
    }
}

impl ToSql<SmallInt, Pg> for AgentStatus {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        let v = *self as i16;
        out.write_all(&v.to_be_bytes())?;
        Ok(serialize::IsNull::No)
    }
}

impl FromSql<SmallInt, Pg> for AgentStatus {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        let value = i16::from_sql(bytes)?;
        match value {
            0 => Ok(Self::Offline),
            1 => Ok(Self::Online),
            2 => Ok(Self::Busy),
            _ => Err(format!("Unknown AgentStatus: {}", value).into()),
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Offline => write!(f, "offline"),
            Self::Online => write!(f, "online"),
            Self::Busy => write!(f, "busy"),
        }
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "offline" => Ok(Self::Offline),
            "online" => Ok(Self::Online),
            "busy" => Ok(Self::Busy),
            _ => Err(format!("Unknown agent status: {}", s)),
        }
    }
}

// ============================================================================
// SESSION STATUS
// ============================================================================

/// Lifecycle state of a chat session.
///
/// The only legal transitions are `Queued -> Active`, `Active -> Active`
/// (transfer swaps the agent without leaving the state) and
/// `Queued | Active -> Closed`. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = SmallInt)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum SessionStatus {
    Queued = 0,
    Active = 1,
    Closed = 2,
}

impl SessionStatus {
    /// Single source of truth for the session state machine.
    pub fn can_transition(self, to: SessionStatus) -> bool {
        match (self, to) {
            (Self::Queued, Self::Active) => true,
            (Self::Active, Self::Active) => true,
            (Self::Queued, Self::Closed) | (Self::Active, Self::Closed) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::Queued
    }
}

impl ToSql<SmallInt, Pg> for SessionStatus {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        let v = *self as i16;
        out.write_all(&v.to_be_bytes())?;
        Ok(serialize::IsNull::No)
    }
}

impl FromSql<SmallInt, Pg> for SessionStatus {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        let value = i16::from_sql(bytes)?;
        match value {
            0 => Ok(Self::Queued),
            1 => Ok(Self::Active),
            2 => Ok(Self::Closed),
            _ => Err(format!("Unknown SessionStatus: {}", value).into()),
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Active => write!(f, "active"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(Self::Queued),
            "active" => Ok(Self::Active),
            "closed" => Ok(Self::Closed),
            _ => Err(format!("Unknown session status: {}", s)),
        }
    }
}

// ============================================================================
// CLOSE REASON
// ============================================================================

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = SmallInt)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum CloseReason {
    UserLeft = 0,
    AgentClosed = 1,
    Timeout = 2,
    Resolved = 3,
    Transferred = 4,
}

impl ToSql<SmallInt, Pg> for CloseReason {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        let v = *self as i16;
        out.write_all(&v.to_be_bytes())?;
        Ok(serialize::IsNull::No)
    }
}

impl FromSql<SmallInt, Pg> for CloseReason {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        let value = i16::from_sql(bytes)?;
        match value {
            0 => Ok(Self::UserLeft),
            1 => Ok(Self::AgentClosed),
            2 => Ok(Self::Timeout),
            3 => Ok(Self::Resolved),
            4 => Ok(Self::Transferred),
            _ => Err(format!("Unknown CloseReason: {}", value).into()),
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UserLeft => write!(f, "user_left"),
            Self::AgentClosed => write!(f, "agent_closed"),
            Self::Timeout => write!(f, "timeout"),
            Self::Resolved => write!(f, "resolved"),
            Self::Transferred => write!(f, "transferred"),
        }
    }
}

impl std::str::FromStr for CloseReason {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user_left" => Ok(Self::UserLeft),
            "agent_closed" => Ok(Self::AgentClosed),
            "timeout" => Ok(Self::Timeout),
            "resolved" => Ok(Self::Resolved),
            "transferred" => Ok(Self::Transferred),
            _ => Err(format!("Unknown close reason: {}", s)),
        }
    }
}

// ============================================================================
// SENDER TYPE
// ============================================================================

/// Author of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = SmallInt)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum SenderType {
    User = 0,
    Agent = 1,
    System = 2,
}

impl SenderType {
    /// Message authors a reading party considers "the other side".
    ///
    /// A user reads agent and system messages; an agent reads user messages.
    /// A party's own messages are never unread from its own perspective.
    pub fn counterparties(self) -> &'static [SenderType] {
        match self {
            Self::User => &[Self::Agent, Self::System],
            Self::Agent => &[Self::User],
            Self::System => &[],
        }
    }
}

impl ToSql<SmallInt, Pg> for SenderType {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        let v = *self as i16;
        out.write_all(&v.to_be_bytes())?;
        Ok(serialize::IsNull::No)
    }
}

impl FromSql<SmallInt, Pg> for SenderType {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        let value = i16::from_sql(bytes)?;
        match value {
            0 => Ok(Self::User),
            1 => Ok(Self::Agent),
            2 => Ok(Self::System),
            _ => Err(format!("Unknown SenderType: {}", value).into()),
        }
    }
}

impl std::fmt::Display for SenderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Agent => write!(f, "agent"),
            Self::System => write!(f, "system"),
        }
    }
}

impl std::str::FromStr for SenderType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(Self::User),
            "agent" => Ok(Self::Agent),
            "system" => Ok(Self::System),
            _ => Err(format!("Unknown sender type: {}", s)),
        }
    }
}

// ============================================================================
// MESSAGE TYPE
// ============================================================================

/// Type of message content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = SmallInt)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum MessageType {
    Text = 0,
    Image = 1,
    File = 2,
    Link = 3,
    QuickReply = 4,
    System = 5,
}

impl Default for MessageType {
    fn default() -> Self {
        Self::Text
    }
}

impl ToSql<SmallInt, Pg> for MessageType {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        let v = *self as i16;
        out.write_all(&v.to_be_bytes())?;
        Ok(serialize::IsNull::No)
    }
}

impl FromSql<SmallInt, Pg> for MessageType {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        let value = i16::from_sql(bytes)?;
        match value {
            0 => Ok(Self::Text),
            1 => Ok(Self::Image),
            2 => Ok(Self::File),
            3 => Ok(Self::Link),
            4 => Ok(Self::QuickReply),
            5 => Ok(Self::System),
            _ => Err(format!("Unknown MessageType: {}", value).into()),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Image => write!(f, "image"),
            Self::File => write!(f, "file"),
            Self::Link => write!(f, "link"),
            Self::QuickReply => write!(f, "quick_reply"),
            Self::System => write!(f, "system"),
        }
    }
}

impl std::str::FromStr for MessageType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "file" => Ok(Self::File),
            "link" => Ok(Self::Link),
            "quick_reply" | "quickreply" => Ok(Self::QuickReply),
            "system" => Ok(Self::System),
            _ => Err(format!("Unknown message type: {}", s)),
        }
    }
}

// ============================================================================
// CHANNEL
// ============================================================================

/// Client surface a session originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = SmallInt)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum Channel {
    Web = 0,
    Mobile = 1,
    App = 2,
}

impl Default for Channel {
    fn default() -> Self {
        Self::Web
    }
}

impl ToSql<SmallInt, Pg> for Channel {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        let v = *self as i16;
        out.write_all(&v.to_be_bytes())?;
        Ok(serialize::IsNull::No)
    }
}

impl FromSql<SmallInt, Pg> for Channel {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        let value = i16::from_sql(bytes)?;
        match value {
            0 => Ok(Self::Web),
            1 => Ok(Self::Mobile),
            2 => Ok(Self::App),
            _ => Err(format!("Unknown Channel: {}", value).into()),
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Web => write!(f, "web"),
            Self::Mobile => write!(f, "mobile"),
            Self::App => write!(f, "app"),
        }
    }
}

impl std::str::FromStr for Channel {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "web" => Ok(Self::Web),
            "mobile" => Ok(Self::Mobile),
            "app" => Ok(Self::App),
            _ => Err(format!("Unknown channel: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_transitions() {
        assert!(SessionStatus::Queued.can_transition(SessionStatus::Active));
        assert!(SessionStatus::Queued.can_transition(SessionStatus::Closed));
        assert!(SessionStatus::Active.can_transition(SessionStatus::Active));
        assert!(SessionStatus::Active.can_transition(SessionStatus::Closed));

        assert!(!SessionStatus::Queued.can_transition(SessionStatus::Queued));
        assert!(!SessionStatus::Active.can_transition(SessionStatus::Queued));
        assert!(!SessionStatus::Closed.can_transition(SessionStatus::Queued));
        assert!(!SessionStatus::Closed.can_transition(SessionStatus::Active));
        assert!(!SessionStatus::Closed.can_transition(SessionStatus::Closed));
        assert!(SessionStatus::Closed.is_terminal());
    }

    #[test]
    fn counterparties_are_asymmetric() {
        assert_eq!(
            SenderType::User.counterparties(),
            &[SenderType::Agent, SenderType::System]
        );
        assert_eq!(SenderType::Agent.counterparties(), &[SenderType::User]);
        assert!(SenderType::System.counterparties().is_empty());
    }

    #[test]
    fn enum_wire_names_round_trip() {
        for (reason, s) in [
            (CloseReason::UserLeft, "\"user_left\""),
            (CloseReason::AgentClosed, "\"agent_closed\""),
            (CloseReason::Timeout, "\"timeout\""),
            (CloseReason::Resolved, "\"resolved\""),
            (CloseReason::Transferred, "\"transferred\""),
        ] {
            assert_eq!(serde_json::to_string(&reason).unwrap(), s);
            assert_eq!(serde_json::from_str::<CloseReason>(s).unwrap(), reason);
        }
        assert_eq!(
            serde_json::to_string(&MessageType::QuickReply).unwrap(),
            "\"quick_reply\""
        );
        assert_eq!("busy".parse::<AgentStatus>().unwrap(), AgentStatus::Busy);
        assert_eq!("queued".parse::<SessionStatus>().unwrap(), SessionStatus::Queued);
    }
}
