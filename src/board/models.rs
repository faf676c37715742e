use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The authenticated owner every read and write is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: String,
}

impl Principal {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.user_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeadColumn {
    pub id: i64,
    pub name: String,
    pub color: String,
    pub position: i32,
    pub is_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lead {
    pub id: i64,
    pub column_id: i64,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub company: Option<String>,
    pub value: Option<f64>,
    pub notes: Option<String>,
    pub position: f64,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields accepted when creating or editing a lead. `None` leaves a field
/// unchanged on update.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LeadInput {
    #[serde(default)]
    pub column_id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Contact {
    pub id: i64,
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContactList {
    pub id: i64,
    pub name: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContactListMember {
    pub list_id: i64,
    pub contact_id: i64,
}

/// Outcome of converting a batch of leads into a fresh contact list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversionReport {
    pub list: ContactList,
    pub contacts_created: usize,
    pub members_created: usize,
    pub skipped_without_phone: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: i64,
    pub contact_phone: String,
    pub contact_name: Option<String>,
    pub last_message_at: Option<String>,
    pub unread_count: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

impl MessageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

impl FromStr for MessageDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Self::Inbound),
            "outbound" => Ok(Self::Outbound),
            _ => Err(format!("Invalid message direction: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: i64,
    pub conversation_id: i64,
    pub direction: MessageDirection,
    pub body: String,
    pub media_url: Option<String>,
    pub status: String,
    pub created_at: String,
}

/// An operator-registered automation endpoint, looked up by name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookEndpoint {
    pub name: String,
    pub url: String,
}

/// Aggregates shown on the dashboard landing view. Refreshed by polling.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DashboardStats {
    pub leads: i64,
    pub contacts: i64,
    pub conversations: i64,
    pub unread_messages: i64,
    pub messages_sent: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    #[default]
    Free,
    Starter,
    Pro,
    Enterprise,
}

impl FromStr for PlanTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "starter" => Ok(Self::Starter),
            "pro" => Ok(Self::Pro),
            "enterprise" => Ok(Self::Enterprise),
            _ => Err(format!("Invalid plan tier: {}", s)),
        }
    }
}

/// Plan limits and usage. Decoded from a loosely-shaped payload via
/// [`PlanUsage::from_value`]; absent or malformed fields fall back to the
/// free tier defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanUsage {
    pub plan: PlanTier,
    pub messages_used: i64,
    pub messages_limit: i64,
    pub connections_used: i64,
    pub connections_limit: i64,
}

impl Default for PlanUsage {
    fn default() -> Self {
        Self {
            plan: PlanTier::Free,
            messages_used: 0,
            messages_limit: 1000,
            connections_used: 0,
            connections_limit: 1,
        }
    }
}

impl PlanUsage {
    pub fn from_value(value: &serde_json::Value) -> Self {
        let defaults = Self::default();
        let int = |key: &str, fallback: i64| {
            value
                .get(key)
                .and_then(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
                .unwrap_or(fallback)
        };
        Self {
            plan: value
                .get("plan")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.plan),
            messages_used: int("messages_used", defaults.messages_used),
            messages_limit: int("messages_limit", defaults.messages_limit),
            connections_used: int("connections_used", defaults.connections_used),
            connections_limit: int("connections_limit", defaults.connections_limit),
        }
    }

    pub fn messages_remaining(&self) -> i64 {
        (self.messages_limit - self.messages_used).max(0)
    }
}

/// Every list-shaped collection the dashboard caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityTag {
    Connections,
    Contacts,
    ContactLists,
    ContactListMembers,
    Leads,
    LeadColumns,
    Campaigns,
    Bots,
    Conversations,
    Messages,
    ApiKeys,
    ScheduledMessages,
    QuickReplies,
    DashboardStats,
}

impl EntityTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connections => "connections",
            Self::Contacts => "contacts",
            Self::ContactLists => "contact_lists",
            Self::ContactListMembers => "contact_list_members",
            Self::Leads => "leads",
            Self::LeadColumns => "lead_columns",
            Self::Campaigns => "campaigns",
            Self::Bots => "bots",
            Self::Conversations => "conversations",
            Self::Messages => "messages",
            Self::ApiKeys => "api_keys",
            Self::ScheduledMessages => "scheduled_messages",
            Self::QuickReplies => "quick_replies",
            Self::DashboardStats => "dashboard_stats",
        }
    }
}

impl std::fmt::Display for EntityTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connections" => Ok(Self::Connections),
            "contacts" => Ok(Self::Contacts),
            "contact_lists" => Ok(Self::ContactLists),
            "contact_list_members" => Ok(Self::ContactListMembers),
            "leads" => Ok(Self::Leads),
            "lead_columns" => Ok(Self::LeadColumns),
            "campaigns" => Ok(Self::Campaigns),
            "bots" => Ok(Self::Bots),
            "conversations" => Ok(Self::Conversations),
            "messages" => Ok(Self::Messages),
            "api_keys" => Ok(Self::ApiKeys),
            "scheduled_messages" => Ok(Self::ScheduledMessages),
            "quick_replies" => Ok(Self::QuickReplies),
            "dashboard_stats" => Ok(Self::DashboardStats),
            _ => Err(format!("Invalid entity tag: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A row-level change notification, as emitted on the realtime feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RowChange {
    pub table: EntityTag,
    pub kind: ChangeKind,
    pub id: i64,
    pub user_id: String,
    /// Parent row for child tables (the conversation of a message).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<i64>,
}

// API view types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardView {
    pub columns: Vec<ColumnView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnView {
    pub column: LeadColumn,
    pub leads: Vec<Lead>,
}
