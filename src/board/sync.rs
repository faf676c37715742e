//! Write-side half of the synchronization contract.
//!
//! * [`MutationTracker`] rejects a second submission of an action while the
//!   first is still in flight.
//! * [`Mutation::invalidates`] is the single table of which cached
//!   collections each write makes stale, cross-entity effects included.
//! * [`spawn_realtime_bridge`] feeds row-change events into the same
//!   invalidation path as local writes.
//! * [`spawn_stats_poller`] invalidates the aggregate stats on a timer.
//!
//! Background tasks are owned by a [`TaskHandle`] and stop when it drops.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::cache::{KeyPattern, QueryCache};
use super::models::{EntityTag, RowChange};
use crate::errors::{DashboardError, DashboardResult};

/// Default refresh cadence for derived dashboard aggregates.
pub const STATS_POLL_INTERVAL: Duration = Duration::from_secs(30);

// ── Mutations ────────────────────────────────────────────────────────

/// Every write the dashboard can issue.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    CreateColumn,
    UpdateColumn { column_id: i64 },
    DeleteColumn { column_id: i64 },
    CreateLead,
    UpdateLead { lead_id: i64 },
    MoveLead { lead_id: i64 },
    DeleteLead { lead_id: i64 },
    CreateLeadFromConversation { conversation_id: i64 },
    ConvertLeadsToContacts,
    DeleteContact { contact_id: i64 },
    SendMessage { conversation_id: i64 },
    MarkConversationRead { conversation_id: i64 },
    CreateConnection { instance: String },
    DeleteConnection { instance: String },
    GenerateQrCode { instance: String },
}

impl Mutation {
    /// Name of the action and its target, without the submitting user.
    pub fn action_key(&self) -> String {
        match self {
            Self::CreateColumn => "create_column".into(),
            Self::UpdateColumn { column_id } => format!("update_column:{}", column_id),
            Self::DeleteColumn { column_id } => format!("delete_column:{}", column_id),
            Self::CreateLead => "create_lead".into(),
            Self::UpdateLead { lead_id } => format!("update_lead:{}", lead_id),
            Self::MoveLead { lead_id } => format!("move_lead:{}", lead_id),
            Self::DeleteLead { lead_id } => format!("delete_lead:{}", lead_id),
            Self::CreateLeadFromConversation { conversation_id } => {
                format!("create_lead_from_conversation:{}", conversation_id)
            }
            Self::ConvertLeadsToContacts => "convert_leads_to_contacts".into(),
            Self::DeleteContact { contact_id } => format!("delete_contact:{}", contact_id),
            Self::SendMessage { conversation_id } => format!("send_message:{}", conversation_id),
            Self::MarkConversationRead { conversation_id } => {
                format!("mark_conversation_read:{}", conversation_id)
            }
            Self::CreateConnection { instance } => format!("create_connection:{}", instance),
            Self::DeleteConnection { instance } => format!("delete_connection:{}", instance),
            Self::GenerateQrCode { instance } => format!("generate_qr:{}", instance),
        }
    }

    /// Identity used for in-flight exclusion: the same action by the same
    /// user cannot overlap. Other users never contend.
    pub fn in_flight_key(&self, scope: &str) -> String {
        format!("{}:{}", scope, self.action_key())
    }

    /// Collections made stale by a successful write.
    pub fn invalidates(&self) -> Vec<KeyPattern> {
        use EntityTag::*;
        match self {
            Self::CreateColumn | Self::UpdateColumn { .. } => vec![KeyPattern::tag(LeadColumns)],
            // Leads of a deleted column are reassigned.
            Self::DeleteColumn { .. } => {
                vec![KeyPattern::tag(LeadColumns), KeyPattern::tag(Leads)]
            }
            Self::CreateLead
            | Self::UpdateLead { .. }
            | Self::MoveLead { .. }
            | Self::DeleteLead { .. }
            | Self::CreateLeadFromConversation { .. } => vec![KeyPattern::tag(Leads)],
            Self::ConvertLeadsToContacts => vec![
                KeyPattern::tag(Contacts),
                KeyPattern::tag(ContactLists),
                KeyPattern::tag(ContactListMembers),
            ],
            Self::DeleteContact { .. } => {
                vec![KeyPattern::tag(Contacts), KeyPattern::tag(ContactListMembers)]
            }
            Self::SendMessage { conversation_id } => vec![
                KeyPattern::child(Messages, *conversation_id),
                KeyPattern::tag(Conversations),
            ],
            Self::MarkConversationRead { .. } => vec![KeyPattern::tag(Conversations)],
            Self::CreateConnection { .. }
            | Self::DeleteConnection { .. }
            | Self::GenerateQrCode { .. } => vec![KeyPattern::tag(Connections)],
        }
    }

    /// Whether a failed write should still refetch. Only a drag-reorder
    /// does: the board may already show the card in its new slot, and the
    /// refetch snaps it back.
    pub fn refetch_on_failure(&self) -> bool {
        matches!(self, Self::MoveLead { .. })
    }

    pub fn success_message(&self) -> &'static str {
        match self {
            Self::CreateColumn => "Column created",
            Self::UpdateColumn { .. } => "Column updated",
            Self::DeleteColumn { .. } => "Column deleted",
            Self::CreateLead => "Lead created",
            Self::UpdateLead { .. } => "Lead updated",
            Self::MoveLead { .. } => "Lead moved",
            Self::DeleteLead { .. } => "Lead deleted",
            Self::CreateLeadFromConversation { .. } => "Lead created from conversation",
            Self::ConvertLeadsToContacts => "Leads converted to contacts",
            Self::DeleteContact { .. } => "Contact deleted",
            Self::SendMessage { .. } => "Message queued",
            Self::MarkConversationRead { .. } => "Conversation marked as read",
            Self::CreateConnection { .. } => "Connection requested",
            Self::DeleteConnection { .. } => "Connection removal requested",
            Self::GenerateQrCode { .. } => "QR code requested",
        }
    }
}

// ── In-flight exclusion ──────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct MutationTracker {
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl MutationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `action`. Fails with `MutationInFlight` if it is already held.
    pub fn begin(&self, action: impl Into<String>) -> DashboardResult<InFlight> {
        let action = action.into();
        let mut held = self
            .in_flight
            .lock()
            .map_err(|e| DashboardError::Other(anyhow::anyhow!("Tracker lock poisoned: {}", e)))?;
        if !held.insert(action.clone()) {
            return Err(DashboardError::MutationInFlight(action));
        }
        Ok(InFlight {
            action,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    pub fn is_in_flight(&self, action: &str) -> bool {
        self.in_flight
            .lock()
            .map(|held| held.contains(action))
            .unwrap_or(false)
    }
}

/// Releases its action when dropped.
pub struct InFlight {
    action: String,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl InFlight {
    pub fn action(&self) -> &str {
        &self.action
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Ok(mut held) = self.in_flight.lock() {
            held.remove(&self.action);
        }
    }
}

// ── Notifications ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Success,
    Error,
}

/// A transient toast-style message produced by a mutation outcome.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub level: NoticeLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Pending notifications, one queue per principal.
#[derive(Clone, Default)]
pub struct Notifications {
    log: Arc<Mutex<HashMap<String, Vec<Notification>>>>,
}

impl Notifications {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn success(&self, scope: &str, message: impl Into<String>) {
        self.push(scope, NoticeLevel::Success, message.into());
    }

    /// Access-denied errors are reported generically; everything else
    /// verbatim.
    pub fn error(&self, scope: &str, err: &DashboardError) {
        let message = match err {
            DashboardError::AccessDenied => "You do not have access to this record".to_string(),
            other => other.to_string(),
        };
        self.push(scope, NoticeLevel::Error, message);
    }

    fn push(&self, scope: &str, level: NoticeLevel, message: String) {
        if let Ok(mut log) = self.log.lock() {
            log.entry(scope.to_string()).or_default().push(Notification {
                level,
                message,
                at: Utc::now(),
            });
        }
    }

    /// Take all pending notifications for `scope`.
    pub fn drain(&self, scope: &str) -> Vec<Notification> {
        self.log
            .lock()
            .ok()
            .and_then(|mut log| log.remove(scope))
            .unwrap_or_default()
    }
}

// ── Background tasks ─────────────────────────────────────────────────

/// Owns a background task; aborts it on drop.
pub struct TaskHandle {
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Collections invalidated by a row change on the realtime feed.
pub fn invalidations_for_change(change: &RowChange) -> Vec<KeyPattern> {
    match (change.table, change.parent_id) {
        (EntityTag::Messages, Some(conversation_id)) => vec![
            KeyPattern::child(EntityTag::Messages, conversation_id),
            KeyPattern::tag(EntityTag::Conversations),
        ],
        (EntityTag::Messages, None) => vec![
            KeyPattern::tag(EntityTag::Messages),
            KeyPattern::tag(EntityTag::Conversations),
        ],
        (tag, _) => vec![KeyPattern::tag(tag)],
    }
}

/// Forward realtime row changes for `tables` into cache invalidation.
pub fn spawn_realtime_bridge(
    cache: Arc<QueryCache>,
    mut rx: broadcast::Receiver<RowChange>,
    tables: Vec<EntityTag>,
) -> TaskHandle {
    let handle = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(change) => {
                    if !tables.contains(&change.table) {
                        continue;
                    }
                    let patterns = invalidations_for_change(&change);
                    cache.invalidate(&change.user_id, &patterns);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // Missed events could touch anything we follow.
                    tracing::warn!(missed, "realtime bridge lagged; invalidating followed tables");
                    let patterns: Vec<KeyPattern> =
                        tables.iter().map(|t| KeyPattern::tag(*t)).collect();
                    cache.invalidate_all_scopes(&patterns);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    TaskHandle { handle }
}

/// Invalidate `scope`'s dashboard stats every `every`.
pub fn spawn_stats_poller(cache: Arc<QueryCache>, scope: String, every: Duration) -> TaskHandle {
    let handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // The first tick completes immediately; the initial read already
        // fetched fresh stats.
        interval.tick().await;
        loop {
            interval.tick().await;
            cache.invalidate(&scope, &[KeyPattern::tag(EntityTag::DashboardStats)]);
        }
    });
    TaskHandle { handle }
}
