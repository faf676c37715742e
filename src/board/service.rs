//! `LeadBoard`: the dashboard's data-access layer.
//!
//! Reads go through the injected [`QueryCache`]; writes go to a
//! [`DataStore`] (and automation webhooks), then invalidate whatever the
//! write made stale. Every write runs under the [`MutationTracker`] and
//! leaves a [`Notification`](super::sync::Notification) behind.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use super::cache::{QueryCache, QueryKey};
use super::models::*;
use super::position::{self, Placement};
use super::store::DataStore;
use super::sync::{Mutation, MutationTracker, Notifications, TaskHandle, spawn_realtime_bridge};
use super::uploads::{Attachment, UploadPolicy};
use super::webhooks::{WebhookAction, WebhookClient, WebhookPayload, require_endpoint};
use crate::errors::{DashboardError, DashboardResult};

/// Tunables for [`LeadBoard`].
#[derive(Debug, Clone)]
pub struct BoardSettings {
    pub min_position_gap: f64,
    pub uploads: UploadPolicy,
    /// Public prefix under which uploaded objects are served.
    pub media_base_url: String,
}

impl Default for BoardSettings {
    fn default() -> Self {
        Self {
            min_position_gap: position::DEFAULT_MIN_GAP,
            uploads: UploadPolicy::default(),
            media_base_url: "http://127.0.0.1:3141/media".to_string(),
        }
    }
}

/// An outgoing WhatsApp message as composed in the inbox.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub instance: String,
    pub conversation_id: i64,
    pub body: String,
    pub attachment: Option<Attachment>,
}

pub struct LeadBoard {
    store: Arc<dyn DataStore>,
    cache: Arc<QueryCache>,
    webhooks: WebhookClient,
    tracker: MutationTracker,
    notifications: Notifications,
    settings: BoardSettings,
    refresh_tokens: Mutex<HashMap<(String, EntityTag), u64>>,
}

impl LeadBoard {
    pub fn new(
        store: Arc<dyn DataStore>,
        cache: Arc<QueryCache>,
        webhooks: WebhookClient,
        settings: BoardSettings,
    ) -> Self {
        Self {
            store,
            cache,
            webhooks,
            tracker: MutationTracker::new(),
            notifications: Notifications::new(),
            settings,
            refresh_tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    pub fn notifications(&self) -> &Notifications {
        &self.notifications
    }

    pub fn tracker(&self) -> &MutationTracker {
        &self.tracker
    }

    // ── Keys & refresh ────────────────────────────────────────────────

    fn refresh_token(&self, user: &Principal, tag: EntityTag) -> u64 {
        self.refresh_tokens
            .lock()
            .ok()
            .and_then(|tokens| tokens.get(&(user.user_id.clone(), tag)).copied())
            .unwrap_or(0)
    }

    pub fn key(&self, user: &Principal, tag: EntityTag) -> QueryKey {
        QueryKey::new(tag, user.user_id.clone()).with_refresh(self.refresh_token(user, tag))
    }

    /// Manual refresh: the next read of `tag` uses a new key, so it fetches
    /// regardless of cache state.
    pub fn refresh(&self, user: &Principal, tag: EntityTag) -> u64 {
        let next = match self.refresh_tokens.lock() {
            Ok(mut tokens) => {
                let token = tokens.entry((user.user_id.clone(), tag)).or_insert(0);
                *token += 1;
                *token
            }
            Err(_) => return self.refresh_token(user, tag),
        };
        self.cache.evict_older_refresh(&user.user_id, tag, next);
        next
    }

    // ── Reads ─────────────────────────────────────────────────────────

    pub async fn columns(&self, user: &Principal) -> DashboardResult<Vec<LeadColumn>> {
        let key = self.key(user, EntityTag::LeadColumns);
        self.cache
            .fetch(&key, || async {
                let mut columns = self.store.list_columns(user).await?;
                columns.sort_by_key(|c| (c.position, c.id));
                Ok(columns)
            })
            .await
    }

    /// All leads in board order.
    pub async fn leads(&self, user: &Principal) -> DashboardResult<Vec<Lead>> {
        let key = self.key(user, EntityTag::Leads);
        self.cache
            .fetch(&key, || async {
                let mut leads = self.store.list_leads(user).await?;
                position::sort_leads(&mut leads);
                Ok(leads)
            })
            .await
    }

    pub async fn board(&self, user: &Principal) -> DashboardResult<BoardView> {
        let columns = self.columns(user).await?;
        let leads = self.leads(user).await?;
        Ok(BoardView {
            columns: columns
                .into_iter()
                .map(|column| ColumnView {
                    leads: leads
                        .iter()
                        .filter(|l| l.column_id == column.id)
                        .cloned()
                        .collect(),
                    column,
                })
                .collect(),
        })
    }

    pub async fn contacts(&self, user: &Principal) -> DashboardResult<Vec<Contact>> {
        let key = self.key(user, EntityTag::Contacts);
        self.cache
            .fetch(&key, || self.store.list_contacts(user))
            .await
    }

    pub async fn contact_lists(&self, user: &Principal) -> DashboardResult<Vec<ContactList>> {
        let key = self.key(user, EntityTag::ContactLists);
        self.cache
            .fetch(&key, || self.store.list_contact_lists(user))
            .await
    }

    pub async fn list_members(
        &self,
        user: &Principal,
        list_id: i64,
    ) -> DashboardResult<Vec<ContactListMember>> {
        let key = self.key(user, EntityTag::ContactListMembers).with_parent(list_id);
        self.cache
            .fetch(&key, || self.store.list_members(user, list_id))
            .await
    }

    pub async fn conversations(&self, user: &Principal) -> DashboardResult<Vec<Conversation>> {
        let key = self.key(user, EntityTag::Conversations);
        self.cache
            .fetch(&key, || self.store.list_conversations(user))
            .await
    }

    pub async fn messages(
        &self,
        user: &Principal,
        conversation_id: i64,
    ) -> DashboardResult<Vec<Message>> {
        let key = self.key(user, EntityTag::Messages).with_parent(conversation_id);
        self.cache
            .fetch(&key, || self.store.list_messages(user, conversation_id))
            .await
    }

    pub async fn stats(&self, user: &Principal) -> DashboardResult<DashboardStats> {
        let key = self.key(user, EntityTag::DashboardStats);
        self.cache.fetch(&key, || self.store.stats(user)).await
    }

    pub async fn plan_usage(&self, user: &Principal) -> DashboardResult<PlanUsage> {
        // Plan usage rides along with the aggregate stats refresh.
        let key = self.key(user, EntityTag::DashboardStats).with_parent(0);
        self.cache.fetch(&key, || self.store.plan_usage(user)).await
    }

    /// Apply realtime row changes for `tables` to this board's cache, the
    /// same way local writes are applied.
    pub fn follow_realtime(
        &self,
        changes: broadcast::Receiver<RowChange>,
        tables: Vec<EntityTag>,
    ) -> TaskHandle {
        spawn_realtime_bridge(Arc::clone(&self.cache), changes, tables)
    }

    // ── Write plumbing ────────────────────────────────────────────────

    async fn mutate<T, Fut>(
        &self,
        user: &Principal,
        mutation: Mutation,
        write: Fut,
    ) -> DashboardResult<T>
    where
        Fut: Future<Output = DashboardResult<T>>,
    {
        // A rejected duplicate is silent: the first submission will report.
        let _in_flight = self.tracker.begin(mutation.in_flight_key(&user.user_id))?;

        match write.await {
            Ok(value) => {
                self.cache.invalidate(&user.user_id, &mutation.invalidates());
                self.notifications
                    .success(&user.user_id, mutation.success_message());
                Ok(value)
            }
            Err(e) => {
                if e.is_client_side() {
                    tracing::debug!(action = %mutation.action_key(), user = %user, error = %e, "mutation refused");
                } else {
                    tracing::warn!(action = %mutation.action_key(), user = %user, error = %e, "mutation failed");
                }
                if mutation.refetch_on_failure() {
                    self.cache.invalidate(&user.user_id, &mutation.invalidates());
                }
                self.notifications.error(&user.user_id, &e);
                Err(e)
            }
        }
    }

    async fn webhook(
        &self,
        action: WebhookAction,
        payload: &WebhookPayload,
    ) -> DashboardResult<serde_json::Value> {
        let endpoint = require_endpoint(action, self.store.get_webhook(action.registry_name()).await?)?;
        self.webhooks.post(&endpoint, payload).await
    }

    // ── Columns ───────────────────────────────────────────────────────

    pub async fn create_column(
        &self,
        user: &Principal,
        name: &str,
        color: &str,
    ) -> DashboardResult<LeadColumn> {
        self.mutate(user, Mutation::CreateColumn, async {
            let name = non_blank(name, "Column name is required")?;
            self.store.create_column(user, name, color.trim()).await
        })
        .await
    }

    pub async fn update_column(
        &self,
        user: &Principal,
        column_id: i64,
        name: Option<&str>,
        color: Option<&str>,
        position: Option<i32>,
    ) -> DashboardResult<LeadColumn> {
        self.mutate(user, Mutation::UpdateColumn { column_id }, async {
            let name = match name {
                Some(n) => Some(non_blank(n, "Column name cannot be blank")?.to_string()),
                None => None,
            };
            self.store
                .update_column(user, column_id, name, color.map(str::to_string), position)
                .await
        })
        .await
    }

    /// Delete a column. The default column is refused here, before any write
    /// reaches the store. Cached columns are enough to tell; the store is
    /// read only when nothing is cached yet.
    pub async fn delete_column(&self, user: &Principal, column_id: i64) -> DashboardResult<usize> {
        let cached = self
            .cache
            .peek::<Vec<LeadColumn>>(&self.key(user, EntityTag::LeadColumns));
        let columns = match cached {
            Some(columns) => columns,
            None => self.columns(user).await?,
        };
        self.mutate(user, Mutation::DeleteColumn { column_id }, async {
            if columns
                .iter()
                .any(|c| c.id == column_id && c.is_default)
            {
                return Err(DashboardError::DefaultColumnProtected);
            }
            self.store.delete_column(user, column_id).await
        })
        .await
    }

    // ── Leads ─────────────────────────────────────────────────────────

    pub async fn create_lead(&self, user: &Principal, input: LeadInput) -> DashboardResult<Lead> {
        self.mutate(user, Mutation::CreateLead, async {
            validate_lead_input(&input, true)?;
            self.store.create_lead(user, &input).await
        })
        .await
    }

    pub async fn update_lead(
        &self,
        user: &Principal,
        lead_id: i64,
        input: LeadInput,
    ) -> DashboardResult<Lead> {
        self.mutate(user, Mutation::UpdateLead { lead_id }, async {
            validate_lead_input(&input, false)?;
            self.store.update_lead(user, lead_id, &input).await
        })
        .await
    }

    pub async fn delete_lead(&self, user: &Principal, lead_id: i64) -> DashboardResult<()> {
        self.mutate(user, Mutation::DeleteLead { lead_id }, async {
            self.store.delete_lead(user, lead_id).await
        })
        .await
    }

    /// Drag-and-drop reorder. `dest_index` counts positions in the
    /// destination column with the dragged lead removed.
    pub async fn move_lead(
        &self,
        user: &Principal,
        lead_id: i64,
        dest_column_id: i64,
        dest_index: usize,
    ) -> DashboardResult<Lead> {
        let leads = self.leads(user).await?;
        self.mutate(user, Mutation::MoveLead { lead_id }, async {
            if !leads.iter().any(|l| l.id == lead_id) {
                return Err(DashboardError::not_found("Lead", lead_id));
            }
            let siblings: Vec<f64> = leads
                .iter()
                .filter(|l| l.column_id == dest_column_id && l.id != lead_id)
                .map(|l| l.position)
                .collect();

            let position =
                match position::plan_drop(&siblings, dest_index, self.settings.min_position_gap) {
                    Placement::At(p) => p,
                    Placement::Renormalize => {
                        tracing::info!(column_id = dest_column_id, "position gap exhausted; renormalizing column");
                        let renormalized: Vec<f64> = self
                            .store
                            .renormalize_column(user, dest_column_id)
                            .await?
                            .iter()
                            .filter(|l| l.id != lead_id)
                            .map(|l| l.position)
                            .collect();
                        position::position_for_drop(&renormalized, dest_index)
                    }
                };
            self.store
                .move_lead(user, lead_id, dest_column_id, position)
                .await
        })
        .await
    }

    pub async fn create_lead_from_conversation(
        &self,
        user: &Principal,
        conversation_id: i64,
        column_id: Option<i64>,
    ) -> DashboardResult<Lead> {
        self.mutate(
            user,
            Mutation::CreateLeadFromConversation { conversation_id },
            self.store
                .create_lead_from_conversation(user, conversation_id, column_id),
        )
        .await
    }

    pub async fn convert_leads_to_contacts(
        &self,
        user: &Principal,
        lead_ids: &[i64],
        list_name: &str,
    ) -> DashboardResult<ConversionReport> {
        self.mutate(user, Mutation::ConvertLeadsToContacts, async {
            if lead_ids.is_empty() {
                return Err(DashboardError::Validation("Select at least one lead".into()));
            }
            let list_name = non_blank(list_name, "List name is required")?;
            let report = self
                .store
                .convert_leads_to_contacts(user, lead_ids, list_name)
                .await?;
            tracing::info!(
                user = %user,
                list_id = report.list.id,
                contacts = report.contacts_created,
                skipped = report.skipped_without_phone,
                "converted leads to contacts"
            );
            Ok(report)
        })
        .await
    }

    // ── Contacts ──────────────────────────────────────────────────────

    pub async fn delete_contact(&self, user: &Principal, contact_id: i64) -> DashboardResult<()> {
        self.mutate(
            user,
            Mutation::DeleteContact { contact_id },
            self.store.delete_contact(user, contact_id),
        )
        .await
    }

    // ── Inbox ─────────────────────────────────────────────────────────

    /// Validate, relay through the `send_message` webhook, then record the
    /// outbound message.
    pub async fn send_message(
        &self,
        user: &Principal,
        outgoing: OutgoingMessage,
    ) -> DashboardResult<Message> {
        let conversation_id = outgoing.conversation_id;
        self.mutate(user, Mutation::SendMessage { conversation_id }, async {
            let body = outgoing.body.trim();
            if body.is_empty() && outgoing.attachment.is_none() {
                return Err(DashboardError::Validation(
                    "Message needs text or an attachment".into(),
                ));
            }
            let instance = non_blank(&outgoing.instance, "Choose a connection to send from")?;
            let media = outgoing
                .attachment
                .as_ref()
                .map(|a| self.settings.uploads.validate(user, a))
                .transpose()?;

            let conversation = self.store.get_conversation(user, conversation_id).await?;
            let media_url = media.as_ref().map(|m| {
                format!(
                    "{}/{}",
                    self.settings.media_base_url.trim_end_matches('/'),
                    m.object_path
                )
            });
            let payload = WebhookPayload {
                phone_number: Some(conversation.contact_phone.clone()),
                message: (!body.is_empty()).then(|| body.to_string()),
                media_url: media_url.clone(),
                media_type: media.as_ref().map(|m| m.kind.as_str().to_string()),
                file_name: media.as_ref().map(|m| m.file_name.clone()),
                ..WebhookPayload::for_instance(instance)
            };
            self.webhook(WebhookAction::SendMessage, &payload).await?;

            self.store
                .record_message(
                    user,
                    conversation_id,
                    MessageDirection::Outbound,
                    body,
                    media_url,
                    "sent",
                )
                .await
        })
        .await
    }

    pub async fn mark_conversation_read(
        &self,
        user: &Principal,
        conversation_id: i64,
    ) -> DashboardResult<Conversation> {
        self.mutate(
            user,
            Mutation::MarkConversationRead { conversation_id },
            self.store.mark_conversation_read(user, conversation_id),
        )
        .await
    }

    // ── Connections ───────────────────────────────────────────────────

    pub async fn create_connection(
        &self,
        user: &Principal,
        instance: &str,
    ) -> DashboardResult<serde_json::Value> {
        self.connection_action(user, ConnectionOp::Create, instance)
            .await
    }

    pub async fn delete_connection(
        &self,
        user: &Principal,
        instance: &str,
    ) -> DashboardResult<serde_json::Value> {
        self.connection_action(user, ConnectionOp::Delete, instance)
            .await
    }

    /// Ask the automation layer for a pairing QR code. The reply is passed
    /// through as-is.
    pub async fn generate_qr_code(
        &self,
        user: &Principal,
        instance: &str,
    ) -> DashboardResult<serde_json::Value> {
        self.connection_action(user, ConnectionOp::GenerateQr, instance)
            .await
    }

    async fn connection_action(
        &self,
        user: &Principal,
        op: ConnectionOp,
        instance: &str,
    ) -> DashboardResult<serde_json::Value> {
        let instance = instance.trim().to_string();
        self.mutate(user, op.mutation(instance.clone()), async {
            let instance = non_blank(&instance, "Connection name is required")?;
            self.webhook(op.webhook(), &WebhookPayload::for_instance(instance))
                .await
        })
        .await
    }
}

/// WhatsApp connection lifecycle actions relayed to automation.
#[derive(Debug, Clone, Copy)]
enum ConnectionOp {
    Create,
    Delete,
    GenerateQr,
}

impl ConnectionOp {
    fn webhook(self) -> WebhookAction {
        match self {
            Self::Create => WebhookAction::CreateInstance,
            Self::Delete => WebhookAction::DeleteInstance,
            Self::GenerateQr => WebhookAction::GenerateQr,
        }
    }

    fn mutation(self, instance: String) -> Mutation {
        match self {
            Self::Create => Mutation::CreateConnection { instance },
            Self::Delete => Mutation::DeleteConnection { instance },
            Self::GenerateQr => Mutation::GenerateQrCode { instance },
        }
    }
}

fn non_blank<'a>(value: &'a str, message: &str) -> DashboardResult<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(DashboardError::Validation(message.to_string()))
    } else {
        Ok(trimmed)
    }
}

fn validate_lead_input(input: &LeadInput, creating: bool) -> DashboardResult<()> {
    match input.name.as_deref() {
        Some(name) if name.trim().is_empty() => {
            return Err(DashboardError::Validation("Lead name cannot be blank".into()));
        }
        None if creating => {
            return Err(DashboardError::Validation("Lead name is required".into()));
        }
        _ => {}
    }
    if let Some(value) = input.value
        && (!value.is_finite() || value < 0.0)
    {
        return Err(DashboardError::Validation(
            "Lead value must be a non-negative number".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use axum::http::StatusCode;
    use tokio::sync::Notify;

    use super::*;
    use crate::board::cache::{KeyPattern, QueryState};
    use crate::board::db::{BoardDb, DbHandle};
    use crate::board::store::LocalStore;
    use crate::board::sync::NoticeLevel;
    use crate::board::webhooks::DEFAULT_WEBHOOK_TIMEOUT;
    use crate::board::webhooks::test_support::spawn_endpoint;

    /// Wraps a real store, counting writes and optionally holding or
    /// failing them.
    struct CountingStore {
        inner: LocalStore,
        writes: AtomicUsize,
        reads: AtomicUsize,
        gate: Option<Arc<Notify>>,
        fail_writes: bool,
    }

    impl CountingStore {
        fn new(inner: LocalStore) -> Self {
            Self {
                inner,
                writes: AtomicUsize::new(0),
                reads: AtomicUsize::new(0),
                gate: None,
                fail_writes: false,
            }
        }

        async fn write(&self) -> DashboardResult<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail_writes {
                return Err(DashboardError::WriteRejected {
                    status: 500,
                    message: "store unavailable".into(),
                });
            }
            Ok(())
        }

        fn read(&self) {
            self.reads.fetch_add(1, Ordering::SeqCst);
        }

        fn writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }

        fn reads(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DataStore for CountingStore {
        async fn list_columns(&self, user: &Principal) -> DashboardResult<Vec<LeadColumn>> {
            self.read();
            self.inner.list_columns(user).await
        }
        async fn create_column(
            &self,
            user: &Principal,
            name: &str,
            color: &str,
        ) -> DashboardResult<LeadColumn> {
            self.write().await?;
            self.inner.create_column(user, name, color).await
        }
        async fn update_column(
            &self,
            user: &Principal,
            id: i64,
            name: Option<String>,
            color: Option<String>,
            position: Option<i32>,
        ) -> DashboardResult<LeadColumn> {
            self.write().await?;
            self.inner.update_column(user, id, name, color, position).await
        }
        async fn delete_column(&self, user: &Principal, id: i64) -> DashboardResult<usize> {
            self.write().await?;
            self.inner.delete_column(user, id).await
        }
        async fn list_leads(&self, user: &Principal) -> DashboardResult<Vec<Lead>> {
            self.read();
            self.inner.list_leads(user).await
        }
        async fn create_lead(&self, user: &Principal, input: &LeadInput) -> DashboardResult<Lead> {
            self.write().await?;
            self.inner.create_lead(user, input).await
        }
        async fn update_lead(
            &self,
            user: &Principal,
            id: i64,
            input: &LeadInput,
        ) -> DashboardResult<Lead> {
            self.write().await?;
            self.inner.update_lead(user, id, input).await
        }
        async fn move_lead(
            &self,
            user: &Principal,
            id: i64,
            column_id: i64,
            position: f64,
        ) -> DashboardResult<Lead> {
            self.write().await?;
            self.inner.move_lead(user, id, column_id, position).await
        }
        async fn renormalize_column(
            &self,
            user: &Principal,
            column_id: i64,
        ) -> DashboardResult<Vec<Lead>> {
            self.write().await?;
            self.inner.renormalize_column(user, column_id).await
        }
        async fn delete_lead(&self, user: &Principal, id: i64) -> DashboardResult<()> {
            self.write().await?;
            self.inner.delete_lead(user, id).await
        }
        async fn create_lead_from_conversation(
            &self,
            user: &Principal,
            conversation_id: i64,
            column_id: Option<i64>,
        ) -> DashboardResult<Lead> {
            self.write().await?;
            self.inner
                .create_lead_from_conversation(user, conversation_id, column_id)
                .await
        }
        async fn convert_leads_to_contacts(
            &self,
            user: &Principal,
            lead_ids: &[i64],
            list_name: &str,
        ) -> DashboardResult<ConversionReport> {
            self.write().await?;
            self.inner
                .convert_leads_to_contacts(user, lead_ids, list_name)
                .await
        }
        async fn list_contacts(&self, user: &Principal) -> DashboardResult<Vec<Contact>> {
            self.read();
            self.inner.list_contacts(user).await
        }
        async fn delete_contact(&self, user: &Principal, id: i64) -> DashboardResult<()> {
            self.write().await?;
            self.inner.delete_contact(user, id).await
        }
        async fn list_contact_lists(&self, user: &Principal) -> DashboardResult<Vec<ContactList>> {
            self.read();
            self.inner.list_contact_lists(user).await
        }
        async fn list_members(
            &self,
            user: &Principal,
            list_id: i64,
        ) -> DashboardResult<Vec<ContactListMember>> {
            self.read();
            self.inner.list_members(user, list_id).await
        }
        async fn list_conversations(&self, user: &Principal) -> DashboardResult<Vec<Conversation>> {
            self.read();
            self.inner.list_conversations(user).await
        }
        async fn get_conversation(
            &self,
            user: &Principal,
            id: i64,
        ) -> DashboardResult<Conversation> {
            self.read();
            self.inner.get_conversation(user, id).await
        }
        async fn list_messages(
            &self,
            user: &Principal,
            conversation_id: i64,
        ) -> DashboardResult<Vec<Message>> {
            self.read();
            self.inner.list_messages(user, conversation_id).await
        }
        async fn record_message(
            &self,
            user: &Principal,
            conversation_id: i64,
            direction: MessageDirection,
            body: &str,
            media_url: Option<String>,
            status: &str,
        ) -> DashboardResult<Message> {
            self.write().await?;
            self.inner
                .record_message(user, conversation_id, direction, body, media_url, status)
                .await
        }
        async fn mark_conversation_read(
            &self,
            user: &Principal,
            id: i64,
        ) -> DashboardResult<Conversation> {
            self.write().await?;
            self.inner.mark_conversation_read(user, id).await
        }
        async fn get_webhook(&self, name: &str) -> DashboardResult<Option<WebhookEndpoint>> {
            self.read();
            self.inner.get_webhook(name).await
        }
        async fn stats(&self, user: &Principal) -> DashboardResult<DashboardStats> {
            self.read();
            self.inner.stats(user).await
        }
        async fn plan_usage(&self, user: &Principal) -> DashboardResult<PlanUsage> {
            self.read();
            self.inner.plan_usage(user).await
        }
    }

    fn local_store() -> LocalStore {
        LocalStore::new(DbHandle::new(BoardDb::new_in_memory().unwrap()))
    }

    fn board_over(store: Arc<CountingStore>) -> LeadBoard {
        LeadBoard::new(
            store,
            Arc::new(QueryCache::new()),
            WebhookClient::new(DEFAULT_WEBHOOK_TIMEOUT).unwrap(),
            BoardSettings::default(),
        )
    }

    fn alice() -> Principal {
        Principal::new("alice")
    }

    fn named(name: &str, phone: Option<&str>) -> LeadInput {
        LeadInput {
            name: Some(name.into()),
            phone: phone.map(String::from),
            ..LeadInput::default()
        }
    }

    async fn seed_leads(local: &LocalStore, user: &Principal, names: &[&str]) -> Vec<Lead> {
        let mut leads = Vec::new();
        for name in names {
            leads.push(local.create_lead(user, &named(name, None)).await.unwrap());
        }
        leads
    }

    fn order_in(leads: &[Lead], column_id: i64) -> Vec<String> {
        leads
            .iter()
            .filter(|l| l.column_id == column_id)
            .map(|l| l.name.clone())
            .collect()
    }

    // ── Reordering ────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_move_within_column_lands_between_neighbours() {
        let local = local_store();
        let user = alice();
        let seeded = seed_leads(&local, &user, &["a", "b", "c", "d"]).await;
        let column_id = seeded[0].column_id;
        let board = board_over(Arc::new(CountingStore::new(local)));

        // Drag "d" between "a" and "b".
        let moved = board
            .move_lead(&user, seeded[3].id, column_id, 1)
            .await
            .unwrap();
        assert!(moved.position > seeded[0].position && moved.position < seeded[1].position);

        let leads = board.leads(&user).await.unwrap();
        assert_eq!(order_in(&leads, column_id), vec!["a", "d", "b", "c"]);
    }

    #[tokio::test]
    async fn test_move_to_other_column_top_and_bottom() {
        let local = local_store();
        let user = alice();
        let seeded = seed_leads(&local, &user, &["a", "b", "c"]).await;
        let default_column = seeded[0].column_id;
        let won = local.create_column(&user, "Won", "#16a34a").await.unwrap();
        let board = board_over(Arc::new(CountingStore::new(local)));

        board.move_lead(&user, seeded[0].id, won.id, 0).await.unwrap();
        board.move_lead(&user, seeded[1].id, won.id, 0).await.unwrap();
        board.move_lead(&user, seeded[2].id, won.id, 99).await.unwrap();

        let leads = board.leads(&user).await.unwrap();
        assert_eq!(order_in(&leads, won.id), vec!["b", "a", "c"]);
        assert!(order_in(&leads, default_column).is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_gap_renormalizes_column() {
        let local = local_store();
        let user = alice();
        let seeded = seed_leads(&local, &user, &["a", "b", "x"]).await;
        let column_id = seeded[0].column_id;
        let store = Arc::new(CountingStore::new(local));
        let board = board_over(Arc::clone(&store));

        // Squeeze "a" and "b" to equal keys; no midpoint fits between them.
        store.inner.move_lead(&user, seeded[1].id, column_id, 0.0).await.unwrap();
        board.move_lead(&user, seeded[2].id, column_id, 1).await.unwrap();

        let leads = board.leads(&user).await.unwrap();
        assert_eq!(order_in(&leads, column_id), vec!["a", "x", "b"]);
        let keys: Vec<f64> = leads.iter().map(|l| l.position).collect();
        assert!(keys.windows(2).all(|w| w[0] < w[1]), "keys not strictly ordered: {:?}", keys);
        // One renormalize plus one move.
        assert_eq!(store.writes(), 2);
    }

    #[tokio::test]
    async fn test_failed_move_refetches_so_card_snaps_back() {
        let local = local_store();
        let user = alice();
        let seeded = seed_leads(&local, &user, &["a", "b"]).await;
        let column_id = seeded[0].column_id;
        let mut counting = CountingStore::new(local);
        counting.fail_writes = true;
        let store = Arc::new(counting);
        let board = board_over(Arc::clone(&store));

        board.leads(&user).await.unwrap();
        let err = board
            .move_lead(&user, seeded[1].id, column_id, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, DashboardError::WriteRejected { .. }));
        assert!(board.cache().status(&board.key(&user, EntityTag::Leads)).stale);

        let reads_before = store.reads();
        let leads = board.leads(&user).await.unwrap();
        assert_eq!(store.reads(), reads_before + 1);
        assert_eq!(order_in(&leads, column_id), vec!["a", "b"]);

        let notes = board.notifications().drain(&user.user_id);
        assert_eq!(notes.last().unwrap().level, NoticeLevel::Error);
    }

    #[tokio::test]
    async fn test_failed_non_move_write_leaves_cache_untouched() {
        let local = local_store();
        let user = alice();
        let seeded = seed_leads(&local, &user, &["a"]).await;
        let mut counting = CountingStore::new(local);
        counting.fail_writes = true;
        let board = board_over(Arc::new(counting));

        board.leads(&user).await.unwrap();
        assert!(board.delete_lead(&user, seeded[0].id).await.is_err());
        let status = board.cache().status(&board.key(&user, EntityTag::Leads));
        assert_eq!(status.state, QueryState::Ready);
        assert!(!status.stale);
    }

    // ── Synchronization ───────────────────────────────────────────────

    #[tokio::test]
    async fn test_refetch_without_writes_returns_same_collection() {
        let local = local_store();
        let user = alice();
        seed_leads(&local, &user, &["a", "b", "c"]).await;
        let store = Arc::new(CountingStore::new(local));
        let board = board_over(Arc::clone(&store));

        let first = board.leads(&user).await.unwrap();
        board
            .cache()
            .invalidate(&user.user_id, &[KeyPattern::tag(EntityTag::Leads)]);
        let second = board.leads(&user).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.reads(), 2);
    }

    #[tokio::test]
    async fn test_successful_write_invalidates_then_read_refetches() {
        let local = local_store();
        let user = alice();
        let store = Arc::new(CountingStore::new(local));
        let board = board_over(Arc::clone(&store));

        assert!(board.leads(&user).await.unwrap().is_empty());
        board.create_lead(&user, named("Ana", None)).await.unwrap();
        let leads = board.leads(&user).await.unwrap();
        assert_eq!(leads.len(), 1);
        assert_eq!(store.reads(), 2);

        let notes = board.notifications().drain(&user.user_id);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].level, NoticeLevel::Success);
    }

    #[tokio::test]
    async fn test_duplicate_submission_rejected_while_in_flight() {
        let local = local_store();
        let user = alice();
        let seeded = seed_leads(&local, &user, &["a"]).await;
        let gate = Arc::new(Notify::new());
        let mut counting = CountingStore::new(local);
        counting.gate = Some(Arc::clone(&gate));
        let store = Arc::new(counting);
        let board = board_over(Arc::clone(&store));

        let first = board.delete_lead(&user, seeded[0].id);
        let second = async {
            let result = board.delete_lead(&user, seeded[0].id).await;
            gate.notify_one();
            result
        };
        let (first, second) = tokio::join!(first, second);

        assert!(first.is_ok());
        assert!(matches!(second, Err(DashboardError::MutationInFlight(_))));
        assert_eq!(store.writes(), 1);
        // Only the first submission reports.
        assert_eq!(board.notifications().drain(&user.user_id).len(), 1);
        assert!(
            !board
                .tracker()
                .is_in_flight(&Mutation::DeleteLead { lead_id: seeded[0].id }.in_flight_key(&user.user_id))
        );
    }

    #[tokio::test]
    async fn test_same_action_by_different_users_runs_concurrently() {
        let gate = Arc::new(Notify::new());
        let mut counting = CountingStore::new(local_store());
        counting.gate = Some(Arc::clone(&gate));
        let store = Arc::new(counting);
        let board = board_over(Arc::clone(&store));
        let (alice, bob) = (alice(), Principal::new("bob"));

        let first = board.create_lead(&alice, named("Ana", None));
        let second = board.create_lead(&bob, named("Bia", None));
        let release = async {
            for _ in 0..100 {
                if store.writes() == 2 {
                    break;
                }
                tokio::task::yield_now().await;
            }
            gate.notify_waiters();
        };
        let (first, second, ()) = tokio::join!(first, second, release);

        assert_eq!(first.unwrap().name, "Ana");
        assert_eq!(second.unwrap().name, "Bia");
        assert_eq!(store.writes(), 2);

        // Each user only sees their own outcome.
        let alice_notes = board.notifications().drain(&alice.user_id);
        let bob_notes = board.notifications().drain(&bob.user_id);
        assert_eq!(alice_notes.len(), 1);
        assert_eq!(bob_notes.len(), 1);
        assert_eq!(bob_notes[0].level, NoticeLevel::Success);
    }

    #[tokio::test]
    async fn test_followed_realtime_changes_invalidate_board_cache() {
        let local = local_store();
        let user = alice();
        let changes = local.subscribe();
        let store = Arc::new(CountingStore::new(local));
        let board = board_over(Arc::clone(&store));

        assert!(board.conversations(&user).await.unwrap().is_empty());
        let _follow = board.follow_realtime(
            changes,
            vec![EntityTag::Conversations, EntityTag::Messages],
        );
        store
            .inner
            .create_conversation(&user, "+5511955554444", Some("Eva"))
            .await
            .unwrap();

        let key = board.key(&user, EntityTag::Conversations);
        for _ in 0..50 {
            if board.cache().status(&key).stale {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(board.cache().status(&key).stale);
        assert_eq!(board.conversations(&user).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_contact_invalidates_membership() {
        let local = local_store();
        let user = alice();
        let lead = local
            .create_lead(&user, &named("Ana", Some("+5511999990001")))
            .await
            .unwrap();
        let board = board_over(Arc::new(CountingStore::new(local)));
        let report = board
            .convert_leads_to_contacts(&user, &[lead.id], "Ana list")
            .await
            .unwrap();

        let members = board.list_members(&user, report.list.id).await.unwrap();
        assert_eq!(members.len(), 1);
        board.delete_contact(&user, members[0].contact_id).await.unwrap();

        let members_key = board
            .key(&user, EntityTag::ContactListMembers)
            .with_parent(report.list.id);
        assert!(board.cache().status(&members_key).stale);
        assert!(board.list_members(&user, report.list.id).await.unwrap().is_empty());
        assert!(board.contacts(&user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_manual_refresh_bypasses_cache() {
        let local = local_store();
        let user = alice();
        let store = Arc::new(CountingStore::new(local));
        let board = board_over(Arc::clone(&store));

        board.contacts(&user).await.unwrap();
        board.contacts(&user).await.unwrap();
        assert_eq!(store.reads(), 1);
        assert_eq!(board.refresh(&user, EntityTag::Contacts), 1);
        board.contacts(&user).await.unwrap();
        assert_eq!(store.reads(), 2);
    }

    // ── Conversion ────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_convert_five_leads_four_with_phone() {
        let local = local_store();
        let user = alice();
        let mut ids = Vec::new();
        for (i, phone) in ["+1", "+2", "", "+4", "+5"].iter().enumerate() {
            let phone = (!phone.is_empty()).then_some(*phone);
            let lead = local
                .create_lead(&user, &named(&format!("lead-{}", i), phone))
                .await
                .unwrap();
            ids.push(lead.id);
        }
        let board = board_over(Arc::new(CountingStore::new(local)));

        board.contacts(&user).await.unwrap();
        board.contact_lists(&user).await.unwrap();

        let report = board
            .convert_leads_to_contacts(&user, &ids, "Imported")
            .await
            .unwrap();
        assert_eq!(report.contacts_created, 4);
        assert_eq!(report.members_created, 4);
        assert_eq!(report.skipped_without_phone, 1);

        assert!(board.cache().status(&board.key(&user, EntityTag::Contacts)).stale);
        assert!(board.cache().status(&board.key(&user, EntityTag::ContactLists)).stale);
        assert_eq!(board.contacts(&user).await.unwrap().len(), 4);
        let lists = board.contact_lists(&user).await.unwrap();
        assert_eq!(lists.len(), 1);
        assert_eq!(lists[0].name, "Imported");
        assert_eq!(board.list_members(&user, lists[0].id).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_convert_counts_repeated_lead_once() {
        let local = local_store();
        let user = alice();
        let lead = local
            .create_lead(&user, &named("Ana", Some("+5511999990001")))
            .await
            .unwrap();
        let board = board_over(Arc::new(CountingStore::new(local)));

        let report = board
            .convert_leads_to_contacts(&user, &[lead.id, lead.id], "Ana list")
            .await
            .unwrap();
        assert_eq!(report.contacts_created, 1);
        assert_eq!(report.members_created, 1);
        assert_eq!(board.contacts(&user).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_convert_requires_list_name_before_any_write() {
        let local = local_store();
        let user = alice();
        let lead = local.create_lead(&user, &named("a", Some("+1"))).await.unwrap();
        let store = Arc::new(CountingStore::new(local));
        let board = board_over(Arc::clone(&store));

        let err = board
            .convert_leads_to_contacts(&user, &[lead.id], "   ")
            .await
            .unwrap_err();
        assert!(matches!(err, DashboardError::Validation(_)));
        assert_eq!(store.writes(), 0);
    }

    // ── Columns ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_default_column_delete_rejected_before_store_call() {
        let local = local_store();
        let user = alice();
        let default = local
            .db()
            .call({
                let user = user.clone();
                move |db| db.ensure_default_column(&user)
            })
            .await
            .unwrap();
        let store = Arc::new(CountingStore::new(local));
        let board = board_over(Arc::clone(&store));

        let err = board.delete_column(&user, default.id).await.unwrap_err();
        assert!(matches!(err, DashboardError::DefaultColumnProtected));
        assert_eq!(store.writes(), 0);
        let notes = board.notifications().drain(&user.user_id);
        assert_eq!(notes[0].level, NoticeLevel::Error);
    }

    #[tokio::test]
    async fn test_default_column_check_uses_cached_columns() {
        let store = Arc::new(CountingStore::new(local_store()));
        let board = board_over(Arc::clone(&store));
        let user = alice();

        let columns = board.columns(&user).await.unwrap();
        let default = columns.iter().find(|c| c.is_default).unwrap();
        let reads_before = store.reads();

        let err = board.delete_column(&user, default.id).await.unwrap_err();
        assert!(matches!(err, DashboardError::DefaultColumnProtected));
        assert_eq!(store.reads(), reads_before);
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn test_deleting_column_moves_leads_to_default() {
        let local = local_store();
        let user = alice();
        let seeded = seed_leads(&local, &user, &["keep"]).await;
        let default_id = seeded[0].column_id;
        let lost = local.create_column(&user, "Lost", "#dc2626").await.unwrap();
        let board = board_over(Arc::new(CountingStore::new(local)));

        let orphan = board
            .create_lead(
                &user,
                LeadInput {
                    column_id: Some(lost.id),
                    ..named("orphan", None)
                },
            )
            .await
            .unwrap();
        assert_eq!(board.delete_column(&user, lost.id).await.unwrap(), 1);

        let view = board.board(&user).await.unwrap();
        assert_eq!(view.columns.len(), 1);
        let names: Vec<&str> = view.columns[0].leads.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["keep", "orphan"]);
        assert_eq!(view.columns[0].column.id, default_id);
        assert!(view.columns[0].leads.iter().any(|l| l.id == orphan.id));
    }

    #[tokio::test]
    async fn test_lead_validation_rejects_blank_name_and_negative_value() {
        let store = Arc::new(CountingStore::new(local_store()));
        let board = board_over(Arc::clone(&store));
        let user = alice();

        assert!(matches!(
            board.create_lead(&user, named("  ", None)).await,
            Err(DashboardError::Validation(_))
        ));
        assert!(matches!(
            board
                .create_lead(
                    &user,
                    LeadInput {
                        value: Some(-5.0),
                        ..named("a", None)
                    }
                )
                .await,
            Err(DashboardError::Validation(_))
        ));
        assert_eq!(store.writes(), 0);
    }

    // ── Inbox & connections ───────────────────────────────────────────

    #[tokio::test]
    async fn test_send_message_relays_and_records() {
        let local = local_store();
        let user = alice();
        let endpoint = spawn_endpoint(StatusCode::OK, serde_json::json!({"status": "queued"})).await;
        local.upsert_webhook("send_message", &endpoint.url).await.unwrap();
        let conversation = local
            .create_conversation(&user, "+5511988887777", Some("Caio"))
            .await
            .unwrap();
        let board = board_over(Arc::new(CountingStore::new(local)));

        board.messages(&user, conversation.id).await.unwrap();
        let message = board
            .send_message(
                &user,
                OutgoingMessage {
                    instance: "shop".into(),
                    conversation_id: conversation.id,
                    body: "Your order shipped".into(),
                    attachment: Some(Attachment {
                        file_name: "receipt.pdf".into(),
                        content_type: None,
                        size: 1024,
                    }),
                },
            )
            .await
            .unwrap();
        assert_eq!(message.direction, MessageDirection::Outbound);
        assert!(message.media_url.as_deref().unwrap().contains("/alice/"));

        {
            let received = endpoint.received.lock().unwrap();
            assert_eq!(received.len(), 1);
            assert_eq!(received[0]["phone_number"], "+5511988887777");
            assert_eq!(received[0]["message"], "Your order shipped");
            assert_eq!(received[0]["media_type"], "document");
            assert_eq!(received[0]["file_name"], "receipt.pdf");
        }

        let messages_key = board.key(&user, EntityTag::Messages).with_parent(conversation.id);
        assert!(board.cache().status(&messages_key).stale);
        assert_eq!(board.messages(&user, conversation.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_send_message_rejected_webhook_records_nothing() {
        let local = local_store();
        let user = alice();
        let endpoint = spawn_endpoint(StatusCode::BAD_REQUEST, serde_json::json!({"error": "bad number"})).await;
        local.upsert_webhook("send_message", &endpoint.url).await.unwrap();
        let conversation = local.create_conversation(&user, "+1", None).await.unwrap();
        let store = Arc::new(CountingStore::new(local));
        let board = board_over(Arc::clone(&store));

        let err = board
            .send_message(
                &user,
                OutgoingMessage {
                    instance: "shop".into(),
                    conversation_id: conversation.id,
                    body: "hi".into(),
                    attachment: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DashboardError::WriteRejected { status: 400, .. }));
        assert_eq!(store.writes(), 0);
        assert!(board.messages(&user, conversation.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_send_message_rejects_oversized_attachment_locally() {
        let local = local_store();
        let user = alice();
        let conversation = local.create_conversation(&user, "+1", None).await.unwrap();
        let store = Arc::new(CountingStore::new(local));
        let board = board_over(Arc::clone(&store));

        let err = board
            .send_message(
                &user,
                OutgoingMessage {
                    instance: "shop".into(),
                    conversation_id: conversation.id,
                    body: String::new(),
                    attachment: Some(Attachment {
                        file_name: "movie.mp4".into(),
                        content_type: Some("video/mp4".into()),
                        size: 11 * 1024 * 1024,
                    }),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DashboardError::Validation(_)));
        assert_eq!(store.reads(), 0);
    }

    #[tokio::test]
    async fn test_connection_without_registered_webhook_is_validation_error() {
        let board = board_over(Arc::new(CountingStore::new(local_store())));
        let err = board
            .generate_qr_code(&alice(), "shop")
            .await
            .unwrap_err();
        assert!(matches!(err, DashboardError::Validation(ref m) if m.contains("generate_qr")));
    }

    #[tokio::test]
    async fn test_generate_qr_code_returns_webhook_reply() {
        let local = local_store();
        let endpoint = spawn_endpoint(StatusCode::OK, serde_json::json!({"base64": "iVBOR"})).await;
        local.upsert_webhook("generate_qr", &endpoint.url).await.unwrap();
        let board = board_over(Arc::new(CountingStore::new(local)));

        let reply = board.generate_qr_code(&alice(), " shop ").await.unwrap();
        assert_eq!(reply["base64"], "iVBOR");
        assert_eq!(endpoint.received.lock().unwrap()[0]["instance_name"], "shop");
    }

    #[tokio::test]
    async fn test_connection_actions_use_their_own_webhooks() {
        let local = local_store();
        let create = spawn_endpoint(StatusCode::OK, serde_json::json!({"created": true})).await;
        let delete = spawn_endpoint(StatusCode::OK, serde_json::json!({"deleted": true})).await;
        local.upsert_webhook("create_instance", &create.url).await.unwrap();
        local.upsert_webhook("delete_instance", &delete.url).await.unwrap();
        let board = board_over(Arc::new(CountingStore::new(local)));
        let user = alice();

        let reply = board.create_connection(&user, "shop").await.unwrap();
        assert_eq!(reply["created"], true);
        let reply = board.delete_connection(&user, "shop").await.unwrap();
        assert_eq!(reply["deleted"], true);

        assert_eq!(create.received.lock().unwrap().len(), 1);
        assert_eq!(delete.received.lock().unwrap().len(), 1);
        let messages: Vec<String> = board
            .notifications()
            .drain(&user.user_id)
            .into_iter()
            .map(|n| n.message)
            .collect();
        assert_eq!(messages, vec!["Connection requested", "Connection removal requested"]);
    }

    #[tokio::test]
    async fn test_create_lead_from_conversation_invalidates_leads() {
        let local = local_store();
        let user = alice();
        let conversation = local
            .create_conversation(&user, "+5511977776666", Some("Duda"))
            .await
            .unwrap();
        let board = board_over(Arc::new(CountingStore::new(local)));

        assert!(board.leads(&user).await.unwrap().is_empty());
        let lead = board
            .create_lead_from_conversation(&user, conversation.id, None)
            .await
            .unwrap();
        assert_eq!(lead.name, "Duda");
        assert_eq!(board.leads(&user).await.unwrap().len(), 1);
    }
}
