use async_trait::async_trait;
use tokio::sync::broadcast;

use super::db::DbHandle;
use super::models::*;
use crate::errors::DashboardResult;

/// Capacity of the row-change channel. Slow subscribers past this lag and
/// are told how many events they missed.
pub const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// The persistence boundary the dashboard talks to. Every call is scoped to
/// an explicit principal; ownership failures surface as `AccessDenied`.
///
/// Real implementation: [`LocalStore`]. Tests wrap it to count calls or
/// inject failures.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn list_columns(&self, user: &Principal) -> DashboardResult<Vec<LeadColumn>>;
    async fn create_column(&self, user: &Principal, name: &str, color: &str)
    -> DashboardResult<LeadColumn>;
    async fn update_column(
        &self,
        user: &Principal,
        id: i64,
        name: Option<String>,
        color: Option<String>,
        position: Option<i32>,
    ) -> DashboardResult<LeadColumn>;
    /// Returns how many leads were reassigned to the default column.
    async fn delete_column(&self, user: &Principal, id: i64) -> DashboardResult<usize>;

    async fn list_leads(&self, user: &Principal) -> DashboardResult<Vec<Lead>>;
    async fn create_lead(&self, user: &Principal, input: &LeadInput) -> DashboardResult<Lead>;
    async fn update_lead(&self, user: &Principal, id: i64, input: &LeadInput)
    -> DashboardResult<Lead>;
    async fn move_lead(
        &self,
        user: &Principal,
        id: i64,
        column_id: i64,
        position: f64,
    ) -> DashboardResult<Lead>;
    async fn renormalize_column(&self, user: &Principal, column_id: i64)
    -> DashboardResult<Vec<Lead>>;
    async fn delete_lead(&self, user: &Principal, id: i64) -> DashboardResult<()>;
    async fn create_lead_from_conversation(
        &self,
        user: &Principal,
        conversation_id: i64,
        column_id: Option<i64>,
    ) -> DashboardResult<Lead>;
    async fn convert_leads_to_contacts(
        &self,
        user: &Principal,
        lead_ids: &[i64],
        list_name: &str,
    ) -> DashboardResult<ConversionReport>;

    async fn list_contacts(&self, user: &Principal) -> DashboardResult<Vec<Contact>>;
    async fn delete_contact(&self, user: &Principal, id: i64) -> DashboardResult<()>;
    async fn list_contact_lists(&self, user: &Principal) -> DashboardResult<Vec<ContactList>>;
    async fn list_members(&self, user: &Principal, list_id: i64)
    -> DashboardResult<Vec<ContactListMember>>;

    async fn list_conversations(&self, user: &Principal) -> DashboardResult<Vec<Conversation>>;
    async fn get_conversation(&self, user: &Principal, id: i64) -> DashboardResult<Conversation>;
    async fn list_messages(&self, user: &Principal, conversation_id: i64)
    -> DashboardResult<Vec<Message>>;
    async fn record_message(
        &self,
        user: &Principal,
        conversation_id: i64,
        direction: MessageDirection,
        body: &str,
        media_url: Option<String>,
        status: &str,
    ) -> DashboardResult<Message>;
    async fn mark_conversation_read(&self, user: &Principal, id: i64)
    -> DashboardResult<Conversation>;

    async fn get_webhook(&self, name: &str) -> DashboardResult<Option<WebhookEndpoint>>;

    async fn stats(&self, user: &Principal) -> DashboardResult<DashboardStats>;
    async fn plan_usage(&self, user: &Principal) -> DashboardResult<PlanUsage>;
}

/// SQLite-backed store. Publishes a [`RowChange`] for every committed write.
#[derive(Clone)]
pub struct LocalStore {
    db: DbHandle,
    changes: broadcast::Sender<RowChange>,
}

impl LocalStore {
    pub fn new(db: DbHandle) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { db, changes }
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    /// Receive every row change committed from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RowChange> {
        self.changes.subscribe()
    }

    fn publish(&self, user: &Principal, table: EntityTag, kind: ChangeKind, id: i64) {
        self.publish_child(user, table, kind, id, None);
    }

    fn publish_child(
        &self,
        user: &Principal,
        table: EntityTag,
        kind: ChangeKind,
        id: i64,
        parent_id: Option<i64>,
    ) {
        let change = RowChange {
            table,
            kind,
            id,
            user_id: user.user_id.clone(),
            parent_id,
        };
        // No subscribers is fine.
        if self.changes.send(change).is_err() {
            tracing::trace!(%table, id, "row change dropped; no subscribers");
        }
    }

    pub async fn get_board(&self, user: &Principal) -> DashboardResult<BoardView> {
        let user = user.clone();
        self.db.call(move |db| db.get_board(&user)).await
    }

    pub async fn get_lead(&self, user: &Principal, id: i64) -> DashboardResult<Lead> {
        let user = user.clone();
        self.db.call(move |db| db.get_lead(&user, id)).await
    }

    pub async fn create_conversation(
        &self,
        user: &Principal,
        contact_phone: &str,
        contact_name: Option<&str>,
    ) -> DashboardResult<Conversation> {
        let owner = user.clone();
        let phone = contact_phone.to_string();
        let name = contact_name.map(str::to_string);
        let conversation = self
            .db
            .call(move |db| db.create_conversation(&owner, &phone, name.as_deref()))
            .await?;
        self.publish(user, EntityTag::Conversations, ChangeKind::Insert, conversation.id);
        Ok(conversation)
    }

    pub async fn upsert_webhook(&self, name: &str, url: &str) -> DashboardResult<WebhookEndpoint> {
        let name = name.to_string();
        let url = url.to_string();
        self.db.call(move |db| db.upsert_webhook(&name, &url)).await
    }

    pub async fn list_webhooks(&self) -> DashboardResult<Vec<WebhookEndpoint>> {
        self.db.call(|db| db.list_webhooks()).await
    }

    pub async fn set_plan_payload(
        &self,
        user: &Principal,
        payload: serde_json::Value,
    ) -> DashboardResult<()> {
        let user = user.clone();
        self.db.call(move |db| db.set_plan_payload(&user, &payload)).await
    }
}

#[async_trait]
impl DataStore for LocalStore {
    async fn list_columns(&self, user: &Principal) -> DashboardResult<Vec<LeadColumn>> {
        let user = user.clone();
        self.db.call(move |db| db.list_columns(&user)).await
    }

    async fn create_column(
        &self,
        user: &Principal,
        name: &str,
        color: &str,
    ) -> DashboardResult<LeadColumn> {
        let owner = user.clone();
        let (name, color) = (name.to_string(), color.to_string());
        let column = self
            .db
            .call(move |db| db.create_column(&owner, &name, &color))
            .await?;
        self.publish(user, EntityTag::LeadColumns, ChangeKind::Insert, column.id);
        Ok(column)
    }

    async fn update_column(
        &self,
        user: &Principal,
        id: i64,
        name: Option<String>,
        color: Option<String>,
        position: Option<i32>,
    ) -> DashboardResult<LeadColumn> {
        let owner = user.clone();
        let column = self
            .db
            .call(move |db| {
                db.update_column(&owner, id, name.as_deref(), color.as_deref(), position)
            })
            .await?;
        self.publish(user, EntityTag::LeadColumns, ChangeKind::Update, id);
        Ok(column)
    }

    async fn delete_column(&self, user: &Principal, id: i64) -> DashboardResult<usize> {
        let owner = user.clone();
        let moved = self.db.call(move |db| db.delete_column(&owner, id)).await?;
        self.publish(user, EntityTag::LeadColumns, ChangeKind::Delete, id);
        Ok(moved)
    }

    async fn list_leads(&self, user: &Principal) -> DashboardResult<Vec<Lead>> {
        let user = user.clone();
        self.db.call(move |db| db.list_leads(&user)).await
    }

    async fn create_lead(&self, user: &Principal, input: &LeadInput) -> DashboardResult<Lead> {
        let owner = user.clone();
        let input = input.clone();
        let lead = self.db.call(move |db| db.create_lead(&owner, &input)).await?;
        self.publish(user, EntityTag::Leads, ChangeKind::Insert, lead.id);
        Ok(lead)
    }

    async fn update_lead(
        &self,
        user: &Principal,
        id: i64,
        input: &LeadInput,
    ) -> DashboardResult<Lead> {
        let owner = user.clone();
        let input = input.clone();
        let lead = self
            .db
            .call(move |db| db.update_lead(&owner, id, &input))
            .await?;
        self.publish(user, EntityTag::Leads, ChangeKind::Update, id);
        Ok(lead)
    }

    async fn move_lead(
        &self,
        user: &Principal,
        id: i64,
        column_id: i64,
        position: f64,
    ) -> DashboardResult<Lead> {
        let owner = user.clone();
        let lead = self
            .db
            .call(move |db| db.move_lead(&owner, id, column_id, position))
            .await?;
        self.publish(user, EntityTag::Leads, ChangeKind::Update, id);
        Ok(lead)
    }

    async fn renormalize_column(
        &self,
        user: &Principal,
        column_id: i64,
    ) -> DashboardResult<Vec<Lead>> {
        let owner = user.clone();
        let leads = self
            .db
            .call(move |db| db.renormalize_column(&owner, column_id))
            .await?;
        for lead in &leads {
            self.publish(user, EntityTag::Leads, ChangeKind::Update, lead.id);
        }
        Ok(leads)
    }

    async fn delete_lead(&self, user: &Principal, id: i64) -> DashboardResult<()> {
        let owner = user.clone();
        self.db.call(move |db| db.delete_lead(&owner, id)).await?;
        self.publish(user, EntityTag::Leads, ChangeKind::Delete, id);
        Ok(())
    }

    async fn create_lead_from_conversation(
        &self,
        user: &Principal,
        conversation_id: i64,
        column_id: Option<i64>,
    ) -> DashboardResult<Lead> {
        let owner = user.clone();
        let lead = self
            .db
            .call(move |db| db.create_lead_from_conversation(&owner, conversation_id, column_id))
            .await?;
        self.publish(user, EntityTag::Leads, ChangeKind::Insert, lead.id);
        Ok(lead)
    }

    async fn convert_leads_to_contacts(
        &self,
        user: &Principal,
        lead_ids: &[i64],
        list_name: &str,
    ) -> DashboardResult<ConversionReport> {
        let owner = user.clone();
        let lead_ids = lead_ids.to_vec();
        let list_name = list_name.to_string();
        let (report, members) = self
            .db
            .call(move |db| {
                let report = db.convert_leads_to_contacts(&owner, &lead_ids, &list_name)?;
                let members = db.list_members(&owner, report.list.id)?;
                Ok((report, members))
            })
            .await?;
        let list_id = report.list.id;
        self.publish(user, EntityTag::ContactLists, ChangeKind::Insert, list_id);
        for member in &members {
            self.publish(user, EntityTag::Contacts, ChangeKind::Insert, member.contact_id);
            self.publish_child(
                user,
                EntityTag::ContactListMembers,
                ChangeKind::Insert,
                member.contact_id,
                Some(list_id),
            );
        }
        Ok(report)
    }

    async fn list_contacts(&self, user: &Principal) -> DashboardResult<Vec<Contact>> {
        let user = user.clone();
        self.db.call(move |db| db.list_contacts(&user)).await
    }

    async fn delete_contact(&self, user: &Principal, id: i64) -> DashboardResult<()> {
        let owner = user.clone();
        self.db.call(move |db| db.delete_contact(&owner, id)).await?;
        self.publish(user, EntityTag::Contacts, ChangeKind::Delete, id);
        Ok(())
    }

    async fn list_contact_lists(&self, user: &Principal) -> DashboardResult<Vec<ContactList>> {
        let user = user.clone();
        self.db.call(move |db| db.list_contact_lists(&user)).await
    }

    async fn list_members(
        &self,
        user: &Principal,
        list_id: i64,
    ) -> DashboardResult<Vec<ContactListMember>> {
        let user = user.clone();
        self.db.call(move |db| db.list_members(&user, list_id)).await
    }

    async fn list_conversations(&self, user: &Principal) -> DashboardResult<Vec<Conversation>> {
        let user = user.clone();
        self.db.call(move |db| db.list_conversations(&user)).await
    }

    async fn get_conversation(&self, user: &Principal, id: i64) -> DashboardResult<Conversation> {
        let user = user.clone();
        self.db.call(move |db| db.get_conversation(&user, id)).await
    }

    async fn list_messages(
        &self,
        user: &Principal,
        conversation_id: i64,
    ) -> DashboardResult<Vec<Message>> {
        let user = user.clone();
        self.db
            .call(move |db| db.list_messages(&user, conversation_id))
            .await
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
        let owner = user.clone();
        let body = body.to_string();
        let status = status.to_string();
        let message = self
            .db
            .call(move |db| {
                db.insert_message(
                    &owner,
                    conversation_id,
                    direction,
                    &body,
                    media_url.as_deref(),
                    &status,
                )
            })
            .await?;
        self.publish_child(
            user,
            EntityTag::Messages,
            ChangeKind::Insert,
            message.id,
            Some(conversation_id),
        );
        self.publish(user, EntityTag::Conversations, ChangeKind::Update, conversation_id);
        Ok(message)
    }

    async fn mark_conversation_read(
        &self,
        user: &Principal,
        id: i64,
    ) -> DashboardResult<Conversation> {
        let owner = user.clone();
        let conversation = self
            .db
            .call(move |db| db.mark_conversation_read(&owner, id))
            .await?;
        self.publish(user, EntityTag::Conversations, ChangeKind::Update, id);
        Ok(conversation)
    }

    async fn get_webhook(&self, name: &str) -> DashboardResult<Option<WebhookEndpoint>> {
        let name = name.to_string();
        self.db.call(move |db| db.get_webhook(&name)).await
    }

    async fn stats(&self, user: &Principal) -> DashboardResult<DashboardStats> {
        let user = user.clone();
        self.db.call(move |db| db.stats(&user)).await
    }

    async fn plan_usage(&self, user: &Principal) -> DashboardResult<PlanUsage> {
        let user = user.clone();
        self.db.call(move |db| db.plan_usage(&user)).await
    }
}
