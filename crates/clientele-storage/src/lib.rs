//! Transactional persistence of fetched records: Postgres + in-memory stores and the sync writer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clientele_core::{Client, EndpointKind, ExternalId, FetchResult, Message, Opportunity};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "clientele-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Message(String),
}

/// One open write transaction. Dropping it without [`SyncTransaction::commit`] rolls back.
#[async_trait]
pub trait SyncTransaction: Send {
    /// Returns the internal id of the inserted or updated client row.
    async fn upsert_client(&mut self, client: &Client) -> Result<Uuid, StoreError>;

    async fn upsert_message(&mut self, client_id: Uuid, message: &Message) -> Result<(), StoreError>;

    async fn upsert_opportunity(
        &mut self,
        client_id: Uuid,
        opportunity: &Opportunity,
    ) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn begin<'a>(&'a self) -> Result<Box<dyn SyncTransaction + 'a>, StoreError>;
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("begin transaction: {0}")]
    Begin(#[source] StoreError),
    #[error("upsert {kind} {external_id}: {source}")]
    Upsert {
        kind: EndpointKind,
        external_id: ExternalId,
        #[source]
        source: StoreError,
    },
    #[error("commit transaction: {0}")]
    Commit(#[source] StoreError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteSummary {
    pub clients_upserted: usize,
    pub messages_upserted: usize,
    pub opportunities_upserted: usize,
    pub messages_skipped: usize,
    pub opportunities_skipped: usize,
}

/// Run-local map from upstream client id to the row id assigned by the store.
pub type ClientIdMap = HashMap<ExternalId, Uuid>;

/// Persist a fetch result in one transaction: clients first, then owned records.
///
/// Messages and opportunities whose client is not part of `result` are skipped. Any store
/// failure aborts and rolls back everything written by this call.
pub async fn write_sync(
    store: &dyn SyncStore,
    result: &FetchResult,
) -> Result<WriteSummary, PersistenceError> {
    let counts = result.record_counts();
    let span = info_span!(
        "write_sync",
        clients = counts.clients,
        messages = counts.messages,
        opportunities = counts.opportunities
    );
    write_in_transaction(store, result).instrument(span).await
}

async fn write_in_transaction(
    store: &dyn SyncStore,
    result: &FetchResult,
) -> Result<WriteSummary, PersistenceError> {
    let mut tx = store.begin().await.map_err(PersistenceError::Begin)?;
    let mut client_ids = ClientIdMap::new();
    let mut summary = WriteSummary::default();

    upsert_clients(tx.as_mut(), &result.clients, &mut client_ids, &mut summary).await?;
    upsert_messages(tx.as_mut(), &result.messages, &client_ids, &mut summary).await?;
    upsert_opportunities(tx.as_mut(), &result.opportunities, &client_ids, &mut summary).await?;

    tx.commit().await.map_err(PersistenceError::Commit)?;
    info!(?summary, "sync transaction committed");
    Ok(summary)
}

async fn upsert_clients(
    tx: &mut (dyn SyncTransaction + '_),
    clients: &[Client],
    client_ids: &mut ClientIdMap,
    summary: &mut WriteSummary,
) -> Result<(), PersistenceError> {
    for client in clients {
        let id = tx
            .upsert_client(client)
            .await
            .map_err(|source| PersistenceError::Upsert {
                kind: EndpointKind::Clients,
                external_id: client.external_id.clone(),
                source,
            })?;
        client_ids.insert(client.external_id.clone(), id);
        summary.clients_upserted += 1;
    }
    Ok(())
}

async fn upsert_messages(
    tx: &mut (dyn SyncTransaction + '_),
    messages: &[Message],
    client_ids: &ClientIdMap,
    summary: &mut WriteSummary,
) -> Result<(), PersistenceError> {
    for message in messages {
        let Some(&client_id) = client_ids.get(&message.client_external_id) else {
            warn!(
                message = %message.external_id,
                client = %message.client_external_id,
                "skipping message: client not found"
            );
            summary.messages_skipped += 1;
            continue;
        };
        tx.upsert_message(client_id, message)
            .await
            .map_err(|source| PersistenceError::Upsert {
                kind: EndpointKind::Messages,
                external_id: message.external_id.clone(),
                source,
            })?;
        summary.messages_upserted += 1;
    }
    Ok(())
}

async fn upsert_opportunities(
    tx: &mut (dyn SyncTransaction + '_),
    opportunities: &[Opportunity],
    client_ids: &ClientIdMap,
    summary: &mut WriteSummary,
) -> Result<(), PersistenceError> {
    for opportunity in opportunities {
        let Some(&client_id) = client_ids.get(&opportunity.client_external_id) else {
            warn!(
                opportunity = %opportunity.external_id,
                client = %opportunity.client_external_id,
                "skipping opportunity: client not found"
            );
            summary.opportunities_skipped += 1;
            continue;
        };
        tx.upsert_opportunity(client_id, opportunity)
            .await
            .map_err(|source| PersistenceError::Upsert {
                kind: EndpointKind::Opportunities,
                external_id: opportunity.external_id.clone(),
                source,
            })?;
        summary.opportunities_upserted += 1;
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PgSyncStore {
    pool: PgPool,
}

impl PgSyncStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await
            .context("connecting to database")?;
        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .context("pinging database")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("applying database migrations")?;
        debug!("database migrations applied");
        Ok(())
    }
}

#[async_trait]
impl SyncStore for PgSyncStore {
    async fn begin<'a>(&'a self) -> Result<Box<dyn SyncTransaction + 'a>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgSyncTransaction { tx }))
    }
}

struct PgSyncTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl SyncTransaction for PgSyncTransaction {
    async fn upsert_client(&mut self, client: &Client) -> Result<Uuid, StoreError> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO clients (external_id, name, raw_json)
            VALUES ($1, $2, $3)
            ON CONFLICT (external_id) DO UPDATE SET
                name = EXCLUDED.name,
                raw_json = EXCLUDED.raw_json,
                updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(client.external_id.as_str())
        .bind(client.name.as_deref())
        .bind(&client.raw)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(id)
    }

    async fn upsert_message(&mut self, client_id: Uuid, message: &Message) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO messages (client_id, external_id, body, raw_json)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (client_id, external_id) DO UPDATE SET
                body = EXCLUDED.body,
                raw_json = EXCLUDED.raw_json,
                updated_at = NOW()
            "#,
        )
        .bind(client_id)
        .bind(message.external_id.as_str())
        .bind(message.body.as_deref())
        .bind(&message.raw)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn upsert_opportunity(
        &mut self,
        client_id: Uuid,
        opportunity: &Opportunity,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sales_opportunities (client_id, external_id, raw_json)
            VALUES ($1, $2, $3)
            ON CONFLICT (client_id, external_id) DO UPDATE SET
                raw_json = EXCLUDED.raw_json,
                updated_at = NOW()
            "#,
        )
        .bind(client_id)
        .bind(opportunity.external_id.as_str())
        .bind(&opportunity.raw)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientRow {
    pub id: Uuid,
    pub external_id: ExternalId,
    pub name: Option<String>,
    pub raw_json: JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageRow {
    pub id: Uuid,
    pub client_id: Uuid,
    pub external_id: ExternalId,
    pub body: Option<String>,
    pub raw_json: JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpportunityRow {
    pub id: Uuid,
    pub client_id: Uuid,
    pub external_id: ExternalId,
    pub raw_json: JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Table contents of a [`MemorySyncStore`], keyed the way the Postgres unique constraints are.
#[derive(Debug, Clone, Default)]
pub struct MemoryTables {
    pub clients: HashMap<ExternalId, ClientRow>,
    pub messages: HashMap<(Uuid, ExternalId), MessageRow>,
    pub opportunities: HashMap<(Uuid, ExternalId), OpportunityRow>,
}

/// In-process store with the same upsert semantics as the Postgres schema. Backs dry runs.
///
/// A transaction works on a private copy of the tables that replaces the shared copy on commit.
#[derive(Debug, Clone, Default)]
pub struct MemorySyncStore {
    tables: Arc<Mutex<MemoryTables>>,
    #[cfg(test)]
    fail_on: Option<(EndpointKind, ExternalId)>,
}

impl MemorySyncStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every upsert of the given record fail, for exercising rollback.
    #[cfg(test)]
    fn failing_on(mut self, kind: EndpointKind, external_id: impl Into<ExternalId>) -> Self {
        self.fail_on = Some((kind, external_id.into()));
        self
    }

    pub fn snapshot(&self) -> MemoryTables {
        self.tables
            .lock()
            .map(|tables| tables.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

#[async_trait]
impl SyncStore for MemorySyncStore {
    async fn begin<'a>(&'a self) -> Result<Box<dyn SyncTransaction + 'a>, StoreError> {
        Ok(Box::new(MemorySyncTransaction {
            store: self,
            working: self.snapshot(),
        }))
    }
}

struct MemorySyncTransaction<'a> {
    store: &'a MemorySyncStore,
    working: MemoryTables,
}

impl MemorySyncTransaction<'_> {
    #[cfg(not(test))]
    fn check_injected_failure(&self, _kind: EndpointKind, _id: &ExternalId) -> Result<(), StoreError> {
        Ok(())
    }

    #[cfg(test)]
    fn check_injected_failure(&self, kind: EndpointKind, id: &ExternalId) -> Result<(), StoreError> {
        match &self.store.fail_on {
            Some((fail_kind, fail_id)) if *fail_kind == kind && fail_id == id => Err(
                StoreError::Message(format!("injected failure for {kind} {id}")),
            ),
            _ => Ok(()),
        }
    }

    fn client_exists(&self, client_id: Uuid) -> Result<(), StoreError> {
        if self.working.clients.values().any(|row| row.id == client_id) {
            Ok(())
        } else {
            Err(StoreError::Message(format!(
                "foreign key violation: no client row {client_id}"
            )))
        }
    }
}

#[async_trait]
impl SyncTransaction for MemorySyncTransaction<'_> {
    async fn upsert_client(&mut self, client: &Client) -> Result<Uuid, StoreError> {
        self.check_injected_failure(EndpointKind::Clients, &client.external_id)?;
        let now = Utc::now();
        let row = self
            .working
            .clients
            .entry(client.external_id.clone())
            .and_modify(|row| {
                row.name = client.name.clone();
                row.raw_json = client.raw.clone();
                row.updated_at = now;
            })
            .or_insert_with(|| ClientRow {
                id: Uuid::new_v4(),
                external_id: client.external_id.clone(),
                name: client.name.clone(),
                raw_json: client.raw.clone(),
                created_at: now,
                updated_at: now,
            });
        Ok(row.id)
    }

    async fn upsert_message(&mut self, client_id: Uuid, message: &Message) -> Result<(), StoreError> {
        self.check_injected_failure(EndpointKind::Messages, &message.external_id)?;
        self.client_exists(client_id)?;
        let now = Utc::now();
        self.working
            .messages
            .entry((client_id, message.external_id.clone()))
            .and_modify(|row| {
                row.body = message.body.clone();
                row.raw_json = message.raw.clone();
                row.updated_at = now;
            })
            .or_insert_with(|| MessageRow {
                id: Uuid::new_v4(),
                client_id,
                external_id: message.external_id.clone(),
                body: message.body.clone(),
                raw_json: message.raw.clone(),
                created_at: now,
                updated_at: now,
            });
        Ok(())
    }

    async fn upsert_opportunity(
        &mut self,
        client_id: Uuid,
        opportunity: &Opportunity,
    ) -> Result<(), StoreError> {
        self.check_injected_failure(EndpointKind::Opportunities, &opportunity.external_id)?;
        self.client_exists(client_id)?;
        let now = Utc::now();
        self.working
            .opportunities
            .entry((client_id, opportunity.external_id.clone()))
            .and_modify(|row| {
                row.raw_json = opportunity.raw.clone();
                row.updated_at = now;
            })
            .or_insert_with(|| OpportunityRow {
                id: Uuid::new_v4(),
                client_id,
                external_id: opportunity.external_id.clone(),
                raw_json: opportunity.raw.clone(),
                created_at: now,
                updated_at: now,
            });
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemorySyncTransaction { store, working } = *self;
        let mut shared = store
            .tables
            .lock()
            .map_err(|_| StoreError::Message("memory store lock poisoned".to_string()))?;
        *shared = working;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client(id: &str, name: &str) -> Client {
        Client {
            external_id: id.into(),
            name: Some(name.to_string()),
            raw: json!({"id": id, "name": name}),
        }
    }

    fn message(id: &str, client_id: &str, body: Option<&str>) -> Message {
        Message {
            external_id: id.into(),
            client_external_id: client_id.into(),
            body: body.map(str::to_string),
            raw: json!({"id": id, "client_id": client_id, "body": body}),
        }
    }

    fn opportunity(id: &str, client_id: &str) -> Opportunity {
        Opportunity {
            external_id: id.into(),
            client_external_id: client_id.into(),
            raw: json!({"id": id, "client_id": client_id}),
        }
    }

    fn result_with(
        clients: Vec<Client>,
        messages: Vec<Message>,
        opportunities: Vec<Opportunity>,
    ) -> FetchResult {
        FetchResult {
            clients,
            messages,
            opportunities,
            ..FetchResult::default()
        }
    }

    #[tokio::test]
    async fn client_and_message_land_linked() {
        let store = MemorySyncStore::new();
        let result = result_with(
            vec![client("c1", "Alice")],
            vec![message("m1", "c1", Some("hi"))],
            vec![],
        );

        let summary = write_sync(&store, &result).await.unwrap();
        assert_eq!(summary.clients_upserted, 1);
        assert_eq!(summary.messages_upserted, 1);

        let tables = store.snapshot();
        assert_eq!(tables.clients.len(), 1);
        let client_row = &tables.clients[&ExternalId::from("c1")];
        assert_eq!(tables.messages.len(), 1);
        let message_row = tables.messages.values().next().unwrap();
        assert_eq!(message_row.client_id, client_row.id);
        assert_eq!(message_row.body.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn rerun_updates_in_place() {
        let store = MemorySyncStore::new();
        let first = result_with(
            vec![client("c1", "Alice")],
            vec![message("m1", "c1", Some("hi"))],
            vec![],
        );
        write_sync(&store, &first).await.unwrap();
        let before = store.snapshot();

        let second = result_with(
            vec![client("c1", "Alice2")],
            vec![message("m1", "c1", Some("hi"))],
            vec![],
        );
        write_sync(&store, &second).await.unwrap();
        let after = store.snapshot();

        assert_eq!(after.clients.len(), 1);
        assert_eq!(after.messages.len(), 1);
        let row = &after.clients[&ExternalId::from("c1")];
        assert_eq!(row.name.as_deref(), Some("Alice2"));
        assert_eq!(row.id, before.clients[&ExternalId::from("c1")].id);
        assert_eq!(row.created_at, before.clients[&ExternalId::from("c1")].created_at);
    }

    #[tokio::test]
    async fn applying_same_result_twice_is_idempotent() {
        let store = MemorySyncStore::new();
        let result = result_with(
            vec![client("c1", "Alice"), client("c2", "Bram")],
            vec![message("m1", "c1", Some("hi")), message("m2", "c2", None)],
            vec![opportunity("o1", "c2")],
        );
        write_sync(&store, &result).await.unwrap();
        let once = store.snapshot();
        write_sync(&store, &result).await.unwrap();
        let twice = store.snapshot();

        assert_eq!(once.clients.len(), twice.clients.len());
        assert_eq!(once.messages.len(), twice.messages.len());
        assert_eq!(once.opportunities.len(), twice.opportunities.len());
        for (key, row) in &once.clients {
            let again = &twice.clients[key];
            assert_eq!((row.id, &row.name, &row.raw_json), (again.id, &again.name, &again.raw_json));
        }
        for (key, row) in &once.messages {
            let again = &twice.messages[key];
            assert_eq!((row.id, &row.body, &row.raw_json), (again.id, &again.body, &again.raw_json));
        }
        for (key, row) in &once.opportunities {
            let again = &twice.opportunities[key];
            assert_eq!(
                (row.id, row.client_id, &row.raw_json, row.created_at),
                (again.id, again.client_id, &again.raw_json, again.created_at)
            );
        }
        assert_eq!(twice.opportunities.len(), 1);
    }

    #[tokio::test]
    async fn unresolved_owners_are_dropped_and_run_continues() {
        let store = MemorySyncStore::new();
        let result = result_with(
            vec![client("c1", "Alice")],
            vec![message("m2", "c-missing", None), message("m3", "c1", Some("ok"))],
            vec![opportunity("o1", "c-missing"), opportunity("o2", "c1")],
        );

        let summary = write_sync(&store, &result).await.unwrap();
        assert_eq!(summary.messages_skipped, 1);
        assert_eq!(summary.opportunities_skipped, 1);
        let tables = store.snapshot();
        assert_eq!(tables.messages.len(), 1);
        assert!(tables.messages.keys().all(|(_, id)| id.as_str() == "m3"));
        assert_eq!(tables.opportunities.len(), 1);
    }

    #[tokio::test]
    async fn message_with_no_clients_at_all_inserts_nothing() {
        let store = MemorySyncStore::new();
        let result = result_with(vec![], vec![message("m2", "c-missing", None)], vec![]);
        let summary = write_sync(&store, &result).await.unwrap();
        assert_eq!(summary.messages_upserted, 0);
        assert!(store.snapshot().messages.is_empty());
    }

    #[tokio::test]
    async fn owners_resolve_only_against_current_run() {
        let store = MemorySyncStore::new();
        write_sync(&store, &result_with(vec![client("c1", "Alice")], vec![], vec![]))
            .await
            .unwrap();

        let summary = write_sync(
            &store,
            &result_with(vec![], vec![message("m1", "c1", Some("late"))], vec![]),
        )
        .await
        .unwrap();
        assert_eq!(summary.messages_skipped, 1);
        assert!(store.snapshot().messages.is_empty());
    }

    #[tokio::test]
    async fn failed_upsert_rolls_back_whole_run() {
        let seeded = MemorySyncStore::new();
        write_sync(&seeded, &result_with(vec![client("c0", "Prior")], vec![], vec![]))
            .await
            .unwrap();

        let store = seeded.clone().failing_on(EndpointKind::Opportunities, "o-bad");
        let result = result_with(
            vec![client("c1", "Alice")],
            vec![message("m1", "c1", Some("hi"))],
            vec![opportunity("o-good", "c1"), opportunity("o-bad", "c1")],
        );
        let err = write_sync(&store, &result).await.unwrap_err();
        assert!(err.to_string().contains("upsert opportunities o-bad"));

        let tables = store.snapshot();
        assert_eq!(tables.clients.len(), 1);
        assert!(tables.clients.contains_key(&ExternalId::from("c0")));
        assert!(tables.messages.is_empty());
        assert!(tables.opportunities.is_empty());
    }

    #[tokio::test]
    async fn same_message_id_under_different_clients_is_two_rows() {
        let store = MemorySyncStore::new();
        let result = result_with(
            vec![client("c1", "Alice"), client("c2", "Bram")],
            vec![message("m1", "c1", Some("a")), message("m1", "c2", Some("b"))],
            vec![],
        );
        write_sync(&store, &result).await.unwrap();
        assert_eq!(store.snapshot().messages.len(), 2);
    }
}
