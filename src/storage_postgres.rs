use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_postgres::{Client, NoTls, Row};
use uuid::Uuid;

use crate::error::StorageError;
use crate::storage::{
    DefinitionStore, EventInstanceFilter, InstanceStore, InstanceTransaction,
    ListenerInstanceFilter,
};
use crate::types::{
    AppOption, Audit, EventDefinition, EventDefinitionId, EventInstance, EventInstanceId,
    EventInstanceStatus, EventInstanceStatusBrief, EventListenerBinding, ListenerDefinition,
    ListenerDefinitionId, ListenerInstance, ListenerInstanceId, ListenerInstanceStatus,
    ListenerType, ListenerTypeId,
};

const AUDIT_COLUMNS: &str = "created_by TEXT NOT NULL DEFAULT 'system',
    create_date TIMESTAMPTZ NOT NULL DEFAULT now(),
    modified_by TEXT NOT NULL DEFAULT 'system',
    modify_date TIMESTAMPTZ NOT NULL DEFAULT now(),
    notes TEXT NOT NULL DEFAULT '',
    active BOOLEAN NOT NULL DEFAULT TRUE";

fn schema() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS hook_app_options (
            id BIGSERIAL PRIMARY KEY,
            category TEXT NOT NULL,
            name TEXT NOT NULL,
            value TEXT NOT NULL,
            {audit}
        );
        CREATE TABLE IF NOT EXISTS hook_event_definitions (
            id BIGSERIAL PRIMARY KEY,
            name TEXT NOT NULL,
            {audit}
        );
        CREATE TABLE IF NOT EXISTS hook_listener_types (
            id BIGSERIAL PRIMARY KEY,
            name TEXT NOT NULL,
            location TEXT NOT NULL,
            type_options TEXT NOT NULL DEFAULT '',
            {audit}
        );
        CREATE TABLE IF NOT EXISTS hook_listener_definitions (
            id BIGSERIAL PRIMARY KEY,
            name TEXT NOT NULL,
            url TEXT NOT NULL,
            headers TEXT[] NOT NULL DEFAULT '{{}}',
            timeout_minutes INT4 NOT NULL DEFAULT 1,
            trial_count INT4 NOT NULL DEFAULT 1,
            retrial_delay_minutes INT4 NOT NULL DEFAULT 1,
            listener_type_id BIGINT NOT NULL,
            {audit}
        );
        CREATE TABLE IF NOT EXISTS hook_event_listener_bindings (
            id BIGSERIAL PRIMARY KEY,
            event_definition_id BIGINT NOT NULL,
            listener_definition_id BIGINT NOT NULL,
            {audit}
        );
        CREATE TABLE IF NOT EXISTS hook_event_instances (
            id BIGSERIAL PRIMARY KEY,
            event_definition_id BIGINT NOT NULL,
            business_id UUID NOT NULL,
            event_data TEXT NOT NULL,
            reference_name TEXT NOT NULL DEFAULT '',
            reference_value TEXT NOT NULL DEFAULT '',
            status INT4 NOT NULL,
            group_id INT4 NOT NULL,
            {audit}
        );
        CREATE INDEX IF NOT EXISTS hook_event_instances_business_id
            ON hook_event_instances (business_id);
        CREATE TABLE IF NOT EXISTS hook_listener_instances (
            id BIGSERIAL PRIMARY KEY,
            event_instance_id BIGINT NOT NULL
                REFERENCES hook_event_instances (id) ON DELETE CASCADE,
            listener_definition_id BIGINT NOT NULL,
            status INT4 NOT NULL,
            remaining_trial_count INT4 NOT NULL,
            next_run TIMESTAMPTZ NOT NULL,
            {audit}
        );",
        audit = AUDIT_COLUMNS
    )
}

fn query_err(err: tokio_postgres::Error) -> StorageError {
    StorageError::Query(err.to_string())
}

fn to_i32(value: u32, field: &str) -> Result<i32, StorageError> {
    i32::try_from(value).map_err(|_| StorageError::Query(format!("{} out of range: {}", field, value)))
}

fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn audit(row: &Row) -> Result<Audit, StorageError> {
    Ok(Audit {
        created_by: row.try_get("created_by").map_err(query_err)?,
        create_date: row.try_get("create_date").map_err(query_err)?,
        modified_by: row.try_get("modified_by").map_err(query_err)?,
        modify_date: row.try_get("modify_date").map_err(query_err)?,
        notes: row.try_get("notes").map_err(query_err)?,
        active: row.try_get("active").map_err(query_err)?,
    })
}

fn event_status(bits: i32) -> Result<EventInstanceStatus, StorageError> {
    EventInstanceStatus::from_bits(bits)
        .ok_or_else(|| StorageError::Query(format!("unknown event status {}", bits)))
}

fn listener_status(bits: i32) -> Result<ListenerInstanceStatus, StorageError> {
    ListenerInstanceStatus::from_bits(bits)
        .ok_or_else(|| StorageError::Query(format!("unknown listener status {}", bits)))
}

fn event_instance(row: &Row) -> Result<EventInstance, StorageError> {
    Ok(EventInstance {
        id: EventInstanceId(row.try_get("id").map_err(query_err)?),
        event_definition_id: EventDefinitionId(row.try_get("event_definition_id").map_err(query_err)?),
        business_id: row.try_get("business_id").map_err(query_err)?,
        event_data: row.try_get("event_data").map_err(query_err)?,
        reference_name: row.try_get("reference_name").map_err(query_err)?,
        reference_value: row.try_get("reference_value").map_err(query_err)?,
        status: event_status(row.try_get("status").map_err(query_err)?)?,
        group_id: to_u32(row.try_get("group_id").map_err(query_err)?),
        listener_instances: Vec::new(),
        audit: audit(row)?,
    })
}

fn listener_instance(row: &Row) -> Result<ListenerInstance, StorageError> {
    Ok(ListenerInstance {
        id: ListenerInstanceId(row.try_get("id").map_err(query_err)?),
        event_instance_id: EventInstanceId(row.try_get("event_instance_id").map_err(query_err)?),
        listener_definition_id: ListenerDefinitionId(
            row.try_get("listener_definition_id").map_err(query_err)?,
        ),
        status: listener_status(row.try_get("status").map_err(query_err)?)?,
        remaining_trial_count: row.try_get("remaining_trial_count").map_err(query_err)?,
        next_run: row.try_get("next_run").map_err(query_err)?,
        audit: audit(row)?,
    })
}

fn end_states() -> Vec<i32> {
    [
        EventInstanceStatus::Succeeded,
        EventInstanceStatus::Failed,
        EventInstanceStatus::Aborted,
    ]
    .iter()
    .map(|s| s.bits())
    .collect()
}

fn active_states() -> Vec<i32> {
    [
        ListenerInstanceStatus::InQueue,
        ListenerInstanceStatus::Processing,
        ListenerInstanceStatus::WaitingForRetrial,
    ]
    .iter()
    .map(|s| s.bits())
    .collect()
}

/// PostgreSQL backend.
///
/// One client is shared behind a lock; a transaction holds the lock from
/// `BEGIN` until `COMMIT` or `ROLLBACK`.
pub struct PostgresStorage {
    client: Arc<Mutex<Client>>,
}

impl PostgresStorage {
    /// Wrap `client`, creating the schema when missing.
    pub async fn new(client: Client) -> Result<Self, StorageError> {
        client
            .batch_execute(&schema())
            .await
            .map_err(|err| StorageError::Connection(err.to_string()))?;

        Ok(Self {
            client: Arc::new(Mutex::new(client)),
        })
    }

    /// Connect without TLS and drive the connection on a background task.
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let (client, connection) = tokio_postgres::connect(url, NoTls)
            .await
            .map_err(|err| StorageError::Connection(err.to_string()))?;

        tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::error!(error = %err, "postgres connection closed");
            }
        });

        Self::new(client).await
    }

    async fn query(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Vec<Row>, StorageError> {
        self.client.lock().await.query(sql, params).await.map_err(query_err)
    }

    async fn execute_one(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
        what: String,
    ) -> Result<(), StorageError> {
        let changed = self
            .client
            .lock()
            .await
            .execute(sql, params)
            .await
            .map_err(query_err)?;
        if changed == 0 {
            return Err(StorageError::NotFound(what));
        }
        Ok(())
    }
}

#[async_trait]
impl DefinitionStore for PostgresStorage {
    async fn read_app_options(&self) -> Result<Vec<AppOption>, StorageError> {
        self.query("SELECT * FROM hook_app_options ORDER BY id", &[])
            .await?
            .iter()
            .map(|row| -> Result<AppOption, StorageError> {
                Ok(AppOption {
                    id: row.try_get("id").map_err(query_err)?,
                    category: row.try_get("category").map_err(query_err)?,
                    name: row.try_get("name").map_err(query_err)?,
                    value: row.try_get("value").map_err(query_err)?,
                    audit: audit(row)?,
                })
            })
            .collect()
    }

    async fn read_event_definitions(&self) -> Result<Vec<EventDefinition>, StorageError> {
        self.query("SELECT * FROM hook_event_definitions ORDER BY id", &[])
            .await?
            .iter()
            .map(|row| -> Result<EventDefinition, StorageError> {
                Ok(EventDefinition {
                    id: EventDefinitionId(row.try_get("id").map_err(query_err)?),
                    name: row.try_get("name").map_err(query_err)?,
                    audit: audit(row)?,
                })
            })
            .collect()
    }

    async fn read_listener_types(&self) -> Result<Vec<ListenerType>, StorageError> {
        self.query("SELECT * FROM hook_listener_types ORDER BY id", &[])
            .await?
            .iter()
            .map(|row| -> Result<ListenerType, StorageError> {
                Ok(ListenerType {
                    id: ListenerTypeId(row.try_get("id").map_err(query_err)?),
                    name: row.try_get("name").map_err(query_err)?,
                    location: row.try_get("location").map_err(query_err)?,
                    type_options: row.try_get("type_options").map_err(query_err)?,
                    audit: audit(row)?,
                })
            })
            .collect()
    }

    async fn read_listener_definitions(&self) -> Result<Vec<ListenerDefinition>, StorageError> {
        self.query("SELECT * FROM hook_listener_definitions ORDER BY id", &[])
            .await?
            .iter()
            .map(|row| -> Result<ListenerDefinition, StorageError> {
                Ok(ListenerDefinition {
                    id: ListenerDefinitionId(row.try_get("id").map_err(query_err)?),
                    name: row.try_get("name").map_err(query_err)?,
                    url: row.try_get("url").map_err(query_err)?,
                    headers: row.try_get("headers").map_err(query_err)?,
                    timeout_minutes: to_u32(row.try_get("timeout_minutes").map_err(query_err)?),
                    trial_count: row.try_get("trial_count").map_err(query_err)?,
                    retrial_delay_minutes: to_u32(
                        row.try_get("retrial_delay_minutes").map_err(query_err)?,
                    ),
                    listener_type_id: ListenerTypeId(
                        row.try_get("listener_type_id").map_err(query_err)?,
                    ),
                    audit: audit(row)?,
                })
            })
            .collect()
    }

    async fn read_bindings(&self) -> Result<Vec<EventListenerBinding>, StorageError> {
        self.query("SELECT * FROM hook_event_listener_bindings ORDER BY id", &[])
            .await?
            .iter()
            .map(|row| -> Result<EventListenerBinding, StorageError> {
                Ok(EventListenerBinding {
                    id: row.try_get("id").map_err(query_err)?,
                    event_definition_id: EventDefinitionId(
                        row.try_get("event_definition_id").map_err(query_err)?,
                    ),
                    listener_definition_id: ListenerDefinitionId(
                        row.try_get("listener_definition_id").map_err(query_err)?,
                    ),
                    audit: audit(row)?,
                })
            })
            .collect()
    }
}

/// Open transaction. Dropped without `commit`, it rolls back in the
/// background before releasing the client.
struct PostgresTransaction {
    client: Option<OwnedMutexGuard<Client>>,
}

impl PostgresTransaction {
    fn client(&self) -> Result<&Client, StorageError> {
        self.client
            .as_deref()
            .ok_or_else(|| StorageError::Conflict("transaction already finished".into()))
    }

    async fn finish(mut self: Box<Self>, statement: &str) -> Result<(), StorageError> {
        let client = self
            .client
            .take()
            .ok_or_else(|| StorageError::Conflict("transaction already finished".into()))?;
        client.batch_execute(statement).await.map_err(query_err)
    }
}

impl Drop for PostgresTransaction {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = client.batch_execute("ROLLBACK").await {
                    tracing::warn!(error = %err, "rollback of abandoned transaction failed");
                }
            });
        }
    }
}

#[async_trait]
impl InstanceTransaction for PostgresTransaction {
    async fn create_event_instance(
        &mut self,
        instance: &EventInstance,
    ) -> Result<EventInstance, StorageError> {
        let group_id = to_i32(instance.group_id, "group_id")?;
        let row = self
            .client()?
            .query_one(
                "INSERT INTO hook_event_instances
                    (event_definition_id, business_id, event_data, reference_name,
                     reference_value, status, group_id,
                     created_by, create_date, modified_by, modify_date, notes, active)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                 RETURNING id",
                &[
                    &instance.event_definition_id.0,
                    &instance.business_id,
                    &instance.event_data,
                    &instance.reference_name,
                    &instance.reference_value,
                    &instance.status.bits(),
                    &group_id,
                    &instance.audit.created_by,
                    &instance.audit.create_date,
                    &instance.audit.modified_by,
                    &instance.audit.modify_date,
                    &instance.audit.notes,
                    &instance.audit.active,
                ],
            )
            .await
            .map_err(query_err)?;

        let mut created = instance.clone();
        created.id = EventInstanceId(row.try_get(0).map_err(query_err)?);
        created.listener_instances.clear();
        Ok(created)
    }

    async fn create_listener_instance(
        &mut self,
        instance: &ListenerInstance,
    ) -> Result<ListenerInstance, StorageError> {
        let row = self
            .client()?
            .query_one(
                "INSERT INTO hook_listener_instances
                    (event_instance_id, listener_definition_id, status,
                     remaining_trial_count, next_run,
                     created_by, create_date, modified_by, modify_date, notes, active)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                 RETURNING id",
                &[
                    &instance.event_instance_id.0,
                    &instance.listener_definition_id.0,
                    &instance.status.bits(),
                    &instance.remaining_trial_count,
                    &instance.next_run,
                    &instance.audit.created_by,
                    &instance.audit.create_date,
                    &instance.audit.modified_by,
                    &instance.audit.modify_date,
                    &instance.audit.notes,
                    &instance.audit.active,
                ],
            )
            .await
            .map_err(query_err)?;

        let mut created = instance.clone();
        created.id = ListenerInstanceId(row.try_get(0).map_err(query_err)?);
        Ok(created)
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        self.finish("ROLLBACK").await
    }
}

#[async_trait]
impl InstanceStore for PostgresStorage {
    async fn begin(&self) -> Result<Box<dyn InstanceTransaction>, StorageError> {
        let client = self.client.clone().lock_owned().await;
        client
            .batch_execute("BEGIN")
            .await
            .map_err(|err| StorageError::Connection(err.to_string()))?;
        Ok(Box::new(PostgresTransaction {
            client: Some(client),
        }))
    }

    async fn edit_event_instance(&self, instance: &EventInstance) -> Result<(), StorageError> {
        let group_id = to_i32(instance.group_id, "group_id")?;
        self.execute_one(
            "UPDATE hook_event_instances
             SET status = $2, group_id = $3, modified_by = $4, modify_date = $5,
                 notes = $6, active = $7
             WHERE id = $1",
            &[
                &instance.id.0,
                &instance.status.bits(),
                &group_id,
                &instance.audit.modified_by,
                &instance.audit.modify_date,
                &instance.audit.notes,
                &instance.audit.active,
            ],
            format!("event instance {}", instance.id),
        )
        .await
    }

    async fn edit_listener_instance(&self, instance: &ListenerInstance) -> Result<(), StorageError> {
        self.execute_one(
            "UPDATE hook_listener_instances
             SET status = $2, remaining_trial_count = $3, next_run = $4,
                 modified_by = $5, modify_date = $6, notes = $7, active = $8
             WHERE id = $1",
            &[
                &instance.id.0,
                &instance.status.bits(),
                &instance.remaining_trial_count,
                &instance.next_run,
                &instance.audit.modified_by,
                &instance.audit.modify_date,
                &instance.audit.notes,
                &instance.audit.active,
            ],
            format!("listener instance {}", instance.id),
        )
        .await
    }

    async fn remove_event_instance(&self, id: EventInstanceId) -> Result<(), StorageError> {
        self.execute_one(
            "DELETE FROM hook_event_instances WHERE id = $1",
            &[&id.0],
            format!("event instance {}", id),
        )
        .await
    }

    async fn remove_listener_instance(&self, id: ListenerInstanceId) -> Result<(), StorageError> {
        self.execute_one(
            "DELETE FROM hook_listener_instances WHERE id = $1",
            &[&id.0],
            format!("listener instance {}", id),
        )
        .await
    }

    async fn read_event_instances(
        &self,
        filter: &EventInstanceFilter,
    ) -> Result<Vec<EventInstance>, StorageError> {
        let EventInstanceFilter::NotProcessed { run_date, group_id } = filter;
        let group_id = to_i32(*group_id, "group_id")?;
        let run_date: &DateTime<Utc> = run_date;
        let end = end_states();
        let active = active_states();
        let hold = EventInstanceStatus::Hold.bits();

        let rows = self
            .query(
                "SELECT e.* FROM hook_event_instances e
                 WHERE e.group_id = $1
                   AND e.status <> ALL($2)
                   AND (
                     (e.status <> $5
                      AND NOT EXISTS (SELECT 1 FROM hook_listener_instances l
                                      WHERE l.event_instance_id = e.id
                                        AND l.status = ANY($3)))
                     OR EXISTS (SELECT 1 FROM hook_listener_instances l
                                WHERE l.event_instance_id = e.id
                                  AND l.status = ANY($3)
                                  AND l.next_run <= $4)
                   )
                 ORDER BY e.id",
                &[&group_id, &end, &active, run_date, &hold],
            )
            .await?;

        let mut events = rows.iter().map(event_instance).collect::<Result<Vec<_>, _>>()?;
        if events.is_empty() {
            return Ok(events);
        }

        let ids: Vec<i64> = events.iter().map(|e| e.id.0).collect();
        let mut due: HashMap<EventInstanceId, Vec<ListenerInstance>> = HashMap::new();
        for row in self
            .query(
                "SELECT * FROM hook_listener_instances
                 WHERE event_instance_id = ANY($1)
                   AND status = ANY($2)
                   AND next_run <= $3
                 ORDER BY id",
                &[&ids, &active, run_date],
            )
            .await?
        {
            let listener = listener_instance(&row)?;
            due.entry(listener.event_instance_id).or_default().push(listener);
        }

        for event in &mut events {
            event.listener_instances = due.remove(&event.id).unwrap_or_default();
        }
        Ok(events)
    }

    async fn read_listener_instances(
        &self,
        filter: &ListenerInstanceFilter,
    ) -> Result<Vec<ListenerInstance>, StorageError> {
        let ListenerInstanceFilter::ByEventInstance(id) = filter;
        self.query(
            "SELECT * FROM hook_listener_instances WHERE event_instance_id = $1 ORDER BY id",
            &[&id.0],
        )
        .await?
        .iter()
        .map(listener_instance)
        .collect()
    }

    async fn read_status_by_business_id(
        &self,
        business_id: Uuid,
    ) -> Result<Option<EventInstanceStatusBrief>, StorageError> {
        let rows = self
            .query(
                "SELECT id, business_id, status FROM hook_event_instances
                 WHERE business_id = $1
                 ORDER BY id
                 LIMIT 1",
                &[&business_id],
            )
            .await?;

        rows.first()
            .map(|row| -> Result<EventInstanceStatusBrief, StorageError> {
                Ok(EventInstanceStatusBrief {
                    id: EventInstanceId(row.try_get("id").map_err(query_err)?),
                    business_id: row.try_get("business_id").map_err(query_err)?,
                    status: event_status(row.try_get("status").map_err(query_err)?)?,
                })
            })
            .transpose()
    }
}
