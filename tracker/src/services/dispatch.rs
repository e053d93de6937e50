//! Optimistic remote dispatch
//!
//! Every mutating action is applied locally first, then sent once through
//! the API client. A failed send is queued in the outbox. A successful send,
//! direct or replayed, goes through `confirm`, which swaps in server ids and
//! marks local rows synced.

use crate::api::{
    AddTipRequest, ApiClient, CreateExpenseRequest, EndRideRequest, StartRideRequest,
};
use crate::database::{
    EntityKind, HttpMethod, IdMappings, MutationKind, Outbox, OutboxMeta, Repository,
};
use crate::error::{AppError, Result};
use serde::Serialize;
use serde_json::Value;

/// Which path a mutating action took
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "id", rename_all = "snake_case")]
pub enum Outcome {
    /// The server accepted it; carries the entity's current id
    Confirmed(String),
    /// The call failed; carries the outbox entry id
    Queued(i64),
}

impl Outcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Outcome::Confirmed(_))
    }
}

/// A request plus the metadata needed to replay and remap it
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub method: HttpMethod,
    pub path: String,
    pub body: Value,
    pub meta: OutboxMeta,
}

impl Mutation {
    pub fn shift_create(local_id: &str) -> Self {
        Self {
            method: HttpMethod::Post,
            path: "/v1/shifts".to_string(),
            body: Value::Object(Default::default()),
            meta: OutboxMeta::new(MutationKind::ShiftCreate).with_local_id(local_id),
        }
    }

    pub fn shift_end(shift_id: &str) -> Self {
        Self {
            method: HttpMethod::Patch,
            path: format!("/v1/shifts/{}/end", shift_id),
            body: Value::Object(Default::default()),
            meta: OutboxMeta::new(MutationKind::ShiftEnd).with_shift_id(shift_id),
        }
    }

    pub fn ride_create(local_id: &str, request: &StartRideRequest) -> Result<Self> {
        Ok(Self {
            method: HttpMethod::Post,
            path: "/v1/rides".to_string(),
            body: serde_json::to_value(request)?,
            meta: OutboxMeta::new(MutationKind::RideCreate)
                .with_local_id(local_id)
                .with_shift_id(&request.shift_id),
        })
    }

    pub fn ride_end(ride_id: &str, shift_id: &str, request: &EndRideRequest) -> Result<Self> {
        Ok(Self {
            method: HttpMethod::Patch,
            path: format!("/v1/rides/{}/end", ride_id),
            body: serde_json::to_value(request)?,
            meta: OutboxMeta::new(MutationKind::RideEnd)
                .with_ride_id(ride_id)
                .with_shift_id(shift_id),
        })
    }

    pub fn ride_tip(ride_id: &str, shift_id: &str, tip_cents: i64) -> Result<Self> {
        Ok(Self {
            method: HttpMethod::Post,
            path: format!("/v1/rides/{}/tips", ride_id),
            body: serde_json::to_value(AddTipRequest { tip_cents })?,
            meta: OutboxMeta::new(MutationKind::RideTip)
                .with_ride_id(ride_id)
                .with_shift_id(shift_id),
        })
    }

    pub fn expense_create(local_id: &str, request: &CreateExpenseRequest) -> Result<Self> {
        Ok(Self {
            method: HttpMethod::Post,
            path: "/v1/expenses".to_string(),
            body: serde_json::to_value(request)?,
            meta: OutboxMeta::new(MutationKind::ExpenseCreate).with_local_id(local_id),
        })
    }

    /// Id of the entity this mutation is about
    fn subject_id(&self) -> Option<&str> {
        self.meta
            .local_id
            .as_deref()
            .or(self.meta.ride_id.as_deref())
            .or(self.meta.shift_id.as_deref())
    }
}

/// Server-assigned id in a create response, if any
pub fn server_id(response: &Value) -> Option<String> {
    match response.get("id")? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    repo: Repository,
    ids: IdMappings,
    outbox: Outbox,
    api: ApiClient,
}

impl Dispatcher {
    pub fn new(repo: Repository, ids: IdMappings, outbox: Outbox, api: ApiClient) -> Self {
        Self {
            repo,
            ids,
            outbox,
            api,
        }
    }

    /// Send once; on any remote failure queue the mutation for replay.
    ///
    /// Local storage errors are returned to the caller.
    pub async fn dispatch(&self, mutation: Mutation) -> Result<Outcome> {
        match self
            .api
            .request(mutation.method, &mutation.path, &mutation.body)
            .await
        {
            Ok(response) => {
                let id = self.confirm(&mutation.meta, &response).await?;
                let id = id
                    .or_else(|| mutation.subject_id().map(str::to_string))
                    .unwrap_or_default();
                tracing::info!("{} {} confirmed", mutation.method, mutation.path);
                Ok(Outcome::Confirmed(id))
            }
            Err(e @ AppError::Database(_)) => Err(e),
            Err(e) => {
                tracing::warn!(
                    "{} {} failed, queueing for replay: {}",
                    mutation.method,
                    mutation.path,
                    e
                );
                let entry = self
                    .outbox
                    .enqueue(
                        mutation.method,
                        &mutation.path,
                        &mutation.body,
                        Some(&mutation.meta),
                    )
                    .await?;
                Ok(Outcome::Queued(entry.id))
            }
        }
    }

    /// Apply a successful response: remap created entities and mark synced.
    ///
    /// Returns the current id of the entity the mutation is about.
    pub async fn confirm(&self, meta: &OutboxMeta, response: &Value) -> Result<Option<String>> {
        let Some(kind) = meta.kind else {
            return Ok(None);
        };

        match kind {
            MutationKind::ShiftCreate | MutationKind::RideCreate => {
                let Some(local_id) = meta.local_id.as_deref() else {
                    return Ok(None);
                };
                let entity = if kind == MutationKind::ShiftCreate {
                    EntityKind::Shift
                } else {
                    EntityKind::Ride
                };
                let current = self.remap(entity, local_id, server_id(response)).await?;
                match entity {
                    EntityKind::Shift => self.repo.mark_shift_synced(&current).await?,
                    _ => self.repo.mark_ride_synced(&current).await?,
                }
                Ok(Some(current))
            }
            MutationKind::ExpenseCreate => {
                let Some(local_id) = meta.local_id.as_deref() else {
                    return Ok(None);
                };
                let receipt_url = response.get("receipt_url").and_then(Value::as_str);
                let current = match self.ids.resolve(local_id).await? {
                    Some(already) => {
                        tracing::warn!(
                            "Expense {} was already confirmed as {}",
                            local_id,
                            already
                        );
                        already
                    }
                    None => {
                        let server = server_id(response);
                        self.repo
                            .mark_expense_synced(local_id, server.as_deref(), receipt_url)
                            .await?
                            .id
                    }
                };
                Ok(Some(current))
            }
            MutationKind::ShiftEnd => {
                let Some(shift_id) = meta.shift_id.as_deref() else {
                    return Ok(None);
                };
                let shift_id = self.ids.current(shift_id).await?;
                self.repo.mark_shift_synced(&shift_id).await?;
                Ok(Some(shift_id))
            }
            MutationKind::RideEnd | MutationKind::RideTip => {
                if let Some(shift_id) = meta.shift_id.as_deref() {
                    let shift_id = self.ids.current(shift_id).await?;
                    self.repo.mark_shift_synced(&shift_id).await?;
                }
                let Some(ride_id) = meta.ride_id.as_deref() else {
                    return Ok(None);
                };
                let ride_id = self.ids.current(ride_id).await?;
                self.repo.mark_ride_synced(&ride_id).await?;
                Ok(Some(ride_id))
            }
        }
    }

    /// Swap a local id for the server's. A local id that was already
    /// remapped keeps its first mapping.
    async fn remap(
        &self,
        entity: EntityKind,
        local_id: &str,
        server_id: Option<String>,
    ) -> Result<String> {
        if let Some(already) = self.ids.resolve(local_id).await? {
            if server_id.as_deref() != Some(already.as_str()) {
                tracing::warn!(
                    "{} {} was already confirmed as {}, ignoring duplicate create",
                    entity,
                    local_id,
                    already
                );
            }
            return Ok(already);
        }

        match server_id {
            Some(server_id) => {
                self.repo.replace_id(entity, local_id, &server_id).await?;
                Ok(server_id)
            }
            None => {
                tracing::warn!("Create response for {} {} carried no id", entity, local_id);
                Ok(local_id.to_string())
            }
        }
    }
}
