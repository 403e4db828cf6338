//! The host-facing surface.
//!
//! A host framework drives reconciliations through JSON state documents and
//! a resource type name. [`ResourceHandler`] is the object-safe face of an
//! [`Engine`], and [`ProviderRegistry`] dispatches each call to the handler
//! registered for its resource type.
//!
//! State documents are the model's JSON object plus an `id` attribute holding
//! the canonical resource id (absent or null before creation):
//!
//! ```text
//! {"id": "/subscriptions/.../resourceGroups/rg1/widgets/w1", "name": "w1", ...}
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, instrument};

use crate::codec::ResourceCodec;
use crate::context::OperationContext;
use crate::drift::PlanResult;
use crate::engine::{Engine, ManagedResource, ReadOutcome, UpdateOptions};
use crate::error::ReconcileError;
use crate::resource_id::ResourceId;

const ID_ATTRIBUTE: &str = "id";

/// Reconciliation entry points for one resource type, over JSON state.
#[async_trait]
pub trait ResourceHandler: Send + Sync + 'static {
    /// The resource type this handler serves.
    fn resource_type(&self) -> &str;

    /// Compare a proposed state with the prior state.
    fn plan(
        &self,
        prior_state: Option<Value>,
        proposed_state: Value,
    ) -> Result<PlanResult, ReconcileError>;

    /// Create a resource and return its state.
    ///
    /// If the remote object was created but the call still failed, the error
    /// is [`ReconcileError::Incomplete`] and carries the state to record.
    async fn create(
        &self,
        ctx: &OperationContext,
        planned_state: Value,
    ) -> Result<Value, ReconcileError>;

    /// Refresh a resource. `None` means it no longer exists.
    async fn read(
        &self,
        ctx: &OperationContext,
        current_state: Value,
    ) -> Result<Option<Value>, ReconcileError>;

    /// Update a resource and return its new state.
    async fn update(
        &self,
        ctx: &OperationContext,
        prior_state: Value,
        planned_state: Value,
        options: UpdateOptions,
    ) -> Result<Value, ReconcileError>;

    /// Delete a resource.
    async fn delete(&self, ctx: &OperationContext, current_state: Value)
        -> Result<(), ReconcileError>;

    /// Adopt an existing resource by id and return its state.
    async fn import(&self, ctx: &OperationContext, id: &str) -> Result<Value, ReconcileError>;
}

/// Split a state document into its id and model.
pub fn decode_state<M: DeserializeOwned>(
    mut state: Value,
) -> Result<(Option<ResourceId>, M), ReconcileError> {
    if !state.is_object() {
        return Err(ReconcileError::InvalidState(format!(
            "expected an object, got {}",
            state
        )));
    }

    let raw_id = state
        .as_object_mut()
        .and_then(|map| map.remove(ID_ATTRIBUTE));
    let id = match raw_id {
        None | Some(Value::Null) => None,
        Some(Value::String(raw)) => Some(ResourceId::parse(&raw)?),
        Some(other) => {
            return Err(ReconcileError::InvalidState(format!(
                "id must be a string, got {}",
                other
            )))
        }
    };

    let model = serde_json::from_value(state)?;
    Ok((id, model))
}

/// Join an id and a model into a state document.
pub fn encode_state<M: Serialize>(
    id: Option<&ResourceId>,
    model: &M,
) -> Result<Value, ReconcileError> {
    let mut state = serde_json::to_value(model)?;
    let Value::Object(map) = &mut state else {
        return Err(ReconcileError::InvalidState(
            "model must serialize to an object".to_string(),
        ));
    };
    map.insert(
        ID_ATTRIBUTE.to_string(),
        id.map(|id| Value::String(id.to_string()))
            .unwrap_or(Value::Null),
    );
    Ok(state)
}

#[async_trait]
impl<C: ResourceCodec> ResourceHandler for Engine<C> {
    fn resource_type(&self) -> &str {
        self.codec().resource_type()
    }

    fn plan(
        &self,
        prior_state: Option<Value>,
        proposed_state: Value,
    ) -> Result<PlanResult, ReconcileError> {
        let (_, proposed) = decode_state::<C::Model>(proposed_state)?;

        let resource = match prior_state {
            None | Some(Value::Null) => ManagedResource::new(proposed),
            Some(prior) => match decode_state::<C::Model>(prior)? {
                (Some(id), prior) => ManagedResource::existing(id, proposed).with_observed(prior),
                (None, _) => ManagedResource::new(proposed),
            },
        };

        let mut plan = Engine::plan(self, &resource)?;
        if let Value::Object(map) = &mut plan.planned_state {
            let id = if plan.requires_replace {
                None
            } else {
                resource.id()
            };
            map.insert(
                ID_ATTRIBUTE.to_string(),
                id.map(|id| Value::String(id.to_string()))
                    .unwrap_or(Value::Null),
            );
        }
        Ok(plan)
    }

    async fn create(
        &self,
        ctx: &OperationContext,
        planned_state: Value,
    ) -> Result<Value, ReconcileError> {
        let (_, desired) = decode_state::<C::Model>(planned_state)?;
        let mut resource = ManagedResource::new(desired);
        if let Err(err) = Engine::create(self, ctx, &mut resource).await {
            return Err(match resource.id() {
                Some(id) => ReconcileError::Incomplete {
                    state: Box::new(encode_state(Some(id), resource.desired())?),
                    source: err,
                },
                None => err.into(),
            });
        }
        encode_state(
            resource.id(),
            resource.observed().unwrap_or(resource.desired()),
        )
    }

    async fn read(
        &self,
        ctx: &OperationContext,
        current_state: Value,
    ) -> Result<Option<Value>, ReconcileError> {
        let (id, desired) = decode_state::<C::Model>(current_state)?;
        let Some(id) = id else {
            return Err(ReconcileError::InvalidState(
                "cannot read a resource without an id".to_string(),
            ));
        };

        let mut resource = ManagedResource::existing(id, desired);
        match Engine::read(self, ctx, &mut resource).await? {
            ReadOutcome::Found(observed) => Ok(Some(encode_state(resource.id(), &observed)?)),
            ReadOutcome::Gone => Ok(None),
        }
    }

    async fn update(
        &self,
        ctx: &OperationContext,
        prior_state: Value,
        planned_state: Value,
        options: UpdateOptions,
    ) -> Result<Value, ReconcileError> {
        let (id, prior) = decode_state::<C::Model>(prior_state)?;
        let (_, desired) = decode_state::<C::Model>(planned_state)?;
        let Some(id) = id else {
            return Err(ReconcileError::InvalidState(
                "cannot update a resource without an id".to_string(),
            ));
        };

        let mut resource = ManagedResource::existing(id, prior.clone()).with_observed(prior);
        let observed = Engine::update(self, ctx, &mut resource, desired, options).await?;
        encode_state(resource.id(), &observed)
    }

    async fn delete(
        &self,
        ctx: &OperationContext,
        current_state: Value,
    ) -> Result<(), ReconcileError> {
        let (id, model) = decode_state::<C::Model>(current_state)?;
        let Some(id) = id else {
            return Ok(());
        };
        let mut resource = ManagedResource::existing(id, model);
        Engine::delete(self, ctx, &mut resource).await?;
        Ok(())
    }

    async fn import(&self, ctx: &OperationContext, id: &str) -> Result<Value, ReconcileError> {
        let resource = Engine::import(self, ctx, id).await?;
        encode_state(resource.id(), resource.desired())
    }
}

/// Dispatches host calls to the handler for each resource type.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    handlers: HashMap<String, Arc<dyn ResourceHandler>>,
}

impl ProviderRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its resource type, replacing any previous one.
    pub fn with_handler(mut self, handler: impl ResourceHandler) -> Self {
        self.register(Arc::new(handler));
        self
    }

    /// Register a shared handler under its resource type.
    pub fn register(&mut self, handler: Arc<dyn ResourceHandler>) {
        let resource_type = handler.resource_type().to_string();
        debug!(resource_type = %resource_type, "registering handler");
        self.handlers.insert(resource_type, handler);
    }

    /// Registered resource types, sorted.
    pub fn resource_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    /// The handler for `resource_type`.
    pub fn handler(&self, resource_type: &str) -> Result<&Arc<dyn ResourceHandler>, ReconcileError> {
        self.handlers
            .get(resource_type)
            .ok_or_else(|| ReconcileError::UnknownResource(resource_type.to_string()))
    }

    /// Plan changes for a resource.
    #[instrument(skip(self, prior_state, proposed_state), name = "host.plan")]
    pub fn plan(
        &self,
        resource_type: &str,
        prior_state: Option<Value>,
        proposed_state: Value,
    ) -> Result<PlanResult, ReconcileError> {
        let result = self
            .handler(resource_type)?
            .plan(prior_state, proposed_state);
        log_result(resource_type, "Plan", &result);
        result
    }

    /// Create a resource.
    #[instrument(skip(self, ctx, planned_state), name = "host.create")]
    pub async fn create(
        &self,
        ctx: &OperationContext,
        resource_type: &str,
        planned_state: Value,
    ) -> Result<Value, ReconcileError> {
        info!(resource_type = %resource_type, "Create called");
        let result = self
            .handler(resource_type)?
            .create(ctx, planned_state)
            .await;
        log_result(resource_type, "Create", &result);
        result
    }

    /// Refresh a resource. `None` means it no longer exists.
    #[instrument(skip(self, ctx, current_state), name = "host.read")]
    pub async fn read(
        &self,
        ctx: &OperationContext,
        resource_type: &str,
        current_state: Value,
    ) -> Result<Option<Value>, ReconcileError> {
        debug!(resource_type = %resource_type, "Read called");
        let result = self
            .handler(resource_type)?
            .read(ctx, current_state)
            .await;
        log_result(resource_type, "Read", &result);
        result
    }

    /// Update a resource.
    #[instrument(skip(self, ctx, prior_state, planned_state), name = "host.update")]
    pub async fn update(
        &self,
        ctx: &OperationContext,
        resource_type: &str,
        prior_state: Value,
        planned_state: Value,
        options: UpdateOptions,
    ) -> Result<Value, ReconcileError> {
        info!(resource_type = %resource_type, "Update called");
        let result = self
            .handler(resource_type)?
            .update(ctx, prior_state, planned_state, options)
            .await;
        log_result(resource_type, "Update", &result);
        result
    }

    /// Delete a resource.
    #[instrument(skip(self, ctx, current_state), name = "host.delete")]
    pub async fn delete(
        &self,
        ctx: &OperationContext,
        resource_type: &str,
        current_state: Value,
    ) -> Result<(), ReconcileError> {
        info!(resource_type = %resource_type, "Delete called");
        let result = self
            .handler(resource_type)?
            .delete(ctx, current_state)
            .await;
        log_result(resource_type, "Delete", &result);
        result
    }

    /// Import an existing resource.
    #[instrument(skip(self, ctx), name = "host.import")]
    pub async fn import(
        &self,
        ctx: &OperationContext,
        resource_type: &str,
        id: &str,
    ) -> Result<Value, ReconcileError> {
        info!(resource_type = %resource_type, "Import called");
        let result = self.handler(resource_type)?.import(ctx, id).await;
        log_result(resource_type, "Import", &result);
        result
    }
}

fn log_result<T>(resource_type: &str, operation: &str, result: &Result<T, ReconcileError>) {
    match result {
        Ok(_) => debug!(resource_type = %resource_type, "{} completed successfully", operation),
        Err(e) => error!(resource_type = %resource_type, error = %e, "{} failed", operation),
    }
}
