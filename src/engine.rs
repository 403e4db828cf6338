//! The per-resource reconciliation state machine.
//!
//! An [`Engine`] ties one resource type's [`ResourceCodec`] to a shared
//! [`ArmClient`] and drives a [`ManagedResource`] through its lifecycle:
//!
//! ```text
//! Absent -> Creating -> Present -> Updating -> Present -> Deleting -> Absent
//! ```
//!
//! The resource's id is set exactly while the resource exists remotely as far
//! as the engine knows. A failed create leaves it unset, a failed update or
//! delete leaves it untouched, and a read that finds nothing clears it.
//!
//! # Example
//!
//! ```ignore
//! let engine = Engine::new(client, WidgetCodec, EngineConfig::new("0000"));
//! let ctx = OperationContext::new();
//!
//! let mut widget = ManagedResource::new(Widget::new("w1", "rg1", "East US"));
//! engine.create(&ctx, &mut widget).await?;
//!
//! match engine.read(&ctx, &mut widget).await? {
//!     ReadOutcome::Found(observed) => println!("{:?}", observed),
//!     ReadOutcome::Gone => println!("deleted out of band"),
//! }
//!
//! engine.delete(&ctx, &mut widget).await?;
//! ```

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::client::ArmClient;
use crate::codec::{Activity, ResourceCodec};
use crate::config::EngineConfig;
use crate::context::OperationContext;
use crate::drift::{detect_drift, AttributeChange, PlanResult};
use crate::error::{
    CodecError, CreateError, CreateErrorKind, DeleteError, DeleteErrorKind, PollError, ReadError,
    ReadErrorKind, UpdateError, UpdateErrorKind,
};
use crate::lro::{OperationHandle, OperationKind, PendingOperation, Poller, TerminalResult};
use crate::resource_id::ResourceId;
use crate::wait::StateWaiter;

/// Where a [`ManagedResource`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourcePhase {
    /// Not created, or known to be gone.
    Absent,
    /// A create is running.
    Creating,
    /// Exists remotely.
    Present,
    /// An update is running.
    Updating,
    /// A delete is running.
    Deleting,
}

/// A resource under management.
#[derive(Debug, Clone)]
pub struct ManagedResource<M> {
    desired: M,
    observed: Option<M>,
    id: Option<ResourceId>,
    phase: ResourcePhase,
}

impl<M> ManagedResource<M> {
    /// A resource that has not been created yet.
    pub fn new(desired: M) -> Self {
        Self {
            desired,
            observed: None,
            id: None,
            phase: ResourcePhase::Absent,
        }
    }

    /// A resource the host already manages under `id`.
    pub fn existing(id: ResourceId, desired: M) -> Self {
        Self {
            desired,
            observed: None,
            id: Some(id),
            phase: ResourcePhase::Present,
        }
    }

    /// Attach a previously observed state.
    pub fn with_observed(mut self, observed: M) -> Self {
        self.observed = Some(observed);
        self
    }

    /// The desired state.
    pub fn desired(&self) -> &M {
        &self.desired
    }

    /// The last state read back from the API.
    pub fn observed(&self) -> Option<&M> {
        self.observed.as_ref()
    }

    /// The durable id, set while the resource exists.
    pub fn id(&self) -> Option<&ResourceId> {
        self.id.as_ref()
    }

    /// The lifecycle phase.
    pub fn phase(&self) -> ResourcePhase {
        self.phase
    }

    /// Whether the resource exists remotely.
    pub fn is_present(&self) -> bool {
        self.id.is_some()
    }

    fn clear(&mut self) {
        self.id = None;
        self.observed = None;
        self.phase = ResourcePhase::Absent;
    }

    fn settle(&mut self) {
        self.phase = if self.id.is_some() {
            ResourcePhase::Present
        } else {
            ResourcePhase::Absent
        };
    }
}

/// Result of a read.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome<M> {
    /// The resource exists; this is its observed state.
    Found(M),
    /// The resource no longer exists and has been marked absent.
    Gone,
}

impl<M> ReadOutcome<M> {
    /// Whether the resource was gone.
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Gone)
    }
}

/// Caller choices for an update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Cancel a mutation that is still running instead of failing.
    pub force_cancel_in_flight: bool,
}

impl UpdateOptions {
    /// Cancel in-flight mutations before updating.
    pub fn forced() -> Self {
        Self {
            force_cancel_in_flight: true,
        }
    }
}

/// Reconciles resources of one type against the remote API.
pub struct Engine<C: ResourceCodec> {
    client: Arc<dyn ArmClient>,
    codec: C,
    poller: Poller,
    config: EngineConfig,
}

impl<C: ResourceCodec> Engine<C> {
    /// Create an engine.
    pub fn new(client: Arc<dyn ArmClient>, codec: C, config: EngineConfig) -> Self {
        Self {
            client,
            codec,
            poller: Poller::new(config.polling.clone()),
            config,
        }
    }

    /// The codec.
    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// The configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The shared client.
    pub fn client(&self) -> &Arc<dyn ArmClient> {
        &self.client
    }

    /// The natural id of a desired resource.
    pub fn natural_id(&self, desired: &C::Model) -> ResourceId {
        self.codec
            .resource_id(&self.config.subscription_id, desired)
    }

    /// Create the resource and record its id.
    #[instrument(skip_all, name = "engine.create", fields(resource_type = %self.codec.resource_type()))]
    pub async fn create(
        &self,
        ctx: &OperationContext,
        resource: &mut ManagedResource<C::Model>,
    ) -> Result<ResourceId, CreateError> {
        let target = self.natural_id(&resource.desired);

        if let Some(id) = &resource.id {
            return Err(CreateError {
                target: target.to_string(),
                kind: CreateErrorKind::AlreadyManaged(id.to_string()),
            });
        }

        debug!(target = %target, "create called");
        let ctx = ctx.child_with_timeout(self.config.timeouts.create);
        resource.phase = ResourcePhase::Creating;

        match self.create_inner(&ctx, resource, &target).await {
            Ok(id) => {
                info!(id = %id, "create completed successfully");
                Ok(id)
            }
            Err(kind) => {
                resource.settle();
                error!(target = %target, error = %kind, "create failed");
                Err(CreateError {
                    target: target.to_string(),
                    kind,
                })
            }
        }
    }

    async fn create_inner(
        &self,
        ctx: &OperationContext,
        resource: &mut ManagedResource<C::Model>,
        target: &ResourceId,
    ) -> Result<ResourceId, CreateErrorKind> {
        if self.config.features.import_guard {
            let existing = ctx
                .run(self.client.get(ctx, target))
                .await
                .map_err(CreateErrorKind::Interrupted)?;
            match existing {
                Ok(existing) => {
                    let existing_id = self
                        .codec
                        .response_id(&existing)
                        .map(str::to_string)
                        .unwrap_or_else(|| target.to_string());
                    return Err(CreateErrorKind::AlreadyExists { existing_id });
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(CreateErrorKind::ExistenceCheck(err)),
            }
        }

        let payload = self
            .codec
            .expand(&resource.desired)
            .map_err(CreateErrorKind::Expand)?;
        let response = ctx
            .run(self.client.create(ctx, target, payload))
            .await
            .map_err(CreateErrorKind::Interrupted)?
            .map_err(CreateErrorKind::Api)?;
        self.await_operation(ctx, response.operation, OperationKind::Create, target)
            .await
            .map_err(CreateErrorKind::Poll)?;

        let observed = ctx
            .run(self.client.get(ctx, target))
            .await
            .map_err(CreateErrorKind::Interrupted)?
            .map_err(CreateErrorKind::PostCreateReadFailed)?;
        let id = match self.codec.response_id(&observed) {
            Some(raw) => ResourceId::parse(raw).map_err(CreateErrorKind::InvalidId)?,
            None => target.clone(),
        };

        resource.id = Some(id.clone());
        resource.phase = ResourcePhase::Present;

        let model = self
            .codec
            .flatten(&id, &observed, Some(&resource.desired))
            .map_err(CreateErrorKind::Flatten)?;
        resource.observed = Some(model);

        Ok(id)
    }

    /// Refresh the observed state.
    ///
    /// A resource that no longer exists is marked absent and reported as
    /// [`ReadOutcome::Gone`]. Any other failure leaves the id in place.
    #[instrument(skip_all, name = "engine.read", fields(resource_type = %self.codec.resource_type()))]
    pub async fn read(
        &self,
        ctx: &OperationContext,
        resource: &mut ManagedResource<C::Model>,
    ) -> Result<ReadOutcome<C::Model>, ReadError> {
        let Some(id) = resource.id.clone() else {
            return Err(ReadError {
                target: self.natural_id(&resource.desired).to_string(),
                kind: ReadErrorKind::NotCreated,
            });
        };

        debug!(id = %id, "read called");
        let ctx = ctx.child_with_timeout(self.config.timeouts.read);

        let fetched = ctx.run(self.client.get(&ctx, &id)).await.map_err(|err| {
            error!(id = %id, error = %err, "read interrupted");
            ReadError {
                target: id.to_string(),
                kind: ReadErrorKind::Interrupted(err),
            }
        })?;
        let response = match fetched {
            Ok(response) => response,
            Err(err) if err.is_not_found() => {
                warn!(id = %id, "resource was not found - removing from state");
                resource.clear();
                return Ok(ReadOutcome::Gone);
            }
            Err(err) => {
                error!(id = %id, error = %err, "read failed");
                return Err(ReadError {
                    target: id.to_string(),
                    kind: ReadErrorKind::Api(err),
                });
            }
        };

        let model = self
            .codec
            .flatten(&id, &response, Some(&resource.desired))
            .map_err(|err| ReadError {
                target: id.to_string(),
                kind: ReadErrorKind::Flatten(err),
            })?;

        resource.observed = Some(model.clone());
        resource.phase = ResourcePhase::Present;
        Ok(ReadOutcome::Found(model))
    }

    /// Move the resource to a new desired state.
    ///
    /// If the codec says the change must wait for quiescence and a mutation is
    /// still running, the update fails unless `options` opts in to cancelling
    /// it. The desired state is only replaced when the update succeeds.
    #[instrument(skip_all, name = "engine.update", fields(resource_type = %self.codec.resource_type()))]
    pub async fn update(
        &self,
        ctx: &OperationContext,
        resource: &mut ManagedResource<C::Model>,
        desired: C::Model,
        options: UpdateOptions,
    ) -> Result<C::Model, UpdateError> {
        let Some(id) = resource.id.clone() else {
            return Err(UpdateError {
                target: self.natural_id(&desired).to_string(),
                kind: UpdateErrorKind::NotCreated,
            });
        };

        debug!(id = %id, force = options.force_cancel_in_flight, "update called");
        let ctx = ctx.child_with_timeout(self.config.timeouts.update);
        resource.phase = ResourcePhase::Updating;

        let result = self.update_inner(&ctx, resource, &id, &desired, options).await;
        resource.phase = ResourcePhase::Present;

        match result {
            Ok(model) => {
                resource.desired = desired;
                resource.observed = Some(model.clone());
                info!(id = %id, "update completed successfully");
                Ok(model)
            }
            Err(kind) => {
                error!(id = %id, error = %kind, "update failed");
                Err(UpdateError {
                    target: id.to_string(),
                    kind,
                })
            }
        }
    }

    async fn update_inner(
        &self,
        ctx: &OperationContext,
        resource: &ManagedResource<C::Model>,
        id: &ResourceId,
        desired: &C::Model,
        options: UpdateOptions,
    ) -> Result<C::Model, UpdateErrorKind> {
        let prior = resource.observed.as_ref().unwrap_or(&resource.desired);
        if self.codec.requires_quiescence(prior, desired) {
            self.await_quiescence(ctx, id, options).await?;
        }

        let payload = self.codec.expand(desired).map_err(UpdateErrorKind::Expand)?;
        let response = ctx
            .run(self.client.update(ctx, id, payload))
            .await
            .map_err(UpdateErrorKind::Interrupted)?
            .map_err(UpdateErrorKind::Api)?;
        self.await_operation(ctx, response.operation, OperationKind::Update, id)
            .await
            .map_err(UpdateErrorKind::Poll)?;

        let observed = ctx
            .run(self.client.get(ctx, id))
            .await
            .map_err(UpdateErrorKind::Interrupted)?
            .map_err(UpdateErrorKind::PostUpdateReadFailed)?;
        self.codec
            .flatten(id, &observed, Some(desired))
            .map_err(UpdateErrorKind::Flatten)
    }

    async fn await_quiescence(
        &self,
        ctx: &OperationContext,
        id: &ResourceId,
        options: UpdateOptions,
    ) -> Result<(), UpdateErrorKind> {
        let current = ctx
            .run(self.client.get(ctx, id))
            .await
            .map_err(UpdateErrorKind::Interrupted)?
            .map_err(UpdateErrorKind::Api)?;

        let operation = match self.codec.activity(&current) {
            Activity::Steady => return Ok(()),
            Activity::InFlight { operation } => operation,
        };

        if !options.force_cancel_in_flight {
            warn!(id = %id, operation = %operation, "mutation in flight, refusing to update");
            return Err(UpdateErrorKind::ConflictingOperation { operation });
        }

        warn!(id = %id, operation = %operation, "cancelling in-flight mutation before update");
        let handle = ctx
            .run(self.client.cancel_in_flight(ctx, id))
            .await
            .map_err(UpdateErrorKind::Interrupted)?
            .map_err(UpdateErrorKind::CancelFailed)?;
        self.await_operation(ctx, handle, OperationKind::Cancel, id)
            .await
            .map_err(UpdateErrorKind::Quiescence)?;

        let client = self.client.as_ref();
        let codec = &self.codec;
        StateWaiter::new([Activity::IN_FLIGHT], [Activity::STEADY])
            .with_backoff(self.config.polling.backoff.clone())
            .wait(ctx, move || async move {
                match client.get(ctx, id).await {
                    Ok(body) => Ok(Some(((), codec.activity(&body).state().to_string()))),
                    Err(err) if err.is_not_found() => Ok(None),
                    Err(err) => Err(err),
                }
            })
            .await
            .map_err(UpdateErrorKind::Quiescence)?;

        info!(id = %id, "resource is steady");
        Ok(())
    }

    /// Delete the resource.
    ///
    /// A resource that is already gone counts as deleted. On failure the id is
    /// kept so the delete can be retried.
    #[instrument(skip_all, name = "engine.delete", fields(resource_type = %self.codec.resource_type()))]
    pub async fn delete(
        &self,
        ctx: &OperationContext,
        resource: &mut ManagedResource<C::Model>,
    ) -> Result<(), DeleteError> {
        let Some(id) = resource.id.clone() else {
            debug!("resource is absent, nothing to delete");
            return Ok(());
        };

        debug!(id = %id, "delete called");
        let ctx = ctx.child_with_timeout(self.config.timeouts.delete);
        resource.phase = ResourcePhase::Deleting;

        match self.delete_inner(&ctx, &id).await {
            Ok(()) => {
                resource.clear();
                info!(id = %id, "delete completed successfully");
                Ok(())
            }
            Err(kind) => {
                resource.phase = ResourcePhase::Present;
                error!(id = %id, error = %kind, "delete failed");
                Err(DeleteError {
                    target: id.to_string(),
                    kind,
                })
            }
        }
    }

    async fn delete_inner(
        &self,
        ctx: &OperationContext,
        id: &ResourceId,
    ) -> Result<(), DeleteErrorKind> {
        let deleted = ctx
            .run(self.client.delete(ctx, id))
            .await
            .map_err(DeleteErrorKind::Interrupted)?;
        let handle = match deleted {
            Ok(handle) => handle,
            Err(err) if err.is_not_found() => {
                info!(id = %id, "resource already gone");
                return Ok(());
            }
            Err(err) => return Err(DeleteErrorKind::Api(err)),
        };

        self.await_operation(ctx, handle, OperationKind::Delete, id)
            .await
            .map_err(DeleteErrorKind::Poll)?;
        Ok(())
    }

    /// Adopt an existing remote resource by id.
    #[instrument(skip_all, name = "engine.import", fields(resource_type = %self.codec.resource_type()))]
    pub async fn import(
        &self,
        ctx: &OperationContext,
        raw_id: &str,
    ) -> Result<ManagedResource<C::Model>, ReadError> {
        let invalid = |err| ReadError {
            target: raw_id.to_string(),
            kind: ReadErrorKind::InvalidId(err),
        };

        let id = ResourceId::parse(raw_id).map_err(invalid)?;
        let expected = self.codec.expected_segments();
        if !expected.is_empty() {
            id.expect_segments(expected).map_err(invalid)?;
        }

        debug!(id = %id, "import called");
        let ctx = ctx.child_with_timeout(self.config.timeouts.read);

        let fetched = ctx
            .run(self.client.get(&ctx, &id))
            .await
            .map_err(|err| ReadError {
                target: id.to_string(),
                kind: ReadErrorKind::Interrupted(err),
            })?;
        let response = match fetched {
            Ok(response) => response,
            Err(err) if err.is_not_found() => {
                return Err(ReadError {
                    target: id.to_string(),
                    kind: ReadErrorKind::Missing,
                })
            }
            Err(err) => {
                return Err(ReadError {
                    target: id.to_string(),
                    kind: ReadErrorKind::Api(err),
                })
            }
        };

        let model = self
            .codec
            .flatten(&id, &response, None)
            .map_err(|err| ReadError {
                target: id.to_string(),
                kind: ReadErrorKind::Flatten(err),
            })?;

        info!(id = %id, "import completed successfully");
        Ok(ManagedResource::existing(id, model.clone()).with_observed(model))
    }

    /// Compare desired and observed state without calling the API.
    pub fn plan(&self, resource: &ManagedResource<C::Model>) -> Result<PlanResult, CodecError> {
        let desired = serde_json::to_value(&resource.desired)?;

        let Some(id) = &resource.id else {
            let changes = all_added(&desired);
            return Ok(PlanResult::with_changes(desired, changes, false));
        };

        let requires_replace = self
            .codec
            .resource_id(id.subscription_id(), &resource.desired)
            != *id;

        let changes = match &resource.observed {
            Some(observed) => {
                let observed = serde_json::to_value(observed)?;
                detect_drift(&desired, &observed, &self.codec.drift_rules())
            }
            None => all_added(&desired),
        };

        if changes.is_empty() && !requires_replace {
            Ok(PlanResult::no_change(desired))
        } else {
            Ok(PlanResult::with_changes(desired, changes, requires_replace))
        }
    }

    async fn await_operation(
        &self,
        ctx: &OperationContext,
        handle: Option<OperationHandle>,
        kind: OperationKind,
        target: &ResourceId,
    ) -> Result<Option<TerminalResult>, PollError> {
        let Some(handle) = handle else {
            return Ok(None);
        };
        let mut op = PendingOperation::new(handle, kind, target.clone());
        self.poller
            .wait(self.client.as_ref(), &mut op, ctx)
            .await
            .map(Some)
    }
}

fn all_added(desired: &Value) -> Vec<AttributeChange> {
    match desired {
        Value::Object(map) => map
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(key, value)| AttributeChange::added(key.clone(), value.clone()))
            .collect(),
        Value::Null => Vec::new(),
        other => vec![AttributeChange::added("", other.clone())],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Interrupted;
    use crate::error::ApiError;
    use crate::lro::OperationStatus;
    use crate::testing::{
        assert_drift_on, assert_no_drift, assert_requires_replace, AuthSettings, FakeArmClient,
        FakeCall, UnreadableWidgetCodec, Widget, WidgetCodec, WidgetRule,
    };
    use std::time::Duration;

    const SUB: &str = "00000000-0000-0000-0000-000000000000";

    fn engine(client: &Arc<FakeArmClient>) -> Engine<WidgetCodec> {
        Engine::new(client.clone(), WidgetCodec, EngineConfig::for_testing(SUB))
    }

    fn widget() -> Widget {
        Widget::new("w1", "rg1", "East US").with_size("Small")
    }

    fn widget_id() -> ResourceId {
        ResourceId::new(SUB, Some("rg1"), [("widgets", "w1")])
    }

    async fn created(
        client: &Arc<FakeArmClient>,
        engine: &Engine<WidgetCodec>,
    ) -> ManagedResource<Widget> {
        let mut resource = ManagedResource::new(widget());
        engine
            .create(&OperationContext::new(), &mut resource)
            .await
            .unwrap();
        assert!(client.contains(&widget_id()));
        resource
    }

    #[tokio::test]
    async fn test_create_read_delete_cycle() {
        let client = Arc::new(FakeArmClient::new());
        client.script_operation(
            FakeCall::Create,
            vec![
                OperationStatus::in_progress(),
                OperationStatus::Succeeded(None),
            ],
        );
        let engine = engine(&client);
        let ctx = OperationContext::new();

        let mut resource = ManagedResource::new(widget());
        let id = engine.create(&ctx, &mut resource).await.unwrap();

        let stored = resource.id().unwrap();
        assert_eq!(stored, &id);
        let reparsed = ResourceId::parse(&stored.to_string()).unwrap();
        assert_eq!(reparsed.resource_group(), Some("rg1"));
        assert_eq!(reparsed.segment("widgets"), Some("w1"));
        assert_eq!(resource.phase(), ResourcePhase::Present);
        assert_eq!(client.calls(FakeCall::PollOperation), 2);

        let outcome = engine.read(&ctx, &mut resource).await.unwrap();
        assert!(matches!(outcome, ReadOutcome::Found(ref w) if w.location == "eastus"));

        client.fail_next(FakeCall::Delete, ApiError::NotFound("widget w1".to_string()));
        engine.delete(&ctx, &mut resource).await.unwrap();
        assert!(resource.id().is_none());
        assert_eq!(resource.phase(), ResourcePhase::Absent);
    }

    #[tokio::test]
    async fn test_create_uses_returned_id() {
        let client = Arc::new(FakeArmClient::new());
        let engine = engine(&client);

        let resource = created(&client, &engine).await;
        assert_eq!(
            resource.id().unwrap().to_string(),
            format!("/subscriptions/{}/resourceGroups/rg1/widgets/w1", SUB)
        );
        assert_eq!(resource.observed().unwrap().size.as_deref(), Some("Small"));
    }

    #[tokio::test]
    async fn test_import_guard_blocks_create() {
        let client = Arc::new(FakeArmClient::new());
        client.seed(&widget_id(), serde_json::json!({"location": "eastus"}));
        let engine = engine(&client);

        let mut resource = ManagedResource::new(widget());
        let err = engine
            .create(&OperationContext::new(), &mut resource)
            .await
            .unwrap_err();

        assert!(matches!(err.kind, CreateErrorKind::AlreadyExists { ref existing_id } if existing_id.ends_with("/widgets/w1")));
        assert_eq!(client.calls(FakeCall::Create), 0);
        assert!(resource.id().is_none());
        assert_eq!(resource.phase(), ResourcePhase::Absent);
    }

    #[tokio::test]
    async fn test_import_guard_can_be_disabled() {
        let client = Arc::new(FakeArmClient::new());
        client.seed(&widget_id(), serde_json::json!({"location": "eastus"}));
        let engine = Engine::new(
            client.clone(),
            WidgetCodec,
            EngineConfig::for_testing(SUB).with_import_guard(false),
        );

        let mut resource = ManagedResource::new(widget());
        engine
            .create(&OperationContext::new(), &mut resource)
            .await
            .unwrap();
        assert_eq!(client.calls(FakeCall::Create), 1);
    }

    #[tokio::test]
    async fn test_existence_check_failure_is_not_absence() {
        let client = Arc::new(FakeArmClient::new());
        client.fail_next(FakeCall::Get, ApiError::status(403, "AuthorizationFailed", "denied"));
        let engine = engine(&client);

        let mut resource = ManagedResource::new(widget());
        let err = engine
            .create(&OperationContext::new(), &mut resource)
            .await
            .unwrap_err();
        assert!(matches!(err.kind, CreateErrorKind::ExistenceCheck(_)));
        assert_eq!(client.calls(FakeCall::Create), 0);
    }

    #[tokio::test]
    async fn test_create_twice_is_rejected() {
        let client = Arc::new(FakeArmClient::new());
        let engine = engine(&client);
        let mut resource = created(&client, &engine).await;

        let err = engine
            .create(&OperationContext::new(), &mut resource)
            .await
            .unwrap_err();
        assert!(matches!(err.kind, CreateErrorKind::AlreadyManaged(_)));
    }

    #[tokio::test]
    async fn test_create_poll_failure() {
        let client = Arc::new(FakeArmClient::new());
        client.script_operation(
            FakeCall::Create,
            vec![OperationStatus::Failed("SkuNotAvailable".to_string())],
        );
        let engine = engine(&client);

        let mut resource = ManagedResource::new(widget());
        let err = engine
            .create(&OperationContext::new(), &mut resource)
            .await
            .unwrap_err();

        assert!(matches!(
            err.kind,
            CreateErrorKind::Poll(PollError::Failed { ref reason }) if reason == "SkuNotAvailable"
        ));
        assert!(err.to_string().contains("/resourceGroups/rg1/widgets/w1"));
        assert!(resource.id().is_none());
        assert_eq!(resource.phase(), ResourcePhase::Absent);
    }

    #[tokio::test]
    async fn test_post_create_read_failure() {
        let client = Arc::new(FakeArmClient::new());
        let engine = Engine::new(
            client.clone(),
            WidgetCodec,
            EngineConfig::for_testing(SUB).with_import_guard(false),
        );
        client.fail_next(FakeCall::Get, ApiError::status(500, "InternalServerError", "boom"));

        let mut resource = ManagedResource::new(widget());
        let err = engine
            .create(&OperationContext::new(), &mut resource)
            .await
            .unwrap_err();
        assert!(matches!(err.kind, CreateErrorKind::PostCreateReadFailed(_)));
        assert!(resource.id().is_none());
    }

    #[tokio::test]
    async fn test_flatten_failure_after_create_keeps_id() {
        let client = Arc::new(FakeArmClient::new());
        let engine = Engine::new(
            client.clone(),
            UnreadableWidgetCodec,
            EngineConfig::for_testing(SUB),
        );

        let mut resource = ManagedResource::new(widget());
        let err = engine
            .create(&OperationContext::new(), &mut resource)
            .await
            .unwrap_err();

        assert!(matches!(err.kind, CreateErrorKind::Flatten(_)));
        assert!(client.contains(&widget_id()));
        assert_eq!(resource.id(), Some(&widget_id()));
        assert_eq!(resource.phase(), ResourcePhase::Present);
    }

    #[tokio::test]
    async fn test_create_cancelled_while_polling() {
        let client = Arc::new(FakeArmClient::new());
        client.script_operation(FakeCall::Create, vec![OperationStatus::in_progress()]);
        let engine = engine(&client);

        let ctx = OperationContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });

        let mut resource = ManagedResource::new(widget());
        let err = engine.create(&ctx, &mut resource).await.unwrap_err();
        assert!(matches!(err.kind, CreateErrorKind::Poll(PollError::Cancelled)));
        assert!(resource.id().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_context_sends_no_create() {
        let client = Arc::new(FakeArmClient::new());
        let engine = engine(&client);
        let ctx = OperationContext::new();
        ctx.cancel();

        let mut resource = ManagedResource::new(widget());
        let err = engine.create(&ctx, &mut resource).await.unwrap_err();

        assert!(matches!(
            err.kind,
            CreateErrorKind::Interrupted(Interrupted::Cancelled)
        ));
        assert_eq!(client.total_calls(), 0);
        assert!(resource.id().is_none());
        assert_eq!(resource.phase(), ResourcePhase::Absent);
    }

    #[tokio::test]
    async fn test_expired_context_sends_no_update_or_delete() {
        let client = Arc::new(FakeArmClient::new());
        let engine = engine(&client);
        let mut resource = created(&client, &engine).await;
        let calls_before = client.total_calls();

        let expired = OperationContext::with_timeout(Duration::ZERO);
        let err = engine
            .update(
                &expired,
                &mut resource,
                widget().with_size("Large"),
                UpdateOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err.kind,
            UpdateErrorKind::Interrupted(Interrupted::DeadlineExceeded)
        ));

        let err = engine.delete(&expired, &mut resource).await.unwrap_err();
        assert!(matches!(
            err.kind,
            DeleteErrorKind::Interrupted(Interrupted::DeadlineExceeded)
        ));

        assert_eq!(client.total_calls(), calls_before);
        assert_eq!(client.calls(FakeCall::Delete), 0);
        assert!(client.contains(&widget_id()));
        assert_eq!(resource.id(), Some(&widget_id()));
        assert_eq!(resource.desired().size.as_deref(), Some("Small"));
        assert_eq!(resource.phase(), ResourcePhase::Present);
    }

    #[tokio::test]
    async fn test_read_gone_clears_id() {
        let client = Arc::new(FakeArmClient::new());
        let engine = engine(&client);
        let mut resource = created(&client, &engine).await;

        client.remove(&widget_id());
        let outcome = engine
            .read(&OperationContext::new(), &mut resource)
            .await
            .unwrap();

        assert!(outcome.is_gone());
        assert!(resource.id().is_none());
        assert!(resource.observed().is_none());
        assert_eq!(resource.phase(), ResourcePhase::Absent);
    }

    #[tokio::test]
    async fn test_read_failure_keeps_id() {
        let client = Arc::new(FakeArmClient::new());
        let engine = engine(&client);
        let mut resource = created(&client, &engine).await;

        client.fail_next(FakeCall::Get, ApiError::status(503, "ServiceUnavailable", "later"));
        let err = engine
            .read(&OperationContext::new(), &mut resource)
            .await
            .unwrap_err();

        assert!(matches!(err.kind, ReadErrorKind::Api(_)));
        assert_eq!(resource.id(), Some(&widget_id()));
    }

    #[tokio::test]
    async fn test_read_before_create() {
        let client = Arc::new(FakeArmClient::new());
        let engine = engine(&client);
        let mut resource = ManagedResource::new(widget());

        let err = engine
            .read(&OperationContext::new(), &mut resource)
            .await
            .unwrap_err();
        assert!(matches!(err.kind, ReadErrorKind::NotCreated));
        assert_eq!(client.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_read_tolerates_sparse_response() {
        let client = Arc::new(FakeArmClient::new());
        client.seed(&widget_id(), serde_json::json!({"location": "westus"}));
        let engine = engine(&client);

        let mut resource = ManagedResource::existing(widget_id(), widget());
        let outcome = engine
            .read(&OperationContext::new(), &mut resource)
            .await
            .unwrap();

        let ReadOutcome::Found(observed) = outcome else {
            panic!("expected the widget to be found");
        };
        assert_eq!(observed.size, None);
        assert!(observed.rules.is_empty());
        assert!(observed.tags.is_empty());
        assert!(observed.auth_settings.is_none() && observed.auth_settings_v2.is_none());
    }

    #[tokio::test]
    async fn test_location_casing_is_not_drift() {
        let client = Arc::new(FakeArmClient::new());
        let engine = engine(&client);
        let mut resource = created(&client, &engine).await;

        engine
            .read(&OperationContext::new(), &mut resource)
            .await
            .unwrap();
        assert_eq!(resource.observed().unwrap().location, "eastus");
        assert_eq!(resource.desired().location, "East US");

        let plan = engine.plan(&resource).unwrap();
        assert_no_drift(&plan);
    }

    #[tokio::test]
    async fn test_reordered_rules_are_not_drift() {
        let client = Arc::new(FakeArmClient::new());
        let engine = engine(&client);
        let desired = widget()
            .with_rule(WidgetRule::new("allow-https", 100))
            .with_rule(WidgetRule::new("deny-all", 4096));
        let mut resource = ManagedResource::new(desired);
        engine
            .create(&OperationContext::new(), &mut resource)
            .await
            .unwrap();

        client.patch(&widget_id(), |body| {
            if let Some(rules) = body
                .pointer_mut("/properties/rules")
                .and_then(Value::as_array_mut)
            {
                rules.reverse();
            }
        });
        engine
            .read(&OperationContext::new(), &mut resource)
            .await
            .unwrap();
        assert_eq!(resource.observed().unwrap().rules[0].name, "deny-all");
        assert_no_drift(&engine.plan(&resource).unwrap());
    }

    #[tokio::test]
    async fn test_out_of_band_change_is_drift() {
        let client = Arc::new(FakeArmClient::new());
        let engine = engine(&client);
        let mut resource = created(&client, &engine).await;

        client.patch(&widget_id(), |body| body["sku"]["name"] = "Large".into());
        engine
            .read(&OperationContext::new(), &mut resource)
            .await
            .unwrap();

        let plan = engine.plan(&resource).unwrap();
        assert_drift_on(&plan, "size");
        assert!(!plan.requires_replace);
    }

    #[tokio::test]
    async fn test_out_of_band_tag_and_rule_are_drift() {
        let client = Arc::new(FakeArmClient::new());
        let engine = engine(&client);
        let mut resource = ManagedResource::new(widget().with_tag("env", "prod"));
        engine
            .create(&OperationContext::new(), &mut resource)
            .await
            .unwrap();

        client.patch(&widget_id(), |body| {
            body["tags"]["owner"] = "mallory".into();
            body["properties"]["rules"] = serde_json::json!([{"name": "oob", "priority": 1}]);
        });
        engine
            .read(&OperationContext::new(), &mut resource)
            .await
            .unwrap();
        let observed = resource.observed().unwrap();
        assert_eq!(observed.tags.get("owner").map(String::as_str), Some("mallory"));
        assert_eq!(observed.rules.len(), 1);

        let plan = engine.plan(&resource).unwrap();
        assert_drift_on(&plan, "tags.owner");
        assert_drift_on(&plan, "rules");
        assert!(plan.change("tags.owner").unwrap().after.is_none());
        assert!(!plan.requires_replace);
    }

    #[tokio::test]
    async fn test_renamed_resource_requires_replace() {
        let client = Arc::new(FakeArmClient::new());
        let engine = engine(&client);
        let resource = created(&client, &engine).await;

        let mut renamed = widget();
        renamed.name = "w2".to_string();
        let moved = ManagedResource::existing(resource.id().unwrap().clone(), renamed)
            .with_observed(resource.observed().unwrap().clone());

        let plan = engine.plan(&moved).unwrap();
        assert_requires_replace(&plan);
        assert_drift_on(&plan, "name");
    }

    #[tokio::test]
    async fn test_plan_for_new_resource_lists_every_attribute() {
        let client = Arc::new(FakeArmClient::new());
        let engine = engine(&client);
        let plan = engine.plan(&ManagedResource::new(widget())).unwrap();

        assert!(plan.change("name").is_some());
        assert!(plan.change("location").is_some());
        assert!(plan.change("allocation_state").is_none());
        assert!(!plan.requires_replace);
    }

    #[tokio::test]
    async fn test_legacy_auth_shape_is_preserved() {
        let client = Arc::new(FakeArmClient::new());
        let engine = engine(&client);
        let mut desired = widget();
        desired.auth_settings = Some(AuthSettings {
            enabled: true,
            issuer: Some("https://sts.example.com".to_string()),
        });

        let mut resource = ManagedResource::new(desired);
        engine
            .create(&OperationContext::new(), &mut resource)
            .await
            .unwrap();

        let observed = resource.observed().unwrap();
        assert!(observed.auth_settings.is_some());
        assert!(observed.auth_settings_v2.is_none());
        assert_no_drift(&engine.plan(&resource).unwrap());
    }

    #[tokio::test]
    async fn test_update_applies_desired_state() {
        let client = Arc::new(FakeArmClient::new());
        client.script_operation(
            FakeCall::Update,
            vec![OperationStatus::in_progress(), OperationStatus::Succeeded(None)],
        );
        let engine = engine(&client);
        let mut resource = created(&client, &engine).await;

        let desired = widget().with_size("Large").with_tag("env", "prod");
        let observed = engine
            .update(
                &OperationContext::new(),
                &mut resource,
                desired,
                UpdateOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(observed.size.as_deref(), Some("Large"));
        assert_eq!(resource.desired().tags.get("env").map(String::as_str), Some("prod"));
        assert_eq!(resource.phase(), ResourcePhase::Present);
        assert_no_drift(&engine.plan(&resource).unwrap());
    }

    #[tokio::test]
    async fn test_update_poll_failure_keeps_id() {
        let client = Arc::new(FakeArmClient::new());
        client.script_operation(
            FakeCall::Update,
            vec![
                OperationStatus::in_progress(),
                OperationStatus::Failed("QuotaExceeded".to_string()),
            ],
        );
        let engine = engine(&client);
        let mut resource = created(&client, &engine).await;

        let err = engine
            .update(
                &OperationContext::new(),
                &mut resource,
                widget().with_size("Huge"),
                UpdateOptions::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err.kind,
            UpdateErrorKind::Poll(PollError::Failed { ref reason }) if reason == "QuotaExceeded"
        ));
        assert_eq!(resource.id(), Some(&widget_id()));
        assert_eq!(resource.phase(), ResourcePhase::Present);
        assert_eq!(resource.desired().size.as_deref(), Some("Small"));
    }

    #[tokio::test]
    async fn test_update_before_create() {
        let client = Arc::new(FakeArmClient::new());
        let engine = engine(&client);
        let mut resource = ManagedResource::new(widget());

        let err = engine
            .update(
                &OperationContext::new(),
                &mut resource,
                widget().with_size("Large"),
                UpdateOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err.kind, UpdateErrorKind::NotCreated));
        assert_eq!(client.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_update_refuses_while_resizing() {
        let client = Arc::new(FakeArmClient::new());
        let engine = engine(&client);
        let mut resource = created(&client, &engine).await;
        client.set_property(&widget_id(), "allocationState", "Resizing");

        let err = engine
            .update(
                &OperationContext::new(),
                &mut resource,
                widget().with_size("Large"),
                UpdateOptions::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err.kind,
            UpdateErrorKind::ConflictingOperation { ref operation } if operation == "resizing"
        ));
        assert_eq!(client.calls(FakeCall::Update), 0);
        assert_eq!(client.calls(FakeCall::CancelInFlight), 0);
    }

    #[tokio::test]
    async fn test_forced_update_cancels_in_flight_mutation() {
        let client = Arc::new(FakeArmClient::new());
        client.script_operation(
            FakeCall::CancelInFlight,
            vec![OperationStatus::in_progress(), OperationStatus::Succeeded(None)],
        );
        let engine = engine(&client);
        let mut resource = created(&client, &engine).await;
        client.set_property(&widget_id(), "allocationState", "Resizing");

        let observed = engine
            .update(
                &OperationContext::new(),
                &mut resource,
                widget().with_size("Large"),
                UpdateOptions::forced(),
            )
            .await
            .unwrap();

        assert_eq!(observed.size.as_deref(), Some("Large"));
        assert_eq!(client.calls(FakeCall::CancelInFlight), 1);
        assert_eq!(client.calls(FakeCall::Update), 1);
    }

    #[tokio::test]
    async fn test_forced_update_without_cancel_support() {
        let client = Arc::new(FakeArmClient::new().without_cancel_support());
        let engine = engine(&client);
        let mut resource = created(&client, &engine).await;
        client.set_property(&widget_id(), "allocationState", "Resizing");

        let err = engine
            .update(
                &OperationContext::new(),
                &mut resource,
                widget().with_size("Large"),
                UpdateOptions::forced(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err.kind,
            UpdateErrorKind::CancelFailed(ApiError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_tag_change_does_not_wait_for_resize() {
        let client = Arc::new(FakeArmClient::new());
        let engine = engine(&client);
        let mut resource = created(&client, &engine).await;
        client.set_property(&widget_id(), "allocationState", "Resizing");

        engine
            .update(
                &OperationContext::new(),
                &mut resource,
                widget().with_tag("team", "infra"),
                UpdateOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(client.calls(FakeCall::Update), 1);
    }

    #[tokio::test]
    async fn test_delete_with_polling() {
        let client = Arc::new(FakeArmClient::new());
        client.script_operation(
            FakeCall::Delete,
            vec![OperationStatus::in_progress(), OperationStatus::NotFound],
        );
        let engine = engine(&client);
        let mut resource = created(&client, &engine).await;

        engine
            .delete(&OperationContext::new(), &mut resource)
            .await
            .unwrap();
        assert!(resource.id().is_none());
        assert!(!client.contains(&widget_id()));
    }

    #[tokio::test]
    async fn test_delete_failure_keeps_id() {
        let client = Arc::new(FakeArmClient::new());
        let engine = engine(&client);
        let mut resource = created(&client, &engine).await;
        client.fail_next(
            FakeCall::Delete,
            ApiError::status(409, "Conflict", "widget is locked"),
        );

        let err = engine
            .delete(&OperationContext::new(), &mut resource)
            .await
            .unwrap_err();

        assert!(matches!(err.kind, DeleteErrorKind::Api(_)));
        assert!(err.to_string().contains("widget is locked"));
        assert_eq!(resource.id(), Some(&widget_id()));
        assert_eq!(resource.phase(), ResourcePhase::Present);
    }

    #[tokio::test]
    async fn test_delete_absent_is_noop() {
        let client = Arc::new(FakeArmClient::new());
        let engine = engine(&client);
        let mut resource = ManagedResource::new(widget());

        engine
            .delete(&OperationContext::new(), &mut resource)
            .await
            .unwrap();
        assert_eq!(client.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_import_existing() {
        let client = Arc::new(FakeArmClient::new());
        client.seed(
            &widget_id(),
            serde_json::json!({
                "location": "West Europe",
                "sku": {"name": "Medium"},
                "tags": {"$type": "internal", "env": "dev"}
            }),
        );
        let engine = engine(&client);

        let raw = format!("/subscriptions/{}/resourcegroups/rg1/widgets/w1", SUB);
        let resource = engine
            .import(&OperationContext::new(), &raw)
            .await
            .unwrap();

        assert_eq!(resource.id(), Some(&widget_id()));
        let observed = resource.observed().unwrap();
        assert_eq!(observed.location, "westeurope");
        assert_eq!(observed.size.as_deref(), Some("Medium"));
        assert_eq!(observed.tags.len(), 1);
        assert_no_drift(&engine.plan(&resource).unwrap());
    }

    #[tokio::test]
    async fn test_import_rejects_bad_ids() {
        let client = Arc::new(FakeArmClient::new());
        let engine = engine(&client);
        let ctx = OperationContext::new();

        let err = engine.import(&ctx, "not-an-id").await.unwrap_err();
        assert!(matches!(err.kind, ReadErrorKind::InvalidId(_)));

        let wrong_shape = format!("/subscriptions/{}/resourceGroups/rg1/gadgets/g1", SUB);
        let err = engine.import(&ctx, &wrong_shape).await.unwrap_err();
        assert!(matches!(err.kind, ReadErrorKind::InvalidId(_)));

        let missing = format!("/subscriptions/{}/resourceGroups/rg1/widgets/nope", SUB);
        let err = engine.import(&ctx, &missing).await.unwrap_err();
        assert!(matches!(err.kind, ReadErrorKind::Missing));
        assert_eq!(client.total_calls(), 1);
    }
}
