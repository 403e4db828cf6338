//! Testing utilities for codecs and reconciliation flows.
//!
//! This module provides an in-memory [`FakeArmClient`], a small reference
//! resource ([`Widget`] with its [`WidgetCodec`]), a [`ReconcileTester`] that
//! runs host lifecycles against a [`ProviderRegistry`], and plan assertions.
//!
//! # Example
//!
//! ```ignore
//! use hemmer_arm_reconcile::testing::{FakeArmClient, FakeCall, WidgetCodec};
//! use hemmer_arm_reconcile::{Engine, EngineConfig, OperationStatus};
//! use std::sync::Arc;
//!
//! #[tokio::test]
//! async fn test_create_waits_for_operation() {
//!     let client = Arc::new(FakeArmClient::new());
//!     client.script_operation(FakeCall::Create, vec![
//!         OperationStatus::in_progress(),
//!         OperationStatus::Succeeded(None),
//!     ]);
//!     let engine = Engine::new(client.clone(), WidgetCodec, EngineConfig::for_testing("sub"));
//!     // ...
//! }
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::client::{ApiResponse, ArmClient};
use crate::codec::{
    decode_section, filter_tags, resolve_shapes, Activity, ResourceCodec, ShapeGeneration,
};
use crate::context::OperationContext;
use crate::drift::{normalize_location, DriftRules, PlanResult};
use crate::engine::UpdateOptions;
use crate::error::{ApiError, CodecError, ReconcileError};
use crate::host::ProviderRegistry;
use crate::lro::{OperationHandle, OperationSource, OperationStatus};
use crate::resource_id::ResourceId;

// =========================================================================
// Fake client
// =========================================================================

/// A call made against a [`FakeArmClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeCall {
    /// `create`.
    Create,
    /// `get`.
    Get,
    /// `update`.
    Update,
    /// `delete`.
    Delete,
    /// `cancel_in_flight`.
    CancelInFlight,
    /// `poll_operation`.
    PollOperation,
}

#[derive(Debug, Default)]
struct FakeState {
    resources: HashMap<String, Value>,
    scripts: HashMap<FakeCall, VecDeque<Vec<OperationStatus>>>,
    failures: HashMap<FakeCall, VecDeque<ApiError>>,
    operations: HashMap<String, VecDeque<OperationStatus>>,
    calls: Vec<FakeCall>,
    next_operation: u64,
}

impl FakeState {
    fn record(&mut self, call: FakeCall) -> Result<(), ApiError> {
        self.calls.push(call);
        match self.failures.get_mut(&call).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn accept(&mut self, call: FakeCall) -> Option<OperationHandle> {
        let statuses = self.scripts.get_mut(&call).and_then(VecDeque::pop_front)?;
        self.next_operation += 1;
        let handle = format!("operations/op-{}", self.next_operation);
        self.operations.insert(handle.clone(), statuses.into());
        Some(OperationHandle::new(handle))
    }
}

/// In-memory stand-in for the Resource Manager API.
///
/// Mutations apply immediately. A scripted operation only controls what
/// polling reports, so tests can exercise `202 Accepted` flows.
#[derive(Debug, Default)]
pub struct FakeArmClient {
    state: Mutex<FakeState>,
    cancel_unsupported: bool,
}

fn key(id: &ResourceId) -> String {
    id.to_string().to_ascii_lowercase()
}

fn stamp(id: &ResourceId, mut body: Value) -> Value {
    if !body.is_object() {
        body = Value::Object(Map::new());
    }
    if let Some(map) = body.as_object_mut() {
        map.entry("id")
            .or_insert_with(|| Value::String(id.to_string()));
        if let Some(name) = id.name() {
            map.entry("name")
                .or_insert_with(|| Value::String(name.to_string()));
        }
    }
    body
}

fn not_found(id: &ResourceId) -> ApiError {
    ApiError::NotFound(format!("{} was not found", id))
}

impl FakeArmClient {
    /// An empty fake.
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `cancel_in_flight` as unsupported.
    pub fn without_cancel_support(mut self) -> Self {
        self.cancel_unsupported = true;
        self
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put a resource in place, as if it had been created out of band.
    pub fn seed(&self, id: &ResourceId, body: Value) {
        self.state().resources.insert(key(id), stamp(id, body));
    }

    /// Remove a resource, as if it had been deleted out of band.
    pub fn remove(&self, id: &ResourceId) {
        self.state().resources.remove(&key(id));
    }

    /// The stored body of a resource.
    pub fn resource(&self, id: &ResourceId) -> Option<Value> {
        self.state().resources.get(&key(id)).cloned()
    }

    /// Whether a resource exists.
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.state().resources.contains_key(&key(id))
    }

    /// Number of stored resources.
    pub fn resource_count(&self) -> usize {
        self.state().resources.len()
    }

    /// Modify a stored resource in place.
    pub fn patch(&self, id: &ResourceId, f: impl FnOnce(&mut Value)) {
        if let Some(body) = self.state().resources.get_mut(&key(id)) {
            f(body);
        }
    }

    /// Set `properties.{name}` on a stored resource.
    pub fn set_property(&self, id: &ResourceId, name: &str, value: impl Into<Value>) {
        let value = value.into();
        self.patch(id, |body| {
            if let Some(map) = body.as_object_mut() {
                let properties = map
                    .entry("properties")
                    .or_insert_with(|| Value::Object(Map::new()));
                if !properties.is_object() {
                    *properties = Value::Object(Map::new());
                }
                if let Some(properties) = properties.as_object_mut() {
                    properties.insert(name.to_string(), value);
                }
            }
        });
    }

    /// Make the next `call` return an operation handle that reports
    /// `statuses` in order, repeating the last one.
    pub fn script_operation(&self, call: FakeCall, statuses: Vec<OperationStatus>) {
        self.state()
            .scripts
            .entry(call)
            .or_default()
            .push_back(statuses);
    }

    /// Make the next `call` fail with `error`.
    pub fn fail_next(&self, call: FakeCall, error: ApiError) {
        self.state()
            .failures
            .entry(call)
            .or_default()
            .push_back(error);
    }

    /// How many times `call` was made.
    pub fn calls(&self, call: FakeCall) -> usize {
        self.state().calls.iter().filter(|c| **c == call).count()
    }

    /// How many calls were made in total.
    pub fn total_calls(&self) -> usize {
        self.state().calls.len()
    }

    /// Every call, in order.
    pub fn call_log(&self) -> Vec<FakeCall> {
        self.state().calls.clone()
    }
}

#[async_trait]
impl OperationSource for FakeArmClient {
    async fn poll_operation(
        &self,
        _ctx: &OperationContext,
        handle: &OperationHandle,
    ) -> Result<OperationStatus, ApiError> {
        let mut state = self.state();
        state.record(FakeCall::PollOperation)?;
        let Some(statuses) = state.operations.get_mut(handle.as_str()) else {
            return Err(ApiError::NotFound(format!("operation {} was not found", handle)));
        };
        let status = if statuses.len() > 1 {
            statuses.pop_front()
        } else {
            statuses.front().cloned()
        };
        Ok(status.unwrap_or(OperationStatus::Succeeded(None)))
    }
}

#[async_trait]
impl ArmClient for FakeArmClient {
    async fn create(
        &self,
        _ctx: &OperationContext,
        id: &ResourceId,
        payload: Value,
    ) -> Result<ApiResponse, ApiError> {
        let mut state = self.state();
        state.record(FakeCall::Create)?;
        let body = stamp(id, payload);
        state.resources.insert(key(id), body.clone());
        Ok(ApiResponse {
            body,
            operation: state.accept(FakeCall::Create),
        })
    }

    async fn get(&self, _ctx: &OperationContext, id: &ResourceId) -> Result<Value, ApiError> {
        let mut state = self.state();
        state.record(FakeCall::Get)?;
        state
            .resources
            .get(&key(id))
            .cloned()
            .ok_or_else(|| not_found(id))
    }

    async fn update(
        &self,
        _ctx: &OperationContext,
        id: &ResourceId,
        payload: Value,
    ) -> Result<ApiResponse, ApiError> {
        let mut state = self.state();
        state.record(FakeCall::Update)?;
        let Some(existing) = state.resources.get(&key(id)) else {
            return Err(not_found(id));
        };
        let mut body = stamp(id, payload);
        if let (Some(map), Some(id_value)) = (body.as_object_mut(), existing.get("id")) {
            map.insert("id".to_string(), id_value.clone());
        }
        state.resources.insert(key(id), body.clone());
        Ok(ApiResponse {
            body,
            operation: state.accept(FakeCall::Update),
        })
    }

    async fn delete(
        &self,
        _ctx: &OperationContext,
        id: &ResourceId,
    ) -> Result<Option<OperationHandle>, ApiError> {
        let mut state = self.state();
        state.record(FakeCall::Delete)?;
        if state.resources.remove(&key(id)).is_none() {
            return Err(not_found(id));
        }
        Ok(state.accept(FakeCall::Delete))
    }

    async fn cancel_in_flight(
        &self,
        _ctx: &OperationContext,
        id: &ResourceId,
    ) -> Result<Option<OperationHandle>, ApiError> {
        if self.cancel_unsupported {
            return Err(ApiError::Unsupported(format!(
                "cancelling in-flight operations on {}",
                id
            )));
        }
        let handle = {
            let mut state = self.state();
            state.record(FakeCall::CancelInFlight)?;
            if !state.resources.contains_key(&key(id)) {
                return Err(not_found(id));
            }
            state.accept(FakeCall::CancelInFlight)
        };
        self.set_property(id, "allocationState", "Steady");
        Ok(handle)
    }
}

// =========================================================================
// Reference resource
// =========================================================================

/// One rule of a [`Widget`]. Rules have no natural identity and the API may
/// return them in any order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WidgetRule {
    /// Rule name.
    pub name: String,
    /// Evaluation priority.
    pub priority: u32,
}

impl WidgetRule {
    /// Create a rule.
    pub fn new(name: impl Into<String>, priority: u32) -> Self {
        Self {
            name: name.into(),
            priority,
        }
    }
}

/// Legacy authentication block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Whether authentication is enforced.
    pub enabled: bool,
    /// Token issuer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
}

/// Current authentication block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettingsV2 {
    /// Whether authentication is enforced.
    pub enabled: bool,
    /// Token issuer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    /// Reject plain HTTP callers.
    pub require_https: bool,
}

/// A small reference resource exercising the engine's edge cases.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Widget {
    /// Resource name.
    pub name: String,
    /// Resource group.
    pub resource_group: String,
    /// Azure location, compared case-insensitively.
    pub location: String,
    /// SKU name. Changing it is a resize.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    /// Tags.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    /// Rules, compared as a set.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<WidgetRule>,
    /// Legacy authentication block.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_settings: Option<AuthSettings>,
    /// Current authentication block.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_settings_v2: Option<AuthSettingsV2>,
    /// Computed allocation state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocation_state: Option<String>,
}

impl Widget {
    /// A widget with only its required attributes.
    pub fn new(
        name: impl Into<String>,
        resource_group: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            resource_group: resource_group.into(),
            location: location.into(),
            ..Default::default()
        }
    }

    /// Set the size.
    pub fn with_size(mut self, size: impl Into<String>) -> Self {
        self.size = Some(size.into());
        self
    }

    /// Add a tag.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Add a rule.
    pub fn with_rule(mut self, rule: WidgetRule) -> Self {
        self.rules.push(rule);
        self
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireSku {
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WireAuth {
    enabled: bool,
    issuer: Option<String>,
    require_https: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WireProperties {
    rules: Vec<WidgetRule>,
    auth_settings: Option<WireAuth>,
    allocation_state: Option<String>,
}

/// Codec for [`Widget`], addressed as
/// `/subscriptions/{sub}/resourceGroups/{rg}/widgets/{name}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WidgetCodec;

impl ResourceCodec for WidgetCodec {
    type Model = Widget;

    fn resource_type(&self) -> &str {
        "hemmer_widget"
    }

    fn resource_id(&self, subscription_id: &str, desired: &Widget) -> ResourceId {
        ResourceId::new(
            subscription_id,
            Some(desired.resource_group.as_str()),
            [("widgets", desired.name.as_str())],
        )
    }

    fn expected_segments(&self) -> &[&'static str] {
        &["widgets"]
    }

    fn expand(&self, desired: &Widget) -> Result<Value, CodecError> {
        if desired.location.trim().is_empty() {
            return Err(CodecError::Invalid {
                field: "location".to_string(),
                reason: "must not be empty".to_string(),
            });
        }

        let mut properties = Map::new();
        if !desired.rules.is_empty() {
            properties.insert("rules".to_string(), serde_json::to_value(&desired.rules)?);
        }
        let auth = match (&desired.auth_settings, &desired.auth_settings_v2) {
            (Some(legacy), _) => Some(json!({
                "enabled": legacy.enabled,
                "issuer": legacy.issuer,
            })),
            (None, Some(current)) => Some(json!({
                "enabled": current.enabled,
                "issuer": current.issuer,
                "requireHttps": current.require_https,
            })),
            (None, None) => None,
        };
        if let Some(auth) = auth {
            properties.insert("authSettings".to_string(), auth);
        }

        let mut payload = json!({
            "location": normalize_location(&desired.location),
            "tags": desired.tags,
            "properties": properties,
        });
        if let Some(size) = &desired.size {
            payload["sku"] = json!({ "name": size });
        }
        Ok(payload)
    }

    fn flatten(
        &self,
        id: &ResourceId,
        response: &Value,
        config: Option<&Widget>,
    ) -> Result<Widget, CodecError> {
        let name = id
            .segment("widgets")
            .ok_or_else(|| CodecError::Missing("widgets segment in id".to_string()))?;
        let sku: WireSku = decode_section(response, "/sku")?;
        let tags: BTreeMap<String, String> = decode_section(response, "/tags")?;
        let properties: WireProperties = decode_section(response, "/properties")?;

        let generation =
            ShapeGeneration::detect(config.is_some_and(|c| c.auth_settings.is_some()));
        let (auth_settings, auth_settings_v2) = resolve_shapes(
            generation,
            properties.auth_settings,
            |auth| AuthSettings {
                enabled: auth.enabled,
                issuer: auth.issuer,
            },
            |auth| AuthSettingsV2 {
                enabled: auth.enabled,
                issuer: auth.issuer,
                require_https: auth.require_https,
            },
        );

        Ok(Widget {
            name: name.to_string(),
            resource_group: id.resource_group().unwrap_or_default().to_string(),
            location: response
                .get("location")
                .and_then(Value::as_str)
                .map(normalize_location)
                .unwrap_or_default(),
            size: sku.name,
            tags: filter_tags(&tags, &["$type"]),
            rules: properties.rules,
            auth_settings,
            auth_settings_v2,
            allocation_state: properties.allocation_state,
        })
    }

    fn activity(&self, response: &Value) -> Activity {
        match response
            .pointer("/properties/allocationState")
            .and_then(Value::as_str)
        {
            None => Activity::Steady,
            Some(state) if state.eq_ignore_ascii_case("steady") => Activity::Steady,
            Some(state) => Activity::InFlight {
                operation: state.to_lowercase(),
            },
        }
    }

    fn requires_quiescence(&self, prior: &Widget, desired: &Widget) -> bool {
        prior.size != desired.size
    }

    fn drift_rules(&self) -> DriftRules {
        DriftRules::new()
            .case_insensitive("location")
            .unordered("rules")
            .ignore("allocation_state")
    }
}

/// A [`WidgetCodec`] whose responses never flatten.
///
/// Creates through it reach the API and then fail, leaving a remote object
/// behind.
pub struct UnreadableWidgetCodec;

impl ResourceCodec for UnreadableWidgetCodec {
    type Model = Widget;

    fn resource_type(&self) -> &str {
        "hemmer_unreadable_widget"
    }

    fn resource_id(&self, subscription_id: &str, desired: &Widget) -> ResourceId {
        WidgetCodec.resource_id(subscription_id, desired)
    }

    fn expand(&self, desired: &Widget) -> Result<Value, CodecError> {
        WidgetCodec.expand(desired)
    }

    fn flatten(
        &self,
        _id: &ResourceId,
        _response: &Value,
        _config: Option<&Widget>,
    ) -> Result<Widget, CodecError> {
        Err(CodecError::Invalid {
            field: "properties".to_string(),
            reason: "unrecognised response shape".to_string(),
        })
    }
}

// =========================================================================
// Lifecycle harness
// =========================================================================

/// Runs host lifecycles against a [`ProviderRegistry`].
pub struct ReconcileTester {
    registry: ProviderRegistry,
    ctx: OperationContext,
}

impl ReconcileTester {
    /// Create a tester.
    pub fn new(registry: ProviderRegistry) -> Self {
        Self {
            registry,
            ctx: OperationContext::new(),
        }
    }

    /// Use `ctx` for every call.
    pub fn with_context(mut self, ctx: OperationContext) -> Self {
        self.ctx = ctx;
        self
    }

    /// The registry under test.
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Run a create lifecycle: plan, create, read.
    ///
    /// Returns the state after the read.
    pub async fn lifecycle_create(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<Value, ReconcileError> {
        let plan = self.registry.plan(resource_type, None, config)?;
        assert_plan_creates(&plan);

        let created = self
            .registry
            .create(&self.ctx, resource_type, plan.planned_state)
            .await?;
        self.read_existing(resource_type, created).await
    }

    /// Run an update lifecycle: plan, update, read.
    ///
    /// Returns the state after the read.
    pub async fn lifecycle_update(
        &self,
        resource_type: &str,
        prior_state: Value,
        proposed_state: Value,
    ) -> Result<Value, ReconcileError> {
        let plan = self
            .registry
            .plan(resource_type, Some(prior_state.clone()), proposed_state)?;
        assert_updates_in_place(&plan);

        let updated = self
            .registry
            .update(
                &self.ctx,
                resource_type,
                prior_state,
                plan.planned_state,
                UpdateOptions::default(),
            )
            .await?;
        self.read_existing(resource_type, updated).await
    }

    /// Run a delete lifecycle.
    pub async fn lifecycle_delete(
        &self,
        resource_type: &str,
        current_state: Value,
    ) -> Result<(), ReconcileError> {
        self.registry
            .delete(&self.ctx, resource_type, current_state)
            .await
    }

    /// Run a full lifecycle: create, update, delete.
    ///
    /// Returns the state after the update.
    pub async fn lifecycle_crud(
        &self,
        resource_type: &str,
        initial_config: Value,
        updated_config: Value,
    ) -> Result<Value, ReconcileError> {
        let created = self.lifecycle_create(resource_type, initial_config).await?;
        let updated = self
            .lifecycle_update(resource_type, created, updated_config)
            .await?;
        self.lifecycle_delete(resource_type, updated.clone()).await?;
        Ok(updated)
    }

    async fn read_existing(
        &self,
        resource_type: &str,
        state: Value,
    ) -> Result<Value, ReconcileError> {
        self.registry
            .read(&self.ctx, resource_type, state)
            .await?
            .ok_or_else(|| {
                ReconcileError::InvalidState(format!(
                    "{} disappeared right after it was written",
                    resource_type
                ))
            })
    }
}

// =========================================================================
// Assertion Helpers
// =========================================================================

fn changed_paths(plan: &PlanResult) -> Vec<&str> {
    plan.changes.iter().map(|c| c.path.as_str()).collect()
}

/// Assert that a plan creates a new resource.
///
/// # Panics
///
/// Panics if the plan has no changes or requires replacement.
pub fn assert_plan_creates(plan: &PlanResult) {
    assert!(
        !plan.changes.is_empty(),
        "Expected plan to have changes for create, but got no changes"
    );
    assert!(!plan.requires_replace, "Expected plan to create, not replace");
}

/// Assert that observed state has not drifted from desired state.
///
/// # Panics
///
/// Panics if the plan has any changes.
pub fn assert_no_drift(plan: &PlanResult) {
    assert!(
        plan.changes.is_empty(),
        "Expected no drift, but got {} change(s): {:?}",
        plan.changes.len(),
        changed_paths(plan)
    );
}

/// Assert that a plan reports drift on a specific attribute path.
///
/// # Panics
///
/// Panics if the plan does not change `path`.
pub fn assert_drift_on(plan: &PlanResult, path: &str) {
    assert!(
        plan.change(path).is_some(),
        "Expected drift on '{}', but it was not changed. Changed attributes: {:?}",
        path,
        changed_paths(plan)
    );
}

/// Assert that a plan requires resource replacement.
///
/// # Panics
///
/// Panics if the plan does not require replacement.
pub fn assert_requires_replace(plan: &PlanResult) {
    assert!(
        plan.requires_replace,
        "Expected plan to require replacement, but it does not"
    );
}

/// Assert that a plan does not require resource replacement.
///
/// # Panics
///
/// Panics if the plan requires replacement.
pub fn assert_updates_in_place(plan: &PlanResult) {
    assert!(
        !plan.requires_replace,
        "Expected plan to update in place, but it requires replacement"
    );
}
