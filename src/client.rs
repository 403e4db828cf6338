//! The remote API seam.
//!
//! The engine never speaks HTTP. It talks to an [`ArmClient`], which hides
//! transport, authentication, and API versions behind four calls plus
//! operation polling. Production code wraps an SDK client; tests use
//! [`FakeArmClient`](crate::testing::FakeArmClient).

use async_trait::async_trait;
use serde_json::Value;

use crate::context::OperationContext;
use crate::error::ApiError;
use crate::lro::{OperationHandle, OperationSource};
use crate::resource_id::ResourceId;

/// Response to a mutating call.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    /// Response body, possibly empty.
    pub body: Value,
    /// Handle to poll if the server accepted the request asynchronously.
    pub operation: Option<OperationHandle>,
}

impl ApiResponse {
    /// The server finished synchronously.
    pub fn completed(body: Value) -> Self {
        Self {
            body,
            operation: None,
        }
    }

    /// The server accepted the request and will finish it in the background.
    pub fn accepted(body: Value, operation: OperationHandle) -> Self {
        Self {
            body,
            operation: Some(operation),
        }
    }
}

/// Abstract client for one resource type's ARM endpoints.
#[async_trait]
pub trait ArmClient: OperationSource {
    /// Create (PUT) a resource.
    async fn create(
        &self,
        ctx: &OperationContext,
        id: &ResourceId,
        payload: Value,
    ) -> Result<ApiResponse, ApiError>;

    /// Retrieve (GET) a resource. A missing resource is an error for which
    /// [`ApiError::is_not_found`] holds.
    async fn get(&self, ctx: &OperationContext, id: &ResourceId) -> Result<Value, ApiError>;

    /// Update (PATCH or PUT) a resource.
    async fn update(
        &self,
        ctx: &OperationContext,
        id: &ResourceId,
        payload: Value,
    ) -> Result<ApiResponse, ApiError>;

    /// Delete a resource.
    async fn delete(
        &self,
        ctx: &OperationContext,
        id: &ResourceId,
    ) -> Result<Option<OperationHandle>, ApiError>;

    /// Stop whatever mutation is currently running on the resource.
    ///
    /// Services without a cancel endpoint keep the default, which reports the
    /// call as unsupported.
    async fn cancel_in_flight(
        &self,
        ctx: &OperationContext,
        id: &ResourceId,
    ) -> Result<Option<OperationHandle>, ApiError> {
        let _ = ctx;
        Err(ApiError::Unsupported(format!(
            "cancelling in-flight operations on {}",
            id
        )))
    }
}
