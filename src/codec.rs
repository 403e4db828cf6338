//! Translation between typed resource models and API payloads.
//!
//! Each resource type supplies a [`ResourceCodec`]. The engine is generic over
//! the codec and never inspects payloads itself: expanding desired state into
//! a request body, flattening a response back into the model, deriving the
//! natural id, and reporting whether a mutation is in flight are all the
//! codec's job.

use std::collections::BTreeMap;
use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::drift::DriftRules;
use crate::error::CodecError;
use crate::resource_id::ResourceId;

/// Whether a resource is busy with a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activity {
    /// Nothing is running.
    Steady,
    /// A mutation is running on the resource.
    InFlight {
        /// What is running, e.g. `resize`.
        operation: String,
    },
}

impl Activity {
    /// State name used while waiting for a resource to settle.
    pub const STEADY: &str = "Steady";
    /// State name used while a mutation is running.
    pub const IN_FLIGHT: &str = "InFlight";

    /// Whether a mutation is running.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::InFlight { .. })
    }

    /// The state name of this activity.
    pub fn state(&self) -> &'static str {
        match self {
            Self::Steady => Self::STEADY,
            Self::InFlight { .. } => Self::IN_FLIGHT,
        }
    }
}

/// Resource-type-specific translation logic.
///
/// # Example
///
/// ```
/// use hemmer_arm_reconcile::{CodecError, ResourceCodec, ResourceId};
/// use serde::{Deserialize, Serialize};
/// use serde_json::{json, Value};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct Vault {
///     name: String,
///     resource_group: String,
///     location: String,
/// }
///
/// struct VaultCodec;
///
/// impl ResourceCodec for VaultCodec {
///     type Model = Vault;
///
///     fn resource_type(&self) -> &str {
///         "hemmer_key_vault"
///     }
///
///     fn resource_id(&self, subscription_id: &str, desired: &Vault) -> ResourceId {
///         ResourceId::new(subscription_id, Some(desired.resource_group.as_str()), [("vaults", &desired.name)])
///             .with_provider("Microsoft.KeyVault")
///     }
///
///     fn expand(&self, desired: &Vault) -> Result<Value, CodecError> {
///         Ok(json!({ "location": desired.location }))
///     }
///
///     fn flatten(&self, id: &ResourceId, response: &Value, _config: Option<&Vault>) -> Result<Vault, CodecError> {
///         Ok(Vault {
///             name: id.name().unwrap_or_default().to_string(),
///             resource_group: id.resource_group().unwrap_or_default().to_string(),
///             location: response["location"].as_str().unwrap_or_default().to_string(),
///         })
///     }
/// }
/// ```
pub trait ResourceCodec: Send + Sync + 'static {
    /// The typed model of the resource.
    type Model: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Host-facing resource type name, e.g. `hemmer_batch_pool`.
    fn resource_type(&self) -> &str;

    /// The natural id of a desired resource.
    fn resource_id(&self, subscription_id: &str, desired: &Self::Model) -> ResourceId;

    /// The segment types an imported id must have. Empty skips the check.
    fn expected_segments(&self) -> &[&'static str] {
        &[]
    }

    /// Build a request payload from desired state.
    fn expand(&self, desired: &Self::Model) -> Result<Value, CodecError>;

    /// Build the model from a response.
    ///
    /// `config` is the last desired state when there is one. It lets the codec
    /// keep values the API never echoes back, and pick between alternative
    /// shapes the caller may have used.
    fn flatten(
        &self,
        id: &ResourceId,
        response: &Value,
        config: Option<&Self::Model>,
    ) -> Result<Self::Model, CodecError>;

    /// Whether a mutation is running on the resource.
    fn activity(&self, response: &Value) -> Activity {
        let _ = response;
        Activity::Steady
    }

    /// Whether moving from `prior` to `desired` must wait for in-flight
    /// mutations to finish first.
    fn requires_quiescence(&self, prior: &Self::Model, desired: &Self::Model) -> bool {
        let _ = (prior, desired);
        true
    }

    /// Comparison rules for drift detection.
    fn drift_rules(&self) -> DriftRules {
        DriftRules::default()
    }

    /// The id the server reports for the resource.
    fn response_id<'a>(&self, response: &'a Value) -> Option<&'a str> {
        response.get("id").and_then(Value::as_str)
    }
}

/// Drop tags whose keys are in `hidden`, compared case-insensitively.
///
/// Some services attach bookkeeping tags (such as `$type`) that callers never
/// set. Codecs call this while flattening so those tags do not show up as
/// drift.
pub fn filter_tags(tags: &BTreeMap<String, String>, hidden: &[&str]) -> BTreeMap<String, String> {
    tags.iter()
        .filter(|(key, _)| !hidden.iter().any(|h| h.eq_ignore_ascii_case(key)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Decode the section of `response` at JSON `pointer`.
///
/// An absent or null section decodes to `T::default()`, so optional nested
/// blocks never need special casing.
pub fn decode_section<T>(response: &Value, pointer: &str) -> Result<T, CodecError>
where
    T: DeserializeOwned + Default,
{
    match response.pointer(pointer) {
        None | Some(Value::Null) => Ok(T::default()),
        Some(section) => Ok(serde_json::from_value(section.clone())?),
    }
}

/// Which of two alternative attribute shapes a caller is using.
///
/// Services sometimes replace a nested block with a new shape while keeping the
/// old one readable. The caller uses exactly one, and flattening must fill only
/// that one or it would report drift on the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShapeGeneration {
    /// The older shape.
    Legacy,
    /// The current shape.
    #[default]
    Current,
}

impl ShapeGeneration {
    /// Pick the generation from whether the caller set the legacy shape.
    pub fn detect(legacy_configured: bool) -> Self {
        if legacy_configured {
            Self::Legacy
        } else {
            Self::Current
        }
    }
}

/// Fill exactly one of two alternative shapes from an observed section.
pub fn resolve_shapes<T, L, C>(
    generation: ShapeGeneration,
    observed: Option<T>,
    to_legacy: impl FnOnce(T) -> L,
    to_current: impl FnOnce(T) -> C,
) -> (Option<L>, Option<C>) {
    match (generation, observed) {
        (_, None) => (None, None),
        (ShapeGeneration::Legacy, Some(section)) => (Some(to_legacy(section)), None),
        (ShapeGeneration::Current, Some(section)) => (None, Some(to_current(section))),
    }
}
