//! Structured Azure Resource Manager identifiers.
//!
//! An ARM id is a slash-delimited path that starts at a subscription and names
//! a resource below it:
//!
//! ```text
//! /subscriptions/{sub}/resourceGroups/{rg}/providers/{namespace}/{type}/{name}[/{type}/{name}...]
//! ```
//!
//! The `resourceGroups` and `providers` parts are optional. Keywords are matched
//! case-insensitively and values are preserved as given. Two ids that differ
//! only in casing compare equal, because the API does not treat casing as
//! significant and frequently returns ids in a different case than it was sent.
//!
//! # Example
//!
//! ```
//! use hemmer_arm_reconcile::ResourceId;
//!
//! let id = ResourceId::new("0000", Some("rg1"), [("widgets", "w1")]);
//! let parsed: ResourceId = id.to_string().parse().unwrap();
//!
//! assert_eq!(parsed, id);
//! assert_eq!(parsed.resource_group(), Some("rg1"));
//! assert_eq!(parsed.segment("Widgets"), Some("w1"));
//! assert_eq!(parsed.segment("gadgets"), None);
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

const SUBSCRIPTIONS: &str = "subscriptions";
const RESOURCE_GROUPS: &str = "resourceGroups";
const PROVIDERS: &str = "providers";

/// One `{type}/{name}` pair of a resource id.
#[derive(Debug, Clone)]
pub struct Segment {
    /// The resource type key, e.g. `virtualMachines`.
    pub resource_type: String,
    /// The resource name.
    pub name: String,
}

impl Segment {
    /// Create a new segment.
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }
}

impl PartialEq for Segment {
    fn eq(&self, other: &Self) -> bool {
        self.resource_type.eq_ignore_ascii_case(&other.resource_type)
            && self.name.eq_ignore_ascii_case(&other.name)
    }
}

impl Eq for Segment {}

/// A parsed Azure Resource Manager resource id.
///
/// Ids always name something below the subscription: a resource group, one or
/// more typed segments, or both. Each resource type appears at most once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId {
    subscription_id: String,
    resource_group: Option<String>,
    provider: Option<String>,
    segments: Vec<Segment>,
}

impl ResourceId {
    /// Build an id from a known scope and ordered segments.
    ///
    /// The caller is responsible for supplying valid, distinct segment types
    /// and at least a resource group or one segment. An empty resource group is
    /// treated as absent.
    pub fn new<I, T, N>(
        subscription_id: impl Into<String>,
        resource_group: Option<&str>,
        segments: I,
    ) -> Self
    where
        I: IntoIterator<Item = (T, N)>,
        T: Into<String>,
        N: Into<String>,
    {
        let id = Self {
            subscription_id: subscription_id.into(),
            resource_group: resource_group
                .filter(|rg| !rg.is_empty())
                .map(str::to_string),
            provider: None,
            segments: segments
                .into_iter()
                .map(|(t, n)| Segment::new(t, n))
                .collect(),
        };
        debug_assert!(
            id.resource_group.is_some() || !id.segments.is_empty(),
            "a bare subscription is not a resource id"
        );
        id
    }

    /// Set the provider namespace, e.g. `Microsoft.Compute`.
    pub fn with_provider(mut self, namespace: impl Into<String>) -> Self {
        self.provider = Some(namespace.into()).filter(|ns| !ns.is_empty());
        self
    }

    /// Parse an id string.
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let input = raw.trim();
        if input.is_empty() {
            return Err(ParseError::Empty);
        }

        let path = input.trim_start_matches('/').trim_end_matches('/');
        let components: Vec<&str> = path.split('/').collect();
        if components.len() % 2 != 0 {
            return Err(ParseError::OddSegments {
                input: input.to_string(),
            });
        }

        let mut pairs = components.chunks_exact(2).map(|pair| (pair[0], pair[1]));

        let subscription_id = match pairs.next() {
            Some((key, value)) if key.eq_ignore_ascii_case(SUBSCRIPTIONS) => {
                if value.is_empty() {
                    return Err(ParseError::EmptySegment {
                        input: input.to_string(),
                        key: SUBSCRIPTIONS.to_string(),
                    });
                }
                value.to_string()
            }
            _ => {
                return Err(ParseError::MissingSubscription {
                    input: input.to_string(),
                })
            }
        };

        let mut resource_group = None;
        let mut provider = None;
        let mut segments: Vec<Segment> = Vec::new();

        for (index, (key, value)) in pairs.enumerate() {
            if key.is_empty() || value.is_empty() {
                return Err(ParseError::EmptySegment {
                    input: input.to_string(),
                    key: key.to_string(),
                });
            }

            if index == 0 && key.eq_ignore_ascii_case(RESOURCE_GROUPS) {
                resource_group = Some(value.to_string());
            } else if provider.is_none() && segments.is_empty() && key.eq_ignore_ascii_case(PROVIDERS)
            {
                provider = Some(value.to_string());
            } else {
                if segments
                    .iter()
                    .any(|s| s.resource_type.eq_ignore_ascii_case(key))
                {
                    return Err(ParseError::DuplicateSegment {
                        input: input.to_string(),
                        resource_type: key.to_string(),
                    });
                }
                segments.push(Segment::new(key, value));
            }
        }

        if resource_group.is_none() && segments.is_empty() {
            return Err(ParseError::NoSegments {
                input: input.to_string(),
            });
        }

        Ok(Self {
            subscription_id,
            resource_group,
            provider,
            segments,
        })
    }

    /// Parse an id and check it has exactly the expected segment types.
    pub fn parse_as(raw: &str, expected: &[&str]) -> Result<Self, ParseError> {
        let id = Self::parse(raw)?;
        id.expect_segments(expected)?;
        Ok(id)
    }

    /// Check that the typed segments are exactly `expected`, in order.
    pub fn expect_segments(&self, expected: &[&str]) -> Result<(), ParseError> {
        let matches = self.segments.len() == expected.len()
            && self
                .segments
                .iter()
                .zip(expected)
                .all(|(segment, want)| segment.resource_type.eq_ignore_ascii_case(want));

        if matches {
            Ok(())
        } else {
            Err(ParseError::UnexpectedSegments {
                input: self.to_string(),
                expected: expected.join("/"),
            })
        }
    }

    /// The subscription the resource lives in.
    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    /// The resource group, absent for subscription-scoped resources.
    pub fn resource_group(&self) -> Option<&str> {
        self.resource_group.as_deref()
    }

    /// The provider namespace, if the id has one.
    pub fn provider(&self) -> Option<&str> {
        self.provider.as_deref()
    }

    /// The typed segments, in path order.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Look up the name for a resource type. Absent types yield `None`.
    pub fn segment(&self, resource_type: &str) -> Option<&str> {
        self.segments
            .iter()
            .find(|s| s.resource_type.eq_ignore_ascii_case(resource_type))
            .map(|s| s.name.as_str())
    }

    /// The name of the addressed resource: the last segment, or the resource
    /// group for a resource group id.
    pub fn name(&self) -> Option<&str> {
        self.segments
            .last()
            .map(|s| s.name.as_str())
            .or(self.resource_group.as_deref())
    }

    /// The type of the last segment.
    pub fn resource_type(&self) -> Option<&str> {
        self.segments.last().map(|s| s.resource_type.as_str())
    }

    /// The id of the enclosing resource, if there is one.
    ///
    /// Dropping the only typed segment yields the resource group id.
    pub fn parent(&self) -> Option<ResourceId> {
        if self.segments.is_empty() {
            return None;
        }
        let mut parent = self.clone();
        parent.segments.pop();
        if parent.segments.is_empty() {
            parent.provider = None;
            parent.resource_group.as_ref()?;
        }
        Some(parent)
    }

    /// The id of a nested resource below this one.
    pub fn child(&self, resource_type: impl Into<String>, name: impl Into<String>) -> ResourceId {
        let mut child = self.clone();
        child.segments.push(Segment::new(resource_type, name));
        child
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", SUBSCRIPTIONS, self.subscription_id)?;
        if let Some(rg) = &self.resource_group {
            write!(f, "/{}/{}", RESOURCE_GROUPS, rg)?;
        }
        if let Some(ns) = &self.provider {
            write!(f, "/{}/{}", PROVIDERS, ns)?;
        }
        for segment in &self.segments {
            write!(f, "/{}/{}", segment.resource_type, segment.name)?;
        }
        Ok(())
    }
}

impl FromStr for ResourceId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ResourceId {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> Self {
        id.to_string()
    }
}

fn eq_opt(a: &Option<String>, b: &Option<String>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        (None, None) => true,
        _ => false,
    }
}

impl PartialEq for ResourceId {
    fn eq(&self, other: &Self) -> bool {
        self.subscription_id
            .eq_ignore_ascii_case(&other.subscription_id)
            && eq_opt(&self.resource_group, &other.resource_group)
            && eq_opt(&self.provider, &other.provider)
            && self.segments == other.segments
    }
}

impl Eq for ResourceId {}

impl Hash for ResourceId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_string().to_ascii_lowercase().hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tokio_test::{assert_err, assert_ok};

    const VMSS_ID: &str = "/subscriptions/00000000-0000-0000-0000-000000000000/resourceGroups/example-rg/providers/Microsoft.Compute/virtualMachineScaleSets/vmss1";

    #[test]
    fn test_parse_full_id() {
        let id = assert_ok!(ResourceId::parse(VMSS_ID));
        assert_eq!(id.subscription_id(), "00000000-0000-0000-0000-000000000000");
        assert_eq!(id.resource_group(), Some("example-rg"));
        assert_eq!(id.provider(), Some("Microsoft.Compute"));
        assert_eq!(id.segment("virtualMachineScaleSets"), Some("vmss1"));
        assert_eq!(id.name(), Some("vmss1"));
        assert_eq!(id.resource_type(), Some("virtualMachineScaleSets"));
        assert_eq!(id.to_string(), VMSS_ID);
    }

    #[test]
    fn test_round_trip_built_ids() {
        let ids = vec![
            ResourceId::new("sub", Some("rg1"), [("widgets", "w1")]),
            ResourceId::new("sub", None, [("widgets", "w1")]),
            ResourceId::new("sub", Some("rg1"), Vec::<(String, String)>::new()),
            ResourceId::new(
                "sub",
                Some("rg1"),
                [("batchAccounts", "acct"), ("pools", "pool-1")],
            )
            .with_provider("Microsoft.Batch"),
            ResourceId::new("sub", Some("My RG"), [("sites", "app"), ("slots", "staging")])
                .with_provider("Microsoft.Web"),
        ];

        for id in ids {
            let parsed = ResourceId::parse(&id.to_string()).unwrap();
            assert_eq!(parsed, id, "round trip of {}", id);
        }
    }

    #[test]
    fn test_keywords_are_case_insensitive() {
        let lower = "/SUBSCRIPTIONS/sub/resourcegroups/RG1/PROVIDERS/microsoft.compute/virtualMachines/VM1";
        let id = ResourceId::parse(lower).unwrap();
        assert_eq!(id.resource_group(), Some("RG1"));
        assert_eq!(id.provider(), Some("microsoft.compute"));
        assert_eq!(id.segment("virtualmachines"), Some("VM1"));

        // Canonical keyword casing, values preserved.
        assert_eq!(
            id.to_string(),
            "/subscriptions/sub/resourceGroups/RG1/providers/microsoft.compute/virtualMachines/VM1"
        );
    }

    #[test]
    fn test_case_differences_are_not_distinguishing() {
        let a = ResourceId::parse("/subscriptions/SUB/resourceGroups/rg1/widgets/W1").unwrap();
        let b = ResourceId::parse("/subscriptions/sub/resourcegroups/RG1/Widgets/w1").unwrap();
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_trailing_slash_is_tolerated() {
        let id = ResourceId::parse("/subscriptions/sub/resourceGroups/rg1/widgets/w1/").unwrap();
        assert_eq!(id.segment("widgets"), Some("w1"));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(ResourceId::parse("  "), Err(ParseError::Empty));

        assert!(matches!(
            ResourceId::parse("/resourceGroups/rg1/widgets/w1"),
            Err(ParseError::MissingSubscription { .. })
        ));
        assert!(matches!(
            ResourceId::parse("/subscriptions/sub/resourceGroups/rg1/widgets"),
            Err(ParseError::OddSegments { .. })
        ));
        assert!(matches!(
            ResourceId::parse("/subscriptions/sub/resourceGroups//widgets/w1"),
            Err(ParseError::EmptySegment { .. })
        ));
        assert!(matches!(
            ResourceId::parse("/subscriptions//resourceGroups/rg1"),
            Err(ParseError::EmptySegment { .. })
        ));
        assert!(matches!(
            ResourceId::parse("/subscriptions/sub/resourceGroups/rg1/widgets/a/Widgets/b"),
            Err(ParseError::DuplicateSegment { .. })
        ));
        assert!(matches!(
            ResourceId::parse("/subscriptions/sub"),
            Err(ParseError::NoSegments { .. })
        ));
    }

    #[test]
    fn test_resource_group_id() {
        let id = ResourceId::parse("/subscriptions/sub/resourceGroups/rg1").unwrap();
        assert!(id.segments().is_empty());
        assert_eq!(id.name(), Some("rg1"));
        assert_eq!(id.resource_type(), None);
        assert!(id.parent().is_none());
    }

    #[test]
    fn test_missing_segment_is_not_an_error() {
        let id = ResourceId::new("sub", Some("rg1"), [("widgets", "w1")]);
        assert_eq!(id.segment("gadgets"), None);
    }

    #[test]
    fn test_parent_and_child() {
        let pool = ResourceId::new("sub", Some("rg1"), [("batchAccounts", "acct")])
            .with_provider("Microsoft.Batch")
            .child("pools", "p1");
        assert_eq!(pool.name(), Some("p1"));

        let account = pool.parent().unwrap();
        assert_eq!(account.name(), Some("acct"));
        assert_eq!(account.provider(), Some("Microsoft.Batch"));

        let group = account.parent().unwrap();
        assert_eq!(group.to_string(), "/subscriptions/sub/resourceGroups/rg1");

        let unscoped = ResourceId::new("sub", None, [("widgets", "w1")]);
        assert!(unscoped.parent().is_none());
    }

    #[test]
    fn test_expect_segments() {
        let raw = "/subscriptions/sub/resourceGroups/rg1/providers/Microsoft.Batch/batchAccounts/a/pools/p";
        assert_ok!(ResourceId::parse_as(raw, &["batchAccounts", "pools"]));
        assert_ok!(ResourceId::parse_as(raw, &["BATCHACCOUNTS", "Pools"]));

        let err = assert_err!(ResourceId::parse_as(raw, &["batchAccounts"]));
        assert!(matches!(err, ParseError::UnexpectedSegments { ref expected, .. } if expected == "batchAccounts"));
    }

    #[test]
    fn test_nested_provider_extension() {
        let raw = "/subscriptions/sub/resourceGroups/rg1/providers/Microsoft.Compute/virtualMachines/vm1/providers/Microsoft.Insights/diagnosticSettings/ds";
        let id = ResourceId::parse(raw).unwrap();
        assert_eq!(id.provider(), Some("Microsoft.Compute"));
        assert_eq!(id.segment("providers"), Some("Microsoft.Insights"));
        assert_eq!(id.segment("diagnosticSettings"), Some("ds"));
        assert_eq!(id.to_string(), raw);
    }

    #[test]
    fn test_empty_resource_group_is_absent() {
        let id = ResourceId::new("sub", Some(""), [("widgets", "w1")]);
        assert_eq!(id.resource_group(), None);
        assert_eq!(id.to_string(), "/subscriptions/sub/widgets/w1");
    }

    #[test]
    fn test_serde_as_string() {
        let id = ResourceId::new("sub", Some("rg1"), [("widgets", "w1")]);
        let json = serde_json::to_value(&id).unwrap();
        assert_eq!(json, "/subscriptions/sub/resourceGroups/rg1/widgets/w1");

        let back: ResourceId = serde_json::from_value(json).unwrap();
        assert_eq!(back, id);

        assert_err!(serde_json::from_value::<ResourceId>(serde_json::json!("/nope")));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "a bare subscription is not a resource id")]
    fn test_bare_subscription_is_rejected() {
        let _ = ResourceId::new("sub", Some(""), Vec::<(String, String)>::new());
    }
}
