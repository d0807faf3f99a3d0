//! Mapping of a tenant node onto the infra virtual machine backing it.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{DriverError, DriverResult};

pub const PROVIDER_ID_PREFIX: &str = "kubevirt://";
pub const CLUSTER_NAMESPACE_ANNOTATION: &str = "cluster.x-k8s.io/cluster-namespace";
pub const INFRA_VM_NAME_ANNOTATION: &str = "csi.kubevirt.io/infra-vm-name";
pub const INFRA_VM_NAMESPACE_ANNOTATION: &str = "csi.kubevirt.io/infra-vm-namespace";

/// A compute instance in the infra cluster, addressed as `namespace/name`.
///
/// The string form is the CSI node ID published by the node plugin.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceRef {
    pub namespace: String,
    pub name: String,
}

impl InstanceRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Parse a `namespace/name` node ID. Returns `None` for anything else.
    pub fn parse(node_id: &str) -> Option<Self> {
        let (namespace, name) = node_id.split_once('/')?;
        if namespace.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self::new(namespace, name))
    }
}

impl fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Resolve the infra VM for a tenant node from its provider ID and
/// annotations.
///
/// A `kubevirt://<vm>` provider ID paired with the cluster-api namespace
/// annotation wins; otherwise both `csi.kubevirt.io/infra-vm-*` annotations
/// must be present.
pub fn resolve_node_identity(
    provider_id: Option<&str>,
    annotations: &BTreeMap<String, String>,
) -> DriverResult<InstanceRef> {
    let non_empty = |key: &str| annotations.get(key).map(String::as_str).filter(|v| !v.is_empty());

    if let Some(vm_name) =
        provider_id.and_then(|id| id.strip_prefix(PROVIDER_ID_PREFIX)).filter(|n| !n.is_empty())
    {
        if let Some(namespace) = non_empty(CLUSTER_NAMESPACE_ANNOTATION) {
            return Ok(InstanceRef::new(namespace, vm_name));
        }
    }

    if let (Some(name), Some(namespace)) =
        (non_empty(INFRA_VM_NAME_ANNOTATION), non_empty(INFRA_VM_NAMESPACE_ANNOTATION))
    {
        return Ok(InstanceRef::new(namespace, name));
    }

    Err(DriverError::FailedPrecondition(format!(
        "unable to determine the infra VM for this node: set annotations {} and {} on the node \
         (or a {}<vm-name> provider ID with the {} annotation), then restart the node plugin",
        INFRA_VM_NAME_ANNOTATION,
        INFRA_VM_NAMESPACE_ANNOTATION,
        PROVIDER_ID_PREFIX,
        CLUSTER_NAMESPACE_ANNOTATION
    )))
}
