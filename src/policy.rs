//! Operator policy deciding which infra storage classes and snapshot classes
//! tenants may use.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{DriverError, DriverResult};

/// One `storageSnapshotMapping` entry: the snapshot classes permitted for a
/// group of storage classes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageSnapshotMapping {
    #[serde(default, alias = "storageclasses")]
    pub storage_classes: Vec<String>,
    #[serde(default, alias = "volumesnapshotclasses")]
    pub volume_snapshot_classes: Vec<String>,
}

/// The `infraStorageClassEnforcement` document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageClassEnforcement {
    #[serde(default, alias = "allowall")]
    pub allow_all: bool,
    #[serde(default, alias = "allowdefault")]
    pub allow_default: bool,
    #[serde(default, alias = "allowlist")]
    pub allow_list: Vec<String>,
    #[serde(default, alias = "storagesnapshotmapping")]
    pub storage_snapshot_mapping: Vec<StorageSnapshotMapping>,
}

/// Snapshot classes a storage class may be snapshotted with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotClassRestriction {
    Unrestricted,
    Only(BTreeSet<String>),
}

impl SnapshotClassRestriction {
    pub fn permits(&self, snapshot_class: &str) -> bool {
        match self {
            Self::Unrestricted => true,
            Self::Only(set) => set.contains(snapshot_class),
        }
    }
}

/// Outcome of checking a snapshot class request against the mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotClassDecision {
    /// Use exactly this snapshot class.
    Use(String),
    /// Resolve the provisioner default, then check it with `restriction`.
    ResolveDefault(SnapshotClassRestriction),
}

impl Default for StorageClassEnforcement {
    /// No document configured means no restriction.
    fn default() -> Self {
        Self {
            allow_all: true,
            allow_default: false,
            allow_list: Vec::new(),
            storage_snapshot_mapping: Vec::new(),
        }
    }
}

impl StorageClassEnforcement {
    pub fn is_allowed(&self, storage_class: &str, is_cluster_default: bool) -> bool {
        if self.allow_all {
            return true;
        }
        if self.allow_list.iter().any(|allowed| allowed == storage_class) {
            return true;
        }
        self.allow_default && is_cluster_default
    }

    /// True when the decision depends on whether the class is the cluster default.
    pub fn needs_default_lookup(&self, storage_class: &str) -> bool {
        !self.allow_all
            && self.allow_default
            && !self.allow_list.iter().any(|allowed| allowed == storage_class)
    }

    pub fn check_storage_class(
        &self,
        storage_class: &str,
        is_cluster_default: bool,
    ) -> DriverResult<()> {
        if self.is_allowed(storage_class, is_cluster_default) {
            return Ok(());
        }
        let shown = if storage_class.is_empty() { "<cluster default>" } else { storage_class };
        Err(DriverError::PermissionDenied(format!(
            "infra storage class {} is not allowed by the storage class enforcement policy",
            shown
        )))
    }

    pub fn permitted_snapshot_classes(&self, storage_class: &str) -> SnapshotClassRestriction {
        let mut permitted = BTreeSet::new();
        let mut mapped = false;

        for mapping in &self.storage_snapshot_mapping {
            if mapping.storage_classes.iter().any(|sc| sc == storage_class) {
                mapped = true;
                permitted.extend(mapping.volume_snapshot_classes.iter().cloned());
            }
        }

        if mapped { SnapshotClassRestriction::Only(permitted) } else { SnapshotClassRestriction::Unrestricted }
    }

    /// Decide which snapshot class a request may use.
    ///
    /// An explicit name is always checked against the mapping. With no name
    /// and a mapping listing a single class, that class is used instead of
    /// the provisioner default.
    pub fn check_snapshot_class(
        &self,
        storage_class: &str,
        requested: &str,
    ) -> DriverResult<SnapshotClassDecision> {
        let restriction = self.permitted_snapshot_classes(storage_class);

        if !requested.is_empty() {
            if !restriction.permits(requested) {
                return Err(DriverError::PermissionDenied(format!(
                    "volume snapshot class {} is not permitted for storage class {}",
                    requested, storage_class
                )));
            }
            return Ok(SnapshotClassDecision::Use(requested.to_string()));
        }

        match restriction {
            SnapshotClassRestriction::Only(set) if set.len() == 1 => {
                let only = set.into_iter().next().unwrap_or_default();
                Ok(SnapshotClassDecision::Use(only))
            }
            SnapshotClassRestriction::Only(set) if set.is_empty() => {
                Err(DriverError::PermissionDenied(format!(
                    "no volume snapshot class is permitted for storage class {}",
                    storage_class
                )))
            }
            restriction => Ok(SnapshotClassDecision::ResolveDefault(restriction)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn restricted() -> StorageClassEnforcement {
        StorageClassEnforcement {
            allow_all: false,
            allow_default: false,
            allow_list: vec!["sc-a".to_string()],
            storage_snapshot_mapping: Vec::new(),
        }
    }

    #[test]
    fn test_allow_all() {
        let policy = StorageClassEnforcement::default();
        assert!(policy.is_allowed("anything", false));
        assert!(policy.is_allowed("", true));
    }

    #[test]
    fn test_allow_list() {
        let policy = restricted();
        assert!(policy.is_allowed("sc-a", false));
        assert!(!policy.is_allowed("sc-b", false));
        assert!(!policy.is_allowed("sc-b", true));
    }

    #[test]
    fn test_allow_default() {
        let policy = StorageClassEnforcement { allow_default: true, ..restricted() };
        assert!(policy.is_allowed("sc-b", true));
        assert!(!policy.is_allowed("sc-b", false));
        assert!(policy.needs_default_lookup("sc-b"));
        assert!(!policy.needs_default_lookup("sc-a"));
    }

    #[test]
    fn test_check_storage_class_denied() {
        let err = restricted().check_storage_class("sc-b", false).unwrap_err();
        assert!(matches!(err, DriverError::PermissionDenied(_)));
        assert!(err.to_string().contains("sc-b"));
    }

    #[test]
    fn test_permitted_snapshot_classes() {
        let policy = StorageClassEnforcement {
            storage_snapshot_mapping: vec![
                StorageSnapshotMapping {
                    storage_classes: vec!["sc-a".into(), "sc-b".into()],
                    volume_snapshot_classes: vec!["vsc-1".into()],
                },
                StorageSnapshotMapping {
                    storage_classes: vec!["sc-b".into()],
                    volume_snapshot_classes: vec!["vsc-2".into()],
                },
            ],
            ..restricted()
        };

        assert_eq!(
            policy.permitted_snapshot_classes("sc-a"),
            SnapshotClassRestriction::Only(BTreeSet::from(["vsc-1".to_string()]))
        );
        assert_eq!(
            policy.permitted_snapshot_classes("sc-b"),
            SnapshotClassRestriction::Only(BTreeSet::from([
                "vsc-1".to_string(),
                "vsc-2".to_string()
            ]))
        );
        assert_eq!(policy.permitted_snapshot_classes("sc-c"), SnapshotClassRestriction::Unrestricted);
    }

    #[test]
    fn test_explicit_snapshot_class_checked_against_mapping() {
        let policy = StorageClassEnforcement {
            storage_snapshot_mapping: vec![StorageSnapshotMapping {
                storage_classes: vec!["sc-a".into()],
                volume_snapshot_classes: vec!["vsc-1".into(), "vsc-2".into()],
            }],
            ..restricted()
        };

        assert_eq!(
            policy.check_snapshot_class("sc-a", "vsc-2").unwrap(),
            SnapshotClassDecision::Use("vsc-2".into())
        );
        let err = policy.check_snapshot_class("sc-a", "vsc-3").unwrap_err();
        assert!(matches!(err, DriverError::PermissionDenied(_)));
    }

    #[test]
    fn test_single_mapped_class_is_remapped() {
        let policy = StorageClassEnforcement {
            storage_snapshot_mapping: vec![StorageSnapshotMapping {
                storage_classes: vec!["sc-a".into()],
                volume_snapshot_classes: vec!["vsc-only".into()],
            }],
            ..restricted()
        };

        assert_eq!(
            policy.check_snapshot_class("sc-a", "").unwrap(),
            SnapshotClassDecision::Use("vsc-only".into())
        );
    }

    #[test]
    fn test_unmapped_class_resolves_default() {
        assert_eq!(
            restricted().check_snapshot_class("sc-a", "").unwrap(),
            SnapshotClassDecision::ResolveDefault(SnapshotClassRestriction::Unrestricted)
        );
        assert_eq!(
            restricted().check_snapshot_class("sc-a", "anything").unwrap(),
            SnapshotClassDecision::Use("anything".into())
        );
    }

    #[test]
    fn test_deserialize_document() {
        let doc = r#"{
            "allowAll": false,
            "allowDefault": true,
            "allowList": ["sc-a", "sc-b"],
            "storageSnapshotMapping": [
                {"storageClasses": ["sc-a"], "volumeSnapshotClasses": ["vsc-a"]}
            ]
        }"#;

        let policy: StorageClassEnforcement = serde_json::from_str(doc).unwrap();
        assert!(!policy.allow_all);
        assert!(policy.allow_default);
        assert_eq!(policy.allow_list, vec!["sc-a", "sc-b"]);
        assert_eq!(policy.storage_snapshot_mapping[0].volume_snapshot_classes, vec!["vsc-a"]);
    }

    #[test]
    fn test_deserialize_missing_fields_is_deny_all() {
        let policy: StorageClassEnforcement = serde_json::from_str("{}").unwrap();
        assert!(!policy.allow_all);
        assert!(!policy.is_allowed("sc-a", true));
    }
}
