use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::DriverError;

/// Prefix of the hotplugged disk name derived from a volume name.
pub const DISK_NAME_PREFIX: &str = "disk-";

/// Name of the VM disk a volume is hotplugged as.
pub fn disk_name(volume_name: &str) -> String {
    format!("{}{}", DISK_NAME_PREFIX, volume_name)
}

/// Disk bus exposed to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Bus {
    #[default]
    Scsi,
    Virtio,
    Sata,
}

impl Bus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Bus::Scsi => "scsi",
            Bus::Virtio => "virtio",
            Bus::Sata => "sata",
        }
    }
}

impl fmt::Display for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Bus {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scsi" => Ok(Bus::Scsi),
            "virtio" => Ok(Bus::Virtio),
            "sata" => Ok(Bus::Sata),
            other => Err(DriverError::InvalidArgument(format!(
                "unknown bus type {}, expected one of scsi, virtio, sata",
                other
            ))),
        }
    }
}

/// Where a new DataVolume gets its initial content from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum VolumeSource {
    #[default]
    Blank,
    Snapshot { namespace: String, name: String },
    Claim { namespace: String, name: String },
}

impl VolumeSource {
    /// The same source with an empty namespace replaced by `namespace`.
    pub fn or_namespace(&self, namespace: &str) -> VolumeSource {
        let fill = |ns: &str| if ns.is_empty() { namespace.to_string() } else { ns.to_string() };
        match self {
            VolumeSource::Blank => VolumeSource::Blank,
            VolumeSource::Snapshot { namespace: ns, name } => {
                VolumeSource::Snapshot { namespace: fill(ns), name: name.clone() }
            }
            VolumeSource::Claim { namespace: ns, name } => {
                VolumeSource::Claim { namespace: fill(ns), name: name.clone() }
            }
        }
    }
}

/// A DataVolume in the infra cluster.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoteVolume {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub storage_class: Option<String>,
    pub size_bytes: i64,
    pub labels: BTreeMap<String, String>,
    pub source: VolumeSource,
}

/// Desired state of a DataVolume about to be created.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NewRemoteVolume {
    pub name: String,
    pub size_bytes: i64,
    pub storage_class: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub source: VolumeSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageClassInfo {
    pub name: String,
    pub provisioner: String,
    pub is_default: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotClassInfo {
    pub name: String,
    pub driver: String,
    pub is_default: bool,
}

/// Result of resolving which snapshot class backs a storage class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotClassBinding {
    pub storage_class: String,
    pub provisioner: String,
    pub snapshot_class: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimInfo {
    pub namespace: String,
    pub name: String,
    pub volume_name: Option<String>,
    pub storage_class: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentVolumeInfo {
    pub name: String,
    pub storage_class: Option<String>,
}

/// A running VirtualMachineInstance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub namespace: String,
    pub name: String,
    /// Firmware UUID, reported by the guest as its system UUID.
    pub hardware_id: Option<String>,
}

/// A hotplug request for a DataVolume on a VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub disk_name: String,
    pub volume_name: String,
    pub serial: String,
    pub bus: Bus,
}

/// A VolumeSnapshot in the infra cluster.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoteSnapshot {
    pub name: String,
    pub namespace: String,
    pub source_volume: String,
    pub snapshot_class: Option<String>,
    pub ready_to_use: bool,
    pub restore_size_bytes: Option<i64>,
    pub creation_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NewRemoteSnapshot {
    pub name: String,
    pub source_volume: String,
    pub snapshot_class: String,
    pub labels: BTreeMap<String, String>,
}

/// Parse a Kubernetes resource quantity into bytes.
///
/// Handles plain integers, binary (`Ki`..`Ei`) and decimal (`m`, `k`..`E`)
/// suffixes and decimal exponents (`1e9`). Fractional byte counts are
/// rounded up.
pub fn parse_quantity(quantity: &str) -> Option<i64> {
    let quantity = quantity.trim();
    let split = quantity.find(|c: char| c.is_ascii_alphabetic()).unwrap_or(quantity.len());
    let (number, suffix) = quantity.split_at(split);

    let multiplier: f64 = match suffix {
        "" => 1.0,
        "m" => 1e-3,
        "Ki" => 1024f64,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        exponent => match exponent.strip_prefix(['e', 'E']).map(str::parse::<i32>) {
            Some(Ok(power)) if exponent.len() > 1 => 10f64.powi(power),
            _ => return None,
        },
    };

    if multiplier >= 1.0 {
        if let Ok(value) = number.parse::<i64>() {
            return value.checked_mul(multiplier as i64);
        }
    }
    let value = number.parse::<f64>().ok()?;
    let bytes = (value * multiplier).ceil();
    if bytes.is_finite() && bytes >= 0.0 && bytes <= i64::MAX as f64 {
        Some(bytes as i64)
    } else {
        None
    }
}
