//! CSI driver that provisions tenant-cluster volumes as DataVolumes in a
//! KubeVirt infra cluster and hotplugs them into the tenant's virtual machines.

pub mod config;
pub mod csi;
pub mod device;
pub mod error;
pub mod infra;
pub mod node_identity;
pub mod policy;

pub use error::{DriverError, DriverResult};
