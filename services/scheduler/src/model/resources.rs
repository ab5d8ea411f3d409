//! Typed resources as carried by offers and consumed by operations.

use std::collections::BTreeMap;

use keel_id::LocalVolumeId;
use serde::{Deserialize, Serialize};

/// Role of resources not reserved for any particular role.
pub const UNRESERVED_ROLE: &str = "*";

/// Scalar comparisons tolerate this much rounding error.
pub(crate) const SCALAR_EPSILON: f64 = 1e-6;

/// Resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceName {
    Cpus,
    Mem,
    Disk,
    Gpus,
    Ports,
}

impl ResourceName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpus => "cpus",
            Self::Mem => "mem",
            Self::Disk => "disk",
            Self::Gpus => "gpus",
            Self::Ports => "ports",
        }
    }
}

impl std::fmt::Display for ResourceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRange {
    pub begin: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(begin: u16, end: u16) -> Self {
        Self { begin, end }
    }

    pub fn single(port: u16) -> Self {
        Self::new(port, port)
    }

    pub fn contains(&self, port: u16) -> bool {
        self.begin <= port && port <= self.end
    }

    pub fn len(&self) -> usize {
        usize::from(self.end.saturating_sub(self.begin)) + 1
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.begin..=self.end
    }
}

/// Collapse a set of ports into sorted, contiguous ranges.
pub fn ports_to_ranges(ports: &[u16]) -> Vec<PortRange> {
    let mut sorted = ports.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut ranges: Vec<PortRange> = Vec::new();
    for port in sorted {
        match ranges.last_mut() {
            Some(last) if last.end.checked_add(1) == Some(port) => last.end = port,
            _ => ranges.push(PortRange::single(port)),
        }
    }
    ranges
}

/// Amount of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceValue {
    Scalar(f64),
    Ranges(Vec<PortRange>),
}

impl ResourceValue {
    pub fn scalar(&self) -> f64 {
        match self {
            Self::Scalar(value) => *value,
            Self::Ranges(_) => 0.0,
        }
    }

    pub fn ranges(&self) -> &[PortRange] {
        match self {
            Self::Scalar(_) => &[],
            Self::Ranges(ranges) => ranges,
        }
    }
}

/// Dynamic reservation metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReservationInfo {
    pub principal: Option<String>,
    pub labels: BTreeMap<String, String>,
}

/// Where on the agent a disk resource lives.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiskSource {
    /// Agent work directory. Splittable.
    #[default]
    Root,
    /// Dedicated directory. Splittable.
    Path { root: String },
    /// Dedicated mount point. Consumed whole.
    Mount { root: String },
}

impl DiskSource {
    pub fn disk_type(&self) -> DiskType {
        match self {
            Self::Root => DiskType::Root,
            Self::Path { .. } => DiskType::Path,
            Self::Mount { .. } => DiskType::Mount,
        }
    }
}

/// Disk source kind requested by a persistent volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskType {
    #[default]
    Root,
    Path,
    Mount,
}

/// Persistent volume attached to a disk resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persistence {
    pub volume_id: LocalVolumeId,
    pub container_path: String,
}

/// Disk-specific attributes of a disk resource.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiskInfo {
    pub source: DiskSource,
    pub persistence: Option<Persistence>,
}

/// One typed resource fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub name: ResourceName,
    pub value: ResourceValue,
    pub role: String,
    pub reservation: Option<ReservationInfo>,
    pub disk: Option<DiskInfo>,
}

impl Resource {
    /// Unreserved scalar resource in the default role.
    pub fn scalar(name: ResourceName, value: f64) -> Self {
        Self {
            name,
            value: ResourceValue::Scalar(value),
            role: UNRESERVED_ROLE.to_string(),
            reservation: None,
            disk: None,
        }
    }

    /// Unreserved port ranges in the default role.
    pub fn ports(ranges: Vec<PortRange>) -> Self {
        Self {
            name: ResourceName::Ports,
            value: ResourceValue::Ranges(ranges),
            role: UNRESERVED_ROLE.to_string(),
            reservation: None,
            disk: None,
        }
    }

    /// Unreserved disk with an explicit source.
    pub fn disk(size_mb: f64, source: DiskSource) -> Self {
        Self {
            disk: Some(DiskInfo {
                source,
                persistence: None,
            }),
            ..Self::scalar(ResourceName::Disk, size_mb)
        }
    }

    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    #[must_use]
    pub fn with_reservation(mut self, reservation: ReservationInfo) -> Self {
        self.reservation = Some(reservation);
        self
    }

    /// Copy of this resource's metadata carrying a different value.
    pub fn with_value(&self, value: ResourceValue) -> Self {
        Self {
            value,
            ..self.clone()
        }
    }

    pub fn is_reserved(&self) -> bool {
        self.reservation.is_some()
    }

    pub fn disk_source(&self) -> DiskSource {
        self.disk
            .as_ref()
            .map(|d| d.source.clone())
            .unwrap_or_default()
    }

    /// Volume already created on this disk resource, if any.
    pub fn persistence(&self) -> Option<&Persistence> {
        self.disk.as_ref().and_then(|d| d.persistence.as_ref())
    }

    pub fn reservation_labels(&self) -> Option<&BTreeMap<String, String>> {
        self.reservation.as_ref().map(|r| &r.labels)
    }
}
