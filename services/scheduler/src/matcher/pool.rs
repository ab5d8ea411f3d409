//! Working copy of an offer's resources during a single match.
//!
//! Every `take_*` call is all-or-nothing: on failure nothing is consumed, so
//! a failed requirement never skews the evaluation of the next one.

use std::collections::BTreeSet;

use keel_id::LocalVolumeId;

use super::ResourceSelector;
use crate::model::{
    DiskType, Offer, PersistentVolume, Resource, ResourceName, ResourceValue, SCALAR_EPSILON,
};

pub(crate) struct ResourcePool<'a> {
    offer: &'a Offer,
    remaining: Vec<f64>,
    taken_ports: Vec<BTreeSet<u16>>,
}

impl<'a> ResourcePool<'a> {
    pub(crate) fn new(offer: &'a Offer) -> Self {
        Self {
            offer,
            remaining: offer.resources.iter().map(|r| r.value.scalar()).collect(),
            taken_ports: vec![BTreeSet::new(); offer.resources.len()],
        }
    }

    /// Indices of accepted resources named `name`, reserved ones first.
    pub(crate) fn candidates(&self, name: ResourceName, selector: &ResourceSelector) -> Vec<usize> {
        let mut indices: Vec<usize> = self
            .offer
            .resources
            .iter()
            .enumerate()
            .filter(|(_, r)| r.name == name && selector.accepts(r))
            .map(|(i, _)| i)
            .collect();
        // Stable: offer order is kept within each class.
        indices.sort_by_key(|&i| !self.offer.resources[i].is_reserved());
        indices
    }

    fn resource(&self, index: usize) -> &'a Resource {
        &self.offer.resources[index]
    }

    /// Consume `amount` of a scalar resource, spreading over fragments.
    ///
    /// Disk taken here is plain root disk; persistent volumes and dedicated
    /// disk sources are left for [`Self::take_new_volume`].
    pub(crate) fn take_scalar(
        &mut self,
        name: ResourceName,
        amount: f64,
        selector: &ResourceSelector,
    ) -> Option<Vec<Resource>> {
        let indices: Vec<usize> = self
            .candidates(name, selector)
            .into_iter()
            .filter(|&i| {
                let r = self.resource(i);
                name != ResourceName::Disk
                    || (r.persistence().is_none() && r.disk_source().disk_type() == DiskType::Root)
            })
            .collect();

        let available: f64 = indices.iter().map(|&i| self.remaining[i]).sum();
        if available + SCALAR_EPSILON < amount {
            return None;
        }

        let mut consumed = Vec::new();
        let mut missing = amount;
        for i in indices {
            if missing <= SCALAR_EPSILON {
                break;
            }
            let take = self.remaining[i].min(missing);
            if take <= 0.0 {
                continue;
            }
            self.remaining[i] -= take;
            missing -= take;
            consumed.push(self.resource(i).with_value(ResourceValue::Scalar(take)));
        }
        Some(consumed)
    }

    /// Carve a new persistent volume out of an unreserved disk resource.
    ///
    /// Picks the smallest chunk of the volume's disk type that still fits
    /// (first fit over chunks sorted ascending) to limit fragmentation.
    /// Mount disks are indivisible and are consumed whole.
    pub(crate) fn take_new_volume(
        &mut self,
        volume: &PersistentVolume,
        selector: &ResourceSelector,
    ) -> Option<Resource> {
        let mut fitting: Vec<usize> = self
            .candidates(ResourceName::Disk, selector)
            .into_iter()
            .filter(|&i| {
                let r = self.resource(i);
                let untouched = (self.remaining[i] - r.value.scalar()).abs() <= SCALAR_EPSILON;
                r.persistence().is_none()
                    && !r.is_reserved()
                    && r.disk_source().disk_type() == volume.disk_type
                    && self.remaining[i] + SCALAR_EPSILON >= volume.size_mb
                    && (volume.disk_type != DiskType::Mount || untouched)
            })
            .collect();
        fitting.sort_by(|&a, &b| self.remaining[a].total_cmp(&self.remaining[b]));

        let index = *fitting.first()?;
        let take = match volume.disk_type {
            DiskType::Mount => self.remaining[index],
            DiskType::Root | DiskType::Path => volume.size_mb,
        };
        self.remaining[index] -= take;
        Some(self.resource(index).with_value(ResourceValue::Scalar(take)))
    }

    /// Claim disk resources that already carry the given volumes.
    ///
    /// Returns `None` unless every volume is present on this offer.
    pub(crate) fn take_existing_volumes(
        &mut self,
        volume_ids: &[LocalVolumeId],
    ) -> Option<Vec<Resource>> {
        let mut indices = Vec::with_capacity(volume_ids.len());
        for volume_id in volume_ids {
            let index = self.offer.resources.iter().enumerate().position(|(i, r)| {
                self.remaining[i] > SCALAR_EPSILON
                    && r.persistence().map(|p| &p.volume_id) == Some(volume_id)
            })?;
            indices.push(index);
        }

        Some(
            indices
                .into_iter()
                .map(|i| {
                    self.remaining[i] = 0.0;
                    self.resource(i).clone()
                })
                .collect(),
        )
    }

    pub(crate) fn is_port_taken(&self, index: usize, port: u16) -> bool {
        self.taken_ports[index].contains(&port)
    }

    pub(crate) fn take_port(&mut self, index: usize, port: u16) {
        self.taken_ports[index].insert(port);
    }

    pub(crate) fn port_ranges(&self, index: usize) -> &'a [crate::model::PortRange] {
        self.resource(index).value.ranges()
    }

    /// Port fragments consumed so far, one per offer resource.
    pub(crate) fn consumed_ports(&self) -> Vec<Resource> {
        self.taken_ports
            .iter()
            .enumerate()
            .filter(|(_, taken)| !taken.is_empty())
            .map(|(i, taken)| {
                let ports: Vec<u16> = taken.iter().copied().collect();
                self.resource(i)
                    .with_value(ResourceValue::Ranges(crate::model::ports_to_ranges(&ports)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{default_roles, DiskSource};
    use keel_id::AgentId;

    fn offer(resources: Vec<Resource>) -> Offer {
        Offer::new(AgentId::new(), "agent-1", resources)
    }

    fn unreserved() -> ResourceSelector {
        ResourceSelector::unreserved(default_roles())
    }

    #[test]
    fn test_take_scalar_spreads_across_fragments() {
        let offer = offer(vec![
            Resource::scalar(ResourceName::Cpus, 1.0),
            Resource::scalar(ResourceName::Cpus, 2.0),
        ]);
        let mut pool = ResourcePool::new(&offer);
        let taken = pool.take_scalar(ResourceName::Cpus, 2.5, &unreserved()).unwrap();
        assert_eq!(taken.len(), 2);
        assert!((taken[0].value.scalar() - 1.0).abs() < 1e-9);
        assert!((taken[1].value.scalar() - 1.5).abs() < 1e-9);
        assert!(pool.take_scalar(ResourceName::Cpus, 0.6, &unreserved()).is_none());
        assert!(pool.take_scalar(ResourceName::Cpus, 0.5, &unreserved()).is_some());
    }

    #[test]
    fn test_failed_take_consumes_nothing() {
        let offer = offer(vec![Resource::scalar(ResourceName::Mem, 100.0)]);
        let mut pool = ResourcePool::new(&offer);
        assert!(pool.take_scalar(ResourceName::Mem, 200.0, &unreserved()).is_none());
        assert!(pool.take_scalar(ResourceName::Mem, 100.0, &unreserved()).is_some());
    }

    #[test]
    fn test_new_volume_prefers_smallest_fitting_chunk() {
        let offer = offer(vec![
            Resource::disk(1000.0, DiskSource::Root),
            Resource::disk(200.0, DiskSource::Root),
            Resource::disk(50.0, DiskSource::Root),
        ]);
        let mut pool = ResourcePool::new(&offer);
        let volume = PersistentVolume::new("data", 100.0);
        let taken = pool.take_new_volume(&volume, &unreserved()).unwrap();
        assert!((taken.value.scalar() - 100.0).abs() < 1e-9);
        assert_eq!(pool.remaining[1], 100.0);
        assert_eq!(pool.remaining[0], 1000.0);
    }

    #[test]
    fn test_mount_disk_is_consumed_whole() {
        let mount = DiskSource::Mount {
            root: "/mnt/disk1".to_string(),
        };
        let offer = offer(vec![Resource::disk(500.0, mount)]);
        let mut pool = ResourcePool::new(&offer);
        let mut volume = PersistentVolume::new("data", 100.0);
        volume.disk_type = DiskType::Mount;
        let taken = pool.take_new_volume(&volume, &unreserved()).unwrap();
        assert!((taken.value.scalar() - 500.0).abs() < 1e-9);
        assert!(pool.take_new_volume(&volume, &unreserved()).is_none());
    }

    #[test]
    fn test_volume_disk_type_must_match() {
        let offer = offer(vec![Resource::disk(500.0, DiskSource::Root)]);
        let mut pool = ResourcePool::new(&offer);
        let mut volume = PersistentVolume::new("data", 100.0);
        volume.disk_type = DiskType::Path;
        assert!(pool.take_new_volume(&volume, &unreserved()).is_none());
    }
}
