//! Host port assignment.

use std::collections::BTreeSet;

use super::pool::ResourcePool;
use super::ResourceSelector;
use crate::model::{HostPort, ResourceName};

/// Assign host ports for `requests`, in request order.
///
/// Fixed ports must be present and free in an accepted port resource.
/// Dynamic ports take the lowest free port, reserved ranges first. Ports in
/// `excluded` are never handed out. The result holds `Some(port)` per bound
/// request and `None` for container-internal ports; nothing is consumed when
/// any request cannot be satisfied.
pub(crate) fn assign_ports(
    pool: &mut ResourcePool<'_>,
    requests: &[HostPort],
    selector: &ResourceSelector,
    excluded: &BTreeSet<u16>,
) -> Option<Vec<Option<u16>>> {
    let candidates = pool.candidates(ResourceName::Ports, selector);
    let mut picked: Vec<(usize, u16)> = Vec::new();
    let is_picked = |picked: &[(usize, u16)], port: u16| picked.iter().any(|(_, p)| *p == port);

    let mut assignment: Vec<Option<u16>> = vec![None; requests.len()];

    // Fixed ports first so dynamic picks cannot steal them.
    for (slot, request) in requests.iter().enumerate() {
        let HostPort::Fixed(port) = *request else {
            continue;
        };
        if excluded.contains(&port) || is_picked(&picked, port) {
            return None;
        }
        let index = candidates.iter().copied().find(|&i| {
            !pool.is_port_taken(i, port) && pool.port_ranges(i).iter().any(|r| r.contains(port))
        })?;
        picked.push((index, port));
        assignment[slot] = Some(port);
    }

    for (slot, request) in requests.iter().enumerate() {
        if *request != HostPort::Dynamic {
            continue;
        }
        let found = candidates.iter().copied().find_map(|i| {
            pool.port_ranges(i)
                .iter()
                .flat_map(|r| r.ports())
                .find(|&port| {
                    !pool.is_port_taken(i, port)
                        && !excluded.contains(&port)
                        && !is_picked(&picked, port)
                })
                .map(|port| (i, port))
        });
        let (index, port) = found?;
        picked.push((index, port));
        assignment[slot] = Some(port);
    }

    for (index, port) in picked {
        pool.take_port(index, port);
    }
    Some(assignment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{default_roles, Offer, PortRange, Resource};
    use keel_id::AgentId;

    fn offer(ranges: Vec<PortRange>) -> Offer {
        Offer::new(AgentId::new(), "agent-1", vec![Resource::ports(ranges)])
    }

    fn selector() -> ResourceSelector {
        ResourceSelector::unreserved(default_roles())
    }

    #[test]
    fn test_fixed_port_assigned() {
        let offer = offer(vec![PortRange::new(31000, 31005)]);
        let mut pool = ResourcePool::new(&offer);
        let ports = assign_ports(
            &mut pool,
            &[HostPort::Fixed(31000)],
            &selector(),
            &BTreeSet::new(),
        )
        .unwrap();
        assert_eq!(ports, vec![Some(31000)]);
    }

    #[test]
    fn test_dynamic_ports_skip_fixed() {
        let offer = offer(vec![PortRange::new(31000, 31002)]);
        let mut pool = ResourcePool::new(&offer);
        let ports = assign_ports(
            &mut pool,
            &[HostPort::Dynamic, HostPort::Fixed(31000), HostPort::None],
            &selector(),
            &BTreeSet::new(),
        )
        .unwrap();
        assert_eq!(ports, vec![Some(31001), Some(31000), None]);
    }

    #[test]
    fn test_missing_fixed_port_fails_without_consuming() {
        let offer = offer(vec![PortRange::new(31000, 31001)]);
        let mut pool = ResourcePool::new(&offer);
        assert!(assign_ports(
            &mut pool,
            &[HostPort::Dynamic, HostPort::Fixed(8080)],
            &selector(),
            &BTreeSet::new()
        )
        .is_none());
        assert!(pool.consumed_ports().is_empty());
    }

    #[test]
    fn test_not_enough_dynamic_ports() {
        let offer = offer(vec![PortRange::single(31000)]);
        let mut pool = ResourcePool::new(&offer);
        assert!(assign_ports(
            &mut pool,
            &[HostPort::Dynamic, HostPort::Dynamic],
            &selector(),
            &BTreeSet::new()
        )
        .is_none());
    }

    #[test]
    fn test_duplicate_fixed_ports_fail() {
        let offer = offer(vec![PortRange::new(31000, 31010)]);
        let mut pool = ResourcePool::new(&offer);
        assert!(assign_ports(
            &mut pool,
            &[HostPort::Fixed(31000), HostPort::Fixed(31000)],
            &selector(),
            &BTreeSet::new()
        )
        .is_none());
    }

    #[test]
    fn test_excluded_ports_are_skipped() {
        let offer = offer(vec![PortRange::new(31000, 31002)]);
        let mut pool = ResourcePool::new(&offer);
        let excluded = BTreeSet::from([31000, 31001]);
        let ports = assign_ports(&mut pool, &[HostPort::Dynamic], &selector(), &excluded).unwrap();
        assert_eq!(ports, vec![Some(31002)]);
    }
}
