//! # Lattice Audit
//!
//! Checks every stable live group against the layout invariants:
//!
//! - members claim the group, and every voxel claiming it is a member
//! - the map holds each member at its coordinate and nothing else
//! - the box is the minimal box around the members
//! - the surface is exactly the members with an exposed slot
//! - members are exactly the voxels reachable from any member over live links
//! - no voxel is a member of two groups, or claims a group that is not live
//!
//! Dirty groups are counted but not inspected: their layout is stale by
//! definition until the next rebuild. Meant for quiescent phases (between
//! steps, in tests); under load some groups may be skipped as contended.

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;

use super::{GridCoord, GroupId, GroupLayout};
use crate::lattice::{Lattice, VoxelId};

/// One broken invariant.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuditViolation {
    /// A member's back-reference points elsewhere.
    #[error("{voxel} is a member of {group} but claims {claims}")]
    WrongClaim {
        /// Group listing the voxel.
        group: GroupId,
        /// The voxel.
        voxel: VoxelId,
        /// Group the voxel points at.
        claims: GroupId,
    },

    /// A voxel claims a stable group that does not list it.
    #[error("{voxel} claims {group} but is not a member")]
    NotAMember {
        /// Claimed group.
        group: GroupId,
        /// The voxel.
        voxel: VoxelId,
    },

    /// A voxel claims a merged or free group.
    #[error("{voxel} claims {group}, which is not live")]
    DeadGroup {
        /// Claimed group.
        group: GroupId,
        /// The voxel.
        voxel: VoxelId,
    },

    /// A voxel is listed by two groups.
    #[error("{voxel} is a member of both {first} and {second}")]
    DuplicateMember {
        /// The voxel.
        voxel: VoxelId,
        /// First group listing it.
        first: GroupId,
        /// Second group listing it.
        second: GroupId,
    },

    /// The map does not hold a member at the member's coordinate.
    #[error("map of {group} does not hold {voxel} at {at}")]
    MapMismatch {
        /// The group.
        group: GroupId,
        /// The member.
        voxel: VoxelId,
        /// The member's coordinate.
        at: GridCoord,
    },

    /// The map holds more voxels than the member list.
    #[error("map of {group} holds {occupied} voxels for {members} members")]
    StrayMapEntries {
        /// The group.
        group: GroupId,
        /// Occupied map cells.
        occupied: usize,
        /// Listed members.
        members: usize,
    },

    /// The box is larger than the members need.
    #[error("box {dims:?} of {group} is not minimal")]
    LooseBox {
        /// The group.
        group: GroupId,
        /// Box dimensions.
        dims: [u32; 3],
    },

    /// Surface membership disagrees with the exposed-slot predicate.
    #[error("surface of {group} is wrong for {voxel}")]
    SurfaceMismatch {
        /// The group.
        group: GroupId,
        /// The voxel.
        voxel: VoxelId,
    },

    /// Two live-linked members are not adjacent in the group frame.
    #[error("{from} and {to} in {group} are linked but not adjacent")]
    LinkFrameMismatch {
        /// The group.
        group: GroupId,
        /// Link origin.
        from: VoxelId,
        /// Link end.
        to: VoxelId,
    },

    /// A member is live-linked to a voxel outside the group.
    #[error("{from} in {group} is linked to {to} outside the group")]
    CrossGroupLink {
        /// The group.
        group: GroupId,
        /// The member.
        from: VoxelId,
        /// The outside voxel.
        to: VoxelId,
    },

    /// A member cannot be reached from the other members.
    #[error("{voxel} in {group} is not connected to the rest of the group")]
    Disconnected {
        /// The group.
        group: GroupId,
        /// The member.
        voxel: VoxelId,
    },

    /// A stable group still has voxels waiting to be placed.
    #[error("{group} is stable with {count} pending voxels")]
    PendingLeft {
        /// The group.
        group: GroupId,
        /// Pending count.
        count: usize,
    },
}

/// Audit result.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuditReport {
    /// Stable live groups inspected.
    pub groups_checked: usize,
    /// Live groups skipped because they await a rebuild.
    pub dirty_groups: usize,
    /// Live groups skipped because their check lock was busy.
    pub contended_groups: usize,
    /// Everything found wrong.
    pub violations: Vec<AuditViolation>,
}

impl AuditReport {
    /// Returns whether no violation was found.
    #[inline]
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.violations.is_empty()
    }
}

impl Lattice {
    /// Checks the lattice against the group invariants.
    #[must_use]
    pub fn audit(&self) -> AuditReport {
        let mut report = AuditReport::default();
        let mut listed: HashMap<VoxelId, GroupId> = HashMap::new();
        let mut stable: HashSet<GroupId> = HashSet::new();

        for group in self.live_groups() {
            if group.needs_rebuild() || group.is_rebuilding() {
                report.dirty_groups += 1;
                continue;
            }
            let Some(layout) = self.snapshot(group.id()) else {
                report.contended_groups += 1;
                continue;
            };
            report.groups_checked += 1;
            stable.insert(group.id());

            for &voxel in layout.members() {
                if let Some(first) = listed.insert(voxel, group.id()) {
                    report.violations.push(AuditViolation::DuplicateMember {
                        voxel,
                        first,
                        second: group.id(),
                    });
                }
            }
            self.audit_layout(group.id(), &layout, &mut report.violations);
        }

        for voxel in self.voxel_ids() {
            let Ok(record) = self.voxel(voxel) else {
                continue;
            };
            let group = record.group();
            if !self.group(group).map_or(false, |g| g.is_live()) {
                report.violations.push(AuditViolation::DeadGroup { group, voxel });
            } else if stable.contains(&group) && listed.get(&voxel) != Some(&group) {
                report.violations.push(AuditViolation::NotAMember { group, voxel });
            }
        }

        if !report.is_consistent() {
            tracing::warn!(violations = report.violations.len(), "audit found violations");
        }
        report
    }

    fn audit_layout(&self, id: GroupId, layout: &GroupLayout, out: &mut Vec<AuditViolation>) {
        if !layout.pending().is_empty() {
            out.push(AuditViolation::PendingLeft {
                group: id,
                count: layout.pending().len(),
            });
        }

        let members: HashSet<VoxelId> = layout.members().iter().copied().collect();
        let surface: HashSet<VoxelId> = layout.surface().iter().copied().collect();
        let mut min = None::<GridCoord>;
        let mut max = None::<GridCoord>;

        for &voxel in layout.members() {
            let Ok(record) = self.voxel(voxel) else {
                continue;
            };
            if record.group() != id {
                out.push(AuditViolation::WrongClaim {
                    group: id,
                    voxel,
                    claims: record.group(),
                });
            }

            let at = record.coord();
            if layout.voxel_at(at) != Some(voxel) {
                out.push(AuditViolation::MapMismatch { group: id, voxel, at });
            }
            min = Some(min.map_or(at, |m| m.min(at)));
            max = Some(max.map_or(at, |m| m.max(at)));

            let exposed = self
                .is_exposed(voxel, |n| members.contains(&n))
                .unwrap_or(true);
            if exposed != surface.contains(&voxel) {
                out.push(AuditViolation::SurfaceMismatch { group: id, voxel });
            }

            for (dir, neighbor) in record.links() {
                if !self.is_live_link(voxel, dir, neighbor).unwrap_or(false) {
                    continue;
                }
                if !members.contains(&neighbor) {
                    out.push(AuditViolation::CrossGroupLink {
                        group: id,
                        from: voxel,
                        to: neighbor,
                    });
                    continue;
                }
                let linked_at = self.voxel(neighbor).map(|n| n.coord()).ok();
                if linked_at != Some(at.step(dir, 1)) {
                    out.push(AuditViolation::LinkFrameMismatch {
                        group: id,
                        from: voxel,
                        to: neighbor,
                    });
                }
            }
        }

        let occupied = layout.map().iter().filter(|cell| cell.is_some()).count();
        if occupied != layout.members().len() {
            out.push(AuditViolation::StrayMapEntries {
                group: id,
                occupied,
                members: layout.members().len(),
            });
        }

        if let (Some(min), Some(max)) = (min, max) {
            let extent = max - min;
            let tight = [extent.x + 1, extent.y + 1, extent.z + 1]
                .map(|d| u32::try_from(d).unwrap_or(0));
            if min != GridCoord::ORIGIN || tight != layout.dims() {
                out.push(AuditViolation::LooseBox {
                    group: id,
                    dims: layout.dims(),
                });
            }
        }

        for voxel in self.unreachable(layout.members(), &members) {
            out.push(AuditViolation::Disconnected { group: id, voxel });
        }
    }

    /// Members not reachable from the first member over live links.
    fn unreachable(&self, order: &[VoxelId], members: &HashSet<VoxelId>) -> Vec<VoxelId> {
        let Some(&start) = order.first() else {
            return Vec::new();
        };
        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            let Ok(record) = self.voxel(current) else {
                continue;
            };
            for (dir, neighbor) in record.links() {
                if members.contains(&neighbor)
                    && self.is_live_link(current, dir, neighbor).unwrap_or(false)
                    && seen.insert(neighbor)
                {
                    queue.push_back(neighbor);
                }
            }
        }
        order.iter().copied().filter(|v| !seen.contains(v)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GroupConfig;
    use crate::lattice::{LatticeBuilder, LinkDirection};

    #[test]
    fn test_built_lattice_is_consistent() {
        let lattice = LatticeBuilder::block([4, 3, 2], GroupConfig::default())
            .build()
            .unwrap();
        let report = lattice.audit();
        assert!(report.is_consistent(), "{:?}", report.violations);
        assert_eq!(report.groups_checked, 1);
        assert_eq!(report.dirty_groups, 0);
    }

    #[test]
    fn test_dirty_groups_are_skipped() {
        let lattice = LatticeBuilder::block([2, 2, 1], GroupConfig::default())
            .build()
            .unwrap();
        lattice.unlink(VoxelId::new(0), LinkDirection::PosX).unwrap();

        let report = lattice.audit();
        assert_eq!(report.dirty_groups, 1);
        assert_eq!(report.groups_checked, 0);
        assert!(report.is_consistent());
    }

    #[test]
    fn test_raw_link_between_groups_is_reported() {
        let lattice = Lattice::new(2, GroupConfig::default());
        let [a, b] = [0, 1].map(VoxelId::new);
        // Wired behind the groups' backs and never signalled
        assert!(lattice.wire(a, b, LinkDirection::PosX).unwrap());

        let report = lattice.audit();
        assert_eq!(report.groups_checked, 2);
        assert!(report.violations.contains(&AuditViolation::CrossGroupLink {
            group: lattice.voxel(a).unwrap().group(),
            from: a,
            to: b,
        }));
        assert!(!report.is_consistent());
    }
}
