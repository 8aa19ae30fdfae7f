//! Integration tests for whole-lattice scenarios through the public API.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use voxbond_core::{
    AttachOutcome, CheckOutcome, GridCoord, GroupConfig, GroupError, GroupState, Lattice,
    LatticeBuilder, LinkDirection, VoxelId,
};

#[test]
fn test_three_voxel_line() {
    let mut builder = LatticeBuilder::new(GroupConfig::default());
    let voxels: Vec<VoxelId> = (0..3).map(|x| builder.add_voxel([x, 0, 0]).unwrap()).collect();
    builder.link_adjacent();
    let lattice = builder.build().unwrap();

    for &start in &voxels {
        lattice.mark_dirty(start).unwrap();
        let report = lattice.rebuild(start).unwrap().report().cloned().unwrap();
        assert_eq!(report.dims, [3, 1, 1]);
        assert_eq!(report.members, 3);
        assert_eq!(report.surface, 3);

        let layout = lattice.snapshot(report.group).unwrap();
        for (x, &voxel) in voxels.iter().enumerate() {
            assert_eq!(layout.map()[x], Some(voxel));
            assert_eq!(lattice.voxel(voxel).unwrap().coord(), GridCoord::new(x as i32, 0, 0));
        }
    }
}

#[test]
fn test_two_singletons_join_along_x() {
    let lattice = Lattice::new(2, GroupConfig::default());
    let a = VoxelId::new(0);
    let b = VoxelId::new(1);

    let check = lattice.check(a, b, LinkDirection::PosX).unwrap();
    let pair = check.link_pair().unwrap();
    assert_eq!(pair.host_dir, LinkDirection::PosX);
    assert_eq!(pair.remote_dir, LinkDirection::NegX);

    // Wire and merge by hand, the way a context without try_attach would
    assert!(lattice.link(a, b, pair.host_dir).unwrap());
    let source = lattice.voxel(b).unwrap().group();
    let target = lattice.voxel(a).unwrap().group();
    lattice.merge(source, target).unwrap();

    assert_eq!(lattice.group(source).unwrap().state(), GroupState::Merged);
    assert_eq!(lattice.voxel(b).unwrap().group(), target);

    lattice.rebuild(a).unwrap();
    let layout = lattice.snapshot(target).unwrap();
    assert_eq!(layout.members().len(), 2);
    assert_eq!(layout.voxel_at(GridCoord::new(0, 0, 0)), Some(a));
    assert_eq!(layout.voxel_at(GridCoord::new(1, 0, 0)), Some(b));
    assert!(lattice.audit().is_consistent());
}

#[test]
fn test_split_then_rejoin() {
    let lattice = LatticeBuilder::block([3, 3, 1], GroupConfig::default())
        .build()
        .unwrap();
    let centre = VoxelId::new(4);

    // Cut the centre voxel loose
    for dir in [
        LinkDirection::PosX,
        LinkDirection::NegX,
        LinkDirection::PosY,
        LinkDirection::NegY,
    ] {
        assert!(lattice.unlink(centre, dir).unwrap().is_some());
    }
    lattice.rebuild_dirty().unwrap();
    lattice.rebuild_dirty().unwrap();

    let ring = lattice.group_of(VoxelId::new(0)).unwrap().id();
    let lone = lattice.voxel(centre).unwrap().group();
    assert_ne!(ring, lone);
    let ring_layout = lattice.snapshot(ring).unwrap();
    assert_eq!(ring_layout.members().len(), 8);
    assert_eq!(ring_layout.dims(), [3, 3, 1]);
    assert!(lattice.audit().is_consistent());

    // Back into the hole from below: the ring frame has room
    let below = VoxelId::new(1);
    let outcome = lattice.try_attach(below, centre, LinkDirection::PosY).unwrap();
    assert!(outcome.is_attached());
    lattice.rebuild_dirty().unwrap();
    assert_eq!(lattice.voxel(centre).unwrap().group(), ring);
    assert_eq!(lattice.snapshot(ring).unwrap().members().len(), 9);
    assert!(lattice.audit().is_consistent());
}

#[test]
fn test_check_never_admits_overlap() {
    // Random rods; any accepted attach must rebuild without a collision
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let mut builder = LatticeBuilder::new(GroupConfig::default());
    for rod in 0..8 {
        let len = rng.gen_range(1..5);
        let axis = rng.gen_range(0..3);
        for i in 0..len {
            let mut cell = [rod * 20, 0, 0];
            cell[axis] += i;
            builder.add_voxel(cell);
        }
    }
    builder.link_adjacent();
    let lattice = builder.build().unwrap();
    let count = lattice.voxel_count();

    let mut attached = 0;
    for _ in 0..400 {
        let host = VoxelId::new(rng.gen_range(0..count) as u32);
        let remote = VoxelId::new(rng.gen_range(0..count) as u32);
        let dir = LinkDirection::ALL[rng.gen_range(0..6)];

        match lattice.try_attach(host, remote, dir).unwrap() {
            AttachOutcome::Attached { .. } => {
                attached += 1;
                let rebuilt = lattice.rebuild_dirty();
                assert!(
                    !matches!(rebuilt, Err(GroupError::InconsistentTopology { .. })),
                    "accepted attach produced an overlap: {rebuilt:?}"
                );
                rebuilt.unwrap();
            }
            AttachOutcome::Incompatible(_) => {
                // Still incompatible when asked read-only
                assert!(!matches!(
                    lattice.check(host, remote, dir).unwrap(),
                    CheckOutcome::Compatible(_)
                ));
            }
            AttachOutcome::Deferred(reason) => panic!("single-threaded attach deferred: {reason}"),
        }
    }

    assert!(attached > 0);
    assert!(lattice.audit().is_consistent());
}

#[test]
fn test_unknown_handles_are_errors() {
    let lattice = Lattice::new(1, GroupConfig::default());
    let ghost = VoxelId::new(7);

    assert_eq!(lattice.rebuild(ghost).unwrap_err(), GroupError::UnknownVoxel(ghost));
    assert!(!lattice.rebuild(ghost).unwrap_err().is_fatal());
    assert!(lattice.check(VoxelId::new(0), ghost, LinkDirection::PosX).is_err());
}
