//! Property-based tests for the partition planner.
//!
//! These tests use proptest to generate random inputs and verify
//! that core invariants hold.

use imgforge::disk::{
    Customizations, Filesystem, FilesystemRequest, FsType, Partition, PartitionTable,
    PartitioningMode, Payload, TableType, plan, ptype,
};
use imgforge::imagetype::esp_partition;
use imgforge_common::datasizes::{GIB, MIB};
use imgforge_common::seed::derive_seed;
use proptest::prelude::*;

const MOUNTPOINTS: &[&str] = &["/home", "/var", "/var/log", "/opt", "/srv", "/boot"];

fn template() -> PartitionTable {
    let mut pt = PartitionTable::new(TableType::Gpt);
    pt.partitions.push(esp_partition(200 * MIB));
    pt.partitions.push(Partition::new(
        4 * GIB,
        ptype::FILESYSTEM_DATA_GUID,
        Some(Payload::Filesystem(Filesystem::new(FsType::Xfs, "/"))),
    ));
    pt
}

fn mode_strategy() -> impl Strategy<Value = PartitioningMode> {
    prop_oneof![
        Just(PartitioningMode::Raw),
        Just(PartitioningMode::AutoLvm),
        Just(PartitioningMode::Lvm),
        Just(PartitioningMode::Btrfs),
    ]
}

/// A subset of the known mountpoints with sizes between 1 and 8 GiB.
fn requests_strategy() -> impl Strategy<Value = Vec<FilesystemRequest>> {
    proptest::sample::subsequence(MOUNTPOINTS.to_vec(), 0..=MOUNTPOINTS.len()).prop_flat_map(
        |mountpoints| {
            let n = mountpoints.len();
            proptest::collection::vec(1u64..=8, n).prop_map(move |sizes| {
                mountpoints
                    .iter()
                    .zip(sizes)
                    .map(|(mp, gib)| FilesystemRequest::new(*mp, gib * GIB))
                    .collect()
            })
        },
    )
}

proptest! {
    // ========================================================================
    // Planner
    // ========================================================================

    #[test]
    fn planned_partitions_are_aligned_and_disjoint(
        requests in requests_strategy(),
        mode in mode_strategy(),
        seed in any::<i64>(),
    ) {
        let cust = Customizations { filesystems: requests.clone(), ..Default::default() };
        let pt = plan(&template(), &cust, 0, mode, seed).unwrap();

        prop_assert!(pt.partitions[0].start >= pt.first_usable());
        for p in &pt.partitions {
            prop_assert_eq!(p.start % MIB, 0);
            prop_assert_eq!(p.size % MIB, 0);
        }
        for pair in pt.partitions.windows(2) {
            prop_assert!(pair[0].end() <= pair[1].start);
        }
        let last = pt.partitions.last().unwrap();
        prop_assert!(last.end() + pt.footer_size() <= pt.size);
        for req in &requests {
            prop_assert!(pt.contains_mountpoint(&req.mountpoint), "{} missing", req.mountpoint);
        }
        prop_assert!(pt.contains_mountpoint("/"));
    }

    #[test]
    fn planning_is_deterministic(
        requests in requests_strategy(),
        mode in mode_strategy(),
        seed in any::<i64>(),
    ) {
        let cust = Customizations { filesystems: requests, ..Default::default() };
        let a = plan(&template(), &cust, 0, mode, seed).unwrap();
        let b = plan(&template(), &cust, 0, mode, seed).unwrap();
        prop_assert_eq!(a, b);
    }

    #[test]
    fn derived_seeds_depend_on_every_part(base in any::<i64>(), name in "[a-z]{1,8}") {
        let a = derive_seed(base, &[&name, "fedora-42", "x86_64"]);
        prop_assert_eq!(a, derive_seed(base, &[&name, "fedora-42", "x86_64"]));
        prop_assert_ne!(a, derive_seed(base, &[&name, "fedora-42", "aarch64"]));
    }
}
