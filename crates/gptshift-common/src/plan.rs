//! Free-space planning for partition resizes.
//!
//! Partitions are never grown in place. A grow is planned as the creation
//! of a new partition in free space, a copy, and the removal of the old
//! one; only a designated shrink partition is ever resized where it sits.
//! All intervals are in bytes and inclusive on both ends.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::debug;

use crate::disk::{PartitionRecord, ResizeAction};
use crate::error::ResizeError;

/// Bytes per GiB; shrink amounts are rounded up to this granularity.
const GIB: u64 = 1024 * 1024 * 1024;

/// A block of disk space, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UsableBlock {
    pub start: u64,
    pub end: u64,
}

impl UsableBlock {
    /// The length of the block in bytes.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

/// A resolved resize request: the partition as it currently sits and the
/// requested target size.
#[derive(Debug, Clone)]
pub struct ResizeRequest {
    pub original: PartitionRecord,
    pub target_size: u64,
}

/// Compute the free blocks of a disk of the given size.
///
/// `used` must be sorted by start. The result is the complement of the
/// union of `used` within `[0, size - 1]`: disjoint, sorted, inclusive
/// intervals.
pub fn compute_unused(size: u64, used: &[UsableBlock]) -> Vec<UsableBlock> {
    let mut unused = Vec::new();
    if size == 0 {
        return unused;
    }
    let mut next_free: u64 = 0;
    for block in used {
        if block.start > next_free {
            unused.push(UsableBlock {
                start: next_free,
                end: block.start - 1,
            });
        }
        next_free = next_free.max(block.end + 1);
    }
    if next_free < size {
        unused.push(UsableBlock {
            start: next_free,
            end: size - 1,
        });
    }
    unused
}

/// Sort blocks by start and coalesce overlapping or adjacent ones.
pub fn sort_and_combine_usable_blocks(mut blocks: Vec<UsableBlock>) -> Vec<UsableBlock> {
    if blocks.is_empty() {
        return blocks;
    }
    blocks.sort_by_key(|block| block.start);
    let mut combined = Vec::with_capacity(blocks.len());
    let mut current = blocks[0];
    for block in blocks.into_iter().skip(1) {
        if current.end + 1 >= block.start {
            current.end = current.end.max(block.end);
        } else {
            combined.push(current);
            current = block;
        }
    }
    combined.push(current);
    combined
}

/// Turn resize requests into concrete placements on the disk.
///
/// Shrink requests are satisfied in place. Grow and move requests are
/// placed at the start of the first free gap that fits and receive the
/// smallest GPT slot not in use. `reserved` marks extents that are never
/// available (the GPT metadata areas); requests are processed in order and
/// pure shrinks are expected to come first.
pub fn calculate_resizes(
    disk_size: u64,
    parts: &[PartitionRecord],
    reserved: &[UsableBlock],
    requests: &[ResizeRequest],
) -> Result<Vec<ResizeAction>, ResizeError> {
    let mut used: Vec<UsableBlock> = parts
        .iter()
        .map(|part| UsableBlock {
            start: part.start,
            end: part.end,
        })
        .chain(reserved.iter().copied())
        .collect();
    used.sort_by_key(|block| block.start);
    let mut unused = compute_unused(disk_size, &used);

    let mut used_indices: BTreeSet<u32> = parts.iter().map(|part| part.index).collect();

    let mut actions = Vec::with_capacity(requests.len());
    for request in requests {
        let original = &request.original;
        if request.target_size < original.size {
            // Shrinking, adjust in place.
            let target = PartitionRecord::placed(original.start, request.target_size, original.index);
            unused.push(UsableBlock {
                start: target.end + 1,
                end: original.end,
            });
            unused = sort_and_combine_usable_blocks(unused);
            actions.push(ResizeAction {
                original: original.clone(),
                target,
            });
            continue;
        }
        let mut placed = None;
        for (position, gap) in unused.iter_mut().enumerate() {
            if gap.len() >= request.target_size {
                // Allocate at the start of this gap.
                let index = next_free_index(&mut used_indices);
                placed = Some((
                    position,
                    PartitionRecord::placed(gap.start, request.target_size, index),
                ));
                gap.start += request.target_size;
                break;
            }
        }
        let Some((position, target)) = placed else {
            return Err(ResizeError::InsufficientSpace {
                label: original.label.clone(),
                requested: request.target_size,
            });
        };
        if unused[position].is_empty() {
            unused.remove(position);
        }
        actions.push(ResizeAction {
            original: original.clone(),
            target,
        });
    }
    Ok(actions)
}

/// The smallest positive slot not in use; the slot is recorded as used.
fn next_free_index(used_indices: &mut BTreeSet<u32>) -> u32 {
    let mut index = 1;
    while used_indices.contains(&index) {
        index += 1;
    }
    used_indices.insert(index);
    index
}

/// Compute the resize plan, shrinking the designated partition only when
/// the grow requests do not fit as-is.
///
/// The first attempt runs without the shrink. On `InsufficientSpace` with
/// a shrink partition designated, the shrink amount is the sum of all grow
/// target sizes rounded up to the next GiB, a pure-shrink request is
/// prepended, and the calculation is repeated.
pub fn plan_resizes(
    disk_size: u64,
    parts: &[PartitionRecord],
    reserved: &[UsableBlock],
    grow_requests: &[ResizeRequest],
    shrink: Option<&PartitionRecord>,
) -> Result<Vec<ResizeAction>, ResizeError> {
    match calculate_resizes(disk_size, parts, reserved, grow_requests) {
        Ok(actions) => return Ok(actions),
        Err(error @ ResizeError::InsufficientSpace { .. }) => {
            let Some(shrink) = shrink else {
                return Err(error);
            };
            debug!("insufficient space, retrying with a shrink of {:?}", shrink.label);
            let total_grow = round_up_gib(
                grow_requests
                    .iter()
                    .map(|request| request.target_size)
                    .sum(),
            );
            let Some(new_size) = shrink.size.checked_sub(total_grow).filter(|size| *size > 0)
            else {
                return Err(ResizeError::InsufficientSpace {
                    label: shrink.label.clone(),
                    requested: total_grow,
                });
            };
            let mut requests = Vec::with_capacity(grow_requests.len() + 1);
            requests.push(ResizeRequest {
                original: shrink.clone(),
                target_size: new_size,
            });
            requests.extend(grow_requests.iter().cloned());
            calculate_resizes(disk_size, parts, reserved, &requests)
        }
        Err(error) => Err(error),
    }
}

/// Round a byte count up to the next GiB boundary.
///
/// Shrinking slightly more than strictly required leaves a safety margin
/// for filesystem overhead in the freed space.
fn round_up_gib(bytes: u64) -> u64 {
    if bytes % GIB != 0 {
        (bytes / GIB + 1) * GIB
    } else {
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn part(label: &str, start: u64, size: u64, index: u32) -> PartitionRecord {
        PartitionRecord {
            label: label.to_owned(),
            ..PartitionRecord::placed(start, size, index)
        }
    }

    #[test]
    fn test_compute_unused_gaps() {
        let used = [
            UsableBlock { start: 0, end: 8 },
            UsableBlock { start: 20, end: 29 },
            UsableBlock { start: 50, end: 69 },
        ];
        let unused = compute_unused(100, &used);
        assert_eq!(
            unused,
            vec![
                UsableBlock { start: 9, end: 19 },
                UsableBlock { start: 30, end: 49 },
                UsableBlock { start: 70, end: 99 },
            ]
        );
    }

    #[test]
    fn test_compute_unused_full_disk() {
        let used = [
            UsableBlock { start: 0, end: 49 },
            UsableBlock { start: 50, end: 99 },
        ];
        assert!(compute_unused(100, &used).is_empty());
    }

    #[test]
    fn test_compute_unused_covers_complement() {
        let used = [UsableBlock { start: 10, end: 19 }];
        let unused = compute_unused(100, &used);
        let total: u64 = unused.iter().map(UsableBlock::len).sum();
        assert_eq!(total, 90);
        for gap in &unused {
            assert!(gap.start <= gap.end);
            assert!(gap.end <= 99);
        }
    }

    #[test]
    fn test_sort_and_combine_coalesces_and_is_idempotent() {
        let blocks = vec![
            UsableBlock { start: 30, end: 39 },
            UsableBlock { start: 0, end: 9 },
            UsableBlock { start: 10, end: 19 },
            UsableBlock { start: 35, end: 50 },
        ];
        let combined = sort_and_combine_usable_blocks(blocks);
        assert_eq!(
            combined,
            vec![
                UsableBlock { start: 0, end: 19 },
                UsableBlock { start: 30, end: 50 },
            ]
        );
        // Maximally coalesced: no two blocks are adjacent or overlapping.
        for pair in combined.windows(2) {
            assert!(pair[0].end + 1 < pair[1].start);
        }
        assert_eq!(
            sort_and_combine_usable_blocks(combined.clone()),
            combined
        );
    }

    /// Pure grow into trailing free space.
    #[test]
    fn test_grow_into_trailing_space() {
        let p1 = part("p1", 1, GIB, 1);
        let requests = [ResizeRequest {
            original: p1.clone(),
            target_size: 3 * GIB,
        }];
        let actions = calculate_resizes(10 * GIB, &[p1.clone()], &[], &requests).unwrap();
        assert_eq!(actions.len(), 1);
        let action = &actions[0];
        assert_eq!(action.original, p1);
        assert_eq!(action.target.start, p1.end + 1);
        assert_eq!(action.target.size, 3 * GIB);
        assert_eq!(action.target.end, p1.end + 3 * GIB);
        assert_eq!(action.target.index, 2);
    }

    /// Insufficient space without a shrink partition.
    #[test]
    fn test_insufficient_space() {
        let p1 = part("p1", 0, 5 * GIB, 1);
        let requests = [ResizeRequest {
            original: p1.clone(),
            target_size: 8 * GIB,
        }];
        let error = plan_resizes(5 * GIB, &[p1], &[], &requests, None).unwrap_err();
        match error {
            ResizeError::InsufficientSpace { label, requested } => {
                assert_eq!(label, "p1");
                assert_eq!(requested, 8 * GIB);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    /// Shrink of the designated partition followed by the grow.
    #[test]
    fn test_shrink_then_grow() {
        let p1 = part("p1", 0, GIB, 1);
        let p2 = part("p2", GIB, 20 * GIB, 2);
        let parts = [p1.clone(), p2.clone()];
        let requests = [ResizeRequest {
            original: p1.clone(),
            target_size: 5 * GIB,
        }];
        let actions = plan_resizes(21 * GIB, &parts, &[], &requests, Some(&p2)).unwrap();
        assert_eq!(actions.len(), 2);
        // The shrink comes first and stays in place.
        let shrink = &actions[0];
        assert!(shrink.is_shrink());
        assert_eq!(shrink.original, p2);
        assert_eq!(shrink.target.start, p2.start);
        assert_eq!(shrink.target.size, 15 * GIB);
        assert_eq!(shrink.target.index, 2);
        // The grow lands at the freed tail with the first free slot.
        let grow = &actions[1];
        assert_eq!(grow.original, p1);
        assert_eq!(grow.target.start, shrink.target.end + 1);
        assert_eq!(grow.target.size, 5 * GIB);
        assert_eq!(grow.target.index, 3);
    }

    /// A request at the current size is a move into a fresh slot.
    #[test]
    fn test_same_size_request_is_a_move() {
        let p1 = part("p1", 0, GIB, 1);
        let requests = [ResizeRequest {
            original: p1.clone(),
            target_size: GIB,
        }];
        let actions = calculate_resizes(4 * GIB, &[p1.clone()], &[], &requests).unwrap();
        assert_eq!(actions[0].target.start, p1.end + 1);
        assert_eq!(actions[0].target.index, 2);
        assert!(actions[0].is_move());
    }

    /// Targets stay disjoint from each other and from unchanged partitions,
    /// and all grow slots are distinct and fresh.
    #[test]
    fn test_targets_disjoint_and_slots_fresh() {
        let parts = [
            part("a", 0, GIB, 1),
            part("b", GIB, GIB, 2),
            part("c", 2 * GIB, GIB, 5),
        ];
        let requests = [
            ResizeRequest {
                original: parts[0].clone(),
                target_size: 2 * GIB,
            },
            ResizeRequest {
                original: parts[1].clone(),
                target_size: 2 * GIB,
            },
        ];
        let actions = calculate_resizes(16 * GIB, &parts, &[], &requests).unwrap();
        let mut intervals: Vec<(u64, u64)> = actions
            .iter()
            .map(|action| (action.target.start, action.target.end))
            .collect();
        // Partition c is untouched and must not be overlapped.
        intervals.push((parts[2].start, parts[2].end));
        intervals.sort();
        for pair in intervals.windows(2) {
            assert!(pair[0].1 < pair[1].0);
        }
        let indices: Vec<u32> = actions.iter().map(|action| action.target.index).collect();
        assert_eq!(indices, vec![3, 4]);
        for action in &actions {
            assert!(action.target.end < 16 * GIB);
        }
    }

    /// Reserved extents are never allocated.
    #[test]
    fn test_reserved_extents_are_skipped() {
        let p1 = part("p1", 1024 * 1024, 1024 * 1024, 1);
        let reserved = [UsableBlock {
            start: 0,
            end: 1024 * 1024 - 1,
        }];
        let requests = [ResizeRequest {
            original: p1.clone(),
            target_size: 512 * 1024,
        }];
        let actions = calculate_resizes(16 * 1024 * 1024, &[p1.clone()], &reserved, &requests).unwrap();
        // Even though the request is small, it must not land in the
        // reserved leading extent.
        assert_eq!(actions[0].target.start, p1.end + 1);
    }

    /// A full system layout: three grows carved out of one shrink.
    #[test]
    fn test_multiple_grows_from_one_shrink() {
        const MIB: u64 = 1024 * 1024;
        let esp = part("ESP", MIB, 50 * MIB, 1);
        let parta = part("parta", 51 * MIB, 500 * MIB, 2);
        let partb = part("partb", 551 * MIB, 500 * MIB, 3);
        let disk_size = 10 * GIB;
        let shrinker = part("shrinker", 1051 * MIB, disk_size - 1051 * MIB, 4);
        let parts = [esp.clone(), parta.clone(), partb.clone(), shrinker.clone()];
        let requests = [
            ResizeRequest {
                original: parta.clone(),
                target_size: 2 * GIB,
            },
            ResizeRequest {
                original: partb.clone(),
                target_size: 2 * GIB,
            },
            ResizeRequest {
                original: esp.clone(),
                target_size: GIB,
            },
        ];
        let actions =
            plan_resizes(disk_size, &parts, &[], &requests, Some(&shrinker)).unwrap();
        assert_eq!(actions.len(), 4);
        // The shrink frees exactly the grow total, which is already a
        // whole number of GiB.
        let shrink = &actions[0];
        assert!(shrink.is_shrink());
        assert_eq!(shrink.original.label, "shrinker");
        assert_eq!(shrink.target.size, shrinker.size - 5 * GIB);
        // The grows pack the freed tail in request order with fresh slots.
        let labels: Vec<&str> = actions[1..]
            .iter()
            .map(|action| action.original.label.as_str())
            .collect();
        assert_eq!(labels, vec!["parta", "partb", "ESP"]);
        assert_eq!(actions[1].target.start, shrink.target.end + 1);
        assert_eq!(actions[2].target.start, actions[1].target.end + 1);
        assert_eq!(actions[3].target.start, actions[2].target.end + 1);
        assert_eq!(actions[3].target.end, disk_size - 1);
        let indices: Vec<u32> = actions[1..]
            .iter()
            .map(|action| action.target.index)
            .collect();
        assert_eq!(indices, vec![5, 6, 7]);
    }

    #[test]
    fn test_shrink_larger_than_partition_is_insufficient() {
        let p1 = part("p1", 0, GIB, 1);
        let p2 = part("p2", GIB, 2 * GIB, 2);
        let requests = [ResizeRequest {
            original: p1.clone(),
            target_size: 4 * GIB,
        }];
        let error =
            plan_resizes(3 * GIB, &[p1, p2.clone()], &[], &requests, Some(&p2)).unwrap_err();
        match error {
            ResizeError::InsufficientSpace { label, .. } => assert_eq!(label, "p2"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_round_up_gib() {
        assert_eq!(round_up_gib(GIB), GIB);
        assert_eq!(round_up_gib(GIB + 1), 2 * GIB);
        assert_eq!(round_up_gib(5 * GIB - 1), 5 * GIB);
    }
}
