//! Staged execution of a resize plan.
//!
//! The stages run in a fixed order, and the GPT is committed after each
//! stage: shrink filesystems, shrink partition entries, create replacement
//! partitions, copy contents, swap identities, remove the old partitions.
//! Every stage checks whether its postcondition already holds on disk and
//! is a no-op if so, which is what makes an interrupted run safe to
//! repeat. Rollback is never attempted; each committed stage is a
//! checkpoint to resume from.

use std::path::Path;

use tracing::{debug, info};
use xscript::{run, Run};

use crate::copy::{copy_action, Ext4Copy};
use crate::disk::gpt::{alternate_label, PartitionTable};
use crate::disk::{is_block_dev, ResizeAction};
use crate::error::ResizeError;
use crate::shrink::{shrink_filesystem, Ext4Tools};

/// The `partprobe` executable.
const PARTPROBE: &str = "partprobe";

/// Apply the plan to the disk.
///
/// Actions may be adjusted in place when a replacement partition from an
/// earlier, interrupted run is adopted.
pub fn execute(
    disk_path: &Path,
    actions: &mut [ResizeAction],
    fix_errors: bool,
    ext4_copy: Ext4Copy,
    tools: &dyn Ext4Tools,
) -> Result<(), ResizeError> {
    shrink_filesystems(disk_path, actions, fix_errors, tools)?;
    shrink_partition_entries(disk_path, actions)?;
    create_partitions(disk_path, actions)?;
    copy_filesystems(disk_path, actions, ext4_copy)?;
    swap_identities(disk_path, actions)?;
    remove_old_partitions(disk_path, actions)?;
    Ok(())
}

/// Stage 1: shrink the filesystems of all pure-shrink actions.
fn shrink_filesystems(
    disk_path: &Path,
    actions: &[ResizeAction],
    fix_errors: bool,
    tools: &dyn Ext4Tools,
) -> Result<(), ResizeError> {
    let table = PartitionTable::open(disk_path, false)?;
    for action in actions.iter().filter(|action| action.is_shrink()) {
        let already_done = table
            .record_at(action.original.index)
            .is_some_and(|record| table.size_matches(record.size, action.target.size));
        if already_done {
            info!(
                "partition {} is already at its target size, skipping filesystem shrink",
                action.original.index
            );
            continue;
        }
        shrink_filesystem(
            disk_path,
            &action.original,
            action.target.size,
            fix_errors,
            tools,
        )?;
    }
    Ok(())
}

/// Stage 2: shrink the GPT entries of all pure-shrink actions.
fn shrink_partition_entries(
    disk_path: &Path,
    actions: &[ResizeAction],
) -> Result<(), ResizeError> {
    let mut table = PartitionTable::open(disk_path, true)?;
    for action in actions.iter().filter(|action| action.is_shrink()) {
        let current = table.record_at(action.original.index);
        if current.is_some_and(|record| table.size_matches(record.size, action.target.size)) {
            debug!(
                "partition entry {} already shrunk, skipping",
                action.original.index
            );
            continue;
        }
        info!(
            "shrinking partition entry {} to {} bytes",
            action.original.index, action.target.size
        );
        table.shrink_entry(action.original.index, action.target.size)?;
    }
    commit_if_dirty(disk_path, table)
}

/// Stage 3: create the replacement partition for every move action.
///
/// The replacement carries a derivable alternate label, so a repeat run
/// recognizes and adopts a replacement created by an interrupted
/// predecessor instead of creating another one.
fn create_partitions(
    disk_path: &Path,
    actions: &mut [ResizeAction],
) -> Result<(), ResizeError> {
    let mut table = PartitionTable::open(disk_path, true)?;
    for action in actions.iter_mut().filter(|action| action.is_move()) {
        if move_completed(&table, action) {
            debug!(
                "slot {} already carries {:?}, nothing to create",
                action.target.index, action.original.label
            );
            continue;
        }
        let label = alternate_label(&action.original.label);
        if let Some(existing) = table.find_by_label(&label) {
            if table.size_matches(existing.size, action.target.size) {
                info!(
                    "adopting existing partition {:?} in slot {}",
                    label, existing.index
                );
                action.target.index = existing.index;
                action.target.start = existing.start;
                action.target.end = existing.start + action.target.size - 1;
                continue;
            }
            // A leftover from a previous run with another size is never
            // authoritative: authority only ever moves at the identity
            // swap, which renames the old row to the alternate label in
            // the same commit.
            info!(
                "discarding stale partition {:?} in slot {}",
                label, existing.index
            );
            table.mark_unused(existing.index);
        }
        info!(
            "resizing partition {:?}: creating replacement in slot {} at {}..{}",
            action.original.label, action.target.index, action.target.start, action.target.end
        );
        table.create_partition(
            action.target.index,
            action.target.start,
            action.target.size,
            &action.original.label,
            action.original.index,
        )?;
    }
    commit_if_dirty(disk_path, table)
}

/// Stage 4: copy the contents of every moved partition.
fn copy_filesystems(
    disk_path: &Path,
    actions: &[ResizeAction],
    ext4_copy: Ext4Copy,
) -> Result<(), ResizeError> {
    let table = PartitionTable::open(disk_path, false)?;
    for action in actions.iter().filter(|action| action.is_move()) {
        if move_completed(&table, action) {
            debug!(
                "identity of slot {} already swapped, copy was verified before",
                action.target.index
            );
            continue;
        }
        info!(
            "copying data from partition {} to partition {}",
            action.original.index, action.target.index
        );
        copy_action(disk_path, action, ext4_copy)?;
    }
    Ok(())
}

/// Whether the move has progressed past the identity swap: the target slot
/// then answers to the original label. Replacements only ever carry the
/// alternate label before that point.
fn move_completed(table: &PartitionTable, action: &ResizeAction) -> bool {
    table
        .record_at(action.target.index)
        .is_some_and(|record| record.label == action.original.label)
}

/// Stage 5: swap label, type, GUID, and attributes so the replacement
/// answers to the original identity.
fn swap_identities(disk_path: &Path, actions: &[ResizeAction]) -> Result<(), ResizeError> {
    let mut table = PartitionTable::open(disk_path, true)?;
    for action in actions.iter() {
        if action.target.index == action.original.index {
            continue;
        }
        let already_swapped = table
            .record_at(action.target.index)
            .is_some_and(|record| record.label == action.original.label);
        if already_swapped {
            debug!(
                "identities of slots {} and {} already swapped, skipping",
                action.original.index, action.target.index
            );
            continue;
        }
        info!(
            "swapping identities of slots {} and {}",
            action.original.index, action.target.index
        );
        table.swap_identity(action.original.index, action.target.index)?;
    }
    commit_if_dirty(disk_path, table)
}

/// Stage 6: mark the superseded rows as unused.
fn remove_old_partitions(disk_path: &Path, actions: &[ResizeAction]) -> Result<(), ResizeError> {
    let mut table = PartitionTable::open(disk_path, true)?;
    for action in actions.iter() {
        if action.target.index == action.original.index {
            continue;
        }
        if table.record_at(action.original.index).is_some() {
            info!("removing old partition {}", action.original.index);
            table.mark_unused(action.original.index);
        }
    }
    commit_if_dirty(disk_path, table)
}

fn commit_if_dirty(disk_path: &Path, table: PartitionTable) -> Result<(), ResizeError> {
    if !table.is_dirty() {
        return Ok(());
    }
    table.commit()?;
    // The kernel re-reads the table only when told to.
    if is_block_dev(disk_path) {
        run!([PARTPROBE, disk_path]).map_err(|error| anyhow::anyhow!(error))?;
    }
    Ok(())
}
