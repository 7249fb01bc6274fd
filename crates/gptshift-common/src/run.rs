//! Top-level resize entry point: discover, resolve, plan, execute.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::copy::Ext4Copy;
use crate::disk::gpt::PartitionTable;
use crate::disk::{PartitionChange, PartitionIdentifier, ResizeAction};
use crate::error::ResizeError;
use crate::executor;
use crate::plan::{plan_resizes, ResizeRequest, UsableBlock};
use crate::resolve::{filter_disks, identifiers_to_records};
use crate::shrink::SystemExt4Tools;
use crate::sysblock::find_disks;

/// Options of a resize run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Plan only, do not mutate the disk.
    pub dry_run: bool,
    /// Let the filesystem check fix errors before shrinking.
    pub fix_errors: bool,
    /// How ext4 partitions are copied.
    pub ext4_copy: Ext4Copy,
    /// Override for the system block tree root, mainly for tests.
    pub sys_path: Option<PathBuf>,
}

/// The result of a resize run.
#[derive(Debug)]
pub struct RunOutcome {
    /// The disk the plan applies to.
    pub disk: PathBuf,
    /// The computed plan.
    pub plan: Vec<ResizeAction>,
    /// Whether the plan was executed or only computed.
    pub executed: bool,
}

/// Resize the given partitions on the given disk.
///
/// With an empty `disk`, all disks are probed and the one carrying every
/// referenced partition is selected; the selection must be unambiguous.
/// When the grow requests do not fit into the free space, the designated
/// shrink partition makes room, and without one the run fails before any
/// mutation.
pub fn run(
    disk: Option<&Path>,
    shrink: Option<&PartitionIdentifier>,
    grows: &[PartitionChange],
    options: &RunOptions,
) -> Result<RunOutcome, ResizeError> {
    if let Some(change) = grows.iter().find(|change| change.size == 0) {
        return Err(anyhow::anyhow!(
            "requested size for {} must be positive",
            change.identifier
        )
        .into());
    }
    let mut identifiers: Vec<PartitionIdentifier> = Vec::new();
    identifiers.extend(shrink.cloned());
    identifiers.extend(grows.iter().map(|change| change.identifier.clone()));

    let disks = find_disks(disk, options.sys_path.as_deref())?;
    let matched = filter_disks(&disks, &identifiers);
    let selected = match matched.as_slice() {
        [] => return Err(ResizeError::NoMatchingDisk),
        [single] => *single,
        matched => return Err(ResizeError::AmbiguousDisk(matched.len())),
    };
    let probed = &disks[selected];
    info!("using disk {selected} ({:?})", probed.path);

    let table = PartitionTable::open(&probed.path, false)?;
    let table_records = table.records();

    let grow_identifiers: Vec<PartitionIdentifier> = grows
        .iter()
        .map(|change| change.identifier.clone())
        .collect();
    let grow_records =
        identifiers_to_records(&table_records, &probed.partitions, &grow_identifiers)?;
    // Slots are block-granular; rounding the requests up front keeps every
    // computed placement aligned.
    let requests: Vec<ResizeRequest> = grow_records
        .into_iter()
        .zip(grows.iter())
        .map(|(original, change)| ResizeRequest {
            original,
            target_size: table.block_align(change.size),
        })
        .collect();
    let shrink_record = match shrink {
        Some(identifier) => Some(
            identifiers_to_records(
                &table_records,
                &probed.partitions,
                std::slice::from_ref(identifier),
            )?
            .remove(0),
        ),
        None => None,
    };

    // The planner sees only the window between the GPT's metadata areas.
    let reserved = [UsableBlock {
        start: 0,
        end: table.first_usable_byte() - 1,
    }];
    let plan_size = table.last_usable_byte() + 1;
    let mut plan = plan_resizes(
        plan_size,
        &table_records,
        &reserved,
        &requests,
        shrink_record.as_ref(),
    )?;
    for action in &plan {
        info!(
            "plan: {:?} {}..{} (slot {}) -> {}..{} (slot {})",
            action.original.label,
            action.original.start,
            action.original.end,
            action.original.index,
            action.target.start,
            action.target.end,
            action.target.index,
        );
    }
    let disk_path = probed.path.clone();
    drop(table);

    if options.dry_run {
        info!("dry run, not performing resizes");
        return Ok(RunOutcome {
            disk: disk_path,
            plan,
            executed: false,
        });
    }
    executor::execute(
        &disk_path,
        &mut plan,
        options.fix_errors,
        options.ext4_copy,
        &SystemExt4Tools,
    )?;
    info!("resizing completed successfully");
    Ok(RunOutcome {
        disk: disk_path,
        plan,
        executed: true,
    })
}
