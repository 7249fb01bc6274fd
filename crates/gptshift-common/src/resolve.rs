//! Matching user-supplied partition identifiers against discovered disks.

use std::collections::BTreeMap;
use std::collections::HashMap;

use crate::disk::{IdentifyBy, PartitionIdentifier, PartitionRecord};
use crate::error::ResizeError;
use crate::sysblock::ProbedDisk;

/// Disks whose partitions satisfy every identifier by at least one record.
pub fn filter_disks<'a>(
    disks: &'a BTreeMap<String, ProbedDisk>,
    identifiers: &[PartitionIdentifier],
) -> Vec<&'a str> {
    disks
        .iter()
        .filter(|(_, disk)| {
            identifiers.iter().all(|identifier| {
                disk.partitions
                    .iter()
                    .any(|record| matches(record, identifier))
            })
        })
        .map(|(name, _)| name.as_str())
        .collect()
}

fn matches(record: &PartitionRecord, identifier: &PartitionIdentifier) -> bool {
    match identifier.by {
        IdentifyBy::Name => record.sys_name == identifier.value,
        IdentifyBy::Label => record.label == identifier.value,
        IdentifyBy::Uuid => record.uuid.eq_ignore_ascii_case(&identifier.value),
    }
}

/// Resolve identifiers against the GPT records of a chosen disk.
///
/// The GPT itself carries no kernel device name, so name-based identifiers
/// are cross-referenced through the Sysfs records: a kernel name binds to
/// the GPT row sharing its start offset. Resolved records carry the true
/// GPT slot, placement, and, where known, the kernel name.
pub fn identifiers_to_records(
    table_records: &[PartitionRecord],
    sys_records: &[PartitionRecord],
    identifiers: &[PartitionIdentifier],
) -> Result<Vec<PartitionRecord>, ResizeError> {
    let name_by_start: HashMap<u64, &str> = sys_records
        .iter()
        .filter(|record| !record.sys_name.is_empty())
        .map(|record| (record.start, record.sys_name.as_str()))
        .collect();
    let start_by_name: HashMap<&str, u64> = sys_records
        .iter()
        .filter(|record| !record.sys_name.is_empty())
        .map(|record| (record.sys_name.as_str(), record.start))
        .collect();
    let mut resolved = Vec::with_capacity(identifiers.len());
    for identifier in identifiers {
        let found = table_records.iter().find(|record| match identifier.by {
            IdentifyBy::Name => start_by_name
                .get(identifier.value.as_str())
                .is_some_and(|start| *start == record.start),
            IdentifyBy::Label => record.label == identifier.value,
            IdentifyBy::Uuid => record.uuid.eq_ignore_ascii_case(&identifier.value),
        });
        let Some(found) = found else {
            return Err(ResizeError::PartitionNotFound(identifier.clone()));
        };
        let mut record = found.clone();
        if record.sys_name.is_empty() {
            if let Some(name) = name_by_start.get(&record.start) {
                record.sys_name = (*name).to_owned();
            }
        }
        resolved.push(record);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn sys_record(sys_name: &str, label: &str, start: u64, size: u64, index: u32) -> PartitionRecord {
        PartitionRecord {
            sys_name: sys_name.to_owned(),
            label: label.to_owned(),
            uuid: String::new(),
            start,
            size,
            end: start + size - 1,
            index,
        }
    }

    fn table_record(label: &str, uuid: &str, start: u64, size: u64, index: u32) -> PartitionRecord {
        PartitionRecord {
            sys_name: String::new(),
            label: label.to_owned(),
            uuid: uuid.to_owned(),
            start,
            size,
            end: start + size - 1,
            index,
        }
    }

    #[test]
    fn test_filter_disks_requires_all_identifiers() {
        let mut disks = BTreeMap::new();
        disks.insert(
            "sda".to_owned(),
            ProbedDisk {
                path: PathBuf::from("/dev/sda"),
                partitions: vec![
                    sys_record("sda1", "boot", 1024, 2048, 1),
                    sys_record("sda2", "root", 4096, 8192, 2),
                ],
            },
        );
        disks.insert(
            "sdb".to_owned(),
            ProbedDisk {
                path: PathBuf::from("/dev/sdb"),
                partitions: vec![sys_record("sdb1", "boot", 1024, 2048, 1)],
            },
        );
        let both = [
            PartitionIdentifier::new(IdentifyBy::Label, "boot"),
            PartitionIdentifier::new(IdentifyBy::Name, "sda2"),
        ];
        assert_eq!(filter_disks(&disks, &both), vec!["sda"]);
        let boot_only = [PartitionIdentifier::new(IdentifyBy::Label, "boot")];
        assert_eq!(filter_disks(&disks, &boot_only), vec!["sda", "sdb"]);
        let nothing = [PartitionIdentifier::new(IdentifyBy::Label, "swap")];
        assert!(filter_disks(&disks, &nothing).is_empty());
    }

    #[test]
    fn test_name_identifier_binds_through_start_offset() {
        let table = vec![
            table_record("boot", "AAAA", 1024, 2048, 1),
            table_record("root", "BBBB", 4096, 8192, 2),
        ];
        let sys = vec![
            sys_record("sda1", "boot", 1024, 2048, 1),
            sys_record("sda2", "root", 4096, 8192, 2),
        ];
        let ids = [PartitionIdentifier::new(IdentifyBy::Name, "sda2")];
        let resolved = identifiers_to_records(&table, &sys, &ids).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].label, "root");
        assert_eq!(resolved[0].index, 2);
        assert_eq!(resolved[0].sys_name, "sda2");
    }

    #[test]
    fn test_uuid_matching_is_case_insensitive() {
        let table = vec![table_record(
            "root",
            "0FC63DAF-8483-4772-8E79-3D69D8477DE4",
            4096,
            8192,
            2,
        )];
        let ids = [PartitionIdentifier::new(
            IdentifyBy::Uuid,
            "0fc63daf-8483-4772-8e79-3d69d8477de4",
        )];
        let resolved = identifiers_to_records(&table, &[], &ids).unwrap();
        assert_eq!(resolved[0].label, "root");
    }

    #[test]
    fn test_unresolved_identifier_reports_key_and_value() {
        let table = vec![table_record("root", "AAAA", 4096, 8192, 2)];
        let ids = [PartitionIdentifier::new(IdentifyBy::Label, "data")];
        let error = identifiers_to_records(&table, &[], &ids).unwrap_err();
        assert_eq!(
            error.to_string(),
            "could not find partition for identifier: label=data"
        );
    }
}
