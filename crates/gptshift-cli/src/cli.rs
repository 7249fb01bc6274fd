//! Definition of the command line interface (CLI).

use std::path::PathBuf;

use anyhow::bail;
use clap::Parser;
use gptshift_common::copy::Ext4Copy;
use gptshift_common::disk::{parse_size, IdentifyBy, PartitionChange, PartitionIdentifier};
use gptshift_common::run::{run, RunOptions};
use gptshift_common::Anyhow;

pub fn main() -> Anyhow<()> {
    init_tracing();
    let args = Args::parse();
    let shrink = args
        .shrink_partition
        .as_deref()
        .map(parse_partition_identifier)
        .transpose()?;
    let grows = args
        .grow_partition
        .iter()
        .map(|value| parse_partition_change(value))
        .collect::<Anyhow<Vec<_>>>()?;
    let options = RunOptions {
        dry_run: args.dry_run,
        fix_errors: args.fix_errors,
        ext4_copy: if args.ext4_tree_copy {
            Ext4Copy::Tree
        } else {
            Ext4Copy::Raw
        },
        sys_path: None,
    };
    let outcome = run(args.disk.as_deref(), shrink.as_ref(), &grows, &options)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome.plan)?);
    }
    Ok(())
}

fn init_tracing() {
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .event_format(format)
        .init();
}

/// Parse an identifier of the form `by:value` with `by` one of `name` and
/// `label`.
fn parse_partition_identifier(value: &str) -> Anyhow<PartitionIdentifier> {
    let Some((by, value)) = value.split_once(':') else {
        bail!("invalid partition identifier format: {value}");
    };
    let by = match by {
        "name" => IdentifyBy::Name,
        "label" => IdentifyBy::Label,
        _ => bail!("unknown identifier type: {by}"),
    };
    Ok(PartitionIdentifier::new(by, value))
}

/// Parse a change of the form `by:value:size`.
fn parse_partition_change(value: &str) -> Anyhow<PartitionChange> {
    let parts: Vec<&str> = value.splitn(3, ':').collect();
    let [by, value, size] = parts.as_slice() else {
        bail!("invalid partition change format: {value}");
    };
    let identifier = parse_partition_identifier(&format!("{by}:{value}"))?;
    let size =
        parse_size(size).map_err(|error| anyhow::anyhow!("invalid size {size:?}: {error}"))?;
    Ok(PartitionChange {
        identifier,
        size,
    })
}

#[derive(Debug, Parser)]
#[clap(author, about, version)]
#[clap(long_about = "Resize partitions on a GPT disk or disk image.

Expects a list of partitions to grow and, when the disk has insufficient
free space, a single partition to shrink to make room. Partitions are
identified by their kernel name (e.g. sda1) or their GPT label; sizes take
an optional binary unit suffix B, K, M, G, or T.

Example usage:
  gptshift --shrink-partition name:sda3 --grow-partition name:sda1:20G /dev/sda
  gptshift --shrink-partition label:data --grow-partition label:ESP:1G disk.img")]
pub struct Args {
    /// The disk to operate on; probed from the requested partitions when
    /// omitted.
    pub disk: Option<PathBuf>,
    /// Partition to shrink to make space, if necessary (`by:value`).
    #[clap(long)]
    pub shrink_partition: Option<String>,
    /// Partition to grow with its desired size (`by:value:size`).
    #[clap(long, required = true)]
    pub grow_partition: Vec<String>,
    /// Only compute and show the plan, do not change anything.
    #[clap(long)]
    pub dry_run: bool,
    /// Let the filesystem check fix ext4 errors before shrinking.
    #[clap(long)]
    pub fix_errors: bool,
    /// Copy ext4 partitions file by file instead of byte for byte.
    #[clap(long)]
    pub ext4_tree_copy: bool,
    /// Print the computed plan as JSON.
    #[clap(long)]
    pub json: bool,
}
