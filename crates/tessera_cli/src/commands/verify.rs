//! Verify command implementation.

use super::{open_repository, select_partitions, CliError};
use std::path::Path;
use tessera_core::{Region, RegionReport, RegionStatus};

/// Verification totals for one partition.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of regions checked.
    pub regions_checked: usize,
    /// Number of regions that passed.
    pub valid_regions: usize,
    /// Damaged regions.
    pub damaged: Vec<RegionReport>,
}

impl VerifyResult {
    fn from_reports(reports: Vec<RegionReport>) -> Self {
        let regions_checked = reports.len();
        let damaged: Vec<_> = reports.into_iter().filter(|r| !r.is_ok()).collect();
        Self {
            regions_checked,
            valid_regions: regions_checked - damaged.len(),
            damaged,
        }
    }

    fn is_ok(&self) -> bool {
        self.damaged.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path, partition: Option<&str>, show_all: bool) -> Result<(), CliError> {
    println!("Verifying repository at {}", path.display());
    println!();

    let repo = open_repository(path)?;
    let mut damaged = 0;
    for id in select_partitions(&repo, partition)? {
        let reports = repo.verify(&id)?;
        if show_all {
            for report in reports.iter().filter(|r| r.is_ok()) {
                println!("  ok      {id} {}", describe_region(&report.region));
            }
        }
        let result = VerifyResult::from_reports(reports);
        print_result(id.as_str(), &result);
        damaged += result.damaged.len();
    }

    println!();
    if damaged == 0 {
        println!("✓ Repository verification passed");
        Ok(())
    } else {
        println!("✗ Repository verification failed");
        Err(CliError::VerificationFailed { damaged })
    }
}

fn print_result(name: &str, result: &VerifyResult) {
    println!(
        "{name}: {} regions checked, {} valid, {} damaged",
        result.regions_checked,
        result.valid_regions,
        result.damaged.len()
    );
    for report in &result.damaged {
        println!(
            "  DAMAGED {} {}",
            describe_region(&report.region),
            describe_status(&report.status)
        );
    }
    if result.is_ok() {
        println!("  ✓ OK");
    }
}

/// Formats a region for one-line output.
pub fn describe_region(region: &Region) -> String {
    match region {
        Region::Header { generation } => format!("g{generation:06} header"),
        Region::Snapshot { generation } => format!("g{generation:06} snapshot"),
        Region::Commit {
            generation,
            offset,
            id,
        } => format!("g{generation:06} commit {} @{offset}", id.short()),
        Region::Block { generation, offset } => format!("g{generation:06} block @{offset}"),
        Region::Tail { generation, offset } => format!("g{generation:06} tail @{offset}"),
    }
}

fn describe_status(status: &RegionStatus) -> String {
    match status {
        RegionStatus::Ok => "ok".to_string(),
        RegionStatus::CorruptCommit { message } => format!("corrupt commit: {message}"),
        RegionStatus::CorruptSnapshot { message } => format!("corrupt snapshot: {message}"),
        RegionStatus::BadFraming { message } => format!("bad framing: {message}"),
        RegionStatus::Unpublished { bytes } => format!("{bytes} unpublished bytes"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::Digest;

    #[test]
    fn result_counts_damaged_regions() {
        let reports = vec![
            RegionReport {
                region: Region::Header { generation: 0 },
                status: RegionStatus::Ok,
            },
            RegionReport {
                region: Region::Tail {
                    generation: 0,
                    offset: 100,
                },
                status: RegionStatus::Unpublished { bytes: 7 },
            },
        ];
        let result = VerifyResult::from_reports(reports);
        assert_eq!(result.regions_checked, 2);
        assert_eq!(result.valid_regions, 1);
        assert!(!result.is_ok());
    }

    #[test]
    fn regions_are_described_by_generation() {
        let region = Region::Commit {
            generation: 3,
            offset: 42,
            id: Digest::ZERO,
        };
        assert!(describe_region(&region).starts_with("g000003 commit"));
        assert_eq!(describe_region(&Region::Snapshot { generation: 1 }), "g000001 snapshot");
    }
}
