//! Result of scanning the block store at open time

use std::fmt;
use std::path::PathBuf;
use tabletfs_common::BlockId;

/// Something unexpected found while opening the block store
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Anomaly {
    /// Leftover of a block write that never finished
    OrphanedTempFile { path: PathBuf, repaired: bool },
    /// Torn record at the end of a container's metadata file
    PartialRecord {
        container: PathBuf,
        offset: u64,
        repaired: bool,
    },
    /// Container with one of its two files missing, or with no records
    IncompleteContainer { path: PathBuf, repaired: bool },
    /// Metadata record pointing beyond the end of the data file; repairing
    /// it records the block as deleted
    MissingBlockData {
        container: PathBuf,
        block_id: BlockId,
        repaired: bool,
    },
}

impl Anomaly {
    /// Whether the anomaly was fixed on disk
    #[must_use]
    pub const fn repaired(&self) -> bool {
        match self {
            Self::OrphanedTempFile { repaired, .. }
            | Self::PartialRecord { repaired, .. }
            | Self::IncompleteContainer { repaired, .. }
            | Self::MissingBlockData { repaired, .. } => *repaired,
        }
    }
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = |repaired: bool| if repaired { " (repaired)" } else { "" };
        match self {
            Self::OrphanedTempFile { path, repaired } => {
                write!(f, "orphaned temp file {}{}", path.display(), suffix(*repaired))
            }
            Self::PartialRecord {
                container,
                offset,
                repaired,
            } => write!(
                f,
                "partial record at offset {offset} in {}{}",
                container.display(),
                suffix(*repaired)
            ),
            Self::IncompleteContainer { path, repaired } => {
                write!(f, "incomplete container {}{}", path.display(), suffix(*repaired))
            }
            Self::MissingBlockData {
                container,
                block_id,
                repaired,
            } => write!(
                f,
                "block {block_id} in {} extends past the end of the data file{}",
                container.display(),
                suffix(*repaired)
            ),
        }
    }
}

/// Block store statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReportStats {
    pub live_block_count: u64,
    pub live_block_bytes: u64,
    pub container_count: u64,
    pub full_container_count: u64,
}

/// Summary of an open
#[derive(Clone, Debug, Default)]
pub struct FsReport {
    pub data_dirs: Vec<PathBuf>,
    pub stats: ReportStats,
    pub anomalies: Vec<Anomaly>,
}

impl FsReport {
    /// No anomalies were found
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.anomalies.is_empty()
    }

    /// Merge another report into this one
    pub fn merge(&mut self, other: Self) {
        self.data_dirs.extend(other.data_dirs);
        self.stats.live_block_count += other.stats.live_block_count;
        self.stats.live_block_bytes += other.stats.live_block_bytes;
        self.stats.container_count += other.stats.container_count;
        self.stats.full_container_count += other.stats.full_container_count;
        self.anomalies.extend(other.anomalies);
    }
}

impl fmt::Display for FsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Block manager report")?;
        writeln!(f, "--------------------")?;
        for dir in &self.data_dirs {
            writeln!(f, "Data dir: {}", dir.display())?;
        }
        writeln!(
            f,
            "Total live blocks: {} ({} bytes)",
            self.stats.live_block_count, self.stats.live_block_bytes
        )?;
        if self.stats.container_count > 0 {
            writeln!(
                f,
                "Total containers: {} ({} full)",
                self.stats.container_count, self.stats.full_container_count
            )?;
        }
        if self.is_clean() {
            writeln!(f, "No anomalies found")?;
        } else {
            writeln!(f, "Anomalies: {}", self.anomalies.len())?;
            for anomaly in &self.anomalies {
                writeln!(f, "  {anomaly}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_display() {
        let mut report = FsReport {
            data_dirs: vec![PathBuf::from("/d0/data")],
            ..Default::default()
        };
        report.stats.live_block_count = 2;
        report.stats.live_block_bytes = 10;
        assert!(report.is_clean());
        assert!(report.to_string().contains("No anomalies found"));

        report.merge(FsReport {
            data_dirs: vec![PathBuf::from("/d1/data")],
            stats: ReportStats {
                live_block_count: 1,
                live_block_bytes: 5,
                ..Default::default()
            },
            anomalies: vec![Anomaly::OrphanedTempFile {
                path: PathBuf::from("/d1/data/ab/cd/x.tmp"),
                repaired: true,
            }],
        });
        assert_eq!(report.stats.live_block_count, 3);
        assert!(!report.is_clean());
        let text = report.to_string();
        assert!(text.contains("Total live blocks: 3 (15 bytes)"));
        assert!(text.contains("orphaned temp file /d1/data/ab/cd/x.tmp (repaired)"));
    }
}
