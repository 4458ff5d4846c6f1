//! TSV export for machine-readable benchmark results

use anyhow::{Context, Result};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::summary::SummaryTable;

/// TSV exporter for summary tables
pub struct TsvExporter {
    basename: String,
}

impl TsvExporter {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            basename: path.as_ref().to_string_lossy().to_string(),
        }
    }

    /// Path the summary is written to
    pub fn summary_path(&self) -> PathBuf {
        PathBuf::from(format!("{}-summary.tsv", self.basename))
    }

    /// Export every table, one row per printed slot and metric
    pub fn export_summary(&self, tables: &[SummaryTable]) -> Result<PathBuf> {
        let path = self.summary_path();
        let mut f = File::create(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;

        writeln!(f, "metric\toperation\tmax\tmin\tmean\tstd_dev\titerations")?;

        for table in tables {
            let metric = table.metric.name();
            for row in &table.rows {
                writeln!(
                    f,
                    "{}\t{}\t{:.6}\t{:.6}\t{:.6}\t{:.6}\t{}",
                    metric,
                    row.slot.label().unwrap_or(""),
                    row.stats.max,
                    row.stats.min,
                    row.stats.mean,
                    row.stats.std_dev,
                    table.iterations
                )?;
            }
            // Stonewall lines carry a single aggregate value
            for (label, value) in &table.stonewall {
                writeln!(f, "{}\t{}\tNA\tNA\t{:.6}\tNA\t{}", metric, label, value, table.iterations)?;
            }
        }

        println!("\n✅ TSV results exported to: {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::summary::{Metric, OpSlot, Stats, SummaryRow};
    use tempfile::TempDir;

    #[test]
    fn test_export_summary() {
        let temp_dir = TempDir::new().unwrap();
        let exporter = TsvExporter::new(temp_dir.path().join("run1"));
        let table = SummaryTable {
            metric: Metric::Rate,
            iterations: 3,
            rows: vec![SummaryRow {
                slot: OpSlot::FileStat,
                stats: Stats::from_samples(&[10.0, 20.0, 30.0]).unwrap(),
            }],
            stonewall: vec![("File create (stonewall)", 42.0)],
        };

        let path = exporter.export_summary(&[table]).unwrap();
        assert!(path.ends_with("run1-summary.tsv"));
        let text = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("metric\toperation"));
        assert!(lines[1].starts_with("rate\tFile stat\t30.000000\t10.000000\t20.000000"));
        assert!(lines[2].contains("File create (stonewall)\tNA\tNA\t42.000000"));
    }
}
