// src/cluster/cluster_stats.rs

use std::fmt::Write as FmtWrite;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, Write};
use std::path::Path;

use crate::config::AssemblyConfig;
use crate::error::{ClusterError, IoContext, Result};
use crate::fastq::open_reader;
use crate::sample::{Sample, SampleState};
use crate::types::ClusterRecord;

/// Depth of every cluster in an aligned cluster file, in file order.
///
/// A cluster's depth is the sum of the `size=` annotations of its records.
pub fn cluster_depths<P: AsRef<Path>>(path: P) -> Result<Vec<u64>> {
    let path = path.as_ref();
    let reader = open_reader(path)?;
    let mut depths = Vec::new();
    let mut current = 0u64;
    let mut in_block = false;

    for (idx, line) in reader.lines().enumerate() {
        let line = line.with_path(path)?;
        if line.starts_with("//") {
            if in_block {
                depths.push(current);
            }
            current = 0;
            in_block = false;
        } else if line.starts_with('>') {
            let (_, size, _) = ClusterRecord::parse_header(line.trim_end())
                .ok_or_else(|| ClusterError::parse(path, idx + 1, format!("bad header '{line}'")))?;
            current += u64::from(size);
            in_block = true;
        }
    }
    if in_block {
        depths.push(current);
    }
    Ok(depths)
}

/// Per-sample summary of the cluster depth distribution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthSummary {
    pub clusters_total: u64,
    pub clusters_majrule: u64,
    pub clusters_statistical: u64,
    /// Larger of the two thresholded counts.
    pub clusters_hidepth: u64,
    pub avg_depth_total: f64,
    pub avg_depth_majrule: f64,
    pub avg_depth_statistical: f64,
}

fn mean_over(depths: &[u64], min: u32) -> (u64, f64) {
    let (n, sum) = depths
        .iter()
        .filter(|&&d| d >= u64::from(min))
        .fold((0u64, 0u128), |(n, s), &d| (n + 1, s + u128::from(d)));
    let mean = if n == 0 { 0.0 } else { sum as f64 / n as f64 };
    (n, mean)
}

impl DepthSummary {
    pub fn from_depths(depths: &[u64], mindepth_majrule: u32, mindepth_statistical: u32) -> Self {
        let (total, avg_total) = mean_over(depths, 0);
        let (mj, avg_mj) = mean_over(depths, mindepth_majrule);
        let (stat, avg_stat) = mean_over(depths, mindepth_statistical);
        Self {
            clusters_total: total,
            clusters_majrule: mj,
            clusters_statistical: stat,
            clusters_hidepth: mj.max(stat),
            avg_depth_total: avg_total,
            avg_depth_majrule: avg_mj,
            avg_depth_statistical: avg_stat,
        }
    }
}

/// Classify the aligned clusters of `sample` by depth.
///
/// Returns `None`, leaving the sample's state untouched, when the cluster
/// file holds no clusters.
pub fn classify_depths(config: &AssemblyConfig, sample: &mut Sample) -> Result<Option<DepthSummary>> {
    let path = sample
        .files
        .clusters
        .clone()
        .unwrap_or_else(|| sample.clusters_path(config));
    let depths = cluster_depths(&path)?;
    if depths.is_empty() {
        log::warn!("no clusters found for {}", sample.name);
        return Ok(None);
    }

    let summary = DepthSummary::from_depths(
        &depths,
        config.mindepth_majrule,
        config.mindepth_statistical,
    );
    sample.stats.depths = depths;
    sample.stats.clusters_total = summary.clusters_total;
    sample.stats.clusters_hidepth = summary.clusters_hidepth;
    sample.advance_to(SampleState::DepthClassified)?;
    log::info!(
        "{}: {} clusters, {} at high depth",
        sample.name,
        summary.clusters_total,
        summary.clusters_hidepth
    );
    Ok(Some(summary))
}

pub const STATS_COLUMNS: [&str; 7] = [
    "sample",
    "N_reads",
    "clusters_tot",
    "clusters_hidepth",
    "avg.depth.tot",
    "avg.depth>mj",
    "avg.depth>stat",
];

fn stats_header() -> String {
    let c = STATS_COLUMNS;
    format!(
        "{:<20}   {:>9}   {:>9}   {:>9}   {:>9}   {:>9}   {:>9}\n",
        c[0], c[1], c[2], c[3], c[4], c[5], c[6]
    )
}

/// One fixed-width summary row.
pub fn stats_row(sample: &Sample, config: &AssemblyConfig) -> String {
    let s = DepthSummary::from_depths(
        &sample.stats.depths,
        config.mindepth_majrule,
        config.mindepth_statistical,
    );
    let mut row = String::new();
    let _ = writeln!(
        row,
        "{:<20}   {:>9}   {:>10}   {:>11}   {:>13.2}   {:>11.2}   {:>13.2}",
        sample.name,
        sample.stats.reads_filtered,
        sample.stats.clusters_total,
        sample.stats.clusters_hidepth,
        s.avg_depth_total,
        s.avg_depth_majrule,
        s.avg_depth_statistical
    );
    row
}

/// Append one row per sample, sorted by name, to the run summary file.
/// The header is written only when the file is created.
pub fn write_stats_file<P: AsRef<Path>>(
    path: P,
    samples: &[&Sample],
    config: &AssemblyConfig,
) -> Result<()> {
    let path = path.as_ref();
    let fresh = !path.exists();
    let mut out = if fresh {
        File::create(path)
    } else {
        OpenOptions::new().append(true).open(path)
    }
    .with_path(path)?;

    let mut text = String::new();
    if fresh {
        text.push_str(&stats_header());
    }
    let mut sorted: Vec<&&Sample> = samples.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    for sample in sorted {
        text.push_str(&stats_row(sample, config));
    }
    out.write_all(text.as_bytes()).with_path(path)
}
