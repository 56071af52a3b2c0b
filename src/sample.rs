// src/sample.rs

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use crate::config::AssemblyConfig;
use crate::error::{ClusterError, IoContext, Result};
use crate::fastq::count_fastq_reads;

/// Where a sample stands in the within-sample clustering step.
///
/// States only move forward; [`Sample::reset_for_rerun`] is the one way back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleState {
    /// Filtered reads exist but have not been clustered.
    Unclustered,
    /// Dereplicated, searched and assembled into clusters.
    Clustered,
    /// Clusters aligned and indel-filtered.
    Aligned,
    /// Depths classified and stats recorded. Terminal for this step.
    DepthClassified,
}

impl SampleState {
    /// Numeric stage marker shown in log output.
    pub fn marker(self) -> f32 {
        match self {
            SampleState::Unclustered => 2.0,
            SampleState::Clustered => 2.5,
            SampleState::Aligned => 2.75,
            SampleState::DepthClassified => 3.0,
        }
    }
}

/// Per-sample file bundle. Paths are exclusively owned by the sample's run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleFiles {
    /// Filtered reads: `(read1, read2)` per input file pair.
    pub edits: Vec<(PathBuf, Option<PathBuf>)>,
    pub derep: Option<PathBuf>,
    /// Similarity-search hits (`.utemp`).
    pub hits: Option<PathBuf>,
    /// Seeds without hits (`.htemp`).
    pub nohits: Option<PathBuf>,
    /// Unaligned clusters (`.clust.gz`).
    pub clusts: Option<PathBuf>,
    /// Aligned clusters (`.clustS.gz`).
    pub clusters: Option<PathBuf>,
    pub merged: Option<PathBuf>,
    /// Reads that mapped to the reference (BAM).
    pub mapped_reads: Option<PathBuf>,
    /// Reads left for de novo clustering after reference mapping.
    pub unmapped_reads: Option<(PathBuf, Option<PathBuf>)>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleStats {
    pub reads_filtered: u64,
    pub reads_merged: u64,
    pub clusters_total: u64,
    pub clusters_hidepth: u64,
    /// Depth of every cluster, in file order.
    pub depths: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub name: String,
    pub state: SampleState,
    pub files: SampleFiles,
    pub stats: SampleStats,
}

impl Sample {
    pub fn new(name: impl Into<String>, edits: Vec<(PathBuf, Option<PathBuf>)>) -> Self {
        Self {
            name: name.into(),
            state: SampleState::Unclustered,
            files: SampleFiles {
                edits,
                ..Default::default()
            },
            stats: SampleStats::default(),
        }
    }

    pub fn is_at_least(&self, state: SampleState) -> bool {
        self.state >= state
    }

    /// Move the sample forward. Re-entering the current state is allowed.
    pub fn advance_to(&mut self, next: SampleState) -> Result<()> {
        if next < self.state {
            return Err(ClusterError::StateRegression {
                sample: self.name.clone(),
                from: self.state,
                to: next,
            });
        }
        log::debug!(
            "{}: {:?} ({}) -> {:?} ({})",
            self.name,
            self.state,
            self.state.marker(),
            next,
            next.marker()
        );
        self.state = next;
        Ok(())
    }

    /// Read files that go into clustering: the unmapped reads once reference
    /// mapping ran, the edits otherwise.
    pub fn clustering_inputs(&self) -> Vec<(PathBuf, Option<PathBuf>)> {
        match &self.files.unmapped_reads {
            Some(unmapped) => vec![unmapped.clone()],
            None => self.files.edits.clone(),
        }
    }

    /// Drop everything this step produced so a forced re-run starts clean.
    /// The edits are left alone.
    pub fn reset_for_rerun(&mut self) {
        self.state = SampleState::Unclustered;
        self.files = SampleFiles {
            edits: std::mem::take(&mut self.files.edits),
            ..Default::default()
        };
        self.stats.reads_merged = 0;
        self.stats.clusters_total = 0;
        self.stats.clusters_hidepth = 0;
        self.stats.depths.clear();
    }

    pub fn derep_path(&self, config: &AssemblyConfig) -> PathBuf {
        config.edits_dir().join(format!("{}_derep.fasta", self.name))
    }

    pub fn hits_path(&self, config: &AssemblyConfig) -> PathBuf {
        config.clusts_dir().join(format!("{}.utemp", self.name))
    }

    pub fn nohits_path(&self, config: &AssemblyConfig) -> PathBuf {
        config.clusts_dir().join(format!("{}.htemp", self.name))
    }

    pub fn clusts_path(&self, config: &AssemblyConfig) -> PathBuf {
        config.clusts_dir().join(format!("{}.clust.gz", self.name))
    }

    pub fn clusters_path(&self, config: &AssemblyConfig) -> PathBuf {
        config.clusts_dir().join(format!("{}.clustS.gz", self.name))
    }

    pub fn merged_path(&self, config: &AssemblyConfig) -> PathBuf {
        config.edits_dir().join(format!("{}_merged_.fastq", self.name))
    }
}

/// Load samples saved by [`save_samples`].
pub fn load_samples<P: AsRef<Path>>(path: P) -> Result<Vec<Sample>> {
    let path = path.as_ref();
    let file = File::open(path).with_path(path)?;
    serde_json::from_reader(BufReader::new(file)).map_err(|source| ClusterError::Json {
        path: path.to_path_buf(),
        source,
    })
}

pub fn save_samples<P: AsRef<Path>>(path: P, samples: &[Sample]) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).with_path(path)?;
    serde_json::to_writer_pretty(BufWriter::new(file), samples).map_err(|source| {
        ClusterError::Json {
            path: path.to_path_buf(),
            source,
        }
    })
}

fn strip_fastq_ext(name: &str) -> Option<&str> {
    name.strip_suffix(".fastq.gz")
        .or_else(|| name.strip_suffix(".fq.gz"))
        .or_else(|| name.strip_suffix(".fastq"))
        .or_else(|| name.strip_suffix(".fq"))
}

/// Find the filtered reads of every sample in the edits directory.
///
/// Single-end samples are `<name>.fastq[.gz]`; paired samples are
/// `<name>_R1_*` files with a matching `<name>_R2_*`. Intermediate files
/// written by this step are ignored. Samples come back sorted by name with
/// `reads_filtered` counted.
pub fn discover_samples(config: &AssemblyConfig) -> Result<Vec<Sample>> {
    let dir = config.edits_dir();
    let mut found: BTreeMap<String, (PathBuf, Option<PathBuf>)> = BTreeMap::new();

    for entry in fs::read_dir(&dir).with_path(&dir)? {
        let path = entry.with_path(&dir)?.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(stem) = strip_fastq_ext(file_name) else {
            continue;
        };
        if stem.ends_with("_merged_") || stem.contains("_R2_") {
            continue;
        }

        if config.datatype.is_paired() {
            let Some((name, _)) = stem.split_once("_R1_") else {
                log::warn!("{} has no _R1_ tag; ignored", path.display());
                continue;
            };
            let mate = dir.join(file_name.replacen("_R1_", "_R2_", 1));
            if !mate.exists() {
                log::warn!("no second read file for {}; ignored", path.display());
                continue;
            }
            found.insert(name.to_string(), (path.clone(), Some(mate)));
        } else {
            found.insert(stem.to_string(), (path.clone(), None));
        }
    }

    let mut samples = Vec::with_capacity(found.len());
    for (name, (r1, r2)) in found {
        let mut sample = Sample::new(name, vec![(r1.clone(), r2)]);
        sample.stats.reads_filtered = count_fastq_reads(&r1)?;
        samples.push(sample);
    }
    log::info!("found {} samples in {}", samples.len(), dir.display());
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_moves_forward_only() {
        let mut sample = Sample::new("s1", vec![]);
        assert!(sample.advance_to(SampleState::Clustered).is_ok());
        assert!(sample.advance_to(SampleState::Clustered).is_ok());
        assert!(sample.advance_to(SampleState::DepthClassified).is_ok());

        let err = sample.advance_to(SampleState::Aligned).unwrap_err();
        assert!(matches!(err, ClusterError::StateRegression { .. }));
        assert_eq!(sample.state, SampleState::DepthClassified);

        sample.reset_for_rerun();
        assert_eq!(sample.state, SampleState::Unclustered);
        assert!(sample.advance_to(SampleState::Clustered).is_ok());
    }

    #[test]
    fn test_rerun_reset_keeps_edits() {
        let edits = vec![(PathBuf::from("s1_R1_.fastq"), Some(PathBuf::from("s1_R2_.fastq")))];
        let mut sample = Sample::new("s1", edits.clone());
        sample.files.mapped_reads = Some(PathBuf::from("s1.mapped.bam"));
        sample.files.unmapped_reads = Some((PathBuf::from("s1.unmapped_R1.fastq"), None));
        sample.files.clusts = Some(PathBuf::from("s1.clust.gz"));
        sample.stats.reads_filtered = 8;
        sample.stats.depths = vec![5, 3];
        sample.advance_to(SampleState::DepthClassified).unwrap();
        assert_eq!(sample.clustering_inputs()[0].0, PathBuf::from("s1.unmapped_R1.fastq"));

        sample.reset_for_rerun();
        assert_eq!(sample.files.edits, edits);
        assert!(sample.files.mapped_reads.is_none());
        assert!(sample.files.unmapped_reads.is_none());
        assert!(sample.files.clusts.is_none());
        assert_eq!(sample.clustering_inputs(), edits);
        assert_eq!(sample.stats.reads_filtered, 8);
        assert!(sample.stats.depths.is_empty());
    }

    #[test]
    fn test_markers_are_ordered() {
        let states = [
            SampleState::Unclustered,
            SampleState::Clustered,
            SampleState::Aligned,
            SampleState::DepthClassified,
        ];
        for pair in states.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].marker() < pair[1].marker());
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("samples.json");
        let mut sample = Sample::new("s1", vec![(PathBuf::from("s1.fastq"), None)]);
        sample.stats.reads_filtered = 42;
        sample.advance_to(SampleState::Aligned).unwrap();

        save_samples(&path, &[sample.clone()]).unwrap();
        let loaded = load_samples(&path).unwrap();
        assert_eq!(loaded, vec![sample]);
    }

    #[test]
    fn test_discover_samples() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AssemblyConfig {
            working_directory: dir.path().to_path_buf(),
            ..Default::default()
        };
        let edits = config.edits_dir();
        fs::create_dir_all(&edits).unwrap();
        let rec = "@r1\nACGT\n+\nIIII\n@r2\nACGA\n+\nIIII\n";
        fs::write(edits.join("b.fastq"), rec).unwrap();
        fs::write(edits.join("a.fastq"), rec).unwrap();
        fs::write(edits.join("a_merged_.fastq"), rec).unwrap();
        fs::write(edits.join("a_derep.fasta"), ">x;size=1;\nACGT\n").unwrap();

        let samples = discover_samples(&config).unwrap();
        let names: Vec<_> = samples.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(samples[0].stats.reads_filtered, 2);

        config.datatype = crate::config::Datatype::Pairddrad;
        fs::write(edits.join("p_R1_.fastq"), rec).unwrap();
        fs::write(edits.join("p_R2_.fastq"), rec).unwrap();
        let samples = discover_samples(&config).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].name, "p");
        assert!(samples[0].files.edits[0].1.is_some());
    }
}
