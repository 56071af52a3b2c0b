// src/config.rs

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use crate::error::{ClusterError, IoContext, Result};

/// Library preparation protocol of the reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Datatype {
    Rad,
    Ddrad,
    Gbs,
    Pairddrad,
    Pairgbs,
}

impl Datatype {
    pub fn is_paired(self) -> bool {
        matches!(self, Datatype::Pairddrad | Datatype::Pairgbs)
    }

    /// GBS reads can come from either strand of a locus.
    pub fn searches_both_strands(self) -> bool {
        matches!(self, Datatype::Gbs | Datatype::Pairgbs)
    }

    /// Aligned GBS clusters get their overhangs trimmed to the seed.
    pub fn trims_overhangs(self) -> bool {
        self.searches_both_strands()
    }

    pub fn query_coverage(self) -> f32 {
        match self {
            Datatype::Gbs => 0.60,
            _ => 0.90,
        }
    }
}

impl std::str::FromStr for Datatype {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rad" => Ok(Datatype::Rad),
            "ddrad" => Ok(Datatype::Ddrad),
            "gbs" => Ok(Datatype::Gbs),
            "pairddrad" => Ok(Datatype::Pairddrad),
            "pairgbs" => Ok(Datatype::Pairgbs),
            other => Err(ClusterError::Config(format!("unknown datatype '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssemblyMethod {
    Denovo,
    Reference,
    DenovoOnly,
}

impl AssemblyMethod {
    pub fn maps_to_reference(self) -> bool {
        self != AssemblyMethod::Denovo
    }

    /// Only `reference` folds the mapped reads back into the clusters.
    pub fn keeps_mapped_reads(self) -> bool {
        self == AssemblyMethod::Reference
    }
}

impl std::str::FromStr for AssemblyMethod {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "denovo" => Ok(AssemblyMethod::Denovo),
            "reference" => Ok(AssemblyMethod::Reference),
            "denovo_only" => Ok(AssemblyMethod::DenovoOnly),
            other => Err(ClusterError::Config(format!(
                "unknown assembly method '{other}'"
            ))),
        }
    }
}

/// Locations of the external binaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub vsearch: PathBuf,
    pub muscle: PathBuf,
    pub bwa: PathBuf,
    pub samtools: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            vsearch: PathBuf::from("vsearch"),
            muscle: PathBuf::from("muscle"),
            bwa: PathBuf::from("bwa"),
            samtools: PathBuf::from("samtools"),
        }
    }
}

/// Parameters shared read-only by every sample of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblyConfig {
    /// Assembly name, used to derive output directory names.
    pub name: String,
    pub working_directory: PathBuf,
    pub datatype: Datatype,
    /// Similarity threshold for within-sample clustering.
    pub clust_threshold: f32,
    /// Maximum internal indels per locus, first and second read.
    pub max_indels_locus: (u32, u32),
    pub mindepth_majrule: u32,
    pub mindepth_statistical: u32,
    pub assembly_method: AssemblyMethod,
    pub reference_sequence: Option<PathBuf>,
    pub tools: ToolPaths,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            name: "assembly".to_string(),
            working_directory: PathBuf::from("."),
            datatype: Datatype::Rad,
            clust_threshold: 0.85,
            max_indels_locus: (5, 5),
            mindepth_majrule: 6,
            mindepth_statistical: 6,
            assembly_method: AssemblyMethod::Denovo,
            reference_sequence: None,
            tools: ToolPaths::default(),
        }
    }
}

impl AssemblyConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_path(path)?;
        let config: AssemblyConfig = serde_json::from_reader(BufReader::new(file))
            .map_err(|source| ClusterError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.clust_threshold > 0.0 && self.clust_threshold <= 1.0) {
            return Err(ClusterError::Config(format!(
                "clust_threshold must be in (0, 1], got {}",
                self.clust_threshold
            )));
        }
        if self.name.is_empty() {
            return Err(ClusterError::Config("assembly name is empty".to_string()));
        }
        if self.assembly_method.maps_to_reference() && self.reference_sequence.is_none() {
            return Err(ClusterError::Config(format!(
                "assembly method {:?} needs a reference sequence",
                self.assembly_method
            )));
        }
        Ok(())
    }

    pub fn edits_dir(&self) -> PathBuf {
        self.working_directory.join(format!("{}_edits", self.name))
    }

    pub fn clusts_dir(&self) -> PathBuf {
        self.working_directory
            .join(format!("{}_clust_{}", self.name, self.clust_threshold))
    }

    pub fn refmapping_dir(&self) -> PathBuf {
        self.working_directory
            .join(format!("{}_refmapping", self.name))
    }

    pub fn stats_file(&self) -> PathBuf {
        self.clusts_dir().join("s3_cluster_stats.txt")
    }
}

/// Switches for a single invocation of the clustering step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Size of the worker pool.
    pub workers: usize,
    /// Re-run samples that already passed this step.
    pub force: bool,
    /// Never cluster reverse complements, whatever the datatype.
    pub noreverse: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            workers: rayon::current_num_threads(),
            force: false,
            noreverse: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_datatype_switches() {
        assert!(Datatype::Pairgbs.is_paired());
        assert!(!Datatype::Gbs.is_paired());
        assert!(Datatype::Gbs.searches_both_strands());
        assert!(!Datatype::Ddrad.searches_both_strands());
        assert_eq!(Datatype::Gbs.query_coverage(), 0.60);
        assert_eq!(Datatype::Pairgbs.query_coverage(), 0.90);
        assert_eq!("pairddrad".parse::<Datatype>().unwrap(), Datatype::Pairddrad);
        assert!("nanopore".parse::<Datatype>().is_err());
    }

    #[test]
    fn test_validate() {
        let mut config = AssemblyConfig::default();
        assert!(config.validate().is_ok());

        config.clust_threshold = 0.0;
        assert!(config.validate().is_err());

        config.clust_threshold = 0.9;
        config.assembly_method = AssemblyMethod::Reference;
        assert!(config.validate().is_err());
        config.reference_sequence = Some(PathBuf::from("ref.fa"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_partial_params() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"name": "test", "datatype": "gbs", "max_indels_locus": [3, 8], "assembly_method": "denovo_only", "reference_sequence": "ref.fa"}}"#
        )
        .unwrap();
        let config = AssemblyConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.datatype, Datatype::Gbs);
        assert_eq!(config.max_indels_locus, (3, 8));
        assert_eq!(config.assembly_method, AssemblyMethod::DenovoOnly);
        assert_eq!(config.mindepth_majrule, 6);
        assert!(config.clusts_dir().ends_with("test_clust_0.85"));
    }
}
