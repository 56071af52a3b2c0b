// src/lib.rs
pub mod types;
pub mod error;
pub mod config;
pub mod sample;
pub mod fastq;
pub mod clustfile;
pub mod hits;
pub mod tools;
pub mod cluster;
pub mod orchestrator;

pub use crate::config::{AssemblyConfig, AssemblyMethod, Datatype, RunOptions};
pub use crate::error::{ClusterError, Result};
pub use crate::orchestrator::{Orchestrator, RunReport, SampleFailure, Stage};
pub use crate::sample::{discover_samples, load_samples, save_samples, Sample, SampleState};
pub use crate::tools::{ClusterEngine, MsaEngine, ReferenceMapper, Toolkit};

/// Cluster reads within each sample: dereplicate, search, assemble, align
/// and classify cluster depths, then append the run summary.
///
/// Samples are updated in place. A sample that fails is reported in the
/// returned [`RunReport`] and does not stop the others.
pub fn cluster_within(
    config: AssemblyConfig,
    samples: &mut [Sample],
    options: RunOptions,
    toolkit: Toolkit,
) -> Result<RunReport> {
    Orchestrator::new(config, toolkit, options)?.run(samples)
}
