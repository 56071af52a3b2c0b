// src/orchestrator.rs
//
// Stage dispatch for the within-sample clustering step.

use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::fmt;
use std::fs;
use std::path::PathBuf;

use crate::cluster::{align_sample, build_clusters, classify_depths, write_stats_file};
use crate::clustfile::write_cluster_file;
use crate::config::{AssemblyConfig, RunOptions};
use crate::error::{ClusterError, IoContext, Result};
use crate::fastq::{concat_files, join_unmerged_pairs};
use crate::sample::{Sample, SampleState};
use crate::tools::{SearchParams, Toolkit};

/// Threads handed to each external tool invocation for a pool of `workers`.
pub fn threads_per_job(workers: usize) -> usize {
    if workers > 20 {
        workers / 4
    } else if workers >= 8 {
        4
    } else if workers >= 4 {
        2
    } else {
        1
    }
}

/// Concurrent sample jobs that fit in the pool.
pub fn job_slots(workers: usize) -> usize {
    workers.max(1).div_ceil(threads_per_job(workers))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    RefMap,
    Clustall,
    Finalize,
    Align,
    Classify,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::RefMap => "reference mapping",
            Stage::Clustall => "clustering",
            Stage::Finalize => "mapped-read merge",
            Stage::Align => "alignment",
            Stage::Classify => "depth classification",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct SampleFailure {
    pub sample: String,
    pub stage: Stage,
    pub error: ClusterError,
}

/// Outcome of one run over a sample set.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Samples that reached the terminal state in this run.
    pub completed: Vec<String>,
    /// Samples not selected: already finished, or without reads.
    pub skipped: Vec<String>,
    /// Aligned samples whose cluster file held no clusters.
    pub no_clusters: Vec<String>,
    pub failed: Vec<SampleFailure>,
    /// Set when the summary file could not be written. Sample state is
    /// still up to date.
    pub stats_error: Option<ClusterError>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.stats_error.is_none()
    }
}

pub struct Orchestrator {
    config: AssemblyConfig,
    toolkit: Toolkit,
    options: RunOptions,
}

impl Orchestrator {
    pub fn new(config: AssemblyConfig, toolkit: Toolkit, options: RunOptions) -> Result<Self> {
        config.validate()?;
        if config.assembly_method.maps_to_reference() && toolkit.mapper.is_none() {
            return Err(ClusterError::Config(format!(
                "assembly method {:?} needs a reference mapper",
                config.assembly_method
            )));
        }
        Ok(Self {
            config,
            toolkit,
            options,
        })
    }

    fn build_pool(threads: usize) -> Result<ThreadPool> {
        ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| ClusterError::Config(format!("could not start worker pool: {e}")))
    }

    /// Split `samples` into the ones this run works on and the ones it skips.
    /// Forced samples are reset; their previous record goes into `saved`.
    fn select<'a>(
        &self,
        samples: &'a mut [Sample],
        report: &mut RunReport,
        saved: &mut AHashMap<String, Sample>,
    ) -> Vec<&'a mut Sample> {
        let mut active = Vec::new();
        for sample in samples.iter_mut() {
            if sample.stats.reads_filtered == 0 {
                log::warn!("skipping {}: no reads", sample.name);
                report.skipped.push(sample.name.clone());
            } else if sample.is_at_least(SampleState::DepthClassified) && !self.options.force {
                log::info!(
                    "skipping {}: already at state {}",
                    sample.name,
                    sample.state.marker()
                );
                report.skipped.push(sample.name.clone());
            } else {
                if self.options.force {
                    saved.insert(sample.name.clone(), sample.clone());
                    sample.reset_for_rerun();
                }
                active.push(sample);
            }
        }
        active
    }

    /// Run `f` on every active sample on `pool` and wait for all of them.
    /// Samples whose job fails are recorded and left out of the result.
    fn run_stage<'a, F>(
        pool: &ThreadPool,
        stage: Stage,
        active: Vec<&'a mut Sample>,
        failures: &Mutex<Vec<SampleFailure>>,
        f: F,
    ) -> Vec<&'a mut Sample>
    where
        F: Fn(&mut Sample) -> Result<()> + Sync + Send,
    {
        pool.install(|| {
            active
                .into_par_iter()
                .filter_map(|sample| match f(&mut *sample) {
                    Ok(()) => Some(sample),
                    Err(error) => {
                        log::error!("{} failed during {}: {}", sample.name, stage, error);
                        failures.lock().push(SampleFailure {
                            sample: sample.name.clone(),
                            stage,
                            error,
                        });
                        None
                    }
                })
                .collect()
        })
    }

    fn create_dirs(&self) -> Result<()> {
        let mut dirs = vec![self.config.edits_dir(), self.config.clusts_dir()];
        if self.config.assembly_method.maps_to_reference() {
            dirs.push(self.config.refmapping_dir());
        }
        for dir in dirs {
            fs::create_dir_all(&dir).with_path(&dir)?;
        }
        Ok(())
    }

    /// Drive every selected sample through the remaining stages.
    ///
    /// Per-sample failures end up in the report; only problems that affect
    /// the whole run are returned as errors.
    ///
    /// A forced sample that fails gets its previous record back.
    pub fn run(&self, samples: &mut [Sample]) -> Result<RunReport> {
        self.create_dirs()?;
        let workers = self.options.workers.max(1);
        let threads = threads_per_job(workers);
        let jobs = Self::build_pool(job_slots(workers))?;
        let aligners = Self::build_pool(workers)?;

        let mut report = RunReport::default();
        let mut saved = AHashMap::new();
        let mut active = self.select(samples, &mut report, &mut saved);
        if active.is_empty() {
            log::info!("no samples to cluster");
            return Ok(report);
        }
        log::info!(
            "clustering {} samples with {} jobs of {} threads",
            active.len(),
            jobs.current_num_threads(),
            threads
        );
        let failures = Mutex::new(Vec::new());
        let config = &self.config;
        let toolkit = &self.toolkit;
        let options = &self.options;

        // 1. reference mapping
        let mapper = toolkit
            .mapper
            .as_ref()
            .filter(|_| config.assembly_method.maps_to_reference());
        if let Some(mapper) = mapper {
            active = Self::run_stage(&jobs, Stage::RefMap, active, &failures, |s| {
                if s.is_at_least(SampleState::Clustered) {
                    return Ok(());
                }
                mapper.map_reads(config, s, threads)
            });
        }

        // 2. dereplicate, search, assemble
        let fresh: AHashSet<String> = active
            .iter()
            .filter(|s| !s.is_at_least(SampleState::Clustered))
            .map(|s| s.name.clone())
            .collect();
        active = Self::run_stage(&jobs, Stage::Clustall, active, &failures, |s| {
            if s.is_at_least(SampleState::Clustered) {
                return Ok(());
            }
            clustall(config, toolkit, options, s, threads)
        });

        // 3. add the reference-mapped clusters
        let keeper = toolkit
            .mapper
            .as_ref()
            .filter(|_| config.assembly_method.keeps_mapped_reads());
        if let Some(mapper) = keeper {
            active = Self::run_stage(&jobs, Stage::Finalize, active, &failures, |s| {
                if !fresh.contains(&s.name) {
                    return Ok(());
                }
                let blocks = mapper.mapped_clusters(config, s)?;
                log::info!("{}: adding {} mapped clusters", s.name, blocks.len());
                write_cluster_file(s.clusts_path(config), &blocks, true)
            });
        }

        // 4. alignment, one sample at a time with its chunks in parallel
        let mut aligned = Vec::with_capacity(active.len());
        for sample in active {
            if sample.is_at_least(SampleState::Aligned) {
                aligned.push(sample);
                continue;
            }
            match align_sample(config, sample, &*toolkit.msa, &aligners) {
                Ok(_) => aligned.push(sample),
                Err(error) => {
                    log::error!("{} failed during {}: {}", sample.name, Stage::Align, error);
                    failures.lock().push(SampleFailure {
                        sample: sample.name.clone(),
                        stage: Stage::Align,
                        error,
                    });
                }
            }
        }

        // 5. depth classification
        let empty = Mutex::new(Vec::new());
        let classified = Self::run_stage(&jobs, Stage::Classify, aligned, &failures, |s| {
            if classify_depths(config, s)?.is_none() {
                empty.lock().push(s.name.clone());
            }
            Ok(())
        });
        report.no_clusters = empty.into_inner();

        let done: Vec<&Sample> = classified
            .into_iter()
            .map(|s| &*s)
            .filter(|s| s.is_at_least(SampleState::DepthClassified))
            .collect();
        if !done.is_empty() {
            let path = config.stats_file();
            if let Err(e) = write_stats_file(&path, &done, config) {
                log::error!("could not write {}: {}", path.display(), e);
                report.stats_error = Some(e);
            }
        }
        report.completed = done.iter().map(|s| s.name.clone()).collect();
        report.failed = failures.into_inner();

        for sample in samples.iter_mut() {
            if !report.failed.iter().any(|f| f.sample == sample.name) {
                continue;
            }
            if let Some(previous) = saved.remove(&sample.name) {
                log::info!("{}: keeping the record from before the re-run", sample.name);
                *sample = previous;
            }
        }
        log::info!(
            "{} samples clustered, {} failed",
            report.completed.len(),
            report.failed.len()
        );
        Ok(report)
    }
}

fn scratch_path(config: &AssemblyConfig, sample: &Sample, suffix: &str) -> PathBuf {
    config.clusts_dir().join(format!("{}_{}", sample.name, suffix))
}

fn remove_scratch(paths: &[PathBuf]) {
    for path in paths {
        if path.exists() {
            if let Err(e) = fs::remove_file(path) {
                log::warn!("could not remove {}: {}", path.display(), e);
            }
        }
    }
}

/// Dereplicate, search and assemble clusters for one sample.
pub fn clustall(
    config: &AssemblyConfig,
    toolkit: &Toolkit,
    options: &RunOptions,
    sample: &mut Sample,
    threads: usize,
) -> Result<()> {
    for dir in [config.edits_dir(), config.clusts_dir()] {
        fs::create_dir_all(&dir).with_path(&dir)?;
    }
    let mut scratch = Vec::new();
    let result = clustall_inner(config, toolkit, options, sample, threads, &mut scratch);
    remove_scratch(&scratch);
    result
}

fn clustall_inner(
    config: &AssemblyConfig,
    toolkit: &Toolkit,
    options: &RunOptions,
    sample: &mut Sample,
    threads: usize,
    scratch: &mut Vec<PathBuf>,
) -> Result<()> {
    // 1. one input file per read end
    let inputs = sample.clustering_inputs();
    let (mut r1, mut r2) = match inputs.as_slice() {
        [] => {
            return Err(ClusterError::Config(format!(
                "{} has no edited reads",
                sample.name
            )))
        }
        [(r1, r2)] => (r1.clone(), r2.clone()),
        many => {
            let cat1 = scratch_path(config, sample, "concat_R1.fastq");
            let firsts: Vec<&PathBuf> = many.iter().map(|(a, _)| a).collect();
            concat_files(&firsts, &cat1)?;
            scratch.push(cat1.clone());

            let seconds: Vec<&PathBuf> = many.iter().filter_map(|(_, b)| b.as_ref()).collect();
            let cat2 = if seconds.len() == many.len() {
                let cat2 = scratch_path(config, sample, "concat_R2.fastq");
                concat_files(&seconds, &cat2)?;
                scratch.push(cat2.clone());
                Some(cat2)
            } else {
                None
            };
            (cat1, cat2)
        }
    };

    // 2. merge overlapping mates and join the rest
    if config.datatype.is_paired() {
        let Some(second) = r2.take() else {
            return Err(ClusterError::Config(format!(
                "{} is paired data without second reads",
                sample.name
            )));
        };
        let merged = sample.merged_path(config);
        let nm1 = scratch_path(config, sample, "nonmerged_R1.fastq");
        let nm2 = scratch_path(config, sample, "nonmerged_R2.fastq");
        scratch.extend([nm1.clone(), nm2.clone()]);

        let n_merged = toolkit.cluster.merge_pairs(
            (r1.as_path(), second.as_path()),
            &merged,
            (nm1.as_path(), nm2.as_path()),
            threads,
        )?;
        let n_joined = join_unmerged_pairs(&nm1, &nm2, &merged)?;
        log::info!(
            "{}: {} pairs merged, {} joined",
            sample.name,
            n_merged,
            n_joined
        );
        sample.stats.reads_merged = n_merged;
        sample.files.merged = Some(merged.clone());
        r1 = merged;
    }

    // 3. dereplicate
    let params = SearchParams::for_config(config, options.noreverse);
    let derep = sample.derep_path(config);
    toolkit
        .cluster
        .dereplicate(&r1, &derep, params.both_strands, threads)?;
    sample.files.derep = Some(derep.clone());

    // 4. similarity search
    let hits = sample.hits_path(config);
    let nohits = sample.nohits_path(config);
    toolkit
        .cluster
        .cluster(&derep, &hits, &nohits, &params, threads)?;
    sample.files.hits = Some(hits);
    sample.files.nohits = Some(nohits);

    // 5. rebuild clusters
    build_clusters(config, sample)?;
    sample.advance_to(SampleState::Clustered)
}
