// src/cluster/align_chunks.rs

use rayon::prelude::*;
use rayon::ThreadPool;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::NamedTempFile;

use crate::clustfile::{parse_cluster_blocks, read_cluster_file, write_blocks};
use crate::config::{AssemblyConfig, Datatype};
use crate::error::{ClusterError, IoContext, Result};
use crate::sample::{Sample, SampleState};
use crate::tools::MsaEngine;
use crate::types::{ClusterBlock, ClusterRecord, ClusterTag, PAIR_SEPARATOR};

/// Clusters per chunk for ordinary samples.
pub const DEFAULT_CHUNK_SIZE: usize = 100;

/// Above this many clusters the chunk size is derived from the pool size.
pub const LARGE_SAMPLE_CLUSTERS: usize = 2000;

/// Most sequences of one cluster handed to the aligner.
pub const MAX_ALIGNED_SEQS: usize = 200;

/// Clusters per alignment chunk for a sample of `total` clusters.
pub fn chunk_size(total: usize, workers: usize) -> usize {
    if total > LARGE_SAMPLE_CLUSTERS {
        (total / workers.max(1) / 2).max(1)
    } else {
        DEFAULT_CHUNK_SIZE
    }
}

/// Gaps inside an aligned sequence, ignoring leading and trailing gaps.
pub fn internal_indels(seq: &str) -> usize {
    seq.trim_matches('-').matches('-').count()
}

/// Aligns and filters single clusters.
pub struct BlockAligner<'a> {
    msa: &'a dyn MsaEngine,
    datatype: Datatype,
    max_indels: (u32, u32),
}

/// Sequences kept and dropped by one alignment pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AlignCounts {
    pub clusters_in: usize,
    pub clusters_out: usize,
    pub seqs_dropped: usize,
}

impl AlignCounts {
    fn merge(mut self, other: AlignCounts) -> AlignCounts {
        self.clusters_in += other.clusters_in;
        self.clusters_out += other.clusters_out;
        self.seqs_dropped += other.seqs_dropped;
        self
    }
}

impl<'a> BlockAligner<'a> {
    pub fn new(msa: &'a dyn MsaEngine, config: &AssemblyConfig) -> Self {
        Self {
            msa,
            datatype: config.datatype,
            max_indels: config.max_indels_locus,
        }
    }

    /// Align one half of a cluster and return the sequences in input order.
    fn align_ordered(&self, seqs: Vec<String>) -> Result<Vec<String>> {
        let n = seqs.len();
        let named: Vec<(String, String)> = seqs
            .into_iter()
            .enumerate()
            .map(|(i, s)| (i.to_string(), s))
            .collect();

        // the aligner reorders its output; names carry the input position
        let mut slots: Vec<Option<String>> = vec![None; n];
        for (name, seq) in self.msa.align(&named)? {
            match name.trim().parse::<usize>() {
                Ok(i) if i < n && slots[i].is_none() => slots[i] = Some(seq),
                _ => return Err(unexpected_output(format!("unknown record name '{name}'"))),
            }
        }
        slots
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| unexpected_output(format!("aligner returned fewer than {n} records")))
    }

    /// Align a cluster and filter it by internal indels. Returns `None`
    /// when nothing survives the filter.
    pub fn align_block(&self, block: &ClusterBlock) -> Result<(Option<ClusterBlock>, usize)> {
        if block.len() <= 1 {
            return Ok((Some(block.clone()), 0));
        }

        let mut records: Vec<&ClusterRecord> = block.records.iter().collect();
        let mut dropped = 0;
        if records.len() > MAX_ALIGNED_SEQS {
            log::debug!(
                "cluster {} has {} sequences; aligning the first {}",
                block.seed().map(|s| s.id.as_str()).unwrap_or_default(),
                records.len(),
                MAX_ALIGNED_SEQS
            );
            dropped += records.len() - MAX_ALIGNED_SEQS;
            records.truncate(MAX_ALIGNED_SEQS);
        }

        let kept = if records.iter().all(|r| r.is_paired()) {
            self.align_paired(&records)?
        } else {
            self.align_single(&records)?
        };
        dropped += records.len() - kept.len();

        let out = ClusterBlock { records: kept };
        Ok((if out.is_empty() { None } else { Some(out) }, dropped))
    }

    fn align_paired(&self, records: &[&ClusterRecord]) -> Result<Vec<ClusterRecord>> {
        let (firsts, seconds): (Vec<String>, Vec<String>) = records
            .iter()
            .map(|r| match r.seq.split_once(PAIR_SEPARATOR) {
                Some((a, b)) => (a.to_string(), b.to_string()),
                None => (r.seq.clone(), String::new()),
            })
            .unzip();
        let firsts = self.align_ordered(firsts)?;
        let seconds = self.align_ordered(seconds)?;

        let mut kept = Vec::with_capacity(records.len());
        for ((rec, a), b) in records.iter().zip(firsts).zip(seconds) {
            let (n1, n2) = (internal_indels(&a), internal_indels(&b));
            if n1 <= self.max_indels.0 as usize && n2 <= self.max_indels.1 as usize {
                kept.push(ClusterRecord {
                    seq: format!("{a}{PAIR_SEPARATOR}{b}"),
                    ..(*rec).clone()
                });
            } else {
                log::debug!("high indels: {} ({} / {})", rec.id, n1, n2);
            }
        }
        Ok(kept)
    }

    fn align_single(&self, records: &[&ClusterRecord]) -> Result<Vec<ClusterRecord>> {
        let mut aligned = self.align_ordered(records.iter().map(|r| r.seq.clone()).collect())?;
        if self.datatype.trims_overhangs() {
            let tags: Vec<ClusterTag> = records.iter().map(|r| r.tag).collect();
            trim_overhangs(&mut aligned, &tags);
        }

        let mut kept = Vec::with_capacity(records.len());
        for (rec, seq) in records.iter().zip(aligned) {
            let n = internal_indels(&seq);
            if n <= self.max_indels.0 as usize {
                kept.push(ClusterRecord { seq, ..(*rec).clone() });
            } else {
                log::debug!("high indels: {} ({})", rec.id, n);
            }
        }
        Ok(kept)
    }
}

fn unexpected_output(message: String) -> ClusterError {
    ClusterError::ExternalTool {
        tool: "aligner".to_string(),
        command: "align".to_string(),
        stderr: message,
        stdout: String::new(),
    }
}

/// Clip aligned sequences so no hit extends left of the seed's first base
/// or right of the shortest reverse hit.
pub fn trim_overhangs(aligned: &mut [String], tags: &[ClusterTag]) {
    let Some(seed) = aligned.first() else { return };
    if let Some(left) = seed.bytes().position(|b| b != b'-') {
        if left > 0 {
            for seq in aligned.iter_mut() {
                *seq = seq.get(left..).unwrap_or_default().to_string();
            }
        }
    }

    let right = aligned
        .iter()
        .zip(tags)
        .filter(|(_, tag)| **tag == ClusterTag::Reverse)
        .filter_map(|(seq, _)| seq.bytes().rposition(|b| b != b'-').map(|i| i + 1))
        .min();
    if let Some(right) = right {
        for seq in aligned.iter_mut() {
            seq.truncate(right.min(seq.len()));
        }
    }
}

/// Align every cluster of a chunk file and overwrite it with the result.
fn align_chunk_file(path: &Path, aligner: &BlockAligner<'_>) -> Result<AlignCounts> {
    let blocks = parse_cluster_blocks(BufReader::new(File::open(path).with_path(path)?), path)?;
    let mut counts = AlignCounts {
        clusters_in: blocks.len(),
        ..Default::default()
    };

    let mut out = Vec::with_capacity(blocks.len());
    for block in &blocks {
        let (aligned, dropped) = aligner.align_block(block)?;
        counts.seqs_dropped += dropped;
        if let Some(aligned) = aligned {
            out.push(aligned);
        }
    }
    counts.clusters_out = out.len();

    let mut writer = BufWriter::new(File::create(path).with_path(path)?);
    write_blocks(&mut writer, &out).with_path(path)?;
    writer.flush().with_path(path)?;
    Ok(counts)
}

/// Summary of a sample's alignment stage.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AlignReport {
    pub chunks: usize,
    pub chunk_size: usize,
    pub counts: AlignCounts,
}

fn write_chunks(dir: &Path, sample: &str, blocks: &[ClusterBlock], size: usize) -> Result<Vec<NamedTempFile>> {
    let mut chunks = Vec::with_capacity(blocks.len() / size + 1);
    for chunk in blocks.chunks(size) {
        let mut tmp = tempfile::Builder::new()
            .prefix(&format!("{sample}_"))
            .suffix(".ali")
            .tempfile_in(dir)
            .with_path(dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            write_blocks(&mut writer, chunk).with_path(dir)?;
            writer.flush().with_path(dir)?;
        }
        chunks.push(tmp);
    }
    Ok(chunks)
}

fn concat_chunks(chunks: &[NamedTempFile], out: &Path) -> Result<()> {
    let file = File::create(out).with_path(out)?;
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    for chunk in chunks {
        let mut reader = BufReader::new(File::open(chunk.path()).with_path(chunk.path())?);
        io::copy(&mut reader, &mut encoder).with_path(chunk.path())?;
    }
    encoder.finish().with_path(out)?.flush().with_path(out)
}

fn align_in_dir(
    dir: &Path,
    config: &AssemblyConfig,
    sample: &Sample,
    msa: &dyn MsaEngine,
    pool: &ThreadPool,
    chunks: &mut Vec<NamedTempFile>,
) -> Result<AlignReport> {
    let clusts = sample
        .files
        .clusts
        .clone()
        .unwrap_or_else(|| sample.clusts_path(config));
    let blocks = read_cluster_file(&clusts)?;
    let size = chunk_size(blocks.len(), pool.current_num_threads());
    log::debug!(
        "{}: {} clusters in chunks of {}",
        sample.name,
        blocks.len(),
        size
    );

    *chunks = write_chunks(dir, &sample.name, &blocks, size)?;
    drop(blocks);

    let aligner = BlockAligner::new(msa, config);
    let results: Vec<AlignCounts> = pool.install(|| {
        chunks
            .par_iter()
            .map(|chunk| align_chunk_file(chunk.path(), &aligner))
            .collect::<Result<Vec<_>>>()
    })?;

    concat_chunks(chunks, &sample.clusters_path(config))?;
    Ok(AlignReport {
        chunks: chunks.len(),
        chunk_size: size,
        counts: results.into_iter().fold(AlignCounts::default(), AlignCounts::merge),
    })
}

/// Align all clusters of `sample` in bounded chunks on `pool`, writing
/// the aligned cluster file. Temporary chunk files and their directory
/// are removed whether or not alignment succeeds.
pub fn align_sample(
    config: &AssemblyConfig,
    sample: &mut Sample,
    msa: &dyn MsaEngine,
    pool: &ThreadPool,
) -> Result<AlignReport> {
    let parent = config.clusts_dir();
    fs::create_dir_all(&parent).with_path(&parent)?;
    let tmpdir = tempfile::Builder::new()
        .prefix(&format!("{}_tmpalign", sample.name))
        .tempdir_in(&parent)
        .with_path(&parent)?;

    let mut chunks = Vec::new();
    let result = align_in_dir(tmpdir.path(), config, sample, msa, pool, &mut chunks);

    for chunk in chunks {
        let path = chunk.path().to_path_buf();
        if let Err(e) = chunk.close() {
            log::warn!("could not remove {}: {}", path.display(), e);
        }
    }
    let dir = tmpdir.path().to_path_buf();
    if let Err(e) = tmpdir.close() {
        log::warn!("could not remove {}: {}", dir.display(), e);
    }

    let report = result?;
    log::info!(
        "{}: aligned {} clusters in {} chunks, kept {}, dropped {} sequences",
        sample.name,
        report.counts.clusters_in,
        report.chunks,
        report.counts.clusters_out,
        report.counts.seqs_dropped
    );
    sample.files.clusters = Some(sample.clusters_path(config));
    sample.advance_to(SampleState::Aligned)?;
    Ok(report)
}
