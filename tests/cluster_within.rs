use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use radclust::clustfile::read_cluster_file;
use radclust::fastq::read_fastq_records;
use radclust::tools::SearchParams;
use radclust::types::{ClusterBlock, ClusterRecord, ClusterTag, FastqRecord};
use radclust::{
    cluster_within, discover_samples, AssemblyConfig, AssemblyMethod, ClusterEngine,
    ClusterError, Datatype, MsaEngine, ReferenceMapper, RunOptions, Sample, SampleState, Stage,
    Toolkit,
};

/// Dereplicates exactly and clusters reads that differ from an earlier seed
/// by at most one mismatch. Samples whose name contains "broken" produce
/// no hit file.
struct FakeSearch;

fn mismatches(a: &str, b: &str) -> usize {
    if a.len() != b.len() {
        return usize::MAX;
    }
    a.bytes().zip(b.bytes()).filter(|(x, y)| x != y).count()
}

impl ClusterEngine for FakeSearch {
    fn dereplicate(
        &self,
        input: &Path,
        output: &Path,
        _both_strands: bool,
        _threads: usize,
    ) -> radclust::Result<()> {
        let mut counts: Vec<(String, u32)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for rec in read_fastq_records(input)? {
            match index.get(&rec.seq) {
                Some(&i) => counts[i].1 += 1,
                None => {
                    index.insert(rec.seq.clone(), counts.len());
                    counts.push((rec.seq, 1));
                }
            }
        }
        counts.sort_by(|a, b| b.1.cmp(&a.1));
        let text: String = counts
            .iter()
            .enumerate()
            .map(|(i, (seq, n))| format!(">u{i};size={n};\n{seq}\n"))
            .collect();
        fs::write(output, text).unwrap();
        Ok(())
    }

    fn cluster(
        &self,
        derep: &Path,
        hits: &Path,
        nohits: &Path,
        _params: &SearchParams,
        _threads: usize,
    ) -> radclust::Result<()> {
        let text = fs::read_to_string(derep).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        let mut seeds: Vec<(&str, &str)> = Vec::new();
        let mut hit_rows = String::new();
        let mut seed_rows = String::new();
        for pair in lines.chunks(2) {
            let (label, seq) = (&pair[0][1..], pair[1]);
            match seeds.iter().find(|(_, s)| mismatches(s, seq) <= 1) {
                Some((seed, _)) => {
                    hit_rows.push_str(&format!("{label}\t{seed}\t97.0\t0\t+\t100.0\n"));
                }
                None => {
                    seeds.push((label, seq));
                    seed_rows.push_str(&format!(">{label}\n{seq}\n"));
                }
            }
        }
        if !derep.to_string_lossy().contains("broken") {
            fs::write(hits, hit_rows).unwrap();
        }
        fs::write(nohits, seed_rows).unwrap();
        Ok(())
    }

    fn merge_pairs(
        &self,
        reads: (&Path, &Path),
        merged: &Path,
        notmerged: (&Path, &Path),
        _threads: usize,
    ) -> radclust::Result<u64> {
        fs::write(merged, "").unwrap();
        fs::copy(reads.0, notmerged.0).unwrap();
        fs::copy(reads.1, notmerged.1).unwrap();
        Ok(0)
    }
}

/// Pads sequences with trailing gaps to a common width.
struct PadAligner;

impl MsaEngine for PadAligner {
    fn align(&self, records: &[(String, String)]) -> radclust::Result<Vec<(String, String)>> {
        let width = records.iter().map(|(_, s)| s.len()).max().unwrap_or(0);
        Ok(records
            .iter()
            .map(|(n, s)| (n.clone(), format!("{s:-<width$}")))
            .collect())
    }
}

/// Runs the search but leaves no hit file behind.
struct NoHitFile;

impl ClusterEngine for NoHitFile {
    fn dereplicate(
        &self,
        input: &Path,
        output: &Path,
        both_strands: bool,
        threads: usize,
    ) -> radclust::Result<()> {
        FakeSearch.dereplicate(input, output, both_strands, threads)
    }

    fn cluster(
        &self,
        derep: &Path,
        hits: &Path,
        nohits: &Path,
        params: &SearchParams,
        threads: usize,
    ) -> radclust::Result<()> {
        FakeSearch.cluster(derep, hits, nohits, params, threads)?;
        fs::remove_file(hits).unwrap();
        Ok(())
    }

    fn merge_pairs(
        &self,
        reads: (&Path, &Path),
        merged: &Path,
        notmerged: (&Path, &Path),
        threads: usize,
    ) -> radclust::Result<u64> {
        FakeSearch.merge_pairs(reads, merged, notmerged, threads)
    }
}

/// Maps the reads identical to `LOCUS_B`. The mapped reads are kept as a
/// FASTQ in place of a BAM.
#[derive(Clone, Default)]
struct LocusMapper {
    calls: Arc<AtomicUsize>,
    reads_seen: Arc<AtomicUsize>,
}

fn to_fastq(records: &[FastqRecord]) -> String {
    records
        .iter()
        .map(|r| format!("@{}\n{}\n+\n{}\n", r.id, r.seq, r.quals))
        .collect()
}

impl ReferenceMapper for LocusMapper {
    fn map_reads(
        &self,
        config: &AssemblyConfig,
        sample: &mut Sample,
        _threads: usize,
    ) -> radclust::Result<()> {
        let reads = read_fastq_records(&sample.files.edits[0].0)?;
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.reads_seen.store(reads.len(), Ordering::SeqCst);

        let (mapped, unmapped): (Vec<_>, Vec<_>) =
            reads.into_iter().partition(|r| r.seq == LOCUS_B);
        let dir = config.refmapping_dir();
        let mapped_path = dir.join(format!("{}.mapped.fastq", sample.name));
        let unmapped_path = dir.join(format!("{}.unmapped_R1.fastq", sample.name));
        fs::write(&mapped_path, to_fastq(&mapped)).unwrap();
        fs::write(&unmapped_path, to_fastq(&unmapped)).unwrap();
        sample.files.mapped_reads = Some(mapped_path);
        sample.files.unmapped_reads = Some((unmapped_path, None));
        Ok(())
    }

    fn mapped_clusters(
        &self,
        _config: &AssemblyConfig,
        sample: &Sample,
    ) -> radclust::Result<Vec<ClusterBlock>> {
        let Some(path) = &sample.files.mapped_reads else {
            return Ok(Vec::new());
        };
        let records: Vec<ClusterRecord> = read_fastq_records(path)?
            .into_iter()
            .enumerate()
            .map(|(i, r)| {
                let tag = if i == 0 { ClusterTag::Seed } else { ClusterTag::Forward };
                ClusterRecord::new(r.id, 1, tag, r.seq)
            })
            .collect();
        if records.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![ClusterBlock { records }])
    }
}

fn toolkit() -> Toolkit {
    Toolkit {
        cluster: Box::new(FakeSearch),
        msa: Box::new(PadAligner),
        mapper: None,
    }
}

fn fastq(seqs: &[(&str, usize)]) -> String {
    let mut out = String::new();
    let mut n = 0;
    for (seq, copies) in seqs {
        for _ in 0..*copies {
            out.push_str(&format!("@r{n}\n{seq}\n+\n{}\n", "I".repeat(seq.len())));
            n += 1;
        }
    }
    out
}

fn setup(datatype: Datatype) -> (tempfile::TempDir, AssemblyConfig) {
    let dir = tempfile::tempdir().unwrap();
    let config = AssemblyConfig {
        name: "test".to_string(),
        working_directory: dir.path().to_path_buf(),
        datatype,
        mindepth_majrule: 6,
        mindepth_statistical: 3,
        ..Default::default()
    };
    fs::create_dir_all(config.edits_dir()).unwrap();
    (dir, config)
}

const LOCUS_A: &str = "TGCAGAAACCCGGGTTTACGT";
const LOCUS_A2: &str = "TGCAGAAACCCGGGTTTACGA";
const LOCUS_B: &str = "TGCAGTTTTTTTTTTCCCCCC";

fn write_sample(config: &AssemblyConfig, name: &str) {
    let reads = fastq(&[(LOCUS_A, 6), (LOCUS_A2, 2), (LOCUS_B, 3)]);
    fs::write(config.edits_dir().join(format!("{name}.fastq")), reads).unwrap();
}

fn with_mapper(mapper: &LocusMapper) -> Toolkit {
    Toolkit {
        mapper: Some(Box::new(mapper.clone())),
        ..toolkit()
    }
}

fn mapping_setup(method: AssemblyMethod) -> (tempfile::TempDir, AssemblyConfig) {
    let (dir, mut config) = setup(Datatype::Rad);
    config.assembly_method = method;
    config.reference_sequence = Some(dir.path().join("ref.fa"));
    (dir, config)
}

fn forced() -> RunOptions {
    RunOptions {
        force: true,
        ..options()
    }
}

fn options() -> RunOptions {
    RunOptions {
        workers: 4,
        force: false,
        noreverse: false,
    }
}

#[test]
fn test_full_run_classifies_depths() {
    let (_dir, config) = setup(Datatype::Ddrad);
    write_sample(&config, "s1");
    let mut samples = discover_samples(&config).unwrap();
    assert_eq!(samples[0].stats.reads_filtered, 11);

    let report = cluster_within(config.clone(), &mut samples, options(), toolkit()).unwrap();
    assert!(report.is_success());
    assert_eq!(report.completed, ["s1"]);

    let s1 = &samples[0];
    assert_eq!(s1.state, SampleState::DepthClassified);
    assert_eq!(s1.stats.depths, [8, 3]);
    assert_eq!(s1.stats.clusters_total, 2);
    assert_eq!(s1.stats.clusters_hidepth, 2);

    let aligned = read_cluster_file(s1.files.clusters.as_ref().unwrap()).unwrap();
    assert_eq!(aligned.len(), 2);
    assert_eq!(aligned[0].len(), 2);

    let stats = fs::read_to_string(config.stats_file()).unwrap();
    assert_eq!(stats.lines().count(), 2);
    assert!(stats.lines().nth(1).unwrap().starts_with("s1"));
}

#[test]
fn test_missing_hits_fails_only_that_sample() {
    let (_dir, config) = setup(Datatype::Rad);
    write_sample(&config, "good");
    write_sample(&config, "broken");
    let mut samples = discover_samples(&config).unwrap();

    let report = cluster_within(config.clone(), &mut samples, options(), toolkit()).unwrap();
    assert_eq!(report.completed, ["good"]);
    assert_eq!(report.failed.len(), 1);
    let failure = &report.failed[0];
    assert_eq!(failure.sample, "broken");
    assert_eq!(failure.stage, Stage::Clustall);
    assert!(matches!(failure.error, ClusterError::MissingHits { .. }));

    let broken = samples.iter().find(|s| s.name == "broken").unwrap();
    assert_eq!(broken.state, SampleState::Unclustered);

    let stats = fs::read_to_string(config.stats_file()).unwrap();
    assert!(stats.contains("good"));
    assert!(!stats.contains("broken"));
}

#[test]
fn test_finished_samples_skipped_unless_forced() {
    let (_dir, config) = setup(Datatype::Rad);
    write_sample(&config, "s1");
    let mut samples = discover_samples(&config).unwrap();
    cluster_within(config.clone(), &mut samples, options(), toolkit()).unwrap();

    let again = cluster_within(config.clone(), &mut samples, options(), toolkit()).unwrap();
    assert_eq!(again.skipped, ["s1"]);
    assert!(again.completed.is_empty());

    let rerun = cluster_within(config.clone(), &mut samples, forced(), toolkit()).unwrap();
    assert_eq!(rerun.completed, ["s1"]);
    assert_eq!(samples[0].stats.depths, [8, 3]);

    // one header, two appended rows
    let stats = fs::read_to_string(config.stats_file()).unwrap();
    assert_eq!(stats.lines().count(), 3);
}

#[test]
fn test_paired_reads_are_joined() {
    let (_dir, config) = setup(Datatype::Pairddrad);
    let r1 = fastq(&[(LOCUS_A, 4), (LOCUS_A2, 1), (LOCUS_B, 2)]);
    let r2 = fastq(&[(LOCUS_B, 5), (LOCUS_A, 2)]);
    fs::write(config.edits_dir().join("p_R1_.fastq"), r1).unwrap();
    fs::write(config.edits_dir().join("p_R2_.fastq"), r2).unwrap();
    let mut samples = discover_samples(&config).unwrap();
    assert_eq!(samples.len(), 1);

    let report = cluster_within(config.clone(), &mut samples, options(), toolkit()).unwrap();
    assert!(report.is_success());
    let p = &samples[0];
    assert_eq!(p.stats.reads_merged, 0);
    assert_eq!(p.stats.depths, [5, 2]);

    let aligned = read_cluster_file(p.files.clusters.as_ref().unwrap()).unwrap();
    assert!(aligned.iter().all(|b| b.records.iter().all(|r| r.is_paired())));

    let leftovers: Vec<String> = fs::read_dir(config.clusts_dir())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.contains("nonmerged"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn test_reference_run_appends_mapped_clusters_once() {
    let (_dir, config) = mapping_setup(AssemblyMethod::Reference);
    write_sample(&config, "s1");
    let mut samples = discover_samples(&config).unwrap();
    let edits = samples[0].files.edits.clone();
    let mapper = LocusMapper::default();

    let report = cluster_within(config.clone(), &mut samples, options(), with_mapper(&mapper))
        .unwrap();
    assert!(report.is_success());
    assert_eq!(mapper.calls.load(Ordering::SeqCst), 1);
    assert_eq!(mapper.reads_seen.load(Ordering::SeqCst), 11);
    assert_eq!(samples[0].stats.depths, [8, 3]);
    assert_eq!(samples[0].files.edits, edits);

    let clusts = read_cluster_file(samples[0].clusts_path(&config)).unwrap();
    assert_eq!(clusts.len(), 2);
    assert_eq!(clusts[1].depth(), 3);

    // finished samples are not mapped again
    let again = cluster_within(config.clone(), &mut samples, options(), with_mapper(&mapper))
        .unwrap();
    assert_eq!(again.skipped, ["s1"]);
    assert_eq!(mapper.calls.load(Ordering::SeqCst), 1);

    // a forced re-run maps every edited read again
    let rerun = cluster_within(config.clone(), &mut samples, forced(), with_mapper(&mapper))
        .unwrap();
    assert_eq!(rerun.completed, ["s1"]);
    assert_eq!(mapper.calls.load(Ordering::SeqCst), 2);
    assert_eq!(mapper.reads_seen.load(Ordering::SeqCst), 11);
    assert_eq!(samples[0].stats.depths, [8, 3]);
    assert_eq!(samples[0].files.edits, edits);
    let clusts = read_cluster_file(samples[0].clusts_path(&config)).unwrap();
    assert_eq!(clusts.len(), 2);
}

#[test]
fn test_denovo_only_discards_mapped_reads() {
    let (_dir, config) = mapping_setup(AssemblyMethod::DenovoOnly);
    write_sample(&config, "s1");
    let mut samples = discover_samples(&config).unwrap();
    let mapper = LocusMapper::default();

    let report = cluster_within(config.clone(), &mut samples, options(), with_mapper(&mapper))
        .unwrap();
    assert!(report.is_success());
    assert_eq!(mapper.calls.load(Ordering::SeqCst), 1);
    assert_eq!(samples[0].stats.depths, [8]);
    let clusts = read_cluster_file(samples[0].clusts_path(&config)).unwrap();
    assert_eq!(clusts.len(), 1);
}

#[test]
fn test_denovo_run_never_maps() {
    let (_dir, config) = setup(Datatype::Rad);
    write_sample(&config, "s1");
    let mut samples = discover_samples(&config).unwrap();
    let mapper = LocusMapper::default();

    let report = cluster_within(config.clone(), &mut samples, options(), with_mapper(&mapper))
        .unwrap();
    assert!(report.is_success());
    assert_eq!(mapper.calls.load(Ordering::SeqCst), 0);
    assert!(samples[0].files.unmapped_reads.is_none());
    assert_eq!(samples[0].stats.depths, [8, 3]);
}

#[test]
fn test_failed_forced_rerun_keeps_previous_record() {
    let (_dir, config) = setup(Datatype::Rad);
    write_sample(&config, "s1");
    let mut samples = discover_samples(&config).unwrap();
    cluster_within(config.clone(), &mut samples, options(), toolkit()).unwrap();
    let before = samples[0].clone();
    assert_eq!(before.state, SampleState::DepthClassified);

    let no_hits = Toolkit {
        cluster: Box::new(NoHitFile),
        ..toolkit()
    };
    let rerun = cluster_within(config.clone(), &mut samples, forced(), no_hits).unwrap();
    assert!(rerun.completed.is_empty());
    assert_eq!(rerun.failed.len(), 1);
    assert_eq!(rerun.failed[0].stage, Stage::Clustall);
    assert!(matches!(rerun.failed[0].error, ClusterError::MissingHits { .. }));
    assert_eq!(samples[0], before);
}

#[test]
fn test_unwritable_stats_file_keeps_progress() {
    let (_dir, config) = setup(Datatype::Rad);
    write_sample(&config, "s1");
    fs::create_dir_all(config.stats_file()).unwrap();
    let mut samples = discover_samples(&config).unwrap();

    let report = cluster_within(config.clone(), &mut samples, options(), toolkit()).unwrap();
    assert!(!report.is_success());
    assert!(report.failed.is_empty());
    assert!(matches!(report.stats_error, Some(ClusterError::Io { .. })));
    assert_eq!(report.completed, ["s1"]);
    assert_eq!(samples[0].state, SampleState::DepthClassified);
    assert_eq!(samples[0].stats.depths, [8, 3]);
}
