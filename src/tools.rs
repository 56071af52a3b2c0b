// src/tools.rs
//
// Contracts with the external binaries this step drives.

use ahash::AHashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use crate::config::AssemblyConfig;
use crate::error::{ClusterError, IoContext, Result};
use crate::fastq::count_fastq_reads;
use crate::sample::Sample;
use crate::types::{ClusterBlock, ClusterRecord, ClusterTag};

/// Parameters of the within-sample similarity search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchParams {
    pub both_strands: bool,
    pub query_cov: f32,
    pub threshold: f32,
}

impl SearchParams {
    pub fn for_config(config: &AssemblyConfig, noreverse: bool) -> Self {
        if noreverse && config.datatype.searches_both_strands() {
            log::warn!("not performing reverse complement clustering");
        }
        Self {
            both_strands: config.datatype.searches_both_strands() && !noreverse,
            query_cov: config.datatype.query_coverage(),
            threshold: config.clust_threshold,
        }
    }
}

/// Dereplication, pair merging and similarity search.
pub trait ClusterEngine: Send + Sync {
    /// Collapse identical reads of `input` into `output`, labelled
    /// `id;size=N;` and sorted by decreasing abundance.
    fn dereplicate(&self, input: &Path, output: &Path, both_strands: bool, threads: usize)
        -> Result<()>;

    /// Cluster dereplicated reads, writing the hit table to `hits` and the
    /// unmatched seeds to `nohits`.
    fn cluster(
        &self,
        derep: &Path,
        hits: &Path,
        nohits: &Path,
        params: &SearchParams,
        threads: usize,
    ) -> Result<()>;

    /// Merge overlapping mates into `merged`; the rest go to `notmerged`.
    /// Returns the number of merged pairs.
    fn merge_pairs(
        &self,
        reads: (&Path, &Path),
        merged: &Path,
        notmerged: (&Path, &Path),
        threads: usize,
    ) -> Result<u64>;
}

/// Multiple-sequence alignment of one cluster.
pub trait MsaEngine: Send + Sync {
    /// Align `(name, sequence)` pairs. The output may come back in any order.
    fn align(&self, records: &[(String, String)]) -> Result<Vec<(String, String)>>;
}

/// Reference mapping for the `reference` and `denovo_only` methods.
pub trait ReferenceMapper: Send + Sync {
    /// Map the sample's edits. Records the mapped reads and the reads left
    /// for de novo clustering in `sample.files`; the edits stay as they are.
    fn map_reads(&self, config: &AssemblyConfig, sample: &mut Sample, threads: usize)
        -> Result<()>;

    /// Turn the mapped reads into cluster blocks.
    fn mapped_clusters(&self, config: &AssemblyConfig, sample: &Sample)
        -> Result<Vec<ClusterBlock>>;
}

/// The collaborators used by a run.
pub struct Toolkit {
    pub cluster: Box<dyn ClusterEngine>,
    pub msa: Box<dyn MsaEngine>,
    pub mapper: Option<Box<dyn ReferenceMapper>>,
}

impl Toolkit {
    /// Subprocess-backed tools at the paths named in `config`.
    pub fn from_config(config: &AssemblyConfig) -> Self {
        let mapper: Option<Box<dyn ReferenceMapper>> = config
            .reference_sequence
            .as_ref()
            .filter(|_| config.assembly_method.maps_to_reference())
            .map(|reference| {
                Box::new(BwaMapper {
                    bwa: config.tools.bwa.clone(),
                    samtools: config.tools.samtools.clone(),
                    reference: reference.clone(),
                }) as Box<dyn ReferenceMapper>
            });
        Self {
            cluster: Box::new(Vsearch::new(config.tools.vsearch.clone())),
            msa: Box::new(Muscle::new(config.tools.muscle.clone())),
            mapper,
        }
    }
}

fn describe(cmd: &Command) -> String {
    format!("{:?}", cmd)
}

/// Run `cmd` to completion, failing on a non-zero exit.
fn run_checked(tool: &str, cmd: &mut Command) -> Result<Output> {
    let command = describe(cmd);
    log::debug!("{}", command);
    let output = cmd.output().map_err(|e| ClusterError::ExternalTool {
        tool: tool.to_string(),
        command: command.clone(),
        stderr: e.to_string(),
        stdout: String::new(),
    })?;
    check_status(tool, command, output)
}

fn check_status(tool: &str, command: String, output: Output) -> Result<Output> {
    if !output.status.success() {
        return Err(ClusterError::ExternalTool {
            tool: tool.to_string(),
            command,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        });
    }
    Ok(output)
}

/// vsearch wrapper.
pub struct Vsearch {
    binary_path: PathBuf,
}

impl Vsearch {
    pub fn new(binary_path: PathBuf) -> Self {
        Self { binary_path }
    }
}

impl ClusterEngine for Vsearch {
    fn dereplicate(
        &self,
        input: &Path,
        output: &Path,
        both_strands: bool,
        threads: usize,
    ) -> Result<()> {
        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("--derep_fulllength").arg(input);
        if both_strands {
            cmd.args(["--strand", "both"]);
        }
        cmd.arg("--output")
            .arg(output)
            .arg("--sizeout")
            .arg("--threads")
            .arg(threads.to_string())
            .args(["--fasta_width", "0"]);
        run_checked("vsearch", &mut cmd).map(|_| ())
    }

    fn cluster(
        &self,
        derep: &Path,
        hits: &Path,
        nohits: &Path,
        params: &SearchParams,
        threads: usize,
    ) -> Result<()> {
        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("--cluster_smallmem").arg(derep);
        if params.both_strands {
            cmd.args(["--strand", "both"]);
        } else {
            cmd.arg("--leftjust");
        }
        cmd.arg("--query_cov")
            .arg(format!("{:.2}", params.query_cov))
            .arg("--id")
            .arg(params.threshold.to_string())
            .arg("--userout")
            .arg(hits)
            .args(["--userfields", "query+target+id+gaps+qstrand+qcov"])
            .args(["--maxaccepts", "1", "--maxrejects", "0"])
            .args(["--minsl", "0.5", "--fulldp", "--usersort"])
            .arg("--threads")
            .arg(threads.to_string())
            .arg("--notmatched")
            .arg(nohits)
            .args(["--fasta_width", "0"]);
        run_checked("vsearch", &mut cmd).map(|_| ())
    }

    fn merge_pairs(
        &self,
        reads: (&Path, &Path),
        merged: &Path,
        notmerged: (&Path, &Path),
        threads: usize,
    ) -> Result<u64> {
        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("--fastq_mergepairs")
            .arg(reads.0)
            .arg("--reverse")
            .arg(reads.1)
            .arg("--fastqout")
            .arg(merged)
            .arg("--fastqout_notmerged_fwd")
            .arg(notmerged.0)
            .arg("--fastqout_notmerged_rev")
            .arg(notmerged.1)
            .arg("--threads")
            .arg(threads.to_string());
        run_checked("vsearch", &mut cmd)?;
        count_fastq_reads(merged)
    }
}

/// Parse aligner FASTA output into `(name, sequence)` pairs, joining
/// wrapped sequence lines.
pub fn parse_aligned_fasta(text: &str) -> Vec<(String, String)> {
    let mut records = Vec::new();
    for chunk in text.split('>').skip(1) {
        let mut lines = chunk.lines();
        let name = lines.next().unwrap_or_default().trim().to_string();
        let seq: String = lines.map(str::trim).collect();
        records.push((name, seq));
    }
    records
}

/// MUSCLE wrapper: FASTA on stdin, aligned FASTA on stdout.
pub struct Muscle {
    binary_path: PathBuf,
}

impl Muscle {
    pub fn new(binary_path: PathBuf) -> Self {
        Self { binary_path }
    }
}

impl MsaEngine for Muscle {
    fn align(&self, records: &[(String, String)]) -> Result<Vec<(String, String)>> {
        let mut input = String::new();
        for (name, seq) in records {
            input.push('>');
            input.push_str(name);
            input.push('\n');
            input.push_str(seq);
            input.push('\n');
        }

        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("-quiet")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let command = describe(&cmd);
        let spawn_err = |e: std::io::Error| ClusterError::ExternalTool {
            tool: "muscle".to_string(),
            command: command.clone(),
            stderr: e.to_string(),
            stdout: String::new(),
        };

        let mut child = cmd.spawn().map_err(spawn_err)?;
        let stdin = child.stdin.take();
        // feed stdin from a second thread so a full stdout pipe cannot stall us
        let output = std::thread::scope(|scope| {
            scope.spawn(move || {
                if let Some(mut stdin) = stdin {
                    let _ = stdin.write_all(input.as_bytes());
                }
            });
            child.wait_with_output()
        })
        .map_err(spawn_err)?;

        let output = check_status("muscle", command.clone(), output)?;
        let aligned = parse_aligned_fasta(&String::from_utf8_lossy(&output.stdout));
        if aligned.len() != records.len() {
            return Err(ClusterError::ExternalTool {
                tool: "muscle".to_string(),
                command,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                stdout: format!(
                    "expected {} aligned records, got {}",
                    records.len(),
                    aligned.len()
                ),
            });
        }
        Ok(aligned)
    }
}

const SAM_UNMAPPED: u16 = 0x4;
const SAM_REVERSE: u16 = 0x10;
const SAM_SECOND_MATE: u16 = 0x80;

/// Group mapped reads (SAM text) into clusters by reference start and
/// strand. The first read of a group is its seed; SAM already stores
/// reverse reads in reference orientation.
pub fn group_mapped_reads(sam: &str) -> Vec<ClusterBlock> {
    let mut groups: Vec<ClusterBlock> = Vec::new();
    let mut index: AHashMap<(String, u64, bool), usize> = AHashMap::new();

    for line in sam.lines().filter(|l| !l.starts_with('@') && !l.is_empty()) {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 10 {
            log::warn!("skipping short SAM line: {}", line);
            continue;
        }
        let (Ok(flag), Ok(pos)) = (fields[1].parse::<u16>(), fields[3].parse::<u64>()) else {
            log::warn!("skipping malformed SAM line: {}", line);
            continue;
        };
        if flag & (SAM_UNMAPPED | SAM_SECOND_MATE) != 0 {
            continue;
        }
        let reverse = flag & SAM_REVERSE != 0;
        let key = (fields[2].to_string(), pos, reverse);
        let slot = *index.entry(key).or_insert_with(|| {
            groups.push(ClusterBlock::default());
            groups.len() - 1
        });
        let block = &mut groups[slot];
        let tag = match (block.is_empty(), reverse) {
            (true, _) => ClusterTag::Seed,
            (false, true) => ClusterTag::Reverse,
            (false, false) => ClusterTag::Forward,
        };
        block
            .records
            .push(ClusterRecord::new(fields[0], 1, tag, fields[9]));
    }
    groups
}

/// bwa + samtools reference mapping.
pub struct BwaMapper {
    pub bwa: PathBuf,
    pub samtools: PathBuf,
    pub reference: PathBuf,
}

impl ReferenceMapper for BwaMapper {
    fn map_reads(
        &self,
        config: &AssemblyConfig,
        sample: &mut Sample,
        threads: usize,
    ) -> Result<()> {
        let outdir = config.refmapping_dir();
        fs::create_dir_all(&outdir).with_path(&outdir)?;
        let (r1, r2) = sample
            .files
            .edits
            .first()
            .cloned()
            .ok_or_else(|| ClusterError::Config(format!("{} has no edits", sample.name)))?;

        let sam = outdir.join(format!("{}.sam", sample.name));
        let mut cmd = Command::new(&self.bwa);
        cmd.arg("mem")
            .arg("-t")
            .arg(threads.to_string())
            .arg(&self.reference)
            .arg(&r1);
        if let Some(r2) = &r2 {
            cmd.arg(r2);
        }
        cmd.stdout(File::create(&sam).with_path(&sam)?);
        run_checked("bwa", &mut cmd)?;

        let bam = outdir.join(format!("{}.mapped.bam", sample.name));
        run_checked(
            "samtools",
            Command::new(&self.samtools)
                .args(["view", "-b", "-F", "4", "-o"])
                .arg(&bam)
                .arg(&sam),
        )?;

        let unmapped1 = outdir.join(format!("{}.unmapped_R1.fastq", sample.name));
        let mut fastq = Command::new(&self.samtools);
        fastq.args(["fastq", "-f", "4"]);
        let unmapped2 = if config.datatype.is_paired() {
            let unmapped2 = outdir.join(format!("{}.unmapped_R2.fastq", sample.name));
            fastq.arg("-1").arg(&unmapped1).arg("-2").arg(&unmapped2);
            Some(unmapped2)
        } else {
            fastq.arg("-0").arg(&unmapped1);
            None
        };
        run_checked("samtools", fastq.arg(&sam))?;

        if let Err(e) = fs::remove_file(&sam) {
            log::warn!("could not remove {}: {}", sam.display(), e);
        }
        sample.files.mapped_reads = Some(bam);
        sample.files.unmapped_reads = Some((unmapped1, unmapped2));
        Ok(())
    }

    fn mapped_clusters(
        &self,
        _config: &AssemblyConfig,
        sample: &Sample,
    ) -> Result<Vec<ClusterBlock>> {
        let Some(bam) = &sample.files.mapped_reads else {
            return Ok(Vec::new());
        };
        let output = run_checked(
            "samtools",
            Command::new(&self.samtools)
                .args(["view", "-F", "0x904"])
                .arg(bam),
        )?;
        Ok(group_mapped_reads(&String::from_utf8_lossy(&output.stdout)))
    }
}
