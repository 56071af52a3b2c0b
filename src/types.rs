//src/types.rs

use std::fmt;

/// Two-line separator written between cluster blocks.
pub const CLUSTER_DELIMITER: &str = "//\n//\n";

/// Marker joining the first and second read of a non-merged pair.
pub const PAIR_SEPARATOR: &str = "ssss";

/// A minimal representation of a FASTQ read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastqRecord {
    pub id: String,
    pub header_line: String,
    pub seq: String,
    pub quals: String,
}

/// A unique read sequence and how many times it was observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerepRecord {
    pub id: String,
    pub size: u32,
    pub seq: String,
}

/// Strand of a hit relative to its seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strand {
    Forward,
    Reverse,
}

impl Strand {
    pub fn from_symbol(s: &str) -> Option<Self> {
        match s {
            "+" => Some(Strand::Forward),
            "-" => Some(Strand::Reverse),
            _ => None,
        }
    }
}

/// One row of similarity-search output:
/// `query  target  id  gaps  qstrand  qcov`
#[derive(Debug, Clone, PartialEq)]
pub struct HitRecord {
    pub query: String,
    pub seed: String,
    pub identity: f32,
    pub gaps: u32,
    pub strand: Strand,
    pub qcov: f32,
}

/// Role of a record inside its cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterTag {
    Seed,
    Forward,
    Reverse,
}

impl ClusterTag {
    pub fn symbol(self) -> char {
        match self {
            ClusterTag::Seed => '*',
            ClusterTag::Forward => '+',
            ClusterTag::Reverse => '-',
        }
    }

    pub fn from_symbol(c: char) -> Option<Self> {
        match c {
            '*' => Some(ClusterTag::Seed),
            '+' => Some(ClusterTag::Forward),
            '-' => Some(ClusterTag::Reverse),
            _ => None,
        }
    }
}

impl From<Strand> for ClusterTag {
    fn from(strand: Strand) -> Self {
        match strand {
            Strand::Forward => ClusterTag::Forward,
            Strand::Reverse => ClusterTag::Reverse,
        }
    }
}

/// A single read inside a cluster block. Reverse hits already carry the
/// reverse-complemented sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterRecord {
    pub id: String,
    pub size: u32,
    pub tag: ClusterTag,
    pub seq: String,
}

impl ClusterRecord {
    pub fn new(id: impl Into<String>, size: u32, tag: ClusterTag, seq: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            size,
            tag,
            seq: seq.into(),
        }
    }

    /// `>{id};size={size};{tag}`
    pub fn header(&self) -> String {
        format!(">{};size={};{}", self.id, self.size, self.tag.symbol())
    }

    /// Parse a header line back into `(id, size, tag)`.
    pub fn parse_header(line: &str) -> Option<(String, u32, ClusterTag)> {
        let body = line.strip_prefix('>')?;
        let tag = ClusterTag::from_symbol(body.chars().last()?)?;
        let body = &body[..body.len() - 1];
        let body = body.strip_suffix(';').unwrap_or(body);
        let (id, size) = body.rsplit_once(";size=")?;
        let size = size.parse().ok()?;
        Some((id.to_string(), size, tag))
    }

    pub fn is_paired(&self) -> bool {
        self.seq.contains(PAIR_SEPARATOR)
    }
}

impl fmt::Display for ClusterRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n{}", self.header(), self.seq)
    }
}

/// A seed followed by its oriented hits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterBlock {
    pub records: Vec<ClusterRecord>,
}

impl ClusterBlock {
    pub fn singleton(seed: ClusterRecord) -> Self {
        Self { records: vec![seed] }
    }

    pub fn seed(&self) -> Option<&ClusterRecord> {
        self.records.first()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Total read abundance of the cluster.
    pub fn depth(&self) -> u64 {
        self.records.iter().map(|r| u64::from(r.size)).sum()
    }
}

impl fmt::Display for ClusterBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rec) in self.records.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{}", rec)?;
        }
        Ok(())
    }
}

fn complement(base: u8) -> u8 {
    match base {
        b'A' => b'T',
        b'T' => b'A',
        b'C' => b'G',
        b'G' => b'C',
        b'a' => b't',
        b't' => b'a',
        b'c' => b'g',
        b'g' => b'c',
        b'R' => b'Y',
        b'Y' => b'R',
        b'K' => b'M',
        b'M' => b'K',
        other => other,
    }
}

/// Reverse complement of a nucleotide string. Non-ACGT symbols other than
/// the two-base IUPAC codes are kept as they are.
pub fn revcomp(seq: &str) -> String {
    let bytes: Vec<u8> = seq.bytes().rev().map(complement).collect();
    // complement() maps ASCII to ASCII and leaves everything else alone
    String::from_utf8(bytes).unwrap_or_default()
}
