// src/hits.rs

use ahash::AHashMap;
use std::io::BufRead;
use std::path::Path;

use crate::error::{ClusterError, IoContext, Result};
use crate::fastq::open_reader;
use crate::types::{DerepRecord, HitRecord, Strand};

/// Split a search-engine label `read1;size=10;` into `("read1", Some(10))`.
pub fn split_size_label(label: &str) -> (&str, Option<u32>) {
    let label = label.trim().trim_start_matches('>');
    let label = label.strip_suffix(';').unwrap_or(label);
    match label.rsplit_once(";size=") {
        Some((id, size)) => (id, size.parse().ok()),
        None => (label, None),
    }
}

/// Dereplicated reads keyed by read id, in file (abundance) order.
#[derive(Debug, Default)]
pub struct DerepTable {
    order: Vec<String>,
    records: AHashMap<String, DerepRecord>,
}

impl DerepTable {
    pub fn insert(&mut self, rec: DerepRecord) {
        if !self.records.contains_key(&rec.id) {
            self.order.push(rec.id.clone());
        }
        self.records.insert(rec.id.clone(), rec);
    }

    pub fn get(&self, id: &str) -> Option<&DerepRecord> {
        self.records.get(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DerepRecord> {
        self.order.iter().filter_map(|id| self.records.get(id))
    }
}

impl FromIterator<DerepRecord> for DerepTable {
    fn from_iter<I: IntoIterator<Item = DerepRecord>>(iter: I) -> Self {
        let mut table = DerepTable::default();
        for rec in iter {
            table.insert(rec);
        }
        table
    }
}

/// Read `(label, sequence)` line pairs.
fn read_line_pairs(path: &Path) -> Result<Vec<(usize, String, String)>> {
    let reader = open_reader(path)?;
    let mut pairs = Vec::new();
    let mut lines = reader.lines().enumerate();
    while let Some((idx, label)) = lines.next() {
        let label = label.with_path(path)?;
        if label.trim().is_empty() {
            continue;
        }
        let seq = match lines.next() {
            Some((_, seq)) => seq.with_path(path)?,
            None => return Err(ClusterError::parse(path, idx + 1, "label without sequence")),
        };
        pairs.push((idx + 1, label.trim().to_string(), seq.trim().to_string()));
    }
    Ok(pairs)
}

/// Parse the dereplicated-read file: `>id;size=N;` / sequence pairs.
pub fn read_derep_file<P: AsRef<Path>>(path: P) -> Result<DerepTable> {
    let path = path.as_ref();
    let mut table = DerepTable::default();
    for (line, label, seq) in read_line_pairs(path)? {
        let (id, size) = split_size_label(&label);
        let size = size.ok_or_else(|| {
            ClusterError::parse(path, line, format!("missing ';size=' in '{label}'"))
        })?;
        table.insert(DerepRecord {
            id: id.to_string(),
            size,
            seq,
        });
    }
    Ok(table)
}

/// Parse the no-hit file, returning seed ids in file order.
pub fn read_nohits_file<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    Ok(read_line_pairs(path)?
        .into_iter()
        .map(|(_, label, _)| split_size_label(&label).0.to_string())
        .collect())
}

fn parse_hit_line(path: &Path, line_no: usize, line: &str) -> Result<HitRecord> {
    let fields: Vec<&str> = line.trim_end().split('\t').collect();
    if fields.len() < 6 {
        return Err(ClusterError::parse(
            path,
            line_no,
            format!("expected 6 fields, found {}", fields.len()),
        ));
    }
    let bad = |what: &str| ClusterError::parse(path, line_no, format!("invalid {what}"));

    Ok(HitRecord {
        query: split_size_label(fields[0]).0.to_string(),
        seed: split_size_label(fields[1]).0.to_string(),
        identity: fields[2].trim().parse().map_err(|_| bad("identity"))?,
        gaps: fields[3].trim().parse().map_err(|_| bad("gap count"))?,
        strand: Strand::from_symbol(fields[4].trim()).ok_or_else(|| bad("strand"))?,
        qcov: fields[5].trim().parse().map_err(|_| bad("query coverage"))?,
    })
}

/// Parse the hit file of `sample`. A missing or empty file is fatal for
/// the sample.
pub fn read_hits_file<P: AsRef<Path>>(path: P, sample: &str) -> Result<Vec<HitRecord>> {
    let path = path.as_ref();
    if !path.exists() {
        log::error!("no hit file found for {}", sample);
        return Err(ClusterError::MissingHits {
            sample: sample.to_string(),
            path: path.to_path_buf(),
        });
    }
    let reader = open_reader(path)?;
    let mut hits = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.with_path(path)?;
        if line.trim().is_empty() {
            continue;
        }
        hits.push(parse_hit_line(path, idx + 1, &line)?);
    }
    if hits.is_empty() {
        log::error!("hit file exists but is empty for {}", sample);
        return Err(ClusterError::EmptyHits {
            sample: sample.to_string(),
            path: path.to_path_buf(),
        });
    }
    Ok(hits)
}

/// Hits grouped under their seed. Groups keep the order in which seeds
/// first appear; hits keep arrival order within a group.
#[derive(Debug, Default)]
pub struct HitStore {
    groups: Vec<(String, Vec<HitRecord>)>,
    index: AHashMap<String, usize>,
}

impl HitStore {
    pub fn from_hits(hits: impl IntoIterator<Item = HitRecord>) -> Self {
        let mut store = HitStore::default();
        for hit in hits {
            store.push(hit);
        }
        store
    }

    pub fn push(&mut self, hit: HitRecord) {
        match self.index.get(&hit.seed) {
            Some(&i) => self.groups[i].1.push(hit),
            None => {
                self.index.insert(hit.seed.clone(), self.groups.len());
                self.groups.push((hit.seed.clone(), vec![hit]));
            }
        }
    }

    pub fn contains_seed(&self, seed: &str) -> bool {
        self.index.contains_key(seed)
    }

    pub fn groups(&self) -> impl Iterator<Item = (&str, &[HitRecord])> {
        self.groups.iter().map(|(s, h)| (s.as_str(), h.as_slice()))
    }

    pub fn num_seeds(&self) -> usize {
        self.groups.len()
    }

    pub fn num_hits(&self) -> usize {
        self.groups.iter().map(|(_, h)| h.len()).sum()
    }
}
