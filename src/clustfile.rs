// src/clustfile.rs

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufWriter, Write};
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{ClusterError, IoContext, Result};
use crate::fastq::open_reader;
use crate::types::{ClusterBlock, ClusterRecord, CLUSTER_DELIMITER};

/// Parse cluster blocks from `reader`. `origin` only labels errors.
///
/// Blocks are `>{id};size={n};{tag}` / sequence line pairs, separated by
/// `//` lines. Empty blocks are skipped.
pub fn parse_cluster_blocks<R: BufRead>(reader: R, origin: &Path) -> Result<Vec<ClusterBlock>> {
    let mut blocks = Vec::new();
    let mut current = ClusterBlock::default();
    let mut lines = reader.lines().enumerate();

    while let Some((idx, line)) = lines.next() {
        let line = line.with_path(origin)?;
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        if line == "//" {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
            continue;
        }
        let (id, size, tag) = ClusterRecord::parse_header(line)
            .ok_or_else(|| ClusterError::parse(origin, idx + 1, format!("bad header '{line}'")))?;
        let seq = match lines.next() {
            Some((_, seq)) => seq.with_path(origin)?.trim_end().to_string(),
            None => {
                return Err(ClusterError::parse(origin, idx + 1, "header without sequence"));
            }
        };
        current.records.push(ClusterRecord { id, size, tag, seq });
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    Ok(blocks)
}

/// Read every block of a (possibly gzipped) cluster file.
pub fn read_cluster_file<P: AsRef<Path>>(path: P) -> Result<Vec<ClusterBlock>> {
    let path = path.as_ref();
    parse_cluster_blocks(open_reader(path)?, path)
}

/// Serialize blocks, each one followed by the delimiter.
pub fn write_blocks<W: Write>(writer: &mut W, blocks: &[ClusterBlock]) -> std::io::Result<()> {
    for block in blocks.iter().filter(|b| !b.is_empty()) {
        write!(writer, "{}\n{}", block, CLUSTER_DELIMITER)?;
    }
    Ok(())
}

/// Write blocks as a gzip member. With `append`, a new member is added to
/// the end of an existing file; multi-member files read back transparently.
pub fn write_cluster_file<P: AsRef<Path>>(
    path: P,
    blocks: &[ClusterBlock],
    append: bool,
) -> Result<()> {
    let path = path.as_ref();
    let file = if append {
        OpenOptions::new().create(true).append(true).open(path)
    } else {
        File::create(path)
    }
    .with_path(path)?;

    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    write_blocks(&mut encoder, blocks).with_path(path)?;
    let mut inner = encoder.finish().with_path(path)?;
    inner.flush().with_path(path)
}
