use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use flate2::read::MultiGzDecoder;

use crate::error::{IoContext, Result};
use crate::types::{revcomp, FastqRecord, PAIR_SEPARATOR};

/// Open a plain or gzip-compressed (`.gz`) text file.
pub fn open_reader<P: AsRef<Path>>(path: P) -> Result<Box<dyn BufRead>> {
    let path = path.as_ref();
    let f = File::open(path).with_path(path)?;

    let is_gz = path
        .extension()
        .map(|ext| ext == "gz")
        .unwrap_or(false);

    Ok(if is_gz {
        Box::new(BufReader::new(MultiGzDecoder::new(f)))
    } else {
        Box::new(BufReader::new(f))
    })
}

/// Streaming FASTQ reader over any `BufRead`.
pub struct FastqReader<R: BufRead> {
    reader: R,
    line: String,
}

impl<R: BufRead> FastqReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
        }
    }

    fn read_trimmed(&mut self) -> io::Result<Option<String>> {
        self.line.clear();
        if self.reader.read_line(&mut self.line)? == 0 {
            return Ok(None);
        }
        Ok(Some(self.line.trim_end().to_string()))
    }

    /// Next record, or `None` at EOF. A truncated final record ends the stream.
    pub fn next_record(&mut self) -> io::Result<Option<FastqRecord>> {
        // 1) header; skip anything that is not one
        let header_line = loop {
            match self.read_trimmed()? {
                None => return Ok(None),
                Some(h) if h.starts_with('@') => break h,
                Some(_) => continue,
            }
        };
        let header_str = &header_line[1..];

        // 2) sequence, 3) plus line, 4) quality
        let Some(seq) = self.read_trimmed()? else { return Ok(None) };
        if self.read_trimmed()?.is_none() {
            return Ok(None);
        }
        let Some(quals) = self.read_trimmed()? else { return Ok(None) };

        Ok(Some(FastqRecord {
            id: header_str.split(' ').next().unwrap_or_default().to_string(),
            header_line: header_str.to_string(),
            seq,
            quals,
        }))
    }
}

/// Read every record of a FASTQ file, `.gz` supported.
pub fn read_fastq_records<P: AsRef<Path>>(path: P) -> Result<Vec<FastqRecord>> {
    let path = path.as_ref();
    let mut reader = FastqReader::new(open_reader(path)?);
    let mut sequences = Vec::new();
    while let Some(rec) = reader.next_record().with_path(path)? {
        sequences.push(rec);
    }
    Ok(sequences)
}

/// Number of complete FASTQ records in a file.
pub fn count_fastq_reads<P: AsRef<Path>>(path: P) -> Result<u64> {
    let path = path.as_ref();
    let mut reader = FastqReader::new(open_reader(path)?);
    let mut n = 0;
    while reader.next_record().with_path(path)?.is_some() {
        n += 1;
    }
    Ok(n)
}

/// Decompress and concatenate `inputs` into a single plain-text file.
pub fn concat_files<P: AsRef<Path>>(inputs: &[P], out: &Path) -> Result<()> {
    let mut writer = BufWriter::new(File::create(out).with_path(out)?);
    for input in inputs {
        let input = input.as_ref();
        let mut reader = open_reader(input)?;
        io::copy(&mut reader, &mut writer).with_path(input)?;
    }
    writer.flush().with_path(out)
}

/// Join mates that could not be merged into single records,
/// `read1 + ssss + revcomp(read2)`, appended to `out`.
///
/// Returns the number of pairs written.
pub fn join_unmerged_pairs(r1: &Path, r2: &Path, out: &Path) -> Result<u64> {
    let mut first = FastqReader::new(open_reader(r1)?);
    let mut second = FastqReader::new(open_reader(r2)?);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(out)
        .with_path(out)?;
    let mut writer = BufWriter::new(file);

    let mut n = 0;
    loop {
        let a = first.next_record().with_path(r1)?;
        let b = second.next_record().with_path(r2)?;
        let (a, b) = match (a, b) {
            (Some(a), Some(b)) => (a, b),
            (None, None) => break,
            _ => {
                log::warn!(
                    "mate files {} and {} have different lengths; stopping after {} pairs",
                    r1.display(),
                    r2.display(),
                    n
                );
                break;
            }
        };
        let quals2: String = b.quals.chars().rev().collect();
        writeln!(
            writer,
            "@{}\n{}{}{}\n+\n{}{}{}",
            a.header_line,
            a.seq,
            PAIR_SEPARATOR,
            revcomp(&b.seq),
            a.quals,
            PAIR_SEPARATOR,
            quals2
        )
        .with_path(out)?;
        n += 1;
    }
    writer.flush().with_path(out)?;
    Ok(n)
}
