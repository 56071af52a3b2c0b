// src/cluster/build_clusters.rs

use ahash::AHashSet;

use crate::clustfile::write_cluster_file;
use crate::config::AssemblyConfig;
use crate::error::{ClusterError, Result};
use crate::hits::{read_derep_file, read_hits_file, read_nohits_file, DerepTable, HitStore};
use crate::sample::Sample;
use crate::types::{revcomp, ClusterBlock, ClusterRecord, ClusterTag, DerepRecord, Strand};

/// What happened while rebuilding one sample's clusters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BuildReport {
    /// Clusters built from hit groups.
    pub hit_clusters: usize,
    pub singletons: usize,
    /// Hits discarded for having too many gaps against their seed.
    pub dropped_hits: Vec<String>,
    /// Dropped hits that are not in the no-hit set either, so no cluster
    /// carries them.
    pub lost_reads: Vec<String>,
}

impl BuildReport {
    pub fn total_clusters(&self) -> usize {
        self.hit_clusters + self.singletons
    }
}

/// Largest gap count a hit may have and still join its seed's cluster.
pub fn hit_gap_limit(config: &AssemblyConfig) -> u32 {
    let (first, second) = config.max_indels_locus;
    if config.datatype.is_paired() {
        first + second
    } else {
        first
    }
}

fn lookup<'a>(derep: &'a DerepTable, id: &str, sample: &str) -> Result<&'a DerepRecord> {
    derep.get(id).ok_or_else(|| ClusterError::UnknownRead {
        sample: sample.to_string(),
        read: id.to_string(),
    })
}

/// Rebuild clusters from the search output.
///
/// Hit-derived clusters come first, in the order their seeds first appear
/// in the hit table, followed by singleton clusters for every no-hit seed
/// that never served as a hit seed.
pub fn assemble_clusters(
    derep: &DerepTable,
    store: &HitStore,
    nohits: &[String],
    max_gaps: u32,
    sample: &str,
) -> Result<(Vec<ClusterBlock>, BuildReport)> {
    let mut blocks = Vec::with_capacity(store.num_seeds() + nohits.len());
    let mut report = BuildReport::default();
    let mut emitted: AHashSet<&str> = AHashSet::new();

    for (seed_id, hits) in store.groups() {
        let seed = lookup(derep, seed_id, sample)?;
        let mut block = ClusterBlock::singleton(ClusterRecord::new(
            seed_id,
            seed.size,
            ClusterTag::Seed,
            seed.seq.as_str(),
        ));
        emitted.insert(seed_id);

        for hit in hits {
            let read = lookup(derep, &hit.query, sample)?;
            if hit.gaps > max_gaps {
                log::debug!(
                    "{}: dropping hit {} to {} with {} gaps",
                    sample,
                    hit.query,
                    seed_id,
                    hit.gaps
                );
                report.dropped_hits.push(hit.query.clone());
                continue;
            }
            let seq = match hit.strand {
                Strand::Forward => read.seq.clone(),
                Strand::Reverse => revcomp(&read.seq),
            };
            block.records.push(ClusterRecord::new(
                hit.query.as_str(),
                read.size,
                hit.strand.into(),
                seq,
            ));
            emitted.insert(hit.query.as_str());
        }
        blocks.push(block);
        report.hit_clusters += 1;
    }

    // seeds in the no-hit set minus the seeds that already head a cluster
    let nohit_set: AHashSet<&str> = nohits.iter().map(String::as_str).collect();
    for id in nohits {
        if store.contains_seed(id) || emitted.contains(id.as_str()) {
            continue;
        }
        let read = lookup(derep, id, sample)?;
        blocks.push(ClusterBlock::singleton(ClusterRecord::new(
            id.as_str(),
            read.size,
            ClusterTag::Seed,
            read.seq.as_str(),
        )));
        emitted.insert(id.as_str());
        report.singletons += 1;
    }

    report.lost_reads = report
        .dropped_hits
        .iter()
        .filter(|id| !nohit_set.contains(id.as_str()) && !emitted.contains(id.as_str()))
        .cloned()
        .collect();
    if !report.lost_reads.is_empty() {
        log::warn!(
            "{}: {} gap-filtered reads are in no cluster (possible upstream corruption)",
            sample,
            report.lost_reads.len()
        );
    }

    Ok((blocks, report))
}

/// Combine the dereplicated reads with the search output of `sample` and
/// write its unaligned cluster file.
pub fn build_clusters(config: &AssemblyConfig, sample: &mut Sample) -> Result<BuildReport> {
    let hits_path = sample
        .files
        .hits
        .clone()
        .unwrap_or_else(|| sample.hits_path(config));
    // checked first: a missing hit table is the usual sign of a failed search
    let hits = read_hits_file(&hits_path, &sample.name)?;

    let derep_path = sample
        .files
        .derep
        .clone()
        .unwrap_or_else(|| sample.derep_path(config));
    let derep = read_derep_file(&derep_path)?;

    let nohits_path = sample
        .files
        .nohits
        .clone()
        .unwrap_or_else(|| sample.nohits_path(config));
    let nohits = read_nohits_file(&nohits_path)?;

    let store = HitStore::from_hits(hits);
    let (blocks, report) =
        assemble_clusters(&derep, &store, &nohits, hit_gap_limit(config), &sample.name)?;

    let clusts = sample.clusts_path(config);
    write_cluster_file(&clusts, &blocks, false)?;
    log::info!(
        "{}: {} clusters ({} from hits, {} singletons), {} hits over the gap limit",
        sample.name,
        report.total_clusters(),
        report.hit_clusters,
        report.singletons,
        report.dropped_hits.len()
    );
    sample.files.clusts = Some(clusts);
    Ok(report)
}
