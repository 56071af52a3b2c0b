// src/cluster/mod.rs

pub mod align_chunks;
pub mod build_clusters;
pub mod cluster_stats;

pub use align_chunks::{align_sample, chunk_size, internal_indels, AlignReport, BlockAligner};
pub use build_clusters::{assemble_clusters, build_clusters, BuildReport};
pub use cluster_stats::{classify_depths, cluster_depths, write_stats_file, DepthSummary};
