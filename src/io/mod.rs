//! I/O boundaries of the mapper: correspondence loading and model snapshots.

pub mod correspondence;
pub mod snapshot;

pub use correspondence::{
    CachedImage, CorrespondenceCache, CorrespondenceSource, CsvCorrespondenceSource, ImagePair,
    LoadRequest, MemoryCorrespondenceSource,
};
pub use snapshot::{write_snapshot, JsonSnapshotWriter, SnapshotWriter};
