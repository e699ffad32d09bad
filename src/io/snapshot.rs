//! Model snapshots written while a reconstruction grows.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::model::Reconstruction;

/// Serializes a reconstruction into a directory.
pub trait SnapshotWriter: Send {
    fn write(&mut self, reconstruction: &Reconstruction, dir: &Path) -> Result<()>;
}

/// Writes `reconstruction.json` into the target directory.
#[derive(Debug, Clone, Default)]
pub struct JsonSnapshotWriter;

pub const SNAPSHOT_FILE_NAME: &str = "reconstruction.json";

impl SnapshotWriter for JsonSnapshotWriter {
    fn write(&mut self, reconstruction: &Reconstruction, dir: &Path) -> Result<()> {
        let path = dir.join(SNAPSHOT_FILE_NAME);
        let file = File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?;
        serde_json::to_writer(BufWriter::new(file), reconstruction)
            .with_context(|| format!("Failed to serialize snapshot to {}", path.display()))?;
        Ok(())
    }
}

/// Milliseconds since the Unix epoch, formatted as a zero-padded directory
/// name.
pub fn snapshot_dir_name(timestamp_ms: u128) -> String {
    format!("{:010}", timestamp_ms)
}

/// Write a snapshot under `<snapshot_root>/<timestamp_ms>/`.
///
/// Snapshots are a side channel: every failure is logged and swallowed.
/// Returns the directory written to, if any.
pub fn write_snapshot(
    writer: &mut dyn SnapshotWriter,
    reconstruction: &Reconstruction,
    snapshot_root: &Path,
) -> Option<PathBuf> {
    let timestamp_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let dir = snapshot_root.join(snapshot_dir_name(timestamp_ms));

    if let Err(e) = fs::create_dir_all(&dir) {
        warn!("[Snapshot] could not create {}: {}", dir.display(), e);
        return None;
    }

    info!("[Snapshot] writing to {}", dir.display());
    match writer.write(reconstruction, &dir) {
        Ok(()) => Some(dir),
        Err(e) => {
            warn!("[Snapshot] writing {} failed: {:#}", dir.display(), e);
            None
        }
    }
}
