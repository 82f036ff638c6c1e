//! Per-pair snapshot persistence.
//!
//! One file per pair in a simple length-prefixed binary format:
//! a `u32` entry count, then for each entry a `u16`-prefixed external id
//! and a `u8`-prefixed fingerprint, all big-endian. Snapshots survive
//! restarts so an engine bounce does not replay the whole Sheet.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use sheetgres_core::Snapshot;

pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Load the persisted snapshot for a pair, if one exists. A corrupt
    /// file is treated as absent (the poller cold-starts) after a warning.
    pub fn load(&self, pair_name: &str) -> Option<Snapshot> {
        let path = self.path(pair_name);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read snapshot");
                return None;
            }
        };

        match decode(&bytes) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt snapshot, ignoring");
                None
            }
        }
    }

    /// Persist a pair's snapshot. Writes to a temp file then renames, so a
    /// crash mid-write never leaves a truncated snapshot behind.
    pub fn save(&self, pair_name: &str, snapshot: &Snapshot) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;

        let path = self.path(pair_name);
        let tmp = path.with_extension("snap.tmp");

        let mut file = fs::File::create(&tmp)?;
        file.write_all(&encode(snapshot))?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Reset a pair for a full resync: persist an *empty* snapshot. On the
    /// next poll every Sheet row diffs as a create and is upserted into the
    /// DB. Distinct from a missing file, which means "never initialized"
    /// and cold-starts without emitting events.
    pub fn reset(&self, pair_name: &str) -> io::Result<()> {
        self.save(pair_name, &Snapshot::new())
    }

    /// Remove a pair's persisted snapshot. Returns whether one existed.
    pub fn clear(&self, pair_name: &str) -> io::Result<bool> {
        let path = self.path(pair_name);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(pair = pair_name, "Cleared snapshot");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn path(&self, pair_name: &str) -> PathBuf {
        let safe: String = pair_name
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.snap", safe))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn encode(snapshot: &Snapshot) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(snapshot.len() as u32).to_be_bytes());

    for (external_id, fingerprint) in snapshot.entries() {
        let id = external_id.as_bytes();
        let fp = fingerprint.as_bytes();
        out.extend_from_slice(&(id.len() as u16).to_be_bytes());
        out.extend_from_slice(id);
        out.push(fp.len() as u8);
        out.extend_from_slice(fp);
    }
    out
}

fn decode(bytes: &[u8]) -> io::Result<Snapshot> {
    let mut cursor = io::Cursor::new(bytes);

    let mut count_buf = [0u8; 4];
    cursor.read_exact(&mut count_buf)?;
    let count = u32::from_be_bytes(count_buf);

    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut len_buf = [0u8; 2];
        cursor.read_exact(&mut len_buf)?;
        let mut id = vec![0u8; u16::from_be_bytes(len_buf) as usize];
        cursor.read_exact(&mut id)?;

        let mut fp_len = [0u8; 1];
        cursor.read_exact(&mut fp_len)?;
        let mut fp = vec![0u8; fp_len[0] as usize];
        cursor.read_exact(&mut fp)?;

        let id = String::from_utf8(id)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let fp = String::from_utf8(fp)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        entries.push((id, fp));
    }

    Ok(Snapshot::from_entries(entries))
}
