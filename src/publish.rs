//! Snapshot publication.
//!
//! A finished working database is compressed into the destination directory
//! under a name embedding the schema version and the snapshot-updated time,
//! written via a temp file and renamed into place so a partial write is never
//! visible under the final name. The latest-pointer record only ever moves
//! forward: an out-of-order completion cannot clobber a newer result.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::NamedTempFile;

use crate::database::SnapshotInfo;
use crate::error::Result;
use crate::migrate::SCHEMA_VERSION;
use crate::progress::Reporter;

/// Snapshot artifact name: sorts lexically by schema version, then time
pub fn snapshot_filename(schema_version: i64, updated_secs: i64) -> String {
    let when = Utc
        .timestamp_opt(updated_secs, 0)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH);
    format!(
        "raiders-v{}-{}Z.sqlite.gz",
        schema_version,
        when.format("%Y-%m-%dT%H:%M:%S")
    )
}

/// Write `dest` atomically: the writer runs against a temp file in the
/// destination directory, permissions are fixed, and the temp file is renamed
/// into place only after the write completes.
pub fn write_atomic<F>(dest: &Path, mode: u32, write: F) -> Result<()>
where
    F: FnOnce(&mut File) -> Result<()>,
{
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::with_prefix_in(".tmp-", dir)?;
    write(tmp.as_file_mut())?;
    tmp.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(())
}

/// Compress a finished working database into the destination directory.
/// Published artifacts are read-only.
pub fn gzip_to(src: &Path, dest_dir: &Path, dest_name: &str, rep: &Reporter<'_>) -> Result<()> {
    rep.section_message("Compressing database", "to temp file")?;
    write_atomic(&dest_dir.join(dest_name), 0o444, |file| {
        let mut input = File::open(src)?;
        let mut encoder = GzEncoder::new(file, Compression::best());
        io::copy(&mut input, &mut encoder)?;
        encoder.finish()?;
        Ok(())
    })?;
    rep.message(&format!("to {dest_name}"))?;
    Ok(())
}

/// Mutex-protected record of the most recently published snapshot.
///
/// Loaded from disk at startup when present; persisted on every accepted
/// update.
pub struct LatestState {
    inner: Mutex<Option<SnapshotInfo>>,
    file: Option<PathBuf>,
}

impl LatestState {
    /// In-memory only state (tests, or publishing disabled)
    pub fn empty() -> Self {
        LatestState {
            inner: Mutex::new(None),
            file: None,
        }
    }

    /// Load the pointer from `path` if it exists; later updates persist there
    pub fn load(path: PathBuf) -> Result<Self> {
        let current = if path.exists() {
            let info: SnapshotInfo = serde_json::from_reader(File::open(&path)?)?;
            Some(info)
        } else {
            None
        };
        Ok(LatestState {
            inner: Mutex::new(current),
            file: Some(path),
        })
    }

    /// Snapshot of the current pointer
    pub fn current(&self) -> Option<SnapshotInfo> {
        self.inner.lock().unwrap().clone()
    }

    /// Record a newly finished job's snapshot, unless it is older than what
    /// is already published. Returns whether the pointer moved.
    ///
    /// A result loses when its `started` is older, or when `started` ties and
    /// its `updated` does not advance; a slow full rebuild finishing after a
    /// faster partial update must not win.
    pub fn update(&self, info: &SnapshotInfo) -> Result<bool> {
        let mut current = self.inner.lock().unwrap();
        if let Some(cur) = current.as_ref() {
            if info.started < cur.started
                || (info.started == cur.started && info.updated <= cur.updated)
            {
                return Ok(false);
            }
        }
        *current = Some(info.clone());

        if let Some(path) = &self.file {
            write_atomic(path, 0o644, |file| {
                serde_json::to_writer(file, info)?;
                Ok(())
            })?;
        }
        Ok(true)
    }

    /// The pointer as served to clients: empty when nothing is published or
    /// the recorded schema version does not match this code.
    pub fn current_compatible(&self) -> Option<SnapshotInfo> {
        self.current().filter(|info| info.schema_version == SCHEMA_VERSION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{CancelToken, NullProgress};
    use std::io::Read;
    use tempfile::TempDir;

    fn info(started: i64, updated: i64) -> SnapshotInfo {
        SnapshotInfo {
            schema_version: SCHEMA_VERSION,
            started,
            updated,
            path: Some(format!("/db/{}", snapshot_filename(SCHEMA_VERSION, updated))),
        }
    }

    #[test]
    fn snapshot_filename_embeds_version_and_utc_time() {
        assert_eq!(
            snapshot_filename(3, 0),
            "raiders-v3-1970-01-01T00:00:00Z.sqlite.gz"
        );
        assert_eq!(
            snapshot_filename(3, 86_461),
            "raiders-v3-1970-01-02T00:01:01Z.sqlite.gz"
        );
    }

    #[test]
    fn snapshot_names_sort_by_time() {
        let a = snapshot_filename(3, 1_000_000);
        let b = snapshot_filename(3, 2_000_000);
        assert!(a < b);
    }

    #[test]
    fn write_atomic_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out.txt");
        write_atomic(&dest, 0o644, |file| {
            use std::io::Write;
            file.write_all(b"hello")?;
            Ok(())
        })
        .unwrap();

        assert_eq!(fs::read_to_string(&dest).unwrap(), "hello");
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn gzip_to_roundtrips_content() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("db.sqlite");
        fs::write(&src, b"pretend database bytes").unwrap();

        let cancel = CancelToken::new();
        let rep = crate::progress::Reporter::new(&NullProgress, &cancel);
        gzip_to(&src, dir.path(), "out.sqlite.gz", &rep).unwrap();

        let mut decoder = flate2::read::GzDecoder::new(File::open(dir.path().join("out.sqlite.gz")).unwrap());
        let mut content = Vec::new();
        decoder.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"pretend database bytes");
    }

    #[test]
    fn pointer_rejects_older_started_despite_newer_updated() {
        let state = LatestState::empty();
        assert!(state.update(&info(10, 20)).unwrap());
        // (5, 50) < (10, 20) lexicographically by started first
        assert!(!state.update(&info(5, 50)).unwrap());
        assert_eq!(state.current().unwrap(), info(10, 20));
    }

    #[test]
    fn pointer_requires_updated_to_advance_on_tied_started() {
        let state = LatestState::empty();
        assert!(state.update(&info(10, 20)).unwrap());
        assert!(!state.update(&info(10, 20)).unwrap());
        assert!(state.update(&info(10, 21)).unwrap());
        assert_eq!(state.current().unwrap(), info(10, 21));
    }

    #[test]
    fn pointer_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("latest.json");

        let state = LatestState::load(path.clone()).unwrap();
        assert!(state.current().is_none());
        state.update(&info(10, 20)).unwrap();

        let reloaded = LatestState::load(path).unwrap();
        assert_eq!(reloaded.current().unwrap(), info(10, 20));
    }

    #[test]
    fn rejected_update_does_not_persist() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("latest.json");

        let state = LatestState::load(path.clone()).unwrap();
        state.update(&info(10, 20)).unwrap();
        state.update(&info(5, 50)).unwrap();

        let reloaded = LatestState::load(path).unwrap();
        assert_eq!(reloaded.current().unwrap(), info(10, 20));
    }

    #[test]
    fn incompatible_schema_version_reads_as_unpublished() {
        let state = LatestState::empty();
        let mut old = info(10, 20);
        old.schema_version = SCHEMA_VERSION - 1;
        state.update(&old).unwrap();
        assert!(state.current_compatible().is_none());
        assert!(state.current().is_some());
    }
}
