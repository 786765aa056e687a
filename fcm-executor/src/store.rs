//! Resource record store: one JSON file per VM.

use std::path::{Path, PathBuf};

use fcm_core::{VmName, VmRecord};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::ExecutorError;

/// JSON record files under a cache directory.
///
/// Writes go to a hidden temp file that is synced and renamed over the
/// target, so readers see either the previous record or the new one.
#[derive(Debug, Clone)]
pub struct RecordStore {
    dir: PathBuf,
}

impl RecordStore {
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Directory holding the records.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Record file for `name`.
    #[must_use]
    pub fn path(&self, name: &VmName) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    /// Loads the record for `name`, if any.
    ///
    /// # Errors
    /// - [`ExecutorError::State`] if the file exists but cannot be decoded
    /// - [`ExecutorError::Io`] if it cannot be read
    pub async fn load(&self, name: &VmName) -> Result<Option<VmRecord>, ExecutorError> {
        let path = self.path(name);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: VmRecord = serde_json::from_str(&text).map_err(|e| {
            ExecutorError::state(name, format!("record {} is unreadable: {e}", path.display()))
        })?;
        if record.name != *name {
            return Err(ExecutorError::state(
                name,
                format!("record {} describes VM '{}'", path.display(), record.name),
            ));
        }
        Ok(Some(record))
    }

    /// Writes `record`, replacing any previous one.
    ///
    /// # Errors
    /// Returns [`ExecutorError::Io`] or [`ExecutorError::Serde`] on failure;
    /// the previous record is then left untouched.
    pub async fn save(&self, record: &VmRecord) -> Result<(), ExecutorError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let target = self.path(&record.name);
        let tmp = self.dir.join(format!(".{}.json.{}.tmp", record.name, Uuid::new_v4()));
        let json = serde_json::to_vec_pretty(record)?;

        let written = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&json).await?;
            file.sync_all().await?;
            tokio::fs::rename(&tmp, &target).await
        }
        .await;

        if let Err(e) = written {
            if let Err(rm) = tokio::fs::remove_file(&tmp).await {
                if rm.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(tmp = %tmp.display(), error = %rm, "failed to remove temporary record");
                }
            }
            return Err(e.into());
        }
        tracing::debug!(vm = %record.name, path = %target.display(), "record saved");
        Ok(())
    }

    /// Deletes the record for `name`. Returns `false` if there was none.
    ///
    /// # Errors
    /// Returns [`ExecutorError::Io`] if the file cannot be removed.
    pub async fn delete(&self, name: &VmName) -> Result<bool, ExecutorError> {
        match tokio::fs::remove_file(self.path(name)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Names of all record files, sorted. Temp files and files whose stem is
    /// not a valid VM name are skipped.
    ///
    /// # Errors
    /// Returns [`ExecutorError::Io`] if the directory cannot be read.
    pub async fn names(&self) -> Result<Vec<VmName>, ExecutorError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(stem) = file_name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            match VmName::new(stem) {
                Ok(name) => names.push(name),
                Err(_) => tracing::debug!(file = %stem, "skipping non-record file"),
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use fcm_core::examples::example_request;

    fn record(name: &str) -> VmRecord {
        VmRecord::from_request(
            &example_request(name, 0),
            PathBuf::from("/k/vmlinux"),
            PathBuf::from(format!("/r/{name}.ext4")),
            "tap0".to_owned(),
            "tap1".to_owned(),
        )
    }

    fn store() -> (tempfile::TempDir, RecordStore) {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir: {e}"),
        };
        let store = RecordStore::new(dir.path().join("cache"));
        (dir, store)
    }

    #[tokio::test]
    async fn save_load_delete() {
        let (_dir, store) = store();
        let r = record("t1");
        if let Err(e) = store.save(&r).await {
            panic!("save: {e}");
        }
        assert!(matches!(store.load(&r.name).await, Ok(Some(ref loaded)) if *loaded == r));
        assert!(matches!(store.delete(&r.name).await, Ok(true)));
        assert!(matches!(store.load(&r.name).await, Ok(None)));
        assert!(matches!(store.delete(&r.name).await, Ok(false)));
    }

    #[tokio::test]
    async fn save_replaces_and_leaves_no_temp_files() {
        let (_dir, store) = store();
        let mut r = record("t1");
        if let Err(e) = store.save(&r).await {
            panic!("save: {e}");
        }
        r.vm_ip = Ipv4Addr::new(172, 16, 0, 9);
        if let Err(e) = store.save(&r).await {
            panic!("resave: {e}");
        }
        assert!(matches!(store.load(&r.name).await, Ok(Some(ref loaded)) if loaded.vm_ip == r.vm_ip));

        let files: Vec<_> = match std::fs::read_dir(store.dir()) {
            Ok(rd) => rd.filter_map(Result::ok).map(|e| e.file_name()).collect(),
            Err(e) => panic!("read_dir: {e}"),
        };
        assert_eq!(files.len(), 1, "only the record may remain: {files:?}");
    }

    #[tokio::test]
    async fn failed_save_removes_its_temp_file() {
        let (_dir, store) = store();
        let r = record("t1");
        // A non-empty directory in the record's place makes the rename fail.
        let blocker = store.path(&r.name).join("occupied");
        if let Err(e) = std::fs::create_dir_all(&blocker) {
            panic!("mkdir: {e}");
        }

        assert!(store.save(&r).await.is_err(), "rename onto a directory must fail");
        let leftovers: Vec<_> = match std::fs::read_dir(store.dir()) {
            Ok(rd) => rd
                .filter_map(Result::ok)
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|n| n.ends_with(".tmp"))
                .collect(),
            Err(e) => panic!("read_dir: {e}"),
        };
        assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");
    }

    #[tokio::test]
    async fn names_are_sorted_and_filtered() {
        let (_dir, store) = store();
        for n in ["web", "db", "edge"] {
            if let Err(e) = store.save(&record(n)).await {
                panic!("save {n}: {e}");
            }
        }
        if let Err(e) = std::fs::write(store.dir().join("notes.txt"), "x") {
            panic!("write: {e}");
        }
        if let Err(e) = std::fs::write(store.dir().join(".web.json.abc.tmp"), "x") {
            panic!("write: {e}");
        }
        let names = match store.names().await {
            Ok(n) => n,
            Err(e) => panic!("names: {e}"),
        };
        let names: Vec<&str> = names.iter().map(VmName::as_str).collect();
        assert_eq!(names, vec!["db", "edge", "web"]);
    }

    #[tokio::test]
    async fn missing_directory_lists_nothing() {
        let (_dir, store) = store();
        assert!(matches!(store.names().await, Ok(ref n) if n.is_empty()));
    }

    #[tokio::test]
    async fn corrupt_record_is_a_state_error() {
        let (_dir, store) = store();
        if let Err(e) = std::fs::create_dir_all(store.dir()) {
            panic!("mkdir: {e}");
        }
        if let Err(e) = std::fs::write(store.dir().join("t1.json"), "{not json") {
            panic!("write: {e}");
        }
        let name = match VmName::new("t1") {
            Ok(n) => n,
            Err(e) => panic!("name: {e}"),
        };
        assert!(matches!(store.load(&name).await, Err(ExecutorError::State { .. })));
    }
}
