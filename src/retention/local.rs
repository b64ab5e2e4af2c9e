//! Local-filesystem retention backend, walking the tree with `walkdir`
//! rather than hand-rolled recursion.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use crate::error::SinkError;
use crate::retention::{threshold, Item};

/// List every regular file under `root` whose modification time is at or
/// before `today - retention_days`. `retention_days <= 0` short-circuits
/// to an empty list without walking the tree.
pub fn list_expired(root: &Path, retention_days: i64) -> std::io::Result<Vec<Item>> {
    if retention_days <= 0 || !root.exists() {
        return Ok(Vec::new());
    }
    let cutoff = threshold(retention_days);

    let mut items = Vec::new();
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let metadata = entry.metadata()?;
        let modified: DateTime<Utc> = metadata.modified()?.into();
        if modified <= cutoff {
            let path = entry.path().to_path_buf();
            let key = path.display().to_string();
            items.push(Item::new(key, modified, move || {
                fs::remove_file(&path).map_err(SinkError::Io)
            }));
        }
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use std::fs::File;

    fn touch(path: &Path, days_old: i64) {
        File::create(path).unwrap();
        let when = Utc::now() - chrono::Duration::days(days_old);
        let ft = FileTime::from_unix_time(when.timestamp(), 0);
        filetime::set_file_mtime(path, ft).unwrap();
    }

    #[test]
    fn removes_only_files_older_than_the_window() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("old.mp4"), 31);
        touch(&dir.path().join("recent.mp4"), 1);

        let items = list_expired(dir.path(), 30).unwrap();
        assert_eq!(items.len(), 1);
        assert!(items[0].key.ends_with("old.mp4"));

        for item in items {
            item.remove().unwrap();
        }
        assert!(!dir.path().join("old.mp4").exists());
        assert!(dir.path().join("recent.mp4").exists());
    }

    #[test]
    fn zero_or_negative_retention_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("ancient.mp4"), 9000);
        assert!(list_expired(dir.path(), 0).unwrap().is_empty());
        assert!(list_expired(dir.path(), -1).unwrap().is_empty());
    }

    #[test]
    fn missing_root_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        assert!(list_expired(&missing, 30).unwrap().is_empty());
    }
}
