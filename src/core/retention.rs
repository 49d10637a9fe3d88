use std::fs;
use std::io;
use std::path::Path;
use tracing::{info, warn};

use super::naming::BackupNaming;

/// Delete every backup beyond the newest `max_backups`, oldest first.
///
/// `max_backups == 0` keeps everything. Individual removal failures are
/// logged and skipped; only a failure to list the directory is returned.
pub fn prune(naming: &BackupNaming, dir: &Path, max_backups: usize) -> io::Result<Vec<String>> {
    if max_backups == 0 {
        return Ok(Vec::new());
    }

    let backups = naming.list(dir)?;
    let mut removed = Vec::new();

    for backup in backups.iter().skip(max_backups).rev() {
        let path = dir.join(&backup.name);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(backup = %backup.name, "Pruned old backup");
                removed.push(backup.name.clone());
            }
            Err(e) => {
                warn!(backup = %backup.name, error = %e, "Failed to prune old backup");
            }
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{FileTime, set_file_mtime};
    use tempfile::tempdir;

    fn seed(dir: &Path, names_with_mtime: &[(&str, i64)]) {
        for (name, mtime) in names_with_mtime {
            let path = dir.join(name);
            fs::write(&path, b"archive").unwrap();
            set_file_mtime(&path, FileTime::from_unix_time(*mtime, 0)).unwrap();
        }
    }

    #[test]
    fn keeps_the_newest_by_mtime() {
        let temp = tempdir().unwrap();
        let naming = BackupNaming::new("chaindata", ".tar.gz").unwrap();
        seed(
            temp.path(),
            &[
                ("chaindata-20240101-000000.tar.gz", 10),
                ("chaindata-20240102-000000.tar.gz", 20),
                ("chaindata-20240103-000000.tar.gz", 30),
                ("chaindata-20240104-000000.tar.gz", 40),
            ],
        );

        let removed = prune(&naming, temp.path(), 2).unwrap();

        // Oldest removed first.
        assert_eq!(
            removed,
            vec![
                "chaindata-20240101-000000.tar.gz",
                "chaindata-20240102-000000.tar.gz",
            ]
        );
        let left: Vec<_> = naming
            .list(temp.path())
            .unwrap()
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert_eq!(
            left,
            vec![
                "chaindata-20240104-000000.tar.gz",
                "chaindata-20240103-000000.tar.gz",
            ]
        );
    }

    #[test]
    fn leaves_unrelated_files_alone() {
        let temp = tempdir().unwrap();
        let naming = BackupNaming::new("chaindata", ".tar.gz").unwrap();
        seed(
            temp.path(),
            &[
                ("chaindata-20240101-000000.tar.gz", 10),
                ("chaindata-20240102-000000.tar.gz", 20),
                ("manual-copy.tar.gz", 1),
            ],
        );

        let removed = prune(&naming, temp.path(), 1).unwrap();

        assert_eq!(removed, vec!["chaindata-20240101-000000.tar.gz"]);
        assert!(temp.path().join("manual-copy.tar.gz").exists());
    }

    #[test]
    fn same_second_backups_keep_the_latest_counters() {
        let temp = tempdir().unwrap();
        let naming = BackupNaming::new("chaindata", ".tar.gz").unwrap();
        seed(
            temp.path(),
            &[
                ("chaindata-20240101-000000.tar.gz", 1000),
                ("chaindata-20240101-000000-1.tar.gz", 1000),
                ("chaindata-20240101-000000-2.tar.gz", 1000),
            ],
        );

        let removed = prune(&naming, temp.path(), 2).unwrap();

        assert_eq!(removed, vec!["chaindata-20240101-000000.tar.gz"]);
        assert!(temp.path().join("chaindata-20240101-000000-1.tar.gz").exists());
        assert!(temp.path().join("chaindata-20240101-000000-2.tar.gz").exists());
    }

    #[test]
    fn zero_disables_pruning() {
        let temp = tempdir().unwrap();
        let naming = BackupNaming::new("chaindata", ".tar.gz").unwrap();
        seed(
            temp.path(),
            &[
                ("chaindata-20240101-000000.tar.gz", 10),
                ("chaindata-20240102-000000.tar.gz", 20),
            ],
        );

        assert!(prune(&naming, temp.path(), 0).unwrap().is_empty());
        assert_eq!(naming.list(temp.path()).unwrap().len(), 2);
    }
}
