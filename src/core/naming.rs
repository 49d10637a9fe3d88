//! Backup file naming: `<prefix>-<YYYYMMDD-HHMMSS>[-N]<suffix>`.
//!
//! The name is the only structure relied upon for listing and pruning. Files
//! that do not match are ignored here, though `PathGuard` still lets a caller
//! name them explicitly.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use super::models::BackupEntry;

const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

#[derive(Debug, Clone)]
pub struct BackupNaming {
    prefix: String,
    suffix: String,
    pattern: Regex,
}

impl BackupNaming {
    pub fn new(prefix: &str, suffix: &str) -> Result<Self, regex::Error> {
        let pattern = Regex::new(&format!(
            r"^{}-(\d{{8}}-\d{{6}})(?:-(\d+))?{}$",
            regex::escape(prefix),
            regex::escape(suffix)
        ))?;

        Ok(Self {
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
            pattern,
        })
    }

    pub fn matches(&self, name: &str) -> bool {
        self.pattern.is_match(name)
    }

    /// Creation order encoded in a conforming name: the timestamp, then the
    /// collision counter (absent counts as 0).
    pub fn sequence(&self, name: &str) -> Option<(String, u32)> {
        let caps = self.pattern.captures(name)?;
        let stamp = caps.get(1)?.as_str().to_string();
        let counter = caps
            .get(2)
            .and_then(|c| c.as_str().parse().ok())
            .unwrap_or(0);
        Some((stamp, counter))
    }

    /// Name for a backup taken at `at`. A non-zero `counter` disambiguates
    /// backups created within the same second.
    pub fn file_name(&self, at: DateTime<Utc>, counter: u32) -> String {
        let stamp = at.format(TIMESTAMP_FORMAT);
        if counter == 0 {
            format!("{}-{}{}", self.prefix, stamp, self.suffix)
        } else {
            format!("{}-{}-{}{}", self.prefix, stamp, counter, self.suffix)
        }
    }

    /// First unused destination path in `dir` for a backup taken at `at`.
    pub fn next_destination(&self, dir: &Path, at: DateTime<Utc>) -> PathBuf {
        let mut counter = 0;
        loop {
            let candidate = dir.join(self.file_name(at, counter));
            if !candidate.exists() {
                return candidate;
            }
            counter += 1;
        }
    }

    /// Backups in `dir`, newest modification first. A missing directory lists
    /// as empty.
    pub fn list(&self, dir: &Path) -> io::Result<Vec<BackupEntry>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !self.matches(&name) {
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(m) if m.is_file() => m,
                // Vanished between read_dir and stat, or not a regular file.
                _ => continue,
            };

            backups.push(BackupEntry {
                name,
                size: metadata.len(),
                modified_at: DateTime::<Utc>::from(metadata.modified()?),
            });
        }

        // Equal mtimes (coarse timestamps, same-second backups) fall back to
        // the order encoded in the name.
        backups.sort_by(|a, b| {
            b.modified_at
                .cmp(&a.modified_at)
                .then_with(|| self.sequence(&b.name).cmp(&self.sequence(&a.name)))
                .then_with(|| b.name.cmp(&a.name))
        });

        Ok(backups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use filetime::{FileTime, set_file_mtime};
    use tempfile::tempdir;

    fn naming() -> BackupNaming {
        BackupNaming::new("chaindata", ".tar.gz").unwrap()
    }

    #[test]
    fn file_name_follows_convention() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(
            naming().file_name(at, 0),
            "chaindata-20240309-070501.tar.gz"
        );
        assert_eq!(
            naming().file_name(at, 2),
            "chaindata-20240309-070501-2.tar.gz"
        );
    }

    #[test]
    fn matches_only_convention() {
        let naming = naming();
        assert!(naming.matches("chaindata-20240309-070501.tar.gz"));
        assert!(naming.matches("chaindata-20240309-070501-3.tar.gz"));
        assert!(!naming.matches("chaindata-2024.tar.gz"));
        assert!(!naming.matches("other-20240309-070501.tar.gz"));
        assert!(!naming.matches("chaindata-20240309-070501.tar"));
        assert!(!naming.matches("notes.txt"));
    }

    #[test]
    fn next_destination_skips_taken_names() {
        let temp = tempdir().unwrap();
        let naming = naming();
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        std::fs::write(temp.path().join(naming.file_name(at, 0)), b"x").unwrap();
        std::fs::write(temp.path().join(naming.file_name(at, 1)), b"x").unwrap();

        let dest = naming.next_destination(temp.path(), at);
        assert_eq!(dest, temp.path().join(naming.file_name(at, 2)));
    }

    #[test]
    fn list_sorts_newest_first_and_ignores_strangers() {
        let temp = tempdir().unwrap();
        let naming = naming();

        let files = [
            ("chaindata-20240101-000000.tar.gz", 100),
            ("chaindata-20240102-000000.tar.gz", 300),
            ("chaindata-20240103-000000.tar.gz", 200),
        ];
        for (name, mtime) in files {
            let path = temp.path().join(name);
            std::fs::write(&path, name.as_bytes()).unwrap();
            set_file_mtime(&path, FileTime::from_unix_time(mtime, 0)).unwrap();
        }
        std::fs::write(temp.path().join("README.txt"), b"ignore me").unwrap();
        std::fs::create_dir(temp.path().join("chaindata-20240104-000000.tar.gz")).unwrap();

        let listed = naming.list(temp.path()).unwrap();
        let names: Vec<_> = listed.iter().map(|b| b.name.as_str()).collect();

        assert_eq!(
            names,
            vec![
                "chaindata-20240102-000000.tar.gz",
                "chaindata-20240103-000000.tar.gz",
                "chaindata-20240101-000000.tar.gz",
            ]
        );
        assert_eq!(listed[0].size, 32);
    }

    #[test]
    fn sequence_reads_timestamp_and_counter() {
        let naming = naming();
        assert_eq!(
            naming.sequence("chaindata-20240101-000000.tar.gz"),
            Some(("20240101-000000".to_string(), 0))
        );
        assert_eq!(
            naming.sequence("chaindata-20240101-000000-12.tar.gz"),
            Some(("20240101-000000".to_string(), 12))
        );
        assert_eq!(naming.sequence("notes.txt"), None);
    }

    #[test]
    fn equal_mtimes_order_by_counter() {
        let temp = tempdir().unwrap();
        let naming = naming();

        for name in [
            "chaindata-20240101-000000.tar.gz",
            "chaindata-20240101-000000-1.tar.gz",
            "chaindata-20240101-000000-2.tar.gz",
            "chaindata-20231231-235959.tar.gz",
        ] {
            let path = temp.path().join(name);
            std::fs::write(&path, b"x").unwrap();
            set_file_mtime(&path, FileTime::from_unix_time(1000, 0)).unwrap();
        }

        let names: Vec<_> = naming
            .list(temp.path())
            .unwrap()
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert_eq!(
            names,
            vec![
                "chaindata-20240101-000000-2.tar.gz",
                "chaindata-20240101-000000-1.tar.gz",
                "chaindata-20240101-000000.tar.gz",
                "chaindata-20231231-235959.tar.gz",
            ]
        );
    }

    #[test]
    fn list_of_missing_directory_is_empty() {
        let temp = tempdir().unwrap();
        let listed = naming().list(&temp.path().join("absent")).unwrap();
        assert!(listed.is_empty());
    }
}
