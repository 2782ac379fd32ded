//! Candidate log-file enumeration.
//!
//! Walks configured roots collecting files that look like logs, skipping
//! binary login records and systemd journal directories.

use std::fs;
use std::path::{Path, PathBuf};

/// Well-known unsuffixed log basenames.
const LOG_BASENAMES: &[&str] = &[
    "syslog", "messages", "kern.log", "dmesg", "auth.log", "daemon.log", "boot.log", "cron",
    "xorg.log", "yum.log", "pacman.log", "dpkg.log", "audit.log",
];

/// Binary login/accounting records that only look like logs.
const EXCLUDED_PREFIXES: &[&str] = &["lastlog", "wtmp", "btmp", "faillog", "utmp"];

/// Whether a file name is worth tailing: `*.log`, `*.log.*`, a known
/// basename prefix, or a rotated `.gz` archive.
pub fn is_log_like(name: &str) -> bool {
    let lower = name.to_lowercase();
    if lower.ends_with(".log") || lower.contains(".log.") {
        return true;
    }
    LOG_BASENAMES.iter().any(|b| lower.starts_with(b)) || lower.ends_with(".gz")
}

pub fn is_excluded_binary(name: &str) -> bool {
    let lower = name.to_lowercase();
    EXCLUDED_PREFIXES.iter().any(|p| lower.starts_with(p))
}

/// Expand configured roots into concrete candidate files. Explicit file
/// paths are taken as-is; directories are walked recursively with any
/// `journal` path component skipped. Unreadable entries are ignored.
pub fn collect_log_files(roots: &[String]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for root in roots {
        let path = Path::new(root);
        if path.is_file() {
            files.push(path.to_path_buf());
        } else if path.is_dir() {
            walk(path, &mut files);
        }
    }
    files
}

fn walk(dir: &Path, out: &mut Vec<PathBuf>) {
    if dir.file_name().map(|n| n == "journal").unwrap_or(false) {
        return;
    }
    let Ok(entries) = fs::read_dir(dir) else {
        tracing::debug!(dir = %dir.display(), "unreadable directory, skipping");
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk(&path, out);
        } else if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if !is_excluded_binary(name) && is_log_like(name) {
                out.push(path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_log_like_names() {
        assert!(is_log_like("app.log"));
        assert!(is_log_like("app.log.1"));
        assert!(is_log_like("syslog"));
        assert!(is_log_like("syslog.1"));
        assert!(is_log_like("kern.log"));
        assert!(is_log_like("messages"));
        assert!(is_log_like("old.gz"));
        assert!(is_log_like("DMESG"));
        assert!(!is_log_like("data.db"));
        assert!(!is_log_like("notes.txt"));
    }

    #[test]
    fn test_excluded_binaries() {
        assert!(is_excluded_binary("lastlog"));
        assert!(is_excluded_binary("wtmp"));
        assert!(is_excluded_binary("btmp.1"));
        assert!(is_excluded_binary("utmp"));
        assert!(!is_excluded_binary("syslog"));
    }

    #[test]
    fn test_walk_skips_journal_dirs() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("journal/abc")).unwrap();
        fs::create_dir_all(root.join("nested")).unwrap();
        fs::write(root.join("kern.log"), "a").unwrap();
        fs::write(root.join("nested/app.log"), "b").unwrap();
        fs::write(root.join("journal/abc/system.log"), "c").unwrap();
        fs::write(root.join("wtmp"), "d").unwrap();
        fs::write(root.join("readme.txt"), "e").unwrap();

        let mut found = collect_log_files(&[root.to_string_lossy().to_string()]);
        found.sort();
        let names: Vec<String> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["app.log", "kern.log"]);
    }

    #[test]
    fn test_explicit_file_included_verbatim() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("custom.output");
        fs::write(&file, "x").unwrap();
        // Explicit files bypass the name predicate.
        let found = collect_log_files(&[file.to_string_lossy().to_string()]);
        assert_eq!(found, vec![file]);
    }
}
