//! Tiered cookie-store copying.
//!
//! Copying a live browser cookie database is delicate: the source may be
//! open with write-ahead logging active, and a naive copy of the main file
//! plus its side files can produce a destination that sqlite misreads as
//! containing uncommitted writes. The tiers below are ordered from safest
//! to crudest; the driver tries each in turn and stops at the first
//! success.
//!
//! - `sqlite-backup`: embedded online backup, safe while the source is open
//! - `sqlite3-cli`: the external `sqlite3` binary's `.backup` command
//! - `file-copy`: raw copy of the primary database file only, followed by
//!   deletion of any stale `-wal`/`-shm`/`-journal` companions at the
//!   destination

use crate::error::{Error, Result};
use std::path::Path;
use std::time::Duration;

/// One named way of copying a cookie database.
pub trait CookieCopyStrategy: Send + Sync {
    /// Tier name reported to callers (`sqlite-backup`, `sqlite3-cli`,
    /// `file-copy`).
    fn name(&self) -> &'static str;

    /// Copy `source` to `dest`, replacing any previous destination state.
    fn copy(&self, source: &Path, dest: &Path) -> Result<()>;
}

/// The default tier order.
pub fn default_strategies() -> Vec<Box<dyn CookieCopyStrategy>> {
    vec![
        Box::new(SqliteBackup),
        Box::new(SqliteCli),
        Box::new(FileCopy),
    ]
}

/// Copy a cookie store using the first strategy that succeeds.
///
/// Returns the winning tier's name. If every tier fails the error carries
/// each tier's failure; callers treat this as a non-fatal warning and
/// proceed without fresh cookies.
pub fn copy_cookie_store(
    source: &Path,
    dest: &Path,
    strategies: &[Box<dyn CookieCopyStrategy>],
) -> Result<&'static str> {
    let mut failures = Vec::new();

    for strategy in strategies {
        match strategy.copy(source, dest) {
            Ok(()) => {
                tracing::debug!(tier = strategy.name(), "cookie store copied");
                return Ok(strategy.name());
            }
            Err(e) => {
                tracing::debug!(tier = strategy.name(), "cookie copy tier failed: {}", e);
                failures.push(format!("{}: {}", strategy.name(), e));
            }
        }
    }

    Err(Error::CookieSync(failures.join("; ")))
}

/// Tier 1: embedded online backup via rusqlite.
///
/// Uses sqlite's backup API, which pages the source over while honoring its
/// locks - safe even when the browser has the database open.
pub struct SqliteBackup;

impl CookieCopyStrategy for SqliteBackup {
    fn name(&self) -> &'static str {
        "sqlite-backup"
    }

    fn copy(&self, source: &Path, dest: &Path) -> Result<()> {
        let src = rusqlite::Connection::open_with_flags(
            source,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        )
        .map_err(|e| Error::CookieSync(format!("open source: {e}")))?;

        let mut dst = rusqlite::Connection::open(dest)
            .map_err(|e| Error::CookieSync(format!("open destination: {e}")))?;

        let backup = rusqlite::backup::Backup::new(&src, &mut dst)
            .map_err(|e| Error::CookieSync(format!("init backup: {e}")))?;

        backup
            .run_to_completion(64, Duration::from_millis(50), None)
            .map_err(|e| Error::CookieSync(format!("run backup: {e}")))?;

        Ok(())
    }
}

/// Tier 2: the external `sqlite3` binary's `.backup` command.
///
/// The binary is located via the host's executable search path; its
/// absence simply fails this tier.
pub struct SqliteCli;

impl CookieCopyStrategy for SqliteCli {
    fn name(&self) -> &'static str {
        "sqlite3-cli"
    }

    fn copy(&self, source: &Path, dest: &Path) -> Result<()> {
        let binary = which::which("sqlite3")
            .map_err(|e| Error::CookieSync(format!("sqlite3 binary not found: {e}")))?;

        let output = std::process::Command::new(binary)
            .arg(source)
            .arg(format!(".backup '{}'", dest.display()))
            .output()
            .map_err(|e| Error::CookieSync(format!("spawn sqlite3: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::CookieSync(format!(
                "sqlite3 exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(())
    }
}

/// Tier 3: raw copy of the primary database file.
///
/// The `-wal`/`-shm`/`-journal` side files are deliberately not copied;
/// copying them without a coherent main file risks an inconsistent
/// destination. Any stale companions left at the destination from a
/// previous run are deleted so the copied database is not misread as
/// carrying uncommitted writes.
pub struct FileCopy;

const SIDE_FILE_SUFFIXES: &[&str] = &["-wal", "-shm", "-journal"];

impl CookieCopyStrategy for FileCopy {
    fn name(&self) -> &'static str {
        "file-copy"
    }

    fn copy(&self, source: &Path, dest: &Path) -> Result<()> {
        std::fs::copy(source, dest)
            .map_err(|e| Error::CookieSync(format!("copy database file: {e}")))?;

        for suffix in SIDE_FILE_SUFFIXES {
            let companion = companion_path(dest, suffix);
            if companion.exists() {
                std::fs::remove_file(&companion)
                    .map_err(|e| Error::CookieSync(format!("remove stale companion: {e}")))?;
            }
        }

        Ok(())
    }
}

fn companion_path(dest: &Path, suffix: &str) -> std::path::PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(suffix);
    std::path::PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn make_cookie_db(path: &Path) {
        let conn = rusqlite::Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE cookies (host_key TEXT, name TEXT, value TEXT);
             INSERT INTO cookies VALUES ('example.com', 'sid', 'abc123');",
        )
        .unwrap();
    }

    fn cookie_count(path: &Path) -> i64 {
        let conn = rusqlite::Connection::open(path).unwrap();
        conn.query_row("SELECT COUNT(*) FROM cookies", [], |row| row.get(0))
            .unwrap()
    }

    struct AlwaysFails(&'static str);

    impl CookieCopyStrategy for AlwaysFails {
        fn name(&self) -> &'static str {
            self.0
        }

        fn copy(&self, _source: &Path, _dest: &Path) -> Result<()> {
            Err(Error::CookieSync("induced failure".to_string()))
        }
    }

    #[test]
    fn sqlite_backup_copies_rows() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("Cookies");
        let dest = dir.path().join("Cookies.out");
        make_cookie_db(&source);

        SqliteBackup.copy(&source, &dest).unwrap();
        assert_eq!(cookie_count(&dest), 1);
    }

    #[test]
    fn file_copy_removes_stale_companions() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("Cookies");
        let dest = dir.path().join("dest").join("Cookies");
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        make_cookie_db(&source);

        // Stale side files from a previous run.
        for suffix in SIDE_FILE_SUFFIXES {
            std::fs::write(companion_path(&dest, suffix), b"stale").unwrap();
        }

        FileCopy.copy(&source, &dest).unwrap();

        assert_eq!(cookie_count(&dest), 1);
        for suffix in SIDE_FILE_SUFFIXES {
            assert!(
                !companion_path(&dest, suffix).exists(),
                "{suffix} should be deleted"
            );
        }
    }

    #[test]
    fn driver_falls_through_to_first_success() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("Cookies");
        let dest = dir.path().join("Cookies.out");
        make_cookie_db(&source);

        let strategies: Vec<Box<dyn CookieCopyStrategy>> = vec![
            Box::new(AlwaysFails("sqlite-backup")),
            Box::new(AlwaysFails("sqlite3-cli")),
            Box::new(FileCopy),
        ];

        let tier = copy_cookie_store(&source, &dest, &strategies).unwrap();
        assert_eq!(tier, "file-copy");
        assert_eq!(cookie_count(&dest), 1);
    }

    #[test]
    fn driver_reports_every_tier_on_exhaustion() {
        let strategies: Vec<Box<dyn CookieCopyStrategy>> = vec![
            Box::new(AlwaysFails("sqlite-backup")),
            Box::new(AlwaysFails("sqlite3-cli")),
            Box::new(AlwaysFails("file-copy")),
        ];

        let err = copy_cookie_store(
            &PathBuf::from("/nonexistent/src"),
            &PathBuf::from("/nonexistent/dst"),
            &strategies,
        )
        .unwrap_err();

        let text = err.to_string();
        assert!(text.contains("sqlite-backup"));
        assert!(text.contains("sqlite3-cli"));
        assert!(text.contains("file-copy"));
    }

    #[test]
    fn driver_stops_at_first_success() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("Cookies");
        let dest = dir.path().join("Cookies.out");
        make_cookie_db(&source);

        let strategies: Vec<Box<dyn CookieCopyStrategy>> =
            vec![Box::new(SqliteBackup), Box::new(AlwaysFails("file-copy"))];

        let tier = copy_cookie_store(&source, &dest, &strategies).unwrap();
        assert_eq!(tier, "sqlite-backup");
    }
}
