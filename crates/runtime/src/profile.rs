//! User-data-directory resolution and persistent-profile maintenance.
//!
//! The browser process needs exactly one on-disk profile. Which one is a
//! policy decision with a strict priority order:
//!
//! 1. An explicit directory argument wins unconditionally
//! 2. Ephemeral mode forces a temp directory, discarded at shutdown
//! 3. The user's real profile, when no other running browser holds its lock
//! 4. A persistent private profile, with cookies synchronized from the real
//!    one first when stale
//!
//! The persistent profile's cookie store is refreshed through the tiered
//! copy in [`crate::cookie_sync`]; sync failures are never fatal. After
//! every sync the destination preferences file is patched so the browser
//! comes up believing it exited cleanly and does not offer to restore the
//! previous session, which would break automation determinism.

use crate::cookie_sync::{self, CookieCopyStrategy};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tempfile::TempDir;
use tracing::{debug, warn};

/// How fresh the persistent profile's cookies must be before a sync is
/// skipped.
pub const SYNC_FRESHNESS_WINDOW: Duration = Duration::from_secs(30 * 60);

const METADATA_FILE: &str = "tabmux-sync.json";

/// Which kind of on-disk profile was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileKind {
    /// User-specified directory.
    Explicit,
    /// Ephemeral directory, discarded at shutdown.
    Temp,
    /// The user's live browser profile.
    Real,
    /// The private long-lived fallback profile.
    Persistent,
}

/// The directory the browser will be launched with.
#[derive(Debug)]
pub struct ResolvedProfile {
    /// Resolved user-data directory.
    pub dir: PathBuf,
    /// Where the directory came from.
    pub kind: ProfileKind,
    /// Outcome of the cookie sync, when one was attempted.
    pub sync: Option<SyncReport>,
    /// Keeps an ephemeral directory alive until the profile is dropped.
    _temp: Option<TempDir>,
}

/// Outcome of one cookie synchronization attempt.
#[derive(Debug, Clone)]
pub struct SyncReport {
    /// Winning tier name, or `None` when every tier failed (non-fatal).
    pub tier: Option<&'static str>,
    /// The source cookie store that was copied.
    pub source: PathBuf,
}

/// Sync bookkeeping persisted beside the persistent profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMetadata {
    /// Unix timestamp of the last attempt, in milliseconds.
    pub last_sync_ms: u64,
    /// `mtime_ms:size` fingerprint of the source cookie store.
    pub fingerprint: String,
    /// Number of sync attempts over the profile's lifetime.
    pub sync_count: u64,
    /// The source cookie store the fingerprint describes.
    pub source_path: PathBuf,
}

/// Configuration for profile resolution.
#[derive(Debug, Clone, Default)]
pub struct ProfileConfig {
    /// Explicit user-data directory; wins unconditionally.
    pub explicit_dir: Option<PathBuf>,
    /// Force an ephemeral temp profile.
    pub ephemeral: bool,
    /// Override for the real profile location (used in tests).
    pub real_profile_dir: Option<PathBuf>,
    /// Override for the persistent profile location (used in tests).
    pub persistent_dir: Option<PathBuf>,
}

/// Resolves profiles and keeps the persistent one fresh.
pub struct ProfileManager {
    config: ProfileConfig,
    strategies: Vec<Box<dyn CookieCopyStrategy>>,
}

impl ProfileManager {
    pub fn new(config: ProfileConfig) -> Self {
        Self {
            config,
            strategies: cookie_sync::default_strategies(),
        }
    }

    /// Replace the cookie-copy tiers (used in tests).
    pub fn with_strategies(mut self, strategies: Vec<Box<dyn CookieCopyStrategy>>) -> Self {
        self.strategies = strategies;
        self
    }

    /// Resolve which user-data directory to launch with.
    ///
    /// This call does filesystem work (and possibly a subprocess) and is
    /// intentionally synchronous; async callers run it on a blocking
    /// thread.
    pub fn resolve(&self) -> Result<ResolvedProfile> {
        if let Some(dir) = &self.config.explicit_dir {
            debug!(dir = %dir.display(), "using explicit profile directory");
            return Ok(ResolvedProfile {
                dir: dir.clone(),
                kind: ProfileKind::Explicit,
                sync: None,
                _temp: None,
            });
        }

        if self.config.ephemeral {
            let temp = TempDir::new()?;
            debug!(dir = %temp.path().display(), "using ephemeral profile directory");
            return Ok(ResolvedProfile {
                dir: temp.path().to_path_buf(),
                kind: ProfileKind::Temp,
                sync: None,
                _temp: Some(temp),
            });
        }

        let real_dir = self.real_profile_dir();
        if let Some(real_dir) = &real_dir {
            if real_dir.exists() && !is_profile_locked(real_dir) {
                debug!(dir = %real_dir.display(), "using real profile directly");
                return Ok(ResolvedProfile {
                    dir: real_dir.clone(),
                    kind: ProfileKind::Real,
                    sync: None,
                    _temp: None,
                });
            }
        }

        let persistent = self.persistent_dir()?;
        std::fs::create_dir_all(persistent.join("Default"))?;

        let sync = match &real_dir {
            Some(real_dir) => self.sync_from(real_dir, &persistent),
            None => None,
        };

        Ok(ResolvedProfile {
            dir: persistent,
            kind: ProfileKind::Persistent,
            sync,
            _temp: None,
        })
    }

    fn real_profile_dir(&self) -> Option<PathBuf> {
        if let Some(dir) = &self.config.real_profile_dir {
            return Some(dir.clone());
        }
        default_real_profile_dir()
    }

    fn persistent_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.config.persistent_dir {
            return Ok(dir.clone());
        }
        dirs::data_dir()
            .map(|d| d.join("tabmux").join("profile"))
            .ok_or_else(|| Error::LaunchFailed("no data directory on this platform".to_string()))
    }

    /// Synchronize cookies from the real profile into the persistent one,
    /// when needed. Returns `None` when the source cookie store does not
    /// exist (not an error) or when the current copy is fresh enough.
    fn sync_from(&self, real_dir: &Path, persistent: &Path) -> Option<SyncReport> {
        let source = find_cookie_store(real_dir)?;
        let fingerprint = file_fingerprint(&source)?;

        let metadata_path = persistent.join(METADATA_FILE);
        let previous = load_metadata(&metadata_path);

        if !needs_sync(previous.as_ref(), &fingerprint) {
            debug!("persistent profile cookies are fresh; skipping sync");
            return None;
        }

        seed_local_state(real_dir, persistent);

        let dest = persistent.join("Default").join("Network").join("Cookies");
        if let Some(parent) = dest.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("could not prepare cookie destination: {}", e);
                return None;
            }
        }

        let tier = match cookie_sync::copy_cookie_store(&source, &dest, &self.strategies) {
            Ok(tier) => Some(tier),
            Err(e) => {
                // Non-fatal: the browser launches without fresh cookies.
                warn!("cookie sync failed; continuing without cookies: {}", e);
                None
            }
        };

        if let Err(e) = patch_preferences(persistent) {
            warn!("could not patch preferences: {}", e);
        }

        let metadata = SyncMetadata {
            last_sync_ms: now_ms(),
            fingerprint,
            sync_count: previous.map(|m| m.sync_count).unwrap_or(0) + 1,
            source_path: source.clone(),
        };
        if let Err(e) = store_metadata(&metadata_path, &metadata) {
            warn!("could not persist sync metadata: {}", e);
        }

        Some(SyncReport { tier, source })
    }
}

/// Whether another running browser instance holds the profile.
///
/// Chromium maintains a `SingletonLock` symlink in the profile root while
/// an instance is alive; `symlink_metadata` sees it even when the link
/// target is dangling.
pub fn is_profile_locked(profile_dir: &Path) -> bool {
    std::fs::symlink_metadata(profile_dir.join("SingletonLock")).is_ok()
}

/// Locate the cookie database inside a profile, newest layout first.
pub fn find_cookie_store(profile_dir: &Path) -> Option<PathBuf> {
    let candidates = [
        profile_dir.join("Default").join("Network").join("Cookies"),
        profile_dir.join("Default").join("Cookies"),
    ];
    candidates.into_iter().find(|p| p.exists())
}

/// Content fingerprint of a file: modification time and size, not a full
/// hash. Cheap enough to check on every launch.
pub fn file_fingerprint(path: &Path) -> Option<String> {
    let metadata = std::fs::metadata(path).ok()?;
    let mtime_ms = metadata
        .modified()
        .ok()?
        .duration_since(UNIX_EPOCH)
        .ok()?
        .as_millis();
    Some(format!("{}:{}", mtime_ms, metadata.len()))
}

/// Sync is needed when there is no prior metadata, the source fingerprint
/// changed, or the last sync is older than the freshness window.
pub fn needs_sync(previous: Option<&SyncMetadata>, source_fingerprint: &str) -> bool {
    let Some(previous) = previous else {
        return true;
    };
    if previous.fingerprint != source_fingerprint {
        return true;
    }
    let age_ms = now_ms().saturating_sub(previous.last_sync_ms);
    age_ms > SYNC_FRESHNESS_WINDOW.as_millis() as u64
}

fn load_metadata(path: &Path) -> Option<SyncMetadata> {
    let contents = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

fn store_metadata(path: &Path, metadata: &SyncMetadata) -> Result<()> {
    let contents = serde_json::to_string_pretty(metadata)?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// Copy the top-level `Local State` file verbatim when seeding the
/// persistent profile. Never patched.
fn seed_local_state(real_dir: &Path, persistent: &Path) {
    let source = real_dir.join("Local State");
    let dest = persistent.join("Local State");
    if source.exists() && !dest.exists() {
        if let Err(e) = std::fs::copy(&source, &dest) {
            warn!("could not seed Local State: {}", e);
        }
    }
}

/// Patch the destination profile's preferences after a sync.
///
/// Two fields matter: the crash-recovery flags must read as a clean exit,
/// and session restore must be forced silent, or the browser greets
/// automation with a "restore previous session?" prompt.
pub fn patch_preferences(profile_dir: &Path) -> Result<()> {
    let path = profile_dir.join("Default").join("Preferences");

    let mut preferences: Value = match std::fs::read_to_string(&path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|_| Value::Object(Default::default())),
        Err(_) => Value::Object(Default::default()),
    };

    let root = preferences
        .as_object_mut()
        .ok_or_else(|| Error::ProtocolError("preferences root is not an object".to_string()))?;

    let profile = root
        .entry("profile")
        .or_insert_with(|| Value::Object(Default::default()));
    if let Some(profile) = profile.as_object_mut() {
        profile.insert("exit_type".to_string(), Value::String("Normal".to_string()));
        profile.insert("exited_cleanly".to_string(), Value::Bool(true));
    }

    let session = root
        .entry("session")
        .or_insert_with(|| Value::Object(Default::default()));
    if let Some(session) = session.as_object_mut() {
        // 5 = open the new-tab page; nothing restored, nothing prompted.
        session.insert("restore_on_startup".to_string(), Value::from(5));
        session.insert("startup_urls".to_string(), Value::Array(Vec::new()));
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, serde_json::to_string(&preferences)?)?;
    Ok(())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Platform default for the real browser profile.
fn default_real_profile_dir() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        dirs::home_dir().map(|h| h.join("Library/Application Support/Google/Chrome"))
    }
    #[cfg(target_os = "windows")]
    {
        dirs::data_local_dir().map(|d| d.join("Google").join("Chrome").join("User Data"))
    }
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        dirs::config_dir().map(|c| c.join("google-chrome"))
    }
}
