//! Browser process management.
//!
//! Handles locating the browser executable, launching it against a resolved
//! user-data directory, and discovering the DevTools WebSocket endpoint.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::warn;

/// Launch configuration for the browser process.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Whether to run in headless mode.
    pub headless: bool,
    /// Window width in pixels.
    pub width: u32,
    /// Window height in pixels.
    pub height: u32,
    /// Explicit user-data directory. Wins over every other profile rule.
    pub user_data_dir: Option<PathBuf>,
    /// Explicit browser executable, bypassing discovery.
    pub executable: Option<PathBuf>,
    /// Extra command-line arguments appended verbatim.
    pub extra_args: Vec<String>,
    /// How long to wait for the DevTools endpoint to come up.
    pub startup_timeout: Duration,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            headless: true,
            width: 1280,
            height: 900,
            user_data_dir: None,
            executable: None,
            extra_args: Vec::new(),
            startup_timeout: Duration::from_secs(30),
        }
    }
}

impl LaunchConfig {
    /// Create a new configuration builder.
    pub fn builder() -> LaunchConfigBuilder {
        LaunchConfigBuilder::default()
    }
}

/// Builder for [`LaunchConfig`].
#[derive(Default)]
pub struct LaunchConfigBuilder {
    config: LaunchConfig,
}

impl LaunchConfigBuilder {
    pub fn headless(mut self, headless: bool) -> Self {
        self.config.headless = headless;
        self
    }

    pub fn window_size(mut self, width: u32, height: u32) -> Self {
        self.config.width = width;
        self.config.height = height;
        self
    }

    pub fn user_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.user_data_dir = Some(dir.into());
        self
    }

    pub fn executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.executable = Some(path.into());
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.config.extra_args.push(arg.into());
        self
    }

    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.config.startup_timeout = timeout;
        self
    }

    pub fn build(self) -> LaunchConfig {
        self.config
    }
}

/// Locate the browser executable.
///
/// Search order:
/// 1. `TABMUX_BROWSER` environment variable (runtime override)
/// 2. Well-known executable names on `PATH`
/// 3. Platform-specific install locations
///
/// # Errors
///
/// Returns [`Error::BrowserNotFound`] if no candidate is usable.
pub fn find_browser_executable(config: &LaunchConfig) -> Result<PathBuf> {
    if let Some(explicit) = &config.executable {
        if explicit.exists() {
            return Ok(explicit.clone());
        }
        return Err(Error::LaunchFailed(format!(
            "configured executable does not exist: {}",
            explicit.display()
        )));
    }

    if let Ok(env_path) = std::env::var("TABMUX_BROWSER") {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        warn!(
            path = %path.display(),
            "TABMUX_BROWSER is set but does not exist; falling back"
        );
    }

    const CANDIDATES: &[&str] = &[
        "google-chrome",
        "google-chrome-stable",
        "chromium",
        "chromium-browser",
        "chrome",
    ];

    for name in CANDIDATES {
        if let Ok(path) = which::which(name) {
            return Ok(path);
        }
    }

    #[cfg(target_os = "macos")]
    const LOCATIONS: &[&str] = &[
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
    ];

    #[cfg(target_os = "windows")]
    const LOCATIONS: &[&str] = &[
        "C:\\Program Files\\Google\\Chrome\\Application\\chrome.exe",
        "C:\\Program Files (x86)\\Google\\Chrome\\Application\\chrome.exe",
    ];

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    const LOCATIONS: &[&str] = &[
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/snap/bin/chromium",
    ];

    for location in LOCATIONS {
        let path = PathBuf::from(location);
        if path.exists() {
            return Ok(path);
        }
    }

    Err(Error::BrowserNotFound)
}

/// A running browser process and its control endpoint.
#[derive(Debug)]
pub struct BrowserProcess {
    /// The browser child process.
    pub process: Child,
    /// The DevTools WebSocket URL discovered at startup.
    pub ws_url: String,
    /// The user-data directory the process was launched with.
    pub user_data_dir: PathBuf,
}

impl BrowserProcess {
    /// Launch the browser against `user_data_dir` and wait for its
    /// DevTools endpoint.
    ///
    /// The endpoint is discovered from the `DevToolsActivePort` file the
    /// browser writes into the profile directory: first line is the port,
    /// second line the browser-target path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LaunchFailed`] if the process exits early or the
    /// endpoint does not appear within the configured startup timeout.
    pub async fn launch(
        executable: &Path,
        user_data_dir: &Path,
        config: &LaunchConfig,
    ) -> Result<Self> {
        let port_file = user_data_dir.join("DevToolsActivePort");
        // A leftover file from a previous run would be read as the live
        // endpoint before the new process has written its own.
        if port_file.exists() {
            let _ = std::fs::remove_file(&port_file);
        }

        let mut cmd = Command::new(executable);
        cmd.arg("--remote-debugging-port=0")
            .arg(format!("--user-data-dir={}", user_data_dir.display()))
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg(format!("--window-size={},{}", config.width, config.height))
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        if config.headless {
            cmd.arg("--headless=new").arg("--disable-gpu");
        }

        for arg in &config.extra_args {
            cmd.arg(arg);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::LaunchFailed(format!("failed to spawn process: {e}")))?;

        let ws_url = match wait_for_devtools_endpoint(
            &mut child,
            &port_file,
            config.startup_timeout,
        )
        .await
        {
            Ok(url) => url,
            Err(e) => {
                let _ = child.start_kill();
                return Err(e);
            }
        };

        tracing::debug!(%ws_url, "browser started");

        Ok(Self {
            process: child,
            ws_url,
            user_data_dir: user_data_dir.to_path_buf(),
        })
    }

    /// Shut the browser down, escalating from SIGKILL to a bounded wait.
    pub async fn shutdown(mut self) -> Result<()> {
        #[cfg(windows)]
        {
            drop(self.process.stdin.take());
            drop(self.process.stdout.take());
            drop(self.process.stderr.take());
        }

        self.process
            .kill()
            .await
            .map_err(|e| Error::LaunchFailed(format!("failed to kill process: {e}")))?;

        match tokio::time::timeout(Duration::from_secs(5), self.process.wait()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(Error::LaunchFailed(format!(
                "failed to wait for process: {e}"
            ))),
            Err(_) => Err(Error::LaunchFailed(
                "process shutdown timeout after 5 seconds".to_string(),
            )),
        }
    }

    /// Force kill without waiting for a clean exit.
    pub fn kill(&mut self) {
        if let Err(e) = self.process.start_kill() {
            warn!("failed to kill browser process: {}", e);
        }
    }
}

async fn wait_for_devtools_endpoint(
    child: &mut Child,
    port_file: &Path,
    timeout: Duration,
) -> Result<String> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if let Ok(Some(status)) = child.try_wait() {
            return Err(Error::LaunchFailed(format!(
                "browser process exited during startup with status: {status}"
            )));
        }

        if let Some(ws_url) = read_devtools_active_port(port_file) {
            return Ok(ws_url);
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(Error::LaunchFailed(format!(
                "DevTools endpoint did not appear within {}s",
                timeout.as_secs()
            )));
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Parse a `DevToolsActivePort` file into a WebSocket URL, if complete.
fn read_devtools_active_port(port_file: &Path) -> Option<String> {
    let contents = std::fs::read_to_string(port_file).ok()?;
    let mut lines = contents.lines();
    let port: u16 = lines.next()?.trim().parse().ok()?;
    let path = lines.next()?.trim();
    if path.is_empty() {
        return None;
    }
    Some(format!("ws://127.0.0.1:{port}{path}"))
}
