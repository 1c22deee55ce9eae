//! Profile Launcher.
//!
//! One browser process per account, pointed at that account's persistent
//! profile directory, with a fixed remote-debugging port from the
//! reserved block. The automated-control flag is suppressed so the target
//! cannot trivially fingerprint the session.
//!
//! Killing stale processes is a destructive primitive; the Session Pool
//! gates when it runs.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chromiumoxide::{Browser, Page};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::browser::connection;
use crate::error::{CoreError, Result};
use crate::proxy::ProxyEndpoint;

/// Everything needed to bring up one session browser.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub login: String,
    pub profile_dir: PathBuf,
    pub port: u16,
    pub proxy: Option<ProxyEndpoint>,
    pub headless: bool,
    pub binary: Option<PathBuf>,
    /// Opened as the initial document once attached.
    pub initial_url: String,
}

/// A running, attached browser. Owns the process, the profile lock and
/// the debugging port until closed.
pub struct SessionBrowser {
    pub browser: Browser,
    pub page: Page,
    pub handler_task: JoinHandle<()>,
    pub port: u16,
    pub profile_dir: PathBuf,
}

impl SessionBrowser {
    /// Close the browser and release the port. Stragglers are reaped by
    /// command-line marker so the profile lock is really gone.
    pub async fn close(mut self) {
        if let Err(e) = self.browser.close().await {
            debug!("browser.close on port {}: {}", self.port, e);
        }
        let _ = self.browser.wait().await;
        self.handler_task.abort();
        kill_stale(self.port, &self.profile_dir);
    }
}

/// Launch a browser for `spec` and attach to it.
pub async fn launch(spec: &LaunchSpec) -> Result<SessionBrowser> {
    std::fs::create_dir_all(&spec.profile_dir).map_err(|e| {
        CoreError::Config(format!(
            "cannot create profile dir {}: {}",
            spec.profile_dir.display(),
            e
        ))
    })?;

    // Reap anything still holding our port or profile from a previous run,
    // then insist the port is actually free.
    kill_stale(spec.port, &spec.profile_dir);
    remove_stale_singleton_lock(&spec.profile_dir);
    if !port_is_free(spec.port) {
        sleep(Duration::from_millis(500)).await;
        kill_stale(spec.port, Path::new(""));
        if !port_is_free(spec.port) {
            return Err(CoreError::PortBusy(spec.port));
        }
    }

    let binary = resolve_binary(spec.binary.as_deref())?;
    let mut args = vec![
        format!("--remote-debugging-port={}", spec.port),
        format!("--user-data-dir={}", spec.profile_dir.display()),
        "--start-maximized".to_string(),
        // Anti-fingerprinting contract: do not advertise automation.
        "--disable-blink-features=AutomationControlled".to_string(),
        "--disable-infobars".to_string(),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
    ];
    if spec.headless {
        args.push("--headless=new".to_string());
        args.push("--disable-gpu".to_string());
    }
    if let Some(proxy) = &spec.proxy {
        args.push(format!("--proxy-server={}", proxy.server()));
    }

    info!(
        "launching browser for {} (port {}, headless={})",
        spec.login, spec.port, spec.headless
    );
    std::process::Command::new(&binary)
        .args(&args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map_err(|e| CoreError::Toolchain(format!("{}: {}", binary.display(), e)))?;

    // Give the process time to open the debugging listener.
    sleep(Duration::from_secs(3)).await;
    let (browser, handler_task) = connection::attach(spec.port, 5).await?;
    let page =
        connection::pick_or_create_page(&browser, &spec.initial_url, &spec.initial_url).await?;

    Ok(SessionBrowser {
        browser,
        page,
        handler_task,
        port: spec.port,
        profile_dir: spec.profile_dir.clone(),
    })
}

/// Kill processes whose command line carries our debugging-port marker
/// (and, when given, our profile marker). Never touches a user's normal
/// browser: those are launched without `--remote-debugging-port`.
pub fn kill_stale(port: u16, profile_dir: &Path) {
    use sysinfo::System;

    let port_marker = format!("--remote-debugging-port={}", port);
    let profile_marker = if profile_dir.as_os_str().is_empty() {
        None
    } else {
        Some(format!("--user-data-dir={}", profile_dir.display()))
    };

    let mut sys = System::new();
    sys.refresh_processes(sysinfo::ProcessesToUpdate::All, true);

    let mut killed = 0u32;
    for (_pid, process) in sys.processes() {
        let cmd_line = process
            .cmd()
            .iter()
            .map(|s| s.to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join(" ");
        if !cmd_line.contains(&port_marker) {
            continue;
        }
        if let Some(marker) = &profile_marker {
            if !cmd_line.contains(marker) {
                continue;
            }
        }
        process.kill();
        killed += 1;
    }
    if killed > 0 {
        info!("killed {} stale browser process(es) on port {}", killed, port);
    }
}

/// Remove a leftover `SingletonLock` if it is old and nothing is using the
/// profile. A live lock is left alone.
fn remove_stale_singleton_lock(profile_dir: &Path) {
    use sysinfo::System;

    let lock_path = profile_dir.join("SingletonLock");
    let Ok(meta) = std::fs::metadata(&lock_path) else {
        return;
    };
    let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    let old_enough = SystemTime::now()
        .duration_since(modified)
        .map(|age| age >= Duration::from_secs(120))
        .unwrap_or(false);
    if !old_enough {
        return;
    }

    let profile_marker = format!("--user-data-dir={}", profile_dir.display());
    let mut sys = System::new();
    sys.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
    for (_pid, process) in sys.processes() {
        let cmd_line = process
            .cmd()
            .iter()
            .map(|s| s.to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join(" ");
        if cmd_line.contains(&profile_marker) {
            return;
        }
    }

    match std::fs::remove_file(&lock_path) {
        Ok(_) => info!("removed stale SingletonLock at {}", lock_path.display()),
        Err(e) => warn!("could not remove {}: {}", lock_path.display(), e),
    }
}

/// A port is free when we can bind it.
pub fn port_is_free(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

fn resolve_binary(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(CoreError::Toolchain(path.display().to_string()));
    }
    const CANDIDATES: &[&str] = &[
        "/usr/bin/google-chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        r"C:\Program Files\Google\Chrome\Application\chrome.exe",
        r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
    ];
    for candidate in CANDIDATES {
        let path = Path::new(candidate);
        if path.exists() {
            return Ok(path.to_path_buf());
        }
    }
    Err(CoreError::Toolchain(
        "no Chrome/Chromium found in well-known locations".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bound_port_is_reported_busy() {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!port_is_free(port));
        drop(listener);
        assert!(port_is_free(port));
    }

    #[test]
    fn configured_missing_binary_is_toolchain_error() {
        let err = resolve_binary(Some(Path::new("/nonexistent/chrome"))).unwrap_err();
        assert!(matches!(err, CoreError::Toolchain(_)));
    }
}
