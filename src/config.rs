//! Runtime configuration.
//!
//! Every path and endpoint the core touches lives here, nothing is a
//! source constant. Values come from defaults, then the environment, then
//! an optional TOML file; selector lists are loaded separately so they can
//! be rotated without recompilation when the identity provider's markup
//! changes.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{CoreError, Result};

/// Core configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Root data directory; the store and profiles live under it.
    pub data_dir: PathBuf,
    /// Accounts secret file (TOML, `[[accounts]]` records).
    pub accounts_file: PathBuf,
    /// Optional selector override file.
    pub selectors_file: Option<PathBuf>,
    /// Explicit browser binary; probed from well-known paths when unset.
    pub browser_binary: Option<PathBuf>,
    /// Statistics landing page.
    pub stats_url: String,
    /// Identity provider add-login URL.
    pub passport_url: String,
    /// Coordinate-CAPTCHA solver API base.
    pub solver_base_url: String,
    /// First port of the reserved debugging block.
    pub base_debug_port: u16,
    /// Last port of the reserved debugging block (inclusive).
    pub max_debug_port: u16,
    /// Number of profiles the pool drives. N=1 is a supported degenerate case.
    pub fleet_size: usize,
    /// Gap between browser launches, to avoid fingerprint collisions.
    pub launch_gap: Duration,
    /// Probe in a headless context before committing to a visible launch.
    pub headless_probe: bool,
    pub verbose_logging: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            accounts_file: PathBuf::from("data/accounts.toml"),
            selectors_file: Some(PathBuf::from("config/selectors.toml")),
            browser_binary: None,
            stats_url: "https://wordstat.yandex.ru/".to_string(),
            passport_url: "https://passport.yandex.ru/auth/add".to_string(),
            solver_base_url: "https://rucaptcha.com".to_string(),
            base_debug_port: 9222,
            max_debug_port: 9299,
            fleet_size: 1,
            launch_gap: Duration::from_secs(3),
            headless_probe: true,
            verbose_logging: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            data_dir: std::env::var("WS_DATA_DIR").map(PathBuf::from).unwrap_or(default.data_dir),
            accounts_file: std::env::var("WS_ACCOUNTS_FILE").map(PathBuf::from).unwrap_or(default.accounts_file),
            selectors_file: std::env::var("WS_SELECTORS_FILE").ok().map(PathBuf::from).or(default.selectors_file),
            browser_binary: std::env::var("WS_BROWSER_BINARY").ok().map(PathBuf::from),
            stats_url: std::env::var("WS_STATS_URL").unwrap_or(default.stats_url),
            passport_url: std::env::var("WS_PASSPORT_URL").unwrap_or(default.passport_url),
            solver_base_url: std::env::var("WS_SOLVER_URL").unwrap_or(default.solver_base_url),
            base_debug_port: std::env::var("WS_BASE_DEBUG_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(default.base_debug_port),
            max_debug_port: std::env::var("WS_MAX_DEBUG_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(default.max_debug_port),
            fleet_size: std::env::var("WS_FLEET_SIZE").ok().and_then(|v| v.parse().ok()).unwrap_or(default.fleet_size),
            launch_gap: std::env::var("WS_LAUNCH_GAP_SECS").ok().and_then(|v| v.parse().ok()).map(Duration::from_secs).unwrap_or(default.launch_gap),
            headless_probe: std::env::var("WS_HEADLESS_PROBE").ok().and_then(|v| v.parse().ok()).unwrap_or(default.headless_probe),
            verbose_logging: std::env::var("WS_VERBOSE").ok().and_then(|v| v.parse().ok()).unwrap_or(default.verbose_logging),
        }
    }

    /// Path of the embedded account store.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("keyset.db")
    }

    /// Root directory for per-account browser profiles.
    pub fn profiles_dir(&self) -> PathBuf {
        self.data_dir.join("profiles")
    }
}

/// Ordered selector candidate lists for every field the automation fills.
///
/// The target's markup changes adversarially; keeping these as data means a
/// rotation is a config edit, not a release.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Selectors {
    pub login: Vec<String>,
    pub password: Vec<String>,
    pub answer: Vec<String>,
    pub challenge_question: Vec<String>,
    pub search_input: Vec<String>,
    pub results_table: Vec<String>,
    pub captcha_image: Vec<String>,
    pub captcha_frame_markers: Vec<String>,
}

impl Default for Selectors {
    fn default() -> Self {
        Self {
            login: vec![
                "input[name='login']".into(),
                "input[type='text']".into(),
                "input[placeholder*='огин']".into(),
                "#passp-field-login".into(),
                "input.Textinput-Control".into(),
            ],
            password: vec![
                "input[name='passwd']".into(),
                "input[type='password']".into(),
                "input[placeholder*='ароль']".into(),
                "#passp-field-passwd".into(),
            ],
            answer: vec![
                "input[name='question_answer']".into(),
                "input[type='text']".into(),
                "#passp-field-answer".into(),
            ],
            challenge_question: vec![
                ".Challenge-Question".into(),
                "[data-t='challenge-question']".into(),
                "label".into(),
                "h1".into(),
            ],
            search_input: vec![
                "input[name='text']".into(),
                "input.textinput__control".into(),
                "input[type='text']".into(),
            ],
            results_table: vec![
                "table.table".into(),
                ".b-word-statistics__table".into(),
                "[class*='table']".into(),
            ],
            captcha_image: vec![
                "img.AdvancedCaptcha-Image".into(),
                ".AdvancedCaptcha-View img".into(),
                "img[src*='captcha']".into(),
            ],
            captcha_frame_markers: vec!["captcha".into(), "smartcaptcha".into()],
        }
    }
}

impl Selectors {
    /// Load from `path`, falling back to the built-in lists when the file
    /// is absent.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| CoreError::Config(format!("bad selectors file {}: {}", path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_selector_lists_are_ordered_and_nonempty() {
        let s = Selectors::default();
        assert_eq!(s.login[0], "input[name='login']");
        assert_eq!(s.password[0], "input[name='passwd']");
        assert!(!s.search_input.is_empty());
        assert!(!s.captcha_image.is_empty());
    }

    #[test]
    fn missing_selectors_file_falls_back_to_defaults() {
        let s = Selectors::load(Some(std::path::Path::new("/nonexistent/selectors.toml"))).unwrap();
        assert_eq!(s.login, Selectors::default().login);
    }

    #[test]
    fn port_block_is_sane_by_default() {
        let c = Config::default();
        assert!(c.base_debug_port < c.max_debug_port);
        assert_eq!(c.db_path(), PathBuf::from("data/keyset.db"));
    }
}
