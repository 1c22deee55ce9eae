//! Accounts secret file.
//!
//! A TOML file of `[[accounts]]` records holding the credential tuples the
//! Login Driver needs. The file is read once at startup and synced into
//! the account store; passwords never land in the store itself.

use std::path::Path;

use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{CoreError, Result};

/// One credential record.
#[derive(Clone, Debug, Deserialize)]
pub struct SecretRecord {
    pub login: String,
    pub password: String,
    /// Answer to the identity provider's secret question, when known
    /// ahead of time.
    pub secret: Option<String>,
    /// Proxy specification string, parsed by [`crate::proxy::ProxyEndpoint`].
    pub proxy: Option<String>,
    /// Key for the external coordinate-CAPTCHA solver.
    pub captcha_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SecretsFile {
    #[serde(default)]
    accounts: Vec<SecretRecord>,
}

/// Load all records from `path`. Records with an empty login are dropped
/// with a warning; a missing file is a configuration error.
pub fn load(path: &Path) -> Result<Vec<SecretRecord>> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        CoreError::Config(format!("cannot read accounts file {}: {}", path.display(), e))
    })?;
    let parsed: SecretsFile = toml::from_str(&text)
        .map_err(|e| CoreError::Config(format!("bad accounts file {}: {}", path.display(), e)))?;

    let mut records = Vec::with_capacity(parsed.accounts.len());
    for record in parsed.accounts {
        if record.login.trim().is_empty() {
            warn!("skipping accounts-file record with empty login");
            continue;
        }
        records.push(record);
    }
    info!("loaded {} account record(s) from {}", records.len(), path.display());
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_records_and_optional_fields() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"
[[accounts]]
login = "anna"
password = "pw1"
secret = "Рязань"
proxy = "user:pw@1.2.3.4:8080"

[[accounts]]
login = "boris"
password = "pw2"
captcha_key = "k123"
"#
        )
        .unwrap();

        let records = load(f.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].secret.as_deref(), Some("Рязань"));
        assert_eq!(records[1].captcha_key.as_deref(), Some("k123"));
        assert!(records[1].proxy.is_none());
    }

    #[test]
    fn empty_login_records_are_dropped() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "[[accounts]]\nlogin = \"  \"\npassword = \"x\"\n").unwrap();
        assert!(load(f.path()).unwrap().is_empty());
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = load(Path::new("/nonexistent/accounts.toml")).unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }
}
