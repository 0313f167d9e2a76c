//! Service principal storage
//!
//! The three service principal values live in a single keychain entry as
//! JSON so the keychain only prompts once. With the keychain disabled they
//! go to a local owner-only credentials file instead. Environment variables
//! fill in anything neither store provides.

use bootfix_core::Credentials;
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

use crate::config::write_atomic;

const KEYRING_SERVICE: &str = "bootfix-credentials";
const KEYRING_USERNAME: &str = "default";

pub const ENV_CLIENT_ID: &str = "AZURE_CLIENT_ID";
pub const ENV_CLIENT_SECRET: &str = "AZURE_CLIENT_SECRET";
pub const ENV_TENANT_ID: &str = "AZURE_TENANT_ID";

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct StoredCredentials {
    #[serde(skip_serializing_if = "Option::is_none")]
    client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tenant_id: Option<String>,
}

impl std::fmt::Debug for StoredCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .field("tenant_id", &self.tenant_id)
            .finish()
    }
}

type KeyringResult<T> = Result<T, String>;

static KEYRING_ERROR_WARNED: AtomicBool = AtomicBool::new(false);

fn keyring_disabled() -> bool {
    if cfg!(test) {
        return true;
    }
    matches!(
        std::env::var("BOOTFIX_DISABLE_KEYRING")
            .unwrap_or_default()
            .to_lowercase()
            .as_str(),
        "1" | "true" | "yes"
    )
}

/// Human-friendly credential backend label used in CLI messages.
pub fn credentials_store_label() -> &'static str {
    if keyring_disabled() {
        "local credentials file"
    } else {
        "system keychain"
    }
}

fn keyring_entry() -> Result<Entry, keyring::Error> {
    Entry::new(KEYRING_SERVICE, KEYRING_USERNAME)
}

fn fallback_credentials_path() -> KeyringResult<PathBuf> {
    if let Ok(path) = std::env::var("BOOTFIX_CREDENTIALS_FILE") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return Ok(PathBuf::from(trimmed));
        }
    }
    dirs::config_dir()
        .map(|p| p.join("bootfix").join("credentials.json"))
        .ok_or_else(|| "Could not determine credentials file path".to_string())
}

fn read_file(path: &Path) -> KeyringResult<StoredCredentials> {
    if !path.exists() {
        return Ok(StoredCredentials::default());
    }
    let json = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read credentials file '{}': {}", path.display(), e))?;
    serde_json::from_str(&json)
        .map_err(|e| format!("Failed to parse credentials file '{}': {}", path.display(), e))
}

fn write_file(path: &Path, creds: &StoredCredentials) -> KeyringResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            format!(
                "Failed to create credentials directory '{}': {}",
                parent.display(),
                e
            )
        })?;
    }
    let content = serde_json::to_string(creds)
        .map_err(|e| format!("Failed to serialize credentials: {}", e))?;
    write_atomic(path, &content)
        .map_err(|e| format!("Failed to write credentials file '{}': {}", path.display(), e))
}

/// Warn about keychain errors only once per process.
pub fn warn_keychain_error_once(err: &str) {
    if KEYRING_ERROR_WARNED.swap(true, Ordering::Relaxed) {
        return;
    }
    warn!(
        error = %err,
        "Couldn't access system keychain; set BOOTFIX_DISABLE_KEYRING=1 or the AZURE_* variables to bypass it"
    );
}

fn read_stored() -> KeyringResult<StoredCredentials> {
    if keyring_disabled() {
        return read_file(&fallback_credentials_path()?);
    }
    let entry = keyring_entry().map_err(|e| e.to_string())?;
    match entry.get_password() {
        Ok(json) => {
            serde_json::from_str(&json).map_err(|e| format!("Failed to parse credentials: {}", e))
        }
        Err(keyring::Error::NoEntry) => Ok(StoredCredentials::default()),
        Err(err) => Err(err.to_string()),
    }
}

fn write_stored(creds: &StoredCredentials) -> KeyringResult<()> {
    if keyring_disabled() {
        return write_file(&fallback_credentials_path()?, creds);
    }
    let entry = keyring_entry().map_err(|e| e.to_string())?;
    let json = serde_json::to_string(creds)
        .map_err(|e| format!("Failed to serialize credentials: {}", e))?;
    entry.set_password(&json).map_err(|e| e.to_string())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn merge(stored: StoredCredentials, env: impl Fn(&str) -> Option<String>) -> Option<Credentials> {
    let principal = non_empty(stored.client_id).or_else(|| non_empty(env(ENV_CLIENT_ID)))?;
    let secret = non_empty(stored.client_secret).or_else(|| non_empty(env(ENV_CLIENT_SECRET)))?;
    let tenant = non_empty(stored.tenant_id).or_else(|| non_empty(env(ENV_TENANT_ID)))?;
    Some(Credentials::new(principal, secret, tenant))
}

// ============================================================================
// Public API
// ============================================================================

/// Resolve service principal credentials, store first with environment
/// fallback per field. `None` when any of the three values is missing.
pub fn load_credentials() -> Option<Credentials> {
    let stored = match read_stored() {
        Ok(stored) => stored,
        Err(err) => {
            warn_keychain_error_once(&err);
            StoredCredentials::default()
        }
    };
    merge(stored, |key| std::env::var(key).ok())
}

/// Persist credentials and read them back to confirm the write.
pub fn store_credentials(creds: &Credentials) -> Result<(), String> {
    if !creds.is_complete() {
        return Err("Client id, client secret, and tenant id are all required".to_string());
    }
    let stored = StoredCredentials {
        client_id: Some(creds.principal.trim().to_string()),
        client_secret: Some(creds.secret.trim().to_string()),
        tenant_id: Some(creds.tenant.trim().to_string()),
    };
    write_stored(&stored).map_err(|e| {
        format!(
            "Failed to store credentials in {}: {}. \
             You can set {}, {} and {} instead.",
            credentials_store_label(),
            e,
            ENV_CLIENT_ID,
            ENV_CLIENT_SECRET,
            ENV_TENANT_ID
        )
    })?;

    match read_stored() {
        Ok(read_back) if read_back == stored => Ok(()),
        Ok(_) => Err(format!(
            "Credential verification failed: {} returned different values",
            credentials_store_label()
        )),
        Err(err) => Err(format!(
            "Credential verification failed: couldn't read back from {} ({})",
            credentials_store_label(),
            err
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_stored_values_win_over_environment() {
        let stored = StoredCredentials {
            client_id: Some("stored-app".into()),
            client_secret: Some("stored-secret".into()),
            tenant_id: Some("stored-tenant".into()),
        };
        let env = env_of(&[(ENV_CLIENT_ID, "env-app")]);
        let creds = merge(stored, env).unwrap();
        assert_eq!(creds.principal, "stored-app");
        assert_eq!(creds.tenant, "stored-tenant");
    }

    #[test]
    fn test_environment_fills_missing_fields() {
        let stored = StoredCredentials {
            client_id: Some("stored-app".into()),
            ..StoredCredentials::default()
        };
        let env = env_of(&[(ENV_CLIENT_SECRET, "env-secret"), (ENV_TENANT_ID, "env-tenant")]);
        let creds = merge(stored, env).unwrap();
        assert_eq!(creds, Credentials::new("stored-app", "env-secret", "env-tenant"));
    }

    #[test]
    fn test_incomplete_credentials_resolve_to_none() {
        let env = env_of(&[(ENV_CLIENT_ID, "app"), (ENV_CLIENT_SECRET, "  ")]);
        assert!(merge(StoredCredentials::default(), env).is_none());
    }

    #[test]
    fn test_partial_serialization_omits_missing_fields() {
        let creds = StoredCredentials {
            client_id: Some("app".into()),
            ..StoredCredentials::default()
        };
        let json = serde_json::to_string(&creds).unwrap();
        assert_eq!(json, r#"{"client_id":"app"}"#);
    }

    #[test]
    fn test_debug_redacts_secret() {
        let creds = StoredCredentials {
            client_secret: Some("very-secret".into()),
            ..StoredCredentials::default()
        };
        assert!(!format!("{:?}", creds).contains("very-secret"));
    }

    #[test]
    fn test_credentials_store_label_uses_file_backend_in_tests() {
        assert_eq!(credentials_store_label(), "local credentials file");
    }

    #[test]
    fn test_file_backend_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let stored = StoredCredentials {
            client_id: Some("app".into()),
            client_secret: Some("secret".into()),
            tenant_id: Some("tenant".into()),
        };

        write_file(&path, &stored).unwrap();
        assert_eq!(read_file(&path).unwrap(), stored);
        assert_eq!(
            read_file(&dir.path().join("absent.json")).unwrap(),
            StoredCredentials::default()
        );
    }
}
