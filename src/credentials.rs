//! Gemini API key lookup.
//!
//! Resolution order:
//! 1. `GEMINI_API_KEY` environment variable (also read from `.env`)
//! 2. `API_KEY` environment variable
//! 3. The OS keyring (libsecret, Keychain or Credential Manager)
//!
//! Never log the key value.

use keyring::Entry;

const SERVICE_NAME: &str = "live-interview";
const API_KEY_NAME: &str = "gemini-api-key";

/// Environment variables checked, in order
pub const ENV_VARS: [&str; 2] = ["GEMINI_API_KEY", "API_KEY"];

/// Where a key was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    Environment(&'static str),
    Keyring,
}

/// An API key plus its origin
#[derive(Clone)]
pub struct ApiKey {
    value: String,
    source: KeySource,
}

impl ApiKey {
    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn source(&self) -> KeySource {
        self.source
    }

    pub fn masked(&self) -> String {
        mask_key(&self.value)
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKey")
            .field("value", &self.masked())
            .field("source", &self.source)
            .finish()
    }
}

/// Find the API key: environment first, keyring second
pub fn resolve_api_key() -> Option<ApiKey> {
    key_from_lookup(|name| std::env::var(name).ok()).or_else(|| {
        get_stored_api_key().map(|value| ApiKey {
            value,
            source: KeySource::Keyring,
        })
    })
}

fn key_from_lookup<F>(lookup: F) -> Option<ApiKey>
where
    F: Fn(&str) -> Option<String>,
{
    ENV_VARS.iter().find_map(|name| {
        lookup(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(|value| ApiKey {
                value,
                source: KeySource::Environment(name),
            })
    })
}

/// Retrieve the stored API key, if any.
/// Returns None if not configured or on error (errors are logged).
pub fn get_stored_api_key() -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, API_KEY_NAME) {
        Ok(e) => e,
        Err(e) => {
            log::warn!("Credentials: failed to create keyring entry: {}", e);
            return None;
        }
    };

    match entry.get_password() {
        Ok(key) if key.is_empty() => None,
        Ok(key) => Some(key),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            log::warn!("Credentials: failed to retrieve key: {}", e);
            None
        }
    }
}

/// Store the API key in the system keyring.
/// Pass None to delete the key.
pub fn set_stored_api_key(key: Option<&str>) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, API_KEY_NAME)
        .map_err(|e| format!("Failed to create keyring entry: {}", e))?;

    match key.map(str::trim) {
        Some(k) if !k.is_empty() => {
            entry
                .set_password(k)
                .map_err(|e| format!("Failed to store API key: {}", e))?;
            log::info!("Credentials: stored API key {}", mask_key(k));
        }
        _ => match entry.delete_credential() {
            Ok(()) => log::info!("Credentials: deleted API key"),
            Err(keyring::Error::NoEntry) => {}
            Err(e) => return Err(format!("Failed to delete API key: {}", e)),
        },
    }

    Ok(())
}

/// Masked version of a key for display (e.g., "AIz...abc123")
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..3].iter().collect();
    let tail: String = chars[chars.len() - 6..].iter().collect();
    format!("{}...{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_gemini_key_takes_precedence() {
        let key = key_from_lookup(lookup(&[("GEMINI_API_KEY", "first"), ("API_KEY", "second")]))
            .unwrap();
        assert_eq!(key.value(), "first");
        assert_eq!(key.source(), KeySource::Environment("GEMINI_API_KEY"));
    }

    #[test]
    fn test_falls_back_to_api_key() {
        let key = key_from_lookup(lookup(&[("GEMINI_API_KEY", "  "), ("API_KEY", "second")]))
            .unwrap();
        assert_eq!(key.value(), "second");
        assert_eq!(key.source(), KeySource::Environment("API_KEY"));
    }

    #[test]
    fn test_no_env_key() {
        assert!(key_from_lookup(lookup(&[])).is_none());
    }

    #[test]
    fn test_mask_key() {
        assert_eq!(mask_key("short"), "*****");
        assert_eq!(mask_key("AIzaSyExample123456"), "AIz...123456");
    }

    #[test]
    fn test_debug_masks_value() {
        let key = ApiKey {
            value: "AIzaSyVerySecretValue".to_string(),
            source: KeySource::Keyring,
        };
        let debug = format!("{:?}", key);
        assert!(!debug.contains("VerySecret"));
    }
}
