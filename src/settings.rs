//! Settings — the persisted install document holding the authorized number
//! and the bridge's base URL.
//!
//! Stored as `settings.toml` in the config directory. The installer renders
//! the document (typically with the `+1XXXXXXXXXX` placeholder number)
//! before a linking session runs; the session only ever rewrites the number
//! field, by exact-token text substitution so the rest of the rendered
//! document is preserved byte for byte.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Placeholder the installer templates into a fresh settings document.
pub const PLACEHOLDER_NUMBER: &str = "+1XXXXXXXXXX";

/// Pinned bridge image. A fixed tag, not `latest` — upgrades are an explicit
/// settings change.
pub const DEFAULT_IMAGE: &str = "bbernhard/signal-cli-rest-api:0.93";

/// Base URL the linker uses to reach the bridge API from this host.
pub const DEFAULT_API_BASE: &str = "http://127.0.0.1:8080";

/// Global custom config directory (set via --config-dir).
static CUSTOM_CONFIG_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Set a custom config directory (call before any settings operations).
pub fn set_config_dir(path: PathBuf) {
    CUSTOM_CONFIG_DIR.set(path).ok();
}

/// The installer may render only a subset of fields; everything else falls
/// back to its default.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Settings {
    /// Authorized phone number, E.164. Placeholder until a device is linked.
    #[serde(default = "default_number")]
    pub phone_number: String,

    /// Base URL of the bridge's HTTP API.
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Bridge container image reference.
    #[serde(default = "default_image")]
    pub image: String,

    /// Remote/headless install: no local display for scanning.
    #[serde(default)]
    pub remote: bool,

    /// Device name shown in the messaging app's linked-devices list.
    #[serde(default = "default_device_name")]
    pub device_name: String,

    /// Host directory mounted as the credential store. Defaults to
    /// `<config dir>/signal-cli-config` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_dir: Option<PathBuf>,
}

fn default_number() -> String {
    PLACEHOLDER_NUMBER.to_string()
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_image() -> String {
    DEFAULT_IMAGE.to_string()
}

fn default_device_name() -> String {
    "bridgelink".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            phone_number: default_number(),
            api_base: default_api_base(),
            image: default_image(),
            remote: false,
            device_name: default_device_name(),
            volume_dir: None,
        }
    }
}

impl Settings {
    /// Path to `settings.toml` (default config dir).
    pub fn path() -> PathBuf {
        Self::config_dir().join("settings.toml")
    }

    /// Config directory (system default or custom override).
    pub fn config_dir() -> PathBuf {
        let dir = if let Some(custom) = CUSTOM_CONFIG_DIR.get() {
            custom.clone()
        } else {
            directories::ProjectDirs::from("com", "aptove", "bridgelink")
                .expect("Failed to determine config directory")
                .config_dir()
                .to_path_buf()
        };
        fs::create_dir_all(&dir).ok();
        dir
    }

    /// Credential volume directory, created if missing.
    pub fn volume_dir(&self) -> PathBuf {
        self.volume_dir
            .clone()
            .unwrap_or_else(|| Self::config_dir().join("signal-cli-config"))
    }

    /// Load from `settings.toml` at the default location, or return defaults.
    pub fn load() -> Result<Self> {
        Self::load_from_dir(&Self::config_dir())
    }

    /// Load from `settings.toml` in a specific directory, or return defaults.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join("settings.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let text =
            fs::read_to_string(&path).with_context(|| format!("Failed to read {:?}", path))?;
        let settings: Self =
            toml::from_str(&text).with_context(|| format!("Failed to parse {:?}", path))?;
        Ok(settings)
    }

    /// Save to `settings.toml` with 0600 permissions (default config dir).
    pub fn save(&self) -> Result<()> {
        self.save_to_dir(&Self::config_dir())
    }

    /// Save to `settings.toml` in a specific directory with 0600 permissions.
    pub fn save_to_dir(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let path = dir.join("settings.toml");
        let text = toml::to_string_pretty(self).context("Failed to serialize settings")?;
        fs::write(&path, &text).with_context(|| format!("Failed to write {:?}", path))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&path, perms)?;
        }
        Ok(())
    }
}

/// Replace the previously-configured number token in a settings document
/// with `verified`. Tokens are `+` followed by 1..=15 digits or `X`
/// placeholder characters; every occurrence of the old token is rewritten,
/// nothing else in the document is touched.
pub fn substitute_number(document: &str, verified: &str) -> String {
    let mut doc = document.to_string();
    while let Some(token) = number_tokens(&doc).into_iter().find(|t| t != verified) {
        doc = doc.replace(&token, verified);
    }
    doc
}

/// Rewrite the number in the settings document at `path` in place.
pub fn apply_verified_number(path: &Path, verified: &str) -> Result<()> {
    let document =
        fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    let updated = substitute_number(&document, verified);
    if updated != document {
        fs::write(path, updated).with_context(|| format!("Failed to write {:?}", path))?;
    }
    Ok(())
}

/// All phone-number-shaped tokens in `document`, in order of appearance.
fn number_tokens(document: &str) -> Vec<String> {
    let bytes = document.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while let Some(offset) = document[i..].find('+') {
        let start = i + offset;
        let len = bytes[start + 1..]
            .iter()
            .take_while(|b| b.is_ascii_digit() || **b == b'X')
            .count();
        if (1..=15).contains(&len) {
            tokens.push(document[start..start + 1 + len].to_string());
            i = start + 1 + len;
        } else {
            i = start + 1;
        }
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_replaced_exactly_once() {
        let doc = "phone_number = \"+1XXXXXXXXXX\"\napi_base = \"http://127.0.0.1:8080\"\n";
        let out = substitute_number(doc, "+15559876543");
        assert_eq!(out.matches("+15559876543").count(), 1);
        assert_eq!(out.matches(PLACEHOLDER_NUMBER).count(), 0);
    }

    #[test]
    fn previously_configured_number_replaced() {
        let doc = "phone_number = \"+15551234567\"\n";
        let out = substitute_number(doc, "+15559876543");
        assert_eq!(out, "phone_number = \"+15559876543\"\n");
    }

    #[test]
    fn substitution_is_idempotent() {
        let doc = "phone_number = \"+15559876543\"\n";
        assert_eq!(substitute_number(doc, "+15559876543"), doc);
    }

    #[test]
    fn rest_of_document_untouched() {
        let doc = "# rendered by installer\nphone_number = \"+1XXXXXXXXXX\"\nmodel = \"gpt\"\n";
        let out = substitute_number(doc, "+4915112345678");
        assert!(out.starts_with("# rendered by installer\n"));
        assert!(out.ends_with("model = \"gpt\"\n"));
    }

    #[test]
    fn apply_verified_number_rewrites_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "phone_number = \"+1XXXXXXXXXX\"\n").unwrap();

        apply_verified_number(&path, "+15559876543").unwrap();
        let doc = std::fs::read_to_string(&path).unwrap();
        assert_eq!(doc, "phone_number = \"+15559876543\"\n");
    }

    #[test]
    fn settings_round_trip_through_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut settings = Settings::default();
        settings.phone_number = "+15551234567".to_string();
        settings.remote = true;
        settings.save_to_dir(dir.path()).unwrap();

        let loaded = Settings::load_from_dir(dir.path()).unwrap();
        assert_eq!(loaded.phone_number, "+15551234567");
        assert!(loaded.remote);
        assert_eq!(loaded.image, DEFAULT_IMAGE);
    }

    #[test]
    fn missing_settings_file_yields_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let settings = Settings::load_from_dir(dir.path()).unwrap();
        assert_eq!(settings.phone_number, PLACEHOLDER_NUMBER);
        assert_eq!(settings.api_base, DEFAULT_API_BASE);
    }
}
