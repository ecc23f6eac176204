//! Named connection profiles stored under the platform config directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use lectern_core::util::normalize_text_option;
use serde::{Deserialize, Serialize};

use crate::error::CliError;

pub const PROFILE_ENV: &str = "LECTERN_PROFILE";
const DEFAULT_PROFILE: &str = "default";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CliProfilesConfig {
    #[serde(default)]
    pub active_profile: Option<String>,
    #[serde(default)]
    pub profiles: BTreeMap<String, CliProfile>,
}

/// Where a device replicates from, and for whom.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CliProfile {
    #[serde(default)]
    pub supabase_url: Option<String>,
    #[serde(default)]
    pub supabase_anon_key: Option<String>,
    /// Principal whose rows this device mirrors
    #[serde(default)]
    pub user_id: Option<String>,
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lectern")
        .join("cli-config.json")
}

fn profile_name(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(ToString::to_string)
}

impl CliProfilesConfig {
    pub fn load() -> Result<Self, CliError> {
        Self::load_from(&default_config_path())
    }

    /// A missing file is an empty configuration.
    pub fn load_from(path: &Path) -> Result<Self, CliError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let config: Self = serde_json::from_str(&std::fs::read_to_string(path)?)
            .map_err(|error| CliError::Config(format!("{}: {error}", path.display())))?;
        Ok(config.normalized())
    }

    pub fn save(&self) -> Result<PathBuf, CliError> {
        let path = default_config_path();
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), CliError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&self.clone().normalized())?)?;
        Ok(())
    }

    /// Name and contents of the profile in effect.
    ///
    /// Explicit name, then `LECTERN_PROFILE`, then the active profile.
    pub fn select(&self, explicit: Option<&str>) -> (String, CliProfile) {
        let name = profile_name(explicit)
            .or_else(|| profile_name(std::env::var(PROFILE_ENV).ok().as_deref()))
            .or_else(|| profile_name(self.active_profile.as_deref()))
            .unwrap_or_else(|| DEFAULT_PROFILE.to_string());
        let profile = self.profiles.get(&name).cloned().unwrap_or_default();
        (name, profile)
    }

    pub fn set_profile(&mut self, name: &str, profile: CliProfile, activate: bool) {
        self.profiles.insert(name.to_string(), profile.normalized());
        if activate {
            self.active_profile = Some(name.to_string());
        }
    }

    fn normalized(mut self) -> Self {
        self.active_profile = profile_name(self.active_profile.as_deref());
        self.profiles = self
            .profiles
            .into_iter()
            .map(|(name, profile)| (name, profile.normalized()))
            .collect();
        self
    }
}

impl CliProfile {
    pub fn supabase_url(&self) -> Option<String> {
        normalize_text_option(self.supabase_url.clone())
    }

    pub fn supabase_anon_key(&self) -> Option<String> {
        normalize_text_option(self.supabase_anon_key.clone())
    }

    pub fn user_id(&self) -> Option<String> {
        normalize_text_option(self.user_id.clone())
    }

    /// Fields still needed before `lectern sync` can run.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        [
            ("supabase_url", self.supabase_url()),
            ("supabase_anon_key", self.supabase_anon_key()),
            ("user_id", self.user_id()),
        ]
        .into_iter()
        .filter(|(_, value)| value.is_none())
        .map(|(field, _)| field)
        .collect()
    }

    fn normalized(self) -> Self {
        Self {
            supabase_url: self.supabase_url(),
            supabase_anon_key: self.supabase_anon_key(),
            user_id: self.user_id(),
        }
    }
}
