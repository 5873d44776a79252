//! Per-university site profiles.
//!
//! A profile tells the browser handlers where a university publishes its
//! unit catalogue, how to build the URL of one unit page, and which elements
//! of the catalogue hold unit codes. Profiles are loaded from a JSON array:
//!
//! ```json
//! [
//!   {
//!     "universityId": "U1",
//!     "catalogueUrl": "https://handbook.example.edu/units",
//!     "unitUrlTemplate": "https://handbook.example.edu/units/{code}",
//!     "codeSelector": "td.unit-code"
//!   }
//! ]
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use unitscout_core::AppError;
use url::Url;

const CODE_PLACEHOLDER: &str = "{code}";

fn default_ready_selector() -> String {
    "body".to_string()
}

fn default_page_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteProfile {
    pub university_id: String,
    pub catalogue_url: String,
    /// Unit page URL with a `{code}` placeholder.
    pub unit_url_template: String,
    /// CSS selector matching the catalogue elements whose text is a unit code.
    pub code_selector: String,
    /// Element that must be present before a page counts as rendered.
    #[serde(default = "default_ready_selector")]
    pub ready_selector: String,
    #[serde(default = "default_page_timeout_secs")]
    pub page_timeout_secs: u64,
}

impl SiteProfile {
    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.page_timeout_secs)
    }

    pub fn catalogue_url(&self) -> Result<Url, AppError> {
        Url::parse(&self.catalogue_url).map_err(|e| {
            AppError::ConfigError(format!(
                "Invalid catalogue URL for {}: {e}",
                self.university_id
            ))
        })
    }

    /// URL of one unit's page. The code is percent-encoded.
    pub fn unit_url(&self, unit_code: &str) -> Result<Url, AppError> {
        let encoded: String = url::form_urlencoded::byte_serialize(unit_code.as_bytes()).collect();
        let raw = self.unit_url_template.replace(CODE_PLACEHOLDER, &encoded);
        Url::parse(&raw).map_err(|e| {
            AppError::ConfigError(format!(
                "Invalid unit URL for {}/{unit_code}: {e}",
                self.university_id
            ))
        })
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.university_id.trim().is_empty() {
            return Err(AppError::ConfigError("Site profile without universityId".into()));
        }
        self.catalogue_url()?;
        if !self.unit_url_template.contains(CODE_PLACEHOLDER) {
            return Err(AppError::ConfigError(format!(
                "unitUrlTemplate for {} lacks the {CODE_PLACEHOLDER} placeholder",
                self.university_id
            )));
        }
        self.unit_url("X")?;
        scraper::Selector::parse(&self.code_selector).map_err(|e| {
            AppError::ConfigError(format!(
                "Invalid codeSelector for {}: {e}",
                self.university_id
            ))
        })?;
        if self.page_timeout_secs == 0 {
            return Err(AppError::ConfigError(format!(
                "pageTimeoutSecs for {} must be at least 1",
                self.university_id
            )));
        }
        Ok(())
    }
}

/// Site profiles keyed by university id.
#[derive(Debug, Clone, Default)]
pub struct SiteRegistry {
    profiles: HashMap<String, SiteProfile>,
}

impl SiteRegistry {
    pub fn from_profiles(profiles: Vec<SiteProfile>) -> Result<Self, AppError> {
        let mut map = HashMap::with_capacity(profiles.len());
        for profile in profiles {
            profile.validate()?;
            let id = profile.university_id.clone();
            if map.insert(id.clone(), profile).is_some() {
                return Err(AppError::ConfigError(format!(
                    "Duplicate site profile for {id}"
                )));
            }
        }
        Ok(Self { profiles: map })
    }

    pub fn from_json(json: &str) -> Result<Self, AppError> {
        let profiles: Vec<SiteProfile> = serde_json::from_str(json)?;
        Self::from_profiles(profiles)
    }

    pub fn load(path: &Path) -> Result<Self, AppError> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            AppError::ConfigError(format!("Failed to read {}: {e}", path.display()))
        })?;
        let registry = Self::from_json(&json)?;
        tracing::info!(path = %path.display(), sites = registry.len(), "Loaded site profiles");
        Ok(registry)
    }

    pub fn get(&self, university_id: &str) -> Result<&SiteProfile, AppError> {
        self.profiles.get(university_id).ok_or_else(|| {
            AppError::ConfigError(format!("No site profile for university {university_id}"))
        })
    }

    pub fn university_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.profiles.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
