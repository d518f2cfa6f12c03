//! Harness configuration and scenario fixtures
//!
//! Loading order:
//! 1. built-in defaults
//! 2. optional TOML file
//! 3. environment overrides named `CCAAS_{SECTION}_{FIELD}`
//!
//! Fixtures (agent credentials, skill numbers, phone numbers) come only from
//! the environment, as `CCAAS_FIXTURE_{KEY}` variables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::error::{Error, Result};
use crate::retry::PollBounds;

/// Prefix for fixture variables
pub const FIXTURE_PREFIX: &str = "CCAAS_FIXTURE_";

/// Profile names every configuration carries
pub const PROFILE_DEFAULT: &str = "default";
pub const PROFILE_REPORT_RUN_COUNT: &str = "report_run_count";
pub const PROFILE_CRADLE_TO_GRAVE: &str = "cradle_to_grave";
pub const PROFILE_WALLBOARD: &str = "wallboard";
pub const PROFILE_INBOX: &str = "inbox";
pub const PROFILE_REACHABILITY: &str = "reachability";

/// Top-level harness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub general: GeneralConfig,
    pub browser: BrowserConfig,
    pub login: LoginConfig,
    /// Named poll profiles
    pub polling: BTreeMap<String, PollProfile>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            browser: BrowserConfig::default(),
            login: LoginConfig::default(),
            polling: default_profiles(),
        }
    }
}

impl HarnessConfig {
    /// Load defaults, then the file (if any), then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::parse("")?,
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::InvalidConfig(format!("config file not found: {}", path.display()))
            } else {
                Error::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// Parse TOML. Built-in poll profiles the file does not mention are kept.
    pub fn parse(toml_str: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(toml_str)?;
        for (name, profile) in default_profiles() {
            config.polling.entry(name).or_insert(profile);
        }
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        override_string(&mut self.general.base_url, "CCAAS_GENERAL_BASE_URL");
        override_string(&mut self.general.helper_api_url, "CCAAS_GENERAL_HELPER_API_URL");
        override_string(&mut self.general.output_dir, "CCAAS_GENERAL_OUTPUT_DIR");

        override_string(&mut self.browser.kind, "CCAAS_BROWSER_KIND");
        override_bool(&mut self.browser.headless, "CCAAS_BROWSER_HEADLESS");
        override_u64(&mut self.browser.action_timeout_ms, "CCAAS_BROWSER_ACTION_TIMEOUT_MS");
        override_string(&mut self.browser.node_binary, "CCAAS_BROWSER_NODE_BINARY");

        override_string(&mut self.login.path, "CCAAS_LOGIN_PATH");
        override_string(&mut self.login.landing_selector, "CCAAS_LOGIN_LANDING_SELECTOR");

        for (name, profile) in self.polling.iter_mut() {
            let key = format!("CCAAS_POLL_{}", name.to_uppercase());
            override_opt_u32(&mut profile.max_attempts, &format!("{}_MAX_ATTEMPTS", key));
            override_opt_u64(&mut profile.timeout_ms, &format!("{}_TIMEOUT_MS", key));
            override_u64(&mut profile.interval_ms, &format!("{}_INTERVAL_MS", key));
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.general.base_url.starts_with("http://") && !self.general.base_url.starts_with("https://") {
            return Err(Error::InvalidConfig(format!(
                "general.base_url must be an http(s) URL, got {:?}",
                self.general.base_url
            )));
        }
        if self.browser.action_timeout_ms == 0 {
            return Err(Error::InvalidConfig("browser.action_timeout_ms must be > 0".to_string()));
        }
        for (name, profile) in &self.polling {
            profile.to_bounds().map_err(|e| {
                Error::InvalidConfig(format!("polling.{}: {}", name, e))
            })?;
        }
        Ok(())
    }

    /// Look up a poll profile by name
    pub fn profile(&self, name: &str) -> Result<&PollProfile> {
        self.polling
            .get(name)
            .ok_or_else(|| Error::UnknownProfile(name.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Product under test
    pub base_url: String,
    /// Test-harness service that simulates calls, SMS and email
    pub helper_api_url: String,
    pub output_dir: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            helper_api_url: "http://127.0.0.1:8090".to_string(),
            output_dir: "test-results".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// chromium, firefox or webkit
    pub kind: String,
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub action_timeout_ms: u64,
    pub screenshot_dir: String,
    pub node_binary: String,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            kind: "chromium".to_string(),
            headless: true,
            viewport_width: 1280,
            viewport_height: 720,
            action_timeout_ms: 10_000,
            screenshot_dir: "test-results/screenshots".to_string(),
            node_binary: "node".to_string(),
        }
    }
}

/// Selectors for the login form, used by the `login` step
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginConfig {
    pub path: String,
    pub username_selector: String,
    pub password_selector: String,
    pub submit_selector: String,
    /// Element that appears once the dashboard has loaded
    pub landing_selector: String,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            path: "/login".to_string(),
            username_selector: "#username".to_string(),
            password_selector: "#password".to_string(),
            submit_selector: "button[type=\"submit\"]".to_string(),
            landing_selector: "[data-testid=\"dashboard\"]".to_string(),
        }
    }
}

/// Serializable form of [`PollBounds`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollProfile {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default)]
    pub backoff: Option<f64>,
    #[serde(default)]
    pub max_interval_ms: Option<u64>,
}

fn default_interval_ms() -> u64 {
    crate::retry::DEFAULT_INTERVAL_MS
}

impl PollProfile {
    pub fn new(max_attempts: Option<u32>, timeout_ms: Option<u64>, interval_ms: u64) -> Self {
        Self {
            max_attempts,
            timeout_ms,
            interval_ms,
            backoff: None,
            max_interval_ms: None,
        }
    }

    pub fn to_bounds(&self) -> Result<PollBounds> {
        let interval = Duration::from_millis(self.interval_ms);
        let bounds = PollBounds::new(
            self.max_attempts,
            self.timeout_ms.map(Duration::from_millis),
            interval,
        )?;
        match self.backoff {
            Some(factor) => {
                let cap = self.max_interval_ms.map(Duration::from_millis).unwrap_or(interval);
                bounds.with_backoff(factor, cap)
            }
            None => Ok(bounds),
        }
    }

    /// Copy of this profile with any of the given fields replaced
    pub fn overridden(&self, max_attempts: Option<u32>, timeout_ms: Option<u64>, interval_ms: Option<u64>) -> Self {
        Self {
            max_attempts: max_attempts.or(self.max_attempts),
            timeout_ms: timeout_ms.or(self.timeout_ms),
            interval_ms: interval_ms.unwrap_or(self.interval_ms),
            ..self.clone()
        }
    }
}

/// Canonical bounds for waits that scenarios share
pub fn default_profiles() -> BTreeMap<String, PollProfile> {
    let mut profiles = BTreeMap::new();
    profiles.insert(PROFILE_DEFAULT.to_string(), PollProfile::new(Some(10), Some(30_000), 1_000));
    // Report configuration is reflected after a save + reload cycle
    profiles.insert(PROFILE_REPORT_RUN_COUNT.to_string(), PollProfile::new(Some(12), Some(60_000), 5_000));
    profiles.insert(PROFILE_CRADLE_TO_GRAVE.to_string(), PollProfile::new(Some(24), Some(180_000), 5_000));
    profiles.insert(PROFILE_WALLBOARD.to_string(), PollProfile::new(Some(15), Some(45_000), 3_000));
    profiles.insert(PROFILE_INBOX.to_string(), PollProfile::new(None, Some(120_000), 5_000));
    profiles.insert(PROFILE_REACHABILITY.to_string(), PollProfile::new(None, Some(30_000), 500));
    profiles
}

/// Fixture values consumed by scenarios through `${fixture.key}` placeholders
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fixtures(BTreeMap<String, String>);

impl Fixtures {
    /// Collect every `CCAAS_FIXTURE_*` variable from the process environment
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// `CCAAS_FIXTURE_AGENT1__PASSWORD=x` becomes `agent1.password = x`
    pub fn from_vars<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let map = vars
            .into_iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(FIXTURE_PREFIX)
                    .filter(|rest| !rest.is_empty())
                    .map(|rest| (rest.to_lowercase().replace("__", "."), value))
            })
            .collect();
        Self(map)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| Error::InvalidConfig(format!("missing fixture {:?} (set {}{})", key, FIXTURE_PREFIX, key.to_uppercase().replace('.', "__"))))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// --- environment override helpers ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_bool(target: &mut bool, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<bool>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(env_key, value = val.as_str(), "failed to parse bool from env var, ignoring"),
        }
    }
}

fn override_u64(target: &mut u64, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u64>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(env_key, value = val.as_str(), "failed to parse u64 from env var, ignoring"),
        }
    }
}

fn override_opt_u64(target: &mut Option<u64>, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u64>() {
            Ok(parsed) => *target = Some(parsed),
            Err(_) => warn!(env_key, value = val.as_str(), "failed to parse u64 from env var, ignoring"),
        }
    }
}

fn override_opt_u32(target: &mut Option<u32>, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u32>() {
            Ok(parsed) => *target = Some(parsed),
            Err(_) => warn!(env_key, value = val.as_str(), "failed to parse u32 from env var, ignoring"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_include_canonical_profiles() {
        let config = HarnessConfig::parse("").unwrap();
        for name in [
            PROFILE_DEFAULT,
            PROFILE_REPORT_RUN_COUNT,
            PROFILE_CRADLE_TO_GRAVE,
            PROFILE_WALLBOARD,
            PROFILE_INBOX,
            PROFILE_REACHABILITY,
        ] {
            assert!(config.profile(name).is_ok(), "missing profile {}", name);
        }
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_file_profile_merges_with_defaults() {
        let config = HarnessConfig::parse(
            r#"
[general]
base_url = "https://tenant.example.com"

[polling.report_run_count]
max_attempts = 3
interval_ms = 250

[polling.queue_stats]
timeout_ms = 5000
"#,
        )
        .unwrap();

        assert_eq!(config.general.base_url, "https://tenant.example.com");
        let run_count = config.profile(PROFILE_REPORT_RUN_COUNT).unwrap();
        assert_eq!(run_count.max_attempts, Some(3));
        assert_eq!(run_count.timeout_ms, None);
        assert_eq!(config.profile("queue_stats").unwrap().interval_ms, 1_000);
        assert!(config.profile(PROFILE_WALLBOARD).is_ok());
    }

    #[test]
    fn test_unbounded_profile_fails_validation() {
        let config = HarnessConfig::parse("[polling.forever]\ninterval_ms = 10\n").unwrap();
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_bad_base_url_fails_validation() {
        let config = HarnessConfig::parse("[general]\nbase_url = \"tenant.example.com\"\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_profile() {
        let config = HarnessConfig::default();
        assert!(matches!(config.profile("nope"), Err(Error::UnknownProfile(_))));
    }

    #[test]
    fn test_profile_override_and_backoff() {
        let profile = PollProfile {
            backoff: Some(2.0),
            max_interval_ms: Some(4_000),
            ..PollProfile::new(Some(5), None, 1_000)
        };
        let bounds = profile.to_bounds().unwrap();
        assert_eq!(bounds.interval_for(3), Duration::from_millis(4_000));

        let tweaked = profile.overridden(None, Some(9_000), Some(500));
        assert_eq!(tweaked.max_attempts, Some(5));
        assert_eq!(tweaked.timeout_ms, Some(9_000));
        assert_eq!(tweaked.interval_ms, 500);
    }

    #[test]
    fn test_env_override_applies_to_profile() {
        std::env::set_var("CCAAS_POLL_WALLBOARD_MAX_ATTEMPTS", "2");
        std::env::set_var("CCAAS_POLL_WALLBOARD_INTERVAL_MS", "not-a-number");
        let mut config = HarnessConfig::parse("").unwrap();
        config.apply_env_overrides();
        std::env::remove_var("CCAAS_POLL_WALLBOARD_MAX_ATTEMPTS");
        std::env::remove_var("CCAAS_POLL_WALLBOARD_INTERVAL_MS");

        let wallboard = config.profile(PROFILE_WALLBOARD).unwrap();
        assert_eq!(wallboard.max_attempts, Some(2));
        assert_eq!(wallboard.interval_ms, 3_000);
    }

    #[test]
    fn test_fixtures_from_vars() {
        let fixtures = Fixtures::from_vars(vec![
            ("CCAAS_FIXTURE_AGENT1__USERNAME".to_string(), "agent1@tenant".to_string()),
            ("CCAAS_FIXTURE_SKILL__SALES".to_string(), "4001".to_string()),
            ("CCAAS_FIXTURE_".to_string(), "ignored".to_string()),
            ("PATH".to_string(), "/usr/bin".to_string()),
        ]);

        assert_eq!(fixtures.len(), 2);
        assert_eq!(fixtures.get("agent1.username"), Some("agent1@tenant"));
        assert_eq!(fixtures.require("skill.sales").unwrap(), "4001");
        assert!(fixtures.require("agent2.password").is_err());
    }
}
