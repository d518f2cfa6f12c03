//! Declarative YAML scenario specification

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{E2eError, E2eResult};

/// Actor used by steps that do not name one
pub const DEFAULT_ACTOR: &str = "default";

/// A complete scenario parsed from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Unique name for this scenario
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Tags for filtering scenarios
    #[serde(default)]
    pub tags: Vec<String>,

    /// Viewport size for every actor's page
    #[serde(default = "default_viewport")]
    pub viewport: Viewport,

    /// Simulated people taking part (agents, supervisor), one browser context each
    #[serde(default)]
    pub actors: BTreeMap<String, Actor>,

    /// Steps to execute in order
    pub steps: Vec<ScenarioStep>,

    /// Best-effort steps run after the scenario, even when it failed
    #[serde(default)]
    pub cleanup: Vec<ScenarioStep>,
}

fn default_viewport() -> Viewport {
    Viewport { width: 1280, height: 720 }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Actor {
    /// Fixture prefix holding `username` and `password`, e.g. `agent1`
    #[serde(default)]
    pub credentials: Option<String>,

    /// Free-form role label (agent, supervisor, admin)
    #[serde(default)]
    pub role: Option<String>,
}

/// A step bound to the actor that performs it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioStep {
    #[serde(default)]
    pub actor: Option<String>,

    #[serde(flatten)]
    pub step: Step,
}

impl ScenarioStep {
    pub fn actor(&self) -> &str {
        self.actor.as_deref().unwrap_or(DEFAULT_ACTOR)
    }
}

/// A single step in a scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    /// Navigate to a URL (relative to base)
    Navigate {
        url: String,
        #[serde(default)]
        wait_for_selector: Option<String>,
    },

    /// Reload the current page
    Reload,

    /// Click an element
    Click {
        selector: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    /// Fill an input field
    Fill {
        selector: String,
        value: String,
        #[serde(default)]
        clear_first: bool,
    },

    /// Press a key
    Press {
        #[serde(default)]
        selector: Option<String>,
        key: String,
    },

    /// Select an option from a dropdown
    Select {
        selector: String,
        value: String,
    },

    /// Wait for an element to reach a state
    Wait {
        selector: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        state: WaitState,
    },

    /// Wait for a fixed amount of time (use sparingly)
    Sleep {
        ms: u64,
    },

    /// Assert something about an element right now, without retrying
    Assert {
        selector: String,
        #[serde(default)]
        visible: Option<bool>,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        text_contains: Option<String>,
        #[serde(default)]
        attribute: Option<AttributeAssertion>,
        #[serde(default)]
        count: Option<usize>,
    },

    /// Read an element's text into a variable (e.g. a run-count baseline)
    Capture {
        selector: String,
        into: String,
        /// Store only the first integer found in the text
        #[serde(default)]
        numeric: bool,
    },

    /// Re-read an element until its text meets the expectation
    Poll {
        selector: String,
        expect: PollExpectation,
        /// Named profile from the harness configuration
        #[serde(default)]
        profile: Option<String>,
        #[serde(default)]
        max_attempts: Option<u32>,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        interval_ms: Option<u64>,
        /// Corrective action run before every retry
        #[serde(default)]
        recover: Recovery,
        /// On timeout, run the recovery once more and take one last sample
        #[serde(default)]
        second_chance: bool,
        /// Store the observed value
        #[serde(default)]
        into: Option<String>,
    },

    /// Take a screenshot
    Screenshot {
        name: String,
        #[serde(default)]
        selector: Option<String>,
        #[serde(default)]
        full_page: bool,
    },

    /// Log the actor in through the login form
    Login {
        /// Fixture prefix overriding the actor's credentials
        #[serde(default)]
        credentials: Option<String>,
    },

    /// Place an inbound call through the helper API
    SimulateCall {
        from: String,
        to: String,
        #[serde(default)]
        hold_ms: Option<u64>,
    },

    /// Send an inbound SMS through the helper API
    SendSms {
        from: String,
        to: String,
        body: String,
    },

    /// Send an email into the product's inbound mailbox
    SendEmail {
        to: String,
        subject: String,
        body: String,
    },

    /// Poll a test inbox until a matching message arrives
    WaitForEmail {
        to: String,
        subject_contains: String,
        #[serde(default)]
        profile: Option<String>,
        /// Store the message body
        #[serde(default)]
        into: Option<String>,
    },

    /// Enable or disable a skill for an agent
    ToggleSkill {
        agent: String,
        skill: String,
        enabled: bool,
    },

    /// Log a message (for debugging)
    Log {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitState {
    #[default]
    Visible,
    Hidden,
    Attached,
    Detached,
}

impl WaitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitState::Visible => "visible",
            WaitState::Hidden => "hidden",
            WaitState::Attached => "attached",
            WaitState::Detached => "detached",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeAssertion {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub contains: Option<String>,
}

/// What a poll step waits for. Exactly one field is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PollExpectation {
    /// Trimmed text equals this
    #[serde(default)]
    pub equals: Option<String>,
    #[serde(default)]
    pub contains: Option<String>,
    #[serde(default)]
    pub not_contains: Option<String>,
    /// Count equals the named variable plus `by`
    #[serde(default)]
    pub increment_of: Option<String>,
    #[serde(default = "default_increment")]
    pub by: i64,
    #[serde(default)]
    pub at_least: Option<i64>,
}

fn default_increment() -> i64 {
    1
}

/// Corrective action between poll attempts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recovery {
    #[default]
    None,
    Reload,
    Navigate { url: String },
    Click { selector: String },
}

impl Scenario {
    /// Parse a scenario from YAML string
    pub fn from_yaml(yaml: &str) -> E2eResult<Self> {
        let scenario: Self = serde_yaml::from_str(yaml)?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Parse a scenario from a YAML file
    pub fn from_file(path: &Path) -> E2eResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
            .map_err(|e| E2eError::SpecParse(format!("{}: {}", path.display(), e)))
    }

    /// Load all scenarios from a directory, sorted by name
    pub fn load_all(dir: &Path) -> E2eResult<Vec<Self>> {
        let mut scenarios = Vec::new();

        for entry in walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.path()
                    .extension()
                    .map(|ext| ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
            })
        {
            scenarios.push(Self::from_file(entry.path())?);
        }

        scenarios.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(scenarios)
    }

    /// Filter scenarios by tag
    pub fn filter_by_tag<'a>(scenarios: &'a [Self], tag: &str) -> Vec<&'a Self> {
        scenarios.iter().filter(|s| s.tags.iter().any(|t| t == tag)).collect()
    }

    /// Actor names in a stable order; a scenario without actors has just the default one
    pub fn actor_names(&self) -> Vec<String> {
        if self.actors.is_empty() {
            vec![DEFAULT_ACTOR.to_string()]
        } else {
            self.actors.keys().cloned().collect()
        }
    }

    /// Check references that YAML parsing cannot
    pub fn validate(&self) -> E2eResult<()> {
        if self.steps.is_empty() {
            return Err(E2eError::SpecParse(format!("scenario '{}' has no steps", self.name)));
        }

        let actors = self.actor_names();
        for step in self.steps.iter().chain(self.cleanup.iter()) {
            if !actors.iter().any(|a| a == step.actor()) {
                return Err(E2eError::UnknownActor(step.actor().to_string()));
            }
            if let Step::Poll { expect, recover, second_chance, selector, .. } = &step.step {
                expect.check_shape()?;
                if *second_chance && *recover == Recovery::None {
                    return Err(E2eError::SpecParse(format!(
                        "poll on {} sets second_chance without a recover action",
                        selector
                    )));
                }
            }
        }
        Ok(())
    }
}

impl PollExpectation {
    pub fn check_shape(&self) -> E2eResult<()> {
        let set = [
            self.equals.is_some(),
            self.contains.is_some(),
            self.not_contains.is_some(),
            self.increment_of.is_some(),
            self.at_least.is_some(),
        ]
        .iter()
        .filter(|s| **s)
        .count();

        if set != 1 {
            return Err(E2eError::SpecParse(format!(
                "poll expectation needs exactly one of equals/contains/not_contains/increment_of/at_least, got {}",
                set
            )));
        }
        Ok(())
    }
}

impl Step {
    /// Short label used in logs and results
    pub fn name(&self) -> String {
        match self {
            Step::Navigate { url, .. } => format!("navigate:{}", url),
            Step::Reload => "reload".to_string(),
            Step::Click { selector, .. } => format!("click:{}", selector),
            Step::Fill { selector, .. } => format!("fill:{}", selector),
            Step::Press { key, .. } => format!("press:{}", key),
            Step::Select { selector, .. } => format!("select:{}", selector),
            Step::Wait { selector, .. } => format!("wait:{}", selector),
            Step::Sleep { ms } => format!("sleep:{}ms", ms),
            Step::Assert { selector, .. } => format!("assert:{}", selector),
            Step::Capture { into, .. } => format!("capture:{}", into),
            Step::Poll { selector, .. } => format!("poll:{}", selector),
            Step::Screenshot { name, .. } => format!("screenshot:{}", name),
            Step::Login { .. } => "login".to_string(),
            Step::SimulateCall { to, .. } => format!("simulate_call:{}", to),
            Step::SendSms { to, .. } => format!("send_sms:{}", to),
            Step::SendEmail { to, .. } => format!("send_email:{}", to),
            Step::WaitForEmail { to, .. } => format!("wait_for_email:{}", to),
            Step::ToggleSkill { agent, skill, enabled } => {
                format!("toggle_skill:{}:{}:{}", agent, skill, if *enabled { "on" } else { "off" })
            }
            Step::Log { message } => {
                let cut = message.char_indices().nth(30).map_or(message.len(), |(i, _)| i);
                format!("log:{}", &message[..cut])
            }
        }
    }
}

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z0-9_.\-]+)\}").expect("placeholder pattern is valid")
});

// Grouped thousands ("1,024", "1_000_000") before plain digit runs
static INTEGER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"-?\d{1,3}(?:[,_]\d{3})+\b|-?\d+").expect("integer pattern is valid")
});

/// Replace every `${name}` with `lookup(name)`; an unknown name is an error
pub fn interpolate<F>(input: &str, lookup: F) -> E2eResult<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut last = 0;

    for caps in PLACEHOLDER.captures_iter(input) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = lookup(name.as_str())
            .ok_or_else(|| E2eError::UnresolvedPlaceholder(name.as_str().to_string()))?;
        out.push_str(&input[last..whole.start()]);
        out.push_str(&value);
        last = whole.end();
    }

    out.push_str(&input[last..]);
    Ok(out)
}

/// First integer in a piece of UI text ("Run times: 12" -> 12, "Rows: 1,024" -> 1024)
pub fn parse_count(text: &str) -> Option<i64> {
    let digits: String = INTEGER.find(text)?.as_str().chars().filter(|c| !matches!(c, ',' | '_')).collect();
    digits.parse().ok()
}
