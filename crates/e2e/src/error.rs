//! Error types for E2E testing

use thiserror::Error;

#[derive(Error, Debug)]
pub enum E2eError {
    #[error("Product not reachable at {url} after {attempts} attempts")]
    Unreachable { url: String, attempts: u32 },

    #[error("Playwright not found. Install with: npm i playwright && npx playwright install")]
    PlaywrightNotFound,

    #[error("Playwright error: {0}")]
    Playwright(String),

    #[error("Helper API error: {0}")]
    Helper(String),

    #[error("Scenario parse error: {0}")]
    SpecParse(String),

    #[error("Unknown actor '{0}'")]
    UnknownActor(String),

    #[error("Unresolved placeholder ${{{0}}}")]
    UnresolvedPlaceholder(String),

    #[error("Step failed: {step} - {reason}")]
    StepFailed { step: String, reason: String },

    #[error("Assertion failed on {selector}: expected {expected}, actual {actual}")]
    AssertionMismatch {
        selector: String,
        expected: String,
        actual: String,
    },

    #[error("Value {value:?} from {selector} is not a number")]
    NotANumber { selector: String, value: String },

    #[error("Timeout waiting for: {0}")]
    Timeout(String),

    #[error(transparent)]
    Common(#[from] ccaas_common::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type E2eResult<T> = Result<T, E2eError>;
