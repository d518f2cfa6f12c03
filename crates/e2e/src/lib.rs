//! CCaaS E2E Test Framework
//!
//! Drives the contact-centre web UI through Playwright from declarative YAML
//! scenarios. Several simulated actors (agents, a supervisor) each get their
//! own browser context. External events such as inbound calls, SMS and email
//! come from a helper API. Waits on backend state that updates asynchronously
//! go through the retrier in `ccaas-common`.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   ScenarioRunner (Rust)                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  wait_until_reachable(base_url)                             │
//! │  run_scenario(scenario) -> ScenarioResult                   │
//! │    ├── Browser::new_page(actor) -> Box<dyn Page>            │
//! │    ├── steps: navigate, click, fill, assert, capture, ...   │
//! │    ├── poll { expect, profile, recover } -> Retrier         │
//! │    ├── simulate_call / send_sms / send_email -> HelperApi   │
//! │    └── cleanup (best effort)                                │
//! ├─────────────────────────────────────────────────────────────┤
//! │  PlaywrightBrowser ── JSON lines ──► node bridge.js         │
//! │  HttpHelperClient  ── HTTP ────────► harness service        │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod driver;
pub mod error;
pub mod helpers;
pub mod playwright;
pub mod probe;
pub mod runner;
pub mod spec;

pub use driver::{Browser, Page};
pub use error::{E2eError, E2eResult};
pub use helpers::{HelperApi, HttpHelperClient};
pub use playwright::{PlaywrightBrowser, PlaywrightConfig};
pub use runner::{RunnerConfig, ScenarioResult, ScenarioRunner, SuiteResult};
pub use spec::{Scenario, ScenarioStep, Step};
