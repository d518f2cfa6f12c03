//! Scenario runner
//!
//! Runs scenarios one at a time. Every actor gets its own page, steps run in
//! order and the first failing step ends the scenario. Cleanup steps always
//! run afterwards as best effort. Waits on eventually-consistent backend
//! state (report run-counts, C2G rows, wallboard changes, inbox deliveries)
//! go through [`Retrier`].

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use ccaas_common::config::{PROFILE_DEFAULT, PROFILE_INBOX, PROFILE_REACHABILITY};
use ccaas_common::{Expected, FailureReason, Fixtures, HarnessConfig, PollReport, Retrier};

use crate::driver::{Browser, Page};
use crate::error::{E2eError, E2eResult};
use crate::helpers::{EmailMessage, HelperApi};
use crate::probe::wait_until_reachable;
use crate::spec::{interpolate, parse_count, PollExpectation, Recovery, Scenario, ScenarioStep, Step, WaitState};

/// Variable holding the id of the last simulated call
pub const LAST_CALL_ID: &str = "last_call_id";

type Pages = BTreeMap<String, Box<dyn Page>>;
type Vars = BTreeMap<String, String>;

/// How a scenario failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Observed UI state differed from the expectation
    Assertion,
    /// A bounded wait ran out
    Timeout,
    /// Anything else (driver, helper API, configuration)
    Error,
}

impl FailureKind {
    pub fn of(err: &E2eError) -> Self {
        match err {
            E2eError::AssertionMismatch { .. }
            | E2eError::Common(ccaas_common::Error::Mismatch { .. }) => FailureKind::Assertion,
            E2eError::Timeout(_)
            | E2eError::Unreachable { .. }
            | E2eError::Common(ccaas_common::Error::PollTimeout { .. }) => FailureKind::Timeout,
            _ => FailureKind::Error,
        }
    }
}

/// Poll details kept on a step result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollSummary {
    pub expected: String,
    pub attempts: u32,
    pub elapsed_ms: u64,
    pub value: Option<String>,
    pub reason: Option<FailureReason>,
    pub mismatches: u32,
    pub read_errors: u32,
    pub last_error: Option<String>,
    pub second_chance_used: bool,
}

impl PollSummary {
    fn from_report<T: Display>(report: &PollReport<T>, second_chance_used: bool) -> Self {
        Self {
            expected: report.expected.clone(),
            attempts: report.attempts,
            elapsed_ms: report.elapsed_ms,
            value: report.value.as_ref().map(|v| v.to_string()),
            reason: report.reason,
            mismatches: report.mismatches,
            read_errors: report.read_errors,
            last_error: report.last_error.clone(),
            second_chance_used,
        }
    }
}

/// Result of executing a scenario step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub actor: String,
    pub step_name: String,
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub screenshot_path: Option<PathBuf>,
    pub poll: Option<PollSummary>,
}

/// Result of running a single scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub name: String,
    pub success: bool,
    pub duration_ms: u64,
    pub steps: Vec<StepResult>,
    pub cleanup: Vec<StepResult>,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
}

impl ScenarioResult {
    fn aborted(name: &str, err: &E2eError) -> Self {
        Self {
            name: name.to_string(),
            success: false,
            duration_ms: 0,
            steps: vec![],
            cleanup: vec![],
            error: Some(err.to_string()),
            failure: Some(FailureKind::of(err)),
        }
    }
}

/// Result of running all scenarios
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteResult {
    pub started_at: DateTime<Utc>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
    pub results: Vec<ScenarioResult>,
}

/// Configuration for the runner
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub harness: HarnessConfig,
    pub fixtures: Fixtures,
    pub scenarios_dir: PathBuf,
    pub output_dir: PathBuf,
    pub screenshot_dir: PathBuf,
    /// Probe the base URL before the first scenario
    pub check_reachability: bool,
    /// Screenshot every actor's page when a scenario fails
    pub screenshot_on_failure: bool,
}

impl RunnerConfig {
    pub fn from_harness(harness: HarnessConfig, fixtures: Fixtures) -> Self {
        Self {
            output_dir: PathBuf::from(&harness.general.output_dir),
            screenshot_dir: PathBuf::from(&harness.browser.screenshot_dir),
            harness,
            fixtures,
            scenarios_dir: PathBuf::from("tests/e2e/scenarios"),
            check_reachability: true,
            screenshot_on_failure: true,
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::from_harness(HarnessConfig::default(), Fixtures::default())
    }
}

/// Main E2E scenario runner
pub struct ScenarioRunner {
    config: RunnerConfig,
    browser: Arc<dyn Browser>,
    helpers: Arc<dyn HelperApi>,
    reachable: bool,
}

impl ScenarioRunner {
    pub fn new(config: RunnerConfig, browser: Arc<dyn Browser>, helpers: Arc<dyn HelperApi>) -> Self {
        Self {
            config,
            browser,
            helpers,
            reachable: false,
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Probe the product once per runner
    pub async fn ensure_reachable(&mut self) -> E2eResult<()> {
        if self.reachable || !self.config.check_reachability {
            return Ok(());
        }
        let bounds = self.config.harness.profile(PROFILE_REACHABILITY)?.to_bounds()?;
        wait_until_reachable(&self.config.harness.general.base_url, bounds).await?;
        self.reachable = true;
        Ok(())
    }

    /// Run all scenarios in the scenarios directory
    pub async fn run_all(&mut self) -> E2eResult<SuiteResult> {
        let scenarios = Scenario::load_all(&self.config.scenarios_dir)?;
        self.run_scenarios(&scenarios).await
    }

    /// Run scenarios matching a tag
    pub async fn run_tagged(&mut self, tag: &str) -> E2eResult<SuiteResult> {
        let scenarios = Scenario::load_all(&self.config.scenarios_dir)?;
        let filtered: Vec<Scenario> = Scenario::filter_by_tag(&scenarios, tag)
            .into_iter()
            .cloned()
            .collect();
        self.run_scenarios(&filtered).await
    }

    /// Run a specific scenario by name
    pub async fn run_named(&mut self, name: &str) -> E2eResult<SuiteResult> {
        let scenarios = Scenario::load_all(&self.config.scenarios_dir)?;
        let scenario = scenarios
            .into_iter()
            .find(|s| s.name == name)
            .ok_or_else(|| E2eError::SpecParse(format!("Scenario not found: {}", name)))?;
        self.run_scenarios(std::slice::from_ref(&scenario)).await
    }

    /// Run a list of scenarios
    pub async fn run_scenarios(&mut self, scenarios: &[Scenario]) -> E2eResult<SuiteResult> {
        let started_at = Utc::now();
        let start = Instant::now();
        let mut results = Vec::new();
        let mut passed = 0;
        let mut failed = 0;

        self.ensure_reachable().await?;

        info!("Running {} scenario(s)...", scenarios.len());

        for scenario in scenarios {
            let result = match self.run_scenario(scenario).await {
                Ok(result) => result,
                Err(e) => ScenarioResult::aborted(&scenario.name, &e),
            };

            if result.success {
                passed += 1;
                info!("✓ {} ({} ms)", result.name, result.duration_ms);
            } else {
                failed += 1;
                error!("✗ {} - {}", result.name, result.error.as_deref().unwrap_or("unknown error"));
            }
            results.push(result);
        }

        let duration_ms = elapsed_ms(start);
        info!("Scenario results: {} passed, {} failed ({} ms)", passed, failed, duration_ms);

        Ok(SuiteResult {
            started_at,
            total: scenarios.len(),
            passed,
            failed,
            skipped: 0,
            duration_ms,
            results,
        })
    }

    /// Run a single scenario
    pub async fn run_scenario(&self, scenario: &Scenario) -> E2eResult<ScenarioResult> {
        let start = Instant::now();
        debug!("Running scenario: {}", scenario.name);

        let mut pages = Pages::new();
        for actor in scenario.actor_names() {
            match self.browser.new_page(&actor, &scenario.viewport).await {
                Ok(page) => {
                    pages.insert(actor, page);
                }
                Err(e) => {
                    close_pages(&pages).await;
                    return Err(e);
                }
            }
        }

        let mut vars = Vars::new();
        let mut steps = Vec::new();
        let mut failure: Option<E2eError> = None;

        for step in &scenario.steps {
            let (result, err) = self.run_step(scenario, &pages, &mut vars, step).await;
            steps.push(result);
            if let Some(err) = err {
                failure = Some(err);
                break;
            }
        }

        if failure.is_some() && self.config.screenshot_on_failure {
            self.capture_failure(scenario, &pages).await;
        }

        let mut cleanup = Vec::new();
        for step in &scenario.cleanup {
            let (result, err) = self.run_step(scenario, &pages, &mut vars, step).await;
            if let Some(err) = err {
                warn!(scenario = %scenario.name, step = %result.step_name, "cleanup step failed: {}", err);
            }
            cleanup.push(result);
        }

        close_pages(&pages).await;

        Ok(ScenarioResult {
            name: scenario.name.clone(),
            success: failure.is_none(),
            duration_ms: elapsed_ms(start),
            steps,
            cleanup,
            error: failure.as_ref().map(|e| e.to_string()),
            failure: failure.as_ref().map(FailureKind::of),
        })
    }

    /// Execute one step and time it. The error is returned alongside the result.
    async fn run_step(
        &self,
        scenario: &Scenario,
        pages: &Pages,
        vars: &mut Vars,
        step: &ScenarioStep,
    ) -> (StepResult, Option<E2eError>) {
        let start = Instant::now();
        let mut result = StepResult {
            actor: step.actor().to_string(),
            step_name: step.step.name(),
            success: false,
            duration_ms: 0,
            error: None,
            screenshot_path: None,
            poll: None,
        };

        debug!(actor = %result.actor, step = %result.step_name, "Executing step");

        let outcome = self.execute_step(scenario, pages, vars, step, &mut result).await;
        result.duration_ms = elapsed_ms(start);

        match outcome {
            Ok(()) => {
                result.success = true;
                (result, None)
            }
            Err(e) => {
                result.error = Some(e.to_string());
                (result, Some(e))
            }
        }
    }

    async fn execute_step(
        &self,
        scenario: &Scenario,
        pages: &Pages,
        vars: &mut Vars,
        step: &ScenarioStep,
        result: &mut StepResult,
    ) -> E2eResult<()> {
        let actor = step.actor();
        let page = page_for(pages, actor)?;
        let action_timeout = self.config.harness.browser.action_timeout_ms;

        match &step.step {
            Step::Navigate { url, wait_for_selector } => {
                page.navigate(&self.absolute_url(&self.resolve(vars, url)?)).await?;
                if let Some(selector) = wait_for_selector {
                    page.wait_for(&self.resolve(vars, selector)?, WaitState::Visible, action_timeout)
                        .await?;
                }
            }
            Step::Reload => page.reload().await?,
            Step::Click { selector, timeout_ms } => {
                page.click(&self.resolve(vars, selector)?, timeout_ms.unwrap_or(action_timeout))
                    .await?;
            }
            Step::Fill { selector, value, clear_first } => {
                let selector = self.resolve(vars, selector)?;
                if *clear_first {
                    page.fill(&selector, "").await?;
                }
                page.fill(&selector, &self.resolve(vars, value)?).await?;
            }
            Step::Press { selector, key } => {
                let selector = selector.as_ref().map(|s| self.resolve(vars, s)).transpose()?;
                page.press(selector.as_deref(), &self.resolve(vars, key)?).await?;
            }
            Step::Select { selector, value } => {
                page.select(&self.resolve(vars, selector)?, &self.resolve(vars, value)?)
                    .await?;
            }
            Step::Wait { selector, timeout_ms, state } => {
                let selector = self.resolve(vars, selector)?;
                let timeout_ms = timeout_ms.unwrap_or(action_timeout);
                page.wait_for(&selector, *state, timeout_ms).await.map_err(|e| {
                    E2eError::Timeout(format!("{} to be {} within {} ms ({})", selector, state.as_str(), timeout_ms, e))
                })?;
            }
            Step::Sleep { ms } => tokio::time::sleep(Duration::from_millis(*ms)).await,
            Step::Assert { selector, visible, text, text_contains, attribute, count } => {
                let selector = self.resolve(vars, selector)?;
                self.assert_element(
                    page,
                    &selector,
                    *visible,
                    text.as_ref().map(|t| self.resolve(vars, t)).transpose()?,
                    text_contains.as_ref().map(|t| self.resolve(vars, t)).transpose()?,
                    attribute.as_ref(),
                    *count,
                )
                .await?;
            }
            Step::Capture { selector, into, numeric } => {
                let selector = self.resolve(vars, selector)?;
                let text = page.text(&selector).await?;
                let value = if *numeric {
                    parse_count(&text)
                        .ok_or(E2eError::NotANumber { selector, value: text })?
                        .to_string()
                } else {
                    text.trim().to_string()
                };
                debug!(var = %into, value = %value, "captured");
                vars.insert(into.clone(), value);
            }
            Step::Poll {
                selector,
                expect,
                profile,
                max_attempts,
                timeout_ms,
                interval_ms,
                recover,
                second_chance,
                into,
            } => {
                let selector = self.resolve(vars, selector)?;
                let profile = self
                    .config
                    .harness
                    .profile(profile.as_deref().unwrap_or(PROFILE_DEFAULT))?
                    .overridden(*max_attempts, *timeout_ms, *interval_ms);
                let retrier = Retrier::new(profile.to_bounds()?).with_label(format!("{} {}", scenario.name, selector));
                let recovery = self.resolve_recovery(vars, recover)?;

                let observed = self
                    .poll_element(page, &retrier, &selector, self.poll_target(vars, expect)?, &recovery, *second_chance, result)
                    .await?;
                if let Some(var) = into {
                    vars.insert(var.clone(), observed);
                }
            }
            Step::Screenshot { name, selector, full_page } => {
                let path = self.config.screenshot_dir.join(format!("{}.png", self.resolve(vars, name)?));
                let selector = selector.as_ref().map(|s| self.resolve(vars, s)).transpose()?;
                page.screenshot(&path, selector.as_deref(), *full_page).await?;
                result.screenshot_path = Some(path);
            }
            Step::Login { credentials } => {
                let prefix = credentials
                    .clone()
                    .or_else(|| scenario.actors.get(actor).and_then(|a| a.credentials.clone()))
                    .unwrap_or_else(|| actor.to_string());
                self.login(page, &prefix).await?;
            }
            Step::SimulateCall { from, to, hold_ms } => {
                let call = self
                    .helpers
                    .simulate_inbound_call(&self.resolve(vars, from)?, &self.resolve(vars, to)?, *hold_ms)
                    .await?;
                vars.insert(LAST_CALL_ID.to_string(), call.call_id);
            }
            Step::SendSms { from, to, body } => {
                self.helpers
                    .send_sms(&self.resolve(vars, from)?, &self.resolve(vars, to)?, &self.resolve(vars, body)?)
                    .await?;
            }
            Step::SendEmail { to, subject, body } => {
                self.helpers
                    .send_email(&self.resolve(vars, to)?, &self.resolve(vars, subject)?, &self.resolve(vars, body)?)
                    .await?;
            }
            Step::WaitForEmail { to, subject_contains, profile, into } => {
                let to = self.resolve(vars, to)?;
                let needle = self.resolve(vars, subject_contains)?;
                let message = self
                    .wait_for_email(&to, &needle, profile.as_deref().unwrap_or(PROFILE_INBOX), result)
                    .await?;
                if let Some(var) = into {
                    vars.insert(var.clone(), message.body);
                }
            }
            Step::ToggleSkill { agent, skill, enabled } => {
                self.helpers
                    .set_agent_skill(&self.resolve(vars, agent)?, &self.resolve(vars, skill)?, *enabled)
                    .await?;
            }
            Step::Log { message } => {
                info!("[SCENARIO LOG] {}", self.resolve(vars, message)?);
            }
        }

        Ok(())
    }

    /// Expand `${fixture.key}`, `${base_url}` and `${variable}` placeholders
    fn resolve(&self, vars: &Vars, input: &str) -> E2eResult<String> {
        let fixtures = &self.config.fixtures;
        let base_url = &self.config.harness.general.base_url;
        interpolate(input, |name| {
            if let Some(key) = name.strip_prefix("fixture.") {
                return fixtures.get(key).map(String::from);
            }
            if name == "base_url" {
                return Some(base_url.clone());
            }
            vars.get(name).cloned()
        })
    }

    fn absolute_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            return url.to_string();
        }
        format!(
            "{}/{}",
            self.config.harness.general.base_url.trim_end_matches('/'),
            url.trim_start_matches('/')
        )
    }

    fn resolve_recovery(&self, vars: &Vars, recovery: &Recovery) -> E2eResult<Recovery> {
        Ok(match recovery {
            Recovery::None => Recovery::None,
            Recovery::Reload => Recovery::Reload,
            Recovery::Navigate { url } => Recovery::Navigate {
                url: self.absolute_url(&self.resolve(vars, url)?),
            },
            Recovery::Click { selector } => Recovery::Click {
                selector: self.resolve(vars, selector)?,
            },
        })
    }

    async fn recover(&self, page: &dyn Page, recovery: &Recovery) -> E2eResult<()> {
        match recovery {
            Recovery::None => Ok(()),
            Recovery::Reload => page.reload().await,
            Recovery::Navigate { url } => page.navigate(url).await,
            Recovery::Click { selector } => {
                page.click(selector, self.config.harness.browser.action_timeout_ms).await
            }
        }
    }

    fn poll_target(&self, vars: &Vars, expect: &PollExpectation) -> E2eResult<PollTarget> {
        expect.check_shape()?;

        if let Some(text) = &expect.equals {
            let text = self.resolve(vars, text)?;
            let description = format!("text == {:?}", text);
            return Ok(PollTarget::Text(Expected::satisfies(description, move |v: &String| {
                v.trim() == text
            })));
        }
        if let Some(text) = &expect.contains {
            return Ok(PollTarget::Text(Expected::contains(self.resolve(vars, text)?)));
        }
        if let Some(text) = &expect.not_contains {
            return Ok(PollTarget::Text(Expected::not_contains(self.resolve(vars, text)?)));
        }
        if let Some(var) = &expect.increment_of {
            let raw = vars
                .get(var)
                .ok_or_else(|| E2eError::UnresolvedPlaceholder(var.clone()))?;
            let baseline = parse_count(raw).ok_or_else(|| E2eError::NotANumber {
                selector: format!("${{{}}}", var),
                value: raw.clone(),
            })?;
            return Ok(PollTarget::Count(Expected::delta(baseline, expect.by)));
        }
        if let Some(minimum) = expect.at_least {
            return Ok(PollTarget::Count(Expected::at_least(minimum)));
        }

        Err(E2eError::SpecParse("empty poll expectation".to_string()))
    }

    #[allow(clippy::too_many_arguments)]
    async fn poll_element(
        &self,
        page: &dyn Page,
        retrier: &Retrier,
        selector: &str,
        target: PollTarget,
        recovery: &Recovery,
        second_chance: bool,
        result: &mut StepResult,
    ) -> E2eResult<String> {
        match target {
            PollTarget::Text(expected) => {
                let sample = move |_: u32| page.text(selector);
                let (report, used) = self
                    .run_poll(page, retrier, &expected, recovery, second_chance, sample)
                    .await;
                result.poll = Some(PollSummary::from_report(&report, used));
                Ok(report.into_result()?.trim().to_string())
            }
            PollTarget::Count(expected) => {
                let sample = move |_: u32| async move {
                    let text = page.text(selector).await?;
                    parse_count(&text).ok_or_else(|| E2eError::NotANumber {
                        selector: selector.to_string(),
                        value: text.clone(),
                    })
                };
                let (report, used) = self
                    .run_poll(page, retrier, &expected, recovery, second_chance, sample)
                    .await;
                result.poll = Some(PollSummary::from_report(&report, used));
                Ok(report.into_result()?.to_string())
            }
        }
    }

    /// Poll with the configured recovery. With `second_chance`, an exhausted
    /// poll gets one more corrective action and one final sample.
    async fn run_poll<T, S, SF>(
        &self,
        page: &dyn Page,
        retrier: &Retrier,
        expected: &Expected<T>,
        recovery: &Recovery,
        second_chance: bool,
        mut sample: S,
    ) -> (PollReport<T>, bool)
    where
        T: Clone + PartialEq + Display,
        S: FnMut(u32) -> SF,
        SF: Future<Output = E2eResult<T>>,
    {
        let mut report = match recovery {
            Recovery::None => retrier.poll(expected, &mut sample).await,
            _ => {
                retrier
                    .poll_with_recovery(expected, &mut sample, move |_| self.recover(page, recovery))
                    .await
            }
        };

        if report.success || !second_chance || *recovery == Recovery::None {
            return (report, false);
        }

        info!(attempts = report.attempts, "poll exhausted, running one more corrective action");
        if let Err(e) = self.recover(page, recovery).await {
            warn!("second-chance recovery failed: {}", e);
            report.recovery_errors += 1;
            report.last_error = Some(e.to_string());
        }

        let last = Retrier::check_once(expected, sample(report.attempts + 1)).await;
        report.append_final(last);

        (report, true)
    }

    async fn wait_for_email(
        &self,
        to: &str,
        subject_contains: &str,
        profile: &str,
        result: &mut StepResult,
    ) -> E2eResult<EmailMessage> {
        let bounds = self.config.harness.profile(profile)?.to_bounds()?;
        let retrier = Retrier::new(bounds).with_label(format!("inbox {}", to));
        let expected = Expected::satisfies(
            format!("message to {} with subject containing {:?}", to, subject_contains),
            |found: &InboxMatch| found.0.is_some(),
        );

        let helpers = &self.helpers;
        let report = retrier
            .poll(&expected, move |_| async move {
                let messages = helpers.inbox(to).await?;
                Ok::<_, E2eError>(InboxMatch(
                    messages.into_iter().find(|m| m.subject.contains(subject_contains)),
                ))
            })
            .await;
        result.poll = Some(PollSummary::from_report(&report, false));

        match report.into_result()?.0 {
            Some(message) => Ok(message),
            None => Err(E2eError::Timeout(format!("email to {}", to))),
        }
    }

    async fn login(&self, page: &dyn Page, prefix: &str) -> E2eResult<()> {
        let login = &self.config.harness.login;
        let fixtures = &self.config.fixtures;
        let username = fixtures.require(&format!("{}.username", prefix))?;
        let password = fixtures.require(&format!("{}.password", prefix))?;
        let timeout = self.config.harness.browser.action_timeout_ms;

        page.navigate(&self.absolute_url(&login.path)).await?;
        page.fill(&login.username_selector, username).await?;
        page.fill(&login.password_selector, password).await?;
        page.click(&login.submit_selector, timeout).await?;
        page.wait_for(&login.landing_selector, WaitState::Visible, timeout)
            .await
            .map_err(|e| E2eError::StepFailed {
                step: "login".to_string(),
                reason: format!("{} did not reach the dashboard: {}", username, e),
            })?;

        info!(user = %username, "logged in");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn assert_element(
        &self,
        page: &dyn Page,
        selector: &str,
        visible: Option<bool>,
        text: Option<String>,
        text_contains: Option<String>,
        attribute: Option<&crate::spec::AttributeAssertion>,
        count: Option<usize>,
    ) -> E2eResult<()> {
        let mismatch = |expected: String, actual: String| E2eError::AssertionMismatch {
            selector: selector.to_string(),
            expected,
            actual,
        };

        if let Some(want) = visible {
            let is = page.is_visible(selector).await?;
            if is != want {
                return Err(mismatch(visibility(want), visibility(is)));
            }
        }

        if let Some(want) = text {
            let expected = Expected::satisfies(format!("text {:?}", want), move |v: &String| v.trim() == want);
            let report = Retrier::check_once(&expected, page.text(selector)).await;
            check(report, &mismatch)?;
        }

        if let Some(want) = text_contains {
            let report = Retrier::check_once(&Expected::contains(want), page.text(selector)).await;
            check(report, &mismatch)?;
        }

        if let Some(attr) = attribute {
            let actual = page.attribute(selector, &attr.name).await?;
            let shown = actual.clone().unwrap_or_else(|| "<absent>".to_string());
            if let Some(want) = &attr.value {
                if actual.as_deref() != Some(want.as_str()) {
                    return Err(mismatch(format!("{}={:?}", attr.name, want), shown));
                }
            }
            if let Some(part) = &attr.contains {
                if !actual.as_deref().map_or(false, |a| a.contains(part.as_str())) {
                    return Err(mismatch(format!("{} containing {:?}", attr.name, part), shown));
                }
            }
            if attr.value.is_none() && attr.contains.is_none() && actual.is_none() {
                return Err(mismatch(format!("attribute {}", attr.name), shown));
            }
        }

        if let Some(want) = count {
            let is = page.count(selector).await?;
            if is != want {
                return Err(mismatch(format!("{} element(s)", want), format!("{} element(s)", is)));
            }
        }

        Ok(())
    }

    /// Best-effort screenshot of every actor's page
    async fn capture_failure(&self, scenario: &Scenario, pages: &Pages) {
        for (actor, page) in pages {
            let path = self
                .config
                .screenshot_dir
                .join(format!("{}-{}-failure.png", scenario.name, actor));
            if let Err(e) = page.screenshot(&path, None, true).await {
                warn!(actor = %actor, "failure screenshot not taken: {}", e);
            }
        }
    }

    /// Write suite results to JSON file
    pub fn write_results(&self, results: &SuiteResult) -> E2eResult<PathBuf> {
        write_results(&self.config.output_dir, results)
    }
}

/// Write suite results to `<dir>/test-results.json`
pub fn write_results(output_dir: &Path, results: &SuiteResult) -> E2eResult<PathBuf> {
    std::fs::create_dir_all(output_dir)?;

    let path = output_dir.join("test-results.json");
    let json = serde_json::to_string_pretty(results)?;
    std::fs::write(&path, json)?;

    info!("Results written to: {}", path.display());
    Ok(path)
}

enum PollTarget {
    Text(Expected<String>),
    Count(Expected<i64>),
}

/// First inbox message that matched, if any
#[derive(Debug, Clone, PartialEq)]
struct InboxMatch(Option<EmailMessage>);

impl Display for InboxMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(message) => write!(f, "{:?}", message.subject),
            None => f.write_str("<no matching message>"),
        }
    }
}

fn page_for<'a>(pages: &'a Pages, actor: &str) -> E2eResult<&'a dyn Page> {
    pages
        .get(actor)
        .map(|page| page.as_ref())
        .ok_or_else(|| E2eError::UnknownActor(actor.to_string()))
}

async fn close_pages(pages: &Pages) {
    for (actor, page) in pages {
        if let Err(e) = page.close().await {
            debug!(actor = %actor, "page close failed: {}", e);
        }
    }
}

fn check<T, F>(report: PollReport<T>, mismatch: &F) -> E2eResult<()>
where
    T: Display,
    F: Fn(String, String) -> E2eError,
{
    match report.into_result() {
        Ok(_) => Ok(()),
        Err(ccaas_common::Error::Mismatch { expected, observed }) => Err(mismatch(expected, observed)),
        Err(e) => Err(e.into()),
    }
}

fn visibility(visible: bool) -> String {
    if visible { "visible" } else { "hidden" }.to_string()
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_classification() {
        let mismatch = E2eError::AssertionMismatch {
            selector: "#status".into(),
            expected: "Ready".into(),
            actual: "Busy".into(),
        };
        assert_eq!(FailureKind::of(&mismatch), FailureKind::Assertion);

        let timeout = E2eError::Common(ccaas_common::Error::PollTimeout {
            expected: "value == 6".into(),
            attempts: 3,
            elapsed_ms: 10,
            last_value: Some("5".into()),
            read_errors: 0,
            last_error: None,
        });
        assert_eq!(FailureKind::of(&timeout), FailureKind::Timeout);
        assert_eq!(FailureKind::of(&E2eError::Helper("500".into())), FailureKind::Error);
    }

    #[test]
    fn test_write_results() {
        let dir = tempfile::tempdir().unwrap();
        let suite = SuiteResult {
            started_at: Utc::now(),
            total: 0,
            passed: 0,
            failed: 0,
            skipped: 0,
            duration_ms: 0,
            results: vec![],
        };

        let path = write_results(dir.path(), &suite).unwrap();
        let written: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(written["total"], 0);
    }

    #[test]
    fn test_inbox_match_display() {
        assert_eq!(InboxMatch(None).to_string(), "<no matching message>");
    }
}
