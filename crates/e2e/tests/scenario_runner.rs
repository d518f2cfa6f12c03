//! Runner behaviour against in-memory browser and helper fakes

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use ccaas_common::{FailureReason, Fixtures, HarnessConfig, PollProfile};
use ccaas_e2e::driver::{Browser, Page};
use ccaas_e2e::helpers::{CallHandle, EmailMessage, HelperApi};
use ccaas_e2e::runner::{FailureKind, RunnerConfig, ScenarioRunner};
use ccaas_e2e::spec::{Scenario, Viewport, WaitState};
use ccaas_e2e::{E2eError, E2eResult};

#[derive(Default)]
struct DomState {
    /// Successive reads of a selector; the last value sticks
    texts: HashMap<String, VecDeque<String>>,
    log: Vec<String>,
}

#[derive(Clone, Default)]
struct FakeBrowser {
    dom: Arc<Mutex<DomState>>,
}

impl FakeBrowser {
    fn set_texts(&self, selector: &str, values: &[&str]) {
        let mut dom = self.dom.lock().unwrap();
        dom.texts
            .insert(selector.to_string(), values.iter().map(|v| v.to_string()).collect());
    }

    fn log(&self) -> Vec<String> {
        self.dom.lock().unwrap().log.clone()
    }

    fn count(&self, entry: &str) -> usize {
        self.log().iter().filter(|e| *e == entry).count()
    }
}

struct FakePage {
    actor: String,
    dom: Arc<Mutex<DomState>>,
}

impl FakePage {
    fn record(&self, entry: String) {
        self.dom.lock().unwrap().log.push(format!("{}:{}", self.actor, entry));
    }
}

#[async_trait]
impl Page for FakePage {
    async fn navigate(&self, url: &str) -> E2eResult<()> {
        self.record(format!("navigate {}", url));
        Ok(())
    }

    async fn reload(&self) -> E2eResult<()> {
        self.record("reload".to_string());
        Ok(())
    }

    async fn click(&self, selector: &str, _timeout_ms: u64) -> E2eResult<()> {
        self.record(format!("click {}", selector));
        Ok(())
    }

    async fn fill(&self, selector: &str, value: &str) -> E2eResult<()> {
        self.record(format!("fill {}={}", selector, value));
        Ok(())
    }

    async fn press(&self, _selector: Option<&str>, key: &str) -> E2eResult<()> {
        self.record(format!("press {}", key));
        Ok(())
    }

    async fn select(&self, selector: &str, value: &str) -> E2eResult<()> {
        self.record(format!("select {}={}", selector, value));
        Ok(())
    }

    async fn wait_for(&self, selector: &str, _state: WaitState, _timeout_ms: u64) -> E2eResult<()> {
        self.record(format!("wait {}", selector));
        Ok(())
    }

    async fn text(&self, selector: &str) -> E2eResult<String> {
        let mut dom = self.dom.lock().unwrap();
        let values = dom
            .texts
            .get_mut(selector)
            .ok_or_else(|| E2eError::Playwright(format!("no element matches {}", selector)))?;
        let value = if values.len() > 1 { values.pop_front() } else { values.front().cloned() };
        value.ok_or_else(|| E2eError::Playwright(format!("{} has no text", selector)))
    }

    async fn is_visible(&self, selector: &str) -> E2eResult<bool> {
        Ok(self.dom.lock().unwrap().texts.contains_key(selector))
    }

    async fn attribute(&self, _selector: &str, _name: &str) -> E2eResult<Option<String>> {
        Ok(None)
    }

    async fn count(&self, selector: &str) -> E2eResult<usize> {
        Ok(usize::from(self.dom.lock().unwrap().texts.contains_key(selector)))
    }

    async fn screenshot(&self, path: &Path, _selector: Option<&str>, _full_page: bool) -> E2eResult<()> {
        self.record(format!("screenshot {}", path.display()));
        Ok(())
    }

    async fn close(&self) -> E2eResult<()> {
        self.record("close".to_string());
        Ok(())
    }
}

#[async_trait]
impl Browser for FakeBrowser {
    async fn new_page(&self, actor: &str, _viewport: &Viewport) -> E2eResult<Box<dyn Page>> {
        self.dom.lock().unwrap().log.push(format!("{}:open", actor));
        Ok(Box::new(FakePage {
            actor: actor.to_string(),
            dom: self.dom.clone(),
        }))
    }

    async fn close(&self) -> E2eResult<()> {
        Ok(())
    }
}

#[derive(Default)]
struct FakeHelpers {
    calls: Mutex<Vec<String>>,
    /// Successive inbox reads; the last one sticks
    inbox: Mutex<VecDeque<Vec<EmailMessage>>>,
}

impl FakeHelpers {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl HelperApi for FakeHelpers {
    async fn simulate_inbound_call(&self, from: &str, to: &str, _hold_ms: Option<u64>) -> E2eResult<CallHandle> {
        self.calls.lock().unwrap().push(format!("call {}->{}", from, to));
        Ok(CallHandle {
            call_id: "call-42".to_string(),
            status: "ringing".to_string(),
        })
    }

    async fn send_sms(&self, from: &str, to: &str, body: &str) -> E2eResult<()> {
        self.calls.lock().unwrap().push(format!("sms {}->{}: {}", from, to, body));
        Ok(())
    }

    async fn send_email(&self, to: &str, subject: &str, _body: &str) -> E2eResult<()> {
        self.calls.lock().unwrap().push(format!("email {}: {}", to, subject));
        Ok(())
    }

    async fn inbox(&self, address: &str) -> E2eResult<Vec<EmailMessage>> {
        self.calls.lock().unwrap().push(format!("inbox {}", address));
        let mut inbox = self.inbox.lock().unwrap();
        let messages = if inbox.len() > 1 { inbox.pop_front() } else { inbox.front().cloned() };
        Ok(messages.unwrap_or_default())
    }

    async fn set_agent_skill(&self, agent: &str, skill: &str, enabled: bool) -> E2eResult<()> {
        self.calls.lock().unwrap().push(format!("skill {} {} {}", agent, skill, enabled));
        Ok(())
    }
}

fn runner_with(browser: &FakeBrowser, helpers: Arc<FakeHelpers>, fixtures: Fixtures) -> ScenarioRunner {
    let mut harness = HarnessConfig::default();
    harness.general.base_url = "http://ccaas.test".to_string();
    harness
        .polling
        .insert("inbox".to_string(), PollProfile::new(Some(3), None, 0));

    let mut config = RunnerConfig::from_harness(harness, fixtures);
    config.check_reachability = false;
    ScenarioRunner::new(config, Arc::new(browser.clone()), helpers)
}

fn runner(browser: &FakeBrowser) -> ScenarioRunner {
    runner_with(browser, Arc::new(FakeHelpers::default()), Fixtures::default())
}

#[tokio::test]
async fn test_run_count_poll_succeeds_on_third_read() {
    let browser = FakeBrowser::default();
    // Baseline capture, then three poll reads
    browser.set_texts("#run-times", &["Run times: 5", "Run times: 5", "Run times: 5", "Run times: 6"]);

    let scenario = Scenario::from_yaml(
        r#"
name: report-run-count
steps:
  - action: capture
    selector: '#run-times'
    into: run_count
    numeric: true
  - action: click
    selector: '#run-now'
  - action: poll
    selector: '#run-times'
    expect:
      increment_of: run_count
    profile: report_run_count
    max_attempts: 5
    interval_ms: 0
    into: new_count
  - action: fill
    selector: '#note'
    value: 'runs=${new_count}'
"#,
    )
    .unwrap();

    let result = runner(&browser).run_scenario(&scenario).await.unwrap();

    assert!(result.success, "{:?}", result.error);
    let poll = result.steps[2].poll.as_ref().unwrap();
    assert_eq!(poll.attempts, 3);
    assert_eq!(poll.value.as_deref(), Some("6"));
    assert_eq!(poll.mismatches, 2);
    assert_eq!(poll.reason, None);
    assert_eq!(browser.count("default:fill #note=runs=6"), 1);
}

#[tokio::test]
async fn test_run_count_never_changes_is_timeout() {
    let browser = FakeBrowser::default();
    browser.set_texts("#run-times", &["5"]);

    let scenario = Scenario::from_yaml(
        r#"
name: stuck-run-count
steps:
  - action: capture
    selector: '#run-times'
    into: run_count
    numeric: true
  - action: poll
    selector: '#run-times'
    expect:
      increment_of: run_count
    max_attempts: 3
    interval_ms: 0
    recover:
      kind: reload
  - action: log
    message: never reached
"#,
    )
    .unwrap();

    let result = runner(&browser).run_scenario(&scenario).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureKind::Timeout));
    assert_eq!(result.steps.len(), 2);

    let poll = result.steps[1].poll.as_ref().unwrap();
    assert_eq!(poll.attempts, 3);
    assert_eq!(poll.value.as_deref(), Some("5"));
    assert_eq!(poll.reason, Some(FailureReason::Timeout));
    assert!(!poll.second_chance_used);
    // Recovery runs between attempts only
    assert_eq!(browser.count("default:reload"), 2);
}

#[tokio::test]
async fn test_second_chance_takes_one_more_sample() {
    let browser = FakeBrowser::default();
    browser.set_texts("#c2g-rows", &["5", "5", "6"]);

    let scenario = Scenario::from_yaml(
        r#"
name: c2g-row
steps:
  - action: poll
    selector: '#c2g-rows'
    expect:
      at_least: 6
    max_attempts: 2
    interval_ms: 0
    recover:
      kind: click
      selector: '#search'
    second_chance: true
"#,
    )
    .unwrap();

    let result = runner(&browser).run_scenario(&scenario).await.unwrap();

    assert!(result.success, "{:?}", result.error);
    let poll = result.steps[0].poll.as_ref().unwrap();
    assert!(poll.second_chance_used);
    assert_eq!(poll.attempts, 3);
    assert_eq!(poll.value.as_deref(), Some("6"));
    assert_eq!(browser.count("default:click #search"), 2);
}

#[tokio::test]
async fn test_read_errors_while_polling_are_retried() {
    let browser = FakeBrowser::default();

    let scenario = Scenario::from_yaml(
        r#"
name: missing-element
steps:
  - action: poll
    selector: '#wallboard-tile'
    expect:
      contains: Queue
    max_attempts: 2
    interval_ms: 0
"#,
    )
    .unwrap();

    let result = runner(&browser).run_scenario(&scenario).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureKind::Timeout));
    let poll = result.steps[0].poll.as_ref().unwrap();
    assert_eq!(poll.read_errors, 2);
    assert_eq!(poll.value, None);
    assert!(poll.last_error.as_deref().unwrap().contains("#wallboard-tile"));
}

#[tokio::test]
async fn test_assertion_failure_stops_steps_and_runs_cleanup() {
    let browser = FakeBrowser::default();
    browser.set_texts("#status", &["Busy"]);

    let scenario = Scenario::from_yaml(
        r#"
name: agent-status
steps:
  - action: assert
    selector: '#status'
    text: Ready
  - action: click
    selector: '#take-call'
cleanup:
  - action: click
    selector: '#logout'
"#,
    )
    .unwrap();

    let result = runner(&browser).run_scenario(&scenario).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureKind::Assertion));
    assert_eq!(result.steps.len(), 1);
    assert!(result.error.as_deref().unwrap().contains("Busy"));
    assert_eq!(result.cleanup.len(), 1);
    assert!(result.cleanup[0].success);

    let log = browser.log();
    assert!(!log.contains(&"default:click #take-call".to_string()));
    assert!(log.contains(&"default:click #logout".to_string()));
    assert_eq!(log.last().map(String::as_str), Some("default:close"));
}

#[tokio::test]
async fn test_login_uses_actor_fixtures() {
    let browser = FakeBrowser::default();
    let mut fixtures = Fixtures::default();
    fixtures.insert("agent1.username", "agent.one@example.com");
    fixtures.insert("agent1.password", "s3cret");

    let scenario = Scenario::from_yaml(
        r#"
name: two-agents
actors:
  first:
    credentials: agent1
  second:
    credentials: agent2
steps:
  - action: login
    actor: first
"#,
    )
    .unwrap();

    let result = runner_with(&browser, Arc::new(FakeHelpers::default()), fixtures)
        .run_scenario(&scenario)
        .await
        .unwrap();

    assert!(result.success, "{:?}", result.error);
    let log = browser.log();
    assert!(log.contains(&"first:navigate http://ccaas.test/login".to_string()));
    assert!(log.contains(&"first:fill #username=agent.one@example.com".to_string()));
    assert!(log.contains(&"first:fill #password=s3cret".to_string()));
    assert!(log.contains(&"second:open".to_string()));
    assert!(log.contains(&"second:close".to_string()));
}

#[tokio::test]
async fn test_login_without_fixture_fails() {
    let browser = FakeBrowser::default();
    let scenario = Scenario::from_yaml(
        r#"
name: no-credentials
steps:
  - action: login
    credentials: supervisor
"#,
    )
    .unwrap();

    let result = runner(&browser).run_scenario(&scenario).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureKind::Error));
    assert!(result.error.as_deref().unwrap().contains("supervisor.username"));
}

#[tokio::test]
async fn test_helper_steps_and_inbox_wait() {
    let browser = FakeBrowser::default();
    let helpers = Arc::new(FakeHelpers::default());
    {
        let mut inbox = helpers.inbox.lock().unwrap();
        inbox.push_back(vec![]);
        inbox.push_back(vec![EmailMessage {
            id: "m1".to_string(),
            from: "support@ccaas.test".to_string(),
            to: "customer@example.com".to_string(),
            subject: "Re: Ticket 7".to_string(),
            body: "resolved".to_string(),
        }]);
    }
    let mut fixtures = Fixtures::default();
    fixtures.insert("phone.caller", "+15550001");

    let scenario = Scenario::from_yaml(
        r#"
name: omnichannel
steps:
  - action: simulate_call
    from: '${fixture.phone.caller}'
    to: '+15559999'
  - action: fill
    selector: '#call-search'
    value: '${last_call_id}'
  - action: toggle_skill
    agent: agent1
    skill: sales
    enabled: false
  - action: wait_for_email
    to: customer@example.com
    subject_contains: Ticket 7
    into: reply
  - action: fill
    selector: '#reply-body'
    value: '${reply}'
"#,
    )
    .unwrap();

    let result = runner_with(&browser, helpers.clone(), fixtures)
        .run_scenario(&scenario)
        .await
        .unwrap();

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.steps[3].poll.as_ref().unwrap().attempts, 2);

    let calls = helpers.calls();
    assert_eq!(calls[0], "call +15550001->+15559999");
    assert_eq!(calls[1], "skill agent1 sales false");
    assert_eq!(calls.iter().filter(|c| c.starts_with("inbox")).count(), 2);

    let log = browser.log();
    assert!(log.contains(&"default:fill #call-search=call-42".to_string()));
    assert!(log.contains(&"default:fill #reply-body=resolved".to_string()));
}

#[tokio::test]
async fn test_unresolved_placeholder_fails_step() {
    let browser = FakeBrowser::default();
    let scenario = Scenario::from_yaml(
        r#"
name: typo
steps:
  - action: navigate
    url: '/reports/${report_id}'
"#,
    )
    .unwrap();

    let result = runner(&browser).run_scenario(&scenario).await.unwrap();

    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("report_id"));
}

#[tokio::test]
async fn test_suite_results_written() {
    let browser = FakeBrowser::default();
    browser.set_texts("#status", &["Ready"]);
    let dir = tempfile::tempdir().unwrap();

    let passing = Scenario::from_yaml(
        r#"
name: passing
steps:
  - action: assert
    selector: '#status'
    text: Ready
"#,
    )
    .unwrap();
    let failing = Scenario::from_yaml(
        r#"
name: failing
steps:
  - action: assert
    selector: '#status'
    visible: false
"#,
    )
    .unwrap();

    let mut runner = runner(&browser);
    let suite = runner.run_scenarios(&[passing, failing]).await.unwrap();
    assert_eq!(suite.total, 2);
    assert_eq!(suite.passed, 1);
    assert_eq!(suite.failed, 1);

    let path = ccaas_e2e::runner::write_results(dir.path(), &suite).unwrap();
    let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(json["results"][1]["failure"], "assertion");
}

#[test]
fn test_bundled_scenarios_and_config_parse() {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/e2e");

    let scenarios = Scenario::load_all(&root.join("scenarios")).unwrap();
    let names: Vec<&str> = scenarios.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["email-reply", "inbound-call-c2g", "report-run-count"]);
    assert_eq!(Scenario::filter_by_tag(&scenarios, "c2g").len(), 1);

    let config = HarnessConfig::from_file(&root.join("harness.toml")).unwrap();
    config.validate().unwrap();
    assert_eq!(config.profile("wallboard").unwrap().max_attempts, Some(20));
    assert!(config.profile("report_run_count").is_ok());
}

#[tokio::test]
async fn test_press_key_is_interpolated() {
    let browser = FakeBrowser::default();
    let mut fixtures = Fixtures::default();
    fixtures.insert("keys.submit", "Enter");

    let scenario = Scenario::from_yaml(
        r#"
name: keyboard-submit
steps:
  - action: press
    selector: '#search'
    key: '${fixture.keys.submit}'
"#,
    )
    .unwrap();

    let result = runner_with(&browser, Arc::new(FakeHelpers::default()), fixtures)
        .run_scenario(&scenario)
        .await
        .unwrap();

    assert!(result.success, "{:?}", result.error);
    assert_eq!(browser.count("default:press Enter"), 1);
}
