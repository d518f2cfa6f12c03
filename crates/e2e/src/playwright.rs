//! Playwright browser automation
//!
//! A single `node` process runs the bridge script below and keeps the browser
//! open for the whole run. Requests and replies are JSON lines on
//! stdin/stdout, correlated by id. Each actor page gets its own browser context
//! so agents and supervisors do not share cookies.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command as TokioCommand};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use ccaas_common::config::BrowserConfig;

use crate::driver::{Browser, Page};
use crate::error::{E2eError, E2eResult};
use crate::spec::{Viewport, WaitState};

const BRIDGE_SCRIPT: &str = r#"
const playwright = require('playwright');
const readline = require('readline');

const kind = process.env.CCAAS_PW_BROWSER || 'chromium';
const headless = process.env.CCAAS_PW_HEADLESS !== 'false';
const actionTimeout = parseInt(process.env.CCAAS_PW_TIMEOUT || '10000', 10);

let browser = null;
const pages = new Map();

function page(id) {
  const p = pages.get(id);
  if (!p) throw new Error(`unknown page ${id}`);
  return p;
}

async function handle(op, a) {
  switch (op) {
    case 'launch':
      browser = await playwright[kind].launch({ headless });
      return null;
    case 'new_page': {
      const context = await browser.newContext({ viewport: { width: a.width, height: a.height } });
      const p = await context.newPage();
      p.setDefaultTimeout(actionTimeout);
      pages.set(a.page, p);
      return null;
    }
    case 'goto':
      await page(a.page).goto(a.url);
      return null;
    case 'reload':
      await page(a.page).reload();
      return null;
    case 'click':
      await page(a.page).click(a.selector, { timeout: a.timeout });
      return null;
    case 'fill':
      await page(a.page).fill(a.selector, a.value);
      return null;
    case 'press':
      if (a.selector) await page(a.page).locator(a.selector).press(a.key);
      else await page(a.page).keyboard.press(a.key);
      return null;
    case 'select':
      await page(a.page).selectOption(a.selector, a.value);
      return null;
    case 'wait_for':
      await page(a.page).waitForSelector(a.selector, { state: a.state, timeout: a.timeout });
      return null;
    case 'text':
      return await page(a.page).locator(a.selector).first().innerText();
    case 'visible':
      return await page(a.page).locator(a.selector).first().isVisible();
    case 'attribute':
      return await page(a.page).locator(a.selector).first().getAttribute(a.name);
    case 'count':
      return await page(a.page).locator(a.selector).count();
    case 'screenshot':
      if (a.selector) await page(a.page).locator(a.selector).screenshot({ path: a.path });
      else await page(a.page).screenshot({ path: a.path, fullPage: a.full_page });
      return null;
    case 'close_page': {
      const p = pages.get(a.page);
      pages.delete(a.page);
      if (p) await p.context().close();
      return null;
    }
    case 'close':
      if (browser) await browser.close();
      browser = null;
      return null;
    default:
      throw new Error(`unknown op ${op}`);
  }
}

function reply(msg) {
  process.stdout.write(JSON.stringify(msg) + '\n');
}

let chain = Promise.resolve();
const rl = readline.createInterface({ input: process.stdin });
rl.on('line', (line) => {
  chain = chain.then(async () => {
    let req = null;
    try {
      req = JSON.parse(line);
      const result = await handle(req.op, req.args || {});
      reply({ id: req.id, ok: true, result: result === undefined ? null : result });
    } catch (error) {
      reply({ id: req ? req.id : null, ok: false, error: error.message });
    }
  });
});
rl.on('close', async () => {
  await chain;
  if (browser) await browser.close();
  process.exit(0);
});
"#;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BrowserKind {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl BrowserKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrowserKind::Chromium => "chromium",
            BrowserKind::Firefox => "firefox",
            BrowserKind::Webkit => "webkit",
        }
    }
}

impl FromStr for BrowserKind {
    type Err = E2eError;

    fn from_str(s: &str) -> E2eResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "chromium" | "chrome" => Ok(BrowserKind::Chromium),
            "firefox" => Ok(BrowserKind::Firefox),
            "webkit" | "safari" => Ok(BrowserKind::Webkit),
            other => Err(E2eError::Playwright(format!("unsupported browser: {}", other))),
        }
    }
}

/// Configuration for Playwright
#[derive(Debug, Clone)]
pub struct PlaywrightConfig {
    pub browser: BrowserKind,
    pub headless: bool,
    pub action_timeout_ms: u64,
    pub node_binary: PathBuf,
    /// Directory holding the `playwright` npm package (NODE_PATH)
    pub node_path: Option<PathBuf>,
}

impl PlaywrightConfig {
    pub fn from_browser_config(config: &BrowserConfig) -> E2eResult<Self> {
        Ok(Self {
            browser: config.kind.parse()?,
            headless: config.headless,
            action_timeout_ms: config.action_timeout_ms,
            node_binary: PathBuf::from(&config.node_binary),
            node_path: None,
        })
    }

    fn resolved_node_path(&self) -> E2eResult<PathBuf> {
        match &self.node_path {
            Some(path) => Ok(path.clone()),
            None => Ok(std::env::current_dir()?.join("node_modules")),
        }
    }
}

impl Default for PlaywrightConfig {
    fn default() -> Self {
        Self {
            browser: BrowserKind::Chromium,
            headless: true,
            action_timeout_ms: 10_000,
            node_binary: PathBuf::from("node"),
            node_path: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Reply {
    id: Option<u64>,
    ok: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

struct BridgeIo {
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

/// The node process and its pipes
struct Bridge {
    io: Mutex<BridgeIo>,
    child: Mutex<Child>,
    next_id: AtomicU64,
    // Holds the script file for the lifetime of the process
    _script_dir: tempfile::TempDir,
}

impl Bridge {
    async fn call(&self, op: &str, args: Value) -> E2eResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut line = serde_json::to_string(&json!({ "id": id, "op": op, "args": args }))?;
        line.push('\n');

        let mut io = self.io.lock().await;
        io.stdin.write_all(line.as_bytes()).await?;
        io.stdin.flush().await?;

        loop {
            let Some(raw) = io.stdout.next_line().await? else {
                return Err(E2eError::Playwright("bridge process exited".to_string()));
            };

            let reply: Reply = match serde_json::from_str(&raw) {
                Ok(reply) => reply,
                Err(_) => {
                    debug!(line = %raw, "bridge output");
                    continue;
                }
            };

            // A reply to a request whose caller gave up (e.g. poll deadline)
            if reply.id != Some(id) {
                debug!(expected = id, got = ?reply.id, "discarding stale bridge reply");
                continue;
            }

            return if reply.ok {
                Ok(reply.result)
            } else {
                Err(E2eError::Playwright(format!(
                    "{}: {}",
                    op,
                    reply.error.unwrap_or_else(|| "unknown error".to_string())
                )))
            };
        }
    }
}

/// Playwright-backed [`Browser`]
pub struct PlaywrightBrowser {
    bridge: Arc<Bridge>,
    config: PlaywrightConfig,
}

impl PlaywrightBrowser {
    /// Start the bridge process and launch the browser
    pub async fn launch(config: PlaywrightConfig) -> E2eResult<Self> {
        let node_path = config.resolved_node_path()?;
        Self::check_playwright_installed(&config.node_binary, &node_path).await?;

        let script_dir = tempfile::tempdir()?;
        let script_path = script_dir.path().join("bridge.js");
        std::fs::write(&script_path, BRIDGE_SCRIPT)?;

        debug!("Starting Playwright bridge: {}", script_path.display());

        let mut child = TokioCommand::new(&config.node_binary)
            .arg(&script_path)
            .env("NODE_PATH", &node_path)
            .env("CCAAS_PW_BROWSER", config.browser.as_str())
            .env("CCAAS_PW_HEADLESS", config.headless.to_string())
            .env("CCAAS_PW_TIMEOUT", config.action_timeout_ms.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| E2eError::Playwright(format!("failed to spawn {}: {}", config.node_binary.display(), e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| E2eError::Playwright("bridge stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| E2eError::Playwright("bridge stdout unavailable".to_string()))?;

        let bridge = Arc::new(Bridge {
            io: Mutex::new(BridgeIo {
                stdin,
                stdout: BufReader::new(stdout).lines(),
            }),
            child: Mutex::new(child),
            next_id: AtomicU64::new(1),
            _script_dir: script_dir,
        });

        bridge.call("launch", json!({})).await?;
        info!(browser = config.browser.as_str(), headless = config.headless, "browser launched");

        Ok(Self { bridge, config })
    }

    /// Check that node can resolve the playwright package
    async fn check_playwright_installed(node: &Path, node_path: &Path) -> E2eResult<()> {
        let status = TokioCommand::new(node)
            .args(["-e", "require.resolve('playwright')"])
            .env("NODE_PATH", node_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) if status.success() => Ok(()),
            _ => Err(E2eError::PlaywrightNotFound),
        }
    }

    pub fn config(&self) -> &PlaywrightConfig {
        &self.config
    }
}

#[async_trait]
impl Browser for PlaywrightBrowser {
    async fn new_page(&self, actor: &str, viewport: &Viewport) -> E2eResult<Box<dyn Page>> {
        let id = format!("{}-{}", actor, self.bridge.next_id.load(Ordering::Relaxed));
        self.bridge
            .call(
                "new_page",
                json!({ "page": id, "width": viewport.width, "height": viewport.height }),
            )
            .await?;
        debug!(actor, page = %id, "page opened");

        Ok(Box::new(PlaywrightPage {
            bridge: Arc::clone(&self.bridge),
            id,
        }))
    }

    async fn close(&self) -> E2eResult<()> {
        if let Err(e) = self.bridge.call("close", json!({})).await {
            warn!("browser close failed: {}", e);
        }

        // Closing stdin ends the bridge's read loop
        {
            let mut io = self.bridge.io.lock().await;
            let _ = io.stdin.shutdown().await;
        }

        let mut child = self.bridge.child.lock().await;
        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "bridge exited"),
            _ => {
                warn!("bridge did not exit, killing it");
                let _ = child.kill().await;
            }
        }
        Ok(())
    }
}

/// One actor's page inside the bridge
pub struct PlaywrightPage {
    bridge: Arc<Bridge>,
    id: String,
}

impl PlaywrightPage {
    async fn call(&self, op: &str, mut args: Value) -> E2eResult<Value> {
        if let Value::Object(map) = &mut args {
            map.insert("page".to_string(), Value::String(self.id.clone()));
        }
        self.bridge.call(op, args).await
    }
}

#[async_trait]
impl Page for PlaywrightPage {
    async fn navigate(&self, url: &str) -> E2eResult<()> {
        self.call("goto", json!({ "url": url })).await.map(drop)
    }

    async fn reload(&self) -> E2eResult<()> {
        self.call("reload", json!({})).await.map(drop)
    }

    async fn click(&self, selector: &str, timeout_ms: u64) -> E2eResult<()> {
        self.call("click", json!({ "selector": selector, "timeout": timeout_ms }))
            .await
            .map(drop)
    }

    async fn fill(&self, selector: &str, value: &str) -> E2eResult<()> {
        self.call("fill", json!({ "selector": selector, "value": value }))
            .await
            .map(drop)
    }

    async fn press(&self, selector: Option<&str>, key: &str) -> E2eResult<()> {
        self.call("press", json!({ "selector": selector, "key": key }))
            .await
            .map(drop)
    }

    async fn select(&self, selector: &str, value: &str) -> E2eResult<()> {
        self.call("select", json!({ "selector": selector, "value": value }))
            .await
            .map(drop)
    }

    async fn wait_for(&self, selector: &str, state: WaitState, timeout_ms: u64) -> E2eResult<()> {
        self.call(
            "wait_for",
            json!({ "selector": selector, "state": state.as_str(), "timeout": timeout_ms }),
        )
        .await
        .map(drop)
    }

    async fn text(&self, selector: &str) -> E2eResult<String> {
        match self.call("text", json!({ "selector": selector })).await? {
            Value::String(text) => Ok(text),
            other => Err(E2eError::Playwright(format!("text returned {}", other))),
        }
    }

    async fn is_visible(&self, selector: &str) -> E2eResult<bool> {
        let value = self.call("visible", json!({ "selector": selector })).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn attribute(&self, selector: &str, name: &str) -> E2eResult<Option<String>> {
        let value = self
            .call("attribute", json!({ "selector": selector, "name": name }))
            .await?;
        Ok(value.as_str().map(String::from))
    }

    async fn count(&self, selector: &str) -> E2eResult<usize> {
        let value = self.call("count", json!({ "selector": selector })).await?;
        value
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| E2eError::Playwright(format!("count returned {}", value)))
    }

    async fn screenshot(&self, path: &Path, selector: Option<&str>, full_page: bool) -> E2eResult<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        self.call(
            "screenshot",
            json!({
                "path": path.to_string_lossy(),
                "selector": selector,
                "full_page": full_page,
            }),
        )
        .await
        .map(drop)
    }

    async fn close(&self) -> E2eResult<()> {
        self.call("close_page", json!({})).await.map(drop)
    }
}
