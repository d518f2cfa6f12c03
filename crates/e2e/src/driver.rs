//! Browser automation surface consumed by the runner
//!
//! The runner only talks to these traits. [`crate::playwright`] implements
//! them on top of a Playwright process; tests use in-memory fakes.

use async_trait::async_trait;
use std::path::Path;

use crate::error::E2eResult;
use crate::spec::{Viewport, WaitState};

/// One actor's page, living in its own browser context
#[async_trait]
pub trait Page: Send + Sync {
    /// Navigate to an absolute URL
    async fn navigate(&self, url: &str) -> E2eResult<()>;

    async fn reload(&self) -> E2eResult<()>;

    async fn click(&self, selector: &str, timeout_ms: u64) -> E2eResult<()>;

    async fn fill(&self, selector: &str, value: &str) -> E2eResult<()>;

    /// Press a key on an element, or on the page when no selector is given
    async fn press(&self, selector: Option<&str>, key: &str) -> E2eResult<()>;

    async fn select(&self, selector: &str, value: &str) -> E2eResult<()>;

    async fn wait_for(&self, selector: &str, state: WaitState, timeout_ms: u64) -> E2eResult<()>;

    /// Rendered text of the first matching element
    async fn text(&self, selector: &str) -> E2eResult<String>;

    async fn is_visible(&self, selector: &str) -> E2eResult<bool>;

    async fn attribute(&self, selector: &str, name: &str) -> E2eResult<Option<String>>;

    async fn count(&self, selector: &str) -> E2eResult<usize>;

    async fn screenshot(&self, path: &Path, selector: Option<&str>, full_page: bool) -> E2eResult<()>;

    async fn close(&self) -> E2eResult<()>;
}

/// Source of isolated pages, one per simulated actor
#[async_trait]
pub trait Browser: Send + Sync {
    async fn new_page(&self, actor: &str, viewport: &Viewport) -> E2eResult<Box<dyn Page>>;

    async fn close(&self) -> E2eResult<()>;
}
