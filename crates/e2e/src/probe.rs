//! Reachability probe for the product under test

use ccaas_common::{Expected, PollBounds, Retrier};
use std::time::Duration;
use tracing::info;

use crate::error::{E2eError, E2eResult};

/// Poll `url` until it answers without a server error. Returns the attempts used.
pub async fn wait_until_reachable(url: &str, bounds: PollBounds) -> E2eResult<u32> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()?;

    info!(url, "waiting for product to become reachable");

    let expected = Expected::satisfies("HTTP status below 500", |status: &u16| *status < 500);
    let report = Retrier::new(bounds)
        .with_label("reachability")
        .poll(&expected, |_| {
            let request = client.get(url).send();
            async move { request.await.map(|resp| resp.status().as_u16()) }
        })
        .await;

    if report.success {
        info!(url, attempts = report.attempts, "product is reachable");
        Ok(report.attempts)
    } else {
        Err(E2eError::Unreachable {
            url: url.to_string(),
            attempts: report.attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_port_reports_attempts() {
        // Port 9 (discard) is closed on loopback in CI containers
        let bounds = PollBounds::attempts(2, Duration::from_millis(10)).unwrap();
        let err = wait_until_reachable("http://127.0.0.1:9/", bounds).await.unwrap_err();

        match err {
            E2eError::Unreachable { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("expected unreachable, got {:?}", other),
        }
    }
}
