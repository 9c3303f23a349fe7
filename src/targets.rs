//! Secondary browser targets
//!
//! Some menu entries open their content in a new target instead of the primary page. These
//! helpers find such a target by origin so the primary page can follow it.

use std::time::Duration;

use action_flow::{FlowError, PageHandle, TimeoutTier};
use cdp_adapter::TargetSummary;
use tokio::time::{sleep, Instant};
use tracing::debug;
use url::Url;

const TARGET_POLL: Duration = Duration::from_millis(100);

/// True when `raw` parses as a url with the same scheme, host and port as `origin`.
pub fn is_same_origin(origin: &Url, raw: &str) -> bool {
    Url::parse(raw)
        .map(|url| url.origin() == origin.origin())
        .unwrap_or(false)
}

/// First page target on `origin`, polled until the budget of `tier` runs out.
pub async fn discover_page_target(
    page: &PageHandle,
    origin: &Url,
    tier: TimeoutTier,
) -> Result<TargetSummary, FlowError> {
    let deadline = Instant::now() + page.timeout(tier);
    loop {
        let targets = page.cdp().list_targets().await?;
        if let Some(target) = targets
            .into_iter()
            .find(|target| target.is_page() && is_same_origin(origin, &target.url))
        {
            debug!(target = %target.target_id, url = %target.url, "found page target");
            return Ok(target);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(FlowError::TargetNotFound(format!(
                "no page target on {}",
                origin.origin().ascii_serialization()
            )));
        }
        sleep(TARGET_POLL.min(deadline - now)).await;
    }
}
