//! Condition-based waiting with tiered timeouts

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use cdp_adapter::{AdapterErrorKind, Cdp, PageId, QuerySpec, WaitGate};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::errors::FlowError;

/// Interval between condition checks
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long the network must stay without request activity to count as idle
pub const NETWORK_IDLE_WINDOW: Duration = Duration::from_millis(1_000);

/// Requests allowed to stay pending while the network still counts as idle.
///
/// Google front-ends keep a couple of long-poll channels open for the lifetime of the page.
pub const NETWORK_IDLE_MAX_INFLIGHT: u32 = 2;

/// Named timeout budgets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeoutTier {
    Small,
    Medium,
    Large,
    VeryLarge,
}

/// Concrete durations behind each tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutTiers {
    pub small: Duration,
    pub medium: Duration,
    pub large: Duration,
    pub very_large: Duration,
}

impl Default for TimeoutTiers {
    fn default() -> Self {
        Self {
            small: Duration::from_millis(100),
            medium: Duration::from_secs(2),
            large: Duration::from_secs(30),
            very_large: Duration::from_secs(120),
        }
    }
}

impl TimeoutTiers {
    pub fn duration(&self, tier: TimeoutTier) -> Duration {
        match tier {
            TimeoutTier::Small => self.small,
            TimeoutTier::Medium => self.medium,
            TimeoutTier::Large => self.large,
            TimeoutTier::VeryLarge => self.very_large,
        }
    }
}

/// Conditions the waiter can observe on a page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitCondition {
    /// At least one element matches the selector
    SelectorPresent(String),
    /// No requests in flight for the quiet window
    NetworkIdle,
    /// Some match of the selector is visible and not disabled
    ElementClickable(String),
}

impl fmt::Display for WaitCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitCondition::SelectorPresent(selector) => write!(f, "selector {selector} present"),
            WaitCondition::NetworkIdle => write!(f, "network idle"),
            WaitCondition::ElementClickable(selector) => {
                write!(f, "element {selector} clickable")
            }
        }
    }
}

/// Polls a page until a condition holds or its tier runs out
#[derive(Clone)]
pub struct ConditionWaiter {
    cdp: Arc<dyn Cdp>,
    page: PageId,
    tiers: TimeoutTiers,
}

impl ConditionWaiter {
    pub fn new(cdp: Arc<dyn Cdp>, page: PageId, tiers: TimeoutTiers) -> Self {
        Self { cdp, page, tiers }
    }

    pub fn tiers(&self) -> &TimeoutTiers {
        &self.tiers
    }

    pub fn cdp(&self) -> &Arc<dyn Cdp> {
        &self.cdp
    }

    pub fn page(&self) -> PageId {
        self.page
    }

    /// Wait for `condition` within the budget of `tier`.
    ///
    /// Returns [`FlowError::ConditionTimeout`] when the budget runs out. Adapter failures during
    /// a check are returned as they happen.
    pub async fn wait_for(
        &self,
        condition: &WaitCondition,
        tier: TimeoutTier,
    ) -> Result<(), FlowError> {
        let timeout = self.tiers.duration(tier);
        debug!(%condition, ?tier, timeout_ms = timeout.as_millis() as u64, "waiting");

        match condition {
            WaitCondition::NetworkIdle => self.wait_network_idle(condition, timeout).await,
            _ => self.poll(condition, timeout).await,
        }
    }

    async fn poll(&self, condition: &WaitCondition, timeout: Duration) -> Result<(), FlowError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.check(condition).await? {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(timed_out(condition, timeout));
            }
            sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn check(&self, condition: &WaitCondition) -> Result<bool, FlowError> {
        match condition {
            WaitCondition::SelectorPresent(selector) => {
                let anchors = self
                    .cdp
                    .query(self.page, QuerySpec::document(selector.as_str()))
                    .await?;
                Ok(!anchors.is_empty())
            }
            WaitCondition::ElementClickable(selector) => {
                let anchors = self
                    .cdp
                    .query(self.page, QuerySpec::document(selector.as_str()))
                    .await?;
                Ok(anchors.iter().any(|anchor| anchor.is_clickable()))
            }
            WaitCondition::NetworkIdle => Ok(true),
        }
    }

    async fn wait_network_idle(
        &self,
        condition: &WaitCondition,
        timeout: Duration,
    ) -> Result<(), FlowError> {
        let window = NETWORK_IDLE_WINDOW.min(timeout / 2);
        let gate = WaitGate::NetworkQuiet {
            window_ms: window.as_millis() as u64,
            max_inflight: NETWORK_IDLE_MAX_INFLIGHT,
        };
        match self.cdp.wait_basic(self.page, gate, timeout).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind == AdapterErrorKind::NavTimeout => {
                Err(timed_out(condition, timeout))
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn timed_out(condition: &WaitCondition, timeout: Duration) -> FlowError {
    FlowError::ConditionTimeout {
        condition: condition.to_string(),
        timeout_ms: timeout.as_millis() as u64,
    }
}
