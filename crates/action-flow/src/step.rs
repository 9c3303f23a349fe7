//! Named steps with an optional precondition and recovery continuation

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::errors::FlowError;
use crate::page::PageHandle;
use crate::types::StepStatus;
use crate::waiter::{TimeoutTier, WaitCondition};

/// Work performed by a step against the primary page
#[async_trait]
pub trait StepAction: Send + Sync {
    async fn run(&self, page: &PageHandle) -> Result<(), FlowError>;
}

/// Adapter turning an async closure into a [`StepAction`]
pub struct FnAction<F>(F);

#[async_trait]
impl<F, Fut> StepAction for FnAction<F>
where
    F: Fn(PageHandle) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), FlowError>> + Send,
{
    async fn run(&self, page: &PageHandle) -> Result<(), FlowError> {
        (self.0)(page.clone()).await
    }
}

/// Action that does nothing; used by wait-only steps and to skip an absent optional element.
pub struct NoopAction;

#[async_trait]
impl StepAction for NoopAction {
    async fn run(&self, _page: &PageHandle) -> Result<(), FlowError> {
        Ok(())
    }
}

/// Wrap an async closure as a shareable step action.
pub fn action<F, Fut>(f: F) -> Arc<dyn StepAction>
where
    F: Fn(PageHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), FlowError>> + Send + 'static,
{
    Arc::new(FnAction(f))
}

/// One logical action in a task
pub struct Step {
    name: String,
    precondition: Option<(WaitCondition, TimeoutTier)>,
    action: Arc<dyn StepAction>,
    recovery: Option<Arc<dyn StepAction>>,
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("precondition", &self.precondition)
            .field("recovery", &self.recovery.is_some())
            .finish()
    }
}

impl Step {
    pub fn new(name: impl Into<String>, action: Arc<dyn StepAction>) -> Self {
        Self {
            name: name.into(),
            precondition: None,
            action,
            recovery: None,
        }
    }

    /// Step whose only job is its precondition
    pub fn checkpoint(name: impl Into<String>, condition: WaitCondition, tier: TimeoutTier) -> Self {
        Self::new(name, Arc::new(NoopAction)).wait_for(condition, tier)
    }

    /// Require `condition` within `tier` before the action runs
    pub fn wait_for(mut self, condition: WaitCondition, tier: TimeoutTier) -> Self {
        self.precondition = Some((condition, tier));
        self
    }

    /// Run `recovery` instead of the action when the precondition is not met within its tier.
    ///
    /// Only a precondition timeout is recovered. Errors from the action itself, and adapter
    /// failures while checking the precondition, still fail the step.
    pub fn with_recovery(mut self, recovery: Arc<dyn StepAction>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn run(&self, page: &PageHandle) -> Result<StepStatus, FlowError> {
        if let Some((condition, tier)) = &self.precondition {
            match (page.wait_for(condition, *tier).await, &self.recovery) {
                (Ok(()), _) => {}
                (Err(err), Some(recovery)) if err.is_condition_timeout() => {
                    info!(step = %self.name, error = %err, "taking recovery path");
                    recovery.run(page).await.map_err(|recovery_err| {
                        warn!(step = %self.name, error = %recovery_err, "recovery path failed");
                        recovery_err
                    })?;
                    return Ok(StepStatus::Recovered);
                }
                (Err(err), _) => return Err(err),
            }
        }
        self.action.run(page).await?;
        Ok(StepStatus::Completed)
    }
}
