//! Optional consent sub-flow
//!
//! Some runs of the trigger open a consent modal whose continue button spawns a second browser
//! target on the identity provider. The branch follows that target on the primary page, approves
//! access, closes the target and re-triggers the action on the document.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use action_flow::{with_retries, FlowError, PageHandle, StepAction, TimeoutTier, WaitCondition};
use cdp_adapter::TargetSummary;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{Selectors, TaskConfig};
use crate::targets::discover_page_target;

/// Attempts in total, first run included
pub const MAX_ATTEMPTS: u32 = 3;

/// What the branch did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchOutcome {
    /// No consent prompt appeared
    Skipped,
    /// Access was approved and the action triggered again
    Authorized,
}

/// Progress carried from one attempt to the next.
#[derive(Default)]
struct RoundTrip {
    /// The continue button was clicked at least once, so the page has left its starting state.
    consent_seen: AtomicBool,
    approved: AtomicBool,
    last_error: Mutex<Option<FlowError>>,
}

impl RoundTrip {
    fn record(&self, err: &FlowError) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err.clone());
    }

    fn last_error(&self) -> Option<FlowError> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub struct AuthorizationBranch {
    selectors: Selectors,
    identity_origin: Url,
    document_url: Url,
    trigger_selector: String,
    on_resume: Option<Arc<dyn StepAction>>,
}

impl AuthorizationBranch {
    pub fn new(config: &TaskConfig, trigger_selector: impl Into<String>) -> Self {
        Self {
            selectors: config.selectors.clone(),
            identity_origin: config.urls.identity_origin.clone(),
            document_url: config.document_url().clone(),
            trigger_selector: trigger_selector.into(),
            on_resume: None,
        }
    }

    /// Run `hook` on the document after returning from the identity provider, before the
    /// trigger is clicked again.
    pub fn with_resume_hook(mut self, hook: Arc<dyn StepAction>) -> Self {
        self.on_resume = Some(hook);
        self
    }

    /// Handle the consent prompt if it shows up, retrying the whole round trip on failure.
    ///
    /// A retry starts from the document with the trigger clicked again. If the prompt does not
    /// come back, the branch succeeds only when an earlier attempt already approved access;
    /// otherwise the earlier failure is returned.
    pub async fn run(&self, page: &PageHandle) -> Result<BranchOutcome, FlowError> {
        let round_trip = RoundTrip::default();
        with_retries(
            MAX_ATTEMPTS,
            |attempt| self.attempt(page, &round_trip, attempt),
            |attempt, err: &FlowError| {
                round_trip.record(err);
                let error = err.to_string();
                self.report_failure(page, attempt, error)
            },
        )
        .await
    }

    async fn attempt(
        &self,
        page: &PageHandle,
        round_trip: &RoundTrip,
        attempt: u32,
    ) -> Result<BranchOutcome, FlowError> {
        let retrying = round_trip.consent_seen.load(Ordering::SeqCst);
        if retrying {
            info!(attempt, "restoring the document before retrying");
            self.resume(page).await?;
        }

        let consent = WaitCondition::ElementClickable(self.selectors.consent_continue.clone());
        match page.wait_for(&consent, TimeoutTier::Medium).await {
            Ok(()) => {}
            Err(err) if err.is_condition_timeout() => {
                if !retrying {
                    debug!(attempt, "no consent prompt");
                    return Ok(BranchOutcome::Skipped);
                }
                if round_trip.approved.load(Ordering::SeqCst) {
                    info!(attempt, "access was approved earlier and the action is triggered");
                    return Ok(BranchOutcome::Authorized);
                }
                return Err(round_trip.last_error().unwrap_or(err));
            }
            Err(err) => return Err(err),
        }

        info!(attempt, "consent required, following the identity provider");
        page.click_first_visible(&self.selectors.consent_continue).await?;
        round_trip.consent_seen.store(true, Ordering::SeqCst);
        page.settle(TimeoutTier::Large).await?;

        let target =
            discover_page_target(page, &self.identity_origin, TimeoutTier::Medium).await?;
        let approved = self.approve(page, &target).await;
        if let Err(err) = page.cdp().close_target(&target.target_id).await {
            warn!(target = %target.target_id, error = %err, "failed to close identity target");
        }
        approved?;
        round_trip.approved.store(true, Ordering::SeqCst);

        self.resume(page).await?;
        info!(attempt, "access approved");
        Ok(BranchOutcome::Authorized)
    }

    async fn approve(&self, page: &PageHandle, target: &TargetSummary) -> Result<(), FlowError> {
        page.goto(&target.url, TimeoutTier::Large).await?;
        page.settle(TimeoutTier::Large).await?;

        let chooser = WaitCondition::ElementClickable(self.selectors.account_chooser.clone());
        match page.wait_for(&chooser, TimeoutTier::Medium).await {
            Ok(()) => {
                page.click_first_visible(&self.selectors.account_chooser).await?;
                page.settle(TimeoutTier::Large).await?;
            }
            Err(err) if err.is_condition_timeout() => debug!("no account chooser"),
            Err(err) => return Err(err),
        }

        page.click_when_possible(&self.selectors.approve_access, TimeoutTier::Large).await?;
        page.settle(TimeoutTier::VeryLarge).await
    }

    /// Back on the document with the trigger clicked again.
    async fn resume(&self, page: &PageHandle) -> Result<(), FlowError> {
        page.goto(self.document_url.as_str(), TimeoutTier::Large).await?;
        match page.click_if_present(&self.selectors.unsupported_banner).await {
            Ok(true) => debug!("dismissed unsupported browser banner"),
            Ok(false) => {}
            Err(err) => debug!(error = %err, "ignoring banner dismissal failure"),
        }

        if let Some(hook) = &self.on_resume {
            hook.run(page).await?;
        }

        page.wait_for(
            &WaitCondition::ElementClickable(self.trigger_selector.clone()),
            TimeoutTier::Large,
        )
        .await?;
        page.click_first_visible(&self.trigger_selector).await?;
        page.settle(TimeoutTier::Large).await
    }

    async fn report_failure(&self, page: &PageHandle, attempt: u32, error: String) {
        match page.text_of(&self.selectors.butter_bar).await {
            Ok(Some(message)) if !message.trim().is_empty() => {
                warn!(attempt, %error, butter_bar = %message.trim(), "authorization attempt failed");
            }
            Ok(_) => warn!(attempt, %error, "authorization attempt failed"),
            Err(read_err) => {
                warn!(attempt, %error, "authorization attempt failed");
                debug!(error = %read_err, "could not read the butter bar");
            }
        }
    }
}
