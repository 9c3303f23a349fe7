//! Task orchestration
//!
//! Launch → authenticate → open the document → trigger the action → optional authorization →
//! await completion → shutdown. The browser is closed on every path.

use std::sync::{Arc, PoisonError};
use std::time::Instant;

use action_flow::{
    action, DiagnosticCapture, FlowError, FlowResult, NoopAction, Outcome, PageHandle, Step,
    StepSequencer, TimeoutTier, WaitCondition,
};
use cdp_adapter::{metrics, Cdp, CdpAdapter, Key, PageId, RawEvent};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::authorization::{AuthorizationBranch, BranchOutcome};
use crate::completion::{CompletionObserver, NotificationFeed};
use crate::config::{Task, TaskConfig};
use crate::targets::discover_page_target;

const EVENT_BUFFER: usize = 1024;

type FeedSlot = Arc<Mutex<Option<NotificationFeed>>>;
type LinkSlot = Arc<std::sync::Mutex<Option<String>>>;

pub struct TaskOrchestrator {
    config: TaskConfig,
    sequencer: StepSequencer,
    project_link: LinkSlot,
}

impl TaskOrchestrator {
    pub fn new(config: TaskConfig) -> Self {
        let sequencer = StepSequencer::new(DiagnosticCapture::new(&config.screenshot_path));
        Self {
            config,
            sequencer,
            project_link: Arc::default(),
        }
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    /// Launch a local browser and run the task on it.
    pub async fn run(&self) -> Result<FlowResult, cdp_adapter::AdapterError> {
        let (bus, _) = cdp_adapter::event_bus(EVENT_BUFFER);
        let adapter = Arc::new(CdpAdapter::launch(self.config.cdp_config(), bus)?);
        Arc::clone(&adapter).start().await?;
        let result = self.run_with(Arc::clone(&adapter) as Arc<dyn Cdp>).await;
        debug!(target: "cdp-adapter", "metrics dump\n{}", adapter.metrics_text());
        Ok(result)
    }

    /// Run the task on an already started browser.
    pub async fn run_with(&self, cdp: Arc<dyn Cdp>) -> FlowResult {
        let started = Instant::now();
        let page = match cdp.create_page("about:blank").await {
            Ok(page) => page,
            Err(err) => {
                error!(error = %err, "failed to open a page");
                close_browser(cdp.as_ref()).await;
                return FlowResult {
                    outcome: Outcome::Failure {
                        step: None,
                        error: err.into(),
                        snapshot: None,
                    },
                    steps: Vec::new(),
                    total_duration_ms: started.elapsed().as_millis() as u64,
                };
            }
        };

        let viewport = self.config.viewport;
        if let Err(err) = cdp
            .set_device_metrics(page, viewport.width, viewport.height, 1.0, false)
            .await
        {
            warn!(error = %err, "could not set the viewport");
        }

        let console = forward_console(cdp.as_ref(), page);
        let handle = PageHandle::new(Arc::clone(&cdp), page, self.config.tiers);
        let result = self.sequencer.run(&handle, &self.steps()).await;

        console.abort();
        close_browser(cdp.as_ref()).await;
        let snapshot = metrics::snapshot();
        debug!(
            commands = snapshot.commands,
            failures = snapshot.command_failures,
            events = snapshot.events,
            navigation_failures = snapshot.navigation_failures,
            binding_calls = snapshot.binding_calls,
            "adapter metrics"
        );
        result
    }

    /// The task as an ordered list of steps.
    pub fn steps(&self) -> Vec<Step> {
        let mut steps = self.sign_in_steps();
        match &self.config.task {
            Task::Update {
                trigger_selector,
                terminal_message,
            } => steps.extend(self.update_steps(trigger_selector, terminal_message)),
            Task::ProjectLink => steps.extend(self.project_link_steps()),
        }
        steps
    }

    /// Link read by the last project-link run, if it got that far.
    pub fn project_link(&self) -> Option<String> {
        self.project_link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn sign_in_steps(&self) -> Vec<Step> {
        let config = &self.config;
        let sign_in = config.urls.sign_in.to_string();
        let username = config.credentials.username.clone();
        let password = config.credentials.password.clone();
        let document = config.document_url().to_string();

        vec![
            Step::new(
                "Loaded sign in page",
                action(move |page| {
                    let url = sign_in.clone();
                    async move { page.goto(&url, TimeoutTier::Large).await }
                }),
            ),
            Step::new(
                "Entered username",
                action(move |page| {
                    let username = username.clone();
                    async move {
                        page.type_keystrokes(&username).await?;
                        page.press(Key::Enter).await
                    }
                }),
            ),
            Step::new(
                "Entered password",
                action(move |page| {
                    let password = password.clone();
                    async move {
                        page.type_keystrokes(&password).await?;
                        page.press(Key::Enter).await
                    }
                }),
            )
            .wait_for(
                WaitCondition::ElementClickable(config.selectors.password_gate.clone()),
                TimeoutTier::Large,
            ),
            Step::checkpoint(
                "Signed in",
                WaitCondition::SelectorPresent(config.selectors.signed_in_marker.clone()),
                TimeoutTier::Large,
            ),
            Step::new(
                "Opened spreadsheet",
                action(move |page| {
                    let url = document.clone();
                    async move { page.goto(&url, TimeoutTier::Large).await }
                }),
            ),
            banner_step(
                "Checked unsupported browser banner",
                &config.selectors.unsupported_banner,
            ),
        ]
    }

    fn update_steps(&self, trigger_selector: &str, terminal_message: &str) -> Vec<Step> {
        let config = &self.config;
        let feed: FeedSlot = Arc::new(Mutex::new(None));
        let notification_root = config.selectors.notification_root.clone();
        let trigger = trigger_selector.to_string();

        let rearm = {
            let feed = Arc::clone(&feed);
            action(move |page| {
                let feed = Arc::clone(&feed);
                async move {
                    match feed.lock().await.as_ref() {
                        Some(feed) => feed.arm(&page).await,
                        None => Ok(()),
                    }
                }
            })
        };
        let branch = Arc::new(
            AuthorizationBranch::new(config, trigger_selector).with_resume_hook(rearm),
        );
        let observer = CompletionObserver::new(
            terminal_message,
            config.tiers.duration(TimeoutTier::VeryLarge),
        );

        vec![
            Step::new("Watching notifications", {
                let feed = Arc::clone(&feed);
                action(move |page| {
                    let feed = Arc::clone(&feed);
                    let root = notification_root.clone();
                    async move {
                        let installed = NotificationFeed::install(&page, &root).await?;
                        *feed.lock().await = Some(installed);
                        Ok(())
                    }
                })
            }),
            Step::new(
                "Clicked trigger",
                action(move |page| {
                    let trigger = trigger.clone();
                    async move { page.click_first_visible(&trigger).await }
                }),
            )
            .wait_for(
                WaitCondition::ElementClickable(trigger_selector.to_string()),
                TimeoutTier::Large,
            ),
            Step::new(
                "Authorization checked",
                action(move |page| {
                    let branch = Arc::clone(&branch);
                    async move {
                        match branch.run(&page).await? {
                            BranchOutcome::Skipped => debug!("authorization not needed"),
                            BranchOutcome::Authorized => info!("authorization granted"),
                        }
                        Ok(())
                    }
                }),
            ),
            Step::new("Update completed", {
                let feed = Arc::clone(&feed);
                action(move |_page| {
                    let feed = Arc::clone(&feed);
                    let observer = observer.clone();
                    async move {
                        let mut feed = feed.lock().await.take().ok_or_else(|| {
                            FlowError::step("Update completed", "notification feed not installed")
                        })?;
                        match feed.await_terminal(&observer).await.into_error() {
                            None => Ok(()),
                            Some(err) => Err(err),
                        }
                    }
                })
            }),
        ]
    }

    fn project_link_steps(&self) -> Vec<Step> {
        let selectors = &self.config.selectors;
        let tools_menu = selectors.tools_menu.clone();
        let script_editor_item = selectors.script_editor_item.clone();
        let resources_menu = selectors.resources_menu.clone();
        let cloud_project_item = selectors.cloud_project_item.clone();
        let project_link = selectors.project_link.clone();
        let script_origin = self.config.urls.script_origin.clone();
        let slot = Arc::clone(&self.project_link);

        vec![
            click_step("Opened tools menu", &tools_menu, TimeoutTier::Large, None),
            click_step(
                "Opened script editor",
                &script_editor_item,
                TimeoutTier::Medium,
                Some(TimeoutTier::Medium),
            ),
            Step::new(
                "Followed script editor",
                action(move |page| {
                    let origin = script_origin.clone();
                    async move {
                        let target =
                            discover_page_target(&page, &origin, TimeoutTier::Medium).await?;
                        page.goto(&target.url, TimeoutTier::Large).await?;
                        page.settle(TimeoutTier::Medium).await?;
                        if let Err(err) = page.cdp().close_target(&target.target_id).await {
                            warn!(target = %target.target_id, error = %err, "failed to close script editor target");
                        }
                        Ok(())
                    }
                }),
            ),
            banner_step("Checked script editor banner", &selectors.unsupported_banner),
            click_step("Opened resources menu", &resources_menu, TimeoutTier::Large, None),
            click_step(
                "Opened cloud project dialog",
                &cloud_project_item,
                TimeoutTier::Medium,
                Some(TimeoutTier::Medium),
            ),
            Step::new(
                "Found project link",
                action(move |page| {
                    let selector = project_link.clone();
                    let slot = Arc::clone(&slot);
                    async move {
                        let href = page.attribute_of(&selector, "href").await?.ok_or_else(|| {
                            FlowError::TargetNotFound(format!("{selector} has no href"))
                        })?;
                        info!(%href, "found project link");
                        *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(href);
                        Ok(())
                    }
                }),
            )
            .wait_for(
                WaitCondition::SelectorPresent(selectors.project_link.clone()),
                TimeoutTier::Large,
            ),
        ]
    }
}

/// Click `selector` once it is clickable within `tier`, then optionally let the network settle.
fn click_step(name: &str, selector: &str, tier: TimeoutTier, settle: Option<TimeoutTier>) -> Step {
    let target = selector.to_string();
    Step::new(
        name,
        action(move |page| {
            let target = target.clone();
            async move {
                page.click_first_visible(&target).await?;
                match settle {
                    Some(tier) => page.settle(tier).await,
                    None => Ok(()),
                }
            }
        }),
    )
    .wait_for(WaitCondition::ElementClickable(selector.to_string()), tier)
}

/// Dismiss the unsupported browser banner when it shows up. Its absence is not a failure; a
/// failed click is.
fn banner_step(name: &str, banner: &str) -> Step {
    let selector = banner.to_string();
    Step::new(
        name,
        action(move |page| {
            let selector = selector.clone();
            async move {
                page.click_first_visible(&selector).await?;
                page.settle(TimeoutTier::Large).await?;
                info!("dismissed unsupported browser banner");
                Ok(())
            }
        }),
    )
    .wait_for(WaitCondition::SelectorPresent(banner.to_string()), TimeoutTier::Small)
    .with_recovery(Arc::new(NoopAction))
}

async fn close_browser(cdp: &dyn Cdp) {
    if let Err(err) = cdp.close().await {
        warn!(error = %err, "failed to close the browser");
    }
}

/// Mirror the page console into the log under the `page-console` target.
fn forward_console(cdp: &dyn Cdp, page: PageId) -> JoinHandle<()> {
    let mut events = cdp.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(RawEvent::ConsoleMessage {
                    page: source,
                    level,
                    text,
                }) if source == page => match level.as_str() {
                    "error" => warn!(target: "page-console", %level, "{text}"),
                    _ => debug!(target: "page-console", %level, "{text}"),
                },
                Ok(RawEvent::Error {
                    page: Some(source),
                    message,
                }) if source == page => debug!(target: "page-console", "{message}"),
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FileConfig, TaskKind};

    fn config(kind: TaskKind) -> TaskConfig {
        let vars = [
            ("GOOGLE_USERNAME", "robot@example.com"),
            ("GOOGLE_PASSWORD", "secret"),
            ("SHEET_ID", "sheet"),
            ("CLICK_ON_SELECTOR", "#trigger"),
            ("TOAST_MESSAGE", "Update all: Done!"),
        ];
        let mut file = FileConfig::default();
        file.task.kind = Some(kind);
        TaskConfig::from_sources(
            |key| {
                vars.iter()
                    .find(|(k, _)| *k == key)
                    .map(|(_, v)| v.to_string())
            },
            file,
        )
        .unwrap()
    }

    fn step_names(kind: TaskKind) -> Vec<String> {
        TaskOrchestrator::new(config(kind))
            .steps()
            .iter()
            .map(|step| step.name().to_string())
            .collect()
    }

    #[test]
    fn steps_follow_the_task_order() {
        assert_eq!(
            step_names(TaskKind::Update),
            vec![
                "Loaded sign in page",
                "Entered username",
                "Entered password",
                "Signed in",
                "Opened spreadsheet",
                "Checked unsupported browser banner",
                "Watching notifications",
                "Clicked trigger",
                "Authorization checked",
                "Update completed",
            ]
        );
    }

    #[test]
    fn project_link_shares_the_sign_in_steps() {
        let names = step_names(TaskKind::ProjectLink);
        assert_eq!(names[..6], step_names(TaskKind::Update)[..6]);
        assert_eq!(
            names[6..],
            [
                "Opened tools menu",
                "Opened script editor",
                "Followed script editor",
                "Checked script editor banner",
                "Opened resources menu",
                "Opened cloud project dialog",
                "Found project link",
            ]
        );
    }
}
