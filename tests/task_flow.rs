//! End-to-end runs of the task against the scripted browser.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use action_flow::{FlowError, Outcome};
use cdp_adapter::fake::{FakeBrowser, FakeCall, FakeEffect, FakeElement};
use cdp_adapter::TargetSummary;
use sheet_autopilot::completion::NOTIFICATION_BINDING;
use sheet_autopilot::config::FileConfig;
use sheet_autopilot::{TaskConfig, TaskOrchestrator};

const TRIGGER: &str = "#update-all";
const IDENTITY_URL: &str = "https://accounts.google.com/o/oauth2/auth?client_id=sheet";

fn task_config(screenshot_dir: &Path) -> TaskConfig {
    let vars: HashMap<&str, &str> = [
        ("GOOGLE_USERNAME", "robot@example.com"),
        ("GOOGLE_PASSWORD", "pa55"),
        ("SHEET_ID", "1AbC"),
        ("CLICK_ON_SELECTOR", TRIGGER),
        ("TOAST_MESSAGE", "Update all: Done!"),
    ]
    .into_iter()
    .collect();
    let file = FileConfig {
        screenshot_path: Some(screenshot_dir.join("screenshot.png")),
        ..FileConfig::default()
    };
    TaskConfig::from_sources(|key| vars.get(key).map(|v| v.to_string()), file)
        .expect("valid config")
}

fn toast(text: &str, after_secs: u64) -> FakeEffect {
    FakeEffect::Binding {
        name: NOTIFICATION_BINDING.to_string(),
        payload: serde_json::json!(["Update all", text]).to_string(),
        after: Duration::from_secs(after_secs),
    }
}

/// A signed-in-able application with the trigger on the document
fn application(config: &TaskConfig) -> FakeBrowser {
    FakeBrowser::new()
        .with_element(FakeElement::new(config.selectors.password_gate.clone()))
        .with_element(FakeElement::new(config.selectors.signed_in_marker.clone()))
        .with_element(FakeElement::new(TRIGGER).hidden())
        .with_element(FakeElement::new(TRIGGER))
}

fn count(fake: &FakeBrowser, pred: impl Fn(&FakeCall) -> bool) -> usize {
    fake.calls().iter().filter(|call| pred(call)).count()
}

#[tokio::test(start_paused = true)]
async fn test_terminal_notification_completes_the_task() {
    let dir = tempfile::tempdir().unwrap();
    let config = task_config(dir.path());
    let fake = Arc::new(
        application(&config).on_click(
            TRIGGER,
            vec![toast("Starting", 1), toast("50%", 2), toast("Done!", 3)],
        ),
    );

    let result = TaskOrchestrator::new(config.clone())
        .run_with(fake.clone())
        .await;

    assert!(result.is_success(), "outcome: {:?}", result.outcome);
    assert_eq!(result.outcome.exit_code(), 0);
    assert_eq!(result.steps.len(), 10);
    assert_eq!(fake.typed_text(), "robot@example.compa55");
    assert_eq!(
        fake.navigations(),
        vec![
            config.urls.sign_in.to_string(),
            config.document_url().to_string()
        ]
    );
    assert_eq!(fake.clicks(), vec![TRIGGER.to_string()]);
    assert!(fake.calls().contains(&FakeCall::DeviceMetrics {
        width: 1600,
        height: 1200
    }));
    assert_eq!(fake.calls().last(), Some(&FakeCall::Close));
    assert!(!dir.path().join("screenshot.png").exists());
}

#[tokio::test(start_paused = true)]
async fn test_wrong_final_notification_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let config = task_config(dir.path());
    let fake = Arc::new(application(&config).on_click(
        TRIGGER,
        vec![toast("Starting", 1), toast("50%", 2), toast("Failed", 3)],
    ));

    let result = TaskOrchestrator::new(config).run_with(fake.clone()).await;

    match &result.outcome {
        Outcome::Failure {
            step,
            error,
            snapshot,
        } => {
            assert_eq!(step.as_deref(), Some("Update completed"));
            match error {
                FlowError::CompletionTimeout {
                    idle_ms,
                    last_message,
                } => {
                    assert_eq!(*idle_ms, 120_000);
                    assert_eq!(last_message.as_deref(), Some("Update all: Failed"));
                }
                other => panic!("unexpected error {other:?}"),
            }
            let snapshot = snapshot.as_ref().expect("screenshot saved");
            assert!(std::fs::read(snapshot).unwrap().starts_with(b"\x89PNG"));
        }
        Outcome::Success => panic!("a failed update must not succeed"),
    }
    assert_eq!(result.outcome.exit_code(), 1);
    assert_eq!(fake.calls().last(), Some(&FakeCall::Close));
}

#[tokio::test(start_paused = true)]
async fn test_no_consent_prompt_skips_authorization() {
    let dir = tempfile::tempdir().unwrap();
    let config = task_config(dir.path());
    let fake = Arc::new(application(&config).on_click(TRIGGER, vec![toast("Done!", 1)]));

    let result = TaskOrchestrator::new(config).run_with(fake.clone()).await;

    assert!(result.is_success());
    assert_eq!(fake.navigations().len(), 2);
    assert_eq!(count(&fake, |c| matches!(c, FakeCall::ListTargets)), 0);
    assert_eq!(count(&fake, |c| matches!(c, FakeCall::CloseTarget(_))), 0);
    assert_eq!(fake.clicks().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_consent_prompt_takes_one_identity_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let config = task_config(dir.path());
    let consent = config.selectors.consent_continue.clone();
    let approve = config.selectors.approve_access.clone();
    let fake = Arc::new(
        application(&config)
            .on_click(TRIGGER, vec![FakeEffect::Show(FakeElement::new(consent.clone()))])
            .on_click(TRIGGER, vec![toast("Starting", 1), toast("Done!", 2)])
            .on_click(
                consent.clone(),
                vec![
                    FakeEffect::OpenTarget(TargetSummary::page("identity-1", IDENTITY_URL)),
                    FakeEffect::Show(FakeElement::new(approve.clone())),
                ],
            )
            .on_click(approve.clone(), vec![FakeEffect::Remove(consent.clone())]),
    );

    let result = TaskOrchestrator::new(config.clone())
        .run_with(fake.clone())
        .await;

    assert!(result.is_success(), "outcome: {:?}", result.outcome);
    let document = config.document_url().to_string();
    assert_eq!(
        fake.navigations(),
        vec![
            config.urls.sign_in.to_string(),
            document.clone(),
            IDENTITY_URL.to_string(),
            document
        ]
    );
    assert_eq!(
        fake.clicks(),
        vec![TRIGGER.to_string(), consent, approve, TRIGGER.to_string()]
    );
    assert_eq!(
        count(&fake, |c| matches!(c, FakeCall::CloseTarget(id) if id == "identity-1")),
        1
    );
    assert!(fake.open_targets().is_empty());
    // The observer is installed again on the reloaded document.
    assert_eq!(count(&fake, |c| matches!(c, FakeCall::Evaluate)), 2);
}

#[tokio::test(start_paused = true)]
async fn test_missing_identity_target_fails_without_retry() {
    let dir = tempfile::tempdir().unwrap();
    let config = task_config(dir.path());
    let consent = config.selectors.consent_continue.clone();
    let fake = Arc::new(
        application(&config)
            .on_click(TRIGGER, vec![FakeEffect::Show(FakeElement::new(consent.clone()))])
            .with_target(TargetSummary::page("other", "https://docs.google.com/other")),
    );

    let result = TaskOrchestrator::new(config).run_with(fake.clone()).await;

    match &result.outcome {
        Outcome::Failure { step, error, .. } => {
            assert_eq!(step.as_deref(), Some("Authorization checked"));
            assert!(matches!(error, FlowError::TargetNotFound(_)));
        }
        Outcome::Success => panic!("expected failure"),
    }
    assert_eq!(fake.clicks(), vec![TRIGGER.to_string(), consent]);
    assert_eq!(count(&fake, |c| matches!(c, FakeCall::CloseTarget(_))), 0);
    assert_eq!(fake.calls().last(), Some(&FakeCall::Close));
}

#[tokio::test(start_paused = true)]
async fn test_sign_in_failure_stops_before_the_document() {
    let dir = tempfile::tempdir().unwrap();
    let config = task_config(dir.path());
    let fake = Arc::new(
        FakeBrowser::new()
            .with_element(FakeElement::new(config.selectors.password_gate.clone()))
            .failing_navigation(config.urls.sign_in.to_string(), "net::ERR_NAME_NOT_RESOLVED"),
    );

    let result = TaskOrchestrator::new(config).run_with(fake.clone()).await;

    match &result.outcome {
        Outcome::Failure { step, error, .. } => {
            assert_eq!(step.as_deref(), Some("Loaded sign in page"));
            assert!(matches!(error, FlowError::NavigationFailed { .. }));
        }
        Outcome::Success => panic!("expected failure"),
    }
    assert!(fake.typed_text().is_empty());
    assert_eq!(fake.navigations().len(), 1);
}
