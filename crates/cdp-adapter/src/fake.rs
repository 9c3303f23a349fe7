//! Scripted in-memory browser implementing [`Cdp`].
//!
//! Elements are matched by exact selector string. Clicks can trigger scripted effects (showing or
//! removing elements, opening targets, emitting binding calls), which is enough to drive the
//! flow layer through every branch without a real Chromium.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};

use crate::adapter::{Cdp, EventBus};
use crate::commands::{Anchor, Key, QuerySpec, TargetSummary, WaitGate};
use crate::error::{AdapterError, AdapterErrorKind};
use crate::events::RawEvent;
use crate::ids::PageId;

const FAKE_PNG: &[u8] = b"\x89PNG\r\n\x1a\nfake";

#[derive(Clone, Debug)]
pub struct FakeElement {
    pub selector: String,
    pub visible: bool,
    pub enabled: bool,
    pub text: Option<String>,
    pub appears_after: Duration,
}

impl FakeElement {
    pub fn new(selector: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            visible: true,
            enabled: true,
            text: None,
            appears_after: Duration::ZERO,
        }
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Attach the element only once `delay` has passed since it was scripted.
    pub fn appearing_after(mut self, delay: Duration) -> Self {
        self.appears_after = delay;
        self
    }
}

#[derive(Clone, Debug)]
pub enum FakeEffect {
    Show(FakeElement),
    Remove(String),
    OpenTarget(TargetSummary),
    /// Emit a `Runtime.bindingCalled` for `name` after `after`, if the page registered it.
    Binding {
        name: String,
        payload: String,
        after: Duration,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum FakeCall {
    CreatePage(String),
    Navigate(String),
    Click(String),
    Keystroke(char),
    Key(Key),
    CloseTarget(String),
    TextContent(String),
    Screenshot,
    Evaluate,
    AddBinding(String),
    DeviceMetrics { width: u32, height: u32 },
    ListTargets,
    Close,
}

struct Mounted {
    id: u64,
    element: FakeElement,
    attached_at: Instant,
}

impl Mounted {
    fn is_present(&self, now: Instant) -> bool {
        now >= self.attached_at
    }
}

struct FakeDom {
    next_id: u64,
    elements: Vec<Mounted>,
    click_effects: HashMap<String, VecDeque<Vec<FakeEffect>>>,
    targets: Vec<TargetSummary>,
    calls: Vec<FakeCall>,
    idle_delay: Duration,
    failing_navigations: HashMap<String, String>,
    evaluate_result: Value,
    bindings: Vec<String>,
}

impl FakeDom {
    fn mount(&mut self, element: FakeElement) {
        self.next_id += 1;
        let attached_at = Instant::now() + element.appears_after;
        self.elements.push(Mounted {
            id: self.next_id,
            element,
            attached_at,
        });
    }

    fn present<'a>(&'a self, selector: &'a str) -> impl Iterator<Item = &'a Mounted> + 'a {
        let now = Instant::now();
        self.elements
            .iter()
            .filter(move |m| m.element.selector == selector && m.is_present(now))
    }
}

pub struct FakeBrowser {
    page: PageId,
    bus: EventBus,
    dom: Mutex<FakeDom>,
}

impl Default for FakeBrowser {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBrowser {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(256);
        Self {
            page: PageId::new(),
            bus,
            dom: Mutex::new(FakeDom {
                next_id: 0,
                elements: Vec::new(),
                click_effects: HashMap::new(),
                targets: Vec::new(),
                calls: Vec::new(),
                idle_delay: Duration::ZERO,
                failing_navigations: HashMap::new(),
                evaluate_result: json!({ "status": "installed" }),
                bindings: Vec::new(),
            }),
        }
    }

    pub fn with_element(self, element: FakeElement) -> Self {
        self.dom.lock().mount(element);
        self
    }

    /// Queue effects for the next click on `selector`; each click consumes one entry.
    pub fn on_click(self, selector: impl Into<String>, effects: Vec<FakeEffect>) -> Self {
        self.dom
            .lock()
            .click_effects
            .entry(selector.into())
            .or_default()
            .push_back(effects);
        self
    }

    pub fn with_target(self, target: TargetSummary) -> Self {
        self.dom.lock().targets.push(target);
        self
    }

    /// How long the page takes to reach network quiet after any wait request.
    pub fn with_idle_delay(self, delay: Duration) -> Self {
        self.dom.lock().idle_delay = delay;
        self
    }

    pub fn failing_navigation(self, url: impl Into<String>, error_text: impl Into<String>) -> Self {
        self.dom
            .lock()
            .failing_navigations
            .insert(url.into(), error_text.into());
        self
    }

    pub fn with_evaluate_result(self, value: Value) -> Self {
        self.dom.lock().evaluate_result = value;
        self
    }

    pub fn page(&self) -> PageId {
        self.page
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.dom.lock().calls.clone()
    }

    pub fn clicks(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                FakeCall::Click(selector) => Some(selector),
                _ => None,
            })
            .collect()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                FakeCall::Navigate(url) => Some(url),
                _ => None,
            })
            .collect()
    }

    pub fn typed_text(&self) -> String {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                FakeCall::Keystroke(ch) => Some(ch),
                _ => None,
            })
            .collect()
    }

    pub fn open_targets(&self) -> Vec<TargetSummary> {
        self.dom.lock().targets.clone()
    }

    pub fn is_present(&self, selector: &str) -> bool {
        self.dom.lock().present(selector).next().is_some()
    }

    /// Emit a binding call right away, as if page script invoked it.
    pub fn emit_binding(&self, name: &str, payload: &str) {
        let _ = self.bus.send(RawEvent::BindingCalled {
            page: self.page,
            name: name.to_string(),
            payload: payload.to_string(),
        });
    }

    fn record(&self, call: FakeCall) {
        self.dom.lock().calls.push(call);
    }

    fn check_page(&self, page: PageId) -> Result<(), AdapterError> {
        if page == self.page {
            Ok(())
        } else {
            Err(AdapterError::new(AdapterErrorKind::Internal)
                .with_hint(format!("missing cdp session for page {page:?}")))
        }
    }

    fn clicked(&self, selector: &str) {
        let effects = {
            let mut dom = self.dom.lock();
            dom.calls.push(FakeCall::Click(selector.to_string()));
            dom.click_effects
                .get_mut(selector)
                .and_then(|queue| queue.pop_front())
                .unwrap_or_default()
        };
        for effect in effects {
            self.apply(effect);
        }
    }

    fn apply(&self, effect: FakeEffect) {
        match effect {
            FakeEffect::Show(element) => self.dom.lock().mount(element),
            FakeEffect::Remove(selector) => self
                .dom
                .lock()
                .elements
                .retain(|m| m.element.selector != selector),
            FakeEffect::OpenTarget(target) => self.dom.lock().targets.push(target),
            FakeEffect::Binding {
                name,
                payload,
                after,
            } => {
                let bus = self.bus.clone();
                let page = self.page;
                let registered = self.dom.lock().bindings.contains(&name);
                if registered {
                    tokio::spawn(async move {
                        sleep(after).await;
                        let _ = bus.send(RawEvent::BindingCalled {
                            page,
                            name,
                            payload,
                        });
                    });
                }
            }
        }
    }
}

#[async_trait]
impl Cdp for FakeBrowser {
    async fn create_page(&self, url: &str) -> Result<PageId, AdapterError> {
        self.record(FakeCall::CreatePage(url.to_string()));
        Ok(self.page)
    }

    async fn navigate(
        &self,
        page: PageId,
        url: &str,
        _deadline: Duration,
    ) -> Result<(), AdapterError> {
        self.check_page(page)?;
        self.record(FakeCall::Navigate(url.to_string()));
        let failure = self.dom.lock().failing_navigations.get(url).cloned();
        match failure {
            Some(error_text) => Err(AdapterError::new(AdapterErrorKind::NavFailed)
                .with_hint(format!("{url}: {error_text}"))),
            None => Ok(()),
        }
    }

    async fn wait_basic(
        &self,
        page: PageId,
        gate: WaitGate,
        timeout: Duration,
    ) -> Result<(), AdapterError> {
        self.check_page(page)?;
        let WaitGate::NetworkQuiet { .. } = gate;
        let idle = self.dom.lock().idle_delay;
        if idle > timeout {
            sleep(timeout).await;
            Err(AdapterError::new(AdapterErrorKind::NavTimeout)
                .with_hint("wait_basic NetworkQuiet timed out"))
        } else {
            sleep(idle).await;
            Ok(())
        }
    }

    async fn query(&self, page: PageId, spec: QuerySpec) -> Result<Vec<Anchor>, AdapterError> {
        self.check_page(page)?;
        let dom = self.dom.lock();
        Ok(dom
            .present(&spec.selector)
            .map(|m| Anchor {
                backend_node_id: Some(m.id),
                x: 0.0,
                y: 0.0,
                visible: m.element.visible,
                enabled: m.element.enabled,
            })
            .collect())
    }

    async fn click_anchor(&self, page: PageId, anchor: &Anchor) -> Result<(), AdapterError> {
        self.check_page(page)?;
        let selector = {
            let dom = self.dom.lock();
            dom.elements
                .iter()
                .find(|m| Some(m.id) == anchor.backend_node_id)
                .map(|m| m.element.selector.clone())
        };
        match selector {
            Some(selector) => {
                self.clicked(&selector);
                Ok(())
            }
            None => Err(AdapterError::new(AdapterErrorKind::TargetNotFound)
                .with_hint("anchor no longer attached")),
        }
    }

    async fn send_character(&self, page: PageId, ch: char) -> Result<(), AdapterError> {
        self.check_page(page)?;
        self.record(FakeCall::Keystroke(ch));
        Ok(())
    }

    async fn press_key(&self, page: PageId, key: Key) -> Result<(), AdapterError> {
        self.check_page(page)?;
        self.record(FakeCall::Key(key));
        Ok(())
    }

    async fn text_content(
        &self,
        page: PageId,
        selector: &str,
    ) -> Result<Option<String>, AdapterError> {
        self.check_page(page)?;
        let mut dom = self.dom.lock();
        dom.calls.push(FakeCall::TextContent(selector.to_string()));
        let text = dom
            .present(selector)
            .next()
            .map(|m| m.element.text.clone().unwrap_or_default());
        Ok(text)
    }

    async fn evaluate_script(
        &self,
        page: PageId,
        _expression: &str,
    ) -> Result<Value, AdapterError> {
        self.check_page(page)?;
        let mut dom = self.dom.lock();
        dom.calls.push(FakeCall::Evaluate);
        Ok(dom.evaluate_result.clone())
    }

    async fn add_binding(&self, page: PageId, name: &str) -> Result<(), AdapterError> {
        self.check_page(page)?;
        let mut dom = self.dom.lock();
        dom.calls.push(FakeCall::AddBinding(name.to_string()));
        dom.bindings.push(name.to_string());
        Ok(())
    }

    async fn screenshot(&self, page: PageId, _deadline: Duration) -> Result<Vec<u8>, AdapterError> {
        self.check_page(page)?;
        self.record(FakeCall::Screenshot);
        Ok(FAKE_PNG.to_vec())
    }

    async fn set_device_metrics(
        &self,
        page: PageId,
        width: u32,
        height: u32,
        _device_scale_factor: f64,
        _mobile: bool,
    ) -> Result<(), AdapterError> {
        self.check_page(page)?;
        self.record(FakeCall::DeviceMetrics { width, height });
        Ok(())
    }

    async fn list_targets(&self) -> Result<Vec<TargetSummary>, AdapterError> {
        let mut dom = self.dom.lock();
        dom.calls.push(FakeCall::ListTargets);
        Ok(dom.targets.clone())
    }

    async fn close_target(&self, target_id: &str) -> Result<(), AdapterError> {
        let mut dom = self.dom.lock();
        dom.calls.push(FakeCall::CloseTarget(target_id.to_string()));
        dom.targets.retain(|target| target.target_id != target_id);
        Ok(())
    }

    async fn close(&self) -> Result<(), AdapterError> {
        self.record(FakeCall::Close);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RawEvent> {
        self.bus.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn click_first(fake: &FakeBrowser, selector: &str) -> Result<(), AdapterError> {
        let anchors = fake
            .query(fake.page(), QuerySpec::document(selector))
            .await?;
        let anchor = anchors.first().ok_or_else(|| {
            AdapterError::new(AdapterErrorKind::TargetNotFound).with_hint(selector.to_string())
        })?;
        fake.click_anchor(fake.page(), anchor).await
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_elements_attach_on_schedule() {
        let fake = FakeBrowser::new()
            .with_element(FakeElement::new("#late").appearing_after(Duration::from_millis(500)));
        assert!(!fake.is_present("#late"));
        sleep(Duration::from_millis(500)).await;
        assert!(fake.is_present("#late"));
    }

    #[tokio::test]
    async fn click_effects_are_consumed_in_order() {
        let fake = FakeBrowser::new()
            .with_element(FakeElement::new("#go"))
            .on_click("#go", vec![FakeEffect::Show(FakeElement::new("#first"))])
            .on_click("#go", vec![FakeEffect::Remove("#first".into())]);

        click_first(&fake, "#go").await.unwrap();
        assert!(fake.is_present("#first"));
        click_first(&fake, "#go").await.unwrap();
        assert!(!fake.is_present("#first"));
        click_first(&fake, "#go").await.unwrap();
        assert_eq!(fake.clicks().len(), 3);
    }

    #[tokio::test]
    async fn detached_anchor_is_not_clickable() {
        let fake = FakeBrowser::new()
            .with_element(FakeElement::new("#go"))
            .on_click("#go", vec![FakeEffect::Remove("#go".into())]);
        let page = fake.page();
        let anchors = fake.query(page, QuerySpec::document("#go")).await.unwrap();

        fake.click_anchor(page, &anchors[0]).await.unwrap();
        let err = fake
            .click_anchor(page, &anchors[0])
            .await
            .expect_err("element was removed by the first click");
        assert_eq!(err.kind, AdapterErrorKind::TargetNotFound);
    }

    #[tokio::test]
    async fn text_reads_are_recorded() {
        let fake =
            FakeBrowser::new().with_element(FakeElement::new("#msg").with_text("Saved"));
        let text = fake.text_content(fake.page(), "#msg").await.unwrap();
        assert_eq!(text.as_deref(), Some("Saved"));
        assert_eq!(fake.calls(), vec![FakeCall::TextContent("#msg".into())]);
    }

    #[tokio::test(start_paused = true)]
    async fn binding_effects_need_a_registered_binding() {
        let fake = FakeBrowser::new()
            .with_element(FakeElement::new("#go"))
            .on_click(
                "#go",
                vec![FakeEffect::Binding {
                    name: "notify".into(),
                    payload: "[]".into(),
                    after: Duration::from_secs(1),
                }],
            );
        let page = fake.page();
        let mut events = fake.subscribe();
        fake.add_binding(page, "notify").await.unwrap();
        click_first(&fake, "#go").await.unwrap();

        match events.recv().await.unwrap() {
            RawEvent::BindingCalled { name, .. } => assert_eq!(name, "notify"),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
