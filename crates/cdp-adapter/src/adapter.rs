use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio::{select, spawn};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::commands::{Anchor, Key, QuerySpec, TargetSummary, WaitGate};
use crate::config::CdpConfig;
use crate::error::{AdapterError, AdapterErrorKind};
use crate::events::RawEvent;
use crate::ids::{BrowserId, PageId};
use crate::metrics;
use crate::registry::Registry;
use crate::resolve_chrome_path;
use crate::transport::{CdpTransport, ChromiumTransport, CommandTarget, TransportEvent};

pub type EventBus = broadcast::Sender<RawEvent>;

const ATTACH_WAIT: Duration = Duration::from_secs(5);
const ATTACH_POLL: Duration = Duration::from_millis(50);
const READY_POLL: Duration = Duration::from_millis(100);

/// Browser-control surface consumed by the flow layer.
#[async_trait]
pub trait Cdp: Send + Sync {
    /// Open a new page target and wait until a session is attached to it.
    async fn create_page(&self, url: &str) -> Result<PageId, AdapterError>;
    /// Navigate and wait for the new document to become interactive.
    async fn navigate(&self, page: PageId, url: &str, deadline: Duration)
        -> Result<(), AdapterError>;
    async fn wait_basic(
        &self,
        page: PageId,
        gate: WaitGate,
        timeout: Duration,
    ) -> Result<(), AdapterError>;
    async fn query(&self, page: PageId, spec: QuerySpec) -> Result<Vec<Anchor>, AdapterError>;
    async fn click_anchor(&self, page: PageId, anchor: &Anchor) -> Result<(), AdapterError>;
    /// Deliver a single character as a discrete key press to the focused element.
    async fn send_character(&self, page: PageId, ch: char) -> Result<(), AdapterError>;
    async fn press_key(&self, page: PageId, key: Key) -> Result<(), AdapterError>;
    async fn text_content(
        &self,
        page: PageId,
        selector: &str,
    ) -> Result<Option<String>, AdapterError>;
    async fn evaluate_script(&self, page: PageId, expression: &str)
        -> Result<Value, AdapterError>;
    /// Expose a page-callable function whose invocations arrive as [`RawEvent::BindingCalled`].
    async fn add_binding(&self, page: PageId, name: &str) -> Result<(), AdapterError>;
    async fn screenshot(&self, page: PageId, deadline: Duration) -> Result<Vec<u8>, AdapterError>;
    async fn set_device_metrics(
        &self,
        page: PageId,
        width: u32,
        height: u32,
        device_scale_factor: f64,
        mobile: bool,
    ) -> Result<(), AdapterError>;
    async fn list_targets(&self) -> Result<Vec<TargetSummary>, AdapterError>;
    async fn close_target(&self, target_id: &str) -> Result<(), AdapterError>;
    /// Close the browser and stop background tasks.
    async fn close(&self) -> Result<(), AdapterError>;
    fn subscribe(&self) -> broadcast::Receiver<RawEvent>;
}

/// Requests of one page that have started and not yet finished or failed.
///
/// Keyed by request id: a redirect re-announces the same id and must not count twice.
#[derive(Debug)]
struct NetworkActivity {
    inflight: HashSet<String>,
    last_activity: Instant,
}

impl NetworkActivity {
    fn new() -> Self {
        Self {
            inflight: HashSet::new(),
            last_activity: Instant::now(),
        }
    }

    fn started(&mut self, request_id: String) {
        self.inflight.insert(request_id);
        self.last_activity = Instant::now();
    }

    fn settled(&mut self, request_id: &str) {
        self.inflight.remove(request_id);
        self.last_activity = Instant::now();
    }

    /// A new top-level document abandons whatever the previous one had pending.
    fn reset(&mut self) {
        self.inflight.clear();
        self.last_activity = Instant::now();
    }

    fn is_quiet(&self, window: Duration, max_inflight: u32) -> bool {
        self.inflight.len() <= max_inflight as usize && self.last_activity.elapsed() >= window
    }
}

pub struct CdpAdapter {
    pub browser_id: BrowserId,
    pub cfg: CdpConfig,
    pub bus: EventBus,
    pub registry: Arc<Registry>,
    metrics: prometheus::Registry,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    transport: Arc<dyn CdpTransport>,
    targets: DashMap<String, PageId>,
    sessions: DashMap<String, PageId>,
    network: DashMap<PageId, NetworkActivity>,
}

impl CdpAdapter {
    /// Build an adapter that drives a real Chromium. Fails when no browser can be located and no
    /// remote debugging url was configured.
    pub fn launch(mut cfg: CdpConfig, bus: EventBus) -> Result<Self, AdapterError> {
        if cfg.websocket_url.is_none() {
            let path = resolve_chrome_path(&cfg).ok_or_else(|| {
                AdapterError::new(AdapterErrorKind::CdpIo)
                    .with_hint("Chrome/Chromium executable not found")
                    .with_data(json!({
                        "remediation": "Install Chrome/Chromium or set AUTOPILOT_CHROME=/path/to/chrome"
                    }))
            })?;
            cfg.executable = path;
        }

        info!(
            target: "cdp-adapter",
            executable = %cfg.executable.display(),
            headless = cfg.headless,
            "using real Chromium transport"
        );
        let transport: Arc<dyn CdpTransport> = Arc::new(ChromiumTransport::new(cfg.clone()));
        Ok(Self::with_transport(cfg, bus, transport))
    }

    pub fn with_transport(
        cfg: CdpConfig,
        bus: EventBus,
        transport: Arc<dyn CdpTransport>,
    ) -> Self {
        Self {
            browser_id: BrowserId::new(),
            cfg,
            bus,
            registry: Arc::new(Registry::new()),
            metrics: prometheus::Registry::new(),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            transport,
            targets: DashMap::new(),
            sessions: DashMap::new(),
            network: DashMap::new(),
        }
    }

    /// Prometheus text dump of the adapter counters, available once the adapter started.
    pub fn metrics_text(&self) -> String {
        metrics::encode(&self.metrics)
    }

    pub async fn start(self: Arc<Self>) -> Result<(), AdapterError> {
        {
            let guard = self.tasks.lock().await;
            if !guard.is_empty() {
                return Ok(());
            }
        }

        metrics::register_metrics(&self.metrics);
        self.transport.start().await?;
        let loop_task = spawn(Self::event_loop(Arc::clone(&self)));
        self.tasks.lock().await.push(loop_task);
        info!(target: "cdp-adapter", browser = ?self.browser_id, "event loop started");
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut handles = self.tasks.lock().await;
        while let Some(handle) = handles.pop() {
            let _ = handle.await;
        }
    }

    /// Record a page whose session is already known, bypassing target discovery.
    pub fn register_page(&self, page: PageId, target_id: Option<String>, cdp_session: Option<String>) {
        self.registry.insert_page(page, target_id.clone());
        if let Some(target_id) = target_id {
            self.targets.insert(target_id, page);
        }
        if let Some(session) = cdp_session {
            self.sessions.insert(session.clone(), page);
            self.registry.set_cdp_session(&page, session);
        }
        self.network.insert(page, NetworkActivity::new());
    }

    async fn event_loop(self: Arc<Self>) {
        debug!(target: "cdp-adapter", "event loop entered");
        loop {
            select! {
                _ = self.shutdown.cancelled() => {
                    break;
                }
                event = self.transport.next_event() => {
                    match event {
                        Some(ev) => self.handle_event(ev).await,
                        None => {
                            if !self.shutdown.is_cancelled() {
                                self.handle_transport_disconnect();
                            }
                            break;
                        }
                    }
                }
            }
        }
        debug!(target: "cdp-adapter", "event loop exiting");
    }

    fn handle_transport_disconnect(&self) {
        warn!(
            target: "cdp-adapter",
            pages = self.registry.pages().len(),
            "transport stream ended"
        );
        self.registry.clear();
        self.targets.clear();
        self.sessions.clear();
        self.network.clear();

        let _ = self.bus.send(RawEvent::Error {
            page: None,
            message: "cdp connection lost".to_string(),
        });
    }

    async fn handle_event(&self, event: TransportEvent) {
        if let Err(err) = self.process_event(event) {
            let _ = self.bus.send(RawEvent::Error {
                page: None,
                message: format!("cdp event handling error: {err}"),
            });
        }
    }

    fn process_event(&self, event: TransportEvent) -> Result<(), AdapterError> {
        metrics::record_event(&event.method);
        match event.method.as_str() {
            "Target.targetCreated" => self.on_target_created(event.params)?,
            "Target.targetDestroyed" => self.on_target_destroyed(event.params)?,
            "Target.attachedToTarget" => self.on_target_attached(event.params)?,
            "Target.detachedFromTarget" => self.on_target_detached(event.params)?,
            "Page.frameNavigated" => self.on_frame_navigated(event)?,
            "Network.requestWillBeSent" => self.on_request_started(event)?,
            "Network.loadingFinished" | "Network.loadingFailed" => {
                self.on_request_settled(event)?
            }
            "Runtime.bindingCalled" => self.on_binding_called(event)?,
            "Runtime.consoleAPICalled" => self.on_console_api_called(event)?,
            "Runtime.exceptionThrown" => self.on_exception_thrown(event)?,
            _ => {
                debug!(target: "cdp-adapter", method = %event.method, "unhandled cdp event");
            }
        }
        Ok(())
    }

    fn on_target_created(&self, params: Value) -> Result<(), AdapterError> {
        let payload: TargetCreatedParams = decode(params)?;
        if payload.target_info.target_type != "page" {
            return Ok(());
        }

        let target_id = payload.target_info.target_id;
        if self.targets.contains_key(&target_id) {
            return Ok(());
        }
        let page = PageId::new();
        self.targets.insert(target_id.clone(), page);
        self.registry.insert_page(page, Some(target_id));
        self.network.insert(page, NetworkActivity::new());
        debug!(target: "cdp-adapter", ?page, url = ?payload.target_info.url, "page target created");
        Ok(())
    }

    fn on_target_destroyed(&self, params: Value) -> Result<(), AdapterError> {
        let payload: TargetDestroyedParams = decode(params)?;
        if let Some((_, page)) = self.targets.remove(&payload.target_id) {
            self.sessions.retain(|_, v| *v != page);
            self.network.remove(&page);
            self.registry.remove_page(&page);
            debug!(target: "cdp-adapter", ?page, "page target destroyed");
        }
        Ok(())
    }

    fn on_target_attached(&self, params: Value) -> Result<(), AdapterError> {
        let payload: AttachedToTargetParams = decode(params)?;
        if payload.target_info.target_type != "page" {
            return Ok(());
        }

        let target_id = payload.target_info.target_id;
        let page = match self.targets.get(&target_id) {
            Some(entry) => *entry.value(),
            None => {
                let page = PageId::new();
                self.targets.insert(target_id.clone(), page);
                self.registry.insert_page(page, Some(target_id));
                self.network.insert(page, NetworkActivity::new());
                page
            }
        };
        self.sessions.insert(payload.session_id.clone(), page);
        self.registry.set_cdp_session(&page, payload.session_id);
        Ok(())
    }

    fn on_target_detached(&self, params: Value) -> Result<(), AdapterError> {
        let payload: DetachedFromTargetParams = decode(params)?;
        self.sessions.remove(&payload.session_id);
        Ok(())
    }

    fn on_frame_navigated(&self, event: TransportEvent) -> Result<(), AdapterError> {
        let payload: FrameNavigatedParams = decode(event.params)?;
        if payload.frame.parent_id.is_some() {
            return Ok(());
        }
        if let Some(page) = self.page_from_session(event.session_id.as_ref()) {
            debug!(target: "cdp-adapter", ?page, url = %payload.frame.url, "top frame navigated");
            self.network
                .entry(page)
                .or_insert_with(NetworkActivity::new)
                .reset();
        }
        Ok(())
    }

    fn on_request_started(&self, event: TransportEvent) -> Result<(), AdapterError> {
        let payload: NetworkRequestParams = decode(event.params)?;
        if let Some(page) = self.page_from_session(event.session_id.as_ref()) {
            self.network
                .entry(page)
                .or_insert_with(NetworkActivity::new)
                .started(payload.request_id);
        }
        Ok(())
    }

    fn on_request_settled(&self, event: TransportEvent) -> Result<(), AdapterError> {
        let payload: NetworkRequestParams = decode(event.params)?;
        if let Some(page) = self.page_from_session(event.session_id.as_ref()) {
            self.network
                .entry(page)
                .or_insert_with(NetworkActivity::new)
                .settled(&payload.request_id);
        }
        Ok(())
    }

    fn on_binding_called(&self, event: TransportEvent) -> Result<(), AdapterError> {
        let payload: BindingCalledParams = decode(event.params)?;
        metrics::record_binding_call(&payload.name);
        if let Some(page) = self.page_from_session(event.session_id.as_ref()) {
            let _ = self.bus.send(RawEvent::BindingCalled {
                page,
                name: payload.name,
                payload: payload.payload,
            });
        }
        Ok(())
    }

    fn on_console_api_called(&self, event: TransportEvent) -> Result<(), AdapterError> {
        let payload: ConsoleApiCalledParams = decode(event.params)?;
        let Some(page) = self.page_from_session(event.session_id.as_ref()) else {
            return Ok(());
        };
        let text = payload
            .args
            .iter()
            .map(RemoteObjectPayload::render)
            .collect::<Vec<_>>()
            .join(" ");
        let _ = self.bus.send(RawEvent::ConsoleMessage {
            page,
            level: payload.kind,
            text,
        });
        Ok(())
    }

    fn on_exception_thrown(&self, event: TransportEvent) -> Result<(), AdapterError> {
        let payload: ExceptionThrownParams = decode(event.params)?;
        let message = payload
            .exception_details
            .exception
            .and_then(|ex| ex.description)
            .or(payload.exception_details.text)
            .unwrap_or_else(|| "runtime exception".to_string());

        let page = self.page_from_session(event.session_id.as_ref());
        let _ = self.bus.send(RawEvent::Error { page, message });
        Ok(())
    }

    fn page_from_session(&self, session: Option<&String>) -> Option<PageId> {
        session.and_then(|sid| self.sessions.get(sid).map(|entry| *entry.value()))
    }

    async fn wait_for_dom_ready(&self, page: PageId, deadline: Instant) -> Result<(), AdapterError> {
        loop {
            if Instant::now() >= deadline {
                return Err(AdapterError::new(AdapterErrorKind::NavTimeout)
                    .with_hint("document never became interactive"));
            }

            let response = self
                .send_page_command(
                    page,
                    "Runtime.evaluate",
                    json!({
                        "expression": "document.readyState",
                        "returnByValue": true,
                    }),
                )
                .await?;

            let ready = response
                .get("result")
                .and_then(|v| v.get("value"))
                .and_then(|v| v.as_str())
                .map(|state| matches!(state, "interactive" | "complete"))
                .unwrap_or(false);

            if ready {
                return Ok(());
            }

            sleep(READY_POLL).await;
        }
    }

    async fn wait_for_network_quiet(
        &self,
        page: PageId,
        window_ms: u64,
        max_inflight: u32,
        deadline: Instant,
    ) -> Result<(), AdapterError> {
        let window = Duration::from_millis(window_ms);
        loop {
            let quiet = self
                .network
                .get(&page)
                .map(|entry| entry.is_quiet(window, max_inflight))
                .unwrap_or(true);
            if quiet {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(AdapterError::new(AdapterErrorKind::NavTimeout)
                    .with_hint("wait_basic NetworkQuiet timed out"));
            }
            sleep(READY_POLL.min(deadline - now)).await;
        }
    }

    async fn wait_for_page_ready(&self, page: PageId) -> Result<(), AdapterError> {
        let deadline = Instant::now() + ATTACH_WAIT;
        while Instant::now() < deadline {
            if self.registry.is_attached(&page) {
                return Ok(());
            }
            sleep(ATTACH_POLL).await;
        }
        Err(AdapterError::new(AdapterErrorKind::Internal)
            .with_hint(format!("cdp session not ready for page {page:?}")))
    }

    async fn send_command(&self, method: &str, params: Value) -> Result<Value, AdapterError> {
        self.send_routed(CommandTarget::Browser, method, params).await
    }

    async fn send_page_command(
        &self,
        page: PageId,
        method: &str,
        params: Value,
    ) -> Result<Value, AdapterError> {
        let session = self.registry.get_cdp_session(&page).ok_or_else(|| {
            AdapterError::new(AdapterErrorKind::Internal)
                .with_hint(format!("missing cdp session for page {page:?}"))
        })?;
        self.send_routed(CommandTarget::Session(session), method, params)
            .await
    }

    async fn send_routed(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, AdapterError> {
        let start = std::time::Instant::now();
        let result = self.transport.send_command(target, method, params).await;
        metrics::record_command(method, start.elapsed(), result.is_ok());
        result
    }

    async fn enable_page_domains(&self, page: PageId) -> Result<(), AdapterError> {
        self.send_page_command(page, "Page.enable", json!({})).await?;
        self.send_page_command(page, "Network.enable", json!({})).await?;
        self.send_page_command(page, "Runtime.enable", json!({})).await?;
        Ok(())
    }

    async fn dispatch_key(
        &self,
        page: PageId,
        key: &str,
        code: &str,
        key_code: i64,
        text: Option<&str>,
    ) -> Result<(), AdapterError> {
        let mut down = json!({
            "type": "keyDown",
            "key": key,
            "code": code,
            "windowsVirtualKeyCode": key_code,
        });
        if let Some(text) = text {
            down["text"] = json!(text);
            down["unmodifiedText"] = json!(text);
        }
        self.send_page_command(page, "Input.dispatchKeyEvent", down)
            .await?;
        self.send_page_command(
            page,
            "Input.dispatchKeyEvent",
            json!({
                "type": "keyUp",
                "key": key,
                "code": code,
                "windowsVirtualKeyCode": key_code,
            }),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Cdp for CdpAdapter {
    async fn create_page(&self, url: &str) -> Result<PageId, AdapterError> {
        let response = self
            .send_command("Target.createTarget", json!({ "url": url }))
            .await?;
        let target_id = response
            .get("targetId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                AdapterError::new(AdapterErrorKind::Internal)
                    .with_hint("createTarget missing targetId")
            })?
            .to_string();

        let deadline = Instant::now() + ATTACH_WAIT;
        let page = loop {
            if let Some(entry) = self.targets.get(&target_id) {
                let page = *entry.value();
                if self.registry.is_attached(&page) {
                    break page;
                }
            }

            if Instant::now() >= deadline {
                return Err(AdapterError::new(AdapterErrorKind::Internal)
                    .with_hint("Timed out waiting for target attach"));
            }

            sleep(ATTACH_POLL).await;
        };

        self.enable_page_domains(page).await?;
        debug!(target: "cdp-adapter", ?page, %target_id, "page attached");
        Ok(page)
    }

    async fn navigate(
        &self,
        page: PageId,
        url: &str,
        deadline: Duration,
    ) -> Result<(), AdapterError> {
        let deadline_at = Instant::now() + deadline;
        let response = self
            .send_page_command(page, "Page.navigate", json!({ "url": url }))
            .await?;

        if let Some(error_text) = response
            .get("errorText")
            .and_then(|v| v.as_str())
            .filter(|text| !text.is_empty())
        {
            metrics::record_navigation_failure();
            return Err(AdapterError::new(AdapterErrorKind::NavFailed)
                .with_hint(format!("{url}: {error_text}"))
                .with_data(json!({ "url": url, "errorText": error_text })));
        }

        self.wait_for_dom_ready(page, deadline_at).await
    }

    async fn wait_basic(
        &self,
        page: PageId,
        gate: WaitGate,
        timeout: Duration,
    ) -> Result<(), AdapterError> {
        let deadline = Instant::now() + timeout;
        match gate {
            WaitGate::NetworkQuiet {
                window_ms,
                max_inflight,
            } => {
                self.wait_for_network_quiet(page, window_ms, max_inflight, deadline)
                    .await
            }
        }
    }

    async fn query(&self, page: PageId, spec: QuerySpec) -> Result<Vec<Anchor>, AdapterError> {
        self.wait_for_page_ready(page).await?;
        let selector_literal = js_literal(&spec.selector)?;

        let expression = format!(
            "(() => {{\n    let elements;\n    try {{\n        elements = document.querySelectorAll({selector});\n    }} catch (err) {{\n        return [];\n    }}\n    return Array.from(elements, (el) => {{\n        const rect = el.getBoundingClientRect();\n        const style = window.getComputedStyle(el);\n        const visible = style.display !== 'none' && style.visibility !== 'hidden' && el.getClientRects().length > 0;\n        const enabled = !el.disabled && el.getAttribute('aria-disabled') !== 'true';\n        return {{\n            backendNodeId: null,\n            x: Number.isFinite(rect.left) ? rect.left + rect.width / 2 : 0,\n            y: Number.isFinite(rect.top) ? rect.top + rect.height / 2 : 0,\n            visible,\n            enabled\n        }};\n    }});\n}})()",
            selector = selector_literal
        );

        let response = self
            .send_page_command(
                page,
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                }),
            )
            .await?;

        let values = response
            .get("result")
            .and_then(|res| res.get("value"))
            .and_then(|val| val.as_array())
            .ok_or_else(|| {
                AdapterError::new(AdapterErrorKind::Internal)
                    .with_hint("query did not return an array value")
            })?;

        let mut anchors = Vec::with_capacity(values.len());
        for entry in values {
            let obj = entry.as_object().ok_or_else(|| {
                AdapterError::new(AdapterErrorKind::Internal)
                    .with_hint("query entry was not an object")
            })?;
            let coord = |name: &str| {
                obj.get(name).and_then(|v| v.as_f64()).ok_or_else(|| {
                    AdapterError::new(AdapterErrorKind::Internal)
                        .with_hint(format!("query entry missing '{name}'"))
                })
            };
            anchors.push(Anchor {
                backend_node_id: obj.get("backendNodeId").and_then(|v| v.as_u64()),
                x: coord("x")?,
                y: coord("y")?,
                visible: obj.get("visible").and_then(|v| v.as_bool()).unwrap_or(false),
                enabled: obj.get("enabled").and_then(|v| v.as_bool()).unwrap_or(false),
            });
        }

        Ok(anchors)
    }

    async fn click_anchor(&self, page: PageId, anchor: &Anchor) -> Result<(), AdapterError> {
        for phase in ["mousePressed", "mouseReleased"] {
            self.send_page_command(
                page,
                "Input.dispatchMouseEvent",
                json!({
                    "type": phase,
                    "x": anchor.x,
                    "y": anchor.y,
                    "button": "left",
                    "buttons": 1,
                    "clickCount": 1,
                    "pointerType": "mouse",
                }),
            )
            .await?;
        }
        Ok(())
    }

    async fn send_character(&self, page: PageId, ch: char) -> Result<(), AdapterError> {
        let text = ch.to_string();
        self.dispatch_key(page, &text, "", 0, Some(&text)).await
    }

    async fn press_key(&self, page: PageId, key: Key) -> Result<(), AdapterError> {
        let (name, code, key_code, text) = key.descriptor();
        self.dispatch_key(page, name, code, key_code, text).await
    }

    async fn text_content(
        &self,
        page: PageId,
        selector: &str,
    ) -> Result<Option<String>, AdapterError> {
        let expression = format!(
            "(() => {{ const el = document.querySelector({selector}); return el ? el.textContent : null; }})()",
            selector = js_literal(selector)?
        );
        let value = self.evaluate_script(page, &expression).await?;
        Ok(value.as_str().map(|text| text.trim().to_string()))
    }

    async fn evaluate_script(
        &self,
        page: PageId,
        expression: &str,
    ) -> Result<Value, AdapterError> {
        self.wait_for_page_ready(page).await?;
        let response = self
            .send_page_command(
                page,
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "awaitPromise": true,
                    "returnByValue": true,
                    "userGesture": true,
                }),
            )
            .await?;

        if let Some(details) = response.get("exceptionDetails") {
            return Err(AdapterError::new(AdapterErrorKind::Internal)
                .with_hint("evaluate_script raised exception")
                .with_data(details.clone()));
        }

        Ok(response
            .get("result")
            .and_then(|res| res.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn add_binding(&self, page: PageId, name: &str) -> Result<(), AdapterError> {
        self.send_page_command(page, "Runtime.addBinding", json!({ "name": name }))
            .await?;
        Ok(())
    }

    async fn screenshot(&self, page: PageId, deadline: Duration) -> Result<Vec<u8>, AdapterError> {
        let response = tokio::time::timeout(
            deadline,
            self.send_page_command(page, "Page.captureScreenshot", json!({ "format": "png" })),
        )
        .await
        .map_err(|_| {
            AdapterError::new(AdapterErrorKind::NavTimeout).with_hint("screenshot timed out")
        })??;
        let data = response
            .get("data")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                AdapterError::new(AdapterErrorKind::Internal).with_hint("missing screenshot data")
            })?;
        STANDARD.decode(data).map_err(|err| {
            AdapterError::new(AdapterErrorKind::Internal).with_hint(err.to_string())
        })
    }

    async fn set_device_metrics(
        &self,
        page: PageId,
        width: u32,
        height: u32,
        device_scale_factor: f64,
        mobile: bool,
    ) -> Result<(), AdapterError> {
        self.send_page_command(
            page,
            "Emulation.setDeviceMetricsOverride",
            json!({
                "width": width,
                "height": height,
                "deviceScaleFactor": device_scale_factor,
                "mobile": mobile,
            }),
        )
        .await?;
        Ok(())
    }

    async fn list_targets(&self) -> Result<Vec<TargetSummary>, AdapterError> {
        let response = self.send_command("Target.getTargets", json!({})).await?;
        let payload: GetTargetsResult = decode(response)?;
        Ok(payload
            .target_infos
            .into_iter()
            .map(|info| TargetSummary {
                target_id: info.target_id,
                kind: info.target_type,
                url: info.url.unwrap_or_default(),
            })
            .collect())
    }

    async fn close_target(&self, target_id: &str) -> Result<(), AdapterError> {
        self.send_command("Target.closeTarget", json!({ "targetId": target_id }))
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), AdapterError> {
        if let Err(err) = self.send_command("Browser.close", json!({})).await {
            debug!(target: "cdp-adapter", ?err, "Browser.close failed");
        }
        self.shutdown().await;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RawEvent> {
        self.bus.subscribe()
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, AdapterError> {
    serde_json::from_value(value)
        .map_err(|err| AdapterError::new(AdapterErrorKind::Internal).with_hint(err.to_string()))
}

fn js_literal(raw: &str) -> Result<String, AdapterError> {
    serde_json::to_string(raw)
        .map_err(|err| AdapterError::new(AdapterErrorKind::Internal).with_hint(err.to_string()))
}

#[derive(Debug, Deserialize)]
struct TargetInfoPayload {
    #[serde(rename = "targetId")]
    target_id: String,
    #[serde(rename = "type")]
    target_type: String,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TargetCreatedParams {
    #[serde(rename = "targetInfo")]
    target_info: TargetInfoPayload,
}

#[derive(Debug, Deserialize)]
struct TargetDestroyedParams {
    #[serde(rename = "targetId")]
    target_id: String,
}

#[derive(Debug, Deserialize)]
struct AttachedToTargetParams {
    #[serde(rename = "sessionId")]
    session_id: String,
    #[serde(rename = "targetInfo")]
    target_info: TargetInfoPayload,
}

#[derive(Debug, Deserialize)]
struct DetachedFromTargetParams {
    #[serde(rename = "sessionId")]
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct GetTargetsResult {
    #[serde(rename = "targetInfos")]
    target_infos: Vec<TargetInfoPayload>,
}

#[derive(Debug, Deserialize)]
struct NetworkRequestParams {
    #[serde(rename = "requestId")]
    request_id: String,
}

#[derive(Debug, Deserialize)]
struct FrameNavigatedParams {
    frame: FramePayload,
}

#[derive(Debug, Deserialize)]
struct FramePayload {
    url: String,
    #[serde(rename = "parentId", default)]
    parent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BindingCalledParams {
    name: String,
    payload: String,
}

#[derive(Debug, Deserialize)]
struct ConsoleApiCalledParams {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    args: Vec<RemoteObjectPayload>,
}

#[derive(Debug, Deserialize)]
struct RemoteObjectPayload {
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    description: Option<String>,
}

impl RemoteObjectPayload {
    fn render(&self) -> String {
        match (&self.value, &self.description) {
            (Some(Value::String(text)), _) => text.clone(),
            (Some(other), _) => other.to_string(),
            (None, Some(description)) => description.clone(),
            (None, None) => String::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExceptionThrownParams {
    #[serde(rename = "exceptionDetails")]
    exception_details: ExceptionDetailsPayload,
}

#[derive(Debug, Deserialize)]
struct ExceptionDetailsPayload {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    exception: Option<ExceptionPayload>,
}

#[derive(Debug, Deserialize)]
struct ExceptionPayload {
    #[serde(default)]
    description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct MockTransport {
        starts: AtomicUsize,
        rx: Mutex<mpsc::Receiver<TransportEvent>>,
        commands: Mutex<Vec<(String, Value)>>,
        responses: Mutex<HashMap<String, VecDeque<Value>>>,
    }

    impl MockTransport {
        fn new_pair() -> (Arc<Self>, mpsc::Sender<TransportEvent>) {
            let (tx, rx) = mpsc::channel(16);
            (
                Arc::new(Self {
                    starts: AtomicUsize::new(0),
                    rx: Mutex::new(rx),
                    commands: Mutex::new(Vec::new()),
                    responses: Mutex::new(HashMap::new()),
                }),
                tx,
            )
        }

        async fn commands(&self, method: &str) -> Vec<Value> {
            self.commands
                .lock()
                .await
                .iter()
                .filter(|(name, _)| name == method)
                .map(|(_, params)| params.clone())
                .collect()
        }

        async fn respond(&self, method: &str, value: Value) {
            self.responses
                .lock()
                .await
                .entry(method.to_string())
                .or_default()
                .push_back(value);
        }
    }

    #[async_trait]
    impl CdpTransport for MockTransport {
        async fn start(&self) -> Result<(), AdapterError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn next_event(&self) -> Option<TransportEvent> {
            let mut guard = self.rx.lock().await;
            guard.recv().await
        }

        async fn send_command(
            &self,
            _target: CommandTarget,
            method: &str,
            params: Value,
        ) -> Result<Value, AdapterError> {
            self.commands
                .lock()
                .await
                .push((method.to_string(), params));
            Ok(self
                .responses
                .lock()
                .await
                .get_mut(method)
                .and_then(|queue| queue.pop_front())
                .unwrap_or(Value::Null))
        }
    }

    async fn started_adapter() -> (
        Arc<CdpAdapter>,
        Arc<MockTransport>,
        mpsc::Sender<TransportEvent>,
        broadcast::Receiver<RawEvent>,
        PageId,
    ) {
        let (bus, rx) = crate::event_bus(32);
        let (transport, tx) = MockTransport::new_pair();
        let adapter = Arc::new(CdpAdapter::with_transport(
            CdpConfig::default(),
            bus,
            transport.clone() as Arc<dyn CdpTransport>,
        ));
        Arc::clone(&adapter).start().await.expect("start adapter");
        let page = PageId::new();
        adapter.register_page(page, Some("T1".into()), Some("S1".into()));
        (adapter, transport, tx, rx, page)
    }

    fn session_event(method: &str, params: Value) -> TransportEvent {
        TransportEvent {
            method: method.into(),
            params,
            session_id: Some("S1".into()),
        }
    }

    #[tokio::test]
    async fn click_dispatches_press_and_release_at_anchor() {
        let (adapter, transport, _tx, _rx, page) = started_adapter().await;
        transport
            .respond(
                "Runtime.evaluate",
                json!({ "result": { "value": [
                    { "x": 12.0, "y": 34.0, "visible": true, "enabled": true }
                ] } }),
            )
            .await;

        let anchors = adapter
            .query(page, QuerySpec::document("#go"))
            .await
            .expect("query");
        adapter
            .click_anchor(page, &anchors[0])
            .await
            .expect("click");

        let mouse = transport.commands("Input.dispatchMouseEvent").await;
        assert_eq!(mouse.len(), 2);
        assert_eq!(mouse[0]["type"], "mousePressed");
        assert_eq!(mouse[1]["type"], "mouseReleased");
        assert_eq!(mouse[0]["x"], 12.0);
        assert_eq!(mouse[0]["y"], 34.0);
        adapter.shutdown().await;
    }

    #[tokio::test]
    async fn query_reports_visibility_and_enablement() {
        let (adapter, transport, _tx, _rx, page) = started_adapter().await;
        transport
            .respond(
                "Runtime.evaluate",
                json!({ "result": { "value": [
                    { "x": 1.0, "y": 1.0, "visible": false, "enabled": true },
                    { "x": 2.0, "y": 2.0, "visible": true, "enabled": false }
                ] } }),
            )
            .await;

        let anchors = adapter
            .query(page, QuerySpec::document("button"))
            .await
            .expect("query");
        assert_eq!(anchors.len(), 2);
        assert!(!anchors[0].visible);
        assert!(!anchors[1].enabled);
        assert!(anchors.iter().all(|anchor| !anchor.is_clickable()));
        adapter.shutdown().await;
    }

    #[tokio::test]
    async fn characters_are_sent_as_discrete_key_presses() {
        let (adapter, transport, _tx, _rx, page) = started_adapter().await;
        adapter.send_character(page, 'a').await.expect("char");
        adapter.press_key(page, Key::Enter).await.expect("enter");

        let keys = transport.commands("Input.dispatchKeyEvent").await;
        assert_eq!(keys.len(), 4);
        assert_eq!(keys[0]["type"], "keyDown");
        assert_eq!(keys[0]["text"], "a");
        assert_eq!(keys[1]["type"], "keyUp");
        assert_eq!(keys[2]["key"], "Enter");
        assert_eq!(keys[2]["text"], "\r");
        adapter.shutdown().await;
    }

    #[tokio::test]
    async fn navigation_error_text_is_a_failure() {
        let (adapter, transport, _tx, _rx, page) = started_adapter().await;
        transport
            .respond(
                "Page.navigate",
                json!({ "frameId": "F", "errorText": "net::ERR_NAME_NOT_RESOLVED" }),
            )
            .await;

        let err = adapter
            .navigate(page, "https://nowhere.invalid", Duration::from_secs(1))
            .await
            .expect_err("navigation must fail");
        assert_eq!(err.kind, AdapterErrorKind::NavFailed);
        assert!(err.hint.unwrap_or_default().contains("ERR_NAME_NOT_RESOLVED"));
        adapter.shutdown().await;
    }

    #[tokio::test]
    async fn lists_targets_from_browser() {
        let (adapter, transport, _tx, _rx, _page) = started_adapter().await;
        transport
            .respond(
                "Target.getTargets",
                json!({ "targetInfos": [
                    { "targetId": "A", "type": "page", "url": "https://accounts.google.com/o/oauth2" },
                    { "targetId": "B", "type": "service_worker", "url": "https://docs.google.com/sw.js" }
                ] }),
            )
            .await;

        let targets = adapter.list_targets().await.expect("targets");
        assert_eq!(
            targets[0],
            TargetSummary::page("A", "https://accounts.google.com/o/oauth2")
        );
        assert!(!targets[1].is_page());

        adapter.close_target("A").await.expect("close target");
        let closed = transport.commands("Target.closeTarget").await;
        assert_eq!(closed[0]["targetId"], "A");
        adapter.shutdown().await;
    }

    #[tokio::test]
    async fn binding_calls_reach_the_bus() {
        let (adapter, _transport, tx, mut rx, page) = started_adapter().await;
        tx.send(session_event(
            "Runtime.bindingCalled",
            json!({ "name": "__notify", "payload": "[\"Update all\",\"Done!\"]", "executionContextId": 1 }),
        ))
        .await
        .unwrap();

        let event = timeout(Duration::from_secs(1), async {
            loop {
                if let Ok(RawEvent::BindingCalled { page, name, payload }) = rx.recv().await {
                    return (page, name, payload);
                }
            }
        })
        .await
        .expect("binding event");
        assert_eq!(event.0, page);
        assert_eq!(event.1, "__notify");
        assert!(event.2.contains("Done!"));
        adapter.shutdown().await;
    }

    #[tokio::test]
    async fn network_quiet_tracks_inflight_requests() {
        let (adapter, _transport, tx, _rx, page) = started_adapter().await;
        tx.send(session_event("Network.requestWillBeSent", json!({ "requestId": "1" })))
            .await
            .unwrap();
        timeout(Duration::from_secs(1), async {
            while adapter.network.get(&page).map(|entry| entry.inflight.len()) != Some(1) {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("request recorded");

        let gate = WaitGate::NetworkQuiet {
            window_ms: 20,
            max_inflight: 0,
        };
        let busy = adapter
            .wait_basic(page, gate.clone(), Duration::from_millis(150))
            .await
            .expect_err("request still inflight");
        assert!(busy.is_timeout());

        tx.send(session_event("Network.loadingFinished", json!({ "requestId": "1" })))
            .await
            .unwrap();
        adapter
            .wait_basic(page, gate, Duration::from_secs(2))
            .await
            .expect("quiet after the request finished");
        adapter.shutdown().await;
    }

    async fn inflight_count(adapter: &CdpAdapter, page: PageId, expected: usize) {
        timeout(Duration::from_secs(1), async {
            while adapter.network.get(&page).map(|entry| entry.inflight.len()) != Some(expected) {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("inflight requests settle on the expected count");
    }

    #[tokio::test]
    async fn redirected_request_counts_once() {
        let (adapter, _transport, tx, _rx, page) = started_adapter().await;
        tx.send(session_event("Network.requestWillBeSent", json!({ "requestId": "1" })))
            .await
            .unwrap();
        tx.send(session_event(
            "Network.requestWillBeSent",
            json!({ "requestId": "1", "redirectResponse": { "status": 302 } }),
        ))
        .await
        .unwrap();
        inflight_count(&adapter, page, 1).await;

        tx.send(session_event("Network.loadingFinished", json!({ "requestId": "1" })))
            .await
            .unwrap();
        let gate = WaitGate::NetworkQuiet {
            window_ms: 20,
            max_inflight: 0,
        };
        adapter
            .wait_basic(page, gate, Duration::from_secs(2))
            .await
            .expect("a redirect chain finishes with a single loadingFinished");
        adapter.shutdown().await;
    }

    #[tokio::test]
    async fn top_frame_navigation_forgets_pending_requests() {
        let (adapter, _transport, tx, _rx, page) = started_adapter().await;
        for id in ["1", "2", "3"] {
            tx.send(session_event("Network.requestWillBeSent", json!({ "requestId": id })))
                .await
                .unwrap();
        }
        inflight_count(&adapter, page, 3).await;

        tx.send(session_event(
            "Page.frameNavigated",
            json!({ "frame": { "id": "F1", "parentId": "F0", "url": "https://docs.google.com/frame" } }),
        ))
        .await
        .unwrap();
        tx.send(session_event(
            "Network.requestWillBeSent",
            json!({ "requestId": "4" }),
        ))
        .await
        .unwrap();
        inflight_count(&adapter, page, 4).await;

        tx.send(session_event(
            "Page.frameNavigated",
            json!({ "frame": { "id": "F0", "url": "https://docs.google.com/spreadsheets/d/abc" } }),
        ))
        .await
        .unwrap();
        inflight_count(&adapter, page, 0).await;
        adapter.shutdown().await;
    }

    #[tokio::test]
    async fn within_tolerance_counts_as_quiet() {
        let (adapter, _transport, tx, _rx, page) = started_adapter().await;
        for id in ["poll-1", "poll-2"] {
            tx.send(session_event("Network.requestWillBeSent", json!({ "requestId": id })))
                .await
                .unwrap();
        }
        inflight_count(&adapter, page, 2).await;

        let gate = WaitGate::NetworkQuiet {
            window_ms: 20,
            max_inflight: 2,
        };
        adapter
            .wait_basic(page, gate, Duration::from_secs(2))
            .await
            .expect("two long polls do not block quiet");
        adapter.shutdown().await;
    }

    #[tokio::test]
    async fn commands_and_navigation_failures_reach_the_metrics_dump() {
        let (adapter, transport, _tx, _rx, page) = started_adapter().await;
        transport
            .respond(
                "Page.navigate",
                json!({ "frameId": "F", "errorText": "net::ERR_ABORTED" }),
            )
            .await;
        let _ = adapter
            .navigate(page, "https://docs.google.com", Duration::from_secs(1))
            .await;

        let text = adapter.metrics_text();
        assert!(text.contains(r#"autopilot_cdp_commands_total{method="Page.navigate"}"#));
        assert!(text.contains("autopilot_navigation_failures_total"));
        adapter.shutdown().await;
    }

    #[tokio::test]
    async fn disconnect_is_reported_without_restart() {
        let (bus, mut rx) = crate::event_bus(8);
        let (transport, tx) = MockTransport::new_pair();
        let adapter = Arc::new(CdpAdapter::with_transport(
            CdpConfig::default(),
            bus,
            transport.clone() as Arc<dyn CdpTransport>,
        ));
        Arc::clone(&adapter).start().await.expect("start adapter");
        drop(tx);

        let message = timeout(Duration::from_secs(1), async {
            loop {
                if let Ok(RawEvent::Error { message, .. }) = rx.recv().await {
                    return message;
                }
            }
        })
        .await
        .expect("error event");
        assert_eq!(message, "cdp connection lost");
        assert_eq!(transport.starts.load(Ordering::SeqCst), 1);
        adapter.shutdown().await;
    }
}
