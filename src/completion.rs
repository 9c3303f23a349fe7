//! Completion detection from transient UI notifications
//!
//! A MutationObserver installed in the page forwards the child texts of every notification node
//! appended to the root container through a CDP binding. The decision itself happens here: the
//! observer races the forwarded notifications against a rolling inactivity ceiling and resolves
//! only on an exact match of the terminal message.

use std::fmt;
use std::time::Duration;

use action_flow::{FlowError, PageHandle};
use cdp_adapter::RawEvent;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

/// Name of the page function the notification observer calls
pub const NOTIFICATION_BINDING: &str = "__autopilotNotify";

/// One notification, its child texts joined with ": "
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub text: String,
}

impl Notification {
    /// Compose a notification from the rendered texts of its element children, kept verbatim.
    ///
    /// Nodes with fewer than two children are not notifications.
    pub fn from_parts<I, S>(parts: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let parts: Vec<String> = parts
            .into_iter()
            .map(|part| part.as_ref().to_string())
            .collect();
        if parts.len() < 2 {
            return None;
        }
        Some(Self {
            text: parts.join(": "),
        })
    }

    /// Decode a binding payload: a JSON array of child texts.
    pub fn from_payload(payload: &str) -> Option<Self> {
        let parts: Vec<String> = serde_json::from_str(payload).ok()?;
        Self::from_parts(parts)
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// How the wait for the terminal message ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Success {
        messages: Vec<String>,
    },
    TimedOut {
        idle: Duration,
        last_message: Option<String>,
        messages: Vec<String>,
    },
}

impl Completion {
    pub fn is_success(&self) -> bool {
        matches!(self, Completion::Success { .. })
    }

    /// Failure for a run that never saw the terminal message
    pub fn into_error(self) -> Option<FlowError> {
        match self {
            Completion::Success { .. } => None,
            Completion::TimedOut {
                idle, last_message, ..
            } => Some(FlowError::CompletionTimeout {
                idle_ms: idle.as_millis() as u64,
                last_message,
            }),
        }
    }
}

/// Waits for an exact terminal message with a rolling inactivity ceiling
#[derive(Debug, Clone)]
pub struct CompletionObserver {
    terminal_text: String,
    inactivity_ceiling: Duration,
}

impl CompletionObserver {
    pub fn new(terminal_text: impl Into<String>, inactivity_ceiling: Duration) -> Self {
        Self {
            terminal_text: terminal_text.into(),
            inactivity_ceiling,
        }
    }

    pub fn terminal_text(&self) -> &str {
        &self.terminal_text
    }

    /// Consume notifications until the terminal message arrives or the ceiling elapses since the
    /// last notification (or since the call, if none arrived).
    pub async fn await_terminal_message(
        &self,
        notifications: &mut mpsc::UnboundedReceiver<Notification>,
    ) -> Completion {
        let ceiling = self.inactivity_ceiling;
        let idle = time::sleep(ceiling);
        tokio::pin!(idle);

        let mut messages = Vec::new();
        let mut source_open = true;

        loop {
            tokio::select! {
                biased;

                received = notifications.recv(), if source_open => match received {
                    Some(notification) => {
                        idle.as_mut().reset(Instant::now() + ceiling);
                        info!(message = %notification, "notification");
                        let done = notification.text == self.terminal_text;
                        messages.push(notification.text);
                        if done {
                            return Completion::Success { messages };
                        }
                    }
                    None => {
                        debug!("notification source closed; waiting out the ceiling");
                        source_open = false;
                    }
                },
                _ = &mut idle => {
                    warn!(
                        ceiling_ms = ceiling.as_millis() as u64,
                        seen = messages.len(),
                        "no terminal notification before the inactivity ceiling"
                    );
                    return Completion::TimedOut {
                        idle: ceiling,
                        last_message: messages.last().cloned(),
                        messages,
                    };
                }
            }
        }
    }
}

/// Live feed of notifications appended under a root container of the page
pub struct NotificationFeed {
    root_selector: String,
    receiver: mpsc::UnboundedReceiver<Notification>,
    pump: JoinHandle<()>,
}

impl fmt::Debug for NotificationFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationFeed")
            .field("root_selector", &self.root_selector)
            .finish()
    }
}

impl NotificationFeed {
    /// Register the binding, start forwarding its calls and install the page observer.
    ///
    /// Notifications appended after this returns are buffered until awaited.
    pub async fn install(page: &PageHandle, root_selector: &str) -> Result<Self, FlowError> {
        let mut events = page.cdp().subscribe();
        let (sender, receiver) = mpsc::unbounded_channel();
        let page_id = page.id();

        let pump = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(RawEvent::BindingCalled {
                        page,
                        name,
                        payload,
                    }) if page == page_id && name == NOTIFICATION_BINDING => {
                        match Notification::from_payload(&payload) {
                            Some(notification) => {
                                if sender.send(notification).is_err() {
                                    break;
                                }
                            }
                            None => debug!(%payload, "ignoring malformed notification payload"),
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "notification pump lagged behind the event bus");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let feed = Self {
            root_selector: root_selector.to_string(),
            receiver,
            pump,
        };
        page.cdp().add_binding(page.id(), NOTIFICATION_BINDING).await?;
        feed.arm(page).await?;
        Ok(feed)
    }

    /// (Re)install the page observer; needed after every navigation of the page.
    pub async fn arm(&self, page: &PageHandle) -> Result<(), FlowError> {
        let script = observer_script(NOTIFICATION_BINDING, &self.root_selector);
        let result = page.cdp().evaluate_script(page.id(), &script).await?;
        match result.get("status").and_then(|status| status.as_str()) {
            Some(status @ ("installed" | "pending")) => {
                debug!(status, root = %self.root_selector, "notification observer armed");
                Ok(())
            }
            other => Err(FlowError::step(
                "arm completion feed",
                format!(
                    "notification observer not installed: {}",
                    other.unwrap_or("no status")
                ),
            )),
        }
    }

    pub async fn await_terminal(&mut self, observer: &CompletionObserver) -> Completion {
        observer.await_terminal_message(&mut self.receiver).await
    }
}

impl Drop for NotificationFeed {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

fn observer_script(binding: &str, root_selector: &str) -> String {
    let binding = serde_json::Value::from(binding);
    let root = serde_json::Value::from(root_selector);
    format!(
        r#"(() => {{
  const notify = window[{binding}];
  if (typeof notify !== 'function') return {{ status: 'unbound' }};
  if (window.__autopilotObserver) window.__autopilotObserver.disconnect();
  const forward = (node) => {{
    if (node.nodeType !== Node.ELEMENT_NODE || node.children.length < 2) return;
    const parts = Array.from(node.children, (child) => child.innerText ?? child.textContent ?? '');
    notify(JSON.stringify(parts));
  }};
  const watch = (root) => {{
    const observer = new MutationObserver((mutations) => {{
      for (const mutation of mutations) mutation.addedNodes.forEach(forward);
    }});
    observer.observe(root, {{ childList: true }});
    window.__autopilotObserver = observer;
  }};
  const root = document.querySelector({root});
  if (root) {{
    watch(root);
    return {{ status: 'installed' }};
  }}
  if (!document.body) return {{ status: 'missing' }};
  const waiting = new MutationObserver(() => {{
    const found = document.querySelector({root});
    if (found) {{
      waiting.disconnect();
      watch(found);
    }}
  }});
  waiting.observe(document.body, {{ childList: true, subtree: true }});
  window.__autopilotObserver = waiting;
  return {{ status: 'pending' }};
}})()"#
    )
}
