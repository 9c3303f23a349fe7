//! Command parameter types exposed by the CDP adapter interface.

use serde::{Deserialize, Serialize};

/// A CSS selector evaluated against the top-level document of a page.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuerySpec {
    pub selector: String,
}

impl QuerySpec {
    pub fn document(selector: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
        }
    }
}

/// A matched element: where to click it and whether it can take a click right now.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Anchor {
    pub backend_node_id: Option<u64>,
    pub x: f64,
    pub y: f64,
    pub visible: bool,
    pub enabled: bool,
}

impl Anchor {
    pub fn is_clickable(&self) -> bool {
        self.visible && self.enabled
    }
}

/// Page states `wait_basic` can block on.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WaitGate {
    /// At most `max_inflight` requests pending, and no request activity for `window_ms`
    NetworkQuiet { window_ms: u64, max_inflight: u32 },
}

/// Keys the adapter can press outside of plain character input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Key {
    Enter,
    Tab,
    Escape,
}

impl Key {
    pub(crate) fn descriptor(self) -> (&'static str, &'static str, i64, Option<&'static str>) {
        match self {
            Key::Enter => ("Enter", "Enter", 13, Some("\r")),
            Key::Tab => ("Tab", "Tab", 9, None),
            Key::Escape => ("Escape", "Escape", 27, None),
        }
    }
}

/// Browser-level view of a target, as reported by `Target.getTargets`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSummary {
    pub target_id: String,
    pub kind: String,
    pub url: String,
}

impl TargetSummary {
    pub fn page(target_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            kind: "page".to_string(),
            url: url.into(),
        }
    }

    pub fn is_page(&self) -> bool {
        self.kind == "page"
    }
}
