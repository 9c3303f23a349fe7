//! Adapter registry keeping track of active pages and the sessions attached to them.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::ids::PageId;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TargetContext {
    pub target_id: Option<String>,
    /// Flattened CDP session; commands for the page are routed through it
    pub cdp_session: Option<String>,
}

/// Concurrent registry for pages and sessions.
#[derive(Default)]
pub struct Registry {
    pages: DashMap<PageId, TargetContext>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_page(&self, page: PageId, target_id: Option<String>) {
        let ctx = TargetContext {
            target_id,
            cdp_session: None,
        };
        self.pages.insert(page, ctx);
    }

    pub fn remove_page(&self, page: &PageId) -> Option<TargetContext> {
        self.pages.remove(page).map(|(_, ctx)| ctx)
    }

    pub fn get(&self, page: &PageId) -> Option<TargetContext> {
        self.pages.get(page).map(|entry| entry.value().clone())
    }

    pub fn pages(&self) -> Vec<PageId> {
        self.pages.iter().map(|kv| *kv.key()).collect()
    }

    pub fn set_cdp_session(&self, page: &PageId, session: String) {
        if let Some(mut entry) = self.pages.get_mut(page) {
            entry.cdp_session = Some(session);
        }
    }

    pub fn get_cdp_session(&self, page: &PageId) -> Option<String> {
        self.pages
            .get(page)
            .and_then(|entry| entry.cdp_session.clone())
    }

    pub fn is_attached(&self, page: &PageId) -> bool {
        self.get_cdp_session(page).is_some()
    }

    pub fn clear(&self) {
        self.pages.clear();
    }
}
