//! Page-level actions built on the adapter and the condition waiter

use std::sync::Arc;
use std::time::Duration;

use cdp_adapter::{AdapterErrorKind, Anchor, Cdp, Key, PageId, QuerySpec};
use serde_json::Value;
use tracing::debug;

use crate::errors::FlowError;
use crate::waiter::{ConditionWaiter, TimeoutTier, TimeoutTiers, WaitCondition};

/// Handle to the primary page that steps act on
#[derive(Clone)]
pub struct PageHandle {
    waiter: ConditionWaiter,
}

impl PageHandle {
    pub fn new(cdp: Arc<dyn Cdp>, page: PageId, tiers: TimeoutTiers) -> Self {
        Self {
            waiter: ConditionWaiter::new(cdp, page, tiers),
        }
    }

    pub fn cdp(&self) -> &Arc<dyn Cdp> {
        self.waiter.cdp()
    }

    pub fn id(&self) -> PageId {
        self.waiter.page()
    }

    pub fn tiers(&self) -> &TimeoutTiers {
        self.waiter.tiers()
    }

    pub fn timeout(&self, tier: TimeoutTier) -> Duration {
        self.tiers().duration(tier)
    }

    pub async fn wait_for(
        &self,
        condition: &WaitCondition,
        tier: TimeoutTier,
    ) -> Result<(), FlowError> {
        self.waiter.wait_for(condition, tier).await
    }

    /// Navigate and wait until the document is interactive.
    pub async fn goto(&self, url: &str, tier: TimeoutTier) -> Result<(), FlowError> {
        debug!(url, "navigating");
        match self.cdp().navigate(self.id(), url, self.timeout(tier)).await {
            Ok(()) => Ok(()),
            Err(err)
                if matches!(
                    err.kind,
                    AdapterErrorKind::NavFailed | AdapterErrorKind::NavTimeout
                ) =>
            {
                Err(FlowError::NavigationFailed {
                    url: url.to_string(),
                    reason: err.hint.unwrap_or_else(|| err.kind.to_string()),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Wait for the network to go idle.
    pub async fn settle(&self, tier: TimeoutTier) -> Result<(), FlowError> {
        self.wait_for(&WaitCondition::NetworkIdle, tier).await
    }

    /// Wait until `selector` is clickable, then click its first visible match.
    pub async fn click_when_possible(
        &self,
        selector: &str,
        tier: TimeoutTier,
    ) -> Result<(), FlowError> {
        self.wait_for(&WaitCondition::ElementClickable(selector.to_string()), tier)
            .await?;
        self.click_first_visible(selector).await
    }

    /// Click the first visible match of `selector`.
    pub async fn click_first_visible(&self, selector: &str) -> Result<(), FlowError> {
        let anchor = self
            .first_visible(selector)
            .await?
            .ok_or_else(|| FlowError::TargetNotFound(format!("no visible match for {selector}")))?;
        self.cdp().click_anchor(self.id(), &anchor).await?;
        Ok(())
    }

    /// Click the first visible match of `selector` if there is one.
    pub async fn click_if_present(&self, selector: &str) -> Result<bool, FlowError> {
        match self.first_visible(selector).await? {
            Some(anchor) => {
                self.cdp().click_anchor(self.id(), &anchor).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn first_visible(&self, selector: &str) -> Result<Option<Anchor>, FlowError> {
        let anchors = self
            .cdp()
            .query(self.id(), QuerySpec::document(selector))
            .await?;
        Ok(anchors.into_iter().find(|anchor| anchor.visible))
    }

    /// Type `text` into the focused element one key press per character.
    pub async fn type_keystrokes(&self, text: &str) -> Result<(), FlowError> {
        for ch in text.chars() {
            self.cdp().send_character(self.id(), ch).await?;
        }
        Ok(())
    }

    pub async fn press(&self, key: Key) -> Result<(), FlowError> {
        self.cdp().press_key(self.id(), key).await?;
        Ok(())
    }

    pub async fn text_of(&self, selector: &str) -> Result<Option<String>, FlowError> {
        Ok(self.cdp().text_content(self.id(), selector).await?)
    }

    /// Read attribute `name` of the first match of `selector`.
    pub async fn attribute_of(
        &self,
        selector: &str,
        name: &str,
    ) -> Result<Option<String>, FlowError> {
        let expression = format!(
            "(() => {{ const el = document.querySelector({selector}); return el ? el.getAttribute({name}) : null; }})()",
            selector = Value::from(selector),
            name = Value::from(name),
        );
        let value = self.cdp().evaluate_script(self.id(), &expression).await?;
        Ok(value.as_str().map(str::to_string))
    }

    pub async fn screenshot(&self, deadline: Duration) -> Result<Vec<u8>, FlowError> {
        Ok(self.cdp().screenshot(self.id(), deadline).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdp_adapter::fake::{FakeBrowser, FakeCall, FakeElement};
    use tokio_test::{assert_err, assert_ok};

    fn handle(fake: &Arc<FakeBrowser>) -> PageHandle {
        PageHandle::new(fake.clone(), fake.page(), TimeoutTiers::default())
    }

    #[tokio::test]
    async fn keystrokes_are_sent_one_per_character() {
        let fake = Arc::new(FakeBrowser::new());
        let page = handle(&fake);
        assert_ok!(page.type_keystrokes("user@example.com").await);
        assert_ok!(page.press(Key::Enter).await);

        assert_eq!(fake.typed_text(), "user@example.com");
        assert_eq!(fake.calls().last(), Some(&FakeCall::Key(Key::Enter)));
    }

    #[tokio::test]
    async fn first_visible_match_is_clicked() {
        let fake = Arc::new(
            FakeBrowser::new()
                .with_element(FakeElement::new("#hidden-first").hidden())
                .with_element(FakeElement::new("#trigger")),
        );
        let page = handle(&fake);

        assert!(!page.click_if_present("#hidden-first").await.unwrap());
        assert!(!page.click_if_present("#absent").await.unwrap());
        page.click_first_visible("#trigger").await.unwrap();
        assert_eq!(fake.clicks(), vec!["#trigger".to_string()]);

        let err = assert_err!(page.click_first_visible("#absent").await);
        assert!(matches!(err, FlowError::TargetNotFound(_)));
    }

    #[tokio::test]
    async fn attribute_reads_go_through_page_script() {
        let fake = Arc::new(
            FakeBrowser::new().with_evaluate_result(serde_json::json!("https://example.com/p")),
        );
        let page = handle(&fake);

        let href = page.attribute_of("a.link", "href").await.unwrap();
        assert_eq!(href.as_deref(), Some("https://example.com/p"));
        assert!(fake.calls().contains(&FakeCall::Evaluate));

        let fake = Arc::new(FakeBrowser::new().with_evaluate_result(Value::Null));
        let missing = handle(&fake).attribute_of("a.link", "href").await.unwrap();
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn navigation_failures_carry_the_url() {
        let fake = Arc::new(
            FakeBrowser::new().failing_navigation("https://bad.example", "net::ERR_ABORTED"),
        );
        let page = handle(&fake);

        let err = page
            .goto("https://bad.example", TimeoutTier::Large)
            .await
            .unwrap_err();
        match err {
            FlowError::NavigationFailed { url, reason } => {
                assert_eq!(url, "https://bad.example");
                assert!(reason.contains("ERR_ABORTED"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
