use anyhow::{Context, Result};
use async_trait::async_trait;
use thirtyfour::extensions::cdp::ChromeDevTools;
use thirtyfour::WebDriver;

#[cfg(test)]
use mockall::automock;

/// Handle to a live browser page
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PageHandle: Send + Sync {
    /// Run a script in the page
    async fn evaluate(&self, script: &str) -> Result<()>;

    /// Override the user agent for subsequent navigations
    async fn set_user_agent(&self, user_agent: &str) -> Result<()>;

    /// PNG screenshot of the viewport
    async fn screenshot(&self) -> Result<Vec<u8>>;

    /// Current page HTML
    async fn content(&self) -> Result<String>;
}

#[async_trait]
impl PageHandle for WebDriver {
    async fn evaluate(&self, script: &str) -> Result<()> {
        self.execute(script, Vec::new())
            .await
            .context("Failed to execute JavaScript")?;
        Ok(())
    }

    async fn set_user_agent(&self, user_agent: &str) -> Result<()> {
        let dev_tools = ChromeDevTools::new(self.handle.clone());
        dev_tools
            .execute_cdp_with_params(
                "Network.setUserAgentOverride",
                serde_json::json!({ "userAgent": user_agent }),
            )
            .await
            .context("Failed to override user agent")?;
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        let png = self.screenshot_as_png().await.context("Failed to take screenshot")?;
        Ok(png)
    }

    async fn content(&self) -> Result<String> {
        let source = self.source().await.context("Failed to get page source")?;
        Ok(source)
    }
}
