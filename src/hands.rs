use std::sync::Arc;

use async_trait::async_trait;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, LaunchOptions, Tab};
use parking_lot::Mutex;
use serde_json::Value;

use crate::errors::{UnsubError, UnsubResult};

/// What the agent loop needs from a browser.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> UnsubResult<()>;

    /// PNG bytes of the current viewport.
    async fn screenshot(&self) -> UnsubResult<Vec<u8>>;

    /// Evaluates `script` in the active page and returns its value
    /// (`Value::Null` when the page produced nothing serializable).
    async fn execute_script(&self, script: &str) -> UnsubResult<ScriptValue>;

    /// Window handles, oldest first.
    async fn list_windows(&self) -> UnsubResult<Vec<String>>;

    async fn switch_to_window(&self, handle: &str) -> UnsubResult<()>;
}

/// Result of one evaluation: the value, plus the driver's description of it
/// (for thrown errors the description carries the message).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptValue {
    pub value: Value,
    pub description: Option<String>,
}

impl ScriptValue {
    pub fn string(s: impl Into<String>) -> Self {
        Self {
            value: Value::String(s.into()),
            description: None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.value.as_str()
    }
}

/// Chrome session driven over CDP. Every call hops onto the blocking pool
/// since headless_chrome is synchronous.
pub struct ChromeDriver {
    browser: Browser,
    tab: Arc<Mutex<Arc<Tab>>>,
}

impl ChromeDriver {
    pub fn launch(headless: bool) -> UnsubResult<Self> {
        let options = LaunchOptions::default_builder()
            .headless(headless)
            .window_size(Some((1000, 1000)))
            .build()
            .map_err(|e| UnsubError::Driver(format!("bad launch options: {e}")))?;

        tracing::info!(headless, "starting Chrome");
        let browser = Browser::new(options).map_err(driver_err)?;
        let tab = browser.new_tab().map_err(driver_err)?;
        tab.navigate_to("about:blank").map_err(driver_err)?;
        tracing::info!("Chrome ready");

        Ok(Self {
            browser,
            tab: Arc::new(Mutex::new(tab)),
        })
    }

    fn active_tab(&self) -> Arc<Tab> {
        self.tab.lock().clone()
    }

    async fn blocking<T, F>(&self, f: F) -> UnsubResult<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Tab>) -> UnsubResult<T> + Send + 'static,
    {
        let tab = self.active_tab();
        tokio::task::spawn_blocking(move || f(tab))
            .await
            .map_err(|e| UnsubError::Driver(format!("browser task panicked: {e}")))?
    }
}

#[async_trait]
impl BrowserDriver for ChromeDriver {
    async fn navigate(&self, url: &str) -> UnsubResult<()> {
        let url = url.to_string();
        self.blocking(move |tab| {
            tab.navigate_to(&url).map_err(driver_err)?;
            tab.wait_until_navigated().map_err(driver_err)?;
            Ok(())
        })
        .await
    }

    async fn screenshot(&self) -> UnsubResult<Vec<u8>> {
        self.blocking(|tab| {
            tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)
                .map_err(driver_err)
        })
        .await
    }

    async fn execute_script(&self, script: &str) -> UnsubResult<ScriptValue> {
        let script = script.to_string();
        self.blocking(move |tab| {
            let result = tab.evaluate(&script, false).map_err(driver_err)?;
            Ok(ScriptValue {
                value: result.value.unwrap_or(Value::Null),
                description: result.description,
            })
        })
        .await
    }

    async fn list_windows(&self) -> UnsubResult<Vec<String>> {
        let tabs = self
            .browser
            .get_tabs()
            .lock()
            .map_err(|_| UnsubError::Driver("tab list lock poisoned".into()))?;
        Ok(tabs.iter().map(|t| t.get_target_id().to_string()).collect())
    }

    async fn switch_to_window(&self, handle: &str) -> UnsubResult<()> {
        let tab = {
            let tabs = self
                .browser
                .get_tabs()
                .lock()
                .map_err(|_| UnsubError::Driver("tab list lock poisoned".into()))?;
            tabs.iter()
                .find(|t| t.get_target_id() == handle)
                .cloned()
                .ok_or_else(|| UnsubError::Driver(format!("no window with handle {handle}")))?
        };
        if Arc::ptr_eq(&tab, &self.active_tab()) {
            return Ok(());
        }
        tracing::debug!(handle, "switching to window");
        *self.tab.lock() = tab.clone();
        tokio::task::spawn_blocking(move || tab.activate().map(|_| ()).map_err(driver_err))
            .await
            .map_err(|e| UnsubError::Driver(format!("browser task panicked: {e}")))?
    }
}

fn driver_err(e: impl std::fmt::Display) -> UnsubError {
    UnsubError::Driver(e.to_string())
}
