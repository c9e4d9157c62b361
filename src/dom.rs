use serde::Deserialize;

use crate::errors::{UnsubError, UnsubResult};
use crate::hands::BrowserDriver;
use crate::types::AgentStatus;

/// Host runtime installed into the page before every execution. Navigation
/// and reloads wipe `window`, so it has to be reinstalled each turn.
///
/// Bindings exposed to model code:
///   print(x)          append String(x) + '\n' to the output buffer
///   success()         set the terminal status to success
///   failure()         set the terminal status to failure
///   scrollDown()      scroll the viewport down by a fixed increment
///   clickText(text)   click every visible element labelled `text`
pub const RUNTIME_JS: &str = r#"
(() => {
  window.logMessages = '';
  window.unspamStatus = null;
  window.print = (x) => {
    window.logMessages += String(x) + '\n';
  };
  window.success = () => {
    window.unspamStatus = 'success';
  };
  window.failure = () => {
    window.unspamStatus = 'failure';
  };
  window.scrollDown = () => {
    window.scrollBy(0, 500);
  };
  window.clickText = (targetText) => {
    const want = String(targetText).trim().toLowerCase();
    const isField = (el) => el.tagName === 'INPUT' || el.tagName === 'BUTTON';
    const labelOf = (el) => {
      if (isField(el)) {
        const v = (el.value || '').trim();
        if (v) return v;
      }
      return (el.textContent || '').trim();
    };
    const isVisible = (el) => {
      const s = getComputedStyle(el);
      if (s.display === 'none' || s.visibility === 'hidden') return false;
      const r = el.getBoundingClientRect();
      return r.width > 0 && r.height > 0;
    };
    const matches = [...document.querySelectorAll('body *')]
      .filter((el) => labelOf(el).toLowerCase() === want);
    const leaves = matches.filter((el) => isField(el) || el.children.length === 0);
    const targets = leaves.length ? leaves : matches;
    let clicked = false;
    for (const el of targets) {
      if (!isVisible(el)) continue;
      el.click();
      clicked = true;
    }
    return clicked;
  };
})()
"#;

/// Collects print output and terminal status after the model's code ran.
pub const READ_BACK_JS: &str = r#"
JSON.stringify({
  output: typeof window.logMessages === 'string' ? window.logMessages : '',
  status: window.unspamStatus || null
})
"#;

/// Structural overview of the page: interactive element counts and how much
/// of the page height fits in the viewport.
pub const PAGE_SUMMARY_JS: &str = r#"
(() => {
  const count = (sel) => document.querySelectorAll(sel).length;
  const doc = document.documentElement;
  return JSON.stringify({
    links: count('a[href]'),
    buttons: count('button, input[type=button], input[type=submit]'),
    text_inputs: count('input[type=text], input[type=email], input:not([type]), textarea'),
    checkboxes: count('input[type=checkbox], input[type=radio]'),
    selects: count('select'),
    viewport_height: window.innerHeight,
    page_height: Math.max(doc.scrollHeight, document.body ? document.body.scrollHeight : 0)
  });
})()
"#;

pub const PAGE_HTML_JS: &str = "document.documentElement.outerHTML";

/// Wraps model code so a thrown error comes back as data instead of
/// aborting the evaluation. The code runs as a function body, so a bare
/// `return` is legal.
pub fn wrap_user_code(code: &str) -> String {
    format!(
        r#"(() => {{
  try {{
    (function () {{
{code}
    }})();
    return JSON.stringify({{ ok: true }});
  }} catch (e) {{
    return JSON.stringify({{ ok: false, error: String(e) }});
  }}
}})()"#
    )
}

#[derive(Debug, Deserialize)]
struct ExecOutcome {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

/// What the page reported back after a turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageReport {
    pub output: String,
    pub status: Option<AgentStatus>,
}

#[derive(Debug, Deserialize)]
struct RawReport {
    #[serde(default)]
    output: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct PageSummary {
    pub links: u32,
    pub buttons: u32,
    pub text_inputs: u32,
    pub checkboxes: u32,
    pub selects: u32,
    pub viewport_height: f64,
    pub page_height: f64,
}

impl PageSummary {
    /// Share of the page height visible in one viewport, capped at 1.
    pub fn visible_fraction(&self) -> f64 {
        if self.page_height <= 0.0 {
            return 1.0;
        }
        (self.viewport_height / self.page_height).min(1.0)
    }

    pub fn describe(&self) -> String {
        format!(
            "Page structure: {} links, {} buttons, {} text inputs, {} checkboxes/radio buttons, \
             {} dropdowns. The screenshot shows about {:.0}% of the page height.",
            self.links,
            self.buttons,
            self.text_inputs,
            self.checkboxes,
            self.selects,
            self.visible_fraction() * 100.0
        )
    }
}

pub async fn install_runtime(driver: &dyn BrowserDriver) -> UnsubResult<()> {
    driver.execute_script(RUNTIME_JS).await?;
    Ok(())
}

/// Runs model code. `Err(UnsubError::Script)` means the code threw or did not
/// parse; any other error came from the driver itself.
pub async fn run_user_code(driver: &dyn BrowserDriver, code: &str) -> UnsubResult<()> {
    let result = driver.execute_script(&wrap_user_code(code)).await?;
    let outcome = result
        .as_str()
        .and_then(|raw| serde_json::from_str::<ExecOutcome>(raw).ok());
    match outcome {
        Some(ExecOutcome { ok: true, .. }) => Ok(()),
        Some(ExecOutcome { error, .. }) => Err(UnsubError::Script(
            error.unwrap_or_else(|| "unknown error".to_string()),
        )),
        None => Err(UnsubError::Script(
            result
                .description
                .unwrap_or_else(|| "script could not be evaluated".to_string()),
        )),
    }
}

pub async fn read_back(driver: &dyn BrowserDriver) -> UnsubResult<PageReport> {
    let result = driver.execute_script(READ_BACK_JS).await?;
    let Some(raw) = result.as_str() else {
        // the runtime vanished, most likely because the code navigated away
        return Ok(PageReport::default());
    };
    let raw: RawReport = serde_json::from_str(raw)?;
    let status = match raw.status.as_deref() {
        Some("success") => Some(AgentStatus::Success),
        Some("failure") => Some(AgentStatus::Failure),
        Some(other) => {
            tracing::warn!(status = other, "ignoring unknown page status");
            None
        }
        None => None,
    };
    Ok(PageReport {
        output: raw.output,
        status,
    })
}

pub async fn page_summary(driver: &dyn BrowserDriver) -> UnsubResult<Option<PageSummary>> {
    let result = driver.execute_script(PAGE_SUMMARY_JS).await?;
    Ok(result
        .as_str()
        .and_then(|raw| serde_json::from_str::<PageSummary>(raw).ok()))
}

pub async fn page_html(driver: &dyn BrowserDriver) -> UnsubResult<String> {
    let result = driver.execute_script(PAGE_HTML_JS).await?;
    Ok(result.as_str().unwrap_or_default().to_string())
}
