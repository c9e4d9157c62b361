use std::sync::LazyLock;

use image::RgbaImage;
use regex::Regex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::brain::{GatewayInput, LanguageModel};
use crate::config::AgentConfig;
use crate::dom::{self, PageReport, PageSummary};
use crate::errors::{UnsubError, UnsubResult};
use crate::eyes::{self, Screenshot};
use crate::hands::BrowserDriver;
use crate::types::{AgentStatus, Chunk, Conversation, Message};

pub const INSTRUCTIONS: &str = "You are an agent which executes JavaScript to control webpages.";

pub const MALFORMED_REPLY: &str = "expected exactly one codeblock in your response";

const NO_PRIOR_OUTPUT: &str =
    "There is no output from previous code yet, because this is the first step.";

const UNCHANGED_NOTICE: &str = "The page looks exactly the same as it did before your last \
    code ran, so no new screenshot is attached. Your code did not visibly change anything.";

const DESCRIBE_HTML_INSTRUCTIONS: &str = "You will be given the HTML source code of a webpage, \
    possibly only one part of it. Describe in plain language what the page contains, focusing on \
    anything related to email subscriptions: forms, checkboxes, buttons, links, and their labels \
    or ids. Be concise.";

static CODE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[a-zA-Z]*\n(.*?)```").expect("code block regex"));

fn task_prompt(user_email: &str) -> String {
    format!(
        "Below is a screenshot of a webpage from an email Unsubscribe link. \
         Your goal is to figure out how to run JavaScript on the page to make sure the user is \
         unsubscribed from this source of spam. You may think out loud in your response, but \
         end the response with exactly one code block to execute on the page. \
         If the page already says that the user has been unsubscribed from all emails, then \
         output the code `success()`. If the page does not seem to have anything to do \
         with unsubscribing, or you do not know what to do, then output the code `failure()`. \
         To get more information from the page, you can use a new print() function, which will \
         convert its argument to string and I will send the outputs of all prints in the next \
         message so that you can iterate. You can also call scrollDown() to scroll the page, and \
         clickText(text) to click every visible element whose label is exactly `text` (it returns \
         whether anything was clicked). After every message you send, I will give you a new \
         screenshot of the page, and any output from print() calls. \
         The user's email address is: {user_email}"
    )
}

/// A fatal error together with the conversation collected before it.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct AgentFailure {
    pub source: UnsubError,
    pub conversation: Conversation,
}

/// One loop iteration's observation.
struct Turn {
    index: usize,
    previous_output: Option<String>,
    screenshot: Screenshot,
    unchanged: bool,
}

impl Turn {
    fn user_message(
        &self,
        user_email: &str,
        summary: Option<&PageSummary>,
        html_description: Option<&str>,
        max_output_len: usize,
    ) -> Message {
        let mut text = String::new();
        match self.previous_output.as_deref() {
            Some(output) if !output.is_empty() => {
                text.push_str(&format!(
                    "Output from previous code:\n```\n{}\n```\n\n",
                    truncate_output(output, max_output_len)
                ));
            }
            _ if self.index == 0 => {
                text.push_str(NO_PRIOR_OUTPUT);
                text.push_str("\n\n");
            }
            _ => {}
        }
        text.push_str(&task_prompt(user_email));
        if let Some(summary) = summary {
            text.push_str("\n\n");
            text.push_str(&summary.describe());
        }
        if let Some(description) = html_description {
            text.push_str("\n\nHere is a description of the page's HTML source code:\n");
            text.push_str(description);
        }
        if self.unchanged {
            text.push_str("\n\n");
            text.push_str(UNCHANGED_NOTICE);
        }

        let mut chunks = vec![Chunk::InputText { text }];
        if !self.unchanged {
            chunks.push(Chunk::InputImage {
                image_url: self.screenshot.data_uri(),
            });
        }
        Message::user(chunks)
    }
}

/// Drives one page towards an unsubscribed state, one model call per turn.
pub struct UnsubAgent<'a> {
    model: &'a dyn LanguageModel,
    driver: &'a dyn BrowserDriver,
    config: AgentConfig,
    cancel: CancellationToken,
}

impl<'a> UnsubAgent<'a> {
    pub fn new(
        model: &'a dyn LanguageModel,
        driver: &'a dyn BrowserDriver,
        config: AgentConfig,
    ) -> Self {
        Self {
            model,
            driver,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Checked at the start of every turn; a cancelled run ends with
    /// `Cancelled` and keeps the conversation so far.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Returns the terminal status and the full conversation. Malformed
    /// replies and in-page errors consume a turn; only gateway and driver
    /// failures end the run early.
    pub async fn run(
        &self,
        url: &str,
        user_email: &str,
        max_turns: usize,
    ) -> Result<(AgentStatus, Conversation), AgentFailure> {
        let mut conversation = Conversation::new();
        match self.drive(url, user_email, max_turns, &mut conversation).await {
            Ok(status) => {
                tracing::info!(%status, messages = conversation.len(), "run finished");
                Ok((status, conversation))
            }
            Err(source) => {
                tracing::error!(error = %source, messages = conversation.len(), "run aborted");
                Err(AgentFailure {
                    source,
                    conversation,
                })
            }
        }
    }

    async fn drive(
        &self,
        url: &str,
        user_email: &str,
        max_turns: usize,
        conversation: &mut Conversation,
    ) -> UnsubResult<AgentStatus> {
        tracing::info!(url, max_turns, "opening unsubscribe page");
        self.driver.navigate(url).await?;

        let mut previous_output: Option<String> = None;
        let mut previous_frame: Option<RgbaImage> = None;

        for index in 0..max_turns {
            if self.cancel.is_cancelled() {
                return Err(UnsubError::Cancelled);
            }
            let screenshot = Screenshot::from_png(self.driver.screenshot().await?)?;
            let unchanged = previous_frame
                .as_ref()
                .is_some_and(|prev| eyes::is_unchanged(prev, &screenshot.pixels));
            let turn = Turn {
                index,
                previous_output: previous_output.take(),
                screenshot,
                unchanged,
            };

            let summary = match dom::page_summary(self.driver).await {
                Ok(summary) => summary,
                Err(e) => {
                    tracing::warn!(turn = index, error = %e, "page summary unavailable");
                    None
                }
            };
            let description = if index == 0 {
                self.describe_html().await?
            } else {
                None
            };

            conversation.push(turn.user_message(
                user_email,
                summary.as_ref(),
                description.as_deref(),
                self.config.max_output_len,
            ));
            previous_frame = Some(turn.screenshot.pixels);

            tracing::info!(turn = index, unchanged, "asking model for next step");
            let reply = self
                .model
                .complete(INSTRUCTIONS, GatewayInput::Conversation(&*conversation))
                .await?;
            conversation.push(Message::assistant(reply.as_str()));

            let code = match extract_code(&reply) {
                Ok(code) => code,
                Err(e) => {
                    tracing::warn!(turn = index, "malformed reply: {e}");
                    previous_output = Some(format!("ERROR: {e}"));
                    continue;
                }
            };

            dom::install_runtime(self.driver).await?;
            match dom::run_user_code(self.driver, &code).await {
                Ok(()) => {}
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(turn = index, "script error: {e}");
                    previous_output = Some(format!("ERROR while executing script: {e}"));
                    continue;
                }
                Err(e) => return Err(e),
            }

            let report = match dom::read_back(self.driver).await {
                Ok(report) => report,
                Err(e) => {
                    tracing::warn!(turn = index, error = %e, "could not read page state back");
                    PageReport::default()
                }
            };
            if let Some(status) = report.status {
                tracing::info!(turn = index, %status, "page reported terminal status");
                return Ok(status);
            }
            previous_output = Some(report.output);

            tokio::time::sleep(self.config.turn_delay).await;
            self.focus_newest_window().await?;
        }

        tracing::info!(max_turns, "turn budget exhausted");
        Ok(AgentStatus::Timeout)
    }

    /// First-turn aid: a plain-language description of small pages' HTML,
    /// built from one model call per chunk.
    async fn describe_html(&self) -> UnsubResult<Option<String>> {
        let html = match dom::page_html(self.driver).await {
            Ok(html) => html,
            Err(e) => {
                tracing::warn!(error = %e, "page HTML unavailable");
                return Ok(None);
            }
        };
        if html.is_empty() || html.len() >= self.config.html_description_max_len {
            tracing::debug!(html_len = html.len(), "skipping HTML description");
            return Ok(None);
        }

        let chunks = split_chunks(
            &html,
            self.config.html_chunk_len,
            self.config.html_chunk_overlap,
        );
        let total = chunks.len();
        let mut parts = Vec::with_capacity(total);
        for (i, chunk) in chunks.into_iter().enumerate() {
            let description = self
                .model
                .complete(DESCRIBE_HTML_INSTRUCTIONS, GatewayInput::Text(chunk))
                .await?;
            if total == 1 {
                parts.push(description.trim().to_string());
            } else {
                parts.push(format!("Part {}/{}: {}", i + 1, total, description.trim()));
            }
        }
        tracing::debug!(chunks = total, "HTML described");
        Ok(Some(parts.join("\n\n")))
    }

    async fn focus_newest_window(&self) -> UnsubResult<()> {
        let windows = self.driver.list_windows().await?;
        if let Some(newest) = windows.last() {
            self.driver.switch_to_window(newest).await?;
        }
        Ok(())
    }
}

/// The single fenced block in a reply. Zero or several blocks is a
/// `Format` error.
pub fn extract_code(reply: &str) -> UnsubResult<String> {
    let mut blocks = CODE_BLOCK.captures_iter(reply);
    match (blocks.next(), blocks.next()) {
        (Some(only), None) => Ok(only[1].trim().to_string()),
        _ => Err(UnsubError::Format(MALFORMED_REPLY.to_string())),
    }
}

/// Caps `output` at `max_len` bytes (on a char boundary) and marks the cut.
pub fn truncate_output(output: &str, max_len: usize) -> String {
    if output.len() <= max_len {
        return output.to_string();
    }
    let cut = floor_char_boundary(output, max_len);
    format!("{}\n... output truncated at {max_len} bytes ...\n", &output[..cut])
}

/// Splits `text` into windows of at most `max_len` bytes, each starting
/// `overlap` bytes before the previous one ended.
pub fn split_chunks(text: &str, max_len: usize, overlap: usize) -> Vec<&str> {
    if text.len() <= max_len {
        return vec![text];
    }
    let step = max_len.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    loop {
        let mut end = floor_char_boundary(text, (start + max_len).min(text.len()));
        if end <= start {
            end = ceil_char_boundary(text, start + 1);
        }
        chunks.push(&text[start..end]);
        if end >= text.len() {
            break;
        }
        start = ceil_char_boundary(text, start + step);
    }
    chunks
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}
