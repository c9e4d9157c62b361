use std::collections::VecDeque;
use std::io::Cursor;
use std::time::Duration;

use async_trait::async_trait;
use image::{ImageFormat, Rgba, RgbaImage};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use unsub_agent::agent::{INSTRUCTIONS, MALFORMED_REPLY};
use unsub_agent::brain::{GatewayInput, LanguageModel, parse_response};
use unsub_agent::config::AgentConfig;
use unsub_agent::dom::{PAGE_HTML_JS, PAGE_SUMMARY_JS, READ_BACK_JS, RUNTIME_JS};
use unsub_agent::hands::{BrowserDriver, ScriptValue};
use unsub_agent::types::Role;
use unsub_agent::{AgentStatus, UnsubAgent, UnsubError, UnsubResult};

/// Replays canned replies and remembers what each call was for.
struct ScriptedModel {
    replies: Mutex<VecDeque<String>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedModel {
    fn new(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, instructions: &str, input: GatewayInput<'_>) -> UnsubResult<String> {
        if instructions != INSTRUCTIONS {
            let GatewayInput::Text(html) = input else {
                panic!("describe call should carry raw HTML");
            };
            self.calls.lock().push(format!("describe:{}", html.len()));
            return Ok("A form with a big unsubscribe button.".into());
        }
        self.calls.lock().push("step".into());
        self.replies
            .lock()
            .pop_front()
            .ok_or_else(|| UnsubError::Transport("no scripted reply left".into()))
    }
}

/// In-memory page: understands the runtime scripts by identity and fakes
/// the effect of `success()`, `failure()`, `print()` and `throw`.
struct FakePage {
    html: String,
    frames: Mutex<VecDeque<u8>>,
    output: Mutex<String>,
    status: Mutex<Option<&'static str>>,
    navigations: Mutex<Vec<String>>,
    switches: Mutex<Vec<String>>,
}

impl FakePage {
    fn new() -> Self {
        Self {
            html: String::new(),
            frames: Mutex::new(VecDeque::new()),
            output: Mutex::new(String::new()),
            status: Mutex::new(None),
            navigations: Mutex::new(Vec::new()),
            switches: Mutex::new(Vec::new()),
        }
    }

    fn with_html(mut self, html: &str) -> Self {
        self.html = html.to_string();
        self
    }

    /// Gray levels for successive screenshots; the last one repeats.
    fn with_frames(self, shades: &[u8]) -> Self {
        *self.frames.lock() = shades.iter().copied().collect();
        self
    }

    fn run_user_code(&self, script: &str) -> Value {
        if script.contains("throw") {
            return json!(r#"{"ok":false,"error":"Error: boom"}"#);
        }
        if script.contains("print(") {
            self.output.lock().push_str("found 3 checkboxes\n");
        }
        if script.contains("success()") {
            *self.status.lock() = Some("success");
        } else if script.contains("failure()") {
            *self.status.lock() = Some("failure");
        }
        json!(r#"{"ok":true}"#)
    }
}

fn png(shade: u8) -> Vec<u8> {
    let img = RgbaImage::from_pixel(8, 8, Rgba([shade, shade, shade, 255]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

#[async_trait]
impl BrowserDriver for FakePage {
    async fn navigate(&self, url: &str) -> UnsubResult<()> {
        self.navigations.lock().push(url.to_string());
        Ok(())
    }

    async fn screenshot(&self) -> UnsubResult<Vec<u8>> {
        let mut frames = self.frames.lock();
        let shade = if frames.len() > 1 {
            frames.pop_front().unwrap_or(0)
        } else {
            frames.front().copied().unwrap_or(200)
        };
        Ok(png(shade))
    }

    async fn execute_script(&self, script: &str) -> UnsubResult<ScriptValue> {
        let value = if script == RUNTIME_JS {
            *self.output.lock() = String::new();
            Value::Null
        } else if script == READ_BACK_JS {
            let output = self.output.lock().clone();
            let status = *self.status.lock();
            let report = json!({ "output": output, "status": status });
            Value::String(report.to_string())
        } else if script == PAGE_SUMMARY_JS {
            let summary = json!({
                "links": 2, "buttons": 1, "text_inputs": 0, "checkboxes": 3,
                "selects": 0, "viewport_height": 1000.0, "page_height": 2000.0,
            });
            Value::String(summary.to_string())
        } else if script == PAGE_HTML_JS {
            Value::String(self.html.clone())
        } else {
            self.run_user_code(script)
        };
        Ok(ScriptValue {
            value,
            description: None,
        })
    }

    async fn list_windows(&self) -> UnsubResult<Vec<String>> {
        Ok(vec!["first".into(), "popup".into()])
    }

    async fn switch_to_window(&self, handle: &str) -> UnsubResult<()> {
        self.switches.lock().push(handle.to_string());
        Ok(())
    }
}

fn fast_config() -> AgentConfig {
    AgentConfig {
        turn_delay: Duration::ZERO,
        ..AgentConfig::default()
    }
}

fn reply(code: &str) -> String {
    format!("Looking at the page, I will do this:\n```javascript\n{code}\n```")
}

#[tokio::test]
async fn already_unsubscribed_page_succeeds_on_first_turn() {
    let model = ScriptedModel::new(&[&reply("success()")]);
    let page = FakePage::new();
    let agent = UnsubAgent::new(&model, &page, fast_config());

    let (status, conversation) = agent
        .run("http://127.0.0.1:1/", "a@b.c", 5)
        .await
        .unwrap();

    assert_eq!(status, AgentStatus::Success);
    assert_eq!(conversation.len(), 2);
    let first = &conversation.messages()[0];
    assert_eq!(first.role, Role::User);
    assert!(first.has_image());
    assert!(first.text().contains("first step"));
    assert!(first.text().contains("a@b.c"));
    assert!(first.text().contains("about 50% of the page height"));
    assert_eq!(page.navigations.lock().as_slice(), ["http://127.0.0.1:1/"]);
}

#[tokio::test]
async fn explicit_failure_is_terminal() {
    let model = ScriptedModel::new(&[&reply("print(document.title)"), &reply("failure()")]);
    let page = FakePage::new().with_frames(&[10, 20]);
    let agent = UnsubAgent::new(&model, &page, fast_config());

    let (status, conversation) = agent.run("http://x/", "a@b.c", 5).await.unwrap();
    assert_eq!(status, AgentStatus::Failure);
    assert_eq!(conversation.len(), 4);
    assert!(conversation.messages()[2].text().contains("found 3 checkboxes"));
    assert_eq!(page.switches.lock().as_slice(), ["popup"]);
}

#[tokio::test]
async fn reply_without_code_block_is_reported_back() {
    let model = ScriptedModel::new(&["I am not sure what to do.", &reply("success()")]);
    let page = FakePage::new();
    let agent = UnsubAgent::new(&model, &page, fast_config());

    let (status, conversation) = agent.run("http://x/", "a@b.c", 5).await.unwrap();
    assert_eq!(status, AgentStatus::Success);
    assert_eq!(conversation.len(), 4);
    let second_user = conversation.messages()[2].text();
    assert!(second_user.contains(&format!("ERROR: {MALFORMED_REPLY}")));
}

#[tokio::test]
async fn two_code_blocks_count_as_malformed() {
    let two = format!("{}\n{}", reply("print(1)"), reply("success()"));
    let model = ScriptedModel::new(&[&two, &reply("failure()")]);
    let page = FakePage::new();
    let agent = UnsubAgent::new(&model, &page, fast_config());

    let (status, conversation) = agent.run("http://x/", "a@b.c", 5).await.unwrap();
    assert_eq!(status, AgentStatus::Failure);
    assert!(conversation.messages()[2].text().contains(MALFORMED_REPLY));
}

#[tokio::test]
async fn thrown_script_error_becomes_next_observation() {
    let model = ScriptedModel::new(&[&reply("throw new Error('boom')"), &reply("success()")]);
    let page = FakePage::new();
    let agent = UnsubAgent::new(&model, &page, fast_config());

    let (status, conversation) = agent.run("http://x/", "a@b.c", 5).await.unwrap();
    assert_eq!(status, AgentStatus::Success);
    assert!(
        conversation.messages()[2]
            .text()
            .contains("ERROR while executing script: Error: boom")
    );
}

#[tokio::test]
async fn exhausting_turns_times_out_with_full_history() {
    let model = ScriptedModel::new(&[
        &reply("scrollDown()"),
        &reply("scrollDown()"),
        &reply("scrollDown()"),
    ]);
    let page = FakePage::new().with_frames(&[1, 2, 3]);
    let agent = UnsubAgent::new(&model, &page, fast_config());

    let (status, conversation) = agent.run("http://x/", "a@b.c", 3).await.unwrap();
    assert_eq!(status, AgentStatus::Timeout);
    assert_eq!(conversation.len(), 6);
    for (i, message) in conversation.messages().iter().enumerate() {
        let expected = if i % 2 == 0 { Role::User } else { Role::Assistant };
        assert_eq!(message.role, expected);
    }
}

#[tokio::test]
async fn unchanged_screenshot_is_not_resent() {
    let model = ScriptedModel::new(&[&reply("clickText('Nothing')"), &reply("failure()")]);
    let page = FakePage::new().with_frames(&[7]);
    let agent = UnsubAgent::new(&model, &page, fast_config());

    let (_, conversation) = agent.run("http://x/", "a@b.c", 5).await.unwrap();
    let second_user = &conversation.messages()[2];
    assert!(!second_user.has_image());
    assert!(second_user.text().contains("looks exactly the same"));
}

#[tokio::test]
async fn changed_screenshot_is_attached() {
    let model = ScriptedModel::new(&[&reply("clickText('Next')"), &reply("failure()")]);
    let page = FakePage::new().with_frames(&[7, 8]);
    let agent = UnsubAgent::new(&model, &page, fast_config());

    let (_, conversation) = agent.run("http://x/", "a@b.c", 5).await.unwrap();
    assert!(conversation.messages()[2].has_image());
}

#[tokio::test]
async fn small_pages_get_an_html_description_on_the_first_turn() {
    let model = ScriptedModel::new(&[&reply("print(1)"), &reply("success()")]);
    let html = "<html><body><button>Unsubscribe</button></body></html>";
    let page = FakePage::new().with_html(html);
    let agent = UnsubAgent::new(&model, &page, fast_config());

    let (_, conversation) = agent.run("http://x/", "a@b.c", 5).await.unwrap();
    assert_eq!(
        model.calls(),
        [format!("describe:{}", html.len()), "step".into(), "step".into()]
    );
    assert!(conversation.messages()[0].text().contains("big unsubscribe button"));
    assert!(!conversation.messages()[2].text().contains("big unsubscribe button"));
}

#[tokio::test]
async fn oversized_pages_skip_the_description() {
    let model = ScriptedModel::new(&[&reply("success()")]);
    let html = "x".repeat(AgentConfig::default().html_description_max_len);
    let page = FakePage::new().with_html(&html);
    let agent = UnsubAgent::new(&model, &page, fast_config());

    agent.run("http://x/", "a@b.c", 5).await.unwrap();
    assert_eq!(model.calls(), ["step"]);
}

#[tokio::test]
async fn model_failure_aborts_with_partial_history() {
    let model = ScriptedModel::new(&[&reply("print(1)")]);
    let page = FakePage::new();
    let agent = UnsubAgent::new(&model, &page, fast_config());

    let failure = agent.run("http://x/", "a@b.c", 5).await.unwrap_err();
    assert!(matches!(failure.source, UnsubError::Transport(_)));
    // second user message was pushed before the call that failed
    assert_eq!(failure.conversation.len(), 3);
}

/// Returns the reply the gateway would produce for a body carrying an
/// `error` object.
struct ErrorPayloadModel;

#[async_trait]
impl LanguageModel for ErrorPayloadModel {
    async fn complete(
        &self,
        _instructions: &str,
        _input: GatewayInput<'_>,
    ) -> UnsubResult<String> {
        parse_response(&json!({"error": {"message": "bad"}}))
    }
}

#[tokio::test]
async fn error_payload_from_the_model_aborts_the_run() {
    let model = ErrorPayloadModel;
    let page = FakePage::new();
    let agent = UnsubAgent::new(&model, &page, fast_config());

    let failure = agent.run("http://x/", "a@b.c", 5).await.unwrap_err();
    assert!(!failure.source.is_recoverable());
    assert!(matches!(failure.source, UnsubError::Transport(_)));
    assert_eq!(failure.conversation.len(), 1);
}

/// Cancels the run from inside the first model call, like Ctrl-C would.
struct CancellingModel {
    cancel: CancellationToken,
}

#[async_trait]
impl LanguageModel for CancellingModel {
    async fn complete(
        &self,
        _instructions: &str,
        _input: GatewayInput<'_>,
    ) -> UnsubResult<String> {
        self.cancel.cancel();
        Ok(reply("print(1)"))
    }
}

#[tokio::test]
async fn cancelled_run_keeps_its_conversation() {
    let cancel = CancellationToken::new();
    let model = CancellingModel {
        cancel: cancel.clone(),
    };
    let page = FakePage::new();
    let agent = UnsubAgent::new(&model, &page, fast_config()).with_cancel(cancel);

    let failure = agent.run("http://x/", "a@b.c", 5).await.unwrap_err();
    assert!(matches!(failure.source, UnsubError::Cancelled));
    assert_eq!(failure.conversation.len(), 2);
    assert_eq!(failure.conversation.messages()[1].role, Role::Assistant);
}
