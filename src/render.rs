//! Standalone HTML view of a saved run or trial.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::errors::UnsubResult;
use crate::types::{Chunk, Content, Conversation, Message, Role};

static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```([a-zA-Z0-9_\-]*)\n(.*?)```").expect("code fence regex"));

/// Fields shared by run and trial records.
#[derive(Debug, Default, Deserialize)]
struct TranscriptView {
    url: Option<String>,
    domain: Option<String>,
    user_email: Option<String>,
    #[serde(alias = "agent_status")]
    status: Option<String>,
    sim_status: Option<String>,
    error: Option<String>,
    #[serde(default)]
    conversation: Conversation,
}

const STYLE: &str = r#"
body { background: #0f1117; color: #e0e0e0; font-family: system-ui, sans-serif; margin: 0; }
.container { max-width: 960px; margin: 0 auto; padding: 24px; }
.header { display: flex; justify-content: space-between; align-items: center; gap: 12px; }
.meta-row { display: flex; flex-wrap: wrap; gap: 8px; margin-top: 8px; }
.badge { background: #1f2330; border-radius: 999px; padding: 4px 10px; font-size: 13px; }
.badge a { color: #93c5fd; }
.badge.ok { background: #14532d; }
.badge.err { background: #7f1d1d; }
.button { background: #4f46e5; color: #fff; border: none; border-radius: 6px; padding: 8px 14px; cursor: pointer; }
.msg { background: #161a23; border-radius: 8px; margin-top: 14px; overflow: hidden; }
.msg.user { border-left: 3px solid #6366f1; }
.msg.assistant { border-left: 3px solid #22c55e; }
.role { font-weight: 700; padding: 8px 14px; text-transform: uppercase; font-size: 12px; color: #9ca3af; }
.chunk { padding: 4px 14px 12px; }
.chunk h4 { margin: 4px 0; font-size: 12px; color: #6b7280; }
.codeblock { background: #0b0d12; padding: 10px; border-radius: 6px; overflow-x: auto; white-space: pre-wrap; }
.chat-image { max-width: 100%; border-radius: 6px; }
.error { color: #fca5a5; white-space: pre-wrap; }
"#;

const SCRIPT: &str = r#"
function copyRaw() {
  const pre = document.getElementById('raw-json');
  navigator.clipboard.writeText(pre ? pre.textContent : '').then(() => {
    const btn = document.getElementById('copy-btn');
    if (btn) { btn.textContent = 'Copied!'; setTimeout(() => btn.textContent = 'Copy raw JSON', 1200); }
  });
}
function toggleRaw() {
  const el = document.getElementById('raw-wrap');
  if (el) el.style.display = (el.style.display === 'none' ? 'block' : 'none');
}
"#;

pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            c => out.push(c),
        }
    }
    out
}

/// Escapes text, turns fenced code into `<pre>` blocks and other newlines
/// into `<br>`.
fn format_text(s: &str) -> String {
    let mut out = String::new();
    let mut last = 0;
    for caps in CODE_FENCE.captures_iter(s) {
        let whole = caps.get(0).map_or(0..0, |m| m.range());
        out.push_str(&escape_html(&s[last..whole.start]).replace('\n', "<br>"));
        out.push_str(&format!(
            r#"<pre class="codeblock"><code class="lang-{}">{}</code></pre>"#,
            escape_html(caps[1].trim()),
            escape_html(&caps[2])
        ));
        last = whole.end;
    }
    out.push_str(&escape_html(&s[last..]).replace('\n', "<br>"));
    out
}

fn render_message(message: &Message) -> String {
    let (role, class) = match message.role {
        Role::User => ("user", "user"),
        Role::Assistant => ("assistant", "assistant"),
    };
    let chunks = match &message.content {
        Content::Text(text) => vec![Chunk::InputText { text: text.clone() }],
        Content::Chunks(chunks) => chunks.clone(),
    };

    let blocks: String = chunks
        .iter()
        .map(|chunk| match chunk {
            Chunk::InputText { text } => text_block("User text", text),
            Chunk::OutputText { text } => text_block("Assistant text", text),
            Chunk::InputImage { image_url } => format!(
                r#"<div class="chunk"><h4>Image</h4><img class="chat-image" loading="lazy" src="{}" alt="page screenshot"/></div>"#,
                escape_html(image_url)
            ),
        })
        .collect();

    format!(
        r#"<div class="msg {class}"><div class="role">{role}</div><div class="body">{blocks}</div></div>"#
    )
}

fn text_block(caption: &str, text: &str) -> String {
    format!(
        r#"<div class="chunk"><h4>{caption}</h4><div class="text">{}</div></div>"#,
        format_text(text)
    )
}

fn status_badge(label: &str, status: &str) -> String {
    let class = match status {
        "success" => "badge ok",
        "failure" => "badge err",
        _ => "badge",
    };
    format!(r#"<span class="{class}">{label}: {}</span>"#, escape_html(status))
}

/// Renders a saved run or trial record (raw JSON text) as a full HTML page.
pub fn render_page(raw: &str) -> UnsubResult<String> {
    let view: TranscriptView = serde_json::from_str(raw)?;
    let pretty = serde_json::to_string_pretty(&serde_json::from_str::<serde_json::Value>(raw)?)?;

    let mut badges = Vec::new();
    if let Some(url) = &view.url {
        badges.push(format!(
            r#"<span class="badge">link: <a href="{}" target="_blank" rel="noopener noreferrer">{}</a></span>"#,
            escape_html(url),
            escape_html(view.domain.as_deref().unwrap_or(url))
        ));
    }
    if let Some(email) = &view.user_email {
        badges.push(format!(r#"<span class="badge">user: {}</span>"#, escape_html(email)));
    }
    badges.push(status_badge("status", view.status.as_deref().unwrap_or("")));
    if let Some(sim) = &view.sim_status {
        badges.push(status_badge("simulation", sim));
    }

    let error = view
        .error
        .as_deref()
        .map(|e| {
            format!(
                r#"<div class="msg"><div class="role">error</div><div class="chunk error">{}</div></div>"#,
                escape_html(e)
            )
        })
        .unwrap_or_default();
    let messages: String = view.conversation.messages().iter().map(render_message).collect();

    Ok(format!(
        r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>Conversation</title>
<meta name="viewport" content="width=device-width, initial-scale=1">
<style>{STYLE}</style>
<script>{SCRIPT}</script>
</head>
<body>
  <div class="container">
    <div class="header">
      <div class="meta">
        <div style="font-weight:700; font-size:18px;">Rendered Conversation</div>
        <div class="meta-row">{badges}</div>
      </div>
      <div class="actions">
        <button id="copy-btn" class="button" onclick="copyRaw()">Copy raw JSON</button>
        <button class="button" onclick="toggleRaw()">Toggle raw</button>
      </div>
    </div>
    <div id="raw-wrap" style="display:none; margin-top:10px;">
      <div class="msg"><div class="role">raw</div>
        <div class="chunk"><pre id="raw-json" class="codeblock"><code>{raw_json}</code></pre></div>
      </div>
    </div>
    {error}
    <div class="chat">{messages}</div>
  </div>
</body>
</html>
"#,
        badges = badges.concat(),
        raw_json = escape_html(&pretty),
    ))
}
