//! Markdown to platform markup
//!
//! The agent core writes GitHub-flavoured Markdown; platforms want their own
//! dialect. Conversion runs in five passes:
//!
//! 1. fenced code blocks and inline code spans become placeholders
//! 2. heading and blockquote markers are stripped (headings turn bold)
//! 3. the remaining text is escaped for the dialect
//! 4. links, bold, italic, strikethrough and bullets are rewritten
//! 5. placeholders are restored, code content escaped on the way back

use regex::{Captures, Regex};
use std::sync::LazyLock;

/// A target markup dialect
pub trait Markup: Send + Sync {
    /// Escape plain text
    fn escape(&self, text: &str) -> String;
    /// Opening and closing markers for bold text
    fn bold(&self) -> (&'static str, &'static str);
    /// Opening and closing markers for italic text
    fn italic(&self) -> (&'static str, &'static str);
    /// Opening and closing markers for struck-through text
    fn strike(&self) -> (&'static str, &'static str);
    /// Render a link; `label` and `url` are already escaped
    fn link(&self, label: &str, url: &str) -> String;
    /// Render an inline code span; `code` is already escaped
    fn inline_code(&self, code: &str) -> String;
    /// Render a fenced code block; `code` is already escaped
    fn code_block(&self, lang: Option<&str>, code: &str) -> String;

    /// Bullet glyph replacing `-`, `*` and `+` list markers
    fn bullet(&self) -> &'static str {
        "•"
    }
}

/// Telegram `parse_mode=HTML`
#[derive(Debug, Clone, Copy, Default)]
pub struct TelegramHtml;

impl Markup for TelegramHtml {
    fn escape(&self, text: &str) -> String {
        text.replace('&', "&amp;")
            .replace('<', "&lt;")
            .replace('>', "&gt;")
    }

    fn bold(&self) -> (&'static str, &'static str) {
        ("<b>", "</b>")
    }

    fn italic(&self) -> (&'static str, &'static str) {
        ("<i>", "</i>")
    }

    fn strike(&self) -> (&'static str, &'static str) {
        ("<s>", "</s>")
    }

    fn link(&self, label: &str, url: &str) -> String {
        format!("<a href=\"{}\">{}</a>", url.replace('"', "&quot;"), label)
    }

    fn inline_code(&self, code: &str) -> String {
        format!("<code>{}</code>", code)
    }

    fn code_block(&self, lang: Option<&str>, code: &str) -> String {
        match lang {
            Some(lang) => format!("<pre><code class=\"language-{}\">{}</code></pre>", lang, code),
            None => format!("<pre>{}</pre>", code),
        }
    }
}

/// Slack `mrkdwn`
#[derive(Debug, Clone, Copy, Default)]
pub struct SlackMrkdwn;

impl Markup for SlackMrkdwn {
    fn escape(&self, text: &str) -> String {
        text.replace('&', "&amp;")
            .replace('<', "&lt;")
            .replace('>', "&gt;")
    }

    fn bold(&self) -> (&'static str, &'static str) {
        ("*", "*")
    }

    fn italic(&self) -> (&'static str, &'static str) {
        ("_", "_")
    }

    fn strike(&self) -> (&'static str, &'static str) {
        ("~", "~")
    }

    fn link(&self, label: &str, url: &str) -> String {
        format!("<{}|{}>", url, label.replace('|', "\u{2223}"))
    }

    fn inline_code(&self, code: &str) -> String {
        format!("`{}`", code)
    }

    fn code_block(&self, _lang: Option<&str>, code: &str) -> String {
        format!("```\n{}\n```", code.trim_end_matches('\n'))
    }
}

// Internal markers. None of them are touched by any dialect's escaping.
const SLOT: char = '\u{0}';
const BOLD_OPEN: char = '\u{2}';
const BOLD_CLOSE: char = '\u{3}';
const ITALIC_OPEN: char = '\u{4}';
const ITALIC_CLOSE: char = '\u{5}';
const STRIKE_OPEN: char = '\u{6}';
const STRIKE_CLOSE: char = '\u{7}';

struct Patterns {
    fence: Regex,
    inline_code: Regex,
    heading: Regex,
    quote: Regex,
    link: Regex,
    bold: Regex,
    strike: Regex,
    italic_star: Regex,
    italic_underscore: Regex,
    bullet: Regex,
    slot: Regex,
}

impl Patterns {
    fn compile() -> std::result::Result<Self, regex::Error> {
        Ok(Self {
            fence: Regex::new(r"(?s)```([A-Za-z0-9_+#.-]*)[ \t]*\n?(.*?)```")?,
            inline_code: Regex::new(r"`([^`\n]+)`")?,
            heading: Regex::new(r"(?m)^[ \t]*#{1,6}[ \t]+(.*?)[ \t#]*$")?,
            quote: Regex::new(r"(?m)^[ \t]*>[ \t]?")?,
            link: Regex::new(r"\[([^\]\n]+)\]\(([^)\s]+)\)")?,
            bold: Regex::new(r"\*\*([^\n]+?)\*\*|__([^\n]+?)__")?,
            strike: Regex::new(r"~~([^\n]+?)~~")?,
            italic_star: Regex::new(r"\*([^*\n]+)\*")?,
            italic_underscore: Regex::new(r"(^|[^\w])_([^_\n]+)_($|[^\w])")?,
            bullet: Regex::new(r"(?m)^([ \t]*)[-*+][ \t]+")?,
            slot: Regex::new(r"\x00(\d+)\x00")?,
        })
    }
}

static PATTERNS: LazyLock<Option<Patterns>> = LazyLock::new(|| match Patterns::compile() {
    Ok(patterns) => Some(patterns),
    Err(e) => {
        tracing::error!("Markup patterns failed to compile: {}", e);
        None
    }
});

fn slot(index: usize) -> String {
    format!("{SLOT}{index}{SLOT}")
}

/// Convert Markdown to the given dialect
pub fn transform(markdown: &str, markup: &dyn Markup) -> String {
    let input = markdown.replace(
        [SLOT, BOLD_OPEN, BOLD_CLOSE, ITALIC_OPEN, ITALIC_CLOSE, STRIKE_OPEN, STRIKE_CLOSE],
        "",
    );
    let Some(p) = PATTERNS.as_ref() else {
        return markup.escape(&input);
    };

    // Rendered code blocks, code spans and links, indexed by slot number
    let mut slots: Vec<String> = Vec::new();

    // 1. Code
    let text = p
        .fence
        .replace_all(&input, |caps: &Captures| {
            let lang = caps.get(1).map(|m| m.as_str()).filter(|l| !l.is_empty());
            let code = markup.escape(&caps[2]);
            slots.push(markup.code_block(lang, code.trim_end_matches('\n')));
            slot(slots.len() - 1)
        })
        .into_owned();
    let text = p
        .inline_code
        .replace_all(&text, |caps: &Captures| {
            slots.push(markup.inline_code(&markup.escape(&caps[1])));
            slot(slots.len() - 1)
        })
        .into_owned();

    // 2. Block markers
    let text = p
        .heading
        .replace_all(&text, |caps: &Captures| {
            format!("**{}**", caps[1].replace("**", ""))
        })
        .into_owned();
    let text = p.quote.replace_all(&text, "").into_owned();

    // 3. Escape
    let text = markup.escape(&text);

    // 4. Inline syntax
    let text = p
        .link
        .replace_all(&text, |caps: &Captures| {
            slots.push(markup.link(&caps[1], &caps[2]));
            slot(slots.len() - 1)
        })
        .into_owned();
    let bullet = format!("${{1}}{} ", markup.bullet());
    let text = p.bullet.replace_all(&text, bullet.as_str()).into_owned();
    let text = p
        .bold
        .replace_all(&text, |caps: &Captures| {
            let inner = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
            format!("{BOLD_OPEN}{inner}{BOLD_CLOSE}")
        })
        .into_owned();
    let text = p
        .strike
        .replace_all(&text, format!("{STRIKE_OPEN}${{1}}{STRIKE_CLOSE}").as_str())
        .into_owned();
    let text = p
        .italic_star
        .replace_all(&text, format!("{ITALIC_OPEN}${{1}}{ITALIC_CLOSE}").as_str())
        .into_owned();
    let text = p
        .italic_underscore
        .replace_all(&text, format!("${{1}}{ITALIC_OPEN}${{2}}{ITALIC_CLOSE}${{3}}").as_str())
        .into_owned();

    let (bold_open, bold_close) = markup.bold();
    let (italic_open, italic_close) = markup.italic();
    let (strike_open, strike_close) = markup.strike();
    let text = text
        .replace(BOLD_OPEN, bold_open)
        .replace(BOLD_CLOSE, bold_close)
        .replace(ITALIC_OPEN, italic_open)
        .replace(ITALIC_CLOSE, italic_close)
        .replace(STRIKE_OPEN, strike_open)
        .replace(STRIKE_CLOSE, strike_close);

    // 5. Restore. Link labels may hold code slots, so repeat until stable.
    let mut text = text;
    for _ in 0..2 {
        if !text.contains(SLOT) {
            break;
        }
        text = p
            .slot
            .replace_all(&text, |caps: &Captures| {
                caps[1]
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| slots.get(i).cloned())
                    .unwrap_or_default()
            })
            .into_owned();
    }
    text
}
