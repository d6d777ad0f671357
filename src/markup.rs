/// Telegram markup
///
/// Models answer in Markdown and occasionally in HTML. Telegram's HTML
/// parse mode accepts only a handful of tags and requires everything else
/// to be escaped, so replies are normalized here before sending.
use lazy_static::lazy_static;
use regex::{Captures, Regex};

/// Leave headroom below Telegram's 4096-character message limit
pub const MAX_MESSAGE_CHARS: usize = 4000;

lazy_static! {
    static ref ALLOWED_TAG: Regex =
        Regex::new(r#"(?i)</?(?:b|i|u|s|code|pre)>|<a\s+href="[^"<>]*">|</a>"#)
            .expect("allowed-tag regex is valid");
    static ref CODE_SPAN: Regex = Regex::new(r"`([^`\n]+)`").expect("code regex is valid");
    static ref LINK: Regex =
        Regex::new(r"\[([^\]\n]+)\]\((https?://[^\s)]+)\)").expect("link regex is valid");
    static ref BOLD: Regex =
        Regex::new(r"\*\*([^*\n]+?)\*\*|__([^_\n]+?)__").expect("bold regex is valid");
    static ref ITALIC: Regex =
        Regex::new(r"\*([^*\s](?:[^*\n]*[^*\s])?)\*").expect("italic regex is valid");
    static ref HEADING: Regex =
        Regex::new(r"(?m)^#{1,6}[ \t]+(.+?)[ \t]*$").expect("heading regex is valid");
    static ref BULLET: Regex =
        Regex::new(r"(?m)^([ \t]*)[*-][ \t]+").expect("bullet regex is valid");
    static ref ANY_TAG: Regex = Regex::new(r"<[^>]*>").expect("tag regex is valid");
}

pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Convert model output to Telegram's HTML subset
///
/// Supported: bold, italic, inline code, links and headings (rendered bold).
/// Allowed HTML tags already present are kept; any other `<`, `>` or `&`
/// is escaped.
pub fn to_telegram_html(text: &str) -> String {
    let text = HEADING.replace_all(text, "**$1**");
    let text = BULLET.replace_all(&text, "$1• ");

    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in CODE_SPAN.captures_iter(&text) {
        let whole = caps.get(0).expect("group 0 always matches");
        out.push_str(&convert_inline(&text[last..whole.start()]));
        out.push_str("<code>");
        out.push_str(&escape_html(&caps[1]));
        out.push_str("</code>");
        last = whole.end();
    }
    out.push_str(&convert_inline(&text[last..]));
    out
}

fn convert_inline(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    let mut last = 0;
    for tag in ALLOWED_TAG.find_iter(segment) {
        out.push_str(&convert_text(&segment[last..tag.start()]));
        out.push_str(tag.as_str());
        last = tag.end();
    }
    out.push_str(&convert_text(&segment[last..]));
    out
}

/// Escape plain text and apply links, then emphasis outside link targets
fn convert_text(text: &str) -> String {
    let escaped = escape_html(text);
    let mut out = String::with_capacity(escaped.len());
    let mut last = 0;
    for caps in LINK.captures_iter(&escaped) {
        let whole = caps.get(0).expect("group 0 always matches");
        out.push_str(&emphasize(&escaped[last..whole.start()]));
        out.push_str(&format!(
            r#"<a href="{}">{}</a>"#,
            &caps[2],
            emphasize(&caps[1])
        ));
        last = whole.end();
    }
    out.push_str(&emphasize(&escaped[last..]));
    out
}

fn emphasize(text: &str) -> String {
    let bold = BOLD.replace_all(text, |caps: &Captures| {
        let inner = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
        format!("<b>{}</b>", inner)
    });
    ITALIC.replace_all(&bold, "<i>$1</i>").into_owned()
}

/// Remove tags and entities, for the plain-text fallback
pub fn strip_tags(html: &str) -> String {
    ANY_TAG
        .replace_all(html, "")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

/// Plain text without Markdown or HTML, e.g. for speech synthesis
pub fn to_plain_text(text: &str) -> String {
    strip_tags(&to_telegram_html(text))
}

/// Split text into pieces of at most `max_chars` characters
///
/// Splits on line boundaries where possible.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.split_inclusive('\n') {
        let line_len = line.chars().count();
        if current_len + line_len > max_chars && !current.is_empty() {
            parts.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if line_len > max_chars {
            let chars: Vec<char> = line.chars().collect();
            for piece in chars.chunks(max_chars) {
                if piece.len() == max_chars {
                    parts.push(piece.iter().collect());
                } else {
                    current = piece.iter().collect();
                    current_len = piece.len();
                }
            }
        } else {
            current.push_str(line);
            current_len += line_len;
        }
    }
    if !current.trim().is_empty() {
        parts.push(current);
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escapes_stray_markup() {
        assert_eq!(
            to_telegram_html("Tom & Jerry <3 > all"),
            "Tom &amp; Jerry &lt;3 &gt; all"
        );
    }

    #[test]
    fn test_markdown_emphasis() {
        assert_eq!(
            to_telegram_html("**Heat** is a *masterpiece*"),
            "<b>Heat</b> is a <i>masterpiece</i>"
        );
        assert_eq!(to_telegram_html("__Alien__"), "<b>Alien</b>");
    }

    #[test]
    fn test_inline_code_is_escaped_and_not_formatted() {
        assert_eq!(
            to_telegram_html("Use `**raw** <tag>` here"),
            "Use <code>**raw** &lt;tag&gt;</code> here"
        );
    }

    #[test]
    fn test_links() {
        assert_eq!(
            to_telegram_html("See [the review](https://example.com/a?b=1&c=2)"),
            r#"See <a href="https://example.com/a?b=1&amp;c=2">the review</a>"#
        );
    }

    #[test]
    fn test_link_targets_are_not_formatted() {
        assert_eq!(
            to_telegram_html("[review](https://example.com/a__b__c)"),
            r#"<a href="https://example.com/a__b__c">review</a>"#
        );
        assert_eq!(
            to_telegram_html("[**Heat**](https://example.com/heat)"),
            r#"<a href="https://example.com/heat"><b>Heat</b></a>"#
        );
        assert_eq!(
            to_telegram_html(r#"<a href="https://example.com/a__b__c">site</a>"#),
            r#"<a href="https://example.com/a__b__c">site</a>"#
        );
    }

    #[test]
    fn test_allowed_html_is_kept() {
        assert_eq!(
            to_telegram_html(r#"<b>Dune</b> on <a href="https://example.com">site</a> <script>"#),
            r#"<b>Dune</b> on <a href="https://example.com">site</a> &lt;script&gt;"#
        );
    }

    #[test]
    fn test_headings_and_bullets() {
        assert_eq!(
            to_telegram_html("## Tonight\n* Heat\n- Collateral"),
            "<b>Tonight</b>\n• Heat\n• Collateral"
        );
    }

    #[test]
    fn test_lone_asterisks_untouched() {
        assert_eq!(to_telegram_html("5 * 3 = 15"), "5 * 3 = 15");
    }

    #[test]
    fn test_plain_text() {
        assert_eq!(
            to_plain_text("**Heat** & [Thief](https://example.com)"),
            "Heat & Thief"
        );
    }

    #[test]
    fn test_split_message_on_lines() {
        let text = "aaaa\nbbbb\ncccc\n";
        let parts = split_message(text, 10);
        assert_eq!(parts, vec!["aaaa\nbbbb\n", "cccc\n"]);
        for part in &parts {
            assert!(part.chars().count() <= 10);
        }
    }

    #[test]
    fn test_split_message_long_line() {
        let text = "x".repeat(25);
        let parts = split_message(&text, 10);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts.concat(), text);
    }

    #[test]
    fn test_split_short_message_unchanged() {
        assert_eq!(split_message("Ciao!", MAX_MESSAGE_CHARS), vec!["Ciao!"]);
        assert!(split_message("", MAX_MESSAGE_CHARS).is_empty());
    }
}
