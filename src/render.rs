//! Turns plain post and profile text into linked HTML.

use chrono::{DateTime, FixedOffset, Local};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::api::{RecentStatus, UrlEntity};

const SEARCH_URL: &str = "https://twitter.com/search?q=%23";
const PROFILE_URL: &str = "https://twitter.com/";

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?P<url>https?://[^\s<>]+)|[#＃](?P<tag>\w+)|@(?P<user>\w{1,15})")
        .expect("entity regex is valid")
});

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("tag regex is valid"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityKind {
    Url,
    Hashtag,
    Mention,
}

/// A linkable span of the source text, in byte offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEntity {
    pub kind: EntityKind,
    pub start: usize,
    pub end: usize,
    pub value: String,
}

/// Finds URLs, hashtags and mentions. Hashtags and mentions only count at
/// a word boundary, so `a@b` and `x#1` stay plain text.
pub fn extract_entities(text: &str) -> Vec<TextEntity> {
    let mut out = Vec::new();
    for caps in TOKEN_RE.captures_iter(text) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        let (kind, value) = if let Some(m) = caps.name("url") {
            (EntityKind::Url, m.as_str())
        } else if let Some(m) = caps.name("tag") {
            (EntityKind::Hashtag, m.as_str())
        } else if let Some(m) = caps.name("user") {
            (EntityKind::Mention, m.as_str())
        } else {
            continue;
        };
        if kind != EntityKind::Url && follows_word_char(text, whole.start()) {
            continue;
        }
        out.push(TextEntity {
            kind,
            start: whole.start(),
            end: whole.end(),
            value: value.to_string(),
        });
    }
    out
}

pub fn hashtags(text: &str) -> Vec<String> {
    extract_entities(text)
        .into_iter()
        .filter(|e| e.kind == EntityKind::Hashtag)
        .map(|e| e.value)
        .collect()
}

pub fn mentions(text: &str) -> Vec<String> {
    extract_entities(text)
        .into_iter()
        .filter(|e| e.kind == EntityKind::Mention)
        .map(|e| e.value)
        .collect()
}

fn follows_word_char(text: &str, start: usize) -> bool {
    text[..start]
        .chars()
        .next_back()
        .map(|c| c.is_alphanumeric() || c == '_' || c == '&')
        .unwrap_or(false)
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            '\n' => out.push_str("<br>"),
            _ => out.push(c),
        }
    }
    out
}

/// Escapes `text` and wraps every entity in an anchor. URLs listed in
/// `urls` link to their expanded target and show their display form.
pub fn auto_link_html(text: &str, urls: &[UrlEntity]) -> String {
    let mut out = String::with_capacity(text.len() * 2);
    let mut cursor = 0;
    for entity in extract_entities(text) {
        out.push_str(&escape_html(&text[cursor..entity.start]));
        match entity.kind {
            EntityKind::Url => {
                let known = urls.iter().find(|u| u.url == entity.value);
                let href = known
                    .and_then(|u| u.expanded_url.as_deref())
                    .unwrap_or(&entity.value);
                let label = known
                    .and_then(|u| u.display_url.as_deref().or(u.expanded_url.as_deref()))
                    .unwrap_or(&entity.value);
                out.push_str(&anchor("url", href, label));
            }
            EntityKind::Hashtag => {
                let href = format!("{}{}", SEARCH_URL, entity.value);
                out.push_str(&anchor("hashtag", &href, &text[entity.start..entity.end]));
            }
            EntityKind::Mention => {
                let href = format!("{}{}", PROFILE_URL, entity.value);
                out.push_str(&anchor("mention", &href, &text[entity.start..entity.end]));
            }
        }
        cursor = entity.end;
    }
    out.push_str(&escape_html(&text[cursor..]));
    out
}

fn anchor(class: &str, href: &str, label: &str) -> String {
    format!(
        "<a class=\"{}\" href=\"{}\">{}</a>",
        class,
        escape_html(href),
        escape_html(label)
    )
}

/// Text of an HTML fragment with the tags removed.
pub fn strip_tags(html: &str) -> String {
    TAG_RE.replace_all(html, "").into_owned()
}

pub fn format_timestamp(when: &DateTime<FixedOffset>) -> String {
    when.with_timezone(&Local)
        .format("%Y-%m-%d %H:%M")
        .to_string()
}

/// The latest post of a profile: linked body followed by a footer with
/// the time and client it was sent from.
pub fn recent_status_html(status: &RecentStatus) -> String {
    let body = auto_link_html(&status.full_text, &status.entities.urls);
    let mut footer = Vec::new();
    if let Some(when) = status.created() {
        footer.push(format_timestamp(&when));
    }
    let source = strip_tags(&status.source);
    if !source.trim().is_empty() {
        footer.push(format!("via {}", escape_html(source.trim())));
    }
    if footer.is_empty() {
        body
    } else {
        format!("{}<br><small>{}</small>", body, footer.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::EntityGroup;

    #[test]
    fn finds_tags_and_mentions_at_word_boundaries() {
        let text = "hi @alice and #rust, mail a@b.com or x#1 #日本";
        assert_eq!(mentions(text), vec!["alice"]);
        assert_eq!(hashtags(text), vec!["rust", "日本"]);
    }

    #[test]
    fn links_expand_known_urls() {
        let urls = vec![UrlEntity {
            url: "https://t.co/abc".into(),
            expanded_url: Some("https://example.com/long/path".into()),
            display_url: Some("example.com/long…".into()),
        }];
        let html = auto_link_html("see https://t.co/abc <now>", &urls);
        assert_eq!(
            html,
            "see <a class=\"url\" href=\"https://example.com/long/path\">example.com/long…</a> &lt;now&gt;"
        );
    }

    #[test]
    fn links_unknown_urls_as_is() {
        let html = auto_link_html("go http://x.org/?a=1&b=2", &[]);
        assert_eq!(
            html,
            "go <a class=\"url\" href=\"http://x.org/?a=1&amp;b=2\">http://x.org/?a=1&amp;b=2</a>"
        );
    }

    #[test]
    fn hashtag_and_mention_anchors() {
        let html = auto_link_html("#perch by @dev\nok", &[]);
        assert_eq!(
            html,
            "<a class=\"hashtag\" href=\"https://twitter.com/search?q=%23perch\">#perch</a> by \
             <a class=\"mention\" href=\"https://twitter.com/dev\">@dev</a><br>ok"
        );
    }

    #[test]
    fn recent_status_has_source_footer() {
        let status = RecentStatus {
            id: 1,
            created_at: String::new(),
            full_text: "hello".into(),
            source: "<a href=\"https://example.com\" rel=\"nofollow\">Perch</a>".into(),
            entities: EntityGroup::default(),
        };
        assert_eq!(recent_status_html(&status), "hello<br><small>via Perch</small>");
    }

    #[test]
    fn strips_markup() {
        assert_eq!(strip_tags("<b>bold</b> text"), "bold text");
    }
}
