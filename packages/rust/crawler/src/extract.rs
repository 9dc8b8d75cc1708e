//! Link and main-content extraction from a parsed HTML document.

use regex::Regex;
use scraper::{Html, Selector};
use std::sync::LazyLock;
use url::Url;

const MAX_MAIN_TEXT_CHARS: usize = 50_000;
const TRUNCATION_MARKER: &str = "…[truncated]";
const MAX_HEADINGS: usize = 50;
const MIN_CONTENT_CHARS: usize = 50;

static CONTENT_CLASS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)content|main|body").unwrap());

/// Links discovered on a page, canonicalized and deduplicated.
pub fn extract_links(doc: &Html, base_url: &Url) -> Vec<String> {
    let selector = Selector::parse("a[href]").unwrap();
    let mut seen = std::collections::HashSet::new();
    let mut links = Vec::new();

    for el in doc.select(&selector) {
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        let trimmed = href.trim();
        if trimmed.is_empty()
            || trimmed.starts_with("javascript:")
            || trimmed.starts_with("mailto:")
            || trimmed.starts_with("tel:")
            || trimmed.starts_with('#')
            || trimmed.starts_with("data:")
        {
            continue;
        }
        let Ok(mut resolved) = base_url.join(trimmed) else {
            continue;
        };
        if resolved.scheme() != "http" && resolved.scheme() != "https" {
            continue;
        }
        resolved.set_fragment(None);
        let canonical = resolved.to_string();
        if seen.insert(canonical.clone()) {
            links.push(canonical);
        }
    }

    links
}

/// Extracted title, headings, and main text of a scraped page.
#[derive(Debug, Clone, Default)]
pub struct ExtractedContent {
    pub title: Option<String>,
    pub headings: Vec<String>,
    pub main_text: Option<String>,
}

/// Whether a page's extracted content is too thin to count as scraped, and
/// if so, whether that is ordinary empty content or a JS-rendered shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentQuality {
    Ok,
    EmptyContent,
    JsBlocked,
}

pub fn extract_content(doc: &Html) -> ExtractedContent {
    ExtractedContent {
        title: extract_title(doc),
        headings: extract_headings(doc),
        main_text: extract_main_text(doc),
    }
}

/// Classify thin content per spec.md §4.4: absent or <50 chars is either a
/// JS-rendering shell (empty `#root`/`#app`/`#__next`, or a noscript notice)
/// or plain empty content.
pub fn classify_quality(doc: &Html, main_text: Option<&str>) -> ContentQuality {
    let len = main_text.map(str::len).unwrap_or(0);
    if len >= MIN_CONTENT_CHARS {
        return ContentQuality::Ok;
    }
    if is_js_shell(doc) {
        ContentQuality::JsBlocked
    } else {
        ContentQuality::EmptyContent
    }
}

fn is_js_shell(doc: &Html) -> bool {
    for id in ["#root", "#app", "#__next"] {
        if let Ok(sel) = Selector::parse(id) {
            if let Some(el) = doc.select(&sel).next() {
                if el.text().collect::<String>().trim().is_empty() {
                    return true;
                }
            }
        }
    }
    let noscript_sel = Selector::parse("noscript").unwrap();
    doc.select(&noscript_sel)
        .any(|el| el.text().collect::<String>().to_ascii_lowercase().contains("enable javascript"))
}

fn extract_title(doc: &Html) -> Option<String> {
    let title_sel = Selector::parse("title").unwrap();
    if let Some(el) = doc.select(&title_sel).next() {
        let text = el.text().collect::<String>().trim().to_string();
        if !text.is_empty() {
            return Some(text);
        }
    }
    let h1_sel = Selector::parse("h1").unwrap();
    doc.select(&h1_sel).next().and_then(|el| {
        let text = el.text().collect::<String>().trim().to_string();
        (!text.is_empty()).then_some(text)
    })
}

fn extract_headings(doc: &Html) -> Vec<String> {
    let selector = Selector::parse("h1, h2, h3, h4, h5, h6").unwrap();
    doc.select(&selector)
        .filter_map(|el| {
            let text = el.text().collect::<String>().trim().to_string();
            if text.is_empty() {
                return None;
            }
            let level = el.value().name()[1..].to_string();
            Some(format!("H{level}: {text}"))
        })
        .take(MAX_HEADINGS)
        .collect()
}

const STRIP_TAGS: &[&str] = &[
    "script", "style", "nav", "header", "footer", "aside", "noscript", "iframe", "form",
];

fn extract_main_text(doc: &Html) -> Option<String> {
    let preferred = ["main", "article"];
    for tag in preferred {
        if let Ok(sel) = Selector::parse(tag) {
            if let Some(el) = doc.select(&sel).next() {
                return Some(clean_and_truncate(&collect_text(el)));
            }
        }
    }

    let div_sel = Selector::parse("div").unwrap();
    for el in doc.select(&div_sel) {
        let class_and_id = format!(
            "{} {}",
            el.value().attr("class").unwrap_or(""),
            el.value().attr("id").unwrap_or("")
        );
        if CONTENT_CLASS_RE.is_match(&class_and_id) {
            return Some(clean_and_truncate(&collect_text(el)));
        }
    }

    let body_sel = Selector::parse("body").unwrap();
    if let Some(el) = doc.select(&body_sel).next() {
        return Some(clean_and_truncate(&collect_text(el)));
    }

    Some(clean_and_truncate(
        &doc.root_element().text().collect::<String>(),
    ))
}

fn collect_text(el: scraper::ElementRef) -> String {
    let stripped: std::collections::HashSet<_> = STRIP_TAGS.iter().collect();
    let mut out = String::new();
    collect_text_into(el, &stripped, &mut out);
    out
}

fn collect_text_into(
    el: scraper::ElementRef,
    stripped: &std::collections::HashSet<&&str>,
    out: &mut String,
) {
    use scraper::node::Node;
    for child in el.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(element) => {
                if stripped.contains(&element.name()) {
                    continue;
                }
                if let Some(child_el) = scraper::ElementRef::wrap(child) {
                    collect_text_into(child_el, stripped, out);
                    out.push('\n');
                }
            }
            _ => {}
        }
    }
}

fn clean_and_truncate(raw: &str) -> String {
    let cleaned: Vec<&str> = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    let mut joined = cleaned.join("\n");
    if joined.chars().count() > MAX_MAIN_TEXT_CHARS {
        joined = joined.chars().take(MAX_MAIN_TEXT_CHARS).collect();
        joined.push_str(TRUNCATION_MARKER);
    }
    joined
}
