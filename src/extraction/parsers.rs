//! HTML parsing for the extraction strategies.
//!
//! - [`lightweight`]: meta tags, `<h1>` and paragraph heuristics
//! - [`structural`]: per-site CSS selectors plus schema.org JSON-LD
//! - [`looks_like_article`]: the verification stage's acceptance test
//!
//! All functions are pure: they take HTML text and return a [`FieldMap`]
//! with trimmed, whitespace-normalised values. Empty values are omitted.

use crate::config::SiteRule;
use crate::models::{Field, FieldMap};
use crate::utils::{normalize_whitespace, word_count};
use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use tracing::warn;

/// Paragraphs shorter than this are navigation, captions or bylines.
const MIN_PARAGRAPH_WORDS: usize = 8;

/// Paragraph count that makes a page without other markers an article.
const ARTICLE_PARAGRAPHS: usize = 3;

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("static selector is valid CSS")
}

static OG_TITLE: Lazy<Selector> = Lazy::new(|| selector(r#"meta[property="og:title"]"#));
static OG_TYPE: Lazy<Selector> = Lazy::new(|| selector(r#"meta[property="og:type"]"#));
static H1: Lazy<Selector> = Lazy::new(|| selector("h1"));
static TITLE: Lazy<Selector> = Lazy::new(|| selector("title"));
static ARTICLE: Lazy<Selector> = Lazy::new(|| selector("article"));
static ARTICLE_PARAGRAPH: Lazy<Selector> = Lazy::new(|| selector("article p"));
static PARAGRAPH: Lazy<Selector> = Lazy::new(|| selector("p"));
static META_AUTHOR: Lazy<Selector> =
    Lazy::new(|| selector(r#"meta[name="author"], meta[property="article:author"]"#));
static REL_AUTHOR: Lazy<Selector> =
    Lazy::new(|| selector(r#"[rel="author"], .byline, .author-name, [itemprop="author"]"#));
static PUBLISHED_META: Lazy<Selector> =
    Lazy::new(|| selector(r#"meta[property="article:published_time"], meta[name="pubdate"]"#));
static TIME_DATETIME: Lazy<Selector> = Lazy::new(|| selector("time[datetime]"));
static JSON_LD: Lazy<Selector> = Lazy::new(|| selector(r#"script[type="application/ld+json"]"#));

const ARTICLE_TYPES: [&str; 5] = [
    "NewsArticle",
    "Article",
    "ReportageNewsArticle",
    "BlogPosting",
    "AnalysisNewsArticle",
];

fn element_text(element: ElementRef<'_>) -> String {
    normalize_whitespace(&element.text().collect::<Vec<_>>().join(" "))
}

fn first_text(document: &Html, sel: &Selector) -> Option<String> {
    document
        .select(sel)
        .map(element_text)
        .find(|t| !t.is_empty())
}

fn first_attr(document: &Html, sel: &Selector, attr: &str) -> Option<String> {
    document
        .select(sel)
        .filter_map(|e| e.value().attr(attr))
        .map(normalize_whitespace)
        .find(|t| !t.is_empty())
}

fn insert(fields: &mut FieldMap, field: Field, value: Option<String>) {
    if let Some(value) = value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        fields.insert(field, value);
    }
}

fn strip_byline(author: String) -> String {
    let trimmed = author.trim();
    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("by ") {
        trimmed[3..].trim().to_string()
    } else {
        trimmed.to_string()
    }
}

fn paragraphs(document: &Html, sel: &Selector) -> Vec<String> {
    document
        .select(sel)
        .map(element_text)
        .filter(|t| word_count(t) >= MIN_PARAGRAPH_WORDS)
        .collect()
}

/// Cheap heuristics that work on most article templates.
pub fn lightweight(html: &str) -> FieldMap {
    let document = Html::parse_document(html);
    let mut fields = FieldMap::new();

    let headline = first_attr(&document, &OG_TITLE, "content")
        .or_else(|| first_text(&document, &H1))
        .or_else(|| first_text(&document, &TITLE));
    insert(&mut fields, Field::Headline, headline);

    let mut body = paragraphs(&document, &ARTICLE_PARAGRAPH);
    if body.is_empty() {
        body = paragraphs(&document, &PARAGRAPH);
    }
    insert(&mut fields, Field::Body, Some(body.join("\n\n")));

    let author = first_attr(&document, &META_AUTHOR, "content")
        .filter(|a| !a.starts_with("http"))
        .or_else(|| first_text(&document, &REL_AUTHOR))
        .map(strip_byline);
    insert(&mut fields, Field::Author, author);

    let published = first_attr(&document, &PUBLISHED_META, "content")
        .or_else(|| first_attr(&document, &TIME_DATETIME, "datetime"));
    insert(&mut fields, Field::PublishedAt, published);

    fields
}

/// Site-rule selectors, falling back to JSON-LD for anything they miss.
pub fn structural(html: &str, rule: Option<&SiteRule>) -> FieldMap {
    let document = Html::parse_document(html);
    let mut fields = json_ld(&document);

    if let Some(rule) = rule {
        for (field, css) in [
            (Field::Headline, rule.headline.as_deref()),
            (Field::Body, rule.body.as_deref()),
            (Field::Author, rule.author.as_deref()),
            (Field::PublishedAt, rule.published.as_deref()),
        ] {
            let Some(css) = css else { continue };
            let sel = match Selector::parse(css) {
                Ok(sel) => sel,
                Err(e) => {
                    warn!(domain = %rule.domain, %css, error = ?e, "Ignoring invalid site-rule selector");
                    continue;
                }
            };
            let value = match field {
                Field::Body => {
                    let parts: Vec<String> = document
                        .select(&sel)
                        .map(element_text)
                        .filter(|t| !t.is_empty())
                        .collect();
                    Some(parts.join("\n\n"))
                }
                Field::PublishedAt => document
                    .select(&sel)
                    .find_map(|e| e.value().attr("datetime").map(str::to_string))
                    .or_else(|| first_text(&document, &sel)),
                Field::Author => first_text(&document, &sel).map(strip_byline),
                Field::Headline => first_text(&document, &sel),
            };
            insert(&mut fields, field, value);
        }
    }
    fields
}

fn is_article_type(value: &Value) -> bool {
    match value.get("@type") {
        Some(Value::String(t)) => ARTICLE_TYPES.contains(&t.as_str()),
        Some(Value::Array(types)) => types
            .iter()
            .filter_map(Value::as_str)
            .any(|t| ARTICLE_TYPES.contains(&t)),
        _ => false,
    }
}

fn collect_article_nodes<'a>(value: &'a Value, out: &mut Vec<&'a Value>) {
    match value {
        Value::Array(items) => items.iter().for_each(|v| collect_article_nodes(v, out)),
        Value::Object(map) => {
            if is_article_type(value) {
                out.push(value);
            }
            if let Some(graph) = map.get("@graph") {
                collect_article_nodes(graph, out);
            }
        }
        _ => {}
    }
}

fn author_name(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("name").and_then(Value::as_str).map(str::to_string),
        Value::Array(items) => {
            let names: Vec<String> = items.iter().filter_map(author_name).collect();
            (!names.is_empty()).then(|| names.join(", "))
        }
        _ => None,
    }
}

fn article_nodes(document: &Html) -> Vec<Value> {
    document
        .select(&JSON_LD)
        .filter_map(|script| serde_json::from_str::<Value>(&script.text().collect::<String>()).ok())
        .collect()
}

/// schema.org `NewsArticle`/`Article` fields from JSON-LD blocks.
fn json_ld(document: &Html) -> FieldMap {
    let mut fields = FieldMap::new();
    let blocks = article_nodes(document);
    let mut nodes = Vec::new();
    for block in &blocks {
        collect_article_nodes(block, &mut nodes);
    }
    for node in nodes {
        let text = |key: &str| {
            node.get(key)
                .and_then(Value::as_str)
                .map(normalize_whitespace)
        };
        if !fields.contains_key(&Field::Headline) {
            insert(&mut fields, Field::Headline, text("headline"));
        }
        if !fields.contains_key(&Field::Body) {
            insert(&mut fields, Field::Body, text("articleBody"));
        }
        if !fields.contains_key(&Field::Author) {
            insert(&mut fields, Field::Author, node.get("author").and_then(author_name));
        }
        if !fields.contains_key(&Field::PublishedAt) {
            insert(&mut fields, Field::PublishedAt, text("datePublished"));
        }
    }
    fields
}

/// Whether a fetched candidate page is an article worth extracting.
pub fn looks_like_article(html: &str) -> bool {
    let document = Html::parse_document(html);
    let og_article = document
        .select(&OG_TYPE)
        .filter_map(|e| e.value().attr("content"))
        .any(|t| t.eq_ignore_ascii_case("article"));
    if og_article {
        return true;
    }
    let mut nodes = Vec::new();
    let blocks = article_nodes(&document);
    for block in &blocks {
        collect_article_nodes(block, &mut nodes);
    }
    if !nodes.is_empty() {
        return true;
    }
    if document.select(&ARTICLE).next().is_some() {
        return true;
    }
    paragraphs(&document, &PARAGRAPH).len() >= ARTICLE_PARAGRAPHS
}
