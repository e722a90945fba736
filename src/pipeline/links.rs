//! Link discovery from seed pages.
//!
//! Seeds are HTML listing pages, RSS/Atom feeds or XML sitemaps. Links are
//! resolved against the seed URL, kept only when they stay on one of the
//! dataset's hosts and match its `link_pattern`, and deduplicated.

use crate::models::Dataset;
use crate::utils::host_of;
use itertools::Itertools;
use once_cell::sync::Lazy;
use quick_xml::escape::unescape;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use regex::Regex;
use scraper::{Html, Selector};
use tracing::{debug, warn};
use url::Url;

static ANCHOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("a[href]").expect("anchor selector is valid"));

/// Whether `body` is an XML feed or sitemap rather than an HTML page.
pub fn is_feed(body: &str) -> bool {
    let head: String = body.trim_start().chars().take(512).collect::<String>().to_ascii_lowercase();
    head.starts_with("<?xml")
        || head.starts_with("<rss")
        || head.starts_with("<feed")
        || head.starts_with("<urlset")
}

/// Raw `href`s of every anchor in an HTML page.
pub fn html_hrefs(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    document
        .select(&ANCHOR)
        .filter_map(|a| a.value().attr("href"))
        .map(str::to_string)
        .collect()
}

fn decode(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    match unescape(&text) {
        Ok(unescaped) => unescaped.into_owned(),
        Err(_) => text.into_owned(),
    }
}

/// Entry links of an RSS or Atom feed, or page locations of a sitemap.
pub fn feed_links(xml: &str) -> Vec<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut links = Vec::new();
    let mut entry_depth = 0usize;
    let mut capturing = false;
    let mut text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"item" | b"entry" | b"url" => entry_depth += 1,
                b"link" | b"loc" if entry_depth > 0 => {
                    if let Ok(Some(href)) = e.try_get_attribute("href") {
                        links.push(decode(&href.value));
                    } else {
                        capturing = true;
                        text.clear();
                    }
                }
                _ => {}
            },
            Ok(Event::Empty(e)) if entry_depth > 0 && e.local_name().as_ref() == b"link" => {
                let alternate = match e.try_get_attribute("rel") {
                    Ok(Some(rel)) => decode(&rel.value) == "alternate",
                    _ => true,
                };
                if let (true, Ok(Some(href))) = (alternate, e.try_get_attribute("href")) {
                    links.push(decode(&href.value));
                }
            }
            Ok(Event::Text(t)) if capturing => text.push_str(&String::from_utf8_lossy(&t)),
            Ok(Event::CData(c)) if capturing => text.push_str(&String::from_utf8_lossy(&c)),
            Ok(Event::GeneralRef(r)) if capturing => {
                text.push_str(&decode(format!("&{};", String::from_utf8_lossy(&r)).as_bytes()))
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"item" | b"entry" | b"url" => entry_depth = entry_depth.saturating_sub(1),
                b"link" | b"loc" if capturing => {
                    capturing = false;
                    let link = decode(text.trim().as_bytes());
                    if !link.is_empty() {
                        links.push(link);
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                warn!(position = reader.buffer_position(), error = %e, "Malformed feed; keeping links read so far");
                break;
            }
            _ => {}
        }
    }
    links
}

/// Resolve, filter and deduplicate raw links found on `seed_url`.
pub fn candidate_links(
    seed_url: &str,
    raw: impl IntoIterator<Item = String>,
    dataset: &Dataset,
    pattern: Option<&Regex>,
) -> Vec<String> {
    let Ok(base) = Url::parse(seed_url) else {
        return Vec::new();
    };
    let seed_host = host_of(seed_url);
    let links: Vec<String> = raw
        .into_iter()
        .filter_map(|href| base.join(href.trim()).ok())
        .filter(|u| matches!(u.scheme(), "http" | "https"))
        .map(|mut u| {
            u.set_fragment(None);
            u
        })
        .filter(|u| {
            let host = u.host_str().map(str::to_ascii_lowercase);
            host.is_some()
                && (host == seed_host
                    || dataset
                        .domains
                        .iter()
                        .any(|d| host.as_deref() == Some(d.as_str())))
        })
        .map(String::from)
        .filter(|u| u != seed_url && u != base.as_str())
        .filter(|u| pattern.is_none_or(|p| p.is_match(u)))
        .unique()
        .collect();
    debug!(seed_url, found = links.len(), "Resolved candidate links");
    links
}

/// Candidate article URLs found in a seed page of either kind.
pub fn discover(seed_url: &str, body: &str, dataset: &Dataset, pattern: Option<&Regex>) -> Vec<String> {
    let raw = if is_feed(body) {
        feed_links(body)
    } else {
        html_hrefs(body)
    };
    candidate_links(seed_url, raw, dataset, pattern)
}
