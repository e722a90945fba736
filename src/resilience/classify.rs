//! Bot-signal classification of HTTP responses.
//!
//! [`classify_response`] turns a status code and body into an [`Outcome`]
//! without touching the network, so it can be tested against fixture
//! strings. Some defenses answer `200 OK` with an interstitial, so the body
//! is inspected for challenge-page markers regardless of status.
//!
//! Markers come in two strengths. Strong markers (Cloudflare challenge
//! scripts, DataDome and Incapsula resources, "Just a moment..." titles) only
//! ever appear on challenge pages and count anywhere. Weak markers such as
//! a bare "captcha" also show up in comment forms of ordinary articles, so
//! they only count on short bodies.

use super::Outcome;
use once_cell::sync::Lazy;
use regex::RegexSet;

/// Bodies shorter than this (after trimming) are treated as interstitial-sized.
pub const SHORT_BODY_BYTES: usize = 2048;

static STRONG_MARKERS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)<title>\s*just a moment\.\.\.\s*</title>",
        r"(?i)<title>\s*attention required!\s*\|\s*cloudflare\s*</title>",
        r"(?i)cf-browser-verification|cf_chl_opt|/cdn-cgi/challenge-platform/|cf-challenge-running",
        r"(?i)checking (if the site connection is secure|your browser before accessing)",
        r"(?i)<title>\s*ddos-guard\s*</title>",
        r"(?i)captcha-delivery\.com",
        r"(?i)_incapsula_resource|incapsula incident id",
        r"(?i)px-captcha|_pxappid",
        r"(?i)please verify you are (a )?human",
        r"(?i)access to this page has been denied",
        r"(?i)<title>\s*(are you a robot\??|robot check|access denied)\s*</title>",
        r"(?i)errors\.edgesuite\.net",
    ])
    .expect("static challenge markers are valid regexes")
});

static WEAK_MARKERS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)captcha",
        r"(?i)unusual traffic",
        r"(?i)enable javascript and cookies",
        r"(?i)are you a robot",
        r"(?i)automated (access|requests|queries)",
    ])
    .expect("static challenge markers are valid regexes")
});

/// Whether `body` looks like an anti-automation challenge page.
pub fn looks_like_challenge(body: &str) -> bool {
    STRONG_MARKERS.is_match(body) || (is_short(body) && WEAK_MARKERS.is_match(body))
}

fn is_short(body: &str) -> bool {
    body.trim().len() < SHORT_BODY_BYTES
}

/// Statuses that mean the resource does not exist.
pub fn is_not_found(status: u16) -> bool {
    matches!(status, 404 | 410)
}

/// Classify a response into the outcome the resilience engine records.
pub fn classify_response(status: u16, body: &str) -> Outcome {
    let challenge = looks_like_challenge(body);
    match status {
        200..=299 if challenge => Outcome::BotProtectionDetected,
        200..=299 => Outcome::Success,
        429 => Outcome::RateLimited,
        403 | 503 if challenge || is_short(body) => Outcome::BotProtectionDetected,
        503 => Outcome::TransientFailure,
        403 => Outcome::PermanentFailure,
        404 | 410 | 451 => Outcome::PermanentFailure,
        408 | 425 => Outcome::TransientFailure,
        400..=499 if challenge => Outcome::BotProtectionDetected,
        400..=499 => Outcome::PermanentFailure,
        500..=599 if challenge => Outcome::BotProtectionDetected,
        _ => Outcome::TransientFailure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLOUDFLARE_INTERSTITIAL: &str = r#"<!DOCTYPE html><html lang="en-US"><head>
<title>Just a moment...</title>
<meta http-equiv="refresh" content="390">
<script>(function(){window._cf_chl_opt={cvId: '3',cZone: "news.example.com"};}());</script>
</head><body><div class="main-wrapper"><noscript>Enable JavaScript and cookies to continue</noscript></div>
<script src="/cdn-cgi/challenge-platform/h/g/orchestrate/chl_page/v1"></script></body></html>"#;

    const DATADOME_PAGE: &str = r#"<html><head><title>example.com</title></head><body>
<p>Please enable JS and disable any ad blocker</p>
<script data-cfasync="false">var dd={'rt':'c','cid':'AHrlqAAAAAMA','hsh':'2211F522B61E'};</script>
<script src="https://ct.captcha-delivery.com/c.js"></script></body></html>"#;

    const AKAMAI_DENIED: &str = r#"<HTML><HEAD><TITLE>Access Denied</TITLE></HEAD><BODY>
<H1>Access Denied</H1>You don't have permission to access "http://www.example.com/news/" on this server.<P>
Reference #18.5c0e1002.1700000000.2a3b4c5d<P>https://errors.edgesuite.net/18.5c0e1002.1700000000.2a3b4c5d</P></BODY></HTML>"#;

    const SHORT_CAPTCHA: &str = r#"<html><body><form action="/verify">
<div class="g-recaptcha" data-sitekey="6Lc"></div>
<p>Our systems have detected unusual traffic from your computer network.</p></form></body></html>"#;

    fn normal_article() -> String {
        let paragraph = "<p>The city council voted on Tuesday to expand the tram network, \
            adding six new stops along the river and extending service hours into the night. \
            Officials said construction would begin next spring.</p>";
        format!(
            r#"<html><head><title>Council expands tram network</title>
<meta property="og:type" content="article"></head>
<body><article><h1>Council expands tram network</h1>{}</article>
<section class="comments"><h3>Leave a comment</h3><div class="g-recaptcha" data-sitekey="x"></div>
<p>Comments are protected by reCAPTCHA.</p></section></body></html>"#,
            paragraph.repeat(20)
        )
    }

    #[test]
    fn test_interstitial_on_200_is_bot_protection() {
        assert_eq!(
            classify_response(200, CLOUDFLARE_INTERSTITIAL),
            Outcome::BotProtectionDetected
        );
        assert_eq!(classify_response(200, DATADOME_PAGE), Outcome::BotProtectionDetected);
    }

    #[test]
    fn test_normal_article_is_success_even_with_captcha_comment_form() {
        let body = normal_article();
        assert!(body.len() > SHORT_BODY_BYTES);
        assert_eq!(classify_response(200, &body), Outcome::Success);
    }

    #[test]
    fn test_short_page_with_weak_marker_is_bot_protection() {
        assert_eq!(classify_response(200, SHORT_CAPTCHA), Outcome::BotProtectionDetected);
    }

    #[test]
    fn test_short_403_and_503_are_suspicious() {
        assert_eq!(classify_response(403, "Forbidden"), Outcome::BotProtectionDetected);
        assert_eq!(classify_response(503, ""), Outcome::BotProtectionDetected);
        assert_eq!(classify_response(403, AKAMAI_DENIED), Outcome::BotProtectionDetected);
    }

    #[test]
    fn test_long_503_without_markers_is_transient() {
        let body = format!("<html><body>{}</body></html>", "<p>Service maintenance in progress.</p>".repeat(100));
        assert_eq!(classify_response(503, &body), Outcome::TransientFailure);
    }

    #[test]
    fn test_long_403_without_markers_is_permanent() {
        let body = format!("<html><body>{}</body></html>", "<p>This content is for subscribers.</p>".repeat(100));
        assert_eq!(classify_response(403, &body), Outcome::PermanentFailure);
    }

    #[test]
    fn test_status_only_classes() {
        assert_eq!(classify_response(429, ""), Outcome::RateLimited);
        assert_eq!(classify_response(404, "Not Found"), Outcome::PermanentFailure);
        assert_eq!(classify_response(410, "Gone"), Outcome::PermanentFailure);
        assert_eq!(classify_response(408, ""), Outcome::TransientFailure);
        assert_eq!(classify_response(500, "Internal Server Error"), Outcome::TransientFailure);
        assert_eq!(classify_response(502, "Bad Gateway"), Outcome::TransientFailure);
        assert_eq!(classify_response(400, "Bad Request"), Outcome::PermanentFailure);
    }

    #[test]
    fn test_challenge_markers_upgrade_error_statuses() {
        assert_eq!(
            classify_response(520, CLOUDFLARE_INTERSTITIAL),
            Outcome::BotProtectionDetected
        );
        assert_eq!(classify_response(401, DATADOME_PAGE), Outcome::BotProtectionDetected);
    }

    #[test]
    fn test_not_found_statuses() {
        assert!(is_not_found(404));
        assert!(is_not_found(410));
        assert!(!is_not_found(403));
    }
}
