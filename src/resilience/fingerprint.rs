//! Request profiles: user agent, header set and referer per request.
//!
//! Profiles are drawn from a weighted pool. At sensitivity 0 the pool
//! favours the most common browsers and sends a modest header set. As a
//! domain's sensitivity rises the user-agent weights flatten towards
//! uniform, the previous user agent is avoided with increasing probability
//! and more optional headers are sent. Referers follow a fixed categorical
//! distribution so no single static value is ever sent.

use rand::Rng;
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;
use rand::seq::{IndexedRandom, SliceRandom};
use serde::Serialize;

use super::MAX_SENSITIVITY;

/// Where the referer header points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RefererKind {
    SameDomain,
    SearchEngine,
    None,
}

/// Fixed referer distribution: same-domain path, external search engine, none.
const REFERER_WEIGHTS: [(RefererKind, u32); 3] = [
    (RefererKind::SameDomain, 45),
    (RefererKind::SearchEngine, 35),
    (RefererKind::None, 20),
];

const SEARCH_ENGINES: [&str; 3] = [
    "https://www.google.com/",
    "https://duckduckgo.com/",
    "https://www.bing.com/search?q=",
];

const SAME_DOMAIN_PATHS: [&str; 4] = ["/", "/news/", "/latest/", "/world/"];

/// (user agent, popularity weight)
const USER_AGENTS: [(&str, f64); 7] = [
    (
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
        40.0,
    ),
    (
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
        20.0,
    ),
    (
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.1 Safari/605.1.15",
        12.0,
    ),
    (
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) Gecko/20100101 Firefox/133.0",
        10.0,
    ),
    (
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36 Edg/131.0.0.0",
        8.0,
    ),
    (
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
        6.0,
    ),
    (
        "Mozilla/5.0 (iPhone; CPU iPhone OS 18_1 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.1 Mobile/15E148 Safari/604.1",
        4.0,
    ),
];

const ACCEPT_LANGUAGES: [&str; 4] = [
    "en-US,en;q=0.9",
    "en-GB,en;q=0.9",
    "en-US,en;q=0.8,fr;q=0.5",
    "en,en-US;q=0.9,de;q=0.4",
];

const OPTIONAL_HEADERS: [(&str, &str); 7] = [
    ("Upgrade-Insecure-Requests", "1"),
    ("Sec-Fetch-Dest", "document"),
    ("Sec-Fetch-Mode", "navigate"),
    ("Sec-Fetch-Site", "none"),
    ("Sec-Fetch-User", "?1"),
    ("DNT", "1"),
    ("Cache-Control", "max-age=0"),
];

/// Everything a fetcher needs to shape one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestProfile {
    pub user_agent: String,
    pub headers: Vec<(String, String)>,
    pub referer: Option<String>,
    pub referer_kind: RefererKind,
    /// Index into the user-agent pool, remembered to avoid repeats.
    #[serde(skip)]
    pub user_agent_index: usize,
}

/// The weighted pool profiles are drawn from.
#[derive(Debug, Clone, Default)]
pub struct ProfilePool;

impl ProfilePool {
    /// Draw a profile for `domain` at `sensitivity`, avoiding `last_user_agent`
    /// with probability `sensitivity / 10`.
    pub fn draw<R: Rng + ?Sized>(
        &self,
        domain: &str,
        sensitivity: u8,
        last_user_agent: Option<usize>,
        rng: &mut R,
    ) -> RequestProfile {
        let level = f64::from(sensitivity.min(MAX_SENSITIVITY)) / f64::from(MAX_SENSITIVITY);

        let mean = USER_AGENTS.iter().map(|(_, w)| w).sum::<f64>() / USER_AGENTS.len() as f64;
        let mut weights: Vec<f64> = USER_AGENTS
            .iter()
            .map(|(_, w)| w * (1.0 - level) + mean * level)
            .collect();
        if let Some(last) = last_user_agent {
            if last < weights.len() && rng.random_bool(level) {
                weights[last] = 0.0;
            }
        }
        let user_agent_index = WeightedIndex::new(&weights)
            .map(|dist| dist.sample(rng))
            .unwrap_or(0);

        let mut headers = vec![(
            "Accept".to_string(),
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string(),
        )];
        let language = if rng.random_bool(level) {
            ACCEPT_LANGUAGES.choose(rng).copied().unwrap_or(ACCEPT_LANGUAGES[0])
        } else {
            ACCEPT_LANGUAGES[0]
        };
        headers.push(("Accept-Language".to_string(), language.to_string()));

        let extra = 1 + (level * (OPTIONAL_HEADERS.len() - 1) as f64).round() as usize;
        let mut optional = OPTIONAL_HEADERS.to_vec();
        optional.shuffle(rng);
        headers.extend(
            optional
                .into_iter()
                .take(extra)
                .map(|(k, v)| (k.to_string(), v.to_string())),
        );

        let referer_kind = draw_referer_kind(rng);
        let referer = match referer_kind {
            RefererKind::SameDomain => {
                let path = SAME_DOMAIN_PATHS.choose(rng).copied().unwrap_or("/");
                Some(format!("https://{domain}{path}"))
            }
            RefererKind::SearchEngine => {
                let engine = SEARCH_ENGINES.choose(rng).copied().unwrap_or(SEARCH_ENGINES[0]);
                if engine.ends_with("q=") {
                    Some(format!("{engine}{}", urlencoding::encode(domain)))
                } else {
                    Some(engine.to_string())
                }
            }
            RefererKind::None => None,
        };

        RequestProfile {
            user_agent: USER_AGENTS[user_agent_index].0.to_string(),
            headers,
            referer,
            referer_kind,
            user_agent_index,
        }
    }
}

fn draw_referer_kind<R: Rng + ?Sized>(rng: &mut R) -> RefererKind {
    WeightedIndex::new(REFERER_WEIGHTS.iter().map(|(_, w)| *w))
        .map(|dist| REFERER_WEIGHTS[dist.sample(rng)].0)
        .unwrap_or(RefererKind::None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::HashMap;

    #[test]
    fn test_referer_follows_categorical_distribution() {
        let pool = ProfilePool;
        let mut rng = StdRng::seed_from_u64(42);
        let mut counts: HashMap<RefererKind, usize> = HashMap::new();
        for _ in 0..4000 {
            let profile = pool.draw("example.com", 0, None, &mut rng);
            *counts.entry(profile.referer_kind).or_default() += 1;
            match profile.referer_kind {
                RefererKind::None => assert!(profile.referer.is_none()),
                RefererKind::SameDomain => {
                    assert!(profile.referer.unwrap().starts_with("https://example.com/"))
                }
                RefererKind::SearchEngine => assert!(profile.referer.is_some()),
            }
        }
        let share = |k| counts.get(&k).copied().unwrap_or(0) as f64 / 4000.0;
        assert!((share(RefererKind::SameDomain) - 0.45).abs() < 0.05);
        assert!((share(RefererKind::SearchEngine) - 0.35).abs() < 0.05);
        assert!((share(RefererKind::None) - 0.20).abs() < 0.05);
    }

    #[test]
    fn test_max_sensitivity_never_repeats_user_agent() {
        let pool = ProfilePool;
        let mut rng = StdRng::seed_from_u64(5);
        let mut last = None;
        for _ in 0..300 {
            let profile = pool.draw("example.com", MAX_SENSITIVITY, last, &mut rng);
            assert_ne!(Some(profile.user_agent_index), last);
            last = Some(profile.user_agent_index);
        }
    }

    #[test]
    fn test_header_diversity_grows_with_sensitivity() {
        let pool = ProfilePool;
        let mut rng = StdRng::seed_from_u64(9);
        let calm = pool.draw("example.com", 0, None, &mut rng);
        let wary = pool.draw("example.com", MAX_SENSITIVITY, None, &mut rng);
        assert_eq!(calm.headers.len(), 3);
        assert_eq!(wary.headers.len(), 2 + OPTIONAL_HEADERS.len());
        assert_eq!(calm.headers[1].1, ACCEPT_LANGUAGES[0]);
    }

    #[test]
    fn test_low_sensitivity_favours_common_user_agents() {
        let pool = ProfilePool;
        let mut rng = StdRng::seed_from_u64(13);
        let mut calm_top = 0;
        let mut wary_top = 0;
        for _ in 0..3000 {
            if pool.draw("example.com", 0, None, &mut rng).user_agent_index == 0 {
                calm_top += 1;
            }
            if pool.draw("example.com", MAX_SENSITIVITY, None, &mut rng).user_agent_index == 0 {
                wary_top += 1;
            }
        }
        assert!(calm_top > wary_top);
    }
}
