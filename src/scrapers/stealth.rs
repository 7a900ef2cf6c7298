//! Anti-blocking heuristics for crawl sessions.
//!
//! What a "human-looking" session is changes as target sites update their
//! defenses, so the crawler only talks to [`StealthPolicy`].

use rand::seq::IndexedRandom;
use rand::{Rng, rng};
use std::time::Duration;

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 13_6_3) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36 Edg/122.0.0.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:123.0) Gecko/20100101 Firefox/123.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:123.0) Gecko/20100101 Firefox/123.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
];

const BASE_RESOLUTIONS: &[(u32, u32)] = &[
    (1920, 1080),
    (1366, 768),
    (1440, 900),
    (1536, 864),
    (2560, 1440),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Identity presented by every request of one (source, category) crawl.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_agent: String,
    pub headers: Vec<(String, String)>,
    pub viewport: Viewport,
}

pub trait StealthPolicy: Send + Sync {
    /// A fresh session identity.
    fn session(&self) -> Session;

    /// Pause before the next request within a session.
    fn delay(&self) -> Duration;
}

/// Rotating desktop user agents, `es-AR` headers, jittered viewports and
/// roughly normal delays between `min_delay` and `max_delay`.
#[derive(Debug, Clone)]
pub struct HumanLikeStealth {
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for HumanLikeStealth {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(5),
        }
    }
}

fn headers_for(user_agent: &str) -> Vec<(String, String)> {
    let mut headers = vec![
        (
            "Accept".to_string(),
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8".to_string(),
        ),
        ("Accept-Language".to_string(), "es-AR,es;q=0.9,en;q=0.8".to_string()),
        ("DNT".to_string(), "1".to_string()),
        ("Upgrade-Insecure-Requests".to_string(), "1".to_string()),
    ];
    if user_agent.contains("Chrome") {
        headers.extend([
            ("Sec-Fetch-Dest".to_string(), "document".to_string()),
            ("Sec-Fetch-Mode".to_string(), "navigate".to_string()),
            ("Sec-Fetch-Site".to_string(), "none".to_string()),
            ("sec-ch-ua-mobile".to_string(), "?0".to_string()),
        ]);
    }
    headers
}

impl StealthPolicy for HumanLikeStealth {
    fn session(&self) -> Session {
        let mut rng = rng();
        let user_agent = USER_AGENTS.choose(&mut rng).copied().unwrap_or(USER_AGENTS[0]);
        let (width, height) = BASE_RESOLUTIONS
            .choose(&mut rng)
            .copied()
            .unwrap_or((1920, 1080));
        Session {
            user_agent: user_agent.to_string(),
            headers: headers_for(user_agent),
            viewport: Viewport {
                width: width.saturating_add_signed(rng.random_range(-10..=10)),
                height: height.saturating_add_signed(rng.random_range(-10..=10)),
            },
        }
    }

    fn delay(&self) -> Duration {
        let min = self.min_delay.as_millis() as u64;
        let max = (self.max_delay.as_millis() as u64).max(min);
        if min == max {
            return self.min_delay;
        }
        // mean of three uniforms: bell-shaped, never outside [min, max]
        let mut rng = rng();
        let sum: u64 = (0..3).map(|_| rng.random_range(min..=max)).sum();
        Duration::from_millis(sum / 3)
    }
}

#[cfg(test)]
pub(crate) struct FixedStealth;

#[cfg(test)]
impl StealthPolicy for FixedStealth {
    fn session(&self) -> Session {
        Session {
            user_agent: USER_AGENTS[0].to_string(),
            headers: headers_for(USER_AGENTS[0]),
            viewport: Viewport {
                width: 1920,
                height: 1080,
            },
        }
    }

    fn delay(&self) -> Duration {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sessions_vary_within_bounds() {
        let policy = HumanLikeStealth::default();
        for _ in 0..50 {
            let session = policy.session();
            assert!(USER_AGENTS.contains(&session.user_agent.as_str()));
            assert!(
                BASE_RESOLUTIONS.iter().any(|(w, h)| {
                    session.viewport.width.abs_diff(*w) <= 10 && session.viewport.height.abs_diff(*h) <= 10
                })
            );
            assert!(
                session
                    .headers
                    .iter()
                    .any(|(k, v)| k == "Accept-Language" && v.starts_with("es-AR"))
            );
        }
    }

    #[test]
    fn test_delay_stays_in_range() {
        let policy = HumanLikeStealth::default();
        for _ in 0..200 {
            let delay = policy.delay();
            assert!(delay >= policy.min_delay && delay <= policy.max_delay);
        }
    }
}
