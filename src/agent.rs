use std::sync::LazyLock;

use regex::Regex;

/// Classifies raw `User-Agent` strings.
///
/// The middleware only consumes the two answers below; plug in a full parser
/// by implementing this trait and passing it to
/// [`DetailedResponse::classifier`](crate::DetailedResponse::classifier).
pub trait UserAgentClassifier {
    /// Short browser label, e.g. `Firefox 128`.
    fn browser(&self, user_agent: &str) -> String;

    /// Whether the agent is a crawler or other automated client.
    fn is_bot(&self, user_agent: &str) -> bool;
}

/// Pattern based classifier used by default.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicClassifier;

// Order matters: Edge and Opera also announce Chrome, Chrome also announces Safari.
static FAMILIES: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("Edge", r"Edg(?:e|A|iOS)?/(\d+)"),
        ("Opera", r"(?:OPR|Opera)/(\d+)"),
        ("Firefox", r"(?:Firefox|FxiOS)/(\d+)"),
        ("Chrome", r"(?:Chrome|CriOS)/(\d+)"),
        ("Safari", r"Version/(\d+)[^ ]* (?:Mobile/\S+ )?Safari/"),
        ("IE", r"(?:MSIE |Trident/.*rv:)(\d+)"),
        ("curl", r"^curl/(\d+)"),
        ("Wget", r"^Wget/(\d+)"),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(pattern).expect("valid family pattern")))
    .collect()
});

static BOT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)bot\b|bot/|crawl|spider|slurp|mediapartners|facebookexternalhit|embedly|headless|lighthouse|pingdom|monitor|preview",
    )
    .expect("valid bot pattern")
});

impl UserAgentClassifier for BasicClassifier {
    fn browser(&self, user_agent: &str) -> String {
        FAMILIES
            .iter()
            .find_map(|(name, re)| {
                re.captures(user_agent)
                    .and_then(|caps| caps.get(1))
                    .map(|major| format!("{name} {}", major.as_str()))
            })
            .unwrap_or_else(|| "Other".to_string())
    }

    fn is_bot(&self, user_agent: &str) -> bool {
        BOT.is_match(user_agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIREFOX: &str =
        "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";
    const CHROME: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";
    const EDGE: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36 Edg/126.0.2592.87";
    const SAFARI: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_5) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Safari/605.1.15";
    const GOOGLEBOT: &str =
        "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)";

    #[test]
    fn test_browser_labels() {
        let classifier = BasicClassifier;
        assert_eq!(classifier.browser(FIREFOX), "Firefox 128");
        assert_eq!(classifier.browser(CHROME), "Chrome 126");
        assert_eq!(classifier.browser(EDGE), "Edge 126");
        assert_eq!(classifier.browser(SAFARI), "Safari 17");
        assert_eq!(classifier.browser("curl/8.5.0"), "curl 8");
        assert_eq!(classifier.browser(""), "Other");
        assert_eq!(classifier.browser("shot"), "Other");
    }

    #[test]
    fn test_bot_detection() {
        let classifier = BasicClassifier;
        assert!(classifier.is_bot(GOOGLEBOT));
        assert!(classifier.is_bot("Mozilla/5.0 (compatible; bingbot/2.0)"));
        assert!(classifier.is_bot("Baiduspider"));
        assert!(!classifier.is_bot(FIREFOX));
        assert!(!classifier.is_bot(CHROME));
        assert!(!classifier.is_bot(""));
    }
}
