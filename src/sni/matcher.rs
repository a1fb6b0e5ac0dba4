use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use regex::Regex;

use crate::config::Config;

/// One set's match universe: exact names, suffix rules and `regexp:`
/// patterns. Entries are ASCII-lowercased at build time; compilation
/// failures in regex entries are dropped silently.
pub struct SuffixSet {
    domains: HashSet<String>,
    regexes: Vec<Regex>,
    verdicts: RwLock<HashMap<String, bool>>,
}

impl SuffixSet {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut domains = HashSet::new();
        let mut regexes = Vec::new();

        for p in patterns {
            let p = p.as_ref().trim().to_ascii_lowercase();
            if p.is_empty() {
                continue;
            }
            if let Some(pattern) = p.strip_prefix("regexp:") {
                if let Ok(re) = Regex::new(pattern) {
                    regexes.push(re);
                }
                continue;
            }
            domains.insert(p.trim_end_matches('.').to_string());
        }

        Self {
            domains,
            regexes,
            verdicts: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty() && self.regexes.is_empty()
    }

    /// Exact lookup, then suffix lookups stripping one label at a time,
    /// then the regexes in declared order. Regex verdicts are cached per
    /// host; the domain path is cheap enough not to bother.
    pub fn matches(&self, host: &str) -> bool {
        if host.is_empty() || self.is_empty() {
            return false;
        }
        let host = host.to_ascii_lowercase();

        if self.match_domain(&host) {
            return true;
        }
        if !self.regexes.is_empty() {
            return self.match_regex(&host);
        }
        false
    }

    fn match_domain(&self, host: &str) -> bool {
        if self.domains.contains(host) {
            return true;
        }
        let mut rest = host;
        while let Some(idx) = rest.find('.') {
            rest = &rest[idx + 1..];
            if self.domains.contains(rest) {
                return true;
            }
        }
        false
    }

    fn match_regex(&self, host: &str) -> bool {
        if let Some(&hit) = self.verdicts.read().get(host) {
            return hit;
        }
        let hit = self.regexes.iter().any(|re| re.is_match(host));
        self.verdicts.write().insert(host.to_string(), hit);
        hit
    }
}

/// Maps a hostname to the id of the first enabled set that targets it.
/// Rebuilt wholesale on every config publish; the previous instance stays
/// valid for readers that already hold it.
pub struct Matcher {
    rules: Vec<(String, SuffixSet)>,
}

impl Matcher {
    /// `domain_union` is the effective global pattern list (manual domains
    /// plus geosite output); it rides along with the first enabled set,
    /// which owns the default policy.
    pub fn build(cfg: &Config, domain_union: &[String]) -> Self {
        let mut rules = Vec::new();
        let mut first = true;

        for set in cfg.sets.iter().filter(|s| s.enabled) {
            let mut patterns: Vec<&str> = set
                .targets
                .sni_domains
                .iter()
                .chain(set.targets.domains_to_match.iter())
                .map(String::as_str)
                .collect();
            if first {
                patterns.extend(domain_union.iter().map(String::as_str));
                first = false;
            }
            rules.push((set.id.clone(), SuffixSet::new(patterns)));
        }

        Self { rules }
    }

    pub fn match_host(&self, host: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|(_, set)| set.matches(host))
            .map(|(id, _)| id.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.rules.iter().all(|(_, s)| s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SetConfig;

    #[test]
    fn suffix_matches_subdomains() {
        let set = SuffixSet::new(["example.com"]);
        assert!(set.matches("example.com"));
        assert!(set.matches("a.b.example.com"));
        assert!(!set.matches("aexample.com"));
        assert!(!set.matches("example.org"));
    }

    #[test]
    fn matching_is_case_insensitive() {
        let set = SuffixSet::new(["Example.COM"]);
        assert!(set.matches("WWW.EXAMPLE.com"));
    }

    #[test]
    fn trailing_dots_and_blank_entries_ignored() {
        let set = SuffixSet::new(["example.com.", "   ", ""]);
        assert!(set.matches("example.com"));
    }

    #[test]
    fn regex_entries_compile_or_drop() {
        let set = SuffixSet::new(["regexp:^video\\d+\\.cdn\\.test$", "regexp:((broken"]);
        assert!(set.matches("video42.cdn.test"));
        assert!(!set.matches("video.cdn.test"));
    }

    #[test]
    fn suffix_and_regex_coexist() {
        let set = SuffixSet::new(["example.com", "regexp:.*\\.tracker\\.net$"]);
        assert!(set.matches("cdn.example.com"));
        assert!(set.matches("a.tracker.net"));
        assert!(!set.matches("tracker.org"));
    }

    #[test]
    fn matcher_returns_first_enabled_set() {
        let mut cfg = Config::default();
        cfg.sets[0].targets.sni_domains = vec!["first.example".into()];
        let mut second = SetConfig::named("second", "Second");
        second.targets.sni_domains = vec!["second.example".into()];
        cfg.sets.push(second);

        let m = Matcher::build(&cfg, &[]);
        assert_eq!(m.match_host("first.example"), Some("main"));
        assert_eq!(m.match_host("www.second.example"), Some("second"));
        assert_eq!(m.match_host("neither.example"), None);
    }

    #[test]
    fn domain_union_attaches_to_first_set() {
        let cfg = Config::default();
        let m = Matcher::build(&cfg, &["union.example".to_string()]);
        assert_eq!(m.match_host("union.example"), Some("main"));
    }

    #[test]
    fn disabled_set_never_matches() {
        let mut cfg = Config::default();
        cfg.sets[0].enabled = false;
        cfg.sets[0].targets.sni_domains = vec!["off.example".into()];
        let m = Matcher::build(&cfg, &[]);
        assert_eq!(m.match_host("off.example"), None);
    }
}
