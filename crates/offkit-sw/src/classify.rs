//! Request classification.
//!
//! Maps an intercepted request to the caching strategy that will handle
//! it. Classification is pure: it looks only at the URL path, never at
//! the network or the store.

use hashbrown::HashSet;

use offkit_net::Request;

/// Which caching protocol handles a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyTag {
    /// Serve from the cache; go to the network only on a miss.
    CacheFirst,
    /// Go to the network; fall back to the cache on failure.
    NetworkFirst,
    /// Serve from the cache and refresh it from the network in the
    /// background.
    StaleWhileRevalidate,
}

impl StrategyTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyTag::CacheFirst => "cache-first",
            StrategyTag::NetworkFirst => "network-first",
            StrategyTag::StaleWhileRevalidate => "stale-while-revalidate",
        }
    }
}

/// One substring rule in the classifier chain.
#[derive(Debug, Clone)]
pub struct PathRule {
    pub needle: String,
    pub strategy: StrategyTag,
}

/// Pure request → strategy classifier.
///
/// Precedence: exact membership in the static-asset path set wins, then
/// the substring rules in order, then the default. `classify` is total.
#[derive(Debug, Clone)]
pub struct Classifier {
    static_paths: HashSet<String>,
    rules: Vec<PathRule>,
    default: StrategyTag,
}

impl Classifier {
    /// Build the standard chain: static assets are cache-first, API
    /// endpoints are network-first, recipe pages revalidate in the
    /// background, everything else is network-first.
    pub fn new<I>(static_paths: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self {
            static_paths: static_paths.into_iter().collect(),
            rules: vec![
                PathRule {
                    needle: "/api/".to_string(),
                    strategy: StrategyTag::NetworkFirst,
                },
                PathRule {
                    needle: "/recipes".to_string(),
                    strategy: StrategyTag::StaleWhileRevalidate,
                },
            ],
            default: StrategyTag::NetworkFirst,
        }
    }

    pub fn classify(&self, request: &Request) -> StrategyTag {
        let path = request.path();
        if self.static_paths.contains(path) {
            return StrategyTag::CacheFirst;
        }
        for rule in &self.rules {
            if path.contains(&rule.needle) {
                return rule.strategy;
            }
        }
        self.default
    }

    /// The substring rules in precedence order.
    pub fn rules(&self) -> &[PathRule] {
        &self.rules
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn classifier() -> Classifier {
        Classifier::new(
            [
                "/",
                "/static/manifest.json",
                "/static/icon-192x192.png",
                "/static/icon-512x512.png",
            ]
            .map(String::from),
        )
    }

    fn request(target: &str) -> Request {
        Request::get(Url::parse(target).unwrap())
    }

    #[test]
    fn test_static_assets_are_cache_first() {
        let c = classifier();
        assert_eq!(
            c.classify(&request("https://app.test/")),
            StrategyTag::CacheFirst
        );
        assert_eq!(
            c.classify(&request("https://app.test/static/icon-192x192.png")),
            StrategyTag::CacheFirst
        );
    }

    #[test]
    fn test_static_membership_beats_substring_rules() {
        // An asset path that also contains a rule needle stays cache-first.
        let c = Classifier::new(["/api/schema.json".to_string()]);
        assert_eq!(
            c.classify(&request("https://app.test/api/schema.json")),
            StrategyTag::CacheFirst
        );
    }

    #[test]
    fn test_api_paths_are_network_first() {
        let c = classifier();
        assert_eq!(
            c.classify(&request("https://app.test/api/sync")),
            StrategyTag::NetworkFirst
        );
    }

    #[test]
    fn test_api_beats_recipes_when_both_match() {
        let c = classifier();
        assert_eq!(
            c.classify(&request("https://app.test/api/recipes")),
            StrategyTag::NetworkFirst
        );
    }

    #[test]
    fn test_recipe_paths_revalidate() {
        let c = classifier();
        assert_eq!(
            c.classify(&request("https://app.test/recipes")),
            StrategyTag::StaleWhileRevalidate
        );
        assert_eq!(
            c.classify(&request("https://app.test/recipes/42")),
            StrategyTag::StaleWhileRevalidate
        );
    }

    #[test]
    fn test_everything_else_defaults_to_network_first() {
        let c = classifier();
        assert_eq!(
            c.classify(&request("https://app.test/about")),
            StrategyTag::NetworkFirst
        );
        // "/api" without the trailing slash is not an API segment.
        assert_eq!(
            c.classify(&request("https://app.test/api")),
            StrategyTag::NetworkFirst
        );
    }

    #[test]
    fn test_query_strings_do_not_affect_classification() {
        let c = classifier();
        assert_eq!(
            c.classify(&request("https://app.test/recipes?sort=newest")),
            StrategyTag::StaleWhileRevalidate
        );
        // The query cannot smuggle a needle into the path.
        assert_eq!(
            c.classify(&request("https://app.test/about?next=/recipes")),
            StrategyTag::NetworkFirst
        );
    }
}
