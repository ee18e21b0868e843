//! Mapping module identifiers to resource locations

use crate::config::Configuration;
use crate::resolver;
use std::cell::RefCell;
use std::rc::Rc;

/// Sentinel location that short-circuits to a module with empty exports,
/// used to exclude environment-native modules from a build.
pub const EMPTY_LOCATION: &str = "empty:";

/// Maps a module identifier to the locations its backing resource may live
/// at.
pub trait ModuleLocator {
    /// Ordered candidate locations for loading the module. Never empty: the
    /// identifier itself is the last resort.
    fn candidate_locations(&self, module_id: &str) -> Vec<String>;

    /// A directly usable URL for non-loading references (asset lookups).
    fn url_for(&self, module_id: &str) -> String;
}

/// Locator driven by the configuration store's path rules.
///
/// The longest rule matching a whole id prefix wins; its candidates replace
/// the matched prefix and may fan out to several mirror locations. Absolute
/// ids pass through unchanged; everything else is joined onto the configured
/// base location.
pub struct ConfiguredLocator {
    config: Rc<RefCell<Configuration>>,
}

impl ConfiguredLocator {
    /// Locator reading rules from the shared configuration store.
    pub fn new(config: Rc<RefCell<Configuration>>) -> Self {
        Self { config }
    }

    fn locations(&self, module_id: &str) -> Vec<String> {
        if resolver::is_absolute(module_id) {
            return vec![module_id.to_string()];
        }
        let config = self.config.borrow();
        let mut best: Option<(&String, &Vec<String>)> = None;
        for (rule, candidates) in &config.paths {
            let matches = module_id == rule.as_str()
                || module_id
                    .strip_prefix(rule.as_str())
                    .is_some_and(|rest| rest.starts_with('/'));
            if matches && best.map_or(true, |(current, _)| rule.len() > current.len()) {
                best = Some((rule, candidates));
            }
        }
        match best {
            Some((rule, candidates)) => {
                let rest = &module_id[rule.len()..];
                candidates
                    .iter()
                    .map(|candidate| {
                        let rewritten = format!("{candidate}{rest}");
                        if resolver::is_absolute(&rewritten) || candidate.as_str() == EMPTY_LOCATION
                        {
                            rewritten
                        } else {
                            join(&config.base_location, &rewritten)
                        }
                    })
                    .collect()
            }
            None => vec![join(&config.base_location, module_id)],
        }
    }
}

impl ModuleLocator for ConfiguredLocator {
    fn candidate_locations(&self, module_id: &str) -> Vec<String> {
        self.locations(module_id)
    }

    fn url_for(&self, module_id: &str) -> String {
        self.locations(module_id)
            .into_iter()
            .next()
            .unwrap_or_else(|| module_id.to_string())
    }
}

fn join(base: &str, path: &str) -> String {
    if base.is_empty() {
        path.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigurationOptions;
    use rustc_hash::FxHashMap;

    fn locator_with(paths: &[(&str, &[&str])], base: &str) -> ConfiguredLocator {
        let mut rules: FxHashMap<String, Vec<String>> = FxHashMap::default();
        for (rule, candidates) in paths {
            rules.insert(
                rule.to_string(),
                candidates.iter().map(|c| c.to_string()).collect(),
            );
        }
        let mut config = Configuration::default();
        config.merge(
            ConfigurationOptions {
                base_location: Some(base.to_string()),
                paths: Some(rules),
                ..Default::default()
            },
            false,
        );
        ConfiguredLocator::new(Rc::new(RefCell::new(config)))
    }

    #[test]
    fn test_plain_id_joins_base() {
        let locator = locator_with(&[], "dist");
        assert_eq!(locator.candidate_locations("a/b"), vec!["dist/a/b"]);
        assert_eq!(locator.url_for("a/b"), "dist/a/b");
    }

    #[test]
    fn test_without_base_id_is_last_resort() {
        let locator = locator_with(&[], "");
        assert_eq!(locator.candidate_locations("a/b"), vec!["a/b"]);
    }

    #[test]
    fn test_longest_prefix_rule_wins() {
        let locator = locator_with(&[("a", &["lib/a"]), ("a/b", &["vendor/ab"])], "");
        assert_eq!(locator.candidate_locations("a/b/c"), vec!["vendor/ab/c"]);
        assert_eq!(locator.candidate_locations("a/x"), vec!["lib/a/x"]);
    }

    #[test]
    fn test_rule_fans_out_to_mirrors() {
        let locator = locator_with(&[("x", &["m1/x", "m2/x", "m3/x"])], "cdn");
        assert_eq!(
            locator.candidate_locations("x"),
            vec!["cdn/m1/x", "cdn/m2/x", "cdn/m3/x"]
        );
    }

    #[test]
    fn test_absolute_ids_pass_through() {
        let locator = locator_with(&[("a", &["lib/a"])], "dist");
        assert_eq!(
            locator.candidate_locations("https://cdn/x.js"),
            vec!["https://cdn/x.js"]
        );
    }

    #[test]
    fn test_empty_sentinel_not_joined() {
        let locator = locator_with(&[("shims/native", &[EMPTY_LOCATION])], "dist");
        assert_eq!(
            locator.candidate_locations("shims/native"),
            vec![EMPTY_LOCATION]
        );
    }
}
