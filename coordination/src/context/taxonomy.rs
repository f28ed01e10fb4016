//! Component/action taxonomy used to ground prompts in the product's vocabulary
//!
//! ```toml
//! [[components]]
//! name = "ingress"
//! aliases = ["route", "gateway api"]
//! actions = ["expose service", "terminate tls"]
//! ```

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub actions: Vec<String>,
}

impl Component {
    fn terms(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.aliases.iter().map(String::as_str))
    }
}

/// A component referenced by the ticket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentMatch {
    pub name: String,
    /// Terms (name or aliases) that matched
    pub matched: Vec<String>,
    pub actions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taxonomy {
    #[serde(default)]
    pub components: Vec<Component>,
}

impl Taxonomy {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Components whose name or an alias occurs in `text` or equals a keyword.
    /// Ordered by number of matched terms, then name.
    pub fn match_components(&self, keywords: &[String], text: &str) -> Vec<ComponentMatch> {
        let haystack = text.to_lowercase();
        let mut matches: Vec<ComponentMatch> = self
            .components
            .iter()
            .filter_map(|component| {
                let matched: Vec<String> = component
                    .terms()
                    .map(str::to_lowercase)
                    .filter(|term| {
                        !term.is_empty()
                            && (keywords.iter().any(|k| k == term) || contains_phrase(&haystack, term))
                    })
                    .collect();
                (!matched.is_empty()).then(|| ComponentMatch {
                    name: component.name.clone(),
                    matched,
                    actions: component.actions.clone(),
                })
            })
            .collect();
        matches.sort_by(|a, b| {
            b.matched
                .len()
                .cmp(&a.matched.len())
                .then_with(|| a.name.cmp(&b.name))
        });
        matches
    }
}

/// Whole-word phrase search on lowercased text
fn contains_phrase(haystack: &str, phrase: &str) -> bool {
    let is_word = |c: char| c.is_alphanumeric() || c == '_' || c == '-';
    haystack.match_indices(phrase).any(|(start, _)| {
        let end = start + phrase.len();
        let before_ok = haystack[..start].chars().next_back().map_or(true, |c| !is_word(c));
        let after_ok = haystack[end..].chars().next().map_or(true, |c| !is_word(c));
        before_ok && after_ok
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TAXONOMY: &str = r#"
[[components]]
name = "ingress"
aliases = ["route", "gateway api"]
actions = ["expose service", "terminate tls"]

[[components]]
name = "rbac"
aliases = ["rolebinding"]
actions = ["grant role"]
"#;

    #[test]
    fn test_loads_and_matches_aliases_and_phrases() {
        let taxonomy = Taxonomy::from_toml_str(TAXONOMY).unwrap();
        assert_eq!(taxonomy.components.len(), 2);

        let matches = taxonomy.match_components(
            &["route".to_string()],
            "Expose the app through the Gateway API and a Route",
        );
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].name, "ingress");
        assert_eq!(matches[0].matched, vec!["route", "gateway api"]);
    }

    #[test]
    fn test_phrase_requires_word_boundaries() {
        let taxonomy = Taxonomy::from_toml_str(TAXONOMY).unwrap();
        assert!(taxonomy.match_components(&[], "rerouted traffic").is_empty());
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        assert!(Taxonomy::from_toml_str("[[components]]\nname = 3").is_err());
    }
}
