//! In-memory registry of supported listing sources.
//!
//! Patterns and ordering templates are checked once when the registry is
//! built; lookups never touch the database. Reload with [`SourceRegistry::load`]
//! after sources change.
use crate::db;
use crate::model::ListingSource;
use anyhow::{Context, Result};
use regex::Regex;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{debug, info, instrument};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("source {name:?}: invalid host_regex {pattern:?}: {source}")]
    InvalidPattern {
        name: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("source {name:?}: order_query_string {template:?} must look like `key=value`")]
    InvalidTemplate { name: String, template: String },
}

/// The single `key=value` pair a source needs to sort results by date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderTemplate {
    pub key: String,
    pub value: String,
}

impl OrderTemplate {
    /// Split on the first `=`. Rejects an empty key and anything carrying a
    /// second parameter.
    pub fn parse(raw: &str) -> Option<Self> {
        let (key, value) = raw.split_once('=')?;
        if key.is_empty() || raw.contains('&') {
            return None;
        }
        Some(Self {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

/// A source together with its compiled pattern and parsed template.
#[derive(Debug, Clone)]
pub struct RegisteredSource {
    source: ListingSource,
    pattern: Regex,
    template: OrderTemplate,
}

impl RegisteredSource {
    pub fn compile(source: ListingSource) -> Result<Self, RegistryError> {
        // Match must begin at offset 0 but may stop anywhere.
        let pattern = Regex::new(&format!(r"\A(?:{})", source.host_regex)).map_err(|e| {
            RegistryError::InvalidPattern {
                name: source.name.clone(),
                pattern: source.host_regex.clone(),
                source: e,
            }
        })?;
        let template = OrderTemplate::parse(&source.order_query_string).ok_or_else(|| {
            RegistryError::InvalidTemplate {
                name: source.name.clone(),
                template: source.order_query_string.clone(),
            }
        })?;
        Ok(Self {
            source,
            pattern,
            template,
        })
    }

    pub fn matches(&self, url: &str) -> bool {
        self.pattern.is_match(url)
    }

    pub fn source(&self) -> &ListingSource {
        &self.source
    }

    pub fn id(&self) -> i64 {
        self.source.id
    }

    pub fn name(&self) -> &str {
        &self.source.name
    }

    pub fn template(&self) -> &OrderTemplate {
        &self.template
    }
}

#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    sources: Vec<RegisteredSource>,
}

impl SourceRegistry {
    /// Build a registry keeping the given iteration order.
    pub fn from_sources<I>(sources: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = ListingSource>,
    {
        let sources = sources
            .into_iter()
            .map(RegisteredSource::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { sources })
    }

    /// Load every source from the database, in primary-key order.
    #[instrument(skip_all)]
    pub async fn load(pool: &SqlitePool) -> Result<Self> {
        let sources = db::list_sources(pool).await?;
        let registry =
            Self::from_sources(sources).context("listing source table holds an invalid entry")?;
        info!(count = registry.len(), "loaded listing sources");
        Ok(registry)
    }

    /// First registered source whose pattern matches `url`. Overlapping
    /// patterns are not reported here; see [`Self::matching_sources`].
    pub fn find_source_for_url(&self, url: &str) -> Option<&RegisteredSource> {
        let found = self.sources.iter().find(|s| s.matches(url));
        debug!(url, source = ?found.map(|s| s.name()), "source lookup");
        found
    }

    /// Every source matching `url`, in registry order.
    pub fn matching_sources<'a>(
        &'a self,
        url: &'a str,
    ) -> impl Iterator<Item = &'a RegisteredSource> + 'a {
        self.sources.iter().filter(move |s| s.matches(url))
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredSource> {
        self.sources.iter()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(id: i64, name: &str, host_regex: &str, order: &str) -> ListingSource {
        ListingSource {
            id,
            name: name.into(),
            host_regex: host_regex.into(),
            order_query_string: order.into(),
        }
    }

    #[test]
    fn template_splits_on_first_equals() {
        let t = OrderTemplate::parse("sort=date=desc").unwrap();
        assert_eq!(t.key, "sort");
        assert_eq!(t.value, "date=desc");

        let t = OrderTemplate::parse("tri=").unwrap();
        assert_eq!(t.value, "");
    }

    #[test]
    fn template_rejects_malformed() {
        assert!(OrderTemplate::parse("sortdate").is_none());
        assert!(OrderTemplate::parse("=date").is_none());
        assert!(OrderTemplate::parse("sort=date&page=1").is_none());
    }

    #[test]
    fn match_is_anchored_at_start_only() {
        let reg = SourceRegistry::from_sources(vec![source(
            1,
            "ExampleSite",
            r"https://www\.example\.com/",
            "sort=date_desc",
        )])
        .unwrap();

        assert!(reg
            .find_source_for_url("https://www.example.com/search?city=paris")
            .is_some());
        // pattern appears later in the string
        assert!(reg
            .find_source_for_url("https://evil.test/?r=https://www.example.com/")
            .is_none());
    }

    #[test]
    fn alternation_is_anchored_as_a_whole() {
        let reg = SourceRegistry::from_sources(vec![source(
            1,
            "Either",
            r"https://a\.test/|https://b\.test/",
            "o=1",
        )])
        .unwrap();
        assert!(reg.find_source_for_url("https://b.test/x").is_some());
        assert!(reg.find_source_for_url("see https://b.test/x").is_none());
    }

    #[test]
    fn first_match_wins() {
        let reg = SourceRegistry::from_sources(vec![
            source(1, "Broad", r"https://[a-z.]*example\.com", "sort=a"),
            source(2, "Narrow", r"https://www\.example\.com/", "sort=b"),
        ])
        .unwrap();

        let url = "https://www.example.com/search";
        let found = reg.find_source_for_url(url).unwrap();
        assert_eq!(found.name(), "Broad");

        let all: Vec<_> = reg.matching_sources(url).map(|s| s.id()).collect();
        assert_eq!(all, vec![1, 2]);
    }

    #[test]
    fn iteration_keeps_given_order_and_raw_entries() {
        let reg = SourceRegistry::from_sources(vec![
            source(5, "Later", r"https://b\.test/", "o=2"),
            source(2, "Earlier", r"https://a\.test/", "o=1"),
        ])
        .unwrap();
        let raw: Vec<_> = reg.iter().map(|s| s.source().clone()).collect();
        assert_eq!(raw[0].id, 5);
        assert_eq!(raw[0].host_regex, r"https://b\.test/");
        assert_eq!(raw[1].name, "Earlier");
        assert_eq!(raw[1].order_query_string, "o=1");
    }

    #[test]
    fn no_match_returns_none() {
        let reg = SourceRegistry::from_sources(vec![source(
            1,
            "ExampleSite",
            r"^https://www\.example\.com/",
            "sort=date_desc",
        )])
        .unwrap();
        assert!(reg
            .find_source_for_url("https://unknown-site.test/listing/123")
            .is_none());
        assert!(SourceRegistry::default().find_source_for_url("https://x.test/").is_none());
    }

    #[test]
    fn bad_entries_fail_at_load() {
        let err = SourceRegistry::from_sources(vec![source(1, "Broken", r"https://(", "s=d")])
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidPattern { .. }));

        let err = SourceRegistry::from_sources(vec![source(1, "NoSep", r"https://x", "sortdate")])
            .unwrap_err();
        match err {
            RegistryError::InvalidTemplate { name, .. } => assert_eq!(name, "NoSep"),
            other => panic!("wrong error: {other}"),
        }
    }
}
