//! Query-string rewriting that forces a source's chronological ordering,
//! and the validation step that binds a submitted search to its source.
use crate::model::{check_len, BoundSearch, NewSearch, ValidationError, URL_MAX_LEN};
use crate::registry::{OrderTemplate, SourceRegistry};
use thiserror::Error;
use tracing::debug;
use url::{form_urlencoded, Url};

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("This website is not supported.")]
    UnsupportedSite,
    #[error("Enter a valid URL: {url:?}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("Enter a valid URL with a host: {0:?}")]
    MissingHost(String),
    #[error("normalized URL {url:?} no longer matches source {source_name:?}")]
    SourceMismatch { source_name: String, url: String },
    #[error(transparent)]
    Field(#[from] ValidationError),
}

fn parse_absolute(raw: &str) -> Result<Url, SearchError> {
    let url = Url::parse(raw).map_err(|source| SearchError::InvalidUrl {
        url: raw.to_string(),
        source,
    })?;
    if url.host_str().is_none() {
        return Err(SearchError::MissingHost(raw.to_string()));
    }
    Ok(url)
}

/// Rewrite `url` so its query string carries the template's `key=value`.
///
/// Duplicate keys collapse to their last value and blank-valued pairs are
/// dropped. Scheme, host, path and fragment are kept exactly as written.
pub fn normalize(url: &str, template: &OrderTemplate) -> Result<String, SearchError> {
    parse_absolute(url)?;
    Ok(apply_template(url, template))
}

// Only the query is re-encoded; the surrounding text is spliced back verbatim
// so the result still matches whatever pattern matched the input.
fn apply_template(raw: &str, template: &OrderTemplate) -> String {
    let (before_fragment, fragment) = match raw.split_once('#') {
        Some((head, frag)) => (head, Some(frag)),
        None => (raw, None),
    };
    let (base, query) = before_fragment
        .split_once('?')
        .unwrap_or((before_fragment, ""));

    let mut params: Vec<(String, String)> = Vec::new();
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        if value.is_empty() {
            continue;
        }
        upsert_param(&mut params, &key, &value);
    }
    upsert_param(&mut params, &template.key, &template.value);

    let query = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.iter())
        .finish();
    match fragment {
        Some(frag) => format!("{base}?{query}#{frag}"),
        None => format!("{base}?{query}"),
    }
}

// First occurrence keeps its position; later ones overwrite the value.
fn upsert_param(params: &mut Vec<(String, String)>, key: &str, value: &str) {
    match params.iter_mut().find(|(k, _)| k == key) {
        Some(slot) => slot.1 = value.to_string(),
        None => params.push((key.to_string(), value.to_string())),
    }
}

/// Resolve the source for a submitted search and return the bound record.
///
/// The input is never modified; on failure the caller still holds the
/// search exactly as submitted. Binding an already bound URL yields the same
/// URL again.
pub fn bind_search(registry: &SourceRegistry, search: &NewSearch) -> Result<BoundSearch, SearchError> {
    parse_absolute(&search.url)?;
    let source = registry
        .find_source_for_url(&search.url)
        .ok_or(SearchError::UnsupportedSite)?;

    let url = apply_template(&search.url, source.template());
    // A pattern reaching into the query can stop matching after the rewrite.
    if !source.matches(&url) {
        return Err(SearchError::SourceMismatch {
            source_name: source.name().to_string(),
            url,
        });
    }
    check_len("url", &url, URL_MAX_LEN)?;
    debug!(source = source.name(), %url, "search bound");

    Ok(BoundSearch {
        project_id: search.project_id,
        source_id: source.id(),
        source_name: source.name().to_string(),
        url,
    })
}
