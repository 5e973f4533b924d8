//! Domain entities for listing sources, projects, searches and their results.
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const SOURCE_NAME_MAX_LEN: usize = 100;
pub const HOST_REGEX_MAX_LEN: usize = 100;
pub const ORDER_QUERY_MAX_LEN: usize = 50;
pub const PROJECT_NAME_MAX_LEN: usize = 100;
pub const URL_MAX_LEN: usize = 255;
pub const FEATURE_LABEL_MAX_LEN: usize = 100;
pub const FEATURE_VALUE_MAX_LEN: usize = 255;

static SLUG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\A[-a-zA-Z0-9_]+\z").unwrap());

/// Field-level violations raised before anything reaches the database.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} must be non-empty")]
    Empty { field: &'static str },
    #[error("{field} has {actual} characters, at most {max} allowed")]
    TooLong {
        field: &'static str,
        max: usize,
        actual: usize,
    },
    #[error("{0:?} is not a valid slug (letters, digits, '-' and '_' only)")]
    InvalidSlug(String),
    #[error("{field} must be a single character")]
    NotSingleChar { field: &'static str },
}

pub(crate) fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    let actual = value.chars().count();
    if actual > max {
        return Err(ValidationError::TooLong { field, max, actual });
    }
    Ok(())
}

fn check_required(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Empty { field });
    }
    check_len(field, value, max)
}

fn check_single_char(field: &'static str, value: Option<&str>) -> Result<(), ValidationError> {
    match value {
        Some(v) if v.chars().count() != 1 => Err(ValidationError::NotSingleChar { field }),
        _ => Ok(()),
    }
}

/// User triage decision on a listing result.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Acceptance {
    #[default]
    Undecided,
    Accepted,
    Rejected,
}

impl Acceptance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Acceptance::Undecided => "undecided",
            Acceptance::Accepted => "accepted",
            Acceptance::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "undecided" => Some(Acceptance::Undecided),
            "accepted" => Some(Acceptance::Accepted),
            "rejected" => Some(Acceptance::Rejected),
            _ => None,
        }
    }

    /// Nullable boolean column representation.
    pub fn to_db(self) -> Option<bool> {
        match self {
            Acceptance::Undecided => None,
            Acceptance::Accepted => Some(true),
            Acceptance::Rejected => Some(false),
        }
    }

    pub fn from_db(value: Option<bool>) -> Self {
        match value {
            None => Acceptance::Undecided,
            Some(true) => Acceptance::Accepted,
            Some(false) => Acceptance::Rejected,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub full_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A supported listing website as configured by an operator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewSource {
    pub name: String,
    pub host_regex: String,
    pub order_query_string: String,
}

impl NewSource {
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_required("name", &self.name, SOURCE_NAME_MAX_LEN)?;
        check_required("host_regex", &self.host_regex, HOST_REGEX_MAX_LEN)?;
        check_required(
            "order_query_string",
            &self.order_query_string,
            ORDER_QUERY_MAX_LEN,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListingSource {
    pub id: i64,
    pub name: String,
    pub host_regex: String,
    pub order_query_string: String,
}

impl fmt::Display for ListingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Project {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    /// Username of the owner, joined in when listing.
    pub owner: String,
}

impl fmt::Display for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (by {})", self.name, self.owner)
    }
}

/// A search as submitted by a user: the source is not known yet and the URL
/// is exactly what was typed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSearch {
    pub project_id: i64,
    pub url: String,
}

/// A search whose source has been resolved and whose URL carries the
/// source's ordering parameter. Only produced by `normalizer::bind_search`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundSearch {
    pub project_id: i64,
    pub source_id: i64,
    pub source_name: String,
    pub url: String,
}

impl fmt::Display for BoundSearch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.source_name, self.url)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Search {
    pub id: i64,
    pub project_id: i64,
    pub source_id: i64,
    pub source_name: String,
    pub url: String,
}

impl fmt::Display for Search {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.source_name, self.url)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewFeature {
    pub label: String,
    pub key: String,
}

impl NewFeature {
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_required("label", &self.label, FEATURE_LABEL_MAX_LEN)?;
        if !SLUG_RE.is_match(&self.key) {
            return Err(ValidationError::InvalidSlug(self.key.clone()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Feature {
    pub id: i64,
    pub label: String,
    pub key: String,
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

/// One listing snapshot as produced by an ingestion run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewListingResult {
    pub url: String,
    pub original_id: String,
    pub title: String,
    pub description: String,
    pub price: f64,
    pub charges_included: bool,
    pub publication_date: DateTime<Utc>,
    pub real_estate_type: Option<String>,
    pub rooms: i64,
    pub furnished: Option<bool>,
    pub surface: f64,
    pub images: Option<Vec<String>>,
    pub zipcode: String,
    pub city: String,
    pub ges: Option<String>,
    pub energy_rate: Option<String>,
}

impl NewListingResult {
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_required("url", &self.url, URL_MAX_LEN)?;
        check_required("original_id", &self.original_id, 40)?;
        check_required("title", &self.title, 255)?;
        check_len("description", &self.description, 5000)?;
        if let Some(kind) = &self.real_estate_type {
            check_len("real_estate_type", kind, 100)?;
        }
        for image in self.images.iter().flatten() {
            check_len("images", image, URL_MAX_LEN)?;
        }
        check_len("zipcode", &self.zipcode, 10)?;
        check_len("city", &self.city, 80)?;
        check_single_char("ges", self.ges.as_deref())?;
        check_single_char("energy_rate", self.energy_rate.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListingResult {
    pub id: i64,
    pub search_id: i64,
    pub url: String,
    pub original_id: String,
    pub title: String,
    pub description: String,
    pub price: f64,
    pub charges_included: bool,
    pub publication_date: DateTime<Utc>,
    pub real_estate_type: Option<String>,
    pub rooms: i64,
    pub furnished: Option<bool>,
    pub surface: f64,
    pub images: Option<Vec<String>>,
    pub zipcode: String,
    pub city: String,
    pub ges: Option<String>,
    pub energy_rate: Option<String>,
    pub alive: bool,
    pub accepted: Acceptance,
}

impl fmt::Display for ListingResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.title)
    }
}

/// Feature assignment on a result, with both sides' display names joined in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResultFeature {
    pub id: i64,
    pub result_id: i64,
    pub result_title: String,
    pub feature_id: i64,
    pub feature_label: String,
    pub value: String,
}

impl fmt::Display for ResultFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} = {}",
            self.result_title, self.feature_label, self.value
        )
    }
}
