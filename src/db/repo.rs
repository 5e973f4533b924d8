use super::model::{ResultFilter, SearchSummary};
use crate::model::{
    Acceptance, BoundSearch, Feature, ListingResult, ListingSource, NewFeature, NewListingResult,
    NewSource, Project, ResultFeature, Search, User, check_len, FEATURE_VALUE_MAX_LEN,
    PROJECT_NAME_MAX_LEN,
};
use crate::registry::RegisteredSource;
use anyhow::{anyhow, Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::collections::HashSet;
use std::str::FromStr;
use tracing::{info, instrument};

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {normalized}"))?
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
    Ok(pool)
}

/// Expand a leading `~/` in a file-backed SQLite URL and make sure the parent
/// directory exists. In-memory and non-sqlite URLs pass through.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }

    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) => format!("sqlite://{path}?{q}"),
        None => format!("sqlite://{path}"),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_or_create_user(
    pool: &Pool,
    username: &str,
    full_name: Option<&str>,
) -> Result<i64> {
    if let Some(id) = sqlx::query_scalar::<_, i64>("SELECT id FROM users WHERE username = ?")
        .bind(username)
        .fetch_optional(pool)
        .await?
    {
        return Ok(id);
    }

    let rec = sqlx::query("INSERT INTO users (username, full_name) VALUES (?, ?) RETURNING id")
        .bind(username)
        .bind(full_name)
        .fetch_one(pool)
        .await?;
    Ok(rec.get::<i64, _>("id"))
}

pub async fn find_user(pool: &Pool, username: &str) -> Result<Option<User>> {
    let row = sqlx::query("SELECT id, username, full_name, created_at FROM users WHERE username = ?")
        .bind(username)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(user_from_row).transpose()
}

fn user_from_row(row: &SqliteRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        full_name: row.try_get("full_name")?,
        created_at: row.try_get("created_at")?,
    })
}

// Rows that would not compile into the registry never reach the table.
fn check_source(source: &NewSource) -> Result<()> {
    source.validate()?;
    RegisteredSource::compile(ListingSource {
        id: 0,
        name: source.name.clone(),
        host_regex: source.host_regex.clone(),
        order_query_string: source.order_query_string.clone(),
    })?;
    Ok(())
}

/// Insert a listing source after checking its fields, pattern and template.
#[instrument(skip_all, fields(name = %source.name))]
pub async fn insert_source(pool: &Pool, source: &NewSource) -> Result<i64> {
    check_source(source)?;

    let id: i64 = sqlx::query(
        "INSERT INTO listing_sources (name, host_regex, order_query_string) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(&source.name)
    .bind(&source.host_regex)
    .bind(&source.order_query_string)
    .fetch_one(pool)
    .await?
    .get("id");
    info!(id, "listing source added");
    Ok(id)
}

/// All sources in primary-key order, which is the registry's match order.
pub async fn list_sources(pool: &Pool) -> Result<Vec<ListingSource>> {
    let rows = sqlx::query(
        "SELECT id, name, host_regex, order_query_string FROM listing_sources ORDER BY id ASC",
    )
    .fetch_all(pool)
    .await?;
    rows.iter().map(source_from_row).collect()
}

fn source_from_row(row: &SqliteRow) -> Result<ListingSource> {
    Ok(ListingSource {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        host_regex: row.try_get("host_regex")?,
        order_query_string: row.try_get("order_query_string")?,
    })
}

/// Insert configured sources whose name is not in the table yet. Returns the
/// number of rows added.
#[instrument(skip_all)]
pub async fn seed_sources(pool: &Pool, sources: &[NewSource]) -> Result<usize> {
    for source in sources {
        check_source(source)?;
    }
    let mut tx = pool.begin().await?;
    let mut added = 0;
    for source in sources {
        let exists = sqlx::query_scalar::<_, i64>("SELECT id FROM listing_sources WHERE name = ?")
            .bind(&source.name)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
        if exists {
            continue;
        }
        sqlx::query(
            "INSERT INTO listing_sources (name, host_regex, order_query_string) VALUES (?, ?, ?)",
        )
        .bind(&source.name)
        .bind(&source.host_regex)
        .bind(&source.order_query_string)
        .execute(&mut *tx)
        .await?;
        added += 1;
    }
    tx.commit().await?;
    if added > 0 {
        info!(added, "seeded listing sources from config");
    }
    Ok(added)
}

#[instrument(skip_all)]
pub async fn create_project(pool: &Pool, user_id: i64, name: &str) -> Result<i64> {
    check_len("name", name, PROJECT_NAME_MAX_LEN)?;
    if name.trim().is_empty() {
        return Err(anyhow!("project name must be non-empty"));
    }
    let id: i64 = sqlx::query("INSERT INTO projects (name, user_id) VALUES (?, ?) RETURNING id")
        .bind(name)
        .bind(user_id)
        .fetch_one(pool)
        .await
        .context("failed to create project")?
        .get("id");
    Ok(id)
}

pub async fn list_projects(pool: &Pool, user_id: Option<i64>) -> Result<Vec<Project>> {
    let rows = sqlx::query(
        "SELECT p.id, p.user_id, p.name, u.username AS owner \
         FROM projects p JOIN users u ON u.id = p.user_id \
         WHERE (? IS NULL OR p.user_id = ?) ORDER BY p.id",
    )
    .bind(user_id)
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(project_from_row).collect()
}

fn project_from_row(row: &SqliteRow) -> Result<Project> {
    Ok(Project {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        owner: row.try_get("owner")?,
    })
}

#[instrument(skip_all)]
pub async fn insert_search(pool: &Pool, search: &BoundSearch) -> Result<i64> {
    let id: i64 = sqlx::query(
        "INSERT INTO searches (url, project_id, source_id) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(&search.url)
    .bind(search.project_id)
    .bind(search.source_id)
    .fetch_one(pool)
    .await
    .context("failed to insert search")?
    .get("id");
    Ok(id)
}

fn search_from_row(row: &SqliteRow) -> Result<Search> {
    Ok(Search {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        source_id: row.try_get("source_id")?,
        source_name: row.try_get("source_name")?,
        url: row.try_get("url")?,
    })
}

const SEARCH_COLUMNS: &str =
    "s.id, s.project_id, s.source_id, src.name AS source_name, s.url \
     FROM searches s JOIN listing_sources src ON src.id = s.source_id";

pub async fn get_search(pool: &Pool, search_id: i64) -> Result<Option<Search>> {
    let row = sqlx::query(&format!("SELECT {SEARCH_COLUMNS} WHERE s.id = ?"))
        .bind(search_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(search_from_row).transpose()
}

pub async fn list_searches(pool: &Pool, project_id: Option<i64>) -> Result<Vec<Search>> {
    let rows = sqlx::query(&format!(
        "SELECT {SEARCH_COLUMNS} WHERE (? IS NULL OR s.project_id = ?) ORDER BY s.id"
    ))
    .bind(project_id)
    .bind(project_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(search_from_row).collect()
}

pub async fn search_summaries(pool: &Pool, project_id: Option<i64>) -> Result<Vec<SearchSummary>> {
    let rows = sqlx::query(
        "SELECT s.id, s.project_id, s.source_id, src.name AS source_name, s.url, \
                COUNT(r.id) AS results, \
                COALESCE(SUM(r.alive), 0) AS alive, \
                COALESCE(SUM(CASE WHEN r.id IS NOT NULL AND r.accepted IS NULL THEN 1 ELSE 0 END), 0) AS undecided \
         FROM searches s \
         JOIN listing_sources src ON src.id = s.source_id \
         LEFT JOIN listing_results r ON r.search_id = s.id \
         WHERE (? IS NULL OR s.project_id = ?) \
         GROUP BY s.id ORDER BY s.id",
    )
    .bind(project_id)
    .bind(project_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(summary_from_row).collect()
}

fn summary_from_row(row: &SqliteRow) -> Result<SearchSummary> {
    Ok(SearchSummary {
        search: search_from_row(row)?,
        results: row.try_get("results")?,
        alive: row.try_get("alive")?,
        undecided: row.try_get("undecided")?,
    })
}

/// Replace the source binding and URL of an existing search.
#[instrument(skip_all)]
pub async fn update_search_binding(pool: &Pool, search_id: i64, search: &BoundSearch) -> Result<()> {
    let done = sqlx::query("UPDATE searches SET url = ?, source_id = ? WHERE id = ?")
        .bind(&search.url)
        .bind(search.source_id)
        .bind(search_id)
        .execute(pool)
        .await?;
    if done.rows_affected() == 0 {
        return Err(anyhow!("search {} not found", search_id));
    }
    Ok(())
}

#[instrument(skip_all, fields(key = %feature.key))]
pub async fn get_or_create_feature(pool: &Pool, feature: &NewFeature) -> Result<i64> {
    feature.validate()?;
    if let Some(id) = sqlx::query_scalar::<_, i64>("SELECT id FROM features WHERE key = ?")
        .bind(&feature.key)
        .fetch_optional(pool)
        .await?
    {
        return Ok(id);
    }
    let id: i64 = sqlx::query("INSERT INTO features (label, key) VALUES (?, ?) RETURNING id")
        .bind(&feature.label)
        .bind(&feature.key)
        .fetch_one(pool)
        .await?
        .get("id");
    Ok(id)
}

pub async fn list_features(pool: &Pool) -> Result<Vec<Feature>> {
    let rows = sqlx::query("SELECT id, label, key FROM features ORDER BY key")
        .fetch_all(pool)
        .await?;
    rows.iter()
        .map(|row| -> Result<Feature> {
            Ok(Feature {
                id: row.try_get("id")?,
                label: row.try_get("label")?,
                key: row.try_get("key")?,
            })
        })
        .collect()
}

/// Assign `value` to a feature on a result; an existing assignment for the
/// same pair is overwritten.
#[instrument(skip_all)]
pub async fn set_result_feature(
    pool: &Pool,
    result_id: i64,
    feature_id: i64,
    value: &str,
) -> Result<i64> {
    check_len("value", value, FEATURE_VALUE_MAX_LEN)?;
    let id: i64 = sqlx::query(
        "INSERT INTO result_features (result_id, feature_id, value) VALUES (?, ?, ?) \
         ON CONFLICT(result_id, feature_id) DO UPDATE SET value = excluded.value \
         RETURNING id",
    )
    .bind(result_id)
    .bind(feature_id)
    .bind(value)
    .fetch_one(pool)
    .await?
    .get("id");
    Ok(id)
}

pub async fn list_result_features(pool: &Pool, result_id: i64) -> Result<Vec<ResultFeature>> {
    let rows = sqlx::query(
        "SELECT rf.id, rf.result_id, r.title AS result_title, rf.feature_id, \
                f.label AS feature_label, rf.value \
         FROM result_features rf \
         JOIN listing_results r ON r.id = rf.result_id \
         JOIN features f ON f.id = rf.feature_id \
         WHERE rf.result_id = ? ORDER BY f.key",
    )
    .bind(result_id)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| -> Result<ResultFeature> {
            Ok(ResultFeature {
                id: row.try_get("id")?,
                result_id: row.try_get("result_id")?,
                result_title: row.try_get("result_title")?,
                feature_id: row.try_get("feature_id")?,
                feature_label: row.try_get("feature_label")?,
                value: row.try_get("value")?,
            })
        })
        .collect()
}

/// Insert or refresh the snapshot for `(search_id, original_id)`.
///
/// A listing seen again is marked alive; the user's triage decision is kept.
#[instrument(skip_all, fields(search_id = search_id, original_id = %result.original_id))]
pub async fn upsert_result(pool: &Pool, search_id: i64, result: &NewListingResult) -> Result<i64> {
    result.validate()?;
    let mut tx = pool.begin().await?;
    let id = upsert_result_tx(&mut tx, search_id, result).await?;
    tx.commit().await?;
    Ok(id)
}

/// Same as [`upsert_result`] inside a caller-owned transaction. The caller
/// validates `result` first.
pub async fn upsert_result_tx(
    tx: &mut Transaction<'_, Sqlite>,
    search_id: i64,
    result: &NewListingResult,
) -> Result<i64> {
    let images = result
        .images
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    let id: i64 = sqlx::query(
        "INSERT INTO listing_results (search_id, url, original_id, title, description, price, \
             charges_included, publication_date, real_estate_type, rooms, furnished, surface, \
             images, zipcode, city, ges, energy_rate) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(search_id, original_id) DO UPDATE SET \
             url = excluded.url, title = excluded.title, description = excluded.description, \
             price = excluded.price, charges_included = excluded.charges_included, \
             publication_date = excluded.publication_date, \
             real_estate_type = excluded.real_estate_type, rooms = excluded.rooms, \
             furnished = excluded.furnished, surface = excluded.surface, \
             images = excluded.images, zipcode = excluded.zipcode, city = excluded.city, \
             ges = excluded.ges, energy_rate = excluded.energy_rate, alive = 1 \
         RETURNING id",
    )
    .bind(search_id)
    .bind(&result.url)
    .bind(&result.original_id)
    .bind(&result.title)
    .bind(&result.description)
    .bind(result.price)
    .bind(result.charges_included)
    .bind(result.publication_date)
    .bind(&result.real_estate_type)
    .bind(result.rooms)
    .bind(result.furnished)
    .bind(result.surface)
    .bind(images)
    .bind(&result.zipcode)
    .bind(&result.city)
    .bind(&result.ges)
    .bind(&result.energy_rate)
    .fetch_one(&mut **tx)
    .await
    .context("failed to upsert listing result")?
    .get("id");
    Ok(id)
}

const RESULT_COLUMNS: &str =
    "id, search_id, url, original_id, title, description, price, charges_included, \
     publication_date, real_estate_type, rooms, furnished, surface, images, zipcode, city, \
     ges, energy_rate, alive, accepted";

fn result_from_row(row: &SqliteRow) -> Result<ListingResult> {
    let images: Option<String> = row.try_get("images")?;
    let images = images
        .as_deref()
        .map(serde_json::from_str::<Vec<String>>)
        .transpose()
        .context("listing result has a malformed images column")?;

    Ok(ListingResult {
        id: row.try_get("id")?,
        search_id: row.try_get("search_id")?,
        url: row.try_get("url")?,
        original_id: row.try_get("original_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        price: row.try_get("price")?,
        charges_included: row.try_get("charges_included")?,
        publication_date: row.try_get("publication_date")?,
        real_estate_type: row.try_get("real_estate_type")?,
        rooms: row.try_get("rooms")?,
        furnished: row.try_get("furnished")?,
        surface: row.try_get("surface")?,
        images,
        zipcode: row.try_get("zipcode")?,
        city: row.try_get("city")?,
        ges: row.try_get("ges")?,
        energy_rate: row.try_get("energy_rate")?,
        alive: row.try_get("alive")?,
        accepted: Acceptance::from_db(row.try_get("accepted")?),
    })
}

pub async fn get_result(pool: &Pool, result_id: i64) -> Result<Option<ListingResult>> {
    let row = sqlx::query(&format!(
        "SELECT {RESULT_COLUMNS} FROM listing_results WHERE id = ?"
    ))
    .bind(result_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(result_from_row).transpose()
}

/// Results of a search, newest publication first.
pub async fn list_results(
    pool: &Pool,
    search_id: i64,
    filter: ResultFilter,
) -> Result<Vec<ListingResult>> {
    let rows = sqlx::query(&format!(
        "SELECT {RESULT_COLUMNS} FROM listing_results \
         WHERE search_id = ? AND (? = 0 OR alive = 1) AND (? = 0 OR accepted IS ?) \
         ORDER BY publication_date DESC, id DESC"
    ))
    .bind(search_id)
    .bind(filter.alive_only)
    .bind(filter.acceptance.is_some())
    .bind(filter.acceptance.and_then(Acceptance::to_db))
    .fetch_all(pool)
    .await?;
    rows.iter().map(result_from_row).collect()
}

/// Mark every alive result of `search_id` whose original id is not in `seen`
/// as no longer listed. Returns how many rows changed.
#[instrument(skip_all, fields(search_id = search_id))]
pub async fn mark_missing_dead(pool: &Pool, search_id: i64, seen: &[String]) -> Result<u64> {
    let mut tx = pool.begin().await?;
    let changed = mark_missing_dead_tx(&mut tx, search_id, seen).await?;
    tx.commit().await?;
    Ok(changed)
}

pub async fn mark_missing_dead_tx(
    tx: &mut Transaction<'_, Sqlite>,
    search_id: i64,
    seen: &[String],
) -> Result<u64> {
    let seen: HashSet<&str> = seen.iter().map(String::as_str).collect();
    let alive: Vec<(i64, String)> = sqlx::query_as(
        "SELECT id, original_id FROM listing_results WHERE search_id = ? AND alive = 1",
    )
    .bind(search_id)
    .fetch_all(&mut **tx)
    .await?;

    let mut changed = 0;
    for (id, original_id) in alive {
        if seen.contains(original_id.as_str()) {
            continue;
        }
        sqlx::query("UPDATE listing_results SET alive = 0 WHERE id = ?")
            .bind(id)
            .execute(&mut **tx)
            .await?;
        changed += 1;
    }
    if changed > 0 {
        info!(search_id, changed, "listings no longer published");
    }
    Ok(changed)
}

#[instrument(skip_all)]
pub async fn set_acceptance(pool: &Pool, result_id: i64, acceptance: Acceptance) -> Result<()> {
    let done = sqlx::query("UPDATE listing_results SET accepted = ? WHERE id = ?")
        .bind(acceptance.to_db())
        .bind(result_id)
        .execute(pool)
        .await?;
    if done.rows_affected() == 0 {
        return Err(anyhow!("result {} not found", result_id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_url_passthrough() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            prepare_sqlite_url("postgres://localhost/db"),
            "postgres://localhost/db"
        );
    }

    #[test]
    fn sqlite_url_creates_parent_dir() {
        let td = tempfile::tempdir().unwrap();
        let db_path = td.path().join("nested").join("immo.db");
        let url = format!("sqlite:{}?mode=rwc", db_path.display());
        let out = prepare_sqlite_url(&url);
        assert_eq!(out, format!("sqlite://{}?mode=rwc", db_path.display()));
        assert!(td.path().join("nested").is_dir());
    }
}
