//! Search lifecycle on top of the repository: a submitted URL is only written
//! once it has been bound to a source and normalized.
use crate::db::{self, Pool};
use crate::model::{NewListingResult, NewSearch, Search};
use crate::normalizer::bind_search;
use crate::registry::SourceRegistry;
use anyhow::{anyhow, Context, Result};
use tracing::{debug, info, instrument, warn};

#[instrument(skip_all, fields(project_id = project_id))]
pub async fn create_search(
    pool: &Pool,
    registry: &SourceRegistry,
    project_id: i64,
    url: &str,
) -> Result<Search> {
    let submitted = NewSearch {
        project_id,
        url: url.to_string(),
    };
    let bound = match bind_search(registry, &submitted) {
        Ok(bound) => bound,
        Err(err) => {
            warn!(%err, url, "search rejected");
            return Err(err.into());
        }
    };

    let id = db::insert_search(pool, &bound).await?;
    info!(id, source = %bound.source_name, url = %bound.url, "search created");
    Ok(Search {
        id,
        project_id,
        source_id: bound.source_id,
        source_name: bound.source_name,
        url: bound.url,
    })
}

/// Re-run binding for a stored search, e.g. after the registry changed.
#[instrument(skip_all, fields(search_id = search_id))]
pub async fn rebind_search(pool: &Pool, registry: &SourceRegistry, search_id: i64) -> Result<Search> {
    let current = db::get_search(pool, search_id)
        .await?
        .ok_or_else(|| anyhow!("search {} not found", search_id))?;

    let bound = bind_search(
        registry,
        &NewSearch {
            project_id: current.project_id,
            url: current.url.clone(),
        },
    )?;
    if bound.url == current.url && bound.source_id == current.source_id {
        debug!("binding unchanged");
        return Ok(current);
    }

    db::update_search_binding(pool, search_id, &bound).await?;
    info!(source = %bound.source_name, url = %bound.url, "search rebound");
    Ok(Search {
        id: current.id,
        project_id: current.project_id,
        source_id: bound.source_id,
        source_name: bound.source_name,
        url: bound.url,
    })
}

#[derive(Debug, Default)]
pub struct RebindReport {
    pub checked: usize,
    pub failed: Vec<(i64, String)>,
}

/// Rebind every stored search. Failures are collected, not fatal.
#[instrument(skip_all)]
pub async fn rebind_all(pool: &Pool, registry: &SourceRegistry) -> Result<RebindReport> {
    let mut report = RebindReport::default();
    for search in db::list_searches(pool, None).await? {
        report.checked += 1;
        if let Err(err) = rebind_search(pool, registry, search.id).await {
            warn!(search_id = search.id, %err, "rebind failed");
            report.failed.push((search.id, err.to_string()));
        }
    }
    Ok(report)
}

/// Store one ingestion pass for a search: every listing is upserted and the
/// ones that disappeared from the source are marked dead. Either the whole
/// pass is written or nothing is.
#[instrument(skip_all, fields(search_id = search_id, count = listings.len()))]
pub async fn record_snapshot(
    pool: &Pool,
    search_id: i64,
    listings: &[NewListingResult],
) -> Result<Vec<i64>> {
    for listing in listings {
        listing
            .validate()
            .with_context(|| format!("invalid listing {:?}", listing.original_id))?;
    }

    let mut tx = pool.begin().await?;
    let mut ids = Vec::with_capacity(listings.len());
    for listing in listings {
        ids.push(db::upsert_result_tx(&mut tx, search_id, listing).await?);
    }
    let seen: Vec<String> = listings.iter().map(|l| l.original_id.clone()).collect();
    let gone = db::mark_missing_dead_tx(&mut tx, search_id, &seen).await?;
    tx.commit().await?;

    info!(stored = ids.len(), gone, "snapshot recorded");
    Ok(ids)
}
