use chrono::{TimeZone, Utc};
use immo_watch::db::{self, ResultFilter};
use immo_watch::model::{Acceptance, NewListingResult, NewSource};
use immo_watch::normalizer::SearchError;
use immo_watch::registry::SourceRegistry;
use immo_watch::search;
use sqlx::sqlite::SqlitePoolOptions;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn example_site() -> NewSource {
    NewSource {
        name: "ExampleSite".into(),
        host_regex: r"^https://www\.example\.com/".into(),
        order_query_string: "sort=date_desc".into(),
    }
}

async fn project(pool: &sqlx::SqlitePool) -> i64 {
    let uid = db::get_or_create_user(pool, "alice", Some("Alice")).await.unwrap();
    db::create_project(pool, uid, "Paris rentals").await.unwrap()
}

fn listing(original_id: &str, title: &str, day: u32) -> NewListingResult {
    NewListingResult {
        url: format!("https://www.example.com/annonce/{original_id}"),
        original_id: original_id.into(),
        title: title.into(),
        description: String::new(),
        price: 1000.0,
        charges_included: true,
        publication_date: Utc.with_ymd_and_hms(2024, 3, day, 9, 0, 0).unwrap(),
        real_estate_type: None,
        rooms: 2,
        furnished: Some(false),
        surface: 40.0,
        images: None,
        zipcode: "75011".into(),
        city: "Paris".into(),
        ges: None,
        energy_rate: None,
    }
}

#[tokio::test]
async fn create_search_binds_source_and_forces_ordering() {
    let pool = setup_pool().await;
    let source_id = db::insert_source(&pool, &example_site()).await.unwrap();
    let project_id = project(&pool).await;
    let registry = SourceRegistry::load(&pool).await.unwrap();

    let created = search::create_search(
        &pool,
        &registry,
        project_id,
        "https://www.example.com/search?city=paris&sort=relevance",
    )
    .await
    .unwrap();

    assert_eq!(created.source_id, source_id);
    assert_eq!(created.url, "https://www.example.com/search?city=paris&sort=date_desc");

    let stored = db::get_search(&pool, created.id).await.unwrap().unwrap();
    assert_eq!(stored, created);
    assert_eq!(
        stored.to_string(),
        "ExampleSite: https://www.example.com/search?city=paris&sort=date_desc"
    );
}

#[tokio::test]
async fn unsupported_site_is_rejected_and_not_stored() {
    let pool = setup_pool().await;
    db::insert_source(&pool, &example_site()).await.unwrap();
    let project_id = project(&pool).await;
    let registry = SourceRegistry::load(&pool).await.unwrap();

    let err = search::create_search(
        &pool,
        &registry,
        project_id,
        "https://unknown-site.test/listing/123",
    )
    .await
    .unwrap_err();

    let err = err.downcast_ref::<SearchError>().expect("search error");
    assert!(matches!(err, SearchError::UnsupportedSite));
    assert_eq!(err.to_string(), "This website is not supported.");
    assert!(db::list_searches(&pool, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn registry_uses_primary_key_order() {
    let pool = setup_pool().await;
    let broad = db::insert_source(
        &pool,
        &NewSource {
            name: "Broad".into(),
            host_regex: r"https://[a-z.]*example\.com".into(),
            order_query_string: "order=new".into(),
        },
    )
    .await
    .unwrap();
    db::insert_source(&pool, &example_site()).await.unwrap();

    let registry = SourceRegistry::load(&pool).await.unwrap();
    assert_eq!(registry.len(), 2);

    let url = "https://www.example.com/search";
    assert_eq!(registry.find_source_for_url(url).unwrap().id(), broad);
    assert_eq!(registry.matching_sources(url).count(), 2);
}

#[tokio::test]
async fn rebind_is_a_fixed_point() {
    let pool = setup_pool().await;
    db::insert_source(&pool, &example_site()).await.unwrap();
    let project_id = project(&pool).await;
    let registry = SourceRegistry::load(&pool).await.unwrap();

    let created = search::create_search(
        &pool,
        &registry,
        project_id,
        "https://www.example.com/search?city=lyon",
    )
    .await
    .unwrap();

    let rebound = search::rebind_search(&pool, &registry, created.id).await.unwrap();
    assert_eq!(rebound, created);

    let report = search::rebind_all(&pool, &registry).await.unwrap();
    assert_eq!(report.checked, 1);
    assert!(report.failed.is_empty());
}

#[tokio::test]
async fn rebind_reports_searches_no_source_matches_anymore() {
    let pool = setup_pool().await;
    db::insert_source(&pool, &example_site()).await.unwrap();
    let project_id = project(&pool).await;
    let registry = SourceRegistry::load(&pool).await.unwrap();
    let created = search::create_search(&pool, &registry, project_id, "https://www.example.com/s")
        .await
        .unwrap();

    let empty = SourceRegistry::default();
    let report = search::rebind_all(&pool, &empty).await.unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, created.id);

    let stored = db::get_search(&pool, created.id).await.unwrap().unwrap();
    assert_eq!(stored.url, created.url);
}

#[tokio::test]
async fn snapshots_upsert_and_track_liveness() {
    let pool = setup_pool().await;
    db::insert_source(&pool, &example_site()).await.unwrap();
    let project_id = project(&pool).await;
    let registry = SourceRegistry::load(&pool).await.unwrap();
    let s = search::create_search(&pool, &registry, project_id, "https://www.example.com/s")
        .await
        .unwrap();

    let first = search::record_snapshot(
        &pool,
        s.id,
        &[listing("a1", "Studio", 1), listing("b2", "T3", 2)],
    )
    .await
    .unwrap();
    db::set_acceptance(&pool, first[0], Acceptance::Accepted).await.unwrap();

    // a1 comes back with a new price, b2 is gone
    let mut again = listing("a1", "Studio rénové", 1);
    again.price = 900.0;
    let second = search::record_snapshot(&pool, s.id, &[again]).await.unwrap();
    assert_eq!(second[0], first[0]);

    let a1 = db::get_result(&pool, first[0]).await.unwrap().unwrap();
    assert_eq!(a1.title, "Studio rénové");
    assert_eq!(a1.price, 900.0);
    assert!(a1.alive);
    assert_eq!(a1.accepted, Acceptance::Accepted);

    let b2 = db::get_result(&pool, first[1]).await.unwrap().unwrap();
    assert!(!b2.alive);

    let all = db::list_results(&pool, s.id, ResultFilter::default()).await.unwrap();
    assert_eq!(all.len(), 2);
    // newest publication first
    assert_eq!(all[0].original_id, "b2");

    // b2 reappears
    search::record_snapshot(&pool, s.id, &[listing("a1", "Studio", 1), listing("b2", "T3", 2)])
        .await
        .unwrap();
    let b2 = db::get_result(&pool, first[1]).await.unwrap().unwrap();
    assert!(b2.alive);
}

#[tokio::test]
async fn failed_snapshot_writes_nothing() {
    let pool = setup_pool().await;
    db::insert_source(&pool, &example_site()).await.unwrap();
    let project_id = project(&pool).await;
    let registry = SourceRegistry::load(&pool).await.unwrap();
    let s = search::create_search(&pool, &registry, project_id, "https://www.example.com/s")
        .await
        .unwrap();

    let mut bad = listing("b", "T2", 2);
    bad.ges = Some("AB".into());
    let res = search::record_snapshot(&pool, s.id, &[listing("a", "Studio", 1), bad]).await;
    assert!(res.is_err());
    assert!(db::list_results(&pool, s.id, ResultFilter::default())
        .await
        .unwrap()
        .is_empty());

    // an earlier pass is left alive when the next one fails
    search::record_snapshot(&pool, s.id, &[listing("a", "Studio", 1)])
        .await
        .unwrap();
    let mut bad = listing("c", "T4", 3);
    bad.zipcode = "x".repeat(50);
    assert!(search::record_snapshot(&pool, s.id, &[bad]).await.is_err());
    let all = db::list_results(&pool, s.id, ResultFilter::default()).await.unwrap();
    assert_eq!(all.len(), 1);
    assert!(all[0].alive);
}

#[tokio::test]
async fn accented_path_survives_create_and_rebind() {
    let pool = setup_pool().await;
    db::insert_source(
        &pool,
        &NewSource {
            name: "Recherche".into(),
            host_regex: r"^https://www\.example\.com/recherche/île".into(),
            order_query_string: "tri=date".into(),
        },
    )
    .await
    .unwrap();
    let project_id = project(&pool).await;
    let registry = SourceRegistry::load(&pool).await.unwrap();

    let created = search::create_search(
        &pool,
        &registry,
        project_id,
        "https://www.example.com/recherche/île-de-france?x=1",
    )
    .await
    .unwrap();
    assert_eq!(
        created.url,
        "https://www.example.com/recherche/île-de-france?x=1&tri=date"
    );

    let rebound = search::rebind_search(&pool, &registry, created.id).await.unwrap();
    assert_eq!(rebound, created);
    assert!(search::rebind_all(&pool, &registry).await.unwrap().failed.is_empty());
}
