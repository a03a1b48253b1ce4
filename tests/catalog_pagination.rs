mod common;

use common::FakeCatalog;
use earthaccess::{Catalog, Error, QueryBuilder, QueryKind};
use serde_json::json;

const CMR: &str = "https://cmr.test";

fn ids(records: &[earthaccess::Record]) -> Vec<String> {
    records.iter().map(|r| r.concept_id().to_string()).collect()
}

#[test]
fn building_queries_makes_no_requests() {
    let fake = FakeCatalog::with_granules(5);
    let catalog = Catalog::new(CMR, &fake);

    let _ = QueryBuilder::granules()
        .short_name("ATL06")
        .temporal("2020-01", "2020-02")
        .bounding_box(-10.0, -10.0, 10.0, 10.0)
        .build()
        .unwrap();
    let _ = QueryBuilder::collections().keyword("sea ice").cloud_hosted(true).build().unwrap();
    assert!(QueryBuilder::collections().keyword("x").concept_id(["C1-X"]).build().is_err());
    assert_eq!(fake.calls(), 0);

    let query = QueryBuilder::granules().build().unwrap();
    assert_eq!(catalog.count(&query).unwrap(), 5);
    assert_eq!(fake.calls(), 1);
}

#[test]
fn all_pages_are_yielded_in_catalog_order() {
    let fake = FakeCatalog::with_granules(25);
    let catalog = Catalog::new(CMR, &fake);
    let query = QueryBuilder::granules().short_name("TEST").build().unwrap();

    let records: Vec<_> = catalog.fetch(&query, 10, None).collect::<Result<_, _>>().unwrap();
    assert_eq!(ids(&records), fake.concept_ids(0..25));
    // 10 + 10 + 5, then an empty page ends the sequence.
    assert_eq!(fake.calls(), 4);

    let requests = fake.requests();
    assert_eq!(requests[0].search_after, None);
    assert_eq!(requests[1].search_after.as_deref(), Some("after-10"));
    assert_eq!(requests[2].search_after.as_deref(), Some("after-20"));
    assert!(requests.iter().all(|r| r.url == "https://cmr.test/search/granules.umm_json"));
}

#[test]
fn missing_token_ends_paging_without_an_extra_request() {
    let fake = FakeCatalog::with_granules(25).without_final_token();
    let catalog = Catalog::new(CMR, &fake);
    let query = QueryBuilder::granules().build().unwrap();

    assert_eq!(catalog.fetch(&query, 10, None).count(), 25);
    assert_eq!(fake.calls(), 3);
}

#[test]
fn max_results_bounds_the_sequence_for_any_page_size() {
    for page_size in [1, 3, 4, 10, 2000, 5000] {
        let fake = FakeCatalog::with_granules(25);
        let catalog = Catalog::new(CMR, &fake);
        let query = QueryBuilder::granules().build().unwrap();

        let records = catalog.get(&query, Some(10)).unwrap();
        assert_eq!(records.len(), 10, "full page size");

        let records: Vec<_> = catalog
            .fetch(&query, page_size, Some(7))
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(ids(&records), fake.concept_ids(0..7), "page size {page_size}");

        let records: Vec<_> = catalog
            .fetch(&query, page_size, Some(100))
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(records.len(), 25, "page size {page_size}");
    }
}

#[test]
fn max_results_stops_without_fetching_further_pages() {
    let fake = FakeCatalog::with_granules(25);
    let catalog = Catalog::new(CMR, &fake);
    let query = QueryBuilder::granules().build().unwrap();

    let records = catalog.fetch(&query, 10, Some(10)).count();
    assert_eq!(records, 10);
    assert_eq!(fake.calls(), 1);
}

#[test]
fn queries_can_be_paged_again() {
    let fake = FakeCatalog::with_granules(12);
    let catalog = Catalog::new(CMR, &fake);
    let query = QueryBuilder::granules().build().unwrap();

    let first = catalog.get(&query, None).unwrap();
    let calls_after_first = fake.calls();
    let second = catalog.get(&query, None).unwrap();

    assert_eq!(ids(&first), ids(&second));
    assert_eq!(fake.calls(), calls_after_first * 2);
    let requests = fake.requests();
    assert_eq!(requests[calls_after_first].search_after, None);
}

#[test]
fn page_level_iteration_exposes_tokens() {
    let fake = FakeCatalog::with_granules(5);
    let catalog = Catalog::new(CMR, &fake);
    let query = QueryBuilder::granules().build().unwrap();

    let pages: Vec<_> = catalog
        .fetch_pages(&query, 2, None)
        .collect::<Result<_, _>>()
        .unwrap();
    let sizes: Vec<usize> = pages.iter().map(|p| p.items.len()).collect();
    assert_eq!(sizes, [2, 2, 1]);
    assert_eq!(pages[0].search_after.as_deref(), Some("after-2"));
    assert_eq!(pages[0].hits, Some(5));
}

#[test]
fn catalog_failure_ends_the_sequence_after_partial_results() {
    let fake = FakeCatalog::with_granules(25).failing_on_call(2, 500);
    let catalog = Catalog::new(CMR, &fake);
    let query = QueryBuilder::granules().build().unwrap();

    let results: Vec<_> = catalog.fetch(&query, 10, None).collect();
    assert_eq!(results.len(), 11);
    assert!(results[..10].iter().all(Result::is_ok));
    match &results[10] {
        Err(Error::CatalogRequest { status, message, .. }) => {
            assert_eq!(*status, Some(500));
            assert!(message.contains("simulated outage"));
        }
        other => panic!("expected a catalog error, got {other:?}"),
    }
    assert_eq!(fake.calls(), 2);
}

#[test]
fn hit_count_disagreement_does_not_change_results() {
    let fake = FakeCatalog::with_granules(25).reporting_hits(30);
    let catalog = Catalog::new(CMR, &fake);
    let query = QueryBuilder::granules().build().unwrap();

    assert_eq!(catalog.count(&query).unwrap(), 30);
    assert_eq!(catalog.get(&query, None).unwrap().len(), 25);
}

#[test]
fn temporal_parameters_with_max_results_return_the_first_records() {
    let fake = FakeCatalog::with_granules(25);
    let catalog = Catalog::new(CMR, &fake);
    let query = QueryBuilder::from_params(
        QueryKind::Granules,
        [("temporal", json!(["2020-02", "2020-03"]))],
    )
    .build()
    .unwrap();

    let records: Vec<_> = catalog
        .fetch(&query, 2000, Some(10))
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(ids(&records), fake.concept_ids(0..10));

    let first = &fake.requests()[0];
    assert!(first.params.contains(&(
        "temporal[]".to_string(),
        "2020-02-01T00:00:00Z,2020-03-31T23:59:59Z".to_string()
    )));
    assert!(first.params.contains(&("page_size".to_string(), "10".to_string())));
}
