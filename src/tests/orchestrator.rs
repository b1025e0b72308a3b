//! Query scenarios: intent in, ranked catalog records out.

use std::sync::Arc;
use std::time::Duration;

use super::fakes::{catalog_of, ids, image_url, orchestrator, snapshot, FakeEmbedder, FakeFetcher, SlowCatalog};
use crate::catalog::{CatalogError, CsvCatalog};
use crate::semantic::{EmbeddingError, IndexError, OrchestratorSettings, QueryIntent, SearchError};

const QUERY: &str = "https://query.test/look.jpg";

fn close(a: f32, b: f32) -> bool {
    (a - b).abs() < 1e-5
}

fn three_axes() -> crate::semantic::IndexSnapshot {
    snapshot(
        3,
        &[
            ("a", &[1.0, 0.0, 0.0]),
            ("b", &[0.0, 1.0, 0.0]),
            ("c", &[-1.0, 0.0, 0.0]),
        ],
    )
}

#[test]
fn test_image_search_ranks_parallel_orthogonal_antiparallel() {
    let orch = orchestrator(
        FakeEmbedder::new(3).with(QUERY, &[2.0, 0.0, 0.0]),
        FakeFetcher::new(),
        catalog_of(&["a", "b", "c"]),
        Some(three_axes()),
        OrchestratorSettings::default(),
    );

    let results = orch.search_by_image(QUERY, Some(3)).unwrap();

    assert_eq!(ids(&results), vec!["a", "b", "c"]);
    assert!(close(results[0].score, 1.0));
    assert!(close(results[1].score, 0.0));
    assert!(close(results[2].score, -1.0));
    assert_eq!(results[0].record.title.as_deref(), Some("item a"));
}

#[test]
fn test_text_search_shares_the_image_space() {
    let orch = orchestrator(
        FakeEmbedder::new(3).with("green linen kurta", &[0.1, 3.0, 0.0]),
        FakeFetcher::new(),
        catalog_of(&["a", "b", "c"]),
        Some(three_axes()),
        OrchestratorSettings::default(),
    );

    let results = orch
        .search(QueryIntent::Text("green linen kurta".to_string()))
        .unwrap();

    assert_eq!(results[0].record.id.as_str(), "b");
    assert!(results[0].score > 0.99);
}

#[test]
fn test_blank_text_is_rejected() {
    let orch = orchestrator(
        FakeEmbedder::new(3),
        FakeFetcher::new(),
        catalog_of(&["a"]),
        Some(three_axes()),
        OrchestratorSettings::default(),
    );

    let err = orch.search_by_text("   ", None).unwrap_err();
    assert!(matches!(err, SearchError::EmptyQuery));
}

#[test]
fn test_zero_query_vector_is_degenerate() {
    let orch = orchestrator(
        FakeEmbedder::new(3).with(QUERY, &[0.0, 0.0, 0.0]),
        FakeFetcher::new(),
        catalog_of(&["a"]),
        Some(three_axes()),
        OrchestratorSettings::default(),
    );

    let err = orch.search_by_image(QUERY, None).unwrap_err();
    assert!(matches!(err, SearchError::Degenerate(_)));
}

#[test]
fn test_unfetchable_image_fails_the_single_query() {
    let orch = orchestrator(
        FakeEmbedder::new(3).with(QUERY, &[1.0, 0.0, 0.0]),
        FakeFetcher::new().broken(QUERY),
        catalog_of(&["a"]),
        Some(three_axes()),
        OrchestratorSettings::default(),
    );

    let err = orch.search_by_image(QUERY, None).unwrap_err();
    assert!(matches!(err, SearchError::Fetch(_)));
}

#[test]
fn test_empty_index_is_an_error() {
    let orch = orchestrator(
        FakeEmbedder::new(3).with(QUERY, &[1.0, 0.0, 0.0]),
        FakeFetcher::new(),
        catalog_of(&[]),
        Some(snapshot(3, &[])),
        OrchestratorSettings::default(),
    );

    let err = orch.search_by_image(QUERY, None).unwrap_err();
    assert!(matches!(err, SearchError::Index(IndexError::Empty)));
}

#[test]
fn test_no_snapshot_loaded() {
    let orch = orchestrator(
        FakeEmbedder::new(3).with(QUERY, &[1.0, 0.0, 0.0]),
        FakeFetcher::new(),
        catalog_of(&["a"]),
        None,
        OrchestratorSettings::default(),
    );

    let err = orch.search_by_image(QUERY, None).unwrap_err();
    assert!(matches!(err, SearchError::IndexNotLoaded));
}

#[test]
fn test_duplicate_ids_keep_best_score() {
    let index = snapshot(
        3,
        &[
            ("a", &[0.6, 0.8, 0.0]),
            ("b", &[0.0, 1.0, 0.0]),
            ("a", &[1.0, 0.0, 0.0]),
        ],
    );
    let orch = orchestrator(
        FakeEmbedder::new(3).with(QUERY, &[1.0, 0.0, 0.0]),
        FakeFetcher::new(),
        catalog_of(&["a", "b"]),
        Some(index),
        OrchestratorSettings::default(),
    );

    let results = orch.search_by_image(QUERY, Some(3)).unwrap();

    assert_eq!(ids(&results), vec!["a", "b"]);
    assert!(close(results[0].score, 1.0));
}

#[test]
fn test_ids_missing_from_catalog_are_dropped() {
    let orch = orchestrator(
        FakeEmbedder::new(3).with(QUERY, &[1.0, 0.0, 0.0]),
        FakeFetcher::new(),
        catalog_of(&["a", "c"]),
        Some(three_axes()),
        OrchestratorSettings::default(),
    );

    let results = orch.search_by_image(QUERY, Some(3)).unwrap();
    assert_eq!(ids(&results), vec!["a", "c"]);
}

#[test]
fn test_equal_scores_keep_index_order() {
    let index = snapshot(
        2,
        &[
            ("z", &[0.0, 1.0]),
            ("y", &[1.0, 0.0]),
            ("x", &[0.0, 1.0]),
        ],
    );
    let orch = orchestrator(
        FakeEmbedder::new(2).with(QUERY, &[0.0, 1.0]),
        FakeFetcher::new(),
        catalog_of(&["x", "y", "z"]),
        Some(index),
        OrchestratorSettings::default(),
    );

    let results = orch.search_by_image(QUERY, Some(3)).unwrap();
    assert_eq!(ids(&results), vec!["z", "x", "y"]);
}

#[test]
fn test_signed_zero_scores_keep_index_order() {
    let index = snapshot(2, &[("z", &[0.0, -1.0]), ("y", &[0.0, 1.0])]);
    let orch = orchestrator(
        FakeEmbedder::new(2).with(QUERY, &[-1.0, 0.0]),
        FakeFetcher::new(),
        catalog_of(&["y", "z"]),
        Some(index),
        OrchestratorSettings::default(),
    );

    let results = orch.search_by_image(QUERY, None).unwrap();
    assert_eq!(ids(&results), vec!["z", "y"]);
    assert_eq!(results[0].score, results[1].score);
}

fn fan(count: usize) -> (Vec<String>, crate::semantic::IndexSnapshot) {
    let names: Vec<String> = (0..count).map(|i| format!("p{i:02}")).collect();
    let vectors: Vec<[f32; 2]> = (0..count)
        .map(|i| {
            let angle = i as f32 * 0.05;
            [angle.cos(), angle.sin()]
        })
        .collect();
    let entries: Vec<(&str, &[f32])> = names
        .iter()
        .zip(vectors.iter())
        .map(|(name, v)| (name.as_str(), v.as_slice()))
        .collect();
    let index = snapshot(2, &entries);
    (names, index)
}

#[test]
fn test_default_result_counts() {
    let (names, index) = fan(30);
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();

    let orch = orchestrator(
        FakeEmbedder::new(2)
            .with(QUERY, &[1.0, 0.0])
            .with("flowy", &[1.0, 0.1]),
        FakeFetcher::new(),
        catalog_of(&refs),
        Some(index),
        OrchestratorSettings::default(),
    );

    assert_eq!(orch.search_by_image(QUERY, None).unwrap().len(), 10);
    assert_eq!(orch.search_by_text("flowy", None).unwrap().len(), 10);

    let board = orch.search_by_board(&[QUERY.to_string()], None).unwrap();
    assert_eq!(board.results.len(), 20);
    assert_eq!(orch.search(QueryIntent::Board(vec![QUERY.to_string()])).unwrap().len(), 20);
}

fn board_fixture(fetcher: FakeFetcher) -> crate::semantic::QueryOrchestrator {
    orchestrator(
        FakeEmbedder::new(3)
            .with_item("u1", &[1.0, 0.0, 0.0])
            .with_item("u2", &[0.0, 1.0, 0.0])
            .with_item("u3", &[0.0, 0.0, 1.0]),
        fetcher,
        catalog_of(&["a", "b", "c", "d"]),
        Some(snapshot(
            3,
            &[
                ("a", &[1.0, 0.0, 0.0]),
                ("b", &[0.0, 1.0, 0.0]),
                ("c", &[0.0, 0.0, 1.0]),
                ("d", &[1.0, 1.0, 0.0]),
            ],
        )),
        OrchestratorSettings::default(),
    )
}

#[test]
fn test_board_is_order_independent() {
    let orch = board_fixture(FakeFetcher::new());

    let forward = vec![image_url("u1"), image_url("u2"), image_url("u3")];
    let backward: Vec<String> = forward.iter().rev().cloned().collect();

    let a = orch.search_by_board(&forward, None).unwrap();
    let b = orch.search_by_board(&backward, None).unwrap();

    assert_eq!(ids(&a.results), ids(&b.results));
    for (x, y) in a.results.iter().zip(b.results.iter()) {
        assert!(close(x.score, y.score));
    }
    assert_eq!(a.embedded, 3);
}

#[test]
fn test_board_skips_broken_images() {
    let broken = "https://img.test/gone.jpg";
    let orch = board_fixture(FakeFetcher::new().broken(broken));

    let partial = orch
        .search_by_board(&[image_url("u1"), broken.to_string(), image_url("u2")], None)
        .unwrap();
    let clean = orch
        .search_by_board(&[image_url("u1"), image_url("u2")], None)
        .unwrap();

    assert_eq!(partial.attempted, 3);
    assert_eq!(partial.embedded, 2);
    assert_eq!(partial.skipped.len(), 1);
    assert_eq!(partial.skipped[0].url, broken);

    assert_eq!(ids(&partial.results), ids(&clean.results));
    assert_eq!(partial.results[0].record.id.as_str(), "d");
    assert!(close(partial.results[0].score, 1.0));
}

#[test]
fn test_board_with_nothing_embeddable() {
    let orch = board_fixture(
        FakeFetcher::new()
            .broken("https://img.test/x.jpg")
            .broken("https://img.test/y.jpg"),
    );

    let err = orch
        .search_by_board(
            &["https://img.test/x.jpg".to_string(), "https://img.test/y.jpg".to_string()],
            None,
        )
        .unwrap_err();
    assert!(matches!(err, SearchError::NoEmbeddableInput { attempted: 2 }));

    let err = orch.search_by_board(&[], None).unwrap_err();
    assert!(matches!(err, SearchError::NoEmbeddableInput { attempted: 0 }));
}

#[test]
fn test_board_cancelling_images_is_degenerate() {
    let orch = orchestrator(
        FakeEmbedder::new(3)
            .with_item("up", &[0.0, 1.0, 0.0])
            .with_item("down", &[0.0, -1.0, 0.0]),
        FakeFetcher::new(),
        catalog_of(&["a"]),
        Some(three_axes()),
        OrchestratorSettings::default(),
    );

    let err = orch
        .search_by_board(&[image_url("up"), image_url("down")], None)
        .unwrap_err();
    assert!(matches!(err, SearchError::Degenerate(_)));
}

#[test]
fn test_board_is_capped() {
    let fetcher = Arc::new(FakeFetcher::new());
    let settings = OrchestratorSettings {
        board_max_images: 2,
        ..OrchestratorSettings::default()
    };
    let orch = crate::semantic::QueryOrchestrator::new(
        Arc::new(
            FakeEmbedder::new(3)
                .with_item("u1", &[1.0, 0.0, 0.0])
                .with_item("u2", &[0.0, 1.0, 0.0])
                .with_item("u3", &[0.0, 0.0, 1.0]),
        ),
        fetcher.clone(),
        catalog_of(&["a", "b", "c"]),
        Arc::new(crate::semantic::SnapshotHandle::with_snapshot(three_axes())),
        settings,
    )
    .unwrap();

    let board = orch
        .search_by_board(&[image_url("u1"), image_url("u2"), image_url("u3")], None)
        .unwrap();

    assert_eq!(board.attempted, 2);
    assert_eq!(board.embedded, 2);
    assert_eq!(fetcher.calls(), 2);
}

#[test]
fn test_slow_embedding_times_out() {
    let settings = OrchestratorSettings {
        embed_timeout: Duration::from_millis(20),
        ..OrchestratorSettings::default()
    };
    let orch = orchestrator(
        FakeEmbedder::new(3)
            .with(QUERY, &[1.0, 0.0, 0.0])
            .with_delay(Duration::from_millis(300)),
        FakeFetcher::new(),
        catalog_of(&["a"]),
        Some(three_axes()),
        settings,
    );

    let err = orch.search_by_image(QUERY, None).unwrap_err();
    assert!(matches!(err, SearchError::Embedding(EmbeddingError::Timeout(_))));
}

#[test]
fn test_slow_catalog_times_out() {
    let settings = OrchestratorSettings {
        catalog_timeout: Duration::from_millis(20),
        catalog_retries: 1,
        ..OrchestratorSettings::default()
    };
    let catalog = SlowCatalog {
        inner: CsvCatalog::from_records(vec![super::fakes::record("a")]),
        delay: Duration::from_millis(300),
    };
    let orch = orchestrator(
        FakeEmbedder::new(3).with(QUERY, &[1.0, 0.0, 0.0]),
        FakeFetcher::new(),
        Arc::new(catalog),
        Some(three_axes()),
        settings,
    );

    let err = orch.search_by_image(QUERY, None).unwrap_err();
    assert!(matches!(err, SearchError::Catalog(CatalogError::Timeout(_))));
}

#[test]
fn test_board_stays_bounded_when_embeds_time_out() {
    let settings = OrchestratorSettings {
        board_concurrency: 2,
        embed_timeout: Duration::from_millis(10),
        ..OrchestratorSettings::default()
    };
    let names: Vec<String> = (0..15).map(|i| format!("slow{i}")).collect();
    let embedder = names
        .iter()
        .fold(FakeEmbedder::new(3), |embedder, name| {
            embedder.with_item(name, &[1.0, 0.0, 0.0])
        })
        .with_delay(Duration::from_millis(300));
    let embedder = Arc::new(embedder);

    let orch = crate::semantic::QueryOrchestrator::new(
        embedder.clone(),
        Arc::new(FakeFetcher::new()),
        catalog_of(&["a", "b", "c"]),
        Arc::new(crate::semantic::SnapshotHandle::with_snapshot(three_axes())),
        settings,
    )
    .unwrap();

    let urls: Vec<String> = names.iter().map(|name| image_url(name)).collect();
    let err = orch.search_by_board(&urls, None).unwrap_err();

    assert!(matches!(err, SearchError::NoEmbeddableInput { attempted: 15 }));
    assert!(embedder.peak_in_flight() >= 1);
    assert!(
        embedder.peak_in_flight() <= 2,
        "{} embed calls ran at once",
        embedder.peak_in_flight()
    );
}
