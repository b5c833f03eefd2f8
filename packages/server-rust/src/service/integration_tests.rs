//! End-to-end scenarios against a running host.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use docket_core::{
    Action, Document, DocumentDescription, DocumentQueryResult, Pragmas, ServiceCapabilities,
    ServiceOptions, ServiceStats, StatusCode,
};
use futures_util::future::join_all;
use serde_json::json;

use super::config::HostConfig;
use super::factory::FactoryService;
use super::lifecycle::LifecycleState;
use super::operation::{Operation, OperationError};
use super::shutdown::HealthState;
use super::test_support::{
    CounterService, FlakyStore, Harness, COUNTERS_LINK, COUNTER_KIND, CLOCK_START_MICROS,
};
use crate::storage::{DocumentStore, StoredDocument};

fn status(result: &Result<super::OperationResponse, OperationError>) -> StatusCode {
    match result {
        Ok(response) => response.status,
        Err(e) => e.status_code(),
    }
}

async fn read(h: &Harness, link: &str) -> Result<Document, OperationError> {
    h.host.send(Operation::read(link)).await?.document()
}

// ---------------------------------------------------------------------------
// Factory creates
// ---------------------------------------------------------------------------

#[tokio::test]
async fn factory_generates_child_links() {
    let h = Harness::start(HostConfig::default()).await;
    h.counters(ServiceOptions::empty());

    let response = h
        .host
        .send(Operation::create(COUNTERS_LINK).with_body(json!({"name": "anon"})))
        .await
        .unwrap();
    let doc = response.document().unwrap();
    let id = doc.self_link.strip_prefix("/test/counters/").unwrap();
    assert!(uuid::Uuid::parse_str(id).is_ok());
    assert_eq!(doc.version, 1);
    assert_eq!(doc.kind, COUNTER_KIND);
    assert_eq!(doc.update_action, Some(Action::Create));
    assert_eq!(doc.update_time_micros, CLOCK_START_MICROS);
}

#[tokio::test]
async fn duplicate_create_conflicts_and_keeps_first() {
    let h = Harness::start(HostConfig::default()).await;
    h.counters(ServiceOptions::empty());

    h.host.send(Harness::post("a")).await.unwrap();
    let second = h.host.send(Harness::post("a")).await;
    assert_eq!(status(&second), StatusCode::Conflict);

    let doc = read(&h, &Harness::child("a")).await.unwrap();
    assert_eq!(doc.version, 1);
}

#[tokio::test]
async fn idempotent_creates_become_updates() {
    let h = Harness::start(HostConfig::default()).await;
    let factory = h.counters(ServiceOptions::empty());
    factory.set_option(ServiceOptions::IDEMPOTENT_CREATE, true);

    h.host.send(Harness::post("a")).await.unwrap();
    let mut last = None;
    for _ in 0..16 {
        last = Some(h.host.send(Harness::post("a")).await.unwrap());
    }
    let doc = last.unwrap().document().unwrap();
    assert_eq!(doc.version, 17);
    assert_eq!(doc.update_action, Some(Action::Update));
}

#[tokio::test]
async fn concurrent_idempotent_creates_apply_in_arrival_order() {
    let h = Harness::start(HostConfig::default()).await;
    h.counters(ServiceOptions::IDEMPOTENT_CREATE);
    let post = |counter: i64| {
        Operation::create(COUNTERS_LINK).with_body(json!({
            "documentSelfLink": "a",
            "name": "a",
            "counter": counter,
        }))
    };

    let results = join_all((0..16).map(|i| h.host.send(post(i)))).await;
    for (i, result) in results.into_iter().enumerate() {
        let doc = result.unwrap().document().unwrap();
        assert_eq!(doc.version, i as u64 + 1);
        assert_eq!(doc.field("counter"), Some(&json!(i)));
        let expected = if i == 0 { Action::Create } else { Action::Update };
        assert_eq!(doc.update_action, Some(expected));
    }

    let last = read(&h, &Harness::child("a")).await.unwrap();
    assert_eq!(last.version, 16);
    assert_eq!(last.field("counter"), Some(&json!(15)));
}

#[tokio::test]
async fn create_waits_out_a_restore_that_finds_nothing() {
    let h = Harness::start(HostConfig::default()).await;
    h.counters(ServiceOptions::PERSISTENCE);
    let link = Harness::child("x");

    let (read_first, created) = tokio::join!(read(&h, &link), h.host.send(Harness::post("x")));
    match read_first {
        Ok(doc) => assert_eq!(doc.version, 1),
        Err(e) => assert!(e.is_not_found()),
    }
    assert_eq!(created.unwrap().document().unwrap().version, 1);
    assert_eq!(read(&h, &link).await.unwrap().version, 1);
}

#[tokio::test]
async fn idempotent_create_during_restore_is_a_true_create() {
    let h = Harness::start(HostConfig::default()).await;
    let factory = h.counters(ServiceOptions::PERSISTENCE);
    factory.set_option(ServiceOptions::IDEMPOTENT_CREATE, true);
    let link = Harness::child("y");

    let (_, created) = tokio::join!(read(&h, &link), h.host.send(Harness::post("y")));
    let doc = created.unwrap().document().unwrap();
    assert_eq!(doc.version, 1);
    assert_eq!(doc.update_action, Some(Action::Create));
}

#[tokio::test]
async fn concurrent_plain_creates_admit_one() {
    let h = Harness::start(HostConfig::default()).await;
    h.counters(ServiceOptions::empty());

    let results = join_all((0..8).map(|_| h.host.send(Harness::post("a")))).await;
    let created = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| status(r) == StatusCode::Conflict)
        .count();
    assert_eq!(created, 1);
    assert_eq!(conflicts, 7);
}

#[tokio::test]
async fn failed_start_leaves_nothing_behind() {
    let h = Harness::start(HostConfig::default()).await;
    h.counters(ServiceOptions::PERSISTENCE);
    h.probe.fail_starts.store(1, Ordering::SeqCst);

    let failed = h.host.send(Harness::post("a")).await;
    assert_eq!(status(&failed), StatusCode::InternalError);
    assert!(failed.unwrap_err().to_string().contains("start refused"));
    assert_eq!(h.host.lifecycle_state(&Harness::child("a")), None);
    assert!(h.store.history(&Harness::child("a")).await.unwrap().is_empty());

    let doc = h
        .host
        .send(Harness::post("a"))
        .await
        .unwrap()
        .document()
        .unwrap();
    assert_eq!(doc.version, 1);
}

#[tokio::test]
async fn create_while_creating_rejects_other_actions() {
    let h = Harness::start(HostConfig::default()).await;
    h.counters(ServiceOptions::empty());
    h.probe.start_delay_ms.store(200, Ordering::SeqCst);

    let host = h.host.clone();
    let create = tokio::spawn(async move { host.send(Harness::post("a")).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let link = Harness::child("a");
    assert_eq!(h.host.lifecycle_state(&link), Some(LifecycleState::Creating));
    assert!(read(&h, &link).await.unwrap_err().is_not_found());

    create.await.unwrap().unwrap();
    assert_eq!(h.host.lifecycle_state(&link), Some(LifecycleState::Available));
}

// ---------------------------------------------------------------------------
// Cloning, validation and configuration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn clone_requires_support() {
    let h = Harness::start(HostConfig::default()).await;
    h.counters(ServiceOptions::empty());
    h.host.send(Harness::post("a")).await.unwrap();

    let clone = Operation::create(COUNTERS_LINK).with_body(json!({
        "documentSelfLink": "b",
        "documentSourceLink": Harness::child("a"),
    }));
    let result = h.host.send(clone).await;
    assert_eq!(status(&result), StatusCode::BadRequest);
    assert!(result.unwrap_err().to_string().contains("does not support cloning"));
}

#[tokio::test]
async fn clone_copies_the_source_state() {
    let h = Harness::start(HostConfig::default()).await;
    h.host
        .start_factory(
            COUNTERS_LINK,
            super::test_support::counter_factory(&h.probe, ServiceOptions::empty())
                .with_cloning(),
        )
        .unwrap();
    h.host.send(Harness::post("a")).await.unwrap();

    let clone = Operation::create(COUNTERS_LINK).with_body(json!({
        "documentSelfLink": "b",
        "documentSourceLink": Harness::child("a"),
        "counter": 5,
    }));
    let doc = h.host.send(clone).await.unwrap().document().unwrap();
    assert_eq!(doc.self_link, Harness::child("b"));
    assert_eq!(doc.version, 1);
    assert_eq!(doc.field("name"), Some(&json!("a")));
    assert_eq!(doc.field("counter"), Some(&json!(5)));
}

#[tokio::test]
async fn factory_kind_mismatch_is_refused() {
    let h = Harness::start(HostConfig::default()).await;
    let probe = Arc::clone(&h.probe);
    let factory = FactoryService::new(DocumentDescription::new("test:Other"), move || {
        Arc::new(CounterService::new(Arc::clone(&probe), ServiceOptions::empty()))
    });
    let err = h.host.start_factory(COUNTERS_LINK, factory).unwrap_err();
    assert_eq!(err.status_code(), StatusCode::InternalError);
    assert!(err.to_string().contains(COUNTER_KIND));
    assert!(h.host.factory(COUNTERS_LINK).is_none());
}

#[tokio::test]
async fn undecodable_bodies_are_bad_requests() {
    let h = Harness::start(HostConfig::default()).await;
    h.counters(ServiceOptions::empty());

    let plain = Operation::create(COUNTERS_LINK).with_raw_body("name=a", "text/plain");
    let result = h.host.send(plain).await;
    assert_eq!(status(&result), StatusCode::BadRequest);
    assert!(result
        .unwrap_err()
        .to_string()
        .contains("Unrecognized Content-Type: text/plain"));

    let broken = Operation::create(COUNTERS_LINK).with_raw_body("{\"name\":", "application/json");
    assert_eq!(status(&h.host.send(broken).await), StatusCode::BadRequest);

    let missing = Operation::create(COUNTERS_LINK).with_body(json!({"counter": 1}));
    let result = h.host.send(missing).await;
    assert_eq!(status(&result), StatusCode::BadRequest);
    assert!(result.unwrap_err().to_string().contains("'name'"));

    let query: DocumentQueryResult = h
        .host
        .send(Operation::read(COUNTERS_LINK))
        .await
        .unwrap()
        .body_as()
        .unwrap();
    assert_eq!(query.document_count, 0);
}

// ---------------------------------------------------------------------------
// Updates
// ---------------------------------------------------------------------------

#[tokio::test]
async fn repeated_merge_is_not_modified() {
    let h = Harness::start(HostConfig::default()).await;
    h.counters(ServiceOptions::empty());
    h.host.send(Harness::post("a")).await.unwrap();
    let link = Harness::child("a");

    let patch = || Operation::update_merge(link.clone()).with_body(json!({"counter": 3}));
    let first = h.host.send(patch()).await.unwrap();
    assert_eq!(first.status, StatusCode::Ok);
    assert_eq!(first.document().unwrap().version, 2);
    assert_eq!(
        first.document().unwrap().update_action,
        Some(Action::UpdateMerge)
    );

    let second = h.host.send(patch()).await.unwrap();
    assert_eq!(second.status, StatusCode::NotModified);
    assert_eq!(second.document().unwrap().version, 2);
    assert_eq!(read(&h, &link).await.unwrap().version, 2);
}

#[tokio::test]
async fn strict_updates_must_name_the_current_version() {
    let h = Harness::start(HostConfig::default()).await;
    h.counters(ServiceOptions::STRICT_UPDATE_CHECKING);
    h.host.send(Harness::post("a")).await.unwrap();
    let link = Harness::child("a");

    let put = |version: u64, counter: i64| {
        Operation::update(link.clone()).with_body(json!({
            "name": "a",
            "counter": counter,
            "documentVersion": version,
        }))
    };
    let doc = h.host.send(put(1, 1)).await.unwrap().document().unwrap();
    assert_eq!(doc.version, 2);

    let stale = h.host.send(put(1, 2)).await;
    assert_eq!(status(&stale), StatusCode::Conflict);
    assert_eq!(read(&h, &link).await.unwrap().field("counter"), Some(&json!(1)));
}

#[tokio::test]
async fn failed_append_leaves_state_and_versions_intact() {
    let h = Harness::start(HostConfig::default()).await;
    h.counters(ServiceOptions::PERSISTENCE);
    h.host.send(Harness::post("a")).await.unwrap();
    let link = Harness::child("a");

    h.store.fail_appends.store(true, Ordering::SeqCst);
    let failed = h
        .host
        .send(Operation::update_merge(link.clone()).with_body(json!({"counter": 9})))
        .await;
    assert_eq!(status(&failed), StatusCode::InternalError);
    let doc = read(&h, &link).await.unwrap();
    assert_eq!(doc.version, 1);
    assert!(doc.field("counter").is_none());

    h.store.fail_appends.store(false, Ordering::SeqCst);
    let doc = h
        .host
        .send(Operation::update_merge(link.clone()).with_body(json!({"counter": 9})))
        .await
        .unwrap()
        .document()
        .unwrap();
    assert_eq!(doc.version, 2);
    let versions: Vec<u64> = h
        .store
        .history(&link)
        .await
        .unwrap()
        .iter()
        .map(StoredDocument::version)
        .collect();
    assert_eq!(versions, vec![1, 2]);
}

#[tokio::test]
async fn serial_services_run_one_hook_at_a_time() {
    let h = Harness::start(HostConfig::default()).await;
    h.counters(ServiceOptions::PERSISTENCE);
    h.host.send(Harness::post("a")).await.unwrap();
    h.probe.update_delay_ms.store(20, Ordering::SeqCst);
    let link = Harness::child("a");

    let patches = (1..=6).map(|n| {
        h.host
            .send(Operation::update_merge(link.clone()).with_body(json!({"counter": n})))
    });
    for result in join_all(patches).await {
        result.unwrap();
    }
    assert_eq!(h.probe.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(read(&h, &link).await.unwrap().version, 7);
}

#[tokio::test]
async fn concurrent_services_overlap_but_keep_versions_contiguous() {
    let h = Harness::start(HostConfig::default()).await;
    h.counters(ServiceOptions::PERSISTENCE | ServiceOptions::CONCURRENT_UPDATE_HANDLING);
    h.host.send(Harness::post("a")).await.unwrap();
    h.probe.update_delay_ms.store(50, Ordering::SeqCst);
    let link = Harness::child("a");

    let patches = (1..=8).map(|n| {
        h.host
            .send(Operation::update_merge(link.clone()).with_body(json!({"counter": n})))
    });
    for result in join_all(patches).await {
        result.unwrap();
    }
    assert!(h.probe.max_active.load(Ordering::SeqCst) > 1);

    let versions: Vec<u64> = h
        .store
        .history(&link)
        .await
        .unwrap()
        .iter()
        .map(StoredDocument::version)
        .collect();
    assert_eq!(versions, (1..=9).collect::<Vec<_>>());
}

#[tokio::test]
async fn uncached_reads_consult_the_store() {
    let config = HostConfig {
        service_state_caching: false,
        ..HostConfig::default()
    };
    let h = Harness::start(config).await;
    h.counters(ServiceOptions::PERSISTENCE);
    let mut doc = h
        .host
        .send(Harness::post("a"))
        .await
        .unwrap()
        .document()
        .unwrap();

    doc.version = 2;
    doc.set_field("counter", json!(42));
    h.store.append(StoredDocument::live(doc)).await.unwrap();

    let current = read(&h, &Harness::child("a")).await.unwrap();
    assert_eq!(current.version, 2);
    assert_eq!(current.field("counter"), Some(&json!(42)));

    let merged = h
        .host
        .send(Operation::update_merge(Harness::child("a")).with_body(json!({"counter": 7})))
        .await
        .unwrap()
        .document()
        .unwrap();
    assert_eq!(merged.version, 3);
    assert_eq!(merged.field("counter"), Some(&json!(7)));
    assert_eq!(h.store.get_latest(&merged.self_link).await.unwrap().unwrap().version(), 3);
}

#[tokio::test]
async fn uncached_strict_updates_check_the_stored_version() {
    let config = HostConfig {
        service_state_caching: false,
        ..HostConfig::default()
    };
    let h = Harness::start(config).await;
    h.counters(ServiceOptions::PERSISTENCE | ServiceOptions::STRICT_UPDATE_CHECKING);
    let link = Harness::child("a");
    let mut doc = h
        .host
        .send(Harness::post("a"))
        .await
        .unwrap()
        .document()
        .unwrap();
    doc.version = 2;
    h.store.append(StoredDocument::live(doc)).await.unwrap();

    let put = |version: u64| {
        Operation::update(link.clone()).with_body(json!({
            "name": "a",
            "counter": 1,
            "documentVersion": version,
        }))
    };
    let stale = h.host.send(put(1)).await;
    assert_eq!(status(&stale), StatusCode::Conflict);
    let doc = h.host.send(put(2)).await.unwrap().document().unwrap();
    assert_eq!(doc.version, 3);
}

// ---------------------------------------------------------------------------
// Delete, stop and expiry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn delete_hook_sees_the_state_being_removed() {
    let h = Harness::start(HostConfig::default()).await;
    h.counters(ServiceOptions::PERSISTENCE);
    h.host.send(Harness::post("a")).await.unwrap();
    let link = Harness::child("a");

    let tombstone = h
        .host
        .send(Operation::delete(link.clone()))
        .await
        .unwrap()
        .document()
        .unwrap();
    assert_eq!(tombstone.version, 2);
    assert_eq!(tombstone.update_action, Some(Action::Delete));

    let seen = h.probe.deletes.lock().clone();
    assert_eq!(seen.len(), 1);
    let prior = seen[0].as_ref().unwrap();
    assert_eq!(prior.version, 1);
    assert_eq!(prior.field("name"), Some(&json!("a")));

    assert_eq!(h.host.lifecycle_state(&link), Some(LifecycleState::Deleted));
    assert!(read(&h, &link).await.unwrap_err().is_not_found());
    let latest = h.store.get_latest(&link).await.unwrap().unwrap();
    assert!(latest.deleted);
}

#[tokio::test]
async fn recreate_after_restart_continues_versions() {
    let store = Arc::new(FlakyStore::default());
    let link = Harness::child("a");

    let first = Harness::with_store(HostConfig::default(), Arc::clone(&store)).await;
    first.counters(ServiceOptions::PERSISTENCE);
    first.host.send(Harness::post("a")).await.unwrap();
    first.host.send(Harness::post("b")).await.unwrap();
    first.host.send(Operation::delete(link.clone())).await.unwrap();
    first.host.shutdown().await;

    let second = Harness::with_store(HostConfig::default(), Arc::clone(&store)).await;
    second.counters(ServiceOptions::PERSISTENCE);
    assert!(read(&second, &link).await.unwrap_err().is_not_found());

    let query: DocumentQueryResult = second
        .host
        .send(Operation::read(COUNTERS_LINK))
        .await
        .unwrap()
        .body_as()
        .unwrap();
    assert_eq!(query.document_links, vec![Harness::child("b")]);

    let checked = |version: u64| {
        Operation::create(COUNTERS_LINK)
            .with_body(json!({
                "documentSelfLink": "a",
                "documentVersion": version,
                "name": "a",
            }))
            .with_pragma(Pragmas::VERSION_CHECK)
    };
    let stale = second.host.send(checked(1)).await;
    assert_eq!(status(&stale), StatusCode::Conflict);

    let doc = second
        .host
        .send(checked(2))
        .await
        .unwrap()
        .document()
        .unwrap();
    assert_eq!(doc.version, 3);
    assert_eq!(read(&second, &link).await.unwrap().version, 3);

    let restored = read(&second, &Harness::child("b")).await.unwrap();
    assert_eq!(restored.version, 1);
}

#[tokio::test]
async fn no_index_update_stops_and_restores() {
    let h = Harness::start(HostConfig::default()).await;
    h.counters(ServiceOptions::PERSISTENCE);
    h.host.send(Harness::post("a")).await.unwrap();
    let link = Harness::child("a");
    h.host
        .send(Operation::update_merge(link.clone()).with_body(json!({"counter": 2})))
        .await
        .unwrap();

    h.host
        .send(Operation::delete(link.clone()).with_pragma(Pragmas::NO_INDEX_UPDATE))
        .await
        .unwrap();
    assert_eq!(h.host.lifecycle_state(&link), Some(LifecycleState::Stopped));
    let latest = h.store.get_latest(&link).await.unwrap().unwrap();
    assert!(!latest.deleted);
    assert_eq!(latest.version(), 2);

    let doc = read(&h, &link).await.unwrap();
    assert_eq!(doc.version, 2);
    assert_eq!(doc.field("counter"), Some(&json!(2)));
    assert_eq!(h.host.lifecycle_state(&link), Some(LifecycleState::Available));
}

#[tokio::test]
async fn expired_children_vanish_lazily() {
    let h = Harness::start(HostConfig::default()).await;
    h.counters(ServiceOptions::PERSISTENCE);
    let expiring = Operation::create(COUNTERS_LINK).with_body(json!({
        "documentSelfLink": "a",
        "name": "a",
        "documentExpirationTimeMicros": CLOCK_START_MICROS + 1_000,
    }));
    h.host.send(expiring).await.unwrap();
    h.host.send(Harness::post("b")).await.unwrap();
    let link = Harness::child("a");
    assert!(read(&h, &link).await.is_ok());

    h.clock.advance(2_000);
    let query: DocumentQueryResult = h
        .host
        .send(Operation::read(COUNTERS_LINK))
        .await
        .unwrap()
        .body_as()
        .unwrap();
    assert_eq!(query.document_links, vec![Harness::child("b")]);

    assert_eq!(h.probe.deletes.lock().as_slice(), &[None]);
    assert!(read(&h, &link).await.unwrap_err().is_not_found());
    assert!(h.store.get_latest(&link).await.unwrap().unwrap().deleted);
}

#[tokio::test(start_paused = true)]
async fn expiry_tombstones_the_latest_concurrent_commit() {
    let h = Harness::start(HostConfig::default()).await;
    h.counters(ServiceOptions::PERSISTENCE | ServiceOptions::CONCURRENT_UPDATE_HANDLING);
    let expiring = Operation::create(COUNTERS_LINK).with_body(json!({
        "documentSelfLink": "a",
        "name": "a",
        "documentExpirationTimeMicros": CLOCK_START_MICROS + 1_000,
    }));
    h.host.send(expiring).await.unwrap();
    let link = Harness::child("a");
    h.probe.update_delay_ms.store(20, Ordering::SeqCst);
    h.probe.delete_delay_ms.store(60, Ordering::SeqCst);

    let update = {
        let host = h.host.clone();
        let op = Operation::update_merge(link.clone()).with_body(json!({"counter": 5}));
        tokio::spawn(async move { host.send(op).await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    h.clock.advance(2_000);

    assert!(read(&h, &link).await.unwrap_err().is_not_found());
    assert_eq!(update.await.unwrap().unwrap().document().unwrap().version, 2);

    let history = h.store.history(&link).await.unwrap();
    let versions: Vec<u64> = history.iter().map(StoredDocument::version).collect();
    assert_eq!(versions, vec![1, 2, 3]);
    assert!(history[2].deleted);
    assert_eq!(history[2].document.field("counter"), Some(&json!(5)));
    assert_eq!(h.host.lifecycle_state(&link), Some(LifecycleState::Deleted));
}

#[tokio::test]
async fn deleting_a_factory_keeps_its_children() {
    let h = Harness::start(HostConfig::default()).await;
    h.counters(ServiceOptions::empty());
    h.host.send(Harness::post("a")).await.unwrap();

    h.host.send(Operation::delete(COUNTERS_LINK)).await.unwrap();
    assert!(h.host.factory(COUNTERS_LINK).is_none());
    assert!(read(&h, &Harness::child("a")).await.is_ok());
    assert!(h
        .host
        .send(Harness::post("b"))
        .await
        .unwrap_err()
        .is_not_found());
}

// ---------------------------------------------------------------------------
// Replication
// ---------------------------------------------------------------------------

#[tokio::test]
async fn owner_selection_requires_quorum() {
    let h = Harness::start(HostConfig::default()).await;
    h.counters(ServiceOptions::REPLICATION | ServiceOptions::OWNER_SELECTION);
    h.replicator.accepted.store(1, Ordering::SeqCst);

    let failed = h.host.send(Harness::post("a")).await;
    assert_eq!(status(&failed), StatusCode::InternalError);
    assert!(failed.unwrap_err().to_string().contains("accepted by 1 of 2"));
    assert_eq!(h.host.lifecycle_state(&Harness::child("a")), None);

    h.replicator.accepted.store(2, Ordering::SeqCst);
    let doc = h
        .host
        .send(Harness::post("a"))
        .await
        .unwrap()
        .document()
        .unwrap();
    assert_eq!(doc.version, 1);
}

#[tokio::test]
async fn plain_replication_does_not_block_completion() {
    let h = Harness::start(HostConfig::default()).await;
    h.counters(ServiceOptions::REPLICATION);
    h.replicator.accepted.store(0, Ordering::SeqCst);

    h.host.send(Harness::post("a")).await.unwrap();
    for _ in 0..100 {
        if h.replicator.calls.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.replicator.calls.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Pipeline behavior
// ---------------------------------------------------------------------------

#[tokio::test]
async fn callback_fires_exactly_once() {
    let h = Harness::start(HostConfig::default()).await;
    h.counters(ServiceOptions::empty());

    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = tokio::sync::oneshot::channel();
    let counted = Arc::clone(&calls);
    h.host.send_with_callback(Harness::post("a"), move |result| {
        counted.fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(result);
    });
    let result = rx.await.unwrap();
    assert!(result.is_ok());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn operation_deadline_times_out() {
    let h = Harness::start(HostConfig::default()).await;
    h.counters(ServiceOptions::empty());
    h.host.send(Harness::post("a")).await.unwrap();
    h.probe.update_delay_ms.store(300, Ordering::SeqCst);

    let slow = Operation::update_merge(Harness::child("a"))
        .with_body(json!({"counter": 1}))
        .with_timeout(Duration::from_millis(30));
    let result = h.host.send(slow).await;
    assert!(matches!(result, Err(OperationError::Timeout { timeout_ms: 30 })));
}

#[tokio::test]
async fn context_id_reaches_nested_operations() {
    let h = Harness::start(HostConfig::default()).await;
    let initial = |name: &str| Document::default().with_field("name", json!(name));
    h.host
        .start_service(
            "/test/b",
            Arc::new(CounterService::new(Arc::clone(&h.probe), ServiceOptions::empty())),
            initial("b"),
        )
        .await
        .unwrap();
    h.host
        .start_service(
            "/test/a",
            Arc::new(
                CounterService::new(Arc::clone(&h.probe), ServiceOptions::empty())
                    .forwarding("/test/b"),
            ),
            initial("a"),
        )
        .await
        .unwrap();

    let response = h
        .host
        .send(
            Operation::update("/test/a")
                .with_body(json!({"name": "a", "counter": 4}))
                .with_context_id("ctx-7"),
        )
        .await
        .unwrap();
    assert_eq!(
        response.context_id.as_ref().map(docket_core::ContextId::as_str),
        Some("ctx-7")
    );

    let contexts = h.probe.contexts.lock().clone();
    assert!(contexts.contains(&("/test/a".to_string(), Some("ctx-7".to_string()))));
    assert!(contexts.contains(&("/test/b".to_string(), Some("ctx-7".to_string()))));
    let b = read(&h, "/test/b").await.unwrap();
    assert_eq!(b.field("counter"), Some(&json!(4)));
}

#[tokio::test]
async fn shutdown_rejects_new_operations() {
    let h = Harness::start(HostConfig::default()).await;
    h.counters(ServiceOptions::empty());
    h.host.send(Harness::post("a")).await.unwrap();

    h.host.shutdown().await;
    assert_eq!(h.host.health_state(), HealthState::Stopped);
    let result = h.host.send(Operation::read(Harness::child("a"))).await;
    assert!(matches!(result, Err(OperationError::Unavailable { .. })));
    assert_eq!(status(&result), StatusCode::ServiceUnavailable);
}

// ---------------------------------------------------------------------------
// Queries, discovery and stats
// ---------------------------------------------------------------------------

#[tokio::test]
async fn expanded_query_returns_documents() {
    let h = Harness::start(HostConfig::default()).await;
    h.counters(ServiceOptions::empty());
    for name in ["a", "b", "c"] {
        h.host.send(Harness::post(name)).await.unwrap();
    }

    let plain: DocumentQueryResult = h
        .host
        .send(Operation::read(COUNTERS_LINK))
        .await
        .unwrap()
        .body_as()
        .unwrap();
    assert_eq!(plain.document_count, 3);
    assert!(plain.documents.is_none());

    let expanded: DocumentQueryResult = h
        .host
        .send(Operation::read(COUNTERS_LINK).with_expand())
        .await
        .unwrap()
        .body_as()
        .unwrap();
    let documents = expanded.documents.unwrap();
    assert_eq!(documents.len(), 3);
    assert_eq!(
        documents[&Harness::child("b")].field("name"),
        Some(&json!("b"))
    );
}

#[tokio::test]
async fn discover_reports_capabilities() {
    let h = Harness::start(HostConfig::default()).await;
    h.counters(ServiceOptions::PERSISTENCE | ServiceOptions::INSTRUMENTATION);
    h.host.send(Harness::post("a")).await.unwrap();

    let child: ServiceCapabilities = h
        .host
        .send(Operation::discover(Harness::child("a")))
        .await
        .unwrap()
        .body_as()
        .unwrap();
    assert_eq!(child.document_kind.as_deref(), Some(COUNTER_KIND));
    assert_eq!(child.options, vec!["PERSISTENCE", "INSTRUMENTATION"]);
    assert_eq!(child.actions, Action::ALL.to_vec());

    let factory: ServiceCapabilities = h
        .host
        .send(Operation::discover(COUNTERS_LINK))
        .await
        .unwrap()
        .body_as()
        .unwrap();
    assert!(!factory.actions.contains(&Action::Update));
}

#[tokio::test]
async fn instrumented_children_publish_stats() {
    let h = Harness::start(HostConfig::default()).await;
    h.counters(ServiceOptions::INSTRUMENTATION);
    h.host.send(Harness::post("a")).await.unwrap();
    let link = Harness::child("a");
    read(&h, &link).await.unwrap();
    read(&h, &link).await.unwrap();

    let stats: ServiceStats = h
        .host
        .send(Operation::read(format!("{link}/stats")))
        .await
        .unwrap()
        .body_as()
        .unwrap();
    assert_eq!(stats.document_self_link, format!("{link}/stats"));
    assert!((stats.entries["READRequestCount"].latest_value - 2.0).abs() < f64::EPSILON);
    assert!((stats.entries["CREATERequestCount"].latest_value - 1.0).abs() < f64::EPSILON);
    assert!(stats.entries.contains_key("READLatencyMicros"));
}

#[tokio::test]
async fn deleted_children_drop_their_stats() {
    let h = Harness::start(HostConfig::default()).await;
    h.counters(ServiceOptions::INSTRUMENTATION);
    let link = Harness::child("a");
    h.host.send(Harness::post("a")).await.unwrap();
    read(&h, &link).await.unwrap();
    h.host.send(Operation::delete(link.clone())).await.unwrap();
    assert!(h.host.inner().stats.snapshot(&link).entries.is_empty());

    h.host.send(Harness::post("a")).await.unwrap();
    let stats: ServiceStats = h
        .host
        .send(Operation::read(format!("{link}/stats")))
        .await
        .unwrap()
        .body_as()
        .unwrap();
    assert!((stats.entries["CREATERequestCount"].latest_value - 1.0).abs() < f64::EPSILON);
    assert!(!stats.entries.contains_key("READRequestCount"));
    assert!(!stats.entries.contains_key("DELETERequestCount"));
}

// ---------------------------------------------------------------------------
// Version monotonicity
// ---------------------------------------------------------------------------

mod monotonic {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn each_accepted_mutation_adds_one(
            steps in proptest::collection::vec((any::<bool>(), 0i64..3), 1..12),
        ) {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let h = Harness::start(HostConfig::default()).await;
                h.counters(ServiceOptions::PERSISTENCE);
                let link = Harness::child("p");
                h.host
                    .send(Operation::create(COUNTERS_LINK).with_body(json!({
                        "documentSelfLink": "p",
                        "name": "p",
                        "counter": 0,
                    })))
                    .await
                    .unwrap();

                let mut version = 1;
                let mut counter = 0;
                for (merge, value) in steps {
                    let response = if merge {
                        h.host
                            .send(Operation::update_merge(link.clone()).with_body(json!({"counter": value})))
                            .await
                            .unwrap()
                    } else {
                        h.host
                            .send(Operation::update(link.clone()).with_body(json!({"name": "p", "counter": value})))
                            .await
                            .unwrap()
                    };
                    if !(merge && value == counter) {
                        version += 1;
                    }
                    counter = value;
                    assert_eq!(response.document().unwrap().version, version);
                }
                let history = h.store.history(&link).await.unwrap();
                let versions: Vec<u64> = history.iter().map(StoredDocument::version).collect();
                assert_eq!(versions, (1..=version).collect::<Vec<_>>());
            });
        }
    }
}
