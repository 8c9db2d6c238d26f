//! Log-level and branch-level invariants: ordering, bounds, fork
//! equivalence, idempotence, restore reversibility, read-your-writes,
//! isolation, and the documented boundary behaviors.

mod common;

use common::{doc, engine, id};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tributary_core::{BranchId, CoreError, DocumentDelta, Lsn, MAIN_BRANCH};

#[tokio::test]
async fn lsns_are_strictly_increasing_and_gap_free() {
    let engine = engine().await;
    let cancel = CancellationToken::new();

    let project = engine.registry().create_project("p1", &cancel).await.unwrap();
    let main = engine.resolve_branch("p1", MAIN_BRANCH).await.unwrap();
    engine
        .interceptor()
        .insert_one(main.branch_id, "users", doc(json!({"_id": "a"})), &cancel)
        .await
        .unwrap();
    let feature = engine
        .registry()
        .create_branch(project.project_id, "feature", None, &cancel)
        .await
        .unwrap();
    engine
        .interceptor()
        .delete_one(feature.branch_id, "users", id("a"), &cancel)
        .await
        .unwrap();
    engine
        .interceptor()
        .create_collection(main.branch_id, "orders", &cancel)
        .await
        .unwrap();

    let entries = engine
        .wal()
        .get_range(Lsn::new(1), engine.wal().current_lsn(), &cancel)
        .await
        .unwrap();
    let lsns: Vec<u64> = entries.iter().map(|e| e.lsn.value()).collect();
    assert_eq!(lsns, (1..=5).collect::<Vec<u64>>());
}

#[tokio::test]
async fn branch_pointers_stay_within_bounds() {
    let engine = engine().await;
    let cancel = CancellationToken::new();

    let project = engine.registry().create_project("p1", &cancel).await.unwrap();
    let main = engine.resolve_branch("p1", MAIN_BRANCH).await.unwrap();
    engine
        .interceptor()
        .insert_one(main.branch_id, "users", doc(json!({"_id": "a"})), &cancel)
        .await
        .unwrap();
    engine
        .registry()
        .create_branch(project.project_id, "feature", None, &cancel)
        .await
        .unwrap();

    for branch in engine.registry().list_branches(project.project_id).await.unwrap() {
        assert!(branch.base_lsn <= branch.head_lsn, "{}", branch.name);
        assert!(branch.head_lsn <= engine.wal().current_lsn(), "{}", branch.name);
    }
}

#[tokio::test]
async fn fork_matches_parent_at_fork_point() {
    let engine = engine().await;
    let cancel = CancellationToken::new();

    engine.registry().create_project("p1", &cancel).await.unwrap();
    let main = engine.resolve_branch("p1", MAIN_BRANCH).await.unwrap();
    for n in 1..=3 {
        engine
            .interceptor()
            .insert_one(
                main.branch_id,
                "users",
                doc(json!({"_id": format!("d{n}"), "n": n})),
                &cancel,
            )
            .await
            .unwrap();
    }
    let fork_point = Lsn::new(3); // after the second insert

    let fork = engine
        .restore()
        .fork_at_lsn(main.branch_id, "fork", fork_point, &cancel)
        .await
        .unwrap();

    let parent_state = engine
        .materializer()
        .materialize_collection(main.branch_id, "users", Some(fork_point), &cancel)
        .await
        .unwrap();
    let fork_state = engine
        .materializer()
        .materialize_collection(fork.branch_id, "users", Some(fork_point), &cancel)
        .await
        .unwrap();
    assert_eq!(*parent_state, *fork_state);
    assert_eq!(parent_state.len(), 2);
}

#[tokio::test]
async fn materialization_is_idempotent() {
    let engine = engine().await;
    let cancel = CancellationToken::new();

    engine.registry().create_project("p1", &cancel).await.unwrap();
    let main = engine.resolve_branch("p1", MAIN_BRANCH).await.unwrap();
    engine
        .interceptor()
        .insert_one(main.branch_id, "users", doc(json!({"_id": "a", "n": 1})), &cancel)
        .await
        .unwrap();
    engine
        .interceptor()
        .update_one(
            main.branch_id,
            "users",
            id("a"),
            DocumentDelta::new().set("n", json!(2)),
            &cancel,
        )
        .await
        .unwrap();

    let first = engine
        .materializer()
        .materialize_collection(main.branch_id, "users", Some(Lsn::new(3)), &cancel)
        .await
        .unwrap();
    for _ in 0..3 {
        let again = engine
            .materializer()
            .materialize_collection(main.branch_id, "users", Some(Lsn::new(3)), &cancel)
            .await
            .unwrap();
        assert_eq!(*first, *again);
    }
}

#[tokio::test]
async fn restore_is_reversible_and_lossless() {
    let engine = engine().await;
    let cancel = CancellationToken::new();

    engine.registry().create_project("p1", &cancel).await.unwrap();
    let main = engine.resolve_branch("p1", MAIN_BRANCH).await.unwrap();
    let branch_id = main.branch_id;

    for n in 1..=4 {
        engine
            .interceptor()
            .insert_one(
                branch_id,
                "users",
                doc(json!({"_id": format!("d{n}"), "n": n})),
                &cancel,
            )
            .await
            .unwrap();
    }
    let original_head = engine.resolve_branch("p1", MAIN_BRANCH).await.unwrap().head_lsn;

    // Snapshot every historical point before restoring.
    let mut snapshots = Vec::new();
    for lsn in main.base_lsn.value()..=original_head.value() {
        let state = engine
            .materializer()
            .materialize_collection(branch_id, "users", Some(Lsn::new(lsn)), &cancel)
            .await
            .unwrap();
        snapshots.push((Lsn::new(lsn), state));
    }

    engine
        .restore()
        .reset_branch(branch_id, Lsn::new(2), &cancel)
        .await
        .unwrap();
    engine
        .restore()
        .reset_branch(branch_id, original_head, &cancel)
        .await
        .unwrap();

    // Every point is still computable and unchanged.
    for (lsn, before) in snapshots {
        let after = engine
            .materializer()
            .materialize_collection(branch_id, "users", Some(lsn), &cancel)
            .await
            .unwrap();
        assert_eq!(*before, *after, "state diverged at {lsn}");
    }
}

#[tokio::test]
async fn read_your_writes() {
    let engine = engine().await;
    let cancel = CancellationToken::new();

    engine.registry().create_project("p1", &cancel).await.unwrap();
    let main = engine.resolve_branch("p1", MAIN_BRANCH).await.unwrap();

    let (doc_id, ack) = engine
        .interceptor()
        .insert_one(main.branch_id, "users", doc(json!({"_id": "a", "n": 1})), &cancel)
        .await
        .unwrap();
    let state = engine
        .materializer()
        .materialize_collection(main.branch_id, "users", Some(ack.lsn), &cancel)
        .await
        .unwrap();
    assert!(state.contains_key(&doc_id));
}

#[tokio::test]
async fn appends_on_one_branch_never_leak_into_another() {
    let engine = engine().await;
    let cancel = CancellationToken::new();

    let project = engine.registry().create_project("p1", &cancel).await.unwrap();
    let main = engine.resolve_branch("p1", MAIN_BRANCH).await.unwrap();
    engine
        .interceptor()
        .insert_one(main.branch_id, "users", doc(json!({"_id": "a"})), &cancel)
        .await
        .unwrap();
    let feature = engine
        .registry()
        .create_branch(project.project_id, "feature", None, &cancel)
        .await
        .unwrap();

    let before: Vec<_> = {
        let mut states = Vec::new();
        for lsn in [Lsn::new(2), Lsn::new(3)] {
            states.push(
                engine
                    .materializer()
                    .materialize_collection(main.branch_id, "users", Some(lsn), &cancel)
                    .await
                    .unwrap(),
            );
        }
        states
    };

    // Heavy traffic on the feature branch.
    for n in 0..10 {
        engine
            .interceptor()
            .insert_one(
                feature.branch_id,
                "users",
                doc(json!({"_id": format!("f{n}")})),
                &cancel,
            )
            .await
            .unwrap();
    }

    for (state, lsn) in before.iter().zip([Lsn::new(2), Lsn::new(3)]) {
        let after = engine
            .materializer()
            .materialize_collection(main.branch_id, "users", Some(lsn), &cancel)
            .await
            .unwrap();
        assert_eq!(**state, *after);
    }
    let head_state = engine
        .materializer()
        .materialize_collection(main.branch_id, "users", None, &cancel)
        .await
        .unwrap();
    assert_eq!(head_state.len(), 1);
}

#[tokio::test]
async fn insert_delete_round_trip_windows() {
    let engine = engine().await;
    let cancel = CancellationToken::new();

    engine.registry().create_project("p1", &cancel).await.unwrap();
    let main = engine.resolve_branch("p1", MAIN_BRANCH).await.unwrap();
    let branch_id = main.branch_id;

    let (_, inserted) = engine
        .interceptor()
        .insert_one(branch_id, "users", doc(json!({"_id": "a"})), &cancel)
        .await
        .unwrap();
    engine
        .interceptor()
        .insert_one(branch_id, "users", doc(json!({"_id": "pad"})), &cancel)
        .await
        .unwrap();
    let deleted = engine
        .interceptor()
        .delete_one(branch_id, "users", id("a"), &cancel)
        .await
        .unwrap();

    // Present in [n, m-1], absent from m on.
    for lsn in inserted.lsn.value()..deleted.lsn.value() {
        let state = engine
            .materializer()
            .materialize_collection(branch_id, "users", Some(Lsn::new(lsn)), &cancel)
            .await
            .unwrap();
        assert!(state.contains_key(&id("a")), "missing at LSN {lsn}");
    }
    let state = engine
        .materializer()
        .materialize_collection(branch_id, "users", Some(deleted.lsn), &cancel)
        .await
        .unwrap();
    assert!(!state.contains_key(&id("a")));
}

#[tokio::test]
async fn materialize_at_base_returns_fork_time_state() {
    let engine = engine().await;
    let cancel = CancellationToken::new();

    let project = engine.registry().create_project("p1", &cancel).await.unwrap();
    let main = engine.resolve_branch("p1", MAIN_BRANCH).await.unwrap();
    engine
        .interceptor()
        .insert_one(main.branch_id, "users", doc(json!({"_id": "a", "n": 1})), &cancel)
        .await
        .unwrap();
    let feature = engine
        .registry()
        .create_branch(project.project_id, "feature", None, &cancel)
        .await
        .unwrap();

    let at_base = engine
        .materializer()
        .materialize_collection(feature.branch_id, "users", Some(feature.base_lsn), &cancel)
        .await
        .unwrap();
    let parent_at_fork = engine
        .materializer()
        .materialize_collection(main.branch_id, "users", Some(feature.fork_lsn.unwrap()), &cancel)
        .await
        .unwrap();
    assert_eq!(*at_base, *parent_at_fork);
}

#[tokio::test]
async fn updates_and_deletes_of_missing_documents_are_no_ops() {
    let engine = engine().await;
    let cancel = CancellationToken::new();

    engine.registry().create_project("p1", &cancel).await.unwrap();
    let main = engine.resolve_branch("p1", MAIN_BRANCH).await.unwrap();
    let branch_id = main.branch_id;

    engine
        .interceptor()
        .update_one(
            branch_id,
            "users",
            id("ghost"),
            DocumentDelta::new().set("n", json!(1)),
            &cancel,
        )
        .await
        .unwrap();
    engine
        .interceptor()
        .delete_one(branch_id, "users", id("ghost"), &cancel)
        .await
        .unwrap();

    let state = engine
        .materializer()
        .materialize_collection(branch_id, "users", None, &cancel)
        .await
        .unwrap();
    assert!(state.is_empty());
}

#[tokio::test]
async fn lsn_at_time_clamps_to_branch_window() {
    let engine = engine().await;
    let cancel = CancellationToken::new();

    engine.registry().create_project("p1", &cancel).await.unwrap();
    let main = engine.resolve_branch("p1", MAIN_BRANCH).await.unwrap();
    engine
        .interceptor()
        .insert_one(main.branch_id, "users", doc(json!({"_id": "a"})), &cancel)
        .await
        .unwrap();
    let main = engine.resolve_branch("p1", MAIN_BRANCH).await.unwrap();

    let ancient = main.created_at - chrono::Duration::hours(1);
    let future = main.created_at + chrono::Duration::hours(1);

    let floor = engine
        .time_travel()
        .lsn_at_time(main.branch_id, ancient, &cancel)
        .await
        .unwrap();
    assert_eq!(floor, main.base_lsn);

    let ceiling = engine
        .time_travel()
        .lsn_at_time(main.branch_id, future, &cancel)
        .await
        .unwrap();
    assert_eq!(ceiling, main.head_lsn);
}

#[tokio::test]
async fn out_of_range_targets_are_rejected() {
    let engine = engine().await;
    let cancel = CancellationToken::new();

    engine.registry().create_project("p1", &cancel).await.unwrap();
    let main = engine.resolve_branch("p1", MAIN_BRANCH).await.unwrap();

    let beyond = engine
        .materializer()
        .materialize_collection(main.branch_id, "users", Some(Lsn::new(99)), &cancel)
        .await;
    assert!(matches!(beyond, Err(CoreError::OutOfRange { .. })));

    let below_base = engine
        .restore()
        .reset_branch(main.branch_id, Lsn::ZERO, &cancel)
        .await;
    assert!(matches!(below_base, Err(CoreError::OutOfRange { .. })));

    let unknown = engine
        .materializer()
        .materialize_collection(BranchId::new(), "users", None, &cancel)
        .await;
    assert!(matches!(unknown, Err(CoreError::NotFound { .. })));
}
