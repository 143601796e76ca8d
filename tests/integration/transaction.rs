//! Commit and rollback across shards

use std::sync::Arc;
use std::time::Duration;

use tessera::protocol::OkPacket;
use tessera::session::{RouteResult, Session};

use crate::{config, err, error_code, ok, start, wait_for, MockFactory, RecordingFrontend, Reply};

const NODES: [(&str, &[&str]); 3] = [("dn_0", &["ds_0"]), ("dn_1", &["ds_1"]), ("dn_2", &["ds_2"])];

#[tokio::test]
async fn test_commit_failure_on_one_of_three_shards() {
    let factory = MockFactory::new(|source, sql| match (source, sql) {
        ("ds_1", "commit") => Reply::Packets(vec![err(1213, "Deadlock found when trying to get lock")]),
        (_, sql) if sql.starts_with("update") => Reply::Packets(vec![ok(1, 0)]),
        _ => Reply::Packets(vec![ok(0, 0)]),
    });
    let pools = start(&config(&NODES), &factory).await;
    let front = RecordingFrontend::new(false);
    let session = Session::new(front.clone(), Arc::clone(&pools));

    session.execute(RouteResult::broadcast(&["dn_0", "dn_1", "dn_2"], "update t set v = v + 1"));
    wait_for("write ok", || front.packets().len() == 1).await;
    let merged = OkPacket::parse(&front.packets()[0].payload).unwrap();
    assert_eq!(merged.affected_rows, 3);
    // Client transaction still open: every shard keeps its connection
    assert_eq!(session.bound_count(), 3);

    session.commit();
    wait_for("commit answer", || front.packets().len() == 2).await;
    let answer = &front.packets()[1];
    assert_eq!(answer.sequence_id, 1);
    assert_eq!(error_code(answer), Some(1213));

    // Shards are rolled back and returned to their pools
    wait_for("rollbacks", || {
        ["ds_0", "ds_1", "ds_2"]
            .iter()
            .all(|ds| factory.count(ds, "rollback") == 1)
    })
    .await;
    wait_for("released", || {
        ["dn_0", "dn_1", "dn_2"]
            .iter()
            .all(|dn| pools.node(dn).unwrap().sources()[0].idle_count() == 1)
    })
    .await;
    assert_eq!(session.bound_count(), 0);

    // Exactly one answer for the failed commit
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(front.packets().len(), 2);
}

#[tokio::test]
async fn test_commit_success_forwards_backend_ok() {
    let factory = MockFactory::new(|_, _| Reply::Packets(vec![ok(0, 0)]));
    let nodes = [("dn_c0", &["ds_c0"][..]), ("dn_c1", &["ds_c1"][..])];
    let pools = start(&config(&nodes), &factory).await;
    let front = RecordingFrontend::new(false);
    let session = Session::new(front.clone(), Arc::clone(&pools));

    session.execute(RouteResult::broadcast(&["dn_c0", "dn_c1"], "delete from t"));
    wait_for("write ok", || front.packets().len() == 1).await;

    session.commit();
    wait_for("commit ok", || front.packets().len() == 2).await;
    let answer = &front.packets()[1];
    assert_eq!(answer.sequence_id, 1);
    assert!(OkPacket::parse(&answer.payload).is_some());
    assert_eq!(session.bound_count(), 0);
    assert_eq!(factory.count("ds_c0", "commit"), 1);
    assert_eq!(factory.count("ds_c1", "commit"), 1);
}

#[tokio::test]
async fn test_rollback_closes_non_autocommit_connections() {
    let factory = MockFactory::new(|_, _| Reply::Packets(vec![ok(1, 0)]));
    let nodes = [("dn_r0", &["ds_r0"][..]), ("dn_r1", &["ds_r1"][..])];
    let pools = start(&config(&nodes), &factory).await;
    let front = RecordingFrontend::new(false);
    let session = Session::new(front.clone(), Arc::clone(&pools));

    session.execute(RouteResult::broadcast(&["dn_r0", "dn_r1"], "insert into t values (1)"));
    wait_for("write ok", || front.packets().len() == 1).await;
    assert_eq!(session.bound_count(), 2);
    let bound: Vec<_> = session
        .bound_targets()
        .iter()
        .filter_map(|t| session.bound_connection(t))
        .collect();
    assert!(bound.iter().all(|c| !c.is_autocommit()));

    session.rollback();
    wait_for("rollback ok", || front.packets().len() == 2).await;
    assert_eq!(front.packets()[1].sequence_id, 1);
    assert!(OkPacket::parse(&front.packets()[1].payload).is_some());
    assert_eq!(session.bound_count(), 0);
    assert_eq!(factory.count("ds_r0", "rollback"), 1);
    assert_eq!(factory.count("ds_r1", "rollback"), 1);

    // Connections left with autocommit off are not handed to the next client
    assert!(bound.iter().all(|c| c.is_closed()));
    for dn in ["dn_r0", "dn_r1"] {
        let source = &pools.node(dn).unwrap().sources()[0];
        assert_eq!(source.idle_count(), 0);
        assert_eq!(source.total(), 0);
    }
}

#[tokio::test]
async fn test_commit_without_bindings_answers_ok() {
    let factory = MockFactory::new(|_, _| Reply::Packets(vec![ok(0, 0)]));
    let pools = start(&config(&[("dn_n", &["ds_n"])]), &factory).await;
    let front = RecordingFrontend::new(false);
    let session = Session::new(front.clone(), Arc::clone(&pools));

    session.commit();
    session.rollback();

    let packets = front.packets();
    assert_eq!(packets.len(), 2);
    assert!(packets.iter().all(|p| p.sequence_id == 1));
    assert!(packets.iter().all(|p| OkPacket::parse(&p.payload).is_some()));
    assert!(factory.statements().is_empty());
}
