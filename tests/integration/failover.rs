//! Data node initialisation, heartbeat and failover

use std::sync::Arc;
use std::time::Duration;

use tessera::health::HeartbeatStatus;
use tessera::metrics::metrics;
use tessera::protocol::error_code::ER_YES;
use tessera::session::{RouteResult, Session, ShardTarget, SqlType};

use crate::{
    config, err, error_code, ok, result_set, start, wait_for, MockFactory, RecordingFrontend,
    Reply,
};

fn select(node: &str) -> RouteResult {
    RouteResult::new(vec![ShardTarget::new(node, "select 1")], SqlType::Select)
}

#[tokio::test]
async fn test_heartbeat_failover_switches_once() {
    let factory = MockFactory::new(|source, sql| match (source, sql) {
        ("ds_hb_a", "select user()") => Reply::Packets(vec![err(2013, "Lost connection")]),
        (_, "select user()") => Reply::Packets(result_set(&["app@%"])),
        _ => Reply::Packets(vec![ok(0, 0)]),
    });
    let mut config = config(&[("dn_hb", &["ds_hb_a", "ds_hb_b"])]);
    config.data_nodes[0].heartbeat_sql = Some("select user()".to_string());
    config.data_nodes[0].heartbeat_retry = 2;
    let pools = start(&config, &factory).await;
    let node = Arc::clone(pools.node("dn_hb").unwrap());
    assert_eq!(node.active_index(), 0);
    assert!(!node.sources()[0].heartbeat().is_stopped());

    // Three consecutive failures exceed a retry budget of two
    for _ in 0..50 {
        node.do_heartbeat();
        tokio::time::sleep(Duration::from_millis(20)).await;
        if node.active_index() == 1 {
            break;
        }
    }
    assert_eq!(node.active_index(), 1);
    assert!(node.is_initialized());
    assert!(node.sources()[0].heartbeat().is_stopped());
    assert!(!node.sources()[1].heartbeat().is_stopped());
    assert_eq!(factory.count("ds_hb_a", "select user()"), 3);

    // The new active source is healthy; the node stays where it is
    for _ in 0..5 {
        node.do_heartbeat();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    wait_for("healthy probe", || node.heartbeat_status() == Some(HeartbeatStatus::Ok)).await;
    assert_eq!(node.active_index(), 1);
    assert!(metrics()
        .gather()
        .contains("tessera_datanode_switch_total{node=\"dn_hb\"} 1"));

    // Traffic follows the switch
    let front = RecordingFrontend::new(true);
    let session = Session::new(front.clone(), Arc::clone(&pools));
    session.execute(select("dn_hb"));
    wait_for("result", || front.packets().len() == 1).await;
    assert_eq!(factory.count("ds_hb_b", "select 1"), 1);
}

#[tokio::test]
async fn test_init_skips_unreachable_source() {
    let factory = MockFactory::new(|_, _| Reply::Packets(vec![ok(0, 0)]));
    factory.set_down("ds_sk_a", true);
    let pools = start(&config(&[("dn_sk", &["ds_sk_a", "ds_sk_b"])]), &factory).await;
    let node = pools.node("dn_sk").unwrap();
    assert!(node.is_initialized());
    assert_eq!(node.active_index(), 1);
    assert_eq!(node.sources()[1].idle_count(), 1);
    assert_eq!(node.sources()[0].total(), 0);

    let front = RecordingFrontend::new(true);
    let session = Session::new(front.clone(), Arc::clone(&pools));
    session.execute(select("dn_sk"));
    wait_for("ok", || front.packets().len() == 1).await;
    assert_eq!(factory.count("ds_sk_b", "select 1"), 1);
    assert_eq!(node.execute_count(), 1);
}

#[tokio::test]
async fn test_uninitialized_node_recovers_after_switch() {
    let factory = MockFactory::new(|_, _| Reply::Packets(vec![ok(0, 0)]));
    factory.set_down("ds_rc_a", true);
    factory.set_down("ds_rc_b", true);
    let pools = start(&config(&[("dn_rc", &["ds_rc_a", "ds_rc_b"])]), &factory).await;
    let node = Arc::clone(pools.node("dn_rc").unwrap());
    assert!(!node.is_initialized());

    let front = RecordingFrontend::new(true);
    let session = Session::new(front.clone(), Arc::clone(&pools));
    session.execute(select("dn_rc"));
    let packets = front.packets();
    assert_eq!(packets.len(), 1);
    assert_eq!(error_code(&packets[0]), Some(ER_YES));
    assert!(String::from_utf8_lossy(&packets[0].payload).contains("not initialized"));

    factory.set_down("ds_rc_b", false);
    assert!(!pools.switch_source("dn_missing", 1, "manual"));
    assert!(pools.switch_source("dn_rc", 1, "backup restored"));
    assert!(node.is_initialized());
    assert_eq!(node.active_index(), 1);
    // Already active
    assert!(!pools.switch_source("dn_rc", 1, "again"));

    let front = RecordingFrontend::new(true);
    let session = Session::new(front.clone(), Arc::clone(&pools));
    session.execute(select("dn_rc"));
    wait_for("ok", || front.packets().len() == 1).await;
    assert!(error_code(&front.packets()[0]).is_none());
}
