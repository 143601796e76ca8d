//! Statement dispatch and session teardown

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use tessera::handler::ResponseHandler;
use tessera::pool::{BackendConnection, ConnectionError, ConnectionState};
use tessera::protocol::error_code::{ER_BAD_DB_ERROR, ER_NO_DB_ERROR, ER_YES};
use tessera::protocol::OkPacket;
use tessera::session::{RouteResult, Session, ShardTarget, SqlType};

use crate::{
    config, data_source, eof, err, error_code, ok, result_set, start, wait_for, MockFactory,
    RecordingFrontend, Reply,
};

fn select_script() -> Arc<MockFactory> {
    MockFactory::new(|_, sql| {
        if sql.starts_with("select * from missing") {
            Reply::Packets(vec![err(1146, "Table 'missing' doesn't exist")])
        } else if sql.starts_with("select") {
            Reply::Packets(result_set(&["x"]))
        } else {
            Reply::Packets(vec![ok(0, 0)])
        }
    })
}

fn single(node: &str, sql: &str) -> RouteResult {
    RouteResult::new(vec![ShardTarget::new(node, sql)], SqlType::classify(sql))
}

#[tokio::test]
async fn test_single_select_streams_renumbered() {
    let factory = MockFactory::new(|_, sql| {
        if sql.starts_with("select") {
            Reply::Packets(vec![
                Bytes::from_static(&[0x02]),
                Bytes::from_static(b"\x03defid"),
                Bytes::from_static(b"\x03defname"),
                eof(),
                Bytes::from_static(b"\x011\x03ann"),
                Bytes::from_static(b"\x012\x03bob"),
                eof(),
            ])
        } else {
            Reply::Packets(vec![ok(0, 0)])
        }
    });
    let pools = start(&config(&[("dn_s", &["ds_s"])]), &factory).await;
    let front = RecordingFrontend::new(true);
    let session = Session::new(front.clone(), Arc::clone(&pools));

    session.execute(single("dn_s", "select id, name from t"));
    wait_for("result set", || front.packets().len() == 7).await;

    let packets = front.packets();
    let ids: Vec<u8> = packets.iter().map(|p| p.sequence_id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5, 6, 7]);
    assert_eq!(&packets[0].payload[..], &[0x02]);
    assert_eq!(&packets[1].payload[..], b"\x03defid");
    assert_eq!(&packets[2].payload[..], b"\x03defname");
    assert_eq!(packets[3].kind(), Some(0xFE));
    assert_eq!(&packets[4].payload[..], b"\x011\x03ann");
    assert_eq!(&packets[5].payload[..], b"\x012\x03bob");
    assert_eq!(packets[6].kind(), Some(0xFE));

    // Autocommit client: the connection goes straight back to the pool
    assert_eq!(session.bound_count(), 0);
    let source = &pools.node("dn_s").unwrap().sources()[0];
    assert_eq!(source.idle_count(), 1);
    assert_eq!(source.total(), 1);
}

#[tokio::test]
async fn test_single_backend_error_forwarded() {
    let factory = select_script();
    let pools = start(&config(&[("dn_e", &["ds_e"])]), &factory).await;
    let front = RecordingFrontend::new(true);
    let session = Session::new(front.clone(), Arc::clone(&pools));

    session.execute(single("dn_e", "select * from missing"));
    wait_for("error", || front.packets().len() == 1).await;

    let packets = front.packets();
    assert_eq!(packets[0].sequence_id, 1);
    assert_eq!(error_code(&packets[0]), Some(1146));
    assert_eq!(session.bound_count(), 0);
    assert_eq!(pools.node("dn_e").unwrap().sources()[0].idle_count(), 1);
}

#[tokio::test]
async fn test_unknown_node_and_empty_route() {
    let factory = select_script();
    let pools = start(&config(&[("dn_u", &["ds_u"])]), &factory).await;
    let front = RecordingFrontend::new(true);
    let session = Session::new(front.clone(), Arc::clone(&pools));

    session.execute(single("dn_missing", "select 1"));
    session.execute(RouteResult::new(Vec::new(), SqlType::Select));

    let packets = front.packets();
    assert_eq!(packets.len(), 2);
    assert_eq!(error_code(&packets[0]), Some(ER_BAD_DB_ERROR));
    assert!(String::from_utf8_lossy(&packets[0].payload).contains("dn_missing"));
    assert_eq!(error_code(&packets[1]), Some(ER_NO_DB_ERROR));
    assert!(packets.iter().all(|p| p.sequence_id == 1));
}

#[tokio::test]
async fn test_multi_select_merges_result_sets() {
    let factory = select_script();
    let pools = start(&config(&[("dn_a", &["ds_a"]), ("dn_b", &["ds_b"])]), &factory).await;
    let front = RecordingFrontend::new(true);
    let session = Session::new(front.clone(), Arc::clone(&pools));

    session.execute(RouteResult::broadcast(&["dn_a", "dn_b"], "select name from t"));
    wait_for("merged result", || front.packets().len() == 6).await;

    let packets = front.packets();
    let ids: Vec<u8> = packets.iter().map(|p| p.sequence_id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);
    // One set of column definitions, both shards' rows, one terminating EOF
    assert_eq!(&packets[0].payload[..], &[0x01]);
    assert_eq!(packets.iter().filter(|p| &p.payload[..] == b"\x01x").count(), 2);
    assert_eq!(packets[5].kind(), Some(0xFE));

    assert_eq!(session.bound_count(), 0);
    for node in ["dn_a", "dn_b"] {
        assert_eq!(pools.node(node).unwrap().sources()[0].idle_count(), 1);
    }
}

#[tokio::test]
async fn test_multi_write_commits_under_client_autocommit() {
    let factory = MockFactory::new(|source, sql| {
        if sql.starts_with("update") {
            let reply = if source == "ds_wa" { ok(2, 7) } else { ok(3, 5) };
            Reply::Packets(vec![reply])
        } else {
            Reply::Packets(vec![ok(0, 0)])
        }
    });
    let pools = start(&config(&[("dn_wa", &["ds_wa"]), ("dn_wb", &["ds_wb"])]), &factory).await;
    let front = RecordingFrontend::new(true);
    let session = Session::new(front.clone(), Arc::clone(&pools));

    session.execute(RouteResult::new(
        vec![
            ShardTarget::new("dn_wa", "update t set v = 1 where id = 1"),
            ShardTarget::new("dn_wb", "update t set v = 1 where id = 2"),
        ],
        SqlType::Update,
    ));
    wait_for("merged ok", || front.packets().len() == 1).await;

    let packets = front.packets();
    assert_eq!(packets[0].sequence_id, 1);
    let merged = OkPacket::parse(&packets[0].payload).unwrap();
    assert_eq!(merged.affected_rows, 5);
    assert_eq!(merged.last_insert_id, 5);
    assert_eq!(front.last_insert_id(), 5);

    // The write ran in a transaction and was committed on both shards
    assert_eq!(factory.count("ds_wa", "SET names utf8, autocommit=0"), 1);
    assert_eq!(factory.count("ds_wa", "commit"), 1);
    assert_eq!(factory.count("ds_wb", "commit"), 1);
    wait_for("release", || session.bound_count() == 0).await;
}

#[tokio::test]
async fn test_kill_during_terminate() {
    let factory = MockFactory::new(|_, sql| {
        if sql.contains("sleep") {
            Reply::Silent
        } else {
            Reply::Packets(vec![ok(1, 0)])
        }
    });
    let pools = start(&config(&[("dn_k", &["ds_k"]), ("dn_k2", &["ds_k2"])]), &factory).await;
    let front = RecordingFrontend::new(false);
    let session = Session::new(front.clone(), Arc::clone(&pools));

    // An idle binding left by an open transaction
    session.execute(single("dn_k2", "insert into t values (1)"));
    wait_for("insert ok", || front.packets().len() == 1).await;
    assert_eq!(session.bound_count(), 1);

    let target = ShardTarget::new("dn_k", "select sleep(100)");
    session.execute(RouteResult::new(vec![target.clone()], SqlType::Select));
    wait_for("statement sent", || factory.count("ds_k", "select sleep(100)") == 1).await;
    let killee = session.bound_connection(&target).unwrap();
    assert!(killee.is_running());
    assert_eq!(session.bound_count(), 2);

    front.close();
    session.terminate();
    assert!(session.is_terminating());
    // A second teardown request while the first is in flight does nothing
    session.terminate();

    wait_for("terminate chain", || !session.is_terminating()).await;
    assert_eq!(factory.count("ds_k", &format!("KILL {}", killee.thread_id())), 1);
    assert!(killee.is_closed());
    assert_eq!(session.bound_count(), 0);
    // The idle binding was rolled back, not closed
    wait_for("rollback", || factory.count("ds_k2", "rollback") == 1).await;
    wait_for("idle released", || {
        pools.node("dn_k2").unwrap().sources()[0].idle_count() == 1
    })
    .await;

    let packets = front.packets();
    assert_eq!(packets.len(), 2);
    assert_eq!(error_code(&packets[1]), Some(ER_YES));

    // The killer connection went back to the pool
    wait_for("killer released", || {
        pools.node("dn_k").unwrap().sources()[0].idle_count() == 1
    })
    .await;
}

#[tokio::test]
async fn test_terminate_idle_session_clears_bindings() {
    let factory = MockFactory::new(|_, _| Reply::Packets(vec![ok(1, 0)]));
    let pools = start(&config(&[("dn_t", &["ds_t"])]), &factory).await;
    let front = RecordingFrontend::new(false);
    let session = Session::new(front.clone(), Arc::clone(&pools));

    // Non-autocommit client: the connection stays bound after the write
    session.execute(single("dn_t", "insert into t values (1)"));
    wait_for("ok", || front.packets().len() == 1).await;
    assert_eq!(session.bound_count(), 1);

    session.terminate();
    wait_for("terminate chain", || !session.is_terminating()).await;
    assert_eq!(session.bound_count(), 0);
    // Uncommitted work is rolled back before the connection is reused
    wait_for("rollback", || factory.count("ds_t", "rollback") == 1).await;
    wait_for("released", || {
        pools.node("dn_t").unwrap().sources()[0].idle_count() == 1
    })
    .await;
}

#[derive(Default)]
struct Grab {
    conn: Mutex<Option<Arc<BackendConnection>>>,
}

impl ResponseHandler for Grab {
    fn connection_acquired(&self, conn: Arc<BackendConnection>) {
        *self.conn.lock() = Some(conn);
    }

    fn connection_error(&self, _err: ConnectionError, _conn: Option<&Arc<BackendConnection>>) {}

    fn ok_packet(&self, _ok: Bytes, _conn: &Arc<BackendConnection>) {}

    fn error_packet(&self, _err: Bytes, _conn: &Arc<BackendConnection>) {}

    fn fields_end(&self, _header: Bytes, _fields: Vec<Bytes>, _eof: Bytes, _conn: &Arc<BackendConnection>) {}

    fn row_acquired(&self, _row: Bytes, _conn: &Arc<BackendConnection>) {}

    fn row_end(&self, _eof: Bytes, _conn: &Arc<BackendConnection>) {}
}

#[tokio::test]
async fn test_release_and_close_are_idempotent() {
    let factory = select_script();
    let pools = start(&config(&[("dn_i", &["ds_i"])]), &factory).await;
    let node = pools.node("dn_i").unwrap();
    let source = Arc::clone(&node.sources()[0]);
    assert_eq!(source.total(), 1);

    let grab = Arc::new(Grab::default());
    node.get_connection(Arc::clone(&grab) as Arc<dyn ResponseHandler>, None).unwrap();
    let conn = grab.conn.lock().take().unwrap();
    assert_eq!(conn.state(), ConnectionState::InUse);
    assert_eq!(source.idle_count(), 0);

    conn.release();
    conn.release();
    assert_eq!(conn.state(), ConnectionState::Idle);
    assert_eq!(source.idle_count(), 1);

    node.get_connection(Arc::clone(&grab) as Arc<dyn ResponseHandler>, None).unwrap();
    let conn = grab.conn.lock().take().unwrap();
    conn.close("first");
    conn.close("second");
    conn.quit();
    conn.release();
    assert!(conn.is_closed());
    assert_eq!(source.total(), 0);
    assert_eq!(source.idle_count(), 0);
    assert!(conn.write(tessera::protocol::command::quit()).is_err());

    // A connection outside any pool is just closed
    let detached = {
        use tessera::pool::ConnectionFactory;
        factory.connect(&data_source("ds_i"), std::sync::Weak::new()).await.unwrap()
    };
    detached.close("done");
    detached.close("again");
    assert!(detached.is_closed());
}
