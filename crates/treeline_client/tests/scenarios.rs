//! End-to-end scenarios against the in-memory engine.

use std::thread;
use std::time::Duration;
use treeline_client::{ClientConfig, ClientError, Key, NativeBuffer, ShutdownReason, TxnOutcome};
use treeline_engine::status::{CALLINAFTERXIT, GVUNDEF, LVUNDEF, TPRETRYLIMIT};
use treeline_engine::MemoryEngineConfig;
use treeline_testkit::prelude::*;

#[test]
fn shrinking_a_buffer_discards_its_value() {
    let mut buffer = NativeBuffer::with_capacity(5).unwrap();
    buffer.set_value(b"hello").unwrap();
    assert_eq!(buffer.len_used().unwrap(), 5);

    buffer.allocate(3).unwrap();
    assert_eq!(buffer.len_alloc().unwrap(), 3);
    assert_eq!(buffer.value().unwrap(), b"");
}

#[test]
fn key_set_then_get() {
    with_conn(|conn| {
        let key = Key::from_parts("^hello", &["world"]).unwrap();
        key.set(conn, &NativeBuffer::from_value(b"Go world").unwrap()).unwrap();

        let mut value = NativeBuffer::with_capacity(64).unwrap();
        key.get(conn, &mut value).unwrap();
        assert_eq!(value.value().unwrap(), b"Go world");
        assert_eq!(key.data(conn).unwrap(), 1);
    });
}

#[test]
fn subscript_scan_from_empty_visits_siblings_in_order() {
    with_conn(|conn| {
        scenarios::greetings(conn).unwrap();

        let mut key = Key::new();
        key.allocate(16, 1, 32).unwrap();
        key.varname.set_value(b"^hello").unwrap();
        key.subs.set_element_value(0, b"").unwrap();
        key.subs.set_used_count(1).unwrap();

        let mut ret = NativeBuffer::with_capacity(32).unwrap();
        let mut seen = Vec::new();
        while key.subscript_next(conn, &mut ret).unwrap() {
            let sub = ret.value().unwrap();
            key.subs.set_element_value(0, &sub).unwrap();
            seen.push(String::from_utf8(sub).unwrap());
        }
        assert_eq!(seen, ["Winterfell", "shire", "world"]);
        // Exhaustion is stable.
        assert!(!key.subscript_next(conn, &mut ret).unwrap());
    });
}

#[test]
fn always_restarting_transaction_sees_restored_locals() {
    let tc = TestClient::with_config(MemoryEngineConfig::new().max_tp_restarts(4), ClientConfig::default());
    let conn = tc.conn();
    conn.var("attempt").unwrap().set("0").unwrap();
    conn.var("scratch").unwrap().set("untouched").unwrap();

    let mut calls = 0;
    let err = conn
        .transaction("restarts", &["attempt", "scratch"], |txn| {
            calls += 1;
            assert_eq!(txn.var("attempt")?.get()?, b"0");
            assert_eq!(txn.var("scratch")?.get()?, b"untouched");
            txn.var("attempt")?.incr("1")?;
            txn.var("scratch")?.set("dirty")?;
            Ok(TxnOutcome::Restart)
        })
        .unwrap_err();

    assert!(err.is(TPRETRYLIMIT));
    assert!(calls > 1, "callback ran {calls} times");
    assert_eq!(err.mnemonic(), Some("TPRETRYLIMIT"));
}

#[test]
fn tree_walk_is_depth_first_in_collation_order() {
    with_conn(|conn| {
        scenarios::populated_tree(conn, "^t", 2, 3).unwrap();
        let paths: Vec<String> = conn
            .var("^t")
            .unwrap()
            .tree()
            .map(|node| String::from_utf8(node.unwrap().get().unwrap()).unwrap())
            .collect();
        assert_eq!(
            paths,
            [
                "1", "1,1", "1,1,1", "1,1,2", "1,2", "1,2,1", "1,2,2", "2", "2,1", "2,1,1", "2,1,2", "2,2",
                "2,2,1", "2,2,2",
            ]
        );

        let last = conn.node("^t", &["2", "2", "2"]).unwrap();
        let back = last.tree_prev().unwrap().unwrap();
        assert_eq!(back.to_string(), "^t(2,2,1)");
    });
}

#[test]
fn rollback_inside_nested_transaction_keeps_outer_work() {
    with_conn(|conn| {
        conn.transaction("outer", &[], |outer| {
            outer.var("^ledger")?.set("outer")?;
            let inner = outer.transaction("inner", &[], |inner| {
                inner.node("^ledger", &["inner"])?.set("1")?;
                Ok(TxnOutcome::Rollback)
            })?;
            assert!(!inner);
            Ok(TxnOutcome::Commit)
        })
        .unwrap();

        let ledger = conn.var("^ledger").unwrap();
        assert_eq!(ledger.get().unwrap(), b"outer");
        assert!(ledger.has_value_only().unwrap());
    });
}

#[test]
fn commit_failures_reinvoke_the_callback() {
    with_test_client(|tc| {
        scenarios::accounts(&tc.conn(), 2, 10).unwrap();
        tc.engine.fail_next_commits(2);

        let conn = tc.conn();
        let mut calls = 0;
        let committed = conn
            .transaction_fast(&[], |txn| {
                calls += 1;
                txn.node("^acct", &["0"])?.incr("-5")?;
                txn.node("^acct", &["1"])?.incr("5")?;
                Ok(TxnOutcome::Commit)
            })
            .unwrap();
        assert!(committed);
        assert_eq!(calls, 3);
        assert_eq!(conn.node("^acct", &["0"]).unwrap().get_int().unwrap(), 5);
        assert_eq!(conn.node("^acct", &["1"]).unwrap().get_int().unwrap(), 15);
    });
}

#[test]
fn call_in_passes_arguments_and_returns_result() {
    with_test_client(|tc| {
        tc.engine.register_routine("join", |args: &[Vec<u8>]| Ok(args.join(&b'-')));
        let conn = tc.conn();
        assert_eq!(conn.call_in("join", &[b"a", b"b", b"c"]).unwrap(), b"a-b-c");
        assert_eq!(conn.call_in("join", &[]).unwrap(), b"");

        let too_many = vec![&b"x"[..]; 40];
        let err = conn.call_in("join", &too_many).unwrap_err();
        assert!(matches!(err, ClientError::ArgumentOverflow { .. }));
    });
}

#[test]
fn multi_lock_replaces_held_locks() {
    with_test_client(|tc| {
        let conn = tc.conn();
        let a = conn.node("^res", &["a"]).unwrap();
        let b = conn.node("^res", &["b"]).unwrap();

        assert!(conn.lock(Duration::from_secs(1), &[&a, &b]).unwrap());
        assert_eq!(tc.engine.lock_count(b"^res", &[b"a"]), 1);
        assert_eq!(tc.engine.lock_count(b"^res", &[b"b"]), 1);

        let contended = thread::scope(|s| {
            s.spawn(|| {
                let other = tc.conn();
                let b = other.node("^res", &["b"]).unwrap();
                other.lock(Duration::from_millis(20), &[&b]).unwrap()
            })
            .join()
            .unwrap()
        });
        assert!(!contended);

        assert!(conn.lock(Duration::from_secs(1), &[&a]).unwrap());
        assert_eq!(tc.engine.lock_count(b"^res", &[b"b"]), 0);
        assert!(conn.lock(Duration::ZERO, &[]).unwrap());
        assert_eq!(tc.engine.lock_count(b"^res", &[b"a"]), 0);
    });
}

#[test]
fn undefined_reads_carry_engine_messages() {
    with_conn(|conn| {
        let mut ret = NativeBuffer::with_capacity(8).unwrap();
        let global = Key::from_parts("^missing", &["x"]).unwrap().get(conn, &mut ret).unwrap_err();
        assert!(global.is(GVUNDEF));
        assert_eq!(global.mnemonic(), Some("GVUNDEF"));
        assert!(global.to_string().contains("^missing(\"x\")"), "{global}");

        let local = Key::from_parts("missing", &[] as &[&str]).unwrap().get(conn, &mut ret).unwrap_err();
        assert!(local.is(LVUNDEF));
        assert!(!conn.message(GVUNDEF).unwrap().is_empty());

        // Nodes read an undefined value as absent instead.
        assert_eq!(conn.var("missing").unwrap().lookup().unwrap(), None);
    });
}

#[test]
fn kill_locals_except_keeps_named_locals() {
    with_conn(|conn| {
        for name in ["keep", "drop", "other"] {
            conn.var(name).unwrap().set("1").unwrap();
        }
        conn.var("^global").unwrap().set("1").unwrap();

        conn.kill_locals_except(&["keep"]).unwrap();
        assert!(conn.var("keep").unwrap().has_value().unwrap());
        assert!(conn.var("drop").unwrap().has_none().unwrap());
        assert!(conn.var("other").unwrap().has_none().unwrap());
        assert!(conn.var("^global").unwrap().has_value().unwrap());

        conn.kill_all_locals().unwrap();
        assert!(conn.var("keep").unwrap().has_none().unwrap());
    });
}

#[test]
fn connections_fail_after_shutdown() {
    let tc = TestClient::new();
    let conn = tc.conn();
    conn.var("^x").unwrap().set("1").unwrap();
    tc.shutdown(ShutdownReason::Normal).unwrap();

    let err = conn.var("^x").unwrap().get().unwrap_err();
    assert!(err.is(CALLINAFTERXIT));
}
