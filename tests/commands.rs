//! Command-surface tests: the storage commands and the error paths of the
//! RESP engine, driven over real TCP.

mod common;

use common::*;
use emberd::Config;

#[test]
fn set_get_del_cycle() {
    let tw = start_worker(Config::default());
    let mut s = connect(tw.addr());
    assert_eq!(cmd(&mut s, &["SET", "a", "1"]), "+OK");
    assert_eq!(cmd(&mut s, &["GET", "a"]), "1");
    assert_eq!(cmd(&mut s, &["DEL", "a"]), ":1");
    assert_eq!(cmd(&mut s, &["DEL", "a"]), ":0");
    assert_eq!(cmd(&mut s, &["GET", "a"]), "$-1");
}

#[test]
fn rename_exists_incr() {
    let tw = start_worker(Config::default());
    let mut s = connect(tw.addr());
    assert_eq!(cmd(&mut s, &["SET", "x", "41"]), "+OK");
    assert_eq!(cmd(&mut s, &["EXISTS", "x"]), ":1");
    assert_eq!(cmd(&mut s, &["INCR", "x"]), ":42");
    assert_eq!(cmd(&mut s, &["RENAME", "x", "y"]), "+OK");
    assert_eq!(cmd(&mut s, &["EXISTS", "x"]), ":0");
    assert_eq!(cmd(&mut s, &["GET", "y"]), ":42");
    assert_eq!(
        cmd(&mut s, &["RENAME", "gone", "z"]),
        "-ERR no such key"
    );
}

#[test]
fn incr_rejects_non_numeric_values() {
    let tw = start_worker(Config::default());
    let mut s = connect(tw.addr());
    assert_eq!(cmd(&mut s, &["SET", "k", "abc"]), "+OK");
    assert_eq!(
        cmd(&mut s, &["INCR", "k"]),
        "-ERR value is not an integer or out of range"
    );
    assert_eq!(cmd(&mut s, &["INCR", "fresh"]), ":1");
    assert_eq!(cmd(&mut s, &["INCR", "fresh"]), ":2");
}

#[test]
fn mset_and_mget() {
    let tw = start_worker(Config::default());
    let mut s = connect(tw.addr());
    assert_eq!(cmd(&mut s, &["MSET", "k1", "v1", "k2", "v2"]), "+OK");
    assert_eq!(cmd(&mut s, &["MGET", "k1", "missing", "k2"]), "v1,$-1,v2");
    assert_eq!(
        cmd(&mut s, &["MSET", "k1", "v1", "dangling"]),
        "-ERR wrong number of arguments for 'mset' command"
    );
}

#[test]
fn pipelined_commands_reply_in_order() {
    let tw = start_worker(Config::default());
    let mut s = connect(tw.addr());
    let mut batch = Vec::new();
    batch.extend_from_slice(&encode(&["SET", "p", "1"]));
    batch.extend_from_slice(&encode(&["INCR", "p"]));
    batch.extend_from_slice(&encode(&["GET", "p"]));
    std::io::Write::write_all(&mut s, &batch).expect("write batch");
    assert_eq!(read_reply(&mut s), "+OK");
    assert_eq!(read_reply(&mut s), ":2");
    assert_eq!(read_reply(&mut s), ":2");
}

#[test]
fn unknown_command_and_bad_arity() {
    let tw = start_worker(Config::default());
    let mut s = connect(tw.addr());
    assert_eq!(cmd(&mut s, &["FLY"]), "-ERR unknown command 'fly'");
    assert_eq!(
        cmd(&mut s, &["GET"]),
        "-ERR wrong number of arguments for 'get' command"
    );
    // The connection survives command errors.
    assert_eq!(cmd(&mut s, &["PING"]), "+PONG");
}

#[test]
fn protocol_error_closes_the_connection() {
    let tw = start_worker(Config::default());
    let mut s = connect(tw.addr());
    assert_eq!(cmd(&mut s, &["PING"]), "+PONG");
    std::io::Write::write_all(&mut s, b"NONSENSE\r\n").expect("write garbage");
    assert_eq!(read_reply(&mut s), "-ERR protocol error: expected array");
    assert_eof(&mut s);
    wait_until(|| tw.ctx.client_count() == 0, "connection teardown");
}

#[test]
fn quit_closes_after_the_reply() {
    let tw = start_worker(Config::default());
    let mut s = connect(tw.addr());
    assert_eq!(cmd(&mut s, &["QUIT"]), "+OK");
    assert_eof(&mut s);
    wait_until(|| tw.ctx.client_count() == 0, "connection teardown");
}

#[test]
fn write_commands_are_propagated_to_the_aof() {
    use emberd::{spawn_aof_writer, RespEngine, ServerContext, Worker, WorkerThread};
    use std::sync::Arc;

    let path = std::env::temp_dir().join(format!("emberd-aof-{}.aof", std::process::id()));
    std::fs::remove_file(&path).ok();
    let aof = spawn_aof_writer(&path.to_string_lossy()).expect("aof writer");

    let mut config = Config::default();
    config.binds = vec!["127.0.0.1".to_string()];
    config.port = 0;
    let ctx = ServerContext::new(config, Arc::new(RespEngine::new(Some(aof))));
    let worker = Worker::new(Arc::clone(&ctx), false).expect("bind worker");
    ctx.register_worker(&worker);
    let mut thread = WorkerThread::new(Arc::clone(&worker));
    thread.start();

    let mut s = connect(worker.local_addrs()[0]);
    assert_eq!(cmd(&mut s, &["SET", "k", "v"]), "+OK");
    assert_eq!(cmd(&mut s, &["GET", "k"]), "v");

    // The writer thread appends asynchronously.
    wait_until(
        || {
            std::fs::read(&path)
                .map(|d| String::from_utf8_lossy(&d).contains("SET"))
                .unwrap_or(false)
        },
        "aof entry",
    );
    let text = String::from_utf8_lossy(&std::fs::read(&path).expect("read aof")).into_owned();
    assert!(text.contains("*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n"), "aof was {text:?}");
    // Reads are never logged.
    assert!(!text.contains("GET"));

    thread.stop();
    thread.join();
    std::fs::remove_file(&path).ok();
}

#[test]
fn setname_is_reflected_in_the_client_list() {
    let tw = start_worker(Config::default());
    let mut s = connect(tw.addr());
    assert_eq!(cmd(&mut s, &["CLIENT", "GETNAME"]), "");
    assert_eq!(cmd(&mut s, &["CLIENT", "SETNAME", "worker-bee"]), "+OK");
    assert_eq!(cmd(&mut s, &["CLIENT", "GETNAME"]), "worker-bee");
    assert_eq!(
        cmd(&mut s, &["CLIENT", "SETNAME", "two words"]),
        "-ERR Client names cannot contain spaces, newlines or special characters."
    );

    let list = cmd(&mut s, &["CLIENT", "LIST"]);
    assert!(list.contains("name=worker-bee"), "list was {list:?}");
}
