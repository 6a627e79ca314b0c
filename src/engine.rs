/*!
 * Command Engine
 *
 * The collaborator the worker hands complete input off to. The trait is
 * the byte-level boundary: the worker never interprets frames, the engine
 * never touches fd lifetime. RespEngine is the concrete engine: storage
 * commands against the in-memory dictionary, plus the administrative
 * commands (CLIENT, MONITOR) that reach back into the worker layer.
 */

use crate::aof::AofHandle;
use crate::conn::{Connection, FLAG_CLOSE_AFTER_REPLY};
use crate::protocol::{
    encode_argv, parse_many, resp_array, resp_bulk, resp_error, resp_integer, resp_null,
    resp_simple, Argv,
};
use crate::storage::{Dict, Value};
use crate::worker::Worker;
use anyhow::Result;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::sync::Arc;

/// Boundary between the worker core and command execution.
///
/// Called on the owning worker's thread with no worker-local lock held,
/// so implementations are free to call back into the Worker (become
/// monitor, monitor feed, kill, client list).
pub trait CommandEngine: Send + Sync {
    /// Consume the complete frames in `input`, appending replies to the
    /// connection's output buffer. A trailing partial frame stays in
    /// `input` for the next read.
    fn dispatch(
        &self,
        worker: &Arc<Worker>,
        conn: &Arc<Connection>,
        input: &mut BytesMut,
    ) -> Result<()>;
}

fn lossy(b: &[u8]) -> String {
    String::from_utf8_lossy(b).into_owned()
}

fn wrong_args(cmd: &str) -> Vec<u8> {
    resp_error(&format!("wrong number of arguments for '{cmd}' command"))
}

/// The RESP command engine
pub struct RespEngine {
    dict: Mutex<Dict>,
    aof: Option<AofHandle>,
}

impl RespEngine {
    pub fn new(aof: Option<AofHandle>) -> RespEngine {
        RespEngine {
            dict: Mutex::new(Dict::default()),
            aof,
        }
    }

    /// Log an executed write command to the AOF, when enabled.
    fn propagate(&self, argv: &[Vec<u8>]) {
        if let Some(aof) = &self.aof {
            aof.write(&encode_argv(argv));
        }
    }

    fn execute(&self, worker: &Arc<Worker>, conn: &Arc<Connection>, argv: Argv) {
        let name = String::from_utf8_lossy(&argv[0]).to_ascii_lowercase();
        conn.set_last_cmd(&name);
        conn.touch();

        // Trace the command to monitors everywhere before executing it.
        // No worker-local lock is held here.
        let ctx = worker.context();
        if ctx.monitor_count() > 0 {
            let tokens: Vec<String> = argv.iter().map(|a| lossy(a)).collect();
            ctx.feed_monitors(conn, &tokens);
        }

        let reply = match name.as_str() {
            "ping" => resp_simple("PONG"),

            "get" => {
                if argv.len() != 2 {
                    wrong_args("get")
                } else {
                    match self.dict.lock().get(&argv[1]) {
                        Some(Value::Str(v)) => resp_bulk(v),
                        Some(Value::Int(i)) => resp_integer(*i),
                        None => resp_null(),
                    }
                }
            }

            "set" => {
                if argv.len() != 3 {
                    wrong_args("set")
                } else {
                    self.propagate(&argv);
                    let mut it = argv.into_iter().skip(1);
                    if let (Some(k), Some(v)) = (it.next(), it.next()) {
                        self.dict.lock().set(k, Value::Str(v));
                    }
                    resp_simple("OK")
                }
            }

            "del" => {
                if argv.len() != 2 {
                    wrong_args("del")
                } else {
                    let removed = self.dict.lock().del(&argv[1]);
                    if removed {
                        self.propagate(&argv);
                    }
                    resp_integer(removed as i64)
                }
            }

            "rename" => {
                if argv.len() != 3 {
                    wrong_args("rename")
                } else {
                    let ok = self.dict.lock().rename(argv[1].clone(), argv[2].clone());
                    if ok {
                        self.propagate(&argv);
                        resp_simple("OK")
                    } else {
                        resp_error("no such key")
                    }
                }
            }

            "exists" => {
                if argv.len() != 2 {
                    wrong_args("exists")
                } else {
                    resp_integer(self.dict.lock().exists(&argv[1]) as i64)
                }
            }

            "incr" => {
                if argv.len() != 2 {
                    wrong_args("incr")
                } else {
                    match self.dict.lock().incr(&argv[1]) {
                        Ok(v) => {
                            self.propagate(&argv);
                            resp_integer(v)
                        }
                        Err(e) => resp_error(&e.to_string()),
                    }
                }
            }

            "mget" => {
                if argv.len() < 2 {
                    wrong_args("mget")
                } else {
                    let dict = self.dict.lock();
                    let mut items = Vec::with_capacity(argv.len() - 1);
                    for k in &argv[1..] {
                        items.push(match dict.get(k) {
                            Some(Value::Str(v)) => resp_bulk(v),
                            Some(Value::Int(i)) => resp_integer(*i),
                            None => resp_null(),
                        });
                    }
                    resp_array(items)
                }
            }

            "mset" => {
                // key-value pairs after the command name
                if argv.len() < 3 || argv.len() % 2 == 0 {
                    wrong_args("mset")
                } else {
                    self.propagate(&argv);
                    let mut dict = self.dict.lock();
                    let mut it = argv.into_iter().skip(1);
                    while let (Some(k), Some(v)) = (it.next(), it.next()) {
                        dict.set(k, Value::Str(v));
                    }
                    resp_simple("OK")
                }
            }

            "quit" => {
                conn.enable_flag(FLAG_CLOSE_AFTER_REPLY);
                resp_simple("OK")
            }

            "monitor" => {
                // go through the connection's back reference; the owner is
                // the worker running this dispatch
                let owner = conn.owner();
                owner.as_ref().unwrap_or(worker).become_monitor_conn(conn);
                resp_simple("OK")
            }

            "client" => self.client_command(worker, conn, &argv),

            _ => resp_error(&format!("unknown command '{name}'")),
        };

        conn.enqueue(&reply);
    }

    fn client_command(&self, worker: &Arc<Worker>, conn: &Arc<Connection>, argv: &Argv) -> Vec<u8> {
        if argv.len() < 2 {
            return wrong_args("client");
        }
        let ctx = worker.context();
        let sub = String::from_utf8_lossy(&argv[1]).to_ascii_lowercase();
        match sub.as_str() {
            "id" if argv.len() == 2 => resp_integer(conn.id() as i64),

            "getname" if argv.len() == 2 => resp_bulk(conn.name().as_bytes()),

            "setname" if argv.len() == 3 => {
                let name = lossy(&argv[2]);
                if name.chars().any(|c| c.is_whitespace()) {
                    resp_error("Client names cannot contain spaces, newlines or special characters.")
                } else {
                    conn.set_name(&name);
                    resp_simple("OK")
                }
            }

            "list" if argv.len() == 2 => resp_bulk(ctx.all_clients_str().as_bytes()),

            "kill" => match argv.len() {
                // CLIENT KILL <addr>: legacy form, can kill the caller
                3 => {
                    let addr = lossy(&argv[2]);
                    let killed = ctx.kill_client_all(Some(conn), 0, &addr, false);
                    if killed > 0 {
                        resp_simple("OK")
                    } else {
                        resp_error("No such client")
                    }
                }
                // CLIENT KILL ID <id> | ADDR <addr>: filter form, skips the caller
                4 => {
                    let filter = String::from_utf8_lossy(&argv[2]).to_ascii_lowercase();
                    match filter.as_str() {
                        "id" => match lossy(&argv[3]).parse::<u64>() {
                            Ok(id) if id > 0 => {
                                resp_integer(ctx.kill_client_all(Some(conn), id, "", true))
                            }
                            _ => resp_error("client-id should be greater than 0"),
                        },
                        "addr" => {
                            let addr = lossy(&argv[3]);
                            resp_integer(ctx.kill_client_all(Some(conn), 0, &addr, true))
                        }
                        _ => resp_error("syntax error"),
                    }
                }
                _ => wrong_args("client|kill"),
            },

            _ => resp_error(&format!(
                "unknown CLIENT subcommand or wrong number of arguments for '{sub}'"
            )),
        }
    }
}

impl CommandEngine for RespEngine {
    fn dispatch(
        &self,
        worker: &Arc<Worker>,
        conn: &Arc<Connection>,
        input: &mut BytesMut,
    ) -> Result<()> {
        let mut frames: Vec<Argv> = Vec::new();
        if let Err(e) = parse_many(input, &mut frames) {
            // The input stream is unrecoverable: answer once, then close.
            conn.enqueue(&resp_error(&format!("protocol error: {e}")));
            conn.enable_flag(FLAG_CLOSE_AFTER_REPLY);
            input.clear();
            return Ok(());
        }
        for argv in frames {
            if argv.is_empty() {
                continue;
            }
            self.execute(worker, conn, argv);
            if conn.has_flag(FLAG_CLOSE_AFTER_REPLY) {
                break;
            }
        }
        Ok(())
    }
}
