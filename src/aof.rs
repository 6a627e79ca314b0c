/*!
 * Append-Only File (AOF) Persistence
 *
 * Executed write commands are re-encoded in their RESP request form and
 * logged to a file by a dedicated writer thread, so the reactor threads
 * never block on disk I/O. The file is flushed and synced once per second.
 */

use anyhow::{Context, Result};
use crossbeam::channel::{unbounded, Sender};
use std::io::Write;
use std::time::{Duration, Instant};

/// Handle for writing to the AOF
///
/// Cloneable; commands are sent to the background writer over a channel
/// and this call never blocks.
#[derive(Clone)]
pub struct AofHandle {
    tx: Sender<Vec<u8>>,
}

impl AofHandle {
    /// Queue RESP-encoded command bytes for appending.
    #[inline]
    pub fn write(&self, bytes: &[u8]) {
        // Ignore send errors: the writer thread only exits at shutdown
        let _ = self.tx.send(bytes.to_vec());
    }
}

/// Spawn the background AOF writer thread.
///
/// The file is opened in append mode before the thread starts, so an
/// unwritable path surfaces to the caller instead of killing the writer.
pub fn spawn_aof_writer(path: &str) -> Result<AofHandle> {
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open aof file {path}"))?;

    let (tx, rx) = unbounded::<Vec<u8>>();

    std::thread::Builder::new()
        .name("aof-writer".into())
        .spawn(move || {
            let mut last_sync = Instant::now();
            loop {
                match rx.recv() {
                    Ok(buf) => {
                        let _ = f.write_all(&buf);
                        if last_sync.elapsed() >= Duration::from_millis(1000) {
                            let _ = f.flush();
                            let _ = f.sync_data();
                            last_sync = Instant::now();
                        }
                    }
                    // Channel closed, exit thread
                    Err(_) => break,
                }
            }
            let _ = f.flush();
            let _ = f.sync_data();
        })
        .context("failed to spawn aof writer thread")?;

    Ok(AofHandle { tx })
}
