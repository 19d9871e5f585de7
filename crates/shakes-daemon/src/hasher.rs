//! Hasher client (§4.3): talks to the external `sphashd` worker over a
//! Unix socket, one line-oriented command per request, exactly as
//! `sphashd_client.c` does. Computing the Tiger Tree Hash itself is
//! out of scope here — that work happens in the external process;
//! this module only drives its wire protocol and bookkeeping.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use shakes_core::Tth;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Files submitted together in one `$filehash` batch before the
/// connection is flushed, matching `HASH_BATCH_SIZE` in the reference
/// client.
pub const HASH_BATCH_SIZE: usize = 100;

/// Microsecond delay injected between batches at each priority level,
/// lowest first (0 = as fast as possible, 4 = background).
pub const PRIO_DELAYS_US: [u64; 5] = [0, 10_000, 50_000, 100_000, 500_000];

#[derive(Error, Debug)]
pub enum HasherError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sphashd exited before responding")]
    WorkerGone,
    #[error("malformed response: {0}")]
    Malformed(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HashRequestId(pub u64);

/// A file waiting for its TTH, tracked so a late/duplicate response
/// from the worker can be matched back to the request that caused it.
struct Unfinished {
    id: HashRequestId,
    path: PathBuf,
}

pub enum HashOutcome {
    Hashed { id: HashRequestId, path: PathBuf, tth: Tth },
    Failed { id: HashRequestId, path: PathBuf },
}

/// Spawns (or connects to an already-running) `sphashd` and exposes a
/// simple submit/poll interface; the daemon's reactor owns one of
/// these directly, no locking required since it is only ever touched
/// from the single daemon loop.
pub struct HasherClient {
    stream: UnixStream,
    unfinished: VecDeque<Unfinished>,
    next_id: u64,
    priority: u8,
}

impl HasherClient {
    /// Spawn `sphashd_path`, have it connect back to a freshly bound
    /// Unix listener at `socket_path`, and accept that connection.
    /// Mirrors `io_exec_and_connect_unix`'s spawn-then-accept handshake.
    pub async fn spawn(
        sphashd_path: &Path,
        socket_path: &Path,
        working_directory: &Path,
    ) -> Result<Self, HasherError> {
        let _ = std::fs::remove_file(socket_path);
        let listener = UnixListener::bind(socket_path)?;

        let mut child = Command::new(sphashd_path)
            .arg("--socket")
            .arg(socket_path)
            .current_dir(working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()?;

        let (stream, _addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            status = child.wait() => {
                return Err(match status {
                    Ok(_) => HasherError::WorkerGone,
                    Err(e) => HasherError::Io(e),
                });
            }
        };

        Ok(Self { stream, unfinished: VecDeque::new(), next_id: 0, priority: 2 })
    }

    /// Test/in-process construction: wrap an already-connected socket
    /// pair instead of spawning a real worker process.
    pub fn from_stream(stream: UnixStream) -> Self {
        Self { stream, unfinished: VecDeque::new(), next_id: 0, priority: 2 }
    }

    pub fn set_priority(&mut self, priority: u8) {
        self.priority = priority.min(4);
    }

    pub fn delay(&self) -> std::time::Duration {
        std::time::Duration::from_micros(PRIO_DELAYS_US[self.priority as usize])
    }

    /// Queue up to [`HASH_BATCH_SIZE`] files for hashing in one write,
    /// returning the request ids assigned (in submission order).
    pub async fn submit_batch(&mut self, paths: &[PathBuf]) -> Result<Vec<HashRequestId>, HasherError> {
        let mut ids = Vec::with_capacity(paths.len().min(HASH_BATCH_SIZE));
        let mut buf = String::new();
        for path in paths.iter().take(HASH_BATCH_SIZE) {
            let id = HashRequestId(self.next_id);
            self.next_id += 1;
            ids.push(id);
            self.unfinished.push_back(Unfinished { id, path: path.clone() });
            buf.push_str(&format!("$filehash {}\n", path.display()));
        }
        self.stream.write_all(buf.as_bytes()).await?;
        self.stream.flush().await?;
        debug!("submitted {} files to hasher at priority {}", ids.len(), self.priority);
        Ok(ids)
    }

    /// Read and dispatch one worker response line. Matches the
    /// reference client's `hashd_cb_add_hash`/`hashd_cb_fail_hash`
    /// callback split: each response consumes exactly one
    /// `unfinished` entry (FIFO — the worker answers in submission
    /// order).
    pub async fn recv_one(&mut self) -> Result<HashOutcome, HasherError> {
        let mut reader = BufReader::new(&mut self.stream);
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(HasherError::WorkerGone);
        }
        let line = line.trim_end();

        let pending = self.unfinished.pop_front().ok_or_else(|| HasherError::Malformed(line.to_string()))?;

        if let Some(rest) = line.strip_prefix("$hash ") {
            let tth_str = rest.rsplit(' ').next().unwrap_or("");
            let tth = Tth::parse(tth_str).ok_or_else(|| HasherError::Malformed(line.to_string()))?;
            info!("hashed {:?}", pending.path);
            Ok(HashOutcome::Hashed { id: pending.id, path: pending.path, tth })
        } else if line.starts_with("$failed") {
            warn!("hashing failed for {:?}", pending.path);
            Ok(HashOutcome::Failed { id: pending.id, path: pending.path })
        } else {
            Err(HasherError::Malformed(line.to_string()))
        }
    }

    pub fn pending_count(&self) -> usize {
        self.unfinished.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submit_and_receive_hash_response() {
        let (client_sock, worker_sock) = UnixStream::pair().unwrap();
        let mut client = HasherClient::from_stream(client_sock);

        let mut worker = BufReader::new(worker_sock);
        let ids = client.submit_batch(&[PathBuf::from("/tmp/a.bin")]).await.unwrap();
        assert_eq!(ids.len(), 1);

        let mut line = String::new();
        worker.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("$filehash /tmp/a.bin"));

        let tth = Tth::from_raw([8; 24]);
        worker
            .get_mut()
            .write_all(format!("$hash /tmp/a.bin {}\n", tth.to_base32()).as_bytes())
            .await
            .unwrap();

        match client.recv_one().await.unwrap() {
            HashOutcome::Hashed { path, tth: got, .. } => {
                assert_eq!(path, PathBuf::from("/tmp/a.bin"));
                assert_eq!(got, tth);
            }
            HashOutcome::Failed { .. } => panic!("expected success"),
        }
    }

    #[tokio::test]
    async fn failed_response_is_reported() {
        let (client_sock, worker_sock) = UnixStream::pair().unwrap();
        let mut client = HasherClient::from_stream(client_sock);
        let mut worker = BufReader::new(worker_sock);

        client.submit_batch(&[PathBuf::from("/tmp/b.bin")]).await.unwrap();
        let mut line = String::new();
        worker.read_line(&mut line).await.unwrap();

        worker.get_mut().write_all(b"$failed /tmp/b.bin\n").await.unwrap();
        match client.recv_one().await.unwrap() {
            HashOutcome::Failed { path, .. } => assert_eq!(path, PathBuf::from("/tmp/b.bin")),
            HashOutcome::Hashed { .. } => panic!("expected failure"),
        }
    }

    #[test]
    fn priority_delays_match_reference_table() {
        assert_eq!(PRIO_DELAYS_US, [0, 10_000, 50_000, 100_000, 500_000]);
    }

    #[tokio::test]
    async fn set_priority_clamps_to_four() {
        let (client_sock, _worker) = UnixStream::pair().unwrap();
        let mut client = HasherClient::from_stream(client_sock);
        client.set_priority(9);
        assert_eq!(client.delay().as_micros() as u64, PRIO_DELAYS_US[4]);
    }
}
