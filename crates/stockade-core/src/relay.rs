//! Stream Relay: concurrent line readers for the child's stdout and stderr

use crate::request::{StreamConsumer, emit_to};
use crate::{Result, StockadeError};
use parking_lot::Mutex;
use std::io::{BufRead, BufReader, Read};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

/// Which child stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    const fn is_stderr(self) -> bool {
        matches!(self, Self::Stderr)
    }

    const fn name(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

type LineBuffer = Arc<Mutex<Vec<String>>>;

/// Lines captured so far, in arrival order per stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

/// Two running readers plus their shared buffers
#[derive(Debug)]
pub struct StreamRelay {
    stdout: LineBuffer,
    stderr: LineBuffer,
    done_rx: Receiver<Stream>,
    pending: usize,
}

impl StreamRelay {
    /// Spawn one reader thread per stream
    pub fn start<O, E>(stdout: O, stderr: E, consumer: Option<StreamConsumer>) -> Result<Self>
    where
        O: Read + Send + 'static,
        E: Read + Send + 'static,
    {
        let (done_tx, done_rx) = mpsc::channel();
        let out_buf = LineBuffer::default();
        let err_buf = LineBuffer::default();

        spawn_reader(Stream::Stdout, stdout, Arc::clone(&out_buf), consumer.clone(), done_tx.clone())?;
        spawn_reader(Stream::Stderr, stderr, Arc::clone(&err_buf), consumer, done_tx)?;

        Ok(Self {
            stdout: out_buf,
            stderr: err_buf,
            done_rx,
            pending: 2,
        })
    }

    /// Copy of everything buffered so far
    #[must_use]
    pub fn snapshot(&self) -> Captured {
        Captured {
            stdout: self.stdout.lock().clone(),
            stderr: self.stderr.lock().clone(),
        }
    }

    /// Wait until both readers hit end-of-stream or `grace` elapses.
    ///
    /// Returns `true` if both readers finished.
    pub fn wait(&mut self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        while self.pending > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.done_rx.recv_timeout(remaining) {
                Ok(stream) => {
                    tracing::trace!(stream = stream.name(), "reader finished");
                    self.pending -= 1;
                }
                Err(RecvTimeoutError::Timeout) => return false,
                // Reader threads always signal before exiting; a closed channel
                // means both are gone.
                Err(RecvTimeoutError::Disconnected) => self.pending = 0,
            }
        }
        true
    }

    /// Wait up to `grace`, then take the buffers
    pub fn finish(mut self, grace: Duration) -> (Captured, bool) {
        let drained = self.wait(grace);
        if !drained {
            tracing::warn!(pending = self.pending, "output readers still running after grace period");
        }
        (self.snapshot(), drained)
    }
}

fn spawn_reader<R>(
    stream: Stream,
    source: R,
    buffer: LineBuffer,
    consumer: Option<StreamConsumer>,
    done: mpsc::Sender<Stream>,
) -> Result<()>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("stockade-{}", stream.name()))
        .spawn(move || {
            relay_lines(source, stream, &buffer, consumer.as_ref());
            let _ = done.send(stream);
        })
        .map(drop)
        .map_err(StockadeError::Io)
}

fn relay_lines<R: Read>(
    source: R,
    stream: Stream,
    buffer: &LineBuffer,
    consumer: Option<&StreamConsumer>,
) {
    let mut reader = BufReader::new(source);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw) {
            Ok(0) => break,
            Ok(_) => {
                if raw.last() == Some(&b'\n') {
                    raw.pop();
                    if raw.last() == Some(&b'\r') {
                        raw.pop();
                    }
                }
                let line = String::from_utf8_lossy(&raw).into_owned();
                if let Some(consumer) = consumer {
                    emit_to(consumer, &line, stream.is_stderr());
                }
                buffer.lock().push(line);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::debug!(stream = stream.name(), error = %e, "reader stopped on error");
                break;
            }
        }
    }
}
