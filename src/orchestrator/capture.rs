//! Combined stdout/stderr collection for captured jobs.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{ChildStderr, ChildStdout};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const CHUNK_SIZE: usize = 8 * 1024;

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Reads both pipes of a child into one buffer in arrival order.
///
/// The buffer is shared with the reader task so output collected before a
/// kill or an abandoned drain is never lost.
pub(crate) struct OutputCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    reader: JoinHandle<()>,
}

impl OutputCapture {
    pub(crate) fn start(stdout: Option<ChildStdout>, stderr: Option<ChildStderr>) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let reader = tokio::spawn(interleave(stdout, stderr, Arc::clone(&buffer)));
        Self { buffer, reader }
    }

    /// Waits up to `grace` for both pipes to close, then returns what was
    /// collected. A descendant still holding a pipe open is abandoned.
    pub(crate) async fn finish(self, grace: Duration) -> String {
        let mut reader = self.reader;
        if timeout(grace, &mut reader).await.is_err() {
            reader.abort();
        }
        let bytes = self.buffer.lock().await;
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

async fn interleave(
    mut stdout: Option<ChildStdout>,
    mut stderr: Option<ChildStderr>,
    buffer: Arc<Mutex<Vec<u8>>>,
) {
    let mut out_chunk = vec![0_u8; CHUNK_SIZE];
    let mut err_chunk = vec![0_u8; CHUNK_SIZE];

    while stdout.is_some() || stderr.is_some() {
        let (stream, read) = tokio::select! {
            read = read_chunk(&mut stdout, &mut out_chunk) => (Stream::Stdout, read),
            read = read_chunk(&mut stderr, &mut err_chunk) => (Stream::Stderr, read),
        };

        match (stream, read) {
            (Stream::Stdout, Ok(0) | Err(_)) => stdout = None,
            (Stream::Stderr, Ok(0) | Err(_)) => stderr = None,
            (Stream::Stdout, Ok(len)) => append(&buffer, &out_chunk, len).await,
            (Stream::Stderr, Ok(len)) => append(&buffer, &err_chunk, len).await,
        }
    }
}

async fn read_chunk<R: AsyncRead + Unpin>(
    reader: &mut Option<R>,
    chunk: &mut [u8],
) -> io::Result<usize> {
    match reader {
        Some(pipe) => pipe.read(chunk).await,
        None => std::future::pending().await,
    }
}

async fn append(buffer: &Mutex<Vec<u8>>, chunk: &[u8], len: usize) {
    if let Some(bytes) = chunk.get(..len) {
        buffer.lock().await.extend_from_slice(bytes);
    }
}
