use bytes::Bytes;
use futures_util::StreamExt;
use sandbox::{OutputChunk, OutputStream, SandboxError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Per-stream capture limit. Output past it is discarded.
pub(crate) const MAX_CAPTURE_BYTES: usize = 1024 * 1024;

const TRUNCATED_NOTICE: &[u8] = b"\n[output truncated]\n";

/// Splits an exec's combined output into separate stdout and stderr
/// channels on a background task.
///
/// Dropping the demuxer aborts the task; whatever was forwarded before
/// that can still be collected.
pub(crate) struct Demux {
    stdout: mpsc::UnboundedReceiver<Bytes>,
    stderr: mpsc::UnboundedReceiver<Bytes>,
    done: oneshot::Receiver<sandbox::Result<()>>,
    task: JoinHandle<()>,
}

/// Tracks how much of one stream has been forwarded.
struct Capture {
    tx: mpsc::UnboundedSender<Bytes>,
    forwarded: usize,
    truncated: bool,
}

impl Capture {
    fn new(tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self {
            tx,
            forwarded: 0,
            truncated: false,
        }
    }

    fn push(&mut self, mut bytes: Bytes) {
        if self.truncated {
            return;
        }
        let room = MAX_CAPTURE_BYTES - self.forwarded;
        let over = bytes.len() > room;
        if over {
            bytes.truncate(room);
        }
        self.forwarded += bytes.len();
        // Receiver only goes away once the result is assembled.
        let _ = self.tx.send(bytes);
        if over {
            self.truncated = true;
            let _ = self.tx.send(Bytes::from_static(TRUNCATED_NOTICE));
        }
    }
}

impl Demux {
    pub(crate) fn spawn(mut output: OutputStream) -> Self {
        let (stdout_tx, stdout) = mpsc::unbounded_channel();
        let (stderr_tx, stderr) = mpsc::unbounded_channel();
        let (done_tx, done) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut out = Capture::new(stdout_tx);
            let mut err = Capture::new(stderr_tx);
            let result = loop {
                match output.next().await {
                    Some(Ok(OutputChunk::Stdout(bytes))) => out.push(bytes),
                    Some(Ok(OutputChunk::Stderr(bytes))) => err.push(bytes),
                    Some(Err(e)) => break Err(e),
                    None => break Ok(()),
                }
            };
            let _ = done_tx.send(result);
        });

        Self {
            stdout,
            stderr,
            done,
            task,
        }
    }

    /// Resolves once the output stream has ended. Cancel-safe.
    pub(crate) async fn finished(&mut self) -> sandbox::Result<()> {
        match (&mut self.done).await {
            Ok(result) => result,
            Err(_) => Err(SandboxError::ExecFailed(
                "output reader stopped before the stream ended".into(),
            )),
        }
    }

    /// Stop reading and return everything captured so far as
    /// `(stdout, stderr)`.
    pub(crate) fn collect(&mut self) -> (String, String) {
        self.task.abort();
        (drain(&mut self.stdout), drain(&mut self.stderr))
    }
}

impl Drop for Demux {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> String {
    let mut buf = Vec::new();
    while let Ok(bytes) = rx.try_recv() {
        buf.extend_from_slice(&bytes);
    }
    String::from_utf8_lossy(&buf).into_owned()
}
