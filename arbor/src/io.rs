//! Envelope framing over raw byte streams.
//!
//! Each wrapper spawns one task that owns its half of the stream. Public
//! calls hand a request to that task over a channel and wait for the reply,
//! so at most one stream operation is in flight and concurrent callers are
//! served in order without any locking on their side.
//!
//! Framing is newline-delimited JSON; blank lines are skipped.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    runtime::Handle,
    select,
    sync::{mpsc, oneshot, Notify},
    task::JoinHandle,
};
use tracing::debug;

use crate::{
    error::StreamError,
    protocol::{Frame, ProtocolMessage},
};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

type ReadReply = oneshot::Sender<Result<ProtocolMessage, StreamError>>;

/// Reads envelopes from an [`AsyncRead`] source.
///
/// End of input and malformed payloads are terminal: the reader task exits,
/// dropping the source, and every later [`ProtocolReader::read`] returns
/// [`StreamError::Stopped`].
pub struct ProtocolReader {
    requests: mpsc::Sender<ReadReply>,
    task: JoinHandle<()>,
}

impl ProtocolReader {
    /// Wraps `source`. Fails if called outside a tokio runtime.
    pub fn new<R>(source: R) -> Result<Self, StreamError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Ok(Self::spawn(&current_runtime()?, source, None))
    }

    fn spawn<R>(runtime: &Handle, source: R, hangup: Option<Arc<Notify>>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (requests, inbox) = mpsc::channel(1);
        let task = runtime.spawn(read_loop(source, inbox, hangup));
        Self { requests, task }
    }

    /// Waits for the next envelope on the stream.
    pub async fn read(&self) -> Result<ProtocolMessage, StreamError> {
        let (respond_to, response) = oneshot::channel();
        self.requests
            .send(respond_to)
            .await
            .map_err(|_| StreamError::Stopped)?;
        response.await.map_err(|_| StreamError::Stopped)?
    }

    fn stop(&self) {
        self.task.abort();
    }
}

async fn read_loop<R>(
    source: R,
    mut requests: mpsc::Receiver<ReadReply>,
    hangup: Option<Arc<Notify>>,
) where
    R: AsyncRead + Unpin,
{
    let mut source = BufReader::new(source);
    let mut line = String::new();

    while let Some(respond_to) = requests.recv().await {
        let result = read_envelope(&mut source, &mut line).await;
        let terminal = result.is_err();
        if let Err(StreamError::Malformed(reason)) = &result {
            debug!(%reason, "malformed envelope, hanging up");
            if let Some(hangup) = &hangup {
                hangup.notify_one();
            }
        }
        let _ = respond_to.send(result);
        if terminal {
            break;
        }
    }
}

async fn read_envelope<R>(source: &mut R, line: &mut String) -> Result<ProtocolMessage, StreamError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        line.clear();
        let bytes = match source.read_line(line).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::InvalidData => {
                return Err(StreamError::Malformed(err.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        if bytes == 0 {
            return Err(StreamError::Eof);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }
        return serde_json::from_str(trimmed).map_err(|err| StreamError::Malformed(err.to_string()));
    }
}

enum WriteCommand {
    Write {
        frame: Frame,
        respond_to: oneshot::Sender<Result<(), StreamError>>,
    },
    Shutdown {
        respond_to: oneshot::Sender<Result<(), StreamError>>,
    },
}

/// Writes envelopes to an [`AsyncWrite`] destination.
pub struct ProtocolWriter {
    commands: mpsc::Sender<WriteCommand>,
}

impl ProtocolWriter {
    /// Wraps `destination`. Fails if called outside a tokio runtime.
    pub fn new<W>(destination: W) -> Result<Self, StreamError>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Ok(Self::spawn(&current_runtime()?, destination, Arc::new(Notify::new())))
    }

    fn spawn<W>(runtime: &Handle, destination: W, hangup: Arc<Notify>) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (commands, inbox) = mpsc::channel(1);
        runtime.spawn(write_loop(destination, inbox, hangup));
        Self { commands }
    }

    /// Encodes and writes one envelope.
    ///
    /// Envelopes that fail [`ProtocolMessage::is_valid`] are rejected before
    /// anything reaches the stream.
    pub async fn write(&self, message: &ProtocolMessage) -> Result<(), StreamError> {
        if !message.is_valid() {
            return Err(StreamError::InvalidInput(format!(
                "{} envelope is missing required fields",
                message.kind()
            )));
        }
        let frame = message.encode()?;
        self.write_frame(frame).await
    }

    /// Writes a frame that was already encoded, e.g. one shared by a broadcast.
    pub async fn write_frame(&self, frame: Frame) -> Result<(), StreamError> {
        let (respond_to, response) = oneshot::channel();
        self.commands
            .send(WriteCommand::Write { frame, respond_to })
            .await
            .map_err(|_| StreamError::Stopped)?;
        response.await.map_err(|_| StreamError::Stopped)?
    }

    async fn shutdown(&self) -> Result<(), StreamError> {
        let (respond_to, response) = oneshot::channel();
        self.commands
            .send(WriteCommand::Shutdown { respond_to })
            .await
            .map_err(|_| StreamError::Stopped)?;
        response.await.map_err(|_| StreamError::Stopped)?
    }
}

async fn write_loop<W>(
    mut destination: W,
    mut commands: mpsc::Receiver<WriteCommand>,
    hangup: Arc<Notify>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let command = select! {
            biased;
            _ = hangup.notified() => {
                if let Err(error) = destination.shutdown().await {
                    debug!(?error, "failed to shut down stream after malformed input");
                }
                break;
            }
            command = commands.recv() => command,
        };

        match command {
            Some(WriteCommand::Write { frame, respond_to }) => {
                let result = write_frame_to(&mut destination, &frame).await;
                let failed = result.is_err();
                let _ = respond_to.send(result);
                if failed {
                    break;
                }
            }
            Some(WriteCommand::Shutdown { respond_to }) => {
                let _ = respond_to.send(destination.shutdown().await.map_err(Into::into));
                break;
            }
            None => break,
        }
    }
}

async fn write_frame_to<W>(destination: &mut W, frame: &Frame) -> Result<(), StreamError>
where
    W: AsyncWrite + Unpin,
{
    destination.write_all(frame.as_bytes()).await?;
    destination.flush().await?;
    Ok(())
}

/// Reads and writes envelopes on one duplex stream and owns its teardown.
///
/// A malformed inbound payload also shuts down the outbound half, since the
/// framing can no longer be trusted in either direction.
pub struct ProtocolReadWriter {
    reader: ProtocolReader,
    writer: ProtocolWriter,
    closed: AtomicBool,
}

impl ProtocolReadWriter {
    pub fn new<S>(stream: S) -> Result<Self, StreamError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let runtime = current_runtime()?;
        let (read_half, write_half) = tokio::io::split(stream);
        let hangup = Arc::new(Notify::new());
        let reader = ProtocolReader::spawn(&runtime, read_half, Some(Arc::clone(&hangup)));
        let writer = ProtocolWriter::spawn(&runtime, write_half, hangup);
        Ok(Self {
            reader,
            writer,
            closed: AtomicBool::new(false),
        })
    }

    pub async fn read(&self) -> Result<ProtocolMessage, StreamError> {
        self.reader.read().await
    }

    pub async fn write(&self, message: &ProtocolMessage) -> Result<(), StreamError> {
        self.writer.write(message).await
    }

    pub async fn write_frame(&self, frame: Frame) -> Result<(), StreamError> {
        self.writer.write_frame(frame).await
    }

    /// Stops both tasks and shuts down the wrapped stream.
    ///
    /// Only the first call does anything; later calls return
    /// [`StreamError::AlreadyClosed`].
    pub async fn close(&self) -> Result<(), StreamError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(StreamError::AlreadyClosed);
        }
        self.reader.stop();
        match self.writer.shutdown().await {
            // The write task already shut the stream down or hit an error
            // that dropped it.
            Err(StreamError::Stopped) => Ok(()),
            other => other,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn current_runtime() -> Result<Handle, StreamError> {
    Handle::try_current().map_err(|_| StreamError::NoRuntime)
}
