// IPC between the listener and worker processes: length-prefixed frames over
// a pair of Unix domain sockets, one socket per direction so neither side
// can block the other.
//
// Frame layout (little-endian):
//   [0..4)  message type, u32
//   [4..8)  body length in bytes, u32
//   [8..)   UTF-8 body (JSON envelope for the message type)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Upper bound on a frame body. A frame claiming more than this is treated
/// as corrupt rather than allocated.
const MAX_BODY_BYTES: u32 = 128 * 1024 * 1024;

/// Message types for listener ↔ worker communication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    NewJobRequest = 1,
    CancelRequest = 2,
    AgentShutdown = 3,
    OperatingSystemShutdown = 4,
    JobMetadataUpdate = 5,
    JobCompleted = 6,
}

impl MessageType {
    /// Convert from the wire value. Unknown values are a framing error.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(MessageType::NewJobRequest),
            2 => Some(MessageType::CancelRequest),
            3 => Some(MessageType::AgentShutdown),
            4 => Some(MessageType::OperatingSystemShutdown),
            5 => Some(MessageType::JobMetadataUpdate),
            6 => Some(MessageType::JobCompleted),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageType::NewJobRequest => write!(f, "NewJobRequest"),
            MessageType::CancelRequest => write!(f, "CancelRequest"),
            MessageType::AgentShutdown => write!(f, "AgentShutdown"),
            MessageType::OperatingSystemShutdown => write!(f, "OperatingSystemShutdown"),
            MessageType::JobMetadataUpdate => write!(f, "JobMetadataUpdate"),
            MessageType::JobCompleted => write!(f, "JobCompleted"),
        }
    }
}

/// A message exchanged between listener and worker.
#[derive(Debug, Clone)]
pub struct WorkerMessage {
    pub message_type: MessageType,
    pub body: String,
}

impl WorkerMessage {
    pub fn new(message_type: MessageType, body: impl Into<String>) -> Self {
        Self {
            message_type,
            body: body.into(),
        }
    }
}

/// Fatal channel errors. Any of these closes the channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("IPC channel I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("IPC frame carries unknown message type {0}")]
    UnknownMessageType(u32),
    #[error("IPC frame body length {0} exceeds the maximum of {MAX_BODY_BYTES} bytes")]
    OversizedFrame(u32),
    #[error("IPC frame body is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("IPC receive cancelled")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// Typed bodies for the small envelopes. The NewJobRequest body is the raw
// job message JSON and is owned by the worker crate.
// ---------------------------------------------------------------------------

/// Body of a `CancelRequest` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCancelBody {
    pub job_id: Uuid,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// Body of a `JobMetadataUpdate` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMetadataBody {
    pub job_id: Uuid,
    #[serde(default)]
    pub post_lines_frequency_millis: Option<u64>,
}

/// Body of a `JobCompleted` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCompletedBody {
    pub job_id: Uuid,
    pub request_id: u64,
    pub result: crate::task_result::TaskResult,
}

// ---------------------------------------------------------------------------
// Pipe naming
// ---------------------------------------------------------------------------

/// Produce a process-unique socket path pair for one worker.
///
/// Paths live in a 0700 directory keyed to the listener PID; the socket file
/// names embed a per-job id so consecutive workers never collide. `/tmp` is
/// used instead of the work directory to stay under the Unix socket path
/// length limit.
pub fn unique_pipe_names(pid: u32, job_tag: Uuid) -> std::io::Result<(PathBuf, PathBuf)> {
    let dir = std::env::temp_dir().join(format!("agent-ipc-{pid}"));
    std::fs::create_dir_all(&dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
    }

    let short = &job_tag.simple().to_string()[..8];
    Ok((dir.join(format!("out_{short}")), dir.join(format!("in_{short}"))))
}

// ---------------------------------------------------------------------------
// Frame I/O
// ---------------------------------------------------------------------------

/// The sending half of a channel. Owns one socket used only for writes.
pub struct ChannelSender {
    stream: UnixStream,
}

impl ChannelSender {
    /// Send a single frame: header, body, then drain.
    pub async fn send(&mut self, message_type: MessageType, body: &str) -> Result<(), ChannelError> {
        let body_bytes = body.as_bytes();
        self.stream
            .write_all(&(message_type as u32).to_le_bytes())
            .await?;
        self.stream
            .write_all(&(body_bytes.len() as u32).to_le_bytes())
            .await?;
        self.stream.write_all(body_bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

/// The receiving half of a channel. Owns one socket used only for reads.
pub struct ChannelReceiver {
    stream: UnixStream,
}

impl ChannelReceiver {
    /// Block until a full frame is present or `cancel` fires.
    pub async fn receive(&mut self, cancel: CancellationToken) -> Result<WorkerMessage, ChannelError> {
        tokio::select! {
            result = self.receive_frame() => result,
            _ = cancel.cancelled() => Err(ChannelError::Cancelled),
        }
    }

    async fn receive_frame(&mut self) -> Result<WorkerMessage, ChannelError> {
        let mut type_buf = [0u8; 4];
        self.stream.read_exact(&mut type_buf).await?;
        let raw_type = u32::from_le_bytes(type_buf);
        let message_type =
            MessageType::from_u32(raw_type).ok_or(ChannelError::UnknownMessageType(raw_type))?;

        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).await?;
        let body_len = u32::from_le_bytes(len_buf);
        if body_len > MAX_BODY_BYTES {
            return Err(ChannelError::OversizedFrame(body_len));
        }

        let mut body_buf = vec![0u8; body_len as usize];
        self.stream.read_exact(&mut body_buf).await?;
        let body = String::from_utf8(body_buf)?;

        Ok(WorkerMessage::new(message_type, body))
    }
}

/// A connected duplex channel: one socket per direction.
pub struct ProcessChannel {
    pub sender: ChannelSender,
    pub receiver: ChannelReceiver,
}

impl ProcessChannel {
    /// Connect the client side (worker process).
    ///
    /// `send_path` is the socket the worker writes to; `receive_path` is the
    /// socket the worker reads from.
    pub async fn connect(send_path: &Path, receive_path: &Path) -> Result<Self, ChannelError> {
        let receive_stream = UnixStream::connect(receive_path).await?;
        let send_stream = UnixStream::connect(send_path).await?;
        Ok(Self {
            sender: ChannelSender { stream: send_stream },
            receiver: ChannelReceiver {
                stream: receive_stream,
            },
        })
    }

    /// Split into independently owned halves so sending and receiving can
    /// run on separate tasks.
    pub fn split(self) -> (ChannelSender, ChannelReceiver) {
        (self.sender, self.receiver)
    }
}

/// The server side (listener process) of the channel.
///
/// Binds both sockets before the worker is spawned; the worker connects to
/// the paths it was handed on its command line.
pub struct ProcessChannelServer {
    out_listener: UnixListener,
    in_listener: UnixListener,
    out_path: PathBuf,
    in_path: PathBuf,
}

impl ProcessChannelServer {
    /// Bind both sockets.
    ///
    /// `out_path` carries listener → worker frames; `in_path` carries
    /// worker → listener frames.
    pub fn bind(out_path: &Path, in_path: &Path) -> Result<Self, ChannelError> {
        // Leftover sockets from a crashed worker would make bind fail.
        let _ = std::fs::remove_file(out_path);
        let _ = std::fs::remove_file(in_path);

        let out_listener = UnixListener::bind(out_path)?;
        let in_listener = UnixListener::bind(in_path)?;
        Ok(Self {
            out_listener,
            in_listener,
            out_path: out_path.to_path_buf(),
            in_path: in_path.to_path_buf(),
        })
    }

    /// Accept the worker's connection on both sockets.
    pub async fn accept(self) -> Result<ProcessChannel, ChannelError> {
        let (out_stream, _) = self.out_listener.accept().await?;
        let (in_stream, _) = self.in_listener.accept().await?;

        // The socket files are connected now; remove the names so a later
        // bind with the same tag cannot race against stale entries.
        let _ = std::fs::remove_file(&self.out_path);
        let _ = std::fs::remove_file(&self.in_path);

        Ok(ProcessChannel {
            sender: ChannelSender { stream: out_stream },
            receiver: ChannelReceiver { stream: in_stream },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socket_pair_paths() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let inp = dir.path().join("in");
        (dir, out, inp)
    }

    #[tokio::test]
    async fn frame_round_trip() {
        let (_dir, out, inp) = socket_pair_paths();
        let server = ProcessChannelServer::bind(&out, &inp).unwrap();

        let client = tokio::spawn({
            let (out, inp) = (out.clone(), inp.clone());
            async move { ProcessChannel::connect(&inp, &out).await.unwrap() }
        });

        let server_channel = server.accept().await.unwrap();
        let mut client_channel = client.await.unwrap();

        let (mut server_tx, _server_rx) = server_channel.split();
        let body = r#"{"jobId":"a"}"#;
        server_tx.send(MessageType::NewJobRequest, body).await.unwrap();

        let received = client_channel
            .receiver
            .receive(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(received.message_type, MessageType::NewJobRequest);
        assert_eq!(received.body, body);
    }

    #[tokio::test]
    async fn both_directions_carry_frames() {
        let (_dir, out, inp) = socket_pair_paths();
        let server = ProcessChannelServer::bind(&out, &inp).unwrap();

        let client = tokio::spawn({
            let (out, inp) = (out.clone(), inp.clone());
            async move { ProcessChannel::connect(&inp, &out).await.unwrap() }
        });

        let server_channel = server.accept().await.unwrap();
        let client_channel = client.await.unwrap();

        let (mut server_tx, mut server_rx) = server_channel.split();
        let (mut client_tx, mut client_rx) = client_channel.split();

        server_tx.send(MessageType::CancelRequest, "{}").await.unwrap();
        client_tx
            .send(MessageType::JobCompleted, r#"{"ok":true}"#)
            .await
            .unwrap();

        let to_worker = client_rx.receive(CancellationToken::new()).await.unwrap();
        assert_eq!(to_worker.message_type, MessageType::CancelRequest);

        let to_listener = server_rx.receive(CancellationToken::new()).await.unwrap();
        assert_eq!(to_listener.message_type, MessageType::JobCompleted);
        assert_eq!(to_listener.body, r#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn unknown_message_type_is_fatal() {
        let (_dir, out, inp) = socket_pair_paths();
        let server = ProcessChannelServer::bind(&out, &inp).unwrap();

        let client = tokio::spawn({
            let (out, inp) = (out.clone(), inp.clone());
            async move { ProcessChannel::connect(&inp, &out).await.unwrap() }
        });

        let server_channel = server.accept().await.unwrap();
        let mut client_channel = client.await.unwrap();

        // Hand-write a frame with message type 99.
        let (mut server_tx, _) = server_channel.split();
        server_tx.stream.write_all(&99u32.to_le_bytes()).await.unwrap();
        server_tx.stream.write_all(&0u32.to_le_bytes()).await.unwrap();
        server_tx.stream.flush().await.unwrap();

        let err = client_channel
            .receiver
            .receive(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::UnknownMessageType(99)));
    }

    #[tokio::test]
    async fn oversized_frame_is_fatal() {
        let (_dir, out, inp) = socket_pair_paths();
        let server = ProcessChannelServer::bind(&out, &inp).unwrap();

        let client = tokio::spawn({
            let (out, inp) = (out.clone(), inp.clone());
            async move { ProcessChannel::connect(&inp, &out).await.unwrap() }
        });

        let server_channel = server.accept().await.unwrap();
        let mut client_channel = client.await.unwrap();

        let (mut server_tx, _) = server_channel.split();
        server_tx
            .stream
            .write_all(&(MessageType::NewJobRequest as u32).to_le_bytes())
            .await
            .unwrap();
        server_tx
            .stream
            .write_all(&u32::MAX.to_le_bytes())
            .await
            .unwrap();
        server_tx.stream.flush().await.unwrap();

        let err = client_channel
            .receiver
            .receive(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::OversizedFrame(_)));
    }

    #[tokio::test]
    async fn receive_honors_cancellation() {
        let (_dir, out, inp) = socket_pair_paths();
        let server = ProcessChannelServer::bind(&out, &inp).unwrap();

        let client = tokio::spawn({
            let (out, inp) = (out.clone(), inp.clone());
            async move { ProcessChannel::connect(&inp, &out).await.unwrap() }
        });

        let _server_channel = server.accept().await.unwrap();
        let mut client_channel = client.await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client_channel.receiver.receive(cancel).await.unwrap_err();
        assert!(matches!(err, ChannelError::Cancelled));
    }

    #[test]
    fn unique_pipe_names_differ_per_job() {
        let a = unique_pipe_names(1234, Uuid::new_v4()).unwrap();
        let b = unique_pipe_names(1234, Uuid::new_v4()).unwrap();
        assert_ne!(a.0, b.0);
        assert_ne!(a.1, b.1);
    }

    #[test]
    fn cancel_body_round_trips() {
        let body = JobCancelBody {
            job_id: Uuid::new_v4(),
            timeout_seconds: Some(30),
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("jobId"));
        let back: JobCancelBody = serde_json::from_str(&json).unwrap();
        assert_eq!(back.job_id, body.job_id);
        assert_eq!(back.timeout_seconds, Some(30));
    }
}
