//! Length-prefixed MessagePack framing and the message schema.
//!
//! Every message on either socket is
//!
//! ```text
//! +----------------+--------------------------------+
//! | len: u32 (BE)  | MessagePack map, `len` bytes   |
//! +----------------+--------------------------------+
//! ```
//!
//! Payloads are encoded with string keys and always carry a `"cmd"` field
//! naming the variant. The set of variants is closed: [`Request`] and
//! [`Response`] on the command channel, [`Event`] on the broadcast channel.

use crate::error::{SyncError, SyncResult};
use crate::hardware::CameraParams;
use crate::mailbox::{ImagingMode, RunId};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single payload; anything larger is treated as desync.
pub const MAX_MESSAGE_LEN: usize = 64 * 1024 * 1024;

/// Value of a sequencer variable in an `xvars` snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VarValue {
    /// Flag
    Bool(bool),
    /// Integer parameter
    Int(i64),
    /// Real-valued parameter
    Float(f64),
    /// Free text
    Text(String),
    /// List of values, possibly mixed
    Array(Vec<VarValue>),
}

/// Sequencer variable snapshot, keyed by variable name.
pub type Vars = BTreeMap<String, VarValue>;

/// Arguments of `new_run`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRun {
    /// Run the record was created for
    pub run_id: RunId,
    /// Camera selection and acquisition settings
    pub camera: CameraParams,
    /// Record location as the sequencer sees it
    pub filepath: String,
    /// Whether the record is kept; unsaved runs are never deleted
    pub save_enabled: bool,
    /// Frames the sequencer will trigger
    pub expected_frame_count: usize,
    /// Number of shots in the run
    pub shot_count: usize,
    /// Frames per shot
    pub subframes_per_shot: usize,
    /// How viewers should interpret the frames
    pub imaging_mode: ImagingMode,
}

/// Command channel request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    /// Prepare the camera for a run; answered with `camera_ready`
    NewRun(NewRun),
    /// Variable snapshot, forwarded to viewers
    Xvars {
        /// Variables by name
        vars: Vars,
    },
    /// Sequencer finished triggering the run
    RunComplete,
    /// Query live state
    Status,
    /// Abort whatever is running and return to idle
    Reset,
}

impl Request {
    /// Wire name of the request.
    pub fn name(&self) -> &'static str {
        match self {
            Request::NewRun(_) => "new_run",
            Request::Xvars { .. } => "xvars",
            Request::RunComplete => "run_complete",
            Request::Status => "status",
            Request::Reset => "reset",
        }
    }
}

/// Live state reported by `status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Camera armed for the current run
    pub camera_ready: bool,
    /// Grab loop running
    pub grab_active: bool,
    /// Most recently started run, if any
    pub run_id: Option<RunId>,
    /// Frames persisted for that run
    pub frames_written: usize,
    /// Frames that run expects
    pub expected_frame_count: usize,
    /// Connected broadcast viewers
    pub viewers: usize,
}

/// Command channel response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Response {
    /// Handshake done, camera armed for `run_id`
    CameraReady {
        /// Run the camera is armed for
        run_id: RunId,
    },
    /// Request accepted
    Ack,
    /// Answer to `status`
    Status(StatusReport),
    /// Request failed server-side
    Error {
        /// Human-readable failure
        message: String,
    },
}

impl Response {
    /// Error response from any displayable failure.
    pub fn error(err: impl std::fmt::Display) -> Self {
        Response::Error {
            message: err.to_string(),
        }
    }
}

/// One persisted frame, as pushed to viewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameEvent {
    /// Run the frame belongs to
    pub run_id: RunId,
    /// Slot in the frame table
    pub index: usize,
    /// Shot number, `index / subframes_per_shot`
    pub shot: usize,
    /// Position within the shot
    pub subframe: usize,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Arrival time, seconds since the Unix epoch
    pub timestamp: f64,
    /// Raw little-endian pixel data
    pub data: Bytes,
}

/// Broadcast channel event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Event {
    /// `new_run` accepted; frames for this run follow
    RunStart {
        /// Run identifier
        run_id: RunId,
        /// Record location as announced by the sequencer
        filepath: String,
        /// Size of the frame table
        expected_frame_count: usize,
        /// Number of shots
        shot_count: usize,
        /// Frames per shot
        subframes_per_shot: usize,
        /// How to interpret the frames
        imaging_mode: ImagingMode,
    },
    /// A frame was persisted
    Frame(FrameEvent),
    /// Sequencer variable snapshot
    Xvars {
        /// Variables by name
        vars: Vars,
    },
    /// Every slot of the run was filled
    RunComplete {
        /// Run identifier
        run_id: RunId,
        /// Frames persisted
        frames: usize,
    },
    /// The run ended before its table was full
    RunIncomplete {
        /// Run identifier
        run_id: RunId,
        /// Frames persisted before the failure
        frames: usize,
        /// Why the run stopped
        reason: String,
    },
    /// The imaging process was reset to idle
    Reset,
}

/// Serialise `message` into a complete frame (prefix included).
pub fn encode_message<T: Serialize>(message: &T) -> SyncResult<Bytes> {
    let payload = rmp_serde::to_vec_named(message)?;
    if payload.len() > MAX_MESSAGE_LEN {
        return Err(SyncError::Codec(format!(
            "message of {} bytes exceeds limit of {MAX_MESSAGE_LEN}",
            payload.len()
        )));
    }
    let mut framed = Vec::with_capacity(4 + payload.len());
    framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    framed.extend_from_slice(&payload);
    Ok(Bytes::from(framed))
}

/// Write an already framed message.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> SyncResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await.map_err(map_write_error)?;
    writer.flush().await.map_err(map_write_error)?;
    Ok(())
}

/// Serialise and send one message.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> SyncResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_message(message)?;
    write_frame(writer, &frame).await
}

/// Receive one message.
///
/// Returns `Ok(None)` when the peer closed the connection, including a close
/// in the middle of a frame; a partial message is never returned.
pub async fn read_message<R, T>(reader: &mut R) -> SyncResult<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut prefix = [0u8; 4];
    if !read_full(reader, &mut prefix).await? {
        return Ok(None);
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(SyncError::ProtocolDesync(format!(
            "length prefix {len} exceeds limit of {MAX_MESSAGE_LEN}"
        )));
    }

    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload).await? {
        return Ok(None);
    }

    Ok(Some(rmp_serde::from_slice(&payload)?))
}

/// Fill `buf`; `false` on end of stream.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> SyncResult<bool>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(e) if is_disconnect(&e) => Ok(false),
        Err(e) => Err(SyncError::Io(e)),
    }
}

fn is_disconnect(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
    )
}

fn map_write_error(err: std::io::Error) -> SyncError {
    if is_disconnect(&err) {
        SyncError::ConnectionLost(err.to_string())
    } else {
        SyncError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn frame_has_big_endian_length_prefix() {
        let frame = encode_message(&Request::Status).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);

        let value: serde_json::Value = rmp_serde::from_slice(&frame[4..]).unwrap();
        assert_eq!(value["cmd"], "status");
    }

    #[tokio::test]
    async fn new_run_survives_the_wire() {
        let request = Request::NewRun(NewRun {
            run_id: 42,
            camera: CameraParams {
                exposure: Duration::from_micros(250),
                ..Default::default()
            },
            filepath: "/data/run_42".to_string(),
            save_enabled: true,
            expected_frame_count: 6,
            shot_count: 2,
            subframes_per_shot: 3,
            imaging_mode: ImagingMode::FastKinetics,
        });

        let (mut a, mut b) = tokio::io::duplex(1024);
        write_message(&mut a, &request).await.unwrap();
        let received: Request = read_message(&mut b).await.unwrap().unwrap();
        assert_eq!(received, request);
    }

    #[tokio::test]
    async fn frame_event_keeps_binary_payload() {
        let event = Event::Frame(FrameEvent {
            run_id: 1,
            index: 4,
            shot: 1,
            subframe: 1,
            width: 2,
            height: 1,
            timestamp: 1_700_000_000.25,
            data: Bytes::from_static(&[1, 0, 2, 0]),
        });

        let (mut a, mut b) = tokio::io::duplex(1024);
        write_message(&mut a, &event).await.unwrap();
        let received: Event = read_message(&mut b).await.unwrap().unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn clean_close_reads_as_none() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let received: Option<Request> = read_message(&mut b).await.unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn truncated_frame_reads_as_none() {
        let frame = encode_message(&Request::Reset).unwrap();
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&frame[..frame.len() - 1]).await.unwrap();
        drop(a);
        let received: Option<Request> = read_message(&mut b).await.unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn oversized_prefix_is_desync() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        let result: SyncResult<Option<Request>> = read_message(&mut b).await;
        assert!(matches!(result, Err(SyncError::ProtocolDesync(_))));
    }

    #[test]
    fn untagged_vars_keep_their_types() {
        let mut vars = Vars::new();
        vars.insert("detuning".into(), VarValue::Float(-2.5));
        vars.insert("shots".into(), VarValue::Int(3));
        vars.insert("label".into(), VarValue::Text("mot".into()));
        vars.insert("enabled".into(), VarValue::Bool(true));

        let bytes = rmp_serde::to_vec_named(&Request::Xvars { vars: vars.clone() }).unwrap();
        let back: Request = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, Request::Xvars { vars });
    }
}
