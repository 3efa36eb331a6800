//! Per-call recording sink.
//!
//! When recording is configured the session streams raw audio chunks to a
//! writer task that appends LEB128-framed records to one log file per call.
//! The sink is strictly best-effort: a full channel or a write failure
//! drops chunks with a warning and never touches the call path.

use decoy_audio::recording::{encode_chunk, encode_header, RecordHeader};
use decoy_types::Role;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

const SINK_DEPTH: usize = 64;

#[derive(Debug)]
struct ChunkMsg {
    role: Role,
    timestamp_ms: u64,
    payload: Vec<u8>,
}

/// Handle the session uses to append chunks.
#[derive(Debug)]
pub(crate) struct RecordingSink {
    tx: mpsc::Sender<ChunkMsg>,
}

impl RecordingSink {
    /// Spawns the writer task. Returns `None` (with a warning) when the log
    /// file cannot be created; the call proceeds unrecorded.
    pub async fn spawn(dir: PathBuf, header: RecordHeader) -> Option<Self> {
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            tracing::warn!(error = %e, dir = %dir.display(), "cannot create recording directory");
            return None;
        }
        let path = dir.join(format!("{}.dcl", header.call_id));
        let mut file = match tokio::fs::File::create(&path).await {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "cannot create recording log");
                return None;
            }
        };

        let header_frame = match encode_header(&header) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "cannot encode recording header");
                return None;
            }
        };

        let (tx, mut rx) = mpsc::channel::<ChunkMsg>(SINK_DEPTH);
        tokio::spawn(async move {
            if let Err(e) = file.write_all(&header_frame).await {
                tracing::warn!(error = %e, "recording header write failed; recording disabled");
                return;
            }
            while let Some(msg) = rx.recv().await {
                let frame = encode_chunk(msg.role, msg.timestamp_ms, &msg.payload);
                if let Err(e) = file.write_all(&frame).await {
                    tracing::warn!(error = %e, "recording write failed; recording disabled");
                    return;
                }
            }
            if let Err(e) = file.flush().await {
                tracing::warn!(error = %e, "recording flush failed");
            }
        });

        Some(Self { tx })
    }

    /// Appends one chunk. Non-blocking; a saturated sink sheds the chunk.
    pub fn append(&self, role: Role, timestamp_ms: u64, payload: Vec<u8>) {
        if self
            .tx
            .try_send(ChunkMsg {
                role,
                timestamp_ms,
                payload,
            })
            .is_err()
        {
            tracing::trace!("recording sink saturated; chunk dropped");
        }
    }
}
