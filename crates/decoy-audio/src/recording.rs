//! Binary codec for the per-call recording log.
//!
//! The log is append-only: LEB128-length-prefixed records, the first being
//! a JSON session-metadata header, the rest interleaved audio chunks tagged
//! by leg and monotonic timestamp. Retention and access policy belong to
//! the storage collaborator; the broker only appends.

use crate::error::AudioError;
use decoy_types::Role;
use serde::{Deserialize, Serialize};

const TAG_HEADER: u8 = 0;
const TAG_CHUNK: u8 = 1;

/// Session metadata written as the first record of every log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordHeader {
    pub call_id: String,
    /// Wall-clock session start, RFC 3339.
    pub started_at: String,
    pub sample_rate: u32,
}

/// One decoded record.
#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    Header(RecordHeader),
    Chunk {
        role: Role,
        timestamp_ms: u64,
        pcm: Vec<u8>,
    },
}

/// Appends an unsigned LEB128 value.
pub fn write_uvarint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            break;
        }
        buf.push(byte | 0x80);
    }
}

/// Reads an unsigned LEB128 value, returning it and the bytes consumed.
pub fn read_uvarint(bytes: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (i, &b) in bytes.iter().enumerate().take(10) {
        value |= ((b & 0x7f) as u64) << (7 * i);
        if b & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

/// Encodes the header as a length-prefixed frame.
pub fn encode_header(header: &RecordHeader) -> Result<Vec<u8>, AudioError> {
    let json = serde_json::to_vec(header).map_err(|e| AudioError::RecordingLog(e.to_string()))?;
    let mut record = Vec::with_capacity(json.len() + 1);
    record.push(TAG_HEADER);
    record.extend_from_slice(&json);
    Ok(frame(record))
}

/// Encodes one audio chunk as a length-prefixed frame.
pub fn encode_chunk(role: Role, timestamp_ms: u64, pcm: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(pcm.len() + 12);
    record.push(TAG_CHUNK);
    record.push(match role {
        Role::Operator => 0,
        Role::Scammer => 1,
    });
    write_uvarint(&mut record, timestamp_ms);
    record.extend_from_slice(pcm);
    frame(record)
}

fn frame(record: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(record.len() + 4);
    write_uvarint(&mut out, record.len() as u64);
    out.extend_from_slice(&record);
    out
}

/// Decodes an entire log. Used by tests and offline tooling.
pub fn decode_log(mut bytes: &[u8]) -> Result<Vec<LogRecord>, AudioError> {
    let mut records = Vec::new();
    while !bytes.is_empty() {
        let (len, consumed) =
            read_uvarint(bytes).ok_or_else(|| AudioError::RecordingLog("bad length prefix".to_string()))?;
        bytes = &bytes[consumed..];
        let len = len as usize;
        if bytes.len() < len || len == 0 {
            return Err(AudioError::RecordingLog("truncated record".to_string()));
        }
        let (record, rest) = bytes.split_at(len);
        bytes = rest;

        match record[0] {
            TAG_HEADER => {
                let header = serde_json::from_slice(&record[1..])
                    .map_err(|e| AudioError::RecordingLog(e.to_string()))?;
                records.push(LogRecord::Header(header));
            }
            TAG_CHUNK => {
                if record.len() < 3 {
                    return Err(AudioError::RecordingLog("short chunk record".to_string()));
                }
                let role = match record[1] {
                    0 => Role::Operator,
                    1 => Role::Scammer,
                    other => {
                        return Err(AudioError::RecordingLog(format!("bad role tag {other}")))
                    }
                };
                let (timestamp_ms, consumed) = read_uvarint(&record[2..])
                    .ok_or_else(|| AudioError::RecordingLog("bad chunk timestamp".to_string()))?;
                records.push(LogRecord::Chunk {
                    role,
                    timestamp_ms,
                    pcm: record[2 + consumed..].to_vec(),
                });
            }
            other => return Err(AudioError::RecordingLog(format!("unknown record tag {other}"))),
        }
    }
    Ok(records)
}
