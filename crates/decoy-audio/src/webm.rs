//! Minimal EBML walker that lifts Opus frames out of WebM chunks.
//!
//! Browser `MediaRecorder` streams arrive as Matroska fragments: an EBML
//! header, a Segment, then Clusters of SimpleBlocks (or BlockGroups). We
//! only need the block payloads; everything else is skipped by size. Laced
//! blocks are rare in MediaRecorder output and are skipped rather than
//! mis-split.

const ID_SEGMENT: u64 = 0x1853_8067;
const ID_CLUSTER: u64 = 0x1F43_B675;
const ID_BLOCK_GROUP: u64 = 0xA0;
const ID_SIMPLE_BLOCK: u64 = 0xA3;
const ID_BLOCK: u64 = 0xA1;

#[derive(Debug, thiserror::Error)]
pub enum WebmError {
    #[error("truncated EBML element at offset {0}")]
    Truncated(usize),
    #[error("invalid EBML varint at offset {0}")]
    BadVarint(usize),
}

/// Extracts the raw Opus packets from a WebM fragment, in stream order.
pub fn opus_packets(data: &[u8]) -> Result<Vec<&[u8]>, WebmError> {
    let mut packets = Vec::new();
    walk(data, 0, data.len(), &mut packets)?;
    Ok(packets)
}

fn walk<'a>(
    data: &'a [u8],
    mut pos: usize,
    end: usize,
    packets: &mut Vec<&'a [u8]>,
) -> Result<(), WebmError> {
    while pos < end {
        let (id, id_len) = read_id(data, pos)?;
        pos += id_len;
        let (size, size_len, unknown) = read_size(data, pos)?;
        pos += size_len;

        // Unknown-size elements (streamed Segments and Clusters) run to the
        // enclosing boundary.
        let elem_end = if unknown {
            end
        } else {
            let e = pos + size as usize;
            if e > end {
                return Err(WebmError::Truncated(pos));
            }
            e
        };

        match id {
            ID_SEGMENT | ID_CLUSTER | ID_BLOCK_GROUP => {
                walk(data, pos, elem_end, packets)?;
            }
            ID_SIMPLE_BLOCK | ID_BLOCK => {
                if let Some(frame) = block_frame(&data[pos..elem_end]) {
                    packets.push(frame);
                }
            }
            _ => {
                // EBML header, track metadata, cues: skipped wholesale.
            }
        }
        pos = elem_end;
    }
    Ok(())
}

/// Strips the block header (track varint, 16-bit timecode, flags) and
/// returns the single contained frame. Laced blocks return `None`.
fn block_frame(block: &[u8]) -> Option<&[u8]> {
    let (_, track_len) = read_varint_len(block)?;
    let header_len = track_len + 3;
    if block.len() <= header_len {
        return None;
    }
    let flags = block[track_len + 2];
    if flags & 0x06 != 0 {
        return None;
    }
    Some(&block[header_len..])
}

/// EBML element IDs keep their length-marker bits.
fn read_id(data: &[u8], pos: usize) -> Result<(u64, usize), WebmError> {
    let first = *data.get(pos).ok_or(WebmError::Truncated(pos))?;
    let len = (first.leading_zeros() as usize) + 1;
    if len > 4 {
        return Err(WebmError::BadVarint(pos));
    }
    if pos + len > data.len() {
        return Err(WebmError::Truncated(pos));
    }
    let mut value = 0u64;
    for &b in &data[pos..pos + len] {
        value = (value << 8) | b as u64;
    }
    Ok((value, len))
}

/// EBML sizes strip the marker bit; an all-ones payload means "unknown".
fn read_size(data: &[u8], pos: usize) -> Result<(u64, usize, bool), WebmError> {
    let first = *data.get(pos).ok_or(WebmError::Truncated(pos))?;
    let len = (first.leading_zeros() as usize) + 1;
    if len > 8 {
        return Err(WebmError::BadVarint(pos));
    }
    if pos + len > data.len() {
        return Err(WebmError::Truncated(pos));
    }
    let mut value = (first as u64) & ((1u64 << (8 - len)) - 1);
    for &b in &data[pos + 1..pos + len] {
        value = (value << 8) | b as u64;
    }
    let max = (1u64 << (7 * len)) - 1;
    Ok((value, len, value == max))
}

/// Length of a varint without interpreting its value (block track numbers).
fn read_varint_len(data: &[u8]) -> Option<(u64, usize)> {
    let first = *data.first()?;
    let len = (first.leading_zeros() as usize) + 1;
    if len > 8 || data.len() < len {
        return None;
    }
    let mut value = (first as u64) & ((1u64 << (8 - len)) - 1);
    for &b in &data[1..len] {
        value = (value << 8) | b as u64;
    }
    Some((value, len))
}
