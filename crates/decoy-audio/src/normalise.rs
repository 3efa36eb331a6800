//! Codec decode and resampling to the canonical PCM representation.
//!
//! Every inbound chunk is reduced to 16 kHz, mono, 16-bit PCM before it is
//! relayed or transcribed. Stereo sources are downmixed by arithmetic
//! average; off-rate sources go through an FFT-based polyphase resampler.

use crate::error::AudioError;
use crate::webm;
use audiopus::{coder::Decoder as OpusDecoder, Channels, SampleRate};
use decoy_types::AudioCodec;
use rubato::{FftFixedIn, Resampler};
use std::io::Cursor;

/// Canonical sample rate for all downstream consumers.
pub const SAMPLE_RATE: u32 = 16_000;

/// Opus always decodes at 48 kHz when asked to.
const OPUS_DECODE_RATE: u32 = 48_000;

/// Maximum samples in one Opus frame: 120 ms at 48 kHz.
const OPUS_MAX_FRAME: usize = 5760;

/// Decodes one codec-framed chunk to canonical PCM.
///
/// The codec string comes straight off the wire; anything outside the
/// recognised set fails with `UnsupportedCodec` without touching the chunk.
pub fn normalise(codec: &str, payload: &[u8]) -> Result<Vec<i16>, AudioError> {
    let codec: AudioCodec = codec.parse()?;
    if payload.is_empty() {
        return Err(AudioError::EmptyPayload);
    }
    match codec {
        AudioCodec::WavPcm => decode_wav(payload),
        AudioCodec::Mp3 => decode_mp3(payload),
        AudioCodec::OggOpus => decode_ogg_opus(payload),
        AudioCodec::WebmOpus => decode_webm_opus(payload),
    }
}

/// Canonical PCM as little-endian bytes, the form that travels in relayed
/// `audio` envelopes and the recording log.
pub fn pcm_to_le_bytes(pcm: &[i16]) -> Vec<u8> {
    pcm.iter().flat_map(|s| s.to_le_bytes()).collect()
}

fn decode_wav(payload: &[u8]) -> Result<Vec<i16>, AudioError> {
    let mut reader = hound::WavReader::new(Cursor::new(payload)).map_err(|e| AudioError::Decode {
        codec: "wav-pcm",
        detail: e.to_string(),
    })?;
    let spec = reader.spec();

    let interleaved: Vec<i16> = match spec.sample_format {
        hound::SampleFormat::Int => reader
            .samples::<i16>()
            .collect::<Result<_, _>>()
            .map_err(|e| AudioError::Decode {
                codec: "wav-pcm",
                detail: e.to_string(),
            })?,
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * 32767.0) as i16))
            .collect::<Result<_, _>>()
            .map_err(|e| AudioError::Decode {
                codec: "wav-pcm",
                detail: e.to_string(),
            })?,
    };

    let mono = downmix(&interleaved, spec.channels as usize);
    resample_to_canonical(&mono, spec.sample_rate)
}

fn decode_mp3(payload: &[u8]) -> Result<Vec<i16>, AudioError> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(payload));
    let mut mono: Vec<i16> = Vec::new();
    let mut source_rate = 0u32;

    loop {
        match decoder.next_frame() {
            Ok(minimp3::Frame {
                data,
                sample_rate,
                channels,
                ..
            }) => {
                source_rate = sample_rate as u32;
                mono.extend(downmix(&data, channels));
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => {
                // A truncated trailing frame is routine for streamed chunks;
                // only fail when nothing decoded at all.
                if mono.is_empty() {
                    return Err(AudioError::Decode {
                        codec: "mp3",
                        detail: format!("{e:?}"),
                    });
                }
                tracing::debug!(error = ?e, "trailing mp3 frame dropped");
                break;
            }
        }
    }

    if mono.is_empty() {
        return Err(AudioError::Decode {
            codec: "mp3",
            detail: "no decodable frames".to_string(),
        });
    }
    resample_to_canonical(&mono, source_rate)
}

fn decode_ogg_opus(payload: &[u8]) -> Result<Vec<i16>, AudioError> {
    let mut reader = ogg::PacketReader::new(Cursor::new(payload));
    let mut decoder = opus_decoder()?;
    let mut pcm: Vec<i16> = Vec::new();
    let mut pre_skip: usize = 0;
    let mut packet_index = 0usize;

    loop {
        let packet = reader.read_packet().map_err(|e| AudioError::Decode {
            codec: "ogg-opus",
            detail: e.to_string(),
        })?;
        let Some(packet) = packet else { break };

        match packet_index {
            0 => {
                if !packet.data.starts_with(b"OpusHead") {
                    return Err(AudioError::Decode {
                        codec: "ogg-opus",
                        detail: "first packet is not OpusHead".to_string(),
                    });
                }
                if packet.data.len() >= 12 {
                    pre_skip = u16::from_le_bytes([packet.data[10], packet.data[11]]) as usize;
                }
            }
            1 => {
                // OpusTags; nothing useful for decoding.
            }
            _ => decode_opus_packet(&mut decoder, &packet.data, &mut pcm)?,
        }
        packet_index += 1;
    }

    if pcm.is_empty() {
        return Err(AudioError::Decode {
            codec: "ogg-opus",
            detail: "no audio packets in stream".to_string(),
        });
    }

    // Pre-skip is counted at 48 kHz, before resampling.
    let skip = pre_skip.min(pcm.len());
    resample_to_canonical(&pcm[skip..], OPUS_DECODE_RATE)
}

fn decode_webm_opus(payload: &[u8]) -> Result<Vec<i16>, AudioError> {
    let packets = webm::opus_packets(payload).map_err(|e| AudioError::Decode {
        codec: "webm-opus",
        detail: e.to_string(),
    })?;
    if packets.is_empty() {
        return Err(AudioError::Decode {
            codec: "webm-opus",
            detail: "no opus blocks in cluster".to_string(),
        });
    }

    let mut decoder = opus_decoder()?;
    let mut pcm: Vec<i16> = Vec::new();
    for packet in packets {
        decode_opus_packet(&mut decoder, packet, &mut pcm)?;
    }
    resample_to_canonical(&pcm, OPUS_DECODE_RATE)
}

fn opus_decoder() -> Result<OpusDecoder, AudioError> {
    // Decoding to mono lets libopus fold stereo streams down for us.
    OpusDecoder::new(SampleRate::Hz48000, Channels::Mono).map_err(|e| AudioError::Decode {
        codec: "opus",
        detail: e.to_string(),
    })
}

fn decode_opus_packet(
    decoder: &mut OpusDecoder,
    data: &[u8],
    out: &mut Vec<i16>,
) -> Result<(), AudioError> {
    let mut frame = vec![0i16; OPUS_MAX_FRAME];
    let samples = decoder
        .decode(Some(data), &mut frame[..], false)
        .map_err(|e| AudioError::Decode {
            codec: "opus",
            detail: e.to_string(),
        })?;
    out.extend_from_slice(&frame[..samples]);
    Ok(())
}

/// Arithmetic-average downmix of interleaved multi-channel PCM.
fn downmix(interleaved: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / frame.len() as i32) as i16
        })
        .collect()
}

/// Resamples mono PCM to the canonical 16 kHz using an FFT polyphase stage.
fn resample_to_canonical(samples: &[i16], input_rate: u32) -> Result<Vec<i16>, AudioError> {
    if input_rate == SAMPLE_RATE {
        return Ok(samples.to_vec());
    }
    if input_rate == 0 || samples.is_empty() {
        return Err(AudioError::Resample(format!(
            "cannot resample {} samples at {input_rate} Hz",
            samples.len()
        )));
    }

    let chunk_size = 1024usize;
    let mut resampler =
        FftFixedIn::<f32>::new(input_rate as usize, SAMPLE_RATE as usize, chunk_size, 2, 1)
            .map_err(|e| AudioError::Resample(e.to_string()))?;

    let mut input: Vec<f32> = samples.iter().map(|&s| s as f32 / 32768.0).collect();
    // Zero-pad the tail so the final partial chunk flushes through.
    let remainder = input.len() % chunk_size;
    if remainder != 0 {
        input.resize(input.len() + (chunk_size - remainder), 0.0);
    }

    let mut output = Vec::with_capacity(
        (samples.len() as u64 * SAMPLE_RATE as u64 / input_rate as u64) as usize + chunk_size,
    );
    for chunk in input.chunks(chunk_size) {
        let resampled = resampler
            .process(&[chunk.to_vec()], None)
            .map_err(|e| AudioError::Resample(e.to_string()))?;
        for &sample in &resampled[0] {
            output.push((sample.clamp(-1.0, 1.0) * 32767.0) as i16);
        }
    }
    Ok(output)
}
