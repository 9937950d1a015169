//! Timeline planning and per-direction Ogg/Opus encoding.
//!
//! Captured RTP timestamps are wall-clock-aligned and rewritten to a dense
//! monotonic 48 kHz clock relative to the earliest packet of either
//! direction (1 ms = 48 ticks). The outbound stream is delayed by a fixed
//! offset so the model's speech lines up with what the caller heard.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use bytes::Bytes;

use super::ogg::{OggOpusWriter, SAMPLES_PER_FRAME};
use super::AudioChunk;

/// 48 kHz ticks per millisecond.
pub const TICKS_PER_MS: u64 = 48;

/// Fixed alignment delay applied to the outbound stream.
pub const OUTBOUND_DELAY_MS: u64 = 1000;

/// Silence appended after the last packet.
pub const TRAILING_SILENCE_MS: u64 = 2000;

/// Floor on the produced stream duration.
pub const MIN_DURATION_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeline {
    pub earliest_ms: u64,
    pub latest_ms: u64,
    /// `max(latest − earliest + 2 s, 100 ms)`.
    pub duration_ms: u64,
}

/// Plan the common timeline across both directions.
pub fn plan_timeline(inbound: &[AudioChunk], outbound: &[AudioChunk]) -> Option<Timeline> {
    let times = inbound
        .iter()
        .chain(outbound.iter())
        .map(|chunk| chunk.receive_time_ms);
    let (mut earliest, mut latest) = (u64::MAX, 0u64);
    let mut any = false;
    for t in times {
        any = true;
        earliest = earliest.min(t);
        latest = latest.max(t);
    }
    if !any {
        return None;
    }
    Some(Timeline {
        earliest_ms: earliest,
        latest_ms: latest,
        duration_ms: (latest - earliest + TRAILING_SILENCE_MS).max(MIN_DURATION_MS),
    })
}

/// An RTP payload with its rewritten 48 kHz timestamp.
#[derive(Debug, Clone)]
pub struct RewrittenChunk {
    pub ts: u64,
    pub payload: Bytes,
}

/// Rewrite receive times to dense 48 kHz ticks relative to `earliest_ms`,
/// shifting by `delay_ms`. Order is preserved and made monotonic.
pub fn rewrite_chunks(chunks: &[AudioChunk], earliest_ms: u64, delay_ms: u64) -> Vec<RewrittenChunk> {
    let mut out = Vec::with_capacity(chunks.len());
    let mut last_ts = 0u64;
    for chunk in chunks {
        let relative = chunk.receive_time_ms.saturating_sub(earliest_ms) + delay_ms;
        let mut ts = relative * TICKS_PER_MS;
        // Clock skew between the capture points must not move time backwards.
        if ts < last_ts {
            ts = last_ts;
        }
        last_ts = ts;
        out.push(RewrittenChunk {
            ts,
            payload: chunk.payload.clone(),
        });
    }
    out
}

/// Write one direction as a mono Ogg/Opus file of exactly `duration_ms`
/// (the final page carries the padded granule).
pub fn write_mono_ogg(
    path: &Path,
    chunks: &[RewrittenChunk],
    duration_ms: u64,
) -> anyhow::Result<()> {
    let file = File::create(path)?;
    let mut writer = OggOpusWriter::new(BufWriter::new(file), rand::random::<u32>());
    writer.write_headers()?;
    for chunk in chunks {
        writer.write_packet(&chunk.payload, chunk.ts + SAMPLES_PER_FRAME, false)?;
    }
    writer.finish(duration_ms * TICKS_PER_MS)?;
    Ok(())
}

// ── Tests ──────────────────────────────────────────────────────────
