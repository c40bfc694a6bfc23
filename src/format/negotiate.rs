//! Raw audio format selection
//!
//! Picks one concrete format out of the choices a node advertises in its
//! `EnumFormat` list.  Rates gravitate towards 48 kHz, channel counts towards
//! the caller's preference, and sample formats follow a fixed ranking that
//! favours whatever needs the least conversion from the F32 DSP pipeline.

use super::types::*;

const PREFERRED_RATE: u32 = 48000;

/// Sample format ranking, best first.
const FORMAT_ORDER: &[AudioFormat] = &[
    // no conversion from the internal pipeline format
    AudioFormat::F32,
    AudioFormat::S16,
    AudioFormat::U16,
    // aligned to sizeof(int), best quality first
    AudioFormat::S32,
    AudioFormat::U32,
    AudioFormat::S24_32,
    AudioFormat::U24_32,
    AudioFormat::F64,
    // reverse endianness
    AudioFormat::F32_OE,
    AudioFormat::S16_OE,
    AudioFormat::U16_OE,
    AudioFormat::S32_OE,
    AudioFormat::U32_OE,
    AudioFormat::S24_32_OE,
    AudioFormat::U24_32_OE,
    AudioFormat::F64_OE,
    // unaligned
    AudioFormat::S24,
    AudioFormat::U24,
    AudioFormat::S20,
    AudioFormat::U20,
    AudioFormat::S18,
    AudioFormat::U18,
    AudioFormat::S24_OE,
    AudioFormat::U24_OE,
    AudioFormat::S20_OE,
    AudioFormat::U20_OE,
    AudioFormat::S18_OE,
    AudioFormat::U18_OE,
    // 8-bit is bad quality
    AudioFormat::S8,
    AudioFormat::U8,
    // planar formats are discouraged
    AudioFormat::F32P,
    AudioFormat::S16P,
    AudioFormat::S32P,
    AudioFormat::S24_32P,
    AudioFormat::S24P,
    AudioFormat::F64P,
    AudioFormat::U8P,
];

fn format_rank(format: AudioFormat) -> Option<usize> {
    FORMAT_ORDER.iter().position(|f| *f == format)
}

fn select_format(value: &Choice<AudioFormat>) -> AudioFormat {
    match value {
        Choice::Value(f) | Choice::None(f) => *f,
        Choice::Enum(options) => options
            .iter()
            .filter_map(|f| format_rank(*f))
            .min()
            .map(|rank| FORMAT_ORDER[rank])
            .unwrap_or(AudioFormat::Unknown),
        // not something nodes advertise for an id
        Choice::Range { .. } => AudioFormat::Unknown,
    }
}

fn select_rate(value: &Choice<u32>) -> u32 {
    match value {
        Choice::Value(r) | Choice::None(r) => *r,
        Choice::Enum(options) => closest(options, PREFERRED_RATE),
        // drivers misreport the default and sometimes swap min/max
        Choice::Range { min, max, .. } => {
            let lo = (*min).min(*max);
            let hi = (*min).max(*max);
            PREFERRED_RATE.clamp(lo, hi)
        }
    }
}

fn select_channels(value: &Choice<u32>, preference: u32) -> u32 {
    match value {
        Choice::Value(c) | Choice::None(c) => *c,
        Choice::Enum(options) => closest(options, preference),
        // don't trust max to really be the max
        Choice::Range { min, max, .. } => (*min).max(preference).min(*max),
    }
}

/// First member with the smallest distance to `target`; 0 for an empty set.
fn closest(options: &[u32], target: u32) -> u32 {
    let mut best: Option<u32> = None;
    for &v in options {
        match best {
            Some(b) if v.abs_diff(target) >= b.abs_diff(target) => {}
            _ => best = Some(v),
        }
    }
    best.unwrap_or(0)
}

/// Choose the raw audio format with the most channels out of `candidates`.
///
/// Candidates that are not `audio/raw`, resolve to an unknown sample format,
/// or yield no channels are skipped; on ties the first one seen wins.
/// Returns `None` when nothing usable was advertised.
pub fn choose_sensible_raw_audio_format(
    candidates: &[FormatCandidate],
    channels_preference: u32,
) -> Option<AudioInfoRaw> {
    let mut best: Option<AudioInfoRaw> = None;
    let mut most_channels = 0;

    for candidate in candidates {
        if candidate.media_type != MediaType::Audio || candidate.media_subtype != MediaSubtype::Raw
        {
            continue;
        }

        let mut raw = AudioInfoRaw::default();
        if let Some(format) = &candidate.format {
            raw.format = select_format(format);
        }
        if let Some(rate) = &candidate.rate {
            raw.rate = select_rate(rate);
        }
        if let Some(channels) = &candidate.channels {
            raw.channels = select_channels(channels, channels_preference);
        }
        if let Some(position) = &candidate.position {
            raw.position = position.clone();
            raw.unpositioned = false;
        }

        if raw.format != AudioFormat::Unknown && raw.channels > most_channels {
            most_channels = raw.channels;
            best = Some(raw);
        }
    }

    if best.is_none() {
        log::debug!(
            "No usable raw audio format among {} candidates",
            candidates.len()
        );
    }
    best
}
