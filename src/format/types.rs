use std::fmt;

use serde::{Deserialize, Serialize};

/// Highest channel count the media server handles per format
pub const MAX_CHANNELS: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaType {
    Audio,
    Video,
    Midi,
    Application,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaSubtype {
    Raw,
    Dsp,
    Encoded,
}

/// Sample formats, named after their SPA counterparts. `_OE` is the
/// opposite of native endianness, a trailing `P` means planar.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioFormat {
    Unknown,
    S8,
    U8,
    S16,
    U16,
    S24_32,
    U24_32,
    S32,
    U32,
    S24,
    U24,
    S20,
    U20,
    S18,
    U18,
    F32,
    F64,
    S16_OE,
    U16_OE,
    S24_32_OE,
    U24_32_OE,
    S32_OE,
    U32_OE,
    S24_OE,
    U24_OE,
    S20_OE,
    U20_OE,
    S18_OE,
    U18_OE,
    F32_OE,
    F64_OE,
    U8P,
    S16P,
    S24_32P,
    S32P,
    S24P,
    F32P,
    F64P,
    S8P,
}

impl AudioFormat {
    pub fn is_planar(self) -> bool {
        use AudioFormat::*;
        matches!(self, U8P | S16P | S24_32P | S32P | S24P | F32P | F64P | S8P)
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Speaker positions. `Aux(n)` covers the numbered auxiliary channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioChannel {
    Unknown,
    Mono,
    FL,
    FR,
    FC,
    LFE,
    SL,
    SR,
    FLC,
    FRC,
    RC,
    RL,
    RR,
    TC,
    TFL,
    TFC,
    TFR,
    TRL,
    TRC,
    TRR,
    RLC,
    RRC,
    FLW,
    FRW,
    LFE2,
    FLH,
    FCH,
    FRH,
    TFLC,
    TFRC,
    TSL,
    TSR,
    LLFE,
    RLFE,
    BC,
    BLC,
    BRC,
    Aux(u32),
}

const NAMED_CHANNELS: &[(AudioChannel, &str)] = &[
    (AudioChannel::Mono, "MONO"),
    (AudioChannel::FL, "FL"),
    (AudioChannel::FR, "FR"),
    (AudioChannel::FC, "FC"),
    (AudioChannel::LFE, "LFE"),
    (AudioChannel::SL, "SL"),
    (AudioChannel::SR, "SR"),
    (AudioChannel::FLC, "FLC"),
    (AudioChannel::FRC, "FRC"),
    (AudioChannel::RC, "RC"),
    (AudioChannel::RL, "RL"),
    (AudioChannel::RR, "RR"),
    (AudioChannel::TC, "TC"),
    (AudioChannel::TFL, "TFL"),
    (AudioChannel::TFC, "TFC"),
    (AudioChannel::TFR, "TFR"),
    (AudioChannel::TRL, "TRL"),
    (AudioChannel::TRC, "TRC"),
    (AudioChannel::TRR, "TRR"),
    (AudioChannel::RLC, "RLC"),
    (AudioChannel::RRC, "RRC"),
    (AudioChannel::FLW, "FLW"),
    (AudioChannel::FRW, "FRW"),
    (AudioChannel::LFE2, "LFE2"),
    (AudioChannel::FLH, "FLH"),
    (AudioChannel::FCH, "FCH"),
    (AudioChannel::FRH, "FRH"),
    (AudioChannel::TFLC, "TFLC"),
    (AudioChannel::TFRC, "TFRC"),
    (AudioChannel::TSL, "TSL"),
    (AudioChannel::TSR, "TSR"),
    (AudioChannel::LLFE, "LLFE"),
    (AudioChannel::RLFE, "RLFE"),
    (AudioChannel::BC, "BC"),
    (AudioChannel::BLC, "BLC"),
    (AudioChannel::BRC, "BRC"),
];

impl AudioChannel {
    /// Parse an `audio.channel` value. Anything unrecognised is `Unknown`.
    pub fn from_name(name: &str) -> Self {
        let upper = name.trim().to_ascii_uppercase();
        if let Some(n) = upper.strip_prefix("AUX")
            && let Ok(n) = n.parse()
        {
            return AudioChannel::Aux(n);
        }
        NAMED_CHANNELS
            .iter()
            .find(|(_, s)| *s == upper)
            .map(|(c, _)| *c)
            .unwrap_or(AudioChannel::Unknown)
    }

    pub fn name(&self) -> String {
        match self {
            AudioChannel::Unknown => "UNK".to_string(),
            AudioChannel::Aux(n) => format!("AUX{n}"),
            other => NAMED_CHANNELS
                .iter()
                .find(|(c, _)| c == other)
                .map(|(_, s)| s.to_string())
                .unwrap_or_default(),
        }
    }
}

/// A format field as advertised by a node: either fixed or a choice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Choice<T> {
    Value(T),
    /// A choice with a single, fixed child
    None(T),
    Enum(Vec<T>),
    Range { default: T, min: T, max: T },
}

/// One entry of a node's `EnumFormat` parameter list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatCandidate {
    pub media_type: MediaType,
    pub media_subtype: MediaSubtype,
    pub format: Option<Choice<AudioFormat>>,
    pub rate: Option<Choice<u32>>,
    pub channels: Option<Choice<u32>>,
    /// Never a choice; copied verbatim when present
    pub position: Option<Vec<AudioChannel>>,
}

impl FormatCandidate {
    pub fn raw_audio() -> Self {
        Self {
            media_type: MediaType::Audio,
            media_subtype: MediaSubtype::Raw,
            format: None,
            rate: None,
            channels: None,
            position: None,
        }
    }

    pub fn with_format(mut self, format: Choice<AudioFormat>) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_rate(mut self, rate: Choice<u32>) -> Self {
        self.rate = Some(rate);
        self
    }

    pub fn with_channels(mut self, channels: Choice<u32>) -> Self {
        self.channels = Some(channels);
        self
    }

    pub fn with_position(mut self, position: Vec<AudioChannel>) -> Self {
        self.position = Some(position);
        self
    }
}

/// A concrete raw audio format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioInfoRaw {
    pub format: AudioFormat,
    pub rate: u32,
    pub channels: u32,
    pub position: Vec<AudioChannel>,
    /// No channel position array is known
    pub unpositioned: bool,
}

impl Default for AudioInfoRaw {
    fn default() -> Self {
        Self {
            format: AudioFormat::Unknown,
            rate: 0,
            channels: 0,
            position: Vec::new(),
            unpositioned: true,
        }
    }
}

impl AudioInfoRaw {
    /// Comma separated position names, e.g. "FL,FR"
    pub fn position_string(&self) -> String {
        self.position
            .iter()
            .map(AudioChannel::name)
            .collect::<Vec<_>>()
            .join(",")
    }
}
