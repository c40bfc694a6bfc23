mod negotiate;
mod types;

pub use negotiate::choose_sensible_raw_audio_format;
pub use types::*;
