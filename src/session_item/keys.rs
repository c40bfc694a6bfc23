//! Configuration and property keys used by the session items.

pub const ITEM_FACTORY_NAME: &str = "item.factory.name";
pub const ITEM_ID: &str = "item.id";

pub const ITEM_NODE: &str = "item.node";
pub const NAME: &str = "name";
pub const MEDIA_CLASS: &str = "media.class";
pub const DIRECTION: &str = "direction";
pub const ROLE: &str = "role";
pub const PRIORITY: &str = "priority";
pub const SESSION_ID: &str = "session.id";

pub const ENABLE_CONTROL_PORT: &str = "enable.control.port";
pub const ENABLE_MONITOR: &str = "enable.monitor";
pub const PREFERRED_N_CHANNELS: &str = "preferred.n.channels";
pub const DISABLE_DSP: &str = "disable.dsp";

pub const ADAPTER: &str = "adapter";
pub const TARGET: &str = "target";

pub const DEVICE_ID: &str = "device.id";
pub const A2DP_STREAM: &str = "a2dp.stream";
pub const SCO_STREAM: &str = "sco.stream";

pub const OUT_ITEM: &str = "out.item";
pub const IN_ITEM: &str = "in.item";
pub const OUT_ITEM_PORT_CONTEXT: &str = "out.item.port.context";
pub const IN_ITEM_PORT_CONTEXT: &str = "in.item.port.context";
pub const MANAGE_LIFETIME: &str = "manage.lifetime";
pub const PASSIVE: &str = "passive";

pub const AUDIO_FORMAT: &str = "audio.format";
pub const AUDIO_RATE: &str = "audio.rate";
pub const AUDIO_CHANNELS: &str = "audio.channels";
pub const AUDIO_POSITION: &str = "audio.position";

/// Port contexts understood by `Linkable::ports`
pub const CONTEXT_REVERSE: &str = "reverse";
pub const CONTEXT_MONITOR: &str = "monitor";
