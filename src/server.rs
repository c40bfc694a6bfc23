//! Media server transport interface
//!
//! The session items never talk to the server directly; they go through
//! these traits.  A transport implementation wraps the real proxies, and the
//! unit tests plug in an in-memory server.
//!
//! Async operations are plain local futures polled by the [`MainLoop`]
//! (`crate::main_loop::MainLoop`).

use std::ops::{BitOr, BitOrAssign};
use std::rc::Rc;

use futures::future::LocalBoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::format::{AudioInfoRaw, FormatCandidate};
use crate::graph::{Direction, ObjectId};
use crate::properties::Properties;

pub type OpFuture<T> = LocalBoxFuture<'static, Result<T>>;

/// Identifies a connected signal handler so it can be disconnected.
pub type HandlerId = u64;

/// Proxy feature bits that can be requested with `activate`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ProxyFeatures(u32);

impl ProxyFeatures {
    pub const NONE: Self = Self(0);
    /// Bound to a global
    pub const MINIMAL: Self = Self(1 << 0);
    /// Port list is tracked (nodes only)
    pub const PORTS: Self = Self(1 << 1);
    /// Param enumeration and setting
    pub const PARAMS: Self = Self(1 << 2);
    pub const ALL: Self = Self(0b111);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for ProxyFeatures {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ProxyFeatures {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamKind {
    EnumFormat,
    Format,
    PortConfig,
    Profile,
}

/// How an adapter lays out its ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortConfigMode {
    /// No ports
    None,
    /// One mono F32 port per channel, converted internally
    Dsp,
    /// The device's own format, no conversion
    Passthrough,
    /// Converter node: converts between both sides
    Convert,
}

impl PortConfigMode {
    pub fn parse(mode: &str) -> Option<Self> {
        match mode {
            "none" => Some(PortConfigMode::None),
            "dsp" => Some(PortConfigMode::Dsp),
            "passthrough" => Some(PortConfigMode::Passthrough),
            "convert" => Some(PortConfigMode::Convert),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PortConfigMode::None => "none",
            PortConfigMode::Dsp => "dsp",
            PortConfigMode::Passthrough => "passthrough",
            PortConfigMode::Convert => "convert",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    pub direction: Direction,
    pub mode: PortConfigMode,
    pub monitor: bool,
    pub control: bool,
    pub format: Option<AudioInfoRaw>,
}

/// Parameters the session items set on nodes and devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Param {
    Format(AudioInfoRaw),
    PortConfig(PortConfig),
    Profile { index: u32 },
}

impl Param {
    pub fn kind(&self) -> ParamKind {
        match self {
            Param::Format(_) => ParamKind::Format,
            Param::PortConfig(_) => ParamKind::PortConfig,
            Param::Profile { .. } => ParamKind::Profile,
        }
    }
}

pub trait NodeProxy {
    fn bound_id(&self) -> ObjectId;
    fn properties(&self) -> Properties;

    fn get_property(&self, key: &str) -> Option<String> {
        self.properties().get(key).map(str::to_owned)
    }

    fn features(&self) -> ProxyFeatures;
    fn activate(&self, features: ProxyFeatures) -> OpFuture<()>;
    fn enum_params(&self, kind: ParamKind) -> OpFuture<Vec<FormatCandidate>>;
    fn set_param(&self, param: Param);
    fn suspend(&self);

    /// Called whenever the node's port set changes (e.g. after PortConfig).
    fn connect_ports_changed(&self, callback: Rc<dyn Fn()>) -> HandlerId;
    fn disconnect(&self, handler: HandlerId);
}

/// A native link. Dropping the last handle destroys it on the server
/// unless it was created with `object.linger`.
pub trait LinkProxy {
    fn bound_id(&self) -> ObjectId;
    fn activate(&self, features: ProxyFeatures) -> OpFuture<()>;
}

pub trait DeviceProxy {
    fn bound_id(&self) -> ObjectId;
    fn properties(&self) -> Properties;
    fn set_param(&self, param: Param);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportKind {
    Endpoint,
    EndpointLink,
}

/// An object published on the server on behalf of a session item.
/// Dropping the last handle withdraws it.
pub trait ExportedProxy {
    fn bound_id(&self) -> ObjectId;
    fn activate(&self, features: ProxyFeatures) -> OpFuture<()>;
    /// Called once if the server destroys the object.
    fn connect_destroyed(&self, callback: Box<dyn Fn()>);
}

pub trait MediaServer {
    fn node(&self, id: ObjectId) -> Option<Rc<dyn NodeProxy>>;
    fn device(&self, id: ObjectId) -> Option<Rc<dyn DeviceProxy>>;
    fn create_node(&self, factory: &str, props: Properties) -> Result<Rc<dyn NodeProxy>>;
    fn create_link(&self, props: Properties) -> Result<Rc<dyn LinkProxy>>;
    fn export(&self, kind: ExportKind, props: Properties) -> Result<Rc<dyn ExportedProxy>>;
    /// Properties of the connection, e.g. `default.clock.rate`
    fn remote_properties(&self) -> Properties;
}
