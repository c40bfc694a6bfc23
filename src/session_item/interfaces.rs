//! Capability interfaces
//!
//! A session item exposes any subset of these through the `as_*` probes on
//! [`SessionItem`]; callers check for `Some` before using one.

use std::rc::Rc;

use crate::error::Result;
use crate::format::{AudioChannel, AudioInfoRaw};
use crate::graph::{Direction, ObjectId, Port};
use crate::properties::Properties;
use crate::server::{OpFuture, PortConfigMode};

use super::item::SessionItem;

/// One port as seen by the linking code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortDescriptor {
    pub node_id: ObjectId,
    pub port_id: ObjectId,
    pub channel: AudioChannel,
}

impl From<&Port> for PortDescriptor {
    fn from(port: &Port) -> Self {
        Self {
            node_id: port.node_id,
            port_id: port.id,
            channel: port.channel_tag(),
        }
    }
}

/// How an endpoint registers itself with the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationInfo {
    pub name: String,
    pub media_class: String,
    pub direction: Direction,
    pub properties: Properties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRegistration {
    pub name: String,
    pub properties: Properties,
}

pub trait Endpoint {
    fn registration_info(&self) -> RegistrationInfo;
    fn properties(&self) -> Properties;
    fn stream_count(&self) -> usize;
    fn stream(&self, index: usize) -> Option<Rc<SessionItem>>;

    /// Arbiter consulted before a link may use one of this endpoint's streams.
    fn stream_acquisition(&self) -> Option<&dyn StreamAcquisition> {
        None
    }
}

pub trait Linkable {
    /// Ports for `context`: `None` is the item's own direction, then
    /// `"reverse"` and `"monitor"`. Unknown contexts yield nothing.
    fn ports(&self, context: Option<&str>) -> Vec<PortDescriptor>;
}

pub trait Stream {
    fn registration_info(&self) -> StreamRegistration;
    /// The endpoint owning this stream, which may be the item itself.
    fn parent_endpoint(&self) -> Option<Rc<SessionItem>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortsState {
    NotConfigured,
    Configuring,
    Configured,
}

pub trait Adapter {
    fn ports_state(&self) -> PortsState;
    /// Format and mode of the last successful `set_ports_format`
    fn ports_format(&self) -> Option<(Option<AudioInfoRaw>, PortConfigMode)>;
    /// Reconfigure the port layout. Resolves once the node reports its new
    /// ports; a newer request fails the pending one.
    fn set_ports_format(&self, format: Option<AudioInfoRaw>, mode: PortConfigMode) -> OpFuture<()>;
}

pub trait Link {
    fn out_stream(&self) -> Option<Rc<SessionItem>>;
    fn in_stream(&self) -> Option<Rc<SessionItem>>;
}

pub trait StreamAcquisition {
    /// Grant `link` the right to route `stream`, or refuse with
    /// `Error::AcquisitionRefused`.
    fn acquire(&self, link: &SessionItem, stream: &SessionItem) -> OpFuture<()>;
    fn release(&self, link: &SessionItem, stream: &SessionItem);
}

/// Convenience for kinds whose acquisition completes synchronously.
pub fn ready(result: Result<()>) -> OpFuture<()> {
    Box::pin(futures::future::ready(result))
}
