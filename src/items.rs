//! Built-in session item kinds
//!
//! Each kind registers a factory under its `si-*` name.  The shared helpers
//! below cover what the node-backed kinds have in common: reading the node
//! configuration, deriving endpoint properties, and listing ports per
//! context.

pub mod audio_adapter;
pub mod bluez5;
pub mod convert;
pub mod fake_stream;
pub mod monitor;
pub mod node;
pub mod softdsp;

use std::rc::Rc;

use crate::core::Core;
use crate::error::{Error, Result};
use crate::graph::{Direction, GraphState, ObjectId};
use crate::properties::Properties;
use crate::server::{ExportKind, NodeProxy};
use crate::session_item::{Endpoint, ItemId, PortDescriptor, SessionItem, keys};

pub use audio_adapter::AudioAdapter;
pub use bluez5::Bluez5Endpoint;
pub use convert::Convert;
pub use fake_stream::FakeStream;
pub use monitor::MonitorEndpoint;
pub use node::NodeItem;
pub use softdsp::SoftDspEndpoint;

pub const SI_NODE: &str = "si-node";
pub const SI_AUDIO_ADAPTER: &str = "si-audio-adapter";
pub const SI_CONVERT: &str = "si-convert";
pub const SI_AUDIO_SOFTDSP_ENDPOINT: &str = "si-audio-softdsp-endpoint";
pub const SI_BLUEZ5_ENDPOINT: &str = "si-bluez5-endpoint";
pub const SI_MONITOR_ENDPOINT: &str = "si-monitor-endpoint";
pub const SI_FAKE_STREAM: &str = "si-fake-stream";
pub const SI_STANDARD_LINK: &str = "si-standard-link";

/// Register every built-in kind with `core`.
pub fn register_all(core: &Core) {
    core.register_factory(SI_NODE, |this| Box::new(NodeItem::new(this)));
    core.register_factory(SI_AUDIO_ADAPTER, |this| Box::new(AudioAdapter::new(this)));
    core.register_factory(SI_CONVERT, |this| Box::new(Convert::new(this)));
    core.register_factory(SI_AUDIO_SOFTDSP_ENDPOINT, |this| {
        Box::new(SoftDspEndpoint::new(this))
    });
    core.register_factory(SI_BLUEZ5_ENDPOINT, |this| Box::new(Bluez5Endpoint::new(this)));
    core.register_factory(SI_MONITOR_ENDPOINT, |this| Box::new(MonitorEndpoint::new(this)));
    core.register_factory(SI_FAKE_STREAM, |this| Box::new(FakeStream::new(this)));
    core.register_factory(SI_STANDARD_LINK, |this| {
        Box::new(crate::link::StandardLink::new(this))
    });
    log::debug!("Registered built-in session item factories");
}

// ----- Shared helpers -----

/// Configuration common to the node-backed kinds.
#[derive(Clone)]
pub(crate) struct NodeConfig {
    pub node: Rc<dyn NodeProxy>,
    pub name: String,
    pub media_class: String,
    pub direction: Direction,
    pub role: Option<String>,
    pub priority: u32,
    pub session_id: Option<String>,
}

impl NodeConfig {
    /// Read `item.node` and friends, returning the config and the derived
    /// properties to store on the item.
    pub fn from_properties(item: &SessionItem, props: &Properties) -> Result<(Self, Properties)> {
        let core = item.require_core()?;
        let node_id: ObjectId = match props.get(keys::ITEM_NODE) {
            Some(_) => props
                .parse(keys::ITEM_NODE)
                .ok_or_else(|| Error::config(format!("{item}: invalid {}", keys::ITEM_NODE)))?,
            None => return Err(Error::config(format!("{item}: {} is required", keys::ITEM_NODE))),
        };
        let node = core
            .server()
            .node(node_id)
            .ok_or_else(|| Error::config(format!("{item}: node {node_id} does not exist")))?;

        let name = props
            .get(keys::NAME)
            .map(str::to_owned)
            .or_else(|| node.get_property("node.name"))
            .unwrap_or_else(|| "Unknown".to_string());
        let media_class = props
            .get(keys::MEDIA_CLASS)
            .map(str::to_owned)
            .or_else(|| node.get_property("media.class"))
            .unwrap_or_default();
        let direction = Direction::from_media_class(&media_class);
        let priority = props.parse(keys::PRIORITY).unwrap_or(0);

        let config = NodeConfig {
            node,
            name,
            media_class,
            direction,
            role: props.get(keys::ROLE).map(str::to_owned),
            priority,
            session_id: props.get(keys::SESSION_ID).map(str::to_owned),
        };

        let mut derived = Properties::new();
        derived.set(keys::ITEM_NODE, node_id.to_string());
        derived.set(keys::NAME, config.name.as_str());
        derived.set(keys::MEDIA_CLASS, config.media_class.as_str());
        derived.set(keys::DIRECTION, direction.as_str());
        derived.set(keys::PRIORITY, priority.to_string());
        if let Some(role) = &config.role {
            derived.set(keys::ROLE, role.as_str());
        }
        if let Some(session) = &config.session_id {
            derived.set(keys::SESSION_ID, session.as_str());
        }
        Ok((config, derived))
    }

    /// Endpoint properties derived from the node's own properties.
    pub fn endpoint_properties(&self) -> Properties {
        let node_props = self.node.properties();
        let mut props = Properties::new();
        props.update_keys(&node_props, &["media.role", "device.id", "node.target"]);
        props.set("endpoint.priority", self.priority.to_string());
        props.set("node.id", self.node.bound_id().to_string());

        const RENAMED: &[(&str, &str)] = &[
            ("node.description", "endpoint.description"),
            ("node.autoconnect", "endpoint.autoconnect"),
            ("device.icon-name", "endpoint.icon-name"),
            ("client.id", "endpoint.client.id"),
        ];
        for (from, to) in RENAMED {
            if let Some(v) = node_props.get(from) {
                props.set(*to, v);
            }
        }
        props
    }
}

/// Ports of `node_id` for a `Linkable` context, relative to `direction`.
pub(crate) fn ports_for_context(
    graph: &GraphState,
    node_id: ObjectId,
    direction: Direction,
    context: Option<&str>,
    allow_monitor: bool,
) -> Vec<PortDescriptor> {
    let (port_direction, monitor) = match context {
        None => (direction, false),
        Some(keys::CONTEXT_REVERSE) => (direction.reverse(), false),
        Some(keys::CONTEXT_MONITOR) if allow_monitor && direction == Direction::Input => {
            (Direction::Output, true)
        }
        Some(_) => return Vec::new(),
    };
    graph
        .ports_for_node_in(node_id, port_direction)
        .iter()
        .filter(|p| p.monitor == monitor)
        .map(PortDescriptor::from)
        .collect()
}

/// Description used when exporting an endpoint item.
pub(crate) fn endpoint_export(endpoint: &dyn Endpoint) -> (ExportKind, Properties) {
    let info = endpoint.registration_info();
    let mut props = endpoint.properties();
    props.update(&info.properties);
    props.set("endpoint.name", info.name);
    props.set("media.class", info.media_class);
    props.set("endpoint.direction", info.direction.as_str());
    props.set("endpoint.n-streams", endpoint.stream_count().to_string());
    (ExportKind::Endpoint, props)
}

/// Resolve an item id property, requiring the item to exist.
pub(crate) fn lookup_item_property(
    item: &SessionItem,
    props: &Properties,
    key: &str,
) -> Result<Rc<SessionItem>> {
    let core = item.require_core()?;
    let id: ItemId = match props.get(key) {
        Some(_) => props
            .parse(key)
            .ok_or_else(|| Error::config(format!("{item}: invalid {key}")))?,
        None => return Err(Error::config(format!("{item}: {key} is required"))),
    };
    core.lookup_item(id)
        .ok_or_else(|| Error::config(format!("{item}: {key} refers to unknown item {id}")))
}

/// Completes with the outcome of `item.activate`.
pub(crate) fn activate_item(item: &SessionItem) -> crate::server::OpFuture<()> {
    let (tx, rx) = futures::channel::oneshot::channel();
    item.activate(move |result| {
        let _ = tx.send(result);
    });
    Box::pin(async move { rx.await.unwrap_or(Err(Error::Cancelled)) })
}
