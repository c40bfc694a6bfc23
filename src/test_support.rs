//! In-memory media server and fixtures for the unit tests.
//!
//! Operations complete immediately unless `hold_ops` is set, in which case
//! they wait until `release_held` resolves them.  Port changes requested
//! through `PortConfig` are applied to the graph mirror right away and
//! announced by `Fixture::run`, the way a real server emits them from its
//! own loop iteration.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use futures::channel::oneshot;

use crate::config::Settings;
use crate::core::Core;
use crate::error::{Error, Result};
use crate::format::{AudioChannel, FormatCandidate};
use crate::graph::{Direction, GraphState, Link, Node, ObjectId, Port};
use crate::properties::Properties;
use crate::server::{
    DeviceProxy, ExportKind, ExportedProxy, HandlerId, LinkProxy, MediaServer, NodeProxy,
    OpFuture, Param, ParamKind, PortConfig, PortConfigMode, ProxyFeatures,
};
use crate::session_item::ready;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ----- Operation control -----

#[derive(Default)]
struct OpControl {
    hold: Cell<bool>,
    held: RefCell<Vec<oneshot::Sender<Result<()>>>>,
    fail_links: Cell<bool>,
    fail_export: Cell<bool>,
}

impl OpControl {
    fn op(&self, fail: bool) -> OpFuture<()> {
        if fail {
            return ready(Err(Error::failed("injected failure")));
        }
        if self.hold.get() {
            let (tx, rx) = oneshot::channel();
            self.held.borrow_mut().push(tx);
            return Box::pin(async move {
                rx.await
                    .unwrap_or_else(|_| Err(Error::failed("operation dropped")))
            });
        }
        ready(Ok(()))
    }
}

// ----- Nodes -----

pub struct FakeNode {
    pub id: ObjectId,
    props: Properties,
    graph: Arc<GraphState>,
    ids: Rc<Cell<ObjectId>>,
    ops: Rc<OpControl>,
    features: Cell<ProxyFeatures>,
    pub activations: Cell<u32>,
    pub suspends: Cell<u32>,
    formats: RefCell<Vec<FormatCandidate>>,
    params: RefCell<Vec<Param>>,
    handlers: RefCell<Vec<(HandlerId, Rc<dyn Fn()>)>>,
    next_handler: Cell<HandlerId>,
    ports_changed: Cell<bool>,
}

impl FakeNode {
    pub fn set_formats(&self, formats: Vec<FormatCandidate>) {
        *self.formats.borrow_mut() = formats;
    }

    pub fn params(&self) -> Vec<Param> {
        self.params.borrow().clone()
    }

    pub fn port_configs(&self) -> Vec<PortConfig> {
        self.params
            .borrow()
            .iter()
            .filter_map(|p| match p {
                Param::PortConfig(cfg) => Some(cfg.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.borrow().len()
    }

    fn rebuild_ports(&self, cfg: &PortConfig) {
        for port in self.graph.ports_for_node(self.id) {
            let stale = (port.direction == cfg.direction && !port.monitor)
                || (port.monitor && cfg.direction == Direction::Input);
            if stale {
                self.graph.remove_port(port.id);
            }
        }
        self.ports_changed.set(true);
        if cfg.mode == PortConfigMode::None {
            return;
        }

        let channels: Vec<AudioChannel> = match &cfg.format {
            Some(info) if !info.position.is_empty() => info.position.clone(),
            Some(info) if info.channels > 0 => vec![AudioChannel::Unknown; info.channels as usize],
            _ => vec![AudioChannel::Mono],
        };
        let prefix = match cfg.direction {
            Direction::Input => "playback",
            Direction::Output => "capture",
        };
        for (i, ch) in channels.iter().enumerate() {
            self.add_port(format!("{prefix}_{i}"), cfg.direction, *ch, false);
            if cfg.monitor && cfg.direction == Direction::Input {
                self.add_port(format!("monitor_{i}"), Direction::Output, *ch, true);
            }
        }
    }

    fn add_port(&self, name: String, direction: Direction, channel: AudioChannel, monitor: bool) -> ObjectId {
        let id = next_id(&self.ids);
        self.graph.insert_port(Port {
            id,
            node_id: self.id,
            name,
            direction,
            channel: match channel {
                AudioChannel::Unknown => None,
                ch => Some(ch.name()),
            },
            monitor,
            physical_index: None,
        });
        id
    }
}

impl NodeProxy for FakeNode {
    fn bound_id(&self) -> ObjectId {
        self.id
    }

    fn properties(&self) -> Properties {
        self.props.clone()
    }

    fn features(&self) -> ProxyFeatures {
        self.features.get()
    }

    fn activate(&self, features: ProxyFeatures) -> OpFuture<()> {
        self.activations.set(self.activations.get() + 1);
        self.features.set(self.features.get() | features);
        self.ops.op(false)
    }

    fn enum_params(&self, _kind: ParamKind) -> OpFuture<Vec<FormatCandidate>> {
        let formats = self.formats.borrow().clone();
        Box::pin(futures::future::ready(Ok(formats)))
    }

    fn set_param(&self, param: Param) {
        if let Param::PortConfig(cfg) = &param {
            self.rebuild_ports(cfg);
        }
        self.params.borrow_mut().push(param);
    }

    fn suspend(&self) {
        self.suspends.set(self.suspends.get() + 1);
    }

    fn connect_ports_changed(&self, callback: Rc<dyn Fn()>) -> HandlerId {
        let id = self.next_handler.get();
        self.next_handler.set(id + 1);
        self.handlers.borrow_mut().push((id, callback));
        id
    }

    fn disconnect(&self, handler: HandlerId) {
        self.handlers.borrow_mut().retain(|(id, _)| *id != handler);
    }
}

// ----- Devices -----

pub struct FakeDevice {
    pub id: ObjectId,
    props: Properties,
    params: RefCell<Vec<Param>>,
}

impl FakeDevice {
    pub fn params(&self) -> Vec<Param> {
        self.params.borrow().clone()
    }
}

impl DeviceProxy for FakeDevice {
    fn bound_id(&self) -> ObjectId {
        self.id
    }

    fn properties(&self) -> Properties {
        self.props.clone()
    }

    fn set_param(&self, param: Param) {
        self.params.borrow_mut().push(param);
    }
}

// ----- Links -----

struct FakeLink {
    id: ObjectId,
    linger: bool,
    graph: Arc<GraphState>,
    ops: Rc<OpControl>,
}

impl LinkProxy for FakeLink {
    fn bound_id(&self) -> ObjectId {
        self.id
    }

    fn activate(&self, _features: ProxyFeatures) -> OpFuture<()> {
        self.ops.op(self.ops.fail_links.get())
    }
}

impl Drop for FakeLink {
    fn drop(&mut self) {
        if !self.linger {
            self.graph.remove_link(self.id);
        }
    }
}

// ----- Exported objects -----

pub struct FakeExported {
    pub id: ObjectId,
    pub kind: ExportKind,
    pub props: Properties,
    ops: Rc<OpControl>,
    destroyed: RefCell<Vec<Box<dyn Fn()>>>,
}

impl ExportedProxy for FakeExported {
    fn bound_id(&self) -> ObjectId {
        self.id
    }

    fn activate(&self, _features: ProxyFeatures) -> OpFuture<()> {
        self.ops.op(false)
    }

    fn connect_destroyed(&self, callback: Box<dyn Fn()>) {
        self.destroyed.borrow_mut().push(callback);
    }
}

// ----- Server -----

pub struct FakeServer {
    graph: Arc<GraphState>,
    ids: Rc<Cell<ObjectId>>,
    ops: Rc<OpControl>,
    nodes: RefCell<BTreeMap<ObjectId, Rc<FakeNode>>>,
    devices: RefCell<BTreeMap<ObjectId, Rc<FakeDevice>>>,
    created_links: RefCell<Vec<Properties>>,
    exported: RefCell<Vec<Weak<FakeExported>>>,
    remote: RefCell<Properties>,
}

fn next_id(ids: &Cell<ObjectId>) -> ObjectId {
    let id = ids.get();
    ids.set(id + 1);
    id
}

impl FakeServer {
    pub fn new(graph: Arc<GraphState>) -> Self {
        Self {
            graph,
            ids: Rc::new(Cell::new(100)),
            ops: Rc::new(OpControl::default()),
            nodes: RefCell::new(BTreeMap::new()),
            devices: RefCell::new(BTreeMap::new()),
            created_links: RefCell::new(Vec::new()),
            exported: RefCell::new(Vec::new()),
            remote: RefCell::new(Properties::new()),
        }
    }

    pub fn add_node(&self, props: Properties) -> Rc<FakeNode> {
        let id = next_id(&self.ids);
        let mut props = props;
        props.set("object.id", id.to_string());
        let node = Rc::new(FakeNode {
            id,
            props: props.clone(),
            graph: self.graph.clone(),
            ids: self.ids.clone(),
            ops: self.ops.clone(),
            features: Cell::new(ProxyFeatures::NONE),
            activations: Cell::new(0),
            suspends: Cell::new(0),
            formats: RefCell::new(Vec::new()),
            params: RefCell::new(Vec::new()),
            handlers: RefCell::new(Vec::new()),
            next_handler: Cell::new(1),
            ports_changed: Cell::new(false),
        });
        self.graph.insert_node(Node::new(id, props));
        self.nodes.borrow_mut().insert(id, node.clone());
        node
    }

    /// Add a port directly, outside any `PortConfig`.
    pub fn add_port(&self, node: &FakeNode, direction: Direction, channel: AudioChannel) -> ObjectId {
        let n = self.graph.ports_for_node_in(node.id, direction).len();
        let prefix = match direction {
            Direction::Input => "input",
            Direction::Output => "output",
        };
        node.add_port(format!("{prefix}_{n}"), direction, channel, false)
    }

    pub fn add_monitor_port(&self, node: &FakeNode, channel: AudioChannel) -> ObjectId {
        let n = self.graph.ports_for_node(node.id).len();
        node.add_port(format!("monitor_{n}"), Direction::Output, channel, true)
    }

    pub fn add_device(&self, props: Properties) -> Rc<FakeDevice> {
        let id = next_id(&self.ids);
        let device = Rc::new(FakeDevice {
            id,
            props,
            params: RefCell::new(Vec::new()),
        });
        self.devices.borrow_mut().insert(id, device.clone());
        device
    }

    pub fn set_remote_property(&self, key: &str, value: &str) {
        self.remote.borrow_mut().set(key, value);
    }

    pub fn hold_ops(&self, hold: bool) {
        self.ops.hold.set(hold);
    }

    pub fn held_count(&self) -> usize {
        self.ops.held.borrow().len()
    }

    /// Resolve every held operation with `result`.
    pub fn release_held(&self, result: Result<()>) {
        let held = std::mem::take(&mut *self.ops.held.borrow_mut());
        for tx in held {
            let _ = tx.send(result.clone());
        }
    }

    pub fn fail_link_activation(&self, fail: bool) {
        self.ops.fail_links.set(fail);
    }

    pub fn fail_export(&self, fail: bool) {
        self.ops.fail_export.set(fail);
    }

    pub fn created_links(&self) -> Vec<Properties> {
        self.created_links.borrow().clone()
    }

    pub fn live_links(&self) -> Vec<Link> {
        let mut links: Vec<Link> = self
            .nodes
            .borrow()
            .keys()
            .flat_map(|id| self.graph.links_for_node(*id))
            .collect();
        links.sort_by_key(|l| l.id);
        links.dedup_by_key(|l| l.id);
        links
    }

    pub fn exported(&self) -> Vec<Rc<FakeExported>> {
        self.exported.borrow().iter().filter_map(Weak::upgrade).collect()
    }

    /// Simulate the server destroying an exported object.
    pub fn destroy_exported(&self, id: ObjectId) {
        let target = self.exported().into_iter().find(|e| e.id == id);
        if let Some(exported) = target {
            for cb in exported.destroyed.borrow().iter() {
                cb();
            }
        }
    }

    /// Deliver pending ports-changed notifications. Returns how many nodes
    /// were notified.
    pub fn flush_events(&self) -> usize {
        let nodes: Vec<Rc<FakeNode>> = self.nodes.borrow().values().cloned().collect();
        let mut notified = 0;
        for node in nodes {
            if !node.ports_changed.replace(false) {
                continue;
            }
            notified += 1;
            let handlers: Vec<Rc<dyn Fn()>> =
                node.handlers.borrow().iter().map(|(_, h)| h.clone()).collect();
            for handler in handlers {
                handler();
            }
        }
        notified
    }
}

impl MediaServer for FakeServer {
    fn node(&self, id: ObjectId) -> Option<Rc<dyn NodeProxy>> {
        self.nodes
            .borrow()
            .get(&id)
            .map(|n| n.clone() as Rc<dyn NodeProxy>)
    }

    fn device(&self, id: ObjectId) -> Option<Rc<dyn DeviceProxy>> {
        self.devices
            .borrow()
            .get(&id)
            .map(|d| d.clone() as Rc<dyn DeviceProxy>)
    }

    fn create_node(&self, factory: &str, props: Properties) -> Result<Rc<dyn NodeProxy>> {
        let mut props = props;
        props.set("factory.name", factory);
        Ok(self.add_node(props))
    }

    fn create_link(&self, props: Properties) -> Result<Rc<dyn LinkProxy>> {
        let id = next_id(&self.ids);
        let link = Link::from_properties(id, &props)
            .ok_or_else(|| Error::failed("link properties incomplete"))?;
        self.graph.insert_link(link);
        self.created_links.borrow_mut().push(props.clone());
        Ok(Rc::new(FakeLink {
            id,
            linger: props.get_bool("object.linger").unwrap_or(false),
            graph: self.graph.clone(),
            ops: self.ops.clone(),
        }))
    }

    fn export(&self, kind: ExportKind, props: Properties) -> Result<Rc<dyn ExportedProxy>> {
        if self.ops.fail_export.get() {
            return Err(Error::failed("export refused"));
        }
        let exported = Rc::new(FakeExported {
            id: next_id(&self.ids),
            kind,
            props,
            ops: self.ops.clone(),
            destroyed: RefCell::new(Vec::new()),
        });
        self.exported.borrow_mut().push(Rc::downgrade(&exported));
        Ok(exported)
    }

    fn remote_properties(&self) -> Properties {
        self.remote.borrow().clone()
    }
}

// ----- Fixture -----

pub struct Fixture {
    pub core: Core,
    pub server: Rc<FakeServer>,
}

impl Fixture {
    /// Run the loop and deliver server events until nothing is left to do.
    pub fn run(&self) {
        loop {
            self.core.run_until_stalled();
            if self.server.flush_events() == 0 {
                break;
            }
        }
    }

    /// `node.name` / `media.class` node with one port per channel.
    pub fn add_node_with_ports(
        &self,
        name: &str,
        media_class: &str,
        channels: &[AudioChannel],
    ) -> Rc<FakeNode> {
        let node = self.server.add_node(crate::properties! {
            "node.name" => name,
            "media.class" => media_class,
        });
        let direction = Direction::from_media_class(media_class);
        for ch in channels {
            self.server.add_port(&node, direction, *ch);
        }
        node
    }
}

pub fn fixture() -> Fixture {
    fixture_with(Settings::default())
}

pub fn fixture_with(settings: Settings) -> Fixture {
    init_logging();
    let graph = GraphState::new();
    let server = Rc::new(FakeServer::new(graph.clone()));
    let core = Core::new(server.clone(), graph, settings);
    crate::items::register_all(&core);
    Fixture { core, server }
}

/// Stereo F32 interleaved, any rate.
pub fn stereo_formats() -> Vec<FormatCandidate> {
    use crate::format::{AudioFormat, Choice};
    vec![
        FormatCandidate::raw_audio()
            .with_format(Choice::Enum(vec![AudioFormat::F32, AudioFormat::S16]))
            .with_rate(Choice::Range {
                default: 44100,
                min: 8000,
                max: 192000,
            })
            .with_channels(Choice::Value(2))
            .with_position(vec![AudioChannel::FL, AudioChannel::FR]),
    ]
}
