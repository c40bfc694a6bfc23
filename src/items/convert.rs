//! `si-convert`: an `audioconvert` node placed in front of a target stream,
//! linked to it with a passive standard link it owns.

use std::any::Any;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use futures::channel::oneshot;

use crate::error::{Error, Result};
use crate::format::{AudioChannel, AudioFormat, AudioInfoRaw};
use crate::graph::Direction;
use crate::properties::Properties;
use crate::server::{NodeProxy, Param, PortConfig, PortConfigMode, ProxyFeatures};
use crate::session_item::{
    AssociatedProxy, ItemId, ItemImpl, Linkable, PortDescriptor, ProxyKind, STEP_VERIFY_CONFIG,
    SessionItem, Stream, StreamRegistration, keys, verify_configured,
};
use crate::transition::{STEP_ERROR, STEP_NONE, Step, Transition};

use super::{SI_STANDARD_LINK, activate_item, lookup_item_property, ports_for_context};

const STEP_CREATE_NODE: Step = STEP_VERIFY_CONFIG + 1;
const STEP_LINK_TARGET: Step = STEP_VERIFY_CONFIG + 2;

#[derive(Clone)]
struct ConvertConfig {
    target: ItemId,
    name: String,
    direction: Direction,
    control_port: bool,
}

pub struct Convert {
    this: Weak<SessionItem>,
    config: RefCell<Option<ConvertConfig>>,
    node: RefCell<Option<Rc<dyn NodeProxy>>>,
    link: RefCell<Option<ItemId>>,
}

impl Convert {
    pub fn new(this: Weak<SessionItem>) -> Self {
        Self {
            this,
            config: RefCell::new(None),
            node: RefCell::new(None),
            link: RefCell::new(None),
        }
    }

    fn config(&self) -> Option<ConvertConfig> {
        self.config.borrow().clone()
    }

    /// Id of the link between the converter and its target, while active.
    pub fn link_id(&self) -> Option<ItemId> {
        *self.link.borrow()
    }

    fn target(&self) -> Option<Rc<SessionItem>> {
        let id = self.config.borrow().as_ref()?.target;
        self.this.upgrade()?.core()?.lookup_item(id)
    }

    fn teardown(&self, item: &SessionItem) {
        let link = self.link.borrow_mut().take();
        if let (Some(link), Some(core)) = (link, item.core()) {
            core.destroy_item(link);
        }
        self.node.borrow_mut().take();
    }

    /// DSP format facing the target: its channel layout at the clock rate.
    fn dsp_format(&self, item: &SessionItem, target: &SessionItem) -> AudioInfoRaw {
        let core = item.core();
        let rate = target
            .properties()
            .parse(keys::AUDIO_RATE)
            .or_else(|| core.as_ref()?.server().remote_properties().parse("default.clock.rate"))
            .or_else(|| core.as_ref().map(|c| c.settings().default_clock_rate))
            .unwrap_or(48000);

        let mut position: Vec<AudioChannel> = target
            .as_linkable()
            .map(|l| l.ports(None).iter().map(|p| p.channel).collect())
            .unwrap_or_default();
        if position.is_empty() {
            position.push(AudioChannel::Mono);
        }
        AudioInfoRaw {
            format: AudioFormat::F32P,
            rate,
            channels: position.len() as u32,
            unpositioned: position.contains(&AudioChannel::Unknown),
            position,
        }
    }

    fn create_node(&self, item: &SessionItem, transition: &Transition) {
        let (Some(config), Some(target), Ok(core)) = (self.config(), self.target(), item.require_core())
        else {
            return transition.return_error(Error::failed(format!("{item}: target is gone")));
        };

        let target_description = target
            .parent_or_self()
            .and_then(|ep| ep.as_endpoint().map(|e| e.properties()))
            .and_then(|p| p.get("endpoint.description").map(str::to_owned))
            .or_else(|| target.property(keys::NAME))
            .unwrap_or_default();

        let props = crate::properties! {
            "media.class" => "Audio/Convert",
            "node.name" => config.name.as_str(),
            "node.description" => format!("Stream volume for {target_description}"),
            "factory.mode" => "convert",
        };
        let node = match core.server().create_node("audioconvert", props) {
            Ok(node) => node,
            Err(e) => return transition.return_error(e),
        };
        *self.node.borrow_mut() = Some(node.clone());

        let format = self.dsp_format(item, &target);
        let facing = PortConfig {
            direction: config.direction,
            mode: PortConfigMode::Dsp,
            monitor: false,
            control: config.control_port,
            format: Some(format.clone()),
        };
        let towards_target = PortConfig {
            direction: config.direction.reverse(),
            mode: PortConfigMode::Dsp,
            monitor: true,
            control: false,
            format: Some(format),
        };

        let op = async move {
            node.activate(ProxyFeatures::MINIMAL | ProxyFeatures::PORTS).await?;

            let (tx, rx) = oneshot::channel::<()>();
            let tx = RefCell::new(Some(tx));
            let handler = node.connect_ports_changed(Rc::new(move || {
                if let Some(tx) = tx.borrow_mut().take() {
                    let _ = tx.send(());
                }
            }));
            node.set_param(Param::PortConfig(facing));
            node.set_param(Param::PortConfig(towards_target));
            let ports = rx.await;
            node.disconnect(handler);
            ports.map_err(|_| Error::Cancelled)
        };
        core.advance_when_done(transition, Box::pin(op));
    }

    fn link_target(&self, item: &SessionItem, transition: &Transition) {
        let (Some(config), Some(target), Ok(core)) = (self.config(), self.target(), item.require_core())
        else {
            return transition.return_error(Error::failed(format!("{item}: target is gone")));
        };
        let Some(link) = core.create_item(SI_STANDARD_LINK) else {
            return transition.return_error(Error::invariant("si-standard-link is not registered"));
        };

        // converter's reverse side faces the target
        let mut props = match config.direction {
            Direction::Input => crate::properties! {
                keys::OUT_ITEM => item.id(),
                keys::OUT_ITEM_PORT_CONTEXT => keys::CONTEXT_REVERSE,
                keys::IN_ITEM => target.id(),
            },
            Direction::Output => crate::properties! {
                keys::OUT_ITEM => target.id(),
                keys::IN_ITEM => item.id(),
                keys::IN_ITEM_PORT_CONTEXT => keys::CONTEXT_REVERSE,
            },
        };
        props.set(keys::PASSIVE, "true");

        *self.link.borrow_mut() = Some(link.id());
        if let Err(e) = link.configure(props) {
            return transition.return_error(e);
        }
        link.set_parent(Some(item.id()));
        core.advance_when_done(transition, activate_item(&link));
    }
}

impl ItemImpl for Convert {
    fn configure(&self, item: &SessionItem, props: &Properties) -> Result<Properties> {
        let target = lookup_item_property(item, props, keys::TARGET)?;
        if target.as_stream().is_none() || target.as_linkable().is_none() {
            return Err(Error::config(format!("{item}: {target} is not a linkable stream")));
        }
        let name = props
            .get(keys::NAME)
            .ok_or_else(|| Error::config(format!("{item}: {} is required", keys::NAME)))?
            .to_string();

        let direction = target
            .property(keys::DIRECTION)
            .and_then(|d| Direction::parse(&d))
            .or_else(|| {
                let endpoint = target.as_stream()?.parent_endpoint()?;
                endpoint.as_endpoint().map(|e| e.registration_info().direction)
            })
            .ok_or_else(|| Error::config(format!("{item}: cannot tell the direction of {target}")))?;
        let control_port = props.get_bool(keys::ENABLE_CONTROL_PORT).unwrap_or(false);

        let mut derived = Properties::new();
        derived.set(keys::TARGET, target.id().to_string());
        derived.set(keys::NAME, name.as_str());
        derived.set(keys::DIRECTION, direction.as_str());
        derived.set(keys::ENABLE_CONTROL_PORT, control_port.to_string());
        *self.config.borrow_mut() = Some(ConvertConfig {
            target: target.id(),
            name,
            direction,
            control_port,
        });
        Ok(derived)
    }

    fn reset(&self, item: &SessionItem) {
        self.teardown(item);
        self.config.borrow_mut().take();
    }

    fn activate_next_step(&self, _item: &SessionItem, _t: &Transition, step: Step) -> Step {
        match step {
            STEP_NONE => STEP_VERIFY_CONFIG,
            STEP_VERIFY_CONFIG => STEP_CREATE_NODE,
            STEP_CREATE_NODE => STEP_LINK_TARGET,
            STEP_LINK_TARGET => STEP_NONE,
            _ => STEP_ERROR,
        }
    }

    fn activate_execute_step(&self, item: &SessionItem, transition: &Transition, step: Step) {
        match step {
            STEP_VERIFY_CONFIG => verify_configured(item, transition),
            STEP_CREATE_NODE => self.create_node(item, transition),
            STEP_LINK_TARGET => self.link_target(item, transition),
            _ => transition.return_error(Error::invariant(format!("{item}: unexpected step {step:#x}"))),
        }
    }

    fn activate_rollback(&self, item: &SessionItem) {
        self.teardown(item);
    }

    fn disable_active(&self, item: &SessionItem) {
        self.teardown(item);
    }

    fn associated_proxy(&self, _item: &SessionItem, kind: ProxyKind) -> Option<AssociatedProxy> {
        match kind {
            ProxyKind::Node => self.node.borrow().clone().map(AssociatedProxy::Node),
            _ => None,
        }
    }

    fn as_stream(&self) -> Option<&dyn Stream> {
        Some(self)
    }

    fn as_linkable(&self) -> Option<&dyn Linkable> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Stream for Convert {
    fn registration_info(&self) -> StreamRegistration {
        StreamRegistration {
            name: self
                .config
                .borrow()
                .as_ref()
                .map(|c| c.name.clone())
                .unwrap_or_default(),
            properties: Properties::new(),
        }
    }

    fn parent_endpoint(&self) -> Option<Rc<SessionItem>> {
        self.this.upgrade()?.parent_or_self()
    }
}

impl Linkable for Convert {
    fn ports(&self, context: Option<&str>) -> Vec<PortDescriptor> {
        let (Some(config), Some(node)) = (self.config(), self.node.borrow().clone()) else {
            return Vec::new();
        };
        let Some(core) = self.this.upgrade().and_then(|item| item.core()) else {
            return Vec::new();
        };
        ports_for_context(core.graph(), node.bound_id(), config.direction, context, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::items::{SI_CONVERT, SI_NODE};
    use crate::link::StandardLink;
    use crate::properties;
    use crate::session_item::ItemFlags;
    use crate::test_support::{Fixture, fixture};

    fn sink(fx: &Fixture) -> Rc<SessionItem> {
        let node = fx.server.add_node(properties! {
            "node.name" => "speakers",
            "node.description" => "Speakers",
            "media.class" => "Audio/Sink",
        });
        fx.server.add_port(&node, Direction::Input, AudioChannel::FL);
        fx.server.add_port(&node, Direction::Input, AudioChannel::FR);
        let item = fx.core.create_item(SI_NODE).unwrap();
        item.configure(properties! { keys::ITEM_NODE => node.id }).unwrap();
        item
    }

    #[test]
    fn test_convert_creates_node_and_links_target() {
        let fx = fixture();
        let target = sink(&fx);
        let convert = fx.core.create_item(SI_CONVERT).unwrap();
        convert
            .configure(properties! { keys::TARGET => target.id(), keys::NAME => "volume.music" })
            .unwrap();
        assert_eq!(convert.property(keys::DIRECTION).as_deref(), Some("input"));

        let result = Rc::new(RefCell::new(None));
        let r = result.clone();
        convert.activate(move |res| *r.borrow_mut() = Some(res));
        fx.run();
        assert_eq!(*result.borrow(), Some(Ok(())));

        let node = match convert.associated_proxy(ProxyKind::Node) {
            Some(AssociatedProxy::Node(node)) => node,
            _ => panic!("converter node missing"),
        };
        let props = node.properties();
        assert_eq!(props.get("media.class"), Some("Audio/Convert"));
        assert_eq!(props.get("node.name"), Some("volume.music"));
        assert_eq!(props.get("node.description"), Some("Stream volume for Speakers"));

        // clients see the converter's inputs; its outputs feed the sink
        let linkable = convert.as_linkable().unwrap();
        assert_eq!(linkable.ports(None).len(), 2);
        assert_eq!(linkable.ports(Some(keys::CONTEXT_REVERSE)).len(), 2);

        let link_id = convert.downcast_ref::<Convert>().unwrap().link_id().unwrap();
        let link = fx.core.lookup_item(link_id).unwrap();
        assert!(link.flags().contains(ItemFlags::ACTIVE));
        assert_eq!(link.property(keys::PASSIVE).as_deref(), Some("true"));
        let native = link.downcast_ref::<StandardLink>().unwrap().node_links();
        assert_eq!(native.len(), 2);
        assert!(fx.server.created_links().iter().all(|p| p.get("link.passive") == Some("true")));

        convert.deactivate();
        assert!(fx.core.lookup_item(link_id).is_none());
        assert!(fx.server.live_links().is_empty());
        assert!(convert.associated_proxy(ProxyKind::Node).is_none());
    }

    #[test]
    fn test_convert_configuration_errors() {
        let fx = fixture();
        let target = sink(&fx);
        let convert = fx.core.create_item(SI_CONVERT).unwrap();
        assert!(convert.configure(properties! { keys::NAME => "x" }).is_err());
        assert!(convert.configure(properties! { keys::TARGET => target.id() }).is_err());

        let fake = fx.core.create_item(crate::items::SI_FAKE_STREAM).unwrap();
        fake.configure(properties! { keys::NAME => "f" }).unwrap();
        // a fake stream has no direction
        assert!(convert
            .configure(properties! { keys::TARGET => fake.id(), keys::NAME => "x" })
            .is_err());
    }
}
