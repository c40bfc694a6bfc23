//! `si-bluez5-endpoint`: a Bluetooth device endpoint with one stream per
//! profile.
//!
//! Only the stream of the active profile is backed by a node (an
//! `si-audio-adapter` child); the other one is an `si-fake-stream`.  Linking
//! to the fake stream goes through [`StreamAcquisition`], which switches the
//! device profile and refuses the link.  The policy is expected to link again
//! once the new node shows up.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Instant;

use crate::error::{Error, Result};
use crate::graph::{Direction, ObjectId};
use crate::properties::Properties;
use crate::server::{DeviceProxy, ExportKind, OpFuture, Param};
use crate::session_item::{
    AssociatedProxy, Endpoint, ItemImpl, ProxyKind, RegistrationInfo, STEP_VERIFY_CONFIG,
    SessionItem, StreamAcquisition, keys, ready, verify_configured,
};
use crate::transition::{STEP_ERROR, STEP_NONE, Step, Transition};

use super::{SI_AUDIO_ADAPTER, SI_FAKE_STREAM, activate_item, endpoint_export};

const STEP_ACTIVATE_A2DP: Step = STEP_VERIFY_CONFIG + 1;
const STEP_ACTIVATE_SCO: Step = STEP_VERIFY_CONFIG + 2;

/// Stream slots; the profile index of each is `slot + 1`.
const STREAM_A2DP: usize = 0;
const STREAM_SCO: usize = 1;
const STREAM_NAMES: [&str; 2] = ["Multimedia", "Call"];

fn stream_for_profile(profile: &str) -> Option<usize> {
    if profile.starts_with("a2dp") {
        Some(STREAM_A2DP)
    } else if profile.starts_with("hsp") || profile.starts_with("hfp") {
        Some(STREAM_SCO)
    } else {
        None
    }
}

fn profile_index(stream: usize) -> u32 {
    stream as u32 + 1
}

struct Bluez5Config {
    device: Rc<dyn DeviceProxy>,
    name: String,
    direction: Direction,
    priority: u32,
    /// Slot backed by the current node
    current: usize,
}

pub struct Bluez5Endpoint {
    config: RefCell<Option<Bluez5Config>>,
    streams: RefCell<[Option<Rc<SessionItem>>; 2]>,
    last_switch: Cell<Option<Instant>>,
}

impl Bluez5Endpoint {
    pub fn new(_this: Weak<SessionItem>) -> Self {
        Self {
            config: RefCell::new(None),
            streams: RefCell::new([None, None]),
            last_switch: Cell::new(None),
        }
    }

    fn stream_slot(&self, index: usize) -> Option<Rc<SessionItem>> {
        self.streams.borrow().get(index).cloned().flatten()
    }

    fn present_streams(&self) -> Vec<Rc<SessionItem>> {
        self.streams.borrow().iter().flatten().cloned().collect()
    }

    /// Profile slot currently backed by a node, if configured.
    pub fn current_stream(&self) -> Option<Rc<SessionItem>> {
        let current = self.config.borrow().as_ref()?.current;
        self.stream_slot(current)
    }

    fn create_stream(
        &self,
        item: &SessionItem,
        slot: usize,
        node: Option<ObjectId>,
        current: usize,
        props: &Properties,
    ) -> Result<Rc<SessionItem>> {
        let core = item.require_core()?;
        let name = STREAM_NAMES[slot];
        let (factory, config) = match node {
            Some(node) if slot == current => {
                let mut config = crate::properties! {
                    keys::ITEM_NODE => node,
                    keys::NAME => name,
                };
                for key in [keys::ENABLE_CONTROL_PORT, keys::ENABLE_MONITOR] {
                    if let Some(value) = props.get(key) {
                        config.set(key, value);
                    }
                }
                (SI_AUDIO_ADAPTER, config)
            }
            _ => (SI_FAKE_STREAM, crate::properties! { keys::NAME => name }),
        };

        let stream = core
            .create_item(factory)
            .ok_or_else(|| Error::invariant(format!("{factory} is not registered")))?;
        if let Err(e) = stream.configure(config) {
            core.destroy_item(stream.id());
            return Err(e);
        }
        stream.set_parent(Some(item.id()));
        Ok(stream)
    }

    fn destroy_streams(&self, item: &SessionItem) {
        let streams = std::mem::take(&mut *self.streams.borrow_mut());
        let Some(core) = item.core() else { return };
        for stream in streams.into_iter().flatten() {
            core.destroy_item(stream.id());
        }
    }

    fn activate_stream(&self, item: &SessionItem, transition: &Transition, slot: usize) {
        let Some(stream) = self.stream_slot(slot) else {
            let _ = transition.advance();
            return;
        };
        match item.require_core() {
            Ok(core) => core.advance_when_done(transition, activate_item(&stream)),
            Err(e) => transition.return_error(e),
        }
    }

    fn refuse(&self, link: &SessionItem, reason: &str) -> OpFuture<()> {
        if let Some(core) = link.core() {
            core.request_destroy(link.id());
        }
        ready(Err(Error::AcquisitionRefused(reason.to_string())))
    }
}

impl ItemImpl for Bluez5Endpoint {
    fn configure(&self, item: &SessionItem, props: &Properties) -> Result<Properties> {
        let core = item.require_core()?;

        let device_id: ObjectId = props
            .parse(keys::DEVICE_ID)
            .ok_or_else(|| Error::config(format!("{item}: {} is required", keys::DEVICE_ID)))?;
        let device = core
            .server()
            .device(device_id)
            .ok_or_else(|| Error::config(format!("{item}: device {device_id} does not exist")))?;
        let name = props
            .get(keys::NAME)
            .ok_or_else(|| Error::config(format!("{item}: {} is required", keys::NAME)))?
            .to_string();

        let node = match props.get(keys::ITEM_NODE) {
            Some(_) => {
                let id: ObjectId = props
                    .parse(keys::ITEM_NODE)
                    .ok_or_else(|| Error::config(format!("{item}: invalid {}", keys::ITEM_NODE)))?;
                let node = core
                    .server()
                    .node(id)
                    .ok_or_else(|| Error::config(format!("{item}: node {id} does not exist")))?;
                Some(node)
            }
            None => None,
        };

        let direction = match &node {
            Some(node) => match node.get_property("media.class").as_deref() {
                Some("Audio/Sink") => Direction::Input,
                _ => Direction::Output,
            },
            None => props
                .get(keys::DIRECTION)
                .and_then(Direction::parse)
                .ok_or_else(|| Error::config(format!("{item}: direction not specified")))?,
        };

        let a2dp = props.get_bool(keys::A2DP_STREAM).unwrap_or(false);
        let sco = props.get_bool(keys::SCO_STREAM).unwrap_or(false);
        if !a2dp && !sco {
            return Err(Error::config(format!("{item}: no profile stream enabled")));
        }
        let priority = props.parse(keys::PRIORITY).unwrap_or(0);

        // without a node, the device runs the profile we were not asked for
        let current = match &node {
            Some(node) => {
                let profile = node.get_property("api.bluez5.profile").unwrap_or_default();
                stream_for_profile(&profile).ok_or_else(|| {
                    Error::config(format!("{item}: unknown bluez5 profile '{profile}'"))
                })?
            }
            None if a2dp && !sco => STREAM_SCO,
            None if sco && !a2dp => STREAM_A2DP,
            None => {
                return Err(Error::config(format!(
                    "{item}: cannot tell the current profile without a node"
                )));
            }
        };

        let node_id = node.as_ref().map(|n| n.bound_id());
        let mut streams: [Option<Rc<SessionItem>>; 2] = [None, None];
        for (slot, enabled) in [(STREAM_A2DP, a2dp), (STREAM_SCO, sco)] {
            if !enabled {
                continue;
            }
            match self.create_stream(item, slot, node_id, current, props) {
                Ok(stream) => streams[slot] = Some(stream),
                Err(e) => {
                    for stream in streams.into_iter().flatten() {
                        core.destroy_item(stream.id());
                    }
                    return Err(e);
                }
            }
        }
        *self.streams.borrow_mut() = streams;

        let mut derived = Properties::new();
        derived.set(keys::DEVICE_ID, device_id.to_string());
        derived.set(keys::NAME, name.as_str());
        derived.set(keys::DIRECTION, direction.as_str());
        derived.set(keys::A2DP_STREAM, a2dp.to_string());
        derived.set(keys::SCO_STREAM, sco.to_string());
        derived.set(keys::PRIORITY, priority.to_string());
        if let Some(id) = node_id {
            derived.set(keys::ITEM_NODE, id.to_string());
        }

        *self.config.borrow_mut() = Some(Bluez5Config {
            device,
            name,
            direction,
            priority,
            current,
        });
        self.last_switch.set(Some(Instant::now()));
        Ok(derived)
    }

    fn reset(&self, item: &SessionItem) {
        self.destroy_streams(item);
        self.config.borrow_mut().take();
    }

    fn activate_next_step(&self, _item: &SessionItem, _t: &Transition, step: Step) -> Step {
        match step {
            STEP_NONE => STEP_VERIFY_CONFIG,
            STEP_VERIFY_CONFIG => STEP_ACTIVATE_A2DP,
            STEP_ACTIVATE_A2DP => STEP_ACTIVATE_SCO,
            STEP_ACTIVATE_SCO => STEP_NONE,
            _ => STEP_ERROR,
        }
    }

    fn activate_execute_step(&self, item: &SessionItem, transition: &Transition, step: Step) {
        match step {
            STEP_VERIFY_CONFIG => verify_configured(item, transition),
            STEP_ACTIVATE_A2DP => self.activate_stream(item, transition, STREAM_A2DP),
            STEP_ACTIVATE_SCO => self.activate_stream(item, transition, STREAM_SCO),
            _ => transition.return_error(Error::invariant(format!("{item}: unexpected step {step:#x}"))),
        }
    }

    fn activate_rollback(&self, _item: &SessionItem) {
        for stream in self.present_streams() {
            stream.deactivate();
        }
    }

    fn disable_active(&self, _item: &SessionItem) {
        for stream in self.present_streams() {
            stream.deactivate();
        }
    }

    fn export_description(&self, _item: &SessionItem) -> Option<(ExportKind, Properties)> {
        self.config.borrow().as_ref()?;
        Some(endpoint_export(self))
    }

    fn associated_proxy(&self, _item: &SessionItem, kind: ProxyKind) -> Option<AssociatedProxy> {
        match kind {
            ProxyKind::Node => self
                .present_streams()
                .iter()
                .find_map(|s| s.associated_proxy(ProxyKind::Node)),
            ProxyKind::Device => {
                let device = self.config.borrow().as_ref()?.device.clone();
                Some(AssociatedProxy::Device(device))
            }
            _ => None,
        }
    }

    fn as_endpoint(&self) -> Option<&dyn Endpoint> {
        Some(self)
    }

    fn as_stream_acquisition(&self) -> Option<&dyn StreamAcquisition> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Endpoint for Bluez5Endpoint {
    fn registration_info(&self) -> RegistrationInfo {
        let config = self.config.borrow();
        let direction = config.as_ref().map(|c| c.direction).unwrap_or(Direction::Input);
        RegistrationInfo {
            name: config.as_ref().map(|c| c.name.clone()).unwrap_or_default(),
            media_class: match direction {
                Direction::Input => "Audio/Sink",
                Direction::Output => "Audio/Source",
            }
            .to_string(),
            direction,
            properties: Properties::new(),
        }
    }

    fn properties(&self) -> Properties {
        let config = self.config.borrow();
        let Some(config) = config.as_ref() else {
            return Properties::new();
        };
        let mut props = config.device.properties();
        let kind = match config.direction {
            Direction::Input => "Sink",
            Direction::Output => "Source",
        };
        let device_name = props.get("device.name").unwrap_or_default().to_string();
        props.set("endpoint.description", format!("Bluez5-{kind} of {device_name}"));
        props.set("endpoint.priority", config.priority.to_string());
        props.set("device.id", config.device.bound_id().to_string());
        props
    }

    fn stream_count(&self) -> usize {
        self.streams.borrow().iter().flatten().count()
    }

    fn stream(&self, index: usize) -> Option<Rc<SessionItem>> {
        self.present_streams().get(index).cloned()
    }

    fn stream_acquisition(&self) -> Option<&dyn StreamAcquisition> {
        Some(self)
    }
}

impl StreamAcquisition for Bluez5Endpoint {
    fn acquire(&self, link: &SessionItem, stream: &SessionItem) -> OpFuture<()> {
        let (current, device, cooldown) = {
            let config = self.config.borrow();
            let Some(config) = config.as_ref() else {
                return ready(Err(Error::invariant(format!("{link}: endpoint is not configured"))));
            };
            let cooldown = link
                .core()
                .map(|core| core.settings().profile_switch_cooldown())
                .unwrap_or_default();
            (config.current, config.device.clone(), cooldown)
        };

        if self.stream_slot(current).is_some_and(|s| s.id() == stream.id()) {
            return ready(Ok(()));
        }

        let now = Instant::now();
        if let Some(last) = self.last_switch.get()
            && now.duration_since(last) < cooldown
        {
            log::debug!("{link}: bluez5 profile switched recently, refusing {stream}");
            return self.refuse(link, "already switched bluez5 profile recently");
        }

        let index = if profile_index(current) == 1 { 2 } else { 1 };
        log::info!("Switching bluez5 device {} to profile {index}", device.bound_id());
        device.set_param(Param::Profile { index });
        self.last_switch.set(Some(now));
        self.refuse(link, "new bluez5 profile set")
    }

    fn release(&self, _link: &SessionItem, _stream: &SessionItem) {}
}
