//! `si-audio-adapter`: an adapter node (device or stream behind an
//! `audioconvert`) whose port layout is negotiated at activation.
//!
//! Activation picks the node's native format from its `EnumFormat` list and
//! then configures the ports, in DSP mode (one mono F32P port per channel)
//! unless `disable.dsp` asks for passthrough.

use std::any::Any;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use futures::channel::oneshot;

use crate::error::{Error, Result};
use crate::format::{AudioChannel, AudioFormat, AudioInfoRaw, choose_sensible_raw_audio_format};
use crate::properties::Properties;
use crate::server::{
    ExportKind, HandlerId, NodeProxy, OpFuture, Param, ParamKind, PortConfig, PortConfigMode,
    ProxyFeatures,
};
use crate::session_item::{
    Adapter, AssociatedProxy, Endpoint, ItemFlags, ItemImpl, Linkable, PortDescriptor, PortsState,
    ProxyKind, RegistrationInfo, STEP_VERIFY_CONFIG, SessionItem, Stream, StreamRegistration,
    keys, ready, verify_configured,
};
use crate::transition::{STEP_ERROR, STEP_NONE, Step, Transition};

use super::{NodeConfig, endpoint_export, ports_for_context};

const STEP_ENSURE_FEATURES: Step = STEP_VERIFY_CONFIG + 1;
const STEP_CHOOSE_FORMAT: Step = STEP_VERIFY_CONFIG + 2;
const STEP_CONFIGURE_PORTS: Step = STEP_VERIFY_CONFIG + 3;

#[derive(Clone)]
struct AdapterConfig {
    node: NodeConfig,
    control_port: bool,
    monitor: bool,
    preferred_channels: u32,
    disable_dsp: bool,
}

struct PortsStatus {
    state: PortsState,
    mode: Option<PortConfigMode>,
    format: Option<AudioInfoRaw>,
    pending: Option<oneshot::Sender<Result<()>>>,
    handler: Option<HandlerId>,
}

impl Default for PortsStatus {
    fn default() -> Self {
        Self {
            state: PortsState::NotConfigured,
            mode: None,
            format: None,
            pending: None,
            handler: None,
        }
    }
}

pub struct AudioAdapter {
    this: Weak<SessionItem>,
    config: RefCell<Option<AdapterConfig>>,
    native_format: RefCell<Option<AudioInfoRaw>>,
    ports: RefCell<PortsStatus>,
}

impl AudioAdapter {
    pub fn new(this: Weak<SessionItem>) -> Self {
        Self {
            this,
            config: RefCell::new(None),
            native_format: RefCell::new(None),
            ports: RefCell::new(PortsStatus::default()),
        }
    }

    fn config(&self) -> Option<AdapterConfig> {
        self.config.borrow().clone()
    }

    fn node(&self) -> Option<Rc<dyn NodeProxy>> {
        self.config.borrow().as_ref().map(|c| c.node.node.clone())
    }

    /// Format chosen from the node's `EnumFormat` list during activation.
    pub fn native_format(&self) -> Option<AudioInfoRaw> {
        self.native_format.borrow().clone()
    }

    fn set_native_format(&self, item: &SessionItem, info: AudioInfoRaw) {
        log::info!(
            "{item}: chose format {} {}Hz {} channels [{}]",
            info.format,
            info.rate,
            info.channels,
            info.position_string()
        );
        let mut props = Properties::new();
        props.set(keys::AUDIO_FORMAT, info.format.to_string());
        props.set(keys::AUDIO_RATE, info.rate.to_string());
        props.set(keys::AUDIO_CHANNELS, info.channels.to_string());
        props.set(keys::AUDIO_POSITION, info.position_string());
        item.update_properties(&props);
        *self.native_format.borrow_mut() = Some(info);
    }

    fn clock_rate(&self, item: &SessionItem) -> u32 {
        let Some(core) = item.core() else {
            return crate::config::Settings::default().default_clock_rate;
        };
        core.server()
            .remote_properties()
            .parse("default.clock.rate")
            .unwrap_or(core.settings().default_clock_rate)
    }

    /// F32P at the clock rate, with the native channel layout.
    fn dsp_format(&self, item: &SessionItem) -> AudioInfoRaw {
        let (channels, position) = match self.native_format() {
            Some(native) => (native.channels, native.position),
            None => (2, vec![AudioChannel::FL, AudioChannel::FR]),
        };
        AudioInfoRaw {
            format: AudioFormat::F32P,
            rate: self.clock_rate(item),
            channels,
            unpositioned: position.is_empty(),
            position,
        }
    }

    fn set_ports_state(&self, item: &SessionItem, state: PortsState) {
        let old = std::mem::replace(&mut self.ports.borrow_mut().state, state);
        if old != state {
            log::debug!("{item}: ports state {old:?} -> {state:?}");
        }
    }

    fn ensure_ports_handler(&self, node: &Rc<dyn NodeProxy>) {
        if self.ports.borrow().handler.is_some() {
            return;
        }
        let weak = self.this.clone();
        let handler = node.connect_ports_changed(Rc::new(move || {
            if let Some(item) = weak.upgrade()
                && let Some(adapter) = item.downcast_ref::<AudioAdapter>()
            {
                adapter.on_ports_changed(&item);
            }
        }));
        self.ports.borrow_mut().handler = Some(handler);
    }

    fn disconnect_ports_handler(&self) {
        let handler = self.ports.borrow_mut().handler.take();
        if let (Some(handler), Some(node)) = (handler, self.node()) {
            node.disconnect(handler);
        }
    }

    fn on_ports_changed(&self, item: &SessionItem) {
        let pending = self.ports.borrow_mut().pending.take();
        if let Some(tx) = pending {
            self.set_ports_state(item, PortsState::Configured);
            let _ = tx.send(Ok(()));
        }
    }

    fn choose_format(&self, item: &SessionItem, transition: &Transition) {
        let (Some(config), Ok(core)) = (self.config(), item.require_core()) else {
            return transition.return_error(Error::invariant(format!("{item}: not configured")));
        };
        let preference = match config.preferred_channels {
            0 => core.settings().channels_preference,
            n => n,
        };
        let node = config.node.node.clone();
        let weak = self.this.clone();
        let op = async move {
            let candidates = node.enum_params(ParamKind::EnumFormat).await?;
            let info = choose_sensible_raw_audio_format(&candidates, preference)
                .ok_or_else(|| Error::failed("no usable raw audio format advertised"))?;
            if let Some(item) = weak.upgrade()
                && item.flags().contains(ItemFlags::ACTIVATING)
                && let Some(adapter) = item.downcast_ref::<AudioAdapter>()
            {
                adapter.set_native_format(&item, info);
            }
            Ok::<_, Error>(())
        };
        core.advance_when_done(transition, Box::pin(op));
    }

    fn configure_ports(&self, item: &SessionItem, transition: &Transition) {
        let (Some(config), Some(native), Ok(core)) =
            (self.config(), self.native_format(), item.require_core())
        else {
            return transition.return_error(Error::invariant(format!("{item}: no format chosen")));
        };
        let (format, mode) = if config.disable_dsp {
            (native, PortConfigMode::Passthrough)
        } else {
            (self.dsp_format(item), PortConfigMode::Dsp)
        };
        core.advance_when_done(transition, self.set_ports_format(Some(format), mode));
    }
}

impl ItemImpl for AudioAdapter {
    fn configure(&self, item: &SessionItem, props: &Properties) -> Result<Properties> {
        let (node, mut derived) = NodeConfig::from_properties(item, props)?;
        let config = AdapterConfig {
            node,
            control_port: props.get_bool(keys::ENABLE_CONTROL_PORT).unwrap_or(false),
            monitor: props.get_bool(keys::ENABLE_MONITOR).unwrap_or(false),
            preferred_channels: props.parse(keys::PREFERRED_N_CHANNELS).unwrap_or(0),
            disable_dsp: props.get_bool(keys::DISABLE_DSP).unwrap_or(false),
        };
        derived.set(keys::ENABLE_CONTROL_PORT, config.control_port.to_string());
        derived.set(keys::ENABLE_MONITOR, config.monitor.to_string());
        derived.set(keys::PREFERRED_N_CHANNELS, config.preferred_channels.to_string());
        derived.set(keys::DISABLE_DSP, config.disable_dsp.to_string());
        *self.config.borrow_mut() = Some(config);
        Ok(derived)
    }

    fn reset(&self, _item: &SessionItem) {
        self.disconnect_ports_handler();
        let pending = std::mem::take(&mut *self.ports.borrow_mut()).pending;
        if let Some(tx) = pending {
            let _ = tx.send(Err(Error::Cancelled));
        }
        self.native_format.borrow_mut().take();
        self.config.borrow_mut().take();
    }

    fn activate_next_step(&self, _item: &SessionItem, _t: &Transition, step: Step) -> Step {
        match step {
            STEP_NONE => STEP_VERIFY_CONFIG,
            STEP_VERIFY_CONFIG => STEP_ENSURE_FEATURES,
            STEP_ENSURE_FEATURES => STEP_CHOOSE_FORMAT,
            STEP_CHOOSE_FORMAT => STEP_CONFIGURE_PORTS,
            STEP_CONFIGURE_PORTS => STEP_NONE,
            _ => STEP_ERROR,
        }
    }

    fn activate_execute_step(&self, item: &SessionItem, transition: &Transition, step: Step) {
        match step {
            STEP_VERIFY_CONFIG => verify_configured(item, transition),
            STEP_ENSURE_FEATURES => {
                let (Some(node), Ok(core)) = (self.node(), item.require_core()) else {
                    return transition.return_error(Error::invariant(format!("{item}: not configured")));
                };
                let wanted = ProxyFeatures::MINIMAL | ProxyFeatures::PORTS | ProxyFeatures::PARAMS;
                if node.features().contains(wanted) {
                    let _ = transition.advance();
                } else {
                    core.advance_when_done(transition, node.activate(wanted));
                }
            }
            STEP_CHOOSE_FORMAT => self.choose_format(item, transition),
            STEP_CONFIGURE_PORTS => self.configure_ports(item, transition),
            _ => transition.return_error(Error::invariant(format!("{item}: unexpected step {step:#x}"))),
        }
    }

    fn disable_active(&self, _item: &SessionItem) {
        self.disconnect_ports_handler();
        let pending = self.ports.borrow_mut().pending.take();
        if let Some(tx) = pending {
            let _ = tx.send(Err(Error::Cancelled));
        }
    }

    fn export_description(&self, _item: &SessionItem) -> Option<(ExportKind, Properties)> {
        self.config.borrow().as_ref()?;
        Some(endpoint_export(self))
    }

    fn associated_proxy(&self, _item: &SessionItem, kind: ProxyKind) -> Option<AssociatedProxy> {
        match kind {
            ProxyKind::Node => self.node().map(AssociatedProxy::Node),
            _ => None,
        }
    }

    fn as_endpoint(&self) -> Option<&dyn Endpoint> {
        Some(self)
    }

    fn as_stream(&self) -> Option<&dyn Stream> {
        Some(self)
    }

    fn as_linkable(&self) -> Option<&dyn Linkable> {
        Some(self)
    }

    fn as_adapter(&self) -> Option<&dyn Adapter> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Endpoint for AudioAdapter {
    fn registration_info(&self) -> RegistrationInfo {
        let config = self.config.borrow();
        let node = config.as_ref().map(|c| &c.node);
        RegistrationInfo {
            name: node.map(|n| n.name.clone()).unwrap_or_default(),
            media_class: node.map(|n| n.media_class.clone()).unwrap_or_default(),
            direction: node.map(|n| n.direction).unwrap_or(crate::graph::Direction::Input),
            properties: Properties::new(),
        }
    }

    fn properties(&self) -> Properties {
        let Some(config) = self.config() else {
            return Properties::new();
        };
        let mut props = config.node.endpoint_properties();
        if let Some(info) = self.native_format() {
            props.set(keys::AUDIO_CHANNELS, info.channels.to_string());
            props.set(keys::AUDIO_RATE, info.rate.to_string());
            props.set(keys::AUDIO_FORMAT, info.format.to_string());
            props.set(keys::AUDIO_POSITION, info.position_string());
        }
        props
    }

    fn stream_count(&self) -> usize {
        1
    }

    fn stream(&self, index: usize) -> Option<Rc<SessionItem>> {
        if index == 0 { self.this.upgrade() } else { None }
    }
}

impl Stream for AudioAdapter {
    fn registration_info(&self) -> StreamRegistration {
        let name = self
            .config
            .borrow()
            .as_ref()
            .map(|c| c.node.name.clone())
            .unwrap_or_else(|| "default".to_string());
        StreamRegistration {
            name,
            properties: Properties::new(),
        }
    }

    fn parent_endpoint(&self) -> Option<Rc<SessionItem>> {
        self.this.upgrade()?.parent_or_self()
    }
}

impl Linkable for AudioAdapter {
    fn ports(&self, context: Option<&str>) -> Vec<PortDescriptor> {
        let Some(config) = self.config() else {
            return Vec::new();
        };
        let Some(core) = self.this.upgrade().and_then(|item| item.core()) else {
            return Vec::new();
        };
        ports_for_context(
            core.graph(),
            config.node.node.bound_id(),
            config.node.direction,
            context,
            config.monitor,
        )
    }
}

impl Adapter for AudioAdapter {
    fn ports_state(&self) -> PortsState {
        self.ports.borrow().state
    }

    fn ports_format(&self) -> Option<(Option<AudioInfoRaw>, PortConfigMode)> {
        let ports = self.ports.borrow();
        ports.mode.map(|mode| (ports.format.clone(), mode))
    }

    fn set_ports_format(&self, format: Option<AudioInfoRaw>, mode: PortConfigMode) -> OpFuture<()> {
        let Some(item) = self.this.upgrade() else {
            return ready(Err(Error::Cancelled));
        };
        let Some(config) = self.config() else {
            return ready(Err(Error::invariant(format!("{item}: not configured"))));
        };
        let node = config.node.node.clone();

        let previous = self.ports.borrow_mut().pending.take();
        if let Some(tx) = previous {
            let _ = tx.send(Err(Error::failed("new format requested")));
        }

        let format = match (format, mode) {
            (None, PortConfigMode::Dsp) => Some(self.dsp_format(&item)),
            (format, _) => format,
        };

        if !node.features().contains(ProxyFeatures::PORTS) {
            return ready(Err(Error::failed(format!(
                "{item}: node ports feature is not enabled"
            ))));
        }

        {
            let ports = self.ports.borrow();
            if ports.mode == Some(mode) && ports.format == format {
                log::debug!("{item}: ports already in {} mode", mode.as_str());
                return ready(Ok(()));
            }
        }

        node.suspend();
        self.ensure_ports_handler(&node);

        let (tx, rx) = oneshot::channel();
        {
            let mut ports = self.ports.borrow_mut();
            ports.pending = Some(tx);
            ports.mode = Some(mode);
            ports.format = format.clone();
        }
        self.set_ports_state(&item, PortsState::Configuring);

        log::debug!("{item}: configuring ports in {} mode", mode.as_str());
        if mode == PortConfigMode::Passthrough
            && let Some(f) = &format
        {
            node.set_param(Param::Format(f.clone()));
        }
        node.set_param(Param::PortConfig(PortConfig {
            direction: config.node.direction,
            mode,
            monitor: config.monitor,
            control: config.control_port,
            format,
        }));

        Box::pin(async move { rx.await.unwrap_or(Err(Error::Cancelled)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Choice, FormatCandidate};
    use crate::items::SI_AUDIO_ADAPTER;
    use crate::properties;
    use crate::test_support::{Fixture, FakeNode, fixture, stereo_formats};

    fn adapter(fx: &Fixture, media_class: &str, extra: Properties) -> (Rc<SessionItem>, Rc<FakeNode>) {
        let node = fx.server.add_node(properties! {
            "node.name" => "alsa_output.usb",
            "media.class" => media_class,
        });
        node.set_formats(stereo_formats());
        let item = fx.core.create_item(SI_AUDIO_ADAPTER).unwrap();
        let mut props = properties! { keys::ITEM_NODE => node.id };
        props.update(&extra);
        item.configure(props).unwrap();
        (item, node)
    }

    fn activate(fx: &Fixture, item: &SessionItem) -> Option<Result<()>> {
        let result = Rc::new(RefCell::new(None));
        let r = result.clone();
        item.activate(move |res| *r.borrow_mut() = Some(res));
        fx.run();
        result.take()
    }

    #[test]
    fn test_activation_negotiates_and_configures_dsp_ports() {
        let fx = fixture();
        fx.server.set_remote_property("default.clock.rate", "44100");
        let (item, node) = adapter(&fx, "Audio/Sink", properties! { keys::ENABLE_MONITOR => true });

        assert_eq!(activate(&fx, &item), Some(Ok(())));
        assert!(item.flags().contains(ItemFlags::ACTIVE));

        assert_eq!(item.property(keys::AUDIO_FORMAT).as_deref(), Some("F32"));
        assert_eq!(item.property(keys::AUDIO_RATE).as_deref(), Some("48000"));
        assert_eq!(item.property(keys::AUDIO_CHANNELS).as_deref(), Some("2"));

        let configs = node.port_configs();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].mode, PortConfigMode::Dsp);
        assert!(configs[0].monitor);
        let format = configs[0].format.clone().unwrap();
        assert_eq!(format.format, AudioFormat::F32P);
        assert_eq!(format.rate, 44100);
        assert_eq!(format.position, vec![AudioChannel::FL, AudioChannel::FR]);
        assert_eq!(node.suspends.get(), 1);

        let adapter = item.as_adapter().unwrap();
        assert_eq!(adapter.ports_state(), PortsState::Configured);
        assert_eq!(adapter.ports_format().map(|(_, m)| m), Some(PortConfigMode::Dsp));

        let linkable = item.as_linkable().unwrap();
        assert_eq!(linkable.ports(None).len(), 2);
        assert_eq!(linkable.ports(Some(keys::CONTEXT_MONITOR)).len(), 2);
    }

    #[test]
    fn test_passthrough_sets_native_format_first() {
        let fx = fixture();
        let (item, node) = adapter(&fx, "Audio/Sink", properties! { keys::DISABLE_DSP => true });
        assert_eq!(activate(&fx, &item), Some(Ok(())));

        let params = node.params();
        assert_eq!(params.len(), 2);
        assert!(matches!(&params[0], Param::Format(f) if f.format == AudioFormat::F32));
        assert!(matches!(&params[1], Param::PortConfig(c) if c.mode == PortConfigMode::Passthrough));
        // monitor ports were not requested
        assert!(item.as_linkable().unwrap().ports(Some(keys::CONTEXT_MONITOR)).is_empty());
    }

    #[test]
    fn test_no_usable_format_fails_activation() {
        let fx = fixture();
        let (item, node) = adapter(&fx, "Audio/Sink", Properties::new());
        node.set_formats(vec![
            FormatCandidate::raw_audio()
                .with_format(Choice::Value(AudioFormat::Unknown))
                .with_channels(Choice::Value(2)),
        ]);

        let result = activate(&fx, &item);
        assert!(matches!(result, Some(Err(Error::OperationFailed(_)))));
        assert!(!item.flags().intersects(ItemFlags::ACTIVATION_MASK));
        assert!(item.flags().contains(ItemFlags::CONFIGURED));
        assert!(node.port_configs().is_empty());
    }

    #[test]
    fn test_same_format_twice_completes_immediately() {
        let fx = fixture();
        let (item, node) = adapter(&fx, "Audio/Source", Properties::new());
        activate(&fx, &item).unwrap().unwrap();
        let (format, mode) = item.as_adapter().unwrap().ports_format().unwrap();

        let done = Rc::new(RefCell::new(None));
        let d = done.clone();
        let op = item.as_adapter().unwrap().set_ports_format(format, mode);
        fx.core.spawn_local(async move { *d.borrow_mut() = Some(op.await) });
        fx.run();

        assert_eq!(*done.borrow(), Some(Ok(())));
        assert_eq!(node.port_configs().len(), 1);
        assert_eq!(node.suspends.get(), 1);
    }

    #[test]
    fn test_new_request_fails_pending_one() {
        let fx = fixture();
        let (item, node) = adapter(&fx, "Audio/Sink", Properties::new());
        activate(&fx, &item).unwrap().unwrap();
        let adapter = item.as_adapter().unwrap();

        let first = adapter.set_ports_format(None, PortConfigMode::Passthrough);
        assert_eq!(adapter.ports_state(), PortsState::Configuring);
        let second = adapter.set_ports_format(None, PortConfigMode::None);

        let results = Rc::new(RefCell::new(Vec::new()));
        let r = results.clone();
        fx.core.spawn_local(async move {
            let a = first.await;
            let b = second.await;
            r.borrow_mut().extend([a, b]);
        });
        fx.run();

        let results = results.borrow();
        assert!(matches!(&results[0], Err(Error::OperationFailed(m)) if m == "new format requested"));
        assert_eq!(results[1], Ok(()));
        assert_eq!(adapter.ports_state(), PortsState::Configured);
        assert_eq!(node.port_configs().len(), 3);
    }

    #[test]
    fn test_reset_cancels_pending_request() {
        let fx = fixture();
        let (item, node) = adapter(&fx, "Audio/Sink", Properties::new());
        activate(&fx, &item).unwrap().unwrap();
        assert_eq!(node.handler_count(), 1);

        let pending = item
            .as_adapter()
            .unwrap()
            .set_ports_format(None, PortConfigMode::Passthrough);
        item.reset();
        assert_eq!(node.handler_count(), 0);

        let result = Rc::new(RefCell::new(None));
        let r = result.clone();
        fx.core.spawn_local(async move { *r.borrow_mut() = Some(pending.await) });
        fx.run();
        assert_eq!(*result.borrow(), Some(Err(Error::Cancelled)));
    }

    #[test]
    fn test_dsp_default_format_uses_settings_rate() {
        let fx = fixture();
        let (item, node) = adapter(&fx, "Audio/Sink", properties! { keys::PREFERRED_N_CHANNELS => 1 });
        node.set_formats(vec![
            FormatCandidate::raw_audio()
                .with_format(Choice::Value(AudioFormat::S16))
                .with_rate(Choice::Value(44100))
                .with_channels(Choice::Range {
                    default: 2,
                    min: 1,
                    max: 8,
                }),
        ]);
        activate(&fx, &item).unwrap().unwrap();

        let native = item.downcast_ref::<AudioAdapter>().unwrap().native_format().unwrap();
        assert_eq!(native.channels, 1);
        assert_eq!(native.rate, 44100);
        let cfg = node.port_configs().pop().unwrap();
        let format = cfg.format.unwrap();
        assert_eq!(format.rate, 48000);
        assert_eq!(format.channels, 1);
        assert!(format.unpositioned);
    }
}
