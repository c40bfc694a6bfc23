//! `si-monitor-endpoint`: exposes the monitor ports of an input adapter as
//! an `Audio/Source` endpoint.

use std::any::Any;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::error::{Error, Result};
use crate::graph::Direction;
use crate::properties::Properties;
use crate::server::ExportKind;
use crate::session_item::{
    Endpoint, ItemFlags, ItemId, ItemImpl, Linkable, PortDescriptor, RegistrationInfo,
    STEP_VERIFY_CONFIG, SessionItem, Stream, StreamRegistration, keys, verify_configured,
};
use crate::transition::{STEP_ERROR, STEP_NONE, Step, Transition};

use super::{activate_item, endpoint_export, lookup_item_property};

const STEP_ENSURE_ADAPTER_ACTIVATED: Step = STEP_VERIFY_CONFIG + 1;

struct MonitorConfig {
    adapter: ItemId,
    name: String,
}

pub struct MonitorEndpoint {
    this: Weak<SessionItem>,
    config: RefCell<Option<MonitorConfig>>,
}

impl MonitorEndpoint {
    pub fn new(this: Weak<SessionItem>) -> Self {
        Self {
            this,
            config: RefCell::new(None),
        }
    }

    fn adapter(&self) -> Option<Rc<SessionItem>> {
        let id = self.config.borrow().as_ref()?.adapter;
        self.this.upgrade()?.core()?.lookup_item(id)
    }
}

impl ItemImpl for MonitorEndpoint {
    fn configure(&self, item: &SessionItem, props: &Properties) -> Result<Properties> {
        let adapter = lookup_item_property(item, props, keys::ADAPTER)?;
        let info = adapter
            .as_endpoint()
            .map(|ep| ep.registration_info())
            .ok_or_else(|| Error::config(format!("{item}: {adapter} is not an endpoint")))?;
        if info.direction != Direction::Input {
            return Err(Error::config(format!(
                "{item}: cannot monitor {adapter}, it is not an input"
            )));
        }

        let name = format!("monitor.{}", info.name);
        let mut derived = Properties::new();
        derived.set(keys::ADAPTER, adapter.id().to_string());
        derived.set(keys::NAME, name.as_str());
        *self.config.borrow_mut() = Some(MonitorConfig {
            adapter: adapter.id(),
            name,
        });
        Ok(derived)
    }

    fn reset(&self, _item: &SessionItem) {
        self.config.borrow_mut().take();
    }

    fn activate_next_step(&self, _item: &SessionItem, _t: &Transition, step: Step) -> Step {
        match step {
            STEP_NONE => STEP_VERIFY_CONFIG,
            STEP_VERIFY_CONFIG => STEP_ENSURE_ADAPTER_ACTIVATED,
            STEP_ENSURE_ADAPTER_ACTIVATED => STEP_NONE,
            _ => STEP_ERROR,
        }
    }

    fn activate_execute_step(&self, item: &SessionItem, transition: &Transition, step: Step) {
        match step {
            STEP_VERIFY_CONFIG => verify_configured(item, transition),
            STEP_ENSURE_ADAPTER_ACTIVATED => {
                let (Some(adapter), Ok(core)) = (self.adapter(), item.require_core()) else {
                    return transition.return_error(Error::failed(format!("{item}: adapter is gone")));
                };
                if adapter.flags().contains(ItemFlags::ACTIVE) {
                    let _ = transition.advance();
                } else {
                    core.advance_when_done(transition, activate_item(&adapter));
                }
            }
            _ => transition.return_error(Error::invariant(format!("{item}: unexpected step {step:#x}"))),
        }
    }

    fn export_description(&self, _item: &SessionItem) -> Option<(ExportKind, Properties)> {
        self.config.borrow().as_ref()?;
        Some(endpoint_export(self))
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

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Endpoint for MonitorEndpoint {
    fn registration_info(&self) -> RegistrationInfo {
        RegistrationInfo {
            name: self
                .config
                .borrow()
                .as_ref()
                .map(|c| c.name.clone())
                .unwrap_or_default(),
            media_class: "Audio/Source".to_string(),
            direction: Direction::Output,
            properties: Properties::new(),
        }
    }

    fn properties(&self) -> Properties {
        let Some(adapter) = self.adapter() else {
            return Properties::new();
        };
        let Some(endpoint) = adapter.as_endpoint() else {
            return Properties::new();
        };
        let mut props = endpoint.properties();
        let description = props
            .get("endpoint.description")
            .map(str::to_owned)
            .unwrap_or_else(|| endpoint.registration_info().name);
        props.set("endpoint.description", format!("Monitor of {description}"));
        props.set("endpoint.monitor", adapter.id().to_string());
        props
    }

    fn stream_count(&self) -> usize {
        1
    }

    fn stream(&self, index: usize) -> Option<Rc<SessionItem>> {
        if index == 0 { self.this.upgrade() } else { None }
    }
}

impl Stream for MonitorEndpoint {
    fn registration_info(&self) -> StreamRegistration {
        StreamRegistration {
            name: "default".to_string(),
            properties: Properties::new(),
        }
    }

    fn parent_endpoint(&self) -> Option<Rc<SessionItem>> {
        self.this.upgrade()?.parent_or_self()
    }
}

impl Linkable for MonitorEndpoint {
    fn ports(&self, context: Option<&str>) -> Vec<PortDescriptor> {
        if context.is_some() {
            return Vec::new();
        }
        self.adapter()
            .and_then(|adapter| {
                adapter
                    .as_linkable()
                    .map(|l| l.ports(Some(keys::CONTEXT_MONITOR)))
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::AudioChannel;
    use crate::items::{SI_MONITOR_ENDPOINT, SI_NODE};
    use crate::properties;
    use crate::test_support::fixture;

    #[test]
    fn test_monitor_of_sink() {
        let fx = fixture();
        let node = fx.server.add_node(properties! {
            "node.name" => "speakers",
            "node.description" => "Speakers",
            "media.class" => "Audio/Sink",
        });
        fx.server.add_port(&node, Direction::Input, AudioChannel::FL);
        fx.server.add_monitor_port(&node, AudioChannel::FL);
        fx.server.add_monitor_port(&node, AudioChannel::FR);

        let sink = fx.core.create_item(SI_NODE).unwrap();
        sink.configure(properties! { keys::ITEM_NODE => node.id }).unwrap();
        let monitor = fx.core.create_item(SI_MONITOR_ENDPOINT).unwrap();
        monitor
            .configure(properties! { keys::ADAPTER => sink.id() })
            .unwrap();

        let endpoint = monitor.as_endpoint().unwrap();
        let info = endpoint.registration_info();
        assert_eq!(info.name, "monitor.speakers");
        assert_eq!(info.media_class, "Audio/Source");
        assert_eq!(info.direction, Direction::Output);
        let props = endpoint.properties();
        assert_eq!(props.get("endpoint.description"), Some("Monitor of Speakers"));
        assert_eq!(props.get("endpoint.monitor"), Some(sink.id().to_string().as_str()));

        let ports = monitor.as_linkable().unwrap().ports(None);
        assert_eq!(ports.len(), 2);
        assert!(monitor.as_linkable().unwrap().ports(Some(keys::CONTEXT_REVERSE)).is_empty());

        // activating the monitor activates the sink
        monitor.activate(|res| assert!(res.is_ok()));
        fx.run();
        assert!(sink.flags().contains(ItemFlags::ACTIVE));
        assert!(monitor.flags().contains(ItemFlags::ACTIVE));
    }

    #[test]
    fn test_rejects_output_adapter() {
        let fx = fixture();
        let node = fx.add_node_with_ports("mic", "Audio/Source", &[AudioChannel::Mono]);
        let source = fx.core.create_item(SI_NODE).unwrap();
        source.configure(properties! { keys::ITEM_NODE => node.id }).unwrap();

        let monitor = fx.core.create_item(SI_MONITOR_ENDPOINT).unwrap();
        let err = monitor
            .configure(properties! { keys::ADAPTER => source.id() })
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(monitor.configure(properties! { keys::ADAPTER => 999 }).is_err());
    }
}
