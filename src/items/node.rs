//! `si-node`: a plain node exposed as a single-stream endpoint.

use std::any::Any;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::error::{Error, Result};
use crate::properties::Properties;
use crate::server::{ExportKind, ProxyFeatures};
use crate::session_item::{
    AssociatedProxy, Endpoint, ItemImpl, Linkable, PortDescriptor, ProxyKind, RegistrationInfo,
    STEP_VERIFY_CONFIG, SessionItem, Stream, StreamRegistration, verify_configured,
};
use crate::transition::{STEP_ERROR, STEP_NONE, Step, Transition};

use super::{NodeConfig, endpoint_export, ports_for_context};

const STEP_ENSURE_FEATURES: Step = STEP_VERIFY_CONFIG + 1;

pub struct NodeItem {
    this: Weak<SessionItem>,
    config: RefCell<Option<NodeConfig>>,
}

impl NodeItem {
    pub fn new(this: Weak<SessionItem>) -> Self {
        Self {
            this,
            config: RefCell::new(None),
        }
    }

    fn config(&self) -> Option<NodeConfig> {
        self.config.borrow().clone()
    }
}

impl ItemImpl for NodeItem {
    fn configure(&self, item: &SessionItem, props: &Properties) -> Result<Properties> {
        let (config, derived) = NodeConfig::from_properties(item, props)?;
        *self.config.borrow_mut() = Some(config);
        Ok(derived)
    }

    fn reset(&self, _item: &SessionItem) {
        self.config.borrow_mut().take();
    }

    fn activate_next_step(&self, _item: &SessionItem, _t: &Transition, step: Step) -> Step {
        match step {
            STEP_NONE => STEP_VERIFY_CONFIG,
            STEP_VERIFY_CONFIG => STEP_ENSURE_FEATURES,
            STEP_ENSURE_FEATURES => STEP_NONE,
            _ => STEP_ERROR,
        }
    }

    fn activate_execute_step(&self, item: &SessionItem, transition: &Transition, step: Step) {
        match step {
            STEP_VERIFY_CONFIG => verify_configured(item, transition),
            STEP_ENSURE_FEATURES => {
                let (Some(config), Ok(core)) = (self.config(), item.require_core()) else {
                    return transition.return_error(Error::invariant(format!("{item}: not configured")));
                };
                let wanted = ProxyFeatures::MINIMAL | ProxyFeatures::PORTS;
                if config.node.features().contains(wanted) {
                    let _ = transition.advance();
                } else {
                    core.advance_when_done(transition, config.node.activate(wanted));
                }
            }
            _ => transition.return_error(Error::invariant(format!("{item}: unexpected step {step:#x}"))),
        }
    }

    fn export_description(&self, _item: &SessionItem) -> Option<(ExportKind, Properties)> {
        self.config.borrow().as_ref()?;
        Some(endpoint_export(self))
    }

    fn associated_proxy(&self, _item: &SessionItem, kind: ProxyKind) -> Option<AssociatedProxy> {
        match kind {
            ProxyKind::Node => self.config().map(|c| AssociatedProxy::Node(c.node)),
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

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Endpoint for NodeItem {
    fn registration_info(&self) -> RegistrationInfo {
        let config = self.config.borrow();
        match config.as_ref() {
            Some(c) => RegistrationInfo {
                name: c.name.clone(),
                media_class: c.media_class.clone(),
                direction: c.direction,
                properties: Properties::new(),
            },
            None => RegistrationInfo {
                name: String::new(),
                media_class: String::new(),
                direction: crate::graph::Direction::Input,
                properties: Properties::new(),
            },
        }
    }

    fn properties(&self) -> Properties {
        self.config
            .borrow()
            .as_ref()
            .map(NodeConfig::endpoint_properties)
            .unwrap_or_default()
    }

    fn stream_count(&self) -> usize {
        1
    }

    fn stream(&self, index: usize) -> Option<Rc<SessionItem>> {
        if index == 0 { self.this.upgrade() } else { None }
    }
}

impl Stream for NodeItem {
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

impl Linkable for NodeItem {
    fn ports(&self, context: Option<&str>) -> Vec<PortDescriptor> {
        let Some(config) = self.config() else {
            return Vec::new();
        };
        let Some(core) = self.this.upgrade().and_then(|item| item.core()) else {
            return Vec::new();
        };
        ports_for_context(core.graph(), config.node.bound_id(), config.direction, context, true)
    }
}
