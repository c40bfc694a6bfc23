//! `si-audio-softdsp-endpoint`: an endpoint made of an adapter plus one
//! converter per logical stream.

use std::any::Any;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use futures::future::join_all;

use crate::error::{Error, Result};
use crate::properties::Properties;
use crate::server::ExportKind;
use crate::session_item::{
    AssociatedProxy, Endpoint, ItemFlags, ItemImpl, ProxyKind, RegistrationInfo,
    STEP_VERIFY_CONFIG, SessionItem, keys, verify_configured,
};
use crate::transition::{STEP_ERROR, STEP_NONE, Step, Transition};

use super::{activate_item, endpoint_export, lookup_item_property};

const STEP_ACTIVATE_ADAPTER: Step = STEP_VERIFY_CONFIG + 1;
const STEP_ACTIVATE_STREAMS: Step = STEP_VERIFY_CONFIG + 2;

pub struct SoftDspEndpoint {
    this: Weak<SessionItem>,
    adapter: RefCell<Option<Rc<SessionItem>>>,
    streams: RefCell<Vec<Rc<SessionItem>>>,
}

impl SoftDspEndpoint {
    pub fn new(this: Weak<SessionItem>) -> Self {
        Self {
            this,
            adapter: RefCell::new(None),
            streams: RefCell::new(Vec::new()),
        }
    }

    fn adapter(&self) -> Option<Rc<SessionItem>> {
        self.adapter.borrow().clone()
    }

    /// Add a converter stream. Refused while the endpoint is activating or
    /// active.
    pub fn add_stream(&self, stream: Rc<SessionItem>) -> Result<()> {
        let item = self
            .this
            .upgrade()
            .ok_or_else(|| Error::invariant("endpoint is gone"))?;
        if item.flags().intersects(ItemFlags::ACTIVATION_MASK) {
            return Err(Error::config(format!(
                "{item}: cannot add streams while activating or active"
            )));
        }
        if stream.as_stream().is_none() {
            return Err(Error::config(format!("{item}: {stream} is not a stream")));
        }
        stream.set_parent(Some(item.id()));
        log::debug!("{item}: added stream {stream}");
        self.streams.borrow_mut().push(stream);
        Ok(())
    }

    fn children(&self) -> Vec<Rc<SessionItem>> {
        self.adapter()
            .into_iter()
            .chain(self.streams.borrow().iter().cloned())
            .collect()
    }
}

impl ItemImpl for SoftDspEndpoint {
    fn configure(&self, item: &SessionItem, props: &Properties) -> Result<Properties> {
        let adapter = lookup_item_property(item, props, keys::ADAPTER)?;
        if adapter.as_endpoint().is_none() {
            return Err(Error::config(format!("{item}: {adapter} is not an endpoint")));
        }
        adapter.set_parent(Some(item.id()));

        let mut derived = Properties::new();
        derived.set(keys::ADAPTER, adapter.id().to_string());
        *self.adapter.borrow_mut() = Some(adapter);
        Ok(derived)
    }

    fn reset(&self, _item: &SessionItem) {
        let streams = std::mem::take(&mut *self.streams.borrow_mut());
        let adapter = self.adapter.borrow_mut().take();
        // children stay configured, they belong to whoever built them
        for child in streams.into_iter().chain(adapter) {
            child.deactivate();
            child.set_parent(None);
        }
    }

    fn activate_next_step(&self, _item: &SessionItem, _t: &Transition, step: Step) -> Step {
        match step {
            STEP_NONE => STEP_VERIFY_CONFIG,
            STEP_VERIFY_CONFIG => STEP_ACTIVATE_ADAPTER,
            STEP_ACTIVATE_ADAPTER => STEP_ACTIVATE_STREAMS,
            STEP_ACTIVATE_STREAMS => STEP_NONE,
            _ => STEP_ERROR,
        }
    }

    fn activate_execute_step(&self, item: &SessionItem, transition: &Transition, step: Step) {
        match step {
            STEP_VERIFY_CONFIG => verify_configured(item, transition),
            STEP_ACTIVATE_ADAPTER => {
                let (Some(adapter), Ok(core)) = (self.adapter(), item.require_core()) else {
                    return transition.return_error(Error::failed(format!("{item}: adapter is gone")));
                };
                core.advance_when_done(transition, activate_item(&adapter));
            }
            STEP_ACTIVATE_STREAMS => {
                let streams = self.streams.borrow().clone();
                if streams.is_empty() {
                    let _ = transition.advance();
                    return;
                }
                let core = match item.require_core() {
                    Ok(core) => core,
                    Err(e) => return transition.return_error(e),
                };
                let ops: Vec<_> = streams.iter().map(|s| activate_item(s)).collect();
                let op = async move {
                    for result in join_all(ops).await {
                        result?;
                    }
                    Ok::<_, Error>(())
                };
                core.advance_when_done(transition, Box::pin(op));
            }
            _ => transition.return_error(Error::invariant(format!("{item}: unexpected step {step:#x}"))),
        }
    }

    fn activate_rollback(&self, _item: &SessionItem) {
        for child in self.children() {
            child.deactivate();
        }
    }

    fn disable_active(&self, _item: &SessionItem) {
        for child in self.children() {
            child.deactivate();
        }
    }

    fn export_description(&self, _item: &SessionItem) -> Option<(ExportKind, Properties)> {
        self.adapter()?;
        Some(endpoint_export(self))
    }

    fn associated_proxy(&self, _item: &SessionItem, kind: ProxyKind) -> Option<AssociatedProxy> {
        match kind {
            ProxyKind::Node => self.adapter()?.associated_proxy(kind),
            _ => None,
        }
    }

    fn as_endpoint(&self) -> Option<&dyn Endpoint> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Endpoint for SoftDspEndpoint {
    fn registration_info(&self) -> RegistrationInfo {
        match self.adapter().and_then(|a| a.as_endpoint().map(|e| e.registration_info())) {
            Some(info) => info,
            None => RegistrationInfo {
                name: String::new(),
                media_class: String::new(),
                direction: crate::graph::Direction::Input,
                properties: Properties::new(),
            },
        }
    }

    fn properties(&self) -> Properties {
        self.adapter()
            .and_then(|a| a.as_endpoint().map(|e| e.properties()))
            .unwrap_or_default()
    }

    fn stream_count(&self) -> usize {
        self.streams.borrow().len().max(1)
    }

    fn stream(&self, index: usize) -> Option<Rc<SessionItem>> {
        let streams = self.streams.borrow();
        if streams.is_empty() {
            return if index == 0 { self.adapter() } else { None };
        }
        streams.get(index).cloned()
    }
}
