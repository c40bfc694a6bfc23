//! `si-fake-stream`: a stream placeholder with no ports, standing in for a
//! profile that is not currently backed by a node.

use std::any::Any;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::error::{Error, Result};
use crate::properties::Properties;
use crate::session_item::{
    ItemImpl, Linkable, PortDescriptor, STEP_VERIFY_CONFIG, SessionItem, Stream,
    StreamRegistration, keys, verify_configured,
};
use crate::transition::{STEP_ERROR, STEP_NONE, Step, Transition};

pub struct FakeStream {
    this: Weak<SessionItem>,
    name: RefCell<Option<String>>,
}

impl FakeStream {
    pub fn new(this: Weak<SessionItem>) -> Self {
        Self {
            this,
            name: RefCell::new(None),
        }
    }
}

impl ItemImpl for FakeStream {
    fn configure(&self, item: &SessionItem, props: &Properties) -> Result<Properties> {
        let name = props
            .get(keys::NAME)
            .ok_or_else(|| Error::config(format!("{item}: {} is required", keys::NAME)))?;
        *self.name.borrow_mut() = Some(name.to_string());

        let mut derived = Properties::new();
        derived.set(keys::NAME, name);
        Ok(derived)
    }

    fn reset(&self, _item: &SessionItem) {
        self.name.borrow_mut().take();
    }

    fn activate_next_step(&self, _item: &SessionItem, _t: &Transition, step: Step) -> Step {
        match step {
            STEP_NONE => STEP_VERIFY_CONFIG,
            STEP_VERIFY_CONFIG => STEP_NONE,
            _ => STEP_ERROR,
        }
    }

    fn activate_execute_step(&self, item: &SessionItem, transition: &Transition, step: Step) {
        match step {
            STEP_VERIFY_CONFIG => verify_configured(item, transition),
            _ => transition.return_error(Error::invariant(format!("{item}: unexpected step {step:#x}"))),
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

impl Stream for FakeStream {
    fn registration_info(&self) -> StreamRegistration {
        StreamRegistration {
            name: self.name.borrow().clone().unwrap_or_default(),
            properties: Properties::new(),
        }
    }

    fn parent_endpoint(&self) -> Option<Rc<SessionItem>> {
        let item = self.this.upgrade()?;
        let parent = item.parent()?;
        item.core()?.lookup_item(parent)
    }
}

impl Linkable for FakeStream {
    fn ports(&self, _context: Option<&str>) -> Vec<PortDescriptor> {
        Vec::new()
    }
}
