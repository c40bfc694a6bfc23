//! Session items
//!
//! A [`SessionItem`] is the generic half of every policy object: it owns the
//! lifecycle flags, the configured properties and the in-flight transitions.
//! The kind-specific half is an [`ItemImpl`] supplied by a factory, which
//! validates configuration, provides the activation steps and exposes the
//! capability interfaces.
//!
//! ## Lifecycle
//! `configure` → `activate` → `export`, each step requiring the previous one.
//! `unexport`, `deactivate` and `reset` walk back synchronously, cancelling
//! whatever is still in flight.  Failed activations and exports leave the
//! flags as they were before the attempt.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::core::{Core, WeakCore};
use crate::error::{Error, Result};
use crate::graph::ObjectId;
use crate::properties::Properties;
use crate::server::{
    DeviceProxy, ExportKind, ExportedProxy, HandlerId, NodeProxy, ProxyFeatures,
};
use crate::transition::{STEP_CUSTOM_START, STEP_ERROR, STEP_NONE, Step, StepRunner, Transition};

use super::flags::ItemFlags;
use super::interfaces::{Adapter, Endpoint, Link, Linkable, Stream, StreamAcquisition};
use super::keys;

/// Stable handle of an item in the core's arena. Never reused.
pub type ItemId = u32;

/// First step of most activations: make sure configure succeeded.
pub const STEP_VERIFY_CONFIG: Step = STEP_CUSTOM_START;

type FlagsCallback = Rc<dyn Fn(&SessionItem, ItemFlags, ItemFlags)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyKind {
    Node,
    Device,
    Endpoint,
    EndpointLink,
}

/// A media server object owned by (or wrapped by) a session item.
#[derive(Clone)]
pub enum AssociatedProxy {
    Node(Rc<dyn NodeProxy>),
    Device(Rc<dyn DeviceProxy>),
    Exported(Rc<dyn ExportedProxy>),
}

impl AssociatedProxy {
    pub fn bound_id(&self) -> ObjectId {
        match self {
            AssociatedProxy::Node(p) => p.bound_id(),
            AssociatedProxy::Device(p) => p.bound_id(),
            AssociatedProxy::Exported(p) => p.bound_id(),
        }
    }

    pub fn as_node(&self) -> Option<&Rc<dyn NodeProxy>> {
        match self {
            AssociatedProxy::Node(p) => Some(p),
            _ => None,
        }
    }
}

/// Kind-specific behaviour of a session item.
pub trait ItemImpl: Any {
    /// Validate `props` and return the properties to store. Any previous
    /// configuration has already been reset.
    fn configure(&self, item: &SessionItem, props: &Properties) -> Result<Properties>;

    /// Drop kind-specific configuration.
    fn reset(&self, _item: &SessionItem) {}

    fn activate_next_step(&self, item: &SessionItem, transition: &Transition, step: Step) -> Step;
    fn activate_execute_step(&self, item: &SessionItem, transition: &Transition, step: Step);

    /// Undo partial activation after a failed or cancelled attempt.
    fn activate_rollback(&self, _item: &SessionItem) {}

    /// Release what a successful activation acquired.
    fn disable_active(&self, _item: &SessionItem) {}

    /// What to publish on the server, for exportable kinds.
    fn export_description(&self, _item: &SessionItem) -> Option<(ExportKind, Properties)> {
        None
    }

    fn associated_proxy(&self, _item: &SessionItem, _kind: ProxyKind) -> Option<AssociatedProxy> {
        None
    }

    fn as_endpoint(&self) -> Option<&dyn Endpoint> {
        None
    }
    fn as_linkable(&self) -> Option<&dyn Linkable> {
        None
    }
    fn as_stream(&self) -> Option<&dyn Stream> {
        None
    }
    fn as_adapter(&self) -> Option<&dyn Adapter> {
        None
    }
    fn as_link(&self) -> Option<&dyn Link> {
        None
    }
    fn as_stream_acquisition(&self) -> Option<&dyn StreamAcquisition> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

#[derive(Default)]
struct ItemState {
    flags: ItemFlags,
    properties: Properties,
    parent: Option<ItemId>,
    activation: Option<Transition>,
    export: Option<Transition>,
    exported: Option<Rc<dyn ExportedProxy>>,
}

pub struct SessionItem {
    id: ItemId,
    factory_name: String,
    core: WeakCore,
    this: Weak<SessionItem>,
    state: RefCell<ItemState>,
    listeners: RefCell<Vec<(HandlerId, FlagsCallback)>>,
    next_handler: Cell<HandlerId>,
    imp: Box<dyn ItemImpl>,
}

impl fmt::Display for SessionItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<{}>", self.factory_name, self.id)
    }
}

impl fmt::Debug for SessionItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.borrow();
        f.debug_struct("SessionItem")
            .field("id", &self.id)
            .field("kind", &self.factory_name)
            .field("flags", &st.flags)
            .field("properties", &st.properties)
            .finish()
    }
}

impl SessionItem {
    pub(crate) fn new(
        id: ItemId,
        factory_name: &str,
        core: WeakCore,
        construct: impl FnOnce(Weak<SessionItem>) -> Box<dyn ItemImpl>,
    ) -> Rc<Self> {
        Rc::new_cyclic(|this| SessionItem {
            id,
            factory_name: factory_name.to_string(),
            core,
            this: this.clone(),
            state: RefCell::new(ItemState::default()),
            listeners: RefCell::new(Vec::new()),
            next_handler: Cell::new(1),
            imp: construct(this.clone()),
        })
    }

    pub fn id(&self) -> ItemId {
        self.id
    }

    /// The factory that built this item, e.g. `si-standard-link`
    pub fn factory_name(&self) -> &str {
        &self.factory_name
    }

    pub fn core(&self) -> Option<Core> {
        self.core.upgrade()
    }

    pub fn require_core(&self) -> Result<Core> {
        self.core
            .upgrade()
            .ok_or_else(|| Error::invariant(format!("{self}: core is gone")))
    }

    pub fn downgrade(&self) -> Weak<SessionItem> {
        self.this.clone()
    }

    pub fn flags(&self) -> ItemFlags {
        self.state.borrow().flags
    }

    pub fn properties(&self) -> Properties {
        self.state.borrow().properties.clone()
    }

    pub fn property(&self, key: &str) -> Option<String> {
        self.state.borrow().properties.get(key).map(str::to_owned)
    }

    /// Merge derived values (e.g. a negotiated format) into the properties.
    pub fn update_properties(&self, props: &Properties) {
        self.state.borrow_mut().properties.update(props);
    }

    pub fn parent(&self) -> Option<ItemId> {
        self.state.borrow().parent
    }

    pub fn set_parent(&self, parent: Option<ItemId>) {
        self.state.borrow_mut().parent = parent;
    }

    /// The parent item if one is set (and still alive), otherwise this item.
    pub fn parent_or_self(&self) -> Option<Rc<SessionItem>> {
        match self.parent() {
            Some(id) => self.core()?.lookup_item(id),
            None => self.this.upgrade(),
        }
    }

    // ── Capabilities ────────────────────────────────────────────────────────

    pub fn as_endpoint(&self) -> Option<&dyn Endpoint> {
        self.imp.as_endpoint()
    }

    pub fn as_linkable(&self) -> Option<&dyn Linkable> {
        self.imp.as_linkable()
    }

    pub fn as_stream(&self) -> Option<&dyn Stream> {
        self.imp.as_stream()
    }

    pub fn as_adapter(&self) -> Option<&dyn Adapter> {
        self.imp.as_adapter()
    }

    pub fn as_link(&self) -> Option<&dyn Link> {
        self.imp.as_link()
    }

    pub fn as_stream_acquisition(&self) -> Option<&dyn StreamAcquisition> {
        self.imp.as_stream_acquisition()
    }

    pub fn downcast_ref<T: ItemImpl>(&self) -> Option<&T> {
        self.imp.as_any().downcast_ref::<T>()
    }

    pub fn associated_proxy(&self, kind: ProxyKind) -> Option<AssociatedProxy> {
        if matches!(kind, ProxyKind::Endpoint | ProxyKind::EndpointLink)
            && let Some(proxy) = self.state.borrow().exported.clone()
        {
            return Some(AssociatedProxy::Exported(proxy));
        }
        self.imp.associated_proxy(self, kind)
    }

    // ── Flag notifications ──────────────────────────────────────────────────

    /// `callback(item, old_flags, new_flags)` runs after every flag change.
    pub fn connect_flags_changed(
        &self,
        callback: impl Fn(&SessionItem, ItemFlags, ItemFlags) + 'static,
    ) -> HandlerId {
        let id = self.next_handler.get();
        self.next_handler.set(id + 1);
        self.listeners.borrow_mut().push((id, Rc::new(callback)));
        id
    }

    pub fn disconnect_flags_changed(&self, handler: HandlerId) {
        self.listeners.borrow_mut().retain(|(id, _)| *id != handler);
    }

    fn update_flags(&self, change: impl FnOnce(&mut ItemFlags)) {
        let (old, new) = {
            let mut st = self.state.borrow_mut();
            let old = st.flags;
            change(&mut st.flags);
            (old, st.flags)
        };
        if old == new {
            return;
        }
        log::debug!("{self}: flags {old:?} -> {new:?}");
        let listeners: Vec<FlagsCallback> = self
            .listeners
            .borrow()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for listener in listeners {
            listener(self, old, new);
        }
    }

    // ── Configuration ──────────────────────────────────────────────────────

    /// Replace the configuration. Refused while activating or active.
    pub fn configure(&self, props: Properties) -> Result<()> {
        if self.flags().intersects(ItemFlags::ACTIVATION_MASK) {
            return Err(Error::config(format!(
                "{self}: cannot reconfigure while activating or active"
            )));
        }

        self.reset();

        let mut derived = match self.imp.configure(self, &props) {
            Ok(derived) => derived,
            Err(e) => {
                log::debug!("{self}: configure failed: {e}");
                return Err(e);
            }
        };
        derived.set(keys::ITEM_FACTORY_NAME, self.factory_name.as_str());
        derived.set(keys::ITEM_ID, self.id.to_string());
        self.state.borrow_mut().properties = derived;
        self.update_flags(|f| f.insert(ItemFlags::CONFIGURED));
        Ok(())
    }

    // ── Activation ─────────────────────────────────────────────────────────

    /// Run the kind's activation steps; `callback` gets the outcome.
    pub fn activate(&self, callback: impl FnOnce(Result<()>) + 'static) {
        let flags = self.flags();
        if !flags.contains(ItemFlags::CONFIGURED) {
            callback(Err(Error::invariant(format!(
                "{self}: cannot activate item without it being configured first"
            ))));
            return;
        }
        if flags.contains(ItemFlags::ACTIVE) {
            callback(Ok(()));
            return;
        }
        if flags.contains(ItemFlags::ACTIVATING) {
            callback(Err(Error::invariant(format!(
                "{self}: activation already in progress"
            ))));
            return;
        }

        self.update_flags(|f| f.insert(ItemFlags::ACTIVATING));

        let runner = Rc::new(ActivationRunner {
            item: self.this.clone(),
        });
        let weak = self.this.clone();
        let transition = Transition::new(format!("{self}: activate"), runner, move |result| {
            if let Some(item) = weak.upgrade() {
                item.activation_done(&result);
            }
            callback(result);
        });
        self.state.borrow_mut().activation = Some(transition.clone());
        let _ = transition.advance();
    }

    fn activation_done(&self, result: &Result<()>) {
        self.state.borrow_mut().activation = None;
        match result {
            Ok(()) => {
                log::debug!("{self}: activated");
                self.update_flags(|f| {
                    f.remove(ItemFlags::ACTIVATING);
                    f.insert(ItemFlags::ACTIVE);
                });
            }
            Err(e) => {
                log::debug!("{self}: activation failed: {e}");
                self.imp.activate_rollback(self);
                self.update_flags(|f| f.remove(ItemFlags::ACTIVATING));
            }
        }
    }

    pub fn deactivate(&self) {
        self.unexport();

        let pending = self.state.borrow_mut().activation.take();
        if let Some(transition) = pending {
            transition.cancel();
        }

        if self.flags().contains(ItemFlags::ACTIVE) {
            self.imp.disable_active(self);
            self.update_flags(|f| f.remove(ItemFlags::ACTIVE));
            log::debug!("{self}: deactivated");
        }
    }

    // ── Export ─────────────────────────────────────────────────────────────

    /// Publish the item on the server. Requires `ACTIVE`.
    pub fn export(&self, callback: impl FnOnce(Result<()>) + 'static) {
        let flags = self.flags();
        if !flags.contains(ItemFlags::ACTIVE) {
            callback(Err(Error::invariant(format!(
                "{self}: cannot export before activation"
            ))));
            return;
        }
        if flags.contains(ItemFlags::EXPORTED) {
            callback(Ok(()));
            return;
        }
        if flags.contains(ItemFlags::EXPORTING) {
            callback(Err(Error::invariant(format!("{self}: export already in progress"))));
            return;
        }
        let Some((kind, properties)) = self.imp.export_description(self) else {
            callback(Err(Error::invariant(format!("{self}: item is not exportable"))));
            return;
        };

        self.update_flags(|f| f.insert(ItemFlags::EXPORTING));

        let runner = Rc::new(ExportRunner {
            item: self.this.clone(),
            kind,
            properties,
            proxy: RefCell::new(None),
        });
        let weak = self.this.clone();
        let r = runner.clone();
        let transition = Transition::new(format!("{self}: export"), runner, move |result| {
            let proxy = r.proxy.borrow_mut().take();
            if let Some(item) = weak.upgrade() {
                item.export_done(&result, proxy);
            }
            callback(result);
        });
        self.state.borrow_mut().export = Some(transition.clone());
        let _ = transition.advance();
    }

    fn export_done(&self, result: &Result<()>, proxy: Option<Rc<dyn ExportedProxy>>) {
        self.state.borrow_mut().export = None;
        let proxy = match (result, proxy) {
            (Ok(()), Some(proxy)) => proxy,
            _ => {
                self.update_flags(|f| f.remove(ItemFlags::EXPORTING));
                return;
            }
        };

        let bound_id = proxy.bound_id();
        let weak = self.this.clone();
        let core = self.core.clone();
        proxy.connect_destroyed(Box::new(move || {
            let Some(core) = core.upgrade() else { return };
            let weak = weak.clone();
            core.idle_add(move || {
                if let Some(item) = weak.upgrade() {
                    item.handle_proxy_destroyed(bound_id);
                }
            });
        }));

        log::debug!("{self}: exported as {bound_id}");
        self.state.borrow_mut().exported = Some(proxy);
        self.update_flags(|f| {
            f.remove(ItemFlags::EXPORTING);
            f.insert(ItemFlags::EXPORTED);
        });
    }

    fn handle_proxy_destroyed(&self, bound_id: ObjectId) {
        let current = self.state.borrow().exported.as_ref().map(|p| p.bound_id());
        if current == Some(bound_id) {
            log::info!("{self}: exported object {bound_id} was destroyed");
            self.unexport();
        }
    }

    pub fn unexport(&self) {
        let pending = self.state.borrow_mut().export.take();
        if let Some(transition) = pending {
            transition.cancel();
        }

        let proxy = self.state.borrow_mut().exported.take();
        if self.flags().intersects(ItemFlags::EXPORT_MASK) {
            self.update_flags(|f| f.remove(ItemFlags::EXPORT_MASK));
        }
        drop(proxy);
    }

    // ── Reset ──────────────────────────────────────────────────────────────

    /// Back to unconfigured, deactivating and unexporting first.
    pub fn reset(&self) {
        self.deactivate();
        self.imp.reset(self);
        self.state.borrow_mut().properties.clear();
        if self.flags().contains(ItemFlags::CONFIGURED) {
            self.update_flags(|f| f.remove(ItemFlags::CONFIGURED));
        }
    }
}

impl Drop for SessionItem {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        let activation = st.activation.take();
        if let Some(transition) = st.export.take() {
            transition.cancel();
        }
        if let Some(transition) = activation {
            transition.cancel();
            // the completion hook can no longer reach this item
            self.imp.activate_rollback(self);
        }
    }
}

/// Fail `transition` unless `item` is configured, otherwise move on.
pub fn verify_configured(item: &SessionItem, transition: &Transition) {
    if item.flags().contains(ItemFlags::CONFIGURED) {
        let _ = transition.advance();
    } else {
        transition.return_error(Error::invariant(format!(
            "{item}: cannot activate item without it being configured first"
        )));
    }
}

struct ActivationRunner {
    item: Weak<SessionItem>,
}

impl StepRunner for ActivationRunner {
    fn next_step(&self, transition: &Transition, step: Step) -> Step {
        match self.item.upgrade() {
            Some(item) => item.imp.activate_next_step(&item, transition, step),
            None => STEP_ERROR,
        }
    }

    fn execute_step(&self, transition: &Transition, step: Step) {
        match self.item.upgrade() {
            Some(item) => item.imp.activate_execute_step(&item, transition, step),
            None => transition.return_error(Error::Cancelled),
        }
    }
}

const STEP_CREATE_PROXY: Step = STEP_CUSTOM_START;
const STEP_ACTIVATE_PROXY: Step = STEP_CUSTOM_START + 1;

struct ExportRunner {
    item: Weak<SessionItem>,
    kind: ExportKind,
    properties: Properties,
    proxy: RefCell<Option<Rc<dyn ExportedProxy>>>,
}

impl StepRunner for ExportRunner {
    fn next_step(&self, _transition: &Transition, step: Step) -> Step {
        match step {
            STEP_NONE => STEP_CREATE_PROXY,
            STEP_CREATE_PROXY if self.proxy.borrow().is_some() => STEP_ACTIVATE_PROXY,
            STEP_ACTIVATE_PROXY => STEP_NONE,
            _ => STEP_ERROR,
        }
    }

    fn execute_step(&self, transition: &Transition, step: Step) {
        let core = match self.item.upgrade() {
            Some(item) => match item.require_core() {
                Ok(core) => core,
                Err(e) => return transition.return_error(e),
            },
            None => return transition.return_error(Error::Cancelled),
        };

        match step {
            STEP_CREATE_PROXY => match core.server().export(self.kind, self.properties.clone()) {
                Ok(proxy) => {
                    *self.proxy.borrow_mut() = Some(proxy);
                    let _ = transition.advance();
                }
                Err(e) => transition.return_error(e),
            },
            STEP_ACTIVATE_PROXY => {
                let proxy = self.proxy.borrow().clone();
                if let Some(proxy) = proxy {
                    core.advance_when_done(transition, proxy.activate(ProxyFeatures::ALL));
                }
            }
            _ => transition.return_error(Error::invariant(format!("unexpected export step {step:#x}"))),
        }
    }
}
