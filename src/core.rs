//! The session core
//!
//! Owns the main loop, the media server handle, the graph mirror, the
//! settings, and the arena of session items.  Items refer to each other by
//! [`ItemId`] and resolve those ids here, so a destroyed peer simply stops
//! resolving.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use crate::config::Settings;
use crate::graph::{GraphState, ObjectInterest};
use crate::main_loop::MainLoop;
use crate::server::{MediaServer, OpFuture};
use crate::session_item::{ItemId, ItemImpl, SessionItem};
use crate::transition::Transition;

type ItemConstructor = Rc<dyn Fn(Weak<SessionItem>) -> Box<dyn ItemImpl>>;

struct CoreInner {
    main_loop: MainLoop,
    server: Rc<dyn MediaServer>,
    graph: Arc<GraphState>,
    settings: Settings,
    items: RefCell<BTreeMap<ItemId, Rc<SessionItem>>>,
    next_item_id: Cell<ItemId>,
    factories: RefCell<HashMap<String, ItemConstructor>>,
}

#[derive(Clone)]
pub struct Core {
    inner: Rc<CoreInner>,
}

/// Non-owning handle held by the items.
#[derive(Clone, Default)]
pub struct WeakCore {
    inner: Weak<CoreInner>,
}

impl WeakCore {
    pub fn upgrade(&self) -> Option<Core> {
        self.inner.upgrade().map(|inner| Core { inner })
    }
}

impl Core {
    pub fn new(server: Rc<dyn MediaServer>, graph: Arc<GraphState>, settings: Settings) -> Self {
        Self {
            inner: Rc::new(CoreInner {
                main_loop: MainLoop::new(),
                server,
                graph,
                settings,
                items: RefCell::new(BTreeMap::new()),
                next_item_id: Cell::new(1),
                factories: RefCell::new(HashMap::new()),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakCore {
        WeakCore {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn main_loop(&self) -> &MainLoop {
        &self.inner.main_loop
    }

    pub fn server(&self) -> Rc<dyn MediaServer> {
        self.inner.server.clone()
    }

    pub fn graph(&self) -> &Arc<GraphState> {
        &self.inner.graph
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    // ----- Main loop -----

    pub fn idle_add(&self, f: impl FnOnce() + 'static) {
        self.inner.main_loop.idle_add(f);
    }

    pub fn spawn_local(&self, future: impl Future<Output = ()> + 'static) {
        self.inner.main_loop.spawn_local(future);
    }

    pub fn run_until_stalled(&self) {
        self.inner.main_loop.run_until_stalled();
    }

    /// Await `op` on the loop, then advance `transition` or fail it.
    /// A transition that completed meanwhile (e.g. cancelled) is left alone.
    pub fn advance_when_done(&self, transition: &Transition, op: OpFuture<()>) {
        let transition = transition.clone();
        self.spawn_local(async move {
            let result = op.await;
            if transition.completed() {
                return;
            }
            match result {
                Ok(()) => {
                    let _ = transition.advance();
                }
                Err(e) => transition.return_error(e),
            }
        });
    }

    // ----- Factories -----

    pub fn register_factory(
        &self,
        name: &str,
        constructor: impl Fn(Weak<SessionItem>) -> Box<dyn ItemImpl> + 'static,
    ) {
        let previous = self
            .inner
            .factories
            .borrow_mut()
            .insert(name.to_string(), Rc::new(constructor));
        if previous.is_some() {
            log::warn!("Replacing item factory '{}'", name);
        }
    }

    pub fn has_factory(&self, name: &str) -> bool {
        self.inner.factories.borrow().contains_key(name)
    }

    // ----- Item arena -----

    /// Build an item with the named factory and register it.
    pub fn create_item(&self, factory: &str) -> Option<Rc<SessionItem>> {
        let constructor = self.inner.factories.borrow().get(factory).cloned();
        let Some(constructor) = constructor else {
            log::warn!("No item factory named '{}'", factory);
            return None;
        };

        let id = self.inner.next_item_id.get();
        self.inner.next_item_id.set(id + 1);

        let item = SessionItem::new(id, factory, self.downgrade(), |weak| constructor(weak));
        self.inner.items.borrow_mut().insert(id, item.clone());
        log::debug!("Created {}", item);
        Some(item)
    }

    pub fn lookup_item(&self, id: ItemId) -> Option<Rc<SessionItem>> {
        self.inner.items.borrow().get(&id).cloned()
    }

    /// Lowest-id item whose properties satisfy `interest`.
    pub fn find_item(&self, interest: &ObjectInterest) -> Option<Rc<SessionItem>> {
        let items: Vec<Rc<SessionItem>> = self.inner.items.borrow().values().cloned().collect();
        items.into_iter().find(|item| interest.matches(&item.properties()))
    }

    pub fn items(&self) -> Vec<Rc<SessionItem>> {
        self.inner.items.borrow().values().cloned().collect()
    }

    /// Remove the item from the arena and reset it. Returns false when the
    /// id was not registered.
    pub fn destroy_item(&self, id: ItemId) -> bool {
        let item = self.inner.items.borrow_mut().remove(&id);
        match item {
            Some(item) => {
                log::debug!("Destroying {}", item);
                item.reset();
                true
            }
            None => false,
        }
    }

    /// Destroy the item from an idle callback.
    pub fn request_destroy(&self, id: ItemId) {
        let core = self.downgrade();
        self.idle_add(move || {
            if let Some(core) = core.upgrade() {
                core.destroy_item(id);
            }
        });
    }
}
