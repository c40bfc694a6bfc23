use std::any::Any;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use futures::future::join_all;

use crate::core::Core;
use crate::error::{Error, Result};
use crate::graph::ObjectId;
use crate::properties::Properties;
use crate::server::{ExportKind, HandlerId, LinkProxy, OpFuture, ProxyFeatures};
use crate::session_item::{
    ItemFlags, ItemId, ItemImpl, Link, ProxyKind, STEP_VERIFY_CONFIG, SessionItem, keys,
    verify_configured,
};
use crate::transition::{STEP_ERROR, STEP_NONE, Step, Transition};

use super::match_ports;

const STEP_ACQUIRE: Step = STEP_VERIFY_CONFIG + 1;
const STEP_LINK: Step = STEP_VERIFY_CONFIG + 2;

struct LinkConfig {
    out_item: ItemId,
    in_item: ItemId,
    out_context: Option<String>,
    in_context: Option<String>,
    passive: bool,
}

/// A stream granted to this link by its endpoint's acquisition arbiter.
struct Acquired {
    endpoint: ItemId,
    stream: ItemId,
}

/// Flags listener installed for `manage.lifetime`.
struct Watch {
    item: ItemId,
    handler: HandlerId,
}

pub struct StandardLink {
    this: Weak<SessionItem>,
    config: RefCell<Option<LinkConfig>>,
    watches: RefCell<Vec<Watch>>,
    acquired: RefCell<Vec<Acquired>>,
    node_links: RefCell<Vec<Rc<dyn LinkProxy>>>,
}

fn lookup_stream(item: &SessionItem, props: &Properties, key: &str) -> Result<Rc<SessionItem>> {
    let stream = crate::items::lookup_item_property(item, props, key)?;
    if stream.as_stream().is_none() || stream.as_linkable().is_none() {
        return Err(Error::config(format!("{item}: {key} {stream} is not a linkable stream")));
    }
    Ok(stream)
}

/// Lost `ACTIVE` or `CONFIGURED`.
fn stream_went_away(old: ItemFlags, new: ItemFlags) -> bool {
    (old.contains(ItemFlags::ACTIVE) && !new.contains(ItemFlags::ACTIVE))
        || (old.contains(ItemFlags::CONFIGURED) && !new.contains(ItemFlags::CONFIGURED))
}

impl StandardLink {
    pub fn new(this: Weak<SessionItem>) -> Self {
        Self {
            this,
            config: RefCell::new(None),
            watches: RefCell::new(Vec::new()),
            acquired: RefCell::new(Vec::new()),
            node_links: RefCell::new(Vec::new()),
        }
    }

    fn core(&self) -> Option<Core> {
        self.this.upgrade()?.core()
    }

    fn side(&self, out: bool) -> Option<Rc<SessionItem>> {
        let id = {
            let config = self.config.borrow();
            let config = config.as_ref()?;
            if out { config.out_item } else { config.in_item }
        };
        self.core()?.lookup_item(id)
    }

    /// Bound ids of the native links created by the last activation.
    pub fn node_links(&self) -> Vec<ObjectId> {
        self.node_links.borrow().iter().map(|l| l.bound_id()).collect()
    }

    fn install_watches(&self, item: &SessionItem, streams: [&SessionItem; 2]) -> Result<()> {
        let core = item.require_core()?.downgrade();
        let link_id = item.id();
        let mut watches = self.watches.borrow_mut();

        for stream in streams {
            let core = core.clone();
            let handler = stream.connect_flags_changed(move |stream, old, new| {
                if stream_went_away(old, new)
                    && let Some(core) = core.upgrade()
                {
                    log::debug!("link {link_id}: {stream} went away, destroying");
                    core.request_destroy(link_id);
                }
            });
            watches.push(Watch {
                item: stream.id(),
                handler,
            });
        }

        // The export may also go away through `reset`, which is not a reason
        // to self-destruct; check again once the loop is idle.
        let handler = item.connect_flags_changed(move |link, old, new| {
            if !(old.contains(ItemFlags::EXPORTED) && !new.contains(ItemFlags::EXPORTED)) {
                return;
            }
            let Some(core) = core.upgrade() else { return };
            let weak = core.downgrade();
            let link_id = link.id();
            core.idle_add(move || {
                let Some(core) = weak.upgrade() else { return };
                let Some(link) = core.lookup_item(link_id) else { return };
                let flags = link.flags();
                if flags.contains(ItemFlags::CONFIGURED) && !flags.intersects(ItemFlags::EXPORT_MASK) {
                    log::debug!("{link}: exported object is gone, destroying");
                    core.request_destroy(link_id);
                }
            });
        });
        watches.push(Watch {
            item: item.id(),
            handler,
        });
        Ok(())
    }

    fn remove_watches(&self, item: &SessionItem) {
        let watches = std::mem::take(&mut *self.watches.borrow_mut());
        let core = item.core();
        for watch in watches {
            if watch.item == item.id() {
                item.disconnect_flags_changed(watch.handler);
            } else if let Some(stream) = core.as_ref().and_then(|c| c.lookup_item(watch.item)) {
                stream.disconnect_flags_changed(watch.handler);
            }
        }
    }

    /// Give back every granted stream, once.
    fn release_acquired(&self, item: &SessionItem) {
        let acquired = std::mem::take(&mut *self.acquired.borrow_mut());
        let Some(core) = item.core() else { return };
        for Acquired { endpoint, stream } in acquired {
            let (Some(endpoint), Some(stream)) = (core.lookup_item(endpoint), core.lookup_item(stream))
            else {
                continue;
            };
            if let Some(acquisition) = endpoint.as_endpoint().and_then(|e| e.stream_acquisition()) {
                log::debug!("{item}: releasing {stream}");
                acquisition.release(item, &stream);
            }
        }
    }

    fn teardown(&self, item: &SessionItem) {
        self.release_acquired(item);
        let links = std::mem::take(&mut *self.node_links.borrow_mut());
        if !links.is_empty() {
            log::debug!("{item}: dropping {} native links", links.len());
        }
    }

    fn acquire(&self, item: &SessionItem, transition: &Transition) {
        let core = match item.require_core() {
            Ok(core) => core,
            Err(e) => return transition.return_error(e),
        };
        let (Some(out_item), Some(in_item)) = (self.side(true), self.side(false)) else {
            return transition.return_error(Error::failed(format!("{item}: stream is gone")));
        };

        let mut sides = Vec::new();
        let mut ops: Vec<OpFuture<()>> = Vec::new();
        for stream in [out_item, in_item] {
            let Some(endpoint) = stream.as_stream().and_then(|s| s.parent_endpoint()) else {
                continue;
            };
            let Some(acquisition) = endpoint.as_endpoint().and_then(|e| e.stream_acquisition()) else {
                continue;
            };
            log::debug!("{item}: acquiring {stream} from {endpoint}");
            ops.push(acquisition.acquire(item, &stream));
            sides.push((endpoint, stream));
        }
        if ops.is_empty() {
            let _ = transition.advance();
            return;
        }

        let weak = self.this.clone();
        let op = async move {
            let results = join_all(ops).await;
            let link = weak.upgrade();
            let mut failure = None;
            for ((endpoint, stream), result) in sides.into_iter().zip(results) {
                if let Err(e) = result {
                    failure.get_or_insert(e);
                    continue;
                }
                let Some(link) = link.as_ref() else { continue };
                match link.downcast_ref::<StandardLink>() {
                    Some(imp) if link.flags().contains(ItemFlags::ACTIVATING) => {
                        imp.acquired.borrow_mut().push(Acquired {
                            endpoint: endpoint.id(),
                            stream: stream.id(),
                        });
                    }
                    _ => {
                        // activation ended meanwhile
                        if let Some(acquisition) =
                            endpoint.as_endpoint().and_then(|e| e.stream_acquisition())
                        {
                            acquisition.release(link, &stream);
                        }
                    }
                }
            }
            match failure {
                Some(e) => Err(e),
                None => Ok(()),
            }
        };
        core.advance_when_done(transition, Box::pin(op));
    }

    fn create_links(&self, item: &SessionItem, transition: &Transition) {
        let core = match item.require_core() {
            Ok(core) => core,
            Err(e) => return transition.return_error(e),
        };
        let (Some(out_item), Some(in_item)) = (self.side(true), self.side(false)) else {
            return transition.return_error(Error::failed(format!("{item}: stream is gone")));
        };
        let (out_context, in_context, passive) = {
            let config = self.config.borrow();
            let Some(config) = config.as_ref() else {
                return transition.return_error(Error::invariant(format!("{item}: not configured")));
            };
            (config.out_context.clone(), config.in_context.clone(), config.passive)
        };

        let (Some(out_ports), Some(in_ports)) = (
            out_item.as_linkable().map(|l| l.ports(out_context.as_deref())),
            in_item.as_linkable().map(|l| l.ports(in_context.as_deref())),
        ) else {
            return transition.return_error(Error::invariant(format!(
                "{item}: bad port info returned from one of the items"
            )));
        };

        let pairs = match_ports(&out_ports, &in_ports);
        if pairs.is_empty() {
            log::info!("{item}: no ports to link between {out_item} and {in_item}");
            let _ = transition.advance();
            return;
        }

        let endpoint_link = item
            .associated_proxy(ProxyKind::EndpointLink)
            .map(|p| p.bound_id());
        let linger = core.settings().link_linger;

        let mut ops = Vec::with_capacity(pairs.len());
        for (out_port, in_port) in pairs {
            let mut props = crate::properties! {
                "link.output.node" => out_port.node_id,
                "link.output.port" => out_port.port_id,
                "link.input.node" => in_port.node_id,
                "link.input.port" => in_port.port_id,
                "object.linger" => linger,
            };
            if passive {
                props.set("link.passive", "true");
            }
            if let Some(id) = endpoint_link {
                props.set("endpoint-link.id", id.to_string());
            }
            log::debug!(
                "{item}: link {}:{} ({}) -> {}:{} ({})",
                out_port.node_id,
                out_port.port_id,
                out_port.channel.name(),
                in_port.node_id,
                in_port.port_id,
                in_port.channel.name(),
            );

            match core.server().create_link(props) {
                Ok(link) => {
                    ops.push(link.activate(ProxyFeatures::MINIMAL));
                    self.node_links.borrow_mut().push(link);
                }
                Err(e) => return transition.return_error(e),
            }
        }

        let op = async move {
            for result in join_all(ops).await {
                result?;
            }
            Ok::<_, Error>(())
        };
        core.advance_when_done(transition, Box::pin(op));
    }
}

impl ItemImpl for StandardLink {
    fn configure(&self, item: &SessionItem, props: &Properties) -> Result<Properties> {
        let core = item.require_core()?;
        let out_item = lookup_stream(item, props, keys::OUT_ITEM)?;
        let in_item = lookup_stream(item, props, keys::IN_ITEM)?;

        let manage_lifetime = match props.get(keys::MANAGE_LIFETIME) {
            Some(_) => props.get_bool(keys::MANAGE_LIFETIME).ok_or_else(|| {
                Error::config(format!("{item}: invalid {}", keys::MANAGE_LIFETIME))
            })?,
            None => false,
        };
        let passive = match props.get(keys::PASSIVE) {
            Some(_) => props
                .get_bool(keys::PASSIVE)
                .ok_or_else(|| Error::config(format!("{item}: invalid {}", keys::PASSIVE)))?,
            None => core.settings().passive_links,
        };

        let config = LinkConfig {
            out_item: out_item.id(),
            in_item: in_item.id(),
            out_context: props.get(keys::OUT_ITEM_PORT_CONTEXT).map(str::to_owned),
            in_context: props.get(keys::IN_ITEM_PORT_CONTEXT).map(str::to_owned),
            passive,
        };

        let mut derived = Properties::new();
        derived.set(keys::OUT_ITEM, config.out_item.to_string());
        derived.set(keys::IN_ITEM, config.in_item.to_string());
        if let Some(ctx) = &config.out_context {
            derived.set(keys::OUT_ITEM_PORT_CONTEXT, ctx.as_str());
        }
        if let Some(ctx) = &config.in_context {
            derived.set(keys::IN_ITEM_PORT_CONTEXT, ctx.as_str());
        }
        derived.set(keys::MANAGE_LIFETIME, manage_lifetime.to_string());
        derived.set(keys::PASSIVE, passive.to_string());

        if manage_lifetime {
            self.install_watches(item, [&*out_item, &*in_item])?;
        }
        *self.config.borrow_mut() = Some(config);
        Ok(derived)
    }

    fn reset(&self, item: &SessionItem) {
        self.remove_watches(item);
        self.teardown(item);
        self.config.borrow_mut().take();
    }

    fn activate_next_step(&self, _item: &SessionItem, _t: &Transition, step: Step) -> Step {
        match step {
            STEP_NONE => STEP_VERIFY_CONFIG,
            STEP_VERIFY_CONFIG => STEP_ACQUIRE,
            STEP_ACQUIRE => STEP_LINK,
            STEP_LINK => STEP_NONE,
            _ => STEP_ERROR,
        }
    }

    fn activate_execute_step(&self, item: &SessionItem, transition: &Transition, step: Step) {
        match step {
            STEP_VERIFY_CONFIG => verify_configured(item, transition),
            STEP_ACQUIRE => self.acquire(item, transition),
            STEP_LINK => self.create_links(item, transition),
            _ => transition.return_error(Error::invariant(format!("{item}: unexpected step {step:#x}"))),
        }
    }

    fn activate_rollback(&self, item: &SessionItem) {
        self.teardown(item);
    }

    fn disable_active(&self, item: &SessionItem) {
        self.teardown(item);
    }

    fn export_description(&self, _item: &SessionItem) -> Option<(ExportKind, Properties)> {
        let mut props = Properties::new();
        for (stream, prefix) in [(self.side(true)?, "output"), (self.side(false)?, "input")] {
            let endpoint = stream
                .as_stream()
                .and_then(|s| s.parent_endpoint())
                .map(|e| e.id())
                .unwrap_or(stream.id());
            props.set(format!("endpoint-link.{prefix}.endpoint"), endpoint.to_string());
            props.set(format!("endpoint-link.{prefix}.stream"), stream.id().to_string());
        }
        Some((ExportKind::EndpointLink, props))
    }

    fn as_link(&self) -> Option<&dyn Link> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Link for StandardLink {
    fn out_stream(&self) -> Option<Rc<SessionItem>> {
        self.side(true)
    }

    fn in_stream(&self) -> Option<Rc<SessionItem>> {
        self.side(false)
    }
}
