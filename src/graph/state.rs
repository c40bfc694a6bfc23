use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use super::interest::ObjectInterest;
use super::types::*;

pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut ai = a.as_bytes().iter().peekable();
    let mut bi = b.as_bytes().iter().peekable();

    loop {
        match (ai.peek(), bi.peek()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(&&ac), Some(&&bc)) => {
                if ac.is_ascii_digit() && bc.is_ascii_digit() {
                    let an = take_number(&mut ai);
                    let bn = take_number(&mut bi);
                    match an.cmp(&bn) {
                        Ordering::Equal => continue,
                        ord => return ord,
                    }
                } else {
                    match ac.cmp(&bc) {
                        Ordering::Equal => {
                            ai.next();
                            bi.next();
                        }
                        ord => return ord,
                    }
                }
            }
        }
    }
}

fn take_number<'a, I: Iterator<Item = &'a u8>>(it: &mut std::iter::Peekable<I>) -> u64 {
    let mut n: u64 = 0;
    while let Some(&&c) = it.peek() {
        if !c.is_ascii_digit() {
            break;
        }
        n = n.saturating_mul(10).saturating_add((c - b'0') as u64);
        it.next();
    }
    n
}

/// Mirror of the media server's globals.
///
/// Written by the transport thread as registry events arrive and read by the
/// session items when they need port lists or node properties.
#[derive(Debug, Default)]
pub struct GraphState {
    nodes: RwLock<HashMap<ObjectId, Node>>,
    ports: RwLock<HashMap<ObjectId, Port>>,
    links: RwLock<HashMap<ObjectId, Link>>,
    devices: RwLock<HashMap<ObjectId, Device>>,
    change_counter: RwLock<u64>,
}

impl GraphState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn mark_changed(&self) {
        let mut counter = self.change_counter.write();
        *counter = counter.wrapping_add(1);
    }

    pub fn change_counter(&self) -> u64 {
        *self.change_counter.read()
    }

    // ----- Nodes -----

    pub fn insert_node(&self, node: Node) {
        self.nodes.write().insert(node.id, node);
        self.mark_changed();
    }

    pub fn remove_node(&self, id: ObjectId) -> Option<Node> {
        let node = self.nodes.write().remove(&id);
        if node.is_some() {
            self.cleanup_node(id);
        }
        node
    }

    pub fn get_node(&self, id: ObjectId) -> Option<Node> {
        self.nodes.read().get(&id).cloned()
    }

    pub fn find_node(&self, interest: &ObjectInterest) -> Option<Node> {
        let nodes = self.nodes.read();
        let mut matching: Vec<&Node> = nodes
            .values()
            .filter(|n| interest.matches(&n.properties))
            .collect();
        matching.sort_by_key(|n| n.id);
        matching.first().map(|n| (*n).clone())
    }

    // ----- Ports -----

    pub fn insert_port(&self, port: Port) {
        self.ports.write().insert(port.id, port);
        self.mark_changed();
    }

    pub fn remove_port(&self, id: ObjectId) -> Option<Port> {
        let port = self.ports.write().remove(&id);
        if port.is_some() {
            self.mark_changed();
        }
        port
    }

    pub fn get_port(&self, id: ObjectId) -> Option<Port> {
        self.ports.read().get(&id).cloned()
    }

    /// Ports of a node, inputs first, then in natural name order.
    pub fn ports_for_node(&self, node_id: ObjectId) -> Vec<Port> {
        let mut ports: Vec<Port> = self
            .ports
            .read()
            .values()
            .filter(|p| p.node_id == node_id)
            .cloned()
            .collect();
        ports.sort_by(|a, b| {
            a.direction
                .cmp(&b.direction)
                .then_with(|| natural_cmp(&a.name, &b.name))
                .then_with(|| a.id.cmp(&b.id))
        });
        ports
    }

    pub fn ports_for_node_in(&self, node_id: ObjectId, direction: Direction) -> Vec<Port> {
        self.ports_for_node(node_id)
            .into_iter()
            .filter(|p| p.direction == direction)
            .collect()
    }

    // ----- Links -----

    pub fn insert_link(&self, link: Link) {
        self.links.write().insert(link.id, link);
        self.mark_changed();
    }

    pub fn remove_link(&self, id: ObjectId) -> Option<Link> {
        let link = self.links.write().remove(&id);
        if link.is_some() {
            self.mark_changed();
        }
        link
    }

    pub fn get_link(&self, id: ObjectId) -> Option<Link> {
        self.links.read().get(&id).cloned()
    }

    pub fn links_for_node(&self, node_id: ObjectId) -> Vec<Link> {
        let mut links: Vec<Link> = self
            .links
            .read()
            .values()
            .filter(|l| l.output_node_id == node_id || l.input_node_id == node_id)
            .cloned()
            .collect();
        links.sort_by_key(|l| l.id);
        links
    }

    // ----- Devices -----

    pub fn insert_device(&self, device: Device) {
        self.devices.write().insert(device.id, device);
        self.mark_changed();
    }

    pub fn remove_device(&self, id: ObjectId) -> Option<Device> {
        let device = self.devices.write().remove(&id);
        if device.is_some() {
            self.mark_changed();
        }
        device
    }

    pub fn get_device(&self, id: ObjectId) -> Option<Device> {
        self.devices.read().get(&id).cloned()
    }

    pub fn find_device(&self, interest: &ObjectInterest) -> Option<Device> {
        let devices = self.devices.read();
        let mut matching: Vec<&Device> = devices
            .values()
            .filter(|d| interest.matches(&d.properties))
            .collect();
        matching.sort_by_key(|d| d.id);
        matching.first().map(|d| (*d).clone())
    }

    fn cleanup_node(&self, node_id: ObjectId) {
        let port_ids: Vec<ObjectId> = self
            .ports
            .read()
            .values()
            .filter(|p| p.node_id == node_id)
            .map(|p| p.id)
            .collect();

        {
            let mut links = self.links.write();
            links.retain(|_, l| {
                !port_ids.contains(&l.output_port_id) && !port_ids.contains(&l.input_port_id)
            });
        }

        {
            let mut ports = self.ports.write();
            for port_id in port_ids {
                ports.remove(&port_id);
            }
        }

        self.mark_changed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties;

    fn port(id: ObjectId, node_id: ObjectId, name: &str, direction: Direction) -> Port {
        Port {
            id,
            node_id,
            name: name.to_string(),
            direction,
            channel: None,
            monitor: false,
            physical_index: None,
        }
    }

    #[test]
    fn test_natural_cmp() {
        assert_eq!(natural_cmp("playback_2", "playback_10"), Ordering::Less);
        assert_eq!(natural_cmp("playback_FL", "playback_FR"), Ordering::Less);
        assert_eq!(natural_cmp("aux10", "aux10"), Ordering::Equal);
        assert_eq!(natural_cmp("aux", "aux1"), Ordering::Less);
    }

    #[test]
    fn test_ports_for_node_ordering() {
        let graph = GraphState::new();
        graph.insert_port(port(5, 1, "playback_10", Direction::Input));
        graph.insert_port(port(3, 1, "monitor_FL", Direction::Output));
        graph.insert_port(port(4, 1, "playback_2", Direction::Input));
        graph.insert_port(port(6, 2, "playback_1", Direction::Input));

        let ids: Vec<ObjectId> = graph.ports_for_node(1).iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![4, 5, 3]);
        assert_eq!(graph.ports_for_node_in(1, Direction::Output).len(), 1);
    }

    #[test]
    fn test_remove_node_drops_ports_and_links() {
        let graph = GraphState::new();
        graph.insert_node(Node::new(1, properties! { "node.name" => "a" }));
        graph.insert_port(port(10, 1, "out", Direction::Output));
        graph.insert_port(port(20, 2, "in", Direction::Input));
        graph.insert_link(Link {
            id: 30,
            output_node_id: 1,
            output_port_id: 10,
            input_node_id: 2,
            input_port_id: 20,
            passive: true,
        });

        let before = graph.change_counter();
        assert!(graph.remove_node(1).is_some());
        assert!(graph.change_counter() > before);
        assert!(graph.get_port(10).is_none());
        assert!(graph.get_link(30).is_none());
        assert!(graph.get_port(20).is_some());
    }

    #[test]
    fn test_find_node_and_device() {
        let graph = GraphState::new();
        graph.insert_node(Node::new(7, properties! { "node.name" => "bluez_output.a" }));
        graph.insert_node(Node::new(3, properties! { "node.name" => "bluez_output.b" }));
        graph.insert_device(Device {
            id: 9,
            properties: properties! { "device.api" => "bluez5" },
        });

        let interest = ObjectInterest::new().matches_glob("node.name", "bluez_output.*");
        assert_eq!(graph.find_node(&interest).map(|n| n.id), Some(3));
        let interest = ObjectInterest::new().equals("device.api", "alsa");
        assert!(graph.find_device(&interest).is_none());
        let interest = ObjectInterest::new().equals("device.api", "bluez5");
        assert_eq!(graph.find_device(&interest).map(|d| d.id), Some(9));
    }
}
