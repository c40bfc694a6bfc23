use serde::{Deserialize, Serialize};

use crate::format::AudioChannel;
use crate::properties::Properties;

/// Unique identifier for PipeWire objects
pub type ObjectId = u32;

/// Port / endpoint direction (Input sorts before Output)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::Input => Direction::Output,
            Direction::Output => Direction::Input,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Input => "input",
            Direction::Output => "output",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "input" | "in" => Some(Direction::Input),
            "output" | "out" => Some(Direction::Output),
            _ => None,
        }
    }

    /// Sources and outputs produce data; everything else consumes it.
    pub fn from_media_class(media_class: &str) -> Self {
        if media_class.contains("Source") || media_class.contains("Output") {
            Direction::Output
        } else {
            Direction::Input
        }
    }
}

/// A PipeWire node (device or application)
#[derive(Debug, Clone)]
pub struct Node {
    pub id: ObjectId,
    pub properties: Properties,
}

impl Node {
    pub fn new(id: ObjectId, properties: Properties) -> Self {
        Self { id, properties }
    }

    pub fn name(&self) -> Option<&str> {
        self.properties.get("node.name")
    }

    pub fn media_class(&self) -> Option<&str> {
        self.properties.get("media.class")
    }

    pub fn display_name(&self) -> &str {
        self.properties
            .get("node.description")
            .or_else(|| self.properties.get("node.nick"))
            .or_else(|| self.name())
            .unwrap_or("Unknown")
    }
}

/// A PipeWire port on a node
#[derive(Debug, Clone)]
pub struct Port {
    pub id: ObjectId,
    pub node_id: ObjectId,
    pub name: String,
    pub direction: Direction,
    /// Channel name (e.g., "FL", "FR", "MONO")
    pub channel: Option<String>,
    /// Monitor ports mirror a sink's input on the output side
    pub monitor: bool,
    /// Physical port index for ordering
    pub physical_index: Option<u32>,
}

impl Port {
    /// Build a port from its global properties. Returns `None` when the
    /// owning node or the direction cannot be determined.
    pub fn from_properties(id: ObjectId, props: &Properties) -> Option<Port> {
        let node_id: ObjectId = match props.get("node.id") {
            Some(_) => props.parse("node.id")?,
            None => {
                log::debug!("Port {}: missing node.id property", id);
                return None;
            }
        };
        let name = props.get("port.name").unwrap_or_default().to_string();

        let direction = match props.get("port.direction") {
            Some(raw) => match Direction::parse(raw) {
                Some(d) => d,
                None => {
                    log::debug!("Port {} (node {}): unknown port.direction {:?}", id, node_id, raw);
                    return None;
                }
            },
            None => {
                if name.starts_with("input") || name.starts_with("playback") {
                    Direction::Input
                } else if name.starts_with("output")
                    || name.starts_with("capture")
                    || name.starts_with("monitor")
                {
                    Direction::Output
                } else {
                    log::warn!(
                        "Port {} (node {}): missing port.direction, cannot infer from name {:?}",
                        id,
                        node_id,
                        name
                    );
                    return None;
                }
            }
        };

        Some(Port {
            id,
            node_id,
            direction,
            channel: props.get("audio.channel").map(String::from),
            monitor: props.get_bool("port.monitor").unwrap_or(false),
            physical_index: props.parse("port.physical"),
            name,
        })
    }

    pub fn channel_tag(&self) -> AudioChannel {
        self.channel
            .as_deref()
            .map(AudioChannel::from_name)
            .unwrap_or(AudioChannel::Unknown)
    }
}

/// A PipeWire link between two ports
#[derive(Debug, Clone)]
pub struct Link {
    pub id: ObjectId,
    pub output_node_id: ObjectId,
    pub output_port_id: ObjectId,
    pub input_node_id: ObjectId,
    pub input_port_id: ObjectId,
    pub passive: bool,
}

impl Link {
    pub fn from_properties(id: ObjectId, props: &Properties) -> Option<Link> {
        Some(Link {
            id,
            output_node_id: props.parse("link.output.node")?,
            output_port_id: props.parse("link.output.port")?,
            input_node_id: props.parse("link.input.node")?,
            input_port_id: props.parse("link.input.port")?,
            passive: props.get_bool("link.passive").unwrap_or(false),
        })
    }
}

/// A device global (ALSA card, Bluetooth device, ...)
#[derive(Debug, Clone)]
pub struct Device {
    pub id: ObjectId,
    pub properties: Properties,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties;

    #[test]
    fn test_direction_from_media_class() {
        assert_eq!(Direction::from_media_class("Audio/Source"), Direction::Output);
        assert_eq!(Direction::from_media_class("Stream/Output/Audio"), Direction::Output);
        assert_eq!(Direction::from_media_class("Audio/Sink"), Direction::Input);
        assert_eq!(Direction::from_media_class("Stream/Input/Audio"), Direction::Input);
        assert_eq!(Direction::from_media_class(""), Direction::Input);
    }

    #[test]
    fn test_port_from_properties() {
        let port = Port::from_properties(
            40,
            &properties! {
                "node.id" => 12,
                "port.name" => "monitor_FL",
                "port.monitor" => "true",
                "audio.channel" => "FL",
            },
        )
        .unwrap();
        assert_eq!(port.node_id, 12);
        assert_eq!(port.direction, Direction::Output);
        assert!(port.monitor);
        assert_eq!(port.channel_tag(), AudioChannel::FL);

        assert!(Port::from_properties(41, &properties! { "port.name" => "x" }).is_none());
        assert!(
            Port::from_properties(42, &properties! { "node.id" => 1, "port.name" => "weird" })
                .is_none()
        );
    }

    #[test]
    fn test_link_from_properties() {
        let link = Link::from_properties(
            9,
            &properties! {
                "link.output.node" => 1,
                "link.output.port" => 2,
                "link.input.node" => 3,
                "link.input.port" => 4,
                "link.passive" => "true",
            },
        )
        .unwrap();
        assert_eq!(link.output_port_id, 2);
        assert_eq!(link.input_node_id, 3);
        assert!(link.passive);
        assert!(Link::from_properties(10, &properties! { "link.output.node" => 1 }).is_none());
    }
}
