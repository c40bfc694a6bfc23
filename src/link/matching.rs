//! Port matching for standard links.

use crate::format::AudioChannel;
use crate::session_item::PortDescriptor;

fn relaxed_match(out_channel: AudioChannel, in_channel: AudioChannel) -> bool {
    out_channel == AudioChannel::Unknown
        || in_channel == AudioChannel::Unknown
        || in_channel == AudioChannel::Mono
}

/// Pair output ports with input ports by channel.
///
/// A single output port is linked to every input port.  Otherwise each
/// output port takes the first free input port with the same channel, or
/// failing that the first free one whose channel is unknown (on either side)
/// or `MONO`.  An input port is used at most once; unmatched ports stay
/// unlinked.
pub fn match_ports(
    out_ports: &[PortDescriptor],
    in_ports: &[PortDescriptor],
) -> Vec<(PortDescriptor, PortDescriptor)> {
    if out_ports.len() == 1 {
        let out = out_ports[0];
        return in_ports.iter().map(|p| (out, *p)).collect();
    }

    // Reversed so that popping from the back of the pool visits the input
    // ports in the order they were reported.
    let mut pool: Vec<PortDescriptor> = in_ports.iter().rev().copied().collect();
    let mut pairs = Vec::new();

    for out in out_ports {
        let exact = pool.iter().rposition(|p| p.channel == out.channel);
        let found = exact.or_else(|| pool.iter().rposition(|p| relaxed_match(out.channel, p.channel)));

        match found {
            Some(index) => pairs.push((*out, pool.remove(index))),
            None => log::debug!(
                "No input port for {}:{} ({})",
                out.node_id,
                out.port_id,
                out.channel.name()
            ),
        }
    }

    pairs
}
