//! Channel table: the ordered set of one-byte-identified channels a stream
//! multiplexes packets over.
//!
//! Each channel is a small struct of boxed closures standing in for a C
//! vtable, rather than a trait-per-channel-kind design: no downcasting, no
//! inheritance, just a record of optional function pointers plus state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::codec::ChannelPacket;

/// Outcome of a channel's `packet_in` handler: whether the packet may be
/// forwarded on to subscriber notifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketVerdict {
    Accept,
    Reject,
}

/// Invoked once per inbound channel-packet after sequence checking.
/// Returning [`PacketVerdict::Reject`] suppresses notifier delivery,
/// acting as a security-ok gate before a payload reaches subscribers.
pub type PacketInHandler = Box<dyn Fn(&ChannelPacket) -> PacketVerdict + Send + Sync>;

/// Invoked when the stream has room to accept an outbound write on this
/// channel; receives the raw application payload about to be wrapped into
/// a channel-packet.
pub type PacketOutHandler = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Subscriber callback: `(channel_id, packet_type, payload)`.
pub type Notifier = Box<dyn Fn(u8, u8, &[u8]) + Send + Sync>;

/// One multiplexed channel within a stream.
pub struct Channel {
    id: u8,
    packet_in: Option<PacketInHandler>,
    packet_out: Option<PacketOutHandler>,
    notifiers: Vec<Notifier>,
    ready_to_read: AtomicBool,
    ready_to_write: AtomicBool,
    closing: AtomicBool,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl Channel {
    pub fn new(id: u8) -> Self {
        Self {
            id,
            packet_in: None,
            packet_out: None,
            notifiers: Vec::new(),
            ready_to_read: AtomicBool::new(true),
            ready_to_write: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn set_packet_in(&mut self, handler: PacketInHandler) {
        self.packet_in = Some(handler);
    }

    pub fn set_packet_out(&mut self, handler: PacketOutHandler) {
        self.packet_out = Some(handler);
    }

    pub fn add_notifier(&mut self, notifier: Notifier) {
        self.notifiers.push(notifier);
    }

    pub fn is_ready_to_read(&self) -> bool {
        self.ready_to_read.load(Ordering::Acquire)
    }

    pub fn is_ready_to_write(&self) -> bool {
        self.ready_to_write.load(Ordering::Acquire)
    }

    pub fn set_ready_to_read(&self, value: bool) {
        self.ready_to_read.store(value, Ordering::Release)
    }

    pub fn set_ready_to_write(&self, value: bool) {
        self.ready_to_write.store(value, Ordering::Release)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn mark_closing(&self) {
        self.closing.store(true, Ordering::Release)
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    /// Runs the channel's `packet_out` hook (if any) for an application
    /// write before the codec frames and encrypts it, then accounts the
    /// bytes.
    pub fn note_write(&self, data: &[u8]) {
        self.bytes_out.fetch_add(data.len() as u64, Ordering::Relaxed);
        if let Some(handler) = &self.packet_out {
            handler(data);
        }
    }

    /// Runs this channel's dispatch step for one decoded, sequence-checked
    /// channel-packet: invokes `packet_in`, and on accept fans the packet
    /// out to every notifier unless the channel has entered `closing`
    /// (§3 "Channel dispatch").
    fn dispatch(&self, packet: &ChannelPacket) -> PacketVerdict {
        self.bytes_in.fetch_add(packet.data.len() as u64, Ordering::Relaxed);
        let verdict = match &self.packet_in {
            Some(handler) => handler(packet),
            None => PacketVerdict::Accept,
        };
        if verdict == PacketVerdict::Accept && !self.is_closing() {
            for notifier in &self.notifiers {
                notifier(packet.channel_id, packet.packet_type, &packet.data);
            }
        }
        verdict
    }
}

/// The stream's ordered set of channels (§2.5 "Channel table"), looked up
/// by linear scan per spec.md's "ids are small integers and channel sets
/// rarely exceed a handful".
#[derive(Default)]
pub struct ChannelTable {
    channels: Vec<Channel>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self { channels: Vec::new() }
    }

    /// Registers a new channel, or returns the existing one if `id` is
    /// already present (channel ids are unique within a stream).
    pub fn get_or_create(&mut self, id: u8) -> &mut Channel {
        if let Some(pos) = self.channels.iter().position(|c| c.id == id) {
            return &mut self.channels[pos];
        }
        self.channels.push(Channel::new(id));
        self.channels.last_mut().unwrap()
    }

    pub fn find(&self, id: u8) -> Option<&Channel> {
        self.channels.iter().find(|c| c.id == id)
    }

    pub fn find_mut(&mut self, id: u8) -> Option<&mut Channel> {
        self.channels.iter_mut().find(|c| c.id == id)
    }

    /// Looks up `packet.channel_id` and runs that channel's dispatch step.
    /// A packet addressed to an unregistered channel is rejected and
    /// dropped (§3 "Channel dispatch looks up the channel by id").
    pub fn dispatch_channel_packet(&self, packet: &ChannelPacket) -> PacketVerdict {
        match self.find(packet.channel_id) {
            Some(channel) => channel.dispatch(packet),
            None => PacketVerdict::Reject,
        }
    }

    pub fn ids(&self) -> Vec<u8> {
        self.channels.iter().map(|c| c.id).collect()
    }

    pub fn close_all(&self) {
        for channel in &self.channels {
            channel.mark_closing();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn packet(channel_id: u8, seq_id: u32, data: &[u8]) -> ChannelPacket {
        ChannelPacket {
            channel_id,
            packet_type: 1,
            seq_id,
            enc_type: 0,
            data: data.to_vec(),
        }
    }

    #[test]
    fn dispatch_delivers_to_notifiers_on_accept() {
        let mut table = ChannelTable::new();
        let delivered = Arc::new(AtomicUsize::new(0));
        let d = delivered.clone();
        let channel = table.get_or_create(b'A');
        channel.add_notifier(Box::new(move |_, _, _| {
            d.fetch_add(1, Ordering::SeqCst);
        }));

        let verdict = table.dispatch_channel_packet(&packet(b'A', 1, b"hello"));
        assert_eq!(verdict, PacketVerdict::Accept);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn closing_channel_suppresses_notifiers() {
        let mut table = ChannelTable::new();
        let delivered = Arc::new(AtomicUsize::new(0));
        let d = delivered.clone();
        let channel = table.get_or_create(b'A');
        channel.add_notifier(Box::new(move |_, _, _| {
            d.fetch_add(1, Ordering::SeqCst);
        }));
        channel.mark_closing();

        table.dispatch_channel_packet(&packet(b'A', 1, b"hello"));
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unregistered_channel_is_rejected() {
        let table = ChannelTable::new();
        let verdict = table.dispatch_channel_packet(&packet(b'Z', 1, b"x"));
        assert_eq!(verdict, PacketVerdict::Reject);
    }

    #[test]
    fn packet_in_handler_can_reject() {
        let mut table = ChannelTable::new();
        let delivered = Arc::new(AtomicUsize::new(0));
        let d = delivered.clone();
        let channel = table.get_or_create(b'A');
        channel.set_packet_in(Box::new(|p| {
            if p.data.is_empty() {
                PacketVerdict::Reject
            } else {
                PacketVerdict::Accept
            }
        }));
        channel.add_notifier(Box::new(move |_, _, _| {
            d.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(table.dispatch_channel_packet(&packet(b'A', 1, b"")), PacketVerdict::Reject);
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
        assert_eq!(table.dispatch_channel_packet(&packet(b'A', 2, b"x")), PacketVerdict::Accept);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }
}
