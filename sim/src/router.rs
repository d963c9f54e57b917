//! Router/channel model (spec.md §2 component #3, §6.3).
//!
//! The mesh router's internal arbitration (credit-based in/out FIFO pairs
//! between neighboring routers) is an explicit Non-goal (spec.md §1): it's
//! modeled here only at the granularity the vector-memory subsystem actually
//! depends on — one ordered FIFO per `(source, dest, channel)` so that
//! packets between the same two endpoints on the same channel preserve order
//! (spec.md §5's ordering guarantee), with no ordering promised across
//! channels or across different endpoint pairs.

use std::collections::{HashMap, VecDeque};

/// Discriminates packet kinds so they can be assigned to non-conflicting
/// router channels (spec.md §6.3's channel-mapping table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Instructions,
    ReadLine,
    WriteLine,
    WriteLineReadLine,
    ReadLineResp,
    WriteLineReadLineResp,
    WriteLineResp,
    WriteLineReadLineDrop,
    LoadJ2jWordsReq,
    LoadJ2jWordsResp,
    LoadJ2jWordsDrop,
    LoadJ2jWordsRetry,
    StoreJ2jWordsReq,
    StoreJ2jWordsResp,
    StoreJ2jWordsDrop,
    StoreJ2jWordsRetry,
    ReadMemWordReq,
    ReadMemWordResp,
    WriteMemWordReq,
    WriteMemWordResp,
    WriteMemWordDrop,
    WriteMemWordRetry,
    ReadByteResp,
    LoadIndexedElementResp,
    StoreIndexedElementResp,
    Sync,
}

/// Maps a message type to one of `n_channels` router channels, so a request
/// class can never be blocked behind a response class sharing the same FIFO
/// (spec.md §6.3).
pub fn channel_for(msg: MessageType, n_channels: usize) -> usize {
    use MessageType::*;
    let bucket = match msg {
        Instructions => 0,
        ReadLine | WriteLine | WriteLineReadLine => 1,
        ReadLineResp | WriteLineReadLineResp | WriteLineResp | WriteLineReadLineDrop => 2,
        LoadJ2jWordsReq | StoreJ2jWordsReq => 3,
        LoadJ2jWordsResp | LoadJ2jWordsDrop | LoadJ2jWordsRetry | StoreJ2jWordsResp
        | StoreJ2jWordsDrop | StoreJ2jWordsRetry => 4,
        ReadMemWordReq | WriteMemWordReq => 5,
        ReadMemWordResp | WriteMemWordResp | WriteMemWordDrop | WriteMemWordRetry
        | ReadByteResp => 6,
        LoadIndexedElementResp | StoreIndexedElementResp | Sync => 7,
    };
    bucket % n_channels
}

#[derive(Debug, Clone)]
pub struct Header {
    pub message_type: MessageType,
    /// Length in words including the header, per spec.md §6.3.
    pub length: usize,
    pub ident: u32,
    pub address: Option<u64>,
    pub tag: Option<u32>,
    pub fault: bool,
}

#[derive(Debug, Clone)]
pub struct Packet {
    pub header: Header,
    pub body: Vec<u64>,
}

/// One endpoint pair's ordered channel set. Each channel is an independent
/// FIFO; within a channel, send order is receive order.
#[derive(Default)]
pub struct Router {
    channels: HashMap<usize, VecDeque<Packet>>,
}

impl Router {
    pub fn new() -> Self {
        Router::default()
    }

    pub fn send(&mut self, channel: usize, packet: Packet) {
        self.channels.entry(channel).or_default().push_back(packet);
    }

    pub fn can_receive(&self, channel: usize) -> bool {
        self.channels.get(&channel).map_or(false, |q| !q.is_empty())
    }

    pub fn receive(&mut self, channel: usize) -> Option<Packet> {
        self.channels.get_mut(&channel)?.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_channel_preserves_order() {
        let mut r = Router::new();
        for ident in 0..3u32 {
            r.send(
                1,
                Packet {
                    header: Header {
                        message_type: MessageType::ReadLine,
                        length: 1,
                        ident,
                        address: None,
                        tag: None,
                        fault: false,
                    },
                    body: vec![],
                },
            );
        }
        assert_eq!(r.receive(1).unwrap().header.ident, 0);
        assert_eq!(r.receive(1).unwrap().header.ident, 1);
        assert_eq!(r.receive(1).unwrap().header.ident, 2);
    }

    #[test]
    fn requests_and_responses_land_on_different_channels() {
        let n_channels = 8;
        assert_ne!(
            channel_for(MessageType::ReadLine, n_channels),
            channel_for(MessageType::ReadLineResp, n_channels)
        );
    }
}
