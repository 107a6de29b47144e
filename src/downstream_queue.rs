use std::collections::HashMap;

use crate::downstream::Downstream;
use crate::downstream_connection::ConnId;
use crate::session::StreamId;

/// Owns every live [`Downstream`], keyed by stream id.
///
/// All event handling resolves streams through here, so a stream that was
/// torn down mid-chain is just a failed lookup instead of a dangling
/// reference. Removal hands the Downstream back to the caller.
#[derive(Default)]
pub struct DownstreamQueue {
    streams: HashMap<StreamId, Downstream>,
}

impl DownstreamQueue {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add(&mut self, downstream: Downstream) {
        self.streams.insert(downstream.stream_id(), downstream);
    }

    pub fn remove(&mut self, stream_id: StreamId) -> Option<Downstream> {
        self.streams.remove(&stream_id)
    }

    pub fn find(&self, stream_id: StreamId) -> Option<&Downstream> {
        self.streams.get(&stream_id)
    }

    pub fn find_mut(&mut self, stream_id: StreamId) -> Option<&mut Downstream> {
        self.streams.get_mut(&stream_id)
    }

    /// Which stream, if any, currently holds origin connection `conn`.
    pub fn find_by_conn(&self, conn: ConnId) -> Option<StreamId> {
        self.streams
            .iter()
            .find(|(_, ds)| ds.conn_id() == Some(conn))
            .map(|(id, _)| *id)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Downstream> + '_ {
        self.streams.drain().map(|(_, ds)| ds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_find_remove() {
        let mut queue = DownstreamQueue::new();
        queue.add(Downstream::new(StreamId(1), 0));
        queue.add(Downstream::new(StreamId(3), 2));
        assert_eq!(queue.len(), 2);
        assert!(queue.find(StreamId(1)).is_some());
        assert!(queue.find(StreamId(5)).is_none());

        let ds = queue.remove(StreamId(1)).unwrap();
        assert_eq!(ds.stream_id(), StreamId(1));
        assert!(queue.find(StreamId(1)).is_none());
        assert_eq!(queue.len(), 1);
    }
}
