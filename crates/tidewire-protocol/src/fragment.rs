//! Fragmentation and reassembly
//!
//! A sealed message is cut into fragments no larger than the configured
//! size. The receiver buffers fragments per message until every index is
//! present. Each buffer owns a deadline task; when it fires with NACKs
//! enabled the link asks the sender for the missing indices and the buffer
//! gets one more window before it is abandoned.
//!
//! The fragment count a peer may claim is bounded by the largest sealed
//! message and the configured fragment size, and only a fixed number of
//! partial messages are buffered at once; the oldest is abandoned to make
//! room.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use tidewire_core::MessageId;

use crate::config::FragmentConfig;
use crate::error::{ProtocolError, Result};
use crate::wire::{FRAME_OVERHEAD, MAX_SEALED_MESSAGE_SIZE};

/// One piece of a message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    /// Message this fragment belongs to
    pub message_id: MessageId,
    /// Position, starting at 0
    pub index: u32,
    /// Number of fragments in the message
    pub total: u32,
    /// Payload bytes
    pub payload: Vec<u8>,
}

/// Splits messages into fragments
#[derive(Clone, Debug)]
pub struct Fragmenter {
    max_size: usize,
}

impl Fragmenter {
    /// Create a fragmenter producing payloads of at most `max_size` bytes
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
        }
    }

    /// Split `bytes` into at least one fragment
    pub fn split(&self, message_id: MessageId, bytes: &[u8]) -> Vec<Fragment> {
        if bytes.is_empty() {
            return vec![Fragment {
                message_id,
                index: 0,
                total: 1,
                payload: Vec::new(),
            }];
        }

        let chunks: Vec<&[u8]> = bytes.chunks(self.max_size).collect();
        let total = chunks.len() as u32;
        chunks
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| Fragment {
                message_id,
                index: index as u32,
                total,
                payload: chunk.to_vec(),
            })
            .collect()
    }

    /// Maximum payload per fragment
    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

/// Reassembly deadline notifications
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReassemblyEvent {
    /// Deadline passed; the buffer is kept for one more window
    Expired {
        /// Incomplete message
        message_id: MessageId,
        /// Indices not yet received
        missing: Vec<u32>,
    },
    /// Buffer discarded
    Abandoned {
        /// Incomplete message
        message_id: MessageId,
        /// Indices never received
        missing: Vec<u32>,
    },
}

struct ReassemblyBuffer {
    total: u32,
    parts: BTreeMap<u32, Vec<u8>>,
    deadline: AbortHandle,
}

impl ReassemblyBuffer {
    fn missing(&self, limit: usize) -> Vec<u32> {
        (0..self.total)
            .filter(|i| !self.parts.contains_key(i))
            .take(limit)
            .collect()
    }

    fn is_complete(&self) -> bool {
        self.parts.len() as u32 == self.total
    }

    fn concat(self) -> Vec<u8> {
        self.parts.into_values().flatten().collect()
    }
}

/// Collects fragments into complete messages
pub struct Reassembler {
    buffers: Arc<DashMap<MessageId, ReassemblyBuffer>>,
    /// Buffered message ids, oldest first
    arrival: Arc<Mutex<VecDeque<MessageId>>>,
    timeout: Duration,
    enable_nack: bool,
    max_fragments: u32,
    max_pending: usize,
    missing_limit: usize,
    events: mpsc::Sender<ReassemblyEvent>,
}

impl Reassembler {
    /// Create a reassembler and the receiver of its deadline events
    pub fn new(config: &FragmentConfig) -> (Self, mpsc::Receiver<ReassemblyEvent>) {
        let (events, events_rx) = mpsc::channel(256);
        let reassembler = Self {
            buffers: Arc::new(DashMap::new()),
            arrival: Arc::new(Mutex::new(VecDeque::new())),
            timeout: config.reassembly_timeout(),
            enable_nack: config.enable_nack,
            max_fragments: max_fragments(config.fragment_max_size),
            max_pending: config.max_pending_reassemblies,
            missing_limit: missing_limit(config.fragment_max_size),
            events,
        };
        (reassembler, events_rx)
    }

    /// Add a fragment, returning the whole message once every index is present
    ///
    /// Must be called inside a tokio runtime: the first fragment of a
    /// message spawns its deadline task.
    pub fn accept(&self, fragment: Fragment) -> Result<Option<Vec<u8>>> {
        let Fragment {
            message_id,
            index,
            total,
            payload,
        } = fragment;

        if total == 0 || index >= total || total > self.max_fragments {
            return Err(ProtocolError::InconsistentFragment {
                message_id,
                index,
                total,
            });
        }

        if total > 1 && !self.buffers.contains_key(&message_id) {
            self.make_room();
        }

        match self.buffers.entry(message_id) {
            Entry::Occupied(mut entry) => {
                if entry.get().total != total {
                    return Err(ProtocolError::InconsistentFragment {
                        message_id,
                        index,
                        total,
                    });
                }
                entry.get_mut().parts.entry(index).or_insert(payload);
                if !entry.get().is_complete() {
                    return Ok(None);
                }
                let buffer = entry.remove();
                buffer.deadline.abort();
                self.arrival.lock().retain(|id| *id != message_id);
                debug!("Reassembled {} from {} fragments", message_id.short(), total);
                Ok(Some(buffer.concat()))
            }
            Entry::Vacant(entry) => {
                if total == 1 {
                    return Ok(Some(payload));
                }
                let mut parts = BTreeMap::new();
                parts.insert(index, payload);
                entry.insert(ReassemblyBuffer {
                    total,
                    parts,
                    deadline: self.spawn_deadline(message_id),
                });
                self.arrival.lock().push_back(message_id);
                Ok(None)
            }
        }
    }

    /// Abandon the oldest partial messages until one more fits
    fn make_room(&self) {
        while self.buffers.len() >= self.max_pending {
            let oldest = match self.arrival.lock().pop_front() {
                Some(id) => id,
                None => return,
            };
            let buffer = match self.buffers.remove(&oldest) {
                Some((_, buffer)) => buffer,
                None => continue,
            };
            buffer.deadline.abort();
            let missing = buffer.missing(self.missing_limit);
            warn!(
                "Too many partial messages, abandoned {} with {} fragments missing",
                oldest.short(),
                missing.len()
            );
            let event = ReassemblyEvent::Abandoned {
                message_id: oldest,
                missing,
            };
            if self.events.try_send(event).is_err() {
                debug!("Reassembly event for {} not delivered", oldest.short());
            }
        }
    }

    fn spawn_deadline(&self, message_id: MessageId) -> AbortHandle {
        let buffers = self.buffers.clone();
        let arrival = self.arrival.clone();
        let events = self.events.clone();
        let timeout = self.timeout;
        let missing_limit = self.missing_limit;
        let mut nack_window = self.enable_nack;

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(timeout).await;
                let missing = match buffers.get(&message_id) {
                    Some(buffer) => buffer.missing(missing_limit),
                    None => return,
                };

                if nack_window {
                    nack_window = false;
                    debug!(
                        "Reassembly of {} stalled, {} fragments missing",
                        message_id.short(),
                        missing.len()
                    );
                    let event = ReassemblyEvent::Expired { message_id, missing };
                    if events.send(event).await.is_err() {
                        debug!("Reassembler dropped before {} expired", message_id.short());
                    }
                    continue;
                }

                buffers.remove(&message_id);
                arrival.lock().retain(|id| *id != message_id);
                warn!(
                    "Abandoned reassembly of {} with {} fragments missing",
                    message_id.short(),
                    missing.len()
                );
                let event = ReassemblyEvent::Abandoned { message_id, missing };
                if events.send(event).await.is_err() {
                    debug!("Reassembler dropped before {} was abandoned", message_id.short());
                }
                return;
            }
        })
        .abort_handle()
    }

    /// Number of incomplete messages
    pub fn pending_count(&self) -> usize {
        self.buffers.len()
    }

    /// Missing indices of an incomplete message, at most as many as a NACK carries
    pub fn missing(&self, message_id: &MessageId) -> Option<Vec<u32>> {
        self.buffers
            .get(message_id)
            .map(|buffer| buffer.missing(self.missing_limit))
    }

    /// Cancel every deadline and drop all partial messages
    pub fn shutdown(&self) {
        for entry in self.buffers.iter() {
            entry.deadline.abort();
        }
        self.buffers.clear();
        self.arrival.lock().clear();
    }
}

/// Largest fragment count a sealed message can need
fn max_fragments(fragment_max_size: usize) -> u32 {
    let size = fragment_max_size.max(1);
    let count = (MAX_SEALED_MESSAGE_SIZE + size - 1) / size;
    u32::try_from(count).unwrap_or(u32::MAX)
}

/// Missing indices that fit in one NACK frame
pub(crate) fn missing_limit(fragment_max_size: usize) -> usize {
    ((fragment_max_size + FRAME_OVERHEAD) / 8).max(1)
}

impl Drop for Reassembler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config(enable_nack: bool) -> FragmentConfig {
        FragmentConfig {
            fragment_max_size: 4,
            enable_nack,
            ..Default::default()
        }
    }

    #[test]
    fn test_split_sizes() {
        let fragmenter = Fragmenter::new(4);
        let id = MessageId::new();

        let fragments = fragmenter.split(id, b"0123456789");
        assert_eq!(fragments.len(), 3);
        assert!(fragments.iter().all(|f| f.total == 3 && f.message_id == id));
        assert_eq!(fragments[2].payload, b"89");

        let empty = fragmenter.split(id, b"");
        assert_eq!(empty.len(), 1);
        assert_eq!(empty[0].total, 1);
    }

    #[tokio::test]
    async fn test_reverse_order_reassembly() {
        let (reassembler, _events) = Reassembler::new(&config(true));
        let mut fragments = Fragmenter::new(4).split(MessageId::new(), b"hello fragmented world");
        fragments.reverse();

        let last = fragments.pop().unwrap();
        for fragment in fragments {
            assert_eq!(reassembler.accept(fragment).unwrap(), None);
        }
        assert_eq!(
            reassembler.accept(last).unwrap().unwrap(),
            b"hello fragmented world"
        );
        assert_eq!(reassembler.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_during_reassembly_is_ignored() {
        let (reassembler, _events) = Reassembler::new(&config(true));
        let fragments = Fragmenter::new(4).split(MessageId::new(), b"abcdefgh");

        assert!(reassembler.accept(fragments[0].clone()).unwrap().is_none());
        let mut tampered = fragments[0].clone();
        tampered.payload = b"XXXX".to_vec();
        assert!(reassembler.accept(tampered).unwrap().is_none());

        assert_eq!(
            reassembler.accept(fragments[1].clone()).unwrap().unwrap(),
            b"abcdefgh"
        );
    }

    #[tokio::test]
    async fn test_inconsistent_total_rejected() {
        let (reassembler, _events) = Reassembler::new(&config(true));
        let id = MessageId::new();
        let fragments = Fragmenter::new(4).split(id, b"abcdefgh");
        reassembler.accept(fragments[0].clone()).unwrap();

        let bogus = Fragment {
            message_id: id,
            index: 1,
            total: 5,
            payload: vec![],
        };
        assert!(matches!(
            reassembler.accept(bogus),
            Err(ProtocolError::InconsistentFragment { .. })
        ));

        let out_of_range = Fragment {
            message_id: MessageId::new(),
            index: 2,
            total: 2,
            payload: vec![],
        };
        assert!(reassembler.accept(out_of_range).is_err());
    }

    #[tokio::test]
    async fn test_total_beyond_largest_message_rejected() {
        let config = config(true);
        let (reassembler, _events) = Reassembler::new(&config);
        let cap = max_fragments(config.fragment_max_size);

        let oversized = Fragment {
            message_id: MessageId::new(),
            index: 0,
            total: cap + 1,
            payload: vec![1],
        };
        assert!(matches!(
            reassembler.accept(oversized),
            Err(ProtocolError::InconsistentFragment { .. })
        ));

        let largest = Fragment {
            message_id: MessageId::new(),
            index: 0,
            total: cap,
            payload: vec![1],
        };
        assert!(reassembler.accept(largest).unwrap().is_none());
        assert_eq!(reassembler.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_list_fits_one_nack() {
        let (reassembler, _events) = Reassembler::new(&config(true));
        let id = MessageId::new();
        reassembler
            .accept(Fragment {
                message_id: id,
                index: 0,
                total: 1000,
                payload: vec![1],
            })
            .unwrap();

        let missing = reassembler.missing(&id).unwrap();
        assert_eq!(missing.len(), missing_limit(4));
        assert_eq!(missing[0], 1);
    }

    #[tokio::test]
    async fn test_full_reassembler_abandons_oldest() {
        let config = FragmentConfig {
            max_pending_reassemblies: 2,
            ..config(true)
        };
        let (reassembler, mut events) = Reassembler::new(&config);
        let fragmenter = Fragmenter::new(4);
        let first = fragmenter.split(MessageId::new(), b"11112222");
        let second = fragmenter.split(MessageId::new(), b"33334444");
        let third = fragmenter.split(MessageId::new(), b"55556666");

        reassembler.accept(first[0].clone()).unwrap();
        reassembler.accept(second[0].clone()).unwrap();
        reassembler.accept(third[0].clone()).unwrap();
        assert_eq!(reassembler.pending_count(), 2);

        assert_eq!(
            events.try_recv().unwrap(),
            ReassemblyEvent::Abandoned {
                message_id: first[0].message_id,
                missing: vec![1],
            }
        );
        assert!(reassembler.missing(&first[0].message_id).is_none());
        assert_eq!(
            reassembler.accept(third[1].clone()).unwrap().unwrap(),
            b"55556666"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_with_nack_gets_second_window() {
        let (reassembler, mut events) = Reassembler::new(&config(true));
        let id = MessageId::new();
        let fragments = Fragmenter::new(4).split(id, b"abcdefghijkl");
        reassembler.accept(fragments[1].clone()).unwrap();

        match events.recv().await.unwrap() {
            ReassemblyEvent::Expired { message_id, missing } => {
                assert_eq!(message_id, id);
                assert_eq!(missing, vec![0, 2]);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(reassembler.pending_count(), 1);

        reassembler.accept(fragments[0].clone()).unwrap();
        assert_eq!(
            reassembler.accept(fragments[2].clone()).unwrap().unwrap(),
            b"abcdefghijkl"
        );
    }

    proptest! {
        #[test]
        fn test_any_arrival_order_reassembles(
            data in prop::collection::vec(any::<u8>(), 0..300),
            max_size in 1usize..40,
            seed in any::<u64>(),
        ) {
            use rand::rngs::StdRng;
            use rand::seq::SliceRandom;
            use rand::SeedableRng;

            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            let _guard = runtime.enter();
            let (reassembler, _events) = Reassembler::new(&config(true));

            let mut fragments = Fragmenter::new(max_size).split(MessageId::new(), &data);
            fragments.shuffle(&mut StdRng::seed_from_u64(seed));

            let mut completed = None;
            for fragment in fragments {
                if let Some(bytes) = reassembler.accept(fragment).unwrap() {
                    prop_assert!(completed.is_none());
                    completed = Some(bytes);
                }
            }
            prop_assert_eq!(completed, Some(data));
            prop_assert_eq!(reassembler.pending_count(), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_without_nack_abandons() {
        let (reassembler, mut events) = Reassembler::new(&config(false));
        let id = MessageId::new();
        let fragments = Fragmenter::new(4).split(id, b"abcdefgh");
        reassembler.accept(fragments[0].clone()).unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            ReassemblyEvent::Abandoned {
                message_id: id,
                missing: vec![1],
            }
        );
        assert_eq!(reassembler.pending_count(), 0);
    }
}
