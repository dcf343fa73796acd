//! Single-publisher fan-out hub for broadcast mode.
//!
//! One publisher slot, N subscribers, one bounded queue per subscriber.
//! Publication takes a snapshot of the subscriber set under a short-held
//! lock and pushes to each queue without holding the hub lock, so a slow
//! subscriber can never stall the others. Per-subscriber order is
//! preserved; there is no cross-subscriber ordering barrier.

use bytes::Bytes;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

/// A frame distributed through the hub.
///
/// Audio payloads are refcounted buffers: every subscriber holds the same
/// allocation and the last holder frees it.
#[derive(Debug, Clone)]
pub enum HubFrame {
    /// A serialized text event (translation, status, volume, ...)
    Text(String),
    /// A synthesized audio artifact
    Audio(Bytes),
}

/// What to do when a subscriber's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Drop the oldest queued frame to make room (default)
    #[default]
    DropOldest,
    /// Disconnect the subscriber
    Disconnect,
}

struct SubscriberQueue {
    frames: Mutex<VecDeque<HubFrame>>,
    notify: Notify,
    dropped: AtomicU64,
    disconnected: AtomicBool,
}

impl SubscriberQueue {
    fn new() -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            disconnected: AtomicBool::new(false),
        }
    }

    fn disconnect(&self) {
        self.disconnected.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

/// Receiving handle for one subscriber.
pub struct Subscriber {
    id: Uuid,
    queue: Arc<SubscriberQueue>,
}

impl Subscriber {
    /// Subscriber identifier, used for `unsubscribe`.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Number of frames dropped for this subscriber under the
    /// `DropOldest` policy.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    /// Await the next frame.
    ///
    /// Returns `None` once the subscriber has been disconnected (by
    /// `unsubscribe`, the `Disconnect` overflow policy, or hub shutdown)
    /// and its queue has been fully drained.
    pub async fn next(&self) -> Option<HubFrame> {
        loop {
            {
                let mut frames = self.queue.frames.lock().expect("hub queue lock poisoned");
                if let Some(frame) = frames.pop_front() {
                    return Some(frame);
                }
            }
            if self.queue.disconnected.load(Ordering::Acquire) {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }
}

/// The fan-out hub. Created once by the gateway at startup and shared by
/// the broadcast session and the subscriber handlers.
pub struct Hub {
    subscribers: Mutex<HashMap<Uuid, Arc<SubscriberQueue>>>,
    queue_depth: usize,
    policy: OverflowPolicy,
}

impl Hub {
    /// Create a hub with the given per-subscriber queue depth and
    /// overflow policy.
    pub fn new(queue_depth: usize, policy: OverflowPolicy) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            queue_depth,
            policy,
        }
    }

    /// Register a new subscriber and return its receiving handle.
    pub fn subscribe(&self) -> Subscriber {
        let id = Uuid::new_v4();
        let queue = Arc::new(SubscriberQueue::new());
        self.subscribers
            .lock()
            .expect("hub subscriber lock poisoned")
            .insert(id, queue.clone());
        debug!(%id, "subscriber registered");
        Subscriber { id, queue }
    }

    /// Remove a subscriber. Idempotent: unknown ids are ignored.
    pub fn unsubscribe(&self, id: Uuid) {
        let removed = self
            .subscribers
            .lock()
            .expect("hub subscriber lock poisoned")
            .remove(&id);
        if let Some(queue) = removed {
            queue.disconnect();
            debug!(%id, "subscriber removed");
        }
    }

    /// Current subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("hub subscriber lock poisoned")
            .len()
    }

    /// Deliver a frame to every current subscriber.
    ///
    /// Overflowing queues follow the configured policy; disconnected
    /// subscribers are removed on the spot.
    pub fn publish(&self, frame: HubFrame) {
        let snapshot: Vec<(Uuid, Arc<SubscriberQueue>)> = {
            let subscribers = self.subscribers.lock().expect("hub subscriber lock poisoned");
            subscribers
                .iter()
                .map(|(id, queue)| (*id, queue.clone()))
                .collect()
        };

        let mut to_remove = Vec::new();

        for (id, queue) in &snapshot {
            if queue.disconnected.load(Ordering::Acquire) {
                to_remove.push(*id);
                continue;
            }

            let mut frames = queue.frames.lock().expect("hub queue lock poisoned");
            if frames.len() >= self.queue_depth {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        frames.pop_front();
                        let dropped = queue.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        if dropped % 100 == 1 {
                            warn!(subscriber = %id, dropped, "subscriber queue overflow, dropping oldest");
                        }
                    }
                    OverflowPolicy::Disconnect => {
                        drop(frames);
                        warn!(subscriber = %id, "subscriber queue overflow, disconnecting");
                        queue.disconnect();
                        to_remove.push(*id);
                        continue;
                    }
                }
            }
            frames.push_back(frame.clone());
            drop(frames);
            queue.notify.notify_one();
        }

        if !to_remove.is_empty() {
            let mut subscribers = self.subscribers.lock().expect("hub subscriber lock poisoned");
            for id in to_remove {
                subscribers.remove(&id);
            }
        }
    }

    /// Discard every queued frame in every subscriber queue.
    ///
    /// Used by the authoritative broadcast `stop`: already-delivered
    /// frames cannot be recalled, but nothing queued survives.
    pub fn clear(&self) {
        let snapshot: Vec<Arc<SubscriberQueue>> = {
            let subscribers = self.subscribers.lock().expect("hub subscriber lock poisoned");
            subscribers.values().cloned().collect()
        };
        for queue in snapshot {
            queue.frames.lock().expect("hub queue lock poisoned").clear();
        }
    }

    /// Disconnect every subscriber. Used at gateway shutdown.
    pub fn shutdown(&self) {
        let drained: Vec<Arc<SubscriberQueue>> = {
            let mut subscribers = self.subscribers.lock().expect("hub subscriber lock poisoned");
            subscribers.drain().map(|(_, queue)| queue).collect()
        };
        for queue in drained {
            queue.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio(byte: u8) -> HubFrame {
        HubFrame::Audio(Bytes::from(vec![byte; 4]))
    }

    fn frame_byte(frame: &HubFrame) -> u8 {
        match frame {
            HubFrame::Audio(data) => data[0],
            HubFrame::Text(_) => panic!("expected audio frame"),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers_in_order() {
        let hub = Hub::new(32, OverflowPolicy::DropOldest);
        let sub_a = hub.subscribe();
        let sub_b = hub.subscribe();

        for i in 0..5 {
            hub.publish(audio(i));
        }

        for sub in [&sub_a, &sub_b] {
            for i in 0..5 {
                let frame = sub.next().await.unwrap();
                assert_eq!(frame_byte(&frame), i);
            }
        }
    }

    #[tokio::test]
    async fn test_drop_oldest_keeps_a_suffix_of_the_publish_sequence() {
        let hub = Hub::new(3, OverflowPolicy::DropOldest);
        let sub = hub.subscribe();

        for i in 0..10 {
            hub.publish(audio(i));
        }

        // The three newest frames survive, in publish order.
        for expected in 7..10 {
            let frame = sub.next().await.unwrap();
            assert_eq!(frame_byte(&frame), expected);
        }
        assert_eq!(sub.dropped(), 7);
    }

    #[tokio::test]
    async fn test_disconnect_policy_removes_overflowing_subscriber() {
        let hub = Hub::new(2, OverflowPolicy::Disconnect);
        let slow = hub.subscribe();

        for i in 0..3 {
            hub.publish(audio(i));
        }

        // The third publish overflowed the queue and disconnected the
        // subscriber; under this policy delivered frames are never dropped,
        // so what was queued is still readable before the end marker.
        assert_eq!(hub.subscriber_count(), 0);
        assert_eq!(frame_byte(&slow.next().await.unwrap()), 0);
        assert_eq!(frame_byte(&slow.next().await.unwrap()), 1);
        assert!(slow.next().await.is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let hub = Hub::new(8, OverflowPolicy::DropOldest);
        let sub = hub.subscribe();
        let id = sub.id();

        hub.unsubscribe(id);
        hub.unsubscribe(id);
        assert_eq!(hub.subscriber_count(), 0);
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_clear_discards_queued_frames() {
        let hub = Hub::new(8, OverflowPolicy::DropOldest);
        let sub = hub.subscribe();

        hub.publish(audio(1));
        hub.publish(audio(2));
        hub.clear();
        hub.publish(audio(3));

        let frame = sub.next().await.unwrap();
        assert_eq!(frame_byte(&frame), 3);
    }

    #[tokio::test]
    async fn test_text_frames_interleave_with_audio_per_subscriber() {
        let hub = Hub::new(8, OverflowPolicy::DropOldest);
        let sub = hub.subscribe();

        hub.publish(HubFrame::Text("{\"type\":\"translation\"}".to_string()));
        hub.publish(audio(9));

        match sub.next().await.unwrap() {
            HubFrame::Text(text) => assert!(text.contains("translation")),
            other => panic!("expected text frame first, got {other:?}"),
        }
        match sub.next().await.unwrap() {
            HubFrame::Audio(data) => assert_eq!(data[0], 9),
            other => panic!("expected audio frame second, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_subscriber_blocks_until_publish() {
        let hub = Arc::new(Hub::new(8, OverflowPolicy::DropOldest));
        let sub = hub.subscribe();

        let publisher = {
            let hub = hub.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                hub.publish(audio(5));
            })
        };

        let frame = sub.next().await.unwrap();
        assert_eq!(frame_byte(&frame), 5);
        publisher.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_ends_all_subscribers() {
        let hub = Hub::new(8, OverflowPolicy::DropOldest);
        let sub_a = hub.subscribe();
        let sub_b = hub.subscribe();

        hub.shutdown();

        assert!(sub_a.next().await.is_none());
        assert!(sub_b.next().await.is_none());
        assert_eq!(hub.subscriber_count(), 0);
    }
}
