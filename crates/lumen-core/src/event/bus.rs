// Copyright 2025 eraflo
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

/// A generic, thread-safe, unbounded event channel.
///
/// Publishing never blocks. If the receiving side is gone the event is dropped
/// and an error is logged.
#[derive(Debug)]
pub struct EventBus<T: Send + 'static> {
    sender: flume::Sender<T>,
    receiver: flume::Receiver<T>,
}

impl<T: Send + 'static> EventBus<T> {
    /// Creates a bus backed by an unbounded channel.
    pub fn new() -> Self {
        let (sender, receiver) = flume::unbounded();
        log::debug!("EventBus: initialized");
        Self { sender, receiver }
    }

    /// Sends an event without blocking.
    pub fn publish(&self, event: T) {
        if let Err(e) = self.sender.send(event) {
            log::error!("EventBus: failed to send event: {e}. Receiver likely disconnected.");
        }
    }

    /// Returns a clone of the sending end, for producers living on other threads.
    pub fn sender(&self) -> flume::Sender<T> {
        self.sender.clone()
    }

    /// Returns the receiving end. Intended for the owner of the bus.
    pub fn receiver(&self) -> &flume::Receiver<T> {
        &self.receiver
    }

    /// Removes and returns every event currently queued.
    pub fn drain(&self) -> Vec<T> {
        self.receiver.try_iter().collect()
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Returns `true` if no event is queued.
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

impl<T: Send + 'static> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, time::Duration};

    #[derive(Debug, Clone, PartialEq)]
    enum Probe {
        Allocated { bytes: u64 },
        Evicted,
    }

    #[test]
    fn publish_then_drain_preserves_order() {
        let bus = EventBus::<Probe>::new();
        bus.publish(Probe::Allocated { bytes: 16 });
        bus.publish(Probe::Evicted);
        bus.publish(Probe::Allocated { bytes: 32 });

        assert_eq!(bus.len(), 3);
        assert_eq!(
            bus.drain(),
            vec![
                Probe::Allocated { bytes: 16 },
                Probe::Evicted,
                Probe::Allocated { bytes: 32 }
            ]
        );
        assert!(bus.is_empty());
    }

    #[test]
    fn producers_on_other_threads() {
        let bus = EventBus::<Probe>::new();
        let sender = bus.sender();

        let handle = thread::spawn(move || {
            for bytes in 0..4 {
                sender
                    .send(Probe::Allocated { bytes })
                    .expect("receiver alive");
            }
        });
        handle.join().expect("producer thread panicked");

        let mut received = Vec::new();
        while let Ok(event) = bus.receiver().recv_timeout(Duration::from_millis(50)) {
            received.push(event);
        }
        assert_eq!(received.len(), 4);
    }

    #[test]
    fn sending_after_the_bus_is_dropped_fails() {
        let bus = EventBus::<Probe>::new();
        let sender = bus.sender();
        drop(bus);
        assert!(sender.send(Probe::Evicted).is_err());
    }
}
