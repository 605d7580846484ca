use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::mpsc::{self, error::TrySendError};
use trellis_client::entities::event::ChangeEvent;
use uuid::Uuid;

/// Queue depth per subscriber. A subscriber that falls this far
/// behind is dropped and must reconnect + resync from a snapshot
/// read.
pub const SUBSCRIBER_QUEUE_SIZE: usize = 256;

/// Fan-out point between the change broadcaster and websocket
/// subscribers. Broadcasts take the read lock and never block on a
/// slow queue.
#[derive(Default)]
pub struct Hub {
  subscribers: RwLock<HashMap<Uuid, Subscriber>>,
}

struct Subscriber {
  tx: mpsc::Sender<ChangeEvent>,
}

impl Hub {
  pub fn new() -> Hub {
    Default::default()
  }

  pub fn subscribe(&self) -> (Uuid, mpsc::Receiver<ChangeEvent>) {
    let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_SIZE);
    let id = Uuid::new_v4();
    self
      .subscribers
      .write()
      .unwrap()
      .insert(id, Subscriber { tx });
    (id, rx)
  }

  pub fn unsubscribe(&self, id: &Uuid) {
    self.subscribers.write().unwrap().remove(id);
  }

  pub fn subscriber_count(&self) -> usize {
    self.subscribers.read().unwrap().len()
  }

  /// Non-blocking fan-out. Full or closed queues get the subscriber
  /// dropped; its receiver sees the closed channel and the connection
  /// handler hangs up.
  pub fn publish(&self, event: &ChangeEvent) {
    let mut dropped = Vec::new();
    {
      let subscribers = self.subscribers.read().unwrap();
      for (id, subscriber) in subscribers.iter() {
        match subscriber.tx.try_send(event.clone()) {
          Ok(()) => {}
          Err(TrySendError::Full(_)) => {
            warn!(
              "dropping subscriber {id}: queue full at {SUBSCRIBER_QUEUE_SIZE}"
            );
            dropped.push(*id);
          }
          Err(TrySendError::Closed(_)) => dropped.push(*id),
        }
      }
    }
    if !dropped.is_empty() {
      let mut subscribers = self.subscribers.write().unwrap();
      for id in dropped {
        subscribers.remove(&id);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use trellis_client::entities::event::{EventClass, EventVerb};

  use super::*;

  fn event(n: usize) -> ChangeEvent {
    ChangeEvent::new(
      EventClass::Container,
      EventVerb::Updated,
      serde_json::json!({ "@id": format!("c{n}") }),
    )
  }

  #[tokio::test]
  async fn events_reach_every_subscriber() {
    let hub = Hub::new();
    let (_a, mut rx_a) = hub.subscribe();
    let (_b, mut rx_b) = hub.subscribe();
    hub.publish(&event(1));
    assert_eq!(rx_a.recv().await.unwrap().data["@id"], "c1");
    assert_eq!(rx_b.recv().await.unwrap().data["@id"], "c1");
  }

  #[tokio::test]
  async fn slow_subscribers_are_dropped_fast_ones_kept() {
    let hub = Hub::new();
    let (_slow, slow_rx) = hub.subscribe();
    let (_fast, mut fast_rx) = hub.subscribe();
    assert_eq!(hub.subscriber_count(), 2);

    for n in 0..=SUBSCRIBER_QUEUE_SIZE {
      hub.publish(&event(n));
      // The fast subscriber keeps draining.
      fast_rx.recv().await.unwrap();
    }

    // The overflowing publish removed the stalled subscriber.
    assert_eq!(hub.subscriber_count(), 1);
    drop(slow_rx);

    hub.publish(&event(999));
    assert_eq!(
      fast_rx.recv().await.unwrap().data["@id"],
      "c999"
    );
  }

  #[tokio::test]
  async fn unsubscribe_closes_the_queue() {
    let hub = Hub::new();
    let (id, mut rx) = hub.subscribe();
    hub.unsubscribe(&id);
    assert!(rx.recv().await.is_none());
  }
}
