use axum::{
  Router,
  extract::{WebSocketUpgrade, ws::Message},
  response::IntoResponse,
  routing::get,
};
use futures::{SinkExt, StreamExt};
use tokio::select;
use tokio_util::sync::CancellationToken;

use crate::state;

mod broadcast;
mod hub;

pub use broadcast::{run_broadcaster, spawn_change_broadcaster};
pub use hub::{Hub, SUBSCRIBER_QUEUE_SIZE};

pub fn router() -> Router {
  Router::new().route("/events", get(handler))
}

/// Subscribe the connection to the hub and forward events until
/// either side hangs up. Authentication happens upstream; the
/// connection arrives here with a resolved identity.
async fn handler(ws: WebSocketUpgrade) -> impl IntoResponse {
  ws.on_upgrade(|socket| async move {
    let hub = state::hub();
    let (id, mut receiver) = hub.subscribe();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();

    tokio::spawn(async move {
      loop {
        let event = select! {
          _ = cancel_clone.cancelled() => break,
          event = receiver.recv() => {
            match event {
              Some(event) => event,
              // The hub dropped us (queue overflow): the client must
              // reconnect and resync from a snapshot read.
              None => break,
            }
          }
        };
        let Ok(text) = serde_json::to_string(&event) else {
          continue;
        };
        if ws_sender.send(Message::text(text)).await.is_err() {
          break;
        }
      }
      let _ = ws_sender.close().await;
    });

    // After subscribing, the client only ever closes.
    while let Some(msg) = ws_receiver.next().await {
      match msg {
        Ok(Message::Close(_)) | Err(_) => break,
        _ => {}
      }
    }
    cancel.cancel();
    hub.unsubscribe(&id);
  })
}
