//! Integration flows across relay-bus and relay-telemetry.

pub mod ack_flow;
pub mod delivery_flow;
pub mod scaleout_flow;
pub mod telemetry_flow;

use futures::future::{ready, Ready};
use relay_bus::{DeliveryError, MessageBatch};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Callback that forwards every batch to a channel, standing in for a
/// connection's write loop.
pub fn forward_to(
    tx: mpsc::UnboundedSender<MessageBatch>,
) -> impl Fn(MessageBatch, Arc<()>) -> Ready<Result<bool, DeliveryError>> + Send + Sync + 'static {
    move |batch, _| {
        let _ = tx.send(batch);
        ready(Ok(true))
    }
}

/// Wait for the next batch, failing the test after five seconds.
pub async fn recv_batch(rx: &mut mpsc::UnboundedReceiver<MessageBatch>) -> MessageBatch {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for batch")
        .expect("delivery channel closed")
}
