//! Inbound dispatch: route responses to exchanges, requests to a handler.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::exchange::Coordinator;
use crate::message::{Envelope, Message};

/// Serves requests addressed to this device.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle one request. `Ok(Some(body))` is sent back to the requester,
    /// `Ok(None)` sends nothing.
    async fn handle(&self, request: &Envelope) -> peersync_common::Result<Option<Message>>;
}

/// Run the inbound loop until the inbox closes.
///
/// Every request is handled in its own task, so a slow transfer never holds
/// up the responses other exchanges are waiting for. A handler error is
/// answered with `Message::Refused`.
pub async fn serve(
    mut inbox: mpsc::UnboundedReceiver<Envelope>,
    coordinator: Coordinator,
    handler: Arc<dyn RequestHandler>,
) {
    while let Some(envelope) = inbox.recv().await {
        if envelope.body.is_response() {
            coordinator.on_response(envelope);
            continue;
        }

        let coordinator = coordinator.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            debug!(
                "{} handling {} from {}",
                coordinator.local().device,
                envelope.body.kind(),
                envelope.sender
            );

            let reply = match handler.handle(&envelope).await {
                Ok(Some(body)) => body,
                Ok(None) => return,
                Err(e) => {
                    warn!(
                        "Failed to handle {} from {}: {}",
                        envelope.body.kind(),
                        envelope.sender,
                        e
                    );
                    Message::Refused {
                        reason: e.to_string(),
                    }
                }
            };

            if let Err(e) = coordinator.reply(&envelope, reply).await {
                warn!("Failed to reply to {}: {}", envelope.sender, e);
            }
        });
    }
    debug!("Inbound loop of {} stopped", coordinator.local().device);
}
