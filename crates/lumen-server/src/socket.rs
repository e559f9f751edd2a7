use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};

use crate::messages::ServerMessage;
use crate::session::{ChannelClosed, Inbound, SessionChannel};

/// [`SessionChannel`] over an upgraded WebSocket.
pub(crate) struct WsChannel {
    socket: WebSocket,
}

impl WsChannel {
    pub(crate) fn new(socket: WebSocket) -> Self {
        Self { socket }
    }

    pub(crate) async fn close(mut self) {
        if let Err(error) = self.socket.send(Message::Close(None)).await {
            tracing::debug!(%error, "websocket already closed");
        }
    }
}

#[async_trait]
impl SessionChannel for WsChannel {
    async fn recv(&mut self) -> Result<Inbound, ChannelClosed> {
        loop {
            match self.socket.recv().await {
                Some(Ok(Message::Text(text))) => return Ok(Inbound::Text(text.as_str().to_owned())),
                Some(Ok(Message::Binary(bytes))) => return Ok(Inbound::Binary(bytes)),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Err(ChannelClosed),
                Some(Err(error)) => {
                    tracing::debug!(%error, "websocket receive failed");
                    return Err(ChannelClosed);
                }
            }
        }
    }

    async fn send(&mut self, message: &ServerMessage) -> Result<(), ChannelClosed> {
        let payload = serde_json::to_string(message).map_err(|error| {
            tracing::error!(%error, "failed to encode session message");
            ChannelClosed
        })?;
        self.socket
            .send(Message::Text(payload.into()))
            .await
            .map_err(|_| ChannelClosed)
    }
}
