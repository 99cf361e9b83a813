//! WebSocket halves adapted onto the core socket traits.
//!
//! The pumps in `backbeat-core` are written against [`SocketReader`] and
//! [`SocketWriter`] so they can be driven by scripted mocks in tests.
//! This module provides the production implementation on top of an
//! upgraded axum socket.

use std::borrow::Cow;

use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use backbeat_core::{CloseReason, Inbound, SocketError, SocketReader, SocketWriter};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};

/// Read half of an upgraded socket.
pub struct WsReader {
    stream: SplitStream<WebSocket>,
}

/// Write half of an upgraded socket.
pub struct WsWriter {
    sink: SplitSink<WebSocket, Message>,
}

/// Split an upgraded socket into pump-ready halves.
#[must_use]
pub fn split(socket: WebSocket) -> (WsReader, WsWriter) {
    let (sink, stream) = socket.split();
    (WsReader { stream }, WsWriter { sink })
}

#[async_trait]
impl SocketReader for WsReader {
    async fn recv(&mut self) -> Result<Option<Inbound>, SocketError> {
        match self.stream.next().await {
            Some(Ok(Message::Text(text))) => Ok(Some(Inbound::Frame(Bytes::from(text)))),
            Some(Ok(Message::Binary(data))) => Ok(Some(Inbound::Frame(Bytes::from(data)))),
            // axum answers pings on its own; either control frame is a
            // sign of life from the peer.
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => Ok(Some(Inbound::Pong)),
            Some(Ok(Message::Close(_))) | None => Ok(None),
            Some(Err(err)) => Err(SocketError::Transport(err.to_string())),
        }
    }
}

#[async_trait]
impl SocketWriter for WsWriter {
    async fn send(&mut self, frame: Bytes) -> Result<(), SocketError> {
        let text = String::from_utf8(frame.to_vec())
            .map_err(|err| SocketError::Transport(err.to_string()))?;
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|err| SocketError::Transport(err.to_string()))
    }

    async fn ping(&mut self) -> Result<(), SocketError> {
        self.sink
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|err| SocketError::Transport(err.to_string()))
    }

    async fn close(&mut self, reason: CloseReason) -> Result<(), SocketError> {
        let frame = CloseFrame {
            code: match reason {
                CloseReason::Normal => close_code::NORMAL,
                CloseReason::GoingAway => close_code::AWAY,
            },
            reason: Cow::Borrowed(""),
        };
        self.sink
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|err| SocketError::Transport(err.to_string()))
    }
}
