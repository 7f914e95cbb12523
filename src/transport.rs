//! Transport seams between the terminal runner and the bus.
//!
//! The runner only needs two capabilities from its connection: ship terminal
//! output upstream and yield incoming control frames. Keeping them behind
//! traits lets the client mode hand the runner a real WebSocket while tests
//! drive it over in-memory channels.

use std::io;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::Frame;

/// Outbound half: carries chunks of child terminal output.
#[async_trait]
pub trait OutputSink: Send {
    async fn send(&mut self, payload: Vec<u8>) -> io::Result<()>;
}

/// Inbound half: yields raw encoded frames, `Ok(None)` at end of stream.
#[async_trait]
pub trait FrameSource: Send {
    async fn next(&mut self) -> io::Result<Option<Vec<u8>>>;
}

type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsSink {
    inner: SplitSink<ClientSocket, Message>,
}

pub struct WsSource {
    inner: SplitStream<ClientSocket>,
}

pub fn split_client(socket: ClientSocket) -> (WsSink, WsSource) {
    let (sink, stream) = socket.split();
    (WsSink { inner: sink }, WsSource { inner: stream })
}

#[async_trait]
impl OutputSink for WsSink {
    /// Wraps each output chunk as one DATA frame so subscribers receive
    /// tagged frames they can decode.
    async fn send(&mut self, payload: Vec<u8>) -> io::Result<()> {
        let encoded = Frame::data(payload).encode();
        self.inner
            .send(Message::binary(encoded))
            .await
            .map_err(ws_to_io)
    }
}

#[async_trait]
impl FrameSource for WsSource {
    async fn next(&mut self) -> io::Result<Option<Vec<u8>>> {
        while let Some(msg) = self.inner.next().await {
            match msg {
                Ok(Message::Binary(payload)) => return Ok(Some(payload.to_vec())),
                Ok(Message::Text(text)) => return Ok(Some(text.as_str().as_bytes().to_vec())),
                Ok(Message::Close(_)) => return Ok(None),
                Ok(_) => continue,
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    return Ok(None)
                }
                Err(err) => return Err(io::Error::other(err)),
            }
        }
        Ok(None)
    }
}

fn ws_to_io(err: tungstenite::Error) -> io::Error {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            io::Error::new(io::ErrorKind::BrokenPipe, err)
        }
        other => io::Error::other(other),
    }
}
