#![allow(dead_code)]

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use ptymux::bus::Bus;
use ptymux::server::WsServer;
use ptymux::transport::{FrameSource, OutputSink};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub const TOKEN: &str = "test-token";

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Binds a fresh bus on a free port and serves it in the background.
pub async fn start_server() -> (u16, Arc<Bus>) {
    let server = WsServer::bind(Some(TOKEN.to_string()), 0)
        .await
        .expect("bind server");
    let port = server.port;
    let bus = server.bus();
    tokio::spawn(async move {
        let _ = server.serve().await;
    });
    (port, bus)
}

pub fn process_url(port: u16, process_id: &str) -> String {
    format!("ws://127.0.0.1:{port}/ws/process?token={TOKEN}&processId={process_id}")
}

pub fn client_url(port: u16, process_id: &str) -> String {
    format!("ws://127.0.0.1:{port}/ws/client?token={TOKEN}&processId={process_id}")
}

pub async fn connect(url: &str) -> WsClient {
    connect_async(url).await.expect("websocket handshake").0
}

pub fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// In-memory stand-ins for the runner's transport halves.
pub struct ChannelSink(pub mpsc::Sender<Vec<u8>>);

#[async_trait]
impl OutputSink for ChannelSink {
    async fn send(&mut self, payload: Vec<u8>) -> io::Result<()> {
        self.0
            .send(payload)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "sink closed"))
    }
}

pub struct ChannelSource(pub mpsc::Receiver<Vec<u8>>);

#[async_trait]
impl FrameSource for ChannelSource {
    async fn next(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.0.recv().await)
    }
}
