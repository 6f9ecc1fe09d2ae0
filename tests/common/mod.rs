#![allow(dead_code)]

use std::net::SocketAddr;

use realmnet::config::ServerConfig;
use realmnet::core::SharedServerState;
use realmnet::dispatch::Registry;
use realmnet::servers::Host;
use realmnet::session::Phases;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub fn test_config() -> ServerConfig {
    ServerConfig {
        bind_ip: "127.0.0.1".to_string(),
        stats_interval_secs: 0,
        ..ServerConfig::default()
    }
}

/// Start a host on an ephemeral port.
pub async fn start_host<P: Phases>(name: &'static str, registry: Registry<P>) -> (SocketAddr, SharedServerState) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let host = Host::new(name, &test_config(), registry).unwrap();
    let state = host.state().clone();

    tokio::spawn(async move {
        host.run(listener).await.unwrap();
    });

    (addr, state)
}

/// Connect, answer the handshake and return the stream in the entry phase.
pub async fn connect(addr: SocketAddr) -> TcpStream {
    connect_with_clock(addr, 0, 0).await.0
}

/// Like [`connect`], but the client claims a clock `behind_ms` behind the
/// server and a round trip of `delta`. Also returns the server time the
/// handshake carried.
pub async fn connect_with_clock(addr: SocketAddr, behind_ms: u32, delta: u32) -> (TcpStream, u32) {
    let mut client = TcpStream::connect(addr).await.unwrap();

    let mut hs = [0u8; 13];
    client.read_exact(&mut hs).await.unwrap();
    assert_eq!(hs[0], 0xFF, "handshake must come first");
    let server_time = u32::from_le_bytes(hs[5..9].try_into().unwrap());

    let mut echo = hs;
    echo[5..9].copy_from_slice(&server_time.wrapping_sub(behind_ms).to_le_bytes());
    echo[9..13].copy_from_slice(&delta.to_le_bytes());
    client.write_all(&echo).await.unwrap();

    let mut phase = [0u8; 2];
    client.read_exact(&mut phase).await.unwrap();
    assert_eq!(phase[0], 0xFE);
    (client, server_time)
}

pub async fn read_n(client: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    client.read_exact(&mut buf).await.unwrap();
    buf
}

/// Read until the server closes; returns whatever arrived first.
pub async fn read_to_close(client: &mut TcpStream) -> Vec<u8> {
    let mut rest = Vec::new();
    let read = tokio::time::timeout(std::time::Duration::from_secs(5), client.read_to_end(&mut rest)).await;
    assert!(read.is_ok(), "server did not close the connection");
    rest
}

pub fn fixed(s: &str, len: usize) -> Vec<u8> {
    let mut out = s.as_bytes().to_vec();
    out.resize(len, 0);
    out
}
