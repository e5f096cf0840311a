// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Per-listener accept loops for TCP, TLS and WebSocket transports.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::WebSocketStream;

use super::{connection, BrokerInner};
use crate::config::Protocol;
use crate::constants::WS_SUBPROTOCOL;
use crate::error::Error;
use crate::stream::{split_io, split_ws, StreamReader, StreamWriter};

/// Accept-side state of one listener: connection counting and the
/// connection-limit semaphore.
pub(crate) struct Server {
    name: String,
    max_connections: Option<usize>,
    semaphore: Option<Arc<Semaphore>>,
    conn_count: AtomicUsize,
}

impl Server {
    pub fn new(name: &str, max_connections: Option<usize>) -> Self {
        Self {
            name: name.to_string(),
            max_connections,
            semaphore: max_connections.map(|max| Arc::new(Semaphore::new(max))),
            conn_count: AtomicUsize::new(0),
        }
    }

    /// Acquire a connection slot before the CONNECT packet is read.
    pub async fn acquire_connection(&self) -> Option<OwnedSemaphorePermit> {
        let permit = match &self.semaphore {
            Some(semaphore) => Arc::clone(semaphore).acquire_owned().await.ok(),
            None => None,
        };
        let count = self.conn_count.fetch_add(1, Ordering::SeqCst) + 1;
        log::info!(
            "broker: Listener {}: {}/{} connections acquired",
            self.name,
            count,
            self.max_connections
                .map_or_else(|| "∞".to_string(), |max| max.to_string())
        );
        permit
    }

    /// Release a connection slot, on any exit path.
    pub fn release_connection(&self, permit: Option<OwnedSemaphorePermit>) {
        drop(permit);
        let count = self.conn_count.fetch_sub(1, Ordering::SeqCst) - 1;
        log::info!(
            "broker: Listener {}: {}/{} connections acquired",
            self.name,
            count,
            self.max_connections
                .map_or_else(|| "∞".to_string(), |max| max.to_string())
        );
    }
}

/// Accept connections on one listener until the task is aborted at
/// shutdown.
pub(crate) async fn accept_loop(
    inner: Arc<BrokerInner>,
    server: Arc<Server>,
    listener: TcpListener,
    protocol: Protocol,
    tls_acceptor: Option<TlsAcceptor>,
) {
    loop {
        let (tcp_stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                log::warn!("broker: Listener {} accept failed: {err}", server.name);
                continue;
            }
        };

        let permit = server.acquire_connection().await;
        let inner = Arc::clone(&inner);
        let server = Arc::clone(&server);
        let tls_acceptor = tls_acceptor.clone();
        tokio::spawn(async move {
            match open_streams(protocol, tls_acceptor, tcp_stream).await {
                Ok((reader, writer)) => {
                    connection::client_connected(inner, reader, writer, peer_addr).await;
                }
                Err(err) => {
                    log::warn!("broker: Handshake with {peer_addr} failed: {err}");
                }
            }
            server.release_connection(permit);
        });
    }
}

async fn open_streams(
    protocol: Protocol,
    tls_acceptor: Option<TlsAcceptor>,
    tcp_stream: tokio::net::TcpStream,
) -> Result<(StreamReader, StreamWriter), Error> {
    match (protocol, tls_acceptor) {
        (Protocol::Mqtt, _) => Ok(split_io(tcp_stream)),
        (Protocol::Mqtts, Some(acceptor)) => {
            let tls_stream = acceptor.accept(tcp_stream).await?;
            Ok(split_io(tls_stream))
        }
        (Protocol::Ws, _) => {
            let ws_stream = accept_ws(tcp_stream).await?;
            Ok(split_ws(ws_stream))
        }
        (Protocol::Wss, Some(acceptor)) => {
            let tls_stream = acceptor.accept(tcp_stream).await?;
            let ws_stream = accept_ws(tls_stream).await?;
            Ok(split_ws(ws_stream))
        }
        (Protocol::Mqtts | Protocol::Wss, None) => Err(Error::new(
            crate::error::ErrorKind::InternalError,
            "TLS listener without acceptor",
        )),
    }
}

/// Accept a websocket handshake, selecting the `mqtt` subprotocol when
/// the client offers it.
async fn accept_ws<S>(stream: S) -> Result<WebSocketStream<S>, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        let offered = request
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|value| value.to_str().ok());
        match offered {
            Some(protocols)
                if protocols
                    .split(',')
                    .any(|protocol| protocol.trim() == WS_SUBPROTOCOL) =>
            {
                response.headers_mut().insert(
                    "Sec-WebSocket-Protocol",
                    HeaderValue::from_static(WS_SUBPROTOCOL),
                );
            }
            _ => log::debug!("broker: Websocket client offered no mqtt subprotocol"),
        }
        Ok(response)
    };

    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    Ok(ws_stream)
}
