// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Client-side transport setup for TCP, TLS and WebSocket connections.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::rustls::{Certificate, ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::Connector;

use super::options::{BrokerAddress, ConnectOptions, Transport};
use crate::constants::WS_SUBPROTOCOL;
use crate::error::{Error, ErrorKind};
use crate::stream::{split_io, split_ws, StreamReader, StreamWriter};

/// Open the transport named by the broker URI and return framed halves.
///
/// WebSocket transports negotiate the `mqtt` subprotocol.
///
/// # Errors
///
/// Returns error if the connection or handshake fails.
pub(crate) async fn connect_transport(
    address: &BrokerAddress,
    options: &ConnectOptions,
) -> Result<(StreamReader, StreamWriter), Error> {
    match address.transport() {
        Transport::Mqtt => {
            let tcp_stream = TcpStream::connect((address.host(), address.port())).await?;
            Ok(split_io(tcp_stream))
        }
        Transport::Mqtts => {
            let tcp_stream = TcpStream::connect((address.host(), address.port())).await?;
            let connector = TlsConnector::from(tls_client_config(options.ca_file())?);
            let server_name = ServerName::try_from(address.host()).map_err(|_| {
                Error::from_string(
                    ErrorKind::CertError,
                    format!("Invalid server name: {}", address.host()),
                )
            })?;
            let tls_stream = connector.connect(server_name, tcp_stream).await?;
            Ok(split_io(tls_stream))
        }
        Transport::Ws | Transport::Wss => {
            let mut request = address.ws_url().into_client_request()?;
            request.headers_mut().insert(
                "Sec-WebSocket-Protocol",
                HeaderValue::from_static(WS_SUBPROTOCOL),
            );
            for (name, value) in options.ws_headers() {
                let name = HeaderName::from_bytes(name.as_bytes()).map_err(|err| {
                    Error::from_string(
                        ErrorKind::ConfigError,
                        format!("Invalid websocket header name {name}: {err}"),
                    )
                })?;
                let value = HeaderValue::from_str(value).map_err(|err| {
                    Error::from_string(
                        ErrorKind::ConfigError,
                        format!("Invalid websocket header value: {err}"),
                    )
                })?;
                request.headers_mut().insert(name, value);
            }

            let connector = if address.transport() == Transport::Wss {
                Some(Connector::Rustls(tls_client_config(options.ca_file())?))
            } else {
                None
            };
            let (ws_stream, _response) = tokio_tungstenite::connect_async_tls_with_config(
                request, None, false, connector,
            )
            .await?;
            Ok(split_ws(ws_stream))
        }
    }
}

/// TLS client config trusting either the provided CA file or the webpki
/// root set.
fn tls_client_config(ca_file: Option<&std::path::PathBuf>) -> Result<Arc<ClientConfig>, Error> {
    let mut root_store = RootCertStore::empty();
    match ca_file {
        Some(ca_file) => add_pem_roots(&mut root_store, ca_file)?,
        None => {
            root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|anchor| {
                OwnedTrustAnchor::from_subject_spki_name_constraints(
                    anchor.subject,
                    anchor.spki,
                    anchor.name_constraints,
                )
            }));
        }
    }

    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

fn add_pem_roots(root_store: &mut RootCertStore, ca_file: &Path) -> Result<(), Error> {
    let mut reader = BufReader::new(File::open(ca_file).map_err(|err| {
        Error::from_string(
            ErrorKind::CertError,
            format!("Failed to open ca file {}: {err}", ca_file.display()),
        )
    })?);
    let certs = rustls_pemfile::certs(&mut reader).map_err(|err| {
        Error::from_string(ErrorKind::CertError, format!("Invalid ca file: {err}"))
    })?;
    if certs.is_empty() {
        return Err(Error::new(ErrorKind::CertError, "No CA certificate found"));
    }
    for cert in certs {
        root_store.add(&Certificate(cert)).map_err(|err| {
            Error::from_string(ErrorKind::CertError, format!("Invalid CA certificate: {err}"))
        })?;
    }
    Ok(())
}
