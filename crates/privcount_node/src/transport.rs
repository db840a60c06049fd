//! TLS transport and the length-prefixed message framing (§6, §4.5). Each
//! connection is a `Framed<TlsStream, LengthDelimitedCodec>` carrying
//! [`crate::protocol::Message`] JSON frames; the handshake runs as the first
//! three frames exchanged on a freshly-accepted/connected stream.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use privcount_core::handshake::{self, NONCE_LEN};
use rand::RngCore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::protocol::{self, Message, ProtocolError};

pub type MessageStream = Framed<TlsStream<TcpStream>, LengthDelimitedCodec>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("connection closed before handshake completed")]
    Closed,
    #[error("handshake authentication failed")]
    AuthFailed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
}

pub fn framed(stream: TlsStream<TcpStream>) -> MessageStream {
    Framed::new(stream, LengthDelimitedCodec::new())
}

pub async fn send(stream: &mut MessageStream, msg: &Message) -> Result<(), TransportError> {
    let bytes = protocol::encode(msg)?;
    stream.send(bytes.into()).await?;
    Ok(())
}

pub async fn recv(stream: &mut MessageStream) -> Result<Message, TransportError> {
    let frame = stream
        .next()
        .await
        .ok_or(TransportError::Closed)??;
    Ok(protocol::decode(&frame)?)
}

/// Server side of the three-message handshake (§4.5): send N_s, receive
/// (N_c, client HMAC), verify, reply with the server HMAC.
pub async fn server_handshake(
    stream: &mut MessageStream,
    key: &[u8],
) -> Result<(), TransportError> {
    let mut n_s = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut n_s);
    send(
        stream,
        &Message::Handshake1 {
            nonce_s_hex: hex::encode(n_s),
        },
    )
    .await?;

    let reply = recv(stream).await?;
    let (n_c_hex, client_hmac_hex) = match reply {
        Message::Handshake2 {
            nonce_c_hex,
            hmac_hex,
        } => (nonce_c_hex, hmac_hex),
        _ => return Err(TransportError::AuthFailed),
    };
    let n_c: [u8; NONCE_LEN] = hex::decode(&n_c_hex)
        .ok()
        .and_then(|v| v.try_into().ok())
        .ok_or(TransportError::AuthFailed)?;
    let expected = handshake::client_response(key, &n_s, &n_c);
    let received = hex::decode(&client_hmac_hex).map_err(|_| TransportError::AuthFailed)?;
    if !handshake::verify(&expected, &received) {
        return Err(TransportError::AuthFailed);
    }

    let server_hmac = handshake::server_response(key, &n_s, &n_c);
    send(
        stream,
        &Message::Handshake3 {
            hmac_hex: hex::encode(server_hmac),
        },
    )
    .await?;
    Ok(())
}

/// Client side of the handshake.
pub async fn client_handshake(
    stream: &mut MessageStream,
    key: &[u8],
) -> Result<(), TransportError> {
    let first = recv(stream).await?;
    let n_s: [u8; NONCE_LEN] = match first {
        Message::Handshake1 { nonce_s_hex } => hex::decode(&nonce_s_hex)
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or(TransportError::AuthFailed)?,
        _ => return Err(TransportError::AuthFailed),
    };

    let mut n_c = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut n_c);
    let client_hmac = handshake::client_response(key, &n_s, &n_c);
    send(
        stream,
        &Message::Handshake2 {
            nonce_c_hex: hex::encode(n_c),
            hmac_hex: hex::encode(client_hmac),
        },
    )
    .await?;

    let third = recv(stream).await?;
    let server_hmac_hex = match third {
        Message::Handshake3 { hmac_hex } => hmac_hex,
        _ => return Err(TransportError::AuthFailed),
    };
    let expected = handshake::server_response(key, &n_s, &n_c);
    let received = hex::decode(&server_hmac_hex).map_err(|_| TransportError::AuthFailed)?;
    if !handshake::verify(&expected, &received) {
        return Err(TransportError::AuthFailed);
    }
    Ok(())
}

pub fn load_server_config(
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Result<Arc<rustls::ServerConfig>, TransportError> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut std::io::BufReader::new(cert_pem))
        .filter_map(|c| c.ok())
        .collect();
    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut std::io::BufReader::new(key_pem))?
            .ok_or(TransportError::Closed)?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

pub fn tls_acceptor(config: Arc<rustls::ServerConfig>) -> TlsAcceptor {
    TlsAcceptor::from(config)
}

pub fn tls_connector(root_store: rustls::RootCertStore) -> TlsConnector {
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

pub fn server_name(host: &str) -> Result<ServerName<'static>, TransportError> {
    ServerName::try_from(host.to_string()).map_err(|_| TransportError::Closed)
}

/// Loads a single pinned TS certificate into a fresh root store. DCs and SKs
/// pin the TS's own certificate rather than trusting a CA, since the
/// deployment's real authentication is the handshake key (§4.5), not a PKI.
pub fn load_pinned_root(cert_pem: &[u8]) -> Result<rustls::RootCertStore, TransportError> {
    let mut store = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut std::io::BufReader::new(cert_pem)) {
        let cert: CertificateDer<'static> = cert?;
        store.add(cert).map_err(|_| TransportError::Closed)?;
    }
    Ok(store)
}

/// Dials the TS, completes the TLS handshake, and returns a ready
/// `MessageStream`. `host` is used for TLS SNI/hostname verification.
pub async fn connect_to_ts(
    addr: &str,
    host: &str,
    cert_pem: &[u8],
) -> Result<MessageStream, TransportError> {
    let root_store = load_pinned_root(cert_pem)?;
    let connector = tls_connector(root_store);
    let tcp = TcpStream::connect(addr).await?;
    let tls = connector.connect(server_name(host)?, tcp).await?;
    Ok(framed(TlsStream::Client(tls)))
}

/// Accepts one inbound TLS connection on an already-bound listener side
/// (the TS's accept loop owns the `TcpListener`).
pub async fn accept_client(
    acceptor: &TlsAcceptor,
    tcp: TcpStream,
) -> Result<MessageStream, TransportError> {
    let tls = acceptor.accept(tcp).await?;
    Ok(framed(TlsStream::Server(tls)))
}
