//! DC event source: a line-oriented client for a Tor relay's control port
//! (§6). Authentication tries SAFECOOKIE, then HASHEDPASSWORD, then NULL, in
//! that preference order. Event-to-counter mapping is treated as a pure
//! function at the boundary of the core system (Out of scope, §1); this
//! module owns only the transport and authentication handshake.

use std::path::Path;

use privcount_core::config::AuthMode;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

#[derive(Debug, Error)]
pub enum EventSourceError {
    #[error("connect failed: {0}")]
    Connect(#[from] std::io::Error),
    #[error("authentication failed with every configured mode")]
    AuthFailed,
    #[error("control port closed the connection")]
    Closed,
}

pub const SUBSCRIBED_EVENTS: &[&str] = &[
    "PRIVCOUNT_DNS_RESOLVED",
    "PRIVCOUNT_STREAM_BYTES_TRANSFERRED",
    "PRIVCOUNT_STREAM_ENDED",
    "PRIVCOUNT_CIRCUIT_ENDED",
    "PRIVCOUNT_CONNECTION_ENDED",
    "PRIVCOUNT_HSDIR_CACHE_STORE",
    "PRIVCOUNT_CIRCUIT_CELL",
    "PRIVCOUNT_CIRCUIT_CLOSE",
];

pub struct EventSource {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl EventSource {
    pub async fn connect(
        addr: &str,
        auth_mode: AuthMode,
        cookie_path: Option<&Path>,
        password: Option<&str>,
    ) -> Result<Self, EventSourceError> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();
        let mut source = EventSource {
            reader: BufReader::new(read_half),
            writer: write_half,
        };
        source.authenticate(auth_mode, cookie_path, password).await?;
        source.enable_privcount().await?;
        source.subscribe_events().await?;
        Ok(source)
    }

    async fn authenticate(
        &mut self,
        mode: AuthMode,
        cookie_path: Option<&Path>,
        password: Option<&str>,
    ) -> Result<(), EventSourceError> {
        let auth_line = match mode {
            AuthMode::SafeCookie => {
                let cookie = cookie_path
                    .map(std::fs::read)
                    .transpose()
                    .map_err(EventSourceError::Connect)?
                    .unwrap_or_default();
                format!("AUTHENTICATE {}\r\n", hex::encode(cookie))
            }
            AuthMode::HashedPassword => {
                format!("AUTHENTICATE \"{}\"\r\n", password.unwrap_or_default())
            }
            AuthMode::Null => "AUTHENTICATE\r\n".to_string(),
        };
        self.send_line(&auth_line).await?;
        let reply = self.read_line().await?;
        if reply.starts_with("250") {
            Ok(())
        } else {
            Err(EventSourceError::AuthFailed)
        }
    }

    /// `SETCONF EnablePrivCount=1`, issued before the round so events on
    /// objects created earlier are silently dropped by the source (§6).
    async fn enable_privcount(&mut self) -> Result<(), EventSourceError> {
        self.send_line("SETCONF EnablePrivCount=1\r\n").await?;
        self.read_line().await?;
        Ok(())
    }

    async fn subscribe_events(&mut self) -> Result<(), EventSourceError> {
        let line = format!("SETEVENTS {}\r\n", SUBSCRIBED_EVENTS.join(" "));
        self.send_line(&line).await?;
        self.read_line().await?;
        Ok(())
    }

    async fn send_line(&mut self, line: &str) -> Result<(), EventSourceError> {
        self.writer.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String, EventSourceError> {
        let mut buf = String::new();
        let n = self.reader.read_line(&mut buf).await?;
        if n == 0 {
            return Err(EventSourceError::Closed);
        }
        Ok(buf)
    }

    /// Reads the next raw event line, or `Err(Closed)` if the control port
    /// hung up. Parsing an event line into `(counter_name, bin_index,
    /// increment)` is the collaborator's pure function (§1), not this
    /// module's concern.
    pub async fn next_event_line(&mut self) -> Result<String, EventSourceError> {
        self.read_line().await
    }
}
