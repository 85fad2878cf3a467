//! Socket seam for the notification channel.
//!
//! The channel loop only needs text frames in, text frames out, and a close
//! code when the connection ends. `TungsteniteConnector` provides that over a
//! blocking `tungstenite` client whose reads time out, so the loop can poll
//! its control queue between frames. Dialing and the upgrade handshake are
//! bounded by a separate connect timeout.

use anyhow::{anyhow, Context, Result};
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::CloseFrame;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

use super::state::ABNORMAL_CLOSE_CODE;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocketEvent {
    Text(String),
    /// The peer closed the connection (or it dropped) with this code.
    Closed(u16),
    /// Nothing arrived before the read timeout.
    Idle,
}

pub trait SocketStream: Send {
    fn read_event(&mut self) -> Result<SocketEvent>;
    fn send_text(&mut self, text: &str) -> Result<()>;
    /// Best-effort close handshake with `code`.
    fn close(&mut self, code: u16);
}

pub trait Connector: Send + Sync {
    fn connect(&self, url: &str) -> Result<Box<dyn SocketStream>>;
}

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TungsteniteConnector {
    read_timeout: Duration,
    connect_timeout: Duration,
}

impl TungsteniteConnector {
    pub fn new(read_timeout: Duration) -> Self {
        Self {
            read_timeout,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    fn dial(&self, url: &str) -> Result<TcpStream> {
        let target = url::Url::parse(url).with_context(|| format!("invalid websocket url {}", redact(url)))?;
        let addrs: Vec<SocketAddr> = target
            .socket_addrs(|| None)
            .with_context(|| format!("resolve {}", redact(url)))?;
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(tcp) => return Ok(tcp),
                Err(e) => last_err = Some(e),
            }
        }
        match last_err {
            Some(e) => Err(e).with_context(|| format!("websocket connect {}", redact(url))),
            None => Err(anyhow!("no address for {}", redact(url))),
        }
    }
}

impl Default for TungsteniteConnector {
    fn default() -> Self {
        Self::new(Duration::from_millis(200))
    }
}

impl Connector for TungsteniteConnector {
    fn connect(&self, url: &str) -> Result<Box<dyn SocketStream>> {
        let tcp = self.dial(url)?;
        tcp.set_read_timeout(Some(self.connect_timeout))
            .and_then(|()| tcp.set_write_timeout(Some(self.connect_timeout)))
            .context("set handshake timeout")?;
        let (socket, response) = tungstenite::client_tls(url, tcp)
            .map_err(|e| anyhow!("websocket handshake {}: {}", redact(url), e))?;
        log::debug!("websocket upgrade status {}", response.status());
        set_read_timeout(socket.get_ref(), self.read_timeout).context("set socket read timeout")?;
        Ok(Box::new(TungsteniteStream { socket }))
    }
}

fn set_read_timeout(stream: &MaybeTlsStream<TcpStream>, timeout: Duration) -> std::io::Result<()> {
    match stream {
        MaybeTlsStream::Plain(tcp) => tcp.set_read_timeout(Some(timeout)),
        MaybeTlsStream::Rustls(tls) => tls.sock.set_read_timeout(Some(timeout)),
        _ => Ok(()),
    }
}

/// Strip the query string so domain ids stay out of error chains.
fn redact(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

struct TungsteniteStream {
    socket: WebSocket<MaybeTlsStream<TcpStream>>,
}

impl SocketStream for TungsteniteStream {
    fn read_event(&mut self) -> Result<SocketEvent> {
        match self.socket.read() {
            Ok(Message::Text(text)) => Ok(SocketEvent::Text(text)),
            Ok(Message::Close(frame)) => Ok(SocketEvent::Closed(
                frame.map(|f| u16::from(f.code)).unwrap_or(ABNORMAL_CLOSE_CODE),
            )),
            // Pings are answered by tungstenite on the next read or write.
            Ok(_) => Ok(SocketEvent::Idle),
            Err(tungstenite::Error::Io(e))
                if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                Ok(SocketEvent::Idle)
            }
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                Ok(SocketEvent::Closed(ABNORMAL_CLOSE_CODE))
            }
            Err(e) => Err(e).context("websocket read"),
        }
    }

    fn send_text(&mut self, text: &str) -> Result<()> {
        self.socket
            .send(Message::Text(text.to_string()))
            .context("websocket send")
    }

    fn close(&mut self, code: u16) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        };
        if let Err(e) = self.socket.close(Some(frame)) {
            log::debug!("websocket close: {}", e);
            return;
        }
        // Drain until the peer acknowledges or the read times out.
        for _ in 0..5 {
            match self.socket.read() {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    }
}
