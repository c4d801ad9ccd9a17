//! Connection task: one TCP stream or UDP socket with an observable
//! lifecycle and exact-size read/write primitives.
//!
//! State machine:
//!
//! ```text
//! Connecting --connect/bind--> Connected --close/error/eof--> Disconnected(reason)
//!      \______________________ connect failure ______________/
//! ```
//!
//! `Disconnected` is terminal and entered exactly once. Every pending read or
//! write is woken with `ConnectionError::Closed` when it is entered.

use std::future::Future;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{Mutex, OnceCell, watch};
use tracing::{debug, warn};

use crate::error::ConnectionError;

/// Largest frame `read_frame` accepts unless configured otherwise (16 MB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Largest payload a single UDP datagram can carry.
const MAX_DATAGRAM: usize = 65_507;

/// 4 MB socket buffers for throughput.
const SOCKET_BUF_SIZE: usize = 4 * 1024 * 1024;

/// Length prefix of a stream frame.
const FRAME_PREFIX: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected(_))
    }
}

type Observer = Arc<dyn Fn(&ConnectionState) + Send + Sync>;

enum Transport {
    Stream {
        reader: Mutex<OwnedReadHalf>,
        writer: Mutex<OwnedWriteHalf>,
        local: SocketAddr,
        peer: SocketAddr,
    },
    Datagram {
        socket: UdpSocket,
        recv_buf: Mutex<Vec<u8>>,
        local: SocketAddr,
        peer: SyncMutex<Option<SocketAddr>>,
    },
}

impl Transport {
    fn stream(stream: TcpStream) -> Result<Self, ConnectionError> {
        tune_stream(&stream);
        let local = stream.local_addr()?;
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(Transport::Stream {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            local,
            peer,
        })
    }

    fn datagram(socket: UdpSocket, peer: Option<SocketAddr>) -> Result<Self, ConnectionError> {
        let local = socket.local_addr()?;
        Ok(Transport::Datagram {
            socket,
            recv_buf: Mutex::new(vec![0u8; MAX_DATAGRAM]),
            local,
            peer: SyncMutex::new(peer),
        })
    }

    async fn read_exactly(&self, n: usize) -> Result<Bytes, ConnectionError> {
        match self {
            Transport::Stream { reader, .. } => {
                let mut buf = BytesMut::zeroed(n);
                let mut reader = reader.lock().await;
                reader.read_exact(&mut buf).await.map_err(eof_as_closed)?;
                Ok(buf.freeze())
            }
            Transport::Datagram { .. } => {
                let datagram = self.recv_datagram().await?;
                if datagram.len() != n {
                    return Err(ConnectionError::DatagramSize {
                        expected: n,
                        actual: datagram.len(),
                    });
                }
                Ok(datagram)
            }
        }
    }

    async fn write_exactly(&self, data: &[u8]) -> Result<(), ConnectionError> {
        match self {
            Transport::Stream { writer, .. } => {
                let mut writer = writer.lock().await;
                writer.write_all(data).await?;
                Ok(())
            }
            Transport::Datagram { socket, peer, .. } => {
                if peer.lock().is_none() {
                    return Err(ConnectionError::NotConnected);
                }
                let sent = socket.send(data).await?;
                if sent != data.len() {
                    return Err(ConnectionError::DatagramSize {
                        expected: data.len(),
                        actual: sent,
                    });
                }
                Ok(())
            }
        }
    }

    /// Receive one whole datagram. An unconnected socket latches onto the
    /// first sender it hears from.
    async fn recv_datagram(&self) -> Result<Bytes, ConnectionError> {
        let Transport::Datagram {
            socket,
            recv_buf,
            peer,
            ..
        } = self
        else {
            return Err(ConnectionError::Unsupported("datagram receive"));
        };

        let mut buf = recv_buf.lock().await;
        let known_peer = *peer.lock();
        let len = match known_peer {
            Some(_) => socket.recv(&mut buf).await?,
            None => {
                let (len, from) = socket.recv_from(&mut buf).await?;
                socket.connect(from).await?;
                *peer.lock() = Some(from);
                debug!("datagram task latched onto peer {}", from);
                len
            }
        };
        Ok(Bytes::copy_from_slice(&buf[..len]))
    }
}

/// Stateful wrapper around exactly one network connection.
pub struct ConnectionTask {
    kind: ConnectionKind,
    transport: OnceCell<Transport>,
    state: watch::Sender<ConnectionState>,
    observers: SyncMutex<Vec<Observer>>,
    max_frame_size: usize,
}

impl ConnectionTask {
    /// Create an unopened task in the `Connecting` state.
    pub fn open(kind: ConnectionKind) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            kind,
            transport: OnceCell::new(),
            state,
            observers: SyncMutex::new(Vec::new()),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Wrap an already-accepted TCP stream. The task starts `Connected`.
    pub fn from_tcp(stream: TcpStream) -> Result<Self, ConnectionError> {
        let task = Self::open(ConnectionKind::Tcp);
        task.install(Transport::stream(stream)?)?;
        Ok(task)
    }

    pub fn with_max_frame_size(mut self, limit: usize) -> Self {
        self.max_frame_size = limit;
        self
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Watch every state transition from now on.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Register a callback invoked on each subsequent transition. Callbacks run
    /// on the transitioning task and must not block.
    pub fn add_observer<F>(&self, observer: F)
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.observers.lock().push(Arc::new(observer));
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.transport.get()? {
            Transport::Stream { local, .. } | Transport::Datagram { local, .. } => Some(*local),
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self.transport.get()? {
            Transport::Stream { peer, .. } => Some(*peer),
            Transport::Datagram { peer, .. } => *peer.lock(),
        }
    }

    /// Connect to `addr`. For UDP this binds an ephemeral local port and fixes
    /// the peer.
    pub async fn connect(&self, addr: SocketAddr) -> Result<(), ConnectionError> {
        self.ensure_connecting()?;

        let opened = match self.kind {
            ConnectionKind::Tcp => match TcpStream::connect(addr).await {
                Ok(stream) => Transport::stream(stream),
                Err(e) => Err(e.into()),
            },
            ConnectionKind::Udp => match connect_udp(addr).await {
                Ok(socket) => Transport::datagram(socket, Some(addr)),
                Err(e) => Err(e.into()),
            },
        };

        match opened {
            Ok(transport) => self.install(transport),
            Err(e) => {
                self.disconnect(format!("connect to {} failed: {}", addr, e));
                Err(e)
            }
        }
    }

    /// Bind a UDP task to a local address. The first datagram received fixes
    /// the peer. Returns the bound address.
    pub async fn bind(&self, addr: SocketAddr) -> Result<SocketAddr, ConnectionError> {
        if self.kind != ConnectionKind::Udp {
            return Err(ConnectionError::Unsupported("bind"));
        }
        self.ensure_connecting()?;

        let transport = match UdpSocket::bind(addr).await {
            Ok(socket) => Transport::datagram(socket, None),
            Err(e) => Err(e.into()),
        };
        match transport {
            Ok(transport) => {
                let local = match &transport {
                    Transport::Datagram { local, .. } | Transport::Stream { local, .. } => *local,
                };
                self.install(transport)?;
                Ok(local)
            }
            Err(e) => {
                self.disconnect(format!("bind {} failed: {}", addr, e));
                Err(e)
            }
        }
    }

    /// Read exactly `n` bytes. For UDP, the next datagram must be exactly `n`
    /// bytes long.
    pub async fn read_exactly(&self, n: usize) -> Result<Bytes, ConnectionError> {
        let transport = self.transport()?;
        self.guarded(transport.read_exactly(n)).await
    }

    /// Write all of `data` or fail.
    pub async fn write_exactly(&self, data: &[u8]) -> Result<(), ConnectionError> {
        let transport = self.transport()?;
        self.guarded(transport.write_exactly(data)).await
    }

    /// Write one frame: length-prefixed on TCP, one datagram on UDP.
    pub async fn write_frame(&self, payload: &[u8]) -> Result<(), ConnectionError> {
        if payload.len() > self.max_frame_size {
            return Err(ConnectionError::FrameTooLarge {
                size: payload.len(),
                limit: self.max_frame_size,
            });
        }
        match self.kind {
            ConnectionKind::Tcp => {
                let mut buf = BytesMut::with_capacity(FRAME_PREFIX + payload.len());
                buf.put_u32(payload.len() as u32);
                buf.extend_from_slice(payload);
                self.write_exactly(&buf).await
            }
            ConnectionKind::Udp => self.write_exactly(payload).await,
        }
    }

    /// Read one frame written by `write_frame` on the other side.
    pub async fn read_frame(&self) -> Result<Bytes, ConnectionError> {
        match self.kind {
            ConnectionKind::Tcp => {
                let prefix = self.read_exactly(FRAME_PREFIX).await?;
                let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
                if len > self.max_frame_size {
                    let err = ConnectionError::FrameTooLarge {
                        size: len,
                        limit: self.max_frame_size,
                    };
                    self.disconnect(err.to_string());
                    return Err(err);
                }
                if len == 0 {
                    return Ok(Bytes::new());
                }
                self.read_exactly(len).await
            }
            ConnectionKind::Udp => {
                let transport = self.transport()?;
                self.guarded(transport.recv_datagram()).await
            }
        }
    }

    /// Close the connection. Idempotent; only the first reason is kept.
    pub async fn close(&self, reason: impl Into<String>) {
        if !self.disconnect(reason.into()) {
            return;
        }
        if let Some(Transport::Stream { writer, .. }) = self.transport.get() {
            let mut writer = writer.lock().await;
            let _ = writer.shutdown().await;
        }
    }

    /// Resolve once the task is disconnected, with the reason.
    pub async fn closed(&self) -> String {
        let mut rx = self.state.subscribe();
        loop {
            let state = rx.borrow_and_update().clone();
            if let ConnectionState::Disconnected(reason) = state {
                return reason;
            }
            if rx.changed().await.is_err() {
                return "connection task dropped".into();
            }
        }
    }

    fn transport(&self) -> Result<&Transport, ConnectionError> {
        match self.transport.get() {
            Some(t) => Ok(t),
            None => match self.state() {
                ConnectionState::Disconnected(reason) => Err(ConnectionError::Closed(reason)),
                _ => Err(ConnectionError::NotConnected),
            },
        }
    }

    fn ensure_connecting(&self) -> Result<(), ConnectionError> {
        match self.state() {
            ConnectionState::Connecting if !self.transport.initialized() => Ok(()),
            ConnectionState::Disconnected(reason) => Err(ConnectionError::Closed(reason)),
            _ => Err(ConnectionError::AlreadyOpen),
        }
    }

    fn install(&self, transport: Transport) -> Result<(), ConnectionError> {
        self.transport
            .set(transport)
            .map_err(|_| ConnectionError::AlreadyOpen)?;
        if !self.transition(ConnectionState::Connected) {
            // Closed while we were connecting.
            return Err(ConnectionError::Closed(match self.state() {
                ConnectionState::Disconnected(reason) => reason,
                _ => "connection closed".into(),
            }));
        }
        Ok(())
    }

    /// Run one I/O operation, racing it against disconnection. Failures are
    /// terminal for the task.
    async fn guarded<T>(
        &self,
        op: impl Future<Output = Result<T, ConnectionError>>,
    ) -> Result<T, ConnectionError> {
        if let ConnectionState::Disconnected(reason) = self.state() {
            return Err(ConnectionError::Closed(reason));
        }
        let result = tokio::select! {
            result = op => result,
            reason = self.closed() => Err(ConnectionError::Closed(reason)),
        };
        if let Err(e) = &result {
            self.disconnect(e.to_string());
        }
        result
    }

    fn disconnect(&self, reason: String) -> bool {
        self.transition(ConnectionState::Disconnected(reason))
    }

    /// Apply a transition unless the task is already disconnected. Returns
    /// whether the state changed.
    fn transition(&self, next: ConnectionState) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if current.is_disconnected() || *current == next {
                return false;
            }
            *current = next.clone();
            true
        });
        if changed {
            debug!("connection task ({:?}) -> {:?}", self.kind, next);
            let observers: Vec<Observer> = self.observers.lock().clone();
            for observer in observers {
                observer(&next);
            }
        }
        changed
    }
}

impl Drop for ConnectionTask {
    fn drop(&mut self) {
        self.disconnect("connection task dropped".into());
    }
}

async fn connect_udp(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let local: SocketAddr = if addr.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(addr).await?;
    Ok(socket)
}

fn tune_stream(stream: &TcpStream) {
    let sock_ref = socket2::SockRef::from(stream);
    if let Err(e) = sock_ref.set_nodelay(true) {
        warn!("failed to set TCP_NODELAY: {}", e);
    }
    if let Err(e) = sock_ref.set_send_buffer_size(SOCKET_BUF_SIZE) {
        debug!("failed to set send buffer: {}", e);
    }
    if let Err(e) = sock_ref.set_recv_buffer_size(SOCKET_BUF_SIZE) {
        debug!("failed to set recv buffer: {}", e);
    }
}

fn eof_as_closed(e: std::io::Error) -> ConnectionError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        ConnectionError::Closed("remote closed the connection".into())
    } else {
        ConnectionError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    async fn tcp_pair() -> (ConnectionTask, ConnectionTask) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = ConnectionTask::open(ConnectionKind::Tcp);
        let (connected, accepted) = tokio::join!(client.connect(addr), listener.accept());
        connected.unwrap();
        let server = ConnectionTask::from_tcp(accepted.unwrap().0).unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn tcp_exact_read_write() {
        let (client, server) = tcp_pair().await;
        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(server.state(), ConnectionState::Connected);

        client.write_exactly(b"hello world").await.unwrap();
        let first = server.read_exactly(5).await.unwrap();
        let rest = server.read_exactly(6).await.unwrap();
        assert_eq!(&first[..], b"hello");
        assert_eq!(&rest[..], b" world");
    }

    #[tokio::test]
    async fn tcp_frames() {
        let (client, server) = tcp_pair().await;
        client.write_frame(b"one").await.unwrap();
        client.write_frame(b"").await.unwrap();
        client.write_frame(b"three").await.unwrap();

        assert_eq!(&server.read_frame().await.unwrap()[..], b"one");
        assert!(server.read_frame().await.unwrap().is_empty());
        assert_eq!(&server.read_frame().await.unwrap()[..], b"three");
    }

    #[tokio::test]
    async fn short_read_fails_instead_of_returning_partial() {
        let (client, server) = tcp_pair().await;
        client.write_exactly(b"abc").await.unwrap();
        client.close("done").await;

        let err = server.read_exactly(10).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Closed(_)));
        assert!(server.state().is_disconnected());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (client, server) = tcp_pair().await;
        let server = server.with_max_frame_size(8);
        client.write_frame(&[0u8; 32]).await.unwrap();

        let err = server.read_frame().await.unwrap_err();
        assert!(matches!(err, ConnectionError::FrameTooLarge { size: 32, limit: 8 }));
        assert!(server.state().is_disconnected());
    }

    #[tokio::test]
    async fn disconnected_is_observed_once() {
        let (client, _server) = tcp_pair().await;
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        client.add_observer(move |state| {
            if state.is_disconnected() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        client.close("first").await;
        client.close("second").await;
        assert!(client.write_exactly(b"x").await.is_err());

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(client.state(), ConnectionState::Disconnected("first".into()));
    }

    #[tokio::test]
    async fn close_wakes_pending_read() {
        let (client, _server) = tcp_pair().await;
        let client = Arc::new(client);

        let reader = client.clone();
        let pending = tokio::spawn(async move { reader.read_exactly(4).await });
        tokio::task::yield_now().await;
        client.close("shutting down").await;

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, ConnectionError::Closed(reason) if reason == "shutting down"));
    }

    #[tokio::test]
    async fn failed_connect_is_terminal() {
        // Grab a free port and release it so nothing is listening there.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let task = ConnectionTask::open(ConnectionKind::Tcp);
        let mut rx = task.subscribe();

        assert!(task.connect(addr).await.is_err());
        assert!(rx.borrow_and_update().is_disconnected());
        assert!(matches!(task.connect(addr).await, Err(ConnectionError::Closed(_))));
    }

    #[tokio::test]
    async fn udp_bind_latches_first_peer() {
        let server = ConnectionTask::open(ConnectionKind::Udp);
        let addr = server.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert_eq!(server.state(), ConnectionState::Connected);
        assert!(matches!(
            server.write_exactly(b"too early").await,
            Err(ConnectionError::NotConnected)
        ));

        let client = ConnectionTask::open(ConnectionKind::Udp);
        client.connect(addr).await.unwrap();
        client.write_frame(b"ping").await.unwrap();

        assert_eq!(&server.read_frame().await.unwrap()[..], b"ping");
        assert_eq!(
            server.peer_addr().map(|a| a.port()),
            client.local_addr().map(|a| a.port())
        );

        server.write_exactly(b"pong").await.unwrap();
        assert_eq!(&client.read_exactly(4).await.unwrap()[..], b"pong");
    }

    #[tokio::test]
    async fn udp_size_mismatch_is_an_error() {
        let server = ConnectionTask::open(ConnectionKind::Udp);
        let addr = server.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let client = ConnectionTask::open(ConnectionKind::Udp);
        client.connect(addr).await.unwrap();

        client.write_exactly(b"abc").await.unwrap();
        let err = server.read_exactly(8).await.unwrap_err();
        assert!(matches!(err, ConnectionError::DatagramSize { expected: 8, actual: 3 }));
    }

    #[tokio::test]
    async fn bind_is_udp_only() {
        let task = ConnectionTask::open(ConnectionKind::Tcp);
        assert!(matches!(
            task.bind("127.0.0.1:0".parse().unwrap()).await,
            Err(ConnectionError::Unsupported(_))
        ));
    }
}
