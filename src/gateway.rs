//! Gateway I/O multiplexer.
//!
//! A single actor owns every socket used to talk to gateways. The mapper
//! drivers never touch OS handles: they submit commands over a channel and
//! await the reply on a oneshot channel embedded in the command. The actor
//! services socket readiness, fires deadlines from a min-heap and routes
//! inbound bytes back to the operation that asked for them.
//!
//! Guarantees:
//!
//! - every command receives exactly one reply (success, error or timeout);
//! - operations on one socket complete in submission order, across sockets
//!   no order is implied;
//! - a deadline is authoritative: once an operation timed out, a late
//!   arrival is never delivered to it (for TCP the bytes are kept for the
//!   next read so no stream data is lost);
//! - [`NetworkGateway::kill`] closes all sockets and fails every
//!   outstanding operation with [`TransportError::Shutdown`].

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap, VecDeque},
    io,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use futures::{
    future::{abortable, AbortHandle, BoxFuture},
    stream::FuturesUnordered,
    FutureExt, StreamExt,
};
use tokio::{
    net::{TcpSocket, TcpStream, UdpSocket},
    sync::{mpsc, oneshot},
    time::Instant,
};
use tracing::{debug, info_span, trace, warn, Instrument};

use crate::{error::TransportError, util::CancelOnDrop};

/// Cap on bytes queued for sending on a single socket. A write that would
/// push past it is refused with [`TransportError::WouldBlock`].
pub const MAX_SEND_BUFFER: usize = 64 * 1024;

/// Capacity of the channel to communicate with the actor.
const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Identifies a socket owned by the multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
#[display("socket-{_0}")]
pub struct SocketHandle(u64);

/// Bytes delivered by a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// The received bytes. Empty on a TCP socket means the peer closed the
    /// connection.
    pub bytes: Bytes,
    /// Sender address, present for UDP sockets.
    pub from: Option<SocketAddr>,
}

type Reply<T> = oneshot::Sender<Result<T, TransportError>>;

#[derive(derive_more::Debug)]
enum Command {
    CreateUdp {
        local_addr: SocketAddr,
        #[debug("_")]
        reply: Reply<(SocketHandle, SocketAddr)>,
    },
    CreateTcp {
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        deadline: Instant,
        #[debug("_")]
        reply: Reply<SocketHandle>,
    },
    Write {
        handle: SocketHandle,
        /// Destination, required for UDP sockets, absent for TCP.
        to: Option<SocketAddr>,
        #[debug("{} bytes", bytes.len())]
        bytes: Bytes,
        #[debug("_")]
        reply: Reply<()>,
    },
    Read {
        handle: SocketHandle,
        max_bytes: usize,
        deadline: Instant,
        #[debug("_")]
        reply: Reply<Inbound>,
    },
    Close {
        handle: SocketHandle,
    },
    GetLocalIps {
        #[debug("_")]
        reply: oneshot::Sender<Vec<IpAddr>>,
    },
    Kill,
}

/// Handle to the multiplexer actor.
///
/// Cloneable; the actor stops when the last handle is dropped or
/// [`NetworkGateway::kill`] is called.
#[derive(Debug, Clone)]
pub struct NetworkGateway {
    tx: mpsc::Sender<Command>,
    _drop_guard: Arc<CancelOnDrop>,
}

impl NetworkGateway {
    /// Spawns the multiplexer actor.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let actor = Actor::new(rx);
        let task = tokio::spawn(
            async move { actor.run().await }.instrument(info_span!("portmap.gateway")),
        );
        NetworkGateway {
            tx,
            _drop_guard: Arc::new(CancelOnDrop::new("gateway actor", task.abort_handle())),
        }
    }

    /// Creates a UDP socket bound to `local_addr`, returning its handle and
    /// the resolved local address.
    pub async fn create_udp(
        &self,
        local_addr: SocketAddr,
    ) -> Result<(SocketHandle, SocketAddr), TransportError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::CreateUdp { local_addr, reply }, rx).await
    }

    /// Opens a TCP connection from `local_addr` to `remote_addr`. The handle
    /// is returned once the connection is established.
    pub async fn connect_tcp(
        &self,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        timeout: Duration,
    ) -> Result<SocketHandle, TransportError> {
        let (reply, rx) = oneshot::channel();
        let deadline = Instant::now() + timeout;
        self.command(
            Command::CreateTcp {
                local_addr,
                remote_addr,
                deadline,
                reply,
            },
            rx,
        )
        .await
    }

    /// Sends a datagram to `to` on a UDP socket. Resolves when the payload
    /// was handed to the OS.
    pub async fn send_to(
        &self,
        handle: SocketHandle,
        to: SocketAddr,
        bytes: Bytes,
    ) -> Result<(), TransportError> {
        let (reply, rx) = oneshot::channel();
        self.command(
            Command::Write {
                handle,
                to: Some(to),
                bytes,
                reply,
            },
            rx,
        )
        .await
    }

    /// Sends bytes on a TCP socket. Resolves when the payload is fully
    /// flushed, in submission order with other writes on the same handle.
    pub async fn send(&self, handle: SocketHandle, bytes: Bytes) -> Result<(), TransportError> {
        let (reply, rx) = oneshot::channel();
        self.command(
            Command::Write {
                handle,
                to: None,
                bytes,
                reply,
            },
            rx,
        )
        .await
    }

    /// Reads from a socket: the next datagram for UDP, the next chunk of at
    /// most `max_bytes` for TCP. An empty TCP read means the peer closed.
    pub async fn read(
        &self,
        handle: SocketHandle,
        max_bytes: usize,
        timeout: Duration,
    ) -> Result<Inbound, TransportError> {
        let (reply, rx) = oneshot::channel();
        let deadline = Instant::now() + timeout;
        self.command(
            Command::Read {
                handle,
                max_bytes,
                deadline,
                reply,
            },
            rx,
        )
        .await
    }

    /// Releases a socket. Operations still outstanding on it fail with
    /// [`TransportError::ConnectionReset`].
    pub fn close(&self, handle: SocketHandle) {
        if let Err(e) = self.tx.try_send(Command::Close { handle }) {
            trace!("failed to close {handle}: {e}");
        }
    }

    /// The local addresses usable as mapping sources.
    pub async fn local_ips(&self) -> Result<Vec<IpAddr>, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::GetLocalIps { reply })
            .await
            .map_err(|_| TransportError::Shutdown)?;
        rx.await.map_err(|_| TransportError::Shutdown)
    }

    /// Shuts the actor down, closing all sockets and failing every
    /// outstanding operation with [`TransportError::Shutdown`].
    pub fn kill(&self) {
        if let Err(e) = self.tx.try_send(Command::Kill) {
            trace!("failed to kill gateway: {e}");
        }
    }

    async fn command<T>(
        &self,
        command: Command,
        rx: oneshot::Receiver<Result<T, TransportError>>,
    ) -> Result<T, TransportError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| TransportError::Shutdown)?;
        rx.await.map_err(|_| TransportError::Shutdown)?
    }
}

type OpId = u64;

#[derive(Debug)]
enum Sock {
    Udp(Arc<UdpSocket>),
    Tcp(Arc<TcpStream>),
    /// Placeholder while the TCP connect is in flight. The handle has not
    /// been handed out yet.
    Connecting,
}

#[derive(derive_more::Debug)]
enum Pending {
    Connect {
        #[debug("_")]
        reply: Reply<SocketHandle>,
        handle: SocketHandle,
    },
    Read {
        #[debug("_")]
        reply: Reply<Inbound>,
        handle: SocketHandle,
    },
    Write {
        #[debug("_")]
        reply: Reply<()>,
        handle: SocketHandle,
        len: usize,
    },
}

#[derive(Debug)]
struct QueuedRead {
    op: OpId,
    max_bytes: usize,
}

#[derive(Debug)]
struct QueuedWrite {
    op: OpId,
    to: Option<SocketAddr>,
    bytes: Bytes,
}

#[derive(Debug)]
struct SocketState {
    sock: Sock,
    /// Reads waiting for their turn, oldest first.
    reads: VecDeque<QueuedRead>,
    /// The read currently owning the socket's receive side.
    read_in_flight: Option<(OpId, AbortHandle)>,
    /// Writes waiting for their turn, oldest first.
    writes: VecDeque<QueuedWrite>,
    /// The write currently owning the socket's send side.
    write_in_flight: Option<(OpId, AbortHandle)>,
    /// Bytes queued or in flight for sending.
    buffered: usize,
    /// Arrivals that raced their own timeout. Served to the next read so TCP
    /// stream data is never dropped.
    stash: VecDeque<Inbound>,
}

impl SocketState {
    fn new(sock: Sock) -> Self {
        SocketState {
            sock,
            reads: VecDeque::new(),
            read_in_flight: None,
            writes: VecDeque::new(),
            write_in_flight: None,
            buffered: 0,
            stash: VecDeque::new(),
        }
    }

    fn abort_in_flight(&mut self) {
        if let Some((_, abort)) = self.read_in_flight.take() {
            abort.abort();
        }
        if let Some((_, abort)) = self.write_in_flight.take() {
            abort.abort();
        }
    }
}

#[derive(Debug)]
enum Event {
    Connected {
        handle: SocketHandle,
        op: OpId,
        result: io::Result<TcpStream>,
    },
    ReadDone {
        handle: SocketHandle,
        op: OpId,
        result: io::Result<Inbound>,
    },
    WriteDone {
        handle: SocketHandle,
        op: OpId,
        result: io::Result<()>,
    },
}

struct Actor {
    rx: mpsc::Receiver<Command>,
    sockets: HashMap<SocketHandle, SocketState>,
    /// In-flight socket operations. An aborted operation resolves to `None`.
    io: FuturesUnordered<BoxFuture<'static, Option<Event>>>,
    /// Reply routes of operations that have not completed.
    pending: HashMap<OpId, Pending>,
    /// Deadlines of pending operations. Entries may be stale, the operation
    /// id is checked against [`Actor::pending`] when one fires.
    deadlines: BinaryHeap<Reverse<(Instant, OpId)>>,
    next_handle: u64,
    next_op: OpId,
}

impl Actor {
    fn new(rx: mpsc::Receiver<Command>) -> Self {
        Actor {
            rx,
            sockets: HashMap::new(),
            io: FuturesUnordered::new(),
            pending: HashMap::new(),
            deadlines: BinaryHeap::new(),
            next_handle: 0,
            next_op: 0,
        }
    }

    async fn run(mut self) {
        debug!("gateway starting");
        loop {
            let next_deadline = self.deadlines.peek().map(|Reverse((when, _))| *when);
            let deadline = async {
                match next_deadline {
                    Some(when) => tokio::time::sleep_until(when).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                msg = self.rx.recv() => {
                    trace!("tick: command {msg:?}");
                    match msg {
                        Some(Command::Kill) => break,
                        Some(command) => self.handle_command(command),
                        None => {
                            debug!("all gateway handles dropped, shutting down");
                            break;
                        }
                    }
                }
                Some(completed) = self.io.next(), if !self.io.is_empty() => {
                    trace!("tick: io {completed:?}");
                    if let Some(event) = completed {
                        self.handle_event(event);
                    }
                }
                _ = deadline => {
                    trace!("tick: deadline");
                    self.fire_deadlines();
                }
            }
        }
        self.shutdown();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::CreateUdp { local_addr, reply } => self.create_udp(local_addr, reply),
            Command::CreateTcp {
                local_addr,
                remote_addr,
                deadline,
                reply,
            } => self.create_tcp(local_addr, remote_addr, deadline, reply),
            Command::Write {
                handle,
                to,
                bytes,
                reply,
            } => self.queue_write(handle, to, bytes, reply),
            Command::Read {
                handle,
                max_bytes,
                deadline,
                reply,
            } => self.queue_read(handle, max_bytes, deadline, reply),
            Command::Close { handle } => self.close(handle),
            Command::GetLocalIps { reply } => {
                let _ = reply.send(local_ips());
            }
            Command::Kill => unreachable!("handled by the run loop"),
        }
    }

    fn new_handle(&mut self) -> SocketHandle {
        let handle = SocketHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    fn new_op(&mut self) -> OpId {
        let op = self.next_op;
        self.next_op += 1;
        op
    }

    fn create_udp(&mut self, local_addr: SocketAddr, reply: Reply<(SocketHandle, SocketAddr)>) {
        let bind = || -> io::Result<(UdpSocket, SocketAddr)> {
            let socket = std::net::UdpSocket::bind(local_addr)?;
            socket.set_nonblocking(true)?;
            if local_addr.is_ipv4() {
                // so SSDP searches cross the local segment only
                let _ = socket.set_multicast_ttl_v4(2);
                let _ = socket.set_broadcast(true);
            }
            let bound = socket.local_addr()?;
            Ok((UdpSocket::from_std(socket)?, bound))
        };
        match bind() {
            Ok((socket, bound)) => {
                let handle = self.new_handle();
                self.sockets
                    .insert(handle, SocketState::new(Sock::Udp(Arc::new(socket))));
                let _ = reply.send(Ok((handle, bound)));
            }
            Err(e) => {
                debug!("failed to bind udp socket on {local_addr}: {e}");
                let _ = reply.send(Err((&e).into()));
            }
        }
    }

    fn create_tcp(
        &mut self,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        deadline: Instant,
        reply: Reply<SocketHandle>,
    ) {
        let handle = self.new_handle();
        let op = self.new_op();
        self.sockets
            .insert(handle, SocketState::new(Sock::Connecting));
        self.pending.insert(op, Pending::Connect { reply, handle });
        self.deadlines.push(Reverse((deadline, op)));
        self.io.push(
            async move {
                let result = async {
                    let socket = if remote_addr.is_ipv4() {
                        TcpSocket::new_v4()?
                    } else {
                        TcpSocket::new_v6()?
                    };
                    socket.bind(local_addr)?;
                    socket.connect(remote_addr).await
                }
                .await;
                Some(Event::Connected { handle, op, result })
            }
            .boxed(),
        );
    }

    fn queue_write(
        &mut self,
        handle: SocketHandle,
        to: Option<SocketAddr>,
        bytes: Bytes,
        reply: Reply<()>,
    ) {
        let Some(state) = self.sockets.get_mut(&handle) else {
            let _ = reply.send(Err(TransportError::ConnectionReset));
            return;
        };
        if state.buffered + bytes.len() > MAX_SEND_BUFFER {
            let _ = reply.send(Err(TransportError::WouldBlock));
            return;
        }
        let op = self.next_op;
        self.next_op += 1;
        state.buffered += bytes.len();
        let len = bytes.len();
        state.writes.push_back(QueuedWrite { op, to, bytes });
        self.pending.insert(op, Pending::Write { reply, handle, len });
        self.start_write(handle);
    }

    fn start_write(&mut self, handle: SocketHandle) {
        let Some(state) = self.sockets.get_mut(&handle) else {
            return;
        };
        if state.write_in_flight.is_some() {
            return;
        }
        let Some(QueuedWrite { op, to, bytes }) = state.writes.pop_front() else {
            return;
        };
        let fut: BoxFuture<'static, Event> = match &state.sock {
            Sock::Udp(sock) => {
                let sock = Arc::clone(sock);
                async move {
                    let result = match to {
                        Some(dest) => sock.send_to(&bytes, dest).await.map(|_| ()),
                        None => Err(io::Error::new(
                            io::ErrorKind::InvalidInput,
                            "udp write without destination",
                        )),
                    };
                    Event::WriteDone { handle, op, result }
                }
                .boxed()
            }
            Sock::Tcp(sock) => {
                let sock = Arc::clone(sock);
                async move {
                    let mut written = 0;
                    let result = loop {
                        if written == bytes.len() {
                            break Ok(());
                        }
                        if let Err(e) = sock.writable().await {
                            break Err(e);
                        }
                        match sock.try_write(&bytes[written..]) {
                            Ok(n) => written += n,
                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                            Err(e) => break Err(e),
                        }
                    };
                    Event::WriteDone { handle, op, result }
                }
                .boxed()
            }
            Sock::Connecting => {
                // the handle is only handed out once connected
                warn!("write on connecting socket {handle}");
                if let Some(Pending::Write { reply, .. }) = self.pending.remove(&op) {
                    let _ = reply.send(Err(TransportError::ConnectionReset));
                }
                return;
            }
        };
        let (fut, abort) = abortable(fut);
        state.write_in_flight = Some((op, abort));
        self.io.push(async move { fut.await.ok() }.boxed());
    }

    fn queue_read(
        &mut self,
        handle: SocketHandle,
        max_bytes: usize,
        deadline: Instant,
        reply: Reply<Inbound>,
    ) {
        if self.sockets.get(&handle).is_none() {
            let _ = reply.send(Err(TransportError::ConnectionReset));
            return;
        };
        let op = self.new_op();
        self.pending.insert(op, Pending::Read { reply, handle });
        self.deadlines.push(Reverse((deadline, op)));
        let state = self.sockets.get_mut(&handle).expect("checked above");
        state.reads.push_back(QueuedRead { op, max_bytes });
        self.flush_stash(handle);
        self.start_read(handle);
    }

    fn start_read(&mut self, handle: SocketHandle) {
        let Some(state) = self.sockets.get_mut(&handle) else {
            return;
        };
        if state.read_in_flight.is_some() {
            return;
        }
        let Some(QueuedRead { op, max_bytes }) = state.reads.pop_front() else {
            return;
        };
        let fut: BoxFuture<'static, Event> = match &state.sock {
            Sock::Udp(sock) => {
                let sock = Arc::clone(sock);
                async move {
                    let mut buf = BytesMut::zeroed(max_bytes);
                    let result = sock.recv_from(&mut buf).await.map(|(n, from)| {
                        buf.truncate(n);
                        Inbound {
                            bytes: buf.freeze(),
                            from: Some(from),
                        }
                    });
                    Event::ReadDone { handle, op, result }
                }
                .boxed()
            }
            Sock::Tcp(sock) => {
                let sock = Arc::clone(sock);
                async move {
                    let result = loop {
                        if let Err(e) = sock.readable().await {
                            break Err(e);
                        }
                        let mut buf = BytesMut::zeroed(max_bytes);
                        match sock.try_read(&mut buf) {
                            Ok(n) => {
                                buf.truncate(n);
                                break Ok(Inbound {
                                    bytes: buf.freeze(),
                                    from: None,
                                });
                            }
                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                            Err(e) => break Err(e),
                        }
                    };
                    Event::ReadDone { handle, op, result }
                }
                .boxed()
            }
            Sock::Connecting => {
                warn!("read on connecting socket {handle}");
                if let Some(Pending::Read { reply, .. }) = self.pending.remove(&op) {
                    let _ = reply.send(Err(TransportError::ConnectionReset));
                }
                return;
            }
        };
        let (fut, abort) = abortable(fut);
        state.read_in_flight = Some((op, abort));
        self.io.push(async move { fut.await.ok() }.boxed());
    }

    /// Pairs stashed arrivals with queued reads.
    fn flush_stash(&mut self, handle: SocketHandle) {
        let Some(state) = self.sockets.get_mut(&handle) else {
            return;
        };
        while !state.stash.is_empty() && !state.reads.is_empty() {
            let QueuedRead { op, max_bytes } = state.reads.pop_front().expect("checked");
            let mut inbound = state.stash.pop_front().expect("checked");
            // only TCP byte streams are split, datagrams are delivered whole
            if inbound.from.is_none() && inbound.bytes.len() > max_bytes {
                let bytes = inbound.bytes.split_to(max_bytes);
                state.stash.push_front(inbound.clone());
                inbound = Inbound { bytes, from: None };
            }
            if let Some(Pending::Read { reply, .. }) = self.pending.remove(&op) {
                let _ = reply.send(Ok(inbound));
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Connected { handle, op, result } => self.on_connected(handle, op, result),
            Event::ReadDone { handle, op, result } => self.on_read_done(handle, op, result),
            Event::WriteDone { handle, op, result } => self.on_write_done(handle, op, result),
        }
    }

    fn on_connected(&mut self, handle: SocketHandle, op: OpId, result: io::Result<TcpStream>) {
        match self.pending.remove(&op) {
            Some(Pending::Connect { reply, .. }) => match result {
                Ok(stream) => {
                    if let Some(state) = self.sockets.get_mut(&handle) {
                        state.sock = Sock::Tcp(Arc::new(stream));
                        let _ = reply.send(Ok(handle));
                    } else {
                        // closed while connecting
                        let _ = reply.send(Err(TransportError::ConnectionReset));
                    }
                }
                Err(e) => {
                    debug!("connect failed for {handle}: {e}");
                    self.sockets.remove(&handle);
                    let _ = reply.send(Err((&e).into()));
                }
            },
            Some(other) => unreachable!("connect op resolved to {other:?}"),
            None => {
                // timed out, release the socket
                if matches!(
                    self.sockets.get(&handle).map(|state| &state.sock),
                    Some(Sock::Connecting)
                ) {
                    self.sockets.remove(&handle);
                }
            }
        }
    }

    fn on_read_done(&mut self, handle: SocketHandle, op: OpId, result: io::Result<Inbound>) {
        if let Some(state) = self.sockets.get_mut(&handle) {
            if state
                .read_in_flight
                .as_ref()
                .is_some_and(|(in_flight, _)| *in_flight == op)
            {
                state.read_in_flight = None;
            }
        }
        match self.pending.remove(&op) {
            Some(Pending::Read { reply, .. }) => {
                let _ = reply.send(result.map_err(|e| {
                    debug!("read on {handle} failed: {e}");
                    (&e).into()
                }));
            }
            Some(other) => unreachable!("read op resolved to {other:?}"),
            None => {
                // the read timed out. Keep the bytes for the next read so
                // stream data is not lost; the timed out operation never
                // sees them.
                if let (Ok(inbound), Some(state)) = (result, self.sockets.get_mut(&handle)) {
                    state.stash.push_back(inbound);
                    self.flush_stash(handle);
                }
            }
        }
        self.start_read(handle);
    }

    fn on_write_done(&mut self, handle: SocketHandle, op: OpId, result: io::Result<()>) {
        if let Some(state) = self.sockets.get_mut(&handle) {
            if state
                .write_in_flight
                .as_ref()
                .is_some_and(|(in_flight, _)| *in_flight == op)
            {
                state.write_in_flight = None;
            }
        }
        match self.pending.remove(&op) {
            Some(Pending::Write { reply, len, .. }) => {
                if let Some(state) = self.sockets.get_mut(&handle) {
                    state.buffered = state.buffered.saturating_sub(len);
                }
                let _ = reply.send(result.map_err(|e| {
                    debug!("write on {handle} failed: {e}");
                    (&e).into()
                }));
            }
            Some(other) => unreachable!("write op resolved to {other:?}"),
            None => {}
        }
        self.start_write(handle);
    }

    fn fire_deadlines(&mut self) {
        let now = Instant::now();
        while let Some(Reverse((when, op))) = self.deadlines.peek().copied() {
            if when > now {
                break;
            }
            self.deadlines.pop();
            match self.pending.remove(&op) {
                Some(Pending::Read { reply, handle }) => {
                    if let Some(state) = self.sockets.get_mut(&handle) {
                        state.reads.retain(|read| read.op != op);
                        // cancel the receive if it is the one in flight; a
                        // datagram not yet pulled out of the OS stays there
                        // for the next read
                        if state
                            .read_in_flight
                            .as_ref()
                            .is_some_and(|(in_flight, _)| *in_flight == op)
                        {
                            let (_, abort) = state.read_in_flight.take().expect("checked");
                            abort.abort();
                        }
                    }
                    let _ = reply.send(Err(TransportError::Timeout));
                    self.start_read(handle);
                }
                Some(Pending::Connect { reply, handle }) => {
                    // the in-flight connect future discards the stream on
                    // completion since the op is gone
                    if matches!(
                        self.sockets.get(&handle).map(|state| &state.sock),
                        Some(Sock::Connecting)
                    ) {
                        self.sockets.remove(&handle);
                    }
                    let _ = reply.send(Err(TransportError::Timeout));
                }
                Some(Pending::Write { reply, .. }) => {
                    let _ = reply.send(Err(TransportError::Timeout));
                }
                // completed before its deadline
                None => {}
            }
        }
    }

    fn close(&mut self, handle: SocketHandle) {
        let Some(mut state) = self.sockets.remove(&handle) else {
            return;
        };
        let in_flight = state
            .read_in_flight
            .as_ref()
            .map(|(op, _)| *op)
            .into_iter()
            .chain(state.write_in_flight.as_ref().map(|(op, _)| *op));
        let affected: Vec<OpId> = in_flight
            .chain(state.reads.iter().map(|read| read.op))
            .chain(state.writes.iter().map(|write| write.op))
            .collect();
        state.abort_in_flight();
        for op in affected {
            match self.pending.remove(&op) {
                Some(Pending::Read { reply, .. }) => {
                    let _ = reply.send(Err(TransportError::ConnectionReset));
                }
                Some(Pending::Write { reply, .. }) => {
                    let _ = reply.send(Err(TransportError::ConnectionReset));
                }
                _ => {}
            }
        }
    }

    fn shutdown(&mut self) {
        debug!("gateway shutting down");
        for (_, pending) in self.pending.drain() {
            match pending {
                Pending::Connect { reply, .. } => {
                    let _ = reply.send(Err(TransportError::Shutdown));
                }
                Pending::Read { reply, .. } => {
                    let _ = reply.send(Err(TransportError::Shutdown));
                }
                Pending::Write { reply, .. } => {
                    let _ = reply.send(Err(TransportError::Shutdown));
                }
            }
        }
        self.sockets.clear();
    }
}

/// Enumerates the local addresses usable as mapping sources.
fn local_ips() -> Vec<IpAddr> {
    let mut ips = Vec::new();
    for iface in default_net::get_interfaces() {
        for net in iface.ipv4 {
            let addr = IpAddr::V4(net.addr);
            if !net.addr.is_loopback() {
                ips.push(addr);
            }
        }
        for net in iface.ipv6 {
            let addr = IpAddr::V6(net.addr);
            if !net.addr.is_loopback() {
                ips.push(addr);
            }
        }
    }
    ips
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCALHOST: &str = "127.0.0.1:0";

    fn any_local() -> SocketAddr {
        LOCALHOST.parse().unwrap()
    }

    #[tokio::test]
    async fn test_udp_roundtrip() {
        let gateway = NetworkGateway::spawn();
        let (sender, _) = gateway.create_udp(any_local()).await.unwrap();
        let (receiver, receiver_addr) = gateway.create_udp(any_local()).await.unwrap();

        gateway
            .send_to(sender, receiver_addr, Bytes::from_static(b"ping"))
            .await
            .unwrap();
        let inbound = gateway
            .read(receiver, 1500, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(inbound.bytes.as_ref(), b"ping");
        let from = inbound.from.expect("udp reads carry the sender");
        assert_eq!(from.ip(), IpAddr::from([127, 0, 0, 1]));
    }

    #[tokio::test]
    async fn test_read_timeout_is_reported() {
        let gateway = NetworkGateway::spawn();
        let (handle, _) = gateway.create_udp(any_local()).await.unwrap();
        let result = gateway.read(handle, 1500, Duration::from_millis(20)).await;
        assert_eq!(result, Err(TransportError::Timeout));
    }

    #[tokio::test]
    async fn test_reads_deliver_in_arrival_order() {
        let gateway = NetworkGateway::spawn();
        let (sender, _) = gateway.create_udp(any_local()).await.unwrap();
        let (receiver, receiver_addr) = gateway.create_udp(any_local()).await.unwrap();

        gateway
            .send_to(sender, receiver_addr, Bytes::from_static(b"first"))
            .await
            .unwrap();
        gateway
            .send_to(sender, receiver_addr, Bytes::from_static(b"second"))
            .await
            .unwrap();

        let first = gateway
            .read(receiver, 1500, Duration::from_secs(5))
            .await
            .unwrap();
        let second = gateway
            .read(receiver, 1500, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(first.bytes.as_ref(), b"first");
        assert_eq!(second.bytes.as_ref(), b"second");
    }

    #[tokio::test]
    async fn test_oversized_write_would_block() {
        let gateway = NetworkGateway::spawn();
        let (handle, _) = gateway.create_udp(any_local()).await.unwrap();
        let oversized = Bytes::from(vec![0u8; MAX_SEND_BUFFER + 1]);
        let target = any_local();
        let result = gateway.send_to(handle, target, oversized).await;
        assert_eq!(result, Err(TransportError::WouldBlock));
    }

    #[tokio::test]
    async fn test_kill_fails_outstanding_operations() {
        let gateway = NetworkGateway::spawn();
        let (handle, _) = gateway.create_udp(any_local()).await.unwrap();

        let reader = {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.read(handle, 1500, Duration::from_secs(30)).await })
        };
        // let the read register before shutting down
        tokio::time::sleep(Duration::from_millis(50)).await;
        gateway.kill();
        assert_eq!(reader.await.unwrap(), Err(TransportError::Shutdown));
    }

    #[tokio::test]
    async fn test_close_fails_queued_operations() {
        let gateway = NetworkGateway::spawn();
        let (handle, _) = gateway.create_udp(any_local()).await.unwrap();

        let reader = {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.read(handle, 1500, Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        gateway.close(handle);
        assert_eq!(
            reader.await.unwrap(),
            Err(TransportError::ConnectionReset)
        );
        // the handle is gone for new operations as well
        let result = gateway.read(handle, 1500, Duration::from_millis(100)).await;
        assert_eq!(result, Err(TransportError::ConnectionReset));
    }

    #[tokio::test]
    async fn test_tcp_roundtrip() {
        let listener = tokio::net::TcpListener::bind(any_local()).await.unwrap();
        let server_addr = listener.local_addr().unwrap();
        let echo = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (mut reader, mut writer) = stream.split();
            tokio::io::copy(&mut reader, &mut writer).await.unwrap();
        });

        let gateway = NetworkGateway::spawn();
        let handle = gateway
            .connect_tcp(any_local(), server_addr, Duration::from_secs(5))
            .await
            .unwrap();
        gateway
            .send(handle, Bytes::from_static(b"hello over tcp"))
            .await
            .unwrap();
        let inbound = gateway
            .read(handle, 1500, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(inbound.bytes.as_ref(), b"hello over tcp");
        assert_eq!(inbound.from, None);

        gateway.close(handle);
        echo.abort();
    }

    #[tokio::test]
    async fn test_tcp_connect_refused() {
        let gateway = NetworkGateway::spawn();
        // bind a listener and drop it so the port is free but closed
        let closed_addr = {
            let listener = tokio::net::TcpListener::bind(any_local()).await.unwrap();
            listener.local_addr().unwrap()
        };
        let result = gateway
            .connect_tcp(any_local(), closed_addr, Duration::from_secs(5))
            .await;
        assert_eq!(result, Err(TransportError::ConnectionRefused));
    }

    #[tokio::test]
    async fn test_local_ips_answers() {
        let gateway = NetworkGateway::spawn();
        // contents depend on the host, the call itself must succeed
        gateway.local_ips().await.unwrap();
    }
}
