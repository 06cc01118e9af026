//! TCP connection manager.
//!
//! An event source owning listening endpoints and live stream connections.
//! The poller's readiness events are translated into application callbacks:
//! one `Open` per connection (status good, empty payload), any number of
//! `Data` deliveries with a payload borrowed for the callback's duration,
//! and exactly one final `Closed`. Connections are addressed by a stable
//! numeric id distinct from the file descriptor, so ids stay valid through
//! descriptor reuse.

use std::any::Any;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::panic::AssertUnwindSafe;

use ahash::AHashMap;
use bytes::{Buf, BytesMut};
use mio::Interest;
use mio::net::{TcpListener, TcpStream};
use slab::Slab;
use socket2::{Domain, Protocol, Socket, Type};

use crate::buffer::NetBuf;
use crate::error::{Error, resource_error};
use crate::event_loop::{EventLoop, dispatch_protected};
use crate::params::{ParamMap, ParamValue};
use crate::poller::{Readiness, SourceId};
use crate::source::{EventSource, SourceKind, SourceState};

/// Listener keys live above this offset in the source-local key space so
/// they never collide with connection slots.
const LISTENER_KEY_OFFSET: usize = 1 << 30;

const LISTEN_BACKLOG: i32 = 1024;
const DEFAULT_RECV_BUFSIZE: u16 = 16384;

/// Stable identifier of a connection, unique for the manager's lifetime.
/// Announced to the application by the connection's first callback; never the
/// raw file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Construct from a raw value. Primarily useful for tests.
    pub fn from_raw(id: u64) -> Self {
        ConnectionId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// What a connection callback is being told.
pub enum ConnectionEvent<'a> {
    /// The connection is up: accepted on a listener (with `remote-hostname`
    /// in `params`) or an outbound connect that completed (empty params).
    Open { params: &'a ParamMap },
    /// Payload received. The slice is borrowed and only valid for the
    /// duration of the callback.
    Data { msg: &'a [u8] },
    /// The single final callback for this connection; no further callbacks
    /// fire for its id. `status` is `ConnectionClosed` (peer or local close)
    /// or `ConnectionRejected` (outbound connect failed).
    Closed { status: Error },
}

/// Application-side connection callback.
///
/// The handler owns a per-connection context of its choosing; a context
/// written through the `&mut` reference is observed by the next and all
/// subsequent callbacks for that connection.
pub trait ConnectionHandler: Sized + 'static {
    type Context: 'static;

    /// Context attached to connections accepted on a listener, before their
    /// first callback.
    fn initial_context(&mut self) -> Self::Context;

    fn on_connection(
        &mut self,
        cm: &mut TcpConnectionManager<Self>,
        el: &mut EventLoop,
        id: ConnectionId,
        context: &mut Self::Context,
        event: ConnectionEvent<'_>,
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnPhase {
    Connecting,
    Established,
    Closing,
}

struct ConnRec<C> {
    id: u64,
    stream: TcpStream,
    phase: ConnPhase,
    /// Taken out while a callback runs for this connection.
    context: Option<C>,
    remote_hostname: String,
    /// Unsent tail of partially written sends, flushed on write readiness.
    pending: VecDeque<BytesMut>,
    /// Status delivered by the final callback.
    close_status: Error,
}

struct ListenerRec {
    listener: TcpListener,
}

/// Event source managing TCP listeners and stream connections.
///
/// Configuration parameters, read at start (namespace 0): `listen-port`
/// (u16), `listen-hostnames` (string or string array, default all
/// interfaces), `recv-bufsize` (u16, default 16384), `keepalive` (bool).
/// Unknown parameters are ignored.
pub struct TcpConnectionManager<H: ConnectionHandler> {
    name: String,
    state: SourceState,
    source_id: Option<SourceId>,
    params: ParamMap,
    /// Taken out while a callback runs.
    handler: Option<H>,
    recv_bufsize: usize,
    keepalive: bool,
    /// Receive staging buffer, sized `recv-bufsize` at start. Taken out while
    /// a `Data` callback borrows from it.
    recv_scratch: Vec<u8>,
    listeners: Slab<ListenerRec>,
    conns: Slab<ConnRec<H::Context>>,
    /// Stable id to slab slot.
    ids: AHashMap<u64, usize>,
    next_id: u64,
}

impl<H: ConnectionHandler> TcpConnectionManager<H> {
    pub fn new(name: &str, handler: H) -> Self {
        TcpConnectionManager {
            name: name.to_string(),
            state: SourceState::Fresh,
            source_id: None,
            params: ParamMap::new(),
            handler: Some(handler),
            recv_bufsize: DEFAULT_RECV_BUFSIZE as usize,
            keepalive: false,
            recv_scratch: Vec::new(),
            listeners: Slab::new(),
            conns: Slab::new(),
            ids: AHashMap::new(),
            next_id: 1,
        }
    }

    pub fn params(&self) -> &ParamMap {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut ParamMap {
        &mut self.params
    }

    /// Live connections (listeners excluded).
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    /// Remote hostname captured when the connection was opened.
    pub fn remote_hostname(&self, id: ConnectionId) -> Option<&str> {
        let slot = *self.ids.get(&id.0)?;
        self.conns.get(slot).map(|r| r.remote_hostname.as_str())
    }

    /// Asynchronously open an outbound connection. Required parameters
    /// (namespace 0): `hostname`, `port`. Additional parameters are ignored.
    ///
    /// Returns `Ok(())` iff the kernel accepted the request; the connection
    /// id is announced by the `Open` callback once the connect completes, or
    /// a single `Closed { ConnectionRejected }` fires if it fails.
    pub fn open_connection(
        &mut self,
        el: &mut EventLoop,
        params: &ParamMap,
        context: H::Context,
    ) -> Result<(), Error> {
        if self.state != SourceState::Started {
            return Err(Error::InvalidState);
        }
        let Some(sid) = self.source_id else {
            return Err(Error::InvalidState);
        };
        let hostname = params
            .get_str(0, "hostname")
            .ok_or(Error::InvalidArgument("hostname parameter is required"))?;
        let port = params
            .get_u16(0, "port")
            .ok_or(Error::InvalidArgument("port parameter is required"))?;

        let addr = match (hostname, port).to_socket_addrs() {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => addr,
                None => {
                    tracing::warn!(host = %hostname, "hostname resolved to no addresses");
                    return Err(Error::ConnectionRejected);
                }
            },
            Err(e) => {
                tracing::warn!(host = %hostname, error = %e, "hostname resolution failed");
                return Err(Error::ConnectionRejected);
            }
        };

        let socket = new_stream_socket(addr).map_err(|e| {
            tracing::warn!(error = %e, "failed to create outbound socket");
            resource_error(&e)
        })?;
        if self.keepalive {
            let _ = socket.set_keepalive(true);
        }
        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(e) if connect_in_progress(&e) => {}
            Err(e) => {
                tracing::warn!(%addr, error = %e, "connect rejected at socket layer");
                return Err(Error::ConnectionRejected);
            }
        }

        let mut stream = TcpStream::from_std(socket.into());
        let _ = stream.set_nodelay(true);

        let id = self.next_id;
        let entry = self.conns.vacant_entry();
        let slot = entry.key();
        el.poller()
            .register(&mut stream, sid, slot, Interest::WRITABLE)
            .map_err(|e| {
                tracing::warn!(error = %e, "failed to register outbound connection");
                resource_error(&e)
            })?;
        entry.insert(ConnRec {
            id,
            stream,
            phase: ConnPhase::Connecting,
            context: Some(context),
            remote_hostname: hostname.to_string(),
            pending: VecDeque::new(),
            close_status: Error::ConnectionClosed,
        });
        self.ids.insert(id, slot);
        self.next_id += 1;
        Ok(())
    }

    /// Allocate a send buffer for `id`.
    pub fn alloc_network_buffer(
        &mut self,
        id: ConnectionId,
        size: usize,
    ) -> Result<NetBuf, Error> {
        let Some(&slot) = self.ids.get(&id.0) else {
            return Err(Error::NotFound);
        };
        match self.conns.get(slot).map(|r| r.phase) {
            Some(ConnPhase::Closing) => Err(Error::ConnectionClosed),
            Some(_) => Ok(NetBuf::new(id, size)),
            None => Err(Error::NotFound),
        }
    }

    /// Release a buffer without sending it.
    pub fn free_network_buffer(&mut self, buf: NetBuf) {
        drop(buf);
    }

    /// Asynchronously send `buf` on `id`. The buffer must have been allocated
    /// for this id; its memory is released by the manager in every outcome.
    /// A partial write retains the tail and flushes it on write readiness; a
    /// fatal socket error closes the connection and is surfaced as
    /// `ConnectionClosed`.
    pub fn send_with_connection(
        &mut self,
        el: &mut EventLoop,
        id: ConnectionId,
        buf: NetBuf,
    ) -> Result<(), Error> {
        if buf.connection() != id {
            debug_assert!(false, "buffer allocated for a different connection");
            return Err(Error::InvalidArgument(
                "buffer belongs to a different connection",
            ));
        }
        let Some(&slot) = self.ids.get(&id.0) else {
            return Err(Error::NotFound);
        };
        let mut data = buf.data;
        {
            let Some(rec) = self.conns.get_mut(slot) else {
                return Err(Error::NotFound);
            };
            match rec.phase {
                ConnPhase::Closing => return Err(Error::ConnectionClosed),
                ConnPhase::Connecting => {
                    // Queued until the connect completes.
                    rec.pending.push_back(data);
                    return Ok(());
                }
                ConnPhase::Established => {}
            }
            if !rec.pending.is_empty() {
                // Earlier sends are still draining; keep ordering.
                rec.pending.push_back(data);
                return Ok(());
            }
            loop {
                if data.is_empty() {
                    return Ok(());
                }
                match rec.stream.write(&data[..]) {
                    Ok(0) => break,
                    Ok(n) => data.advance(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        rec.pending.push_back(data);
                        self.update_interest(el, slot);
                        return Ok(());
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::debug!(error = %e, "send failed, closing connection");
                        break;
                    }
                }
            }
        }
        self.initiate_close(slot, Error::ConnectionClosed);
        Err(Error::ConnectionClosed)
    }

    /// Asynchronously close a connection: half-close the write side, drain
    /// what can be drained, and fire the final callback from a following
    /// dispatch cycle. A second close of the same id fails with
    /// `InvalidState`; an unknown id with `NotFound`.
    pub fn close_connection(&mut self, id: ConnectionId) -> Result<(), Error> {
        let Some(&slot) = self.ids.get(&id.0) else {
            return Err(Error::NotFound);
        };
        match self.conns.get(slot).map(|r| r.phase) {
            Some(ConnPhase::Closing) => Err(Error::InvalidState),
            Some(_) => {
                self.initiate_close(slot, Error::ConnectionClosed);
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    fn bind_endpoint(
        &mut self,
        el: &mut EventLoop,
        sid: SourceId,
        addr: SocketAddr,
    ) -> io::Result<()> {
        let socket = new_stream_socket(addr)?;
        socket.set_reuse_address(true)?;
        if addr.is_ipv6() {
            // Bind v4 and v6 wildcards independently.
            let _ = socket.set_only_v6(true);
        }
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        let mut listener = TcpListener::from_std(socket.into());
        let entry = self.listeners.vacant_entry();
        let key = entry.key();
        el.poller().register(
            &mut listener,
            sid,
            LISTENER_KEY_OFFSET + key,
            Interest::READABLE,
        )?;
        entry.insert(ListenerRec { listener });
        Ok(())
    }

    fn accept_pending(&mut self, el: &mut EventLoop, lslot: usize) {
        let Some(sid) = self.source_id else { return };
        loop {
            let accepted = match self.listeners.get(lslot) {
                Some(l) => l.listener.accept(),
                None => return,
            };
            match accepted {
                Ok((mut stream, addr)) => {
                    let _ = stream.set_nodelay(true);
                    if self.keepalive {
                        enable_keepalive(&stream);
                    }
                    let Some(handler) = self.handler.as_mut() else {
                        return;
                    };
                    let context = handler.initial_context();
                    let id = self.next_id;
                    let entry = self.conns.vacant_entry();
                    let slot = entry.key();
                    if let Err(e) =
                        el.poller()
                            .register(&mut stream, sid, slot, Interest::READABLE)
                    {
                        tracing::warn!(error = %e, "failed to register accepted connection");
                        continue;
                    }
                    // Numeric form; reverse resolution would block the loop.
                    let remote = addr.ip().to_string();
                    entry.insert(ConnRec {
                        id,
                        stream,
                        phase: ConnPhase::Established,
                        context: Some(context),
                        remote_hostname: remote.clone(),
                        pending: VecDeque::new(),
                        close_status: Error::ConnectionClosed,
                    });
                    self.ids.insert(id, slot);
                    self.next_id += 1;

                    let mut params = ParamMap::new();
                    params.set(0, "remote-hostname", ParamValue::Str(remote));
                    self.fire_event(el, slot, ConnectionEvent::Open { params: &params });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // EMFILE and friends: log and keep the listener; accept
                    // again on the next readiness.
                    tracing::warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn handle_connect_ready(&mut self, el: &mut EventLoop, slot: usize) {
        enum Probe {
            Failed,
            Pending,
            Ready,
        }
        let probe = {
            let Some(rec) = self.conns.get_mut(slot) else { return };
            match rec.stream.take_error() {
                Ok(Some(e)) => {
                    tracing::debug!(error = %e, "outbound connect failed");
                    Probe::Failed
                }
                Err(e) => {
                    tracing::debug!(error = %e, "outbound connect failed");
                    Probe::Failed
                }
                Ok(None) => match rec.stream.peer_addr() {
                    Ok(_) => Probe::Ready,
                    Err(e)
                        if e.kind() == io::ErrorKind::NotConnected
                            || e.raw_os_error() == Some(libc::EINPROGRESS) =>
                    {
                        Probe::Pending
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "outbound connect failed");
                        Probe::Failed
                    }
                },
            }
        };
        match probe {
            Probe::Pending => {}
            Probe::Failed => {
                if let Some(rec) = self.conns.get_mut(slot) {
                    rec.phase = ConnPhase::Closing;
                    rec.close_status = Error::ConnectionRejected;
                }
            }
            Probe::Ready => {
                if let Some(rec) = self.conns.get_mut(slot) {
                    rec.phase = ConnPhase::Established;
                }
                self.update_interest(el, slot);
                let params = ParamMap::new();
                self.fire_event(el, slot, ConnectionEvent::Open { params: &params });
                // Flush sends queued while connecting.
                match self.flush_pending(slot) {
                    Ok(true) => {}
                    Ok(false) => self.update_interest(el, slot),
                    Err(e) => {
                        tracing::debug!(error = %e, "flush failed after connect");
                        self.initiate_close(slot, Error::ConnectionClosed);
                    }
                }
            }
        }
    }

    fn handle_writable(&mut self, el: &mut EventLoop, slot: usize) {
        match self.flush_pending(slot) {
            Ok(true) => self.update_interest(el, slot),
            Ok(false) => {}
            Err(e) => {
                tracing::debug!(error = %e, "send flush failed, closing connection");
                self.initiate_close(slot, Error::ConnectionClosed);
            }
        }
    }

    fn handle_readable(&mut self, el: &mut EventLoop, slot: usize) {
        // The staging buffer is taken out so the Data callback can borrow it
        // while the manager itself is passed mutably.
        let mut scratch = std::mem::take(&mut self.recv_scratch);
        loop {
            let Some(rec) = self.conns.get_mut(slot) else { break };
            if rec.phase != ConnPhase::Established {
                break;
            }
            match rec.stream.read(&mut scratch) {
                Ok(0) => {
                    // Peer closed.
                    self.initiate_close(slot, Error::ConnectionClosed);
                    break;
                }
                Ok(n) => {
                    self.fire_event(el, slot, ConnectionEvent::Data { msg: &scratch[..n] });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "recv failed, closing connection");
                    self.initiate_close(slot, Error::ConnectionClosed);
                    break;
                }
            }
        }
        self.recv_scratch = scratch;
    }

    /// Transition a connection into Closing. The pending queue is drained as
    /// far as the socket allows, then the write half is shut down; the final
    /// callback and record removal happen in `on_cycle`.
    fn initiate_close(&mut self, slot: usize, status: Error) {
        let _ = self.flush_pending(slot);
        let Some(rec) = self.conns.get_mut(slot) else { return };
        if rec.phase == ConnPhase::Closing {
            return;
        }
        rec.phase = ConnPhase::Closing;
        rec.close_status = status;
        rec.pending.clear();
        let _ = rec.stream.shutdown(Shutdown::Write);
    }

    /// Write out the pending queue. `Ok(true)` when fully drained.
    fn flush_pending(&mut self, slot: usize) -> io::Result<bool> {
        loop {
            let Some(rec) = self.conns.get_mut(slot) else {
                return Ok(true);
            };
            let Some(front) = rec.pending.front_mut() else {
                return Ok(true);
            };
            loop {
                if front.is_empty() {
                    break;
                }
                match rec.stream.write(&front[..]) {
                    Ok(0) => {
                        return Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "write returned zero",
                        ));
                    }
                    Ok(n) => front.advance(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
            rec.pending.pop_front();
        }
    }

    fn update_interest(&mut self, el: &mut EventLoop, slot: usize) {
        let Some(sid) = self.source_id else { return };
        let Some(rec) = self.conns.get_mut(slot) else { return };
        let interest = match rec.phase {
            ConnPhase::Connecting => Interest::WRITABLE,
            _ if rec.pending.is_empty() => Interest::READABLE,
            _ => Interest::READABLE | Interest::WRITABLE,
        };
        if let Err(e) = el.poller().reregister(&mut rec.stream, sid, slot, interest) {
            tracing::debug!(error = %e, "failed to update poller interest");
        }
    }

    /// Invoke the application callback for one connection. The handler and
    /// the connection's context are taken out for the duration of the call,
    /// so the callback may use every manager and loop operation.
    fn fire_event(&mut self, el: &mut EventLoop, slot: usize, event: ConnectionEvent<'_>) {
        let Some(mut handler) = self.handler.take() else {
            return;
        };
        let (id, mut context) = match self.conns.get_mut(slot) {
            Some(rec) => (ConnectionId(rec.id), rec.context.take()),
            None => {
                self.handler = Some(handler);
                return;
            }
        };
        if let Some(ctx) = context.as_mut() {
            dispatch_protected(
                "connection callback",
                AssertUnwindSafe(|| handler.on_connection(self, el, id, ctx, event)),
            );
        }
        if let Some(rec) = self.conns.get_mut(slot)
            && rec.id == id.0
            && rec.context.is_none()
        {
            rec.context = context;
        }
        self.handler = Some(handler);
    }
}

impl<H: ConnectionHandler> EventSource for TcpConnectionManager<H> {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::ConnectionManager
    }

    fn state(&self) -> SourceState {
        self.state
    }

    fn start(&mut self, el: &mut EventLoop, id: SourceId) -> Result<(), Error> {
        if !matches!(self.state, SourceState::Fresh | SourceState::Stopped) {
            return Err(Error::InvalidState);
        }
        self.state = SourceState::Starting;
        self.source_id = Some(id);

        let bufsize = self
            .params
            .get_u16(0, "recv-bufsize")
            .unwrap_or(DEFAULT_RECV_BUFSIZE);
        if bufsize == 0 {
            self.state = SourceState::Stopped;
            return Err(Error::InvalidArgument("recv-bufsize must be positive"));
        }
        self.recv_bufsize = bufsize as usize;
        self.recv_scratch = vec![0u8; self.recv_bufsize];
        self.keepalive = self.params.get_bool(0, "keepalive").unwrap_or(false);

        if let Some(port) = self.params.get_u16(0, "listen-port") {
            let hostnames: Vec<String> = self
                .params
                .get_str_array(0, "listen-hostnames")
                .map(|hs| hs.iter().map(|h| h.to_string()).collect())
                .unwrap_or_else(|| vec!["0.0.0.0".to_string(), "::".to_string()]);

            let mut bound = 0usize;
            let mut first_err = None;
            for host in &hostnames {
                let addrs = match (host.as_str(), port).to_socket_addrs() {
                    Ok(addrs) => addrs,
                    Err(e) => {
                        // A listen hostname comes from the config map, so a
                        // resolution failure is an argument error, unlike an
                        // outbound target.
                        tracing::warn!(host = %host, error = %e, "listen hostname did not resolve");
                        first_err
                            .get_or_insert(Error::InvalidArgument("listen hostname did not resolve"));
                        continue;
                    }
                };
                for addr in addrs {
                    match self.bind_endpoint(el, id, addr) {
                        Ok(()) => bound += 1,
                        Err(e) => {
                            // Partial failure keeps the source running on the
                            // endpoints that did bind.
                            tracing::warn!(%addr, error = %e, "failed to bind listening endpoint");
                            first_err.get_or_insert(resource_error(&e));
                        }
                    }
                }
            }
            if bound == 0 {
                self.state = SourceState::Stopped;
                return Err(first_err.unwrap_or(Error::OutOfResources));
            }
            tracing::debug!(name = %self.name, port, endpoints = bound, "listening");
        }

        self.state = SourceState::Started;
        Ok(())
    }

    fn stop(&mut self, el: &mut EventLoop) {
        match self.state {
            SourceState::Fresh => {
                self.state = SourceState::Stopped;
                return;
            }
            SourceState::Starting | SourceState::Started => {}
            SourceState::Stopping | SourceState::Stopped => return,
        }
        // Listeners first, so no further connections are accepted.
        for mut rec in self.listeners.drain() {
            let _ = el.poller().deregister(&mut rec.listener);
        }
        let slots: Vec<usize> = self.conns.iter().map(|(slot, _)| slot).collect();
        for slot in slots {
            self.initiate_close(slot, Error::ConnectionClosed);
        }
        self.state = if self.conns.is_empty() {
            SourceState::Stopped
        } else {
            SourceState::Stopping
        };
        tracing::debug!(name = %self.name, state = ?self.state, "connection manager stop requested");
    }

    fn on_poll_event(&mut self, el: &mut EventLoop, key: usize, ready: Readiness) {
        if key >= LISTENER_KEY_OFFSET {
            self.accept_pending(el, key - LISTENER_KEY_OFFSET);
            return;
        }
        let Some(phase) = self.conns.get(key).map(|r| r.phase) else {
            return;
        };
        match phase {
            ConnPhase::Connecting => self.handle_connect_ready(el, key),
            ConnPhase::Established => {
                if ready.writable {
                    self.handle_writable(el, key);
                }
                if ready.readable || ready.closed {
                    self.handle_readable(el, key);
                }
            }
            ConnPhase::Closing => {}
        }
    }

    fn on_cycle(&mut self, el: &mut EventLoop) {
        let closing: Vec<usize> = self
            .conns
            .iter()
            .filter(|(_, rec)| rec.phase == ConnPhase::Closing)
            .map(|(slot, _)| slot)
            .collect();
        for slot in closing {
            if let Some(rec) = self.conns.get_mut(slot) {
                let _ = el.poller().deregister(&mut rec.stream);
            }
            let Some(status) = self.conns.get(slot).map(|r| r.close_status) else {
                continue;
            };
            // The record outlives the callback; sending from inside it fails
            // with ConnectionClosed, and a second close with InvalidState.
            self.fire_event(el, slot, ConnectionEvent::Closed { status });
            if let Some(rec) = self.conns.try_remove(slot) {
                self.ids.remove(&rec.id);
            }
        }
        if self.state == SourceState::Stopping && self.conns.is_empty() {
            self.state = SourceState::Stopped;
            tracing::debug!(name = %self.name, "connection manager stopped");
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn new_stream_socket(addr: SocketAddr) -> io::Result<Socket> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

fn connect_in_progress(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc::EINPROGRESS)
}

#[cfg(unix)]
fn enable_keepalive(stream: &TcpStream) {
    use std::os::fd::AsRawFd;
    let optval: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

#[cfg(not(unix))]
fn enable_keepalive(_stream: &TcpStream) {}
