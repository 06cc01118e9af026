//! pollux - cooperative single-threaded event loop.
//!
//! A unified control flow for applications that multiplex several network
//! endpoints (listening servers and outbound connections) plus periodic work
//! on one thread. The loop owns a timer store, a delayed-callback queue, an
//! OS poller, and a registry of pluggable event sources; the TCP connection
//! manager is the reference source.
//!
//! # Quick Start
//!
//! ```ignore
//! use pollux::{ConnectionEvent, ConnectionHandler, ConnectionId, EventLoop,
//!              ParamValue, TcpConnectionManager};
//! use std::time::Duration;
//!
//! struct Echo;
//!
//! impl ConnectionHandler for Echo {
//!     type Context = ();
//!
//!     fn initial_context(&mut self) {}
//!
//!     fn on_connection(
//!         &mut self,
//!         cm: &mut TcpConnectionManager<Self>,
//!         el: &mut EventLoop,
//!         id: ConnectionId,
//!         _context: &mut (),
//!         event: ConnectionEvent<'_>,
//!     ) {
//!         if let ConnectionEvent::Data { msg } = event {
//!             if let Ok(mut buf) = cm.alloc_network_buffer(id, msg.len()) {
//!                 buf.copy_from_slice(msg);
//!                 let _ = cm.send_with_connection(el, id, buf);
//!             }
//!         }
//!     }
//! }
//!
//! let mut el = EventLoop::new()?;
//! let mut cm = TcpConnectionManager::new("tcp", Echo);
//! cm.params_mut().set(0, "listen-port", ParamValue::U16(4840));
//! el.register_event_source(Box::new(cm))?;
//! el.start()?;
//! loop {
//!     el.run(Duration::from_millis(100))?;
//! }
//! ```
//!
//! # Threading
//!
//! Everything runs on the thread that calls [`EventLoop::run`]; a nested
//! `run` from inside a callback fails with [`Error::Internal`]. The only
//! operation that may be invoked from another thread is enqueueing a delayed
//! callback through a [`DelayedSender`], which wakes the poller.

pub mod buffer;
pub mod clock;
pub mod error;
pub mod event_loop;
pub mod params;
pub(crate) mod poller;
pub mod source;
pub mod tcp;
pub mod timer;

pub use buffer::NetBuf;
pub use clock::{Clock, SimClock, SystemClock};
pub use error::Error;
pub use event_loop::{DelayedCallback, DelayedSender, EventLoop, LoopState};
pub use params::{ParamMap, ParamValue, QualifiedKey};
pub use poller::{Readiness, SourceId};
pub use source::{EventSource, SourceKind, SourceState};
pub use tcp::{ConnectionEvent, ConnectionHandler, ConnectionId, TcpConnectionManager};
pub use timer::{TimerId, TimerPolicy};
