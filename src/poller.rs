//! OS multiplexer abstraction.
//!
//! Wraps a mio `Poll` (epoll on Linux, kqueue on the BSDs/macOS). Descriptors
//! are registered under a token that packs the owning event source's registry
//! slot together with a source-local key, so the loop can route readiness to
//! the right source without knowing anything about connections. A reserved
//! token carries cross-thread wakeups.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use mio::{Events, Interest, Poll, Token, Waker};

/// Token reserved for the cross-thread waker.
const WAKE_TOKEN: Token = Token(usize::MAX);

/// Keys occupy the low half of a token, the source slot the high half.
const KEY_BITS: u32 = 32;
const KEY_MASK: usize = (1 << KEY_BITS) - 1;

/// Handle to an event source's slot in the loop registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceId(pub(crate) usize);

/// Readiness snapshot for one registered descriptor.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// The peer closed its half of the stream.
    pub closed: bool,
    pub error: bool,
}

/// One ready descriptor, routed by source slot and source-local key.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PollEvent {
    pub source: SourceId,
    pub key: usize,
    pub ready: Readiness,
}

pub(crate) struct Poller {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        Ok(Poller {
            poll,
            events: Events::with_capacity(1024),
            waker,
        })
    }

    pub(crate) fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    pub(crate) fn register(
        &self,
        target: &mut dyn mio::event::Source,
        source: SourceId,
        key: usize,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll
            .registry()
            .register(target, encode_token(source, key), interest)
    }

    pub(crate) fn reregister(
        &self,
        target: &mut dyn mio::event::Source,
        source: SourceId,
        key: usize,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll
            .registry()
            .reregister(target, encode_token(source, key), interest)
    }

    pub(crate) fn deregister(&self, target: &mut dyn mio::event::Source) -> io::Result<()> {
        self.poll.registry().deregister(target)
    }

    /// Block for at most `deadline` and append readiness triples to `out`.
    /// Waker events are consumed here; spurious wakeups surface as an empty
    /// batch.
    pub(crate) fn wait(
        &mut self,
        deadline: Option<Duration>,
        out: &mut Vec<PollEvent>,
    ) -> io::Result<()> {
        match self.poll.poll(&mut self.events, deadline) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }
        for event in self.events.iter() {
            let token = event.token();
            if token == WAKE_TOKEN {
                continue;
            }
            let (source, key) = decode_token(token);
            out.push(PollEvent {
                source,
                key,
                ready: Readiness {
                    readable: event.is_readable(),
                    writable: event.is_writable(),
                    closed: event.is_read_closed() || event.is_write_closed(),
                    error: event.is_error(),
                },
            });
        }
        Ok(())
    }
}

fn encode_token(source: SourceId, key: usize) -> Token {
    debug_assert!(key <= KEY_MASK);
    debug_assert!(source.0 < KEY_MASK);
    Token((source.0 << KEY_BITS) | (key & KEY_MASK))
}

fn decode_token(token: Token) -> (SourceId, usize) {
    (SourceId(token.0 >> KEY_BITS), token.0 & KEY_MASK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trip() {
        let token = encode_token(SourceId(3), 41);
        assert_eq!(decode_token(token), (SourceId(3), 41));

        let token = encode_token(SourceId(0), (1 << 30) + 7);
        assert_eq!(decode_token(token), (SourceId(0), (1 << 30) + 7));
    }

    #[test]
    fn wait_with_zero_deadline_returns_promptly() {
        let mut poller = Poller::new().unwrap();
        let mut out = Vec::new();
        poller.wait(Some(Duration::ZERO), &mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn waker_interrupts_a_long_wait() {
        let mut poller = Poller::new().unwrap();
        let waker = poller.waker();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.wake().unwrap();
        });
        let start = std::time::Instant::now();
        let mut out = Vec::new();
        poller.wait(Some(Duration::from_secs(10)), &mut out).unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(out.is_empty());
        handle.join().unwrap();
    }
}
