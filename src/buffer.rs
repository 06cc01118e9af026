//! Network buffer ownership.
//!
//! Receive payloads are handed to callbacks as borrowed `&[u8]` slices that
//! are only valid for the callback's duration. Send buffers are owned:
//! `NetBuf` is allocated through a connection manager, filled by the caller,
//! and transferred back to the manager on send (which always consumes it,
//! whether or not the payload could be written synchronously). Dropping a
//! `NetBuf` releases it.

use std::ops::{Deref, DerefMut};

use bytes::BytesMut;

use crate::tcp::ConnectionId;

/// An owned send buffer bound to the connection it was allocated for.
#[derive(Debug)]
pub struct NetBuf {
    conn: ConnectionId,
    pub(crate) data: BytesMut,
}

impl NetBuf {
    pub(crate) fn new(conn: ConnectionId, size: usize) -> Self {
        NetBuf {
            conn,
            data: BytesMut::zeroed(size),
        }
    }

    /// The connection this buffer was allocated for.
    pub fn connection(&self) -> ConnectionId {
        self.conn
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Deref for NetBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for NetBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}
