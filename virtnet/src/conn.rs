use std::sync::{Once, Weak};

use lonet_types::Addr;

use crate::down::Down;
use crate::host::Host;
use crate::ops::{RawStream, VnetOps};

/// One endpoint of a virtnet connection. Owns the underlying raw stream and
/// closes it on shutdown; reading and writing the stream itself is the
/// embedding adapter's job (`virtnet` never touches its bytes).
#[derive(Debug)]
pub struct Conn<V: VnetOps> {
    pub(crate) host: Weak<Host<V>>,
    pub(crate) port: u32,
    pub(crate) peer_addr: Addr,
    pub(crate) netsk: V::RawStream,
    pub(crate) down: Down,
    pub(crate) close_once: Once,
}

impl<V: VnetOps> Conn<V> {
    /// The underlying raw stream, for the adapter to read from or write to.
    pub fn raw(&self) -> &V::RawStream {
        &self.netsk
    }

    pub fn local_addr(&self) -> Addr {
        let host = self.host.upgrade().expect("conn outlived its host");
        Addr::new(host.network(), host.name().to_string(), self.port)
    }

    pub fn remote_addr(&self) -> &Addr {
        &self.peer_addr
    }

    pub(crate) fn shutdown(&self) {
        if !self.down.fire() {
            return;
        }
        self.netsk.close();
    }

    /// Closes the connection and unregisters it from its socket. Idempotent.
    pub fn close(&self) {
        self.shutdown();
        if !self.close_once_fire() {
            return;
        }
        if let Some(host) = self.host.upgrade() {
            host.release_conn(self.port);
        }
    }

    fn close_once_fire(&self) -> bool {
        let mut fired = false;
        self.close_once.call_once(|| fired = true);
        fired
    }
}
