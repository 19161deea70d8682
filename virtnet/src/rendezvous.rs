use crossbeam_channel::Sender;
use lonet_types::Addr;

use crate::ops::VnetOps;

/// A single-use request carrying the real transport socket and a one-shot
/// response channel from an incoming dial to the listener it targets.
#[derive(Debug)]
pub(crate) struct DialReq<V: VnetOps> {
    pub from: Addr,
    pub netsk: V::RawStream,
    pub resp: Sender<Accept>,
}

/// The acceptor's successful response: the address the new connection was
/// accepted on, plus a one-shot channel the adapter uses to report whether
/// its post-accept handshake reply made it to the dialer.
#[derive(Debug)]
pub struct Accept {
    pub addr: Addr,
    pub(crate) ack: Sender<Option<anyhow::Error>>,
}

impl Accept {
    /// Reports that the post-accept reply reached the dialer.
    pub fn ack_ok(self) {
        let _ = self.ack.send(None);
    }

    /// Reports that the post-accept reply failed; the listener will drop the
    /// newly allocated socket and, if the dialer believed it had connected,
    /// close its raw stream.
    pub fn ack_err(self, err: anyhow::Error) {
        let _ = self.ack.send(Some(err));
    }
}
