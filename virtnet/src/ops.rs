use lonet_types::Addr;
use lonet_registry::Registry;

/// The hooks a concrete transport plugs into the virtnet core, mirroring the
/// reference implementation's `_vnet_newhost`/`_vnet_dial`/`_vnet_close`
/// methods on `VirtSubNetwork`. `virtnet` never constructs, reads, or writes
/// bytes on [`VnetOps::RawStream`] itself — it only holds it between accept
/// and the caller taking ownership of the resulting `Conn`.
pub trait VnetOps: Send + Sync + 'static {
    /// The real transport's connected stream type.
    type RawStream: RawStream;

    /// Announces `hostname` as reachable through this subnetwork so peers'
    /// `dial` calls can resolve it. Called with the host not yet present in
    /// `hostmap` — see the dependency-order note in `SubNetwork::new_host`.
    fn vnet_newhost(&self, hostname: &str, registry: &Registry) -> anyhow::Result<()>;

    /// Opens a raw stream to `dst` at `dst_osladdr` and runs whatever
    /// handshake establishes the accepted address on the other end.
    fn vnet_dial(
        &self,
        src: &Addr,
        dst: &Addr,
        dst_osladdr: &str,
    ) -> anyhow::Result<(Self::RawStream, Addr)>;

    /// Tears down the real listener and joins the serve loop. Called once,
    /// after every host has already been shut down.
    fn vnet_close(&self);
}

/// An ordered, reliable, bidirectional byte stream virtnet can hold and
/// close but never itself reads from or writes to.
pub trait RawStream: Send + Sync + 'static {
    fn close(&self);
}
