//! lonet: a virtual TCP-like network simulated on top of the host's real
//! loopback interface.
//!
//! [`join`] joins or creates a named network and returns a [`SubNetwork`]
//! handle; from there, [`SubNetwork::new_host`], [`Host::listen`] and
//! [`Host::dial`] behave like their real-socket counterparts, addressed as
//! `host:port` within the joined network instead of `ip:port` on the LAN.
//! See [`virtnet`] for the full state machine and [`lonet_registry`] for the
//! shared hostname registry this crate layers real loopback TCP underneath.

mod adapter;
pub mod proto;
pub mod transport;

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use lonet_registry::Registry;

pub use adapter::LonetAdapter;
pub use transport::Conn;
pub use virtnet::{Accept, Addr, Host, Listener, RawStream, RegistryError, SubNetwork, VirtnetError, VnetOps};

/// A joined lonet subnetwork: a [`virtnet::SubNetwork`] concretely wired to
/// real loopback TCP via [`LonetAdapter`].
pub type Subnetwork = Arc<SubNetwork<LonetAdapter>>;

/// A lonet connection, instantiated over the real `Conn` raw stream.
pub type LonetConn = virtnet::Conn<LonetAdapter>;

const LONET_DIR_MODE: u32 = 0o1777; // rwxrwxrwt: world-writable + sticky.
const NETWORK_DIR_MODE: u32 = 0o700;

/// Joins or creates the lonet network named `network`. An empty name creates
/// a fresh network with a generated name (its temp-directory basename).
pub fn join(network: &str) -> Result<Subnetwork> {
    join_inner(network).with_context(|| format!("lonet: join {}", proto::qq(network)))
}

fn join_inner(network: &str) -> Result<Subnetwork> {
    let lonet_dir = std::env::temp_dir().join("lonet");
    mkdir_p(&lonet_dir, LONET_DIR_MODE)?;

    let (netdir, network) = if network.is_empty() {
        let dir = tempfile::Builder::new().tempdir_in(&lonet_dir)?.into_path();
        let name = dir
            .file_name()
            .expect("freshly created tempdir has a name")
            .to_string_lossy()
            .into_owned();
        (dir, name)
    } else {
        let dir = lonet_dir.join(network);
        mkdir_p(&dir, NETWORK_DIR_MODE)?;
        (dir, network.to_string())
    };

    let dburi = netdir.join("registry.db").to_string_lossy().into_owned();
    let registry = Registry::open(dburi, &network)?;

    let oslistener = match transport::bind_loopback(1024) {
        Ok(l) => l,
        Err(e) => {
            registry.close();
            return Err(e);
        }
    };

    let adapter = LonetAdapter::new(oslistener);
    let subnet = SubNetwork::new(format!("lonet{network}"), registry, adapter);
    subnet.vops().start(&subnet);
    Ok(subnet)
}

fn mkdir_p(path: &Path, mode: u32) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("mkdir -p {}", path.display()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("chmod {:o} {}", mode, path.display()))?;
    Ok(())
}
