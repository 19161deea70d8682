//! Concrete `VnetOps` implementation: binds a real loopback listener, serves
//! incoming real connections, and performs the lonet text handshake to turn
//! them into virtnet connections.

use std::net::TcpListener;
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use lonet_registry::Registry;
use lonet_types::{Addr, VirtnetError};
use virtnet::{RawStream, SubNetwork, VnetOps};

use crate::proto::{format_dial_line, format_reply_line, parse_dial_line, parse_reply_line, qq};
use crate::transport::Conn;

/// How long the serve loop sleeps between non-blocking accept polls. `std`
/// gives no interruptible-accept primitive for `TcpListener`, so shutdown is
/// detected by polling `subnet.is_down()` at this granularity — the same
/// workaround the reference implementation uses.
const ACCEPT_POLL: Duration = Duration::from_millis(1);

pub struct LonetAdapter {
    oslistener: TcpListener,
    subnet: Mutex<Option<Weak<SubNetwork<LonetAdapter>>>>,
    serve_thread: Mutex<Option<JoinHandle<()>>>,
    handlers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for LonetAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LonetAdapter")
            .field("oslistener", &self.oslistener)
            .finish_non_exhaustive()
    }
}

impl LonetAdapter {
    pub(crate) fn new(oslistener: TcpListener) -> Self {
        LonetAdapter {
            oslistener,
            subnet: Mutex::new(None),
            serve_thread: Mutex::new(None),
            handlers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn oslistener_addr(&self) -> Result<String> {
        Ok(self.oslistener.local_addr()?.to_string())
    }

    /// Attaches the owning subnetwork and starts the serve loop. Must be
    /// called exactly once, right after `SubNetwork::new` returns.
    pub(crate) fn start(&self, subnet: &Arc<SubNetwork<LonetAdapter>>) {
        *self.subnet.lock().unwrap() = Some(Arc::downgrade(subnet));
        let subnet = subnet.clone();
        let handle = thread::spawn(move || serve(subnet));
        *self.serve_thread.lock().unwrap() = Some(handle);
    }

    fn subnet(&self) -> Arc<SubNetwork<LonetAdapter>> {
        self.subnet
            .lock()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade)
            .expect("adapter used before start()")
    }
}

impl VnetOps for LonetAdapter {
    type RawStream = Conn;

    fn vnet_newhost(&self, hostname: &str, registry: &Registry) -> Result<()> {
        let osladdr = self.oslistener_addr()?;
        registry.announce(hostname, &osladdr)?;
        Ok(())
    }

    fn vnet_dial(&self, src: &Addr, dst: &Addr, dst_osladdr: &str) -> Result<(Conn, Addr)> {
        let network = self.subnet().network().to_string();
        let mut conn = Conn::dial(dst_osladdr)?;
        let accepted = loconnect(&mut conn, &network, src, dst)?;
        Ok((conn, accepted))
    }

    fn vnet_close(&self) {
        if let Some(handle) = self.serve_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        let handlers: Vec<_> = self.handlers.lock().unwrap().drain(..).collect();
        for h in handlers {
            let _ = h.join();
        }
    }
}

fn serve(subnet: Arc<SubNetwork<LonetAdapter>>) {
    let adapter_network = subnet.network().to_string();
    loop {
        if subnet.is_down() {
            return;
        }

        {
            let mut handlers = subnet.vops().handlers.lock().unwrap();
            handlers.retain(|h| !h.is_finished());
        }

        let accepted = subnet.vops().oslistener.accept();
        match accepted {
            Ok((stream, _peer)) => {
                let conn = Conn::from_stream(stream);
                let my_addr = subnet
                    .vops()
                    .oslistener_addr()
                    .unwrap_or_else(|_| "?".to_string());
                let peer_addr = conn.peer_addr().unwrap_or_else(|_| "?".to_string());
                let subnet_for_handler = subnet.clone();
                let network_for_log = adapter_network.clone();
                let handle = thread::spawn(move || {
                    if let Err(e) = loaccept(&subnet_for_handler, conn) {
                        let is_refused = e
                            .chain()
                            .any(|c| matches!(c.downcast_ref::<VirtnetError>(), Some(VirtnetError::ConnectionRefused)));
                        if !is_refused {
                            tracing::error!(
                                network = %qq(&network_for_log),
                                %my_addr,
                                %peer_addr,
                                error = %e,
                                "lonet serve: connection handler failed"
                            );
                        }
                    }
                });
                subnet.vops().handlers.lock().unwrap().push(handle);
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                subnet.vnet_down(anyhow::Error::from(e));
                return;
            }
        }
    }
}

fn loaccept(subnet: &Arc<SubNetwork<LonetAdapter>>, mut conn: Conn) -> Result<()> {
    loaccept_inner(subnet, &mut conn).map_err(|err| {
        conn.close();
        err.context("loaccept")
    })
}

fn loaccept_inner(subnet: &Arc<SubNetwork<LonetAdapter>>, conn: &mut Conn) -> Result<()> {
    let network = subnet.network().to_string();
    let line = conn.recv_line()?;

    let dial = match parse_dial_line(&line) {
        Ok(d) => d,
        Err(reason) => {
            let _ = send_error_reply(conn, &network, &format!("protocol error: {reason}"));
            bail!("protocol error: invalid dial request: {}", qq(&line));
        }
    };

    if dial.network != network {
        let _ = send_error_reply(
            conn,
            &network,
            &format!("protocol error: network mismatch: {}", qq(&dial.network)),
        );
        bail!("protocol error: network mismatch: {}", qq(&dial.network));
    }

    let src = match Addr::parse(&network, &dial.src) {
        Ok(a) => a,
        Err(_) => {
            let _ = send_error_reply(
                conn,
                &network,
                &format!("protocol error: src address invalid: {}", qq(&dial.src)),
            );
            bail!("protocol error: src address invalid: {}", qq(&dial.src));
        }
    };
    let dst = match Addr::parse(&network, &dial.dst) {
        Ok(a) => a,
        Err(_) => {
            let _ = send_error_reply(
                conn,
                &network,
                &format!("protocol error: dst address invalid: {}", qq(&dial.dst)),
            );
            bail!("protocol error: dst address invalid: {}", qq(&dial.dst));
        }
    };

    let netsk = conn.try_clone().context("cloning accepted stream")?;
    let accept = match subnet.vnet_accept(src, dst.clone(), netsk) {
        Ok(a) => a,
        Err(err) => {
            let arg = if err == VirtnetError::ConnectionRefused {
                "connection refused".to_string()
            } else {
                err.to_string()
            };
            let _ = send_error_reply(conn, &network, &arg);
            return Err(err.into());
        }
    };

    let reply_line = format_reply_line(&network, "connected", &accept.addr.to_string());
    match conn.send_line(&reply_line) {
        Ok(()) => {
            accept.ack_ok();
            Ok(())
        }
        Err(e) => {
            accept.ack_err(anyhow::anyhow!("{e}"));
            Err(e)
        }
    }
    .with_context(|| format!("{} <- {}", dst, dial.src))
}

fn send_error_reply(conn: &mut Conn, network: &str, arg: &str) -> Result<()> {
    conn.send_line(&format_reply_line(network, "E", arg))
}

fn loconnect(conn: &mut Conn, network: &str, src: &Addr, dst: &Addr) -> Result<Addr> {
    let peer = conn.peer_addr().unwrap_or_else(|_| "?".to_string());
    loconnect_inner(conn, network, src, dst).map_err(|err| {
        conn.close();
        if err.downcast_ref::<VirtnetError>() == Some(&VirtnetError::ConnectionRefused) {
            err
        } else {
            err.context(format!("loconnect {peer}"))
        }
    })
}

fn loconnect_inner(conn: &mut Conn, network: &str, src: &Addr, dst: &Addr) -> Result<Addr> {
    let line = format_dial_line(network, &src.to_string(), &dst.to_string());
    conn.send_line(&line)?;

    let reply_line = conn.recv_line()?;
    let reply = parse_reply_line(&reply_line).map_err(|reason| anyhow::anyhow!(reason))?;

    if reply.verb == "E" {
        if reply.arg == "connection refused" {
            return Err(VirtnetError::ConnectionRefused.into());
        }
        bail!("{}", reply.arg);
    }
    if reply.verb != "connected" {
        bail!("protocol error: invalid reply verb: {}", qq(&reply.verb));
    }
    if reply.network != network {
        bail!(
            "protocol error: connected, but network mismatch: {}",
            qq(&reply.network)
        );
    }

    let accepted = Addr::parse(network, &reply.arg).map_err(|_| {
        anyhow::anyhow!(
            "protocol error: connected, but accept address invalid: {}",
            qq(&reply.arg)
        )
    })?;
    if accepted.host != dst.host {
        bail!(
            "protocol error: connected, but accept address is for different host: {}",
            qq(&accepted.host)
        );
    }

    Ok(accepted)
}
