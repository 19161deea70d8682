use std::sync::{Arc, Mutex, Once, Weak};

use anyhow::Context;
use lonet_types::{Addr, VirtnetError};

use crate::conn::Conn;
use crate::down::Down;
use crate::listener::Listener;
use crate::ops::VnetOps;
use crate::port::{alloc_free_socket, SocketSlot};
use crate::subnet::SubNetwork;

#[derive(Debug)]
pub(crate) struct HostState<V: VnetOps> {
    pub socketv: Vec<Option<SocketSlot<V>>>,
}

/// A named endpoint namespace within a subnetwork, owning a sparse port
/// table. See [`SubNetwork::new_host`].
#[derive(Debug)]
pub struct Host<V: VnetOps> {
    pub(crate) subnet: Weak<SubNetwork<V>>,
    pub(crate) name: String,
    pub(crate) state: Mutex<HostState<V>>,
    pub(crate) down: Down,
    pub(crate) close_once: Once,
}

impl<V: VnetOps> Host<V> {
    pub(crate) fn new(subnet: &Arc<SubNetwork<V>>, name: String) -> Arc<Host<V>> {
        Arc::new(Host {
            subnet: Arc::downgrade(subnet),
            name,
            state: Mutex::new(HostState {
                socketv: vec![None],
            }),
            down: Down::new(),
            close_once: Once::new(),
        })
    }

    pub(crate) fn subnet(&self) -> Option<Arc<SubNetwork<V>>> {
        self.subnet.upgrade()
    }

    pub fn network(&self) -> String {
        self.subnet().expect("host outlived its subnet").network().to_string()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn exc_down(&self) -> VirtnetError {
        let subnet = self.subnet().expect("host outlived its subnet");
        if subnet.down_signal().is_fired() {
            VirtnetError::NetworkDown
        } else {
            VirtnetError::HostDown
        }
    }

    fn parse_addr(&self, text: &str) -> Result<Addr, lonet_types::AddrParseError> {
        Addr::parse_relative(self.network(), text, &self.name)
    }

    /// Starts listening on `laddr` (`""` meaning `":0"`). See the port
    /// allocation rules in the port allocator.
    pub fn listen(self: &Arc<Self>, laddr: &str) -> anyhow::Result<Arc<Listener<V>>> {
        let laddr = if laddr.is_empty() { ":0" } else { laddr };
        self.listen_inner(laddr)
            .with_context(|| format!("listen {} {}", self.network(), laddr))
    }

    fn listen_inner(self: &Arc<Self>, laddr: &str) -> anyhow::Result<Arc<Listener<V>>> {
        let addr = self.parse_addr(laddr)?;
        if addr.host != self.name {
            return Err(VirtnetError::AddrNotAvailable.into());
        }

        let mut state = self.state.lock().unwrap();
        if self.down.is_fired() {
            return Err(self.exc_down().into());
        }

        let port = if addr.port == 0 {
            alloc_free_socket(&mut state.socketv)
        } else {
            let port = addr.port as usize;
            while port >= state.socketv.len() {
                state.socketv.push(None);
            }
            if state.socketv[port].is_some() {
                return Err(VirtnetError::AddrInUse.into());
            }
            state.socketv[port] = Some(SocketSlot {
                port: port as u32,
                conn: None,
                listener: None,
            });
            port as u32
        };

        let (dialq_tx, dialq_rx) = crossbeam_channel::bounded(0);
        let listener = Arc::new(Listener {
            host: Arc::downgrade(self),
            port,
            dialq_tx,
            dialq_rx,
            down: Down::new(),
            close_once: Once::new(),
        });
        state.socketv[port as usize].as_mut().unwrap().listener = Some(listener.clone());
        Ok(listener)
    }

    /// Dials `addr` (relative to this host) on the owning subnetwork.
    pub fn dial(self: &Arc<Self>, addr: &str) -> anyhow::Result<Arc<Conn<V>>> {
        let sk_port = alloc_free_socket(&mut self.state.lock().unwrap().socketv);
        let src = Addr::new(self.network(), self.name.clone(), sk_port);
        let dst_display = self.parse_addr(addr).map(|a| a.to_string()).unwrap_or_else(|_| addr.to_string());

        match self.dial_inner(addr, &src) {
            Ok(conn) => Ok(conn),
            Err(err) => {
                self.release_socket(sk_port);
                Err(err.context(format!("dial {} {}->{}", self.network(), src, dst_display)))
            }
        }
    }

    fn dial_inner(self: &Arc<Self>, addr: &str, src: &Addr) -> anyhow::Result<Arc<Conn<V>>> {
        if self.down.is_fired() {
            return Err(self.exc_down().into());
        }

        let dst = self.parse_addr(addr)?;
        let subnet = self.subnet().expect("host outlived its subnet");

        let dst_osladdr = subnet
            .registry()
            .query(&dst.host)
            .map_err(anyhow::Error::from)?
            .ok_or(VirtnetError::NoSuchHost)?;

        let (netsk, accepted_addr) = subnet.vops().vnet_dial(src, &dst, &dst_osladdr)?;

        let conn = Arc::new(Conn {
            host: Arc::downgrade(self),
            port: src.port,
            peer_addr: accepted_addr,
            netsk,
            down: Down::new(),
            close_once: Once::new(),
        });
        self.install_conn(src.port, conn.clone());
        Ok(conn)
    }

    pub(crate) fn shutdown(&self) {
        if !self.down.fire() {
            return;
        }
        let state = self.state.lock().unwrap();
        for slot in state.socketv.iter().flatten() {
            if let Some(conn) = &slot.conn {
                conn.shutdown();
            }
            if let Some(listener) = &slot.listener {
                listener.shutdown();
            }
        }
    }

    /// Closes the host. Idempotent; decrements the subnet's open-host count
    /// exactly once and, if autoclose armed and this was the last open host,
    /// closes the subnetwork.
    pub fn close(self: &Arc<Self>) {
        self.shutdown();

        let mut fired = false;
        self.close_once.call_once(|| fired = true);
        if fired {
            if let Some(subnet) = self.subnet() {
                subnet.note_host_closed();
            }
        }
    }

    pub(crate) fn release_socket(&self, port: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(slot) = state.socketv.get_mut(port as usize) {
            *slot = None;
        }
    }

    pub(crate) fn install_conn(&self, port: u32, conn: Arc<Conn<V>>) {
        let mut state = self.state.lock().unwrap();
        if let Some(Some(slot)) = state.socketv.get_mut(port as usize) {
            slot.conn = Some(conn);
        }
    }

    pub(crate) fn release_conn(&self, port: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(Some(slot)) = state.socketv.get_mut(port as usize) {
            slot.conn = None;
            if slot.is_empty() {
                state.socketv[port as usize] = None;
            }
        }
    }

    pub(crate) fn release_listener(&self, port: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(Some(slot)) = state.socketv.get_mut(port as usize) {
            slot.listener = None;
            if slot.is_empty() {
                state.socketv[port as usize] = None;
            }
        }
    }

    pub(crate) fn lookup_listener(&self, port: u32) -> Option<Arc<Listener<V>>> {
        let state = self.state.lock().unwrap();
        state
            .socketv
            .get(port as usize)
            .and_then(|s| s.as_ref())
            .and_then(|s| s.listener.clone())
    }
}
