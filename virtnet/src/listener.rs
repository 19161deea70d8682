use std::sync::{Arc, Once, Weak};
use std::thread;

use anyhow::Context;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use lonet_types::{Addr, VirtnetError};

use crate::conn::Conn;
use crate::down::Down;
use crate::host::Host;
use crate::ops::{RawStream, VnetOps};
use crate::port::alloc_free_socket;
use crate::rendezvous::{Accept, DialReq};

/// A listener bound to one socket on a [`Host`]; the sole consumer of its
/// `dialq`.
#[derive(Debug)]
pub struct Listener<V: VnetOps> {
    pub(crate) host: Weak<Host<V>>,
    pub(crate) port: u32,
    pub(crate) dialq_tx: Sender<DialReq<V>>,
    pub(crate) dialq_rx: Receiver<DialReq<V>>,
    pub(crate) down: Down,
    pub(crate) close_once: Once,
}

impl<V: VnetOps> Listener<V> {
    pub fn addr(&self) -> Addr {
        let host = self.host.upgrade().expect("listener outlived its host");
        Addr::new(host.network(), host.name().to_string(), self.port)
    }

    fn exc_down(&self) -> VirtnetError {
        let host = self.host.upgrade().expect("listener outlived its host");
        let subnet = host.subnet().expect("host outlived its subnet");
        if subnet.down_signal().is_fired() {
            VirtnetError::NetworkDown
        } else if host.down.is_fired() {
            VirtnetError::HostDown
        } else {
            VirtnetError::SocketDown
        }
    }

    /// Accepts one dial rendezvoused through this listener's `dialq`. See
    /// the accept state machine: allocate a fresh local socket, offer it to
    /// the dialer, wait for the post-accept ack, and retry on a failed ack.
    pub fn accept(&self) -> anyhow::Result<Arc<Conn<V>>> {
        let addr = self.addr();
        self.accept_inner()
            .map_err(anyhow::Error::from)
            .with_context(|| format!("accept {} {}", addr.network, addr))
    }

    fn accept_inner(&self) -> Result<Arc<Conn<V>>, VirtnetError> {
        let host = self.host.upgrade().expect("listener outlived its host");
        loop {
            let req: DialReq<V> = select! {
                recv(self.down.receiver()) -> _ => return Err(self.exc_down()),
                recv(self.dialq_rx) -> msg => match msg {
                    Ok(req) => req,
                    Err(_) => return Err(self.exc_down()),
                },
            };

            let sk_port = alloc_free_socket(&mut host.state.lock().unwrap().socketv);

            let (ack_tx, ack_rx) = bounded(0);
            let accept = Accept {
                addr: Addr::new(host.network(), host.name().to_string(), sk_port),
                ack: ack_tx,
            };
            if req.resp.send(accept).is_err() {
                host.release_socket(sk_port);
                continue;
            }

            let DialReq { from, netsk, .. } = req;

            let ack_err = select! {
                recv(self.down.receiver()) -> _ => {
                    let host = host.clone();
                    thread::spawn(move || {
                        if let Ok(None) = ack_rx.recv() {
                            netsk.close();
                        }
                        host.release_socket(sk_port);
                    });
                    return Err(self.exc_down());
                }
                recv(ack_rx) -> msg => msg.unwrap_or_else(|_| {
                    Some(anyhow::anyhow!("acceptor dropped the ack channel"))
                }),
            };

            if ack_err.is_some() {
                host.release_socket(sk_port);
                continue;
            }

            let conn = Arc::new(Conn {
                host: Arc::downgrade(&host),
                port: sk_port,
                peer_addr: from,
                netsk,
                down: Down::new(),
                close_once: Once::new(),
            });
            host.install_conn(sk_port, conn.clone());
            return Ok(conn);
        }
    }

    pub(crate) fn shutdown(&self) {
        if self.down.fire() {
            // waiters (accept/vnet_accept) observe this via `select!`.
        }
    }

    /// Closes the listener and unregisters it from its socket. Idempotent.
    pub fn close(&self) {
        self.shutdown();
        let mut fired = false;
        self.close_once.call_once(|| fired = true);
        if !fired {
            return;
        }
        if let Some(host) = self.host.upgrade() {
            host.release_listener(self.port);
        }
    }
}
