use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};

use anyhow::Context;
use lonet_registry::Registry;
use lonet_types::{Addr, VirtnetError};

use crate::down::Down;
use crate::host::Host;
use crate::ops::VnetOps;
use crate::rendezvous::{Accept, DialReq};

pub(crate) struct SubnetState<V: VnetOps> {
    hostmap: HashMap<String, Arc<Host<V>>>,
    nopenhosts: i64,
    autoclose: bool,
}

/// One process's membership in a named virtnet network: owns a set of
/// [`Host`]s and the shared [`Registry`], and drives the dial/accept
/// rendezvous between them through a concrete [`VnetOps`] implementation.
pub struct SubNetwork<V: VnetOps> {
    network: String,
    registry: Registry,
    vops: V,
    state: Mutex<SubnetState<V>>,
    down: Down,
    down_once: Once,
}

impl<V: VnetOps> SubNetwork<V> {
    pub fn new(network: impl Into<String>, registry: Registry, vops: V) -> Arc<SubNetwork<V>> {
        Arc::new(SubNetwork {
            network: network.into(),
            registry,
            vops,
            state: Mutex::new(SubnetState {
                hostmap: HashMap::new(),
                nopenhosts: 0,
                autoclose: false,
            }),
            down: Down::new(),
            down_once: Once::new(),
        })
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The concrete adapter driving this subnetwork's transport.
    pub fn vops(&self) -> &V {
        &self.vops
    }

    /// Whether the subnetwork's shutdown signal has fired.
    pub fn is_down(&self) -> bool {
        self.down.is_fired()
    }

    pub(crate) fn down_signal(&self) -> &Down {
        &self.down
    }

    /// Registers `name` as a host of this subnetwork. Fails with *host
    /// already registered* if the name is already local; cross-process
    /// duplicates are rejected by the registry inside `vnet_newhost`.
    pub fn new_host(self: &Arc<Self>, name: &str) -> anyhow::Result<Arc<Host<V>>> {
        self.new_host_inner(name)
            .with_context(|| format!("virtnet {}: new host {}", self.network, name))
    }

    fn new_host_inner(self: &Arc<Self>, name: &str) -> anyhow::Result<Arc<Host<V>>> {
        {
            let state = self.state.lock().unwrap();
            if self.down.is_fired() {
                return Err(VirtnetError::NetworkDown.into());
            }
            if state.hostmap.contains_key(name) {
                return Err(VirtnetError::HostAlreadyRegistered.into());
            }
        }

        // No lock held across the registry's blocking I/O: a concurrent
        // `new_host` racing for the same name is resolved by the registry's
        // own uniqueness constraint, not by holding `state` here.
        self.vops.vnet_newhost(name, &self.registry)?;

        let host = Host::new(self, name.to_string());
        let mut state = self.state.lock().unwrap();
        if self.down.is_fired() {
            return Err(VirtnetError::NetworkDown.into());
        }
        if state.hostmap.contains_key(name) {
            panic!("announced ok but hostmap already has {:?}", name);
        }
        state.hostmap.insert(name.to_string(), host.clone());
        state.nopenhosts += 1;
        Ok(host)
    }

    /// Returns the local host by name, or `None`.
    pub fn host(&self, name: &str) -> Option<Arc<Host<V>>> {
        self.state.lock().unwrap().hostmap.get(name).cloned()
    }

    /// Arms autoclose: once the last open host closes, the subnetwork closes
    /// itself. Requires at least one currently open host.
    pub fn autoclose(&self) {
        let mut state = self.state.lock().unwrap();
        if state.nopenhosts == 0 {
            panic!("BUG: no opened hosts");
        }
        state.autoclose = true;
    }

    pub(crate) fn note_host_closed(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        state.nopenhosts -= 1;
        if state.nopenhosts < 0 {
            panic!("SubNetwork::nopenhosts < 0");
        }
        if state.autoclose && state.nopenhosts == 0 {
            drop(state);
            self.close_without_hosts();
        }
    }

    /// Looks up `dst`'s listener and rendezvouses an inbound raw stream with
    /// it, returning the listener's accept decision for the adapter to act
    /// on.
    pub fn vnet_accept(
        self: &Arc<Self>,
        src: Addr,
        dst: Addr,
        netsk: V::RawStream,
    ) -> Result<Accept, VirtnetError> {
        let host = self
            .state
            .lock()
            .unwrap()
            .hostmap
            .get(&dst.host)
            .cloned()
            .ok_or(VirtnetError::NoSuchHost)?;

        let listener = host
            .lookup_listener(dst.port)
            .ok_or(VirtnetError::ConnectionRefused)?;

        let (resp_tx, resp_rx) = crossbeam_channel::bounded(0);
        let req = DialReq {
            from: src,
            netsk,
            resp: resp_tx,
        };

        crossbeam_channel::select! {
            recv(listener.down.receiver()) -> _ => Err(VirtnetError::ConnectionRefused),
            send(listener.dialq_tx, req) -> res => {
                res.map_err(|_| VirtnetError::ConnectionRefused)?;
                resp_rx.recv().map_err(|_| VirtnetError::ConnectionRefused)
            }
        }
    }

    /// Shuts down the subnetwork: idempotent. `exc` is a just-observed engine
    /// error (logged, not propagated) for the `vnet_down` entry point.
    fn shutdown(self: &Arc<Self>, exc: Option<anyhow::Error>, with_hosts: bool) {
        let mut fired = false;
        self.down_once.call_once(|| fired = true);
        if !fired {
            return;
        }
        self.down.fire();

        if with_hosts {
            let hosts: Vec<Arc<Host<V>>> =
                self.state.lock().unwrap().hostmap.values().cloned().collect();
            for host in hosts {
                host.shutdown();
            }
        }

        if let Some(exc) = exc {
            tracing::error!(network = %self.network, error = %exc, "virtnet engine failure");
        }
        self.vops.vnet_close();
        self.registry.close();
    }

    /// Shuts down the subnetwork, including every host. Idempotent.
    pub fn close(self: &Arc<Self>) {
        self.shutdown(None, true);
    }

    /// Shuts down the subnetwork without touching its hosts: used by
    /// autoclose, whose caller has already closed the last open host.
    pub(crate) fn close_without_hosts(self: &Arc<Self>) {
        self.shutdown(None, false);
    }

    /// Triggered by the concrete adapter on an unrecoverable engine failure
    /// (e.g. the real listener's `accept` failed). Shuts down the whole
    /// subnetwork, including every host.
    pub fn vnet_down(self: &Arc<Self>, exc: anyhow::Error) {
        self.shutdown(Some(exc), true);
    }
}
