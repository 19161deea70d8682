//! Language-neutral virtual network core shared by every lonet subnetwork
//! implementation: hosts, sockets, listeners, connections, port allocation,
//! the dial/accept rendezvous and the shutdown cascade. Knows nothing about
//! TCP or the lonet wire protocol — those live behind [`VnetOps`].

mod conn;
mod down;
mod host;
mod listener;
mod ops;
mod port;
mod rendezvous;
mod subnet;

pub use conn::Conn;
pub use host::Host;
pub use listener::Listener;
pub use ops::{RawStream, VnetOps};
pub use rendezvous::Accept;
pub use subnet::SubNetwork;

pub use lonet_registry::{Registry, RegistryError};
pub use lonet_types::{Addr, AddrParseError, VirtnetError};

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};

    use lonet_registry::Registry;
    use lonet_types::{Addr, VirtnetError};

    use crate::ops::{RawStream, VnetOps};

    /// A `VnetOps` double for unit tests: dials are rendezvoused entirely in
    /// memory via a shared registry of `hostname -> Host`, bypassing real
    /// sockets and the lonet wire protocol.
    pub(crate) struct TestOps {
        pub dial_hook: Mutex<Option<Box<dyn Fn(&Addr, &Addr, &str) -> anyhow::Result<(TestStream, Addr)> + Send>>>,
    }

    impl Default for TestOps {
        fn default() -> Self {
            TestOps {
                dial_hook: Mutex::new(None),
            }
        }
    }

    impl std::fmt::Debug for TestOps {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("TestOps").finish_non_exhaustive()
        }
    }

    #[derive(Clone, Debug)]
    pub(crate) struct TestStream(pub Arc<Mutex<bool>>);

    impl TestStream {
        pub fn new() -> Self {
            TestStream(Arc::new(Mutex::new(false)))
        }

        pub fn is_closed(&self) -> bool {
            *self.0.lock().unwrap()
        }
    }

    impl RawStream for TestStream {
        fn close(&self) {
            *self.0.lock().unwrap() = true;
        }
    }

    impl VnetOps for TestOps {
        type RawStream = TestStream;

        fn vnet_newhost(&self, _hostname: &str, _registry: &Registry) -> anyhow::Result<()> {
            Ok(())
        }

        fn vnet_dial(
            &self,
            src: &Addr,
            dst: &Addr,
            dst_osladdr: &str,
        ) -> anyhow::Result<(Self::RawStream, Addr)> {
            match self.dial_hook.lock().unwrap().as_ref() {
                Some(hook) => hook(src, dst, dst_osladdr),
                None => Err(VirtnetError::ConnectionRefused.into()),
            }
        }

        fn vnet_close(&self) {}
    }

    fn open_registry() -> (tempfile::TempDir, Registry) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db");
        let registry = Registry::open(path.to_str().unwrap(), "testnet").unwrap();
        (dir, registry)
    }

    #[test]
    fn new_host_then_close_updates_open_count() {
        let (_dir, registry) = open_registry();
        let subnet = crate::SubNetwork::new("testnet", registry, TestOps::default());
        let alpha = subnet.new_host("alpha").unwrap();
        assert!(subnet.host("alpha").is_some());
        alpha.close();
        assert!(subnet.host("alpha").is_some(), "close does not remove from hostmap");
    }

    #[test]
    fn duplicate_host_name_is_rejected() {
        let (_dir, registry) = open_registry();
        let subnet = crate::SubNetwork::new("testnet", registry, TestOps::default());
        subnet.new_host("alpha").unwrap();
        let err = subnet.new_host("alpha").unwrap_err();
        assert!(err.chain().any(|e| matches!(
            e.downcast_ref::<VirtnetError>(),
            Some(VirtnetError::HostAlreadyRegistered)
        )));
    }

    #[test]
    fn listen_allocates_lowest_free_port() {
        let (_dir, registry) = open_registry();
        let subnet = crate::SubNetwork::new("testnet", registry, TestOps::default());
        let alpha = subnet.new_host("alpha").unwrap();
        let l1 = alpha.listen("").unwrap();
        assert_eq!(l1.addr().port, 1);
        let l2 = alpha.listen("").unwrap();
        assert_eq!(l2.addr().port, 2);
        l1.close();
        let l3 = alpha.listen("").unwrap();
        assert_eq!(l3.addr().port, 1);
    }

    #[test]
    fn listen_on_occupied_explicit_port_fails() {
        let (_dir, registry) = open_registry();
        let subnet = crate::SubNetwork::new("testnet", registry, TestOps::default());
        let alpha = subnet.new_host("alpha").unwrap();
        alpha.listen(":5").unwrap();
        let err = alpha.listen(":5").unwrap_err();
        assert!(err.chain().any(|e| matches!(
            e.downcast_ref::<VirtnetError>(),
            Some(VirtnetError::AddrInUse)
        )));
    }

    #[test]
    fn listen_on_foreign_host_fails() {
        let (_dir, registry) = open_registry();
        let subnet = crate::SubNetwork::new("testnet", registry, TestOps::default());
        let alpha = subnet.new_host("alpha").unwrap();
        let err = alpha.listen("beta:1").unwrap_err();
        assert!(err.chain().any(|e| matches!(
            e.downcast_ref::<VirtnetError>(),
            Some(VirtnetError::AddrNotAvailable)
        )));
    }

    #[test]
    fn dial_with_no_such_host_fails() {
        let (_dir, registry) = open_registry();
        let subnet = crate::SubNetwork::new("testnet", registry, TestOps::default());
        let alpha = subnet.new_host("alpha").unwrap();
        let err = alpha.dial("beta:1").unwrap_err();
        assert!(err.chain().any(|e| matches!(
            e.downcast_ref::<VirtnetError>(),
            Some(VirtnetError::NoSuchHost)
        )));
    }

    #[test]
    fn host_close_fails_subsequent_listen_with_host_down() {
        let (_dir, registry) = open_registry();
        let subnet = crate::SubNetwork::new("testnet", registry, TestOps::default());
        let alpha = subnet.new_host("alpha").unwrap();
        alpha.close();
        let err = alpha.listen("").unwrap_err();
        assert!(err.chain().any(|e| matches!(
            e.downcast_ref::<VirtnetError>(),
            Some(VirtnetError::HostDown)
        )));
    }

    #[test]
    fn subnet_close_fails_subsequent_new_host_with_network_down() {
        let (_dir, registry) = open_registry();
        let subnet = crate::SubNetwork::new("testnet", registry, TestOps::default());
        subnet.close();
        let err = subnet.new_host("alpha").unwrap_err();
        assert!(err.chain().any(|e| matches!(
            e.downcast_ref::<VirtnetError>(),
            Some(VirtnetError::NetworkDown)
        )));
    }

    #[test]
    fn autoclose_closes_subnet_after_last_host() {
        let (_dir, registry) = open_registry();
        let subnet = crate::SubNetwork::new("testnet", registry, TestOps::default());
        let alpha = subnet.new_host("alpha").unwrap();
        subnet.autoclose();
        alpha.close();
        let err = subnet.new_host("beta").unwrap_err();
        assert!(err.chain().any(|e| matches!(
            e.downcast_ref::<VirtnetError>(),
            Some(VirtnetError::NetworkDown)
        )));
    }

    #[test]
    fn dial_accept_rendezvous_connects_and_assigns_ports() {
        let (_dir, registry) = open_registry();
        let subnet = crate::SubNetwork::new("testnet", registry, TestOps::default());
        let alpha = subnet.new_host("alpha").unwrap();
        let beta = subnet.new_host("beta").unwrap();
        let l = alpha.listen("").unwrap();
        assert_eq!(l.addr().port, 1);

        let subnet_for_dial = subnet.clone();
        subnet
            .vops()
            .dial_hook
            .lock()
            .unwrap()
            .replace(Box::new(move |src, dst, _osladdr| {
                let netconn = TestStream::new();
                let accept = subnet_for_dial
                    .vnet_accept(src.clone(), dst.clone(), netconn.clone())
                    .map_err(anyhow::Error::from)?;
                let accepted_addr = accept.addr.clone();
                accept.ack_ok();
                Ok((netconn, accepted_addr))
            }));

        let accept_thread = {
            let l = l.clone();
            std::thread::spawn(move || l.accept())
        };
        let conn = beta.dial("alpha:1").unwrap();
        let server_conn = accept_thread.join().unwrap().unwrap();

        assert_eq!(conn.local_addr().port, 1);
        assert_eq!(conn.remote_addr().port, server_conn.local_addr().port);
        assert_eq!(server_conn.remote_addr().port, conn.local_addr().port);
    }
}
