//! End-to-end scenarios against real loopback sockets: every subnetwork here
//! is a fresh `lonet::join("")`, no mocking.

use std::io::{Read, Write};
use std::thread;

use lonet_types::VirtnetError;

fn is_refused(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|e| matches!(e.downcast_ref::<VirtnetError>(), Some(VirtnetError::ConnectionRefused)))
}

#[test]
fn refused_before_listen() {
    let subnet = lonet::join("").unwrap();
    let alpha = subnet.new_host("alpha").unwrap();

    let err = alpha.dial(":0").unwrap_err();
    assert!(is_refused(&err), "expected connection refused, got {err:#}");

    let rendered = format!("{err:#}");
    assert!(
        rendered.contains("alpha:1->alpha:0"),
        "missing src/dst in {rendered:?}"
    );
    assert!(
        rendered.ends_with(&format!("[Errno {}] connection refused", libc::ECONNREFUSED)),
        "missing errno suffix in {rendered:?}"
    );
}

#[test]
fn listen_allocates_port_one_then_dial_advances_source_port() {
    let subnet = lonet::join("").unwrap();
    let alpha = subnet.new_host("alpha").unwrap();

    let l = alpha.listen("").unwrap();
    assert_eq!(l.addr().host, "alpha");
    assert_eq!(l.addr().port, 1);

    let err = alpha.dial(":0").unwrap_err();
    assert!(is_refused(&err));
    assert!(format!("{err:#}").contains("alpha:2->alpha:0"));
}

#[test]
fn two_concurrent_connections_get_sequential_ports_and_exchange_bytes() {
    let subnet = lonet::join("").unwrap();
    let alpha = subnet.new_host("alpha").unwrap();
    let beta = subnet.new_host("beta").unwrap();

    let l = alpha.listen("").unwrap();
    assert_eq!(l.addr().port, 1);

    let server = {
        let l = l.clone();
        thread::spawn(move || {
            let first = l.accept().unwrap();
            let second = l.accept().unwrap();
            (first, second)
        })
    };

    let conn1 = beta.dial("alpha:1").unwrap();
    assert_eq!(conn1.local_addr().port, 1);
    assert_eq!(conn1.remote_addr().port, 2);

    let conn2 = beta.dial("alpha:1").unwrap();
    assert_eq!(conn2.local_addr().port, 2);
    assert_eq!(conn2.remote_addr().port, 3);

    let (server1, server2) = server.join().unwrap();
    assert_eq!(server1.local_addr().port, 2);
    assert_eq!(server1.remote_addr().port, 1);
    assert_eq!(server2.local_addr().port, 3);
    assert_eq!(server2.remote_addr().port, 2);

    let c1 = thread::spawn(move || {
        let mut w = conn1.raw();
        w.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        w.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    });
    let s1 = thread::spawn(move || {
        let mut w = server1.raw();
        let mut buf = [0u8; 4];
        w.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        w.write_all(b"pong").unwrap();
    });
    c1.join().unwrap();
    s1.join().unwrap();

    let c2 = thread::spawn(move || {
        let mut w = conn2.raw();
        w.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        w.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"world");
    });
    let s2 = thread::spawn(move || {
        let mut w = server2.raw();
        let mut buf = [0u8; 5];
        w.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        w.write_all(b"world").unwrap();
    });
    c2.join().unwrap();
    s2.join().unwrap();

    let l2 = alpha.listen(":0").unwrap();
    assert_eq!(l2.addr().port, 4);
}

#[test]
fn registry_rejects_network_name_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let dburi = dir.path().join("registry.db");

    lonet_registry::Registry::open(dburi.to_str().unwrap(), "ccc")
        .unwrap()
        .close();

    let err = lonet_registry::Registry::open(dburi.to_str().unwrap(), "ddd").unwrap_err();
    assert!(err
        .to_string()
        .contains(r#"network name mismatch: want "ddd"; have "ccc""#));
}

#[test]
fn registry_rejects_duplicate_announce() {
    let dir = tempfile::tempdir().unwrap();
    let dburi = dir.path().join("registry.db").to_str().unwrap().to_string();
    let registry = lonet_registry::Registry::open(&dburi, "netA").unwrap();

    registry.announce("beta", "beta:a").unwrap();
    assert_eq!(registry.query("beta").unwrap(), Some("beta:a".to_string()));

    let err = registry.announce("beta", "beta:b").unwrap_err();
    assert!(matches!(
        err.err,
        lonet_registry::RegistryInnerError::HostAlreadyRegistered(_)
    ));
    assert_eq!(registry.query("beta").unwrap(), Some("beta:a".to_string()));
}
