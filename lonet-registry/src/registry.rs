use lonet_types::VirtnetError;
use rusqlite::params;

use crate::error::{wrap, RegistryError, RegistryInnerError};
use crate::pool::ConnectionPool;

const SCHEMA_VER: &str = "lonet.1";

/// Shared on-disk registry mapping virtual hostnames to the loopback address
/// of the subnetwork currently serving them. Backed by a single SQLite file,
/// safe for concurrent writers across processes because `announce` relies on
/// the database's own unique-constraint enforcement (see spec §4.10 / §9).
#[derive(Debug)]
pub struct Registry {
    uri: String,
    pool: ConnectionPool,
}

impl Registry {
    /// Opens (creating if necessary) the registry at `dburi` for `network`.
    /// Fails with a [`RegistryError`] wrapping
    /// [`RegistryInnerError::SchemaVersionMismatch`] or
    /// [`RegistryInnerError::NetworkNameMismatch`] if the file already
    /// belongs to a different schema or network.
    pub fn open(dburi: impl Into<String>, network: &str) -> Result<Registry, RegistryError> {
        let uri = dburi.into();
        let r = Registry {
            pool: ConnectionPool::new(uri.clone()),
            uri,
        };
        wrap(
            &r.uri,
            "open",
            vec![network.to_string()],
            r.setup(network),
        )?;
        tracing::debug!(uri = %r.uri, network, "registry opened");
        Ok(r)
    }

    fn setup(&self, network: &str) -> Result<(), RegistryInnerError> {
        let conn = self.pool.xget()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS hosts (
                hostname  TEXT NOT NULL PRIMARY KEY,
                osladdr   TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS meta (
                name   TEXT NOT NULL PRIMARY KEY,
                value  TEXT NOT NULL
             );",
        )?;

        match Self::config(&conn, "schemaver")? {
            None => Self::set_config(&conn, "schemaver", SCHEMA_VER)?,
            Some(ver) if ver != SCHEMA_VER => {
                return Err(RegistryInnerError::SchemaVersionMismatch {
                    want: SCHEMA_VER.to_string(),
                    have: ver,
                })
            }
            Some(_) => {}
        }

        match Self::config(&conn, "network")? {
            None => Self::set_config(&conn, "network", network)?,
            Some(dbnetwork) if dbnetwork != network => {
                return Err(RegistryInnerError::NetworkNameMismatch {
                    want: network.to_string(),
                    have: dbnetwork,
                })
            }
            Some(_) => {}
        }

        Ok(())
    }

    fn config(
        conn: &rusqlite::Connection,
        name: &str,
    ) -> Result<Option<String>, RegistryInnerError> {
        let mut stmt = conn.prepare("SELECT value FROM meta WHERE name = ?1")?;
        let mut rows = stmt.query_map(params![name], |row| row.get::<_, String>(0))?;
        let first = rows.next().transpose()?;
        if rows.next().is_some() {
            return Err(RegistryInnerError::Corrupt("config"));
        }
        Ok(first)
    }

    fn set_config(
        conn: &rusqlite::Connection,
        name: &str,
        value: &str,
    ) -> Result<(), RegistryInnerError> {
        conn.execute(
            "INSERT OR REPLACE INTO meta (name, value) VALUES (?1, ?2)",
            params![name, value],
        )?;
        Ok(())
    }

    /// Announces that `hostname` is reachable at `osladdr`. Fails with
    /// [`VirtnetError::HostAlreadyRegistered`] if the host is already
    /// present — including when a peer subnetwork raced us to it, since the
    /// uniqueness check happens inside the database's own transaction.
    pub fn announce(&self, hostname: &str, osladdr: &str) -> Result<(), RegistryError> {
        wrap(
            &self.uri,
            "announce",
            vec![hostname.to_string(), osladdr.to_string()],
            self.announce_inner(hostname, osladdr),
        )
    }

    fn announce_inner(&self, hostname: &str, osladdr: &str) -> Result<(), RegistryInnerError> {
        let conn = self.pool.xget()?;
        let result = conn.execute(
            "INSERT INTO hosts (hostname, osladdr) VALUES (?1, ?2)",
            params![hostname, osladdr],
        );
        match result {
            Ok(_) => {
                tracing::debug!(hostname, osladdr, "host announced");
                Ok(())
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                tracing::warn!(hostname, "announce rejected: host already registered");
                Err(RegistryInnerError::HostAlreadyRegistered(
                    VirtnetError::HostAlreadyRegistered,
                ))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Looks up the loopback address `hostname` last announced at, or `None`
    /// if no subnetwork has announced it.
    pub fn query(&self, hostname: &str) -> Result<Option<String>, RegistryError> {
        wrap(
            &self.uri,
            "query",
            vec![hostname.to_string()],
            self.query_inner(hostname),
        )
    }

    fn query_inner(&self, hostname: &str) -> Result<Option<String>, RegistryInnerError> {
        let conn = self.pool.xget()?;
        let mut stmt = conn.prepare("SELECT osladdr FROM hosts WHERE hostname = ?1")?;
        let mut rows = stmt.query_map(params![hostname], |row| row.get::<_, String>(0))?;
        let first = rows.next().transpose()?;
        if rows.next().is_some() {
            return Err(RegistryInnerError::Corrupt("host"));
        }
        Ok(first)
    }

    /// Closes every idle pooled connection; safe to call more than once.
    pub fn close(&self) {
        tracing::debug!(uri = %self.uri, "registry closed");
        self.pool.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_db() -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db");
        (dir, path.to_str().unwrap().to_string())
    }

    #[test]
    fn announce_then_query_roundtrips() {
        let (_dir, path) = tmp_db();
        let r = Registry::open(&path, "netA").unwrap();
        assert_eq!(r.query("alpha").unwrap(), None);
        r.announce("alpha", "127.0.0.1:9001").unwrap();
        assert_eq!(r.query("alpha").unwrap(), Some("127.0.0.1:9001".to_string()));
    }

    #[test]
    fn duplicate_announce_fails_and_keeps_original() {
        let (_dir, path) = tmp_db();
        let r = Registry::open(&path, "netA").unwrap();
        r.announce("beta", "beta:a").unwrap();
        let err = r.announce("beta", "beta:b").unwrap_err();
        assert!(matches!(
            err.err,
            RegistryInnerError::HostAlreadyRegistered(_)
        ));
        assert_eq!(r.query("beta").unwrap(), Some("beta:a".to_string()));
    }

    #[test]
    fn reopen_with_same_network_succeeds() {
        let (_dir, path) = tmp_db();
        {
            let r = Registry::open(&path, "netA").unwrap();
            r.announce("alpha", "alpha:1").unwrap();
            r.close();
        }
        let r = Registry::open(&path, "netA").unwrap();
        assert_eq!(r.query("alpha").unwrap(), Some("alpha:1".to_string()));
    }

    #[test]
    fn reopen_with_different_network_fails() {
        let (_dir, path) = tmp_db();
        Registry::open(&path, "ccc").unwrap().close();
        let err = Registry::open(&path, "ddd").unwrap_err();
        assert!(err
            .to_string()
            .contains(r#"network name mismatch: want "ddd"; have "ccc""#));
    }

    #[test]
    fn close_is_idempotent() {
        let (_dir, path) = tmp_db();
        let r = Registry::open(&path, "netA").unwrap();
        r.close();
        r.close();
    }
}
