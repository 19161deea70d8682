use std::ops::Deref;
use std::sync::Mutex;

use rusqlite::Connection;

use crate::error::RegistryInnerError;

#[derive(Debug)]
enum PoolState {
    Open(Vec<Connection>),
    Closed,
}

/// A bounded pool of [`rusqlite::Connection`]s opened against the same URI.
///
/// `get`/`put` hand out and reclaim connections; [`ConnectionPool::xget`]
/// wraps the pair in a guard so the connection is always returned (or
/// dropped, if the pool has since been closed). Connections move freely
/// between threads — `get` on one thread and `put` on another is the normal
/// case once a registry call runs its query on a spawned handler thread.
#[derive(Debug)]
pub struct ConnectionPool {
    dburi: String,
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    pub fn new(dburi: impl Into<String>) -> Self {
        ConnectionPool {
            dburi: dburi.into(),
            state: Mutex::new(PoolState::Open(Vec::new())),
        }
    }

    fn open_one(&self) -> Result<Connection, RegistryInnerError> {
        let conn = Connection::open(&self.dburi)?;
        // Always autocommit: the registry never spans a multi-statement
        // transaction across a pool checkout.
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }

    pub fn get(&self) -> Result<Connection, RegistryInnerError> {
        {
            let mut state = self.state.lock().unwrap();
            match &mut *state {
                PoolState::Closed => return Err(RegistryInnerError::PoolClosed),
                PoolState::Open(conns) => {
                    if let Some(conn) = conns.pop() {
                        return Ok(conn);
                    }
                }
            }
        }
        self.open_one()
    }

    pub fn put(&self, conn: Connection) {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            PoolState::Open(conns) => conns.push(conn),
            PoolState::Closed => drop(conn),
        }
    }

    /// Closes every connection currently free in the pool and marks it dead;
    /// any connection checked out via [`ConnectionPool::xget`] at the time is
    /// closed as it is returned instead of going back on the free list.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        *state = PoolState::Closed;
    }

    pub fn xget(&self) -> Result<PooledConnection<'_>, RegistryInnerError> {
        Ok(PooledConnection {
            pool: self,
            conn: Some(self.get()?),
        })
    }
}

/// RAII checkout from a [`ConnectionPool`]; returns its connection to the
/// pool (or closes it, if the pool closed meanwhile) on drop.
pub struct PooledConnection<'a> {
    pool: &'a ConnectionPool,
    conn: Option<Connection>,
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection taken before drop")
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put(conn);
        }
    }
}
