//! Bounded LIFO pool of live database connections. `acquire` blocks when the
//! pool is empty, so the pool size regulates how many statements can be in
//! flight at once; `release` never blocks.

use parking_lot::{Condvar, Mutex};

use crate::driver::{self, DbConnection, Recordset};
use crate::error::Result;

pub struct ConnectionPool {
    idle: Mutex<Vec<Box<dyn DbConnection>>>,
    available: Condvar,
    capacity: usize,
}

impl ConnectionPool {
    /// Opens `capacity` connections to the same URI up front. Failing to
    /// open any of them fails the pool.
    pub fn connect(uri: &str, capacity: usize) -> Result<Self> {
        let mut idle = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            idle.push(driver::connect(uri)?);
        }
        Ok(Self {
            idle: Mutex::new(idle),
            available: Condvar::new(),
            capacity,
        })
    }

    /// Takes a connection, blocking until one is returned if none is idle.
    pub fn acquire(&self) -> Box<dyn DbConnection> {
        let mut idle = self.idle.lock();
        loop {
            if let Some(conn) = idle.pop() {
                return conn;
            }
            self.available.wait(&mut idle);
        }
    }

    pub fn release(&self, conn: Box<dyn DbConnection>) {
        self.idle.lock().push(conn);
        self.available.notify_one();
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Binds a connection for the duration of a query sequence. The
    /// connection goes back to the pool on every exit path.
    pub fn session(&self) -> Session<'_> {
        Session {
            pool: self,
            conn: Some(self.acquire()),
        }
    }
}

pub struct Session<'a> {
    pool: &'a ConnectionPool,
    conn: Option<Box<dyn DbConnection>>,
}

impl Session<'_> {
    pub fn exec(&mut self, sql: &str) -> Result<Recordset> {
        // The connection is always present until drop.
        match self.conn.as_mut() {
            Some(conn) => conn.exec(sql),
            None => unreachable!("session connection already returned"),
        }
    }

    pub fn connected(&mut self) -> bool {
        self.conn.as_mut().is_some_and(|c| c.connected())
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
