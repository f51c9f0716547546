//! Table management and the small scalar recovery queries.

use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use super::StoreInner;
use crate::error::Result;
use crate::pool::Session;

const TABLES: [&str; 5] = ["Valuations", "\"Values\"", "Atoms", "TypeCodes", "Spaces"];

/// Largest stored atom id, 0 when the table is empty.
pub(crate) fn max_observed_id(session: &mut Session<'_>) -> Result<u64> {
    scalar_or_zero(session, "SELECT uuid FROM Atoms ORDER BY uuid DESC LIMIT 1;", "uuid")
}

/// Largest stored value id, 0 when the table is empty.
pub(crate) fn max_observed_vuid(session: &mut Session<'_>) -> Result<u64> {
    scalar_or_zero(
        session,
        "SELECT vuid FROM \"Values\" ORDER BY vuid DESC LIMIT 1;",
        "vuid",
    )
}

/// Tallest stored atom, 0 when only nodes exist.
pub(crate) fn max_observed_height(session: &mut Session<'_>) -> Result<u64> {
    scalar_or_zero(
        session,
        "SELECT height FROM Atoms ORDER BY height DESC LIMIT 1;",
        "height",
    )
}

fn scalar_or_zero(session: &mut Session<'_>, sql: &str, column: &str) -> Result<u64> {
    let rows = session.exec(sql)?;
    match rows.first() {
        Some(row) => row.parse_u64(column),
        None => Ok(0),
    }
}

impl StoreInner {
    pub(crate) fn create_tables(&self) -> Result<()> {
        let mut session = self.pool.session();
        session.exec(
            "CREATE TABLE Spaces (\
             space BIGINT PRIMARY KEY, \
             parent BIGINT);",
        )?;
        session.exec("INSERT INTO Spaces (space, parent) VALUES (0, 0);")?;
        session.exec("INSERT INTO Spaces (space, parent) VALUES (1, 1);")?;

        session.exec(
            "CREATE TABLE Atoms (\
             uuid BIGINT PRIMARY KEY, \
             space BIGINT REFERENCES Spaces(space), \
             type SMALLINT, \
             tv_type SMALLINT, \
             stv_mean FLOAT, \
             stv_confidence FLOAT, \
             stv_count DOUBLE PRECISION, \
             height SMALLINT, \
             name TEXT, \
             outgoing BIGINT[], \
             UNIQUE (type, name), \
             UNIQUE (type, outgoing));",
        )?;

        session.exec(
            "CREATE TABLE Valuations (\
             key BIGINT REFERENCES Atoms(uuid), \
             atom BIGINT REFERENCES Atoms(uuid), \
             type SMALLINT, \
             floatvalue DOUBLE PRECISION[], \
             stringvalue TEXT[], \
             linkvalue BIGINT[], \
             UNIQUE (key, atom));",
        )?;
        session.exec("CREATE INDEX ON Valuations (atom);")?;

        session.exec(
            "CREATE TABLE \"Values\" (\
             vuid BIGINT PRIMARY KEY, \
             type SMALLINT, \
             floatvalue DOUBLE PRECISION[], \
             stringvalue TEXT[], \
             linkvalue BIGINT[]);",
        )?;

        session.exec(
            "CREATE TABLE TypeCodes (\
             type SMALLINT UNIQUE, \
             typename TEXT UNIQUE);",
        )?;

        let mut known = self.known_spaces.lock();
        known.insert(0);
        known.insert(1);
        info!("store.schema.created");
        Ok(())
    }

    pub(crate) fn rename_tables(&self) -> Result<()> {
        let mut session = self.pool.session();
        for table in TABLES {
            let bare = table.trim_matches('"');
            session.exec(&format!("ALTER TABLE {table} RENAME TO {bare}_backup;"))?;
        }
        warn!("store.schema.renamed_to_backup");
        Ok(())
    }

    /// Deletes every row and reseeds the root spaces, then resets the
    /// process-local caches so the next store starts from a blank slate.
    pub(crate) fn erase_data(&self) -> Result<()> {
        {
            let mut session = self.pool.session();
            session.exec("DELETE FROM Valuations;")?;
            session.exec("DELETE FROM \"Values\";")?;
            session.exec("DELETE FROM Atoms;")?;
            session.exec("DELETE FROM Spaces;")?;
            session.exec("INSERT INTO Spaces (space, parent) VALUES (0, 0);")?;
            session.exec("INSERT INTO Spaces (space, parent) VALUES (1, 1);")?;
        }
        self.gate.clear();
        self.idmap.clear();
        self.next_vuid.store(1, Ordering::SeqCst);
        {
            let mut known = self.known_spaces.lock();
            known.clear();
            known.insert(0);
            known.insert(1);
        }
        self.primed.store(false, Ordering::Release);
        warn!("store.schema.erased");
        Ok(())
    }

    /// Persists this store's space and its ancestors, parents first.
    /// Already-known ids are skipped; an insert that loses a race to
    /// another process is downgraded to known.
    pub(crate) fn store_space_tree(&self, session: &mut Session<'_>) -> Result<()> {
        for space in self.space.lineage() {
            let id = space.id();
            if self.known_spaces.lock().contains(&id) {
                continue;
            }
            let insert = format!(
                "INSERT INTO Spaces (space, parent) VALUES ({id}, {});",
                space.parent_id()
            );
            if let Err(err) = session.exec(&insert) {
                let exists = session
                    .exec(&format!("SELECT space FROM Spaces WHERE space = {id};"))?
                    .first()
                    .is_some();
                if !exists {
                    return Err(err);
                }
            }
            self.known_spaces.lock().insert(id);
            debug!(space = id, "store.space.persisted");
        }
        Ok(())
    }
}
