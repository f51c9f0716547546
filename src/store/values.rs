//! Value and valuation persistence. Free-standing values live in the
//! `"Values"` table under fresh VUIDs; list values store their elements
//! first and reference them by id, so deletion cascades through the same
//! structure. A valuation replace runs as one transaction on one
//! connection.

use std::sync::atomic::Ordering;

use tracing::debug;

use super::atoms::SqlRow;
use super::StoreInner;
use crate::codec::{float_array_literal, id_array_literal, parse_u64_array, string_array_literal};
use crate::driver::RecordRow;
use crate::error::{Result, StoreError};
use crate::model::{Handle, Value, ValueId, VALUE_TAG_FLOAT, VALUE_TAG_LIST, VALUE_TAG_STRING};
use crate::pool::Session;

impl StoreInner {
    fn take_vuid(&self) -> ValueId {
        self.next_vuid.fetch_add(1, Ordering::SeqCst)
    }

    fn push_value_columns(
        &self,
        session: &mut Session<'_>,
        row: &mut SqlRow,
        value: &Value,
    ) -> Result<()> {
        row.push("type", value.tag());
        match value {
            Value::Floats(xs) => row.push("floatvalue", float_array_literal(xs)),
            Value::Strings(xs) => row.push("stringvalue", string_array_literal(xs)),
            Value::List(items) => {
                let ids = items
                    .iter()
                    .map(|item| self.store_value_in(session, item))
                    .collect::<Result<Vec<_>>>()?;
                row.push("linkvalue", id_array_literal(&ids));
            }
        }
        Ok(())
    }

    /// Writes a free-standing value row, allocating its id. List elements
    /// are stored first, depth first.
    pub(crate) fn store_value_in(&self, session: &mut Session<'_>, value: &Value) -> Result<ValueId> {
        let vuid = self.take_vuid();
        let mut row = SqlRow::insert("\"Values\"");
        row.push("vuid", vuid);
        self.push_value_columns(session, &mut row, value)?;
        session.exec(&row.render_insert())?;
        Ok(vuid)
    }

    fn unpack_value_in(&self, session: &mut Session<'_>, row: &RecordRow<'_>) -> Result<Value> {
        let tag = row
            .require("type")?
            .parse::<u16>()
            .map_err(|_| StoreError::Schema("value type column is not a tag".into()))?;
        match tag {
            VALUE_TAG_FLOAT => Ok(Value::Floats(crate::codec::parse_f64_array(
                row.require("floatvalue")?,
            )?)),
            VALUE_TAG_STRING => Ok(Value::Strings(crate::codec::parse_string_array(
                row.require("stringvalue")?,
            )?)),
            VALUE_TAG_LIST => {
                let ids = parse_u64_array(row.require("linkvalue")?)?;
                let mut items = Vec::with_capacity(ids.len());
                for id in ids {
                    let item = self.get_value_in(session, id)?.ok_or_else(|| {
                        StoreError::Schema(format!("value row {id} referenced but missing"))
                    })?;
                    items.push(item);
                }
                Ok(Value::List(items))
            }
            other => Err(StoreError::Schema(format!("unknown value tag {other}"))),
        }
    }

    pub(crate) fn get_value_in(
        &self,
        session: &mut Session<'_>,
        vuid: ValueId,
    ) -> Result<Option<Value>> {
        let rows = session.exec(&format!("SELECT * FROM \"Values\" WHERE vuid = {vuid};"))?;
        match rows.first() {
            Some(row) => Ok(Some(self.unpack_value_in(session, &row)?)),
            None => Ok(None),
        }
    }

    /// Deletes a value row after deleting every row its list structure
    /// references. Missing rows are a no-op.
    pub(crate) fn delete_value_in(&self, session: &mut Session<'_>, vuid: ValueId) -> Result<()> {
        let rows = session.exec(&format!("SELECT * FROM \"Values\" WHERE vuid = {vuid};"))?;
        if let Some(row) = rows.first() {
            if let Some(text) = row.get("linkvalue") {
                for child in parse_u64_array(text)? {
                    self.delete_value_in(session, child)?;
                }
            }
        } else {
            return Ok(());
        }
        session.exec(&format!("DELETE FROM \"Values\" WHERE vuid = {vuid};"))?;
        Ok(())
    }

    /// Replaces the `(key, atom)` pair's value under a transaction, so a
    /// concurrent reader sees the old value or the new one, never neither.
    pub(crate) fn store_valuation(&self, key: &Handle, atom: &Handle, value: &Value) -> Result<()> {
        // The valuation row references both atoms; make sure their rows
        // exist before writing it.
        let key_id = self.resolve_eid(key)?;
        if !self.gate.is_known(key_id) {
            self.store_skeleton(key)?;
        }
        let atom_id = self.resolve_eid(atom)?;
        if !self.gate.is_known(atom_id) {
            self.store_skeleton(atom)?;
        }
        let mut session = self.pool.session();
        session.exec("BEGIN;")?;
        let outcome = self.store_valuation_tx(&mut session, key_id, atom_id, value);
        match outcome {
            Ok(()) => {
                session.exec("COMMIT;")?;
                Ok(())
            }
            Err(err) => {
                let _ = session.exec("ROLLBACK;");
                Err(err)
            }
        }
    }

    fn store_valuation_tx(
        &self,
        session: &mut Session<'_>,
        key_id: u64,
        atom_id: u64,
        value: &Value,
    ) -> Result<()> {
        self.delete_valuation_in(session, key_id, atom_id)?;
        let mut row = SqlRow::insert("Valuations");
        row.push("key", key_id);
        row.push("atom", atom_id);
        self.push_value_columns(session, &mut row, value)?;
        session.exec(&row.render_insert())?;
        Ok(())
    }

    /// Removes the pair's row if present, cascading through list contents
    /// so no orphan value rows accumulate.
    pub(crate) fn delete_valuation_in(
        &self,
        session: &mut Session<'_>,
        key_id: u64,
        atom_id: u64,
    ) -> Result<()> {
        let rows = session.exec(&format!(
            "SELECT * FROM Valuations WHERE key = {key_id} AND atom = {atom_id};"
        ))?;
        let Some(row) = rows.first() else {
            return Ok(());
        };
        if let Some(text) = row.get("linkvalue") {
            for child in parse_u64_array(text)? {
                self.delete_value_in(session, child)?;
            }
        }
        session.exec(&format!(
            "DELETE FROM Valuations WHERE key = {key_id} AND atom = {atom_id};"
        ))?;
        Ok(())
    }

    pub(crate) fn get_valuation(&self, key: &Handle, atom: &Handle) -> Result<Option<Value>> {
        let key_id = self.resolve_eid(key)?;
        let atom_id = self.resolve_eid(atom)?;
        let mut session = self.pool.session();
        let rows = session.exec(&format!(
            "SELECT * FROM Valuations WHERE key = {key_id} AND atom = {atom_id};"
        ))?;
        match rows.first() {
            Some(row) => Ok(Some(self.unpack_value_in(&mut session, &row)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn delete_valuation(&self, key: &Handle, atom: &Handle) -> Result<()> {
        let key_id = self.resolve_eid(key)?;
        let atom_id = self.resolve_eid(atom)?;
        let mut session = self.pool.session();
        session.exec("BEGIN;")?;
        match self.delete_valuation_in(&mut session, key_id, atom_id) {
            Ok(()) => {
                session.exec("COMMIT;")?;
                Ok(())
            }
            Err(err) => {
                let _ = session.exec("ROLLBACK;");
                Err(err)
            }
        }
    }

    /// Persists every value attached to the atom.
    pub(crate) fn store_atom_values(&self, h: &Handle) -> Result<()> {
        for (key, value) in h.values() {
            self.store_valuation(&key, h, &value)?;
        }
        Ok(())
    }

    /// Fetches every value stored against the atom and attaches it,
    /// materializing key atoms the local buffer does not know.
    pub(crate) fn fetch_atom_values(&self, h: &Handle) -> Result<()> {
        let atom_id = self.resolve_eid(h)?;
        let mut session = self.pool.session();
        let rows = session.exec(&format!(
            "SELECT * FROM Valuations WHERE atom = {atom_id};"
        ))?;
        for row in rows.iter() {
            let key_id = row.parse_u64("key")?;
            let value = self.unpack_value_in(&mut session, &row)?;
            let key = match self.idmap.lookup_id(key_id) {
                Some(k) => k,
                None => {
                    let pseudo = self.fetch_pseudo(key_id)?.ok_or_else(|| {
                        StoreError::Schema(format!("valuation key row {key_id} is missing"))
                    })?;
                    self.materialize(pseudo)?
                }
            };
            h.set_value(key, value);
        }
        debug!(atom_id, values = rows.len(), "store.values.fetched");
        Ok(())
    }
}
