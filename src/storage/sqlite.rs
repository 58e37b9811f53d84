//! SQLite-backed `LocalStore` using rusqlite (bundled).
//!
//! Records are stored as JSON text, one row per bill/payment, with the
//! change log and checkpoint in their own tables. The connection sits
//! behind a `parking_lot::ReentrantMutex<RefCell<Connection>>` so
//! multi-statement writes can hold the lock across a transaction.

use std::cell::RefCell;

use parking_lot::ReentrantMutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::changelog::{ChangeLogEntry, EntityKind, EntryKey, Operation};
use crate::error::StorageError;
use crate::types::{Bill, EntityId, Payment};

use super::traits::LocalStore;

const CHECKPOINT_KEY: &str = "sync:server_time";

/// Client refs are UUIDs and never parse as integers, so the two id forms
/// share one TEXT column without ambiguity.
fn id_to_text(id: &EntityId) -> String {
    id.to_string()
}

fn id_from_text(raw: &str) -> EntityId {
    match raw.parse::<i64>() {
        Ok(n) => EntityId::Server(n),
        Err(_) => EntityId::Client(raw.to_string()),
    }
}

pub struct SqliteStore {
    conn: ReentrantMutex<RefCell<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// In-memory database, useful for tests.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=5000;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS bills (
                id   TEXT PRIMARY KEY,
                data TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS payments (
                id      TEXT PRIMARY KEY,
                bill_id TEXT NOT NULL,
                data    TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_payments_bill ON payments(bill_id);
            CREATE TABLE IF NOT EXISTS changelog (
                local_timestamp INTEGER PRIMARY KEY,
                entity          TEXT NOT NULL,
                key             TEXT NOT NULL,
                op              TEXT NOT NULL,
                payload         TEXT NOT NULL,
                prior           TEXT
            );
            CREATE TABLE IF NOT EXISTS meta (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;

        tracing::debug!("sqlite store initialized");
        Ok(Self {
            conn: ReentrantMutex::new(RefCell::new(conn)),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Connection) -> Result<T, StorageError>,
    {
        let guard = self.conn.lock();
        let conn = guard.borrow();
        f(&conn)
    }
}

fn decode<T: serde::de::DeserializeOwned>(
    entity: &'static str,
    id: &str,
    raw: &str,
) -> Result<T, StorageError> {
    serde_json::from_str(raw).map_err(|e| StorageError::Corruption {
        entity,
        id: id.to_string(),
        message: e.to_string(),
    })
}

impl LocalStore for SqliteStore {
    fn get_bill(&self, id: &EntityId) -> Result<Option<Bill>, StorageError> {
        self.with_conn(|conn| {
            let row: Option<String> = conn
                .prepare_cached("SELECT data FROM bills WHERE id = ?1")?
                .query_row(params![id_to_text(id)], |r| r.get(0))
                .optional()?;
            row.map(|data| decode("bill", &id_to_text(id), &data)).transpose()
        })
    }

    fn put_bill(&self, bill: &Bill) -> Result<(), StorageError> {
        let data = serde_json::to_string(bill)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO bills (id, data) VALUES (?1, ?2)",
                params![id_to_text(&bill.id), data],
            )?;
            Ok(())
        })
    }

    fn remove_bill(&self, id: &EntityId) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM bills WHERE id = ?1", params![id_to_text(id)])?;
            Ok(())
        })
    }

    fn list_bills(&self) -> Result<Vec<Bill>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached("SELECT id, data FROM bills")?;
            let rows = stmt.query_map([], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?;
            let mut bills = Vec::new();
            for row in rows {
                let (id, data) = row?;
                bills.push(decode::<Bill>("bill", &id, &data)?);
            }
            bills.sort_by(|a, b| a.next_due.cmp(&b.next_due));
            Ok(bills)
        })
    }

    fn get_payment(&self, id: &EntityId) -> Result<Option<Payment>, StorageError> {
        self.with_conn(|conn| {
            let row: Option<String> = conn
                .prepare_cached("SELECT data FROM payments WHERE id = ?1")?
                .query_row(params![id_to_text(id)], |r| r.get(0))
                .optional()?;
            row.map(|data| decode("payment", &id_to_text(id), &data))
                .transpose()
        })
    }

    fn put_payment(&self, payment: &Payment) -> Result<(), StorageError> {
        let data = serde_json::to_string(payment)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO payments (id, bill_id, data) VALUES (?1, ?2, ?3)",
                params![
                    id_to_text(&payment.id),
                    id_to_text(&payment.bill_id),
                    data
                ],
            )?;
            Ok(())
        })
    }

    fn remove_payment(&self, id: &EntityId) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM payments WHERE id = ?1", params![id_to_text(id)])?;
            Ok(())
        })
    }

    fn list_payments(&self) -> Result<Vec<Payment>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached("SELECT id, data FROM payments")?;
            let rows = stmt.query_map([], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?;
            let mut payments = Vec::new();
            for row in rows {
                let (id, data) = row?;
                payments.push(decode::<Payment>("payment", &id, &data)?);
            }
            payments.sort_by(|a, b| a.payment_date.cmp(&b.payment_date));
            Ok(payments)
        })
    }

    fn replace_all(
        &self,
        bills: &[Bill],
        payments: &[Payment],
        keep: &[EntryKey],
    ) -> Result<(), StorageError> {
        let kept = |kind: EntityKind, id: &EntityId| {
            keep.iter().any(|(k, kid)| *k == kind && kid == id)
        };

        let guard = self.conn.lock();
        let mut conn = guard.borrow_mut();
        let tx = conn.transaction()?;

        // Drop everything without pending local changes, then load the
        // authoritative set, again skipping records with pending changes.
        {
            let mut existing: Vec<String> = Vec::new();
            let mut stmt = tx.prepare("SELECT id FROM bills")?;
            for row in stmt.query_map([], |r| r.get::<_, String>(0))? {
                existing.push(row?);
            }
            drop(stmt);
            for id in existing {
                if !kept(EntityKind::Bill, &id_from_text(&id)) {
                    tx.execute("DELETE FROM bills WHERE id = ?1", params![id])?;
                }
            }
            for bill in bills {
                if !kept(EntityKind::Bill, &bill.id) {
                    let data = serde_json::to_string(bill)?;
                    tx.execute(
                        "INSERT OR REPLACE INTO bills (id, data) VALUES (?1, ?2)",
                        params![id_to_text(&bill.id), data],
                    )?;
                }
            }

            let mut existing: Vec<String> = Vec::new();
            let mut stmt = tx.prepare("SELECT id FROM payments")?;
            for row in stmt.query_map([], |r| r.get::<_, String>(0))? {
                existing.push(row?);
            }
            drop(stmt);
            for id in existing {
                if !kept(EntityKind::Payment, &id_from_text(&id)) {
                    tx.execute("DELETE FROM payments WHERE id = ?1", params![id])?;
                }
            }
            for payment in payments {
                if !kept(EntityKind::Payment, &payment.id) {
                    let data = serde_json::to_string(payment)?;
                    tx.execute(
                        "INSERT OR REPLACE INTO payments (id, bill_id, data) VALUES (?1, ?2, ?3)",
                        params![
                            id_to_text(&payment.id),
                            id_to_text(&payment.bill_id),
                            data
                        ],
                    )?;
                }
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn load_changelog(&self) -> Result<Vec<ChangeLogEntry>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT local_timestamp, entity, key, op, payload, prior \
                 FROM changelog ORDER BY local_timestamp",
            )?;
            let rows = stmt.query_map([], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, Option<String>>(5)?,
                ))
            })?;

            let mut entries = Vec::new();
            for row in rows {
                let (ts, entity, key, op, payload, prior) = row?;
                let entity = match entity.as_str() {
                    "bill" => EntityKind::Bill,
                    "payment" => EntityKind::Payment,
                    other => {
                        return Err(StorageError::Corruption {
                            entity: "changelog",
                            id: key,
                            message: format!("unknown entity kind \"{other}\""),
                        })
                    }
                };
                let op = match op.as_str() {
                    "create" => Operation::Create,
                    "update" => Operation::Update,
                    "delete" => Operation::Delete,
                    other => {
                        return Err(StorageError::Corruption {
                            entity: "changelog",
                            id: key,
                            message: format!("unknown operation \"{other}\""),
                        })
                    }
                };
                let payload: Value = decode("changelog", &key, &payload)?;
                let prior: Option<Value> =
                    prior.map(|p| decode("changelog", &key, &p)).transpose()?;
                entries.push(ChangeLogEntry {
                    entity,
                    key: id_from_text(&key),
                    op,
                    payload,
                    prior,
                    local_timestamp: ts as u64,
                });
            }
            Ok(entries)
        })
    }

    fn save_changelog(&self, entries: &[ChangeLogEntry]) -> Result<(), StorageError> {
        let guard = self.conn.lock();
        let mut conn = guard.borrow_mut();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM changelog", [])?;
        for e in entries {
            let op = match e.op {
                Operation::Create => "create",
                Operation::Update => "update",
                Operation::Delete => "delete",
            };
            let prior = e.prior.as_ref().map(serde_json::to_string).transpose()?;
            tx.execute(
                "INSERT INTO changelog (local_timestamp, entity, key, op, payload, prior) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    e.local_timestamp as i64,
                    e.entity.as_str(),
                    id_to_text(&e.key),
                    op,
                    serde_json::to_string(&e.payload)?,
                    prior,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn checkpoint(&self) -> Result<Option<String>, StorageError> {
        self.with_conn(|conn| {
            Ok(conn
                .prepare_cached("SELECT value FROM meta WHERE key = ?1")?
                .query_row(params![CHECKPOINT_KEY], |r| r.get(0))
                .optional()?)
        })
    }

    fn set_checkpoint(&self, server_time: &str) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
                params![CHECKPOINT_KEY, server_time],
            )?;
            Ok(())
        })
    }
}
