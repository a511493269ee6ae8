//! SQLite transaction history.
//!
//! Every submitted rebalance leaves at least two rows behind:
//! - a `pending` row written after signing, before the first broadcast
//! - a terminal row (`confirmed`, `reverted`, `timed_out` or `dropped`)
//!   once the outcome is known
//!
//! Rows are never updated or deleted. The latest row per hash is the
//! transaction's current status.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::portfolio::RunId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Confirmed,
    Reverted,
    TimedOut,
    /// Signed but refused by the node on first broadcast; never sent
    Dropped,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Pending => "pending",
            TxStatus::Confirmed => "confirmed",
            TxStatus::Reverted => "reverted",
            TxStatus::TimedOut => "timed_out",
            TxStatus::Dropped => "dropped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TxStatus::Pending)
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TxStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TxStatus::Pending),
            "confirmed" => Ok(TxStatus::Confirmed),
            "reverted" => Ok(TxStatus::Reverted),
            "timed_out" => Ok(TxStatus::TimedOut),
            "dropped" => Ok(TxStatus::Dropped),
            other => Err(anyhow!("unknown transaction status {other}")),
        }
    }
}

/// One entry in the transaction history.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    pub run_id: RunId,
    pub hash: String,
    pub status: TxStatus,
    pub nonce: u64,
    /// Gas price in wei
    pub gas_price: u128,
    pub gas_used: Option<u64>,
    pub block_number: Option<u64>,
    pub submitted_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    /// Serialized rebalance plan
    pub plan: String,
}

impl TransactionRecord {
    /// Same transaction, new status.
    pub fn with_status(&self, status: TxStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }
}

/// Append-only store of rebalance transactions.
pub struct TransactionStore {
    conn: Mutex<Connection>,
}

const SELECT_COLUMNS: &str = "run_id, hash, status, nonce, gas_price, gas_used, block_number, \
                              submitted_at, confirmed_at, plan";

impl TransactionStore {
    /// Open (or create) the history database.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        info!("Transaction history initialized at {:?}", db_path.as_ref());
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER NOT NULL,
                hash TEXT NOT NULL,
                status TEXT NOT NULL,
                nonce INTEGER NOT NULL,
                gas_price TEXT NOT NULL,
                gas_used INTEGER,
                block_number INTEGER,
                submitted_at TEXT NOT NULL,
                confirmed_at TEXT,
                plan TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_transactions_hash ON transactions(hash);
            CREATE INDEX IF NOT EXISTS idx_transactions_run ON transactions(run_id);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("transaction history lock poisoned"))
    }

    /// Append a record. Existing rows are never touched.
    pub fn append(&self, record: &TransactionRecord) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO transactions (run_id, hash, status, nonce, gas_price, gas_used,
                                      block_number, submitted_at, confirmed_at, plan, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                record.run_id.0,
                record.hash,
                record.status.as_str(),
                record.nonce,
                record.gas_price.to_string(),
                record.gas_used,
                record.block_number,
                record.submitted_at.to_rfc3339(),
                record.confirmed_at.map(|t| t.to_rfc3339()),
                record.plan,
                Utc::now().to_rfc3339(),
            ],
        )?;

        debug!(hash = %record.hash, status = %record.status, "Transaction recorded");
        Ok(())
    }

    /// Most recent records first, at most `limit` rows.
    pub fn recent(&self, limit: usize) -> Result<Vec<TransactionRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM transactions ORDER BY id DESC LIMIT ?1"
        ))?;

        let records = stmt
            .query_map([limit], read_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Latest record for a transaction hash.
    pub fn latest(&self, hash: &str) -> Result<Option<TransactionRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM transactions WHERE hash = ?1 ORDER BY id DESC LIMIT 1"
                ),
                [hash],
                read_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Transactions whose latest record is still `pending`, oldest first.
    pub fn unresolved(&self) -> Result<Vec<TransactionRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM transactions t
            WHERE t.id = (SELECT MAX(id) FROM transactions WHERE hash = t.hash)
              AND t.status = 'pending'
            ORDER BY t.id
            "#
        ))?;

        let records = stmt
            .query_map([], read_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn count(&self) -> Result<u64> {
        let count: u64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn conversion_error(
    index: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(err))
}

fn parse_time(index: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(index, e))
}

fn read_record(row: &Row<'_>) -> rusqlite::Result<TransactionRecord> {
    let status: String = row.get(2)?;
    let gas_price: String = row.get(4)?;
    let submitted_at: String = row.get(7)?;
    let confirmed_at: Option<String> = row.get(8)?;

    Ok(TransactionRecord {
        run_id: RunId(row.get(0)?),
        hash: row.get(1)?,
        status: TxStatus::from_str(&status)
            .map_err(|e| conversion_error(2, std::io::Error::other(e.to_string())))?,
        nonce: row.get(3)?,
        gas_price: gas_price.parse().map_err(|e| conversion_error(4, e))?,
        gas_used: row.get(5)?,
        block_number: row.get(6)?,
        submitted_at: parse_time(7, &submitted_at)?,
        confirmed_at: confirmed_at.map(|t| parse_time(8, &t)).transpose()?,
        plan: row.get(9)?,
    })
}
