//! Remote transaction log backed by `sled`
//!
//! When a peer prepares a two-phase transaction that acknowledges messages
//! owned by this broker, the prepared state must survive a restart until the
//! peer commits or rolls back. Records live in the `remote_txns` tree, keyed
//! by the big-endian transaction id so iteration is ordered by id.

use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

use crate::broker::message::{BrokerAddress, ConsumerId, SysMessageId, TransactionId};
use crate::utils::Result;

const REMOTE_TXN_TREE: &str = "remote_txns";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RemoteTxnState {
    Prepared,
    Committed,
    RolledBack,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RemoteTxnRecord {
    pub txn: TransactionId,
    /// Broker coordinating the transaction.
    pub home: Option<BrokerAddress>,
    pub state: RemoteTxnState,
    pub entries: Vec<(SysMessageId, ConsumerId)>,
    pub prepared_at: i64,
    pub updated_at: i64,
}

#[derive(Clone)]
pub struct TxnLog {
    db: Db,
    tree: Tree,
}

impl TxnLog {
    /// Open or create the log at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Self::with_db(db)
    }

    /// A log that is deleted when dropped.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::with_db(db)
    }

    fn with_db(db: Db) -> Result<Self> {
        let tree = db.open_tree(REMOTE_TXN_TREE)?;
        Ok(Self { db, tree })
    }

    fn key(txn: TransactionId) -> [u8; 8] {
        txn.0.to_be_bytes()
    }

    fn write(&self, record: &RemoteTxnRecord) -> Result<()> {
        let value = serde_json::to_vec(record)?;
        self.tree.insert(Self::key(record.txn), value)?;
        Ok(())
    }

    /// Record `txn` as prepared. Re-logging an existing transaction replaces
    /// its entries but keeps the original prepare time.
    pub fn log_prepared(
        &self,
        txn: TransactionId,
        home: Option<BrokerAddress>,
        entries: Vec<(SysMessageId, ConsumerId)>,
    ) -> Result<RemoteTxnRecord> {
        let now = Utc::now().timestamp_millis();
        let prepared_at = self.get(txn)?.map(|r| r.prepared_at).unwrap_or(now);
        let record = RemoteTxnRecord {
            txn,
            home,
            state: RemoteTxnState::Prepared,
            entries,
            prepared_at,
            updated_at: now,
        };
        self.write(&record)?;
        self.tree.flush()?;
        Ok(record)
    }

    pub fn get(&self, txn: TransactionId) -> Result<Option<RemoteTxnRecord>> {
        match self.tree.get(Self::key(txn))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    pub fn update_state(
        &self,
        txn: TransactionId,
        state: RemoteTxnState,
    ) -> Result<Option<RemoteTxnRecord>> {
        let Some(mut record) = self.get(txn)? else {
            return Ok(None);
        };
        record.state = state;
        record.updated_at = Utc::now().timestamp_millis();
        self.write(&record)?;
        Ok(Some(record))
    }

    pub fn remove(&self, txn: TransactionId) -> Result<Option<RemoteTxnRecord>> {
        match self.tree.remove(Self::key(txn))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Transactions still prepared after `age_ms` milliseconds.
    pub fn prepared_older_than(&self, age_ms: i64) -> Result<Vec<TransactionId>> {
        let cutoff = Utc::now().timestamp_millis() - age_ms;
        let mut txns = Vec::new();
        for entry in self.tree.iter() {
            let (_, value) = entry?;
            let record: RemoteTxnRecord = serde_json::from_slice(&value)?;
            if record.state == RemoteTxnState::Prepared && record.prepared_at <= cutoff {
                txns.push(record.txn);
            }
        }
        Ok(txns)
    }

    /// Drop committed or rolled back records last touched more than `age_ms`
    /// milliseconds ago. Returns how many were removed.
    pub fn purge_finished_older_than(&self, age_ms: i64) -> Result<usize> {
        let cutoff = Utc::now().timestamp_millis() - age_ms;
        let mut purged = 0;
        for record in self.records()? {
            if record.state != RemoteTxnState::Prepared && record.updated_at <= cutoff {
                self.tree.remove(Self::key(record.txn))?;
                purged += 1;
            }
        }
        Ok(purged)
    }

    /// Every record, ordered by transaction id.
    pub fn records(&self) -> Result<Vec<RemoteTxnRecord>> {
        self.tree
            .iter()
            .map(|entry| -> Result<RemoteTxnRecord> {
                let (_, value) = entry?;
                Ok(serde_json::from_slice(&value)?)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for TxnLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnLog")
            .field("db", &"sled::Db")
            .field("records", &self.tree.len())
            .finish()
    }
}
