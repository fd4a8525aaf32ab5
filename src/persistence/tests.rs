use tempfile::tempdir;

use super::{RemoteTxnState, TxnLog};
use crate::broker::message::{BrokerAddress, ConsumerId, SysMessageId, TransactionId};

#[test]
fn test_log_and_get_prepared() {
    let log = TxnLog::temporary().unwrap();
    let entries = vec![(SysMessageId::new(), ConsumerId(7))];

    let record = log
        .log_prepared(TransactionId(1), Some(BrokerAddress::new("b1")), entries.clone())
        .unwrap();
    assert_eq!(record.state, RemoteTxnState::Prepared);

    let loaded = log.get(TransactionId(1)).unwrap().expect("record exists");
    assert_eq!(loaded.entries, entries);
    assert_eq!(loaded.home, Some(BrokerAddress::new("b1")));
    assert!(log.get(TransactionId(2)).unwrap().is_none());
}

#[test]
fn test_update_and_remove() {
    let log = TxnLog::temporary().unwrap();
    log.log_prepared(TransactionId(3), None, Vec::new()).unwrap();

    let updated = log
        .update_state(TransactionId(3), RemoteTxnState::Committed)
        .unwrap()
        .expect("record exists");
    assert_eq!(updated.state, RemoteTxnState::Committed);
    assert!(log.update_state(TransactionId(9), RemoteTxnState::Committed).unwrap().is_none());

    assert!(log.remove(TransactionId(3)).unwrap().is_some());
    assert!(log.remove(TransactionId(3)).unwrap().is_none());
    assert!(log.is_empty());
}

#[test]
fn test_prepared_older_than() {
    let log = TxnLog::temporary().unwrap();
    log.log_prepared(TransactionId(1), None, Vec::new()).unwrap();
    log.log_prepared(TransactionId(2), None, Vec::new()).unwrap();
    log.update_state(TransactionId(2), RemoteTxnState::RolledBack).unwrap();

    assert_eq!(log.prepared_older_than(0).unwrap(), vec![TransactionId(1)]);
    assert!(log.prepared_older_than(60_000).unwrap().is_empty());
}

#[test]
fn test_open_on_disk_and_list_records() {
    let dir = tempdir().unwrap();
    let log = TxnLog::open(dir.path()).unwrap();
    log.log_prepared(TransactionId(42), None, vec![(SysMessageId::new(), ConsumerId(1))])
        .unwrap();
    log.log_prepared(TransactionId(7), None, Vec::new()).unwrap();
    log.flush().unwrap();

    let txns: Vec<_> = log.records().unwrap().into_iter().map(|r| r.txn).collect();
    assert_eq!(txns, vec![TransactionId(7), TransactionId(42)]);
}

#[test]
fn test_purge_finished_keeps_prepared() {
    let log = TxnLog::temporary().unwrap();
    log.log_prepared(TransactionId(1), None, Vec::new()).unwrap();
    log.log_prepared(TransactionId(2), None, Vec::new()).unwrap();
    log.update_state(TransactionId(2), RemoteTxnState::Committed).unwrap();

    assert_eq!(log.purge_finished_older_than(60_000).unwrap(), 0);
    assert_eq!(log.purge_finished_older_than(0).unwrap(), 1);
    assert_eq!(log.len(), 1);
    assert!(log.get(TransactionId(1)).unwrap().is_some());
}
