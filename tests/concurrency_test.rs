//! Independent logical transactions running concurrently on a multi-threaded runtime.

mod common;

use common::{exec_on, setup};
use dynamic_datasource::context;
use dynamic_datasource::{DbError, DbResult, Propagation, TxOptions};
use std::collections::HashSet;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_transactions_are_isolated() {
    let (dynamic, journal, _) = setup(&["a", "b"]).await;

    let mut handles = Vec::new();
    for i in 0..24 {
        let dynamic = dynamic.clone();
        handles.push(tokio::spawn(context::scope(async move {
            let fail = i % 3 == 0;
            let result: DbResult<String> = dynamic
                .transactional(&TxOptions::new(Propagation::Required), async {
                    let xid = dynamic.coordinator().current_xid().unwrap();
                    exec_on(&dynamic, "a", &format!("task {i}")).await?;
                    tokio::task::yield_now().await;
                    exec_on(&dynamic, "b", &format!("task {i}")).await?;
                    assert_eq!(dynamic.coordinator().current_xid(), Some(xid.clone()));
                    assert_eq!(dynamic.registry().keys(&xid).await, vec!["a", "b"]);
                    if fail {
                        return Err(DbError::internal(format!("task {i} failed")));
                    }
                    Ok(xid)
                })
                .await;
            assert_eq!(context::depth(), 0);
            (fail, result)
        })));
    }

    let mut xids = HashSet::new();
    let mut committed = 0;
    for handle in handles {
        let (fail, result) = handle.await.unwrap();
        if fail {
            assert!(result.is_err());
        } else {
            assert!(xids.insert(result.unwrap()));
            committed += 1;
        }
    }

    assert_eq!(committed, 16);
    assert_eq!(journal.ops("commit").len(), 32);
    assert_eq!(journal.ops("rollback").len(), 16);
    assert_eq!(journal.ops("close").len(), 48);
    assert_eq!(dynamic.registry().count().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_selection_is_per_task() {
    let (dynamic, _journal, _) = setup(&["a", "b"]).await;

    let mut handles = Vec::new();
    for i in 0..16 {
        let dynamic = dynamic.clone();
        let key = if i % 2 == 0 { "a" } else { "b" };
        handles.push(tokio::spawn(context::scope(async move {
            dynamic
                .with_key(key, async {
                    for _ in 0..5 {
                        tokio::task::yield_now().await;
                        assert_eq!(dynamic.current_key(), key);
                    }
                })
                .await;
            dynamic.current_key()
        })));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap(), "primary");
    }
}
