//! In-process recording datasources for integration tests.
//!
//! Every physical operation is appended to a shared [`Journal`] as
//! `"<connection>:<op>"`, where connections are named after their datasource
//! plus an open counter (`a1`, `a2`, ...).

#![allow(dead_code)]

use async_trait::async_trait;
use dynamic_datasource::config::RoutingOptions;
use dynamic_datasource::db::{DataSource, PhysicalConnection};
use dynamic_datasource::models::QueryParam;
use dynamic_datasource::{DbError, DbResult, DynamicDataSource};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    fn record(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == entry).count()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.count(entry) > 0
    }

    /// Position of the first occurrence of `entry`.
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.0.lock().unwrap().iter().position(|e| e == entry)
    }

    /// Entries whose operation is `op`, for any connection.
    pub fn ops(&self, op: &str) -> Vec<String> {
        let suffix = format!(":{op}");
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.ends_with(&suffix))
            .cloned()
            .collect()
    }
}

pub struct MockDataSource {
    name: String,
    journal: Journal,
    opened: AtomicUsize,
    pub fail_connect: AtomicBool,
    pub fail_commit: AtomicBool,
    pub fail_rollback: AtomicBool,
    pub fail_execute: AtomicBool,
    pub fail_close: AtomicBool,
}

impl MockDataSource {
    pub fn new(name: &str, journal: &Journal) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            journal: journal.clone(),
            opened: AtomicUsize::new(0),
            fail_connect: AtomicBool::new(false),
            fail_commit: AtomicBool::new(false),
            fail_rollback: AtomicBool::new(false),
            fail_execute: AtomicBool::new(false),
            fail_close: AtomicBool::new(false),
        })
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataSource for MockDataSource {
    async fn connect(&self) -> DbResult<Box<dyn PhysicalConnection>> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(DbError::connection(
                format!("{} refused the connection", self.name),
                "Start the server",
            ));
        }
        let n = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(MockConnection {
            name: format!("{}{}", self.name, n),
            journal: self.journal.clone(),
            fail_commit: self.fail_commit.load(Ordering::SeqCst),
            fail_rollback: self.fail_rollback.load(Ordering::SeqCst),
            fail_execute: self.fail_execute.load(Ordering::SeqCst),
            fail_close: self.fail_close.load(Ordering::SeqCst),
            closed: false,
        }))
    }
}

struct MockConnection {
    name: String,
    journal: Journal,
    fail_commit: bool,
    fail_rollback: bool,
    fail_execute: bool,
    fail_close: bool,
    closed: bool,
}

impl MockConnection {
    fn record(&self, op: &str) -> DbResult<()> {
        if self.closed {
            return Err(DbError::connection("Connection is closed", "Acquire a new connection"));
        }
        self.journal.record(format!("{}:{}", self.name, op));
        Ok(())
    }
}

#[async_trait]
impl PhysicalConnection for MockConnection {
    async fn begin(&mut self) -> DbResult<()> {
        self.record("begin")
    }

    async fn execute(&mut self, sql: &str, _params: &[QueryParam]) -> DbResult<u64> {
        self.record(&format!("exec {sql}"))?;
        if self.fail_execute {
            return Err(DbError::database(
                format!("{} rejected the statement", self.name),
                None,
                "Check the SQL",
            ));
        }
        Ok(1)
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.record("commit")?;
        if self.fail_commit {
            return Err(DbError::database(
                format!("{} commit failed", self.name),
                None,
                "Retry the transaction",
            ));
        }
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.record("rollback")?;
        if self.fail_rollback {
            return Err(DbError::database(
                format!("{} rollback failed", self.name),
                None,
                "Check the server",
            ));
        }
        Ok(())
    }

    async fn savepoint(&mut self, _name: &str) -> DbResult<()> {
        self.record("savepoint")
    }

    async fn release_savepoint(&mut self, _name: &str) -> DbResult<()> {
        self.record("release")
    }

    async fn rollback_to_savepoint(&mut self, _name: &str) -> DbResult<()> {
        self.record("rollback_to")
    }

    async fn close(&mut self) -> DbResult<()> {
        self.record("close")?;
        self.closed = true;
        if self.fail_close {
            return Err(DbError::connection(
                format!("{} failed to close", self.name),
                "Check the server",
            ));
        }
        Ok(())
    }
}

/// A lenient routing setup with the given datasources registered.
pub async fn setup(names: &[&str]) -> (DynamicDataSource, Journal, Vec<Arc<MockDataSource>>) {
    let journal = Journal::default();
    let dynamic = DynamicDataSource::new(RoutingOptions::default());
    let mut sources = Vec::new();
    for name in names {
        let source = MockDataSource::new(name, &journal);
        dynamic.register(*name, source.clone()).await.unwrap();
        sources.push(source);
    }
    (dynamic, journal, sources)
}

/// Execute `sql` on the current connection for `key`.
pub async fn exec_on(dynamic: &DynamicDataSource, key: &str, sql: &str) -> DbResult<u64> {
    dynamic.with_key(key, dynamic.execute(sql, &[])).await
}
