//! Temporary table tracking
//!
//! Temporary tables exist only on the connection that created them, which is
//! always the master. Reads from them must therefore go to the master too.

use std::collections::HashSet;

use crate::classifier::{Classification, QueryType};

/// Temporary tables created in one session, keyed by `db.table`
#[derive(Debug, Default)]
pub struct TempTables {
    tables: HashSet<String>,
    /// A temporary table was created at some point; never cleared
    have_tmp_tables: bool,
}

impl TempTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Qualify `table` with `db` unless it already names a database
    pub fn qualify(db: &str, table: &str) -> String {
        if table.contains('.') {
            table.to_string()
        } else {
            format!("{}.{}", db, table)
        }
    }

    pub fn have_tmp_tables(&self) -> bool {
        self.have_tmp_tables
    }

    pub fn contains(&self, db: &str, table: &str) -> bool {
        self.tables.contains(&Self::qualify(db, table))
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Record the table of a `CREATE TEMPORARY TABLE`
    pub fn check_create(&mut self, db: &str, classification: &Classification) {
        if !classification.query_type.contains(QueryType::CREATE_TMP_TABLE) {
            return;
        }
        let Some(table) = classification.created_table.as_deref() else {
            return;
        };
        let key = Self::qualify(db, table);
        tracing::debug!("Added temporary table {}", key);
        self.tables.insert(key);
        self.have_tmp_tables = true;
    }

    /// Forget every table a `DROP TABLE` names
    pub fn check_drop(&mut self, db: &str, classification: &Classification) {
        if !self.have_tmp_tables || !classification.is_drop_table() {
            return;
        }
        for table in &classification.tables {
            if self.tables.remove(&Self::qualify(db, table)) {
                tracing::debug!("Temporary table {} dropped", Self::qualify(db, table));
            }
        }
    }

    /// The statement reads at least one known temporary table
    pub fn is_read_tmp_table(&self, db: &str, classification: &Classification) -> bool {
        if !self.have_tmp_tables {
            return false;
        }
        classification.query_type.is_any_read()
            && classification.tables.iter().any(|table| {
                let found = self.contains(db, table);
                if found {
                    tracing::debug!("Query targets a temporary table: {}", Self::qualify(db, table));
                }
                found
            })
    }
}
