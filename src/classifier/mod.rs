//! Query Classification
//!
//! The router never parses SQL itself. It asks a [`QueryClassifier`] what a
//! statement does and gets back a [`Classification`]: a [`QueryType`] bit set
//! plus the tables, database and operation the statement touches.
//!
//! Several type bits can be set at once (`SELECT @a := 1` is both a read and
//! a user variable write), and the routing rules depend on the combinations,
//! so the type is a bit set rather than a plain enum.

mod keyword;
mod scan;

pub use keyword::KeywordClassifier;
pub use scan::{contains_multiple_statements, find_unescaped, is_sp_end, is_statement_end, strip_leading_comments};

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Bit set describing what a statement does
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct QueryType(u32);

impl QueryType {
    /// Nothing is known about the statement
    pub const UNKNOWN: QueryType = QueryType(0);
    /// Reads no data from tables
    pub const LOCAL_READ: QueryType = QueryType(0x0000_0001);
    /// Reads table data
    pub const READ: QueryType = QueryType(0x0000_0002);
    /// Modifies data or schema
    pub const WRITE: QueryType = QueryType(0x0000_0004);
    /// Read that has to be served by the master
    pub const MASTER_READ: QueryType = QueryType(0x0000_0008);
    /// Changes session state, must run on every backend
    pub const SESSION_WRITE: QueryType = QueryType(0x0000_0010);
    /// Writes a user variable
    pub const USERVAR_WRITE: QueryType = QueryType(0x0000_0020);
    /// Reads a user variable
    pub const USERVAR_READ: QueryType = QueryType(0x0000_0040);
    /// Reads a session system variable
    pub const SYSVAR_READ: QueryType = QueryType(0x0000_0080);
    /// Writes a session system variable
    pub const SYSVAR_WRITE: QueryType = QueryType(0x0000_0100);
    /// Reads a global system variable
    pub const GSYSVAR_READ: QueryType = QueryType(0x0000_0200);
    /// Writes a global system variable
    pub const GSYSVAR_WRITE: QueryType = QueryType(0x0000_0400);
    /// Starts a transaction
    pub const BEGIN_TRX: QueryType = QueryType(0x0000_0800);
    /// Enables autocommit
    pub const ENABLE_AUTOCOMMIT: QueryType = QueryType(0x0000_1000);
    /// Disables autocommit
    pub const DISABLE_AUTOCOMMIT: QueryType = QueryType(0x0000_2000);
    /// Rolls back a transaction
    pub const ROLLBACK: QueryType = QueryType(0x0000_4000);
    /// Commits a transaction
    pub const COMMIT: QueryType = QueryType(0x0000_8000);
    /// Text protocol `PREPARE name FROM ...`
    pub const PREPARE_NAMED_STMT: QueryType = QueryType(0x0001_0000);
    /// Binary protocol COM_STMT_PREPARE
    pub const PREPARE_STMT: QueryType = QueryType(0x0002_0000);
    /// Executes a prepared statement
    pub const EXEC_STMT: QueryType = QueryType(0x0004_0000);
    /// `CREATE TEMPORARY TABLE`
    pub const CREATE_TMP_TABLE: QueryType = QueryType(0x0008_0000);
    /// Reads a temporary table
    pub const READ_TMP_TABLE: QueryType = QueryType(0x0010_0000);
    /// `SHOW DATABASES`
    pub const SHOW_DATABASES: QueryType = QueryType(0x0020_0000);
    /// `SHOW TABLES`
    pub const SHOW_TABLES: QueryType = QueryType(0x0040_0000);
    /// The started transaction is `READ ONLY`
    pub const READ_ONLY_TRX: QueryType = QueryType(0x0080_0000);

    const NAMES: [(QueryType, &'static str); 24] = [
        (Self::LOCAL_READ, "LOCAL_READ"),
        (Self::READ, "READ"),
        (Self::WRITE, "WRITE"),
        (Self::MASTER_READ, "MASTER_READ"),
        (Self::SESSION_WRITE, "SESSION_WRITE"),
        (Self::USERVAR_WRITE, "USERVAR_WRITE"),
        (Self::USERVAR_READ, "USERVAR_READ"),
        (Self::SYSVAR_READ, "SYSVAR_READ"),
        (Self::SYSVAR_WRITE, "SYSVAR_WRITE"),
        (Self::GSYSVAR_READ, "GSYSVAR_READ"),
        (Self::GSYSVAR_WRITE, "GSYSVAR_WRITE"),
        (Self::BEGIN_TRX, "BEGIN_TRX"),
        (Self::ENABLE_AUTOCOMMIT, "ENABLE_AUTOCOMMIT"),
        (Self::DISABLE_AUTOCOMMIT, "DISABLE_AUTOCOMMIT"),
        (Self::ROLLBACK, "ROLLBACK"),
        (Self::COMMIT, "COMMIT"),
        (Self::PREPARE_NAMED_STMT, "PREPARE_NAMED_STMT"),
        (Self::PREPARE_STMT, "PREPARE_STMT"),
        (Self::EXEC_STMT, "EXEC_STMT"),
        (Self::CREATE_TMP_TABLE, "CREATE_TMP_TABLE"),
        (Self::READ_TMP_TABLE, "READ_TMP_TABLE"),
        (Self::SHOW_DATABASES, "SHOW_DATABASES"),
        (Self::SHOW_TABLES, "SHOW_TABLES"),
        (Self::READ_ONLY_TRX, "READ_ONLY_TRX"),
    ];

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        QueryType(bits)
    }

    pub const fn is_unknown(self) -> bool {
        self.0 == 0
    }

    /// True if every bit of `other` is set
    pub const fn contains(self, other: QueryType) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    /// True if any bit of `other` is set
    pub const fn intersects(self, other: QueryType) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: QueryType) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: QueryType) {
        self.0 &= !other.0;
    }

    /// Any of the read bits that make a statement eligible for a temp table check
    pub const fn is_any_read(self) -> bool {
        self.intersects(QueryType(
            Self::READ.0 | Self::LOCAL_READ.0 | Self::USERVAR_READ.0 | Self::SYSVAR_READ.0 | Self::GSYSVAR_READ.0,
        ))
    }
}

impl BitOr for QueryType {
    type Output = QueryType;

    fn bitor(self, rhs: QueryType) -> QueryType {
        QueryType(self.0 | rhs.0)
    }
}

impl BitOrAssign for QueryType {
    fn bitor_assign(&mut self, rhs: QueryType) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for QueryType {
    type Output = QueryType;

    fn bitand(self, rhs: QueryType) -> QueryType {
        QueryType(self.0 & rhs.0)
    }
}

impl fmt::Debug for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            return write!(f, "UNKNOWN");
        }
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", names.join("|"))
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Main operation of a statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryOperation {
    #[default]
    Undefined,
    Select,
    Update,
    Insert,
    Delete,
    Truncate,
    Alter,
    Create,
    Drop,
    ChangeDb,
    Load,
    Grant,
    Revoke,
    Call,
    Set,
    Show,
    Explain,
    Execute,
}

/// What the classifier found out about a statement
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    /// Type bits
    pub query_type: QueryType,
    /// Main operation
    pub operation: QueryOperation,
    /// More than one statement in the buffer
    pub is_multi_statement: bool,
    /// Tables the statement reads or drops, as written (possibly `db.table`)
    pub tables: Vec<String>,
    /// Table created by `CREATE [TEMPORARY] TABLE`
    pub created_table: Option<String>,
    /// Database selected by `USE`
    pub database: Option<String>,
}

impl Classification {
    pub fn new(query_type: QueryType, operation: QueryOperation) -> Self {
        Self {
            query_type,
            operation,
            ..Default::default()
        }
    }

    /// `DROP TABLE` or `DROP TEMPORARY TABLE`
    pub fn is_drop_table(&self) -> bool {
        self.operation == QueryOperation::Drop && !self.tables.is_empty()
    }
}

/// SQL classifier used by the router
///
/// Implementations must be deterministic: the same text always yields the
/// same classification.
pub trait QueryClassifier: Send + Sync {
    /// Classify one statement (the COM_QUERY / COM_STMT_PREPARE text)
    fn classify(&self, sql: &str) -> Classification;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_type_bits() {
        let qtype = QueryType::READ | QueryType::USERVAR_WRITE;
        assert!(qtype.contains(QueryType::READ));
        assert!(qtype.intersects(QueryType::USERVAR_WRITE | QueryType::WRITE));
        assert!(!qtype.contains(QueryType::READ | QueryType::WRITE));
        assert!(!qtype.contains(QueryType::UNKNOWN));
        assert!(qtype.is_any_read());
        assert_eq!(format!("{:?}", qtype), "READ|USERVAR_WRITE");
        assert_eq!(format!("{:?}", QueryType::UNKNOWN), "UNKNOWN");
    }

    #[test]
    fn test_insert_remove() {
        let mut qtype = QueryType::UNKNOWN;
        qtype.insert(QueryType::WRITE);
        qtype |= QueryType::MASTER_READ;
        assert_eq!(qtype.bits(), 0x0c);
        qtype.remove(QueryType::WRITE);
        assert_eq!(qtype, QueryType::MASTER_READ);
    }
}
