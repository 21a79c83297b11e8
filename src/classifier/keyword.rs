//! Keyword-level SQL classifier
//!
//! Good enough for the statements applications actually send through a
//! read/write splitter. It never fails: anything it does not recognise is
//! reported as UNKNOWN and ends up on the master.

use super::scan::{contains_multiple_statements, strip_leading_comments};
use super::{Classification, QueryClassifier, QueryOperation, QueryType};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    /// Bare word or backtick identifier, dotted parts joined
    Word { text: String, quoted: bool },
    UserVar(String),
    SysVar { name: String, global: bool },
    Number(String),
    Literal,
    Assign,
    Symbol(char),
}

impl Token {
    fn is_kw(&self, kw: &str) -> bool {
        matches!(self, Token::Word { text, quoted: false } if text.eq_ignore_ascii_case(kw))
    }

    fn is_symbol(&self, c: char) -> bool {
        matches!(self, Token::Symbol(s) if *s == c)
    }

    fn word(&self) -> Option<&str> {
        match self {
            Token::Word { text, .. } => Some(text),
            _ => None,
        }
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

fn tokenize(sql: &str) -> Vec<Token> {
    let chars: Vec<char> = sql.chars().collect();
    let len = chars.len();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < len {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
        } else if c == '/' && i + 1 < len && chars[i + 1] == '*' {
            i += 2;
            while i + 1 < len && !(chars[i] == '*' && chars[i + 1] == '/') {
                i += 1;
            }
            i += 2;
        } else if c == '#' || (c == '-' && i + 2 < len && chars[i + 1] == '-' && chars[i + 2].is_whitespace()) {
            while i < len && chars[i] != '\n' {
                i += 1;
            }
        } else if c == '\'' || c == '"' {
            i = skip_string(&chars, i);
            tokens.push(Token::Literal);
        } else if c == '@' {
            let (token, next) = read_variable(&chars, i);
            tokens.push(token);
            i = next;
        } else if c == ':' && i + 1 < len && chars[i + 1] == '=' {
            tokens.push(Token::Assign);
            i += 2;
        } else if c.is_ascii_digit() {
            let start = i;
            while i < len && (is_word_char(chars[i]) || chars[i] == '.') {
                i += 1;
            }
            tokens.push(Token::Number(chars[start..i].iter().collect()));
        } else if c == '`' || is_word_char(c) {
            let (token, next) = read_identifier(&chars, i);
            tokens.push(token);
            i = next;
        } else {
            tokens.push(Token::Symbol(c));
            i += 1;
        }
    }

    tokens
}

fn skip_string(chars: &[char], start: usize) -> usize {
    let quote = chars[start];
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == '\\' {
            i += 2;
            continue;
        }
        if chars[i] == quote {
            if i + 1 < chars.len() && chars[i + 1] == quote {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    chars.len()
}

/// Read one identifier part starting at `i`, returns (text, quoted, next)
fn read_part(chars: &[char], mut i: usize) -> (String, bool, usize) {
    let mut text = String::new();
    if chars[i] == '`' {
        i += 1;
        while i < chars.len() {
            if chars[i] == '`' {
                if i + 1 < chars.len() && chars[i + 1] == '`' {
                    text.push('`');
                    i += 2;
                    continue;
                }
                i += 1;
                break;
            }
            text.push(chars[i]);
            i += 1;
        }
        (text, true, i)
    } else {
        while i < chars.len() && is_word_char(chars[i]) {
            text.push(chars[i]);
            i += 1;
        }
        (text, false, i)
    }
}

fn read_identifier(chars: &[char], start: usize) -> (Token, usize) {
    let (mut text, mut quoted, mut i) = read_part(chars, start);

    while i + 1 < chars.len() && chars[i] == '.' && (chars[i + 1] == '`' || is_word_char(chars[i + 1]) || chars[i + 1] == '*') {
        if chars[i + 1] == '*' {
            text.push_str(".*");
            i += 2;
            break;
        }
        let (part, part_quoted, next) = read_part(chars, i + 1);
        text.push('.');
        text.push_str(&part);
        quoted |= part_quoted;
        i = next;
    }

    (Token::Word { text, quoted }, i)
}

fn read_variable(chars: &[char], start: usize) -> (Token, usize) {
    let len = chars.len();
    if start + 1 < len && chars[start + 1] == '@' {
        let mut i = start + 2;
        let mut name = String::new();
        while i < len && (is_word_char(chars[i]) || chars[i] == '.') {
            name.push(chars[i]);
            i += 1;
        }
        let lower = name.to_ascii_lowercase();
        let global = lower.starts_with("global.");
        if global || lower.starts_with("session.") || lower.starts_with("local.") {
            if let Some(dot) = name.find('.') {
                name = name[dot + 1..].to_string();
            }
        }
        return (Token::SysVar { name, global }, i);
    }

    let mut i = start + 1;
    if i < len && (chars[i] == '\'' || chars[i] == '"' || chars[i] == '`') {
        let end = if chars[i] == '`' {
            read_part(chars, i).2
        } else {
            skip_string(chars, i)
        };
        let name: String = chars[i..end].iter().collect();
        return (Token::UserVar(name), end);
    }
    let mut name = String::new();
    while i < len && (is_word_char(chars[i]) || chars[i] == '.') {
        name.push(chars[i]);
        i += 1;
    }
    (Token::UserVar(name), i)
}

/// Words that end a table list
const TABLE_LIST_END: &[&str] = &[
    "WHERE", "GROUP", "ORDER", "LIMIT", "HAVING", "JOIN", "INNER", "LEFT", "RIGHT", "CROSS", "NATURAL",
    "STRAIGHT_JOIN", "OUTER", "ON", "USING", "UNION", "FOR", "LOCK", "INTO", "WINDOW", "PROCEDURE", "SET",
    "VALUES", "VALUE", "SELECT", "PARTITION", "EXCEPT", "INTERSECT", "FORCE", "IGNORE", "USE",
];

fn ends_table_list(token: &Token) -> bool {
    TABLE_LIST_END.iter().any(|kw| token.is_kw(kw))
}

/// Parse `name [[AS] alias] [, ...]` starting at `pos`
fn parse_table_list(tokens: &[Token], mut pos: usize, tables: &mut Vec<String>) {
    while pos < tokens.len() {
        let token = &tokens[pos];
        if ends_table_list(token) {
            return;
        }
        match token {
            Token::Word { text, .. } => {
                push_unique(tables, text);
                pos += 1;
                if pos < tokens.len() && tokens[pos].is_kw("AS") {
                    pos += 1;
                }
                if pos < tokens.len() && tokens[pos].word().is_some() && !ends_table_list(&tokens[pos]) {
                    pos += 1;
                }
            }
            Token::Symbol('(') => {
                // Derived table, its own FROM is picked up by the outer scan
                let mut depth = 0usize;
                while pos < tokens.len() {
                    if tokens[pos].is_symbol('(') {
                        depth += 1;
                    } else if tokens[pos].is_symbol(')') {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    pos += 1;
                }
                pos += 1;
                if pos < tokens.len() && tokens[pos].is_kw("AS") {
                    pos += 1;
                }
                if pos < tokens.len() && tokens[pos].word().is_some() && !ends_table_list(&tokens[pos]) {
                    pos += 1;
                }
            }
            _ => return,
        }

        if pos < tokens.len() && tokens[pos].is_symbol(',') {
            pos += 1;
        } else {
            return;
        }
    }
}

fn push_unique(tables: &mut Vec<String>, name: &str) {
    if !tables.iter().any(|t| t == name) {
        tables.push(name.to_string());
    }
}

/// First word at or after `pos` that is not one of `skip`
fn skip_words(tokens: &[Token], mut pos: usize, skip: &[&str]) -> usize {
    while pos < tokens.len() && skip.iter().any(|kw| tokens[pos].is_kw(kw)) {
        pos += 1;
    }
    pos
}

fn table_at(tokens: &[Token], pos: usize) -> Option<String> {
    tokens.get(pos).and_then(Token::word).map(str::to_string)
}

/// Keyword-based classifier
#[derive(Debug, Default, Clone)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    pub fn new() -> Self {
        Self
    }

    fn classify_select(tokens: &[Token], c: &mut Classification) {
        c.operation = QueryOperation::Select;
        let mut has_from = false;
        let mut qtype = QueryType::UNKNOWN;

        for (i, token) in tokens.iter().enumerate() {
            let next = tokens.get(i + 1);
            match token {
                Token::UserVar(_) => {
                    let assigned = matches!(next, Some(Token::Assign))
                        || (i > 0 && tokens[i - 1].is_kw("INTO"))
                        || (i > 0 && tokens[i - 1].is_symbol(',') && Self::in_into_list(tokens, i));
                    if assigned {
                        qtype |= QueryType::USERVAR_WRITE;
                    } else {
                        qtype |= QueryType::USERVAR_READ;
                    }
                }
                Token::SysVar { global: true, .. } => qtype |= QueryType::GSYSVAR_READ,
                Token::SysVar { global: false, .. } => qtype |= QueryType::SYSVAR_READ,
                Token::Word { quoted: false, text } => {
                    if text.eq_ignore_ascii_case("FROM") || text.eq_ignore_ascii_case("JOIN") {
                        has_from |= text.eq_ignore_ascii_case("FROM");
                        parse_table_list(tokens, i + 1, &mut c.tables);
                    } else if text.eq_ignore_ascii_case("LAST_INSERT_ID") && matches!(next, Some(t) if t.is_symbol('(')) {
                        qtype |= QueryType::MASTER_READ;
                    } else if text.eq_ignore_ascii_case("FOR") && matches!(next, Some(t) if t.is_kw("UPDATE")) {
                        qtype |= QueryType::WRITE;
                    } else if text.eq_ignore_ascii_case("LOCK")
                        && matches!(next, Some(t) if t.is_kw("IN"))
                        && matches!(tokens.get(i + 2), Some(t) if t.is_kw("SHARE"))
                    {
                        qtype |= QueryType::WRITE;
                    }
                }
                _ => {}
            }
        }

        // Pure variable lookups without a table read no data
        let var_reads = QueryType::USERVAR_READ | QueryType::SYSVAR_READ | QueryType::GSYSVAR_READ;
        if has_from || !qtype.intersects(var_reads) {
            qtype |= QueryType::READ;
        }
        c.query_type = qtype;
    }

    fn in_into_list(tokens: &[Token], pos: usize) -> bool {
        let mut i = pos;
        while i > 0 {
            i -= 1;
            match &tokens[i] {
                Token::UserVar(_) | Token::Symbol(',') => continue,
                t => return t.is_kw("INTO"),
            }
        }
        false
    }

    fn classify_show(tokens: &[Token], c: &mut Classification) {
        c.operation = QueryOperation::Show;
        let pos = skip_words(tokens, 1, &["FULL", "EXTENDED"]);
        let scope = tokens.get(pos);
        let global = matches!(scope, Some(t) if t.is_kw("GLOBAL"));
        let pos = skip_words(tokens, pos, &["GLOBAL", "SESSION", "LOCAL"]);

        c.query_type = match tokens.get(pos) {
            Some(t) if t.is_kw("DATABASES") || t.is_kw("SCHEMAS") => QueryType::SHOW_DATABASES,
            Some(t) if t.is_kw("TABLES") => QueryType::SHOW_TABLES,
            Some(t) if t.is_kw("VARIABLES") || t.is_kw("STATUS") => {
                if global {
                    QueryType::GSYSVAR_READ
                } else {
                    QueryType::SYSVAR_READ
                }
            }
            Some(t) if t.is_kw("MASTER") || t.is_kw("SLAVE") || t.is_kw("BINARY") => QueryType::MASTER_READ,
            _ => QueryType::READ,
        };
    }

    fn classify_set(tokens: &[Token], c: &mut Classification) {
        c.operation = QueryOperation::Set;
        let mut qtype = QueryType::UNKNOWN;

        // Split into comma separated assignments at paren depth zero
        let mut assignments: Vec<&[Token]> = Vec::new();
        let mut start = 1;
        let mut depth = 0i32;
        for (i, token) in tokens.iter().enumerate().skip(1) {
            match token {
                Token::Symbol('(') => depth += 1,
                Token::Symbol(')') => depth -= 1,
                Token::Symbol(',') if depth == 0 => {
                    assignments.push(&tokens[start..i]);
                    start = i + 1;
                }
                _ => {}
            }
        }
        assignments.push(&tokens[start.min(tokens.len())..]);

        for assignment in assignments {
            qtype |= Self::classify_assignment(assignment);
        }
        c.query_type = qtype;
    }

    fn classify_assignment(tokens: &[Token]) -> QueryType {
        let Some(first) = tokens.first() else {
            return QueryType::UNKNOWN;
        };

        let (global, target) = match first {
            Token::UserVar(_) => return QueryType::USERVAR_WRITE,
            Token::SysVar { name, global } => (*global, Some(name.as_str())),
            t if t.is_kw("GLOBAL") => (true, tokens.get(1).and_then(Token::word)),
            t if t.is_kw("SESSION") || t.is_kw("LOCAL") => (false, tokens.get(1).and_then(Token::word)),
            t => (false, t.word()),
        };

        if global {
            return QueryType::GSYSVAR_WRITE;
        }

        if matches!(target, Some(name) if name.eq_ignore_ascii_case("autocommit")) {
            let value = tokens
                .iter()
                .skip_while(|t| !t.is_symbol('=') && !matches!(t, Token::Assign))
                .nth(1);
            let enable = match value {
                Some(Token::Word { text, .. }) => text.eq_ignore_ascii_case("ON") || text.eq_ignore_ascii_case("TRUE"),
                Some(Token::Number(n)) => n != "0",
                _ => return QueryType::SESSION_WRITE,
            };
            return if enable {
                QueryType::SESSION_WRITE | QueryType::ENABLE_AUTOCOMMIT | QueryType::COMMIT
            } else {
                QueryType::SESSION_WRITE | QueryType::DISABLE_AUTOCOMMIT | QueryType::BEGIN_TRX
            };
        }

        QueryType::SESSION_WRITE
    }

    fn classify_create(tokens: &[Token], c: &mut Classification) {
        c.operation = QueryOperation::Create;
        c.query_type = QueryType::WRITE;

        let pos = skip_words(tokens, 1, &["OR", "REPLACE"]);
        let temporary = matches!(tokens.get(pos), Some(t) if t.is_kw("TEMPORARY"));
        let pos = skip_words(tokens, pos, &["TEMPORARY"]);
        if !matches!(tokens.get(pos), Some(t) if t.is_kw("TABLE")) {
            return;
        }
        let pos = skip_words(tokens, pos + 1, &["IF", "NOT", "EXISTS"]);
        c.created_table = table_at(tokens, pos);
        if temporary {
            c.query_type |= QueryType::CREATE_TMP_TABLE;
        }
    }

    fn classify_drop(tokens: &[Token], c: &mut Classification) {
        c.operation = QueryOperation::Drop;
        c.query_type = QueryType::WRITE;

        if matches!(tokens.get(1), Some(t) if t.is_kw("PREPARE")) {
            c.query_type = QueryType::SESSION_WRITE;
            return;
        }
        let pos = skip_words(tokens, 1, &["TEMPORARY"]);
        if !matches!(tokens.get(pos), Some(t) if t.is_kw("TABLE") || t.is_kw("TABLES")) {
            return;
        }
        let mut pos = skip_words(tokens, pos + 1, &["IF", "EXISTS"]);
        while let Some(name) = table_at(tokens, pos) {
            if ends_table_list(&tokens[pos]) || name.eq_ignore_ascii_case("RESTRICT") || name.eq_ignore_ascii_case("CASCADE") {
                break;
            }
            push_unique(&mut c.tables, &name);
            pos += 1;
            if !matches!(tokens.get(pos), Some(t) if t.is_symbol(',')) {
                break;
            }
            pos += 1;
        }
    }

    fn classify_dml(tokens: &[Token], c: &mut Classification, operation: QueryOperation) {
        c.operation = operation;
        c.query_type = QueryType::WRITE;

        let pos = match operation {
            QueryOperation::Insert => skip_words(tokens, 1, &["LOW_PRIORITY", "DELAYED", "HIGH_PRIORITY", "IGNORE", "INTO"]),
            QueryOperation::Update => skip_words(tokens, 1, &["LOW_PRIORITY", "IGNORE"]),
            QueryOperation::Delete => {
                let pos = skip_words(tokens, 1, &["LOW_PRIORITY", "QUICK", "IGNORE"]);
                skip_words(tokens, pos, &["FROM"])
            }
            QueryOperation::Truncate => skip_words(tokens, 1, &["TABLE"]),
            _ => 1,
        };
        if let Some(name) = table_at(tokens, pos) {
            push_unique(&mut c.tables, &name);
        }

        // Tables read by INSERT ... SELECT or joins
        for (i, token) in tokens.iter().enumerate().skip(pos + 1) {
            if token.is_kw("FROM") || token.is_kw("JOIN") {
                parse_table_list(tokens, i + 1, &mut c.tables);
            }
        }
    }

    fn classify_transaction(tokens: &[Token], c: &mut Classification) {
        let mut qtype = QueryType::BEGIN_TRX;
        let mut i = 2;
        while i + 1 < tokens.len() {
            if tokens[i].is_kw("READ") && tokens[i + 1].is_kw("ONLY") {
                qtype |= QueryType::READ_ONLY_TRX;
            }
            i += 1;
        }
        c.query_type = qtype;
    }
}

impl QueryClassifier for KeywordClassifier {
    fn classify(&self, sql: &str) -> Classification {
        let stripped = strip_leading_comments(sql);
        let mut c = Classification {
            is_multi_statement: contains_multiple_statements(sql.as_bytes()),
            ..Default::default()
        };

        let mut tokens = tokenize(stripped);
        while tokens.first().map(|t| t.is_symbol('(')).unwrap_or(false) {
            tokens.remove(0);
        }
        let Some(first) = tokens.first().and_then(Token::word) else {
            return c;
        };
        let keyword = first.to_ascii_uppercase();

        match keyword.as_str() {
            "SELECT" | "WITH" | "VALUES" | "TABLE" => Self::classify_select(&tokens, &mut c),
            "SHOW" => Self::classify_show(&tokens, &mut c),
            "EXPLAIN" | "DESCRIBE" | "DESC" => {
                c.operation = QueryOperation::Explain;
                c.query_type = QueryType::READ;
            }
            "SET" => {
                if matches!(tokens.get(1), Some(t) if t.is_kw("TRANSACTION")) {
                    c.operation = QueryOperation::Set;
                    c.query_type = QueryType::SESSION_WRITE;
                } else {
                    Self::classify_set(&tokens, &mut c);
                }
            }
            "USE" => {
                c.operation = QueryOperation::ChangeDb;
                c.query_type = QueryType::SESSION_WRITE;
                c.database = table_at(&tokens, 1);
            }
            "INSERT" | "REPLACE" => Self::classify_dml(&tokens, &mut c, QueryOperation::Insert),
            "UPDATE" => Self::classify_dml(&tokens, &mut c, QueryOperation::Update),
            "DELETE" => Self::classify_dml(&tokens, &mut c, QueryOperation::Delete),
            "TRUNCATE" => Self::classify_dml(&tokens, &mut c, QueryOperation::Truncate),
            "CREATE" => Self::classify_create(&tokens, &mut c),
            "DROP" => Self::classify_drop(&tokens, &mut c),
            "ALTER" | "RENAME" => {
                c.operation = QueryOperation::Alter;
                c.query_type = QueryType::WRITE;
            }
            "GRANT" => {
                c.operation = QueryOperation::Grant;
                c.query_type = QueryType::WRITE;
            }
            "REVOKE" => {
                c.operation = QueryOperation::Revoke;
                c.query_type = QueryType::WRITE;
            }
            "CALL" => {
                c.operation = QueryOperation::Call;
                c.query_type = QueryType::WRITE;
            }
            "LOAD" => {
                c.operation = QueryOperation::Load;
                c.query_type = QueryType::WRITE;
            }
            "BEGIN" => c.query_type = QueryType::BEGIN_TRX,
            "START" if matches!(tokens.get(1), Some(t) if t.is_kw("TRANSACTION")) => {
                Self::classify_transaction(&tokens, &mut c)
            }
            "COMMIT" => c.query_type = QueryType::COMMIT,
            "ROLLBACK" => {
                // ROLLBACK TO SAVEPOINT keeps the transaction open
                if !tokens.iter().any(|t| t.is_kw("TO")) {
                    c.query_type = QueryType::ROLLBACK;
                }
            }
            "PREPARE" => c.query_type = QueryType::PREPARE_NAMED_STMT,
            "EXECUTE" => {
                c.operation = QueryOperation::Execute;
                c.query_type = QueryType::EXEC_STMT;
            }
            "DEALLOCATE" => c.query_type = QueryType::SESSION_WRITE,
            "LOCK" | "UNLOCK" | "FLUSH" | "ANALYZE" | "OPTIMIZE" | "REPAIR" | "KILL" | "PURGE" | "RESET" => {
                c.query_type = QueryType::WRITE;
            }
            _ => {}
        }

        c
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(sql: &str) -> Classification {
        KeywordClassifier::new().classify(sql)
    }

    #[test]
    fn test_select() {
        let c = classify("SELECT a, b FROM t1 JOIN db2.t2 ON t1.id = t2.id WHERE a = 'x;y'");
        assert_eq!(c.operation, QueryOperation::Select);
        assert_eq!(c.query_type, QueryType::READ);
        assert_eq!(c.tables, vec!["t1".to_string(), "db2.t2".to_string()]);
        assert!(!c.is_multi_statement);

        let c = classify("/* app */ select * from `orders` o, customers AS c");
        assert_eq!(c.tables, vec!["orders".to_string(), "customers".to_string()]);

        assert_eq!(classify("SELECT 1").query_type, QueryType::READ);
    }

    #[test]
    fn test_select_variables() {
        assert_eq!(classify("SELECT @a").query_type, QueryType::USERVAR_READ);
        assert_eq!(classify("SELECT @@version").query_type, QueryType::SYSVAR_READ);
        assert_eq!(classify("SELECT @@global.max_connections").query_type, QueryType::GSYSVAR_READ);
        assert_eq!(
            classify("SELECT @a := 1").query_type,
            QueryType::READ | QueryType::USERVAR_WRITE
        );
        assert!(classify("SELECT id INTO @x FROM t").query_type.contains(QueryType::USERVAR_WRITE));
        assert_eq!(
            classify("SELECT @a, c FROM t").query_type,
            QueryType::READ | QueryType::USERVAR_READ
        );
    }

    #[test]
    fn test_select_master_only() {
        assert!(classify("SELECT LAST_INSERT_ID()").query_type.contains(QueryType::MASTER_READ));
        assert!(classify("SELECT * FROM t WHERE id = 1 FOR UPDATE").query_type.contains(QueryType::WRITE));
    }

    #[test]
    fn test_show() {
        assert_eq!(classify("SHOW TABLES").query_type, QueryType::SHOW_TABLES);
        assert_eq!(classify("SHOW DATABASES").query_type, QueryType::SHOW_DATABASES);
        assert_eq!(classify("SHOW GLOBAL STATUS").query_type, QueryType::GSYSVAR_READ);
        assert_eq!(classify("SHOW VARIABLES LIKE 'x'").query_type, QueryType::SYSVAR_READ);
        assert_eq!(classify("SHOW CREATE TABLE t").query_type, QueryType::READ);
    }

    #[test]
    fn test_writes() {
        let c = classify("INSERT INTO t1 (a) SELECT a FROM t2");
        assert_eq!(c.operation, QueryOperation::Insert);
        assert_eq!(c.query_type, QueryType::WRITE);
        assert_eq!(c.tables, vec!["t1".to_string(), "t2".to_string()]);

        assert_eq!(classify("UPDATE t SET a = 1").operation, QueryOperation::Update);
        assert_eq!(classify("DELETE FROM t").tables, vec!["t".to_string()]);
        assert_eq!(classify("REPLACE INTO t VALUES (1)").query_type, QueryType::WRITE);
        assert_eq!(classify("CALL proc()").operation, QueryOperation::Call);
        assert_eq!(classify("GRANT ALL ON *.* TO 'u'").operation, QueryOperation::Grant);
    }

    #[test]
    fn test_load_data() {
        let c = classify("LOAD DATA LOCAL INFILE '/tmp/x.csv' INTO TABLE t");
        assert_eq!(c.operation, QueryOperation::Load);
        assert!(c.query_type.contains(QueryType::WRITE));
    }

    #[test]
    fn test_temporary_tables() {
        let c = classify("CREATE TEMPORARY TABLE IF NOT EXISTS tmp1 (id INT)");
        assert_eq!(c.query_type, QueryType::WRITE | QueryType::CREATE_TMP_TABLE);
        assert_eq!(c.created_table.as_deref(), Some("tmp1"));

        let c = classify("CREATE TABLE t (id INT)");
        assert_eq!(c.query_type, QueryType::WRITE);
        assert_eq!(c.created_table.as_deref(), Some("t"));

        let c = classify("DROP TEMPORARY TABLE IF EXISTS tmp1, db.tmp2");
        assert!(c.is_drop_table());
        assert_eq!(c.tables, vec!["tmp1".to_string(), "db.tmp2".to_string()]);

        assert!(!classify("DROP DATABASE d").is_drop_table());
    }

    #[test]
    fn test_set() {
        assert_eq!(classify("SET @x = 1").query_type, QueryType::USERVAR_WRITE);
        assert_eq!(classify("SET NAMES utf8mb4").query_type, QueryType::SESSION_WRITE);
        assert_eq!(classify("SET sql_mode = ''").query_type, QueryType::SESSION_WRITE);
        assert_eq!(classify("SET GLOBAL max_connections = 10").query_type, QueryType::GSYSVAR_WRITE);
        assert_eq!(classify("SET @@global.x = 10").query_type, QueryType::GSYSVAR_WRITE);
        assert_eq!(
            classify("SET @a = 1, sql_mode = ''").query_type,
            QueryType::USERVAR_WRITE | QueryType::SESSION_WRITE
        );
    }

    #[test]
    fn test_autocommit() {
        let off = QueryType::SESSION_WRITE | QueryType::DISABLE_AUTOCOMMIT | QueryType::BEGIN_TRX;
        let on = QueryType::SESSION_WRITE | QueryType::ENABLE_AUTOCOMMIT | QueryType::COMMIT;
        assert_eq!(classify("SET autocommit=0").query_type, off);
        assert_eq!(classify("SET autocommit = OFF").query_type, off);
        assert_eq!(classify("SET @@session.autocommit = 1").query_type, on);
        assert_eq!(classify("set autocommit=true").query_type, on);
    }

    #[test]
    fn test_transactions() {
        assert_eq!(classify("BEGIN").query_type, QueryType::BEGIN_TRX);
        assert_eq!(classify("START TRANSACTION").query_type, QueryType::BEGIN_TRX);
        assert_eq!(
            classify("START TRANSACTION READ ONLY").query_type,
            QueryType::BEGIN_TRX | QueryType::READ_ONLY_TRX
        );
        assert_eq!(classify("START TRANSACTION READ WRITE").query_type, QueryType::BEGIN_TRX);
        assert_eq!(classify("COMMIT").query_type, QueryType::COMMIT);
        assert_eq!(classify("ROLLBACK").query_type, QueryType::ROLLBACK);
        assert_eq!(classify("ROLLBACK TO SAVEPOINT s1").query_type, QueryType::UNKNOWN);
    }

    #[test]
    fn test_use_and_prepare() {
        let c = classify("USE `shop`");
        assert_eq!(c.operation, QueryOperation::ChangeDb);
        assert_eq!(c.query_type, QueryType::SESSION_WRITE);
        assert_eq!(c.database.as_deref(), Some("shop"));

        assert_eq!(classify("PREPARE s FROM 'SELECT 1'").query_type, QueryType::PREPARE_NAMED_STMT);
        assert_eq!(classify("EXECUTE s").query_type, QueryType::EXEC_STMT);
        assert_eq!(classify("DEALLOCATE PREPARE s").query_type, QueryType::SESSION_WRITE);
    }

    #[test]
    fn test_multi_statement_and_unknown() {
        assert!(classify("SELECT 1; SELECT 2").is_multi_statement);
        assert_eq!(classify("").query_type, QueryType::UNKNOWN);
        assert_eq!(classify("HANDLER t OPEN").query_type, QueryType::UNKNOWN);
    }
}
