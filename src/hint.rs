//! Routing hints embedded in SQL comments
//!
//! Supported forms, in either `-- ` or `/* */` comments:
//!
//! ```text
//! -- maxscale route to master
//! -- maxscale route to slave
//! -- maxscale route to server db3
//! /* maxscale max_slave_replication_lag=5 */
//! ```

/// A routing hint attached to a statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hint {
    RouteToMaster,
    RouteToSlave,
    RouteToNamedServer(String),
    Parameter { name: String, value: String },
}

const HINT_PREFIX: &str = "maxscale";

/// Extract all hints from the comments of `sql`, in order of appearance
pub fn parse_hints(sql: &str) -> Vec<Hint> {
    comments(sql).into_iter().filter_map(parse_comment).collect()
}

/// Bodies of every comment outside string literals
fn comments(sql: &str) -> Vec<&str> {
    let bytes = sql.as_bytes();
    let len = bytes.len();
    let mut out = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;

    while i < len {
        let c = bytes[i];
        if let Some(q) = quote {
            if c == b'\\' {
                i += 1;
            } else if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }

        match c {
            b'\'' | b'"' | b'`' => quote = Some(c),
            b'/' if i + 1 < len && bytes[i + 1] == b'*' => {
                let start = i + 2;
                let end = sql[start..].find("*/").map(|e| start + e).unwrap_or(len);
                out.push(&sql[start..end]);
                i = end + 1;
            }
            b'#' => {
                let start = i + 1;
                let end = sql[start..].find('\n').map(|e| start + e).unwrap_or(len);
                out.push(&sql[start..end]);
                i = end;
            }
            b'-' if i + 2 < len && bytes[i + 1] == b'-' && bytes[i + 2].is_ascii_whitespace() => {
                let start = i + 2;
                let end = sql[start..].find('\n').map(|e| start + e).unwrap_or(len);
                out.push(&sql[start..end]);
                i = end;
            }
            _ => {}
        }
        i += 1;
    }

    out
}

fn parse_comment(body: &str) -> Option<Hint> {
    let body = body.trim();
    let (prefix, rest) = body.split_once(char::is_whitespace)?;
    if !prefix.eq_ignore_ascii_case(HINT_PREFIX) {
        return None;
    }
    let rest = rest.trim();

    if let Some((name, value)) = rest.split_once('=') {
        let name = name.trim();
        let value = value.trim();
        if name.is_empty() || value.is_empty() || name.contains(char::is_whitespace) {
            return None;
        }
        return Some(Hint::Parameter {
            name: name.to_string(),
            value: value.to_string(),
        });
    }

    let words: Vec<&str> = rest.split_whitespace().collect();
    match words.as_slice() {
        [route, to, target] if route.eq_ignore_ascii_case("route") && to.eq_ignore_ascii_case("to") => {
            if target.eq_ignore_ascii_case("master") {
                Some(Hint::RouteToMaster)
            } else if target.eq_ignore_ascii_case("slave") {
                Some(Hint::RouteToSlave)
            } else {
                None
            }
        }
        [route, to, server, name]
            if route.eq_ignore_ascii_case("route")
                && to.eq_ignore_ascii_case("to")
                && server.eq_ignore_ascii_case("server") =>
        {
            Some(Hint::RouteToNamedServer((*name).to_string()))
        }
        _ => {
            tracing::debug!("Ignoring unrecognised hint '{}'", rest);
            None
        }
    }
}
