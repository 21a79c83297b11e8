//! Lexical helpers over raw SQL text
//!
//! These work on bytes and know just enough MySQL syntax (quotes,
//! backticks, escapes and the three comment styles) to find statement
//! separators without a parser.

/// Find the first occurrence of `c` that is not escaped, quoted, inside a
/// backtick identifier or inside a `/* */` comment.
///
/// A `#` or `-- ` comment ends the search, nothing after it is considered.
pub fn find_unescaped(data: &[u8], c: u8) -> Option<usize> {
    let end = data.len();
    let mut quoted = false;
    let mut escaped = false;
    let mut backtick = false;
    let mut comment = false;
    let mut quote_char = 0u8;
    let mut p = 0;

    while p < end {
        let ch = data[p];
        if escaped {
            escaped = false;
        } else if (!comment && !quoted && !backtick)
            || (comment && ch == b'*')
            || (!comment && quoted && ch == quote_char)
            || (!comment && backtick && ch == b'`')
        {
            match ch {
                b'\\' => escaped = true,
                b'\'' | b'"' => {
                    if !quoted {
                        quoted = true;
                        quote_char = ch;
                    } else if ch == quote_char {
                        quoted = false;
                    }
                }
                b'/' => {
                    if p + 1 < end && data[p + 1] == b'*' {
                        comment = true;
                        p += 1;
                    }
                }
                b'*' => {
                    if comment && p + 1 < end && data[p + 1] == b'/' {
                        comment = false;
                        p += 1;
                    }
                }
                b'`' => backtick = !backtick,
                b'#' => return None,
                b'-' => {
                    if p + 2 < end && data[p + 1] == b'-' && data[p + 2].is_ascii_whitespace() {
                        return None;
                    }
                }
                _ => {}
            }

            if data[p] == c && !escaped && !quoted && !comment && !backtick {
                return Some(p);
            }
        }
        p += 1;
    }

    None
}

fn skip_separators(data: &[u8]) -> usize {
    data.iter()
        .position(|b| !b.is_ascii_whitespace() && *b != b';')
        .unwrap_or(data.len())
}

/// True if `data` holds nothing executable: only whitespace, semicolons or
/// a trailing comment.
pub fn is_statement_end(data: &[u8]) -> bool {
    let len = data.len();
    let p = skip_separators(data);

    if p >= len {
        return true;
    }

    match data[p] {
        b'-' => p + 2 < len && data[p + 1] == b'-' && data[p + 2].is_ascii_whitespace(),
        b'#' => true,
        b'/' => p + 1 < len && data[p + 1] == b'*',
        _ => false,
    }
}

/// True if the next token is the `END` of a `BEGIN ... END` block
pub fn is_sp_end(data: &[u8]) -> bool {
    let p = skip_separators(data);
    p + 3 < data.len() && data[p..p + 3].eq_ignore_ascii_case(b"end")
}

/// True if `sql` holds more than one statement
///
/// Semicolons inside stored procedure bodies and trailing semicolons or
/// comments don't count.
pub fn contains_multiple_statements(sql: &[u8]) -> bool {
    let mut pos = match find_unescaped(sql, b';') {
        Some(pos) => pos,
        None => return false,
    };

    while is_sp_end(&sql[pos..]) {
        match find_unescaped(&sql[pos + 1..], b';') {
            Some(next) => pos = pos + 1 + next,
            None => return false,
        }
    }

    pos < sql.len() && !is_statement_end(&sql[pos..])
}

/// Strip leading SQL comments from a query
pub fn strip_leading_comments(query: &str) -> &str {
    let mut s = query.trim_start();
    loop {
        if s.starts_with("/*") {
            match s.find("*/") {
                Some(end) => {
                    s = s[end + 2..].trim_start();
                    continue;
                }
                None => return "",
            }
        }
        if s.starts_with("-- ") || s.starts_with("--\t") || s.starts_with('#') {
            match s.find('\n') {
                Some(end) => {
                    s = s[end + 1..].trim_start();
                    continue;
                }
                None => return "",
            }
        }
        break;
    }
    s
}
