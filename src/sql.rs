//! Small SQL text helpers shared by the dumper and the restorer.
//!
//! These work on statement text, not on a parsed syntax tree: string
//! literals are copied through untouched and every identifier token outside
//! them (bare, `"quoted"` or `` `quoted` ``) is offered to a callback.

use rusqlite::types::ValueRef;

/// Quotes an identifier with double quotes.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Escapes text for use inside a single-quoted SQLite literal.
///
/// SQLite does not interpret backslash sequences, so the only character that
/// needs escaping is the quote itself. Newlines, tabs and backslashes are
/// kept verbatim; the JSON line encoding of the dump keeps each entry on
/// one line.
pub(crate) fn escape_string(value: &str) -> String {
    value.replace('\'', "''")
}

/// Renders a column value as an SQL literal.
pub(crate) fn literal(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        // Debug keeps a trailing ".0" so REAL values stay REAL.
        ValueRef::Real(f) if f.is_finite() => format!("{:?}", f),
        ValueRef::Real(f) if f.is_nan() => "NULL".to_string(),
        ValueRef::Real(f) if f > 0.0 => "9e999".to_string(),
        ValueRef::Real(_) => "-9e999".to_string(),
        ValueRef::Text(bytes) => format!("'{}'", escape_string(&String::from_utf8_lossy(bytes))),
        ValueRef::Blob(bytes) => {
            let mut hex = String::with_capacity(bytes.len() * 2 + 3);
            hex.push_str("X'");
            for b in bytes {
                hex.push_str(&format!("{:02X}", b));
            }
            hex.push('\'');
            hex
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

/// Rewrites identifier tokens outside string literals.
///
/// `f` receives the unquoted identifier and returns a replacement, or `None`
/// to keep it. Quoting style is preserved.
pub(crate) fn map_identifiers(sql: &str, mut f: impl FnMut(&str) -> Option<String>) -> String {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '\'' {
            // String literal, '' is an escaped quote.
            out.push(c);
            i += 1;
            while i < chars.len() {
                out.push(chars[i]);
                if chars[i] == '\'' {
                    if i + 1 < chars.len() && chars[i + 1] == '\'' {
                        out.push('\'');
                        i += 2;
                        continue;
                    }
                    i += 1;
                    break;
                }
                i += 1;
            }
        } else if c == '"' || c == '`' {
            let quote = c;
            let mut ident = String::new();
            i += 1;
            while i < chars.len() {
                if chars[i] == quote {
                    if i + 1 < chars.len() && chars[i + 1] == quote {
                        ident.push(quote);
                        i += 2;
                        continue;
                    }
                    i += 1;
                    break;
                }
                ident.push(chars[i]);
                i += 1;
            }
            let ident = f(&ident).unwrap_or(ident);
            let doubled: String = [quote, quote].iter().collect();
            out.push(quote);
            out.push_str(&ident.replace(quote, &doubled));
            out.push(quote);
        } else if is_ident_start(c) && (i == 0 || !is_ident_char(chars[i - 1])) {
            let start = i;
            while i < chars.len() && is_ident_char(chars[i]) {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            match f(&word) {
                Some(replacement) => out.push_str(&replacement),
                None => out.push_str(&word),
            }
        } else {
            out.push(c);
            i += 1;
        }
    }
    out
}

/// Collects identifier tokens outside string literals.
pub(crate) fn identifiers(sql: &str) -> Vec<String> {
    let mut found = Vec::new();
    map_identifiers(sql, |ident| {
        found.push(ident.to_string());
        None
    });
    found
}

/// Replaces a leading table prefix on every identifier token.
///
/// Only whole tokens that start with `from` and continue past it are
/// rewritten, so `wp_users` becomes `xy_users` but `wp_` alone and values
/// inside string literals stay as they are.
pub(crate) fn rewrite_prefix(sql: &str, from: &str, to: &str) -> String {
    if from.is_empty() || from == to {
        return sql.to_string();
    }
    map_identifiers(sql, |ident| {
        ident
            .strip_prefix(from)
            .filter(|rest| !rest.is_empty())
            .map(|rest| format!("{}{}", to, rest))
    })
}

/// Returns the target table of an `INSERT INTO` statement.
pub(crate) fn insert_target(sql: &str) -> Option<String> {
    let trimmed = sql.trim_start();
    let upper = trimmed.to_ascii_uppercase();
    if !upper.starts_with("INSERT") {
        return None;
    }
    let rest = trimmed.get("INSERT".len()..)?.trim_start();
    let into = rest.get(..4)?;
    if !into.eq_ignore_ascii_case("INTO") {
        return None;
    }
    let rest = rest.get(4..)?.trim_start();
    let mut chars = rest.chars();
    match chars.next()? {
        q @ ('"' | '`') => Some(chars.take_while(|&c| c != q).collect()),
        '[' => Some(chars.take_while(|&c| c != ']').collect()),
        c if is_ident_start(c) => Some(
            std::iter::once(c)
                .chain(chars.take_while(|&c| is_ident_char(c)))
                .collect(),
        ),
        _ => None,
    }
}

/// Returns the table a statement writes to or defines.
///
/// Understands `INSERT`/`REPLACE ... INTO t`, `CREATE [TEMP] TABLE
/// [IF NOT EXISTS] t`, `CREATE [UNIQUE] INDEX ... ON t`, `DROP TABLE
/// [IF EXISTS] t`, `ALTER TABLE t`, `DELETE FROM t` and `UPDATE t`. Column
/// names and referenced tables are never reported.
pub(crate) fn statement_target(sql: &str) -> Option<String> {
    let tokens = identifiers(sql);
    let upper: Vec<String> = tokens.iter().map(|t| t.to_ascii_uppercase()).collect();
    let is = |i: usize, keyword: &str| upper.get(i).map(String::as_str) == Some(keyword);
    let after = |keyword: &str| upper.iter().position(|t| t == keyword).map(|i| i + 1);

    let index = match upper.first()?.as_str() {
        "INSERT" | "REPLACE" => after("INTO")?,
        "DELETE" => after("FROM")?,
        "UPDATE" if is(1, "OR") => 3,
        "UPDATE" => 1,
        "CREATE" if (1..4).any(|i| is(i, "INDEX")) => after("ON")?,
        "CREATE" | "DROP" | "ALTER" if (1..3).any(|i| is(i, "TABLE")) => {
            let mut i = after("TABLE")?;
            if is(i, "IF") {
                i += 1;
                if is(i, "NOT") {
                    i += 1;
                }
                if is(i, "EXISTS") {
                    i += 1;
                }
            }
            i
        }
        _ => return None,
    };
    tokens.get(index).cloned()
}

/// Turns `INSERT INTO ...` into `INSERT OR REPLACE INTO ...`.
pub(crate) fn to_upsert(sql: &str) -> String {
    let trimmed = sql.trim_start();
    match trimmed.get("INSERT".len()..) {
        Some(rest) if !rest.trim_start().to_ascii_uppercase().starts_with("OR ") => {
            format!("INSERT OR REPLACE{}", rest)
        }
        _ => sql.to_string(),
    }
}

/// Whether a failure means "this was already applied".
pub(crate) fn is_duplicate_error(err: &rusqlite::Error) -> bool {
    let message = err.to_string().to_ascii_lowercase();
    message.contains("already exists")
        || message.contains("unique constraint failed")
        || message.contains("duplicate")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_values() {
        assert_eq!(literal(ValueRef::Null), "NULL");
        assert_eq!(literal(ValueRef::Integer(-7)), "-7");
        assert_eq!(literal(ValueRef::Real(1.0)), "1.0");
        assert_eq!(literal(ValueRef::Text(b"it's")), "'it''s'");
        assert_eq!(literal(ValueRef::Blob(&[0x00, 0xAB])), "X'00AB'");
    }

    #[test]
    fn test_escape_keeps_control_characters() {
        assert_eq!(escape_string("a\\b\n\tc'"), "a\\b\n\tc''");
    }

    #[test]
    fn test_rewrite_prefix_tokens_only() {
        let sql = "INSERT INTO \"wp_posts\" (\"id\", \"title\") VALUES (1, 'see wp_posts')";
        assert_eq!(
            rewrite_prefix(sql, "wp_", "xy_"),
            "INSERT INTO \"xy_posts\" (\"id\", \"title\") VALUES (1, 'see wp_posts')"
        );
        assert_eq!(
            rewrite_prefix("CREATE TABLE wp_users(id INTEGER, swp_x TEXT)", "wp_", "b_"),
            "CREATE TABLE b_users(id INTEGER, swp_x TEXT)"
        );
        assert_eq!(rewrite_prefix("SELECT wp_", "wp_", "b_"), "SELECT wp_");
    }

    #[test]
    fn test_identifiers_skip_literals() {
        let ids = identifiers("INSERT INTO `a` VALUES ('b', \"c\"\"d\")");
        assert_eq!(ids, vec!["INSERT", "INTO", "a", "VALUES", "c\"d"]);
    }

    #[test]
    fn test_statement_target_ignores_columns() {
        assert_eq!(
            statement_target("INSERT INTO \"posts\" (\"id\", \"users\") VALUES (1, 2)").as_deref(),
            Some("posts")
        );
        assert_eq!(
            statement_target("INSERT OR REPLACE INTO options VALUES ('a', 'b')").as_deref(),
            Some("options")
        );
        assert_eq!(
            statement_target("DROP TABLE IF EXISTS \"users\"").as_deref(),
            Some("users")
        );
        assert_eq!(
            statement_target(
                "CREATE TABLE IF NOT EXISTS child (id INTEGER, pid INTEGER REFERENCES users(id))"
            )
            .as_deref(),
            Some("child")
        );
        assert_eq!(
            statement_target("CREATE UNIQUE INDEX users_name ON users (name)").as_deref(),
            Some("users")
        );
        assert_eq!(
            statement_target("UPDATE OR IGNORE t SET users = 1").as_deref(),
            Some("t")
        );
        assert_eq!(statement_target("PRAGMA foreign_keys = OFF"), None);
    }

    #[test]
    fn test_insert_target_and_upsert() {
        assert_eq!(
            insert_target("INSERT INTO \"wp_options\" VALUES (1)").as_deref(),
            Some("wp_options")
        );
        assert_eq!(
            insert_target("insert into wp_options VALUES (1)").as_deref(),
            Some("wp_options")
        );
        assert_eq!(insert_target("DROP TABLE wp_options"), None);
        assert_eq!(
            to_upsert("INSERT INTO \"o\" VALUES (1)"),
            "INSERT OR REPLACE INTO \"o\" VALUES (1)"
        );
        assert_eq!(
            to_upsert("INSERT OR IGNORE INTO o VALUES (1)"),
            "INSERT OR IGNORE INTO o VALUES (1)"
        );
    }
}
