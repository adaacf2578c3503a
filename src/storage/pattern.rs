//! Path pattern helpers shared by the index backends.
//!
//! Only `%` is a wildcard. SQL's single-character `_` is escaped wherever a pattern reaches
//! PostgreSQL so that paths containing underscores match literally.

/// Prefix that every descendant of `directory_path` starts with. The root has the empty prefix.
pub fn directory_prefix(directory_path: &str) -> String {
    if directory_path.is_empty() || directory_path.ends_with('/') {
        directory_path.to_string()
    } else {
        format!("{}/", directory_path)
    }
}

/// Escapes a literal for use inside a `LIKE ... ESCAPE '\'` pattern.
pub fn escape_like_literal(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Turns a user pattern into a `LIKE ... ESCAPE '\'` pattern that keeps `%` as the only wildcard.
pub fn to_sql_like(pattern: &str) -> String {
    let mut escaped = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        if matches!(c, '\\' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Matches `text` against `pattern`, where `%` matches any (possibly empty) sequence.
pub fn like_matches(pattern: &str, text: &str) -> bool {
    let segments: Vec<&str> = pattern.split('%').collect();
    if segments.len() == 1 {
        return pattern == text;
    }

    let first = segments[0];
    let last = segments[segments.len() - 1];
    if !text.starts_with(first) || text.len() < first.len() + last.len() || !text.ends_with(last) {
        return false;
    }

    let mut remaining = &text[first.len()..text.len() - last.len()];
    for segment in &segments[1..segments.len() - 1] {
        if segment.is_empty() {
            continue;
        }
        match remaining.find(segment) {
            Some(pos) => remaining = &remaining[pos + segment.len()..],
            None => return false,
        }
    }
    true
}
