//! Reply-thread tags.
//!
//! A reply link travels inside the body as a literal `[REPLY:<id>]` prefix at
//! byte 0. Ingress boundaries strip it and keep the id next to the record;
//! egress boundaries put it back so every recipient sees the same body.
//!
//! Only canonical positive decimals (no sign, no leading zero) are tags, so
//! `prepend(strip(b), extract(b)) == b` holds for every body.

const OPEN: &str = "[REPLY:";
const CLOSE: char = ']';

/// Prefix `body` with the tag for `reply_to`. Non-positive or absent ids leave
/// the body untouched.
pub fn prepend(body: &str, reply_to: Option<i64>) -> String {
    match reply_to {
        Some(id) if id > 0 => format!("{}{}{}{}", OPEN, id, CLOSE, body),
        _ => body.to_string(),
    }
}

/// Split a body into its reply id and the untagged remainder.
pub fn strip(body: &str) -> (Option<i64>, &str) {
    match parse(body) {
        Some((id, rest)) => (Some(id), rest),
        None => (None, body),
    }
}

/// The reply id carried by `body`, if any.
pub fn extract(body: &str) -> Option<i64> {
    parse(body).map(|(id, _)| id)
}

fn parse(body: &str) -> Option<(i64, &str)> {
    let rest = body.strip_prefix(OPEN)?;
    let end = rest.find(CLOSE)?;
    let digits = &rest[..end];

    if digits.is_empty()
        || digits.starts_with('0')
        || !digits.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    let id: i64 = digits.parse().ok()?;
    Some((id, &rest[end + CLOSE.len_utf8()..]))
}
