//! Subject grammar and matching rules used by config validation, the
//! interest gate and the account-level overlap check.

/// Token that matches exactly one subject token.
pub const WILDCARD_TOKEN: &str = "*";
/// Token that matches one or more trailing subject tokens.
pub const FULL_WILDCARD_TOKEN: &str = ">";

const TOKEN_SEPARATOR: char = '.';

/// Returns true if `name` is usable as a stream or consumer identifier.
///
/// Names become subject tokens (advisories, API subjects), so the subject
/// control characters are rejected outright.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name
            .chars()
            .any(|c| c == '.' || c == '*' || c == '>' || c.is_whitespace())
}

/// Returns true if `subject` is a well-formed subject or subject pattern.
pub fn is_valid_subject(subject: &str) -> bool {
    if subject.is_empty() {
        return false;
    }
    let tokens: Vec<&str> = subject.split(TOKEN_SEPARATOR).collect();
    for (idx, token) in tokens.iter().enumerate() {
        match *token {
            "" => return false,
            FULL_WILDCARD_TOKEN => {
                if idx != tokens.len() - 1 {
                    return false;
                }
            }
            WILDCARD_TOKEN => {}
            literal => {
                if literal.contains(['*', '>']) || literal.contains(char::is_whitespace) {
                    return false;
                }
            }
        }
    }
    true
}

/// Returns true if the subject contains no wildcard tokens.
pub fn subject_is_literal(subject: &str) -> bool {
    subject
        .split(TOKEN_SEPARATOR)
        .all(|t| t != WILDCARD_TOKEN && t != FULL_WILDCARD_TOKEN)
}

/// Returns true if every subject matched by `subject` is also matched by
/// `pattern`. Both sides may carry wildcards.
pub fn subject_is_subset_match(subject: &str, pattern: &str) -> bool {
    let sub: Vec<&str> = subject.split(TOKEN_SEPARATOR).collect();
    let pat: Vec<&str> = pattern.split(TOKEN_SEPARATOR).collect();
    is_subset_match_tokenized(&sub, &pat)
}

fn is_subset_match_tokenized(sub: &[&str], pat: &[&str]) -> bool {
    let mut si = 0;
    for (pi, ptok) in pat.iter().enumerate() {
        if si >= sub.len() {
            return false;
        }
        match *ptok {
            FULL_WILDCARD_TOKEN => return pi == pat.len() - 1,
            WILDCARD_TOKEN => {
                // A full wildcard on the subject side covers more than one
                // token and can not be a subset of '*'.
                if sub[si] == FULL_WILDCARD_TOKEN {
                    return false;
                }
            }
            literal => {
                if sub[si] != literal {
                    return false;
                }
            }
        }
        si += 1;
    }
    si == sub.len()
}

/// Returns true if two subject patterns can both match some subject.
pub fn subjects_collide(a: &str, b: &str) -> bool {
    let ta: Vec<&str> = a.split(TOKEN_SEPARATOR).collect();
    let tb: Vec<&str> = b.split(TOKEN_SEPARATOR).collect();
    let mut i = 0;
    loop {
        match (ta.get(i), tb.get(i)) {
            (Some(&FULL_WILDCARD_TOKEN), Some(_)) | (Some(_), Some(&FULL_WILDCARD_TOKEN)) => {
                return true
            }
            (Some(&WILDCARD_TOKEN), Some(_)) | (Some(_), Some(&WILDCARD_TOKEN)) => {}
            (Some(x), Some(y)) => {
                if x != y {
                    return false;
                }
            }
            (None, None) => return true,
            (Some(&FULL_WILDCARD_TOKEN), None) | (None, Some(&FULL_WILDCARD_TOKEN)) => {
                return false
            }
            _ => return false,
        }
        i += 1;
    }
}

/// Returns the 1-based `index`th token of a subject, or an empty string.
pub fn token_at(subject: &str, index: usize) -> &str {
    if index == 0 {
        return "";
    }
    subject.split(TOKEN_SEPARATOR).nth(index - 1).unwrap_or("")
}
