// Dot-separated subject matching used to bind subjects to streams.
//
// `*` matches exactly one token, `>` matches one or more trailing tokens.

pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return pattern_tokens.next().is_none(),
            (Some("*"), Some(token)) if !token.is_empty() => continue,
            (Some(expected), Some(token)) if expected == token && !token.is_empty() => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Returns true if any subject could be matched by both patterns.
pub fn patterns_overlap(left: &str, right: &str) -> bool {
    let left_tokens: Vec<&str> = left.split('.').collect();
    let right_tokens: Vec<&str> = right.split('.').collect();
    let mut index = 0;
    loop {
        match (left_tokens.get(index), right_tokens.get(index)) {
            (Some(&">"), Some(_)) | (Some(_), Some(&">")) => return true,
            (Some(l), Some(r)) if *l == "*" || *r == "*" || l == r => index += 1,
            (None, None) => return true,
            _ => return false,
        }
    }
}

pub fn is_valid_pattern(pattern: &str) -> bool {
    let tokens: Vec<&str> = pattern.split('.').collect();
    tokens.iter().enumerate().all(|(index, token)| {
        !token.is_empty() && (*token != ">" || index == tokens.len() - 1)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_subjects_match_exactly() {
        assert!(subject_matches("orders.created", "orders.created"));
        assert!(!subject_matches("orders.created", "orders.updated"));
        assert!(!subject_matches("orders", "orders.created"));
    }

    #[test]
    fn star_matches_single_token() {
        assert!(subject_matches("orders.*", "orders.created"));
        assert!(!subject_matches("orders.*", "orders.created.eu"));
        assert!(!subject_matches("orders.*", "orders"));
    }

    #[test]
    fn tail_wildcard_needs_at_least_one_token() {
        assert!(subject_matches("orders.>", "orders.created"));
        assert!(subject_matches("orders.>", "orders.created.eu"));
        assert!(!subject_matches("orders.>", "orders"));
    }

    #[test]
    fn empty_tokens_never_match() {
        assert!(!subject_matches("orders.*", "orders."));
        assert!(!subject_matches("a..b", "a..b"));
    }

    #[test]
    fn overlap_detection() {
        assert!(patterns_overlap("orders.*", "orders.created"));
        assert!(patterns_overlap("orders.>", "orders.eu.created"));
        assert!(!patterns_overlap("orders.*", "invoices.*"));
        assert!(!patterns_overlap("orders.*", "orders.eu.created"));
    }

    #[test]
    fn tail_wildcard_must_be_last() {
        assert!(is_valid_pattern("orders.>"));
        assert!(!is_valid_pattern("orders.>.eu"));
        assert!(!is_valid_pattern(""));
    }
}
