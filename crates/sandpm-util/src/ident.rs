//! JavaScript identifier helpers.

/// Turn an arbitrary package name into a valid JavaScript identifier.
///
/// Every character outside `[A-Za-z0-9_$]` becomes `_`. A leading digit gets
/// a `_` prefix, and an empty input becomes `_`.
#[must_use]
pub fn sanitize_identifier(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '$' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_names_unchanged() {
        assert_eq!(sanitize_identifier("lodash"), "lodash");
        assert_eq!(sanitize_identifier("$jq_ui"), "$jq_ui");
    }

    #[test]
    fn test_punctuation_replaced() {
        assert_eq!(sanitize_identifier("pkg-b"), "pkg_b");
        assert_eq!(sanitize_identifier("lodash.merge"), "lodash_merge");
        assert_eq!(sanitize_identifier("@types/node"), "_types_node");
    }

    #[test]
    fn test_leading_digit_and_empty() {
        assert_eq!(sanitize_identifier("7zip-bin"), "_7zip_bin");
        assert_eq!(sanitize_identifier(""), "_");
    }

    #[test]
    fn test_non_ascii_replaced() {
        assert_eq!(sanitize_identifier("café"), "caf_");
    }
}
