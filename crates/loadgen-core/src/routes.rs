//! Route normalisation for timing aggregation.
//!
//! Chat-server paths embed opaque 26-character identifiers
//! (`/api/v4/channels/<id>/stats`). Aggregating on the raw path would give
//! every channel its own bucket, so variable segments are replaced with
//! placeholder tokens before a sample is recorded.

use regex::Regex;
use std::sync::LazyLock;

/// Placeholder substituted for opaque identifiers.
pub const ID_PLACEHOLDER: &str = ":id";
/// Placeholder substituted for name lookups (`/users/username/<name>`).
pub const NAME_PLACEHOLDER: &str = ":name";

static ID_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]{26}$").expect("valid id regex"));

/// Segments whose successor is a user-chosen name rather than a route word.
const NAME_KEYS: &[&str] = &["username", "name", "email"];

/// Whether `segment` has the shape of a server-generated identifier.
pub fn is_id(segment: &str) -> bool {
    ID_SEGMENT.is_match(segment)
}

/// Collapse a concrete request path into its route key.
pub fn normalize_path(path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or_default();

    let mut out = Vec::new();
    let mut after_name_key = false;
    for segment in path.split('/') {
        if after_name_key && !segment.is_empty() {
            out.push(NAME_PLACEHOLDER);
            after_name_key = false;
            continue;
        }
        after_name_key = NAME_KEYS.contains(&segment);
        if is_id(segment) {
            out.push(ID_PLACEHOLDER);
        } else {
            out.push(segment);
        }
    }

    let joined = out.join("/");
    if joined.is_empty() {
        "/".to_string()
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distinct_ids_share_route() {
        let a = normalize_path("/api/v4/channels/abcdefghijklmnopqrstuvwxyz/stats");
        let b = normalize_path("/api/v4/channels/8sd7f6g5h4j3k2l1q9w8e7r6t5/stats");
        assert_eq!(a, b);
        assert_eq!(a, "/api/v4/channels/:id/stats");
    }

    #[test]
    fn test_multiple_ids() {
        assert_eq!(
            normalize_path(
                "/api/v4/users/abcdefghijklmnopqrstuvwxyz/teams/zyxwvutsrqponmlkjihgfedcba/channels"
            ),
            "/api/v4/users/:id/teams/:id/channels"
        );
    }

    #[test]
    fn test_query_string_dropped() {
        assert_eq!(
            normalize_path("/api/v4/channels/abcdefghijklmnopqrstuvwxyz/posts?page=0&per_page=60"),
            "/api/v4/channels/:id/posts"
        );
    }

    #[test]
    fn test_names_collapsed() {
        assert_eq!(
            normalize_path("/api/v4/users/username/loadtest-user17"),
            "/api/v4/users/username/:name"
        );
        assert_eq!(
            normalize_path("/api/v4/teams/name/team-3/channels/name/town-square"),
            "/api/v4/teams/name/:name/channels/name/:name"
        );
    }

    #[test]
    fn test_non_id_segments_untouched() {
        // 25 and 27 characters, and an uppercase letter
        assert_eq!(
            normalize_path("/x/abcdefghijklmnopqrstuvwxy/abcdefghijklmnopqrstuvwxyza/ABCDEFGHIJKLMNOPQRSTUVWXYZ"),
            "/x/abcdefghijklmnopqrstuvwxy/abcdefghijklmnopqrstuvwxyza/ABCDEFGHIJKLMNOPQRSTUVWXYZ"
        );
        assert_eq!(normalize_path("/api/v4/system/ping"), "/api/v4/system/ping");
    }

    #[test]
    fn test_empty_path() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("?q=1"), "/");
    }
}
