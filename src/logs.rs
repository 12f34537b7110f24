//! Log retrieval for rules in the `logged` state.
//!
//! Backends keep their own log stores; records are passed through as the
//! backend produced them, tagged with the ACL and the backend name.

use serde::Serialize;
use serde_json::Value;

/// One matched-traffic record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    /// ACL owning the rule that produced the record
    pub acl: String,
    /// Backend that produced the record
    pub backend: String,
    /// Backend-defined record, unmodified
    pub record: Value,
}

/// Lazily produced log entries
pub type LogStream = Box<dyn Iterator<Item = LogEntry> + Send>;

/// A stream with no entries
pub fn empty() -> LogStream {
    Box::new(std::iter::empty())
}

/// Split a rule tag of the form `<acl>-<index>` into the ACL name.
///
/// ACL names may contain dashes, so only the last segment is the index.
pub fn tag_acl(tag: &str) -> Option<&str> {
    let (acl, index) = tag.rsplit_once('-')?;
    if acl.is_empty() || index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(acl)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_acl() {
        assert_eq!(tag_acl("web-0"), Some("web"));
        assert_eq!(tag_acl("block-acl-12"), Some("block-acl"));
        assert_eq!(tag_acl("web"), None);
        assert_eq!(tag_acl("web-x"), None);
        assert_eq!(tag_acl("-3"), None);
    }

    #[test]
    fn test_empty_stream() {
        assert_eq!(empty().count(), 0);
    }
}
