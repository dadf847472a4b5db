//! Cross-system book identity
//!
//! Local row ids mean nothing to the server, so bookshelf entries are matched
//! by a key derived from their content.

use super::models::BookRecord;

pub trait BookIdentity: Send + Sync {
    fn key(&self, book: &BookRecord) -> String;
}

/// Matches books by exact `(name, author)`
#[derive(Debug, Clone, Copy, Default)]
pub struct NameAuthorIdentity;

impl BookIdentity for NameAuthorIdentity {
    fn key(&self, book: &BookRecord) -> String {
        format!("{}\u{0}{}", book.name, book.author)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_author_key() {
        let identity = NameAuthorIdentity;
        let a = BookRecord::new("Foo", "Bar", "https://a", "https://a/foo");
        let b = BookRecord::new("Foo", "Bar", "https://b", "storage/foo.epub");
        let c = BookRecord::new("Foo", "Baz", "https://a", "https://a/foo");

        assert_eq!(identity.key(&a), identity.key(&b));
        assert_ne!(identity.key(&a), identity.key(&c));
    }

    #[test]
    fn test_key_is_not_ambiguous() {
        let identity = NameAuthorIdentity;
        let a = BookRecord::new("AB", "C", "", "");
        let b = BookRecord::new("A", "BC", "", "");
        assert_ne!(identity.key(&a), identity.key(&b));
    }
}
