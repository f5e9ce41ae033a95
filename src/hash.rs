//! Thin wrapper around the `murmur3` crate, the strong-validator hash used
//! for ETags and middleware identity. Core modules never touch murmur3
//! directly; they call `etag_of` / `handler_identity`.

use std::io::Cursor;

/// Compute the unquoted ETag for a URL + representation, seeded from config.
///
/// Callers join whatever fields make up the representation's identity
/// (typically `url|length|last-modified`, plus a body digest when the
/// representation isn't fully described by its metadata) and hash the result.
pub fn etag_of(parts: &[&str], seed: u32) -> String {
    let joined = parts.join("|");
    let mut cursor = Cursor::new(joined.as_bytes());
    let hash = murmur3::murmur3_32(&mut cursor, seed).expect("murmur3 over an in-memory buffer cannot fail");
    format!("{:08x}", hash)
}

/// Stable identity hash for a registered middleware, used by the blacklist to
/// suppress a handler for a given route. Callers pass a registration site
/// string (e.g. `"filehandler::get"` or `file!():line!()`), not a runtime
/// closure address.
pub fn handler_identity(site: &str) -> u64 {
    let mut cursor = Cursor::new(site.as_bytes());
    murmur3::murmur3_x64_128(&mut cursor, 0).expect("murmur3 over an in-memory buffer cannot fail") as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn etag_is_stable_for_same_inputs() {
        let a = etag_of(&["http://h/p", "5", "123"], 0);
        let b = etag_of(&["http://h/p", "5", "123"], 0);
        assert_eq!(a, b);
    }

    #[test]
    fn etag_changes_with_seed() {
        let a = etag_of(&["http://h/p", "5", "123"], 0);
        let b = etag_of(&["http://h/p", "5", "123"], 1);
        assert_ne!(a, b);
    }

    #[test]
    fn handler_identity_is_stable() {
        assert_eq!(handler_identity("etag_gate"), handler_identity("etag_gate"));
        assert_ne!(handler_identity("etag_gate"), handler_identity("cors"));
    }
}
