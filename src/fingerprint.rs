//! Fingerprint derivation for cached calls.
//!
//! A fingerprint identifies one (computation, arguments) pair. It is the
//! SHA-256 hash of the canonical textual representation
//! `"<qualname>(<args>)"`, hex-encoded, where `<args>` is the `Debug`
//! rendering of the argument value. The same name and arguments always
//! produce the same fingerprint, within a process and across process
//! restarts, because nothing address- or identity-dependent enters the
//! hash.
//!
//! The representation is textual, not structural: two argument values of
//! different types whose `Debug` output happens to be identical collide.
//! This is an accepted limitation of the scheme, not a bug.

use std::fmt;

use sha2::{Digest, Sha256};

/// Derive the fingerprint for `qualname` called with `args`.
///
/// `qualname` should uniquely identify the computation, e.g.
/// `"mycrate::mymod::myfunc"`. Use a tuple for positional arguments and
/// a struct with named fields where keyword-style arguments are wanted.
pub fn fingerprint<A: fmt::Debug + ?Sized>(qualname: &str, args: &A) -> String {
    let repr = format!("{qualname}({args:?})");
    hex::encode(Sha256::digest(repr.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_deterministic() {
        let a = fingerprint("mymod::myfunc", &(4, 5));
        let b = fingerprint("mymod::myfunc", &(4, 5));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fingerprint_discriminates_args() {
        let one = fingerprint("mymod::myfunc", &(3,));
        let two = fingerprint("mymod::myfunc", &(3, 3));
        let three = fingerprint("mymod::myfunc", &(4,));
        assert_ne!(one, two);
        assert_ne!(one, three);
        assert_ne!(two, three);
    }

    #[test]
    fn test_fingerprint_discriminates_names() {
        let one = fingerprint("mymod::onefunc", &(4,));
        let other = fingerprint("mymod::otherfunc", &(4,));
        assert_ne!(one, other);
    }

    #[test]
    fn test_fingerprint_named_args() {
        #[derive(Debug)]
        #[allow(dead_code)]
        struct Args {
            posarg: i32,
            kwarg: i32,
        }

        let a = fingerprint("myfunc", &Args { posarg: 4, kwarg: 5 });
        let b = fingerprint("myfunc", &Args { posarg: 4, kwarg: 5 });
        let c = fingerprint("myfunc", &Args { posarg: 4, kwarg: 2 });
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
