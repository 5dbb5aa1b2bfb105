//! Boundary behavior of the identifier chokepoint.

use apiary::error::ErrorKind;
use apiary::ident::{IdentKind, validate};

#[test]
fn test_length_boundaries() {
    assert!(validate("", IdentKind::Run).is_err());
    assert_eq!(
        validate("", IdentKind::Run).unwrap_err().kind(),
        ErrorKind::Validation
    );

    let hundred = "a".repeat(100);
    assert!(validate(&hundred, IdentKind::Run).is_ok());

    let hundred_one = "a".repeat(101);
    assert_eq!(
        validate(&hundred_one, IdentKind::Run).unwrap_err().kind(),
        ErrorKind::Validation
    );
}

#[test]
fn test_every_metacharacter_rejected() {
    for c in [
        ';', '|', '&', '$', '`', '\'', '"', '>', '<', '*', '?', '\n', '\r', '\0',
    ] {
        let candidate = format!("a{}b", c);
        let err = validate(&candidate, IdentKind::Node).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation, "char {:?}", c);
    }
}

#[test]
fn test_path_separators_and_dots_rejected() {
    for candidate in ["a/b", "a\\b", "a.b", "..", ".", "a b"] {
        assert!(validate(candidate, IdentKind::Tenant).is_err(), "{}", candidate);
    }
}

#[test]
fn test_kind_specific_allowances() {
    // Interior spaces only for agent types.
    assert!(validate("code reviewer", IdentKind::AgentType).is_ok());
    assert!(validate("code reviewer", IdentKind::Node).is_err());

    // Single trailing extension only for filenames.
    assert!(validate("result.json", IdentKind::Filename).is_ok());
    assert!(validate("result.json", IdentKind::Node).is_err());
    assert!(validate("archive.tar.gz", IdentKind::Filename).is_err());
}

#[test]
fn test_valid_identifiers_are_canonical() {
    for candidate in ["j-1", "run_42", "A", "9", "swarm-scout-p3"] {
        assert_eq!(validate(candidate, IdentKind::Agent).unwrap(), candidate);
    }
}
