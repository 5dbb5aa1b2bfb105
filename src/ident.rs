//! Identifier validation: the single chokepoint before any identifier
//! reaches a filename, an environment variable, or a subprocess argument.
//!
//! Rules are enforced by explicit character-class checks, never by escaping.
//! Downstream code treats any unvalidated identifier as a bug.

use crate::error::{ApiaryError, Result};

pub const MAX_IDENT_LEN: usize = 100;
const MAX_EXT_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentKind {
    Node,
    Workflow,
    Run,
    Agent,
    /// Allows interior ASCII spaces ("general purpose reviewer").
    AgentType,
    /// Allows a single trailing `.ext` with a 1-10 alphanumeric extension.
    Filename,
    Tenant,
}

impl IdentKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Node => "node id",
            Self::Workflow => "workflow id",
            Self::Run => "run id",
            Self::Agent => "agent id",
            Self::AgentType => "agent type",
            Self::Filename => "filename",
            Self::Tenant => "tenant id",
        }
    }
}

fn invalid(kind: IdentKind, reason: impl Into<String>) -> ApiaryError {
    ApiaryError::InvalidIdentifier {
        what: kind.label().to_string(),
        reason: reason.into(),
    }
}

fn is_interior_char(c: char, allow_space: bool) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-' || (allow_space && c == ' ')
}

fn check_body(value: &str, kind: IdentKind, allow_space: bool) -> Result<()> {
    let chars: Vec<char> = value.chars().collect();

    if chars.is_empty() {
        return Err(invalid(kind, "must not be empty"));
    }
    if chars.len() > MAX_IDENT_LEN {
        return Err(invalid(
            kind,
            format!("too long ({} chars, max {})", chars.len(), MAX_IDENT_LEN),
        ));
    }

    let first = chars[0];
    if !first.is_ascii_alphanumeric() {
        return Err(invalid(
            kind,
            format!("must start with an alphanumeric character, found {:?}", first),
        ));
    }
    let last = chars[chars.len() - 1];
    if !last.is_ascii_alphanumeric() {
        return Err(invalid(
            kind,
            format!("must end with an alphanumeric character, found {:?}", last),
        ));
    }

    if chars.len() > 2 {
        for &c in &chars[1..chars.len() - 1] {
            if !is_interior_char(c, allow_space) {
                return Err(invalid(kind, format!("contains forbidden character {:?}", c)));
            }
        }
    }

    Ok(())
}

/// Validate `value` for use as `kind`, returning the canonical form.
///
/// Fails fast with the offending character named. Canonicalization does not
/// rewrite the input; a valid identifier is returned unchanged.
pub fn validate(value: &str, kind: IdentKind) -> Result<String> {
    match kind {
        IdentKind::Filename => {
            // At most one dot, splitting stem and extension.
            match value.split_once('.') {
                Some((stem, ext)) => {
                    if ext.contains('.') {
                        return Err(invalid(kind, "contains more than one '.'"));
                    }
                    if ext.is_empty() || ext.len() > MAX_EXT_LEN {
                        return Err(invalid(
                            kind,
                            format!("extension must be 1-{} characters", MAX_EXT_LEN),
                        ));
                    }
                    if let Some(c) = ext.chars().find(|c| !c.is_ascii_alphanumeric()) {
                        return Err(invalid(
                            kind,
                            format!("extension contains forbidden character {:?}", c),
                        ));
                    }
                    check_body(stem, kind, false)?;
                }
                None => check_body(value, kind, false)?,
            }
            Ok(value.to_string())
        }
        IdentKind::AgentType => {
            check_body(value, kind, true)?;
            Ok(value.to_string())
        }
        _ => {
            check_body(value, kind, false)?;
            Ok(value.to_string())
        }
    }
}

/// Deep assertion for boundaries that only validated identifiers may reach
/// (subprocess argv, env assignment, blob path assembly).
///
/// A failure here means some caller skipped [`validate`]; it is reported as
/// a `security` error and logged loudly by the boundary.
pub fn ensure_validated(value: &str, kind: IdentKind) -> Result<()> {
    validate(value, kind).map_err(|e| ApiaryError::Security(e.to_string()))?;
    Ok(())
}
