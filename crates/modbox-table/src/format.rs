//! Number format strings
//!
//! Grammar: literal text (with `{{` and `}}` escapes) around exactly one
//! replacement field `{:SPEC}`, where SPEC is `[,]?(\.[0-9]{1,2})?[dfe%]?`.
//!
//! A field that names an argument, indexes, reads an attribute, converts
//! with `!` or nests another field asks the renderer to look something up.
//! That is unsafe and always fatal. Every other deviation is merely invalid.

use once_cell::sync::Lazy;
use regex::Regex;

static SPEC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^,?(?:\.[0-9]{1,2})?[dfe%]?$").unwrap_or_else(|_| unreachable!("literal regex"))
});

/// Why a format string was refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatIssue {
    /// Malformed or unsupported, but harmless
    #[error("invalid format: {0}")]
    Invalid(String),
    /// Implies a lookup when rendered
    #[error("unsafe format: {0}")]
    Unsafe(String),
}

impl FormatIssue {
    /// Check if the issue must reject the table regardless of policy
    #[inline]
    #[must_use]
    pub fn is_unsafe(&self) -> bool {
        matches!(self, Self::Unsafe(_))
    }
}

/// Check a Number column format string
///
/// # Errors
///
/// Returns [`FormatIssue::Unsafe`] for lookups, [`FormatIssue::Invalid`]
/// for anything else outside the grammar.
pub fn check_number_format(format: &str) -> Result<(), FormatIssue> {
    let mut chars = format.chars().peekable();
    let mut fields = 0usize;

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
            }
            '{' => {
                let mut field = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some('{') => {
                            return Err(FormatIssue::Unsafe("nested replacement field".into()))
                        }
                        Some(c) => field.push(c),
                        None => {
                            return Err(FormatIssue::Invalid("unterminated replacement field".into()))
                        }
                    }
                }
                check_field(&field)?;
                fields += 1;
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
            }
            '}' => return Err(FormatIssue::Invalid("unmatched '}'".into())),
            _ => {}
        }
    }

    match fields {
        1 => Ok(()),
        0 => Err(FormatIssue::Invalid("no replacement field".into())),
        n => Err(FormatIssue::Invalid(format!("{n} replacement fields"))),
    }
}

fn check_field(field: &str) -> Result<(), FormatIssue> {
    let (name, spec) = field.split_once(':').unwrap_or((field, ""));
    if !name.is_empty() {
        return Err(FormatIssue::Unsafe(format!("field reference {name:?}")));
    }
    if !SPEC_RE.is_match(spec) {
        return Err(FormatIssue::Invalid(format!("unsupported format spec {spec:?}")));
    }
    Ok(())
}
