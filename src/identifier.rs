//! Identifier encoding and matching.
//!
//! A workflow's identifiers are stored as one JSON text column:
//! `[{"key":"order","value":"42"}, ...]`.

use crate::error::{Error, Result};
use crate::model::Identifier;

/// Serialize an identifier list for the `identifiers` column.
pub fn encode(identifiers: &[Identifier]) -> Result<String> {
    Ok(serde_json::to_string(identifiers)?)
}

/// Parse the `identifiers` column. Empty or NULL text is an empty list.
pub fn decode(raw: Option<&str>) -> Result<Vec<Identifier>> {
    match raw.map(str::trim) {
        None | Some("") | Some("null") => Ok(Vec::new()),
        Some(text) => Ok(serde_json::from_str(text)?),
    }
}

/// Does the list carry an entry with exactly this key and value?
pub fn contains(identifiers: &[Identifier], key: &str, value: &str) -> bool {
    identifiers
        .iter()
        .any(|ident| ident.key == key && ident.value == value)
}

/// Reject identifiers with an empty key or value.
pub fn validate(identifier: &Identifier) -> Result<()> {
    if identifier.key.trim().is_empty() {
        return Err(Error::Validation("identifier key is empty".into()));
    }
    if identifier.value.trim().is_empty() {
        return Err(Error::Validation(format!(
            "identifier {} has an empty value",
            identifier.key
        )));
    }
    Ok(())
}

/// Append `new` unless the exact pair is already present.
///
/// Returns `false` (and leaves the list untouched) for duplicates.
pub fn attach(identifiers: &mut Vec<Identifier>, new: Identifier) -> bool {
    if contains(identifiers, &new.key, &new.value) {
        return false;
    }
    identifiers.push(new);
    true
}
