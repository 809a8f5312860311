//! Deterministic local versions.
//!
//! A task without an explicit version gets `local-` followed by the first 8
//! hex characters of a SHA-256 over a canonical JSON rendering of its
//! identity: function name, module, doc string and the ordered parameter
//! schema. Anything outside that rendering (comments, the function body) does
//! not affect the version.

use serde::Serialize;
use sha2::{Digest, Sha256};

use super::descriptor::Parameter;

pub const LOCAL_VERSION_PREFIX: &str = "local-";

#[derive(Serialize)]
struct Canonical<'a> {
    function_name: &'a str,
    module: &'a str,
    doc: Option<&'a str>,
    parameters: Vec<[Option<&'a str>; 3]>,
}

/// Canonical text hashed by [`derive_version`].
pub fn canonical_form(
    function_name: &str,
    module: &str,
    doc: Option<&str>,
    parameters: &[Parameter],
) -> String {
    let canonical = Canonical {
        function_name,
        module,
        doc: doc.map(str::trim).filter(|d| !d.is_empty()),
        parameters: parameters
            .iter()
            .map(|p| [Some(p.name.as_str()), Some(p.annotation.as_str()), p.default.as_deref()])
            .collect(),
    };
    // Serializing borrowed strings into a String cannot fail.
    serde_json::to_string(&canonical).unwrap_or_default()
}

pub fn derive_version(
    function_name: &str,
    module: &str,
    doc: Option<&str>,
    parameters: &[Parameter],
) -> String {
    let digest = Sha256::digest(canonical_form(function_name, module, doc, parameters).as_bytes());
    let hex: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
    format!("{LOCAL_VERSION_PREFIX}{hex}")
}

/// Explicit version verbatim, otherwise the derived one.
pub fn resolve_version(
    explicit: Option<&str>,
    function_name: &str,
    module: &str,
    doc: Option<&str>,
    parameters: &[Parameter],
) -> String {
    match explicit {
        Some(v) => v.to_string(),
        None => derive_version(function_name, module, doc, parameters),
    }
}
