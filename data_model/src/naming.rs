//! Canonical names for the resources of one deployed function.
//!
//! Every artifact of a deployment is keyed by a single [`ServiceName`]
//! derived from the `(tenant, function)` pair. The name always has the shape
//!
//! ```text
//! lambda-<tenant>-<function>-<digest>
//! ```
//!
//! where `<tenant>` and `<function>` are the identifiers folded into the
//! DNS-1035 alphabet and `<digest>` is the first 8 hex characters of the
//! SHA-256 of the raw pair. The digest keeps pairs such as `("a-b", "c")` and
//! `("a", "b-c")` apart, and keeps names distinct once the identifiers have
//! to be shortened to fit the 63 character label limit.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ValidationError;

/// Literal prefix shared by every managed resource name.
pub const SERVICE_NAME_MARKER: &str = "lambda";

/// Kubernetes DNS label limit.
pub const SERVICE_NAME_MAX_LEN: usize = 63;

const CONFIG_MAP_SUFFIX: &str = "-config";
const DIGEST_LEN: usize = 8;

// marker + three separators + digest
const IDENTIFIER_BUDGET: usize = SERVICE_NAME_MAX_LEN - SERVICE_NAME_MARKER.len() - 3 - DIGEST_LEN;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceName(String);

impl ServiceName {
    /// Derives the name for a tenant's function. Pure and deterministic.
    pub fn for_function(tenant_id: &str, function_id: &str) -> Self {
        let tenant = fold_to_label_alphabet(tenant_id);
        let function = fold_to_label_alphabet(function_id);
        let (tenant_len, function_len) =
            split_budget(tenant.len(), function.len(), IDENTIFIER_BUDGET);
        let digest = pair_digest(tenant_id, function_id);

        let name = [
            SERVICE_NAME_MARKER,
            truncate(&tenant, tenant_len),
            truncate(&function, function_len),
            digest.as_str(),
        ]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");

        Self(name)
    }

    /// Accepts an externally supplied name, e.g. from a delete request.
    pub fn parse(name: &str) -> Result<Self, ValidationError> {
        validate_service_name(name)?;
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn config_map_name(&self) -> String {
        format!("{}{}", self.0, CONFIG_MAP_SUFFIX)
    }
}

impl Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ServiceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ServiceName {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_service_name(&value)?;
        Ok(Self(value))
    }
}

impl From<ServiceName> for String {
    fn from(value: ServiceName) -> Self {
        value.0
    }
}

/// Lowercases and maps every character outside `[a-z0-9]` to `-`, collapsing
/// runs of separators and trimming them from both ends.
fn fold_to_label_alphabet(input: &str) -> String {
    let mut folded = String::with_capacity(input.len());
    for c in input.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            folded.push(c);
        } else if !folded.ends_with('-') {
            folded.push('-');
        }
    }
    folded.trim_matches('-').to_string()
}

/// Splits `budget` characters between the two identifiers. When both are too
/// long each gets half; otherwise the shorter one is kept whole and the
/// longer one receives what is left.
fn split_budget(tenant: usize, function: usize, budget: usize) -> (usize, usize) {
    if tenant + function <= budget {
        return (tenant, function);
    }
    let half = budget / 2;
    if tenant <= half {
        (tenant, budget - tenant)
    } else if function <= half {
        (budget - function, function)
    } else {
        (half, budget - half)
    }
}

// Input is already folded to ASCII, so byte slicing is safe.
fn truncate(s: &str, len: usize) -> &str {
    s[..len.min(s.len())].trim_end_matches('-')
}

fn pair_digest(tenant_id: &str, function_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tenant_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(function_id.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..DIGEST_LEN / 2])
}

fn validate_service_name(name: &str) -> Result<(), ValidationError> {
    let invalid = |reason: &'static str| ValidationError::InvalidServiceName {
        name: name.to_string(),
        reason,
    };
    if name.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if name.len() > SERVICE_NAME_MAX_LEN {
        return Err(invalid("must be at most 63 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(invalid(
            "must consist of lowercase alphanumeric characters or '-'",
        ));
    }
    if !name.starts_with(|c: char| c.is_ascii_lowercase()) {
        return Err(invalid("must start with a letter"));
    }
    if name.ends_with('-') {
        return Err(invalid("must end with an alphanumeric character"));
    }
    match name.strip_prefix(SERVICE_NAME_MARKER) {
        Some(rest) if rest.starts_with('-') => Ok(()),
        _ => Err(invalid("must start with the `lambda-` marker")),
    }
}
