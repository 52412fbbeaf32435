// Cache Keys
// Dependency-closed digests of a step and its resolved inputs

use crate::cache::store::CacheError;
use crate::step::descriptor::StepDescriptor;
use crate::step::models::Value;

use blake3::Hasher;
use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;

/// Hex blake3 digest identifying one cached result
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Accept an existing key, e.g. read back from an index file name
    pub fn parse(hex: &str) -> Option<Self> {
        let valid = hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit());
        valid.then(|| CacheKey(hex.to_ascii_lowercase()))
    }

    /// First characters of the key, for display
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How one input slot contributes to a key
#[derive(Debug, Clone, PartialEq)]
pub enum KeyInput {
    /// A value fixed before the run (literal binding, default or sweep value)
    Literal(Value),
    /// A value produced upstream, identified by the producer's own key
    Upstream { producer_key: CacheKey, slot: String },
}

#[derive(Serialize)]
struct KeyDocument<'a> {
    step: &'a str,
    version: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    action: Option<String>,
    inputs: BTreeMap<&'a str, KeyPart<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
enum KeyPart<'a> {
    Literal {
        value: &'a Value,
        /// Content digests of existing files the value points at
        #[serde(skip_serializing_if = "BTreeMap::is_empty")]
        content: BTreeMap<String, String>,
    },
    Upstream {
        key: &'a str,
        slot: &'a str,
    },
}

/// Compute the cache key of a step over its resolved inputs.
///
/// Upstream values contribute their producer's key rather than their
/// content, so a change anywhere upstream reaches every descendant.
pub fn cache_key(
    step: &StepDescriptor,
    inputs: &BTreeMap<String, KeyInput>,
) -> Result<CacheKey, CacheError> {
    let mut parts = BTreeMap::new();
    for (slot, input) in inputs {
        let part = match input {
            KeyInput::Literal(value) => {
                let mut content = BTreeMap::new();
                for path in value.paths() {
                    if path.is_file() {
                        content.insert(path.display().to_string(), file_digest(path)?);
                    }
                }
                KeyPart::Literal { value, content }
            }
            KeyInput::Upstream { producer_key, slot } => KeyPart::Upstream {
                key: producer_key.as_str(),
                slot,
            },
        };
        parts.insert(slot.as_str(), part);
    }

    let document = KeyDocument {
        step: step.name(),
        version: step.step_version(),
        action: step.identity(),
        inputs: parts,
    };
    let canonical = serde_json::to_string(&document)?;

    let mut hasher = Hasher::new();
    hasher.update(canonical.as_bytes());
    Ok(CacheKey(hasher.finalize().to_hex().to_string()))
}

/// [`cache_key`] on the blocking pool, since it reads every input file
pub async fn compute_key(
    step: Arc<StepDescriptor>,
    inputs: BTreeMap<String, KeyInput>,
) -> Result<CacheKey, CacheError> {
    tokio::task::spawn_blocking(move || cache_key(&step, &inputs))
        .await
        .map_err(|e| CacheError::Io(io::Error::new(io::ErrorKind::Other, e)))?
}

/// blake3 hex digest of a file's content
pub fn file_digest(path: &Path) -> Result<String, CacheError> {
    let mut file = File::open(path)?;
    let mut hasher = Hasher::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().to_hex().to_string())
}
