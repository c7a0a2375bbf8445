//! Data handed between the engine, the coordinator and the update clients.

use std::collections::BTreeSet;
use std::fmt;

use uuid::Uuid;

/// Capability every hot-reloadable process declares.
pub const BASELINE_CAPABILITY: &str = "Baseline";

/// Identity of a unit of loaded code inside a target process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(Uuid);

impl ModuleId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl From<Uuid> for ModuleId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One proposed change to one module, as produced by the delta engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    pub module_id: ModuleId,
    pub metadata_delta: Vec<u8>,
    pub code_delta: Vec<u8>,
    pub debug_delta: Vec<u8>,
    pub updated_types: Vec<i32>,
    /// Capabilities a process must declare to accept this update. Not sent on the wire.
    pub required_capabilities: BTreeSet<String>,
}

impl Update {
    pub fn new(module_id: ModuleId) -> Self {
        Self {
            module_id,
            metadata_delta: Vec::new(),
            code_delta: Vec::new(),
            debug_delta: Vec::new(),
            updated_types: Vec::new(),
            required_capabilities: BTreeSet::new(),
        }
    }

    pub fn with_deltas(mut self, metadata: Vec<u8>, code: Vec<u8>, debug: Vec<u8>) -> Self {
        self.metadata_delta = metadata;
        self.code_delta = code;
        self.debug_delta = debug;
        self
    }

    pub fn with_updated_types(mut self, types: impl IntoIterator<Item = i32>) -> Self {
        self.updated_types = types.into_iter().collect();
        self
    }

    pub fn requiring<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }
}

/// A content file (stylesheet, script, image) refreshed without a code update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticAsset {
    pub assembly_name: String,
    pub is_application_asset: bool,
    pub relative_path: String,
    pub contents: Vec<u8>,
}

/// The set of capability tokens a process can apply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities(BTreeSet<String>);

impl Capabilities {
    /// Parse the space-separated form sent in the handshake.
    pub fn parse(tokens: &str) -> Self {
        Self(tokens.split_whitespace().map(str::to_string).collect())
    }

    pub fn contains(&self, capability: &str) -> bool {
        self.0.contains(capability)
    }

    /// Required capabilities not covered by this set.
    pub fn missing<'a>(&self, required: &'a BTreeSet<String>) -> Vec<&'a str> {
        required
            .iter()
            .filter(|c| !self.0.contains(c.as_str()))
            .map(String::as_str)
            .collect()
    }

    pub fn union_with(&mut self, other: &Capabilities) {
        self.0.extend(other.0.iter().cloned());
    }

    pub fn intersection(&self, other: &Capabilities) -> Capabilities {
        Capabilities(self.0.intersection(&other.0).cloned().collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for Capabilities {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for capability in &self.0 {
            if !first {
                f.write_str(" ")?;
            }
            f.write_str(capability)?;
            first = false;
        }
        Ok(())
    }
}
