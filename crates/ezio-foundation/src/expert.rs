//! Expert registry
//!
//! Experts are the model-backed specialists the agent routes requests to.
//! The control plane only needs to know what each one is called, what it is
//! for and how much accelerator memory it needs. Kinds are registered as
//! constructors at startup; the configured expert list is instantiated from
//! them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ControlError, ControlResult};

const MIB: u64 = 1024 * 1024;

/// What an expert is good at
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    #[default]
    Conversation,
    Reasoning,
    Code,
    Tools,
    Analysis,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Capability::Conversation => "conversation",
            Capability::Reasoning => "reasoning",
            Capability::Code => "code",
            Capability::Tools => "tools",
            Capability::Analysis => "analysis",
        };
        f.write_str(name)
    }
}

/// One configured expert
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpertSpec {
    pub name: String,
    /// Registered kind used to build it
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub capability: Capability,
    /// Accelerator memory to reserve, in MiB
    #[serde(default)]
    pub required_memory_mb: u64,
    /// Backing model name, if the kind needs one
    #[serde(default)]
    pub model: Option<String>,
}

fn default_kind() -> String {
    LlmExpert::KIND.to_string()
}

impl ExpertSpec {
    pub fn new(name: impl Into<String>, capability: Capability, required_memory_mb: u64) -> Self {
        Self {
            name: name.into(),
            kind: default_kind(),
            capability,
            required_memory_mb,
            model: None,
        }
    }

    /// Reservation in bytes; `None` if it does not fit in a `u64`
    pub fn required_memory_bytes(&self) -> Option<u64> {
        self.required_memory_mb.checked_mul(MIB)
    }
}

/// A placed specialist
pub trait Expert: Send + Sync {
    fn name(&self) -> &str;

    fn capability(&self) -> Capability;

    fn required_memory_bytes(&self) -> u64;

    fn model(&self) -> Option<&str> {
        None
    }
}

/// Expert served by a local LLM
#[derive(Debug, Clone)]
pub struct LlmExpert {
    name: String,
    capability: Capability,
    required_memory_bytes: u64,
    model: String,
}

impl LlmExpert {
    pub const KIND: &'static str = "llm";
    pub const DEFAULT_MODEL: &'static str = "llama3";

    pub fn from_spec(spec: &ExpertSpec) -> Self {
        Self {
            name: spec.name.clone(),
            capability: spec.capability,
            required_memory_bytes: spec.required_memory_mb.saturating_mul(MIB),
            model: spec
                .model
                .clone()
                .unwrap_or_else(|| Self::DEFAULT_MODEL.to_string()),
        }
    }
}

impl Expert for LlmExpert {
    fn name(&self) -> &str {
        &self.name
    }

    fn capability(&self) -> Capability {
        self.capability
    }

    fn required_memory_bytes(&self) -> u64 {
        self.required_memory_bytes
    }

    fn model(&self) -> Option<&str> {
        Some(&self.model)
    }
}

/// Builds an expert of one kind from its spec
pub type ExpertConstructor = Arc<dyn Fn(&ExpertSpec) -> Box<dyn Expert> + Send + Sync>;

/// Kind name to constructor
#[derive(Default, Clone)]
pub struct ExpertRegistry {
    constructors: HashMap<String, ExpertConstructor>,
}

impl ExpertRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `llm` kind
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(LlmExpert::KIND, |spec| Box::new(LlmExpert::from_spec(spec)));
        registry
    }

    /// Register `kind`, replacing any previous constructor
    pub fn register<F>(&mut self, kind: impl Into<String>, constructor: F)
    where
        F: Fn(&ExpertSpec) -> Box<dyn Expert> + Send + Sync + 'static,
    {
        self.constructors.insert(kind.into(), Arc::new(constructor));
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<_> = self.constructors.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn build(&self, spec: &ExpertSpec) -> ControlResult<Box<dyn Expert>> {
        let constructor = self.constructors.get(&spec.kind).ok_or_else(|| {
            ControlError::Config(format!(
                "expert '{}' has unknown kind '{}'",
                spec.name, spec.kind
            ))
        })?;
        Ok(constructor(spec))
    }
}

impl std::fmt::Debug for ExpertRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpertRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo(String);

    impl Expert for Echo {
        fn name(&self) -> &str {
            &self.0
        }

        fn capability(&self) -> Capability {
            Capability::Tools
        }

        fn required_memory_bytes(&self) -> u64 {
            0
        }
    }

    #[test]
    fn test_builtin_llm_kind() {
        let registry = ExpertRegistry::with_builtin();
        let expert = registry
            .build(&ExpertSpec::new("analyst", Capability::Analysis, 4096))
            .unwrap();

        assert_eq!(expert.name(), "analyst");
        assert_eq!(expert.capability(), Capability::Analysis);
        assert_eq!(expert.required_memory_bytes(), 4096 * MIB);
        assert_eq!(expert.model(), Some(LlmExpert::DEFAULT_MODEL));
    }

    #[test]
    fn test_custom_kind() {
        let mut registry = ExpertRegistry::with_builtin();
        registry.register("echo", |spec| Box::new(Echo(spec.name.clone())));
        assert_eq!(registry.kinds(), vec!["echo", "llm"]);

        let spec = ExpertSpec {
            kind: "echo".into(),
            ..ExpertSpec::new("shell", Capability::Tools, 0)
        };
        let expert = registry.build(&spec).unwrap();
        assert_eq!(expert.capability(), Capability::Tools);
        assert!(expert.model().is_none());
    }

    #[test]
    fn test_unknown_kind_is_config_error() {
        let registry = ExpertRegistry::with_builtin();
        let spec = ExpertSpec {
            kind: "wasm".into(),
            ..ExpertSpec::new("x", Capability::Code, 1)
        };
        assert!(matches!(registry.build(&spec), Err(ControlError::Config(_))));
    }

    #[test]
    fn test_spec_defaults_from_json() {
        let spec: ExpertSpec =
            serde_json::from_str(r#"{ "name": "coder", "capability": "code" }"#).unwrap();
        assert_eq!(spec.kind, "llm");
        assert_eq!(spec.capability, Capability::Code);
        assert_eq!(spec.required_memory_mb, 0);
    }
}
