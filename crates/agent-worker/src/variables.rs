// Thread-safe variable store with secret registration, `$(name)` macro
// expansion, and environment block export.

use agent_common::SecretMasker;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::messages::VariableValueMessage;

/// A single variable entry with metadata.
#[derive(Debug, Clone)]
pub struct VariableValue {
    pub value: String,
    /// Secret values are registered with the masker and withheld from the
    /// environment block.
    pub is_secret: bool,
    /// Read-only variables cannot be overwritten by the job.
    pub is_read_only: bool,
    /// Keep the original casing when exporting to the environment.
    pub preserve_case: bool,
}

struct VariablesInner {
    /// Keyed by lowercase name; the original-cased name rides along for
    /// environment export.
    store: HashMap<String, (String, VariableValue)>,
}

/// Case-insensitive variable store for job/step execution.
///
/// Secret values are registered with the `SecretMasker` on every set, which
/// is what makes registration happen-before any use of the value.
#[derive(Clone)]
pub struct Variables {
    inner: Arc<RwLock<VariablesInner>>,
    secret_masker: Option<SecretMasker>,
}

impl std::fmt::Debug for Variables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Variables")
            .field("count", &inner.store.len())
            .finish()
    }
}

impl Default for Variables {
    fn default() -> Self {
        Self::new()
    }
}

impl Variables {
    /// Create an empty variable store (no secret masker).
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(VariablesInner {
                store: HashMap::new(),
            })),
            secret_masker: None,
        }
    }

    /// Create a variable store bound to a secret masker.
    pub fn with_masker(masker: SecretMasker) -> Self {
        Self {
            inner: Arc::new(RwLock::new(VariablesInner {
                store: HashMap::new(),
            })),
            secret_masker: Some(masker),
        }
    }

    /// Build a `Variables` instance from the job request variable mapping,
    /// registering every secret with the masker.
    pub fn from_request(
        variables: &HashMap<String, VariableValueMessage>,
        masker: &SecretMasker,
    ) -> Self {
        let vars = Self::with_masker(masker.clone());

        for (name, var) in variables {
            if var.is_secret && !var.value.is_empty() {
                masker.add_value(&var.value, &format!("Variable:{name}"));
            }
            vars.inner.write().store.insert(
                name.to_lowercase(),
                (
                    name.clone(),
                    VariableValue {
                        value: var.value.clone(),
                        is_secret: var.is_secret,
                        is_read_only: var.is_read_only,
                        preserve_case: false,
                    },
                ),
            );
        }

        vars
    }

    /// Get a variable value by name (case-insensitive).
    pub fn get(&self, name: &str) -> Option<String> {
        let inner = self.inner.read();
        inner
            .store
            .get(&name.to_lowercase())
            .map(|(_, v)| v.value.clone())
    }

    /// Get a variable as a boolean, if present and recognizable.
    pub fn get_boolean(&self, name: &str) -> Option<bool> {
        self.get(name)
            .and_then(|v| agent_sdk::StringUtil::convert_to_bool(&v))
    }

    /// Set a variable. Secret values are registered with the masker first.
    /// Returns `false` if the variable is read-only and was not overwritten.
    pub fn set(
        &self,
        name: &str,
        value: impl Into<String>,
        is_secret: bool,
        is_read_only: bool,
        preserve_case: bool,
    ) -> bool {
        let value = value.into();
        let key = name.to_lowercase();

        if is_secret && !value.is_empty() {
            if let Some(ref masker) = self.secret_masker {
                masker.add_value(&value, &format!("Variable:{name}"));
            }
        }

        let mut inner = self.inner.write();
        if let Some((_, existing)) = inner.store.get(&key) {
            if existing.is_read_only {
                return false;
            }
        }

        inner.store.insert(
            key,
            (
                name.to_string(),
                VariableValue {
                    value,
                    is_secret,
                    is_read_only,
                    preserve_case,
                },
            ),
        );
        true
    }

    /// Check if a variable exists.
    pub fn contains_key(&self, name: &str) -> bool {
        self.inner.read().store.contains_key(&name.to_lowercase())
    }

    /// Number of variables.
    pub fn len(&self) -> usize {
        self.inner.read().store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().store.is_empty()
    }

    /// Expand `$(name)` macros in `input` with recursive substitution.
    ///
    /// Cycles are broken where detected: the offending macro is left
    /// unexpanded and a warning is returned for each cycle. Unknown names
    /// are left as-is.
    pub fn expand(&self, input: &str) -> (String, Vec<String>) {
        let mut warnings = Vec::new();
        let mut active = Vec::new();
        let result = self.expand_inner(input, &mut active, &mut warnings);
        (result, warnings)
    }

    fn expand_inner(
        &self,
        input: &str,
        active: &mut Vec<String>,
        warnings: &mut Vec<String>,
    ) -> String {
        let mut result = String::with_capacity(input.len());
        let mut rest = input;

        while let Some(start) = rest.find("$(") {
            result.push_str(&rest[..start]);
            let after = &rest[start..];
            match after.find(')') {
                Some(end) => {
                    let name = &after[2..end];
                    let key = name.to_lowercase();
                    if active.contains(&key) {
                        warnings.push(format!(
                            "Detected cyclic macro expansion while resolving variable '{name}'."
                        ));
                        result.push_str(&after[..=end]);
                    } else if let Some(value) = self.get(name) {
                        active.push(key);
                        let expanded = self.expand_inner(&value, active, warnings);
                        active.pop();
                        result.push_str(&expanded);
                    } else {
                        result.push_str(&after[..=end]);
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    result.push_str(after);
                    rest = "";
                }
            }
        }

        result.push_str(rest);
        result
    }

    /// Copy all non-secret variables into an environment block.
    ///
    /// Names are upper-cased with `.` replaced by `_` unless the variable
    /// asked to preserve its casing.
    pub fn copy_into_env_block(&self) -> HashMap<String, String> {
        let inner = self.inner.read();
        let mut env = HashMap::new();
        for (original, var) in inner.store.values() {
            if var.is_secret {
                continue;
            }
            let name = if var.preserve_case {
                original.clone()
            } else {
                original.to_uppercase().replace('.', "_")
            };
            env.insert(name, var.value.clone());
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_set_is_case_insensitive() {
        let vars = Variables::new();
        vars.set("MY_VAR", "hello", false, false, false);
        assert_eq!(vars.get("my_var"), Some("hello".to_string()));
        assert_eq!(vars.get("My_Var"), Some("hello".to_string()));
    }

    #[test]
    fn read_only_blocks_overwrite() {
        let vars = Variables::new();
        vars.set("TOKEN", "original", false, true, false);
        assert!(!vars.set("token", "overwrite", false, false, false));
        assert_eq!(vars.get("TOKEN"), Some("original".to_string()));
    }

    #[test]
    fn secrets_register_with_masker() {
        let masker = SecretMasker::new();
        let vars = Variables::with_masker(masker.clone());
        vars.set("API_KEY", "super-api-key", true, false, false);
        assert_eq!(masker.mask("using super-api-key now"), "using *** now");
    }

    #[test]
    fn expand_substitutes_recursively() {
        let vars = Variables::new();
        vars.set("greeting", "hello $(target)", false, false, false);
        vars.set("target", "world", false, false, false);
        let (result, warnings) = vars.expand("say: $(greeting)!");
        assert_eq!(result, "say: hello world!");
        assert!(warnings.is_empty());
    }

    #[test]
    fn expand_leaves_unknown_macros() {
        let vars = Variables::new();
        let (result, warnings) = vars.expand("value is $(missing)");
        assert_eq!(result, "value is $(missing)");
        assert!(warnings.is_empty());
    }

    #[test]
    fn expand_breaks_cycles_with_warning() {
        let vars = Variables::new();
        vars.set("a", "$(b)", false, false, false);
        vars.set("b", "$(a)", false, false, false);
        let (result, warnings) = vars.expand("start $(a) end");
        assert_eq!(result, "start $(a) end");
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("cyclic"));
    }

    #[test]
    fn expand_self_reference_warns() {
        let vars = Variables::new();
        vars.set("loop", "x$(loop)x", false, false, false);
        let (result, warnings) = vars.expand("$(loop)");
        assert_eq!(result, "x$(loop)x");
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn env_block_excludes_secrets_and_rewrites_names() {
        let vars = Variables::new();
        vars.set("build.config", "Release", false, false, false);
        vars.set("MixedCase", "kept", false, false, true);
        vars.set("secret.value", "hidden", true, false, false);

        let env = vars.copy_into_env_block();
        assert_eq!(env.get("BUILD_CONFIG"), Some(&"Release".to_string()));
        assert_eq!(env.get("MixedCase"), Some(&"kept".to_string()));
        assert!(!env.values().any(|v| v == "hidden"));
    }

    #[test]
    fn from_request_registers_secrets() {
        let masker = SecretMasker::new();
        let mut map = HashMap::new();
        map.insert(
            "TOKEN".to_string(),
            VariableValueMessage {
                value: "s3cr3t-token".to_string(),
                is_secret: true,
                is_read_only: true,
            },
        );
        let vars = Variables::from_request(&map, &masker);
        assert_eq!(vars.get("token"), Some("s3cr3t-token".to_string()));
        assert_eq!(masker.mask("s3cr3t-token"), "***");
    }
}
