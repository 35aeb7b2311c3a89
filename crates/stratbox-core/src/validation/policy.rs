//! Validation policy: allow-list, denylists, weights and threshold.
//!
//! The policy is an immutable value handed to the validator at construction.
//! Nothing here is global; two validators with different policies can run
//! side by side.

use super::types::RuleId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Score contributed by each issue of a given rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleWeights {
    pub syntax_error: u32,
    pub source_too_large: u32,
    pub forbidden_import: u32,
    pub forbidden_call: u32,
    pub forbidden_attribute: u32,
    pub scope_rebinding: u32,
    pub star_import: u32,
    pub bare_except: u32,
}

impl Default for RuleWeights {
    fn default() -> Self {
        Self {
            syntax_error: 100,
            source_too_large: 100,
            forbidden_import: 40,
            forbidden_call: 50,
            forbidden_attribute: 40,
            scope_rebinding: 15,
            star_import: 10,
            bare_except: 5,
        }
    }
}

impl RuleWeights {
    /// Weight for a rule
    pub fn weight_for(&self, rule: RuleId) -> u32 {
        match rule {
            RuleId::SyntaxError => self.syntax_error,
            RuleId::SourceTooLarge => self.source_too_large,
            RuleId::ForbiddenImport => self.forbidden_import,
            RuleId::ForbiddenCall => self.forbidden_call,
            RuleId::ForbiddenAttribute => self.forbidden_attribute,
            RuleId::ScopeRebinding => self.scope_rebinding,
            RuleId::StarImport => self.star_import,
            RuleId::BareExcept => self.bare_except,
            RuleId::RiskThresholdExceeded => 0,
        }
    }
}

/// Static validation policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationPolicy {
    /// Modules that may be imported; everything else is denied
    pub allowed_imports: BTreeSet<String>,

    /// Function names whose call or reference is blocking
    pub forbidden_functions: BTreeSet<String>,

    /// Attribute names whose access is blocking
    pub forbidden_attributes: BTreeSet<String>,

    /// Escalate warning-level constructs to blocking
    pub strict_mode: bool,

    /// Scores above this value reject the source
    pub risk_threshold: u8,

    /// Per-rule score contributions
    pub weights: RuleWeights,

    /// Sources larger than this are rejected without parsing
    pub max_source_bytes: usize,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            allowed_imports: to_set(default_allowed_imports()),
            forbidden_functions: to_set(default_forbidden_functions()),
            forbidden_attributes: to_set(default_forbidden_attributes()),
            strict_mode: false,
            risk_threshold: 50,
            weights: RuleWeights::default(),
            max_source_bytes: 256 * 1024, // 256 KB
        }
    }
}

impl ValidationPolicy {
    /// Create a strict policy (warnings block, lower threshold)
    pub fn strict() -> Self {
        Self {
            strict_mode: true,
            risk_threshold: 30,
            max_source_bytes: 64 * 1024,
            ..Self::default()
        }
    }

    /// Add an allowed import
    pub fn allow_import(mut self, module: impl Into<String>) -> Self {
        self.allowed_imports.insert(module.into());
        self
    }

    /// Add a forbidden function
    pub fn forbid_function(mut self, name: impl Into<String>) -> Self {
        self.forbidden_functions.insert(name.into());
        self
    }

    /// Add a forbidden attribute
    pub fn forbid_attribute(mut self, name: impl Into<String>) -> Self {
        self.forbidden_attributes.insert(name.into());
        self
    }

    /// Check whether a dotted module name may be imported
    ///
    /// A module is allowed when its full dotted name or its top-level package
    /// is on the allow-list.
    pub fn is_import_allowed(&self, module: &str) -> bool {
        if module.is_empty() {
            return false;
        }
        let top_level = module.split('.').next().unwrap_or(module);
        self.allowed_imports.contains(module) || self.allowed_imports.contains(top_level)
    }

    /// Check whether a (possibly dotted) callee name is forbidden
    ///
    /// Matches the full dotted name or its final segment, so `os.system` is
    /// caught by either `os.system` or `system` on the denylist.
    pub fn is_function_forbidden(&self, name: &str) -> bool {
        let last = name.rsplit('.').next().unwrap_or(name);
        self.forbidden_functions.contains(name) || self.forbidden_functions.contains(last)
    }

    /// Check whether an attribute name is forbidden
    pub fn is_attribute_forbidden(&self, attr: &str) -> bool {
        self.forbidden_attributes.contains(attr)
    }

    /// Validate internal consistency
    pub fn validate(&self) -> Result<(), String> {
        if self.risk_threshold > 100 {
            return Err(format!(
                "risk_threshold must be within 0..=100, got {}",
                self.risk_threshold
            ));
        }
        if self.max_source_bytes == 0 {
            return Err("max_source_bytes must be greater than 0".to_string());
        }
        if let Some(name) = self
            .allowed_imports
            .iter()
            .find(|m| m.is_empty() || m.starts_with('.'))
        {
            return Err(format!("invalid allowed import '{}'", name));
        }
        Ok(())
    }
}

fn to_set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Modules a typical strategy computation needs
pub fn default_allowed_imports() -> &'static [&'static str] {
    &[
        // Numerics
        "math",
        "cmath",
        "decimal",
        "fractions",
        "numbers",
        "statistics",
        "random",
        // Data structures and functional helpers
        "collections",
        "heapq",
        "bisect",
        "array",
        "itertools",
        "functools",
        "operator",
        "copy",
        // Types
        "typing",
        "dataclasses",
        "enum",
        "abc",
        // Text and data formats
        "string",
        "re",
        "json",
        // Time
        "datetime",
        "time",
        "calendar",
        // Scientific stack
        "numpy",
        "pandas",
    ]
}

/// Functions that grant capabilities the guest must not have
pub fn default_forbidden_functions() -> &'static [&'static str] {
    &[
        // Dynamic code evaluation
        "eval",
        "exec",
        "compile",
        "__import__",
        "import_module",
        "reload",
        // Reflection and environment escapes
        "globals",
        "locals",
        "vars",
        "getattr",
        "setattr",
        "delattr",
        "attrgetter",
        "methodcaller",
        "breakpoint",
        "getenv",
        "putenv",
        "unsetenv",
        // Interactive input and interpreter control
        "input",
        "help",
        "exit",
        "quit",
        // File I/O
        "open",
        "remove",
        "unlink",
        "rmdir",
        "rename",
        "chmod",
        "chown",
        "mkdir",
        "makedirs",
        "read_text",
        "read_bytes",
        "write_text",
        "write_bytes",
        // numpy file I/O
        "load",
        "loadtxt",
        "genfromtxt",
        "fromfile",
        "fromregex",
        "memmap",
        "save",
        "savez",
        "savez_compressed",
        "savetxt",
        "tofile",
        // pandas readers and writers
        "read_csv",
        "read_table",
        "read_fwf",
        "read_json",
        "read_pickle",
        "read_excel",
        "read_parquet",
        "read_feather",
        "read_orc",
        "read_hdf",
        "read_sql",
        "read_sql_query",
        "read_sql_table",
        "read_html",
        "read_xml",
        "read_stata",
        "read_sas",
        "read_spss",
        "read_clipboard",
        "to_csv",
        "to_json",
        "to_pickle",
        "to_excel",
        "to_parquet",
        "to_feather",
        "to_orc",
        "to_hdf",
        "to_sql",
        "to_html",
        "to_xml",
        "to_stata",
        "to_clipboard",
        // Process spawning
        "system",
        "popen",
        "fork",
        "forkpty",
        "kill",
        "execv",
        "execve",
        "execvp",
        "execl",
        "execlp",
        "spawnv",
        "spawnl",
        "posix_spawn",
        "check_output",
        "check_call",
        // Network I/O
        "socket",
        "create_connection",
        "urlopen",
        "getaddrinfo",
    ]
}

/// Attributes that reach interpreter internals
pub fn default_forbidden_attributes() -> &'static [&'static str] {
    &[
        "__class__",
        "__base__",
        "__bases__",
        "__mro__",
        "__subclasses__",
        "__globals__",
        "__builtins__",
        "__code__",
        "__closure__",
        "__dict__",
        "__getattribute__",
        "__reduce__",
        "__reduce_ex__",
        "__loader__",
        "__spec__",
        "__import__",
        "__self__",
        "__func__",
        "func_globals",
        "f_globals",
        "f_locals",
        "f_builtins",
        "f_back",
        "f_code",
        "gi_frame",
        "gi_code",
        "cr_frame",
        "ag_frame",
        "tb_frame",
        "tb_next",
        "co_code",
        "environ",
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = ValidationPolicy::default();
        assert!(!policy.strict_mode);
        assert_eq!(policy.risk_threshold, 50);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_import_allow_list() {
        let policy = ValidationPolicy::default();
        assert!(policy.is_import_allowed("math"));
        assert!(policy.is_import_allowed("collections.abc"));
        assert!(!policy.is_import_allowed("os"));
        assert!(!policy.is_import_allowed("subprocess"));
        assert!(!policy.is_import_allowed(""));
    }

    #[test]
    fn test_dotted_allow_entry_does_not_allow_parent() {
        let policy = ValidationPolicy::default().allow_import("os.path");
        assert!(policy.is_import_allowed("os.path"));
        assert!(!policy.is_import_allowed("os"));
    }

    #[test]
    fn test_forbidden_function_matching() {
        let policy = ValidationPolicy::default();
        assert!(policy.is_function_forbidden("eval"));
        assert!(policy.is_function_forbidden("os.system"));
        assert!(policy.is_function_forbidden("subprocess.check_output"));
        assert!(!policy.is_function_forbidden("print"));
        assert!(!policy.is_function_forbidden("math.sqrt"));
    }

    #[test]
    fn test_data_library_file_io_is_forbidden() {
        let policy = ValidationPolicy::default();
        for name in [
            "pd.read_pickle",
            "pandas.read_csv",
            "df.to_csv",
            "np.load",
            "numpy.fromfile",
            "arr.tofile",
            "np.savez_compressed",
            "operator.attrgetter",
        ] {
            assert!(policy.is_function_forbidden(name), "{}", name);
        }
        assert!(!policy.is_function_forbidden("df.to_dict"));
        assert!(!policy.is_function_forbidden("np.mean"));
        assert!(!policy.is_function_forbidden("json.loads"));
    }

    #[test]
    fn test_forbidden_attribute() {
        let policy = ValidationPolicy::default();
        assert!(policy.is_attribute_forbidden("__subclasses__"));
        assert!(policy.is_attribute_forbidden("f_globals"));
        assert!(!policy.is_attribute_forbidden("append"));
    }

    #[test]
    fn test_weights() {
        let weights = RuleWeights::default();
        assert_eq!(weights.weight_for(RuleId::SyntaxError), 100);
        assert_eq!(weights.weight_for(RuleId::RiskThresholdExceeded), 0);
        assert!(weights.weight_for(RuleId::BareExcept) < weights.weight_for(RuleId::ForbiddenCall));
    }

    #[test]
    fn test_invalid_threshold() {
        let policy = ValidationPolicy {
            risk_threshold: 120,
            ..Default::default()
        };
        assert!(policy.validate().unwrap_err().contains("risk_threshold"));
    }

    #[test]
    fn test_policy_from_toml_keeps_defaults() {
        let policy: ValidationPolicy = toml::from_str(
            r#"
            strict_mode = true
            allowed_imports = ["math"]

            [weights]
            bare_except = 25
            "#,
        )
        .unwrap();
        assert!(policy.strict_mode);
        assert_eq!(policy.allowed_imports.len(), 1);
        assert_eq!(policy.weights.bare_except, 25);
        assert_eq!(policy.weights.forbidden_call, 50);
        assert!(policy.is_function_forbidden("eval"));
    }
}
