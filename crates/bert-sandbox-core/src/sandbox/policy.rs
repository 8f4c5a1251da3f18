//! Allow/deny lists the validator enforces.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Modules inference code may import (matched on the root package).
const STANDARD_MODULES: &[&str] = &[
    // numeric / ML stack
    "numpy",
    "torch",
    "transformers",
    "tokenizers",
    "scipy",
    "sklearn",
    "sentence_transformers",
    // stdlib helpers
    "collections",
    "dataclasses",
    "functools",
    "itertools",
    "json",
    "math",
    "random",
    "re",
    "statistics",
    "string",
    "time",
    "typing",
    "unicodedata",
];

/// Builtins reached by bare name that evaluate code, touch the filesystem
/// or expose interpreter internals.
const STANDARD_DENIED_CALLS: &[&str] = &[
    "__import__",
    "breakpoint",
    "compile",
    "delattr",
    "eval",
    "exec",
    "exit",
    "getattr",
    "globals",
    "help",
    "locals",
    "memoryview",
    "open",
    "quit",
    "setattr",
    "vars",
];

/// Method names that spawn processes, delete files or load modules.
///
/// Kept separate from the builtins so that ordinary methods such as
/// `model.eval()` stay usable.
const STANDARD_DENIED_METHODS: &[&str] = &[
    "check_call",
    "check_output",
    "daemon",
    "execl",
    "execle",
    "execlp",
    "execlpe",
    "execv",
    "execve",
    "execvp",
    "execvpe",
    "fork",
    "forkpty",
    "getoutput",
    "import_module",
    "kill",
    "killpg",
    "load_module",
    "popen",
    "Popen",
    "posix_spawn",
    "posix_spawnp",
    "remove",
    "rmdir",
    "rmtree",
    "setpgid",
    "setpgrp",
    "setsid",
    "spawn",
    "spawnl",
    "spawnle",
    "spawnlp",
    "spawnlpe",
    "spawnv",
    "spawnve",
    "spawnvp",
    "spawnvpe",
    "startfile",
    "system",
    "unlink",
];

const STANDARD_DENIED_ATTRIBUTES: &[&str] = &[
    "__base__",
    "__bases__",
    "__builtins__",
    "__class__",
    "__closure__",
    "__code__",
    "__dict__",
    "__func__",
    "__getattribute__",
    "__globals__",
    "__import__",
    "__loader__",
    "__mro__",
    "__reduce__",
    "__reduce_ex__",
    "__self__",
    "__spec__",
    "__subclasses__",
    // system modules re-exported by allowed ones, e.g. `typing.sys`
    "builtins",
    "ctypes",
    "importlib",
    "os",
    "posix",
    "shutil",
    "socket",
    "subprocess",
    "sys",
    "co_code",
    "cr_frame",
    "f_back",
    "f_builtins",
    "f_code",
    "f_globals",
    "f_locals",
    "gi_code",
    "gi_frame",
    "tb_frame",
];

fn to_set(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|n| (*n).to_string()).collect()
}

/// `_name` but not `__name__`: a module's private bindings, such as the
/// `os` that `random` keeps as `random._os`.
fn is_private(name: &str) -> bool {
    name.starts_with('_') && !(name.len() > 4 && name.starts_with("__") && name.ends_with("__"))
}

/// The fixed lists a submission is checked against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorPolicy {
    pub allowed_modules: BTreeSet<String>,
    pub denied_calls: BTreeSet<String>,
    pub denied_methods: BTreeSet<String>,
    pub denied_attributes: BTreeSet<String>,
    /// Reject `obj._private` and `from module import _private`.
    pub deny_private_attributes: bool,
}

impl Default for ValidatorPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

impl ValidatorPolicy {
    /// A policy that allows no imports and denies nothing else.
    pub fn empty() -> Self {
        Self {
            allowed_modules: BTreeSet::new(),
            denied_calls: BTreeSet::new(),
            denied_methods: BTreeSet::new(),
            denied_attributes: BTreeSet::new(),
            deny_private_attributes: false,
        }
    }

    /// The policy BERT Studio ships with.
    pub fn standard() -> Self {
        Self {
            allowed_modules: to_set(STANDARD_MODULES),
            denied_calls: to_set(STANDARD_DENIED_CALLS),
            denied_methods: to_set(STANDARD_DENIED_METHODS),
            denied_attributes: to_set(STANDARD_DENIED_ATTRIBUTES),
            deny_private_attributes: true,
        }
    }

    pub fn allow_module(mut self, module: impl Into<String>) -> Self {
        self.allowed_modules.insert(module.into());
        self
    }

    pub fn deny_call(mut self, name: impl Into<String>) -> Self {
        self.denied_calls.insert(name.into());
        self
    }

    pub fn deny_method(mut self, name: impl Into<String>) -> Self {
        self.denied_methods.insert(name.into());
        self
    }

    pub fn deny_attribute(mut self, name: impl Into<String>) -> Self {
        self.denied_attributes.insert(name.into());
        self
    }

    /// `true` if `module` (possibly dotted) has an allowed root package.
    pub fn allows_import(&self, module: &str) -> bool {
        let root = module.split('.').next().unwrap_or(module);
        self.allowed_modules.contains(root)
    }

    pub fn denies_call(&self, name: &str) -> bool {
        self.denied_calls.contains(name)
    }

    pub fn denies_method(&self, name: &str) -> bool {
        self.denied_methods.contains(name)
    }

    pub fn denies_attribute(&self, name: &str) -> bool {
        self.denied_attributes.contains(name)
    }

    /// `true` if `obj.name` may not be read, listed or private.
    pub fn denies_attribute_access(&self, name: &str) -> bool {
        self.denies_attribute(name) || (self.deny_private_attributes && is_private(name))
    }

    /// Bare names that may not even be referenced, e.g. `f = eval`.
    pub fn denies_name(&self, name: &str) -> bool {
        self.denies_call(name) || self.denies_attribute(name)
    }
}
