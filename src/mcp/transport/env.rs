//! Environment construction for stdio MCP server processes
//!
//! Child processes never inherit the parent environment wholesale. An
//! [`EnvPolicy`] names the variables that may be copied from the parent;
//! per-server overrides from configuration are then expanded against the
//! parent environment and layered on top.

use std::collections::HashMap;

/// `PATH` given to the child when neither the parent nor the overrides
/// supply one.
pub const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin";

/// Variables copied from the parent environment by [`EnvPolicy::default`].
///
/// Entries ending in `*` match by prefix.
pub const DEFAULT_ALLOWED_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LOGNAME",
    "SHELL",
    "TERM",
    "TMPDIR",
    "TZ",
    "LANG",
    "LANGUAGE",
    "LC_ALL",
    "LC_CTYPE",
    "LC_MESSAGES",
    "XDG_CONFIG_HOME",
    "XDG_DATA_HOME",
    "XDG_CACHE_HOME",
    "XDG_RUNTIME_DIR",
    "NODE_PATH",
    "NPM_CONFIG_PREFIX",
    "NVM_DIR",
    "PYTHONPATH",
    "PYTHONHOME",
    "VIRTUAL_ENV",
    "PYENV_ROOT",
    "UV_CACHE_DIR",
    "SYSTEMROOT",
    "APPDATA",
    "LOCALAPPDATA",
    "USERPROFILE",
];

/// Which parent variables a child process may see.
///
/// # Examples
///
/// ```
/// use std::collections::HashMap;
/// use mcpbridge::mcp::transport::EnvPolicy;
///
/// let parent = HashMap::from([
///     ("HOME".to_string(), "/home/dev".to_string()),
///     ("AWS_SECRET_ACCESS_KEY".to_string(), "hunter2".to_string()),
/// ]);
/// let env = EnvPolicy::default().build(&parent, &HashMap::new());
/// assert_eq!(env.get("HOME").map(String::as_str), Some("/home/dev"));
/// assert!(!env.contains_key("AWS_SECRET_ACCESS_KEY"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvPolicy {
    allowed: Vec<String>,
    default_path: String,
}

impl Default for EnvPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_VARS.iter().copied())
    }
}

impl EnvPolicy {
    /// Build a policy from an explicit allow-list.
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
            default_path: DEFAULT_PATH.to_string(),
        }
    }

    /// Replace the fallback `PATH`.
    pub fn with_default_path(mut self, path: impl Into<String>) -> Self {
        self.default_path = path.into();
        self
    }

    /// Add names to the allow-list.
    pub fn allow<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed.extend(names.into_iter().map(Into::into));
        self
    }

    /// Whether `name` may be copied from the parent.
    pub fn allows(&self, name: &str) -> bool {
        self.allowed.iter().any(|entry| match entry.strip_suffix('*') {
            Some(prefix) => name.starts_with(prefix),
            None => entry == name,
        })
    }

    /// Compute the child environment.
    ///
    /// Allowed parent variables are copied first. Each override value is
    /// expanded against the parent environment (`$VAR` and `${VAR}`, unset
    /// variables expand to the empty string) and then inserted, replacing any
    /// copied value. `PATH` falls back to the policy default when still
    /// absent.
    pub fn build(
        &self,
        parent: &HashMap<String, String>,
        overrides: &HashMap<String, String>,
    ) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = parent
            .iter()
            .filter(|(name, _)| self.allows(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        for (name, raw) in overrides {
            env.insert(name.clone(), expand_value(raw, parent));
        }

        env.entry("PATH".to_string())
            .or_insert_with(|| self.default_path.clone());
        env
    }

    /// [`EnvPolicy::build`] against the current process environment.
    ///
    /// Parent variables whose name or value is not valid Unicode are skipped.
    pub fn build_from_process(&self, overrides: &HashMap<String, String>) -> HashMap<String, String> {
        let parent: HashMap<String, String> = std::env::vars_os()
            .filter_map(|(name, value)| Some((name.into_string().ok()?, value.into_string().ok()?)))
            .collect();
        self.build(&parent, overrides)
    }
}

/// Expand `$VAR` and `${VAR}` references in `raw` using `parent`.
pub fn expand_value(raw: &str, parent: &HashMap<String, String>) -> String {
    shellexpand::env_with_context_no_errors(raw, |name: &str| {
        Some(parent.get(name).cloned().unwrap_or_default())
    })
    .into_owned()
}
