//! Shell command policy: ordered allow/deny rules per shell scope
//!
//! Evaluation is blacklist-first and default-deny. Patterns are compiled on
//! first use and cached on the rule; [`PolicyStore::reload`] swaps in a fresh
//! rule set, which drops every cached regex.

pub mod gate;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use tracing::debug;

use crate::config::{PolicyConfig, ScopePatterns};
use crate::pattern;

pub use self::gate::CommandGate;

/// Shell a command is evaluated and run under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellScope {
    Bash,
    PowerShell,
}

impl ShellScope {
    pub fn all() -> [Self; 2] {
        [Self::Bash, Self::PowerShell]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bash => "bash",
            Self::PowerShell => "powershell",
        }
    }
}

impl fmt::Display for ShellScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShellScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bash" | "sh" | "shell_b" => Ok(Self::Bash),
            "powershell" | "pwsh" | "ps" | "shell_a" => Ok(Self::PowerShell),
            other => Err(format!("unknown shell scope: {}", other)),
        }
    }
}

/// Whether a rule permits or forbids matching commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleKind {
    Allow,
    Deny,
}

/// One allow or deny pattern
#[derive(Debug, Clone)]
pub struct PolicyRule {
    pub pattern: String,
    pub kind: RuleKind,
    pub scope: ShellScope,
    compiled: OnceLock<Regex>,
}

impl PolicyRule {
    pub fn new(pattern: impl Into<String>, kind: RuleKind, scope: ShellScope) -> Self {
        Self {
            pattern: pattern.into(),
            kind,
            scope,
            compiled: OnceLock::new(),
        }
    }

    /// Test the rule against a normalized command
    pub fn matches(&self, command: &str) -> bool {
        self.compiled
            .get_or_init(|| pattern::safe_compile(&self.pattern))
            .is_match(command)
    }

    /// Whether the regex has been compiled yet
    pub fn is_compiled(&self) -> bool {
        self.compiled.get().is_some()
    }
}

/// Outcome of evaluating one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    /// An allow pattern matched and no deny pattern did
    Allowed { pattern: String },

    /// A deny pattern matched
    Blocked { pattern: String },

    /// Nothing matched, or only an empty command was given
    NotWhitelisted,
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

#[derive(Debug, Default)]
struct ScopeRules {
    deny: Vec<PolicyRule>,
    allow: Vec<PolicyRule>,
}

impl ScopeRules {
    fn from_patterns(scope: ShellScope, patterns: &ScopePatterns) -> Self {
        Self {
            deny: patterns
                .denied_patterns
                .iter()
                .map(|p| PolicyRule::new(p.as_str(), RuleKind::Deny, scope))
                .collect(),
            allow: patterns
                .allowed_patterns
                .iter()
                .map(|p| PolicyRule::new(p.as_str(), RuleKind::Allow, scope))
                .collect(),
        }
    }
}

#[derive(Debug, Default)]
struct RuleSet {
    bash: ScopeRules,
    powershell: ScopeRules,
}

impl RuleSet {
    fn from_config(config: &PolicyConfig) -> Self {
        Self {
            bash: ScopeRules::from_patterns(ShellScope::Bash, &config.bash),
            powershell: ScopeRules::from_patterns(ShellScope::PowerShell, &config.powershell),
        }
    }

    fn scope(&self, scope: ShellScope) -> &ScopeRules {
        match scope {
            ShellScope::Bash => &self.bash,
            ShellScope::PowerShell => &self.powershell,
        }
    }
}

/// Process-wide command policy, read-mostly
#[derive(Debug)]
pub struct PolicyStore {
    rules: RwLock<Arc<RuleSet>>,
    generation: AtomicU64,
}

impl PolicyStore {
    pub fn new(config: &PolicyConfig) -> Self {
        Self {
            rules: RwLock::new(Arc::new(RuleSet::from_config(config))),
            generation: AtomicU64::new(0),
        }
    }

    /// Replace every rule list; compiled patterns are discarded
    pub fn reload(&self, config: &PolicyConfig) {
        let fresh = Arc::new(RuleSet::from_config(config));
        match self.rules.write() {
            Ok(mut rules) => *rules = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Command policy reloaded (generation {})", generation);
    }

    /// Number of reloads since construction
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn snapshot(&self) -> Arc<RuleSet> {
        match self.rules.read() {
            Ok(rules) => rules.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Evaluate `command` for `scope`: deny wins, then allow, else default-deny
    pub fn evaluate(&self, command: &str, scope: ShellScope) -> PolicyDecision {
        let command = command.trim();
        if command.is_empty() {
            return PolicyDecision::NotWhitelisted;
        }

        let rules = self.snapshot();
        let scoped = rules.scope(scope);

        if let Some(rule) = scoped.deny.iter().find(|r| r.matches(command)) {
            debug!(scope = %scope, pattern = %rule.pattern, "Command matched deny pattern");
            return PolicyDecision::Blocked {
                pattern: rule.pattern.clone(),
            };
        }

        if let Some(rule) = scoped.allow.iter().find(|r| r.matches(command)) {
            return PolicyDecision::Allowed {
                pattern: rule.pattern.clone(),
            };
        }

        debug!(scope = %scope, "Command matched no allow pattern");
        PolicyDecision::NotWhitelisted
    }

    pub fn is_allowed(&self, command: &str, scope: ShellScope) -> bool {
        self.evaluate(command, scope).is_allowed()
    }

    /// Rules for one scope, deny rules first
    pub fn rules(&self, scope: ShellScope) -> Vec<PolicyRule> {
        let rules = self.snapshot();
        let scoped = rules.scope(scope);
        scoped.deny.iter().chain(scoped.allow.iter()).cloned().collect()
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new(&PolicyConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(allow: &[&str], deny: &[&str]) -> PolicyStore {
        let patterns = ScopePatterns {
            allowed_patterns: allow.iter().map(|s| s.to_string()).collect(),
            denied_patterns: deny.iter().map(|s| s.to_string()).collect(),
        };
        PolicyStore::new(&PolicyConfig {
            bash: patterns,
            powershell: ScopePatterns::default(),
        })
    }

    #[test]
    fn test_blacklist_precedence() {
        let store = store(&["^ls.*"], &[".*rm .*"]);

        assert!(store.is_allowed("ls -la", ShellScope::Bash));
        assert!(!store.is_allowed("ls; rm -rf /", ShellScope::Bash));
        assert_eq!(
            store.evaluate("ls; rm -rf /", ShellScope::Bash),
            PolicyDecision::Blocked {
                pattern: ".*rm .*".to_string()
            }
        );
    }

    #[test]
    fn test_default_deny() {
        let store = store(&["^git status$"], &[]);

        assert!(store.is_allowed("  git status  ", ShellScope::Bash));
        assert!(!store.is_allowed("git push", ShellScope::Bash));
        assert!(!store.is_allowed("", ShellScope::Bash));
        // Scopes are independent; an empty allow list denies everything
        assert!(!store.is_allowed("git status", ShellScope::PowerShell));
    }

    #[test]
    fn test_patterns_compile_lazily() {
        let store = store(&["^echo .*", "^cat .*"], &[]);
        assert!(store.rules(ShellScope::Bash).iter().all(|r| !r.is_compiled()));

        assert!(store.is_allowed("echo hi", ShellScope::Bash));

        let rules = store.rules(ShellScope::Bash);
        assert!(rules[0].is_compiled());
        assert!(!rules[1].is_compiled());
    }

    #[test]
    fn test_reload_replaces_rules() {
        let store = store(&["^echo .*"], &[]);
        assert!(store.is_allowed("echo hi", ShellScope::Bash));

        store.reload(&PolicyConfig {
            bash: ScopePatterns {
                allowed_patterns: vec!["^echo .*".to_string()],
                denied_patterns: vec!["secret".to_string()],
            },
            powershell: ScopePatterns::default(),
        });

        assert_eq!(store.generation(), 1);
        assert!(store.rules(ShellScope::Bash).iter().all(|r| !r.is_compiled()));
        assert!(store.is_allowed("echo hi", ShellScope::Bash));
        assert!(!store.is_allowed("echo secret", ShellScope::Bash));
    }

    #[test]
    fn test_invalid_pattern_matches_literally() {
        let store = store(&["^echo .*"], &["rm (-rf"]);

        assert!(store.is_allowed("echo rm -rf", ShellScope::Bash));
        assert!(!store.is_allowed("echo rm (-rf", ShellScope::Bash));
    }

    #[test]
    fn test_scope_parsing() {
        assert_eq!("bash".parse::<ShellScope>().unwrap(), ShellScope::Bash);
        assert_eq!("PowerShell".parse::<ShellScope>().unwrap(), ShellScope::PowerShell);
        assert_eq!("shell_a".parse::<ShellScope>().unwrap(), ShellScope::PowerShell);
        assert!("zsh".parse::<ShellScope>().is_err());
    }
}
