//! Missing key policy - Decides what happens to recipients without a key
//!
//! Rules are evaluated in declared order and the first match wins. A
//! recipient that no rule matches gets [`Disposition::Notify`].

use cipherpost_common::config::RuleConfig;
use cipherpost_common::Disposition;
use regex::Regex;
use tracing::{debug, error, warn};

/// A compiled missing key rule
#[derive(Debug, Clone)]
pub struct PolicyRule {
    /// Pattern as written in the configuration
    pub pattern: String,
    /// Action applied to matching recipients
    pub action: Disposition,
    regex: Regex,
}

impl PolicyRule {
    /// Compile a rule. The pattern must match from the first character of
    /// the address.
    pub fn new(pattern: &str, action: Disposition) -> Result<Self, regex::Error> {
        let regex = Regex::new(&format!("^(?:{})", pattern))?;
        Ok(Self {
            pattern: pattern.to_string(),
            action,
            regex,
        })
    }

    pub fn matches(&self, address: &str) -> bool {
        self.regex.is_match(address)
    }
}

/// Ordered first-match rule set
#[derive(Debug, Clone, Default)]
pub struct MissingKeyPolicy {
    rules: Vec<PolicyRule>,
}

impl MissingKeyPolicy {
    /// Create a policy from already compiled rules
    pub fn new(rules: Vec<PolicyRule>) -> Self {
        Self { rules }
    }

    /// Build the policy from configuration.
    ///
    /// Rules with an unknown action or an invalid pattern are logged and
    /// discarded. The deprecated `force_encrypt` flag only applies when no
    /// rule section exists at all.
    pub fn from_config(rules: Option<&[RuleConfig]>, force_encrypt: Option<bool>) -> Self {
        let Some(rules) = rules else {
            return match force_encrypt {
                Some(force) => {
                    warn!("'force_encrypt' is deprecated, use missing_key_rules instead");
                    let action = if force {
                        Disposition::Drop
                    } else {
                        Disposition::Cleartext
                    };
                    match PolicyRule::new(".*", action) {
                        Ok(rule) => Self::new(vec![rule]),
                        Err(e) => {
                            error!("Failed to build catch-all rule: {}", e);
                            Self::default()
                        }
                    }
                }
                None => Self::default(),
            };
        };

        if force_encrypt.is_some() {
            warn!("Ignoring deprecated 'force_encrypt' because missing_key_rules is set");
        }

        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let action = match rule.action.parse::<Disposition>() {
                Ok(action) => action,
                Err(e) => {
                    error!(pattern = %rule.pattern, "Discarding missing key rule: {}", e);
                    continue;
                }
            };

            match PolicyRule::new(&rule.pattern, action) {
                Ok(rule) => compiled.push(rule),
                Err(e) => {
                    error!(pattern = %rule.pattern, "Discarding missing key rule with invalid pattern: {}", e);
                }
            }
        }

        Self::new(compiled)
    }

    /// Disposition for a recipient that has no usable key
    pub fn get_action(&self, address: &str) -> Disposition {
        for rule in &self.rules {
            if rule.matches(address) {
                debug!(
                    recipient = %address,
                    pattern = %rule.pattern,
                    action = %rule.action,
                    "Missing key rule matched"
                );
                return rule.action;
            }
        }

        Disposition::default()
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }
}
