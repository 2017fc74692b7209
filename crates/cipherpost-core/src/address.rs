//! Recipient alias resolution

use std::collections::HashMap;
use tracing::info;

/// Maps recipient addresses through a static, exact-match alias table
#[derive(Debug, Clone, Default)]
pub struct AliasResolver {
    aliases: HashMap<String, String>,
}

impl AliasResolver {
    pub fn new(aliases: HashMap<String, String>) -> Self {
        Self { aliases }
    }

    /// Address used for key lookup. Unknown addresses are returned as is.
    pub fn resolve(&self, address: &str) -> String {
        match self.aliases.get(address) {
            Some(alias) => {
                info!(recipient = %address, alias = %alias, "Using alias for key lookup");
                alias.clone()
            }
            None => address.to_string(),
        }
    }
}
