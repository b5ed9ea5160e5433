//! Token validation for incoming connections.

use crate::config::HubConfig;
use fxb_core::AccountId;
use std::collections::HashMap;

/// Who a validated token belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    /// A trader bound to one account login.
    Trader(AccountId),
    /// An operator; may subscribe to the aggregated channels.
    Admin,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Admin)
    }

    pub fn account(&self) -> Option<AccountId> {
        match self {
            Self::Trader(id) => Some(*id),
            Self::Admin => None,
        }
    }
}

/// Validates the `token` query parameter against configured credentials.
pub struct TokenValidator {
    traders: HashMap<String, AccountId>,
    admins: Vec<String>,
}

impl TokenValidator {
    pub fn from_config(config: &HubConfig) -> Self {
        Self {
            traders: config.trader_tokens.clone(),
            admins: config.admin_tokens.clone(),
        }
    }

    /// None means the connection must be closed with code 1008.
    pub fn validate(&self, token: &str) -> Option<Identity> {
        if token.is_empty() {
            return None;
        }
        if self.admins.iter().any(|t| t == token) {
            return Some(Identity::Admin);
        }
        self.traders.get(token).copied().map(Identity::Trader)
    }
}
