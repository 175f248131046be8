//! Resolver registry
//!
//! Resolvers are external actors authorized to receive secrets once reveal
//! conditions hold. Registration and KYC approval happen out of band; this
//! registry is the authorization gate the secret manager consults.

use crate::clock::now_ms;
use crate::error::{OrchestratorError, OrchestratorResult};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolver {
    pub address: String,
    pub is_kyc_approved: bool,
    pub registered_at: u64,
}

pub struct ResolverRegistry {
    resolvers: DashMap<String, Resolver>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self {
            resolvers: DashMap::new(),
        }
    }

    pub fn register(&self, address: &str, is_kyc_approved: bool) {
        self.resolvers.insert(
            address.to_string(),
            Resolver {
                address: address.to_string(),
                is_kyc_approved,
                registered_at: now_ms(),
            },
        );
    }

    pub fn set_kyc_approved(&self, address: &str, approved: bool) -> OrchestratorResult<()> {
        let mut resolver =
            self.resolvers
                .get_mut(address)
                .ok_or_else(|| OrchestratorError::ResolverNotAuthorized {
                    resolver: address.to_string(),
                })?;
        resolver.is_kyc_approved = approved;
        Ok(())
    }

    pub fn is_authorized(&self, address: &str) -> bool {
        self.resolvers
            .get(address)
            .map(|r| r.is_kyc_approved)
            .unwrap_or(false)
    }

    /// All registered, KYC-approved resolver addresses
    pub fn authorized_resolvers(&self) -> Vec<String> {
        self.resolvers
            .iter()
            .filter(|r| r.is_kyc_approved)
            .map(|r| r.address.clone())
            .collect()
    }

    /// Resolve a reveal request's `"<address>:<signature>"` credential to an
    /// authorized resolver address.
    ///
    /// TODO: replace the structural split with signature recovery against the
    /// resolver's registered public key; callers only see the address.
    pub fn resolve_credential(&self, credential: &str) -> OrchestratorResult<String> {
        let address = credential
            .split(':')
            .next()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| OrchestratorError::ResolverNotAuthorized {
                resolver: credential.to_string(),
            })?;

        if !self.is_authorized(address) {
            return Err(OrchestratorError::ResolverNotAuthorized {
                resolver: address.to_string(),
            });
        }

        Ok(address.to_string())
    }
}

impl Default for ResolverRegistry {
    fn default() -> Self {
        Self::new()
    }
}
