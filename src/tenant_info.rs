//! Tenant authorization gate.
//!
//! Every request that reads or writes data carries a `TenantInfo`. The gate
//! reduces it to a single boolean: the caller may proceed iff it is a trusted
//! peer, or it presents a token that the token cache validates for the
//! claimed tenant. Token signing and verification live behind `TokenCache`.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::RwLock;
use zeroize::Zeroizing;

use crate::keys::{TENANT_PREFIX_LEN, tenant_prefix};
use crate::types::{INVALID_TENANT, TenantId};

/// Validates bearer tokens against tenant ids.
pub trait TokenCache: Send + Sync {
    fn validate(&self, tenant_id: TenantId, token: &str) -> bool;
}

/// Token material that is zeroed when dropped and never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct WipedString(Zeroizing<String>);

impl WipedString {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Zeroizing::new(s.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for WipedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WipedString(<redacted>)")
    }
}

/// Per-request tenant metadata as seen by a server after deserialization.
#[derive(Debug, Clone)]
pub struct TenantInfo {
    pub tenant_id: TenantId,
    pub prefix: Option<[u8; TENANT_PREFIX_LEN]>,
    pub token: Option<WipedString>,
    /// Set by the transport: whether the delivering peer is trusted.
    pub trusted: bool,
    /// Set during authorization: whether the token is valid for the tenant.
    pub tenant_authorized: bool,
}

impl Default for TenantInfo {
    fn default() -> Self {
        Self {
            tenant_id: INVALID_TENANT,
            prefix: None,
            token: None,
            trusted: false,
            tenant_authorized: false,
        }
    }
}

impl TenantInfo {
    /// Client-side construction, before the request crosses the wire.
    pub fn new(tenant_id: TenantId, token: Option<WipedString>) -> Self {
        let prefix = (tenant_id != INVALID_TENANT).then(|| tenant_prefix(tenant_id));
        Self {
            tenant_id,
            prefix,
            token,
            trusted: false,
            tenant_authorized: false,
        }
    }

    /// Server-side completion: record peer trust and validate the token.
    ///
    /// With `allow_tokenless_access` every request claiming a tenant is
    /// treated as authorized for it.
    pub fn authorize(
        mut self,
        peer_trusted: bool,
        allow_tokenless_access: bool,
        cache: &dyn TokenCache,
    ) -> Self {
        let mut authorized = allow_tokenless_access;
        if !authorized && self.has_tenant() {
            if let Some(token) = &self.token {
                authorized = cache.validate(self.tenant_id, token.expose());
            }
        }
        self.trusted = peer_trusted;
        self.tenant_authorized = authorized;
        if self.has_tenant() {
            self.prefix = Some(tenant_prefix(self.tenant_id));
        }
        self
    }

    /// True iff the caller is a trusted peer or holds a valid token for the
    /// tenant whose keyspace it is accessing. Without a tenant, only trusted
    /// peers pass.
    pub fn is_authorized(&self) -> bool {
        self.trusted || self.tenant_authorized
    }

    pub fn has_tenant(&self) -> bool {
        self.tenant_id != INVALID_TENANT
    }
}

/// In-process token cache keyed by tenant id.
#[derive(Default)]
pub struct StaticTokenCache {
    tokens: RwLock<HashMap<TenantId, HashSet<String>>>,
}

impl StaticTokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, tenant_id: TenantId, token: impl Into<String>) {
        let mut tokens = self.tokens.write().unwrap_or_else(|e| e.into_inner());
        tokens.entry(tenant_id).or_default().insert(token.into());
    }

    pub fn revoke_tenant(&self, tenant_id: TenantId) {
        let mut tokens = self.tokens.write().unwrap_or_else(|e| e.into_inner());
        tokens.remove(&tenant_id);
    }
}

impl TokenCache for StaticTokenCache {
    fn validate(&self, tenant_id: TenantId, token: &str) -> bool {
        let tokens = self.tokens.read().unwrap_or_else(|e| e.into_inner());
        tokens
            .get(&tenant_id)
            .is_some_and(|set| set.contains(token))
    }
}
