use crate::types::TenantId;

/// Length of the key prefix that scopes a tenant's keyspace.
pub const TENANT_PREFIX_LEN: usize = 8;

/// The key prefix for a tenant: its id as an 8-byte big-endian integer.
pub fn tenant_prefix(id: TenantId) -> [u8; TENANT_PREFIX_LEN] {
    id.to_be_bytes()
}

/// Recover the tenant id from a tenant-scoped key, if it is long enough.
pub fn tenant_id_from_key(key: &[u8]) -> Option<TenantId> {
    let prefix: [u8; TENANT_PREFIX_LEN] = key.get(..TENANT_PREFIX_LEN)?.try_into().ok()?;
    Some(TenantId::from_be_bytes(prefix))
}

/// Prepend the tenant prefix to a user key.
pub fn tenant_key(id: TenantId, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(TENANT_PREFIX_LEN + key.len());
    out.extend_from_slice(&tenant_prefix(id));
    out.extend_from_slice(key);
    out
}

/// The full keyspace owned by a tenant: `[prefix, prefix + 1)`.
pub fn tenant_range(id: TenantId) -> KeyRange {
    let begin = tenant_prefix(id).to_vec();
    let end = match id.checked_add(1) {
        Some(next) => tenant_prefix(next).to_vec(),
        None => vec![0xFF; TENANT_PREFIX_LEN + 1],
    };
    KeyRange { begin, end }
}

/// Half-open byte-string key range.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyRange {
    pub begin: Vec<u8>,
    pub end: Vec<u8>,
}

impl KeyRange {
    pub fn new(begin: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            begin: begin.into(),
            end: end.into(),
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.begin.as_slice() && key < self.end.as_slice()
    }
}

/// Start of the system keyspace, where tenant metadata and the metacluster
/// registration live.
pub const SYSTEM_KEYS_BEGIN: &[u8] = b"\xff";

/// Key of the metacluster registration record.
pub const METACLUSTER_REGISTRATION_KEY: &[u8] = b"\xff/metacluster/clusterRegistration";

/// Prefix of the data cluster tenant map.
pub const TENANT_MAP_PREFIX: &[u8] = b"\xff/tenant/map/";

/// Ranges a data cluster backup captures: the user keyspace plus the tenant
/// metadata and registration system keys.
pub fn default_backup_ranges() -> Vec<KeyRange> {
    vec![
        KeyRange::new(b"".to_vec(), SYSTEM_KEYS_BEGIN.to_vec()),
        KeyRange::new(b"\xff/metacluster/".to_vec(), b"\xff/metacluster0".to_vec()),
        KeyRange::new(b"\xff/tenant/".to_vec(), b"\xff/tenant0".to_vec()),
    ]
}

/// Whether the given ranges cover tenant metadata (and therefore a clear or
/// restore over them replaces the tenant directory).
pub fn covers_tenant_metadata(ranges: &[KeyRange]) -> bool {
    ranges.iter().any(|r| r.contains(TENANT_MAP_PREFIX))
}

/// Whether the given ranges cover the metacluster registration record.
pub fn covers_registration(ranges: &[KeyRange]) -> bool {
    ranges.iter().any(|r| r.contains(METACLUSTER_REGISTRATION_KEY))
}
