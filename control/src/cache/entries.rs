//! Cache entry types

use serde_json::Value;

use super::object_cache::CacheEntry;
use crate::graph::nodes::ServiceMetadata;
use crate::keys::ObjKey;
use crate::remote::{parse_ref, ObjType};

/// Ordered collection without duplicates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildKeys<T> {
    items: Vec<T>,
}

impl<T> Default for ChildKeys<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T: PartialEq + Clone> ChildKeys<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append unless present; returns whether it was added
    pub fn insert(&mut self, item: T) -> bool {
        if self.items.contains(&item) {
            return false;
        }
        self.items.push(item);
        true
    }

    pub fn remove(&mut self, item: &T) -> bool {
        match self.items.iter().position(|i| i == item) {
            Some(idx) => {
                self.items.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, item: &T) -> bool {
        self.items.contains(item)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn retain<F: FnMut(&T) -> bool>(&mut self, f: F) {
        self.items.retain(f);
    }
}

impl<T: PartialEq + Clone> FromIterator<T> for ChildKeys<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut keys = ChildKeys::new();
        for item in iter {
            keys.insert(item);
        }
        keys
    }
}

/// Last applied state of a pool, pool group, data script, certificate, VIP
/// or VRF
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildCacheEntry {
    pub name: String,
    pub tenant: String,
    pub uuid: String,
    /// `None` when the remote object carries no usable checksum; forces an
    /// update on next reconcile
    pub checksum: Option<u32>,
}

impl CacheEntry for ChildCacheEntry {
    fn uuid(&self) -> Option<&str> {
        Some(&self.uuid)
    }
}

/// Last applied state of one virtual service and the children it owns.
///
/// `uuid` is `None` while the VS itself does not exist remotely but children
/// created for it do (first create interrupted, or VS deleted before its
/// children); such an entry is dropped once it owns nothing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VsCacheEntry {
    pub name: String,
    pub tenant: String,
    pub uuid: Option<String>,
    pub checksum: Option<u32>,
    /// Address assigned to the VIP
    pub vip: Option<String>,
    pub pools: ChildKeys<ObjKey>,
    pub pool_groups: ChildKeys<ObjKey>,
    pub datascripts: ChildKeys<ObjKey>,
    pub certs: ChildKeys<ObjKey>,
    pub vips: ChildKeys<ObjKey>,
    /// uuids of SNI children
    pub sni_children: ChildKeys<String>,
    pub parent_vs: Option<ObjKey>,
    pub service_metadata: ServiceMetadata,
}

impl CacheEntry for VsCacheEntry {
    fn uuid(&self) -> Option<&str> {
        self.uuid.as_deref()
    }
}

impl VsCacheEntry {
    pub fn new(key: &ObjKey) -> Self {
        Self {
            name: key.name.clone(),
            tenant: key.namespace.clone(),
            ..Default::default()
        }
    }

    pub fn key(&self) -> ObjKey {
        ObjKey::new(self.tenant.clone(), self.name.clone())
    }

    pub fn children(&self, obj_type: ObjType) -> Option<&ChildKeys<ObjKey>> {
        match obj_type {
            ObjType::Pool => Some(&self.pools),
            ObjType::PoolGroup => Some(&self.pool_groups),
            ObjType::DataScript => Some(&self.datascripts),
            ObjType::SslCert => Some(&self.certs),
            ObjType::Vip => Some(&self.vips),
            ObjType::VirtualService | ObjType::Vrf => None,
        }
    }

    pub fn children_mut(&mut self, obj_type: ObjType) -> Option<&mut ChildKeys<ObjKey>> {
        match obj_type {
            ObjType::Pool => Some(&mut self.pools),
            ObjType::PoolGroup => Some(&mut self.pool_groups),
            ObjType::DataScript => Some(&mut self.datascripts),
            ObjType::SslCert => Some(&mut self.certs),
            ObjType::Vip => Some(&mut self.vips),
            ObjType::VirtualService | ObjType::Vrf => None,
        }
    }

    /// Owns no remote object at all
    pub fn is_hollow(&self) -> bool {
        self.uuid.is_none()
            && self.pools.is_empty()
            && self.pool_groups.is_empty()
            && self.datascripts.is_empty()
            && self.certs.is_empty()
            && self.vips.is_empty()
            && self.sni_children.is_empty()
    }
}

// =============================================================================
// Response parsing
// =============================================================================

/// `name`, `uuid` and checksum of a remote object.
///
/// `None` when name or uuid is missing; the caller skips that item. A missing
/// or unparsable checksum is kept as `None`.
pub fn parse_identity(obj: &Value) -> Option<(String, String, Option<u32>)> {
    let name = obj.get("name").and_then(Value::as_str)?.to_string();
    let uuid = obj.get("uuid").and_then(Value::as_str)?.to_string();
    let checksum = obj
        .get("cloud_config_cksum")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<u32>().ok());
    Some((name, uuid, checksum))
}

/// Tenant name out of `tenant_ref`, falling back to `default`
pub fn parse_tenant(obj: &Value, default: &str) -> String {
    obj.get("tenant_ref")
        .and_then(Value::as_str)
        .and_then(parse_ref)
        .and_then(|r| r.name)
        .unwrap_or_else(|| default.to_string())
}

/// First VIP address of a VS or VIP object
pub fn parse_vip_address(obj: &Value) -> Option<String> {
    obj.pointer("/vip/0/ip_address/addr")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// `service_metadata` is stored remotely as a JSON string
pub fn parse_service_metadata(obj: &Value) -> ServiceMetadata {
    obj.get("service_metadata")
        .and_then(Value::as_str)
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default()
}

/// Every `(type, uuid)` a VS object references directly
pub fn vs_child_refs(obj: &Value) -> Vec<(ObjType, String)> {
    let mut refs = Vec::new();
    let mut push = |value: Option<&Value>, expected: ObjType| {
        if let Some(parsed) = value.and_then(Value::as_str).and_then(parse_ref) {
            if let (Some(t), Some(uuid)) = (parsed.obj_type, parsed.uuid) {
                if t == expected {
                    refs.push((t, uuid));
                }
            }
        }
    };

    push(obj.get("vsvip_ref"), ObjType::Vip);
    push(obj.get("pool_group_ref"), ObjType::PoolGroup);
    for sel in obj.get("service_pool_select").and_then(Value::as_array).into_iter().flatten() {
        push(sel.get("service_pool_group_ref"), ObjType::PoolGroup);
    }
    for ds in obj.get("vs_datascripts").and_then(Value::as_array).into_iter().flatten() {
        push(ds.get("vs_datascript_set_ref"), ObjType::DataScript);
    }
    for cert in obj
        .get("ssl_key_and_certificate_refs")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        push(Some(cert), ObjType::SslCert);
    }
    refs
}

/// `(type, uuid)` references carried by a child object: pool group members
/// and data script pool groups
pub fn nested_child_refs(obj: &Value) -> Vec<(ObjType, String)> {
    let mut refs = Vec::new();
    let members = obj.get("members").and_then(Value::as_array).into_iter().flatten();
    for member in members {
        if let Some(r) = member.get("pool_ref").and_then(Value::as_str).and_then(parse_ref) {
            if let (Some(ObjType::Pool), Some(uuid)) = (r.obj_type, r.uuid) {
                refs.push((ObjType::Pool, uuid));
            }
        }
    }
    let pgs = obj.get("pool_group_refs").and_then(Value::as_array).into_iter().flatten();
    for pg in pgs {
        if let Some(r) = pg.as_str().and_then(parse_ref) {
            if let (Some(ObjType::PoolGroup), Some(uuid)) = (r.obj_type, r.uuid) {
                refs.push((ObjType::PoolGroup, uuid));
            }
        }
    }
    refs
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_child_keys_reject_duplicates() {
        let mut keys = ChildKeys::new();
        assert!(keys.insert(ObjKey::new("admin", "a")));
        assert!(!keys.insert(ObjKey::new("admin", "a")));
        assert!(keys.insert(ObjKey::new("admin", "b")));
        assert_eq!(keys.len(), 2);

        let collected: ChildKeys<&str> = ["x", "y", "x"].into_iter().collect();
        assert_eq!(collected.iter().copied().collect::<Vec<_>>(), vec!["x", "y"]);
    }

    #[test]
    fn test_parse_identity_requires_name_and_uuid() {
        let full = json!({"name": "p", "uuid": "pool-1", "cloud_config_cksum": "42"});
        assert_eq!(
            parse_identity(&full),
            Some(("p".to_string(), "pool-1".to_string(), Some(42)))
        );

        let no_cksum = json!({"name": "p", "uuid": "pool-1"});
        assert_eq!(parse_identity(&no_cksum).unwrap().2, None);

        assert!(parse_identity(&json!({"name": "p"})).is_none());
        assert!(parse_identity(&json!({"uuid": "pool-1"})).is_none());
    }

    #[test]
    fn test_vs_child_refs() {
        let vs = json!({
            "vsvip_ref": "/api/vsvip/vsvip-1#vip",
            "pool_group_ref": "/api/poolgroup/poolgroup-1#pg",
            "vs_datascripts": [{"index": 1, "vs_datascript_set_ref": "/api/vsdatascriptset/ds-1#ds"}],
            "ssl_key_and_certificate_refs": ["/api/sslkeyandcertificate/cert-1#cert"],
            "tenant_ref": "/api/tenant/?name=admin",
        });
        let refs = vs_child_refs(&vs);
        assert_eq!(
            refs,
            vec![
                (ObjType::Vip, "vsvip-1".to_string()),
                (ObjType::PoolGroup, "poolgroup-1".to_string()),
                (ObjType::DataScript, "ds-1".to_string()),
                (ObjType::SslCert, "cert-1".to_string()),
            ]
        );
    }

    #[test]
    fn test_hollow_entry() {
        let mut entry = VsCacheEntry::new(&ObjKey::new("admin", "vs"));
        assert!(entry.is_hollow());
        entry.pools.insert(ObjKey::new("admin", "p"));
        assert!(!entry.is_hollow());
    }
}
