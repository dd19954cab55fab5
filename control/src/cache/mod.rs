//! Local mirror of the remote controller
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                        ControllerCache                             │
//! ├───────────────────────────────────────────────────────────────────┤
//! │  virtual services   ObjectCache<VsCacheEntry>   + child keys       │
//! │  pools, pool groups, data scripts, certs, VIPs, VRFs               │
//! │                     ObjectCache<ChildCacheEntry>                   │
//! │  every map: (tenant, name) → entry, uuid → (tenant, name)          │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Written only by `bulk_populate`, `refresh_subtree` and the reconciler's
//! response folding. No lock is ever held across a remote call: refreshes
//! fetch first, then swap the result in.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

pub mod entries;
pub mod object_cache;

pub use entries::{ChildCacheEntry, ChildKeys, VsCacheEntry};
pub use object_cache::{CacheEntry, ObjectCache};

use entries::{
    nested_child_refs, parse_identity, parse_service_metadata, parse_tenant, parse_vip_address,
    vs_child_refs,
};
use crate::keys::ObjKey;
use crate::remote::{fetch_collection, parse_ref, ObjType, RemoteClient, RemoteError};

/// Child types owned by a virtual service, in create order
pub const CHILD_TYPES: [ObjType; 5] = [
    ObjType::Vip,
    ObjType::Pool,
    ObjType::PoolGroup,
    ObjType::DataScript,
    ObjType::SslCert,
];

#[derive(Debug, Default)]
pub struct ControllerCache {
    pub virtual_services: ObjectCache<VsCacheEntry>,
    pub pools: ObjectCache<ChildCacheEntry>,
    pub pool_groups: ObjectCache<ChildCacheEntry>,
    pub datascripts: ObjectCache<ChildCacheEntry>,
    pub certs: ObjectCache<ChildCacheEntry>,
    pub vips: ObjectCache<ChildCacheEntry>,
    pub vrfs: ObjectCache<ChildCacheEntry>,
    default_tenant: String,
    created_by: String,
    page_size: u32,
}

impl ControllerCache {
    /// `created_by` selects which remote objects are mirrored on bulk
    /// refresh; VRFs are mirrored regardless
    pub fn new(default_tenant: impl Into<String>, created_by: impl Into<String>, page_size: u32) -> Self {
        Self {
            default_tenant: default_tenant.into(),
            created_by: created_by.into(),
            page_size,
            ..Default::default()
        }
    }

    /// Map of a child type; `None` for virtual services
    pub fn children(&self, obj_type: ObjType) -> Option<&ObjectCache<ChildCacheEntry>> {
        match obj_type {
            ObjType::Pool => Some(&self.pools),
            ObjType::PoolGroup => Some(&self.pool_groups),
            ObjType::DataScript => Some(&self.datascripts),
            ObjType::SslCert => Some(&self.certs),
            ObjType::Vip => Some(&self.vips),
            ObjType::Vrf => Some(&self.vrfs),
            ObjType::VirtualService => None,
        }
    }

    /// Remote objects carrying our marker (or any VRF)
    fn is_ours(&self, obj_type: ObjType, obj: &Value) -> bool {
        obj_type == ObjType::Vrf
            || obj.get("created_by").and_then(Value::as_str) == Some(self.created_by.as_str())
    }

    fn child_entry(&self, obj: &Value) -> Option<(ObjKey, ChildCacheEntry)> {
        let Some((name, uuid, checksum)) = parse_identity(obj) else {
            warn!("Skipping remote object without name or uuid: {}", obj);
            return None;
        };
        let tenant = parse_tenant(obj, &self.default_tenant);
        Some((
            ObjKey::new(tenant.clone(), name.clone()),
            ChildCacheEntry {
                name,
                tenant,
                uuid,
                checksum,
            },
        ))
    }

    fn vs_entry(&self, obj: &Value) -> Option<(ObjKey, VsCacheEntry)> {
        let Some((name, uuid, checksum)) = parse_identity(obj) else {
            warn!("Skipping virtual service without name or uuid: {}", obj);
            return None;
        };
        let key = ObjKey::new(parse_tenant(obj, &self.default_tenant), name);
        let mut entry = VsCacheEntry::new(&key);
        entry.uuid = Some(uuid);
        entry.checksum = checksum;
        entry.vip = parse_vip_address(obj);
        entry.service_metadata = parse_service_metadata(obj);
        Some((key, entry))
    }

    // =========================================================================
    // Bulk refresh
    // =========================================================================

    /// Replace the whole mirror with the controller's current objects.
    ///
    /// Returns the keys of virtual services that were mirrored before and no
    /// longer exist remotely. Entries whose VS was never created keep the
    /// children that still exist, so those can still be cleaned up. Entries
    /// written by a reconcile while the listing was in flight are kept as
    /// they are.
    pub async fn bulk_populate(&self, client: &dyn RemoteClient) -> Result<BTreeSet<ObjKey>, RemoteError> {
        let vs_since = self.virtual_services.generation();
        let child_since: BTreeMap<ObjType, u64> = CHILD_TYPES
            .into_iter()
            .chain([ObjType::Vrf])
            .filter_map(|t| self.children(t).map(|cache| (t, cache.generation())))
            .collect();

        let mut fetched: BTreeMap<ObjType, Vec<Value>> = BTreeMap::new();
        for obj_type in ObjType::ALL {
            let objects = fetch_collection(client, obj_type, self.page_size).await?;
            let ours: Vec<Value> = objects
                .into_iter()
                .filter(|o| self.is_ours(obj_type, o))
                .collect();
            fetched.insert(obj_type, ours);
        }

        // children first, so virtual services can be linked by uuid
        let mut child_maps: BTreeMap<ObjType, BTreeMap<ObjKey, ChildCacheEntry>> = BTreeMap::new();
        let mut uuid_index: BTreeMap<String, (ObjType, ObjKey)> = BTreeMap::new();
        let mut nested: BTreeMap<String, Vec<(ObjType, String)>> = BTreeMap::new();
        for obj_type in CHILD_TYPES.into_iter().chain([ObjType::Vrf]) {
            let map = child_maps.entry(obj_type).or_default();
            for obj in fetched.get(&obj_type).into_iter().flatten() {
                if let Some((key, entry)) = self.child_entry(obj) {
                    uuid_index.insert(entry.uuid.clone(), (obj_type, key.clone()));
                    nested.insert(entry.uuid.clone(), nested_child_refs(obj));
                    map.insert(key, entry);
                }
            }
        }

        let mut vs_map: BTreeMap<ObjKey, VsCacheEntry> = BTreeMap::new();
        let mut parents: Vec<(ObjKey, Value)> = Vec::new();
        for obj in fetched.get(&ObjType::VirtualService).into_iter().flatten() {
            let Some((key, mut entry)) = self.vs_entry(obj) else {
                continue;
            };
            link_children(&mut entry, vs_child_refs(obj), &uuid_index, &nested);
            if let Some(parent_ref) = obj.get("vh_parent_vs_ref") {
                parents.push((key.clone(), parent_ref.clone()));
            }
            vs_map.insert(key, entry);
        }
        for (child_key, parent_ref) in parents {
            link_sni_child(&mut vs_map, &child_key, &parent_ref);
        }

        // keep interrupted creates that still own existing children
        for (key, old) in self.virtual_services.entries() {
            if old.uuid.is_some() || vs_map.contains_key(&key) {
                continue;
            }
            let mut kept = old;
            for obj_type in CHILD_TYPES {
                let existing = child_maps.get(&obj_type);
                if let Some(keys) = kept.children_mut(obj_type) {
                    keys.retain(|k| existing.map(|m| m.contains_key(k)).unwrap_or(false));
                }
            }
            kept.sni_children = ChildKeys::new();
            if !kept.is_hollow() {
                vs_map.insert(key, kept);
            }
        }

        let counts: Vec<String> = child_maps
            .iter()
            .map(|(t, m)| format!("{}={}", t, m.len()))
            .collect();
        for (obj_type, map) in child_maps {
            if let (Some(cache), Some(since)) = (self.children(obj_type), child_since.get(&obj_type)) {
                cache.replace_since(map, *since);
            }
        }
        let vs_count = vs_map.len();
        let previous = self.virtual_services.replace_since(vs_map, vs_since);
        let removed: BTreeSet<ObjKey> = previous
            .into_iter()
            .filter(|(key, entry)| entry.uuid.is_some() && !self.virtual_services.get(key).map(|e| e.uuid.is_some()).unwrap_or(false))
            .map(|(key, _)| key)
            .collect();

        info!(
            "Mirrored {} virtual service(s) and {}; {} virtual service(s) gone",
            vs_count,
            counts.join(" "),
            removed.len()
        );
        Ok(removed)
    }

    // =========================================================================
    // Targeted refresh
    // =========================================================================

    /// Re-read one virtual service and its children.
    ///
    /// A child is kept when the controller still has it, whether it was found
    /// through the VS's references or through the cached collections.
    /// Returns a 404 error when the VS itself is gone.
    pub async fn refresh_subtree(&self, client: &dyn RemoteClient, vs_uuid: &str) -> Result<(), RemoteError> {
        let vs_obj = client.get(&ObjType::VirtualService.object_path(vs_uuid)).await?;
        let Some((key, mut entry)) = self.vs_entry(&vs_obj) else {
            return Err(RemoteError::Malformed(format!("virtual service {} has no name", vs_uuid)));
        };

        let cached = self.virtual_services.get(&key);
        let mut candidates: Vec<(ObjType, String)> = vs_child_refs(&vs_obj);
        if let Some(cached) = &cached {
            for obj_type in CHILD_TYPES {
                let (Some(keys), Some(cache)) = (cached.children(obj_type), self.children(obj_type)) else {
                    continue;
                };
                for child in keys.iter() {
                    if let Some(c) = cache.get(child) {
                        candidates.push((obj_type, c.uuid));
                    }
                }
            }
        }

        let mut seen: BTreeSet<(ObjType, String)> = BTreeSet::new();
        while let Some((obj_type, uuid)) = candidates.pop() {
            if !seen.insert((obj_type, uuid.clone())) {
                continue;
            }
            let Some(cache) = self.children(obj_type) else {
                continue;
            };
            match client.get(&obj_type.object_path(&uuid)).await {
                Ok(obj) => {
                    let Some((child_key, child)) = self.child_entry(&obj) else {
                        continue;
                    };
                    candidates.extend(nested_child_refs(&obj));
                    cache.upsert(child_key.clone(), child);
                    if let Some(keys) = entry.children_mut(obj_type) {
                        keys.insert(child_key);
                    }
                }
                Err(e) if e.is_not_found() => {
                    // only forget the entry if it still describes that object
                    if let Some(child_key) = cache.get_key_by_uuid(&uuid) {
                        debug!("{} {} is gone remotely", obj_type, child_key);
                        cache.remove(&child_key);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(cached) = cached {
            entry.sni_children = cached.sni_children;
            entry.parent_vs = cached.parent_vs;
        }
        debug!(
            "Refreshed {}: {} pool(s), {} pool group(s)",
            key,
            entry.pools.len(),
            entry.pool_groups.len()
        );
        self.virtual_services.upsert(key, entry);
        Ok(())
    }

    /// Record `child_key` as an SNI child of the VS its response names as
    /// parent
    pub fn link_sni_child(&self, child_key: &ObjKey, parent_ref: &Value) {
        let mut vs_map: BTreeMap<ObjKey, VsCacheEntry> = BTreeMap::new();
        let Some(child) = self.virtual_services.get(child_key) else {
            return;
        };
        let Some(parent) = parent_ref.as_str().and_then(parse_ref) else {
            warn!("Unusable parent reference on {}: {}", child_key, parent_ref);
            return;
        };
        let parent_key = parent
            .uuid
            .as_deref()
            .and_then(|u| self.virtual_services.get_key_by_uuid(u));
        if let Some(parent_key) = &parent_key {
            if let Some(entry) = self.virtual_services.get(parent_key) {
                vs_map.insert(parent_key.clone(), entry);
            }
        }
        vs_map.insert(child_key.clone(), child);
        link_sni_child(&mut vs_map, child_key, parent_ref);
        for (key, entry) in vs_map {
            self.virtual_services.upsert(key, entry);
        }
    }

    /// Forget one SNI child uuid on its parent
    pub fn unlink_sni_child(&self, parent: &ObjKey, child_uuid: &str) {
        self.virtual_services.update(parent, |current| {
            current.and_then(|mut entry| {
                entry.sni_children.remove(&child_uuid.to_string());
                if entry.is_hollow() {
                    None
                } else {
                    Some(entry)
                }
            })
        });
    }

    /// Drop everything (tests and shutdown)
    pub fn clear(&self) {
        self.virtual_services.replace_all(BTreeMap::new());
        for obj_type in CHILD_TYPES.into_iter().chain([ObjType::Vrf]) {
            if let Some(cache) = self.children(obj_type) {
                cache.replace_all(BTreeMap::new());
            }
        }
    }
}

/// Fill an entry's child collections from the uuids it references, pulling
/// in pools through pool groups and pool groups through data scripts
fn link_children(
    entry: &mut VsCacheEntry,
    refs: Vec<(ObjType, String)>,
    uuid_index: &BTreeMap<String, (ObjType, ObjKey)>,
    nested: &BTreeMap<String, Vec<(ObjType, String)>>,
) {
    let mut pending = refs;
    let mut seen = BTreeSet::new();
    while let Some((obj_type, uuid)) = pending.pop() {
        if !seen.insert(uuid.clone()) {
            continue;
        }
        let Some((found_type, key)) = uuid_index.get(&uuid) else {
            debug!("{} references unknown {} {}", entry.name, obj_type, uuid);
            continue;
        };
        if let Some(keys) = entry.children_mut(*found_type) {
            keys.insert(key.clone());
        }
        if let Some(more) = nested.get(&uuid) {
            pending.extend(more.iter().cloned());
        }
    }
}

/// Attach `child_key` to the parent its `vh_parent_vs_ref` resolves to.
///
/// An unresolvable parent gets a stand-in entry carrying only its uuid, so
/// the relationship survives until the parent itself is mirrored.
fn link_sni_child(
    vs_map: &mut BTreeMap<ObjKey, VsCacheEntry>,
    child_key: &ObjKey,
    parent_ref: &Value,
) {
    let Some(parent) = parent_ref.as_str().and_then(parse_ref) else {
        warn!("Unusable parent reference on {}: {}", child_key, parent_ref);
        return;
    };
    let Some(child_uuid) = vs_map.get(child_key).and_then(|c| c.uuid.clone()) else {
        return;
    };

    let resolved = parent.uuid.as_ref().and_then(|uuid| {
        vs_map
            .iter()
            .find(|(_, e)| e.uuid.as_deref() == Some(uuid.as_str()))
            .map(|(k, _)| k.clone())
    });
    let parent_key = match resolved {
        Some(key) => key,
        None => {
            let name = parent
                .name
                .clone()
                .or_else(|| parent.uuid.clone())
                .unwrap_or_default();
            let key = ObjKey::new(child_key.namespace.clone(), name);
            let stand_in = vs_map.entry(key.clone()).or_insert_with(|| VsCacheEntry::new(&key));
            if stand_in.uuid.is_none() {
                stand_in.uuid = parent.uuid.clone();
            }
            debug!("Parent of {} not mirrored yet, stand-in {} created", child_key, key);
            key
        }
    };

    if let Some(parent_entry) = vs_map.get_mut(&parent_key) {
        parent_entry.sni_children.insert(child_uuid);
    }
    if let Some(child_entry) = vs_map.get_mut(child_key) {
        child_entry.parent_vs = Some(parent_key);
    }
}
