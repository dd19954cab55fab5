//! Write successful responses back into the cache
//!
//! Only ops that succeeded are folded; an aborted or failed op leaves the
//! cache exactly as it was for that object.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use super::plan::VsBatch;
use super::status::{StatusEvent, StatusSender};
use crate::cache::entries::{parse_identity, parse_service_metadata, parse_vip_address};
use crate::cache::{ChildCacheEntry, ControllerCache, VsCacheEntry};
use crate::keys::ObjKey;
use crate::remote::{ObjType, RestMethod, RestOp};

/// Drop entries that no longer own anything
fn prune(entry: VsCacheEntry) -> Option<VsCacheEntry> {
    if entry.is_hollow() {
        None
    } else {
        Some(entry)
    }
}

/// Fold every successful op of `batch`.
///
/// `top_vs` is the model's top-level VS; only its create, update or delete
/// produce a status event. When the whole batch succeeded the owner's child
/// collections are set to exactly the children the graph asked for.
pub fn fold_batch(
    cache: &ControllerCache,
    batch: &VsBatch,
    model: &str,
    top_vs: &ObjKey,
    status: Option<&StatusSender>,
    all_succeeded: bool,
) {
    for op in batch.ops.iter().filter(|op| op.is_success()) {
        match op.obj_type {
            ObjType::VirtualService => fold_vs(cache, op, model, top_vs, status),
            ObjType::Vrf => fold_vrf(cache, op),
            _ => fold_child(cache, &batch.owner, op),
        }
    }
    if all_succeeded {
        if let Some(desired) = &batch.desired {
            adopt_children(cache, &batch.owner, desired);
        }
    }
}

fn fold_child(cache: &ControllerCache, owner: &ObjKey, op: &RestOp) {
    let Some(child_cache) = cache.children(op.obj_type) else {
        return;
    };
    let key = ObjKey::new(op.tenant.clone(), op.obj_name.clone());

    match op.method {
        RestMethod::Delete => {
            let same_object = child_cache
                .get(&key)
                .map(|c| Some(c.uuid.as_str()) == op.uuid.as_deref())
                .unwrap_or(false);
            if same_object {
                child_cache.remove(&key);
            }
            cache.virtual_services.update(owner, |current| {
                current.and_then(|mut entry| {
                    if let Some(keys) = entry.children_mut(op.obj_type) {
                        keys.remove(&key);
                    }
                    prune(entry)
                })
            });
        }
        RestMethod::Post | RestMethod::Put => {
            let Some((name, uuid, checksum)) = op.response.as_ref().and_then(parse_identity) else {
                warn!("{} returned no name or uuid, not cached", op);
                return;
            };
            child_cache.upsert(
                key.clone(),
                ChildCacheEntry {
                    name,
                    tenant: op.tenant.clone(),
                    uuid,
                    checksum,
                },
            );
            // the owner may not exist remotely yet; a hollow entry tracks the
            // child until it does
            cache.virtual_services.update(owner, |current| {
                let mut entry = current.unwrap_or_else(|| VsCacheEntry::new(owner));
                if let Some(keys) = entry.children_mut(op.obj_type) {
                    keys.insert(key);
                }
                Some(entry)
            });
        }
    }
}

fn fold_vs(
    cache: &ControllerCache,
    op: &RestOp,
    model: &str,
    top_vs: &ObjKey,
    status: Option<&StatusSender>,
) {
    let key = ObjKey::new(op.tenant.clone(), op.obj_name.clone());

    match op.method {
        RestMethod::Post | RestMethod::Put => {
            let Some(response) = op.response.as_ref() else {
                return;
            };
            let Some((_, uuid, checksum)) = parse_identity(response) else {
                warn!("{} returned no name or uuid, not cached", op);
                return;
            };
            let vip = parse_vip_address(response);
            let metadata = parse_service_metadata(response);
            cache.virtual_services.update(&key, |current| {
                let mut entry = current.unwrap_or_else(|| VsCacheEntry::new(&key));
                entry.uuid = Some(uuid);
                entry.checksum = checksum;
                entry.vip = vip.clone();
                entry.service_metadata = metadata.clone();
                Some(entry)
            });
            if let Some(parent_ref) = response.get("vh_parent_vs_ref") {
                cache.link_sni_child(&key, parent_ref);
            }
            if key == *top_vs {
                emit(
                    status,
                    StatusEvent::Applied {
                        model: model.to_string(),
                        vip,
                        metadata,
                    },
                );
            }
        }
        RestMethod::Delete => {
            let mut metadata = None;
            let mut parent = None;
            cache.virtual_services.update(&key, |current| {
                current.and_then(|mut entry| {
                    metadata = Some(entry.service_metadata.clone());
                    parent = entry.parent_vs.take();
                    entry.uuid = None;
                    entry.checksum = None;
                    entry.vip = None;
                    prune(entry)
                })
            });
            if let (Some(parent), Some(uuid)) = (parent, op.uuid.as_deref()) {
                cache.unlink_sni_child(&parent, uuid);
            }
            if key == *top_vs {
                emit(
                    status,
                    StatusEvent::Removed {
                        model: model.to_string(),
                        metadata: metadata.unwrap_or_default(),
                    },
                );
            }
        }
    }
}

fn fold_vrf(cache: &ControllerCache, op: &RestOp) {
    let Some((name, uuid, checksum)) = op.response.as_ref().and_then(parse_identity) else {
        warn!("{} returned no name or uuid, not cached", op);
        return;
    };
    cache.vrfs.upsert(
        ObjKey::new(op.tenant.clone(), name.clone()),
        ChildCacheEntry {
            name,
            tenant: op.tenant.clone(),
            uuid,
            checksum,
        },
    );
}

/// Make the owner's collections exactly the desired children that exist
fn adopt_children(cache: &ControllerCache, owner: &ObjKey, desired: &BTreeMap<ObjType, Vec<ObjKey>>) {
    cache.virtual_services.update(owner, |current| {
        let mut entry = current?;
        for (obj_type, keys) in desired {
            let Some(child_cache) = cache.children(*obj_type) else {
                continue;
            };
            let existing: Vec<ObjKey> = keys.iter().filter(|k| child_cache.contains(k)).cloned().collect();
            if let Some(collection) = entry.children_mut(*obj_type) {
                *collection = existing.into_iter().collect();
            }
        }
        prune(entry)
    });
}

fn emit(status: Option<&StatusSender>, event: StatusEvent) {
    let Some(tx) = status else {
        return;
    };
    debug!("Status event for {}", event.model());
    if tx.send(event).is_err() {
        debug!("Status receiver is gone, event dropped");
    }
}
