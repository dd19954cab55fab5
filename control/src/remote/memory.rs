//! In-process remote controller
//!
//! Implements the same protocol as the real controller closely enough to run
//! the whole pipeline without one: dry-run mode in the binary and every
//! end-to-end test.
//!
//! - uuids are allocated on create (`<type>-<uuid v4>`)
//! - `?name=` references are resolved on write and stored as
//!   `/api/<type>/<uuid>#<name>`; unresolvable references are rejected (400)
//! - VIP objects get an address from 10.10.0.0/16; virtual service responses
//!   embed the address of their VIP
//! - deleting an object something still references is refused (409)
//! - listings are paginated
//! - `fail_next` injects one failure for the next matching operation

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{parse_ref, ObjType, RemoteClient, RemoteError, RestMethod, RestOp};
use crate::locks::safe_lock;

const DEFAULT_PAGE_SIZE: usize = 25;

#[derive(Debug)]
struct Fault {
    method: RestMethod,
    obj_type: ObjType,
    status: u16,
}

#[derive(Debug, Default)]
struct ControllerState {
    /// type → uuid → stored object
    objects: BTreeMap<ObjType, BTreeMap<String, Value>>,
    next_vip: u32,
    faults: Vec<Fault>,
    calls: Vec<String>,
}

impl ControllerState {
    fn uuid_by_name(&self, obj_type: ObjType, name: &str) -> Option<String> {
        self.objects.get(&obj_type).and_then(|objs| {
            objs.iter()
                .find(|(_, obj)| obj.get("name").and_then(Value::as_str) == Some(name))
                .map(|(uuid, _)| uuid.clone())
        })
    }

    fn object(&self, obj_type: ObjType, uuid: &str) -> Option<&Value> {
        self.objects.get(&obj_type).and_then(|objs| objs.get(uuid))
    }

    fn take_fault(&mut self, method: RestMethod, obj_type: ObjType) -> Option<u16> {
        let idx = self
            .faults
            .iter()
            .position(|f| f.method == method && f.obj_type == obj_type)?;
        Some(self.faults.remove(idx).status)
    }

    fn resolve_ref(&self, reference: &str) -> Result<String, RemoteError> {
        let Some(parsed) = parse_ref(reference) else {
            return Ok(reference.to_string());
        };
        let (Some(obj_type), None, Some(name)) = (parsed.obj_type, parsed.uuid.as_ref(), parsed.name.as_ref()) else {
            return Ok(reference.to_string());
        };
        match self.uuid_by_name(obj_type, name) {
            Some(uuid) => Ok(format!("{}#{}", obj_type.object_path(&uuid), name)),
            None => Err(RemoteError::status(400, format!("cannot resolve reference {}", reference))),
        }
    }

    fn rewrite_refs(&self, value: &mut Value) -> Result<(), RemoteError> {
        match value {
            Value::Object(map) => {
                for (field, v) in map.iter_mut() {
                    if field.ends_with("_ref") {
                        if let Value::String(s) = v {
                            *s = self.resolve_ref(s)?;
                            continue;
                        }
                    }
                    if field.ends_with("_refs") {
                        if let Value::Array(items) = v {
                            for item in items.iter_mut() {
                                if let Value::String(s) = item {
                                    *s = self.resolve_ref(s)?;
                                }
                            }
                            continue;
                        }
                    }
                    self.rewrite_refs(v)?;
                }
            }
            Value::Array(items) => {
                for item in items.iter_mut() {
                    self.rewrite_refs(item)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn allocate_vip(&mut self) -> Value {
        self.next_vip += 1;
        let n = self.next_vip;
        json!([{
            "vip_id": "0",
            "ip_address": {"addr": format!("10.10.{}.{}", n / 254, n % 254 + 1), "type": "V4"},
        }])
    }

    /// Turn a request body into the stored object
    fn prepare(&mut self, obj_type: ObjType, mut data: Value, uuid: &str, existing: Option<&Value>) -> Result<Value, RemoteError> {
        let name = data
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RemoteError::status(400, "object has no name"))?
            .to_string();
        self.rewrite_refs(&mut data)?;

        let Some(map) = data.as_object_mut() else {
            return Err(RemoteError::status(400, "object body is not a map"));
        };
        map.insert("uuid".into(), Value::String(uuid.to_string()));
        map.insert("url".into(), Value::String(format!("{}#{}", obj_type.object_path(uuid), name)));

        if obj_type == ObjType::Vip {
            let allocated = existing
                .and_then(|e| e.get("vip"))
                .filter(|v| v.pointer("/0/ip_address/addr").is_some())
                .cloned();
            let vip = match allocated {
                Some(vip) => vip,
                None => self.allocate_vip(),
            };
            map.insert("vip".into(), vip);
        }
        Ok(data)
    }

    /// Stored object as returned to clients
    fn render(&self, obj_type: ObjType, obj: &Value) -> Value {
        let mut out = obj.clone();
        if obj_type != ObjType::VirtualService {
            return out;
        }
        let vip = obj
            .get("vsvip_ref")
            .and_then(Value::as_str)
            .and_then(parse_ref)
            .and_then(|r| r.uuid)
            .and_then(|uuid| self.object(ObjType::Vip, &uuid))
            .and_then(|v| v.get("vip"))
            .cloned();
        if let (Some(vip), Some(map)) = (vip, out.as_object_mut()) {
            map.insert("vip".into(), vip);
        }
        out
    }

    fn referenced_by(&self, uuid: &str) -> Option<String> {
        let needle = format!("/{}#", uuid);
        self.objects.values().flat_map(|objs| objs.values()).find_map(|obj| {
            if obj.get("uuid").and_then(Value::as_str) == Some(uuid) {
                return None;
            }
            if obj.to_string().contains(&needle) {
                obj.get("url").and_then(Value::as_str).map(str::to_string)
            } else {
                None
            }
        })
    }

    fn create(&mut self, op: &RestOp) -> Result<Value, RemoteError> {
        let body = op.body.as_ref().ok_or_else(|| RemoteError::status(400, "missing body"))?;
        let obj_type = body
            .get("model_name")
            .and_then(Value::as_str)
            .ok_or_else(|| RemoteError::status(400, "missing model_name"))?
            .parse::<ObjType>()
            .map_err(|e| RemoteError::status(400, e.to_string()))?;
        let data = body
            .get("data")
            .cloned()
            .ok_or_else(|| RemoteError::status(400, "missing data"))?;
        let name = data.get("name").and_then(Value::as_str).unwrap_or_default();
        if self.uuid_by_name(obj_type, name).is_some() {
            return Err(RemoteError::status(409, format!("{} {} already exists", obj_type, name)));
        }

        let uuid = format!("{}-{}", obj_type.api_name(), Uuid::new_v4());
        let stored = self.prepare(obj_type, data, &uuid, None)?;
        let rendered = self.render(obj_type, &stored);
        self.objects.entry(obj_type).or_default().insert(uuid, stored);
        Ok(rendered)
    }

    fn update(&mut self, op: &RestOp, uuid: &str) -> Result<Value, RemoteError> {
        let existing = self
            .object(op.obj_type, uuid)
            .cloned()
            .ok_or_else(|| RemoteError::status(404, format!("{} {} not found", op.obj_type, uuid)))?;
        let body = op.body.clone().ok_or_else(|| RemoteError::status(400, "missing body"))?;
        let stored = self.prepare(op.obj_type, body, uuid, Some(&existing))?;
        let rendered = self.render(op.obj_type, &stored);
        self.objects
            .entry(op.obj_type)
            .or_default()
            .insert(uuid.to_string(), stored);
        Ok(rendered)
    }

    fn delete(&mut self, obj_type: ObjType, uuid: &str) -> Result<Value, RemoteError> {
        if self.object(obj_type, uuid).is_none() {
            return Err(RemoteError::status(404, format!("{} {} not found", obj_type, uuid)));
        }
        if let Some(referrer) = self.referenced_by(uuid) {
            return Err(RemoteError::status(409, format!("{} {} is referred to by {}", obj_type, uuid, referrer)));
        }
        if let Some(objs) = self.objects.get_mut(&obj_type) {
            objs.remove(uuid);
        }
        Ok(json!({}))
    }

    fn list(&self, obj_type: ObjType, query: &str) -> Value {
        let mut page = 1usize;
        let mut page_size = DEFAULT_PAGE_SIZE;
        let mut name_filter = None;
        for kv in query.split('&').filter(|kv| !kv.is_empty()) {
            match kv.split_once('=') {
                Some(("page", v)) => page = v.parse::<usize>().unwrap_or(1).max(1),
                Some(("page_size", v)) => page_size = v.parse::<usize>().unwrap_or(DEFAULT_PAGE_SIZE).max(1),
                Some(("name", v)) => name_filter = Some(v.to_string()),
                _ => {}
            }
        }

        let all: Vec<Value> = self
            .objects
            .get(&obj_type)
            .map(|objs| {
                objs.values()
                    .filter(|o| match &name_filter {
                        Some(n) => o.get("name").and_then(Value::as_str) == Some(n.as_str()),
                        None => true,
                    })
                    .map(|o| self.render(obj_type, o))
                    .collect()
            })
            .unwrap_or_default();

        let start = (page - 1) * page_size;
        let results: Vec<Value> = all.iter().skip(start).take(page_size).cloned().collect();
        let mut response = Map::new();
        response.insert("count".into(), json!(all.len()));
        response.insert("results".into(), Value::Array(results));
        if start + page_size < all.len() {
            response.insert(
                "next".into(),
                Value::String(format!(
                    "{}?page={}&page_size={}",
                    obj_type.collection_path(),
                    page + 1,
                    page_size
                )),
            );
        }
        Value::Object(response)
    }
}

/// Remote controller held entirely in memory
#[derive(Debug)]
pub struct InMemoryController {
    state: Mutex<ControllerState>,
}

impl InMemoryController {
    /// New controller with the default `global` VRF context
    pub fn new(tenant: &str) -> Self {
        let controller = Self {
            state: Mutex::new(ControllerState::default()),
        };
        controller.seed_vrf("global", tenant);
        controller
    }

    /// Pre-create a VRF context (VRFs are never created by the reconciler)
    pub fn seed_vrf(&self, name: &str, tenant: &str) {
        let mut state = safe_lock(&self.state);
        if state.uuid_by_name(ObjType::Vrf, name).is_some() {
            return;
        }
        let uuid = format!("vrfcontext-{}", Uuid::new_v4());
        let obj = json!({
            "name": name,
            "uuid": uuid,
            "url": format!("{}#{}", ObjType::Vrf.object_path(&uuid), name),
            "tenant_ref": format!("/api/tenant/?name={}", tenant),
            "static_routes": [],
        });
        state.objects.entry(ObjType::Vrf).or_default().insert(uuid, obj);
    }

    /// Fail the next `method` on `obj_type` with `status`
    pub fn fail_next(&self, method: RestMethod, obj_type: ObjType, status: u16) {
        safe_lock(&self.state).faults.push(Fault {
            method,
            obj_type,
            status,
        });
    }

    /// Delete an object behind the reconciler's back
    pub fn remove_object(&self, obj_type: ObjType, name: &str) -> bool {
        let mut state = safe_lock(&self.state);
        let Some(uuid) = state.uuid_by_name(obj_type, name) else {
            return false;
        };
        state
            .objects
            .get_mut(&obj_type)
            .map(|objs| objs.remove(&uuid).is_some())
            .unwrap_or(false)
    }

    /// Stored object by name, as a client would see it
    pub fn object_by_name(&self, obj_type: ObjType, name: &str) -> Option<Value> {
        let state = safe_lock(&self.state);
        let uuid = state.uuid_by_name(obj_type, name)?;
        state.object(obj_type, &uuid).map(|o| state.render(obj_type, o))
    }

    pub fn count(&self, obj_type: ObjType) -> usize {
        safe_lock(&self.state)
            .objects
            .get(&obj_type)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    /// Sorted names of every stored object of a type
    pub fn names(&self, obj_type: ObjType) -> Vec<String> {
        let state = safe_lock(&self.state);
        let mut names: Vec<String> = state
            .objects
            .get(&obj_type)
            .map(|objs| {
                objs.values()
                    .filter_map(|o| o.get("name").and_then(Value::as_str).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Write operations received so far, as `METHOD type/name`
    pub fn take_calls(&self) -> Vec<String> {
        std::mem::take(&mut safe_lock(&self.state).calls)
    }
}

#[async_trait]
impl RemoteClient for InMemoryController {
    async fn execute(&self, op: &RestOp) -> Result<Value, RemoteError> {
        let mut state = safe_lock(&self.state);
        state.calls.push(format!("{} {}/{}", op.method, op.obj_type, op.obj_name));
        if let Some(status) = state.take_fault(op.method, op.obj_type) {
            debug!("Injecting {} for {}", status, op);
            return Err(RemoteError::status(status, "injected fault"));
        }
        match op.method {
            RestMethod::Post => state.create(op),
            RestMethod::Put | RestMethod::Delete => {
                let uuid = op
                    .path
                    .rsplit('/')
                    .next()
                    .filter(|u| !u.is_empty())
                    .ok_or_else(|| RemoteError::status(400, format!("no uuid in {}", op.path)))?
                    .to_string();
                if op.method == RestMethod::Put {
                    state.update(op, &uuid)
                } else {
                    state.delete(op.obj_type, &uuid)
                }
            }
        }
    }

    async fn get(&self, path: &str) -> Result<Value, RemoteError> {
        let state = safe_lock(&self.state);
        let (path, query) = path.split_once('?').unwrap_or((path, ""));
        let rest = path
            .strip_prefix("/api/")
            .ok_or_else(|| RemoteError::status(404, format!("no such path {}", path)))?;
        let (type_part, uuid) = match rest.split_once('/') {
            Some((t, u)) => (t, Some(u).filter(|u| !u.is_empty())),
            None => (rest, None),
        };
        let obj_type = type_part
            .parse::<ObjType>()
            .map_err(|_| RemoteError::status(404, format!("no such collection {}", type_part)))?;

        match uuid {
            Some(uuid) => state
                .object(obj_type, uuid)
                .map(|o| state.render(obj_type, o))
                .ok_or_else(|| RemoteError::status(404, format!("{} {} not found", obj_type, uuid))),
            None => Ok(state.list(obj_type, query)),
        }
    }
}
