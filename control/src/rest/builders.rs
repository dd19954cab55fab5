//! Remote payloads for each node kind
//!
//! References to other managed objects are sent by name (`?name=`); the
//! controller resolves them to uuids on write, so a payload never depends on
//! cache state.

use serde_json::{json, Value};

use crate::config::SyncConfig;
use crate::graph::nodes::{
    DataScriptNode, PoolGroupNode, PoolNode, PoolServer, TlsCertNode, VipNode, VrfNode, VsNode,
};
use crate::remote::ObjType;

/// Fields stamped on every payload
#[derive(Debug, Clone)]
pub struct PayloadContext {
    pub cloud: String,
    pub created_by: String,
}

impl PayloadContext {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            cloud: config.cloud_name.clone(),
            created_by: config.controller.created_by.clone(),
        }
    }

    fn base(&self, name: &str, tenant: &str, checksum: u32) -> serde_json::Map<String, Value> {
        let mut map = serde_json::Map::new();
        map.insert("name".into(), json!(name));
        map.insert("tenant_ref".into(), json!(format!("/api/tenant/?name={}", tenant)));
        map.insert("cloud_ref".into(), json!(format!("/api/cloud/?name={}", self.cloud)));
        map.insert("cloud_config_cksum".into(), json!(checksum.to_string()));
        map.insert("created_by".into(), json!(self.created_by));
        map
    }
}

fn ip_addr(ip: &str) -> Value {
    let kind = if ip.contains(':') { "V6" } else { "V4" };
    json!({"addr": ip, "type": kind})
}

fn server(s: &PoolServer) -> Value {
    json!({"ip": ip_addr(&s.ip), "port": s.port})
}

fn metadata_string<T: serde::Serialize>(metadata: &T) -> Value {
    // serializing plain strings and vectors cannot fail
    Value::String(serde_json::to_string(metadata).unwrap_or_default())
}

pub fn pool_payload(ctx: &PayloadContext, pool: &PoolNode) -> Value {
    let mut map = ctx.base(&pool.name, &pool.tenant, pool.checksum);
    if !pool.vrf_context.is_empty() {
        map.insert("vrf_ref".into(), json!(ObjType::Vrf.name_ref(&pool.vrf_context)));
    }
    map.insert("default_server_port".into(), json!(pool.target_port));
    map.insert("servers".into(), Value::Array(pool.servers.iter().map(server).collect()));
    map.insert(
        "lb_algorithm".into(),
        json!(pool.lb_algorithm.as_deref().unwrap_or("LB_ALGORITHM_LEAST_CONNECTIONS")),
    );
    if !pool.service_metadata.is_empty() {
        map.insert("service_metadata".into(), metadata_string(&pool.service_metadata));
    }
    Value::Object(map)
}

pub fn pool_group_payload(ctx: &PayloadContext, pg: &PoolGroupNode) -> Value {
    let mut map = ctx.base(&pg.name, &pg.tenant, pg.checksum);
    let members: Vec<Value> = pg
        .members
        .iter()
        .map(|m| {
            let mut member = json!({"pool_ref": ObjType::Pool.name_ref(&m.pool.name), "ratio": 1});
            if let Some(label) = &m.priority_label {
                member["priority_label"] = json!(label);
            }
            member
        })
        .collect();
    map.insert("members".into(), Value::Array(members));
    Value::Object(map)
}

pub fn datascript_payload(ctx: &PayloadContext, ds: &DataScriptNode) -> Value {
    let mut map = ctx.base(&ds.name, &ds.tenant, ds.checksum);
    map.insert("datascript".into(), json!([{"evt": ds.event, "script": ds.script}]));
    map.insert(
        "pool_group_refs".into(),
        Value::Array(
            ds.pool_group_refs
                .iter()
                .map(|k| json!(ObjType::PoolGroup.name_ref(&k.name)))
                .collect(),
        ),
    );
    Value::Object(map)
}

pub fn cert_payload(ctx: &PayloadContext, cert: &TlsCertNode) -> Value {
    let mut map = ctx.base(&cert.name, &cert.tenant, cert.checksum);
    map.insert("type".into(), json!("SSL_CERTIFICATE_TYPE_VIRTUALSERVICE"));
    map.insert("certificate".into(), json!({"certificate": cert.certificate}));
    map.insert("key".into(), json!(cert.key));
    Value::Object(map)
}

pub fn vip_payload(ctx: &PayloadContext, vip: &VipNode) -> Value {
    let mut map = ctx.base(&vip.name, &vip.tenant, vip.checksum);
    if !vip.vrf_context.is_empty() {
        map.insert("vrf_context_ref".into(), json!(ObjType::Vrf.name_ref(&vip.vrf_context)));
    }
    map.insert(
        "dns_info".into(),
        Value::Array(vip.fqdns.iter().map(|f| json!({"fqdn": f})).collect()),
    );
    map.insert("east_west_placement".into(), json!(vip.east_west));
    Value::Object(map)
}

pub fn vs_payload(ctx: &PayloadContext, vs: &VsNode) -> Value {
    let mut map = ctx.base(&vs.name, &vs.tenant, vs.checksum);
    map.insert("type".into(), json!(vs.vs_type.as_str()));
    map.insert(
        "application_profile_ref".into(),
        json!(format!("/api/applicationprofile/?name={}", vs.application_profile)),
    );
    if !vs.network_profile.is_empty() {
        map.insert(
            "network_profile_ref".into(),
            json!(format!("/api/networkprofile/?name={}", vs.network_profile)),
        );
    }
    if !vs.vrf_context.is_empty() {
        map.insert("vrf_context_ref".into(), json!(ObjType::Vrf.name_ref(&vs.vrf_context)));
    }
    map.insert(
        "services".into(),
        Value::Array(
            vs.ports
                .iter()
                .map(|p| json!({"port": p.port, "enable_ssl": p.enable_ssl}))
                .collect(),
        ),
    );

    if let Some(parent) = &vs.parent {
        map.insert("vh_parent_vs_ref".into(), json!(ObjType::VirtualService.name_ref(parent)));
        map.insert("vh_domain_name".into(), json!(vs.vh_domain_names));
    }
    if let Some(vip) = vs.vip_refs.first() {
        map.insert("vsvip_ref".into(), json!(ObjType::Vip.name_ref(&vip.name)));
    }

    // one pool group per listener port pairs them up; otherwise the default
    // (or only) pool group serves every port
    if vs.datascript_refs.is_empty() && vs.pool_group_refs.len() > 1 && vs.pool_group_refs.len() == vs.ports.len() {
        let select: Vec<Value> = vs
            .ports
            .iter()
            .zip(&vs.pool_group_refs)
            .map(|(port, pg)| {
                json!({
                    "service_port": port.port,
                    "service_pool_group_ref": ObjType::PoolGroup.name_ref(&pg.name),
                })
            })
            .collect();
        map.insert("service_pool_select".into(), Value::Array(select));
    } else if let Some(pg) = vs.default_pool_group.as_ref().or(vs.pool_group_refs.first()) {
        map.insert("pool_group_ref".into(), json!(ObjType::PoolGroup.name_ref(&pg.name)));
    }

    if !vs.datascript_refs.is_empty() {
        let scripts: Vec<Value> = vs
            .datascript_refs
            .iter()
            .enumerate()
            .map(|(i, ds)| {
                json!({
                    "index": i + 1,
                    "vs_datascript_set_ref": ObjType::DataScript.name_ref(&ds.name),
                })
            })
            .collect();
        map.insert("vs_datascripts".into(), Value::Array(scripts));
    }
    if !vs.ssl_cert_refs.is_empty() {
        map.insert(
            "ssl_key_and_certificate_refs".into(),
            Value::Array(
                vs.ssl_cert_refs
                    .iter()
                    .map(|c| json!(ObjType::SslCert.name_ref(&c.name)))
                    .collect(),
            ),
        );
    }
    if !vs.policy_refs.is_empty() {
        map.insert(
            "http_policies".into(),
            Value::Array(
                vs.policy_refs
                    .iter()
                    .enumerate()
                    .map(|(i, p)| json!({"index": i + 1, "http_policy_set_ref": format!("/api/httppolicyset/?name={}", p)}))
                    .collect(),
            ),
        );
    }
    map.insert("service_metadata".into(), metadata_string(&vs.service_metadata));
    Value::Object(map)
}

/// `10.244.1.0/24` → `{"ip_addr": {...}, "mask": 24}`
fn prefix(cidr: &str) -> Value {
    let (addr, mask) = cidr.split_once('/').unwrap_or((cidr, "32"));
    let mask: u8 = mask.parse().unwrap_or(32);
    json!({"ip_addr": ip_addr(addr), "mask": mask})
}

pub fn vrf_payload(ctx: &PayloadContext, vrf: &VrfNode) -> Value {
    let mut map = ctx.base(&vrf.name, &vrf.tenant, vrf.checksum);
    map.remove("created_by");
    map.insert(
        "static_routes".into(),
        Value::Array(
            vrf.static_routes
                .iter()
                .map(|r| {
                    json!({
                        "route_id": r.route_id,
                        "prefix": prefix(&r.prefix),
                        "next_hop": ip_addr(&r.next_hop),
                    })
                })
                .collect(),
        ),
    );
    Value::Object(map)
}
