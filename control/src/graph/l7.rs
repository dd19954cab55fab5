//! L7 graphs: Ingress rules sharded by hostname onto shared virtual services
//!
//! ```text
//! shard VS (SNI parent when any TLS host resolves)
//! ├── VIP            every FQDN on the shard
//! ├── data script    selects a pool by host/path
//! ├── pool group     one member per insecure host/path/ingress
//! │   └── pools
//! └── SNI child VS   one per TLS host
//!     ├── TLS cert
//!     └── pool group → pools
//! ```

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;
use tracing::{debug, warn};

use super::backends::{backend_for_ref, PortRef};
use super::builder::{BuiltModel, IngressRefs, Naming};
use super::nodes::{
    DataScriptNode, GraphNode, PoolGroupMember, PoolGroupNode, PoolNode, PortProtocol,
    ServiceMetadata, TlsCertNode, VipNode, VsNode, VsType,
};
use super::object_graph::ObjectGraph;
use super::rules::RouteRuleEnricher;
use crate::apis::cluster::ClusterState;
use crate::keys::{ObjKey, SourceKey, SourceKind};

const HTTP_APP_PROFILE: &str = "System-HTTP";
const SECURE_HTTP_APP_PROFILE: &str = "System-Secure-HTTP";
const TCP_NETWORK_PROFILE: &str = "System-TCP-Proxy";
const HOST_SELECT_EVENT: &str = "VS_DATASCRIPT_EVT_HTTP_REQ";
const HOST_SELECT_SCRIPT: &str = "local label = string.lower(http.host() .. http.path_prefix())\npoolgroup.select(\"POOLGROUP\", label)";

/// One host/path → service route contributed by an Ingress
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct HostRoute {
    pub host: String,
    pub path: String,
    pub ingress: ObjKey,
    pub service: String,
    pub port: PortRefKey,
}

/// Orderable form of [`PortRef`]
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum PortRefKey {
    Number(i32),
    Name(String),
}

impl From<&PortRefKey> for PortRef {
    fn from(key: &PortRefKey) -> Self {
        match key {
            PortRefKey::Number(n) => PortRef::Number(*n),
            PortRefKey::Name(s) => PortRef::Name(s.clone()),
        }
    }
}

/// Every host/path route of an Ingress, plus its TLS host → secret map
pub fn ingress_routes(ingress: &Ingress) -> (Vec<HostRoute>, BTreeMap<String, ObjKey>) {
    let namespace = ingress.namespace().unwrap_or_default();
    let key = ObjKey::new(namespace.clone(), ingress.name_any());
    let Some(spec) = ingress.spec.as_ref() else {
        return (Vec::new(), BTreeMap::new());
    };

    let mut tls = BTreeMap::new();
    for entry in spec.tls.iter().flatten() {
        let Some(secret) = entry.secret_name.as_ref() else {
            continue;
        };
        for host in entry.hosts.iter().flatten() {
            tls.entry(host.clone())
                .or_insert_with(|| ObjKey::new(namespace.clone(), secret.clone()));
        }
    }

    let mut routes = Vec::new();
    for rule in spec.rules.iter().flatten() {
        let Some(host) = rule.host.as_ref().filter(|h| !h.is_empty()) else {
            debug!("Ingress {} has a rule without host, skipping", key);
            continue;
        };
        for path in rule.http.iter().flat_map(|h| h.paths.iter()) {
            let Some(backend) = path.backend.service.as_ref() else {
                debug!("Ingress {} path has no service backend, skipping", key);
                continue;
            };
            let port = match backend.port.as_ref() {
                Some(p) => match (&p.number, &p.name) {
                    (Some(n), _) => PortRefKey::Number(*n),
                    (None, Some(name)) => PortRefKey::Name(name.clone()),
                    (None, None) => PortRefKey::Number(80),
                },
                None => PortRefKey::Number(80),
            };
            routes.push(HostRoute {
                host: host.to_lowercase(),
                path: path.path.clone().unwrap_or_else(|| "/".to_string()),
                ingress: key.clone(),
                service: backend.name.clone(),
                port,
            });
        }
    }
    (routes, tls)
}

/// Services and secrets an Ingress references, for the relationship index
pub fn ingress_refs(ingress: &Ingress) -> IngressRefs {
    let namespace = ingress.namespace().unwrap_or_default();
    let (routes, tls) = ingress_routes(ingress);
    IngressRefs {
        ingress: ObjKey::new(namespace.clone(), ingress.name_any()),
        services: routes
            .iter()
            .map(|r| ObjKey::new(namespace.clone(), r.service.clone()))
            .collect(),
        secrets: tls.into_values().collect(),
    }
}

fn tls_material(secret: &Secret) -> Option<(String, String)> {
    let data = secret.data.as_ref()?;
    let cert = data.get("tls.crt")?;
    let key = data.get("tls.key")?;
    Some((
        String::from_utf8_lossy(&cert.0).into_owned(),
        String::from_utf8_lossy(&key.0).into_owned(),
    ))
}

/// Build the graph for hostname shard `vs_name` from every Ingress whose
/// hosts land on it
pub fn build_shard_model(
    cluster: &dyn ClusterState,
    naming: &Naming,
    rules: &dyn RouteRuleEnricher,
    vs_name: &str,
) -> BuiltModel {
    let model_name = naming.model_name(vs_name);

    let mut routes: Vec<HostRoute> = Vec::new();
    let mut tls_hosts: BTreeMap<String, ObjKey> = BTreeMap::new();
    let mut refs = Vec::new();
    for ingress in cluster.ingresses() {
        let (ing_routes, ing_tls) = ingress_routes(&ingress);
        let on_shard: Vec<HostRoute> = ing_routes
            .into_iter()
            .filter(|r| naming.shard_vs_name(&r.host) == vs_name)
            .collect();
        if on_shard.is_empty() {
            continue;
        }
        for route in &on_shard {
            if let Some(secret) = ing_tls.get(&route.host) {
                // first ingress (by namespace/name) to claim a TLS host wins
                tls_hosts
                    .entry(route.host.clone())
                    .or_insert_with(|| secret.clone());
            }
        }
        refs.push(ingress_refs(&ingress));
        routes.extend(on_shard);
    }

    if routes.is_empty() {
        return BuiltModel::empty(model_name);
    }
    routes.sort();
    routes.dedup();

    let mut sources: BTreeSet<SourceKey> = BTreeSet::new();
    for r in &routes {
        sources.insert(SourceKey::new(SourceKind::Ingress, r.ingress.namespace.clone(), r.ingress.name.clone()));
        sources.insert(SourceKey::new(SourceKind::Service, r.ingress.namespace.clone(), r.service.clone()));
    }
    for secret in tls_hosts.values() {
        sources.insert(SourceKey::new(SourceKind::Secret, secret.namespace.clone(), secret.name.clone()));
    }

    let mut shard = ShardGraph::new(cluster, naming, vs_name);
    let mut host_rules = Vec::new();

    let mut by_host: BTreeMap<String, Vec<&HostRoute>> = BTreeMap::new();
    for route in &routes {
        by_host.entry(route.host.clone()).or_default().push(route);
    }

    for (host, host_routes) in &by_host {
        let secure = tls_hosts.get(host).and_then(|secret| {
            let material = cluster
                .secret(&secret.namespace, &secret.name)
                .as_ref()
                .and_then(tls_material);
            if material.is_none() {
                warn!(
                    "TLS secret {} for host {} is missing or incomplete, host not served until it appears",
                    secret, host
                );
            }
            material.map(|m| (secret.clone(), m))
        });

        let applied = match secure {
            Some((secret, (cert, key))) => shard.add_sni_host(rules, host, host_routes, &secret, cert, key),
            None if tls_hosts.contains_key(host) => Vec::new(),
            None => shard.add_insecure_host(rules, host, host_routes),
        };
        host_rules.push((host.clone(), applied.into_iter().collect()));
    }

    BuiltModel {
        model_name,
        graph: Some(shard.finish()),
        sources,
        ingresses: refs,
        host_rules,
    }
}

struct ShardGraph<'a> {
    cluster: &'a dyn ClusterState,
    naming: &'a Naming,
    vs: VsNode,
    vip: VipNode,
    pool_group: PoolGroupNode,
    pools: BTreeMap<String, PoolNode>,
    children: Vec<GraphNode>,
    ingresses: BTreeSet<ObjKey>,
}

impl<'a> ShardGraph<'a> {
    fn new(cluster: &'a dyn ClusterState, naming: &'a Naming, vs_name: &str) -> Self {
        let tenant = naming.tenant.as_str();
        let mut vs = VsNode::new(tenant, vs_name);
        vs.application_profile = HTTP_APP_PROFILE.to_string();
        vs.network_profile = TCP_NETWORK_PROFILE.to_string();
        vs.ports = vec![
            PortProtocol::new(80, "TCP", false),
            PortProtocol::new(443, "TCP", true),
        ];
        vs.vrf_context = naming.vrf.clone();

        Self {
            cluster,
            naming,
            vip: VipNode {
                name: format!("{}-vip", vs_name),
                tenant: tenant.to_string(),
                fqdns: Vec::new(),
                vrf_context: naming.vrf.clone(),
                east_west: false,
                checksum: 0,
            },
            pool_group: PoolGroupNode::new(tenant, format!("{}-pg", vs_name)),
            vs,
            pools: BTreeMap::new(),
            children: Vec::new(),
            ingresses: BTreeSet::new(),
        }
    }

    fn pool_for(&self, route: &HostRoute) -> PoolNode {
        let tenant = self.naming.tenant.as_str();
        let backend = backend_for_ref(
            self.cluster,
            &route.ingress.namespace,
            &route.service,
            &PortRef::from(&route.port),
        );
        let mut pool = PoolNode::new(tenant, self.naming.l7_pool_name(&route.host, &route.path, &route.ingress));
        pool.protocol = backend.protocol;
        pool.port = backend.port;
        pool.target_port = backend.target_port;
        pool.servers = backend.servers;
        pool.priority_label = Some(format!("{}{}", route.host, route.path));
        pool.vrf_context = self.naming.vrf.clone();
        pool.service_metadata = ServiceMetadata {
            service: None,
            ingresses: vec![route.ingress.clone()],
            hostnames: vec![route.host.clone()],
        };
        pool
    }

    fn add_insecure_host(&mut self, rules: &dyn RouteRuleEnricher, host: &str, routes: &[&HostRoute]) -> Vec<ObjKey> {
        for route in routes {
            let pool = self.pool_for(route);
            self.ingresses.insert(route.ingress.clone());
            self.pools.entry(pool.name.clone()).or_insert(pool);
        }
        self.vip.fqdns.push(host.to_string());
        rules.enrich(host, &mut self.vs)
    }

    fn add_sni_host(
        &mut self,
        rules: &dyn RouteRuleEnricher,
        host: &str,
        routes: &[&HostRoute],
        secret: &ObjKey,
        certificate: String,
        key: String,
    ) -> Vec<ObjKey> {
        let tenant = self.naming.tenant.clone();
        let child_name = self.naming.sni_child_name(host);

        let mut child = VsNode::new(tenant.as_str(), child_name.clone());
        child.vs_type = VsType::SniChild;
        child.parent = Some(self.vs.name.clone());
        child.application_profile = SECURE_HTTP_APP_PROFILE.to_string();
        child.vh_domain_names = vec![host.to_string()];
        child.vrf_context = self.naming.vrf.clone();

        let cert = TlsCertNode {
            name: self.naming.cert_name(&child_name),
            tenant: tenant.clone(),
            certificate,
            key,
            checksum: 0,
        };
        debug!("Host {} served by {} with certificate from {}", host, child_name, secret);
        child.ssl_cert_refs.push(cert.obj_key());
        self.children.push(GraphNode::TlsCert(cert));

        let mut pg = PoolGroupNode::new(tenant.as_str(), format!("{}-pg", child_name));
        let mut ingresses = BTreeSet::new();
        let mut pools = BTreeMap::new();
        for route in routes {
            let pool = self.pool_for(route);
            ingresses.insert(route.ingress.clone());
            pools.entry(pool.name.clone()).or_insert(pool);
        }
        for pool in pools.into_values() {
            pg.members.push(PoolGroupMember {
                pool: pool.key(),
                priority_label: pool.priority_label.clone(),
            });
            child.pool_refs.push(pool.key());
            self.children.push(GraphNode::Pool(pool));
        }
        child.pool_group_refs.push(pg.key());
        child.default_pool_group = Some(pg.key());
        child.service_metadata = ServiceMetadata {
            service: None,
            ingresses: ingresses.iter().cloned().collect(),
            hostnames: vec![host.to_string()],
        };
        self.ingresses.extend(ingresses);

        let applied = rules.enrich(host, &mut child);

        self.vs.vs_type = VsType::SniParent;
        self.vs.sni_child_refs.push(child.key());
        self.vip.fqdns.push(host.to_string());
        self.children.push(GraphNode::PoolGroup(pg));
        self.children.push(GraphNode::VirtualService(child));
        applied
    }

    fn finish(mut self) -> ObjectGraph {
        let tenant = self.naming.tenant.clone();
        let mut graph = ObjectGraph::new(tenant.as_str(), self.vs.name.clone());

        self.vip.fqdns.sort();
        self.vip.fqdns.dedup();
        self.vs.vip_refs.push(self.vip.key());
        self.vs.service_metadata = ServiceMetadata {
            service: None,
            ingresses: self.ingresses.iter().cloned().collect(),
            hostnames: self.vip.fqdns.clone(),
        };

        let mut shared = Vec::new();
        if !self.pools.is_empty() {
            for pool in self.pools.values() {
                self.pool_group.members.push(PoolGroupMember {
                    pool: pool.key(),
                    priority_label: pool.priority_label.clone(),
                });
                self.vs.pool_refs.push(pool.key());
            }
            let ds = DataScriptNode {
                name: format!("{}-ds", self.vs.name),
                tenant: tenant.clone(),
                event: HOST_SELECT_EVENT.to_string(),
                script: HOST_SELECT_SCRIPT.replace("POOLGROUP", &self.pool_group.name),
                pool_group_refs: vec![self.pool_group.key()],
                checksum: 0,
            };
            self.vs.pool_group_refs.push(self.pool_group.key());
            self.vs.datascript_refs.push(ds.key());
            shared.push(GraphNode::DataScript(ds));
            shared.push(GraphNode::PoolGroup(self.pool_group));
            shared.extend(self.pools.into_values().map(GraphNode::Pool));
        }

        graph.add_node(GraphNode::VirtualService(self.vs));
        graph.add_node(GraphNode::Vip(self.vip));
        for node in shared.into_iter().chain(self.children) {
            graph.add_node(node);
        }
        graph.finalize();
        graph
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
pub(crate) mod test_fixtures {
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::api::networking::v1::{
        HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
        IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    /// Ingress with one rule per (host, path, service, port)
    pub fn ingress(namespace: &str, name: &str, rules: &[(&str, &str, &str, i32)], tls: &[(&str, &str)]) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                rules: Some(
                    rules
                        .iter()
                        .map(|(host, path, svc, port)| IngressRule {
                            host: Some(host.to_string()),
                            http: Some(HTTPIngressRuleValue {
                                paths: vec![HTTPIngressPath {
                                    path: Some(path.to_string()),
                                    path_type: "Prefix".to_string(),
                                    backend: IngressBackend {
                                        service: Some(IngressServiceBackend {
                                            name: svc.to_string(),
                                            port: Some(ServiceBackendPort {
                                                number: Some(*port),
                                                name: None,
                                            }),
                                        }),
                                        resource: None,
                                    },
                                }],
                            }),
                        })
                        .collect(),
                ),
                tls: if tls.is_empty() {
                    None
                } else {
                    Some(
                        tls.iter()
                            .map(|(host, secret)| IngressTLS {
                                hosts: Some(vec![host.to_string()]),
                                secret_name: Some(secret.to_string()),
                            })
                            .collect(),
                    )
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn tls_secret(namespace: &str, name: &str, cert: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([
                ("tls.crt".to_string(), ByteString(cert.as_bytes().to_vec())),
                ("tls.key".to_string(), ByteString(b"key".to_vec())),
            ])),
            type_: Some("kubernetes.io/tls".to_string()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::test_fixtures::*;
    use super::*;
    use crate::apis::cluster::ClusterStore;
    use crate::config::SyncConfig;
    use crate::graph::backends::test_fixtures::{endpoint_slice, service};
    use crate::graph::nodes::{NodeKind, PoolServer};
    use crate::graph::rules::NoRouteRules;

    fn naming() -> Naming {
        Naming::from_config(&SyncConfig::default())
    }

    fn store_with_web() -> ClusterStore {
        let store = ClusterStore::new();
        store.apply_service(service("default", "web", "ClusterIP", &[(80, 8080)]));
        store.apply_endpoint_slice(endpoint_slice("default", "web", None, 8080, &["10.0.0.1", "10.0.0.2"], &[]));
        store
    }

    #[test]
    fn test_two_ingresses_share_one_pool_group() {
        let store = store_with_web();
        store.apply_ingress(ingress("default", "a", &[("foo.com", "/api", "web", 80)], &[]));
        store.apply_ingress(ingress("default", "b", &[("foo.com", "/shop", "web", 80)], &[]));

        let naming = naming();
        let vs_name = naming.shard_vs_name("foo.com");
        let built = build_shard_model(&store, &naming, &NoRouteRules, &vs_name);
        let graph = built.graph.unwrap();

        assert_eq!(graph.count(NodeKind::VirtualService), 1);
        assert_eq!(graph.count(NodeKind::PoolGroup), 1);
        assert_eq!(graph.count(NodeKind::Pool), 2);

        let pg = graph.pool_group(&ObjKey::new("admin", format!("{}-pg", vs_name))).unwrap();
        assert_eq!(pg.members.len(), 2);
        for member in &pg.members {
            let pool = graph.pool(&member.pool).unwrap();
            assert_eq!(
                pool.servers,
                vec![PoolServer::new("10.0.0.1", 8080), PoolServer::new("10.0.0.2", 8080)]
            );
        }
        assert_eq!(built.ingresses.len(), 2);
    }

    #[test]
    fn test_hosts_on_other_shards_are_excluded() {
        let store = store_with_web();
        let naming = naming();
        // find two hosts on different shards
        let first = "foo.com";
        let other = (0..100)
            .map(|i| format!("host-{}.example.com", i))
            .find(|h| naming.shard_vs_name(h) != naming.shard_vs_name(first))
            .unwrap();
        store.apply_ingress(ingress(
            "default",
            "a",
            &[(first, "/", "web", 80), (other.as_str(), "/", "web", 80)],
            &[],
        ));

        let graph = build_shard_model(&store, &naming, &NoRouteRules, &naming.shard_vs_name(first))
            .graph
            .unwrap();
        assert_eq!(graph.count(NodeKind::Pool), 1);
        assert_eq!(graph.vip(&ObjKey::new("admin", format!("{}-vip", naming.shard_vs_name(first)))).unwrap().fqdns, vec!["foo.com"]);
    }

    #[test]
    fn test_tls_host_becomes_sni_child() {
        let store = store_with_web();
        store.apply_secret(tls_secret("default", "foo-tls", "CERT"));
        store.apply_ingress(ingress("default", "a", &[("foo.com", "/", "web", 80)], &[("foo.com", "foo-tls")]));

        let naming = naming();
        let built = build_shard_model(&store, &naming, &NoRouteRules, &naming.shard_vs_name("foo.com"));
        let graph = built.graph.unwrap();

        let parent = graph.top_vs().unwrap();
        assert_eq!(parent.vs_type, VsType::SniParent);
        let children: Vec<&VsNode> = graph.sni_children(parent).collect();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].vh_domain_names, vec!["foo.com"]);
        assert_eq!(graph.count(NodeKind::TlsCert), 1);
        assert!(parent.pool_group_refs.is_empty(), "no insecure hosts on this shard");
        assert!(built
            .sources
            .contains(&SourceKey::new(SourceKind::Secret, "default", "foo-tls")));
    }

    #[test]
    fn test_missing_tls_secret_skips_host_but_keeps_index() {
        let store = store_with_web();
        store.apply_ingress(ingress("default", "a", &[("foo.com", "/", "web", 80)], &[("foo.com", "foo-tls")]));

        let naming = naming();
        let built = build_shard_model(&store, &naming, &NoRouteRules, &naming.shard_vs_name("foo.com"));
        let graph = built.graph.unwrap();

        assert_eq!(graph.count(NodeKind::VirtualService), 1);
        assert_eq!(graph.count(NodeKind::Pool), 0);
        assert_eq!(
            built.ingresses[0].secrets,
            BTreeSet::from([ObjKey::new("default", "foo-tls")]),
            "secret stays indexed so its creation triggers a rebuild"
        );
    }

    #[test]
    fn test_no_ingresses_on_shard_builds_nothing() {
        let store = store_with_web();
        let naming = naming();
        let built = build_shard_model(&store, &naming, &NoRouteRules, &naming.shard_vs_name("foo.com"));
        assert!(built.graph.is_none());
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let store = store_with_web();
        store.apply_secret(tls_secret("shop", "bar-tls", "CERT"));
        store.apply_ingress(ingress("default", "a", &[("foo.com", "/api", "web", 80)], &[]));
        store.apply_ingress(ingress("shop", "b", &[("bar.com", "/", "web", 80)], &[("bar.com", "bar-tls")]));

        let naming = naming();
        for host in ["foo.com", "bar.com"] {
            let vs = naming.shard_vs_name(host);
            let a = build_shard_model(&store, &naming, &NoRouteRules, &vs).graph.unwrap();
            let b = build_shard_model(&store, &naming, &NoRouteRules, &vs).graph.unwrap();
            assert_eq!(a.checksum(), b.checksum());
            assert_eq!(a, b);
        }
    }
}
