//! Backend resolution: Service port → ready endpoint addresses

use k8s_openapi::api::core::v1::{Service, ServicePort};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use tracing::{debug, warn};

use super::nodes::PoolServer;
use crate::apis::cluster::ClusterState;

/// How an Ingress backend names its Service port
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortRef {
    Number(i32),
    Name(String),
}

/// Resolved backend of one pool
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Backend {
    pub protocol: String,
    pub port: u16,
    pub target_port: u16,
    pub servers: Vec<PoolServer>,
}

pub fn is_load_balancer(svc: &Service) -> bool {
    svc.spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        .map(|t| t == "LoadBalancer")
        .unwrap_or(false)
}

pub fn service_ports(svc: &Service) -> Vec<ServicePort> {
    let mut ports = svc
        .spec
        .as_ref()
        .and_then(|s| s.ports.clone())
        .unwrap_or_default();
    ports.sort_by_key(|p| p.port);
    ports
}

fn to_port(value: i32) -> u16 {
    u16::try_from(value).unwrap_or(0)
}

fn same_port_name(a: Option<&str>, b: Option<&str>) -> bool {
    a.unwrap_or("") == b.unwrap_or("")
}

/// Ready endpoints of `svc` for one of its ports, sorted and de-duplicated
pub fn resolve_servers(cluster: &dyn ClusterState, svc: &Service, port: &ServicePort) -> Vec<PoolServer> {
    let namespace = svc.namespace().unwrap_or_default();
    let name = svc.name_any();
    let numeric_target = match &port.target_port {
        Some(IntOrString::Int(n)) => Some(*n),
        Some(IntOrString::String(_)) => None,
        None => Some(port.port),
    };

    let mut servers = Vec::new();
    for slice in cluster.endpoint_slices(&namespace, &name) {
        let Some(slice_port) = slice_port_for(&slice, port, numeric_target) else {
            debug!(
                "EndpointSlice {}/{} has no port matching {}:{}",
                namespace,
                slice.name_any(),
                name,
                port.port
            );
            continue;
        };
        servers.extend(ready_servers(&slice, slice_port));
    }
    servers.sort();
    servers.dedup();
    servers
}

/// EndpointSlice port names mirror Service port names; fall back to the
/// numeric target port for slices managed outside the endpoint controller
fn slice_port_for(slice: &EndpointSlice, port: &ServicePort, numeric_target: Option<i32>) -> Option<u16> {
    let ports = slice.ports.as_ref()?;
    ports
        .iter()
        .find(|p| same_port_name(p.name.as_deref(), port.name.as_deref()))
        .or_else(|| {
            numeric_target.and_then(|target| ports.iter().find(|p| p.port == Some(target)))
        })
        .and_then(|p| p.port)
        .map(to_port)
}

fn ready_servers(slice: &EndpointSlice, port: u16) -> Vec<PoolServer> {
    let mut servers = Vec::new();
    for endpoint in &slice.endpoints {
        let is_ready = endpoint
            .conditions
            .as_ref()
            .and_then(|c| c.ready)
            .unwrap_or(true);
        if !is_ready {
            continue;
        }
        for address in &endpoint.addresses {
            if address.parse::<std::net::IpAddr>().is_err() {
                warn!("Skipping endpoint with invalid address {}", address);
                continue;
            }
            servers.push(PoolServer::new(address.clone(), port));
        }
    }
    servers
}

/// Backend for one Service port
pub fn backend_for_port(cluster: &dyn ClusterState, svc: &Service, port: &ServicePort) -> Backend {
    let target_port = match &port.target_port {
        Some(IntOrString::Int(n)) => to_port(*n),
        Some(IntOrString::String(_)) => 0,
        None => to_port(port.port),
    };
    Backend {
        protocol: port.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
        port: to_port(port.port),
        target_port,
        servers: resolve_servers(cluster, svc, port),
    }
}

/// Backend for an Ingress path. A missing Service or port yields an empty
/// server list, never an error.
pub fn backend_for_ref(
    cluster: &dyn ClusterState,
    namespace: &str,
    service: &str,
    port_ref: &PortRef,
) -> Backend {
    let empty = |port: u16| Backend {
        protocol: "TCP".to_string(),
        port,
        target_port: port,
        servers: Vec::new(),
    };

    let Some(svc) = cluster.service(namespace, service) else {
        debug!("Backend service {}/{} not found, pool will be empty", namespace, service);
        return match port_ref {
            PortRef::Number(n) => empty(to_port(*n)),
            PortRef::Name(_) => empty(0),
        };
    };

    let port = service_ports(&svc).into_iter().find(|p| match port_ref {
        PortRef::Number(n) => p.port == *n,
        PortRef::Name(name) => p.name.as_deref() == Some(name.as_str()),
    });
    match port {
        Some(port) => backend_for_port(cluster, &svc, &port),
        None => {
            warn!(
                "Service {}/{} has no port {:?}, pool will be empty",
                namespace, service, port_ref
            );
            match port_ref {
                PortRef::Number(n) => empty(to_port(*n)),
                PortRef::Name(_) => empty(0),
            }
        }
    }
}


#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::test_fixtures::*;
    use super::*;
    use crate::apis::cluster::ClusterStore;

    #[test]
    fn test_only_ready_endpoints_become_servers() {
        let store = ClusterStore::new();
        let svc = service("default", "web", "LoadBalancer", &[(80, 8080)]);
        store.apply_service(svc.clone());
        store.apply_endpoint_slice(endpoint_slice(
            "default",
            "web",
            None,
            8080,
            &["10.0.0.2", "10.0.0.1"],
            &["10.0.0.9"],
        ));

        let backend = backend_for_port(&store, &svc, &service_ports(&svc)[0]);
        assert_eq!(backend.port, 80);
        assert_eq!(backend.target_port, 8080);
        assert_eq!(
            backend.servers,
            vec![
                PoolServer::new("10.0.0.1", 8080),
                PoolServer::new("10.0.0.2", 8080)
            ],
            "servers are sorted and exclude non-ready endpoints"
        );
    }

    #[test]
    fn test_named_ports_match_slice_port_names() {
        let store = ClusterStore::new();
        let svc = service("default", "web", "ClusterIP", &[(80, 8080), (443, 8443)]);
        store.apply_service(svc.clone());
        store.apply_endpoint_slice(endpoint_slice("default", "web", Some("p443"), 8443, &["10.0.0.1"], &[]));

        let ports = service_ports(&svc);
        assert!(backend_for_port(&store, &svc, &ports[0]).servers.is_empty());
        assert_eq!(
            backend_for_port(&store, &svc, &ports[1]).servers,
            vec![PoolServer::new("10.0.0.1", 8443)]
        );
    }

    #[test]
    fn test_missing_service_gives_empty_backend() {
        let store = ClusterStore::new();
        let backend = backend_for_ref(&store, "default", "missing", &PortRef::Number(80));
        assert_eq!(backend.port, 80);
        assert!(backend.servers.is_empty());
    }

    #[test]
    fn test_ipv6_endpoints_are_kept() {
        let store = ClusterStore::new();
        let svc = service("default", "web", "LoadBalancer", &[(80, 80)]);
        store.apply_endpoint_slice(endpoint_slice("default", "web", None, 80, &["fd00::1"], &[]));

        let servers = resolve_servers(&store, &svc, &service_ports(&svc)[0]);
        assert_eq!(servers, vec![PoolServer::new("fd00::1", 80)]);
    }

    #[test]
    fn test_load_balancer_detection() {
        assert!(is_load_balancer(&service("default", "a", "LoadBalancer", &[(80, 80)])));
        assert!(!is_load_balancer(&service("default", "a", "ClusterIP", &[(80, 80)])));
    }
}
