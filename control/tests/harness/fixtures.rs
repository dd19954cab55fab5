//! Cluster objects for scenarios

use std::collections::BTreeMap;

use control::apis::cluster::SERVICE_NAME_LABEL;
use k8s_openapi::api::core::v1::{Secret, Service, ServicePort, ServiceSpec};
use k8s_openapi::api::discovery::v1::{Endpoint, EndpointConditions, EndpointPort, EndpointSlice};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule, IngressServiceBackend,
    IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;

fn meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// Single-port TCP Service
pub fn service(namespace: &str, name: &str, type_: &str, port: i32, target_port: i32) -> Service {
    Service {
        metadata: meta(namespace, name),
        spec: Some(ServiceSpec {
            type_: Some(type_.to_string()),
            ports: Some(vec![ServicePort {
                port,
                protocol: Some("TCP".to_string()),
                target_port: Some(IntOrString::Int(target_port)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// EndpointSlice with every address ready
pub fn endpoints(namespace: &str, service: &str, port: i32, addresses: &[&str]) -> EndpointSlice {
    let mut metadata = meta(namespace, &format!("{}-slice", service));
    metadata.labels = Some(BTreeMap::from([(SERVICE_NAME_LABEL.to_string(), service.to_string())]));
    EndpointSlice {
        metadata,
        address_type: "IPv4".to_string(),
        endpoints: addresses
            .iter()
            .map(|addr| Endpoint {
                addresses: vec![addr.to_string()],
                conditions: Some(EndpointConditions {
                    ready: Some(true),
                    serving: Some(true),
                    terminating: Some(false),
                }),
                ..Default::default()
            })
            .collect(),
        ports: Some(vec![EndpointPort {
            name: None,
            port: Some(port),
            protocol: Some("TCP".to_string()),
            app_protocol: None,
        }]),
    }
}

/// Ingress with one host and path routed to `service:port`
pub fn ingress(namespace: &str, name: &str, host: &str, path: &str, service: &str, port: i32) -> Ingress {
    Ingress {
        metadata: meta(namespace, name),
        spec: Some(IngressSpec {
            rules: Some(vec![IngressRule {
                host: Some(host.to_string()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some(path.to_string()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: service.to_string(),
                                port: Some(ServiceBackendPort {
                                    number: Some(port),
                                    name: None,
                                }),
                            }),
                            resource: None,
                        },
                    }],
                }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// [`ingress`] with its host terminated using `secret`
pub fn tls_ingress(
    namespace: &str,
    name: &str,
    host: &str,
    path: &str,
    service: &str,
    port: i32,
    secret: &str,
) -> Ingress {
    let mut ing = ingress(namespace, name, host, path, service, port);
    if let Some(spec) = ing.spec.as_mut() {
        spec.tls = Some(vec![IngressTLS {
            hosts: Some(vec![host.to_string()]),
            secret_name: Some(secret.to_string()),
        }]);
    }
    ing
}

/// `kubernetes.io/tls` Secret
pub fn tls_secret(namespace: &str, name: &str) -> Secret {
    Secret {
        metadata: meta(namespace, name),
        data: Some(BTreeMap::from([
            ("tls.crt".to_string(), ByteString(b"CERT".to_vec())),
            ("tls.key".to_string(), ByteString(b"KEY".to_vec())),
        ])),
        type_: Some("kubernetes.io/tls".to_string()),
        ..Default::default()
    }
}
