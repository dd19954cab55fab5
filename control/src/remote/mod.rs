//! Remote controller protocol
//!
//! ```text
//! create  POST   /api/macro            {"model_name": "<Type>", "data": {...}}
//! update  PUT    /api/<type>/<uuid>    {...}
//! delete  DELETE /api/<type>/<uuid>
//! list    GET    /api/<type>?page=N&page_size=M   {"count", "results", "next"}
//! ```
//!
//! Every object the reconciler writes carries `cloud_config_cksum` so that
//! drift can be detected from the remote side alone.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, warn};

pub mod http;
pub mod memory;
pub mod pool;

pub use http::HttpRemoteClient;
pub use memory::InMemoryController;
pub use pool::ClientPool;

/// Remote operation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("HTTP {code}: {message}")]
    Status { code: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Not attempted after an earlier failure in the batch")]
    Aborted,
}

impl RemoteError {
    pub fn status(code: u16, message: impl Into<String>) -> Self {
        RemoteError::Status {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> Option<u16> {
        match self {
            RemoteError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == Some(404)
    }
}

// =============================================================================
// Object types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjType {
    VirtualService,
    Pool,
    PoolGroup,
    DataScript,
    SslCert,
    Vip,
    Vrf,
}

impl ObjType {
    pub const ALL: [ObjType; 7] = [
        ObjType::VirtualService,
        ObjType::Pool,
        ObjType::PoolGroup,
        ObjType::DataScript,
        ObjType::SslCert,
        ObjType::Vip,
        ObjType::Vrf,
    ];

    /// Path segment under `/api/`
    pub fn api_name(&self) -> &'static str {
        match self {
            ObjType::VirtualService => "virtualservice",
            ObjType::Pool => "pool",
            ObjType::PoolGroup => "poolgroup",
            ObjType::DataScript => "vsdatascriptset",
            ObjType::SslCert => "sslkeyandcertificate",
            ObjType::Vip => "vsvip",
            ObjType::Vrf => "vrfcontext",
        }
    }

    /// `model_name` of the create envelope
    pub fn macro_name(&self) -> &'static str {
        match self {
            ObjType::VirtualService => "VirtualService",
            ObjType::Pool => "Pool",
            ObjType::PoolGroup => "PoolGroup",
            ObjType::DataScript => "VSDataScriptSet",
            ObjType::SslCert => "SSLKeyAndCertificate",
            ObjType::Vip => "VsVip",
            ObjType::Vrf => "VrfContext",
        }
    }

    pub fn collection_path(&self) -> String {
        format!("/api/{}", self.api_name())
    }

    pub fn object_path(&self, uuid: &str) -> String {
        format!("/api/{}/{}", self.api_name(), uuid)
    }

    /// Reference by name, resolved by the controller on write
    pub fn name_ref(&self, name: &str) -> String {
        format!("/api/{}/?name={}", self.api_name(), name)
    }
}

impl fmt::Display for ObjType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.api_name())
    }
}

impl FromStr for ObjType {
    type Err = RemoteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ObjType::ALL
            .into_iter()
            .find(|t| t.api_name() == s || t.macro_name() == s)
            .ok_or_else(|| RemoteError::Malformed(format!("unknown object type '{}'", s)))
    }
}

/// Parsed object reference
///
/// Accepts `/api/<type>/<uuid>#<name>`, `/api/<type>/<uuid>` and
/// `/api/<type>/?name=<name>`, with or without a scheme and host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjRef {
    pub obj_type: Option<ObjType>,
    pub uuid: Option<String>,
    pub name: Option<String>,
}

pub fn parse_ref(reference: &str) -> Option<ObjRef> {
    let path = match reference.find("/api/") {
        Some(idx) => &reference[idx + "/api/".len()..],
        None => return None,
    };
    let (type_part, rest) = path.split_once('/')?;
    let obj_type = type_part.parse::<ObjType>().ok();

    if let Some(query) = rest.strip_prefix('?') {
        let name = query
            .split('&')
            .find_map(|kv| kv.strip_prefix("name="))
            .filter(|n| !n.is_empty())?;
        return Some(ObjRef {
            obj_type,
            uuid: None,
            name: Some(name.to_string()),
        });
    }

    let (uuid, name) = match rest.split_once('#') {
        Some((uuid, name)) => (uuid, Some(name.to_string()).filter(|n| !n.is_empty())),
        None => (rest, None),
    };
    if uuid.is_empty() {
        return None;
    }
    Some(ObjRef {
        obj_type,
        uuid: Some(uuid.to_string()),
        name,
    })
}

// =============================================================================
// Operations
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestMethod {
    Post,
    Put,
    Delete,
}

impl RestMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestMethod::Post => "POST",
            RestMethod::Put => "PUT",
            RestMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for RestMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One remote operation and, once executed, its outcome
#[derive(Debug, Clone)]
pub struct RestOp {
    pub method: RestMethod,
    pub path: String,
    pub obj_type: ObjType,
    pub obj_name: String,
    pub tenant: String,
    /// Known uuid of the target (update/delete)
    pub uuid: Option<String>,
    pub body: Option<Value>,
    pub response: Option<Value>,
    pub error: Option<RemoteError>,
}

impl RestOp {
    pub fn create(obj_type: ObjType, tenant: &str, name: &str, data: Value) -> Self {
        Self {
            method: RestMethod::Post,
            path: "/api/macro".to_string(),
            obj_type,
            obj_name: name.to_string(),
            tenant: tenant.to_string(),
            uuid: None,
            body: Some(serde_json::json!({
                "model_name": obj_type.macro_name(),
                "data": data,
            })),
            response: None,
            error: None,
        }
    }

    pub fn update(obj_type: ObjType, tenant: &str, name: &str, uuid: &str, data: Value) -> Self {
        Self {
            method: RestMethod::Put,
            path: obj_type.object_path(uuid),
            obj_type,
            obj_name: name.to_string(),
            tenant: tenant.to_string(),
            uuid: Some(uuid.to_string()),
            body: Some(data),
            response: None,
            error: None,
        }
    }

    pub fn delete(obj_type: ObjType, tenant: &str, name: &str, uuid: &str) -> Self {
        Self {
            method: RestMethod::Delete,
            path: obj_type.object_path(uuid),
            obj_type,
            obj_name: name.to_string(),
            tenant: tenant.to_string(),
            uuid: Some(uuid.to_string()),
            body: None,
            response: None,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.response.is_some() && self.error.is_none()
    }
}

impl fmt::Display for RestOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}/{}", self.method, self.obj_type, self.tenant, self.obj_name)
    }
}

// =============================================================================
// Client trait
// =============================================================================

/// Connection to the remote controller
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Run one operation, returning the parsed response body
    async fn execute(&self, op: &RestOp) -> Result<Value, RemoteError>;

    /// GET an absolute API path (query string included)
    async fn get(&self, path: &str) -> Result<Value, RemoteError>;
}

/// Run `ops` in order on one client.
///
/// DELETE answered with 404 counts as success (the object is already gone).
/// After the first failure every remaining op is marked
/// [`RemoteError::Aborted`] without being sent. Returns whether every op
/// succeeded.
pub async fn execute_batch(client: &dyn RemoteClient, ops: &mut [RestOp]) -> bool {
    let mut failed = false;
    for op in ops.iter_mut() {
        if failed {
            op.error = Some(RemoteError::Aborted);
            continue;
        }
        let started = std::time::Instant::now();
        let result = client.execute(op).await;
        let result_label = match &result {
            Ok(_) => "success",
            Err(e) if op.method == RestMethod::Delete && e.is_not_found() => "gone",
            Err(_) => "error",
        };
        crate::apis::metrics::record_remote_op(
            op.method.as_str(),
            op.obj_type.api_name(),
            result_label,
            started.elapsed().as_secs_f64(),
        );

        match result {
            Ok(response) => {
                debug!("{} succeeded", op);
                op.response = Some(response);
            }
            Err(e) if op.method == RestMethod::Delete && e.is_not_found() => {
                debug!("{} found nothing to delete", op);
                op.response = Some(Value::Null);
            }
            Err(e) => {
                warn!("{} failed: {}", op, e);
                op.error = Some(e);
                failed = true;
            }
        }
    }
    !failed
}

/// Fetch every object of a type, following `next` links
pub async fn fetch_collection(
    client: &dyn RemoteClient,
    obj_type: ObjType,
    page_size: u32,
) -> Result<Vec<Value>, RemoteError> {
    let mut objects = Vec::new();
    let mut path = format!("{}?page=1&page_size={}", obj_type.collection_path(), page_size.max(1));
    loop {
        let page = client.get(&path).await?;
        let results = page
            .get("results")
            .and_then(Value::as_array)
            .ok_or_else(|| RemoteError::Malformed(format!("{} listing has no results", obj_type)))?;
        objects.extend(results.iter().cloned());

        match page.get("next").and_then(Value::as_str) {
            Some(next) if !next.is_empty() => {
                // next links may be absolute
                path = match next.find("/api/") {
                    Some(idx) => next[idx..].to_string(),
                    None => {
                        return Err(RemoteError::Malformed(format!(
                            "{} listing has unusable next link {}",
                            obj_type, next
                        )))
                    }
                };
            }
            _ => break,
        }
    }
    debug!("Fetched {} {} object(s)", objects.len(), obj_type);
    Ok(objects)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_uuid_ref_with_name() {
        let r = parse_ref("https://10.0.0.10/api/pool/pool-1234#web-pool").unwrap();
        assert_eq!(r.obj_type, Some(ObjType::Pool));
        assert_eq!(r.uuid.as_deref(), Some("pool-1234"));
        assert_eq!(r.name.as_deref(), Some("web-pool"));
    }

    #[test]
    fn test_parse_name_ref() {
        let r = parse_ref("/api/tenant/?name=admin").unwrap();
        assert_eq!(r.obj_type, None, "tenant is not a managed type");
        assert_eq!(r.uuid, None);
        assert_eq!(r.name.as_deref(), Some("admin"));
    }

    #[test]
    fn test_parse_bare_uuid_ref() {
        let r = parse_ref("/api/virtualservice/virtualservice-1").unwrap();
        assert_eq!(r.obj_type, Some(ObjType::VirtualService));
        assert_eq!(r.uuid.as_deref(), Some("virtualservice-1"));
        assert_eq!(r.name, None);
    }

    #[test]
    fn test_parse_garbage_ref() {
        assert!(parse_ref("not a ref").is_none());
        assert!(parse_ref("/api/pool/").is_none());
        assert!(parse_ref("/api/pool/?name=").is_none());
    }

    #[test]
    fn test_create_wraps_payload_in_macro_envelope() {
        let op = RestOp::create(ObjType::DataScript, "admin", "ds", json!({"name": "ds"}));
        assert_eq!(op.path, "/api/macro");
        let body = op.body.unwrap();
        assert_eq!(body["model_name"], "VSDataScriptSet");
        assert_eq!(body["data"]["name"], "ds");
    }

    #[test]
    fn test_obj_type_round_trips_through_api_name() {
        for t in ObjType::ALL {
            assert_eq!(t.api_name().parse::<ObjType>().unwrap(), t);
        }
    }

    // =========================================================================
    // Batch execution
    // =========================================================================

    #[tokio::test]
    async fn test_batch_aborts_after_first_failure() {
        let controller = InMemoryController::new("admin");
        controller.fail_next(RestMethod::Post, ObjType::PoolGroup, 503);

        let mut ops = vec![
            RestOp::create(ObjType::Pool, "admin", "p", json!({"name": "p", "created_by": "lbsync"})),
            RestOp::create(ObjType::PoolGroup, "admin", "pg", json!({"name": "pg", "created_by": "lbsync"})),
            RestOp::create(ObjType::Pool, "admin", "q", json!({"name": "q", "created_by": "lbsync"})),
        ];
        assert!(!execute_batch(&controller, &mut ops).await);

        assert!(ops[0].is_success(), "ops before the failure are kept");
        assert_eq!(ops[1].error.as_ref().and_then(RemoteError::code), Some(503));
        assert_eq!(ops[2].error, Some(RemoteError::Aborted));
        assert_eq!(controller.count(ObjType::Pool), 1, "aborted op was never sent");
    }

    #[tokio::test]
    async fn test_delete_of_missing_object_succeeds() {
        let controller = InMemoryController::new("admin");
        let mut ops = vec![RestOp::delete(ObjType::Pool, "admin", "gone", "pool-missing")];
        assert!(execute_batch(&controller, &mut ops).await);
        assert!(ops[0].is_success());
    }

    #[tokio::test]
    async fn test_fetch_collection_follows_pages() {
        let controller = InMemoryController::new("admin");
        for i in 0..5 {
            let name = format!("p{}", i);
            let op = RestOp::create(ObjType::Pool, "admin", &name, json!({"name": name}));
            controller.execute(&op).await.unwrap();
        }
        let pools = fetch_collection(&controller, ObjType::Pool, 2).await.unwrap();
        assert_eq!(pools.len(), 5);
    }
}
