use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, duplex};
use uuid::Uuid;

use actprobe_core::rpc::{Params, Request, Response, RpcError, codes};
use actprobe_core::transport::LineTransport;
use actprobe_core::workflow::trn::action_trn;

/// Client side of a connection to a [`FakeActionService`].
pub type DuplexTransport = LineTransport<DuplexStream, DuplexStream>;

/// Connection handle layout used by the fake: `trn:authflow:{tenant}:connection/{provider}-{user_id}`.
pub fn connection_trn(tenant: &str, provider: &str, user_id: &str) -> String {
    format!("trn:authflow:{tenant}:connection/{provider}-{user_id}")
}

#[derive(Debug, Default)]
struct ServiceState {
    /// action trn -> config path
    actions: BTreeMap<String, String>,
    connections: Vec<String>,
    /// (tenant, action trn) -> auth trn
    bindings: BTreeMap<(String, String), String>,
    /// Oldest first.
    executions: Vec<Value>,
    calls: Vec<String>,
    fail_next: HashMap<String, VecDeque<RpcError>>,
    fail_always: HashMap<String, RpcError>,
}

/// In-memory stand-in for the action service.
///
/// Clones share state, so a test can keep one handle for assertions while
/// another serves a connection. State survives across connections, which
/// models a persistent backing database.
#[derive(Debug, Clone, Default)]
pub struct FakeActionService {
    state: Arc<Mutex<ServiceState>>,
}

impl FakeActionService {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().expect("fake service state poisoned")
    }

    /// Make the next call to `method` fail with `error`. Stacks.
    pub fn fail_next(&self, method: &str, error: RpcError) {
        self.lock()
            .fail_next
            .entry(method.to_string())
            .or_default()
            .push_back(error);
    }

    /// Make every call to `method` fail with `error`.
    pub fn fail_always(&self, method: &str, error: RpcError) {
        self.lock().fail_always.insert(method.to_string(), error);
    }

    /// Methods received so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn execution_count(&self) -> usize {
        self.lock().executions.len()
    }

    pub fn action_count(&self) -> usize {
        self.lock().actions.len()
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn has_action(&self, trn: &str) -> bool {
        self.lock().actions.contains_key(trn)
    }

    /// Pre-populate a connection handle, as if created in an earlier session.
    pub fn seed_connection(&self, trn: &str) {
        self.lock().connections.push(trn.to_string());
    }

    /// Answer one request.
    pub fn handle(&self, request: &Request) -> Response {
        let mut state = self.lock();
        state.calls.push(request.method.clone());

        let injected = state
            .fail_next
            .get_mut(&request.method)
            .and_then(VecDeque::pop_front)
            .or_else(|| state.fail_always.get(&request.method).cloned());
        if let Some(error) = injected {
            return Response::failure(request.id, error);
        }

        match dispatch(&mut state, &request.method, request.params.as_ref()) {
            Ok(result) => Response::success(request.id, result),
            Err(error) => Response::failure(request.id, error),
        }
    }

    /// Serve a fresh connection on a background task and return the
    /// harness end.
    pub fn connect(&self) -> DuplexTransport {
        let (client_w, server_r) = duplex(64 * 1024);
        let (server_w, client_r) = duplex(64 * 1024);
        tokio::spawn(self.clone().serve(server_r, server_w));
        LineTransport::new(client_w, client_r)
    }

    /// Read request lines until EOF, writing one response line for each.
    pub async fn serve<R, W>(self, reader: R, mut writer: W)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            let out = match Request::decode(&line) {
                Ok(request) => match self.handle(&request).encode() {
                    Ok(encoded) => encoded,
                    Err(_) => break,
                },
                Err(_) => {
                    r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"Parse error"}}"#
                        .to_string()
                }
            };
            if writer.write_all(out.as_bytes()).await.is_err()
                || writer.write_all(b"\n").await.is_err()
                || writer.flush().await.is_err()
            {
                break;
            }
        }
    }
}

fn required<'a>(params: Option<&'a Params>, key: &str) -> Result<&'a str, RpcError> {
    let params = params.ok_or_else(|| RpcError::new(codes::INVALID_PARAMS, "Missing parameters"))?;
    params.get(key).and_then(Value::as_str).ok_or_else(|| {
        RpcError::new(
            codes::INVALID_PARAMS,
            format!("Missing required parameter: {key}"),
        )
    })
}

fn optional_u64(params: Option<&Params>, key: &str) -> Option<u64> {
    params.and_then(|p| p.get(key)).and_then(Value::as_u64)
}

fn dispatch(state: &mut ServiceState, method: &str, params: Option<&Params>) -> Result<Value, RpcError> {
    let now = chrono::Utc::now().to_rfc3339();
    match method {
        "health" => Ok(json!({ "status": "healthy", "timestamp": now })),
        "status" => Ok(json!({
            "status": "running",
            "interface": "stdio-rpc",
            "stats": { "auth_connections": state.connections.len() },
            "timestamp": now,
        })),
        "doctor" => Ok(json!({ "status": "healthy", "issues": [], "suggestions": [], "timestamp": now })),

        "action.register" => {
            let config_path = required(params, "config_path")?;
            let tenant = required(params, "tenant")?;
            let provider = required(params, "provider")?;
            let name = required(params, "name")?;
            let trn = action_trn(tenant, provider, name);
            if state.actions.contains_key(&trn) {
                return Err(RpcError::new(
                    codes::INTERNAL_ERROR,
                    "Failed to register action: UNIQUE constraint failed: actions.trn",
                ));
            }
            state.actions.insert(trn.clone(), config_path.to_string());
            Ok(json!({ "action_trn": trn }))
        }
        "action.update" => {
            let trn = required(params, "trn")?;
            let config_path = required(params, "config_path")?;
            match state.actions.get_mut(trn) {
                Some(path) => {
                    *path = config_path.to_string();
                    Ok(json!({ "updated_action": { "trn": trn, "config_path": config_path } }))
                }
                None => Err(RpcError::new(
                    codes::INTERNAL_ERROR,
                    format!("Failed to update action: action {trn} not found"),
                )),
            }
        }
        "action.delete" => {
            let trn = required(params, "trn")?;
            if state.actions.remove(trn).is_some() {
                state.bindings.retain(|(_, action), _| action != trn);
                Ok(json!({ "deleted": true }))
            } else {
                Err(RpcError::new(codes::NOT_FOUND_ERROR, "Action not found"))
            }
        }

        "auth.pat" => {
            let tenant = required(params, "tenant")?;
            let provider = required(params, "provider")?;
            let user_id = required(params, "user_id")?;
            required(params, "access_token")?;
            let trn = connection_trn(tenant, provider, user_id);
            if state.connections.contains(&trn) {
                return Err(RpcError::new(
                    codes::AUTH_ERROR,
                    "Failed to create PAT connection: UNIQUE constraint failed: auth_connections.trn",
                ));
            }
            state.connections.push(trn.clone());
            Ok(json!({ "connection_trn": trn }))
        }
        "auth.list" => Ok(json!({ "connections": state.connections })),

        "binding.create" => {
            let tenant = required(params, "tenant")?;
            let action = required(params, "action_trn")?;
            let auth = required(params, "auth_trn")?;
            let key = (tenant.to_string(), action.to_string());
            if state.bindings.contains_key(&key) {
                return Err(RpcError::new(
                    codes::INTERNAL_ERROR,
                    "Failed to create binding: UNIQUE constraint failed: bindings.tenant, bindings.action_trn",
                ));
            }
            state.bindings.insert(key, auth.to_string());
            Ok(json!({ "binding_trn": format!("trn:openact:{tenant}:binding:{auth}:{action}") }))
        }
        "binding.get" => {
            let tenant = required(params, "tenant")?;
            let action = required(params, "action_trn")?;
            match state.bindings.get(&(tenant.to_string(), action.to_string())) {
                Some(auth) => Ok(json!({
                    "binding": { "tenant": tenant, "action_trn": action, "auth_trn": auth }
                })),
                None => Err(RpcError::new(codes::NOT_FOUND_ERROR, "Binding not found")),
            }
        }

        "run" => {
            let tenant = required(params, "tenant")?;
            let action = required(params, "action_trn")?;
            if !state.actions.contains_key(action) {
                return Err(RpcError::new(
                    codes::EXECUTION_ERROR,
                    format!("Failed to execute action: action {action} not found"),
                ));
            }
            if !state.bindings.contains_key(&(tenant.to_string(), action.to_string())) {
                return Err(RpcError::new(
                    codes::EXECUTION_ERROR,
                    format!("Failed to execute action: no auth binding for {action}"),
                ));
            }
            let execution_trn = format!("trn:openact:{tenant}:execution:{}", Uuid::new_v4());
            state.executions.push(json!({
                "execution_trn": execution_trn,
                "action_trn": action,
                "tenant": tenant,
                "status": "completed",
                "created_at": now,
            }));
            Ok(json!({
                "ok": true,
                "data": {
                    "execution_trn": execution_trn,
                    "status": "completed",
                    "status_code": 200,
                    "duration_ms": 1,
                }
            }))
        }
        "execution.get" => {
            let trn = required(params, "execution_trn")?;
            state
                .executions
                .iter()
                .find(|e| e["execution_trn"] == trn)
                .map(|e| json!({ "ok": true, "data": { "execution": e } }))
                .ok_or_else(|| {
                    RpcError::new(codes::NOT_FOUND_ERROR, format!("Execution not found: {trn}"))
                })
        }
        "execution.list" => {
            let tenant = params
                .and_then(|p| p.get("tenant"))
                .and_then(Value::as_str)
                .unwrap_or("default");
            let limit = optional_u64(params, "limit").unwrap_or(u64::MAX) as usize;
            let offset = optional_u64(params, "offset").unwrap_or(0) as usize;
            let page: Vec<Value> = state
                .executions
                .iter()
                .rev()
                .filter(|e| e["tenant"] == tenant)
                .skip(offset)
                .take(limit)
                .cloned()
                .collect();
            Ok(json!({ "ok": true, "data": { "count": page.len(), "executions": page } }))
        }

        other => Err(RpcError::new(
            codes::METHOD_NOT_FOUND,
            format!("Method '{other}' not found"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actprobe_core::rpc;

    fn req(method: &str, id: u64, params: Value) -> Request {
        Request::new(method, id, Some(rpc::params(params)))
    }

    #[test]
    fn second_registration_conflicts() {
        let svc = FakeActionService::new();
        let params = json!({"config_path": "a.yaml", "tenant": "t", "provider": "p", "name": "n"});
        assert!(svc.handle(&req("action.register", 1, params.clone())).is_success());
        let second = svc.handle(&req("action.register", 2, params));
        assert!(second.error().unwrap().message.contains("UNIQUE constraint failed"));
        assert_eq!(svc.action_count(), 1);
    }

    #[test]
    fn injected_failure_applies_once() {
        let svc = FakeActionService::new();
        svc.fail_next("health", RpcError::new(codes::INTERNAL_ERROR, "starting"));
        assert!(!svc.handle(&Request::new("health", 1, None)).is_success());
        assert!(svc.handle(&Request::new("health", 2, None)).is_success());
    }

    #[test]
    fn execution_list_pages_newest_first() {
        let svc = FakeActionService::new();
        {
            let mut state = svc.lock();
            for i in 0..3 {
                state.executions.push(json!({"execution_trn": format!("e{i}"), "tenant": "t"}));
            }
        }
        let resp = svc.handle(&req("execution.list", 1, json!({"tenant": "t", "limit": 2, "offset": 0})));
        let data = &resp.result().unwrap()["data"];
        assert_eq!(data["count"], 2);
        assert_eq!(data["executions"][0]["execution_trn"], "e2");
    }
}
