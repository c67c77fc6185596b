//! In-process stand-in for the aria2 JSON-RPC endpoint.
//!
//! Mounted on a wiremock server, it answers the handful of methods the
//! scheduler uses. `addUri` writes the target file into the requested
//! directory so completed transfers can be finalized on disk.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// What `tellStatus` reports for a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Complete,
    /// Reported complete, but nothing is written to disk.
    CompleteWithoutFile,
    Error,
    Active,
}

#[derive(Debug)]
struct Transfer {
    url: String,
    dir: String,
}

#[derive(Debug)]
struct EngineState {
    default_outcome: Outcome,
    outcomes: HashMap<String, Outcome>,
    transfers: HashMap<String, Transfer>,
    calls: Vec<(String, Value)>,
    next_gid: u64,
    num_active: u64,
    reject_add_uri: bool,
    fail_status: bool,
}

/// Scriptable fake engine; clones share state.
#[derive(Debug, Clone)]
pub struct FakeEngine {
    state: Arc<Mutex<EngineState>>,
}

pub const SECRET: &str = "test-secret";

impl FakeEngine {
    pub fn new(default_outcome: Outcome) -> Self {
        Self {
            state: Arc::new(Mutex::new(EngineState {
                default_outcome,
                outcomes: HashMap::new(),
                transfers: HashMap::new(),
                calls: Vec::new(),
                next_gid: 1,
                num_active: 0,
                reject_add_uri: false,
                fail_status: false,
            })),
        }
    }

    /// Overrides the outcome for one source URL.
    pub fn with_outcome(self, url: &str, outcome: Outcome) -> Self {
        self.state
            .lock()
            .unwrap()
            .outcomes
            .insert(url.to_string(), outcome);
        self
    }

    /// Value reported as `numActive` by `getGlobalStat`.
    pub fn set_num_active(&self, num_active: u64) {
        self.state.lock().unwrap().num_active = num_active;
    }

    /// Makes every `addUri` answer with an RPC error.
    pub fn reject_add_uri(&self, reject: bool) {
        self.state.lock().unwrap().reject_add_uri = reject;
    }

    /// Makes every `tellStatus` answer with an RPC error.
    pub fn fail_status(&self, fail: bool) {
        self.state.lock().unwrap().fail_status = fail;
    }

    pub async fn mount(&self, server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/jsonrpc"))
            .respond_with(self.clone())
            .mount(server)
            .await;
    }

    /// Number of calls to `aria2.<name>`.
    pub fn call_count(&self, name: &str) -> usize {
        let full = format!("aria2.{name}");
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(m, _)| *m == full)
            .count()
    }

    /// Source URLs in `addUri` order.
    pub fn added_urls(&self) -> Vec<String> {
        self.add_uri_params()
            .iter()
            .filter_map(|params| params.get(1)?.get(0)?.as_str().map(str::to_string))
            .collect()
    }

    /// Full params of every `addUri` call.
    pub fn add_uri_params(&self) -> Vec<Value> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(m, _)| m == "aria2.addUri")
            .map(|(_, params)| params.clone())
            .collect()
    }

    /// Tokens seen as the first param of every call.
    pub fn tokens(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter_map(|(_, params)| params.get(0)?.as_str().map(str::to_string))
            .collect()
    }
}

fn ok(id: &Value, result: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

fn fault(id: &Value, code: i64, message: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message},
    }))
}

impl Respond for FakeEngine {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap_or(Value::Null);
        let id = body.get("id").cloned().unwrap_or(Value::Null);
        let method = body
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let params = body.get("params").cloned().unwrap_or_else(|| json!([]));

        let mut state = self.state.lock().unwrap();
        state.calls.push((method.clone(), params.clone()));

        match method.as_str() {
            "aria2.getVersion" => ok(&id, json!({"version": "1.37.0", "enabledFeatures": ["HTTPS"]})),
            "aria2.getGlobalStat" => ok(
                &id,
                json!({
                    "downloadSpeed": "2048",
                    "uploadSpeed": "0",
                    "numActive": state.num_active.to_string(),
                    "numWaiting": "0",
                    "numStopped": "0",
                    "numStoppedTotal": "0",
                }),
            ),
            "aria2.addUri" => {
                if state.reject_add_uri {
                    return fault(&id, 1, "addUri refused");
                }
                let url = params[1][0].as_str().unwrap_or_default().to_string();
                let dir = params[2]["dir"].as_str().unwrap_or_default().to_string();
                let out = params[2]["out"].as_str().unwrap_or_default().to_string();
                let outcome = state
                    .outcomes
                    .get(&url)
                    .copied()
                    .unwrap_or(state.default_outcome);
                if outcome == Outcome::Complete {
                    let target = PathBuf::from(&dir).join(&out);
                    fs::write(&target, format!("payload of {url}")).unwrap();
                }

                let gid = format!("{:016x}", state.next_gid);
                state.next_gid += 1;
                state.transfers.insert(gid.clone(), Transfer { url, dir });
                ok(&id, json!(gid))
            }
            "aria2.tellStatus" => {
                let gid = params[1].as_str().unwrap_or_default();
                if state.fail_status {
                    return fault(&id, 1, "engine unavailable");
                }
                let Some(transfer) = state.transfers.get(gid) else {
                    return fault(&id, 1, &format!("GID {gid} is not found"));
                };
                let outcome = state
                    .outcomes
                    .get(&transfer.url)
                    .copied()
                    .unwrap_or(state.default_outcome);
                let result = match outcome {
                    Outcome::Complete | Outcome::CompleteWithoutFile => json!({
                        "gid": gid,
                        "status": "complete",
                        "totalLength": "100",
                        "completedLength": "100",
                        "downloadSpeed": "0",
                        "dir": transfer.dir,
                    }),
                    Outcome::Error => json!({
                        "gid": gid,
                        "status": "error",
                        "totalLength": "0",
                        "completedLength": "0",
                        "downloadSpeed": "0",
                        "dir": transfer.dir,
                        "errorCode": "3",
                        "errorMessage": "Resource not found",
                    }),
                    Outcome::Active => json!({
                        "gid": gid,
                        "status": "active",
                        "totalLength": "100",
                        "completedLength": "42",
                        "downloadSpeed": "1024",
                        "dir": transfer.dir,
                    }),
                };
                ok(&id, result)
            }
            "aria2.remove" | "aria2.forceRemove" => {
                let gid = params[1].as_str().unwrap_or_default().to_string();
                ok(&id, json!(gid))
            }
            "aria2.removeDownloadResult" => {
                let gid = params[1].as_str().unwrap_or_default().to_string();
                state.transfers.remove(&gid);
                ok(&id, json!("OK"))
            }
            other => fault(&id, 1, &format!("No such method: {other}")),
        }
    }
}
