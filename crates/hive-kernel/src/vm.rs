//! One sandboxed JavaScript runtime per workspace.
//!
//! The `JsRuntime` is not `Send`, so every VM owns a dedicated OS thread that
//! builds the runtime, loads the workspace code and then serves invocations
//! one at a time from a channel. [`Vm`] is the cheap, shareable handle to that
//! thread; dropping the last handle closes the channel and the thread exits.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use deno_core::{serde_v8, v8, JsRuntime, ModuleCodeString, RuntimeOptions};
use hive_db::WorkspaceDb;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::{
    runtime::Handle,
    sync::{mpsc, oneshot},
};
use tracing::{debug, info, instrument, warn};

use crate::{
    bridge::{self, DataBridge},
    content_hash,
    router::{normalize_path, PathParams, RouteKey, RouteTable},
    short_id, DEFAULT_CODE_SIZE_LIMIT, DEFAULT_EXEC_TIMEOUT, DEFAULT_LOAD_TIMEOUT,
};

#[derive(Debug, Error)]
pub enum VmError {
    #[error("vm: code size {size} bytes exceeds limit of {limit} bytes")]
    CodeTooLarge { size: usize, limit: usize },
    #[error("vm: load failed: {0}")]
    Load(String),
    #[error("vm: load timeout after {0:?}")]
    LoadTimeout(Duration),
    #[error("vm: ambiguous routes {first:?} and {second:?} can match the same path")]
    AmbiguousRoutes { first: String, second: String },
    #[error("vm: execution timeout after {0:?}")]
    ExecTimeout(Duration),
    #[error("vm: handler {route:?} failed: {message}")]
    Handler { route: String, message: String },
    #[error("vm: encode request: {0}")]
    Request(#[source] serde_json::Error),
    #[error("vm: runtime thread for workspace {0} is gone")]
    Closed(String),
    #[error("vm: spawn runtime thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Size and wall-clock budgets applied to one VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmLimits {
    pub load_timeout: Duration,
    pub exec_timeout: Duration,
    pub max_code_size: usize,
}

impl Default for VmLimits {
    fn default() -> Self {
        Self {
            load_timeout: DEFAULT_LOAD_TIMEOUT,
            exec_timeout: DEFAULT_EXEC_TIMEOUT,
            max_code_size: DEFAULT_CODE_SIZE_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmUser {
    pub id: String,
    pub email: String,
    pub name: String,
}

/// The request record handed to a route handler as its single argument.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub params: PathParams,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub user: Option<VmUser>,
}

impl VmRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmResponse {
    pub status: u16,
    pub body: Value,
}

impl VmResponse {
    fn not_found(method: &str, path: &str) -> Self {
        Self {
            status: 404,
            body: json!({ "error": format!("no route matches {method} {path}") }),
        }
    }
}

fn status_code(value: &Value) -> Option<u16> {
    let code = match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) => i,
            None => {
                let f = n.as_f64()?;
                if f.fract() != 0.0 {
                    return None;
                }
                f as i64
            }
        },
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    u16::try_from(code).ok().filter(|c| (100..=999).contains(c))
}

/// Turns a handler's return value into a response.
///
/// `null` gives an empty 200. An object with an integer-coercible `status`
/// uses it, taking `body` when present and otherwise the object minus
/// `status`. Anything else is a 200 with the value as body.
pub fn shape_response(value: Value) -> VmResponse {
    match value {
        Value::Null => VmResponse {
            status: 200,
            body: Value::Null,
        },
        Value::Object(mut map) => match map.get("status").and_then(status_code) {
            Some(status) => {
                let body = match map.remove("body") {
                    Some(body) => body,
                    None => {
                        map.remove("status");
                        Value::Object(map)
                    }
                };
                VmResponse { status, body }
            }
            None => VmResponse {
                status: 200,
                body: Value::Object(map),
            },
        },
        other => VmResponse {
            status: 200,
            body: other,
        },
    }
}

enum Command {
    Invoke {
        route: String,
        ctx: Value,
        reply: oneshot::Sender<Result<Value, VmError>>,
    },
}

/// Handle to a loaded workspace VM. Immutable once built.
#[derive(Debug)]
pub struct Vm {
    workspace_id: String,
    code_hash: String,
    created_at: Instant,
    routes: RouteTable,
    commands: mpsc::UnboundedSender<Command>,
}

impl Vm {
    /// Builds a VM for `source`, failing on oversize code, load errors, load
    /// timeout or ambiguous routes. Must be called from within a tokio runtime.
    #[instrument(skip(source, db, limits), fields(workspace = %short_id(workspace_id), size = source.len()))]
    pub async fn spawn(
        workspace_id: &str,
        source: String,
        db: WorkspaceDb,
        limits: VmLimits,
    ) -> Result<Self, VmError> {
        if source.len() > limits.max_code_size {
            return Err(VmError::CodeTooLarge {
                size: source.len(),
                limit: limits.max_code_size,
            });
        }

        let started = Instant::now();
        let code_hash = content_hash(&source);
        let rt = Handle::current();
        let (commands, inbox) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let owner = workspace_id.to_string();
        thread::Builder::new()
            .name(format!("hive-vm-{}", short_id(workspace_id)))
            .spawn(move || {
                let _enter = rt.enter();
                match VmActor::boot(owner, &source, db, limits, rt.clone()) {
                    Ok((actor, routes)) => {
                        if ready_tx.send(Ok(routes)).is_ok() {
                            actor.run(inbox);
                        }
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                    }
                }
            })
            .map_err(VmError::Spawn)?;

        let routes = ready_rx
            .await
            .map_err(|_| VmError::Closed(workspace_id.to_string()))??;

        info!(
            workspace = %short_id(workspace_id),
            routes = routes.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "vm loaded"
        );
        Ok(Self {
            workspace_id: workspace_id.to_string(),
            code_hash,
            created_at: Instant::now(),
            routes,
            commands,
        })
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    /// Hex SHA-256 of the source this VM was built from.
    pub fn code_hash(&self) -> &str {
        &self.code_hash
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Declared route keys, order unspecified.
    pub fn routes(&self) -> Vec<String> {
        self.routes.keys()
    }

    /// Dispatches one request. A route miss is a 404 response, not an error.
    pub async fn handle(&self, mut request: VmRequest) -> Result<VmResponse, VmError> {
        let method = request.method.to_ascii_uppercase();
        let path = normalize_path(&request.path);
        let Some((route, params)) = self.routes.resolve(&method, &path) else {
            debug!(workspace = %short_id(&self.workspace_id), %method, %path, "no route");
            return Ok(VmResponse::not_found(&method, &path));
        };

        request.method = method;
        request.params.extend(params);
        let ctx = serde_json::to_value(&request).map_err(VmError::Request)?;

        let started = Instant::now();
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Invoke {
                route: route.clone(),
                ctx,
                reply,
            })
            .map_err(|_| VmError::Closed(self.workspace_id.clone()))?;
        let outcome = response
            .await
            .map_err(|_| VmError::Closed(self.workspace_id.clone()))?;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(value) => {
                let response = shape_response(value);
                debug!(workspace = %short_id(&self.workspace_id), %route, status = response.status, elapsed_ms, "handled");
                Ok(response)
            }
            Err(err) => {
                warn!(workspace = %short_id(&self.workspace_id), %route, elapsed_ms, error = %err, "handler failed");
                Err(err)
            }
        }
    }
}

/// Owner of the JS runtime, living on the VM thread.
struct VmActor {
    // Globals must be released before the isolate they belong to.
    handlers: HashMap<String, v8::Global<v8::Function>>,
    runtime: JsRuntime,
    workspace_id: String,
    limits: VmLimits,
    rt: Handle,
}

impl VmActor {
    fn boot(
        workspace_id: String,
        source: &str,
        db: WorkspaceDb,
        limits: VmLimits,
        rt: Handle,
    ) -> Result<(Self, RouteTable), VmError> {
        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![bridge::extension()],
            ..Default::default()
        });
        runtime
            .op_state()
            .borrow_mut()
            .put(DataBridge::new(workspace_id.clone(), db, rt.clone()));
        runtime
            .execute_script(
                "hive:bootstrap",
                ModuleCodeString::from(bridge::BOOTSTRAP_JS.to_string()),
            )
            .map_err(|err| VmError::Load(format!("bootstrap: {err}")))?;

        let source = ModuleCodeString::from(source.to_string());
        let (loaded, timed_out) = with_deadline(&mut runtime, &rt, limits.load_timeout, |runtime| {
            runtime
                .execute_script("workspace.js", source)
                .map_err(|err| err.to_string())?;
            extract_routes(runtime)
        });
        let declared = match loaded {
            Ok(declared) => declared,
            Err(_) if timed_out => return Err(VmError::LoadTimeout(limits.load_timeout)),
            Err(message) => return Err(VmError::Load(message)),
        };

        let mut handlers = HashMap::with_capacity(declared.len());
        let mut keys = Vec::with_capacity(declared.len());
        for (raw, handler) in declared {
            let Some(key) = RouteKey::parse(&raw) else {
                warn!(workspace = %short_id(&workspace_id), route = %raw, "ignoring malformed route key");
                continue;
            };
            if handlers.insert(key.to_string(), handler).is_some() {
                warn!(workspace = %short_id(&workspace_id), route = %key, "duplicate route after normalisation; keeping the last");
            }
            keys.push(key);
        }
        let routes = RouteTable::build(keys).map_err(|ambiguity| VmError::AmbiguousRoutes {
            first: ambiguity.first,
            second: ambiguity.second,
        })?;

        Ok((
            Self {
                handlers,
                runtime,
                workspace_id,
                limits,
                rt,
            },
            routes,
        ))
    }

    fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = inbox.blocking_recv() {
            match command {
                Command::Invoke { route, ctx, reply } => {
                    let outcome = self.invoke(&route, &ctx);
                    let _ = reply.send(outcome);
                }
            }
        }
        debug!(workspace = %short_id(&self.workspace_id), "vm thread exiting");
    }

    fn invoke(&mut self, route: &str, ctx: &Value) -> Result<Value, VmError> {
        let Some(handler) = self.handlers.get(route) else {
            return Err(VmError::Handler {
                route: route.to_string(),
                message: "no handler registered".into(),
            });
        };
        let budget = self.limits.exec_timeout;
        let (outcome, timed_out) = with_deadline(&mut self.runtime, &self.rt, budget, |runtime| {
            call_handler(runtime, handler, ctx)
        });
        match outcome {
            Ok(value) => Ok(value),
            Err(_) if timed_out => Err(VmError::ExecTimeout(budget)),
            Err(message) => Err(VmError::Handler {
                route: route.to_string(),
                message,
            }),
        }
    }
}

/// Runs `f` while a watchdog on the tokio runtime waits out `budget` and then
/// terminates the isolate. Returns whether the watchdog fired.
fn with_deadline<T>(
    runtime: &mut JsRuntime,
    rt: &Handle,
    budget: Duration,
    f: impl FnOnce(&mut JsRuntime) -> T,
) -> (T, bool) {
    let armed = Arc::new(Mutex::new(true));
    let isolate = runtime.v8_isolate().thread_safe_handle();
    let watchdog = {
        let armed = Arc::clone(&armed);
        rt.spawn(async move {
            tokio::time::sleep(budget).await;
            let mut armed = armed.lock();
            if *armed {
                *armed = false;
                isolate.terminate_execution();
            }
        })
    };

    let out = f(runtime);

    let fired = {
        let mut armed = armed.lock();
        let fired = !*armed;
        *armed = false;
        fired
    };
    watchdog.abort();
    if fired {
        runtime.v8_isolate().cancel_terminate_execution();
    }
    (out, fired)
}

fn extract_routes(runtime: &mut JsRuntime) -> Result<Vec<(String, v8::Global<v8::Function>)>, String> {
    let result = runtime
        .execute_script(
            "hive:routes",
            ModuleCodeString::from(bridge::ROUTES_JS.to_string()),
        )
        .map_err(|err| err.to_string())?;

    let scope = &mut runtime.handle_scope();
    let local = v8::Local::new(scope, result);
    let array = v8::Local::<v8::Array>::try_from(local)
        .map_err(|_| "route extraction did not return an array".to_string())?;

    let mut declared = Vec::with_capacity(array.length() as usize);
    for index in 0..array.length() {
        let Some(pair) = array.get_index(scope, index) else {
            continue;
        };
        let Ok(pair) = v8::Local::<v8::Array>::try_from(pair) else {
            continue;
        };
        let (Some(key), Some(handler)) = (pair.get_index(scope, 0), pair.get_index(scope, 1)) else {
            continue;
        };
        let Ok(handler) = v8::Local::<v8::Function>::try_from(handler) else {
            continue;
        };
        let key = key.to_rust_string_lossy(scope);
        declared.push((key, v8::Global::new(scope, handler)));
    }
    Ok(declared)
}

fn call_handler(
    runtime: &mut JsRuntime,
    handler: &v8::Global<v8::Function>,
    ctx: &Value,
) -> Result<Value, String> {
    let scope = &mut runtime.handle_scope();
    let function = v8::Local::new(scope, handler);
    let arg = serde_v8::to_v8(scope, ctx).map_err(|err| format!("encode request: {err}"))?;
    let receiver: v8::Local<v8::Value> = v8::undefined(scope).into();

    let scope = &mut v8::TryCatch::new(scope);
    match function.call(scope, receiver, &[arg]) {
        Some(result) if result.is_promise() => Err("async handlers are not supported".into()),
        Some(result) => serde_v8::from_v8::<Value>(scope, result)
            .map_err(|err| format!("decode return value: {err}")),
        None if scope.has_terminated() => Err("execution terminated".into()),
        None => Err(scope
            .exception()
            .map(|exception| exception.to_rust_string_lossy(scope))
            .unwrap_or_else(|| "unknown exception".into())),
    }
}
