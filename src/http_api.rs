use std::{convert::Infallible, net::SocketAddr, sync::Arc, thread};

use anyhow::{Context, Result};
use http_body_util::{BodyExt, Full};
use hyper::{
    HeaderMap, Method, Request, Response, StatusCode,
    body::{Bytes, Incoming},
    header::CONTENT_TYPE,
    server::conn::http1::Builder as Http1Builder,
    service::service_fn,
};
use hyper_util::rt::tokio::TokioIo;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::{net::TcpListener, runtime::Builder, sync::oneshot};

use crate::console::Console;
use crate::error::ConsoleError;
use crate::model::{Actor, Role};
use crate::operator_log;
use crate::store::EntityKind;

pub const USER_HEADER: &str = "x-console-user";
pub const USER_NAME_HEADER: &str = "x-console-user-name";
pub const ROLE_HEADER: &str = "x-console-role";

#[derive(Clone)]
pub struct ConsoleApiConfig {
    pub bind_addr: SocketAddr,
    pub console: Arc<Console>,
}

pub struct ConsoleApiServer {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<thread::JoinHandle<Result<()>>>,
}

impl ConsoleApiServer {
    pub fn start(config: ConsoleApiConfig) -> Result<Self> {
        let listener = std::net::TcpListener::bind(config.bind_addr)
            .with_context(|| format!("failed to bind console api on {}", config.bind_addr))?;
        listener
            .set_nonblocking(true)
            .context("failed to configure console api listener")?;
        let local_addr = listener
            .local_addr()
            .context("failed to read console api address")?;
        let state = Arc::new(ApiState {
            console: config.console,
        });
        let (tx, rx) = oneshot::channel();
        let handle = thread::Builder::new()
            .name("console-api".to_string())
            .spawn(move || -> Result<()> {
                let runtime = Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context("failed to create console api runtime")?;
                runtime.block_on(async move {
                    let listener = TcpListener::from_std(listener)
                        .context("failed to register console api listener")?;
                    operator_log::info(
                        module_path!(),
                        format!("console api listening on http://{local_addr}"),
                    );
                    let mut shutdown = rx;
                    loop {
                        tokio::select! {
                            _ = &mut shutdown => break,
                            accept = listener.accept() => match accept {
                                Ok((stream, _peer)) => {
                                    let connection_state = state.clone();
                                    tokio::spawn(async move {
                                        let service = service_fn(move |req| {
                                            handle_request(req, connection_state.clone())
                                        });
                                        let stream = TokioIo::new(stream);
                                        if let Err(err) = Http1Builder::new()
                                            .serve_connection(stream, service)
                                            .await
                                        {
                                            operator_log::error(
                                                module_path!(),
                                                format!("console api connection error: {err}"),
                                            );
                                        }
                                    });
                                }
                                Err(err) => {
                                    operator_log::error(
                                        module_path!(),
                                        format!("console api accept error: {err}"),
                                    );
                                }
                            },
                        }
                    }
                    state.console.pairing.cancel();
                    Ok(())
                })
            })?;
        Ok(Self {
            local_addr,
            shutdown: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let joined = handle
                .join()
                .map_err(|err| anyhow::anyhow!("console api panicked: {err:?}"))?;
            joined?;
        }
        Ok(())
    }
}

struct ApiState {
    console: Arc<Console>,
}

type ApiResponse = Response<Full<Bytes>>;

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ApiState>,
) -> Result<ApiResponse, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let response = match handle_request_inner(req, state).await {
        Ok(response) => response,
        Err(response) => response,
    };
    operator_log::debug(
        module_path!(),
        format!(
            "console api method={method} path={path} status={}",
            response.status().as_u16()
        ),
    );
    Ok(response)
}

#[derive(Debug, PartialEq, Eq)]
enum Route {
    Instances,
    Instance(String),
    InstancePairing(String),
    Pairing,
    License,
    Config,
    Entities(EntityKind),
}

fn parse_route(path: &str) -> Option<Route> {
    let segments = path
        .trim_start_matches('/')
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>();
    match segments.as_slice() {
        ["v1", "instances"] => Some(Route::Instances),
        ["v1", "instances", id] => Some(Route::Instance((*id).to_string())),
        ["v1", "instances", id, "pairing"] => Some(Route::InstancePairing((*id).to_string())),
        ["v1", "pairing"] => Some(Route::Pairing),
        ["v1", "license"] => Some(Route::License),
        ["v1", "config"] => Some(Route::Config),
        ["v1", "entities", kind] => EntityKind::parse(kind).map(Route::Entities),
        _ => None,
    }
}

#[derive(Deserialize)]
struct CreateInstanceBody {
    name: String,
}

async fn handle_request_inner(
    req: Request<Incoming>,
    state: Arc<ApiState>,
) -> Result<ApiResponse, ApiResponse> {
    let route = parse_route(req.uri().path())
        .ok_or_else(|| error_response(StatusCode::NOT_FOUND, "not_found", "unknown route"))?;
    let method = req.method().clone();
    let actor = actor_from_headers(req.headers())?;
    let console = &state.console;

    match (method, route) {
        (Method::GET, Route::Instances) => {
            let instances = console.instances.list(&actor).await.map_err(console_error)?;
            Ok(json_response(StatusCode::OK, json!({ "instances": instances })))
        }
        (Method::POST, Route::Instances) => {
            let body: CreateInstanceBody = read_json(req).await?;
            let instance = console
                .instances
                .create(&body.name, &actor)
                .await
                .map_err(console_error)?;
            Ok(json_response(StatusCode::CREATED, json!({ "instance": instance })))
        }
        (Method::DELETE, Route::Instance(key)) => {
            let instance = console
                .instances
                .find_any(&key)
                .await
                .map_err(console_error)?;
            console
                .instances
                .delete(&instance, &actor)
                .await
                .map_err(console_error)?;
            Ok(json_response(StatusCode::OK, json!({ "success": true })))
        }
        (Method::POST, Route::InstancePairing(key)) => {
            let instance = console
                .instances
                .find_any(&key)
                .await
                .map_err(console_error)?;
            let session = console.pairing.open(&instance, &actor);
            Ok(json_response(
                StatusCode::ACCEPTED,
                json!({
                    "instanceId": session.instance_id(),
                    "generation": session.generation(),
                    "phase": session.phase(),
                }),
            ))
        }
        (Method::GET, Route::Pairing) => match console.pairing.current() {
            Some((instance_id, phase)) => Ok(json_response(
                StatusCode::OK,
                json!({ "instanceId": instance_id, "phase": phase }),
            )),
            None => Err(error_response(
                StatusCode::NOT_FOUND,
                "not_found",
                "no pairing session",
            )),
        },
        (Method::DELETE, Route::Pairing) => {
            let cancelled = console.pairing.cancel();
            Ok(json_response(StatusCode::OK, json!({ "cancelled": cancelled })))
        }
        (Method::GET, Route::License) => {
            let status = console.license.status().await.map_err(console_error)?;
            Ok(json_response(StatusCode::OK, json!(status)))
        }
        (Method::GET, Route::Config) => {
            let config = console.config.get();
            let mut value = json!(config);
            redact_keys(&mut value);
            Ok(json_response(StatusCode::OK, value))
        }
        (Method::GET, Route::Entities(kind)) => {
            let records = console
                .entities
                .list_json(kind)
                .await
                .map_err(console_error)?;
            let mut body = serde_json::Map::new();
            body.insert(kind.key().to_string(), Value::Array(records));
            Ok(json_response(StatusCode::OK, Value::Object(body)))
        }
        _ => Err(error_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "method_not_allowed",
            "method not allowed for this route",
        )),
    }
}

fn actor_from_headers(headers: &HeaderMap) -> Result<Actor, ApiResponse> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };
    let user_id = header(USER_HEADER).ok_or_else(|| {
        error_response(
            StatusCode::UNAUTHORIZED,
            "unauthenticated",
            format!("missing {USER_HEADER} header"),
        )
    })?;
    let role = match header(ROLE_HEADER) {
        Some(value) => value
            .parse::<Role>()
            .map_err(|err| error_response(StatusCode::BAD_REQUEST, "validation", err))?,
        None => Role::Agent,
    };
    let name = header(USER_NAME_HEADER).unwrap_or(user_id);
    Ok(Actor::new(user_id, name, role))
}

async fn read_json<T: serde::de::DeserializeOwned>(
    req: Request<Incoming>,
) -> Result<T, ApiResponse> {
    let bytes = req
        .into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|err| error_response(StatusCode::BAD_REQUEST, "validation", err.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|err| {
        error_response(
            StatusCode::BAD_REQUEST,
            "validation",
            format!("invalid json body: {err}"),
        )
    })
}

/// Never hand API keys to the UI layer.
fn redact_keys(value: &mut Value) {
    for section in ["gateway", "database"] {
        if let Some(key) = value
            .get_mut(section)
            .and_then(|section| section.get_mut("api_key"))
            && key.as_str().is_some_and(|key| !key.is_empty())
        {
            *key = json!("********");
        }
    }
}

fn status_for(err: &ConsoleError) -> StatusCode {
    match err {
        ConsoleError::Transport(_) => StatusCode::BAD_GATEWAY,
        ConsoleError::Validation(_) => StatusCode::BAD_REQUEST,
        ConsoleError::QuotaExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
        ConsoleError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        ConsoleError::NotFound(_) => StatusCode::NOT_FOUND,
        ConsoleError::PairingAborted(_) => StatusCode::CONFLICT,
        ConsoleError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn console_error(err: ConsoleError) -> ApiResponse {
    let mut body = json!({
        "success": false,
        "code": err.code(),
        "message": err.to_string(),
    });
    if let ConsoleError::QuotaExceeded { limit } = &err {
        body["limit"] = json!(limit);
    }
    json_response(status_for(&err), body)
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> ApiResponse {
    let body = json!({
        "success": false,
        "code": code,
        "message": message.into()
    });
    json_response(status, body)
}

fn json_response(status: StatusCode, value: Value) -> ApiResponse {
    let body = serde_json::to_string(&value).unwrap_or_else(|_| "{}".to_string());
    let mut response = Response::new(Full::from(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}
