use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::StreamExt;
use log::{debug, warn};
use uuid::Uuid;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{reply, Filter, Rejection, Reply};

use super::terminal_socket;
use super::types::{
    execution_error, history_error, ApiError, CommandBody, HealthResponse, HistoryQuery,
    ScriptBody, TerminalQuery,
};
use crate::context::AppContext;
use crate::execution::{ExecutionEvent, ExecutionRequest};

const MAX_BODY_BYTES: u64 = 1024 * 1024;

fn with_context(
    ctx: Arc<AppContext>,
) -> impl Filter<Extract = (Arc<AppContext>,), Error = Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

fn json_body<T: serde::de::DeserializeOwned + Send>(
) -> impl Filter<Extract = (T,), Error = Rejection> + Clone {
    warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::json())
}

fn error_reply(status: StatusCode, body: ApiError) -> Response {
    reply::with_status(reply::json(&body), status).into_response()
}

async fn run_request(
    ctx: Arc<AppContext>,
    request: Result<ExecutionRequest, crate::error_handling::types::ExecutionError>,
) -> Result<Response, Rejection> {
    let outcome = match request {
        Ok(request) => ctx.dispatcher.execute(request).await,
        Err(e) => Err(e),
    };
    match outcome {
        Ok(result) => Ok(reply::with_status(reply::json(&result), StatusCode::OK).into_response()),
        Err(e) => {
            let (status, body) = execution_error(&e);
            Ok(error_reply(status, body))
        }
    }
}

/// POST /commands/execute
pub fn execute_command_route(
    ctx: Arc<AppContext>,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path!("commands" / "execute")
        .and(warp::post())
        .and(json_body::<CommandBody>())
        .and(with_context(ctx))
        .and_then(|body: CommandBody, ctx: Arc<AppContext>| async move {
            run_request(ctx, body.into_request()).await
        })
}

/// POST /bash-scripts/execute
pub fn execute_script_route(
    ctx: Arc<AppContext>,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path!("bash-scripts" / "execute")
        .and(warp::post())
        .and(json_body::<ScriptBody>())
        .and(with_context(ctx))
        .and_then(|body: ScriptBody, ctx: Arc<AppContext>| async move {
            run_request(ctx, body.into_request()).await
        })
}

fn sse_event(event: ExecutionEvent) -> Result<warp::sse::Event, Infallible> {
    let name = event.name();
    Ok(warp::sse::Event::default()
        .event(name)
        .json_data(&event)
        .unwrap_or_else(|e| {
            warn!("Failed to encode {} event: {}", name, e);
            warp::sse::Event::default().event("error").data("event encoding failed")
        }))
}

/// POST /bash-scripts/execute/stream
///
/// Server-sent events named after each [`ExecutionEvent`]; the stream ends
/// after the `result` or `error` event.
pub fn execute_script_stream_route(
    ctx: Arc<AppContext>,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path!("bash-scripts" / "execute" / "stream")
        .and(warp::post())
        .and(json_body::<ScriptBody>())
        .and(with_context(ctx))
        .and_then(|body: ScriptBody, ctx: Arc<AppContext>| async move {
            let request = match body.into_request() {
                Ok(r) => r,
                Err(e) => {
                    let (status, body) = execution_error(&e);
                    return Ok::<_, Rejection>(error_reply(status, body));
                }
            };
            let events = ctx.dispatcher.execute_stream(request).map(sse_event);
            Ok(warp::sse::reply(warp::sse::keep_alive().stream(events)).into_response())
        })
}

/// GET /terminal (websocket upgrade)
pub fn terminal_route(
    ctx: Arc<AppContext>,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path("terminal")
        .and(warp::path::end())
        .and(warp::ws())
        .and(warp::query::<TerminalQuery>())
        .and(warp::addr::remote())
        .and(with_context(ctx))
        .map(
            |ws: warp::ws::Ws,
             query: TerminalQuery,
             remote: Option<SocketAddr>,
             ctx: Arc<AppContext>| {
                let client = remote
                    .map(|addr| addr.ip().to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                debug!("[{}] Terminal upgrade requested", client);
                let terminals = ctx.terminals.clone();
                ws.on_upgrade(move |socket| {
                    terminal_socket::bridge(socket, terminals, client, query.into_spec())
                })
                .into_response()
            },
        )
}

/// GET /terminal/sessions
pub fn list_terminals_route(
    ctx: Arc<AppContext>,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path!("terminal" / "sessions")
        .and(warp::get())
        .and(with_context(ctx))
        .map(|ctx: Arc<AppContext>| reply::json(&ctx.terminals.list_tabs()).into_response())
}

/// GET /history?limit=N
pub fn list_history_route(
    ctx: Arc<AppContext>,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path("history")
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::query::<HistoryQuery>())
        .and(with_context(ctx))
        .and_then(|query: HistoryQuery, ctx: Arc<AppContext>| async move {
            match ctx.dispatcher.history().list(query.effective_limit()).await {
                Ok(list) => Ok::<_, Rejection>(reply::json(&list).into_response()),
                Err(e) => {
                    let (status, body) = history_error(&e);
                    Ok(error_reply(status, body))
                }
            }
        })
}

/// GET /history/:id
pub fn get_history_route(
    ctx: Arc<AppContext>,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path!("history" / String)
        .and(warp::get())
        .and(with_context(ctx))
        .and_then(|id_str: String, ctx: Arc<AppContext>| async move {
            let id = match Uuid::parse_str(&id_str) {
                Ok(u) => u,
                Err(_) => {
                    return Ok::<_, Rejection>(error_reply(
                        StatusCode::BAD_REQUEST,
                        ApiError::new("Invalid history id"),
                    ))
                }
            };
            match ctx.dispatcher.history().get(id).await {
                Ok(view) => Ok(reply::json(&view).into_response()),
                Err(e) => {
                    let (status, body) = history_error(&e);
                    Ok(error_reply(status, body))
                }
            }
        })
}

/// GET /health
pub fn health_route(
    ctx: Arc<AppContext>,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_context(ctx))
        .map(|ctx: Arc<AppContext>| {
            let health = HealthResponse {
                status: "ok",
                encryption: if ctx.crypto.is_ready() { "ready" } else { "unavailable" },
            };
            reply::json(&health).into_response()
        })
}

/// Every endpoint, with rejections rendered as JSON errors.
pub fn api(ctx: Arc<AppContext>) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    execute_command_route(ctx.clone())
        .or(execute_script_stream_route(ctx.clone()))
        .unify()
        .or(execute_script_route(ctx.clone()))
        .unify()
        .or(list_terminals_route(ctx.clone()))
        .unify()
        .or(terminal_route(ctx.clone()))
        .unify()
        .or(list_history_route(ctx.clone()))
        .unify()
        .or(get_history_route(ctx.clone()))
        .unify()
        .or(health_route(ctx))
        .unify()
        .recover(handle_rejection)
        .unify()
        .with(warp::log("shellward::web"))
}

async fn handle_rejection(err: Rejection) -> Result<Response, Infallible> {
    let (status, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found".to_string())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, format!("Invalid request body: {}", e))
    } else if err.find::<warp::reject::InvalidQuery>().is_some() {
        (StatusCode::BAD_REQUEST, "Invalid query string".to_string())
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large".to_string())
    } else if err.find::<warp::reject::LengthRequired>().is_some() {
        (StatusCode::LENGTH_REQUIRED, "Content-Length required".to_string())
    } else if err.find::<warp::reject::UnsupportedMediaType>().is_some() {
        (StatusCode::UNSUPPORTED_MEDIA_TYPE, "Expected a JSON body".to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
    } else {
        warn!("Unhandled rejection: {:?}", err);
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
    };
    Ok(error_reply(status, ApiError::new(message)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::{test_context, REMOTE_PASSWORD};
    use crate::secrets::SecretKind;
    use crate::storage::Target;
    use serde_json::{json, Value};

    async fn api_for_test() -> (tempfile::TempDir, Arc<AppContext>) {
        let (dir, ctx) = test_context().await;
        ctx.inventory
            .save_target(&Target {
                id: "web1".into(),
                name: "Web 1".into(),
                hostname: "web1.internal".into(),
                port: 22,
                username: "deploy".into(),
                group: None,
            })
            .await
            .unwrap();
        (dir, Arc::new(ctx))
    }

    fn body_json(body: &[u8]) -> Value {
        serde_json::from_slice(body).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_encryption() {
        let (_dir, ctx) = api_for_test().await;
        let res = warp::test::request().path("/health").reply(&api(ctx)).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body_json(res.body()), json!({"status": "ok", "encryption": "ready"}));
    }

    #[tokio::test]
    async fn test_local_command_and_history() {
        let (_dir, ctx) = api_for_test().await;
        let filter = api(ctx);

        let res = warp::test::request()
            .method("POST")
            .path("/commands/execute")
            .json(&json!({"command": "echo routed"}))
            .reply(&filter)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let result = body_json(res.body());
        assert_eq!(result["exitCode"], 0);
        assert_eq!(result["output"], "routed\n");

        let res = warp::test::request().path("/history?limit=5").reply(&filter).await;
        assert_eq!(res.status(), StatusCode::OK);
        let list = body_json(res.body());
        let entries = list.as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["command"], "echo routed");

        let id = entries[0]["id"].as_str().unwrap().to_string();
        let res = warp::test::request()
            .path(&format!("/history/{}", id))
            .reply(&filter)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body_json(res.body())["output"], "routed\n");
    }

    #[tokio::test]
    async fn test_history_lookup_errors() {
        let (_dir, ctx) = api_for_test().await;
        let filter = api(ctx);
        let res = warp::test::request().path("/history/not-a-uuid").reply(&filter).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = warp::test::request()
            .path(&format!("/history/{}", Uuid::new_v4()))
            .reply(&filter)
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_remote_command_password() {
        let (_dir, ctx) = api_for_test().await;
        let filter = api(ctx);

        let res = warp::test::request()
            .method("POST")
            .path("/commands/execute")
            .json(&json!({"command": "uptime", "serverId": "web1", "password": REMOTE_PASSWORD}))
            .reply(&filter)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body_json(res.body())["output"], "ran on web1.internal\n");

        let res = warp::test::request()
            .method("POST")
            .path("/commands/execute")
            .json(&json!({"command": "uptime", "serverId": "web1", "password": "wrong-guess-42"}))
            .reply(&filter)
            .await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        let text = String::from_utf8_lossy(res.body()).into_owned();
        assert!(!text.contains("wrong-guess-42"));
        assert_eq!(body_json(res.body())["kind"], "authentication_failed");
    }

    #[tokio::test]
    async fn test_request_errors() {
        let (_dir, ctx) = api_for_test().await;
        let filter = api(ctx);

        let res = warp::test::request()
            .method("POST")
            .path("/commands/execute")
            .json(&json!({"command": "uptime", "serverId": "nope"}))
            .reply(&filter)
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let res = warp::test::request()
            .method("POST")
            .path("/commands/execute")
            .json(&json!({"command": "   "}))
            .reply(&filter)
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = warp::test::request()
            .method("POST")
            .path("/commands/execute")
            .json(&json!({"cmd": "uptime"}))
            .reply(&filter)
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = warp::test::request().path("/nowhere").reply(&filter).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(res.body())["message"], "Not found");
    }

    #[tokio::test]
    async fn test_script_execute_and_stream() {
        let (_dir, ctx) = api_for_test().await;
        ctx.secrets
            .put(SecretKind::Script, "greet", b"echo \"hello $WHO\"")
            .await
            .unwrap();
        ctx.secrets.put(SecretKind::Variable, "WHO", b"ops").await.unwrap();
        let filter = api(ctx);

        let res = warp::test::request()
            .method("POST")
            .path("/bash-scripts/execute")
            .json(&json!({"scriptId": "greet", "variableIds": ["WHO"]}))
            .reply(&filter)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body_json(res.body())["output"], "hello ops\n");

        let res = warp::test::request()
            .method("POST")
            .path("/bash-scripts/execute/stream")
            .json(&json!({"scriptId": "greet", "variableIds": ["WHO"]}))
            .reply(&filter)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let text = String::from_utf8_lossy(res.body()).into_owned();
        assert!(text.contains("event:result"), "{}", text);
        assert!(text.contains("hello ops"));
        assert!(!text.contains("event:error"));
    }

    #[tokio::test]
    async fn test_terminal_sessions_empty() {
        let (_dir, ctx) = api_for_test().await;
        let res = warp::test::request()
            .path("/terminal/sessions")
            .reply(&api(ctx))
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body_json(res.body()), json!([]));
    }
}
