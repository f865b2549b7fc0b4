//! HTTP wire protocol server, per spec.md §6.2: a global request handler
//! dispatching by method + path template over a `Store`, plus the
//! server-side half of the distributed evaluator dispatch (`/worker`
//! job-pull, `/call/<func>/<args>/evaluate`).
//!
//! Connection-level backpressure (§4.11, "per-connection concurrency limit,
//! default 8 outstanding responses") is provided by
//! `tower::limit::ConcurrencyLimitLayer` wrapping the router.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use memo_core::{Call, Cid, Name, Node};
use memo_eval::{Evaluator, ThreadPoolEvaluator};
use memo_store::{Store, StoreError, StoreExt};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tower::limit::ConcurrencyLimitLayer;

pub const DEFAULT_CONCURRENCY_LIMIT: usize = 8;
const CBOR_CONTENT_TYPE: &str = "application/cbor";

pub struct ServerState {
    store: Arc<dyn Store>,
    evaluator: Option<ThreadPoolEvaluator>,
    pending: Mutex<VecDeque<Call>>,
}

impl ServerState {
    pub fn new(store: Arc<dyn Store>, evaluator: Option<ThreadPoolEvaluator>) -> Arc<ServerState> {
        Arc::new(ServerState {
            store,
            evaluator,
            pending: Mutex::new(VecDeque::new()),
        })
    }
}

pub fn router(state: Arc<ServerState>) -> Router {
    router_with_concurrency_limit(state, DEFAULT_CONCURRENCY_LIMIT)
}

pub fn router_with_concurrency_limit(state: Arc<ServerState>, limit: usize) -> Router {
    Router::new()
        .route("/cid/:cid", get(get_cid))
        .route("/cid", post(post_cid))
        .route("/head/*name", get(get_head).put(put_head).delete(delete_head))
        .route("/head", get(get_heads))
        .route("/call", get(get_funcs))
        .route("/call/:func", get(get_calls).delete(delete_calls))
        .route(
            "/call/:func/:args",
            get(get_call).put(put_call),
        )
        .route("/call/:func/:args/evaluate", post(post_evaluate))
        .route("/worker", post(post_worker))
        .layer(ConcurrencyLimitLayer::new(limit))
        .with_state(state)
}

fn cbor_response(status: StatusCode, node: &Node) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, CBOR_CONTENT_TYPE.parse().unwrap());
    (status, headers, node.save_cbor()).into_response()
}

fn json_response(status: StatusCode, uris: Vec<String>) -> Response {
    (status, axum::Json(uris)).into_response()
}

fn store_error_response(err: StoreError) -> Response {
    match err {
        StoreError::NotFound => StatusCode::NOT_FOUND.into_response(),
        other => {
            tracing::error!(target: "memo_server", error = %other, "store error");
            (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()).into_response()
        }
    }
}

fn parse_cid(s: &str) -> Result<Cid, Response> {
    Cid::parse(s).map_err(|_| (StatusCode::BAD_REQUEST, "malformed CID").into_response())
}

fn parse_args(s: &str) -> Result<Vec<Cid>, Response> {
    if s.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "call must have at least one arg").into_response());
    }
    s.split(',')
        .map(parse_cid)
        .collect::<Result<Vec<_>, _>>()
}

fn decode_path_name(raw: &str) -> String {
    percent_encoding::percent_decode_str(raw)
        .decode_utf8_lossy()
        .into_owned()
}

async fn get_cid(State(state): State<Arc<ServerState>>, Path(cid): Path<String>) -> Response {
    let cid = match parse_cid(&cid) {
        Ok(cid) => cid,
        Err(resp) => return resp,
    };
    match state.store.get_optional(&cid) {
        Ok(Some(node)) => cbor_response(StatusCode::OK, &node),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => store_error_response(e),
    }
}

async fn post_cid(State(state): State<Arc<ServerState>>, body: Bytes) -> Response {
    let node = match Node::load_from_cbor(&body) {
        Ok(node) => node,
        Err(_) => return (StatusCode::BAD_REQUEST, "malformed CBOR body").into_response(),
    };
    match state.store.put(&node) {
        Ok(cid) => {
            let mut headers = HeaderMap::new();
            headers.insert(
                header::LOCATION,
                format!("/cid/{}", cid).parse().unwrap(),
            );
            (StatusCode::CREATED, headers).into_response()
        }
        Err(e) => store_error_response(e),
    }
}

fn link_node_from_body(body: &[u8]) -> Result<Cid, Response> {
    let node = Node::load_from_cbor(body)
        .map_err(|_| (StatusCode::BAD_REQUEST, "malformed CBOR body").into_response())?;
    node.as_link()
        .cloned()
        .ok_or_else(|| (StatusCode::BAD_REQUEST, "body must be a CID link").into_response())
}

async fn get_head(State(state): State<Arc<ServerState>>, Path(name): Path<String>) -> Response {
    let name = decode_path_name(&name);
    match state.store.resolve_optional(&Name::head(name)) {
        Ok(Some(cid)) => cbor_response(StatusCode::OK, &Node::link(cid)),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => store_error_response(e),
    }
}

async fn put_head(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
    body: Bytes,
) -> Response {
    let name = decode_path_name(&name);
    let cid = match link_node_from_body(&body) {
        Ok(cid) => cid,
        Err(resp) => return resp,
    };
    match state.store.set(&Name::head(name), &cid) {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(e) => store_error_response(e),
    }
}

async fn delete_head(State(state): State<Arc<ServerState>>, Path(name): Path<String>) -> Response {
    let name = decode_path_name(&name);
    match state.store.head_delete(&name) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => store_error_response(e),
    }
}

async fn get_heads(State(state): State<Arc<ServerState>>) -> Response {
    match state.store.list_heads() {
        Ok(names) => json_response(
            StatusCode::OK,
            names.into_iter().map(|n| format!("/head/{}", n)).collect(),
        ),
        Err(e) => store_error_response(e),
    }
}

async fn get_funcs(State(state): State<Arc<ServerState>>) -> Response {
    match state.store.list_funcs() {
        Ok(funcs) => json_response(
            StatusCode::OK,
            funcs.into_iter().map(|f| format!("/call/{}", f)).collect(),
        ),
        Err(e) => store_error_response(e),
    }
}

async fn get_calls(State(state): State<Arc<ServerState>>, Path(func): Path<String>) -> Response {
    match state.store.list_calls(&func) {
        Ok(calls) => json_response(
            StatusCode::OK,
            calls
                .into_iter()
                .map(|c| format!("/{}", name_path(&Name::Call(c))))
                .collect(),
        ),
        Err(e) => store_error_response(e),
    }
}

fn name_path(name: &Name) -> String {
    match name {
        Name::Cid(cid) => format!("cid/{}", cid),
        Name::Head(n) => format!("head/{}", n),
        Name::Call(call) => format!(
            "call/{}/{}",
            call.name,
            call.args
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(",")
        ),
    }
}

async fn delete_calls(State(state): State<Arc<ServerState>>, Path(func): Path<String>) -> Response {
    match state.store.call_invalidate(&func) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => store_error_response(e),
    }
}

async fn get_call(
    State(state): State<Arc<ServerState>>,
    Path((func, args)): Path<(String, String)>,
) -> Response {
    let args = match parse_args(&args) {
        Ok(args) => args,
        Err(resp) => return resp,
    };
    match state
        .store
        .resolve_optional(&Name::call(func, args))
    {
        Ok(Some(cid)) => cbor_response(StatusCode::OK, &Node::link(cid)),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => store_error_response(e),
    }
}

async fn put_call(
    State(state): State<Arc<ServerState>>,
    Path((func, args)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let args = match parse_args(&args) {
        Ok(args) => args,
        Err(resp) => return resp,
    };
    let cid = match link_node_from_body(&body) {
        Ok(cid) => cid,
        Err(resp) => return resp,
    };
    match state.store.set(&Name::call(func, args), &cid) {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(e) => store_error_response(e),
    }
}

/// `POST /call/<func>/<args>/evaluate` — §6.2: "200 body=CID, or 202 no
/// body". If the result is already cached, returns it synchronously. If the
/// server has a local evaluator with a registered func, runs it in the
/// background thread pool. Otherwise the call is queued for a distributed
/// worker to pick up via `POST /worker`; either way the caller must poll.
async fn post_evaluate(
    State(state): State<Arc<ServerState>>,
    Path((func, args)): Path<(String, String)>,
) -> Response {
    let args = match parse_args(&args) {
        Ok(args) => args,
        Err(resp) => return resp,
    };
    let call = Call::new(func, args);
    match state.store.resolve_optional(&Name::Call(call.clone())) {
        Ok(Some(cid)) => return cbor_response(StatusCode::OK, &Node::link(cid)),
        Ok(None) => {}
        Err(e) => return store_error_response(e),
    }
    if let Some(evaluator) = &state.evaluator {
        let evaluator = evaluator.clone();
        let future = evaluator.evaluate_async(call.clone());
        tokio::task::spawn_blocking(move || {
            let _ = future.wait();
        });
    } else {
        let mut pending = state.pending.lock().unwrap();
        pending.push_back(call);
    }
    StatusCode::ACCEPTED.into_response()
}

/// `POST /worker` — pulls the oldest queued call whose func is listed in
/// the worker's descriptor, returning it (or a `null` CBOR node if nothing
/// matches) for the worker to evaluate and `PUT` back.
async fn post_worker(State(state): State<Arc<ServerState>>, body: Bytes) -> Response {
    let descriptor = match Node::load_from_cbor(&body) {
        Ok(node) => node,
        Err(_) => return (StatusCode::BAD_REQUEST, "malformed CBOR body").into_response(),
    };
    let funcs: HashSet<String> = descriptor
        .as_map()
        .and_then(|m| m.get("funcs"))
        .and_then(|n| n.as_list())
        .map(|list| {
            list.iter()
                .filter_map(|n| n.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();

    let mut pending = state.pending.lock().unwrap();
    let position = pending.iter().position(|call| funcs.contains(&call.name));
    match position {
        Some(index) => {
            let call = pending.remove(index).unwrap();
            let node = Node::map([
                ("func".to_string(), Node::utf8_string(call.name.clone())),
                (
                    "args".to_string(),
                    Node::list(call.args.iter().cloned().map(Node::link).collect::<Vec<_>>()),
                ),
            ]);
            cbor_response(StatusCode::OK, &node)
        }
        None => cbor_response(StatusCode::OK, &Node::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body as AxumBody;
    use axum::http::Request;
    use memo_core::Node;
    use tower::ServiceExt;

    fn test_store() -> Arc<dyn Store> {
        Arc::from(memo_store::open("sqlite::memory:?mode=memory", true).unwrap())
    }

    #[tokio::test]
    async fn put_then_get_cid_round_trips() {
        let store = test_store();
        let node = Node::utf8_string("hello over http".repeat(10));
        let bytes = node.save_cbor();
        let state = ServerState::new(store, None);
        let app = router(state);

        let post_resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/cid")
                    .body(AxumBody::from(bytes))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(post_resp.status(), StatusCode::CREATED);
        let location = post_resp
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();

        let get_resp = app
            .oneshot(Request::builder().uri(location).body(AxumBody::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(get_resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn head_set_then_get_then_delete() {
        let store = test_store();
        let cid = store.put(&Node::Integer(9)).unwrap();
        let state = ServerState::new(store, None);
        let app = router(state);

        let put_resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/head/latest")
                    .body(AxumBody::from(Node::link(cid).save_cbor()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(put_resp.status(), StatusCode::CREATED);

        let get_resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/head/latest")
                    .body(AxumBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(get_resp.status(), StatusCode::OK);

        let delete_resp = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/head/latest")
                    .body(AxumBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(delete_resp.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn evaluate_queues_job_for_worker_without_local_evaluator() {
        let store = test_store();
        let arg = store.put(&Node::Integer(3)).unwrap();
        let state = ServerState::new(store, None);
        let app = router(state.clone());

        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/call/square/{}/evaluate", arg))
                    .body(AxumBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(state.pending.lock().unwrap().len(), 1);
    }
}
