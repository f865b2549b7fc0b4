//! The client/remote half of the `Evaluator` split described in spec.md
//! §4.6: `ClientEvaluator::evaluate` posts a call to a remote
//! `memo-server`, polling `202 Accepted` responses until the server
//! returns the cached result. While waiting it pulls a job of its own via
//! `POST /worker` and executes it — the "cooperative progress" property
//! called out in §9: even a client that only calls `evaluate` once must be
//! willing to run one job for the server, or a single-client deployment
//! deadlocks with nobody left to do the work.
//!
//! This is deliberately a separate type from `memo_eval::ThreadPoolEvaluator`
//! rather than a second implementor of `memo_eval::Evaluator`: the local
//! evaluator's `Future` is a condvar-driven handle into its own thread
//! pool, while this evaluator's blocking happens over HTTP polling with a
//! fixed retry delay, which doesn't fit the same handle type. Both follow
//! the same `evaluate`/call-registration shape.

use memo_core::{Call, Cid, Name, Node};
use memo_store::{Store, StoreError, StoreExt};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// The fixed retry delay the protocol requires between `202` polls (§5,
/// "Cancellation & timeouts"). Implementations may extend this to
/// exponential backoff; this one does not, to keep the retry loop legible.
pub const POLL_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Node(#[from] memo_core::NodeError),
    #[error("server returned an unexpected response")]
    Protocol,
    #[error("function {0:?} failed: {1}")]
    Func(String, Box<dyn std::error::Error + Send + Sync>),
}

/// A func this client can run when it pulls a job from the server. Unlike
/// `memo_eval::Func`, it receives the `ClientEvaluator` itself (so it can
/// resolve its argument CIDs through the same HTTP-backed store) rather
/// than a generic `&dyn Evaluator`.
pub type Func =
    Arc<dyn Fn(&ClientEvaluator, &Call) -> Result<Node, ClientError> + Send + Sync>;

fn args_path(args: &[Cid]) -> String {
    args.iter().map(|c| c.to_string()).collect::<Vec<_>>().join(",")
}

fn worker_descriptor(funcs: &[String]) -> Node {
    Node::map([(
        "funcs".to_string(),
        Node::list(funcs.iter().cloned().map(Node::utf8_string).collect::<Vec<_>>()),
    )])
}

pub struct ClientEvaluator {
    http: Client,
    base_url: String,
    store: Arc<dyn Store>,
    funcs: Mutex<HashMap<String, Func>>,
    poll_delay: Duration,
    stop: AtomicBool,
}

impl ClientEvaluator {
    pub fn new(base_url: impl Into<String>) -> Result<ClientEvaluator, ClientError> {
        let base_url = base_url.into();
        let http = Client::builder().timeout(Duration::from_secs(30)).build()?;
        let store: Arc<dyn Store> = Arc::from(memo_store::open(&base_url, false)?);
        Ok(ClientEvaluator {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            store,
            funcs: Mutex::new(HashMap::new()),
            poll_delay: POLL_DELAY,
            stop: AtomicBool::new(false),
        })
    }

    /// Overrides the default 1-second poll delay; useful for tests.
    pub fn with_poll_delay(mut self, delay: Duration) -> ClientEvaluator {
        self.poll_delay = delay;
        self
    }

    pub fn store(&self) -> &dyn Store {
        &*self.store
    }

    /// Registers a func this client is willing to run when it pulls a job
    /// from `/worker`. Must happen before `evaluate`/`run_worker_loop`.
    pub fn register_func(&self, name: impl Into<String>, func: Func) {
        self.funcs.lock().unwrap().insert(name.into(), func);
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn registered_func_names(&self) -> Vec<String> {
        self.funcs.lock().unwrap().keys().cloned().collect()
    }

    /// Blocks until the remote evaluator reports a result for `call`,
    /// polling on `202` and pulling one job per retry in the meantime.
    pub fn evaluate(&self, call: &Call) -> Result<Cid, ClientError> {
        let path = format!("call/{}/{}/evaluate", call.name, args_path(&call.args));
        loop {
            let resp = self.http.post(self.url(&path)).send()?;
            match resp.status() {
                StatusCode::OK => {
                    let bytes = resp.bytes()?;
                    let node = Node::load_from_cbor(&bytes)?;
                    return node.as_link().cloned().ok_or(ClientError::Protocol);
                }
                StatusCode::ACCEPTED => {
                    let _ = self.try_pull_and_run_one_job();
                    std::thread::sleep(self.poll_delay);
                }
                other => return Err(ClientError::Protocol).map_err(|e: ClientError| {
                    tracing::warn!(target: "memo_client", status = %other, "unexpected evaluate response");
                    e
                }),
            }
        }
    }

    /// Pulls at most one job from `/worker` and, if this client has the
    /// func registered, runs it and `PUT`s the result back. Returns
    /// `Ok(true)` if a job was executed, `Ok(false)` if the server had
    /// nothing for this client's func set.
    pub fn try_pull_and_run_one_job(&self) -> Result<bool, ClientError> {
        let descriptor = worker_descriptor(&self.registered_func_names());
        let resp = self
            .http
            .post(self.url("worker"))
            .header("content-type", "application/cbor")
            .body(descriptor.save_cbor())
            .send()?
            .error_for_status()?;
        let bytes = resp.bytes()?;
        let job = Node::load_from_cbor(&bytes)?;
        let map = match job.as_map() {
            Some(map) => map,
            None => return Ok(false), // Null: nothing pending for this client's funcs.
        };
        let func_name = map
            .get("func")
            .and_then(|n| n.as_str())
            .ok_or(ClientError::Protocol)?
            .to_string();
        let args: Vec<Cid> = map
            .get("args")
            .and_then(|n| n.as_list())
            .ok_or(ClientError::Protocol)?
            .iter()
            .map(|n| n.as_link().cloned().ok_or(ClientError::Protocol))
            .collect::<Result<_, _>>()?;

        let func = self.funcs.lock().unwrap().get(&func_name).cloned();
        let func = match func {
            Some(func) => func,
            None => return Ok(false),
        };
        let call = Call::new(func_name.clone(), args.clone());
        tracing::info!(target: "memo_client::progress", call = %Name::Call(call.clone()), "worker: starting pulled job");
        let result = func(self, &call)?;
        let cid = self.store.put(&result)?;
        self.store.call_set(&func_name, &args, &cid)?;
        tracing::info!(target: "memo_client::progress", call = %Name::Call(call), "worker: finished pulled job");
        Ok(true)
    }

    /// Runs `try_pull_and_run_one_job` in a loop with `poll_delay` between
    /// empty polls, until `stop()` is called: the standalone worker shape
    /// from §4.6 ("pulls jobs and returns results") for a client with no
    /// `evaluate` calls of its own to drive.
    pub fn run_worker_loop(&self) {
        while !self.stop.load(Ordering::SeqCst) {
            match self.try_pull_and_run_one_job() {
                Ok(true) => {}
                Ok(false) => std::thread::sleep(self.poll_delay),
                Err(e) => {
                    tracing::warn!(target: "memo_client", error = %e, "worker poll failed");
                    std::thread::sleep(self.poll_delay);
                }
            }
        }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use memo_server::ServerState;
    use std::net::TcpListener;
    use std::sync::OnceLock;
    use tokio::runtime::Runtime;

    fn runtime() -> &'static Runtime {
        static RT: OnceLock<Runtime> = OnceLock::new();
        RT.get_or_init(|| Runtime::new().unwrap())
    }

    fn spawn_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        listener.set_nonblocking(true).unwrap();
        let store: Arc<dyn Store> = Arc::from(memo_store::open("sqlite::memory:?mode=memory", true).unwrap());
        let state = ServerState::new(store, None);
        let app: Router = memo_server::router(state);
        let rt = runtime();
        rt.spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[test]
    fn worker_descriptor_encodes_func_names() {
        let node = worker_descriptor(&["square".to_string()]);
        let map = node.as_map().unwrap();
        let funcs = map.get("funcs").unwrap().as_list().unwrap();
        assert_eq!(funcs[0].as_str(), Some("square"));
    }

    #[test]
    fn evaluate_round_trips_a_result_already_put_by_the_client() {
        let base_url = spawn_server();
        let client = ClientEvaluator::new(&base_url).unwrap().with_poll_delay(Duration::from_millis(10));
        let arg = client.store().put(&Node::Integer(3)).unwrap();
        let result = client.store().put(&Node::Integer(9)).unwrap();
        client
            .store()
            .call_set("square", &[arg.clone()], &result)
            .unwrap();
        let cid = client.evaluate(&Call::new("square", vec![arg])).unwrap();
        assert_eq!(cid, result);
    }

    #[test]
    fn pulls_and_executes_a_pending_job_when_registered() {
        let base_url = spawn_server();
        let submitter = ClientEvaluator::new(&base_url).unwrap();
        let arg = submitter.store().put(&Node::Integer(4)).unwrap();

        // Submitting client has no evaluator: /evaluate queues the call.
        let call = Call::new("square", vec![arg.clone()]);
        let _ = submitter.http.post(submitter.url(&format!(
            "call/{}/{}/evaluate",
            call.name,
            args_path(&call.args)
        ))).send().unwrap();

        let worker = ClientEvaluator::new(&base_url).unwrap();
        worker.register_func(
            "square",
            Arc::new(|evaluator: &ClientEvaluator, call: &Call| -> Result<Node, ClientError> {
                let arg = evaluator.store().get(&call.args[0])?;
                let x = arg.as_integer().unwrap();
                Ok(Node::Integer(x * x))
            }),
        );
        let ran = worker.try_pull_and_run_one_job().unwrap();
        assert!(ran);

        let cid = submitter.evaluate(&call).unwrap();
        assert_eq!(submitter.store().get(&cid).unwrap().as_integer(), Some(16));
    }
}
