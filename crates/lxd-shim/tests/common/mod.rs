//! Shared test fixtures: in-memory launcher and tool runner, request helpers.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use lxd_shim::{create_router, serve, AppState, CommandRunner};
use lxd_shim_core::{Dimensions, Error, OperationId, OperationStatus, Result, ServerConfig};
use lxd_shim_session::{LaunchRequest, Launcher, PtySession, SessionProcess};

/// What the fake session does once launched.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Echo every input byte back as output
    Echo,
    /// Take this long to launch, then echo
    SlowEcho(Duration),
    /// Print these bytes, then exit
    Output(Vec<u8>),
    /// Fail to spawn with this message
    Fail(String),
}

/// Launcher that records every request and runs sessions over a socket pair.
pub struct FakeLauncher {
    behavior: Behavior,
    pub launches: Mutex<Vec<LaunchRequest>>,
    pub process_log: Arc<Mutex<Vec<String>>>,
}

impl FakeLauncher {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            launches: Mutex::new(Vec::new()),
            process_log: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn launches(&self) -> Vec<LaunchRequest> {
        self.launches.lock().unwrap().clone()
    }

    pub fn process_log(&self) -> Vec<String> {
        self.process_log.lock().unwrap().clone()
    }
}

impl Launcher for FakeLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<PtySession> {
        self.launches.lock().unwrap().push(request.clone());

        let (ours, mut theirs) = UnixStream::pair()?;
        match &self.behavior {
            Behavior::Fail(msg) => return Err(Error::SpawnFailure(msg.clone())),
            Behavior::Echo | Behavior::SlowEcho(_) => {
                if let Behavior::SlowEcho(delay) = &self.behavior {
                    std::thread::sleep(*delay);
                }
                std::thread::spawn(move || {
                    let mut buf = [0u8; 1024];
                    loop {
                        match theirs.read(&mut buf) {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if theirs.write_all(&buf[..n]).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
            Behavior::Output(bytes) => {
                let bytes = bytes.clone();
                std::thread::spawn(move || {
                    let _ = theirs.write_all(&bytes);
                    let _ = theirs.shutdown(Shutdown::Both);
                });
            }
        }

        Ok(PtySession {
            reader: Box::new(ours.try_clone()?),
            writer: Box::new(ours.try_clone()?),
            process: Box::new(FakeProcess {
                stream: ours,
                log: Arc::clone(&self.process_log),
            }),
        })
    }
}

struct FakeProcess {
    stream: UnixStream,
    log: Arc<Mutex<Vec<String>>>,
}

impl SessionProcess for FakeProcess {
    fn resize(&mut self, dimensions: Dimensions) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("resize {}x{}", dimensions.rows, dimensions.cols));
        Ok(())
    }

    fn signal(&mut self, signal: i32) -> Result<()> {
        self.log.lock().unwrap().push(format!("signal {signal}"));
        Ok(())
    }

    fn terminate(&mut self) -> Result<()> {
        self.log.lock().unwrap().push("terminate".to_string());
        let _ = self.stream.shutdown(Shutdown::Both);
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        None
    }
}

/// Tool runner that records invocations and fails on one tool.
#[derive(Default)]
pub struct FakeRunner {
    pub calls: Mutex<Vec<Vec<String>>>,
    pub fail_on: Option<String>,
}

impl FakeRunner {
    pub fn failing_on(tool: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            fail_on: Some(tool.to_string()),
        })
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, argv: &[String]) -> Result<()> {
        self.calls.lock().unwrap().push(argv.to_vec());
        if self.fail_on.as_deref() == argv.first().map(String::as_str) {
            return Err(Error::ActionFailed(format!("{} exited with status 1", argv[0])));
        }
        Ok(())
    }
}

pub fn test_state(
    config: ServerConfig,
    launcher: Arc<FakeLauncher>,
    runner: Arc<FakeRunner>,
) -> AppState {
    AppState::with_backends(config, launcher, runner)
}

pub fn default_state() -> (AppState, Arc<FakeLauncher>, Arc<FakeRunner>) {
    let launcher = FakeLauncher::new(Behavior::Echo);
    let runner = Arc::new(FakeRunner::default());
    let state = test_state(ServerConfig::default(), launcher.clone(), runner.clone());
    (state, launcher, runner)
}

/// Send one request through the router and decode the JSON body.
pub async fn request(
    state: &AppState,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let body = match body {
        Some(json) => Body::from(json.to_string()),
        None => Body::empty(),
    };
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body)
        .unwrap();

    let response = create_router(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

/// Create an exec operation, returning its id and `(data, control)` secrets.
pub async fn create_exec(
    state: &AppState,
    instance: &str,
    body: Value,
) -> (OperationId, String, String) {
    let (status, json) = request(
        state,
        "POST",
        &format!("/1.0/instances/{instance}/exec"),
        Some(body),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{json}");
    extract_session(&json)
}

/// Create a console operation, returning its id and secrets.
pub async fn create_console(state: &AppState, instance: &str) -> (OperationId, String, String) {
    let (status, json) = request(
        state,
        "POST",
        &format!("/1.0/instances/{instance}/console"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{json}");
    extract_session(&json)
}

fn extract_session(json: &Value) -> (OperationId, String, String) {
    let id = json["metadata"]["id"].as_str().unwrap().parse().unwrap();
    let fds = &json["metadata"]["metadata"]["fds"];
    (
        id,
        fds["0"].as_str().unwrap().to_string(),
        fds["control"].as_str().unwrap().to_string(),
    )
}

/// Serve `state` on an ephemeral local port.
pub async fn spawn_server(state: AppState) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, state, std::future::pending()));
    addr
}

/// Poll until the operation reaches `status`, or panic after a few seconds.
pub async fn wait_for_status(state: &AppState, id: &OperationId, status: OperationStatus) {
    for _ in 0..100 {
        if state.operations.get(id).map(|op| op.status).ok() == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!(
        "operation {id} never reached {status}: {:?}",
        state.operations.get(id)
    );
}

/// Poll until `condition` holds, or panic after a few seconds.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}
