//! Unix-socket listener: one newline-delimited JSON request per connection,
//! one JSON response back.

use chrono::Utc;
use fs_err as fs;
use serde_json::json;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use ufse_core::{
    CancellationToken, DetectionConfig, Forwarder, InMemoryObserver, JsonlIncidentSink, Pipeline,
    RetryPolicy, SessionManager,
};
use ufse_protocol::{
    parse_ingest, ErrorInfo, Method, Request, Response, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};

use crate::paths;
use crate::worker::spawn_pipeline_worker;

const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;
const SHUTDOWN_DRAIN_SECS: u64 = 10;
const DRAIN_POLL: Duration = Duration::from_millis(50);

pub struct ServeOptions {
    pub config: DetectionConfig,
    pub socket_path: Option<PathBuf>,
    pub incidents_path: Option<PathBuf>,
}

/// What request handlers can reach.
struct DaemonState {
    sessions: Arc<SessionManager>,
    pipeline: Arc<Pipeline>,
    observer: Arc<InMemoryObserver>,
    incidents: Arc<JsonlIncidentSink>,
    socket_path: PathBuf,
    shutdown_requested: AtomicBool,
}

/// Background threads and the tokens that stop them.
struct Workers {
    sweeps: Vec<JoinHandle<()>>,
    pipeline: JoinHandle<()>,
    shutdown: CancellationToken,
    cancel: CancellationToken,
}

pub fn serve(options: ServeOptions) -> Result<(), String> {
    let socket_path = match options.socket_path {
        Some(path) => path,
        None => paths::socket_path()?,
    };
    let incidents_path = match options.incidents_path {
        Some(path) => path,
        None => paths::incidents_path()?,
    };
    prepare_socket_dir(&socket_path)?;
    remove_existing_socket(&socket_path)?;

    let config = options.config;
    let observer = Arc::new(InMemoryObserver::new());
    let pipeline = Arc::new(
        Pipeline::new(config.clone(), observer.clone())
            .map_err(|err| format!("Failed to build pipeline: {}", err))?,
    );
    let incidents = Arc::new(
        JsonlIncidentSink::open(&incidents_path)
            .map_err(|err| format!("Failed to open incident log: {}", err))?,
    );
    let forwarder = Forwarder::new(
        incidents.clone(),
        RetryPolicy::from_config(&config.forwarding),
        observer.clone(),
    );

    let (sessions, completed) = SessionManager::new(config.session.clone(), observer.clone());
    let sessions = Arc::new(sessions);
    let sweeps = sessions.start();
    let shutdown = CancellationToken::new();
    let cancel = CancellationToken::new();
    let worker = spawn_pipeline_worker(
        completed,
        Arc::clone(&pipeline),
        forwarder,
        shutdown.clone(),
        cancel.clone(),
    );
    let workers = Workers {
        sweeps,
        pipeline: worker,
        shutdown,
        cancel,
    };

    let listener = UnixListener::bind(&socket_path).map_err(|err| {
        format!(
            "Failed to bind daemon socket {}: {}",
            socket_path.display(),
            err
        )
    })?;
    info!(
        path = %socket_path.display(),
        incidents = %incidents_path.display(),
        mode = ?config.engine.mode,
        "UFSE daemon started"
    );

    let state = Arc::new(DaemonState {
        sessions,
        pipeline,
        observer,
        incidents,
        socket_path: socket_path.clone(),
        shutdown_requested: AtomicBool::new(false),
    });
    for stream in listener.incoming() {
        if state.shutdown_requested.load(Ordering::SeqCst) {
            break;
        }
        match stream {
            Ok(stream) => {
                let state = Arc::clone(&state);
                thread::spawn(move || handle_connection(stream, &state));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
    drop(listener);

    drain(&state, workers);
    remove_existing_socket(&socket_path)?;
    Ok(())
}

/// Stops the sweeps, hands every open session to the pipeline, and waits for
/// the worker to deliver them. Deliveries still running after the drain
/// deadline are cancelled.
fn drain(state: &DaemonState, workers: Workers) {
    info!("UFSE daemon shutting down");
    state.sessions.stop();
    for sweep in workers.sweeps {
        if sweep.join().is_err() {
            warn!("Session sweep panicked");
        }
    }

    let deadline = Instant::now() + Duration::from_secs(SHUTDOWN_DRAIN_SECS);
    let mut handed_off = state.sessions.flush();
    while state.sessions.snapshot().total() > 0 && Instant::now() < deadline {
        thread::sleep(DRAIN_POLL);
        handed_off += state.sessions.emit_completed();
    }
    let remaining = state.sessions.snapshot().total();
    if remaining > 0 {
        warn!(remaining, "Sessions left undelivered at shutdown");
    }

    workers.shutdown.cancel();
    while !workers.pipeline.is_finished() && Instant::now() < deadline {
        thread::sleep(DRAIN_POLL);
    }
    if !workers.pipeline.is_finished() {
        warn!("Pipeline worker overran shutdown; cancelling deliveries");
        workers.cancel.cancel();
    }
    if workers.pipeline.join().is_err() {
        warn!("Pipeline worker panicked");
    }
    info!(handed_off, "UFSE daemon stopped");
}

/// Unblocks the accept loop so it can observe the shutdown flag.
fn wake_listener(socket_path: &Path) {
    if let Err(err) = UnixStream::connect(socket_path) {
        debug!(error = %err, "Listener already closed");
    }
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, state: &DaemonState) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let _ = write_response(&mut stream, Response::error_with_info(None, err));
            return;
        }
    };

    debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    let response = handle_request(request, state);
    let _ = write_response(&mut stream, response);
    if state.shutdown_requested.load(Ordering::SeqCst) {
        wake_listener(&state.socket_path);
    }
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    let request_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };
    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, state: &DaemonState) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    match request.method {
        Method::GetHealth => {
            let mut data = json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
                "incidents_stored": state.incidents.len(),
            });
            if let Ok(value) = serde_json::to_value(state.sessions.snapshot()) {
                data["sessions"] = value;
            }
            if let Ok(value) = serde_json::to_value(state.pipeline.shadow().metrics()) {
                data["shadow"] = value;
            }
            if let Ok(value) = serde_json::to_value(state.pipeline.audit().summary()) {
                data["suppressions"] = value;
            }
            Response::ok(request.id, data)
        }
        Method::GetMetrics => match serde_json::to_value(state.observer.snapshot()) {
            Ok(value) => Response::ok(request.id, value),
            Err(err) => Response::error(
                request.id,
                "serialization_error",
                format!("Failed to serialize metrics: {}", err),
            ),
        },
        Method::Ingest => handle_ingest(request, state),
        Method::Flush => {
            let handed_off = state.sessions.flush();
            info!(handed_off, "Flush requested");
            Response::ok(request.id, json!({ "handed_off": handed_off }))
        }
        Method::Shutdown => {
            info!("Shutdown requested");
            state.shutdown_requested.store(true, Ordering::SeqCst);
            Response::ok(request.id, json!({ "stopping": true }))
        }
    }
}

fn handle_ingest(request: Request, state: &DaemonState) -> Response {
    let Some(params) = request.params else {
        return Response::error(request.id, "invalid_params", "ingest payload is required");
    };
    let ingest = match parse_ingest(params) {
        Ok(ingest) => ingest,
        Err(err) => return Response::error_with_info(request.id, err),
    };

    let count = ingest.events.len();
    let outcome = state.sessions.ingest(
        &ingest.project_id,
        &ingest.session_id,
        ingest.events,
        Utc::now(),
    );
    debug!(
        session_id = %ingest.session_id,
        events = count,
        accepted = outcome.accepted,
        dropped = outcome.dropped,
        "Events ingested"
    );
    match serde_json::to_value(outcome) {
        Ok(value) => Response::ok(request.id, value),
        Err(err) => Response::error(
            request.id,
            "serialization_error",
            format!("Failed to serialize ingest outcome: {}", err),
        ),
    }
}

fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, &response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
