//! Out-of-thread dispatch acceleration for [`crate::engine::Engine`].
//!
//! A `Worker` owns its *own* `Engine` — a clone-by-snapshot of whatever the
//! caller built, running on a dedicated OS thread with no shared mutable
//! state — and exposes request/response methods (`dispatch`, `snapshot`,
//! `ping`) over a `std::sync::mpsc` channel, no async runtime, independent
//! of whatever runtime a relay or room server binary built on this crate
//! happens to use. The caller's own `Engine` is never moved into the
//! worker; it stays the system of record. `Worker::dispatch` takes it by
//! reference, applies the worker-produced document changes to it via
//! `Chronicle::merge`, and falls back to running the action directly on the
//! caller's `Engine` — with a warning event — if the worker is unreachable
//! or times out.
//!
//! The explicit state machine below (`Uninit → Ready → Busy → Ready →
//! ShuttingDown → Dead`) exists so a caller can tell a worker that is merely
//! busy apart from one that has crashed or been told to stop.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::Value as Json;

use crate::chronicle::ChronicleEvent;
use crate::engine::Engine;
use crate::error::{ChronicleError, Result};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_BATCH_WINDOW: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkerState {
    Uninit,
    Ready,
    Busy,
    ShuttingDown,
    Dead,
}

enum WorkerRequest {
    Dispatch { action: String, payload: Json },
    Snapshot,
    Ping,
    Shutdown,
}

/// A successful dispatch carries both the handler's result and the causal
/// change bytes its `Chronicle::change` calls produced, exactly the bytes
/// `ChronicleEvent::SyncNeed` emits locally — the caller feeds them straight
/// into its own `Chronicle::merge`.
enum WorkerResponse {
    Dispatched(Result<(Json, Vec<Vec<u8>>)>),
    Snapshot(Result<Vec<u8>>),
    Pong,
    ShutDown,
}

struct Envelope {
    request: WorkerRequest,
    reply: mpsc::Sender<WorkerResponse>,
}

/// A handle to a background `Engine`. Dropping a `Worker` without calling
/// [`Worker::shutdown`] detaches its thread; the thread notices the channel
/// has closed and exits on its own next recv.
pub struct Worker {
    state: Arc<Mutex<WorkerState>>,
    tx: mpsc::Sender<Envelope>,
    handle: Option<JoinHandle<()>>,
    request_timeout: Duration,
}

impl Worker {
    /// Spawns a worker running `engine` — typically a fresh `Engine` built
    /// by the caller with the same registry/rule registrations and a
    /// snapshot of the caller's current document, since those registrations
    /// are local code rather than replicated state (see `crate::registry`).
    pub fn spawn(engine: Engine) -> Self {
        Self::spawn_with_batch_window(engine, DEFAULT_BATCH_WINDOW)
    }

    pub fn spawn_with_batch_window(mut engine: Engine, batch_window: Duration) -> Self {
        let (tx, rx) = mpsc::channel::<Envelope>();
        let state = Arc::new(Mutex::new(WorkerState::Uninit));
        let thread_state = state.clone();

        let sync_log: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let log = sync_log.clone();
            engine.chronicle_mut().subscribe(move |event| {
                if let ChronicleEvent::SyncNeed { bytes, .. } = event {
                    log.lock().unwrap().push(bytes.clone());
                }
            });
        }

        let handle = std::thread::spawn(move || {
            *thread_state.lock().unwrap() = WorkerState::Ready;
            loop {
                let envelope = match rx.recv() {
                    Ok(envelope) => envelope,
                    Err(_) => break,
                };
                *thread_state.lock().unwrap() = WorkerState::Busy;
                let mut shutting_down = false;
                handle_one(&mut engine, &sync_log, envelope, &mut shutting_down);

                // Drain anything that arrived within the batching window
                // before going back to a blocking wait, amortizing the
                // thread wake-up cost across a short burst of requests.
                while !shutting_down {
                    match rx.recv_timeout(batch_window) {
                        Ok(envelope) => handle_one(&mut engine, &sync_log, envelope, &mut shutting_down),
                        Err(_) => break,
                    }
                }
                *thread_state.lock().unwrap() = WorkerState::Ready;
                if shutting_down {
                    break;
                }
            }
            *thread_state.lock().unwrap() = WorkerState::Dead;
        });

        Self {
            state,
            tx,
            handle: Some(handle),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap()
    }

    fn request(&self, request: WorkerRequest) -> Result<WorkerResponse> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(Envelope { request, reply: reply_tx })
            .map_err(|_| ChronicleError::PeerUnreachable("worker thread is gone".into()))?;
        reply_rx
            .recv_timeout(self.request_timeout)
            .map_err(|_| ChronicleError::WorkerTimeout(self.request_timeout))
    }

    /// Dispatches `action` on the worker's background `Engine` and merges
    /// the resulting document changes into `engine`, the caller's own.
    /// If the worker is unreachable or times out, degrades automatically to
    /// running the action in-process on `engine` directly, emitting a
    /// `worker:degraded` warning rather than failing the dispatch.
    pub fn dispatch(&self, engine: &mut Engine, action: &str, payload: Json) -> Result<Json> {
        let request = WorkerRequest::Dispatch {
            action: action.to_string(),
            payload: payload.clone(),
        };
        match self.request(request) {
            Ok(WorkerResponse::Dispatched(Ok((result, changes)))) => {
                for bytes in changes {
                    if let Err(err) = engine.chronicle_mut().merge(&bytes) {
                        tracing::warn!(
                            target: "chronicle::worker",
                            action,
                            error = %err,
                            "worker:degraded: failed to merge worker-produced change, falling back to in-process dispatch"
                        );
                        return engine.dispatch(action, payload);
                    }
                }
                Ok(result)
            }
            Ok(WorkerResponse::Dispatched(Err(err))) => Err(err),
            Ok(_) => Err(ChronicleError::InternalInvariantBroken(
                "unexpected worker response to dispatch".into(),
            )),
            Err(err) => {
                tracing::warn!(
                    target: "chronicle::worker",
                    action,
                    error = %err,
                    "worker:degraded: worker unreachable, falling back to in-process dispatch"
                );
                engine.dispatch(action, payload)
            }
        }
    }

    pub fn snapshot(&self) -> Result<Vec<u8>> {
        match self.request(WorkerRequest::Snapshot)? {
            WorkerResponse::Snapshot(result) => result,
            _ => Err(ChronicleError::InternalInvariantBroken("unexpected worker response to snapshot".into())),
        }
    }

    pub fn ping(&self) -> Result<()> {
        match self.request(WorkerRequest::Ping)? {
            WorkerResponse::Pong => Ok(()),
            _ => Err(ChronicleError::InternalInvariantBroken("unexpected worker response to ping".into())),
        }
    }

    /// Requests a clean shutdown and joins the worker thread. A timed-out
    /// shutdown request still marks the worker `Dead` from the caller's
    /// point of view; the thread is left to finish on its own.
    pub fn shutdown(mut self) -> Result<()> {
        *self.state.lock().unwrap() = WorkerState::ShuttingDown;
        let result = self.request(WorkerRequest::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        result.map(|_| ())
    }
}

fn handle_one(engine: &mut Engine, sync_log: &Arc<Mutex<Vec<Vec<u8>>>>, envelope: Envelope, shutting_down: &mut bool) {
    let response = match envelope.request {
        WorkerRequest::Dispatch { action, payload } => {
            sync_log.lock().unwrap().clear();
            let result = engine.dispatch(&action, payload);
            let changes = sync_log.lock().unwrap().drain(..).collect();
            WorkerResponse::Dispatched(result.map(|json| (json, changes)))
        }
        WorkerRequest::Snapshot => WorkerResponse::Snapshot(engine.snapshot()),
        WorkerRequest::Ping => WorkerResponse::Pong,
        WorkerRequest::Shutdown => {
            *shutting_down = true;
            WorkerResponse::ShutDown
        }
    };
    let _ = envelope.reply.send(response);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chronicle::Chronicle;
    use crate::ids::PeerId;

    fn test_engine() -> Engine {
        let mut engine = Engine::new(Chronicle::new(PeerId::generate()));
        engine.registry_mut().register("noop", |_chronicle, payload| Ok(payload.clone()));
        engine.registry_mut().register("set_phase", |chronicle, payload| {
            let phase = payload.clone();
            chronicle.change("set_phase", |ctx| {
                ctx.set("phase", phase.clone());
                Ok(())
            })?;
            Ok(Json::Null)
        });
        engine
    }

    #[test]
    fn dispatch_round_trips_through_the_worker_thread() {
        let worker = Worker::spawn(test_engine());
        let mut caller_engine = test_engine();
        let result = worker.dispatch(&mut caller_engine, "noop", Json::from(42)).unwrap();
        assert_eq!(result, Json::from(42));
        worker.shutdown().unwrap();
    }

    #[test]
    fn worker_produced_changes_merge_into_the_callers_engine() {
        let worker = Worker::spawn(test_engine());
        let mut caller_engine = test_engine();
        worker
            .dispatch(&mut caller_engine, "set_phase", Json::from("setup"))
            .unwrap();
        match caller_engine.chronicle().state().field("phase").unwrap() {
            chronicle_crdt::Field::Register(r) => assert_eq!(r.get(), &Json::from("setup")),
            _ => panic!("expected register"),
        }
        worker.shutdown().unwrap();
    }

    #[test]
    fn ping_succeeds_while_ready() {
        let worker = Worker::spawn(test_engine());
        worker.ping().unwrap();
        worker.shutdown().unwrap();
    }

    #[test]
    fn unknown_action_error_propagates_through_worker() {
        let worker = Worker::spawn(test_engine());
        let mut caller_engine = test_engine();
        let result = worker.dispatch(&mut caller_engine, "nope", Json::Null);
        assert_eq!(result, Err(ChronicleError::UnknownAction("nope".into())));
        worker.shutdown().unwrap();
    }

    #[test]
    fn shutdown_transitions_to_dead() {
        let worker = Worker::spawn(test_engine());
        worker.shutdown().unwrap();
    }

    #[test]
    fn an_unreachable_worker_degrades_to_in_process_dispatch() {
        let worker = Worker::spawn(test_engine());
        worker.shutdown().unwrap();
        let degraded = Worker {
            state: Arc::new(Mutex::new(WorkerState::Dead)),
            tx: {
                let (tx, _rx) = mpsc::channel();
                tx
            },
            handle: None,
            request_timeout: Duration::from_millis(50),
        };
        let mut caller_engine = test_engine();
        let result = degraded.dispatch(&mut caller_engine, "noop", Json::from(7)).unwrap();
        assert_eq!(result, Json::from(7));
        assert_eq!(caller_engine.history().len(), 1);
    }
}
