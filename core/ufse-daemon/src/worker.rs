//! Pipeline worker: drains completed sessions from the hand-off queue, runs
//! detection, and forwards whatever is emitted.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};
use ufse_core::{CancellationToken, ForwardOutcome, Forwarder, Pipeline};
use ufse_protocol::Session;

const IDLE_POLL: Duration = Duration::from_millis(100);

/// Runs until every sender of `sessions` is gone, or until `shutdown` is
/// cancelled and the queue is empty. `cancel` aborts in-flight deliveries.
pub fn spawn_pipeline_worker(
    sessions: Receiver<Session>,
    pipeline: Arc<Pipeline>,
    forwarder: Forwarder,
    shutdown: CancellationToken,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    thread::spawn(move || {
        info!("Pipeline worker started");
        loop {
            match sessions.recv_timeout(IDLE_POLL) {
                Ok(session) => {
                    process_session(&session, &pipeline, &forwarder, &cancel);
                }
                Err(RecvTimeoutError::Timeout) if shutdown.is_cancelled() => break,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("Pipeline worker stopped");
    })
}

/// Returns how many incidents were stored (duplicates included).
pub fn process_session(
    session: &Session,
    pipeline: &Pipeline,
    forwarder: &Forwarder,
    cancel: &CancellationToken,
) -> usize {
    let report = pipeline.process(session);
    let mut stored = 0;
    for incident in &report.emitted {
        match forwarder.forward(incident, cancel) {
            ForwardOutcome::Delivered { .. } | ForwardOutcome::Duplicate { .. } => stored += 1,
            ForwardOutcome::Failed { .. } => {}
        }
    }
    debug!(
        session_id = %session.session_id,
        events = session.events.len(),
        emitted = report.emitted.len(),
        stored,
        shadowed = report.shadowed.len(),
        discards = ?report.discards,
        "Completed session processed"
    );
    stored
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use ufse_core::{DetectionConfig, MemorySink, NoopObserver, RetryPolicy};
    use ufse_protocol::{Event, Target};

    fn checkout_session(session_id: &str) -> Session {
        let mut events: Vec<Event> = (0..4)
            .map(|i| {
                Event::new(
                    "click",
                    format!("2026-01-30T12:00:00.{}00Z", i),
                    session_id,
                    "/checkout/pay",
                )
                .with_target(Target::new("button").with_id("submit-btn"))
            })
            .collect();
        events.push(Event::new(
            "error",
            "2026-01-30T12:00:01.500Z",
            session_id,
            "/checkout/pay",
        ));
        Session::from_events(session_id, "project-1", events)
    }

    fn forwarder(sink: Arc<MemorySink>) -> Forwarder {
        Forwarder::new(sink, RetryPolicy::default(), Arc::new(NoopObserver))
    }

    #[test]
    fn worker_forwards_emitted_incidents_until_queue_closes() {
        let pipeline = Arc::new(
            Pipeline::new(DetectionConfig::default(), Arc::new(NoopObserver)).expect("pipeline"),
        );
        let sink = Arc::new(MemorySink::new());
        let (sender, receiver) = mpsc::sync_channel(4);
        let handle = spawn_pipeline_worker(
            receiver,
            pipeline,
            forwarder(Arc::clone(&sink)),
            CancellationToken::new(),
            CancellationToken::new(),
        );

        sender.send(checkout_session("s-1")).expect("send");
        sender.send(checkout_session("s-2")).expect("send");
        drop(sender);
        handle.join().expect("worker");

        let incidents = sink.incidents();
        assert_eq!(incidents.len(), 2);
        assert_eq!(incidents[0].session_id, "s-1");
    }

    #[test]
    fn worker_drains_queue_before_honouring_shutdown() {
        let pipeline = Arc::new(
            Pipeline::new(DetectionConfig::default(), Arc::new(NoopObserver)).expect("pipeline"),
        );
        let sink = Arc::new(MemorySink::new());
        let (sender, receiver) = mpsc::sync_channel(4);
        sender.send(checkout_session("s-1")).expect("send");
        sender.send(checkout_session("s-2")).expect("send");

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let handle = spawn_pipeline_worker(
            receiver,
            pipeline,
            forwarder(Arc::clone(&sink)),
            shutdown,
            CancellationToken::new(),
        );
        handle.join().expect("worker");

        assert_eq!(sink.incidents().len(), 2);
        drop(sender);
    }

    #[test]
    fn replayed_session_is_stored_once() {
        let pipeline =
            Pipeline::new(DetectionConfig::default(), Arc::new(NoopObserver)).expect("pipeline");
        let sink = Arc::new(MemorySink::new());
        let forwarder = forwarder(Arc::clone(&sink));
        let cancel = CancellationToken::new();
        let session = checkout_session("s-1");

        assert_eq!(process_session(&session, &pipeline, &forwarder, &cancel), 1);
        assert_eq!(process_session(&session, &pipeline, &forwarder, &cancel), 1);
        assert_eq!(sink.incidents().len(), 1);
    }
}
