//! Tracker registry and the periodic sweep
//!
//! The factory owns every live [`Tracker`]. Feeders look trackers up with
//! [`TrackerFactory::get_or_create`]; the sweep is the only place trackers
//! leave the registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rewind_core::{GenericPayload, MockKind, MockSpec, Mode, Origin, TestCase, TestCaseWriter};
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::tracker::{ConnId, Tracker};
use crate::protocol::{http, postgres::encode_payload, DecodeError, Protocol};

/// Shared handle to one tracker
pub type TrackerHandle = Arc<Mutex<Tracker>>;

/// Outcome of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Exchanges written to storage
    pub captured: usize,
    /// Finished exchanges that were not written
    pub skipped: usize,
    /// Trackers dropped from the registry
    pub removed: usize,
}

/// Registry of live trackers
pub struct TrackerFactory {
    connections: RwLock<HashMap<ConnId, TrackerHandle>>,
    inactivity_threshold: Duration,
    max_buffer_size: usize,
}

impl TrackerFactory {
    pub fn new(inactivity_threshold: Duration, max_buffer_size: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            inactivity_threshold,
            max_buffer_size,
        }
    }

    /// Get the tracker for a connection, registering a new one if needed
    pub async fn get_or_create(&self, conn_id: ConnId) -> TrackerHandle {
        let mut connections = self.connections.write().await;
        connections
            .entry(conn_id)
            .or_insert_with(|| {
                debug!(conn_id = %conn_id, "Tracking new connection");
                Arc::new(Mutex::new(Tracker::new(conn_id, self.max_buffer_size)))
            })
            .clone()
    }

    /// Number of live trackers
    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Classify every tracker once, persisting finished exchanges in record mode
    ///
    /// Holds the registry lock for the whole pass so no tracker is created or
    /// fed through the registry while the sweep decides.
    pub async fn sweep(&self, mode: Mode, writer: &dyn TestCaseWriter) -> SweepReport {
        let mut connections = self.connections.write().await;
        let mut report = SweepReport::default();
        let mut to_delete = Vec::new();

        for (conn_id, handle) in connections.iter() {
            let tracker = handle.lock().await;

            let finished =
                tracker.is_complete() || tracker.is_quiescent(self.inactivity_threshold);

            if finished {
                to_delete.push(*conn_id);

                if tracker.recv_buffer().is_empty() || tracker.sent_buffer().is_empty() {
                    continue;
                }

                let test_case = match build_test_case(&tracker) {
                    Ok(test_case) => test_case,
                    Err(e) => {
                        error!(conn_id = %conn_id, error = %e, "Failed to decode captured exchange");
                        report.skipped += 1;
                        continue;
                    }
                };

                match mode {
                    Mode::Record => {
                        debug!(conn_id = %conn_id, kind = %test_case.kind, "Capturing exchange in record mode");
                        match writer.write_test_case(&test_case) {
                            Ok(()) => report.captured += 1,
                            Err(e) => {
                                error!(conn_id = %conn_id, error = %e, "Failed to record exchange");
                                report.skipped += 1;
                            }
                        }
                    }
                    Mode::Test => {
                        debug!(conn_id = %conn_id, "Skipping tracker in test mode");
                        report.skipped += 1;
                    }
                    Mode::Unset => {
                        warn!(conn_id = %conn_id, mode = %mode, "Mode is not record or test, skipping tracker");
                        report.skipped += 1;
                    }
                }
            } else if tracker.is_malformed() || tracker.is_inactive(self.inactivity_threshold) {
                debug!(conn_id = %conn_id, "Dropping malformed or inactive tracker");
                to_delete.push(*conn_id);
            }
        }

        for conn_id in &to_delete {
            connections.remove(conn_id);
        }
        report.removed = to_delete.len();

        report
    }
}

/// Turn a finished tracker into a test case
pub fn build_test_case(tracker: &Tracker) -> Result<TestCase, DecodeError> {
    match tracker.protocol() {
        Protocol::Http1 => {
            let request = http::parse_request(tracker.recv_buffer())?;
            let response = http::parse_response(tracker.sent_buffer())?;
            Ok(TestCase::new(
                MockKind::Http,
                MockSpec::Http { request, response },
            ))
        }
        Protocol::PostgreSQL | Protocol::Unknown => {
            let spec = MockSpec::Generic {
                requests: vec![GenericPayload::single(
                    Origin::Client,
                    encode_payload(tracker.recv_buffer()),
                )],
                responses: vec![GenericPayload::single(
                    Origin::Server,
                    encode_payload(tracker.sent_buffer()),
                )],
            };
            Ok(TestCase::new(MockKind::Generic, spec))
        }
    }
}

/// Sweep on a fixed interval until `shutdown_rx` fires
pub async fn run_sweeper(
    factory: Arc<TrackerFactory>,
    mode: Mode,
    writer: Arc<dyn TestCaseWriter>,
    interval: Duration,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    info!(mode = %mode, interval_ms = interval.as_millis() as u64, "Sweeper started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = factory.sweep(mode, writer.as_ref()).await;
                if report.removed > 0 {
                    debug!(
                        captured = report.captured,
                        skipped = report.skipped,
                        removed = report.removed,
                        "Sweep finished"
                    );
                }
            }
            _ = &mut shutdown_rx => {
                debug!("Sweeper shutdown requested");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::postgres::tests::tagged;
    use rewind_core::PersistenceError;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MemoryWriter {
        cases: StdMutex<Vec<TestCase>>,
        fail: bool,
    }

    impl TestCaseWriter for MemoryWriter {
        fn write_test_case(&self, test_case: &TestCase) -> Result<(), PersistenceError> {
            if self.fail {
                return Err(PersistenceError::Rejected("disk full".to_string()));
            }
            self.cases.lock().unwrap().push(test_case.clone());
            Ok(())
        }
    }

    fn factory() -> TrackerFactory {
        TrackerFactory::new(Duration::from_secs(5), 1024)
    }

    async fn feed_http(factory: &TrackerFactory, id: u64) {
        let handle = factory.get_or_create(ConnId::Raw(id)).await;
        let mut t = handle.lock().await;
        t.append_received(b"GET /users?id=1 HTTP/1.1\r\nHost: svc\r\n\r\n");
        t.append_sent(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n{}");
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_tracker() {
        let factory = factory();
        let a = factory.get_or_create(ConnId::Raw(1)).await;
        let b = factory.get_or_create(ConnId::Raw(1)).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.len().await, 1);

        factory.get_or_create(ConnId::Raw(2)).await;
        assert_eq!(factory.len().await, 2);
    }

    #[tokio::test]
    async fn test_record_sweep_captures_http() {
        let factory = factory();
        let writer = MemoryWriter::default();
        feed_http(&factory, 1).await;

        let report = factory.sweep(Mode::Record, &writer).await;
        assert_eq!(
            report,
            SweepReport {
                captured: 1,
                skipped: 0,
                removed: 1
            }
        );
        assert!(factory.is_empty().await);

        let cases = writer.cases.lock().unwrap();
        assert_eq!(cases[0].kind, MockKind::Http);
        match &cases[0].spec {
            MockSpec::Http { request, response } => {
                assert_eq!(request.url, "http://svc/users?id=1");
                assert_eq!(response.status_code, 200);
                assert_eq!(response.body, "{}");
            }
            other => panic!("unexpected spec {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_test_mode_writes_nothing() {
        let factory = factory();
        let writer = MemoryWriter::default();
        feed_http(&factory, 1).await;

        let report = factory.sweep(Mode::Test, &writer).await;
        assert_eq!(report.skipped, 1);
        assert_eq!(report.removed, 1);
        assert!(writer.cases.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unset_mode_skips() {
        let factory = factory();
        let writer = MemoryWriter::default();
        feed_http(&factory, 1).await;

        let report = factory.sweep(Mode::Unset, &writer).await;
        assert_eq!(report.captured, 0);
        assert_eq!(report.removed, 1);
    }

    #[tokio::test]
    async fn test_persistence_failure_still_removes() {
        let factory = factory();
        let writer = MemoryWriter {
            fail: true,
            ..Default::default()
        };
        feed_http(&factory, 1).await;
        feed_http(&factory, 2).await;

        let report = factory.sweep(Mode::Record, &writer).await;
        assert_eq!(report.captured, 0);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.removed, 2);
        assert!(factory.is_empty().await);
    }

    #[tokio::test]
    async fn test_in_progress_tracker_survives_sweep() {
        let factory = factory();
        let writer = MemoryWriter::default();
        let handle = factory.get_or_create(ConnId::Raw(1)).await;
        handle
            .lock()
            .await
            .append_received(b"GET / HTTP/1.1\r\nHost: svc\r\n\r\n");

        let report = factory.sweep(Mode::Record, &writer).await;
        assert_eq!(report, SweepReport::default());
        assert_eq!(factory.len().await, 1);
    }

    #[tokio::test]
    async fn test_malformed_tracker_removed_without_capture() {
        let factory = factory();
        let writer = MemoryWriter::default();
        let handle = factory.get_or_create(ConnId::Raw(1)).await;
        {
            let mut t = handle.lock().await;
            t.append_received(&tagged(b'Q', b"SELECT 1\0"));
            t.append_sent(&[b'Z', 0, 0, 0, 1, b'I']);
        }

        let report = factory.sweep(Mode::Record, &writer).await;
        assert_eq!(report.removed, 1);
        assert_eq!(report.captured, 0);
        assert!(writer.cases.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hostile_chunk_size_does_not_stop_sweep() {
        let factory = factory();
        let writer = MemoryWriter::default();
        {
            let handle = factory.get_or_create(ConnId::Raw(1)).await;
            let mut t = handle.lock().await;
            t.append_received(b"GET / HTTP/1.1\r\nHost: svc\r\n\r\n");
            t.append_sent(
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\nabc",
            );
        }
        feed_http(&factory, 2).await;

        let report = factory.sweep(Mode::Record, &writer).await;
        assert_eq!(report.captured, 1);
        assert_eq!(factory.len().await, 1);
    }

    #[tokio::test]
    async fn test_postgres_capture_is_generic() {
        let factory = factory();
        let writer = MemoryWriter::default();
        let query = tagged(b'Q', b"SELECT 1\0");
        let ready = tagged(b'Z', b"I");
        {
            let handle = factory.get_or_create(ConnId::Raw(9)).await;
            let mut t = handle.lock().await;
            t.append_received(&query);
            t.append_sent(&ready);
        }

        factory.sweep(Mode::Record, &writer).await;
        let cases = writer.cases.lock().unwrap();
        match &cases[0].spec {
            MockSpec::Generic {
                requests,
                responses,
            } => {
                assert_eq!(requests[0].origin, Origin::Client);
                assert_eq!(requests[0].first_data(), Some(encode_payload(&query).as_str()));
                assert_eq!(responses[0].first_data(), Some(encode_payload(&ready).as_str()));
            }
            other => panic!("unexpected spec {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactive_trackers_are_collected() {
        let factory = factory();
        let writer = MemoryWriter::default();

        // Request only: dropped once inactive
        let half = factory.get_or_create(ConnId::Raw(1)).await;
        half.lock().await.append_received(b"\x01\x02\x03");

        // Both sides of an unframed stream: captured once quiescent
        let both = factory.get_or_create(ConnId::Raw(2)).await;
        {
            let mut t = both.lock().await;
            t.append_received(b"\x01\x02\x03");
            t.append_sent(b"\x04\x05");
        }

        assert_eq!(factory.sweep(Mode::Record, &writer).await.removed, 0);

        tokio::time::advance(Duration::from_secs(6)).await;
        let report = factory.sweep(Mode::Record, &writer).await;
        assert_eq!(report.removed, 2);
        assert_eq!(report.captured, 1);
        assert_eq!(writer.cases.lock().unwrap()[0].kind, MockKind::Generic);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_sweeper_stops_on_shutdown() {
        let factory = Arc::new(factory());
        feed_http(&factory, 1).await;
        let writer = Arc::new(MemoryWriter::default());

        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(run_sweeper(
            factory.clone(),
            Mode::Record,
            writer.clone(),
            Duration::from_millis(100),
            rx,
        ));

        tokio::time::sleep(Duration::from_millis(250)).await;
        tx.send(()).unwrap();
        task.await.unwrap();

        assert!(factory.is_empty().await);
        assert_eq!(writer.cases.lock().unwrap().len(), 1);
    }
}
