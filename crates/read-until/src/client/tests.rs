use super::*;
use crate::{
    ActionAck, ActionOutcome, ChunkStats, InboundMessage, InboundSource, OutboundMessage,
    OutboundSink, ReconnectPolicy,
};
use bytes::Bytes;
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;

type Inbound = Result<Option<InboundMessage>>;

/// In-memory transport. Each successful connect hands the test a
/// [`ServerSide`] to script the session with.
struct MockTransport {
    failing_connects: Arc<AtomicUsize>,
    connects: Arc<AtomicUsize>,
    stall_actions: Arc<AtomicBool>,
    sessions: mpsc::UnboundedSender<ServerSide>,
}

struct ServerSide {
    inbound: mpsc::UnboundedSender<Inbound>,
    outbound: mpsc::UnboundedReceiver<OutboundMessage>,
}

struct MockSink {
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    /// Holds every action batch for [`STALL`] before delivering it.
    stall_actions: Arc<AtomicBool>,
}

const STALL: Duration = Duration::from_secs(10);
struct MockSource(mpsc::UnboundedReceiver<Inbound>);

impl Transport for MockTransport {
    type Sink = MockSink;
    type Source = MockSource;

    async fn connect(&self) -> Result<(MockSink, MockSource)> {
        self.connects.fetch_add(1, Ordering::Relaxed);
        let failing = self
            .failing_connects
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(Error::Transport {
                context: "connection refused".to_string(),
            });
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let _ = self.sessions.send(ServerSide {
            inbound: inbound_tx,
            outbound: outbound_rx,
        });
        let sink = MockSink {
            outbound: outbound_tx,
            stall_actions: Arc::clone(&self.stall_actions),
        };
        Ok((sink, MockSource(inbound_rx)))
    }
}

impl OutboundSink for MockSink {
    async fn send(&mut self, message: OutboundMessage) -> Result<()> {
        let stalled = self.stall_actions.load(Ordering::Relaxed);
        if stalled && matches!(message, OutboundMessage::Actions(_)) {
            tokio::time::sleep(STALL).await;
        }
        self.outbound.send(message).map_err(|_| Error::Transport {
            context: "server went away".to_string(),
        })
    }
}

impl InboundSource for MockSource {
    async fn receive(&mut self) -> Result<Option<InboundMessage>> {
        // A dropped server side reads as a closed stream.
        self.0.recv().await.unwrap_or(Ok(None))
    }
}

struct Harness {
    client: Client<MockTransport>,
    sessions: mpsc::UnboundedReceiver<ServerSide>,
    failing_connects: Arc<AtomicUsize>,
    connects: Arc<AtomicUsize>,
    stall_actions: Arc<AtomicBool>,
}

impl Harness {
    fn new(config: ClientConfig) -> Self {
        let (tx, sessions) = mpsc::unbounded_channel();
        let failing_connects = Arc::new(AtomicUsize::new(0));
        let connects = Arc::new(AtomicUsize::new(0));
        let stall_actions = Arc::new(AtomicBool::new(false));
        let transport = MockTransport {
            failing_connects: Arc::clone(&failing_connects),
            connects: Arc::clone(&connects),
            stall_actions: Arc::clone(&stall_actions),
            sessions: tx,
        };
        Self {
            client: Client::new(config, transport).unwrap(),
            sessions,
            failing_connects,
            connects,
            stall_actions,
        }
    }

    async fn next_session(&mut self) -> ServerSide {
        tokio::time::timeout(Duration::from_secs(30), self.sessions.recv())
            .await
            .expect("no session within the timeout")
            .expect("transport dropped")
    }

    /// Starts the client and consumes the initial setup.
    async fn started(&mut self) -> ServerSide {
        self.client.start().unwrap();
        let mut server = self.next_session().await;
        assert!(matches!(server.next().await, OutboundMessage::Setup(_)));
        server
    }
}

impl ServerSide {
    async fn next(&mut self) -> OutboundMessage {
        tokio::time::timeout(Duration::from_secs(30), self.outbound.recv())
            .await
            .expect("no outbound message within the timeout")
            .expect("client closed the stream")
    }

    fn push(&self, message: InboundMessage) {
        self.inbound.send(Ok(Some(message))).unwrap();
    }

    fn fail(&self, error: Error) {
        self.inbound.send(Err(error)).unwrap();
    }
}

fn unit(channel: ChannelId, item: &str, number: u32, classes: &[i32]) -> WorkUnit {
    WorkUnit {
        channel,
        item_id: item.to_string(),
        item_number: number,
        sequence: 100,
        payload: Bytes::from_static(b"signal"),
        start_sample: 50,
        chunk_start_sample: 100,
        chunk_length: 6,
        stats: ChunkStats {
            median_before: 200.0,
            median: 90.0,
            classifications: classes.to_vec(),
        },
    }
}

fn chunks(units: Vec<WorkUnit>) -> InboundMessage {
    InboundMessage {
        samples_since_start: 4_000,
        seconds_since_start: 1.0,
        units: units.into_iter().map(|u| (u.channel, u)).collect(),
        acks: Vec::new(),
    }
}

fn acks(acks: Vec<ActionAck>) -> InboundMessage {
    InboundMessage {
        acks,
        ..InboundMessage::default()
    }
}

/// Polls `check` on the paused clock until it holds.
async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

fn quiet() -> ClientConfig {
    // No cadence-driven dispatch unless a test asks for it.
    ClientConfig {
        dispatch_interval: Duration::from_secs(3600),
        batch_threshold: 1,
        ..ClientConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn setup_is_sent_first_and_units_reach_the_cache() {
    let mut h = Harness::new(quiet());
    h.client.start().unwrap();
    let mut server = h.next_session().await;

    assert_eq!(
        server.next().await,
        OutboundMessage::Setup(StreamSetup::default())
    );
    assert!(h.client.is_running());
    assert_eq!(h.client.state(), StreamState::Streaming);

    server.push(chunks(vec![unit(1, "r1", 1, &[]), unit(2, "r2", 1, &[])]));
    eventually(|| h.client.metrics().chunks_received == 2).await;

    let mut units = h.client.get_units();
    units.sort_by_key(|(c, _)| *c);
    assert_eq!(
        units.iter().map(|(c, u)| (*c, u.item_id.as_str())).collect::<Vec<_>>(),
        vec![(1, "r1"), (2, "r2")]
    );
    assert!(h.client.get_units().is_empty());

    let metrics = h.client.metrics();
    assert_eq!(metrics.samples_since_start, 4_000);
    assert_eq!(metrics.cache_occupancy, 0);
}

#[tokio::test(start_paused = true)]
async fn newer_item_supersedes_unconsumed_one() {
    let mut h = Harness::new(quiet());
    let server = h.started().await;

    server.push(chunks(vec![unit(7, "r1", 1, &[])]));
    server.push(chunks(vec![unit(7, "r1", 1, &[])]));
    server.push(chunks(vec![unit(7, "r2", 2, &[])]));
    eventually(|| h.client.metrics().chunks_received == 3).await;

    let units = h.client.get_units();
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].1.item_id, "r2");

    let cache = h.client.metrics().cache;
    assert_eq!(cache.missed, 1);
    assert_eq!(cache.replaced, 1);
}

#[tokio::test(start_paused = true)]
async fn acknowledgment_resolves_the_ticket() {
    let mut h = Harness::new(quiet());
    let mut server = h.started().await;

    let ticket = h.client.stop_receiving(3, 42_u32).unwrap();
    let OutboundMessage::Actions(batch) = server.next().await else {
        panic!("expected an action batch");
    };
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].correlation_id, ticket.id());
    assert_eq!(batch[0].channel, 3);
    assert_eq!(batch[0].target, ActionTarget::Number(42));
    assert_eq!(batch[0].kind, ActionKind::StopFurtherData);

    server.push(acks(vec![ActionAck {
        correlation_id: ticket.id(),
        outcome: ActionOutcome::Success,
    }]));
    assert_eq!(ticket.outcome().await, ActionOutcome::Success);
    assert_eq!(h.client.metrics().actions.acknowledged, 1);
}

#[tokio::test(start_paused = true)]
async fn cadence_batches_actions_in_fifo_order() {
    let mut h = Harness::new(ClientConfig {
        dispatch_interval: Duration::from_millis(10),
        batch_threshold: 1_000,
        max_batch_size: 2,
        ..ClientConfig::default()
    });
    let mut server = h.started().await;

    let ids = [1, 2, 1]
        .into_iter()
        .map(|channel| h.client.stop_receiving(channel, 1_u32).unwrap().id())
        .collect::<Vec<_>>();

    let mut sent = Vec::new();
    while sent.len() < ids.len() {
        let OutboundMessage::Actions(batch) = server.next().await else {
            panic!("expected an action batch");
        };
        assert!(batch.len() <= 2);
        sent.extend(batch.into_iter().map(|r| r.correlation_id));
    }
    assert_eq!(sent, ids);
}

#[tokio::test]
async fn actions_require_a_running_session() {
    let h = Harness::new(quiet());
    assert_eq!(
        h.client
            .unblock(1, "item", Duration::from_millis(100))
            .unwrap_err(),
        Error::NotRunning
    );
}

#[test]
fn start_outside_a_runtime_fails() {
    let h = Harness::new(quiet());
    assert_eq!(h.client.start(), Err(Error::NoRuntime));
    assert!(!h.client.is_running());
}

#[tokio::test(start_paused = true)]
async fn start_is_idempotent() {
    let mut h = Harness::new(quiet());
    let _server = h.started().await;
    h.client.start().unwrap();
    h.client.start().unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.connects.load(Ordering::Relaxed), 1);
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_actions_time_out() {
    let mut h = Harness::new(ClientConfig {
        action_timeout: Duration::from_millis(200),
        sweep_interval: Duration::from_millis(20),
        ..quiet()
    });
    let mut server = h.started().await;

    let ticket = h.client.unblock(5, 9_u32, Duration::from_millis(100)).unwrap();
    assert!(matches!(server.next().await, OutboundMessage::Actions(_)));

    // The server keeps streaming but never acknowledges.
    server.push(chunks(vec![unit(5, "r1", 9, &[])]));

    let outcome = tokio::time::timeout(Duration::from_secs(1), ticket.outcome())
        .await
        .expect("sweeper should resolve the action");
    assert_eq!(outcome, ActionOutcome::Unacknowledged);
    assert_eq!(h.client.metrics().actions.timed_out, 1);
}

#[tokio::test(start_paused = true)]
async fn reconnects_after_a_transport_error() {
    let mut h = Harness::new(quiet());
    let first = h.started().await;

    first.fail(Error::Transport {
        context: "reset by peer".to_string(),
    });

    let mut second = h.next_session().await;
    assert!(matches!(second.next().await, OutboundMessage::Setup(_)));
    assert_eq!(h.client.metrics().reconnects, 1);
    assert_eq!(h.client.state(), StreamState::Streaming);
    assert!(h.client.fatal_error().is_none());

    second.push(chunks(vec![unit(1, "r1", 1, &[])]));
    eventually(|| h.client.metrics().chunks_received == 1).await;
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_close_the_session() {
    let h = Harness::new(ClientConfig {
        reconnect: ReconnectPolicy {
            max_retries: 2,
            ..ReconnectPolicy::default()
        },
        ..quiet()
    });
    h.failing_connects.store(usize::MAX, Ordering::Relaxed);
    h.client.start().unwrap();

    let mut state = h.client.subscribe_state();
    tokio::time::timeout(
        Duration::from_secs(30),
        state.wait_for(|s| s.is_terminal()),
    )
    .await
    .expect("session should close")
    .unwrap();

    assert!(!h.client.is_running());
    assert!(matches!(
        h.client.fatal_error(),
        Some(Error::FatalTransport { attempts: 3, .. })
    ));
    assert_eq!(h.connects.load(Ordering::Relaxed), 3);
    assert_eq!(h.client.request_action(1, 1_u32, ActionKind::StopFurtherData).unwrap_err(), Error::NotRunning);
}

#[tokio::test(start_paused = true)]
async fn protocol_violation_is_fatal() {
    let mut h = Harness::new(quiet());
    let mut server = h.started().await;

    let ticket = h.client.stop_receiving(1, 1_u32).unwrap();
    assert!(matches!(server.next().await, OutboundMessage::Actions(_)));

    server.fail(Error::Protocol {
        reason: "unknown action response 7".to_string(),
    });

    assert_eq!(ticket.outcome().await, ActionOutcome::Cancelled);
    eventually(|| h.client.state() == StreamState::Closed).await;
    assert!(matches!(
        h.client.fatal_error(),
        Some(Error::FatalTransport { attempts: 1, .. })
    ));
    assert_eq!(h.connects.load(Ordering::Relaxed), 1);
}

#[tokio::test(start_paused = true)]
async fn stop_flushes_pending_actions_then_cancels_them() {
    let mut h = Harness::new(ClientConfig {
        batch_threshold: 1_000,
        ..quiet()
    });
    let mut server = h.started().await;

    let ticket = h.client.stop_receiving(2, 8_u32).unwrap();
    assert_eq!(h.client.metrics().actions.pending, 1);

    assert_eq!(h.client.stop(Duration::from_secs(1)).await, StopOutcome::Clean);

    let OutboundMessage::Actions(batch) = server.next().await else {
        panic!("pending actions should be flushed on stop");
    };
    assert_eq!(batch[0].correlation_id, ticket.id());
    assert_eq!(ticket.outcome().await, ActionOutcome::Cancelled);

    assert_eq!(h.client.state(), StreamState::Closed);
    assert!(!h.client.is_running());
    assert!(h.client.fatal_error().is_none());
    assert_eq!(h.client.stop(Duration::from_secs(1)).await, StopOutcome::NotRunning);
}

#[tokio::test(start_paused = true)]
async fn stop_without_drain_sends_nothing() {
    let mut h = Harness::new(ClientConfig {
        batch_threshold: 1_000,
        drain_on_stop: false,
        ..quiet()
    });
    let mut server = h.started().await;

    let ticket = h.client.stop_receiving(2, 8_u32).unwrap();
    assert_eq!(h.client.stop(Duration::from_secs(1)).await, StopOutcome::Clean);

    assert!(server.outbound.recv().await.is_none());
    assert_eq!(ticket.outcome().await, ActionOutcome::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn client_can_restart_after_stop() {
    let mut h = Harness::new(quiet());
    let server = h.started().await;
    server.push(chunks(vec![unit(1, "r1", 1, &[])]));
    eventually(|| h.client.metrics().cache_occupancy == 1).await;

    h.client.stop(Duration::from_secs(1)).await;
    let _server = h.started().await;

    // Stale data from the previous session is gone.
    assert!(h.client.get_units().is_empty());
    assert!(h.client.is_running());
}

#[tokio::test(start_paused = true)]
async fn one_chunk_mode_stops_each_new_item() {
    let mut h = Harness::new(ClientConfig {
        one_chunk: true,
        ..quiet()
    });
    let mut server = h.started().await;

    server.push(chunks(vec![unit(3, "r1", 5, &[])]));
    let OutboundMessage::Actions(batch) = server.next().await else {
        panic!("expected a stop action");
    };
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].channel, 3);
    assert_eq!(batch[0].target, ActionTarget::Number(5));
    assert_eq!(batch[0].kind, ActionKind::StopFurtherData);

    eventually(|| h.client.metrics().cache_occupancy == 1).await;
    assert_eq!(h.client.get_units().len(), 1);

    // The stop was not enacted in time: the item must not come back.
    server.push(chunks(vec![unit(3, "r1", 5, &[])]));
    eventually(|| h.client.metrics().chunks_filtered == 1).await;
    assert!(h.client.get_units().is_empty());
}

#[tokio::test(start_paused = true)]
async fn prefilter_keeps_only_listed_classes() {
    let config = quiet().with_prefilter_names(["strand"]).unwrap();
    let mut h = Harness::new(config);
    let server = h.started().await;

    server.push(chunks(vec![unit(1, "r1", 1, &[83]), unit(2, "r2", 1, &[80])]));
    eventually(|| h.client.metrics().chunks_received == 2).await;

    let units = h.client.get_units();
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].0, 1);
    assert_eq!(h.client.metrics().chunks_filtered, 1);
}

#[tokio::test(start_paused = true)]
async fn out_of_range_chunks_are_counted_and_dropped() {
    let mut h = Harness::new(ClientConfig {
        setup: StreamSetup {
            first_channel: 1,
            last_channel: 4,
            ..StreamSetup::default()
        },
        ..quiet()
    });
    let server = h.started().await;

    server.push(chunks(vec![unit(9, "r1", 1, &[])]));
    eventually(|| h.client.metrics().cache.out_of_range == 1).await;
    assert!(h.client.get_units().is_empty());
    assert!(h.client.is_running());
}

#[tokio::test(start_paused = true)]
async fn reconfigure_resends_setup() {
    let mut h = Harness::new(quiet());
    let mut server = h.started().await;

    let narrower = StreamSetup {
        first_channel: 1,
        last_channel: 4,
        ..StreamSetup::default()
    };
    h.client.reconfigure(narrower.clone()).unwrap();
    assert_eq!(server.next().await, OutboundMessage::Setup(narrower));

    let wider = StreamSetup {
        first_channel: 1,
        last_channel: 1024,
        ..StreamSetup::default()
    };
    assert!(matches!(
        h.client.reconfigure(wider),
        Err(Error::InvalidConfig { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn forced_stop_tears_down_the_session() {
    let mut h = Harness::new(quiet());
    h.stall_actions.store(true, Ordering::Relaxed);
    let mut server = h.started().await;

    let ticket = h.client.stop_receiving(1, 5_u32).unwrap();
    eventually(|| h.client.metrics().actions.outstanding == 1).await;

    assert_eq!(
        h.client.stop(Duration::from_secs(1)).await,
        StopOutcome::Forced
    );
    assert_eq!(h.client.state(), StreamState::Closed);
    assert_eq!(ticket.outcome().await, ActionOutcome::Cancelled);

    // The stalled send never completes: the sink went away with the session.
    let closed = tokio::time::timeout(Duration::from_secs(30), server.outbound.recv()).await;
    assert!(matches!(closed, Ok(None)));

    tokio::time::sleep(STALL * 2).await;
    assert_eq!(h.client.state(), StreamState::Closed);
    assert!(!h.client.is_running());
}

#[tokio::test(start_paused = true)]
async fn start_is_refused_while_a_stop_is_in_progress() {
    let mut h = Harness::new(quiet());
    h.stall_actions.store(true, Ordering::Relaxed);
    let _server = h.started().await;

    h.client.stop_receiving(1, 5_u32).unwrap();
    eventually(|| h.client.metrics().actions.outstanding == 1).await;

    let client = &h.client;
    let (outcome, (restart, action)) = tokio::join!(client.stop(Duration::from_secs(1)), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let restart = client.start();
        let action = client
            .request_action(2, 5_u32, ActionKind::StopFurtherData)
            .map(|_| ());
        (restart, action)
    });

    assert_eq!(outcome, StopOutcome::Forced);
    assert_eq!(restart, Err(Error::Stopping));
    assert_eq!(action, Err(Error::NotRunning));
    assert!(!h.client.is_running());
    assert_eq!(h.client.state(), StreamState::Closed);
    assert_eq!(h.client.metrics().actions.cancelled, 1);

    // Once the stop has finished the client starts cleanly again.
    h.stall_actions.store(false, Ordering::Relaxed);
    let mut server = h.started().await;
    assert!(h.client.is_running());
    assert_eq!(h.client.state(), StreamState::Streaming);

    let ticket = h.client.stop_receiving(3, 7_u32).unwrap();
    let OutboundMessage::Actions(batch) = server.next().await else {
        panic!("expected an action batch");
    };
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].correlation_id, ticket.id());
}

#[tokio::test(start_paused = true)]
async fn concurrent_stop_leaves_the_session_to_the_first_caller() {
    let mut h = Harness::new(quiet());
    h.stall_actions.store(true, Ordering::Relaxed);
    let _server = h.started().await;

    h.client.stop_receiving(1, 5_u32).unwrap();
    eventually(|| h.client.metrics().actions.outstanding == 1).await;

    let client = &h.client;
    let (first, second) = tokio::join!(client.stop(Duration::from_secs(1)), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.stop(Duration::from_secs(1)).await
    });
    assert_eq!(first, StopOutcome::Forced);
    assert_eq!(second, StopOutcome::NotRunning);
    assert_eq!(h.client.state(), StreamState::Closed);
}

#[tokio::test(start_paused = true)]
async fn get_units_batch_leaves_the_rest_cached() {
    let mut h = Harness::new(quiet());
    let server = h.started().await;

    server.push(chunks(vec![unit(1, "r1", 1, &[])]));
    eventually(|| h.client.metrics().chunks_received == 1).await;
    server.push(chunks(vec![unit(2, "r2", 1, &[])]));
    eventually(|| h.client.metrics().chunks_received == 2).await;
    server.push(chunks(vec![unit(3, "r3", 1, &[])]));
    eventually(|| h.client.metrics().chunks_received == 3).await;

    let newest = h.client.get_units_batch(1, PopOrder::Newest);
    assert_eq!(newest.iter().map(|(c, _)| *c).collect::<Vec<_>>(), vec![3]);

    let oldest = h.client.get_units_batch(1, PopOrder::Oldest);
    assert_eq!(oldest.iter().map(|(c, _)| *c).collect::<Vec<_>>(), vec![1]);

    let rest = h.client.get_units();
    assert_eq!(rest.iter().map(|(c, _)| *c).collect::<Vec<_>>(), vec![2]);
}
