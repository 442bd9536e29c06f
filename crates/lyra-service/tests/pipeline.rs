// End-to-end scenarios for the service core, driven against the mock
// controller with a virtual clock. The core is a plain state machine, so
// no runtime is needed: tests call the entry points directly and complete
// handler futures by token, in whatever order the scenario calls for.
use std::sync::Arc;
use std::time::Duration;

use lyra_service::test_support::{
    ManualClock, MetricEvent, MockController, MockControllerState, RecordingSink,
};
use lyra_service::{
    Admission, CloseCause, FatalError, RequestError, RequestHandler, RequestToken,
    ResponseFuture, ServiceConfig, ServiceServer,
};

/// Handler scripted by request prefix: `hang:` never completes on its own,
/// `fail:` fails synchronously, anything else echoes synchronously.
struct ScenarioHandler;

impl RequestHandler for ScenarioHandler {
    type Request = String;
    type Response = String;

    fn process_request(&mut self, request: &String) -> ResponseFuture<String> {
        if request.starts_with("hang:") {
            Box::pin(std::future::pending())
        } else if request.starts_with("fail:") {
            Box::pin(std::future::ready(Err(format!("boom: {request}").into())))
        } else {
            let response = format!("re:{request}");
            Box::pin(std::future::ready(Ok(response)))
        }
    }

    fn process_failure(&mut self, request: &String, error: &RequestError) -> String {
        format!("err:{}:{request}", error.class())
    }
}

type TestServer = ServiceServer<ScenarioHandler, MockController<String>>;

struct Harness {
    server: TestServer,
    controller: Arc<MockControllerState<String>>,
    sink: Arc<RecordingSink>,
    clock: Arc<ManualClock>,
}

fn harness(config: ServiceConfig<String, String>) -> Harness {
    let controller = MockController::new();
    let state = controller.state();
    let sink = Arc::new(RecordingSink::new());
    let clock = Arc::new(ManualClock::new());
    let server = ServiceServer::new(config, ScenarioHandler, controller)
        .with_clock(clock.clone())
        .with_metrics_sink(sink.clone());
    Harness {
        server,
        controller: state,
        sink,
        clock,
    }
}

fn config() -> ServiceConfig<String, String> {
    ServiceConfig::new("test")
}

fn admit(server: &mut TestServer, request: &str) -> Admission<String> {
    server
        .process_message(request.to_string())
        .expect("admission")
}

fn admit_in_flight(server: &mut TestServer, request: &str) -> RequestToken {
    match admit(server, request) {
        Admission::InFlight { token, .. } => token,
        Admission::Settled => panic!("expected {request} to stay in flight"),
    }
}

#[test]
fn responses_keep_arrival_order_under_out_of_order_completion() {
    let mut h = harness(config());
    let t1 = admit_in_flight(&mut h.server, "hang:r1");
    let t2 = admit_in_flight(&mut h.server, "hang:r2");
    let t3 = admit_in_flight(&mut h.server, "hang:r3");

    // Complete in order r3, r1, r2; the wire must still see r1, r2, r3.
    h.server.complete(t3, Ok("r3".to_string())).expect("complete");
    assert_eq!(h.controller.push_count(), 0);
    h.server.complete(t1, Ok("r1".to_string())).expect("complete");
    assert_eq!(h.controller.pushes(), vec!["r1".to_string()]);
    h.server.complete(t2, Ok("r2".to_string())).expect("complete");
    assert_eq!(
        h.controller.pushes(),
        vec!["r1".to_string(), "r2".to_string(), "r3".to_string()]
    );
}

#[test]
fn arbitrary_completion_permutation_preserves_order() {
    let mut h = harness(config());
    let tokens: Vec<RequestToken> = (0..5)
        .map(|i| admit_in_flight(&mut h.server, &format!("hang:{i}")))
        .collect();
    for &i in &[3usize, 1, 4, 0, 2] {
        h.server
            .complete(tokens[i], Ok(format!("r{i}")))
            .expect("complete");
    }
    assert_eq!(
        h.controller.pushes(),
        vec!["r0", "r1", "r2", "r3", "r4"]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>()
    );
}

#[test]
fn backpressure_pauses_and_write_success_resumes() {
    let mut h = harness(config());
    assert!(matches!(admit(&mut h.server, "a"), Admission::Settled));
    assert_eq!(h.controller.pushes(), vec!["re:a".to_string()]);

    h.controller.set_can_push(false);
    assert!(matches!(admit(&mut h.server, "b"), Admission::Settled));
    assert!(h.server.is_drain_paused());
    assert_eq!(h.controller.push_count(), 1);

    // The write-completed notification for "a" reopens the output buffer.
    h.controller.set_can_push(true);
    h.server.write_completed(Ok(())).expect("write completed");
    assert!(!h.server.is_drain_paused());
    assert_eq!(
        h.controller.pushes(),
        vec!["re:a".to_string(), "re:b".to_string()]
    );
}

#[test]
fn head_timeout_is_swept_and_later_entries_survive() {
    let mut h = harness(config().with_request_timeout(Some(Duration::from_millis(100))));
    let t1 = admit_in_flight(&mut h.server, "hang:r1");
    h.clock.set(50);
    let t2 = admit_in_flight(&mut h.server, "hang:r2");

    h.clock.set(150);
    h.server.idle_check().expect("idle check");
    // r1 aged 150ms and expires; r2 aged exactly 100ms does not.
    assert_eq!(h.controller.pushes(), vec!["err:timeout:hang:r1".to_string()]);
    assert_eq!(h.sink.rate_total_tagged("test_errors", "class", "timeout"), 1);

    h.clock.set(200);
    h.server.complete(t2, Ok("r2".to_string())).expect("complete");
    assert_eq!(
        h.controller.pushes(),
        vec!["err:timeout:hang:r1".to_string(), "r2".to_string()]
    );

    // The timed-out handler may still complete later; it finds nothing.
    h.server.complete(t1, Ok("late".to_string())).expect("complete");
    assert_eq!(h.controller.push_count(), 2);
}

#[test]
fn adjacent_timeouts_drain_in_one_sweep() {
    let mut h = harness(config().with_request_timeout(Some(Duration::from_millis(100))));
    admit_in_flight(&mut h.server, "hang:a");
    admit_in_flight(&mut h.server, "hang:b");
    h.clock.set(500);
    h.server.idle_check().expect("idle check");
    assert_eq!(
        h.controller.pushes(),
        vec![
            "err:timeout:hang:a".to_string(),
            "err:timeout:hang:b".to_string()
        ]
    );
}

#[test]
fn idle_check_without_expired_entries_is_a_no_op() {
    let mut h = harness(config().with_request_timeout(Some(Duration::from_millis(100))));
    admit_in_flight(&mut h.server, "hang:a");
    h.clock.set(50);
    h.server.idle_check().expect("idle check");
    assert_eq!(h.controller.push_count(), 0);
    assert_eq!(h.sink.rate_total("test_errors"), 0);
    assert_eq!(h.server.pending_len(), 1);
}

#[test]
fn infinite_timeout_never_expires() {
    let mut h = harness(config().with_request_timeout(None));
    admit_in_flight(&mut h.server, "hang:a");
    h.clock.set(1_000_000);
    h.server.idle_check().expect("idle check");
    assert_eq!(h.controller.push_count(), 0);
    assert_eq!(h.sink.rate_total("test_errors"), 0);
}

#[test]
fn overflow_is_rejected_but_emitted_in_order() {
    let mut h = harness(config().with_request_buffer_size(2));
    let t1 = admit_in_flight(&mut h.server, "hang:r1");
    let t2 = admit_in_flight(&mut h.server, "hang:r2");

    // Third concurrent request is shed at admission, yet queued so its
    // rejection leaves in pipeline order behind r1 and r2.
    assert!(matches!(admit(&mut h.server, "r3"), Admission::Settled));
    assert_eq!(h.controller.push_count(), 0);
    assert_eq!(
        h.sink.rate_total_tagged("test_errors", "class", "buffer_full"),
        1
    );

    h.server.complete(t1, Ok("r1".to_string())).expect("complete");
    h.server.complete(t2, Ok("r2".to_string())).expect("complete");
    assert_eq!(
        h.controller.pushes(),
        vec![
            "r1".to_string(),
            "r2".to_string(),
            "err:buffer_full:r3".to_string()
        ]
    );
}

#[test]
fn buffer_of_one_rejects_the_second_concurrent_request() {
    let mut h = harness(config().with_request_buffer_size(1));
    let t1 = admit_in_flight(&mut h.server, "hang:r1");
    assert!(matches!(admit(&mut h.server, "r2"), Admission::Settled));
    assert_eq!(h.controller.push_count(), 0);

    h.server.complete(t1, Ok("r1".to_string())).expect("complete");
    assert_eq!(
        h.controller.pushes(),
        vec!["r1".to_string(), "err:buffer_full:r2".to_string()]
    );

    // Once the buffer is free again, requests flow normally.
    assert!(matches!(admit(&mut h.server, "r3"), Admission::Settled));
    assert_eq!(h.controller.pushes().last().unwrap(), "re:r3");
}

#[test]
fn graceful_disconnect_drains_then_closes_exactly_once() {
    let mut h = harness(config());
    let t1 = admit_in_flight(&mut h.server, "hang:r1");

    h.server.graceful_disconnect();
    assert!(h.controller.reads_paused());
    assert!(h.server.is_disconnecting());
    // No self-close: the in-flight request must still get its response.
    assert_eq!(h.controller.graceful_closes(), 0);

    // Calling it again changes nothing.
    h.server.graceful_disconnect();
    assert_eq!(h.controller.graceful_closes(), 0);

    h.server.complete(t1, Ok("r1".to_string())).expect("complete");
    assert_eq!(h.controller.pushes(), vec!["r1".to_string()]);
    assert_eq!(h.controller.graceful_closes(), 1);

    // Later drain-site entry points do not close a second time.
    h.server.write_completed(Ok(())).expect("write completed");
    assert_eq!(h.controller.graceful_closes(), 1);
}

#[test]
fn shutdown_request_is_an_alias_for_graceful_disconnect() {
    let mut h = harness(config());
    admit_in_flight(&mut h.server, "hang:r1");
    h.server.shutdown_request();
    assert!(h.server.is_disconnecting());
    assert!(h.controller.reads_paused());
}

#[test]
fn late_completion_after_close_is_inert() {
    let mut h = harness(config());
    let t1 = admit_in_flight(&mut h.server, "hang:r1");
    h.server.connection_closed(CloseCause::PeerClosed);

    let events_before = h.sink.events().len();
    h.server.complete(t1, Ok("r1".to_string())).expect("complete");
    assert_eq!(h.controller.push_count(), 0);
    assert_eq!(h.sink.events().len(), events_before);
}

#[test]
fn close_flushes_connection_metrics_and_discards_entries() {
    let mut h = harness(config());
    admit_in_flight(&mut h.server, "hang:r1");
    admit_in_flight(&mut h.server, "hang:r2");
    assert!(matches!(admit(&mut h.server, "r3"), Admission::Settled));

    h.server.connection_closed(CloseCause::PeerClosed);
    assert_eq!(
        h.sink.histogram_values("test_requests_per_connection"),
        vec![3.0]
    );
    // Conservation: every +1 on concurrent_requests was matched by a -1,
    // either at dequeue or in the close-time bulk decrement.
    assert_eq!(h.sink.gauge_value("test_concurrent_requests"), 0);
    assert_eq!(h.server.pending_len(), 0);
}

#[test]
fn fast_path_skips_the_queue_entirely() {
    let mut h = harness(config());
    assert!(matches!(admit(&mut h.server, "a"), Admission::Settled));
    assert_eq!(h.controller.pushes(), vec!["re:a".to_string()]);
    assert_eq!(h.sink.rate_total("test_requests"), 1);
    // No pending entry was allocated, so concurrent_requests never moved.
    assert!(
        !h.sink
            .events()
            .iter()
            .any(|event| matches!(event, MetricEvent::GaugeDelta { .. }))
    );
}

#[test]
fn queued_sync_completion_behind_pending_work_keeps_order() {
    let mut h = harness(config());
    let t1 = admit_in_flight(&mut h.server, "hang:r1");
    // Synchronous success with a non-empty queue takes the queued path.
    assert!(matches!(admit(&mut h.server, "b"), Admission::Settled));
    assert_eq!(h.controller.push_count(), 0);

    h.server.complete(t1, Ok("r1".to_string())).expect("complete");
    assert_eq!(
        h.controller.pushes(),
        vec!["r1".to_string(), "re:b".to_string()]
    );
}

#[test]
fn synchronous_handler_failure_becomes_an_ordered_error_response() {
    let mut h = harness(config());
    assert!(matches!(admit(&mut h.server, "fail:z"), Admission::Settled));
    assert_eq!(
        h.controller.pushes(),
        vec!["err:handler:fail:z".to_string()]
    );
    assert_eq!(h.sink.rate_total_tagged("test_errors", "class", "handler"), 1);
}

#[test]
fn asynchronous_handler_failure_is_converted_on_completion() {
    let mut h = harness(config());
    let t1 = admit_in_flight(&mut h.server, "hang:r1");
    h.server
        .complete(t1, Err("worker crashed".into()))
        .expect("complete");
    assert_eq!(h.controller.pushes(), vec!["err:handler:hang:r1".to_string()]);
    assert_eq!(h.sink.rate_total_tagged("test_errors", "class", "handler"), 1);
}

#[test]
fn duplicate_completion_is_dropped() {
    let mut h = harness(config());
    let t1 = admit_in_flight(&mut h.server, "hang:r1");
    h.server.complete(t1, Ok("one".to_string())).expect("complete");
    h.server.complete(t1, Ok("two".to_string())).expect("complete");
    assert_eq!(h.controller.pushes(), vec!["one".to_string()]);
}

#[test]
fn completion_of_a_held_ready_entry_is_dropped() {
    let mut h = harness(config());
    let t1 = admit_in_flight(&mut h.server, "hang:r1");
    let t2 = admit_in_flight(&mut h.server, "hang:r2");

    // r2 resolves first and is held behind the unresolved head.
    h.server.complete(t2, Ok("x".to_string())).expect("complete");
    h.server.complete(t2, Ok("y".to_string())).expect("complete");
    h.server.complete(t1, Ok("r1".to_string())).expect("complete");
    assert_eq!(
        h.controller.pushes(),
        vec!["r1".to_string(), "x".to_string()]
    );
}

#[test]
fn write_failure_counts_a_dropped_reply_and_keeps_draining() {
    let mut h = harness(config());
    assert!(matches!(admit(&mut h.server, "a"), Admission::Settled));
    h.server
        .write_completed(Err("connection reset".into()))
        .expect("write completed");
    assert_eq!(
        h.sink
            .rate_total_tagged("test_errors", "class", "dropped_reply"),
        1
    );
}

#[test]
fn push_refused_after_can_push_is_fatal() {
    let mut h = harness(config());
    h.controller.set_accept_push(false);
    let err = h
        .server
        .process_message("a".to_string())
        .expect_err("push refusal is fatal");
    assert!(matches!(err, FatalError::PushRefused));
}

#[test]
fn request_metrics_gate_suppresses_only_per_request_series() {
    let mut h = harness(config().with_request_metrics(false));
    assert!(matches!(admit(&mut h.server, "a"), Admission::Settled));
    assert!(matches!(admit(&mut h.server, "fail:z"), Admission::Settled));
    assert_eq!(h.sink.rate_total("test_requests"), 0);
    assert!(h.sink.histogram_values("test_latency_ms").is_empty());
    assert_eq!(h.sink.rate_total_tagged("test_errors", "class", "handler"), 1);
}

#[test]
fn tag_decorator_tags_per_request_metrics() {
    let decorated = config().with_tag_decorator(|request: &String, _response: &String| {
        vec![("request".to_string(), request.clone())]
    });
    let mut h = harness(decorated);
    assert!(matches!(admit(&mut h.server, "a"), Admission::Settled));
    assert_eq!(h.sink.rate_total_tagged("test_requests", "request", "a"), 1);
}

#[test]
fn latency_reflects_the_virtual_clock() {
    let mut h = harness(config());
    let t1 = admit_in_flight(&mut h.server, "hang:r1");
    h.clock.set(40);
    h.server.complete(t1, Ok("r1".to_string())).expect("complete");
    assert_eq!(h.sink.histogram_values("test_latency_ms"), vec![40.0]);
}

#[test]
fn bounded_concurrency_holds_at_the_buffer_limit() {
    let mut h = harness(config().with_request_buffer_size(3));
    for i in 0..10 {
        let _ = admit(&mut h.server, &format!("hang:{i}"));
    }
    // Only the first three ever reached the handler; the rest were shed on
    // arrival and sit in the queue as ready rejections.
    assert_eq!(h.server.awaiting_len(), 3);
    assert_eq!(
        h.sink.rate_total_tagged("test_errors", "class", "buffer_full"),
        7
    );
    assert_eq!(h.server.num_requests(), 10);
}
