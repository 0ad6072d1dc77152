//! Back-pressure under realistic link speeds: a slow client must not be
//! overloaded by a fast neighbour, and must recover once it catches up.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;

use bhub::client::Client;
use bhub::hub::Hub;
use bhub::proto::Status;
use bhub::test_harness::{pipe, throttle};

const BYTE_TIME_1KBPS: Duration = Duration::from_millis(1);

#[test]
fn slow_client_is_throttled_then_recovers() {
    let hub = Hub::new();

    let (fast_end, far) = pipe();
    assert!(hub.add_connection(Arc::new(far)));
    let fast = Client::new(Arc::new(fast_end)).unwrap();
    let fast_cid = fast.identify().unwrap();

    let (slow_end, far) = pipe();
    assert!(hub.add_connection(Arc::new(far)));
    let slow_end = throttle(slow_end, BYTE_TIME_1KBPS);
    let slow = Client::new(Arc::new(slow_end)).unwrap();
    let slow_cid = slow.identify().unwrap();

    let long_message: Bytes = (0..1000u32).map(|i| i as u8).collect::<Vec<u8>>().into();

    // Both clients drain their indications into the bitbucket.
    let fast_rx = fast.relays().clone();
    thread::spawn(move || while fast_rx.recv().is_ok() {});
    let slow_rx = slow.relays().clone();
    thread::spawn(move || while slow_rx.recv().is_ok() {});

    // One long message in each direction works.
    let outcome = fast.relay(long_message.clone(), vec![slow_cid]).unwrap();
    assert!(outcome.fully_delivered());
    let outcome = slow.relay(long_message.clone(), vec![fast_cid]).unwrap();
    assert!(outcome.fully_delivered());

    // 15 long messages at 400ms spacing overrun the slow link: the
    // per-destination statuses must pass from SUCCESS into NO_BUFFER and
    // back to SUCCESS as the queue drains.
    let n_messages = 15;
    let mut statuses: Vec<Status> = Vec::with_capacity(n_messages);
    for _ in 0..n_messages {
        let outcome = fast.relay(long_message.clone(), vec![slow_cid]).unwrap();
        assert_eq!(outcome.status, Status::Success);
        statuses.push(
            outcome
                .status_map
                .get(&slow_cid)
                .copied()
                .unwrap_or(Status::Success),
        );
        thread::sleep(Duration::from_millis(400));
    }

    for status in &statuses {
        assert!(
            matches!(status, Status::Success | Status::NoBuffer),
            "unexpected status {status} in {statuses:?}"
        );
    }
    let mut throttled = false;
    let mut recovered = false;
    for pair in statuses.windows(2) {
        if pair[0] == Status::Success && pair[1] == Status::NoBuffer {
            throttled = true;
        }
        if pair[0] == Status::NoBuffer && pair[1] == Status::Success {
            recovered = true;
        }
    }
    assert!(throttled, "expected SUCCESS -> NO_BUFFER: {statuses:?}");
    assert!(recovered, "expected NO_BUFFER -> SUCCESS: {statuses:?}");

    hub.close();
}
