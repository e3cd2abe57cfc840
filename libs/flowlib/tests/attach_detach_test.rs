//! Dynamic fan-out integration tests
//!
//! Attaches and detaches terminal sinks on a live tee and checks grant
//! accounting, the capacity limit and the overlay enable toggle.

use serial_test::serial;
use std::time::{Duration, Instant};

use flowlib::{FakeSink, FlowError, OverlaySink, Pipeline, Queue, Tee, TerminalNode, TestSource};

fn wait_for(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn build_graph(tee_capacity: usize) -> Pipeline {
    let mut pipeline = Pipeline::new("hub").unwrap();
    let mut source = TestSource::new("gen", 0).unwrap();
    source.set_frame_duration(Duration::from_millis(40));
    source.set_interval(Duration::from_millis(2));
    pipeline.add_node(Box::new(source)).unwrap();
    pipeline
        .add_node(Box::new(Queue::new("buf").unwrap()))
        .unwrap();
    pipeline
        .add_node(Box::new(Tee::with_capacity("split", tee_capacity).unwrap()))
        .unwrap();
    pipeline.link("gen", "buf").unwrap();
    pipeline.link("buf", "split").unwrap();
    pipeline
}

#[test]
#[serial]
fn test_two_sinks_share_the_flow() {
    let mut pipeline = build_graph(4);
    pipeline.play().unwrap();

    let mut left = FakeSink::new("left").unwrap();
    let mut right = FakeSink::new("right").unwrap();
    assert_eq!(pipeline.attach_to_tee("split", &mut left).unwrap(), 0);
    assert_eq!(pipeline.attach_to_tee("split", &mut right).unwrap(), 1);

    assert!(wait_for(
        || left.received() >= 10 && right.received() >= 10,
        Duration::from_secs(5)
    ));

    pipeline.detach_from_tee("split", &mut left).unwrap();
    pipeline.detach_from_tee("split", &mut right).unwrap();
    pipeline.stop().unwrap();
}

#[test]
#[serial]
fn test_capacity_limits_concurrent_sinks() {
    let mut pipeline = build_graph(4);
    pipeline.play().unwrap();

    let mut a = FakeSink::new("a").unwrap();
    let mut b = FakeSink::new("b").unwrap();
    let mut c = FakeSink::new("c").unwrap();
    let mut d = FakeSink::new("d").unwrap();
    let mut e = FakeSink::new("e").unwrap();
    pipeline.attach_to_tee("split", &mut a).unwrap();
    pipeline.attach_to_tee("split", &mut b).unwrap();
    pipeline.attach_to_tee("split", &mut c).unwrap();
    pipeline.attach_to_tee("split", &mut d).unwrap();

    let err = pipeline.attach_to_tee("split", &mut e).unwrap_err();
    assert!(matches!(err, FlowError::Capacity(_)));
    // The failed attach leaves no trace on the sink.
    assert_eq!(e.sink_id(), None);
    assert!(!e.is_attached());

    // Freeing the middle lane reopens exactly that id.
    pipeline.detach_from_tee("split", &mut b).unwrap();
    assert_eq!(pipeline.attach_to_tee("split", &mut e).unwrap(), 1);

    for sink in [&mut a, &mut c, &mut d, &mut e] {
        pipeline.detach_from_tee("split", sink).unwrap();
    }
    pipeline.stop().unwrap();
}

#[test]
#[serial]
fn test_detached_sink_receives_nothing_more() {
    let mut pipeline = build_graph(4);
    pipeline.play().unwrap();
    let mut probe = FakeSink::new("probe").unwrap();
    pipeline.attach_to_tee("split", &mut probe).unwrap();
    assert!(wait_for(|| probe.received() >= 5, Duration::from_secs(5)));

    // Detaching while playing also stops the drain worker.
    pipeline.detach_from_tee("split", &mut probe).unwrap();
    let frozen = probe.received();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(probe.received(), frozen);

    // The tee itself keeps running for the next consumer.
    let mut late = FakeSink::new("late").unwrap();
    pipeline.attach_to_tee("split", &mut late).unwrap();
    assert!(wait_for(|| late.received() >= 5, Duration::from_secs(5)));
    pipeline.detach_from_tee("split", &mut late).unwrap();
    pipeline.stop().unwrap();
}

#[test]
#[serial]
fn test_overlay_enable_gates_rendering() {
    let mut pipeline = build_graph(4);
    pipeline.play().unwrap();

    let mut overlay = OverlaySink::new("badge", 8, 8, 160, 90).unwrap();
    overlay.set_enabled(false);
    pipeline.attach_to_tee("split", &mut overlay).unwrap();

    // Disabled: the lane keeps draining but nothing is rendered.
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(overlay.rendered(), 0);

    overlay.set_enabled(true);
    assert!(wait_for(|| overlay.rendered() >= 5, Duration::from_secs(5)));

    pipeline.detach_from_tee("split", &mut overlay).unwrap();
    pipeline.stop().unwrap();
}
