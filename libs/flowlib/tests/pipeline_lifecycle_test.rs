//! Pipeline lifecycle integration tests
//!
//! Drives a source -> queue -> tee graph through the state ladder and
//! verifies frames only move while the graph is playing.

use parking_lot::Mutex;
use serial_test::serial;
use std::sync::Arc;
use std::time::{Duration, Instant};

use flowlib::{FakeSink, Pipeline, PipelineState, Queue, Tee, TerminalNode, TestSource};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

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

/// cam -> feed -> fanout, with the source paced so nothing floods.
fn build_graph() -> Pipeline {
    let mut pipeline = Pipeline::new("lifecycle").unwrap();
    let mut source = TestSource::new("cam", 0).unwrap();
    source.set_frame_duration(Duration::from_millis(50));
    source.set_interval(Duration::from_millis(2));
    pipeline.add_node(Box::new(source)).unwrap();
    pipeline
        .add_node(Box::new(Queue::new("feed").unwrap()))
        .unwrap();
    pipeline
        .add_node(Box::new(Tee::new("fanout").unwrap()))
        .unwrap();
    pipeline.link("cam", "feed").unwrap();
    pipeline.link("feed", "fanout").unwrap();
    pipeline
}

#[test]
#[serial]
fn test_play_pause_resume_stop_transitions() {
    init_tracing();
    let mut pipeline = build_graph();
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    pipeline.add_state_listener(move |t| sink.lock().push((t.old, t.new)));

    pipeline.play().unwrap();
    pipeline.pause().unwrap();
    pipeline.play().unwrap();
    pipeline.stop().unwrap();

    use PipelineState::*;
    assert_eq!(
        *log.lock(),
        vec![
            (Null, Ready),
            (Ready, Paused),
            (Paused, Playing),
            (Playing, Paused),
            (Paused, Playing),
            (Playing, Paused),
            (Paused, Ready),
            (Ready, Null),
        ]
    );
}

#[test]
#[serial]
fn test_frames_reach_attached_sink() {
    init_tracing();
    let mut pipeline = build_graph();
    pipeline.play().unwrap();
    assert_eq!(pipeline.state(), PipelineState::Playing);

    let mut probe = FakeSink::new("probe").unwrap();
    assert_eq!(pipeline.attach_to_tee("fanout", &mut probe).unwrap(), 0);
    assert!(wait_for(|| probe.received() >= 10, Duration::from_secs(5)));

    pipeline.detach_from_tee("fanout", &mut probe).unwrap();
    assert!(!probe.is_attached());
    pipeline.stop().unwrap();
}

#[test]
#[serial]
fn test_pause_halts_the_source() {
    init_tracing();
    let mut pipeline = build_graph();
    pipeline.play().unwrap();
    let mut probe = FakeSink::new("probe").unwrap();
    pipeline.attach_to_tee("fanout", &mut probe).unwrap();
    assert!(wait_for(|| probe.received() >= 5, Duration::from_secs(5)));

    pipeline.pause().unwrap();
    // Give the frames already in flight time to drain through.
    std::thread::sleep(Duration::from_millis(150));
    let settled = probe.received();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(probe.received(), settled);

    pipeline.play().unwrap();
    assert!(wait_for(|| probe.received() > settled, Duration::from_secs(5)));
    pipeline.detach_from_tee("fanout", &mut probe).unwrap();
    pipeline.stop().unwrap();
}

#[test]
#[serial]
fn test_replay_after_stop() {
    init_tracing();
    let mut pipeline = build_graph();
    pipeline.play().unwrap();
    pipeline.stop().unwrap();
    assert_eq!(pipeline.state(), PipelineState::Null);

    // The explicit member links survive the teardown.
    pipeline.play().unwrap();
    let mut probe = FakeSink::new("probe").unwrap();
    pipeline.attach_to_tee("fanout", &mut probe).unwrap();
    assert!(wait_for(|| probe.received() >= 5, Duration::from_secs(5)));
    pipeline.detach_from_tee("fanout", &mut probe).unwrap();
    pipeline.stop().unwrap();
}
