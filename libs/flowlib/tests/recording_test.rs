//! Smart-record integration tests
//!
//! Exercises a tee-attached record sink end to end: pre-event history,
//! live coverage, early stops and session numbering.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use flowlib::{
    read_dump, Pipeline, Queue, RecordSink, RecordingEvent, SessionState, Tee, TestSource,
};

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

/// Source with 100 ms stream-time steps, lightly paced, keyframe every
/// fifth frame, feeding a tee through a queue.
fn build_graph(prefix: &str) -> Pipeline {
    let mut pipeline = Pipeline::new(format!("{prefix}_pipe")).unwrap();
    let mut source = TestSource::new(format!("{prefix}_cam"), 0).unwrap();
    source.set_frame_duration(Duration::from_millis(100));
    source.set_interval(Duration::from_millis(2));
    source.set_keyframe_every(5);
    pipeline.add_node(Box::new(source)).unwrap();
    pipeline
        .add_node(Box::new(Queue::new(format!("{prefix}_buf")).unwrap()))
        .unwrap();
    pipeline
        .add_node(Box::new(Tee::new(format!("{prefix}_split")).unwrap()))
        .unwrap();
    pipeline
        .link(&format!("{prefix}_cam"), &format!("{prefix}_buf"))
        .unwrap();
    pipeline
        .link(&format!("{prefix}_buf"), &format!("{prefix}_split"))
        .unwrap();
    pipeline
}

fn recorder_with_log(name: &str, dir: &TempDir) -> (RecordSink, Arc<Mutex<Vec<RecordingEvent>>>) {
    let mut sink = RecordSink::new(name, dir.path()).unwrap();
    sink.set_cache_window(Duration::from_secs(2)).unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    let log = events.clone();
    sink.add_listener(move |event| log.lock().push(event.clone()));
    (sink, events)
}

#[test]
fn test_session_covers_the_requested_window() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut pipeline = build_graph("rec_it_window");
    pipeline.play().unwrap();

    let (mut recorder, events) = recorder_with_log("rec_it_window_sink", &dir);
    pipeline
        .attach_to_tee("rec_it_window_split", &mut recorder)
        .unwrap();
    assert!(wait_for(
        || recorder.cached_frames() >= 15,
        Duration::from_secs(5)
    ));

    let id = recorder
        .start_session(Duration::from_millis(300), Duration::from_secs(1))
        .unwrap();
    assert_eq!(id, 1);
    assert!(wait_for(|| !recorder.is_on(), Duration::from_secs(5)));

    // Joining the drain worker guarantees the end event was dispatched.
    pipeline
        .detach_from_tee("rec_it_window_split", &mut recorder)
        .unwrap();
    pipeline.stop().unwrap();

    let events = events.lock();
    assert_eq!(events.len(), 2);
    let RecordingEvent::Started(started) = &events[0] else {
        panic!("expected a start event first");
    };
    let RecordingEvent::Ended(ended) = &events[1] else {
        panic!("expected an end event second");
    };
    assert_eq!(started.session_id, ended.session_id);
    // 0.3 s of history plus 1 s of live coverage.
    assert_eq!(started.duration, Duration::from_millis(1300));
    assert_eq!(ended.duration, Duration::from_millis(1300));

    let (width, height, frames) = read_dump(&ended.path).unwrap();
    assert_eq!((width, height), (1280, 720));
    assert!(!frames.is_empty());
    assert!(frames.windows(2).all(|pair| pair[0].pts < pair[1].pts));
    // The replayed history starts at or before the trigger, so the file
    // spans at least the live portion.
    let first = frames.first().unwrap();
    let last = frames.last().unwrap();
    assert!(last.end_pts() - first.pts >= Duration::from_secs(1));
}

#[test]
fn test_sessions_number_files_sequentially() {
    let dir = TempDir::new().unwrap();
    let mut pipeline = build_graph("rec_it_seq");
    pipeline.play().unwrap();
    let (mut recorder, events) = recorder_with_log("rec_it_seq_sink", &dir);
    pipeline
        .attach_to_tee("rec_it_seq_split", &mut recorder)
        .unwrap();
    assert!(wait_for(
        || recorder.cached_frames() >= 5,
        Duration::from_secs(5)
    ));

    // First session: stopped early by hand.
    let id = recorder
        .start_session(Duration::from_millis(200), Duration::from_secs(3600))
        .unwrap();
    assert_eq!(id, 1);
    assert!(wait_for(
        || recorder.frames_written() >= 10,
        Duration::from_secs(5)
    ));
    assert!(recorder.stop_session().unwrap());
    assert_eq!(recorder.session_state(), SessionState::Idle);

    // Second session: closes itself once its live window is covered.
    let id = recorder
        .start_session(Duration::ZERO, Duration::from_millis(500))
        .unwrap();
    assert_eq!(id, 2);
    assert!(wait_for(|| !recorder.is_on(), Duration::from_secs(5)));
    assert_eq!(recorder.session_count(), 2);

    pipeline
        .detach_from_tee("rec_it_seq_split", &mut recorder)
        .unwrap();
    pipeline.stop().unwrap();

    let events = events.lock();
    assert_eq!(events.len(), 4);
    let names: Vec<String> = events
        .iter()
        .map(|e| {
            e.info()
                .path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string()
        })
        .collect();
    assert_eq!(names[0], "rec_it_seq_sink_0001.mp4");
    assert_eq!(names[3], "rec_it_seq_sink_0002.mp4");
    // Both files parse back.
    for event in [&events[1], &events[3]] {
        let (_, _, frames) = read_dump(&event.info().path).unwrap();
        assert!(!frames.is_empty());
    }
}

#[test]
fn test_detach_closes_an_open_session() {
    let dir = TempDir::new().unwrap();
    let mut pipeline = build_graph("rec_it_close");
    pipeline.play().unwrap();
    let (mut recorder, events) = recorder_with_log("rec_it_close_sink", &dir);
    pipeline
        .attach_to_tee("rec_it_close_split", &mut recorder)
        .unwrap();
    assert!(wait_for(
        || recorder.cached_frames() >= 5,
        Duration::from_secs(5)
    ));

    recorder
        .start_session(Duration::from_millis(100), Duration::from_secs(3600))
        .unwrap();
    assert!(recorder.is_on());

    // Detaching stops the sink, which finalizes the output first.
    pipeline
        .detach_from_tee("rec_it_close_split", &mut recorder)
        .unwrap();
    assert!(!recorder.is_on());

    {
        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], RecordingEvent::Ended(_)));
        let (_, _, frames) = read_dump(&events[1].info().path).unwrap();
        assert!(!frames.is_empty());
    }
    pipeline.stop().unwrap();
}
