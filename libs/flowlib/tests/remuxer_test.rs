//! Remuxer integration tests
//!
//! Feeds two tagged flows through a muxer into a remuxer and verifies
//! only the selected streams come out the far side, including a live
//! selection swap.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use flowlib::{
    link_nodes, read_dump, Muxer, Pipeline, RecordSink, RecordingEvent, RecordingInfo, Remuxer,
    TestSource,
};

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

fn paced_source(name: &str, payload: &'static [u8]) -> TestSource {
    let mut source = TestSource::new(name, 0).unwrap();
    source.set_frame_duration(Duration::from_millis(40));
    source.set_interval(Duration::from_millis(2));
    source.set_payload(Bytes::from_static(payload));
    source
}

/// Flush the recorder's whole cache into a file; the first live frame
/// closes the session. Returns the finished recording.
fn snapshot_recording(pipeline: &mut Pipeline, recorder: &str) -> RecordingInfo {
    let ended: Arc<Mutex<Option<RecordingInfo>>> = Arc::new(Mutex::new(None));
    let slot = ended.clone();
    let id = {
        let sink = pipeline.node_as_mut::<RecordSink>(recorder).unwrap();
        sink.add_listener(move |event| {
            if let RecordingEvent::Ended(info) = event {
                *slot.lock() = Some(info.clone());
            }
        });
        sink.start_session(Duration::from_secs(3600), Duration::ZERO)
            .unwrap()
    };
    assert!(id >= 1);
    assert!(wait_for(
        || {
            pipeline
                .node_as_mut::<RecordSink>(recorder)
                .map(|sink| !sink.is_on())
                .unwrap_or(false)
        },
        Duration::from_secs(5)
    ));
    // Joining the drain worker guarantees the end event was dispatched.
    pipeline.stop().unwrap();
    let info = ended.lock().take().unwrap();
    info
}

#[test]
fn test_only_selected_streams_pass() {
    let dir = TempDir::new().unwrap();
    let mut talent = paced_source("rmx_it_talent", b"talent");
    let mut slate = paced_source("rmx_it_slate", b"slate");

    let mut combine = Muxer::new("rmx_it_combine", 16).unwrap();
    let _lane3 = combine.request_stream_port(3).unwrap();
    let _lane9 = combine.request_stream_port(9).unwrap();
    link_nodes(&mut talent, "src", &mut combine, "sink_3").unwrap();
    link_nodes(&mut slate, "src", &mut combine, "sink_9").unwrap();

    let mut select = Remuxer::new("rmx_it_select", 16).unwrap();
    select.add_stream(3).unwrap();

    let recorder = RecordSink::new("rmx_it_archive", dir.path()).unwrap();

    let mut pipeline = Pipeline::new("rmx_it_pipe").unwrap();
    pipeline.add_node(Box::new(talent)).unwrap();
    pipeline.add_node(Box::new(slate)).unwrap();
    pipeline.add_node(Box::new(combine)).unwrap();
    pipeline.add_node(Box::new(select)).unwrap();
    pipeline.add_node(Box::new(recorder)).unwrap();
    pipeline.link("rmx_it_combine", "rmx_it_select").unwrap();
    pipeline.link("rmx_it_select", "rmx_it_archive").unwrap();
    pipeline.play().unwrap();

    assert!(wait_for(
        || {
            pipeline
                .node_as_mut::<RecordSink>("rmx_it_archive")
                .map(|sink| sink.cached_frames() >= 20)
                .unwrap_or(false)
        },
        Duration::from_secs(5)
    ));

    let info = snapshot_recording(&mut pipeline, "rmx_it_archive");
    let (_, _, frames) = read_dump(&info.path).unwrap();
    assert!(frames.len() >= 20);
    let mut last = None;
    for frame in &frames {
        assert_eq!(frame.stream_id, 3);
        assert_eq!(frame.payload, Bytes::from_static(b"talent"));
        if let Some(prev) = last {
            assert!(frame.pts > prev);
        }
        last = Some(frame.pts);
    }
}

#[test]
fn test_live_selection_swap() {
    let dir = TempDir::new().unwrap();
    let mut talent = paced_source("rmx_swap_talent", b"talent");
    let mut slate = paced_source("rmx_swap_slate", b"slate");

    let mut combine = Muxer::new("rmx_swap_combine", 16).unwrap();
    let _lane3 = combine.request_stream_port(3).unwrap();
    let _lane9 = combine.request_stream_port(9).unwrap();
    link_nodes(&mut talent, "src", &mut combine, "sink_3").unwrap();
    link_nodes(&mut slate, "src", &mut combine, "sink_9").unwrap();

    let mut select = Remuxer::new("rmx_swap_select", 16).unwrap();
    select.add_stream(3).unwrap();

    let recorder = RecordSink::new("rmx_swap_archive", dir.path()).unwrap();

    let mut pipeline = Pipeline::new("rmx_swap_pipe").unwrap();
    pipeline.add_node(Box::new(talent)).unwrap();
    pipeline.add_node(Box::new(slate)).unwrap();
    pipeline.add_node(Box::new(combine)).unwrap();
    pipeline.add_node(Box::new(select)).unwrap();
    pipeline.add_node(Box::new(recorder)).unwrap();
    pipeline.link("rmx_swap_combine", "rmx_swap_select").unwrap();
    pipeline.link("rmx_swap_select", "rmx_swap_archive").unwrap();
    pipeline.play().unwrap();

    assert!(wait_for(
        || {
            pipeline
                .node_as_mut::<RecordSink>("rmx_swap_archive")
                .map(|sink| sink.cached_frames() >= 10)
                .unwrap_or(false)
        },
        Duration::from_secs(5)
    ));

    // Swap the selection while frames are moving.
    {
        let select = pipeline.node_as_mut::<Remuxer>("rmx_swap_select").unwrap();
        select.remove_stream(3).unwrap();
        select.add_stream(9).unwrap();
        assert_eq!(select.selected_streams(), vec![9]);
    }
    // Let the stragglers from the old branch drain, then forget them.
    std::thread::sleep(Duration::from_millis(150));
    pipeline
        .node_as_mut::<RecordSink>("rmx_swap_archive")
        .unwrap()
        .set_cache_window(Duration::from_secs(60))
        .unwrap();

    assert!(wait_for(
        || {
            pipeline
                .node_as_mut::<RecordSink>("rmx_swap_archive")
                .map(|sink| sink.cached_frames() >= 10)
                .unwrap_or(false)
        },
        Duration::from_secs(5)
    ));

    let info = snapshot_recording(&mut pipeline, "rmx_swap_archive");
    let (_, _, frames) = read_dump(&info.path).unwrap();
    assert!(frames.len() >= 10);
    for frame in &frames {
        assert_eq!(frame.stream_id, 9);
        assert_eq!(frame.payload, Bytes::from_static(b"slate"));
    }
}
