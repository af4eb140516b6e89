//! Sequencer and imaging process talking over real sockets.
//!
//! The imaging side is a full [`ImagingService`] on ephemeral ports with a
//! mock camera; the sequencer side is a [`RunProducer`] sharing the same
//! in-memory mailbox.

use daq_sync::config::SyncConfig;
use daq_sync::error::SyncError;
use daq_sync::hardware::mock::{MockCameraConnector, MockFaults};
use daq_sync::hardware::{CameraConnector, CameraParams};
use daq_sync::mailbox::handshake::PollPolicy;
use daq_sync::mailbox::{MemoryRecordStore, RecordStore};
use daq_sync::network::command::CommandClient;
use daq_sync::network::protocol::{
    encode_message, read_message, write_frame, Event, Response, VarValue, Vars,
};
use daq_sync::network::viewer::{ViewerClient, ViewerHandle};
use daq_sync::sequencer::{RunPlan, RunProducer};
use daq_sync::service::{ImagingService, ServiceHandle};
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;

fn config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.network.command_port = 0;
    config.network.viewer_port = Some(0);
    config.mailbox.poll_interval = Duration::from_millis(2);
    config.acquisition.writer_poll_interval = Duration::from_millis(2);
    config.acquisition.grab_timeout = Duration::from_millis(50);
    config.acquisition.completion_grace = Duration::from_secs(2);
    config.acquisition.camera_ready_timeout = Duration::from_secs(5);
    config.nanny.retry_interval = Duration::from_millis(10);
    config.camera = CameraParams {
        width: 4,
        height: 4,
        ..Default::default()
    };
    config
}

async fn start(
    config: SyncConfig,
    connector: MockCameraConnector,
) -> (ServiceHandle, Arc<MemoryRecordStore>) {
    let store = Arc::new(MemoryRecordStore::new());
    let connector: Arc<dyn CameraConnector> = Arc::new(connector);
    let handle = ImagingService::new(config, store.clone(), connector)
        .start()
        .await
        .unwrap();
    (handle, store)
}

fn producer(handle: &ServiceHandle, store: &Arc<MemoryRecordStore>) -> RunProducer {
    RunProducer::new(
        store.clone(),
        CommandClient::new(handle.command_addr(), Duration::from_secs(5)),
        PollPolicy::new(Duration::from_millis(2)).with_timeout(Duration::from_secs(5)),
        Duration::from_secs(10),
    )
}

async fn attach_viewer(handle: &ServiceHandle) -> (ViewerHandle, Arc<Mutex<Vec<Event>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let viewer = ViewerClient::new(handle.viewer_addr(), Duration::from_millis(20))
        .on_event(move |event| sink.lock().unwrap().push(event.clone()))
        .spawn();
    for _ in 0..500 {
        if handle.broadcaster().viewer_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(handle.broadcaster().viewer_count(), 1);
    (viewer, events)
}

async fn settled(events: &Arc<Mutex<Vec<Event>>>) -> Vec<Event> {
    tokio::time::sleep(Duration::from_millis(100)).await;
    events.lock().unwrap().clone()
}

#[tokio::test]
async fn full_run_round_trip() {
    let (handle, store) = start(config(), MockCameraConnector::new(Duration::from_millis(1))).await;
    let (viewer, events) = attach_viewer(&handle).await;
    let mut producer = producer(&handle, &store);

    let plan = RunPlan::new(1, config().camera, 3).with_subframes(2);
    let record = producer.start_run(&plan).await.unwrap();
    assert!(record.attributes.producer_ready_ack);

    let mut vars = Vars::new();
    vars.insert("detuning".to_string(), VarValue::Float(-12.5));
    producer.send_xvars(vars.clone()).await.unwrap();
    producer.finish_run().await.unwrap();

    assert!(producer.verify_complete(1).await.unwrap());
    assert_eq!(store.written_indices(1).await.unwrap(), (0..6).collect::<Vec<_>>());

    let status = producer.status().await.unwrap();
    assert_eq!(status.run_id, Some(1));
    assert_eq!(status.frames_written, 6);
    assert_eq!(status.expected_frame_count, 6);
    assert_eq!(status.viewers, 1);

    let events = settled(&events).await;
    assert!(matches!(
        events.first(),
        Some(Event::RunStart {
            run_id: 1,
            expected_frame_count: 6,
            shot_count: 3,
            subframes_per_shot: 2,
            ..
        })
    ));
    assert!(events.contains(&Event::Xvars { vars }));
    let shots: Vec<(usize, usize)> = events
        .iter()
        .filter_map(|e| match e {
            Event::Frame(frame) => Some((frame.shot, frame.subframe)),
            _ => None,
        })
        .collect();
    assert_eq!(shots.len(), 6);
    assert!(shots.contains(&(2, 1)));
    let completions = events
        .iter()
        .filter(|e| matches!(e, Event::RunComplete { run_id: 1, frames: 6 }))
        .count();
    assert_eq!(completions, 1);

    viewer.stop().await;
    handle.shutdown().await;
}

#[tokio::test]
async fn consecutive_runs_share_the_cached_camera() {
    let connector = MockCameraConnector::new(Duration::from_millis(1));
    let (handle, store) = start(config(), connector.clone()).await;
    let mut producer = producer(&handle, &store);

    for run_id in 10..13 {
        producer
            .start_run(&RunPlan::new(run_id, config().camera, 2))
            .await
            .unwrap();
        producer.finish_run().await.unwrap();
        assert!(producer.verify_complete(run_id).await.unwrap());
    }

    assert_eq!(connector.connect_count(), 1);
    assert_eq!(connector.configure_count(), 3);
    handle.shutdown().await;
}

#[tokio::test]
async fn camera_that_never_opens_fails_new_run_and_cleans_up() {
    let mut slow_camera = config();
    slow_camera.acquisition.camera_ready_timeout = Duration::from_millis(200);
    let connector = MockCameraConnector::with_faults(
        Duration::from_millis(1),
        MockFaults {
            failing_opens: AtomicU32::new(u32::MAX),
            ..Default::default()
        },
    );
    let (handle, store) = start(slow_camera, connector).await;
    let mut producer = producer(&handle, &store);

    let result = producer.start_run(&RunPlan::new(20, config().camera, 2)).await;
    match result {
        Err(SyncError::Remote(message)) => assert!(message.contains("camera_ready")),
        other => panic!("expected a remote error, got {other:?}"),
    }
    assert!(!store.contains(20));

    handle.shutdown().await;
}

#[tokio::test]
async fn reset_abandons_the_active_run() {
    let (handle, store) = start(config(), MockCameraConnector::new(Duration::from_millis(5))).await;
    let (viewer, events) = attach_viewer(&handle).await;
    let mut producer = producer(&handle, &store);

    producer
        .start_run(&RunPlan::new(30, config().camera, 10_000))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let mut control = CommandClient::connect(handle.command_addr(), Duration::from_secs(5))
        .await
        .unwrap();
    control.reset().await.unwrap();

    assert!(!store.contains(30));
    let status = control.status().await.unwrap();
    assert_eq!(status.run_id, None);
    assert!(!status.grab_active);

    let events = settled(&events).await;
    assert!(events.contains(&Event::Reset));
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::RunIncomplete { run_id: 30, .. })));

    // The service is idle again and accepts the next run.
    producer
        .start_run(&RunPlan::new(31, config().camera, 2))
        .await
        .unwrap();
    producer.finish_run().await.unwrap();
    assert!(producer.verify_complete(31).await.unwrap());

    viewer.stop().await;
    handle.shutdown().await;
}

#[tokio::test]
async fn reset_after_a_finished_run_keeps_its_record() {
    let (handle, store) = start(config(), MockCameraConnector::new(Duration::from_millis(1))).await;
    let mut producer = producer(&handle, &store);

    producer
        .start_run(&RunPlan::new(40, config().camera, 3))
        .await
        .unwrap();
    producer.finish_run().await.unwrap();
    assert!(producer.verify_complete(40).await.unwrap());

    let mut control = CommandClient::connect(handle.command_addr(), Duration::from_secs(5))
        .await
        .unwrap();
    control.reset().await.unwrap();

    assert!(store.contains(40));
    assert!(producer.verify_complete(40).await.unwrap());
    assert_eq!(store.written_indices(40).await.unwrap(), vec![0, 1, 2]);
    assert_eq!(control.status().await.unwrap().run_id, None);

    handle.shutdown().await;
}

#[tokio::test]
async fn malformed_requests_get_error_responses() {
    let (handle, _store) = start(config(), MockCameraConnector::default()).await;
    let mut stream = TcpStream::connect(handle.command_addr()).await.unwrap();

    write_frame(&mut stream, &[0, 0, 0, 3, 0xc1, 0xc1, 0xc1])
        .await
        .unwrap();
    let reply: Response = read_message(&mut stream).await.unwrap().unwrap();
    assert!(matches!(reply, Response::Error { .. }));

    let unknown = encode_message(&serde_json::json!({ "cmd": "launch" })).unwrap();
    write_frame(&mut stream, &unknown).await.unwrap();
    let reply: Response = read_message(&mut stream).await.unwrap().unwrap();
    assert!(matches!(reply, Response::Error { .. }));

    // The connection is still usable afterwards.
    let status = encode_message(&serde_json::json!({ "cmd": "status" })).unwrap();
    write_frame(&mut stream, &status).await.unwrap();
    let reply: Response = read_message(&mut stream).await.unwrap().unwrap();
    assert!(matches!(reply, Response::Status(_)));

    handle.shutdown().await;
}

#[tokio::test]
async fn run_complete_without_a_run_is_acknowledged() {
    let (handle, _store) = start(config(), MockCameraConnector::default()).await;
    let mut client = CommandClient::connect(handle.command_addr(), Duration::from_secs(1))
        .await
        .unwrap();
    client.run_complete(Duration::from_secs(1)).await.unwrap();
    handle.shutdown().await;
}
