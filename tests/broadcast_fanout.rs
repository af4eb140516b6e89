//! Broadcast channel behaviour with several real viewer clients.

use daq_sync::acquisition::Interrupt;
use daq_sync::network::broadcast::{BroadcastServer, Broadcaster};
use daq_sync::network::protocol::{Event, VarValue, Vars};
use daq_sync::network::viewer::{ViewerClient, ViewerHandle};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

const RECONNECT: Duration = Duration::from_millis(20);

async fn start_server(
    addr: SocketAddr,
    broadcaster: &Broadcaster,
) -> (SocketAddr, Interrupt, JoinHandle<()>) {
    let server = BroadcastServer::bind(addr, broadcaster.clone()).await.unwrap();
    let bound = server.local_addr().unwrap();
    let shutdown = Interrupt::new();
    let task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            server.run(shutdown).await.unwrap();
        })
    };
    (bound, shutdown, task)
}

fn recording_viewer(addr: SocketAddr) -> (ViewerHandle, Arc<Mutex<Vec<Event>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let handle = ViewerClient::new(addr, RECONNECT)
        .on_event(move |event| sink.lock().unwrap().push(event.clone()))
        .spawn();
    (handle, events)
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn snapshot(step: i64) -> Event {
    let mut vars = Vars::new();
    vars.insert("step".to_string(), VarValue::Int(step));
    Event::Xvars { vars }
}

#[tokio::test]
async fn every_viewer_gets_each_event_once() {
    let broadcaster = Broadcaster::default();
    let (addr, shutdown, _task) = start_server("127.0.0.1:0".parse().unwrap(), &broadcaster).await;

    let viewers: Vec<_> = (0..4).map(|_| recording_viewer(addr)).collect();
    wait_until("four viewers", || broadcaster.viewer_count() == 4).await;

    assert_eq!(broadcaster.publish(&snapshot(1)), 4);
    for (_, events) in &viewers {
        wait_until("delivery", || events.lock().unwrap().len() == 1).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    for (_, events) in &viewers {
        assert_eq!(*events.lock().unwrap(), vec![snapshot(1)]);
    }

    for (handle, _) in viewers {
        handle.stop().await;
    }
    shutdown.raise();
}

#[tokio::test]
async fn departing_viewer_does_not_disturb_the_rest() {
    let broadcaster = Broadcaster::default();
    let (addr, shutdown, _task) = start_server("127.0.0.1:0".parse().unwrap(), &broadcaster).await;

    let mut viewers: Vec<_> = (0..3).map(|_| recording_viewer(addr)).collect();
    wait_until("three viewers", || broadcaster.viewer_count() == 3).await;
    broadcaster.publish(&snapshot(1));

    let (leaving, _) = viewers.remove(0);
    leaving.stop().await;
    wait_until("viewer removal", || broadcaster.viewer_count() == 2).await;
    for _ in 0..100 {
        if broadcaster.sessions().len().await == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(broadcaster.sessions().len().await, 2);

    broadcaster.publish(&snapshot(2));
    for (_, events) in &viewers {
        wait_until("both events", || events.lock().unwrap().len() == 2).await;
        assert_eq!(*events.lock().unwrap(), vec![snapshot(1), snapshot(2)]);
    }

    for (handle, _) in viewers {
        handle.stop().await;
    }
    shutdown.raise();
}

#[tokio::test]
async fn viewer_reconnects_after_server_restart() {
    let broadcaster = Broadcaster::default();
    let (addr, shutdown, task) = start_server("127.0.0.1:0".parse().unwrap(), &broadcaster).await;

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let events = Arc::new(Mutex::new(Vec::new()));
    let viewer = {
        let statuses = Arc::clone(&statuses);
        let events = Arc::clone(&events);
        ViewerClient::new(addr, RECONNECT)
            .on_connection_status(move |connected| statuses.lock().unwrap().push(connected))
            .on_event(move |event| events.lock().unwrap().push(event.clone()))
            .spawn()
    };
    wait_until("first connection", || *statuses.lock().unwrap() == vec![true]).await;

    shutdown.raise();
    task.await.unwrap();
    wait_until("disconnect notice", || *statuses.lock().unwrap() == vec![true, false]).await;

    // Let a few reconnect attempts fail before the server comes back.
    tokio::time::sleep(RECONNECT * 4).await;
    assert_eq!(*statuses.lock().unwrap(), vec![true, false]);

    let restarted = Broadcaster::default();
    let (_, shutdown, _task) = start_server(addr, &restarted).await;
    wait_until("reconnection", || {
        *statuses.lock().unwrap() == vec![true, false, true]
    })
    .await;
    wait_until("resubscription", || restarted.viewer_count() == 1).await;

    restarted.publish(&Event::Reset);
    wait_until("event after restart", || {
        events.lock().unwrap().last() == Some(&Event::Reset)
    })
    .await;

    viewer.stop().await;
    shutdown.raise();
}
