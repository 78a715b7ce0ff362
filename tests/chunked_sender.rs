//! Chunked stream sending: producer-driven writes with bounded parallelism, nested
//! through completion callbacks.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use common::*;
use quicnet::{ConnectOptions, ListenOptions, Network, Stream};

const PARALLEL: usize = 2;

fn staged_producer(
    counter: Arc<AtomicUsize>,
    limit: usize,
    format: impl Fn(usize) -> String + Send + 'static,
) -> impl FnMut(&Stream) -> Option<Bytes> + Send + 'static {
    move |_| {
        let i = counter.fetch_add(1, Ordering::SeqCst);
        if i < limit {
            Some(Bytes::from(format(i + 1)))
        } else {
            counter.fetch_sub(1, Ordering::SeqCst);
            None
        }
    }
}

#[test]
fn chunked_stream_sending() {
    init_logging();
    let net = Network::new().unwrap();

    let received = Arc::new(Mutex::new(String::new()));
    let sink = received.clone();
    let server = net.endpoint(localhost(5500)).unwrap();
    server
        .listen(
            ListenOptions::new(test_creds(), test_engine()).on_stream_data(move |_, data| {
                sink.lock()
                    .unwrap()
                    .push_str(std::str::from_utf8(&data).unwrap());
            }),
        )
        .unwrap();

    let client = net.endpoint(localhost(4400)).unwrap();
    let conn = client
        .connect(
            localhost(5500),
            ConnectOptions::new(test_creds(), test_engine()),
        )
        .unwrap();

    let stream = conn.get_new_stream().unwrap();
    stream.send(b("HELLO!"));

    let i = Arc::new(AtomicUsize::new(0));
    let (i2, i3) = (i.clone(), i.clone());
    stream.send_chunks(
        staged_producer(i, 3, |n| format!("[CHUNK-{n}]")),
        move |s| {
            s.send_chunks(
                staged_producer(i2, 6, |n| format!("[Chunk-{n}]")),
                move |s| {
                    s.send_chunks(
                        staged_producer(i3, 10, |n| format!("[chunk-{n}]")),
                        |s| s.send(b("Goodbye.")),
                        PARALLEL,
                    );
                },
                PARALLEL,
            );
        },
        PARALLEL,
    );

    let expected = "HELLO![CHUNK-1][CHUNK-2][CHUNK-3][Chunk-4][Chunk-5][Chunk-6]\
                    [chunk-7][chunk-8][chunk-9][chunk-10]Goodbye.";
    assert!(
        wait_for(Duration::from_secs(3), || received.lock().unwrap().as_str() == expected),
        "got {:?}",
        received.lock().unwrap()
    );

    net.close(true);
}

#[test]
fn empty_producer_completes_without_chunks() {
    init_logging();
    let net = Network::new().unwrap();

    let received = Arc::new(Mutex::new(Vec::<u8>::new()));
    let sink = received.clone();
    let server = net.endpoint(localhost(5506)).unwrap();
    server
        .listen(
            ListenOptions::new(test_creds(), test_engine()).on_stream_data(move |_, data| {
                sink.lock().unwrap().extend_from_slice(&data);
            }),
        )
        .unwrap();

    let client = net.endpoint(localhost(4406)).unwrap();
    let conn = client
        .connect(
            localhost(5506),
            ConnectOptions::new(test_creds(), test_engine()),
        )
        .unwrap();

    let stream = conn.get_new_stream().unwrap();
    let done = Arc::new(AtomicBool::new(false));
    let flag = done.clone();
    stream.send_chunks(
        |_| None,
        move |_| flag.store(true, Ordering::SeqCst),
        PARALLEL,
    );

    assert!(wait_for(Duration::from_secs(2), || done.load(Ordering::SeqCst)));
    std::thread::sleep(Duration::from_millis(50));
    assert!(received.lock().unwrap().is_empty(), "no chunk may be emitted");

    net.close(true);
}
