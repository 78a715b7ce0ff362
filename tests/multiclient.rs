//! Several clients fanning in to one server endpoint.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use quicnet::{ConnectOptions, Direction, ListenOptions, Network};

const MESSAGE: &str = "hello from the other siiiii-iiiiide";

#[test]
fn four_clients_fan_in() {
    init_logging();
    let net = Network::new().unwrap();

    let deliveries = Arc::new(AtomicUsize::new(0));
    let counter = deliveries.clone();
    let server = net.endpoint(localhost(5500)).unwrap();
    server
        .listen(
            ListenOptions::new(test_creds(), test_engine()).on_stream_data(move |_, data| {
                assert_eq!(data.as_ref(), MESSAGE.as_bytes());
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

    let mut conns = Vec::new();
    for port in [4400u16, 4422, 4444, 4466] {
        let client = net.endpoint(localhost(port)).unwrap();
        let conn = client
            .connect(
                localhost(5500),
                ConnectOptions::new(test_creds(), test_engine()),
            )
            .unwrap();
        let stream = conn.get_new_stream().unwrap();
        stream.send(b(MESSAGE));
        conns.push(conn);
    }

    assert!(wait_for(Duration::from_secs(2), || {
        deliveries.load(Ordering::SeqCst) == 4
    }));
    // No spurious extra deliveries.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(deliveries.load(Ordering::SeqCst), 4);
    assert_eq!(server.get_all_conns(Some(Direction::Inbound)).len(), 4);

    // Every server-side connection is keyed by a distinct CID.
    let mut cids: Vec<_> = server
        .get_all_conns(None)
        .iter()
        .map(|c| c.scid().as_bytes().to_vec())
        .collect();
    cids.sort();
    cids.dedup();
    assert_eq!(cids.len(), 4);

    net.close(true);
}
