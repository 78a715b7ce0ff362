//! A listening endpoint answers an Initial with an unknown version by listing the
//! versions it does speak.

mod common;

use std::time::Duration;

use common::*;
use quicnet::{ListenOptions, Network};

#[test]
fn unknown_version_elicits_version_negotiation() {
    init_logging();
    let net = Network::new().unwrap();

    let server = net.endpoint(localhost(5508)).unwrap();
    server
        .listen(ListenOptions::new(test_creds(), test_engine()))
        .unwrap();

    let probe = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    probe
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();

    // Long-header Initial claiming version 0x0A0A0A0A (a greasing version).
    let dcid: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];
    let scid: [u8; 8] = [9, 10, 11, 12, 13, 14, 15, 16];
    let mut pkt = vec![0xc0];
    pkt.extend_from_slice(&0x0a0a0a0au32.to_be_bytes());
    pkt.push(dcid.len() as u8);
    pkt.extend_from_slice(&dcid);
    pkt.push(scid.len() as u8);
    pkt.extend_from_slice(&scid);
    pkt.resize(64, 0);
    probe.send_to(&pkt, "127.0.0.1:5508").unwrap();

    let mut buf = [0u8; 1500];
    let (n, from) = probe.recv_from(&mut buf).unwrap();
    assert_eq!(from.port(), 5508);
    let reply = &buf[..n];

    assert_eq!(reply[0] & 0x80, 0x80, "long header form bit");
    assert_eq!(&reply[1..5], &[0, 0, 0, 0], "version zero marks negotiation");

    // CIDs come back swapped so the initiator can match the reply.
    let mut at = 5;
    let reply_dcid_len = reply[at] as usize;
    at += 1;
    assert_eq!(&reply[at..at + reply_dcid_len], &scid);
    at += reply_dcid_len;
    let reply_scid_len = reply[at] as usize;
    at += 1;
    assert_eq!(&reply[at..at + reply_scid_len], &dcid);
    at += reply_scid_len;

    let versions: Vec<u32> = reply[at..]
        .chunks_exact(4)
        .map(|c| u32::from_be_bytes(c.try_into().unwrap()))
        .collect();
    assert!(
        versions.contains(&0x0000_0001),
        "supported list must include version 1, got {versions:#x?}"
    );

    net.close(true);
}
