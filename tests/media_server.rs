//! End-to-end scenarios against the public API, driven over real UDP
//! sockets — mirroring how `crates/service/tests/turn.rs` exercises the
//! teacher's `SessionManager` end to end with `#[tokio::test]` rather
//! than unit-testing internals directly.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use rtp_media_server::codec::{Codec, RtpHeader};
use rtp_media_server::server::{MediaServer, MediaServerOptions, MediaSink};

/// Captures every frame the core hands upstream, in arrival order, for
/// assertions. Non-blocking per the sink contract (spec §6).
#[derive(Default)]
struct CapturingSink {
    frames: Mutex<Vec<(u32, Vec<u8>)>>,
}

impl MediaSink for CapturingSink {
    fn on_frame(&self, ssrc: u32, frame: &[u8]) -> bool {
        self.frames.lock().unwrap().push((ssrc, frame.to_vec()));
        true
    }
}

async fn start_server() -> (Arc<MediaServer>, Arc<CapturingSink>, SocketAddr) {
    let sink = Arc::new(CapturingSink::default());
    let options = MediaServerOptions {
        listen: "127.0.0.1:0".parse().unwrap(),
        codec: Codec::Ulaw,
        idle_timeout: Duration::from_secs(30),
        stats_interval_frames: 50,
    };
    let server = Arc::new(MediaServer::new(options, sink.clone() as Arc<dyn MediaSink>));
    server.start().await.unwrap();
    let addr = server.get_stats().host;
    (server, sink, addr)
}

fn build_ulaw_packet(sequence: u16, timestamp: u32, ssrc: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    RtpHeader::encode(false, 0, sequence, timestamp, ssrc, payload, &mut buf);
    buf.to_vec()
}

async fn send(client: &UdpSocket, server_addr: SocketAddr, packet: &[u8]) {
    client.send_to(packet, server_addr).await.unwrap();
}

/// Polls `f` until it returns `Some`, or panics after a generous timeout
/// — the receiver processes datagrams asynchronously, so tests can't
/// assert immediately after `send_to` returns.
async fn wait_for<T>(mut f: impl FnMut() -> Option<T>) -> T {
    timeout(Duration::from_secs(2), async {
        loop {
            if let Some(v) = f() {
                return v;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition was not met within timeout")
}

#[tokio::test]
async fn s1_happy_path_ulaw_inbound() {
    let (server, sink, addr) = start_server().await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    const SSRC: u32 = 0x1111_1111;
    let silence = vec![0xFFu8; 160];
    for i in 0..5u16 {
        let packet = build_ulaw_packet(100 + i, (i as u32) * 160, SSRC, &silence);
        send(&client, addr, &packet).await;
    }

    wait_for(|| (sink.frames.lock().unwrap().len() >= 5).then_some(())).await;

    let call_id = server.get_call_id_for_ssrc(SSRC).expect("session created");
    assert!(call_id.starts_with("call_0x11111111_"));

    let stats = server.get_session_stats(&call_id).unwrap();
    assert_eq!(stats.frames_received, 5);
    assert_eq!(stats.frames_processed, 5);
    assert_eq!(stats.packet_loss_count, 0);

    let frames = sink.frames.lock().unwrap();
    assert_eq!(frames.len(), 5);
    for (ssrc, frame) in frames.iter() {
        assert_eq!(*ssrc, SSRC);
        assert_eq!(frame.len(), 640);
        for chunk in frame.chunks_exact(2) {
            let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
            assert!(sample.abs() < 10, "expected near-silence, got {sample}");
        }
    }

    server.stop().await.unwrap();
}

#[tokio::test]
async fn s2_loss_detection() {
    let (server, sink, addr) = start_server().await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    const SSRC: u32 = 0x2222_2222;
    let silence = vec![0xFFu8; 160];
    for seq in [10u16, 11, 12, 15, 16] {
        let packet = build_ulaw_packet(seq, seq as u32 * 160, SSRC, &silence);
        send(&client, addr, &packet).await;
    }

    wait_for(|| {
        let frames = sink.frames.lock().unwrap();
        (frames.iter().filter(|(s, _)| *s == SSRC).count() >= 5).then_some(())
    })
    .await;

    let call_id = server.get_call_id_for_ssrc(SSRC).unwrap();
    let stats = server.get_session_stats(&call_id).unwrap();
    assert_eq!(stats.frames_received, 5);
    assert_eq!(stats.packet_loss_count, 2);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn s3_reorder_does_not_inflate_loss_count() {
    let (server, sink, addr) = start_server().await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    const SSRC: u32 = 0x3333_3333;
    let silence = vec![0xFFu8; 160];
    for seq in [50u16, 51, 53, 52, 54] {
        let packet = build_ulaw_packet(seq, seq as u32 * 160, SSRC, &silence);
        send(&client, addr, &packet).await;
    }

    wait_for(|| {
        let frames = sink.frames.lock().unwrap();
        (frames.iter().filter(|(s, _)| *s == SSRC).count() >= 5).then_some(())
    })
    .await;

    let call_id = server.get_call_id_for_ssrc(SSRC).unwrap();
    let stats = server.get_session_stats(&call_id).unwrap();
    assert_eq!(stats.packet_loss_count, 1);
    assert_eq!(stats.last_sequence, Some(54));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn s4_outbound_framing() {
    let (server, sink, addr) = start_server().await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    const SSRC: u32 = 0x4444_4444;
    // one inbound packet to create the session and learn the remote
    // endpoint the outbound path will target.
    let packet = build_ulaw_packet(1, 0, SSRC, &vec![0xFFu8; 160]);
    send(&client, addr, &packet).await;
    wait_for(|| (!sink.frames.lock().unwrap().is_empty()).then_some(())).await;

    let call_id = server.get_call_id_for_ssrc(SSRC).unwrap();

    let pcm16_16k = vec![0u8; 1280]; // 40ms at 16kHz
    server.send_audio(&call_id, &pcm16_16k).await.unwrap();

    let mut buf = [0u8; 1500];
    let (len1, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let (header1, payload1_len) = {
        let (header1, payload1) = RtpHeader::parse(&buf[..len1]).unwrap();
        (header1, payload1.len())
    };

    let (len2, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let (header2, payload2) = RtpHeader::parse(&buf[..len2]).unwrap();

    assert_eq!(payload1_len, 160);
    assert_eq!(payload2.len(), 160);
    assert_eq!(header2.sequence, header1.sequence.wrapping_add(1));
    assert_eq!(header2.timestamp, header1.timestamp.wrapping_add(160));
    assert_eq!(header1.payload_type, 0);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn invariant_6_session_isolation_under_interleaving() {
    let (server, sink, addr) = start_server().await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    const SSRC_A: u32 = 0xAAAA_0001;
    const SSRC_B: u32 = 0xBBBB_0002;
    let silence = vec![0xFFu8; 160];

    // interleave two independent streams' packets.
    for i in 0..4u16 {
        let a = build_ulaw_packet(i, i as u32 * 160, SSRC_A, &silence);
        let b = build_ulaw_packet(100 + i, i as u32 * 160, SSRC_B, &silence);
        send(&client, addr, &a).await;
        send(&client, addr, &b).await;
    }

    wait_for(|| {
        let frames = sink.frames.lock().unwrap();
        let a = frames.iter().filter(|(s, _)| *s == SSRC_A).count();
        let b = frames.iter().filter(|(s, _)| *s == SSRC_B).count();
        (a >= 4 && b >= 4).then_some(())
    })
    .await;

    let call_id_a = server.get_call_id_for_ssrc(SSRC_A).unwrap();
    let call_id_b = server.get_call_id_for_ssrc(SSRC_B).unwrap();
    assert_ne!(call_id_a, call_id_b);

    let stats_a = server.get_session_stats(&call_id_a).unwrap();
    let stats_b = server.get_session_stats(&call_id_b).unwrap();
    assert_eq!(stats_a.frames_received, 4);
    assert_eq!(stats_b.frames_received, 4);
    assert_eq!(stats_a.packet_loss_count, 0);
    assert_eq!(stats_b.packet_loss_count, 0);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn cleanup_session_is_idempotent_end_to_end() {
    let (server, sink, addr) = start_server().await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    const SSRC: u32 = 0x5555_5555;
    let packet = build_ulaw_packet(1, 0, SSRC, &vec![0xFFu8; 160]);
    send(&client, addr, &packet).await;
    wait_for(|| (!sink.frames.lock().unwrap().is_empty()).then_some(())).await;

    let call_id = server.get_call_id_for_ssrc(SSRC).unwrap();
    assert!(server.get_session_info(&call_id).is_some());

    server.cleanup_session(&call_id);
    server.cleanup_session(&call_id);

    assert!(server.get_session_info(&call_id).is_none());
    assert!(server.get_call_id_for_ssrc(SSRC).is_none());

    server.stop().await.unwrap();
}
