//! Two media streams talking to each other over loopback UDP

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

use rvoip_rtp_transport::prelude::*;
use rvoip_rtp_transport::RtpTimestamp;

const PCMU: u8 = 0;
const TELEPHONE_EVENT: u8 = 101;

#[derive(Default)]
struct RecordingPhone {
    received: Mutex<Vec<(RtpSsrc, RtpTimestamp, Vec<u8>)>>,
    sources: Mutex<Vec<RtpSsrc>>,
}

impl RecordingPhone {
    fn received(&self) -> usize {
        self.received.lock().len()
    }
}

impl MediaDevice for RecordingPhone {
    fn media_type(&self) -> MediaType {
        MediaType::Audio
    }

    fn supported_direction(&self) -> MediaDirection {
        MediaDirection::SendRecv
    }

    fn format(&self) -> Option<MediaFormat> {
        Some(MediaFormat::audio("PCMU", 8000))
    }

    fn start(&self, _direction: MediaDirection) -> Result<()> {
        Ok(())
    }

    fn stop(&self, _direction: MediaDirection) -> Result<()> {
        Ok(())
    }

    fn add_receive_stream(&self, ssrc: RtpSsrc) {
        self.sources.lock().push(ssrc);
    }

    fn remove_receive_stream(&self, ssrc: RtpSsrc) {
        self.sources.lock().retain(|s| *s != ssrc);
    }

    fn deliver(&self, ssrc: RtpSsrc, timestamp: RtpTimestamp, payload: &[u8]) {
        self.received.lock().push((ssrc, timestamp, payload.to_vec()));
    }
}

struct Peer {
    stream: Arc<MediaStream>,
    phone: Arc<RecordingPhone>,
    events: broadcast::Receiver<MediaStreamEvent>,
}

async fn peer() -> Peer {
    let sockets = StreamConnector::bind_udp("127.0.0.1:0".parse().unwrap(), "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let config = TransportConfigBuilder::new().use_send_thread(false).build().unwrap();
    let runtime = MediaRuntime::current(config).unwrap();
    let phone = Arc::new(RecordingPhone::default());
    let stream = MediaStreamBuilder::new(Connector::new(sockets, runtime), phone.clone())
        .build()
        .unwrap();
    stream.add_dynamic_rtp_payload_type(PCMU, MediaFormat::audio("PCMU", 8000)).unwrap();
    stream
        .add_dynamic_rtp_payload_type(TELEPHONE_EVENT, MediaFormat::telephone_event(8000))
        .unwrap();
    let events = stream.subscribe();
    Peer { stream, phone, events }
}

fn target_of(peer: &Peer) -> Target {
    let sockets = peer.stream.connector().stream_connector();
    Target::new(sockets.data_local_addr().unwrap(), sockets.control_local_addr().unwrap())
}

async fn connected_pair() -> (Peer, Peer) {
    let a = peer().await;
    let b = peer().await;
    a.stream.add_target(target_of(&b)).unwrap();
    b.stream.add_target(target_of(&a)).unwrap();
    a.stream.start().unwrap();
    b.stream.start().unwrap();
    (a, b)
}

/// Wait for the first event matching `predicate`
async fn wait_for<F>(events: &mut broadcast::Receiver<MediaStreamEvent>, predicate: F) -> MediaStreamEvent
where
    F: Fn(&MediaStreamEvent) -> bool,
{
    timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("event not received in time")
}

async fn wait_until(condition: impl Fn() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time")
}

async fn send_frames(stream: &MediaStream, count: usize) {
    for i in 0..count {
        stream.send_media(&[0xFF; 160], 160, i == 0).await.unwrap();
        sleep(Duration::from_millis(2)).await;
    }
}

#[tokio::test]
async fn test_media_reaches_remote_device() {
    let (a, mut b) = connected_pair().await;
    let a_ssrc = a.stream.local_ssrc().unwrap();

    send_frames(&a.stream, 5).await;
    wait_until(|| b.phone.received() == 5).await;

    let received = b.phone.received.lock().clone();
    assert!(received.iter().all(|(ssrc, _, payload)| *ssrc == a_ssrc && payload.len() == 160));
    // timestamps advance by the frame size
    assert_eq!(received[1].1.wrapping_sub(received[0].1), 160);

    assert_eq!(b.stream.remote_ssrcs(), vec![a_ssrc]);
    assert_eq!(*b.phone.sources.lock(), vec![a_ssrc]);
    wait_for(&mut b.events, |e| *e == MediaStreamEvent::RemoteSsrcAdded { ssrc: a_ssrc }).await;

    let source = b.stream.stats().receive_statistics().source(a_ssrc).unwrap();
    assert_eq!(source.packets_received, 5);

    a.stream.close().await;
    b.stream.close().await;
}

#[tokio::test]
async fn test_muted_stream_sends_nothing() {
    let (a, b) = connected_pair().await;
    a.stream.set_mute(true);
    send_frames(&a.stream, 3).await;
    a.stream.set_mute(false);
    send_frames(&a.stream, 1).await;

    wait_until(|| b.phone.received() == 1).await;
    sleep(Duration::from_millis(20)).await;
    assert_eq!(b.phone.received(), 1);

    a.stream.close().await;
    b.stream.close().await;
}

#[tokio::test]
async fn test_receiver_report_reaches_sender() {
    let (mut a, b) = connected_pair().await;
    let a_ssrc = a.stream.local_ssrc().unwrap();
    let b_ssrc = b.stream.local_ssrc().unwrap();

    send_frames(&a.stream, 10).await;
    wait_until(|| b.phone.received() == 10).await;
    a.stream.send_rtcp_report().await.unwrap();
    wait_until(|| b.stream.stats().snapshot().rtcp_packets_received >= 1).await;

    sleep(Duration::from_millis(20)).await;
    b.stream.send_rtcp_report().await.unwrap();

    let event = wait_for(&mut a.events, |e| matches!(e, MediaStreamEvent::RtcpReportReceived { .. })).await;
    match event {
        MediaStreamEvent::RtcpReportReceived { ssrc, loss_percent, .. } => {
            assert_eq!(ssrc, b_ssrc);
            assert_eq!(loss_percent, 0.0);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_ne!(a_ssrc, b_ssrc);

    a.stream.close().await;
    b.stream.close().await;
}

#[tokio::test]
async fn test_bye_removes_remote_source() {
    let (a, mut b) = connected_pair().await;
    let a_ssrc = a.stream.local_ssrc().unwrap();

    send_frames(&a.stream, 2).await;
    wait_until(|| b.phone.received() == 2).await;

    a.stream.close().await;
    wait_for(&mut b.events, |e| *e == MediaStreamEvent::RemoteSsrcRemoved { ssrc: a_ssrc }).await;
    assert!(b.stream.remote_ssrcs().is_empty());
    assert!(b.phone.sources.lock().is_empty());

    b.stream.close().await;
}

#[tokio::test]
async fn test_dtmf_tone_between_streams() {
    let (a, mut b) = connected_pair().await;
    let a_ssrc = a.stream.local_ssrc().unwrap();

    a.stream.start_sending_dtmf(DtmfTone::Digit5).unwrap();
    send_frames(&a.stream, 8).await;
    a.stream.stop_sending_dtmf();
    send_frames(&a.stream, 8).await;

    let started = wait_for(&mut b.events, |e| matches!(e, MediaStreamEvent::DtmfToneStarted { .. })).await;
    assert_eq!(
        started,
        MediaStreamEvent::DtmfToneStarted {
            tone: DtmfTone::Digit5,
            ssrc: a_ssrc
        }
    );
    let ended = wait_for(&mut b.events, |e| matches!(e, MediaStreamEvent::DtmfToneEnded { .. })).await;
    assert_eq!(
        ended,
        MediaStreamEvent::DtmfToneEnded {
            tone: DtmfTone::Digit5,
            ssrc: a_ssrc
        }
    );

    // telephone events never reach the device as audio
    wait_until(|| b.phone.received() > 0).await;
    assert!(b.phone.received.lock().iter().all(|(_, _, payload)| payload.len() == 160));

    a.stream.close().await;
    b.stream.close().await;
}

#[tokio::test]
async fn test_direction_change_stops_delivery() {
    let (a, b) = connected_pair().await;

    send_frames(&a.stream, 1).await;
    wait_until(|| b.phone.received() == 1).await;

    b.stream.set_direction(MediaDirection::SendOnly).unwrap();
    assert_eq!(b.stream.started_direction(), MediaDirection::SendOnly);
    send_frames(&a.stream, 3).await;
    sleep(Duration::from_millis(30)).await;
    assert_eq!(b.phone.received(), 1);

    b.stream.set_direction(MediaDirection::SendRecv).unwrap();
    send_frames(&a.stream, 1).await;
    wait_until(|| b.phone.received() == 2).await;

    a.stream.close().await;
    b.stream.close().await;
}

#[tokio::test]
async fn test_external_transformer_sees_outgoing_packets() {
    struct Counter(std::sync::atomic::AtomicUsize);

    impl PacketTransformer for Counter {
        fn transform(&self, _pkt: &mut RawPacket) -> TransformOutcome {
            self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            TransformOutcome::Continue
        }

        fn reverse_transform(&self, _pkt: &mut RawPacket) -> TransformOutcome {
            TransformOutcome::Continue
        }
    }

    let (a, b) = connected_pair().await;
    let counter = Arc::new(Counter(Default::default()));
    let transformer: Arc<dyn PacketTransformer> = counter.clone();
    a.stream.set_external_transformer(Some(transformer), None);

    send_frames(&a.stream, 4).await;
    wait_until(|| b.phone.received() == 4).await;
    assert_eq!(counter.0.load(std::sync::atomic::Ordering::Relaxed), 4);

    a.stream.close().await;
    b.stream.close().await;
}
