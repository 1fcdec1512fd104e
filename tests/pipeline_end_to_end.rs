use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use image::{Rgb, RgbImage};

use stream_relay::dedup::DuplicateSuppressor;
use stream_relay::detect::{InferParams, StubBackend};
use stream_relay::frame::{Frame, PipelineSlots};
use stream_relay::notify::{self, StreamIdentity};
use stream_relay::overlay::OverlayPainter;
use stream_relay::pipeline::{InferenceSettings, InferenceStage, PipelineState};
use stream_relay::server::{FeedKind, Publisher};

const WHITE: Rgb<u8> = Rgb([255, 255, 255]);

fn stage(slots: &PipelineSlots, state: Arc<PipelineState>) -> InferenceStage {
    let (queue, _rx) = notify::channel(8);
    InferenceStage::new(
        Box::new(StubBackend::new()),
        slots.raw.clone(),
        slots.ai.clone(),
        state,
        OverlayPainter::bundled().expect("bundled font"),
        DuplicateSuppressor::default(),
        queue,
        InferenceSettings {
            output_width: 160,
            output_height: 120,
            process_every_n: 1,
            params: InferParams::default(),
            identity: StreamIdentity {
                name: "Gate".into(),
                device_type: "Drone".into(),
            },
        },
    )
}

#[test]
fn ai_session_observes_the_latest_frame() {
    let slots = PipelineSlots::new();
    let state = Arc::new(PipelineState::new());
    let inference = stage(&slots, state.clone());
    let worker = thread::spawn(move || inference.run());

    for seq in 1..=5 {
        slots
            .raw
            .push(Arc::new(Frame::new(RgbImage::from_pixel(320, 240, WHITE), seq)));
        thread::sleep(Duration::from_millis(5));
    }

    let mut session = Publisher::new(FeedKind::Ai, slots.ai.clone(), 160, 120);
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut seen = session.tick();
    while seen.seq != 5 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
        seen = session.tick();
    }

    state.request_stop();
    worker.join().expect("inference thread");

    assert_eq!(seen.seq, 5);
    assert_eq!((seen.width(), seen.height()), (160, 120));
    // Banner background covers the top-left corner.
    assert_eq!(*seen.image().get_pixel(2, 2), Rgb([0, 0, 0]));
    // Banner caption is drawn in green over it.
    let caption_pixels = seen
        .image()
        .enumerate_pixels()
        .filter(|(_, y, p)| *y < 30 && p[1] > 100 && p[0] < 60 && p[2] < 60)
        .count();
    assert!(caption_pixels > 20, "banner caption missing");
    // Away from the banner the frame is untouched.
    assert_eq!(*seen.image().get_pixel(150, 60), WHITE);
    // A further tick with nothing new repeats the same frame.
    assert_eq!(session.tick().seq, 5);
    assert!(state.is_healthy());
}
