//! Sync Correction Demo
//!
//! Plays a simulated video that runs slower than real time, answers its
//! position reports with the reference drift policy and shows the handler
//! walking through rate adjustment and seeking.

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use watchsync::{
    init_logging, ChannelSink, DriftTracker, EventEmitter, OutboundMessage, PlayerControl,
    ReferenceClock, RoomPlaybackState, SyncConfig, SyncCorrectionHandler,
};

/// Player whose clock advances at `speed` times the requested rate
struct LaggingPlayer {
    speed: f64,
    state: Mutex<(Instant, f64, f64)>,
}

impl LaggingPlayer {
    fn new(speed: f64) -> Self {
        Self {
            speed,
            state: Mutex::new((Instant::now(), 0.0, 1.0)),
        }
    }
}

impl PlayerControl for LaggingPlayer {
    fn set_playback_rate(&self, rate: f64) {
        let position = self.current_time();
        *self.state.lock() = (Instant::now(), position, rate);
        println!("   ▶️  player rate -> {:.2}", rate);
    }

    fn seek_to(&self, seconds: f64) {
        let mut state = self.state.lock();
        let rate = state.2;
        *state = (Instant::now(), seconds, rate);
        println!("   ⏩ player seek -> {:.2}s", seconds);
    }

    fn current_time(&self) -> f64 {
        let (anchor, position, rate) = *self.state.lock();
        position + anchor.elapsed().as_secs_f64() * rate * self.speed
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;

    println!("🎬 Sync Correction Demo");
    println!("=======================");

    let (sink, mut outbound) = ChannelSink::new();
    let (emitter, mut events) = EventEmitter::channel();
    let player = Arc::new(LaggingPlayer::new(0.4));
    let config = SyncConfig {
        report_interval: Duration::from_millis(500),
    };
    let handler = SyncCorrectionHandler::new(config, player.clone(), Arc::new(sink), emitter);

    let clock = ReferenceClock::new(0.0, true, Utc::now());
    let mut tracker = DriftTracker::default();

    handler.apply_room_state(RoomPlaybackState {
        room_code: "DEMO42".to_string(),
        current_video_url: Some("https://www.youtube.com/watch?v=dQw4w9WgXcQ".to_string()),
        current_time_seconds: 0.0,
        is_playing: true,
    });
    println!("✅ Room is playing, reporting every 500ms");

    let mut handled = 0;
    while handled < 12 {
        let Some(message) = outbound.recv().await else {
            break;
        };
        let OutboundMessage::PositionReport(report) = message else {
            continue;
        };
        handled += 1;

        let now = Utc::now();
        println!(
            "\n📍 report {:>2}: local {:.2}s, reference {:.2}s",
            handled,
            report.current_time_seconds,
            clock.expected_position(now)
        );
        match tracker.on_report("local", report.current_time_seconds, &clock, now) {
            Some(correction) => {
                println!("   🛠️  server sends {:?}", correction.correction_type);
                let state = handler.apply_correction(&correction)?;
                println!("   state: {}", state);
            }
            None => println!("   ✅ within tolerance ({})", handler.sync_state()),
        }
    }

    handler.leave();
    println!("\n📊 Events");
    for event in events.drain() {
        println!("   {}: {:?}", event.event_type(), event);
    }
    Ok(())
}
