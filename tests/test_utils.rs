//! Shared utilities for integration tests

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

use soundtrace::grouper::DetectionTable;
use soundtrace::simulate;
use soundtrace::ReceiverCoords;

pub const SAMPLE_RATE: u32 = 22050;
pub const SPEED_OF_SOUND: f64 = 343.0;

/// Initialize tracing with environment-based filtering
///
/// Controlled by RUST_LOG, e.g. `RUST_LOG=soundtrace=debug`. Safe to call
/// from every test; initialization happens once.
pub fn init_test_tracing() {
    static TRACING: Lazy<()> = Lazy::new(|| {
        use tracing_subscriber::{fmt, EnvFilter};

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("soundtrace=warn"));

        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_line_number(true)
            .with_test_writer()
            .init();
    });

    Lazy::force(&TRACING);
}

/// Write mono 16-bit PCM samples to a WAV file
pub fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).expect("create WAV fixture");
    for &s in samples {
        writer
            .write_sample((s.clamp(-1.0, 1.0) * 32767.0) as i16)
            .expect("write WAV sample");
    }
    writer.finalize().expect("finalize WAV fixture");
}

/// A synthesized array scenario on disk: one WAV per receiver plus the
/// matching coordinate table and detection table
pub struct ArrayFixture {
    pub dir: PathBuf,
    pub coords: ReceiverCoords,
    pub detections: DetectionTable,
    pub source: Vec<f64>,
}

/// Synthesize recordings of a single chirp event and write them to a fresh
/// temp directory
///
/// Every receiver detects class "song" in the window [0.5, 2.0]; the chirp
/// is emitted at 0.8 s so all arrivals land inside the window.
pub fn build_array_fixture(
    tag: &str,
    source: &[f64],
    receiver_positions: &[Vec<f64>],
) -> ArrayFixture {
    let dir = std::env::temp_dir().join(format!("soundtrace_it_{tag}"));
    std::fs::create_dir_all(&dir).expect("create fixture dir");

    let tone = simulate::chirp(SAMPLE_RATE, 600.0, 3000.0, 0.25, 0.5);
    let recordings = simulate::synthesize_recordings(
        source,
        receiver_positions,
        &tone,
        0.8,
        3.0,
        SAMPLE_RATE,
        SPEED_OF_SOUND,
        0.01,
    )
    .expect("synthesize recordings");

    let mut coords = ReceiverCoords::new();
    let mut detections = DetectionTable::new(vec!["song".to_string()]);
    for (i, (samples, position)) in recordings.iter().zip(receiver_positions).enumerate() {
        let path = dir.join(format!("rec_{i}.wav"));
        write_wav(&path, samples, SAMPLE_RATE);
        coords
            .insert(path.clone(), position.clone())
            .expect("insert coords");
        detections
            .push_clip(path, 0.5, 2.0, vec![true])
            .expect("push clip");
    }

    ArrayFixture {
        dir,
        coords,
        detections,
        source: source.to_vec(),
    }
}

impl Drop for ArrayFixture {
    fn drop(&mut self) {
        std::fs::remove_dir_all(&self.dir).ok();
    }
}
