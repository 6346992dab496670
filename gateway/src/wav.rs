//! Diagnostic WAV dump.
//!
//! Writes the first seconds of a session's PCM to disk so a failing tap can
//! be checked by ear. Informational only; any I/O error disables the dump
//! for the session without affecting media flow.

use std::path::Path;

use tracing::{debug, warn};

const SAMPLE_RATE: u32 = 16_000;
/// Capture roughly the first five seconds.
const MAX_SAMPLES: u32 = SAMPLE_RATE * 5;

/// Size-capped WAV writer for one session.
pub struct WavDump {
    writer: Option<hound::WavWriter<std::io::BufWriter<std::fs::File>>>,
    written: u32,
}

impl WavDump {
    /// Open a dump file named after `label` in `dir`. Returns `None` (after
    /// logging) when the file cannot be created.
    pub fn create(dir: &Path, label: &str) -> Option<WavDump> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let path = dir.join(format!("tapgate-{label}.wav"));
        match hound::WavWriter::create(&path, spec) {
            Ok(writer) => {
                debug!(path = %path.display(), "opened diagnostic WAV dump");
                Some(WavDump {
                    writer: Some(writer),
                    written: 0,
                })
            }
            Err(e) => {
                warn!(path = %path.display(), "cannot open WAV dump: {e}");
                None
            }
        }
    }

    /// Append little-endian PCM bytes; a trailing odd byte is ignored.
    pub fn write(&mut self, pcm: &[u8]) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };

        for pair in pcm.chunks_exact(2) {
            if self.written >= MAX_SAMPLES {
                self.finish();
                return;
            }
            let sample = i16::from_le_bytes([pair[0], pair[1]]);
            if writer.write_sample(sample).is_err() {
                self.writer = None;
                return;
            }
            self.written += 1;
        }
    }

    /// Flush and close the file. Safe to call more than once.
    pub fn finish(&mut self) {
        if let Some(writer) = self.writer.take()
            && let Err(e) = writer.finalize()
        {
            warn!("failed to finalize WAV dump: {e}");
        }
    }
}

impl Drop for WavDump {
    fn drop(&mut self) {
        self.finish();
    }
}
