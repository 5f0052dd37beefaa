//! Audio module for the live interview
//!
//! Microphone capture (CPAL) feeding 16kHz PCM16 frames upstream, and gapless
//! scheduled playback of the 24kHz voice coming back.

pub mod capture;
pub mod codec;
pub mod microphone;
pub mod playback;
pub mod resample;
pub mod speaker;

pub use capture::{
    CaptureConfig, CaptureError, CapturePipeline, FrameAssembler, Microphone, MicrophoneStream,
    SampleCallback,
};
pub use codec::{
    decode_transport, encode_transport, AudioFrame, DecodeError, EncodedPacket, PlaybackBuffer,
    CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE,
};
pub use microphone::CpalMicrophone;
pub use playback::{
    FinishedSender, PlaybackDevice, PlaybackError, PlaybackScheduler, SourceId, Speaker,
};
pub use speaker::CpalSpeaker;

/// Wait for an audio thread to exit without holding up the async runtime.
///
/// cpal can take a while to tear a stream down. Inside a runtime the join is
/// handed to the blocking pool; elsewhere it happens inline.
pub(crate) fn join_audio_thread(thread: std::thread::JoinHandle<()>, name: &'static str) {
    let join = move || {
        if thread.join().is_err() {
            log::warn!("{} thread panicked during shutdown", name);
        }
    };

    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            drop(runtime.spawn_blocking(join));
        }
        Err(_) => join(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{mpsc, Arc};
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_join_does_not_block_the_runtime() {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let thread = std::thread::spawn(move || {
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
        });

        let started = Instant::now();
        join_audio_thread(thread, "Slow");
        assert!(started.elapsed() < Duration::from_millis(500));

        drop(release_tx);
    }

    #[test]
    fn test_join_inline_outside_runtime() {
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            flag.store(true, Ordering::SeqCst);
        });

        join_audio_thread(thread, "Quick");
        assert!(done.load(Ordering::SeqCst));
    }
}
