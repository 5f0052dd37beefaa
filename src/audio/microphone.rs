//! CPAL-backed microphone
//!
//! `cpal::Stream` is not `Send` on every platform, so each acquired stream
//! lives on a dedicated audio thread. The handle returned to the session only
//! holds a callback slot and a stop channel, which keeps it `Send`.
//!
//! The device is opened (and the OS permission indicator lit) on `acquire()`.
//! Samples are discarded until a pipeline installs its callback with `start()`.

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, Sample, SampleFormat, Stream, StreamConfig};

use super::capture::{CaptureError, Microphone, MicrophoneStream, SampleCallback};
use super::join_audio_thread;

type CallbackSlot = Arc<Mutex<Option<SampleCallback>>>;

/// Default system input device
#[derive(Debug, Default, Clone)]
pub struct CpalMicrophone;

impl CpalMicrophone {
    pub fn new() -> Self {
        Self
    }
}

impl Microphone for CpalMicrophone {
    fn acquire(&self) -> Result<Box<dyn MicrophoneStream>, CaptureError> {
        let slot: CallbackSlot = Arc::new(Mutex::new(None));
        let thread_slot = slot.clone();

        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(u32, u16), CaptureError>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || match open_input_stream(thread_slot) {
                Ok((stream, rate, channels)) => {
                    let _ = ready_tx.send(Ok((rate, channels)));
                    // Park until released (or the handle is dropped)
                    let _ = stop_rx.recv();
                    drop(stream);
                    log::debug!("Microphone thread exiting, device released");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| CaptureError::StreamFailed(format!("spawn audio thread: {}", e)))?;

        let (sample_rate, channels) = match ready_rx.recv() {
            Ok(result) => result?,
            Err(_) => {
                return Err(CaptureError::StreamFailed(
                    "audio thread exited before reporting".to_string(),
                ))
            }
        };

        Ok(Box::new(CpalInputStream {
            slot,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
            sample_rate,
            channels,
        }))
    }
}

/// Handle to an input stream running on its audio thread
pub struct CpalInputStream {
    slot: CallbackSlot,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    sample_rate: u32,
    channels: u16,
}

impl MicrophoneStream for CpalInputStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn start(&mut self, callback: SampleCallback) -> Result<(), CaptureError> {
        if self.stop_tx.is_none() {
            return Err(CaptureError::StreamFailed("stream already released".to_string()));
        }
        let mut guard = self
            .slot
            .lock()
            .map_err(|_| CaptureError::StreamFailed("callback slot poisoned".to_string()))?;
        *guard = Some(callback);
        Ok(())
    }

    fn release(&mut self) {
        if let Ok(mut guard) = self.slot.lock() {
            guard.take();
        }

        let Some(stop_tx) = self.stop_tx.take() else {
            return;
        };
        let _ = stop_tx.send(());

        if let Some(thread) = self.thread.take() {
            join_audio_thread(thread, "Microphone");
        }
        log::info!("Microphone released");
    }
}

impl Drop for CpalInputStream {
    fn drop(&mut self) {
        self.release();
    }
}

fn open_input_stream(slot: CallbackSlot) -> Result<(Stream, u32, u16), CaptureError> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or(CaptureError::NoInputDevice)?;

    log::info!("Using audio input device: {:?}", device.name());

    let supported_config = device
        .default_input_config()
        .map_err(|e| CaptureError::UnsupportedConfig(e.to_string()))?;

    log::info!(
        "Input config: {} Hz, {} channels, {:?}",
        supported_config.sample_rate().0,
        supported_config.channels(),
        supported_config.sample_format()
    );

    let sample_format = supported_config.sample_format();
    let config: StreamConfig = supported_config.into();

    let stream = match sample_format {
        SampleFormat::I16 => build_stream_typed::<i16>(&device, &config, slot)?,
        SampleFormat::U16 => build_stream_typed::<u16>(&device, &config, slot)?,
        SampleFormat::F32 => build_stream_typed::<f32>(&device, &config, slot)?,
        other => {
            return Err(CaptureError::UnsupportedConfig(format!(
                "sample format {:?}",
                other
            )))
        }
    };

    stream
        .play()
        .map_err(|e| CaptureError::StreamFailed(format!("Failed to start stream: {}", e)))?;

    Ok((stream, config.sample_rate.0, config.channels))
}

fn build_stream_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    slot: CallbackSlot,
) -> Result<Stream, CaptureError>
where
    T: cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let err_fn = |err: cpal::StreamError| log::error!("Audio input stream error: {}", err);
    let mut scratch: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                // Never block the audio thread on a contended slot
                let Ok(mut guard) = slot.try_lock() else {
                    return;
                };
                if let Some(callback) = guard.as_mut() {
                    scratch.clear();
                    scratch.extend(data.iter().map(|&s| s.to_sample::<f32>()));
                    callback(&scratch);
                }
            },
            err_fn,
            None,
        )
        .map_err(map_build_error)
}

fn map_build_error(err: BuildStreamError) -> CaptureError {
    match err {
        BuildStreamError::DeviceNotAvailable => {
            CaptureError::PermissionDenied("input device not available".to_string())
        }
        BuildStreamError::StreamConfigNotSupported => {
            CaptureError::UnsupportedConfig("stream config not supported".to_string())
        }
        other => CaptureError::StreamFailed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_not_available_maps_to_permission_denied() {
        let err = map_build_error(BuildStreamError::DeviceNotAvailable);
        assert!(matches!(err, CaptureError::PermissionDenied(_)));
    }

    #[test]
    fn test_unsupported_config_maps() {
        let err = map_build_error(BuildStreamError::StreamConfigNotSupported);
        assert!(matches!(err, CaptureError::UnsupportedConfig(_)));
    }

    #[test]
    #[ignore] // Requires an audio input device
    fn test_acquire_and_release_default_microphone() {
        let mut stream = CpalMicrophone::new().acquire().expect("microphone");
        assert!(stream.sample_rate() > 0);
        stream.release();
        stream.release();
    }
}
