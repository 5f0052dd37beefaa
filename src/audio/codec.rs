//! PCM16 codec and transport encoding
//!
//! The live voice API exchanges raw little-endian PCM16 mono audio, base64
//! encoded, tagged with an `audio/pcm;rate=<R>` MIME descriptor.
//!
//! ```text
//! f32 [-1, 1] ──▶ i16 LE bytes ──▶ base64 text   (capture)
//! base64 text ──▶ i16 LE bytes ──▶ f32 [-1, 1]   (playback)
//! ```

use base64::{engine::general_purpose::STANDARD, Engine};

/// Sample rate of captured microphone audio sent upstream
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Native sample rate of the remote voice
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// Normalization divisor between f32 and i16 samples
const PCM16_SCALE: f32 = 32768.0;

/// Errors produced while decoding received audio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Text contains characters outside the base64 alphabet (or bad padding)
    InvalidTransport(String),
    /// Byte count is not a whole number of 16-bit samples
    MisalignedPcm { len: usize },
    /// Channel count of zero
    InvalidChannels,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::InvalidTransport(e) => write!(f, "Invalid base64 audio payload: {}", e),
            DecodeError::MisalignedPcm { len } => {
                write!(f, "PCM16 payload has odd length ({} bytes)", len)
            }
            DecodeError::InvalidChannels => write!(f, "Channel count must be at least 1"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Encode arbitrary bytes as transport-safe text
pub fn encode_transport(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode transport text back into bytes
pub fn decode_transport(text: &str) -> Result<Vec<u8>, DecodeError> {
    STANDARD
        .decode(text)
        .map_err(|e| DecodeError::InvalidTransport(e.to_string()))
}

/// Convert a single normalized float sample to PCM16.
///
/// Input is clamped to [-1.0, 1.0] and the conversion saturates, so 1.0 maps
/// to `i16::MAX` instead of wrapping. NaN becomes 0.
pub fn float_to_pcm16(sample: f32) -> i16 {
    // `as` saturates on overflow and maps NaN to 0
    (sample.clamp(-1.0, 1.0) * PCM16_SCALE) as i16
}

/// Convert a PCM16 sample to a normalized float
pub fn pcm16_to_float(sample: i16) -> f32 {
    sample as f32 / PCM16_SCALE
}

/// Convert float samples to little-endian PCM16 bytes
pub fn samples_to_bytes(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| float_to_pcm16(s).to_le_bytes())
        .collect()
}

/// Interpret little-endian PCM16 bytes as de-interleaved float channels.
///
/// Returns one `Vec<f32>` per channel. A trailing partial frame is dropped.
pub fn bytes_to_samples(bytes: &[u8], channels: usize) -> Result<Vec<Vec<f32>>, DecodeError> {
    if channels == 0 {
        return Err(DecodeError::InvalidChannels);
    }
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::MisalignedPcm { len: bytes.len() });
    }

    let frame_count = bytes.len() / 2 / channels;
    let mut out = vec![Vec::with_capacity(frame_count); channels];

    for (i, pair) in bytes.chunks_exact(2).take(frame_count * channels).enumerate() {
        let sample = i16::from_le_bytes([pair[0], pair[1]]);
        out[i % channels].push(pcm16_to_float(sample));
    }

    Ok(out)
}

/// Build the MIME descriptor for raw PCM at the given rate
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Extract the `rate=` parameter from a PCM MIME descriptor
pub fn parse_pcm_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.trim().split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, value)| value.trim().parse().ok())
}

/// A block of mono PCM16 samples at a fixed rate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Vec<i16>,
    sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Quantize normalized float samples into a frame
    pub fn from_float(samples: &[f32], sample_rate: u32) -> Self {
        Self::new(
            samples.iter().map(|&s| float_to_pcm16(s)).collect(),
            sample_rate,
        )
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Duration in seconds
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Raw little-endian bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    /// Encode for the transport
    pub fn to_packet(&self) -> EncodedPacket {
        EncodedPacket {
            data: encode_transport(&self.to_bytes()),
            mime_type: pcm_mime_type(self.sample_rate),
        }
    }
}

/// Transport-encoded audio with its MIME descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPacket {
    pub data: String,
    pub mime_type: String,
}

impl EncodedPacket {
    pub fn new(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }

    /// Sample rate from the descriptor, defaulting to the playback rate
    pub fn sample_rate(&self) -> u32 {
        parse_pcm_rate(&self.mime_type).unwrap_or(PLAYBACK_SAMPLE_RATE)
    }

    /// Decode back into a PCM16 frame
    pub fn to_frame(&self) -> Result<AudioFrame, DecodeError> {
        let bytes = decode_transport(&self.data)?;
        if bytes.len() % 2 != 0 {
            return Err(DecodeError::MisalignedPcm { len: bytes.len() });
        }
        let samples = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Ok(AudioFrame::new(samples, self.sample_rate()))
    }

    /// Decode into a float buffer ready for the output device
    pub fn decode_playback(&self, channels: usize) -> Result<PlaybackBuffer, DecodeError> {
        let bytes = decode_transport(&self.data)?;
        let samples = bytes_to_samples(&bytes, channels)?;
        Ok(PlaybackBuffer {
            channels: samples,
            sample_rate: self.sample_rate(),
        })
    }
}

/// Decoded float audio, one vector per channel
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    channels: Vec<Vec<f32>>,
    sample_rate: u32,
}

impl PlaybackBuffer {
    pub fn new(channels: Vec<Vec<f32>>, sample_rate: u32) -> Self {
        Self {
            channels,
            sample_rate,
        }
    }

    /// Mono buffer convenience constructor
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self::new(vec![samples], sample_rate)
    }

    pub fn frame_count(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frame_count() as f64 / self.sample_rate as f64
    }

    /// Collapse to a single channel by averaging
    pub fn into_mono(self) -> Vec<f32> {
        let count = self.channels.len();
        if count <= 1 {
            return self.channels.into_iter().next().unwrap_or_default();
        }
        let frames = self.frame_count();
        (0..frames)
            .map(|i| self.channels.iter().map(|c| c[i]).sum::<f32>() / count as f32)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_round_trip() {
        let cases: Vec<Vec<u8>> = vec![vec![], vec![0x01], vec![0xff, 0x00, 0x7f], (0..=255).collect()];
        for bytes in cases {
            let text = encode_transport(&bytes);
            assert_eq!(decode_transport(&text).unwrap(), bytes);
        }
    }

    #[test]
    fn test_decode_transport_rejects_foreign_characters() {
        let err = decode_transport("AAA*").unwrap_err();
        assert!(matches!(err, DecodeError::InvalidTransport(_)));
    }

    #[test]
    fn test_samples_little_endian_layout() {
        // 0.5 * 32768 = 16384 = 0x4000
        let bytes = samples_to_bytes(&[0.5, -0.5]);
        assert_eq!(bytes, vec![0x00, 0x40, 0x00, 0xc0]);
    }

    #[test]
    fn test_sample_round_trip_within_quantization() {
        let input: Vec<f32> = (0..200).map(|i| (i as f32 / 100.0) - 1.0).collect();
        let bytes = samples_to_bytes(&input);
        let output = bytes_to_samples(&bytes, 1).unwrap();

        assert_eq!(output.len(), 1);
        assert_eq!(output[0].len(), input.len());
        for (a, b) in input.iter().zip(&output[0]) {
            assert!((a - b).abs() <= 1.0 / 32768.0, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_out_of_range_saturates() {
        assert_eq!(float_to_pcm16(1.0), i16::MAX);
        assert_eq!(float_to_pcm16(1.5), i16::MAX);
        assert_eq!(float_to_pcm16(-1.0), i16::MIN);
        assert_eq!(float_to_pcm16(-7.0), i16::MIN);
        assert_eq!(float_to_pcm16(f32::NAN), 0);
    }

    #[test]
    fn test_bytes_to_samples_deinterleaves() {
        let frames: Vec<i16> = vec![100, -100, 200, -200, 300];
        let bytes: Vec<u8> = frames.iter().flat_map(|s| s.to_le_bytes()).collect();
        let channels = bytes_to_samples(&bytes, 2).unwrap();

        // Trailing partial frame (300) dropped
        assert_eq!(channels[0], vec![100.0 / 32768.0, 200.0 / 32768.0]);
        assert_eq!(channels[1], vec![-100.0 / 32768.0, -200.0 / 32768.0]);
    }

    #[test]
    fn test_bytes_to_samples_errors() {
        assert_eq!(
            bytes_to_samples(&[1, 2, 3], 1).unwrap_err(),
            DecodeError::MisalignedPcm { len: 3 }
        );
        assert_eq!(
            bytes_to_samples(&[1, 2], 0).unwrap_err(),
            DecodeError::InvalidChannels
        );
    }

    #[test]
    fn test_parse_pcm_rate() {
        assert_eq!(parse_pcm_rate("audio/pcm;rate=16000"), Some(16000));
        assert_eq!(parse_pcm_rate("audio/pcm; rate=24000"), Some(24000));
        assert_eq!(parse_pcm_rate("audio/pcm"), None);
        assert_eq!(parse_pcm_rate("audio/pcm;rate=abc"), None);
    }

    #[test]
    fn test_frame_packet_round_trip_is_lossless() {
        let frame = AudioFrame::new(vec![0, 1, -1, i16::MAX, i16::MIN, 1234], CAPTURE_SAMPLE_RATE);
        let packet = frame.to_packet();

        assert_eq!(packet.mime_type, "audio/pcm;rate=16000");
        assert_eq!(packet.to_frame().unwrap(), frame);
    }

    #[test]
    fn test_packet_defaults_to_playback_rate() {
        let packet = EncodedPacket::new(encode_transport(&[0, 0, 0, 0]), "audio/pcm");
        let buffer = packet.decode_playback(1).unwrap();
        assert_eq!(buffer.sample_rate(), PLAYBACK_SAMPLE_RATE);
        assert_eq!(buffer.frame_count(), 2);
    }

    #[test]
    fn test_playback_buffer_duration() {
        let buffer = PlaybackBuffer::mono(vec![0.0; 12_000], 24_000);
        assert!((buffer.duration() - 0.5).abs() < 1e-12);
        assert_eq!(PlaybackBuffer::mono(vec![], 0).duration(), 0.0);
    }

    #[test]
    fn test_into_mono_averages_channels() {
        let buffer = PlaybackBuffer::new(vec![vec![0.5, 1.0], vec![-0.5, 0.0]], 24_000);
        assert_eq!(buffer.into_mono(), vec![0.0, 0.5]);
    }
}
