use hound::WavReader;
use log::debug;
use std::borrow::Cow;
use std::fmt;
use std::io::Cursor;
use std::str::FromStr;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::config::AudioConfig;
use crate::error::{ExtractionError, InputError};

/// Container formats accepted by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioFormat {
    Mp3,
    Wav,
    Ogg,
    Flac,
}

impl AudioFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Wav => "wav",
            AudioFormat::Ogg => "ogg",
            AudioFormat::Flac => "flac",
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for AudioFormat {
    type Err = InputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mp3" => Ok(AudioFormat::Mp3),
            "wav" | "wave" => Ok(AudioFormat::Wav),
            "ogg" => Ok(AudioFormat::Ogg),
            "flac" => Ok(AudioFormat::Flac),
            _ => Err(InputError::UnsupportedFormat(s.to_string())),
        }
    }
}

/// Decodes in-memory audio into a mono waveform at the target sample rate,
/// truncated to the configured maximum duration.
#[derive(Debug, Clone)]
pub struct AudioProcessor {
    target_sample_rate: u32,
    max_duration_secs: f32,
}

impl AudioProcessor {
    pub fn new(target_sample_rate: u32, max_duration_secs: f32) -> Self {
        Self {
            target_sample_rate,
            max_duration_secs,
        }
    }

    pub fn from_config(config: &AudioConfig) -> Self {
        Self::new(config.sample_rate, config.max_duration_secs)
    }

    pub fn target_sample_rate(&self) -> u32 {
        self.target_sample_rate
    }

    pub fn max_samples(&self) -> usize {
        (self.max_duration_secs * self.target_sample_rate as f32) as usize
    }

    /// Decodes borrowed bytes. Compressed formats need an owned stream, so
    /// anything other than WAV is copied once; prefer [`decode_owned`](Self::decode_owned)
    /// when the caller can give up the buffer.
    pub fn decode(&self, bytes: &[u8], format: AudioFormat) -> Result<Vec<f32>, ExtractionError> {
        self.decode_buffer(Cow::Borrowed(bytes), format)
    }

    /// Decodes without copying the input.
    pub fn decode_owned(&self, bytes: Vec<u8>, format: AudioFormat) -> Result<Vec<f32>, ExtractionError> {
        self.decode_buffer(Cow::Owned(bytes), format)
    }

    fn decode_buffer(&self, bytes: Cow<'_, [u8]>, format: AudioFormat) -> Result<Vec<f32>, ExtractionError> {
        let (interleaved, channels, sample_rate) = match format {
            AudioFormat::Wav => self.decode_wav(&bytes)?,
            _ => self.decode_compressed(bytes.into_owned(), format)?,
        };

        let mut audio = if channels > 1 {
            self.downmix(&interleaved, channels)
        } else {
            interleaved
        };

        if sample_rate != self.target_sample_rate {
            audio = self.resample(&audio, sample_rate, self.target_sample_rate);
        }
        audio.truncate(self.max_samples());

        if audio.is_empty() {
            return Err(ExtractionError::EmptySignal);
        }

        debug!(
            "Decoded {} audio: {} samples ({:.2} seconds)",
            format,
            audio.len(),
            audio.len() as f32 / self.target_sample_rate as f32
        );

        Ok(audio)
    }

    /// Number of interleaved source samples covering the maximum duration.
    fn source_sample_budget(&self, sample_rate: u32, channels: usize) -> usize {
        let frames = (self.max_duration_secs * sample_rate as f32).ceil() as usize + 1;
        frames * channels.max(1)
    }

    fn decode_wav(&self, bytes: &[u8]) -> Result<(Vec<f32>, usize, u32), ExtractionError> {
        let reader = WavReader::new(Cursor::new(bytes))
            .map_err(|e| ExtractionError::Decode(e.to_string()))?;
        let spec = reader.spec();
        let channels = spec.channels as usize;
        if channels == 0 || spec.sample_rate == 0 {
            return Err(ExtractionError::Decode("invalid WAV header".to_string()));
        }
        let budget = self.source_sample_budget(spec.sample_rate, channels);

        let samples = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .take(budget)
                .collect::<Result<Vec<f32>, _>>()
                .map_err(|e| ExtractionError::Decode(format!("failed to read float samples: {}", e)))?,
            hound::SampleFormat::Int => {
                if spec.bits_per_sample == 0 || spec.bits_per_sample > 32 {
                    return Err(ExtractionError::UnsupportedSampleFormat(format!(
                        "{}-bit integer PCM",
                        spec.bits_per_sample
                    )));
                }
                let full_scale = (1u64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .take(budget)
                    .map(|s| s.map(|sample| sample as f32 / full_scale))
                    .collect::<Result<Vec<f32>, _>>()
                    .map_err(|e| ExtractionError::Decode(format!("failed to read int samples: {}", e)))?
            }
        };

        Ok((samples, channels, spec.sample_rate))
    }

    fn decode_compressed(
        &self,
        bytes: Vec<u8>,
        format: AudioFormat,
    ) -> Result<(Vec<f32>, usize, u32), ExtractionError> {
        let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());

        let mut hint = Hint::new();
        hint.with_extension(format.extension());

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| ExtractionError::Decode(e.to_string()))?;
        let mut reader = probed.format;

        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(ExtractionError::NoAudioTrack)?;
        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        // Container values are provisional; the first decoded buffer is authoritative.
        let mut sample_rate = codec_params.sample_rate;
        let mut channels = codec_params.channels.map(|c| c.count());

        let mut decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| ExtractionError::UnsupportedSampleFormat(e.to_string()))?;

        let mut sample_buf: Option<SampleBuffer<f32>> = None;
        let mut samples = Vec::new();
        let mut budget = usize::MAX;

        while samples.len() < budget {
            let packet = match reader.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::ResetRequired) => {
                    decoder.reset();
                    continue;
                }
                Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    break;
                }
                Err(err) => return Err(ExtractionError::Decode(err.to_string())),
            };

            if packet.track_id() != track_id {
                continue;
            }

            let decoded = match decoder.decode(&packet) {
                Ok(decoded) => decoded,
                // A corrupt frame inside an otherwise valid stream is skipped.
                Err(SymphoniaError::DecodeError(e)) => {
                    debug!("Skipping undecodable packet: {}", e);
                    continue;
                }
                Err(err) => return Err(ExtractionError::Decode(err.to_string())),
            };

            let spec = *decoded.spec();
            channels = Some(spec.channels.count());
            sample_rate = Some(spec.rate);
            budget = self.source_sample_budget(spec.rate, spec.channels.count());

            let capacity = decoded.capacity();
            if sample_buf
                .as_ref()
                .map(|b| b.capacity() < capacity)
                .unwrap_or(true)
            {
                sample_buf = Some(SampleBuffer::<f32>::new(capacity as u64, spec));
            }
            if let Some(buf) = sample_buf.as_mut() {
                buf.copy_interleaved_ref(decoded);
                samples.extend_from_slice(buf.samples());
            }
        }

        let sample_rate =
            sample_rate.ok_or_else(|| ExtractionError::Decode("unknown sample rate".to_string()))?;
        let channels = channels.unwrap_or(1);
        samples.truncate(self.source_sample_budget(sample_rate, channels));

        Ok((samples, channels, sample_rate))
    }

    fn downmix(&self, interleaved: &[f32], channels: usize) -> Vec<f32> {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    }

    fn resample(&self, audio: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
        if audio.is_empty() {
            return Vec::new();
        }

        // Linear interpolation between neighbouring source samples.
        let ratio = to_rate as f64 / from_rate as f64;
        let new_length = ((audio.len() as f64 * ratio) as usize).max(1);
        let last = audio.len() - 1;

        (0..new_length)
            .map(|i| {
                let src_index = i as f64 / ratio;
                let floor = (src_index.floor() as usize).min(last);
                let ceil = (floor + 1).min(last);
                let fraction = (src_index - floor as f64) as f32;
                audio[floor] * (1.0 - fraction) + audio[ceil] * fraction
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One second of 16 kHz, 16-bit stereo FLAC with a voiced harmonic signal.
    const STEREO_FLAC: &[u8] = include_bytes!("../tests/fixtures/voice_stereo_16k.flac");

    fn wav_bytes(sample_rate: u32, channels: u16, frames: usize) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for i in 0..frames {
                let t = i as f32 / sample_rate as f32;
                let sample = (2.0 * std::f32::consts::PI * 440.0 * t).sin() * 0.5;
                for _ in 0..channels {
                    writer.write_sample((sample * i16::MAX as f32) as i16).unwrap();
                }
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn format_parsing_is_case_insensitive() {
        assert_eq!("MP3".parse::<AudioFormat>(), Ok(AudioFormat::Mp3));
        assert_eq!(" flac ".parse::<AudioFormat>(), Ok(AudioFormat::Flac));
        assert_eq!(
            "aac".parse::<AudioFormat>(),
            Err(InputError::UnsupportedFormat("aac".to_string()))
        );
    }

    #[test]
    fn decodes_mono_wav_at_target_rate() {
        let processor = AudioProcessor::new(16000, 10.0);
        let audio = processor.decode(&wav_bytes(16000, 1, 8000), AudioFormat::Wav).unwrap();
        assert_eq!(audio.len(), 8000);
        assert!(audio.iter().all(|s| s.abs() <= 1.0));
        let peak = audio.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!((peak - 0.5).abs() < 0.01, "peak {}", peak);
    }

    #[test]
    fn downmixes_and_resamples_stereo() {
        let processor = AudioProcessor::new(16000, 10.0);
        let audio = processor.decode(&wav_bytes(32000, 2, 32000), AudioFormat::Wav).unwrap();
        assert_eq!(audio.len(), 16000);
    }

    #[test]
    fn truncates_long_clips() {
        let processor = AudioProcessor::new(16000, 1.0);
        let audio = processor.decode(&wav_bytes(16000, 1, 40000), AudioFormat::Wav).unwrap();
        assert_eq!(audio.len(), 16000);
    }

    #[test]
    fn truncated_header_fails_to_decode() {
        let processor = AudioProcessor::new(16000, 10.0);
        let bytes = wav_bytes(16000, 1, 4000);
        let result = processor.decode(&bytes[..20], AudioFormat::Wav);
        assert!(matches!(result, Err(ExtractionError::Decode(_))));
    }

    #[test]
    fn garbage_mp3_fails_to_decode() {
        let processor = AudioProcessor::new(16000, 10.0);
        let result = processor.decode(&[0u8; 4096], AudioFormat::Mp3);
        assert!(result.is_err());
    }

    #[test]
    fn header_without_samples_is_empty_signal() {
        let processor = AudioProcessor::new(16000, 10.0);
        let result = processor.decode(&wav_bytes(16000, 1, 0), AudioFormat::Wav);
        assert_eq!(result, Err(ExtractionError::EmptySignal));
    }

    #[test]
    fn decodes_stereo_flac_to_mono() {
        let processor = AudioProcessor::new(16000, 10.0);
        let audio = processor.decode(STEREO_FLAC, AudioFormat::Flac).unwrap();
        assert_eq!(audio.len(), 16000);
        let peak = audio.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(peak > 0.1 && peak <= 1.0, "peak {}", peak);
    }

    #[test]
    fn flac_decode_stops_at_duration_limit() {
        let processor = AudioProcessor::new(16000, 0.5);
        let audio = processor.decode_owned(STEREO_FLAC.to_vec(), AudioFormat::Flac).unwrap();
        assert_eq!(audio.len(), 8000);
    }

    #[test]
    fn flac_resamples_to_target_rate() {
        let processor = AudioProcessor::new(8000, 10.0);
        let audio = processor.decode(STEREO_FLAC, AudioFormat::Flac).unwrap();
        assert_eq!(audio.len(), 8000);
    }

    #[test]
    fn owned_and_borrowed_decoding_agree() {
        let processor = AudioProcessor::new(16000, 10.0);
        let borrowed = processor.decode(STEREO_FLAC, AudioFormat::Flac).unwrap();
        let owned = processor.decode_owned(STEREO_FLAC.to_vec(), AudioFormat::Flac).unwrap();
        assert_eq!(borrowed, owned);

        let wav = wav_bytes(16000, 1, 4000);
        assert_eq!(
            processor.decode(&wav, AudioFormat::Wav).unwrap(),
            processor.decode_owned(wav.clone(), AudioFormat::Wav).unwrap()
        );
    }
}
