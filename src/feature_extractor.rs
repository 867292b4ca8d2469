use ndarray::{Array1, Array2, ArrayView1, Axis};
use num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

use crate::audio_processor::{AudioFormat, AudioProcessor};
use crate::config::{AudioConfig, ExtractorConfig};
use crate::error::ExtractionError;
use crate::spectral::{zero_crossing_rates, SpectralFeatures};

/// Length of every feature vector produced by [`FeatureExtractor`].
pub const FEATURE_COUNT: usize = 48;

/// MFCC coefficients per frame; the feature layout depends on this.
pub const N_MFCC: usize = 20;

/// Dynamic range kept by the log-mel spectrogram, in dB below its peak.
const TOP_DB: f32 = 80.0;
const POWER_FLOOR: f32 = 1e-10;

/// Names for each position of a [`FeatureVector`], in order.
pub fn feature_names() -> Vec<String> {
    let mut names = Vec::with_capacity(FEATURE_COUNT);
    names.extend((0..N_MFCC).map(|i| format!("mfcc_mean_{}", i)));
    names.extend((0..N_MFCC).map(|i| format!("mfcc_std_{}", i)));
    names.extend(
        [
            "spec_centroid_mean",
            "spec_centroid_std",
            "spec_rolloff_mean",
            "spec_rolloff_std",
            "spec_bandwidth_mean",
            "zcr_mean",
            "zcr_std",
            "chroma_mean",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    names
}

/// Exactly [`FEATURE_COUNT`] finite values:
/// `[0, 20)` MFCC means, `[20, 40)` MFCC standard deviations, then
/// centroid mean/std, rolloff mean/std, bandwidth mean, ZCR mean/std and
/// mean chroma energy.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    values: Vec<f64>,
}

impl FeatureVector {
    pub fn new(values: Vec<f64>) -> Result<Self, ExtractionError> {
        if values.len() != FEATURE_COUNT {
            return Err(ExtractionError::Dimension {
                expected: FEATURE_COUNT,
                got: values.len(),
            });
        }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(ExtractionError::NonFinite { index });
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn view(&self) -> ArrayView1<'_, f64> {
        ArrayView1::from(&self.values[..])
    }

    pub fn into_array(self) -> Array1<f64> {
        Array1::from(self.values)
    }
}

impl TryFrom<Vec<f64>> for FeatureVector {
    type Error = ExtractionError;

    fn try_from(values: Vec<f64>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

/// MFCCs from a power spectrogram: mel filterbank, dB scaling, orthonormal DCT-II.
pub struct MfccExtractor {
    mel_filters: Array2<f32>,
    dct: Array2<f32>,
}

impl MfccExtractor {
    pub fn new(sample_rate: f32, n_fft: usize, n_mels: usize, n_mfcc: usize) -> Self {
        Self {
            mel_filters: Self::create_mel_filters(sample_rate, n_fft, n_mels),
            dct: Self::create_dct(n_mfcc, n_mels),
        }
    }

    /// Returns an `(n_mfcc, n_frames)` matrix.
    pub fn compute(&self, power: &Array2<f32>) -> Array2<f32> {
        let mel_spectrogram = self.mel_filters.dot(power);

        let mut log_mel = mel_spectrogram.mapv(|x| 10.0 * x.max(POWER_FLOOR).log10());
        let peak = log_mel.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let floor = peak - TOP_DB;
        log_mel.mapv_inplace(|x| x.max(floor));

        self.dct.dot(&log_mel)
    }

    fn create_mel_filters(sample_rate: f32, n_fft: usize, n_mels: usize) -> Array2<f32> {
        let n_freqs = n_fft / 2 + 1;
        let mut filters = Array2::zeros((n_mels, n_freqs));

        let mel_low = hz_to_mel(0.0);
        let mel_high = hz_to_mel(sample_rate / 2.0);
        let hz_points: Vec<f32> = (0..=n_mels + 1)
            .map(|i| mel_to_hz(mel_low + (mel_high - mel_low) * i as f32 / (n_mels + 1) as f32))
            .collect();

        for m in 0..n_mels {
            let (left, center, right) = (hz_points[m], hz_points[m + 1], hz_points[m + 2]);
            // Area normalisation keeps energy comparable across bands.
            let norm = 2.0 / (right - left);

            for k in 0..n_freqs {
                let freq = k as f32 * sample_rate / n_fft as f32;
                let weight = if freq > left && freq <= center {
                    (freq - left) / (center - left)
                } else if freq > center && freq < right {
                    (right - freq) / (right - center)
                } else {
                    0.0
                };
                filters[[m, k]] = weight * norm;
            }
        }

        filters
    }

    fn create_dct(n_mfcc: usize, n_mels: usize) -> Array2<f32> {
        let mut dct = Array2::zeros((n_mfcc, n_mels));
        let n = n_mels as f32;
        for i in 0..n_mfcc {
            let scale = if i == 0 { (1.0 / n).sqrt() } else { (2.0 / n).sqrt() };
            for j in 0..n_mels {
                dct[[i, j]] = scale
                    * (std::f32::consts::PI * i as f32 * (2.0 * j as f32 + 1.0) / (2.0 * n)).cos();
            }
        }
        dct
    }
}

fn hz_to_mel(hz: f32) -> f32 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f32) -> f32 {
    700.0 * (10.0_f32.powf(mel / 2595.0) - 1.0)
}

/// Turns raw audio bytes into a [`FeatureVector`].
///
/// Frames are `n_fft` samples long, `hop_length` apart, centred on their hop
/// position with zero padding, so any non-empty signal yields at least one frame.
pub struct FeatureExtractor {
    audio_processor: AudioProcessor,
    mfcc: MfccExtractor,
    spectral: SpectralFeatures,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    n_fft: usize,
    hop_length: usize,
}

impl FeatureExtractor {
    pub fn new(audio: &AudioConfig, extractor: &ExtractorConfig) -> Self {
        let n_fft = extractor.n_fft;
        let sample_rate = audio.sample_rate;

        // Periodic Hann window.
        let window = (0..n_fft)
            .map(|i| 0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / n_fft as f32).cos()))
            .collect();

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(n_fft);

        Self {
            audio_processor: AudioProcessor::from_config(audio),
            mfcc: MfccExtractor::new(
                sample_rate as f32,
                n_fft,
                extractor.n_mels,
                extractor.n_mfcc,
            ),
            spectral: SpectralFeatures::new(sample_rate, n_fft, extractor.rolloff_percent),
            fft,
            window,
            n_fft,
            hop_length: extractor.hop_length,
        }
    }

    pub fn audio_processor(&self) -> &AudioProcessor {
        &self.audio_processor
    }

    pub fn extract(&self, bytes: &[u8], format: AudioFormat) -> Result<FeatureVector, ExtractionError> {
        let audio = self.audio_processor.decode(bytes, format)?;
        self.extract_from_samples(&audio)
    }

    /// Like [`extract`](Self::extract), handing the buffer to the decoder without a copy.
    pub fn extract_owned(&self, bytes: Vec<u8>, format: AudioFormat) -> Result<FeatureVector, ExtractionError> {
        let audio = self.audio_processor.decode_owned(bytes, format)?;
        self.extract_from_samples(&audio)
    }

    pub fn extract_from_samples(&self, audio: &[f32]) -> Result<FeatureVector, ExtractionError> {
        if audio.is_empty() {
            return Err(ExtractionError::EmptySignal);
        }

        let magnitude = self.compute_spectrogram(audio);
        let power = magnitude.mapv(|m| m * m);

        let mfccs = self.mfcc.compute(&power);
        let mfcc_mean = mfccs.mean_axis(Axis(1)).ok_or(ExtractionError::EmptySignal)?;
        let mfcc_std = mfccs.std_axis(Axis(1), 0.0);

        let mut centroids = Vec::with_capacity(magnitude.ncols());
        let mut rolloffs = Vec::with_capacity(magnitude.ncols());
        let mut bandwidths = Vec::with_capacity(magnitude.ncols());
        for frame in magnitude.axis_iter(Axis(1)) {
            let centroid = self.spectral.centroid(frame);
            centroids.push(centroid);
            rolloffs.push(self.spectral.rolloff(frame));
            bandwidths.push(self.spectral.bandwidth(frame, centroid));
        }
        let zcr = zero_crossing_rates(audio, self.n_fft, self.hop_length);

        let (centroid_mean, centroid_std) = mean_std(&centroids)?;
        let (rolloff_mean, rolloff_std) = mean_std(&rolloffs)?;
        let (bandwidth_mean, _) = mean_std(&bandwidths)?;
        let (zcr_mean, zcr_std) = mean_std(&zcr)?;
        let chroma = self.spectral.chroma_energy(&power) as f64;

        let mut features = Vec::with_capacity(FEATURE_COUNT);
        features.extend(mfcc_mean.iter().map(|&x| x as f64));
        features.extend(mfcc_std.iter().map(|&x| x as f64));
        features.extend([
            centroid_mean,
            centroid_std,
            rolloff_mean,
            rolloff_std,
            bandwidth_mean,
            zcr_mean,
            zcr_std,
            chroma,
        ]);

        FeatureVector::new(features)
    }

    /// Magnitude spectrogram shaped `(n_fft / 2 + 1, n_frames)`.
    fn compute_spectrogram(&self, audio: &[f32]) -> Array2<f32> {
        let pad = self.n_fft / 2;
        let padded_len = audio.len() + 2 * pad;
        let n_frames = 1 + padded_len.saturating_sub(self.n_fft) / self.hop_length;
        let n_bins = self.n_fft / 2 + 1;
        let mut spectrogram = Array2::zeros((n_bins, n_frames));

        let mut buffer = vec![Complex::new(0.0f32, 0.0); self.n_fft];
        for frame_idx in 0..n_frames {
            let frame_start = frame_idx * self.hop_length;
            for (i, slot) in buffer.iter_mut().enumerate() {
                // Index into the virtual zero-padded signal.
                let sample = (frame_start + i)
                    .checked_sub(pad)
                    .and_then(|idx| audio.get(idx))
                    .copied()
                    .unwrap_or(0.0);
                *slot = Complex::new(sample * self.window[i], 0.0);
            }

            self.fft.process(&mut buffer);

            for (bin, value) in buffer.iter().take(n_bins).enumerate() {
                spectrogram[[bin, frame_idx]] = value.norm();
            }
        }

        spectrogram
    }
}

fn mean_std(values: &[f32]) -> Result<(f64, f64), ExtractionError> {
    if values.is_empty() {
        return Err(ExtractionError::EmptySignal);
    }
    let n = values.len() as f64;
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
    let variance = values.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
    Ok((mean, variance.sqrt()))
}
