// Frame-wise spectral descriptors.
//
// Each function works on one column of a magnitude (or power) spectrogram
// laid out as [bin, frame]. Frequencies are bin centres, k * sr / n_fft.

use ndarray::{Array2, ArrayView1, Axis};

/// Energy floor under which a frame is treated as silent.
const SILENCE_FLOOR: f32 = 1e-10;

const PITCH_CLASSES: usize = 12;

pub struct SpectralFeatures {
    bin_freqs: Vec<f32>,
    rolloff_percent: f32,
    /// Pitch class (C = 0) of each bin; `None` for DC.
    chroma_map: Vec<Option<usize>>,
}

impl SpectralFeatures {
    pub fn new(sample_rate: u32, n_fft: usize, rolloff_percent: f32) -> Self {
        let n_bins = n_fft / 2 + 1;
        let bin_width = sample_rate as f32 / n_fft as f32;
        let bin_freqs: Vec<f32> = (0..n_bins).map(|k| k as f32 * bin_width).collect();

        let chroma_map = bin_freqs
            .iter()
            .map(|&freq| {
                if freq <= 0.0 {
                    return None;
                }
                // Semitones relative to A4, shifted so that C is class 0.
                let semitones = 12.0 * (freq / 440.0).log2() + 9.0;
                Some((semitones.round() as i64).rem_euclid(PITCH_CLASSES as i64) as usize)
            })
            .collect();

        Self {
            bin_freqs,
            rolloff_percent,
            chroma_map,
        }
    }

    /// Magnitude-weighted mean frequency in Hz. Silent frames yield 0.
    pub fn centroid(&self, spectrum: ArrayView1<f32>) -> f32 {
        let total: f32 = spectrum.sum();
        if total <= SILENCE_FLOOR {
            return 0.0;
        }
        let weighted: f32 = spectrum
            .iter()
            .zip(&self.bin_freqs)
            .map(|(&mag, &freq)| mag * freq)
            .sum();
        weighted / total
    }

    /// Lowest frequency below which `rolloff_percent` of the magnitude lies.
    pub fn rolloff(&self, spectrum: ArrayView1<f32>) -> f32 {
        let total: f32 = spectrum.sum();
        if total <= SILENCE_FLOOR {
            return 0.0;
        }
        let threshold = self.rolloff_percent * total;

        let mut cumulative = 0.0;
        for (&mag, &freq) in spectrum.iter().zip(&self.bin_freqs) {
            cumulative += mag;
            if cumulative >= threshold {
                return freq;
            }
        }
        self.bin_freqs.last().copied().unwrap_or(0.0)
    }

    /// Second-order spectral bandwidth around `centroid`.
    pub fn bandwidth(&self, spectrum: ArrayView1<f32>, centroid: f32) -> f32 {
        let total: f32 = spectrum.sum();
        if total <= SILENCE_FLOOR {
            return 0.0;
        }
        let spread: f32 = spectrum
            .iter()
            .zip(&self.bin_freqs)
            .map(|(&mag, &freq)| (mag / total) * (freq - centroid).powi(2))
            .sum();
        spread.sqrt()
    }

    /// Chroma energy reduced to one scalar: every frame's 12-bin chroma is
    /// scaled so its peak is 1, then all bins of all frames are averaged.
    pub fn chroma_energy(&self, power: &Array2<f32>) -> f32 {
        let n_frames = power.len_of(Axis(1));
        if n_frames == 0 {
            return 0.0;
        }

        let mut total = 0.0f64;
        for frame in power.axis_iter(Axis(1)) {
            let mut chroma = [0.0f32; PITCH_CLASSES];
            for (&energy, class) in frame.iter().zip(&self.chroma_map) {
                if let Some(class) = class {
                    chroma[*class] += energy;
                }
            }

            let peak = chroma.iter().cloned().fold(0.0f32, f32::max);
            if peak > SILENCE_FLOOR {
                total += chroma.iter().map(|&c| (c / peak) as f64).sum::<f64>();
            }
        }

        (total / (n_frames * PITCH_CLASSES) as f64) as f32
    }
}

/// Fraction of sign changes per frame, with frames centred on hop positions
/// and the signal edge-padded by half a frame on each side.
pub fn zero_crossing_rates(audio: &[f32], frame_length: usize, hop_length: usize) -> Vec<f32> {
    let (first, last) = match (audio.first(), audio.last()) {
        (Some(&first), Some(&last)) => (first, last),
        _ => return Vec::new(),
    };
    if frame_length < 2 || hop_length == 0 {
        return Vec::new();
    }

    let pad = frame_length / 2;
    let padded: Vec<f32> = std::iter::repeat(first)
        .take(pad)
        .chain(audio.iter().copied())
        .chain(std::iter::repeat(last).take(pad))
        .collect();
    if padded.len() < frame_length {
        return Vec::new();
    }

    let n_frames = 1 + (padded.len() - frame_length) / hop_length;
    (0..n_frames)
        .map(|frame| {
            let start = frame * hop_length;
            let crossings = padded[start..start + frame_length]
                .windows(2)
                .filter(|pair| (pair[0] >= 0.0) != (pair[1] >= 0.0))
                .count();
            crossings as f32 / frame_length as f32
        })
        .collect()
}
