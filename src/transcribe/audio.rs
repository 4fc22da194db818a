//! PCM conversion for the recognizer: stereo s16 at 48 kHz in, mono f32 at
//! 16 kHz out. Pure functions so they stay testable without a voice gateway.

/// Sample rate of decoded Discord voice (Opus decoded)
pub const SOURCE_SAMPLE_RATE: u32 = 48000;
/// Channel count of decoded Discord voice
pub const SOURCE_CHANNELS: usize = 2;
/// Whisper's required sample rate
pub const WHISPER_SAMPLE_RATE: u32 = 16000;

/// Interleaved samples per second of source audio
pub const SOURCE_SAMPLES_PER_SECOND: usize = SOURCE_SAMPLE_RATE as usize * SOURCE_CHANNELS;

/// Collapse interleaved stereo s16 to mono f32 normalized to [-1.0, 1.0].
///
/// A trailing unpaired sample (truncated frame) is dropped.
pub fn stereo_to_mono_f32(stereo: &[i16]) -> Vec<f32> {
    let frames = stereo.len() / 2;
    let mut mono = Vec::with_capacity(frames);
    for i in 0..frames {
        let left = stereo[i * 2] as f32 / 32768.0;
        let right = stereo[i * 2 + 1] as f32 / 32768.0;
        mono.push((left + right) / 2.0);
    }
    mono
}

/// Resample mono f32 audio with linear interpolation.
///
/// Identity when the rates match. The upper interpolation index is clamped to
/// the last valid sample, so output never reads past the input.
pub fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate {
        return input.to_vec();
    }
    if input.is_empty() {
        return Vec::new();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = (input.len() as f64 / ratio).round() as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src = i as f64 * ratio;
        let a = src.floor() as usize;
        let b = (a + 1).min(input.len() - 1);
        let t = (src - a as f64) as f32;
        let a = a.min(input.len() - 1);
        out.push(input[a] * (1.0 - t) + input[b] * t);
    }
    out
}

/// Full conversion from decoded voice PCM to recognizer input.
pub fn pcm_to_whisper_input(stereo_48k: &[i16]) -> Vec<f32> {
    let mono = stereo_to_mono_f32(stereo_48k);
    resample_linear(&mono, SOURCE_SAMPLE_RATE, WHISPER_SAMPLE_RATE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stereo_to_mono_averages_channels() {
        // L=1.0, R=-1.0 should cancel to ~0
        let stereo: Vec<i16> = std::iter::repeat([32767i16, -32767i16])
            .take(100)
            .flatten()
            .collect();
        let mono = stereo_to_mono_f32(&stereo);
        assert_eq!(mono.len(), 100);
        for s in mono {
            assert!(s.abs() < 1e-4, "expected near-zero sample, got {}", s);
        }
    }

    #[test]
    fn test_stereo_to_mono_normalizes() {
        let mono = stereo_to_mono_f32(&[16384, 16384]);
        assert_eq!(mono.len(), 1);
        assert!((mono[0] - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_stereo_to_mono_drops_trailing_sample() {
        let mono = stereo_to_mono_f32(&[100, 100, 50]);
        assert_eq!(mono.len(), 1);
    }

    #[test]
    fn test_resample_identity_when_rates_equal() {
        let input: Vec<f32> = (0..480).map(|i| (i as f32 * 0.01).sin()).collect();
        let out = resample_linear(&input, 48000, 48000);
        assert_eq!(out, input);
    }

    #[test]
    fn test_resample_output_length() {
        // 48k -> 16k should shrink by 3x (+-1 from rounding)
        let input: Vec<f32> = (0..4800).map(|i| (i as f32 * 0.02).sin()).collect();
        let out = resample_linear(&input, 48000, 16000);
        let expected = input.len() / 3;
        assert!(
            (out.len() as i64 - expected as i64).abs() <= 1,
            "expected ~{} samples, got {}",
            expected,
            out.len()
        );
    }

    #[test]
    fn test_resample_constant_signal_preserved() {
        let input = vec![0.25f32; 4800];
        let out = resample_linear(&input, 48000, 16000);
        for s in out {
            assert!((s - 0.25).abs() < 1e-6);
        }
    }

    #[test]
    fn test_resample_empty_input() {
        assert!(resample_linear(&[], 48000, 16000).is_empty());
    }

    #[test]
    fn test_pcm_to_whisper_input_length() {
        // one second of stereo 48k -> one second of mono 16k
        let stereo = vec![0i16; SOURCE_SAMPLES_PER_SECOND];
        let out = pcm_to_whisper_input(&stereo);
        let expected = WHISPER_SAMPLE_RATE as i64;
        assert!((out.len() as i64 - expected).abs() <= 1);
    }
}
