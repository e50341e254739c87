/// Resample mono audio using linear interpolation.
///
/// Quality is sufficient for clip playback and spectrum display; the chain
/// operates at one fixed engine rate, so this runs once per import.
pub fn resample_to_target(samples: &[f32], src_rate: u32, target_rate: u32) -> Vec<f32> {
    if src_rate == 0 || target_rate == 0 || src_rate == target_rate {
        return samples.to_vec();
    }

    if samples.is_empty() {
        return Vec::new();
    }

    let ratio = target_rate as f64 / src_rate as f64;
    let new_len = ((samples.len() as f64) * ratio).ceil() as usize;
    let mut output = Vec::with_capacity(new_len);

    for i in 0..new_len {
        let src_pos = (i as f64) / ratio;
        let lower = src_pos.floor() as usize;
        let frac = (src_pos - lower as f64) as f32;

        if lower >= samples.len() - 1 {
            // At or past the end - hold the last sample
            output.push(samples[samples.len() - 1]);
        } else {
            output.push(samples[lower] * (1.0 - frac) + samples[lower + 1] * frac);
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_rate_is_a_copy() {
        let input = vec![0.0, 0.5, -0.5, 1.0];
        assert_eq!(resample_to_target(&input, 48_000, 48_000), input);
    }

    #[test]
    fn upsampling_doubles_length_and_interpolates() {
        let input = vec![0.0, 1.0];
        let out = resample_to_target(&input, 24_000, 48_000);
        assert_eq!(out.len(), 4);
        assert!((out[0] - 0.0).abs() < 1e-6);
        assert!((out[1] - 0.5).abs() < 1e-6);
        assert!((out[2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn downsampling_preserves_duration() {
        let input: Vec<f32> = (0..480).map(|i| (i as f32) / 480.0).collect();
        let out = resample_to_target(&input, 48_000, 24_000);
        // 10ms of audio stays 10ms at the new rate.
        assert_eq!(out.len(), 240);
    }
}
