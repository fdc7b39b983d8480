//! Slider position <-> linear gain conversion.
//!
//! A cubic curve gives fine control at low volumes while still reaching 200%
//! at the top of the slider.

/// Curve exponent.
pub const EXPONENT: f64 = 3.0;

/// Maximum gain multiplier (200%).
pub const MAX_GAIN: f64 = 2.0;

/// Neutral gain: the process plays at its own volume.
pub const UNITY_GAIN: f32 = 1.0;

/// Convert a slider position (0..=1) to a linear gain (0..=2).
pub fn slider_to_gain(slider: f64) -> f32 {
    let slider = if slider.is_nan() { 0.0 } else { slider.clamp(0.0, 1.0) };
    (slider.powf(EXPONENT) * MAX_GAIN) as f32
}

/// Convert a linear gain (0..=2) back to a slider position (0..=1).
pub fn gain_to_slider(gain: f32) -> f64 {
    let gain = f64::from(clamp_gain(gain));
    (gain / MAX_GAIN).powf(1.0 / EXPONENT)
}

/// Gain as a whole percentage for display (0..=200).
pub fn gain_to_percentage(gain: f32) -> u32 {
    (clamp_gain(gain) * 100.0).round() as u32
}

/// Clamp an arbitrary gain into the supported range.
pub fn clamp_gain(gain: f32) -> f32 {
    if gain.is_nan() {
        return 0.0;
    }
    gain.clamp(0.0, MAX_GAIN as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_and_midpoint() {
        assert_eq!(slider_to_gain(0.0), 0.0);
        assert!((slider_to_gain(1.0) - 2.0).abs() < 1e-6);
        assert!((slider_to_gain(0.5) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn unity_sits_at_cube_root_of_half() {
        let slider = gain_to_slider(UNITY_GAIN);
        assert!((slider - 0.5f64.powf(1.0 / 3.0)).abs() < 1e-6);
    }

    #[test]
    fn slider_survives_round_trip() {
        for step in 0..=100 {
            let position = f64::from(step) / 100.0;
            let back = gain_to_slider(slider_to_gain(position));
            assert!(
                (back - position).abs() < 1e-5,
                "position {position} came back as {back}"
            );
        }
    }

    #[test]
    fn out_of_range_inputs_are_clamped() {
        assert_eq!(slider_to_gain(-0.5), 0.0);
        assert!((slider_to_gain(3.0) - 2.0).abs() < 1e-6);
        assert_eq!(slider_to_gain(f64::NAN), 0.0);
        assert_eq!(gain_to_slider(-1.0), 0.0);
        assert!((gain_to_slider(5.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn percentage_rounds_to_nearest() {
        assert_eq!(gain_to_percentage(1.0), 100);
        assert_eq!(gain_to_percentage(0.256), 26);
        assert_eq!(gain_to_percentage(0.254), 25);
        assert_eq!(gain_to_percentage(2.0), 200);
        assert_eq!(gain_to_percentage(9.0), 200);
    }
}
