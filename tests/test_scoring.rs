//! Scoring kernels through the public API

use approx::assert_relative_eq;
use eomosaic::core::scoring::{
    best_time_index, classify_pixel, spectral_score, temporal_score, ScoreReference, SpectralBranch, SpectralPixel,
};
use eomosaic::SensorFamily;

#[test]
fn test_temporal_score_shape() {
    for family in [SensorFamily::Sentinel2, SensorFamily::Landsat, SensorFamily::Hls] {
        assert_relative_eq!(temporal_score(0, family), 1.0);
        let mut previous = 1.0;
        for days in 1..=120 {
            let forward = temporal_score(days, family);
            assert!(forward > 0.0 && forward <= 1.0, "{:?} at {} days", family, days);
            assert!(forward < previous, "{:?} must decay at {} days", family, days);
            assert_relative_eq!(forward, temporal_score(-days, family), max_relative = 1e-12);
            previous = forward;
        }
    }
}

#[test]
fn test_landsat_decays_more_slowly() {
    for days in [4, 10, 30] {
        assert!(temporal_score(days, SensorFamily::Landsat) > temporal_score(days, SensorFamily::Sentinel2));
    }
    // one sigma away
    assert_relative_eq!(temporal_score(12, SensorFamily::Sentinel2), (-0.5f64).exp(), max_relative = 1e-12);
    assert_relative_eq!(temporal_score(16, SensorFamily::Landsat), (-0.5f64).exp(), max_relative = 1e-12);
}

fn pixel(blue: f32, green: f32, nir: f32, swir1: f32, swir2: f32) -> SpectralPixel {
    SpectralPixel {
        blue,
        green,
        nir,
        swir1,
        swir2,
    }
}

#[test]
fn test_dark_bright_visible_pixel_is_water() {
    // visible dominates infrared and SWIR stays at or below 3
    let water = pixel(6.0, 5.0, 2.0, 1.5, 1.0);
    assert_eq!(classify_pixel(&water), SpectralBranch::Water);

    let clearer = ScoreReference { blue: 8.0, nir: 2.0 };
    assert_relative_eq!(spectral_score(&water, &clearer), 3.0);
    let hazier = ScoreReference { blue: 4.0, nir: 2.0 };
    assert_relative_eq!(spectral_score(&water, &hazier), -3.0);
}

#[test]
fn test_water_conditions_route_to_land_when_broken() {
    let reference = ScoreReference { blue: 5.0, nir: 20.0 };

    // SWIR above the water ceiling
    let bright_swir = pixel(6.0, 5.0, 2.0, 3.5, 1.0);
    assert_eq!(classify_pixel(&bright_swir), SpectralBranch::Land);

    // infrared above visible
    let vegetated = pixel(6.0, 5.0, 7.0, 1.0, 1.0);
    assert_eq!(classify_pixel(&vegetated), SpectralBranch::Land);

    let expected = 7.0 * 100.0 / ((6.0 + 1.0) * 100.0 + (6.0 - 5.0) + (20.0 - 7.0));
    assert_relative_eq!(spectral_score(&vegetated, &reference), expected, max_relative = 1e-6);
}

#[test]
fn test_water_with_no_infrared_scores_zero() {
    let black = pixel(0.0, 0.0, 0.0, 0.0, 0.0);
    assert_eq!(classify_pixel(&black), SpectralBranch::Water);
    assert_eq!(spectral_score(&black, &ScoreReference { blue: 1.0, nir: 1.0 }), 0.0);
}

#[test]
fn test_haze_lowers_land_score() {
    let reference = ScoreReference::from_medians(4.0, 4.0, 30.0, 10.0);
    assert_relative_eq!(reference.blue, 2.5);
    let clear = spectral_score(&pixel(2.0, 5.0, 30.0, 20.0, 10.0), &reference);
    let hazy = spectral_score(&pixel(8.0, 9.0, 30.0, 20.0, 10.0), &reference);
    assert!(clear > hazy);
}

#[test]
fn test_best_index_skips_masked_slices() {
    assert_eq!(best_time_index([f32::NAN, 0.4, 0.9, f32::NAN]), Some(2));
    assert_eq!(best_time_index([0.7, 0.7, 0.1]), Some(0));
    assert_eq!(best_time_index([f32::NAN, f32::NAN]), None);
    assert_eq!(best_time_index(Vec::<f32>::new()), None);
}
