//! Per-pixel observation scoring: temporal proximity to the period centre
//! times a spectral cloud/shadow/haze score.

use crate::sensors::SensorFamily;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};

/// Offset added to the NDVI denominator
const NDVI_EPSILON: f32 = 0.0001;

/// Reference NDVI below which the median pixel is not treated as vegetated
const VEGETATION_NDVI: f32 = 0.3;

/// Modeled blue as a fraction of SWIR-2
const BLUE_SWIR2_RATIO: f32 = 0.25;

/// SWIR reflectance (0-100 scale) above which a pixel is never water
const WATER_MAX_SWIR: f32 = 3.0;

/// Midpoint of the compositing window, truncated to a whole day
pub fn period_centre(start: NaiveDate, end: NaiveDate) -> NaiveDate {
    let half = (end - start).num_days().div_euclid(2);
    start + Duration::days(half)
}

/// Signed whole days from `mid` (00:00 UTC) to `observed`; partial days
/// before the centre count as a full day.
pub fn day_offset(observed: DateTime<Utc>, mid: NaiveDate) -> i64 {
    let mid_start = Utc.from_utc_datetime(&mid.and_time(NaiveTime::default()));
    (observed - mid_start).num_seconds().div_euclid(86_400)
}

/// Gaussian decay in `(0, 1]`, exactly 1 at the period centre
pub fn temporal_score(day_offset: i64, family: SensorFamily) -> f64 {
    temporal_score_with_sigma(day_offset as f64, family.temporal_sigma())
}

pub fn temporal_score_with_sigma(days: f64, sigma: f64) -> f64 {
    let z = days / sigma;
    1.0 / (0.5 * z * z).exp()
}

/// Day of year used for the `date` band
pub fn day_of_year(observed: DateTime<Utc>) -> f32 {
    observed.ordinal() as f32
}

/// Per-pixel reference values taken from the time-series medians
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreReference {
    /// Median blue, replaced by a SWIR-2 model over vegetation
    pub blue: f32,
    pub nir: f32,
}

impl ScoreReference {
    /// Reference from per-pixel medians (0-100 reflectance).
    ///
    /// The median blue is kept unless the median pixel is vegetated, has
    /// SWIR-2 at or above its blue, and blue exceeds the modeled
    /// `0.25 * swir2`; then the modeled value is used.
    pub fn from_medians(blue: f32, red: f32, nir: f32, swir2: f32) -> Self {
        let ndvi = (nir - red) / (nir + red + NDVI_EPSILON);
        let modeled = BLUE_SWIR2_RATIO * swir2;
        let keep_median = modeled > blue || ndvi < VEGETATION_NDVI || swir2 < blue;
        Self {
            blue: if keep_median { blue } else { modeled },
            nir,
        }
    }
}

/// Band values of one observation at one pixel, 0-100 reflectance
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpectralPixel {
    pub blue: f32,
    pub green: f32,
    pub nir: f32,
    pub swir1: f32,
    pub swir2: f32,
}

impl SpectralPixel {
    pub fn max_visible(&self) -> f32 {
        self.blue.max(self.green)
    }

    pub fn max_swir(&self) -> f32 {
        self.swir1.max(self.swir2)
    }

    pub fn max_infrared(&self) -> f32 {
        self.nir.max(self.max_swir())
    }
}

/// Which spectral score formula a pixel uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpectralBranch {
    Land,
    Water,
}

/// Water when visible dominates infrared and SWIR stays dark; land otherwise
pub fn classify_pixel(pixel: &SpectralPixel) -> SpectralBranch {
    if pixel.max_visible() < pixel.max_infrared() || pixel.max_swir() > WATER_MAX_SWIR {
        SpectralBranch::Land
    } else {
        SpectralBranch::Water
    }
}

/// Spectral quality of one observation; higher is better
pub fn spectral_score(pixel: &SpectralPixel, reference: &ScoreReference) -> f32 {
    let max_ir = pixel.max_infrared();
    match classify_pixel(pixel) {
        SpectralBranch::Land => {
            let denominator = (pixel.blue.max(0.0) + 1.0) * 100.0
                + (pixel.blue - reference.blue)
                + (reference.nir - pixel.nir);
            (max_ir * 100.0) / denominator
        }
        SpectralBranch::Water => {
            if max_ir == 0.0 {
                return 0.0;
            }
            let water = pixel.max_visible() / max_ir;
            if reference.blue > pixel.blue {
                water
            } else {
                -water
            }
        }
    }
}

/// Median of the non-NaN values; reorders `values`
pub fn nan_median(values: &mut [f32]) -> Option<f32> {
    let mut n = 0;
    for i in 0..values.len() {
        if !values[i].is_nan() {
            values.swap(n, i);
            n += 1;
        }
    }
    let valid = &mut values[..n];
    if valid.is_empty() {
        return None;
    }
    valid.sort_unstable_by(|a, b| a.total_cmp(b));
    let mid = n / 2;
    if n % 2 == 1 {
        Some(valid[mid])
    } else {
        Some((valid[mid - 1] + valid[mid]) / 2.0)
    }
}

/// Index of the largest finite score; the earliest index wins ties
pub fn best_time_index<I>(scores: I) -> Option<usize>
where
    I: IntoIterator<Item = f32>,
{
    let mut best: Option<(usize, f32)> = None;
    for (t, score) in scores.into_iter().enumerate() {
        if !score.is_finite() {
            continue;
        }
        match best {
            Some((_, current)) if score <= current => {}
            _ => best = Some((t, score)),
        }
    }
    best.map(|(t, _)| t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_period_centre_truncates() {
        assert_eq!(period_centre(date(2023, 6, 15), date(2023, 9, 15)), date(2023, 7, 31));
        assert_eq!(period_centre(date(2023, 7, 1), date(2023, 7, 2)), date(2023, 7, 1));
        assert_eq!(period_centre(date(2023, 7, 1), date(2023, 7, 1)), date(2023, 7, 1));
    }

    #[test]
    fn test_day_offset_floors() {
        let mid = date(2023, 7, 31);
        assert_eq!(day_offset(Utc.with_ymd_and_hms(2023, 7, 31, 16, 0, 0).unwrap(), mid), 0);
        assert_eq!(day_offset(Utc.with_ymd_and_hms(2023, 8, 2, 10, 0, 0).unwrap(), mid), 2);
        assert_eq!(day_offset(Utc.with_ymd_and_hms(2023, 7, 30, 16, 0, 0).unwrap(), mid), -1);
        assert_eq!(day_offset(Utc.with_ymd_and_hms(2023, 7, 29, 0, 0, 0).unwrap(), mid), -2);
    }

    #[test]
    fn test_temporal_score_values() {
        assert_eq!(temporal_score(0, SensorFamily::Sentinel2), 1.0);
        assert_relative_eq!(temporal_score(12, SensorFamily::Sentinel2), (-0.5f64).exp(), epsilon = 1e-12);
        assert_relative_eq!(temporal_score(-16, SensorFamily::Landsat), (-0.5f64).exp(), epsilon = 1e-12);
    }

    #[test]
    fn test_reference_blue_model() {
        // vegetated, blue above the SWIR-2 model: modeled value is used
        let r = ScoreReference::from_medians(4.0, 3.0, 30.0, 12.0);
        assert_relative_eq!(r.blue, 3.0);
        // sparse vegetation keeps the median
        let r = ScoreReference::from_medians(4.0, 10.0, 12.0, 12.0);
        assert_relative_eq!(r.blue, 4.0);
        // modeled above median keeps the median
        let r = ScoreReference::from_medians(2.0, 3.0, 30.0, 12.0);
        assert_relative_eq!(r.blue, 2.0);
        assert_relative_eq!(r.nir, 30.0);
    }

    #[test]
    fn test_land_score_formula() {
        let p = SpectralPixel { blue: 3.0, green: 5.0, nir: 30.0, swir1: 20.0, swir2: 10.0 };
        let r = ScoreReference { blue: 4.0, nir: 28.0 };
        assert_eq!(classify_pixel(&p), SpectralBranch::Land);
        let expected = 3000.0 / (400.0 + (3.0 - 4.0) + (28.0 - 30.0));
        assert_relative_eq!(spectral_score(&p, &r), expected, epsilon = 1e-4);
    }

    #[test]
    fn test_water_score_sign_and_zero_infrared() {
        let p = SpectralPixel { blue: 6.0, green: 5.0, nir: 2.0, swir1: 1.0, swir2: 0.5 };
        assert_eq!(classify_pixel(&p), SpectralBranch::Water);
        assert_relative_eq!(spectral_score(&p, &ScoreReference { blue: 8.0, nir: 3.0 }), 3.0);
        assert_relative_eq!(spectral_score(&p, &ScoreReference { blue: 5.0, nir: 3.0 }), -3.0);

        let dark = SpectralPixel { blue: 0.0, green: 0.0, nir: 0.0, swir1: 0.0, swir2: 0.0 };
        assert_eq!(classify_pixel(&dark), SpectralBranch::Water);
        assert_eq!(spectral_score(&dark, &ScoreReference { blue: 1.0, nir: 1.0 }), 0.0);
    }

    #[test]
    fn test_nan_median() {
        assert_eq!(nan_median(&mut [3.0, f32::NAN, 1.0, 2.0]), Some(2.0));
        assert_eq!(nan_median(&mut [4.0, 1.0, f32::NAN, 3.0, 2.0]), Some(2.5));
        assert_eq!(nan_median(&mut [f32::NAN, f32::NAN]), None);
        assert_eq!(nan_median(&mut []), None);
    }

    #[test]
    fn test_best_time_index_ties_and_nan() {
        assert_eq!(best_time_index([0.2, 0.9, 0.5]), Some(1));
        assert_eq!(best_time_index([0.7, 0.7, 0.1]), Some(0));
        assert_eq!(best_time_index([f32::NAN, 0.1, f32::NAN]), Some(1));
        assert_eq!(best_time_index([-3.0, -1.0]), Some(1));
        assert_eq!(best_time_index([f32::NAN]), None);
        assert_eq!(best_time_index(Vec::<f32>::new()), None);
    }
}
