//! Python bindings for the scoring kernels

use crate::core::scoring::{self, ScoreReference, SpectralPixel};
use crate::sensors::sensor_meta;
use numpy::{IntoPyArray, PyArray2, PyReadonlyArray3};
use pyo3::prelude::*;

/// Python module definition
#[pymodule]
fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(temporal_score, m)?)?;
    m.add_function(wrap_pyfunction!(spectral_score, m)?)?;
    m.add_function(wrap_pyfunction!(best_time_index, m)?)?;
    Ok(())
}

/// Temporal score of an observation `day_offset` days from the period centre
#[pyfunction]
fn temporal_score(day_offset: i64, sensor: &str) -> PyResult<f64> {
    let meta = sensor_meta(sensor)
        .map_err(|e| PyErr::new::<pyo3::exceptions::PyValueError, _>(format!("{}", e)))?;
    Ok(scoring::temporal_score(day_offset, meta.family))
}

/// Spectral score of one pixel against its median reference
#[pyfunction]
#[allow(clippy::too_many_arguments)]
fn spectral_score(blue: f32, green: f32, nir: f32, swir1: f32, swir2: f32, ref_blue: f32, ref_nir: f32) -> f32 {
    let pixel = SpectralPixel {
        blue,
        green,
        nir,
        swir1,
        swir2,
    };
    scoring::spectral_score(&pixel, &ScoreReference { blue: ref_blue, nir: ref_nir })
}

/// Per-pixel argmax over the time axis of a (time, y, x) score stack; -1
/// where no score is finite
#[pyfunction]
fn best_time_index<'py>(py: Python<'py>, scores: PyReadonlyArray3<'py, f32>) -> &'py PyArray2<i64> {
    let scores = scores.as_array();
    let (_, height, width) = scores.dim();
    let index = ndarray::Array2::from_shape_fn((height, width), |(y, x)| {
        scoring::best_time_index(scores.slice(ndarray::s![.., y, x]).iter().copied())
            .map(|t| t as i64)
            .unwrap_or(-1)
    });
    index.into_pyarray(py)
}
