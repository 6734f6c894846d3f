//! Folding granule composites into the shared canvas by per-pixel score

use crate::core::canvas::RasterCanvas;
use crate::core::compositor::GranuleComposite;
use crate::types::{Band2, MosaicError, MosaicResult, Pixel, DATE_BAND, SCORE_BAND};
use ndarray::{s, Array2, ArrayView2, Zip};
use std::cmp::Ordering;

/// Result of merging one composite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Nothing to merge
    Skipped,
    Merged { pixels_updated: usize },
}

/// Pointwise maximum-by-score reduction onto a canvas.
///
/// A composite pixel replaces the canvas pixel when its score is higher;
/// nodata and NaN scores rank below everything. Equal scores fall back to
/// `date` and then the remaining bands in canvas order, so the result does
/// not depend on merge order.
pub struct MergeReducer;

impl MergeReducer {
    pub fn merge(canvas: &mut RasterCanvas, composite: Option<&GranuleComposite>) -> MosaicResult<MergeOutcome> {
        let Some(composite) = composite else {
            return Ok(MergeOutcome::Skipped);
        };

        let (h, w) = composite.raster.shape();
        let (canvas_h, canvas_w) = canvas.shape();
        let (r0, c0) = (composite.row_offset, composite.col_offset);
        if r0 + h > canvas_h || c0 + w > canvas_w {
            return Err(MosaicError::Processing(format!(
                "Composite {} ({}x{} at {},{}) exceeds canvas {}x{}",
                composite.grid_code, h, w, r0, c0, canvas_h, canvas_w
            )));
        }

        // tie-break order: score, date, then every other band in canvas order
        let mut order: Vec<String> = vec![SCORE_BAND.to_string(), DATE_BAND.to_string()];
        order.extend(
            canvas
                .band_names()
                .into_iter()
                .filter(|n| *n != SCORE_BAND && *n != DATE_BAND)
                .map(str::to_string),
        );

        let mut incoming: Vec<&Band2> = Vec::with_capacity(order.len());
        for name in &order {
            let band = composite.raster.band(name).ok_or_else(|| {
                MosaicError::Processing(format!("Composite {} lacks band {}", composite.grid_code, name))
            })?;
            incoming.push(band);
        }

        let replace = {
            let mut existing: Vec<ArrayView2<'_, Pixel>> = Vec::with_capacity(order.len());
            for name in &order {
                let band = canvas
                    .band(name)
                    .ok_or_else(|| MosaicError::Processing(format!("Canvas lacks band {}", name)))?;
                existing.push(band.slice(s![r0..r0 + h, c0..c0 + w]));
            }
            let nodata = canvas.nodata;
            Array2::from_shape_fn((h, w), |(y, x)| {
                let ord = compare_pixels(
                    incoming.iter().map(|b| b[[y, x]]),
                    existing.iter().map(|b| b[[y, x]]),
                    nodata,
                );
                ord == Ordering::Greater
            })
        };

        let pixels_updated = replace.iter().filter(|&&r| r).count();
        if pixels_updated > 0 {
            for (name, source) in order.iter().zip(&incoming) {
                if let Some(target) = canvas.band_mut(name) {
                    let mut window = target.slice_mut(s![r0..r0 + h, c0..c0 + w]);
                    Zip::from(&mut window)
                        .and(*source)
                        .and(&replace)
                        .for_each(|dst, &src, &take| {
                            if take {
                                *dst = src;
                            }
                        });
                }
            }
        }

        log::debug!(
            "Merged composite {}: {} of {} pixels updated",
            composite.grid_code,
            pixels_updated,
            h * w
        );
        Ok(MergeOutcome::Merged { pixels_updated })
    }

    /// Mask pixels without a positive `date`; returns how many were masked
    pub fn finalize(canvas: &mut RasterCanvas) -> usize {
        canvas.mask_undated()
    }
}

/// Score rank: nodata and NaN sit below every real score
fn effective_score(score: Pixel, nodata: Pixel) -> f32 {
    if score.is_nan() || score == nodata {
        f32::NEG_INFINITY
    } else {
        score
    }
}

/// Order two pixels given their values in tie-break order (score first).
/// A pixel whose score is not an observation never wins.
fn compare_pixels<A, B>(incoming: A, existing: B, nodata: Pixel) -> Ordering
where
    A: Iterator<Item = Pixel>,
    B: Iterator<Item = Pixel>,
{
    let mut pairs = incoming.zip(existing);
    let Some((a_score, b_score)) = pairs.next() else {
        return Ordering::Equal;
    };
    let a = effective_score(a_score, nodata);
    let b = effective_score(b_score, nodata);
    if a == f32::NEG_INFINITY {
        return Ordering::Less;
    }
    match a.total_cmp(&b) {
        Ordering::Equal => pairs
            .map(|(x, y)| x.total_cmp(&y))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GeoTransform, RasterGrid};

    fn canvas() -> RasterCanvas {
        let grid = RasterGrid::new("EPSG:3979", GeoTransform::north_up(0.0, 0.0, 10.0), 4, 4);
        let names: Vec<String> = ["red", DATE_BAND, SCORE_BAND].iter().map(|s| s.to_string()).collect();
        RasterCanvas::filled(grid, -10000.0, &names)
    }

    fn composite(code: &str, row: usize, col: usize, score: f32, date: f32, red: f32) -> GranuleComposite {
        let mut raster = canvas().crop(0..2, 0..2);
        raster.band_mut(SCORE_BAND).unwrap().fill(score);
        raster.band_mut(DATE_BAND).unwrap().fill(date);
        raster.band_mut("red").unwrap().fill(red);
        GranuleComposite {
            grid_code: code.into(),
            row_offset: row,
            col_offset: col,
            raster,
            scenes_loaded: 1,
        }
    }

    #[test]
    fn test_none_is_noop() {
        let mut c = canvas();
        let before = c.clone();
        assert_eq!(MergeReducer::merge(&mut c, None).unwrap(), MergeOutcome::Skipped);
        assert_eq!(c, before);
    }

    #[test]
    fn test_higher_score_wins_region() {
        let mut c = canvas();
        let a = composite("A", 0, 0, 0.4, 100.0, 1.0);
        let b = composite("B", 1, 1, 0.8, 120.0, 2.0);
        MergeReducer::merge(&mut c, Some(&a)).unwrap();
        let outcome = MergeReducer::merge(&mut c, Some(&b)).unwrap();
        assert_eq!(outcome, MergeOutcome::Merged { pixels_updated: 4 });

        assert_eq!(c.band("red").unwrap()[[0, 0]], 1.0);
        assert_eq!(c.band("red").unwrap()[[1, 1]], 2.0);
        assert_eq!(c.band(SCORE_BAND).unwrap()[[1, 1]], 0.8);
        assert_eq!(c.band(DATE_BAND).unwrap()[[2, 2]], 120.0);
        assert_eq!(c.band("red").unwrap()[[3, 3]], -10000.0);
    }

    #[test]
    fn test_equal_scores_break_on_date_then_bands() {
        let a = composite("A", 0, 0, 0.5, 100.0, 9.0);
        let b = composite("B", 0, 0, 0.5, 110.0, 1.0);
        let mut ab = canvas();
        MergeReducer::merge(&mut ab, Some(&a)).unwrap();
        MergeReducer::merge(&mut ab, Some(&b)).unwrap();
        let mut ba = canvas();
        MergeReducer::merge(&mut ba, Some(&b)).unwrap();
        MergeReducer::merge(&mut ba, Some(&a)).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.band(DATE_BAND).unwrap()[[0, 0]], 110.0);
    }

    #[test]
    fn test_nodata_composite_pixel_never_wins() {
        let mut c = canvas();
        let empty = composite("E", 0, 0, -10000.0, -10000.0, -10000.0);
        let outcome = MergeReducer::merge(&mut c, Some(&empty)).unwrap();
        assert_eq!(outcome, MergeOutcome::Merged { pixels_updated: 0 });
    }

    #[test]
    fn test_out_of_bounds_and_missing_band_are_errors() {
        let mut c = canvas();
        assert!(MergeReducer::merge(&mut c, Some(&composite("X", 3, 3, 1.0, 1.0, 1.0))).is_err());

        let mut partial = composite("P", 0, 0, 1.0, 1.0, 1.0);
        partial.raster = RasterCanvas::filled(partial.raster.grid.clone(), -10000.0, &[SCORE_BAND.to_string()]);
        assert!(matches!(
            MergeReducer::merge(&mut c, Some(&partial)),
            Err(MosaicError::Processing(_))
        ));
    }
}
