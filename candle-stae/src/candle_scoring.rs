/// Regularity score of each frame
///
/// s(t) = 1 - (e(t) - min e) / (max e - min e)
///
/// Min and max run over finite errors only; a frame without a finite
/// error scores NaN. A flat error sequence is perfectly regular (all
/// ones). Low scores flag anomalous frames.
pub fn regularity_scores(errors: &[f32]) -> Vec<f32> {
    let finite = || errors.iter().copied().filter(|e| e.is_finite());
    let lo = finite().fold(f32::INFINITY, f32::min);
    let hi = finite().fold(f32::NEG_INFINITY, f32::max);
    let range = hi - lo;

    errors
        .iter()
        .map(|&e| {
            if !e.is_finite() {
                f32::NAN
            } else if range > 0. {
                1. - (e - lo) / range
            } else {
                1.
            }
        })
        .collect()
}

/// Fold per-volume, per-step errors of sliding windows back onto frame
/// indices, averaging where windows overlap
///
/// * `volume_errors` - N rows of T errors; volume `i` starts at frame `i * stride`
/// * `stride` - offset between consecutive volumes
///
/// # Returns errors of the `(N - 1) * stride + T` spanned frames; frames
/// that fall between windows (`stride > T`) are NaN
pub fn frame_errors(volume_errors: &[Vec<f32>], stride: usize) -> Vec<f32> {
    let Some(tvol) = volume_errors.iter().map(|v| v.len()).max() else {
        return vec![];
    };
    let nframes = (volume_errors.len() - 1) * stride + tvol;
    let mut sum = vec![0f32; nframes];
    let mut count = vec![0usize; nframes];

    for (i, errs) in volume_errors.iter().enumerate() {
        for (t, e) in errs.iter().enumerate() {
            let f = i * stride + t;
            sum[f] += e;
            count[f] += 1;
        }
    }

    sum.into_iter()
        .zip(count)
        .map(|(s, n)| if n > 0 { s / n as f32 } else { f32::NAN })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regularity_bounds() {
        let s = regularity_scores(&[2., 4., 3., 6.]);
        assert_eq!(s, vec![1., 0.5, 0.75, 0.]);
        assert_eq!(regularity_scores(&[5., 5.]), vec![1., 1.]);
        assert!(regularity_scores(&[]).is_empty());
    }

    #[test]
    fn test_frame_errors_average_overlaps() {
        let errs = vec![vec![1., 2., 3.], vec![5., 6., 7.]];
        // frames: 0 <- 1, 1 <- (2 + 5) / 2, 2 <- (3 + 6) / 2, 3 <- 7
        assert_eq!(frame_errors(&errs, 1), vec![1., 3.5, 4.5, 7.]);
        // no overlap with stride == T
        assert_eq!(frame_errors(&errs, 3), vec![1., 2., 3., 5., 6., 7.]);
        assert!(frame_errors(&[], 1).is_empty());
    }

    #[test]
    fn test_gaps_between_windows_are_not_scored() {
        let flat = frame_errors(&[vec![1., 1.], vec![1., 1.]], 3);
        assert_eq!(flat.len(), 5);
        assert!(flat[2].is_nan());

        // covered frames stay perfectly regular
        let s = regularity_scores(&flat);
        assert_eq!(s.len(), 5);
        assert!(s[2].is_nan());
        for t in [0, 1, 3, 4] {
            assert_eq!(s[t], 1.);
        }

        let s = regularity_scores(&frame_errors(&[vec![1., 2.], vec![3., 4.]], 3));
        assert!(s[2].is_nan());
        let covered = [s[0], s[1], s[3], s[4]];
        let expected = [1., 2. / 3., 1. / 3., 0.];
        for (a, b) in covered.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-6, "{} vs {}", a, b);
        }
    }
}
