//! Utilities for numerics.

/// Computes the softmax of `v` in place.
///
/// The maximum is subtracted before exponentiation, so large logits do not overflow.
pub fn softmax_in_place(v: &mut [f32]) {
    let max = v.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for x in v.iter_mut() {
        *x = (*x - max).exp();
        sum += *x;
    }
    for x in v.iter_mut() {
        *x /= sum;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn softmax_sums_to_one() {
        let mut v = [1.0, 2.0, 3.0, 4.0];
        softmax_in_place(&mut v);
        assert_relative_eq!(v.iter().sum::<f32>(), 1.0, epsilon = 1e-6);
        assert!(v[3] > v[2] && v[2] > v[1] && v[1] > v[0]);
    }
}
