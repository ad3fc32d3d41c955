// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use crate::geometry::{Coord, SMALL};

/// Inverse-distance interpolation of a scalar field at `p` from point/value
/// samples: sum(w_i v_i) / sum(w_i) with w_i = 1 / |p - p_i|.
///
/// A sample coincident with `p` short-circuits to that sample's value.
/// Returns NaN for an empty sample set.
pub fn inverse_distance<P: Coord>(p: &P, samples: &[(P, f64)]) -> f64 {
    let mut num = 0.0;
    let mut den = 0.0;
    for (q, v) in samples {
        let d = p.dist(q);
        if d < SMALL {
            return *v;
        }
        let w = 1.0 / d;
        num += w * v;
        den += w;
    }
    num / den
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Point2;

    #[test]
    fn coincident_short_circuit() {
        let samples = [
            (Point2::new(0.0, 0.0), 1.0),
            (Point2::new(1.0, 0.0), 5.0),
        ];
        let v = inverse_distance(&Point2::new(1.0, 0.0), &samples);
        assert_eq!(v, 5.0);
    }

    #[test]
    fn midpoint_is_mean() {
        let samples = [
            (Point2::new(0.0, 0.0), 2.0),
            (Point2::new(2.0, 0.0), 4.0),
        ];
        let v = inverse_distance(&Point2::new(1.0, 0.0), &samples);
        assert!((v - 3.0).abs() < 1e-12);
    }

    #[test]
    fn nearer_sample_dominates() {
        let samples = [
            (Point2::new(0.0, 0.0), 0.0),
            (Point2::new(10.0, 0.0), 10.0),
        ];
        let v = inverse_distance(&Point2::new(1.0, 0.0), &samples);
        assert!(v < 5.0);
    }

    #[test]
    fn empty_set_is_nan() {
        let samples: [(Point2, f64); 0] = [];
        assert!(inverse_distance(&Point2::new(0.0, 0.0), &samples).is_nan());
    }
}
