//! Image geometry shared by the tracking stages.
//!
//! Coordinates are `(x, y)` with `x` the column and `y` the row, and
//! angles are measured with `atan2(dy, dx)` in image coordinates (so a
//! positive angle turns from +x towards +y, i.e. downwards on screen).

use crate::capture::Image;
use ndarray::Array2;
use std::f64::consts::{PI, TAU};

/// Wraps an angle into `(-π, π]`.
pub fn reduce_to_pi(angle: f64) -> f64 {
    if angle > -PI && angle <= PI {
        return angle;
    }
    let r = (angle + PI).rem_euclid(TAU) - PI;
    if r <= -PI {
        r + TAU
    } else {
        r
    }
}

/// Signed shortest-arc difference `a - b`.
#[inline]
pub fn angle_diff(a: f64, b: f64) -> f64 {
    reduce_to_pi(a - b)
}

/// Removes 2π jumps between consecutive angles in place.
pub fn unwrap_angles(angles: &mut [f64]) {
    for i in 1..angles.len() {
        angles[i] = angles[i - 1] + angle_diff(angles[i], angles[i - 1]);
    }
}

/// Linearly resamples `values` to `n` evenly spaced points spanning the
/// same range. Non-finite input yields all-NaN output.
pub fn interpolate(values: &[f64], n: usize) -> Vec<f64> {
    if n == 0 {
        return Vec::new();
    }
    if values.is_empty() || values.iter().any(|v| !v.is_finite()) {
        return vec![f64::NAN; n];
    }
    if values.len() == 1 || n == 1 {
        return vec![values[0]; n];
    }
    let last = (values.len() - 1) as f64;
    (0..n)
        .map(|i| {
            let pos = i as f64 * last / (n - 1) as f64;
            let lo = (pos.floor() as usize).min(values.len() - 2);
            let f = pos - lo as f64;
            values[lo] * (1.0 - f) + values[lo + 1] * f
        })
        .collect()
}

/// Pixel value at `(x, y)` with bilinear interpolation, or `None` outside.
pub fn sample_bilinear(image: &Image, x: f64, y: f64) -> Option<f64> {
    let (rows, cols) = image.dim();
    if rows == 0 || cols == 0 || !(x >= 0.0 && y >= 0.0) {
        return None;
    }
    if x > (cols - 1) as f64 || y > (rows - 1) as f64 {
        return None;
    }
    let c0 = x.floor() as usize;
    let r0 = y.floor() as usize;
    let c1 = (c0 + 1).min(cols - 1);
    let r1 = (r0 + 1).min(rows - 1);
    let fx = x - c0 as f64;
    let fy = y - r0 as f64;
    let top = image[[r0, c0]] as f64 * (1.0 - fx) + image[[r0, c1]] as f64 * fx;
    let bottom = image[[r1, c0]] as f64 * (1.0 - fx) + image[[r1, c1]] as f64 * fx;
    Some(top * (1.0 - fy) + bottom * fy)
}

/// One step of centroid-following along a bright structure.
///
/// Computes the intensity-weighted centroid of a disk of `radius` centred
/// at `point + step`, then returns the displacement from `point` to that
/// centroid rescaled to the length of `step`. Returns `None` when the disk
/// lies fully outside the image or contains no intensity.
pub fn centroid_step(
    image: &Image,
    point: (f64, f64),
    step: (f64, f64),
    radius: f64,
) -> Option<(f64, f64)> {
    let (rows, cols) = image.dim();
    if rows == 0 || cols == 0 || !(radius > 0.0) {
        return None;
    }
    let cx = point.0 + step.0;
    let cy = point.1 + step.1;
    if !cx.is_finite() || !cy.is_finite() {
        return None;
    }

    let r0 = (cy - radius).floor().max(0.0);
    let r1 = (cy + radius).ceil().min((rows - 1) as f64);
    let c0 = (cx - radius).floor().max(0.0);
    let c1 = (cx + radius).ceil().min((cols - 1) as f64);
    if r0 > r1 || c0 > c1 {
        return None;
    }

    let r2 = radius * radius;
    let (mut sum, mut sx, mut sy) = (0.0, 0.0, 0.0);
    for row in r0 as usize..=r1 as usize {
        for col in c0 as usize..=c1 as usize {
            let dx = col as f64 - cx;
            let dy = row as f64 - cy;
            if dx * dx + dy * dy > r2 {
                continue;
            }
            let w = image[[row, col]] as f64;
            sum += w;
            sx += w * col as f64;
            sy += w * row as f64;
        }
    }
    if sum <= 0.0 {
        return None;
    }

    let dx = sx / sum - point.0;
    let dy = sy / sum - point.1;
    let norm = (dx * dx + dy * dy).sqrt();
    let length = (step.0 * step.0 + step.1 * step.1).sqrt();
    if norm == 0.0 {
        return None;
    }
    Some((dx * length / norm, dy * length / norm))
}

/// Ellipse described by a region's second moments.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EllipseFit {
    pub cx: f64,
    pub cy: f64,
    /// Full major axis length.
    pub major: f64,
    /// Full minor axis length.
    pub minor: f64,
    /// Major axis orientation in `(-π/2, π/2]`.
    pub theta: f64,
}

/// A connected group of foreground pixels and its raw moments.
#[derive(Debug, Clone, Default)]
pub struct Region {
    pub area: usize,
    /// `(min_row, min_col, max_row, max_col)`, inclusive.
    pub bbox: (usize, usize, usize, usize),
    sum_x: f64,
    sum_y: f64,
    sum_xx: f64,
    sum_yy: f64,
    sum_xy: f64,
}

impl Region {
    fn add(&mut self, row: usize, col: usize) {
        if self.area == 0 {
            self.bbox = (row, col, row, col);
        } else {
            self.bbox.0 = self.bbox.0.min(row);
            self.bbox.1 = self.bbox.1.min(col);
            self.bbox.2 = self.bbox.2.max(row);
            self.bbox.3 = self.bbox.3.max(col);
        }
        let (x, y) = (col as f64, row as f64);
        self.area += 1;
        self.sum_x += x;
        self.sum_y += y;
        self.sum_xx += x * x;
        self.sum_yy += y * y;
        self.sum_xy += x * y;
    }

    pub fn centroid(&self) -> (f64, f64) {
        let n = self.area as f64;
        (self.sum_x / n, self.sum_y / n)
    }

    /// Fits an ellipse with the region's second central moments.
    ///
    /// Returns `None` for degenerate regions (a line or a single pixel).
    pub fn fit_ellipse(&self) -> Option<EllipseFit> {
        if self.area == 0 {
            return None;
        }
        let n = self.area as f64;
        let (cx, cy) = self.centroid();
        let mu20 = self.sum_xx / n - cx * cx;
        let mu02 = self.sum_yy / n - cy * cy;
        let mu11 = self.sum_xy / n - cx * cy;

        let mean = (mu20 + mu02) / 2.0;
        let spread = (((mu20 - mu02) / 2.0).powi(2) + mu11 * mu11).sqrt();
        let l1 = mean + spread;
        let l2 = mean - spread;
        if !(l1 > 0.0 && l2 > 0.0) {
            return None;
        }
        let mut theta = 0.5 * (2.0 * mu11).atan2(mu20 - mu02);
        if theta <= -PI / 2.0 {
            theta += PI;
        }
        Some(EllipseFit {
            cx,
            cy,
            major: 4.0 * l1.sqrt(),
            minor: 4.0 * l2.sqrt(),
            theta,
        })
    }
}

fn find_root(parents: &mut [usize], label: usize) -> usize {
    let mut current = label;
    while current != parents[current] {
        parents[current] = parents[parents[current]];
        current = parents[current];
    }
    current
}

fn union(parents: &mut [usize], a: usize, b: usize) {
    let ra = find_root(parents, a);
    let rb = find_root(parents, b);
    if ra < rb {
        parents[rb] = ra;
    } else if rb < ra {
        parents[ra] = rb;
    }
}

/// Labels 4-connected foreground regions of `mask`.
///
/// Two-pass labelling with union-find; regions are returned in raster order
/// of their first pixel.
pub fn find_regions(mask: &Array2<bool>) -> Vec<Region> {
    let (rows, cols) = mask.dim();
    let mut labels = Array2::<usize>::zeros((rows, cols));
    // Label 0 is background.
    let mut parents = vec![0usize];

    for row in 0..rows {
        for col in 0..cols {
            if !mask[[row, col]] {
                continue;
            }
            let up = if row > 0 { labels[[row - 1, col]] } else { 0 };
            let left = if col > 0 { labels[[row, col - 1]] } else { 0 };
            labels[[row, col]] = match (up, left) {
                (0, 0) => {
                    let next = parents.len();
                    parents.push(next);
                    next
                }
                (l, 0) | (0, l) => l,
                (u, l) => {
                    union(&mut parents, u, l);
                    u.min(l)
                }
            };
        }
    }

    let mut slots = vec![usize::MAX; parents.len()];
    let mut regions: Vec<Region> = Vec::new();
    for row in 0..rows {
        for col in 0..cols {
            let label = labels[[row, col]];
            if label == 0 {
                continue;
            }
            let root = find_root(&mut parents, label);
            if slots[root] == usize::MAX {
                slots[root] = regions.len();
                regions.push(Region::default());
            }
            regions[slots[root]].add(row, col);
        }
    }
    regions
}

/// Sets every background pixel that the border cannot reach.
///
/// Background is followed 8-connected, the dual of the 4-connected
/// foreground in [`find_regions`], so a region is filled only when its
/// outline is closed in the sense [`find_regions`] uses.
pub fn fill_holes(mask: &Array2<bool>) -> Array2<bool> {
    let (rows, cols) = mask.dim();
    let mut outside = Array2::from_elem((rows, cols), false);
    let mut stack: Vec<(usize, usize)> = (0..rows)
        .flat_map(|r| [(r, 0), (r, cols.saturating_sub(1))])
        .chain((0..cols).flat_map(|c| [(0, c), (rows.saturating_sub(1), c)]))
        .filter(|&(r, c)| r < rows && c < cols)
        .collect();

    while let Some((row, col)) = stack.pop() {
        if mask[[row, col]] || outside[[row, col]] {
            continue;
        }
        outside[[row, col]] = true;
        for dr in -1isize..=1 {
            for dc in -1isize..=1 {
                let (r, c) = (row as isize + dr, col as isize + dc);
                if r >= 0 && c >= 0 && (r as usize) < rows && (c as usize) < cols {
                    stack.push((r as usize, c as usize));
                }
            }
        }
    }
    outside.mapv(|o| !o)
}

/// Binary mask of pixels on the chosen side of `threshold`.
pub fn threshold_mask(image: &Image, threshold: u8, dark: bool) -> Array2<bool> {
    if dark {
        image.mapv(|p| p < threshold)
    } else {
        image.mapv(|p| p >= threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::synthetic::{draw_line, fill_ellipse};
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_reduce_to_pi_range() {
        assert_relative_eq!(reduce_to_pi(3.0 * PI).abs(), PI, epsilon = 1e-9);
        assert_relative_eq!(reduce_to_pi(-PI), PI);
        assert_relative_eq!(reduce_to_pi(0.5 + TAU * 4.0), 0.5, epsilon = 1e-9);
        assert_relative_eq!(angle_diff(PI - 0.1, -PI + 0.1), -0.2, epsilon = 1e-9);
    }

    #[test]
    fn test_unwrap_angles() {
        let mut angles = [3.0, -3.0, -2.9];
        unwrap_angles(&mut angles);
        assert_relative_eq!(angles[1], TAU - 3.0, epsilon = 1e-9);
        assert!(angles[2] > angles[1]);
    }

    #[test]
    fn test_interpolate_endpoints() {
        let out = interpolate(&[0.0, 1.0, 4.0], 5);
        assert_eq!(out.len(), 5);
        assert_relative_eq!(out[0], 0.0);
        assert_relative_eq!(out[2], 1.0);
        assert_relative_eq!(out[3], 2.5);
        assert_relative_eq!(out[4], 4.0);
        assert!(interpolate(&[1.0, f64::NAN], 3).iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_bilinear() {
        let mut image = Image::zeros((2, 2));
        image[[0, 1]] = 100;
        assert_relative_eq!(sample_bilinear(&image, 0.5, 0.0).unwrap(), 50.0);
        assert!(sample_bilinear(&image, 1.5, 0.0).is_none());
        assert!(sample_bilinear(&image, -0.1, 0.0).is_none());
    }

    #[test]
    fn test_centroid_step_follows_line() {
        let mut image = Image::zeros((60, 60));
        draw_line(&mut image, (30.0, 5.0), (30.0, 55.0), 1.5, 255);
        // Aim off-axis; the centroid pulls the step back onto the line.
        let (dx, dy) = centroid_step(&image, (30.0, 10.0), (3.0, 8.0), 5.0).unwrap();
        assert!(dx.abs() < 1.0);
        assert_relative_eq!((dx * dx + dy * dy).sqrt(), (73.0f64).sqrt(), epsilon = 1e-9);
        assert!(centroid_step(&image, (5.0, 10.0), (0.0, 5.0), 3.0).is_none());
        assert!(centroid_step(&image, (500.0, 10.0), (0.0, 5.0), 3.0).is_none());
    }

    #[test]
    fn test_regions_four_connected() {
        let mut mask = Array2::from_elem((4, 4), false);
        mask[[0, 0]] = true;
        mask[[1, 1]] = true;
        mask[[2, 1]] = true;
        mask[[2, 2]] = true;
        let regions = find_regions(&mask);
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[1].area, 3);
        assert_eq!(regions[1].bbox, (1, 1, 2, 2));
    }

    #[test]
    fn test_regions_merge_u_shape() {
        let mut mask = Array2::from_elem((3, 3), false);
        for r in 0..3 {
            mask[[r, 0]] = true;
            mask[[r, 2]] = true;
        }
        mask[[2, 1]] = true;
        let regions = find_regions(&mask);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].area, 7);
    }

    #[test]
    fn test_fill_holes() {
        let mut mask = Array2::from_elem((5, 6), false);
        for r in 1..4 {
            for c in 1..4 {
                mask[[r, c]] = true;
            }
        }
        mask[[2, 2]] = false;
        let filled = fill_holes(&mask);
        assert!(filled[[2, 2]]);
        assert!(!filled[[0, 0]] && !filled[[2, 5]]);
        assert_eq!(filled.iter().filter(|&&m| m).count(), 9);

        // a diagonal gap leaves the ring open
        mask[[1, 1]] = false;
        let open = fill_holes(&mask);
        assert!(!open[[2, 2]]);
        assert!(fill_holes(&Array2::from_elem((0, 0), false)).is_empty());
    }

    #[test]
    fn test_fit_ellipse_recovers_axes() {
        let mut image = Image::zeros((100, 100));
        fill_ellipse(&mut image, 50.0, 40.0, 20.0, 8.0, 0.4, 255);
        let regions = find_regions(&threshold_mask(&image, 128, false));
        assert_eq!(regions.len(), 1);
        let fit = regions[0].fit_ellipse().unwrap();
        assert_relative_eq!(fit.cx, 50.0, epsilon = 0.5);
        assert_relative_eq!(fit.cy, 40.0, epsilon = 0.5);
        assert_relative_eq!(fit.major, 40.0, epsilon = 2.0);
        assert_relative_eq!(fit.minor, 16.0, epsilon = 2.0);
        assert_relative_eq!(fit.theta, 0.4, epsilon = 0.05);
    }

    #[test]
    fn test_fit_ellipse_vertical_orientation() {
        let mut image = Image::zeros((80, 80));
        fill_ellipse(&mut image, 40.0, 40.0, 20.0, 6.0, FRAC_PI_2, 255);
        let regions = find_regions(&threshold_mask(&image, 1, false));
        let fit = regions[0].fit_ellipse().unwrap();
        // Orientation is only defined modulo π.
        assert_relative_eq!(fit.theta.abs(), FRAC_PI_2, epsilon = 0.05);
    }

    #[test]
    fn test_degenerate_region_has_no_ellipse() {
        let mut mask = Array2::from_elem((5, 5), false);
        for c in 0..5 {
            mask[[2, c]] = true;
        }
        assert!(find_regions(&mask)[0].fit_ellipse().is_none());
    }
}
