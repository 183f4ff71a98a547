//! Face alignment via a 4-DOF similarity transform.
//!
//! Maps the five detected landmarks onto the InsightFace reference layout and
//! warps the RGB image into the 112×112 crop ArcFace expects.

use image::RgbImage;

/// ArcFace reference landmarks for a 112×112 output.
pub(crate) const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub(crate) const ALIGNED_SIZE: usize = 112;

/// Row-major 2×3 similarity matrix `[a, -b, tx, b, a, ty]`.
type Similarity = [f32; 6];

/// Closed-form least-squares similarity (scale, rotation, translation) from
/// `src` to `dst`, without reflection.
fn estimate_similarity(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Similarity {
    let n = src.len() as f32;
    let mean = |pts: &[(f32, f32); 5]| {
        let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), (x, y)| (ax + x, ay + y));
        (sx / n, sy / n)
    };
    let (spx, spy) = mean(src);
    let (dpx, dpy) = mean(dst);

    let mut norm = 0.0f32;
    let mut dot = 0.0f32;
    let mut cross = 0.0f32;
    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
        let (px, py) = (sx - spx, sy - spy);
        let (qx, qy) = (dx - dpx, dy - dpy);
        norm += px * px + py * py;
        dot += px * qx + py * qy;
        cross += px * qy - py * qx;
    }

    if norm < 1e-12 {
        // Degenerate landmarks: pure translation onto the reference centroid.
        return [1.0, 0.0, dpx - spx, 0.0, 1.0, dpy - spy];
    }

    let a = dot / norm;
    let b = cross / norm;
    let tx = dpx - (a * spx - b * spy);
    let ty = dpy - (b * spx + a * spy);
    [a, -b, tx, b, a, ty]
}

/// Inverse-map every output pixel through `m` and sample bilinearly.
/// Pixels that fall outside the source are black.
fn warp_affine(img: &RgbImage, m: &Similarity, out_size: usize) -> Vec<u8> {
    let (a, tx, b, ty) = (m[0], m[2], m[3], m[5]);
    let mut out = vec![0u8; out_size * out_size * 3];

    let det = a * a + b * b;
    if det < 1e-12 {
        return out;
    }
    let (ia, ib) = (a / det, b / det);
    let (w, h) = (img.width() as i64, img.height() as i64);

    let texel = |x: i64, y: i64, c: usize| -> f32 {
        if x < 0 || y < 0 || x >= w || y >= h {
            0.0
        } else {
            img.get_pixel(x as u32, y as u32).0[c] as f32
        }
    };

    for oy in 0..out_size {
        for ox in 0..out_size {
            let dx = ox as f32 - tx;
            let dy = oy as f32 - ty;
            let sx = ia * dx + ib * dy;
            let sy = -ib * dx + ia * dy;

            let x0 = sx.floor() as i64;
            let y0 = sy.floor() as i64;
            let fx = sx - x0 as f32;
            let fy = sy - y0 as f32;

            let base = (oy * out_size + ox) * 3;
            for c in 0..3 {
                let top = texel(x0, y0, c) * (1.0 - fx) + texel(x0 + 1, y0, c) * fx;
                let bottom = texel(x0, y0 + 1, c) * (1.0 - fx) + texel(x0 + 1, y0 + 1, c) * fx;
                let v = top * (1.0 - fy) + bottom * fy;
                out[base + c] = v.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    out
}

/// Align one face to an interleaved RGB 112×112 crop.
pub(crate) fn align_face(img: &RgbImage, landmarks: &[(f32, f32); 5]) -> Vec<u8> {
    let m = estimate_similarity(landmarks, &REFERENCE_LANDMARKS_112);
    warp_affine(img, &m, ALIGNED_SIZE)
}
