//! Face alignment via 4-DOF similarity transform.
//!
//! Warps a detected face to a canonical square crop using five reference
//! landmarks and least-squares estimation. This is the landmark stage of the
//! deep pipeline, between detection and descriptor extraction.

use image::{Rgb, RgbImage};

/// Canonical landmarks for a 112×112 crop; scaled for other sizes.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

/// Reference landmarks for an `out_size`×`out_size` crop.
pub fn reference_landmarks(out_size: u32) -> [(f32, f32); 5] {
    let s = out_size as f32 / 112.0;
    REFERENCE_LANDMARKS_112.map(|(x, y)| (x * s, y * s))
}

/// 4-DOF similarity `dst = [a -b; b a] * src + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    const IDENTITY: Self = Self { a: 1.0, b: 0.0, tx: 0.0, ty: 0.0 };

    /// Least-squares fit mapping `src` onto `dst`, solved in closed form
    /// about the landmark centroids.
    fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Self {
        let centroid = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
            (sx / 5.0, sy / 5.0)
        };
        let (scx, scy) = centroid(src);
        let (dcx, dcy) = centroid(dst);

        let (mut dot, mut cross, mut norm) = (0.0f32, 0.0f32, 0.0f32);
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst) {
            let (sx, sy, dx, dy) = (sx - scx, sy - scy, dx - dcx, dy - dcy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            norm += sx * sx + sy * sy;
        }
        if norm < 1e-12 {
            // Coincident landmarks.
            return Self::IDENTITY;
        }

        let (a, b) = (dot / norm, cross / norm);
        Self {
            a,
            b,
            tx: dcx - (a * scx - b * scy),
            ty: dcy - (b * scx + a * scy),
        }
    }

    fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (self.a * x - self.b * y + self.tx, self.b * x + self.a * y + self.ty)
    }

    fn inverse(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let (a, b) = (self.a / det, -self.b / det);
        Some(Self {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        })
    }
}

/// Bilinear sample of one output pixel; outside the frame reads as black.
fn sample_bilinear(frame: &RgbImage, (x, y): (f32, f32)) -> Rgb<u8> {
    let (w, h) = (frame.width() as i64, frame.height() as i64);
    let (x0, y0) = (x.floor() as i64, y.floor() as i64);
    let (fx, fy) = (x - x0 as f32, y - y0 as f32);

    let texel = |px: i64, py: i64| -> [f32; 3] {
        if (0..w).contains(&px) && (0..h).contains(&py) {
            frame.get_pixel(px as u32, py as u32).0.map(f32::from)
        } else {
            [0.0; 3]
        }
    };
    let corners = [
        (texel(x0, y0), (1.0 - fx) * (1.0 - fy)),
        (texel(x0 + 1, y0), fx * (1.0 - fy)),
        (texel(x0, y0 + 1), (1.0 - fx) * fy),
        (texel(x0 + 1, y0 + 1), fx * fy),
    ];

    Rgb(std::array::from_fn(|c| {
        let v: f32 = corners.iter().map(|(t, wgt)| t[c] * wgt).sum();
        v.round().clamp(0.0, 255.0) as u8
    }))
}

/// Align a detected face to a canonical `out_size`×`out_size` RGB crop.
pub fn align_face(frame: &RgbImage, landmarks: &[(f32, f32); 5], out_size: u32) -> RgbImage {
    let Some(back) = Similarity::estimate(landmarks, &reference_landmarks(out_size)).inverse() else {
        return RgbImage::new(out_size, out_size);
    };
    RgbImage::from_fn(out_size, out_size, |ox, oy| {
        sample_bilinear(frame, back.apply((ox as f32, oy as f32)))
    })
}
