// THEORY:
// The `blob_detector` is the Centroid Extractor. It turns one segmentation mask
// into a list of candidate marker positions and nothing more; it has no memory
// of previous frames.
//
// Algorithm steps:
// 1.  **Denoise**: a median (default) or Gaussian blur suppresses isolated pixel
//     noise that the segmentation network leaves behind.
// 2.  **Binarize**: a fixed intensity threshold keeps only marker-bright pixels.
// 3.  **Label**: 8-connected component labelling groups foreground pixels into
//     blobs. A breadth-first flood fill from each unvisited foreground pixel keeps
//     the scan order deterministic.
// 4.  **Moments**: each blob's centroid is `(M10 / M00, M01 / M00)` over its raw
//     moments, truncated to integer pixels. Moments are pixel counts, so every
//     blob has a non-zero area and even a single bright pixel yields a centroid.
//
// The binarized mask is handed back alongside the centroids because the
// diagnostic overlay is drawn on top of it.

use crate::config::{BlurKind, TrackingConfig};
use crate::core_modules::centroid::Centroid;
use image::GrayImage;

/// Output of one extraction pass.
#[derive(Debug, Clone)]
pub struct Extraction {
    /// Centroids in raster order of each blob's first pixel.
    pub centroids: Vec<Centroid>,
    /// The thresholded mask (0 or 255).
    pub mask: GrayImage,
}

pub mod blob_detector {
    use super::*;
    use std::collections::VecDeque;

    /// Runs the full blur, threshold, label and moment chain on one frame.
    pub fn extract_centroids(image: &GrayImage, config: &TrackingConfig) -> Extraction {
        if image.width() == 0 || image.height() == 0 {
            return Extraction {
                centroids: Vec::new(),
                mask: GrayImage::new(image.width(), image.height()),
            };
        }

        // --- 1. Denoise ---
        let blurred = denoise(image, config.blur, config.blur_kernel);

        // --- 2. Binarize ---
        let mask = binarize(&blurred, config.threshold);

        // --- 3 & 4. Label and compute moments ---
        let centroids = find_centroids(&mask);

        Extraction { centroids, mask }
    }

    pub fn denoise(image: &GrayImage, kind: BlurKind, kernel: u32) -> GrayImage {
        let kernel = odd_kernel(kernel);
        if kernel <= 1 {
            return image.clone();
        }
        match kind {
            BlurKind::Median => median_blur(image, kernel),
            BlurKind::Gaussian => image::imageops::blur(image, gaussian_sigma(kernel)),
        }
    }

    fn odd_kernel(kernel: u32) -> u32 {
        if kernel % 2 == 0 { kernel + 1 } else { kernel }
    }

    /// Sigma for a Gaussian of the given aperture, the usual `0.3 * ((k - 1) / 2 - 1) + 0.8`.
    fn gaussian_sigma(kernel: u32) -> f32 {
        0.3 * ((kernel as f32 - 1.0) * 0.5 - 1.0) + 0.8
    }

    /// Square median filter. Pixels outside the image are clamped to the border.
    pub fn median_blur(image: &GrayImage, kernel: u32) -> GrayImage {
        let (width, height) = image.dimensions();
        let radius = (kernel / 2) as i64;
        let mut window: Vec<u8> = Vec::with_capacity((kernel * kernel) as usize);
        let mut out = GrayImage::new(width, height);

        for y in 0..height as i64 {
            for x in 0..width as i64 {
                window.clear();
                for dy in -radius..=radius {
                    let sy = (y + dy).clamp(0, height as i64 - 1) as u32;
                    for dx in -radius..=radius {
                        let sx = (x + dx).clamp(0, width as i64 - 1) as u32;
                        window.push(image.get_pixel(sx, sy).0[0]);
                    }
                }
                let mid = window.len() / 2;
                let (_, median, _) = window.select_nth_unstable(mid);
                out.put_pixel(x as u32, y as u32, image::Luma([*median]));
            }
        }
        out
    }

    pub fn binarize(image: &GrayImage, threshold: u8) -> GrayImage {
        let mut out = image.clone();
        for pixel in out.pixels_mut() {
            pixel.0[0] = if pixel.0[0] > threshold { 255 } else { 0 };
        }
        out
    }

    /// Labels 8-connected foreground blobs of a binary mask and returns their centroids.
    pub fn find_centroids(mask: &GrayImage) -> Vec<Centroid> {
        let (width, height) = mask.dimensions();
        let (w, h) = (width as usize, height as usize);
        let foreground = |x: usize, y: usize| mask.get_pixel(x as u32, y as u32).0[0] != 0;

        let mut visited = vec![false; w * h];
        let mut queue: VecDeque<(usize, usize)> = VecDeque::new();
        let mut centroids = Vec::new();

        for y in 0..h {
            for x in 0..w {
                if visited[y * w + x] || !foreground(x, y) {
                    continue;
                }

                // Grow the blob from this seed and accumulate its raw moments.
                let (mut m00, mut m10, mut m01) = (0u64, 0u64, 0u64);
                visited[y * w + x] = true;
                queue.push_back((x, y));

                while let Some((cx, cy)) = queue.pop_front() {
                    m00 += 1;
                    m10 += cx as u64;
                    m01 += cy as u64;

                    for dy in -1i64..=1 {
                        for dx in -1i64..=1 {
                            if dx == 0 && dy == 0 {
                                continue;
                            }
                            let nx = cx as i64 + dx;
                            let ny = cy as i64 + dy;
                            if nx < 0 || ny < 0 || nx >= w as i64 || ny >= h as i64 {
                                continue;
                            }
                            let (nx, ny) = (nx as usize, ny as usize);
                            if !visited[ny * w + nx] && foreground(nx, ny) {
                                visited[ny * w + nx] = true;
                                queue.push_back((nx, ny));
                            }
                        }
                    }
                }

                centroids.push(Centroid::new((m10 / m00) as i32, (m01 / m00) as i32));
            }
        }

        centroids
    }
}
