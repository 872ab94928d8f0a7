//! Background-subtraction document detection.
//!
//! A dedicated worker thread receives (color, aligned depth) submissions,
//! learns the static depth background from the first few frames, then
//! looks for convex quadrilaterals in the depth-foreground region of each
//! frame. The sharpest sufficiently large candidate is reported through a
//! callback.

use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use imageproc::contours::find_contours;
use imageproc::distance_transform::Norm;
use imageproc::edges::canny;
use imageproc::filter::{gaussian_blur_f32, laplacian_filter};
use imageproc::geometry::{approximate_polygon_dp, arc_length};
use imageproc::morphology::{close, dilate, open};
use imageproc::point::Point;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// Frames sampled before detection starts to model the static background.
const BACKGROUND_SAMPLE_COUNT: usize = 5;
/// Depth change (millimeters) that marks a pixel as foreground.
const FOREGROUND_DEPTH_DELTA_MM: i32 = 15;
/// Candidate bounding boxes must cover at least this share of the frame.
const MIN_AREA_RATIO: f32 = 0.01;

/// One submission: the full-resolution color frame plus the aligned depth
/// image at depth resolution.
pub struct DocumentFrame {
    pub color: RgbImage,
    pub depth: Vec<u16>,
    pub depth_width: u32,
    pub depth_height: u32,
}

/// A detected document crop with its ranking score.
#[derive(Clone, Debug)]
pub struct DocumentDetection {
    pub image: RgbImage,
    pub score: f32,
}

pub type DetectionCallback = Box<dyn Fn(DocumentDetection) + Send>;

struct Mailbox {
    pending: Option<DocumentFrame>,
    stop: bool,
}

struct Shared {
    mailbox: Mutex<Mailbox>,
    signal: Condvar,
}

/// Worker-thread wrapper. Submissions are non-blocking and coalesce: the
/// worker always processes the latest frame only.
pub struct DocumentDetector {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl DocumentDetector {
    pub fn new(callback: DetectionCallback) -> Self {
        let shared = Arc::new(Shared {
            mailbox: Mutex::new(Mailbox {
                pending: None,
                stop: false,
            }),
            signal: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::spawn(move || {
            let mut state = DetectorState::default();
            loop {
                let job = {
                    let mut mailbox = worker_shared
                        .mailbox
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    while mailbox.pending.is_none() && !mailbox.stop {
                        mailbox = worker_shared
                            .signal
                            .wait(mailbox)
                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                    }
                    if mailbox.stop {
                        return;
                    }
                    mailbox.pending.take()
                };

                if let Some(job) = job {
                    if let Some(detection) = state.detect(&job) {
                        callback(detection);
                    }
                }
            }
        });

        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Replace any queued frame with this one and wake the worker.
    pub fn submit(&self, frame: DocumentFrame) {
        let mut mailbox = self
            .shared
            .mailbox
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        mailbox.pending = Some(frame);
        self.shared.signal.notify_one();
    }
}

impl Drop for DocumentDetector {
    fn drop(&mut self) {
        {
            let mut mailbox = self
                .shared
                .mailbox
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            mailbox.stop = true;
            self.shared.signal.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[derive(Default)]
struct DetectorState {
    background_samples: Vec<Vec<u16>>,
    background: Option<Vec<u16>>,
}

impl DetectorState {
    fn detect(&mut self, job: &DocumentFrame) -> Option<DocumentDetection> {
        let (dw, dh) = (job.depth_width as usize, job.depth_height as usize);
        if dw == 0 || dh == 0 || job.depth.len() != dw * dh {
            log::warn!("document frame with inconsistent depth buffer, dropping");
            return None;
        }

        if self.background.is_none() {
            self.background_samples.push(job.depth.clone());
            if self.background_samples.len() < BACKGROUND_SAMPLE_COUNT {
                return None;
            }
            self.background = Some(average_background(&self.background_samples, dw * dh));
            self.background_samples.clear();
        }
        let background = self.background.as_ref()?;

        let resized = imageops::resize(
            &job.color,
            job.depth_width,
            job.depth_height,
            FilterType::Triangle,
        );

        // Foreground where the scene moved toward the camera, or where the
        // background had no reading at all.
        let mut mask = GrayImage::new(job.depth_width, job.depth_height);
        for (i, px) in mask.pixels_mut().enumerate() {
            let bg = background[i] as i32;
            let curr = job.depth[i] as i32;
            let delta = bg - curr;
            let foreground = delta > FOREGROUND_DEPTH_DELTA_MM
                || (bg == 0 && delta < -FOREGROUND_DEPTH_DELTA_MM);
            px.0 = [if foreground { 255 } else { 0 }];
        }

        let mask = open(&mask, Norm::L2, 2);
        let mask = close(&mask, Norm::L2, 2);

        // Black out everything but the foreground.
        let mut masked = resized.clone();
        for (px, m) in masked.pixels_mut().zip(mask.pixels()) {
            if m.0[0] == 0 {
                px.0 = [0, 0, 0];
            }
        }

        let gray = imageops::grayscale(&masked);
        let blurred = gaussian_blur_f32(&gray, 1.1);
        let edges = canny(&blurred, 100.0, 200.0);
        let edges = dilate(&edges, Norm::LInf, 1);

        let frame_area = (dw * dh) as f32;
        let mut best: Option<DocumentDetection> = None;

        for contour in find_contours::<i32>(&edges) {
            let perimeter = arc_length(&contour.points, true);
            let approx = approximate_polygon_dp(&contour.points, perimeter * 0.018, true);
            if approx.len() != 4 || !is_convex(&approx) {
                continue;
            }

            let (bx, by, bw, bh) = bounding_box(&approx);
            let area_ratio = (bw * bh) as f32 / frame_area;
            if area_ratio < MIN_AREA_RATIO {
                continue;
            }

            let aspect = bw as f32 / bh as f32;
            if !(0.5..=2.0).contains(&aspect) {
                continue;
            }

            // Crop the unmasked full-resolution frame at the scaled box.
            let sx = job.color.width() as f32 / dw as f32;
            let sy = job.color.height() as f32 / dh as f32;
            let ox = ((bx as f32 * sx).round() as u32).min(job.color.width().saturating_sub(1));
            let oy = ((by as f32 * sy).round() as u32).min(job.color.height().saturating_sub(1));
            let ow = ((bw as f32 * sx).round() as u32).max(1).min(job.color.width() - ox);
            let oh = ((bh as f32 * sy).round() as u32).max(1).min(job.color.height() - oy);

            let cropped = imageops::crop_imm(&job.color, ox, oy, ow, oh).to_image();
            let sharpness = laplacian_variance(&imageops::grayscale(&cropped));
            let score = 0.9 * (sharpness / 1000.0) as f32 + 0.1 * area_ratio;

            if best.as_ref().map(|b| score > b.score).unwrap_or(true) {
                best = Some(DocumentDetection {
                    image: cropped,
                    score,
                });
            }
        }

        best
    }
}

/// Per-pixel mean of the collected depth samples, counting only valid
/// readings toward each pixel's divisor.
fn average_background(samples: &[Vec<u16>], len: usize) -> Vec<u16> {
    let mut sums = vec![0u32; len];
    let mut counts = vec![0u32; len];

    for sample in samples {
        for (i, &d) in sample.iter().enumerate() {
            sums[i] += d as u32;
            counts[i] += 1;
        }
    }

    sums.iter()
        .zip(&counts)
        .map(|(&s, &c)| if c > 0 { (s / c) as u16 } else { 0 })
        .collect()
}

fn bounding_box(points: &[Point<i32>]) -> (i32, i32, i32, i32) {
    let mut min_x = i32::MAX;
    let mut min_y = i32::MAX;
    let mut max_x = i32::MIN;
    let mut max_y = i32::MIN;
    for p in points {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }
    (min_x, min_y, (max_x - min_x).max(1), (max_y - min_y).max(1))
}

fn is_convex(points: &[Point<i32>]) -> bool {
    let n = points.len();
    if n < 4 {
        return true;
    }

    let mut sign = 0i64;
    for i in 0..n {
        let a = points[i];
        let b = points[(i + 1) % n];
        let c = points[(i + 2) % n];
        let cross =
            (b.x - a.x) as i64 * (c.y - b.y) as i64 - (b.y - a.y) as i64 * (c.x - b.x) as i64;
        if cross == 0 {
            continue;
        }
        if sign == 0 {
            sign = cross.signum();
        } else if sign != cross.signum() {
            return false;
        }
    }
    true
}

/// Sharpness metric: variance of the Laplacian response.
fn laplacian_variance(gray: &GrayImage) -> f64 {
    let lap = laplacian_filter(gray);
    let n = (lap.width() * lap.height()) as f64;
    if n == 0.0 {
        return 0.0;
    }

    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    for px in lap.pixels() {
        let v = px.0[0] as f64;
        sum += v;
        sum_sq += v * v;
    }

    let mean = sum / n;
    sum_sq / n - mean * mean
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn flat_depth(w: u32, h: u32, value: u16) -> Vec<u16> {
        vec![value; (w * h) as usize]
    }

    /// Depth frame with a raised rectangular "document" on a flat table.
    fn depth_with_document(w: u32, h: u32, table: u16) -> Vec<u16> {
        let mut depth = flat_depth(w, h, table);
        for y in 40..90 {
            for x in 30..110 {
                depth[(y * w + x) as usize] = table - 200;
            }
        }
        depth
    }

    /// Color frame with a bright, faintly textured patch where the
    /// document sits. The texture is low-contrast so edge detection only
    /// fires on the document outline.
    fn color_with_document(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| {
            if (30..110).contains(&x) && (40..90).contains(&y) {
                if (x + y) % 2 == 0 {
                    image::Rgb([255, 255, 255])
                } else {
                    image::Rgb([235, 235, 235])
                }
            } else {
                image::Rgb([40, 40, 40])
            }
        })
    }

    fn job(color: RgbImage, depth: Vec<u16>, w: u32, h: u32) -> DocumentFrame {
        DocumentFrame {
            color,
            depth,
            depth_width: w,
            depth_height: h,
        }
    }

    #[test]
    fn no_detection_until_background_is_learned() {
        let mut state = DetectorState::default();
        let (w, h) = (160, 120);

        for _ in 0..BACKGROUND_SAMPLE_COUNT - 1 {
            let out = state.detect(&job(color_with_document(w, h), flat_depth(w, h, 1200), w, h));
            assert!(out.is_none());
            assert!(state.background.is_none());
        }

        state.detect(&job(color_with_document(w, h), flat_depth(w, h, 1200), w, h));
        assert!(state.background.is_some());
    }

    #[test]
    fn raised_textured_quad_is_detected() {
        let mut state = DetectorState::default();
        let (w, h) = (160, 120);

        for _ in 0..BACKGROUND_SAMPLE_COUNT {
            state.detect(&job(color_with_document(w, h), flat_depth(w, h, 1200), w, h));
        }

        let detection = state
            .detect(&job(
                color_with_document(w, h),
                depth_with_document(w, h, 1200),
                w,
                h,
            ))
            .expect("document detected");

        assert!(detection.score > 0.0);
        // The crop should roughly match the raised region.
        assert!(detection.image.width() >= 60);
        assert!(detection.image.height() >= 35);
    }

    #[test]
    fn unchanged_scene_detects_nothing() {
        let mut state = DetectorState::default();
        let (w, h) = (160, 120);

        for _ in 0..BACKGROUND_SAMPLE_COUNT {
            state.detect(&job(color_with_document(w, h), flat_depth(w, h, 1200), w, h));
        }

        let out = state.detect(&job(color_with_document(w, h), flat_depth(w, h, 1200), w, h));
        assert!(out.is_none());
    }

    #[test]
    fn worker_reports_through_the_callback() {
        let (tx, rx) = mpsc::channel();
        let detector = DocumentDetector::new(Box::new(move |d| {
            let _ = tx.send(d.score);
        }));

        let (w, h) = (160, 120);
        for _ in 0..BACKGROUND_SAMPLE_COUNT {
            detector.submit(job(color_with_document(w, h), flat_depth(w, h, 1200), w, h));
            // Give the worker a chance to drain; submissions coalesce.
            std::thread::sleep(Duration::from_millis(20));
        }

        // Keep submitting the document scene until the worker reports it;
        // coalesced submissions may have eaten some background samples.
        let mut score = None;
        for _ in 0..100 {
            detector.submit(job(
                color_with_document(w, h),
                depth_with_document(w, h, 1200),
                w,
                h,
            ));
            if let Ok(s) = rx.recv_timeout(Duration::from_millis(200)) {
                score = Some(s);
                break;
            }
        }

        assert!(score.expect("detection callback") > 0.0);
        drop(detector);
    }
}
