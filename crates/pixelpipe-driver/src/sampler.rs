//! Histogram, waveform and color-picker sampling hooks, run against a
//! node's already-materialized output buffer.

use rayon::prelude::*;

use pixelpipe_cache::{Channels, ImageBufferDescriptor, Roi};

/// Area above which color-picker sampling switches from a sequential scan to
/// a `rayon` row-parallel reduce.
const PARALLEL_THRESHOLD_PX: u64 = 100;

/// Per-channel bin counts and observed maxima from a histogram request.
#[derive(Debug, Clone)]
pub struct HistogramResult {
    /// One bin vector per sampled channel: 3 for [`Channels::Rgba`] (alpha
    /// is not histogrammed), 1 for a CFA layout.
    pub bins: Vec<Vec<u32>>,
    /// Per-channel maximum observed value, same channel order as `bins`.
    pub max: Vec<f32>,
}

/// Bins `buffer`'s `roi` region into `bin_count` buckets per channel.
///
/// Only meaningful for `Float32` buffers; values are clamped into `[0, 1]`
/// before binning.
#[must_use]
pub fn histogram(
    buffer: &[u8],
    dsc: &ImageBufferDescriptor,
    roi: &Roi,
    bin_count: u32,
) -> HistogramResult {
    let channels = match dsc.channels {
        Channels::Rgba => 3,
        Channels::BayerCfa { .. } | Channels::XTransCfa { .. } => 1,
    };
    let bin_count = bin_count.max(1) as usize;
    let mut bins = vec![vec![0u32; bin_count]; channels];
    let mut max = vec![0.0f32; channels];

    let stride = dsc.channels.count() as usize;
    for_each_pixel(buffer, dsc, roi, |pixel| {
        for c in 0..channels {
            let v = pixel[c.min(stride - 1)];
            if v > max[c] {
                max[c] = v;
            }
            let clamped = v.clamp(0.0, 1.0);
            let bin = ((clamped * bin_count as f32) as usize).min(bin_count - 1);
            bins[c][bin] += 1;
        }
    });

    HistogramResult { bins, max }
}

/// A coarse per-column luma histogram over a region, used to draw a
/// waveform scope in a preview pipeline.
#[derive(Debug, Clone)]
pub struct WaveformResult {
    /// Number of columns sampled.
    pub width: u32,
    /// Number of luma buckets per column.
    pub height: u32,
    /// Row-major `width * height` bucket counts, scaled to the ratio of
    /// the sampled region's area to the full image's area.
    pub bins: Vec<u32>,
}

/// Computes a waveform histogram of `roi` within `buffer`, scaled against
/// `image_width`/`image_height` so a small preview region still reads at
/// the same relative density as a full-image sample would.
#[must_use]
pub fn waveform(
    buffer: &[u8],
    dsc: &ImageBufferDescriptor,
    roi: &Roi,
    out_width: u32,
    out_height: u32,
    image_width: u32,
    image_height: u32,
) -> WaveformResult {
    let out_width = out_width.max(1);
    let out_height = out_height.max(1);
    let mut bins = vec![0u32; out_width as usize * out_height as usize];

    let stride = dsc.channels.count() as usize;
    for y in 0..roi.height {
        for x in 0..roi.width {
            let off = ((y as usize * roi.width as usize) + x as usize) * stride * 4;
            let luma = match dsc.channels {
                Channels::Rgba => {
                    let r = read_f32(buffer, off);
                    let g = read_f32(buffer, off + 4);
                    let b = read_f32(buffer, off + 8);
                    0.299 * r + 0.587 * g + 0.114 * b
                }
                Channels::BayerCfa { .. } | Channels::XTransCfa { .. } => read_f32(buffer, off),
            };
            let col = (x * out_width) / roi.width.max(1);
            let row = ((luma.clamp(0.0, 1.0)) * (out_height - 1) as f32) as u32;
            let col = col.min(out_width - 1);
            let row = row.min(out_height - 1);
            bins[(row * out_width + col) as usize] += 1;
        }
    }

    let preview_area = roi.area().max(1) as f64;
    let image_area = (image_width as u64 * image_height as u64).max(1) as f64;
    let scale = image_area / preview_area;
    for bin in &mut bins {
        *bin = ((*bin as f64) * scale).round() as u32;
    }

    WaveformResult { width: out_width, height: out_height, bins }
}

/// Mean, minimum and maximum sampled over a color-picker box, one entry
/// per of up to 4 channels (the fourth is unused/zero for CFA layouts).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorPick {
    /// Per-channel mean.
    pub mean: [f32; 4],
    /// Per-channel minimum.
    pub min: [f32; 4],
    /// Per-channel maximum.
    pub max: [f32; 4],
}

/// Samples `box_roi`, clipped against `containing_roi`, returning `None` if
/// the clipped box has zero area.
#[must_use]
pub fn pick(
    buffer: &[u8],
    dsc: &ImageBufferDescriptor,
    containing_roi: &Roi,
    box_roi: &Roi,
) -> Option<ColorPick> {
    let clipped = clip(containing_roi, box_roi)?;
    match dsc.channels {
        Channels::Rgba => Some(pick_rgba(buffer, dsc, containing_roi, &clipped)),
        Channels::BayerCfa { filter } => Some(pick_bayer(buffer, dsc, containing_roi, &clipped, filter)),
        Channels::XTransCfa { pattern } => Some(pick_xtrans(buffer, dsc, containing_roi, &clipped, pattern)),
    }
}

fn clip(containing: &Roi, requested: &Roi) -> Option<Roi> {
    let x0 = requested.x.max(containing.x);
    let y0 = requested.y.max(containing.y);
    let x1 = (requested.x + requested.width).min(containing.x + containing.width);
    let y1 = (requested.y + requested.height).min(containing.y + containing.height);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(Roi {
        x: x0,
        y: y0,
        width: x1 - x0,
        height: y1 - y0,
        scale: containing.scale,
    })
}

fn pick_rgba(buffer: &[u8], dsc: &ImageBufferDescriptor, containing: &Roi, box_roi: &Roi) -> ColorPick {
    let rows: Vec<u32> = (0..box_roi.height).collect();
    let reduce = |row: u32| -> ([f32; 3], [f32; 3], [f32; 3], u32) {
        let mut sum = [0.0f32; 3];
        let mut min = [f32::MAX; 3];
        let mut max = [f32::MIN; 3];
        for dx in 0..box_roi.width {
            let x = box_roi.x - containing.x + dx;
            let y = box_roi.y - containing.y + row;
            let off = ((y as usize * containing.width as usize) + x as usize) * 16;
            for c in 0..3 {
                let v = read_f32(buffer, off + c * 4);
                sum[c] += v;
                min[c] = min[c].min(v);
                max[c] = max[c].max(v);
            }
        }
        (sum, min, max, box_roi.width)
    };

    let (sum, min, max) = if box_roi.area() > PARALLEL_THRESHOLD_PX {
        rows.into_par_iter()
            .map(reduce)
            .reduce(
                || ([0.0f32; 3], [f32::MAX; 3], [f32::MIN; 3], 0u32),
                |a, b| merge3(a, b),
            )
    } else {
        rows.into_iter()
            .map(reduce)
            .fold(([0.0f32; 3], [f32::MAX; 3], [f32::MIN; 3], 0u32), merge3)
    };
    let count = (box_roi.area() as f32).max(1.0);
    let mut mean = [0.0f32; 4];
    let mut min4 = [0.0f32; 4];
    let mut max4 = [0.0f32; 4];
    for c in 0..3 {
        mean[c] = sum[c] / count;
        min4[c] = min[c];
        max4[c] = max[c];
    }
    ColorPick { mean, min: min4, max: max4 }
}

fn merge3(
    a: ([f32; 3], [f32; 3], [f32; 3], u32),
    b: ([f32; 3], [f32; 3], [f32; 3], u32),
) -> ([f32; 3], [f32; 3], [f32; 3], u32) {
    let mut sum = [0.0f32; 3];
    let mut min = [0.0f32; 3];
    let mut max = [0.0f32; 3];
    for c in 0..3 {
        sum[c] = a.0[c] + b.0[c];
        min[c] = a.1[c].min(b.1[c]);
        max[c] = a.2[c].max(b.2[c]);
    }
    (sum, min, max, a.3 + b.3)
}

/// Which of the 4 raw 2x2-tile positions (`(y % 2) * 2 + (x % 2)`) decodes
/// to which actual CFA color, per the encoded 2-bits-per-position `filter`.
fn bayer_color_at(filter: u32, raw_position: u32) -> usize {
    ((filter >> (raw_position * 2)) & 0b11) as usize
}

fn pick_bayer(
    buffer: &[u8],
    dsc: &ImageBufferDescriptor,
    containing: &Roi,
    box_roi: &Roi,
    filter: u32,
) -> ColorPick {
    let classify = |x: u32, y: u32| -> usize { ((y % 2) * 2 + (x % 2)) as usize };
    let sums = classify_and_accumulate(buffer, dsc, containing, box_roi, 4, classify);
    merge_raw_classes_by_color(&sums, |raw_position| bayer_color_at(filter, raw_position as u32))
}

fn pick_xtrans(
    buffer: &[u8],
    dsc: &ImageBufferDescriptor,
    containing: &Roi,
    box_roi: &Roi,
    pattern: pixelpipe_cache::XTransPattern,
) -> ColorPick {
    let classify = move |x: u32, y: u32| -> usize { pattern[(y % 6) as usize][(x % 6) as usize] as usize };
    let sums = classify_and_accumulate(buffer, dsc, containing, box_roi, 3, classify);
    merge_raw_classes_by_color(&sums, |raw_position| raw_position)
}

#[derive(Clone, Copy)]
struct ClassAccum {
    sum: f32,
    min: f32,
    max: f32,
    count: u32,
}

impl Default for ClassAccum {
    fn default() -> Self {
        Self { sum: 0.0, min: f32::MAX, max: f32::MIN, count: 0 }
    }
}

fn classify_and_accumulate(
    buffer: &[u8],
    dsc: &ImageBufferDescriptor,
    containing: &Roi,
    box_roi: &Roi,
    classes: usize,
    classify: impl Fn(u32, u32) -> usize + Sync,
) -> Vec<ClassAccum> {
    debug_assert!(dsc.channels.is_cfa());
    let rows: Vec<u32> = (0..box_roi.height).collect();
    let reduce = |row: u32| -> Vec<ClassAccum> {
        let mut acc = vec![ClassAccum::default(); classes];
        let sx = box_roi.x - containing.x;
        let sy = box_roi.y - containing.y + row;
        for dx in 0..box_roi.width {
            let x = sx + dx;
            let abs_x = box_roi.x + dx;
            let abs_y = box_roi.y + row;
            let off = (sy as usize * containing.width as usize + x as usize) * 4;
            let v = read_f32(buffer, off);
            let class = classify(abs_x, abs_y);
            let a = &mut acc[class];
            a.sum += v;
            a.min = a.min.min(v);
            a.max = a.max.max(v);
            a.count += 1;
        }
        acc
    };

    if box_roi.area() > PARALLEL_THRESHOLD_PX {
        rows.into_par_iter()
            .map(reduce)
            .reduce(|| vec![ClassAccum::default(); classes], |a, b| merge_classes(&a, &b))
    } else {
        rows.into_iter()
            .map(reduce)
            .fold(vec![ClassAccum::default(); classes], |a, b| merge_classes(&a, &b))
    }
}

fn merge_classes(a: &[ClassAccum], b: &[ClassAccum]) -> Vec<ClassAccum> {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| ClassAccum {
            sum: x.sum + y.sum,
            min: x.min.min(y.min),
            max: x.max.max(y.max),
            count: x.count + y.count,
        })
        .collect()
}

/// Folds per-raw-position accumulators down into per-actual-color buckets
/// (e.g. the two Bayer green positions merge into one green channel) by
/// summing the contributing classes' raw sums/counts before dividing,
/// equivalent to normalizing each merged class by its own total count.
fn merge_raw_classes_by_color(
    raw: &[ClassAccum],
    color_of: impl Fn(usize) -> usize,
) -> ColorPick {
    let mut merged = vec![ClassAccum::default(); 3];
    for (raw_position, acc) in raw.iter().enumerate() {
        let color = color_of(raw_position);
        let m = &mut merged[color];
        m.sum += acc.sum;
        m.min = m.min.min(acc.min);
        m.max = m.max.max(acc.max);
        m.count += acc.count;
    }
    let mut mean = [0.0f32; 4];
    let mut min = [0.0f32; 4];
    let mut max = [0.0f32; 4];
    for (c, acc) in merged.iter().enumerate() {
        if acc.count > 0 {
            mean[c] = acc.sum / acc.count as f32;
            min[c] = acc.min;
            max[c] = acc.max;
        }
    }
    ColorPick { mean, min, max }
}

fn read_f32(buffer: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes([
        buffer[offset],
        buffer[offset + 1],
        buffer[offset + 2],
        buffer[offset + 3],
    ])
}

fn for_each_pixel(buffer: &[u8], dsc: &ImageBufferDescriptor, roi: &Roi, mut f: impl FnMut(&[f32])) {
    let stride = dsc.channels.count() as usize;
    let mut pixel = [0.0f32; 4];
    for y in 0..roi.height {
        for x in 0..roi.width {
            let off = ((y as usize * roi.width as usize) + x as usize) * stride * 4;
            for c in 0..stride {
                pixel[c] = read_f32(buffer, off + c * 4);
            }
            f(&pixel[..stride]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pixelpipe_cache::Datatype;

    fn rgba_dsc(w: u32, h: u32) -> ImageBufferDescriptor {
        ImageBufferDescriptor::new(w, h, Channels::Rgba, Datatype::Float32)
    }

    fn flat_rgba(w: u32, h: u32, value: f32) -> Vec<u8> {
        let mut buf = vec![0u8; w as usize * h as usize * 16];
        for chunk in buf.chunks_exact_mut(4) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        buf
    }

    #[test]
    fn histogram_counts_every_pixel() {
        let dsc = rgba_dsc(4, 4);
        let buf = flat_rgba(4, 4, 0.5);
        let roi = Roi::identity(4, 4);
        let result = histogram(&buf, &dsc, &roi, 16);
        assert_eq!(result.bins.len(), 3);
        let total: u32 = result.bins[0].iter().sum();
        assert_eq!(total, 16);
    }

    #[test]
    fn pick_rgba_flat_buffer_mean_equals_value() {
        let dsc = rgba_dsc(8, 8);
        let buf = flat_rgba(8, 8, 0.25);
        let containing = Roi::identity(8, 8);
        let box_roi = Roi::new(2, 2, 3, 3, 1.0);
        let result = pick(&buf, &dsc, &containing, &box_roi).unwrap();
        assert!((result.mean[0] - 0.25).abs() < 1e-6);
        assert!((result.mean[1] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn pick_clips_box_outside_containing() {
        let dsc = rgba_dsc(8, 8);
        let buf = flat_rgba(8, 8, 0.1);
        let containing = Roi::identity(8, 8);
        let box_roi = Roi::new(6, 6, 10, 10, 1.0);
        let result = pick(&buf, &dsc, &containing, &box_roi);
        assert!(result.is_some());
    }

    #[test]
    fn pick_returns_none_for_fully_outside_box() {
        let dsc = rgba_dsc(8, 8);
        let buf = flat_rgba(8, 8, 0.1);
        let containing = Roi::new(0, 0, 8, 8, 1.0);
        let box_roi = Roi::new(20, 20, 4, 4, 1.0);
        assert!(pick(&buf, &dsc, &containing, &box_roi).is_none());
    }

    #[test]
    fn bayer_merge_combines_both_green_positions() {
        // RGGB with color codes 0=R, 1=G, 2=B: position order
        // (R, G, G, B) packed 2 bits per position.
        let filter = 0b10_01_01_00u32;
        let g0 = bayer_color_at(filter, 1);
        let g1 = bayer_color_at(filter, 2);
        assert_eq!(g0, g1, "positions 1 and 2 both decode to green in RGGB");
    }
}
