// THEORY:
// L2 is the fine reconstruction stage. It only sees frames that L1 accepted and
// claimed, so it works on the frame's private copy of the weighted plane and
// can take its time. Every pixel above the block's L2 threshold becomes a
// candidate. For each candidate it records the local 3x3 and 5x5 means and the
// brightest neighbour, the shape information downstream classification needs
// to tell a particle track from a hot pixel.
//
// Key architectural principles:
// 1.  **Bounded output**: a noisy frame can light up thousands of pixels. The
//     number kept is capped by one of two policies: `default` keeps the first
//     `npix` in scan order and counts the rest as dropped; `maxn` keeps the
//     `npix` brightest, ties going to the pixel seen first.
// 2.  **Selection before decoration**: neighbourhood aggregates are computed
//     only for the pixels that survive selection.
// 3.  **Windows clip at the edges**: a candidate on the border averages over
//     the part of its window that lies inside the frame.

use crate::core_modules::acquisition_block::AcquisitionBlock;
use crate::core_modules::frame::FrameBuffer;
use crate::core_modules::trigger_config::TriggerConfig;
use crate::error::FrameError;
use crate::parallel_pipeline::{StageContext, TaskOutcome};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, TryReserveError};

pub const DEFAULT_UNRANKED_NPIX: u64 = 500;
pub const DEFAULT_TOP_N_NPIX: u64 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPolicy {
    Unranked,
    TopN,
}

#[derive(Debug, Clone, PartialEq)]
pub struct L2Config {
    pub policy: SelectionPolicy,
    pub npix: usize,
}

impl L2Config {
    pub fn from_trigger(config: &TriggerConfig) -> Self {
        let (policy, default_npix) = match config.name() {
            "maxn" => (SelectionPolicy::TopN, DEFAULT_TOP_N_NPIX),
            name => {
                if name != "default" {
                    log::warn!("unknown L2 policy '{}', using default", name);
                }
                (SelectionPolicy::Unranked, DEFAULT_UNRANKED_NPIX)
            }
        };
        Self {
            policy,
            npix: config.get_u64("npix", default_npix) as usize,
        }
    }
}

/// One reconstructed pixel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidatePixel {
    pub x: u32,
    pub y: u32,
    pub value: u8,
    /// Mean of the 3x3 window around the pixel.
    pub avg3: f64,
    /// Mean of the 5x5 window around the pixel.
    pub avg5: f64,
    /// Brightest of the 8 neighbours.
    pub near_max: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconstruction {
    pub pixels: Vec<CandidatePixel>,
    pub dropped: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Candidate {
    x: u32,
    y: u32,
    value: u8,
}

/// Scans `plane` for pixels above `threshold` and keeps them per `config`.
pub fn reconstruct(
    plane: &GrayImage,
    threshold: u8,
    config: &L2Config,
) -> Result<Reconstruction, TryReserveError> {
    let candidates = plane
        .enumerate_pixels()
        .filter(|(_, _, p)| p.0[0] > threshold)
        .map(|(x, y, p)| Candidate { x, y, value: p.0[0] });

    let (selected, total) = match config.policy {
        SelectionPolicy::Unranked => keep_first(candidates, config.npix)?,
        SelectionPolicy::TopN => keep_brightest(candidates, config.npix),
    };

    let mut pixels = Vec::new();
    pixels.try_reserve_exact(selected.len())?;
    pixels.extend(selected.iter().map(|c| decorate(plane, *c)));
    let dropped = total.saturating_sub(pixels.len()) as u64;
    Ok(Reconstruction { pixels, dropped })
}

fn keep_first(
    candidates: impl Iterator<Item = Candidate>,
    cap: usize,
) -> Result<(Vec<Candidate>, usize), TryReserveError> {
    let mut kept = Vec::new();
    let mut total = 0;
    for candidate in candidates {
        total += 1;
        if kept.len() < cap {
            kept.try_reserve(1)?;
            kept.push(candidate);
        }
    }
    Ok((kept, total))
}

/// Keeps the `cap` highest values; among equal values the earlier one wins.
/// Returned in priority order.
fn keep_brightest(candidates: impl Iterator<Item = Candidate>, cap: usize) -> (Vec<Candidate>, usize) {
    // Ordered by value, then by earlier sequence. The heap holds reversed
    // entries so its top is the weakest survivor.
    let mut heap: BinaryHeap<Reverse<(u8, Reverse<usize>, u32, u32)>> =
        BinaryHeap::with_capacity(cap + 1);
    let mut total = 0;
    for (sequence, candidate) in candidates.enumerate() {
        total += 1;
        if cap == 0 {
            continue;
        }
        let entry = (candidate.value, Reverse(sequence), candidate.x, candidate.y);
        if heap.len() < cap {
            heap.push(Reverse(entry));
        } else if heap.peek().is_some_and(|Reverse(weakest)| entry > *weakest) {
            heap.pop();
            heap.push(Reverse(entry));
        }
    }
    let mut entries: Vec<_> = heap.into_iter().map(|Reverse(entry)| entry).collect();
    entries.sort_unstable_by(|a, b| b.cmp(a));
    let kept = entries
        .into_iter()
        .map(|(value, _, x, y)| Candidate { x, y, value })
        .collect();
    (kept, total)
}

fn decorate(plane: &GrayImage, candidate: Candidate) -> CandidatePixel {
    let (avg3, near_max) = window_stats(plane, candidate.x, candidate.y, 1);
    let (avg5, _) = window_stats(plane, candidate.x, candidate.y, 2);
    CandidatePixel {
        x: candidate.x,
        y: candidate.y,
        value: candidate.value,
        avg3,
        avg5,
        near_max,
    }
}

/// Mean over the clipped window of the given radius, and the max over the
/// window excluding its centre.
fn window_stats(plane: &GrayImage, x: u32, y: u32, radius: u32) -> (f64, u8) {
    let (width, height) = plane.dimensions();
    let x0 = x.saturating_sub(radius);
    let y0 = y.saturating_sub(radius);
    let x1 = (x + radius).min(width - 1);
    let y1 = (y + radius).min(height - 1);

    let mut sum = 0u64;
    let mut count = 0u64;
    let mut neighbour_max = 0u8;
    for yy in y0..=y1 {
        for xx in x0..=x1 {
            let value = plane.get_pixel(xx, yy).0[0];
            sum += value as u64;
            count += 1;
            if (xx, yy) != (x, y) {
                neighbour_max = neighbour_max.max(value);
            }
        }
    }
    (sum as f64 / count as f64, neighbour_max)
}

pub fn process_frame(
    config: &L2Config,
    frame: &FrameBuffer,
    block: &AcquisitionBlock,
    ctx: &StageContext,
) -> TaskOutcome {
    let threshold = block.l2_threshold();
    let reconstruction = match frame.with_plane(|plane| reconstruct(plane, threshold, config)) {
        Ok(Ok(reco)) => reco,
        Ok(Err(alloc)) => {
            let err = FrameError::OutOfMemory {
                frame_id: frame.id(),
                bytes: config.npix * std::mem::size_of::<CandidatePixel>(),
            };
            log::warn!("L2 reconstruction dropped: {} ({})", err, alloc);
            return TaskOutcome::Drop;
        }
        Err(err) => {
            log::warn!("L2 cannot read frame: {}", err);
            return TaskOutcome::Drop;
        }
    };

    block.add_dropped_pixels(reconstruction.dropped);
    let kept = reconstruction.pixels.len() as u64;
    if kept > 0 {
        frame.set_pixels(reconstruction.pixels);
        ctx.pass_monitor.record(frame.metadata().acquired.nanos);
    }
    TaskOutcome::Forward { pass: kept }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(values: &[u8]) -> GrayImage {
        GrayImage::from_raw(values.len() as u32, 1, values.to_vec()).unwrap()
    }

    #[test]
    fn top_n_keeps_highest_with_first_seen_ties() {
        let plane = row(&[5, 9, 2, 9, 7, 1]);
        let config = L2Config {
            policy: SelectionPolicy::TopN,
            npix: 3,
        };
        let reco = reconstruct(&plane, 0, &config).unwrap();

        let kept: Vec<(u32, u8)> = reco.pixels.iter().map(|p| (p.x, p.value)).collect();
        assert_eq!(kept, vec![(1, 9), (3, 9), (4, 7)]);
        assert_eq!(reco.dropped, 3);
    }

    #[test]
    fn unranked_keeps_first_in_scan_order() {
        let plane = row(&[5, 9, 2, 9, 7, 1]);
        let config = L2Config {
            policy: SelectionPolicy::Unranked,
            npix: 2,
        };
        let reco = reconstruct(&plane, 1, &config).unwrap();

        let kept: Vec<u32> = reco.pixels.iter().map(|p| p.x).collect();
        assert_eq!(kept, vec![0, 1]);
        assert_eq!(reco.dropped, 3);
    }

    #[test]
    fn neighbourhood_windows_clip_at_edges() {
        let mut plane = GrayImage::new(5, 5);
        plane.put_pixel(0, 0, image::Luma([90]));
        plane.put_pixel(1, 0, image::Luma([30]));
        plane.put_pixel(4, 4, image::Luma([50]));
        let config = L2Config {
            policy: SelectionPolicy::Unranked,
            npix: 10,
        };
        let reco = reconstruct(&plane, 40, &config).unwrap();
        assert_eq!(reco.pixels.len(), 2);

        let corner = &reco.pixels[0];
        assert_eq!((corner.x, corner.y), (0, 0));
        // 3x3 clips to 2x2, 5x5 clips to 3x3.
        assert!((corner.avg3 - 120.0 / 4.0).abs() < 1e-9);
        assert!((corner.avg5 - 120.0 / 9.0).abs() < 1e-9);
        assert_eq!(corner.near_max, 30);

        let far = &reco.pixels[1];
        assert_eq!(far.near_max, 0);
        assert!((far.avg3 - 50.0 / 4.0).abs() < 1e-9);
    }

    #[test]
    fn zero_cap_keeps_nothing() {
        let plane = row(&[50, 60]);
        for policy in [SelectionPolicy::TopN, SelectionPolicy::Unranked] {
            let reco = reconstruct(&plane, 0, &L2Config { policy, npix: 0 }).unwrap();
            assert!(reco.pixels.is_empty());
            assert_eq!(reco.dropped, 2);
        }
    }

    #[test]
    fn config_names_select_policies() {
        let maxn = L2Config::from_trigger(&TriggerConfig::parse("maxn"));
        assert_eq!(maxn, L2Config { policy: SelectionPolicy::TopN, npix: 25 });
        let unranked = L2Config::from_trigger(&TriggerConfig::parse("default;npix=7"));
        assert_eq!(unranked, L2Config { policy: SelectionPolicy::Unranked, npix: 7 });
    }
}
