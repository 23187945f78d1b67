//! SSD anchor centers for the 192x192 palm detector.
//!
//! Four feature layers with strides `[8, 16, 16, 16]`, two anchors per cell
//! per layer. Layers sharing a stride are merged, which yields
//! `24 * 24 * 2 + 12 * 12 * 6 = 2016` anchors.

use std::sync::OnceLock;

use super::PALM_INPUT_SIZE;

const STRIDES: [u32; 4] = [8, 16, 16, 16];
const ANCHORS_PER_LAYER: usize = 2;
const ANCHOR_OFFSET: f32 = 0.5;

pub const NUM_ANCHORS: usize = 2016;

pub fn anchors() -> &'static [[f32; 2]] {
    static ANCHORS: OnceLock<Vec<[f32; 2]>> = OnceLock::new();
    ANCHORS.get_or_init(generate)
}

fn generate() -> Vec<[f32; 2]> {
    let mut out = Vec::with_capacity(NUM_ANCHORS);
    let mut layer = 0;
    while layer < STRIDES.len() {
        let stride = STRIDES[layer];
        let mut repeats = 0;
        while layer < STRIDES.len() && STRIDES[layer] == stride {
            repeats += ANCHORS_PER_LAYER;
            layer += 1;
        }

        let cells = PALM_INPUT_SIZE.div_ceil(stride);
        for y in 0..cells {
            for x in 0..cells {
                let cx = (x as f32 + ANCHOR_OFFSET) / cells as f32;
                let cy = (y as f32 + ANCHOR_OFFSET) / cells as f32;
                for _ in 0..repeats {
                    out.push([cx, cy]);
                }
            }
        }
    }
    out
}
