// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! Inputs of [`crate::filter::Filter`] operations.
//!
//! [`Sample`] is one side of a `process()` call. [`ComposeSample`]s are
//! produced lazily by the generators below and consumed one by one by
//! `compose()`.

use gst_video::prelude::*;
use std::collections::VecDeque;
use std::sync::LazyLock;

use crate::device::{Rect, SurfaceFlags, SurfaceId};
use crate::display::VaDisplay;
use crate::importer::ImportedBuffer;

static CAT: LazyLock<gst::DebugCategory> = LazyLock::new(|| {
    gst::DebugCategory::new(
        "vasample",
        gst::DebugColorFlags::empty(),
        Some("VA compose sample generators"),
    )
});

/// A buffer with its surface and the per call parameters of `process()`.
#[derive(Debug, Clone)]
pub struct Sample<'a> {
    pub buffer: &'a gst::BufferRef,
    pub surface: SurfaceId,
    pub flags: SurfaceFlags,
    /// Horizontal and vertical borders around the picture, output only.
    pub borders: (u32, u32),
    pub forward_references: Vec<SurfaceId>,
    pub backward_references: Vec<SurfaceId>,
}

impl<'a> Sample<'a> {
    pub fn new(buffer: &'a gst::BufferRef, surface: SurfaceId) -> Self {
        Sample {
            buffer,
            surface,
            flags: SurfaceFlags::empty(),
            borders: (0, 0),
            forward_references: Vec::new(),
            backward_references: Vec::new(),
        }
    }

    pub fn from_imported(imported: &'a ImportedBuffer) -> Self {
        Self::new(imported.buffer(), imported.surface())
    }

    /// `None` when `buffer` has no surface on `display`.
    pub fn from_buffer(display: &VaDisplay, buffer: &'a gst::BufferRef) -> Option<Self> {
        display
            .buffer_surface(buffer)
            .map(|surface| Self::new(buffer, surface))
    }

    pub fn with_flags(mut self, flags: SurfaceFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_borders(mut self, width: u32, height: u32) -> Self {
        self.borders = (width, height);
        self
    }

    pub fn with_references(mut self, forward: Vec<SurfaceId>, backward: Vec<SurfaceId>) -> Self {
        self.forward_references = forward;
        self.backward_references = backward;
        self
    }
}

/// One input of a composition. The buffer is released once the sample has
/// been submitted.
#[derive(Debug)]
pub struct ComposeSample {
    pub buffer: ImportedBuffer,
    pub input_region: Rect,
    pub output_region: Rect,
    pub alpha: f64,
}

/// An overlay rectangle as found on a buffer's overlay composition.
#[derive(Debug, Clone)]
pub struct OverlayLayer {
    /// Unscaled ARGB pixels, with a video meta.
    pub pixels: gst::Buffer,
    pub info: gst_video::VideoInfo,
    pub render: Rect,
    pub alpha: f64,
}

/// Overlay rectangles attached to `buffer`.
pub fn overlay_layers(buffer: &gst::BufferRef) -> Vec<OverlayLayer> {
    let mut layers = Vec::new();

    for meta in buffer.iter_meta::<gst_video::VideoOverlayCompositionMeta>() {
        let composition = meta.overlay();
        for idx in 0..composition.n_rectangles() {
            let Ok(rect) = composition.rectangle(idx) else {
                continue;
            };

            let pixels =
                rect.pixels_unscaled_argb(gst_video::VideoOverlayFormatFlags::GLOBAL_ALPHA);
            let Some(vmeta) = pixels.meta::<gst_video::VideoMeta>() else {
                gst::warning!(CAT, "Overlay rectangle {} without video meta", idx);
                continue;
            };
            let Ok(info) =
                gst_video::VideoInfo::builder(vmeta.format(), vmeta.width(), vmeta.height())
                    .build()
            else {
                continue;
            };

            let (x, y, width, height) = rect.render_rectangle();
            layers.push(OverlayLayer {
                info,
                render: Rect::new(x, y, width, height),
                alpha: rect.global_alpha() as f64,
                pixels,
            });
        }
    }

    layers
}

/// Yields the frame first, stretched over the whole output, then every
/// overlay layer at its render position. Layers are imported on demand.
pub struct OverlaySamples<F> {
    frame: Option<ComposeSample>,
    layers: std::vec::IntoIter<OverlayLayer>,
    import: F,
}

impl<F> OverlaySamples<F>
where
    F: FnMut(&OverlayLayer) -> Option<ImportedBuffer>,
{
    pub fn new(
        frame: ImportedBuffer,
        input: &gst_video::VideoInfo,
        output: &gst_video::VideoInfo,
        layers: Vec<OverlayLayer>,
        import: F,
    ) -> Self {
        OverlaySamples {
            frame: Some(ComposeSample {
                buffer: frame,
                input_region: Rect::new(0, 0, input.width(), input.height()),
                output_region: Rect::new(0, 0, output.width(), output.height()),
                alpha: 1.0,
            }),
            layers: layers.into_iter(),
            import,
        }
    }
}

impl<F> Iterator for OverlaySamples<F>
where
    F: FnMut(&OverlayLayer) -> Option<ImportedBuffer>,
{
    type Item = ComposeSample;

    fn next(&mut self) -> Option<ComposeSample> {
        if let Some(frame) = self.frame.take() {
            return Some(frame);
        }

        for layer in self.layers.by_ref() {
            let Some(buffer) = (self.import)(&layer) else {
                gst::debug!(CAT, "Skipping overlay at {:?}", layer.render);
                continue;
            };
            return Some(ComposeSample {
                buffer,
                input_region: Rect::new(0, 0, layer.info.width(), layer.info.height()),
                output_region: layer.render,
                alpha: layer.alpha,
            });
        }

        None
    }
}

/// Geometry of one compositor input.
#[derive(Debug, Clone)]
pub struct PadInput<T> {
    pub source: T,
    /// Size of the input frames.
    pub width: u32,
    pub height: u32,
    pub xpos: i32,
    pub ypos: i32,
    /// Output size, 0 for the input size.
    pub out_width: u32,
    pub out_height: u32,
    pub alpha: f64,
}

impl<T> PadInput<T> {
    /// Where the input lands on an output of `width`x`height`, `None` when
    /// it is entirely outside.
    pub fn output_region(&self, width: u32, height: u32) -> Option<Rect> {
        let w = if self.out_width > 0 {
            self.out_width
        } else {
            self.width
        };
        let h = if self.out_height > 0 {
            self.out_height
        } else {
            self.height
        };

        let x0 = self.xpos.max(0);
        let y0 = self.ypos.max(0);
        let x1 = (self.xpos as i64 + w as i64).min(width as i64);
        let y1 = (self.ypos as i64 + h as i64).min(height as i64);
        if x1 <= x0 as i64 || y1 <= y0 as i64 {
            return None;
        }

        Some(Rect::new(x0, y0, (x1 - x0 as i64) as u32, (y1 - y0 as i64) as u32))
    }

    fn input_region(&self, output: &Rect) -> Rect {
        let w = if self.out_width > 0 {
            self.out_width
        } else {
            self.width
        };
        let h = if self.out_height > 0 {
            self.out_height
        } else {
            self.height
        };

        // Map the visible part back into input coordinates
        let sx = self.width as f64 / w as f64;
        let sy = self.height as f64 / h as f64;
        let x = ((output.x - self.xpos) as f64 * sx).round() as i32;
        let y = ((output.y - self.ypos) as f64 * sy).round() as i32;
        let width = ((output.width as f64 * sx).round() as u32).clamp(1, self.width);
        let height = ((output.height as f64 * sy).round() as u32).clamp(1, self.height);

        Rect::new(x, y, width, height)
    }
}

/// Yields one sample per visible compositor input, in order. Inputs are
/// imported on demand; fully transparent or off-screen ones are skipped.
pub struct CompositorSamples<T, F> {
    inputs: VecDeque<PadInput<T>>,
    width: u32,
    height: u32,
    import: F,
}

impl<T, F> CompositorSamples<T, F>
where
    F: FnMut(T) -> Option<ImportedBuffer>,
{
    pub fn new(inputs: Vec<PadInput<T>>, width: u32, height: u32, import: F) -> Self {
        CompositorSamples {
            inputs: inputs.into(),
            width,
            height,
            import,
        }
    }
}

impl<T, F> Iterator for CompositorSamples<T, F>
where
    F: FnMut(T) -> Option<ImportedBuffer>,
{
    type Item = ComposeSample;

    fn next(&mut self) -> Option<ComposeSample> {
        while let Some(input) = self.inputs.pop_front() {
            if input.alpha <= 0.0 {
                continue;
            }
            let Some(output_region) = input.output_region(self.width, self.height) else {
                gst::trace!(CAT, "Input at {}x{} is off-screen", input.xpos, input.ypos);
                continue;
            };
            let input_region = input.input_region(&output_region);
            let alpha = input.alpha.min(1.0);

            let Some(buffer) = (self.import)(input.source) else {
                continue;
            };

            return Some(ComposeSample {
                buffer,
                input_region,
                output_region,
                alpha,
            });
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pad(xpos: i32, ypos: i32, out_width: u32, alpha: f64) -> PadInput<u32> {
        PadInput {
            source: 0,
            width: 320,
            height: 240,
            xpos,
            ypos,
            out_width,
            out_height: 0,
            alpha,
        }
    }

    #[test]
    fn pad_regions_are_clipped() {
        assert_eq!(
            pad(0, 0, 0, 1.0).output_region(640, 480),
            Some(Rect::new(0, 0, 320, 240))
        );
        assert_eq!(
            pad(480, 400, 0, 1.0).output_region(640, 480),
            Some(Rect::new(480, 400, 160, 80))
        );
        assert_eq!(pad(640, 0, 0, 1.0).output_region(640, 480), None);

        let clipped = pad(-160, 0, 0, 1.0);
        let out = clipped.output_region(640, 480).unwrap();
        assert_eq!(out, Rect::new(0, 0, 160, 240));
        assert_eq!(clipped.input_region(&out), Rect::new(160, 0, 160, 240));
    }

    #[test]
    fn scaled_pad_maps_back_to_input() {
        let scaled = pad(0, 0, 640, 1.0);
        let out = scaled.output_region(640, 480).unwrap();
        assert_eq!(out, Rect::new(0, 0, 640, 240));
        assert_eq!(scaled.input_region(&out), Rect::new(0, 0, 320, 240));
    }
}
