// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! The video processing pipeline of a device.
//!
//! A [`Filter`] owns one processing context. `process()` runs one input
//! through the queued filter buffers into one output, `compose()` blends any
//! number of inputs into one output within a single picture.

use gst_video::prelude::*;
use gst_video::VideoOrientationMethod;
use std::sync::{LazyLock, Mutex, MutexGuard};

use crate::caps::{caps_from_attributes, MemoryFeature};
use crate::colorimetry::color_properties;
use crate::device::*;
use crate::display::VaDisplay;
use crate::error::VaError;
use crate::sample::{ComposeSample, Sample};

static CAT: LazyLock<gst::DebugCategory> = LazyLock::new(|| {
    gst::DebugCategory::new(
        "vafilter",
        gst::DebugColorFlags::empty(),
        Some("VA video processing filter"),
    )
});

/// Mirror and rotation realizing an orientation.
pub fn orientation_transform(method: VideoOrientationMethod) -> Option<(MirrorFlags, Rotation)> {
    let transform = match method {
        VideoOrientationMethod::Identity => (MirrorFlags::empty(), Rotation::None),
        VideoOrientationMethod::Horiz => (MirrorFlags::HORIZONTAL, Rotation::None),
        VideoOrientationMethod::Vert => (MirrorFlags::VERTICAL, Rotation::None),
        VideoOrientationMethod::_90r => (MirrorFlags::empty(), Rotation::R90),
        VideoOrientationMethod::_180 => (MirrorFlags::empty(), Rotation::R180),
        VideoOrientationMethod::_90l => (MirrorFlags::empty(), Rotation::R270),
        VideoOrientationMethod::UlLr => (MirrorFlags::HORIZONTAL, Rotation::R90),
        VideoOrientationMethod::UrLl => (MirrorFlags::VERTICAL, Rotation::R90),
        _ => return None,
    };
    Some(transform)
}

/// Whether `method` swaps width and height.
pub fn orientation_swaps_dimensions(method: VideoOrientationMethod) -> bool {
    matches!(
        method,
        VideoOrientationMethod::_90r
            | VideoOrientationMethod::_90l
            | VideoOrientationMethod::UlLr
            | VideoOrientationMethod::UrLl
    )
}

#[derive(Debug, Clone, Copy)]
struct Handles {
    config: ConfigId,
    context: ContextId,
}

#[derive(Debug)]
struct State {
    handles: Option<Handles>,
    attributes: SurfaceAttributes,
    pipeline_caps: PipelineCaps,
    available: Vec<(FilterType, FilterCaps)>,
    filters: Vec<BufferId>,
    orientation: VideoOrientationMethod,
    mirror: MirrorFlags,
    rotation: Rotation,
    scale_method: ScaleMethod,
    crop_enabled: bool,
    input_region: Rect,
    output_region: Rect,
    input_color: (ColorStandard, ColorProperties),
    output_color: (ColorStandard, ColorProperties),
}

impl Default for State {
    fn default() -> Self {
        State {
            handles: None,
            attributes: SurfaceAttributes::default(),
            pipeline_caps: PipelineCaps::default(),
            available: Vec::new(),
            filters: Vec::new(),
            orientation: VideoOrientationMethod::Identity,
            mirror: MirrorFlags::empty(),
            rotation: Rotation::None,
            scale_method: ScaleMethod::Default,
            crop_enabled: false,
            input_region: Rect::default(),
            output_region: Rect::default(),
            input_color: Default::default(),
            output_color: Default::default(),
        }
    }
}

pub struct Filter {
    display: VaDisplay,
    state: Mutex<State>,
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Filter")
            .field("display", &self.display)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Filter {
    pub fn new(display: &VaDisplay) -> Self {
        Filter {
            display: display.clone(),
            state: Mutex::new(State::default()),
        }
    }

    pub fn display(&self) -> &VaDisplay {
        &self.display
    }

    fn device(&self) -> &dyn Device {
        self.display.device()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn handles(&self) -> Result<Handles, VaError> {
        self.state()
            .handles
            .ok_or_else(|| VaError::InvalidArgument(String::from("filter is not open")))
    }

    pub fn is_open(&self) -> bool {
        self.state().handles.is_some()
    }

    pub fn open(&self) -> Result<(), VaError> {
        if self.is_open() {
            return Ok(());
        }

        let device = self.device();
        let attribs = device.config_attributes(Profile::None, Entrypoint::VideoProc)?;
        let rt_format = attribs.rt_formats.unwrap_or(RtFormat::YUV420);
        let config = device.create_config(Profile::None, Entrypoint::VideoProc, rt_format)?;

        let opened = (|| {
            let mut attributes = device.surface_attributes(config)?;
            if let Some(max) = attribs.max_width {
                attributes.max_width = attributes.max_width.min(max);
            }
            if let Some(max) = attribs.max_height {
                attributes.max_height = attributes.max_height.min(max);
            }

            let context = device.create_context(config, 0, 0)?;

            let available = device.query_filters(context).map(|types| {
                types
                    .into_iter()
                    .filter_map(|t| match device.query_filter_caps(context, t) {
                        Ok(caps) => Some((t, caps)),
                        Err(err) => {
                            gst::debug!(CAT, "No caps for filter {:?}: {}", t, err);
                            None
                        }
                    })
                    .collect::<Vec<_>>()
            });
            let pipeline_caps = available.and_then(|available| {
                Ok((available, device.query_pipeline_caps(context, &[])?))
            });

            match pipeline_caps {
                Ok((available, pipeline_caps)) => Ok((attributes, context, available, pipeline_caps)),
                Err(err) => {
                    let _ = device.destroy_context(context);
                    Err(err)
                }
            }
        })();

        let (attributes, context, available, pipeline_caps) = match opened {
            Ok(opened) => opened,
            Err(err) => {
                let _ = device.destroy_config(config);
                return Err(err);
            }
        };

        gst::debug!(
            CAT,
            "Opened filter on {} with {} filters",
            device.vendor(),
            available.len()
        );

        let mut state = self.state();
        state.handles = Some(Handles { config, context });
        state.attributes = attributes;
        state.available = available;
        state.pipeline_caps = pipeline_caps;

        Ok(())
    }

    pub fn close(&self) {
        let mut state = self.state();
        let Some(handles) = state.handles.take() else {
            return;
        };

        let device = self.display.device();
        for buffer in state.filters.drain(..) {
            if let Err(err) = device.destroy_buffer(buffer) {
                gst::warning!(CAT, "Failed to destroy filter buffer: {}", err);
            }
        }
        if let Err(err) = device.destroy_context(handles.context) {
            gst::warning!(CAT, "Failed to destroy context: {}", err);
        }
        if let Err(err) = device.destroy_config(handles.config) {
            gst::warning!(CAT, "Failed to destroy config: {}", err);
        }

        *state = State::default();
        gst::debug!(CAT, "Closed filter");
    }

    pub fn has_filter(&self, filter: FilterType) -> bool {
        self.state().available.iter().any(|(t, _)| *t == filter)
    }

    pub fn filter_caps(&self, filter: FilterType) -> Option<FilterCaps> {
        self.state()
            .available
            .iter()
            .find(|(t, _)| *t == filter)
            .map(|(_, caps)| caps.clone())
    }

    /// Range of a single valued filter.
    pub fn filter_range(&self, filter: FilterType) -> Option<FilterRange> {
        match self.filter_caps(filter)? {
            FilterCaps::Simple(range) => range,
            _ => None,
        }
    }

    pub fn color_balance_caps(&self) -> Vec<ColorBalanceCap> {
        match self.filter_caps(FilterType::ColorBalance) {
            Some(FilterCaps::ColorBalance(caps)) => caps,
            _ => Vec::new(),
        }
    }

    pub fn deinterlace_methods(&self) -> Vec<DeinterlaceMethod> {
        match self.filter_caps(FilterType::Deinterlacing) {
            Some(FilterCaps::Deinterlacing(methods)) => methods,
            _ => Vec::new(),
        }
    }

    pub fn hdr_caps(&self) -> Vec<HdrCap> {
        match self.filter_caps(FilterType::HighDynamicRangeToneMapping) {
            Some(FilterCaps::Hdr(caps)) => caps,
            _ => Vec::new(),
        }
    }

    pub fn surface_formats(&self) -> Vec<gst_video::VideoFormat> {
        self.state().attributes.formats.clone()
    }

    pub fn memory_types(&self) -> MemoryTypes {
        self.state().attributes.mem_types
    }

    pub fn size_range(&self) -> ((u32, u32), (u32, u32)) {
        let attrs = &self.state().attributes;
        (
            (attrs.min_width, attrs.min_height),
            (attrs.max_width, attrs.max_height),
        )
    }

    /// All formats with every memory feature, over the supported sizes.
    pub fn caps(&self) -> Option<gst::Caps> {
        let state = self.state();
        state.handles?;
        Some(caps_from_attributes(&state.attributes))
    }

    pub fn has_video_format(&self, format: gst_video::VideoFormat, feature: MemoryFeature) -> bool {
        let state = self.state();
        if !state.attributes.formats.contains(&format) {
            return false;
        }
        match feature {
            MemoryFeature::DmaBuf => state
                .attributes
                .mem_types
                .intersects(MemoryTypes::DRM_PRIME | MemoryTypes::DRM_PRIME_2),
            MemoryFeature::Va | MemoryFeature::System => true,
        }
    }

    pub fn has_compose(&self) -> bool {
        let state = self.state();
        if state.handles.is_none() {
            return false;
        }

        let caps = &state.pipeline_caps;
        let global_alpha = caps.blend_flags.contains(BlendFlags::GLOBAL_ALPHA);
        if !global_alpha {
            gst::warning!(CAT, "Pipeline does not support alpha blending");
        }

        let alpha_input = caps.input_formats.iter().any(|f| {
            let finfo = gst_video::VideoFormatInfo::from_format(*f);
            finfo.is_rgb() && finfo.has_alpha()
        });

        global_alpha || (!caps.blend_flags.is_empty() && alpha_input)
    }

    pub fn blend_flags(&self) -> BlendFlags {
        self.state().pipeline_caps.blend_flags
    }

    /// Sets mirroring and rotation. Orientations the device can't realize
    /// are rejected and leave the current one in place.
    pub fn set_orientation(&self, method: VideoOrientationMethod) -> bool {
        let Some((mirror, rotation)) = orientation_transform(method) else {
            return false;
        };

        let mut state = self.state();
        let caps = &state.pipeline_caps;
        if !mirror.is_empty() && !caps.mirror_flags.contains(mirror) {
            gst::debug!(CAT, "Mirroring {:?} not supported", mirror);
            return false;
        }
        if rotation != Rotation::None && caps.rotation_flags & rotation.bit() == 0 {
            gst::debug!(CAT, "Rotation {:?} not supported", rotation);
            return false;
        }

        state.orientation = method;
        state.mirror = mirror;
        state.rotation = rotation;
        true
    }

    pub fn orientation(&self) -> VideoOrientationMethod {
        self.state().orientation
    }

    pub fn set_scale_method(&self, method: ScaleMethod) {
        self.state().scale_method = method;
    }

    pub fn scale_method(&self) -> ScaleMethod {
        self.state().scale_method
    }

    pub fn enable_cropping(&self, enabled: bool) {
        self.state().crop_enabled = enabled;
    }

    pub fn set_video_info(
        &self,
        in_info: &gst_video::VideoInfo,
        out_info: &gst_video::VideoInfo,
    ) -> Result<(), VaError> {
        let mut state = self.state();
        if state.handles.is_none() {
            return Err(VaError::InvalidArgument(String::from("filter is not open")));
        }

        state.input_region = Rect::new(0, 0, in_info.width(), in_info.height());
        state.output_region = Rect::new(0, 0, out_info.width(), out_info.height());
        state.input_color = color_properties(in_info, &state.pipeline_caps.input_color_standards);
        state.output_color =
            color_properties(out_info, &state.pipeline_caps.output_color_standards);

        gst::debug!(
            CAT,
            "Colour standards {:?} -> {:?}",
            state.input_color.0,
            state.output_color.0
        );

        Ok(())
    }

    pub fn add_filter_buffer(&self, parameter: FilterParameter) -> Result<(), VaError> {
        let handles = self.handles()?;
        let filter = parameter.filter_type();
        let buffer = self
            .device()
            .create_buffer(handles.context, BufferParameter::Filter(parameter))?;

        gst::debug!(CAT, "Added filter {:?}", filter);
        self.state().filters.push(buffer);

        Ok(())
    }

    /// Queues a deinterlacing buffer and returns how many forward and
    /// backward references the method needs.
    pub fn add_deinterlace_buffer(&self, method: DeinterlaceMethod) -> Result<(u32, u32), VaError> {
        let handles = self.handles()?;
        if !self.deinterlace_methods().contains(&method) {
            return Err(VaError::Unsupported(format!("deinterlacing with {method:?}")));
        }

        self.add_filter_buffer(FilterParameter::Deinterlacing(method))?;

        let filters = self.state().filters.clone();
        let caps = self.device().query_pipeline_caps(handles.context, &filters)?;
        Ok((caps.num_forward_references, caps.num_backward_references))
    }

    pub fn drop_filter_buffers(&self) -> Result<(), VaError> {
        let mut state = self.state();
        gst::trace!(CAT, "Destroying {} filter buffers", state.filters.len());

        let mut ret = Ok(());
        for buffer in state.filters.drain(..) {
            if let Err(err) = self.display.device().destroy_buffer(buffer) {
                gst::warning!(CAT, "Failed to destroy filter buffer: {}", err);
                ret = Err(err);
            }
        }
        ret
    }

    pub fn n_filter_buffers(&self) -> usize {
        self.state().filters.len()
    }

    /// Runs `src` through the queued filters into `dst`.
    pub fn process(&self, src: &Sample, dst: &Sample) -> Result<(), VaError> {
        let (context, parameter, filters) = {
            let state = self.state();
            let handles = state
                .handles
                .ok_or_else(|| VaError::InvalidArgument(String::from("filter is not open")))?;

            let crop = src.buffer.meta::<gst_video::VideoCropMeta>();
            let surface_region = match crop {
                Some(crop) if state.crop_enabled => {
                    let (x, y, width, height) = crop.rect();
                    Rect::new(x as i32, y as i32, width, height)
                }
                _ => state.input_region,
            };

            let (bw, bh) = dst.borders;
            let output_region = Rect::new(
                (bw / 2) as i32,
                (bh / 2) as i32,
                state.output_region.width.saturating_sub(bw),
                state.output_region.height.saturating_sub(bh),
            );

            let mut parameter = PipelineParameter::new(src.surface);
            parameter.surface_region = Some(surface_region);
            parameter.surface_color_standard = state.input_color.0;
            parameter.input_color_properties = state.input_color.1;
            parameter.output_region = Some(output_region);
            parameter.output_color_standard = state.output_color.0;
            parameter.output_color_properties = state.output_color.1;
            parameter.scale_method = state.scale_method;
            parameter.filters = state.filters.clone();
            parameter.forward_references = src.forward_references.clone();
            parameter.backward_references = src.backward_references.clone();
            parameter.rotation = state.rotation;
            parameter.mirror = state.mirror;
            parameter.input_surface_flags = src.flags;
            parameter.output_surface_flags = dst.flags;

            (handles.context, parameter, state.filters.clone())
        };

        let device = self.device();
        let caps = device.query_pipeline_caps(context, &filters)?;
        gst::trace!(
            CAT,
            "Processing {} -> {} with {} filters ({} forward, {} backward references)",
            src.surface,
            dst.surface,
            filters.len(),
            caps.num_forward_references,
            caps.num_backward_references
        );

        let buffer = device.create_buffer(context, BufferParameter::Pipeline(parameter))?;
        let ret = self.submit(context, dst.surface, &[buffer]);
        if let Err(err) = device.destroy_buffer(buffer) {
            gst::warning!(CAT, "Failed to destroy pipeline buffer: {}", err);
        }
        ret
    }

    fn submit(&self, context: ContextId, target: SurfaceId, buffers: &[BufferId]) -> Result<(), VaError> {
        let device = self.device();
        device.begin_picture(context, target).inspect_err(|err| {
            gst::error!(CAT, "{}", err);
        })?;

        if let Err(err) = device.render_picture(context, buffers) {
            gst::error!(CAT, "{}", err);
            if let Err(err) = device.end_picture(context) {
                gst::error!(CAT, "{}", err);
            }
            return Err(err);
        }

        device.end_picture(context).inspect_err(|err| {
            gst::error!(CAT, "{}", err);
        })
    }

    /// Blends every sample into `output`, in order, within one picture.
    ///
    /// Only scaling, conversion and blending apply; queued filter buffers
    /// are ignored.
    pub fn compose<I>(&self, output: SurfaceId, samples: I) -> Result<(), VaError>
    where
        I: IntoIterator<Item = ComposeSample>,
    {
        let (context, scale_method, blend_flags) = {
            let state = self.state();
            let handles = state
                .handles
                .ok_or_else(|| VaError::InvalidArgument(String::from("filter is not open")))?;
            (
                handles.context,
                state.scale_method,
                state.pipeline_caps.blend_flags,
            )
        };

        let device = self.device();
        device.begin_picture(context, output).inspect_err(|err| {
            gst::error!(CAT, "{}", err);
        })?;

        let render = |parameter: PipelineParameter| {
            let buffer = device.create_buffer(context, BufferParameter::Pipeline(parameter))?;
            let ret = device.render_picture(context, &[buffer]);
            let _ = device.destroy_buffer(buffer);
            ret
        };

        // The first pipeline of a picture fills what its output region
        // leaves uncovered with the background color.
        let mut n_rendered = 0;
        let rendered = samples
            .into_iter()
            .try_for_each(|sample| {
                let mut parameter = PipelineParameter::new(sample.buffer.surface());
                parameter.surface_region = Some(sample.input_region);
                parameter.output_region = Some(sample.output_region);
                parameter.scale_method = scale_method;

                // Opaque samples don't need blending
                if blend_flags.contains(BlendFlags::GLOBAL_ALPHA) && sample.alpha < 1.0 {
                    parameter.blend_state = Some(BlendState {
                        flags: BlendFlags::GLOBAL_ALPHA,
                        global_alpha: sample.alpha as f32,
                    });
                }

                let ret = render(parameter);
                if ret.is_ok() {
                    n_rendered += 1;
                }
                drop(sample);
                ret
            })
            .and_then(|()| {
                if n_rendered > 0 {
                    return Ok(());
                }
                gst::trace!(CAT, "Nothing to compose, clearing {}", output);
                let mut parameter = PipelineParameter::new(output);
                parameter.surface_region = Some(Rect::new(0, 0, 0, 0));
                parameter.output_region = Some(Rect::new(0, 0, 0, 0));
                render(parameter)
            });

        if let Err(err) = rendered {
            gst::error!(CAT, "Composition failed: {}", err);
            if let Err(err) = device.end_picture(context) {
                gst::error!(CAT, "{}", err);
            }
            return Err(err);
        }

        device.end_picture(context).inspect_err(|err| {
            gst::error!(CAT, "{}", err);
        })
    }
}

impl Drop for Filter {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::VaVideoInfo;
    use crate::dummy::{Call, DummyConfig, DummyDevice, FailPoint};
    use crate::importer::{BufferImporter, CachedPoolProvider, ImportedBuffer};
    use crate::sample::{overlay_layers, OverlayLayer, OverlaySamples};

    fn va_info(format: gst_video::VideoFormat, width: u32, height: u32) -> VaVideoInfo {
        let caps = gst_video::VideoInfo::builder(format, width, height)
            .build()
            .unwrap()
            .to_caps()
            .unwrap();
        VaVideoInfo::from_caps(&caps).unwrap()
    }

    fn import(
        element: &gst::Element,
        display: &VaDisplay,
        info: &VaVideoInfo,
        provider: &CachedPoolProvider,
        buffer: &gst::Buffer,
    ) -> ImportedBuffer {
        BufferImporter {
            element,
            display,
            info,
            entrypoint: Entrypoint::VideoProc,
            direction: gst::PadDirection::Sink,
            provider,
        }
        .import(buffer)
        .unwrap()
    }

    // A 320x240 frame carrying a half transparent 16x16 overlay drawn at
    // (8, 8) with a size of 32x32.
    fn frame_with_overlay(info: &VaVideoInfo) -> gst::Buffer {
        let mut pixels = gst::Buffer::with_size(16 * 16 * 4).unwrap();
        gst_video::VideoMeta::add(
            pixels.get_mut().unwrap(),
            gst_video::VideoFrameFlags::empty(),
            gst_video::VideoFormat::Bgra,
            16,
            16,
        )
        .unwrap();
        let mut rect = gst_video::VideoOverlayRectangle::new_raw(
            &pixels,
            8,
            8,
            32,
            32,
            gst_video::VideoOverlayFormatFlags::empty(),
        );
        rect.get_mut().unwrap().set_global_alpha(0.5);
        let composition = gst_video::VideoOverlayComposition::new(Some(&rect)).unwrap();

        let mut frame = gst::Buffer::with_size(info.size()).unwrap();
        gst_video::VideoOverlayCompositionMeta::add(frame.get_mut().unwrap(), &composition);
        frame
    }

    fn compose_overlays(device: &DummyDevice) -> (Result<(), VaError>, SurfaceId, SurfaceId) {
        let display = VaDisplay::new(device.clone());
        let filter = Filter::new(&display);
        filter.open().unwrap();

        let element = gst::Bin::new().upcast::<gst::Element>();
        let frame_info = va_info(gst_video::VideoFormat::Nv12, 320, 240);
        let frame_pool = CachedPoolProvider::new();
        let layer_pool = CachedPoolProvider::new();
        let output_pool = CachedPoolProvider::new();

        let inbuf = frame_with_overlay(&frame_info);
        let layers = overlay_layers(&inbuf);
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].render, Rect::new(8, 8, 32, 32));

        let frame = import(&element, &display, &frame_info, &frame_pool, &inbuf);
        let frame_surface = frame.surface();

        let output = import(
            &element,
            &display,
            &frame_info,
            &output_pool,
            &gst::Buffer::with_size(frame_info.size()).unwrap(),
        );
        let target = output.surface();

        let samples = OverlaySamples::new(
            frame,
            &frame_info,
            &frame_info,
            layers,
            |layer: &OverlayLayer| {
                let info = VaVideoInfo::from_caps(&*layer.info.to_caps().ok()?).ok()?;
                Some(import(&element, &display, &info, &layer_pool, &layer.pixels))
            },
        );
        (filter.compose(target, samples), frame_surface, target)
    }

    #[test]
    fn overlays_are_blended_over_the_frame() {
        gst::init().unwrap();

        let device = DummyDevice::default();
        let (result, frame_surface, target) = compose_overlays(&device);
        result.unwrap();

        let pipelines = device.rendered_pipelines();
        assert_eq!(pipelines.len(), 2);

        assert_eq!(pipelines[0].surface, frame_surface);
        assert_eq!(pipelines[0].surface_region, Some(Rect::new(0, 0, 320, 240)));
        assert_eq!(pipelines[0].output_region, Some(Rect::new(0, 0, 320, 240)));
        assert!(pipelines[0].blend_state.is_none());

        assert_ne!(pipelines[1].surface, frame_surface);
        assert_eq!(pipelines[1].surface_region, Some(Rect::new(0, 0, 16, 16)));
        assert_eq!(pipelines[1].output_region, Some(Rect::new(8, 8, 32, 32)));
        let blend = pipelines[1].blend_state.as_ref().unwrap();
        assert_eq!(blend.flags, BlendFlags::GLOBAL_ALPHA);
        assert_eq!(blend.global_alpha, 0.5);

        let journal = device.journal();
        let begin = journal
            .iter()
            .position(|c| *c == Call::BeginPicture(target))
            .unwrap();
        let renders = journal[begin..]
            .iter()
            .take_while(|c| **c != Call::EndPicture)
            .filter(|c| matches!(c, Call::RenderPicture(_)))
            .count();
        assert_eq!(renders, 2);
        assert!(journal[begin..].contains(&Call::EndPicture));
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn failed_render_still_ends_the_picture() {
        gst::init().unwrap();

        let device = DummyDevice::default();
        // The frame renders, the overlay doesn't
        device.fail_after(FailPoint::RenderPicture, 1);
        let (result, _, target) = compose_overlays(&device);
        assert!(result.is_err());

        assert_eq!(device.rendered_pipelines().len(), 1);
        let journal = device.journal();
        let begin = journal
            .iter()
            .position(|c| *c == Call::BeginPicture(target))
            .unwrap();
        assert!(journal[begin..].contains(&Call::EndPicture));
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn orientation_needs_device_support() {
        gst::init().unwrap();

        let device = DummyDevice::new(DummyConfig {
            mirror_flags: MirrorFlags::HORIZONTAL,
            rotation_flags: Rotation::None.bit() | Rotation::R90.bit(),
            ..Default::default()
        });
        let filter = Filter::new(&VaDisplay::new(device));
        filter.open().unwrap();

        assert!(filter.set_orientation(VideoOrientationMethod::UlLr));
        assert_eq!(filter.orientation(), VideoOrientationMethod::UlLr);

        assert!(!filter.set_orientation(VideoOrientationMethod::Vert));
        assert!(!filter.set_orientation(VideoOrientationMethod::_180));
        assert!(!filter.set_orientation(VideoOrientationMethod::Auto));
        assert_eq!(filter.orientation(), VideoOrientationMethod::UlLr);

        assert!(filter.set_orientation(VideoOrientationMethod::Identity));
    }

    #[test]
    fn orientation_table() {
        assert_eq!(
            orientation_transform(VideoOrientationMethod::UrLl),
            Some((MirrorFlags::VERTICAL, Rotation::R90))
        );
        assert_eq!(
            orientation_transform(VideoOrientationMethod::_90l),
            Some((MirrorFlags::empty(), Rotation::R270))
        );
        assert!(orientation_swaps_dimensions(VideoOrientationMethod::UlLr));
        assert!(!orientation_swaps_dimensions(VideoOrientationMethod::_180));
    }

    #[test]
    fn open_and_close_release_everything() {
        gst::init().unwrap();

        let device = DummyDevice::default();
        let filter = Filter::new(&VaDisplay::new(device.clone()));
        filter.open().unwrap();
        assert!(filter.has_filter(FilterType::Sharpening));
        assert!(filter.has_compose());
        assert_eq!(device.live_contexts(), 1);

        filter
            .add_filter_buffer(FilterParameter::Sharpening(10.0))
            .unwrap();
        let (forward, backward) = filter
            .add_deinterlace_buffer(DeinterlaceMethod::MotionCompensated)
            .unwrap();
        assert_eq!((forward, backward), (1, 1));
        assert_eq!(device.live_buffers(), 2);

        drop(filter);
        assert_eq!(device.live_contexts(), 0);
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn unsupported_deinterlace_method() {
        gst::init().unwrap();

        let filter = Filter::new(&VaDisplay::new(DummyDevice::default()));
        filter.open().unwrap();
        assert!(matches!(
            filter.add_deinterlace_buffer(DeinterlaceMethod::Weave),
            Err(VaError::Unsupported(_))
        ));
        assert_eq!(filter.n_filter_buffers(), 0);
    }
}
