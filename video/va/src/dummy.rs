// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! A software [`Device`] with no hardware behind it.
//!
//! Surfaces only exist as ids, processing calls are validated and recorded.
//! It is used by the tests and for bringing up pipelines on machines without
//! a VA driver.

use std::collections::{HashMap, HashSet};
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex};

use crate::device::*;
use crate::error::VaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    CreateSurface,
    ImportDmabuf,
    CreateContext,
    CreateBuffer,
    BeginPicture,
    RenderPicture,
    EndPicture,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CreateSurface(SurfaceId),
    DestroySurface(SurfaceId),
    ImportDmabuf(SurfaceId, DmabufDescriptor),
    CreateBuffer(BufferId, BufferParameter),
    DestroyBuffer(BufferId),
    BeginPicture(SurfaceId),
    RenderPicture(Vec<BufferId>),
    EndPicture,
}

#[derive(Debug, Clone)]
pub struct DummyConfig {
    pub vendor: String,
    pub formats: Vec<gst_video::VideoFormat>,
    pub min_width: u32,
    pub min_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub mem_types: MemoryTypes,
    /// Row alignment of surface planes, in bytes.
    pub stride_align: u32,
    pub filters: Vec<(FilterType, FilterCaps)>,
    pub deinterlace_references: Vec<(DeinterlaceMethod, u32, u32)>,
    pub rotation_flags: u32,
    pub mirror_flags: MirrorFlags,
    pub blend_flags: BlendFlags,
    pub color_standards: Vec<ColorStandard>,
}

impl Default for DummyConfig {
    fn default() -> Self {
        use gst_video::VideoFormat;

        let range = |min: f32, max: f32, default: f32| FilterRange {
            min,
            max,
            default,
            step: 1.0,
        };

        DummyConfig {
            vendor: String::from("Dummy VA driver"),
            formats: vec![
                VideoFormat::Nv12,
                VideoFormat::I420,
                VideoFormat::Yv12,
                VideoFormat::Yuy2,
                VideoFormat::P01010le,
                VideoFormat::Rgba,
                VideoFormat::Bgra,
                VideoFormat::Rgbx,
                VideoFormat::Bgrx,
            ],
            min_width: 16,
            min_height: 16,
            max_width: 4096,
            max_height: 4096,
            mem_types: MemoryTypes::VA | MemoryTypes::DRM_PRIME | MemoryTypes::DRM_PRIME_2,
            stride_align: 4,
            filters: vec![
                (
                    FilterType::NoiseReduction,
                    FilterCaps::Simple(Some(range(0.0, 64.0, 0.0))),
                ),
                (
                    FilterType::Sharpening,
                    FilterCaps::Simple(Some(range(0.0, 64.0, 44.0))),
                ),
                (
                    FilterType::SkinToneEnhancement,
                    FilterCaps::Simple(Some(range(0.0, 9.0, 0.0))),
                ),
                (
                    FilterType::ColorBalance,
                    FilterCaps::ColorBalance(vec![
                        ColorBalanceCap {
                            kind: ColorBalanceKind::Hue,
                            range: range(-180.0, 180.0, 0.0),
                        },
                        ColorBalanceCap {
                            kind: ColorBalanceKind::Saturation,
                            range: range(0.0, 10.0, 1.0),
                        },
                        ColorBalanceCap {
                            kind: ColorBalanceKind::Brightness,
                            range: range(-100.0, 100.0, 0.0),
                        },
                        ColorBalanceCap {
                            kind: ColorBalanceKind::Contrast,
                            range: range(0.0, 10.0, 1.0),
                        },
                    ]),
                ),
                (
                    FilterType::Deinterlacing,
                    FilterCaps::Deinterlacing(vec![
                        DeinterlaceMethod::Bob,
                        DeinterlaceMethod::MotionAdaptive,
                        DeinterlaceMethod::MotionCompensated,
                    ]),
                ),
                (
                    FilterType::HighDynamicRangeToneMapping,
                    FilterCaps::Hdr(vec![HdrCap {
                        hdr10: true,
                        flags: ToneMappingFlags::HDR_TO_SDR,
                    }]),
                ),
            ],
            deinterlace_references: vec![
                (DeinterlaceMethod::Bob, 0, 0),
                (DeinterlaceMethod::Weave, 0, 0),
                (DeinterlaceMethod::MotionAdaptive, 1, 0),
                (DeinterlaceMethod::MotionCompensated, 1, 1),
            ],
            rotation_flags: Rotation::None.bit()
                | Rotation::R90.bit()
                | Rotation::R180.bit()
                | Rotation::R270.bit(),
            mirror_flags: MirrorFlags::HORIZONTAL | MirrorFlags::VERTICAL,
            blend_flags: BlendFlags::GLOBAL_ALPHA,
            color_standards: vec![
                ColorStandard::Bt601,
                ColorStandard::Bt709,
                ColorStandard::Bt2020,
                ColorStandard::Srgb,
            ],
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SurfaceRecord {
    format: gst_video::VideoFormat,
    width: u32,
    height: u32,
}

#[derive(Default)]
struct State {
    next_id: u32,
    configs: HashSet<ConfigId>,
    contexts: HashMap<ContextId, Option<SurfaceId>>,
    surfaces: HashMap<SurfaceId, SurfaceRecord>,
    buffers: HashSet<BufferId>,
    parameters: HashMap<BufferId, BufferParameter>,
    journal: Vec<Call>,
    failures: HashMap<FailPoint, usize>,
}

impl State {
    fn next(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn check(&mut self, point: FailPoint, call: &'static str) -> Result<(), VaError> {
        match self.failures.get_mut(&point) {
            Some(0) => Err(VaError::status(call, "operation failed")),
            Some(remaining) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

struct Inner {
    config: DummyConfig,
    state: Mutex<State>,
}

/// Clones share the same device state, so a test can keep one to look at
/// what happened after handing another to a display.
#[derive(Clone)]
pub struct DummyDevice(Arc<Inner>);

impl Default for DummyDevice {
    fn default() -> Self {
        DummyDevice::new(DummyConfig::default())
    }
}

impl DummyDevice {
    pub fn new(config: DummyConfig) -> Self {
        DummyDevice(Arc::new(Inner {
            config,
            state: Mutex::new(State::default()),
        }))
    }

    pub fn config(&self) -> &DummyConfig {
        &self.0.config
    }

    /// Let `point` succeed `after` more times, then fail until cleared.
    pub fn fail_after(&self, point: FailPoint, after: usize) {
        self.0.state.lock().unwrap().failures.insert(point, after);
    }

    pub fn clear_failures(&self) {
        self.0.state.lock().unwrap().failures.clear();
    }

    pub fn journal(&self) -> Vec<Call> {
        self.0.state.lock().unwrap().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.0.state.lock().unwrap().journal.clear();
    }

    /// Parameters of every buffer handed to `render_picture`, in order.
    pub fn rendered(&self) -> Vec<BufferParameter> {
        let state = self.0.state.lock().unwrap();
        state
            .journal
            .iter()
            .filter_map(|call| match call {
                Call::RenderPicture(ids) => Some(ids),
                _ => None,
            })
            .flatten()
            .filter_map(|id| state.parameters.get(id).cloned())
            .collect()
    }

    pub fn rendered_pipelines(&self) -> Vec<PipelineParameter> {
        self.rendered()
            .into_iter()
            .filter_map(|p| match p {
                BufferParameter::Pipeline(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    pub fn live_surfaces(&self) -> usize {
        self.0.state.lock().unwrap().surfaces.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.0.state.lock().unwrap().buffers.len()
    }

    pub fn live_contexts(&self) -> usize {
        self.0.state.lock().unwrap().contexts.len()
    }

    pub fn imports(&self) -> usize {
        self.0
            .state
            .lock()
            .unwrap()
            .journal
            .iter()
            .filter(|c| matches!(c, Call::ImportDmabuf(..)))
            .count()
    }

    fn layout(&self, format: gst_video::VideoFormat, width: u32, height: u32) -> Result<SurfaceLayout, VaError> {
        let finfo = gst_video::VideoFormatInfo::from_format(format);
        if finfo.is_complex() || format == gst_video::VideoFormat::Unknown {
            return Err(VaError::Unsupported(format!("surface format {format:?}")));
        }

        let align = self.0.config.stride_align.max(1) as usize;
        let mut layout = SurfaceLayout::default();
        for plane in 0..finfo.n_planes() {
            let comp = finfo
                .plane()
                .iter()
                .position(|&p| p == plane)
                .ok_or_else(|| VaError::InvalidArgument(format!("no component in plane {plane}")))?;
            let comp = comp as u8;
            let row = finfo.scale_width(comp, width) as usize
                * finfo.pixel_stride()[comp as usize] as usize;
            let stride = row.div_ceil(align) * align;
            let rows = finfo.scale_height(comp, height) as usize;

            layout.offsets.push(layout.size);
            layout.strides.push(stride as i32);
            layout.size += stride * rows;
        }

        Ok(layout)
    }
}

impl Device for DummyDevice {
    fn vendor(&self) -> &str {
        &self.0.config.vendor
    }

    fn config_attributes(
        &self,
        _profile: Profile,
        entrypoint: Entrypoint,
    ) -> Result<ConfigAttributes, VaError> {
        if entrypoint != Entrypoint::VideoProc {
            return Err(VaError::Unsupported(format!("entrypoint {entrypoint:?}")));
        }

        Ok(ConfigAttributes {
            rt_formats: Some(RtFormat::YUV420 | RtFormat::YUV422 | RtFormat::RGB32),
            max_width: Some(self.0.config.max_width),
            max_height: Some(self.0.config.max_height),
        })
    }

    fn create_config(
        &self,
        _profile: Profile,
        _entrypoint: Entrypoint,
        _rt_format: RtFormat,
    ) -> Result<ConfigId, VaError> {
        let mut state = self.0.state.lock().unwrap();
        let id = ConfigId(state.next());
        state.configs.insert(id);
        Ok(id)
    }

    fn destroy_config(&self, config: ConfigId) -> Result<(), VaError> {
        let mut state = self.0.state.lock().unwrap();
        if !state.configs.remove(&config) {
            return Err(VaError::status("vaDestroyConfig", "invalid config"));
        }
        Ok(())
    }

    fn surface_attributes(&self, config: ConfigId) -> Result<SurfaceAttributes, VaError> {
        if !self.0.state.lock().unwrap().configs.contains(&config) {
            return Err(VaError::status("vaQuerySurfaceAttributes", "invalid config"));
        }

        let c = &self.0.config;
        Ok(SurfaceAttributes {
            formats: c.formats.clone(),
            min_width: c.min_width,
            min_height: c.min_height,
            max_width: c.max_width,
            max_height: c.max_height,
            mem_types: c.mem_types,
        })
    }

    fn create_context(
        &self,
        config: ConfigId,
        _width: u32,
        _height: u32,
    ) -> Result<ContextId, VaError> {
        let mut state = self.0.state.lock().unwrap();
        state.check(FailPoint::CreateContext, "vaCreateContext")?;
        if !state.configs.contains(&config) {
            return Err(VaError::status("vaCreateContext", "invalid config"));
        }
        let id = ContextId(state.next());
        state.contexts.insert(id, None);
        Ok(id)
    }

    fn destroy_context(&self, context: ContextId) -> Result<(), VaError> {
        let mut state = self.0.state.lock().unwrap();
        if state.contexts.remove(&context).is_none() {
            return Err(VaError::status("vaDestroyContext", "invalid context"));
        }
        Ok(())
    }

    fn create_surface(
        &self,
        format: gst_video::VideoFormat,
        width: u32,
        height: u32,
        _usage: UsageHint,
    ) -> Result<SurfaceId, VaError> {
        let c = &self.0.config;
        if !c.formats.contains(&format) {
            return Err(VaError::Unsupported(format!("surface format {format:?}")));
        }
        if width < c.min_width || height < c.min_height || width > c.max_width || height > c.max_height {
            return Err(VaError::InvalidArgument(format!("surface size {width}x{height}")));
        }

        let mut state = self.0.state.lock().unwrap();
        state.check(FailPoint::CreateSurface, "vaCreateSurfaces")?;
        let id = SurfaceId(state.next());
        state.surfaces.insert(
            id,
            SurfaceRecord {
                format,
                width,
                height,
            },
        );
        state.journal.push(Call::CreateSurface(id));
        Ok(id)
    }

    fn destroy_surface(&self, surface: SurfaceId) -> Result<(), VaError> {
        let mut state = self.0.state.lock().unwrap();
        if state.surfaces.remove(&surface).is_none() {
            return Err(VaError::status("vaDestroySurfaces", "invalid surface"));
        }
        state.journal.push(Call::DestroySurface(surface));
        Ok(())
    }

    fn surface_layout(
        &self,
        format: gst_video::VideoFormat,
        width: u32,
        height: u32,
    ) -> Result<SurfaceLayout, VaError> {
        self.layout(format, width, height)
    }

    fn import_dmabuf(
        &self,
        descriptor: &DmabufDescriptor,
        _usage: UsageHint,
    ) -> Result<SurfaceId, VaError> {
        if descriptor.planes.is_empty() || descriptor.planes.iter().any(|p| p.fd < 0) {
            return Err(VaError::InvalidArgument(String::from("bad DMA-buf planes")));
        }
        if !self.0.config.mem_types.contains(MemoryTypes::DRM_PRIME_2) {
            return Err(VaError::Unsupported(String::from("DRM PRIME import")));
        }

        let mut state = self.0.state.lock().unwrap();
        state.check(FailPoint::ImportDmabuf, "vaCreateSurfaces")?;
        let id = SurfaceId(state.next());
        state.surfaces.insert(
            id,
            SurfaceRecord {
                format: descriptor.format,
                width: descriptor.width,
                height: descriptor.height,
            },
        );
        state.journal.push(Call::ImportDmabuf(id, descriptor.clone()));
        Ok(id)
    }

    fn export_dmabuf(&self, surface: SurfaceId) -> Result<ExportedSurface, VaError> {
        let record = self
            .0
            .state
            .lock()
            .unwrap()
            .surfaces
            .get(&surface)
            .copied()
            .ok_or_else(|| VaError::status("vaExportSurfaceHandle", "invalid surface"))?;

        let layout = self.layout(record.format, record.width, record.height)?;
        let file = tempfile::tempfile()
            .map_err(|err| VaError::status("vaExportSurfaceHandle", err.to_string()))?;
        file.set_len(layout.size as u64)
            .map_err(|err| VaError::status("vaExportSurfaceHandle", err.to_string()))?;

        Ok(ExportedSurface {
            objects: vec![ExportedObject {
                fd: OwnedFd::from(file),
                size: layout.size,
            }],
            planes: layout
                .offsets
                .iter()
                .zip(layout.strides.iter())
                .map(|(&offset, &stride)| (0, offset, stride))
                .collect(),
            modifier: 0,
        })
    }

    fn sync_surface(&self, surface: SurfaceId) -> Result<(), VaError> {
        if !self.0.state.lock().unwrap().surfaces.contains_key(&surface) {
            return Err(VaError::status("vaSyncSurface", "invalid surface"));
        }
        Ok(())
    }

    fn query_filters(&self, context: ContextId) -> Result<Vec<FilterType>, VaError> {
        if !self.0.state.lock().unwrap().contexts.contains_key(&context) {
            return Err(VaError::status("vaQueryVideoProcFilters", "invalid context"));
        }
        Ok(self.0.config.filters.iter().map(|(t, _)| *t).collect())
    }

    fn query_filter_caps(
        &self,
        _context: ContextId,
        filter: FilterType,
    ) -> Result<FilterCaps, VaError> {
        self.0
            .config
            .filters
            .iter()
            .find(|(t, _)| *t == filter)
            .map(|(_, caps)| caps.clone())
            .ok_or_else(|| VaError::Unsupported(format!("filter {filter:?}")))
    }

    fn query_pipeline_caps(
        &self,
        _context: ContextId,
        filters: &[BufferId],
    ) -> Result<PipelineCaps, VaError> {
        let state = self.0.state.lock().unwrap();
        let c = &self.0.config;

        let mut caps = PipelineCaps {
            rotation_flags: c.rotation_flags,
            mirror_flags: c.mirror_flags,
            blend_flags: c.blend_flags,
            input_formats: c.formats.clone(),
            input_color_standards: c.color_standards.clone(),
            output_color_standards: c.color_standards.clone(),
            ..Default::default()
        };

        for id in filters {
            if !state.buffers.contains(id) {
                return Err(VaError::status(
                    "vaQueryVideoProcPipelineCaps",
                    "invalid buffer",
                ));
            }
            if let Some(BufferParameter::Filter(FilterParameter::Deinterlacing(method))) =
                state.parameters.get(id)
            {
                if let Some(&(_, forward, backward)) = c
                    .deinterlace_references
                    .iter()
                    .find(|(m, _, _)| m == method)
                {
                    caps.num_forward_references = forward;
                    caps.num_backward_references = backward;
                }
            }
        }

        Ok(caps)
    }

    fn create_buffer(
        &self,
        context: ContextId,
        parameter: BufferParameter,
    ) -> Result<BufferId, VaError> {
        let mut state = self.0.state.lock().unwrap();
        state.check(FailPoint::CreateBuffer, "vaCreateBuffer")?;
        if !state.contexts.contains_key(&context) {
            return Err(VaError::status("vaCreateBuffer", "invalid context"));
        }
        if let BufferParameter::Pipeline(ref p) = parameter {
            if !state.surfaces.contains_key(&p.surface) {
                return Err(VaError::status("vaCreateBuffer", "invalid surface"));
            }
        }

        let id = BufferId(state.next());
        state.buffers.insert(id);
        state.parameters.insert(id, parameter.clone());
        state.journal.push(Call::CreateBuffer(id, parameter));
        Ok(id)
    }

    fn destroy_buffer(&self, buffer: BufferId) -> Result<(), VaError> {
        let mut state = self.0.state.lock().unwrap();
        if !state.buffers.remove(&buffer) {
            return Err(VaError::status("vaDestroyBuffer", "invalid buffer"));
        }
        state.journal.push(Call::DestroyBuffer(buffer));
        Ok(())
    }

    fn begin_picture(&self, context: ContextId, target: SurfaceId) -> Result<(), VaError> {
        let mut state = self.0.state.lock().unwrap();
        state.check(FailPoint::BeginPicture, "vaBeginPicture")?;
        if !state.surfaces.contains_key(&target) {
            return Err(VaError::status("vaBeginPicture", "invalid surface"));
        }
        let current = state
            .contexts
            .get_mut(&context)
            .ok_or_else(|| VaError::status("vaBeginPicture", "invalid context"))?;
        if current.is_some() {
            return Err(VaError::status("vaBeginPicture", "picture in progress"));
        }
        *current = Some(target);
        state.journal.push(Call::BeginPicture(target));
        Ok(())
    }

    fn render_picture(&self, context: ContextId, buffers: &[BufferId]) -> Result<(), VaError> {
        let mut state = self.0.state.lock().unwrap();
        state.check(FailPoint::RenderPicture, "vaRenderPicture")?;
        if !matches!(state.contexts.get(&context), Some(Some(_))) {
            return Err(VaError::status("vaRenderPicture", "no picture in progress"));
        }
        if buffers.iter().any(|id| !state.buffers.contains(id)) {
            return Err(VaError::status("vaRenderPicture", "invalid buffer"));
        }
        state.journal.push(Call::RenderPicture(buffers.to_vec()));
        Ok(())
    }

    fn end_picture(&self, context: ContextId) -> Result<(), VaError> {
        let mut state = self.0.state.lock().unwrap();
        let in_progress = match state.contexts.get_mut(&context) {
            Some(current) => current.take().is_some(),
            None => return Err(VaError::status("vaEndPicture", "invalid context")),
        };
        state.check(FailPoint::EndPicture, "vaEndPicture")?;
        if !in_progress {
            return Err(VaError::status("vaEndPicture", "no picture in progress"));
        }
        state.journal.push(Call::EndPicture);
        Ok(())
    }
}
