// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! Allocation queries: which pool a VA element writes into, what it offers
//! upstream, and when frames must be copied on the way out.

use gst::glib;
use gst::prelude::*;
use gst_video::prelude::*;
use std::sync::LazyLock;

use crate::allocator::{allocator_display, AllocatorKind, VaAllocator};
use crate::caps::{caps_is_dmabuf, caps_is_raw, VaVideoInfo};
use crate::device::{Entrypoint, UsageHint};
use crate::display::VaDisplay;
use crate::importer::PoolProvider;
use crate::pool::VaPool;

static CAT: LazyLock<gst::DebugCategory> = LazyLock::new(|| {
    gst::DebugCategory::new(
        "vanegotiation",
        gst::DebugColorFlags::empty(),
        Some("VA allocation negotiation"),
    )
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerKind {
    Decoder,
    Transform,
    Compositor,
    Encoder,
}

impl ConsumerKind {
    fn entrypoint(self) -> Entrypoint {
        match self {
            ConsumerKind::Decoder => Entrypoint::Vld,
            ConsumerKind::Transform | ConsumerKind::Compositor => Entrypoint::VideoProc,
            ConsumerKind::Encoder => Entrypoint::EncSlice,
        }
    }

    /// Usage of the surfaces this kind of element writes to.
    pub fn output_usage(self, is_dma: bool) -> UsageHint {
        let direction = match self {
            ConsumerKind::Encoder => gst::PadDirection::Sink,
            _ => gst::PadDirection::Src,
        };
        UsageHint::for_entrypoint(self.entrypoint(), direction, is_dma)
    }
}

/// Element specific inputs to [`Negotiator::decide_allocation`].
#[derive(Debug, Clone, Default)]
pub struct AllocationRequest {
    /// Buffers the element keeps for itself, like a decoder's DPB.
    pub min_buffers: u32,
    pub alignment: Option<gst_video::VideoAlignment>,
    /// Size of the decoded surfaces when it differs from the output size.
    pub coded_size: Option<(u32, u32)>,
    /// Top left corner of the visible area in the decoded surfaces.
    pub crop_offset: (u32, u32),
    pub force_crop_copy: bool,
    /// Surface formats for newly created allocators. Empty means any.
    pub surface_formats: Vec<gst_video::VideoFormat>,
}

/// Outcome of a successful negotiation.
#[derive(Debug, Clone)]
pub struct Negotiated {
    /// Pool the device writes into.
    pub pool: VaPool,
    /// Pool frames are copied into before being pushed, if any.
    pub other_pool: Option<gst::BufferPool>,
    /// Output needs a copy into `other_pool`.
    pub copy_frames: bool,
    /// `copy_frames` because of a crop downstream can't apply.
    pub crop_copy: bool,
    pub info: VaVideoInfo,
    /// Video info of the surfaces, larger than `info` when cropping.
    pub coded_info: VaVideoInfo,
    /// Top left corner of the visible area in the surfaces.
    pub crop_offset: (u32, u32),
    pub size: u32,
    pub min: u32,
    pub max: u32,
}

impl Negotiated {
    /// A buffer of the pool the device writes into.
    pub fn acquire_surface_buffer(&self) -> Result<gst::Buffer, gst::FlowError> {
        if !self.pool.is_active() {
            self.pool.set_active(true).map_err(|err| {
                gst::error!(CAT, obj = &self.pool, "Failed to activate: {}", err);
                gst::FlowError::Error
            })?;
        }
        self.pool.acquire_buffer(None)
    }

    /// The buffer to push for `buffer`, copied into the downstream pool
    /// when frames have to be copied.
    pub fn output_buffer(&self, buffer: gst::Buffer) -> Result<gst::Buffer, gst::FlowError> {
        let Some(other) = self.other_pool.as_ref().filter(|_| self.copy_frames) else {
            return Ok(buffer);
        };

        if !other.is_active() {
            other.set_active(true).map_err(|err| {
                gst::error!(CAT, obj = other, "Failed to activate: {}", err);
                gst::FlowError::Error
            })?;
        }
        let mut out = other.acquire_buffer(None)?;
        {
            let outref = out.get_mut().ok_or(gst::FlowError::Error)?;
            let src =
                gst_video::VideoFrameRef::from_buffer_ref_readable(buffer.as_ref(), &self.coded_info)
                    .map_err(|_| gst::FlowError::Error)?;
            let mut dst = gst_video::VideoFrameRef::from_buffer_ref_writable(outref, &self.info)
                .map_err(|_| gst::FlowError::Error)?;
            let res = if self.crop_copy {
                copy_cropped(&src, &mut dst, self.crop_offset)
            } else {
                src.copy(&mut dst)
            };
            res.map_err(|err| {
                gst::error!(CAT, "Failed to copy frame: {}", err);
                gst::FlowError::Error
            })?;
        }
        {
            let outref = out.get_mut().ok_or(gst::FlowError::Error)?;
            outref.set_pts(buffer.pts());
            outref.set_dts(buffer.dts());
            outref.set_duration(buffer.duration());
            outref.set_flags(buffer.flags());
        }

        gst::trace!(CAT, "Copied frame {:?} out of its surface", buffer.pts());
        Ok(out)
    }
}

/// Copies the `dst` sized area at `offset` of `src` into `dst`.
fn copy_cropped(
    src: &gst_video::VideoFrameRef<&gst::BufferRef>,
    dst: &mut gst_video::VideoFrameRef<&mut gst::BufferRef>,
    offset: (u32, u32),
) -> Result<(), glib::BoolError> {
    let finfo = dst.format_info();
    if src.format() != dst.format()
        || src.width() < dst.width() + offset.0
        || src.height() < dst.height() + offset.1
    {
        return Err(glib::bool_error!("Crop area outside of the source frame"));
    }

    for plane in 0..dst.n_planes() {
        let comp = finfo
            .plane()
            .iter()
            .position(|&p| p == plane)
            .ok_or_else(|| glib::bool_error!("No component in plane {}", plane))?
            as u8;
        let pixel_stride = finfo.pixel_stride()[comp as usize].unsigned_abs() as usize;
        let row_bytes = finfo.scale_width(comp, dst.width()) as usize * pixel_stride;
        let rows = finfo.scale_height(comp, dst.height()) as usize;
        let x = finfo.scale_width(comp, offset.0) as usize * pixel_stride;
        let y = finfo.scale_height(comp, offset.1) as usize;

        let src_stride = src.plane_stride()[plane as usize] as usize;
        let dst_stride = dst.plane_stride()[plane as usize] as usize;
        let src_data = src.plane_data(plane)?;
        let dst_data = dst.plane_data_mut(plane)?;

        for row in 0..rows {
            let s = (y + row) * src_stride + x;
            let d = row * dst_stride;
            let (Some(from), Some(to)) = (
                src_data.get(s..s + row_bytes),
                dst_data.get_mut(d..d + row_bytes),
            ) else {
                return Err(glib::bool_error!("Plane {} too small", plane));
            };
            to.copy_from_slice(from);
        }
    }

    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
struct CacheKey {
    caps: gst::Caps,
    allocator: Option<gst::Allocator>,
    alignment: Option<(u32, u32, u32, u32)>,
    crop: bool,
    video_meta: bool,
    min_buffers: u32,
}

/// Per element allocation state.
#[derive(Debug)]
pub struct Negotiator {
    kind: ConsumerKind,
    cached: Option<(CacheKey, Negotiated)>,
}

fn failed_config(err: impl std::fmt::Display) -> gst::LoggableError {
    gst::loggable_error!(CAT, "failed to set config: {}", err)
}

fn alignment_key(alignment: &gst_video::VideoAlignment) -> (u32, u32, u32, u32) {
    (
        alignment.padding_top(),
        alignment.padding_bottom(),
        alignment.padding_left(),
        alignment.padding_right(),
    )
}

fn configure_video_pool(
    pool: &gst::BufferPool,
    caps: &gst::Caps,
    size: u32,
    min: u32,
    max: u32,
    allocator: Option<&(gst::Allocator, gst::AllocationParams)>,
    video_meta: bool,
) -> Result<(), gst::LoggableError> {
    let mut config = pool.config();
    config.set_params(Some(caps), size, min, max);
    if let Some((allocator, params)) = allocator {
        config.set_allocator(Some(allocator), Some(params));
    }
    if video_meta {
        config.add_option(&gst_video::BUFFER_POOL_OPTION_VIDEO_META);
    }
    pool.set_config(config).map_err(failed_config)
}

fn new_video_pool(
    caps: &gst::Caps,
    size: u32,
    min: u32,
    max: u32,
    allocator: Option<&(gst::Allocator, gst::AllocationParams)>,
    video_meta: bool,
) -> Result<gst::BufferPool, gst::LoggableError> {
    let pool = gst_video::VideoBufferPool::new().upcast::<gst::BufferPool>();
    configure_video_pool(&pool, caps, size, min, max, allocator, video_meta)?;
    Ok(pool)
}

impl Negotiator {
    pub fn new(kind: ConsumerKind) -> Self {
        Negotiator { kind, cached: None }
    }

    pub fn kind(&self) -> ConsumerKind {
        self.kind
    }

    pub fn negotiated(&self) -> Option<&Negotiated> {
        self.cached.as_ref().map(|(_, n)| n)
    }

    pub fn reset(&mut self) {
        if let Some((_, negotiated)) = self.cached.take() {
            if let Some(other) = negotiated.other_pool {
                let _ = other.set_active(false);
            }
        }
    }

    /// Picks the pool the element writes into and places it in `query`.
    pub fn decide_allocation(
        &mut self,
        display: &VaDisplay,
        query: &mut gst::query::Allocation,
        request: &AllocationRequest,
    ) -> Result<Negotiated, gst::LoggableError> {
        let (caps, _) = query.get();
        let caps = caps
            .ok_or_else(|| gst::loggable_error!(CAT, "No caps in allocation query"))?
            .to_owned();
        let info = VaVideoInfo::from_caps(&caps)
            .map_err(|err| gst::loggable_error!(CAT, "Invalid caps {}: {}", caps, err))?;

        let is_dma = caps_is_dmabuf(&caps);
        let has_videometa = query
            .find_allocation_meta::<gst_video::VideoMeta>()
            .is_some();
        let has_cropmeta = query
            .find_allocation_meta::<gst_video::VideoCropMeta>()
            .is_some();

        // Allocator from the query
        let mut allocator = None;
        let mut other_allocator = None;
        let mut dont_use_other_pool = false;
        let query_allocator = query.allocation_params().into_iter().next();
        let update_allocator = query_allocator.is_some();
        let query_allocator_obj = query_allocator.as_ref().and_then(|(a, _)| a.clone());
        if let Some((Some(a), params)) = query_allocator {
            match allocator_display(&a) {
                Some(d) if d == *display => {
                    allocator = a.downcast::<VaAllocator>().ok();
                }
                Some(_) => {
                    gst::debug!(CAT, "Discarding allocator of another display");
                    dont_use_other_pool = true;
                }
                None => other_allocator = Some((a, params)),
            }
        }

        // Pool from the query
        let mut pool = None;
        let mut other_pool = None;
        let query_pool = query.allocation_pools().into_iter().next();
        let update_pool = query_pool.is_some();
        let (mut size, mut min, max) = match query_pool {
            Some((p, size, min, max)) => {
                match p {
                    Some(p) => match p.downcast::<VaPool>() {
                        Ok(va) if va.display().map_or(true, |d| d == *display) => pool = Some(va),
                        Ok(_) => dont_use_other_pool = true,
                        Err(p) if !dont_use_other_pool => other_pool = Some(p),
                        Err(_) => (),
                    },
                    None => (),
                }
                (size, min, max)
            }
            None => (0, 0, 0),
        };

        match self.kind {
            ConsumerKind::Decoder => {
                min += request.min_buffers;
            }
            _ => {
                min = min.max(1) + request.min_buffers;
            }
        }
        size = size.max(info.size() as u32);

        let need_crop = request.crop_offset.0 > 0 || request.crop_offset.1 > 0;
        let crop_copy = self.kind == ConsumerKind::Decoder
            && need_crop
            && !has_cropmeta
            && (!is_dma || request.force_crop_copy);

        let key = CacheKey {
            caps: caps.clone(),
            allocator: query_allocator_obj,
            alignment: request.alignment.as_ref().map(alignment_key),
            crop: crop_copy,
            video_meta: has_videometa,
            min_buffers: request.min_buffers,
        };

        if let Some((cached_key, cached)) = self.cached.as_mut() {
            if *cached_key == key {
                gst::debug!(CAT, "Reusing pools for {}", caps);
                if let Some(other) = other_pool.filter(|_| !cached.crop_copy) {
                    if cached.copy_frames {
                        configure_video_pool(
                            &other,
                            &caps,
                            cached.info.size() as u32,
                            cached.min,
                            cached.max,
                            other_allocator.as_ref(),
                            false,
                        )?;
                    }
                    if let Some(old) = cached.other_pool.replace(other.clone()) {
                        if old != other {
                            let _ = old.set_active(false);
                        }
                    }
                }
                let negotiated = cached.clone();
                Self::fill_query(query, &negotiated, update_pool, update_allocator);
                return Ok(negotiated);
            }
        }

        let usage = self.kind.output_usage(is_dma);
        let allocator = match allocator {
            Some(allocator) => allocator,
            None => VaAllocator::new(
                display,
                AllocatorKind::for_caps(&caps),
                &request.surface_formats,
            ),
        };
        let pool = pool.unwrap_or_else(VaPool::new);

        let negotiated = if crop_copy {
            // Decode into surfaces of the coded size, copy the visible area
            // into a pool of the output size.
            let (coded_width, coded_height) = request
                .coded_size
                .unwrap_or((info.width() + request.crop_offset.0, info.height() + request.crop_offset.1));
            let mut coded_caps = caps.clone();
            coded_caps
                .make_mut()
                .set("width", coded_width as i32);
            coded_caps
                .make_mut()
                .set("height", coded_height as i32);
            let coded_info = VaVideoInfo::from_caps(&coded_caps)
                .map_err(|err| gst::loggable_error!(CAT, "Invalid coded caps: {}", err))?;

            pool.configure(
                &coded_caps,
                coded_info.size() as u32,
                min,
                max,
                &allocator,
                usage,
                request.alignment.as_ref(),
                true,
            )
            .map_err(failed_config)?;

            let other = match other_pool {
                Some(other) => {
                    configure_video_pool(
                        &other,
                        &caps,
                        size,
                        min,
                        max,
                        other_allocator.as_ref(),
                        has_videometa,
                    )?;
                    other
                }
                None => new_video_pool(
                    &caps,
                    size,
                    min,
                    max,
                    other_allocator.as_ref(),
                    has_videometa,
                )?,
            };

            gst::debug!(CAT, "Cropping {} by copy", caps);

            Negotiated {
                pool,
                other_pool: Some(other),
                copy_frames: true,
                crop_copy: true,
                info,
                coded_info,
                crop_offset: request.crop_offset,
                size,
                min,
                max,
            }
        } else {
            pool.configure(
                &caps,
                size,
                min,
                max,
                &allocator,
                usage,
                request.alignment.as_ref(),
                true,
            )
            .map_err(failed_config)?;

            let copy_frames =
                !has_videometa && pool.requires_video_meta() && caps_is_raw(&caps);
            let other_pool = if copy_frames {
                match other_pool {
                    Some(other) => {
                        configure_video_pool(
                            &other,
                            &caps,
                            info.size() as u32,
                            min,
                            max,
                            other_allocator.as_ref(),
                            false,
                        )?;
                        Some(other)
                    }
                    None if dont_use_other_pool => {
                        return Err(gst::loggable_error!(
                            CAT,
                            "Need to copy frames but have no usable pool"
                        ));
                    }
                    None => Some(new_video_pool(
                        &caps,
                        info.size() as u32,
                        min,
                        max,
                        other_allocator.as_ref(),
                        false,
                    )?),
                }
            } else {
                other_pool
            };

            if copy_frames {
                gst::info!(CAT, "Downstream can't map {} without video meta, copying", caps);
            }

            Negotiated {
                size: pool
                    .config()
                    .params()
                    .map(|(_, size, _, _)| size)
                    .unwrap_or(size),
                pool,
                other_pool,
                copy_frames,
                crop_copy: false,
                coded_info: info.clone(),
                info,
                crop_offset: (0, 0),
                min,
                max,
            }
        };

        Self::fill_query(query, &negotiated, update_pool, update_allocator);
        if let Some((_, old)) = self.cached.replace((key, negotiated.clone())) {
            if let Some(other) = old.other_pool {
                if Some(&other) != negotiated.other_pool.as_ref() {
                    let _ = other.set_active(false);
                }
            }
        }

        Ok(negotiated)
    }

    fn fill_query(
        query: &mut gst::query::Allocation,
        negotiated: &Negotiated,
        update_pool: bool,
        update_allocator: bool,
    ) {
        // Downstream gets the copy destination when frames are copied
        let (pool, size): (gst::BufferPool, u32) = match &negotiated.other_pool {
            Some(other) if negotiated.copy_frames => (
                other.clone(),
                other
                    .config()
                    .params()
                    .map(|(_, size, _, _)| size)
                    .unwrap_or(negotiated.size),
            ),
            _ => (negotiated.pool.clone().upcast(), negotiated.size),
        };

        if update_pool {
            query.set_nth_allocation_pool(
                0,
                Some(&pool),
                size,
                negotiated.min,
                negotiated.max,
            );
        } else {
            query.add_allocation_pool(Some(&pool), size, negotiated.min, negotiated.max);
        }

        if negotiated.copy_frames {
            return;
        }

        if let Some(allocator) = negotiated.pool.allocator() {
            if update_allocator {
                query.set_nth_allocation_param(0, Some(&allocator), gst::AllocationParams::default());
            } else {
                query.add_allocation_param(Some(&allocator), gst::AllocationParams::default());
            }
        }
    }
}

/// Offers upstream a pool of surfaces to write into.
pub fn propose_allocation(
    display: &VaDisplay,
    query: &mut gst::query::Allocation,
    extra_min_buffers: u32,
    crop_meta: bool,
) -> Result<(), gst::LoggableError> {
    if query.allocation_pools().into_iter().next().is_some() {
        return Ok(());
    }

    let (caps, need_pool) = query.get();
    let caps = caps
        .ok_or_else(|| gst::loggable_error!(CAT, "No caps in allocation query"))?
        .to_owned();
    let info = VaVideoInfo::from_caps(&caps)
        .map_err(|err| gst::loggable_error!(CAT, "Invalid caps {}: {}", caps, err))?;

    // Allocators bound to nothing or to another display are of no use
    let foreign = query
        .allocation_params()
        .into_iter()
        .enumerate()
        .filter(|(_, (a, _))| {
            a.as_ref()
                .and_then(allocator_display)
                .map_or(true, |d| d != *display)
        })
        .map(|(idx, _)| idx as u32)
        .collect::<Vec<_>>();
    for idx in foreign.into_iter().rev() {
        query.remove_nth_allocation_param(idx);
    }

    query.add_allocation_meta::<gst_video::VideoMeta>(None);
    if crop_meta {
        query.add_allocation_meta::<gst_video::VideoCropMeta>(None);
    }

    if !need_pool {
        return Ok(());
    }

    let is_dma = caps_is_dmabuf(&caps);
    let usage = UsageHint::for_entrypoint(Entrypoint::VideoProc, gst::PadDirection::Sink, is_dma);
    let allocator = match query
        .allocation_params()
        .into_iter()
        .next()
        .and_then(|(a, _)| a)
        .and_then(|a| a.downcast::<VaAllocator>().ok())
    {
        Some(allocator) => allocator,
        None => {
            let allocator = VaAllocator::new(display, AllocatorKind::for_caps(&caps), &[]);
            query.add_allocation_param(Some(&allocator), gst::AllocationParams::default());
            allocator
        }
    };

    let min = 1 + extra_min_buffers;
    let pool = VaPool::new();
    pool.configure(
        &caps,
        info.size() as u32,
        min,
        0,
        &allocator,
        usage,
        None,
        true,
    )
    .map_err(failed_config)?;
    let size = pool
        .config()
        .params()
        .map(|(_, size, _, _)| size)
        .unwrap_or(info.size() as u32);

    gst::debug!(CAT, "Proposing pool of {} buffers for {}", min, caps);
    query.add_allocation_pool(Some(&pool), size, min, 0);

    Ok(())
}

/// The one pool an encoder imports raw input into, built on first use.
#[derive(Default)]
pub struct EncoderSinkPool {
    pool: std::sync::Mutex<Option<VaPool>>,
}

impl EncoderSinkPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops the pool; the next import builds a new one.
    pub fn close(&self) {
        if let Some(pool) = self.pool.lock().unwrap().take() {
            let _ = pool.set_active(false);
        }
    }

    pub fn pool(&self) -> Option<VaPool> {
        self.pool.lock().unwrap().clone()
    }
}

impl Drop for EncoderSinkPool {
    fn drop(&mut self) {
        self.close();
    }
}

impl PoolProvider for EncoderSinkPool {
    fn import_pool(
        &self,
        display: &VaDisplay,
        info: &gst_video::VideoInfo,
        _usage: UsageHint,
    ) -> Result<gst::BufferPool, gst::FlowError> {
        let mut guard = self.pool.lock().unwrap();
        if let Some(pool) = guard.as_ref() {
            return Ok(pool.clone().upcast());
        }

        let caps = info.to_caps().map_err(|_| gst::FlowError::NotNegotiated)?;
        let caps = crate::caps::caps_with_feature(&caps, crate::caps::MemoryFeature::Va);
        let usage = ConsumerKind::Encoder.output_usage(false);
        let allocator = VaAllocator::new(display, AllocatorKind::Surface, &[]);

        let pool = VaPool::new();
        pool.configure(&caps, info.size() as u32, 1, 0, &allocator, usage, None, true)
            .map_err(|err| {
                gst::error!(CAT, "Failed to configure encoder input pool: {}", err);
                gst::FlowError::Error
            })?;
        pool.set_active(true).map_err(|err| {
            gst::error!(CAT, "Failed to activate encoder input pool: {}", err);
            gst::FlowError::Error
        })?;

        gst::debug!(CAT, "Created encoder input pool for {}", caps);
        *guard = Some(pool.clone());

        Ok(pool.upcast())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::{DummyConfig, DummyDevice};

    #[test]
    fn usage_by_consumer() {
        assert_eq!(
            ConsumerKind::Transform.output_usage(false),
            UsageHint::VPP_WRITE
        );
        assert_eq!(
            ConsumerKind::Compositor.output_usage(true),
            UsageHint::VPP_READ | UsageHint::VPP_WRITE
        );
        assert_eq!(ConsumerKind::Decoder.output_usage(false), UsageHint::DECODER);
        assert_eq!(ConsumerKind::Encoder.output_usage(false), UsageHint::ENCODER);
    }

    fn nv12_info(width: u32, height: u32) -> gst_video::VideoInfo {
        gst_video::VideoInfo::builder(gst_video::VideoFormat::Nv12, width, height)
            .build()
            .unwrap()
    }

    fn nv12_caps(width: u32, height: u32) -> gst::Caps {
        nv12_info(width, height).to_caps().unwrap()
    }

    // Rows of 256 bytes never match the default layout of a 100 wide frame
    fn padded_display() -> VaDisplay {
        VaDisplay::new(DummyDevice::new(DummyConfig {
            stride_align: 256,
            ..Default::default()
        }))
    }

    fn first_pool(query: &gst::query::Allocation) -> (Option<gst::BufferPool>, u32, u32, u32) {
        query.allocation_pools().into_iter().next().unwrap()
    }

    #[test]
    fn identical_queries_reuse_the_pool() {
        gst::init().unwrap();

        let display = VaDisplay::new(DummyDevice::default());
        let mut negotiator = Negotiator::new(ConsumerKind::Transform);
        let request = AllocationRequest::default();
        let caps = nv12_caps(64, 48);

        let mut query = gst::query::Allocation::new(Some(&caps), true);
        let first = negotiator
            .decide_allocation(&display, &mut query, &request)
            .unwrap();
        assert_eq!(first.min, 1);
        assert!(!first.copy_frames);
        assert_eq!(
            first_pool(&query).0,
            Some(first.pool.clone().upcast::<gst::BufferPool>())
        );

        let mut query = gst::query::Allocation::new(Some(&caps), true);
        let second = negotiator
            .decide_allocation(&display, &mut query, &request)
            .unwrap();
        assert_eq!(second.pool, first.pool);
        assert_eq!(second.pool.allocator(), first.pool.allocator());
        let params = query.allocation_params().into_iter().collect::<Vec<_>>();
        assert_eq!(params.len(), 1);
        assert_eq!(
            params[0].0,
            first.pool.allocator().map(|a| a.upcast::<gst::Allocator>())
        );

        let aligned = AllocationRequest {
            alignment: Some(gst_video::VideoAlignment::new(0, 16, 0, 0, &[0; 4])),
            ..Default::default()
        };
        let mut query = gst::query::Allocation::new(Some(&caps), true);
        let third = negotiator
            .decide_allocation(&display, &mut query, &aligned)
            .unwrap();
        assert_ne!(third.pool, first.pool);

        let mut query = gst::query::Allocation::new(Some(&nv12_caps(128, 96)), true);
        let fourth = negotiator
            .decide_allocation(&display, &mut query, &aligned)
            .unwrap();
        assert_ne!(fourth.pool, third.pool);
        assert_eq!(negotiator.negotiated().unwrap().pool, fourth.pool);

        let deeper = AllocationRequest {
            min_buffers: 3,
            ..aligned.clone()
        };
        let mut query = gst::query::Allocation::new(Some(&nv12_caps(128, 96)), true);
        let fifth = negotiator
            .decide_allocation(&display, &mut query, &deeper)
            .unwrap();
        assert_ne!(fifth.pool, fourth.pool);
        assert_eq!(fifth.min, 4);
        assert_eq!(first_pool(&query).2, 4);
    }

    #[test]
    fn allocator_of_this_display_is_kept() {
        gst::init().unwrap();

        let display = VaDisplay::new(DummyDevice::default());
        let allocator = VaAllocator::new(&display, AllocatorKind::Surface, &[]);
        let mut negotiator = Negotiator::new(ConsumerKind::Transform);

        let mut query = gst::query::Allocation::new(Some(&nv12_caps(64, 48)), true);
        query.add_allocation_param(Some(&allocator), gst::AllocationParams::default());
        let negotiated = negotiator
            .decide_allocation(&display, &mut query, &AllocationRequest::default())
            .unwrap();

        assert_eq!(negotiated.pool.allocator(), Some(allocator.clone()));
        let params = query.allocation_params().into_iter().collect::<Vec<_>>();
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].0, Some(allocator.upcast::<gst::Allocator>()));
    }

    #[test]
    fn allocator_of_another_display_is_replaced() {
        gst::init().unwrap();

        let display = VaDisplay::new(DummyDevice::default());
        let other = VaDisplay::new(DummyDevice::default());
        let foreign = VaAllocator::new(&other, AllocatorKind::Surface, &[]);
        let mut negotiator = Negotiator::new(ConsumerKind::Transform);

        let mut query = gst::query::Allocation::new(Some(&nv12_caps(64, 48)), true);
        query.add_allocation_param(Some(&foreign), gst::AllocationParams::default());
        let negotiated = negotiator
            .decide_allocation(&display, &mut query, &AllocationRequest::default())
            .unwrap();

        assert_eq!(negotiated.pool.display(), Some(display.clone()));
        assert_ne!(negotiated.pool.allocator(), Some(foreign));
    }

    #[test]
    fn copy_without_usable_pool_fails() {
        gst::init().unwrap();

        let display = padded_display();
        let other = VaDisplay::new(DummyDevice::default());
        let mut negotiator = Negotiator::new(ConsumerKind::Transform);

        let mut query = gst::query::Allocation::new(Some(&nv12_caps(100, 50)), true);
        query.add_allocation_param(
            Some(&VaAllocator::new(&other, AllocatorKind::Surface, &[])),
            gst::AllocationParams::default(),
        );
        query.add_allocation_pool(Some(&gst_video::VideoBufferPool::new()), 0, 0, 0);

        assert!(negotiator
            .decide_allocation(&display, &mut query, &AllocationRequest::default())
            .is_err());
        assert!(negotiator.negotiated().is_none());
    }

    #[test]
    fn system_allocator_backs_the_copy_pool() {
        gst::init().unwrap();

        let display = padded_display();
        let sysmem = gst::Allocator::find(None).unwrap();
        let mut negotiator = Negotiator::new(ConsumerKind::Transform);

        let mut query = gst::query::Allocation::new(Some(&nv12_caps(100, 50)), true);
        query.add_allocation_param(Some(&sysmem), gst::AllocationParams::default());
        let negotiated = negotiator
            .decide_allocation(&display, &mut query, &AllocationRequest::default())
            .unwrap();

        assert!(negotiated.pool.requires_video_meta());
        assert!(negotiated.copy_frames);
        assert!(!negotiated.crop_copy);
        let other = negotiated.other_pool.clone().unwrap();
        let (allocator, _) = other.config().allocator().unwrap();
        assert_eq!(allocator, Some(sysmem.clone()));
        assert_eq!(negotiated.pool.display(), Some(display.clone()));

        // Downstream is handed the pool it can map
        assert_eq!(first_pool(&query).0, Some(other.clone()));

        let mut surface = negotiated.acquire_surface_buffer().unwrap();
        surface
            .get_mut()
            .unwrap()
            .set_pts(gst::ClockTime::from_mseconds(40));
        let out = negotiated.output_buffer(surface).unwrap();
        assert_eq!(out.pts(), Some(gst::ClockTime::from_mseconds(40)));
        assert!(display.buffer_surface(&out).is_none());
        assert!(out.meta::<gst_video::VideoMeta>().is_none());
    }

    #[test]
    fn downstream_pool_is_the_copy_destination() {
        gst::init().unwrap();

        let display = padded_display();
        let downstream = gst_video::VideoBufferPool::new().upcast::<gst::BufferPool>();
        let mut negotiator = Negotiator::new(ConsumerKind::Transform);

        let mut query = gst::query::Allocation::new(Some(&nv12_caps(100, 50)), true);
        query.add_allocation_pool(Some(&downstream), 0, 2, 0);
        let negotiated = negotiator
            .decide_allocation(&display, &mut query, &AllocationRequest::default())
            .unwrap();

        assert!(negotiated.copy_frames);
        assert_eq!(negotiated.min, 2);
        assert_eq!(negotiated.other_pool, Some(downstream.clone()));
        let (caps, _, min, _) = downstream.config().params().unwrap();
        assert_eq!(caps, Some(nv12_caps(100, 50)));
        assert_eq!(min, 2);
    }

    #[test]
    fn video_meta_downstream_needs_no_copy() {
        gst::init().unwrap();

        let display = padded_display();
        let mut negotiator = Negotiator::new(ConsumerKind::Transform);
        let caps = nv12_caps(100, 50);

        let mut query = gst::query::Allocation::new(Some(&caps), true);
        assert!(negotiator
            .decide_allocation(&display, &mut query, &AllocationRequest::default())
            .unwrap()
            .copy_frames);

        let mut query = gst::query::Allocation::new(Some(&caps), true);
        query.add_allocation_meta::<gst_video::VideoMeta>(None);
        let negotiated = negotiator
            .decide_allocation(&display, &mut query, &AllocationRequest::default())
            .unwrap();
        assert!(!negotiated.copy_frames);
        assert_eq!(
            first_pool(&query).0,
            Some(negotiated.pool.clone().upcast::<gst::BufferPool>())
        );
    }

    #[test]
    fn crop_copy_takes_the_visible_area() {
        gst::init().unwrap();

        let display = VaDisplay::new(DummyDevice::default());
        let mut negotiator = Negotiator::new(ConsumerKind::Decoder);
        let request = AllocationRequest {
            coded_size: Some((64, 64)),
            crop_offset: (0, 16),
            ..Default::default()
        };

        let mut query = gst::query::Allocation::new(Some(&nv12_caps(64, 48)), true);
        let negotiated = negotiator
            .decide_allocation(&display, &mut query, &request)
            .unwrap();
        assert!(negotiated.copy_frames);
        assert!(negotiated.crop_copy);
        assert_eq!(negotiated.coded_info.height(), 64);
        assert_eq!(negotiated.info.height(), 48);

        let mut surface = negotiated.acquire_surface_buffer().unwrap();
        {
            let coded = negotiated.coded_info.clone();
            let mut frame = gst_video::VideoFrameRef::from_buffer_ref_writable(
                surface.get_mut().unwrap(),
                &coded,
            )
            .unwrap();
            for plane in 0..2u32 {
                let stride = frame.plane_stride()[plane as usize] as usize;
                let data = frame.plane_data_mut(plane).unwrap();
                for (row, line) in data.chunks_mut(stride).enumerate() {
                    line.fill(plane as u8 * 100 + row as u8);
                }
            }
        }

        let out = negotiated.output_buffer(surface).unwrap();
        let frame =
            gst_video::VideoFrameRef::from_buffer_ref_readable(out.as_ref(), &negotiated.info)
                .unwrap();
        let (y_stride, uv_stride) = (
            frame.plane_stride()[0] as usize,
            frame.plane_stride()[1] as usize,
        );
        let y = frame.plane_data(0).unwrap();
        assert_eq!(y[0], 16);
        assert_eq!(y[47 * y_stride + 63], 63);
        let uv = frame.plane_data(1).unwrap();
        assert_eq!(uv[0], 108);
        assert_eq!(uv[23 * uv_stride], 131);
    }

    #[test]
    fn crop_meta_downstream_needs_no_copy() {
        gst::init().unwrap();

        let display = VaDisplay::new(DummyDevice::default());
        let mut negotiator = Negotiator::new(ConsumerKind::Decoder);
        let request = AllocationRequest {
            coded_size: Some((64, 64)),
            crop_offset: (0, 16),
            ..Default::default()
        };

        let mut query = gst::query::Allocation::new(Some(&nv12_caps(64, 48)), true);
        query.add_allocation_meta::<gst_video::VideoMeta>(None);
        query.add_allocation_meta::<gst_video::VideoCropMeta>(None);
        let negotiated = negotiator
            .decide_allocation(&display, &mut query, &request)
            .unwrap();
        assert!(!negotiated.crop_copy);
        assert!(!negotiated.copy_frames);
    }

    #[test]
    fn failed_configuration_keeps_previous_pools() {
        gst::init().unwrap();

        let display = VaDisplay::new(DummyDevice::default());
        let mut negotiator = Negotiator::new(ConsumerKind::Transform);

        let mut query = gst::query::Allocation::new(Some(&nv12_caps(64, 48)), true);
        let first = negotiator
            .decide_allocation(&display, &mut query, &AllocationRequest::default())
            .unwrap();

        let rgba_only = AllocationRequest {
            surface_formats: vec![gst_video::VideoFormat::Rgba],
            ..Default::default()
        };
        let mut query = gst::query::Allocation::new(Some(&nv12_caps(128, 96)), true);
        assert!(negotiator
            .decide_allocation(&display, &mut query, &rgba_only)
            .is_err());
        assert_eq!(negotiator.negotiated().unwrap().pool, first.pool);
        assert!(!first.pool.is_active());
    }

    #[test]
    fn encoder_pool_is_built_once() {
        gst::init().unwrap();

        let display = VaDisplay::new(DummyDevice::default());
        let provider = EncoderSinkPool::new();
        assert!(provider.pool().is_none());

        let pool = provider
            .import_pool(&display, &nv12_info(64, 48), UsageHint::ENCODER)
            .unwrap();
        assert!(pool.is_active());
        let again = provider
            .import_pool(&display, &nv12_info(128, 96), UsageHint::ENCODER)
            .unwrap();
        assert_eq!(again, pool);
        assert_eq!(
            provider.pool().unwrap().usage_hint(),
            Some(UsageHint::ENCODER)
        );

        provider.close();
        assert!(provider.pool().is_none());
        assert!(!pool.is_active());

        let rebuilt = provider
            .import_pool(&display, &nv12_info(64, 48), UsageHint::ENCODER)
            .unwrap();
        assert_ne!(rebuilt, pool);
    }
}
