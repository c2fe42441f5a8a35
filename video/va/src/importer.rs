// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! Turning arbitrary input buffers into something backed by a surface of
//! the element's display.
//!
//! A buffer is either used as is (it already belongs to the display), bound
//! in place when it is made of foreign DMA-buf memory, or copied into a
//! buffer from a pool supplied by the caller. DMA-buf exported by another
//! display's pool is always copied.

use gst::prelude::*;
use gst_video::prelude::*;
use std::sync::{Arc, LazyLock, Mutex};
use thiserror::Error;

use crate::allocator::{AllocatorKind, VaAllocator};
use crate::caps::{caps_with_feature, MemoryFeature, VaVideoInfo};
use crate::device::{DmabufDescriptor, DmabufPlane, Entrypoint, SurfaceId, UsageHint};
use crate::display::{import_lock, ImportedSurface, VaDisplay};
use crate::pool::VaPool;

static CAT: LazyLock<gst::DebugCategory> = LazyLock::new(|| {
    gst::DebugCategory::new(
        "vaimporter",
        gst::DebugColorFlags::empty(),
        Some("VA buffer importer"),
    )
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ImportError {
    /// The buffer could not be mapped; it should be dropped.
    #[error("invalid video buffer received")]
    InvalidBuffer,
    #[error(transparent)]
    Flow(#[from] gst::FlowError),
}

/// Supplies the pool that buffers are copied into when they can't be used
/// directly.
pub trait PoolProvider {
    /// An active pool producing surface backed buffers of `info` on
    /// `display`.
    fn import_pool(
        &self,
        display: &VaDisplay,
        info: &gst_video::VideoInfo,
        usage: UsageHint,
    ) -> Result<gst::BufferPool, gst::FlowError>;
}

/// Creates the copy pool on first use and keeps it as long as the video
/// info stays the same.
#[derive(Default)]
pub struct CachedPoolProvider {
    pool: Mutex<Option<(gst_video::VideoInfo, VaDisplay, VaPool)>>,
}

impl CachedPoolProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&self) {
        if let Some((_, _, pool)) = self.pool.lock().unwrap().take() {
            let _ = pool.set_active(false);
        }
    }

    pub fn pool(&self) -> Option<VaPool> {
        self.pool.lock().unwrap().as_ref().map(|(_, _, p)| p.clone())
    }
}

impl Drop for CachedPoolProvider {
    fn drop(&mut self) {
        self.clear();
    }
}

impl PoolProvider for CachedPoolProvider {
    fn import_pool(
        &self,
        display: &VaDisplay,
        info: &gst_video::VideoInfo,
        usage: UsageHint,
    ) -> Result<gst::BufferPool, gst::FlowError> {
        let mut cached = self.pool.lock().unwrap();
        if let Some((cached_info, cached_display, pool)) = cached.as_ref() {
            if cached_info == info && cached_display == display {
                return Ok(pool.clone().upcast());
            }
        }

        if let Some((_, _, old)) = cached.take() {
            let _ = old.set_active(false);
        }

        let caps = info.to_caps().map_err(|_| gst::FlowError::NotNegotiated)?;
        let caps = caps_with_feature(&caps, MemoryFeature::Va);

        let allocator = VaAllocator::new(display, AllocatorKind::Surface, &[]);
        let pool = VaPool::new();
        pool.configure(
            &caps,
            info.size() as u32,
            1,
            0,
            &allocator,
            usage,
            None,
            true,
        )
        .map_err(|err| {
            gst::error!(CAT, "Failed to configure import pool: {}", err);
            gst::FlowError::Error
        })?;
        pool.set_active(true).map_err(|err| {
            gst::error!(CAT, "Failed to activate import pool: {}", err);
            gst::FlowError::Error
        })?;

        gst::debug!(CAT, "Created import pool for {:?}", caps);
        *cached = Some((info.clone(), display.clone(), pool.clone()));

        Ok(pool.upcast())
    }
}

/// An input buffer ready to be handed to the device.
#[derive(Debug, Clone)]
pub enum ImportedBuffer {
    /// The buffer already belonged to the display.
    Native {
        buffer: gst::Buffer,
        surface: SurfaceId,
    },
    /// DMA-buf memory with a surface bound over it.
    DmaBuf {
        buffer: gst::Buffer,
        surface: Arc<ImportedSurface>,
    },
    /// A copy made into a pool buffer.
    Copied {
        buffer: gst::Buffer,
        surface: SurfaceId,
    },
}

impl ImportedBuffer {
    pub fn buffer(&self) -> &gst::Buffer {
        match self {
            ImportedBuffer::Native { buffer, .. }
            | ImportedBuffer::DmaBuf { buffer, .. }
            | ImportedBuffer::Copied { buffer, .. } => buffer,
        }
    }

    pub fn surface(&self) -> SurfaceId {
        match self {
            ImportedBuffer::Native { surface, .. } | ImportedBuffer::Copied { surface, .. } => {
                *surface
            }
            ImportedBuffer::DmaBuf { surface, .. } => surface.surface(),
        }
    }

    pub fn is_copy(&self) -> bool {
        matches!(self, ImportedBuffer::Copied { .. })
    }
}

/// Everything needed to import buffers for one element and direction.
pub struct BufferImporter<'a> {
    pub element: &'a gst::Element,
    pub display: &'a VaDisplay,
    pub info: &'a VaVideoInfo,
    pub entrypoint: Entrypoint,
    pub direction: gst::PadDirection,
    pub provider: &'a dyn PoolProvider,
}

fn plane_size(info: &gst_video::VideoInfo, plane: u32, stride: i32) -> Option<usize> {
    let finfo = info.format_info();
    let comp = finfo.plane().iter().position(|&p| p == plane)?;
    let rows = finfo.scale_height(comp as u8, info.height()) as usize;
    Some(rows * stride.unsigned_abs() as usize)
}

impl BufferImporter<'_> {
    pub fn import(&self, inbuf: &gst::Buffer) -> Result<ImportedBuffer, ImportError> {
        {
            let _guard = import_lock();

            if let Some(surface) = self.display.imported_surface(inbuf) {
                gst::trace!(
                    CAT,
                    obj = self.element,
                    "DMA-buf already bound to surface {}",
                    surface.surface()
                );
                return Ok(ImportedBuffer::DmaBuf {
                    buffer: inbuf.clone(),
                    surface,
                });
            }

            if let Some(surface) = self.display.pooled_surface(inbuf) {
                gst::trace!(CAT, obj = self.element, "Buffer already on surface {}", surface);
                return Ok(ImportedBuffer::Native {
                    buffer: inbuf.clone(),
                    surface,
                });
            }

            if let Some(surface) = self.import_dmabuf(inbuf) {
                gst::trace!(
                    CAT,
                    obj = self.element,
                    "Imported DMA-buf as surface {}",
                    surface.surface()
                );
                return Ok(ImportedBuffer::DmaBuf {
                    buffer: inbuf.clone(),
                    surface,
                });
            }
        }

        self.copy(inbuf)
    }

    fn import_dmabuf(&self, inbuf: &gst::Buffer) -> Option<Arc<ImportedSurface>> {
        if inbuf.n_memory() == 0
            || !inbuf
                .peek_memory(0)
                .is_memory_type::<gst_allocators::DmaBufMemory>()
        {
            return None;
        }

        if let Some(origin) = VaDisplay::exporting_display(inbuf.peek_memory(0)) {
            if origin != *self.display {
                gst::log!(CAT, obj = self.element, "DMA-buf of another display {:?}", origin);
                return None;
            }
        }

        let info = self.info.info();
        let n_planes = info.n_planes();
        if inbuf.n_memory() > n_planes as usize {
            gst::log!(
                CAT,
                obj = self.element,
                "{} memories for {} planes",
                inbuf.n_memory(),
                n_planes
            );
            return None;
        }

        let (offsets, strides) = match inbuf.meta::<gst_video::VideoMeta>() {
            Some(meta) => (meta.offset().to_vec(), meta.stride().to_vec()),
            None => (info.offset().to_vec(), info.stride().to_vec()),
        };
        if offsets.len() < n_planes as usize || strides.len() < n_planes as usize {
            return None;
        }

        let mut planes = Vec::with_capacity(n_planes as usize);
        for plane in 0..n_planes {
            let idx = plane as usize;
            let size = plane_size(info, plane, strides[idx])?;
            let offset = offsets[idx];

            let Some((range, skip)) = inbuf.find_memory(offset..offset + size) else {
                gst::log!(CAT, obj = self.element, "No memory for plane {}", plane);
                return None;
            };
            if range.len() != 1 {
                gst::log!(
                    CAT,
                    obj = self.element,
                    "Plane {} spans {} memories",
                    plane,
                    range.len()
                );
                return None;
            }

            let mem = inbuf.peek_memory(range.start);
            let Some(dmamem) = mem.downcast_memory_ref::<gst_allocators::DmaBufMemory>() else {
                gst::log!(CAT, obj = self.element, "Plane {} is not DMA-buf", plane);
                return None;
            };

            planes.push(DmabufPlane {
                fd: dmamem.fd(),
                offset: mem.offset() + skip,
                stride: strides[idx],
            });
        }

        let descriptor = DmabufDescriptor {
            format: info.format(),
            width: info.width(),
            height: info.height(),
            modifier: self.info.modifier(),
            planes,
        };
        let usage = UsageHint::for_entrypoint(self.entrypoint, self.direction, true);

        let surface = match self.display.device().import_dmabuf(&descriptor, usage) {
            Ok(surface) => surface,
            Err(err) => {
                gst::debug!(CAT, obj = self.element, "DMA-buf import failed: {}", err);
                return None;
            }
        };

        let imported = self.display.register_import(inbuf, surface);
        if imported.is_none() {
            let _ = self.display.device().destroy_surface(surface);
        }
        imported
    }

    fn copy(&self, inbuf: &gst::Buffer) -> Result<ImportedBuffer, ImportError> {
        let info = self.info.info();
        let usage = UsageHint::for_entrypoint(self.entrypoint, self.direction, false);
        let pool = self.provider.import_pool(self.display, info, usage)?;

        let outbuf = pool.acquire_buffer(None).map_err(|err| {
            gst::error!(CAT, obj = self.element, "Failed to acquire import buffer: {:?}", err);
            err
        })?;
        let Some(surface) = self.display.pooled_surface(&outbuf) else {
            gst::error!(CAT, obj = self.element, "Import pool buffer has no surface");
            return Err(ImportError::Flow(gst::FlowError::Error));
        };

        let invalid = || {
            gst::element_warning!(
                self.element,
                gst::StreamError::Format,
                ["invalid video buffer received"]
            );
            ImportError::InvalidBuffer
        };

        let in_frame =
            gst_video::VideoFrame::from_buffer_readable(inbuf.clone(), info).map_err(|_| invalid())?;
        let mut out_frame =
            gst_video::VideoFrame::from_buffer_writable(outbuf, info).map_err(|_| invalid())?;
        in_frame.copy(&mut out_frame).map_err(|_| invalid())?;
        drop(in_frame);

        let mut outbuf = out_frame.into_buffer();
        {
            let out = outbuf.make_mut();
            out.set_flags(inbuf.flags() & !gst::BufferFlags::TAG_MEMORY);
            out.set_pts(inbuf.pts());
            out.set_dts(inbuf.dts());
            out.set_duration(inbuf.duration());
            out.set_offset(inbuf.offset());
            out.set_offset_end(inbuf.offset_end());
        }

        gst::trace!(CAT, obj = self.element, "Copied buffer into surface {}", surface);

        Ok(ImportedBuffer::Copied {
            buffer: outbuf,
            surface,
        })
    }
}
