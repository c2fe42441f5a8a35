// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use gst::glib;
use gst::prelude::*;
use gst::subclass::prelude::*;
use gst_video::prelude::*;
use std::sync::{LazyLock, Mutex};

use crate::allocator::{AllocatorKind, VaAllocator};
use crate::caps::VaVideoInfo;
use crate::device::{SurfaceLayout, UsageHint};
use crate::display::VaDisplay;

static CAT: LazyLock<gst::DebugCategory> = LazyLock::new(|| {
    gst::DebugCategory::new(
        "vapool",
        gst::DebugColorFlags::empty(),
        Some("VA buffer pool"),
    )
});

/// Pool config field holding the [`UsageHint`] bits for new surfaces.
pub const USAGE_HINT_FIELD: &str = "va-usage-hint";

mod imp {
    use super::*;

    pub(super) struct State {
        pub allocator: VaAllocator,
        pub info: VaVideoInfo,
        pub width: u32,
        pub height: u32,
        pub layout: SurfaceLayout,
        pub usage: UsageHint,
        pub requires_video_meta: bool,
    }

    #[derive(Default)]
    pub struct VaPool {
        pub(super) state: Mutex<Option<State>>,
    }

    impl VaPool {
        fn export_memory(
            &self,
            display: &VaDisplay,
            surface: crate::device::SurfaceId,
        ) -> Result<Vec<gst::Memory>, glib::BoolError> {
            let exported = display
                .device()
                .export_dmabuf(surface)
                .map_err(|err| glib::bool_error!("Failed to export surface: {}", err))?;

            let allocator = gst_allocators::DmaBufAllocator::new();
            exported
                .objects
                .into_iter()
                .map(|object| unsafe { allocator.alloc(object.fd, object.size) })
                .collect()
        }
    }

    #[glib::object_subclass]
    impl ObjectSubclass for VaPool {
        const NAME: &'static str = "GstVaRsPool";
        type Type = super::VaPool;
        type ParentType = gst::BufferPool;
    }

    impl ObjectImpl for VaPool {}
    impl GstObjectImpl for VaPool {}

    impl BufferPoolImpl for VaPool {
        fn options() -> &'static [&'static str] {
            static OPTIONS: LazyLock<Vec<&'static str>> = LazyLock::new(|| {
                vec![
                    gst_video::BUFFER_POOL_OPTION_VIDEO_META.as_str(),
                    gst_video::BUFFER_POOL_OPTION_VIDEO_ALIGNMENT.as_str(),
                ]
            });

            OPTIONS.as_ref()
        }

        fn set_config(&self, config: &mut gst::BufferPoolConfigRef) -> bool {
            let Some((Some(caps), size, min, max)) = config.params() else {
                gst::warning!(CAT, imp = self, "No caps in config");
                return false;
            };

            let info = match VaVideoInfo::from_caps(&caps) {
                Ok(info) => info,
                Err(err) => {
                    gst::warning!(CAT, imp = self, "Invalid caps {}: {}", caps, err);
                    return false;
                }
            };

            let allocator = match config.allocator() {
                Some((Some(allocator), _)) => allocator.downcast::<VaAllocator>().ok(),
                _ => None,
            };
            let Some(allocator) = allocator else {
                gst::warning!(CAT, imp = self, "Config carries no VA allocator");
                return false;
            };

            if !allocator.supports_format(info.format()) {
                gst::warning!(
                    CAT,
                    imp = self,
                    "Allocator can't handle {:?}",
                    info.format()
                );
                return false;
            }

            let usage = config
                .get::<u32>(USAGE_HINT_FIELD)
                .map(UsageHint::from_bits_truncate)
                .unwrap_or(UsageHint::GENERIC);

            let (mut width, mut height) = (info.width(), info.height());
            if config.has_option(&gst_video::BUFFER_POOL_OPTION_VIDEO_ALIGNMENT) {
                if let Some(align) = config.video_alignment() {
                    width += align.padding_left() + align.padding_right();
                    height += align.padding_top() + align.padding_bottom();
                }
            }

            let display = allocator.display().clone();
            let layout = match display
                .device()
                .surface_layout(info.format(), width, height)
            {
                Ok(layout) => layout,
                Err(err) => {
                    gst::warning!(CAT, imp = self, "No surface layout: {}", err);
                    return false;
                }
            };

            let default_info =
                match gst_video::VideoInfo::builder(info.format(), width, height).build() {
                    Ok(info) => info,
                    Err(err) => {
                        gst::warning!(CAT, imp = self, "Invalid surface size: {}", err);
                        return false;
                    }
                };
            let n_planes = default_info.n_planes() as usize;
            let requires_video_meta = layout.strides[..] != default_info.stride()[..n_planes]
                || layout.offsets[..] != default_info.offset()[..n_planes];

            let size = (size as usize).max(layout.size);
            config.set_params(Some(&caps), size as u32, min, max);

            gst::debug!(
                CAT,
                imp = self,
                "Configured {}x{} {:?} surfaces, usage {:?}, {} bytes, video meta {}",
                width,
                height,
                info.format(),
                usage,
                size,
                if requires_video_meta { "required" } else { "optional" }
            );

            *self.state.lock().unwrap() = Some(State {
                allocator,
                info,
                width,
                height,
                layout,
                usage,
                requires_video_meta,
            });

            self.parent_set_config(config)
        }

        fn alloc_buffer(
            &self,
            _params: Option<&gst::BufferPoolAcquireParams>,
        ) -> Result<gst::Buffer, gst::FlowError> {
            let state = self.state.lock().unwrap();
            let state = state.as_ref().ok_or(gst::FlowError::NotNegotiated)?;
            let display = state.allocator.display();
            let format = state.info.format();

            let surface = display
                .device()
                .create_surface(format, state.width, state.height, state.usage)
                .map_err(|err| {
                    gst::error!(CAT, imp = self, "Failed to create surface: {}", err);
                    gst::FlowError::Error
                })?;

            let memories = match state.allocator.kind() {
                AllocatorKind::Surface => Ok(vec![gst::Memory::with_size(state.layout.size)]),
                AllocatorKind::DmaBuf => self.export_memory(display, surface),
            };
            let memories = match memories {
                Ok(memories) if !memories.is_empty() => memories,
                res => {
                    gst::error!(CAT, imp = self, "Failed to wrap surface {}: {:?}", surface, res.err());
                    let _ = display.device().destroy_surface(surface);
                    return Err(gst::FlowError::Error);
                }
            };

            let mut buffer = gst::Buffer::new();
            {
                let buffer = buffer.get_mut().unwrap();
                for memory in memories {
                    buffer.append_memory(memory);
                }

                let n_planes = state.layout.offsets.len();
                gst_video::VideoMeta::add_full(
                    buffer,
                    gst_video::VideoFrameFlags::empty(),
                    format,
                    state.info.width(),
                    state.info.height(),
                    &state.layout.offsets[..n_planes],
                    &state.layout.strides[..n_planes],
                )
                .map_err(|err| {
                    gst::error!(CAT, imp = self, "Failed to add video meta: {}", err);
                    let _ = display.device().destroy_surface(surface);
                    gst::FlowError::Error
                })?;

                display.bind_pooled(buffer.peek_memory(0), surface);
                if state.allocator.kind() == AllocatorKind::DmaBuf {
                    display.register_export(buffer.peek_memory(0));
                }
            }

            gst::trace!(CAT, imp = self, "Allocated surface {}", surface);

            Ok(buffer)
        }

        fn free_buffer(&self, buffer: gst::Buffer) {
            if let Some(state) = self.state.lock().unwrap().as_ref() {
                let display = state.allocator.display();
                if buffer.n_memory() > 0 {
                    if let Some(surface) = display.unbind(buffer.peek_memory(0)) {
                        gst::trace!(CAT, imp = self, "Destroying surface {}", surface);
                        if let Err(err) = display.device().destroy_surface(surface) {
                            gst::warning!(CAT, imp = self, "Failed to destroy surface: {}", err);
                        }
                    }
                }
            }

            self.parent_free_buffer(buffer);
        }
    }
}

glib::wrapper! {
    /// Pool of buffers backed by device surfaces.
    pub struct VaPool(ObjectSubclass<imp::VaPool>) @extends gst::BufferPool, gst::Object;
}

impl Default for VaPool {
    fn default() -> Self {
        glib::Object::new()
    }
}

impl VaPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets up the pool for `caps`. `size` is raised to what the device
    /// needs for one surface.
    #[allow(clippy::too_many_arguments)]
    pub fn configure(
        &self,
        caps: &gst::Caps,
        size: u32,
        min: u32,
        max: u32,
        allocator: &VaAllocator,
        usage: UsageHint,
        alignment: Option<&gst_video::VideoAlignment>,
        video_meta: bool,
    ) -> Result<(), glib::BoolError> {
        let mut config = self.config();
        config.set_params(Some(caps), size, min, max);
        config.set_allocator(Some(allocator.upcast_ref()), None);
        config.set(USAGE_HINT_FIELD, usage.bits());
        if video_meta {
            config.add_option(&gst_video::BUFFER_POOL_OPTION_VIDEO_META);
        }
        if let Some(alignment) = alignment {
            config.add_option(&gst_video::BUFFER_POOL_OPTION_VIDEO_ALIGNMENT);
            config.set_video_alignment(alignment);
        }
        self.set_config(config)
    }

    pub fn allocator(&self) -> Option<VaAllocator> {
        self.imp()
            .state
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.allocator.clone())
    }

    pub fn display(&self) -> Option<VaDisplay> {
        self.allocator().map(|a| a.display().clone())
    }

    pub fn usage_hint(&self) -> Option<UsageHint> {
        self.imp().state.lock().unwrap().as_ref().map(|s| s.usage)
    }

    pub fn surface_layout(&self) -> Option<SurfaceLayout> {
        self.imp()
            .state
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.layout.clone())
    }

    /// Whether mapping buffers of this pool needs the attached `VideoMeta`,
    /// because the device layout differs from the default one.
    pub fn requires_video_meta(&self) -> bool {
        self.imp()
            .state
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|s| s.requires_video_meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::{DummyConfig, DummyDevice};

    fn nv12_caps(width: i32, height: i32) -> gst::Caps {
        gst_video::VideoInfo::builder(gst_video::VideoFormat::Nv12, width as u32, height as u32)
            .build()
            .unwrap()
            .to_caps()
            .unwrap()
    }

    #[test]
    fn buffers_are_bound_to_surfaces() {
        gst::init().unwrap();

        let device = DummyDevice::default();
        let display = VaDisplay::new(device.clone());
        let allocator = VaAllocator::new(&display, AllocatorKind::Surface, &[]);
        let pool = VaPool::new();
        pool.configure(
            &nv12_caps(64, 48),
            0,
            2,
            0,
            &allocator,
            UsageHint::VPP_WRITE,
            None,
            true,
        )
        .unwrap();
        pool.set_active(true).unwrap();
        assert_eq!(device.live_surfaces(), 2);

        let buffer = pool.acquire_buffer(None).unwrap();
        assert!(display.owns_buffer(&buffer));
        assert!(buffer.meta::<gst_video::VideoMeta>().is_some());
        assert_eq!(pool.usage_hint(), Some(UsageHint::VPP_WRITE));
        drop(buffer);

        pool.set_active(false).unwrap();
        assert_eq!(device.live_surfaces(), 0);
    }

    #[test]
    fn aligned_strides_need_video_meta() {
        gst::init().unwrap();

        let display = VaDisplay::new(DummyDevice::new(DummyConfig {
            stride_align: 256,
            ..Default::default()
        }));
        let allocator = VaAllocator::new(&display, AllocatorKind::Surface, &[]);
        let pool = VaPool::new();
        pool.configure(
            &nv12_caps(100, 50),
            0,
            0,
            0,
            &allocator,
            UsageHint::GENERIC,
            None,
            true,
        )
        .unwrap();
        assert!(pool.requires_video_meta());
        assert_eq!(pool.surface_layout().unwrap().strides, vec![256, 256]);
    }

    #[test]
    fn dmabuf_pool_exports_surfaces() {
        gst::init().unwrap();

        let display = VaDisplay::new(DummyDevice::default());
        let allocator = VaAllocator::new(&display, AllocatorKind::DmaBuf, &[]);
        let pool = VaPool::new();
        pool.configure(
            &nv12_caps(64, 64),
            0,
            1,
            0,
            &allocator,
            UsageHint::VPP_READ | UsageHint::VPP_WRITE,
            None,
            true,
        )
        .unwrap();
        pool.set_active(true).unwrap();

        let buffer = pool.acquire_buffer(None).unwrap();
        assert!(buffer
            .peek_memory(0)
            .is_memory_type::<gst_allocators::DmaBufMemory>());
        assert!(display.owns_buffer(&buffer));
        assert_eq!(
            VaDisplay::exporting_display(buffer.peek_memory(0)),
            Some(display.clone())
        );
        drop(buffer);
        pool.set_active(false).unwrap();
    }
}
