// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! Allocators carrying the display their memory belongs to.
//!
//! Memory itself is only ever produced by [`crate::pool::VaPool`]; the
//! allocator is what travels in allocation queries so that elements can
//! tell which device a pool is bound to.

use gst::glib;
use gst::prelude::*;
use gst::subclass::prelude::*;

use crate::caps::{caps_is_dmabuf, MemoryFeature};
use crate::display::VaDisplay;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocatorKind {
    /// Surfaces exposed as mappable memory.
    Surface,
    /// Surfaces exported as DMA-buf memory.
    DmaBuf,
}

impl AllocatorKind {
    pub fn for_caps(caps: &gst::CapsRef) -> Self {
        if caps_is_dmabuf(caps) {
            AllocatorKind::DmaBuf
        } else {
            AllocatorKind::Surface
        }
    }

    pub fn feature(self) -> MemoryFeature {
        match self {
            AllocatorKind::Surface => MemoryFeature::Va,
            AllocatorKind::DmaBuf => MemoryFeature::DmaBuf,
        }
    }
}

mod imp {
    use super::*;
    use std::sync::OnceLock;

    pub(super) struct Binding {
        pub display: VaDisplay,
        pub kind: AllocatorKind,
        pub formats: Vec<gst_video::VideoFormat>,
    }

    #[derive(Default)]
    pub struct VaAllocator {
        pub(super) binding: OnceLock<Binding>,
    }

    #[glib::object_subclass]
    impl ObjectSubclass for VaAllocator {
        const NAME: &'static str = "GstVaRsAllocator";
        type Type = super::VaAllocator;
        type ParentType = gst::Allocator;
    }

    impl ObjectImpl for VaAllocator {}
    impl GstObjectImpl for VaAllocator {}

    impl AllocatorImpl for VaAllocator {
        fn alloc(
            &self,
            _size: usize,
            _params: Option<&gst::AllocationParams>,
        ) -> Result<gst::Memory, glib::BoolError> {
            Err(glib::bool_error!(
                "VA memory can only be allocated through a VA buffer pool"
            ))
        }
    }
}

glib::wrapper! {
    pub struct VaAllocator(ObjectSubclass<imp::VaAllocator>) @extends gst::Allocator, gst::Object;
}

impl VaAllocator {
    pub fn new(
        display: &VaDisplay,
        kind: AllocatorKind,
        formats: &[gst_video::VideoFormat],
    ) -> Self {
        let allocator: Self = glib::Object::new();
        let _ = allocator.imp().binding.set(imp::Binding {
            display: display.clone(),
            kind,
            formats: formats.to_vec(),
        });
        allocator
    }

    fn binding(&self) -> &imp::Binding {
        self.imp()
            .binding
            .get()
            .expect("VaAllocator constructed without VaAllocator::new()")
    }

    pub fn display(&self) -> &VaDisplay {
        &self.binding().display
    }

    pub fn kind(&self) -> AllocatorKind {
        self.binding().kind
    }

    /// Surface formats this allocator was created for. Empty means any.
    pub fn formats(&self) -> &[gst_video::VideoFormat] {
        &self.binding().formats
    }

    pub fn supports_format(&self, format: gst_video::VideoFormat) -> bool {
        let formats = self.formats();
        formats.is_empty() || formats.contains(&format)
    }
}

/// Display an allocator is bound to, `None` for foreign allocators.
pub fn allocator_display(allocator: &gst::Allocator) -> Option<VaDisplay> {
    allocator
        .downcast_ref::<VaAllocator>()
        .map(|a| a.display().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::DummyDevice;

    #[test]
    fn allocator_affinity() {
        gst::init().unwrap();

        let display = VaDisplay::new(DummyDevice::default());
        let allocator = VaAllocator::new(&display, AllocatorKind::Surface, &[]);
        assert_eq!(
            allocator_display(allocator.upcast_ref()),
            Some(display.clone())
        );
        assert!(allocator.supports_format(gst_video::VideoFormat::Nv12));
        assert!(allocator.upcast_ref::<gst::Allocator>().alloc(16, None).is_err());

        let sysmem = gst::Allocator::find(None).unwrap();
        assert_eq!(allocator_display(&sysmem), None);
    }
}
