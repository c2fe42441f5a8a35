// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use gst::glib;
use gst::prelude::*;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock, Mutex, Weak};

use crate::device::{Device, SurfaceId};
use crate::error::VaError;

static CAT: LazyLock<gst::DebugCategory> = LazyLock::new(|| {
    gst::DebugCategory::new(
        "vadisplay",
        gst::DebugColorFlags::empty(),
        Some("VA display"),
    )
});

pub const CONTEXT_TYPE: &str = "gst.va.display.handle";
const CONTEXT_FIELD: &str = "va-display";

// Guards binding surfaces over DMA-buf memory, which can be shared by
// several elements after a tee.
static IMPORT_LOCK: ReentrantMutex<()> = parking_lot::const_reentrant_mutex(());

pub fn import_lock() -> ReentrantMutexGuard<'static, ()> {
    IMPORT_LOCK.lock()
}

// First memory of every buffer a pool exported as DMA-buf, and the display
// whose surface it is.
static EXPORTS: LazyLock<Mutex<HashMap<usize, Weak<Inner>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

pub type DeviceFactory = fn() -> Result<Box<dyn Device>, VaError>;

static DEVICE_FACTORY: Mutex<Option<DeviceFactory>> = Mutex::new(None);

/// Sets how elements open a display when none is provided by the pipeline.
pub fn register_device_factory(factory: DeviceFactory) {
    *DEVICE_FACTORY.lock().unwrap() = Some(factory);
}

pub fn open_default() -> Result<VaDisplay, VaError> {
    let factory = DEVICE_FACTORY.lock().unwrap().ok_or(VaError::NoDevice)?;
    Ok(VaDisplay::from_boxed(factory()?))
}

enum Binding {
    Pooled(SurfaceId),
    Imported(Weak<ImportedSurface>),
}

struct Inner {
    device: Box<dyn Device>,
    bindings: Mutex<HashMap<usize, Binding>>,
}

/// Shared handle to a device.
///
/// Cloning is cheap and all clones compare equal. This is the only object
/// meant to be shared between elements, through a `gst::Context`.
#[derive(Clone, glib::Boxed)]
#[boxed_type(name = "GstVaDisplayHandle")]
pub struct VaDisplay(Arc<Inner>);

impl PartialEq for VaDisplay {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for VaDisplay {}

impl fmt::Debug for VaDisplay {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("VaDisplay")
            .field("vendor", &self.0.device.vendor())
            .field("ptr", &Arc::as_ptr(&self.0))
            .finish()
    }
}

fn memory_key(buffer: &gst::BufferRef) -> Option<usize> {
    if buffer.n_memory() == 0 {
        return None;
    }
    Some(buffer.peek_memory(0).as_ptr() as usize)
}

impl VaDisplay {
    pub fn new(device: impl Device) -> Self {
        Self::from_boxed(Box::new(device))
    }

    pub fn from_boxed(device: Box<dyn Device>) -> Self {
        gst::debug!(CAT, "Opened display for {}", device.vendor());
        VaDisplay(Arc::new(Inner {
            device,
            bindings: Mutex::new(HashMap::new()),
        }))
    }

    pub fn device(&self) -> &dyn Device {
        self.0.device.as_ref()
    }

    pub fn to_context(&self) -> gst::Context {
        let mut context = gst::Context::new(CONTEXT_TYPE, true);
        {
            let context = context.get_mut().unwrap();
            let s = context.structure_mut();
            s.set(CONTEXT_FIELD, self);
        }
        context
    }

    pub fn from_context(context: &gst::Context) -> Option<VaDisplay> {
        if context.context_type() != CONTEXT_TYPE {
            return None;
        }
        context
            .structure()
            .get::<&VaDisplay>(CONTEXT_FIELD)
            .ok()
            .cloned()
    }

    /// Records that `memory` backs a pool allocated `surface`.
    pub fn bind_pooled(&self, memory: &gst::MemoryRef, surface: SurfaceId) {
        let key = memory.as_ptr() as usize;
        gst::trace!(CAT, "Binding surface {} to memory {:#x}", surface, key);
        self.0
            .bindings
            .lock()
            .unwrap()
            .insert(key, Binding::Pooled(surface));
    }

    /// Records that `memory` was exported from a surface of this display.
    pub fn register_export(&self, memory: &gst::MemoryRef) {
        let key = memory.as_ptr() as usize;
        EXPORTS
            .lock()
            .unwrap()
            .insert(key, Arc::downgrade(&self.0));
    }

    /// Display that exported `memory`, if it came out of a pool.
    pub fn exporting_display(memory: &gst::MemoryRef) -> Option<VaDisplay> {
        let key = memory.as_ptr() as usize;
        EXPORTS
            .lock()
            .unwrap()
            .get(&key)
            .and_then(Weak::upgrade)
            .map(VaDisplay)
    }

    pub fn unbind(&self, memory: &gst::MemoryRef) -> Option<SurfaceId> {
        let key = memory.as_ptr() as usize;
        EXPORTS.lock().unwrap().remove(&key);
        match self.0.bindings.lock().unwrap().remove(&key) {
            Some(Binding::Pooled(surface)) => Some(surface),
            Some(Binding::Imported(weak)) => weak.upgrade().map(|s| s.surface),
            None => None,
        }
    }

    /// Surface behind `buffer` on this display, if any.
    pub fn buffer_surface(&self, buffer: &gst::BufferRef) -> Option<SurfaceId> {
        let key = memory_key(buffer)?;
        match self.0.bindings.lock().unwrap().get(&key)? {
            Binding::Pooled(surface) => Some(*surface),
            Binding::Imported(weak) => weak.upgrade().map(|s| s.surface),
        }
    }

    /// Surface of a pool buffer of this display. Imported DMA-buf is not
    /// included, its surface must be held through [`ImportedSurface`].
    pub fn pooled_surface(&self, buffer: &gst::BufferRef) -> Option<SurfaceId> {
        let key = memory_key(buffer)?;
        match self.0.bindings.lock().unwrap().get(&key)? {
            Binding::Pooled(surface) => Some(*surface),
            Binding::Imported(_) => None,
        }
    }

    pub fn owns_buffer(&self, buffer: &gst::BufferRef) -> bool {
        self.buffer_surface(buffer).is_some()
    }

    /// Live import of `buffer`'s memory, if another importer already bound
    /// one.
    pub(crate) fn imported_surface(&self, buffer: &gst::BufferRef) -> Option<Arc<ImportedSurface>> {
        let key = memory_key(buffer)?;
        match self.0.bindings.lock().unwrap().get(&key)? {
            Binding::Imported(weak) => weak.upgrade(),
            Binding::Pooled(_) => None,
        }
    }

    pub(crate) fn register_import(
        &self,
        buffer: &gst::BufferRef,
        surface: SurfaceId,
    ) -> Option<Arc<ImportedSurface>> {
        let key = memory_key(buffer)?;
        let imported = Arc::new(ImportedSurface {
            display: self.clone(),
            key,
            surface,
        });
        self.0
            .bindings
            .lock()
            .unwrap()
            .insert(key, Binding::Imported(Arc::downgrade(&imported)));
        Some(imported)
    }
}

/// A surface bound over foreign DMA-buf memory. Destroyed with the last
/// reference.
pub struct ImportedSurface {
    display: VaDisplay,
    key: usize,
    surface: SurfaceId,
}

impl ImportedSurface {
    pub fn surface(&self) -> SurfaceId {
        self.surface
    }
}

impl fmt::Debug for ImportedSurface {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ImportedSurface")
            .field("surface", &self.surface)
            .finish()
    }
}

impl Drop for ImportedSurface {
    fn drop(&mut self) {
        {
            let mut bindings = self.display.0.bindings.lock().unwrap();
            let stale = matches!(
                bindings.get(&self.key),
                Some(Binding::Imported(weak)) if weak.upgrade().is_none()
            );
            if stale {
                bindings.remove(&self.key);
            }
        }

        if let Err(err) = self.display.device().destroy_surface(self.surface) {
            gst::warning!(CAT, "Failed to destroy imported surface {}: {}", self.surface, err);
        }
    }
}

/// Makes sure `element` has a display: the one already set, one from a
/// neighbour, or a new one from the registered device factory.
pub fn ensure_display<E: IsA<gst::Element>>(
    element: &E,
    slot: &Mutex<Option<VaDisplay>>,
) -> Result<VaDisplay, gst::ErrorMessage> {
    if let Some(display) = slot.lock().unwrap().clone() {
        return Ok(display);
    }

    let mut q = gst::query::Context::new(CONTEXT_TYPE);
    let answered = element
        .src_pads()
        .into_iter()
        .chain(element.sink_pads())
        .any(|pad| pad.peer_query(&mut q));
    if answered {
        if let Some(context) = q.context_owned() {
            element.set_context(&context);
        }
    } else {
        let _ = element.post_message(
            gst::message::NeedContext::builder(CONTEXT_TYPE)
                .src(element.upcast_ref::<gst::Element>())
                .build(),
        );
    }

    // set_context() may have been called synchronously by now
    if let Some(display) = slot.lock().unwrap().clone() {
        gst::debug!(CAT, obj = element, "Using shared display {:?}", display);
        return Ok(display);
    }

    let display = open_default().map_err(|err| {
        gst::error_msg!(
            gst::ResourceError::NotFound,
            ["Failed to open VA display: {}", err]
        )
    })?;
    gst::debug!(CAT, obj = element, "Sharing new display {:?}", display);
    *slot.lock().unwrap() = Some(display.clone());

    let context = display.to_context();
    element.set_context(&context);
    let _ = element.post_message(gst::message::HaveContext::builder(context).src(element.upcast_ref::<gst::Element>()).build());

    Ok(display)
}

/// Stores the display of a `gst.va.display.handle` context in `slot`.
/// A display that is already set is kept.
pub fn set_context_display<E: IsA<gst::Element>>(
    element: &E,
    context: &gst::Context,
    slot: &Mutex<Option<VaDisplay>>,
) {
    let Some(display) = VaDisplay::from_context(context) else {
        return;
    };

    let mut slot = slot.lock().unwrap();
    match &*slot {
        Some(current) if *current != display => {
            gst::warning!(
                CAT,
                obj = element,
                "Can't replace display {:?} with {:?}",
                current,
                display
            );
        }
        Some(_) => (),
        None => *slot = Some(display),
    }
}

/// Answers a context query with `display`.
pub fn handle_context_query(query: &mut gst::QueryRef, display: Option<&VaDisplay>) -> bool {
    let gst::QueryViewMut::Context(q) = query.view_mut() else {
        return false;
    };
    if q.context_type() != CONTEXT_TYPE {
        return false;
    }
    let Some(display) = display else {
        return false;
    };

    q.set_context(&display.to_context());
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::DummyDevice;

    #[test]
    fn context_roundtrip_keeps_identity() {
        gst::init().unwrap();

        let display = VaDisplay::new(DummyDevice::default());
        let context = display.to_context();
        assert_eq!(context.context_type(), CONTEXT_TYPE);
        assert_eq!(VaDisplay::from_context(&context), Some(display.clone()));

        let other = VaDisplay::new(DummyDevice::default());
        assert_ne!(other, display);
    }

    #[test]
    fn imported_binding_goes_away_with_last_reference() {
        gst::init().unwrap();

        let device = DummyDevice::default();
        let display = VaDisplay::new(device.clone());
        let surface = display
            .device()
            .create_surface(
                gst_video::VideoFormat::Nv12,
                64,
                64,
                crate::device::UsageHint::VPP_READ,
            )
            .unwrap();
        let buffer = gst::Buffer::with_size(64 * 96).unwrap();

        let first = display.register_import(&buffer, surface).unwrap();
        let second = display.imported_surface(&buffer).unwrap();
        assert_eq!(display.buffer_surface(&buffer), Some(surface));

        drop(first);
        assert_eq!(display.buffer_surface(&buffer), Some(surface));
        drop(second);
        assert_eq!(display.buffer_surface(&buffer), None);
        assert_eq!(device.live_surfaces(), 0);
    }
}
