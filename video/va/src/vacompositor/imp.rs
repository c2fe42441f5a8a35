// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use gst::glib;
use gst::glib::Properties;
use gst::prelude::*;
use gst::subclass::prelude::*;
use gst_base::prelude::*;
use gst_base::subclass::prelude::*;
use gst_video::prelude::*;
use gst_video::subclass::prelude::*;

use std::sync::{Arc, LazyLock, Mutex};

use crate::caps::{self, VaVideoInfo};
use crate::device::Entrypoint;
use crate::display::{self, VaDisplay};
use crate::filter::Filter;
use crate::importer::BufferImporter;
use crate::negotiate::{self, AllocationRequest, ConsumerKind, Negotiator};
use crate::sample::{CompositorSamples, PadInput};
use crate::vapostproc::ScaleMethod;

static CAT: LazyLock<gst::DebugCategory> = LazyLock::new(|| {
    gst::DebugCategory::new(
        "vacompositor",
        gst::DebugColorFlags::empty(),
        Some("VA video compositor"),
    )
});

const DEFAULT_WIDTH: i32 = 320;
const DEFAULT_HEIGHT: i32 = 240;

#[derive(Properties)]
#[properties(wrapper_type = super::VaCompositor)]
pub struct VaCompositor {
    #[property(
        name = "scale-method",
        nick = "Scale Method",
        blurb = "Scale method to use",
        get,
        set = Self::set_scale_method,
        builder(ScaleMethod::Default)
    )]
    scale_method: Mutex<ScaleMethod>,
    display: Mutex<Option<VaDisplay>>,
    filter: Mutex<Option<Arc<Filter>>>,
    negotiator: Mutex<Negotiator>,
}

impl Default for VaCompositor {
    fn default() -> Self {
        VaCompositor {
            scale_method: Mutex::new(ScaleMethod::default()),
            display: Mutex::new(None),
            filter: Mutex::new(None),
            negotiator: Mutex::new(Negotiator::new(ConsumerKind::Compositor)),
        }
    }
}

impl VaCompositor {
    fn set_scale_method(&self, method: ScaleMethod) {
        gst::info!(CAT, imp = self, "Changing scale method to {:?}", method);
        *self.scale_method.lock().unwrap() = method;
        if let Some(filter) = self.filter() {
            filter.set_scale_method(method.into());
        }
    }

    fn filter(&self) -> Option<Arc<Filter>> {
        self.filter.lock().unwrap().clone()
    }

    fn display(&self) -> Option<VaDisplay> {
        self.display.lock().unwrap().clone()
    }

    /// Size of the area covered by every input.
    fn extents(&self) -> (i32, i32, Option<gst::Fraction>) {
        let obj = self.obj();
        let mut width = 0;
        let mut height = 0;
        let mut fps: Option<gst::Fraction> = None;

        for pad in obj.sink_pads() {
            let Ok(pad) = pad.downcast::<super::VaCompositorPad>() else {
                continue;
            };
            let Some(info) = pad.video_info() else {
                continue;
            };

            let w = match pad.width() {
                0 => info.width() as i32,
                w => w,
            };
            let h = match pad.height() {
                0 => info.height() as i32,
                h => h,
            };
            width = width.max(w.saturating_add(pad.xpos().max(0)));
            height = height.max(h.saturating_add(pad.ypos().max(0)));

            let pad_fps = info.fps();
            if pad_fps.numer() > 0 && fps.map_or(true, |fps| pad_fps > fps) {
                fps = Some(pad_fps);
            }
        }

        (width, height, fps)
    }

    /// Copies a composed scratch surface into the buffer being pushed.
    fn copy_output(
        &self,
        scratch: &gst::Buffer,
        outbuf: &mut gst::BufferRef,
        info: &gst_video::VideoInfo,
    ) -> Result<(), gst::FlowError> {
        let src = gst_video::VideoFrameRef::from_buffer_ref_readable(scratch.as_ref(), info)
            .map_err(|_| gst::FlowError::Error)?;
        let mut dst = gst_video::VideoFrameRef::from_buffer_ref_writable(outbuf, info)
            .map_err(|_| gst::FlowError::Error)?;
        src.copy(&mut dst).map_err(|err| {
            gst::error!(CAT, imp = self, "Failed to copy output frame: {}", err);
            gst::FlowError::Error
        })
    }
}

#[glib::object_subclass]
impl ObjectSubclass for VaCompositor {
    const NAME: &'static str = "GstVaRsCompositor";
    type Type = super::VaCompositor;
    type ParentType = gst_video::VideoAggregator;
    type Interfaces = (gst::ChildProxy,);
}

#[glib::derived_properties]
impl ObjectImpl for VaCompositor {}

impl GstObjectImpl for VaCompositor {}

impl ElementImpl for VaCompositor {
    fn metadata() -> Option<&'static gst::subclass::ElementMetadata> {
        static ELEMENT_METADATA: LazyLock<gst::subclass::ElementMetadata> = LazyLock::new(|| {
            gst::subclass::ElementMetadata::new(
                "VA-API Video Compositor",
                "Filter/Editor/Video/Compositor/Hardware",
                "VA-API based video compositor",
                "The gst-plugin-va authors",
            )
        });

        Some(&*ELEMENT_METADATA)
    }

    fn pad_templates() -> &'static [gst::PadTemplate] {
        static PAD_TEMPLATES: LazyLock<Vec<gst::PadTemplate>> = LazyLock::new(|| {
            let caps = caps::template_caps(&caps::known_formats());

            vec![
                gst::PadTemplate::new(
                    "src",
                    gst::PadDirection::Src,
                    gst::PadPresence::Always,
                    &caps,
                )
                .unwrap(),
                gst::PadTemplate::with_gtype(
                    "sink_%u",
                    gst::PadDirection::Sink,
                    gst::PadPresence::Request,
                    &caps,
                    super::VaCompositorPad::static_type(),
                )
                .unwrap(),
            ]
        });

        PAD_TEMPLATES.as_ref()
    }

    fn request_new_pad(
        &self,
        templ: &gst::PadTemplate,
        name: Option<&str>,
        caps: Option<&gst::Caps>,
    ) -> Option<gst::Pad> {
        let element = self.obj();
        let pad = self.parent_request_new_pad(templ, name, caps)?;
        element.child_added(&pad, &pad.name());
        Some(pad)
    }

    fn release_pad(&self, pad: &gst::Pad) {
        let element = self.obj();
        if let Some(pad) = pad.downcast_ref::<super::VaCompositorPad>() {
            pad.imp().import_pool.clear();
        }
        element.child_removed(pad, &pad.name());
        self.parent_release_pad(pad);
    }

    fn set_context(&self, context: &gst::Context) {
        display::set_context_display(&*self.obj(), context, &self.display);
        self.parent_set_context(context)
    }

    fn change_state(
        &self,
        transition: gst::StateChange,
    ) -> Result<gst::StateChangeSuccess, gst::StateChangeError> {
        if transition == gst::StateChange::NullToReady {
            display::ensure_display(&*self.obj(), &self.display).map_err(|err| {
                self.post_error_message(err);
                gst::StateChangeError
            })?;
        }

        self.parent_change_state(transition)
    }
}

impl AggregatorImpl for VaCompositor {
    fn start(&self) -> Result<(), gst::ErrorMessage> {
        let display = display::ensure_display(&*self.obj(), &self.display)?;

        let filter = Filter::new(&display);
        filter.open().map_err(|err| {
            gst::error_msg!(
                gst::ResourceError::OpenRead,
                ["Failed to open video processing filter: {}", err]
            )
        })?;
        if !filter.has_compose() {
            filter.close();
            return Err(gst::error_msg!(
                gst::ResourceError::Settings,
                ["Device can't compose"]
            ));
        }
        filter.set_scale_method((*self.scale_method.lock().unwrap()).into());

        *self.filter.lock().unwrap() = Some(Arc::new(filter));
        gst::info!(CAT, imp = self, "Started");

        self.parent_start()
    }

    fn stop(&self) -> Result<(), gst::ErrorMessage> {
        {
            let mut negotiator = self.negotiator.lock().unwrap();
            if let Some(negotiated) = negotiator.negotiated() {
                let _ = negotiated.pool.set_active(false);
            }
            negotiator.reset();
        }

        for pad in self.obj().sink_pads() {
            if let Ok(pad) = pad.downcast::<super::VaCompositorPad>() {
                pad.imp().import_pool.clear();
            }
        }

        if let Some(filter) = self.filter.lock().unwrap().take() {
            filter.close();
        }

        gst::info!(CAT, imp = self, "Stopped");
        self.parent_stop()
    }

    fn src_query(&self, query: &mut gst::QueryRef) -> bool {
        if query.type_() == gst::QueryType::Context
            && display::handle_context_query(query, self.display().as_ref())
        {
            return true;
        }

        self.parent_src_query(query)
    }

    fn sink_query(
        &self,
        aggregator_pad: &gst_base::AggregatorPad,
        query: &mut gst::QueryRef,
    ) -> bool {
        use gst::QueryViewMut;

        if query.type_() == gst::QueryType::Context {
            if display::handle_context_query(query, self.display().as_ref()) {
                return true;
            }
            return self.parent_sink_query(aggregator_pad, query);
        }

        match query.view_mut() {
            QueryViewMut::Caps(q) => {
                let caps = aggregator_pad.pad_template_caps();
                let caps = if let Some(filter) = q.filter() {
                    filter.intersect_with_mode(&caps, gst::CapsIntersectMode::First)
                } else {
                    caps
                };
                q.set_result(&caps);

                true
            }
            QueryViewMut::AcceptCaps(q) => {
                let caps = q.caps();
                let template_caps = aggregator_pad.pad_template_caps();
                let res = caps.is_subset(&template_caps);
                q.set_result(res);

                true
            }
            _ => self.parent_sink_query(aggregator_pad, query),
        }
    }

    fn fixate_src_caps(&self, caps: gst::Caps) -> gst::Caps {
        let (width, height, fps) = self.extents();
        gst::debug!(
            CAT,
            imp = self,
            "Inputs cover {}x{} at {:?}",
            width,
            height,
            fps
        );

        let first = caps
            .iter_with_features()
            .next()
            .map(|(s, features)| (s.to_owned(), features.to_owned()));
        let Some((mut s, features)) = first else {
            return caps;
        };

        s.fixate_field_nearest_int("width", if width > 0 { width } else { DEFAULT_WIDTH });
        s.fixate_field_nearest_int("height", if height > 0 { height } else { DEFAULT_HEIGHT });
        if s.has_field("framerate") {
            s.fixate_field_nearest_fraction(
                "framerate",
                fps.unwrap_or_else(|| gst::Fraction::new(25, 1)),
            );
        }
        if s.has_field("pixel-aspect-ratio") {
            s.fixate_field_nearest_fraction("pixel-aspect-ratio", gst::Fraction::new(1, 1));
        }

        let mut result = gst::Caps::new_empty();
        result
            .get_mut()
            .unwrap()
            .append_structure_full(s, Some(features));
        result.fixate();

        gst::debug!(CAT, imp = self, "Fixated caps {}", result);
        result
    }

    fn propose_allocation(
        &self,
        _pad: &gst_base::AggregatorPad,
        _decide_query: Option<&gst::query::Allocation>,
        query: &mut gst::query::Allocation,
    ) -> Result<(), gst::LoggableError> {
        let display = self
            .display()
            .ok_or_else(|| gst::loggable_error!(CAT, "No display"))?;
        negotiate::propose_allocation(&display, query, 0, false)
    }

    fn decide_allocation(
        &self,
        query: &mut gst::query::Allocation,
    ) -> Result<(), gst::LoggableError> {
        let display = self
            .display()
            .ok_or_else(|| gst::loggable_error!(CAT, "No display"))?;
        let request = AllocationRequest {
            surface_formats: self
                .filter()
                .map(|f| f.surface_formats())
                .unwrap_or_default(),
            ..Default::default()
        };

        let negotiated = self
            .negotiator
            .lock()
            .unwrap()
            .decide_allocation(&display, query, &request)?;
        gst::debug!(
            CAT,
            imp = self,
            "Output pool of {}..{} buffers, copying frames: {}",
            negotiated.min,
            negotiated.max,
            negotiated.copy_frames
        );

        Ok(())
    }
}

impl VideoAggregatorImpl for VaCompositor {
    fn aggregate_frames(
        &self,
        token: &gst_video::subclass::AggregateFramesToken,
        outbuf: &mut gst::BufferRef,
    ) -> Result<gst::FlowSuccess, gst::FlowError> {
        let obj = self.obj();
        let out_info = obj.video_info().ok_or(gst::FlowError::NotNegotiated)?;
        let filter = self.filter().ok_or(gst::FlowError::NotNegotiated)?;
        let display = filter.display().clone();

        let mut inputs = Vec::new();
        for pad in obj.sink_pads() {
            let Ok(pad) = pad.downcast::<super::VaCompositorPad>() else {
                continue;
            };
            if pad.is_inactive() {
                continue;
            }
            let Some(buffer) = pad.current_buffer(token) else {
                continue;
            };
            let Some(info) = pad
                .current_caps()
                .and_then(|caps| VaVideoInfo::from_caps(&caps).ok())
            else {
                gst::warning!(CAT, obj = pad, "No caps for the current buffer");
                continue;
            };

            inputs.push(PadInput {
                width: info.width(),
                height: info.height(),
                xpos: pad.xpos(),
                ypos: pad.ypos(),
                out_width: pad.width().max(0) as u32,
                out_height: pad.height().max(0) as u32,
                alpha: pad.alpha(),
                source: (pad, buffer, info),
            });
        }
        gst::trace!(CAT, imp = self, "Composing {} inputs", inputs.len());

        let samples = CompositorSamples::new(
            inputs,
            out_info.width(),
            out_info.height(),
            |(pad, buffer, info): (super::VaCompositorPad, gst::Buffer, VaVideoInfo)| {
                let importer = BufferImporter {
                    element: obj.upcast_ref(),
                    display: &display,
                    info: &info,
                    entrypoint: Entrypoint::VideoProc,
                    direction: gst::PadDirection::Sink,
                    provider: &pad.imp().import_pool,
                };
                importer
                    .import(&buffer)
                    .inspect_err(|err| {
                        gst::warning!(CAT, obj = pad, "Failed to import buffer: {}", err)
                    })
                    .ok()
            },
        );

        let (surface, scratch) = match display.buffer_surface(outbuf) {
            Some(surface) => (surface, None),
            None => {
                let scratch = self
                    .negotiator
                    .lock()
                    .unwrap()
                    .negotiated()
                    .ok_or(gst::FlowError::NotNegotiated)?
                    .acquire_surface_buffer()?;
                let surface = display
                    .buffer_surface(&scratch)
                    .ok_or(gst::FlowError::Error)?;
                (surface, Some(scratch))
            }
        };

        if let Err(err) = filter.compose(surface, samples) {
            gst::element_imp_error!(
                self,
                gst::LibraryError::Failed,
                ["Failed to compose frame: {}", err]
            );
            return Err(gst::FlowError::Error);
        }

        if let Some(scratch) = scratch {
            self.copy_output(&scratch, outbuf, &out_info)?;
        }

        Ok(gst::FlowSuccess::Ok)
    }
}

impl ChildProxyImpl for VaCompositor {
    fn children_count(&self) -> u32 {
        let object = self.obj();
        object.num_sink_pads() as u32
    }

    fn child_by_name(&self, name: &str) -> Option<glib::Object> {
        let object = self.obj();
        object
            .sink_pads()
            .into_iter()
            .find(|p| p.name() == name)
            .map(|p| p.upcast())
    }

    fn child_by_index(&self, index: u32) -> Option<glib::Object> {
        let object = self.obj();
        object
            .sink_pads()
            .into_iter()
            .nth(index as usize)
            .map(|p| p.upcast())
    }
}
