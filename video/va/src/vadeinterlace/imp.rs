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
use gst_base::subclass::base_transform::GenerateOutputSuccess;
use gst_base::subclass::prelude::*;
use gst_video::prelude::*;

use std::sync::{Arc, LazyLock, Mutex};

use super::Method;
use crate::caps::{self, MemoryFeature, VaVideoInfo};
use crate::deinterlace::DeinterlaceWindow;
use crate::device::Entrypoint;
use crate::display::{self, VaDisplay};
use crate::filter::Filter;
use crate::importer::{BufferImporter, CachedPoolProvider, ImportError, ImportedBuffer};
use crate::negotiate::{self, AllocationRequest, ConsumerKind, Negotiator};
use crate::sample::Sample;

static CAT: LazyLock<gst::DebugCategory> = LazyLock::new(|| {
    gst::DebugCategory::new(
        "vadeinterlace",
        gst::DebugColorFlags::empty(),
        Some("VA deinterlacer"),
    )
});

/// Outcome of rendering the next field of the window.
enum Field {
    Rendered(gst::Buffer),
    /// The device failed on it.
    Failed,
    /// Nothing left to render until more input arrives.
    Pending,
}

#[derive(Default)]
struct State {
    filter: Option<Arc<Filter>>,
    window: DeinterlaceWindow<ImportedBuffer>,
    in_info: Option<VaVideoInfo>,
    out_info: Option<VaVideoInfo>,
    reconfigure: bool,
}

#[derive(Properties)]
#[properties(wrapper_type = super::VaDeinterlace)]
pub struct VaDeinterlace {
    #[property(
        name = "method",
        nick = "Method",
        blurb = "Deinterlace Method",
        get,
        set = Self::set_method,
        builder(Method::Bob)
    )]
    method: Mutex<Method>,
    state: Mutex<State>,
    display: Mutex<Option<VaDisplay>>,
    negotiator: Mutex<Negotiator>,
    import_pool: CachedPoolProvider,
}

impl Default for VaDeinterlace {
    fn default() -> Self {
        VaDeinterlace {
            method: Mutex::new(Method::default()),
            state: Mutex::new(State::default()),
            display: Mutex::new(None),
            negotiator: Mutex::new(Negotiator::new(ConsumerKind::Transform)),
            import_pool: CachedPoolProvider::new(),
        }
    }
}

impl VaDeinterlace {
    fn set_method(&self, method: Method) {
        gst::info!(CAT, imp = self, "Changing method to {:?}", method);
        *self.method.lock().unwrap() = method;
        self.state.lock().unwrap().reconfigure = true;
    }

    fn filter(&self) -> Option<Arc<Filter>> {
        self.state.lock().unwrap().filter.clone()
    }

    fn display(&self) -> Option<VaDisplay> {
        self.display.lock().unwrap().clone()
    }

    /// Queues the deinterlacing filter for the current method and sizes
    /// the reference window after it.
    fn configure_window(&self, state: &mut State) -> Result<(), gst::ErrorMessage> {
        let method = *self.method.lock().unwrap();
        let Some(filter) = state.filter.clone() else {
            return Ok(());
        };
        state.reconfigure = false;

        if let Err(err) = filter.drop_filter_buffers() {
            gst::warning!(CAT, imp = self, "Failed to drop filters: {}", err);
        }
        let (forward, backward) = filter.add_deinterlace_buffer(method.into()).map_err(|err| {
            gst::error_msg!(
                gst::StreamError::Failed,
                ["Can't deinterlace with {:?}: {}", method, err]
            )
        })?;
        state
            .window
            .configure(forward, backward)
            .map_err(|err| gst::error_msg!(gst::StreamError::Failed, ["{}", err]))?;

        gst::info!(
            CAT,
            imp = self,
            "Deinterlacing with {:?}, {} forward and {} backward references",
            method,
            forward,
            backward
        );
        Ok(())
    }

    fn reconfigure_if_needed(&self) -> Result<(), gst::FlowError> {
        {
            let mut state = self.state.lock().unwrap();
            if !state.reconfigure {
                return Ok(());
            }
            self.configure_window(&mut state).map_err(|err| {
                self.post_error_message(err);
                gst::FlowError::Error
            })?;
        }

        // The window depth, and with it the latency, may have changed
        let _ = self
            .obj()
            .post_message(gst::message::Latency::builder().src(&*self.obj()).build());
        Ok(())
    }

    /// Imports `inbuf` and adds it to the reference window.
    fn queue_input(&self, inbuf: gst::Buffer) -> Result<(), gst::FlowError> {
        self.reconfigure_if_needed()?;

        let (filter, in_info) = {
            let state = self.state.lock().unwrap();
            match (&state.filter, &state.in_info) {
                (Some(filter), Some(in_info)) => (filter.clone(), in_info.clone()),
                _ => {
                    gst::element_imp_error!(
                        self,
                        gst::CoreError::NotImplemented,
                        ["Unknown format"]
                    );
                    return Err(gst::FlowError::NotNegotiated);
                }
            }
        };
        let display = filter.display().clone();

        let obj = self.obj();
        let importer = BufferImporter {
            element: obj.upcast_ref(),
            display: &display,
            info: &in_info,
            entrypoint: Entrypoint::VideoProc,
            direction: gst::PadDirection::Sink,
            provider: &self.import_pool,
        };
        let imported = match importer.import(&inbuf) {
            Ok(imported) => imported,
            Err(ImportError::InvalidBuffer) => return Ok(()),
            Err(ImportError::Flow(err)) => return Err(err),
        };

        let reverse = obj.segment().rate() < 0.0;
        let mut state = self.state.lock().unwrap();
        state.window.set_reverse(reverse);
        state.window.push(imported);

        Ok(())
    }

    fn render_field(&self) -> Result<Field, gst::FlowError> {
        let (job, filter, out_info) = {
            let mut state = self.state.lock().unwrap();
            let Some(job) = state.window.next_field() else {
                return Ok(Field::Pending);
            };
            match (&state.filter, &state.out_info) {
                (Some(filter), Some(out_info)) => (job, filter.clone(), out_info.clone()),
                _ => return Err(gst::FlowError::NotNegotiated),
            }
        };

        let negotiated = self
            .negotiator
            .lock()
            .unwrap()
            .negotiated()
            .cloned()
            .ok_or(gst::FlowError::NotNegotiated)?;
        let mut outbuf = negotiated.acquire_surface_buffer()?;
        let surface = filter
            .display()
            .buffer_surface(&outbuf)
            .ok_or(gst::FlowError::Error)?;

        let result = {
            let forward = job.forward.iter().map(ImportedBuffer::surface).collect();
            let backward = job.backward.iter().map(ImportedBuffer::surface).collect();
            let src = Sample::from_imported(&job.current)
                .with_flags(job.field)
                .with_references(forward, backward);
            let dst = Sample::new(&outbuf, surface);
            filter.process(&src, &dst)
        };

        if let Err(err) = result {
            gst::element_imp_error!(
                self,
                gst::LibraryError::Failed,
                ["Failed to deinterlace field: {}", err]
            );
            return Ok(Field::Failed);
        }

        {
            let outref = outbuf.make_mut();
            outref.set_pts(job.pts);
            outref.set_duration(job.duration);
            outref.unset_video_flags(
                gst_video::VideoBufferFlags::INTERLACED
                    | gst_video::VideoBufferFlags::TFF
                    | gst_video::VideoBufferFlags::RFF
                    | gst_video::VideoBufferFlags::ONEFIELD,
            );
        }
        gst::trace!(
            CAT,
            imp = self,
            "{} field at {:?} of {}x{}",
            if job.second_field { "Second" } else { "First" },
            job.pts,
            out_info.width(),
            out_info.height()
        );

        negotiated.output_buffer(outbuf).map(Field::Rendered)
    }
}

/// Output frame rate of interlaced input: one frame per field.
fn field_rate(caps: &gst::CapsRef) -> Option<gst::Fraction> {
    let fps = caps.structure(0)?.get::<gst::Fraction>("framerate").ok()?;
    if fps.numer() <= 0 {
        return Some(fps);
    }
    Some(gst::Fraction::new(
        fps.numer().saturating_mul(2),
        fps.denom(),
    ))
}

#[glib::object_subclass]
impl ObjectSubclass for VaDeinterlace {
    const NAME: &'static str = "GstVaRsDeinterlace";
    type Type = super::VaDeinterlace;
    type ParentType = gst_base::BaseTransform;
}

#[glib::derived_properties]
impl ObjectImpl for VaDeinterlace {}

impl GstObjectImpl for VaDeinterlace {}

impl ElementImpl for VaDeinterlace {
    fn metadata() -> Option<&'static gst::subclass::ElementMetadata> {
        static ELEMENT_METADATA: LazyLock<gst::subclass::ElementMetadata> = LazyLock::new(|| {
            gst::subclass::ElementMetadata::new(
                "VA-API Deinterlacer",
                "Filter/Effect/Video/Deinterlace",
                "VA-API based deinterlacer",
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
                gst::PadTemplate::new(
                    "sink",
                    gst::PadDirection::Sink,
                    gst::PadPresence::Always,
                    &caps,
                )
                .unwrap(),
            ]
        });

        PAD_TEMPLATES.as_ref()
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

impl BaseTransformImpl for VaDeinterlace {
    const MODE: gst_base::subclass::BaseTransformMode =
        gst_base::subclass::BaseTransformMode::NeverInPlace;
    const PASSTHROUGH_ON_SAME_CAPS: bool = false;
    const TRANSFORM_IP_ON_PASSTHROUGH: bool = false;

    fn start(&self) -> Result<(), gst::ErrorMessage> {
        let display = display::ensure_display(&*self.obj(), &self.display)?;

        let filter = Filter::new(&display);
        filter.open().map_err(|err| {
            gst::error_msg!(
                gst::ResourceError::OpenRead,
                ["Failed to open video processing filter: {}", err]
            )
        })?;
        if filter.deinterlace_methods().is_empty() {
            return Err(gst::error_msg!(
                gst::ResourceError::Settings,
                ["Device can't deinterlace"]
            ));
        }

        *self.state.lock().unwrap() = State {
            filter: Some(Arc::new(filter)),
            reconfigure: true,
            ..Default::default()
        };

        gst::info!(CAT, imp = self, "Started");
        Ok(())
    }

    fn stop(&self) -> Result<(), gst::ErrorMessage> {
        {
            let mut negotiator = self.negotiator.lock().unwrap();
            if let Some(negotiated) = negotiator.negotiated() {
                let _ = negotiated.pool.set_active(false);
            }
            negotiator.reset();
        }

        let filter = {
            let mut state = self.state.lock().unwrap();
            let filter = state.filter.take();
            *state = State::default();
            filter
        };
        if let Some(filter) = filter {
            filter.close();
        }
        self.import_pool.clear();

        gst::info!(CAT, imp = self, "Stopped");
        Ok(())
    }

    fn query(&self, direction: gst::PadDirection, query: &mut gst::QueryRef) -> bool {
        if query.type_() == gst::QueryType::Context {
            let display = self.display();
            if display::handle_context_query(query, display.as_ref()) {
                return true;
            }
        }

        let ret = BaseTransformImplExt::parent_query(self, direction, query);
        if ret && direction == gst::PadDirection::Src && !self.obj().is_passthrough() {
            if let gst::QueryViewMut::Latency(q) = query.view_mut() {
                if let Some(latency) = self.state.lock().unwrap().window.latency() {
                    let (live, min, max) = q.result();
                    gst::debug!(CAT, imp = self, "Adding {} of latency", latency);
                    q.set(live, min + latency, max.map(|max| max + latency));
                }
            }
        }

        ret
    }

    fn transform_caps(
        &self,
        direction: gst::PadDirection,
        caps: &gst::Caps,
        filter: Option<&gst::Caps>,
    ) -> Option<gst::Caps> {
        let mut ret = gst::Caps::new_empty();
        {
            let ret = ret.get_mut().unwrap();
            for (s, features) in caps.iter_with_features() {
                let mut s = s.to_owned();
                if !features.is_any() {
                    s.remove_fields(["interlace-mode", "field-order", "framerate"]);
                }
                ret.append_structure_full(s, Some(features.to_owned()));
            }
        }

        for feature in MemoryFeature::ALL {
            let tmp = caps::caps_with_feature(&ret, feature);
            if !tmp.is_subset(&ret) {
                ret.make_mut().append(tmp);
            }
        }

        if let Some(filter) = filter {
            ret = filter.intersect_with_mode(&ret, gst::CapsIntersectMode::First);
        }

        gst::debug!(
            CAT,
            imp = self,
            "Transformed {} in direction {:?} into {}",
            caps,
            direction,
            ret
        );
        Some(ret)
    }

    fn fixate_caps(
        &self,
        direction: gst::PadDirection,
        caps: &gst::Caps,
        othercaps: gst::Caps,
    ) -> gst::Caps {
        if direction != gst::PadDirection::Sink || othercaps.is_empty() {
            return self.parent_fixate_caps(direction, caps, othercaps);
        }
        let Some(ins) = caps.structure(0) else {
            return self.parent_fixate_caps(direction, caps, othercaps);
        };

        // Stay in the input's memory when possible
        let in_features = caps.features(0).map(|f| f.to_owned());
        let idx = othercaps
            .iter_with_features()
            .position(|(_, f)| in_features.as_deref().is_some_and(|g| f.is_equal(g)))
            .unwrap_or(0);
        let (Some(s), Some(features)) = (othercaps.structure(idx), othercaps.features(idx)) else {
            return self.parent_fixate_caps(direction, caps, othercaps);
        };
        let mut s = s.to_owned();
        let features = features.to_owned();

        for field in ["format", "drm-format"] {
            if let Ok(value) = ins.get::<&str>(field) {
                if s.has_field(field) {
                    s.fixate_field_str(field, value);
                }
            }
        }
        for field in ["width", "height"] {
            if let Ok(value) = ins.get::<i32>(field) {
                s.fixate_field_nearest_int(field, value);
            }
        }

        let interlaced = VaVideoInfo::from_caps(caps).is_ok_and(|info| info.is_interlaced());
        if interlaced {
            s.set("interlace-mode", "progressive");
            if let Some(fps) = field_rate(caps) {
                s.set("framerate", fps);
            }
        } else {
            for field in ["interlace-mode", "framerate"] {
                if let Ok(value) = ins.value(field) {
                    s.set_value(field, value.clone());
                }
            }
        }

        let mut result = gst::Caps::new_empty();
        result
            .get_mut()
            .unwrap()
            .append_structure_full(s, Some(features));
        result.fixate();

        gst::debug!(CAT, imp = self, "Fixated {} to {}", othercaps, result);
        result
    }

    fn set_caps(&self, incaps: &gst::Caps, outcaps: &gst::Caps) -> Result<(), gst::LoggableError> {
        let in_info = VaVideoInfo::from_caps(incaps)
            .map_err(|_| gst::loggable_error!(CAT, "Failed to parse input caps {}", incaps))?;
        let out_info = VaVideoInfo::from_caps(outcaps)
            .map_err(|_| gst::loggable_error!(CAT, "Failed to parse output caps {}", outcaps))?;
        let filter = self
            .filter()
            .ok_or_else(|| gst::loggable_error!(CAT, "Filter not open"))?;

        filter
            .set_video_info(&in_info, &out_info)
            .map_err(|err| gst::loggable_error!(CAT, "Failed to set video info: {}", err))?;

        let interlaced = in_info.is_interlaced();
        let fps = in_info.fps();
        let field_duration = (fps.numer() > 0)
            .then(|| {
                gst::ClockTime::SECOND.mul_div_floor(fps.denom() as u64, fps.numer() as u64 * 2)
            })
            .flatten();

        {
            let mut state = self.state.lock().unwrap();
            state.window.set_default_duration(field_duration);
            state.window.set_top_field_first(
                in_info.field_order() != gst_video::VideoFieldOrder::BottomFieldFirst,
            );

            if interlaced {
                self.configure_window(&mut state).map_err(|err| {
                    let loggable = gst::loggable_error!(CAT, "{}", err);
                    self.post_error_message(err);
                    loggable
                })?;
            } else {
                state.window.reset();
            }

            state.in_info = Some(in_info);
            state.out_info = Some(out_info);
        }

        gst::debug!(
            CAT,
            imp = self,
            "{}",
            if interlaced {
                "Deinterlacing"
            } else {
                "Progressive input, passing through"
            }
        );
        self.obj().set_passthrough(!interlaced);

        Ok(())
    }

    fn generate_output(&self) -> Result<GenerateOutputSuccess, gst::FlowError> {
        if self.obj().is_passthrough() {
            return self.parent_generate_output();
        }

        if let Some(inbuf) = self.take_queued_buffer() {
            self.queue_input(inbuf)?;
        }

        loop {
            match self.render_field()? {
                Field::Pending => return Ok(GenerateOutputSuccess::NoOutput),
                Field::Rendered(buffer) => return Ok(GenerateOutputSuccess::Buffer(buffer)),
                Field::Failed => (),
            }
        }
    }

    fn sink_event(&self, event: gst::Event) -> bool {
        if let gst::EventView::FlushStop(_) = event.view() {
            gst::debug!(CAT, imp = self, "Flushing reference window");
            self.state.lock().unwrap().window.reset();
        }

        self.parent_sink_event(event)
    }

    fn propose_allocation(
        &self,
        decide_query: Option<&gst::query::Allocation>,
        query: &mut gst::query::Allocation,
    ) -> Result<(), gst::LoggableError> {
        if self.obj().is_passthrough() {
            return self.parent_propose_allocation(decide_query, query);
        }

        let display = self
            .display()
            .ok_or_else(|| gst::loggable_error!(CAT, "No display"))?;
        // The window holds on to this many input buffers
        let depth = self.state.lock().unwrap().window.depth() as u32;
        negotiate::propose_allocation(&display, query, depth, false)
    }

    fn decide_allocation(
        &self,
        query: &mut gst::query::Allocation,
    ) -> Result<(), gst::LoggableError> {
        let display = self
            .display()
            .ok_or_else(|| gst::loggable_error!(CAT, "No display"))?;
        let request = AllocationRequest {
            // The window keeps this many frames besides the one written to
            min_buffers: self.state.lock().unwrap().window.depth() as u32,
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

    fn unit_size(&self, caps: &gst::Caps) -> Option<usize> {
        VaVideoInfo::from_caps(caps).ok().map(|info| info.size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_rate_doubles_framerate() {
        gst::init().unwrap();

        let caps = gst::Caps::builder("video/x-raw")
            .field("framerate", gst::Fraction::new(30000, 1001))
            .build();
        assert_eq!(field_rate(&caps), Some(gst::Fraction::new(60000, 1001)));

        let variable = gst::Caps::builder("video/x-raw")
            .field("framerate", gst::Fraction::new(0, 1))
            .build();
        assert_eq!(field_rate(&variable), Some(gst::Fraction::new(0, 1)));
    }
}
