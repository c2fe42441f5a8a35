// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use gst::glib;
use gst::prelude::*;
use gst_base::prelude::*;

use gstva::device::{Rect, Rotation};
use gstva::dummy::{Call, DummyDevice, FailPoint};
use gstva::VaDisplay;

fn init() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        gst::init().unwrap();
        gstva::plugin_register_static().expect("Failed to register va plugin");
        gstva::display::register_device_factory(dummy_device);
    });
}

fn dummy_device() -> Result<Box<dyn gstva::device::Device>, gstva::VaError> {
    Ok(Box::new(DummyDevice::default()))
}

fn input_info() -> gst_video::VideoInfo {
    gst_video::VideoInfo::builder(gst_video::VideoFormat::Nv12, 320, 240)
        .fps((30, 1))
        .build()
        .unwrap()
}

/// A vapostproc running on `device`.
fn postproc(device: &DummyDevice) -> gst::Element {
    let element = gst::ElementFactory::make("vapostproc").build().unwrap();
    element.set_context(&VaDisplay::new(device.clone()).to_context());
    element
}

fn harness(element: &gst::Element, sink_caps: &str) -> gst_check::Harness {
    let mut h = gst_check::Harness::with_element(element, Some("sink"), Some("src"));
    h.set_src_caps(input_info().to_caps().unwrap());
    h.set_sink_caps_str(sink_caps);
    h.play();
    h
}

fn frame(pts: u64) -> gst::Buffer {
    let mut buffer = gst::Buffer::with_size(input_info().size()).unwrap();
    {
        let buffer = buffer.get_mut().unwrap();
        buffer.set_pts(gst::ClockTime::from_mseconds(pts));
        buffer.set_duration(gst::ClockTime::from_mseconds(33));
    }
    buffer
}

fn output_size(h: &gst_check::Harness) -> (i32, i32) {
    let caps = h.sinkpad().unwrap().current_caps().unwrap();
    let s = caps.structure(0).unwrap();
    (s.get::<i32>("width").unwrap(), s.get::<i32>("height").unwrap())
}

#[test]
fn same_caps_pass_through() {
    init();

    let device = DummyDevice::default();
    let element = postproc(&device);
    let mut h = harness(&element, "video/x-raw,format=NV12,width=320,height=240");

    h.push(frame(0)).unwrap();
    let buffer = h.pull().unwrap();
    assert_eq!(buffer.pts(), Some(gst::ClockTime::ZERO));
    assert_eq!(buffer.size(), input_info().size());

    assert!(element
        .dynamic_cast_ref::<gst_base::BaseTransform>()
        .unwrap()
        .is_passthrough());
    assert!(device.rendered_pipelines().is_empty());
}

#[test]
fn scaling_renders_into_the_output_size() {
    init();

    let device = DummyDevice::default();
    let element = postproc(&device);
    let mut h = harness(&element, "video/x-raw,format=NV12,width=160,height=120");

    for pts in [0, 33] {
        h.push(frame(pts)).unwrap();
        let buffer = h.pull().unwrap();
        assert_eq!(buffer.pts(), Some(gst::ClockTime::from_mseconds(pts)));
    }
    assert_eq!(output_size(&h), (160, 120));

    let pipelines = device.rendered_pipelines();
    assert_eq!(pipelines.len(), 2);
    assert_eq!(pipelines[0].surface_region, Some(Rect::new(0, 0, 320, 240)));
    assert_eq!(pipelines[0].output_region, Some(Rect::new(0, 0, 160, 120)));
    assert!(pipelines[0].filters.is_empty());
}

#[test]
fn rotation_swaps_the_output_size() {
    init();

    let device = DummyDevice::default();
    let element = postproc(&device);
    element.set_property("video-direction", gst_video::VideoOrientationMethod::_90r);
    let mut h = harness(&element, "video/x-raw,format=NV12");

    h.push(frame(0)).unwrap();
    h.pull().unwrap();

    assert_eq!(output_size(&h), (240, 320));
    let pipelines = device.rendered_pipelines();
    assert_eq!(pipelines.len(), 1);
    assert_eq!(pipelines[0].rotation, Rotation::R90);
}

#[test]
fn video_direction_interface() {
    init();

    let element = postproc(&DummyDevice::default());
    let iface = glib::Type::from_name("GstVideoDirection").unwrap();
    assert!(element.type_().is_a(iface));

    let pspec = element.find_property("video-direction").unwrap();
    assert_eq!(
        pspec.value_type(),
        gst_video::VideoOrientationMethod::static_type()
    );
    assert_eq!(
        element.property::<gst_video::VideoOrientationMethod>("video-direction"),
        gst_video::VideoOrientationMethod::Identity
    );
    element.set_property("video-direction", gst_video::VideoOrientationMethod::Horiz);
    assert_eq!(
        element.property::<gst_video::VideoOrientationMethod>("video-direction"),
        gst_video::VideoOrientationMethod::Horiz
    );
}

#[test]
fn filter_properties() {
    init();

    let device = DummyDevice::default();
    let element = postproc(&device);

    // Unset values read back as the nominal defaults
    assert_eq!(element.property::<f32>("sharpen"), 44.0);
    assert_eq!(element.property::<f32>("saturation"), 1.0);

    element.set_property("disable-passthrough", true);
    element.set_property("sharpen", 10.0f32);
    element.set_property("denoise", 0.0f32);
    element.set_property("brightness", 20.0f32);
    assert_eq!(element.property::<f32>("sharpen"), 10.0);

    let mut h = harness(&element, "video/x-raw,format=NV12,width=320,height=240");
    h.push(frame(0)).unwrap();
    h.pull().unwrap();

    // Sharpening and colour balance, denoise is at its default
    let pipelines = device.rendered_pipelines();
    assert_eq!(pipelines.len(), 1);
    assert_eq!(pipelines[0].filters.len(), 2);
}

#[test]
fn hdr_tone_mapping_is_kept_without_metadata() {
    init();

    let device = DummyDevice::default();
    let element = postproc(&device);
    element.set_property("hdr-tone-mapping", true);
    element.set_property("disable-passthrough", true);

    let mut h = harness(&element, "video/x-raw,format=NV12,width=320,height=240");
    h.push(frame(0)).unwrap();
    h.pull().unwrap();

    assert!(element.property::<bool>("hdr-tone-mapping"));
    assert!(device.rendered_pipelines()[0].filters.is_empty());
}

#[test]
fn failed_processing_drops_the_frame() {
    init();

    let device = DummyDevice::default();
    let element = postproc(&device);
    let mut h = harness(&element, "video/x-raw,format=NV12,width=160,height=120");

    device.fail_after(FailPoint::RenderPicture, 0);
    assert_eq!(h.push(frame(0)), Ok(gst::FlowSuccess::Ok));
    assert_eq!(h.buffers_in_queue(), 0);
    assert!(device.rendered_pipelines().is_empty());
    let journal = device.journal();
    let begin = journal
        .iter()
        .rposition(|c| matches!(c, Call::BeginPicture(_)))
        .unwrap();
    assert!(journal[begin..].contains(&Call::EndPicture));
    assert_eq!(device.live_buffers(), 0);

    device.clear_failures();
    h.push(frame(33)).unwrap();
    let buffer = h.pull().unwrap();
    assert_eq!(buffer.pts(), Some(gst::ClockTime::from_mseconds(33)));
    assert!(!buffer.flags().contains(gst::BufferFlags::CORRUPTED));
}

#[test]
fn short_buffers_are_dropped() {
    init();

    let device = DummyDevice::default();
    let element = postproc(&device);
    let mut h = harness(&element, "video/x-raw,format=NV12,width=160,height=120");

    h.push(gst::Buffer::with_size(16).unwrap()).unwrap();
    assert_eq!(h.buffers_in_queue(), 0);

    h.push(frame(33)).unwrap();
    let buffer = h.pull().unwrap();
    assert_eq!(buffer.pts(), Some(gst::ClockTime::from_mseconds(33)));
}

#[test]
fn navigation_follows_scaling() {
    init();

    let device = DummyDevice::default();
    let element = postproc(&device);
    let mut h = harness(&element, "video/x-raw,format=NV12,width=160,height=120");
    h.push(frame(0)).unwrap();
    h.pull().unwrap();

    let s = gst::Structure::builder("application/x-gst-navigation")
        .field("event", "mouse-move")
        .field("pointer_x", 10.0f64)
        .field("pointer_y", 20.0f64)
        .build();
    assert!(h.push_upstream_event(gst::event::Navigation::new(s)));

    let mut pointer = None;
    while let Some(event) = h.try_pull_upstream_event() {
        if event.type_() == gst::EventType::Navigation {
            let s = event.structure().unwrap();
            pointer = Some((
                s.get::<f64>("pointer_x").unwrap(),
                s.get::<f64>("pointer_y").unwrap(),
            ));
        }
    }
    assert_eq!(pointer, Some((20.0, 40.0)));
}
