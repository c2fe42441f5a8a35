// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use gst::glib;
use gst::prelude::*;

use gstva::device::{BlendFlags, Rect};
use gstva::dummy::{DummyConfig, DummyDevice};
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

fn video_info(width: u32, height: u32) -> gst_video::VideoInfo {
    gst_video::VideoInfo::builder(gst_video::VideoFormat::Rgba, width, height)
        .fps((10, 1))
        .build()
        .unwrap()
}

fn compositor(device: &DummyDevice) -> gst::Element {
    let element = gst::ElementFactory::make("vacompositor").build().unwrap();
    element.set_context(&VaDisplay::new(device.clone()).to_context());
    element
}

fn frame(info: &gst_video::VideoInfo, pts: u64) -> gst::Buffer {
    let mut buffer = gst::Buffer::with_size(info.size()).unwrap();
    {
        let buffer = buffer.get_mut().unwrap();
        buffer.set_pts(pts.seconds());
        buffer.set_duration(gst::ClockTime::from_mseconds(100));
        buffer.map_writable().unwrap().fill(128);
    }
    buffer
}

#[test]
fn input_is_placed_scaled_and_blended() {
    init();

    let device = DummyDevice::default();
    let element = compositor(&device);
    let mut h = gst_check::Harness::with_element(&element, Some("sink_0"), Some("src"));

    let pad = element.static_pad("sink_0").unwrap();
    pad.set_property("xpos", 16i32);
    pad.set_property("ypos", 8i32);
    pad.set_property("width", 80i32);
    pad.set_property("height", 60i32);
    pad.set_property("alpha", 0.5f64);

    let info = video_info(160, 120);
    h.set_src_caps(info.to_caps().unwrap());
    h.set_sink_caps(info.to_caps().unwrap());
    h.play();

    h.push(frame(&info, 0)).unwrap();
    h.push_event(gst::event::Eos::new());

    let buffer = h.pull().unwrap();
    assert_eq!(buffer.pts(), Some(gst::ClockTime::ZERO));

    let pipelines = device.rendered_pipelines();
    assert!(!pipelines.is_empty());
    let p = &pipelines[0];
    assert_eq!(p.surface_region, Some(Rect::new(0, 0, 160, 120)));
    assert_eq!(p.output_region, Some(Rect::new(16, 8, 80, 60)));
    let blend = p.blend_state.as_ref().unwrap();
    assert!(blend.flags.contains(BlendFlags::GLOBAL_ALPHA));
    assert_eq!(blend.global_alpha, 0.5);
}

#[test]
fn invisible_inputs_are_skipped() {
    init();

    let device = DummyDevice::default();
    let element = compositor(&device);
    let mut h = gst_check::Harness::with_element(&element, Some("sink_0"), Some("src"));
    element
        .static_pad("sink_0")
        .unwrap()
        .set_property("alpha", 0.0f64);

    let info = video_info(160, 120);
    h.set_src_caps(info.to_caps().unwrap());
    h.set_sink_caps(info.to_caps().unwrap());
    h.play();

    h.push(frame(&info, 0)).unwrap();
    h.push_event(gst::event::Eos::new());
    h.pull().unwrap();

    // Only the background is drawn
    let pipelines = device.rendered_pipelines();
    assert_eq!(pipelines.len(), 1);
    let target = device
        .journal()
        .iter()
        .find_map(|c| match c {
            gstva::dummy::Call::BeginPicture(surface) => Some(*surface),
            _ => None,
        })
        .unwrap();
    assert_eq!(pipelines[0].surface, target);
    assert_eq!(pipelines[0].output_region, Some(Rect::new(0, 0, 0, 0)));
    assert_eq!(pipelines[0].output_background_color, 0xff00_0000);
    assert!(pipelines[0].blend_state.is_none());
}

#[test]
fn opaque_input_is_not_blended() {
    init();

    let device = DummyDevice::default();
    let element = compositor(&device);
    let mut h = gst_check::Harness::with_element(&element, Some("sink_0"), Some("src"));

    let info = video_info(160, 120);
    h.set_src_caps(info.to_caps().unwrap());
    h.set_sink_caps(info.to_caps().unwrap());
    h.play();

    h.push(frame(&info, 0)).unwrap();
    h.push_event(gst::event::Eos::new());
    h.pull().unwrap();

    let pipelines = device.rendered_pipelines();
    assert_eq!(pipelines.len(), 1);
    assert_eq!(pipelines[0].output_region, Some(Rect::new(0, 0, 160, 120)));
    assert!(pipelines[0].blend_state.is_none());
}

#[test]
fn failed_composition_is_an_error() {
    init();

    let device = DummyDevice::default();
    let element = compositor(&device);
    let mut h = gst_check::Harness::with_element(&element, Some("sink_0"), Some("src"));

    let info = video_info(160, 120);
    h.set_src_caps(info.to_caps().unwrap());
    h.set_sink_caps(info.to_caps().unwrap());
    h.play();

    device.fail_after(gstva::dummy::FailPoint::RenderPicture, 0);
    h.push(frame(&info, 0)).unwrap();
    h.push_event(gst::event::Eos::new());

    // Aggregation runs on the source pad task
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while !device
        .journal()
        .iter()
        .any(|c| matches!(c, gstva::dummy::Call::EndPicture))
    {
        assert!(std::time::Instant::now() < deadline);
        std::thread::sleep(std::time::Duration::from_millis(10));
    }

    let journal = device.journal();
    let begin = journal
        .iter()
        .position(|c| matches!(c, gstva::dummy::Call::BeginPicture(_)))
        .unwrap();
    let end = journal
        .iter()
        .position(|c| matches!(c, gstva::dummy::Call::EndPicture))
        .unwrap();
    assert!(begin < end);
    assert!(device.rendered_pipelines().is_empty());
    assert!(h.try_pull().is_none());
}

#[test]
fn output_size_covers_the_inputs() {
    init();

    let device = DummyDevice::default();
    let element = compositor(&device);
    let mut h = gst_check::Harness::with_element(&element, Some("sink_0"), Some("src"));
    element
        .static_pad("sink_0")
        .unwrap()
        .set_property("xpos", 40i32);

    let info = video_info(160, 120);
    h.set_src_caps(info.to_caps().unwrap());
    h.set_sink_caps_str("video/x-raw,format=RGBA");
    h.play();

    h.push(frame(&info, 0)).unwrap();
    h.push_event(gst::event::Eos::new());
    h.pull().unwrap();

    let caps = h.sinkpad().unwrap().current_caps().unwrap();
    let s = caps.structure(0).unwrap();
    assert_eq!(s.get::<i32>("width").unwrap(), 200);
    assert_eq!(s.get::<i32>("height").unwrap(), 120);
    assert_eq!(
        s.get::<gst::Fraction>("framerate").unwrap(),
        gst::Fraction::new(10, 1)
    );
}

#[test]
fn pads_are_children() {
    init();

    let element = compositor(&DummyDevice::default());
    let pad = element.request_pad_simple("sink_%u").unwrap();
    pad.set_property("xpos", 12i32);

    let proxy = element.dynamic_cast_ref::<gst::ChildProxy>().unwrap();
    assert_eq!(proxy.children_count(), 1);
    assert_eq!(
        proxy.child_by_name(&pad.name()),
        Some(pad.clone().upcast::<glib::Object>())
    );
    assert_eq!(proxy.child_property::<i32>(&format!("{}::xpos", pad.name())), 12);
    assert_eq!(pad.property::<f64>("alpha"), 1.0);

    element.release_request_pad(&pad);
    assert_eq!(proxy.children_count(), 0);
}

#[test]
fn device_without_blending_fails_to_start() {
    init();

    let device = DummyDevice::new(DummyConfig {
        blend_flags: BlendFlags::empty(),
        ..Default::default()
    });
    let element = compositor(&device);

    assert!(element.set_state(gst::State::Paused).is_err());
    let _ = element.set_state(gst::State::Null);
}
