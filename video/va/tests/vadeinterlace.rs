// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use gst::prelude::*;
use gst_base::prelude::*;
use gst_video::prelude::*;

use gstva::device::SurfaceFlags;
use gstva::dummy::DummyDevice;
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

fn input_info(mode: gst_video::VideoInterlaceMode) -> gst_video::VideoInfo {
    gst_video::VideoInfo::builder(gst_video::VideoFormat::Nv12, 320, 240)
        .fps((25, 1))
        .interlace_mode(mode)
        .build()
        .unwrap()
}

fn harness(device: &DummyDevice, info: &gst_video::VideoInfo, method: &str) -> gst_check::Harness {
    let element = gst::ElementFactory::make("vadeinterlace")
        .property_from_str("method", method)
        .build()
        .unwrap();
    element.set_context(&VaDisplay::new(device.clone()).to_context());

    let mut h = gst_check::Harness::with_element(&element, Some("sink"), Some("src"));
    h.set_src_caps(info.to_caps().unwrap());
    h.set_sink_caps_str("video/x-raw,format=NV12,width=320,height=240");
    h.play();
    h
}

fn frame(info: &gst_video::VideoInfo, pts: u64) -> gst::Buffer {
    let mut buffer = gst::Buffer::with_size(info.size()).unwrap();
    {
        let buffer = buffer.get_mut().unwrap();
        buffer.set_pts(gst::ClockTime::from_mseconds(pts));
        buffer.set_duration(gst::ClockTime::from_mseconds(40));
        buffer.set_video_flags(
            gst_video::VideoBufferFlags::INTERLACED | gst_video::VideoBufferFlags::TFF,
        );
    }
    buffer
}

#[test]
fn progressive_input_passes_through() {
    init();

    let device = DummyDevice::default();
    let info = input_info(gst_video::VideoInterlaceMode::Progressive);
    let mut h = harness(&device, &info, "bob");

    let mut buffer = gst::Buffer::with_size(info.size()).unwrap();
    buffer
        .get_mut()
        .unwrap()
        .set_pts(gst::ClockTime::from_mseconds(40));
    h.push(buffer).unwrap();

    let out = h.pull().unwrap();
    assert_eq!(out.pts(), Some(gst::ClockTime::from_mseconds(40)));
    assert_eq!(h.buffers_in_queue(), 0);
    assert!(device.rendered_pipelines().is_empty());
}

#[test]
fn bob_outputs_one_frame_per_field() {
    init();

    let device = DummyDevice::default();
    let info = input_info(gst_video::VideoInterlaceMode::Interleaved);
    let mut h = harness(&device, &info, "bob");

    for pts in [0, 40] {
        h.push(frame(&info, pts)).unwrap();
    }

    let mut pts = Vec::new();
    for _ in 0..4 {
        let out = h.pull().unwrap();
        assert_eq!(out.duration(), Some(gst::ClockTime::from_mseconds(20)));
        assert!(!out
            .video_flags()
            .contains(gst_video::VideoBufferFlags::INTERLACED));
        pts.push(out.pts().unwrap().mseconds());
    }
    assert_eq!(pts, vec![0, 20, 40, 60]);

    let caps = h.sinkpad().unwrap().current_caps().unwrap();
    let s = caps.structure(0).unwrap();
    assert_eq!(s.get::<&str>("interlace-mode").unwrap(), "progressive");
    assert_eq!(
        s.get::<gst::Fraction>("framerate").unwrap(),
        gst::Fraction::new(50, 1)
    );

    let pipelines = device.rendered_pipelines();
    assert_eq!(pipelines.len(), 4);
    assert!(pipelines[0]
        .input_surface_flags
        .contains(SurfaceFlags::TOP_FIELD));
    assert!(pipelines[1]
        .input_surface_flags
        .contains(SurfaceFlags::BOTTOM_FIELD));
    assert!(pipelines.iter().all(|p| p.forward_references.is_empty()));
}

#[test]
fn motion_compensation_waits_for_references() {
    init();

    let device = DummyDevice::default();
    let info = input_info(gst_video::VideoInterlaceMode::Interleaved);
    let mut h = harness(&device, &info, "motion-compensated");

    // One past and one future frame are needed
    h.push(frame(&info, 0)).unwrap();
    h.push(frame(&info, 40)).unwrap();
    assert_eq!(h.buffers_in_queue(), 0);

    h.push(frame(&info, 80)).unwrap();
    let first = h.pull().unwrap();
    let second = h.pull().unwrap();
    assert_eq!(first.pts(), Some(gst::ClockTime::from_mseconds(40)));
    assert_eq!(second.pts(), Some(gst::ClockTime::from_mseconds(60)));

    let pipelines = device.rendered_pipelines();
    assert_eq!(pipelines.len(), 2);
    assert_eq!(pipelines[0].forward_references.len(), 1);
    assert_eq!(pipelines[0].backward_references.len(), 1);
}

#[test]
fn latency_covers_the_reference_window() {
    init();

    let device = DummyDevice::default();
    let info = input_info(gst_video::VideoInterlaceMode::Interleaved);
    let mut h = harness(&device, &info, "bob");
    h.push(frame(&info, 0)).unwrap();

    let mut q = gst::query::Latency::new();
    assert!(h.element().unwrap().static_pad("src").unwrap().query(&mut q));
    let (_, min, _) = q.result();
    // Two fields plus the window, one field each
    assert!(min >= gst::ClockTime::from_mseconds(60));
}

#[test]
fn output_pool_holds_the_reference_window() {
    init();

    let device = DummyDevice::default();
    let info = input_info(gst_video::VideoInterlaceMode::Interleaved);
    let mut h = harness(&device, &info, "motion-compensated");
    h.push(frame(&info, 0)).unwrap();

    let element = h.element().unwrap();
    let pool = element
        .dynamic_cast_ref::<gst_base::BaseTransform>()
        .unwrap()
        .buffer_pool()
        .unwrap();
    let (_, _, min, _) = pool.config().params().unwrap();
    // One buffer to render into, plus a past, a current and a future frame
    assert_eq!(min, 4);
}
