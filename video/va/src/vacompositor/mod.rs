// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

/**
 * element-vacompositor:
 *
 * Composes its inputs into one output with the video processing entrypoint
 * of a VA device. Each input is placed, scaled and blended according to the
 * properties of its pad.
 *
 * ## Example launch line
 * ```
 * gst-launch-1.0 vacompositor name=c sink_1::xpos=320 sink_1::alpha=0.5 ! autovideosink videotestsrc ! c. videotestsrc pattern=ball ! c.
 * ```
 *
 * Since: plugins-rs-0.14.0
 */
use gst::glib;
use gst::prelude::*;

mod imp;
mod pad;

glib::wrapper! {
    pub struct VaCompositor(ObjectSubclass<imp::VaCompositor>) @extends gst_video::VideoAggregator, gst_base::Aggregator, gst::Element, gst::Object, @implements gst::ChildProxy;
}

glib::wrapper! {
    pub struct VaCompositorPad(ObjectSubclass<pad::VaCompositorPad>) @extends gst_video::VideoAggregatorPad, gst_base::AggregatorPad, gst::Pad, gst::Object;
}

pub fn register(plugin: &gst::Plugin) -> Result<(), glib::BoolError> {
    gst::Element::register(
        Some(plugin),
        "vacompositor",
        gst::Rank::NONE,
        VaCompositor::static_type(),
    )
}
