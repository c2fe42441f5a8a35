// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

/**
 * element-vadeinterlace:
 *
 * Deinterlaces video with the video processing entrypoint of a VA device,
 * producing one progressive frame per field.
 *
 * Progressive input is passed through.
 *
 * ## Example launch line
 * ```
 * gst-launch-1.0 videotestsrc ! video/x-raw,format=NV12,interlace-mode=interleaved ! vadeinterlace method=motion-adaptive ! autovideosink
 * ```
 *
 * Since: plugins-rs-0.14.0
 */
use gst::glib;
use gst::prelude::*;

use crate::device::DeinterlaceMethod;

mod imp;

#[derive(Debug, Eq, PartialEq, Hash, Clone, Copy, Default, glib::Enum)]
#[repr(u32)]
#[enum_type(name = "GstVaRsDeinterlaceMethod")]
pub enum Method {
    #[default]
    #[enum_value(name = "Bob: Interpolating missing lines by using the adjacent lines.", nick = "bob")]
    Bob = 1,
    #[enum_value(name = "Weave: Taking the missing lines from the adjacent frame.", nick = "weave")]
    Weave = 2,
    #[enum_value(
        name = "Motion-adaptive: Interpolating missing lines by using spatial/temporal references.",
        nick = "motion-adaptive"
    )]
    MotionAdaptive = 3,
    #[enum_value(
        name = "Motion-compensated: Recreating missing lines by using motion vector.",
        nick = "motion-compensated"
    )]
    MotionCompensated = 4,
}

impl From<Method> for DeinterlaceMethod {
    fn from(method: Method) -> Self {
        match method {
            Method::Bob => DeinterlaceMethod::Bob,
            Method::Weave => DeinterlaceMethod::Weave,
            Method::MotionAdaptive => DeinterlaceMethod::MotionAdaptive,
            Method::MotionCompensated => DeinterlaceMethod::MotionCompensated,
        }
    }
}

glib::wrapper! {
    pub struct VaDeinterlace(ObjectSubclass<imp::VaDeinterlace>) @extends gst_base::BaseTransform, gst::Element, gst::Object;
}

pub fn register(plugin: &gst::Plugin) -> Result<(), glib::BoolError> {
    gst::Element::register(
        Some(plugin),
        "vadeinterlace",
        gst::Rank::NONE,
        VaDeinterlace::static_type(),
    )
}
