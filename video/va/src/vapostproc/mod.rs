// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

/**
 * element-vapostproc:
 *
 * Converts, scales, crops, orients and filters raw video with the video
 * processing entrypoint of a VA device.
 *
 * When input and output caps are the same and no filter is enabled, the
 * element works in passthrough mode.
 *
 * ## Example launch line
 * ```
 * gst-launch-1.0 videotestsrc ! video/x-raw,format=NV12,width=1920,height=1080 ! vapostproc video-direction=90r ! video/x-raw,width=640,height=640 ! autovideosink
 * ```
 *
 * Since: plugins-rs-0.14.0
 */
use gst::glib;
use gst::prelude::*;

use crate::device;

mod imp;

/// Scaling quality of the video processing pipeline.
#[derive(Debug, Eq, PartialEq, Hash, Clone, Copy, Default, glib::Enum)]
#[repr(u32)]
#[enum_type(name = "GstVaRsScaleMethod")]
pub enum ScaleMethod {
    #[default]
    #[enum_value(name = "Default scaling mode", nick = "default")]
    Default = 0,
    #[enum_value(name = "Fast scaling mode", nick = "fast")]
    Fast = 1,
    #[enum_value(name = "High quality scaling mode", nick = "hq")]
    HighQuality = 2,
}

impl From<ScaleMethod> for device::ScaleMethod {
    fn from(method: ScaleMethod) -> Self {
        match method {
            ScaleMethod::Default => device::ScaleMethod::Default,
            ScaleMethod::Fast => device::ScaleMethod::Fast,
            ScaleMethod::HighQuality => device::ScaleMethod::HighQuality,
        }
    }
}

glib::wrapper! {
    /// `GstVideoDirection`: an interface with only a `video-direction` property.
    pub struct VideoDirection(Interface<gst_video::ffi::GstVideoDirection, gst_video::ffi::GstVideoDirectionInterface>);

    match fn {
        type_ => || gst_video::ffi::gst_video_direction_get_type(),
    }
}

unsafe impl<T: glib::subclass::types::ObjectSubclass> glib::subclass::types::IsImplementable<T>
    for VideoDirection
{
}

glib::wrapper! {
    pub struct VaPostProc(ObjectSubclass<imp::VaPostProc>) @extends gst_base::BaseTransform, gst::Element, gst::Object, @implements VideoDirection;
}

pub fn register(plugin: &gst::Plugin) -> Result<(), glib::BoolError> {
    gst::Element::register(
        Some(plugin),
        "vapostproc",
        gst::Rank::NONE,
        VaPostProc::static_type(),
    )
}
