// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use gst::glib;
use gst::glib::Properties;
use gst::prelude::*;
use gst::subclass::prelude::*;
use gst_base::subclass::prelude::*;
use gst_video::subclass::prelude::*;
use std::sync::Mutex;

use crate::importer::CachedPoolProvider;

#[derive(Clone, Copy, Debug)]
pub struct Settings {
    xpos: i32,
    ypos: i32,
    width: i32,
    height: i32,
    alpha: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            xpos: 0,
            ypos: 0,
            width: 0,
            height: 0,
            alpha: 1.0,
        }
    }
}

#[derive(Properties, Default)]
#[properties(wrapper_type = super::VaCompositorPad)]
pub struct VaCompositorPad {
    #[property(get, set, type = i32, name = "xpos", nick = "X Position", blurb = "X position of the picture", minimum = i32::MIN, maximum = i32::MAX, member = xpos)]
    #[property(get, set, type = i32, name = "ypos", nick = "Y Position", blurb = "Y position of the picture", minimum = i32::MIN, maximum = i32::MAX, member = ypos)]
    #[property(get, set, type = i32, name = "width", nick = "Width", blurb = "Width of the picture, 0 for the input width", minimum = 0, maximum = i32::MAX, member = width)]
    #[property(get, set, type = i32, name = "height", nick = "Height", blurb = "Height of the picture, 0 for the input height", minimum = 0, maximum = i32::MAX, member = height)]
    #[property(
        get,
        set,
        type = f64,
        name = "alpha",
        nick = "Alpha",
        blurb = "Alpha of the picture",
        minimum = 0.0,
        maximum = 1.0,
        default = 1.0,
        member = alpha,
    )]
    settings: Mutex<Settings>,
    /// Pool input buffers are copied into when the device can't use them.
    pub(super) import_pool: CachedPoolProvider,
}

#[glib::object_subclass]
impl ObjectSubclass for VaCompositorPad {
    const NAME: &'static str = "GstVaRsCompositorPad";
    type Type = super::VaCompositorPad;
    type ParentType = gst_video::VideoAggregatorPad;
}

#[glib::derived_properties]
impl ObjectImpl for VaCompositorPad {}
impl GstObjectImpl for VaCompositorPad {}
impl PadImpl for VaCompositorPad {}
impl AggregatorPadImpl for VaCompositorPad {
    fn flush(
        &self,
        aggregator: &gst_base::Aggregator,
    ) -> Result<gst::FlowSuccess, gst::FlowError> {
        self.import_pool.clear();
        self.parent_flush(aggregator)
    }
}
impl VideoAggregatorPadImpl for VaCompositorPad {}
