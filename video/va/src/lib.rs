// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0
#![allow(clippy::non_send_fields_in_send_ty, unused_doc_comments)]

/**
 * plugin-va:
 *
 * Since: plugins-rs-0.14.0
 */
use gst::glib;
use std::sync::LazyLock;

pub mod allocator;
pub mod caps;
pub mod colorimetry;
pub mod deinterlace;
pub mod device;
pub mod display;
pub mod dummy;
pub mod encoder;
pub mod error;
pub mod filter;
pub mod importer;
pub mod negotiate;
pub mod pool;
pub mod sample;

mod vacompositor;
mod vadeinterlace;
mod vapostproc;

pub use display::VaDisplay;
pub use error::VaError;

pub(crate) static CAT: LazyLock<gst::DebugCategory> = LazyLock::new(|| {
    gst::DebugCategory::new("va", gst::DebugColorFlags::empty(), Some("VA plugin"))
});

fn plugin_init(plugin: &gst::Plugin) -> Result<(), glib::BoolError> {
    vapostproc::register(plugin)?;
    vadeinterlace::register(plugin)?;
    vacompositor::register(plugin)?;

    #[cfg(feature = "doc")]
    {
        use gst::prelude::*;

        vapostproc::ScaleMethod::static_type().mark_as_plugin_api(gst::PluginAPIFlags::empty());
        vadeinterlace::Method::static_type().mark_as_plugin_api(gst::PluginAPIFlags::empty());
        vacompositor::VaCompositorPad::static_type()
            .mark_as_plugin_api(gst::PluginAPIFlags::empty());
    }

    Ok(())
}

gst::plugin_define!(
    va,
    env!("CARGO_PKG_DESCRIPTION"),
    plugin_init,
    concat!(env!("CARGO_PKG_VERSION"), "-", env!("COMMIT_ID")),
    "MPL",
    env!("CARGO_PKG_NAME"),
    env!("CARGO_PKG_NAME"),
    env!("CARGO_PKG_REPOSITORY"),
    env!("BUILD_REL_DATE")
);
