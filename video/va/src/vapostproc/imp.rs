// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use gst::glib;
use gst::prelude::*;
use gst::subclass::prelude::*;
use gst_base::prelude::*;
use gst_base::subclass::base_transform::{InputBuffer, PrepareOutputBufferSuccess};
use gst_base::subclass::prelude::*;
use gst_video::prelude::*;
use gst_video::{VideoFormat, VideoFormatFlags, VideoOrientationMethod};

use std::sync::{Arc, LazyLock, Mutex};

use super::ScaleMethod;
use crate::caps::{self, MemoryFeature, VaVideoInfo};
use crate::colorimetry::surface_flags;
use crate::device::{
    ColorBalanceKind, Entrypoint, FilterParameter, FilterType, Hdr10Metadata, ToneMappingFlags,
};
use crate::display::{self, VaDisplay};
use crate::filter::{orientation_swaps_dimensions, Filter};
use crate::importer::{BufferImporter, CachedPoolProvider, ImportError};
use crate::negotiate::{self, AllocationRequest, ConsumerKind, Negotiator};
use crate::sample::Sample;

static CAT: LazyLock<gst::DebugCategory> = LazyLock::new(|| {
    gst::DebugCategory::new(
        "vapostproc",
        gst::DebugColorFlags::empty(),
        Some("VA video postprocessor"),
    )
});

const DEFAULT_DISABLE_PASSTHROUGH: bool = false;
const DEFAULT_ADD_BORDERS: bool = false;

bitflags::bitflags! {
    /// Operations the current configuration performs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct Op: u32 {
        const DIRECTION = 1 << 0;
        const FORMAT = 1 << 1;
        const SIZE = 1 << 2;
        const FEATURE = 1 << 3;
        const FILTERS = 1 << 4;
        const CROP = 1 << 5;
    }
}

/// A float filter property: its range and the value shown while unset.
struct FloatProperty {
    name: &'static str,
    nick: &'static str,
    min: f32,
    max: f32,
    default: f32,
}

static FLOAT_PROPERTIES: &[FloatProperty] = &[
    FloatProperty {
        name: "denoise",
        nick: "Noise reduction",
        min: 0.0,
        max: 64.0,
        default: 0.0,
    },
    FloatProperty {
        name: "sharpen",
        nick: "Sharpness",
        min: 0.0,
        max: 64.0,
        default: 44.0,
    },
    FloatProperty {
        name: "skin-tone",
        nick: "Skin tone enhancement",
        min: 0.0,
        max: 9.0,
        default: 0.0,
    },
    FloatProperty {
        name: "hue",
        nick: "Hue",
        min: -180.0,
        max: 180.0,
        default: 0.0,
    },
    FloatProperty {
        name: "saturation",
        nick: "Saturation",
        min: 0.0,
        max: 10.0,
        default: 1.0,
    },
    FloatProperty {
        name: "brightness",
        nick: "Brightness",
        min: -100.0,
        max: 100.0,
        default: 0.0,
    },
    FloatProperty {
        name: "contrast",
        nick: "Contrast",
        min: 0.0,
        max: 10.0,
        default: 1.0,
    },
];

#[derive(Debug, Clone, Copy)]
struct Settings {
    disable_passthrough: bool,
    add_borders: bool,
    scale_method: ScaleMethod,
    video_direction: VideoOrientationMethod,
    // Unset filter values leave the device default in place
    denoise: Option<f32>,
    sharpen: Option<f32>,
    skin_tone: Option<f32>,
    hue: Option<f32>,
    saturation: Option<f32>,
    brightness: Option<f32>,
    contrast: Option<f32>,
    auto_saturation: bool,
    auto_brightness: bool,
    auto_contrast: bool,
    hdr_tone_mapping: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            disable_passthrough: DEFAULT_DISABLE_PASSTHROUGH,
            add_borders: DEFAULT_ADD_BORDERS,
            scale_method: ScaleMethod::default(),
            video_direction: VideoOrientationMethod::Identity,
            denoise: None,
            sharpen: None,
            skin_tone: None,
            hue: None,
            saturation: None,
            brightness: None,
            contrast: None,
            auto_saturation: false,
            auto_brightness: false,
            auto_contrast: false,
            hdr_tone_mapping: false,
        }
    }
}

impl Settings {
    fn float_slot(&mut self, name: &str) -> Option<&mut Option<f32>> {
        match name {
            "denoise" => Some(&mut self.denoise),
            "sharpen" => Some(&mut self.sharpen),
            "skin-tone" => Some(&mut self.skin_tone),
            "hue" => Some(&mut self.hue),
            "saturation" => Some(&mut self.saturation),
            "brightness" => Some(&mut self.brightness),
            "contrast" => Some(&mut self.contrast),
            _ => None,
        }
    }

    fn color_balance(&self, kind: ColorBalanceKind) -> Option<f32> {
        let flag = |b: bool| if b { Some(1.0) } else { None };
        match kind {
            ColorBalanceKind::Hue => self.hue,
            ColorBalanceKind::Saturation => self.saturation,
            ColorBalanceKind::Brightness => self.brightness,
            ColorBalanceKind::Contrast => self.contrast,
            ColorBalanceKind::AutoSaturation => flag(self.auto_saturation),
            ColorBalanceKind::AutoBrightness => flag(self.auto_brightness),
            ColorBalanceKind::AutoContrast => flag(self.auto_contrast),
        }
    }
}

struct State {
    filter: Option<Arc<Filter>>,
    in_info: Option<VaVideoInfo>,
    out_info: Option<VaVideoInfo>,
    op: Op,
    borders: (u32, u32),
    va_to_raw: bool,
    pseudo_passthrough: bool,
    hdr_meta: Option<Hdr10Metadata>,
    rebuild_filters: bool,
    tag_direction: VideoOrientationMethod,
}

impl Default for State {
    fn default() -> Self {
        State {
            filter: None,
            in_info: None,
            out_info: None,
            op: Op::empty(),
            borders: (0, 0),
            va_to_raw: false,
            pseudo_passthrough: false,
            hdr_meta: None,
            rebuild_filters: true,
            tag_direction: VideoOrientationMethod::Identity,
        }
    }
}

pub struct VaPostProc {
    settings: Mutex<Settings>,
    state: Mutex<State>,
    display: Mutex<Option<VaDisplay>>,
    negotiator: Mutex<Negotiator>,
    import_pool: CachedPoolProvider,
}

impl Default for VaPostProc {
    fn default() -> Self {
        VaPostProc {
            settings: Mutex::new(Settings::default()),
            state: Mutex::new(State::default()),
            display: Mutex::new(None),
            negotiator: Mutex::new(Negotiator::new(ConsumerKind::Transform)),
            import_pool: CachedPoolProvider::new(),
        }
    }
}

/// HDR10 static metadata carried by `caps`, if any.
fn hdr_metadata(caps: &gst::CapsRef) -> Option<Hdr10Metadata> {
    let mut meta = Hdr10Metadata::default();
    let mut found = false;

    if let Ok(minfo) = gst_video::VideoMasteringDisplayInfo::from_caps(caps) {
        let primaries = minfo.display_primaries();
        // Green, blue, red
        for (slot, idx) in [1, 2, 0].into_iter().enumerate() {
            meta.display_primaries_x[slot] = primaries[idx].x;
            meta.display_primaries_y[slot] = primaries[idx].y;
        }
        meta.white_point_x = minfo.white_point().x;
        meta.white_point_y = minfo.white_point().y;
        meta.max_display_mastering_luminance = minfo.max_display_mastering_luminance();
        meta.min_display_mastering_luminance = minfo.min_display_mastering_luminance();
        found = true;
    }

    if let Ok(cll) = gst_video::VideoContentLightLevel::from_caps(caps) {
        meta.max_content_light_level = cll.max_content_light_level();
        meta.max_pic_average_light_level = cll.max_frame_average_light_level();
        found = true;
    }

    found.then_some(meta)
}

/// Maps the `image-orientation` tag to an orientation method.
fn orientation_from_tag(tag: &str) -> Option<VideoOrientationMethod> {
    use VideoOrientationMethod::*;

    Some(match tag {
        "rotate-0" => Identity,
        "rotate-90" => _90r,
        "rotate-180" => _180,
        "rotate-270" => _90l,
        "flip-rotate-0" => Horiz,
        "flip-rotate-90" => UlLr,
        "flip-rotate-180" => Vert,
        "flip-rotate-270" => UrLl,
        _ => return None,
    })
}

/// Borders that keep the input's display aspect ratio inside the output.
fn compute_borders(
    in_info: &gst_video::VideoInfo,
    out_info: &gst_video::VideoInfo,
    swap: bool,
) -> (u32, u32) {
    let in_par = in_info.par();
    let out_par = out_info.par();

    let (mut from_n, mut from_d) = (
        in_info.width() as i64 * in_par.numer() as i64,
        in_info.height() as i64 * in_par.denom() as i64,
    );
    if swap {
        std::mem::swap(&mut from_n, &mut from_d);
    }

    // Input DAR in output pixels
    let n = from_n * out_par.denom() as i64;
    let d = from_d * out_par.numer() as i64;
    if n <= 0 || d <= 0 {
        return (0, 0);
    }

    let (out_w, out_h) = (out_info.width() as i64, out_info.height() as i64);
    if out_w * d == out_h * n {
        return (0, 0);
    }

    let to_h = out_w * d / n;
    if to_h <= out_h {
        (0, (out_h - to_h) as u32)
    } else {
        let to_w = out_h * n / d;
        ((out_w - to_w).max(0) as u32, 0)
    }
}

/// Translates a pointer position on the output back onto the input.
fn map_pointer(
    orientation: VideoOrientationMethod,
    (x, y): (f64, f64),
    (in_w, in_h): (u32, u32),
    (out_w, out_h): (u32, u32),
) -> (f64, f64) {
    use VideoOrientationMethod::*;

    let (ow, oh) = (out_w as f64, out_h as f64);
    let (x, y) = match orientation {
        _90r => (y, ow - 1.0 - x),
        _90l => (oh - 1.0 - y, x),
        UlLr => (y, x),
        UrLl => (oh - 1.0 - y, ow - 1.0 - x),
        _180 => (ow - 1.0 - x, oh - 1.0 - y),
        Horiz => (ow - 1.0 - x, y),
        Vert => (x, oh - 1.0 - y),
        _ => (x, y),
    };

    let (w, h) = if orientation_swaps_dimensions(orientation) {
        (oh, ow)
    } else {
        (ow, oh)
    };
    if w <= 0.0 || h <= 0.0 {
        return (x, y);
    }

    (x * in_w as f64 / w, y * in_h as f64 / h)
}

const SCORE_FORMAT_CHANGE: u32 = 1;
const SCORE_DEPTH_LOSS: u32 = 4;
const SCORE_ALPHA_LOSS: u32 = 8;
const SCORE_CHROMA_W_LOSS: u32 = 16;
const SCORE_CHROMA_H_LOSS: u32 = 32;
const SCORE_PALETTE_LOSS: u32 = 64;
const SCORE_COLOR_LOSS: u32 = 128;
const SCORE_COLORSPACE_LOSS: u32 = 2;

/// Information lost converting `from` into `to`, lower is better.
fn format_loss(from: VideoFormat, to: VideoFormat) -> u32 {
    if from == to {
        return 0;
    }

    let from = gst_video::VideoFormatInfo::from_format(from);
    let to = gst_video::VideoFormatInfo::from_format(to);
    let ignored = VideoFormatFlags::LE | VideoFormatFlags::COMPLEX | VideoFormatFlags::UNPACK;
    let color = VideoFormatFlags::YUV | VideoFormatFlags::RGB | VideoFormatFlags::GRAY;
    let from_flags = from.flags() - ignored;
    let to_flags = to.flags() - ignored;

    let mut loss = SCORE_FORMAT_CHANGE;
    if (from_flags & VideoFormatFlags::PALETTE) != (to_flags & VideoFormatFlags::PALETTE) {
        loss += SCORE_FORMAT_CHANGE + SCORE_PALETTE_LOSS;
    }
    if (from_flags & color) != (to_flags & color) {
        loss += SCORE_COLORSPACE_LOSS;
        if to_flags.contains(VideoFormatFlags::GRAY) {
            loss += SCORE_COLOR_LOSS;
        }
    }
    if from_flags.contains(VideoFormatFlags::ALPHA) && !to_flags.contains(VideoFormatFlags::ALPHA) {
        loss += SCORE_FORMAT_CHANGE + SCORE_ALPHA_LOSS;
    }
    if from.h_sub().get(1) != to.h_sub().get(1) {
        loss += SCORE_FORMAT_CHANGE + SCORE_CHROMA_H_LOSS;
    }
    if from.w_sub().get(1) != to.w_sub().get(1) {
        loss += SCORE_FORMAT_CHANGE + SCORE_CHROMA_W_LOSS;
    }
    if from.bits() > to.bits() {
        loss += SCORE_FORMAT_CHANGE + SCORE_DEPTH_LOSS;
    }

    loss
}

/// Formats offered by a caps structure, with their modifiers.
fn structure_formats(s: &gst::StructureRef, feature: MemoryFeature) -> Vec<(VideoFormat, u64)> {
    let (field, dma) = if feature == MemoryFeature::DmaBuf
        && s.get::<&str>("format").ok() == Some(caps::DMA_DRM_FORMAT)
    {
        ("drm-format", true)
    } else {
        ("format", false)
    };

    let Ok(value) = s.value(field) else {
        return Vec::new();
    };
    let strings = if let Ok(v) = value.get::<&str>() {
        vec![v.to_string()]
    } else if let Ok(list) = value.get::<gst::List>() {
        list.iter()
            .filter_map(|v| v.get::<&str>().ok().map(String::from))
            .collect()
    } else {
        Vec::new()
    };

    strings
        .iter()
        .filter_map(|s| {
            if dma {
                let (code, modifier) = caps::parse_drm_format(s)?;
                Some((caps::format_from_drm_fourcc(code)?, modifier))
            } else {
                let format = VideoFormat::from_string(s);
                (format != VideoFormat::Unknown).then_some((format, caps::DRM_FORMAT_MOD_LINEAR))
            }
        })
        .collect()
}

fn scale(value: i32, num: i64, den: i64) -> i32 {
    ((value as i64 * num + den / 2) / den).clamp(1, i32::MAX as i64) as i32
}

impl VaPostProc {
    fn filter(&self) -> Option<Arc<Filter>> {
        self.state.lock().unwrap().filter.clone()
    }

    fn display(&self) -> Option<VaDisplay> {
        self.display.lock().unwrap().clone()
    }

    fn update_passthrough(&self, reconfigure: bool) {
        let obj = self.obj();
        let disable = self.settings.lock().unwrap().disable_passthrough;
        let passthrough = self.state.lock().unwrap().op.is_empty() && !disable;

        if obj.is_passthrough() != passthrough {
            gst::info!(
                CAT,
                imp = self,
                "{} passthrough",
                if passthrough { "Enabling" } else { "Disabling" }
            );
            if reconfigure {
                obj.reconfigure_src();
            }
            obj.set_passthrough(passthrough);
        }
    }

    /// Applies the requested orientation to the filter, falling back to
    /// the previous one when the device can't realize it.
    fn update_orientation(&self) {
        let Some(filter) = self.filter() else {
            return;
        };

        let mut rolled_back = false;
        let changed = {
            let mut settings = self.settings.lock().unwrap();
            let mut state = self.state.lock().unwrap();

            let auto = settings.video_direction == VideoOrientationMethod::Auto;
            let wanted = if auto {
                state.tag_direction
            } else {
                settings.video_direction
            };

            let current = filter.orientation();
            let changed = if wanted == current {
                false
            } else if filter.set_orientation(wanted) {
                gst::debug!(CAT, imp = self, "Orientation {:?}", wanted);
                true
            } else {
                gst::warning!(
                    CAT,
                    imp = self,
                    "Orientation {:?} not supported, keeping {:?}",
                    wanted,
                    current
                );
                if auto {
                    state.tag_direction = current;
                } else {
                    settings.video_direction = current;
                    rolled_back = true;
                }
                false
            };

            state.op.set(
                Op::DIRECTION,
                filter.orientation() != VideoOrientationMethod::Identity,
            );
            changed
        };

        if rolled_back {
            self.obj().notify("video-direction");
        }
        if changed {
            self.obj().reconfigure_src();
        }
    }

    /// Recreates the filter buffers from the current settings.
    fn rebuild_filters(&self) {
        let Some(filter) = self.filter() else {
            return;
        };

        let mut notify_hdr = false;
        {
            let mut settings = self.settings.lock().unwrap();
            let mut state = self.state.lock().unwrap();
            if !state.rebuild_filters {
                return;
            }
            state.rebuild_filters = false;

            if let Err(err) = filter.drop_filter_buffers() {
                gst::warning!(CAT, imp = self, "Failed to drop filters: {}", err);
            }

            let mut apply = false;
            let simple = [
                (FilterType::NoiseReduction, settings.denoise),
                (FilterType::Sharpening, settings.sharpen),
                (FilterType::SkinToneEnhancement, settings.skin_tone),
            ];
            for (ty, value) in simple {
                let (Some(value), Some(range)) = (value, filter.filter_range(ty)) else {
                    continue;
                };
                let value = range.clamp(value);
                if value == range.default {
                    continue;
                }

                let parameter = match ty {
                    FilterType::NoiseReduction => FilterParameter::NoiseReduction(value),
                    FilterType::Sharpening => FilterParameter::Sharpening(value),
                    _ => FilterParameter::SkinTone(value),
                };
                match filter.add_filter_buffer(parameter) {
                    Ok(()) => apply = true,
                    Err(err) => gst::warning!(CAT, imp = self, "Can't add {:?}: {}", ty, err),
                }
            }

            let balance = filter
                .color_balance_caps()
                .into_iter()
                .filter_map(|cap| {
                    let value = cap.range.clamp(settings.color_balance(cap.kind)?);
                    (value != cap.range.default).then_some((cap.kind, value))
                })
                .collect::<Vec<_>>();
            if !balance.is_empty() {
                match filter.add_filter_buffer(FilterParameter::ColorBalance(balance)) {
                    Ok(()) => apply = true,
                    Err(err) => gst::warning!(CAT, imp = self, "Can't add colour balance: {}", err),
                }
            }

            if settings.hdr_tone_mapping {
                if let Some(meta) = state.hdr_meta {
                    let capable = filter.hdr_caps().iter().any(|cap| {
                        cap.hdr10 && cap.flags.contains(ToneMappingFlags::HDR_TO_SDR)
                    });

                    let added = capable
                        && !state.op.contains(Op::FORMAT)
                        && filter
                            .add_filter_buffer(FilterParameter::HdrToneMapping(meta))
                            .is_ok();
                    if added {
                        apply = true;
                    } else {
                        gst::warning!(CAT, imp = self, "HDR tone mapping not possible");
                        settings.hdr_tone_mapping = false;
                        notify_hdr = true;
                    }
                }
            }

            gst::debug!(
                CAT,
                imp = self,
                "{} filter buffers",
                filter.n_filter_buffers()
            );
            state.op.set(Op::FILTERS, apply);
        }

        if notify_hdr {
            self.obj().notify("hdr-tone-mapping");
        }
    }

    /// Keeps `result` at the input's display aspect ratio, preferring to
    /// keep one of the input dimensions.
    fn fixate_size(&self, caps: &gst::CapsRef, result: &mut gst::CapsRef) {
        let Some(ins) = caps.structure(0) else {
            return;
        };
        let (Ok(mut from_w), Ok(mut from_h)) = (ins.get::<i32>("width"), ins.get::<i32>("height"))
        else {
            return;
        };
        let mut from_par = ins
            .get::<gst::Fraction>("pixel-aspect-ratio")
            .unwrap_or_else(|_| gst::Fraction::new(1, 1));

        if self
            .filter()
            .is_some_and(|f| orientation_swaps_dimensions(f.orientation()))
        {
            std::mem::swap(&mut from_w, &mut from_h);
            from_par = gst::Fraction::new(from_par.denom(), from_par.numer());
        }

        let Some(outs) = result.structure_mut(0) else {
            return;
        };

        if outs.has_field("pixel-aspect-ratio") {
            outs.fixate_field_nearest_fraction("pixel-aspect-ratio", from_par);
        } else if from_par != gst::Fraction::new(1, 1) {
            outs.set("pixel-aspect-ratio", gst::Fraction::new(1, 1));
        }
        let to_par = outs
            .get::<gst::Fraction>("pixel-aspect-ratio")
            .unwrap_or_else(|_| gst::Fraction::new(1, 1));

        // Output display aspect ratio num/den in output pixels
        let num = from_w as i64 * from_par.numer() as i64 * to_par.denom() as i64;
        let den = from_h as i64 * from_par.denom() as i64 * to_par.numer() as i64;
        let width = outs.get::<i32>("width").ok();
        let height = outs.get::<i32>("height").ok();

        if num <= 0 || den <= 0 {
            outs.fixate_field_nearest_int("width", from_w);
            outs.fixate_field_nearest_int("height", from_h);
            return;
        }

        match (width, height) {
            (Some(_), Some(_)) => (),
            (Some(w), None) => {
                outs.fixate_field_nearest_int("height", scale(w, den, num));
            }
            (None, Some(h)) => {
                outs.fixate_field_nearest_int("width", scale(h, num, den));
            }
            (None, None) => {
                let candidates = [
                    (scale(from_h, num, den), from_h),
                    (from_w, scale(from_w, den, num)),
                ];
                for (w, h) in candidates {
                    let mut candidate = outs.to_owned();
                    candidate.fixate_field_nearest_int("width", w);
                    candidate.fixate_field_nearest_int("height", h);
                    if candidate.get::<i32>("width") == Ok(w) && candidate.get::<i32>("height") == Ok(h) {
                        outs.set("width", w);
                        outs.set("height", h);
                        return;
                    }
                }

                outs.fixate_field_nearest_int("width", from_w);
                let w = outs.get::<i32>("width").unwrap_or(from_w);
                outs.fixate_field_nearest_int("height", scale(w, den, num));
            }
        }
    }

    /// Picks the output structure and format losing the least of the
    /// input format.
    fn fixate_format(&self, caps: &gst::CapsRef, result: &gst::CapsRef) -> Option<gst::Caps> {
        let in_feature = MemoryFeature::from_caps(caps)?;
        let (in_format, _) = *structure_formats(caps.structure(0)?, in_feature).first()?;
        let filter = self.filter();

        let mut best: Option<(u32, usize, VideoFormat, u64, MemoryFeature)> = None;
        for (idx, (s, features)) in result.iter_with_features().enumerate() {
            let feature = MemoryFeature::from_features(Some(features));
            for (format, modifier) in structure_formats(s, feature) {
                if filter
                    .as_ref()
                    .is_some_and(|f| !f.has_video_format(format, feature))
                {
                    continue;
                }

                let loss = format_loss(in_format, format);
                if best.as_ref().map_or(true, |b| loss < b.0) {
                    best = Some((loss, idx, format, modifier, feature));
                    if loss == 0 {
                        break;
                    }
                }
            }
            if best.as_ref().is_some_and(|b| b.0 == 0) {
                break;
            }
        }

        let (loss, idx, format, modifier, feature) = best?;
        gst::debug!(CAT, imp = self, "Picked {:?} ({:?}) with loss {}", format, feature, loss);

        let mut s = result.structure(idx)?.to_owned();
        if feature == MemoryFeature::DmaBuf && s.has_field("drm-format") {
            s.set("format", caps::DMA_DRM_FORMAT);
            s.set("drm-format", caps::drm_format_string(format, modifier)?);
        } else {
            s.set("format", format.to_str());
        }

        let mut out = gst::Caps::new_empty();
        out.get_mut()
            .unwrap()
            .append_structure_full(s, Some(feature.caps_features()));
        Some(out)
    }

    fn fixate_caps_impl(
        &self,
        direction: gst::PadDirection,
        caps: &gst::Caps,
        othercaps: gst::Caps,
    ) -> gst::Caps {
        let Some(mut result) = self.fixate_format(caps, &othercaps) else {
            gst::debug!(CAT, imp = self, "No usable format in {}", othercaps);
            let mut othercaps = othercaps;
            othercaps.fixate();
            return othercaps;
        };

        {
            let result = result.make_mut();
            self.fixate_size(caps, result);

            if let (Some(ins), Some(outs)) = (caps.structure(0), result.structure_mut(0)) {
                copy_misc_fields(ins, outs);
            }
        }
        result.fixate();

        if direction == gst::PadDirection::Sink {
            update_hdr_fields(&mut result);
            transfer_colorimetry(caps, &mut result);
            if caps.is_subset(&result) {
                result = caps.clone();
            }
        }

        result
    }

    fn map_navigation(&self, event: &gst::Event) -> Option<gst::Event> {
        let (orientation, in_size, out_size) = {
            let state = self.state.lock().unwrap();
            let (in_info, out_info) = (state.in_info.as_ref()?, state.out_info.as_ref()?);
            let orientation = state
                .filter
                .as_ref()
                .map_or(VideoOrientationMethod::Identity, |f| f.orientation());
            (
                orientation,
                (in_info.width(), in_info.height()),
                (out_info.width(), out_info.height()),
            )
        };
        if in_size == out_size && orientation == VideoOrientationMethod::Identity {
            return None;
        }

        let s = event.structure()?;
        let x = s.get::<f64>("pointer_x").ok()?;
        let y = s.get::<f64>("pointer_y").ok()?;
        let (nx, ny) = map_pointer(orientation, (x, y), in_size, out_size);
        gst::trace!(CAT, imp = self, "Pointer {x}x{y} -> {nx}x{ny}");

        let mut s = s.to_owned();
        s.set("pointer_x", nx);
        s.set("pointer_y", ny);
        Some(
            gst::event::Navigation::builder(s)
                .seqnum(event.seqnum())
                .build(),
        )
    }

    /// Scratch surface for devices writing into a pool the downstream
    /// buffers don't come from.
    fn scratch_buffer(&self) -> Result<gst::Buffer, gst::FlowError> {
        self.negotiator
            .lock()
            .unwrap()
            .negotiated()
            .ok_or(gst::FlowError::NotNegotiated)?
            .acquire_surface_buffer()
    }
}

/// Fields the output inherits from the input unless already fixed.
fn copy_misc_fields(ins: &gst::StructureRef, outs: &mut gst::StructureRef) {
    for field in [
        "interlace-mode",
        "field-order",
        "multiview-mode",
        "multiview-flags",
        "framerate",
    ] {
        if outs.value(field).is_ok_and(|v| v.is_fixed()) {
            continue;
        }
        if let Ok(value) = ins.value(field) {
            outs.set_value(field, value.clone());
        }
    }
}

fn update_hdr_fields(result: &mut gst::Caps) {
    let result = result.make_mut();
    let Some(s) = result.structure_mut(0) else {
        return;
    };
    s.remove_fields(["mastering-display-info", "content-light-level", "hdr-format"]);
}

/// Gives the output a colorimetry derived from the input's when it has
/// none.
fn transfer_colorimetry(caps: &gst::CapsRef, result: &mut gst::Caps) {
    let (Ok(in_info), Ok(out_info)) = (
        gst_video::VideoInfo::from_caps(caps),
        VaVideoInfo::from_caps(result),
    ) else {
        return;
    };
    let Some(ins) = caps.structure(0) else {
        return;
    };

    let result = result.make_mut();
    let Some(outs) = result.structure_mut(0) else {
        return;
    };

    if !outs.has_field("colorimetry") {
        if let Ok(colorimetry) = ins.get::<&str>("colorimetry") {
            let same_family = (in_info.is_yuv() && out_info.is_yuv())
                || (in_info.is_rgb() && out_info.is_rgb())
                || (in_info.is_gray() && out_info.is_gray());
            if same_family {
                outs.set("colorimetry", colorimetry);
            } else {
                // Keep transfer and primaries, use the output's own matrix
                let in_c = in_info.colorimetry();
                let out_c = out_info.colorimetry();
                let c = gst_video::VideoColorimetry::new(
                    out_c.range(),
                    out_c.matrix(),
                    in_c.transfer(),
                    in_c.primaries(),
                );
                outs.set("colorimetry", c.to_string());
            }
        }
    }

    if !outs.has_field("chroma-site") && in_info.is_yuv() && out_info.is_yuv() {
        let same_subsampling = in_info.format_info().w_sub().get(1)
            == out_info.format_info().w_sub().get(1)
            && in_info.format_info().h_sub().get(1) == out_info.format_info().h_sub().get(1);
        if same_subsampling {
            if let Ok(site) = ins.get::<&str>("chroma-site") {
                outs.set("chroma-site", site);
            }
        }
    }
}

/// Caps with format, colorimetry and size left open.
fn remove_format_fields(caps: &gst::Caps) -> gst::Caps {
    let mut ret = gst::Caps::new_empty();
    {
        let ret = ret.get_mut().unwrap();
        for (s, features) in caps.iter_with_features() {
            let mut s = s.to_owned();
            if !features.is_any() {
                s.set("width", gst::IntRange::new(1, i32::MAX));
                s.set("height", gst::IntRange::new(1, i32::MAX));
                if s.has_field("pixel-aspect-ratio") {
                    s.set(
                        "pixel-aspect-ratio",
                        gst::FractionRange::new(
                            gst::Fraction::new(1, i32::MAX),
                            gst::Fraction::new(i32::MAX, 1),
                        ),
                    );
                }
                s.remove_fields(["format", "drm-format", "colorimetry", "chroma-site"]);
            }

            if !ret.is_subset_structure_full(&s, Some(features)) {
                ret.append_structure_full(s, Some(features.to_owned()));
            }
        }
    }
    ret
}

#[glib::object_subclass]
impl ObjectSubclass for VaPostProc {
    const NAME: &'static str = "GstVaRsPostProc";
    type Type = super::VaPostProc;
    type ParentType = gst_base::BaseTransform;
    type Interfaces = (super::VideoDirection,);
}

impl ObjectImpl for VaPostProc {
    fn properties() -> &'static [glib::ParamSpec] {
        static PROPERTIES: LazyLock<Vec<glib::ParamSpec>> = LazyLock::new(|| {
            let mut props = vec![
                glib::ParamSpecBoolean::builder("disable-passthrough")
                    .nick("Disable Passthrough")
                    .blurb("Forces passing buffers through the postprocessor")
                    .default_value(DEFAULT_DISABLE_PASSTHROUGH)
                    .mutable_ready()
                    .build(),
                glib::ParamSpecBoolean::builder("add-borders")
                    .nick("Add Borders")
                    .blurb("Add black borders if necessary to keep the display aspect ratio")
                    .default_value(DEFAULT_ADD_BORDERS)
                    .mutable_playing()
                    .build(),
                glib::ParamSpecEnum::builder_with_default("scale-method", ScaleMethod::default())
                    .nick("Scale Method")
                    .blurb("Scale method to use")
                    .mutable_playing()
                    .build(),
                glib::ParamSpecOverride::for_interface::<super::VideoDirection>("video-direction"),
                glib::ParamSpecBoolean::builder("auto-saturation")
                    .nick("Auto-Saturation")
                    .blurb("Enable auto saturation")
                    .mutable_playing()
                    .build(),
                glib::ParamSpecBoolean::builder("auto-brightness")
                    .nick("Auto-Brightness")
                    .blurb("Enable auto brightness")
                    .mutable_playing()
                    .build(),
                glib::ParamSpecBoolean::builder("auto-contrast")
                    .nick("Auto-Contrast")
                    .blurb("Enable auto contrast")
                    .mutable_playing()
                    .build(),
                glib::ParamSpecBoolean::builder("hdr-tone-mapping")
                    .nick("HDR to SDR tone mapping")
                    .blurb("Enable HDR to SDR tone mapping when the input carries HDR10 metadata")
                    .mutable_playing()
                    .build(),
            ];

            props.extend(FLOAT_PROPERTIES.iter().map(|p| {
                glib::ParamSpecFloat::builder(p.name)
                    .nick(p.nick)
                    .blurb(p.nick)
                    .minimum(p.min)
                    .maximum(p.max)
                    .default_value(p.default)
                    .mutable_playing()
                    .build()
            }));

            props
        });

        PROPERTIES.as_ref()
    }

    fn set_property(&self, _id: usize, value: &glib::Value, pspec: &glib::ParamSpec) {
        let name = pspec.name();
        let mut settings = self.settings.lock().unwrap();

        if let Some(slot) = settings.float_slot(name) {
            let v = value.get::<f32>().expect("type checked upstream");
            gst::info!(CAT, imp = self, "Changing {} to {}", name, v);
            *slot = Some(v);
            drop(settings);
            self.state.lock().unwrap().rebuild_filters = true;
            return;
        }

        match name {
            "disable-passthrough" => {
                settings.disable_passthrough = value.get().expect("type checked upstream");
                drop(settings);
                self.update_passthrough(true);
            }
            "add-borders" => {
                settings.add_borders = value.get().expect("type checked upstream");
                drop(settings);
                self.obj().reconfigure_src();
            }
            "scale-method" => {
                let method = value.get::<ScaleMethod>().expect("type checked upstream");
                settings.scale_method = method;
                drop(settings);
                if let Some(filter) = self.filter() {
                    filter.set_scale_method(method.into());
                }
            }
            "video-direction" => {
                settings.video_direction = value.get().expect("type checked upstream");
                gst::info!(
                    CAT,
                    imp = self,
                    "Changing video direction to {:?}",
                    settings.video_direction
                );
                drop(settings);
                self.update_orientation();
                self.update_passthrough(true);
            }
            "auto-saturation" | "auto-brightness" | "auto-contrast" | "hdr-tone-mapping" => {
                let v = value.get::<bool>().expect("type checked upstream");
                match name {
                    "auto-saturation" => settings.auto_saturation = v,
                    "auto-brightness" => settings.auto_brightness = v,
                    "auto-contrast" => settings.auto_contrast = v,
                    _ => settings.hdr_tone_mapping = v,
                }
                drop(settings);
                self.state.lock().unwrap().rebuild_filters = true;
            }
            _ => unimplemented!(),
        }
    }

    fn property(&self, _id: usize, pspec: &glib::ParamSpec) -> glib::Value {
        let name = pspec.name();
        let mut settings = self.settings.lock().unwrap();

        if let Some(slot) = settings.float_slot(name) {
            let value = *slot;
            let default = FLOAT_PROPERTIES
                .iter()
                .find(|p| p.name == name)
                .map_or(0.0, |p| p.default);
            return value.unwrap_or(default).to_value();
        }

        match name {
            "disable-passthrough" => settings.disable_passthrough.to_value(),
            "add-borders" => settings.add_borders.to_value(),
            "scale-method" => settings.scale_method.to_value(),
            "video-direction" => settings.video_direction.to_value(),
            "auto-saturation" => settings.auto_saturation.to_value(),
            "auto-brightness" => settings.auto_brightness.to_value(),
            "auto-contrast" => settings.auto_contrast.to_value(),
            "hdr-tone-mapping" => settings.hdr_tone_mapping.to_value(),
            _ => unimplemented!(),
        }
    }
}

impl GstObjectImpl for VaPostProc {}

impl ElementImpl for VaPostProc {
    fn metadata() -> Option<&'static gst::subclass::ElementMetadata> {
        static ELEMENT_METADATA: LazyLock<gst::subclass::ElementMetadata> = LazyLock::new(|| {
            gst::subclass::ElementMetadata::new(
                "VA-API Video Postprocessor",
                "Filter/Converter/Video/Scaler/Hardware",
                "VA-API based video postprocessor",
                "The gst-plugin-va authors",
            )
        });

        Some(&*ELEMENT_METADATA)
    }

    fn pad_templates() -> &'static [gst::PadTemplate] {
        static PAD_TEMPLATES: LazyLock<Vec<gst::PadTemplate>> = LazyLock::new(|| {
            let caps = caps::template_caps(&caps::known_formats());
            let sink_pad_template = gst::PadTemplate::new(
                "sink",
                gst::PadDirection::Sink,
                gst::PadPresence::Always,
                &caps,
            )
            .unwrap();

            let src_pad_template = gst::PadTemplate::new(
                "src",
                gst::PadDirection::Src,
                gst::PadPresence::Always,
                &caps,
            )
            .unwrap();

            vec![src_pad_template, sink_pad_template]
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

impl BaseTransformImpl for VaPostProc {
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
        filter.set_scale_method(self.settings.lock().unwrap().scale_method.into());

        *self.state.lock().unwrap() = State {
            filter: Some(Arc::new(filter)),
            ..Default::default()
        };
        self.update_orientation();

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
        self.import_pool.clear();

        if let Some(filter) = self.state.lock().unwrap().filter.take() {
            filter.close();
        }
        *self.state.lock().unwrap() = State::default();

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

        BaseTransformImplExt::parent_query(self, direction, query)
    }

    fn transform_caps(
        &self,
        direction: gst::PadDirection,
        caps: &gst::Caps,
        filter: Option<&gst::Caps>,
    ) -> Option<gst::Caps> {
        gst::debug!(
            CAT,
            imp = self,
            "Transforming caps {} in direction {:?}",
            caps,
            direction
        );

        let mut ret = remove_format_fields(caps);
        for feature in MemoryFeature::ALL {
            let tmp = caps::complete_caps_features(&ret, feature);
            if !tmp.is_subset(&ret) {
                ret.make_mut().append(tmp);
            }
        }

        if let Some(filter) = filter {
            ret = filter.intersect_with_mode(&ret, gst::CapsIntersectMode::First);
        }

        gst::debug!(CAT, imp = self, "Returning caps {}", ret);
        Some(ret)
    }

    fn fixate_caps(
        &self,
        direction: gst::PadDirection,
        caps: &gst::Caps,
        othercaps: gst::Caps,
    ) -> gst::Caps {
        gst::debug!(
            CAT,
            imp = self,
            "Fixating caps {} against {} in direction {:?}",
            othercaps,
            caps,
            direction
        );

        let result = self.fixate_caps_impl(direction, caps, othercaps);
        gst::debug!(CAT, imp = self, "Fixated caps {}", result);
        result
    }

    fn set_caps(&self, incaps: &gst::Caps, outcaps: &gst::Caps) -> Result<(), gst::LoggableError> {
        let in_info = VaVideoInfo::from_caps(incaps)
            .map_err(|_| gst::loggable_error!(CAT, "Failed to parse input caps {}", incaps))?;
        let out_info = VaVideoInfo::from_caps(outcaps)
            .map_err(|_| gst::loggable_error!(CAT, "Failed to parse output caps {}", outcaps))?;

        if in_info.interlace_mode() != out_info.interlace_mode() {
            return Err(gst::loggable_error!(
                CAT,
                "Can't change interlace mode from {:?} to {:?}",
                in_info.interlace_mode(),
                out_info.interlace_mode()
            ));
        }

        let filter = self
            .filter()
            .ok_or_else(|| gst::loggable_error!(CAT, "Filter not open"))?;
        let add_borders = self.settings.lock().unwrap().add_borders;

        let borders = if add_borders {
            compute_borders(
                &in_info,
                &out_info,
                orientation_swaps_dimensions(filter.orientation()),
            )
        } else {
            (0, 0)
        };

        let in_feature = MemoryFeature::from_caps(incaps);
        let out_feature = MemoryFeature::from_caps(outcaps);
        {
            let mut state = self.state.lock().unwrap();
            let op = &mut state.op;
            op.set(
                Op::FORMAT,
                in_info.format() != out_info.format()
                    || in_info.colorimetry() != out_info.colorimetry(),
            );
            op.set(
                Op::SIZE,
                in_info.width() != out_info.width()
                    || in_info.height() != out_info.height()
                    || borders != (0, 0),
            );
            op.set(Op::FEATURE, in_feature != out_feature);

            state.borders = borders;
            state.va_to_raw =
                in_feature == Some(MemoryFeature::Va) && out_feature == Some(MemoryFeature::System);
            state.hdr_meta = hdr_metadata(incaps);
            state.rebuild_filters = true;
        }

        filter
            .set_video_info(&in_info, &out_info)
            .map_err(|err| gst::loggable_error!(CAT, "Failed to set video info: {}", err))?;

        gst::debug!(
            CAT,
            imp = self,
            "Configured {}x{} {:?} -> {}x{} {:?}, borders {:?}",
            in_info.width(),
            in_info.height(),
            in_info.format(),
            out_info.width(),
            out_info.height(),
            out_info.format(),
            borders
        );

        {
            let mut state = self.state.lock().unwrap();
            state.in_info = Some(in_info);
            state.out_info = Some(out_info);
        }

        self.rebuild_filters();
        self.update_passthrough(false);

        Ok(())
    }

    fn before_transform(&self, inbuf: &gst::BufferRef) {
        self.rebuild_filters();
        self.update_passthrough(true);

        let Some(filter) = self.filter() else {
            return;
        };
        let crop = !self.obj().is_passthrough()
            && inbuf.meta::<gst_video::VideoCropMeta>().is_some();
        self.state.lock().unwrap().op.set(Op::CROP, crop);
        filter.enable_cropping(crop);
    }

    fn prepare_output_buffer(
        &self,
        inbuf: InputBuffer,
    ) -> Result<PrepareOutputBufferSuccess, gst::FlowError> {
        {
            let mut state = self.state.lock().unwrap();
            // Only the memory changes: downstream maps the surface itself
            state.pseudo_passthrough = state.op == Op::FEATURE && state.va_to_raw;
            if state.pseudo_passthrough {
                gst::trace!(CAT, imp = self, "Pushing the input buffer as is");
                return Ok(PrepareOutputBufferSuccess::InputBuffer);
            }
        }

        self.parent_prepare_output_buffer(inbuf)
    }

    fn transform(
        &self,
        inbuf: &gst::Buffer,
        outbuf: &mut gst::BufferRef,
    ) -> Result<gst::FlowSuccess, gst::FlowError> {
        let (filter, in_info, out_info, borders) = {
            let state = self.state.lock().unwrap();
            if state.pseudo_passthrough {
                return Ok(gst::FlowSuccess::Ok);
            }
            match (&state.filter, &state.in_info, &state.out_info) {
                (Some(filter), Some(in_info), Some(out_info)) => (
                    filter.clone(),
                    in_info.clone(),
                    out_info.clone(),
                    state.borders,
                ),
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
        let imported = match importer.import(inbuf) {
            Ok(imported) => imported,
            Err(ImportError::InvalidBuffer) => return Ok(gst_base::BASE_TRANSFORM_FLOW_DROPPED),
            Err(ImportError::Flow(err)) => return Err(err),
        };
        let src =
            Sample::from_imported(&imported).with_flags(surface_flags(imported.buffer(), &in_info));

        let direct = display.buffer_surface(outbuf);
        let scratch = match direct {
            Some(_) => None,
            None => Some(self.scratch_buffer()?),
        };

        let result = {
            let dst_buffer: &gst::BufferRef = match &scratch {
                Some(buffer) => buffer.as_ref(),
                None => &*outbuf,
            };
            let surface = match direct {
                Some(surface) => surface,
                None => display
                    .buffer_surface(dst_buffer)
                    .ok_or(gst::FlowError::Error)?,
            };
            let dst = Sample::new(dst_buffer, surface)
                .with_borders(borders.0, borders.1)
                .with_flags(surface_flags(dst_buffer, &out_info));
            filter.process(&src, &dst)
        };

        if let Err(err) = result {
            gst::element_imp_error!(
                self,
                gst::LibraryError::Failed,
                ["Failed to process frame: {}", err]
            );
            outbuf.set_flags(gst::BufferFlags::CORRUPTED);
            return Ok(gst_base::BASE_TRANSFORM_FLOW_DROPPED);
        }

        if let Some(scratch) = scratch {
            let src_frame =
                gst_video::VideoFrameRef::from_buffer_ref_readable(scratch.as_ref(), &out_info)
                    .map_err(|_| gst::FlowError::Error)?;
            let mut dst_frame = gst_video::VideoFrameRef::from_buffer_ref_writable(outbuf, &out_info)
                .map_err(|_| gst::FlowError::Error)?;
            src_frame.copy(&mut dst_frame).map_err(|err| {
                gst::error!(CAT, imp = self, "Failed to copy output frame: {}", err);
                gst::FlowError::Error
            })?;
        }

        Ok(gst::FlowSuccess::Ok)
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
        negotiate::propose_allocation(&display, query, 0, true)
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

    fn unit_size(&self, caps: &gst::Caps) -> Option<usize> {
        VaVideoInfo::from_caps(caps).ok().map(|info| info.size())
    }

    fn src_event(&self, event: gst::Event) -> bool {
        if event.type_() == gst::EventType::Navigation {
            if let Some(mapped) = self.map_navigation(&event) {
                return self.parent_src_event(mapped);
            }
        }

        self.parent_src_event(event)
    }

    fn sink_event(&self, event: gst::Event) -> bool {
        if let gst::EventView::Tag(tag) = event.view() {
            let auto = self.settings.lock().unwrap().video_direction == VideoOrientationMethod::Auto;
            let method = tag
                .tag()
                .get::<gst::tags::ImageOrientation>()
                .and_then(|v| orientation_from_tag(v.get()));

            if let Some(method) = method {
                gst::debug!(CAT, imp = self, "Tagged orientation {:?}", method);
                self.state.lock().unwrap().tag_direction = method;
                if auto {
                    self.update_orientation();
                    self.update_passthrough(true);
                }
            }
        }

        self.parent_sink_event(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(width: u32, height: u32) -> gst_video::VideoInfo {
        gst_video::VideoInfo::builder(VideoFormat::Nv12, width, height)
            .build()
            .unwrap()
    }

    #[test]
    fn borders_keep_aspect_ratio() {
        gst::init().unwrap();

        assert_eq!(compute_borders(&info(1920, 1080), &info(640, 640), false), (0, 280));
        assert_eq!(compute_borders(&info(640, 480), &info(1920, 1080), false), (480, 0));
        assert_eq!(compute_borders(&info(1920, 1080), &info(1280, 720), false), (0, 0));
        // Rotated 16:9 into a square
        assert_eq!(compute_borders(&info(1920, 1080), &info(640, 640), true), (280, 0));
    }

    #[test]
    fn pointer_follows_scale_and_rotation() {
        use VideoOrientationMethod::*;

        gst::init().unwrap();

        assert_eq!(
            map_pointer(Identity, (10.0, 20.0), (640, 480), (320, 240)),
            (20.0, 40.0)
        );
        assert_eq!(
            map_pointer(_90r, (0.0, 0.0), (640, 480), (480, 640)),
            (0.0, 479.0)
        );
        assert_eq!(
            map_pointer(Horiz, (0.0, 5.0), (320, 240), (320, 240)),
            (319.0, 5.0)
        );
    }

    #[test]
    fn least_lossy_format_wins() {
        gst::init().unwrap();

        assert_eq!(format_loss(VideoFormat::Nv12, VideoFormat::Nv12), 0);
        assert!(
            format_loss(VideoFormat::Nv12, VideoFormat::I420)
                < format_loss(VideoFormat::Nv12, VideoFormat::Rgba)
        );
        assert!(
            format_loss(VideoFormat::Rgba, VideoFormat::Bgra)
                < format_loss(VideoFormat::Rgba, VideoFormat::Bgrx)
        );
        assert!(
            format_loss(VideoFormat::P01010le, VideoFormat::Nv12)
                > format_loss(VideoFormat::P01010le, VideoFormat::P01010le)
        );
    }

    #[test]
    fn image_orientation_tags() {
        assert_eq!(
            orientation_from_tag("rotate-90"),
            Some(VideoOrientationMethod::_90r)
        );
        assert_eq!(
            orientation_from_tag("flip-rotate-180"),
            Some(VideoOrientationMethod::Vert)
        );
        assert_eq!(orientation_from_tag("sideways"), None);
    }

    #[test]
    fn open_caps_cover_every_feature() {
        gst::init().unwrap();

        let caps = gst::Caps::builder("video/x-raw")
            .field("format", "NV12")
            .field("width", 320)
            .field("height", 240)
            .build();
        let open = remove_format_fields(&caps);
        let s = open.structure(0).unwrap();
        assert!(!s.has_field("format"));
        assert!(s.get::<i32>("width").is_err());

        let mut all = open.clone();
        for feature in MemoryFeature::ALL {
            let tmp = caps::complete_caps_features(&all, feature);
            all.make_mut().append(tmp);
        }
        for feature in MemoryFeature::ALL {
            assert!(all
                .iter_with_features()
                .any(|(_, f)| f.contains(feature.as_str())));
        }
    }
}
