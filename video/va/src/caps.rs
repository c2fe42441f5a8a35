// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! Translation between device capabilities and caps.

use gst::glib;
use gst_video::VideoFormat;
use std::ops::Deref;

use crate::device::{MemoryTypes, SurfaceAttributes};

pub const CAPS_FEATURE_MEMORY_VA: &str = "memory:VAMemory";
pub const CAPS_FEATURE_MEMORY_DMABUF: &str = "memory:DMABuf";
pub const CAPS_FEATURE_MEMORY_SYSTEM: &str = "memory:SystemMemory";

pub const DMA_DRM_FORMAT: &str = "DMA_DRM";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryFeature {
    System,
    Va,
    DmaBuf,
}

impl MemoryFeature {
    pub const ALL: [MemoryFeature; 3] = [MemoryFeature::Va, MemoryFeature::DmaBuf, MemoryFeature::System];

    pub fn as_str(self) -> &'static str {
        match self {
            MemoryFeature::System => CAPS_FEATURE_MEMORY_SYSTEM,
            MemoryFeature::Va => CAPS_FEATURE_MEMORY_VA,
            MemoryFeature::DmaBuf => CAPS_FEATURE_MEMORY_DMABUF,
        }
    }

    pub fn caps_features(self) -> gst::CapsFeatures {
        gst::CapsFeatures::new([self.as_str()])
    }

    pub fn from_features(features: Option<&gst::CapsFeaturesRef>) -> Self {
        match features {
            Some(f) if f.contains(CAPS_FEATURE_MEMORY_VA) => MemoryFeature::Va,
            Some(f) if f.contains(CAPS_FEATURE_MEMORY_DMABUF) => MemoryFeature::DmaBuf,
            _ => MemoryFeature::System,
        }
    }

    /// Memory feature of the first structure of `caps`.
    pub fn from_caps(caps: &gst::CapsRef) -> Option<Self> {
        if caps.is_empty() || caps.is_any() {
            return None;
        }
        Some(Self::from_features(caps.features(0)))
    }
}

pub fn caps_is_dmabuf(caps: &gst::CapsRef) -> bool {
    MemoryFeature::from_caps(caps) == Some(MemoryFeature::DmaBuf)
}

pub fn caps_is_raw(caps: &gst::CapsRef) -> bool {
    MemoryFeature::from_caps(caps) == Some(MemoryFeature::System)
}

const fn fourcc(code: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*code)
}

static DRM_FORMATS: &[(VideoFormat, u32)] = &[
    (VideoFormat::Nv12, fourcc(b"NV12")),
    (VideoFormat::I420, fourcc(b"YU12")),
    (VideoFormat::Yv12, fourcc(b"YV12")),
    (VideoFormat::Yuy2, fourcc(b"YUYV")),
    (VideoFormat::Uyvy, fourcc(b"UYVY")),
    (VideoFormat::P01010le, fourcc(b"P010")),
    (VideoFormat::Rgba, fourcc(b"AB24")),
    (VideoFormat::Bgra, fourcc(b"AR24")),
    (VideoFormat::Argb, fourcc(b"BA24")),
    (VideoFormat::Abgr, fourcc(b"RA24")),
    (VideoFormat::Rgbx, fourcc(b"XB24")),
    (VideoFormat::Bgrx, fourcc(b"XR24")),
    (VideoFormat::Gray8, fourcc(b"R8  ")),
];

pub const DRM_FORMAT_MOD_LINEAR: u64 = 0;

/// Every format with a DRM fourcc, used for pad templates.
pub fn known_formats() -> Vec<VideoFormat> {
    DRM_FORMATS.iter().map(|&(f, _)| f).collect()
}

pub fn drm_fourcc_from_format(format: VideoFormat) -> Option<u32> {
    DRM_FORMATS
        .iter()
        .find_map(|&(f, code)| (f == format).then_some(code))
}

pub fn format_from_drm_fourcc(code: u32) -> Option<VideoFormat> {
    DRM_FORMATS
        .iter()
        .find_map(|&(f, c)| (c == code).then_some(f))
}

fn fourcc_to_string(code: u32) -> String {
    code.to_le_bytes().iter().map(|&b| b as char).collect()
}

/// `drm-format` caps value for `format`, e.g. `NV12` or
/// `NV12:0x0100000000000001`.
pub fn drm_format_string(format: VideoFormat, modifier: u64) -> Option<String> {
    let code = fourcc_to_string(drm_fourcc_from_format(format)?);
    let code = code.trim_end();
    if modifier == DRM_FORMAT_MOD_LINEAR {
        Some(code.to_string())
    } else {
        Some(format!("{code}:{modifier:#018x}"))
    }
}

pub fn parse_drm_format(s: &str) -> Option<(u32, u64)> {
    let (code, modifier) = match s.split_once(':') {
        Some((code, modifier)) => {
            let modifier = modifier.strip_prefix("0x").unwrap_or(modifier);
            (code, u64::from_str_radix(modifier, 16).ok()?)
        }
        None => (s, DRM_FORMAT_MOD_LINEAR),
    };

    if code.is_empty() || code.len() > 4 || !code.is_ascii() {
        return None;
    }
    let mut bytes = [b' '; 4];
    bytes[..code.len()].copy_from_slice(code.as_bytes());
    Some((u32::from_le_bytes(bytes), modifier))
}

/// Negotiated video info, raw or DMA-DRM.
#[derive(Debug, Clone, PartialEq)]
pub enum VaVideoInfo {
    Raw(gst_video::VideoInfo),
    DmaDrm {
        info: gst_video::VideoInfo,
        fourcc: u32,
        modifier: u64,
    },
}

impl Deref for VaVideoInfo {
    type Target = gst_video::VideoInfo;

    fn deref(&self) -> &Self::Target {
        match self {
            VaVideoInfo::Raw(info) => info,
            VaVideoInfo::DmaDrm { info, .. } => info,
        }
    }
}

impl VaVideoInfo {
    pub fn from_caps(caps: &gst::CapsRef) -> Result<Self, glib::BoolError> {
        let s = caps
            .structure(0)
            .ok_or_else(|| glib::bool_error!("Empty caps"))?;

        if !caps_is_dmabuf(caps) || s.get::<&str>("format").ok() != Some(DMA_DRM_FORMAT) {
            return gst_video::VideoInfo::from_caps(caps).map(VaVideoInfo::Raw);
        }

        let drm_format = s
            .get::<&str>("drm-format")
            .map_err(|_| glib::bool_error!("DMA_DRM caps without drm-format"))?;
        let (code, modifier) = parse_drm_format(drm_format)
            .ok_or_else(|| glib::bool_error!("Invalid drm-format {}", drm_format))?;
        let format = format_from_drm_fourcc(code)
            .ok_or_else(|| glib::bool_error!("Unsupported drm-format {}", drm_format))?;

        let mut s = s.to_owned();
        s.remove_field("drm-format");
        s.set("format", format.to_str());
        let mut raw = gst::Caps::new_empty();
        raw.get_mut().unwrap().append_structure(s);
        let info = gst_video::VideoInfo::from_caps(&raw)?;

        Ok(VaVideoInfo::DmaDrm {
            info,
            fourcc: code,
            modifier,
        })
    }

    pub fn info(&self) -> &gst_video::VideoInfo {
        self
    }

    pub fn is_dma_drm(&self) -> bool {
        matches!(self, VaVideoInfo::DmaDrm { .. })
    }

    pub fn modifier(&self) -> u64 {
        match self {
            VaVideoInfo::Raw(_) => DRM_FORMAT_MOD_LINEAR,
            VaVideoInfo::DmaDrm { modifier, .. } => *modifier,
        }
    }
}

fn size_range(min: u32, max: u32) -> gst::IntRange<i32> {
    let min = min.clamp(1, i32::MAX as u32) as i32;
    let max = max.clamp(1, i32::MAX as u32) as i32;
    gst::IntRange::new(min, max.max(min))
}

fn format_list(formats: &[VideoFormat]) -> gst::List {
    gst::List::new(formats.iter().map(|f| f.to_str().as_str()))
}

fn formats_from_drm_value(value: &glib::SendValue) -> Vec<VideoFormat> {
    let strings = if let Ok(s) = value.get::<&str>() {
        vec![s.to_string()]
    } else if let Ok(list) = value.get::<gst::List>() {
        list.iter()
            .filter_map(|v| v.get::<&str>().ok().map(String::from))
            .collect()
    } else {
        Vec::new()
    };

    strings
        .iter()
        .filter_map(|s| parse_drm_format(s))
        .filter_map(|(code, _)| format_from_drm_fourcc(code))
        .collect()
}

fn raw_formats(value: &glib::SendValue) -> Option<Vec<VideoFormat>> {
    let formats = if let Ok(s) = value.get::<&str>() {
        vec![VideoFormat::from_string(s)]
    } else if let Ok(list) = value.get::<gst::List>() {
        list.iter()
            .filter_map(|v| v.get::<&str>().ok())
            .map(VideoFormat::from_string)
            .collect()
    } else {
        return None;
    };

    Some(
        formats
            .into_iter()
            .filter(|f| *f != VideoFormat::Unknown)
            .collect(),
    )
}

/// Caps of everything a device can handle: VA memory, DMA-buf (when the
/// device can import or export it) and system memory, all with the same
/// formats and size range.
pub fn caps_from_attributes(attrs: &SurfaceAttributes) -> gst::Caps {
    let width = size_range(attrs.min_width, attrs.max_width);
    let height = size_range(attrs.min_height, attrs.max_height);
    let formats = attrs
        .formats
        .iter()
        .copied()
        .filter(|f| *f != VideoFormat::Unknown)
        .collect::<Vec<_>>();

    let mut caps = gst::Caps::new_empty();
    {
        let caps = caps.get_mut().unwrap();

        let framerate = gst::FractionRange::new(
            gst::Fraction::new(0, 1),
            gst::Fraction::new(i32::MAX, 1),
        );

        let va = gst::Caps::builder("video/x-raw")
            .features([CAPS_FEATURE_MEMORY_VA])
            .field("format", format_list(&formats))
            .field("width", width)
            .field("height", height)
            .field("framerate", framerate)
            .build();
        caps.append(va);

        if attrs
            .mem_types
            .intersects(MemoryTypes::DRM_PRIME | MemoryTypes::DRM_PRIME_2)
        {
            let drm_formats = formats
                .iter()
                .filter_map(|&f| drm_format_string(f, DRM_FORMAT_MOD_LINEAR))
                .collect::<Vec<_>>();
            if !drm_formats.is_empty() {
                let dma = gst::Caps::builder("video/x-raw")
                    .features([CAPS_FEATURE_MEMORY_DMABUF])
                    .field("format", DMA_DRM_FORMAT)
                    .field("drm-format", gst::List::new(drm_formats))
                    .field("width", width)
                    .field("height", height)
                    .field("framerate", framerate)
                    .build();
                caps.append(dma);
            }
        }

        let sys = gst::Caps::builder("video/x-raw")
            .field("format", format_list(&formats))
            .field("width", width)
            .field("height", height)
            .field("framerate", framerate)
            .build();
        caps.append(sys);
    }

    caps
}

/// Template caps used for pad templates, before a device is open.
pub fn template_caps(formats: &[VideoFormat]) -> gst::Caps {
    caps_from_attributes(&SurfaceAttributes {
        formats: formats.to_vec(),
        min_width: 1,
        min_height: 1,
        max_width: i32::MAX as u32,
        max_height: i32::MAX as u32,
        mem_types: MemoryTypes::VA | MemoryTypes::DRM_PRIME_2,
    })
}

/// Copy of `caps` with `feature` on every structure, for caps whose format
/// fields were removed.
pub fn complete_caps_features(caps: &gst::CapsRef, feature: MemoryFeature) -> gst::Caps {
    let mut tmp = gst::Caps::new_empty();
    {
        let tmp = tmp.get_mut().unwrap();
        let features = feature.caps_features();
        for s in caps.iter() {
            if !tmp.is_subset_structure_full(s, Some(&*features)) {
                tmp.append_structure_full(s.to_owned(), Some(features.clone()));
            }
        }
    }
    tmp
}

/// Copy of `caps` with every structure's features replaced by `feature`.
pub fn caps_with_feature(caps: &gst::CapsRef, feature: MemoryFeature) -> gst::Caps {
    let mut out = gst::Caps::new_empty();
    {
        let out = out.get_mut().unwrap();
        for s in caps.iter() {
            let mut s = s.to_owned();
            if feature == MemoryFeature::DmaBuf {
                let formats = match s.value("format") {
                    Ok(v) if v.get::<&str>().ok() != Some(DMA_DRM_FORMAT) => raw_formats(v),
                    _ => None,
                };
                if let Some(formats) = formats {
                    let drm = formats
                        .iter()
                        .filter_map(|&f| drm_format_string(f, DRM_FORMAT_MOD_LINEAR))
                        .collect::<Vec<_>>();
                    s.set("format", DMA_DRM_FORMAT);
                    match drm.as_slice() {
                        [one] => s.set("drm-format", one.as_str()),
                        _ => s.set("drm-format", gst::List::new(drm)),
                    }
                }
            } else if s.get::<&str>("format").ok() == Some(DMA_DRM_FORMAT) {
                let formats = s
                    .value("drm-format")
                    .map(formats_from_drm_value)
                    .unwrap_or_default();
                match formats.as_slice() {
                    [] => s.remove_field("format"),
                    [format] => s.set("format", format.to_str()),
                    formats => s.set("format", format_list(formats)),
                }
                s.remove_field("drm-format");
            }
            out.append_structure_full(s, Some(feature.caps_features()));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drm_format_strings() {
        assert_eq!(
            drm_format_string(VideoFormat::Nv12, 0).as_deref(),
            Some("NV12")
        );
        assert_eq!(
            drm_format_string(VideoFormat::Nv12, 0x0100_0000_0000_0001).as_deref(),
            Some("NV12:0x0100000000000001")
        );
        assert_eq!(
            parse_drm_format("NV12:0x0100000000000001"),
            Some((fourcc(b"NV12"), 0x0100_0000_0000_0001))
        );
        assert_eq!(parse_drm_format("R8"), Some((fourcc(b"R8  "), 0)));
        assert_eq!(parse_drm_format("NV12:zz"), None);
    }

    #[test]
    fn dma_drm_video_info() {
        gst::init().unwrap();

        let caps = gst::Caps::builder("video/x-raw")
            .features([CAPS_FEATURE_MEMORY_DMABUF])
            .field("format", DMA_DRM_FORMAT)
            .field("drm-format", "NV12:0x0100000000000001")
            .field("width", 1920i32)
            .field("height", 1080i32)
            .field("framerate", gst::Fraction::new(30, 1))
            .build();

        let info = VaVideoInfo::from_caps(&caps).unwrap();
        assert!(info.is_dma_drm());
        assert_eq!(info.format(), VideoFormat::Nv12);
        assert_eq!(info.width(), 1920);
        assert_eq!(info.modifier(), 0x0100_0000_0000_0001);

        let raw = gst_video::VideoCapsBuilder::new()
            .format(VideoFormat::I420)
            .width(320)
            .height(240)
            .build();
        let info = VaVideoInfo::from_caps(&raw).unwrap();
        assert!(!info.is_dma_drm());
        assert_eq!(info.modifier(), DRM_FORMAT_MOD_LINEAR);
    }

    #[test]
    fn device_caps_carry_all_features() {
        gst::init().unwrap();

        let caps = caps_from_attributes(&SurfaceAttributes {
            formats: vec![VideoFormat::Nv12, VideoFormat::Rgba],
            min_width: 16,
            min_height: 16,
            max_width: 4096,
            max_height: 4096,
            mem_types: MemoryTypes::VA | MemoryTypes::DRM_PRIME_2,
        });

        assert_eq!(caps.size(), 3);
        assert!(caps.features(0).unwrap().contains(CAPS_FEATURE_MEMORY_VA));
        assert!(caps.features(1).unwrap().contains(CAPS_FEATURE_MEMORY_DMABUF));
        assert_eq!(
            caps.structure(1).unwrap().get::<&str>("format").unwrap(),
            DMA_DRM_FORMAT
        );

        let sys = caps_with_feature(
            &gst::Caps::builder_full()
                .structure_with_features(
                    caps.structure(1).unwrap().to_owned(),
                    caps.features(1).unwrap().to_owned(),
                )
                .build(),
            MemoryFeature::System,
        );
        assert!(caps_is_raw(&sys));
        let s = sys.structure(0).unwrap();
        assert!(!s.has_field("drm-format"));
        assert!(s.get::<gst::List>("format").is_ok());
    }
}
