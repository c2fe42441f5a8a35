// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! Mapping of video colorimetry, chroma siting and interlacing onto the
//! device's colour standards and surface flags.

use gst_video::prelude::*;
use gst_video::{VideoChromaSite, VideoColorRange, VideoColorimetry};

use crate::device::{ChromaSiting, ColorProperties, ColorRange, ColorStandard, SurfaceFlags};

struct StandardProperties {
    standard: ColorStandard,
    primaries: u8,
    transfer: u8,
    matrix: u8,
}

const fn props(standard: ColorStandard, primaries: u8, transfer: u8, matrix: u8) -> StandardProperties {
    StandardProperties {
        standard,
        primaries,
        transfer,
        matrix,
    }
}

// ISO/IEC 23001-8 code points of each standard
static STANDARD_PROPERTIES: &[StandardProperties] = &[
    props(ColorStandard::Bt601, 5, 6, 5),
    props(ColorStandard::Bt601, 6, 6, 6),
    props(ColorStandard::Bt709, 1, 1, 1),
    props(ColorStandard::Bt470M, 4, 4, 4),
    props(ColorStandard::Bt470Bg, 5, 5, 5),
    props(ColorStandard::Smpte170M, 6, 6, 6),
    props(ColorStandard::Smpte240M, 7, 7, 7),
    props(ColorStandard::GenericFilm, 8, 1, 1),
    props(ColorStandard::Srgb, 1, 13, 0),
    props(ColorStandard::XvYcc601, 1, 11, 5),
    props(ColorStandard::XvYcc709, 1, 11, 1),
    props(ColorStandard::Bt2020, 9, 14, 9),
];

fn matches(colorimetry: &VideoColorimetry, name: &str) -> bool {
    let Ok(other) = name.parse::<VideoColorimetry>() else {
        return false;
    };
    colorimetry.primaries() == other.primaries()
        && colorimetry.transfer() == other.transfer()
        && colorimetry.matrix() == other.matrix()
        && colorimetry.range() == other.range()
}

/// The standard `colorimetry` is known as, if any.
pub fn standard_from_colorimetry(colorimetry: &VideoColorimetry) -> ColorStandard {
    if colorimetry.primaries() == gst_video::VideoColorPrimaries::Unknown {
        return ColorStandard::None;
    }

    if matches(colorimetry, "bt709") {
        ColorStandard::Bt709
    } else if matches(colorimetry, "bt2020-10") || matches(colorimetry, "bt2020") {
        ColorStandard::Bt2020
    } else if matches(colorimetry, "bt601") {
        ColorStandard::Bt601
    } else if matches(colorimetry, "smpte240m") {
        ColorStandard::Smpte240M
    } else if matches(colorimetry, "sRGB") {
        ColorStandard::Srgb
    } else {
        ColorStandard::None
    }
}

pub fn chroma_siting(site: VideoChromaSite) -> ChromaSiting {
    // JPEG and MPEG2 are aliases of NONE and H_COSITED
    if site == VideoChromaSite::NONE {
        ChromaSiting::VERTICAL_CENTER | ChromaSiting::HORIZONTAL_CENTER
    } else if site == VideoChromaSite::H_COSITED {
        ChromaSiting::VERTICAL_CENTER | ChromaSiting::HORIZONTAL_LEFT
    } else if site == VideoChromaSite::V_COSITED {
        ChromaSiting::VERTICAL_TOP | ChromaSiting::VERTICAL_BOTTOM
    } else if site == VideoChromaSite::COSITED {
        ChromaSiting::VERTICAL_CENTER
            | ChromaSiting::HORIZONTAL_LEFT
            | ChromaSiting::VERTICAL_TOP
            | ChromaSiting::VERTICAL_BOTTOM
    } else if site == VideoChromaSite::DV {
        ChromaSiting::VERTICAL_TOP | ChromaSiting::HORIZONTAL_LEFT
    } else {
        ChromaSiting::empty()
    }
}

pub fn color_range(range: VideoColorRange) -> ColorRange {
    match range {
        VideoColorRange::Range0_255 => ColorRange::Full,
        VideoColorRange::Range16_235 => ColorRange::Reduced,
        _ => ColorRange::Unknown,
    }
}

/// Picks the colour standard for `info` among the ones the device
/// supports, with the explicit properties to pass along.
///
/// An exact match wins. Otherwise a device taking explicit properties gets
/// them, and failing that the standard whose code points differ the least
/// is used (matrix weighing most, then transfer, then primaries).
pub fn color_properties(
    info: &gst_video::VideoInfo,
    supported: &[ColorStandard],
) -> (ColorStandard, ColorProperties) {
    let colorimetry = info.colorimetry();
    let mut primaries = colorimetry.primaries().to_iso() as u8;
    let mut transfer = colorimetry.transfer().to_iso() as u8;
    let mut matrix = colorimetry.matrix().to_iso() as u8;

    let exact = standard_from_colorimetry(&colorimetry);
    let standard = if exact != ColorStandard::None && supported.contains(&exact) {
        exact
    } else if supported.contains(&ColorStandard::Explicit) {
        ColorStandard::Explicit
    } else {
        let has_matrix = !matches!(
            colorimetry.matrix(),
            gst_video::VideoColorMatrix::Unknown | gst_video::VideoColorMatrix::Rgb
        );
        let has_transfer = colorimetry.transfer() != gst_video::VideoTransferFunction::Unknown;
        let has_primaries = colorimetry.primaries() != gst_video::VideoColorPrimaries::Unknown;

        let worst = 4 * has_matrix as u32 + 2 * has_transfer as u32 + has_primaries as u32;
        if worst == 0 {
            return (ColorStandard::None, ColorProperties::default());
        }

        let best = supported
            .iter()
            .flat_map(|s| STANDARD_PROPERTIES.iter().filter(move |p| p.standard == *s))
            .map(|p| {
                let score = 4 * (has_matrix && matrix != p.matrix) as u32
                    + 2 * (has_transfer && transfer != p.transfer) as u32
                    + (has_primaries && primaries != p.primaries) as u32;
                (score, p)
            })
            .filter(|(score, _)| *score < worst)
            .min_by_key(|(score, _)| *score);

        match best {
            Some((_, p)) => {
                primaries = p.primaries;
                transfer = p.transfer;
                matrix = p.matrix;
                p.standard
            }
            None => ColorStandard::None,
        }
    };

    (
        standard,
        ColorProperties {
            chroma_sample_location: chroma_siting(info.chroma_site()),
            color_range: color_range(colorimetry.range()),
            colour_primaries: primaries,
            transfer_characteristics: transfer,
            matrix_coefficients: matrix,
        },
    )
}

/// Field layout of `buffer` as the processing pipeline wants to know it.
pub fn surface_flags(buffer: &gst::BufferRef, info: &gst_video::VideoInfo) -> SurfaceFlags {
    use gst_video::{VideoBufferFlags, VideoFieldOrder, VideoInterlaceMode};

    let mode = info.interlace_mode();
    let order = info.field_order();

    if mode == VideoInterlaceMode::Mixed
        || (mode == VideoInterlaceMode::Interleaved && order == VideoFieldOrder::Unknown)
    {
        let flags = buffer.video_flags();
        if !flags.contains(VideoBufferFlags::INTERLACED) {
            SurfaceFlags::empty()
        } else if flags.contains(VideoBufferFlags::TFF) {
            SurfaceFlags::TOP_FIELD_FIRST
        } else {
            SurfaceFlags::BOTTOM_FIELD_FIRST
        }
    } else if order == VideoFieldOrder::BottomFieldFirst {
        SurfaceFlags::BOTTOM_FIELD_FIRST
    } else if order == VideoFieldOrder::TopFieldFirst {
        SurfaceFlags::TOP_FIELD_FIRST
    } else {
        SurfaceFlags::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_with(colorimetry: VideoColorimetry) -> gst_video::VideoInfo {
        gst_video::VideoInfo::builder(gst_video::VideoFormat::Nv12, 320, 240)
            .colorimetry(&colorimetry)
            .build()
            .unwrap()
    }

    #[test]
    fn exact_standard_wins() {
        gst::init().unwrap();

        let info = info_with("bt709".parse().unwrap());
        let (standard, props) =
            color_properties(&info, &[ColorStandard::Bt601, ColorStandard::Bt709]);
        assert_eq!(standard, ColorStandard::Bt709);
        assert_eq!(props.color_range, ColorRange::Reduced);
        assert_eq!(props.matrix_coefficients, 1);
    }

    #[test]
    fn explicit_is_preferred_to_scoring() {
        gst::init().unwrap();

        let info = info_with("bt2020".parse().unwrap());
        let (standard, props) =
            color_properties(&info, &[ColorStandard::Bt709, ColorStandard::Explicit]);
        assert_eq!(standard, ColorStandard::Explicit);
        assert_eq!(props.colour_primaries, 9);
    }

    #[test]
    fn closest_standard_by_score() {
        gst::init().unwrap();

        // BT.2020 primaries with BT.709 matrix and transfer
        let info = info_with(VideoColorimetry::new(
            VideoColorRange::Range16_235,
            gst_video::VideoColorMatrix::Bt709,
            gst_video::VideoTransferFunction::Bt709,
            gst_video::VideoColorPrimaries::Bt2020,
        ));
        let (standard, props) =
            color_properties(&info, &[ColorStandard::Bt601, ColorStandard::Bt709]);
        assert_eq!(standard, ColorStandard::Bt709);
        assert_eq!(props.colour_primaries, 1);
    }

    #[test]
    fn unknown_colorimetry_maps_to_none() {
        gst::init().unwrap();

        let info = info_with(VideoColorimetry::new(
            VideoColorRange::Unknown,
            gst_video::VideoColorMatrix::Unknown,
            gst_video::VideoTransferFunction::Unknown,
            gst_video::VideoColorPrimaries::Unknown,
        ));
        let (standard, props) = color_properties(&info, &[ColorStandard::Bt709]);
        assert_eq!(standard, ColorStandard::None);
        assert_eq!(props, ColorProperties::default());
    }

    #[test]
    fn surface_flags_follow_field_order() {
        gst::init().unwrap();

        let info = gst_video::VideoInfo::builder(gst_video::VideoFormat::Nv12, 320, 240)
            .interlace_mode(gst_video::VideoInterlaceMode::Mixed)
            .build()
            .unwrap();

        let mut buffer = gst::Buffer::new();
        assert_eq!(surface_flags(&buffer, &info), SurfaceFlags::empty());

        buffer.get_mut().unwrap().set_video_flags(
            gst_video::VideoBufferFlags::INTERLACED | gst_video::VideoBufferFlags::TFF,
        );
        assert_eq!(surface_flags(&buffer, &info), SurfaceFlags::TOP_FIELD_FIRST);

        buffer
            .get_mut()
            .unwrap()
            .unset_video_flags(gst_video::VideoBufferFlags::TFF);
        assert_eq!(surface_flags(&buffer, &info), SurfaceFlags::BOTTOM_FIELD_FIRST);
    }

    #[test]
    fn chroma_sites() {
        gst::init().unwrap();

        assert_eq!(
            chroma_siting(VideoChromaSite::MPEG2),
            ChromaSiting::VERTICAL_CENTER | ChromaSiting::HORIZONTAL_LEFT
        );
        assert_eq!(chroma_siting(VideoChromaSite::empty()), ChromaSiting::empty());
        assert_eq!(color_range(VideoColorRange::Range0_255), ColorRange::Full);
    }
}
