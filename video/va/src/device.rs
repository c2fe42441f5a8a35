// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! The hardware acceleration device as seen by the rest of the plugin.
//!
//! Everything that talks to a driver goes through [`Device`]. Parameters that
//! libva passes around as untyped buffers are typed here, so an
//! implementation never has to interpret raw memory.

use bitflags::bitflags;
use std::fmt;
use std::os::fd::{OwnedFd, RawFd};

use crate::error::VaError;

macro_rules! id_type {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }
    };
}

id_type!(SurfaceId);
id_type!(ConfigId);
id_type!(ContextId);
id_type!(BufferId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Profile {
    None,
    H264Main,
    H264High,
    HevcMain,
    HevcMain10,
    Vp9Profile0,
    Av1Profile0,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Entrypoint {
    Vld,
    EncSlice,
    EncSliceLp,
    EncPicture,
    VideoProc,
}

impl Entrypoint {
    pub fn is_encode(self) -> bool {
        matches!(
            self,
            Entrypoint::EncSlice | Entrypoint::EncSliceLp | Entrypoint::EncPicture
        )
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RtFormat: u32 {
        const YUV420 = 0x0000_0001;
        const YUV422 = 0x0000_0002;
        const YUV444 = 0x0000_0004;
        const YUV400 = 0x0000_0010;
        const YUV420_10 = 0x0000_0100;
        const YUV422_10 = 0x0000_0200;
        const YUV444_10 = 0x0000_0400;
        const RGB32 = 0x0002_0000;
        const RGBP = 0x0010_0000;
        const RGB32_10 = 0x0020_0000;
    }
}

bitflags! {
    /// How a surface is going to be used; drivers pick tiling and
    /// placement from it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct UsageHint: u32 {
        const GENERIC = 0x0000_0000;
        const DECODER = 0x0000_0001;
        const ENCODER = 0x0000_0002;
        const VPP_READ = 0x0000_0004;
        const VPP_WRITE = 0x0000_0008;
        const DISPLAY = 0x0000_0010;
        const EXPORT = 0x0000_0020;
    }
}

impl UsageHint {
    pub fn for_entrypoint(entrypoint: Entrypoint, direction: gst::PadDirection, is_dma: bool) -> Self {
        match entrypoint {
            // DMA caps were probed with both flags set to learn the
            // modifiers, so the same flags must be used at runtime to get
            // the same modifiers back.
            Entrypoint::VideoProc if is_dma => UsageHint::VPP_READ | UsageHint::VPP_WRITE,
            Entrypoint::VideoProc => match direction {
                gst::PadDirection::Sink => UsageHint::VPP_READ,
                gst::PadDirection::Src => UsageHint::VPP_WRITE,
                _ => UsageHint::GENERIC,
            },
            Entrypoint::Vld => UsageHint::DECODER,
            e if e.is_encode() => UsageHint::ENCODER,
            _ => UsageHint::GENERIC,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MemoryTypes: u32 {
        const VA = 0x0000_0001;
        const USER_PTR = 0x0000_0004;
        const DRM_PRIME = 0x2000_0000;
        const DRM_PRIME_2 = 0x4000_0000;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MirrorFlags: u32 {
        const HORIZONTAL = 0x0000_0001;
        const VERTICAL = 0x0000_0002;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BlendFlags: u32 {
        const GLOBAL_ALPHA = 0x0000_0001;
        const PREMULTIPLIED_ALPHA = 0x0000_0002;
        const LUMA_KEY = 0x0000_0010;
    }
}

bitflags! {
    /// Per-surface flags of a processing call: picture structure and field
    /// order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SurfaceFlags: u32 {
        const TOP_FIELD = 0x0000_0001;
        const BOTTOM_FIELD = 0x0000_0002;
        const TOP_FIELD_FIRST = 0x0000_0004;
        const BOTTOM_FIELD_FIRST = 0x0000_0008;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ToneMappingFlags: u32 {
        const HDR_TO_HDR = 0x0000_0001;
        const HDR_TO_SDR = 0x0000_0002;
        const HDR_TO_EDR = 0x0000_0004;
        const SDR_TO_HDR = 0x0000_0008;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Rotation {
    #[default]
    None = 0,
    R90 = 1,
    R180 = 2,
    R270 = 3,
}

impl Rotation {
    /// Bit of this rotation in a device's rotation mask.
    pub fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ScaleMethod {
    #[default]
    Default,
    Fast,
    HighQuality,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterType {
    NoiseReduction,
    Deinterlacing,
    Sharpening,
    ColorBalance,
    SkinToneEnhancement,
    HighDynamicRangeToneMapping,
}

impl FilterType {
    /// Number of capability entries requested when querying this filter.
    pub fn cap_count(self) -> usize {
        match self {
            FilterType::NoiseReduction
            | FilterType::Sharpening
            | FilterType::SkinToneEnhancement => 1,
            FilterType::Deinterlacing => 4,
            FilterType::ColorBalance => 7,
            FilterType::HighDynamicRangeToneMapping => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeinterlaceMethod {
    Bob,
    Weave,
    MotionAdaptive,
    MotionCompensated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorBalanceKind {
    Hue,
    Saturation,
    Brightness,
    Contrast,
    AutoSaturation,
    AutoBrightness,
    AutoContrast,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterRange {
    pub min: f32,
    pub max: f32,
    pub default: f32,
    pub step: f32,
}

impl FilterRange {
    pub fn clamp(&self, value: f32) -> f32 {
        value.clamp(self.min, self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorBalanceCap {
    pub kind: ColorBalanceKind,
    pub range: FilterRange,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HdrCap {
    pub hdr10: bool,
    pub flags: ToneMappingFlags,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterCaps {
    /// Single range filters. `None` for drivers exposing an on/off filter.
    Simple(Option<FilterRange>),
    ColorBalance(Vec<ColorBalanceCap>),
    Deinterlacing(Vec<DeinterlaceMethod>),
    Hdr(Vec<HdrCap>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Hdr10Metadata {
    pub display_primaries_x: [u16; 3],
    pub display_primaries_y: [u16; 3],
    pub white_point_x: u16,
    pub white_point_y: u16,
    pub max_display_mastering_luminance: u32,
    pub min_display_mastering_luminance: u32,
    pub max_content_light_level: u16,
    pub max_pic_average_light_level: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterParameter {
    NoiseReduction(f32),
    Sharpening(f32),
    SkinTone(f32),
    ColorBalance(Vec<(ColorBalanceKind, f32)>),
    Deinterlacing(DeinterlaceMethod),
    HdrToneMapping(Hdr10Metadata),
}

impl FilterParameter {
    pub fn filter_type(&self) -> FilterType {
        match self {
            FilterParameter::NoiseReduction(_) => FilterType::NoiseReduction,
            FilterParameter::Sharpening(_) => FilterType::Sharpening,
            FilterParameter::SkinTone(_) => FilterType::SkinToneEnhancement,
            FilterParameter::ColorBalance(_) => FilterType::ColorBalance,
            FilterParameter::Deinterlacing(_) => FilterType::Deinterlacing,
            FilterParameter::HdrToneMapping(_) => FilterType::HighDynamicRangeToneMapping,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Rect {
            x,
            y,
            width,
            height,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ColorStandard {
    #[default]
    None,
    Bt601,
    Bt709,
    Bt470M,
    Bt470Bg,
    Smpte170M,
    Smpte240M,
    GenericFilm,
    Srgb,
    Stram,
    XvYcc601,
    XvYcc709,
    Bt2020,
    Explicit,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ChromaSiting: u8 {
        const VERTICAL_TOP = 0x01;
        const VERTICAL_CENTER = 0x02;
        const VERTICAL_BOTTOM = 0x03;
        const HORIZONTAL_LEFT = 0x04;
        const HORIZONTAL_CENTER = 0x08;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ColorRange {
    #[default]
    Unknown,
    Reduced,
    Full,
}

/// ITU-T H.273 code points, used when the standard is `Explicit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ColorProperties {
    pub chroma_sample_location: ChromaSiting,
    pub color_range: ColorRange,
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coefficients: u8,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendState {
    pub flags: BlendFlags,
    pub global_alpha: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineParameter {
    pub surface: SurfaceId,
    pub surface_region: Option<Rect>,
    pub surface_color_standard: ColorStandard,
    pub input_color_properties: ColorProperties,
    pub output_region: Option<Rect>,
    pub output_background_color: u32,
    pub output_color_standard: ColorStandard,
    pub output_color_properties: ColorProperties,
    pub scale_method: ScaleMethod,
    pub filters: Vec<BufferId>,
    pub forward_references: Vec<SurfaceId>,
    pub backward_references: Vec<SurfaceId>,
    pub rotation: Rotation,
    pub mirror: MirrorFlags,
    pub blend_state: Option<BlendState>,
    pub input_surface_flags: SurfaceFlags,
    pub output_surface_flags: SurfaceFlags,
}

impl PipelineParameter {
    pub fn new(surface: SurfaceId) -> Self {
        PipelineParameter {
            surface,
            surface_region: None,
            surface_color_standard: ColorStandard::None,
            input_color_properties: ColorProperties::default(),
            output_region: None,
            output_background_color: 0xff00_0000,
            output_color_standard: ColorStandard::None,
            output_color_properties: ColorProperties::default(),
            scale_method: ScaleMethod::Default,
            filters: Vec::new(),
            forward_references: Vec::new(),
            backward_references: Vec::new(),
            rotation: Rotation::None,
            mirror: MirrorFlags::empty(),
            blend_state: None,
            input_surface_flags: SurfaceFlags::empty(),
            output_surface_flags: SurfaceFlags::empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BufferParameter {
    Filter(FilterParameter),
    Pipeline(PipelineParameter),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigAttributes {
    pub rt_formats: Option<RtFormat>,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SurfaceAttributes {
    pub formats: Vec<gst_video::VideoFormat>,
    pub min_width: u32,
    pub min_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub mem_types: MemoryTypes,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PipelineCaps {
    pub num_forward_references: u32,
    pub num_backward_references: u32,
    pub rotation_flags: u32,
    pub mirror_flags: MirrorFlags,
    pub blend_flags: BlendFlags,
    pub input_formats: Vec<gst_video::VideoFormat>,
    pub input_color_standards: Vec<ColorStandard>,
    pub output_color_standards: Vec<ColorStandard>,
}

/// Memory layout the driver chose for a surface.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SurfaceLayout {
    pub offsets: Vec<usize>,
    pub strides: Vec<i32>,
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmabufPlane {
    pub fd: RawFd,
    pub offset: usize,
    pub stride: i32,
}

/// DMA-buf memory a surface should be bound over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmabufDescriptor {
    pub format: gst_video::VideoFormat,
    pub width: u32,
    pub height: u32,
    pub modifier: u64,
    pub planes: Vec<DmabufPlane>,
}

#[derive(Debug)]
pub struct ExportedObject {
    pub fd: OwnedFd,
    pub size: usize,
}

/// A surface exported as DMA-buf objects. `planes` index into `objects`.
#[derive(Debug)]
pub struct ExportedSurface {
    pub objects: Vec<ExportedObject>,
    pub planes: Vec<(usize, usize, i32)>,
    pub modifier: u64,
}

pub trait Device: Send + Sync + 'static {
    fn vendor(&self) -> &str;

    fn config_attributes(
        &self,
        profile: Profile,
        entrypoint: Entrypoint,
    ) -> Result<ConfigAttributes, VaError>;

    fn create_config(
        &self,
        profile: Profile,
        entrypoint: Entrypoint,
        rt_format: RtFormat,
    ) -> Result<ConfigId, VaError>;

    fn destroy_config(&self, config: ConfigId) -> Result<(), VaError>;

    fn surface_attributes(&self, config: ConfigId) -> Result<SurfaceAttributes, VaError>;

    fn create_context(
        &self,
        config: ConfigId,
        width: u32,
        height: u32,
    ) -> Result<ContextId, VaError>;

    fn destroy_context(&self, context: ContextId) -> Result<(), VaError>;

    fn create_surface(
        &self,
        format: gst_video::VideoFormat,
        width: u32,
        height: u32,
        usage: UsageHint,
    ) -> Result<SurfaceId, VaError>;

    fn destroy_surface(&self, surface: SurfaceId) -> Result<(), VaError>;

    fn surface_layout(
        &self,
        format: gst_video::VideoFormat,
        width: u32,
        height: u32,
    ) -> Result<SurfaceLayout, VaError>;

    fn import_dmabuf(
        &self,
        descriptor: &DmabufDescriptor,
        usage: UsageHint,
    ) -> Result<SurfaceId, VaError>;

    fn export_dmabuf(&self, surface: SurfaceId) -> Result<ExportedSurface, VaError>;

    fn sync_surface(&self, surface: SurfaceId) -> Result<(), VaError>;

    fn query_filters(&self, context: ContextId) -> Result<Vec<FilterType>, VaError>;

    fn query_filter_caps(
        &self,
        context: ContextId,
        filter: FilterType,
    ) -> Result<FilterCaps, VaError>;

    fn query_pipeline_caps(
        &self,
        context: ContextId,
        filters: &[BufferId],
    ) -> Result<PipelineCaps, VaError>;

    fn create_buffer(
        &self,
        context: ContextId,
        parameter: BufferParameter,
    ) -> Result<BufferId, VaError>;

    fn destroy_buffer(&self, buffer: BufferId) -> Result<(), VaError>;

    fn begin_picture(&self, context: ContextId, target: SurfaceId) -> Result<(), VaError>;

    fn render_picture(&self, context: ContextId, buffers: &[BufferId]) -> Result<(), VaError>;

    fn end_picture(&self, context: ContextId) -> Result<(), VaError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_hint_directions() {
        assert_eq!(
            UsageHint::for_entrypoint(Entrypoint::VideoProc, gst::PadDirection::Sink, false),
            UsageHint::VPP_READ
        );
        assert_eq!(
            UsageHint::for_entrypoint(Entrypoint::VideoProc, gst::PadDirection::Src, false),
            UsageHint::VPP_WRITE
        );
        assert_eq!(
            UsageHint::for_entrypoint(Entrypoint::VideoProc, gst::PadDirection::Src, true),
            UsageHint::VPP_READ | UsageHint::VPP_WRITE
        );
        assert_eq!(
            UsageHint::for_entrypoint(Entrypoint::Vld, gst::PadDirection::Src, true),
            UsageHint::DECODER
        );
        assert_eq!(
            UsageHint::for_entrypoint(Entrypoint::EncSliceLp, gst::PadDirection::Sink, false),
            UsageHint::ENCODER
        );
    }
}
