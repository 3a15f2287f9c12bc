//! Closed operator registry and compiled operator descriptions

use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// The closed set of recognized preprocessing operators.
///
/// Parsing an unknown name fails with a configuration error; operators are
/// never skipped silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DaliOpKind {
    DecodeImage,
    ResizeImage,
    CropImage,
    RandomCropImage,
    RandCropImage,
    RandCropImageV2,
    RandFlipImage,
    NormalizeImage,
    ToCHWImage,
    ColorJitter,
    RandomRotation,
    Pad,
    RandomRot90,
    DecodeRandomResizedCrop,
    CropMirrorNormalize,
}

impl DaliOpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DecodeImage => "DecodeImage",
            Self::ResizeImage => "ResizeImage",
            Self::CropImage => "CropImage",
            Self::RandomCropImage => "RandomCropImage",
            Self::RandCropImage => "RandCropImage",
            Self::RandCropImageV2 => "RandCropImageV2",
            Self::RandFlipImage => "RandFlipImage",
            Self::NormalizeImage => "NormalizeImage",
            Self::ToCHWImage => "ToCHWImage",
            Self::ColorJitter => "ColorJitter",
            Self::RandomRotation => "RandomRotation",
            Self::Pad => "Pad",
            Self::RandomRot90 => "RandomRot90",
            Self::DecodeRandomResizedCrop => "DecodeRandomResizedCrop",
            Self::CropMirrorNormalize => "CropMirrorNormalize",
        }
    }
}

impl FromStr for DaliOpKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "DecodeImage" => Ok(Self::DecodeImage),
            "ResizeImage" => Ok(Self::ResizeImage),
            "CropImage" => Ok(Self::CropImage),
            "RandomCropImage" => Ok(Self::RandomCropImage),
            "RandCropImage" => Ok(Self::RandCropImage),
            "RandCropImageV2" => Ok(Self::RandCropImageV2),
            "RandFlipImage" => Ok(Self::RandFlipImage),
            "NormalizeImage" => Ok(Self::NormalizeImage),
            "ToCHWImage" => Ok(Self::ToCHWImage),
            "ColorJitter" => Ok(Self::ColorJitter),
            "RandomRotation" => Ok(Self::RandomRotation),
            "Pad" => Ok(Self::Pad),
            "RandomRot90" => Ok(Self::RandomRot90),
            "DecodeRandomResizedCrop" => Ok(Self::DecodeRandomResizedCrop),
            "CropMirrorNormalize" => Ok(Self::CropMirrorNormalize),
            _ => Err(Error::config(
                "transform_ops",
                format!("unsupported operator `{s}`"),
            )),
        }
    }
}

impl fmt::Display for DaliOpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target device for a compiled pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Gpu,
}

impl Device {
    /// Plain operator placement
    pub fn placement(self) -> Placement {
        match self {
            Device::Cpu => Placement::Cpu,
            Device::Gpu => Placement::Gpu,
        }
    }

    /// Decode operators run "mixed" (host decode, device output) on GPU.
    pub fn decode_placement(self) -> Placement {
        match self {
            Device::Cpu => Placement::Cpu,
            Device::Gpu => Placement::Mixed,
        }
    }
}

impl FromStr for Device {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cpu" => Ok(Device::Cpu),
            "gpu" => Ok(Device::Gpu),
            _ => Err(Error::config(
                "device",
                format!("device `{s}` must be one of [cpu, gpu]"),
            )),
        }
    }
}

/// Where a compiled operator executes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Cpu,
    Gpu,
    Mixed,
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Placement::Cpu => "cpu",
            Placement::Gpu => "gpu",
            Placement::Mixed => "mixed",
        };
        f.write_str(s)
    }
}

/// Interpolation modes, mirroring the cv2 mapping of the config format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interp {
    Nearest,
    Bilinear,
    Bicubic,
    Lanczos,
}

impl FromStr for Interp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "nearest" => Ok(Self::Nearest),
            "bilinear" => Ok(Self::Bilinear),
            "bicubic" => Ok(Self::Bicubic),
            "lanczos" => Ok(Self::Lanczos),
            _ => Err(Error::config(
                "interpolation",
                format!("unknown interpolation `{s}`"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    Rgb,
    Bgr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Chw,
    Hwc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodeParams {
    pub placement: Placement,
    pub output_type: ImageType,
    pub device_memory_padding: i64,
    pub host_memory_padding: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResizeParams {
    pub placement: Placement,
    /// (resize_y, resize_x)
    pub resize: Option<(i64, i64)>,
    pub resize_shorter: Option<i64>,
    pub interp: Option<Interp>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CropParams {
    pub placement: Placement,
    pub crop_h: i64,
    pub crop_w: i64,
    pub crop_pos_x: f32,
    pub crop_pos_y: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RandomCropParams {
    pub placement: Placement,
    /// (crop_h, crop_w) when a size is configured
    pub crop: Option<(i64, i64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RandResizedCropParams {
    pub placement: Placement,
    /// (height, width)
    pub size: (i64, i64),
    pub random_area: (f32, f32),
    pub random_aspect_ratio: (f32, f32),
    pub interp: Interp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RandCropV2Params {
    pub placement: Placement,
    pub crop_h: i64,
    pub crop_w: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RandFlipParams {
    pub placement: Placement,
    pub prob: f32,
    pub flip_code: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizeParams {
    pub placement: Placement,
    /// Mean pre-divided by `scale`
    pub mean: Vec<f32>,
    /// Std pre-divided by `scale`
    pub stddev: Vec<f32>,
    /// Broadcast shape of mean/std: `[c, 1, 1]` for chw, `[1, 1, c]` for hwc
    pub shape: [usize; 3],
    pub order: ChannelOrder,
    pub output_fp16: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToChwParams {
    pub perm: [i64; 3],
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColorJitterParams {
    pub placement: Placement,
    pub prob: f32,
    pub brightness_factor: f32,
    pub contrast_factor: f32,
    pub saturation_factor: f32,
    pub hue_factor: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RandomRotationParams {
    pub placement: Placement,
    pub prob: f32,
    pub angle: i64,
    pub interp: Interp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PadParams {
    pub placement: Placement,
    /// Configured size plus padding on each axis
    pub crop_h: i64,
    pub crop_w: i64,
    pub fill_value: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RandomRot90Params {
    pub placement: Placement,
    pub interp: Interp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodeRandResizedCropParams {
    pub placement: Placement,
    pub output_type: ImageType,
    pub device_memory_padding: i64,
    pub host_memory_padding: i64,
    pub random_area: (f32, f32),
    pub random_aspect_ratio: (f32, f32),
    pub num_attempts: i64,
    /// (resize_y, resize_x)
    pub resize: (i64, i64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CropMirrorNormalizeParams {
    pub placement: Placement,
    pub output_fp16: bool,
    pub output_layout: String,
    /// (crop_h, crop_w) when a crop size is configured
    pub crop: Option<(i64, i64)>,
    /// Mean pre-divided by `scale`
    pub mean: Vec<f32>,
    /// Std pre-divided by `scale`
    pub stddev: Vec<f32>,
    /// True when a fourth channel is padded in
    pub pad_output: bool,
    /// Mirror probability; 0.0 disables the flip half of the kernel
    pub prob: f32,
}

/// A resolved, device-bound operator produced by the compiler
#[derive(Debug, Clone, PartialEq)]
pub enum CompiledOp {
    Decode(DecodeParams),
    Resize(ResizeParams),
    Crop(CropParams),
    RandomCrop(RandomCropParams),
    RandResizedCrop(RandResizedCropParams),
    RandCropV2(RandCropV2Params),
    RandFlip(RandFlipParams),
    Normalize(NormalizeParams),
    ToChw(ToChwParams),
    ColorJitter(ColorJitterParams),
    RandomRotation(RandomRotationParams),
    Pad(PadParams),
    RandomRot90(RandomRot90Params),
    DecodeRandResizedCrop(DecodeRandResizedCropParams),
    CropMirrorNormalize(CropMirrorNormalizeParams),
}

impl CompiledOp {
    pub fn kind(&self) -> DaliOpKind {
        match self {
            Self::Decode(_) => DaliOpKind::DecodeImage,
            Self::Resize(_) => DaliOpKind::ResizeImage,
            Self::Crop(_) => DaliOpKind::CropImage,
            Self::RandomCrop(_) => DaliOpKind::RandomCropImage,
            Self::RandResizedCrop(_) => DaliOpKind::RandCropImage,
            Self::RandCropV2(_) => DaliOpKind::RandCropImageV2,
            Self::RandFlip(_) => DaliOpKind::RandFlipImage,
            Self::Normalize(_) => DaliOpKind::NormalizeImage,
            Self::ToChw(_) => DaliOpKind::ToCHWImage,
            Self::ColorJitter(_) => DaliOpKind::ColorJitter,
            Self::RandomRotation(_) => DaliOpKind::RandomRotation,
            Self::Pad(_) => DaliOpKind::Pad,
            Self::RandomRot90(_) => DaliOpKind::RandomRot90,
            Self::DecodeRandResizedCrop(_) => DaliOpKind::DecodeRandomResizedCrop,
            Self::CropMirrorNormalize(_) => DaliOpKind::CropMirrorNormalize,
        }
    }

    pub fn placement(&self) -> Placement {
        match self {
            Self::Decode(p) => p.placement,
            Self::Resize(p) => p.placement,
            Self::Crop(p) => p.placement,
            Self::RandomCrop(p) => p.placement,
            Self::RandResizedCrop(p) => p.placement,
            Self::RandCropV2(p) => p.placement,
            Self::RandFlip(p) => p.placement,
            Self::Normalize(p) => p.placement,
            Self::ToChw(_) => Placement::Cpu,
            Self::ColorJitter(p) => p.placement,
            Self::RandomRotation(p) => p.placement,
            Self::Pad(p) => p.placement,
            Self::RandomRot90(p) => p.placement,
            Self::DecodeRandResizedCrop(p) => p.placement,
            Self::CropMirrorNormalize(p) => p.placement,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_operator_rejected() {
        let err = "FancyNewOp".parse::<DaliOpKind>().unwrap_err();
        assert!(format!("{err}").contains("FancyNewOp"));
    }

    #[test]
    fn test_round_trip_names() {
        for name in [
            "DecodeImage",
            "ResizeImage",
            "CropImage",
            "RandomCropImage",
            "RandCropImage",
            "RandCropImageV2",
            "RandFlipImage",
            "NormalizeImage",
            "ToCHWImage",
            "ColorJitter",
            "RandomRotation",
            "Pad",
            "RandomRot90",
            "DecodeRandomResizedCrop",
            "CropMirrorNormalize",
        ] {
            let kind: DaliOpKind = name.parse().unwrap();
            assert_eq!(kind.as_str(), name);
        }
    }

    #[test]
    fn test_decode_placement() {
        assert_eq!(Device::Gpu.decode_placement(), Placement::Mixed);
        assert_eq!(Device::Cpu.decode_placement(), Placement::Cpu);
        assert_eq!(Device::Gpu.placement(), Placement::Gpu);
    }

    #[test]
    fn test_unknown_device_rejected() {
        assert!("tpu".parse::<Device>().is_err());
    }
}
