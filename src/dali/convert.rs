//! Per-operator parameter translation
//!
//! Each branch maps one abstract operator's raw parameters into the concrete
//! kernel parameters, applying the operator's documented defaults and unit
//! conversions (most notably `NormalizeImage`, whose mean/std are pre-divided
//! by `scale` so the kernel applies a single affine transform).

use super::ops::*;
use super::params;
use super::OpSpec;
use crate::{Error, Result};
use serde_yaml::Mapping;

const DEVICE_MEMORY_PADDING: i64 = 211_025_920;
const HOST_MEMORY_PADDING: i64 = 140_544_512;

const DEFAULT_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const DEFAULT_STD: [f32; 3] = [0.229, 0.224, 0.225];

fn interp_or(map: &Mapping, op: &str, default: Interp) -> Result<Interp> {
    match params::get_str(map, op, "interpolation")? {
        None => Ok(default),
        Some(s) => s.parse(),
    }
}

/// Mean/std pre-divided by scale, plus the broadcast shape for the given
/// channel order.
fn scaled_mean_std(
    map: &Mapping,
    op: &str,
) -> Result<(Vec<f32>, Vec<f32>, usize)> {
    let scale = params::get_scale_or(map, op, "scale", 1.0 / 255.0)?;
    if scale == 0.0 {
        return Err(Error::config(format!("{op}.scale"), "scale must be non-zero"));
    }
    let mean = params::get_f32_list_or(map, op, "mean", &DEFAULT_MEAN)?;
    let std = params::get_f32_list_or(map, op, "std", &DEFAULT_STD)?;
    let channel_num = params::get_i64_or(map, op, "channel_num", 3)? as usize;
    let mean = mean.into_iter().map(|v| v / scale).collect();
    let std = std.into_iter().map(|v| v / scale).collect();
    Ok((mean, std, channel_num))
}

/// Translate one operator spec into its compiled form.
pub fn convert_op(kind: DaliOpKind, device: Device, map: &Mapping) -> Result<CompiledOp> {
    let op = kind.as_str();
    let placement = device.placement();
    match kind {
        DaliOpKind::DecodeImage => {
            let to_rgb = params::get_bool_or(map, op, "to_rgb", true)?;
            let channel_first = params::get_bool_or(map, op, "channel_first", false)?;
            if channel_first {
                return Err(Error::config(
                    "DecodeImage.channel_first",
                    "must be false for the compiled pipeline",
                ));
            }
            Ok(CompiledOp::Decode(DecodeParams {
                placement: device.decode_placement(),
                output_type: if to_rgb { ImageType::Rgb } else { ImageType::Bgr },
                device_memory_padding: params::get_i64_or(
                    map,
                    op,
                    "device_memory_padding",
                    DEVICE_MEMORY_PADDING,
                )?,
                host_memory_padding: params::get_i64_or(
                    map,
                    op,
                    "host_memory_padding",
                    HOST_MEMORY_PADDING,
                )?,
            }))
        }
        DaliOpKind::ResizeImage => {
            let size = params::get_pair(map, op, "size")?;
            let resize_shorter = params::get_i64(map, op, "resize_short")?;
            if size.is_none() && resize_shorter.is_none() {
                return Err(Error::config(
                    "ResizeImage",
                    "one of `size` or `resize_short` is required",
                ));
            }
            let interp = match params::get_str(map, op, "interpolation")? {
                None => None,
                Some(s) => Some(s.parse()?),
            };
            Ok(CompiledOp::Resize(ResizeParams {
                placement,
                // resize is (resize_y, resize_x) = (size[0], size[1])
                resize: size,
                resize_shorter,
                interp,
            }))
        }
        DaliOpKind::CropImage => {
            let (w, h) = params::get_pair(map, op, "size")?.unwrap_or((224, 224));
            Ok(CompiledOp::Crop(CropParams {
                placement,
                crop_h: h,
                crop_w: w,
                crop_pos_x: 0.5,
                crop_pos_y: 0.5,
            }))
        }
        DaliOpKind::RandomCropImage => {
            let crop = params::get_pair(map, op, "size")?.map(|(w, h)| (h, w));
            Ok(CompiledOp::RandomCrop(RandomCropParams { placement, crop }))
        }
        DaliOpKind::RandCropImage => {
            let size = params::get_pair(map, op, "size")?.unwrap_or((224, 224));
            Ok(CompiledOp::RandResizedCrop(RandResizedCropParams {
                placement,
                size,
                random_area: params::get_range_or(map, op, "scale", (0.08, 1.0))?,
                random_aspect_ratio: params::get_range_or(
                    map,
                    op,
                    "ratio",
                    (3.0 / 4.0, 4.0 / 3.0),
                )?,
                interp: interp_or(map, op, Interp::Bilinear)?,
            }))
        }
        DaliOpKind::RandCropImageV2 => {
            let (w, h) = params::get_pair(map, op, "size")?.ok_or_else(|| {
                Error::config("RandCropImageV2.size", "required parameter is missing")
            })?;
            Ok(CompiledOp::RandCropV2(RandCropV2Params {
                placement,
                crop_h: h,
                crop_w: w,
            }))
        }
        DaliOpKind::RandFlipImage => Ok(CompiledOp::RandFlip(RandFlipParams {
            placement,
            prob: params::get_f32_or(map, op, "prob", 0.5)?,
            flip_code: params::get_i64_or(map, op, "flip_code", 1)?,
        })),
        DaliOpKind::NormalizeImage => {
            let (mean, stddev, channel_num) = scaled_mean_std(map, op)?;
            let order = match params::get_str(map, op, "order")?.unwrap_or("chw") {
                "hwc" => ChannelOrder::Hwc,
                _ => ChannelOrder::Chw,
            };
            let shape = match order {
                ChannelOrder::Chw => [channel_num, 1, 1],
                ChannelOrder::Hwc => [1, 1, channel_num],
            };
            Ok(CompiledOp::Normalize(NormalizeParams {
                placement,
                mean,
                stddev,
                shape,
                order,
                output_fp16: params::get_bool_or(map, op, "output_fp16", false)?,
            }))
        }
        DaliOpKind::ToCHWImage => Ok(CompiledOp::ToChw(ToChwParams { perm: [2, 0, 1] })),
        DaliOpKind::ColorJitter => Ok(CompiledOp::ColorJitter(ColorJitterParams {
            placement,
            prob: params::get_f32_or(map, op, "prob", 1.0)?,
            brightness_factor: params::get_f32_or(map, op, "brightness", 0.0)?,
            contrast_factor: params::get_f32_or(map, op, "contrast", 0.0)?,
            saturation_factor: params::get_f32_or(map, op, "saturation", 0.0)?,
            hue_factor: params::get_f32_or(map, op, "hue", 0.0)?,
        })),
        DaliOpKind::RandomRotation => Ok(CompiledOp::RandomRotation(RandomRotationParams {
            placement,
            prob: params::get_f32_or(map, op, "prob", 0.5)?,
            angle: params::get_i64_or(map, op, "degrees", 90)?,
            interp: interp_or(map, op, Interp::Nearest)?,
        })),
        DaliOpKind::Pad => {
            // `size` must be declared on the operator itself; no recursive
            // search through unrelated config nodes.
            let (w, h) = params::get_pair(map, op, "size")?.ok_or_else(|| {
                Error::config(
                    "Pad.size",
                    "required parameter is missing; declare it on the Pad operator",
                )
            })?;
            let padding = params::get_i64_or(map, op, "padding", 0)?;
            Ok(CompiledOp::Pad(PadParams {
                placement,
                crop_h: h + padding,
                crop_w: w + padding,
                fill_value: params::get_i64_or(map, op, "fill", 0)?,
            }))
        }
        DaliOpKind::RandomRot90 => Ok(CompiledOp::RandomRot90(RandomRot90Params {
            placement,
            interp: interp_or(map, op, Interp::Nearest)?,
        })),
        DaliOpKind::DecodeRandomResizedCrop => {
            let size = params::get_i64_or(map, op, "size", 224)?;
            Ok(CompiledOp::DecodeRandResizedCrop(DecodeRandResizedCropParams {
                placement: device.decode_placement(),
                output_type: ImageType::Rgb,
                device_memory_padding: params::get_i64_or(
                    map,
                    op,
                    "device_memory_padding",
                    DEVICE_MEMORY_PADDING,
                )?,
                host_memory_padding: params::get_i64_or(
                    map,
                    op,
                    "host_memory_padding",
                    HOST_MEMORY_PADDING,
                )?,
                random_area: params::get_range_or(map, op, "scale", (0.08, 1.0))?,
                random_aspect_ratio: params::get_range_or(
                    map,
                    op,
                    "ratio",
                    (3.0 / 4.0, 4.0 / 3.0),
                )?,
                num_attempts: params::get_i64_or(map, op, "num_attempts", 100)?,
                resize: (size, size),
            }))
        }
        DaliOpKind::CropMirrorNormalize => {
            let (mean, stddev, channel_num) = scaled_mean_std(map, op)?;
            let output_layout = params::get_str(map, op, "output_layout")?
                .unwrap_or("CHW")
                .to_string();
            Ok(CompiledOp::CropMirrorNormalize(CropMirrorNormalizeParams {
                placement,
                output_fp16: params::get_bool_or(map, op, "output_fp16", false)?,
                output_layout,
                crop: params::get_pair(map, op, "size")?,
                mean,
                stddev,
                pad_output: channel_num == 4,
                prob: params::get_f32_or(map, op, "prob", 0.5)?,
            }))
        }
    }
}

/// Parse-then-convert convenience used by the pipeline builder.
pub(super) fn convert_spec(spec: &OpSpec, device: Device) -> Result<CompiledOp> {
    let kind: DaliOpKind = spec.name.parse()?;
    convert_op(kind, device, &spec.params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn mapping(yaml: &str) -> Mapping {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_decode_defaults() {
        let op = convert_op(DaliOpKind::DecodeImage, Device::Gpu, &Mapping::new()).unwrap();
        match op {
            CompiledOp::Decode(p) => {
                assert_eq!(p.placement, Placement::Mixed);
                assert_eq!(p.output_type, ImageType::Rgb);
                assert_eq!(p.device_memory_padding, 211_025_920);
                assert_eq!(p.host_memory_padding, 140_544_512);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_channel_first() {
        let m = mapping("channel_first: true\n");
        let err = convert_op(DaliOpKind::DecodeImage, Device::Cpu, &m).unwrap_err();
        assert!(format!("{err}").contains("channel_first"));
    }

    #[test]
    fn test_normalize_prescales_mean_std() {
        let m = mapping("scale: 1.0/255.0\nmean: [0.5, 0.5, 0.5]\nstd: [0.25, 0.25, 0.25]\n");
        let op = convert_op(DaliOpKind::NormalizeImage, Device::Cpu, &m).unwrap();
        match op {
            CompiledOp::Normalize(p) => {
                assert_relative_eq!(p.mean[0], 0.5 * 255.0, epsilon = 1e-3);
                assert_relative_eq!(p.stddev[0], 0.25 * 255.0, epsilon = 1e-3);
                assert_eq!(p.shape, [3, 1, 1]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_normalize_hwc_shape() {
        let m = mapping("order: hwc\nchannel_num: 4\n");
        match convert_op(DaliOpKind::NormalizeImage, Device::Cpu, &m).unwrap() {
            CompiledOp::Normalize(p) => assert_eq!(p.shape, [1, 1, 4]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_resize_requires_some_size() {
        assert!(convert_op(DaliOpKind::ResizeImage, Device::Cpu, &Mapping::new()).is_err());
        let m = mapping("resize_short: 256\n");
        match convert_op(DaliOpKind::ResizeImage, Device::Cpu, &m).unwrap() {
            CompiledOp::Resize(p) => {
                assert_eq!(p.resize_shorter, Some(256));
                assert_eq!(p.resize, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_pad_requires_explicit_size() {
        let err = convert_op(DaliOpKind::Pad, Device::Cpu, &Mapping::new()).unwrap_err();
        assert!(format!("{err}").contains("Pad.size"));
    }

    #[test]
    fn test_pad_grows_crop_by_padding() {
        let m = mapping("size: 32\npadding: 4\n");
        match convert_op(DaliOpKind::Pad, Device::Cpu, &m).unwrap() {
            CompiledOp::Pad(p) => {
                assert_eq!(p.crop_h, 36);
                assert_eq!(p.crop_w, 36);
                assert_eq!(p.fill_value, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_rand_crop_defaults() {
        match convert_op(DaliOpKind::RandCropImage, Device::Gpu, &Mapping::new()).unwrap() {
            CompiledOp::RandResizedCrop(p) => {
                assert_eq!(p.size, (224, 224));
                assert_eq!(p.random_area, (0.08, 1.0));
                assert_relative_eq!(p.random_aspect_ratio.0, 0.75);
                assert_eq!(p.interp, Interp::Bilinear);
                assert_eq!(p.placement, Placement::Gpu);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_crop_mirror_normalize_pad_output() {
        let m = mapping("size: 224\nchannel_num: 4\n");
        match convert_op(DaliOpKind::CropMirrorNormalize, Device::Gpu, &m).unwrap() {
            CompiledOp::CropMirrorNormalize(p) => {
                assert!(p.pad_output);
                assert_eq!(p.crop, Some((224, 224)));
                assert_eq!(p.output_layout, "CHW");
                assert_relative_eq!(p.prob, 0.5);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_interpolation_rejected() {
        let m = mapping("interpolation: area\nsize: 224\n");
        assert!(convert_op(DaliOpKind::ResizeImage, Device::Cpu, &m).is_err());
    }
}
