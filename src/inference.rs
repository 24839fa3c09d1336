use burn::tensor::{Tensor, TensorData, backend::Backend};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_cross_mut, draw_line_segment_mut};

use crate::config::DetectorConfig;
use crate::decode::AnchorPredictions;
use crate::error::{DetectorError, DetectorResult};
use crate::models::detector::{Detector, DetectorOutput};
use crate::models::yolo::{YoloDetector, YoloForward};

/// Maximum pixel value for a 8 bit channel
pub const MAX_PIXEL_VAL: f32 = 255.0;

const POINT_COLOR: Rgb<u8> = Rgb([255, 40, 40]);
const LINE_COLOR: Rgb<u8> = Rgb([40, 220, 40]);
const BOX_COLOR: Rgb<u8> = Rgb([40, 80, 255]);

/// A decoded prediction in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Primitive {
    Point {
        x: f32,
        y: f32,
    },
    /// Segment centred on `(x, y)` running along `rot`.
    Line {
        x: f32,
        y: f32,
        rot: f32,
        half_len: f32,
    },
    RotatedBox {
        x: f32,
        y: f32,
        rot: f32,
        half_h: f32,
        half_w: f32,
    },
}

impl Primitive {
    /// Corner points of a rotated box, in drawing order.
    fn corners(x: f32, y: f32, rot: f32, half_h: f32, half_w: f32) -> [(f32, f32); 4] {
        let (sin, cos) = rot.sin_cos();
        let (wx, wy) = (half_w * cos, -half_w * sin);
        let (hx, hy) = (half_h * sin, half_h * cos);
        [
            (x - wx - hx, y - wy - hy),
            (x + wx - hx, y + wy - hy),
            (x + wx + hx, y + wy + hy),
            (x - wx + hx, y - wy + hy),
        ]
    }

    /// Draws the primitive onto `image`: a cross for points, a segment for
    /// lines and the four edges of a rotated box.
    ///
    pub fn draw(&self, image: &mut RgbImage) {
        match *self {
            Primitive::Point { x, y } => {
                draw_cross_mut(image, POINT_COLOR, x.round() as i32, y.round() as i32)
            }
            Primitive::Line {
                x,
                y,
                rot,
                half_len,
            } => {
                let (sin, cos) = rot.sin_cos();
                let (dx, dy) = (half_len * cos, -half_len * sin);
                draw_line_segment_mut(image, (x - dx, y - dy), (x + dx, y + dy), LINE_COLOR);
            }
            Primitive::RotatedBox {
                x,
                y,
                rot,
                half_h,
                half_w,
            } => {
                let corners = Self::corners(x, y, rot, half_h, half_w);
                for i in 0..corners.len() {
                    let next = corners[(i + 1) % corners.len()];
                    draw_line_segment_mut(image, corners[i], next, BOX_COLOR);
                }
            }
        }
    }
}

/// Instance rows of the first batch element of a `[batch, instances, params]`
/// tensor.
///
fn instances<B: Backend>(t: &Tensor<B, 3>) -> DetectorResult<Vec<Vec<f32>>> {
    let [_, count, params] = t.dims();
    let data = t.clone().narrow(0, 0, 1).reshape([count * params]).into_data();
    rows(data, params)
}

// Splits flat prediction values into rows of `params`.
fn rows(data: TensorData, params: usize) -> DetectorResult<Vec<Vec<f32>>> {
    let values = data
        .to_vec::<f32>()
        .map_err(|err| DetectorError::TensorData(format!("{err:?}")))?;

    Ok(values
        .chunks(params.max(1))
        .map(<[f32]>::to_vec)
        .collect())
}

// Rows of every tensor whose confidence exceeds `threshold`.
fn confident<B: Backend>(tensors: &[Tensor<B, 3>], threshold: f32) -> DetectorResult<Vec<Vec<f32>>> {
    let mut rows = Vec::new();
    for t in tensors {
        rows.extend(instances(t)?.into_iter().filter(|p| p[0] > threshold));
    }
    Ok(rows)
}

fn points(rows: Vec<Vec<f32>>) -> impl Iterator<Item = Primitive> {
    rows.into_iter().map(|p| Primitive::Point { x: p[1], y: p[2] })
}

/// Primitives of the direct detector whose confidence exceeds `threshold`.
///
/// Line scale is raw for this detector, its magnitude is used as the half
/// length.
///
pub fn direct_primitives<B: Backend>(
    output: &DetectorOutput<B>,
    threshold: f32,
) -> DetectorResult<Vec<Primitive>> {
    let lines = confident(&output.lines, threshold)?
        .into_iter()
        .map(|p| Primitive::Line {
            x: p[1],
            y: p[2],
            rot: p[3],
            half_len: p[4].abs(),
        });
    let points = points(confident(&output.points, threshold)?);

    Ok(lines.chain(points).collect())
}

/// Primitives of the anchor detector whose confidence exceeds `threshold`.
///
pub fn anchor_primitives<B: Backend>(
    predictions: &AnchorPredictions<B>,
    threshold: f32,
) -> DetectorResult<Vec<Primitive>> {
    let boxes = confident(std::slice::from_ref(&predictions.boxes), threshold)?
        .into_iter()
        .map(|p| Primitive::RotatedBox {
            x: p[1],
            y: p[2],
            rot: p[3],
            half_h: p[4],
            half_w: p[5],
        });
    let lines = confident(&predictions.lines, threshold)?
        .into_iter()
        .map(|p| Primitive::Line {
            x: p[1],
            y: p[2],
            rot: p[3],
            half_len: p[4],
        });
    let points = points(confident(&predictions.points, threshold)?);

    Ok(boxes.chain(lines).chain(points).collect())
}

/// Loads an image as a `[1, channels, height, width]` tensor scaled to `[0, 1]`.
///
/// Grayscale models get a single luma channel. The RGB copy is kept for
/// drawing.
pub fn load_image<B: Backend>(
    path: &str,
    color: bool,
    device: &B::Device,
) -> DetectorResult<(RgbImage, Tensor<B, 4>)> {
    let image = image::open(path)?;
    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();

    let (pixels, channels): (Vec<f32>, usize) = if color {
        (rgb.as_raw().iter().map(|&p| p as f32).collect(), 3)
    } else {
        let luma = image.to_luma8();
        (luma.as_raw().iter().map(|&p| p as f32).collect(), 1)
    };

    let data = TensorData::new(pixels, [height as usize, width as usize, channels]);
    let tensor = Tensor::<B, 3>::from_data(data, device)
        .permute([2, 0, 1])
        .div_scalar(MAX_PIXEL_VAL)
        .unsqueeze::<4>();

    Ok((rgb, tensor))
}

/// Runs one forward pass on `image_path` and draws every prediction above
/// `threshold` onto a copy of the image saved at `output_path`.
///
/// Weights are freshly initialized; the result shows the decoding, not a
/// trained model. Returns the number of primitives drawn.
pub fn infer<B: Backend>(
    config: &DetectorConfig,
    yolo: bool,
    image_path: &str,
    output_path: &str,
    threshold: f32,
    device: &B::Device,
) -> DetectorResult<usize> {
    let (mut image, input) = load_image::<B>(image_path, config.color, device)?;
    log::info!("running forward pass on {image_path} {:?}", input.dims());

    let primitives = if yolo {
        let model = YoloDetector::<B>::new(config, device)?;
        match model.forward(input)? {
            YoloForward::Decoded(output) => anchor_primitives(&output.predictions, threshold)?,
            YoloForward::Pairing(_) => Vec::new(),
        }
    } else {
        let model = Detector::<B>::new(config, device)?;
        direct_primitives(&model.forward(input)?, threshold)?
    };

    for primitive in primitives.iter() {
        primitive.draw(&mut image);
    }
    image.save(output_path)?;

    log::info!("drew {} predictions to {output_path}", primitives.len());
    Ok(primitives.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::parse_tokens;
    use burn::backend::{NdArray, ndarray::NdArrayDevice};

    type B = NdArray<f32>;

    fn assert_close(a: f32, b: f32) {
        assert!((a - b).abs() < 1e-4, "{a} != {b}");
    }

    #[test]
    fn test_threshold_filters_instances() {
        let device = &NdArrayDevice::default();
        let lines = Tensor::<B, 3>::from_data(
            [[[0.9, 10.0, 20.0, 0.0, 3.0], [0.2, 1.0, 1.0, 0.0, 1.0]]],
            device,
        );
        let points = Tensor::<B, 3>::from_data([[[0.6, 4.0, 5.0], [0.7, 6.0, 7.0]]], device);
        let output = DetectorOutput {
            lines: vec![lines],
            points: vec![points],
            pixels: None,
        };

        let primitives = direct_primitives(&output, 0.5).unwrap();
        assert_eq!(
            primitives,
            vec![
                Primitive::Line {
                    x: 10.0,
                    y: 20.0,
                    rot: 0.0,
                    half_len: 3.0
                },
                Primitive::Point { x: 4.0, y: 5.0 },
                Primitive::Point { x: 6.0, y: 7.0 },
            ]
        );
        assert_eq!(direct_primitives(&output, 0.95).unwrap().len(), 0);
    }

    #[test]
    fn test_anchor_primitives_keep_boxes_lines_and_points() {
        let device = &NdArrayDevice::default();
        let predictions = AnchorPredictions {
            boxes: Tensor::<B, 3>::from_data(
                [[[0.8, 5.0, 6.0, 0.1, 2.0, 3.0], [0.1, 0.0, 0.0, 0.0, 1.0, 1.0]]],
                device,
            ),
            box_offsets: Tensor::zeros([1, 1, 1, 2, 6], device),
            lines: vec![Tensor::<B, 3>::from_data([[[0.4, 1.0, 2.0, 0.5, 9.0]]], device)],
            line_offsets: vec![Tensor::zeros([1, 5, 1, 1], device)],
            points: vec![Tensor::<B, 3>::from_data([[[0.6, 3.0, 4.0]]], device)],
        };

        let primitives = anchor_primitives(&predictions, 0.3).unwrap();
        assert_eq!(primitives.len(), 3);
        assert_eq!(
            primitives[0],
            Primitive::RotatedBox {
                x: 5.0,
                y: 6.0,
                rot: 0.1,
                half_h: 2.0,
                half_w: 3.0
            }
        );
        assert_eq!(primitives[2], Primitive::Point { x: 3.0, y: 4.0 });
    }

    #[test]
    fn test_unreadable_values_are_an_error() {
        let data = TensorData::new(vec![1i64, 2, 3, 4, 5, 6], [6]);
        assert!(matches!(rows(data, 3), Err(DetectorError::TensorData(_))));

        let data = TensorData::new(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], [6]);
        assert_eq!(rows(data, 3).unwrap(), vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]);
    }

    #[test]
    fn test_box_corners() {
        let corners = Primitive::corners(10.0, 10.0, 0.0, 2.0, 4.0);
        assert_eq!(corners[0], (6.0, 8.0));
        assert_eq!(corners[2], (14.0, 12.0));

        // a quarter turn swaps the extents
        let turned = Primitive::corners(10.0, 10.0, std::f32::consts::FRAC_PI_2, 2.0, 4.0);
        assert_close(turned[0].0, 8.0);
        assert_close(turned[0].1, 14.0);
    }

    #[test]
    fn test_infer_writes_image() {
        let device = &NdArrayDevice::default();
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.png");
        let output = dir.path().join("output.png");
        RgbImage::from_pixel(24, 16, Rgb([128, 64, 32]))
            .save(&input)
            .unwrap();

        let config = DetectorConfig::new()
            .with_number_of_point_types(1)
            .with_down_layers_cfg(Some(parse_tokens("3 8 M 8").unwrap()));

        // every confidence is above zero
        let drawn = infer::<B>(
            &config,
            false,
            input.to_str().unwrap(),
            output.to_str().unwrap(),
            0.0,
            device,
        )
        .unwrap();

        assert_eq!(drawn, 8 * 12);
        assert_eq!(image::open(&output).unwrap().to_rgb8().dimensions(), (24, 16));
    }

    #[test]
    fn test_grayscale_input_has_one_channel() {
        let device = &NdArrayDevice::default();
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.png");
        RgbImage::from_pixel(6, 4, Rgb([255, 255, 255]))
            .save(&input)
            .unwrap();

        let (_, tensor) = load_image::<B>(input.to_str().unwrap(), false, device).unwrap();
        assert_eq!(tensor.dims(), [1, 1, 4, 6]);

        let (_, tensor) = load_image::<B>(input.to_str().unwrap(), true, device).unwrap();
        assert_eq!(tensor.dims(), [1, 3, 4, 6]);
        assert_close(tensor.max().into_scalar(), 1.0);
    }
}
