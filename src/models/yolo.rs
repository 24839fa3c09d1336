use burn::{
    module::{Ignored, Module},
    tensor::{Tensor, backend::Backend},
};

use super::trunk::{Trunk, TrunkSpec};
use crate::anchors::{Anchor, load_anchors};
use crate::compiler::CompileOptions;
use crate::config::{DetectorConfig, NormKind};
use crate::decode::{AnchorLayout, AnchorPredictions};
use crate::error::{DetectorError, DetectorResult};

/// Decoded output of [`YoloDetector::forward`].
#[derive(Debug, Clone)]
pub struct YoloOutput<B: Backend> {
    pub predictions: AnchorPredictions<B>,
    pub pixels: Option<Tensor<B, 4>>,
}

/// What pairing mode hands back instead of decoded predictions.
#[derive(Debug, Clone)]
pub struct PairingOutput<B: Backend> {
    /// The undecoded anchor channels, `[batch, anchors * (6 + box types), rows, cols]`.
    pub anchors: Tensor<B, 4>,
    /// Output of the last backbone stage, before the prediction conv.
    pub final_features: Tensor<B, 4>,
}

#[derive(Debug, Clone)]
pub enum YoloForward<B: Backend> {
    Decoded(YoloOutput<B>),
    Pairing(PairingOutput<B>),
}

/// Rotated box detector decoding one block of channels per anchor, plus lines
/// and points sharing the same prediction conv.
#[derive(Module, Debug)]
pub struct YoloDetector<B: Backend> {
    trunk: Trunk<B>,
    layout: Ignored<AnchorLayout>,
    for_pairing: bool,
}

impl<B: Backend> YoloDetector<B> {
    /// Builds the detector, reading anchors from `config.anchors_file`.
    pub fn new(config: &DetectorConfig, device: &B::Device) -> DetectorResult<Self> {
        let path = config
            .anchors_file
            .as_ref()
            .ok_or(DetectorError::MissingAnchors)?;
        let anchors = load_anchors(path)?;

        Self::with_anchors(config, anchors, device)
    }

    /// Builds the detector from `config` with an explicit anchor list.
    ///
    /// The prediction conv and the pixel head's last conv are 1x1.
    ///
    pub fn with_anchors(
        config: &DetectorConfig,
        anchors: Vec<Anchor>,
        device: &B::Device,
    ) -> DetectorResult<Self> {
        if anchors.is_empty() {
            return Err(DetectorError::EmptyAnchors("<in memory>".to_string()));
        }

        let layout = AnchorLayout {
            anchors,
            box_types: config.number_of_box_types,
            line_count: config.number_of_line_types,
            point_count: config.number_of_point_types,
            rotation: config.rotation,
        };

        if layout.line_count > 0 {
            log::warn!(
                "line scale is decoded against a fixed mean half height of {}",
                layout.mean_half_height()
            );
        }
        if config.norm_type == NormKind::None {
            log::warn!("YoloDetector has no normalization");
        }

        let options = CompileOptions {
            dilation: config.dilation,
            norm: config.norm_type,
            dropout: config.dropout,
        };
        let spec = TrunkSpec {
            down: config.down_layers(),
            options,
            head_channels: layout.out_channels(),
            head_kernel: 1,
            pixels: (config.number_of_pixel_types > 0)
                .then(|| (config.up_layers(), config.number_of_pixel_types)),
            up_options: CompileOptions {
                dilation: 1,
                ..options
            },
        };
        let trunk = Trunk::new(&spec, device)?;

        log::debug!(
            "yolo detector: {} anchors, {} box types, {} output channels, scale {}",
            layout.anchors.len(),
            layout.box_types,
            layout.out_channels(),
            trunk.scale().value()
        );

        Ok(Self {
            trunk,
            layout: Ignored(layout),
            for_pairing: false,
        })
    }

    /// Switches forward to return the raw anchor block and final features.
    pub fn set_for_pairing(mut self, for_pairing: bool) -> Self {
        self.for_pairing = for_pairing;
        self
    }

    /// Channel layout of the prediction conv.
    ///
    pub fn layout(&self) -> &AnchorLayout {
        &self.layout
    }

    pub fn trunk(&self) -> &Trunk<B> {
        &self.trunk
    }

    /// Channel count of the backbone's last stage.
    pub fn last_channels(&self) -> usize {
        self.trunk.last_channels()
    }

    /// Runs `img` through the backbone and prediction conv.
    ///
    /// In pairing mode the raw anchor block and the last backbone level are
    /// returned; otherwise every block is decoded.
    ///
    pub fn forward(&self, img: Tensor<B, 4>) -> DetectorResult<YoloForward<B>> {
        let levels = self.trunk.levels(img);
        let y = self.trunk.predict(&levels);

        if self.for_pairing {
            let final_features = levels[levels.len() - 1].clone();
            return Ok(YoloForward::Pairing(PairingOutput {
                anchors: self.layout.raw_anchor_block(&y),
                final_features,
            }));
        }

        let predictions = self.layout.decode(&y, self.trunk.scale());
        let pixels = self.trunk.pixels(&levels)?;

        Ok(YoloForward::Decoded(YoloOutput {
            predictions,
            pixels,
        }))
    }

    /// Human readable summary: anchors, channel ranges, compiled stages, scale
    /// and parameter count.
    ///
    pub fn summary(&self) -> String {
        let layout = self.layout();
        let mut lines = vec![
            format!(
                "YoloDetector: {} anchors, {} box types, {} line types, {} point types",
                layout.anchors.len(),
                layout.box_types,
                layout.line_count,
                layout.point_count
            ),
            format!(
                "channels: anchors 0..{}, lines {}..{}, points {}..{}",
                layout.anchor_channels(),
                layout.line_offset(0),
                layout.line_offset(layout.line_count),
                layout.point_offset(0),
                layout.out_channels()
            ),
        ];
        lines.extend(self.trunk.describe());
        lines.push(format!("scale: {}", self.trunk.scale().value()));
        lines.push(format!("parameters: {}", self.num_params()));
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::parse_tokens;
    use burn::backend::{NdArray, ndarray::NdArrayDevice};
    use std::io::Write;

    type B = NdArray<f32>;

    fn anchors() -> Vec<Anchor> {
        vec![Anchor::new(0.0, 12.0, 30.0), Anchor::new(1.57, 20.0, 8.0)]
    }

    fn small_config() -> DetectorConfig {
        DetectorConfig::new()
            .with_number_of_box_types(3)
            .with_number_of_line_types(1)
            .with_number_of_point_types(2)
            .with_norm_type(NormKind::GroupNorm)
            .with_down_layers_cfg(Some(parse_tokens("3 8 M R8 D16").unwrap()))
    }

    fn decoded(forward: YoloForward<B>) -> YoloOutput<B> {
        match forward {
            YoloForward::Decoded(output) => output,
            YoloForward::Pairing(_) => panic!("expected decoded predictions"),
        }
    }

    #[test]
    fn test_output_shapes() {
        let device = &NdArrayDevice::default();
        let model = YoloDetector::<B>::with_anchors(&small_config(), anchors(), device).unwrap();
        assert_eq!(model.layout().out_channels(), 2 * 9 + 8 + 2 * 3);
        assert_eq!(model.trunk().scale().value(), 4.0);

        let output = decoded(model.forward(Tensor::ones([2, 3, 16, 20], device)).unwrap());
        let predictions = output.predictions;

        // 4 rows x 5 cols per anchor
        assert_eq!(predictions.boxes.dims(), [2, 40, 9]);
        assert_eq!(predictions.box_offsets.dims(), [2, 2, 4, 5, 9]);
        assert_eq!(predictions.lines[0].dims(), [2, 20, 8]);
        assert_eq!(predictions.line_offsets[0].dims(), [2, 8, 4, 5]);
        assert_eq!(predictions.points.len(), 2);
        assert_eq!(predictions.points[1].dims(), [2, 20, 3]);
        assert!(output.pixels.is_none());
    }

    #[test]
    fn test_pairing_returns_raw_anchor_block() {
        let device = &NdArrayDevice::default();
        let model = YoloDetector::<B>::with_anchors(&small_config(), anchors(), device)
            .unwrap()
            .set_for_pairing(true);

        match model.forward(Tensor::ones([1, 3, 16, 16], device)).unwrap() {
            YoloForward::Pairing(pairing) => {
                assert_eq!(pairing.anchors.dims(), [1, 2 * 9, 4, 4]);
                assert_eq!(pairing.final_features.dims(), [1, model.last_channels(), 4, 4]);
            }
            YoloForward::Decoded(_) => panic!("expected pairing output"),
        }
    }

    #[test]
    fn test_pixel_head_uses_up_config() {
        let device = &NdArrayDevice::default();
        let config = small_config()
            .with_number_of_pixel_types(2)
            .with_down_layers_cfg(Some(parse_tokens("3 8 M 16 M 16").unwrap()))
            .with_up_layers_cfg(Some(parse_tokens("16 U+16 8 U+8 8").unwrap()));
        let model = YoloDetector::<B>::with_anchors(&config, anchors(), device).unwrap();

        let output = decoded(model.forward(Tensor::ones([1, 3, 16, 16], device)).unwrap());
        assert_eq!(output.pixels.unwrap().dims(), [1, 2, 16, 16]);
    }

    #[test]
    fn test_anchors_are_required() {
        let device = &NdArrayDevice::default();
        assert!(matches!(
            YoloDetector::<B>::new(&small_config(), device),
            Err(DetectorError::MissingAnchors)
        ));
        assert!(matches!(
            YoloDetector::<B>::with_anchors(&small_config(), vec![], device),
            Err(DetectorError::EmptyAnchors(_))
        ));
    }

    #[test]
    fn test_anchors_loaded_from_file() {
        let device = &NdArrayDevice::default();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"[{"rot": 0.0, "height": 10.0, "width": 4.0}]"#)
            .unwrap();

        let config = small_config()
            .with_anchors_file(Some(file.path().display().to_string()));
        let model = YoloDetector::<B>::new(&config, device).unwrap();

        assert_eq!(model.layout().anchors, vec![Anchor::new(0.0, 10.0, 4.0)]);
        assert!(model.summary().contains("1 anchors"));
    }
}
