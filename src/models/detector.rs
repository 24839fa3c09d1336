use burn::{
    module::Module,
    tensor::{Tensor, backend::Backend},
};

use super::trunk::{Trunk, TrunkSpec};
use crate::compiler::CompileOptions;
use crate::config::DetectorConfig;
use crate::decode::DirectLayout;
use crate::error::DetectorResult;

/// Output of [`Detector::forward`].
#[derive(Debug, Clone)]
pub struct DetectorOutput<B: Backend> {
    /// One `[batch, instances, 5]` tensor per line type:
    /// confidence, x, y, rotation, scale.
    pub lines: Vec<Tensor<B, 3>>,
    /// One `[batch, instances, 3]` tensor per point type: confidence, x, y.
    pub points: Vec<Tensor<B, 3>>,
    /// `[batch, pixel types, rows, cols]` mask logits.
    pub pixels: Option<Tensor<B, 4>>,
}

/// Line and point detector regressing positions straight off the cell
/// centres of the last feature map.
#[derive(Module, Debug)]
pub struct Detector<B: Backend> {
    trunk: Trunk<B>,
    line_count: usize,
    point_count: usize,
}

impl<B: Backend> Detector<B> {
    /// Builds the detector described by `config`.
    ///
    /// The prediction conv is 3x3 with `5 * lines + 3 * points` outputs. A
    /// pixel head is added when `number_of_pixel_types` is non-zero.
    ///
    pub fn new(config: &DetectorConfig, device: &B::Device) -> DetectorResult<Self> {
        let layout = DirectLayout {
            line_count: config.number_of_line_types,
            point_count: config.number_of_point_types,
        };

        let options = CompileOptions {
            dilation: config.dilation,
            norm: config.norm_type,
            dropout: config.dropout,
        };
        let spec = TrunkSpec {
            down: config.down_layers(),
            options,
            head_channels: layout.out_channels(),
            head_kernel: 3,
            pixels: (config.number_of_pixel_types > 0)
                .then(|| (config.up_layers(), config.number_of_pixel_types)),
            up_options: CompileOptions {
                dilation: 1,
                ..options
            },
        };

        let trunk = Trunk::new(&spec, device)?;
        log::debug!(
            "detector: {} line types, {} point types, scale {}",
            layout.line_count,
            layout.point_count,
            trunk.scale().value()
        );

        Ok(Self {
            trunk,
            line_count: layout.line_count,
            point_count: layout.point_count,
        })
    }

    /// Channel layout of the prediction conv.
    ///
    pub fn layout(&self) -> DirectLayout {
        DirectLayout {
            line_count: self.line_count,
            point_count: self.point_count,
        }
    }

    pub fn trunk(&self) -> &Trunk<B> {
        &self.trunk
    }

    /// Runs `img` (`[batch, channels, height, width]`) through the backbone and
    /// decodes lines, points and, if configured, the pixel mask.
    ///
    pub fn forward(&self, img: Tensor<B, 4>) -> DetectorResult<DetectorOutput<B>> {
        let levels = self.trunk.levels(img);
        let y = self.trunk.predict(&levels);

        let decoded = self.layout().decode(&y, self.trunk.scale());
        let pixels = self.trunk.pixels(&levels)?;

        Ok(DetectorOutput {
            lines: decoded.lines,
            points: decoded.points,
            pixels,
        })
    }

    /// Human readable summary: layout, compiled stages, scale and parameter
    /// count.
    ///
    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "Detector: {} line types, {} point types, {} prediction channels",
            self.line_count,
            self.point_count,
            self.layout().out_channels()
        )];
        lines.extend(self.trunk.describe());
        lines.push(format!("scale: {}", self.trunk.scale().value()));
        lines.push(format!("parameters: {}", self.num_params()));
        lines.join("\n")
    }
}
