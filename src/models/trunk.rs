use burn::nn::PaddingConfig2d;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::{
    module::Module,
    tensor::{Tensor, backend::Backend},
};

use crate::blocks::Sequential;
use crate::compiler::{CompileOptions, ScaleFactor, Stage, compile};
use crate::error::{DetectorError, DetectorResult};
use crate::layers::LayerToken;

fn head_conv<B: Backend>(channels: [usize; 2], kernel: usize, device: &B::Device) -> Conv2d<B> {
    let padding = kernel / 2;
    Conv2dConfig::new(channels, [kernel, kernel])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .init(device)
}

/// Up-sampling path producing pixel mask logits.
///
/// Every upsample-merge stage takes the next earlier backbone level as its
/// skip connection; plain stages take none.
#[derive(Module, Debug)]
pub struct PixelHead<B: Backend> {
    stages: Vec<Stage<B>>,
    out: Conv2d<B>,
}

impl<B: Backend> PixelHead<B> {
    /// Compiles the up-sampling config `cfg` and appends a `kernel` sized conv
    /// to `pixel_types` mask channels.
    ///
    pub fn new(
        cfg: &[LayerToken],
        pixel_types: usize,
        kernel: usize,
        options: &CompileOptions,
        device: &B::Device,
    ) -> DetectorResult<Self> {
        let net = compile(cfg, options, device)?;
        let out = head_conv([net.out_channels(), pixel_types], kernel, device);

        Ok(Self {
            stages: net.stages,
            out,
        })
    }

    /// `levels` are the input image followed by every backbone stage output.
    /// Decoding starts from the last one.
    pub fn forward(&self, levels: &[Tensor<B, 4>]) -> DetectorResult<Tensor<B, 4>> {
        let mut skip = levels.len().checked_sub(1).ok_or(DetectorError::MissingSkip(0))?;
        let mut y = levels[skip].clone();

        for (index, stage) in self.stages.iter().enumerate() {
            y = match stage {
                Stage::Sequential(seq) => seq.forward(y),
                Stage::UpMerge(block) => {
                    skip = skip.checked_sub(1).ok_or(DetectorError::MissingSkip(index))?;
                    block.forward(y, levels[skip].clone())?
                }
            };
        }

        Ok(self.out.forward(y))
    }

    /// One description per compiled up-sampling stage.
    ///
    pub fn describe(&self) -> Vec<String> {
        self.stages.iter().map(Stage::describe).collect()
    }
}

/// Shared body of both detectors: the down-sampling backbone, the final
/// prediction conv and the optional pixel head.
#[derive(Module, Debug)]
pub struct Trunk<B: Backend> {
    stages: Vec<Sequential<B>>,
    head: Conv2d<B>,
    pixel_head: Option<PixelHead<B>>,
    scale_log2: i32,
    last_channels: usize,
}

/// How the trunk's convolutions are laid out.
#[derive(Debug, Clone)]
pub struct TrunkSpec {
    pub down: Vec<LayerToken>,
    pub options: CompileOptions,
    /// Channels of the final prediction conv.
    pub head_channels: usize,
    pub head_kernel: usize,
    /// Up-sampling config and mask count, when pixel predictions are wanted.
    pub pixels: Option<(Vec<LayerToken>, usize)>,
    pub up_options: CompileOptions,
}

impl<B: Backend> Trunk<B> {
    /// Builds the backbone, prediction conv and optional pixel head.
    ///
    /// Fails when a config does not compile or when the down-sampling config
    /// contains an upsample-with-skip token.
    ///
    pub fn new(spec: &TrunkSpec, device: &B::Device) -> DetectorResult<Self> {
        let net = compile(&spec.down, &spec.options, device)?;
        let last_channels = net.out_channels();
        let scale = net.scale;

        let stages = net
            .stages
            .into_iter()
            .map(|stage| match stage {
                Stage::Sequential(seq) => Ok(seq),
                Stage::UpMerge(_) => Err(DetectorError::SkipInBackbone),
            })
            .collect::<DetectorResult<Vec<_>>>()?;

        let head = head_conv([last_channels, spec.head_channels], spec.head_kernel, device);

        let pixel_head = match &spec.pixels {
            Some((up, pixel_types)) => Some(PixelHead::new(
                up,
                *pixel_types,
                spec.head_kernel,
                &spec.up_options,
                device,
            )?),
            None => None,
        };

        Ok(Self {
            stages,
            head,
            pixel_head,
            scale_log2: scale.log2(),
            last_channels,
        })
    }

    /// Total stride from the input image to the last backbone level.
    ///
    pub fn scale(&self) -> ScaleFactor {
        ScaleFactor::from_log2(self.scale_log2)
    }

    /// Channel count of the last backbone level.
    ///
    pub fn last_channels(&self) -> usize {
        self.last_channels
    }

    /// Runs the backbone, keeping the input and every stage output.
    pub fn levels(&self, img: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let mut levels = Vec::with_capacity(self.stages.len() + 1);
        levels.push(img);
        for stage in self.stages.iter() {
            let x = levels[levels.len() - 1].clone();
            levels.push(stage.forward(x));
        }
        levels
    }

    /// The raw prediction tensor for the last level.
    pub fn predict(&self, levels: &[Tensor<B, 4>]) -> Tensor<B, 4> {
        self.head.forward(levels[levels.len() - 1].clone())
    }

    /// Pixel mask logits for `levels`, or `None` when the trunk was built
    /// without a pixel head.
    ///
    pub fn pixels(&self, levels: &[Tensor<B, 4>]) -> DetectorResult<Option<Tensor<B, 4>>> {
        self.pixel_head
            .as_ref()
            .map(|head| head.forward(levels))
            .transpose()
    }

    /// One line per compiled stage, for summaries.
    pub fn describe(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .stages
            .iter()
            .enumerate()
            .map(|(i, stage)| format!("down {i}: {}", stage.describe()))
            .collect();
        lines.push(format!(
            "head: conv {} -> {}",
            self.last_channels,
            self.head.weight.dims()[0]
        ));
        if let Some(pixel_head) = &self.pixel_head {
            for (i, stage) in pixel_head.describe().into_iter().enumerate() {
                lines.push(format!("up {i}: {stage}"));
            }
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::parse_tokens;
    use burn::backend::{NdArray, ndarray::NdArrayDevice};

    type B = NdArray<f32>;

    fn spec(down: &str, pixels: Option<(&str, usize)>) -> TrunkSpec {
        TrunkSpec {
            down: parse_tokens(down).unwrap(),
            options: CompileOptions::default(),
            head_channels: 4,
            head_kernel: 3,
            pixels: pixels.map(|(up, n)| (parse_tokens(up).unwrap(), n)),
            up_options: CompileOptions::default(),
        }
    }

    #[test]
    fn test_levels_keep_every_stage() {
        let device = &NdArrayDevice::default();
        let trunk = Trunk::<B>::new(&spec("3 8 M 16 M 16", None), device).unwrap();

        let levels = trunk.levels(Tensor::ones([1, 3, 16, 16], device));
        let dims: Vec<[usize; 4]> = levels.iter().map(|l| l.dims()).collect();
        assert_eq!(
            dims,
            vec![[1, 3, 16, 16], [1, 8, 16, 16], [1, 16, 8, 8], [1, 16, 4, 4]]
        );
        assert_eq!(trunk.predict(&levels).dims(), [1, 4, 4, 4]);
        assert_eq!(trunk.scale().value(), 4.0);
    }

    #[test]
    fn test_skip_token_rejected_in_backbone() {
        let device = &NdArrayDevice::default();
        assert!(matches!(
            Trunk::<B>::new(&spec("3 8 U+8 8", None), device),
            Err(DetectorError::SkipInBackbone)
        ));
    }

    #[test]
    fn test_pixel_head_restores_resolution() {
        let device = &NdArrayDevice::default();
        let trunk =
            Trunk::<B>::new(&spec("3 8 M 16 M 16", Some(("16 U+16 8 U+8 8", 2))), device).unwrap();

        let levels = trunk.levels(Tensor::ones([2, 3, 16, 20], device));
        let pixels = trunk.pixels(&levels).unwrap().unwrap();

        assert_eq!(pixels.dims(), [2, 2, 16, 20]);
    }

    #[test]
    fn test_pixel_head_runs_out_of_skips() {
        let device = &NdArrayDevice::default();
        let head = PixelHead::<B>::new(
            &parse_tokens("8 U+8 8").unwrap(),
            1,
            1,
            &CompileOptions::default(),
            device,
        )
        .unwrap();

        let levels = vec![Tensor::<B, 4>::ones([1, 8, 4, 4], device)];
        assert!(matches!(
            head.forward(&levels),
            Err(DetectorError::MissingSkip(0))
        ));
    }
}
