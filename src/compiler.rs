//! Expands a layer config into the stages of a network.
//!
//! Stages are split at every pooling and upsample-with-skip token so that a
//! trunk can keep the output of each stage around as a skip connection. See
//! [`LayerToken`] for the token language.

use burn::nn::PaddingConfig2d;
use burn::nn::conv::{Conv2dConfig, ConvTranspose2dConfig};
use burn::nn::pool::MaxPool2dConfig;
use burn::nn::Relu;
use burn::{
    module::Module,
    tensor::{Tensor, backend::Backend},
};

use crate::blocks::conv::conv_group;
use crate::blocks::residual::{ResBlock, ResBlockOptions};
use crate::blocks::up_merge::{UpMerge, UpMergeBuilder};
use crate::blocks::{Layer, Sequential};
use crate::config::{DropoutKind, NormKind};
use crate::error::{DetectorError, DetectorResult};
use crate::layers::LayerToken;

/// A compiled stage: a run of layers, or an upsample-merge block that also
/// needs a skip connection.
#[derive(Module, Debug)]
pub enum Stage<B: Backend> {
    Sequential(Sequential<B>),
    UpMerge(UpMerge<B>),
}

impl<B: Backend> Stage<B> {
    /// Short layer listing used by model summaries.
    ///
    pub fn describe(&self) -> String {
        match self {
            Stage::Sequential(seq) => seq.describe(),
            Stage::UpMerge(block) => {
                format!("up+skip({}) {}", block.in_channels(), block.conv().describe())
            }
        }
    }
}

/// Output channel count after every token, input channels first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelTrace(Vec<usize>);

impl ChannelTrace {
    fn new(in_ch: usize) -> Self {
        Self(vec![in_ch])
    }

    fn push(&mut self, channels: usize) {
        self.0.push(channels);
    }

    /// Channel count after the final token.
    ///
    pub fn last(&self) -> usize {
        // never empty, starts with the input channels
        self.0[self.0.len() - 1]
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }
}

/// Total stride from the input image to a feature map, kept as a power of two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScaleFactor {
    log2: i32,
}

impl ScaleFactor {
    /// A stride of `2^log2`.
    ///
    pub fn from_log2(log2: i32) -> Self {
        Self { log2 }
    }

    pub fn shifted(self, shift: i32) -> Self {
        Self {
            log2: self.log2 + shift,
        }
    }

    pub fn log2(&self) -> i32 {
        self.log2
    }

    /// The stride as a multiplier, e.g. `8.0` after three pools.
    ///
    pub fn value(&self) -> f32 {
        2f32.powi(self.log2)
    }
}

/// Settings shared by every token of one config.
#[derive(Debug, Clone, Copy)]
pub struct CompileOptions {
    /// Dilation of `W` tokens and plain residual blocks.
    pub dilation: usize,
    pub norm: NormKind,
    pub dropout: Option<DropoutKind>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            dilation: 1,
            norm: NormKind::None,
            dropout: None,
        }
    }
}

/// The result of compiling a layer config.
#[derive(Debug)]
pub struct CompiledNet<B: Backend> {
    pub stages: Vec<Stage<B>>,
    pub trace: ChannelTrace,
    pub scale: ScaleFactor,
}

impl<B: Backend> CompiledNet<B> {
    /// Channel count of the last compiled stage.
    ///
    pub fn out_channels(&self) -> usize {
        self.trace.last()
    }
}

// The stage currently being filled.
struct OpenStage<B: Backend> {
    merge: Option<UpMergeBuilder>,
    layers: Vec<Layer<B>>,
}

impl<B: Backend> OpenStage<B> {
    fn plain(layers: Vec<Layer<B>>) -> Self {
        Self {
            merge: None,
            layers,
        }
    }

    fn merging(builder: UpMergeBuilder) -> Self {
        Self {
            merge: Some(builder),
            layers: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.merge.is_none() && self.layers.is_empty()
    }

    // An upsample-merge stage takes the layers after it as its trailing stack.
    fn close(self) -> Stage<B> {
        match self.merge {
            Some(builder) => Stage::UpMerge(builder.with_conv(self.layers)),
            None => Stage::Sequential(Sequential::new(self.layers)),
        }
    }
}

struct CompileState<B: Backend> {
    stages: Vec<Stage<B>>,
    open: OpenStage<B>,
    trace: ChannelTrace,
    scale: ScaleFactor,
}

impl<B: Backend> CompileState<B> {
    fn new(in_ch: usize) -> Self {
        Self {
            stages: Vec::new(),
            open: OpenStage::plain(Vec::new()),
            trace: ChannelTrace::new(in_ch),
            scale: ScaleFactor::default(),
        }
    }

    fn step(
        self,
        token: LayerToken,
        options: &CompileOptions,
        device: &B::Device,
    ) -> DetectorResult<Self> {
        let CompileState {
            mut stages,
            mut open,
            mut trace,
            scale,
        } = self;
        let in_ch = trace.last();
        let out_ch = token.out_channels(in_ch);

        let residual = |dilation: usize, downsample: bool| {
            ResBlock::new(
                in_ch,
                out_ch,
                ResBlockOptions {
                    dilation,
                    norm: options.norm,
                    downsample,
                    dropout: options.dropout,
                },
                device,
            )
            .map(Layer::Residual)
        };
        let group = |kernel: usize, dilation: usize| {
            conv_group(
                [in_ch, out_ch],
                kernel,
                dilation,
                options.norm,
                options.dropout,
                device,
            )
        };

        match token {
            LayerToken::MaxPool => {
                // a pool always emits the stage before it, even an empty one
                stages.push(open.close());
                let pool = MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init();
                open = OpenStage::plain(vec![Layer::MaxPool(pool)]);
            }
            LayerToken::UpMerge { .. } => {
                if !open.is_empty() {
                    stages.push(open.close());
                }
                open = OpenStage::merging(UpMergeBuilder::new(in_ch));
            }
            LayerToken::Residual(_) => open.layers.push(residual(options.dilation, false)?),
            LayerToken::DownResidual(_) => open.layers.push(residual(options.dilation, true)?),
            LayerToken::DilatedResidual { dilation, .. } => {
                open.layers.push(residual(dilation, false)?)
            }
            LayerToken::TransposeUp(_) => open.layers.push(Layer::ConvTranspose(
                ConvTranspose2dConfig::new([in_ch, out_ch], [2, 2])
                    .with_stride([2, 2])
                    .with_bias(false)
                    .init(device),
            )),
            LayerToken::Dilated(_) => open.layers.extend(group(3, options.dilation)?),
            LayerToken::Kernel { kernel, .. } => open.layers.extend(group(kernel, 1)?),
            LayerToken::Dilation { dilation, .. } => open.layers.extend(group(3, dilation)?),
            LayerToken::Conv(_) => open.layers.extend(group(3, 1)?),
            LayerToken::WideConv(_) => open.layers.push(Layer::Conv(
                Conv2dConfig::new([in_ch, out_ch], [5, 5])
                    .with_padding(PaddingConfig2d::Explicit(2, 2))
                    .init(device),
            )),
            LayerToken::Relu => open.layers.push(Layer::Relu(Relu::new())),
        }

        trace.push(out_ch);

        Ok(CompileState {
            stages,
            open,
            trace,
            scale: scale.shifted(token.stride_shift()),
        })
    }

    fn finish(self) -> CompiledNet<B> {
        let mut stages = self.stages;
        if !self.open.is_empty() {
            stages.push(self.open.close());
        }

        CompiledNet {
            stages,
            trace: self.trace,
            scale: self.scale,
        }
    }
}

/// Compiles `cfg` into stages. The first token must be the input channel
/// count.
pub fn compile<B: Backend>(
    cfg: &[LayerToken],
    options: &CompileOptions,
    device: &B::Device,
) -> DetectorResult<CompiledNet<B>> {
    let (in_ch, tokens) = match cfg.split_first() {
        Some((LayerToken::Conv(in_ch), tokens)) => (*in_ch, tokens),
        _ => return Err(DetectorError::MissingInputChannels),
    };

    let state = tokens
        .iter()
        .try_fold(CompileState::new(in_ch), |state, token| {
            state.step(*token, options, device)
        })?;
    let net = state.finish();

    log::debug!(
        "compiled {} tokens into {} stages, {} -> {} channels, scale {}",
        tokens.len(),
        net.stages.len(),
        in_ch,
        net.out_channels(),
        net.scale.value()
    );

    Ok(net)
}
