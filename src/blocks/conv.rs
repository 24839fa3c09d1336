use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{
    BatchNorm, BatchNormConfig, Dropout, DropoutConfig, GroupNorm, GroupNormConfig, InstanceNorm,
    InstanceNormConfig, PaddingConfig2d, Relu,
};
use burn::{
    module::{Module, Param},
    tensor::{Tensor, activation::relu, backend::Backend, module::conv2d, ops::ConvOptions},
};

use super::Layer;
use crate::config::{DROPOUT_PROB, DropoutKind, NORM_GROUPS, NormKind};
use crate::error::{DetectorError, DetectorResult};

/// Normalization layer selected by [`NormKind`].
#[derive(Module, Debug)]
pub enum Norm<B: Backend> {
    Batch(BatchNorm<B>),
    Instance(InstanceNorm<B>),
    Group(GroupNorm<B>),
}

impl<B: Backend> Norm<B> {
    /// Builds the normalization for `kind`, or `None` when the kind inserts no
    /// layer (`none` and `weight_norm`).
    pub fn new(kind: NormKind, channels: usize, device: &B::Device) -> DetectorResult<Option<Self>> {
        let norm = match kind {
            NormKind::BatchNorm => Norm::Batch(BatchNormConfig::new(channels).init(device)),
            // no affine parameters, as with the models' training setup
            NormKind::InstanceNorm => Norm::Instance(
                InstanceNormConfig::new(channels)
                    .with_affine(false)
                    .init(device),
            ),
            NormKind::GroupNorm => {
                if channels % NORM_GROUPS != 0 {
                    return Err(DetectorError::NormGroups {
                        groups: NORM_GROUPS,
                        channels,
                    });
                }
                Norm::Group(GroupNormConfig::new(NORM_GROUPS, channels).init(device))
            }
            NormKind::WeightNorm | NormKind::None => return Ok(None),
        };
        Ok(Some(norm))
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Norm::Batch(norm) => norm.forward(x),
            Norm::Instance(norm) => norm.forward(x),
            Norm::Group(norm) => norm.forward(x),
        }
    }
}

/// 2D convolution whose kernel is reparameterized as `g * v / ||v||`, with
/// the norm taken per output channel.
#[derive(Module, Debug)]
pub struct WeightNormConv2d<B: Backend> {
    v: Param<Tensor<B, 4>>,
    g: Param<Tensor<B, 4>>,
    bias: Option<Param<Tensor<B, 1>>>,
    padding: usize,
    dilation: usize,
}

impl<B: Backend> WeightNormConv2d<B> {
    pub fn new(
        channels: [usize; 2],
        kernel: usize,
        padding: usize,
        dilation: usize,
        device: &B::Device,
    ) -> Self {
        let conv = Conv2dConfig::new(channels, [kernel, kernel]).init(device);
        // start with g = ||v|| so the initial kernel equals the plain init
        let g = Self::channel_norm(conv.weight.val());

        Self {
            v: conv.weight,
            g: Param::from_tensor(g),
            bias: conv.bias,
            padding,
            dilation,
        }
    }

    // [out, in, k, k] -> [out, 1, 1, 1]
    fn channel_norm(v: Tensor<B, 4>) -> Tensor<B, 4> {
        v.powf_scalar(2.0)
            .sum_dim(1)
            .sum_dim(2)
            .sum_dim(3)
            .sqrt()
    }

    /// The effective kernel `g * v / ||v||`.
    ///
    pub fn weight(&self) -> Tensor<B, 4> {
        let v = self.v.val();
        let [_, in_ch, kh, kw] = v.dims();
        let factor = (self.g.val() / Self::channel_norm(v.clone())).repeat(&[1, in_ch, kh, kw]);
        v * factor
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let options = ConvOptions::new(
            [1, 1],
            [self.padding, self.padding],
            [self.dilation, self.dilation],
            1,
        );
        conv2d(
            x,
            self.weight(),
            self.bias.as_ref().map(|bias| bias.val()),
            options,
        )
    }
}

/// Channel dropout: zeroes whole feature maps during training.
#[derive(Module, Clone, Debug)]
pub struct Dropout2d {
    dropout: Dropout,
}

impl Dropout2d {
    pub fn new(prob: f64) -> Self {
        Self {
            dropout: DropoutConfig::new(prob).init(),
        }
    }

    pub fn forward<B: Backend>(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, channels, height, width] = x.dims();
        // dropout on a ones tensor yields the already rescaled keep mask, and is
        // the identity outside of training
        let mask = self
            .dropout
            .forward(Tensor::<B, 4>::ones([batch, channels, 1, 1], &x.device()))
            .repeat(&[1, 1, height, width]);
        x * mask
    }
}

/// Builds the dropout layer for `kind`.
pub fn dropout_layer<B: Backend>(kind: DropoutKind) -> Layer<B> {
    match kind {
        DropoutKind::Normal => Layer::Dropout(DropoutConfig::new(DROPOUT_PROB).init()),
        DropoutKind::Channel => Layer::Dropout2d(Dropout2d::new(DROPOUT_PROB)),
    }
}

/// A convolution that is plain or weight normalized depending on the config.
#[derive(Module, Debug)]
pub enum ConvUnit<B: Backend> {
    Plain(Conv2d<B>),
    Weighted(WeightNormConv2d<B>),
}

impl<B: Backend> ConvUnit<B> {
    /// Square `kernel` conv with `dilation * (kernel / 2)` padding, weight
    /// normalized when `norm` is [`NormKind::WeightNorm`].
    ///
    pub fn new(
        channels: [usize; 2],
        kernel: usize,
        dilation: usize,
        norm: NormKind,
        device: &B::Device,
    ) -> Self {
        let padding = dilation * (kernel / 2);
        match norm {
            NormKind::WeightNorm => ConvUnit::Weighted(WeightNormConv2d::new(
                channels, kernel, padding, dilation, device,
            )),
            _ => ConvUnit::Plain(
                Conv2dConfig::new(channels, [kernel, kernel])
                    .with_padding(PaddingConfig2d::Explicit(padding, padding))
                    .with_dilation([dilation, dilation])
                    .init(device),
            ),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            ConvUnit::Plain(conv) => conv.forward(x),
            ConvUnit::Weighted(conv) => conv.forward(x),
        }
    }

    pub fn into_layer(self) -> Layer<B> {
        match self {
            ConvUnit::Plain(conv) => Layer::Conv(conv),
            ConvUnit::Weighted(conv) => Layer::WeightNormConv(conv),
        }
    }
}

/// Conv, normalization, ReLU and optional dropout, in that order.
///
/// Padding is `dilation * (kernel / 2)`, which keeps the spatial size for odd
/// kernels.
pub fn conv_group<B: Backend>(
    channels: [usize; 2],
    kernel: usize,
    dilation: usize,
    norm: NormKind,
    dropout: Option<DropoutKind>,
    device: &B::Device,
) -> DetectorResult<Vec<Layer<B>>> {
    let mut layers = vec![ConvUnit::new(channels, kernel, dilation, norm, device).into_layer()];

    if let Some(norm) = Norm::new(norm, channels[1], device)? {
        layers.push(Layer::Norm(norm));
    }
    layers.push(Layer::Relu(Relu::new()));

    if let Some(kind) = dropout {
        layers.push(dropout_layer(kind));
    }

    Ok(layers)
}

/// Concatenated ReLU: `[relu(x), -relu(-x)]` along channels, doubling them.
pub fn concat_relu<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    Tensor::cat(vec![relu(x.clone()), relu(x.neg()).neg()], 1)
}
