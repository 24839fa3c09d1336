use burn::nn::pool::{AvgPool2d, AvgPool2dConfig};
use burn::nn::{Dropout, DropoutConfig};
use burn::{
    module::Module,
    tensor::{Tensor, activation::relu, backend::Backend},
};

use super::conv::{ConvUnit, Dropout2d, Norm, concat_relu};
use crate::config::{DROPOUT_PROB, DropoutKind, NormKind};
use crate::error::{DetectorError, DetectorResult};

/// Residual unit without a projection on the identity path.
///
/// Widening is done by a concatenated ReLU in front of the block, so the only
/// legal channel changes are none and doubling.
///
/// ```text
/// x -> transform -> t
/// t -> [norm] [relu] conv3x3(dilation) [norm] relu [dropout] conv3x3 -> s
/// y = t + s
/// ```
///
/// `transform` is `[concat relu] [avg pool 2x]`, or the identity. The first
/// ReLU of the side path is skipped when the concatenated ReLU already ran.
#[derive(Module, Debug)]
pub struct ResBlock<B: Backend> {
    widen: bool,
    pool: Option<AvgPool2d>,
    norm1: Option<Norm<B>>,
    conv1: ConvUnit<B>,
    norm2: Option<Norm<B>>,
    dropout: Option<Dropout>,
    dropout2d: Option<Dropout2d>,
    conv2: ConvUnit<B>,
}

/// Options for [`ResBlock::new`].
#[derive(Debug, Clone, Copy)]
pub struct ResBlockOptions {
    pub dilation: usize,
    pub norm: NormKind,
    pub downsample: bool,
    pub dropout: Option<DropoutKind>,
}

impl Default for ResBlockOptions {
    fn default() -> Self {
        Self {
            dilation: 1,
            norm: NormKind::None,
            downsample: false,
            dropout: None,
        }
    }
}

impl<B: Backend> ResBlock<B> {
    /// Builds a block mapping `in_ch` to `out_ch` channels.
    ///
    /// Fails with [`DetectorError::ChannelRatio`] unless `out_ch` equals
    /// `in_ch` or twice `in_ch`.
    ///
    pub fn new(
        in_ch: usize,
        out_ch: usize,
        options: ResBlockOptions,
        device: &B::Device,
    ) -> DetectorResult<Self> {
        let widen = in_ch != out_ch;
        if widen && out_ch != 2 * in_ch {
            return Err(DetectorError::ChannelRatio { in_ch, out_ch });
        }

        let pool = options
            .downsample
            .then(|| AvgPool2dConfig::new([2, 2]).with_strides([2, 2]).init());

        let (dropout, dropout2d) = match options.dropout {
            Some(DropoutKind::Normal) => (Some(DropoutConfig::new(DROPOUT_PROB).init()), None),
            Some(DropoutKind::Channel) => (None, Some(Dropout2d::new(DROPOUT_PROB))),
            None => (None, None),
        };

        Ok(Self {
            widen,
            pool,
            norm1: Norm::new(options.norm, out_ch, device)?,
            conv1: ConvUnit::new([out_ch, out_ch], 3, options.dilation, options.norm, device),
            norm2: Norm::new(options.norm, out_ch, device)?,
            dropout,
            dropout2d,
            conv2: ConvUnit::new([out_ch, out_ch], 3, 1, options.norm, device),
        })
    }

    fn transform(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = if self.widen { concat_relu(x) } else { x };
        match &self.pool {
            Some(pool) => pool.forward(x),
            None => x,
        }
    }

    fn side(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = x;
        if let Some(norm) = &self.norm1 {
            x = norm.forward(x);
        }
        if !self.widen {
            x = relu(x);
        }
        x = self.conv1.forward(x);

        if let Some(norm) = &self.norm2 {
            x = norm.forward(x);
        }
        x = relu(x);
        if let Some(dropout) = &self.dropout {
            x = dropout.forward(x);
        }
        if let Some(dropout) = &self.dropout2d {
            x = dropout.forward(x);
        }
        self.conv2.forward(x)
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.transform(x);
        x.clone() + self.side(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{NdArray, ndarray::NdArrayDevice};

    type B = NdArray<f32>;

    #[test]
    fn test_doubling_ratio_builds() {
        let device = &NdArrayDevice::default();
        assert!(ResBlock::<B>::new(64, 128, ResBlockOptions::default(), device).is_ok());
        assert!(ResBlock::<B>::new(64, 64, ResBlockOptions::default(), device).is_ok());
    }

    #[test]
    fn test_other_ratios_fail() {
        let device = &NdArrayDevice::default();
        let err = ResBlock::<B>::new(64, 100, ResBlockOptions::default(), device).unwrap_err();
        assert!(matches!(
            err,
            DetectorError::ChannelRatio { in_ch: 64, out_ch: 100 }
        ));
        assert!(ResBlock::<B>::new(64, 32, ResBlockOptions::default(), device).is_err());
    }

    #[test]
    fn test_forward_shapes() {
        let device = &NdArrayDevice::default();
        let x = Tensor::<B, 4>::ones([2, 4, 8, 6], device);

        let widen = ResBlock::<B>::new(4, 8, ResBlockOptions::default(), device).unwrap();
        assert_eq!(widen.forward(x.clone()).dims(), [2, 8, 8, 6]);

        let options = ResBlockOptions {
            dilation: 2,
            norm: NormKind::BatchNorm,
            downsample: true,
            dropout: Some(DropoutKind::Normal),
        };
        let down = ResBlock::<B>::new(4, 4, options, device).unwrap();
        assert_eq!(down.forward(x.clone()).dims(), [2, 4, 4, 3]);

        let options = ResBlockOptions {
            norm: NormKind::WeightNorm,
            downsample: true,
            ..Default::default()
        };
        let both = ResBlock::<B>::new(4, 8, options, device).unwrap();
        assert_eq!(both.forward(x).dims(), [2, 8, 4, 3]);
    }
}
