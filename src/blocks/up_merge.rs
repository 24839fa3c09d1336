use burn::{
    module::Module,
    tensor::{
        Tensor,
        backend::Backend,
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
    },
};

use super::{Layer, Sequential};
use crate::error::{DetectorError, DetectorResult};

/// Upsamples a coarse feature map and merges it with a finer skip connection.
///
/// The coarse map is bilinearly upsampled 2x, padded symmetrically (the extra
/// pixel of an odd difference goes right / bottom) to the skip's spatial size,
/// concatenated after the skip along channels and run through the trailing
/// convolution stack.
#[derive(Module, Debug)]
pub struct UpMerge<B: Backend> {
    in_channels: usize,
    conv: Sequential<B>,
}

/// First half of an [`UpMerge`]: knows its input width, waits for its trailing
/// convolutions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpMergeBuilder {
    in_channels: usize,
}

impl UpMergeBuilder {
    pub fn new(in_channels: usize) -> Self {
        Self { in_channels }
    }

    /// Attaches the trailing stack, producing a complete block.
    pub fn with_conv<B: Backend>(self, layers: Vec<Layer<B>>) -> UpMerge<B> {
        UpMerge {
            in_channels: self.in_channels,
            conv: Sequential::new(layers),
        }
    }
}

impl<B: Backend> UpMerge<B> {
    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn conv(&self) -> &Sequential<B> {
        &self.conv
    }

    /// Upsamples, pads and concatenates without the trailing stack.
    pub fn merge(&self, coarse: Tensor<B, 4>, skip: Tensor<B, 4>) -> DetectorResult<Tensor<B, 4>> {
        let [batch, channels, height, width] = coarse.dims();
        let skip_dims = skip.dims();

        let up = interpolate(
            coarse,
            [height * 2, width * 2],
            InterpolateOptions::new(InterpolateMode::Bilinear),
        );

        let mismatch = || DetectorError::ShapeMismatch {
            upsampled: [batch, channels, height * 2, width * 2],
            skip: skip_dims,
        };
        if skip_dims[0] != batch {
            return Err(mismatch());
        }
        let diff_y = skip_dims[2].checked_sub(height * 2).ok_or_else(mismatch)?;
        let diff_x = skip_dims[3].checked_sub(width * 2).ok_or_else(mismatch)?;

        let up = pad_zeros(up, 3, diff_x / 2, diff_x.div_ceil(2));
        let up = pad_zeros(up, 2, diff_y / 2, diff_y.div_ceil(2));

        Ok(Tensor::cat(vec![skip, up], 1))
    }

    /// Merges `coarse` into `skip` and runs the trailing stack.
    ///
    /// Fails with [`DetectorError::ShapeMismatch`] when the skip is smaller
    /// than the upsampled map or has a different batch size.
    ///
    pub fn forward(&self, coarse: Tensor<B, 4>, skip: Tensor<B, 4>) -> DetectorResult<Tensor<B, 4>> {
        Ok(self.conv.forward(self.merge(coarse, skip)?))
    }
}

/// Zero-pads `dim` with `before` and `after` entries.
fn pad_zeros<B: Backend>(x: Tensor<B, 4>, dim: usize, before: usize, after: usize) -> Tensor<B, 4> {
    if before == 0 && after == 0 {
        return x;
    }

    let zeros = |amount: usize| {
        let mut dims = x.dims();
        dims[dim] = amount;
        Tensor::<B, 4>::zeros(dims, &x.device())
    };
    let head = (before > 0).then(|| zeros(before));
    let tail = (after > 0).then(|| zeros(after));

    let pieces: Vec<Tensor<B, 4>> = head.into_iter().chain([x]).chain(tail).collect();
    Tensor::cat(pieces, dim)
}
