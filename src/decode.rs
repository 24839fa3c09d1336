//! Turns the raw trunk output into per-type instance tensors.
//!
//! The raw output is `[batch, channels, rows, cols]` with the channels split
//! into fixed, contiguous blocks. Each block is decoded against the prior grid
//! and flattened to `[batch, instances, params]`.
//!
//! Flattening swaps the channel and column axes before merging the spatial
//! ones, so instance `k` is the cell at column `k / rows`, row `k % rows`.

use std::f32::consts::{FRAC_PI_2, PI};

use burn::{
    prelude::Backend,
    tensor::{Tensor, activation::sigmoid},
};

use crate::anchors::Anchor;
use crate::compiler::ScaleFactor;
use crate::config::{MEAN_HALF_HEIGHT_ALIGNED, MEAN_HALF_HEIGHT_ROTATED};
use crate::priors::PriorGrid;

/// conf, x, y, rotation, scale
pub const LINE_PARAMS: usize = 5;
/// conf, x, y
pub const POINT_PARAMS: usize = 3;
/// conf, x, y, rotation, height, width
pub const BOX_PARAMS: usize = 6;

fn channel<B: Backend>(y: &Tensor<B, 4>, index: usize) -> Tensor<B, 4> {
    y.clone().narrow(1, index, 1)
}

/// `[batch, channels, rows, cols]` -> `[batch, cols * rows, channels]`
pub fn flatten_instances<B: Backend>(t: Tensor<B, 4>) -> Tensor<B, 3> {
    let [batch, channels, _, _] = t.dims();
    t.swap_dims(1, 3)
        .reshape([batch as i32, -1, channels as i32])
}

/// Line decoding of the direct detector: offsets are added to the priors
/// untouched and rotation / scale are passed through.
pub fn decode_direct_line<B: Backend>(
    y: &Tensor<B, 4>,
    offset: usize,
    priors: &PriorGrid<B>,
) -> Tensor<B, 3> {
    let predictions = Tensor::cat(
        vec![
            sigmoid(channel(y, offset)),
            channel(y, offset + 1) + priors.cols.clone(),
            channel(y, offset + 2) + priors.rows.clone(),
            channel(y, offset + 3),
            channel(y, offset + 4),
        ],
        1,
    );
    flatten_instances(predictions)
}

/// Point decoding, shared by both detectors.
pub fn decode_point<B: Backend>(
    y: &Tensor<B, 4>,
    offset: usize,
    priors: &PriorGrid<B>,
) -> Tensor<B, 3> {
    let predictions = Tensor::cat(
        vec![
            sigmoid(channel(y, offset)),
            channel(y, offset + 1) + priors.cols.clone(),
            channel(y, offset + 2) + priors.rows.clone(),
        ],
        1,
    );
    flatten_instances(predictions)
}

/// Decoded lines and points of the direct detector.
#[derive(Debug, Clone)]
pub struct DirectPredictions<B: Backend> {
    /// One `[batch, instances, 5]` tensor per line type.
    pub lines: Vec<Tensor<B, 3>>,
    /// One `[batch, instances, 3]` tensor per point type.
    pub points: Vec<Tensor<B, 3>>,
}

/// Channel layout of the direct detector: all line blocks, then all point
/// blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectLayout {
    pub line_count: usize,
    pub point_count: usize,
}

impl DirectLayout {
    /// Number of channels the prediction conv must produce for this layout.
    ///
    pub fn out_channels(&self) -> usize {
        LINE_PARAMS * self.line_count + POINT_PARAMS * self.point_count
    }

    /// Decodes the raw prediction map `y` into per-type line and point instances.
    ///
    /// `scale` is the backbone stride; cell `(r, c)` has its prior at
    /// `((c + 0.5) * scale, (r + 0.5) * scale)`.
    ///
    pub fn decode<B: Backend>(&self, y: &Tensor<B, 4>, scale: ScaleFactor) -> DirectPredictions<B> {
        let priors = PriorGrid::for_map(y, scale);

        let lines = (0..self.line_count)
            .map(|i| decode_direct_line(y, i * LINE_PARAMS, &priors))
            .collect();
        let points = (0..self.point_count)
            .map(|i| {
                let offset = LINE_PARAMS * self.line_count + i * POINT_PARAMS;
                decode_point(y, offset, &priors)
            })
            .collect();

        DirectPredictions { lines, points }
    }
}

/// Decoded output of the anchor detector.
#[derive(Debug, Clone)]
pub struct AnchorPredictions<B: Backend> {
    /// `[batch, anchors * instances, 6 + box types]`, anchor major.
    pub boxes: Tensor<B, 3>,
    /// Raw box channels, `[batch, anchors, rows, cols, 6 + box types]`.
    pub box_offsets: Tensor<B, 5>,
    /// One `[batch, instances, 5 + box types]` tensor per line type.
    pub lines: Vec<Tensor<B, 3>>,
    /// Raw line channels, one `[batch, 5 + box types, rows, cols]` per type.
    pub line_offsets: Vec<Tensor<B, 4>>,
    /// One `[batch, instances, 3]` tensor per point type.
    pub points: Vec<Tensor<B, 3>>,
}

/// Channel layout of the anchor detector.
///
/// ```text
/// | anchor 0 | .. | anchor A-1 | line 0 | .. | line L-1 | point 0 | .. |
///   6 + T           6 + T       5 + T        5 + T       3
/// ```
///
/// where `T` is the number of box types (class logits).
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorLayout {
    pub anchors: Vec<Anchor>,
    pub box_types: usize,
    pub line_count: usize,
    pub point_count: usize,
    pub rotation: bool,
}

impl AnchorLayout {
    /// Channels of one anchor block: the 6 box parameters followed by one
    /// class logit per box type.
    ///
    pub fn box_block(&self) -> usize {
        BOX_PARAMS + self.box_types
    }

    /// Channels of one line block: the 5 line parameters followed by one
    /// class logit per box type.
    ///
    pub fn line_block(&self) -> usize {
        LINE_PARAMS + self.box_types
    }

    /// Total channels taken by the anchor blocks, which come first.
    ///
    pub fn anchor_channels(&self) -> usize {
        self.anchors.len() * self.box_block()
    }

    /// First channel of line type `line`. Line blocks follow the anchor blocks.
    ///
    pub fn line_offset(&self, line: usize) -> usize {
        self.anchor_channels() + line * self.line_block()
    }

    /// First channel of point type `point`. Point blocks follow every line
    /// block.
    ///
    pub fn point_offset(&self, point: usize) -> usize {
        self.line_offset(self.line_count) + point * POINT_PARAMS
    }

    /// Number of channels the prediction conv must produce for this layout.
    ///
    pub fn out_channels(&self) -> usize {
        self.point_offset(self.point_count)
    }

    /// Half height lines are scaled against; lines carry no anchor.
    pub fn mean_half_height(&self) -> f32 {
        if self.rotation {
            MEAN_HALF_HEIGHT_ROTATED
        } else {
            MEAN_HALF_HEIGHT_ALIGNED
        }
    }

    /// The undecoded anchor channels.
    pub fn raw_anchor_block<B: Backend>(&self, y: &Tensor<B, 4>) -> Tensor<B, 4> {
        y.clone().narrow(1, 0, self.anchor_channels())
    }

    fn decode_anchor<B: Backend>(
        &self,
        y: &Tensor<B, 4>,
        index: usize,
        priors: &PriorGrid<B>,
        scale: ScaleFactor,
    ) -> Tensor<B, 4> {
        let anchor = &self.anchors[index];
        let offset = index * self.box_block();
        let scale = scale.value();

        let rot_raw = channel(y, offset + 3);
        let rotation = if self.rotation {
            rot_raw.tanh().mul_scalar(FRAC_PI_2).add_scalar(anchor.rot)
        } else {
            rot_raw.zeros_like().add_scalar(anchor.rot)
        };

        let mut parts = vec![
            sigmoid(channel(y, offset)),
            channel(y, offset + 1).tanh().mul_scalar(scale) + priors.cols.clone(),
            channel(y, offset + 2).tanh().mul_scalar(scale) + priors.rows.clone(),
            rotation,
            channel(y, offset + 4).exp().mul_scalar(anchor.height),
            channel(y, offset + 5).exp().mul_scalar(anchor.width),
        ];
        if self.box_types > 0 {
            parts.push(y.clone().narrow(1, offset + BOX_PARAMS, self.box_types));
        }

        Tensor::cat(parts, 1)
    }

    /// Decodes every anchor block into one instance list per batch element,
    /// and returns the raw blocks alongside.
    pub fn decode_anchors<B: Backend>(
        &self,
        y: &Tensor<B, 4>,
        priors: &PriorGrid<B>,
        scale: ScaleFactor,
    ) -> (Tensor<B, 3>, Tensor<B, 5>) {
        let batch = y.dims()[0];
        let block = self.box_block();

        let mut boxes = Vec::with_capacity(self.anchors.len());
        let mut offsets = Vec::with_capacity(self.anchors.len());
        for index in 0..self.anchors.len() {
            boxes.push(self.decode_anchor(y, index, priors, scale));
            offsets.push(y.clone().narrow(1, index * block, block));
        }

        // [batch, anchors, channels, rows, cols] -> [batch, anchors, cols, rows, channels]
        let boxes = Tensor::stack::<5>(boxes, 1)
            .swap_dims(2, 4)
            .reshape([batch as i32, -1, block as i32]);
        let offsets = Tensor::stack::<5>(offsets, 1).permute([0, 1, 3, 4, 2]);

        (boxes, offsets)
    }

    /// Decodes the line blocks. Rotation spans the full `(-pi, pi)` range and
    /// scale is relative to the mean line height.
    pub fn decode_lines<B: Backend>(
        &self,
        y: &Tensor<B, 4>,
        priors: &PriorGrid<B>,
        scale: ScaleFactor,
    ) -> (Vec<Tensor<B, 3>>, Vec<Tensor<B, 4>>) {
        let mean_h = self.mean_half_height();
        let scale = scale.value();

        (0..self.line_count)
            .map(|line| {
                let offset = self.line_offset(line);
                let mut parts = vec![
                    sigmoid(channel(y, offset)),
                    channel(y, offset + 1).tanh().mul_scalar(scale) + priors.cols.clone(),
                    channel(y, offset + 2).tanh().mul_scalar(scale) + priors.rows.clone(),
                    channel(y, offset + 3).tanh().mul_scalar(PI),
                    channel(y, offset + 4).exp().mul_scalar(mean_h),
                ];
                if self.box_types > 0 {
                    parts.push(y.clone().narrow(1, offset + LINE_PARAMS, self.box_types));
                }

                let decoded = flatten_instances(Tensor::cat(parts, 1));
                let raw = y.clone().narrow(1, offset, self.line_block());
                (decoded, raw)
            })
            .unzip()
    }

    /// Decodes every point block into `[batch, instances, 3]`: sigmoid
    /// confidence, then x and y relative to the cell priors.
    ///
    pub fn decode_points<B: Backend>(
        &self,
        y: &Tensor<B, 4>,
        priors: &PriorGrid<B>,
    ) -> Vec<Tensor<B, 3>> {
        (0..self.point_count)
            .map(|point| decode_point(y, self.point_offset(point), priors))
            .collect()
    }

    /// Decodes boxes, lines and points from the raw prediction map `y`,
    /// keeping the undecoded box and line channels alongside.
    ///
    pub fn decode<B: Backend>(&self, y: &Tensor<B, 4>, scale: ScaleFactor) -> AnchorPredictions<B> {
        let priors = PriorGrid::for_map(y, scale);

        let (boxes, box_offsets) = self.decode_anchors(y, &priors, scale);
        let (lines, line_offsets) = self.decode_lines(y, &priors, scale);
        let points = self.decode_points(y, &priors);

        AnchorPredictions {
            boxes,
            box_offsets,
            lines,
            line_offsets,
            points,
        }
    }
}
