//! Layers the configuration compiler assembles stages from.

pub mod conv;
pub mod residual;
pub mod up_merge;

use burn::nn::conv::{Conv2d, ConvTranspose2d};
use burn::nn::pool::MaxPool2d;
use burn::nn::{Dropout, Relu};
use burn::{
    module::Module,
    tensor::{Tensor, backend::Backend},
};

use conv::{Dropout2d, Norm, WeightNormConv2d};
use residual::ResBlock;

/// A single primitive inside a sequential stage.
#[derive(Module, Debug)]
pub enum Layer<B: Backend> {
    Conv(Conv2d<B>),
    WeightNormConv(WeightNormConv2d<B>),
    ConvTranspose(ConvTranspose2d<B>),
    Norm(Norm<B>),
    Relu(Relu),
    Dropout(Dropout),
    Dropout2d(Dropout2d),
    MaxPool(MaxPool2d),
    Residual(ResBlock<B>),
}

impl<B: Backend> Layer<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Layer::Conv(conv) => conv.forward(x),
            Layer::WeightNormConv(conv) => conv.forward(x),
            Layer::ConvTranspose(conv) => conv.forward(x),
            Layer::Norm(norm) => norm.forward(x),
            Layer::Relu(relu) => relu.forward(x),
            Layer::Dropout(dropout) => dropout.forward(x),
            Layer::Dropout2d(dropout) => dropout.forward(x),
            Layer::MaxPool(pool) => pool.forward(x),
            Layer::Residual(block) => block.forward(x),
        }
    }

    /// Short name used by model summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Layer::Conv(_) => "conv",
            Layer::WeightNormConv(_) => "wn-conv",
            Layer::ConvTranspose(_) => "conv-t",
            Layer::Norm(_) => "norm",
            Layer::Relu(_) => "relu",
            Layer::Dropout(_) => "dropout",
            Layer::Dropout2d(_) => "dropout2d",
            Layer::MaxPool(_) => "maxpool",
            Layer::Residual(_) => "res",
        }
    }
}

/// An ordered run of layers applied one after the other. An empty run is the
/// identity.
#[derive(Module, Debug)]
pub struct Sequential<B: Backend> {
    pub layers: Vec<Layer<B>>,
}

impl<B: Backend> Sequential<B> {
    pub fn new(layers: Vec<Layer<B>>) -> Self {
        Self { layers }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.layers.iter().fold(x, |x, layer| layer.forward(x))
    }

    pub fn describe(&self) -> String {
        let kinds: Vec<&str> = self.layers.iter().map(Layer::kind).collect();
        format!("[{}]", kinds.join(", "))
    }
}
