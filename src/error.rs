use thiserror::Error;

/// Errors raised while building a detector or running its forward pass.
///
/// Every variant is terminal: an architecture that fails to build cannot be
/// partially used, and a shape error aborts the forward pass.
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("unknown layer token '{0}'")]
    UnknownToken(String),

    #[error("layer config must start with the input channel count")]
    MissingInputChannels,

    #[error("residual block cannot map {in_ch} channels to {out_ch} (output must equal or double the input)")]
    ChannelRatio { in_ch: usize, out_ch: usize },

    #[error("group norm needs a channel count divisible by {groups}, got {channels}")]
    NormGroups { groups: usize, channels: usize },

    #[error("upsample-with-skip token found in the down-sampling config")]
    SkipInBackbone,

    #[error("no skip level left for up-sampling stage {0}")]
    MissingSkip(usize),

    #[error("cannot merge {upsampled:?} into skip connection {skip:?}")]
    ShapeMismatch { upsampled: [usize; 4], skip: [usize; 4] },

    #[error("anchor detector needs an anchors_file")]
    MissingAnchors,

    #[error("anchors file {0} holds no anchors")]
    EmptyAnchors(String),

    #[error("could not read anchors file {path}: {source}")]
    AnchorsIo {
        path: String,
        source: std::io::Error,
    },

    #[error("malformed anchors file {path}: {source}")]
    AnchorsFormat {
        path: String,
        source: serde_json::Error,
    },

    #[error("could not load model config {path}: {reason}")]
    Config { path: String, reason: String },

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error("could not read prediction values: {0}")]
    TensorData(String),
}

pub type DetectorResult<T> = Result<T, DetectorError>;
