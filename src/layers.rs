use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DetectorError;

/// One instruction of the layer configuration language.
///
/// A layer config is a JSON array whose first element is the input channel
/// count, followed by tokens. Integers are plain 3x3 convolutions; strings are
/// either the pool marker `"M"` or a letter tag followed by its numeric
/// arguments:
///
/// | token     | meaning                                                    |
/// |-----------|------------------------------------------------------------|
/// | `64`      | 3x3 conv to 64 channels, norm, ReLU                        |
/// | `M`       | 2x2 max-pool, starts a new stage                           |
/// | `U+256`   | upsample and merge a 256 channel skip, starts a new stage  |
/// | `R128`    | residual block to 128 channels                             |
/// | `D128`    | residual block to 128 channels, downsampled 2x             |
/// | `U64`     | 2x transpose conv to 64 channels                           |
/// | `W64`     | dilated 3x3 conv (outer dilation) to 64 channels           |
/// | `k5-64`   | 5x5 conv to 64 channels                                    |
/// | `d2-64`   | 3x3 conv with dilation 2 to 64 channels                    |
/// | `B2-64`   | residual block with dilation 2 to 64 channels              |
/// | `C64`     | bare 5x5 conv to 64 channels                               |
/// | `ReLU`    | bare ReLU                                                  |
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawToken", into = "RawToken")]
pub enum LayerToken {
    /// Plain 3x3 convolution, normalization and ReLU.
    Conv(usize),
    /// 2x2 stride 2 max-pool.
    MaxPool,
    /// Bilinear upsample merged with a skip connection of the given width.
    UpMerge { skip_channels: usize },
    /// Residual block.
    Residual(usize),
    /// Residual block that halves spatial resolution first.
    DownResidual(usize),
    /// Learned 2x transpose convolution.
    TransposeUp(usize),
    /// Conv group using the outer dilation.
    Dilated(usize),
    /// Conv group with a custom kernel size.
    Kernel { kernel: usize, out: usize },
    /// Conv group with a custom dilation.
    Dilation { dilation: usize, out: usize },
    /// Residual block with a custom dilation.
    DilatedResidual { dilation: usize, out: usize },
    /// Bare 5x5 convolution without normalization or activation.
    WideConv(usize),
    /// Bare ReLU activation.
    Relu,
}

impl LayerToken {
    /// Returns the channel count after this token given the running count.
    pub fn out_channels(&self, in_ch: usize) -> usize {
        match self {
            LayerToken::MaxPool | LayerToken::Relu => in_ch,
            LayerToken::UpMerge { skip_channels } => in_ch + skip_channels,
            LayerToken::Conv(out)
            | LayerToken::Residual(out)
            | LayerToken::DownResidual(out)
            | LayerToken::TransposeUp(out)
            | LayerToken::Dilated(out)
            | LayerToken::WideConv(out)
            | LayerToken::Kernel { out, .. }
            | LayerToken::Dilation { out, .. }
            | LayerToken::DilatedResidual { out, .. } => *out,
        }
    }

    /// Returns the power-of-two change in spatial stride this token causes.
    pub fn stride_shift(&self) -> i32 {
        match self {
            LayerToken::MaxPool | LayerToken::DownResidual(_) => 1,
            LayerToken::TransposeUp(_) | LayerToken::UpMerge { .. } => -1,
            _ => 0,
        }
    }
}

// "k5-64" -> (5, 64)
fn split_pair(token: &str, body: &str) -> Result<(usize, usize), DetectorError> {
    let unknown = || DetectorError::UnknownToken(token.to_string());
    let (first, second) = body.split_once('-').ok_or_else(unknown)?;
    Ok((
        first.parse().map_err(|_| unknown())?,
        second.parse().map_err(|_| unknown())?,
    ))
}

impl FromStr for LayerToken {
    type Err = DetectorError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let unknown = || DetectorError::UnknownToken(token.to_string());

        if let Ok(out) = token.parse::<usize>() {
            return Ok(LayerToken::Conv(out));
        }

        match token {
            "M" => return Ok(LayerToken::MaxPool),
            "ReLU" => return Ok(LayerToken::Relu),
            _ => {}
        }

        if let Some(rest) = token.strip_prefix("U+") {
            let skip_channels = rest.parse().map_err(|_| unknown())?;
            return Ok(LayerToken::UpMerge { skip_channels });
        }

        let mut chars = token.chars();
        let tag = chars.next().ok_or_else(unknown)?;
        let body = chars.as_str();
        let count = || body.parse::<usize>().map_err(|_| unknown());

        match tag {
            'R' => Ok(LayerToken::Residual(count()?)),
            'D' => Ok(LayerToken::DownResidual(count()?)),
            'U' => Ok(LayerToken::TransposeUp(count()?)),
            'W' => Ok(LayerToken::Dilated(count()?)),
            'C' => Ok(LayerToken::WideConv(count()?)),
            'k' => {
                let (kernel, out) = split_pair(token, body)?;
                Ok(LayerToken::Kernel { kernel, out })
            }
            'd' => {
                let (dilation, out) = split_pair(token, body)?;
                Ok(LayerToken::Dilation { dilation, out })
            }
            'B' => {
                let (dilation, out) = split_pair(token, body)?;
                Ok(LayerToken::DilatedResidual { dilation, out })
            }
            _ => Err(unknown()),
        }
    }
}

impl fmt::Display for LayerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerToken::Conv(out) => write!(f, "{out}"),
            LayerToken::MaxPool => write!(f, "M"),
            LayerToken::UpMerge { skip_channels } => write!(f, "U+{skip_channels}"),
            LayerToken::Residual(out) => write!(f, "R{out}"),
            LayerToken::DownResidual(out) => write!(f, "D{out}"),
            LayerToken::TransposeUp(out) => write!(f, "U{out}"),
            LayerToken::Dilated(out) => write!(f, "W{out}"),
            LayerToken::Kernel { kernel, out } => write!(f, "k{kernel}-{out}"),
            LayerToken::Dilation { dilation, out } => write!(f, "d{dilation}-{out}"),
            LayerToken::DilatedResidual { dilation, out } => write!(f, "B{dilation}-{out}"),
            LayerToken::WideConv(out) => write!(f, "C{out}"),
            LayerToken::Relu => write!(f, "ReLU"),
        }
    }
}

/// JSON form of a token: a bare integer or a string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawToken {
    Int(usize),
    Str(String),
}

impl TryFrom<RawToken> for LayerToken {
    type Error = DetectorError;

    fn try_from(raw: RawToken) -> Result<Self, Self::Error> {
        match raw {
            RawToken::Int(out) => Ok(LayerToken::Conv(out)),
            RawToken::Str(token) => token.parse(),
        }
    }
}

impl From<LayerToken> for RawToken {
    fn from(token: LayerToken) -> Self {
        match token {
            LayerToken::Conv(out) => RawToken::Int(out),
            other => RawToken::Str(other.to_string()),
        }
    }
}

/// Parses a whitespace or comma separated token list, e.g. `"3 64 M 128 R256"`.
pub fn parse_tokens(cfg: &str) -> Result<Vec<LayerToken>, DetectorError> {
    cfg.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .map(str::parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_every_token_form() {
        let tokens = parse_tokens("3 64 M U+256 R128 D128 U64 W32 k5-16 d2-8 B4-8 C8 ReLU").unwrap();
        assert_eq!(
            tokens,
            vec![
                LayerToken::Conv(3),
                LayerToken::Conv(64),
                LayerToken::MaxPool,
                LayerToken::UpMerge { skip_channels: 256 },
                LayerToken::Residual(128),
                LayerToken::DownResidual(128),
                LayerToken::TransposeUp(64),
                LayerToken::Dilated(32),
                LayerToken::Kernel { kernel: 5, out: 16 },
                LayerToken::Dilation { dilation: 2, out: 8 },
                LayerToken::DilatedResidual { dilation: 4, out: 8 },
                LayerToken::WideConv(8),
                LayerToken::Relu,
            ]
        );
    }

    #[test]
    fn test_unknown_tokens_are_rejected() {
        for bad in ["X12", "R", "Rx", "k5", "k5-", "U+", "m", "d-3"] {
            assert!(
                matches!(bad.parse::<LayerToken>(), Err(DetectorError::UnknownToken(_))),
                "{bad} should not parse"
            );
        }
    }

    #[test]
    fn test_json_tokens() {
        let tokens: Vec<LayerToken> =
            serde_json::from_str(r#"[3, 64, "M", "R128", "k3-32"]"#).unwrap();
        assert_eq!(tokens[0], LayerToken::Conv(3));
        assert_eq!(tokens[2], LayerToken::MaxPool);
        assert_eq!(tokens[4], LayerToken::Kernel { kernel: 3, out: 32 });

        let json = serde_json::to_string(&tokens).unwrap();
        assert_eq!(json, r#"[3,64,"M","R128","k3-32"]"#);

        assert!(serde_json::from_str::<Vec<LayerToken>>(r#"[3, "Q9"]"#).is_err());
    }

    #[test]
    fn test_channel_and_stride_effects() {
        assert_eq!(LayerToken::UpMerge { skip_channels: 16 }.out_channels(32), 48);
        assert_eq!(LayerToken::MaxPool.out_channels(32), 32);
        assert_eq!(LayerToken::Residual(64).out_channels(32), 64);
        assert_eq!(LayerToken::MaxPool.stride_shift(), 1);
        assert_eq!(LayerToken::DownResidual(8).stride_shift(), 1);
        assert_eq!(LayerToken::TransposeUp(8).stride_shift(), -1);
        assert_eq!(LayerToken::Conv(8).stride_shift(), 0);
    }
}
