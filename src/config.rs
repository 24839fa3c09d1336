use burn::config::Config;
use serde::{Deserialize, Serialize};
use std::fmt;
use {argh::FromArgs, std::fmt::Debug};

use crate::error::{DetectorError, DetectorResult};
use crate::layers::LayerToken;

/// Mean half-height of text lines used to decode line scale when the model
/// predicts rotation.
pub const MEAN_HALF_HEIGHT_ROTATED: f32 = 48.004_636 / 2.0;

/// Mean half-height of text lines used to decode line scale for axis aligned
/// models.
pub const MEAN_HALF_HEIGHT_ALIGNED: f32 = 62.124_237 / 2.0;

/// Dropout probability used by every dropout layer the compiler inserts.
pub const DROPOUT_PROB: f64 = 0.1;

/// Group count used by group normalization.
pub const NORM_GROUPS: usize = 8;

/// Normalization inserted after each convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormKind {
    BatchNorm,
    InstanceNorm,
    GroupNorm,
    /// Reparameterizes the convolution weight instead of adding a layer.
    WeightNorm,
    #[default]
    None,
}

/// Dropout flavour inserted after activations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropoutKind {
    /// Element-wise dropout.
    #[serde(rename = "normal")]
    Normal,
    /// Drops whole feature maps.
    #[serde(rename = "2d")]
    Channel,
}

/// Architecture of a detector, loaded from the same JSON keys the training
/// harness writes.
///
/// Either variant reads the fields it needs: the direct detector ignores
/// `number_of_box_types`, `rotation` and `anchors_file`. Every key is optional
/// in the JSON file; a missing key takes its [`Default`] value.
///
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub number_of_line_types: usize,
    pub number_of_point_types: usize,
    pub number_of_pixel_types: usize,
    pub number_of_box_types: usize,
    pub norm_type: NormKind,
    pub down_layers_cfg: Option<Vec<LayerToken>>,
    pub up_layers_cfg: Option<Vec<LayerToken>>,
    pub rotation: bool,
    pub anchors_file: Option<String>,
    pub dilation: usize,
    pub color: bool,
    pub dropout: Option<DropoutKind>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            number_of_line_types: 0,
            number_of_point_types: 0,
            number_of_pixel_types: 0,
            number_of_box_types: 0,
            norm_type: NormKind::None,
            down_layers_cfg: None,
            up_layers_cfg: None,
            rotation: true,
            anchors_file: None,
            dilation: 1,
            color: true,
            dropout: None,
        }
    }
}

impl Config for DetectorConfig {}

impl fmt::Display for DetectorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string_pretty(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

// `with_<field>` setters for chaining from `DetectorConfig::new()`.
macro_rules! with_fields {
    ($($setter:ident => $field:ident: $ty:ty),* $(,)?) => {
        impl DetectorConfig {
            $(
                #[doc = concat!("Sets `", stringify!($field), "`.")]
                pub fn $setter(mut self, $field: $ty) -> Self {
                    self.$field = $field;
                    self
                }
            )*
        }
    };
}

with_fields! {
    with_number_of_line_types => number_of_line_types: usize,
    with_number_of_point_types => number_of_point_types: usize,
    with_number_of_pixel_types => number_of_pixel_types: usize,
    with_number_of_box_types => number_of_box_types: usize,
    with_norm_type => norm_type: NormKind,
    with_down_layers_cfg => down_layers_cfg: Option<Vec<LayerToken>>,
    with_up_layers_cfg => up_layers_cfg: Option<Vec<LayerToken>>,
    with_rotation => rotation: bool,
    with_anchors_file => anchors_file: Option<String>,
    with_dilation => dilation: usize,
    with_color => color: bool,
    with_dropout => dropout: Option<DropoutKind>,
}

impl DetectorConfig {
    /// A config with every key at its default: no prediction types, no
    /// normalization, rotation on, dilation 1, color input and the default
    /// layer configs.
    ///
    pub fn new() -> Self {
        Self::default()
    }

    /// Input channel count implied by `color`.
    pub fn input_channels(&self) -> usize {
        if self.color { 3 } else { 1 }
    }

    /// The configured down-sampling tokens, or the VGG style default.
    pub fn down_layers(&self) -> Vec<LayerToken> {
        self.down_layers_cfg
            .clone()
            .unwrap_or_else(|| default_down_layers(self.input_channels()))
    }

    /// The configured up-sampling tokens, or the U-Net style default.
    pub fn up_layers(&self) -> Vec<LayerToken> {
        self.up_layers_cfg.clone().unwrap_or_else(default_up_layers)
    }
}

/// Loads a [`DetectorConfig`] from a JSON file.
pub fn load_config(path: &str) -> DetectorResult<DetectorConfig> {
    let config = DetectorConfig::load(path).map_err(|err| DetectorError::Config {
        path: path.to_string(),
        reason: err.to_string(),
    })?;
    log::info!("loaded model config from {path}");
    Ok(config)
}

/// `[in, 64, M, 128, M, 256, 256, M, 512, 512, M, 512, 512]`
pub fn default_down_layers(in_ch: usize) -> Vec<LayerToken> {
    use LayerToken::{Conv, MaxPool};
    vec![
        Conv(in_ch),
        Conv(64),
        MaxPool,
        Conv(128),
        MaxPool,
        Conv(256),
        Conv(256),
        MaxPool,
        Conv(512),
        Conv(512),
        MaxPool,
        Conv(512),
        Conv(512),
    ]
}

/// `[512, U+512, 256, U+256, 128, U+128, 64, U+64]`
pub fn default_up_layers() -> Vec<LayerToken> {
    use LayerToken::{Conv, UpMerge};
    vec![
        Conv(512),
        UpMerge { skip_channels: 512 },
        Conv(256),
        UpMerge { skip_channels: 256 },
        Conv(128),
        UpMerge { skip_channels: 128 },
        Conv(64),
        UpMerge { skip_channels: 64 },
    ]
}

#[derive(FromArgs, PartialEq, Debug)]
/// Build line, point and box detectors from layer configs.
pub struct GeoDetCmd {
    #[argh(subcommand)]
    pub commands: Commands,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
pub enum Commands {
    Summary(SubCommandSummary),
    Decode(SubCommandDecode),
}

#[derive(FromArgs, PartialEq, Debug)]
/// Print the compiled stages, channel layout and parameter count of a model
#[argh(subcommand, name = "summary")]
pub struct SubCommandSummary {
    #[argh(option)]
    /// model config file (JSON)
    pub c: String,
    #[argh(switch)]
    /// build the anchor (YOLO style) detector instead of the direct one
    pub yolo: bool,
}

#[derive(FromArgs, PartialEq, Debug)]
/// Run a forward pass on an image and draw the decoded predictions
#[argh(subcommand, name = "decode")]
pub struct SubCommandDecode {
    #[argh(option)]
    /// model config file (JSON)
    pub c: String,
    #[argh(option)]
    /// image path to run the forward pass on
    pub p: String,
    #[argh(option)]
    /// confidence a prediction needs to be drawn, default 0.5
    pub t: Option<f32>,
    #[argh(option)]
    /// output image path, default ./geodet_output.png
    pub o: Option<String>,
    #[argh(switch)]
    /// build the anchor (YOLO style) detector instead of the direct one
    pub yolo: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_color() {
        let config = DetectorConfig::new();
        assert_eq!(config.down_layers()[0], LayerToken::Conv(3));
        assert_eq!(config.clone().with_color(false).down_layers()[0], LayerToken::Conv(1));
        assert_eq!(config.up_layers()[1], LayerToken::UpMerge { skip_channels: 512 });
        assert!(config.rotation);
        assert_eq!(config.dilation, 1);
        assert_eq!(config.norm_type, NormKind::None);
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "number_of_line_types": 2,
            "number_of_point_types": 1,
            "number_of_box_types": 3,
            "norm_type": "group_norm",
            "down_layers_cfg": [3, 32, "M", "R64", "D128"],
            "rotation": false,
            "anchors_file": "anchors.json",
            "dropout": "2d"
        }"#;
        let config: DetectorConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.number_of_line_types, 2);
        assert_eq!(config.number_of_pixel_types, 0);
        assert_eq!(config.norm_type, NormKind::GroupNorm);
        assert_eq!(config.dropout, Some(DropoutKind::Channel));
        assert_eq!(config.down_layers()[4], LayerToken::DownResidual(128));
        assert_eq!(config.up_layers(), default_up_layers());
        assert!(!config.rotation);
        assert!(config.color);
        assert_eq!(config.dilation, 1);
    }

    #[test]
    fn test_load_config_fills_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("yolo.json");
        std::fs::write(
            &path,
            r#"{"number_of_line_types": 1, "number_of_box_types": 2, "anchors_file": "a.json"}"#,
        )
        .unwrap();

        let config = load_config(path.to_str().unwrap()).unwrap();

        assert_eq!(config.number_of_line_types, 1);
        assert_eq!(config.number_of_box_types, 2);
        assert_eq!(config.anchors_file.as_deref(), Some("a.json"));
        assert!(config.rotation);
        assert_eq!(config.dilation, 1);
        assert!(config.color);
        assert_eq!(config.norm_type, NormKind::None);
        assert_eq!(config.number_of_point_types, 0);

        let empty: DetectorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, DetectorConfig::new());
    }

    #[test]
    fn test_load_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        let path = path.to_str().unwrap();

        DetectorConfig::new()
            .with_number_of_point_types(4)
            .with_dropout(Some(DropoutKind::Normal))
            .save(path)
            .unwrap();
        let config = load_config(path).unwrap();

        assert_eq!(config.number_of_point_types, 4);
        assert_eq!(config.dropout, Some(DropoutKind::Normal));
        assert!(matches!(
            load_config("/nonexistent/model.json"),
            Err(DetectorError::Config { .. })
        ));
    }

    #[test]
    fn test_unknown_token_fails_config_load() {
        let json = r#"{ "down_layers_cfg": [3, 32, "Z7"] }"#;
        assert!(serde_json::from_str::<DetectorConfig>(json).is_err());
    }
}
