use burn::backend::{NdArray, ndarray::NdArrayDevice};
use rust_geodet::{
    config::{Commands, GeoDetCmd, load_config},
    error::DetectorResult,
    inference,
    models::{detector::Detector, yolo::YoloDetector},
};

type Backend = NdArray<f32>;

fn run(cli_cmd: GeoDetCmd, device: &NdArrayDevice) -> DetectorResult<()> {
    match cli_cmd.commands {
        Commands::Summary(sub_command_summary) => {
            let config = load_config(&sub_command_summary.c)?;
            let summary = if sub_command_summary.yolo {
                YoloDetector::<Backend>::new(&config, device)?.summary()
            } else {
                Detector::<Backend>::new(&config, device)?.summary()
            };
            println!("{summary}");
        }
        Commands::Decode(sub_command_decode) => {
            let config = load_config(&sub_command_decode.c)?;
            let threshold = sub_command_decode.t.unwrap_or(0.5);
            let output = sub_command_decode
                .o
                .unwrap_or_else(|| "./geodet_output.png".to_string());

            let drawn = inference::infer::<Backend>(
                &config,
                sub_command_decode.yolo,
                &sub_command_decode.p,
                &output,
                threshold,
                device,
            )?;
            println!("{drawn} predictions above {threshold} written to {output}");
        }
    };
    Ok(())
}

fn main() {
    env_logger::init();
    let device = NdArrayDevice::default();

    let cli_cmd: GeoDetCmd = argh::from_env();
    if let Err(err) = run(cli_cmd, &device) {
        log::error!("{err}");
        std::process::exit(1);
    }
}
