use clap::{Parser, ValueEnum};
use libfuser::prelude::*;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Measure {
    Contrast,
    Saturation,
    Exposedness,
}

/// Fuses differently exposed photographs of one scene into a single image
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Input images, the first one is the alignment reference
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Where to write the fused image
    #[arg(short, long)]
    output: PathBuf,

    /// Number of pyramid levels
    #[arg(short, long, default_value_t = libfuser::DEFAULT_LEVELS)]
    levels: i32,

    /// Quality measures multiplied into the fusion weights
    #[arg(short, long, value_enum, value_delimiter = ',', default_value = "exposedness")]
    measures: Vec<Measure>,

    /// Skip alignment, for images shot from a tripod
    #[arg(long)]
    no_align: bool,

    /// Maximum number of ORB features per image
    #[arg(long, default_value_t = 4096)]
    max_features: i32,

    /// RANSAC reprojection threshold in pixels
    #[arg(long, default_value_t = 5.0)]
    ransac_threshold: f64,

    /// Detect features on images scaled down to this many pixels (smaller side)
    #[arg(long)]
    scale_down: Option<f32>,
}

impl Args {
    fn parameters(&self) -> FusionParameters {
        let measures = QualityMeasures {
            contrast: self.measures.contains(&Measure::Contrast),
            saturation: self.measures.contains(&Measure::Saturation),
            exposedness: self.measures.contains(&Measure::Exposedness),
        };
        let alignment = (!self.no_align).then(|| AlignmentParameters {
            max_features: self.max_features,
            ransac_reproj_threshold: self.ransac_threshold,
            scale_down: self.scale_down,
            ..Default::default()
        });
        FusionParameters {
            levels: self.levels,
            measures,
            alignment,
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let now = std::time::Instant::now();
    match exposure_fusion(&args.inputs, &args.output, args.parameters()) {
        Ok(()) => {
            log::info!("Fused {} images in {:?}", args.inputs.len(), now.elapsed());
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn measures_and_alignment_flags_map_to_parameters() {
        let args = Args::parse_from([
            "libfuser",
            "-o",
            "out.png",
            "--measures",
            "contrast,exposedness",
            "--no-align",
            "a.png",
            "b.png",
        ]);
        let params = args.parameters();
        assert_eq!(args.inputs.len(), 2);
        assert_eq!(params.levels, 9);
        assert!(params.measures.contrast && params.measures.exposedness);
        assert!(!params.measures.saturation);
        assert!(params.alignment.is_none());
    }

    #[test]
    fn defaults_align_with_exposedness_only() {
        let args = Args::parse_from(["libfuser", "--output", "out.png", "a.png"]);
        let params = args.parameters();
        assert_eq!(params.measures, QualityMeasures::default());
        let alignment = params.alignment.unwrap();
        assert_eq!(alignment.max_features, 4096);
        assert_eq!(alignment.ransac_reproj_threshold, 5.0);
    }
}
