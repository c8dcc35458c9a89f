//! Eval subcommand: counting metrics over an annotated image set.

use std::path::PathBuf;
use std::time::Instant;

use candle_core::Device;
use clap::Args;
use serde::Deserialize;

use crate::cmd_predict::load_model;
use crate::metrics::CountingMetrics;
use crate::model::CfNet;
use crate::preprocess;
use crate::Which;

/// Arguments for the eval subcommand
#[derive(Args, Debug)]
pub struct EvalArgs {
    /// Path to the annotation file: a JSON array of
    /// `{"image": "...", "points": [[x, y], ...]}` entries.
    #[arg(long)]
    pub annotations: PathBuf,

    /// Directory image paths are resolved against. Defaults to the
    /// annotation file's directory.
    #[arg(long)]
    pub images_dir: Option<PathBuf>,

    /// Output file for evaluation results.
    #[arg(long, short, default_value = "eval_results.json")]
    pub output: PathBuf,
}

/// One image's ground truth: a path and its annotated head positions in
/// input pixel coordinates.
#[derive(Debug, Deserialize)]
pub struct ImageAnnotation {
    pub image: String,
    pub points: Vec<(f32, f32)>,
}

fn load_annotations(path: &PathBuf) -> anyhow::Result<Vec<ImageAnnotation>> {
    let file = std::fs::File::open(path)
        .map_err(|e| anyhow::anyhow!("cannot open annotation file {:?}: {e}", path))?;
    let annotations: Vec<ImageAnnotation> = serde_json::from_reader(file)?;
    Ok(annotations)
}

/// Run the eval subcommand
pub fn run(
    args: &EvalArgs,
    which: Which,
    model_path: PathBuf,
    device: &Device,
) -> anyhow::Result<()> {
    println!("============================================================");
    println!("Crowd Counting Evaluation");
    println!("============================================================");
    println!("Model variant: {:?}", which);
    println!("Model path: {:?}", model_path);
    println!("Device: {:?}", device);
    println!("Annotations: {:?}", args.annotations);
    println!("============================================================");

    let annotations = load_annotations(&args.annotations)?;
    println!("\nLoaded annotations for {} images", annotations.len());

    let images_dir = match &args.images_dir {
        Some(dir) => dir.clone(),
        None => args
            .annotations
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".")),
    };

    let config = which.config();
    println!("\nLoading model from: {:?}", model_path);
    let start = Instant::now();
    let model = load_model(&model_path, &config, device)?;
    println!("Model loaded in {:?}", start.elapsed());

    println!("\nRunning inference on {} images...", annotations.len());
    let mut metrics = CountingMetrics::new();
    let start = Instant::now();
    let num_images = annotations.len();

    for (idx, entry) in annotations.iter().enumerate() {
        let image_path = images_dir.join(&entry.image);
        if !image_path.exists() {
            eprintln!("Warning: Image not found: {:?}, skipping", image_path);
            continue;
        }

        let image_path_str = image_path.to_string_lossy().to_string();
        let (preprocessed, _h, _w) =
            preprocess::preprocess_image(&image_path_str, config.total_stride(), device)?;
        let batch = preprocess::add_batch_dim(&preprocessed)?;
        let density = model.forward(&batch)?;
        let predicted = CfNet::counts(&density)?[0];

        // Counting compares spatial integrals, so the resize to a stride
        // multiple needs no coordinate remapping of the points.
        metrics.record(predicted, entry.points.len() as f32);

        if (idx + 1) % 50 == 0 || idx == num_images - 1 {
            let elapsed = start.elapsed().as_secs_f32();
            let imgs_per_sec = metrics.len() as f32 / elapsed;
            println!(
                "  [{}/{}] MAE so far: {:.2} ({:.1} img/s)",
                idx + 1,
                num_images,
                metrics.mae(),
                imgs_per_sec
            );
        }
    }

    println!("\n============================================================");
    println!("EVALUATION RESULTS");
    println!("============================================================");
    metrics.print_summary();

    let model_name = format!("{:?}", which).to_lowercase();
    let results = serde_json::json!({
        "model": model_name,
        "annotations": args.annotations.to_string_lossy(),
        "num_images": metrics.len(),
        "mae": metrics.mae(),
        "rmse": metrics.rmse(),
    });
    let file = std::fs::File::create(&args.output)?;
    serde_json::to_writer_pretty(file, &results)?;
    println!("\nEvaluation metrics saved to: {:?}", args.output);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotation_json_round_trips() {
        let json = r#"[
            {"image": "scene_001.jpg", "points": [[12.5, 40.0], [100.0, 3.25]]},
            {"image": "scene_002.jpg", "points": []}
        ]"#;
        let parsed: Vec<ImageAnnotation> = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].image, "scene_001.jpg");
        assert_eq!(parsed[0].points, vec![(12.5, 40.0), (100.0, 3.25)]);
        assert!(parsed[1].points.is_empty());
    }
}
