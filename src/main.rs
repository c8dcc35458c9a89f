//! Crowd counting CLI: density prediction and dataset evaluation.

use clap::{Parser, Subcommand};

use candle_cfnet::{cmd_eval, cmd_predict, device, Which};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Path to model weights, in safetensors format.
    #[arg(long)]
    model: Option<String>,

    /// Which model variant to use.
    #[arg(long, value_enum, default_value_t = Which::Tiny)]
    which: Which,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Predict a density map and head count for a single image.
    Predict(cmd_predict::PredictArgs),
    /// Evaluate counting MAE/RMSE over an annotated image set.
    Eval(cmd_eval::EvalArgs),
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let device = device(args.cpu)?;
    println!("Using device: {:?}", device);

    let model_path = match &args.model {
        Some(model) => std::path::PathBuf::from(model),
        None => std::path::PathBuf::from(args.which.default_weights()),
    };
    if !model_path.exists() {
        anyhow::bail!(
            "Model weights not found at {:?}. Please provide a valid model path with --model.",
            model_path
        );
    }

    match &args.command {
        Command::Predict(predict_args) => {
            cmd_predict::run(predict_args, args.which, model_path, &device)
        }
        Command::Eval(eval_args) => cmd_eval::run(eval_args, args.which, model_path, &device),
    }
}
