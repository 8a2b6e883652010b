use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};

use sdfgen::kernel::kernel_fragment_stage;
use sdfgen::pipeline::{CanvasSize, Config};
use sdfgen::{GpuContext, Pipeline};

#[derive(Debug, Default, Clone)]
struct Cli {
    input: Option<PathBuf>,
    output: Option<PathBuf>,
    spread: Option<u32>,
    float_textures: Option<bool>,
    config: Option<PathBuf>,
}

const USAGE: &str =
    "usage: sdfgen --input <image> --output <png> [--spread N] [--float-textures] [--config cfg.json]";

fn parse_cli(args: &[String]) -> Result<Cli> {
    let mut cli = Cli::default();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--input" => {
                let Some(v) = args.get(i + 1) else {
                    return Err(anyhow!("missing value for --input"));
                };
                cli.input = Some(PathBuf::from(v));
                i += 2;
            }
            "--output" => {
                let Some(v) = args.get(i + 1) else {
                    return Err(anyhow!("missing value for --output"));
                };
                cli.output = Some(PathBuf::from(v));
                i += 2;
            }
            "--spread" => {
                let Some(v) = args.get(i + 1) else {
                    return Err(anyhow!("missing value for --spread"));
                };
                let n: u32 = v
                    .parse()
                    .map_err(|_| anyhow!("--spread expects a positive integer, got {v}"))?;
                if n == 0 {
                    return Err(anyhow!("--spread expects a positive integer, got 0"));
                }
                cli.spread = Some(n);
                i += 2;
            }
            "--float-textures" => {
                cli.float_textures = Some(true);
                i += 1;
            }
            "--config" => {
                let Some(v) = args.get(i + 1) else {
                    return Err(anyhow!("missing value for --config"));
                };
                cli.config = Some(PathBuf::from(v));
                i += 2;
            }
            other => {
                return Err(anyhow!("unknown argument: {other}\n{USAGE}"));
            }
        }
    }
    Ok(cli)
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("invalid config json in {}", path.display()))?
        }
        None => Config::default(),
    };

    // CLI flags win over the config file.
    if let Some(input) = &cli.input {
        config.input_image = Some(input.clone());
    }
    if let Some(spread) = cli.spread {
        config.spread = Some(serde_json::Value::from(spread));
    }
    if let Some(float_textures) = cli.float_textures {
        config.float_textures = float_textures;
    }
    Ok(config)
}

fn run(cli: Cli) -> Result<()> {
    let output = cli
        .output
        .clone()
        .ok_or_else(|| anyhow!("--output is required\n{USAGE}"))?;
    let mut config = load_config(&cli)?;

    let input = config.input_image.clone().ok_or_else(|| {
        anyhow!("an input image is required (--input or config input_image)\n{USAGE}")
    })?;

    // The canvas takes the input image's size so each texel maps to one
    // output pixel.
    let (width, height) = image::image_dimensions(&input)
        .with_context(|| format!("failed to read image header of {}", input.display()))?;
    config.canvas = CanvasSize { width, height };
    config.fragment_shader = Some(kernel_fragment_stage(config.spread()));

    let gpu = GpuContext::new()?;
    // Pipeline::new requests the input image decode itself.
    let mut pipeline = Pipeline::new(gpu, &config)?;
    pipeline.wait_until_loaded()?;

    let (canvas_w, canvas_h) = pipeline.canvas_size();
    pipeline.set_rectangle(0.0, 0.0, canvas_w as f32, canvas_h as f32);
    pipeline.draw()?;

    let readback = pipeline.readback()?;
    image::save_buffer(
        &output,
        &readback.pixels.to_rgba8(),
        readback.width,
        readback.height,
        image::ColorType::Rgba8,
    )
    .with_context(|| format!("failed to write {}", output.display()))?;
    println!("saved: {}", output.display());
    Ok(())
}

fn main() -> Result<()> {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_cli(&argv)?;
    run(cli)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cli_full_invocation() {
        let args: Vec<String> = [
            "--input",
            "glyph.png",
            "--output",
            "field.png",
            "--spread",
            "60",
            "--float-textures",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let cli = parse_cli(&args).unwrap();
        assert_eq!(cli.input.as_ref().unwrap(), &PathBuf::from("glyph.png"));
        assert_eq!(cli.output.as_ref().unwrap(), &PathBuf::from("field.png"));
        assert_eq!(cli.spread, Some(60));
        assert_eq!(cli.float_textures, Some(true));
    }

    #[test]
    fn parse_cli_rejects_bad_spread() {
        let args: Vec<String> = ["--spread", "0"].iter().map(|s| s.to_string()).collect();
        assert!(parse_cli(&args).is_err());
        let args: Vec<String> = ["--spread", "many"].iter().map(|s| s.to_string()).collect();
        assert!(parse_cli(&args).is_err());
    }

    #[test]
    fn cli_flags_override_config_values() {
        let cli = Cli {
            input: Some(PathBuf::from("a.png")),
            spread: Some(3),
            ..Default::default()
        };
        let config = load_config(&cli).unwrap();
        assert_eq!(
            config.input_image.as_ref().unwrap(),
            &PathBuf::from("a.png")
        );
        assert_eq!(config.spread(), 3);
    }
}
