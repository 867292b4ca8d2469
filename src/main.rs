use anyhow::Context;
use log::info;
use std::env;
use std::path::Path;
use std::sync::Arc;
use voice_detector::{DetectionService, DetectorConfig};

const DEFAULT_CONFIG: &str = "detector.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        println!("Usage:");
        println!("  {} detect <audio_file> [language]", args[0]);
        println!("  {} bootstrap", args[0]);
        println!("  {} importance", args[0]);
        return Ok(());
    }

    let config_path = env::var("VOICE_DETECTOR_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG.to_string());
    let config = DetectorConfig::load_from_file(&config_path);
    let service = Arc::new(DetectionService::from_config(&config)?);

    match args[1].as_str() {
        "detect" => {
            let Some(audio_file) = args.get(2) else {
                println!("Please provide an audio file path");
                return Ok(());
            };
            let language = args.get(3).map(|s| s.as_str()).unwrap_or("english");
            detect_file(&service, &config, audio_file, language).await?;
        }
        "bootstrap" => {
            let model = service.registry().ensure_ready()?;
            println!(
                "Model ready: {} ({} training samples, trained {})",
                model.provenance().as_str(),
                model.training_samples(),
                model.trained_at().to_rfc3339()
            );
        }
        "importance" => {
            let model = service.registry().ensure_ready()?;
            println!("Feature importance ({}):", model.provenance().as_str());
            for (name, importance) in model.feature_importance() {
                println!("  {:<22} {:.4}", name, importance);
            }
        }
        _ => {
            println!("Invalid command. Use 'detect', 'bootstrap' or 'importance'");
        }
    }

    Ok(())
}

async fn detect_file(
    service: &Arc<DetectionService>,
    config: &DetectorConfig,
    audio_file: &str,
    language: &str,
) -> anyhow::Result<()> {
    info!("Processing audio file: {}", audio_file);

    let format = Path::new(audio_file)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("wav")
        .to_string();
    let bytes = tokio::fs::read(audio_file)
        .await
        .with_context(|| format!("failed to read {}", audio_file))?;

    let result = service
        .detect_with_timeout(bytes, format, language.to_string(), config.detect_timeout())
        .await?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
