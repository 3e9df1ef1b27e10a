use imagine_pipeline::{logger, GenerationRequest, ImagePipeline, PipelineConfig};
use std::env;
use std::fs;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dotenv_loaded = dotenv::dotenv().is_ok();

    logger::init_with_config(logger::LoggerConfig::development())?;
    if dotenv_loaded {
        log::info!(".env file loaded");
    } else {
        log::warn!("No .env file found, using system environment variables");
    }

    let prompt = env::args().skip(1).collect::<Vec<_>>().join(" ");
    if prompt.trim().is_empty() {
        eprintln!("usage: imagine <prompt words...>");
        std::process::exit(2);
    }

    let config = PipelineConfig::from_env();
    logger::log_pipeline_config(&config);

    let pipeline = ImagePipeline::new(config)?;
    let _sweeper = pipeline.start_maintenance();

    let mut request = GenerationRequest::new(prompt);
    if let Ok(negative) = env::var("IMAGEGEN_NEGATIVE_PROMPT") {
        request = request.with_negative_prompt(negative);
    }
    if let Some(seed) = env::var("IMAGEGEN_SEED").ok().and_then(|s| s.parse().ok()) {
        request = request.with_seed(seed);
    }

    let artifact = match pipeline.generate(request, "cli").await {
        Ok(artifact) => artifact,
        Err(e) => {
            log::error!("[{}] {}", e.kind(), e);
            std::process::exit(1);
        }
    };

    let output = env::var("IMAGEGEN_OUTPUT")
        .unwrap_or_else(|_| format!("output.{}", artifact.extension()));
    let bytes = pipeline
        .artifacts()
        .resolve(&artifact.handle)
        .ok_or("generated image was released before it could be saved")?;
    fs::write(&output, bytes.as_ref())?;
    pipeline.artifacts().release(&artifact);

    log::info!(
        "Saved {} ({} bytes, model {}, seed {:?}) to {}",
        artifact.handle,
        artifact.size_bytes,
        artifact.model,
        artifact.seed,
        output
    );
    Ok(())
}
