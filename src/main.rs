//! Amnesia Render CLI
//!
//! Renders every page of a document to PNG files through the render engine
//! and writes the collected metrics next to them.
//!
//! ```text
//! amnesia-render <document.pdf> [output-dir] [zoom]
//! ```

use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use amnesia_render::metrics::ExportFormat;
use amnesia_render::native::{DocumentHandle, MupdfRasterizer};
use amnesia_render::render::{PageRenderRequest, RenderContext};
use amnesia_render::{EngineConfig, RenderEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "amnesia_render=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = EngineConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        EngineConfig::default()
    });

    let mut args = std::env::args().skip(1);
    let Some(input) = args.next().map(PathBuf::from) else {
        bail!("usage: amnesia-render <document> [output-dir] [zoom]");
    };
    let output_dir = args.next().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("pages"));
    let zoom: f64 = match args.next() {
        Some(value) => value.parse().with_context(|| format!("invalid zoom '{}'", value))?,
        None => 1.0,
    };

    tracing::info!("Starting Amnesia Render v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Document: {}", input.display());
    tracing::info!("Output: {}", output_dir.display());

    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;

    let engine = RenderEngine::builder(config)
        .start(|| Ok(MupdfRasterizer::new()))
        .context("failed to start render engine")?;

    let document = DocumentHandle::from_path(&input);
    let page_count = engine.page_count(document.clone()).await?;
    tracing::info!(page_count, "Rendering document");

    let started = Instant::now();
    for page_number in 1..=page_count as u32 {
        let request = PageRenderRequest::new(document.clone(), page_number, zoom)
            .with_context(RenderContext::Batch);
        let page = engine.submit(request).await?;

        let path = output_dir.join(format!("page-{:04}.png", page_number));
        let mut file = File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;
        io::copy(&mut page.open_stream()?, &mut file)?;

        let elapsed = started.elapsed().as_secs_f64().max(f64::EPSILON);
        engine.record_frame(f64::from(page_number) / elapsed, 0.0);

        tracing::info!(
            page = page_number,
            width = page.width,
            height = page.height,
            render_ms = page.render_time.as_millis() as u64,
            "Wrote {}",
            path.display()
        );
    }

    let metrics_path = output_dir.join("metrics.json");
    let samples = engine.export_metrics(&metrics_path, ExportFormat::Json)?;
    let stats = engine.stats().await?;
    tracing::info!(
        samples,
        cache_hits = stats.render.cache.hits,
        oom_retries = stats.render.oom_retries,
        "Done in {:.2}s",
        started.elapsed().as_secs_f64()
    );

    engine.shutdown().await?;
    Ok(())
}
