use anyhow::{Context, Result};
use mlops_core::{init_tracing, load_settings};
use model_registry::ModelRegistry;
use tracing::info;
use training_pipeline::{run_pipeline, PipelineConfig, VariantSpec};

fn main() -> Result<()> {
    init_tracing("training-pipeline")?;
    let cfg = load_settings::<PipelineConfig>("training-pipeline")?.settings;
    info!(?cfg, "config loaded");

    let registry = ModelRegistry::open(&cfg.registry_path)
        .with_context(|| format!("opening registry at {}", cfg.registry_path.display()))?;
    let report = run_pipeline(&registry, &cfg, &VariantSpec::defaults())?;

    for v in &report.variants {
        println!(
            "{:<20} v{:<3} accuracy={:.4} precision={:.4} recall={:.4} f1={:.4}",
            v.variant.name(),
            v.version,
            v.evaluation.accuracy,
            v.evaluation.precision,
            v.evaluation.recall,
            v.evaluation.f1
        );
    }
    match report.promoted {
        Some(version) => println!("promoted {} v{} to Production", report.model_name, version),
        None => println!("best {} v{} left unpromoted", report.model_name, report.best_version),
    }
    Ok(())
}
