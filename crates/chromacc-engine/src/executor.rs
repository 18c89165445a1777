//! Per-item execution envelope.
//!
//! One work item means: decode the source once, run the pipeline on a
//! diagnostics-suppressed copy of the configuration, and fold every
//! possible failure into a per-item outcome. Nothing here ever panics a
//! worker thread on bad input; by the time an outcome reaches the batch
//! state it is data.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use chromacc_core::decoders::{self, ImageBuf};
use chromacc_core::models::Stage;
use chromacc_core::pipeline::{PipelineFactory, RunConfig};

use crate::batch::ItemResult;
use crate::registry::ModelHandle;

/// One unit of work, owned by a single worker for one execution.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub index: usize,
    pub path: PathBuf,
    pub filename: String,
}

/// Terminal outcome of one item's execution.
#[derive(Debug)]
pub struct ItemOutcome {
    pub index: usize,
    pub filename: String,
    pub outcome: Result<ItemResult, String>,
}

impl ItemOutcome {
    fn failed(item: &WorkItem, message: String) -> Self {
        Self {
            index: item.index,
            filename: item.filename.clone(),
            outcome: Err(message),
        }
    }
}

fn item_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string())
}

/// Run the full pipeline on one item with a fresh pipeline instance.
///
/// The caller's configuration is deep-copied with expensive diagnostics
/// forced off; batch throughput depends on that suppression. The decoded
/// frame is dropped before returning so peak memory stays bounded under
/// concurrent execution.
pub fn execute_item(
    item: &WorkItem,
    factory: &Arc<dyn PipelineFactory>,
    white: Option<&ImageBuf>,
    config: &RunConfig,
) -> ItemOutcome {
    debug!(index = item.index, filename = %item.filename, "Processing item");

    let image = match decoders::load_image(&item.path) {
        Ok(image) => image,
        Err(e) => return ItemOutcome::failed(item, e),
    };

    let batch_config = config.suppressed();
    let name = item_name(&item.path);

    let mut pipeline = factory.create();
    let output = match pipeline.run(&image, white, &name, &batch_config) {
        Ok(output) => output,
        Err(e) => {
            drop(image);
            return ItemOutcome::failed(item, format!("Pipeline error: {e}"));
        }
    };
    drop(image);

    if let Some(warning) = &output.warning {
        warn!(index = item.index, filename = %item.filename, warning, "Pipeline warning");
    }

    let final_stage = output.final_corrected().map(|(stage, _)| stage);
    ItemOutcome {
        index: item.index,
        filename: item.filename.clone(),
        outcome: Ok(ItemResult {
            index: item.index,
            filename: item.filename.clone(),
            images: output.images,
            final_stage,
        }),
    }
}

/// Apply a previously trained, shared model to one item.
///
/// The shared instance is not safe for concurrent use, so the inference
/// call is serialized behind the handle's mutex; decoding stays outside
/// the critical section to preserve parallelism.
pub fn execute_inference_item(item: &WorkItem, model: &ModelHandle) -> ItemOutcome {
    let image = match decoders::load_image(&item.path) {
        Ok(image) => image,
        Err(e) => return ItemOutcome::failed(item, e),
    };

    let predicted = {
        let guard = model.lock().expect("model poisoned");
        guard.predict_image(&image)
    };
    drop(image);

    match predicted {
        Ok(images) => {
            let final_stage = Stage::ORDER
                .iter()
                .rev()
                .find(|stage| images.contains_key(stage))
                .copied();
            if images.is_empty() {
                return ItemOutcome::failed(
                    item,
                    "No corrected images produced by inference".to_string(),
                );
            }
            ItemOutcome {
                index: item.index,
                filename: item.filename.clone(),
                outcome: Ok(ItemResult {
                    index: item.index,
                    filename: item.filename.clone(),
                    images,
                    final_stage,
                }),
            }
        }
        Err(e) => ItemOutcome::failed(item, format!("Inference error: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chromacc_core::models::CorrectionMethod;
    use chromacc_core::pipeline::StageFlags;
    use chromacc_core::settings::StageSettings;
    use chromacc_core::testing::{Script, ScriptedFactory, write_test_png};

    fn run_config() -> RunConfig {
        RunConfig::new(
            StageFlags {
                gc: true,
                cc: true,
                ..Default::default()
            },
            CorrectionMethod::Pls,
            StageSettings::default(),
        )
    }

    #[test]
    fn test_execute_item_success_suppresses_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.png");
        write_test_png(&path).unwrap();

        let factory = ScriptedFactory::new(Script::default());
        let script = Arc::clone(&factory.script);
        let factory: Arc<dyn PipelineFactory> = Arc::new(factory);

        let item = WorkItem {
            index: 0,
            path,
            filename: "sample.png".into(),
        };
        let outcome = execute_item(&item, &factory, None, &run_config());

        let result = outcome.outcome.unwrap();
        assert_eq!(result.final_stage, Some(Stage::Cc));
        assert!(result.images.contains_key(&Stage::Gc));
        // Diagnostics were enabled in the caller's settings but must not
        // reach the pipeline in batch mode
        assert!(!script.saw_diagnostics.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn test_execute_item_decode_failure_is_contained() {
        let factory: Arc<dyn PipelineFactory> = Arc::new(ScriptedFactory::new(Script::default()));
        let item = WorkItem {
            index: 3,
            path: PathBuf::from("/nonexistent/missing.png"),
            filename: "missing.png".into(),
        };

        let outcome = execute_item(&item, &factory, None, &run_config());
        let err = outcome.outcome.unwrap_err();
        assert!(err.contains("missing.png"));
        assert_eq!(outcome.index, 3);
    }

    #[test]
    fn test_execute_item_pipeline_failure_is_contained() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.png");
        write_test_png(&path).unwrap();

        let factory: Arc<dyn PipelineFactory> =
            Arc::new(ScriptedFactory::new(Script::default().fail("bad")));
        let item = WorkItem {
            index: 0,
            path,
            filename: "bad.png".into(),
        };

        let err = execute_item(&item, &factory, None, &run_config())
            .outcome
            .unwrap_err();
        assert!(err.starts_with("Pipeline error:"));
    }

    #[test]
    fn test_execute_inference_item_uses_trained_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("apply.png");
        write_test_png(&path).unwrap();

        let factory = ScriptedFactory::new(Script::default());
        let mut pipeline = factory.create();
        let image = decoders::load_image(&path).unwrap();
        pipeline.run(&image, None, "apply", &run_config()).unwrap();
        let model: ModelHandle = Arc::new(Mutex::new(pipeline));

        let item = WorkItem {
            index: 1,
            path,
            filename: "apply.png".into(),
        };
        let result = execute_inference_item(&item, &model).outcome.unwrap();
        assert_eq!(result.final_stage, Some(Stage::Cc));
    }
}
