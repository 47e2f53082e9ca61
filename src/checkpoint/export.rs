use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::info;

use crate::error::ExportError;
use crate::model::{NamedTensor, PretrainedConfig, ProcessingClass};

use super::format::encode_tensors;

/// Directory of the consolidated snapshot inside a checkpoint directory.
pub const MERGED_MODEL_DIR: &str = "merged_model";
pub const MERGED_WEIGHTS_FILE: &str = "model.safetensors";

/// The full, unsharded model assembled from every worker's range.
#[derive(Debug, Clone)]
pub struct ConsolidatedModel {
    pub model_type: String,
    pub tensors: Vec<NamedTensor>,
    pub pretrained: Option<PretrainedConfig>,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ExportError + '_ {
    move |source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn write_json(path: &Path, value: &Value) -> Result<(), ExportError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| ExportError::Serialize(e.to_string()))?;
    std::fs::write(path, bytes).map_err(io_error(path))
}

/// Write `checkpoint_dir/merged_model/` with weights, configuration files and
/// processor artifacts. Returns the directory written.
pub fn export_consolidated_model(
    checkpoint_dir: &Path,
    model: &ConsolidatedModel,
    processor: Option<&dyn ProcessingClass>,
) -> Result<PathBuf, ExportError> {
    let pretrained = model
        .pretrained
        .as_ref()
        .ok_or_else(|| ExportError::UnsupportedModel(model.model_type.clone()))?;

    let dir = checkpoint_dir.join(MERGED_MODEL_DIR);
    std::fs::create_dir_all(&dir).map_err(io_error(&dir))?;

    let tensors: Vec<_> = model
        .tensors
        .iter()
        .map(|t| {
            let bytes = t.data.iter().flat_map(|v| v.to_le_bytes()).collect();
            (t.name.clone(), t.shape.clone(), bytes)
        })
        .collect();
    let mut metadata = HashMap::new();
    metadata.insert("format".to_string(), "pt".to_string());
    let bytes = encode_tensors(&tensors, metadata).map_err(|e| ExportError::Serialize(format!("{e:#}")))?;
    let weights = dir.join(MERGED_WEIGHTS_FILE);
    std::fs::write(&weights, bytes).map_err(io_error(&weights))?;

    write_json(&dir.join("config.json"), &pretrained.config)?;
    if let Some(generation) = &pretrained.generation_config {
        write_json(&dir.join("generation_config.json"), generation)?;
    }
    if let Some(processor) = processor {
        processor
            .save_pretrained(&dir)
            .map_err(|e| ExportError::Processor(format!("{e:#}")))?;
    }

    info!(
        path = %dir.display(),
        tensors = model.tensors.len(),
        "Exported consolidated model"
    );
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TokenizerFiles;
    use safetensors::SafeTensors;
    use serde_json::json;

    fn consolidated(pretrained: bool) -> ConsolidatedModel {
        ConsolidatedModel {
            model_type: "bigram".into(),
            tensors: vec![
                NamedTensor {
                    name: "a.weight".into(),
                    shape: vec![2, 2],
                    data: vec![1.0, 2.0, 3.0, 4.0],
                },
                NamedTensor {
                    name: "b.weight".into(),
                    shape: vec![3],
                    data: vec![-1.0, 0.0, 1.0],
                },
            ],
            pretrained: pretrained.then(|| PretrainedConfig {
                config: json!({"model_type": "bigram"}),
                generation_config: None,
            }),
        }
    }

    #[test]
    fn test_export_writes_named_tensors() {
        let dir = tempfile::tempdir().unwrap();
        let tokenizer_dir = tempfile::tempdir().unwrap();
        std::fs::write(tokenizer_dir.path().join("tokenizer.json"), "{}").unwrap();
        let processor = TokenizerFiles::from_dir(tokenizer_dir.path());

        let out = export_consolidated_model(dir.path(), &consolidated(true), Some(&processor)).unwrap();
        assert_eq!(out, dir.path().join(MERGED_MODEL_DIR));
        assert!(out.join("config.json").is_file());
        assert!(!out.join("generation_config.json").exists());
        assert!(out.join("tokenizer.json").is_file());

        let bytes = std::fs::read(out.join(MERGED_WEIGHTS_FILE)).unwrap();
        let st = SafeTensors::deserialize(&bytes).unwrap();
        let a = st.tensor("a.weight").unwrap();
        assert_eq!(a.shape(), &[2, 2]);
        assert_eq!(&a.data()[12..16], &4.0f32.to_le_bytes());
        assert_eq!(st.tensor("b.weight").unwrap().shape(), &[3]);
    }

    #[test]
    fn test_model_without_config_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let err = export_consolidated_model(dir.path(), &consolidated(false), None).unwrap_err();
        assert!(matches!(err, ExportError::UnsupportedModel(ref t) if t == "bigram"));
        assert!(!dir.path().join(MERGED_MODEL_DIR).exists());
    }
}
