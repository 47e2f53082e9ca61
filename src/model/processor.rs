use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

/// Tokenizer / multimodal processor that can write its artifacts next to an
/// exported model.
pub trait ProcessingClass: Send + Sync {
    fn save_pretrained(&self, dir: &Path) -> Result<()>;
}

/// A processor represented by the files it was loaded from.
#[derive(Debug, Clone, Default)]
pub struct TokenizerFiles {
    files: Vec<PathBuf>,
}

impl TokenizerFiles {
    /// File names recognised by [`TokenizerFiles::from_dir`].
    pub const KNOWN_FILES: &'static [&'static str] = &[
        "tokenizer.json",
        "tokenizer_config.json",
        "special_tokens_map.json",
        "vocab.json",
        "merges.txt",
        "added_tokens.json",
        "preprocessor_config.json",
        "chat_template.jinja",
    ];

    pub fn new(files: Vec<PathBuf>) -> Self {
        Self { files }
    }

    /// Collect the known processor files present in `dir`.
    pub fn from_dir(dir: &Path) -> Self {
        let files = Self::KNOWN_FILES
            .iter()
            .map(|name| dir.join(name))
            .filter(|path| path.is_file())
            .collect();
        Self { files }
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }
}

impl ProcessingClass for TokenizerFiles {
    fn save_pretrained(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        for src in &self.files {
            let name = src
                .file_name()
                .with_context(|| format!("Processor file {} has no file name", src.display()))?;
            let dst = dir.join(name);
            std::fs::copy(src, &dst)
                .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;
            debug!(file = %dst.display(), "Saved processor artifact");
        }
        Ok(())
    }
}
