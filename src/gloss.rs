use std::{collections::HashMap, path::Path};

use anyhow::{Context, anyhow};
use serde::Deserialize;

use crate::error::{RecognitionError, Result};

/// Label returned for class indices the table does not know.
pub const UNKNOWN_LABEL: &str = "UNKNOWN";

#[derive(Debug, Deserialize)]
struct GlossRecord {
    idx: usize,
    word: String,
}

/// Bidirectional class index <-> word table. Indices are unique.
#[derive(Clone, Debug, Default)]
pub struct GlossTable {
    words: HashMap<usize, String>,
    indices: HashMap<String, usize>,
}

impl GlossTable {
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (usize, S)>,
        S: Into<String>,
    {
        let mut table = Self::default();
        for (idx, word) in pairs {
            table
                .insert(idx, word.into())
                .map_err(|err| RecognitionError::Gloss(err.to_string()))?;
        }
        Ok(table)
    }

    /// Reads a CSV file with `idx` and `word` columns.
    pub fn load(path: &Path) -> Result<Self> {
        let read = || -> anyhow::Result<Self> {
            let mut reader = csv::Reader::from_path(path)
                .with_context(|| format!("failed to open gloss table {}", path.display()))?;
            let mut table = Self::default();
            for (line, record) in reader.deserialize::<GlossRecord>().enumerate() {
                let record = record.with_context(|| format!("bad gloss row {}", line + 1))?;
                table.insert(record.idx, record.word)?;
            }
            log::info!("loaded {} glosses from {}", table.len(), path.display());
            Ok(table)
        };
        read().map_err(|err| RecognitionError::Gloss(format!("{err:#}")))
    }

    fn insert(&mut self, idx: usize, word: String) -> anyhow::Result<()> {
        if let Some(existing) = self.words.get(&idx) {
            return Err(anyhow!(
                "duplicate gloss index {idx} ({existing:?} and {word:?})"
            ));
        }
        // First index wins when a word repeats.
        self.indices.entry(word.clone()).or_insert(idx);
        self.words.insert(idx, word);
        Ok(())
    }

    pub fn word(&self, idx: usize) -> Option<&str> {
        self.words.get(&idx).map(String::as_str)
    }

    /// Word for `idx`, or [`UNKNOWN_LABEL`].
    pub fn label(&self, idx: usize) -> &str {
        self.word(idx).unwrap_or(UNKNOWN_LABEL)
    }

    pub fn index(&self, word: &str) -> Option<usize> {
        self.indices.get(word).copied()
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}
