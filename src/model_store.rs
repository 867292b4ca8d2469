use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use tempfile::NamedTempFile;

use crate::model_inference::VoiceModel;
use crate::{DetectionError, Result};

const MODEL_FILE: &str = "voice_model.json";

/// Bumped whenever the serialized layout of [`VoiceModel`] changes.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Serialize)]
struct BundleRef<'a> {
    format_version: u32,
    model: &'a VoiceModel,
}

#[derive(Deserialize)]
struct Bundle {
    format_version: u32,
    model: VoiceModel,
}

/// Persists a [`VoiceModel`] as a single JSON file.
///
/// Writes go to a temporary file in the same directory which is then renamed
/// over the old bundle, so readers see either the previous model or the new
/// one, never a partial file.
#[derive(Debug, Clone)]
pub struct ModelStore {
    dir: PathBuf,
}

impl ModelStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn model_path(&self) -> PathBuf {
        self.dir.join(MODEL_FILE)
    }

    pub fn exists(&self) -> bool {
        self.model_path().is_file()
    }

    /// `Ok(None)` when nothing has been saved yet.
    pub fn load(&self) -> Result<Option<VoiceModel>> {
        let path = self.model_path();
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let bundle: Bundle = serde_json::from_reader(BufReader::new(file))?;
        if bundle.format_version != FORMAT_VERSION {
            return Err(DetectionError::Storage(format!(
                "{:?} has format version {}, expected {}",
                path, bundle.format_version, FORMAT_VERSION
            )));
        }
        bundle.model.validate()?;

        info!(
            "Loaded {} model from {:?} (trained {})",
            bundle.model.provenance().as_str(),
            path,
            bundle.model.trained_at().to_rfc3339()
        );
        Ok(Some(bundle.model))
    }

    pub fn save(&self, model: &VoiceModel) -> Result<()> {
        fs::create_dir_all(&self.dir)?;

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer(
                &mut writer,
                &BundleRef {
                    format_version: FORMAT_VERSION,
                    model,
                },
            )?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;

        let path = self.model_path();
        tmp.persist(&path)
            .map_err(|e| DetectionError::Storage(format!("failed to publish {:?}: {}", path, e.error)))?;

        debug!("Saved {} model to {:?}", model.provenance().as_str(), path);
        Ok(())
    }
}
