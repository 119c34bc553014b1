use std::path::Path;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::AsyncReadExt;
use tracing::*;

use crate::pipeline::{Note, StageCollaborator, StageContext, StageError, StageOutput};
use crate::ConversionRequest;

const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";

/// Checks that a conversion's input is a readable zip-family archive before
/// any translation stage runs.
#[derive(Debug, Clone, Default)]
pub struct ArchiveIngestion;

#[async_trait]
impl StageCollaborator for ArchiveIngestion {
    async fn run(&self, ctx: &StageContext<'_>) -> Result<StageOutput, StageError> {
        let request: ConversionRequest = ctx.payload()?;
        let path = Path::new(&request.input_path);

        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| StageError::new(format!("cannot read {}: {e}", path.display())))?;
        if !metadata.is_file() {
            return Err(StageError::new(format!("{} is not a file", path.display())));
        }

        let mut magic = [0u8; 4];
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| StageError::new(format!("cannot open {}: {e}", path.display())))?;
        file.read_exact(&mut magic)
            .await
            .map_err(|_| StageError::new(format!("{} is too short to be an archive", path.display())))?;
        if magic != ZIP_MAGIC {
            return Err(StageError::new(format!("{} is not a zip archive", path.display())));
        }

        let mut output = StageOutput::new(json!({
            "input_path": &request.input_path,
            "archive_bytes": metadata.len(),
        }));
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        if !matches!(extension.as_deref(), Some("jar") | Some("zip")) {
            debug!(path = %path.display(), "Unexpected archive extension");
            output = output.with_note(Note::warning(format!(
                "{} does not have a .jar or .zip extension",
                path.display()
            )));
        }
        Ok(output)
    }
}
