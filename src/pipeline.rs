//! Probe a changed revision for a declarative pipeline directory.
//!
//! The probe only needs the provider client's extended file operations;
//! applying the discovered resources belongs to the trigger sink's
//! executor. In fallback mode those operations are unavailable and the
//! probe reports nothing rather than failing the cycle.

use crate::gitclient::{GitClient, GitClientError};

pub const DEFAULT_PIPELINE_DIR: &str = ".pipeline";

/// What a probe found at one revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineProbe {
    pub directory: String,
    pub present: bool,
    /// YAML resource files under the directory.
    pub files: Vec<String>,
}

/// Inspect `commit` for pipeline resources under `dir`.
///
/// Returns `Ok(None)` when the client cannot perform file operations
/// (command-line fallback mode).
pub async fn probe(
    client: &dyn GitClient,
    commit: &str,
    dir: &str,
) -> Result<Option<PipelineProbe>, GitClientError> {
    let present = match client.check_directory_exists(commit, dir).await {
        Ok(present) => present,
        Err(GitClientError::ApiRequired(_)) => return Ok(None),
        Err(e) => return Err(e),
    };

    if !present {
        return Ok(Some(PipelineProbe {
            directory: dir.to_string(),
            present: false,
            files: Vec::new(),
        }));
    }

    let files = client
        .list_files(commit, dir)
        .await?
        .into_iter()
        .filter(|f| f.ends_with(".yaml") || f.ends_with(".yml"))
        .collect();

    Ok(Some(PipelineProbe {
        directory: dir.to_string(),
        present: true,
        files,
    }))
}

/// Fetch the discovered resource files, skipping any that fail to load.
pub async fn fetch_resources(
    client: &dyn GitClient,
    commit: &str,
    probe: &PipelineProbe,
) -> Vec<(String, Vec<u8>)> {
    let mut resources = Vec::with_capacity(probe.files.len());
    for file in &probe.files {
        match client.get_file_content(commit, file).await {
            Ok(bytes) => resources.push((file.clone(), bytes)),
            Err(e) => {
                tracing::warn!(file = %file, error = %e, "failed to fetch pipeline resource");
            }
        }
    }
    resources
}
