//! Extension loading error types with clear, actionable messages.
//!
//! All errors include the extension id and relevant context to help
//! developers quickly identify and fix issues.

use thiserror::Error;

/// Errors that can occur during extension discovery and loading.
#[derive(Debug, Error)]
pub enum ExtensionError {
    /// Extension directory is missing the .manifest.json file.
    #[error("extension '{extension}': no .manifest.json found in {path}")]
    MissingManifest { extension: String, path: String },

    /// Multiple .manifest.json files found in extension directory.
    #[error("extension directory '{path}': multiple .manifest.json files found, expected exactly one")]
    MultipleManifests { path: String },

    /// The .manifest.json file could not be parsed or failed validation.
    #[error("extension '{extension}': failed to parse manifest: {details}")]
    InvalidManifest { extension: String, details: String },

    /// Manifest id does not match the directory it was found in.
    #[error(
        "extension '{extension}': manifest id does not match directory name '{directory}'. Rename the directory or fix the id"
    )]
    IdMismatch {
        extension: String,
        directory: String,
    },

    /// The entrypoint file named by the manifest is missing.
    #[error("extension '{extension}': entrypoint not found at {expected_path}")]
    MissingEntrypoint {
        extension: String,
        expected_path: String,
    },

    /// Two discovered extensions claim the same id.
    #[error("extension '{extension}': id already loaded from {first_path}, ignoring {second_path}")]
    DuplicateId {
        extension: String,
        first_path: String,
        second_path: String,
    },

    /// The extension's entrypoint failed to evaluate.
    #[error("extension '{extension}': failed to load: {details}")]
    LoadFailed { extension: String, details: String },

    /// The extension's scheduler could not be started.
    #[error("extension '{extension}': failed to start runtime: {details}")]
    RuntimeStartFailed { extension: String, details: String },
}

impl ExtensionError {
    /// Create a missing manifest error from the directory that lacked one.
    pub fn missing_manifest(path: impl Into<String>) -> Self {
        let path = path.into();
        let extension = std::path::Path::new(&path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();
        Self::MissingManifest { extension, path }
    }

    /// Create an invalid manifest error.
    pub fn invalid_manifest(extension: impl Into<String>, details: impl ToString) -> Self {
        Self::InvalidManifest {
            extension: extension.into(),
            details: details.to_string(),
        }
    }

    /// Create a missing entrypoint error.
    pub fn missing_entrypoint(extension: impl Into<String>, path: impl Into<String>) -> Self {
        Self::MissingEntrypoint {
            extension: extension.into(),
            expected_path: path.into(),
        }
    }

    /// Create a load failure error.
    pub fn load_failed(extension: impl Into<String>, details: impl ToString) -> Self {
        Self::LoadFailed {
            extension: extension.into(),
            details: details.to_string(),
        }
    }
}
