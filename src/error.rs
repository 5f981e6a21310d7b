use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MashError {
    #[error("Recipe not found: {0}")]
    RecipeNotFound(String),

    #[error("Not installed: {0}")]
    NotInstalled(String),

    #[error("Failed to parse recipe {path}: {source}")]
    RecipeParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Dependency cycle: {}", .participants.join(" -> "))]
    Cycle { participants: Vec<String> },

    #[error("Failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("Checksum mismatch for {recipe}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        recipe: String,
        expected: String,
        actual: String,
    },

    #[error("{recipe}: {phase} step failed ({})", exit_display(.exit_code))]
    StepFailure {
        recipe: String,
        phase: &'static str,
        exit_code: Option<i32>,
        output: String,
    },

    #[error("Install conflict: {} already owned by {owner}", .path.display())]
    InstallConflict { path: PathBuf, owner: String },

    #[error("{recipe}: test failed ({})", exit_display(.exit_code))]
    TestFailure {
        recipe: String,
        exit_code: Option<i32>,
        output: String,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl MashError {
    /// Process exit code for this failure category.
    ///
    /// Each category gets its own code so callers can tell a checksum
    /// mismatch from a build failure without parsing stderr.
    pub fn exit_code(&self) -> i32 {
        match self {
            MashError::Cycle { .. } => 2,
            MashError::Fetch { .. } | MashError::Http(_) => 3,
            MashError::ChecksumMismatch { .. } => 4,
            MashError::StepFailure { .. } => 5,
            MashError::InstallConflict { .. } => 6,
            MashError::TestFailure { .. } => 7,
            MashError::RecipeNotFound(_)
            | MashError::NotInstalled(_)
            | MashError::RecipeParse { .. } => 8,
            _ => 1,
        }
    }

    /// Captured process output for failures that carry it.
    pub fn captured_output(&self) -> Option<&str> {
        match self {
            MashError::StepFailure { output, .. } | MashError::TestFailure { output, .. } => {
                Some(output)
            }
            _ => None,
        }
    }
}

fn exit_display(exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, MashError>;

