use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerOptions {
    /// Error diagnostics collected per module before the pipeline gives up
    /// on that module.
    pub max_errors_per_module: usize,
    /// Compile modules on the rayon thread pool.
    pub parallel: bool,
    pub emit_line_numbers: bool,
    pub source_file_attribute: bool,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        CompilerOptions {
            max_errors_per_module: 25,
            parallel: true,
            emit_line_numbers: true,
            source_file_attribute: true,
        }
    }
}

impl CompilerOptions {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
