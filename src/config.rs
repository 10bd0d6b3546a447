use serde::Deserialize;

/// What happens when a builder or merge policy rejects something
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorMode {
    /// Keep going and report every error at the end, keyed by table and row key
    #[default]
    Collect,
    /// Abort the run on the first error
    FailFast,
}

/// Configuration for one mapping run
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Run-wide error mode; instance emissions may override it
    pub error_mode: ErrorMode,

    /// Field injected into rows keyed by a single component
    pub id_field: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            error_mode: ErrorMode::Collect,
            id_field: String::from("id"),
        }
    }
}

impl RunConfig {
    pub fn fail_fast() -> Self {
        RunConfig {
            error_mode: ErrorMode::FailFast,
            ..Default::default()
        }
    }
}
