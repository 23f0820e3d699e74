//! Options consumed by the survey and generation core.

/// The fixed configuration structure assembled by the CLI layer.
#[derive(Debug, Clone)]
pub struct Options {
    /// Target AWS region.
    pub region: String,
    /// Wildcard patterns for identifiers that should be included.
    pub include: Vec<String>,
    /// Wildcard patterns for identifiers that should be excluded.
    pub exclude: Vec<String>,
    /// Survey CloudFormation stack information (slower).
    pub cloud_formation: bool,
    /// Approximately how many AWS API calls may be in flight at once.
    pub parallelism: u32,
    /// No console output apart from errors.
    pub quiet: bool,
    /// Output debug messages.
    pub debug: bool,
    /// Directory for the generated graph data files.
    pub output_path: String,
    /// Custom base endpoint (LocalStack, tests).
    pub endpoint: Option<String>,
    /// The command line that produced this run, recorded in `meta.json`.
    pub command_line: String,
}

impl Options {
    /// Effective executor concurrency; never below one.
    pub fn parallelism(&self) -> usize {
        self.parallelism.max(1) as usize
    }

    /// The same options with a different parallelism, for the
    /// reduced-parallelism restart.
    pub fn with_parallelism(&self, parallelism: u32) -> Self {
        Self {
            parallelism,
            ..self.clone()
        }
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            region: String::new(),
            include: vec!["*".to_string()],
            exclude: Vec::new(),
            cloud_formation: false,
            parallelism: 4,
            quiet: false,
            debug: false,
            output_path: "dataflow".to_string(),
            endpoint: None,
            command_line: String::new(),
        }
    }
}
