use clap::ValueEnum;
use serde::Deserialize;

#[derive(ValueEnum, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Stream task output live.
    Stream,
    /// Print each task's output as a single block after it completes.
    #[default]
    Group,
    /// Show task output only as part of a failure.
    Quiet,
}

impl OutputMode {
    pub fn streams(self) -> bool {
        self == OutputMode::Stream
    }

    /// Whether a successful task's captured output is printed afterwards.
    /// Failed tasks always show their output through the error.
    pub fn replays(self) -> bool {
        self == OutputMode::Group
    }
}
