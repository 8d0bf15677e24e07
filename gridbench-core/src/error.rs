use std::fmt;

use crate::cluster::NodeId;

/// Boxed opaque error, used at the seams where only the rendered cause
/// matters (workload logic, transactional resources, telemetry setup).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Pre-execution configuration failure.
///
/// Raised during stage validation, before any stressor is spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    NoThreadCount,
    ConflictingThreadCounts,
    ConflictingPacing,
    ServiceTimeWithoutCycleTime,
    EmptyCluster,
    NodeNotParticipating(NodeId),
    InvalidDuration(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NoThreadCount => {
                write!(f, "either threads-per-node or total-threads must be set")
            }
            ConfigError::ConflictingThreadCounts => write!(
                f,
                "only one of threads-per-node and total-threads may be set"
            ),
            ConfigError::ConflictingPacing => {
                write!(f, "think-time and cycle-time cannot be combined")
            }
            ConfigError::ServiceTimeWithoutCycleTime => write!(
                f,
                "report-latency-as-service-time requires a cycle-time greater than zero"
            ),
            ConfigError::EmptyCluster => write!(f, "no participating nodes"),
            ConfigError::NodeNotParticipating(node) => {
                write!(f, "node {node} is not participating in this test")
            }
            ConfigError::InvalidDuration(raw) => {
                write!(f, "invalid duration value '{raw}'")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Failure while bringing a round up: building policy or pacer, spawning the
/// fleet, or a stressor failing before it signalled ready.
///
/// Reported as a node-level error ack; other nodes are unaffected.
#[derive(Debug)]
pub struct StartupError {
    context: &'static str,
    source: Option<BoxError>,
}

impl StartupError {
    pub fn new(context: &'static str, source: impl Into<BoxError>) -> Self {
        Self {
            context,
            source: Some(source.into()),
        }
    }

    pub fn message(context: &'static str) -> Self {
        Self {
            context,
            source: None,
        }
    }
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{}: {source}", self.context),
            None => write!(f, "{}", self.context),
        }
    }
}

impl std::error::Error for StartupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|err| err as &(dyn std::error::Error + 'static))
    }
}

/// Anything that can fail a stage on one node before results are gathered.
#[derive(Debug)]
pub enum StageError {
    Config(ConfigError),
    Startup(StartupError),
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageError::Config(err) => write!(f, "configuration error: {err}"),
            StageError::Startup(err) => write!(f, "startup error: {err}"),
        }
    }
}

impl std::error::Error for StageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StageError::Config(err) => Some(err),
            StageError::Startup(err) => Some(err),
        }
    }
}

impl From<ConfigError> for StageError {
    fn from(err: ConfigError) -> Self {
        StageError::Config(err)
    }
}

impl From<StartupError> for StageError {
    fn from(err: StartupError) -> Self {
        StageError::Startup(err)
    }
}
