use anyhow::Error as AnyError;
use core::fmt;

/// Enumerates the pipeline stages a fatal failure can originate from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Poll,
    ChunkFetch,
    OutcomeFetch,
    Filter,
    Decode,
    Dispatch,
}

/// Fatal pipeline failure naming the stage and the block, chunk or receipt
/// that could not be processed.
#[derive(Debug)]
pub struct IndexerError {
    stage: PipelineStage,
    target: String,
    source: AnyError,
}

impl IndexerError {
    pub fn new(stage: PipelineStage, target: impl Into<String>, source: AnyError) -> Self {
        Self {
            stage,
            target: target.into(),
            source,
        }
    }

    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

impl fmt::Display for IndexerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} failed for {}", self.stage, self.target)
    }
}

impl std::error::Error for IndexerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}
