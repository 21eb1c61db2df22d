// ============================================================
// Layer 3 — Split
// ============================================================
// Every forward pass is attributed to exactly one split.
// Metrics for each split are accumulated separately and
// reset together at the start of every training epoch.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Split {
    Train,
    Val,
    Test,
    TrainLastLayer,
}

impl Split {
    pub const ALL: [Split; 4] = [Split::Train, Split::Val, Split::Test, Split::TrainLastLayer];

    /// Key used as the metric name prefix, e.g. `val/accuracy`
    pub fn key(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
            Split::Test => "test",
            Split::TrainLastLayer => "train_last_layer",
        }
    }

    /// Position in `Split::ALL`
    pub fn index(self) -> usize {
        match self {
            Split::Train => 0,
            Split::Val => 1,
            Split::Test => 2,
            Split::TrainLastLayer => 3,
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}
