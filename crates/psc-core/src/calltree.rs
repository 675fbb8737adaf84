//! Call-tree nodes collected from analysis agents.

use serde::{Deserialize, Serialize};

/// One region in an agent's dynamic call tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallTreeNode {
    pub id: u32,
    pub parent: Option<u32>,
    pub region: String,
    pub file: String,
    pub line: u32,
    /// Process the node was observed on.
    pub process: u32,
}
