//! Performance findings reported by analysis agents.
//!
//! A [`Property`] travels up the tree by value. Interior agents may replace
//! several similar properties with one cluster property whose `exec_objs`
//! list every contributing process/thread pair.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Name of the property carrying regions to instrument in the next run.
pub const REQUIRED_REGIONS: &str = "Required regions in the next experiment";

/// Name of the property flagging regions too fine-grained to instrument.
pub const HIGH_OVERHEAD: &str = "high Instrumentation overhead";

/// Marker in property names used for internal execution-time bookkeeping.
pub const HOT_REGION_MARKER: &str = ":::::";

/// Extra-info key holding the newline-separated region list.
pub const REGIONS_KEY: &str = "regions";

/// One process/thread pair a property holds for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecObj {
    pub process: u32,
    pub thread: u32,
}

/// A single performance finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    /// Property type identifier.
    pub id: String,
    pub name: String,
    pub file_id: u32,
    pub file_name: String,
    pub start_line: u32,
    pub region_id: String,
    pub region_type: String,
    pub configuration: String,
    pub severity: f64,
    pub confidence: f64,
    pub process: u32,
    pub thread: u32,
    /// Set when this property stands for several merged findings.
    #[serde(default)]
    pub cluster: bool,
    #[serde(default)]
    pub exec_objs: SmallVec<[ExecObj; 4]>,
    #[serde(default)]
    pub extra_info: IndexMap<String, String>,
}

impl Property {
    /// A property with the identifying fields set and everything else empty.
    pub fn new(id: impl Into<String>, name: impl Into<String>, region_id: impl Into<String>) -> Self {
        Property {
            id: id.into(),
            name: name.into(),
            file_id: 0,
            file_name: String::new(),
            start_line: 0,
            region_id: region_id.into(),
            region_type: String::new(),
            configuration: String::new(),
            severity: 0.0,
            confidence: 0.0,
            process: 0,
            thread: 0,
            cluster: false,
            exec_objs: SmallVec::new(),
            extra_info: IndexMap::new(),
        }
    }

    /// Internal execution-time property, never clustered or exported.
    pub fn is_hot_region(&self) -> bool {
        self.name.contains(HOT_REGION_MARKER)
    }

    pub fn is_required_regions(&self) -> bool {
        self.name == REQUIRED_REGIONS
    }

    pub fn is_high_overhead(&self) -> bool {
        self.name == HIGH_OVERHEAD
    }

    /// Region list carried in the extra info, one region per line.
    pub fn regions(&self) -> Vec<String> {
        self.extra_info
            .get(REGIONS_KEY)
            .map(|raw| {
                raw.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The `f: <file>, r: <region>` key identifying this property's code region.
    pub fn region_key(&self) -> String {
        format!("f: {}, r: {}", self.file_name, self.region_id)
    }

    /// The process/thread pairs this property covers.
    ///
    /// A cluster reports its accumulated list; a plain property reports itself.
    pub fn instances(&self) -> SmallVec<[ExecObj; 4]> {
        if self.cluster {
            self.exec_objs.clone()
        } else {
            let mut one = SmallVec::new();
            one.push(ExecObj {
                process: self.process,
                thread: self.thread,
            });
            one
        }
    }

    /// Number of processes the property spans, for the summary table.
    pub fn process_count(&self) -> usize {
        if self.cluster {
            let mut procs: Vec<u32> = self.exec_objs.iter().map(|e| e.process).collect();
            procs.sort_unstable();
            procs.dedup();
            procs.len()
        } else {
            1
        }
    }
}
