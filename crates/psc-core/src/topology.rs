//! Fan-out tree computation.
//!
//! Leaves own disjoint chunks of the application's processes, bounded by
//! `max_cluster`. Each interior level groups the level below into chunks of
//! `max_fan` until one agent remains; that agent is the root and hangs
//! directly under the frontend as `fe[<id>]:0`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::id::{RegistryId, Tag};

/// One registered application process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessEntry {
    /// Registry id of the process; the rank itself in fast mode.
    pub id: RegistryId,
    pub host: String,
}

/// Inputs that shape the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyParams {
    pub max_cluster: usize,
    pub max_fan: usize,
    /// Partition processes in registration order and place every agent on
    /// the frontend host.
    pub force_localhost: bool,
    pub frontend_tag: Tag,
    pub frontend_host: String,
    /// Port of the first agent; the others are numbered upward from it.
    pub agent_baseport: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Analysis,
    HighLevel,
}

/// One agent to launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub kind: AgentKind,
    pub tag: Tag,
    pub parent: Tag,
    pub host: String,
    pub port: u16,
    /// Owned processes (leaves only).
    pub appl_ids: Vec<RegistryId>,
    /// Child tags (interior agents only).
    pub children: Vec<Tag>,
}

impl AgentDescriptor {
    /// Comma-separated child tags, as passed on an agent's command line.
    pub fn children_list(&self) -> String {
        join(&self.children)
    }

    /// Comma-separated process ids, as passed on an agent's command line.
    pub fn appl_id_list(&self) -> String {
        join(&self.appl_ids)
    }
}

fn join<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// The computed tree; level 0 holds the leaves, the last level the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    levels: Vec<Vec<AgentDescriptor>>,
}

impl Topology {
    pub fn compute(processes: &[ProcessEntry], params: &TopologyParams) -> Result<Self, CoreError> {
        if params.max_cluster == 0 || params.max_fan == 0 {
            return Err(CoreError::InvalidTopology {
                reason: format!(
                    "maxcluster ({}) and maxfan ({}) must be at least 1",
                    params.max_cluster, params.max_fan
                ),
            });
        }
        if processes.is_empty() {
            return Err(CoreError::InvalidTopology {
                reason: "no application processes registered".to_string(),
            });
        }

        let mut next_port = Some(params.agent_baseport);
        let mut alloc_port = || -> Result<u16, CoreError> {
            let port = next_port.ok_or_else(|| CoreError::InvalidTopology {
                reason: "agent ports exceed 65535".to_string(),
            })?;
            next_port = port.checked_add(1);
            Ok(port)
        };

        // Leaves: one chunk list per host, or one list in registration order.
        let groups: Vec<(String, Vec<RegistryId>)> = if params.force_localhost {
            vec![(
                params.frontend_host.clone(),
                processes.iter().map(|p| p.id).collect(),
            )]
        } else {
            let mut by_host: BTreeMap<&str, Vec<RegistryId>> = BTreeMap::new();
            for p in processes {
                by_host.entry(p.host.as_str()).or_default().push(p.id);
            }
            by_host
                .into_iter()
                .map(|(host, ids)| (host.to_string(), ids))
                .collect()
        };

        let mut leaves = Vec::new();
        for (host, ids) in groups {
            for chunk in ids.chunks(params.max_cluster) {
                leaves.push(AgentDescriptor {
                    kind: AgentKind::Analysis,
                    tag: params.frontend_tag.clone(),
                    parent: params.frontend_tag.clone(),
                    host: host.clone(),
                    port: alloc_port()?,
                    appl_ids: chunk.to_vec(),
                    children: Vec::new(),
                });
            }
        }

        // Interior levels, sized only; tags are assigned top-down afterwards.
        let mut levels = vec![leaves];
        while let Some(prev) = levels.last().map(Vec::len).filter(|&n| n > 1) {
            let count = if params.max_fan == 1 {
                1
            } else {
                prev.div_ceil(params.max_fan)
            };
            let mut level = Vec::with_capacity(count);
            for _ in 0..count {
                level.push(AgentDescriptor {
                    kind: AgentKind::HighLevel,
                    tag: params.frontend_tag.clone(),
                    parent: params.frontend_tag.clone(),
                    host: params.frontend_host.clone(),
                    port: alloc_port()?,
                    appl_ids: Vec::new(),
                    children: Vec::new(),
                });
            }
            levels.push(level);
        }

        let top = levels.len() - 1;
        levels[top][0].tag = params.frontend_tag.child(0);
        levels[top][0].parent = params.frontend_tag.clone();

        // With max_fan == 1 the single interior agent parents everything.
        let fan = if params.max_fan == 1 { usize::MAX } else { params.max_fan };
        for upper in (1..=top).rev() {
            let (lower_levels, upper_levels) = levels.split_at_mut(upper);
            let parents = &mut upper_levels[0];
            let children = &mut lower_levels[upper - 1];
            for (i, child) in children.iter_mut().enumerate() {
                let parent = &mut parents[i / fan];
                child.parent = parent.tag.clone();
                child.tag = parent.tag.child(i % fan);
                parent.children.push(child.tag.clone());
            }
        }

        Ok(Topology { levels })
    }

    pub fn levels(&self) -> &[Vec<AgentDescriptor>] {
        &self.levels
    }

    pub fn leaves(&self) -> &[AgentDescriptor] {
        &self.levels[0]
    }

    pub fn root(&self) -> &AgentDescriptor {
        &self.levels[self.levels.len() - 1][0]
    }

    /// All agents, leaves first.
    pub fn agents(&self) -> impl Iterator<Item = &AgentDescriptor> {
        self.levels.iter().flatten()
    }

    pub fn agent_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    pub fn find(&self, tag: &Tag) -> Option<&AgentDescriptor> {
        self.agents().find(|a| &a.tag == tag)
    }

    /// Depth-first textual view of the tree, two spaces per level.
    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        self.render_into(self.root(), 0, &mut lines);
        lines.join("\n")
    }

    fn render_into(&self, agent: &AgentDescriptor, depth: usize, lines: &mut Vec<String>) {
        let detail = match agent.kind {
            AgentKind::Analysis => format!("ids={}", agent.appl_id_list()),
            AgentKind::HighLevel => format!("children={}", agent.children_list()),
        };
        lines.push(format!(
            "{}{} @ {}:{} parent={} {}",
            "  ".repeat(depth),
            agent.tag,
            agent.host,
            agent.port,
            agent.parent,
            detail
        ));
        for child in &agent.children {
            if let Some(desc) = self.find(child) {
                self.render_into(desc, depth + 1, lines);
            }
        }
    }
}
