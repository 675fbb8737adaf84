//! Merging near-duplicate properties at interior agents.
//!
//! Clustering is one pass over the pending batch. Each not-yet-consumed
//! property becomes an anchor and absorbs every later property with the
//! same id and region whose severity and confidence both lie within the
//! thresholds of the anchor. No state survives between batches.

use indexmap::IndexSet;

use crate::property::{Property, REGIONS_KEY};

/// Maximum severity distance for two properties to merge.
pub const SEVERITY_THRESHOLD: f64 = 1.5;

/// Maximum confidence distance for two properties to merge.
pub const CONFIDENCE_THRESHOLD: f64 = 1.5;

/// Whether `candidate` may be absorbed into a cluster anchored at `anchor`.
pub fn mergeable(anchor: &Property, candidate: &Property) -> bool {
    !anchor.is_hot_region()
        && !candidate.is_hot_region()
        && anchor.id == candidate.id
        && anchor.region_id == candidate.region_id
        && (anchor.severity - candidate.severity).abs() < SEVERITY_THRESHOLD
        && (anchor.confidence - candidate.confidence).abs() < CONFIDENCE_THRESHOLD
}

/// Clusters a batch by similarity. Unmerged properties pass through unchanged.
pub fn cluster(props: Vec<Property>) -> Vec<Property> {
    merge_by(props, mergeable)
}

/// Summarizes a batch per (id, region), ignoring the thresholds.
///
/// Every output is a cluster, even when it stands for a single finding.
pub fn gather(props: Vec<Property>) -> Vec<Property> {
    let same_site = |a: &Property, b: &Property| a.id == b.id && a.region_id == b.region_id;
    let mut out = merge_by(props, same_site);
    for prop in &mut out {
        if !prop.cluster {
            prop.exec_objs = prop.instances();
            prop.cluster = true;
        }
    }
    out
}

fn merge_by<F>(props: Vec<Property>, can_merge: F) -> Vec<Property>
where
    F: Fn(&Property, &Property) -> bool,
{
    let mut consumed = vec![false; props.len()];
    let mut out = Vec::with_capacity(props.len());

    for i in 0..props.len() {
        if consumed[i] {
            continue;
        }
        let anchor = &props[i];
        let members: Vec<usize> = (i + 1..props.len())
            .filter(|&j| !consumed[j] && can_merge(anchor, &props[j]))
            .collect();

        if members.is_empty() {
            out.push(anchor.clone());
            continue;
        }

        let mut merged = anchor.clone();
        merged.cluster = true;
        merged.exec_objs = anchor.instances();

        let mut severity = anchor.severity;
        let mut confidence = anchor.confidence;
        let mut regions: IndexSet<String> = anchor.regions().into_iter().collect();

        for &j in &members {
            consumed[j] = true;
            let member = &props[j];
            severity += member.severity;
            confidence += member.confidence;
            merged.exec_objs.extend(member.instances());
            if anchor.is_required_regions() {
                regions.extend(member.regions());
            }
        }

        let instances = (members.len() + 1) as f64;
        merged.severity = severity / instances;
        merged.confidence = confidence / instances;
        if anchor.is_required_regions() {
            let joined = regions.into_iter().collect::<Vec<_>>().join("\n");
            merged.extra_info.insert(REGIONS_KEY.to_string(), joined);
        }
        out.push(merged);
    }
    out
}
