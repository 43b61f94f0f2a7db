//! Backward traversal over the declared graph.
//!
//! A run may contain several samplers and checkpoints, only some of which
//! are wired into the path that produced the final image. The tracer walks
//! references from a known node (usually the first decoder) back towards the
//! loaders, so that disconnected nodes never leak into the result.
//!
//! Every walk is breadth-first, keeps a visited set, and stops after
//! [`Tracer::max_depth`] hops. Cycles and dangling references therefore end
//! in "not found" instead of looping or guessing.

use std::collections::{HashSet, VecDeque};

use crate::config::Config;
use crate::graph::Workflow;
use crate::metadata::{Metadata, ModelKind, SamplingRecord};

/// Where to start looking for the checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin<'a> {
    /// A node downstream of the sampler, usually the first decoder.
    Anchor(&'a str),
    /// The sampler itself.
    Sampler(&'a str),
    /// The most recently recorded primary sampler.
    Latest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tracer {
    max_depth: usize,
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new(Config::default().max_trace_depth)
    }
}

/// Which producers of a visited node a walk moves on to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Follow {
    /// Every producer.
    Every,
    /// Only the producers on the best ranked inputs the node has.
    Preferred,
}

fn model_first(input: &str) -> u8 {
    u8::from(input != "model")
}

impl Tracer {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Bounded breadth-first walk over references, starting at `start`.
    ///
    /// Producers of each node are queued ordered by `rank`, lowest first.
    /// With [`Follow::Preferred`] only the producers sharing the lowest rank
    /// are queued. Returns the first node accepted by `visit`.
    fn search<'g>(
        &self,
        graph: &'g Workflow,
        start: &str,
        follow: Follow,
        rank: impl Fn(&str) -> u8,
        mut visit: impl FnMut(&'g str) -> bool,
    ) -> Option<&'g str> {
        let start = graph.key(start)?;

        let mut queue = VecDeque::from([(start, 0usize)]);
        let mut seen = HashSet::from([start]);

        while let Some((id, depth)) = queue.pop_front() {
            if visit(id) {
                return Some(id);
            }

            if depth >= self.max_depth {
                continue;
            }

            let mut producers = graph.upstream(id);
            producers.sort_by_key(|&(input, _)| rank(input));

            let best = producers.first().map(|&(input, _)| rank(input));
            if let (Follow::Preferred, Some(best)) = (follow, best) {
                producers.retain(|&(input, _)| rank(input) == best);
            }

            for (_, producer) in producers {
                if seen.insert(producer) {
                    queue.push_back((producer, depth + 1));
                }
            }
        }

        None
    }

    /// Every node reachable backwards from `start`, nearest first, `start`
    /// included.
    pub fn reachable<'g>(&self, graph: &'g Workflow, start: &str) -> Vec<&'g str> {
        let mut order = Vec::new();
        self.search(graph, start, Follow::Every, model_first, |id| {
            order.push(id);
            false
        });
        order
    }

    /// The primary sampler that produced `anchor`.
    ///
    /// Without an anchor or a declared graph the most recently recorded
    /// primary candidate is returned instead.
    pub fn find_primary_sampler<'m>(
        &self,
        metadata: &'m Metadata,
        anchor: Option<&str>,
    ) -> Option<(&'m str, &'m SamplingRecord)> {
        let is_candidate = |id: &str| {
            metadata
                .sampling
                .get(id)
                .is_some_and(|record| record.is_primary_candidate)
        };

        let (Some(anchor), Some(graph)) = (anchor, metadata.graph()) else {
            return latest_sampler(metadata);
        };

        let Some(found) = self.search(graph, anchor, Follow::Every, model_first, is_candidate) else {
            tracing::debug!(anchor, "no primary sampler upstream");
            return None;
        };

        metadata
            .sampling
            .get_key_value(found)
            .map(|(id, record)| (id.as_str(), record))
    }

    /// Nearest node upstream of `start` holding a checkpoint record.
    ///
    /// The `model` chain is walked first, so a checkpoint feeding another
    /// input (the latent of a refiner pass, say) never wins over the one
    /// loading the model. Nodes without a `model` input, such as bundlers,
    /// are passed through on all their references. Only when that walk finds
    /// nothing is every reference followed.
    pub fn trace_model_path(&self, metadata: &Metadata, graph: &Workflow, start: &str) -> Option<String> {
        let is_checkpoint = |id: &str| {
            metadata
                .models
                .get(id)
                .is_some_and(|record| record.kind == ModelKind::Checkpoint)
        };

        let found = self
            .search(graph, start, Follow::Preferred, model_first, is_checkpoint)
            .or_else(|| self.search(graph, start, Follow::Every, model_first, is_checkpoint));

        if found.is_none() {
            tracing::debug!(start, "no checkpoint upstream");
        }

        found.map(str::to_string)
    }

    /// Name of the checkpoint feeding the primary sampler.
    pub fn find_primary_checkpoint(&self, metadata: &Metadata, origin: Origin<'_>) -> Option<String> {
        let Some(graph) = metadata.graph() else {
            // Without a graph only an unambiguous record can be trusted.
            let mut checkpoints = metadata
                .models
                .values()
                .filter(|record| record.kind == ModelKind::Checkpoint);

            return match (checkpoints.next(), checkpoints.next()) {
                (Some(only), None) => Some(only.name.clone()),
                _ => None,
            };
        };

        let sampler = match origin {
            Origin::Sampler(id) => id,
            Origin::Anchor(anchor) => self.find_primary_sampler(metadata, Some(anchor))?.0,
            Origin::Latest => self.find_primary_sampler(metadata, None)?.0,
        };

        let node_id = self.trace_model_path(metadata, graph, sampler)?;
        metadata.models.get(&node_id).map(|record| record.name.clone())
    }

    /// Follows `input` of `node_id` back until a node of `target_class`.
    ///
    /// With no target class the direct producer is returned.
    pub fn trace_node_input(
        &self,
        graph: &Workflow,
        node_id: &str,
        input: &str,
        target_class: Option<&str>,
    ) -> Option<String> {
        let found = self.trace_input_until(graph, node_id, input, |id| match target_class {
            Some(class) => graph.class_of(id) == Some(class),
            None => true,
        });

        found.map(str::to_string)
    }

    /// Follows `input` of `node_id` back until `accept` holds.
    ///
    /// On each node only the inputs named like the traced one are followed.
    /// Failing those the conditioning inputs are, and failing both every
    /// reference. A node splitting positive from negative thus never leaks
    /// one branch into the other.
    pub(crate) fn trace_input_until<'g>(
        &self,
        graph: &'g Workflow,
        node_id: &str,
        input: &str,
        accept: impl Fn(&str) -> bool,
    ) -> Option<&'g str> {
        let (producer, _) = graph.get(node_id)?.inputs.get(input)?.as_reference()?;

        let rank = |name: &str| {
            if name == input {
                0
            } else if name.contains("conditioning") {
                1
            } else {
                2
            }
        };

        let found = self.search(graph, producer, Follow::Preferred, rank, accept);

        if found.is_none() {
            tracing::debug!(node_id, input, "input trace ended");
        }

        found
    }
}

/// Latest primary candidate in execution order, else the last one by id.
fn latest_sampler(metadata: &Metadata) -> Option<(&str, &SamplingRecord)> {
    let candidate = |id: &str| {
        metadata
            .sampling
            .get_key_value(id)
            .filter(|(_, record)| record.is_primary_candidate)
            .map(|(id, record)| (id.as_str(), record))
    };

    metadata
        .execution_order
        .iter()
        .rev()
        .find_map(|id| candidate(id.as_str()))
        .or_else(|| {
            metadata
                .sampling
                .iter()
                .filter(|(_, record)| record.is_primary_candidate)
                .map(|(id, record)| (id.as_str(), record))
                .next_back()
        })
}

pub fn find_primary_sampler<'m>(
    metadata: &'m Metadata,
    anchor: Option<&str>,
) -> Option<(&'m str, &'m SamplingRecord)> {
    Tracer::default().find_primary_sampler(metadata, anchor)
}

pub fn trace_model_path(metadata: &Metadata, graph: &Workflow, start: &str) -> Option<String> {
    Tracer::default().trace_model_path(metadata, graph, start)
}

pub fn find_primary_checkpoint(metadata: &Metadata, origin: Origin<'_>) -> Option<String> {
    Tracer::default().find_primary_checkpoint(metadata, origin)
}

pub fn trace_node_input(
    graph: &Workflow,
    node_id: &str,
    input: &str,
    target_class: Option<&str>,
) -> Option<String> {
    Tracer::default().trace_node_input(graph, node_id, input, target_class)
}
