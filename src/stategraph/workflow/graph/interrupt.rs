//! Interrupt-before handling

use std::collections::BTreeSet;

/// Decides whether a run pauses before a node.
///
/// Configured once when the graph is compiled. A resume releases the nodes it
/// paused before for the next superstep only; reaching them again pauses again.
#[derive(Debug, Clone, Default)]
pub struct InterruptController {
    before: BTreeSet<String>,
}

impl InterruptController {
    pub fn new<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            before: nodes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn should_pause(&self, node: &str) -> bool {
        self.before.contains(node)
    }

    /// Interrupt nodes among `scheduled` that were not released yet
    pub fn pausing<'a>(
        &self,
        scheduled: impl IntoIterator<Item = &'a String>,
        released: &BTreeSet<String>,
    ) -> BTreeSet<String> {
        scheduled
            .into_iter()
            .filter(|node| self.should_pause(node) && !released.contains(*node))
            .cloned()
            .collect()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &String> {
        self.before.iter()
    }
}
