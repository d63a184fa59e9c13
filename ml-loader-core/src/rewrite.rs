//! Rewrite passes: structural substitution of stages with wrapped equivalents

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::graph::{Adjacency, Graph, StageId};
use crate::item::Item;
use crate::stage::{Role, Stage};

/// Factory for the stages a rewrite pass inserts
pub trait StageWrapper<T: Item> {
    /// Role of every stage this wrapper produces
    fn role(&self) -> Role;

    /// Build a wrapper pulling from `target`
    fn wrap(&self, target: &dyn Stage<T>) -> Result<Arc<dyn Stage<T>>>;
}

/// Wrap every distinct parent of the stages matching `role`
///
/// Each parent is replaced, wherever it is referenced, by a single wrapper
/// stage pulling from it. Parents that already carry the wrapper's role are
/// left alone, so repeating a pass does not stack wrappers. Returns the ids of
/// the inserted wrappers.
pub fn wrap_parents_of<T: Item>(
    graph: &mut Graph<T>,
    index: &Adjacency<T>,
    role: &Role,
    wrapper: &dyn StageWrapper<T>,
) -> Result<Vec<StageId>> {
    index.ensure_current(graph)?;

    let mut parents = BTreeSet::new();
    for stage in graph.find(role) {
        if let Some(ids) = index.parents_of(stage) {
            parents.extend(ids.iter().copied());
        }
    }

    let wrapper_role = wrapper.role();
    let mut inserted = Vec::new();
    for parent in parents {
        if graph.role(parent)? == wrapper_role {
            continue;
        }
        inserted.push(substitute(graph, parent, wrapper)?);
    }

    debug!(
        target_role = %role,
        wrapper = %wrapper_role,
        inserted = inserted.len(),
        revision = graph.revision(),
        "Wrapped parents"
    );
    Ok(inserted)
}

/// Wrap every stage matching `role` itself
///
/// A matched stage whose children all carry the wrapper's role is already
/// wrapped and is skipped. Returns the ids of the inserted wrappers.
pub fn wrap_stages<T: Item>(
    graph: &mut Graph<T>,
    role: &Role,
    wrapper: &dyn StageWrapper<T>,
) -> Result<Vec<StageId>> {
    let wrapper_role = wrapper.role();
    let mut inserted = Vec::new();

    for stage in graph.find(role) {
        let children = graph.children_of(stage);
        let already_wrapped = !children.is_empty()
            && children
                .iter()
                .map(|child| graph.role(*child))
                .collect::<Result<Vec<_>>>()?
                .iter()
                .all(|child_role| *child_role == wrapper_role);
        if already_wrapped {
            continue;
        }
        inserted.push(substitute(graph, stage, wrapper)?);
    }

    debug!(
        target_role = %role,
        wrapper = %wrapper_role,
        inserted = inserted.len(),
        revision = graph.revision(),
        "Wrapped stages"
    );
    Ok(inserted)
}

/// Insert a wrapper above `target` and point every referencer at it
fn substitute<T: Item>(
    graph: &mut Graph<T>,
    target: StageId,
    wrapper: &dyn StageWrapper<T>,
) -> Result<StageId> {
    let referencers = graph.children_of(target);
    let stage = wrapper.wrap(graph.stage(target)?.as_ref())?;
    let wrapped = graph.insert(stage, vec![target]);

    for child in &referencers {
        graph.redirect(*child, target, wrapped);
    }
    if graph.root() == target {
        graph.set_root(wrapped);
    }
    graph.bump_revision();

    debug!(
        target = %target,
        wrapper = %wrapped,
        referencers = referencers.len(),
        "Substituted stage"
    );
    Ok(wrapped)
}
