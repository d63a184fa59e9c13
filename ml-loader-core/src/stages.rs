//! Basic stages: in-memory item sampler, closure-backed map and end marker

use std::sync::Arc;

use crate::error::Result;
use crate::graph::Upstream;
use crate::item::Item;
use crate::stage::{ItemStream, OpenContext, Role, Stage};

/// Source stage yielding a fixed list of items, restartable on every open
pub struct ItemSampler<T> {
    name: String,
    items: Arc<Vec<T>>,
}

impl<T> ItemSampler<T> {
    /// Create a sampler over `items`
    pub fn new(items: impl IntoIterator<Item = T>) -> Self {
        Self {
            name: "item_sampler".to_string(),
            items: Arc::new(items.into_iter().collect()),
        }
    }

    /// Set the stage name
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Number of items per pass
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the sampler yields nothing
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

struct SamplerIter<T> {
    items: Arc<Vec<T>>,
    position: usize,
}

impl<T: Clone> Iterator for SamplerIter<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.items.get(self.position)?.clone();
        self.position += 1;
        Some(Ok(item))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.items.len().saturating_sub(self.position);
        (remaining, Some(remaining))
    }
}

impl<T: Item + Clone + Sync> Stage<T> for ItemSampler<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> Role {
        Role::ItemSampler
    }

    fn open(&self, _upstream: Upstream<T>, _ctx: &OpenContext) -> Result<ItemStream<T>> {
        Ok(Box::new(SamplerIter {
            items: self.items.clone(),
            position: 0,
        }))
    }
}

/// Stage applying a closure to every item of its single parent
///
/// The closure receives the context the stage was opened with, which is how a
/// feature fetcher reaches the alternate stream attached to it.
pub struct MapStage<F> {
    name: String,
    role: Role,
    func: Arc<F>,
}

impl<F> MapStage<F> {
    /// Create a transform stage
    pub fn new<T>(name: impl Into<String>, func: F) -> Self
    where
        T: Item,
        F: Fn(T, &OpenContext) -> Result<T> + Send + Sync + 'static,
    {
        Self::with_role(name, Role::Transform, func)
    }

    /// Create a stage with an explicit role
    pub fn with_role<T>(name: impl Into<String>, role: Role, func: F) -> Self
    where
        T: Item,
        F: Fn(T, &OpenContext) -> Result<T> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            role,
            func: Arc::new(func),
        }
    }

    /// Create a feature-fetching stage
    pub fn feature_fetcher<T>(name: impl Into<String>, func: F) -> Self
    where
        T: Item,
        F: Fn(T, &OpenContext) -> Result<T> + Send + Sync + 'static,
    {
        Self::with_role(name, Role::FeatureFetcher, func)
    }

    /// Create a device-copy stage
    pub fn copy_to<T>(name: impl Into<String>, func: F) -> Self
    where
        T: Item,
        F: Fn(T, &OpenContext) -> Result<T> + Send + Sync + 'static,
    {
        Self::with_role(name, Role::DeviceCopy, func)
    }
}

impl<T, F> Stage<T> for MapStage<F>
where
    T: Item,
    F: Fn(T, &OpenContext) -> Result<T> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> Role {
        self.role.clone()
    }

    fn open(&self, upstream: Upstream<T>, ctx: &OpenContext) -> Result<ItemStream<T>> {
        let input = upstream.open_single(ctx)?;
        let func = self.func.clone();
        let ctx = ctx.clone();
        Ok(Box::new(input.map(move |item| item.and_then(|item| func(item, &ctx)))))
    }
}

/// No-op stage marking the end of a pipeline
#[derive(Debug, Clone, Default)]
pub struct EndMarker;

impl EndMarker {
    /// Create an end marker
    pub fn new() -> Self {
        Self
    }
}

impl<T: Item> Stage<T> for EndMarker {
    fn name(&self) -> &str {
        "end_marker"
    }

    fn role(&self) -> Role {
        Role::EndMarker
    }

    fn open(&self, upstream: Upstream<T>, ctx: &OpenContext) -> Result<ItemStream<T>> {
        upstream.open_single(ctx)
    }
}
