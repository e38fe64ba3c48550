//! Dependency ordering of image specs.
//!
//! Images name at most one parent. A parent is either another spec in the
//! same set, which must be built first, or a declared external image that
//! is assumed to exist already. Building walks the set parents-first and
//! removal walks it children-first.

use log::{debug, info};
use std::{
    cmp::Reverse,
    collections::{BTreeMap as Map, BTreeSet as Set, BinaryHeap},
    fmt,
};
use thiserror::Error;

use crate::models::{ImageName, ImageSpec};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OrderError {
    #[error("image {0} is declared more than once")]
    DuplicateImage(ImageName),

    #[error("image {image} depends on {parent}, which is neither defined nor declared external")]
    UnknownDependency { image: ImageName, parent: ImageName },

    #[error("cyclic dependency between images: {}", join_names(.unresolved))]
    CyclicDependency { unresolved: Vec<ImageName> },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SweepAction {
    Build,
    Remove,
}

impl fmt::Display for SweepAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SweepAction::Build => f.write_str("build"),
            SweepAction::Remove => f.write_str("removal"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SweepError {
    #[error(transparent)]
    Order(#[from] OrderError),

    /// The sweep stopped at `failed`. Nothing after it was attempted.
    #[error(
        "{action} of image {failed} failed after completing [{}]; not attempted: [{}]",
        join_names(.completed),
        join_names(.skipped)
    )]
    ActionFailure {
        action: SweepAction,
        failed: ImageName,
        completed: Vec<ImageName>,
        skipped: Vec<ImageName>,
        #[source]
        source: anyhow::Error,
    },
}

impl SweepError {
    /// Images that still need the action, starting with the one that failed.
    pub fn not_completed(&self) -> Vec<ImageName> {
        match self {
            SweepError::Order(_) => Vec::new(),
            SweepError::ActionFailure {
                failed, skipped, ..
            } => std::iter::once(failed.clone())
                .chain(skipped.iter().cloned())
                .collect(),
        }
    }
}

fn join_names(names: &[ImageName]) -> String {
    names
        .iter()
        .map(|name| name.0.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parent and child links between the specs of one input set, by position.
pub struct DependencyGraph<'a, C> {
    specs: &'a [ImageSpec<C>],
    parents: Vec<Option<usize>>,
    children: Vec<Vec<usize>>,
}

impl<'a, C> DependencyGraph<'a, C> {
    pub fn new(
        specs: &'a [ImageSpec<C>],
        external: &Set<ImageName>,
    ) -> Result<DependencyGraph<'a, C>, OrderError> {
        let mut positions = Map::new();
        for (index, spec) in specs.iter().enumerate() {
            if positions.insert(&spec.name, index).is_some() {
                return Err(OrderError::DuplicateImage(spec.name.clone()));
            }
        }

        let mut parents = vec![None; specs.len()];
        let mut children = vec![Vec::new(); specs.len()];

        for (index, spec) in specs.iter().enumerate() {
            let parent = match &spec.parent {
                Some(parent) => parent,
                None => continue,
            };

            match positions.get(parent) {
                Some(&parent_index) => {
                    parents[index] = Some(parent_index);
                    children[parent_index].push(index);
                }
                None if external.contains(parent) => {
                    debug!("image {} builds on external image {}", spec.name, parent);
                }
                None => {
                    return Err(OrderError::UnknownDependency {
                        image: spec.name.clone(),
                        parent: parent.clone(),
                    })
                }
            }
        }

        Ok(DependencyGraph {
            specs,
            parents,
            children,
        })
    }

    pub fn parent(&self, index: usize) -> Option<&'a ImageSpec<C>> {
        self.parents[index].map(|parent| &self.specs[parent])
    }

    pub fn children(&self, index: usize) -> impl Iterator<Item = &'a ImageSpec<C>> + '_ {
        let specs = self.specs;
        self.children[index].iter().map(move |&child| &specs[child])
    }

    /// Parents before children. Whenever several specs are ready the one
    /// declared first goes first.
    pub fn build_order(&self) -> Result<Vec<&'a ImageSpec<C>>, OrderError> {
        let mut pending: Vec<usize> = self
            .parents
            .iter()
            .map(|parent| if parent.is_some() { 1 } else { 0 })
            .collect();

        let mut ready: BinaryHeap<Reverse<usize>> = pending
            .iter()
            .enumerate()
            .filter(|&(_, &count)| count == 0)
            .map(|(index, _)| Reverse(index))
            .collect();

        let mut order = Vec::with_capacity(self.specs.len());
        while let Some(Reverse(index)) = ready.pop() {
            order.push(&self.specs[index]);

            for &child in self.children[index].iter() {
                pending[child] -= 1;
                if pending[child] == 0 {
                    ready.push(Reverse(child));
                }
            }
        }

        if order.len() != self.specs.len() {
            let unresolved = pending
                .iter()
                .enumerate()
                .filter(|&(_, &count)| count > 0)
                .map(|(index, _)| self.specs[index].name.clone())
                .collect();

            return Err(OrderError::CyclicDependency { unresolved });
        }

        Ok(order)
    }
}

pub fn compute_build_order<'a, C>(
    specs: &'a [ImageSpec<C>],
    external: &Set<ImageName>,
) -> Result<Vec<&'a ImageSpec<C>>, OrderError> {
    DependencyGraph::new(specs, external)?.build_order()
}

pub fn compute_removal_order<'a, C>(
    specs: &'a [ImageSpec<C>],
    external: &Set<ImageName>,
) -> Result<Vec<&'a ImageSpec<C>>, OrderError> {
    let mut order = compute_build_order(specs, external)?;
    order.reverse();
    Ok(order)
}

/// Calls `build` once per spec, parents first. Stops at the first failure.
pub fn build_all<C, F>(
    specs: &[ImageSpec<C>],
    external: &Set<ImageName>,
    build: F,
) -> Result<Vec<ImageName>, SweepError>
where
    F: FnMut(&ImageSpec<C>) -> anyhow::Result<()>,
{
    let order = compute_build_order(specs, external)?;
    sweep(SweepAction::Build, order, build)
}

/// Calls `remove` once per spec, children first. Stops at the first failure.
pub fn remove_all<C, F>(
    specs: &[ImageSpec<C>],
    external: &Set<ImageName>,
    remove: F,
) -> Result<Vec<ImageName>, SweepError>
where
    F: FnMut(&ImageSpec<C>) -> anyhow::Result<()>,
{
    let order = compute_removal_order(specs, external)?;
    sweep(SweepAction::Remove, order, remove)
}

fn sweep<C, F>(
    action: SweepAction,
    order: Vec<&ImageSpec<C>>,
    mut apply: F,
) -> Result<Vec<ImageName>, SweepError>
where
    F: FnMut(&ImageSpec<C>) -> anyhow::Result<()>,
{
    let mut completed = Vec::with_capacity(order.len());

    for (position, &spec) in order.iter().enumerate() {
        if let Err(source) = apply(spec) {
            let skipped = order[position + 1..]
                .iter()
                .map(|spec| spec.name.clone())
                .collect();

            return Err(SweepError::ActionFailure {
                action,
                failed: spec.name.clone(),
                completed,
                skipped,
                source,
            });
        }

        completed.push(spec.name.clone());
    }

    info!("{} finished for {} images", action, completed.len());

    Ok(completed)
}
