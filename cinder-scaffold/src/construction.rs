//! Renderer construction: aggregating scaffolds per drawable element.
//!
//! A [`RendererConstruction`] collects `(model, material, skeleton)`
//! scaffold references per element, together with an element-to-object
//! matrix, a deformer bind point and an element name. Scaffold loads are
//! asynchronous; readiness is observed by polling markers with an
//! explicit timeout rather than through any coroutine machinery.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use glam::Mat4;

use crate::hash::{hash64, hash_combine};
use crate::material_scaffold::MaterialScaffold;
use crate::model_scaffold::ModelScaffold;
use crate::skeleton::SkeletonScaffold;

/// Outcome of a readiness poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollResult {
    /// Every input scaffold resolved.
    Ready,
    /// The timeout expired with loads still pending; the caller may retry.
    Continue,
    /// At least one input scaffold failed to load.
    Invalid,
}

type MarkerSlot<T> = Arc<Mutex<Option<Result<Arc<T>, String>>>>;

/// A pending-or-resolved asset load.
///
/// The loader side keeps a clone and calls [`AssetMarker::fulfill`];
/// consumers poll with [`AssetMarker::try_actualize`].
#[derive(Debug)]
pub struct AssetMarker<T> {
    slot: MarkerSlot<T>,
}

impl<T> Clone for AssetMarker<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T> Default for AssetMarker<T> {
    fn default() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }
}

impl<T> AssetMarker<T> {
    pub fn pending() -> Self {
        Self::default()
    }

    pub fn ready(value: T) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(Ok(Arc::new(value))))),
        }
    }

    pub fn fulfill(&self, result: Result<T, String>) {
        *self.slot.lock().unwrap() = Some(result.map(Arc::new));
    }

    /// Resolved value, failure message, or `None` while still pending.
    pub fn try_actualize(&self) -> Option<Result<Arc<T>, String>> {
        self.slot.lock().unwrap().clone()
    }

    pub fn is_pending(&self) -> bool {
        self.slot.lock().unwrap().is_none()
    }
}

/// How a scaffold was specified: by name (hashable, reloadable) or by a
/// direct shared reference.
#[derive(Debug)]
pub enum ScaffoldSource<T> {
    Named { name: String, marker: AssetMarker<T> },
    Direct(Arc<T>),
}

impl<T> Clone for ScaffoldSource<T> {
    fn clone(&self) -> Self {
        match self {
            ScaffoldSource::Named { name, marker } => ScaffoldSource::Named {
                name: name.clone(),
                marker: marker.clone(),
            },
            ScaffoldSource::Direct(value) => ScaffoldSource::Direct(value.clone()),
        }
    }
}

impl<T> ScaffoldSource<T> {
    fn is_named(&self) -> bool {
        matches!(self, ScaffoldSource::Named { .. })
    }

    fn poll(&self) -> Option<Result<Arc<T>, String>> {
        match self {
            ScaffoldSource::Named { marker, .. } => marker.try_actualize(),
            ScaffoldSource::Direct(value) => Some(Ok(value.clone())),
        }
    }

    fn actualized(&self) -> Option<Arc<T>> {
        match self.poll() {
            Some(Ok(value)) => Some(value),
            _ => None,
        }
    }
}

/// One drawable element of a construction.
#[derive(Debug, Clone, Default)]
pub struct ConstructionElement {
    pub model: Option<ScaffoldSource<ModelScaffold>>,
    pub material: Option<ScaffoldSource<MaterialScaffold>>,
    pub skeleton: Option<ScaffoldSource<SkeletonScaffold>>,
    pub element_to_object: Mat4,
    pub deformer_bind_point: u64,
    pub name: String,
}

/// Re-requests fresh markers by name during [`RendererConstruction::reconstruct`].
pub trait ScaffoldResolver {
    fn model(&mut self, name: &str) -> AssetMarker<ModelScaffold>;
    fn material(&mut self, name: &str) -> AssetMarker<MaterialScaffold>;
    fn skeleton(&mut self, name: &str) -> AssetMarker<SkeletonScaffold>;
}

/// Builder aggregating scaffolds per drawable element.
#[derive(Debug, Clone, Default)]
pub struct RendererConstruction {
    elements: Vec<ConstructionElement>,
}

impl RendererConstruction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_element(&mut self, element: ConstructionElement) -> &mut Self {
        self.elements.push(element);
        self
    }

    pub fn elements(&self) -> &[ConstructionElement] {
        &self.elements
    }

    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    fn sources_pending(&self) -> bool {
        self.elements.iter().any(|e| {
            [
                e.model.as_ref().map(|s| s.poll().is_none()),
                e.material.as_ref().map(|s| s.poll().is_none()),
                e.skeleton.as_ref().map(|s| s.poll().is_none()),
            ]
            .into_iter()
            .flatten()
            .any(|pending| pending)
        })
    }

    fn any_source_failed(&self) -> bool {
        self.elements.iter().any(|e| {
            [
                e.model.as_ref().map(|s| matches!(s.poll(), Some(Err(_)))),
                e.material.as_ref().map(|s| matches!(s.poll(), Some(Err(_)))),
                e.skeleton.as_ref().map(|s| matches!(s.poll(), Some(Err(_)))),
            ]
            .into_iter()
            .flatten()
            .any(|failed| failed)
        })
    }

    /// Polls every pending scaffold load until all complete, one fails, or
    /// the timeout expires. Expiry returns [`PollResult::Continue`]; no
    /// partial work is rolled back and the builder stays usable.
    pub fn fulfill_when_not_pending(&self, timeout: Duration) -> PollResult {
        let deadline = Instant::now() + timeout;
        loop {
            if self.any_source_failed() {
                return PollResult::Invalid;
            }
            if !self.sources_pending() {
                return PollResult::Ready;
            }
            if Instant::now() >= deadline {
                return PollResult::Continue;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Deterministic hash of the construction.
    ///
    /// Only available when every scaffold was specified by name; direct
    /// shared references have no stable identity, so a construction
    /// holding one cannot be hashed.
    pub fn hash(&self) -> Option<u64> {
        let mut acc = hash64("renderer-construction");
        for element in &self.elements {
            for name_opt in [
                element.model.as_ref().map(source_name::<ModelScaffold>),
                element.material.as_ref().map(source_name::<MaterialScaffold>),
                element.skeleton.as_ref().map(source_name::<SkeletonScaffold>),
            ]
            .into_iter()
            .flatten()
            {
                acc = hash_combine(hash64(name_opt?), acc);
            }
            acc = hash_combine(hash64(&element.name), acc);
            acc = hash_combine(element.deformer_bind_point, acc);
            for value in element.element_to_object.to_cols_array() {
                acc = hash_combine(value.to_bits() as u64, acc);
            }
        }
        Some(acc)
    }

    /// Rebuilds the same logical construction, requesting fresh asset
    /// markers for every named scaffold. Supports hot reload after a
    /// dependency invalidation.
    pub fn reconstruct(&self, resolver: &mut dyn ScaffoldResolver) -> RendererConstruction {
        let mut result = RendererConstruction::new();
        for element in &self.elements {
            let mut fresh = ConstructionElement {
                element_to_object: element.element_to_object,
                deformer_bind_point: element.deformer_bind_point,
                name: element.name.clone(),
                ..Default::default()
            };
            fresh.model = element.model.as_ref().map(|s| match s {
                ScaffoldSource::Named { name, .. } => ScaffoldSource::Named {
                    name: name.clone(),
                    marker: resolver.model(name),
                },
                ScaffoldSource::Direct(value) => ScaffoldSource::Direct(value.clone()),
            });
            fresh.material = element.material.as_ref().map(|s| match s {
                ScaffoldSource::Named { name, .. } => ScaffoldSource::Named {
                    name: name.clone(),
                    marker: resolver.material(name),
                },
                ScaffoldSource::Direct(value) => ScaffoldSource::Direct(value.clone()),
            });
            fresh.skeleton = element.skeleton.as_ref().map(|s| match s {
                ScaffoldSource::Named { name, .. } => ScaffoldSource::Named {
                    name: name.clone(),
                    marker: resolver.skeleton(name),
                },
                ScaffoldSource::Direct(value) => ScaffoldSource::Direct(value.clone()),
            });
            result.add_element(fresh);
        }
        result
    }

    /// True when any held scaffold's dependency validation has gone
    /// non-zero.
    pub fn is_invalidated(&self) -> bool {
        self.elements.iter().any(|e| {
            e.model
                .as_ref()
                .and_then(|s| s.actualized())
                .is_some_and(|m| m.dependency_validation().validation_index() != 0)
                || e.material
                    .as_ref()
                    .and_then(|s| s.actualized())
                    .is_some_and(|m| m.dependency_validation().validation_index() != 0)
                || e.skeleton
                    .as_ref()
                    .and_then(|s| s.actualized())
                    .is_some_and(|m| m.dependency_validation().validation_index() != 0)
        })
    }
}

fn source_name<T>(source: &ScaffoldSource<T>) -> Option<&str> {
    match source {
        ScaffoldSource::Named { name, .. } => Some(name.as_str()),
        ScaffoldSource::Direct(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named_element(name: &str) -> ConstructionElement {
        ConstructionElement {
            model: Some(ScaffoldSource::Named {
                name: format!("{name}.gltf"),
                marker: AssetMarker::pending(),
            }),
            name: name.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_poll_times_out_while_pending() {
        let mut construction = RendererConstruction::new();
        construction.add_element(named_element("a"));
        let result = construction.fulfill_when_not_pending(Duration::from_millis(5));
        assert_eq!(result, PollResult::Continue);
        // the builder remains usable; a later fulfil flips it to ready
    }

    #[test]
    fn test_poll_reports_failure() {
        let marker = AssetMarker::<ModelScaffold>::pending();
        let mut construction = RendererConstruction::new();
        construction.add_element(ConstructionElement {
            model: Some(ScaffoldSource::Named {
                name: "broken.gltf".into(),
                marker: marker.clone(),
            }),
            ..Default::default()
        });
        marker.fulfill(Err("no visual scene".into()));
        assert_eq!(
            construction.fulfill_when_not_pending(Duration::from_millis(5)),
            PollResult::Invalid
        );
    }

    #[test]
    fn test_empty_construction_is_ready() {
        let construction = RendererConstruction::new();
        assert_eq!(
            construction.fulfill_when_not_pending(Duration::ZERO),
            PollResult::Ready
        );
    }

    #[test]
    fn test_hash_deterministic_for_named_sources() {
        let mut a = RendererConstruction::new();
        a.add_element(named_element("hull"));
        let mut b = RendererConstruction::new();
        b.add_element(named_element("hull"));
        assert_eq!(a.hash(), b.hash());
        assert!(a.hash().is_some());

        let mut c = RendererConstruction::new();
        c.add_element(named_element("mast"));
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn test_hash_order_sensitive() {
        let mut a = RendererConstruction::new();
        a.add_element(named_element("hull"));
        a.add_element(named_element("mast"));
        let mut b = RendererConstruction::new();
        b.add_element(named_element("mast"));
        b.add_element(named_element("hull"));
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_reconstruct_requests_fresh_markers() {
        struct CountingResolver {
            models: usize,
        }
        impl ScaffoldResolver for CountingResolver {
            fn model(&mut self, _: &str) -> AssetMarker<ModelScaffold> {
                self.models += 1;
                AssetMarker::pending()
            }
            fn material(&mut self, _: &str) -> AssetMarker<MaterialScaffold> {
                AssetMarker::pending()
            }
            fn skeleton(&mut self, _: &str) -> AssetMarker<SkeletonScaffold> {
                AssetMarker::pending()
            }
        }

        let mut construction = RendererConstruction::new();
        construction.add_element(named_element("hull"));
        construction.add_element(named_element("mast"));

        let mut resolver = CountingResolver { models: 0 };
        let fresh = construction.reconstruct(&mut resolver);
        assert_eq!(resolver.models, 2);
        assert_eq!(fresh.element_count(), 2);
        assert_eq!(fresh.hash(), construction.hash());
    }
}
