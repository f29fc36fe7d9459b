//! Scene tree: arena of nodes plus parent/children links.
//!
//! Nodes are stored as `Arc<SceneNode>` so that a background solve can take a
//! snapshot in microseconds (clone the Arcs, release the lock) and evaluate it
//! while the UI keeps editing. Edits go through [`Scene::edit`], which clones
//! on write and bumps the revision counter that views use for invalidation.
//!
//! Structural invariants (no cycles, sane fades and time parameters) are
//! enforced here, at attach/edit time, never during evaluation.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;

use super::node::{NodeSample, SceneNode};
use super::NodeId;
use crate::error::{CutstripError, CutstripResult};

#[derive(Debug, Clone)]
pub struct Scene {
    root: NodeId,
    nodes: HashMap<NodeId, Arc<SceneNode>>,
    parents: HashMap<NodeId, NodeId>,
    children: HashMap<NodeId, Vec<NodeId>>,
    revision: u64,
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}

impl Scene {
    /// Empty scene with an identity root.
    pub fn new() -> Self {
        let root = SceneNode::new("Root");
        let id = root.id;
        let mut nodes = HashMap::new();
        nodes.insert(id, Arc::new(root));
        Self {
            root: id,
            nodes,
            parents: HashMap::new(),
            children: HashMap::new(),
            revision: 0,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Monotonic edit counter.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    pub fn get(&self, id: NodeId) -> Option<&Arc<SceneNode>> {
        self.nodes.get(&id)
    }

    pub fn parent_of(&self, id: NodeId) -> Option<NodeId> {
        self.parents.get(&id).copied()
    }

    pub fn children_of(&self, id: NodeId) -> &[NodeId] {
        self.children.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Insert `node` as the last child of `parent`.
    pub fn attach(&mut self, parent: NodeId, node: SceneNode) -> CutstripResult<NodeId> {
        if !self.nodes.contains_key(&parent) {
            return Err(CutstripError::UnknownNode(parent));
        }
        if self.nodes.contains_key(&node.id) {
            return Err(CutstripError::CyclicParent { parent, child: node.id });
        }
        validate(&node)?;
        let id = node.id;
        self.nodes.insert(id, Arc::new(node));
        self.parents.insert(id, parent);
        self.children.entry(parent).or_default().push(id);
        self.revision += 1;
        debug!("Attached node {} under {}", id, parent);
        Ok(id)
    }

    /// Move `child` (with its subtree) under `new_parent`.
    pub fn reparent(&mut self, child: NodeId, new_parent: NodeId) -> CutstripResult<()> {
        if child == self.root {
            return Err(CutstripError::RootImmutable);
        }
        if !self.nodes.contains_key(&child) {
            return Err(CutstripError::UnknownNode(child));
        }
        if !self.nodes.contains_key(&new_parent) {
            return Err(CutstripError::UnknownNode(new_parent));
        }
        // walk up from the new parent; meeting `child` means a cycle
        let mut cursor = Some(new_parent);
        while let Some(id) = cursor {
            if id == child {
                return Err(CutstripError::CyclicParent { parent: new_parent, child });
            }
            cursor = self.parents.get(&id).copied();
        }
        if let Some(old) = self.parents.insert(child, new_parent) {
            if let Some(siblings) = self.children.get_mut(&old) {
                siblings.retain(|&c| c != child);
            }
        }
        self.children.entry(new_parent).or_default().push(child);
        self.revision += 1;
        Ok(())
    }

    /// Mutate one node. The change is rolled back if it breaks validation.
    pub fn edit<F>(&mut self, id: NodeId, f: F) -> CutstripResult<()>
    where
        F: FnOnce(&mut SceneNode),
    {
        let slot = self.nodes.get_mut(&id).ok_or(CutstripError::UnknownNode(id))?;
        let mut node = SceneNode::clone(slot);
        f(&mut node);
        node.id = id;
        validate(&node)?;
        *slot = Arc::new(node);
        self.revision += 1;
        Ok(())
    }

    /// Delete a node and its whole subtree. Returns the removed nodes so the
    /// caller can drop caches that referenced them.
    pub fn remove(&mut self, id: NodeId) -> CutstripResult<Vec<Arc<SceneNode>>> {
        if id == self.root {
            return Err(CutstripError::RootImmutable);
        }
        if !self.nodes.contains_key(&id) {
            return Err(CutstripError::UnknownNode(id));
        }
        if let Some(parent) = self.parents.remove(&id) {
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.retain(|&c| c != id);
            }
        }
        let mut removed = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if let Some(kids) = self.children.remove(&next) {
                stack.extend(kids);
            }
            self.parents.remove(&next);
            if let Some(node) = self.nodes.remove(&next) {
                removed.push(node);
            }
        }
        self.revision += 1;
        debug!("Removed node {} ({} nodes with subtree)", id, removed.len());
        Ok(removed)
    }

    /// Chain from the root down to `id`, inclusive.
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut chain = Vec::new();
        let mut cursor = self.nodes.contains_key(&id).then_some(id);
        while let Some(c) = cursor {
            chain.push(c);
            cursor = self.parents.get(&c).copied();
        }
        chain.reverse();
        chain
    }

    /// Evaluate time and color of `id` at a global time by walking its chain.
    pub fn evaluate(&self, id: NodeId, global_time: f64) -> Option<NodeSample> {
        let chain = self.ancestors(id);
        if chain.is_empty() {
            return None;
        }
        let mut sample = NodeSample::root(global_time);
        for node_id in chain {
            sample = self.nodes.get(&node_id)?.evaluate(sample);
        }
        Some(sample)
    }

    pub fn local_time_from_root(&self, id: NodeId, global_time: f64) -> Option<f64> {
        self.evaluate(id, global_time).map(|s| s.time)
    }

    /// Nodes on the chain to `id`, root first.
    pub fn chain(&self, id: NodeId) -> Vec<Arc<SceneNode>> {
        self.ancestors(id)
            .into_iter()
            .filter_map(|n| self.nodes.get(&n).cloned())
            .collect()
    }

    /// Every node whose subtree contains a node on `track_index`, ordered so
    /// that parents precede children.
    pub fn retained_for_track(&self, track_index: i32) -> RetainedTree {
        let mut post = Vec::new();
        self.collect_retained(self.root, track_index, &mut post);
        post.reverse();

        let index_of: HashMap<NodeId, usize> =
            post.iter().enumerate().map(|(i, n)| (*n, i)).collect();
        let nodes: Vec<Arc<SceneNode>> = post
            .iter()
            .filter_map(|id| self.nodes.get(id).cloned())
            .collect();
        let parents = post
            .iter()
            .map(|id| self.parents.get(id).and_then(|p| index_of.get(p).copied()))
            .collect();
        // draw order = post-order: children before parents, earlier siblings first
        let drawn = (0..nodes.len())
            .rev()
            .filter(|&i| nodes[i].track_index == track_index)
            .collect();

        RetainedTree { track_index, nodes, parents, drawn, revision: self.revision }
    }

    fn collect_retained(&self, id: NodeId, track_index: i32, out: &mut Vec<NodeId>) -> bool {
        let mut required = false;
        for &child in self.children_of(id) {
            // no short-circuit: every subtree must be collected
            required |= self.collect_retained(child, track_index, out);
        }
        let own = self.nodes.get(&id).is_some_and(|n| n.track_index == track_index);
        if required || own {
            out.push(id);
        }
        required || own
    }

    /// Track indices in use, sorted.
    pub fn tracks(&self) -> Vec<i32> {
        let mut tracks: Vec<i32> = self
            .nodes
            .values()
            .map(|n| n.track_index)
            .filter(|&t| t >= 0)
            .collect();
        tracks.sort_unstable();
        tracks.dedup();
        tracks
    }
}

fn validate(node: &SceneNode) -> CutstripResult<()> {
    for (label, fade) in [("fade in", &node.fade_in), ("fade out", &node.fade_out)] {
        let bad = fade
            .keys()
            .iter()
            .map(|k| k.value)
            .chain(std::iter::once(*fade.default_value()))
            .find(|v| !v.is_finite() || *v < 0.0);
        if let Some(v) = bad {
            return Err(CutstripError::InvalidFade {
                node: node.id,
                reason: format!("{} must be finite and >= 0, got {}", label, v),
            });
        }
    }
    if !node.time_offset.is_finite() {
        return Err(CutstripError::InvalidTime {
            node: node.id,
            reason: format!("time offset {}", node.time_offset),
        });
    }
    if !node.time_dilation.is_finite() {
        return Err(CutstripError::InvalidTime {
            node: node.id,
            reason: format!("time dilation {}", node.time_dilation),
        });
    }
    if node.start_time.is_nan() || node.end_time.is_nan() || node.start_time > node.end_time {
        return Err(CutstripError::InvalidTime {
            node: node.id,
            reason: format!("range [{}, {}]", node.start_time, node.end_time),
        });
    }
    Ok(())
}

/// Snapshot of the nodes a track view needs, flattened for the solver.
///
/// `nodes[0]` is the scene root whenever the tree is non-empty. Each entry's
/// parent index is smaller than its own index, so a single forward pass
/// evaluates the whole hierarchy.
#[derive(Debug, Clone)]
pub struct RetainedTree {
    pub track_index: i32,
    pub nodes: Vec<Arc<SceneNode>>,
    pub parents: Vec<Option<usize>>,
    /// Indices of nodes on the track, in draw order.
    pub drawn: Vec<usize>,
    /// Scene revision the snapshot was taken at.
    pub revision: u64,
}

impl RetainedTree {
    pub fn is_empty(&self) -> bool {
        self.drawn.is_empty()
    }

    /// Evaluate every retained node at `global_time` into `out`.
    pub fn evaluate_into(&self, global_time: f64, out: &mut Vec<NodeSample>) {
        out.clear();
        for (i, node) in self.nodes.iter().enumerate() {
            let parent = match self.parents[i] {
                Some(p) => out[p],
                None => NodeSample::root(global_time),
            };
            out.push(node.evaluate(parent));
        }
    }

    /// True if any retained node warps time non-linearly.
    pub fn has_animated_time(&self) -> bool {
        self.nodes.iter().any(|n| n.has_animated_time())
    }

    pub fn index_of(&self, id: NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == id)
    }

    /// Indices from the snapshot root down to `index`.
    pub fn chain_indices(&self, index: usize) -> Vec<usize> {
        let mut chain = vec![index];
        let mut cur = index;
        while let Some(p) = self.parents.get(cur).copied().flatten() {
            chain.push(p);
            cur = p;
        }
        chain.reverse();
        chain
    }

    /// Evaluate only the chain leading to `index`.
    pub fn sample_of(&self, index: usize, global_time: f64) -> NodeSample {
        self.chain_indices(index)
            .into_iter()
            .fold(NodeSample::root(global_time), |parent, i| self.nodes[i].evaluate(parent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::AnimatedValue;
    use glam::Vec4;

    #[test]
    fn test_attach_and_evaluate_chain() {
        let mut scene = Scene::new();
        let group = scene
            .attach(scene.root(), SceneNode::new("group").with_time(1.0, 2.0))
            .expect("attach group");
        let clip = scene
            .attach(group, SceneNode::new("clip").with_time(0.5, 1.0).with_track(0))
            .expect("attach clip");

        // (3 - 1) * 2 = 4, then 4 - 0.5
        assert_eq!(scene.local_time_from_root(clip, 3.0), Some(3.5));
        assert_eq!(scene.ancestors(clip), vec![scene.root(), group, clip]);
        assert_eq!(scene.tracks(), vec![0]);
    }

    #[test]
    fn test_reparent_rejects_cycles() {
        let mut scene = Scene::new();
        let a = scene.attach(scene.root(), SceneNode::new("a")).expect("a");
        let b = scene.attach(a, SceneNode::new("b")).expect("b");
        let err = scene.reparent(a, b).unwrap_err();
        assert!(matches!(err, CutstripError::CyclicParent { .. }));
        assert!(matches!(scene.reparent(a, a), Err(CutstripError::CyclicParent { .. })));
        assert!(matches!(
            scene.reparent(scene.root(), a),
            Err(CutstripError::RootImmutable)
        ));
    }

    #[test]
    fn test_invalid_fade_rejected_at_attach() {
        let mut scene = Scene::new();
        let node = SceneNode::new("bad").with_fades(-1.0, 0.0);
        let err = scene.attach(scene.root(), node).unwrap_err();
        assert!(matches!(err, CutstripError::InvalidFade { .. }));
        assert_eq!(scene.len(), 1);
    }

    #[test]
    fn test_edit_rolls_back_invalid_change() {
        let mut scene = Scene::new();
        let id = scene.attach(scene.root(), SceneNode::new("n")).expect("n");
        let rev = scene.revision();
        let err = scene.edit(id, |n| n.time_dilation = f64::NAN).unwrap_err();
        assert!(matches!(err, CutstripError::InvalidTime { .. }));
        assert_eq!(scene.revision(), rev);
        assert_eq!(scene.get(id).map(|n| n.time_dilation), Some(1.0));

        scene
            .edit(id, |n| n.color = AnimatedValue::constant(Vec4::new(1.0, 0.0, 0.0, 1.0)))
            .expect("valid edit");
        assert!(scene.revision() > rev);
    }

    #[test]
    fn test_remove_cascades() {
        let mut scene = Scene::new();
        let a = scene.attach(scene.root(), SceneNode::new("a")).expect("a");
        let b = scene.attach(a, SceneNode::new("b")).expect("b");
        let _c = scene.attach(b, SceneNode::new("c")).expect("c");
        let removed = scene.remove(a).expect("remove");
        assert_eq!(removed.len(), 3);
        assert_eq!(scene.len(), 1);
        assert!(scene.children_of(scene.root()).is_empty());
        assert!(matches!(scene.remove(scene.root()), Err(CutstripError::RootImmutable)));
    }

    #[test]
    fn test_retained_tree_keeps_ancestors_and_orders_parents_first() {
        let mut scene = Scene::new();
        let group = scene.attach(scene.root(), SceneNode::new("group")).expect("group");
        let a = scene.attach(group, SceneNode::new("a").with_track(1)).expect("a");
        let b = scene.attach(group, SceneNode::new("b").with_track(1)).expect("b");
        let _other = scene.attach(scene.root(), SceneNode::new("other").with_track(2)).expect("other");

        let tree = scene.retained_for_track(1);
        assert_eq!(tree.nodes.len(), 4);
        assert_eq!(tree.nodes[0].id, scene.root());
        assert_eq!(tree.parents[0], None);
        for (i, p) in tree.parents.iter().enumerate().skip(1) {
            assert!(p.is_some_and(|p| p < i));
        }
        let drawn: Vec<NodeId> = tree.drawn.iter().map(|&i| tree.nodes[i].id).collect();
        assert_eq!(drawn, vec![a, b]);
    }

    #[test]
    fn test_retained_tree_empty_when_track_unused() {
        let mut scene = Scene::new();
        scene.attach(scene.root(), SceneNode::new("a").with_track(0)).expect("a");
        let tree = scene.retained_for_track(7);
        assert!(tree.is_empty());
        assert!(tree.nodes.is_empty());
    }

    #[test]
    fn test_evaluate_into_matches_chain_walk() {
        let mut scene = Scene::new();
        let g = scene
            .attach(scene.root(), SceneNode::new("g").with_time(1.0, 0.5).with_color(Vec4::splat(0.5)))
            .expect("g");
        let c = scene
            .attach(g, SceneNode::new("c").with_track(0).with_time(-2.0, 3.0))
            .expect("c");
        let tree = scene.retained_for_track(0);
        let mut out = Vec::new();
        tree.evaluate_into(7.25, &mut out);
        let idx = tree.drawn[0];
        let walked = scene.evaluate(c, 7.25).expect("walk");
        assert_eq!(out[idx], walked);
        // determinism: evaluating again gives bit-identical results
        let mut again = Vec::new();
        tree.evaluate_into(7.25, &mut again);
        assert_eq!(out, again);
    }
}
