//! Track solver: evaluates a retained node tree once per pixel column and
//! compresses the drawable nodes into gradient segments.
//!
//! Cost is O(nodes x width) per solve. Nodes visible in one column beyond
//! `max_lines` are dropped for that column only.

use std::sync::Arc;
use std::time::Instant;

use log::debug;

use crate::config::EngineConfig;
use crate::entities::{NodeSample, RetainedTree};
use crate::timeline::gradient::GradientSegment;
use crate::timeline::mapping::TimeMapping;
use crate::timeline::solution::{StripeSolution, ThumbnailClaim};

const STEP: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackSolver {
    pub max_lines: usize,
    pub min_alpha: f32,
    pub min_dist_sq: f32,
    pub alpha_multiplier: f32,
}

impl Default for TrackSolver {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

impl TrackSolver {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            max_lines: config.max_lines.max(1),
            min_alpha: config.min_alpha,
            min_dist_sq: config.min_dist_sq,
            alpha_multiplier: config.alpha_multiplier,
        }
    }

    pub fn solve(&self, tree: Arc<RetainedTree>, mapping: TimeMapping) -> StripeSolution {
        let started = Instant::now();
        let mut solution = StripeSolution::new(mapping, Arc::clone(&tree), self.max_lines);
        if tree.is_empty() || mapping.x1 <= mapping.x0 {
            return solution;
        }

        let left_time = mapping.left_time();
        let dt = mapping.dt_per_pixel();
        let mut samples: Vec<NodeSample> = Vec::with_capacity(tree.nodes.len());
        // local time range per drawn video node, same order as tree.drawn
        let mut ranges: Vec<Option<(f64, f64)>> = vec![None; tree.drawn.len()];

        for x in mapping.x0..mapping.x1 {
            let global_time = left_time + (x - mapping.x0) as f64 * dt;
            tree.evaluate_into(global_time, &mut samples);

            let mut line_index = 0;
            for (k, &index) in tree.drawn.iter().enumerate() {
                let node = &tree.nodes[index];
                let sample = samples[index];
                if !node.is_visible(sample.time) {
                    continue;
                }
                if node.content.has_video_content() {
                    let t = sample.time;
                    ranges[k] = Some(match ranges[k] {
                        Some((lo, hi)) => (lo.min(t), hi.max(t)),
                        None => (t, t),
                    });
                }

                let alpha = sample.color.w * self.alpha_multiplier;
                if alpha < self.min_alpha {
                    continue;
                }
                let mut color = sample.color;
                color.w = alpha;

                let line = &mut solution.lines[line_index];
                match line.last_mut() {
                    Some(last)
                        if last.owner == node.id
                            && last.x1 + STEP >= x
                            && last.is_linear(x, STEP, color, self.min_dist_sq) =>
                    {
                        last.set_end(x, STEP, color)
                    }
                    Some(_) => line.push(GradientSegment::new(node.id, x - STEP + 1, x, color)),
                    None => line.push(GradientSegment::new(node.id, x, x, color)),
                }

                if line_index + 1 >= self.max_lines {
                    break;
                }
                line_index += 1;
            }
        }

        for line in &mut solution.lines {
            line.retain(|g| g.needs_drawn(self.min_alpha));
        }

        for (k, range) in ranges.into_iter().enumerate() {
            let Some((min_t, max_t)) = range else { continue };
            let node = &tree.nodes[tree.drawn[k]];
            // transparent by its own color and fades: nothing to show
            if node.max_alpha_in(min_t, max_t) * self.alpha_multiplier < self.min_alpha {
                continue;
            }
            solution.claims.push(ThumbnailClaim { node: node.id, min_t, max_t });
        }

        debug!(
            "Track {} solved in {:.2?}: {} nodes, {} px, {} segments",
            tree.track_index,
            started.elapsed(),
            tree.nodes.len(),
            mapping.width(),
            solution.segment_count()
        );
        solution
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::color::from_argb;
    use crate::entities::{AnimatedValue, MediaSource, NodeContent, Scene, SceneNode, SourceMeta};
    use glam::Vec4;

    fn mapping() -> TimeMapping {
        TimeMapping::from_window(0.0, 10.0, 0, 100)
    }

    #[test]
    fn test_constant_node_single_segment() {
        let mut scene = Scene::new();
        let id = scene.attach(scene.root(), SceneNode::new("n").with_track(0)).expect("attach");
        let sol = TrackSolver::default().solve(Arc::new(scene.retained_for_track(0)), mapping());
        assert_eq!(sol.segment_count(), 1);
        let g = &sol.lines[0][0];
        assert_eq!((g.owner, g.x0, g.x1), (id, 0, 99));
        assert_eq!(g.c0, g.c1);
    }

    #[test]
    fn test_other_tracks_ignored() {
        let mut scene = Scene::new();
        scene.attach(scene.root(), SceneNode::new("a").with_track(1)).expect("attach");
        let tree = Arc::new(scene.retained_for_track(0));
        let sol = TrackSolver::default().solve(tree, mapping());
        assert_eq!(sol.segment_count(), 0);
        assert_eq!(sol.lines.len(), 5);
    }

    #[test]
    fn test_stacking_and_line_overflow() {
        let mut scene = Scene::new();
        let ids: Vec<_> = (0..7)
            .map(|i| scene.attach(scene.root(), SceneNode::new(format!("n{i}")).with_track(0)).expect("attach"))
            .collect();
        let sol = TrackSolver::default().solve(Arc::new(scene.retained_for_track(0)), mapping());
        assert_eq!(sol.lines.len(), 5);
        for line in &sol.lines {
            assert_eq!(line.len(), 1);
            assert_eq!((line[0].x0, line[0].x1), (0, 99));
        }
        // earlier siblings take the first lines, the last two are dropped
        assert_eq!(sol.lines[0][0].owner, ids[0]);
        assert_eq!(sol.lines[4][0].owner, ids[4]);
        assert!(sol.segments().all(|g| g.owner != ids[5] && g.owner != ids[6]));
    }

    #[test]
    fn test_invisible_gap_splits_segment() {
        let mut scene = Scene::new();
        let id = scene
            .attach(scene.root(), SceneNode::new("n").with_track(0).with_range(2.0, 5.0))
            .expect("attach");
        scene
            .attach(scene.root(), SceneNode::new("m").with_track(0).with_range(-1.0, 1.0))
            .expect("attach");
        let sol = TrackSolver::default().solve(Arc::new(scene.retained_for_track(0)), mapping());
        let own: Vec<_> = sol.segments().filter(|g| g.owner == id).collect();
        assert_eq!(own.len(), 1);
        assert_eq!((own[0].x0, own[0].x1), (20, 50));
    }

    #[test]
    fn test_parent_alpha_propagates() {
        let mut scene = Scene::new();
        let group = scene.attach(scene.root(), SceneNode::new("group")).expect("group");
        scene
            .edit(group, |n| n.color = AnimatedValue::constant(Vec4::new(1.0, 1.0, 1.0, 0.5)))
            .expect("edit");
        scene.attach(group, SceneNode::new("clip").with_track(0)).expect("clip");
        let sol = TrackSolver::default().solve(Arc::new(scene.retained_for_track(0)), mapping());
        let c = from_argb(sol.lines[0][0].c0);
        assert!((c.w - 0.35).abs() < 1.0 / 255.0);
    }

    #[test]
    fn test_video_claims_skip_transparent_clips() {
        let mut scene = Scene::new();
        let source = MediaSource::new("v.mp4", SourceMeta::video(64, 36, 10.0, 100));
        let seen = scene
            .attach(
                scene.root(),
                SceneNode::new("seen").with_track(0).with_content(NodeContent::Video(source.clone())),
            )
            .expect("seen");
        let mut hidden = SceneNode::new("hidden").with_track(0).with_content(NodeContent::Video(source));
        hidden.color = AnimatedValue::constant(Vec4::new(1.0, 1.0, 1.0, 0.0));
        scene.attach(scene.root(), hidden).expect("hidden");

        let sol = TrackSolver::default().solve(Arc::new(scene.retained_for_track(0)), mapping());
        assert_eq!(sol.claims.len(), 1);
        let claim = sol.claims[0];
        assert_eq!(claim.node, seen);
        assert_eq!(claim.min_t, 0.0);
        assert!((claim.max_t - 9.9).abs() < 1e-9);
    }
}
