//! Track view state and the serialized solve queue.
//!
//! A [`TrackView`] owns the installed [`StripeSolution`] of one timeline row.
//! Solves run on a [`SolveQueue`]: one worker thread, jobs in order, at most
//! one job pending per view. The result replaces the old solution in one
//! swap, so readers see the old or the new solution, never a partial one.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{error, trace};

use crate::config::EngineConfig;
use crate::core::event_bus::{BufferReady, EventBus, SolutionInstalled, SourceInvalidated};
use crate::entities::{NodeId, NodeSample, RetainedTree};
use crate::timeline::mapping::TimeMapping;
use crate::timeline::solution::{StripeSolution, LINE_BOTTOM_MARGIN, LINE_SPACING, LINE_TOP};
use crate::timeline::solver::TrackSolver;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Single worker thread running solve jobs in submission order.
pub struct SolveQueue {
    sender: Option<Sender<Job>>,
    handle: Option<thread::JoinHandle<()>>,
    pending: Arc<AtomicUsize>,
}

impl std::fmt::Debug for SolveQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SolveQueue")
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .finish()
    }
}

impl SolveQueue {
    pub fn new(name: &str) -> Self {
        let (sender, receiver): (Sender<Job>, Receiver<Job>) = unbounded();
        let pending = Arc::new(AtomicUsize::new(0));
        let pending_w = Arc::clone(&pending);
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                trace!("{} started", thread_name);
                for job in receiver.iter() {
                    // a failing solve must not take the queue down
                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                        error!("{}: solve job panicked", thread_name);
                    }
                    pending_w.fetch_sub(1, Ordering::AcqRel);
                }
                trace!("{} stopped", thread_name);
            })
            .map_err(|e| error!("Failed to spawn {}: {}", name, e))
            .ok();
        Self { sender: Some(sender), handle, pending }
    }

    /// Queue a job. Runs it inline if the worker could not be started.
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pending.fetch_add(1, Ordering::AcqRel);
        let job: Job = Box::new(job);
        let rejected = match (&self.sender, &self.handle) {
            (Some(sender), Some(_)) => sender.send(job).err().map(|e| e.into_inner()),
            _ => Some(job),
        };
        if let Some(job) = rejected {
            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                error!("Inline solve job panicked");
            }
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Wait until the queue is drained. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.pending() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }
}

impl Drop for SolveQueue {
    fn drop(&mut self) {
        // closing the channel ends the worker loop
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Inputs of the re-solve decision for one draw tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct SolveTrigger {
    pub x0: i32,
    pub x1: i32,
    /// Pointer over the row, or any key/button held
    pub interacting: bool,
    /// Layout or playback is changing the visible window
    pub animating: bool,
    /// Current scene revision, when known
    pub scene_revision: Option<u64>,
}

/// State of one timeline row.
pub struct TrackView {
    track_index: i32,
    solution: Mutex<Option<Arc<StripeSolution>>>,
    needs_update: AtomicBool,
    calculating: AtomicBool,
    redraw: AtomicBool,
    last_solve: Mutex<Option<Instant>>,
    playback_interval: Duration,
    interaction_interval: Duration,
    max_lines: usize,
    alpha_multiplier: f32,
    min_alpha: f32,
    bus: EventBus,
}

impl std::fmt::Debug for TrackView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackView")
            .field("track_index", &self.track_index)
            .field("calculating", &self.calculating.load(Ordering::Relaxed))
            .field("needs_update", &self.needs_update.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl TrackView {
    /// New view subscribed to cache notifications on `bus`.
    pub fn new(track_index: i32, config: &EngineConfig, bus: EventBus) -> Arc<Self> {
        let view = Arc::new(Self {
            track_index,
            solution: Mutex::new(None),
            needs_update: AtomicBool::new(true),
            calculating: AtomicBool::new(false),
            redraw: AtomicBool::new(false),
            last_solve: Mutex::new(None),
            playback_interval: Duration::from_millis(config.playback_resolve_ms),
            interaction_interval: Duration::from_millis(config.interaction_resolve_ms),
            max_lines: config.max_lines.max(1),
            alpha_multiplier: config.alpha_multiplier,
            min_alpha: config.min_alpha,
            bus: bus.clone(),
        });

        let weak = Arc::downgrade(&view);
        bus.subscribe::<BufferReady, _>(move |_| {
            if let Some(v) = weak.upgrade() {
                v.request_redraw();
            }
        });
        let weak = Arc::downgrade(&view);
        bus.subscribe::<SourceInvalidated, _>(move |_| {
            if let Some(v) = weak.upgrade() {
                v.invalidate();
            }
        });
        view
    }

    pub fn track_index(&self) -> i32 {
        self.track_index
    }

    /// Currently installed solution.
    pub fn solution(&self) -> Option<Arc<StripeSolution>> {
        self.solution.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn install(&self, solution: Arc<StripeSolution>) {
        let revision = solution.revision();
        *self.solution.lock().unwrap_or_else(|e| e.into_inner()) = Some(solution);
        self.request_redraw();
        self.bus.emit(SolutionInstalled { track_index: self.track_index, revision });
    }

    /// Scene changed: solve again on the next tick.
    pub fn invalidate(&self) {
        self.needs_update.store(true, Ordering::Release);
        self.request_redraw();
    }

    pub fn request_redraw(&self) {
        self.redraw.store(true, Ordering::Release);
    }

    /// Consume the redraw flag.
    pub fn take_redraw(&self) -> bool {
        self.redraw.swap(false, Ordering::AcqRel)
    }

    pub fn is_calculating(&self) -> bool {
        self.calculating.load(Ordering::Acquire)
    }

    /// Whether this tick should start a new solve.
    pub fn needs_solve(&self, trigger: &SolveTrigger) -> bool {
        if self.needs_update.load(Ordering::Acquire) || trigger.interacting {
            return true;
        }
        let stale = match self.solution() {
            Some(s) => {
                s.x0() != trigger.x0
                    || s.x1() != trigger.x1
                    || trigger.scene_revision.is_some_and(|r| r != s.revision())
            }
            None => true,
        };
        if stale {
            return true;
        }
        let interval = if trigger.animating { self.interaction_interval } else { self.playback_interval };
        self.last_solve
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none_or(|t| t.elapsed() > interval)
    }

    /// Queue a solve of `tree` unless one is already pending.
    ///
    /// Returns false when the request was coalesced into the pending one.
    pub fn request_solve(
        self: &Arc<Self>,
        queue: &SolveQueue,
        solver: TrackSolver,
        tree: Arc<RetainedTree>,
        mapping: TimeMapping,
        on_solved: impl FnOnce(&StripeSolution) + Send + 'static,
    ) -> bool {
        if self
            .calculating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.needs_update.store(false, Ordering::Release);
        *self.last_solve.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());

        let weak: Weak<Self> = Arc::downgrade(self);
        queue.submit(move || {
            let guard = CalculatingGuard(weak.clone());
            let solution = solver.solve(tree, mapping);
            // view dropped while solving: discard
            if let Some(view) = weak.upgrade() {
                on_solved(&solution);
                view.install(Arc::new(solution));
            }
            drop(guard);
        });
        true
    }

    /// Solve on the calling thread and install the result.
    pub fn solve_now(&self, solver: &TrackSolver, tree: Arc<RetainedTree>, mapping: TimeMapping) -> Arc<StripeSolution> {
        self.needs_update.store(false, Ordering::Release);
        *self.last_solve.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        let solution = Arc::new(solver.solve(tree, mapping));
        self.install(Arc::clone(&solution));
        solution
    }

    /// Top-most drawable node whose stacking line covers `(x, y)`.
    ///
    /// `row_y`/`row_h` is the row rectangle, `central_time` the current view
    /// center. The retained hierarchy is re-evaluated at the time under `x`.
    pub fn node_at(&self, x: f64, y: i32, row_y: i32, row_h: i32, central_time: f64) -> Option<NodeId> {
        let solution = self.solution()?;
        let tree = solution.tree();
        if tree.is_empty() {
            return None;
        }
        let time = solution.mapping().with_central_time(central_time).time_at(x);
        let mut samples: Vec<NodeSample> = Vec::with_capacity(tree.nodes.len());
        tree.evaluate_into(time, &mut samples);

        let mut best = None;
        let mut line = 0;
        for &index in &tree.drawn {
            let node = &tree.nodes[index];
            let sample = samples[index];
            let alpha = sample.color.w * self.alpha_multiplier;
            if alpha < self.min_alpha || !node.is_visible(sample.time) {
                continue;
            }
            let dy = y - (row_y + LINE_TOP + line * LINE_SPACING);
            if (0..=row_h - LINE_BOTTOM_MARGIN).contains(&dy) {
                best = Some(node.id);
            }
            line += 1;
            if line as usize >= self.max_lines {
                break;
            }
        }
        best
    }

    /// Pixel columns of `node`'s color keyframes between columns `px0..px1`.
    ///
    /// Keyframes closer than one pixel to the previous cue are skipped.
    pub fn keyframe_cues(&self, node: NodeId, px0: f64, px1: f64, central_time: f64) -> Vec<i32> {
        let Some(solution) = self.solution() else { return Vec::new() };
        let tree = solution.tree();
        let Some(index) = tree.index_of(node) else { return Vec::new() };
        let target = &tree.nodes[index];
        if !target.color.is_animated() {
            return Vec::new();
        }

        let view = solution.mapping().with_central_time(central_time);
        let (g0, g1) = (view.time_at(px0), view.time_at(px1));
        let (hx0, hx1) = (view.x_at(g0), view.x_at(g1));
        let (mut t0, mut t1) = (g0, g1);
        for i in tree.chain_indices(index) {
            t0 = tree.nodes[i].local_time(t0);
            t1 = tree.nodes[i].local_time(t1);
        }
        let (lo, hi) = if t0 <= t1 { (t0, t1) } else { (t1, t0) };
        if hi <= lo {
            return Vec::new();
        }

        let mut cues = Vec::new();
        let mut last_x = solution.x0() - 1;
        for key in target.color.range(lo, hi) {
            let f = (key.time - t0) / (t1 - t0);
            let x = (hx0 + (hx1 - hx0) * f) as i32;
            if x > last_x {
                cues.push(x);
                last_x = x;
            }
        }
        cues
    }
}

/// Clears the view's calculating flag even if the solve panics.
struct CalculatingGuard(Weak<TrackView>);

impl Drop for CalculatingGuard {
    fn drop(&mut self) {
        if let Some(view) = self.0.upgrade() {
            view.calculating.store(false, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::frame_cache::FrameCacheKey;
    use crate::entities::{AnimatedValue, Scene, SceneNode};
    use glam::Vec4;
    use uuid::Uuid;

    fn setup() -> (Scene, NodeId, Arc<TrackView>) {
        let mut scene = Scene::new();
        let id = scene.attach(scene.root(), SceneNode::new("clip").with_track(0)).expect("attach");
        let view = TrackView::new(0, &EngineConfig::default(), EventBus::new());
        (scene, id, view)
    }

    #[test]
    fn test_queue_survives_panicking_job() {
        let queue = SolveQueue::new("test-solve");
        let ran = Arc::new(AtomicUsize::new(0));
        queue.submit(|| panic!("boom"));
        let r = Arc::clone(&ran);
        queue.submit(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        assert!(queue.wait_idle(Duration::from_secs(5)));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_request_solve_installs_and_coalesces() {
        let (scene, _, view) = setup();
        let queue = SolveQueue::new("test-solve");
        let tree = Arc::new(scene.retained_for_track(0));
        let mapping = TimeMapping::from_window(0.0, 10.0, 0, 100);

        // hold the worker so the next request stays pending
        let (tx, rx) = crossbeam_channel::bounded::<()>(0);
        queue.submit(move || {
            let _ = rx.recv();
        });
        assert!(view.request_solve(&queue, TrackSolver::default(), Arc::clone(&tree), mapping, |_| {}));
        assert!(!view.request_solve(&queue, TrackSolver::default(), tree, mapping, |_| {}));
        tx.send(()).expect("release worker");

        assert!(queue.wait_idle(Duration::from_secs(5)));
        assert!(!view.is_calculating());
        assert_eq!(view.solution().map(|s| s.segment_count()), Some(1));
        assert!(view.take_redraw());
        assert!(!view.take_redraw());
    }

    #[test]
    fn test_needs_solve_triggers() {
        let (scene, _, view) = setup();
        let trigger = SolveTrigger { x0: 0, x1: 100, ..SolveTrigger::default() };
        assert!(view.needs_solve(&trigger));
        view.solve_now(
            &TrackSolver::default(),
            Arc::new(scene.retained_for_track(0)),
            TimeMapping::from_window(0.0, 10.0, 0, 100),
        );
        assert!(!view.needs_solve(&trigger));
        assert!(view.needs_solve(&SolveTrigger { x1: 120, ..trigger }));
        assert!(view.needs_solve(&SolveTrigger { interacting: true, ..trigger }));
        view.invalidate();
        assert!(view.needs_solve(&trigger));
    }

    #[test]
    fn test_needs_solve_after_scene_edit() {
        let (scene, _, view) = setup();
        view.solve_now(
            &TrackSolver::default(),
            Arc::new(scene.retained_for_track(0)),
            TimeMapping::from_window(0.0, 10.0, 0, 100),
        );
        let current = SolveTrigger { x0: 0, x1: 100, scene_revision: Some(scene.revision()), ..SolveTrigger::default() };
        assert!(!view.needs_solve(&current));
        let edited = SolveTrigger { scene_revision: Some(scene.revision() + 1), ..current };
        assert!(view.needs_solve(&edited));
    }

    #[test]
    fn test_cache_events_request_redraw() {
        let bus = EventBus::new();
        let view = TrackView::new(0, &EngineConfig::default(), bus.clone());
        assert!(!view.take_redraw());
        bus.emit(BufferReady { key: FrameCacheKey::new(Uuid::nil(), 1, 0, 128, 30.0), ok: true });
        assert!(view.take_redraw());
        bus.emit(SourceInvalidated { source_id: Uuid::nil() });
        assert!(view.needs_solve(&SolveTrigger::default()));
    }

    #[test]
    fn test_node_at_hits_stacking_lines() {
        let mut scene = Scene::new();
        let a = scene.attach(scene.root(), SceneNode::new("a").with_track(0)).expect("a");
        let b = scene
            .attach(scene.root(), SceneNode::new("b").with_track(0).with_range(5.0, 10.0))
            .expect("b");
        let view = TrackView::new(0, &EngineConfig::default(), EventBus::new());
        view.solve_now(
            &TrackSolver::default(),
            Arc::new(scene.retained_for_track(0)),
            TimeMapping::from_window(0.0, 10.0, 0, 100),
        );
        // left half: only `a`, on line 0
        assert_eq!(view.node_at(10.0, 3, 0, 45, 5.0), Some(a));
        // right half: `b` on line 1 covers y 6..=41, `a` covers 3..=38
        assert_eq!(view.node_at(80.0, 40, 0, 45, 5.0), Some(b));
        assert_eq!(view.node_at(80.0, 20, 0, 45, 5.0), Some(b));
        assert_eq!(view.node_at(10.0, 44, 0, 45, 5.0), None);
    }

    #[test]
    fn test_keyframe_cues_map_to_pixels() {
        let mut scene = Scene::new();
        let mut node = SceneNode::new("n").with_track(0);
        node.color = AnimatedValue::from_keys(Vec4::ONE, [(2.0, Vec4::ONE), (2.05, Vec4::ZERO), (6.0, Vec4::ONE)]);
        let id = scene.attach(scene.root(), node).expect("attach");
        let view = TrackView::new(0, &EngineConfig::default(), EventBus::new());
        view.solve_now(
            &TrackSolver::default(),
            Arc::new(scene.retained_for_track(0)),
            TimeMapping::from_window(0.0, 10.0, 0, 100),
        );
        // 2.0 and 2.05 land on the same pixel
        assert_eq!(view.keyframe_cues(id, 0.0, 100.0, 5.0), vec![20, 60]);
        assert!(view.keyframe_cues(id, 0.0, 10.0, 5.0).is_empty());
    }
}
