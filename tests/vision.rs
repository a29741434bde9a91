use eyestate::camera::FrameSource;
use eyestate::cascade::Region;
use eyestate::vision::{LoopState, RegionDetector, TileClassifier, VisionLoop, TILE_SIZE};
use eyestate::{Error, EyeState, Result};
use image::{GrayImage, RgbImage};
use proptest::prelude::*;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

/// Serves `good_frames` frames, then fails every read.
struct ScriptedCamera {
    good_frames: usize,
    served: usize,
    released: Rc<Cell<usize>>,
}

impl ScriptedCamera {
    fn new(good_frames: usize) -> (Self, Rc<Cell<usize>>) {
        let released = Rc::new(Cell::new(0));
        (
            Self {
                good_frames,
                served: 0,
                released: released.clone(),
            },
            released,
        )
    }
}

impl FrameSource for ScriptedCamera {
    fn next_frame(&mut self) -> Result<RgbImage> {
        if self.served >= self.good_frames {
            return Err(Error::Device("frame read failed".into()));
        }
        self.served += 1;
        Ok(RgbImage::new(32, 24))
    }

    fn release(&mut self) {
        self.released.set(self.released.get() + 1);
    }
}

struct FixedRegions(Vec<Region>);

impl RegionDetector for FixedRegions {
    fn detect(&self, _gray: &GrayImage) -> Vec<Region> {
        self.0.clone()
    }
}

/// Returns queued scores in order, repeating the last one.
struct QueuedScores(RefCell<VecDeque<f32>>);

impl TileClassifier for QueuedScores {
    fn score(&self, tile: &GrayImage) -> Result<f32> {
        assert_eq!(tile.dimensions(), (TILE_SIZE, TILE_SIZE));
        let mut q = self.0.borrow_mut();
        let s = if q.len() > 1 { q.pop_front() } else { q.front().copied() };
        s.ok_or_else(|| Error::Inference("no score".into()))
    }
}

fn regions() -> Vec<Region> {
    vec![
        Region {
            x: 2,
            y: 2,
            width: 10,
            height: 8,
        },
        Region {
            x: 16,
            y: 4,
            width: 12,
            height: 10,
        },
    ]
}

fn vision(scores: &[f32]) -> VisionLoop<FixedRegions, QueuedScores> {
    VisionLoop::new(
        FixedRegions(regions()),
        QueuedScores(RefCell::new(scores.iter().copied().collect())),
    )
}

proptest! {
    #[test]
    fn read_failure_releases_camera_once(n in 0usize..20) {
        let (camera, released) = ScriptedCamera::new(n);
        let mut vision = vision(&[0.9]);
        let keep_running = AtomicBool::new(true);
        let mut frames = 0;
        let result = vision.run(camera, &keep_running, |_, _| frames += 1);
        prop_assert!(matches!(result, Err(Error::Device(_))));
        prop_assert_eq!(frames, n);
        prop_assert_eq!(released.get(), 1);
        prop_assert_eq!(vision.state(), LoopState::Idle);
    }
}

#[test]
fn stop_flag_ends_the_loop() {
    let (camera, released) = ScriptedCamera::new(usize::MAX);
    let mut vision = vision(&[0.9]);
    let keep_running = AtomicBool::new(true);
    let mut seen = 0;
    let frames = vision
        .run(camera, &keep_running, |_, _| {
            seen += 1;
            if seen == 3 {
                keep_running.store(false, Ordering::Relaxed);
            }
        })
        .unwrap();
    assert_eq!(frames, 3);
    assert_eq!(released.get(), 1);
}

#[test]
fn flag_cleared_from_another_thread_stops_the_loop() {
    let (camera, released) = ScriptedCamera::new(usize::MAX);
    let mut vision = vision(&[0.9]);
    let keep_running = Arc::new(AtomicBool::new(true));
    let (first_frame, started) = mpsc::channel();
    let stopper = {
        let keep_running = Arc::clone(&keep_running);
        thread::spawn(move || {
            started.recv().unwrap();
            keep_running.store(false, Ordering::Relaxed);
        })
    };
    let frames = vision
        .run(camera, &keep_running, |_, _| {
            let _ = first_frame.send(());
        })
        .unwrap();
    stopper.join().unwrap();
    assert!(frames >= 1);
    assert_eq!(released.get(), 1);
    assert_eq!(vision.state(), LoopState::Idle);
}

#[test]
fn cleared_flag_reads_nothing() {
    let (camera, released) = ScriptedCamera::new(0);
    let mut vision = vision(&[0.9]);
    let frames = vision
        .run(camera, &AtomicBool::new(false), |_, _| {
            panic!("no frame expected")
        })
        .unwrap();
    assert_eq!(frames, 0);
    assert_eq!(released.get(), 1);
}

#[test]
fn scores_map_to_states_per_region() {
    let v = vision(&[0.5, 0.51]);
    let observations = v.process_frame(&RgbImage::new(32, 24)).unwrap();
    assert_eq!(observations.len(), 2);
    assert_eq!(observations[0].region, regions()[0]);
    assert_eq!(observations[0].state, EyeState::Closed);
    assert_eq!(observations[1].state, EyeState::Open);
}

#[test]
fn classifier_failure_still_releases() {
    let (camera, released) = ScriptedCamera::new(5);
    let mut v = VisionLoop::new(
        FixedRegions(regions()),
        QueuedScores(RefCell::new(VecDeque::new())),
    );
    let result = v.run(camera, &AtomicBool::new(true), |_, _| {});
    assert!(matches!(result, Err(Error::Inference(_))));
    assert_eq!(released.get(), 1);
}

#[test]
fn no_regions_no_observations() {
    let v = VisionLoop::new(FixedRegions(Vec::new()), QueuedScores(RefCell::new(VecDeque::new())));
    assert!(v.process_frame(&RgbImage::new(8, 8)).unwrap().is_empty());
    assert_eq!(v.state(), LoopState::Idle);
}
