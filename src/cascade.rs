//! Haar cascade eye detector.
//!
//! Reads OpenCV `opencv-cascade-classifier` XML files (BOOST stages over
//! upright HAAR features) and scans a grayscale frame with scaled windows.
//! Overlapping hits are merged the same way OpenCV's `groupRectangles` does.

use crate::artifact::{resolve_artifact, HubSource};
use crate::error::{Error, Result};
use image::GrayImage;
use roxmltree::Node;
use std::path::Path;
use tracing::debug;

pub const EYE_SCALE_FACTOR: f64 = 1.3;
pub const EYE_MIN_NEIGHBORS: usize = 5;
const GROUP_EPS: f64 = 0.2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Copy, Debug)]
struct WeightedRect {
    x: u32,
    y: u32,
    w: u32,
    h: u32,
    weight: f64,
}

#[derive(Clone, Copy, Debug)]
struct TreeNode {
    left: i32,
    right: i32,
    feature: usize,
    threshold: f64,
}

#[derive(Clone, Debug)]
struct WeakTree {
    nodes: Vec<TreeNode>,
    leaves: Vec<f64>,
}

#[derive(Clone, Debug)]
struct Stage {
    threshold: f64,
    trees: Vec<WeakTree>,
}

#[derive(Clone, Debug)]
pub struct HaarCascade {
    width: u32,
    height: u32,
    stages: Vec<Stage>,
    features: Vec<Vec<WeightedRect>>,
}

fn child<'a, 'i>(node: Node<'a, 'i>, name: &str) -> Result<Node<'a, 'i>> {
    node.children()
        .find(|n| n.has_tag_name(name))
        .ok_or_else(|| Error::Configuration(format!("cascade: missing <{name}>")))
}

fn items<'a, 'i>(node: Node<'a, 'i>) -> impl Iterator<Item = Node<'a, 'i>> {
    node.children().filter(|n| n.is_element())
}

fn text<'a>(node: Node<'a, '_>) -> &'a str {
    node.text().unwrap_or("").trim()
}

fn parse_num<T: std::str::FromStr>(s: &str) -> Result<T> {
    s.parse()
        .map_err(|_| Error::Configuration(format!("cascade: bad number {s:?}")))
}

fn parse_list<T: std::str::FromStr>(s: &str) -> Result<Vec<T>> {
    s.split_whitespace().map(parse_num).collect()
}

impl HaarCascade {
    pub fn load(path: &Path, hub: Option<&HubSource>) -> Result<Self> {
        let path = resolve_artifact(path, hub)?;
        let xml = std::fs::read_to_string(&path).map_err(|e| {
            Error::Configuration(format!("failed to read cascade {}: {e}", path.display()))
        })?;
        let cascade = Self::from_xml(&xml)?;
        debug!(
            path = %path.display(),
            stages = cascade.stages.len(),
            features = cascade.features.len(),
            "cascade loaded"
        );
        Ok(cascade)
    }

    pub fn from_xml(xml: &str) -> Result<Self> {
        let doc = roxmltree::Document::parse(xml)
            .map_err(|e| Error::Configuration(format!("cascade is not valid XML: {e}")))?;
        let root = doc
            .descendants()
            .find(|n| n.has_tag_name("cascade"))
            .ok_or_else(|| Error::Configuration("cascade: missing <cascade>".into()))?;

        let stage_type = text(child(root, "stageType")?);
        let feature_type = text(child(root, "featureType")?);
        if stage_type != "BOOST" || feature_type != "HAAR" {
            return Err(Error::Configuration(format!(
                "unsupported cascade {stage_type}/{feature_type}"
            )));
        }
        let width: u32 = parse_num(text(child(root, "width")?))?;
        let height: u32 = parse_num(text(child(root, "height")?))?;
        if width < 3 || height < 3 {
            return Err(Error::Configuration("cascade window is too small".into()));
        }

        let mut features = Vec::new();
        for feature in items(child(root, "features")?) {
            if let Ok(tilted) = child(feature, "tilted") {
                if text(tilted) != "0" {
                    return Err(Error::Configuration(
                        "tilted haar features are not supported".into(),
                    ));
                }
            }
            let mut rects = Vec::new();
            for rect in items(child(feature, "rects")?) {
                let v: Vec<f64> = parse_list(text(rect))?;
                if v.len() != 5 || v[..4].iter().any(|c| *c < 0.0) {
                    return Err(Error::Configuration(format!("cascade: bad rect {v:?}")));
                }
                let r = WeightedRect {
                    x: v[0] as u32,
                    y: v[1] as u32,
                    w: v[2] as u32,
                    h: v[3] as u32,
                    weight: v[4],
                };
                if r.x + r.w > width || r.y + r.h > height {
                    return Err(Error::Configuration(
                        "cascade: rect exceeds the window".into(),
                    ));
                }
                rects.push(r);
            }
            if rects.len() < 2 {
                return Err(Error::Configuration(
                    "cascade: feature needs at least two rects".into(),
                ));
            }
            features.push(rects);
        }

        let mut stages = Vec::new();
        for stage in items(child(root, "stages")?) {
            let threshold = parse_num(text(child(stage, "stageThreshold")?))?;
            let mut trees = Vec::new();
            for weak in items(child(stage, "weakClassifiers")?) {
                let raw: Vec<f64> = parse_list(text(child(weak, "internalNodes")?))?;
                let leaves: Vec<f64> = parse_list(text(child(weak, "leafValues")?))?;
                if raw.is_empty() || raw.len() % 4 != 0 {
                    return Err(Error::Configuration("cascade: bad internalNodes".into()));
                }
                let nodes: Vec<TreeNode> = raw
                    .chunks(4)
                    .map(|c| TreeNode {
                        left: c[0] as i32,
                        right: c[1] as i32,
                        feature: c[2] as usize,
                        threshold: c[3],
                    })
                    .collect();
                let tree = WeakTree { nodes, leaves };
                tree.validate(features.len())?;
                trees.push(tree);
            }
            stages.push(Stage { threshold, trees });
        }
        if stages.is_empty() {
            return Err(Error::Configuration("cascade has no stages".into()));
        }

        Ok(Self {
            width,
            height,
            stages,
            features,
        })
    }

    pub fn window_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Scans the frame at every scale and groups overlapping hits.
    pub fn detect_multi_scale(
        &self,
        gray: &GrayImage,
        scale_factor: f64,
        min_neighbors: usize,
    ) -> Vec<Region> {
        let (iw, ih) = gray.dimensions();
        let integral = IntegralImage::new(gray);
        let mut candidates = Vec::new();
        let mut factor = 1.0;
        loop {
            let win_w = (self.width as f64 * factor).round() as u32;
            let win_h = (self.height as f64 * factor).round() as u32;
            if win_w > iw || win_h > ih {
                break;
            }
            let scaled = self.scale(factor, win_w, win_h);
            let step = if factor > 2.0 { 1 } else { 2 };
            for y in (0..=ih - win_h).step_by(step) {
                for x in (0..=iw - win_w).step_by(step) {
                    if self.accepts(&integral, &scaled, x, y) {
                        candidates.push(Region {
                            x,
                            y,
                            width: win_w,
                            height: win_h,
                        });
                    }
                }
            }
            factor *= scale_factor;
        }
        debug!(candidates = candidates.len(), "cascade scan finished");
        group_rectangles(candidates, min_neighbors, GROUP_EPS)
    }

    fn scale(&self, factor: f64, win_w: u32, win_h: u32) -> ScaledCascade {
        let round = |v: u32| (v as f64 * factor).round() as u32;
        let offset = (factor.round() as u32).min(win_w.min(win_h) - 1);
        let norm = WeightedRect {
            x: offset,
            y: offset,
            w: round(self.width - 2).clamp(1, win_w - offset),
            h: round(self.height - 2).clamp(1, win_h - offset),
            weight: 1.0,
        };
        let inv_area = 1.0 / (norm.w as f64 * norm.h as f64);
        let features = self
            .features
            .iter()
            .map(|rects| {
                let mut scaled: Vec<WeightedRect> = rects
                    .iter()
                    .map(|r| {
                        let x = round(r.x).min(win_w);
                        let y = round(r.y).min(win_h);
                        WeightedRect {
                            x,
                            y,
                            w: round(r.w).min(win_w - x),
                            h: round(r.h).min(win_h - y),
                            weight: r.weight * inv_area,
                        }
                    })
                    .collect();
                // Rounding changes areas; rebalance so flat input sums to zero.
                let area0 = (scaled[0].w * scaled[0].h) as f64;
                let rest: f64 = scaled[1..]
                    .iter()
                    .map(|r| r.weight * (r.w * r.h) as f64)
                    .sum();
                scaled[0].weight = if area0 > 0.0 { -rest / area0 } else { 0.0 };
                scaled
            })
            .collect();
        ScaledCascade {
            norm,
            inv_area,
            features,
        }
    }

    fn accepts(&self, ii: &IntegralImage, scaled: &ScaledCascade, x: u32, y: u32) -> bool {
        let n = &scaled.norm;
        let mean = ii.sum(x + n.x, y + n.y, n.w, n.h) * scaled.inv_area;
        let variance = ii.sq_sum(x + n.x, y + n.y, n.w, n.h) * scaled.inv_area - mean * mean;
        let norm_factor = if variance > 0.0 { variance.sqrt() } else { 1.0 };

        let feature_value = |idx: usize| -> f64 {
            scaled.features[idx]
                .iter()
                .map(|r| ii.sum(x + r.x, y + r.y, r.w, r.h) * r.weight)
                .sum()
        };

        self.stages.iter().all(|stage| {
            let sum: f64 = stage
                .trees
                .iter()
                .map(|t| t.evaluate(|f, thr| feature_value(f) < thr * norm_factor))
                .sum();
            sum >= stage.threshold
        })
    }
}

impl WeakTree {
    fn validate(&self, feature_count: usize) -> Result<()> {
        let target_ok = |t: i32| {
            if t > 0 {
                (t as usize) < self.nodes.len()
            } else {
                ((-t) as usize) < self.leaves.len()
            }
        };
        for node in &self.nodes {
            if node.feature >= feature_count || !target_ok(node.left) || !target_ok(node.right) {
                return Err(Error::Configuration("cascade: bad tree node".into()));
            }
        }
        Ok(())
    }

    /// `goes_left(feature, threshold)` decides each split.
    fn evaluate(&self, goes_left: impl Fn(usize, f64) -> bool) -> f64 {
        let mut idx = 0usize;
        // Positive targets are node indices; zero or negative ones are leaves.
        for _ in 0..=self.nodes.len() {
            let node = &self.nodes[idx];
            let next = if goes_left(node.feature, node.threshold) {
                node.left
            } else {
                node.right
            };
            if next <= 0 {
                return self.leaves[(-next) as usize];
            }
            idx = next as usize;
        }
        0.0
    }
}

struct ScaledCascade {
    norm: WeightedRect,
    inv_area: f64,
    features: Vec<Vec<WeightedRect>>,
}

struct IntegralImage {
    stride: usize,
    sum: Vec<f64>,
    sq: Vec<f64>,
}

impl IntegralImage {
    fn new(gray: &GrayImage) -> Self {
        let (w, h) = (gray.width() as usize, gray.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0.0; stride * (h + 1)];
        let mut sq = vec![0.0; stride * (h + 1)];
        for y in 0..h {
            let mut row_sum = 0.0;
            let mut row_sq = 0.0;
            for x in 0..w {
                let v = gray.get_pixel(x as u32, y as u32)[0] as f64;
                row_sum += v;
                row_sq += v * v;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row_sum;
                sq[(y + 1) * stride + x + 1] = sq[y * stride + x + 1] + row_sq;
            }
        }
        Self { stride, sum, sq }
    }

    fn rect(table: &[f64], stride: usize, x: u32, y: u32, w: u32, h: u32) -> f64 {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        table[y1 * stride + x1] - table[y0 * stride + x1] - table[y1 * stride + x0]
            + table[y0 * stride + x0]
    }

    fn sum(&self, x: u32, y: u32, w: u32, h: u32) -> f64 {
        Self::rect(&self.sum, self.stride, x, y, w, h)
    }

    fn sq_sum(&self, x: u32, y: u32, w: u32, h: u32) -> f64 {
        Self::rect(&self.sq, self.stride, x, y, w, h)
    }
}

fn similar(a: &Region, b: &Region, eps: f64) -> bool {
    let delta = eps * (a.width.min(b.width) + a.height.min(b.height)) as f64 * 0.5;
    let close = |p: u32, q: u32| (p as f64 - q as f64).abs() <= delta;
    close(a.x, b.x)
        && close(a.y, b.y)
        && close(a.x + a.width, b.x + b.width)
        && close(a.y + a.height, b.y + b.height)
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// Clusters similar rectangles and keeps clusters with more than
/// `min_neighbors` members, averaged. Zero returns the input unchanged.
pub fn group_rectangles(rects: Vec<Region>, min_neighbors: usize, eps: f64) -> Vec<Region> {
    if min_neighbors == 0 || rects.is_empty() {
        return rects;
    }
    let mut parent: Vec<usize> = (0..rects.len()).collect();
    for i in 0..rects.len() {
        for j in (i + 1)..rects.len() {
            if similar(&rects[i], &rects[j], eps) {
                let (a, b) = (find(&mut parent, i), find(&mut parent, j));
                if a != b {
                    parent[b] = a;
                }
            }
        }
    }

    let mut clusters: Vec<(usize, [f64; 4], usize)> = Vec::new();
    for (i, r) in rects.iter().enumerate() {
        let root = find(&mut parent, i);
        let slot = match clusters.iter().position(|c| c.0 == root) {
            Some(s) => s,
            None => {
                clusters.push((root, [0.0; 4], 0));
                clusters.len() - 1
            }
        };
        let c = &mut clusters[slot];
        c.1[0] += r.x as f64;
        c.1[1] += r.y as f64;
        c.1[2] += r.width as f64;
        c.1[3] += r.height as f64;
        c.2 += 1;
    }
    let averaged: Vec<(Region, usize)> = clusters
        .iter()
        .map(|(_, s, n)| {
            let k = 1.0 / *n as f64;
            (
                Region {
                    x: (s[0] * k).round() as u32,
                    y: (s[1] * k).round() as u32,
                    width: (s[2] * k).round() as u32,
                    height: (s[3] * k).round() as u32,
                },
                *n,
            )
        })
        .collect();

    let mut out = Vec::new();
    for (i, (r1, n1)) in averaged.iter().enumerate() {
        if *n1 <= min_neighbors {
            continue;
        }
        let nested = averaged.iter().enumerate().any(|(j, (r2, n2))| {
            if i == j || *n2 <= min_neighbors {
                return false;
            }
            let dx = (r2.width as f64 * eps).round();
            let dy = (r2.height as f64 * eps).round();
            let inside = r1.x as f64 >= r2.x as f64 - dx
                && r1.y as f64 >= r2.y as f64 - dy
                && (r1.x + r1.width) as f64 <= (r2.x + r2.width) as f64 + dx
                && (r1.y + r1.height) as f64 <= (r2.y + r2.height) as f64 + dy;
            inside && (*n2 > (*n1).max(3) || *n1 < 3)
        });
        if !nested {
            out.push(*r1);
        }
    }
    out
}
