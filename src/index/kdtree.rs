//! KD-tree index (spec §4.4.2): variance-axis median splits, with `rayon`
//! parallel subtree construction above a configurable vector count.

use super::codec::{read_f32, read_u128, read_u32, read_u8, write_f32, write_u128, write_u32, write_u8};
use super::{snapshot_map, IndexEntry, SearchIndex};
use crate::distance::DistanceMetric;
use crate::error::{Error, Result};
use crate::point::{ScoredId, VectorId};
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io::{Read, Write};

enum Node {
    Leaf {
        id: VectorId,
        values: Vec<f32>,
    },
    Split {
        axis: usize,
        threshold: f32,
        id: VectorId,
        values: Vec<f32>,
        left: Option<Box<Node>>,
        right: Option<Box<Node>>,
    },
}

/// A KD-tree over vectors of a fixed dimension.
pub struct KdTreeIndex {
    metric: DistanceMetric,
    root: Option<Box<Node>>,
    dimension: usize,
    len: usize,
    parallel_threshold: usize,
}

impl KdTreeIndex {
    #[must_use]
    pub fn new(metric: DistanceMetric) -> Self {
        Self {
            metric,
            root: None,
            dimension: 0,
            len: 0,
            parallel_threshold: 1000,
        }
    }

    #[must_use]
    pub fn with_parallel_threshold(mut self, threshold: usize) -> Self {
        self.parallel_threshold = threshold;
        self
    }

    fn variance_axis(points: &[IndexEntry], dimension: usize) -> usize {
        let n = points.len() as f32;
        let mut best_axis = 0;
        let mut best_var = -1.0f32;
        for axis in 0..dimension {
            let mean: f32 = points.iter().map(|(_, v)| v[axis]).sum::<f32>() / n;
            let var: f32 = points.iter().map(|(_, v)| (v[axis] - mean).powi(2)).sum::<f32>() / n;
            if var > best_var {
                best_var = var;
                best_axis = axis;
            }
        }
        best_axis
    }

    fn build_node(points: Vec<IndexEntry>, dimension: usize, depth: usize, threshold: usize) -> Option<Box<Node>> {
        if points.is_empty() {
            return None;
        }
        if points.len() == 1 {
            let (id, values) = points.into_iter().next().unwrap();
            return Some(Box::new(Node::Leaf { id, values }));
        }

        let axis = Self::variance_axis(&points, dimension);
        let mut sorted = points;
        sorted.sort_by(|a, b| a.1[axis].partial_cmp(&b.1[axis]).unwrap_or(Ordering::Equal));
        let mid = sorted.len() / 2;
        let (id, values) = sorted[mid].clone();
        let threshold_value = values[axis];

        let mut left_points = sorted;
        let right_points = left_points.split_off(mid + 1);
        left_points.truncate(mid);

        let use_parallel = depth < 4 && (left_points.len() + right_points.len()) >= threshold;
        let (left, right) = if use_parallel {
            rayon::join(
                || Self::build_node(left_points, dimension, depth + 1, threshold),
                || Self::build_node(right_points, dimension, depth + 1, threshold),
            )
        } else {
            (
                Self::build_node(left_points, dimension, depth + 1, threshold),
                Self::build_node(right_points, dimension, depth + 1, threshold),
            )
        };

        Some(Box::new(Node::Split {
            axis,
            threshold: threshold_value,
            id,
            values,
            left,
            right,
        }))
    }

    fn collect_within(node: &Node, query: &[f32], radius_sq: f32, metric: DistanceMetric, out: &mut Vec<(VectorId, f32)>) -> Result<()> {
        match node {
            Node::Leaf { id, values } => {
                let d = metric.scalar(query, values)?;
                if d * d <= radius_sq || metric.higher_is_closer() {
                    out.push((*id, d));
                }
                Ok(())
            }
            Node::Split { axis, threshold, id, values, left, right } => {
                let d = metric.scalar(query, values)?;
                out.push((*id, d));
                let diff = query[*axis] - threshold;
                let (near, far) = if diff <= 0.0 { (left, right) } else { (right, left) };
                if let Some(near) = near {
                    Self::collect_within(near, query, radius_sq, metric, out)?;
                }
                if diff * diff <= radius_sq {
                    if let Some(far) = far {
                        Self::collect_within(far, query, radius_sq, metric, out)?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Offers a candidate into the running top-`k`, evicting the current
    /// worst if `score` beats it (ties broken toward the smaller id).
    fn offer(heap: &mut BinaryHeap<HeapItem>, id: VectorId, score: f32, k: usize, higher_is_closer: bool) {
        let badness = if higher_is_closer { -score } else { score };
        if heap.len() < k {
            heap.push(HeapItem { badness, id, score });
            return;
        }
        if let Some(worst) = heap.peek() {
            if badness < worst.badness || (badness == worst.badness && id.0 < worst.id.0) {
                heap.pop();
                heap.push(HeapItem { badness, id, score });
            }
        }
    }

    /// Best-first descent/ascent: visits the near side unconditionally, and
    /// prunes the far side when its per-axis distance already exceeds the
    /// current worst retained candidate. Pruning only holds for true distance
    /// metrics, so similarity metrics (cosine) always explore both sides.
    fn search_node(node: &Node, query: &[f32], k: usize, metric: DistanceMetric, heap: &mut BinaryHeap<HeapItem>) -> Result<()> {
        match node {
            Node::Leaf { id, values } => {
                let score = metric.scalar(query, values)?;
                Self::offer(heap, *id, score, k, metric.higher_is_closer());
                Ok(())
            }
            Node::Split { axis, threshold, id, values, left, right } => {
                let score = metric.scalar(query, values)?;
                Self::offer(heap, *id, score, k, metric.higher_is_closer());

                let diff = query[*axis] - threshold;
                let (near, far) = if diff <= 0.0 { (left, right) } else { (right, left) };
                if let Some(near) = near {
                    Self::search_node(near, query, k, metric, heap)?;
                }

                let prunable = !metric.higher_is_closer();
                let should_explore_far = if prunable && heap.len() >= k {
                    heap.peek().is_none_or(|worst| diff.abs() < worst.score)
                } else {
                    true
                };
                if should_explore_far {
                    if let Some(far) = far {
                        Self::search_node(far, query, k, metric, heap)?;
                    }
                }
                Ok(())
            }
        }
    }

    fn save_node(node: Option<&Node>, writer: &mut dyn Write) -> Result<()> {
        match node {
            None => Ok(()),
            Some(Node::Leaf { id, .. }) => {
                write_u8(writer, 0)?;
                write_u128(writer, id.0)
            }
            Some(Node::Split { axis, threshold, id, left, right, .. }) => {
                Self::save_node(left.as_deref(), writer)?;
                Self::save_node(right.as_deref(), writer)?;
                write_u8(writer, 1)?;
                let flags = (left.is_some() as u8) | ((right.is_some() as u8) << 1);
                write_u8(writer, flags)?;
                write_u32(writer, *axis as u32)?;
                write_f32(writer, *threshold)?;
                write_u128(writer, id.0)
            }
        }
    }
}

/// Max-heap entry ordered by how "bad" (far from the query) a candidate is,
/// so `peek()` always surfaces the current worst retained neighbor.
struct HeapItem {
    badness: f32,
    id: VectorId,
    score: f32,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.badness == other.badness && self.id == other.id
    }
}
impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.badness
            .partial_cmp(&other.badness)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.id.0.cmp(&other.id.0))
    }
}

impl SearchIndex for KdTreeIndex {
    fn build(&mut self, entries: &[IndexEntry]) -> Result<()> {
        self.dimension = entries.first().map_or(0, |(_, v)| v.len());
        self.len = entries.len();
        let threshold = self.parallel_threshold;
        self.root = Self::build_node(entries.to_vec(), self.dimension, 0, threshold);
        Ok(())
    }

    fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<ScoredId>> {
        let Some(root) = &self.root else { return Ok(Vec::new()) };
        if k == 0 {
            return Ok(Vec::new());
        }
        let mut heap = BinaryHeap::new();
        Self::search_node(root, query, k, self.metric, &mut heap)?;

        let higher_is_closer = self.metric.higher_is_closer();
        let mut out: Vec<(VectorId, f32)> = heap.into_iter().map(|item| (item.id, item.score)).collect();
        if higher_is_closer {
            out.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        } else {
            out.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        }
        Ok(out.into_iter().map(|(id, score)| ScoredId::new(id, score)).collect())
    }

    fn range(&self, query: &[f32], radius: f32) -> Result<Vec<ScoredId>> {
        let Some(root) = &self.root else { return Ok(Vec::new()) };
        let mut out = Vec::new();
        Self::collect_within(root, query, radius * radius, self.metric, &mut out)?;
        out.retain(|(_, d)| if self.metric.higher_is_closer() { *d >= radius } else { *d <= radius });
        out.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        Ok(out.into_iter().map(|(id, score)| ScoredId::new(id, score)).collect())
    }

    fn len(&self) -> usize {
        self.len
    }

    /// Post-order structural dump: axis, split value, and identifier per
    /// split node, identifier alone per leaf. Values are never duplicated —
    /// `load` resolves them from the rebuild snapshot by id.
    fn save(&self, writer: &mut dyn Write) -> Result<()> {
        write_u32(writer, self.dimension as u32)?;
        write_u32(writer, self.len as u32)?;
        write_u8(writer, self.root.is_some() as u8)?;
        Self::save_node(self.root.as_deref(), writer)
    }

    fn load(&mut self, reader: &mut dyn Read, snapshot: &[IndexEntry]) -> Result<()> {
        let map = snapshot_map(snapshot);
        let dimension = read_u32(reader)? as usize;
        let len = read_u32(reader)? as usize;
        let has_root = read_u8(reader)? != 0;

        if !has_root {
            self.dimension = dimension;
            self.len = len;
            self.root = None;
            return Ok(());
        }

        let mut stack: Vec<Box<Node>> = Vec::new();
        // Post-order body has exactly `len` entries: one per node.
        for _ in 0..len {
            let tag = read_u8(reader)?;
            match tag {
                0 => {
                    let id = read_u128(reader)?;
                    let values = super::resolve(&map, id)?;
                    stack.push(Box::new(Node::Leaf { id: VectorId::from_u128(id), values }));
                }
                1 => {
                    let flags = read_u8(reader)?;
                    let axis = read_u32(reader)? as usize;
                    let threshold = read_f32(reader)?;
                    let id = read_u128(reader)?;
                    let values = super::resolve(&map, id)?;
                    let right = if flags & 0b10 != 0 {
                        Some(stack.pop().ok_or_else(|| Error::CorruptHeader("kd-tree snapshot missing right child".into()))?)
                    } else {
                        None
                    };
                    let left = if flags & 0b01 != 0 {
                        Some(stack.pop().ok_or_else(|| Error::CorruptHeader("kd-tree snapshot missing left child".into()))?)
                    } else {
                        None
                    };
                    stack.push(Box::new(Node::Split {
                        axis,
                        threshold,
                        id: VectorId::from_u128(id),
                        values,
                        left,
                        right,
                    }));
                }
                other => return Err(Error::CorruptHeader(format!("unknown kd-tree node tag {other}"))),
            }
        }
        let root = stack.pop();
        if !stack.is_empty() {
            return Err(Error::CorruptHeader("kd-tree snapshot left unconsumed nodes".into()));
        }

        self.dimension = dimension;
        self.len = len;
        self.root = root;
        Ok(())
    }
}
