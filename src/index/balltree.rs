//! Ball tree index (spec §4.4.3): centroid/radius nodes built by a two-pivot
//! partition, pruned at query time via distance-minus-radius bounds.

use super::codec::{read_f32, read_u128, read_u32, read_u8, write_f32, write_u128, write_u32, write_u8};
use super::{snapshot_map, IndexEntry, SearchIndex};
use crate::distance::DistanceMetric;
use crate::error::{Error, Result};
use crate::point::{ScoredId, VectorId};
use crate::rng::Xorshift64;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io::{Read, Write};

struct Node {
    centroid: Vec<f32>,
    radius: f32,
    members: Vec<IndexEntry>,
    left: Option<Box<Node>>,
    right: Option<Box<Node>>,
}

const LEAF_CAPACITY: usize = 8;

/// A ball tree over vectors of a fixed dimension.
pub struct BallTreeIndex {
    metric: DistanceMetric,
    root: Option<Box<Node>>,
    len: usize,
    seed: u64,
}

impl BallTreeIndex {
    #[must_use]
    pub fn new(metric: DistanceMetric) -> Self {
        Self { metric, root: None, len: 0, seed: 0x9E37_79B9_7F4A_7C15 }
    }

    fn centroid(points: &[IndexEntry], dimension: usize) -> Vec<f32> {
        let mut sum = vec![0.0f32; dimension];
        for (_, v) in points {
            for (s, x) in sum.iter_mut().zip(v.iter()) {
                *s += x;
            }
        }
        let n = points.len() as f32;
        for s in &mut sum {
            *s /= n;
        }
        sum
    }

    fn build_node(points: Vec<IndexEntry>, dimension: usize, metric: DistanceMetric, rng: &mut Xorshift64) -> Result<Option<Box<Node>>> {
        if points.is_empty() {
            return Ok(None);
        }
        let centroid = Self::centroid(&points, dimension);
        let mut radius = 0.0f32;
        for (_, v) in &points {
            radius = radius.max(metric.scalar(&centroid, v)?);
        }

        if points.len() <= LEAF_CAPACITY {
            return Ok(Some(Box::new(Node {
                centroid,
                radius,
                members: points,
                left: None,
                right: None,
            })));
        }

        let pivot_a = rng.next_below(points.len());
        let (_, pivot_a_vec) = points[pivot_a].clone();
        let mut best_b = 0;
        let mut best_dist = -1.0f32;
        for (i, (_, v)) in points.iter().enumerate() {
            let d = metric.scalar(&pivot_a_vec, v)?;
            if d > best_dist {
                best_dist = d;
                best_b = i;
            }
        }
        let (_, pivot_b_vec) = points[best_b].clone();

        let mut left_points = Vec::new();
        let mut right_points = Vec::new();
        for entry in points {
            let to_a = metric.scalar(&pivot_a_vec, &entry.1)?;
            let to_b = metric.scalar(&pivot_b_vec, &entry.1)?;
            let closer_to_a = if metric.higher_is_closer() { to_a >= to_b } else { to_a <= to_b };
            if closer_to_a {
                left_points.push(entry);
            } else {
                right_points.push(entry);
            }
        }
        if left_points.is_empty() || right_points.is_empty() {
            // Degenerate partition (e.g. all points identical); fall back to
            // an even split rather than recursing forever.
            let mid = left_points.len().max(right_points.len()) / 2;
            let mut combined = left_points;
            combined.append(&mut right_points);
            right_points = combined.split_off(mid.min(combined.len()));
            left_points = combined;
        }

        let left = Self::build_node(left_points, dimension, metric, rng)?;
        let right = Self::build_node(right_points, dimension, metric, rng)?;
        Ok(Some(Box::new(Node { centroid, radius, members: Vec::new(), left, right })))
    }

    /// Full traversal pruned against a fixed `bound` (e.g. a query radius):
    /// skips any subtree whose ball cannot contain a point at or within
    /// `bound` of `query`.
    fn visit(node: &Node, query: &[f32], metric: DistanceMetric, bound: f32, out: &mut Vec<(VectorId, f32)>) -> Result<()> {
        let center_dist = metric.scalar(query, &node.centroid)?;
        let prunable = if metric.higher_is_closer() {
            center_dist + node.radius < bound
        } else {
            center_dist - node.radius > bound
        };
        if prunable {
            return Ok(());
        }

        if !node.members.is_empty() {
            for (id, v) in &node.members {
                out.push((*id, metric.scalar(query, v)?));
            }
            return Ok(());
        }
        if let Some(left) = &node.left {
            Self::visit(left, query, metric, bound, out)?;
        }
        if let Some(right) = &node.right {
            Self::visit(right, query, metric, bound, out)?;
        }
        Ok(())
    }

    /// Visits the child whose centroid is closer to `query` first, so the
    /// running k-bound tightens as early as possible.
    fn ordered_children<'a>(node: &'a Node, query: &[f32], metric: DistanceMetric) -> Result<(Option<&'a Node>, Option<&'a Node>)> {
        let (Some(left), Some(right)) = (&node.left, &node.right) else {
            return Ok((node.left.as_deref(), node.right.as_deref()));
        };
        let to_left = metric.scalar(query, &left.centroid)?;
        let to_right = metric.scalar(query, &right.centroid)?;
        let left_first = if metric.higher_is_closer() { to_left >= to_right } else { to_left <= to_right };
        Ok(if left_first { (Some(left), Some(right)) } else { (Some(right), Some(left)) })
    }

    /// Best-`k` traversal: prunes a subtree once its ball cannot beat the
    /// current worst retained candidate, a bound that tightens as the heap
    /// fills, unlike a traversal pruned against a fixed radius.
    fn visit_k(node: &Node, query: &[f32], k: usize, metric: DistanceMetric, heap: &mut BinaryHeap<HeapItem>) -> Result<()> {
        let center_dist = metric.scalar(query, &node.centroid)?;
        if heap.len() >= k {
            let worst = heap.peek().expect("heap.len() >= k > 0 implies a peek").score;
            let prunable = if metric.higher_is_closer() {
                center_dist + node.radius < worst
            } else {
                center_dist - node.radius > worst
            };
            if prunable {
                return Ok(());
            }
        }

        if !node.members.is_empty() {
            for (id, v) in &node.members {
                let score = metric.scalar(query, v)?;
                offer(heap, *id, score, k, metric.higher_is_closer());
            }
            return Ok(());
        }
        let (first, second) = Self::ordered_children(node, query, metric)?;
        if let Some(first) = first {
            Self::visit_k(first, query, k, metric, heap)?;
        }
        if let Some(second) = second {
            Self::visit_k(second, query, k, metric, heap)?;
        }
        Ok(())
    }

    fn count_nodes(node: Option<&Node>) -> usize {
        match node {
            None => 0,
            Some(n) if !n.members.is_empty() => 1,
            Some(n) => 1 + Self::count_nodes(n.left.as_deref()) + Self::count_nodes(n.right.as_deref()),
        }
    }

    fn save_node(node: Option<&Node>, writer: &mut dyn Write) -> Result<()> {
        match node {
            None => Ok(()),
            Some(n) if !n.members.is_empty() => {
                write_u8(writer, 0)?;
                for &c in &n.centroid {
                    write_f32(writer, c)?;
                }
                write_f32(writer, n.radius)?;
                write_u32(writer, n.members.len() as u32)?;
                for (id, _) in &n.members {
                    write_u128(writer, id.0)?;
                }
                Ok(())
            }
            Some(n) => {
                Self::save_node(n.left.as_deref(), writer)?;
                Self::save_node(n.right.as_deref(), writer)?;
                write_u8(writer, 1)?;
                let flags = (n.left.is_some() as u8) | ((n.right.is_some() as u8) << 1);
                write_u8(writer, flags)?;
                for &c in &n.centroid {
                    write_f32(writer, c)?;
                }
                write_f32(writer, n.radius)
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

impl SearchIndex for BallTreeIndex {
    fn build(&mut self, entries: &[IndexEntry]) -> Result<()> {
        let dimension = entries.first().map_or(0, |(_, v)| v.len());
        self.len = entries.len();
        let mut rng = Xorshift64::new(self.seed);
        self.root = Self::build_node(entries.to_vec(), dimension, self.metric, &mut rng)?;
        Ok(())
    }

    fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<ScoredId>> {
        let Some(root) = &self.root else { return Ok(Vec::new()) };
        if k == 0 {
            return Ok(Vec::new());
        }
        let mut heap = BinaryHeap::new();
        Self::visit_k(root, query, k, self.metric, &mut heap)?;

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
        let mut all = Vec::new();
        Self::visit(root, query, self.metric, radius, &mut all)?;
        let higher_is_closer = self.metric.higher_is_closer();
        all.retain(|(_, d)| if higher_is_closer { *d >= radius } else { *d <= radius });
        all.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        Ok(all.into_iter().map(|(id, score)| ScoredId::new(id, score)).collect())
    }

    fn len(&self) -> usize {
        self.len
    }

    /// Post-order structural dump carrying each node's derived centroid and
    /// radius (not resolvable from a snapshot), plus member/child identifiers.
    fn save(&self, writer: &mut dyn Write) -> Result<()> {
        write_u32(writer, self.len as u32)?;
        write_u32(writer, Self::count_nodes(self.root.as_deref()) as u32)?;
        write_u8(writer, self.root.is_some() as u8)?;
        Self::save_node(self.root.as_deref(), writer)
    }

    fn load(&mut self, reader: &mut dyn Read, snapshot: &[IndexEntry]) -> Result<()> {
        let map = snapshot_map(snapshot);
        let dimension = snapshot.first().map_or(0, |(_, v)| v.len());
        let len = read_u32(reader)? as usize;
        let node_count = read_u32(reader)? as usize;
        let has_root = read_u8(reader)? != 0;

        if !has_root {
            self.len = len;
            self.root = None;
            return Ok(());
        }

        let mut stack: Vec<Box<Node>> = Vec::new();
        for _ in 0..node_count {
            let tag = read_u8(reader)?;
            match tag {
                0 => {
                    let mut centroid = Vec::with_capacity(dimension);
                    for _ in 0..dimension {
                        centroid.push(read_f32(reader)?);
                    }
                    let radius = read_f32(reader)?;
                    let member_count = read_u32(reader)? as usize;
                    let mut members = Vec::with_capacity(member_count);
                    for _ in 0..member_count {
                        let id = read_u128(reader)?;
                        let values = super::resolve(&map, id)?;
                        members.push((VectorId::from_u128(id), values));
                    }
                    stack.push(Box::new(Node { centroid, radius, members, left: None, right: None }));
                }
                1 => {
                    let flags = read_u8(reader)?;
                    let mut centroid = Vec::with_capacity(dimension);
                    for _ in 0..dimension {
                        centroid.push(read_f32(reader)?);
                    }
                    let radius = read_f32(reader)?;
                    let right = if flags & 0b10 != 0 {
                        Some(stack.pop().ok_or_else(|| Error::CorruptHeader("ball tree snapshot missing right child".into()))?)
                    } else {
                        None
                    };
                    let left = if flags & 0b01 != 0 {
                        Some(stack.pop().ok_or_else(|| Error::CorruptHeader("ball tree snapshot missing left child".into()))?)
                    } else {
                        None
                    };
                    stack.push(Box::new(Node { centroid, radius, members: Vec::new(), left, right }));
                }
                other => return Err(Error::CorruptHeader(format!("unknown ball tree node tag {other}"))),
            }
        }
        let root = stack.pop();
        if !stack.is_empty() {
            return Err(Error::CorruptHeader("ball tree snapshot left unconsumed nodes".into()));
        }

        self.len = len;
        self.root = root;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries() -> Vec<IndexEntry> {
        (0..40)
            .map(|i| (VectorId::from_u128(i as u128), vec![i as f32, 0.0]))
            .collect()
    }

    #[test]
    fn nearest_finds_exact_match() {
        let mut idx = BallTreeIndex::new(DistanceMetric::Euclidean);
        idx.build(&entries()).unwrap();
        let result = idx.nearest(&[10.0, 0.0], 1).unwrap();
        assert_eq!(result[0].id, VectorId::from_u128(10));
    }

    #[test]
    fn range_respects_radius() {
        let mut idx = BallTreeIndex::new(DistanceMetric::Euclidean);
        idx.build(&entries()).unwrap();
        let result = idx.range(&[0.0, 0.0], 2.5).unwrap();
        assert!(result.len() >= 2);
        for r in &result {
            assert!(r.score <= 2.5);
        }
    }

    #[test]
    fn degenerate_identical_points() {
        let mut idx = BallTreeIndex::new(DistanceMetric::Euclidean);
        let entries: Vec<IndexEntry> = (0..10).map(|i| (VectorId::from_u128(i), vec![1.0, 1.0])).collect();
        idx.build(&entries).unwrap();
        let result = idx.nearest(&[1.0, 1.0], 5).unwrap();
        assert_eq!(result.len(), 5);
    }

    #[test]
    fn nearest_matches_full_scan() {
        let mut idx = BallTreeIndex::new(DistanceMetric::Euclidean);
        let data = entries();
        idx.build(&data).unwrap();

        for qx in [-5.0, 0.0, 12.3, 24.9, 39.0, 60.0] {
            let query = [qx, 0.0];
            let got = idx.nearest(&query, 4).unwrap();

            let mut expected: Vec<(VectorId, f32)> = data
                .iter()
                .map(|(id, v)| (*id, DistanceMetric::Euclidean.scalar(&query, v).unwrap()))
                .collect();
            expected.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
            expected.truncate(4);

            assert_eq!(got.len(), expected.len());
            for (g, e) in got.iter().zip(expected.iter()) {
                assert!((g.score - e.1).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn save_load_round_trip() {
        let mut idx = BallTreeIndex::new(DistanceMetric::Euclidean);
        let data = entries();
        idx.build(&data).unwrap();
        let mut bytes = Vec::new();
        idx.save(&mut bytes).unwrap();

        let mut reloaded = BallTreeIndex::new(DistanceMetric::Euclidean);
        reloaded.load(&mut bytes.as_slice(), &data).unwrap();
        assert_eq!(reloaded.len(), idx.len());
        assert_eq!(reloaded.nearest(&[10.0, 0.0], 3).unwrap(), idx.nearest(&[10.0, 0.0], 3).unwrap());
    }
}
