// THEORY:
// The `TrajectoryAssembler` is the last layer of the tracker. Once every frame
// pair has been matched and corrected, each node has at most one `best_next`
// and at most one `best_prev`, so the graph is a set of disjoint chains. Every
// chain starts at a seed (a frame-1 node, a lone node, or a division daughter)
// and is read by following `best_next` until it runs out.
//
// Each chain gets a fresh identifier and a name from an `IdGenerator` that the
// assembler owns, so naming never depends on shared global state. Daughters of a
// division record the trajectory that holds their mother node, which keeps the
// lineage tree without storing it in the graph.
//
// Finished trajectories are handed to a `TrajectoryStore`. The in-memory
// `CellStore` keeps, per cell, one shape collection per `ShapeKind` and a table
// with one row per time point.

use crate::core_modules::node::{NodeGraph, NodeId};
use crate::core_modules::region::RegionShape;
use crate::error::{TrackError, TrackResult};
use log::{debug, warn};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrajectoryId(pub u64);

/// Hands out trajectory identifiers and cell names, counting from 1.
/// Names are `Cell{n}`, or `Cell{position}{n}` when a stage position is set.
/// Position 0 counts as unset.
#[derive(Debug, Clone)]
pub struct IdGenerator {
    next: u64,
    position: Option<u32>,
}

impl IdGenerator {
    pub fn new(position: Option<u32>) -> Self {
        Self {
            next: 1,
            position: position.filter(|&p| p != 0),
        }
    }

    pub fn next_id(&mut self) -> (TrajectoryId, String) {
        let n = self.next;
        self.next += 1;
        let name = match self.position {
            Some(position) => format!("Cell{position}{n}"),
            None => format!("Cell{n}"),
        };
        (TrajectoryId(n), name)
    }
}

/// One time point of a trajectory.
#[derive(Debug, Clone)]
pub struct TrajectoryPoint<S> {
    /// 1-based frame index ("slice").
    pub frame: usize,
    /// `{name}_t{i}` where `i` is the point's index in the trajectory.
    pub base_name: String,
    pub node: NodeId,
    pub shape: S,
}

/// An ordered chain of shapes belonging to one object.
#[derive(Debug, Clone)]
pub struct Trajectory<S> {
    pub id: TrajectoryId,
    pub name: String,
    /// Trajectory holding the mother node, for division daughters.
    pub mother: Option<TrajectoryId>,
    pub points: Vec<TrajectoryPoint<S>>,
}

impl<S> Trajectory<S> {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn first_frame(&self) -> Option<usize> {
        self.points.first().map(|p| p.frame)
    }

    pub fn last_frame(&self) -> Option<usize> {
        self.points.last().map(|p| p.frame)
    }

    pub fn frames(&self) -> Vec<usize> {
        self.points.iter().map(|p| p.frame).collect()
    }
}

/// Walks the resolved graph into trajectories.
#[derive(Debug, Clone)]
pub struct TrajectoryAssembler {
    ids: IdGenerator,
}

impl TrajectoryAssembler {
    pub fn new(ids: IdGenerator) -> Self {
        Self { ids }
    }

    /// Emits one trajectory per seed, in seed order. Retired and repeated seeds
    /// are skipped. Reaching a node that already belongs to another trajectory
    /// means the matching left a broken chain and is an error.
    pub fn assemble<S: RegionShape>(
        &mut self,
        graph: &NodeGraph<S>,
        seeds: &[NodeId],
    ) -> TrackResult<Vec<Trajectory<S>>> {
        let mut owner: HashMap<NodeId, TrajectoryId> = HashMap::new();
        let mut trajectories = Vec::new();

        for &seed in seeds {
            if owner.contains_key(&seed) {
                continue;
            }
            if graph.node(seed).retired {
                warn!("seed {seed:?} was replaced during correction, skipping it");
                continue;
            }

            let (id, name) = self.ids.next_id();
            let mother = graph
                .node(seed)
                .mother
                .and_then(|m| owner.get(&m).copied());

            let mut points = Vec::new();
            let mut current = Some(seed);
            while let Some(node_id) = current {
                if owner.insert(node_id, id).is_some() {
                    return Err(TrackError::BrokenLink {
                        from: seed.0,
                        to: node_id.0,
                        reason: "node reached by two trajectories",
                    });
                }
                let node = graph.node(node_id);
                points.push(TrajectoryPoint {
                    frame: node.frame,
                    base_name: format!("{name}_t{}", points.len()),
                    node: node_id,
                    shape: node.shape.clone(),
                });
                current = node.best_next();
            }

            debug!("{name}: {} points from frame {}", points.len(), graph.node(seed).frame);
            trajectories.push(Trajectory {
                id,
                name,
                mother,
                points,
            });
        }

        Ok(trajectories)
    }
}

/// Receiver of finished trajectories.
pub trait TrajectoryStore<S> {
    fn store(&mut self, trajectory: Trajectory<S>) -> TrackResult<()>;
}

impl<S> TrajectoryStore<S> for Vec<Trajectory<S>> {
    fn store(&mut self, trajectory: Trajectory<S>) -> TrackResult<()> {
        self.push(trajectory);
        Ok(())
    }
}

/// Which compartment of a cell a shape outlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShapeKind {
    Nucleus,
    Cytoplasm,
    FullCell,
}

/// One row of a cell's table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRow {
    pub slice: usize,
    pub base_name: String,
}

/// A tracked cell with its shapes per compartment.
#[derive(Debug, Clone)]
pub struct Cell<S> {
    pub name: String,
    pub mother: Option<String>,
    shapes: HashMap<ShapeKind, Vec<S>>,
    table: Vec<TableRow>,
}

impl<S: RegionShape> Cell<S> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mother: None,
            shapes: HashMap::new(),
            table: Vec::new(),
        }
    }

    /// Number of nuclei, the length of the cell in time points.
    pub fn len(&self) -> usize {
        self.shapes(ShapeKind::Nucleus).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shapes(&self, kind: ShapeKind) -> &[S] {
        self.shapes.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn table(&self) -> &[TableRow] {
        &self.table
    }

    /// Appends a shape to the `kind` collection. A table row is added when this
    /// collection is the first to reach the new time point.
    pub fn add_shape(&mut self, kind: ShapeKind, shape: S) {
        let list = self.shapes.entry(kind).or_default();
        let index = list.len();
        let slice = shape.frame();
        list.push(shape);
        if self.table.len() == index {
            self.table.push(TableRow {
                slice,
                base_name: format!("{}_t{index}", self.name),
            });
        }
    }

    /// Shape of `kind` at `slice`, if the cell has one there.
    pub fn shape_at(&self, kind: ShapeKind, slice: usize) -> Option<&S> {
        let index = self.table.iter().position(|row| row.slice == slice)?;
        self.shapes(kind).get(index)
    }

    /// Fills the cytoplasm collection as full cell minus nucleus, time point by
    /// time point. Returns how many cytoplasms were derived.
    pub fn derive_cytoplasm(&mut self) -> usize {
        let derived: Vec<S> = self
            .shapes(ShapeKind::FullCell)
            .iter()
            .zip(self.shapes(ShapeKind::Nucleus))
            .filter_map(|(full, nucleus)| {
                let cytoplasm = full.difference(nucleus);
                if cytoplasm.is_none() {
                    warn!("{}: nucleus covers the whole cell at slice {}", self.name, full.frame());
                }
                cytoplasm
            })
            .collect();
        let count = derived.len();
        self.shapes.insert(ShapeKind::Cytoplasm, derived);
        count
    }
}

/// In-memory cell store, one `Cell` per trajectory.
#[derive(Debug, Clone)]
pub struct CellStore<S> {
    cells: Vec<Cell<S>>,
    by_name: HashMap<String, usize>,
    names: HashMap<TrajectoryId, String>,
}

impl<S: RegionShape> CellStore<S> {
    pub fn new() -> Self {
        Self {
            cells: Vec::new(),
            by_name: HashMap::new(),
            names: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn cells(&self) -> &[Cell<S>] {
        &self.cells
    }

    pub fn get(&self, name: &str) -> Option<&Cell<S>> {
        self.by_name.get(name).map(|&i| &self.cells[i])
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Cell<S>> {
        self.by_name.get(name).map(|&i| &mut self.cells[i])
    }
}

impl<S: RegionShape> Default for CellStore<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: RegionShape> TrajectoryStore<S> for CellStore<S> {
    fn store(&mut self, trajectory: Trajectory<S>) -> TrackResult<()> {
        let mut cell = Cell::new(trajectory.name.clone());
        cell.mother = trajectory
            .mother
            .and_then(|id| self.names.get(&id).cloned());
        for point in trajectory.points {
            cell.add_shape(ShapeKind::Nucleus, point.shape);
        }

        self.names.insert(trajectory.id, trajectory.name.clone());
        self.by_name.insert(trajectory.name, self.cells.len());
        self.cells.push(cell);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::mask_shape::MaskShape;

    fn chain(graph: &mut NodeGraph<MaskShape>, frames: usize) -> Vec<NodeId> {
        let ids: Vec<NodeId> = (1..=frames)
            .map(|f| graph.add_node(f, MaskShape::rect(0, 0, 10, 10, f).unwrap()).unwrap())
            .collect();
        for pair in ids.windows(2) {
            graph.node_mut(pair[0]).overlap.best_next = Some(pair[1]);
            graph.node_mut(pair[1]).overlap.best_prev = Some(pair[0]);
        }
        ids
    }

    #[test]
    fn names_follow_stage_position() {
        let mut plain = IdGenerator::new(None);
        assert_eq!(plain.next_id(), (TrajectoryId(1), "Cell1".to_string()));
        assert_eq!(plain.next_id().1, "Cell2");

        let mut positioned = IdGenerator::new(Some(3));
        assert_eq!(positioned.next_id().1, "Cell31");
    }

    #[test]
    fn position_zero_is_unset() {
        let mut ids = IdGenerator::new(Some(0));
        assert_eq!(ids.next_id(), (TrajectoryId(1), "Cell1".to_string()));
        assert_eq!(ids.next_id().1, "Cell2");
    }

    #[test]
    fn walks_best_next_from_seed() {
        let mut graph = NodeGraph::new();
        let ids = chain(&mut graph, 3);

        let trajectories = TrajectoryAssembler::new(IdGenerator::new(None))
            .assemble(&graph, &[ids[0]])
            .unwrap();

        assert_eq!(trajectories.len(), 1);
        let t = &trajectories[0];
        assert_eq!(t.frames(), vec![1, 2, 3]);
        assert_eq!(t.points[2].base_name, "Cell1_t2");
        assert_eq!(t.mother, None);
    }

    #[test]
    fn daughter_records_mother_trajectory() {
        let mut graph = NodeGraph::new();
        let ids = chain(&mut graph, 2);
        let daughter = graph
            .add_node(3, MaskShape::rect(40, 0, 10, 10, 3).unwrap())
            .unwrap();
        graph.node_mut(daughter).mother = Some(ids[1]);

        let trajectories = TrajectoryAssembler::new(IdGenerator::new(None))
            .assemble(&graph, &[ids[0], daughter])
            .unwrap();

        assert_eq!(trajectories[1].mother, Some(trajectories[0].id));

        let mut store = CellStore::new();
        for t in trajectories {
            store.store(t).unwrap();
        }
        assert_eq!(store.get("Cell2").unwrap().mother.as_deref(), Some("Cell1"));
    }

    #[test]
    fn node_reached_twice_is_an_error() {
        let mut graph = NodeGraph::new();
        let ids = chain(&mut graph, 2);

        let err = TrajectoryAssembler::new(IdGenerator::new(None))
            .assemble(&graph, &[ids[1], ids[0]])
            .unwrap_err();
        assert!(matches!(err, TrackError::BrokenLink { .. }));
    }

    #[test]
    fn cell_table_and_cytoplasm() {
        let mut cell = Cell::new("Cell1");
        cell.add_shape(ShapeKind::Nucleus, MaskShape::rect(5, 5, 10, 10, 1).unwrap());
        cell.add_shape(ShapeKind::FullCell, MaskShape::rect(0, 0, 20, 20, 1).unwrap());
        cell.add_shape(ShapeKind::Nucleus, MaskShape::rect(6, 5, 10, 10, 2).unwrap());

        assert_eq!(cell.len(), 2);
        assert_eq!(
            cell.table(),
            &[
                TableRow { slice: 1, base_name: "Cell1_t0".to_string() },
                TableRow { slice: 2, base_name: "Cell1_t1".to_string() },
            ]
        );
        assert!(cell.shape_at(ShapeKind::Nucleus, 2).is_some());
        assert!(cell.shape_at(ShapeKind::FullCell, 2).is_none());

        assert_eq!(cell.derive_cytoplasm(), 1);
        let cytoplasm = &cell.shapes(ShapeKind::Cytoplasm)[0];
        assert_eq!(cytoplasm.area(), 300.0);
    }
}
