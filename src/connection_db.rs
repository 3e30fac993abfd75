use crate::block::{Block, InputKind};
use crate::connection::{ConnectionKind, ConnectionRef, Slot};
use crate::workspace::Workspace;
use anyhow::Result;
use std::collections::HashSet;

/// Height of one input row in workspace units.
pub const ROW_HEIGHT: f64 = 24.0;
/// Horizontal offset of value sockets from the block's left edge.
pub const VALUE_INPUT_X: f64 = 80.0;
/// Horizontal offset of statement sockets.
pub const STATEMENT_INPUT_X: f64 = 16.0;

#[derive(Debug, Clone, PartialEq)]
struct Entry {
    conn: ConnectionRef,
    x: f64,
    y: f64,
}

/// Connections of one workspace, bucketed by kind and sorted by y.
#[derive(Debug, Clone, Default)]
pub struct ConnectionDb {
    lists: [Vec<Entry>; 4],
}

impl ConnectionDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexes every connection in the workspace except those on `skip`.
    pub fn build(ws: &Workspace, skip: &HashSet<String>) -> Self {
        let mut db = Self::new();
        for (conn, x, y) in connection_positions(ws) {
            if !skip.contains(&conn.block) {
                if let Some(kind) = ws.connection(&conn).map(|c| c.kind) {
                    db.add(kind, conn, x, y);
                }
            }
        }
        db
    }

    pub fn len(&self) -> usize {
        self.lists.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add(&mut self, kind: ConnectionKind, conn: ConnectionRef, x: f64, y: f64) {
        let list = &mut self.lists[kind.index()];
        let at = list.partition_point(|e| e.y < y);
        list.insert(at, Entry { conn, x, y });
    }

    pub fn remove(&mut self, kind: ConnectionKind, conn: &ConnectionRef) -> bool {
        let list = &mut self.lists[kind.index()];
        match list.iter().position(|e| &e.conn == conn) {
            Some(at) => {
                list.remove(at);
                true
            }
            None => false,
        }
    }

    /// Connections of `kind` within `radius` of (x, y).
    pub fn neighbours(&self, kind: ConnectionKind, x: f64, y: f64, radius: f64) -> Vec<ConnectionRef> {
        let list = &self.lists[kind.index()];
        let start = list.partition_point(|e| e.y < y - radius);
        list[start..]
            .iter()
            .take_while(|e| e.y <= y + radius)
            .filter(|e| distance(e.x, e.y, x, y) <= radius)
            .map(|e| e.conn.clone())
            .collect()
    }

    /// Closest connection that `conn`, sitting at (x, y), may legally join,
    /// with its distance. Only connections of the opposite kind are looked at.
    pub fn search_for_closest(
        &self,
        ws: &Workspace,
        conn: &ConnectionRef,
        x: f64,
        y: f64,
        max_radius: f64,
    ) -> Option<(ConnectionRef, f64)> {
        let kind = ws.connection(conn)?.kind;
        let list = &self.lists[kind.opposite().index()];
        if list.is_empty() {
            return None;
        }
        let checker = ws.checker();
        let mut best: Option<(ConnectionRef, f64)> = None;
        let mut radius = max_radius;
        let start = list.partition_point(|e| e.y < y);

        let mut consider = |entry: &Entry, radius: &mut f64| {
            let d = distance(entry.x, entry.y, x, y);
            if d <= *radius && checker.can_connect(ws, conn, &entry.conn, true) {
                *radius = d;
                best = Some((entry.conn.clone(), d));
            }
        };
        for entry in list[..start].iter().rev() {
            if y - entry.y > radius {
                break;
            }
            consider(entry, &mut radius);
        }
        for entry in &list[start..] {
            if entry.y - y > radius {
                break;
            }
            consider(entry, &mut radius);
        }
        best
    }
}

fn distance(ax: f64, ay: f64, bx: f64, by: f64) -> f64 {
    (ax - bx).hypot(ay - by)
}

/// Absolute position of every connection, laid out from each top block:
/// rows stack downwards, statement stacks are indented and push the rows
/// below them further down.
pub fn connection_positions(ws: &Workspace) -> Vec<(ConnectionRef, f64, f64)> {
    let mut out = Vec::new();
    for id in ws.top_blocks() {
        if let Some(block) = ws.block(id) {
            lay_out_stack(ws, block, block.x, block.y, &mut out);
        }
    }
    out
}

/// Lays out a block and everything below it; returns the stack height.
fn lay_out_stack(ws: &Workspace, block: &Block, x: f64, y: f64, out: &mut Vec<(ConnectionRef, f64, f64)>) -> f64 {
    let mut height = lay_out_block(ws, block, x, y, out);
    if let Some(next) = block.next_block().and_then(|id| ws.block(id)) {
        height += lay_out_stack(ws, next, x, y + height, out);
    }
    height
}

fn lay_out_block(ws: &Workspace, block: &Block, x: f64, y: f64, out: &mut Vec<(ConnectionRef, f64, f64)>) -> f64 {
    for slot in [Slot::Output, Slot::Previous] {
        if block.connection(&slot).is_some() {
            out.push((ConnectionRef { block: block.id.clone(), slot }, x, y));
        }
    }
    let mut row_y = y;
    for input in &block.inputs {
        let child = input.target_block().and_then(|id| ws.block(id));
        match input.kind {
            InputKind::Value => {
                out.push((ConnectionRef::input(&block.id, &input.name), x + VALUE_INPUT_X, row_y));
                let child_height = child.map_or(0.0, |c| lay_out_stack(ws, c, x + VALUE_INPUT_X, row_y, out));
                row_y += child_height.max(ROW_HEIGHT);
            }
            InputKind::Statement => {
                out.push((ConnectionRef::input(&block.id, &input.name), x + STATEMENT_INPUT_X, row_y));
                let child_height = child.map_or(0.0, |c| lay_out_stack(ws, c, x + STATEMENT_INPUT_X, row_y, out));
                row_y += child_height.max(ROW_HEIGHT);
            }
            InputKind::Dummy => row_y += ROW_HEIGHT,
        }
    }
    let height = (row_y - y).max(ROW_HEIGHT);
    if block.next.is_some() {
        out.push((ConnectionRef::next(&block.id), x, y + height));
    }
    height
}

impl Workspace {
    /// Connects a top-level block to the nearest compatible connection
    /// within the snap radius. Returns false when nothing was in range.
    pub fn snap_block(&mut self, id: &str) -> Result<bool> {
        let block = self.get_block(id)?;
        if block.parent.is_some() {
            return Ok(false);
        }
        let dragged: HashSet<String> = self.descendants(id).into_iter().collect();
        let db = ConnectionDb::build(self, &dragged);
        let positions = connection_positions(self);
        let last_in_stack = self.last_in_stack(id);

        let mut best: Option<(ConnectionRef, ConnectionRef, f64)> = None;
        for (conn, x, y) in positions.iter().filter(|(c, _, _)| dragged.contains(&c.block)) {
            let candidate = match conn.slot {
                Slot::Output | Slot::Previous => conn.block == id,
                Slot::Next => conn.block == last_in_stack,
                Slot::Input(_) => conn.block == id,
            };
            if !candidate {
                continue;
            }
            let radius = best.as_ref().map_or(self.options.snap_radius, |b| b.2);
            if let Some((target, d)) = db.search_for_closest(self, conn, *x, *y, radius) {
                best = Some((conn.clone(), target, d));
            }
        }
        let Some((conn, target, d)) = best else {
            log::trace!("nothing to snap {} to", id);
            return Ok(false);
        };
        log::debug!("snapping {} to {} ({:.1} away)", conn, target, d);
        self.connect(&conn, &target)
    }

    fn last_in_stack(&self, id: &str) -> String {
        let mut current = id.to_string();
        while let Some(next) = self.block(&current).and_then(Block::next_block) {
            current = next.clone();
        }
        current
    }
}
