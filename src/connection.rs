use crate::block::BlockId;
use crate::state::BlockState;
use crate::types::TypeCheck;
use crate::workspace::Workspace;
use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    InputValue,
    OutputValue,
    NextStatement,
    PreviousStatement,
}

impl ConnectionKind {
    /// Superior connections face down or right: they own the child.
    pub fn is_superior(self) -> bool {
        matches!(self, ConnectionKind::InputValue | ConnectionKind::NextStatement)
    }

    pub fn opposite(self) -> Self {
        match self {
            ConnectionKind::InputValue => ConnectionKind::OutputValue,
            ConnectionKind::OutputValue => ConnectionKind::InputValue,
            ConnectionKind::NextStatement => ConnectionKind::PreviousStatement,
            ConnectionKind::PreviousStatement => ConnectionKind::NextStatement,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            ConnectionKind::InputValue => 0,
            ConnectionKind::OutputValue => 1,
            ConnectionKind::NextStatement => 2,
            ConnectionKind::PreviousStatement => 3,
        }
    }
}

/// Where on its block a connection lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Slot {
    Output,
    Previous,
    Next,
    Input(String),
}

/// Address of a connection: owning block plus slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionRef {
    pub block: BlockId,
    pub slot: Slot,
}

impl ConnectionRef {
    pub fn output(block: &str) -> Self {
        Self {
            block: block.to_string(),
            slot: Slot::Output,
        }
    }

    pub fn previous(block: &str) -> Self {
        Self {
            block: block.to_string(),
            slot: Slot::Previous,
        }
    }

    pub fn next(block: &str) -> Self {
        Self {
            block: block.to_string(),
            slot: Slot::Next,
        }
    }

    pub fn input(block: &str, name: &str) -> Self {
        Self {
            block: block.to_string(),
            slot: Slot::Input(name.to_string()),
        }
    }

    pub fn input_name(&self) -> Option<&str> {
        match &self.slot {
            Slot::Input(name) => Some(name),
            _ => None,
        }
    }
}

impl Display for ConnectionRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.slot {
            Slot::Output => write!(f, "output connection of block '{}'", self.block),
            Slot::Previous => write!(f, "previous connection of block '{}'", self.block),
            Slot::Next => write!(f, "next connection of block '{}'", self.block),
            Slot::Input(name) => write!(f, "input \"{}\" connection on block '{}'", name, self.block),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    pub kind: ConnectionKind,
    pub check: TypeCheck,
    pub target: Option<ConnectionRef>,
    /// Default block re-instantiated when nothing real is plugged in.
    pub shadow: Option<BlockState>,
}

impl Connection {
    pub fn new(kind: ConnectionKind) -> Self {
        Self {
            kind,
            check: TypeCheck::Any,
            target: None,
            shadow: None,
        }
    }

    pub fn with_check(kind: ConnectionKind, check: TypeCheck) -> Self {
        Self {
            check,
            ..Self::new(kind)
        }
    }

    pub fn is_connected(&self) -> bool {
        self.target.is_some()
    }

    pub fn target_block(&self) -> Option<&BlockId> {
        self.target.as_ref().map(|t| &t.block)
    }
}

/// Why two connections may not be joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectReason {
    TargetNull(ConnectionRef),
    SelfConnection,
    WrongType,
    ChecksFailed,
    ShadowParent,
    PreviousAndOutput,
    Cycle,
    DragChecksFailed,
}

impl Display for ConnectReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectReason::TargetNull(r) => write!(f, "Connection does not exist: {}.", r),
            ConnectReason::SelfConnection => write!(f, "Attempted to connect a block to itself."),
            ConnectReason::WrongType => write!(f, "Attempt to connect incompatible connection types."),
            ConnectReason::ChecksFailed => write!(f, "Connection checks failed."),
            ConnectReason::ShadowParent => {
                write!(f, "Connecting non-shadow to shadow block.")
            }
            ConnectReason::PreviousAndOutput => write!(
                f,
                "Block would have an output and a previous connection both in use."
            ),
            ConnectReason::Cycle => write!(f, "Connection would place a block inside itself."),
            ConnectReason::DragChecksFailed => write!(f, "Drag checks failed."),
        }
    }
}

impl Error for ConnectReason {}

/// Decides which connections may legally snap together.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionChecker;

impl ConnectionChecker {
    pub fn can_connect(
        &self,
        ws: &Workspace,
        a: &ConnectionRef,
        b: &ConnectionRef,
        is_dragging: bool,
    ) -> bool {
        self.can_connect_with_reason(ws, a, b, is_dragging).is_ok()
    }

    pub fn can_connect_with_reason(
        &self,
        ws: &Workspace,
        a: &ConnectionRef,
        b: &ConnectionRef,
        is_dragging: bool,
    ) -> Result<(), ConnectReason> {
        self.safety_checks(ws, a, b)?;
        if !self.type_checks(ws, a, b) {
            return Err(ConnectReason::ChecksFailed);
        }
        if is_dragging && !self.drag_checks(ws, a, b) {
            return Err(ConnectReason::DragChecksFailed);
        }
        Ok(())
    }

    fn safety_checks(
        &self,
        ws: &Workspace,
        a: &ConnectionRef,
        b: &ConnectionRef,
    ) -> Result<(), ConnectReason> {
        let conn_a = ws
            .connection(a)
            .ok_or_else(|| ConnectReason::TargetNull(a.clone()))?;
        let conn_b = ws
            .connection(b)
            .ok_or_else(|| ConnectReason::TargetNull(b.clone()))?;
        if a.block == b.block {
            return Err(ConnectReason::SelfConnection);
        }
        if conn_b.kind != conn_a.kind.opposite() {
            return Err(ConnectReason::WrongType);
        }
        let (superior, inferior, inferior_kind) = if conn_a.kind.is_superior() {
            (&a.block, &b.block, conn_b.kind)
        } else {
            (&b.block, &a.block, conn_a.kind)
        };
        let (Some(superior_block), Some(inferior_block)) = (ws.block(superior), ws.block(inferior))
        else {
            return Err(ConnectReason::TargetNull(b.clone()));
        };
        if superior_block.shadow && !inferior_block.shadow {
            return Err(ConnectReason::ShadowParent);
        }
        if inferior_kind == ConnectionKind::OutputValue
            && inferior_block
                .previous
                .as_ref()
                .is_some_and(Connection::is_connected)
        {
            return Err(ConnectReason::PreviousAndOutput);
        }
        if inferior_kind == ConnectionKind::PreviousStatement
            && inferior_block
                .output
                .as_ref()
                .is_some_and(Connection::is_connected)
        {
            return Err(ConnectReason::PreviousAndOutput);
        }
        if ws.is_ancestor_or_self(inferior, superior) {
            return Err(ConnectReason::Cycle);
        }
        Ok(())
    }

    /// Value checks only; statement connections carry them too.
    fn type_checks(&self, ws: &Workspace, a: &ConnectionRef, b: &ConnectionRef) -> bool {
        match (ws.connection(a), ws.connection(b)) {
            (Some(left), Some(right)) => left.check.intersects(&right.check),
            _ => false,
        }
    }

    fn drag_checks(&self, ws: &Workspace, a: &ConnectionRef, b: &ConnectionRef) -> bool {
        let (Some(conn_a), Some(conn_b)) = (ws.connection(a), ws.connection(b)) else {
            return false;
        };
        let target_of_b = conn_b.target_block().and_then(|id| ws.block(id));
        match conn_b.kind {
            ConnectionKind::PreviousStatement => !conn_a.is_connected() && !conn_b.is_connected(),
            ConnectionKind::OutputValue => !conn_a.is_connected() && !conn_b.is_connected(),
            ConnectionKind::InputValue => true,
            ConnectionKind::NextStatement => {
                // A block without a next connection cannot push a real stack down.
                let dragged_has_next = ws.block(&a.block).is_some_and(|blk| blk.next.is_some());
                match target_of_b {
                    Some(target) if !target.shadow && target.next.is_some() => dragged_has_next,
                    _ => true,
                }
            }
        }
    }
}
