use crate::block::BlockId;
use crate::workspace::Workspace;
use anyhow::Result;
use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    BlockCreate,
    BlockDelete,
    BlockChange,
    BlockMove,
    VarCreate,
    VarRename,
    VarDelete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeElement {
    Field(String),
    Disabled,
    Collapsed,
    Comment,
    Mutation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventData {
    BlockCreate {
        block_id: BlockId,
        ids: Vec<BlockId>,
    },
    BlockDelete {
        block_id: BlockId,
        ids: Vec<BlockId>,
        block_type: String,
    },
    BlockChange {
        block_id: BlockId,
        element: ChangeElement,
        old_value: Option<String>,
        new_value: Option<String>,
    },
    BlockMove {
        block_id: BlockId,
        old_parent: Option<BlockId>,
        old_input: Option<String>,
        new_parent: Option<BlockId>,
        new_input: Option<String>,
    },
    VarCreate {
        var_id: String,
        name: String,
    },
    VarRename {
        var_id: String,
        old_name: String,
        new_name: String,
    },
    VarDelete {
        var_id: String,
        name: String,
    },
}

impl EventData {
    pub fn kind(&self) -> EventKind {
        match self {
            EventData::BlockCreate { .. } => EventKind::BlockCreate,
            EventData::BlockDelete { .. } => EventKind::BlockDelete,
            EventData::BlockChange { .. } => EventKind::BlockChange,
            EventData::BlockMove { .. } => EventKind::BlockMove,
            EventData::VarCreate { .. } => EventKind::VarCreate,
            EventData::VarRename { .. } => EventKind::VarRename,
            EventData::VarDelete { .. } => EventKind::VarDelete,
        }
    }

    pub fn block_id(&self) -> Option<&str> {
        match self {
            EventData::BlockCreate { block_id, .. }
            | EventData::BlockDelete { block_id, .. }
            | EventData::BlockChange { block_id, .. }
            | EventData::BlockMove { block_id, .. } => Some(block_id),
            EventData::VarCreate { .. } | EventData::VarRename { .. } | EventData::VarDelete { .. } => {
                None
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub data: EventData,
    pub group: Option<String>,
    pub record_undo: bool,
}

pub type Listener = fn(&mut Workspace, &Event) -> Result<()>;

/// Subscription table keyed by event kind, plus the undo log.
#[derive(Debug)]
pub struct EventBus {
    disabled: u32,
    group: Option<String>,
    record_undo: bool,
    listeners: HashMap<EventKind, Vec<Listener>>,
    queue: VecDeque<Event>,
    dispatching: bool,
    undo_log: Vec<Event>,
    group_counter: u64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            disabled: 0,
            group: None,
            record_undo: true,
            listeners: HashMap::new(),
            queue: VecDeque::new(),
            dispatching: false,
            undo_log: Vec::new(),
            group_counter: 0,
        }
    }
}

impl EventBus {
    pub fn is_enabled(&self) -> bool {
        self.disabled == 0
    }

    pub fn subscribe(&mut self, kind: EventKind, listener: Listener) {
        self.listeners.entry(kind).or_default().push(listener);
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn undo_log(&self) -> &[Event] {
        &self.undo_log
    }

    pub fn events_in_group(&self, group: &str) -> Vec<&Event> {
        self.undo_log
            .iter()
            .filter(|e| e.group.as_deref() == Some(group))
            .collect()
    }

    pub fn clear_undo(&mut self) {
        self.undo_log.clear();
    }

    fn new_group_id(&mut self) -> String {
        self.group_counter += 1;
        format!("group-{}", self.group_counter)
    }
}

impl Workspace {
    /// Records and dispatches an event. Events raised by listeners are queued
    /// and delivered after the current one, in order.
    pub fn fire(&mut self, data: EventData) -> Result<()> {
        if !self.events.is_enabled() {
            return Ok(());
        }
        let mut group = self.events.group.clone();
        if group.is_none() && data.kind() == EventKind::BlockCreate {
            // Adopted definitions join the group of the create that caused them.
            group = Some(self.events.new_group_id());
        }
        let event = Event {
            data,
            group,
            record_undo: self.events.record_undo,
        };
        log::trace!("fire {:?}", event);
        if event.record_undo {
            self.events.undo_log.push(event.clone());
        }
        self.events.queue.push_back(event);
        if self.events.dispatching {
            return Ok(());
        }
        self.events.dispatching = true;
        let result = self.dispatch_queued();
        self.events.dispatching = false;
        if result.is_err() {
            self.events.queue.clear();
        }
        result
    }

    fn dispatch_queued(&mut self) -> Result<()> {
        while let Some(event) = self.events.queue.pop_front() {
            let listeners = self
                .events
                .listeners
                .get(&event.data.kind())
                .cloned()
                .unwrap_or_default();
            for listener in listeners {
                listener(self, &event)?;
            }
        }
        Ok(())
    }

    /// Suspends event delivery until the returned guard is dropped.
    pub fn begin_batch(&mut self) -> Batch<'_> {
        self.events.disabled += 1;
        Batch { ws: self }
    }

    /// Runs with `group` as the current event group, or a fresh one when no
    /// group is active. The previous group is restored on drop.
    pub fn begin_group(&mut self, group: Option<String>) -> GroupScope<'_> {
        let previous = self.events.group.clone();
        match group {
            Some(g) => self.events.group = Some(g),
            None if self.events.group.is_none() => {
                self.events.group = Some(self.events.new_group_id());
            }
            None => {}
        }
        GroupScope { ws: self, previous }
    }

    /// Events fired inside the scope are delivered but not recorded for undo.
    pub fn without_undo(&mut self) -> UndoScope<'_> {
        let previous = self.events.record_undo;
        self.events.record_undo = false;
        UndoScope { ws: self, previous }
    }
}

pub struct Batch<'a> {
    ws: &'a mut Workspace,
}

impl Batch<'_> {
    pub fn end(self) {}
}

impl Deref for Batch<'_> {
    type Target = Workspace;

    fn deref(&self) -> &Workspace {
        self.ws
    }
}

impl DerefMut for Batch<'_> {
    fn deref_mut(&mut self) -> &mut Workspace {
        self.ws
    }
}

impl Drop for Batch<'_> {
    fn drop(&mut self) {
        self.ws.events.disabled = self.ws.events.disabled.saturating_sub(1);
    }
}

pub struct GroupScope<'a> {
    ws: &'a mut Workspace,
    previous: Option<String>,
}

impl GroupScope<'_> {
    pub fn group(&self) -> Option<&str> {
        self.ws.events.group()
    }
}

impl Deref for GroupScope<'_> {
    type Target = Workspace;

    fn deref(&self) -> &Workspace {
        self.ws
    }
}

impl DerefMut for GroupScope<'_> {
    fn deref_mut(&mut self) -> &mut Workspace {
        self.ws
    }
}

impl Drop for GroupScope<'_> {
    fn drop(&mut self) {
        self.ws.events.group = self.previous.take();
    }
}

pub struct UndoScope<'a> {
    ws: &'a mut Workspace,
    previous: bool,
}

impl Deref for UndoScope<'_> {
    type Target = Workspace;

    fn deref(&self) -> &Workspace {
        self.ws
    }
}

impl DerefMut for UndoScope<'_> {
    fn deref_mut(&mut self) -> &mut Workspace {
        self.ws
    }
}

impl Drop for UndoScope<'_> {
    fn drop(&mut self) {
        self.ws.events.record_undo = self.previous;
    }
}
