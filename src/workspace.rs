use crate::block::{Block, BlockId, FieldValue};
use crate::blocks::BlockRegistry;
use crate::connection::{Connection, ConnectionChecker, ConnectionKind, ConnectionRef};
use crate::events::{ChangeElement, EventBus, EventData};
use crate::procedures;
use crate::state;
use crate::types::TypeCheck;
use crate::variables::{VariableMap, VariableModel};
use anyhow::{anyhow, bail, Result};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct WorkspaceOptions {
    /// Maximum distance at which two connections snap together.
    pub snap_radius: f64,
    /// Improvise a shape for unknown block types instead of failing the load.
    pub lenient_block_types: bool,
}

impl Default for WorkspaceOptions {
    fn default() -> Self {
        Self {
            snap_radius: 28.0,
            lenient_block_types: true,
        }
    }
}

/// Owns every block, the variable map and the event bus.
#[derive(Debug)]
pub struct Workspace {
    blocks: HashMap<BlockId, Block>,
    top_blocks: Vec<BlockId>,
    pub variables: VariableMap,
    pub events: EventBus,
    pub registry: BlockRegistry,
    pub options: WorkspaceOptions,
    checker: ConnectionChecker,
    uid_counter: u64,
}

impl Default for Workspace {
    fn default() -> Self {
        Self::new()
    }
}

impl Workspace {
    pub fn new() -> Self {
        Self::with_options(WorkspaceOptions::default())
    }

    pub fn with_options(options: WorkspaceOptions) -> Self {
        Self::with_registry(BlockRegistry::standard(), options)
    }

    pub fn with_registry(registry: BlockRegistry, options: WorkspaceOptions) -> Self {
        let mut ws = Self {
            blocks: HashMap::new(),
            top_blocks: Vec::new(),
            variables: VariableMap::new(),
            events: EventBus::default(),
            registry,
            options,
            checker: ConnectionChecker,
            uid_counter: 0,
        };
        procedures::register_listeners(&mut ws.events);
        ws
    }

    pub fn checker(&self) -> ConnectionChecker {
        self.checker
    }

    /// Fresh id, unique among blocks and variables.
    pub fn gen_uid(&mut self) -> String {
        loop {
            self.uid_counter += 1;
            let id = format!("uid{}", self.uid_counter);
            if !self.blocks.contains_key(&id) && self.variables.by_id(&id).is_none() {
                return id;
            }
        }
    }

    pub fn block(&self, id: &str) -> Option<&Block> {
        self.blocks.get(id)
    }

    pub fn block_mut(&mut self, id: &str) -> Option<&mut Block> {
        self.blocks.get_mut(id)
    }

    pub fn get_block(&self, id: &str) -> Result<&Block> {
        self.blocks
            .get(id)
            .ok_or_else(|| anyhow!("Block '{}' does not exist.", id))
    }

    pub fn get_block_mut(&mut self, id: &str) -> Result<&mut Block> {
        self.blocks
            .get_mut(id)
            .ok_or_else(|| anyhow!("Block '{}' does not exist.", id))
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn connection(&self, r: &ConnectionRef) -> Option<&Connection> {
        self.blocks.get(&r.block)?.connection(&r.slot)
    }

    pub fn connection_mut(&mut self, r: &ConnectionRef) -> Option<&mut Connection> {
        self.blocks.get_mut(&r.block)?.connection_mut(&r.slot)
    }

    pub fn top_blocks(&self) -> &[BlockId] {
        &self.top_blocks
    }

    /// Top blocks ordered by position, top to bottom with a slight
    /// left-to-right bias.
    pub fn top_blocks_sorted(&self) -> Vec<BlockId> {
        let offset = (3.0f64).to_radians().sin();
        let key = |id: &BlockId| {
            self.blocks
                .get(id)
                .map(|b| b.y + offset * b.x)
                .unwrap_or_default()
        };
        let mut sorted = self.top_blocks.clone();
        sorted.sort_by(|a, b| key(a).total_cmp(&key(b)));
        sorted
    }

    /// `id` followed by everything attached below it, depth first.
    pub fn descendants(&self, id: &str) -> Vec<BlockId> {
        let mut out = Vec::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            let Some(block) = self.blocks.get(&current) else {
                continue;
            };
            let mut children = block.children();
            children.reverse();
            stack.extend(children);
            out.push(current);
        }
        out
    }

    pub fn all_blocks(&self) -> Vec<BlockId> {
        self.top_blocks
            .iter()
            .flat_map(|id| self.descendants(id))
            .collect()
    }

    pub fn blocks_of_type(&self, block_type: &str) -> Vec<BlockId> {
        self.all_blocks()
            .into_iter()
            .filter(|id| self.blocks.get(id).is_some_and(|b| b.block_type == block_type))
            .collect()
    }

    /// The connection on the parent that this block is plugged into.
    pub fn parent_connection(&self, id: &str) -> Option<ConnectionRef> {
        let block = self.blocks.get(id)?;
        block
            .output
            .as_ref()
            .and_then(|c| c.target.clone())
            .or_else(|| block.previous.as_ref().and_then(|c| c.target.clone()))
    }

    pub fn is_ancestor_or_self(&self, ancestor: &str, descendant: &str) -> bool {
        let mut current = Some(descendant.to_string());
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.blocks.get(&id).and_then(|b| b.parent.clone());
        }
        false
    }

    /// Nearest ancestor that encloses this block, skipping blocks that are
    /// only above it in the same stack.
    pub fn surround_parent(&self, id: &str) -> Option<BlockId> {
        let mut current = id.to_string();
        loop {
            let parent = self.blocks.get(&current)?.parent.clone()?;
            let parent_block = self.blocks.get(&parent)?;
            if parent_block.next_block() != Some(&current) {
                return Some(parent);
            }
            current = parent;
        }
    }

    pub fn root_block(&self, id: &str) -> BlockId {
        let mut current = id.to_string();
        while let Some(parent) = self.blocks.get(&current).and_then(|b| b.parent.clone()) {
            current = parent;
        }
        current
    }

    pub(crate) fn insert_block(&mut self, block: Block) {
        self.top_blocks.push(block.id.clone());
        self.blocks.insert(block.id.clone(), block);
    }

    /// Builds a registered block type without firing events.
    pub fn instantiate(&mut self, block_type: &str, id: Option<&str>) -> Result<BlockId> {
        let init = self
            .registry
            .get(block_type)
            .map(|def| def.init)
            .ok_or_else(|| anyhow!("Unknown block type '{}'.", block_type))?;
        let id = match id {
            Some(id) if self.blocks.contains_key(id) => bail!("Block id '{}' is already in use.", id),
            Some(id) => id.to_string(),
            None => self.gen_uid(),
        };
        let mut block = Block::new(&id, block_type);
        init(&mut block);
        self.insert_block(block);
        Ok(id)
    }

    pub(crate) fn run_after_init(&mut self, id: &str) -> Result<()> {
        let block_type = self.get_block(id)?.block_type.clone();
        if let Some(hook) = self.registry.get(&block_type).and_then(|def| def.after_init) {
            hook(self, id)?;
        }
        Ok(())
    }

    pub fn create_block(&mut self, block_type: &str) -> Result<BlockId> {
        self.create_block_with_id(block_type, None)
    }

    pub fn create_block_with_id(&mut self, block_type: &str, id: Option<&str>) -> Result<BlockId> {
        let id = self.instantiate(block_type, id)?;
        self.run_after_init(&id)?;
        log::debug!("created {} block '{}'", block_type, id);
        self.fire(EventData::BlockCreate {
            block_id: id.clone(),
            ids: vec![id.clone()],
        })?;
        Ok(id)
    }

    /// Joins two connections. Incompatible pairs are left alone and reported
    /// as `Ok(false)`.
    pub fn connect(&mut self, a: &ConnectionRef, b: &ConnectionRef) -> Result<bool> {
        if let Err(reason) = self.checker.can_connect_with_reason(self, a, b, false) {
            log::debug!("not connecting {} to {}: {}", a, b, reason);
            return Ok(false);
        }
        let a_is_parent = self.connection(a).is_some_and(|c| c.kind.is_superior());
        let (parent, child) = if a_is_parent { (a, b) } else { (b, a) };
        let mut scope = self.begin_group(None);
        scope.connect_unchecked(parent, child)?;
        Ok(true)
    }

    /// Plugs `child` into the named input of `parent`, using its output for
    /// value inputs and its previous connection for statement inputs.
    pub fn attach(&mut self, parent: &str, input: &str, child: &str) -> Result<bool> {
        let slot = ConnectionRef::input(parent, input);
        let kind = self
            .connection(&slot)
            .map(|c| c.kind)
            .ok_or_else(|| anyhow!("Block '{}' has no input '{}'.", parent, input))?;
        let child_ref = match kind {
            ConnectionKind::InputValue => ConnectionRef::output(child),
            _ => ConnectionRef::previous(child),
        };
        self.connect(&slot, &child_ref)
    }

    pub fn attach_next(&mut self, parent: &str, child: &str) -> Result<bool> {
        self.connect(&ConnectionRef::next(parent), &ConnectionRef::previous(child))
    }

    pub(crate) fn connect_unchecked(&mut self, parent: &ConnectionRef, child: &ConnectionRef) -> Result<()> {
        let parent_kind = self
            .connection(parent)
            .map(|c| c.kind)
            .ok_or_else(|| anyhow!("Missing {}.", parent))?;
        if self.connection(child).is_some_and(Connection::is_connected) {
            self.disconnect(child)?;
        }

        let mut orphan = None;
        if let Some(occupant) = self.connection(parent).and_then(|c| c.target_block().cloned()) {
            let occupant_is_shadow = self.blocks.get(&occupant).is_some_and(|b| b.shadow);
            // Keep the shadow from respawning while the slot changes hands.
            let stashed = self.connection_mut(parent).and_then(|c| c.shadow.take());
            if occupant_is_shadow {
                self.dispose(&occupant, false)?;
            } else {
                self.disconnect(parent)?;
                orphan = Some(occupant);
            }
            if let Some(connection) = self.connection_mut(parent) {
                connection.shadow = stashed;
            }
        }

        self.link(parent, child);
        self.fire(EventData::BlockMove {
            block_id: child.block.clone(),
            old_parent: None,
            old_input: None,
            new_parent: Some(parent.block.clone()),
            new_input: parent.input_name().map(str::to_string),
        })?;

        if let Some(orphan) = orphan {
            self.rehome_orphan(parent_kind, &child.block, &orphan)?;
        }
        Ok(())
    }

    fn link(&mut self, parent: &ConnectionRef, child: &ConnectionRef) {
        if let Some(connection) = self.connection_mut(parent) {
            connection.target = Some(child.clone());
        }
        if let Some(connection) = self.connection_mut(child) {
            connection.target = Some(parent.clone());
        }
        if let Some(block) = self.blocks.get_mut(&child.block) {
            block.parent = Some(parent.block.clone());
        }
        self.top_blocks.retain(|id| id != &child.block);
    }

    fn rehome_orphan(&mut self, kind: ConnectionKind, start: &str, orphan: &str) -> Result<()> {
        let (target, orphan_ref) = match kind {
            ConnectionKind::InputValue => (
                self.connection_for_orphaned_output(start, orphan),
                ConnectionRef::output(orphan),
            ),
            _ => (self.last_connection_in_stack(start), ConnectionRef::previous(orphan)),
        };
        if let Some(target) = target {
            if self.checker.can_connect(self, &target, &orphan_ref, false) {
                log::debug!("re-homing orphan '{}' onto the {}", orphan, target);
                return self.connect_unchecked(&target, &orphan_ref);
            }
        }
        log::debug!("orphan '{}' left as a top-level block", orphan);
        Ok(())
    }

    /// Follows the chain of blocks that each have exactly one input the
    /// orphan fits, ending at an empty or shadow-filled slot.
    fn connection_for_orphaned_output(&self, start: &str, orphan: &str) -> Option<ConnectionRef> {
        let output = ConnectionRef::output(orphan);
        let mut current = start.to_string();
        loop {
            let connection = self.single_compatible_input(&current, &output)?;
            match self.connection(&connection).and_then(Connection::target_block) {
                Some(next) if !self.blocks.get(next).is_some_and(|b| b.shadow) => {
                    current = next.clone();
                }
                _ => return Some(connection),
            }
        }
    }

    fn single_compatible_input(&self, id: &str, output: &ConnectionRef) -> Option<ConnectionRef> {
        let block = self.blocks.get(id)?;
        let mut found = None;
        for input in block.inputs.iter().filter(|i| i.connection.is_some()) {
            let candidate = ConnectionRef::input(id, &input.name);
            if self.checker.can_connect(self, output, &candidate, false) {
                if found.is_some() {
                    return None;
                }
                found = Some(candidate);
            }
        }
        found
    }

    fn last_connection_in_stack(&self, start: &str) -> Option<ConnectionRef> {
        let mut current = start.to_string();
        loop {
            let next = self.blocks.get(&current)?.next.as_ref()?;
            match next.target_block() {
                Some(id) if !self.blocks.get(id).is_some_and(|b| b.shadow) => current = id.clone(),
                _ => return Some(ConnectionRef::next(&current)),
            }
        }
    }

    /// Severs `conn` from its target. The lower block becomes top-level and
    /// the upper slot's shadow is respawned.
    pub fn disconnect(&mut self, conn: &ConnectionRef) -> Result<()> {
        let source = self
            .connection(conn)
            .ok_or_else(|| anyhow!("Missing {}.", conn))?;
        let Some(target) = source.target.clone() else {
            bail!("Source connection not connected.");
        };
        let kind = source.kind;
        if self.connection(&target).and_then(|c| c.target.as_ref()) != Some(conn) {
            bail!("Target connection not connected to source connection.");
        }
        let (parent, child) = if kind.is_superior() {
            (conn.clone(), target)
        } else {
            (target, conn.clone())
        };
        let mut scope = self.begin_group(None);
        scope.disconnect_internal(&parent, &child)
    }

    fn disconnect_internal(&mut self, parent: &ConnectionRef, child: &ConnectionRef) -> Result<()> {
        if let Some(connection) = self.connection_mut(parent) {
            connection.target = None;
        }
        if let Some(connection) = self.connection_mut(child) {
            connection.target = None;
        }
        let child_is_shadow = match self.blocks.get_mut(&child.block) {
            Some(block) => {
                block.parent = None;
                block.shadow
            }
            None => false,
        };
        if !self.top_blocks.contains(&child.block) {
            self.top_blocks.push(child.block.clone());
        }
        self.fire(EventData::BlockMove {
            block_id: child.block.clone(),
            old_parent: Some(parent.block.clone()),
            old_input: parent.input_name().map(str::to_string),
            new_parent: None,
            new_input: None,
        })?;
        if !child_is_shadow {
            self.respawn_shadow(parent)?;
        }
        Ok(())
    }

    /// Re-creates the default block of an empty slot.
    pub fn respawn_shadow(&mut self, slot: &ConnectionRef) -> Result<()> {
        let Some(spec) = self
            .connection(slot)
            .filter(|c| !c.is_connected())
            .and_then(|c| c.shadow.clone())
        else {
            return Ok(());
        };
        let id = {
            let mut batch = self.begin_batch();
            state::append_internal(&mut batch, &spec, Some(slot), true)?
        };
        let ids = self.descendants(&id);
        self.fire(EventData::BlockCreate { block_id: id, ids })
    }

    /// Detaches a block from whatever it is plugged into. With `heal_stack`
    /// the blocks below a statement are reattached to the block above.
    pub fn unplug(&mut self, id: &str, heal_stack: bool) -> Result<()> {
        let block = self.get_block(id)?;
        if block.output.as_ref().is_some_and(Connection::is_connected) {
            return self.disconnect(&ConnectionRef::output(id));
        }
        let Some(above) = block.previous.as_ref().and_then(|c| c.target.clone()) else {
            return Ok(());
        };
        let below = if heal_stack {
            block.next_block().cloned()
        } else {
            None
        };
        let mut scope = self.begin_group(None);
        scope.disconnect(&ConnectionRef::previous(id))?;
        if let Some(below) = below {
            scope.disconnect(&ConnectionRef::next(id))?;
            if !scope.connect(&above, &ConnectionRef::previous(&below))? {
                log::debug!("could not heal the stack around '{}'", id);
            }
        }
        Ok(())
    }

    /// Removes a block and everything below it. The delete event is fired
    /// once the blocks are gone.
    pub fn dispose(&mut self, id: &str, heal_stack: bool) -> Result<()> {
        let block_type = self.get_block(id)?.block_type.clone();
        let mut scope = self.begin_group(None);
        scope.unplug(id, heal_stack)?;
        let ids = scope.descendants(id);
        for removed in &ids {
            scope.blocks.remove(removed);
        }
        scope.top_blocks.retain(|b| !ids.contains(b));
        log::debug!("disposed {} block(s) rooted at '{}'", ids.len(), id);
        scope.fire(EventData::BlockDelete {
            block_id: id.to_string(),
            ids,
            block_type,
        })
    }

    pub fn clear(&mut self) -> Result<()> {
        let mut scope = self.begin_group(None);
        while let Some(id) = scope.top_blocks.first().cloned() {
            scope.dispose(&id, false)?;
        }
        scope.variables.clear();
        Ok(())
    }

    pub fn move_block(&mut self, id: &str, x: f64, y: f64) -> Result<()> {
        let block = self.get_block_mut(id)?;
        if block.parent.is_some() {
            bail!("Only top-level blocks can be moved; {} is attached.", block.describe());
        }
        block.x = x;
        block.y = y;
        self.fire(EventData::BlockMove {
            block_id: id.to_string(),
            old_parent: None,
            old_input: None,
            new_parent: None,
            new_input: None,
        })
    }

    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> Result<()> {
        let block = self.get_block_mut(id)?;
        if block.enabled == enabled {
            return Ok(());
        }
        block.enabled = enabled;
        self.fire(EventData::BlockChange {
            block_id: id.to_string(),
            element: ChangeElement::Disabled,
            old_value: Some(enabled.to_string()),
            new_value: Some((!enabled).to_string()),
        })
    }

    pub fn set_collapsed(&mut self, id: &str, collapsed: bool) -> Result<()> {
        let block = self.get_block_mut(id)?;
        if block.collapsed == collapsed {
            return Ok(());
        }
        block.collapsed = collapsed;
        self.fire(EventData::BlockChange {
            block_id: id.to_string(),
            element: ChangeElement::Collapsed,
            old_value: Some((!collapsed).to_string()),
            new_value: Some(collapsed.to_string()),
        })
    }

    pub fn set_comment(&mut self, id: &str, comment: Option<&str>) -> Result<()> {
        let block = self.get_block_mut(id)?;
        let new_value = comment.map(str::to_string);
        if block.comment == new_value {
            return Ok(());
        }
        let old_value = std::mem::replace(&mut block.comment, new_value.clone());
        self.fire(EventData::BlockChange {
            block_id: id.to_string(),
            element: ChangeElement::Comment,
            old_value,
            new_value,
        })
    }

    /// Sets a text field, or the variable id of a variable field.
    pub fn set_field_value(&mut self, id: &str, name: &str, value: &str) -> Result<()> {
        let block = self.get_block_mut(id)?;
        let describe = block.describe();
        let field = block
            .field_mut(name)
            .ok_or_else(|| anyhow!("{} has no field '{}'.", describe, name))?;
        let new_value = match &field.value {
            FieldValue::Text(_) => FieldValue::Text(value.to_string()),
            FieldValue::Variable(_) => FieldValue::Variable(value.to_string()),
        };
        if field.value == new_value {
            return Ok(());
        }
        let old_value = match std::mem::replace(&mut field.value, new_value) {
            FieldValue::Text(text) | FieldValue::Variable(text) => text,
        };
        self.fire(EventData::BlockChange {
            block_id: id.to_string(),
            element: ChangeElement::Field(name.to_string()),
            old_value: Some(old_value),
            new_value: Some(value.to_string()),
        })
    }

    pub fn set_warning(&mut self, id: &str, warning: Option<&str>) -> Result<()> {
        self.get_block_mut(id)?.warning = warning.map(str::to_string);
        Ok(())
    }

    /// Replaces the type check of a connection, unplugging the attached
    /// block when it no longer fits.
    pub fn set_check(&mut self, conn: &ConnectionRef, check: TypeCheck) -> Result<()> {
        let connection = self
            .connection_mut(conn)
            .ok_or_else(|| anyhow!("Missing {}.", conn))?;
        connection.check = check;
        let superior = connection.kind.is_superior();
        let Some(target) = connection.target.clone() else {
            return Ok(());
        };
        if self.checker.can_connect(self, conn, &target, false) {
            return Ok(());
        }
        let child = if superior { target.block } else { conn.block.clone() };
        log::debug!("'{}' no longer fits after a check change; unplugging", child);
        self.unplug(&child, false)
    }

    /// Creates a variable. Without an id, an existing variable of the same
    /// name and type is returned instead.
    pub fn create_variable(&mut self, name: &str, var_type: &str, id: Option<&str>) -> Result<VariableModel> {
        if id.is_none() {
            if let Some(existing) = self.variables.by_name(name, var_type) {
                return Ok(existing.clone());
            }
        }
        let id = match id {
            Some(id) => id.to_string(),
            None => self.gen_uid(),
        };
        let existed = self.variables.by_id(&id).is_some();
        let model = self.variables.create(name, var_type, &id)?;
        if !existed {
            self.fire(EventData::VarCreate {
                var_id: model.id.clone(),
                name: model.name.clone(),
            })?;
        }
        Ok(model)
    }

    /// Looks a variable up by id, then by name and type, creating it when
    /// neither matches.
    pub fn get_or_create_variable(&mut self, id: Option<&str>, name: &str, var_type: &str) -> Result<VariableModel> {
        if let Some(found) = id.and_then(|id| self.variables.by_id(id)) {
            return Ok(found.clone());
        }
        if let Some(found) = self.variables.by_name(name, var_type) {
            return Ok(found.clone());
        }
        self.create_variable(name, var_type, id)
    }

    pub fn rename_variable_by_id(&mut self, id: &str, new_name: &str) -> Result<()> {
        let var_type = self
            .variables
            .by_id(id)
            .map(|v| v.var_type.clone())
            .ok_or_else(|| anyhow!("Tried to rename a variable that didn't exist. ID: {}", id))?;
        if let Some(conflict) = self.variables.by_name(new_name, &var_type) {
            if conflict.id != id {
                bail!("A variable named '{}' already exists.", new_name);
            }
        }
        let old_name = self.variables.rename(id, new_name).unwrap_or_default();
        if old_name == new_name {
            return Ok(());
        }
        self.fire(EventData::VarRename {
            var_id: id.to_string(),
            old_name,
            new_name: new_name.to_string(),
        })
    }

    /// Blocks that read or write the variable, including procedure
    /// definitions that declare it as a parameter.
    pub fn variable_users(&self, var_id: &str) -> Vec<BlockId> {
        self.all_blocks()
            .into_iter()
            .filter(|id| {
                let Some(block) = self.blocks.get(id) else {
                    return false;
                };
                let in_field = block
                    .fields
                    .iter()
                    .any(|f| f.value == FieldValue::Variable(var_id.to_string()));
                let as_param = block
                    .procedure_def()
                    .is_some_and(|def| def.params.iter().any(|p| p.var_id == var_id));
                in_field || as_param
            })
            .collect()
    }

    pub fn delete_variable_by_id(&mut self, var_id: &str) -> Result<()> {
        let name = self
            .variables
            .by_id(var_id)
            .map(|v| v.name.clone())
            .ok_or_else(|| anyhow!("Can't delete non-existent variable: {}", var_id))?;
        let users = self.variable_users(var_id);
        if let Some(def) = users.iter().find_map(|id| self.blocks.get(id).filter(|b| b.procedure_def().is_some())) {
            bail!(
                "Can't delete the variable \"{}\" because it's part of the definition of the function \"{}\"",
                name,
                def.field_value("NAME").unwrap_or_default()
            );
        }
        let mut scope = self.begin_group(None);
        for user in users {
            if scope.block(&user).is_some() {
                scope.dispose(&user, true)?;
            }
        }
        scope.variables.remove(var_id);
        scope.fire(EventData::VarDelete {
            var_id: var_id.to_string(),
            name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectReason;
    use crate::events::EventKind;
    use crate::state::BlockState;
    use crate::types::ValueType;

    fn print_with_number(ws: &mut Workspace) -> (BlockId, BlockId) {
        let print = ws.create_block("text_print").unwrap();
        let number = ws.create_block("math_number").unwrap();
        assert!(ws.attach(&print, "TEXT", &number).unwrap());
        (print, number)
    }

    #[test]
    fn connect_then_disconnect_restores_both_ends() {
        let mut ws = Workspace::new();
        let (print, number) = print_with_number(&mut ws);
        assert_eq!(ws.block(&number).unwrap().parent.as_deref(), Some(print.as_str()));
        assert!(!ws.top_blocks().contains(&number));

        ws.disconnect(&ConnectionRef::output(&number)).unwrap();
        assert!(ws.block(&print).unwrap().input_target("TEXT").is_none());
        assert!(ws.block(&number).unwrap().output.as_ref().unwrap().target.is_none());
        assert!(ws.block(&number).unwrap().parent.is_none());
        assert!(ws.top_blocks().contains(&number));
    }

    #[test]
    fn incompatible_checks_are_rejected_silently() {
        let mut ws = Workspace::new();
        let negate = ws.create_block("logic_negate").unwrap();
        let number = ws.create_block("math_number").unwrap();
        assert!(!ws.attach(&negate, "BOOL", &number).unwrap());
        assert!(ws.block(&negate).unwrap().input_target("BOOL").is_none());
        let reason = ws
            .checker()
            .can_connect_with_reason(
                &ws,
                &ConnectionRef::input(&negate, "BOOL"),
                &ConnectionRef::output(&number),
                false,
            )
            .unwrap_err();
        assert_eq!(reason, ConnectReason::ChecksFailed);
    }

    #[test]
    fn cycles_and_self_connections_are_refused() {
        let mut ws = Workspace::new();
        let outer = ws.create_block("controls_repeat_ext").unwrap();
        let inner = ws.create_block("controls_repeat_ext").unwrap();
        assert!(ws.attach(&outer, "DO", &inner).unwrap());
        let checker = ws.checker();
        assert_eq!(
            checker.can_connect_with_reason(
                &ws,
                &ConnectionRef::input(&inner, "DO"),
                &ConnectionRef::previous(&outer),
                false
            ),
            Err(ConnectReason::Cycle)
        );
        assert_eq!(
            checker.can_connect_with_reason(
                &ws,
                &ConnectionRef::next(&outer),
                &ConnectionRef::previous(&outer),
                false
            ),
            Err(ConnectReason::SelfConnection)
        );
        assert_eq!(
            checker.can_connect_with_reason(
                &ws,
                &ConnectionRef::next(&outer),
                &ConnectionRef::next(&inner),
                false
            ),
            Err(ConnectReason::WrongType)
        );
    }

    #[test]
    fn value_orphan_moves_into_the_only_fitting_input() {
        let mut ws = Workspace::new();
        let (print, number) = print_with_number(&mut ws);
        let single = ws.create_block("math_single").unwrap();
        assert!(ws.attach(&print, "TEXT", &single).unwrap());
        assert_eq!(ws.block(&print).unwrap().input_target("TEXT"), Some(&single));
        assert_eq!(ws.block(&single).unwrap().input_target("NUM"), Some(&number));
    }

    #[test]
    fn value_orphan_with_two_candidates_stays_top_level() {
        let mut ws = Workspace::new();
        let (print, number) = print_with_number(&mut ws);
        let sum = ws.create_block("math_arithmetic").unwrap();
        assert!(ws.attach(&print, "TEXT", &sum).unwrap());
        assert!(ws.block(&number).unwrap().parent.is_none());
        assert!(ws.top_blocks().contains(&number));
    }

    #[test]
    fn statement_orphan_goes_to_the_end_of_the_new_stack() {
        let mut ws = Workspace::new();
        let repeat = ws.create_block("controls_repeat_ext").unwrap();
        let first = ws.create_block("text_print").unwrap();
        assert!(ws.attach(&repeat, "DO", &first).unwrap());
        let second = ws.create_block("text_print").unwrap();
        let third = ws.create_block("text_print").unwrap();
        assert!(ws.attach_next(&second, &third).unwrap());
        assert!(ws.attach(&repeat, "DO", &second).unwrap());
        assert_eq!(ws.block(&repeat).unwrap().input_target("DO"), Some(&second));
        assert_eq!(ws.block(&third).unwrap().next_block(), Some(&first));
    }

    #[test]
    fn shadow_is_replaced_then_respawned() {
        let mut ws = Workspace::new();
        let state: BlockState = serde_json::from_value(serde_json::json!({
            "type": "text_print",
            "id": "print",
            "inputs": {"TEXT": {"shadow": {"type": "text", "id": "default", "fields": {"TEXT": "abc"}}}}
        }))
        .unwrap();
        state::append(&mut ws, &state).unwrap();
        assert_eq!(ws.block("print").unwrap().input_target("TEXT").map(String::as_str), Some("default"));

        let number = ws.create_block("math_number").unwrap();
        assert!(ws.attach("print", "TEXT", &number).unwrap());
        assert!(ws.block("default").is_none());

        let before = ws.events.undo_log().len();
        ws.unplug(&number, false).unwrap();
        let respawned = ws.block("print").unwrap().input_target("TEXT").cloned().unwrap();
        let shadow = ws.block(&respawned).unwrap();
        assert!(shadow.shadow);
        assert_eq!(shadow.field_value("TEXT"), Some("abc"));

        let fired = ws.events.undo_log()[before..]
            .iter()
            .map(|e| (e.data.kind(), e.data.block_id().unwrap_or_default().to_string()))
            .collect::<Vec<_>>();
        assert_eq!(
            fired,
            vec![(EventKind::BlockMove, number.clone()), (EventKind::BlockCreate, respawned.clone())]
        );
    }

    #[test]
    fn real_blocks_cannot_go_under_shadows() {
        let mut ws = Workspace::new();
        let state: BlockState = serde_json::from_value(serde_json::json!({
            "type": "math_single",
            "id": "single",
            "inputs": {"NUM": {"shadow": {"type": "math_arithmetic", "id": "shadow_sum"}}}
        }))
        .unwrap();
        state::append(&mut ws, &state).unwrap();
        let number = ws.create_block("math_number").unwrap();
        assert!(!ws.attach("shadow_sum", "A", &number).unwrap());
    }

    #[test]
    fn dispose_removes_subtree_and_reports_ids_after_removal() {
        let mut ws = Workspace::new();
        let repeat = ws.create_block("controls_repeat_ext").unwrap();
        let print = ws.create_block("text_print").unwrap();
        let after = ws.create_block("text_print").unwrap();
        ws.attach(&repeat, "DO", &print).unwrap();
        ws.attach_next(&repeat, &after).unwrap();
        ws.dispose(&repeat, false).unwrap();
        assert_eq!(ws.block_count(), 0);
        let delete = ws.events.undo_log().last().unwrap();
        match &delete.data {
            EventData::BlockDelete { block_id, ids, .. } => {
                assert_eq!(block_id, &repeat);
                assert_eq!(ids.len(), 3);
            }
            other => panic!("expected delete, got {:?}", other),
        }
    }

    #[test]
    fn dispose_with_heal_keeps_the_rest_of_the_stack() {
        let mut ws = Workspace::new();
        let a = ws.create_block("text_print").unwrap();
        let b = ws.create_block("text_print").unwrap();
        let c = ws.create_block("text_print").unwrap();
        ws.attach_next(&a, &b).unwrap();
        ws.attach_next(&b, &c).unwrap();
        ws.dispose(&b, true).unwrap();
        assert_eq!(ws.block(&a).unwrap().next_block(), Some(&c));
        assert_eq!(ws.top_blocks(), &[a]);
    }

    #[test]
    fn narrowing_a_check_unplugs_the_child() {
        let mut ws = Workspace::new();
        let (print, number) = print_with_number(&mut ws);
        ws.set_check(&ConnectionRef::input(&print, "TEXT"), TypeCheck::one(ValueType::String))
            .unwrap();
        assert!(ws.block(&print).unwrap().input_target("TEXT").is_none());
        assert!(ws.top_blocks().contains(&number));
    }

    #[test]
    fn variables_rename_by_id_and_delete_their_users() {
        let mut ws = Workspace::new();
        let var = ws.create_variable("count", "", None).unwrap();
        let get = ws.create_block("variables_get").unwrap();
        ws.set_field_value(&get, "VAR", &var.id).unwrap();
        ws.rename_variable_by_id(&var.id, "total").unwrap();
        assert_eq!(ws.variables.by_id(&var.id).unwrap().name, "total");
        ws.delete_variable_by_id(&var.id).unwrap();
        assert!(ws.block(&get).is_none());
        assert!(ws.variables.by_id(&var.id).is_none());
    }

    #[test]
    fn connections_in_one_call_share_an_event_group() {
        let mut ws = Workspace::new();
        let (print, _) = print_with_number(&mut ws);
        ws.events.clear_undo();
        let single = ws.create_block("math_single").unwrap();
        ws.events.clear_undo();
        ws.attach(&print, "TEXT", &single).unwrap();
        let groups = ws
            .events
            .undo_log()
            .iter()
            .map(|e| e.group.clone())
            .collect::<Vec<_>>();
        assert!(groups.len() >= 3);
        assert!(groups.iter().all(|g| g.is_some() && *g == groups[0]));
    }
}
