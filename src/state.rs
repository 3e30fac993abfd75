use crate::block::{Block, BlockId, ExtraState, FieldValue};
use crate::connection::{ConnectionKind, ConnectionRef};
use crate::events::EventData;
use crate::procedures;
use crate::types::TypeCheck;
use crate::workspace::Workspace;
use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// JSON form of a single block and everything attached below it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockState {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub collapsed: bool,
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_state: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icons: Option<IconsState>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, ConnectionState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<Box<ConnectionState>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct IconsState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<CommentState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CommentState {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ConnectionState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shadow: Option<BlockState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block: Option<BlockState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WorkspaceState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocks: Option<BlocksSection>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<VariableState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BlocksSection {
    #[serde(default)]
    pub language_version: u32,
    #[serde(default)]
    pub blocks: Vec<BlockState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableState {
    pub name: String,
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub var_type: String,
}

fn default_true() -> bool {
    true
}

fn is_true(value: &bool) -> bool {
    *value
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Default for BlockState {
    fn default() -> Self {
        Self {
            block_type: String::new(),
            id: None,
            x: None,
            y: None,
            collapsed: false,
            enabled: true,
            inline: None,
            extra_state: None,
            icons: None,
            fields: BTreeMap::new(),
            inputs: BTreeMap::new(),
            next: None,
        }
    }
}

impl BlockState {
    pub fn new(block_type: &str) -> Self {
        Self {
            block_type: block_type.to_string(),
            ..Self::default()
        }
    }

    pub fn comment_text(&self) -> Option<&str> {
        self.icons
            .as_ref()
            .and_then(|icons| icons.comment.as_ref())
            .map(|c| c.text.as_str())
    }
}

/// Serializes a block and its children. Coordinates are only written for
/// top-level blocks.
pub fn save(ws: &Workspace, id: &str) -> Result<BlockState> {
    let add_coordinates = ws.get_block(id)?.parent.is_none();
    save_block(ws, id, add_coordinates)
}

fn save_block(ws: &Workspace, id: &str, add_coordinates: bool) -> Result<BlockState> {
    let block = ws.get_block(id)?;
    let mut state = BlockState::new(&block.block_type);
    state.id = Some(block.id.clone());
    if add_coordinates {
        state.x = Some(block.x);
        state.y = Some(block.y);
    }
    state.collapsed = block.collapsed;
    state.enabled = block.enabled;
    state.inline = block.inline;
    state.extra_state = save_extra_state(ws, block);
    if let Some(text) = &block.comment {
        state.icons = Some(IconsState {
            comment: Some(CommentState { text: text.clone() }),
        });
    }
    for field in block.fields.iter().filter(|f| f.serializable) {
        let value = match &field.value {
            FieldValue::Text(text) => Value::String(text.clone()),
            FieldValue::Variable(var_id) => match ws.variables.by_id(var_id) {
                Some(model) => json!({"id": model.id, "name": model.name, "type": model.var_type}),
                None => json!({ "id": var_id }),
            },
        };
        state.fields.insert(field.name.clone(), value);
    }
    for input in &block.inputs {
        let Some(connection) = &input.connection else {
            continue;
        };
        let saved = save_connection(ws, connection.target_block(), connection.shadow.as_ref())?;
        if let Some(saved) = saved {
            state.inputs.insert(input.name.clone(), saved);
        }
    }
    if let Some(next) = &block.next {
        state.next = save_connection(ws, next.target_block(), next.shadow.as_ref())?.map(Box::new);
    }
    Ok(state)
}

fn save_connection(
    ws: &Workspace,
    target: Option<&BlockId>,
    shadow_spec: Option<&BlockState>,
) -> Result<Option<ConnectionState>> {
    let target = target.map(|id| ws.get_block(id)).transpose()?;
    let saved = match target {
        Some(child) if child.shadow => ConnectionState {
            shadow: Some(save_block(ws, &child.id, false)?),
            block: None,
        },
        Some(child) => ConnectionState {
            shadow: shadow_spec.cloned(),
            block: Some(save_block(ws, &child.id, false)?),
        },
        None => ConnectionState {
            shadow: shadow_spec.cloned(),
            block: None,
        },
    };
    if saved.shadow.is_none() && saved.block.is_none() {
        return Ok(None);
    }
    Ok(Some(saved))
}

pub fn save_extra_state(ws: &Workspace, block: &Block) -> Option<Value> {
    if let ExtraState::Opaque(value) = &block.extra {
        return Some(value.clone());
    }
    ws.registry
        .get(&block.block_type)
        .and_then(|def| def.mutator)
        .and_then(|mutator| mutator.save_extra_state(block))
}

/// Builds a block tree from `state` as a new top-level stack and fires a
/// single create event covering every block that was built.
pub fn append(ws: &mut Workspace, state: &BlockState) -> Result<BlockId> {
    let id = {
        let mut batch = ws.begin_batch();
        append_internal(&mut batch, state, None, false)?
    };
    let ids = ws.descendants(&id);
    let defs = ids
        .iter()
        .filter(|b| procedures::is_definition(ws, b))
        .cloned()
        .collect::<Vec<_>>();
    for def_id in &defs {
        procedures::mutate_callers(ws, def_id)?;
    }
    let calls = ids
        .iter()
        .filter(|b| procedures::is_call(ws, b))
        .cloned()
        .collect::<Vec<_>>();
    for call_id in &calls {
        procedures::link_call(ws, call_id)?;
    }
    ws.fire(EventData::BlockCreate {
        block_id: id.clone(),
        ids,
    })?;
    Ok(id)
}

/// Builds `state` below `parent` without firing events. Used when loading
/// and when a shadow is respawned.
pub(crate) fn append_internal(
    ws: &mut Workspace,
    state: &BlockState,
    parent: Option<&ConnectionRef>,
    shadow: bool,
) -> Result<BlockId> {
    let id = instantiate(ws, state, parent)?;
    {
        let block = ws.get_block_mut(&id)?;
        block.shadow = shadow;
        block.x = state.x.unwrap_or(0.0);
        block.y = state.y.unwrap_or(0.0);
        block.collapsed = state.collapsed;
        block.enabled = state.enabled;
        block.inline = state.inline;
        block.comment = state.comment_text().map(str::to_string);
    }
    if let Some(extra) = &state.extra_state {
        load_extra_state(ws, &id, extra)?;
    }
    if let Some(parent) = parent {
        connect_to_parent(ws, parent, &id)?;
    }
    for (name, value) in &state.fields {
        load_field(ws, &id, name, value)?;
    }
    ws.run_after_init(&id)?;
    for (name, connection) in &state.inputs {
        let input_ref = ensure_input(ws, &id, name, connection)?;
        let Some(input_ref) = input_ref else {
            continue;
        };
        load_connection(ws, &input_ref, connection)?;
    }
    if let Some(next) = &state.next {
        if ws.get_block(&id)?.next.is_none() {
            bail!("{} has no next connection, but the saved state has a next block.", ws.get_block(&id)?.describe());
        }
        load_connection(ws, &ConnectionRef::next(&id), next)?;
    }
    Ok(id)
}

fn instantiate(ws: &mut Workspace, state: &BlockState, parent: Option<&ConnectionRef>) -> Result<BlockId> {
    let wanted = state.id.as_deref().filter(|id| ws.block(id).is_none());
    if ws.registry.get(&state.block_type).is_some() {
        return ws.instantiate(&state.block_type, wanted);
    }
    if !ws.options.lenient_block_types {
        bail!("Unknown block type '{}'.", state.block_type);
    }
    log::warn!("improvising shape for unknown block type '{}'", state.block_type);
    let id = match wanted {
        Some(id) => id.to_string(),
        None => ws.gen_uid(),
    };
    let mut block = Block::new(&id, &state.block_type);
    block.improvised = true;
    let in_value_context = parent
        .and_then(|p| ws.connection(p))
        .is_some_and(|c| c.kind == ConnectionKind::InputValue);
    if in_value_context {
        block.set_output(TypeCheck::Any);
    } else {
        block.set_previous(TypeCheck::Any);
        block.set_next(TypeCheck::Any);
    }
    ws.insert_block(block);
    Ok(id)
}

fn load_extra_state(ws: &mut Workspace, id: &str, extra: &Value) -> Result<()> {
    let block_type = ws.get_block(id)?.block_type.clone();
    let mutator = ws.registry.get(&block_type).and_then(|def| def.mutator);
    match mutator {
        Some(mutator) => mutator.load_extra_state(ws, id, extra),
        None => {
            let block = ws.get_block_mut(id)?;
            if !block.improvised {
                log::warn!("ignoring extra state on {}", block.describe());
                return Ok(());
            }
            block.extra = ExtraState::Opaque(extra.clone());
            Ok(())
        }
    }
}

fn connect_to_parent(ws: &mut Workspace, parent: &ConnectionRef, id: &str) -> Result<()> {
    let block = ws.get_block(id)?;
    let parent_kind = ws
        .connection(parent)
        .map(|c| c.kind)
        .ok_or_else(|| anyhow!("Missing {}.", parent))?;
    let child = match parent_kind {
        ConnectionKind::InputValue => block.output.as_ref().map(|_| ConnectionRef::output(id)),
        _ => block.previous.as_ref().map(|_| ConnectionRef::previous(id)),
    };
    let Some(child) = child else {
        bail!("{} cannot be attached to the {}.", block.describe(), parent);
    };
    if let Err(reason) = ws.checker().can_connect_with_reason(ws, parent, &child, false) {
        bail!(
            "Connection checks failed attaching {} to the {}: {}",
            ws.get_block(id)?.describe(),
            parent,
            reason
        );
    }
    ws.connect(parent, &child)?;
    Ok(())
}

fn load_field(ws: &mut Workspace, id: &str, name: &str, value: &Value) -> Result<()> {
    let existing = ws.get_block(id)?.field(name).map(|f| f.value.clone());
    let improvised = ws.get_block(id)?.improvised;
    match existing {
        Some(FieldValue::Variable(_)) => {
            let var_id = resolve_variable(ws, value)?;
            if let Some(field) = ws.get_block_mut(id)?.field_mut(name) {
                field.value = FieldValue::Variable(var_id);
            }
        }
        Some(FieldValue::Text(_)) => {
            let text = value_to_text(value);
            if let Some(field) = ws.get_block_mut(id)?.field_mut(name) {
                field.value = FieldValue::Text(text);
            }
        }
        None if improvised => {
            if value.is_object() {
                let var_id = resolve_variable(ws, value)?;
                ws.get_block_mut(id)?.add_variable_field(name, &var_id);
            } else {
                let text = value_to_text(value);
                ws.get_block_mut(id)?.add_text_field(name, &text);
            }
        }
        None => log::warn!("ignoring non-existent field {} on block '{}'", name, id),
    }
    Ok(())
}

pub(crate) fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn resolve_variable(ws: &mut Workspace, value: &Value) -> Result<String> {
    let id = value.get("id").and_then(Value::as_str);
    let name = value.get("name").and_then(Value::as_str);
    let var_type = value.get("type").and_then(Value::as_str).unwrap_or("");
    if let Some(id) = id {
        if ws.variables.by_id(id).is_some() {
            return Ok(id.to_string());
        }
    }
    let Some(name) = name.or(value.as_str()) else {
        bail!("Variable field references unknown variable id '{}'.", id.unwrap_or_default());
    };
    Ok(ws.get_or_create_variable(id, name, var_type)?.id)
}

/// Returns the connection for input `name`, creating it on improvised
/// blocks. Unknown inputs on registered blocks are skipped.
fn ensure_input(
    ws: &mut Workspace,
    id: &str,
    name: &str,
    state: &ConnectionState,
) -> Result<Option<ConnectionRef>> {
    let block = ws.get_block(id)?;
    if let Some(input) = block.input(name) {
        if input.connection.is_none() {
            bail!("Input '{}' on {} cannot hold a block.", name, block.describe());
        }
        return Ok(Some(ConnectionRef::input(id, name)));
    }
    if !block.improvised {
        log::warn!("ignoring non-existent input {} in {}", name, block.describe());
        return Ok(None);
    }
    let child_type = state
        .block
        .as_ref()
        .or(state.shadow.as_ref())
        .map(|s| s.block_type.clone())
        .unwrap_or_default();
    let child_is_statement = ws
        .registry
        .prototype(&child_type)
        .is_some_and(|proto| proto.output.is_none() && proto.previous.is_some());
    let block = ws.get_block_mut(id)?;
    if child_is_statement {
        block.append_statement_input(name);
    } else {
        block.append_value_input(name, TypeCheck::Any);
    }
    Ok(Some(ConnectionRef::input(id, name)))
}

fn load_connection(ws: &mut Workspace, slot: &ConnectionRef, state: &ConnectionState) -> Result<()> {
    if let Some(shadow) = &state.shadow {
        if let Some(connection) = ws.connection_mut(slot) {
            connection.shadow = Some(shadow.clone());
        }
    }
    if let Some(child) = &state.block {
        append_internal(ws, child, Some(slot), false)?;
    } else if let Some(shadow) = &state.shadow {
        append_internal(ws, shadow, Some(slot), true)?;
    }
    Ok(())
}

pub fn save_workspace(ws: &Workspace) -> Result<WorkspaceState> {
    let blocks = ws
        .top_blocks()
        .iter()
        .map(|id| save_block(ws, id, true))
        .collect::<Result<Vec<_>>>()?;
    let variables = ws
        .variables
        .all()
        .iter()
        .map(|v| VariableState {
            name: v.name.clone(),
            id: v.id.clone(),
            var_type: v.var_type.clone(),
        })
        .collect();
    Ok(WorkspaceState {
        blocks: (!blocks.is_empty()).then_some(BlocksSection {
            language_version: 0,
            blocks,
        }),
        variables,
    })
}

/// Replaces the workspace contents. Events fired while loading are not
/// recorded for undo, so calls without a definition are adopted once every
/// block is in place.
pub fn load_workspace(ws: &mut Workspace, state: &WorkspaceState) -> Result<()> {
    ws.clear()?;
    let mut scope = ws.without_undo();
    let mut group = scope.begin_group(None);
    for variable in &state.variables {
        group.create_variable(&variable.name, &variable.var_type, Some(&variable.id))?;
    }
    if let Some(section) = &state.blocks {
        for block in &section.blocks {
            append(&mut group, block)?;
        }
    }
    procedures::adopt_orphan_calls(&mut group)?;
    procedures::sync_all_callers(&mut group)
}

pub fn workspace_to_json(ws: &Workspace) -> Result<String> {
    Ok(serde_json::to_string_pretty(&save_workspace(ws)?)?)
}

pub fn workspace_from_json(ws: &mut Workspace, text: &str) -> Result<()> {
    let state: WorkspaceState = serde_json::from_str(text)?;
    load_workspace(ws, &state)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arithmetic_state() -> BlockState {
        serde_json::from_value(json!({
            "type": "math_arithmetic",
            "id": "sum",
            "x": 10.0,
            "y": 20.0,
            "fields": {"OP": "ADD"},
            "inputs": {
                "A": {"shadow": {"type": "math_number", "id": "a", "fields": {"NUM": 1}}},
                "B": {
                    "shadow": {"type": "math_number", "id": "b", "fields": {"NUM": 2}},
                    "block": {"type": "math_number", "id": "real", "fields": {"NUM": 5}}
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn append_builds_tree_and_fires_one_create() {
        let mut ws = Workspace::new();
        let id = append(&mut ws, &arithmetic_state()).unwrap();
        assert_eq!(id, "sum");
        let sum = ws.block("sum").unwrap();
        assert_eq!(sum.input_target("A").map(String::as_str), Some("a"));
        assert_eq!(sum.input_target("B").map(String::as_str), Some("real"));
        assert!(ws.block("a").unwrap().shadow);
        assert_eq!(ws.block("real").unwrap().field_value("NUM"), Some("5"));
        let creates = ws
            .events
            .undo_log()
            .iter()
            .filter(|e| matches!(e.data, EventData::BlockCreate { .. }))
            .count();
        assert_eq!(creates, 1);
    }

    #[test]
    fn save_keeps_shadow_under_covering_block() {
        let mut ws = Workspace::new();
        append(&mut ws, &arithmetic_state()).unwrap();
        let saved = save(&ws, "sum").unwrap();
        let b = &saved.inputs["B"];
        assert_eq!(b.shadow.as_ref().and_then(|s| s.id.as_deref()), Some("b"));
        assert_eq!(b.block.as_ref().and_then(|s| s.id.as_deref()), Some("real"));
        assert_eq!(saved.x, Some(10.0));
        assert!(saved.inputs["A"].block.is_none());
    }

    #[test]
    fn unknown_types_are_improvised_when_lenient() {
        let mut ws = Workspace::new();
        let state: BlockState = serde_json::from_value(json!({
            "type": "text_print",
            "inputs": {"TEXT": {"block": {"type": "custom_widget", "fields": {"MODE": "fast"}}}}
        }))
        .unwrap();
        let id = append(&mut ws, &state).unwrap();
        let child = ws.block(&id).unwrap().input_target("TEXT").cloned().unwrap();
        let widget = ws.block(&child).unwrap();
        assert!(widget.improvised);
        assert!(widget.output.is_some());
        assert_eq!(widget.field_value("MODE"), Some("fast"));
    }

    #[test]
    fn unknown_types_fail_when_strict() {
        let mut ws = Workspace::new();
        ws.options.lenient_block_types = false;
        let state = BlockState::new("custom_widget");
        let err = append(&mut ws, &state).unwrap_err();
        assert!(err.to_string().contains("Unknown block type"));
    }

    #[test]
    fn workspace_json_round_trips_variables_and_blocks() {
        let text = r#"{
            "blocks": {"languageVersion": 0, "blocks": [
                {"type": "variables_set", "id": "set", "x": 0, "y": 0,
                 "fields": {"VAR": {"id": "v1"}},
                 "inputs": {"VALUE": {"block": {"type": "math_number", "id": "n", "fields": {"NUM": 3}}}}}
            ]},
            "variables": [{"name": "count", "id": "v1"}]
        }"#;
        let mut ws = Workspace::new();
        workspace_from_json(&mut ws, text).unwrap();
        let saved = save_workspace(&ws).unwrap();
        let mut again = Workspace::new();
        load_workspace(&mut again, &saved).unwrap();
        assert_eq!(save_workspace(&again).unwrap(), saved);
        assert_eq!(again.variables.by_id("v1").unwrap().name, "count");
    }
}
