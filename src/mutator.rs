use crate::block::{Block, BlockId, ExtraState, ParamModel};
use crate::connection::ConnectionRef;
use crate::events::{ChangeElement, EventData};
use crate::procedures;
use crate::state::{self, BlockState};
use crate::types::{TypeCheck, ValueType};
use crate::workspace::Workspace;
use anyhow::{anyhow, bail, Result};
use serde_json::{json, Map, Value};
use std::error::Error;
use std::fmt::{Display, Formatter};
use xmltree::{Element, XMLNode};

/// Invariant violations while reshaping a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationError {
    ParamLengthMismatch { names: usize, ids: usize },
    WrongDraft { block_type: String },
    NoMutatorUi { block_type: String },
}

impl Display for MutationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MutationError::ParamLengthMismatch { names, ids } => write!(
                f,
                "paramNames and paramIds must be the same length ({} names, {} ids).",
                names, ids
            ),
            MutationError::WrongDraft { block_type } => {
                write!(f, "Shape draft does not describe a {} block.", block_type)
            }
            MutationError::NoMutatorUi { block_type } => {
                write!(f, "{} blocks cannot be reshaped through a mutator.", block_type)
            }
        }
    }
}

impl Error for MutationError {}

/// Editable description of a block's shape, as produced by `decompose` and
/// consumed by `compose`. Slots carry the index of the slot they came from,
/// or None when newly added.
#[derive(Debug, Clone, PartialEq)]
pub enum ShapeDraft {
    IfElse {
        /// Source clause number (the n of `IF{n}`) for each else-if.
        elseif: Vec<Option<usize>>,
        has_else: bool,
    },
    Items {
        items: Vec<Option<usize>>,
    },
    Procedure(ProcedureDraft),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProcedureDraft {
    pub params: Vec<ParamDraft>,
    /// Only definitions with a return value can hide their body.
    pub has_statements: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamDraft {
    pub id: String,
    pub name: String,
}

impl ProcedureDraft {
    pub fn push(&mut self, id: &str, name: &str) -> &mut Self {
        self.params.push(ParamDraft {
            id: id.to_string(),
            name: name.to_string(),
        });
        self
    }
}

/// Shape-changing behaviour attached to a block type.
pub trait Mutator {
    fn save_extra_state(&self, block: &Block) -> Option<Value>;
    fn load_extra_state(&self, ws: &mut Workspace, id: &str, state: &Value) -> Result<()>;
    fn mutation_to_xml(&self, state: &Value) -> Element;
    fn xml_to_extra_state(&self, mutation: &Element) -> Value;

    fn decompose(&self, _block: &Block) -> Option<ShapeDraft> {
        None
    }

    fn compose(&self, ws: &mut Workspace, id: &str, _draft: &ShapeDraft) -> Result<()> {
        let block_type = ws.get_block(id)?.block_type.clone();
        Err(MutationError::NoMutatorUi { block_type }.into())
    }
}

impl Workspace {
    /// The current shape of a mutable block as an editable draft.
    pub fn decompose(&self, id: &str) -> Result<ShapeDraft> {
        let block = self.get_block(id)?;
        self.registry
            .get(&block.block_type)
            .and_then(|def| def.mutator)
            .and_then(|mutator| mutator.decompose(block))
            .ok_or_else(|| {
                MutationError::NoMutatorUi {
                    block_type: block.block_type.clone(),
                }
                .into()
            })
    }

    /// Reshapes a block from a draft. Intermediate reconnections are not
    /// reported; a single mutation change is fired afterwards.
    pub fn mutate(&mut self, id: &str, draft: &ShapeDraft) -> Result<()> {
        let block = self.get_block(id)?;
        let mutator = self
            .registry
            .get(&block.block_type)
            .and_then(|def| def.mutator)
            .ok_or_else(|| anyhow!("{} has no mutator.", block.describe()))?;
        let old_value = state::save_extra_state(self, block).map(|v| v.to_string());
        {
            let mut batch = self.begin_batch();
            mutator.compose(&mut batch, id, draft)?;
        }
        let new_value = state::save_extra_state(self, self.get_block(id)?).map(|v| v.to_string());
        if old_value == new_value {
            return Ok(());
        }
        log::debug!("mutated block '{}'", id);
        self.fire(EventData::BlockChange {
            block_id: id.to_string(),
            element: ChangeElement::Mutation,
            old_value,
            new_value,
        })
    }
}

/// What was plugged into a slot before a reshape.
#[derive(Debug, Clone, Default)]
pub(crate) struct SlotSnapshot {
    pub target: Option<BlockId>,
    pub shadow: Option<BlockState>,
}

pub(crate) fn snapshot_input(ws: &Workspace, id: &str, name: &str) -> SlotSnapshot {
    let Some(connection) = ws.connection(&ConnectionRef::input(id, name)) else {
        return SlotSnapshot::default();
    };
    let target = connection
        .target_block()
        .filter(|t| !ws.block(t).is_some_and(|b| b.shadow))
        .cloned();
    SlotSnapshot {
        target,
        shadow: connection.shadow.clone(),
    }
}

/// Drops an input. A shadow in it is disposed, a real block is unplugged
/// and left on the workspace.
pub(crate) fn remove_input(ws: &mut Workspace, id: &str, name: &str) -> Result<()> {
    if let Some(connection) = ws.connection_mut(&ConnectionRef::input(id, name)) {
        connection.shadow = None;
    }
    if let Some(target) = ws.get_block(id)?.input_target(name).cloned() {
        if ws.get_block(&target)?.shadow {
            ws.dispose(&target, false)?;
        } else {
            ws.unplug(&target, false)?;
        }
    }
    ws.get_block_mut(id)?.inputs.retain(|i| i.name != name);
    Ok(())
}

/// Plugs `child` back into `input` unless it was deleted or attached
/// somewhere else in the meantime.
pub fn reconnect(ws: &mut Workspace, child: Option<&str>, id: &str, input: &str) -> Result<bool> {
    let Some(child) = child else {
        return Ok(false);
    };
    let Some(child_block) = ws.block(child) else {
        return Ok(false);
    };
    if child_block.parent.as_deref().is_some_and(|p| p != id) {
        return Ok(false);
    }
    if ws.get_block(id)?.input_target(input).map(String::as_str) == Some(child) {
        return Ok(false);
    }
    ws.attach(id, input, child)
}

fn fresh_shadow(shadow: &BlockState) -> BlockState {
    let mut copy = shadow.clone();
    copy.id = None;
    copy
}

fn set_shadow_spec(ws: &mut Workspace, id: &str, input: &str, shadow: Option<BlockState>) {
    if let Some(connection) = ws.connection_mut(&ConnectionRef::input(id, input)) {
        connection.shadow = shadow;
    }
}

fn wrong_draft(ws: &Workspace, id: &str) -> anyhow::Error {
    let block_type = ws
        .block(id)
        .map(|b| b.block_type.clone())
        .unwrap_or_default();
    MutationError::WrongDraft { block_type }.into()
}

fn attr_usize(mutation: &Element, name: &str) -> usize {
    mutation
        .attributes
        .get(name)
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0)
}

fn json_usize(state: &Value, key: &str) -> usize {
    state
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|n| usize::try_from(n).ok())
        .unwrap_or(0)
}

/// else-if / else clauses of `controls_if`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IfElseMutator;

impl IfElseMutator {
    fn counts(block: &Block) -> (usize, bool) {
        match block.extra {
            ExtraState::IfElse {
                elseif_count,
                has_else,
            } => (elseif_count, has_else),
            _ => (0, false),
        }
    }

    fn apply_shape(ws: &mut Workspace, id: &str, elseif_count: usize, has_else: bool) -> Result<()> {
        if ws.get_block(id)?.input("ELSE").is_some() {
            remove_input(ws, id, "ELSE")?;
        }
        let mut i = 1;
        while ws.get_block(id)?.input(&format!("IF{}", i)).is_some() {
            remove_input(ws, id, &format!("IF{}", i))?;
            remove_input(ws, id, &format!("DO{}", i))?;
            i += 1;
        }
        let block = ws.get_block_mut(id)?;
        for i in 1..=elseif_count {
            block.append_value_input(&format!("IF{}", i), TypeCheck::one(ValueType::Boolean));
            block.append_statement_input(&format!("DO{}", i));
        }
        if has_else {
            block.append_statement_input("ELSE");
        }
        block.extra = ExtraState::IfElse {
            elseif_count,
            has_else,
        };
        Ok(())
    }
}

impl Mutator for IfElseMutator {
    fn save_extra_state(&self, block: &Block) -> Option<Value> {
        let (elseif_count, has_else) = Self::counts(block);
        if elseif_count == 0 && !has_else {
            return None;
        }
        let mut state = Map::new();
        if elseif_count > 0 {
            state.insert("elseIfCount".to_string(), json!(elseif_count));
        }
        if has_else {
            state.insert("hasElse".to_string(), json!(true));
        }
        Some(Value::Object(state))
    }

    fn load_extra_state(&self, ws: &mut Workspace, id: &str, state: &Value) -> Result<()> {
        let elseif_count = json_usize(state, "elseIfCount");
        let has_else = state.get("hasElse").and_then(Value::as_bool).unwrap_or(false);
        Self::apply_shape(ws, id, elseif_count, has_else)
    }

    fn mutation_to_xml(&self, state: &Value) -> Element {
        let mut mutation = Element::new("mutation");
        let elseif_count = json_usize(state, "elseIfCount");
        if elseif_count > 0 {
            mutation
                .attributes
                .insert("elseif".to_string(), elseif_count.to_string());
        }
        if state.get("hasElse").and_then(Value::as_bool).unwrap_or(false) {
            mutation.attributes.insert("else".to_string(), "1".to_string());
        }
        mutation
    }

    fn xml_to_extra_state(&self, mutation: &Element) -> Value {
        json!({
            "elseIfCount": attr_usize(mutation, "elseif"),
            "hasElse": attr_usize(mutation, "else") > 0,
        })
    }

    fn decompose(&self, block: &Block) -> Option<ShapeDraft> {
        let (elseif_count, has_else) = Self::counts(block);
        Some(ShapeDraft::IfElse {
            elseif: (1..=elseif_count).map(Some).collect(),
            has_else,
        })
    }

    fn compose(&self, ws: &mut Workspace, id: &str, draft: &ShapeDraft) -> Result<()> {
        let ShapeDraft::IfElse { elseif, has_else } = draft else {
            return Err(wrong_draft(ws, id));
        };
        let (old_count, _) = Self::counts(ws.get_block(id)?);
        let clauses = (1..=old_count)
            .map(|i| {
                (
                    snapshot_input(ws, id, &format!("IF{}", i)),
                    snapshot_input(ws, id, &format!("DO{}", i)),
                )
            })
            .collect::<Vec<_>>();
        let else_body = snapshot_input(ws, id, "ELSE");

        Self::apply_shape(ws, id, elseif.len(), *has_else)?;

        for (k, source) in elseif.iter().enumerate() {
            let Some((condition, body)) = source.and_then(|s| s.checked_sub(1)).and_then(|s| clauses.get(s)) else {
                continue;
            };
            reconnect(ws, condition.target.as_deref(), id, &format!("IF{}", k + 1))?;
            reconnect(ws, body.target.as_deref(), id, &format!("DO{}", k + 1))?;
        }
        if *has_else {
            reconnect(ws, else_body.target.as_deref(), id, "ELSE")?;
        }
        Ok(())
    }
}

/// Variable number of `ADD{n}` value inputs (`text_join`, `lists_create_with`).
#[derive(Debug, Clone, Copy, Default)]
pub struct ItemsMutator;

impl ItemsMutator {
    fn count(block: &Block) -> usize {
        match block.extra {
            ExtraState::Items(count) => count,
            _ => 0,
        }
    }

    /// Shape for a detached block; used while initialising.
    pub(crate) fn apply_count(block: &mut Block, count: usize) {
        block
            .inputs
            .retain(|i| i.name != "EMPTY" && !i.name.starts_with("ADD"));
        if count == 0 {
            block.append_dummy_input("EMPTY");
        }
        for i in 0..count {
            block.append_value_input(&format!("ADD{}", i), TypeCheck::Any);
        }
        block.extra = ExtraState::Items(count);
    }

    fn update_shape(ws: &mut Workspace, id: &str, count: usize) -> Result<()> {
        let old = Self::count(ws.get_block(id)?);
        for i in count..old {
            remove_input(ws, id, &format!("ADD{}", i))?;
        }
        let block = ws.get_block_mut(id)?;
        block.inputs.retain(|i| i.name != "EMPTY");
        for i in old..count {
            block.append_value_input(&format!("ADD{}", i), TypeCheck::Any);
        }
        if count == 0 {
            block.append_dummy_input("EMPTY");
        }
        block.extra = ExtraState::Items(count);
        Ok(())
    }
}

impl Mutator for ItemsMutator {
    fn save_extra_state(&self, block: &Block) -> Option<Value> {
        Some(json!({ "itemCount": Self::count(block) }))
    }

    fn load_extra_state(&self, ws: &mut Workspace, id: &str, state: &Value) -> Result<()> {
        Self::update_shape(ws, id, json_usize(state, "itemCount"))
    }

    fn mutation_to_xml(&self, state: &Value) -> Element {
        let mut mutation = Element::new("mutation");
        mutation
            .attributes
            .insert("items".to_string(), json_usize(state, "itemCount").to_string());
        mutation
    }

    fn xml_to_extra_state(&self, mutation: &Element) -> Value {
        json!({ "itemCount": attr_usize(mutation, "items") })
    }

    fn decompose(&self, block: &Block) -> Option<ShapeDraft> {
        Some(ShapeDraft::Items {
            items: (0..Self::count(block)).map(Some).collect(),
        })
    }

    fn compose(&self, ws: &mut Workspace, id: &str, draft: &ShapeDraft) -> Result<()> {
        let ShapeDraft::Items { items } = draft else {
            return Err(wrong_draft(ws, id));
        };
        let old = Self::count(ws.get_block(id)?);
        let slots = (0..old)
            .map(|i| snapshot_input(ws, id, &format!("ADD{}", i)))
            .collect::<Vec<_>>();
        // New slots get a copy of whatever default the existing ones use.
        let template = slots.iter().find_map(|s| s.shadow.as_ref()).map(fresh_shadow);

        for i in 0..old {
            remove_input(ws, id, &format!("ADD{}", i))?;
        }
        {
            let block = ws.get_block_mut(id)?;
            block.extra = ExtraState::Items(0);
        }
        Self::update_shape(ws, id, items.len())?;

        for (k, source) in items.iter().enumerate() {
            let input = format!("ADD{}", k);
            let slot = source.and_then(|s| slots.get(s));
            let shadow = match slot {
                Some(slot) => slot.shadow.clone(),
                None => template.clone(),
            };
            set_shadow_spec(ws, id, &input, shadow);
            let reattached = reconnect(ws, slot.and_then(|s| s.target.as_deref()), id, &input)?;
            if !reattached {
                ws.respawn_shadow(&ConnectionRef::input(id, &input))?;
            }
        }
        Ok(())
    }
}

/// Parameter list and optional body of a procedure definition.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcedureDefMutator;

impl Mutator for ProcedureDefMutator {
    fn save_extra_state(&self, block: &Block) -> Option<Value> {
        let def = block.procedure_def()?;
        if def.params.is_empty() && def.has_statements {
            return None;
        }
        let mut state = Map::new();
        if !def.params.is_empty() {
            let params = def
                .params
                .iter()
                .map(|p| json!({"name": p.name, "id": p.var_id, "paramId": p.id}))
                .collect::<Vec<_>>();
            state.insert("params".to_string(), Value::Array(params));
        }
        if !def.has_statements {
            state.insert("hasStatements".to_string(), json!(false));
        }
        Some(Value::Object(state))
    }

    fn load_extra_state(&self, ws: &mut Workspace, id: &str, state: &Value) -> Result<()> {
        let mut params = Vec::new();
        for param in state
            .get("params")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
        {
            let Some(name) = param.get("name").and_then(Value::as_str) else {
                bail!("Procedure parameter without a name on block '{}'.", id);
            };
            let var_id = param.get("id").and_then(Value::as_str);
            let variable = ws.get_or_create_variable(var_id, name, "")?;
            let param_id = match param.get("paramId").and_then(Value::as_str) {
                Some(param_id) => param_id.to_string(),
                None => ws.gen_uid(),
            };
            params.push(ParamModel {
                id: param_id,
                name: variable.name,
                var_id: variable.id,
            });
        }
        if let Some(def) = ws.get_block_mut(id)?.procedure_def_mut() {
            def.params = params;
        }
        procedures::update_params_label(ws, id)?;
        procedures::mutate_callers(ws, id)?;
        let has_statements = state.get("hasStatements").and_then(Value::as_bool) != Some(false);
        procedures::set_statements(ws, id, has_statements)
    }

    fn mutation_to_xml(&self, state: &Value) -> Element {
        let mut mutation = Element::new("mutation");
        if state.get("hasStatements").and_then(Value::as_bool) == Some(false) {
            mutation
                .attributes
                .insert("statements".to_string(), "false".to_string());
        }
        for param in state
            .get("params")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
        {
            let mut arg = Element::new("arg");
            if let Some(name) = param.get("name").and_then(Value::as_str) {
                arg.attributes.insert("name".to_string(), name.to_string());
            }
            if let Some(var_id) = param.get("id").and_then(Value::as_str) {
                arg.attributes.insert("varid".to_string(), var_id.to_string());
            }
            mutation.children.push(XMLNode::Element(arg));
        }
        mutation
    }

    fn xml_to_extra_state(&self, mutation: &Element) -> Value {
        let params = mutation
            .children
            .iter()
            .filter_map(XMLNode::as_element)
            .filter(|e| e.name.eq_ignore_ascii_case("arg"))
            .map(|arg| {
                let mut param = Map::new();
                if let Some(name) = arg.attributes.get("name") {
                    param.insert("name".to_string(), json!(name));
                }
                let var_id = arg.attributes.get("varid").or_else(|| arg.attributes.get("varId"));
                if let Some(var_id) = var_id {
                    param.insert("id".to_string(), json!(var_id));
                }
                Value::Object(param)
            })
            .collect::<Vec<_>>();
        let mut state = Map::new();
        if !params.is_empty() {
            state.insert("params".to_string(), Value::Array(params));
        }
        if mutation.attributes.get("statements").map(String::as_str) == Some("false") {
            state.insert("hasStatements".to_string(), json!(false));
        }
        Value::Object(state)
    }

    fn decompose(&self, block: &Block) -> Option<ShapeDraft> {
        let def = block.procedure_def()?;
        let mut draft = ProcedureDraft::default();
        for param in &def.params {
            draft.push(&param.id, &param.name);
        }
        if block.block_type == "procedures_defreturn" {
            draft.has_statements = Some(def.has_statements);
        }
        Some(ShapeDraft::Procedure(draft))
    }

    fn compose(&self, ws: &mut Workspace, id: &str, draft: &ShapeDraft) -> Result<()> {
        let ShapeDraft::Procedure(draft) = draft else {
            return Err(wrong_draft(ws, id));
        };
        let requested = draft.params.iter().map(|p| p.name.clone()).collect::<Vec<_>>();
        let names = procedures::legal_param_names(&requested)?;
        let mut params = Vec::new();
        for (param, name) in draft.params.iter().zip(names) {
            let variable = ws.get_or_create_variable(None, &name, "")?;
            params.push(ParamModel {
                id: param.id.clone(),
                name: variable.name,
                var_id: variable.id,
            });
        }
        if let Some(def) = ws.get_block_mut(id)?.procedure_def_mut() {
            def.params = params;
        }
        procedures::update_params_label(ws, id)?;
        procedures::mutate_callers(ws, id)?;
        if let Some(has_statements) = draft.has_statements {
            procedures::set_statements(ws, id, has_statements)?;
        }
        Ok(())
    }
}

/// Name and argument sockets of a procedure call.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcedureCallMutator;

impl Mutator for ProcedureCallMutator {
    fn save_extra_state(&self, block: &Block) -> Option<Value> {
        let call = block.procedure_call()?;
        let mut state = Map::new();
        state.insert(
            "name".to_string(),
            json!(block.field_value("NAME").unwrap_or_default()),
        );
        if !call.arguments.is_empty() {
            state.insert("params".to_string(), json!(call.arguments));
        }
        Some(Value::Object(state))
    }

    fn load_extra_state(&self, ws: &mut Workspace, id: &str, state: &Value) -> Result<()> {
        let name = state.get("name").and_then(Value::as_str).unwrap_or_default();
        if let Some(field) = ws.get_block_mut(id)?.field_mut("NAME") {
            field.value = crate::block::FieldValue::Text(name.to_string());
        }
        let names = state
            .get("params")
            .and_then(Value::as_array)
            .map(|params| params.iter().map(state::value_to_text).collect::<Vec<_>>())
            .unwrap_or_default();
        let ids = vec![String::new(); names.len()];
        procedures::set_procedure_parameters(ws, id, &names, &ids)
    }

    fn mutation_to_xml(&self, state: &Value) -> Element {
        let mut mutation = Element::new("mutation");
        let name = state.get("name").and_then(Value::as_str).unwrap_or_default();
        mutation.attributes.insert("name".to_string(), name.to_string());
        for param in state
            .get("params")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
        {
            let mut arg = Element::new("arg");
            arg.attributes
                .insert("name".to_string(), state::value_to_text(param));
            mutation.children.push(XMLNode::Element(arg));
        }
        mutation
    }

    fn xml_to_extra_state(&self, mutation: &Element) -> Value {
        let params = mutation
            .children
            .iter()
            .filter_map(XMLNode::as_element)
            .filter(|e| e.name.eq_ignore_ascii_case("arg"))
            .filter_map(|arg| arg.attributes.get("name").cloned())
            .collect::<Vec<_>>();
        let name = mutation.attributes.get("name").cloned().unwrap_or_default();
        if params.is_empty() {
            return json!({ "name": name });
        }
        json!({ "name": name, "params": params })
    }
}

/// Whether a `procedures_ifreturn` carries a value socket.
#[derive(Debug, Clone, Copy, Default)]
pub struct IfReturnMutator;

impl Mutator for IfReturnMutator {
    fn save_extra_state(&self, block: &Block) -> Option<Value> {
        match block.extra {
            ExtraState::IfReturn { has_return_value } => {
                Some(json!({ "hasReturnValue": has_return_value }))
            }
            _ => None,
        }
    }

    fn load_extra_state(&self, ws: &mut Workspace, id: &str, state: &Value) -> Result<()> {
        let has_return_value = state
            .get("hasReturnValue")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        procedures::set_if_return_value(ws, id, has_return_value)
    }

    fn mutation_to_xml(&self, state: &Value) -> Element {
        let has_return_value = state
            .get("hasReturnValue")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let mut mutation = Element::new("mutation");
        mutation.attributes.insert(
            "value".to_string(),
            u8::from(has_return_value).to_string(),
        );
        mutation
    }

    fn xml_to_extra_state(&self, mutation: &Element) -> Value {
        let has_return_value = mutation.attributes.get("value").map(String::as_str) == Some("1");
        json!({ "hasReturnValue": has_return_value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn if_with_clauses(ws: &mut Workspace) -> BlockId {
        let id = ws.create_block("controls_if").unwrap();
        ws.mutate(
            &id,
            &ShapeDraft::IfElse {
                elseif: vec![None, None],
                has_else: true,
            },
        )
        .unwrap();
        id
    }

    #[test]
    fn if_else_shape_follows_the_draft() {
        let mut ws = Workspace::new();
        let id = if_with_clauses(&mut ws);
        let names = ws
            .block(&id)
            .unwrap()
            .inputs
            .iter()
            .map(|i| i.name.clone())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["IF0", "DO0", "IF1", "DO1", "IF2", "DO2", "ELSE"]);
    }

    #[test]
    fn reordered_clauses_keep_their_blocks() {
        let mut ws = Workspace::new();
        let id = if_with_clauses(&mut ws);
        let first = ws.create_block("logic_boolean").unwrap();
        let second = ws.create_block("logic_boolean").unwrap();
        let body = ws.create_block("text_print").unwrap();
        ws.attach(&id, "IF1", &first).unwrap();
        ws.attach(&id, "IF2", &second).unwrap();
        ws.attach(&id, "DO2", &body).unwrap();

        let draft = ShapeDraft::IfElse {
            elseif: vec![Some(2), Some(1)],
            has_else: false,
        };
        ws.mutate(&id, &draft).unwrap();
        let block = ws.block(&id).unwrap();
        assert_eq!(block.input_target("IF1"), Some(&second));
        assert_eq!(block.input_target("DO1"), Some(&body));
        assert_eq!(block.input_target("IF2"), Some(&first));
        assert!(block.input("ELSE").is_none());
    }

    #[test]
    fn dropped_clause_blocks_stay_on_the_workspace() {
        let mut ws = Workspace::new();
        let id = if_with_clauses(&mut ws);
        let condition = ws.create_block("logic_boolean").unwrap();
        ws.attach(&id, "IF2", &condition).unwrap();
        ws.mutate(
            &id,
            &ShapeDraft::IfElse {
                elseif: vec![Some(1)],
                has_else: true,
            },
        )
        .unwrap();
        assert!(ws.top_blocks().contains(&condition));
        assert!(ws.block(&id).unwrap().input("IF2").is_none());
    }

    #[test]
    fn mutate_fires_a_single_change_event() {
        let mut ws = Workspace::new();
        let id = ws.create_block("text_join").unwrap();
        ws.events.clear_undo();
        ws.mutate(&id, &ShapeDraft::Items { items: vec![Some(1), None, Some(0)] })
            .unwrap();
        let log = ws.events.undo_log();
        assert_eq!(log.len(), 1);
        assert!(matches!(
            &log[0].data,
            EventData::BlockChange { element: ChangeElement::Mutation, .. }
        ));
    }

    #[test]
    fn items_reattach_and_new_slots_copy_the_default() {
        let mut ws = Workspace::new();
        let state: BlockState = serde_json::from_value(json!({
            "type": "text_join",
            "id": "join",
            "extraState": {"itemCount": 2},
            "inputs": {
                "ADD0": {"shadow": {"type": "text", "fields": {"TEXT": ""}}},
                "ADD1": {"block": {"type": "text", "id": "hello", "fields": {"TEXT": "hello"}}}
            }
        }))
        .unwrap();
        state::append(&mut ws, &state).unwrap();
        ws.mutate("join", &ShapeDraft::Items { items: vec![Some(1), None] })
            .unwrap();
        let join = ws.block("join").unwrap();
        assert_eq!(join.input_target("ADD0").map(String::as_str), Some("hello"));
        let filler = join.input_target("ADD1").cloned().unwrap();
        assert!(ws.block(&filler).unwrap().shadow);
    }

    #[test]
    fn empty_item_lists_show_a_placeholder_row() {
        let mut ws = Workspace::new();
        let id = ws.create_block("lists_create_with").unwrap();
        ws.mutate(&id, &ShapeDraft::Items { items: vec![] }).unwrap();
        let block = ws.block(&id).unwrap();
        assert!(block.input("EMPTY").is_some());
        assert!(block.input("ADD0").is_none());
    }

    #[test]
    fn wrong_draft_kind_is_an_error() {
        let mut ws = Workspace::new();
        let id = ws.create_block("text_join").unwrap();
        let err = ws
            .mutate(&id, &ShapeDraft::IfElse { elseif: vec![], has_else: true })
            .unwrap_err();
        assert!(err.downcast_ref::<MutationError>().is_some());
    }

    #[test]
    fn if_mutation_xml_round_trips_through_extra_state() {
        let state = json!({"elseIfCount": 2, "hasElse": true});
        let xml = IfElseMutator.mutation_to_xml(&state);
        assert_eq!(xml.attributes.get("elseif").map(String::as_str), Some("2"));
        assert_eq!(IfElseMutator.xml_to_extra_state(&xml), state);
    }
}
