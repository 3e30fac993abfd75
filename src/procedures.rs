use crate::block::{BlockId, FieldValue};
use crate::events::{ChangeElement, Event, EventBus, EventData, EventKind};
use crate::mutator::{reconnect, remove_input, MutationError};
use crate::state::{self, BlockState};
use crate::types::TypeCheck;
use crate::workspace::Workspace;
use anyhow::{anyhow, Result};
use regex::Regex;
use serde_json::json;
use std::collections::HashMap;

pub const DEF_NO_RETURN: &str = "procedures_defnoreturn";
pub const DEF_RETURN: &str = "procedures_defreturn";
pub const CALL_NO_RETURN: &str = "procedures_callnoreturn";
pub const CALL_RETURN: &str = "procedures_callreturn";
pub const IF_RETURN: &str = "procedures_ifreturn";

pub const DEFAULT_ARG: &str = "x";
const UNNAMED: &str = "unnamed";
const IF_RETURN_WARNING: &str = "Warning: This block may be used only within a function definition.";

/// Name, parameters and kind of a procedure definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcedureSignature {
    pub def_id: BlockId,
    pub name: String,
    pub params: Vec<String>,
    pub has_return: bool,
}

/// Procedure names compare case-insensitively.
pub fn names_equal(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

pub fn is_definition(ws: &Workspace, id: &str) -> bool {
    ws.block(id).is_some_and(|b| b.procedure_def().is_some())
}

pub fn is_call(ws: &Workspace, id: &str) -> bool {
    ws.block(id).is_some_and(|b| b.procedure_call().is_some())
}

fn def_type_for_call(call_type: &str) -> &'static str {
    if call_type == CALL_RETURN {
        DEF_RETURN
    } else {
        DEF_NO_RETURN
    }
}

pub fn signature(ws: &Workspace, def_id: &str) -> Option<ProcedureSignature> {
    let block = ws.block(def_id)?;
    let def = block.procedure_def()?;
    Some(ProcedureSignature {
        def_id: def_id.to_string(),
        name: block.field_value("NAME").unwrap_or_default().to_string(),
        params: def.params.iter().map(|p| p.name.clone()).collect(),
        has_return: block.block_type == DEF_RETURN,
    })
}

/// Every definition on the workspace, split into (no return, return) and
/// sorted by name.
pub fn all_procedures(ws: &Workspace) -> (Vec<ProcedureSignature>, Vec<ProcedureSignature>) {
    let (mut with_return, mut without_return): (Vec<_>, Vec<_>) = ws
        .all_blocks()
        .iter()
        .filter_map(|id| signature(ws, id))
        .partition(|sig| sig.has_return);
    without_return.sort_by_key(|sig| sig.name.to_lowercase());
    with_return.sort_by_key(|sig| sig.name.to_lowercase());
    (without_return, with_return)
}

/// Top-level definition with the given name.
pub fn get_definition(ws: &Workspace, name: &str) -> Option<BlockId> {
    ws.top_blocks()
        .iter()
        .find(|id| {
            ws.block(id).is_some_and(|b| {
                b.procedure_def().is_some() && names_equal(b.field_value("NAME").unwrap_or_default(), name)
            })
        })
        .cloned()
}

/// Every call block referring to `name`.
pub fn get_callers(ws: &Workspace, name: &str) -> Vec<BlockId> {
    ws.all_blocks()
        .into_iter()
        .filter(|id| {
            ws.block(id).is_some_and(|b| {
                let call_name = b.field_value("NAME").unwrap_or_default();
                b.procedure_call().is_some() && !call_name.is_empty() && names_equal(call_name, name)
            })
        })
        .collect()
}

/// Whether a definition other than `exclude` already uses `name`.
pub fn is_name_used(ws: &Workspace, name: &str, exclude: Option<&str>) -> bool {
    ws.all_blocks().iter().any(|id| {
        Some(id.as_str()) != exclude
            && ws.block(id).is_some_and(|b| {
                b.procedure_def().is_some() && names_equal(b.field_value("NAME").unwrap_or_default(), name)
            })
    })
}

fn trailing_number() -> Result<Regex> {
    Ok(Regex::new(r"^(?P<prefix>.*?)(?P<number>\d+)$")?)
}

/// Bumps a trailing number, or appends `2` when there is none.
fn next_candidate(trailing: &Regex, name: &str) -> String {
    if let Some(caps) = trailing.captures(name) {
        let prefix = caps.name("prefix").map_or("", |m| m.as_str());
        if let Some(n) = caps.name("number").and_then(|m| m.as_str().parse::<u64>().ok()) {
            if let Some(next) = n.checked_add(1) {
                return format!("{}{}", prefix, next);
            }
        }
    }
    format!("{}2", name)
}

/// A procedure name not used by any definition other than `exclude`.
pub fn find_legal_name(ws: &Workspace, name: &str, exclude: Option<&str>) -> Result<String> {
    let trailing = trailing_number()?;
    let mut name = if name.is_empty() {
        UNNAMED.to_string()
    } else {
        name.to_string()
    };
    while is_name_used(ws, &name, exclude) {
        name = next_candidate(&trailing, &name);
    }
    Ok(name)
}

/// Makes parameter names distinct within one definition. Blank names
/// become `x`.
pub fn legal_param_names(names: &[String]) -> Result<Vec<String>> {
    let trailing = trailing_number()?;
    let mut taken: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        let trimmed = name.trim();
        let mut candidate = if trimmed.is_empty() {
            DEFAULT_ARG.to_string()
        } else {
            trimmed.to_string()
        };
        while taken.iter().any(|t| names_equal(t, &candidate)) {
            candidate = next_candidate(&trailing, &candidate);
        }
        taken.push(candidate);
    }
    Ok(taken)
}

/// Block init hook for definitions: a pasted or freshly created
/// definition never shares a name with another one.
pub fn legalize_definition_name(ws: &mut Workspace, id: &str) -> Result<()> {
    let current = ws.get_block(id)?.field_value("NAME").unwrap_or_default().trim().to_string();
    let legal = find_legal_name(ws, &current, Some(id))?;
    if let Some(field) = ws.get_block_mut(id)?.field_mut("NAME") {
        field.value = FieldValue::Text(legal);
    }
    Ok(())
}

/// Renames a definition and every call to it. Returns the name actually
/// applied, which may carry a numeric suffix.
pub fn rename_procedure(ws: &mut Workspace, def_id: &str, new_name: &str) -> Result<String> {
    let block = ws.get_block(def_id)?;
    if block.procedure_def().is_none() {
        return Err(anyhow!("{} is not a procedure definition.", block.describe()));
    }
    let old_name = block.field_value("NAME").unwrap_or_default().to_string();
    let legal = find_legal_name(ws, new_name.trim(), Some(def_id))?;
    let mut scope = ws.begin_group(None);
    if old_name != new_name && old_name != legal {
        for caller in get_callers(&scope, &old_name) {
            scope.set_field_value(&caller, "NAME", &legal)?;
        }
    }
    scope.set_field_value(def_id, "NAME", &legal)?;
    log::debug!("renamed procedure '{}' to '{}'", old_name, legal);
    Ok(legal)
}

/// Refreshes the "with: a, b" label of a definition.
pub fn update_params_label(ws: &mut Workspace, def_id: &str) -> Result<()> {
    let block = ws.get_block_mut(def_id)?;
    let names = block
        .procedure_def()
        .map(|d| d.params.iter().map(|p| p.name.as_str()).collect::<Vec<_>>().join(", "))
        .unwrap_or_default();
    let label = if names.is_empty() {
        String::new()
    } else {
        format!("with: {}", names)
    };
    if let Some(field) = block.field_mut("PARAMS") {
        field.value = FieldValue::Text(label);
    }
    Ok(())
}

/// Brings every call of a definition in line with its parameters. Calls
/// whose shape changes report it as an unrecorded mutation.
pub fn mutate_callers(ws: &mut Workspace, def_id: &str) -> Result<()> {
    let block = ws.get_block(def_id)?;
    let Some(def) = block.procedure_def() else {
        return Ok(());
    };
    let name = block.field_value("NAME").unwrap_or_default().to_string();
    let names = def.params.iter().map(|p| p.name.clone()).collect::<Vec<_>>();
    let ids = def.params.iter().map(|p| p.id.clone()).collect::<Vec<_>>();
    for caller in get_callers(ws, &name) {
        let old_value = state::save_extra_state(ws, ws.get_block(&caller)?).map(|v| v.to_string());
        set_procedure_parameters(ws, &caller, &names, &ids)?;
        let new_value = state::save_extra_state(ws, ws.get_block(&caller)?).map(|v| v.to_string());
        if old_value != new_value {
            let mut scope = ws.without_undo();
            scope.fire(EventData::BlockChange {
                block_id: caller.clone(),
                element: ChangeElement::Mutation,
                old_value,
                new_value,
            })?;
        }
    }
    Ok(())
}

/// Gives a freshly built call the parameter ids of its definition when
/// their argument names agree.
pub fn link_call(ws: &mut Workspace, call_id: &str) -> Result<()> {
    let name = ws.get_block(call_id)?.field_value("NAME").unwrap_or_default().to_string();
    let Some(def) = get_definition(ws, &name).and_then(|d| ws.block(&d)).and_then(|b| b.procedure_def()) else {
        return Ok(());
    };
    let names = def.params.iter().map(|p| p.name.clone()).collect::<Vec<_>>();
    let ids = def.params.iter().map(|p| p.id.clone()).collect::<Vec<_>>();
    if let Some(call) = ws.get_block_mut(call_id)?.procedure_call_mut() {
        if call.arguments == names {
            call.quark_ids = ids;
        }
    }
    Ok(())
}

/// Re-links every call on the workspace with its definition.
pub fn sync_all_callers(ws: &mut Workspace) -> Result<()> {
    let defs = ws
        .top_blocks()
        .iter()
        .filter(|id| is_definition(ws, id))
        .cloned()
        .collect::<Vec<_>>();
    for def_id in defs {
        mutate_callers(ws, &def_id)?;
    }
    Ok(())
}

/// Rebuilds the argument sockets of a call. Plugged blocks follow their
/// parameter id, so renames and reorders keep the wiring. While the
/// definition's mutator is open, blocks of removed parameters are
/// remembered and come back if the parameter does.
pub fn set_procedure_parameters(ws: &mut Workspace, call_id: &str, names: &[String], ids: &[String]) -> Result<()> {
    let call_block = ws.get_block(call_id)?;
    let call = call_block
        .procedure_call()
        .cloned()
        .ok_or_else(|| anyhow!("{} is not a procedure call.", call_block.describe()))?;
    let call_name = call_block.field_value("NAME").unwrap_or_default().to_string();
    let mutator_open = get_definition(ws, &call_name)
        .and_then(|d| ws.block(&d))
        .and_then(|b| b.procedure_def())
        .is_some_and(|d| d.mutator_open);

    let mut quark_connections = if mutator_open {
        call.quark_connections.clone()
    } else {
        HashMap::new()
    };

    if names == call.arguments.as_slice() {
        let state = ws
            .get_block_mut(call_id)?
            .procedure_call_mut()
            .ok_or_else(|| anyhow!("Call state vanished for '{}'.", call_id))?;
        state.quark_ids = ids.to_vec();
        state.quark_connections = quark_connections;
        return Ok(());
    }
    if names.len() != ids.len() {
        return Err(MutationError::ParamLengthMismatch {
            names: names.len(),
            ids: ids.len(),
        }
        .into());
    }

    let mut batch = ws.begin_batch();
    for i in 0..call.arguments.len() {
        let input = format!("ARG{}", i);
        let Some(target) = batch.get_block(call_id)?.input_target(&input).cloned() else {
            continue;
        };
        if batch.block(&target).is_some_and(|b| b.shadow) {
            continue;
        }
        // Unlinked sockets line up with the new parameters by position.
        let key = match call.quark_ids.get(i) {
            Some(id) if !id.is_empty() => id.clone(),
            _ => ids.get(i).cloned().unwrap_or_default(),
        };
        quark_connections.insert(key, target);
    }
    for i in 0..call.arguments.len() {
        remove_input(&mut batch, call_id, &format!("ARG{}", i))?;
    }

    {
        let block = batch.get_block_mut(call_id)?;
        for (i, name) in names.iter().enumerate() {
            block.append_value_input(&format!("ARG{}", i), TypeCheck::Any).label = Some(name.clone());
        }
        if let Some(state) = block.procedure_call_mut() {
            state.arguments = names.to_vec();
            state.quark_ids = ids.to_vec();
        }
        if mutator_open {
            block.collapsed = false;
        }
    }

    for (i, id) in ids.iter().enumerate() {
        let Some(target) = quark_connections.get(id).cloned() else {
            continue;
        };
        if !reconnect(&mut batch, Some(&target), call_id, &format!("ARG{}", i))? {
            quark_connections.remove(id);
        }
    }
    if !mutator_open {
        quark_connections.clear();
    }
    if let Some(state) = batch.get_block_mut(call_id)?.procedure_call_mut() {
        state.quark_connections = quark_connections;
    }
    drop(batch);

    for name in names {
        ws.get_or_create_variable(None, name, "")?;
    }
    Ok(())
}

/// Marks a definition's parameter editor as open; calls then remember the
/// blocks of parameters that are removed until it closes.
pub fn open_mutator(ws: &mut Workspace, def_id: &str) -> Result<()> {
    if let Some(def) = ws.get_block_mut(def_id)?.procedure_def_mut() {
        def.mutator_open = true;
    }
    mutate_callers(ws, def_id)
}

pub fn close_mutator(ws: &mut Workspace, def_id: &str) -> Result<()> {
    let block = ws.get_block_mut(def_id)?;
    if let Some(def) = block.procedure_def_mut() {
        def.mutator_open = false;
    }
    let name = block.field_value("NAME").unwrap_or_default().to_string();
    for caller in get_callers(ws, &name) {
        if let Some(call) = ws.get_block_mut(&caller)?.procedure_call_mut() {
            call.quark_connections.clear();
        }
    }
    Ok(())
}

/// Shows or hides a definition's body. A hidden body is detached and
/// plugged back in when it is shown again.
pub fn set_statements(ws: &mut Workspace, def_id: &str, has_statements: bool) -> Result<()> {
    let block = ws.get_block(def_id)?;
    let Some(def) = block.procedure_def() else {
        return Ok(());
    };
    if def.has_statements == has_statements {
        return Ok(());
    }
    if has_statements {
        let stashed = {
            let block = ws.get_block_mut(def_id)?;
            block.append_statement_input("STACK");
            if block.input("RETURN").is_some() {
                block.move_input_before("STACK", Some("RETURN"));
            }
            block.procedure_def_mut().and_then(|d| {
                d.has_statements = true;
                d.stashed_statement.take()
            })
        };
        reconnect(ws, stashed.as_deref(), def_id, "STACK")?;
    } else {
        let body = block.input_target("STACK").cloned();
        if let Some(body) = &body {
            ws.unplug(body, false)?;
        }
        let block = ws.get_block_mut(def_id)?;
        block.inputs.retain(|i| i.name != "STACK");
        if let Some(def) = block.procedure_def_mut() {
            def.has_statements = false;
            def.stashed_statement = body;
        }
    }
    Ok(())
}

/// Switches a `procedures_ifreturn` between a value socket and a bare
/// return.
pub fn set_if_return_value(ws: &mut Workspace, id: &str, has_return_value: bool) -> Result<()> {
    remove_input(ws, id, "VALUE")?;
    let block = ws.get_block_mut(id)?;
    if has_return_value {
        block.append_value_input("VALUE", TypeCheck::Any);
    } else {
        block.append_dummy_input("VALUE");
    }
    block.extra = crate::block::ExtraState::IfReturn { has_return_value };
    Ok(())
}

pub fn register_listeners(events: &mut EventBus) {
    events.subscribe(EventKind::BlockCreate, on_block_create);
    events.subscribe(EventKind::BlockCreate, on_block_placed);
    events.subscribe(EventKind::BlockMove, on_block_placed);
    events.subscribe(EventKind::BlockDelete, on_block_delete);
    events.subscribe(EventKind::BlockChange, on_block_change);
    events.subscribe(EventKind::VarRename, on_variable_rename);
}

/// A call pasted without a matching definition gets one.
fn on_block_create(ws: &mut Workspace, event: &Event) -> Result<()> {
    let EventData::BlockCreate { ids, .. } = &event.data else {
        return Ok(());
    };
    if !event.record_undo {
        return Ok(());
    }
    for id in ids {
        adopt_orphan_call(ws, id, event.group.clone())?;
    }
    Ok(())
}

/// Creates a definition for call `id` when no definition with its name and
/// parameters exists. The new definition joins `group`. Returns whether a
/// definition was created.
pub fn adopt_orphan_call(ws: &mut Workspace, id: &str, group: Option<String>) -> Result<bool> {
    let Some(block) = ws.block(id) else {
        return Ok(false);
    };
    let Some(call) = block.procedure_call() else {
        return Ok(false);
    };
    let name = block.field_value("NAME").unwrap_or_default().to_string();
    if name.is_empty() {
        return Ok(false);
    }
    let def_type = def_type_for_call(&block.block_type);
    let matches = get_definition(ws, &name)
        .and_then(|d| ws.block(&d))
        .is_some_and(|def| {
            def.block_type == def_type
                && def
                    .procedure_def()
                    .is_some_and(|d| d.params.iter().map(|p| &p.name).eq(call.arguments.iter()))
        });
    if matches {
        return Ok(false);
    }

    let legal = find_legal_name(ws, &name, None)?;
    let offset = ws.options.snap_radius;
    let mut def_state = BlockState::new(def_type);
    def_state.x = Some(block.x + offset);
    def_state.y = Some(block.y + offset * 2.0);
    def_state.fields.insert("NAME".to_string(), json!(legal));
    if !call.arguments.is_empty() {
        let params = call.arguments.iter().map(|a| json!({ "name": a })).collect::<Vec<_>>();
        def_state.extra_state = Some(json!({ "params": params }));
    }
    log::debug!("creating definition '{}' for orphaned call '{}'", legal, id);
    let mut scope = ws.begin_group(group);
    if legal != name {
        scope.set_field_value(id, "NAME", &legal)?;
    }
    state::append(&mut scope, &def_state)?;
    Ok(true)
}

/// Gives every call without any definition of its name a definition.
/// Loading does not record undo, so the create listener skips loaded calls.
pub fn adopt_orphan_calls(ws: &mut Workspace) -> Result<()> {
    let orphans = ws
        .all_blocks()
        .into_iter()
        .filter(|id| {
            ws.block(id).is_some_and(|b| {
                let name = b.field_value("NAME").unwrap_or_default();
                b.procedure_call().is_some() && !name.is_empty() && get_definition(ws, name).is_none()
            })
        })
        .collect::<Vec<_>>();
    for id in orphans {
        // An earlier adoption may already have created this name.
        let name = ws.get_block(&id)?.field_value("NAME").unwrap_or_default().to_string();
        if get_definition(ws, &name).is_none() {
            adopt_orphan_call(ws, &id, None)?;
        }
    }
    Ok(())
}

/// Calls whose definition disappeared are removed.
fn on_block_delete(ws: &mut Workspace, event: &Event) -> Result<()> {
    if !event.record_undo {
        return Ok(());
    }
    let orphans = ws
        .all_blocks()
        .into_iter()
        .filter(|id| {
            ws.block(id).is_some_and(|b| {
                let name = b.field_value("NAME").unwrap_or_default();
                b.procedure_call().is_some() && !name.is_empty() && get_definition(ws, name).is_none()
            })
        })
        .collect::<Vec<_>>();
    if orphans.is_empty() {
        return Ok(());
    }
    let mut scope = ws.begin_group(event.group.clone());
    for id in orphans {
        if scope.block(&id).is_some() {
            log::debug!("disposing call '{}' whose definition was deleted", id);
            scope.dispose(&id, true)?;
        }
    }
    Ok(())
}

/// Disabling a definition disables its calls; re-enabling restores each
/// call's earlier state.
fn on_block_change(ws: &mut Workspace, event: &Event) -> Result<()> {
    let EventData::BlockChange {
        block_id,
        element: ChangeElement::Disabled,
        new_value,
        ..
    } = &event.data
    else {
        return Ok(());
    };
    if !event.record_undo || !is_definition(ws, block_id) {
        return Ok(());
    }
    let name = ws.get_block(block_id)?.field_value("NAME").unwrap_or_default().to_string();
    if get_definition(ws, &name).as_deref() != Some(block_id.as_str()) {
        return Ok(());
    }
    let disabled = new_value.as_deref() == Some("true");
    let mut scope = ws.begin_group(event.group.clone());
    for caller in get_callers(&scope, &name) {
        let block = scope.get_block_mut(&caller)?;
        let enabled = block.enabled;
        let Some(call) = block.procedure_call_mut() else {
            continue;
        };
        if disabled {
            call.previous_enabled = enabled;
            scope.set_enabled(&caller, false)?;
        } else {
            let previous = call.previous_enabled;
            scope.set_enabled(&caller, previous)?;
        }
    }
    Ok(())
}

/// Re-evaluates every `procedures_ifreturn` inside a block that was
/// created or moved.
fn on_block_placed(ws: &mut Workspace, event: &Event) -> Result<()> {
    if !event.record_undo {
        return Ok(());
    }
    let Some(block_id) = event.data.block_id() else {
        return Ok(());
    };
    if ws.block(block_id).is_none() {
        return Ok(());
    }
    let returns = ws
        .descendants(block_id)
        .into_iter()
        .filter(|id| ws.block(id).is_some_and(|b| b.block_type == IF_RETURN))
        .collect::<Vec<_>>();
    if returns.is_empty() {
        return Ok(());
    }
    let mut scope = ws.begin_group(event.group.clone());
    for id in returns {
        update_if_return(&mut scope, &id)?;
    }
    Ok(())
}

fn update_if_return(ws: &mut Workspace, id: &str) -> Result<()> {
    let mut enclosing = None;
    let mut current = Some(id.to_string());
    while let Some(candidate) = current {
        let block_type = ws.get_block(&candidate)?.block_type.clone();
        if block_type == DEF_NO_RETURN || block_type == DEF_RETURN {
            enclosing = Some(block_type);
            break;
        }
        current = ws.surround_parent(&candidate);
    }
    let Some(def_type) = enclosing else {
        ws.set_warning(id, Some(IF_RETURN_WARNING))?;
        return ws.set_enabled(id, false);
    };
    let has_value = matches!(
        ws.get_block(id)?.extra,
        crate::block::ExtraState::IfReturn { has_return_value: true }
    );
    if def_type == DEF_NO_RETURN && has_value {
        set_if_return_value(ws, id, false)?;
    } else if def_type == DEF_RETURN && !has_value {
        set_if_return_value(ws, id, true)?;
    }
    ws.set_warning(id, None)?;
    ws.set_enabled(id, true)
}

/// Parameter variables renamed elsewhere are reflected in definitions and
/// their calls.
fn on_variable_rename(ws: &mut Workspace, event: &Event) -> Result<()> {
    let EventData::VarRename { var_id, new_name, .. } = &event.data else {
        return Ok(());
    };
    let defs = ws
        .all_blocks()
        .into_iter()
        .filter(|id| {
            ws.block(id)
                .and_then(|b| b.procedure_def())
                .is_some_and(|d| d.params.iter().any(|p| &p.var_id == var_id))
        })
        .collect::<Vec<_>>();
    for def_id in defs {
        if let Some(def) = ws.get_block_mut(&def_id)?.procedure_def_mut() {
            for param in def.params.iter_mut().filter(|p| &p.var_id == var_id) {
                param.name = new_name.clone();
            }
        }
        update_params_label(ws, &def_id)?;
        mutate_callers(ws, &def_id)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutator::{ProcedureDraft, ShapeDraft};
    use pretty_assertions::assert_eq;

    fn define(ws: &mut Workspace, block_type: &str, name: &str, params: &[&str]) -> BlockId {
        let id = ws.create_block(block_type).unwrap();
        rename_procedure(ws, &id, name).unwrap();
        let mut draft = ProcedureDraft::default();
        for (i, param) in params.iter().enumerate() {
            draft.push(&format!("{}-p{}", id, i), param);
        }
        ws.mutate(&id, &ShapeDraft::Procedure(draft)).unwrap();
        id
    }

    fn call(ws: &mut Workspace, name: &str, args: &[&str]) -> BlockId {
        let mut state = BlockState::new(CALL_NO_RETURN);
        state.extra_state = Some(json!({ "name": name, "params": args }));
        state::append(ws, &state).unwrap()
    }

    fn draft_of(ws: &Workspace, def_id: &str) -> ProcedureDraft {
        match ws.decompose(def_id).unwrap() {
            ShapeDraft::Procedure(draft) => draft,
            other => panic!("unexpected draft {:?}", other),
        }
    }

    fn argument_labels(ws: &Workspace, call_id: &str) -> Vec<String> {
        ws.block(call_id)
            .unwrap()
            .inputs
            .iter()
            .filter_map(|i| i.label.clone())
            .collect()
    }

    #[test]
    fn legal_names_bump_trailing_numbers() {
        let mut ws = Workspace::new();
        define(&mut ws, DEF_NO_RETURN, "foo", &[]);
        define(&mut ws, DEF_NO_RETURN, "bar9", &[]);
        assert_eq!(find_legal_name(&ws, "FOO", None).unwrap(), "FOO2");
        assert_eq!(find_legal_name(&ws, "bar9", None).unwrap(), "bar10");
        assert_eq!(find_legal_name(&ws, "", None).unwrap(), "unnamed");
    }

    #[test]
    fn new_definitions_never_share_a_name() {
        let mut ws = Workspace::new();
        let first = ws.create_block(DEF_NO_RETURN).unwrap();
        let second = ws.create_block(DEF_RETURN).unwrap();
        assert_eq!(ws.block(&first).unwrap().field_value("NAME"), Some("unnamed"));
        assert_eq!(ws.block(&second).unwrap().field_value("NAME"), Some("unnamed2"));
    }

    #[test]
    fn param_names_are_made_distinct() {
        let names = ["a", "A", " ", "x"].map(String::from);
        assert_eq!(legal_param_names(&names).unwrap(), vec!["a", "A2", "x", "x2"]);
    }

    #[test]
    fn all_procedures_splits_and_sorts() {
        let mut ws = Workspace::new();
        define(&mut ws, DEF_RETURN, "zeta", &[]);
        define(&mut ws, DEF_NO_RETURN, "Beta", &["n"]);
        define(&mut ws, DEF_NO_RETURN, "alpha", &[]);
        let (plain, returning) = all_procedures(&ws);
        let names = plain.iter().map(|s| s.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["alpha", "Beta"]);
        assert_eq!(plain[1].params, vec!["n"]);
        assert_eq!(returning[0].name, "zeta");
    }

    #[test]
    fn renaming_a_definition_renames_its_calls() {
        let mut ws = Workspace::new();
        let def = define(&mut ws, DEF_NO_RETURN, "draw", &[]);
        let caller = call(&mut ws, "draw", &[]);
        assert_eq!(rename_procedure(&mut ws, &def, "paint").unwrap(), "paint");
        assert_eq!(ws.block(&caller).unwrap().field_value("NAME"), Some("paint"));
    }

    #[test]
    fn deleting_a_definition_removes_calls_in_one_group() {
        let mut ws = Workspace::new();
        let def = define(&mut ws, DEF_NO_RETURN, "f", &[]);
        let calls = (0..3).map(|_| call(&mut ws, "f", &[])).collect::<Vec<_>>();
        ws.events.clear_undo();
        ws.dispose(&def, false).unwrap();
        for id in &calls {
            assert!(ws.block(id).is_none());
        }
        let log = ws.events.undo_log();
        let deletes = log
            .iter()
            .filter(|e| e.data.kind() == EventKind::BlockDelete)
            .collect::<Vec<_>>();
        assert_eq!(deletes.len(), 4);
        assert!(deletes.iter().all(|e| e.group == deletes[0].group));
        assert!(deletes[0].group.is_some());
    }

    #[test]
    fn renaming_a_parameter_keeps_wiring() {
        let mut ws = Workspace::new();
        let def = define(&mut ws, DEF_NO_RETURN, "f", &["x"]);
        let mut plugged = Vec::new();
        let calls = (0..3).map(|_| call(&mut ws, "f", &["x"])).collect::<Vec<_>>();
        for id in &calls {
            let number = ws.create_block("math_number").unwrap();
            assert!(ws.attach(id, "ARG0", &number).unwrap());
            plugged.push(number);
        }
        let mut draft = draft_of(&ws, &def);
        draft.params[0].name = "y".to_string();
        ws.mutate(&def, &ShapeDraft::Procedure(draft)).unwrap();
        for (id, number) in calls.iter().zip(&plugged) {
            assert_eq!(argument_labels(&ws, id), vec!["y"]);
            assert_eq!(ws.block(id).unwrap().input_target("ARG0"), Some(number));
        }
    }

    #[test]
    fn variable_rename_reaches_calls() {
        let mut ws = Workspace::new();
        let def = define(&mut ws, DEF_NO_RETURN, "f", &["x"]);
        let caller = call(&mut ws, "f", &["x"]);
        let var_id = ws.block(&def).unwrap().procedure_def().unwrap().params[0].var_id.clone();
        ws.rename_variable_by_id(&var_id, "size").unwrap();
        assert_eq!(argument_labels(&ws, &caller), vec!["size"]);
        assert_eq!(ws.block(&def).unwrap().field_value("PARAMS"), Some("with: size"));
    }

    #[test]
    fn adding_then_removing_a_parameter_restores_wiring() {
        let mut ws = Workspace::new();
        let def = define(&mut ws, DEF_NO_RETURN, "f", &["x", "y"]);
        let caller = call(&mut ws, "f", &["x", "y"]);
        let a = ws.create_block("math_number").unwrap();
        let b = ws.create_block("text").unwrap();
        ws.attach(&caller, "ARG0", &a).unwrap();
        ws.attach(&caller, "ARG1", &b).unwrap();

        open_mutator(&mut ws, &def).unwrap();
        let original = draft_of(&ws, &def);
        let mut widened = original.clone();
        widened.params.insert(0, crate::mutator::ParamDraft { id: "new".to_string(), name: "z".to_string() });
        ws.mutate(&def, &ShapeDraft::Procedure(widened)).unwrap();
        assert_eq!(ws.block(&caller).unwrap().input_target("ARG1"), Some(&a));
        assert_eq!(ws.block(&caller).unwrap().input_target("ARG2"), Some(&b));

        ws.mutate(&def, &ShapeDraft::Procedure(original)).unwrap();
        close_mutator(&mut ws, &def).unwrap();
        let block = ws.block(&caller).unwrap();
        assert_eq!(block.input_target("ARG0"), Some(&a));
        assert_eq!(block.input_target("ARG1"), Some(&b));
        assert!(block.input("ARG2").is_none());
    }

    #[test]
    fn removed_parameter_comes_back_while_editing() {
        let mut ws = Workspace::new();
        let def = define(&mut ws, DEF_NO_RETURN, "f", &["x", "y"]);
        let caller = call(&mut ws, "f", &["x", "y"]);
        let b = ws.create_block("text").unwrap();
        ws.attach(&caller, "ARG1", &b).unwrap();

        open_mutator(&mut ws, &def).unwrap();
        let original = draft_of(&ws, &def);
        let mut narrowed = original.clone();
        narrowed.params.pop();
        ws.mutate(&def, &ShapeDraft::Procedure(narrowed)).unwrap();
        assert!(ws.top_blocks().contains(&b));
        ws.mutate(&def, &ShapeDraft::Procedure(original)).unwrap();
        assert_eq!(ws.block(&caller).unwrap().input_target("ARG1"), Some(&b));
    }

    #[test]
    fn mismatched_ids_are_a_range_error() {
        let mut ws = Workspace::new();
        define(&mut ws, DEF_NO_RETURN, "f", &[]);
        let caller = call(&mut ws, "f", &[]);
        let err = set_procedure_parameters(&mut ws, &caller, &["a".to_string()], &[]).unwrap_err();
        assert_eq!(
            err.downcast_ref::<MutationError>(),
            Some(&MutationError::ParamLengthMismatch { names: 1, ids: 0 })
        );
    }

    #[test]
    fn disabling_a_definition_remembers_call_states() {
        let mut ws = Workspace::new();
        let def = define(&mut ws, DEF_NO_RETURN, "f", &[]);
        let active = call(&mut ws, "f", &[]);
        let dormant = call(&mut ws, "f", &[]);
        ws.set_enabled(&dormant, false).unwrap();

        ws.set_enabled(&def, false).unwrap();
        assert!(!ws.block(&active).unwrap().enabled);
        assert!(!ws.block(&dormant).unwrap().enabled);

        ws.set_enabled(&def, true).unwrap();
        assert!(ws.block(&active).unwrap().enabled);
        assert!(!ws.block(&dormant).unwrap().enabled);
    }

    #[test]
    fn orphan_call_gets_a_definition_in_its_group() {
        let mut ws = Workspace::new();
        let caller = call(&mut ws, "draw", &["size"]);
        let def = get_definition(&ws, "draw").unwrap();
        let sig = signature(&ws, &def).unwrap();
        assert_eq!(sig.params, vec!["size"]);
        assert!(!sig.has_return);
        let log = ws.events.undo_log();
        let creates = log
            .iter()
            .filter(|e| e.data.kind() == EventKind::BlockCreate)
            .collect::<Vec<_>>();
        assert_eq!(creates.len(), 2);
        assert_eq!(creates[0].group, creates[1].group);
        assert_eq!(
            ws.block(&caller).unwrap().procedure_call().unwrap().quark_ids,
            ws.block(&def).unwrap().procedure_def().unwrap().params.iter().map(|p| p.id.clone()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn call_with_clashing_signature_gets_its_own_definition() {
        let mut ws = Workspace::new();
        define(&mut ws, DEF_RETURN, "f", &[]);
        let caller = call(&mut ws, "f", &[]);
        assert_eq!(ws.block(&caller).unwrap().field_value("NAME"), Some("f2"));
        let def = get_definition(&ws, "f2").unwrap();
        assert_eq!(ws.block(&def).unwrap().block_type, DEF_NO_RETURN);
    }

    #[test]
    fn hiding_the_body_stashes_it() {
        let mut ws = Workspace::new();
        let def = define(&mut ws, DEF_RETURN, "f", &[]);
        let body = ws.create_block("text_print").unwrap();
        ws.attach(&def, "STACK", &body).unwrap();
        let mut draft = draft_of(&ws, &def);
        draft.has_statements = Some(false);
        ws.mutate(&def, &ShapeDraft::Procedure(draft.clone())).unwrap();
        assert!(ws.block(&def).unwrap().input("STACK").is_none());
        draft.has_statements = Some(true);
        ws.mutate(&def, &ShapeDraft::Procedure(draft)).unwrap();
        let names = ws.block(&def).unwrap().inputs.iter().map(|i| i.name.clone()).collect::<Vec<_>>();
        assert_eq!(names, vec!["TOP", "STACK", "RETURN"]);
        assert_eq!(ws.block(&def).unwrap().input_target("STACK"), Some(&body));
    }

    #[test]
    fn if_return_follows_its_definition() {
        let mut ws = Workspace::new();
        let def = define(&mut ws, DEF_NO_RETURN, "f", &[]);
        let guard = ws.create_block(IF_RETURN).unwrap();
        assert!(!ws.block(&guard).unwrap().enabled);
        assert!(ws.block(&guard).unwrap().warning.is_some());

        ws.attach(&def, "STACK", &guard).unwrap();
        let block = ws.block(&guard).unwrap();
        assert!(block.enabled);
        assert!(block.warning.is_none());
        assert!(matches!(
            block.extra,
            crate::block::ExtraState::IfReturn { has_return_value: false }
        ));
    }

    #[test]
    fn loaded_calls_without_a_definition_get_one() {
        let mut ws = Workspace::new();
        let doc = r#"<xml>
            <block type="procedures_callnoreturn" id="call"><mutation name="foo"/></block>
            <block type="text" id="t"/>
        </xml>"#;
        crate::xml::workspace_from_xml(&mut ws, doc).unwrap();
        let def_id = get_definition(&ws, "foo").unwrap();
        assert_eq!(ws.block(&def_id).unwrap().block_type, DEF_NO_RETURN);
        assert!(ws.events.undo_log().is_empty());

        ws.dispose("t", false).unwrap();
        assert!(ws.block("call").is_some());
        assert_eq!(get_callers(&ws, "foo"), vec!["call".to_string()]);
    }

    #[test]
    fn loaded_definitions_later_in_the_document_are_used() {
        let mut ws = Workspace::new();
        let doc = r#"<xml>
            <block type="procedures_callnoreturn" id="call"><mutation name="foo"/></block>
            <block type="procedures_defnoreturn" id="def"><field name="NAME">foo</field></block>
        </xml>"#;
        crate::xml::workspace_from_xml(&mut ws, doc).unwrap();
        assert_eq!(ws.top_blocks().len(), 2);
        assert_eq!(get_definition(&ws, "foo"), Some("def".to_string()));
    }

    #[test]
    fn json_loaded_orphan_is_cleaned_up_with_its_definition() {
        let mut ws = Workspace::new();
        let doc = json!({
            "blocks": {
                "languageVersion": 0,
                "blocks": [
                    {"type": "procedures_callnoreturn", "id": "call", "extraState": {"name": "bar", "params": ["x"]}}
                ]
            }
        });
        state::workspace_from_json(&mut ws, &doc.to_string()).unwrap();
        let def_id = get_definition(&ws, "bar").unwrap();
        assert_eq!(signature(&ws, &def_id).unwrap().params, vec!["x"]);

        ws.dispose(&def_id, false).unwrap();
        assert!(ws.block("call").is_none());
        assert!(ws.top_blocks().is_empty());
    }
}
