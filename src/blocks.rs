use crate::block::{Block, ExtraState, FieldValue, ProcedureCallState, ProcedureDefState};
use crate::mutator::{
    IfElseMutator, IfReturnMutator, ItemsMutator, Mutator, ProcedureCallMutator, ProcedureDefMutator,
};
use crate::procedures;
use crate::types::{TypeCheck, ValueType};
use crate::workspace::Workspace;
use anyhow::Result;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};

pub type InitFn = fn(&mut Block);
pub type AfterInitFn = fn(&mut Workspace, &str) -> Result<()>;

pub const DEFAULT_VARIABLE_NAME: &str = "item";

/// How to build one block type: its static shape plus optional behaviour
/// that needs the workspace.
#[derive(Clone, Copy)]
pub struct BlockDefinition {
    pub block_type: &'static str,
    pub init: InitFn,
    pub after_init: Option<AfterInitFn>,
    pub mutator: Option<&'static dyn Mutator>,
}

impl BlockDefinition {
    pub fn new(block_type: &'static str, init: InitFn) -> Self {
        Self {
            block_type,
            init,
            after_init: None,
            mutator: None,
        }
    }

    pub fn with_after_init(mut self, hook: AfterInitFn) -> Self {
        self.after_init = Some(hook);
        self
    }

    pub fn with_mutator(mut self, mutator: &'static dyn Mutator) -> Self {
        self.mutator = Some(mutator);
        self
    }
}

impl Debug for BlockDefinition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockDefinition")
            .field("block_type", &self.block_type)
            .field("mutator", &self.mutator.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct BlockRegistry {
    definitions: HashMap<String, BlockDefinition>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn standard() -> Self {
        let mut registry = Self::new();
        for definition in standard_definitions() {
            registry.register(definition);
        }
        registry
    }

    pub fn register(&mut self, definition: BlockDefinition) {
        self.definitions
            .insert(definition.block_type.to_string(), definition);
    }

    pub fn get(&self, block_type: &str) -> Option<&BlockDefinition> {
        self.definitions.get(block_type)
    }

    pub fn contains(&self, block_type: &str) -> bool {
        self.definitions.contains_key(block_type)
    }

    pub fn types(&self) -> Vec<&str> {
        let mut types = self.definitions.keys().map(String::as_str).collect::<Vec<_>>();
        types.sort_unstable();
        types
    }

    /// A detached instance of the type, for inspecting its shape.
    pub fn prototype(&self, block_type: &str) -> Option<Block> {
        let definition = self.get(block_type)?;
        let mut block = Block::new("", block_type);
        (definition.init)(&mut block);
        Some(block)
    }
}

fn standard_definitions() -> Vec<BlockDefinition> {
    vec![
        BlockDefinition::new("controls_if", init_controls_if).with_mutator(&IfElseMutator),
        BlockDefinition::new("logic_compare", init_logic_compare),
        BlockDefinition::new("logic_operation", init_logic_operation),
        BlockDefinition::new("logic_negate", init_logic_negate),
        BlockDefinition::new("logic_boolean", init_logic_boolean),
        BlockDefinition::new("logic_null", init_logic_null),
        BlockDefinition::new("logic_ternary", init_logic_ternary),
        BlockDefinition::new("controls_repeat_ext", init_controls_repeat_ext),
        BlockDefinition::new("controls_whileUntil", init_controls_while_until),
        BlockDefinition::new("controls_forEach", init_controls_for_each)
            .with_after_init(assign_default_variables),
        BlockDefinition::new("controls_flow_statements", init_controls_flow_statements),
        BlockDefinition::new("math_number", init_math_number),
        BlockDefinition::new("math_arithmetic", init_math_arithmetic),
        BlockDefinition::new("math_single", init_math_single),
        BlockDefinition::new("math_constant", init_math_constant),
        BlockDefinition::new("math_modulo", init_math_modulo),
        BlockDefinition::new("math_change", init_math_change).with_after_init(assign_default_variables),
        BlockDefinition::new("text", init_text),
        BlockDefinition::new("text_join", init_text_join).with_mutator(&ItemsMutator),
        BlockDefinition::new("text_print", init_text_print),
        BlockDefinition::new("text_length", init_text_length),
        BlockDefinition::new("variables_get", init_variables_get).with_after_init(assign_default_variables),
        BlockDefinition::new("variables_set", init_variables_set).with_after_init(assign_default_variables),
        BlockDefinition::new("lists_create_empty", init_lists_create_empty),
        BlockDefinition::new("lists_create_with", init_lists_create_with).with_mutator(&ItemsMutator),
        BlockDefinition::new("lists_length", init_lists_length),
        BlockDefinition::new("lists_getIndex", init_lists_get_index),
        BlockDefinition::new("procedures_defnoreturn", init_procedures_defnoreturn)
            .with_after_init(procedures::legalize_definition_name)
            .with_mutator(&ProcedureDefMutator),
        BlockDefinition::new("procedures_defreturn", init_procedures_defreturn)
            .with_after_init(procedures::legalize_definition_name)
            .with_mutator(&ProcedureDefMutator),
        BlockDefinition::new("procedures_callnoreturn", init_procedures_callnoreturn)
            .with_mutator(&ProcedureCallMutator),
        BlockDefinition::new("procedures_callreturn", init_procedures_callreturn)
            .with_mutator(&ProcedureCallMutator),
        BlockDefinition::new("procedures_ifreturn", init_procedures_ifreturn).with_mutator(&IfReturnMutator),
    ]
}

/// Points unset variable fields at the default variable.
fn assign_default_variables(ws: &mut Workspace, id: &str) -> Result<()> {
    let unset = ws
        .get_block(id)?
        .fields
        .iter()
        .filter(|f| f.value == FieldValue::Variable(String::new()))
        .map(|f| f.name.clone())
        .collect::<Vec<_>>();
    if unset.is_empty() {
        return Ok(());
    }
    let variable = ws.get_or_create_variable(None, DEFAULT_VARIABLE_NAME, "")?;
    let block = ws.get_block_mut(id)?;
    for name in unset {
        if let Some(field) = block.field_mut(&name) {
            field.value = FieldValue::Variable(variable.id.clone());
        }
    }
    Ok(())
}

fn number() -> TypeCheck {
    TypeCheck::one(ValueType::Number)
}

fn boolean() -> TypeCheck {
    TypeCheck::one(ValueType::Boolean)
}

fn statement(block: &mut Block) {
    block.set_previous(TypeCheck::Any);
    block.set_next(TypeCheck::Any);
}

fn init_controls_if(block: &mut Block) {
    block.append_value_input("IF0", boolean());
    block.append_statement_input("DO0");
    statement(block);
    block.extra = ExtraState::IfElse {
        elseif_count: 0,
        has_else: false,
    };
}

fn init_logic_compare(block: &mut Block) {
    block.add_text_field("OP", "EQ");
    block.append_value_input("A", TypeCheck::Any);
    block.append_value_input("B", TypeCheck::Any);
    block.set_output(boolean());
    block.inline = Some(true);
}

fn init_logic_operation(block: &mut Block) {
    block.add_text_field("OP", "AND");
    block.append_value_input("A", boolean());
    block.append_value_input("B", boolean());
    block.set_output(boolean());
    block.inline = Some(true);
}

fn init_logic_negate(block: &mut Block) {
    block.append_value_input("BOOL", boolean());
    block.set_output(boolean());
}

fn init_logic_boolean(block: &mut Block) {
    block.add_text_field("BOOL", "TRUE");
    block.set_output(boolean());
}

fn init_logic_null(block: &mut Block) {
    block.set_output(TypeCheck::Any);
}

fn init_logic_ternary(block: &mut Block) {
    block.append_value_input("IF", boolean());
    block.append_value_input("THEN", TypeCheck::Any);
    block.append_value_input("ELSE", TypeCheck::Any);
    block.set_output(TypeCheck::Any);
}

fn init_controls_repeat_ext(block: &mut Block) {
    block.append_value_input("TIMES", number());
    block.append_statement_input("DO");
    statement(block);
}

fn init_controls_while_until(block: &mut Block) {
    block.add_text_field("MODE", "WHILE");
    block.append_value_input("BOOL", boolean());
    block.append_statement_input("DO");
    statement(block);
}

fn init_controls_for_each(block: &mut Block) {
    block.add_variable_field("VAR", "");
    block.append_value_input("LIST", TypeCheck::one(ValueType::Array));
    block.append_statement_input("DO");
    statement(block);
}

fn init_controls_flow_statements(block: &mut Block) {
    block.add_text_field("FLOW", "BREAK");
    block.set_previous(TypeCheck::Any);
}

fn init_math_number(block: &mut Block) {
    block.add_text_field("NUM", "0");
    block.set_output(number());
}

fn init_math_arithmetic(block: &mut Block) {
    block.add_text_field("OP", "ADD");
    block.append_value_input("A", number());
    block.append_value_input("B", number());
    block.set_output(number());
    block.inline = Some(true);
}

fn init_math_single(block: &mut Block) {
    block.add_text_field("OP", "ROOT");
    block.append_value_input("NUM", number());
    block.set_output(number());
}

fn init_math_constant(block: &mut Block) {
    block.add_text_field("CONSTANT", "PI");
    block.set_output(number());
}

fn init_math_modulo(block: &mut Block) {
    block.append_value_input("DIVIDEND", number());
    block.append_value_input("DIVISOR", number());
    block.set_output(number());
    block.inline = Some(true);
}

fn init_math_change(block: &mut Block) {
    block.add_variable_field("VAR", "");
    block.append_value_input("DELTA", number());
    statement(block);
}

fn init_text(block: &mut Block) {
    block.add_text_field("TEXT", "");
    block.set_output(TypeCheck::one(ValueType::String));
}

fn init_text_join(block: &mut Block) {
    block.set_output(TypeCheck::one(ValueType::String));
    block.extra = ExtraState::Items(2);
    ItemsMutator::apply_count(block, 2);
}

fn init_text_print(block: &mut Block) {
    block.append_value_input("TEXT", TypeCheck::Any);
    statement(block);
}

fn init_text_length(block: &mut Block) {
    block.append_value_input("VALUE", TypeCheck::of(&[ValueType::String, ValueType::Array]));
    block.set_output(number());
}

fn init_variables_get(block: &mut Block) {
    block.add_variable_field("VAR", "");
    block.set_output(TypeCheck::Any);
}

fn init_variables_set(block: &mut Block) {
    block.add_variable_field("VAR", "");
    block.append_value_input("VALUE", TypeCheck::Any);
    statement(block);
}

fn init_lists_create_empty(block: &mut Block) {
    block.set_output(TypeCheck::one(ValueType::Array));
}

fn init_lists_create_with(block: &mut Block) {
    block.set_output(TypeCheck::one(ValueType::Array));
    block.extra = ExtraState::Items(3);
    ItemsMutator::apply_count(block, 3);
}

fn init_lists_length(block: &mut Block) {
    block.append_value_input("VALUE", TypeCheck::of(&[ValueType::String, ValueType::Array]));
    block.set_output(number());
}

fn init_lists_get_index(block: &mut Block) {
    block.add_text_field("MODE", "GET");
    block.add_text_field("WHERE", "FROM_START");
    block.append_value_input("VALUE", TypeCheck::one(ValueType::Array));
    block.append_value_input("AT", number());
    block.set_output(TypeCheck::Any);
    block.inline = Some(true);
}

fn init_procedure_def(block: &mut Block) {
    block.add_text_field("NAME", "");
    block.add_label_field("PARAMS", "");
    block.append_dummy_input("TOP");
    block.append_statement_input("STACK");
    block.extra = ExtraState::ProcedureDef(ProcedureDefState {
        has_statements: true,
        ..ProcedureDefState::default()
    });
}

fn init_procedures_defnoreturn(block: &mut Block) {
    init_procedure_def(block);
}

fn init_procedures_defreturn(block: &mut Block) {
    init_procedure_def(block);
    block.append_value_input("RETURN", TypeCheck::Any);
}

fn init_procedure_call(block: &mut Block) {
    block.add_label_field("NAME", "");
    block.append_dummy_input("TOPROW");
    block.extra = ExtraState::ProcedureCall(ProcedureCallState::default());
}

fn init_procedures_callnoreturn(block: &mut Block) {
    init_procedure_call(block);
    statement(block);
}

fn init_procedures_callreturn(block: &mut Block) {
    init_procedure_call(block);
    block.set_output(TypeCheck::Any);
}

fn init_procedures_ifreturn(block: &mut Block) {
    block.append_value_input("CONDITION", boolean());
    block.append_value_input("VALUE", TypeCheck::Any);
    statement(block);
    block.inline = Some(true);
    block.extra = ExtraState::IfReturn {
        has_return_value: true,
    };
}
