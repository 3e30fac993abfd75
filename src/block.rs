use crate::connection::{Connection, ConnectionKind, Slot};
use crate::types::TypeCheck;
use std::collections::HashMap;

pub type BlockId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Value,
    Statement,
    Dummy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Input {
    pub name: String,
    pub kind: InputKind,
    pub connection: Option<Connection>,
    /// Display-only text in front of the socket (e.g. a call's argument name).
    pub label: Option<String>,
}

impl Input {
    pub fn target_block(&self) -> Option<&BlockId> {
        self.connection.as_ref().and_then(Connection::target_block)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    /// Variable field; holds the variable id.
    Variable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub value: FieldValue,
    /// Labels are derived from other state and are not written out.
    pub serializable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamModel {
    /// Stable identity of the parameter across renames and reorders.
    pub id: String,
    pub name: String,
    pub var_id: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProcedureDefState {
    pub params: Vec<ParamModel>,
    pub has_statements: bool,
    pub mutator_open: bool,
    /// Statement stack detached while the STACK input is hidden.
    pub stashed_statement: Option<BlockId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcedureCallState {
    pub arguments: Vec<String>,
    /// Parameter ids aligned with `arguments`; empty strings until linked.
    pub quark_ids: Vec<String>,
    /// Parameter id to the block that was plugged into its socket.
    pub quark_connections: HashMap<String, BlockId>,
    pub previous_enabled: bool,
}

impl Default for ProcedureCallState {
    fn default() -> Self {
        Self {
            arguments: Vec::new(),
            quark_ids: Vec::new(),
            quark_connections: HashMap::new(),
            previous_enabled: true,
        }
    }
}

/// Per-type shape state kept by mutable blocks.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ExtraState {
    #[default]
    None,
    IfElse {
        elseif_count: usize,
        has_else: bool,
    },
    Items(usize),
    ProcedureDef(ProcedureDefState),
    ProcedureCall(ProcedureCallState),
    IfReturn {
        has_return_value: bool,
    },
    /// Mutation of an unknown block type, kept verbatim for round-trips.
    Opaque(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub id: BlockId,
    pub block_type: String,
    pub inputs: Vec<Input>,
    pub fields: Vec<Field>,
    pub output: Option<Connection>,
    pub previous: Option<Connection>,
    pub next: Option<Connection>,
    pub parent: Option<BlockId>,
    pub shadow: bool,
    pub enabled: bool,
    pub collapsed: bool,
    pub inline: Option<bool>,
    pub comment: Option<String>,
    pub warning: Option<String>,
    pub x: f64,
    pub y: f64,
    pub extra: ExtraState,
    /// Shape was inferred from serialized data because the type is unknown.
    pub improvised: bool,
}

impl Block {
    pub fn new(id: &str, block_type: &str) -> Self {
        Self {
            id: id.to_string(),
            block_type: block_type.to_string(),
            inputs: Vec::new(),
            fields: Vec::new(),
            output: None,
            previous: None,
            next: None,
            parent: None,
            shadow: false,
            enabled: true,
            collapsed: false,
            inline: None,
            comment: None,
            warning: None,
            x: 0.0,
            y: 0.0,
            extra: ExtraState::None,
            improvised: false,
        }
    }

    pub fn set_output(&mut self, check: TypeCheck) -> &mut Self {
        self.output = Some(Connection::with_check(ConnectionKind::OutputValue, check));
        self
    }

    pub fn set_previous(&mut self, check: TypeCheck) -> &mut Self {
        self.previous = Some(Connection::with_check(
            ConnectionKind::PreviousStatement,
            check,
        ));
        self
    }

    pub fn set_next(&mut self, check: TypeCheck) -> &mut Self {
        self.next = Some(Connection::with_check(ConnectionKind::NextStatement, check));
        self
    }

    pub fn append_value_input(&mut self, name: &str, check: TypeCheck) -> &mut Input {
        self.push_input(Input {
            name: name.to_string(),
            kind: InputKind::Value,
            connection: Some(Connection::with_check(ConnectionKind::InputValue, check)),
            label: None,
        })
    }

    pub fn append_statement_input(&mut self, name: &str) -> &mut Input {
        self.push_input(Input {
            name: name.to_string(),
            kind: InputKind::Statement,
            connection: Some(Connection::new(ConnectionKind::NextStatement)),
            label: None,
        })
    }

    pub fn append_dummy_input(&mut self, name: &str) -> &mut Input {
        self.push_input(Input {
            name: name.to_string(),
            kind: InputKind::Dummy,
            connection: None,
            label: None,
        })
    }

    fn push_input(&mut self, input: Input) -> &mut Input {
        self.inputs.push(input);
        let last = self.inputs.len() - 1;
        &mut self.inputs[last]
    }

    /// Moves `name` in front of `before` (or to the end when `before` is None).
    pub fn move_input_before(&mut self, name: &str, before: Option<&str>) {
        let Some(from) = self.input_index(name) else {
            return;
        };
        let input = self.inputs.remove(from);
        let to = before
            .and_then(|b| self.input_index(b))
            .unwrap_or(self.inputs.len());
        self.inputs.insert(to, input);
    }

    pub fn add_text_field(&mut self, name: &str, value: &str) -> &mut Self {
        self.fields.push(Field {
            name: name.to_string(),
            value: FieldValue::Text(value.to_string()),
            serializable: true,
        });
        self
    }

    pub fn add_label_field(&mut self, name: &str, value: &str) -> &mut Self {
        self.fields.push(Field {
            name: name.to_string(),
            value: FieldValue::Text(value.to_string()),
            serializable: false,
        });
        self
    }

    pub fn add_variable_field(&mut self, name: &str, var_id: &str) -> &mut Self {
        self.fields.push(Field {
            name: name.to_string(),
            value: FieldValue::Variable(var_id.to_string()),
            serializable: true,
        });
        self
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut Field> {
        self.fields.iter_mut().find(|f| f.name == name)
    }

    /// Text of a text field, or the variable id of a variable field.
    pub fn field_value(&self, name: &str) -> Option<&str> {
        self.field(name).map(|f| match &f.value {
            FieldValue::Text(text) => text.as_str(),
            FieldValue::Variable(id) => id.as_str(),
        })
    }

    pub fn input(&self, name: &str) -> Option<&Input> {
        self.inputs.iter().find(|i| i.name == name)
    }

    pub fn input_mut(&mut self, name: &str) -> Option<&mut Input> {
        self.inputs.iter_mut().find(|i| i.name == name)
    }

    pub fn input_index(&self, name: &str) -> Option<usize> {
        self.inputs.iter().position(|i| i.name == name)
    }

    pub fn input_target(&self, name: &str) -> Option<&BlockId> {
        self.input(name).and_then(Input::target_block)
    }

    pub fn next_block(&self) -> Option<&BlockId> {
        self.next.as_ref().and_then(Connection::target_block)
    }

    pub fn connection(&self, slot: &Slot) -> Option<&Connection> {
        match slot {
            Slot::Output => self.output.as_ref(),
            Slot::Previous => self.previous.as_ref(),
            Slot::Next => self.next.as_ref(),
            Slot::Input(name) => self.input(name).and_then(|i| i.connection.as_ref()),
        }
    }

    pub fn connection_mut(&mut self, slot: &Slot) -> Option<&mut Connection> {
        match slot {
            Slot::Output => self.output.as_mut(),
            Slot::Previous => self.previous.as_mut(),
            Slot::Next => self.next.as_mut(),
            Slot::Input(name) => self.input_mut(name).and_then(|i| i.connection.as_mut()),
        }
    }

    /// Every slot on this block that carries a connection.
    pub fn slots(&self) -> Vec<Slot> {
        let mut slots = Vec::new();
        if self.output.is_some() {
            slots.push(Slot::Output);
        }
        if self.previous.is_some() {
            slots.push(Slot::Previous);
        }
        for input in &self.inputs {
            if input.connection.is_some() {
                slots.push(Slot::Input(input.name.clone()));
            }
        }
        if self.next.is_some() {
            slots.push(Slot::Next);
        }
        slots
    }

    /// Blocks directly attached below this one, inputs first, then next.
    pub fn children(&self) -> Vec<BlockId> {
        let mut out = Vec::new();
        for input in &self.inputs {
            if let Some(target) = input.target_block() {
                out.push(target.clone());
            }
        }
        if let Some(next) = self.next_block() {
            out.push(next.clone());
        }
        out
    }

    pub fn procedure_def(&self) -> Option<&ProcedureDefState> {
        match &self.extra {
            ExtraState::ProcedureDef(state) => Some(state),
            _ => None,
        }
    }

    pub fn procedure_def_mut(&mut self) -> Option<&mut ProcedureDefState> {
        match &mut self.extra {
            ExtraState::ProcedureDef(state) => Some(state),
            _ => None,
        }
    }

    pub fn procedure_call(&self) -> Option<&ProcedureCallState> {
        match &self.extra {
            ExtraState::ProcedureCall(state) => Some(state),
            _ => None,
        }
    }

    pub fn procedure_call_mut(&mut self) -> Option<&mut ProcedureCallState> {
        match &mut self.extra {
            ExtraState::ProcedureCall(state) => Some(state),
            _ => None,
        }
    }

    pub fn describe(&self) -> String {
        format!("{} block '{}'", self.block_type, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ValueType;

    #[test]
    fn inputs_keep_declaration_order_and_can_be_moved() {
        let mut block = Block::new("b1", "procedures_defreturn");
        block.append_dummy_input("TOP");
        block.append_value_input("RETURN", TypeCheck::Any);
        block.append_statement_input("STACK");
        block.move_input_before("STACK", Some("RETURN"));
        let names = block.inputs.iter().map(|i| i.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["TOP", "STACK", "RETURN"]);
    }

    #[test]
    fn slots_list_every_connection() {
        let mut block = Block::new("b1", "math_arithmetic");
        block.set_output(TypeCheck::one(ValueType::Number));
        block.append_value_input("A", TypeCheck::one(ValueType::Number));
        block.append_dummy_input("LABEL");
        block.append_value_input("B", TypeCheck::one(ValueType::Number));
        assert_eq!(
            block.slots(),
            vec![
                Slot::Output,
                Slot::Input("A".to_string()),
                Slot::Input("B".to_string())
            ]
        );
    }

    #[test]
    fn field_value_reads_text_and_variable_ids() {
        let mut block = Block::new("b1", "variables_set");
        block.add_variable_field("VAR", "v1");
        block.add_text_field("NOTE", "hello");
        assert_eq!(block.field_value("VAR"), Some("v1"));
        assert_eq!(block.field_value("NOTE"), Some("hello"));
        assert_eq!(block.field_value("MISSING"), None);
    }
}
