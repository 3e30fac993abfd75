use crate::block::InputKind;
use crate::blocks::BlockRegistry;
use crate::state::{self, BlockState, CommentState, ConnectionState, IconsState, VariableState, WorkspaceState};
use crate::workspace::Workspace;
use anyhow::Result;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io::Cursor;
use xmltree::{Element, EmitterConfig, Namespace, XMLNode};

pub const XML_NAMESPACE: &str = "https://developers.google.com/blockly/xml";

/// Structural problems in a workspace document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlError {
    Parse(String),
    WrongRoot(String),
    MissingType,
    TopLevelShadow,
    MissingName(String),
}

impl Display for XmlError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            XmlError::Parse(msg) => write!(f, "Invalid XML: {}.", msg),
            XmlError::WrongRoot(name) => write!(f, "Expected an <xml> root element, found <{}>.", name),
            XmlError::MissingType => write!(f, "Block type unspecified."),
            XmlError::TopLevelShadow => write!(f, "Shadow block cannot be a top-level block."),
            XmlError::MissingName(tag) => write!(f, "<{}> element is missing its name attribute.", tag),
        }
    }
}

impl Error for XmlError {}

pub fn parse_element(text: &str) -> Result<Element> {
    Ok(Element::parse(Cursor::new(text.as_bytes())).map_err(|e| XmlError::Parse(e.to_string()))?)
}

pub fn element_to_text(element: &Element, pretty: bool) -> Result<String> {
    let config = EmitterConfig::new()
        .perform_indent(pretty)
        .write_document_declaration(false);
    let mut out = Vec::new();
    element.write_with_config(&mut out, config)?;
    Ok(String::from_utf8(out)?)
}

fn text_of(element: &Element) -> String {
    element.get_text().map(|t| t.into_owned()).unwrap_or_default()
}

fn with_text(mut element: Element, text: &str) -> Element {
    if !text.is_empty() {
        element.children.push(XMLNode::Text(text.to_string()));
    }
    element
}

fn format_coordinate(value: f64) -> String {
    let rounded = value.round();
    if rounded == 0.0 {
        "0".to_string()
    } else {
        rounded.to_string()
    }
}

/// The whole workspace as an `<xml>` document: variables first, then every
/// top-level stack.
pub fn workspace_to_element(ws: &Workspace) -> Result<Element> {
    let mut root = Element::new("xml");
    root.namespace = Some(XML_NAMESPACE.to_string());
    let mut namespaces = Namespace::empty();
    namespaces.put("", XML_NAMESPACE);
    root.namespaces = Some(namespaces);

    if !ws.variables.all().is_empty() {
        let mut variables = Element::new("variables");
        for model in ws.variables.all() {
            let mut variable = Element::new("variable");
            variable.attributes.insert("id".to_string(), model.id.clone());
            if !model.var_type.is_empty() {
                variable.attributes.insert("type".to_string(), model.var_type.clone());
            }
            variables.children.push(XMLNode::Element(with_text(variable, &model.name)));
        }
        root.children.push(XMLNode::Element(variables));
    }
    for id in ws.top_blocks() {
        root.children.push(XMLNode::Element(block_to_element(ws, id)?));
    }
    Ok(root)
}

/// A block and everything attached below it.
pub fn block_to_element(ws: &Workspace, id: &str) -> Result<Element> {
    let state = state::save(ws, id)?;
    let shadow = ws.get_block(id)?.shadow;
    state_to_element(ws, &state, shadow)
}

pub fn state_to_element(ws: &Workspace, state: &BlockState, shadow: bool) -> Result<Element> {
    let mut element = Element::new(if shadow { "shadow" } else { "block" });
    let attrs = &mut element.attributes;
    attrs.insert("type".to_string(), state.block_type.clone());
    if let Some(id) = &state.id {
        attrs.insert("id".to_string(), id.clone());
    }
    if let (Some(x), Some(y)) = (state.x, state.y) {
        attrs.insert("x".to_string(), format_coordinate(x));
        attrs.insert("y".to_string(), format_coordinate(y));
    }
    if !state.enabled {
        attrs.insert("disabled".to_string(), "true".to_string());
    }
    if state.collapsed {
        attrs.insert("collapsed".to_string(), "true".to_string());
    }
    if let Some(inline) = state.inline {
        attrs.insert("inline".to_string(), inline.to_string());
    }

    if let Some(extra) = &state.extra_state {
        element.children.push(XMLNode::Element(mutation_to_element(ws, &state.block_type, extra)?));
    }
    if let Some(text) = state.comment_text() {
        let comment = with_text(Element::new("comment"), text);
        element.children.push(XMLNode::Element(comment));
    }
    for (name, value) in &state.fields {
        element.children.push(XMLNode::Element(field_to_element(name, value)));
    }
    for (name, connection) in ordered_inputs(ws, state) {
        let tag = match input_kind(ws, state, name) {
            InputKind::Statement => "statement",
            _ => "value",
        };
        let mut input = Element::new(tag);
        input.attributes.insert("name".to_string(), name.clone());
        push_connection(ws, &mut input, connection)?;
        element.children.push(XMLNode::Element(input));
    }
    if let Some(next) = &state.next {
        let mut wrapper = Element::new("next");
        push_connection(ws, &mut wrapper, next)?;
        element.children.push(XMLNode::Element(wrapper));
    }
    Ok(element)
}

fn push_connection(ws: &Workspace, parent: &mut Element, connection: &ConnectionState) -> Result<()> {
    if let Some(shadow) = &connection.shadow {
        parent.children.push(XMLNode::Element(state_to_element(ws, shadow, true)?));
    }
    if let Some(block) = &connection.block {
        parent.children.push(XMLNode::Element(state_to_element(ws, block, false)?));
    }
    Ok(())
}

fn field_to_element(name: &str, value: &Value) -> Element {
    let mut field = Element::new("field");
    field.attributes.insert("name".to_string(), name.to_string());
    match value {
        Value::Object(variable) => {
            if let Some(id) = variable.get("id").and_then(Value::as_str) {
                field.attributes.insert("id".to_string(), id.to_string());
            }
            let var_type = variable.get("type").and_then(Value::as_str).unwrap_or_default();
            if !var_type.is_empty() {
                field.attributes.insert("variabletype".to_string(), var_type.to_string());
            }
            let name = variable.get("name").and_then(Value::as_str).unwrap_or_default();
            with_text(field, name)
        }
        other => with_text(field, &state::value_to_text(other)),
    }
}

/// Live blocks know their current shape; shadow specs fall back to the
/// registered prototype.
/// Serialized inputs in the block's own input order. Names the block does
/// not know follow in map order.
fn ordered_inputs<'a>(ws: &Workspace, state: &'a BlockState) -> Vec<(&'a String, &'a ConnectionState)> {
    let live = state
        .id
        .as_deref()
        .and_then(|id| ws.block(id))
        .filter(|b| b.block_type == state.block_type)
        .map(|b| b.inputs.iter().map(|i| i.name.clone()).collect::<Vec<_>>());
    let order = live
        .or_else(|| {
            ws.registry
                .prototype(&state.block_type)
                .map(|proto| proto.inputs.into_iter().map(|i| i.name).collect())
        })
        .unwrap_or_default();
    let mut inputs = state.inputs.iter().collect::<Vec<_>>();
    inputs.sort_by_key(|(name, _)| order.iter().position(|n| n == *name).unwrap_or(order.len()));
    inputs
}

fn input_kind(ws: &Workspace, state: &BlockState, name: &str) -> InputKind {
    let live = state
        .id
        .as_deref()
        .and_then(|id| ws.block(id))
        .filter(|b| b.block_type == state.block_type)
        .and_then(|b| b.input(name).map(|i| i.kind));
    live.or_else(|| {
        ws.registry
            .prototype(&state.block_type)
            .and_then(|proto| proto.input(name).map(|i| i.kind))
    })
    .unwrap_or(InputKind::Value)
}

fn mutation_to_element(ws: &Workspace, block_type: &str, extra: &Value) -> Result<Element> {
    if let Some(mutator) = ws.registry.get(block_type).and_then(|def| def.mutator) {
        return Ok(mutator.mutation_to_xml(extra));
    }
    // Unknown types keep whatever mutation they were loaded with.
    if let Some(text) = extra.as_str().filter(|t| t.trim_start().starts_with("<mutation")) {
        return parse_element(text);
    }
    Ok(with_text(Element::new("mutation"), &extra.to_string()))
}

fn mutation_to_extra_state(registry: &BlockRegistry, block_type: &str, mutation: &Element) -> Result<Value> {
    if let Some(mutator) = registry.get(block_type).and_then(|def| def.mutator) {
        return Ok(mutator.xml_to_extra_state(mutation));
    }
    let has_children = mutation.children.iter().any(|c| c.as_element().is_some());
    if mutation.attributes.is_empty() && !has_children {
        if let Ok(value) = serde_json::from_str::<Value>(&text_of(mutation)) {
            return Ok(value);
        }
    }
    Ok(Value::String(element_to_text(mutation, false)?))
}

/// Reads a `<block>` or `<shadow>` element into its JSON-shaped state.
pub fn element_to_state(registry: &BlockRegistry, element: &Element) -> Result<BlockState> {
    let attr = |name: &str| element.attributes.get(name).cloned();
    let block_type = attr("type").ok_or(XmlError::MissingType)?;
    let mut state = BlockState::new(&block_type);
    state.id = attr("id");
    state.x = attr("x").and_then(|v| v.parse().ok());
    state.y = attr("y").and_then(|v| v.parse().ok());
    state.enabled = attr("disabled").map_or(true, |v| v != "true")
        && attr("enabled").map_or(true, |v| v != "false");
    state.collapsed = attr("collapsed").is_some_and(|v| v == "true");
    state.inline = attr("inline").map(|v| v == "true");

    for child in element.children.iter().filter_map(XMLNode::as_element) {
        let name = || {
            child
                .attributes
                .get("name")
                .cloned()
                .ok_or_else(|| XmlError::MissingName(child.name.clone()))
        };
        match child.name.as_str() {
            "mutation" => {
                state.extra_state = Some(mutation_to_extra_state(registry, &block_type, child)?);
            }
            "comment" => {
                state.icons = Some(IconsState {
                    comment: Some(CommentState { text: text_of(child) }),
                });
            }
            "field" => {
                let value = match child.attributes.get("id") {
                    Some(id) => json!({
                        "id": id,
                        "name": text_of(child),
                        "type": child.attributes.get("variabletype").cloned().unwrap_or_default(),
                    }),
                    None => Value::String(text_of(child)),
                };
                state.fields.insert(name()?, value);
            }
            "value" | "statement" => {
                let connection = element_to_connection(registry, child)?;
                state.inputs.insert(name()?, connection);
            }
            "next" => {
                state.next = Some(Box::new(element_to_connection(registry, child)?));
            }
            other => log::warn!("ignoring unknown <{}> in block '{}'", other, block_type),
        }
    }
    Ok(state)
}

fn element_to_connection(registry: &BlockRegistry, element: &Element) -> Result<ConnectionState> {
    let mut connection = ConnectionState::default();
    for child in element.children.iter().filter_map(XMLNode::as_element) {
        match child.name.as_str() {
            "block" => connection.block = Some(element_to_state(registry, child)?),
            "shadow" => connection.shadow = Some(element_to_state(registry, child)?),
            other => log::warn!("ignoring unknown <{}> in <{}>", other, element.name),
        }
    }
    Ok(connection)
}

/// Reads an `<xml>` document into the state that `state::load_workspace`
/// understands.
pub fn element_to_workspace_state(registry: &BlockRegistry, root: &Element) -> Result<WorkspaceState> {
    if root.name != "xml" {
        return Err(XmlError::WrongRoot(root.name.clone()).into());
    }
    let mut workspace = WorkspaceState::default();
    let mut blocks = Vec::new();
    for child in root.children.iter().filter_map(XMLNode::as_element) {
        match child.name.as_str() {
            "variables" => {
                for variable in child.children.iter().filter_map(XMLNode::as_element) {
                    workspace.variables.push(VariableState {
                        name: text_of(variable),
                        id: variable.attributes.get("id").cloned().unwrap_or_default(),
                        var_type: variable.attributes.get("type").cloned().unwrap_or_default(),
                    });
                }
            }
            "block" => blocks.push(element_to_state(registry, child)?),
            "shadow" => return Err(XmlError::TopLevelShadow.into()),
            other => log::warn!("ignoring unknown top-level <{}>", other),
        }
    }
    if !blocks.is_empty() {
        workspace.blocks = Some(state::BlocksSection {
            language_version: 0,
            blocks,
        });
    }
    Ok(workspace)
}

/// Replaces the workspace contents with the document in `text`.
pub fn workspace_from_xml(ws: &mut Workspace, text: &str) -> Result<()> {
    let root = parse_element(text)?;
    let workspace = element_to_workspace_state(&ws.registry, &root)?;
    log::debug!(
        "loading {} top blocks and {} variables from XML",
        workspace.blocks.as_ref().map_or(0, |b| b.blocks.len()),
        workspace.variables.len()
    );
    state::load_workspace(ws, &workspace)
}

pub fn workspace_to_xml(ws: &Workspace, pretty: bool) -> Result<String> {
    element_to_text(&workspace_to_element(ws)?, pretty)
}

/// Appends a single `<block>` element as a new top-level stack.
pub fn append_block_xml(ws: &mut Workspace, text: &str) -> Result<String> {
    let element = parse_element(text)?;
    let state = element_to_state(&ws.registry, &element)?;
    state::append(ws, &state)
}

/// Field values of a block element keyed by name, for quick inspection.
pub fn fields_of(element: &Element) -> BTreeMap<String, String> {
    element
        .children
        .iter()
        .filter_map(XMLNode::as_element)
        .filter(|c| c.name == "field")
        .filter_map(|c| c.attributes.get("name").map(|n| (n.clone(), text_of(c))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::FieldValue;
    use pretty_assertions::assert_eq;

    const PROGRAM: &str = r#"<xml xmlns="https://developers.google.com/blockly/xml">
  <variables><variable id="v1">count</variable></variables>
  <block type="variables_set" id="set" x="12" y="30">
    <field name="VAR" id="v1">count</field>
    <value name="VALUE">
      <shadow type="math_number" id="shadow1"><field name="NUM">0</field></shadow>
      <block type="math_number" id="num"><field name="NUM">5</field></block>
    </value>
    <next>
      <block type="controls_if" id="if">
        <mutation elseif="1" else="1"></mutation>
        <statement name="DO1">
          <block type="text_print" id="print" disabled="true"><comment>say it</comment></block>
        </statement>
      </block>
    </next>
  </block>
</xml>"#;

    fn loaded() -> Workspace {
        let mut ws = Workspace::new();
        workspace_from_xml(&mut ws, PROGRAM).unwrap();
        ws
    }

    fn child<'e>(element: &'e Element, name: &str) -> &'e Element {
        element.get_child(name).unwrap()
    }

    #[test]
    fn loads_blocks_variables_and_mutations() {
        let ws = loaded();
        assert_eq!(ws.variables.by_id("v1").unwrap().name, "count");
        let set = ws.block("set").unwrap();
        assert_eq!((set.x, set.y), (12.0, 30.0));
        assert_eq!(set.field("VAR").unwrap().value, FieldValue::Variable("v1".to_string()));
        assert_eq!(set.input_target("VALUE").map(String::as_str), Some("num"));
        let branch = ws.block("if").unwrap();
        assert!(branch.input("IF1").is_some());
        assert!(branch.input("ELSE").is_some());
        let print = ws.block("print").unwrap();
        assert!(!print.enabled);
        assert_eq!(print.comment.as_deref(), Some("say it"));
    }

    #[test]
    fn serializes_shadow_and_covering_block() {
        let ws = loaded();
        let root = workspace_to_element(&ws).unwrap();
        assert_eq!(root.name, "xml");
        let set = child(&root, "block");
        assert_eq!(set.attributes.get("x").map(String::as_str), Some("12"));
        let value = child(set, "value");
        let kinds = value
            .children
            .iter()
            .filter_map(XMLNode::as_element)
            .map(|e| e.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(kinds, vec!["shadow", "block"]);
        let field = child(set, "field");
        assert_eq!(field.attributes.get("id").map(String::as_str), Some("v1"));
        assert_eq!(text_of(field), "count");
    }

    #[test]
    fn statement_inputs_keep_their_tag() {
        let ws = loaded();
        let element = block_to_element(&ws, "if").unwrap();
        let statement = child(&element, "statement");
        assert_eq!(statement.attributes.get("name").map(String::as_str), Some("DO1"));
        let mutation = child(&element, "mutation");
        assert_eq!(mutation.attributes.get("elseif").map(String::as_str), Some("1"));
        assert_eq!(mutation.attributes.get("else").map(String::as_str), Some("1"));
    }

    #[test]
    fn text_round_trip_preserves_state() {
        let ws = loaded();
        let text = workspace_to_xml(&ws, true).unwrap();
        let mut again = Workspace::new();
        workspace_from_xml(&mut again, &text).unwrap();
        assert_eq!(
            state::save_workspace(&again).unwrap(),
            state::save_workspace(&ws).unwrap()
        );
    }

    #[test]
    fn structural_errors_are_reported() {
        let mut ws = Workspace::new();
        let err = workspace_from_xml(&mut ws, "<xml><block id=\"a\"/></xml>").unwrap_err();
        assert_eq!(err.downcast_ref::<XmlError>(), Some(&XmlError::MissingType));
        let err = workspace_from_xml(&mut ws, "<root/>").unwrap_err();
        assert_eq!(
            err.downcast_ref::<XmlError>(),
            Some(&XmlError::WrongRoot("root".to_string()))
        );
        let err = workspace_from_xml(&mut ws, "<xml><shadow type=\"text\"/></xml>").unwrap_err();
        assert_eq!(err.downcast_ref::<XmlError>(), Some(&XmlError::TopLevelShadow));
        assert!(workspace_from_xml(&mut ws, "<xml>").is_err());
    }

    #[test]
    fn unknown_mutations_survive_a_round_trip() {
        let mut ws = Workspace::with_options(crate::workspace::WorkspaceOptions {
            lenient_block_types: true,
            ..Default::default()
        });
        workspace_from_xml(
            &mut ws,
            r#"<xml><block type="robot_move" id="r"><mutation speed="3"><wheel side="left"/></mutation></block></xml>"#,
        )
        .unwrap();
        let element = block_to_element(&ws, "r").unwrap();
        let mutation = child(&element, "mutation");
        assert_eq!(mutation.attributes.get("speed").map(String::as_str), Some("3"));
        assert_eq!(
            child(mutation, "wheel").attributes.get("side").map(String::as_str),
            Some("left")
        );
    }

    #[test]
    fn procedure_mutations_use_arg_elements() {
        let mut ws = Workspace::new();
        workspace_from_xml(
            &mut ws,
            r#"<xml>
              <block type="procedures_defnoreturn" id="def" x="0" y="0">
                <mutation><arg name="a" varid="va"></arg></mutation>
                <field name="NAME">greet</field>
              </block>
              <block type="procedures_callnoreturn" id="call" x="0" y="100">
                <mutation name="greet"><arg name="a"></arg></mutation>
              </block>
            </xml>"#,
        )
        .unwrap();
        assert_eq!(ws.variables.by_id("va").unwrap().name, "a");
        assert!(ws.block("call").unwrap().input("ARG0").is_some());
        let element = block_to_element(&ws, "def").unwrap();
        let arg = child(child(&element, "mutation"), "arg");
        assert_eq!(arg.attributes.get("varid").map(String::as_str), Some("va"));
        assert_eq!(fields_of(&element).get("NAME").map(String::as_str), Some("greet"));
    }

    #[test]
    fn inputs_are_written_in_block_order() {
        let mut ws = Workspace::new();
        workspace_from_xml(
            &mut ws,
            r#"<xml>
              <block type="controls_if" id="if">
                <mutation elseif="1" else="1"></mutation>
                <statement name="ELSE"><block type="text_print" id="p2"/></statement>
                <value name="IF1"><block type="logic_boolean" id="b1"/></value>
                <statement name="DO0"><block type="text_print" id="p0"/></statement>
                <value name="IF0"><block type="logic_boolean" id="b0"/></value>
              </block>
            </xml>"#,
        )
        .unwrap();
        let element = block_to_element(&ws, "if").unwrap();
        let names = element
            .children
            .iter()
            .filter_map(XMLNode::as_element)
            .filter(|e| e.name == "value" || e.name == "statement")
            .filter_map(|e| e.attributes.get("name").cloned())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["IF0", "DO0", "IF1", "ELSE"]);
    }
}
