use crate::block::{Block, ExtraState, FieldValue};
use crate::generator::{Code, Generator, Language, Order};
use crate::names::NameType;
use crate::procedures::{CALL_NO_RETURN, CALL_RETURN, DEF_NO_RETURN, DEF_RETURN, IF_RETURN};
use crate::workspace::Workspace;
use anyhow::Result;
use regex::Regex;

pub const ORDER_ATOMIC: Order = Order(0.0);
pub const ORDER_COLLECTION: Order = Order(1.0);
pub const ORDER_STRING_CONVERSION: Order = Order(1.0);
pub const ORDER_MEMBER: Order = Order(2.1);
pub const ORDER_FUNCTION_CALL: Order = Order(2.2);
pub const ORDER_EXPONENTIATION: Order = Order(3.0);
pub const ORDER_UNARY_SIGN: Order = Order(4.0);
pub const ORDER_BITWISE_NOT: Order = Order(4.0);
pub const ORDER_MULTIPLICATIVE: Order = Order(5.0);
pub const ORDER_ADDITIVE: Order = Order(6.0);
pub const ORDER_BITWISE_SHIFT: Order = Order(7.0);
pub const ORDER_BITWISE_AND: Order = Order(8.0);
pub const ORDER_BITWISE_XOR: Order = Order(9.0);
pub const ORDER_BITWISE_OR: Order = Order(10.0);
pub const ORDER_RELATIONAL: Order = Order(11.0);
pub const ORDER_LOGICAL_NOT: Order = Order(12.0);
pub const ORDER_LOGICAL_AND: Order = Order(13.0);
pub const ORDER_LOGICAL_OR: Order = Order(14.0);
pub const ORDER_CONDITIONAL: Order = Order(15.0);
pub const ORDER_LAMBDA: Order = Order(16.0);
pub const ORDER_NONE: Order = Order(99.0);

const ORDER_OVERRIDES: &[(Order, Order)] = &[
    // (foo()).bar -> foo().bar
    (ORDER_FUNCTION_CALL, ORDER_MEMBER),
    // (foo())() -> foo()()
    (ORDER_FUNCTION_CALL, ORDER_FUNCTION_CALL),
    // (foo.bar).baz -> foo.bar.baz
    (ORDER_MEMBER, ORDER_MEMBER),
    // (foo.bar)() -> foo.bar()
    (ORDER_MEMBER, ORDER_FUNCTION_CALL),
    // not (not foo) -> not not foo
    (ORDER_LOGICAL_NOT, ORDER_LOGICAL_NOT),
    // a and (b and c) -> a and b and c
    (ORDER_LOGICAL_AND, ORDER_LOGICAL_AND),
    // a or (b or c) -> a or b or c
    (ORDER_LOGICAL_OR, ORDER_LOGICAL_OR),
];

/// Keywords, builtins and module names that generated identifiers must avoid.
const RESERVED_WORDS: &[&str] = &[
    // import keyword; print(keyword.kwlist)
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class", "continue",
    "def", "del", "elif", "else", "except", "exec", "finally", "for", "from", "global", "if", "import",
    "in", "is", "lambda", "nonlocal", "not", "or", "pass", "print", "raise", "return", "try", "while",
    "with", "yield",
    // import builtins; print(dir(builtins))
    "ArithmeticError", "AssertionError", "AttributeError", "BaseException", "BlockingIOError",
    "BrokenPipeError", "BufferError", "BytesWarning", "ChildProcessError", "ConnectionAbortedError",
    "ConnectionError", "ConnectionRefusedError", "ConnectionResetError", "DeprecationWarning",
    "EOFError", "Ellipsis", "EnvironmentError", "Exception", "FileExistsError", "FileNotFoundError",
    "FloatingPointError", "FutureWarning", "GeneratorExit", "IOError", "ImportError", "ImportWarning",
    "IndentationError", "IndexError", "InterruptedError", "IsADirectoryError", "KeyError",
    "KeyboardInterrupt", "LookupError", "MemoryError", "ModuleNotFoundError", "NameError",
    "NotADirectoryError", "NotImplemented", "NotImplementedError", "OSError", "OverflowError",
    "PendingDeprecationWarning", "PermissionError", "ProcessLookupError", "RecursionError",
    "ReferenceError", "ResourceWarning", "RuntimeError", "RuntimeWarning", "StopAsyncIteration",
    "StopIteration", "SyntaxError", "SyntaxWarning", "SystemError", "SystemExit", "TabError",
    "TimeoutError", "TypeError", "UnboundLocalError", "UnicodeDecodeError", "UnicodeEncodeError",
    "UnicodeError", "UnicodeTranslateError", "UnicodeWarning", "UserWarning", "ValueError", "Warning",
    "ZeroDivisionError", "_", "__build_class__", "__debug__", "__doc__", "__import__", "__loader__",
    "__name__", "__package__", "__spec__", "abs", "all", "any", "apply", "ascii", "basestring", "bin",
    "bool", "buffer", "bytearray", "bytes", "callable", "chr", "classmethod", "cmp", "coerce",
    "compile", "complex", "copyright", "credits", "delattr", "dict", "dir", "divmod", "enumerate",
    "eval", "execfile", "exit", "file", "filter", "float", "format", "frozenset", "getattr",
    "globals", "hasattr", "hash", "help", "hex", "id", "input", "int", "intern", "isinstance",
    "issubclass", "iter", "len", "license", "list", "locals", "long", "map", "max", "memoryview",
    "min", "next", "object", "oct", "open", "ord", "pow", "property", "quit", "range", "raw_input",
    "reduce", "reload", "repr", "reversed", "round", "set", "setattr", "slice", "sorted",
    "staticmethod", "str", "sum", "super", "tuple", "type", "unichr", "unicode", "vars", "xrange",
    "zip",
    // modules pulled in by generated code
    "math", "random", "Number",
];

/// Python 3 code generation for the standard block library.
#[derive(Debug, Clone, Copy, Default)]
pub struct Python;

impl Language for Python {
    fn name(&self) -> &'static str {
        "Python"
    }

    fn reserved_words(&self) -> &'static [&'static str] {
        RESERVED_WORDS
    }

    fn order_overrides(&self) -> &'static [(Order, Order)] {
        ORDER_OVERRIDES
    }

    fn init(&self, gen: &mut Generator<'_>) -> Result<()> {
        let ws = gen.workspace();
        gen.names.reset();
        gen.names.set_variable_map(&ws.variables);
        gen.names.populate_variables(ws);
        gen.names.populate_procedures(ws);
        let declarations = used_variables(ws)
            .iter()
            .map(|id| format!("{} = None", gen.variable_name(id)))
            .collect::<Vec<_>>();
        gen.define("variables", declarations.join("\n"));
        Ok(())
    }

    fn generate(&self, gen: &mut Generator<'_>, block: &Block) -> Result<Option<Code>> {
        let code = match block.block_type.as_str() {
            "controls_if" => Code::Statement(emit_if(gen, block)?),
            "logic_compare" => match emit_compare(gen, block)? {
                Some(code) => code,
                None => return Ok(None),
            },
            "logic_operation" => emit_operation(gen, block)?,
            "logic_negate" => {
                let argument = value_or(gen, block, "BOOL", ORDER_LOGICAL_NOT, "True")?;
                Code::Value(format!("not {}", argument), ORDER_LOGICAL_NOT)
            }
            "logic_boolean" => {
                let code = if field(block, "BOOL") == "TRUE" { "True" } else { "False" };
                Code::Value(code.to_string(), ORDER_ATOMIC)
            }
            "logic_null" => Code::Value("None".to_string(), ORDER_ATOMIC),
            "logic_ternary" => {
                let condition = value_or(gen, block, "IF", ORDER_CONDITIONAL, "False")?;
                let then = value_or(gen, block, "THEN", ORDER_CONDITIONAL, "None")?;
                let otherwise = value_or(gen, block, "ELSE", ORDER_CONDITIONAL, "None")?;
                Code::Value(format!("{} if {} else {}", then, condition, otherwise), ORDER_CONDITIONAL)
            }
            "controls_repeat_ext" => Code::Statement(emit_repeat(gen, block)?),
            "controls_whileUntil" => Code::Statement(emit_while_until(gen, block)?),
            "controls_forEach" => {
                let variable = variable_field(gen, block, "VAR");
                let list = value_or(gen, block, "LIST", ORDER_RELATIONAL, "[]")?;
                let branch = loop_branch(gen, block, "DO")?;
                Code::Statement(format!("for {} in {}:\n{}", variable, list, branch))
            }
            "controls_flow_statements" => match field(block, "FLOW") {
                "BREAK" => Code::Statement("break\n".to_string()),
                "CONTINUE" => Code::Statement("continue\n".to_string()),
                _ => return Ok(None),
            },
            "math_number" => emit_number(block),
            "math_arithmetic" => match emit_arithmetic(gen, block)? {
                Some(code) => code,
                None => return Ok(None),
            },
            "math_single" => match emit_single(gen, block)? {
                Some(code) => code,
                None => return Ok(None),
            },
            "math_constant" => match emit_constant(gen, block) {
                Some(code) => code,
                None => return Ok(None),
            },
            "math_modulo" => {
                let dividend = value_or(gen, block, "DIVIDEND", ORDER_MULTIPLICATIVE, "0")?;
                let divisor = value_or(gen, block, "DIVISOR", ORDER_MULTIPLICATIVE, "0")?;
                Code::Value(format!("{} % {}", dividend, divisor), ORDER_MULTIPLICATIVE)
            }
            "math_change" => {
                gen.define("from_numbers_import_Number", "from numbers import Number".to_string());
                let delta = value_or(gen, block, "DELTA", ORDER_ADDITIVE, "0")?;
                let variable = variable_field(gen, block, "VAR");
                Code::Statement(format!(
                    "{v} = ({v} if isinstance({v}, Number) else 0) + {d}\n",
                    v = variable,
                    d = delta
                ))
            }
            "text" => Code::Value(quote(field(block, "TEXT")), ORDER_ATOMIC),
            "text_join" => emit_join(gen, block)?,
            "text_print" => {
                let message = value_or(gen, block, "TEXT", ORDER_NONE, "''")?;
                Code::Statement(format!("print({})\n", message))
            }
            "text_length" => {
                let text = value_or(gen, block, "VALUE", ORDER_NONE, "''")?;
                Code::Value(format!("len({})", text), ORDER_FUNCTION_CALL)
            }
            "variables_get" => Code::Value(variable_field(gen, block, "VAR"), ORDER_ATOMIC),
            "variables_set" => {
                let argument = value_or(gen, block, "VALUE", ORDER_NONE, "0")?;
                let variable = variable_field(gen, block, "VAR");
                Code::Statement(format!("{} = {}\n", variable, argument))
            }
            "lists_create_empty" => Code::Value("[]".to_string(), ORDER_ATOMIC),
            "lists_create_with" => {
                let elements = item_values(gen, block, ORDER_NONE, "None")?;
                Code::Value(format!("[{}]", elements.join(", ")), ORDER_ATOMIC)
            }
            "lists_length" => {
                let list = value_or(gen, block, "VALUE", ORDER_NONE, "[]")?;
                Code::Value(format!("len({})", list), ORDER_FUNCTION_CALL)
            }
            "lists_getIndex" => match emit_get_index(gen, block)? {
                Some(code) => code,
                None => return Ok(None),
            },
            DEF_NO_RETURN | DEF_RETURN => emit_procedure(self, gen, block)?,
            CALL_RETURN => Code::Value(emit_call(gen, block)?, ORDER_FUNCTION_CALL),
            CALL_NO_RETURN => Code::Statement(emit_call(gen, block)? + "\n"),
            IF_RETURN => Code::Statement(emit_if_return(gen, block)?),
            _ => return Ok(None),
        };
        Ok(Some(code))
    }

    fn scrub(&self, gen: &mut Generator<'_>, block: &Block, code: String, this_only: bool) -> Result<String> {
        let comments = gen.comment_code(block, "# ");
        let next = if this_only {
            String::new()
        } else {
            gen.statement_chain(block.next_block().map(String::as_str))?
        };
        Ok(comments + &code + &next)
    }

    /// Imports go first, then the remaining definitions, then the program.
    fn finish(&self, gen: &mut Generator<'_>, code: String) -> Result<String> {
        let import = Regex::new(r"^(from\s+\S+\s+)?import\s+\S+")?;
        let (imports, definitions): (Vec<&str>, Vec<&str>) = gen
            .definitions()
            .iter()
            .map(|(_, def)| def.as_str())
            .partition(|def| import.is_match(def));
        let all_defs = format!("{}\n\n{}", imports.join("\n"), definitions.join("\n\n"));
        let blank_runs = Regex::new(r"\n\n+")?;
        let trailing = Regex::new(r"\n*$")?;
        let all_defs = blank_runs.replace_all(&all_defs, "\n\n");
        let all_defs = trailing.replace(&all_defs, "\n\n\n").into_owned();
        gen.names.reset();
        Ok(all_defs + &code)
    }

    fn scrub_naked_value(&self, line: String) -> String {
        line + "\n"
    }

    fn unsupported_statement(&self, block: &Block) -> String {
        format!("# unsupported block: {} ({})\n", block.block_type, block.id)
    }

    fn unsupported_value(&self, gen: &mut Generator<'_>, block: &Block) -> Code {
        gen.define(
            &format!("unsupported:{}", block.block_type),
            format!("# unsupported block: {}", block.block_type),
        );
        Code::Value("None".to_string(), ORDER_ATOMIC)
    }
}

/// Python string literal, preferring single quotes.
pub fn quote(text: &str) -> String {
    let mut escaped = text.replace('\\', "\\\\").replace('\n', "\\n");
    let mut quote = '\'';
    if escaped.contains('\'') {
        if escaped.contains('"') {
            escaped = escaped.replace('\'', "\\'");
        } else {
            quote = '"';
        }
    }
    format!("{q}{}{q}", escaped, q = quote)
}

/// Variables referenced by variable fields or procedure parameters, in
/// workspace order.
fn used_variables(ws: &Workspace) -> Vec<String> {
    let mut used: Vec<String> = Vec::new();
    for id in ws.all_blocks() {
        let Some(block) = ws.block(&id) else {
            continue;
        };
        let fields = block.fields.iter().filter_map(|f| match &f.value {
            FieldValue::Variable(var_id) => Some(var_id.clone()),
            FieldValue::Text(_) => None,
        });
        let params = block
            .procedure_def()
            .map(|def| def.params.iter().map(|p| p.var_id.clone()).collect::<Vec<_>>())
            .unwrap_or_default();
        for var_id in fields.chain(params) {
            if ws.variables.by_id(&var_id).is_some() && !used.contains(&var_id) {
                used.push(var_id);
            }
        }
    }
    used
}

fn field<'b>(block: &'b Block, name: &str) -> &'b str {
    block.field_value(name).unwrap_or_default()
}

fn variable_field(gen: &mut Generator<'_>, block: &Block, name: &str) -> String {
    gen.variable_name(field(block, name))
}

fn value_or(gen: &mut Generator<'_>, block: &Block, input: &str, order: Order, default: &str) -> Result<String> {
    let code = gen.value_to_code(block, input, order)?;
    Ok(if code.is_empty() { default.to_string() } else { code })
}

fn pass(gen: &Generator<'_>) -> String {
    format!("{}pass\n", gen.indent())
}

fn branch_or_pass(gen: &mut Generator<'_>, block: &Block, input: &str) -> Result<String> {
    let branch = gen.statement_to_code(block, input)?;
    Ok(if branch.is_empty() { pass(gen) } else { branch })
}

fn loop_branch(gen: &mut Generator<'_>, block: &Block, input: &str) -> Result<String> {
    let branch = gen.statement_to_code(block, input)?;
    let branch = gen.add_loop_trap(branch, block);
    Ok(if branch.is_empty() { pass(gen) } else { branch })
}

fn item_values(gen: &mut Generator<'_>, block: &Block, order: Order, default: &str) -> Result<Vec<String>> {
    let slots = block
        .inputs
        .iter()
        .filter(|i| i.name.starts_with("ADD"))
        .map(|i| i.name.clone())
        .collect::<Vec<_>>();
    slots
        .iter()
        .map(|name| value_or(gen, block, name, order, default))
        .collect()
}

fn emit_if(gen: &mut Generator<'_>, block: &Block) -> Result<String> {
    let mut code = String::new();
    let mut n = 0;
    while block.input(&format!("IF{}", n)).is_some() {
        let condition = value_or(gen, block, &format!("IF{}", n), ORDER_NONE, "False")?;
        let branch = branch_or_pass(gen, block, &format!("DO{}", n))?;
        let keyword = if n == 0 { "if" } else { "elif" };
        code += &format!("{} {}:\n{}", keyword, condition, branch);
        n += 1;
    }
    if block.input("ELSE").is_some() {
        let branch = branch_or_pass(gen, block, "ELSE")?;
        code += &format!("else:\n{}", branch);
    }
    Ok(code)
}

fn emit_compare(gen: &mut Generator<'_>, block: &Block) -> Result<Option<Code>> {
    let operator = match field(block, "OP") {
        "EQ" => "==",
        "NEQ" => "!=",
        "LT" => "<",
        "LTE" => "<=",
        "GT" => ">",
        "GTE" => ">=",
        _ => return Ok(None),
    };
    let a = value_or(gen, block, "A", ORDER_RELATIONAL, "0")?;
    let b = value_or(gen, block, "B", ORDER_RELATIONAL, "0")?;
    Ok(Some(Code::Value(format!("{} {} {}", a, operator, b), ORDER_RELATIONAL)))
}

fn emit_operation(gen: &mut Generator<'_>, block: &Block) -> Result<Code> {
    let (operator, order) = if field(block, "OP") == "AND" {
        ("and", ORDER_LOGICAL_AND)
    } else {
        ("or", ORDER_LOGICAL_OR)
    };
    let mut a = gen.value_to_code(block, "A", order)?;
    let mut b = gen.value_to_code(block, "B", order)?;
    if a.is_empty() && b.is_empty() {
        a = "False".to_string();
        b = "False".to_string();
    } else {
        // A lone operand keeps its truth value.
        let default = if operator == "and" { "True" } else { "False" };
        if a.is_empty() {
            a = default.to_string();
        }
        if b.is_empty() {
            b = default.to_string();
        }
    }
    Ok(Code::Value(format!("{} {} {}", a, operator, b), order))
}

fn emit_repeat(gen: &mut Generator<'_>, block: &Block) -> Result<String> {
    let times = value_or(gen, block, "TIMES", ORDER_NONE, "0")?;
    let repeats = match parse_int(&times)? {
        Some(n) => n.to_string(),
        None => format!("int({})", times),
    };
    let branch = loop_branch(gen, block, "DO")?;
    let counter = gen.names.get_distinct_name("count", NameType::Variable);
    Ok(format!("for {} in range({}):\n{}", counter, repeats, branch))
}

fn emit_while_until(gen: &mut Generator<'_>, block: &Block) -> Result<String> {
    let until = field(block, "MODE") == "UNTIL";
    let order = if until { ORDER_LOGICAL_NOT } else { ORDER_NONE };
    let mut condition = value_or(gen, block, "BOOL", order, "False")?;
    let branch = loop_branch(gen, block, "DO")?;
    if until {
        condition = format!("not {}", condition);
    }
    Ok(format!("while {}:\n{}", condition, branch))
}

/// Integer value of a numeric literal, truncating any fraction.
fn parse_int(code: &str) -> Result<Option<i64>> {
    let numeric = Regex::new(r"^\s*(-?\d+)(\.\d+)?\s*$")?;
    Ok(numeric
        .captures(code)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<i64>().ok()))
}

fn emit_number(block: &Block) -> Code {
    let number = match field(block, "NUM").trim() {
        "" => 0.0,
        text => text.parse::<f64>().unwrap_or(f64::NAN),
    };
    if number.is_nan() {
        Code::Value("float(\"nan\")".to_string(), ORDER_FUNCTION_CALL)
    } else if number == f64::INFINITY {
        Code::Value("float(\"inf\")".to_string(), ORDER_FUNCTION_CALL)
    } else if number == f64::NEG_INFINITY {
        Code::Value("-float(\"inf\")".to_string(), ORDER_UNARY_SIGN)
    } else if number < 0.0 {
        Code::Value(number.to_string(), ORDER_UNARY_SIGN)
    } else {
        // -0 prints as 0.
        Code::Value(number.abs().to_string(), ORDER_ATOMIC)
    }
}

fn emit_arithmetic(gen: &mut Generator<'_>, block: &Block) -> Result<Option<Code>> {
    let (operator, order) = match field(block, "OP") {
        "ADD" => (" + ", ORDER_ADDITIVE),
        "MINUS" => (" - ", ORDER_ADDITIVE),
        "MULTIPLY" => (" * ", ORDER_MULTIPLICATIVE),
        "DIVIDE" => (" / ", ORDER_MULTIPLICATIVE),
        "POWER" => (" ** ", ORDER_EXPONENTIATION),
        _ => return Ok(None),
    };
    let a = value_or(gen, block, "A", order, "0")?;
    let b = value_or(gen, block, "B", order, "0")?;
    Ok(Some(Code::Value(format!("{}{}{}", a, operator, b), order)))
}

fn emit_single(gen: &mut Generator<'_>, block: &Block) -> Result<Option<Code>> {
    let operator = field(block, "OP");
    if operator == "NEG" {
        let argument = value_or(gen, block, "NUM", ORDER_UNARY_SIGN, "0")?;
        return Ok(Some(Code::Value(format!("-{}", argument), ORDER_UNARY_SIGN)));
    }
    let trig = matches!(operator, "SIN" | "COS" | "TAN");
    let order = if trig { ORDER_MULTIPLICATIVE } else { ORDER_NONE };
    let arg = value_or(gen, block, "NUM", order, "0")?;
    let function_call = match operator {
        "ABS" => format!("math.fabs({})", arg),
        "ROOT" => format!("math.sqrt({})", arg),
        "LN" => format!("math.log({})", arg),
        "LOG10" => format!("math.log10({})", arg),
        "EXP" => format!("math.exp({})", arg),
        "POW10" => format!("math.pow(10,{})", arg),
        "ROUND" => format!("round({})", arg),
        "ROUNDUP" => format!("math.ceil({})", arg),
        "ROUNDDOWN" => format!("math.floor({})", arg),
        "SIN" => format!("math.sin({} / 180.0 * math.pi)", arg),
        "COS" => format!("math.cos({} / 180.0 * math.pi)", arg),
        "TAN" => format!("math.tan({} / 180.0 * math.pi)", arg),
        "ASIN" => format!("math.asin({}) / math.pi * 180", arg),
        "ACOS" => format!("math.acos({}) / math.pi * 180", arg),
        "ATAN" => format!("math.atan({}) / math.pi * 180", arg),
        _ => return Ok(None),
    };
    gen.define("import_math", "import math".to_string());
    let order = if matches!(operator, "ASIN" | "ACOS" | "ATAN") {
        ORDER_MULTIPLICATIVE
    } else {
        ORDER_FUNCTION_CALL
    };
    Ok(Some(Code::Value(function_call, order)))
}

fn emit_constant(gen: &mut Generator<'_>, block: &Block) -> Option<Code> {
    let (code, order) = match field(block, "CONSTANT") {
        "INFINITY" => return Some(Code::Value("float('inf')".to_string(), ORDER_ATOMIC)),
        "PI" => ("math.pi", ORDER_MEMBER),
        "E" => ("math.e", ORDER_MEMBER),
        "GOLDEN_RATIO" => ("(1 + math.sqrt(5)) / 2", ORDER_MULTIPLICATIVE),
        "SQRT2" => ("math.sqrt(2)", ORDER_MEMBER),
        "SQRT1_2" => ("math.sqrt(1.0 / 2)", ORDER_MEMBER),
        _ => return None,
    };
    gen.define("import_math", "import math".to_string());
    Some(Code::Value(code.to_string(), order))
}

fn emit_join(gen: &mut Generator<'_>, block: &Block) -> Result<Code> {
    let slots = block.inputs.iter().filter(|i| i.name.starts_with("ADD")).count();
    match slots {
        0 => Ok(Code::Value("''".to_string(), ORDER_ATOMIC)),
        1 => {
            let element = value_or(gen, block, "ADD0", ORDER_NONE, "''")?;
            let (code, order) = force_string(&element)?;
            Ok(Code::Value(code, order))
        }
        2 => {
            let first = value_or(gen, block, "ADD0", ORDER_NONE, "''")?;
            let second = value_or(gen, block, "ADD1", ORDER_NONE, "''")?;
            let (first, _) = force_string(&first)?;
            let (second, _) = force_string(&second)?;
            Ok(Code::Value(format!("{} + {}", first, second), ORDER_ADDITIVE))
        }
        _ => {
            let elements = item_values(gen, block, ORDER_NONE, "''")?;
            let temp = gen.names.get_distinct_name("x", NameType::Variable);
            Ok(Code::Value(
                format!("''.join([str({t}) for {t} in [{}]])", elements.join(", "), t = temp),
                ORDER_FUNCTION_CALL,
            ))
        }
    }
}

/// Wraps a value in `str()` unless it is already a string literal.
fn force_string(value: &str) -> Result<(String, Order)> {
    let literal = Regex::new(r"^\s*'([^']|\\')*'\s*$")?;
    if literal.is_match(value) {
        Ok((value.to_string(), ORDER_ATOMIC))
    } else {
        Ok((format!("str({})", value), ORDER_FUNCTION_CALL))
    }
}

/// Index expression for the AT input, shifted for one-based indexing.
fn adjusted_index(gen: &mut Generator<'_>, block: &Block, delta: i64, negate: bool) -> Result<String> {
    let one_based = gen.options.one_based_index;
    let delta = if one_based { delta - 1 } else { delta };
    let default = if one_based { "1" } else { "0" };
    let order = if delta != 0 { ORDER_ADDITIVE } else { ORDER_NONE };
    let at = value_or(gen, block, "AT", order, default)?;
    if let Some(n) = parse_int(&at)?.and_then(|n| shift_index(n, delta, negate)) {
        return Ok(n.to_string());
    }
    let at = match delta {
        d if d > 0 => format!("int({} + {})", at, d),
        d if d < 0 => format!("int({} - {})", at, d.unsigned_abs()),
        _ => format!("int({})", at),
    };
    Ok(if negate { format!("-{}", at) } else { at })
}

/// Literal index after shifting, or None when it does not fit in an i64.
fn shift_index(n: i64, delta: i64, negate: bool) -> Option<i64> {
    let n = n.checked_add(delta)?;
    if negate {
        n.checked_neg()
    } else {
        Some(n)
    }
}

fn emit_get_index(gen: &mut Generator<'_>, block: &Block) -> Result<Option<Code>> {
    let mode = field(block, "MODE");
    let position = field(block, "WHERE");
    let remove = match mode {
        "GET" => false,
        "GET_REMOVE" => true,
        _ => return Ok(None),
    };
    let list_order = if position == "RANDOM" { ORDER_NONE } else { ORDER_MEMBER };
    let list = value_or(gen, block, "VALUE", list_order, "[]")?;
    let code = match position {
        "FIRST" if remove => Code::Value(format!("{}.pop(0)", list), ORDER_FUNCTION_CALL),
        "FIRST" => Code::Value(format!("{}[0]", list), ORDER_MEMBER),
        "LAST" if remove => Code::Value(format!("{}.pop()", list), ORDER_FUNCTION_CALL),
        "LAST" => Code::Value(format!("{}[-1]", list), ORDER_MEMBER),
        "FROM_START" | "FROM_END" => {
            let from_end = position == "FROM_END";
            let at = adjusted_index(gen, block, i64::from(from_end), from_end)?;
            if remove {
                Code::Value(format!("{}.pop({})", list, at), ORDER_FUNCTION_CALL)
            } else {
                Code::Value(format!("{}[{}]", list, at), ORDER_MEMBER)
            }
        }
        "RANDOM" => {
            gen.define("import_random", "import random".to_string());
            if remove {
                let placeholder = format!("def {}(myList):", Generator::FUNCTION_NAME_PLACEHOLDER);
                let function_name = gen.provide_function(
                    "lists_remove_random_item",
                    &[
                        placeholder.as_str(),
                        "  x = int(random.random() * len(myList))",
                        "  return myList.pop(x)",
                    ],
                );
                Code::Value(format!("{}({})", function_name, list), ORDER_FUNCTION_CALL)
            } else {
                Code::Value(format!("random.choice({})", list), ORDER_FUNCTION_CALL)
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(code))
}

/// Registers the function as a definition; the block itself emits nothing.
fn emit_procedure(language: &Python, gen: &mut Generator<'_>, block: &Block) -> Result<Code> {
    let ws = gen.workspace();
    let params = block
        .procedure_def()
        .map(|def| def.params.iter().map(|p| p.var_id.clone()).collect::<Vec<_>>())
        .unwrap_or_default();
    let globals = used_variables(ws)
        .into_iter()
        .filter(|id| !params.contains(id))
        .map(|id| gen.variable_name(&id))
        .collect::<Vec<_>>();
    let indent = gen.indent().to_string();
    let globals = if globals.is_empty() {
        String::new()
    } else {
        format!("{}global {}\n", indent, globals.join(", "))
    };
    let function_name = gen.procedure_name(field(block, "NAME"));
    let prefix = match gen.options.statement_prefix.clone() {
        Some(prefix) => crate::generator::prefix_lines(&gen.inject_id(&prefix, block), &indent),
        None => String::new(),
    };
    let mut branch = gen.statement_to_code(block, "STACK")?;
    let mut return_value = gen.value_to_code(block, "RETURN", ORDER_NONE)?;
    let return_prefix = if !branch.is_empty() && !return_value.is_empty() {
        prefix.clone()
    } else {
        String::new()
    };
    if !return_value.is_empty() {
        return_value = format!("{}return {}\n", indent, return_value);
    } else if branch.is_empty() {
        branch = pass(gen);
    }
    let args = params.iter().map(|id| gen.variable_name(id)).collect::<Vec<_>>();
    let code = format!(
        "def {}({}):\n{}{}{}{}{}",
        function_name,
        args.join(", "),
        globals,
        prefix,
        branch,
        return_prefix,
        return_value
    );
    let code = language.scrub(gen, block, code, true)?;
    gen.define(&format!("%{}", function_name), code);
    Ok(Code::Handled)
}

fn emit_call(gen: &mut Generator<'_>, block: &Block) -> Result<String> {
    let function_name = gen.procedure_name(field(block, "NAME"));
    let count = block.procedure_call().map_or(0, |call| call.arguments.len());
    let args = (0..count)
        .map(|i| value_or(gen, block, &format!("ARG{}", i), ORDER_NONE, "None"))
        .collect::<Result<Vec<_>>>()?;
    Ok(format!("{}({})", function_name, args.join(", ")))
}

fn emit_if_return(gen: &mut Generator<'_>, block: &Block) -> Result<String> {
    let condition = value_or(gen, block, "CONDITION", ORDER_NONE, "False")?;
    let indent = gen.indent().to_string();
    let mut code = format!("if {}:\n", condition);
    if matches!(block.extra, ExtraState::IfReturn { has_return_value: true }) {
        let value = value_or(gen, block, "VALUE", ORDER_NONE, "None")?;
        code += &format!("{}return {}\n", indent, value);
    } else {
        code += &format!("{}return\n", indent);
    }
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::GeneratorOptions;
    use crate::state;
    use crate::workspace::WorkspaceOptions;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn load(value: serde_json::Value) -> Workspace {
        let mut ws = Workspace::with_options(WorkspaceOptions {
            lenient_block_types: true,
            ..WorkspaceOptions::default()
        });
        state::workspace_from_json(&mut ws, &value.to_string()).unwrap();
        ws
    }

    fn python(ws: &Workspace) -> String {
        Generator::new(ws, &Python, GeneratorOptions::default())
            .workspace_to_code()
            .unwrap()
    }

    fn number(n: &str) -> serde_json::Value {
        json!({"block": {"type": "math_number", "fields": {"NUM": n}}})
    }

    fn print_of(value: serde_json::Value) -> serde_json::Value {
        json!({"blocks": {"blocks": [{"type": "text_print", "inputs": {"TEXT": {"block": value}}}]}})
    }

    #[test]
    fn quotes_prefer_single_quotes() {
        assert_eq!(quote("hi"), "'hi'");
        assert_eq!(quote("it's"), "\"it's\"");
        assert_eq!(quote("it's \"x\""), "'it\\'s \"x\"'");
        assert_eq!(quote("a\\b"), "'a\\\\b'");
    }

    #[test]
    fn looser_operands_get_parentheses() {
        let sum = json!({"type": "math_arithmetic", "fields": {"OP": "ADD"},
            "inputs": {"A": number("1"), "B": number("2")}});
        let product = json!({"type": "math_arithmetic", "fields": {"OP": "MULTIPLY"},
            "inputs": {"A": {"block": sum}, "B": number("3")}});
        assert_eq!(python(&load(print_of(product))), "print((1 + 2) * 3)\n");
    }

    #[test]
    fn tighter_operands_stay_bare() {
        let product = json!({"type": "math_arithmetic", "fields": {"OP": "MULTIPLY"},
            "inputs": {"A": number("2"), "B": number("3")}});
        let sum = json!({"type": "math_arithmetic", "fields": {"OP": "ADD"},
            "inputs": {"A": {"block": product}, "B": number("-1")}});
        assert_eq!(python(&load(print_of(sum))), "print(2 * 3 + -1)\n");
    }

    #[test]
    fn chained_not_needs_no_parentheses() {
        let inner = json!({"type": "logic_negate",
            "inputs": {"BOOL": {"block": {"type": "logic_boolean", "fields": {"BOOL": "TRUE"}}}}});
        let outer = json!({"type": "logic_negate", "inputs": {"BOOL": {"block": inner}}});
        assert_eq!(python(&load(print_of(outer))), "print(not not True)\n");
    }

    #[test]
    fn empty_sockets_use_defaults() {
        let ws = load(json!({"blocks": {"blocks": [
            {"type": "controls_if", "extraState": {"hasElse": true}},
            {"type": "logic_operation", "fields": {"OP": "OR"}, "y": 100.0,
             "inputs": {"A": {"block": {"type": "logic_boolean", "fields": {"BOOL": "TRUE"}}}}}
        ]}}));
        assert_eq!(python(&ws), "if False:\n  pass\nelse:\n  pass\n\nTrue or False\n");
    }

    #[test]
    fn variables_are_declared_and_math_is_imported() {
        let ws = load(json!({
            "variables": [{"name": "n", "id": "v1"}],
            "blocks": {"blocks": [{
                "type": "variables_set", "fields": {"VAR": {"id": "v1"}},
                "inputs": {"VALUE": {"block": {"type": "math_single", "fields": {"OP": "ROOT"},
                    "inputs": {"NUM": number("9")}}}},
                "next": {"block": {"type": "math_change", "fields": {"VAR": {"id": "v1"}},
                    "inputs": {"DELTA": number("1")}}}
            }]}
        }));
        assert_eq!(
            python(&ws),
            "import math\nfrom numbers import Number\n\nn = None\n\n\n\
             n = math.sqrt(9)\nn = (n if isinstance(n, Number) else 0) + 1\n"
        );
    }

    #[test]
    fn repeat_uses_a_fresh_counter() {
        let ws = load(json!({"blocks": {"blocks": [{
            "type": "controls_repeat_ext", "inputs": {"TIMES": number("3.5")},
            "id": "r"
        }]}}));
        assert_eq!(python(&ws), "for count in range(3):\n  pass\n");
    }

    #[test]
    fn disabled_blocks_are_skipped() {
        let ws = load(json!({"blocks": {"blocks": [{
            "type": "text_print", "inputs": {"TEXT": {"block": {"type": "text", "fields": {"TEXT": "a"}}}},
            "next": {"block": {
                "type": "text_print", "enabled": false,
                "inputs": {"TEXT": {"block": {"type": "text", "fields": {"TEXT": "b"}}}},
                "next": {"block": {"type": "text_print",
                    "inputs": {"TEXT": {"block": {"type": "text", "fields": {"TEXT": "c"}}}}}}
            }}
        }]}}));
        assert_eq!(python(&ws), "print('a')\nprint('c')\n");
    }

    #[test]
    fn unsupported_blocks_become_placeholders() {
        let ws = load(json!({"blocks": {"blocks": [{
            "type": "robot_beep", "id": "beep", "next": {"block": {
                "type": "text_print",
                "inputs": {"TEXT": {"block": {"type": "sensor_value"}}}
            }}
        }]}}));
        let code = python(&ws);
        assert_eq!(
            code,
            "# unsupported block: sensor_value\n\n\n\
             # unsupported block: robot_beep (beep)\nprint(None)\n"
        );
    }

    #[test]
    fn comments_precede_statements() {
        let ws = load(json!({"blocks": {"blocks": [{
            "type": "text_print", "icons": {"comment": {"text": "say hello"}},
            "inputs": {"TEXT": {"block": {"type": "text", "fields": {"TEXT": "hello"},
                "icons": {"comment": {"text": "greeting"}}}}}
        }]}}));
        assert_eq!(python(&ws), "# say hello\n# greeting\nprint('hello')\n");
    }

    #[test]
    fn joins_force_strings() {
        let join = |items: Vec<serde_json::Value>| {
            let mut inputs = serde_json::Map::new();
            for (i, item) in items.iter().enumerate() {
                inputs.insert(format!("ADD{}", i), json!({ "block": item }));
            }
            json!({"type": "text_join", "extraState": {"itemCount": items.len()}, "inputs": inputs})
        };
        let text = json!({"type": "text", "fields": {"TEXT": "a"}});
        let num = json!({"type": "math_number", "fields": {"NUM": "1"}});
        let two = join(vec![text.clone(), num.clone()]);
        assert_eq!(python(&load(print_of(two))), "print('a' + str(1))\n");
        let three = join(vec![text, num.clone(), num]);
        assert_eq!(
            python(&load(print_of(three))),
            "print(''.join([str(x) for x in ['a', 1, 1]]))\n"
        );
    }

    #[test]
    fn list_indexes_are_one_based_by_default() {
        let get = json!({"type": "lists_getIndex", "fields": {"MODE": "GET", "WHERE": "FROM_START"},
            "inputs": {"VALUE": {"block": {"type": "lists_create_empty"}}, "AT": number("2")}});
        let ws = load(print_of(get));
        assert_eq!(python(&ws), "print([][1])\n");
        let options = GeneratorOptions {
            one_based_index: false,
            ..GeneratorOptions::default()
        };
        let code = Generator::new(&ws, &Python, options).workspace_to_code().unwrap();
        assert_eq!(code, "print([][2])\n");
    }

    #[test]
    fn literal_index_shifts_stay_in_range() {
        assert_eq!(shift_index(2, -1, false), Some(1));
        assert_eq!(shift_index(3, 0, true), Some(-3));
        assert_eq!(shift_index(i64::MAX, 1, false), None);
        assert_eq!(shift_index(i64::MIN, 0, true), None);
        assert_eq!(shift_index(i64::MIN, -1, false), None);
    }

    #[test]
    fn procedures_become_function_definitions() {
        let ws = load(json!({
            "variables": [{"name": "total", "id": "vt"}, {"name": "x", "id": "vx"}],
            "blocks": {"blocks": [
                {"type": "procedures_defreturn", "id": "def", "x": 0.0, "y": 0.0,
                 "fields": {"NAME": "double"},
                 "extraState": {"params": [{"name": "x", "id": "vx", "paramId": "p1"}]},
                 "inputs": {
                     "STACK": {"block": {"type": "variables_set", "fields": {"VAR": {"id": "vt"}},
                         "inputs": {"VALUE": {"block": {"type": "variables_get", "fields": {"VAR": {"id": "vx"}}}}}}},
                     "RETURN": {"block": {"type": "math_arithmetic", "fields": {"OP": "MULTIPLY"},
                         "inputs": {"A": {"block": {"type": "variables_get", "fields": {"VAR": {"id": "vx"}}}},
                                    "B": number("2")}}}
                 }},
                {"type": "text_print", "x": 0.0, "y": 200.0, "inputs": {"TEXT": {"block": {
                    "type": "procedures_callreturn", "extraState": {"name": "double", "params": ["x"]},
                    "inputs": {"ARG0": number("4")}}}}}
            ]}
        }));
        assert_eq!(
            python(&ws),
            "x = None\ntotal = None\n\n\
             def double(x):\n  global total\n  total = x\n  return x * 2\n\n\n\
             print(double(4))\n"
        );
    }

    #[test]
    fn empty_procedures_pass() {
        let ws = load(json!({"blocks": {"blocks": [
            {"type": "procedures_defnoreturn", "fields": {"NAME": "noop"}}
        ]}}));
        assert_eq!(python(&ws), "def noop():\n  pass\n");
    }
}
