use crate::variables::VariableMap;
use crate::workspace::Workspace;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NameType {
    Variable,
    DeveloperVariable,
    Procedure,
}

impl NameType {
    fn is_variable(self) -> bool {
        matches!(self, NameType::Variable | NameType::DeveloperVariable)
    }
}

/// Maps user-facing names to identifiers that are legal in the generated
/// language and distinct from each other and from reserved words.
#[derive(Debug, Clone, Default)]
pub struct NameDb {
    reserved: HashSet<String>,
    db: HashMap<NameType, HashMap<String, String>>,
    taken: HashSet<String>,
    variable_prefix: String,
    variables: HashMap<String, String>,
}

impl NameDb {
    pub fn new(reserved: &[&str]) -> Self {
        Self {
            reserved: reserved.iter().map(|w| w.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn with_variable_prefix(mut self, prefix: &str) -> Self {
        self.variable_prefix = prefix.to_string();
        self
    }

    pub fn reset(&mut self) {
        self.db.clear();
        self.taken.clear();
        self.variables.clear();
    }

    /// Variable ids passed to `get_name` resolve through this map.
    pub fn set_variable_map(&mut self, variables: &VariableMap) {
        self.variables = variables
            .all()
            .iter()
            .map(|v| (v.id.clone(), v.name.clone()))
            .collect();
    }

    /// Claims names for every variable so that helper names chosen later
    /// never collide with them.
    pub fn populate_variables(&mut self, ws: &Workspace) {
        for variable in ws.variables.all() {
            self.get_name(&variable.id, NameType::Variable);
        }
    }

    pub fn populate_procedures(&mut self, ws: &Workspace) {
        let (plain, returning) = crate::procedures::all_procedures(ws);
        for procedure in plain.iter().chain(&returning) {
            self.get_name(&procedure.name, NameType::Procedure);
        }
    }

    /// Identifier for a user name (or variable id). The same input always
    /// yields the same identifier; comparison ignores case.
    pub fn get_name(&mut self, name_or_id: &str, name_type: NameType) -> String {
        let name = match name_type {
            NameType::Variable => self
                .variables
                .get(name_or_id)
                .cloned()
                .unwrap_or_else(|| name_or_id.to_string()),
            _ => name_or_id.to_string(),
        };
        let normalized = name.to_lowercase();
        let prefix = if name_type.is_variable() {
            self.variable_prefix.clone()
        } else {
            String::new()
        };
        if let Some(existing) = self.db.get(&name_type).and_then(|t| t.get(&normalized)) {
            return format!("{}{}", prefix, existing);
        }
        let distinct = self.get_distinct_name(&name, name_type);
        let bare = distinct[prefix.len()..].to_string();
        self.db.entry(name_type).or_default().insert(normalized, bare);
        distinct
    }

    /// A fresh identifier based on `name`, never handed out before.
    pub fn get_distinct_name(&mut self, name: &str, name_type: NameType) -> String {
        let safe = safe_name(name);
        let mut candidate = safe.clone();
        let mut i = 1;
        while self.taken.contains(&candidate) || self.reserved.contains(&candidate) {
            i += 1;
            candidate = format!("{}{}", safe, i);
        }
        self.taken.insert(candidate.clone());
        if name_type.is_variable() {
            format!("{}{}", self.variable_prefix, candidate)
        } else {
            candidate
        }
    }
}

/// Replaces anything that is not a word character. Non-ASCII characters
/// become their UTF-8 bytes in hex, and a leading digit gets a `my_` prefix.
pub fn safe_name(name: &str) -> String {
    if name.is_empty() {
        return "unnamed".to_string();
    }
    let mut safe = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            safe.push(c);
        } else if c.is_ascii() {
            safe.push('_');
        } else {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                safe.push_str(&format!("_{:02X}", byte));
            }
        }
    }
    if safe.starts_with(|c: char| c.is_ascii_digit()) {
        safe.insert_str(0, "my_");
    }
    safe
}
