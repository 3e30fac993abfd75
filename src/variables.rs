use anyhow::{bail, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableModel {
    pub id: String,
    pub name: String,
    /// Procedure arguments use the empty type.
    pub var_type: String,
}

/// Ordered set of variables owned by a workspace.
#[derive(Debug, Clone, Default)]
pub struct VariableMap {
    variables: Vec<VariableModel>,
}

impl VariableMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> &[VariableModel] {
        &self.variables
    }

    pub fn by_id(&self, id: &str) -> Option<&VariableModel> {
        self.variables.iter().find(|v| v.id == id)
    }

    /// Case-insensitive lookup by name within a type.
    pub fn by_name(&self, name: &str, var_type: &str) -> Option<&VariableModel> {
        let lowered = name.to_lowercase();
        self.variables
            .iter()
            .find(|v| v.var_type == var_type && v.name.to_lowercase() == lowered)
    }

    /// Inserts a new variable. Re-creating an existing name/type pair returns
    /// the existing model when ids agree.
    pub fn create(&mut self, name: &str, var_type: &str, id: &str) -> Result<VariableModel> {
        if let Some(existing) = self.by_name(name, var_type) {
            if existing.id != id {
                bail!(
                    "Variable '{}' is already in use and its id is '{}', which conflicts with the passed in id '{}'.",
                    name,
                    existing.id,
                    id
                );
            }
            return Ok(existing.clone());
        }
        if self.by_id(id).is_some() {
            bail!("Variable id '{}' is already in use.", id);
        }
        let model = VariableModel {
            id: id.to_string(),
            name: name.to_string(),
            var_type: var_type.to_string(),
        };
        self.variables.push(model.clone());
        Ok(model)
    }

    /// Returns the old name when the variable exists.
    pub fn rename(&mut self, id: &str, new_name: &str) -> Option<String> {
        let model = self.variables.iter_mut().find(|v| v.id == id)?;
        let old = std::mem::replace(&mut model.name, new_name.to_string());
        Some(old)
    }

    pub fn remove(&mut self, id: &str) -> Option<VariableModel> {
        let index = self.variables.iter().position(|v| v.id == id)?;
        Some(self.variables.remove(index))
    }

    pub fn clear(&mut self) {
        self.variables.clear();
    }
}
