use std::fmt::{Display, Formatter};

/// Value types a connection can be restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValueType {
    Number,
    String,
    Boolean,
    Colour,
    Array,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Number => "Number",
            ValueType::String => "String",
            ValueType::Boolean => "Boolean",
            ValueType::Colour => "Colour",
            ValueType::Array => "Array",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "Number" => Some(ValueType::Number),
            "String" => Some(ValueType::String),
            "Boolean" => Some(ValueType::Boolean),
            "Colour" => Some(ValueType::Colour),
            "Array" => Some(ValueType::Array),
            _ => None,
        }
    }
}

impl Display for ValueType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The check list of a connection. `Any` accepts everything.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TypeCheck {
    #[default]
    Any,
    OneOf(Vec<ValueType>),
}

impl TypeCheck {
    pub fn one(value_type: ValueType) -> Self {
        TypeCheck::OneOf(vec![value_type])
    }

    pub fn of(types: &[ValueType]) -> Self {
        if types.is_empty() {
            return TypeCheck::Any;
        }
        let mut list = types.to_vec();
        list.sort();
        list.dedup();
        TypeCheck::OneOf(list)
    }

    pub fn types(&self) -> Option<&[ValueType]> {
        match self {
            TypeCheck::Any => None,
            TypeCheck::OneOf(types) => Some(types),
        }
    }

    /// Two checks are compatible when either side is unrestricted or the
    /// lists share at least one type.
    pub fn intersects(&self, other: &TypeCheck) -> bool {
        match (self, other) {
            (TypeCheck::Any, _) | (_, TypeCheck::Any) => true,
            (TypeCheck::OneOf(left), TypeCheck::OneOf(right)) => {
                left.iter().any(|t| right.contains(t))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrestricted_checks_accept_everything() {
        assert!(TypeCheck::Any.intersects(&TypeCheck::Any));
        assert!(TypeCheck::Any.intersects(&TypeCheck::one(ValueType::Number)));
        assert!(TypeCheck::one(ValueType::Boolean).intersects(&TypeCheck::Any));
    }

    #[test]
    fn lists_need_a_shared_type() {
        let numeric = TypeCheck::of(&[ValueType::Number, ValueType::String]);
        let textual = TypeCheck::of(&[ValueType::String, ValueType::Colour]);
        assert!(numeric.intersects(&textual));
        assert!(textual.intersects(&numeric));
        assert!(!TypeCheck::one(ValueType::Number).intersects(&TypeCheck::one(ValueType::Boolean)));
    }

    #[test]
    fn empty_list_is_unrestricted() {
        assert_eq!(TypeCheck::of(&[]), TypeCheck::Any);
        assert_eq!(ValueType::parse("Colour"), Some(ValueType::Colour));
        assert_eq!(ValueType::parse("colour"), None);
    }
}
