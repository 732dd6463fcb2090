//! Property-based test generators using proptest.
//!
//! Strategies produce data that passes [`crate::world_model`] validation
//! unless stated otherwise.

use faultdb_core::{Predicate, Value};
use proptest::prelude::*;

/// Strategy for arbitrary scalar values, including nulls and arrays.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Integer),
        (-1.0e9f64..1.0e9).prop_map(Value::Float),
        "[a-zA-Z0-9 ]{0,16}".prop_map(Value::Text),
        prop::collection::vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
        any::<i64>().prop_map(Value::Timestamp),
    ];
    leaf.prop_recursive(2, 16, 4, |inner| {
        prop::collection::vec(inner, 0..4).prop_map(Value::Array)
    })
}

/// Strategy for valid country names.
pub fn country_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Z][a-z]{1,11}").expect("Invalid regex")
}

/// Strategy for valid country codes.
pub fn country_code_strategy() -> impl Strategy<Value = i64> {
    1i64..=999
}

/// Strategy for `(name, code)` pairs with distinct codes.
pub fn countries_strategy(max: usize) -> impl Strategy<Value = Vec<(String, i64)>> {
    prop::collection::btree_map(country_code_strategy(), country_name_strategy(), 1..=max)
        .prop_map(|by_code| by_code.into_iter().map(|(code, name)| (name, code)).collect())
}

/// Strategy for predicates over the `code` attribute.
pub fn code_predicate_strategy() -> impl Strategy<Value = Predicate> {
    let simple = prop_oneof![
        country_code_strategy().prop_map(|c| Predicate::eq("code", c)),
        country_code_strategy().prop_map(|c| Predicate::lt("code", c)),
        country_code_strategy().prop_map(|c| Predicate::ge("code", c)),
        Just(Predicate::True),
    ]
    .boxed();
    (simple.clone(), simple, any::<bool>()).prop_map(|(a, b, both)| if both { a.and(b) } else { a.or(b) })
}

/// One change a test applies to a saved country.
#[derive(Debug, Clone, PartialEq)]
pub enum CountryEdit {
    /// Rename.
    Rename(String),
    /// New code.
    Recode(i64),
    /// Set or clear the motto.
    Motto(Option<String>),
}

/// Strategy for a single [`CountryEdit`].
pub fn country_edit_strategy() -> impl Strategy<Value = CountryEdit> {
    prop_oneof![
        country_name_strategy().prop_map(CountryEdit::Rename),
        country_code_strategy().prop_map(CountryEdit::Recode),
        proptest::option::of("[a-z ]{1,12}").prop_map(CountryEdit::Motto),
    ]
}

impl CountryEdit {
    /// Attribute the edit touches.
    pub fn attribute(&self) -> &'static str {
        match self {
            Self::Rename(_) => "name",
            Self::Recode(_) => "code",
            Self::Motto(_) => "motto",
        }
    }

    /// Value the edit writes.
    pub fn value(&self) -> Value {
        match self {
            Self::Rename(name) => Value::from(name.as_str()),
            Self::Recode(code) => Value::Integer(*code),
            Self::Motto(motto) => Value::from(motto.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faultdb_core::{AttributeDescription, AttributeType};

    proptest! {
        #[test]
        fn generated_names_and_codes_validate(name in country_name_strategy(), code in country_code_strategy()) {
            let name_attr = AttributeDescription::new("name", AttributeType::Text);
            let code_attr = AttributeDescription::new("code", AttributeType::Integer);
            prop_assert!(name_attr.validate(&Value::from(name.as_str())).is_empty());
            prop_assert!(code_attr.validate(&Value::Integer(code)).is_empty());
        }

        #[test]
        fn countries_have_distinct_codes(countries in countries_strategy(20)) {
            let mut codes: Vec<i64> = countries.iter().map(|(_, c)| *c).collect();
            codes.dedup();
            prop_assert_eq!(codes.len(), countries.len());
        }

        #[test]
        fn values_have_a_total_order(a in value_strategy(), b in value_strategy()) {
            prop_assert_eq!(a.cmp_total(&b), b.cmp_total(&a).reverse());
        }
    }
}
