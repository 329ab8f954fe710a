//! Named choices for enum-like fields.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Index;

/// An ordered set of `name -> value` pairs.
///
/// Lookups work both ways: [`Choices::get`] maps a name to its value and
/// [`Choices::name_of`] maps a stored value back to its name. Iteration
/// yields `(value, name)` in declaration order, which is the shape used for
/// column choice lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choices<V> {
    entries: Vec<(String, V)>,
}

impl<V: PartialEq> Choices<V> {
    /// Builds choices from `(name, value)` pairs. Later duplicates of a name
    /// replace earlier ones in place.
    pub fn from_pairs<I, N>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<String>,
    {
        let mut entries: Vec<(String, V)> = Vec::new();
        for (name, value) in pairs {
            let name = name.into();
            match entries.iter_mut().find(|(n, _)| *n == name) {
                Some(entry) => entry.1 = value,
                None => entries.push((name, value)),
            }
        }
        Self { entries }
    }

    /// Returns the value registered under `name`.
    pub fn get(&self, name: &str) -> Option<&V> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Returns the name of `value`.
    pub fn name_of(&self, value: &V) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, v)| v == value)
            .map(|(n, _)| n.as_str())
    }

    pub fn contains_value(&self, value: &V) -> bool {
        self.name_of(value).is_some()
    }

    /// Iterates `(value, name)` pairs in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&V, &str)> {
        self.entries.iter().map(|(n, v)| (v, n.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Choices<String> {
    /// Builds choices whose values equal their names.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_pairs(names.into_iter().map(|n| {
            let n = n.into();
            (n.clone(), n)
        }))
    }
}

impl<V: PartialEq> Index<&str> for Choices<V> {
    type Output = V;

    /// Panics if `name` is not a registered choice.
    fn index(&self, name: &str) -> &V {
        match self.get(name) {
            Some(value) => value,
            None => panic!("unknown choice: {name}"),
        }
    }
}

impl<V> fmt::Display for Choices<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.entries.iter().map(|(n, _)| n.as_str()).collect();
        f.write_str(&names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_map_to_themselves() {
        let choices = Choices::from_names(["a", "b", "c"]);

        assert_eq!(choices.get("a").map(String::as_str), Some("a"));
        assert_eq!(choices["b"], "b");
        assert_eq!(choices.name_of(&"c".to_string()), Some("c"));
        assert_eq!(
            choices.iter().collect::<Vec<_>>(),
            vec![
                (&"a".to_string(), "a"),
                (&"b".to_string(), "b"),
                (&"c".to_string(), "c")
            ]
        );
        assert_eq!(choices.to_string(), "a, b, c");
    }

    #[test]
    fn pairs_support_reverse_lookup() {
        let choices = Choices::from_pairs([("a", "A".to_string()), ("b", "B".to_string())]);

        assert_eq!(choices["a"], "A");
        assert_eq!(choices.name_of(&"B".to_string()), Some("b"));
        assert_eq!(choices.get("A"), None);
        assert!(!choices.contains_value(&"a".to_string()));
    }

    #[test]
    fn integer_values() {
        let choices = Choices::from_pairs([("a", 1), ("b", 2), ("c", 3)]);

        assert_eq!(choices.iter().map(|(v, _)| *v).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(choices.name_of(&2), Some("b"));
        assert_eq!(choices.len(), 3);
    }

    #[test]
    fn duplicate_names_replace_in_place() {
        let choices = Choices::from_pairs([("a", 1), ("b", 2), ("a", 9)]);
        assert_eq!(choices.len(), 2);
        assert_eq!(choices["a"], 9);
        assert_eq!(choices.to_string(), "a, b");
    }

    #[test]
    #[should_panic(expected = "unknown choice")]
    fn index_unknown_panics() {
        let choices = Choices::from_names(["a"]);
        let _ = &choices["z"];
    }
}
