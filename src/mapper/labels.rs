//! Sorted label sets

use std::collections::BTreeMap;
use std::fmt;

/// Reserved label holding the metric name
pub const METRIC_NAME_LABEL: &str = "__name__";

/// A single label pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label {
    pub name: String,
    pub value: String,
}

/// A label set sorted by name, without duplicate names
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Labels(Vec<Label>);

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of label `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|label| label.name.as_str().cmp(name))
            .ok()
            .map(|idx| self.0[idx].value.as_str())
    }

    /// Value of the `__name__` label
    pub fn metric_name(&self) -> Option<&str> {
        self.get(METRIC_NAME_LABEL)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<String, String>> for Labels {
    fn from(map: BTreeMap<String, String>) -> Self {
        Labels(
            map.into_iter()
                .map(|(name, value)| Label { name, value })
                .collect(),
        )
    }
}

impl FromIterator<(String, String)> for Labels {
    /// Later pairs win over earlier ones with the same name.
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        iter.into_iter().collect::<BTreeMap<_, _>>().into()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = self.metric_name() {
            write!(f, "{}", name)?;
        }
        write!(f, "{{")?;
        let mut first = true;
        for label in self.0.iter().filter(|l| l.name != METRIC_NAME_LABEL) {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}=\"{}\"", label.name, label.value)?;
            first = false;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_sorted_and_deduped() {
        let labels: Labels = vec![
            ("zone".to_string(), "a".to_string()),
            ("__name__".to_string(), "cpu".to_string()),
            ("zone".to_string(), "b".to_string()),
        ]
        .into_iter()
        .collect();

        let names: Vec<&str> = labels.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["__name__", "zone"]);
        assert_eq!(labels.get("zone"), Some("b"));
        assert_eq!(labels.get("missing"), None);
    }

    #[test]
    fn test_display() {
        let labels: Labels = vec![
            ("__name__".to_string(), "cpu".to_string()),
            ("ID".to_string(), "c_1".to_string()),
            ("unit".to_string(), "W".to_string()),
        ]
        .into_iter()
        .collect();
        assert_eq!(labels.to_string(), "cpu{ID=\"c_1\", unit=\"W\"}");
    }
}
