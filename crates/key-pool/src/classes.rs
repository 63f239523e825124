//! Operation classes and their static credential assignment

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{Error, Result};

/// A named category of remote work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    GenerateQuestions,
    SolveQuestion,
    GenerateAudio,
    AnalyzePatterns,
    GenerateImage,
}

impl OperationClass {
    pub const ALL: [OperationClass; 5] = [
        OperationClass::GenerateQuestions,
        OperationClass::SolveQuestion,
        OperationClass::GenerateAudio,
        OperationClass::AnalyzePatterns,
        OperationClass::GenerateImage,
    ];

    /// Stable snake_case name, used in URLs, config keys and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationClass::GenerateQuestions => "generate_questions",
            OperationClass::SolveQuestion => "solve_question",
            OperationClass::GenerateAudio => "generate_audio",
            OperationClass::AnalyzePatterns => "analyze_patterns",
            OperationClass::GenerateImage => "generate_image",
        }
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        OperationClass::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| Error::UnknownOperation(s.to_string()))
    }
}

/// Which credential an operation class is pinned to.
///
/// Deserializes from `"primary"`, `"secondary"` or a bare ring index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawClass")]
pub enum CredentialClass {
    Primary,
    Secondary,
    Index(usize),
}

impl CredentialClass {
    /// Ring index this class resolves to.
    pub fn index(&self) -> usize {
        match self {
            CredentialClass::Primary => 0,
            CredentialClass::Secondary => 1,
            CredentialClass::Index(i) => *i,
        }
    }

    /// Label for usage reporting.
    pub fn label(&self) -> String {
        match self {
            CredentialClass::Primary => "primary".to_string(),
            CredentialClass::Secondary => "secondary".to_string(),
            CredentialClass::Index(i) => format!("index_{i}"),
        }
    }
}

impl fmt::Display for CredentialClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawClass {
    Named(String),
    Index(usize),
}

impl TryFrom<RawClass> for CredentialClass {
    type Error = Error;

    fn try_from(raw: RawClass) -> Result<Self> {
        match raw {
            RawClass::Index(i) => Ok(CredentialClass::Index(i)),
            RawClass::Named(name) => match name.to_ascii_lowercase().as_str() {
                "primary" => Ok(CredentialClass::Primary),
                "secondary" => Ok(CredentialClass::Secondary),
                _ => Err(Error::InvalidClass(name)),
            },
        }
    }
}

/// Static operation → credential-class mapping. Read-only after pool construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct ClassMap(BTreeMap<OperationClass, CredentialClass>);

impl ClassMap {
    /// Empty mapping (round-robin only pools).
    pub fn new() -> Self {
        Self::default()
    }

    /// Question generation, pattern analysis and images on the primary key;
    /// solving and audio on the secondary key.
    pub fn exam_defaults() -> Self {
        Self::new()
            .with(OperationClass::GenerateQuestions, CredentialClass::Primary)
            .with(OperationClass::SolveQuestion, CredentialClass::Secondary)
            .with(OperationClass::GenerateAudio, CredentialClass::Secondary)
            .with(OperationClass::AnalyzePatterns, CredentialClass::Primary)
            .with(OperationClass::GenerateImage, CredentialClass::Primary)
    }

    /// Builder-style insert, replacing any existing entry.
    pub fn with(mut self, operation: OperationClass, class: CredentialClass) -> Self {
        self.0.insert(operation, class);
        self
    }

    /// Overlay another mapping on top of this one.
    pub fn merged(mut self, overrides: &ClassMap) -> Self {
        for (op, class) in overrides.iter() {
            self.0.insert(op, class);
        }
        self
    }

    pub fn get(&self, operation: OperationClass) -> Option<CredentialClass> {
        self.0.get(&operation).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (OperationClass, CredentialClass)> + '_ {
        self.0.iter().map(|(op, class)| (*op, *class))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Smallest ring size that satisfies every entry.
    pub fn required_size(&self) -> usize {
        self.0.values().map(|c| c.index() + 1).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_round_trips_through_str() {
        for op in OperationClass::ALL {
            assert_eq!(op.as_str().parse::<OperationClass>().unwrap(), op);
        }
    }

    #[test]
    fn unknown_operation_rejected() {
        let err = "summarize_pdf".parse::<OperationClass>().unwrap_err();
        assert!(matches!(err, Error::UnknownOperation(ref s) if s == "summarize_pdf"));
    }

    #[test]
    fn exam_defaults_match_partitioning() {
        let map = ClassMap::exam_defaults();
        assert_eq!(
            map.get(OperationClass::GenerateQuestions),
            Some(CredentialClass::Primary)
        );
        assert_eq!(
            map.get(OperationClass::SolveQuestion),
            Some(CredentialClass::Secondary)
        );
        assert_eq!(
            map.get(OperationClass::GenerateAudio),
            Some(CredentialClass::Secondary)
        );
        assert_eq!(map.required_size(), 2);
    }

    #[test]
    fn empty_map_requires_nothing() {
        assert_eq!(ClassMap::new().required_size(), 0);
        assert!(ClassMap::new().is_empty());
    }

    #[test]
    fn merged_overrides_entries() {
        let overrides = ClassMap::new().with(OperationClass::GenerateImage, CredentialClass::Index(2));
        let map = ClassMap::exam_defaults().merged(&overrides);
        assert_eq!(
            map.get(OperationClass::GenerateImage),
            Some(CredentialClass::Index(2))
        );
        assert_eq!(map.required_size(), 3);
    }

    #[test]
    fn deserializes_named_and_index_classes() {
        let map: ClassMap = toml::from_str(
            r#"
generate_questions = "primary"
solve_question = "Secondary"
generate_image = 3
"#,
        )
        .unwrap();
        assert_eq!(
            map.get(OperationClass::GenerateQuestions),
            Some(CredentialClass::Primary)
        );
        assert_eq!(
            map.get(OperationClass::SolveQuestion),
            Some(CredentialClass::Secondary)
        );
        assert_eq!(
            map.get(OperationClass::GenerateImage),
            Some(CredentialClass::Index(3))
        );
        assert_eq!(map.get(OperationClass::GenerateAudio), None);
    }

    #[test]
    fn rejects_unknown_class_name() {
        let result: std::result::Result<ClassMap, _> =
            toml::from_str(r#"generate_questions = "tertiary""#);
        assert!(result.is_err());
    }
}
