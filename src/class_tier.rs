//! Race class tiers from free-text class descriptions.
//!
//! Rules are evaluated top to bottom and the first match wins. Several
//! patterns overlap ("Group 1" also matches a generic "group" rule, "BM90"
//! also matches a generic benchmark rule), so the order of the list is part
//! of its meaning. When no rule matches, the venue category decides.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::reference::ReferenceError;
use crate::taxonomy::VenueCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RaceGrade {
    Group1,
    Group2,
    Group3,
    Listed,
}

impl RaceGrade {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Group1 => "G1",
            Self::Group2 => "G2",
            Self::Group3 => "G3",
            Self::Listed => "Listed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassRule {
    pub label: String,
    /// Case-insensitive regular expression matched against the class text.
    pub pattern: String,
    pub tier: u32,
    #[serde(default)]
    pub grade: Option<RaceGrade>,
}

impl ClassRule {
    fn new(label: &str, pattern: &str, tier: u32, grade: Option<RaceGrade>) -> Self {
        Self {
            label: label.to_string(),
            pattern: pattern.to_string(),
            tier,
            grade,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryFallback {
    pub metro: u32,
    pub provincial: u32,
    pub country: u32,
}

impl Default for CategoryFallback {
    fn default() -> Self {
        Self {
            metro: 45,
            provincial: 35,
            country: 25,
        }
    }
}

impl CategoryFallback {
    pub fn tier_for(&self, category: VenueCategory) -> u32 {
        match category {
            VenueCategory::Metro => self.metro,
            VenueCategory::Provincial => self.provincial,
            VenueCategory::Country => self.country,
        }
    }
}

pub fn default_class_rules() -> Vec<ClassRule> {
    vec![
        ClassRule::new(
            "group-1",
            r"\b(?:group|grade|gr)\.?\s*(?:1|one|i)\b|\bg1\b",
            100,
            Some(RaceGrade::Group1),
        ),
        ClassRule::new(
            "group-2",
            r"\b(?:group|grade|gr)\.?\s*(?:2|two|ii)\b|\bg2\b",
            90,
            Some(RaceGrade::Group2),
        ),
        ClassRule::new(
            "group-3",
            r"\b(?:group|grade|gr)\.?\s*(?:3|three|iii)\b|\bg3\b",
            80,
            Some(RaceGrade::Group3),
        ),
        ClassRule::new("group", r"\bgroup\b", 75, None),
        ClassRule::new("listed", r"\blisted\b|\blr\b", 70, Some(RaceGrade::Listed)),
        ClassRule::new(
            "benchmark-high",
            r"\b(?:benchmark|bm)\s*(?:[89]\d|1\d\d)\b",
            60,
            None,
        ),
        ClassRule::new("benchmark", r"\b(?:benchmark|bm)\s*\d*\b", 55, None),
        ClassRule::new("class-upper", r"\b(?:class|cl)\s*[1-3]\b", 40, None),
        ClassRule::new("class", r"\b(?:class|cl)\s*\d+\b", 30, None),
        ClassRule::new("maiden", r"\bmaiden\b|\bmdn\b", 20, None),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassAssignment {
    pub tier: u32,
    pub grade: Option<RaceGrade>,
    /// Label of the matching rule, `None` when the venue fallback applied.
    pub rule: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClassTierRules {
    rules: Vec<(ClassRule, Regex)>,
    fallback: CategoryFallback,
}

impl ClassTierRules {
    pub fn compile(rules: &[ClassRule], fallback: CategoryFallback) -> Result<Self, ReferenceError> {
        let compiled = rules
            .iter()
            .map(|rule| {
                RegexBuilder::new(&rule.pattern)
                    .case_insensitive(true)
                    .build()
                    .map(|regex| (rule.clone(), regex))
                    .map_err(|source| ReferenceError::InvalidClassPattern {
                        label: rule.label.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            rules: compiled,
            fallback,
        })
    }

    pub fn builtin() -> Result<Self, ReferenceError> {
        Self::compile(&default_class_rules(), CategoryFallback::default())
    }

    pub fn classify(&self, class_text: &str, category: VenueCategory) -> ClassAssignment {
        self.rules
            .iter()
            .find(|(_, regex)| regex.is_match(class_text))
            .map(|(rule, _)| ClassAssignment {
                tier: rule.tier,
                grade: rule.grade,
                rule: Some(rule.label.clone()),
            })
            .unwrap_or(ClassAssignment {
                tier: self.fallback.tier_for(category),
                grade: None,
                rule: None,
            })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

pub fn is_maiden(class_text: &str) -> bool {
    class_text.to_ascii_lowercase().contains("maiden")
}

pub fn is_handicap(class_text: &str) -> bool {
    let lower = class_text.to_ascii_lowercase();
    lower.contains("handicap") || lower.contains("hcp")
}
