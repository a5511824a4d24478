//! Turns free-text critique into corrective instructions.
//!
//! Feedback is matched against three rule classes:
//! - requirement phrases ("missing X", "add X", "needs X", ...) that become
//!   instructions carrying the captured phrase
//! - technical markers (import failures, syntax errors, ...) that map to a
//!   fixed instruction
//! - testing refinements, only when the stage receiving the feedback writes
//!   tests
//!
//! The enhanced description contains instructions only. It never says that
//! the work is being redone or quotes the critique itself.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::agents::StageKind;

/// Requirement and testing instructions kept in an enhanced description.
const MAX_CLAUSES_PER_CLASS: usize = 3;

/// Which rule class produced an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstructionClass {
    Requirement,
    Technical,
    Testing,
}

/// A corrective clause derived from feedback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub class: InstructionClass,
    pub text: String,
    /// Higher weights sort first.
    pub weight: u8,
}

struct RequirementRule {
    pattern: Regex,
    template: &'static str,
    weight: u8,
}

struct FixedRule {
    pattern: Regex,
    instruction: &'static str,
    weight: u8,
}

fn requirement(pattern: &str, template: &'static str, weight: u8) -> RequirementRule {
    RequirementRule {
        pattern: Regex::new(pattern).expect("Invalid regex: requirement rule"),
        template,
        weight,
    }
}

fn fixed(pattern: &str, instruction: &'static str, weight: u8) -> FixedRule {
    FixedRule {
        pattern: Regex::new(pattern).expect("Invalid regex: fixed rule"),
        instruction,
        weight,
    }
}

// Patterns run on lowercased feedback. The captured phrase ends at the next
// sentence terminator.
static REQUIREMENT_RULES: LazyLock<Vec<RequirementRule>> = LazyLock::new(|| {
    vec![
        requirement(r"\blacks tests for\s+([^.!?]+)", "Include tests for {}", 9),
        requirement(r"\bmissing\s+([^.!?]+)", "Include {}", 9),
        requirement(r"\badd\s+([^.!?]+)", "Add {}", 8),
        requirement(r"\binclude\s+([^.!?]+)", "Include {}", 8),
        requirement(r"\bensure\s+([^.!?]+)", "Ensure {}", 7),
        requirement(r"\bconsider\s+([^.!?]+)", "Consider {}", 6),
        requirement(r"\bneeds?\s+([^.!?]+)", "Needs {}", 8),
        requirement(r"\brequires?\s+([^.!?]+)", "Requires {}", 9),
        requirement(r"\bcould benefit from\s+([^.!?]+)", "Include {}", 7),
    ]
});

static TECHNICAL_RULES: LazyLock<Vec<FixedRule>> = LazyLock::new(|| {
    vec![
        fixed(
            r"importerror|import error|modulenotfounderror",
            "Ensure all necessary imports are included",
            9,
        ),
        fixed(r"execution failed", "Make code executable and testable", 9),
        fixed(r"syntax error", "Use correct syntax", 10),
        fixed(r"dependency issues", "Include all required dependencies", 8),
        fixed(r"configuration[^.!?]*issues", "Include proper configuration", 7),
    ]
});

static TESTING_RULES: LazyLock<Vec<FixedRule>> = LazyLock::new(|| {
    vec![
        fixed(r"test coverage", "comprehensive test coverage", 8),
        fixed(r"edge cases", "edge case testing", 7),
        fixed(r"integration tests", "integration tests", 8),
        fixed(r"performance tests", "performance testing", 6),
        fixed(r"error handling", "proper error handling", 8),
        fixed(r"international characters", "international character support", 7),
        fixed(r"length constraints", "length validation", 6),
        fixed(r"cleanup procedures", "test cleanup and isolation", 7),
    ]
});

/// Converts feedback into instructions and enhanced task descriptions.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeedbackTransformer;

impl FeedbackTransformer {
    pub fn new() -> Self {
        Self
    }

    /// Extract instructions from `feedback` for the stage that will act on it.
    ///
    /// Results are deduplicated by class and lowercased text, then sorted by
    /// descending weight with rule order preserved among equal weights.
    pub fn parse(&self, feedback: &str, receiving: StageKind) -> Vec<Instruction> {
        let lowered = feedback.to_lowercase();
        let mut instructions = Vec::new();

        for rule in REQUIREMENT_RULES.iter() {
            for caps in rule.pattern.captures_iter(&lowered) {
                let Some(phrase) = caps.get(1).map(|m| clean_phrase(m.as_str())) else {
                    continue;
                };
                if phrase.is_empty() {
                    continue;
                }
                instructions.push(Instruction {
                    class: InstructionClass::Requirement,
                    text: rule.template.replace("{}", &phrase),
                    weight: rule.weight,
                });
            }
        }

        for rule in TECHNICAL_RULES.iter() {
            if rule.pattern.is_match(&lowered) {
                instructions.push(Instruction {
                    class: InstructionClass::Technical,
                    text: rule.instruction.to_string(),
                    weight: rule.weight,
                });
            }
        }

        if receiving.is_testing() {
            for rule in TESTING_RULES.iter() {
                if rule.pattern.is_match(&lowered) {
                    instructions.push(Instruction {
                        class: InstructionClass::Testing,
                        text: rule.instruction.to_string(),
                        weight: rule.weight,
                    });
                }
            }
        }

        let mut seen = HashSet::new();
        instructions.retain(|i| seen.insert((i.class, i.text.to_lowercase())));
        instructions.sort_by(|a, b| b.weight.cmp(&a.weight));
        instructions
    }

    /// Append instruction clauses to `description`.
    ///
    /// Adds up to three requirement instructions, up to three testing
    /// instructions and every technical instruction, in that order. Returns
    /// the description unchanged when there is nothing to add.
    pub fn enhance(&self, description: &str, instructions: &[Instruction]) -> String {
        let requirements = texts_of(instructions, InstructionClass::Requirement);
        let testing = texts_of(instructions, InstructionClass::Testing);
        let technical = texts_of(instructions, InstructionClass::Technical);

        let mut clauses = Vec::new();
        if !requirements.is_empty() {
            let top = &requirements[..requirements.len().min(MAX_CLAUSES_PER_CLASS)];
            clauses.push(format!("Requirements: {}", top.join(", ")));
        }
        if !testing.is_empty() {
            let top = &testing[..testing.len().min(MAX_CLAUSES_PER_CLASS)];
            clauses.push(format!("Testing: {}", top.join(", ")));
        }
        if !technical.is_empty() {
            clauses.push(technical.join(", "));
        }

        if clauses.is_empty() {
            return description.to_string();
        }

        let base = description.trim_end().trim_end_matches('.');
        format!("{}. {}", base, clauses.join(". "))
    }

    /// Parse `feedback` and enhance `description` with the result.
    pub fn enhance_description(
        &self,
        description: &str,
        feedback: &str,
        receiving: StageKind,
    ) -> String {
        let instructions = self.parse(feedback, receiving);
        self.enhance(description, &instructions)
    }
}

fn texts_of(instructions: &[Instruction], class: InstructionClass) -> Vec<&str> {
    instructions
        .iter()
        .filter(|i| i.class == class)
        .map(|i| i.text.as_str())
        .collect()
}

/// Collapse whitespace and drop trailing separators from a captured phrase.
fn clean_phrase(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(&[',', ';', ':'][..])
        .trim()
        .to_string()
}
