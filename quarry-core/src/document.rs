//! Facts a parser extracts from one source file

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedFacts {
    pub lines: usize,
    pub classes: Vec<ClassFact>,
    /// Module-level functions only; methods live on their class.
    pub functions: Vec<FunctionFact>,
    pub imports: Vec<ImportFact>,
    pub usages: Vec<UsageFact>,
    pub chunks: Vec<ChunkFact>,
}

impl ParsedFacts {
    pub fn method_count(&self) -> usize {
        self.classes.iter().map(|c| c.methods.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassFact {
    pub name: String,
    pub line: usize,
    pub end_line: usize,
    pub docstring: Option<String>,
    pub bases: Vec<String>,
    pub methods: Vec<FunctionFact>,
}

/// A function or a method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionFact {
    pub name: String,
    pub line: usize,
    pub end_line: usize,
    pub docstring: Option<String>,
    pub args: Vec<String>,
    pub complexity: usize,
    pub is_async: bool,
}

/// One imported name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportFact {
    pub name: String,
    pub module: Option<String>,
    /// `import` or `from`
    pub import_type: String,
    pub line: usize,
}

/// One call site
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageFact {
    pub name: String,
    pub usage_type: String,
    pub line: usize,
}

/// Text unit that will later get an embedding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkFact {
    pub chunk_type: String,
    pub text: String,
    pub line: usize,
}

/// A file that could not be parsed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}
