use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LoadStyle {
    DEFAULT,

    YAML,
}

/// Output format for pretty-printing CLI results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Format {
    Json,
    Yaml,
    None,
}

impl Format {
    pub fn format(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => Format::Json,
            "yaml" | "yml" => Format::Yaml,
            _ => Format::None,
        }
    }
}
