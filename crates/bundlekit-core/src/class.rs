use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ArtifactClass {
    RuntimeImage,
    CompatLayer,
}

impl ArtifactClass {
    pub const ALL: [ArtifactClass; 2] = [Self::RuntimeImage, Self::CompatLayer];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RuntimeImage => "runtime-image",
            Self::CompatLayer => "compat-layer",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "runtime-image" | "runtime" => Some(Self::RuntimeImage),
            "compat-layer" | "compat" => Some(Self::CompatLayer),
            _ => None,
        }
    }
}

impl fmt::Display for ArtifactClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
