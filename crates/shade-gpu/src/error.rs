use shade_core::{ExprError, GenerateError, ParseError};

#[derive(Debug)]
pub enum EffectError {
    Parse(ParseError),
    Generate(GenerateError),
    /// A texture size expression failed to evaluate.
    Expr { texture: String, error: ExprError },
    /// A named resource is missing or was used incorrectly.
    Resource(String),
    /// The backend rejected the generated shader or pipeline for a pass.
    Pipeline { pass: u32, message: String },
    /// Operation not valid in the effect's current lifecycle state.
    State(String),
    Config(serde_yaml::Error),
    Image(image::ImageError),
    Io(std::io::Error),
}

impl std::fmt::Display for EffectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(e) => write!(f, "Effect parse error: {}", e),
            Self::Generate(e) => write!(f, "Code generation error: {}", e),
            Self::Expr { texture, error } => {
                write!(f, "Cannot size texture '{}': {}", texture, error)
            }
            Self::Resource(msg) => write!(f, "Resource error: {}", msg),
            Self::Pipeline { pass, message } => {
                write!(f, "Pipeline error in PASS_{}: {}", pass, message)
            }
            Self::State(msg) => write!(f, "Invalid effect state: {}", msg),
            Self::Config(e) => write!(f, "Overrides parse error: {}", e),
            Self::Image(e) => write!(f, "Image error: {}", e),
            Self::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for EffectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Parse(e) => Some(e),
            Self::Generate(e) => Some(e),
            Self::Expr { error, .. } => Some(error),
            Self::Config(e) => Some(e),
            Self::Image(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ParseError> for EffectError {
    fn from(e: ParseError) -> Self {
        Self::Parse(e)
    }
}

impl From<GenerateError> for EffectError {
    fn from(e: GenerateError) -> Self {
        Self::Generate(e)
    }
}

impl From<serde_yaml::Error> for EffectError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Config(e)
    }
}

impl From<image::ImageError> for EffectError {
    fn from(e: image::ImageError) -> Self {
        Self::Image(e)
    }
}

impl From<std::io::Error> for EffectError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
