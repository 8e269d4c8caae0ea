//! GPU-free half of shade: effect source in, validated IR and per-pass WGSL
//! modules out.

pub mod artifact;
pub mod codegen;
pub mod compat;
pub mod expr;
pub mod ir;
pub mod parser;

pub use artifact::{build_artifacts, Artifacts};
pub use codegen::{generate, BindingKind, GenerateError, GeneratedModule, ResourceBinding};
pub use expr::{evaluate, Expr, ExprError};
pub use ir::{ShaderIr, TextureFormat, INPUT, OUTPUT};
pub use parser::{parse, ParseError};
