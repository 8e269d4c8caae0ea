//! Directive parser: annotated shader source -> validated [`ShaderIr`].
//!
//! The scan is a single forward pass over lines. A [`ParserContext`] owns the
//! draft effect plus the block currently being accumulated; block-opening
//! directives and global directives `commit()` the open block. Nothing is
//! converted into IR types until the whole file has been read, at which
//! point [`validate`] checks every structural invariant and either returns a
//! complete IR or the first violation.

use std::collections::{BTreeSet, HashSet};

use crate::expr::Expr;
use crate::ir::{
    is_reserved_texture, AddressMode, EffectMetadata, FilterMode, ParamType, Parameter, Pass,
    PassStyle, Sampler, ShaderIr, SizeExpr, Texture, TextureFormat, INPUT, MAX_PASS_OUTPUTS,
    OUTPUT,
};

/// Prefix that marks a directive line.
pub const DIRECTIVE_MARKER: &str = "//!";

/// Identifiers the code generator declares itself.
pub const RESERVED_IDENTIFIERS: &[&str] = &[
    "default_sampler",
    "params",
    "scene",
    "main",
    "EffectParams",
    "SceneInfo",
];

#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    /// Malformed directive or a directive in the wrong place.
    Syntax { line: usize, message: String },
    /// The file is well-formed but violates an effect invariant.
    Validation(String),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Syntax { line, message } => write!(f, "line {}: {}", line, message),
            Self::Validation(msg) => write!(f, "validation error: {}", msg),
        }
    }
}

impl std::error::Error for ParseError {}

fn syntax(line: usize, message: impl Into<String>) -> ParseError {
    ParseError::Syntax {
        line,
        message: message.into(),
    }
}

fn invalid(message: impl Into<String>) -> ParseError {
    ParseError::Validation(message.into())
}

// ---------------------------------------------------------------------------
// Block accumulators
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ParameterBlock {
    line: usize,
    name: Option<String>,
    ty: Option<ParamType>,
    label: Option<String>,
    default: Option<f64>,
    min: Option<f64>,
    max: Option<f64>,
    step: Option<f64>,
}

#[derive(Debug, Default)]
struct TextureBlock {
    line: usize,
    name: Option<String>,
    source: Option<String>,
    format: Option<String>,
    width: Option<SizeExpr>,
    height: Option<SizeExpr>,
}

#[derive(Debug, Default)]
struct SamplerBlock {
    line: usize,
    name: Option<String>,
    filter: Option<FilterMode>,
    address: Option<AddressMode>,
}

#[derive(Debug, Default)]
struct CommonBlock {
    code: String,
}

#[derive(Debug, Default)]
struct PassBlock {
    line: usize,
    index: u32,
    inputs: Option<Vec<String>>,
    outputs: Option<Vec<String>>,
    block_size: Option<[u32; 3]>,
    num_threads: Option<[u32; 3]>,
    style: Option<PassStyle>,
    desc: Option<String>,
    code: String,
}

#[derive(Debug)]
enum Block {
    Parameter(ParameterBlock),
    Texture(TextureBlock),
    Sampler(SamplerBlock),
    Common(CommonBlock),
    Pass(PassBlock),
}

impl Block {
    fn kind(&self) -> &'static str {
        match self {
            Self::Parameter(_) => "PARAMETER",
            Self::Texture(_) => "TEXTURE",
            Self::Sampler(_) => "SAMPLER",
            Self::Common(_) => "COMMON",
            Self::Pass(_) => "PASS",
        }
    }
}

/// Everything collected so far, before validation.
#[derive(Debug, Default)]
struct Draft {
    version: Option<u32>,
    sort_name: Option<String>,
    uses: BTreeSet<String>,
    capabilities: BTreeSet<String>,
    parameters: Vec<ParameterBlock>,
    textures: Vec<TextureBlock>,
    samplers: Vec<SamplerBlock>,
    common: Option<CommonBlock>,
    passes: Vec<PassBlock>,
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct ParserContext {
    draft: Draft,
    current: Option<Block>,
}

/// Parse annotated effect source into a validated IR.
pub fn parse(source: &str) -> Result<ShaderIr, ParseError> {
    let mut ctx = ParserContext::default();
    for (i, line) in source.lines().enumerate() {
        ctx.feed_line(i + 1, line)?;
    }
    let ir = ctx.finish()?;
    tracing::debug!(
        "Parsed effect v{}: {} parameters, {} textures, {} samplers, {} passes",
        ir.metadata.version,
        ir.parameters.len(),
        ir.textures.len(),
        ir.samplers.len(),
        ir.passes.len()
    );
    Ok(ir)
}

impl ParserContext {
    /// Close the open block, if any, and move it into the draft.
    pub fn commit(&mut self) {
        let Some(block) = self.current.take() else {
            return;
        };
        match block {
            Block::Parameter(b) => self.draft.parameters.push(b),
            Block::Texture(b) => self.draft.textures.push(b),
            Block::Sampler(b) => self.draft.samplers.push(b),
            Block::Common(b) => self.draft.common = Some(b),
            Block::Pass(b) => self.draft.passes.push(b),
        }
    }

    /// End of input: commit the last block and validate.
    pub fn finish(mut self) -> Result<ShaderIr, ParseError> {
        self.commit();
        validate(self.draft)
    }

    pub fn feed_line(&mut self, line_no: usize, line: &str) -> Result<(), ParseError> {
        match line.trim_start().strip_prefix(DIRECTIVE_MARKER) {
            Some(rest) => {
                let rest = rest.trim();
                let (name, args) = match rest.split_once(char::is_whitespace) {
                    Some((name, args)) => (name, args.trim()),
                    None => (rest, ""),
                };
                self.directive(line_no, &name.to_ascii_uppercase(), args)
            }
            None => self.body_line(line_no, line),
        }
    }

    fn directive(&mut self, line_no: usize, name: &str, args: &str) -> Result<(), ParseError> {
        match name {
            "" => Err(syntax(line_no, "empty directive")),
            "VERSION" | "SORT_NAME" | "USE" | "CAPABILITY" => {
                self.commit();
                self.global(line_no, name, args)
            }
            "PARAMETER" | "TEXTURE" | "SAMPLER" | "COMMON" | "PASS" => {
                self.commit();
                self.open_block(line_no, name, args)
            }
            _ => self.sub_directive(line_no, name, args),
        }
    }

    fn global(&mut self, line_no: usize, name: &str, args: &str) -> Result<(), ParseError> {
        match name {
            "VERSION" => {
                if self.draft.version.is_some() {
                    return Err(syntax(line_no, "VERSION declared more than once"));
                }
                let version = args
                    .parse::<u32>()
                    .map_err(|_| syntax(line_no, format!("VERSION expects an integer, got '{}'", args)))?;
                self.draft.version = Some(version);
            }
            "SORT_NAME" => {
                if args.is_empty() {
                    return Err(syntax(line_no, "SORT_NAME requires a value"));
                }
                self.draft.sort_name = Some(args.to_string());
            }
            "USE" => {
                for flag in split_list(line_no, "USE", args)? {
                    self.draft.uses.insert(flag.to_ascii_lowercase());
                }
            }
            "CAPABILITY" => {
                for flag in split_list(line_no, "CAPABILITY", args)? {
                    self.draft.capabilities.insert(flag.to_ascii_lowercase());
                }
            }
            _ => unreachable!("not a global directive: {}", name),
        }
        Ok(())
    }

    fn open_block(&mut self, line_no: usize, name: &str, args: &str) -> Result<(), ParseError> {
        let explicit_name = || -> Result<Option<String>, ParseError> {
            if args.is_empty() {
                Ok(None)
            } else {
                parse_identifier(line_no, name, args).map(Some)
            }
        };
        let block = match name {
            "PARAMETER" => Block::Parameter(ParameterBlock {
                line: line_no,
                name: explicit_name()?,
                ..Default::default()
            }),
            "TEXTURE" => Block::Texture(TextureBlock {
                line: line_no,
                name: explicit_name()?,
                ..Default::default()
            }),
            "SAMPLER" => Block::Sampler(SamplerBlock {
                line: line_no,
                name: explicit_name()?,
                ..Default::default()
            }),
            "COMMON" => {
                if !args.is_empty() {
                    return Err(syntax(line_no, "COMMON takes no arguments"));
                }
                if self.draft.common.is_some() {
                    return Err(syntax(line_no, "only one COMMON block is allowed"));
                }
                Block::Common(CommonBlock::default())
            }
            "PASS" => {
                let index = args.parse::<u32>().map_err(|_| {
                    syntax(line_no, format!("PASS expects an index, got '{}'", args))
                })?;
                Block::Pass(PassBlock {
                    line: line_no,
                    index,
                    ..Default::default()
                })
            }
            _ => unreachable!("not a block directive: {}", name),
        };
        self.current = Some(block);
        Ok(())
    }

    fn sub_directive(&mut self, line_no: usize, name: &str, args: &str) -> Result<(), ParseError> {
        let Some(block) = self.current.as_mut() else {
            return Err(syntax(
                line_no,
                format!("{} must appear inside a block", name),
            ));
        };
        let kind = block.kind();
        let misplaced = || syntax(line_no, format!("unknown directive {} in {} block", name, kind));
        let duplicate = || syntax(line_no, format!("{} declared twice in {} block", name, kind));

        match block {
            Block::Parameter(p) => {
                let slot = match name {
                    "LABEL" => {
                        if p.label.is_some() {
                            return Err(duplicate());
                        }
                        p.label = Some(args.to_string());
                        return Ok(());
                    }
                    "DEFAULT" => &mut p.default,
                    "MIN" => &mut p.min,
                    "MAX" => &mut p.max,
                    "STEP" => &mut p.step,
                    _ => return Err(misplaced()),
                };
                if slot.is_some() {
                    return Err(duplicate());
                }
                *slot = Some(parse_number(line_no, name, args)?);
            }
            Block::Texture(t) => match name {
                "SOURCE" => set_once(&mut t.source, args.to_string(), duplicate)?,
                "FORMAT" => set_once(&mut t.format, args.to_string(), duplicate)?,
                "WIDTH" => set_once(&mut t.width, parse_size(line_no, name, args)?, duplicate)?,
                "HEIGHT" => set_once(&mut t.height, parse_size(line_no, name, args)?, duplicate)?,
                _ => return Err(misplaced()),
            },
            Block::Sampler(s) => match name {
                "FILTER" => {
                    let filter = FilterMode::parse(args).ok_or_else(|| {
                        syntax(line_no, format!("FILTER must be LINEAR or POINT, got '{}'", args))
                    })?;
                    set_once(&mut s.filter, filter, duplicate)?;
                }
                "ADDRESS" => {
                    let address = AddressMode::parse(args).ok_or_else(|| {
                        syntax(line_no, format!("ADDRESS must be CLAMP or WRAP, got '{}'", args))
                    })?;
                    set_once(&mut s.address, address, duplicate)?;
                }
                _ => return Err(misplaced()),
            },
            Block::Common(_) => return Err(misplaced()),
            Block::Pass(p) => match name {
                "IN" => set_once(&mut p.inputs, split_list(line_no, name, args)?, duplicate)?,
                "OUT" => set_once(&mut p.outputs, split_list(line_no, name, args)?, duplicate)?,
                "BLOCK_SIZE" => {
                    let dims = parse_dims(line_no, name, args)?;
                    let size = match dims.as_slice() {
                        [side] => [*side, *side, 1],
                        [x, y] => [*x, *y, 1],
                        [x, y, z] => [*x, *y, *z],
                        _ => unreachable!(),
                    };
                    set_once(&mut p.block_size, size, duplicate)?;
                }
                "NUM_THREADS" => {
                    let dims = parse_dims(line_no, name, args)?;
                    let mut threads = [1u32; 3];
                    threads[..dims.len()].copy_from_slice(&dims);
                    set_once(&mut p.num_threads, threads, duplicate)?;
                }
                "STYLE" => {
                    let style = PassStyle::parse(args).ok_or_else(|| {
                        syntax(line_no, format!("STYLE must be PS or CS, got '{}'", args))
                    })?;
                    set_once(&mut p.style, style, duplicate)?;
                }
                "DESC" => set_once(&mut p.desc, args.to_string(), duplicate)?,
                _ => return Err(misplaced()),
            },
        }
        Ok(())
    }

    fn body_line(&mut self, line_no: usize, line: &str) -> Result<(), ParseError> {
        let trimmed = line.trim();
        let ignorable = trimmed.is_empty() || trimmed.starts_with("//");
        let Some(block) = self.current.as_mut() else {
            if ignorable {
                return Ok(());
            }
            return Err(syntax(line_no, format!("code outside of any block: '{}'", trimmed)));
        };

        let kind = block.kind();
        let (name_slot, param_ty) = match block {
            Block::Common(b) => {
                push_code(&mut b.code, line);
                return Ok(());
            }
            Block::Pass(b) => {
                push_code(&mut b.code, line);
                return Ok(());
            }
            Block::Parameter(b) => (&mut b.name, Some(&mut b.ty)),
            Block::Texture(b) => (&mut b.name, None),
            Block::Sampler(b) => (&mut b.name, None),
        };

        if ignorable {
            return Ok(());
        }
        let Some((decl_name, decl_ty)) = parse_declaration(trimmed) else {
            tracing::debug!("line {}: no declaration in {} block: '{}'", line_no, kind, trimmed);
            return Ok(());
        };
        if let Some(existing) = name_slot.as_deref() {
            if existing != decl_name {
                return Err(syntax(
                    line_no,
                    format!(
                        "declaration '{}' does not match {} name '{}'",
                        decl_name, kind, existing
                    ),
                ));
            }
        } else {
            *name_slot = Some(decl_name);
        }
        if let Some(ty) = param_ty {
            ty.get_or_insert(ParamType::from_declared_type(&decl_ty));
        }
        Ok(())
    }
}

fn push_code(code: &mut String, line: &str) {
    code.push_str(line);
    code.push('\n');
}

fn set_once<T>(
    slot: &mut Option<T>,
    value: T,
    duplicate: impl FnOnce() -> ParseError,
) -> Result<(), ParseError> {
    if slot.is_some() {
        return Err(duplicate());
    }
    *slot = Some(value);
    Ok(())
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_identifier(line_no: usize, directive: &str, args: &str) -> Result<String, ParseError> {
    if is_identifier(args) {
        Ok(args.to_string())
    } else {
        Err(syntax(
            line_no,
            format!("{} name '{}' is not a valid identifier", directive, args),
        ))
    }
}

fn split_list(line_no: usize, directive: &str, args: &str) -> Result<Vec<String>, ParseError> {
    let items: Vec<String> = args.split(',').map(|s| s.trim().to_string()).collect();
    if items.iter().any(|s| s.is_empty()) {
        return Err(syntax(
            line_no,
            format!("{} expects a comma-separated list, got '{}'", directive, args),
        ));
    }
    Ok(items)
}

fn parse_number(line_no: usize, directive: &str, args: &str) -> Result<f64, ParseError> {
    args.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| syntax(line_no, format!("{} expects a number, got '{}'", directive, args)))
}

fn parse_dims(line_no: usize, directive: &str, args: &str) -> Result<Vec<u32>, ParseError> {
    let dims = split_list(line_no, directive, args)?
        .iter()
        .map(|s| s.parse::<u32>().ok().filter(|v| *v > 0))
        .collect::<Option<Vec<u32>>>()
        .ok_or_else(|| {
            syntax(
                line_no,
                format!("{} expects positive integers, got '{}'", directive, args),
            )
        })?;
    if dims.len() > 3 {
        return Err(syntax(
            line_no,
            format!("{} takes at most 3 values, got {}", directive, dims.len()),
        ));
    }
    Ok(dims)
}

fn parse_size(line_no: usize, directive: &str, args: &str) -> Result<SizeExpr, ParseError> {
    if let Ok(v) = args.parse::<u32>() {
        if v == 0 {
            return Err(syntax(line_no, format!("{} must be positive", directive)));
        }
        return Ok(SizeExpr::Literal(v));
    }
    Expr::parse(args)
        .map_err(|e| syntax(line_no, format!("{} expression '{}': {}", directive, args, e)))?;
    Ok(SizeExpr::Expr(args.to_string()))
}

/// Recognize a trailing `name: type` declaration. Leading attributes
/// (`@group(0)`, `@binding(3)`) and `var` / `var<...>` are skipped; the type
/// ends at `;`, `=` or a line comment.
fn parse_declaration(line: &str) -> Option<(String, String)> {
    let line = skip_attributes(line.trim());
    let line = match line.strip_prefix("var") {
        Some(rest) if rest.starts_with('<') => rest.split_once('>')?.1,
        Some(rest) if rest.starts_with(char::is_whitespace) => rest,
        _ => line,
    };
    let (name, ty) = line.split_once(':')?;
    let ty = ty.split("//").next().unwrap_or_default();
    let ty = ty.split([';', '=']).next().unwrap_or_default();
    let (name, ty) = (name.trim(), ty.trim());
    if !is_identifier(name) || ty.is_empty() {
        return None;
    }
    Some((name.to_string(), ty.to_string()))
}

fn skip_attributes(mut line: &str) -> &str {
    while let Some(rest) = line.strip_prefix('@') {
        let end = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        let rest = rest[end..].trim_start();
        line = match rest.strip_prefix('(') {
            Some(args) => match args.split_once(')') {
                Some((_, after)) => after.trim_start(),
                None => return "",
            },
            None => rest,
        };
    }
    line
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(draft: Draft) -> Result<ShaderIr, ParseError> {
    let version = draft.version.ok_or_else(|| invalid("VERSION is required"))?;

    let mut names: HashSet<String> = HashSet::new();
    let mut claim = |name: &str, what: &str| -> Result<(), ParseError> {
        if RESERVED_IDENTIFIERS.contains(&name) {
            return Err(invalid(format!("{} name '{}' is reserved", what, name)));
        }
        if !names.insert(name.to_string()) {
            return Err(invalid(format!("name '{}' is declared more than once", name)));
        }
        Ok(())
    };

    let mut parameters = Vec::with_capacity(draft.parameters.len());
    for block in draft.parameters {
        let param = validate_parameter(block)?;
        claim(&param.name, "parameter")?;
        parameters.push(param);
    }

    let mut textures = Vec::with_capacity(draft.textures.len());
    for block in draft.textures {
        let texture = validate_texture(block)?;
        claim(&texture.name, "texture")?;
        textures.push(texture);
    }

    let mut samplers = Vec::with_capacity(draft.samplers.len());
    for block in draft.samplers {
        let name = block.name.ok_or_else(|| {
            invalid(format!("SAMPLER block at line {} has no name", block.line))
        })?;
        let filter = block
            .filter
            .ok_or_else(|| invalid(format!("sampler '{}' is missing FILTER", name)))?;
        claim(&name, "sampler")?;
        samplers.push(Sampler {
            name,
            filter,
            address: block.address.unwrap_or_default(),
        });
    }

    let passes = validate_passes(draft.passes, &textures)?;

    Ok(ShaderIr {
        metadata: EffectMetadata {
            version,
            sort_name: draft.sort_name,
            uses: draft.uses,
            capabilities: draft.capabilities,
        },
        parameters,
        textures,
        samplers,
        passes,
        common_code: draft.common.map(|c| c.code).unwrap_or_default(),
    })
}

fn validate_parameter(block: ParameterBlock) -> Result<Parameter, ParseError> {
    let name = block
        .name
        .ok_or_else(|| invalid(format!("PARAMETER block at line {} has no name", block.line)))?;
    let missing = |field: &str| invalid(format!("parameter '{}' is missing {}", name, field));
    let default = block.default.ok_or_else(|| missing("DEFAULT"))?;
    let min = block.min.ok_or_else(|| missing("MIN"))?;
    let max = block.max.ok_or_else(|| missing("MAX"))?;
    let step = block.step.ok_or_else(|| missing("STEP"))?;
    if min > max {
        return Err(invalid(format!(
            "parameter '{}': MIN {} is greater than MAX {}",
            name, min, max
        )));
    }
    if default < min || default > max {
        return Err(invalid(format!(
            "parameter '{}': DEFAULT {} is outside [{}, {}]",
            name, default, min, max
        )));
    }
    if block.label.is_none() {
        tracing::warn!("Parameter '{}' has no LABEL", name);
    }
    Ok(Parameter {
        name,
        ty: block.ty.unwrap_or(ParamType::Float),
        default,
        min,
        max,
        step,
        label: block.label,
    })
}

fn validate_texture(block: TextureBlock) -> Result<Texture, ParseError> {
    let name = block
        .name
        .ok_or_else(|| invalid(format!("TEXTURE block at line {} has no name", block.line)))?;
    let format = match &block.format {
        Some(raw) => Some(TextureFormat::parse(raw).ok_or_else(|| {
            invalid(format!("texture '{}' has unknown FORMAT '{}'", name, raw))
        })?),
        None => None,
    };
    let sized = block.width.is_some() || block.height.is_some();

    match name.as_str() {
        INPUT => {
            if block.source.is_some() || sized || format.is_some() {
                return Err(invalid("INPUT is supplied externally and cannot declare SOURCE, FORMAT, WIDTH or HEIGHT"));
            }
        }
        OUTPUT => {
            if block.source.is_some() {
                return Err(invalid("OUTPUT cannot declare SOURCE"));
            }
            if block.width.is_some() != block.height.is_some() {
                return Err(invalid("OUTPUT must declare both WIDTH and HEIGHT or neither"));
            }
        }
        _ if block.source.is_some() => {
            if sized || format.is_some() {
                return Err(invalid(format!(
                    "texture '{}' has SOURCE and cannot declare FORMAT, WIDTH or HEIGHT",
                    name
                )));
            }
        }
        _ => {
            if format.is_none() {
                return Err(invalid(format!("texture '{}' is missing FORMAT", name)));
            }
            if block.width.is_none() || block.height.is_none() {
                return Err(invalid(format!(
                    "texture '{}' must declare WIDTH and HEIGHT",
                    name
                )));
            }
        }
    }

    Ok(Texture {
        name,
        source: block.source,
        format,
        width: block.width,
        height: block.height,
    })
}

fn validate_passes(mut blocks: Vec<PassBlock>, textures: &[Texture]) -> Result<Vec<Pass>, ParseError> {
    if blocks.is_empty() {
        return Err(invalid("effect declares no passes"));
    }
    blocks.sort_by_key(|b| b.index);

    for (i, block) in blocks.iter().enumerate() {
        if i > 0 && blocks[i - 1].index == block.index {
            return Err(invalid(format!("PASS {} is declared more than once", block.index)));
        }
        let expected = i as u32 + 1;
        if block.index != expected {
            return Err(invalid(format!(
                "pass indices must be contiguous starting at 1: expected PASS {}, found PASS {}",
                expected, block.index
            )));
        }
    }

    let known = |name: &str| is_reserved_texture(name) || textures.iter().any(|t| t.name == name);
    let file_backed = |name: &str| textures.iter().any(|t| t.name == name && t.source.is_some());
    let last_index = blocks.len() as u32;

    let mut passes = Vec::with_capacity(blocks.len());
    for block in blocks {
        let (index, line) = (block.index, block.line);
        let inputs = block
            .inputs
            .ok_or_else(|| invalid(format!("PASS {} (line {}) is missing IN", index, line)))?;
        let outputs = block
            .outputs
            .ok_or_else(|| invalid(format!("PASS {} (line {}) is missing OUT", index, line)))?;
        let style = block.style.unwrap_or_default();

        if outputs.len() > MAX_PASS_OUTPUTS {
            return Err(invalid(format!(
                "PASS {} writes {} textures; at most {} are allowed",
                index,
                outputs.len(),
                MAX_PASS_OUTPUTS
            )));
        }
        if style == PassStyle::Compute && (block.block_size.is_none() || block.num_threads.is_none()) {
            return Err(invalid(format!(
                "PASS {} requires both BLOCK_SIZE and NUM_THREADS",
                index
            )));
        }

        for name in inputs.iter().chain(&outputs) {
            if !known(name) {
                return Err(invalid(format!("PASS {} references unknown texture '{}'", index, name)));
            }
        }
        if let Some(dup) = first_duplicate(&inputs).or_else(|| first_duplicate(&outputs)) {
            return Err(invalid(format!("PASS {} lists '{}' twice", index, dup)));
        }
        if inputs.iter().any(|n| n == OUTPUT) {
            return Err(invalid(format!("PASS {} cannot read OUTPUT", index)));
        }
        if outputs.iter().any(|n| n == INPUT) {
            return Err(invalid(format!("PASS {} cannot write INPUT", index)));
        }
        if let Some(both) = inputs.iter().find(|n| outputs.contains(*n)) {
            return Err(invalid(format!("PASS {} both reads and writes '{}'", index, both)));
        }
        if let Some(src) = outputs.iter().find(|n| file_backed(n)) {
            return Err(invalid(format!(
                "PASS {} cannot write file-backed texture '{}'",
                index, src
            )));
        }

        let writes_output = outputs.iter().any(|n| n == OUTPUT);
        if index == last_index && !writes_output {
            return Err(invalid(format!(
                "the last pass (PASS {}) must write OUTPUT",
                index
            )));
        }
        if index != last_index && writes_output {
            return Err(invalid(format!(
                "only the last pass may write OUTPUT, but PASS {} does",
                index
            )));
        }

        passes.push(Pass {
            index,
            inputs,
            outputs,
            block_size: block.block_size,
            num_threads: block.num_threads,
            style,
            desc: block.desc,
            code: block.code,
        });
    }
    Ok(passes)
}

fn first_duplicate(items: &[String]) -> Option<&str> {
    items
        .iter()
        .enumerate()
        .find(|(i, item)| items[..*i].contains(*item))
        .map(|(_, item)| item.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHARPEN: &str = r#"//! VERSION 4
//! SORT_NAME Sharpen
//! USE MulAdd, Dynamic
//! CAPABILITY FP16

//! PARAMETER
//! LABEL Strength
//! DEFAULT 0.5
//! MIN 0
//! MAX 1
//! STEP 0.01
var<uniform> strength: f32;

//! PARAMETER radius
//! DEFAULT 2
//! MIN 1
//! MAX 4
//! STEP 1
radius: i32;

//! TEXTURE
//! WIDTH INPUT_WIDTH / 2
//! HEIGHT INPUT_HEIGHT / 2
//! FORMAT R16G16B16A16_FLOAT
var half_res: texture_2d<f32>;

//! SAMPLER
//! FILTER POINT
//! ADDRESS WRAP
var sam: sampler;

//! COMMON
fn luma(c: vec3<f32>) -> f32 {
    return dot(c, vec3<f32>(0.299, 0.587, 0.114));
}

//! PASS 2
//! IN half_res
//! OUT OUTPUT
//! STYLE PS
fn Pass2(pos: vec2<f32>) -> vec4<f32> {
    return textureSampleLevel(half_res, sam, pos, 0.0);
}

//! PASS 1
//! IN INPUT
//! OUT half_res
//! BLOCK_SIZE 16
//! NUM_THREADS 8, 8
//! DESC Downscale
fn Pass1(@builtin(global_invocation_id) id: vec3<u32>) {
    textureStore(half_res, id.xy, vec4<f32>(params.strength));
}
"#;

    fn expect_validation(src: &str) -> String {
        match parse(src) {
            Err(ParseError::Validation(msg)) => msg,
            other => panic!("Expected validation error, got: {:?}", other),
        }
    }

    fn expect_syntax(src: &str) -> (usize, String) {
        match parse(src) {
            Err(ParseError::Syntax { line, message }) => (line, message),
            other => panic!("Expected syntax error, got: {:?}", other),
        }
    }

    const MINIMAL_PASS: &str = "//! PASS 1\n//! IN INPUT\n//! OUT OUTPUT\n//! BLOCK_SIZE 8\n//! NUM_THREADS 8,8,1\nfn Pass1() {}\n";

    #[test]
    fn test_parse_full_effect() {
        let ir = parse(SHARPEN).unwrap();
        assert_eq!(ir.metadata.version, 4);
        assert_eq!(ir.metadata.sort_name.as_deref(), Some("Sharpen"));
        assert!(ir.metadata.uses_flag("muladd"));
        assert!(ir.metadata.uses_flag("DYNAMIC"));
        assert!(ir.metadata.has_capability("fp16"));

        assert_eq!(ir.parameters.len(), 2);
        assert_eq!(ir.parameters[0].name, "strength");
        assert_eq!(ir.parameters[0].ty, ParamType::Float);
        assert_eq!(ir.parameters[0].label.as_deref(), Some("Strength"));
        assert_eq!(ir.parameters[1].name, "radius");
        assert_eq!(ir.parameters[1].ty, ParamType::Int);

        let tex = ir.texture("half_res").unwrap();
        assert_eq!(tex.format, Some(TextureFormat::Rgba16Float));
        assert_eq!(tex.width, Some(SizeExpr::Expr("INPUT_WIDTH / 2".to_string())));

        let sam = ir.sampler("sam").unwrap();
        assert_eq!(sam.filter, FilterMode::Point);
        assert_eq!(sam.address, AddressMode::Wrap);

        assert!(ir.common_code.contains("fn luma"));
        assert_eq!(ir.passes.len(), 2);
        assert_eq!(ir.passes[0].index, 1);
        assert_eq!(ir.passes[0].block_size, Some([16, 16, 1]));
        assert_eq!(ir.passes[0].num_threads, Some([8, 8, 1]));
        assert_eq!(ir.passes[0].desc.as_deref(), Some("Downscale"));
        assert!(ir.passes[0].code.contains("fn Pass1"));
        assert_eq!(ir.passes[1].style, PassStyle::Pixel);
        assert_eq!(ir.passes[1].outputs, vec![OUTPUT.to_string()]);
    }

    #[test]
    fn test_passes_sorted_and_last_writes_output() {
        let ir = parse(SHARPEN).unwrap();
        let indices: Vec<u32> = ir.passes.iter().map(|p| p.index).collect();
        assert_eq!(indices, vec![1, 2]);
        assert!(ir.passes.last().unwrap().writes(OUTPUT));
    }

    #[test]
    fn test_missing_version() {
        let msg = expect_validation(MINIMAL_PASS);
        assert!(msg.contains("VERSION is required"), "{}", msg);
    }

    #[test]
    fn test_non_contiguous_passes() {
        let src = "//! VERSION 4\n//! TEXTURE t\n//! FORMAT rgba8unorm\n//! WIDTH 4\n//! HEIGHT 4\n\
                   //! PASS 1\n//! IN INPUT\n//! OUT t\n//! BLOCK_SIZE 8\n//! NUM_THREADS 8\n\
                   //! PASS 3\n//! IN t\n//! OUT OUTPUT\n//! BLOCK_SIZE 8\n//! NUM_THREADS 8\n";
        let msg = expect_validation(src);
        assert!(msg.contains("pass indices must be contiguous"), "{}", msg);
    }

    #[test]
    fn test_passes_start_at_one() {
        let src = format!("//! VERSION 4\n{}", MINIMAL_PASS.replace("PASS 1", "PASS 0"));
        let msg = expect_validation(&src);
        assert!(msg.contains("expected PASS 1, found PASS 0"), "{}", msg);
    }

    #[test]
    fn test_default_out_of_range_names_parameter() {
        let src = format!(
            "//! VERSION 4\n//! PARAMETER\n//! DEFAULT 5\n//! MIN 0\n//! MAX 1\n//! STEP 0.1\nvar<uniform> gain: f32;\n{}",
            MINIMAL_PASS
        );
        let msg = expect_validation(&src);
        assert!(msg.contains("'gain'"), "{}", msg);
        assert!(msg.contains("DEFAULT 5"), "{}", msg);
    }

    #[test]
    fn test_parameter_missing_step() {
        let src = format!(
            "//! VERSION 4\n//! PARAMETER gain\n//! DEFAULT 0\n//! MIN 0\n//! MAX 1\n{}",
            MINIMAL_PASS
        );
        assert!(expect_validation(&src).contains("missing STEP"));
    }

    #[test]
    fn test_compute_pass_requires_sizes() {
        let src = "//! VERSION 4\n//! PASS 1\n//! IN INPUT\n//! OUT OUTPUT\n//! NUM_THREADS 8\n";
        let msg = expect_validation(src);
        assert!(msg.contains("BLOCK_SIZE and NUM_THREADS"), "{}", msg);
    }

    #[test]
    fn test_pixel_pass_without_sizes() {
        let src = "//! VERSION 4\n//! PASS 1\n//! STYLE PS\n//! IN INPUT\n//! OUT OUTPUT\n";
        let ir = parse(src).unwrap();
        assert_eq!(ir.passes[0].num_threads, None);
        assert_eq!(ir.passes[0].effective_num_threads(), [8, 8, 1]);
    }

    #[test]
    fn test_output_rules() {
        let reads_output = "//! VERSION 4\n//! PASS 1\n//! STYLE PS\n//! IN OUTPUT\n//! OUT OUTPUT\n";
        assert!(expect_validation(reads_output).contains("cannot read OUTPUT"));

        let early_output = "//! VERSION 4\n//! TEXTURE t\n//! FORMAT rgba8unorm\n//! WIDTH 4\n//! HEIGHT 4\n\
                            //! PASS 1\n//! STYLE PS\n//! IN INPUT\n//! OUT OUTPUT, t\n\
                            //! PASS 2\n//! STYLE PS\n//! IN t\n//! OUT OUTPUT\n";
        assert!(expect_validation(early_output).contains("only the last pass may write OUTPUT"));

        let no_output = "//! VERSION 4\n//! TEXTURE t\n//! FORMAT rgba8unorm\n//! WIDTH 4\n//! HEIGHT 4\n\
                         //! PASS 1\n//! STYLE PS\n//! IN INPUT\n//! OUT t\n";
        assert!(expect_validation(no_output).contains("must write OUTPUT"));

        let writes_input = "//! VERSION 4\n//! PASS 1\n//! STYLE PS\n//! IN INPUT\n//! OUT OUTPUT, INPUT\n";
        assert!(expect_validation(writes_input).contains("cannot write INPUT"));
    }

    #[test]
    fn test_too_many_outputs() {
        let mut src = String::from("//! VERSION 4\n");
        let mut outs = Vec::new();
        for i in 0..8 {
            src.push_str(&format!(
                "//! TEXTURE t{}\n//! FORMAT rgba8unorm\n//! WIDTH 1\n//! HEIGHT 1\n",
                i
            ));
            outs.push(format!("t{}", i));
        }
        outs.push(OUTPUT.to_string());
        src.push_str(&format!("//! PASS 1\n//! STYLE PS\n//! IN INPUT\n//! OUT {}\n", outs.join(",")));
        assert!(expect_validation(&src).contains("at most 8"));
    }

    #[test]
    fn test_unknown_texture_format() {
        let src = format!(
            "//! VERSION 4\n//! TEXTURE t\n//! FORMAT R11G11B10_FLOAT\n//! WIDTH 4\n//! HEIGHT 4\n{}",
            MINIMAL_PASS
        );
        assert!(expect_validation(&src).contains("unknown FORMAT 'R11G11B10_FLOAT'"));
    }

    #[test]
    fn test_source_texture_excludes_size() {
        let src = format!(
            "//! VERSION 4\n//! TEXTURE lut\n//! SOURCE lut.png\n//! WIDTH 4\n{}",
            MINIMAL_PASS
        );
        assert!(expect_validation(&src).contains("has SOURCE"));
    }

    #[test]
    fn test_unknown_texture_in_pass() {
        let src = MINIMAL_PASS.replace("IN INPUT", "IN INPUT, missing");
        let msg = expect_validation(&format!("//! VERSION 4\n{}", src));
        assert!(msg.contains("unknown texture 'missing'"), "{}", msg);
    }

    #[test]
    fn test_sub_directive_outside_block() {
        let (line, msg) = expect_syntax("//! VERSION 4\n//! MIN 0\n");
        assert_eq!(line, 2);
        assert!(msg.contains("MIN must appear inside a block"));
    }

    #[test]
    fn test_sub_directive_wrong_block() {
        let (line, msg) = expect_syntax("//! VERSION 4\n//! SAMPLER s\n//! MIN 0\n");
        assert_eq!(line, 3);
        assert!(msg.contains("MIN in SAMPLER block"), "{}", msg);
    }

    #[test]
    fn test_malformed_number() {
        let (line, msg) = expect_syntax("//! VERSION 4\n//! PARAMETER p\n//! DEFAULT 0.5x\n");
        assert_eq!(line, 3);
        assert!(msg.contains("DEFAULT expects a number"));
    }

    #[test]
    fn test_malformed_size_expression() {
        let (_, msg) = expect_syntax("//! VERSION 4\n//! TEXTURE t\n//! WIDTH (INPUT_WIDTH / 2\n");
        assert!(msg.contains("WIDTH expression"), "{}", msg);
    }

    #[test]
    fn test_duplicate_sub_directive() {
        let (_, msg) = expect_syntax("//! VERSION 4\n//! PARAMETER p\n//! MIN 0\n//! MIN 1\n");
        assert!(msg.contains("MIN declared twice"));
    }

    #[test]
    fn test_code_outside_block() {
        let (line, _) = expect_syntax("//! VERSION 4\n\n// a comment\nfn stray() {}\n");
        assert_eq!(line, 4);
    }

    #[test]
    fn test_declaration_must_match_explicit_name() {
        let (_, msg) = expect_syntax("//! VERSION 4\n//! SAMPLER a\nvar b: sampler;\n");
        assert!(msg.contains("does not match"));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let src = format!(
            "//! VERSION 4\n//! SAMPLER s\n//! FILTER LINEAR\n//! SAMPLER s\n//! FILTER POINT\n{}",
            MINIMAL_PASS
        );
        assert!(expect_validation(&src).contains("declared more than once"));
    }

    #[test]
    fn test_reserved_identifier_rejected() {
        let src = format!("//! VERSION 4\n//! SAMPLER params\n//! FILTER LINEAR\n{}", MINIMAL_PASS);
        assert!(expect_validation(&src).contains("reserved"));

        let src = format!(
            "//! VERSION 4\n//! TEXTURE SceneInfo\n//! FORMAT rgba8unorm\n//! WIDTH 4\n//! HEIGHT 4\n{}",
            MINIMAL_PASS
        );
        assert!(expect_validation(&src).contains("'SceneInfo' is reserved"));
    }

    #[test]
    fn test_list_and_dims_padding() {
        let src = "//! VERSION 4\n//! PASS 1\n//! IN  INPUT \n//! OUT OUTPUT\n//! BLOCK_SIZE 16, 8\n//! NUM_THREADS 64\n";
        let ir = parse(src).unwrap();
        assert_eq!(ir.passes[0].inputs, vec![INPUT.to_string()]);
        assert_eq!(ir.passes[0].block_size, Some([16, 8, 1]));
        assert_eq!(ir.passes[0].num_threads, Some([64, 1, 1]));
    }

    #[test]
    fn test_directive_names_case_insensitive() {
        let src = "//!version 4\n//!pass 1\n//!in INPUT\n//!out OUTPUT\n//!style ps\n";
        let ir = parse(src).unwrap();
        assert_eq!(ir.passes[0].style, PassStyle::Pixel);
    }

    #[test]
    fn test_parse_declaration_forms() {
        assert_eq!(
            parse_declaration("var<uniform> strength: f32;"),
            Some(("strength".to_string(), "f32".to_string()))
        );
        assert_eq!(
            parse_declaration("var tex : texture_2d<f32>;"),
            Some(("tex".to_string(), "texture_2d<f32>".to_string()))
        );
        assert_eq!(
            parse_declaration("radius: i32"),
            Some(("radius".to_string(), "i32".to_string()))
        );
        assert_eq!(parse_declaration("return x;"), None);
        assert_eq!(parse_declaration("variable: f32;"), Some(("variable".to_string(), "f32".to_string())));
        assert_eq!(
            parse_declaration("@group(0) @binding(4) var tmp: texture_2d<f32>;"),
            Some(("tmp".to_string(), "texture_2d<f32>".to_string()))
        );
        assert_eq!(
            parse_declaration("var<uniform> radius: i32; // taps"),
            Some(("radius".to_string(), "i32".to_string()))
        );
        assert_eq!(parse_declaration("@group(0) @binding(1)"), None);
    }

    #[test]
    fn test_pass_index_argument() {
        let src = format!("//! VERSION 4\n{}", MINIMAL_PASS);
        let ir = parse(&src).unwrap();
        assert_eq!(ir.passes.len(), 1);
        assert_eq!(ir.passes[0].index, 1);
        assert_eq!(ir.passes[0].name(), "PASS_1");

        let (_, msg) = expect_syntax("//! VERSION 4\n//! PASS first\n");
        assert!(msg.contains("PASS expects an index"));
    }

    #[test]
    fn test_decorated_texture_declaration() {
        let src = format!(
            "//! VERSION 4\n//! TEXTURE\n//! FORMAT rgba16float\n//! WIDTH INPUT_WIDTH\n//! HEIGHT INPUT_HEIGHT\n\
             @group(0) @binding(4) var tmp: texture_2d<f32>;\n\
             //! PASS 1\n//! IN INPUT\n//! OUT tmp\n//! BLOCK_SIZE 8\n//! NUM_THREADS 8,8,1\nfn Pass1() {{}}\n\
             //! PASS 2\n//! IN tmp\n//! OUT OUTPUT\n//! BLOCK_SIZE 8\n//! NUM_THREADS 8,8,1\nfn Pass2() {{}}\n"
        );
        let ir = parse(&src).unwrap();
        assert!(ir.texture("tmp").is_some());
    }

    #[test]
    fn test_unrelated_lines_in_resource_block_ignored() {
        let src = format!(
            "//! VERSION 4\n//! SAMPLER\n//! FILTER POINT\nconst unused = 1;\nvar sam: sampler;\n{}",
            MINIMAL_PASS
        );
        let ir = parse(&src).unwrap();
        assert!(ir.sampler("sam").is_some());
    }

    #[test]
    fn test_commented_parameter_type() {
        let src = format!(
            "//! VERSION 4\n//! PARAMETER\n//! DEFAULT 3\n//! MIN 1\n//! MAX 8\n//! STEP 1\n\
             var<uniform> radius: i32; // taps\n{}",
            MINIMAL_PASS
        );
        let ir = parse(&src).unwrap();
        assert_eq!(ir.parameters[0].name, "radius");
        assert_eq!(ir.parameters[0].ty, ParamType::Int);
    }
}
