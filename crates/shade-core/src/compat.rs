//! Textual helpers over shader bodies.
//!
//! Effects migrated from HLSL tend to carry a handful of legacy spellings.
//! [`apply_compat_fixes`] rewrites those at the identifier level; everything
//! here skips `//` and `/* */` comments so commented-out code is left alone.

/// A maximal identifier token outside comments.
#[derive(Debug, Clone, PartialEq)]
pub struct Ident<'a> {
    pub start: usize,
    pub end: usize,
    pub text: &'a str,
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Every identifier token in `code`, in source order.
pub fn identifiers(code: &str) -> Vec<Ident<'_>> {
    let bytes = code.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i < bytes.len() && !(bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/')) {
                    i += 1;
                }
                i = (i + 2).min(bytes.len());
            }
            b if b.is_ascii_digit() => {
                // Skip numeric literals whole so suffixes like `1u` or `2.0f`
                // never read as identifiers.
                while i < bytes.len() && (is_ident_char(bytes[i]) || bytes[i] == b'.') {
                    i += 1;
                }
            }
            b if is_ident_start(b) => {
                let start = i;
                while i < bytes.len() && is_ident_char(bytes[i]) {
                    i += 1;
                }
                out.push(Ident {
                    start,
                    end: i,
                    text: &code[start..i],
                });
            }
            _ => i += 1,
        }
    }
    out
}

/// Next non-whitespace byte at or after `pos`.
pub fn next_significant(code: &str, pos: usize) -> Option<u8> {
    code.as_bytes()[pos..]
        .iter()
        .copied()
        .find(|b| !b.is_ascii_whitespace())
}

/// Replace identifier spans chosen by `map`, leaving everything else intact.
pub fn rewrite_identifiers<'a>(
    code: &'a str,
    mut map: impl FnMut(&Ident<'a>) -> Option<String>,
) -> String {
    let mut out = String::with_capacity(code.len());
    let mut cursor = 0;
    for ident in identifiers(code) {
        if let Some(replacement) = map(&ident) {
            out.push_str(&code[cursor..ident.start]);
            out.push_str(&replacement);
            cursor = ident.end;
        }
    }
    out.push_str(&code[cursor..]);
    out
}

fn legacy_type(name: &str) -> Option<&'static str> {
    let wgsl = match name {
        "float" | "half" => "f32",
        "int" => "i32",
        "uint" => "u32",
        "float2" | "half2" => "vec2<f32>",
        "float3" | "half3" => "vec3<f32>",
        "float4" | "half4" => "vec4<f32>",
        "int2" => "vec2<i32>",
        "int3" => "vec3<i32>",
        "int4" => "vec4<i32>",
        "uint2" => "vec2<u32>",
        "uint3" => "vec3<u32>",
        "uint4" => "vec4<u32>",
        _ => return None,
    };
    Some(wgsl)
}

fn legacy_function(name: &str) -> Option<&'static str> {
    match name {
        "lerp" => Some("mix"),
        "frac" => Some("fract"),
        "rsqrt" => Some("inverseSqrt"),
        _ => None,
    }
}

/// Rewrite HLSL-era type and intrinsic names into their WGSL equivalents.
pub fn apply_compat_fixes(code: &str) -> String {
    rewrite_identifiers(code, |ident| {
        if let Some(ty) = legacy_type(ident.text) {
            return Some(ty.to_string());
        }
        let is_call = next_significant(code, ident.end) == Some(b'(');
        match legacy_function(ident.text) {
            Some(f) if is_call => Some(f.to_string()),
            _ => None,
        }
    })
}

/// A `fn name(` declaration found in shader text.
#[derive(Debug, Clone, PartialEq)]
pub struct FnDecl {
    /// Byte offset of the `fn` keyword.
    pub keyword: usize,
    pub name_start: usize,
    pub name_end: usize,
    pub name: String,
}

pub fn function_decls(code: &str) -> Vec<FnDecl> {
    let idents = identifiers(code);
    idents
        .windows(2)
        .filter(|w| w[0].text == "fn" && next_significant(code, w[1].end) == Some(b'('))
        .map(|w| FnDecl {
            keyword: w[0].start,
            name_start: w[1].start,
            name_end: w[1].end,
            name: w[1].text.to_string(),
        })
        .collect()
}

fn is_inline_space(c: char) -> bool {
    c == ' ' || c == '\t'
}

/// Remove every `@compute` and `@workgroup_size(...)` attribute.
pub fn strip_entry_attributes(code: &str) -> String {
    let mut out = String::with_capacity(code.len());
    let mut rest = code;
    while let Some(at) = rest.find('@') {
        out.push_str(&rest[..at]);
        let after = &rest[at + 1..];
        if let Some(tail) = after.strip_prefix("compute") {
            if !tail.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_') {
                rest = tail.trim_start_matches(is_inline_space);
                continue;
            }
        }
        if let Some(tail) = after.strip_prefix("workgroup_size") {
            if let Some(args) = tail.trim_start().strip_prefix('(') {
                if let Some(close) = args.find(')') {
                    rest = args[close + 1..].trim_start_matches(is_inline_space);
                    continue;
                }
            }
        }
        out.push('@');
        rest = after;
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifiers_skip_comments_and_numbers() {
        let code = "let a = 1u; // float4 b\n/* lerp(c) */ let d2 = 2.0f;";
        let names: Vec<&str> = identifiers(code).iter().map(|i| i.text).collect();
        assert_eq!(names, vec!["let", "a", "let", "d2"]);
    }

    #[test]
    fn test_compat_fixes() {
        let code = "var c: float4 = lerp(a, b, frac(t));\nlet lerp_amount = rsqrt (x);\nlet u: uint2 = uint2(1u, 2u);";
        let fixed = apply_compat_fixes(code);
        assert_eq!(
            fixed,
            "var c: vec4<f32> = mix(a, b, fract(t));\nlet lerp_amount = inverseSqrt (x);\nlet u: vec2<u32> = vec2<u32>(1u, 2u);"
        );
    }

    #[test]
    fn test_compat_leaves_non_calls() {
        let code = "let frac = 0.5; // lerp(\n";
        assert_eq!(apply_compat_fixes(code), code);
    }

    #[test]
    fn test_function_decls() {
        let code = "fn helper(x: f32) -> f32 { return x; }\n@compute @workgroup_size(8, 8)\nfn Pass1(@builtin(global_invocation_id) id: vec3<u32>) {}";
        let fns = function_decls(code);
        assert_eq!(fns.len(), 2);
        assert_eq!(fns[0].name, "helper");
        assert_eq!(fns[1].name, "Pass1");
        assert_eq!(&code[fns[1].name_start..fns[1].name_end], "Pass1");
    }

    #[test]
    fn test_strip_entry_attributes() {
        let code = "@compute @workgroup_size(8, 8, 1)\nfn main(@builtin(global_invocation_id) id: vec3<u32>) {}";
        assert_eq!(
            strip_entry_attributes(code),
            "\nfn main(@builtin(global_invocation_id) id: vec3<u32>) {}"
        );
        let keeps = "@computed_value fn f() {}";
        assert_eq!(strip_entry_attributes(keeps), keeps);
    }
}
