//! Build-time artifact set: `pipeline.json`, `metadata.json`, and one WGSL
//! file per pass.

use serde::Serialize;

use crate::codegen::{GeneratedModule, ResourceBinding};
use crate::ir::{Parameter, PassStyle, Sampler, ShaderIr, Texture};

pub const PIPELINE_FILE: &str = "pipeline.json";
pub const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassDescription<'a> {
    pub index: u32,
    pub name: String,
    pub style: PassStyle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desc: Option<&'a str>,
    pub inputs: &'a [String],
    pub outputs: &'a [String],
    pub block_size: [u32; 3],
    pub num_threads: [u32; 3],
    pub bindings: &'a [ResourceBinding],
}

#[derive(Debug, Serialize)]
pub struct PipelineDescription<'a> {
    pub passes: Vec<PassDescription<'a>>,
    pub textures: &'a [Texture],
    pub samplers: &'a [Sampler],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataDocument<'a> {
    pub version: u32,
    pub name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_name: Option<&'a str>,
    #[serde(rename = "use")]
    pub uses: Vec<&'a str>,
    pub capabilities: Vec<&'a str>,
    pub parameters: &'a [Parameter],
}

impl<'a> PipelineDescription<'a> {
    pub fn new(ir: &'a ShaderIr, modules: &'a [GeneratedModule]) -> Self {
        let passes = ir
            .passes
            .iter()
            .zip(modules)
            .map(|(pass, module)| PassDescription {
                index: pass.index,
                name: pass.name(),
                style: pass.style,
                desc: pass.desc.as_deref(),
                inputs: &pass.inputs,
                outputs: &pass.outputs,
                block_size: pass.effective_block_size(),
                num_threads: module.workgroup_size,
                bindings: &module.resources,
            })
            .collect();
        Self {
            passes,
            textures: &ir.textures,
            samplers: &ir.samplers,
        }
    }
}

impl<'a> MetadataDocument<'a> {
    pub fn new(name: &'a str, ir: &'a ShaderIr) -> Self {
        Self {
            version: ir.metadata.version,
            name,
            sort_name: ir.metadata.sort_name.as_deref(),
            uses: ir.metadata.uses.iter().map(String::as_str).collect(),
            capabilities: ir.metadata.capabilities.iter().map(String::as_str).collect(),
            parameters: &ir.parameters,
        }
    }
}

/// Every file of a built effect, keyed by file name.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifacts {
    pub files: Vec<(String, String)>,
}

impl Artifacts {
    pub fn get(&self, file_name: &str) -> Option<&str> {
        self.files
            .iter()
            .find(|(name, _)| name == file_name)
            .map(|(_, contents)| contents.as_str())
    }
}

pub fn shader_file_name(pass_index: u32) -> String {
    format!("pass_{}.wgsl", pass_index)
}

/// Serialize the artifact set for an effect named `name`.
pub fn build_artifacts(
    name: &str,
    ir: &ShaderIr,
    modules: &[GeneratedModule],
) -> Result<Artifacts, serde_json::Error> {
    let pipeline = serde_json::to_string_pretty(&PipelineDescription::new(ir, modules))?;
    let metadata = serde_json::to_string_pretty(&MetadataDocument::new(name, ir))?;

    let mut files = Vec::with_capacity(modules.len() + 2);
    for module in modules {
        files.push((shader_file_name(module.pass_index), module.wgsl_code.clone()));
    }
    files.push((PIPELINE_FILE.to_string(), pipeline));
    files.push((METADATA_FILE.to_string(), metadata));
    Ok(Artifacts { files })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::generate;
    use crate::parser::parse;

    const EFFECT: &str = r#"//! VERSION 4
//! SORT_NAME Soften
//! USE Dynamic
//! PARAMETER
//! LABEL Amount
//! DEFAULT 0.25
//! MIN 0
//! MAX 1
//! STEP 0.05
var<uniform> amount: f32;

//! TEXTURE
//! WIDTH INPUT_WIDTH / 2
//! HEIGHT INPUT_HEIGHT / 2
//! FORMAT rgba16float
var small: texture_2d<f32>;

//! SAMPLER lin
//! FILTER LINEAR

//! PASS 1
//! STYLE PS
//! DESC Shrink
//! IN INPUT
//! OUT small
fn Pass1(pos: vec2<f32>) -> vec4<f32> {
    return textureSampleLevel(INPUT, lin, pos, 0.0);
}

//! PASS 2
//! STYLE PS
//! IN small
//! OUT OUTPUT
fn Pass2(pos: vec2<f32>) -> vec4<f32> {
    return textureSampleLevel(small, lin, pos, 0.0) * params.amount;
}
"#;

    fn build() -> Artifacts {
        let ir = parse(EFFECT).unwrap();
        let modules = generate(&ir).unwrap();
        build_artifacts("soften", &ir, &modules).unwrap()
    }

    #[test]
    fn test_artifact_file_set() {
        let artifacts = build();
        let names: Vec<&str> = artifacts.files.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["pass_1.wgsl", "pass_2.wgsl", "pipeline.json", "metadata.json"]);
        assert!(artifacts.get("pass_2.wgsl").unwrap().contains("fn main("));
    }

    #[test]
    fn test_pipeline_json_shape() {
        let artifacts = build();
        let json: serde_json::Value = serde_json::from_str(artifacts.get(PIPELINE_FILE).unwrap()).unwrap();

        let pass1 = &json["passes"][0];
        assert_eq!(pass1["name"], "PASS_1");
        assert_eq!(pass1["style"], "PS");
        assert_eq!(pass1["desc"], "Shrink");
        assert_eq!(pass1["numThreads"], serde_json::json!([8, 8, 1]));
        assert_eq!(pass1["blockSize"], serde_json::json!([8, 8, 1]));
        assert_eq!(pass1["outputs"], serde_json::json!(["small"]));

        let small = pass1["bindings"]
            .as_array()
            .unwrap()
            .iter()
            .find(|b| b["name"] == "small")
            .unwrap();
        assert_eq!(small["kind"], "storage_texture");
        assert_eq!(small["format"], "rgba16float");
        assert_eq!(small["binding"], 4);

        assert!(json["passes"][1].get("desc").is_none());
        assert_eq!(json["textures"][0]["width"], "INPUT_WIDTH / 2");
        assert_eq!(json["samplers"][0]["filter"], "LINEAR");
        assert_eq!(json["samplers"][0]["address"], "CLAMP");
    }

    #[test]
    fn test_metadata_json_shape() {
        let artifacts = build();
        let json: serde_json::Value = serde_json::from_str(artifacts.get(METADATA_FILE).unwrap()).unwrap();
        assert_eq!(json["version"], 4);
        assert_eq!(json["name"], "soften");
        assert_eq!(json["sortName"], "Soften");
        assert_eq!(json["use"], serde_json::json!(["dynamic"]));
        assert_eq!(json["capabilities"], serde_json::json!([]));
        let param = &json["parameters"][0];
        assert_eq!(param["name"], "amount");
        assert_eq!(param["label"], "Amount");
        assert_eq!(param["type"], "float");
        assert_eq!(param["default"], 0.25);
        assert_eq!(param["step"], 0.05);
    }
}
