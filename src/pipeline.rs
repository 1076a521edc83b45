//! Orchestrates encode -> loop(noise -> guidance -> scheduler) -> decode
//! -> safety (spec §4.7). Grounded on the teacher inpaint example's
//! end-to-end control flow: the `for timestep_index, timestep in
//! scheduler.timesteps()` loop shape, CFG batch doubling, and the final
//! `vae.decode` + clamp + scale-to-`u8` sequence; generalized here to
//! cover the instruct/ControlNet/reduce-memory axes the teacher example
//! doesn't implement.

use std::path::Path;

use log::{debug, info};
use tch::{Device, Kind, Tensor};

use crate::controlnet::ControlNet;
use crate::error::{Error, Result};
use crate::managed_model::ManagedModel;
use crate::metadata::{ModelFunction, ModelMetadata, ResourceDirectory, UnetLayout};
use crate::rng::SeededRng;
use crate::safety_checker::SafetyChecker;
use crate::scheduler::{NoiseScheduleConfig, SampleInput, Scheduler};
use crate::tensor_ops::{apply_cfg_guidance, apply_instruct_guidance};
use crate::text_encoder::{BpeTokenizer, TextEncoder};
use crate::unet::{capabilities_from_metadata, Unet, UnetArtifacts, UnetCapabilities};
use crate::vae::{VaeDecoder, VaeEncoder, DEFAULT_SCALE_FACTOR};

/// Hidden-state cache keyed on the pair `(prompt, negativePrompt)`,
/// storing each branch's own per-text embedding rather than the batched,
/// mode-arranged tensor — so a cache hit skips `TextEncoder::encode`
/// entirely regardless of which guidance mode the current request
/// selects (spec §3 "Cache invariant", §9 "Cache identity": "treat the
/// cache as a single-slot LRU").
struct HiddenStateCache {
    prompt: String,
    negative_prompt: String,
    positive: Tensor,
    negative: Tensor,
}

/// `{models…, lastInput?, lastHiddenStates?, canInpaint, takesInstructions,
/// reduceMemory}` (spec §3 "Pipeline runtime").
pub struct Pipeline {
    text_encoder: TextEncoder,
    vae_encoder: Option<VaeEncoder>,
    vae_decoder: VaeDecoder,
    unet: Unet,
    controlnet: Option<ControlNet>,
    safety_checker: Option<SafetyChecker>,
    device: Device,
    latent_size: (i64, i64),
    reduce_memory: bool,
    cache: Option<HiddenStateCache>,
}

/// `generateImages`'s outcome per requested image: `Some(image)` on
/// success, `None` when the safety checker rejects that index (spec §7
/// "SafetyRejected"). An empty `Vec` overall signals cooperative
/// cancellation (spec §7 "Cancelled").
pub type GenerateResult = Vec<Option<Tensor>>;

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        text_encoder: TextEncoder,
        vae_encoder: Option<VaeEncoder>,
        vae_decoder: VaeDecoder,
        unet: Unet,
        controlnet: Option<ControlNet>,
        safety_checker: Option<SafetyChecker>,
        device: Device,
        latent_size: (i64, i64),
        reduce_memory: bool,
    ) -> Self {
        Pipeline {
            text_encoder,
            vae_encoder,
            vae_decoder,
            unet,
            controlnet,
            safety_checker,
            device,
            latent_size,
            reduce_memory,
            cache: None,
        }
    }

    /// Build a pipeline from a resource directory (spec §6). Optional
    /// artifacts that are absent downgrade capabilities rather than
    /// failing construction (spec §7): a missing `VAEEncoder.*` disables
    /// image-to-image and inpainting; a missing `SafetyChecker.*`
    /// disables safety checking.
    pub fn from_resource_directory(dir: impl AsRef<Path>, device: Device, reduce_memory: bool) -> Result<Self> {
        let resources = ResourceDirectory::scan(dir)?;

        let unet_metadata = ModelMetadata::load(sidecar_json(match &resources.unet {
            UnetLayout::Single(p) => p,
            UnetLayout::Chunked(p, _) => p,
        }))
        .ok();
        let (input_channels, timestep_batch, controlnet_support) = unet_metadata
            .as_ref()
            .map(|m| {
                let channels = match m.function {
                    ModelFunction::Inpaint => 9,
                    ModelFunction::Instructions => 8,
                    ModelFunction::Standard | ModelFunction::Unknown => 4,
                };
                let batch = if m.function == ModelFunction::Instructions { 3 } else { 2 };
                (channels, batch, m.controlnet_support)
            })
            .unwrap_or((4, 2, false));
        let capabilities: UnetCapabilities = capabilities_from_metadata(input_channels, timestep_batch, controlnet_support);

        let width = unet_metadata.as_ref().map(|m| m.width as i64).unwrap_or(512);
        let height = unet_metadata.as_ref().map(|m| m.height as i64).unwrap_or(512);
        let latent_size = (height / 8, width / 8);

        let artifacts = match &resources.unet {
            UnetLayout::Single(path) => {
                UnetArtifacts::Single(ManagedModel::new("Unet", path, device))
            }
            UnetLayout::Chunked(a, b) => UnetArtifacts::Chunked(
                ManagedModel::new("UnetChunk1", a, device),
                ManagedModel::new("UnetChunk2", b, device),
            ),
        };
        let unet = Unet::new(artifacts, capabilities);

        let tokenizer = BpeTokenizer::from_files(&resources.vocab, &resources.merges, 77)?;
        let text_encoder = TextEncoder::new(
            ManagedModel::new("TextEncoder", &resources.text_encoder, device),
            tokenizer,
            device,
        );

        let vae_encoder = resources
            .vae_encoder
            .as_ref()
            .map(|path| VaeEncoder::new(ManagedModel::new("VAEEncoder", path, device), (height, width)));
        let vae_decoder = VaeDecoder::new(ManagedModel::new("VAEDecoder", &resources.vae_decoder, device));

        let controlnet = resources
            .controlnet
            .as_ref()
            .map(|path| ControlNet::new(ManagedModel::new("ControlNet", path, device), (height, width)));

        let safety_checker = resources
            .safety_checker
            .as_ref()
            .map(|path| SafetyChecker::new(ManagedModel::new("SafetyChecker", path, device)));

        Ok(Pipeline::new(
            text_encoder,
            vae_encoder,
            vae_decoder,
            unet,
            controlnet,
            safety_checker,
            device,
            latent_size,
            reduce_memory,
        ))
    }

    pub fn can_inpaint(&self) -> bool {
        self.vae_encoder.is_some() && self.unet.capabilities().can_inpaint
    }

    pub fn can_generate_variations(&self) -> bool {
        self.vae_encoder.is_some()
    }

    pub fn can_safety_check(&self) -> bool {
        self.safety_checker.is_some()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn can_use_controlnet(&self) -> bool {
        self.controlnet.is_some()
    }

    /// Assign the ControlNet conditioning image, preprocessed once here
    /// (spec §4.6) and reused by every subsequent `generate_images` call
    /// until cleared or reassigned.
    pub fn set_control_image(&mut self, image: &Tensor) -> Result<()> {
        match &mut self.controlnet {
            Some(controlnet) => {
                controlnet.set_conditioning_image(image);
                Ok(())
            }
            None => Err(Error::InvalidInput { reason: "no ControlNet artifact is loaded".to_string() }),
        }
    }

    pub fn clear_control_image(&mut self) {
        if let Some(controlnet) = &mut self.controlnet {
            controlnet.clear_conditioning_image();
        }
    }

    /// Step 1: compute (or reuse) the CFG-batched, transposed hidden
    /// states for `(prompt, negativePrompt)` (spec §4.7 step 1). Returns
    /// the raw per-branch embeddings regardless of cache hit/miss, so the
    /// caller arranges batch order per-mode without re-encoding.
    fn hidden_state_branches(&mut self, prompt: &str, negative_prompt: &str) -> Result<(Tensor, Tensor)> {
        if let Some(cache) = &self.cache {
            if cache.prompt == prompt && cache.negative_prompt == negative_prompt {
                return Ok((cache.positive.shallow_clone(), cache.negative.shallow_clone()));
            }
        }
        let positive = self.text_encoder.encode(prompt)?;
        let negative = self.text_encoder.encode(negative_prompt)?;
        self.cache = Some(HiddenStateCache {
            prompt: prompt.to_string(),
            negative_prompt: negative_prompt.to_string(),
            positive: positive.shallow_clone(),
            negative: negative.shallow_clone(),
        });
        if self.reduce_memory {
            self.text_encoder.model().unload();
        }
        Ok((positive, negative))
    }

    /// `[B,L,E] -> [B,E,1,L]` (spec §4.7 step 1).
    fn transpose_for_unet(hidden_states: &Tensor) -> Tensor {
        hidden_states.permute([0, 2, 1]).unsqueeze(2)
    }

    /// Public operation: `generateImages(input, count, disableSafety,
    /// progress) -> [Image?]` (spec §4.7).
    pub fn generate_images(
        &mut self,
        input: &SampleInput,
        count: usize,
        disable_safety: bool,
        mut progress: impl FnMut(usize) -> bool,
    ) -> Result<GenerateResult> {
        let instruct = input.image_guidance_scale.is_some();
        let (positive, negative) = self.hidden_state_branches(&input.prompt, &input.negative_prompt)?;
        let batched = if instruct {
            Tensor::cat(&[&positive, &negative, &negative], 0)
        } else {
            Tensor::cat(&[&negative, &positive], 0)
        };
        let hidden_states = Self::transpose_for_unet(&batched);

        let config = NoiseScheduleConfig::default();
        let mut schedulers: Vec<Scheduler> = (0..count)
            .map(|_| Scheduler::new(input.scheduler, input.step_count, config, input.strength))
            .collect();

        let (h, w) = self.latent_size;
        let mut rngs: Vec<SeededRng> = (0..count).map(|i| SeededRng::new(input.seed.wrapping_add(i as u32))).collect();

        let mut latents: Vec<Tensor> = (0..count)
            .map(|i| rngs[i].normal_tensor(&[1, 4, h, w], 1.0))
            .collect();

        // Step 3: image-to-image noising, if an init image + strength is
        // given and a VAE encoder is available (spec §4.7 step 3).
        if let (Some(init_image), Some(_strength)) = (&input.init_image, input.strength) {
            let Some(vae_encoder) = &self.vae_encoder else {
                return Err(crate::error::Error::InvalidInput {
                    reason: "initImage + strength requires a VAEEncoder artifact".to_string(),
                });
            };
            for i in 0..count {
                let image_latent = vae_encoder.encode(init_image, DEFAULT_SCALE_FACTOR, &mut rngs[i])?;
                let noised = schedulers[i].add_noise(&image_latent, &latents[i]);
                latents[i] = noised;
            }
        }

        // Step 4: inpainting preprocessing (spec §4.7 step 4).
        let mask_and_masked_latents = if let Some(mask) = &input.inpaint_mask {
            let Some(vae_encoder) = &self.vae_encoder else {
                return Err(crate::error::Error::InvalidInput {
                    reason: "inpaintMask requires a VAEEncoder artifact".to_string(),
                });
            };
            let init_image = input.init_image.as_ref().expect("SampleInput::new enforces initImage with inpaintMask");
            let masked_image = init_image * (1 - mask);
            let masked_image_latent = vae_encoder.encode(&masked_image, DEFAULT_SCALE_FACTOR, &mut rngs[0])?;
            let mask_latent = crate::image_io::resize_bilinear(mask, h, w);
            let mask_latent = Tensor::cat(&[&mask_latent, &mask_latent], 0);
            let masked_image_latent = Tensor::cat(&[&masked_image_latent, &masked_image_latent], 0);
            Some((mask_latent, masked_image_latent))
        } else {
            None
        };

        // Step 5: instruct preprocessing (spec §4.7 step 5).
        let instruct_image_latent_stack = if instruct {
            let Some(vae_encoder) = &self.vae_encoder else {
                return Err(crate::error::Error::InvalidInput {
                    reason: "imageGuidanceScale requires a VAEEncoder artifact".to_string(),
                });
            };
            let init_image = input.init_image.as_ref().expect("SampleInput::new enforces initImage with imageGuidanceScale");
            let image_latent = vae_encoder.encode(init_image, 1.0, &mut rngs[0])?;
            let zeros = Tensor::zeros_like(&image_latent);
            Some(Tensor::cat(&[&image_latent, &image_latent, &zeros], 0))
        } else {
            None
        };

        if self.reduce_memory {
            if let Some(vae_encoder) = &self.vae_encoder {
                vae_encoder.model().unload();
            }
        }

        let time_steps: Vec<i64> = schedulers[0].time_steps().to_vec();
        let cfg_batch = if instruct { 3 } else { 2 };

        for (step_index, &t) in time_steps.iter().enumerate() {
            for image_idx in 0..count {
                let latent = latents[image_idx].shallow_clone();
                let replicated = Tensor::cat(&vec![&latent; cfg_batch], 0);

                let latent_model_input = if let Some((mask_latent, masked_image_latent)) = &mask_and_masked_latents {
                    Tensor::cat(&[&replicated, mask_latent, masked_image_latent], 1)
                } else if let Some(image_stack) = &instruct_image_latent_stack {
                    Tensor::cat(&[&replicated, image_stack], 1)
                } else {
                    replicated
                };

                let control_residuals = match &self.controlnet {
                    Some(controlnet) if controlnet.is_active() => {
                        controlnet.predict_residuals(&latent_model_input, t, &hidden_states)?
                    }
                    _ => None,
                };

                let noise_pred =
                    self.unet.predict_noise(&latent_model_input, t, &hidden_states, control_residuals.as_ref())?;

                let guided = if instruct {
                    apply_instruct_guidance(&noise_pred, input.guidance_scale, input.image_guidance_scale.unwrap_or(0.0))
                } else {
                    apply_cfg_guidance(&noise_pred, input.guidance_scale)
                };

                let updated = schedulers[image_idx].step(&guided, t, &latent);
                latents[image_idx] = updated;
            }

            debug!("completed denoising step {}/{}", step_index + 1, time_steps.len());
            if !progress(step_index) {
                info!("generation cancelled at step {step_index}");
                if self.reduce_memory {
                    self.unet_model_unload();
                }
                return Ok(Vec::new());
            }
        }

        if self.reduce_memory {
            self.unet_model_unload();
        }

        // Step 7: decode.
        let mut images: Vec<Tensor> = Vec::with_capacity(count);
        for latent in &latents {
            let decoded = self.vae_decoder.decode(latent, DEFAULT_SCALE_FACTOR)?;
            images.push(crate::image_io::from_minus_one_one(&decoded));
        }
        if self.reduce_memory {
            self.vae_decoder.model().unload();
        }

        // Step 8: safety gating.
        let safety_enabled = !disable_safety && self.safety_checker.is_some();
        if !safety_enabled {
            return Ok(images.into_iter().map(Some).collect());
        }
        let checker = self.safety_checker.as_ref().expect("checked is_some above");
        let batch: Tensor = Tensor::cat(&images.iter().collect::<Vec<_>>(), 0).to_kind(Kind::Float) / 255.0;
        let flags = checker.check(&batch)?;
        Ok(images.into_iter().zip(flags).map(|(img, safe)| safe.then_some(img)).collect())
    }

    fn unet_model_unload(&self) {
        for model in self.unet.model_handles() {
            model.unload();
        }
    }
}

fn sidecar_json(artifact_path: &Path) -> std::path::PathBuf {
    artifact_path.with_extension("json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_json_swaps_extension() {
        let path = Path::new("/models/Unet.pt");
        assert_eq!(sidecar_json(path), Path::new("/models/Unet.json"));
    }

    #[test]
    fn transpose_for_unet_reshapes_b_l_e_to_b_e_1_l() {
        let hidden = Tensor::zeros([2, 77, 768], (Kind::Float, Device::Cpu));
        let transposed = Pipeline::transpose_for_unet(&hidden);
        assert_eq!(transposed.size(), vec![2, 768, 1, 77]);
    }
}
