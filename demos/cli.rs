//! External CLI surface (spec §6 "CLI surface (external tool;
//! informational)"). Not part of the library and not covered by spec §8
//! properties. Mapped 1:1 onto the teacher's own example binaries'
//! `clap` derive struct shape (`--cpu`, `--n-steps`, `--seed`,
//! `--num-samples`, `--final-image`) with the spec's own flag names.

use std::path::PathBuf;

use clap::Parser;
use guernika_core::image_io;
use guernika_core::pipeline::Pipeline;
use guernika_core::scheduler::{SampleInput, SchedulerKind};
use tch::Device;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The prompt to be used for image generation.
    prompt: String,

    /// Directory containing the converted model artifacts (spec §6).
    #[arg(long, value_name = "DIR")]
    resource_path: PathBuf,

    /// Negative prompt.
    #[arg(long, default_value = "")]
    negative_prompt: String,

    /// How many images to generate in one call.
    #[arg(long, default_value_t = 1)]
    image_count: usize,

    /// Number of denoising steps.
    #[arg(long, default_value_t = 50)]
    step_count: usize,

    /// Image-to-image strength in [0,1].
    #[arg(long)]
    strength: Option<f64>,

    /// Classifier-free guidance scale.
    #[arg(long, default_value_t = 7.5)]
    guidance_scale: f64,

    /// Instruct-pix2pix image guidance scale.
    #[arg(long)]
    image_guidance_scale: Option<f64>,

    /// Save an intermediate image every N steps, 0 to disable.
    #[arg(long, default_value_t = 0)]
    save_every: usize,

    /// Output directory for generated PNGs.
    #[arg(long, value_name = "DIR", default_value = ".")]
    output_path: PathBuf,

    /// Initial image for image-to-image or inpainting.
    #[arg(long, value_name = "FILE")]
    init_image: Option<PathBuf>,

    /// Inpainting mask image (white = repaint, black = preserve).
    #[arg(long, value_name = "FILE")]
    mask_image: Option<PathBuf>,

    /// ControlNet conditioning image. Requires a `ControlNet.pt` artifact
    /// in the resource directory.
    #[arg(long, value_name = "FILE")]
    control_image: Option<PathBuf>,

    /// The random seed to be used for generation.
    #[arg(long, default_value_t = 42)]
    seed: u32,

    /// Which scheduler to sample with.
    #[arg(long, value_enum, default_value = "plms")]
    scheduler: SchedulerArg,

    /// Compute units the backend should target. Informational: `tch`
    /// always dispatches to `--cpu`/CUDA; the neural-engine/GPU split is
    /// a CoreML-backend concept this crate's `tch` backend doesn't
    /// expose.
    #[arg(long, value_enum, default_value = "all")]
    compute_units: ComputeUnits,

    /// Skip the safety checker even when one is present.
    #[arg(long, action)]
    disable_safety: bool,

    /// Run on CPU even if a GPU is available.
    #[arg(long, action)]
    cpu: bool,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum SchedulerArg {
    Plms,
    Dpmpp,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum ComputeUnits {
    All,
    CpuOnly,
    CpuAndGpu,
    CpuAndNeuralEngine,
}

fn slugify(prompt: &str) -> String {
    prompt
        .chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect::<String>()
        .chars()
        .take(60)
        .collect()
}

fn run(args: Args) -> anyhow::Result<()> {
    tch::maybe_init_cuda();
    let device = if args.cpu { Device::Cpu } else { Device::cuda_if_available() };

    let mut pipeline = Pipeline::from_resource_directory(&args.resource_path, device, false)?;

    if let Some(control_image) = &args.control_image {
        let control_image = image_io::load_rgb(control_image)?;
        pipeline.set_control_image(&control_image)?;
    }

    // Raw u8 [0,255] tensors: normalization to [-1,1] happens exactly once,
    // inside `VaeEncoder::encode`, not here.
    let init_image = args.init_image.as_ref().map(image_io::load_rgb).transpose()?;
    let inpaint_mask = args.mask_image.as_ref().map(image_io::load_rgb).transpose()?.map(|t| image_io::mask_tensor(&t));

    let scheduler = match args.scheduler {
        SchedulerArg::Plms => SchedulerKind::Plms,
        SchedulerArg::Dpmpp => SchedulerKind::DpmPlusPlus,
    };

    let input = SampleInput::new(
        args.prompt.clone(),
        args.negative_prompt,
        init_image,
        args.strength,
        inpaint_mask,
        args.seed,
        args.step_count,
        args.guidance_scale,
        args.image_guidance_scale,
        scheduler,
    )?;

    let slug = slugify(&args.prompt);
    std::fs::create_dir_all(&args.output_path)?;
    let save_every = args.save_every;

    let images = pipeline.generate_images(&input, args.image_count, args.disable_safety, |step| {
        if save_every > 0 && (step + 1) % save_every == 0 {
            log::info!("step {step} checkpoint (intermediate save not wired to a latent snapshot in this CLI)");
        }
        true
    })?;

    if images.is_empty() {
        println!("generation cancelled");
        return Ok(());
    }

    for (idx, image) in images.into_iter().enumerate() {
        match image {
            Some(image) => {
                let filename = args.output_path.join(format!("{slug}.{}.final.png", args.seed.wrapping_add(idx as u32)));
                image_io::save_rgb(&image, &filename)?;
                println!("wrote {}", filename.display());
            }
            None => println!("image {idx} rejected by the safety checker"),
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    run(args)
}
