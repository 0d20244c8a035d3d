use anyhow::{bail, Result};
use clap::Parser;
use std::path::{Path, PathBuf};

/// Which frame serves as the pre-registration reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreregMode {
    None,
    ExplicitImage(PathBuf),
    FirstImage,
    MiddleImage,
}

/// Raw command line. Stage switches are opt-in: setting one runs that stage.
#[derive(Parser, Debug)]
#[command(
    name = "luckystacker",
    about = "Registration, dedistortion and stacking of planetary image sequences"
)]
pub struct Cli {
    /// Image files to process
    pub files: Vec<PathBuf>,

    /// Preregister using this image as the reference
    #[arg(long, value_name = "PATH")]
    pub prereg_img: Option<PathBuf>,

    /// Preregister using the first image as the reference
    #[arg(long)]
    pub prereg_on_first: bool,

    /// Preregister using the middle image as the reference
    #[arg(long)]
    pub prereg_on_middle: bool,

    /// Maximum displacement in pre-registration; zero means half of the
    /// reference's smaller axis (default)
    #[arg(long, value_name = "N", default_value_t = 0)]
    pub prereg_maxmove: u32,

    /// Create an averaged reference image for dedistortion
    #[arg(long)]
    pub refimg: bool,

    /// Only stack the (possibly pre-registered) frames and write that
    /// reference; implies --refimg
    #[arg(long)]
    pub only_refimg: bool,

    /// Crop to the rectangle common to all globally shifted frames
    #[arg(long)]
    pub crop: bool,

    /// Generate and filter registration patches
    #[arg(long)]
    pub patches: bool,

    /// Patch box size in pixels
    #[arg(long, value_name = "N")]
    pub boxsize: Option<u32>,

    /// Compute lucky-imaging shifts
    #[arg(long)]
    pub dedistort: bool,

    /// Maximum local displacement in dedistortion
    #[arg(long, value_name = "N", default_value_t = 20)]
    pub maxmove: u32,

    /// Stack (sum) the warped frames
    #[arg(long)]
    pub stack: bool,

    /// Supersampling factor of the output lattice
    #[arg(long = "super", value_name = "N", default_value_t = 1)]
    pub supersampling: u32,

    /// Continue processing from a saved state
    #[arg(long, value_name = "FILE.yml")]
    pub read_state: Option<PathBuf>,

    /// Save the registration state into a file
    #[arg(long, value_name = "FILE.yml")]
    pub save_state: Option<PathBuf>,

    /// Output image file
    #[arg(long, value_name = "FILE")]
    pub output: Option<PathBuf>,
}

/// Validated parameter bundle consumed by the pipeline driver.
#[derive(Debug, Clone)]
pub struct RegistrationParams {
    pub files: Vec<PathBuf>,
    pub prereg: PreregMode,
    pub prereg_maxmove: i32,
    pub stage_prereg: bool,
    pub stage_refimg: bool,
    pub stage_patches: bool,
    pub stage_dedistort: bool,
    pub stage_stack: bool,
    pub only_refimg: bool,
    pub crop: bool,
    pub boxsize: i32,
    pub boxsize_override: bool,
    pub maxmove: i32,
    pub supersampling: i32,
    pub read_state: Option<PathBuf>,
    pub save_state: Option<PathBuf>,
    pub output: Option<PathBuf>,
}

pub const DEFAULT_BOXSIZE: u32 = 60;

fn require_yml(path: &Path, option: &str) -> Result<()> {
    if path.extension().map_or(true, |ext| ext != "yml") {
        bail!("{} requires a file name ending in '.yml'", option);
    }
    Ok(())
}

impl RegistrationParams {
    /// Cross-flag validation of §6 and the original refusal rules: no silent
    /// data loss, no ambiguous reference selection, no stateless runs.
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let prereg_flags = cli.prereg_img.is_some() as u32
            + cli.prereg_on_first as u32
            + cli.prereg_on_middle as u32;
        if prereg_flags > 1 {
            bail!(
                "arguments --prereg-img, --prereg-on-first and --prereg-on-middle \
                 are mutually exclusive"
            );
        }
        let prereg = if let Some(path) = cli.prereg_img {
            PreregMode::ExplicitImage(path)
        } else if cli.prereg_on_first {
            PreregMode::FirstImage
        } else if cli.prereg_on_middle {
            PreregMode::MiddleImage
        } else {
            PreregMode::None
        };

        if cli.only_refimg && cli.stack {
            bail!("--only-refimg and --stack can not be enabled at the same time");
        }

        if cli.read_state.is_some() && !cli.files.is_empty() {
            bail!("either use --read-state or list input files, not both");
        }
        if cli.read_state.is_none() && cli.files.is_empty() {
            bail!("no input files given");
        }
        if let Some(path) = &cli.read_state {
            require_yml(path, "--read-state")?;
        }
        if let Some(path) = &cli.save_state {
            require_yml(path, "--save-state")?;
        }

        let produces_image = cli.only_refimg || cli.stack;
        match (&cli.output, produces_image) {
            (Some(_), false) => {
                bail!("--output given but no image-producing stage is enabled")
            }
            (None, true) => {
                bail!("stacking enabled but no --output given; refusing to discard the result")
            }
            (None, false) if cli.save_state.is_none() => {
                bail!("no --save-state destination given; refusing to discard data")
            }
            _ => {}
        }

        if cli.supersampling < 1 {
            bail!("--super must be at least 1");
        }
        if cli.maxmove < 1 {
            bail!("--maxmove must be at least 1");
        }
        let boxsize = cli.boxsize.unwrap_or(DEFAULT_BOXSIZE);
        if boxsize < 2 {
            bail!("--boxsize must be at least 2");
        }

        Ok(Self {
            files: cli.files,
            stage_prereg: prereg != PreregMode::None,
            prereg,
            prereg_maxmove: cli.prereg_maxmove as i32,
            stage_refimg: cli.refimg || cli.only_refimg,
            stage_patches: cli.patches,
            stage_dedistort: cli.dedistort,
            stage_stack: cli.stack,
            only_refimg: cli.only_refimg,
            crop: cli.crop,
            boxsize: boxsize as i32,
            boxsize_override: cli.boxsize.is_some(),
            maxmove: cli.maxmove as i32,
            supersampling: cli.supersampling as i32,
            read_state: cli.read_state,
            save_state: cli.save_state,
            output: cli.output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<RegistrationParams> {
        let cli = Cli::try_parse_from(std::iter::once("luckystacker").chain(args.iter().copied()))?;
        RegistrationParams::from_cli(cli)
    }

    #[test]
    fn stage_switches_and_defaults() -> Result<()> {
        let params = parse(&[
            "--prereg-on-first",
            "--refimg",
            "--patches",
            "--dedistort",
            "--stack",
            "--output",
            "out.png",
            "a.png",
            "b.png",
        ])?;
        assert!(params.stage_prereg);
        assert_eq!(params.prereg, PreregMode::FirstImage);
        assert!(params.stage_refimg && params.stage_patches);
        assert!(params.stage_dedistort && params.stage_stack);
        assert_eq!(params.boxsize, 60);
        assert!(!params.boxsize_override);
        assert_eq!(params.maxmove, 20);
        assert_eq!(params.supersampling, 1);
        assert_eq!(params.files.len(), 2);
        Ok(())
    }

    #[test]
    fn prereg_modes_are_mutually_exclusive() {
        assert!(parse(&[
            "--prereg-on-first",
            "--prereg-on-middle",
            "--save-state",
            "s.yml",
            "a.png"
        ])
        .is_err());
    }

    #[test]
    fn only_refimg_conflicts_with_stack() {
        assert!(parse(&[
            "--only-refimg",
            "--stack",
            "--output",
            "out.png",
            "a.png"
        ])
        .is_err());
    }

    #[test]
    fn only_refimg_implies_refimg_stage() -> Result<()> {
        let params = parse(&["--only-refimg", "--output", "out.png", "a.png"])?;
        assert!(params.stage_refimg);
        assert!(params.only_refimg);
        Ok(())
    }

    #[test]
    fn state_files_must_end_in_yml() {
        assert!(parse(&["--save-state", "s.yaml", "a.png"]).is_err());
        assert!(parse(&["--read-state", "s.txt"]).is_err());
        assert!(parse(&["--save-state", "s.yml", "a.png"]).is_ok());
    }

    #[test]
    fn refuses_to_discard_results() {
        // Stacking without an output sink.
        assert!(parse(&["--stack", "a.png"]).is_err());
        // No output and no state file: nothing would be kept.
        assert!(parse(&["--dedistort", "a.png"]).is_err());
        // Output without an image-producing stage.
        assert!(parse(&["--dedistort", "--output", "out.png", "a.png"]).is_err());
    }

    #[test]
    fn read_state_excludes_positional_files() {
        assert!(parse(&["--read-state", "s.yml", "a.png"]).is_err());
        assert!(parse(&["--read-state", "s.yml", "--save-state", "t.yml"]).is_ok());
    }

    #[test]
    fn boxsize_override_is_tracked() -> Result<()> {
        let params = parse(&["--boxsize", "32", "--save-state", "s.yml", "a.png"])?;
        assert_eq!(params.boxsize, 32);
        assert!(params.boxsize_override);
        Ok(())
    }
}
