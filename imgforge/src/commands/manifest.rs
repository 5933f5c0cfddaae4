//! Generate the manifest of one image type.

use anyhow::{Context, Result};
use clap::Args;
use imgforge_common::Size;
use imgforge_common::seed::seed_from_env;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use crate::blueprint::Blueprint;
use crate::config::RepoRegistry;
use crate::imagetype::{self, ImageOptions, OstreeImageOptions};
use crate::manifestgen::Generator;
use crate::osbuild::RpmDownloader;
use crate::output::Output;

#[derive(Debug, Args)]
pub struct ManifestArgs {
    /// Distribution name or alias (e.g. fedora-42, rhel-9)
    #[arg(long)]
    pub distro: String,

    /// Target architecture
    #[arg(long)]
    pub arch: String,

    /// Image type (see `imgforge list-images`)
    #[arg(long = "type", value_name = "TYPE")]
    pub image_type: String,

    /// Blueprint file (JSON, or YAML by extension)
    #[arg(short, long)]
    pub blueprint: Option<PathBuf>,

    /// Directory of `<distro>.json` repository files
    #[arg(long, value_name = "DIR")]
    pub repos: Option<PathBuf>,

    /// Seed for generated identifiers (defaults to $IMGFORGE_RNG_SEED)
    #[arg(long, allow_hyphen_values = true)]
    pub seed: Option<i64>,

    /// Fetch packages with librepo instead of curl
    #[arg(long)]
    pub librepo: bool,

    /// Requested image size (e.g. "10 GiB")
    #[arg(long)]
    pub size: Option<String>,

    /// Ostree repository to pull the commit from
    #[arg(long)]
    pub ostree_url: Option<String>,

    /// Ostree ref to deploy
    #[arg(long)]
    pub ostree_ref: Option<String>,

    /// Ostree commit the new one is based on
    #[arg(long)]
    pub ostree_parent: Option<String>,

    /// Bootable container to install on the disk
    #[arg(long)]
    pub bootc_ref: Option<String>,

    /// Write the manifest here instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

impl ManifestArgs {
    fn image_options(&self) -> Result<ImageOptions> {
        let size = self
            .size
            .as_deref()
            .map(|s| s.parse::<Size>())
            .transpose()
            .context("Invalid --size")?;
        let wants_ostree =
            self.ostree_url.is_some() || self.ostree_ref.is_some() || self.ostree_parent.is_some();
        let ostree = if wants_ostree {
            Some(OstreeImageOptions {
                url: self.ostree_url.clone(),
                reference: self.ostree_ref.clone(),
                parent: self.ostree_parent.clone(),
                rhsm: false,
            })
        } else {
            None
        };
        Ok(ImageOptions {
            size,
            ostree,
            bootc_ref: self.bootc_ref.clone(),
        })
    }
}

pub fn run(args: ManifestArgs) -> Result<()> {
    let image_type = imagetype::get(&args.distro, &args.arch, &args.image_type)?;
    let blueprint = match &args.blueprint {
        Some(path) => Blueprint::load(path)?,
        None => Blueprint::default(),
    };
    let registry = match &args.repos {
        Some(dir) => RepoRegistry::load_dir(dir)?,
        None => RepoRegistry::builtin(),
    };
    let seed = match args.seed {
        Some(seed) => seed,
        None => seed_from_env()?,
    };
    let downloader = if args.librepo {
        RpmDownloader::Librepo
    } else {
        RpmDownloader::Curl
    };

    let bytes = Generator::new(&args.distro, &image_type, args.image_options()?)
        .with_registry(registry)
        .with_seed(seed)
        .with_rpm_downloader(downloader)
        .on_warning(|w| Output::warning(w))
        .generate(&blueprint)?;

    match &args.output {
        Some(path) => {
            fs::write(path, &bytes).with_context(|| format!("Failed to write {}", path.display()))?;
            Output::success(format!("Wrote manifest to {}", path.display()));
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&bytes)?;
            stdout.flush()?;
        }
    }
    Ok(())
}
