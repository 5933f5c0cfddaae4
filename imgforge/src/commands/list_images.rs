//! List the image types of the catalog.

use anyhow::Result;
use clap::Args;
use serde::Serialize;

use crate::imagetype::{ImageFilter, ImageType};

#[derive(Debug, Args)]
pub struct ListImagesArgs {
    /// Search terms; `distro:`, `arch:`, `type:` and `bootmode:` restrict
    /// a term to one field, globs are allowed
    pub filters: Vec<String>,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
pub struct ImageInfo {
    pub distro: String,
    pub arch: String,
    pub image_type: String,
    pub boot_mode: String,
    pub filename: String,
    pub mime_type: String,
}

impl ImageInfo {
    fn from_image_type(it: &dyn ImageType) -> Self {
        Self {
            distro: it.distro().name.to_string(),
            arch: it.arch().to_string(),
            image_type: it.name().to_string(),
            boot_mode: it.boot_mode().to_string(),
            filename: it.filename().to_string(),
            mime_type: it.mime_type().to_string(),
        }
    }
}

pub fn list(filters: &[String]) -> Result<Vec<ImageInfo>> {
    let filter = ImageFilter::new(filters)?;
    Ok(filter
        .apply()
        .iter()
        .map(|it| ImageInfo::from_image_type(it))
        .collect())
}

pub fn run(args: ListImagesArgs) -> Result<()> {
    let images = list(&args.filters)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&images)?);
        return Ok(());
    }
    for image in &images {
        println!(
            "{:<10} {:<8} {:<16} {}",
            image.distro, image.arch, image.image_type, image.boot_mode
        );
    }
    Ok(())
}
