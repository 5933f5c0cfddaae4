//! Generate a manifest for every (config, distro, arch, image type)
//! combination and write them to one directory.

use anyhow::{Context, Result, bail};
use clap::Parser;
use crossbeam_channel::{bounded, unbounded};
use glob::Pattern;
use std::fs;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::thread;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use imgforge::config::{BuildConfig, BuildConfigs, RepoRegistry};
use imgforge::imagetype::{self, CatalogImageType, Distro, ImageType};
use imgforge::manifestgen::Generator;
use imgforge::resolver::{DEFAULT_WORKERS, Resolvers};
use imgforge_common::seed::{derive_seed, seed_from_env};

/// Resolver threads per job; jobs already run in parallel.
const RESOLVER_WORKERS_PER_JOB: usize = 2;

#[derive(Parser, Debug)]
#[command(name = "gen-manifests")]
#[command(about = "Generate manifests for every image type and build config", long_about = None)]
struct Cli {
    /// Manifest output directory
    #[arg(short, long, default_value = "test/data/manifests")]
    output: PathBuf,

    /// Number of jobs to run concurrently
    #[arg(short, long, default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Comma-separated distributions (globs supported)
    #[arg(long, value_delimiter = ',')]
    distros: Vec<String>,

    /// Comma-separated architectures (globs supported)
    #[arg(long, value_delimiter = ',')]
    arches: Vec<String>,

    /// Comma-separated image types (globs supported)
    #[arg(long, value_delimiter = ',')]
    images: Vec<String>,

    /// Directory of build configs, with an optional config-list.json
    #[arg(long, value_name = "DIR")]
    configs: Option<PathBuf>,

    /// Directory of `<distro>.json` repository files
    #[arg(long, value_name = "DIR")]
    repos: Option<PathBuf>,

    /// Resolve sources with the deterministic in-process resolvers
    #[arg(long)]
    fake_resolvers: bool,

    /// Skip image types no config applies to (otherwise fail)
    #[arg(long)]
    skip_noconfig: bool,

    /// Skip image types without repositories (otherwise fail)
    #[arg(long)]
    skip_norepos: bool,

    /// Print the jobs instead of running them
    #[arg(long)]
    dry_run: bool,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

struct Job {
    image_type: CatalogImageType,
    config: BuildConfig,
    seed: i64,
    filename: String,
}

impl Job {
    fn label(&self) -> String {
        format!(
            "{},{},{},{}",
            self.image_type.distro().name,
            self.image_type.arch(),
            self.image_type.name(),
            self.config.name
        )
    }
}

/// `<distro>-<arch>-<type>-<config>.json`, with dashes inside each part
/// turned into underscores.
fn manifest_filename(distro: &str, arch: &str, image_type: &str, config: &str) -> String {
    let u = |s: &str| s.replace('-', "_");
    format!("{}-{}-{}-{}.json", u(distro), u(arch), u(image_type), u(config))
}

fn patterns(flag: &str, globs: &[String]) -> Result<Vec<Pattern>> {
    globs
        .iter()
        .map(|g| Pattern::new(g).with_context(|| format!("Invalid --{flag} glob {g:?}")))
        .collect()
}

fn selected(patterns: &[Pattern], values: &[&str]) -> bool {
    patterns.is_empty() || patterns.iter().any(|p| values.iter().any(|v| p.matches(v)))
}

fn warn_unmatched(flag: &str, patterns: &[Pattern], seen: &[&str]) {
    for p in patterns {
        if !seen.iter().any(|v| p.matches(v)) {
            warn!("--{flag} {} matches nothing", p.as_str());
        }
    }
}

fn distro_names(distro: &Distro) -> Vec<&'static str> {
    std::iter::once(distro.name)
        .chain(distro.aliases.iter().copied())
        .collect()
}

fn collect_jobs(cli: &Cli, configs: &BuildConfigs, registry: &RepoRegistry) -> Result<Vec<Job>> {
    let distros = patterns("distros", &cli.distros)?;
    let arches = patterns("arches", &cli.arches)?;
    let images = patterns("images", &cli.images)?;
    let base_seed = seed_from_env()?;

    let catalog = imagetype::all();
    let known_distros: Vec<&str> = catalog
        .iter()
        .flat_map(|it| distro_names(it.distro()))
        .collect();
    let known_arches: Vec<&str> = catalog.iter().map(|it| it.arch().as_str()).collect();
    let known_images: Vec<&str> = catalog.iter().map(|it| it.name()).collect();
    warn_unmatched("distros", &distros, &known_distros);
    warn_unmatched("arches", &arches, &known_arches);
    warn_unmatched("images", &images, &known_images);

    let mut jobs = Vec::new();
    for it in &catalog {
        let distro = it.distro();
        let arch = it.arch().as_str();
        if !selected(&distros, &distro_names(distro))
            || !selected(&arches, &[arch])
            || !selected(&images, &[it.name()])
        {
            continue;
        }

        if registry
            .repos_for_image_type(distro, it.arch(), it.name())
            .is_empty()
        {
            if cli.skip_norepos {
                debug!(distro = distro.name, arch, image_type = it.name(), "no repositories, skipping");
                continue;
            }
            bail!(
                "no repositories defined for {}/{arch}/{}, pass --skip-norepos to skip",
                distro.name,
                it.name()
            );
        }

        let matching = configs.get(distro.name, arch, it.name());
        if matching.is_empty() {
            if cli.skip_noconfig {
                continue;
            }
            bail!(
                "no configs defined for image type {:?} for {}, pass --skip-noconfig to skip",
                it.name(),
                distro.name
            );
        }
        for config in matching {
            jobs.push(Job {
                image_type: *it,
                seed: derive_seed(base_seed, &[&config.name, distro.name, arch]),
                filename: manifest_filename(distro.name, arch, it.name(), &config.name),
                config: config.clone(),
            });
        }
    }
    Ok(jobs)
}

fn run_job(job: &Job, registry: &RepoRegistry, output: &Path) -> Result<()> {
    let distro = job.image_type.distro().name;
    let bytes = Generator::new(distro, &job.image_type, job.config.options.clone())
        .with_registry(registry.clone())
        .with_seed(job.seed)
        .with_resolvers(Resolvers::mock().with_workers(RESOLVER_WORKERS_PER_JOB))
        .generate(&job.config.blueprint())?;
    let path = output.join(&job.filename);
    fs::write(&path, bytes).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run every job on `workers` threads. Returns the failures, each
/// prefixed with the job's file name.
fn run_jobs(jobs: Vec<Job>, workers: usize, registry: &RepoRegistry, output: &Path) -> Vec<String> {
    let workers = workers.max(1);
    let (job_tx, job_rx) = bounded::<Job>(workers * 2);
    let (err_tx, err_rx) = unbounded::<String>();

    thread::scope(|scope| {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let err_tx = err_tx.clone();
            scope.spawn(move || {
                for job in job_rx {
                    info!("Starting job {}", job.filename);
                    let outcome = catch_unwind(AssertUnwindSafe(|| run_job(&job, registry, output)));
                    let failure = match outcome {
                        Ok(Ok(())) => None,
                        Ok(Err(err)) => Some(format!("[{}] failed: {err:#}", job.filename)),
                        Err(payload) => Some(format!(
                            "[{}] failed: panic: {}",
                            job.filename,
                            panic_message(payload.as_ref())
                        )),
                    };
                    match failure {
                        Some(msg) => {
                            info!("Finished job {} [failed]", job.filename);
                            let _ = err_tx.send(msg);
                        }
                        None => info!("Finished job {}", job.filename),
                    }
                }
            });
        }
        drop(err_tx);
        for job in jobs {
            if job_tx.send(job).is_err() {
                break;
            }
        }
        drop(job_tx);
    });

    let mut errors: Vec<String> = err_rx.into_iter().collect();
    errors.sort();
    errors
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    if !cli.fake_resolvers {
        warn!("no network resolvers are available, using the fake resolvers");
    }
    let configs = match &cli.configs {
        Some(dir) => BuildConfigs::load_dir(dir)?,
        None => BuildConfigs::single(BuildConfig {
            name: "empty".to_string(),
            ..Default::default()
        }),
    };
    let registry = match &cli.repos {
        Some(dir) => RepoRegistry::load_dir(dir)?,
        None => RepoRegistry::builtin(),
    };

    eprintln!("Collecting jobs");
    let jobs = collect_jobs(&cli, &configs, &registry)?;
    if cli.dry_run {
        for job in &jobs {
            println!("{}", job.label());
        }
        return Ok(());
    }

    fs::create_dir_all(&cli.output)
        .with_context(|| format!("Failed to create {}", cli.output.display()))?;
    let total = jobs.len();
    eprintln!("Running {total} jobs on {} workers", cli.workers.max(1));
    let errors = run_jobs(jobs, cli.workers, &registry, &cli.output);

    if !errors.is_empty() {
        eprintln!("Encountered {} errors:", errors.len());
        for (i, err) in errors.iter().enumerate() {
            eprintln!("{:3}: {err}", i + 1);
        }
        bail!("{} of {total} manifests failed", errors.len());
    }
    eprintln!("Wrote {total} manifests to {}", cli.output.display());
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(err) = run(cli) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filenames_replace_dashes_per_component() {
        assert_eq!(
            manifest_filename("fedora-42", "x86_64", "iot-raw", "all-customizations"),
            "fedora_42-x86_64-iot_raw-all_customizations.json"
        );
    }

    #[test]
    fn empty_pattern_list_selects_everything() {
        assert!(selected(&[], &["anything"]));
        let p = patterns("distros", &["rhel-*".to_string()]).unwrap();
        assert!(selected(&p, &["fedora-42", "rhel-9.6"]));
        assert!(!selected(&p, &["fedora-42", "fedora"]));
    }

    #[test]
    fn panic_payloads_become_messages() {
        let payload = catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom");
    }
}
