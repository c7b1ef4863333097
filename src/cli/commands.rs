use clap::{Parser, Subcommand, ValueEnum};
use soku_core::core::{BuildService, Manifest, SokuBuildService};
use soku_core::utils::{
    CliOverrides, ConfigLoader, HashAlgorithm, Logger, Result, SokuError, SokuUI,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "soku")]
#[command(about = "Soku - a parallel, incremental JavaScript and CSS bundler")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum HashArg {
    Blake3,
    Sha256,
}

impl From<HashArg> for HashAlgorithm {
    fn from(arg: HashArg) -> Self {
        match arg {
            HashArg::Blake3 => HashAlgorithm::Blake3,
            HashArg::Sha256 => HashAlgorithm::Sha256,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build for production
    Build {
        /// Entry specifiers, relative to the root. Defaults to the config file's entries.
        entries: Vec<String>,
        /// Root directory
        #[arg(short, long, default_value = ".")]
        root: String,
        /// Output directory
        #[arg(short, long)]
        outdir: Option<String>,
        /// Minimum number of roots sharing a module before it gets its own chunk
        #[arg(long)]
        min_reuse: Option<usize>,
        /// Add the minify steps to the default transform chain
        #[arg(long)]
        minify: bool,
        /// Worker threads (default: number of CPUs)
        #[arg(short, long)]
        workers: Option<usize>,
        /// Exclude modules that fail to transform instead of failing the build
        #[arg(long)]
        best_effort: bool,
        /// Persistent transform cache directory
        #[arg(long)]
        cache_dir: Option<String>,
        /// Content hash used for cache keys and filenames
        #[arg(long, value_enum)]
        hash: Option<HashArg>,
    },
    /// Show the manifest of the last build
    Info {
        /// Output directory to inspect
        #[arg(short, long, default_value = "dist")]
        outdir: String,
    },
}

pub struct CliHandler;

impl CliHandler {
    pub fn new() -> Self {
        Self
    }

    pub async fn run(&self) -> Result<()> {
        // Initialize logging
        Logger::init();

        let cli = Cli::parse();

        match cli.command {
            Commands::Build {
                entries,
                root,
                outdir,
                min_reuse,
                minify,
                workers,
                best_effort,
                cache_dir,
                hash,
            } => {
                let overrides = CliOverrides {
                    outdir,
                    min_reuse,
                    minify: minify.then_some(true),
                    workers,
                    best_effort: best_effort.then_some(true),
                    cache_dir,
                    hash_algorithm: hash.map(HashAlgorithm::from),
                };
                self.handle_build_command(&root, &entries, &overrides).await
            }
            Commands::Info { outdir } => self.handle_info_command(&outdir).await,
        }
    }

    async fn handle_build_command(
        &self,
        root: &str,
        entries: &[String],
        overrides: &CliOverrides,
    ) -> Result<()> {
        SokuUI::banner();

        let root = PathBuf::from(root);
        let file_config = ConfigLoader::load_from_file(&root)?;
        let entries = ConfigLoader::entries(file_config.as_ref(), entries);
        let config = ConfigLoader::merge_with_cli(file_config, root, overrides)?;
        let outdir = config.outdir.display().to_string();

        let service = SokuBuildService::new(config)?;
        match service.build(entries).await {
            Ok(result) => {
                SokuUI::show_completion(&outdir, &result);
                Ok(())
            }
            Err(SokuError::Build(failure)) => {
                SokuUI::show_failure(&failure);
                Err(SokuError::Build(failure))
            }
            Err(err) => Err(err),
        }
    }

    async fn handle_info_command(&self, outdir: &str) -> Result<()> {
        SokuUI::banner();

        let path = PathBuf::from(outdir).join(Manifest::FILE_NAME);
        let text = tokio::fs::read_to_string(&path).await.map_err(|e| {
            SokuError::config(format!("no build found at {}: {}", path.display(), e))
        })?;
        let manifest = Manifest::from_json(&text)?;
        SokuUI::show_manifest(&manifest);
        Ok(())
    }
}

impl Default for CliHandler {
    fn default() -> Self {
        Self::new()
    }
}
